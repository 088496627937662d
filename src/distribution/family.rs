use statrs::distribution::{ContinuousCDF, Exp, Gamma, LogNormal, Weibull};

use crate::distribution::table::{TablePolicy, TransitionTable};
use crate::error::StageflowError;

/// Residence-time distributions with a closed-form CDF.
///
/// Parameters are in calendar time units; the table builder converts them to timesteps through
/// [`TablePolicy::time_step`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CdfFamily {
    Gamma { scale: f64, shape: f64 },
    Weibull { scale: f64, shape: f64 },
    Exponential { rate: f64 },
    LogNormal { meanlog: f64, sdlog: f64 },
}

fn invalid(family: &str, error: impl std::fmt::Display) -> StageflowError {
    StageflowError::DistributionError(format!("{family}: {error}"))
}

fn require_positive(family: &str, name: &str, value: f64) -> Result<(), StageflowError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(family, format!("{name} must be > 0, got {value}")))
    }
}

impl CdfFamily {
    /// Builds the discrete hazard table for this distribution.
    ///
    /// # Errors
    ///
    /// Returns `StageflowError::DistributionError` if the parameters do not describe a valid
    /// distribution.
    pub fn transition_table(&self, policy: &TablePolicy) -> Result<TransitionTable, StageflowError> {
        match *self {
            CdfFamily::Gamma { scale, shape } => {
                require_positive("gamma", "scale", scale)?;
                let gamma = Gamma::new(shape, 1.0 / scale).map_err(|e| invalid("gamma", e))?;
                Ok(TransitionTable::from_cdf(|x| gamma.cdf(x), policy))
            }
            CdfFamily::Weibull { scale, shape } => {
                let weibull = Weibull::new(shape, scale).map_err(|e| invalid("weibull", e))?;
                Ok(TransitionTable::from_cdf(|x| weibull.cdf(x), policy))
            }
            CdfFamily::Exponential { rate } => {
                require_positive("exponential", "rate", rate)?;
                let exponential = Exp::new(rate).map_err(|e| invalid("exponential", e))?;
                Ok(TransitionTable::from_cdf(|x| exponential.cdf(x), policy))
            }
            CdfFamily::LogNormal { meanlog, sdlog } => {
                let lognormal =
                    LogNormal::new(meanlog, sdlog).map_err(|e| invalid("lognormal", e))?;
                Ok(TransitionTable::from_cdf(|x| lognormal.cdf(x), policy))
            }
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            CdfFamily::Gamma { .. } => "gamma",
            CdfFamily::Weibull { .. } => "weibull",
            CdfFamily::Exponential { .. } => "exponential",
            CdfFamily::LogNormal { .. } => "lognormal",
        }
    }
}
