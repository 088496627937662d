//! Transition strategies attached to the out-edges of a compartment.
//!
//! A [`Distribution`] turns the residence time of a compartment's occupants into the amount that
//! leaves along one out-edge during a timestep. There are exactly three strategies:
//!
//! * [`Distribution::Cdf`]: a precomputed discrete hazard table indexed by residence time,
//!   built from a continuous CDF ([`CdfFamily`]) or supplied directly.
//! * [`Distribution::Constant`]: the same probability regardless of residence time.
//! * [`Distribution::Expression`]: a formula evaluated against parameters and the populations of
//!   other compartments. Its value is an _amount_, not a probability.
//!
//! A distribution is fixed once the compartment graph is initialised.

mod family;
mod table;

pub use family::CdfFamily;
pub use table::{TablePolicy, TransitionTable, DEFAULT_TAIL_TOLERANCE, MAX_TABLE_LENGTH};

use crate::error::StageflowError;

#[derive(Debug, Clone, PartialEq)]
pub enum Distribution {
    Cdf(TransitionTable),
    Constant { rate: f64 },
    Expression { formula: String },
}

impl Distribution {
    /// Builds a CDF-derived distribution from a named family.
    ///
    /// # Errors
    ///
    /// Returns `StageflowError::DistributionError` for invalid family parameters.
    pub fn from_family(family: CdfFamily, policy: &TablePolicy) -> Result<Self, StageflowError> {
        Ok(Distribution::Cdf(family.transition_table(policy)?))
    }

    /// # Errors
    ///
    /// Returns `StageflowError::DistributionError` unless `rate` is in `[0, 1]`.
    pub fn constant(rate: f64) -> Result<Self, StageflowError> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(StageflowError::DistributionError(format!(
                "constant rate {rate} is outside [0, 1]"
            )));
        }
        Ok(Distribution::Constant { rate })
    }

    /// # Errors
    ///
    /// Returns `StageflowError::DistributionError` if `formula` is blank.
    pub fn expression(formula: impl Into<String>) -> Result<Self, StageflowError> {
        let formula = formula.into();
        if formula.trim().is_empty() {
            return Err(StageflowError::DistributionError(
                "expression is empty".to_string(),
            ));
        }
        Ok(Distribution::Expression { formula })
    }

    /// The conditional probability of leaving after exactly `index` timesteps of residence.
    /// `None` for expression-derived edges, whose outflow does not depend on residence time.
    #[must_use]
    pub fn transition_probability(&self, index: usize) -> Option<f64> {
        match self {
            Distribution::Cdf(table) => Some(table.transition_probability(index)),
            Distribution::Constant { rate } => Some(*rate),
            Distribution::Expression { .. } => None,
        }
    }

    /// The number of residence buckets this distribution needs. Only CDF-derived distributions
    /// constrain it.
    #[must_use]
    pub fn table_length(&self) -> Option<usize> {
        match self {
            Distribution::Cdf(table) => Some(table.len()),
            _ => None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Distribution::Cdf(_) => "cdf",
            Distribution::Constant { .. } => "constant",
            Distribution::Expression { .. } => "expression",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_ignores_residence_time() {
        let distribution = Distribution::constant(0.1).unwrap();
        assert_eq!(distribution.transition_probability(0), Some(0.1));
        assert_eq!(distribution.transition_probability(500), Some(0.1));
        assert_eq!(distribution.table_length(), None);
    }

    #[test]
    fn cdf_uses_its_table() {
        let table = TransitionTable::from_probabilities(vec![0.2, 0.4]).unwrap();
        let distribution = Distribution::Cdf(table);
        assert_eq!(distribution.transition_probability(1), Some(0.4));
        assert_eq!(distribution.transition_probability(2), Some(1.0));
        assert_eq!(distribution.table_length(), Some(2));
        assert_eq!(distribution.kind(), "cdf");
    }

    #[test]
    fn expression_has_no_probability() {
        let distribution = Distribution::expression("beta * I").unwrap();
        assert_eq!(distribution.transition_probability(0), None);
        assert_eq!(distribution.table_length(), None);
        assert!(Distribution::expression("  ").is_err());
    }

    #[test]
    fn constant_rate_must_be_a_probability() {
        assert!(Distribution::constant(1.2).is_err());
        assert!(Distribution::constant(-0.1).is_err());
        assert!(Distribution::constant(f64::NAN).is_err());
    }

    #[test]
    fn from_family_builds_a_table() {
        let distribution =
            Distribution::from_family(CdfFamily::Exponential { rate: 1.0 }, &TablePolicy::default())
                .unwrap();
        assert!(distribution.table_length().unwrap() > 1);
    }
}
