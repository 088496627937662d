//! Discrete hazard tables derived from continuous cumulative distribution functions.
//!
//! For a residence-time CDF `F`, the probability that an occupant who has spent exactly `i`
//! timesteps in a compartment leaves during the next step, given that it has not left yet, is
//! the discrete hazard
//!
//! ```text
//! h(i) = (F(i + 1) - F(i)) / (1 - F(i))
//! ```
//!
//! The table is truncated at the first index `L` where the survival `1 - F(L)` falls below
//! [`TablePolicy::tolerance`], or at [`TablePolicy::max_length`] for heavy tails. Lookups past
//! the end of the table return 1.0: nobody stays longer than the table's horizon.

use crate::error::StageflowError;

/// Survival below which an index is treated as fully depleted.
pub const DEFAULT_TAIL_TOLERANCE: f64 = 1e-6;

/// Hard cap on the number of residence buckets a single table may require.
pub const MAX_TABLE_LENGTH: usize = 10_000;

// Survival this small makes the hazard quotient meaningless.
const SURVIVAL_FLOOR: f64 = 1e-12;

/// Policy constants used when a CDF is turned into a hazard table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TablePolicy {
    /// The table ends once `1 - F(i)` drops below this value.
    pub tolerance: f64,
    /// Maximum table length regardless of the tail.
    pub max_length: usize,
    /// Calendar length of one timestep. The CDF is evaluated at `i * time_step`.
    pub time_step: f64,
}

impl Default for TablePolicy {
    fn default() -> Self {
        TablePolicy {
            tolerance: DEFAULT_TAIL_TOLERANCE,
            max_length: MAX_TABLE_LENGTH,
            time_step: 1.0,
        }
    }
}

impl TablePolicy {
    /// # Errors
    ///
    /// Returns `StageflowError::ConfigError` unless `tolerance` and `time_step` are finite and
    /// positive and `max_length` is at least 1.
    pub fn new(tolerance: f64, max_length: usize, time_step: f64) -> Result<Self, StageflowError> {
        if !(tolerance.is_finite() && tolerance > 0.0) {
            return Err(StageflowError::ConfigError(format!(
                "tail tolerance must be > 0, got {tolerance}"
            )));
        }
        if !(time_step.is_finite() && time_step > 0.0) {
            return Err(StageflowError::ConfigError(format!(
                "time step must be > 0, got {time_step}"
            )));
        }
        if max_length == 0 {
            return Err(StageflowError::ConfigError(
                "maximum table length must be at least 1".to_string(),
            ));
        }
        Ok(TablePolicy {
            tolerance,
            max_length,
            time_step,
        })
    }
}

/// A precomputed sequence of per-residence-index transition probabilities.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionTable {
    transition_prob: Vec<f64>,
}

impl TransitionTable {
    /// Builds the hazard table of `cdf`.
    ///
    /// `cdf` is expected to be non-decreasing with values in `[0, 1]`. A distribution that is
    /// already exhausted at time zero yields the single entry `[1.0]`.
    pub fn from_cdf(cdf: impl Fn(f64) -> f64, policy: &TablePolicy) -> Self {
        let mut transition_prob = Vec::new();
        let mut lower = cdf(0.0);
        while transition_prob.len() < policy.max_length {
            let survival = 1.0 - lower;
            if survival < policy.tolerance {
                break;
            }
            #[allow(clippy::cast_precision_loss)]
            let upper = cdf((transition_prob.len() + 1) as f64 * policy.time_step);
            let hazard = if survival < SURVIVAL_FLOOR {
                1.0
            } else {
                ((upper - lower) / survival).clamp(0.0, 1.0)
            };
            transition_prob.push(hazard);
            lower = upper;
        }
        if transition_prob.is_empty() {
            transition_prob.push(1.0);
        }
        TransitionTable { transition_prob }
    }

    /// Uses `probabilities` as the hazard table directly.
    ///
    /// # Errors
    ///
    /// Returns `StageflowError::DistributionError` if the table is empty or an entry is not a
    /// probability.
    pub fn from_probabilities(probabilities: Vec<f64>) -> Result<Self, StageflowError> {
        if probabilities.is_empty() {
            return Err(StageflowError::DistributionError(
                "transition probability table is empty".to_string(),
            ));
        }
        if let Some((index, value)) = probabilities
            .iter()
            .enumerate()
            .find(|(_, p)| !(0.0..=1.0).contains(*p))
        {
            return Err(StageflowError::DistributionError(format!(
                "transition probability {value} at index {index} is outside [0, 1]"
            )));
        }
        Ok(TransitionTable {
            transition_prob: probabilities,
        })
    }

    /// The probability of leaving after exactly `index` timesteps of residence. Indices at or
    /// past the end of the table return 1.0.
    #[must_use]
    pub fn transition_probability(&self, index: usize) -> f64 {
        self.transition_prob.get(index).copied().unwrap_or(1.0)
    }

    /// Number of residence buckets the table covers (`L`).
    #[must_use]
    pub fn len(&self) -> usize {
        self.transition_prob.len()
    }

    /// Always false; a table holds at least one entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transition_prob.is_empty()
    }

    #[must_use]
    pub fn probabilities(&self) -> &[f64] {
        &self.transition_prob
    }
}
