//! JSON model input.
//!
//! A model file names the simulation horizon, the initial population of every compartment, the
//! formula parameters and the list of transitions:
//!
//! ```json
//! {
//!   "simulationDuration": 100,
//!   "timeStep": 1.0,
//!   "initialValues": { "S": 999, "I": 1, "R": 0 },
//!   "parameters": { "beta": 0.3 },
//!   "transitions": [
//!     { "from": "S", "to": "I",
//!       "distribution": { "type": "mathExpression", "expression": "beta * S * I / N" } },
//!     { "from": "I", "to": "R", "weight": 1.0,
//!       "distribution": { "type": "gamma", "scale": 2.0, "shape": 3.0 } }
//!   ]
//! }
//! ```
//!
//! Compartments are created in the order of `initialValues` and then reordered by their first
//! appearance in `transitions`, which is also the column order of the results.

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::distribution::{CdfFamily, Distribution, TablePolicy, TransitionTable};
use crate::distribution::{DEFAULT_TAIL_TOLERANCE, MAX_TABLE_LENGTH};
use crate::error::StageflowError;
use crate::log::info;
use crate::model::{Model, MAX_HORIZON};
use crate::HashSet;

fn default_time_step() -> f64 {
    1.0
}

fn default_tolerance() -> f64 {
    DEFAULT_TAIL_TOLERANCE
}

fn default_max_table_length() -> usize {
    MAX_TABLE_LENGTH
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModelInput {
    pub simulation_duration: f64,
    #[serde(default = "default_time_step")]
    pub time_step: f64,
    #[serde(default = "default_tolerance")]
    pub error_tolerance: f64,
    #[serde(default = "default_max_table_length")]
    pub max_table_length: usize,
    #[serde(default)]
    pub strict: bool,
    pub initial_values: IndexMap<String, f64>,
    #[serde(default)]
    pub parameters: IndexMap<String, f64>,
    #[serde(default)]
    pub transitions: Vec<TransitionInput>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransitionInput {
    pub from: String,
    pub to: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub distribution: DistributionInput,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DistributionInput {
    Gamma { scale: f64, shape: f64 },
    Weibull { scale: f64, shape: f64 },
    Exponential { rate: f64 },
    #[serde(rename = "lognormal")]
    LogNormal { meanlog: f64, sdlog: f64 },
    TransitionProb { probabilities: Vec<f64> },
    Constant { rate: f64 },
    MathExpression { expression: String },
}

impl DistributionInput {
    /// # Errors
    ///
    /// Returns `StageflowError::DistributionError` for invalid distribution parameters.
    pub fn build(&self, policy: &TablePolicy) -> Result<Distribution, StageflowError> {
        match self {
            DistributionInput::Gamma { scale, shape } => Distribution::from_family(
                CdfFamily::Gamma {
                    scale: *scale,
                    shape: *shape,
                },
                policy,
            ),
            DistributionInput::Weibull { scale, shape } => Distribution::from_family(
                CdfFamily::Weibull {
                    scale: *scale,
                    shape: *shape,
                },
                policy,
            ),
            DistributionInput::Exponential { rate } => {
                Distribution::from_family(CdfFamily::Exponential { rate: *rate }, policy)
            }
            DistributionInput::LogNormal { meanlog, sdlog } => Distribution::from_family(
                CdfFamily::LogNormal {
                    meanlog: *meanlog,
                    sdlog: *sdlog,
                },
                policy,
            ),
            DistributionInput::TransitionProb { probabilities } => Ok(Distribution::Cdf(
                TransitionTable::from_probabilities(probabilities.clone())?,
            )),
            DistributionInput::Constant { rate } => Distribution::constant(*rate),
            DistributionInput::MathExpression { expression } => {
                Distribution::expression(expression.as_str())
            }
        }
    }
}

impl ModelInput {
    /// # Errors
    ///
    /// Returns `StageflowError::JsonError` if `json` is not a valid model description.
    pub fn from_json_str(json: &str) -> Result<Self, StageflowError> {
        Ok(serde_json::from_str(json)?)
    }

    /// # Errors
    ///
    /// Returns `StageflowError::IoError` if the file cannot be read, or
    /// `StageflowError::JsonError` if it is not a valid model description.
    pub fn from_path(path: &Path) -> Result<Self, StageflowError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Number of iterations including the initial state: `floor(duration / time_step) + 1`.
    ///
    /// # Errors
    ///
    /// Returns `StageflowError::ConfigError` if the duration or time step is invalid or the
    /// horizon exceeds [`MAX_HORIZON`].
    pub fn times_follow_up(&self) -> Result<usize, StageflowError> {
        let steps = (self.simulation_duration / self.time_step).floor();
        #[allow(clippy::cast_precision_loss)]
        let limit = (MAX_HORIZON - 1) as f64;
        if !(steps.is_finite() && (0.0..=limit).contains(&steps)) {
            return Err(StageflowError::ConfigError(format!(
                "simulationDuration / timeStep must be between 0 and {limit}, got {steps}"
            )));
        }
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "steps is a whole number in [0, MAX_HORIZON - 1]"
        )]
        let steps = steps as usize;
        steps.checked_add(1).ok_or_else(|| {
            StageflowError::ConfigError(format!("simulation horizon {steps} overflows"))
        })
    }

    /// # Errors
    ///
    /// Returns `StageflowError::ConfigError` if the tolerance or time step is invalid.
    pub fn table_policy(&self) -> Result<TablePolicy, StageflowError> {
        TablePolicy::new(self.error_tolerance, self.max_table_length, self.time_step)
    }

    /// Checks the input before anything is built.
    ///
    /// # Errors
    ///
    /// Returns `StageflowError::ConfigError` describing the first problem found.
    pub fn validate(&self) -> Result<(), StageflowError> {
        if !(self.simulation_duration.is_finite() && self.simulation_duration >= 0.0) {
            return Err(StageflowError::ConfigError(format!(
                "simulationDuration must be >= 0, got {}",
                self.simulation_duration
            )));
        }
        if !(self.time_step.is_finite() && self.time_step > 0.0) {
            return Err(StageflowError::ConfigError(format!(
                "timeStep must be > 0, got {}",
                self.time_step
            )));
        }
        if !(self.error_tolerance.is_finite() && self.error_tolerance > 0.0) {
            return Err(StageflowError::ConfigError(format!(
                "errorTolerance must be > 0, got {}",
                self.error_tolerance
            )));
        }
        self.times_follow_up()?;

        let mut missing: Vec<&str> = Vec::new();
        for transition in &self.transitions {
            for name in [&transition.from, &transition.to] {
                if !self.initial_values.contains_key(name) && !missing.contains(&name.as_str()) {
                    missing.push(name);
                }
            }
        }
        if !missing.is_empty() {
            return Err(StageflowError::ConfigError(format!(
                "missing initial values for compartments: {}",
                missing.join(", ")
            )));
        }

        let mut seen = HashSet::default();
        for transition in &self.transitions {
            if !(0.0..=1.0).contains(&transition.weight) {
                return Err(StageflowError::ConfigError(format!(
                    "weight {} of transition {} -> {} is outside [0, 1]",
                    transition.weight, transition.from, transition.to
                )));
            }
            if !seen.insert((transition.from.as_str(), transition.to.as_str())) {
                return Err(StageflowError::ConfigError(format!(
                    "transition {} -> {} is defined twice",
                    transition.from, transition.to
                )));
            }
        }

        for name in self.parameters.keys() {
            if self.initial_values.contains_key(name) {
                return Err(StageflowError::ConfigError(format!(
                    "{name} is both a parameter and a compartment"
                )));
            }
        }
        Ok(())
    }

    /// Validates the input and assembles an initialised model.
    ///
    /// # Errors
    ///
    /// Returns the first configuration, distribution or formula error found.
    pub fn build(&self) -> Result<Model, StageflowError> {
        self.validate()?;
        let policy = self.table_policy()?;

        let mut model = Model::new(self.times_follow_up()?)?;
        model.set_time_step(self.time_step)?;
        model.set_strict(self.strict);
        for (name, value) in &self.parameters {
            model.set_parameter(name, *value)?;
        }
        for (name, value) in &self.initial_values {
            model.add_compartment(name, *value)?;
        }
        for transition in &self.transitions {
            let distribution = transition.distribution.build(&policy).map_err(|e| match e {
                StageflowError::DistributionError(message) => StageflowError::DistributionError(
                    format!("transition {} -> {}: {message}", transition.from, transition.to),
                ),
                other => other,
            })?;
            model.add_transition(
                &transition.from,
                &transition.to,
                distribution,
                transition.weight,
            )?;
        }
        model.sort_by_transitions();
        model.initialise()?;
        Ok(model)
    }
}

/// Reads a model file and returns the initialised model.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or built.
pub fn load_model(path: &Path) -> Result<Model, StageflowError> {
    info!("loading model from {}", path.display());
    ModelInput::from_path(path)?.build()
}
