//! A discrete-time compartmental population-flow simulator
//!
//! Stageflow models a population moving through a directed graph of compartments
//! (Susceptible, Exposed, Infectious, Recovered, ...). Each compartment tracks how long its
//! occupants have been in it, so the rate at which they leave can depend on their residence time
//! rather than being memoryless.
//!
//! A simulation is built from:
//! * [`compartment::Compartment`]s, each holding its population split into residence-time
//!   buckets.
//! * Transitions between compartments, each with a weight and a
//!   [`distribution::Distribution`]: a hazard table derived from a continuous CDF, a constant
//!   rate, or a formula evaluated against the current state.
//! * A [`model::Model`] that owns the compartments, steps them through a fixed number of
//!   iterations and collects the population of every compartment at every step.
//!
//! Models are usually described in JSON and loaded through [`config`]; the `stageflow` binary
//! runs a model file and writes the results as CSV through [`report`].
//!
//! Population is conserved: whatever leaves a compartment along an edge arrives at the
//! compartment on the other end during the same iteration. Modeling errors that would break
//! this, such as outflow larger than a compartment's population, are clamped and recorded as
//! [`compartment::Violation`]s, or stop the run when the model is in strict mode.
pub mod compartment;
pub mod config;
pub mod distribution;
pub mod error;
pub mod expression;
pub mod log;
pub mod model;
pub mod numeric;
pub mod report;
pub mod runner;

pub use compartment::{Compartment, CompartmentId, Violation, ViolationKind};
pub use config::{load_model, ModelInput};
pub use distribution::{CdfFamily, Distribution, TablePolicy, TransitionTable};
pub use error::StageflowError;
pub use expression::{EvalexprEvaluator, FormulaEvaluator, Scope};
pub use model::Model;
pub use report::SimulationResults;
pub use runner::{run_with_args, BaseArgs};

// Deterministic hashing keeps repeated runs bit-identical.
pub use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
