//! The model owns every compartment and drives the simulation.
//!
//! Compartments live in an arena (`Vec<Compartment>`) and refer to each other through
//! [`CompartmentId`] handles, so the graph can contain feedback loops (S → I → R → S) without
//! ownership cycles.
//!
//! A run is a fixed number of iterations, `times_follow_up`, set when the model is created.
//! Iteration 0 is the initial state; [`Model::run`] updates iterations `1..times_follow_up`.
//!
//! Within one iteration, a compartment's outflow depends only on its own buckets and on the
//! populations of other compartments at the end of the previous iteration. Upstream outflow is
//! computed on demand before a downstream compartment consumes it, so the order in which
//! compartments are updated does not change the result.

use std::time::Instant;

use indexmap::IndexMap;

use crate::compartment::{Compartment, CompartmentId, Violation};
use crate::distribution::Distribution;
use crate::error::StageflowError;
use crate::expression::{EvalexprEvaluator, FormulaEvaluator, Scope};
use crate::log::{debug, info};
use crate::report::SimulationResults;
use crate::HashMap;

/// Largest number of iterations a model may run, the initial state included. Every out-edge keeps
/// one outflow total per iteration.
pub const MAX_HORIZON: usize = 1_000_000;

pub struct Model {
    compartments: Vec<Compartment>,
    index: HashMap<String, CompartmentId>,
    // Update and output order
    order: Vec<CompartmentId>,
    transitions: Vec<(CompartmentId, CompartmentId)>,
    parameters: IndexMap<String, f64>,
    evaluator: Box<dyn FormulaEvaluator>,
    times_follow_up: usize,
    time_step: f64,
    strict: bool,
    initialised: bool,
    last_iteration: usize,
}

impl Model {
    /// Creates an empty model that will run for `times_follow_up` iterations, including the
    /// initial state.
    ///
    /// # Errors
    ///
    /// Returns `StageflowError::ConfigError` if `times_follow_up` is zero or above
    /// [`MAX_HORIZON`].
    pub fn new(times_follow_up: usize) -> Result<Self, StageflowError> {
        if !(1..=MAX_HORIZON).contains(&times_follow_up) {
            return Err(StageflowError::ConfigError(format!(
                "simulation horizon must be between 1 and {MAX_HORIZON}, got {times_follow_up}"
            )));
        }
        Ok(Model {
            compartments: Vec::new(),
            index: HashMap::default(),
            order: Vec::new(),
            transitions: Vec::new(),
            parameters: IndexMap::new(),
            evaluator: Box::new(EvalexprEvaluator::new()),
            times_follow_up,
            time_step: 1.0,
            strict: false,
            initialised: false,
            last_iteration: 0,
        })
    }

    fn ensure_assembling(&self) -> Result<(), StageflowError> {
        if self.initialised {
            return Err(StageflowError::ConfigError(
                "the model is initialised; the graph can no longer change".to_string(),
            ));
        }
        Ok(())
    }

    /// Replaces the formula evaluator used by expression-derived edges.
    pub fn set_evaluator(&mut self, evaluator: Box<dyn FormulaEvaluator>) {
        self.evaluator = evaluator;
    }

    /// Sets the calendar length of one iteration, used for the `t` variable and result times.
    /// It must equal the `time_step` of the [`crate::distribution::TablePolicy`] the CDF tables
    /// were built with, or hazards and reported times will disagree.
    ///
    /// # Errors
    ///
    /// Returns `StageflowError::ConfigError` unless `time_step` is finite and positive, or if
    /// the model is initialised.
    pub fn set_time_step(&mut self, time_step: f64) -> Result<(), StageflowError> {
        self.ensure_assembling()?;
        if !(time_step.is_finite() && time_step > 0.0) {
            return Err(StageflowError::ConfigError(format!(
                "time step must be > 0, got {time_step}"
            )));
        }
        self.time_step = time_step;
        Ok(())
    }

    /// In strict mode the first modeling violation stops the run with
    /// `StageflowError::NumericError` instead of being clamped and recorded.
    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    /// # Errors
    ///
    /// Returns `StageflowError::ConfigError` if the value is not finite, a compartment has the
    /// same name, or the model is initialised.
    pub fn set_parameter(&mut self, name: &str, value: f64) -> Result<(), StageflowError> {
        self.ensure_assembling()?;
        if self.index.contains_key(name) {
            return Err(StageflowError::ConfigError(format!(
                "{name} is both a parameter and a compartment"
            )));
        }
        if !value.is_finite() {
            return Err(StageflowError::ConfigError(format!(
                "parameter {name} has invalid value {value}"
            )));
        }
        self.parameters.insert(name.to_string(), value);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `StageflowError::ConfigError` if the name is taken by another compartment or a
    /// parameter, or the compartment is invalid.
    pub fn add_compartment(
        &mut self,
        name: &str,
        initial_value: f64,
    ) -> Result<CompartmentId, StageflowError> {
        self.ensure_assembling()?;
        if self.index.contains_key(name) {
            return Err(StageflowError::ConfigError(format!(
                "compartment {name} is defined twice"
            )));
        }
        if self.parameters.contains_key(name) {
            return Err(StageflowError::ConfigError(format!(
                "{name} is both a parameter and a compartment"
            )));
        }
        let compartment = Compartment::new(name, initial_value)?;
        let id = CompartmentId(self.compartments.len());
        self.compartments.push(compartment);
        self.index.insert(name.to_string(), id);
        self.order.push(id);
        Ok(id)
    }

    fn lookup(&self, name: &str) -> Result<CompartmentId, StageflowError> {
        self.compartment_id(name).ok_or_else(|| {
            StageflowError::ConfigError(format!("compartment {name} does not exist"))
        })
    }

    /// Adds an out-edge `from → to` and registers `from` as upstream of `to`.
    ///
    /// # Errors
    ///
    /// Returns `StageflowError::ConfigError` if either compartment is unknown, the edge links a
    /// compartment to itself, already exists, or has an invalid weight.
    pub fn add_transition(
        &mut self,
        from: &str,
        to: &str,
        distribution: Distribution,
        weight: f64,
    ) -> Result<(), StageflowError> {
        self.ensure_assembling()?;
        let from_id = self.lookup(from)?;
        let to_id = self.lookup(to)?;
        if from_id == to_id {
            return Err(StageflowError::ConfigError(format!(
                "cannot link compartment {from} to itself"
            )));
        }
        if !(0.0..=1.0).contains(&weight) {
            return Err(StageflowError::ConfigError(format!(
                "weight {weight} of transition {from} -> {to} is outside [0, 1]"
            )));
        }
        let source = &mut self.compartments[from_id.0];
        if source.is_out_comp_added(to) {
            return Err(StageflowError::ConfigError(format!(
                "transition {from} -> {to} is defined twice"
            )));
        }
        source.add_out_compartment(to_id)?;
        source.add_out_compartment_name(to)?;
        source.add_out_distribution(distribution)?;
        source.add_out_weight(weight)?;
        self.compartments[to_id.0].add_in_compartment(from_id);
        self.transitions.push((from_id, to_id));
        Ok(())
    }

    /// Replaces the distribution of the transition `from → to` before the run starts.
    ///
    /// # Errors
    ///
    /// Returns `StageflowError::ConfigError` if there is no such transition or the model is
    /// initialised.
    pub fn edit_out_distribution(
        &mut self,
        from: &str,
        to: &str,
        distribution: Distribution,
    ) -> Result<(), StageflowError> {
        self.ensure_assembling()?;
        let from_id = self.lookup(from)?;
        self.compartments[from_id.0].edit_out_distribution(to, distribution)
    }

    /// Orders compartments by their first appearance in the transitions, source before target.
    /// Compartments without transitions keep their insertion order at the end.
    pub fn sort_by_transitions(&mut self) {
        let mut order = Vec::with_capacity(self.compartments.len());
        let mut seen = vec![false; self.compartments.len()];
        let linked = self
            .transitions
            .iter()
            .flat_map(|(from, to)| [*from, *to]);
        for id in linked.chain((0..self.compartments.len()).map(CompartmentId)) {
            if !seen[id.0] {
                seen[id.0] = true;
                order.push(id);
            }
        }
        self.order = order;
    }

    /// Sizes every compartment and checks every formula against the names in scope. Must be
    /// called once, after the graph is assembled and before the first update.
    ///
    /// # Errors
    ///
    /// Returns `StageflowError::ConfigError` for an invalid graph and
    /// `StageflowError::EvaluationError` for a formula that can never be evaluated.
    pub fn initialise(&mut self) -> Result<(), StageflowError> {
        self.ensure_assembling()?;
        for compartment in &mut self.compartments {
            compartment.set_length_sub_compartment()?;
            compartment.set_out_values(self.times_follow_up)?;
        }

        let names: Vec<&str> = self
            .parameters
            .keys()
            .map(String::as_str)
            .chain(self.compartments.iter().map(Compartment::name))
            .collect();
        for compartment in &self.compartments {
            for distribution in compartment.out_distributions() {
                if let Distribution::Expression { formula } = distribution {
                    self.evaluator.validate(formula, &names)?;
                }
            }
        }

        self.initialised = true;
        info!(
            "initialised {} compartments, {} transitions, {} iterations",
            self.compartments.len(),
            self.transitions.len(),
            self.times_follow_up
        );
        Ok(())
    }

    // Compartment populations at the end of `iter - 1`, by name.
    fn previous_values(&self, iter: usize) -> Result<HashMap<String, f64>, StageflowError> {
        self.compartments
            .iter()
            .map(|compartment| {
                compartment
                    .total_history()
                    .get(iter - 1)
                    .map(|value| (compartment.name().to_string(), *value))
                    .ok_or_else(|| {
                        StageflowError::StageflowError(format!(
                            "compartment {} has not completed iteration {}",
                            compartment.name(),
                            iter - 1
                        ))
                    })
            })
            .collect()
    }

    fn check_iteration(&self, iter: usize) -> Result<(), StageflowError> {
        if !self.initialised {
            return Err(StageflowError::ConfigError(
                "the model must be initialised before it is updated".to_string(),
            ));
        }
        if iter == 0 || iter >= self.times_follow_up {
            return Err(StageflowError::StageflowError(format!(
                "iteration {iter} is outside the simulation horizon 1..{}",
                self.times_follow_up
            )));
        }
        Ok(())
    }

    /// Updates every compartment for iteration `iter`.
    ///
    /// # Errors
    ///
    /// Returns an error if `iter` is out of sequence, a formula fails, or, in strict mode, a
    /// modeling violation occurs.
    pub fn update(&mut self, iter: usize) -> Result<(), StageflowError> {
        self.check_iteration(iter)?;
        let values = self.previous_values(iter)?;
        for position in 0..self.order.len() {
            let id = self.order[position];
            self.update_with(id, iter, &values)?;
        }
        self.last_iteration = iter;
        debug!("completed iteration {iter}");
        Ok(())
    }

    /// Updates a single compartment for iteration `iter`. Upstream compartments have their
    /// outflow for `iter` computed first if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if `iter` is out of sequence for this compartment, a formula fails, or,
    /// in strict mode, a modeling violation occurs.
    pub fn update_compartment(&mut self, id: CompartmentId, iter: usize) -> Result<(), StageflowError> {
        self.check_iteration(iter)?;
        if id.0 >= self.compartments.len() {
            return Err(StageflowError::StageflowError(format!(
                "no compartment with id {id}"
            )));
        }
        let values = self.previous_values(iter)?;
        self.update_with(id, iter, &values)?;
        if self
            .compartments
            .iter()
            .all(|compartment| compartment.total_history().len() > iter)
        {
            self.last_iteration = iter;
        }
        Ok(())
    }

    fn update_with(
        &mut self,
        id: CompartmentId,
        iter: usize,
        values: &HashMap<String, f64>,
    ) -> Result<(), StageflowError> {
        let Model {
            compartments,
            parameters,
            evaluator,
            time_step,
            strict,
            ..
        } = self;
        #[allow(clippy::cast_precision_loss)]
        let scope = Scope {
            parameters: &*parameters,
            compartments: values,
            step: iter,
            time: iter as f64 * *time_step,
        };

        let evaluator: &dyn FormulaEvaluator = &**evaluator;
        let upstream = compartments[id.0].in_compartments().to_vec();
        let mut inflow = 0.0;
        for source in upstream {
            compute_outflows(compartments, source, iter, &scope, evaluator, *strict)?;
            inflow += compartments[source.0].outflow_to(id, iter);
        }
        compute_outflows(compartments, id, iter, &scope, evaluator, *strict)?;

        let compartment = &mut compartments[id.0];
        let before = compartment.violations().len();
        compartment.advance(iter, inflow)?;
        check_strict(compartment, before, *strict)
    }

    /// Runs iterations `1..times_follow_up`, initialising the model first if needed.
    ///
    /// # Errors
    ///
    /// Returns the first error of any iteration; the results up to it remain readable.
    pub fn run(&mut self) -> Result<(), StageflowError> {
        if !self.initialised {
            self.initialise()?;
        }
        info!("simulating {} iterations", self.times_follow_up - 1);
        let start = Instant::now();
        for iter in (self.last_iteration + 1)..self.times_follow_up {
            self.update(iter)?;
        }
        info!(
            "simulation completed, elapsed time: {:.4} seconds",
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }

    // Getters

    #[must_use]
    pub fn compartment_id(&self, name: &str) -> Option<CompartmentId> {
        self.index.get(name).copied()
    }

    #[must_use]
    pub fn compartment(&self, id: CompartmentId) -> Option<&Compartment> {
        self.compartments.get(id.0)
    }

    #[must_use]
    pub fn compartment_by_name(&self, name: &str) -> Option<&Compartment> {
        self.compartment_id(name)
            .and_then(|id| self.compartment(id))
    }

    /// Compartments in update and output order.
    pub fn compartments(&self) -> impl Iterator<Item = &Compartment> {
        self.order.iter().map(|id| &self.compartments[id.0])
    }

    #[must_use]
    pub fn parameters(&self) -> &IndexMap<String, f64> {
        &self.parameters
    }

    #[must_use]
    pub fn times_follow_up(&self) -> usize {
        self.times_follow_up
    }

    #[must_use]
    pub fn time_step(&self) -> f64 {
        self.time_step
    }

    #[must_use]
    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    /// Every violation recorded so far, in compartment order.
    pub fn violations(&self) -> impl Iterator<Item = &Violation> {
        self.compartments()
            .flat_map(|compartment| compartment.violations().iter())
    }

    /// The total population of every compartment at each completed iteration.
    #[must_use]
    pub fn results(&self) -> SimulationResults {
        let completed = self
            .compartments
            .iter()
            .map(|compartment| compartment.total_history().len())
            .min()
            .unwrap_or(0);
        #[allow(clippy::cast_precision_loss)]
        let time = (0..completed)
            .map(|iter| iter as f64 * self.time_step)
            .collect();
        let series = self
            .compartments()
            .map(|compartment| {
                (
                    compartment.name().to_string(),
                    compartment.total_history()[..completed].to_vec(),
                )
            })
            .collect();
        SimulationResults { time, series }
    }
}

fn compute_outflows(
    compartments: &mut [Compartment],
    id: CompartmentId,
    iter: usize,
    scope: &Scope,
    evaluator: &dyn FormulaEvaluator,
    strict: bool,
) -> Result<(), StageflowError> {
    let compartment = &mut compartments[id.0];
    let before = compartment.violations().len();
    compartment.compute_outflows(iter, scope, evaluator)?;
    check_strict(compartment, before, strict)
}

fn check_strict(compartment: &Compartment, before: usize, strict: bool) -> Result<(), StageflowError> {
    match compartment.violations().get(before) {
        Some(violation) if strict => Err(StageflowError::NumericError(violation.to_string())),
        _ => Ok(()),
    }
}
