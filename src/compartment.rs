//! A compartment holds the part of the population currently in one stage, bucketed by how long
//! each occupant has been there.
//!
//! `sub_compartments[i]` is the population that entered `i` timesteps ago. The number of buckets
//! `L` is the longest transition table among the compartment's out-edges and is fixed by
//! [`Compartment::set_length_sub_compartment`]. Occupants of the last bucket stay there until
//! they leave.
//!
//! Compartments never own each other. Links are [`CompartmentId`] handles into the arena owned
//! by [`crate::model::Model`].
//!
//! An out-edge is described by four index-aligned collections (downstream id, downstream name,
//! distribution, weight) that are appended one call at a time during assembly. Position `e` in
//! each collection describes the same edge.
//!
//! Each iteration runs in two steps:
//! 1. [`Compartment::compute_outflows`] reads only this compartment's buckets, as they stood at
//!    the end of the previous iteration, and fills the per-edge outflow buffers.
//! 2. [`Compartment::advance`] subtracts the outflow, ages the remaining population by one
//!    bucket, adds the inflow into bucket zero and records the new total.

use std::fmt::{self, Display};

use crate::distribution::Distribution;
use crate::error::StageflowError;
use crate::expression::{FormulaEvaluator, Scope};
use crate::log::{trace, warn};
use crate::numeric::{exceeds, NEGATIVE_TOLERANCE};

/// A handle to a compartment in the model's arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompartmentId(pub(crate) usize);

impl CompartmentId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl Display for CompartmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ViolationKind {
    /// The edges of a bucket asked for more population than it held.
    OutflowExceedsPopulation,
    /// A bucket went negative after outflow was subtracted.
    NegativePopulation,
    /// An expression-derived edge evaluated to a negative amount.
    NegativeExpressionOutflow,
}

/// A modeling error found while iterating. The engine clamps the offending value and keeps a
/// record of what it clamped.
#[derive(Clone, Debug, PartialEq)]
pub struct Violation {
    pub iteration: usize,
    pub compartment: String,
    /// Residence bucket, when the violation is local to one.
    pub bucket: Option<usize>,
    pub kind: ViolationKind,
    /// How far past the valid range the value was.
    pub magnitude: f64,
}

impl Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            ViolationKind::OutflowExceedsPopulation => "outflow exceeds population",
            ViolationKind::NegativePopulation => "negative population",
            ViolationKind::NegativeExpressionOutflow => "negative expression outflow",
        };
        write!(
            f,
            "{what} in compartment {} at iteration {}",
            self.compartment, self.iteration
        )?;
        if let Some(bucket) = self.bucket {
            write!(f, ", bucket {bucket}")?;
        }
        write!(f, " (by {:e})", self.magnitude)
    }
}

pub struct Compartment {
    name: String,
    initial_value: f64,

    sub_compartments: Vec<f64>,
    total_history: Vec<f64>,

    in_compartments: Vec<CompartmentId>,

    out_compartments: Vec<CompartmentId>,
    out_compartment_names: Vec<String>,
    out_distributions: Vec<Distribution>,
    out_weights: Vec<f64>,

    // Per edge, per bucket outflow of the current iteration
    out_sub_compartments: Vec<Vec<f64>>,
    // Per edge, per iteration outflow totals
    out_totals: Vec<Vec<f64>>,

    length_set: bool,
    horizon: Option<usize>,
    computed_iteration: Option<usize>,
    violations: Vec<Violation>,
}

impl Compartment {
    /// Creates a compartment whose whole initial population has just entered.
    ///
    /// # Errors
    ///
    /// Returns `StageflowError::ConfigError` if the name is blank or the population is negative
    /// or not finite.
    pub fn new(name: impl Into<String>, initial_value: f64) -> Result<Self, StageflowError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(StageflowError::ConfigError(
                "compartment name is empty".to_string(),
            ));
        }
        if !(initial_value.is_finite() && initial_value >= 0.0) {
            return Err(StageflowError::ConfigError(format!(
                "compartment {name} has invalid initial population {initial_value}"
            )));
        }
        Ok(Compartment {
            name,
            initial_value,
            sub_compartments: vec![initial_value],
            total_history: Vec::new(),
            in_compartments: Vec::new(),
            out_compartments: Vec::new(),
            out_compartment_names: Vec::new(),
            out_distributions: Vec::new(),
            out_weights: Vec::new(),
            out_sub_compartments: Vec::new(),
            out_totals: Vec::new(),
            length_set: false,
            horizon: None,
            computed_iteration: None,
            violations: Vec::new(),
        })
    }

    // Getters

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn initial_value(&self) -> f64 {
        self.initial_value
    }

    /// Population per residence bucket.
    #[must_use]
    pub fn sub_compartment_values(&self) -> &[f64] {
        &self.sub_compartments
    }

    /// Number of residence buckets (`L`).
    #[must_use]
    pub fn length(&self) -> usize {
        self.sub_compartments.len()
    }

    /// Total population at the end of each completed iteration, starting with the initial state.
    #[must_use]
    pub fn total_history(&self) -> &[f64] {
        &self.total_history
    }

    #[must_use]
    pub fn in_compartments(&self) -> &[CompartmentId] {
        &self.in_compartments
    }

    #[must_use]
    pub fn out_compartments(&self) -> &[CompartmentId] {
        &self.out_compartments
    }

    #[must_use]
    pub fn out_compartment_names(&self) -> &[String] {
        &self.out_compartment_names
    }

    #[must_use]
    pub fn out_distributions(&self) -> &[Distribution] {
        &self.out_distributions
    }

    #[must_use]
    pub fn out_weights(&self) -> &[f64] {
        &self.out_weights
    }

    /// Outflow per out-edge and iteration.
    #[must_use]
    pub fn out_values(&self) -> &[Vec<f64>] {
        &self.out_totals
    }

    /// Outflow per out-edge and residence bucket for the most recently computed iteration.
    #[must_use]
    pub fn out_sub_compartments(&self) -> &[Vec<f64>] {
        &self.out_sub_compartments
    }

    #[must_use]
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// The iteration whose outflow was most recently computed.
    #[must_use]
    pub fn computed_iteration(&self) -> Option<usize> {
        self.computed_iteration
    }

    // Graph assembly

    fn ensure_assembling(&self) -> Result<(), StageflowError> {
        if self.length_set {
            return Err(StageflowError::ConfigError(format!(
                "compartment {} is already initialised; its edges can no longer change",
                self.name
            )));
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `StageflowError::ConfigError` once the compartment has been initialised.
    pub fn add_out_compartment(&mut self, linked: CompartmentId) -> Result<(), StageflowError> {
        self.ensure_assembling()?;
        self.out_compartments.push(linked);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `StageflowError::ConfigError` if an out-edge to `name` already exists or the
    /// compartment has been initialised.
    pub fn add_out_compartment_name(&mut self, name: &str) -> Result<(), StageflowError> {
        self.ensure_assembling()?;
        if self.is_out_comp_added(name) {
            return Err(StageflowError::ConfigError(format!(
                "compartment {} already has an out-edge to {name}",
                self.name
            )));
        }
        self.out_compartment_names.push(name.to_string());
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `StageflowError::ConfigError` once the compartment has been initialised.
    pub fn add_out_distribution(&mut self, distribution: Distribution) -> Result<(), StageflowError> {
        self.ensure_assembling()?;
        self.out_distributions.push(distribution);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `StageflowError::ConfigError` if `weight` is outside `[0, 1]` or the compartment
    /// has been initialised.
    pub fn add_out_weight(&mut self, weight: f64) -> Result<(), StageflowError> {
        self.ensure_assembling()?;
        if !(0.0..=1.0).contains(&weight) {
            return Err(StageflowError::ConfigError(format!(
                "out-edge weight {weight} of compartment {} is outside [0, 1]",
                self.name
            )));
        }
        self.out_weights.push(weight);
        Ok(())
    }

    /// Registers an upstream compartment. Inflow from it always lands in bucket zero; the
    /// distribution and weight live on the upstream compartment's out-edge.
    pub fn add_in_compartment(&mut self, linked: CompartmentId) {
        if !self.in_compartments.contains(&linked) {
            self.in_compartments.push(linked);
        }
    }

    /// Replaces the distribution on the out-edge to `out_name`. Only possible while the graph is
    /// being assembled.
    ///
    /// # Errors
    ///
    /// Returns `StageflowError::ConfigError` if there is no such edge or the compartment has
    /// been initialised.
    pub fn edit_out_distribution(
        &mut self,
        out_name: &str,
        distribution: Distribution,
    ) -> Result<(), StageflowError> {
        self.ensure_assembling()?;
        let position = self.find_out_comp_position(out_name).ok_or_else(|| {
            StageflowError::ConfigError(format!(
                "compartment {} has no out-edge to {out_name}",
                self.name
            ))
        })?;
        let slot = self.out_distributions.get_mut(position).ok_or_else(|| {
            StageflowError::ConfigError(format!(
                "compartment {} has no distribution for its out-edge to {out_name}",
                self.name
            ))
        })?;
        *slot = distribution;
        Ok(())
    }

    #[must_use]
    pub fn is_out_comp_added(&self, name: &str) -> bool {
        self.find_out_comp_position(name).is_some()
    }

    #[must_use]
    pub fn find_out_comp_position(&self, name: &str) -> Option<usize> {
        self.out_compartment_names.iter().position(|n| n == name)
    }

    /// Fixes `L` to the longest CDF table among the out-edges (1 when there is none) and puts
    /// the initial population in bucket zero. Call once, after every out-edge is attached.
    ///
    /// # Errors
    ///
    /// Returns `StageflowError::ConfigError` if called twice or if the out-edge collections are
    /// not index-aligned.
    pub fn set_length_sub_compartment(&mut self) -> Result<(), StageflowError> {
        self.ensure_assembling()?;
        let edges = self.out_compartments.len();
        if self.out_compartment_names.len() != edges
            || self.out_distributions.len() != edges
            || self.out_weights.len() != edges
        {
            return Err(StageflowError::ConfigError(format!(
                "compartment {} has mismatched out-edge data: {} links, {} names, {} \
                 distributions, {} weights",
                self.name,
                edges,
                self.out_compartment_names.len(),
                self.out_distributions.len(),
                self.out_weights.len()
            )));
        }

        let length = self
            .out_distributions
            .iter()
            .filter_map(Distribution::table_length)
            .max()
            .unwrap_or(1);
        self.sub_compartments = vec![0.0; length];
        self.sub_compartments[0] = self.initial_value;

        let index_driven_weight: f64 = self
            .out_distributions
            .iter()
            .zip(&self.out_weights)
            .filter(|(distribution, _)| distribution.transition_probability(0).is_some())
            .map(|(_, weight)| weight)
            .sum();
        if exceeds(index_driven_weight, 1.0) {
            warn!(
                "compartment {}: out-edge weights sum to {index_driven_weight}; outflow will be \
                 clamped to the available population",
                self.name
            );
        }

        self.length_set = true;
        Ok(())
    }

    /// Sizes the outflow buffers for a run of `horizon` iterations (iteration 0 being the
    /// initial state) and records the initial total.
    ///
    /// # Errors
    ///
    /// Returns `StageflowError::ConfigError` if `set_length_sub_compartment` has not been called,
    /// if this is called twice, or if `horizon` is zero.
    pub fn set_out_values(&mut self, horizon: usize) -> Result<(), StageflowError> {
        if !self.length_set {
            return Err(StageflowError::ConfigError(format!(
                "compartment {}: buckets must be sized before the outflow buffers",
                self.name
            )));
        }
        if self.horizon.is_some() {
            return Err(StageflowError::ConfigError(format!(
                "compartment {}: outflow buffers are already sized",
                self.name
            )));
        }
        if horizon == 0 {
            return Err(StageflowError::ConfigError(
                "simulation horizon must be at least 1".to_string(),
            ));
        }
        let edges = self.out_compartments.len();
        let length = self.length();
        self.out_sub_compartments = vec![vec![0.0; length]; edges];
        self.out_totals = vec![vec![0.0; horizon]; edges];
        self.total_history = Vec::with_capacity(horizon);
        self.total_history.push(self.sub_compartments.iter().sum());
        self.horizon = Some(horizon);
        Ok(())
    }

    // Iteration

    fn check_iteration(&self, iter: usize) -> Result<(), StageflowError> {
        let horizon = self.horizon.ok_or_else(|| {
            StageflowError::ConfigError(format!(
                "compartment {} is not initialised",
                self.name
            ))
        })?;
        if iter == 0 || iter >= horizon {
            return Err(StageflowError::StageflowError(format!(
                "iteration {iter} is outside the simulation horizon 1..{horizon}"
            )));
        }
        if self.total_history.len() != iter {
            return Err(StageflowError::StageflowError(format!(
                "compartment {} expected iteration {} but got {iter}",
                self.name,
                self.total_history.len()
            )));
        }
        Ok(())
    }

    fn record(&mut self, violation: Violation) {
        warn!("{violation}");
        self.violations.push(violation);
    }

    /// Computes how much leaves along each out-edge during `iter`, from every residence bucket.
    ///
    /// Reads only this compartment's buckets and, for expression-derived edges, `scope`, whose
    /// compartment values must be those at the end of `iter - 1`. Calling it again for the same
    /// iteration does nothing.
    ///
    /// Expression-derived outflow is evaluated once per edge, scaled by the edge weight, and
    /// split across buckets in proportion to each bucket's share of the population.
    ///
    /// # Errors
    ///
    /// Returns an error if `iter` is out of sequence or a formula fails to evaluate.
    pub fn compute_outflows(
        &mut self,
        iter: usize,
        scope: &Scope,
        evaluator: &dyn FormulaEvaluator,
    ) -> Result<(), StageflowError> {
        if self.computed_iteration == Some(iter) {
            return Ok(());
        }
        self.check_iteration(iter)?;

        for buffer in &mut self.out_sub_compartments {
            buffer.fill(0.0);
        }

        let population: f64 = self.sub_compartments.iter().sum();
        for edge in 0..self.out_distributions.len() {
            let weight = self.out_weights[edge];
            let expression_amount = match &self.out_distributions[edge] {
                Distribution::Expression { formula } => {
                    Some(evaluator.evaluate(formula, scope)? * weight)
                }
                _ => None,
            };

            let Some(mut amount) = expression_amount else {
                let distribution = &self.out_distributions[edge];
                for (index, (bucket, outflow)) in self
                    .sub_compartments
                    .iter()
                    .zip(self.out_sub_compartments[edge].iter_mut())
                    .enumerate()
                {
                    if *bucket > 0.0 {
                        let probability = distribution.transition_probability(index).unwrap_or(0.0);
                        *outflow = bucket * weight * probability;
                    }
                }
                continue;
            };

            if amount < 0.0 {
                self.record(Violation {
                    iteration: iter,
                    compartment: self.name.clone(),
                    bucket: None,
                    kind: ViolationKind::NegativeExpressionOutflow,
                    magnitude: -amount,
                });
                amount = 0.0;
            }
            if population > 0.0 {
                for (bucket, outflow) in self
                    .sub_compartments
                    .iter()
                    .zip(self.out_sub_compartments[edge].iter_mut())
                {
                    if *bucket > 0.0 {
                        *outflow = amount * bucket / population;
                    }
                }
            } else if exceeds(amount, 0.0) {
                self.record(Violation {
                    iteration: iter,
                    compartment: self.name.clone(),
                    bucket: None,
                    kind: ViolationKind::OutflowExceedsPopulation,
                    magnitude: amount,
                });
            }
        }

        self.saturate_outflows(iter);

        for (edge, buffer) in self.out_sub_compartments.iter().enumerate() {
            let total: f64 = buffer.iter().sum();
            self.out_totals[edge][iter] = total;
            trace!(
                "{} -> {} at iteration {iter}: {total}",
                self.name,
                self.out_compartment_names[edge]
            );
        }

        self.computed_iteration = Some(iter);
        Ok(())
    }

    // Scales down the outflow of any bucket whose edges together take more than it holds.
    fn saturate_outflows(&mut self, iter: usize) {
        let mut found = Vec::new();
        for (index, bucket) in self.sub_compartments.iter().enumerate() {
            let taken: f64 = self
                .out_sub_compartments
                .iter()
                .map(|buffer| buffer[index])
                .sum();
            if taken <= *bucket {
                continue;
            }
            if exceeds(taken, *bucket) {
                found.push(Violation {
                    iteration: iter,
                    compartment: self.name.clone(),
                    bucket: Some(index),
                    kind: ViolationKind::OutflowExceedsPopulation,
                    magnitude: taken - bucket,
                });
            }
            let scale = bucket / taken;
            for buffer in &mut self.out_sub_compartments {
                buffer[index] *= scale;
            }
        }
        for violation in found {
            self.record(violation);
        }
    }

    /// Completes `iter`: removes the computed outflow, ages every bucket by one step, adds
    /// `inflow` to bucket zero and appends the new total to the history.
    ///
    /// # Errors
    ///
    /// Returns an error if the outflow of `iter` has not been computed.
    pub fn advance(&mut self, iter: usize, inflow: f64) -> Result<(), StageflowError> {
        self.check_iteration(iter)?;
        if self.computed_iteration != Some(iter) {
            return Err(StageflowError::StageflowError(format!(
                "compartment {}: outflow of iteration {iter} has not been computed",
                self.name
            )));
        }

        let mut found = Vec::new();
        for (index, bucket) in self.sub_compartments.iter_mut().enumerate() {
            let taken: f64 = self
                .out_sub_compartments
                .iter()
                .map(|buffer| buffer[index])
                .sum();
            *bucket -= taken;
            if *bucket < 0.0 {
                if *bucket < -NEGATIVE_TOLERANCE * taken.max(1.0) {
                    found.push(Violation {
                        iteration: iter,
                        compartment: self.name.clone(),
                        bucket: Some(index),
                        kind: ViolationKind::NegativePopulation,
                        magnitude: -*bucket,
                    });
                }
                *bucket = 0.0;
            }
        }
        for violation in found {
            self.record(violation);
        }

        // Age the remaining population; the last bucket keeps whoever has not left.
        let last = self.sub_compartments.len() - 1;
        if last == 0 {
            self.sub_compartments[0] += inflow;
        } else {
            let tail = self.sub_compartments[last];
            self.sub_compartments.rotate_right(1);
            self.sub_compartments[last] += tail;
            self.sub_compartments[0] = inflow;
        }

        self.total_history.push(self.sub_compartments.iter().sum());
        Ok(())
    }

    /// What left along the out-edge to `target` during `iter`.
    #[must_use]
    pub fn outflow_to(&self, target: CompartmentId, iter: usize) -> f64 {
        self.out_compartments
            .iter()
            .zip(&self.out_totals)
            .filter(|(id, _)| **id == target)
            .filter_map(|(_, totals)| totals.get(iter))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_almost_eq;
    use crate::distribution::TransitionTable;
    use crate::expression::EvalexprEvaluator;
    use crate::HashMap;
    use indexmap::IndexMap;

    fn attach(
        compartment: &mut Compartment,
        target: usize,
        name: &str,
        distribution: Distribution,
        weight: f64,
    ) {
        compartment
            .add_out_compartment(CompartmentId(target))
            .unwrap();
        compartment.add_out_compartment_name(name).unwrap();
        compartment.add_out_distribution(distribution).unwrap();
        compartment.add_out_weight(weight).unwrap();
    }

    fn step(compartment: &mut Compartment, iter: usize, inflow: f64) {
        let parameters = IndexMap::new();
        let compartments = HashMap::default();
        let scope = Scope {
            parameters: &parameters,
            compartments: &compartments,
            step: iter,
            time: 0.0,
        };
        compartment
            .compute_outflows(iter, &scope, &EvalexprEvaluator::new())
            .unwrap();
        compartment.advance(iter, inflow).unwrap();
    }

    #[test]
    fn isolated_compartment_is_conserved() {
        let mut compartment = Compartment::new("R", 250.0).unwrap();
        compartment.set_length_sub_compartment().unwrap();
        compartment.set_out_values(20).unwrap();
        for iter in 1..20 {
            step(&mut compartment, iter, 0.0);
        }
        assert_eq!(compartment.total_history().len(), 20);
        assert!(compartment.total_history().iter().all(|t| *t == 250.0));
        assert_eq!(compartment.length(), 1);
    }

    #[test]
    fn length_follows_longest_table() {
        let mut compartment = Compartment::new("I", 10.0).unwrap();
        let short = TransitionTable::from_probabilities(vec![0.5, 1.0]).unwrap();
        let long = TransitionTable::from_probabilities(vec![0.1, 0.2, 0.3, 1.0]).unwrap();
        attach(&mut compartment, 1, "R", Distribution::Cdf(short), 0.5);
        attach(&mut compartment, 2, "D", Distribution::Cdf(long), 0.5);
        attach(
            &mut compartment,
            3,
            "H",
            Distribution::constant(0.01).unwrap(),
            0.1,
        );
        compartment.set_length_sub_compartment().unwrap();
        assert_eq!(compartment.sub_compartment_values(), &[10.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn population_ages_through_buckets() {
        let mut compartment = Compartment::new("E", 100.0).unwrap();
        let table = TransitionTable::from_probabilities(vec![0.0, 0.0, 1.0]).unwrap();
        attach(&mut compartment, 1, "I", Distribution::Cdf(table), 1.0);
        compartment.set_length_sub_compartment().unwrap();
        compartment.set_out_values(6).unwrap();

        step(&mut compartment, 1, 5.0);
        assert_eq!(compartment.sub_compartment_values(), &[5.0, 100.0, 0.0]);
        step(&mut compartment, 2, 0.0);
        assert_eq!(compartment.sub_compartment_values(), &[0.0, 5.0, 100.0]);
        // Everyone in bucket 2 leaves.
        step(&mut compartment, 3, 0.0);
        assert_eq!(compartment.sub_compartment_values(), &[0.0, 0.0, 5.0]);
        assert_almost_eq!(compartment.out_values()[0][3], 100.0, 0.0);
        assert_eq!(compartment.total_history(), &[100.0, 105.0, 105.0, 5.0]);
    }

    #[test]
    fn last_bucket_saturates() {
        let mut compartment = Compartment::new("I", 100.0).unwrap();
        let table = TransitionTable::from_probabilities(vec![0.0, 0.5]).unwrap();
        attach(&mut compartment, 1, "R", Distribution::Cdf(table), 1.0);
        compartment.set_length_sub_compartment().unwrap();
        compartment.set_out_values(5).unwrap();
        step(&mut compartment, 1, 0.0);
        step(&mut compartment, 2, 0.0);
        step(&mut compartment, 3, 0.0);
        assert_eq!(compartment.sub_compartment_values(), &[0.0, 25.0]);
    }

    #[test]
    fn weights_partition_outflow() {
        let mut compartment = Compartment::new("I", 1000.0).unwrap();
        let table = TransitionTable::from_probabilities(vec![0.2, 0.4, 0.6]).unwrap();
        attach(&mut compartment, 1, "R", Distribution::Cdf(table.clone()), 0.3);
        attach(&mut compartment, 2, "D", Distribution::Cdf(table), 0.7);
        compartment.set_length_sub_compartment().unwrap();
        compartment.set_out_values(5).unwrap();
        for iter in 1..5 {
            step(&mut compartment, iter, 100.0);
            let buffers = compartment.out_sub_compartments();
            for bucket in 0..compartment.length() {
                if buffers[1][bucket] > 0.0 {
                    assert_almost_eq!(buffers[0][bucket] / buffers[1][bucket], 3.0 / 7.0, 1e-12);
                }
            }
        }
    }

    #[test]
    fn excess_outflow_is_clamped_and_recorded() {
        let mut compartment = Compartment::new("I", 100.0).unwrap();
        attach(
            &mut compartment,
            1,
            "R",
            Distribution::constant(0.8).unwrap(),
            1.0,
        );
        attach(
            &mut compartment,
            2,
            "D",
            Distribution::constant(0.7).unwrap(),
            1.0,
        );
        compartment.set_length_sub_compartment().unwrap();
        compartment.set_out_values(3).unwrap();
        step(&mut compartment, 1, 0.0);

        assert_almost_eq!(compartment.total_history()[1], 0.0, 1e-12);
        let taken = compartment.out_values()[0][1] + compartment.out_values()[1][1];
        assert_almost_eq!(taken, 100.0, 1e-9);
        assert_eq!(compartment.violations().len(), 1);
        assert_eq!(
            compartment.violations()[0].kind,
            ViolationKind::OutflowExceedsPopulation
        );
    }

    #[test]
    fn expression_outflow_follows_bucket_shares() {
        let mut compartment = Compartment::new("E", 100.0).unwrap();
        let holding = TransitionTable::from_probabilities(vec![0.0, 0.0, 0.0]).unwrap();
        attach(&mut compartment, 1, "X", Distribution::Cdf(holding), 0.5);
        attach(
            &mut compartment,
            2,
            "Y",
            Distribution::expression("12").unwrap(),
            0.5,
        );
        compartment.set_length_sub_compartment().unwrap();
        compartment.set_out_values(4).unwrap();

        step(&mut compartment, 1, 50.0);
        step(&mut compartment, 2, 30.0);
        let before = compartment.sub_compartment_values().to_vec();
        assert_eq!(before.iter().filter(|bucket| **bucket > 0.0).count(), 3);
        let population: f64 = before.iter().sum();

        step(&mut compartment, 3, 0.0);
        let buffers = compartment.out_sub_compartments();
        for (index, bucket) in before.iter().enumerate() {
            assert_almost_eq!(buffers[0][index], 0.0, 0.0);
            assert_almost_eq!(buffers[1][index], 12.0 * 0.5 * bucket / population, 1e-12);
        }
        assert_almost_eq!(compartment.out_values()[1][3], 6.0, 1e-12);
        assert!(compartment.violations().is_empty());
    }

    #[test]
    fn negative_expression_outflow_is_recorded() {
        let mut compartment = Compartment::new("S", 10.0).unwrap();
        attach(
            &mut compartment,
            1,
            "I",
            Distribution::expression("-3").unwrap(),
            1.0,
        );
        compartment.set_length_sub_compartment().unwrap();
        compartment.set_out_values(2).unwrap();
        step(&mut compartment, 1, 0.0);

        assert_eq!(compartment.out_values()[0][1], 0.0);
        assert_eq!(compartment.total_history(), &[10.0, 10.0]);
        let violation = &compartment.violations()[0];
        assert_eq!(violation.kind, ViolationKind::NegativeExpressionOutflow);
        assert_eq!(violation.bucket, None);
        assert_almost_eq!(violation.magnitude, 3.0, 0.0);
    }

    #[test]
    fn expression_outflow_from_empty_compartment_is_recorded() {
        let mut compartment = Compartment::new("S", 0.0).unwrap();
        attach(
            &mut compartment,
            1,
            "I",
            Distribution::expression("4").unwrap(),
            1.0,
        );
        compartment.set_length_sub_compartment().unwrap();
        compartment.set_out_values(2).unwrap();
        step(&mut compartment, 1, 0.0);

        assert_eq!(compartment.out_values()[0][1], 0.0);
        assert_eq!(compartment.total_history(), &[0.0, 0.0]);
        assert_eq!(compartment.violations().len(), 1);
        assert_eq!(
            compartment.violations()[0].kind,
            ViolationKind::OutflowExceedsPopulation
        );
        assert_almost_eq!(compartment.violations()[0].magnitude, 4.0, 0.0);
    }

    #[test]
    fn duplicate_out_edges_are_rejected() {
        let mut compartment = Compartment::new("S", 1.0).unwrap();
        attach(
            &mut compartment,
            1,
            "I",
            Distribution::constant(0.1).unwrap(),
            1.0,
        );
        assert!(compartment.is_out_comp_added("I"));
        assert_eq!(compartment.find_out_comp_position("I"), Some(0));
        assert_eq!(compartment.find_out_comp_position("R"), None);
        assert!(matches!(
            compartment.add_out_compartment_name("I"),
            Err(StageflowError::ConfigError(_))
        ));
    }

    #[test]
    fn edit_out_distribution_replaces_by_name() {
        let mut compartment = Compartment::new("S", 1.0).unwrap();
        attach(
            &mut compartment,
            1,
            "I",
            Distribution::constant(0.1).unwrap(),
            1.0,
        );
        compartment
            .edit_out_distribution("I", Distribution::constant(0.2).unwrap())
            .unwrap();
        assert_eq!(
            compartment.out_distributions()[0],
            Distribution::Constant { rate: 0.2 }
        );
        assert!(compartment
            .edit_out_distribution("R", Distribution::constant(0.2).unwrap())
            .is_err());

        compartment.set_length_sub_compartment().unwrap();
        assert!(compartment
            .edit_out_distribution("I", Distribution::constant(0.3).unwrap())
            .is_err());
    }

    #[test]
    fn misaligned_edges_fail_initialisation() {
        let mut compartment = Compartment::new("S", 1.0).unwrap();
        compartment.add_out_compartment(CompartmentId(1)).unwrap();
        compartment.add_out_compartment_name("I").unwrap();
        compartment.add_out_weight(1.0).unwrap();
        assert!(matches!(
            compartment.set_length_sub_compartment(),
            Err(StageflowError::ConfigError(_))
        ));
    }

    #[test]
    fn lifecycle_order_is_enforced() {
        let mut compartment = Compartment::new("S", 1.0).unwrap();
        assert!(compartment.set_out_values(10).is_err());
        compartment.set_length_sub_compartment().unwrap();
        assert!(compartment.set_length_sub_compartment().is_err());
        assert!(compartment.add_out_weight(0.5).is_err());
        compartment.set_out_values(10).unwrap();
        assert!(compartment.set_out_values(10).is_err());

        // Out of sequence
        assert!(compartment.advance(1, 0.0).is_err());
        step(&mut compartment, 1, 0.0);
        let parameters = IndexMap::new();
        let compartments = HashMap::default();
        let scope = Scope {
            parameters: &parameters,
            compartments: &compartments,
            step: 3,
            time: 0.0,
        };
        assert!(compartment
            .compute_outflows(3, &scope, &EvalexprEvaluator::new())
            .is_err());
        assert!(compartment
            .compute_outflows(10, &scope, &EvalexprEvaluator::new())
            .is_err());
    }

    #[test]
    fn invalid_construction() {
        assert!(Compartment::new("", 1.0).is_err());
        assert!(Compartment::new("S", -1.0).is_err());
        assert!(Compartment::new("S", f64::NAN).is_err());
        assert!(Compartment::new("S", 1.0)
            .unwrap()
            .add_out_weight(1.5)
            .is_err());
    }
}
