use serde::{Deserialize, Serialize};

use crate::error::{RareEventError, Result};

/// A parameter vector together with the model output that goes with it.
///
/// This is what the decision gate publishes after every step and what the
/// samplers read back to continue their chains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedSample {
    pub inputs: Vec<f64>,
    pub output: f64,
}

impl AcceptedSample {
    pub fn new(inputs: Vec<f64>, output: f64) -> Self {
        Self { inputs, output }
    }
}

/// A source of one matrix of samples, queried one cell at a time.
///
/// The host advances a global step counter once per realization and asks for
/// every column of the step's row. Implementations do their per-step work on
/// the first query of a step and answer later queries of the same step from
/// the cached proposal.
pub trait SampleProducer {
    /// Number of columns (parameters) in a row.
    fn num_columns(&self) -> usize;

    /// Total number of steps this producer serves.
    fn total_steps(&self) -> u64;

    /// Physical value of `column` for the proposal of `step` on `lane`.
    fn propose(&mut self, step: u64, lane: usize, column: usize) -> Result<f64>;

    /// Lowest output the gate may accept at `step`, if proposals are filtered.
    fn acceptance_limit(&self, step: u64) -> Option<f64>;

    /// Whether the gate compares `|output|` instead of `output`.
    fn use_absolute_value(&self) -> bool;

    /// The sample the gate falls back to when it rejects the current proposal.
    fn fallback(&self) -> Option<&AcceptedSample>;

    /// Hand the gate's decision for `step` back to the producer.
    fn record(&mut self, step: u64, lane: usize, accepted: AcceptedSample) -> Result<()>;
}

/// Tracks the last step a component advanced for.
///
/// Steps are numbered from one and must be visited in order; revisiting the
/// current step is allowed and reports that no new work is needed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepGuard {
    last: Option<u64>,
}

impl StepGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }

    /// Returns `true` exactly once per step: the first time it is entered.
    pub fn enter(&mut self, step: u64) -> Result<bool> {
        let expected = self.last.map_or(1, |last| last + 1);
        match self.last {
            Some(last) if last == step => Ok(false),
            _ if step == expected => {
                self.last = Some(step);
                Ok(true)
            }
            _ => Err(RareEventError::Sequencing(format!(
                "expected step {expected}, got step {step}"
            ))),
        }
    }
}

/// Checks that `accepted` fits a producer with `columns` columns.
pub(crate) fn check_width(accepted: &AcceptedSample, columns: usize) -> Result<()> {
    if accepted.inputs.len() != columns {
        return Err(RareEventError::Configuration(format!(
            "accepted sample has {} inputs, expected {columns}",
            accepted.inputs.len()
        )));
    }
    Ok(())
}
