use thiserror::Error;

/// Errors raised by the samplers, the aggregator and the lane communicator.
///
/// None of these are recoverable. An MCMC rejection is a normal outcome of
/// the acceptance test and never shows up here.
#[derive(Error, Debug)]
pub enum RareEventError {
    /// Inconsistent or invalid settings, detected at construction.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A step was processed out of order, twice, or before its inputs exist.
    #[error("step sequencing violated: {0}")]
    Sequencing(String),

    /// A proposal was requested after the sampler used up its step budget.
    #[error("sampling completed after step {budget}, but step {step} was requested")]
    CompletionViolation { step: u64, budget: u64 },

    /// The collective exchange between lanes broke down.
    #[error("lane communication failed: {0}")]
    Communication(String),
}

pub type Result<T> = std::result::Result<T, RareEventError>;
