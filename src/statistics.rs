use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    ais::{AdaptiveImportanceSampler, ImportanceDistribution},
    distribution::{standardize_all, Parameter},
    error::{RareEventError, Result},
    producer::AcceptedSample,
};

/// Failure probability estimate after one update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PfEstimate {
    pub step: u64,
    pub pf: f64,
    /// Coefficient of variation of `pf`. Infinite while `pf` is zero.
    pub cov_pf: f64,
    pub num_evaluated: u64,
}

/// Importance sampling estimator of the failure probability.
///
/// Consumes the accepted samples of the importance phase strictly in step
/// order and keeps the running sum and sum of squares of the weighted
/// failure indicator.
#[derive(Debug, Clone)]
pub struct ImportanceStatistics {
    parameters: Vec<Parameter>,
    output_limit: f64,
    use_absolute_value: bool,
    next_step: u64,
    sum: f64,
    sum_sq: f64,
    count: u64,
}

impl ImportanceStatistics {
    pub fn new(ais: &AdaptiveImportanceSampler) -> Self {
        let settings = ais.settings();
        Self::from_parts(
            settings.parameters.clone(),
            settings.output_limit,
            settings.use_absolute_value,
            settings.num_samples_train + 1,
        )
    }

    pub(crate) fn from_parts(
        parameters: Vec<Parameter>,
        output_limit: f64,
        use_absolute_value: bool,
        first_step: u64,
    ) -> Self {
        Self {
            parameters,
            output_limit,
            use_absolute_value,
            next_step: first_step,
            sum: 0.,
            sum_sq: 0.,
            count: 0,
        }
    }

    /// Add the accepted sample of `step` to the estimate.
    pub fn update(
        &mut self,
        step: u64,
        accepted: &AcceptedSample,
        ais: &AdaptiveImportanceSampler,
    ) -> Result<PfEstimate> {
        let importance = ais.importance_distribution().ok_or_else(|| {
            RareEventError::Sequencing(format!(
                "statistics requested at step {step} before training finished"
            ))
        })?;
        self.accumulate(step, accepted, importance)
    }

    pub(crate) fn accumulate(
        &mut self,
        step: u64,
        accepted: &AcceptedSample,
        importance: &ImportanceDistribution,
    ) -> Result<PfEstimate> {
        if step != self.next_step {
            return Err(RareEventError::Sequencing(format!(
                "statistics expected step {}, got step {step}",
                self.next_step
            )));
        }
        if accepted.inputs.len() != importance.dim() {
            return Err(RareEventError::Configuration(format!(
                "accepted sample has {} inputs, importance distribution has {}",
                accepted.inputs.len(),
                importance.dim()
            )));
        }

        let ranked = if self.use_absolute_value {
            accepted.output.abs()
        } else {
            accepted.output
        };
        let weight = if ranked >= self.output_limit {
            let z = standardize_all(&self.parameters, &accepted.inputs);
            importance.weight(&z)
        } else {
            0.
        };

        self.sum += weight;
        self.sum_sq += weight * weight;
        self.count += 1;
        self.next_step += 1;

        let estimate = self.estimate(step);
        debug!(
            step,
            pf = estimate.pf,
            cov_pf = estimate.cov_pf,
            "updated failure probability"
        );
        Ok(estimate)
    }

    fn estimate(&self, step: u64) -> PfEstimate {
        let n = self.count as f64;
        let pf = self.sum / n;
        let cov_pf = if pf > 0. {
            ((self.sum_sq / n - pf * pf).max(0.) / n).sqrt() / pf
        } else {
            f64::INFINITY
        };
        PfEstimate {
            step,
            pf,
            cov_pf,
            num_evaluated: self.count,
        }
    }

    pub fn num_evaluated(&self) -> u64 {
        self.count
    }
}
