use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    distribution::{standardize_all, Parameter},
    error::{RareEventError, Result},
    math::{accept, log_acceptance_ratio, mean_std, normal_ln_pdf, std_normal_ln_pdf},
    producer::{check_width, AcceptedSample, SampleProducer, StepGuard},
    rng::StepRng,
};

/// Settings for the adaptive importance sampler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AisSettings {
    /// Distributions of the uncertain inputs.
    pub parameters: Vec<Parameter>,
    /// Standard deviation of the training random walk, per parameter, in
    /// standardized space.
    pub proposal_std: Vec<f64>,
    /// Physical starting point of the training chain. It should lie in the
    /// failure region.
    pub initial_values: Vec<f64>,
    /// Outputs at or above this value count as failures.
    pub output_limit: f64,
    /// Number of steps spent training the importance distribution.
    pub num_samples_train: u64,
    /// Number of steps drawn from the trained importance distribution.
    pub num_importance_sampling_steps: u64,
    /// Scale applied to the fitted standard deviation when sampling.
    pub std_factor: f64,
    /// Compare `|output|` against the limit.
    pub use_absolute_value: bool,
    /// Upper bound for the total number of steps.
    pub num_random_seeds: u64,
    pub seed: u64,
}

impl Default for AisSettings {
    fn default() -> Self {
        Self {
            parameters: Vec::new(),
            proposal_std: Vec::new(),
            initial_values: Vec::new(),
            output_limit: 0.,
            num_samples_train: 1000,
            num_importance_sampling_steps: 10000,
            std_factor: 0.9,
            use_absolute_value: false,
            num_random_seeds: 100000,
            seed: 0,
        }
    }
}

impl AisSettings {
    pub fn total_steps(&self) -> u64 {
        self.num_samples_train + self.num_importance_sampling_steps
    }

    pub fn validate(&self) -> Result<()> {
        let dim = self.parameters.len();
        if dim == 0 {
            return Err(config("at least one parameter is required"));
        }
        if self.proposal_std.len() != dim {
            return Err(config(format!(
                "proposal_std has {} entries but there are {dim} parameters",
                self.proposal_std.len()
            )));
        }
        if self.initial_values.len() != dim {
            return Err(config(format!(
                "initial_values has {} entries but there are {dim} parameters",
                self.initial_values.len()
            )));
        }
        if let Some(std) = self
            .proposal_std
            .iter()
            .find(|&&std| !(std.is_finite() && std > 0.))
        {
            return Err(config(format!("proposal_std must be positive, got {std}")));
        }
        if !(self.std_factor.is_finite() && self.std_factor > 0.) {
            return Err(config(format!(
                "std_factor must be positive, got {}",
                self.std_factor
            )));
        }
        if !self.output_limit.is_finite() {
            return Err(config("output_limit must be finite"));
        }
        // Step 2 always re-accepts the seed, so the first point that can
        // differ from it is drawn at step 3.
        if self.num_samples_train < 3 {
            return Err(config("num_samples_train must be at least 3"));
        }
        if self.num_importance_sampling_steps == 0 {
            return Err(config("num_importance_sampling_steps must be at least 1"));
        }
        if self.num_random_seeds <= self.total_steps() {
            return Err(config(format!(
                "num_random_seeds ({}) must exceed the total number of steps ({})",
                self.num_random_seeds,
                self.total_steps()
            )));
        }
        for (param, &x) in self.parameters.iter().zip(self.initial_values.iter()) {
            if !param.standardize(x).is_finite() {
                return Err(config(format!(
                    "initial value {x} lies outside the support of '{}'",
                    param.name()
                )));
            }
        }
        Ok(())
    }
}

fn config(msg: impl Into<String>) -> RareEventError {
    RareEventError::Configuration(msg.into())
}

/// Normal importance density in standardized space, fitted to the training
/// chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportanceDistribution {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
    pub std_factor: f64,
}

impl ImportanceDistribution {
    pub fn new(mean: Vec<f64>, std: Vec<f64>, std_factor: f64) -> Result<Self> {
        if mean.len() != std.len() {
            return Err(config(format!(
                "importance distribution has {} means but {} standard deviations",
                mean.len(),
                std.len()
            )));
        }
        if mean.iter().any(|m| !m.is_finite()) {
            return Err(config("importance distribution means must be finite"));
        }
        if let Some(s) = std.iter().find(|&&s| !(s.is_finite() && s > 0.)) {
            return Err(config(format!(
                "importance distribution standard deviations must be positive, got {s}"
            )));
        }
        if !(std_factor.is_finite() && std_factor > 0.) {
            return Err(config(format!(
                "std_factor must be positive, got {std_factor}"
            )));
        }
        Ok(Self {
            mean,
            std,
            std_factor,
        })
    }

    /// Fit to the chain, excluding its seed point.
    fn fit(chain: &[Box<[f64]>], std_factor: f64) -> Result<Self> {
        let history = chain.get(1..).unwrap_or_default();
        let dim = chain.first().map_or(0, |point| point.len());
        let mut mean = Vec::with_capacity(dim);
        let mut std = Vec::with_capacity(dim);
        for i in 0..dim {
            let (m, s) = mean_std(history.iter().map(|point| point[i])).ok_or_else(|| {
                RareEventError::Sequencing("the training chain is empty".to_string())
            })?;
            if !(s.is_finite() && s > 0.) {
                return Err(config(format!(
                    "the training chain never moved in dimension {i}; \
                     increase num_samples_train or proposal_std"
                )));
            }
            mean.push(m);
            std.push(s);
        }
        Self::new(mean, std, std_factor)
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Log of the importance weight `φ(z) / q(z)` of a standardized point.
    pub fn ln_weight(&self, z: &[f64]) -> f64 {
        z.iter()
            .zip(self.mean.iter().zip(self.std.iter()))
            .map(|(&z, (&mean, &std))| {
                std_normal_ln_pdf(z) - normal_ln_pdf(z, mean, self.std_factor * std)
            })
            .sum()
    }

    pub fn weight(&self, z: &[f64]) -> f64 {
        self.ln_weight(z).exp()
    }
}

/// Single chain sampler that first learns the failure region with a
/// constrained random walk and then samples from a normal fitted to it.
#[derive(Debug)]
pub struct AdaptiveImportanceSampler {
    settings: AisSettings,
    rng: StepRng,
    guard: StepGuard,
    chain: Vec<Box<[f64]>>,
    proposed: Vec<f64>,
    previous: Option<AcceptedSample>,
    current: Option<AcceptedSample>,
    importance: Option<ImportanceDistribution>,
    advances: u64,
}

impl AdaptiveImportanceSampler {
    pub fn new(settings: AisSettings) -> Result<Self> {
        settings.validate()?;
        let initial = standardize_all(&settings.parameters, &settings.initial_values);
        Ok(Self {
            rng: StepRng::new(settings.seed),
            guard: StepGuard::new(),
            chain: vec![initial.clone().into()],
            proposed: initial,
            previous: None,
            current: None,
            importance: None,
            advances: 0,
            settings,
        })
    }

    pub fn settings(&self) -> &AisSettings {
        &self.settings
    }

    /// The trained importance distribution, once training has finished.
    pub fn importance_distribution(&self) -> Option<&ImportanceDistribution> {
        self.importance.as_ref()
    }

    /// Number of per-step advances so far.
    pub fn advance_count(&self) -> u64 {
        self.advances
    }

    /// Accepted standardized points of the training chain, seed first.
    pub fn chain(&self) -> &[Box<[f64]>] {
        &self.chain
    }

    pub fn is_training(&self, step: u64) -> bool {
        step <= self.settings.num_samples_train
    }

    pub fn is_completed(&self) -> bool {
        self.guard.last() == Some(self.settings.total_steps())
    }

    fn advance(&mut self, step: u64) -> Result<()> {
        self.advances += 1;
        self.previous = self.current.take();

        if step <= 1 {
            return Ok(());
        }

        let mut rng = self.rng.for_step(step, 0);

        if self.is_training(step) {
            let accepted = self.previous.as_ref().ok_or_else(|| {
                RareEventError::Sequencing(format!(
                    "no accepted sample was recorded for step {}",
                    step - 1
                ))
            })?;
            let candidate = standardize_all(&self.settings.parameters, &accepted.inputs);
            let tail = &self.chain[self.chain.len() - 1];
            let log_ratio = log_acceptance_ratio(&candidate, tail);
            let next: Box<[f64]> = if accept(log_ratio, rng.random()) {
                candidate.into()
            } else {
                tail.clone()
            };
            self.proposed = next
                .iter()
                .zip(self.settings.proposal_std.iter())
                .map(|(&x, &std)| x + std * rng.sample::<f64, _>(StandardNormal))
                .collect();
            self.chain.push(next);
            return Ok(());
        }

        let importance = match self.importance.take() {
            Some(importance) => importance,
            None => {
                let importance =
                    ImportanceDistribution::fit(&self.chain, self.settings.std_factor)?;
                info!(
                    step,
                    mean = ?importance.mean,
                    std = ?importance.std,
                    "training finished, importance distribution fitted"
                );
                importance
            }
        };
        self.proposed = importance
            .mean
            .iter()
            .zip(importance.std.iter())
            .map(|(&mean, &std)| {
                mean + importance.std_factor * std * rng.sample::<f64, _>(StandardNormal)
            })
            .collect();
        self.importance = Some(importance);
        Ok(())
    }
}

impl SampleProducer for AdaptiveImportanceSampler {
    fn num_columns(&self) -> usize {
        self.settings.parameters.len()
    }

    fn total_steps(&self) -> u64 {
        self.settings.total_steps()
    }

    fn propose(&mut self, step: u64, lane: usize, column: usize) -> Result<f64> {
        if lane != 0 {
            return Err(config(format!(
                "the importance sampler runs a single chain, lane {lane} was requested"
            )));
        }
        if column >= self.num_columns() {
            return Err(config(format!(
                "column {column} requested but there are {} parameters",
                self.num_columns()
            )));
        }
        let budget = self.total_steps();
        if step > budget {
            return Err(RareEventError::CompletionViolation { step, budget });
        }
        if self.guard.enter(step)? {
            self.advance(step)?;
        }
        if step <= 1 {
            return Ok(self.settings.initial_values[column]);
        }
        Ok(self.settings.parameters[column].destandardize(self.proposed[column]))
    }

    fn acceptance_limit(&self, step: u64) -> Option<f64> {
        self.is_training(step).then_some(self.settings.output_limit)
    }

    fn use_absolute_value(&self) -> bool {
        self.settings.use_absolute_value
    }

    fn fallback(&self) -> Option<&AcceptedSample> {
        self.previous.as_ref()
    }

    fn record(&mut self, step: u64, lane: usize, accepted: AcceptedSample) -> Result<()> {
        if lane != 0 {
            return Err(config(format!(
                "the importance sampler runs a single chain, lane {lane} was recorded"
            )));
        }
        if self.guard.last() != Some(step) {
            return Err(RareEventError::Sequencing(format!(
                "recorded step {step} but the last proposed step is {:?}",
                self.guard.last()
            )));
        }
        if self.current.is_some() {
            return Err(RareEventError::Sequencing(format!(
                "step {step} was recorded twice"
            )));
        }
        check_width(&accepted, self.num_columns())?;
        self.current = Some(accepted);
        Ok(())
    }
}
