use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    comm::Communicator,
    distribution::{standardize_all, Parameter},
    error::{RareEventError, Result},
    math::{accept, log_acceptance_ratio},
    producer::{check_width, AcceptedSample, SampleProducer, StepGuard},
    rng::StepRng,
};

/// Guards `floor` against products like `1000 * 0.1` landing just below an
/// integer.
const FLOOR_SLACK: f64 = 1e-9;

/// Settings for parallel subset simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubsetSettings {
    pub parameters: Vec<Parameter>,
    /// Conditional probability of reaching the next subset.
    pub subset_probability: f64,
    /// Samples per subset, summed over all lanes.
    pub num_samples_per_subset: usize,
    pub num_subsets: usize,
    /// Rank samples by `|output|`.
    pub use_absolute_value: bool,
    pub seed: u64,
}

impl Default for SubsetSettings {
    fn default() -> Self {
        Self {
            parameters: Vec::new(),
            subset_probability: 0.1,
            num_samples_per_subset: 1000,
            num_subsets: 3,
            use_absolute_value: false,
            seed: 0,
        }
    }
}

impl SubsetSettings {
    /// Number of samples kept as seeds when a subset closes.
    pub fn pool_size(&self) -> usize {
        (self.num_samples_per_subset as f64 * self.subset_probability + FLOOR_SLACK).floor()
            as usize
    }

    /// Number of steps a lane continues from its own point between reseeds.
    pub fn reseed_interval(&self) -> u64 {
        (self.subset_probability.recip() + FLOOR_SLACK).floor() as u64
    }

    pub fn validate(&self, lane_count: usize) -> Result<()> {
        let config = |msg: String| Err(RareEventError::Configuration(msg));
        if self.parameters.is_empty() {
            return config("at least one parameter is required".to_string());
        }
        let p = self.subset_probability;
        if !(p > 0. && p < 1.) {
            return config(format!("subset_probability must lie in (0, 1), got {p}"));
        }
        if self.num_subsets == 0 {
            return config("num_subsets must be at least 1".to_string());
        }
        if lane_count == 0 {
            return config("at least one lane is required".to_string());
        }
        if self.num_samples_per_subset == 0 || self.num_samples_per_subset % lane_count != 0 {
            return config(format!(
                "num_samples_per_subset ({}) must be a positive multiple of {lane_count} lanes",
                self.num_samples_per_subset
            ));
        }
        if self.pool_size() == 0 {
            return config(format!(
                "num_samples_per_subset ({}) times subset_probability ({p}) keeps no seeds",
                self.num_samples_per_subset
            ));
        }
        Ok(())
    }
}

/// Cyclic index into the sorted seed pool.
///
/// Every `reseed_interval` sub-steps each lane takes a fresh seed; seeds are
/// handed out round robin across lanes and wrap around at the end of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedCursor {
    pool_size: usize,
    lane_count: usize,
    reseed_interval: u64,
}

impl SeedCursor {
    pub fn new(pool_size: usize, lane_count: usize, reseed_interval: u64) -> Result<Self> {
        if pool_size == 0 || lane_count == 0 || reseed_interval == 0 {
            return Err(RareEventError::Configuration(format!(
                "seed cursor needs a non-empty pool, lanes and a reseed interval, \
                 got {pool_size}, {lane_count} and {reseed_interval}"
            )));
        }
        Ok(Self {
            pool_size,
            lane_count,
            reseed_interval,
        })
    }

    pub fn is_reseed(&self, sub_step: u64) -> bool {
        sub_step % self.reseed_interval == 0
    }

    pub fn index(&self, sub_step: u64, lane: usize) -> usize {
        let round = sub_step / self.reseed_interval;
        let slot = round as u128 * self.lane_count as u128 + lane as u128;
        (slot % self.pool_size as u128) as usize
    }
}

/// Intermediate threshold reached by a closed subset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubsetLevel {
    pub subset: usize,
    /// Smallest ranked output kept in the seed pool.
    pub threshold: f64,
    /// Probability of exceeding `threshold`.
    pub probability: f64,
}

/// Levels and final subset of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsetSummary {
    pub levels: Vec<SubsetLevel>,
    /// The last closed subset, sorted by ranked output in descending order.
    pub final_subset: Vec<AcceptedSample>,
    pub pool_size: usize,
    pub subset_probability: f64,
    pub use_absolute_value: bool,
}

impl SubsetSummary {
    pub fn seed_pool(&self) -> &[AcceptedSample] {
        &self.final_subset[..self.pool_size.min(self.final_subset.len())]
    }

    pub fn failure_probability(&self, limit: f64) -> Option<f64> {
        tail_probability(
            self.levels.len(),
            &self.final_subset,
            self.subset_probability,
            self.use_absolute_value,
            limit,
        )
    }
}

fn ranked(sample: &AcceptedSample, use_absolute_value: bool) -> f64 {
    if use_absolute_value {
        sample.output.abs()
    } else {
        sample.output
    }
}

/// `p^k` times the fraction of the last closed subset `k` at or above `limit`.
fn tail_probability(
    num_closed: usize,
    closed: &[AcceptedSample],
    subset_probability: f64,
    use_absolute_value: bool,
    limit: f64,
) -> Option<f64> {
    if num_closed == 0 || closed.is_empty() {
        return None;
    }
    let exceeding = closed
        .iter()
        .filter(|sample| ranked(sample, use_absolute_value) >= limit)
        .count();
    let fraction = exceeding as f64 / closed.len() as f64;
    Some(subset_probability.powi((num_closed - 1) as i32) * fraction)
}

/// One lane of a subset simulation.
///
/// All lanes run the same step sequence. Before each step the lanes exchange
/// the sample they accepted in the previous step, so every lane holds the
/// full subset and derives the same seed pool and thresholds.
#[derive(Debug)]
pub struct ParallelSubsetSampler<C: Communicator> {
    settings: SubsetSettings,
    comm: C,
    rng: StepRng,
    guard: StepGuard,
    cursor: SeedCursor,
    steps_per_subset: u64,
    current: Vec<AcceptedSample>,
    closed: Vec<AcceptedSample>,
    levels: Vec<SubsetLevel>,
    own: Option<AcceptedSample>,
    seed: Option<AcceptedSample>,
    recorded: Option<AcceptedSample>,
    proposed: Vec<f64>,
    advances: u64,
    concluded: bool,
}

impl<C: Communicator> ParallelSubsetSampler<C> {
    pub fn new(settings: SubsetSettings, comm: C) -> Result<Self> {
        let lane_count = comm.lane_count();
        settings.validate(lane_count)?;
        let steps_per_subset = (settings.num_samples_per_subset / lane_count) as u64;
        let cursor = SeedCursor::new(
            settings.pool_size(),
            lane_count,
            settings.reseed_interval(),
        )?;
        Ok(Self {
            rng: StepRng::new(settings.seed),
            guard: StepGuard::new(),
            cursor,
            steps_per_subset,
            current: Vec::with_capacity(settings.num_samples_per_subset),
            closed: Vec::new(),
            levels: Vec::with_capacity(settings.num_subsets),
            own: None,
            seed: None,
            recorded: None,
            proposed: Vec::new(),
            advances: 0,
            concluded: false,
            settings,
            comm,
        })
    }

    pub fn lane(&self) -> usize {
        self.comm.lane()
    }

    pub fn steps_per_subset(&self) -> u64 {
        self.steps_per_subset
    }

    /// Index of the subset `step` belongs to.
    pub fn subset_of(&self, step: u64) -> usize {
        (step.saturating_sub(1) / self.steps_per_subset) as usize
    }

    pub fn levels(&self) -> &[SubsetLevel] {
        &self.levels
    }

    /// Seeds of the most recently closed subset, best first.
    pub fn seed_pool(&self) -> &[AcceptedSample] {
        &self.closed[..self.settings.pool_size().min(self.closed.len())]
    }

    /// Intermediate threshold of the most recently closed subset.
    pub fn threshold(&self) -> Option<f64> {
        self.levels.last().map(|level| level.threshold)
    }

    pub fn advance_count(&self) -> u64 {
        self.advances
    }

    pub fn failure_probability(&self, limit: f64) -> Option<f64> {
        tail_probability(
            self.levels.len(),
            &self.closed,
            self.settings.subset_probability,
            self.settings.use_absolute_value,
            limit,
        )
    }

    /// Exchange the sample recorded for `step` and append the gathered
    /// samples to the open subset.
    fn gather(&mut self, step: u64) -> Result<()> {
        let sample = self.recorded.take().ok_or_else(|| {
            RareEventError::Sequencing(format!(
                "lane {} recorded no accepted sample for step {step}",
                self.lane()
            ))
        })?;
        let mut gathered = self.comm.allgather(sample)?;
        if gathered.len() != self.comm.lane_count() {
            return Err(RareEventError::Communication(format!(
                "gathered {} samples from {} lanes",
                gathered.len(),
                self.comm.lane_count()
            )));
        }
        self.own = Some(gathered[self.lane()].clone());
        self.current.append(&mut gathered);
        Ok(())
    }

    fn close_subset(&mut self) {
        let use_abs = self.settings.use_absolute_value;
        let mut subset = std::mem::take(&mut self.current);
        subset.sort_by(|a, b| ranked(b, use_abs).total_cmp(&ranked(a, use_abs)));

        let index = self.levels.len();
        let pool_size = self.settings.pool_size().min(subset.len());
        let threshold = ranked(&subset[pool_size - 1], use_abs);
        let probability = self.settings.subset_probability.powi(index as i32 + 1);
        info!(
            lane = self.lane(),
            subset = index,
            threshold,
            probability,
            "subset closed"
        );
        self.levels.push(SubsetLevel {
            subset: index,
            threshold,
            probability,
        });
        self.current = Vec::with_capacity(self.settings.num_samples_per_subset);
        self.closed = subset;
    }

    fn advance(&mut self, step: u64) -> Result<()> {
        self.advances += 1;
        if step > 1 {
            self.gather(step - 1)?;
        }

        let sub_step = (step - 1) % self.steps_per_subset;
        if step > 1 && sub_step == 0 {
            self.close_subset();
        }

        let lane = self.lane();
        let mut rng = self.rng.for_step(step, lane);
        let dim = self.settings.parameters.len();

        if self.subset_of(step) == 0 {
            self.seed = None;
            self.proposed = (0..dim)
                .map(|_| rng.sample::<f64, _>(StandardNormal))
                .collect();
            return Ok(());
        }

        let seed = if self.cursor.is_reseed(sub_step) {
            self.closed[self.cursor.index(sub_step, lane)].clone()
        } else {
            self.own.clone().ok_or_else(|| {
                RareEventError::Sequencing(format!("lane {lane} has no previous sample"))
            })?
        };
        let current = standardize_all(&self.settings.parameters, &seed.inputs);
        let candidate: Vec<f64> = current
            .iter()
            .map(|&z| z + rng.sample::<f64, _>(StandardNormal))
            .collect();
        let log_ratio = log_acceptance_ratio(&candidate, &current);
        self.proposed = if accept(log_ratio, rng.random()) {
            candidate
        } else {
            current
        };
        self.seed = Some(seed);
        Ok(())
    }

    /// Gather the samples of the final step and close the last subset.
    pub fn conclude(&mut self) -> Result<()> {
        let total = self.total_steps();
        if self.concluded {
            return Err(RareEventError::Sequencing(
                "subset simulation was already concluded".to_string(),
            ));
        }
        if self.guard.last() != Some(total) {
            return Err(RareEventError::Sequencing(format!(
                "conclude requires all {total} steps, last step was {:?}",
                self.guard.last()
            )));
        }
        self.gather(total)?;
        self.close_subset();
        self.concluded = true;
        Ok(())
    }

    pub fn is_concluded(&self) -> bool {
        self.concluded
    }

    /// Levels and final subset, consuming the lane.
    pub fn into_summary(self) -> SubsetSummary {
        SubsetSummary {
            levels: self.levels,
            final_subset: self.closed,
            pool_size: self.settings.pool_size(),
            subset_probability: self.settings.subset_probability,
            use_absolute_value: self.settings.use_absolute_value,
        }
    }
}

impl<C: Communicator> SampleProducer for ParallelSubsetSampler<C> {
    fn num_columns(&self) -> usize {
        self.settings.parameters.len()
    }

    fn total_steps(&self) -> u64 {
        self.settings.num_subsets as u64 * self.steps_per_subset
    }

    fn propose(&mut self, step: u64, lane: usize, column: usize) -> Result<f64> {
        if lane != self.lane() {
            return Err(RareEventError::Configuration(format!(
                "sampler of lane {} was asked for lane {lane}",
                self.lane()
            )));
        }
        if column >= self.num_columns() {
            return Err(RareEventError::Configuration(format!(
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
        Ok(self.settings.parameters[column].destandardize(self.proposed[column]))
    }

    fn acceptance_limit(&self, step: u64) -> Option<f64> {
        if self.subset_of(step) == 0 {
            None
        } else {
            self.threshold()
        }
    }

    fn use_absolute_value(&self) -> bool {
        self.settings.use_absolute_value
    }

    fn fallback(&self) -> Option<&AcceptedSample> {
        self.seed.as_ref()
    }

    fn record(&mut self, step: u64, lane: usize, accepted: AcceptedSample) -> Result<()> {
        if lane != self.lane() {
            return Err(RareEventError::Configuration(format!(
                "sampler of lane {} was given a sample of lane {lane}",
                self.lane()
            )));
        }
        if self.guard.last() != Some(step) {
            return Err(RareEventError::Sequencing(format!(
                "recorded step {step} but the last proposed step is {:?}",
                self.guard.last()
            )));
        }
        if self.recorded.is_some() {
            return Err(RareEventError::Sequencing(format!(
                "step {step} was recorded twice"
            )));
        }
        check_width(&accepted, self.num_columns())?;
        self.recorded = Some(accepted);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{comm::SingleLane, decision::DecisionGate};
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    fn settings(num_samples_per_subset: usize) -> SubsetSettings {
        SubsetSettings {
            parameters: vec![
                Parameter::normal("a", 0., 1.).unwrap(),
                Parameter::normal("b", 0., 1.).unwrap(),
            ],
            num_samples_per_subset,
            num_subsets: 3,
            seed: 3,
            ..Default::default()
        }
    }

    fn model(inputs: &[f64]) -> f64 {
        inputs[0] + inputs[1]
    }

    fn drive(sampler: &mut ParallelSubsetSampler<SingleLane>, repeats: usize) {
        let gate = DecisionGate::new();
        for step in 1..=sampler.total_steps() {
            let mut row = vec![0.; 2];
            for _ in 0..repeats {
                for column in [1, 0] {
                    row[column] = sampler.propose(step, 0, column).unwrap();
                }
            }
            let output = model(&row);
            let accepted = gate.decide(&*sampler, step, row, output);
            sampler.record(step, 0, accepted).unwrap();
        }
        sampler.conclude().unwrap();
    }

    #[test]
    fn cursor_wraps_inside_the_pool() {
        let cursor = SeedCursor::new(5, 3, 4).unwrap();
        assert!(cursor.is_reseed(0));
        assert!(!cursor.is_reseed(3));
        assert!(cursor.is_reseed(8));
        assert_eq!(cursor.index(0, 2), 2);
        assert_eq!(cursor.index(4, 0), 3);
        assert_eq!(cursor.index(4, 2), 0);
        for sub_step in 0..1000 {
            for lane in 0..3 {
                assert!(cursor.index(sub_step, lane) < 5);
            }
        }
        assert!(matches!(
            SeedCursor::new(0, 3, 4),
            Err(RareEventError::Configuration(_))
        ));
        assert!(SeedCursor::new(5, 0, 4).is_err());
        assert!(SeedCursor::new(5, 3, 0).is_err());
    }

    #[test]
    fn pool_size_tolerates_rounding() {
        let mut settings = settings(1000);
        assert_eq!(settings.pool_size(), 100);
        assert_eq!(settings.reseed_interval(), 10);
        settings.subset_probability = 0.3;
        settings.num_samples_per_subset = 10;
        assert_eq!(settings.pool_size(), 3);
        assert_eq!(settings.reseed_interval(), 3);
    }

    #[test]
    fn subsets_close_with_sorted_pools() {
        let mut sampler = ParallelSubsetSampler::new(settings(200), SingleLane).unwrap();
        drive(&mut sampler, 1);
        assert!(sampler.is_concluded());
        let levels = sampler.levels();
        assert_eq!(levels.len(), 3);
        assert_abs_diff_eq!(levels[0].probability, 0.1, epsilon = 1e-15);
        assert_abs_diff_eq!(levels[2].probability, 1e-3, epsilon = 1e-15);
        assert!(levels[0].threshold < levels[1].threshold);
        assert!(levels[1].threshold < levels[2].threshold);

        let pool = sampler.seed_pool();
        assert_eq!(pool.len(), 20);
        assert!(pool.windows(2).all(|pair| pair[0].output >= pair[1].output));
        assert_eq!(pool[19].output, levels[2].threshold);
    }

    #[test]
    fn markov_samples_respect_the_threshold() {
        let mut sampler = ParallelSubsetSampler::new(settings(100), SingleLane).unwrap();
        let gate = DecisionGate::new();
        for step in 1..=sampler.total_steps() {
            let row: Vec<f64> = (0..2)
                .map(|column| sampler.propose(step, 0, column).unwrap())
                .collect();
            let accepted = gate.decide(&sampler, step, row.clone(), model(&row));
            if let Some(threshold) = sampler.acceptance_limit(step) {
                assert!(accepted.output >= threshold);
            }
            sampler.record(step, 0, accepted).unwrap();
        }
    }

    #[test]
    fn rejected_moves_stay_on_the_seed() {
        let mut sampler = ParallelSubsetSampler::new(settings(100), SingleLane).unwrap();
        let gate = DecisionGate::new();
        let mut stayed = 0;
        let mut markov_steps = 0;
        for step in 1..=sampler.total_steps() {
            let row: Vec<f64> = (0..2)
                .map(|column| sampler.propose(step, 0, column).unwrap())
                .collect();
            if let Some(seed) = sampler.fallback() {
                markov_steps += 1;
                let same = row
                    .iter()
                    .zip(seed.inputs.iter())
                    .all(|(&x, &s)| (x - s).abs() <= 1e-7 * s.abs().max(1.));
                if same {
                    stayed += 1;
                }
            }
            let accepted = gate.decide(&sampler, step, row.clone(), model(&row));
            sampler.record(step, 0, accepted).unwrap();
        }
        assert_eq!(markov_steps, 200);
        // A random walk step from a seed in the tail is rejected often.
        assert!(stayed > 10, "{stayed} of {markov_steps} proposals stayed");
        assert!(stayed < markov_steps);
    }

    #[test]
    fn repeated_queries_advance_once_per_step() {
        let mut once = ParallelSubsetSampler::new(settings(100), SingleLane).unwrap();
        let mut many = ParallelSubsetSampler::new(settings(100), SingleLane).unwrap();
        drive(&mut once, 1);
        drive(&mut many, 3);
        assert_eq!(many.advance_count(), many.total_steps());
        assert_eq!(once.levels(), many.levels());
        assert_eq!(once.seed_pool(), many.seed_pool());
    }

    #[test]
    fn failure_probability_uses_the_last_subset() {
        let mut sampler = ParallelSubsetSampler::new(settings(100), SingleLane).unwrap();
        assert_eq!(sampler.failure_probability(0.), None);
        drive(&mut sampler, 1);
        let everything = sampler.failure_probability(f64::NEG_INFINITY).unwrap();
        assert_abs_diff_eq!(everything, 0.01, epsilon = 1e-15);
        assert_eq!(sampler.failure_probability(f64::INFINITY), Some(0.));
        let summary = sampler.into_summary();
        assert_eq!(summary.failure_probability(f64::NEG_INFINITY), Some(everything));
        assert_eq!(summary.seed_pool().len(), 10);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut bad = settings(100);
        bad.subset_probability = 1.;
        assert!(matches!(
            ParallelSubsetSampler::new(bad, SingleLane),
            Err(RareEventError::Configuration(_))
        ));
        let mut bad = settings(5);
        bad.subset_probability = 0.1;
        assert!(ParallelSubsetSampler::new(bad, SingleLane).is_err());
    }

    #[test]
    fn sequencing_is_enforced() {
        let mut sampler = ParallelSubsetSampler::new(settings(100), SingleLane).unwrap();
        sampler.propose(1, 0, 0).unwrap();
        // Step 1 was never recorded, so step 2 has nothing to gather.
        assert!(matches!(
            sampler.propose(2, 0, 0),
            Err(RareEventError::Sequencing(_))
        ));
        assert!(sampler.propose(1, 1, 0).is_err());
        assert!(sampler.conclude().is_err());
    }

    #[test]
    fn proposing_past_the_budget_is_a_completion_violation() {
        let mut sampler = ParallelSubsetSampler::new(settings(100), SingleLane).unwrap();
        drive(&mut sampler, 1);
        assert!(matches!(
            sampler.propose(301, 0, 0),
            Err(RareEventError::CompletionViolation {
                step: 301,
                budget: 300
            })
        ));
    }
}
