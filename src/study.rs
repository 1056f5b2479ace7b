use std::sync::mpsc::channel;

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use rayon::ThreadPoolBuilder;
use tracing::info;

use crate::{
    ais::{AdaptiveImportanceSampler, AisSettings, ImportanceDistribution},
    comm::{local_group, Communicator},
    decision::DecisionGate,
    error::RareEventError,
    producer::{AcceptedSample, SampleProducer},
    statistics::{ImportanceStatistics, PfEstimate},
    subset::{ParallelSubsetSampler, SubsetLevel, SubsetSettings, SubsetSummary},
    trace::{StudyTrace, TraceBuilder},
};

/// The simulation whose failure probability is estimated.
pub trait Model: Send + Sync {
    fn evaluate(&self, inputs: &[f64]) -> Result<f64>;
}

impl<F> Model for F
where
    F: Fn(&[f64]) -> f64 + Send + Sync,
{
    fn evaluate(&self, inputs: &[f64]) -> Result<f64> {
        Ok(self(inputs))
    }
}

/// Outcome of an adaptive importance sampling run.
#[derive(Debug, Clone)]
pub struct ImportanceReport {
    pub pf: f64,
    pub cov_pf: f64,
    pub importance: ImportanceDistribution,
    /// One estimate per importance sampling step.
    pub estimates: Vec<PfEstimate>,
    pub trace: StudyTrace,
}

/// Outcome of a subset simulation run.
#[derive(Debug, Clone)]
pub struct SubsetReport {
    pub summary: SubsetSummary,
    /// Accepted samples of every lane, indexed by lane.
    pub traces: Vec<StudyTrace>,
}

impl SubsetReport {
    pub fn levels(&self) -> &[SubsetLevel] {
        &self.summary.levels
    }

    pub fn failure_probability(&self, limit: f64) -> Option<f64> {
        self.summary.failure_probability(limit)
    }
}

/// Evaluate the model for one step: query every column, run the model and
/// pass the gate's decision back to the producer.
fn run_step<P, M>(
    producer: &mut P,
    model: &M,
    gate: &DecisionGate,
    step: u64,
    lane: usize,
    trace: &mut TraceBuilder,
) -> Result<AcceptedSample>
where
    P: SampleProducer,
    M: Model + ?Sized,
{
    let inputs: Vec<f64> = (0..producer.num_columns())
        .map(|column| producer.propose(step, lane, column))
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("Could not propose step {step} on lane {lane}"))?;
    let output = model
        .evaluate(&inputs)
        .with_context(|| format!("Model evaluation failed at step {step} on lane {lane}"))?;
    let accepted = gate.decide(&*producer, step, inputs, output);
    trace.append(step, lane, &accepted);
    producer
        .record(step, lane, accepted.clone())
        .with_context(|| format!("Could not record step {step} on lane {lane}"))?;
    Ok(accepted)
}

/// Train an importance distribution and estimate the failure probability.
pub fn run_importance_study<M: Model + ?Sized>(
    model: &M,
    settings: AisSettings,
) -> Result<ImportanceReport> {
    let mut sampler =
        AdaptiveImportanceSampler::new(settings).context("Could not create importance sampler")?;
    let mut statistics = ImportanceStatistics::new(&sampler);
    let gate = DecisionGate::new();
    let total = sampler.total_steps();
    let mut trace = TraceBuilder::with_capacity(sampler.num_columns(), total as usize);
    let mut estimates =
        Vec::with_capacity(sampler.settings().num_importance_sampling_steps as usize);

    for step in 1..=total {
        let accepted = run_step(&mut sampler, model, &gate, step, 0, &mut trace)?;
        if !sampler.is_training(step) {
            let estimate = statistics
                .update(step, &accepted, &sampler)
                .with_context(|| format!("Could not update statistics at step {step}"))?;
            estimates.push(estimate);
        }
    }

    let Some(last) = estimates.last().copied() else {
        bail!("Importance sampling produced no estimates");
    };
    let Some(importance) = sampler.importance_distribution().cloned() else {
        bail!("Importance distribution was never fitted");
    };
    info!(
        pf = last.pf,
        cov_pf = last.cov_pf,
        steps = total,
        "importance study finished"
    );
    Ok(ImportanceReport {
        pf: last.pf,
        cov_pf: last.cov_pf,
        importance,
        estimates,
        trace: trace.finish()?,
    })
}

fn is_communication_error(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<RareEventError>(),
            Some(RareEventError::Communication(_))
        )
    })
}

fn run_lane<M, C>(
    model: &M,
    settings: SubsetSettings,
    comm: C,
) -> Result<(SubsetSummary, StudyTrace)>
where
    M: Model + ?Sized,
    C: Communicator,
{
    let lane = comm.lane();
    let mut sampler = ParallelSubsetSampler::new(settings, comm)
        .with_context(|| format!("Could not create subset sampler for lane {lane}"))?;
    let gate = DecisionGate::new();
    let total = sampler.total_steps();
    let mut trace = TraceBuilder::with_capacity(sampler.num_columns(), total as usize);
    for step in 1..=total {
        run_step(&mut sampler, model, &gate, step, lane, &mut trace)?;
    }
    sampler
        .conclude()
        .with_context(|| format!("Could not close the last subset on lane {lane}"))?;
    Ok((sampler.into_summary(), trace.finish()?))
}

/// Run subset simulation with `lanes` lanes, each on its own worker thread.
pub fn run_subset_study<M: Model + ?Sized>(
    model: &M,
    settings: SubsetSettings,
    lanes: usize,
) -> Result<SubsetReport> {
    settings
        .validate(lanes)
        .context("Invalid subset simulation settings")?;

    let pool = ThreadPoolBuilder::new()
        .num_threads(lanes + 1) // One more thread because the scope owner also uses one
        .thread_name(|i| format!("subset-lane-{}", i))
        .build()
        .context("Could not start thread pool")?;

    let (results_tx, results_rx) = channel();
    pool.scope(|scope| {
        for comm in local_group(lanes) {
            let results = results_tx.clone();
            let settings = settings.clone();
            scope.spawn(move |_| {
                let lane = comm.lane();
                let outcome = run_lane(model, settings, comm);
                // The receiver outlives the scope.
                let _ = results.send((lane, outcome));
            });
        }
    });
    drop(results_tx);

    let (finished, mut errors): (Vec<_>, Vec<_>) = results_rx
        .into_iter()
        .sorted_by_key(|(lane, _)| *lane)
        .map(|(_, outcome)| outcome)
        .partition_result();
    // Peers of a failed lane fail with communication errors; report the cause.
    errors.sort_by_key(is_communication_error);
    if let Some(error) = errors.into_iter().next() {
        return Err(error.context("Subset simulation failed"));
    }
    if finished.len() != lanes {
        bail!("Only {} of {} lanes finished", finished.len(), lanes);
    }

    let (summaries, traces): (Vec<SubsetSummary>, Vec<StudyTrace>) =
        finished.into_iter().unzip();
    if let Some(lane) = summaries
        .iter()
        .position(|summary| summary.levels != summaries[0].levels)
    {
        bail!("Lane {lane} disagrees with lane 0 about the subset levels");
    }
    let Some(summary) = summaries.into_iter().next() else {
        bail!("No lane finished");
    };
    if let Some(level) = summary.levels.last() {
        info!(
            lanes,
            subsets = summary.levels.len(),
            threshold = level.threshold,
            probability = level.probability,
            "subset study finished"
        );
    }
    Ok(SubsetReport { summary, traces })
}
