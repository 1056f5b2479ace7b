use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rare_event_mcmc::{
    AcceptedSample, AdaptiveImportanceSampler, AisSettings, DecisionGate, Parameter,
    ParallelSubsetSampler, SampleProducer, SingleLane, SubsetSettings,
};

fn ais_settings(dim: usize) -> AisSettings {
    AisSettings {
        parameters: (0..dim)
            .map(|i| Parameter::normal(format!("x{i}"), 0., 1.).unwrap())
            .collect(),
        proposal_std: vec![1.; dim],
        initial_values: vec![3.5; dim],
        output_limit: 3.,
        num_samples_train: 500,
        num_importance_sampling_steps: 500,
        std_factor: 1.,
        ..Default::default()
    }
}

fn subset_settings(dim: usize) -> SubsetSettings {
    SubsetSettings {
        parameters: (0..dim)
            .map(|i| Parameter::normal(format!("x{i}"), 0., 1.).unwrap())
            .collect(),
        num_samples_per_subset: 500,
        num_subsets: 2,
        ..Default::default()
    }
}

fn mean(inputs: &[f64]) -> f64 {
    inputs.iter().sum::<f64>() / inputs.len() as f64
}

fn drive<P: SampleProducer>(producer: &mut P) -> f64 {
    let gate = DecisionGate::new();
    let dim = producer.num_columns();
    let mut last = 0.;
    for step in 1..=producer.total_steps() {
        let row: Vec<f64> = (0..dim)
            .map(|column| producer.propose(step, 0, column).unwrap())
            .collect();
        let output = mean(&row);
        let accepted: AcceptedSample = gate.decide(&*producer, step, row, output);
        last = accepted.output;
        producer.record(step, 0, accepted).unwrap();
    }
    last
}

fn criterion_benchmark(c: &mut Criterion) {
    for dim in [1, 10, 100] {
        c.bench_function(&format!("importance sampler 1000 steps, dim {dim}"), |b| {
            b.iter_batched(
                || AdaptiveImportanceSampler::new(ais_settings(dim)).unwrap(),
                |mut sampler| black_box(drive(&mut sampler)),
                BatchSize::SmallInput,
            )
        });
        c.bench_function(&format!("subset sampler 1000 steps, dim {dim}"), |b| {
            b.iter_batched(
                || ParallelSubsetSampler::new(subset_settings(dim), SingleLane).unwrap(),
                |mut sampler| black_box(drive(&mut sampler)),
                BatchSize::SmallInput,
            )
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
