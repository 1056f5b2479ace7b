use crate::producer::{AcceptedSample, SampleProducer};

/// Accepts or rejects a proposed sample once the model output is known.
///
/// The limit and fallback come from the producer: a proposal whose output
/// (or absolute output) reaches the producer's current acceptance limit is
/// published as is, anything else is replaced by the producer's fallback
/// sample. Without a limit or without a fallback every proposal is accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionGate;

impl DecisionGate {
    pub fn new() -> Self {
        Self
    }

    pub fn decide<P>(
        &self,
        producer: &P,
        step: u64,
        proposed: Vec<f64>,
        output: f64,
    ) -> AcceptedSample
    where
        P: SampleProducer + ?Sized,
    {
        let ranked = if producer.use_absolute_value() {
            output.abs()
        } else {
            output
        };
        let passes = producer
            .acceptance_limit(step)
            .map_or(true, |limit| ranked >= limit);
        match producer.fallback() {
            Some(fallback) if !passes => fallback.clone(),
            _ => AcceptedSample::new(proposed, output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use pretty_assertions::assert_eq;

    struct Fixed {
        limit: Option<f64>,
        absolute: bool,
        fallback: Option<AcceptedSample>,
    }

    impl SampleProducer for Fixed {
        fn num_columns(&self) -> usize {
            1
        }

        fn total_steps(&self) -> u64 {
            10
        }

        fn propose(&mut self, _step: u64, _lane: usize, _column: usize) -> Result<f64> {
            Ok(0.)
        }

        fn acceptance_limit(&self, _step: u64) -> Option<f64> {
            self.limit
        }

        fn use_absolute_value(&self) -> bool {
            self.absolute
        }

        fn fallback(&self) -> Option<&AcceptedSample> {
            self.fallback.as_ref()
        }

        fn record(&mut self, _step: u64, _lane: usize, _accepted: AcceptedSample) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn below_limit_falls_back() {
        let previous = AcceptedSample::new(vec![3.2], 3.2);
        let producer = Fixed {
            limit: Some(3.),
            absolute: false,
            fallback: Some(previous.clone()),
        };
        let gate = DecisionGate::new();
        assert_eq!(gate.decide(&producer, 5, vec![1.], 1.), previous);
        assert_eq!(
            gate.decide(&producer, 5, vec![3.5], 3.5),
            AcceptedSample::new(vec![3.5], 3.5)
        );
        assert_eq!(
            gate.decide(&producer, 5, vec![3.], 3.),
            AcceptedSample::new(vec![3.], 3.)
        );
    }

    #[test]
    fn absolute_value_mode_ranks_magnitudes() {
        let producer = Fixed {
            limit: Some(2.),
            absolute: true,
            fallback: Some(AcceptedSample::new(vec![0.], 0.)),
        };
        let accepted = DecisionGate::new().decide(&producer, 2, vec![-2.5], -2.5);
        assert_eq!(accepted, AcceptedSample::new(vec![-2.5], -2.5));
    }

    #[test]
    fn no_limit_or_no_fallback_accepts() {
        let gate = DecisionGate::new();
        let unlimited = Fixed {
            limit: None,
            absolute: false,
            fallback: Some(AcceptedSample::new(vec![9.], 9.)),
        };
        assert_eq!(
            gate.decide(&unlimited, 3, vec![0.1], -4.),
            AcceptedSample::new(vec![0.1], -4.)
        );
        let first = Fixed {
            limit: Some(3.),
            absolute: false,
            fallback: None,
        };
        assert_eq!(
            gate.decide(&first, 1, vec![0.], 0.),
            AcceptedSample::new(vec![0.], 0.)
        );
    }
}
