pub(crate) mod ais;
pub(crate) mod comm;
pub(crate) mod decision;
pub(crate) mod distribution;
pub(crate) mod error;
pub mod math;
pub(crate) mod producer;
pub(crate) mod rng;
pub(crate) mod statistics;
pub(crate) mod study;
pub(crate) mod subset;
pub(crate) mod trace;

pub use ais::{AdaptiveImportanceSampler, AisSettings, ImportanceDistribution};
pub use comm::{local_group, Communicator, LocalLane, SingleLane};
pub use decision::DecisionGate;
pub use distribution::{DistributionKind, Parameter, ParameterSpec};
pub use error::{RareEventError, Result};
pub use producer::{AcceptedSample, SampleProducer, StepGuard};
pub use rng::StepRng;
pub use statistics::{ImportanceStatistics, PfEstimate};
pub use study::{run_importance_study, run_subset_study, ImportanceReport, Model, SubsetReport};
pub use subset::{ParallelSubsetSampler, SeedCursor, SubsetLevel, SubsetSettings, SubsetSummary};
pub use trace::{StudyTrace, TraceBuilder};
