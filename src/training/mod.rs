// Training module
// Live sample collection, background fitting and training history

pub mod collector;
pub mod trace;
pub mod trainer;

pub use collector::{CollectionConfig, CollectorError, SampleCollector};
pub use trace::{read_trace_file, TraceEntry, TraceError, TraceWriter, TrainingStage};
pub use trainer::{
    fit, sample_vectors, EpochReport, JobState, TrainingError, TrainingJob, TrainingManager,
    TrainingOutcome, TrainingParams, TrainingProgress,
};
