//! Training support for [`model::Graph2Text`]: experiment configuration,
//! label-smoothed loss, the Noam learning-rate schedule, AdamW and a
//! single-step trainer.

pub mod config;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use config::{
    ExperimentConfig, LossSection, ModelSection, OptimizerSection, Precision, SchedulerSection,
    TrainingError,
};
pub use loss::{CrossEntropyLoss, LossMetrics, LossOutput, PAD_ID};
pub use metrics::{EvaluationMetrics, EvaluationSummary, StepSnapshot, TrainingMetrics};
pub use optimizer::{AdamW, AdamWConfig};
pub use scheduler::{build_scheduler, LRScheduler, NoamSchedule};
pub use trainer::Trainer;
