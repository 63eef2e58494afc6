//! Trainer service: hosts both the training agent (owns `pending_training`)
//! and the evaluation agent (owns `pending_evaluation`), each with its own
//! poller, mirroring their shared artifact handling.

pub mod api;
pub mod bundle;
pub mod eval_workflow;
pub mod predict;
pub mod train_workflow;

pub use eval_workflow::{EvaluationWorkflow, EvaluatorOptions};
pub use predict::PredictService;
pub use train_workflow::{TrainerOptions, TrainingWorkflow};
