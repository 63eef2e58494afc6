//! Dataset agent: claims `pending_dataset` projects, finds and downloads a
//! suitable archive, uploads it, and advances the project to
//! `pending_training`.

pub mod api;
pub mod kaggle;
pub mod source;
pub mod workflow;

pub use kaggle::KaggleClient;
pub use source::{DatasetHit, DatasetSource, SourceError};
pub use workflow::{DatasetAgentOptions, DatasetWorkflow};
