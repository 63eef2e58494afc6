//! Configuration crate for the AutoML orchestrator services.

mod config;

pub use config::{Config, StorageBackend};
