//! Database crate for the AutoML orchestrator.
//!
//! Provides connection pooling, embedded migrations, typed model structs,
//! and the `Store` seam every agent talks through. `advance_status` is the
//! single coordination primitive: a conditional update that either claims a
//! status transition or reports that another worker got there first.

mod error;
mod memory;
mod models;
mod pg;
mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use models::{
    AgentLog, AgentName, DatasetProvider, DatasetRecord, Framework, LogLevel, Message,
    MessageRole, ModelRecord, NewDataset, NewModel, NewProject, Project, ProjectStatus,
    StatusCount, TaskType, User,
};
pub use pg::{create_pool, run_migrations, PgStore};
pub use store::{AdvanceOutcome, Store};
