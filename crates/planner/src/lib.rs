//! Planner agent: converts one user utterance into a validated project plan
//! and a project row at `pending_dataset`.

pub mod api;
pub mod intent;
pub mod llm;
pub mod plan;
pub mod service;

pub use llm::{GeminiModel, PlanModel};
pub use plan::ProjectPlan;
pub use service::{PlannedProject, PlannerService};
