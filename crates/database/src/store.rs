//! The typed store seam shared by every agent.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    AgentLog, AgentName, DatasetRecord, LogLevel, Message, MessageRole, ModelRecord, NewDataset,
    NewModel, NewProject, Project, ProjectStatus, StatusCount, User,
};

/// Result of the conditional status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The row matched `from` and was advanced by this caller.
    Claimed,
    /// The row exists but its status no longer equals `from`.
    NotClaimed,
    /// No project with that id exists.
    NoSuchProject,
}

/// Typed access to projects, datasets, models, logs, and messages.
///
/// `advance_status` is the sole primitive used to take work; it substitutes
/// for distributed locking as long as each status has exactly one owning
/// agent.
#[async_trait]
pub trait Store: Send + Sync {
    /// Resolves a user by external auth id, inserting one if absent.
    async fn get_or_create_user(
        &self,
        external_auth_id: &str,
        email: Option<&str>,
    ) -> Result<User, StoreError>;

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    async fn get_user_by_external_id(&self, external: &str) -> Result<Option<User>, StoreError>;

    async fn insert_project(&self, input: NewProject) -> Result<Project, StoreError>;

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, StoreError>;

    async fn list_projects_by_user(&self, user_id: Uuid) -> Result<Vec<Project>, StoreError>;

    /// Candidate fetch for pollers: oldest `updated_at` first.
    async fn get_projects_by_status(
        &self,
        status: ProjectStatus,
        limit: i64,
    ) -> Result<Vec<Project>, StoreError>;

    /// Conditional status update: succeeds only if the current status equals
    /// `from`, and applies `metadata_patch` (a shallow merge) in the same
    /// update. Illegal `from → to` pairs are rejected with `Permanent`.
    async fn advance_status(
        &self,
        project_id: Uuid,
        from: ProjectStatus,
        to: ProjectStatus,
        metadata_patch: Option<Value>,
    ) -> Result<AdvanceOutcome, StoreError>;

    /// Marks a non-terminal project `failed`, recording `metadata.error`.
    async fn mark_failed(&self, project_id: Uuid, error: Value) -> Result<(), StoreError>;

    /// Shallow-merges `patch` into the project metadata map.
    async fn update_project_metadata(
        &self,
        project_id: Uuid,
        patch: Value,
    ) -> Result<(), StoreError>;

    async fn insert_dataset(&self, input: NewDataset) -> Result<DatasetRecord, StoreError>;

    async fn get_dataset_by_project(
        &self,
        project_id: Uuid,
    ) -> Result<Option<DatasetRecord>, StoreError>;

    async fn insert_model(&self, input: NewModel) -> Result<ModelRecord, StoreError>;

    async fn get_model_by_project(
        &self,
        project_id: Uuid,
    ) -> Result<Option<ModelRecord>, StoreError>;

    /// Sets the model accuracy and shallow-merges `metadata_patch`.
    async fn update_model_metrics(
        &self,
        model_id: Uuid,
        accuracy: f64,
        metadata_patch: Value,
    ) -> Result<(), StoreError>;

    async fn append_log(
        &self,
        project_id: Option<Uuid>,
        agent: AgentName,
        level: LogLevel,
        message: &str,
    ) -> Result<(), StoreError>;

    async fn list_logs(
        &self,
        project_id: Uuid,
        agent: Option<AgentName>,
        limit: i64,
    ) -> Result<Vec<AgentLog>, StoreError>;

    async fn write_message(
        &self,
        user_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<Message, StoreError>;

    async fn list_messages(&self, user_id: Uuid, limit: i64) -> Result<Vec<Message>, StoreError>;

    // Admin aggregation.

    async fn count_projects_by_status(&self) -> Result<Vec<StatusCount>, StoreError>;

    async fn count_users(&self) -> Result<i64, StoreError>;

    async fn list_recent_projects(&self, limit: i64) -> Result<Vec<Project>, StoreError>;

    async fn list_recent_users(&self, limit: i64) -> Result<Vec<User>, StoreError>;

    async fn list_recent_logs(&self, limit: i64) -> Result<Vec<AgentLog>, StoreError>;
}

/// Validates a transition pair before it reaches the database.
pub(crate) fn check_transition(
    from: ProjectStatus,
    to: ProjectStatus,
) -> Result<(), StoreError> {
    if from.can_advance_to(to) {
        Ok(())
    } else {
        Err(StoreError::Permanent(format!(
            "illegal status transition {from} -> {to}"
        )))
    }
}

/// Shallow-merges `patch` into `base` (objects only; non-objects replace).
pub(crate) fn merge_metadata(base: &mut Value, patch: &Value) {
    match (base.as_object_mut(), patch.as_object()) {
        (Some(base_map), Some(patch_map)) => {
            for (key, value) in patch_map {
                base_map.insert(key.clone(), value.clone());
            }
        }
        _ => *base = patch.clone(),
    }
}
