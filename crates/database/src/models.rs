//! Database model types.

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;

/// Project lifecycle status matching the `PostgreSQL` type.
///
/// Statuses advance strictly left to right; `failed` is reachable from any
/// non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "project_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Draft,
    PendingDataset,
    PendingTraining,
    PendingEvaluation,
    Completed,
    Failed,
}

impl ProjectStatus {
    /// Returns the next status in the linear pipeline, if any.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Draft => Some(Self::PendingDataset),
            Self::PendingDataset => Some(Self::PendingTraining),
            Self::PendingTraining => Some(Self::PendingEvaluation),
            Self::PendingEvaluation => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    /// Returns true for `completed` and `failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a transition from `self` to `to` is legal.
    #[must_use]
    pub fn can_advance_to(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Self::Failed || self.next() == Some(to)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingDataset => "pending_dataset",
            Self::PendingTraining => "pending_training",
            Self::PendingEvaluation => "pending_evaluation",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ML task type matching the `PostgreSQL` type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ImageClassification,
    ObjectDetection,
    TextClassification,
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "image_classification" | "image classification" => Ok(Self::ImageClassification),
            "object_detection" | "object detection" => Ok(Self::ObjectDetection),
            "text_classification" | "text classification" => Ok(Self::TextClassification),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

/// ML framework label for plans and model rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "framework", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Framework {
    Pytorch,
    Tensorflow,
}

/// Where a dataset comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "dataset_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DatasetProvider {
    Kaggle,
    Huggingface,
}

/// Agent names as recorded in `agent_logs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "agent_name", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentName {
    Planner,
    Dataset,
    Training,
    Evaluation,
}

impl AgentName {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Dataset => "dataset",
            Self::Training => "training",
            Self::Evaluation => "evaluation",
        }
    }
}

impl std::fmt::Display for AgentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of an agent log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "log_level", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "message_role", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A user, created on first observation of its external auth id.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub external_auth_id: String,
    pub email: Option<String>,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

/// A project, the unit of work moving through the pipeline.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Project {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub task_type: TaskType,
    pub framework: Framework,
    pub dataset_source: DatasetProvider,
    pub search_keywords: Vec<String>,
    pub status: ProjectStatus,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Reads a float out of the free-form metadata map.
    #[must_use]
    pub fn metadata_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(serde_json::Value::as_f64)
    }

    /// Reads a string out of the free-form metadata map.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(serde_json::Value::as_str)
    }
}

/// Dataset archive metadata stored once the dataset agent succeeds.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DatasetRecord {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub object_uri: String,
    pub size: String,
    pub source: DatasetProvider,
    pub created_at: DateTime<Utc>,
}

/// Trained model metadata stored by the training agent.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ModelRecord {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub framework: Framework,
    pub object_uri: String,
    pub accuracy: Option<f64>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Append-only agent activity log row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AgentLog {
    pub id: Uuid,
    pub project_id: Option<Uuid>,
    pub agent_name: AgentName,
    pub message: String,
    pub log_level: LogLevel,
    pub created_at: DateTime<Utc>,
}

/// Chat message row, read by the chat surface.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Message {
    pub id: Uuid,
    pub user_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a new project record.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub user_id: Uuid,
    pub name: String,
    pub task_type: TaskType,
    pub framework: Framework,
    pub dataset_source: DatasetProvider,
    pub search_keywords: Vec<String>,
    pub status: ProjectStatus,
    pub metadata: serde_json::Value,
}

/// Input for creating a new dataset record.
#[derive(Debug, Clone)]
pub struct NewDataset {
    pub project_id: Uuid,
    pub name: String,
    pub object_uri: String,
    pub size: String,
    pub source: DatasetProvider,
}

/// Input for creating a new model record.
#[derive(Debug, Clone)]
pub struct NewModel {
    pub project_id: Uuid,
    pub name: String,
    pub framework: Framework,
    pub object_uri: String,
    pub metadata: serde_json::Value,
}

/// Per-status project counts for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatusCount {
    pub status: ProjectStatus,
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_linear_order() {
        let mut status = ProjectStatus::Draft;
        let mut seen = vec![status];
        while let Some(next) = status.next() {
            seen.push(next);
            status = next;
        }
        assert_eq!(
            seen,
            vec![
                ProjectStatus::Draft,
                ProjectStatus::PendingDataset,
                ProjectStatus::PendingTraining,
                ProjectStatus::PendingEvaluation,
                ProjectStatus::Completed,
            ]
        );
    }

    #[test]
    fn test_failed_reachable_from_non_terminal() {
        for status in [
            ProjectStatus::Draft,
            ProjectStatus::PendingDataset,
            ProjectStatus::PendingTraining,
            ProjectStatus::PendingEvaluation,
        ] {
            assert!(status.can_advance_to(ProjectStatus::Failed));
        }
        assert!(!ProjectStatus::Completed.can_advance_to(ProjectStatus::Failed));
        assert!(!ProjectStatus::Failed.can_advance_to(ProjectStatus::Failed));
    }

    #[test]
    fn test_no_backward_or_skipping_transitions() {
        assert!(!ProjectStatus::PendingTraining.can_advance_to(ProjectStatus::PendingDataset));
        assert!(!ProjectStatus::PendingDataset.can_advance_to(ProjectStatus::PendingEvaluation));
        assert!(!ProjectStatus::PendingDataset.can_advance_to(ProjectStatus::Completed));
        assert!(ProjectStatus::PendingDataset.can_advance_to(ProjectStatus::PendingTraining));
    }

    #[test]
    fn test_task_type_parsing() {
        assert_eq!(
            "image_classification".parse::<TaskType>(),
            Ok(TaskType::ImageClassification)
        );
        assert!("time_series".parse::<TaskType>().is_err());
    }
}
