//! Workflow error taxonomy shared by every agent.

use database::StoreError;
use serde::{Deserialize, Serialize};
use storage::StorageError;
use thiserror::Error;

/// The closed set of error categories a workflow step can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    NotFound,
    Conflict,
    InputEmpty,
    InputInvalid,
    PlanInvalid,
    BadDatasetLayout,
    NoCandidate,
    ResourceExhausted,
    Timeout,
    Dependency,
    Integrity,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::InputEmpty => "input_empty",
            Self::InputInvalid => "input_invalid",
            Self::PlanInvalid => "plan_invalid",
            Self::BadDatasetLayout => "bad_dataset_layout",
            Self::NoCandidate => "no_candidate",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Timeout => "timeout",
            Self::Dependency => "dependency",
            Self::Integrity => "integrity",
        }
    }

    /// HTTP status the gateway and agent APIs map this kind to.
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::InputEmpty | Self::InputInvalid | Self::PlanInvalid => 400,
            Self::NotFound => 404,
            Self::Conflict => 409,
            _ => 500,
        }
    }

    /// Whether the outer workflow should mark the project `failed`.
    ///
    /// `conflict` means another worker advanced the row; `integrity` means
    /// the artifact exists and only the status flip is missing. Neither may
    /// destroy the project.
    #[must_use]
    pub const fn fails_project(self) -> bool {
        !matches!(self, Self::Conflict | Self::Integrity)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A categorized workflow failure, tagged with the step that produced it.
#[derive(Debug, Clone, Error)]
#[error("{kind} at {step}: {detail}")]
pub struct WorkflowError {
    pub kind: ErrorKind,
    pub step: &'static str,
    pub detail: String,
}

impl WorkflowError {
    #[must_use]
    pub fn new(kind: ErrorKind, step: &'static str, detail: impl Into<String>) -> Self {
        Self {
            kind,
            step,
            detail: detail.into(),
        }
    }

    /// Maps a store error, keeping the step tag.
    #[must_use]
    pub fn from_store(step: &'static str, err: StoreError) -> Self {
        let kind = match err {
            StoreError::Transient(_) => ErrorKind::Transient,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Conflict(_) => ErrorKind::Conflict,
            StoreError::Permanent(_) => ErrorKind::Dependency,
        };
        Self::new(kind, step, err.to_string())
    }

    /// Maps an object store error, keeping the step tag.
    #[must_use]
    pub fn from_storage(step: &'static str, err: StorageError) -> Self {
        let kind = match err {
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::InvalidUri(_) | StorageError::BucketNotAllowed(_) => {
                ErrorKind::InputInvalid
            }
            _ => ErrorKind::Dependency,
        };
        Self::new(kind, step, err.to_string())
    }

    /// The `metadata.error` payload persisted on failure.
    #[must_use]
    pub fn to_metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind.as_str(),
            "detail": self.detail,
            "step": self.step,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(ErrorKind::BadDatasetLayout).unwrap(),
            serde_json::json!("bad_dataset_layout")
        );
    }

    #[test]
    fn test_metadata_payload_shape() {
        let err = WorkflowError::new(ErrorKind::NoCandidate, "search", "nothing under cap");
        let meta = err.to_metadata();
        assert_eq!(meta["kind"], "no_candidate");
        assert_eq!(meta["step"], "search");
    }

    #[test]
    fn test_conflict_and_integrity_do_not_fail_project() {
        assert!(!ErrorKind::Conflict.fails_project());
        assert!(!ErrorKind::Integrity.fails_project());
        assert!(ErrorKind::Timeout.fails_project());
        assert!(ErrorKind::NoCandidate.fails_project());
    }
}
