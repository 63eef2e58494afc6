//! Object store adapter.
//!
//! Parses bucket-scoped object URIs, enforces a bucket allow-list, and wraps
//! the `object_store` backends with retrying downloads, verified uploads,
//! and streaming reads for gateway pass-through.

mod adapter;
mod uri;

pub use adapter::{ObjectStorage, RetryPolicy};
pub use uri::ObjectUri;

use thiserror::Error;

/// Errors surfaced by the object store adapter.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object URI: {0}")]
    InvalidUri(String),

    #[error("bucket not allowed: {0}")]
    BucketNotAllowed(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("upload verification failed for {uri}: {detail}")]
    VerifyFailed { uri: String, detail: String },

    #[error("object store failure: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether the operation is worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Io(_))
    }
}
