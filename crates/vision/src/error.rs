//! Vision crate errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VisionError {
    /// The extracted archive does not match the expected image-folder layout.
    #[error("bad dataset layout: {0}")]
    BadLayout(String),

    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("no trainable samples: {0}")]
    EmptyDataset(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("image decode failed for {path}: {source}")]
    Decode {
        path: String,
        source: image::ImageError,
    },

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
