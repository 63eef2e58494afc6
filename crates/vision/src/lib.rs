//! Vision crate: burn classifier zoo, image-folder datasets, training, and
//! evaluation for the AutoML pipeline.
//!
//! The training agent drives `layout` → `dataset` → `models` → `training`;
//! the evaluation agent reuses `models` and `evaluate`.

mod architecture;
mod dataset;
mod error;
mod evaluate;
pub mod layout;
mod models;
mod training;

pub use architecture::Architecture;
pub use dataset::{
    decode_image, decode_image_bytes, ClassificationBatch, DecodedImage, ImageBatcher,
    ImageFolderDataset, ImageItem, IMAGENET_MEAN, IMAGENET_STD,
};
pub use error::VisionError;
pub use evaluate::{argmax_rows, evaluate, predict_bytes, ClassReport, EvaluationReport};
pub use layout::{prepare_layout, unzip_archive, DatasetLayout};
pub use models::{EfficientNetB0, Features, ImageClassifier, MobileNetV2, ResNet};
pub use training::{train, EpochStats, TrainingConfig, TrainingOutput};
