//! Training loop for image classifiers.

use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::dataset::{ImageBatcher, ImageFolderDataset};
use crate::error::VisionError;
use crate::evaluate::argmax_rows;
use crate::models::ImageClassifier;

/// Configuration for training a classifier.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Number of training epochs.
    #[config(default = 10)]
    pub epochs: usize,
    /// Learning rate for the Adam optimizer.
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    /// Batch size for training.
    #[config(default = 32)]
    pub batch_size: usize,
    /// Square edge length images are resized to.
    #[config(default = 224)]
    pub image_size: usize,
}

/// Losses observed for one epoch.
#[derive(Debug, Clone)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

/// Output from training.
#[derive(Debug, Clone)]
pub struct TrainingOutput {
    pub final_train_loss: f64,
    pub final_val_loss: f64,
    pub epochs_completed: usize,
    pub history: Vec<EpochStats>,
}

/// Trains the model, reporting per-epoch stats through `on_epoch`.
///
/// Train batches are shuffled with an epoch-seeded deterministic shuffle;
/// validation runs unshuffled after every epoch.
///
/// # Errors
///
/// Returns `EmptyDataset` if the training split has no decodable images.
pub fn train<B: AutodiffBackend>(
    mut model: ImageClassifier<B>,
    train_dataset: &ImageFolderDataset,
    val_dataset: &ImageFolderDataset,
    config: &TrainingConfig,
    device: &B::Device,
    mut on_epoch: impl FnMut(&EpochStats),
) -> Result<(ImageClassifier<B>, TrainingOutput), VisionError> {
    if train_dataset.is_empty() {
        return Err(VisionError::EmptyDataset(
            "training split is empty".to_string(),
        ));
    }

    let batcher = ImageBatcher::<B>::new(device.clone(), config.image_size);
    let loss_fn = CrossEntropyLossConfig::new().init(device);
    let mut optimizer = AdamConfig::new().init();

    let num_samples = train_dataset.len();
    let mut history = Vec::with_capacity(config.epochs);
    let mut final_train_loss = 0.0f64;
    let mut final_val_loss = 0.0f64;

    for epoch in 1..=config.epochs {
        let mut indices: Vec<usize> = (0..num_samples).collect();
        shuffle_indices(&mut indices, epoch as u64);

        let mut epoch_loss = 0.0f64;
        let mut batch_count = 0usize;

        for chunk in indices.chunks(config.batch_size.max(1)) {
            let items = train_dataset.load_many(chunk);
            if items.is_empty() {
                continue;
            }

            let batch = batcher.batch(&items);
            let logits = model.forward(batch.images);
            let loss = loss_fn.forward(logits, batch.targets);

            let loss_value: f32 = loss
                .clone()
                .into_data()
                .to_vec()
                .unwrap_or_else(|_| vec![0.0])
                .first()
                .copied()
                .unwrap_or(0.0);
            epoch_loss += f64::from(loss_value);
            batch_count += 1;

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(config.learning_rate, model, grads);
        }

        if batch_count == 0 {
            return Err(VisionError::EmptyDataset(
                "no decodable training batches".to_string(),
            ));
        }

        final_train_loss = epoch_loss / batch_count as f64;
        let (val_loss, val_accuracy) = validate(&model, val_dataset, &batcher, config);
        final_val_loss = val_loss;

        let stats = EpochStats {
            epoch,
            train_loss: final_train_loss,
            val_loss,
            val_accuracy,
        };
        on_epoch(&stats);
        history.push(stats);
    }

    Ok((
        model,
        TrainingOutput {
            final_train_loss,
            final_val_loss,
            epochs_completed: config.epochs,
            history,
        },
    ))
}

/// Computes validation loss and top-1 accuracy.
fn validate<B: AutodiffBackend>(
    model: &ImageClassifier<B>,
    dataset: &ImageFolderDataset,
    batcher: &ImageBatcher<B>,
    config: &TrainingConfig,
) -> (f64, f64) {
    let loss_fn = CrossEntropyLossConfig::new().init(batcher.device());
    let mut total_loss = 0.0f64;
    let mut batch_count = 0usize;
    let mut correct = 0usize;
    let mut total = 0usize;

    let indices: Vec<usize> = (0..dataset.len()).collect();
    for chunk in indices.chunks(config.batch_size.max(1)) {
        let items = dataset.load_many(chunk);
        if items.is_empty() {
            continue;
        }

        let labels: Vec<usize> = items.iter().map(|item| item.label).collect();
        let batch = batcher.batch(&items);
        let logits = model.forward(batch.images);

        let loss = loss_fn.forward(logits.clone(), batch.targets);
        let loss_value: f32 = loss
            .into_data()
            .to_vec()
            .unwrap_or_else(|_| vec![0.0])
            .first()
            .copied()
            .unwrap_or(0.0);
        total_loss += f64::from(loss_value);
        batch_count += 1;

        let num_classes = model.num_classes();
        let rows: Vec<f32> = logits.into_data().to_vec().unwrap_or_default();
        for (prediction, label) in argmax_rows(&rows, num_classes).into_iter().zip(labels) {
            if prediction == label {
                correct += 1;
            }
            total += 1;
        }
    }

    let loss = if batch_count > 0 {
        total_loss / batch_count as f64
    } else {
        0.0
    };
    let accuracy = if total > 0 {
        correct as f64 / total as f64
    } else {
        0.0
    };
    (loss, accuracy)
}

/// Weyl increment for the splitmix64 stream below.
const SHUFFLE_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// Shuffles indices with a Fisher-Yates pass over a splitmix64 stream.
///
/// Seeded per epoch, so every epoch sees a different but reproducible
/// batch order without pulling in an RNG dependency.
fn shuffle_indices(indices: &mut [usize], seed: u64) {
    let mut state = seed;
    for i in (1..indices.len()).rev() {
        state = state.wrapping_add(SHUFFLE_GAMMA);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        let j = (z % (i as u64 + 1)) as usize;
        indices.swap(i, j);
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::{Autodiff, NdArray};

    use super::*;
    use crate::architecture::Architecture;
    use crate::layout::test_support::write_micro_dataset;

    type TestBackend = Autodiff<NdArray>;

    #[test]
    fn test_shuffle_preserves_elements() {
        let mut indices: Vec<usize> = (0..32).collect();
        let original = indices.clone();

        shuffle_indices(&mut indices, 7);
        assert_ne!(indices, original);

        indices.sort_unstable();
        assert_eq!(indices, original);
    }

    #[test]
    fn test_shuffle_is_seed_deterministic() {
        let mut a: Vec<usize> = (0..32).collect();
        let mut b: Vec<usize> = (0..32).collect();
        shuffle_indices(&mut a, 3);
        shuffle_indices(&mut b, 3);
        assert_eq!(a, b);
    }

    #[test]
    fn test_training_runs_and_reports_epochs() {
        let dir = tempfile::tempdir().unwrap();
        write_micro_dataset(&dir.path().join("train"), &["a", "b"], 3);
        write_micro_dataset(&dir.path().join("val"), &["a", "b"], 1);

        let train_dataset = ImageFolderDataset::from_dir(&dir.path().join("train"), 32).unwrap();
        let val_dataset = ImageFolderDataset::from_dir(&dir.path().join("val"), 32).unwrap();

        let device = NdArrayDevice::default();
        let model: ImageClassifier<TestBackend> =
            ImageClassifier::new(Architecture::Resnet18, 2, &device);

        let config = TrainingConfig::new()
            .with_epochs(2)
            .with_batch_size(4)
            .with_image_size(32);

        let mut epochs_seen = Vec::new();
        let (_model, output) = train(
            model,
            &train_dataset,
            &val_dataset,
            &config,
            &device,
            |stats| epochs_seen.push(stats.epoch),
        )
        .unwrap();

        assert_eq!(output.epochs_completed, 2);
        assert_eq!(epochs_seen, vec![1, 2]);
        assert!(output.final_train_loss.is_finite());
    }
}
