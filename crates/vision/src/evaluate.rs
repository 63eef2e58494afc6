//! Scoring: top-1 accuracy, macro precision/recall/F1, per-class report.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::dataset::{decode_image_bytes, DecodedImage, ImageBatcher, ImageFolderDataset};
use crate::error::VisionError;
use crate::models::ImageClassifier;

/// Per-class precision/recall/F1 with support counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassReport {
    pub class: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// The full evaluation result stored into model metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub accuracy: f64,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    pub num_classes: usize,
    pub per_class: Vec<ClassReport>,
}

impl EvaluationReport {
    /// The metadata payload persisted on the model row.
    #[must_use]
    pub fn to_metadata(&self) -> serde_json::Value {
        serde_json::json!({ "evaluation": self })
    }
}

/// Scores the model over a split.
///
/// # Errors
///
/// Returns `EmptyDataset` if the split yields no decodable images.
pub fn evaluate<B: Backend>(
    model: &ImageClassifier<B>,
    dataset: &ImageFolderDataset,
    batch_size: usize,
    device: &B::Device,
) -> Result<EvaluationReport, VisionError> {
    let batcher = ImageBatcher::<B>::new(device.clone(), dataset.image_size());
    let num_classes = model.num_classes();

    let mut truths: Vec<usize> = Vec::with_capacity(dataset.len());
    let mut predictions: Vec<usize> = Vec::with_capacity(dataset.len());

    let indices: Vec<usize> = (0..dataset.len()).collect();
    for chunk in indices.chunks(batch_size.max(1)) {
        let items: Vec<DecodedImage> = dataset.load_many(chunk);
        if items.is_empty() {
            continue;
        }

        truths.extend(items.iter().map(|item| item.label));

        let batch = batcher.batch(&items);
        let logits = model.forward(batch.images);
        let rows: Vec<f32> = logits.into_data().to_vec().unwrap_or_default();
        predictions.extend(argmax_rows(&rows, num_classes));
    }

    if truths.is_empty() {
        return Err(VisionError::EmptyDataset(
            "no decodable images to score".to_string(),
        ));
    }

    Ok(build_report(
        &truths,
        &predictions,
        dataset.classes(),
        num_classes,
    ))
}

/// Classifies one in-memory image, returning the label and softmax confidence.
///
/// # Errors
///
/// Returns `Decode` for unreadable bytes.
pub fn predict_bytes<B: Backend>(
    model: &ImageClassifier<B>,
    bytes: &[u8],
    image_size: usize,
    classes: &[String],
    device: &B::Device,
) -> Result<(String, f64), VisionError> {
    let pixels = decode_image_bytes(bytes, image_size)?;
    let input = Tensor::<B, 1>::from_floats(pixels.as_slice(), device).reshape([
        1,
        3,
        image_size,
        image_size,
    ]);

    let logits = model.forward(input);
    let rows: Vec<f32> = logits.into_data().to_vec().unwrap_or_default();
    let probabilities = softmax_row(&rows);

    let (index, confidence) = probabilities
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, p)| (i, f64::from(*p)))
        .unwrap_or((0, 0.0));

    let label = classes
        .get(index)
        .cloned()
        .unwrap_or_else(|| format!("class{index}"));
    Ok((label, confidence))
}

/// Argmax per row over a flat `[rows * num_classes]` logits buffer.
#[must_use]
pub fn argmax_rows(logits: &[f32], num_classes: usize) -> Vec<usize> {
    if num_classes == 0 {
        return Vec::new();
    }
    logits
        .chunks(num_classes)
        .map(|row| {
            row.iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map_or(0, |(i, _)| i)
        })
        .collect()
}

fn softmax_row(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = row.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 {
        exps.into_iter().map(|v| v / sum).collect()
    } else {
        vec![0.0; row.len()]
    }
}

fn build_report(
    truths: &[usize],
    predictions: &[usize],
    classes: &[String],
    num_classes: usize,
) -> EvaluationReport {
    let mut true_positive = vec![0usize; num_classes];
    let mut false_positive = vec![0usize; num_classes];
    let mut false_negative = vec![0usize; num_classes];
    let mut support = vec![0usize; num_classes];
    let mut correct = 0usize;

    for (&truth, &prediction) in truths.iter().zip(predictions) {
        support[truth] += 1;
        if truth == prediction {
            true_positive[truth] += 1;
            correct += 1;
        } else {
            false_positive[prediction] += 1;
            false_negative[truth] += 1;
        }
    }

    let mut per_class = Vec::with_capacity(num_classes);
    for index in 0..num_classes {
        let precision = ratio(
            true_positive[index],
            true_positive[index] + false_positive[index],
        );
        let recall = ratio(
            true_positive[index],
            true_positive[index] + false_negative[index],
        );
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        per_class.push(ClassReport {
            class: classes
                .get(index)
                .cloned()
                .unwrap_or_else(|| format!("class{index}")),
            precision,
            recall,
            f1,
            support: support[index],
        });
    }

    let macro_precision = mean(per_class.iter().map(|c| c.precision));
    let macro_recall = mean(per_class.iter().map(|c| c.recall));
    let macro_f1 = mean(per_class.iter().map(|c| c.f1));

    EvaluationReport {
        accuracy: ratio(correct, truths.len()),
        macro_precision,
        macro_recall,
        macro_f1,
        num_classes,
        per_class,
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let collected: Vec<f64> = values.collect();
    if collected.is_empty() {
        0.0
    } else {
        collected.iter().sum::<f64>() / collected.len() as f64
    }
}
