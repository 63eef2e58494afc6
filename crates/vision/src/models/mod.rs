//! Classifier assembly: a feature extractor plus a fresh linear head.

mod efficientnet;
mod mobilenet;
mod resnet;

use std::path::Path;

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};

pub use efficientnet::EfficientNetB0;
pub use mobilenet::MobileNetV2;
pub use resnet::ResNet;

use crate::architecture::Architecture;
use crate::error::VisionError;

/// Backbone feature extractor, selected by the plan's `preferred_model`.
///
/// Saved pretrained records cover the backbone only, so they load
/// independently of the classifier head's size.
#[derive(Module, Debug)]
pub enum Features<B: Backend> {
    ResNet(ResNet<B>),
    MobileNet(MobileNetV2<B>),
    EfficientNet(EfficientNetB0<B>),
}

impl<B: Backend> Features<B> {
    pub fn new(architecture: Architecture, device: &B::Device) -> Self {
        match architecture {
            Architecture::Resnet18 => Self::ResNet(ResNet::resnet18(device)),
            Architecture::Resnet34 => Self::ResNet(ResNet::resnet34(device)),
            Architecture::Resnet50 => Self::ResNet(ResNet::resnet50(device)),
            Architecture::MobilenetV2 => Self::MobileNet(MobileNetV2::new(device)),
            Architecture::EfficientnetB0 => Self::EfficientNet(EfficientNetB0::new(device)),
        }
    }

    #[must_use]
    pub fn out_features(&self) -> usize {
        match self {
            Self::ResNet(net) => net.out_features(),
            Self::MobileNet(net) => net.out_features(),
            Self::EfficientNet(net) => net.out_features(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            Self::ResNet(net) => net.forward(input),
            Self::MobileNet(net) => net.forward(input),
            Self::EfficientNet(net) => net.forward(input),
        }
    }
}

/// An image classifier: backbone features with a linear head sized to the
/// dataset's class count.
#[derive(Module, Debug)]
pub struct ImageClassifier<B: Backend> {
    features: Features<B>,
    head: Linear<B>,
    num_classes: usize,
}

impl<B: Backend> ImageClassifier<B> {
    /// Builds a fresh classifier for the architecture and class count.
    pub fn new(architecture: Architecture, num_classes: usize, device: &B::Device) -> Self {
        let features = Features::new(architecture, device);
        let head = LinearConfig::new(features.out_features(), num_classes).init(device);
        Self {
            features,
            head,
            num_classes,
        }
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Logits of shape `[batch, num_classes]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.features.forward(images);
        self.head.forward(features)
    }

    /// Loads pretrained backbone weights, keeping the fresh head.
    ///
    /// # Errors
    ///
    /// Returns `Checkpoint` if the record fails to load or belongs to a
    /// different architecture.
    pub fn load_pretrained_features(
        mut self,
        path: &Path,
        device: &B::Device,
    ) -> Result<Self, VisionError> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.features = self
            .features
            .load_file(path, &recorder, device)
            .map_err(|e| VisionError::Checkpoint(format!("failed to load pretrained features: {e}")))?;
        Ok(self)
    }

    /// Saves the full classifier as a MessagePack record.
    ///
    /// # Errors
    ///
    /// Returns `Checkpoint` if the record cannot be written.
    pub fn save_weights(&self, path: &Path) -> Result<(), VisionError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.clone()
            .save_file(path, &recorder)
            .map_err(|e| VisionError::Checkpoint(format!("failed to save weights: {e}")))
    }

    /// Rebuilds a classifier from saved weights.
    ///
    /// # Errors
    ///
    /// Returns `Checkpoint` if the record fails to load.
    pub fn load_weights(
        architecture: Architecture,
        num_classes: usize,
        path: &Path,
        device: &B::Device,
    ) -> Result<Self, VisionError> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        Self::new(architecture, num_classes, device)
            .load_file(path, &recorder, device)
            .map_err(|e| VisionError::Checkpoint(format!("failed to load weights: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::NdArray;

    use super::*;

    type TestBackend = NdArray;

    #[test]
    fn test_forward_shapes_small_input() {
        let device = NdArrayDevice::default();
        for architecture in [Architecture::Resnet18, Architecture::MobilenetV2] {
            let model: ImageClassifier<TestBackend> =
                ImageClassifier::new(architecture, 4, &device);
            let input = Tensor::<TestBackend, 4>::zeros([2, 3, 64, 64], &device);
            let output = model.forward(input);
            assert_eq!(output.dims(), [2, 4], "{architecture}");
        }
    }

    #[test]
    fn test_efficientnet_forward_shape() {
        let device = NdArrayDevice::default();
        let model: ImageClassifier<TestBackend> =
            ImageClassifier::new(Architecture::EfficientnetB0, 3, &device);
        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 64, 64], &device);
        assert_eq!(model.forward(input).dims(), [1, 3]);
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let device = NdArrayDevice::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.mpk");

        let model: ImageClassifier<TestBackend> =
            ImageClassifier::new(Architecture::Resnet18, 5, &device);
        model.save_weights(&path).unwrap();

        let reloaded: ImageClassifier<TestBackend> =
            ImageClassifier::load_weights(Architecture::Resnet18, 5, &path, &device).unwrap();
        assert_eq!(reloaded.num_classes(), 5);

        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 64, 64], &device);
        let a = model.forward(input.clone()).into_data().to_vec::<f32>().unwrap();
        let b = reloaded.forward(input).into_data().to_vec::<f32>().unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }
    }
}
