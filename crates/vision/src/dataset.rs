//! Image-folder dataset and batching.

use std::path::{Path, PathBuf};

use burn::prelude::*;
use image::imageops::FilterType;
use tracing::warn;

use crate::error::VisionError;
use crate::layout::{is_image_file, sorted_class_dirs};

/// ImageNet channel statistics used for normalization.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// One labelled image on disk.
#[derive(Debug, Clone)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

/// A decoded image as a flat CHW float vector plus its label.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub pixels: Vec<f32>,
    pub label: usize,
}

/// A split directory of class subdirectories, torchvision-ImageFolder style.
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    items: Vec<ImageItem>,
    classes: Vec<String>,
    image_size: usize,
}

impl ImageFolderDataset {
    /// Scans `split_dir` for class subdirectories of image files.
    ///
    /// Class indices follow the sorted class-name order, so they are stable
    /// across splits and across runs.
    ///
    /// # Errors
    ///
    /// Returns `EmptyDataset` if no class directory contains an image.
    pub fn from_dir(split_dir: &Path, image_size: usize) -> Result<Self, VisionError> {
        let classes = sorted_class_dirs(split_dir)?;
        let mut items = Vec::new();

        for (label, class) in classes.iter().enumerate() {
            let class_dir = split_dir.join(class);
            let mut files: Vec<PathBuf> = std::fs::read_dir(&class_dir)?
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| is_image_file(path))
                .collect();
            files.sort();
            items.extend(files.into_iter().map(|path| ImageItem { path, label }));
        }

        if items.is_empty() {
            return Err(VisionError::EmptyDataset(format!(
                "no images under {}",
                split_dir.display()
            )));
        }

        Ok(Self {
            items,
            classes,
            image_size,
        })
    }

    #[must_use]
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    #[must_use]
    pub fn image_size(&self) -> usize {
        self.image_size
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Decodes, resizes, and normalizes one image.
    ///
    /// # Errors
    ///
    /// Returns `Decode` if the file cannot be read as an image.
    pub fn load(&self, index: usize) -> Result<DecodedImage, VisionError> {
        let item = &self.items[index];
        let pixels = decode_image(&item.path, self.image_size)?;
        Ok(DecodedImage {
            pixels,
            label: item.label,
        })
    }

    /// Loads a batch of indices, skipping undecodable files with a warning.
    #[must_use]
    pub fn load_many(&self, indices: &[usize]) -> Vec<DecodedImage> {
        indices
            .iter()
            .filter_map(|&index| match self.load(index) {
                Ok(decoded) => Some(decoded),
                Err(err) => {
                    warn!(index, error = %err, "Skipping undecodable image");
                    None
                }
            })
            .collect()
    }
}

/// Decodes an image file into a normalized flat CHW vector.
///
/// # Errors
///
/// Returns `Decode` if the file cannot be read as an image.
pub fn decode_image(path: &Path, image_size: usize) -> Result<Vec<f32>, VisionError> {
    let img = image::open(path).map_err(|source| VisionError::Decode {
        path: path.display().to_string(),
        source,
    })?;
    Ok(normalize_rgb(&img, image_size))
}

/// Decodes raw image bytes (gateway test uploads) the same way.
///
/// # Errors
///
/// Returns `Decode` if the bytes are not a readable image.
pub fn decode_image_bytes(bytes: &[u8], image_size: usize) -> Result<Vec<f32>, VisionError> {
    let img = image::load_from_memory(bytes).map_err(|source| VisionError::Decode {
        path: "<memory>".to_string(),
        source,
    })?;
    Ok(normalize_rgb(&img, image_size))
}

fn normalize_rgb(img: &image::DynamicImage, image_size: usize) -> Vec<f32> {
    let size = u32::try_from(image_size).unwrap_or(u32::MAX);
    let resized = img
        .resize_exact(size, size, FilterType::Triangle)
        .to_rgb8();

    let plane = image_size * image_size;
    let mut pixels = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in resized.enumerate_pixels() {
        let offset = y as usize * image_size + x as usize;
        for channel in 0..3 {
            let value = f32::from(pixel.0[channel]) / 255.0;
            pixels[channel * plane + offset] =
                (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
        }
    }
    pixels
}

/// A batch of images and integer targets.
#[derive(Debug, Clone)]
pub struct ClassificationBatch<B: Backend> {
    /// Shape `[batch, 3, size, size]`.
    pub images: Tensor<B, 4>,
    /// Shape `[batch]`.
    pub targets: Tensor<B, 1, Int>,
}

/// Batcher turning decoded images into tensors on a device.
#[derive(Debug, Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> ImageBatcher<B> {
    #[must_use]
    pub const fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }

    #[must_use]
    pub const fn device(&self) -> &B::Device {
        &self.device
    }

    /// Creates a batch from decoded images. Panics on an empty input batch;
    /// callers filter empties first.
    pub fn batch(&self, items: &[DecodedImage]) -> ClassificationBatch<B> {
        let batch_size = items.len();
        let plane = 3 * self.image_size * self.image_size;

        let mut image_data = Vec::with_capacity(batch_size * plane);
        let mut target_data = Vec::with_capacity(batch_size);
        for item in items {
            image_data.extend_from_slice(&item.pixels);
            target_data.push(item.label as i32);
        }

        let images = Tensor::<B, 1>::from_floats(image_data.as_slice(), &self.device).reshape([
            batch_size,
            3,
            self.image_size,
            self.image_size,
        ]);
        let targets = Tensor::<B, 1, Int>::from_ints(target_data.as_slice(), &self.device);

        ClassificationBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::NdArray;

    use super::*;
    use crate::layout::test_support::write_micro_dataset;

    type TestBackend = NdArray;

    #[test]
    fn test_dataset_scan_assigns_sorted_labels() {
        let dir = tempfile::tempdir().unwrap();
        write_micro_dataset(dir.path(), &["rose", "daisy"], 3);

        let dataset = ImageFolderDataset::from_dir(dir.path(), 32).unwrap();
        assert_eq!(dataset.classes(), ["daisy", "rose"]);
        assert_eq!(dataset.len(), 6);

        let first = dataset.load(0).unwrap();
        assert_eq!(first.label, 0);
        assert_eq!(first.pixels.len(), 3 * 32 * 32);
    }

    #[test]
    fn test_empty_split_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("empty_class")).unwrap();
        assert!(matches!(
            ImageFolderDataset::from_dir(dir.path(), 32),
            Err(VisionError::EmptyDataset(_))
        ));
    }

    #[test]
    fn test_batcher_shapes() {
        let dir = tempfile::tempdir().unwrap();
        write_micro_dataset(dir.path(), &["a", "b"], 2);
        let dataset = ImageFolderDataset::from_dir(dir.path(), 32).unwrap();

        let batcher = ImageBatcher::<TestBackend>::new(NdArrayDevice::default(), 32);
        let decoded = dataset.load_many(&[0, 1, 2]);
        let batch = batcher.batch(&decoded);
        assert_eq!(batch.images.dims(), [3, 3, 32, 32]);
        assert_eq!(batch.targets.dims(), [3]);
    }

    #[test]
    fn test_decode_bytes_matches_file_decode() {
        let dir = tempfile::tempdir().unwrap();
        write_micro_dataset(dir.path(), &["x"], 1);
        let dataset = ImageFolderDataset::from_dir(dir.path(), 16).unwrap();
        let from_file = dataset.load(0).unwrap();

        let bytes = std::fs::read(&dataset.items[0].path).unwrap();
        let from_bytes = decode_image_bytes(&bytes, 16).unwrap();
        assert_eq!(from_file.pixels, from_bytes);
    }
}
