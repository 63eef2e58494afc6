//! Dataset extraction contract: unzip, normalize, split, validate.
//!
//! Accepted layouts after extraction:
//! - `train/`, `val/`, `test/` split directories of class subdirectories
//!   (missing `val` is carved out of `train`; a missing `test` is tolerated
//!   and handled at evaluation time), or
//! - a single root of class subdirectories, auto-split 70/15/15
//!   deterministically by filename hash.
//!
//! Anything else is a bad dataset layout.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::VisionError;

/// Split fractions for the hash-based auto split.
const TRAIN_PERCENT: u64 = 70;
const VAL_PERCENT: u64 = 15;

/// Fraction of train files carved into a missing `val/` split.
const CARVE_VAL_PERCENT: u64 = 20;

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "gif", "webp"];

/// A validated train/val[/test] layout rooted at `root`.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    pub root: PathBuf,
    pub classes: Vec<String>,
    pub has_test: bool,
}

impl DatasetLayout {
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    #[must_use]
    pub fn train_dir(&self) -> PathBuf {
        self.root.join("train")
    }

    #[must_use]
    pub fn val_dir(&self) -> PathBuf {
        self.root.join("val")
    }

    #[must_use]
    pub fn test_dir(&self) -> PathBuf {
        self.root.join("test")
    }
}

/// Extracts a zip archive into `dest`, refusing entries that escape it.
///
/// # Errors
///
/// Returns `Zip` for a corrupt archive, `Io` on write failure.
pub fn unzip_archive(zip_path: &Path, dest: &Path) -> Result<(), VisionError> {
    let file = File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    std::fs::create_dir_all(dest)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out)?;
    }

    Ok(())
}

/// Normalizes an extracted directory into a validated layout.
///
/// # Errors
///
/// Returns `BadLayout` when neither split directories nor class
/// subdirectories with images are recognizable, or when class sets differ
/// across splits.
pub fn prepare_layout(root: &Path) -> Result<DatasetLayout, VisionError> {
    flatten_single_dir(root)?;
    normalize_split_names(root)?;

    let has_train = root.join("train").is_dir();
    let has_val = root.join("val").is_dir();
    let has_test = root.join("test").is_dir();

    if has_train {
        if !has_val {
            info!("No val split found, carving one out of train");
            carve_val_from_train(root)?;
        }
    } else {
        if has_val || has_test {
            return Err(VisionError::BadLayout(
                "found val/test split without a train split".to_string(),
            ));
        }
        info!("No split directories found, auto-splitting by filename hash");
        auto_split(root)?;
    }

    let has_test = root.join("test").is_dir();
    let classes = sorted_class_dirs(&root.join("train"))?;
    if classes.is_empty() {
        return Err(VisionError::BadLayout(
            "train split contains no class directories".to_string(),
        ));
    }
    if count_images(&root.join("train"))? == 0 {
        return Err(VisionError::BadLayout(
            "train split contains no images".to_string(),
        ));
    }

    // Class sets must agree across splits so label indices line up.
    for split in ["val", "test"] {
        let split_dir = root.join(split);
        if !split_dir.is_dir() {
            continue;
        }
        let split_classes = sorted_class_dirs(&split_dir)?;
        if split_classes != classes {
            return Err(VisionError::BadLayout(format!(
                "class directories in {split}/ do not match train/"
            )));
        }
    }

    Ok(DatasetLayout {
        root: root.to_path_buf(),
        classes,
        has_test,
    })
}

/// Unwraps archives that wrap everything in a single top directory.
fn flatten_single_dir(root: &Path) -> Result<(), VisionError> {
    loop {
        let entries: Vec<PathBuf> = std::fs::read_dir(root)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| !is_hidden(path))
            .collect();

        let [only] = entries.as_slice() else {
            return Ok(());
        };
        if !only.is_dir() {
            return Ok(());
        }

        for child in std::fs::read_dir(only)? {
            let child = child?.path();
            let name = child.file_name().map(ToOwned::to_owned).unwrap_or_default();
            std::fs::rename(&child, root.join(name))?;
        }
        std::fs::remove_dir(only)?;
    }
}

/// Renames split directories to canonical lowercase names.
fn normalize_split_names(root: &Path) -> Result<(), VisionError> {
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let canonical = match name.to_lowercase().as_str() {
            "train" | "training" => "train",
            "val" | "valid" | "validation" => "val",
            "test" | "testing" => "test",
            _ => continue,
        };
        if name != canonical {
            let target = root.join(canonical);
            if !target.exists() {
                std::fs::rename(&path, target)?;
            }
        }
    }
    Ok(())
}

/// Moves a deterministic slice of each train class into a fresh `val/`.
fn carve_val_from_train(root: &Path) -> Result<(), VisionError> {
    let train = root.join("train");
    let val = root.join("val");

    for class in sorted_class_dirs(&train)? {
        let class_train = train.join(&class);
        let class_val = val.join(&class);
        std::fs::create_dir_all(&class_val)?;

        let files = sorted_image_files(&class_train)?;
        let mut moved = 0usize;
        for file in &files {
            if bucket_of(file) < CARVE_VAL_PERCENT && moved + 1 < files.len() {
                move_into(file, &class_val)?;
                moved += 1;
            }
        }
        // Hash buckets can miss small classes entirely; keep val non-empty
        // whenever there is anything to spare.
        if moved == 0 && files.len() > 1 {
            move_into(&files[0], &class_val)?;
        }
    }
    Ok(())
}

/// Splits a class-directory root into train/val/test by filename hash.
fn auto_split(root: &Path) -> Result<(), VisionError> {
    let classes = sorted_class_dirs(root)?;
    if classes.is_empty() {
        return Err(VisionError::BadLayout(
            "no class directories to auto-split".to_string(),
        ));
    }

    for class in &classes {
        let class_dir = root.join(class);
        let files = sorted_image_files(&class_dir)?;
        if files.is_empty() {
            return Err(VisionError::BadLayout(format!(
                "class directory {class} contains no images"
            )));
        }

        for split in ["train", "val", "test"] {
            std::fs::create_dir_all(root.join(split).join(class))?;
        }

        for file in &files {
            let bucket = bucket_of(file);
            let split = if bucket < TRAIN_PERCENT {
                "train"
            } else if bucket < TRAIN_PERCENT + VAL_PERCENT {
                "val"
            } else {
                "test"
            };
            move_into(file, &root.join(split).join(class))?;
        }

        // Train must never end up empty for a class that has images.
        let class_train = root.join("train").join(class);
        if sorted_image_files(&class_train)?.is_empty() {
            for split in ["val", "test"] {
                let donors = sorted_image_files(&root.join(split).join(class))?;
                if let Some(donor) = donors.first() {
                    move_into(donor, &class_train)?;
                    break;
                }
            }
        }

        std::fs::remove_dir(&class_dir).ok();
    }

    Ok(())
}

fn move_into(file: &Path, dir: &Path) -> Result<(), VisionError> {
    let name = file.file_name().map(ToOwned::to_owned).unwrap_or_default();
    std::fs::rename(file, dir.join(name))?;
    Ok(())
}

/// FNV-1a over the file name, reduced to a percentile bucket.
fn bucket_of(path: &Path) -> u64 {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash % 100
}

/// Non-hidden subdirectory names, sorted.
pub(crate) fn sorted_class_dirs(dir: &Path) -> Result<Vec<String>, VisionError> {
    let mut classes = BTreeSet::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() && !is_hidden(&path) {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                classes.insert(name.to_string());
            }
        }
    }
    Ok(classes.into_iter().collect())
}

fn sorted_image_files(dir: &Path) -> Result<Vec<PathBuf>, VisionError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| is_image_file(path))
        .collect();
    files.sort();
    Ok(files)
}

fn count_images(dir: &Path) -> Result<usize, VisionError> {
    let mut count = 0;
    for class in sorted_class_dirs(dir)? {
        count += sorted_image_files(&dir.join(class))?.len();
    }
    Ok(count)
}

pub(crate) fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                IMAGE_EXTENSIONS
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') || n == "__MACOSX")
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    //! Micro image datasets for workflow tests.

    use std::path::Path;

    /// Writes `per_class` tiny PNGs under each class directory. Each class
    /// gets a distinct dominant color so a model can actually separate them.
    pub fn write_micro_dataset(root: &Path, classes: &[&str], per_class: usize) {
        for (class_index, class) in classes.iter().enumerate() {
            let dir = root.join(class);
            std::fs::create_dir_all(&dir).unwrap();
            for index in 0..per_class {
                let img = image::RgbImage::from_fn(8, 8, |x, y| {
                    let base = ((class_index * 97) % 255) as u8;
                    let noise = ((x + y + index as u32) % 32) as u8;
                    image::Rgb([base.saturating_add(noise), base, 255 - base])
                });
                img.save(dir.join(format!("img_{index:03}.png"))).unwrap();
            }
        }
    }

    /// Zips a directory tree into `zip_path`.
    pub fn zip_directory(src: &Path, zip_path: &Path) {
        let file = std::fs::File::create(zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        add_dir(&mut writer, src, src, options);
        writer.finish().unwrap();
    }

    fn add_dir(
        writer: &mut zip::ZipWriter<std::fs::File>,
        base: &Path,
        dir: &Path,
        options: zip::write::SimpleFileOptions,
    ) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            let relative = path.strip_prefix(base).unwrap().to_string_lossy().replace('\\', "/");
            if path.is_dir() {
                add_dir(writer, base, &path, options);
            } else {
                writer.start_file(relative, options).unwrap();
                let bytes = std::fs::read(&path).unwrap();
                std::io::Write::write_all(writer, &bytes).unwrap();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{write_micro_dataset, zip_directory};
    use super::*;

    #[test]
    fn test_explicit_splits_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        for split in ["train", "val", "test"] {
            write_micro_dataset(&dir.path().join(split), &["cat", "dog"], 2);
        }

        let layout = prepare_layout(dir.path()).unwrap();
        assert_eq!(layout.classes, ["cat", "dog"]);
        assert_eq!(layout.num_classes(), 2);
        assert!(layout.has_test);
        assert_eq!(layout.test_dir(), dir.path().join("test"));
    }

    #[test]
    fn test_single_root_is_auto_split() {
        let dir = tempfile::tempdir().unwrap();
        write_micro_dataset(dir.path(), &["cat", "dog"], 20);

        let layout = prepare_layout(dir.path()).unwrap();
        assert_eq!(layout.classes, ["cat", "dog"]);

        // Every original file survives the split.
        let mut total = 0;
        for split in ["train", "val", "test"] {
            for class in &layout.classes {
                total += std::fs::read_dir(dir.path().join(split).join(class))
                    .unwrap()
                    .count();
            }
        }
        assert_eq!(total, 40);
    }

    #[test]
    fn test_auto_split_is_deterministic() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        write_micro_dataset(dir_a.path(), &["cat"], 20);
        write_micro_dataset(dir_b.path(), &["cat"], 20);

        prepare_layout(dir_a.path()).unwrap();
        prepare_layout(dir_b.path()).unwrap();

        for split in ["train", "val", "test"] {
            let names = |root: &Path| -> Vec<String> {
                let mut names: Vec<String> = std::fs::read_dir(root.join(split).join("cat"))
                    .unwrap()
                    .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                    .collect();
                names.sort();
                names
            };
            assert_eq!(names(dir_a.path()), names(dir_b.path()), "{split}");
        }
    }

    #[test]
    fn test_wrapper_directory_is_flattened() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("archive-v1");
        for split in ["train", "val"] {
            write_micro_dataset(&nested.join(split), &["leaf"], 2);
        }

        let layout = prepare_layout(dir.path()).unwrap();
        assert_eq!(layout.classes, ["leaf"]);
        assert!(!layout.has_test);
    }

    #[test]
    fn test_missing_val_is_carved_from_train() {
        let dir = tempfile::tempdir().unwrap();
        write_micro_dataset(&dir.path().join("train"), &["cat", "dog"], 10);
        write_micro_dataset(&dir.path().join("test"), &["cat", "dog"], 2);

        let layout = prepare_layout(dir.path()).unwrap();
        for class in &layout.classes {
            assert!(
                std::fs::read_dir(dir.path().join("val").join(class))
                    .unwrap()
                    .count()
                    > 0
            );
        }
    }

    #[test]
    fn test_flat_file_archive_is_bad_layout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.csv"), "a,b,c\n1,2,3\n").unwrap();

        assert!(matches!(
            prepare_layout(dir.path()),
            Err(VisionError::BadLayout(_))
        ));
    }

    #[test]
    fn test_mismatched_split_classes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_micro_dataset(&dir.path().join("train"), &["cat", "dog"], 2);
        write_micro_dataset(&dir.path().join("val"), &["cat"], 2);

        assert!(matches!(
            prepare_layout(dir.path()),
            Err(VisionError::BadLayout(_))
        ));
    }

    #[test]
    fn test_unzip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        write_micro_dataset(&src, &["rose"], 2);
        let zip_path = dir.path().join("data.zip");
        zip_directory(&src, &zip_path);

        let out = dir.path().join("out");
        unzip_archive(&zip_path, &out).unwrap();
        assert_eq!(std::fs::read_dir(out.join("rose")).unwrap().count(), 2);
    }
}
