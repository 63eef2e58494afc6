//! User bundle assembly: weights, labels, inference script, readme.

use std::io::Write;
use std::path::{Path, PathBuf};

use agent_runtime::{ErrorKind, WorkflowError};

/// What goes into a bundle.
#[derive(Debug)]
pub struct BundleSpec<'a> {
    pub project_name: &'a str,
    pub architecture: &'a str,
    pub classes: &'a [String],
    pub weights_path: &'a Path,
    pub accuracy: f64,
}

/// Builds the bundle zip next to `staging_dir` and returns its path.
///
/// The zip contains exactly `model.mpk`, `predict.py`, `labels.json`, and
/// `README.txt`; `labels.json` is the ordered class list matching the
/// training label indices.
///
/// # Errors
///
/// Returns a `dependency` workflow error on any filesystem failure.
pub fn build_bundle(staging_dir: &Path, spec: &BundleSpec<'_>) -> Result<PathBuf, WorkflowError> {
    let fail = |detail: String| WorkflowError::new(ErrorKind::Dependency, "bundle", detail);

    std::fs::create_dir_all(staging_dir).map_err(|e| fail(e.to_string()))?;

    let weights = staging_dir.join("model.mpk");
    std::fs::copy(spec.weights_path, &weights).map_err(|e| fail(e.to_string()))?;

    let labels = serde_json::to_string_pretty(spec.classes).map_err(|e| fail(e.to_string()))?;
    std::fs::write(staging_dir.join("labels.json"), labels).map_err(|e| fail(e.to_string()))?;

    std::fs::write(staging_dir.join("predict.py"), predict_script(spec))
        .map_err(|e| fail(e.to_string()))?;
    std::fs::write(staging_dir.join("README.txt"), readme(spec)).map_err(|e| fail(e.to_string()))?;

    let zip_path = staging_dir.with_extension("zip");
    let file = std::fs::File::create(&zip_path).map_err(|e| fail(e.to_string()))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for name in ["model.mpk", "predict.py", "labels.json", "README.txt"] {
        writer
            .start_file(name, options)
            .map_err(|e| fail(e.to_string()))?;
        let bytes = std::fs::read(staging_dir.join(name)).map_err(|e| fail(e.to_string()))?;
        writer.write_all(&bytes).map_err(|e| fail(e.to_string()))?;
    }
    writer.finish().map_err(|e| fail(e.to_string()))?;

    Ok(zip_path)
}

fn predict_script(spec: &BundleSpec<'_>) -> String {
    format!(
        r#"'''Inference helper for the {name} model bundle.

The weights in model.mpk are a burn (Rust) MessagePack record for the
{architecture} architecture; labels.json holds the ordered class names
matching the training label indices.

Usage:
    python predict.py path/to/image.jpg [service-url]

When a service URL is given (or PREDICT_URL is set), the image is sent to
the hosted inference endpoint and the predicted label and confidence are
printed. Without one, this script only validates the bundle contents.
'''

import json
import os
import sys
import urllib.request


def load_labels():
    with open(os.path.join(os.path.dirname(__file__) or ".", "labels.json")) as f:
        return json.load(f)


def predict(image_path, service_url):
    with open(image_path, "rb") as f:
        payload = f.read()

    boundary = "----bundle-predict"
    body = (
        f"--{{boundary}}\r\n"
        f'Content-Disposition: form-data; name="file"; filename="image"\r\n'
        f"Content-Type: application/octet-stream\r\n\r\n"
    ).encode() + payload + f"\r\n--{{boundary}}--\r\n".encode()

    request = urllib.request.Request(
        service_url,
        data=body,
        headers={{"Content-Type": f"multipart/form-data; boundary={{boundary}}"}},
    )
    with urllib.request.urlopen(request) as response:
        result = json.load(response)
    print(f"Prediction: {{result['label']}}")
    print(f"Confidence: {{result['confidence']:.2%}}")


if __name__ == "__main__":
    if len(sys.argv) < 2:
        print("Usage: python predict.py <image_path> [service-url]")
        sys.exit(1)

    labels = load_labels()
    print(f"Bundle OK: {{len(labels)}} classes ({{', '.join(labels[:5])}}...)")

    url = sys.argv[2] if len(sys.argv) > 2 else os.environ.get("PREDICT_URL")
    if url:
        predict(sys.argv[1], url)
    else:
        print("No service URL given; set PREDICT_URL or pass one to run inference.")
"#,
        name = spec.project_name,
        architecture = spec.architecture,
    )
}

fn readme(spec: &BundleSpec<'_>) -> String {
    format!(
        "# {name} - Trained Model Bundle\n\
         \n\
         ## Contents\n\
         - model.mpk: trained weights ({architecture}, burn MessagePack record)\n\
         - labels.json: ordered class labels\n\
         - predict.py: inference helper (see its docstring)\n\
         - README.txt: this file\n\
         \n\
         ## Model details\n\
         - Architecture: {architecture}\n\
         - Classes ({num_classes}): {classes}\n\
         - Test accuracy: {accuracy:.2}%\n\
         \n\
         ## Notes\n\
         - The model expects RGB images, resized to the training resolution.\n\
         - Predictions include softmax confidence scores.\n",
        name = spec.project_name,
        architecture = spec.architecture,
        num_classes = spec.classes.len(),
        classes = spec.classes.join(", "),
        accuracy = spec.accuracy * 100.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_contains_exactly_four_entries() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("weights.mpk");
        std::fs::write(&weights, b"fake-record").unwrap();

        let classes = vec!["daisy".to_string(), "rose".to_string(), "tulip".to_string()];
        let spec = BundleSpec {
            project_name: "Flower Classifier",
            architecture: "resnet18",
            classes: &classes,
            weights_path: &weights,
            accuracy: 0.91,
        };

        let zip_path = build_bundle(&dir.path().join("bundle"), &spec).unwrap();

        let file = std::fs::File::open(&zip_path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, ["README.txt", "labels.json", "model.mpk", "predict.py"]);

        // labels.json length equals the class count, in index order.
        let mut labels_entry = archive.by_name("labels.json").unwrap();
        let mut raw = String::new();
        std::io::Read::read_to_string(&mut labels_entry, &mut raw).unwrap();
        let labels: Vec<String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(labels, classes);
    }
}
