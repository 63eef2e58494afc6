//! Ad-hoc inference for the gateway's test endpoint.

use std::sync::Arc;

use agent_runtime::{ErrorKind, Workdir, WorkflowError};
use burn::backend::ndarray::NdArrayDevice;
use database::Store;
use storage::{ObjectStorage, ObjectUri};
use uuid::Uuid;
use vision::{predict_bytes, Architecture, ImageClassifier, VisionError};

use crate::eval_workflow::EvalBackend;
use crate::train_workflow::from_vision;

/// Loads a project's trained model and classifies one uploaded image.
pub struct PredictService {
    store: Arc<dyn Store>,
    storage: Arc<ObjectStorage>,
    image_size: usize,
}

/// One prediction for the test endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f64,
}

impl PredictService {
    pub fn new(store: Arc<dyn Store>, storage: Arc<ObjectStorage>, image_size: usize) -> Self {
        Self {
            store,
            storage,
            image_size,
        }
    }

    /// Classifies the uploaded image with the project's trained model.
    ///
    /// # Errors
    ///
    /// Returns `not_found` when the project has no model yet,
    /// `input_invalid` for undecodable image bytes.
    pub async fn predict(
        &self,
        project_id: Uuid,
        image: Vec<u8>,
    ) -> Result<Prediction, WorkflowError> {
        let project = self
            .store
            .get_project(project_id)
            .await
            .map_err(|e| WorkflowError::from_store("load_project", e))?
            .ok_or_else(|| {
                WorkflowError::new(ErrorKind::NotFound, "load_project", "project not found")
            })?;

        let model_record = self
            .store
            .get_model_by_project(project_id)
            .await
            .map_err(|e| WorkflowError::from_store("load_model", e))?
            .ok_or_else(|| {
                WorkflowError::new(ErrorKind::NotFound, "load_model", "no trained model yet")
            })?;

        let architecture: Architecture = model_record
            .metadata
            .get("architecture")
            .and_then(serde_json::Value::as_str)
            .or_else(|| project.metadata_str("preferred_model"))
            .unwrap_or("resnet18")
            .parse()
            .map_err(|e: VisionError| {
                WorkflowError::new(ErrorKind::InputInvalid, "rebuild_model", e.to_string())
            })?;

        let classes: Vec<String> = model_record
            .metadata
            .get("classes")
            .and_then(serde_json::Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let num_classes = model_record
            .metadata
            .get("num_classes")
            .and_then(serde_json::Value::as_u64)
            .map_or(classes.len(), |n| n as usize);
        if num_classes == 0 {
            return Err(WorkflowError::new(
                ErrorKind::NotFound,
                "rebuild_model",
                "model metadata is missing its class list",
            ));
        }

        let weights_uri: ObjectUri = model_record
            .object_uri
            .parse()
            .map_err(|e| WorkflowError::from_storage("download_model", e))?;

        let workdir = Workdir::create("predict").map_err(|e| {
            WorkflowError::new(ErrorKind::ResourceExhausted, "workdir", e.to_string())
        })?;
        let weights_path = workdir.join("model.mpk");
        self.storage
            .download(&weights_uri, &weights_path)
            .await
            .map_err(|e| WorkflowError::from_storage("download_model", e))?;

        let image_size = self.image_size;
        let prediction = tokio::task::spawn_blocking(move || {
            let device = NdArrayDevice::default();
            let model = ImageClassifier::<EvalBackend>::load_weights(
                architecture,
                num_classes,
                &weights_path,
                &device,
            )
            .map_err(|e| from_vision("rebuild_model", e))?;
            predict_bytes(&model, &image, image_size, &classes, &device).map_err(|e| {
                WorkflowError::new(ErrorKind::InputInvalid, "decode_image", e.to_string())
            })
        })
        .await
        .map_err(|e| WorkflowError::new(ErrorKind::ResourceExhausted, "predict", e.to_string()))??;

        let (label, confidence) = prediction;
        Ok(Prediction { label, confidence })
    }
}
