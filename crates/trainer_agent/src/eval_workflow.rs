//! The evaluation workflow: score the model, assemble and publish the bundle.

use std::sync::Arc;
use std::time::Duration;

use agent_runtime::{
    retry_transient, slugify, ErrorKind, ProjectWorker, Workdir, WorkflowError,
};
use async_trait::async_trait;
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::NdArray;
use database::{
    AdvanceOutcome, AgentName, LogLevel, MessageRole, ModelRecord, Project, ProjectStatus, Store,
};
use storage::{ObjectStorage, ObjectUri};
use tracing::{info, warn};
use uuid::Uuid;
use vision::{
    evaluate, prepare_layout, unzip_archive, Architecture, ImageClassifier, ImageFolderDataset,
    VisionError,
};

use crate::bundle::{build_bundle, BundleSpec};
use crate::train_workflow::from_vision;

/// Evaluation runs inference only, on the plain CPU backend.
pub type EvalBackend = NdArray;

/// Evaluation knobs, from configuration.
#[derive(Debug, Clone)]
pub struct EvaluatorOptions {
    pub batch_size: usize,
    pub image_size: usize,
    pub advance_retries: usize,
    pub step_timeout: Duration,
}

impl Default for EvaluatorOptions {
    fn default() -> Self {
        Self {
            batch_size: 32,
            image_size: 224,
            advance_retries: 3,
            step_timeout: Duration::from_secs(3600),
        }
    }
}

/// Claims `pending_evaluation` projects and completes them.
pub struct EvaluationWorkflow {
    store: Arc<dyn Store>,
    storage: Arc<ObjectStorage>,
    options: EvaluatorOptions,
}

impl EvaluationWorkflow {
    pub fn new(
        store: Arc<dyn Store>,
        storage: Arc<ObjectStorage>,
        options: EvaluatorOptions,
    ) -> Self {
        Self {
            store,
            storage,
            options,
        }
    }

    /// Runs the workflow for one project, applying the failure policy.
    ///
    /// # Errors
    ///
    /// Returns the workflow error for failures that marked the project
    /// `failed`; conflict and integrity outcomes resolve to `Ok`.
    pub async fn process_project(&self, project: Project) -> Result<(), WorkflowError> {
        let result = self.run(&project).await;

        let Err(err) = result else {
            return Ok(());
        };

        match err.kind {
            ErrorKind::Conflict => {
                self.log(
                    project.id,
                    LogLevel::Info,
                    "Another worker advanced the project; leaving it untouched",
                )
                .await;
                Ok(())
            }
            ErrorKind::Integrity => {
                self.log(
                    project.id,
                    LogLevel::Warning,
                    &format!("Bundle uploaded but status update failed: {}", err.detail),
                )
                .await;
                Ok(())
            }
            _ => {
                self.log(
                    project.id,
                    LogLevel::Error,
                    &format!("Evaluation failed: {err}"),
                )
                .await;
                let failed = retry_transient("mark_failed", 3, || {
                    self.store.mark_failed(project.id, err.to_metadata())
                })
                .await;
                if let Err(mark_err) = failed {
                    warn!(project_id = %project.id, error = %mark_err, "Failed to mark project failed");
                }
                self.send_message(
                    project.user_id,
                    &format!("Evaluation failed for '{}'.", project.name),
                )
                .await;
                Err(err)
            }
        }
    }

    async fn run(&self, project: &Project) -> Result<(), WorkflowError> {
        self.log(project.id, LogLevel::Info, "Evaluation workflow initiated")
            .await;

        // Resume case: the bundle already exists, only the flip is missing.
        if project.metadata_str("bundle_uri").is_some() {
            self.log(
                project.id,
                LogLevel::Info,
                "Bundle already exists, re-attempting status advance",
            )
            .await;
            return self.advance_to_completed(project).await;
        }

        let model_record = retry_transient("get_model_by_project", 3, || {
            self.store.get_model_by_project(project.id)
        })
        .await
        .map_err(|e| WorkflowError::from_store("load_model", e))?
        .ok_or_else(|| {
            WorkflowError::new(
                ErrorKind::NotFound,
                "load_model",
                format!("no model row for project {}", project.id),
            )
        })?;

        let dataset = retry_transient("get_dataset_by_project", 3, || {
            self.store.get_dataset_by_project(project.id)
        })
        .await
        .map_err(|e| WorkflowError::from_store("load_dataset", e))?
        .ok_or_else(|| {
            WorkflowError::new(
                ErrorKind::NotFound,
                "load_dataset",
                format!("no dataset row for project {}", project.id),
            )
        })?;

        let workdir = Workdir::create("evaluation-agent").map_err(|e| {
            WorkflowError::new(ErrorKind::ResourceExhausted, "workdir", e.to_string())
        })?;

        // Fetch artifacts.
        let archive_uri: ObjectUri = dataset
            .object_uri
            .parse()
            .map_err(|e| WorkflowError::from_storage("download_dataset", e))?;
        let weights_uri: ObjectUri = model_record
            .object_uri
            .parse()
            .map_err(|e| WorkflowError::from_storage("download_model", e))?;

        let archive_path = workdir.join("dataset.zip");
        let weights_path = workdir.join("model.mpk");

        let downloads = async {
            self.storage.download(&archive_uri, &archive_path).await?;
            self.storage.download(&weights_uri, &weights_path).await
        };
        tokio::time::timeout(self.options.step_timeout, downloads)
            .await
            .map_err(|_| {
                WorkflowError::new(ErrorKind::Timeout, "download_artifacts", "deadline exceeded")
            })?
            .map_err(|e| WorkflowError::from_storage("download_artifacts", e))?;

        // Rebuild the extracted layout; scoring requires a test split.
        let dataset_dir = workdir.join("dataset");
        unzip_archive(&archive_path, &dataset_dir).map_err(|e| from_vision("extract", e))?;
        let layout = prepare_layout(&dataset_dir).map_err(|e| from_vision("layout", e))?;

        if !layout.has_test {
            return Err(WorkflowError::new(
                ErrorKind::BadDatasetLayout,
                "layout",
                "no test split present after processing",
            ));
        }

        let scoring_dataset =
            ImageFolderDataset::from_dir(&layout.test_dir(), self.options.image_size)
                .map_err(|e| from_vision("load_test_split", e))?;

        // Rebuild the classifier from the stored weights.
        let architecture: Architecture = model_metadata_str(&model_record, "architecture")
            .or_else(|| project.metadata_str("preferred_model").map(str::to_string))
            .unwrap_or_else(|| "resnet18".to_string())
            .parse()
            .map_err(|e: VisionError| {
                WorkflowError::new(ErrorKind::InputInvalid, "rebuild_model", e.to_string())
            })?;
        let num_classes = model_record
            .metadata
            .get("num_classes")
            .and_then(serde_json::Value::as_u64)
            .map_or(layout.num_classes(), |n| n as usize);
        let classes = model_classes(&model_record).unwrap_or_else(|| layout.classes.clone());

        let device = NdArrayDevice::default();
        let model =
            ImageClassifier::<EvalBackend>::load_weights(architecture, num_classes, &weights_path, &device)
                .map_err(|e| from_vision("rebuild_model", e))?;

        self.log(
            project.id,
            LogLevel::Info,
            &format!(
                "Scoring {} images across {num_classes} classes",
                scoring_dataset.len()
            ),
        )
        .await;

        // Score on a blocking thread; inference is CPU-bound.
        let batch_size = self.options.batch_size;
        let score_task = tokio::task::spawn_blocking(move || {
            evaluate(&model, &scoring_dataset, batch_size, &device)
        });
        let report = tokio::time::timeout(self.options.step_timeout, score_task)
            .await
            .map_err(|_| WorkflowError::new(ErrorKind::Timeout, "score", "deadline exceeded"))?
            .map_err(|e| WorkflowError::new(ErrorKind::ResourceExhausted, "score", e.to_string()))?
            .map_err(|e| from_vision("score", e))?;

        self.log(
            project.id,
            LogLevel::Info,
            &format!(
                "Evaluation complete: accuracy {:.2}%, macro-F1 {:.3}",
                report.accuracy * 100.0,
                report.macro_f1
            ),
        )
        .await;

        retry_transient("update_model_metrics", 3, || {
            self.store
                .update_model_metrics(model_record.id, report.accuracy, report.to_metadata())
        })
        .await
        .map_err(|e| WorkflowError::from_store("update_model_metrics", e))?;

        // Assemble and publish the user bundle.
        let slug = slugify(&project.name);
        let spec = BundleSpec {
            project_name: &project.name,
            architecture: architecture.as_str(),
            classes: &classes,
            weights_path: &weights_path,
            accuracy: report.accuracy,
        };
        let zip_path = build_bundle(&workdir.join("bundle"), &spec)?;

        let bundle_uri = self
            .storage
            .uri_for(&format!("bundles/{slug}.zip"))
            .map_err(|e| WorkflowError::from_storage("upload_bundle", e))?;
        self.storage
            .upload(&zip_path, &bundle_uri)
            .await
            .map_err(|e| WorkflowError::from_storage("upload_bundle", e))?;

        retry_transient("store_bundle_uri", 3, || {
            self.store.update_project_metadata(
                project.id,
                serde_json::json!({ "bundle_uri": bundle_uri.to_string() }),
            )
        })
        .await
        .map_err(|e| WorkflowError::from_store("store_bundle_uri", e))?;

        self.log(
            project.id,
            LogLevel::Info,
            &format!("Bundle uploaded: {bundle_uri}"),
        )
        .await;

        self.advance_to_completed(project).await?;

        self.send_message(
            project.user_id,
            &format!(
                "'{}' is complete! Test accuracy: {:.2}%. Your model bundle is ready to download.",
                project.name,
                report.accuracy * 100.0,
            ),
        )
        .await;

        Ok(())
    }

    async fn advance_to_completed(&self, project: &Project) -> Result<(), WorkflowError> {
        let outcome = retry_transient("advance_status", self.options.advance_retries, || {
            self.store.advance_status(
                project.id,
                ProjectStatus::PendingEvaluation,
                ProjectStatus::Completed,
                None,
            )
        })
        .await;

        match outcome {
            Ok(AdvanceOutcome::Claimed) => {
                info!(project_id = %project.id, "Project completed");
                Ok(())
            }
            Ok(AdvanceOutcome::NotClaimed) => Err(WorkflowError::new(
                ErrorKind::Conflict,
                "advance_status",
                "project no longer in pending_evaluation",
            )),
            Ok(AdvanceOutcome::NoSuchProject) => Err(WorkflowError::new(
                ErrorKind::NotFound,
                "advance_status",
                format!("project {} disappeared", project.id),
            )),
            Err(err) => Err(WorkflowError::new(
                ErrorKind::Integrity,
                "advance_status",
                err.to_string(),
            )),
        }
    }

    async fn log(&self, project_id: Uuid, level: LogLevel, message: &str) {
        if let Err(err) = self
            .store
            .append_log(Some(project_id), AgentName::Evaluation, level, message)
            .await
        {
            warn!(project_id = %project_id, error = %err, "Failed to append agent log");
        }
    }

    async fn send_message(&self, user_id: Uuid, content: &str) {
        if let Err(err) = self
            .store
            .write_message(user_id, MessageRole::Assistant, content)
            .await
        {
            warn!(user_id = %user_id, error = %err, "Failed to send chat message");
        }
    }
}

fn model_metadata_str(model: &ModelRecord, key: &str) -> Option<String> {
    model
        .metadata
        .get(key)
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}

fn model_classes(model: &ModelRecord) -> Option<Vec<String>> {
    let values = model.metadata.get("classes")?.as_array()?;
    let classes: Vec<String> = values
        .iter()
        .filter_map(|value| value.as_str().map(str::to_string))
        .collect();
    (!classes.is_empty()).then_some(classes)
}

#[async_trait]
impl ProjectWorker for EvaluationWorkflow {
    fn agent(&self) -> AgentName {
        AgentName::Evaluation
    }

    fn owned_status(&self) -> ProjectStatus {
        ProjectStatus::PendingEvaluation
    }

    async fn process(&self, project: Project) -> Result<(), WorkflowError> {
        self.process_project(project).await
    }
}
