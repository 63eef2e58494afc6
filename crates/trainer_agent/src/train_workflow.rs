//! The training workflow: archive → layout → fine-tune → weights → model row.

use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_runtime::{
    retry_transient, slugify, ErrorKind, ProjectWorker, Workdir, WorkflowError,
};
use async_trait::async_trait;
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use database::{
    AdvanceOutcome, AgentName, LogLevel, MessageRole, NewModel, Project, ProjectStatus, Store,
    TaskType,
};
use storage::{ObjectStorage, ObjectUri};
use tracing::{info, warn};
use uuid::Uuid;
use vision::{
    prepare_layout, train, unzip_archive, Architecture, ImageClassifier, ImageFolderDataset,
    TrainingConfig, VisionError,
};

/// Training runs on the autodiff-wrapped CPU backend.
pub type TrainBackend = Autodiff<NdArray>;

/// Trainer knobs, from configuration.
#[derive(Debug, Clone)]
pub struct TrainerOptions {
    pub batch_size: usize,
    pub default_epochs: usize,
    pub default_learning_rate: f64,
    pub image_size: usize,
    pub advance_retries: usize,
    pub step_timeout: Duration,
    pub pretrained_prefix: Option<String>,
}

impl Default for TrainerOptions {
    fn default() -> Self {
        Self {
            batch_size: 32,
            default_epochs: 10,
            default_learning_rate: 1e-3,
            image_size: 224,
            advance_retries: 3,
            step_timeout: Duration::from_secs(3600),
            pretrained_prefix: None,
        }
    }
}

/// Claims `pending_training` projects and produces trained weights.
pub struct TrainingWorkflow {
    store: Arc<dyn Store>,
    storage: Arc<ObjectStorage>,
    options: TrainerOptions,
}

impl TrainingWorkflow {
    pub fn new(store: Arc<dyn Store>, storage: Arc<ObjectStorage>, options: TrainerOptions) -> Self {
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
                    &format!("Model uploaded but status update failed: {}", err.detail),
                )
                .await;
                Ok(())
            }
            _ => {
                self.log(project.id, LogLevel::Error, &format!("Training failed: {err}"))
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
                    &format!("Training failed for '{}'.", project.name),
                )
                .await;
                Err(err)
            }
        }
    }

    async fn run(&self, project: &Project) -> Result<(), WorkflowError> {
        self.log(project.id, LogLevel::Info, "Training workflow initiated")
            .await;

        if project.task_type != TaskType::ImageClassification {
            return Err(WorkflowError::new(
                ErrorKind::InputInvalid,
                "validate",
                format!("unsupported task type {:?}", project.task_type),
            ));
        }

        // Resume case: weights already exist, only the flip is missing.
        let existing_model = retry_transient("get_model_by_project", 3, || {
            self.store.get_model_by_project(project.id)
        })
        .await
        .map_err(|e| WorkflowError::from_store("load_model", e))?;
        if let Some(model) = existing_model {
            self.log(
                project.id,
                LogLevel::Info,
                &format!("Model row already exists ({}), re-attempting status advance", model.name),
            )
            .await;
            return self.advance_to_evaluation(project).await;
        }

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

        let workdir = Workdir::create("training-agent").map_err(|e| {
            WorkflowError::new(ErrorKind::ResourceExhausted, "workdir", e.to_string())
        })?;

        // Fetch and extract the archive.
        let archive_uri: ObjectUri = dataset
            .object_uri
            .parse()
            .map_err(|e| WorkflowError::from_storage("download_dataset", e))?;
        let archive_path = workdir.join("dataset.zip");

        self.log(
            project.id,
            LogLevel::Info,
            &format!("Downloading dataset from {}", dataset.object_uri),
        )
        .await;
        let download = self.storage.download(&archive_uri, &archive_path);
        tokio::time::timeout(self.options.step_timeout, download)
            .await
            .map_err(|_| {
                WorkflowError::new(ErrorKind::Timeout, "download_dataset", "deadline exceeded")
            })?
            .map_err(|e| WorkflowError::from_storage("download_dataset", e))?;

        let dataset_dir = workdir.join("dataset");
        unzip_archive(&archive_path, &dataset_dir)
            .map_err(|e| from_vision("extract", e))?;

        let layout = prepare_layout(&dataset_dir).map_err(|e| from_vision("layout", e))?;
        let num_classes = layout.num_classes();
        self.log(
            project.id,
            LogLevel::Info,
            &format!("Detected {num_classes} classes in dataset"),
        )
        .await;

        retry_transient("update_project_metadata", 3, || {
            self.store.update_project_metadata(
                project.id,
                serde_json::json!({ "num_classes": num_classes }),
            )
        })
        .await
        .map_err(|e| WorkflowError::from_store("store_num_classes", e))?;

        // Build the model.
        let architecture: Architecture = project
            .metadata_str("preferred_model")
            .unwrap_or("resnet18")
            .parse()
            .map_err(|e: VisionError| {
                WorkflowError::new(ErrorKind::InputInvalid, "build_model", e.to_string())
            })?;

        let device = NdArrayDevice::default();
        let mut model = ImageClassifier::<TrainBackend>::new(architecture, num_classes, &device);
        model = self
            .load_pretrained(project.id, architecture, num_classes, model, &workdir, &device)
            .await;
        self.log(
            project.id,
            LogLevel::Info,
            &format!("Model initialized: {architecture} with {num_classes} classes"),
        )
        .await;

        // Build loaders and train.
        let epochs = project
            .metadata_f64("epochs")
            .map_or(self.options.default_epochs, |e| e.max(1.0) as usize);
        let learning_rate = project
            .metadata_f64("learning_rate")
            .unwrap_or(self.options.default_learning_rate);
        // No accelerator on this backend: halve the configured batch size.
        let batch_size = (self.options.batch_size / 2).max(1);

        let train_dataset = ImageFolderDataset::from_dir(&layout.train_dir(), self.options.image_size)
            .map_err(|e| from_vision("load_train_split", e))?;
        let val_dataset = ImageFolderDataset::from_dir(&layout.val_dir(), self.options.image_size)
            .map_err(|e| from_vision("load_val_split", e))?;

        self.log(
            project.id,
            LogLevel::Info,
            &format!(
                "Starting training: {epochs} epochs, lr={learning_rate}, batch_size={batch_size}"
            ),
        )
        .await;

        let config = TrainingConfig::new()
            .with_epochs(epochs)
            .with_learning_rate(learning_rate)
            .with_batch_size(batch_size)
            .with_image_size(self.options.image_size);

        let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel();
        let progress_store = Arc::clone(&self.store);
        let progress_project = project.id;
        let progress_task = tokio::spawn(async move {
            while let Some(stats) = progress_rx.recv().await {
                let stats: vision::EpochStats = stats;
                let message = format!(
                    "Epoch {}/{epochs}: train_loss={:.4}, val_loss={:.4}, val_acc={:.2}%",
                    stats.epoch,
                    stats.train_loss,
                    stats.val_loss,
                    stats.val_accuracy * 100.0,
                );
                if let Err(err) = progress_store
                    .append_log(
                        Some(progress_project),
                        AgentName::Training,
                        LogLevel::Info,
                        &message,
                    )
                    .await
                {
                    warn!(error = %err, "Failed to append epoch log");
                }
            }
        });

        let training_started = Instant::now();
        let train_task = tokio::task::spawn_blocking(move || {
            train(model, &train_dataset, &val_dataset, &config, &device, |stats| {
                let _ = progress_tx.send(stats.clone());
            })
        });

        let joined = tokio::time::timeout(self.options.step_timeout, train_task)
            .await
            .map_err(|_| WorkflowError::new(ErrorKind::Timeout, "train", "deadline exceeded"))?
            .map_err(|e| {
                WorkflowError::new(ErrorKind::ResourceExhausted, "train", e.to_string())
            })?;
        let (trained, output) = joined.map_err(|e| from_vision("train", e))?;
        let training_seconds = training_started.elapsed().as_secs();
        progress_task.await.ok();

        self.log(
            project.id,
            LogLevel::Info,
            &format!("Training completed in {training_seconds} seconds"),
        )
        .await;

        // Save, upload, record.
        let weights_path = workdir.join("model.mpk");
        trained
            .save_weights(&weights_path)
            .map_err(|e| from_vision("save_weights", e))?;

        let slug = slugify(&project.name);
        let weights_uri = self
            .storage
            .uri_for(&format!("models/{slug}_model.mpk"))
            .map_err(|e| WorkflowError::from_storage("upload_model", e))?;
        self.storage
            .upload(&weights_path, &weights_uri)
            .await
            .map_err(|e| WorkflowError::from_storage("upload_model", e))?;
        self.log(
            project.id,
            LogLevel::Info,
            &format!("Model uploaded: {weights_uri}"),
        )
        .await;

        retry_transient("insert_model", 3, || {
            self.store.insert_model(NewModel {
                project_id: project.id,
                name: format!("{slug}_model"),
                framework: project.framework,
                object_uri: weights_uri.to_string(),
                metadata: serde_json::json!({
                    "architecture": architecture.as_str(),
                    "epochs": output.epochs_completed,
                    "final_loss": output.final_train_loss,
                    "final_val_loss": output.final_val_loss,
                    "training_seconds": training_seconds,
                    "num_classes": num_classes,
                    "classes": layout.classes.clone(),
                }),
            })
        })
        .await
        .map_err(|e| WorkflowError::from_store("insert_model", e))?;

        self.advance_to_evaluation(project).await?;

        self.send_message(
            project.user_id,
            &format!(
                "Training finished for '{}' ({} epochs, final loss {:.4}). Evaluation is next.",
                project.name, output.epochs_completed, output.final_train_loss,
            ),
        )
        .await;

        Ok(())
    }

    /// Loads pretrained backbone weights when a prefix is configured.
    ///
    /// A missing or unreadable record is not fatal; training proceeds from a
    /// fresh initialization with a warning.
    async fn load_pretrained(
        &self,
        project_id: Uuid,
        architecture: Architecture,
        num_classes: usize,
        model: ImageClassifier<TrainBackend>,
        workdir: &Workdir,
        device: &NdArrayDevice,
    ) -> ImageClassifier<TrainBackend> {
        let Some(prefix) = &self.options.pretrained_prefix else {
            return model;
        };

        let path = format!("{}/{architecture}.mpk", prefix.trim_end_matches('/'));
        let uri = match self.storage.uri_for(&path) {
            Ok(uri) => uri,
            Err(err) => {
                warn!(error = %err, "Invalid pretrained weights path");
                return model;
            }
        };

        let local = workdir.join("pretrained.mpk");
        if let Err(err) = self.storage.download(&uri, &local).await {
            self.log(
                project_id,
                LogLevel::Warning,
                &format!("Pretrained weights unavailable ({err}), training from scratch"),
            )
            .await;
            return model;
        }

        match model.load_pretrained_features(&local, device) {
            Ok(loaded) => {
                info!(project_id = %project_id, %architecture, "Loaded pretrained features");
                loaded
            }
            Err(err) => {
                self.log(
                    project_id,
                    LogLevel::Warning,
                    &format!("Pretrained record rejected ({err}), training from scratch"),
                )
                .await;
                ImageClassifier::new(architecture, num_classes, device)
            }
        }
    }

    async fn advance_to_evaluation(&self, project: &Project) -> Result<(), WorkflowError> {
        let outcome = retry_transient("advance_status", self.options.advance_retries, || {
            self.store.advance_status(
                project.id,
                ProjectStatus::PendingTraining,
                ProjectStatus::PendingEvaluation,
                None,
            )
        })
        .await;

        match outcome {
            Ok(AdvanceOutcome::Claimed) => {
                info!(project_id = %project.id, "Advanced to pending_evaluation");
                Ok(())
            }
            Ok(AdvanceOutcome::NotClaimed) => Err(WorkflowError::new(
                ErrorKind::Conflict,
                "advance_status",
                "project no longer in pending_training",
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
            .append_log(Some(project_id), AgentName::Training, level, message)
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

/// Maps vision errors onto the workflow taxonomy.
pub(crate) fn from_vision(step: &'static str, err: VisionError) -> WorkflowError {
    let kind = match &err {
        VisionError::BadLayout(_) | VisionError::EmptyDataset(_) | VisionError::Zip(_) => {
            ErrorKind::BadDatasetLayout
        }
        VisionError::UnsupportedArchitecture(_) => ErrorKind::InputInvalid,
        VisionError::Decode { .. } => ErrorKind::BadDatasetLayout,
        VisionError::Checkpoint(_) | VisionError::Io(_) => ErrorKind::Dependency,
    };
    WorkflowError::new(kind, step, err.to_string())
}

#[async_trait]
impl ProjectWorker for TrainingWorkflow {
    fn agent(&self) -> AgentName {
        AgentName::Training
    }

    fn owned_status(&self) -> ProjectStatus {
        ProjectStatus::PendingTraining
    }

    async fn process(&self, project: Project) -> Result<(), WorkflowError> {
        self.process_project(project).await
    }
}
