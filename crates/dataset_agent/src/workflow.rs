//! The dataset agent workflow.
//!
//! Order matters: the archive is uploaded and the dataset row inserted
//! before the status flips to `pending_training`, so observers never see
//! the new status without its artifacts. If the final advance fails after
//! the dataset row exists, the project is left in `pending_dataset` for a
//! later run to resume; it is never marked `failed` in that state.

use std::sync::Arc;

use agent_runtime::{
    retry_transient, slugify, ErrorKind, ProjectWorker, Workdir, WorkflowError,
};
use async_trait::async_trait;
use database::{
    AdvanceOutcome, AgentName, LogLevel, MessageRole, NewDataset, Project, ProjectStatus, Store,
};
use storage::ObjectStorage;
use tracing::{info, warn};
use uuid::Uuid;

use crate::source::{format_size_gb, select_candidate, DatasetSource};

/// Dataset agent knobs.
#[derive(Debug, Clone)]
pub struct DatasetAgentOptions {
    /// Hard ceiling applied over whatever the plan requests.
    pub size_cap_gb: f64,
    /// Attempts for the final conditional status update.
    pub advance_retries: usize,
}

impl Default for DatasetAgentOptions {
    fn default() -> Self {
        Self {
            size_cap_gb: 50.0,
            advance_retries: 3,
        }
    }
}

/// Claims `pending_dataset` projects and produces their dataset archive.
pub struct DatasetWorkflow {
    store: Arc<dyn Store>,
    storage: Arc<ObjectStorage>,
    source: Arc<dyn DatasetSource>,
    options: DatasetAgentOptions,
}

impl DatasetWorkflow {
    pub fn new(
        store: Arc<dyn Store>,
        storage: Arc<ObjectStorage>,
        source: Arc<dyn DatasetSource>,
        options: DatasetAgentOptions,
    ) -> Self {
        Self {
            store,
            storage,
            source,
            options,
        }
    }

    /// Runs the workflow for one project, applying the failure policy.
    ///
    /// # Errors
    ///
    /// Returns the workflow error for failures that marked the project
    /// `failed`. Conflict (another worker advanced the row) and integrity
    /// (artifact exists, only the flip is missing) resolve to `Ok`.
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
                    &format!("Dataset uploaded but status update failed: {}", err.detail),
                )
                .await;
                self.send_message(
                    project.user_id,
                    "Your dataset was uploaded successfully, but the project status could not \
                     be updated. It will be retried automatically; contact support if the \
                     project stays stuck.",
                )
                .await;
                Ok(())
            }
            _ => {
                self.log(project.id, LogLevel::Error, &format!("Error: {err}")).await;
                self.fail_project(&project, &err).await;
                self.send_message(
                    project.user_id,
                    &format!("Dataset discovery failed for '{}'.", project.name),
                )
                .await;
                Err(err)
            }
        }
    }

    async fn run(&self, project: &Project) -> Result<(), WorkflowError> {
        self.log(project.id, LogLevel::Info, "Starting dataset agent").await;

        // Resume case: a previous run uploaded the dataset but could not
        // flip the status. Skip search and download entirely.
        let existing = retry_transient("get_dataset_by_project", 3, || {
            self.store.get_dataset_by_project(project.id)
        })
        .await
        .map_err(|e| WorkflowError::from_store("load_dataset", e))?;

        if let Some(dataset) = existing {
            self.log(
                project.id,
                LogLevel::Info,
                &format!(
                    "Dataset row already exists ({}), re-attempting status advance",
                    dataset.name
                ),
            )
            .await;
            self.advance_to_training(project).await?;
            self.send_message(
                project.user_id,
                &format!(
                    "Dataset ready: {} ({})\nTraining can now begin.",
                    dataset.name, dataset.size
                ),
            )
            .await;
            return Ok(());
        }

        let cap = project
            .metadata_f64("max_dataset_size_gb")
            .unwrap_or(self.options.size_cap_gb)
            .min(self.options.size_cap_gb);

        self.log(
            project.id,
            LogLevel::Info,
            &format!(
                "Searching for dataset with keywords {:?}, max size {cap} GB",
                project.search_keywords
            ),
        )
        .await;
        self.send_message(
            project.user_id,
            &format!("Searching for datasets (max {cap} GB)..."),
        )
        .await;

        let hits = self
            .source
            .search(&project.search_keywords)
            .await
            .map_err(|e| WorkflowError::new(ErrorKind::Dependency, "search", e.to_string()))?;

        let Some(best) = select_candidate(&hits, &project.search_keywords, cap) else {
            return Err(WorkflowError::new(
                ErrorKind::NoCandidate,
                "search",
                format!("no dataset candidates under {cap} GB"),
            ));
        };

        self.log(
            project.id,
            LogLevel::Info,
            &format!("Found dataset: {}", best.slug),
        )
        .await;
        self.send_message(project.user_id, &format!("Downloading dataset: {}...", best.slug))
            .await;

        let workdir = Workdir::create("dataset-agent")
            .map_err(|e| WorkflowError::new(ErrorKind::ResourceExhausted, "workdir", e.to_string()))?;

        let archive = self
            .source
            .download(&best, workdir.path())
            .await
            .map_err(|e| WorkflowError::new(ErrorKind::Dependency, "download", e.to_string()))?;

        let archive_bytes = std::fs::metadata(&archive)
            .map_err(|e| WorkflowError::new(ErrorKind::Dependency, "download", e.to_string()))?
            .len();
        if archive_bytes == 0 {
            return Err(WorkflowError::new(
                ErrorKind::Dependency,
                "download",
                "downloaded archive is empty",
            ));
        }

        let extension = archive
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("zip");
        let object_path = format!("raw/{}.{extension}", slugify(&project.name));
        let uri = self
            .storage
            .uri_for(&object_path)
            .map_err(|e| WorkflowError::from_storage("upload", e))?;

        self.send_message(project.user_id, "Uploading dataset to the artifact store...")
            .await;
        self.storage
            .upload(&archive, &uri)
            .await
            .map_err(|e| WorkflowError::from_storage("upload", e))?;

        let size = format_size_gb(archive_bytes);
        retry_transient("insert_dataset", 3, || {
            self.store.insert_dataset(NewDataset {
                project_id: project.id,
                name: best.slug.clone(),
                object_uri: uri.to_string(),
                size: size.clone(),
                source: project.dataset_source,
            })
        })
        .await
        .map_err(|e| WorkflowError::from_store("insert_dataset", e))?;

        self.log(project.id, LogLevel::Info, "Recorded dataset metadata").await;

        self.advance_to_training(project).await?;

        self.log(project.id, LogLevel::Info, "Dataset agent completed successfully")
            .await;
        self.send_message(
            project.user_id,
            &format!(
                "Dataset uploaded successfully!\nDataset: {}\nSize: {size}\nTraining will begin \
                 shortly.",
                best.slug
            ),
        )
        .await;

        Ok(())
    }

    /// The critical conditional update, with its own bounded retry budget.
    ///
    /// Any failure here happens after the dataset row exists, so it maps to
    /// `integrity` rather than a project failure.
    async fn advance_to_training(&self, project: &Project) -> Result<(), WorkflowError> {
        let outcome = retry_transient("advance_status", self.options.advance_retries, || {
            self.store.advance_status(
                project.id,
                ProjectStatus::PendingDataset,
                ProjectStatus::PendingTraining,
                None,
            )
        })
        .await;

        match outcome {
            Ok(AdvanceOutcome::Claimed) => {
                info!(project_id = %project.id, "Advanced to pending_training");
                Ok(())
            }
            Ok(AdvanceOutcome::NotClaimed) => Err(WorkflowError::new(
                ErrorKind::Conflict,
                "advance_status",
                "project no longer in pending_dataset",
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

    async fn fail_project(&self, project: &Project, err: &WorkflowError) {
        // A dataset row appearing here means a concurrent run got further
        // than this one; do not tear the project down underneath it.
        match self.store.get_dataset_by_project(project.id).await {
            Ok(Some(_)) => {
                self.log(
                    project.id,
                    LogLevel::Warning,
                    "Dataset exists despite the error; not marking the project failed",
                )
                .await;
                return;
            }
            Ok(None) => {}
            Err(check_err) => {
                warn!(project_id = %project.id, error = %check_err, "Dataset existence check failed");
            }
        }

        let failed = retry_transient("mark_failed", 3, || {
            self.store.mark_failed(project.id, err.to_metadata())
        })
        .await;
        if let Err(mark_err) = failed {
            warn!(project_id = %project.id, error = %mark_err, "Failed to mark project failed");
        }
    }

    async fn log(&self, project_id: Uuid, level: LogLevel, message: &str) {
        if let Err(err) = self
            .store
            .append_log(Some(project_id), AgentName::Dataset, level, message)
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

#[async_trait]
impl ProjectWorker for DatasetWorkflow {
    fn agent(&self) -> AgentName {
        AgentName::Dataset
    }

    fn owned_status(&self) -> ProjectStatus {
        ProjectStatus::PendingDataset
    }

    async fn process(&self, project: Project) -> Result<(), WorkflowError> {
        self.process_project(project).await
    }
}
