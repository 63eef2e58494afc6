//! Dataset workflow behavior against the in-memory store and object store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use agent_runtime::ErrorKind;
use async_trait::async_trait;
use database::{
    AdvanceOutcome, AgentLog, AgentName, DatasetProvider, DatasetRecord, Framework, LogLevel,
    MemoryStore, Message, MessageRole, ModelRecord, NewDataset, NewModel, NewProject, Project,
    ProjectStatus, StatusCount, Store, StoreError, TaskType, User,
};
use dataset_agent::source::{DatasetHit, DatasetSource, SourceError};
use dataset_agent::{DatasetAgentOptions, DatasetWorkflow};
use object_store::memory::InMemory;
use storage::ObjectStorage;
use uuid::Uuid;

struct StubSource {
    hits: Vec<DatasetHit>,
    search_calls: AtomicUsize,
}

impl StubSource {
    fn new(hits: Vec<DatasetHit>) -> Arc<Self> {
        Arc::new(Self {
            hits,
            search_calls: AtomicUsize::new(0),
        })
    }

    fn searches(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatasetSource for StubSource {
    async fn search(&self, _keywords: &[String]) -> Result<Vec<DatasetHit>, SourceError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.hits.clone())
    }

    async fn download(&self, hit: &DatasetHit, dest_dir: &Path) -> Result<PathBuf, SourceError> {
        let dest = dest_dir.join(format!("{}.zip", hit.slug.replace('/', "_")));
        std::fs::write(&dest, b"PK\x03\x04 stub archive bytes")?;
        Ok(dest)
    }
}

/// Store wrapper that fails `advance_status` with a configurable error.
struct FlakyAdvanceStore {
    inner: Arc<MemoryStore>,
    advance_error: Option<StoreError>,
}

#[async_trait]
impl Store for FlakyAdvanceStore {
    async fn get_or_create_user(
        &self,
        external_auth_id: &str,
        email: Option<&str>,
    ) -> Result<User, StoreError> {
        self.inner.get_or_create_user(external_auth_id, email).await
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        self.inner.get_user(id).await
    }

    async fn get_user_by_external_id(&self, external: &str) -> Result<Option<User>, StoreError> {
        self.inner.get_user_by_external_id(external).await
    }

    async fn insert_project(&self, input: NewProject) -> Result<Project, StoreError> {
        self.inner.insert_project(input).await
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, StoreError> {
        self.inner.get_project(id).await
    }

    async fn list_projects_by_user(&self, user_id: Uuid) -> Result<Vec<Project>, StoreError> {
        self.inner.list_projects_by_user(user_id).await
    }

    async fn get_projects_by_status(
        &self,
        status: ProjectStatus,
        limit: i64,
    ) -> Result<Vec<Project>, StoreError> {
        self.inner.get_projects_by_status(status, limit).await
    }

    async fn advance_status(
        &self,
        project_id: Uuid,
        from: ProjectStatus,
        to: ProjectStatus,
        metadata_patch: Option<serde_json::Value>,
    ) -> Result<AdvanceOutcome, StoreError> {
        if let Some(err) = &self.advance_error {
            return Err(err.clone());
        }
        self.inner
            .advance_status(project_id, from, to, metadata_patch)
            .await
    }

    async fn mark_failed(
        &self,
        project_id: Uuid,
        error: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.inner.mark_failed(project_id, error).await
    }

    async fn update_project_metadata(
        &self,
        project_id: Uuid,
        patch: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.inner.update_project_metadata(project_id, patch).await
    }

    async fn insert_dataset(&self, input: NewDataset) -> Result<DatasetRecord, StoreError> {
        self.inner.insert_dataset(input).await
    }

    async fn get_dataset_by_project(
        &self,
        project_id: Uuid,
    ) -> Result<Option<DatasetRecord>, StoreError> {
        self.inner.get_dataset_by_project(project_id).await
    }

    async fn insert_model(&self, input: NewModel) -> Result<ModelRecord, StoreError> {
        self.inner.insert_model(input).await
    }

    async fn get_model_by_project(
        &self,
        project_id: Uuid,
    ) -> Result<Option<ModelRecord>, StoreError> {
        self.inner.get_model_by_project(project_id).await
    }

    async fn update_model_metrics(
        &self,
        model_id: Uuid,
        accuracy: f64,
        metadata_patch: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.inner
            .update_model_metrics(model_id, accuracy, metadata_patch)
            .await
    }

    async fn append_log(
        &self,
        project_id: Option<Uuid>,
        agent: AgentName,
        level: LogLevel,
        message: &str,
    ) -> Result<(), StoreError> {
        self.inner.append_log(project_id, agent, level, message).await
    }

    async fn list_logs(
        &self,
        project_id: Uuid,
        agent: Option<AgentName>,
        limit: i64,
    ) -> Result<Vec<AgentLog>, StoreError> {
        self.inner.list_logs(project_id, agent, limit).await
    }

    async fn write_message(
        &self,
        user_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<Message, StoreError> {
        self.inner.write_message(user_id, role, content).await
    }

    async fn list_messages(&self, user_id: Uuid, limit: i64) -> Result<Vec<Message>, StoreError> {
        self.inner.list_messages(user_id, limit).await
    }

    async fn count_projects_by_status(&self) -> Result<Vec<StatusCount>, StoreError> {
        self.inner.count_projects_by_status().await
    }

    async fn count_users(&self) -> Result<i64, StoreError> {
        self.inner.count_users().await
    }

    async fn list_recent_projects(&self, limit: i64) -> Result<Vec<Project>, StoreError> {
        self.inner.list_recent_projects(limit).await
    }

    async fn list_recent_users(&self, limit: i64) -> Result<Vec<User>, StoreError> {
        self.inner.list_recent_users(limit).await
    }

    async fn list_recent_logs(&self, limit: i64) -> Result<Vec<AgentLog>, StoreError> {
        self.inner.list_recent_logs(limit).await
    }
}

const GB: u64 = 1024 * 1024 * 1024;

fn hit(slug: &str, bytes: u64, downloads: u64) -> DatasetHit {
    DatasetHit {
        slug: slug.to_string(),
        title: slug.replace('/', " "),
        total_bytes: bytes,
        download_count: downloads,
    }
}

async fn seed_project(store: &dyn Store, max_size_gb: f64) -> Project {
    let user = store.get_or_create_user("ext-user", None).await.unwrap();
    store
        .insert_project(NewProject {
            user_id: user.id,
            name: "Flower Classifier".to_string(),
            task_type: TaskType::ImageClassification,
            framework: Framework::Pytorch,
            dataset_source: DatasetProvider::Kaggle,
            search_keywords: vec!["flower".to_string(), "classifier".to_string()],
            status: ProjectStatus::PendingDataset,
            metadata: serde_json::json!({ "max_dataset_size_gb": max_size_gb }),
        })
        .await
        .unwrap()
}

fn storage() -> Arc<ObjectStorage> {
    Arc::new(ObjectStorage::new(Arc::new(InMemory::new()), "automl-artifacts"))
}

fn workflow(
    store: Arc<dyn Store>,
    storage: Arc<ObjectStorage>,
    source: Arc<dyn DatasetSource>,
) -> DatasetWorkflow {
    DatasetWorkflow::new(store, storage, source, DatasetAgentOptions::default())
}

#[tokio::test]
async fn test_happy_path_advances_with_artifacts_first() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let object_storage = storage();
    let source = StubSource::new(vec![hit("maria/flower-photos", GB / 2, 5000)]);

    let project = seed_project(store.as_ref(), 50.0).await;
    let flow = workflow(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&object_storage),
        Arc::clone(&source) as Arc<dyn DatasetSource>,
    );

    flow.process_project(project.clone()).await.unwrap();

    let updated = store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(updated.status, ProjectStatus::PendingTraining);

    let dataset = store
        .get_dataset_by_project(project.id)
        .await
        .unwrap()
        .expect("dataset row must exist");
    assert_eq!(dataset.name, "maria/flower-photos");
    assert!(dataset.object_uri.contains("raw/flower-classifier.zip"));

    // The stored URI must resolve (upload verified before the DB write).
    let uri: storage::ObjectUri = dataset.object_uri.parse().unwrap();
    assert!(object_storage.head(&uri).await.unwrap().unwrap() > 0);

    // And the user heard about it.
    let messages = store.list_messages(project.user_id, 10).await.unwrap();
    assert!(messages.iter().any(|m| m.content.contains("uploaded successfully")));
}

#[tokio::test]
async fn test_size_cap_filters_candidates() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let source = StubSource::new(vec![
        hit("big/flower-hd", 2 * GB, 100_000),
        hit("small/flower-mini", 400 * 1024 * 1024, 50),
    ]);

    // Plan asks for at most 0.5 GB.
    let project = seed_project(store.as_ref(), 0.5).await;
    let flow = workflow(
        Arc::clone(&store) as Arc<dyn Store>,
        storage(),
        Arc::clone(&source) as Arc<dyn DatasetSource>,
    );
    flow.process_project(project.clone()).await.unwrap();

    let dataset = store
        .get_dataset_by_project(project.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dataset.name, "small/flower-mini");
}

#[tokio::test]
async fn test_no_candidate_marks_failed() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let source = StubSource::new(Vec::new());

    let project = seed_project(store.as_ref(), 50.0).await;
    let flow = workflow(
        Arc::clone(&store) as Arc<dyn Store>,
        storage(),
        Arc::clone(&source) as Arc<dyn DatasetSource>,
    );

    let err = flow.process_project(project.clone()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoCandidate);

    let updated = store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(updated.status, ProjectStatus::Failed);
    assert_eq!(
        updated.metadata["error"]["kind"],
        serde_json::json!("no_candidate")
    );
    assert!(store
        .get_dataset_by_project(project.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_smart_failure_keeps_project_pending_and_resumes() {
    let memory: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let object_storage = storage();
    let source = StubSource::new(vec![hit("maria/flower-photos", GB / 2, 5000)]);
    let project = seed_project(memory.as_ref(), 50.0).await;

    // First run: the final advance fails permanently after the dataset row
    // was inserted.
    let flaky: Arc<dyn Store> = Arc::new(FlakyAdvanceStore {
        inner: Arc::clone(&memory),
        advance_error: Some(StoreError::Permanent("db write rejected".to_string())),
    });
    let flow = workflow(
        flaky,
        Arc::clone(&object_storage),
        Arc::clone(&source) as Arc<dyn DatasetSource>,
    );
    flow.process_project(project.clone()).await.unwrap();

    let after_first = memory.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(after_first.status, ProjectStatus::PendingDataset);
    assert!(memory
        .get_dataset_by_project(project.id)
        .await
        .unwrap()
        .is_some());

    let logs = memory.list_logs(project.id, None, 50).await.unwrap();
    assert!(logs.iter().any(|log| log.log_level == LogLevel::Warning
        && log.message.contains("status update failed")));
    assert_eq!(source.searches(), 1);

    // Second run resumes: the dataset row short-circuits search/download and
    // only the advance is re-attempted.
    let healthy: Arc<dyn Store> = Arc::new(FlakyAdvanceStore {
        inner: Arc::clone(&memory),
        advance_error: None,
    });
    let flow = workflow(
        healthy,
        object_storage,
        Arc::clone(&source) as Arc<dyn DatasetSource>,
    );
    let refreshed = memory.get_project(project.id).await.unwrap().unwrap();
    flow.process_project(refreshed).await.unwrap();

    let after_second = memory.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(after_second.status, ProjectStatus::PendingTraining);
    assert_eq!(source.searches(), 1, "resume must not search again");
}

#[tokio::test]
async fn test_claim_race_loser_exits_cleanly() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let object_storage = storage();
    let source = StubSource::new(vec![hit("maria/flower-photos", GB / 2, 5000)]);

    let project = seed_project(store.as_ref(), 50.0).await;
    let flow = workflow(
        Arc::clone(&store) as Arc<dyn Store>,
        object_storage,
        Arc::clone(&source) as Arc<dyn DatasetSource>,
    );

    // Winner advances the row first.
    flow.process_project(project.clone()).await.unwrap();

    // The loser still holds the stale pending_dataset snapshot. It sees the
    // dataset row, attempts the advance, gets not-claimed, and exits without
    // failing the project.
    flow.process_project(project.clone()).await.unwrap();

    let updated = store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(updated.status, ProjectStatus::PendingTraining);

    let logs = store.list_logs(project.id, None, 50).await.unwrap();
    assert!(logs.iter().any(|log| log.log_level == LogLevel::Info
        && log.message.contains("Another worker advanced the project")));
}
