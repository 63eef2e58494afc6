//! Shared polling runtime for the dataset, training, and evaluation agents.
//!
//! Each tick fetches candidate projects for the owned status (oldest
//! `updated_at` first), skips ids already in flight, and runs the agent
//! workflow synchronously. Stopping is graceful: the current workflow
//! finishes before the loop exits.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use database::{AgentName, Project, ProjectStatus, Store};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::WorkflowError;

/// One agent's workflow, as driven by the poller.
#[async_trait]
pub trait ProjectWorker: Send + Sync + 'static {
    /// Name used in logs.
    fn agent(&self) -> AgentName;

    /// The status this worker owns and polls for.
    fn owned_status(&self) -> ProjectStatus;

    /// Runs the workflow for one claimed project.
    async fn process(&self, project: Project) -> Result<(), WorkflowError>;
}

/// Per-agent polling knobs.
#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    pub batch_limit: i64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_limit: 1,
        }
    }
}

/// State reported by `GET /agents/<name>/polling/status`.
#[derive(Debug, Clone, Serialize)]
pub struct PollingStatus {
    pub is_running: bool,
    pub poll_interval: u64,
    pub processed_projects_count: u64,
}

struct PollerInner {
    store: Arc<dyn Store>,
    worker: Arc<dyn ProjectWorker>,
    config: PollerConfig,
    running: AtomicBool,
    processed: AtomicU64,
    in_flight: Mutex<HashSet<Uuid>>,
    stop: Notify,
}

/// Periodic wake / claim / run / report loop.
#[derive(Clone)]
pub struct Poller {
    inner: Arc<PollerInner>,
}

impl Poller {
    pub fn new(store: Arc<dyn Store>, worker: Arc<dyn ProjectWorker>, config: PollerConfig) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                store,
                worker,
                config,
                running: AtomicBool::new(false),
                processed: AtomicU64::new(0),
                in_flight: Mutex::new(HashSet::new()),
                stop: Notify::new(),
            }),
        }
    }

    /// Starts the loop. Idempotent: returns false if already running.
    pub fn start(&self) -> bool {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let inner = Arc::clone(&self.inner);
        info!(
            agent = %inner.worker.agent(),
            interval_seconds = inner.config.poll_interval.as_secs(),
            "Polling started"
        );
        tokio::spawn(async move {
            Self::run(inner).await;
        });
        true
    }

    /// Signals the loop to exit after the current workflow. Idempotent.
    pub fn stop(&self) -> bool {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.inner.stop.notify_waiters();
        info!(agent = %self.inner.worker.agent(), "Polling stop requested");
        true
    }

    #[must_use]
    pub fn status(&self) -> PollingStatus {
        PollingStatus {
            is_running: self.inner.running.load(Ordering::SeqCst),
            poll_interval: self.inner.config.poll_interval.as_secs(),
            processed_projects_count: self.inner.processed.load(Ordering::SeqCst),
        }
    }

    async fn run(inner: Arc<PollerInner>) {
        while inner.running.load(Ordering::SeqCst) {
            Self::tick(&inner).await;

            tokio::select! {
                () = tokio::time::sleep(inner.config.poll_interval) => {}
                () = inner.stop.notified() => {}
            }
        }
        info!(agent = %inner.worker.agent(), "Polling stopped");
    }

    async fn tick(inner: &Arc<PollerInner>) {
        let candidates = match inner
            .store
            .get_projects_by_status(inner.worker.owned_status(), inner.config.batch_limit)
            .await
        {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(agent = %inner.worker.agent(), error = %err, "Poll query failed");
                return;
            }
        };

        for project in candidates {
            {
                let mut in_flight = inner.in_flight.lock().await;
                if !in_flight.insert(project.id) {
                    continue;
                }
            }

            let project_id = project.id;
            info!(
                agent = %inner.worker.agent(),
                project_id = %project_id,
                name = %project.name,
                "Processing project"
            );

            match inner.worker.process(project).await {
                Ok(()) => {
                    info!(agent = %inner.worker.agent(), project_id = %project_id, "Workflow finished");
                }
                Err(err) => {
                    error!(
                        agent = %inner.worker.agent(),
                        project_id = %project_id,
                        kind = %err.kind,
                        "Workflow failed: {err}"
                    );
                }
            }

            inner.processed.fetch_add(1, Ordering::SeqCst);
            inner.in_flight.lock().await.remove(&project_id);

            if !inner.running.load(Ordering::SeqCst) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use database::{
        DatasetProvider, Framework, MemoryStore, NewProject, TaskType,
    };

    use super::*;

    struct CountingWorker {
        seen: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl ProjectWorker for CountingWorker {
        fn agent(&self) -> AgentName {
            AgentName::Dataset
        }

        fn owned_status(&self) -> ProjectStatus {
            ProjectStatus::PendingDataset
        }

        async fn process(&self, project: Project) -> Result<(), WorkflowError> {
            self.seen.lock().await.push(project.id);
            Ok(())
        }
    }

    async fn seed_project(store: &MemoryStore) -> Uuid {
        let user = store.get_or_create_user("ext", None).await.unwrap();
        store
            .insert_project(NewProject {
                user_id: user.id,
                name: "poll me".to_string(),
                task_type: TaskType::ImageClassification,
                framework: Framework::Pytorch,
                dataset_source: DatasetProvider::Kaggle,
                search_keywords: vec!["x".to_string()],
                status: ProjectStatus::PendingDataset,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let worker = Arc::new(CountingWorker {
            seen: Mutex::new(Vec::new()),
        });
        let poller = Poller::new(store, worker, PollerConfig::default());

        assert!(poller.start());
        assert!(!poller.start());
        assert!(poller.status().is_running);
        assert!(poller.stop());
        assert!(!poller.stop());
    }

    #[tokio::test]
    async fn test_tick_processes_and_counts() {
        let store = Arc::new(MemoryStore::new());
        let id = seed_project(&store).await;

        let worker = Arc::new(CountingWorker {
            seen: Mutex::new(Vec::new()),
        });
        let poller = Poller::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&worker) as Arc<dyn ProjectWorker>,
            PollerConfig {
                poll_interval: Duration::from_millis(10),
                batch_limit: 4,
            },
        );

        poller.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        poller.stop();

        let seen = worker.seen.lock().await;
        assert!(seen.contains(&id));
        assert!(poller.status().processed_projects_count >= 1);
    }
}
