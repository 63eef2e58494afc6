//! In-memory store for tests and local development.
//!
//! Mirrors the `PostgreSQL` semantics closely enough for workflow tests:
//! `advance_status` is atomic under the inner lock and `updated_at` strictly
//! increases on every mutation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    AgentLog, AgentName, DatasetRecord, LogLevel, Message, MessageRole, ModelRecord, NewDataset,
    NewModel, NewProject, Project, ProjectStatus, StatusCount, User,
};
use crate::store::{check_transition, merge_metadata, AdvanceOutcome, Store};

#[derive(Default)]
struct Inner {
    users: Vec<User>,
    projects: HashMap<Uuid, Project>,
    datasets: Vec<DatasetRecord>,
    models: Vec<ModelRecord>,
    logs: Vec<AgentLog>,
    messages: Vec<Message>,
}

/// Store backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Flips the admin bit on a user, for tests and local setups.
    pub async fn set_admin(&self, external_auth_id: &str, is_admin: bool) -> bool {
        let mut inner = self.inner.lock().await;
        match inner
            .users
            .iter_mut()
            .find(|u| u.external_auth_id == external_auth_id)
        {
            Some(user) => {
                user.is_admin = is_admin;
                true
            }
            None => false,
        }
    }
}

fn bump_updated_at(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    let floor = previous + Duration::microseconds(1);
    if now > floor { now } else { floor }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_or_create_user(
        &self,
        external_auth_id: &str,
        email: Option<&str>,
    ) -> Result<User, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(user) = inner
            .users
            .iter()
            .find(|u| u.external_auth_id == external_auth_id)
        {
            return Ok(user.clone());
        }

        let user = User {
            id: Uuid::new_v4(),
            external_auth_id: external_auth_id.to_string(),
            email: email.map(str::to_string),
            is_admin: false,
            created_at: Utc::now(),
        };
        inner.users.push(user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.users.iter().find(|u| u.id == id).cloned())
    }

    async fn get_user_by_external_id(&self, external: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .iter()
            .find(|u| u.external_auth_id == external)
            .cloned())
    }

    async fn insert_project(&self, input: NewProject) -> Result<Project, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let project = Project {
            id: Uuid::new_v4(),
            user_id: input.user_id,
            name: input.name,
            task_type: input.task_type,
            framework: input.framework,
            dataset_source: input.dataset_source,
            search_keywords: input.search_keywords,
            status: input.status,
            metadata: input.metadata,
            created_at: now,
            updated_at: now,
        };
        inner.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.projects.get(&id).cloned())
    }

    async fn list_projects_by_user(&self, user_id: Uuid) -> Result<Vec<Project>, StoreError> {
        let inner = self.inner.lock().await;
        let mut projects: Vec<Project> = inner
            .projects
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(projects)
    }

    async fn get_projects_by_status(
        &self,
        status: ProjectStatus,
        limit: i64,
    ) -> Result<Vec<Project>, StoreError> {
        let inner = self.inner.lock().await;
        let mut projects: Vec<Project> = inner
            .projects
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        projects.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        projects.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(projects)
    }

    async fn advance_status(
        &self,
        project_id: Uuid,
        from: ProjectStatus,
        to: ProjectStatus,
        metadata_patch: Option<Value>,
    ) -> Result<AdvanceOutcome, StoreError> {
        check_transition(from, to)?;

        let mut inner = self.inner.lock().await;
        let Some(project) = inner.projects.get_mut(&project_id) else {
            return Ok(AdvanceOutcome::NoSuchProject);
        };

        if project.status != from {
            return Ok(AdvanceOutcome::NotClaimed);
        }

        project.status = to;
        if let Some(patch) = metadata_patch {
            merge_metadata(&mut project.metadata, &patch);
        }
        project.updated_at = bump_updated_at(project.updated_at);
        Ok(AdvanceOutcome::Claimed)
    }

    async fn mark_failed(&self, project_id: Uuid, error: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(project) = inner.projects.get_mut(&project_id) else {
            return Err(StoreError::NotFound(format!("project {project_id}")));
        };

        if project.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "project {project_id} is already terminal"
            )));
        }

        project.status = ProjectStatus::Failed;
        merge_metadata(
            &mut project.metadata,
            &serde_json::json!({ "error": error }),
        );
        project.updated_at = bump_updated_at(project.updated_at);
        Ok(())
    }

    async fn update_project_metadata(
        &self,
        project_id: Uuid,
        patch: Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(project) = inner.projects.get_mut(&project_id) else {
            return Err(StoreError::NotFound(format!("project {project_id}")));
        };
        merge_metadata(&mut project.metadata, &patch);
        project.updated_at = bump_updated_at(project.updated_at);
        Ok(())
    }

    async fn insert_dataset(&self, input: NewDataset) -> Result<DatasetRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        let dataset = DatasetRecord {
            id: Uuid::new_v4(),
            project_id: input.project_id,
            name: input.name,
            object_uri: input.object_uri,
            size: input.size,
            source: input.source,
            created_at: Utc::now(),
        };
        inner.datasets.push(dataset.clone());
        Ok(dataset)
    }

    async fn get_dataset_by_project(
        &self,
        project_id: Uuid,
    ) -> Result<Option<DatasetRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .datasets
            .iter()
            .rev()
            .find(|d| d.project_id == project_id)
            .cloned())
    }

    async fn insert_model(&self, input: NewModel) -> Result<ModelRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        let model = ModelRecord {
            id: Uuid::new_v4(),
            project_id: input.project_id,
            name: input.name,
            framework: input.framework,
            object_uri: input.object_uri,
            accuracy: None,
            metadata: input.metadata,
            created_at: Utc::now(),
        };
        inner.models.push(model.clone());
        Ok(model)
    }

    async fn get_model_by_project(
        &self,
        project_id: Uuid,
    ) -> Result<Option<ModelRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .models
            .iter()
            .rev()
            .find(|m| m.project_id == project_id)
            .cloned())
    }

    async fn update_model_metrics(
        &self,
        model_id: Uuid,
        accuracy: f64,
        metadata_patch: Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(model) = inner.models.iter_mut().find(|m| m.id == model_id) else {
            return Err(StoreError::NotFound(format!("model {model_id}")));
        };
        model.accuracy = Some(accuracy);
        merge_metadata(&mut model.metadata, &metadata_patch);
        Ok(())
    }

    async fn append_log(
        &self,
        project_id: Option<Uuid>,
        agent: AgentName,
        level: LogLevel,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.logs.push(AgentLog {
            id: Uuid::new_v4(),
            project_id,
            agent_name: agent,
            message: message.to_string(),
            log_level: level,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_logs(
        &self,
        project_id: Uuid,
        agent: Option<AgentName>,
        limit: i64,
    ) -> Result<Vec<AgentLog>, StoreError> {
        let inner = self.inner.lock().await;
        let mut logs: Vec<AgentLog> = inner
            .logs
            .iter()
            .filter(|l| l.project_id == Some(project_id))
            .filter(|l| agent.is_none_or(|a| l.agent_name == a))
            .cloned()
            .collect();
        logs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        logs.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(logs)
    }

    async fn write_message(
        &self,
        user_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<Message, StoreError> {
        let mut inner = self.inner.lock().await;
        let message = Message {
            id: Uuid::new_v4(),
            user_id,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, user_id: Uuid, limit: i64) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().await;
        let mut messages: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        messages.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(messages)
    }

    async fn count_projects_by_status(&self) -> Result<Vec<StatusCount>, StoreError> {
        let inner = self.inner.lock().await;
        let mut counts: HashMap<ProjectStatus, i64> = HashMap::new();
        for project in inner.projects.values() {
            *counts.entry(project.status).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(status, count)| StatusCount { status, count })
            .collect())
    }

    async fn count_users(&self) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.users.len() as i64)
    }

    async fn list_recent_projects(&self, limit: i64) -> Result<Vec<Project>, StoreError> {
        let inner = self.inner.lock().await;
        let mut projects: Vec<Project> = inner.projects.values().cloned().collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        projects.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(projects)
    }

    async fn list_recent_users(&self, limit: i64) -> Result<Vec<User>, StoreError> {
        let inner = self.inner.lock().await;
        let mut users = inner.users.clone();
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        users.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(users)
    }

    async fn list_recent_logs(&self, limit: i64) -> Result<Vec<AgentLog>, StoreError> {
        let inner = self.inner.lock().await;
        let mut logs = inner.logs.clone();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        logs.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::models::{DatasetProvider, Framework, TaskType};

    fn new_project(user_id: Uuid, status: ProjectStatus) -> NewProject {
        NewProject {
            user_id,
            name: "Flower Classifier".to_string(),
            task_type: TaskType::ImageClassification,
            framework: Framework::Pytorch,
            dataset_source: DatasetProvider::Kaggle,
            search_keywords: vec!["flower".to_string(), "classifier".to_string()],
            status,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_user_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let first = store.get_or_create_user("ext-1", None).await.unwrap();
        let second = store
            .get_or_create_user("ext-1", Some("a@b.c"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.count_users().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_advance_claims_once() {
        let store = MemoryStore::new();
        let user = store.get_or_create_user("ext", None).await.unwrap();
        let project = store
            .insert_project(new_project(user.id, ProjectStatus::PendingDataset))
            .await
            .unwrap();

        let outcome = store
            .advance_status(
                project.id,
                ProjectStatus::PendingDataset,
                ProjectStatus::PendingTraining,
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome, AdvanceOutcome::Claimed);

        let outcome = store
            .advance_status(
                project.id,
                ProjectStatus::PendingDataset,
                ProjectStatus::PendingTraining,
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome, AdvanceOutcome::NotClaimed);

        let outcome = store
            .advance_status(
                Uuid::new_v4(),
                ProjectStatus::PendingDataset,
                ProjectStatus::PendingTraining,
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome, AdvanceOutcome::NoSuchProject);
    }

    #[tokio::test]
    async fn test_advance_rejects_illegal_transition() {
        let store = MemoryStore::new();
        let user = store.get_or_create_user("ext", None).await.unwrap();
        let project = store
            .insert_project(new_project(user.id, ProjectStatus::PendingDataset))
            .await
            .unwrap();

        let result = store
            .advance_status(
                project.id,
                ProjectStatus::PendingDataset,
                ProjectStatus::Completed,
                None,
            )
            .await;
        assert!(matches!(result, Err(StoreError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_concurrent_advance_exactly_one_claim() {
        let store = Arc::new(MemoryStore::new());
        let user = store.get_or_create_user("ext", None).await.unwrap();
        let project = store
            .insert_project(new_project(user.id, ProjectStatus::PendingDataset))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let id = project.id;
            handles.push(tokio::spawn(async move {
                store
                    .advance_status(
                        id,
                        ProjectStatus::PendingDataset,
                        ProjectStatus::PendingTraining,
                        None,
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap() == AdvanceOutcome::Claimed {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn test_updated_at_strictly_increases() {
        let store = MemoryStore::new();
        let user = store.get_or_create_user("ext", None).await.unwrap();
        let project = store
            .insert_project(new_project(user.id, ProjectStatus::PendingDataset))
            .await
            .unwrap();

        let before = project.updated_at;
        store
            .update_project_metadata(project.id, serde_json::json!({"k": 1}))
            .await
            .unwrap();
        let mid = store.get_project(project.id).await.unwrap().unwrap();
        assert!(mid.updated_at > before);

        store
            .update_project_metadata(project.id, serde_json::json!({"k": 2}))
            .await
            .unwrap();
        let after = store.get_project(project.id).await.unwrap().unwrap();
        assert!(after.updated_at > mid.updated_at);
    }

    #[tokio::test]
    async fn test_metadata_patch_applied_with_advance() {
        let store = MemoryStore::new();
        let user = store.get_or_create_user("ext", None).await.unwrap();
        let project = store
            .insert_project(new_project(user.id, ProjectStatus::PendingDataset))
            .await
            .unwrap();

        store
            .advance_status(
                project.id,
                ProjectStatus::PendingDataset,
                ProjectStatus::PendingTraining,
                Some(serde_json::json!({"num_classes": 5})),
            )
            .await
            .unwrap();

        let project = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::PendingTraining);
        assert_eq!(project.metadata_f64("num_classes"), Some(5.0));
    }

    #[tokio::test]
    async fn test_mark_failed_records_error() {
        let store = MemoryStore::new();
        let user = store.get_or_create_user("ext", None).await.unwrap();
        let project = store
            .insert_project(new_project(user.id, ProjectStatus::PendingDataset))
            .await
            .unwrap();

        store
            .mark_failed(
                project.id,
                serde_json::json!({"kind": "no_candidate", "detail": "empty", "step": "search"}),
            )
            .await
            .unwrap();

        let project = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Failed);
        assert_eq!(
            project.metadata["error"]["kind"],
            serde_json::json!("no_candidate")
        );

        let result = store.mark_failed(project.id, serde_json::json!({})).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }
}
