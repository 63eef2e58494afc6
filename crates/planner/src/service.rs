//! The planner workflow: utterance → validated plan → project row.

use std::sync::Arc;

use agent_runtime::{retry_transient, ErrorKind, WorkflowError, STORE_RETRY_ATTEMPTS};
use database::{
    AgentName, LogLevel, MessageRole, NewProject, ProjectStatus, Store, StoreError,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::intent::parse_size_limit_gb;
use crate::llm::{build_plan_prompt, strip_code_fences, PlanModel, SCHEMA_REMINDER};
use crate::plan::ProjectPlan;

/// Successful planner output.
#[derive(Debug, Clone)]
pub struct PlannedProject {
    pub project_id: Uuid,
    pub plan: ProjectPlan,
    pub message: String,
}

/// Converts one user utterance into exactly one project row at
/// `pending_dataset`, plus an assistant message and agent logs.
pub struct PlannerService {
    store: Arc<dyn Store>,
    model: Arc<dyn PlanModel>,
}

impl PlannerService {
    pub fn new(store: Arc<dyn Store>, model: Arc<dyn PlanModel>) -> Self {
        Self { store, model }
    }

    /// Handles one utterance end to end.
    ///
    /// # Errors
    ///
    /// Returns `input_empty` for a blank utterance, `plan_invalid` when the
    /// LLM output fails validation twice, `dependency` when the LLM or store
    /// is persistently unavailable.
    pub async fn handle_message(
        &self,
        external_user_id: &str,
        utterance: &str,
    ) -> Result<PlannedProject, WorkflowError> {
        let utterance = utterance.trim();
        if utterance.is_empty() {
            return Err(WorkflowError::new(
                ErrorKind::InputEmpty,
                "input",
                "message_text is empty",
            ));
        }

        self.log(None, LogLevel::Info, &format!(
            "Received message from user {external_user_id}"
        ))
        .await;

        let user = retry_transient("get_or_create_user", STORE_RETRY_ATTEMPTS, || {
            self.store.get_or_create_user(external_user_id, None)
        })
        .await
        .map_err(|e| WorkflowError::from_store("resolve_user", e))?;

        let plan = self.plan_from_utterance(utterance).await?;

        let project = self.insert_project(user.id, &plan).await?;

        self.log(
            Some(project.id),
            LogLevel::Info,
            &format!("Project created successfully: {}", plan.name),
        )
        .await;

        let message = plan.summary();
        if let Err(err) = self
            .store
            .write_message(user.id, MessageRole::Assistant, &message)
            .await
        {
            warn!(project_id = %project.id, error = %err, "Failed to write assistant message");
        }

        info!(project_id = %project.id, name = %plan.name, "Plan accepted");
        Ok(PlannedProject {
            project_id: project.id,
            plan,
            message,
        })
    }

    /// Calls the LLM, validating strictly; one schema-reminder retry.
    async fn plan_from_utterance(&self, utterance: &str) -> Result<ProjectPlan, WorkflowError> {
        let prompt = build_plan_prompt(utterance);

        let raw = self
            .model
            .generate(&prompt)
            .await
            .map_err(|e| WorkflowError::new(ErrorKind::Dependency, "llm", e.to_string()))?;

        match parse_and_validate(&raw, utterance) {
            Ok(mut plan) => {
                apply_size_override(&mut plan, utterance);
                return Ok(plan);
            }
            Err(reason) => {
                warn!(%reason, "Plan output invalid, retrying with schema reminder");
            }
        }

        let retry_prompt = format!("{SCHEMA_REMINDER}{prompt}");
        let raw = self
            .model
            .generate(&retry_prompt)
            .await
            .map_err(|e| WorkflowError::new(ErrorKind::Dependency, "llm_retry", e.to_string()))?;

        match parse_and_validate(&raw, utterance) {
            Ok(mut plan) => {
                apply_size_override(&mut plan, utterance);
                Ok(plan)
            }
            Err(reason) => {
                self.log(
                    None,
                    LogLevel::Warning,
                    &format!("Invalid LLM output after retry ({reason}): {raw}"),
                )
                .await;
                Err(WorkflowError::new(ErrorKind::PlanInvalid, "validate", reason))
            }
        }
    }

    /// Inserts the project; a rare id conflict gets one fresh-id retry.
    async fn insert_project(
        &self,
        user_id: Uuid,
        plan: &ProjectPlan,
    ) -> Result<database::Project, WorkflowError> {
        let new_project = || NewProject {
            user_id,
            name: plan.name.clone(),
            task_type: plan.task_type,
            framework: plan.framework,
            dataset_source: plan.dataset_source,
            search_keywords: plan.search_keywords.clone(),
            status: ProjectStatus::PendingDataset,
            metadata: plan.to_metadata(),
        };

        match self.store.insert_project(new_project()).await {
            Ok(project) => Ok(project),
            Err(StoreError::Conflict(detail)) => {
                self.log(
                    None,
                    LogLevel::Warning,
                    &format!("Project insert conflict, retrying with fresh id: {detail}"),
                )
                .await;
                self.store
                    .insert_project(new_project())
                    .await
                    .map_err(|e| WorkflowError::from_store("insert_project", e))
            }
            Err(err) => Err(WorkflowError::from_store("insert_project", err)),
        }
    }

    /// Best-effort agent log; failures only reach the process log.
    async fn log(&self, project_id: Option<Uuid>, level: LogLevel, message: &str) {
        if let Err(err) = self
            .store
            .append_log(project_id, AgentName::Planner, level, message)
            .await
        {
            warn!(error = %err, "Failed to append agent log");
        }
    }
}

fn parse_and_validate(raw: &str, utterance: &str) -> Result<ProjectPlan, String> {
    let cleaned = strip_code_fences(raw);
    let mut plan: ProjectPlan =
        serde_json::from_str(cleaned).map_err(|e| format!("invalid JSON: {e}"))?;
    plan.validate(utterance)?;
    Ok(plan)
}

/// The utterance's own size phrase wins over whatever the LLM produced.
fn apply_size_override(plan: &mut ProjectPlan, utterance: &str) {
    if let Some(cap) = parse_size_limit_gb(utterance) {
        plan.max_dataset_size_gb = cap;
    }
}
