//! `PostgreSQL` store implementation.
//!
//! Uses the runtime query API (`query_as` + `FromRow`) rather than the
//! compile-time checked macros so the workspace builds without a live
//! database.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    AgentLog, AgentName, DatasetRecord, LogLevel, Message, MessageRole, ModelRecord, NewDataset,
    NewModel, NewProject, Project, ProjectStatus, StatusCount, User,
};
use crate::store::{check_transition, AdvanceOutcome, Store};

const PROJECT_COLUMNS: &str = "id, user_id, name, task_type, framework, dataset_source, \
     search_keywords, status, metadata, created_at, updated_at";

/// Creates a connection pool for the given database URL.
///
/// # Errors
///
/// Returns an error if the connection to the database fails.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
}

/// Runs the embedded migrations.
///
/// # Errors
///
/// Returns an error if a migration fails to apply.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Store backed by `PostgreSQL`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects, runs migrations, and returns a ready store.
    ///
    /// # Errors
    ///
    /// Returns an error if connecting or migrating fails.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = create_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_or_create_user(
        &self,
        external_auth_id: &str,
        email: Option<&str>,
    ) -> Result<User, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r"
            INSERT INTO users (id, external_auth_id, email)
            VALUES ($1, $2, $3)
            ON CONFLICT (external_auth_id)
            DO UPDATE SET email = COALESCE(users.email, EXCLUDED.email)
            RETURNING id, external_auth_id, email, is_admin, created_at
            ",
        )
        .bind(Uuid::new_v4())
        .bind(external_auth_id)
        .bind(email)
        .fetch_one(&self.pool)
        .await?;

        Ok(user)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, external_auth_id, email, is_admin, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn get_user_by_external_id(&self, external: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, external_auth_id, email, is_admin, created_at FROM users \
             WHERE external_auth_id = $1",
        )
        .bind(external)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn insert_project(&self, input: NewProject) -> Result<Project, StoreError> {
        let project = sqlx::query_as::<_, Project>(&format!(
            r"
            INSERT INTO projects
                (id, user_id, name, task_type, framework, dataset_source,
                 search_keywords, status, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {PROJECT_COLUMNS}
            ",
        ))
        .bind(Uuid::new_v4())
        .bind(input.user_id)
        .bind(input.name)
        .bind(input.task_type)
        .bind(input.framework)
        .bind(input.dataset_source)
        .bind(input.search_keywords)
        .bind(input.status)
        .bind(input.metadata)
        .fetch_one(&self.pool)
        .await?;

        Ok(project)
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, StoreError> {
        let project = sqlx::query_as::<_, Project>(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1",
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(project)
    }

    async fn list_projects_by_user(&self, user_id: Uuid) -> Result<Vec<Project>, StoreError> {
        let projects = sqlx::query_as::<_, Project>(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE user_id = $1 ORDER BY created_at DESC",
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(projects)
    }

    async fn get_projects_by_status(
        &self,
        status: ProjectStatus,
        limit: i64,
    ) -> Result<Vec<Project>, StoreError> {
        let projects = sqlx::query_as::<_, Project>(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE status = $1 \
             ORDER BY updated_at ASC LIMIT $2",
        ))
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

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

        let patch = metadata_patch.unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        // updated_at must strictly increase even under clock ties.
        let result = sqlx::query(
            r"
            UPDATE projects
            SET status = $1,
                metadata = metadata || $2,
                updated_at = GREATEST(NOW(), updated_at + INTERVAL '1 microsecond')
            WHERE id = $3 AND status = $4
            ",
        )
        .bind(to)
        .bind(patch)
        .bind(project_id)
        .bind(from)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(AdvanceOutcome::Claimed);
        }

        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM projects WHERE id = $1")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await?;

        if exists > 0 {
            Ok(AdvanceOutcome::NotClaimed)
        } else {
            Ok(AdvanceOutcome::NoSuchProject)
        }
    }

    async fn mark_failed(&self, project_id: Uuid, error: Value) -> Result<(), StoreError> {
        let patch = serde_json::json!({ "error": error });

        let result = sqlx::query(
            r"
            UPDATE projects
            SET status = 'failed',
                metadata = metadata || $1,
                updated_at = GREATEST(NOW(), updated_at + INTERVAL '1 microsecond')
            WHERE id = $2 AND status NOT IN ('completed', 'failed')
            ",
        )
        .bind(patch)
        .bind(project_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM projects WHERE id = $1")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await?;

        if exists > 0 {
            Err(StoreError::Conflict(format!(
                "project {project_id} is already terminal"
            )))
        } else {
            Err(StoreError::NotFound(format!("project {project_id}")))
        }
    }

    async fn update_project_metadata(
        &self,
        project_id: Uuid,
        patch: Value,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE projects
            SET metadata = metadata || $1,
                updated_at = GREATEST(NOW(), updated_at + INTERVAL '1 microsecond')
            WHERE id = $2
            ",
        )
        .bind(patch)
        .bind(project_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("project {project_id}")))
        }
    }

    async fn insert_dataset(&self, input: NewDataset) -> Result<DatasetRecord, StoreError> {
        let dataset = sqlx::query_as::<_, DatasetRecord>(
            r"
            INSERT INTO datasets (id, project_id, name, object_uri, size, source)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, project_id, name, object_uri, size, source, created_at
            ",
        )
        .bind(Uuid::new_v4())
        .bind(input.project_id)
        .bind(input.name)
        .bind(input.object_uri)
        .bind(input.size)
        .bind(input.source)
        .fetch_one(&self.pool)
        .await?;

        Ok(dataset)
    }

    async fn get_dataset_by_project(
        &self,
        project_id: Uuid,
    ) -> Result<Option<DatasetRecord>, StoreError> {
        let dataset = sqlx::query_as::<_, DatasetRecord>(
            "SELECT id, project_id, name, object_uri, size, source, created_at \
             FROM datasets WHERE project_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(dataset)
    }

    async fn insert_model(&self, input: NewModel) -> Result<ModelRecord, StoreError> {
        let model = sqlx::query_as::<_, ModelRecord>(
            r"
            INSERT INTO models (id, project_id, name, framework, object_uri, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, project_id, name, framework, object_uri, accuracy, metadata, created_at
            ",
        )
        .bind(Uuid::new_v4())
        .bind(input.project_id)
        .bind(input.name)
        .bind(input.framework)
        .bind(input.object_uri)
        .bind(input.metadata)
        .fetch_one(&self.pool)
        .await?;

        Ok(model)
    }

    async fn get_model_by_project(
        &self,
        project_id: Uuid,
    ) -> Result<Option<ModelRecord>, StoreError> {
        let model = sqlx::query_as::<_, ModelRecord>(
            "SELECT id, project_id, name, framework, object_uri, accuracy, metadata, created_at \
             FROM models WHERE project_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(model)
    }

    async fn update_model_metrics(
        &self,
        model_id: Uuid,
        accuracy: f64,
        metadata_patch: Value,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE models SET accuracy = $1, metadata = metadata || $2 WHERE id = $3",
        )
        .bind(accuracy)
        .bind(metadata_patch)
        .bind(model_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("model {model_id}")))
        }
    }

    async fn append_log(
        &self,
        project_id: Option<Uuid>,
        agent: AgentName,
        level: LogLevel,
        message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO agent_logs (id, project_id, agent_name, message, log_level) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(agent)
        .bind(message)
        .bind(level)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_logs(
        &self,
        project_id: Uuid,
        agent: Option<AgentName>,
        limit: i64,
    ) -> Result<Vec<AgentLog>, StoreError> {
        let logs = sqlx::query_as::<_, AgentLog>(
            r"
            SELECT id, project_id, agent_name, message, log_level, created_at
            FROM agent_logs
            WHERE project_id = $1 AND ($2::agent_name IS NULL OR agent_name = $2)
            ORDER BY created_at ASC
            LIMIT $3
            ",
        )
        .bind(project_id)
        .bind(agent)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(logs)
    }

    async fn write_message(
        &self,
        user_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<Message, StoreError> {
        let message = sqlx::query_as::<_, Message>(
            r"
            INSERT INTO messages (id, user_id, role, content)
            VALUES ($1, $2, $3, $4)
            RETURNING id, user_id, role, content, created_at
            ",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(role)
        .bind(content)
        .fetch_one(&self.pool)
        .await?;

        Ok(message)
    }

    async fn list_messages(&self, user_id: Uuid, limit: i64) -> Result<Vec<Message>, StoreError> {
        let messages = sqlx::query_as::<_, Message>(
            "SELECT id, user_id, role, content, created_at FROM messages \
             WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }

    async fn count_projects_by_status(&self) -> Result<Vec<StatusCount>, StoreError> {
        let counts = sqlx::query_as::<_, StatusCountRow>(
            "SELECT status, COUNT(*) AS count FROM projects GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(counts
            .into_iter()
            .map(|row| StatusCount {
                status: row.status,
                count: row.count,
            })
            .collect())
    }

    async fn count_users(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    async fn list_recent_projects(&self, limit: i64) -> Result<Vec<Project>, StoreError> {
        let projects = sqlx::query_as::<_, Project>(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY created_at DESC LIMIT $1",
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(projects)
    }

    async fn list_recent_users(&self, limit: i64) -> Result<Vec<User>, StoreError> {
        let users = sqlx::query_as::<_, User>(
            "SELECT id, external_auth_id, email, is_admin, created_at FROM users \
             ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }

    async fn list_recent_logs(&self, limit: i64) -> Result<Vec<AgentLog>, StoreError> {
        let logs = sqlx::query_as::<_, AgentLog>(
            "SELECT id, project_id, agent_name, message, log_level, created_at \
             FROM agent_logs ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(logs)
    }
}

#[derive(sqlx::FromRow)]
struct StatusCountRow {
    status: ProjectStatus,
    count: i64,
}
