//! Shared gateway state and caller resolution.

use std::sync::Arc;

use actix_web::HttpResponse;
use database::{Project, Store, User};
use serde_json::json;
use storage::ObjectStorage;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub storage: Arc<ObjectStorage>,
    pub http: reqwest::Client,
    pub planner_url: String,
    pub trainer_url: String,
}

/// Maps the caller's external auth id to its user row.
///
/// # Errors
///
/// Returns a ready 403 response for unknown callers.
pub async fn resolve_caller(state: &AppState, external_id: &str) -> Result<User, HttpResponse> {
    match state.store.get_user_by_external_id(external_id).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(HttpResponse::Forbidden().json(json!({ "detail": "unknown user" }))),
        Err(err) => {
            Err(HttpResponse::InternalServerError().json(json!({ "detail": err.to_string() })))
        }
    }
}

/// Loads a project and enforces the caller-to-owner mapping (admins bypass).
///
/// # Errors
///
/// Returns a ready 404/403 response on failure.
pub async fn load_owned_project(
    state: &AppState,
    user: &User,
    project_id: uuid::Uuid,
) -> Result<Project, HttpResponse> {
    let project = match state.store.get_project(project_id).await {
        Ok(Some(project)) => project,
        Ok(None) => {
            return Err(HttpResponse::NotFound().json(json!({ "detail": "project not found" })))
        }
        Err(err) => {
            return Err(
                HttpResponse::InternalServerError().json(json!({ "detail": err.to_string() })),
            )
        }
    };

    if project.user_id != user.id && !user.is_admin {
        return Err(HttpResponse::Forbidden().json(json!({ "detail": "not the project owner" })));
    }

    Ok(project)
}
