//! Admin aggregation views.

use actix_web::{get, web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::state::{resolve_caller, AppState};

#[derive(Debug, Deserialize)]
pub struct AdminQuery {
    pub user_id: String,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

async fn require_admin(
    state: &AppState,
    external_id: &str,
) -> Result<(), HttpResponse> {
    let user = resolve_caller(state, external_id).await?;
    if user.is_admin {
        Ok(())
    } else {
        Err(HttpResponse::Forbidden().json(json!({ "detail": "admin only" })))
    }
}

#[get("/api/admin/stats")]
async fn stats(state: web::Data<AppState>, query: web::Query<AdminQuery>) -> HttpResponse {
    if let Err(response) = require_admin(&state, &query.user_id).await {
        return response;
    }

    let user_count = state.store.count_users().await.unwrap_or(0);
    let by_status = state
        .store
        .count_projects_by_status()
        .await
        .unwrap_or_default();
    let total_projects: i64 = by_status.iter().map(|entry| entry.count).sum();

    HttpResponse::Ok().json(json!({
        "users": user_count,
        "projects": total_projects,
        "projects_by_status": by_status,
    }))
}

#[get("/api/admin/users")]
async fn users(state: web::Data<AppState>, query: web::Query<AdminQuery>) -> HttpResponse {
    if let Err(response) = require_admin(&state, &query.user_id).await {
        return response;
    }

    match state.store.list_recent_users(query.limit).await {
        Ok(users) => HttpResponse::Ok().json(json!({ "users": users })),
        Err(err) => HttpResponse::InternalServerError().json(json!({ "detail": err.to_string() })),
    }
}

#[get("/api/admin/projects")]
async fn projects(state: web::Data<AppState>, query: web::Query<AdminQuery>) -> HttpResponse {
    if let Err(response) = require_admin(&state, &query.user_id).await {
        return response;
    }

    match state.store.list_recent_projects(query.limit).await {
        Ok(projects) => HttpResponse::Ok().json(json!({ "projects": projects })),
        Err(err) => HttpResponse::InternalServerError().json(json!({ "detail": err.to_string() })),
    }
}

#[get("/api/admin/logs")]
async fn logs(state: web::Data<AppState>, query: web::Query<AdminQuery>) -> HttpResponse {
    if let Err(response) = require_admin(&state, &query.user_id).await {
        return response;
    }

    match state.store.list_recent_logs(query.limit).await {
        Ok(logs) => HttpResponse::Ok().json(json!({ "logs": logs })),
        Err(err) => HttpResponse::InternalServerError().json(json!({ "detail": err.to_string() })),
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(stats).service(users).service(projects).service(logs);
}
