//! HTTP surface of the dataset agent.

use std::sync::Arc;

use actix_web::{get, post, web, HttpResponse};
use agent_runtime::Poller;
use chrono::Utc;
use database::{AgentName, ProjectStatus, Store};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::workflow::DatasetWorkflow;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub workflow: Arc<DatasetWorkflow>,
    pub poller: Poller,
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub project_id: Uuid,
}

#[post("/agents/dataset/start")]
async fn start(state: web::Data<AppState>, payload: web::Json<StartRequest>) -> HttpResponse {
    let project = match state.store.get_project(payload.project_id).await {
        Ok(Some(project)) => project,
        Ok(None) => {
            return HttpResponse::NotFound().json(json!({
                "success": false,
                "kind": "not_found",
                "detail": "project not found",
            }))
        }
        Err(err) => {
            return HttpResponse::InternalServerError().json(json!({
                "success": false,
                "kind": "dependency",
                "detail": err.to_string(),
            }))
        }
    };

    if project.status != ProjectStatus::PendingDataset {
        return HttpResponse::Conflict().json(json!({
            "success": false,
            "kind": "conflict",
            "detail": format!("project status is {}, expected pending_dataset", project.status),
        }));
    }

    match state.workflow.process_project(project).await {
        Ok(()) => HttpResponse::Ok().json(json!({ "success": true })),
        Err(err) => {
            let status_code = actix_web::http::StatusCode::from_u16(err.kind.http_status())
                .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
            HttpResponse::build(status_code).json(json!({
                "success": false,
                "kind": err.kind.as_str(),
                "detail": err.detail,
            }))
        }
    }
}

#[get("/agents/dataset/status/{project_id}")]
async fn status(state: web::Data<AppState>, path: web::Path<Uuid>) -> HttpResponse {
    let project_id = path.into_inner();

    let project = match state.store.get_project(project_id).await {
        Ok(Some(project)) => project,
        Ok(None) => {
            return HttpResponse::NotFound().json(json!({ "detail": "project not found" }))
        }
        Err(err) => {
            return HttpResponse::InternalServerError().json(json!({ "detail": err.to_string() }))
        }
    };

    let logs = state
        .store
        .list_logs(project_id, Some(AgentName::Dataset), 20)
        .await
        .unwrap_or_default();

    HttpResponse::Ok().json(json!({
        "status": project.status,
        "logs": logs,
    }))
}

#[post("/agents/dataset/polling/start")]
async fn polling_start(state: web::Data<AppState>) -> HttpResponse {
    let started = state.poller.start();
    HttpResponse::Ok().json(json!({
        "success": started,
        "message": if started { "Polling started" } else { "Polling already active" },
    }))
}

#[post("/agents/dataset/polling/stop")]
async fn polling_stop(state: web::Data<AppState>) -> HttpResponse {
    let stopped = state.poller.stop();
    HttpResponse::Ok().json(json!({
        "success": stopped,
        "message": if stopped { "Polling stopped" } else { "Polling was not running" },
    }))
}

#[get("/agents/dataset/polling/status")]
async fn polling_status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.poller.status())
}

#[get("/health")]
async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "agent": "dataset",
        "auto_polling": state.poller.status().is_running,
        "timestamp": Utc::now(),
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(start)
        .service(status)
        .service(polling_start)
        .service(polling_stop)
        .service(polling_status)
        .service(health);
}
