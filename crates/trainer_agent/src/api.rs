//! HTTP surface of the trainer service (training + evaluation agents).

use std::sync::Arc;

use actix_multipart::Multipart;
use actix_web::{get, post, web, HttpResponse};
use agent_runtime::{Poller, WorkflowError};
use chrono::Utc;
use database::{AgentName, Project, ProjectStatus, Store};
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::eval_workflow::EvaluationWorkflow;
use crate::predict::PredictService;
use crate::train_workflow::TrainingWorkflow;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub training: Arc<TrainingWorkflow>,
    pub evaluation: Arc<EvaluationWorkflow>,
    pub training_poller: Poller,
    pub evaluation_poller: Poller,
    pub predictor: PredictService,
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub project_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct PredictQuery {
    pub project_id: Uuid,
}

fn error_response(err: &WorkflowError) -> HttpResponse {
    let status = actix_web::http::StatusCode::from_u16(err.kind.http_status())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(json!({
        "success": false,
        "kind": err.kind.as_str(),
        "detail": err.detail,
    }))
}

async fn load_for_start(
    store: &dyn Store,
    project_id: Uuid,
    expected: ProjectStatus,
) -> Result<Project, HttpResponse> {
    let project = match store.get_project(project_id).await {
        Ok(Some(project)) => project,
        Ok(None) => {
            return Err(HttpResponse::NotFound().json(json!({
                "success": false,
                "kind": "not_found",
                "detail": "project not found",
            })))
        }
        Err(err) => {
            return Err(HttpResponse::InternalServerError().json(json!({
                "success": false,
                "kind": "dependency",
                "detail": err.to_string(),
            })))
        }
    };

    if project.status != expected {
        return Err(HttpResponse::Conflict().json(json!({
            "success": false,
            "kind": "conflict",
            "detail": format!("project status is {}, expected {expected}", project.status),
        })));
    }

    Ok(project)
}

async fn status_response(
    store: &dyn Store,
    project_id: Uuid,
    agent: AgentName,
) -> HttpResponse {
    let project = match store.get_project(project_id).await {
        Ok(Some(project)) => project,
        Ok(None) => return HttpResponse::NotFound().json(json!({ "detail": "project not found" })),
        Err(err) => {
            return HttpResponse::InternalServerError().json(json!({ "detail": err.to_string() }))
        }
    };

    let logs = store
        .list_logs(project_id, Some(agent), 20)
        .await
        .unwrap_or_default();

    HttpResponse::Ok().json(json!({ "status": project.status, "logs": logs }))
}

fn polling_toggle(changed: bool, verb: &str) -> HttpResponse {
    let message = if changed {
        format!("Polling {verb}")
    } else {
        format!("Polling already {verb}")
    };
    HttpResponse::Ok().json(json!({ "success": changed, "message": message }))
}

// Training agent surface.

#[post("/agents/training/start")]
async fn training_start(
    state: web::Data<AppState>,
    payload: web::Json<StartRequest>,
) -> HttpResponse {
    let project = match load_for_start(
        state.store.as_ref(),
        payload.project_id,
        ProjectStatus::PendingTraining,
    )
    .await
    {
        Ok(project) => project,
        Err(response) => return response,
    };

    match state.training.process_project(project).await {
        Ok(()) => HttpResponse::Ok().json(json!({ "success": true })),
        Err(err) => error_response(&err),
    }
}

#[get("/agents/training/status/{project_id}")]
async fn training_status(state: web::Data<AppState>, path: web::Path<Uuid>) -> HttpResponse {
    status_response(state.store.as_ref(), path.into_inner(), AgentName::Training).await
}

#[post("/agents/training/polling/start")]
async fn training_polling_start(state: web::Data<AppState>) -> HttpResponse {
    polling_toggle(state.training_poller.start(), "started")
}

#[post("/agents/training/polling/stop")]
async fn training_polling_stop(state: web::Data<AppState>) -> HttpResponse {
    polling_toggle(state.training_poller.stop(), "stopped")
}

#[get("/agents/training/polling/status")]
async fn training_polling_status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.training_poller.status())
}

// Evaluation agent surface.

#[post("/agents/evaluation/start")]
async fn evaluation_start(
    state: web::Data<AppState>,
    payload: web::Json<StartRequest>,
) -> HttpResponse {
    let project = match load_for_start(
        state.store.as_ref(),
        payload.project_id,
        ProjectStatus::PendingEvaluation,
    )
    .await
    {
        Ok(project) => project,
        Err(response) => return response,
    };

    match state.evaluation.process_project(project).await {
        Ok(()) => HttpResponse::Ok().json(json!({ "success": true })),
        Err(err) => error_response(&err),
    }
}

#[get("/agents/evaluation/status/{project_id}")]
async fn evaluation_status(state: web::Data<AppState>, path: web::Path<Uuid>) -> HttpResponse {
    status_response(state.store.as_ref(), path.into_inner(), AgentName::Evaluation).await
}

#[post("/agents/evaluation/polling/start")]
async fn evaluation_polling_start(state: web::Data<AppState>) -> HttpResponse {
    polling_toggle(state.evaluation_poller.start(), "started")
}

#[post("/agents/evaluation/polling/stop")]
async fn evaluation_polling_stop(state: web::Data<AppState>) -> HttpResponse {
    polling_toggle(state.evaluation_poller.stop(), "stopped")
}

#[get("/agents/evaluation/polling/status")]
async fn evaluation_polling_status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.evaluation_poller.status())
}

#[post("/agents/evaluation/predict")]
async fn evaluation_predict(
    state: web::Data<AppState>,
    query: web::Query<PredictQuery>,
    payload: Multipart,
) -> HttpResponse {
    let image = match read_first_file(payload).await {
        Ok(image) => image,
        Err(detail) => {
            return HttpResponse::BadRequest().json(json!({
                "success": false,
                "kind": "input_invalid",
                "detail": detail,
            }))
        }
    };

    match state.predictor.predict(query.project_id, image).await {
        Ok(prediction) => HttpResponse::Ok().json(prediction),
        Err(err) => error_response(&err),
    }
}

/// Reads the first non-empty multipart file field.
async fn read_first_file(mut payload: Multipart) -> Result<Vec<u8>, String> {
    while let Some(field) = payload
        .try_next()
        .await
        .map_err(|e| format!("invalid multipart payload: {e}"))?
    {
        let mut field = field;
        let mut data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| format!("failed to read upload: {e}"))?;
            data.extend_from_slice(&chunk);
        }
        if !data.is_empty() {
            return Ok(data);
        }
    }
    Err("no file uploaded".to_string())
}

#[get("/health")]
async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "agent": "trainer",
        "training_polling": state.training_poller.status().is_running,
        "evaluation_polling": state.evaluation_poller.status().is_running,
        "timestamp": Utc::now(),
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(training_start)
        .service(training_status)
        .service(training_polling_start)
        .service(training_polling_stop)
        .service(training_polling_status)
        .service(evaluation_start)
        .service(evaluation_status)
        .service(evaluation_polling_start)
        .service(evaluation_polling_stop)
        .service(evaluation_polling_status)
        .service(evaluation_predict)
        .service(health);
}
