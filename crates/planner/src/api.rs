//! HTTP surface of the planner agent.

use actix_web::{get, post, web, HttpResponse};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::service::PlannerService;

pub struct AppState {
    pub service: PlannerService,
}

#[derive(Debug, Deserialize)]
pub struct HandleMessageRequest {
    pub user_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub session_id: Option<String>,
    pub message_text: String,
}

#[post("/agents/planner/handle_message")]
async fn handle_message(
    state: web::Data<AppState>,
    payload: web::Json<HandleMessageRequest>,
) -> HttpResponse {
    match state
        .service
        .handle_message(&payload.user_id, &payload.message_text)
        .await
    {
        Ok(planned) => HttpResponse::Ok().json(json!({
            "success": true,
            "project_id": planned.project_id,
            "plan": planned.plan,
            "message": planned.message,
        })),
        Err(err) => {
            let status = actix_web::http::StatusCode::from_u16(err.kind.http_status())
                .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
            HttpResponse::build(status).json(json!({
                "success": false,
                "kind": err.kind.as_str(),
                "detail": err.detail,
            }))
        }
    }
}

#[get("/health")]
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "agent": "planner",
        "timestamp": Utc::now(),
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(handle_message).service(health);
}
