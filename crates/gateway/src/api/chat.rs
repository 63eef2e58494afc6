//! Chat submission: forwarded to the planner, relayed verbatim.

use actix_web::{post, web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub message: String,
}

#[post("/api/ml/chat")]
async fn chat(state: web::Data<AppState>, payload: web::Json<ChatRequest>) -> HttpResponse {
    let url = format!("{}/agents/planner/handle_message", state.planner_url);

    let response = state
        .http
        .post(&url)
        .json(&json!({
            "user_id": payload.user_id,
            "session_id": payload.user_id,
            "message_text": payload.message,
        }))
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(err) => {
            error!(error = %err, "Planner agent unreachable");
            return HttpResponse::ServiceUnavailable().json(json!({
                "detail": "planner agent unavailable",
            }));
        }
    };

    // Relay the planner's response verbatim, status included.
    let status = actix_web::http::StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = response.json().await.unwrap_or_else(|_| json!({}));
    HttpResponse::build(status).json(body)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(chat);
}
