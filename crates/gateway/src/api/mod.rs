mod admin;
mod chat;
mod projects;

use actix_web::{get, web, HttpResponse};
use chrono::Utc;
use serde_json::json;

#[get("/health")]
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "gateway",
        "timestamp": Utc::now(),
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.configure(chat::configure)
        .configure(projects::configure)
        .configure(admin::configure)
        .service(health);
}
