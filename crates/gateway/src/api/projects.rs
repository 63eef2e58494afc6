//! Project queries, log listing, bundle download, and the test endpoint.

use actix_multipart::Multipart;
use actix_web::{get, post, web, HttpResponse};
use agent_runtime::slugify;
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::json;
use storage::ObjectUri;
use tracing::error;
use uuid::Uuid;

use crate::state::{load_owned_project, resolve_caller, AppState};

#[derive(Debug, Deserialize)]
pub struct CallerQuery {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub user_id: String,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

#[get("/api/ml/projects")]
async fn list_projects(state: web::Data<AppState>, query: web::Query<CallerQuery>) -> HttpResponse {
    let user = match resolve_caller(&state, &query.user_id).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    match state.store.list_projects_by_user(user.id).await {
        Ok(projects) => HttpResponse::Ok().json(json!({ "projects": projects })),
        Err(err) => HttpResponse::InternalServerError().json(json!({ "detail": err.to_string() })),
    }
}

#[get("/api/ml/projects/{id}")]
async fn get_project(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    query: web::Query<CallerQuery>,
) -> HttpResponse {
    let user = match resolve_caller(&state, &query.user_id).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    let project = match load_owned_project(&state, &user, path.into_inner()).await {
        Ok(project) => project,
        Err(response) => return response,
    };

    let datasets = state
        .store
        .get_dataset_by_project(project.id)
        .await
        .ok()
        .flatten();
    let models = state
        .store
        .get_model_by_project(project.id)
        .await
        .ok()
        .flatten();

    HttpResponse::Ok().json(json!({
        "project": project,
        "dataset": datasets,
        "model": models,
    }))
}

#[get("/api/ml/projects/{id}/logs")]
async fn get_logs(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    query: web::Query<LogsQuery>,
) -> HttpResponse {
    let user = match resolve_caller(&state, &query.user_id).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    let project = match load_owned_project(&state, &user, path.into_inner()).await {
        Ok(project) => project,
        Err(response) => return response,
    };

    match state.store.list_logs(project.id, None, query.limit).await {
        Ok(logs) => HttpResponse::Ok().json(json!({ "logs": logs })),
        Err(err) => HttpResponse::InternalServerError().json(json!({ "detail": err.to_string() })),
    }
}

#[get("/api/ml/projects/{id}/download")]
async fn download_bundle(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    query: web::Query<CallerQuery>,
) -> HttpResponse {
    let user = match resolve_caller(&state, &query.user_id).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    let project = match load_owned_project(&state, &user, path.into_inner()).await {
        Ok(project) => project,
        Err(response) => return response,
    };

    let Some(raw_uri) = project.metadata_str("bundle_uri") else {
        return HttpResponse::BadRequest().json(json!({
            "detail": "bundle is not ready for download",
        }));
    };
    let uri: ObjectUri = match raw_uri.parse() {
        Ok(uri) => uri,
        Err(err) => {
            error!(project_id = %project.id, error = %err, "Stored bundle URI is invalid");
            return HttpResponse::InternalServerError()
                .json(json!({ "detail": "stored bundle location is invalid" }));
        }
    };

    // Stream straight through; the bundle is never materialized here.
    match state.storage.open_read(&uri).await {
        Ok(stream) => HttpResponse::Ok()
            .content_type("application/zip")
            .insert_header((
                "Content-Disposition",
                format!("attachment; filename={}.zip", slugify(&project.name)),
            ))
            .streaming(stream),
        Err(storage::StorageError::NotFound(_)) => {
            HttpResponse::NotFound().json(json!({ "detail": "bundle object is missing" }))
        }
        Err(err) => HttpResponse::InternalServerError().json(json!({ "detail": err.to_string() })),
    }
}

#[post("/api/ml/projects/{id}/test")]
async fn test_model(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    query: web::Query<CallerQuery>,
    payload: Multipart,
) -> HttpResponse {
    let user = match resolve_caller(&state, &query.user_id).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    if !user.is_admin {
        return HttpResponse::Forbidden().json(json!({ "detail": "admin only" }));
    }
    let project = match load_owned_project(&state, &user, path.into_inner()).await {
        Ok(project) => project,
        Err(response) => return response,
    };

    let image = match read_first_file(payload).await {
        Ok(image) => image,
        Err(detail) => return HttpResponse::BadRequest().json(json!({ "detail": detail })),
    };

    // Inference lives with the evaluation agent; proxy the upload through.
    let url = format!(
        "{}/agents/evaluation/predict?project_id={}",
        state.trainer_url, project.id
    );
    let form = reqwest::multipart::Form::new()
        .part("file", reqwest::multipart::Part::bytes(image).file_name("image"));

    let response = match state.http.post(&url).multipart(form).send().await {
        Ok(response) => response,
        Err(err) => {
            error!(error = %err, "Trainer service unreachable");
            return HttpResponse::ServiceUnavailable()
                .json(json!({ "detail": "evaluation agent unavailable" }));
        }
    };

    let status = actix_web::http::StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = response.json().await.unwrap_or_else(|_| json!({}));
    HttpResponse::build(status).json(body)
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

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_projects)
        .service(get_project)
        .service(get_logs)
        .service(download_bundle)
        .service(test_model);
}
