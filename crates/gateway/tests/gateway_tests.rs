//! Gateway handler behavior: ownership mapping, download streaming, admin.

use std::sync::Arc;

use actix_web::{test, web, App};
use database::{
    DatasetProvider, Framework, MemoryStore, NewProject, Project, ProjectStatus, Store, TaskType,
};
use gateway::{api, AppState};
use object_store::memory::InMemory;
use storage::ObjectStorage;

async fn seed_project(store: &MemoryStore, external_id: &str) -> Project {
    let user = store.get_or_create_user(external_id, None).await.unwrap();
    store
        .insert_project(NewProject {
            user_id: user.id,
            name: "Flower Classifier".to_string(),
            task_type: TaskType::ImageClassification,
            framework: Framework::Pytorch,
            dataset_source: DatasetProvider::Kaggle,
            search_keywords: vec!["flower".to_string()],
            status: ProjectStatus::PendingDataset,
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap()
}

fn app_state(store: Arc<MemoryStore>, storage: Arc<ObjectStorage>) -> web::Data<AppState> {
    web::Data::new(AppState {
        store,
        storage,
        http: reqwest::Client::new(),
        planner_url: "http://127.0.0.1:1".to_string(),
        trainer_url: "http://127.0.0.1:1".to_string(),
    })
}

fn memory_storage() -> Arc<ObjectStorage> {
    Arc::new(ObjectStorage::new(Arc::new(InMemory::new()), "automl-artifacts"))
}

#[actix_web::test]
async fn test_project_listing_is_scoped_to_caller() {
    let store = Arc::new(MemoryStore::new());
    seed_project(&store, "owner").await;
    seed_project(&store, "other").await;

    let app = test::init_service(
        App::new()
            .app_data(app_state(Arc::clone(&store), memory_storage()))
            .configure(api::configure),
    )
    .await;

    let request = test::TestRequest::get()
        .uri("/api/ml/projects?user_id=owner")
        .to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(body["projects"].as_array().unwrap().len(), 1);
}

#[actix_web::test]
async fn test_non_owner_gets_403_and_admin_bypasses() {
    let store = Arc::new(MemoryStore::new());
    let project = seed_project(&store, "owner").await;
    store.get_or_create_user("snoop", None).await.unwrap();
    store.get_or_create_user("root", None).await.unwrap();
    store.set_admin("root", true).await;

    let app = test::init_service(
        App::new()
            .app_data(app_state(Arc::clone(&store), memory_storage()))
            .configure(api::configure),
    )
    .await;

    let request = test::TestRequest::get()
        .uri(&format!("/api/ml/projects/{}?user_id=snoop", project.id))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 403);

    let request = test::TestRequest::get()
        .uri(&format!("/api/ml/projects/{}?user_id=root", project.id))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 200);
}

#[actix_web::test]
async fn test_unknown_project_is_404() {
    let store = Arc::new(MemoryStore::new());
    store.get_or_create_user("caller", None).await.unwrap();

    let app = test::init_service(
        App::new()
            .app_data(app_state(Arc::clone(&store), memory_storage()))
            .configure(api::configure),
    )
    .await;

    let request = test::TestRequest::get()
        .uri(&format!(
            "/api/ml/projects/{}?user_id=caller",
            uuid::Uuid::new_v4()
        ))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 404);
}

#[actix_web::test]
async fn test_download_requires_a_ready_bundle() {
    let store = Arc::new(MemoryStore::new());
    let project = seed_project(&store, "owner").await;

    let app = test::init_service(
        App::new()
            .app_data(app_state(Arc::clone(&store), memory_storage()))
            .configure(api::configure),
    )
    .await;

    let request = test::TestRequest::get()
        .uri(&format!("/api/ml/projects/{}/download?user_id=owner", project.id))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 400);
}

#[actix_web::test]
async fn test_download_streams_the_bundle_zip() {
    let store = Arc::new(MemoryStore::new());
    let storage = memory_storage();
    let project = seed_project(&store, "owner").await;

    // Stage a bundle object and point the project at it.
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("bundle.zip");
    std::fs::write(&local, b"PK-zip-bytes").unwrap();
    let uri = storage.uri_for("bundles/flower-classifier.zip").unwrap();
    storage.upload(&local, &uri).await.unwrap();
    store
        .update_project_metadata(project.id, serde_json::json!({ "bundle_uri": uri.to_string() }))
        .await
        .unwrap();

    let app = test::init_service(
        App::new()
            .app_data(app_state(Arc::clone(&store), Arc::clone(&storage)))
            .configure(api::configure),
    )
    .await;

    let request = test::TestRequest::get()
        .uri(&format!("/api/ml/projects/{}/download?user_id=owner", project.id))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("Content-Type").unwrap(),
        "application/zip"
    );
    assert!(response
        .headers()
        .get("Content-Disposition")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("flower-classifier.zip"));

    let body = test::read_body(response).await;
    assert_eq!(&body[..], b"PK-zip-bytes");
}

#[actix_web::test]
async fn test_admin_endpoints_require_admin() {
    let store = Arc::new(MemoryStore::new());
    seed_project(&store, "owner").await;
    store.get_or_create_user("root", None).await.unwrap();
    store.set_admin("root", true).await;

    let app = test::init_service(
        App::new()
            .app_data(app_state(Arc::clone(&store), memory_storage()))
            .configure(api::configure),
    )
    .await;

    let request = test::TestRequest::get()
        .uri("/api/admin/stats?user_id=owner")
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 403);

    let request = test::TestRequest::get()
        .uri("/api/admin/stats?user_id=root")
        .to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(body["users"], serde_json::json!(2));
    assert_eq!(body["projects"], serde_json::json!(1));
}
