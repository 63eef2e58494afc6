//! Training and evaluation workflows end to end on a micro dataset.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use agent_runtime::ErrorKind;
use database::{
    DatasetProvider, Framework, MemoryStore, NewDataset, NewProject, Project, ProjectStatus,
    Store, TaskType,
};
use object_store::memory::InMemory;
use storage::{ObjectStorage, ObjectUri};
use trainer_agent::{
    EvaluationWorkflow, EvaluatorOptions, TrainerOptions, TrainingWorkflow,
};
use vision::layout::test_support::{write_micro_dataset, zip_directory};

const TEST_IMAGE_SIZE: usize = 32;

fn storage() -> Arc<ObjectStorage> {
    Arc::new(ObjectStorage::new(Arc::new(InMemory::new()), "automl-artifacts"))
}

fn trainer(store: Arc<MemoryStore>, storage: Arc<ObjectStorage>) -> TrainingWorkflow {
    TrainingWorkflow::new(
        store,
        storage,
        TrainerOptions {
            batch_size: 8,
            default_epochs: 1,
            image_size: TEST_IMAGE_SIZE,
            step_timeout: Duration::from_secs(300),
            ..TrainerOptions::default()
        },
    )
}

fn evaluator(store: Arc<MemoryStore>, storage: Arc<ObjectStorage>) -> EvaluationWorkflow {
    EvaluationWorkflow::new(
        store,
        storage,
        EvaluatorOptions {
            batch_size: 8,
            image_size: TEST_IMAGE_SIZE,
            step_timeout: Duration::from_secs(300),
            ..EvaluatorOptions::default()
        },
    )
}

async fn seed_project(
    store: &MemoryStore,
    status: ProjectStatus,
    task_type: TaskType,
) -> Project {
    let user = store.get_or_create_user("ext-user", None).await.unwrap();
    store
        .insert_project(NewProject {
            user_id: user.id,
            name: "Petal Sorter".to_string(),
            task_type,
            framework: Framework::Pytorch,
            dataset_source: DatasetProvider::Kaggle,
            search_keywords: vec!["petals".to_string()],
            status,
            metadata: serde_json::json!({
                "preferred_model": "resnet18",
                "epochs": 1,
            }),
        })
        .await
        .unwrap()
}

/// Zips a generated train/val/test dataset and stages it as the project's
/// dataset row.
async fn stage_archive(
    store: &MemoryStore,
    object_storage: &ObjectStorage,
    project: &Project,
    classes: &[&str],
    per_class: usize,
) {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    write_micro_dataset(&data_dir.join("train"), classes, per_class);
    write_micro_dataset(&data_dir.join("val"), classes, 2);
    write_micro_dataset(&data_dir.join("test"), classes, 2);
    let zip_path = dir.path().join("archive.zip");
    zip_directory(&data_dir, &zip_path);
    stage_zip(store, object_storage, project, &zip_path).await;
}

async fn stage_zip(
    store: &MemoryStore,
    object_storage: &ObjectStorage,
    project: &Project,
    zip_path: &std::path::Path,
) {
    let uri = object_storage.uri_for("raw/petal-sorter.zip").unwrap();
    object_storage.upload(zip_path, &uri).await.unwrap();

    store
        .insert_dataset(NewDataset {
            project_id: project.id,
            name: "stub/petals".to_string(),
            object_uri: uri.to_string(),
            size: "0.01 GB".to_string(),
            source: DatasetProvider::Kaggle,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_flat_csv_archive_fails_with_bad_dataset_layout() {
    let store = Arc::new(MemoryStore::new());
    let object_storage = storage();

    let project = seed_project(&store, ProjectStatus::PendingTraining, TaskType::ImageClassification).await;

    // Archive containing a single CSV, no class directories.
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    std::fs::create_dir_all(&data_dir).unwrap();
    std::fs::write(data_dir.join("measurements.csv"), "a,b\n1,2\n").unwrap();
    let zip_path = dir.path().join("archive.zip");
    zip_directory(&data_dir, &zip_path);
    stage_zip(&store, &object_storage, &project, &zip_path).await;

    let flow = trainer(Arc::clone(&store), object_storage);
    let err = flow.process_project(project.clone()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::BadDatasetLayout);

    let updated = store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(updated.status, ProjectStatus::Failed);
    assert_eq!(
        updated.metadata["error"]["kind"],
        serde_json::json!("bad_dataset_layout")
    );
    assert!(store.get_model_by_project(project.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_non_image_task_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let object_storage = storage();
    let project =
        seed_project(&store, ProjectStatus::PendingTraining, TaskType::TextClassification).await;

    let flow = trainer(Arc::clone(&store), object_storage);
    let err = flow.process_project(project.clone()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InputInvalid);

    let updated = store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(updated.status, ProjectStatus::Failed);
}

#[tokio::test]
async fn test_training_then_evaluation_completes_project() {
    let store = Arc::new(MemoryStore::new());
    let object_storage = storage();

    let project = seed_project(&store, ProjectStatus::PendingTraining, TaskType::ImageClassification).await;
    stage_archive(&store, &object_storage, &project, &["daisy", "rose"], 12).await;

    // Training.
    let flow = trainer(Arc::clone(&store), Arc::clone(&object_storage));
    flow.process_project(project.clone()).await.unwrap();

    let after_training = store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(after_training.status, ProjectStatus::PendingEvaluation);
    assert_eq!(after_training.metadata_f64("num_classes"), Some(2.0));

    let model = store
        .get_model_by_project(project.id)
        .await
        .unwrap()
        .expect("model row must exist before the status flip");
    assert_eq!(model.name, "petal-sorter_model");
    let weights_uri: ObjectUri = model.object_uri.parse().unwrap();
    assert!(object_storage.head(&weights_uri).await.unwrap().unwrap() > 0);

    // Per-epoch training logs were appended.
    let logs = store.list_logs(project.id, None, 100).await.unwrap();
    assert!(logs.iter().any(|log| log.message.contains("Epoch 1/1")));

    // Evaluation.
    let flow = evaluator(Arc::clone(&store), Arc::clone(&object_storage));
    flow.process_project(after_training.clone()).await.unwrap();

    let completed = store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(completed.status, ProjectStatus::Completed);

    let model = store.get_model_by_project(project.id).await.unwrap().unwrap();
    let accuracy = model.accuracy.expect("accuracy must be recorded");
    assert!((0.0..=1.0).contains(&accuracy));
    assert!(model.metadata["evaluation"]["macro_f1"].is_number());

    // The bundle resolves and holds exactly the contract files.
    let bundle_uri: ObjectUri = completed
        .metadata_str("bundle_uri")
        .expect("bundle_uri must be set before completion")
        .parse()
        .unwrap();
    let bundle_bytes = object_storage.get_bytes(&bundle_uri).await.unwrap();
    let mut archive = zip::ZipArchive::new(Cursor::new(bundle_bytes.to_vec())).unwrap();
    let mut names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    names.sort();
    assert_eq!(names, ["README.txt", "labels.json", "model.mpk", "predict.py"]);

    let mut labels_entry = archive.by_name("labels.json").unwrap();
    let mut raw = String::new();
    std::io::Read::read_to_string(&mut labels_entry, &mut raw).unwrap();
    let labels: Vec<String> = serde_json::from_str(&raw).unwrap();
    assert_eq!(labels, ["daisy", "rose"]);
    assert_eq!(labels.len() as f64, completed.metadata_f64("num_classes").unwrap());
}

#[tokio::test]
async fn test_evaluation_fails_without_a_test_split() {
    let store = Arc::new(MemoryStore::new());
    let object_storage = storage();

    let project =
        seed_project(&store, ProjectStatus::PendingEvaluation, TaskType::ImageClassification).await;

    // Archive with explicit train/val splits but no test split.
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    write_micro_dataset(&data_dir.join("train"), &["daisy", "rose"], 4);
    write_micro_dataset(&data_dir.join("val"), &["daisy", "rose"], 2);
    let zip_path = dir.path().join("archive.zip");
    zip_directory(&data_dir, &zip_path);
    stage_zip(&store, &object_storage, &project, &zip_path).await;

    // A model row whose weights download; the layout check fires first.
    let weights = dir.path().join("weights.mpk");
    std::fs::write(&weights, b"opaque-record-bytes").unwrap();
    let weights_uri = object_storage
        .uri_for("models/petal-sorter_model.mpk")
        .unwrap();
    object_storage.upload(&weights, &weights_uri).await.unwrap();
    store
        .insert_model(database::NewModel {
            project_id: project.id,
            name: "petal-sorter_model".to_string(),
            framework: Framework::Pytorch,
            object_uri: weights_uri.to_string(),
            metadata: serde_json::json!({
                "architecture": "resnet18",
                "num_classes": 2,
                "classes": ["daisy", "rose"],
            }),
        })
        .await
        .unwrap();

    let flow = evaluator(Arc::clone(&store), object_storage);
    let err = flow.process_project(project.clone()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::BadDatasetLayout);

    let updated = store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(updated.status, ProjectStatus::Failed);
    assert_eq!(
        updated.metadata["error"]["kind"],
        serde_json::json!("bad_dataset_layout")
    );
}

#[tokio::test]
async fn test_evaluation_resumes_from_existing_bundle_uri() {
    let store = Arc::new(MemoryStore::new());
    let object_storage = storage();

    let project =
        seed_project(&store, ProjectStatus::PendingEvaluation, TaskType::ImageClassification).await;
    store
        .update_project_metadata(
            project.id,
            serde_json::json!({ "bundle_uri": "gs://automl-artifacts/bundles/petal-sorter.zip" }),
        )
        .await
        .unwrap();

    let refreshed = store.get_project(project.id).await.unwrap().unwrap();
    let flow = evaluator(Arc::clone(&store), object_storage);
    flow.process_project(refreshed).await.unwrap();

    let completed = store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(completed.status, ProjectStatus::Completed);
}
