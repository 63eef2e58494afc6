//! Artifact store construction shared by the service binaries.

use std::sync::Arc;

use config::{Config, StorageBackend};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use storage::{ObjectStorage, RetryPolicy};

/// Builds the artifact store from configuration.
///
/// # Errors
///
/// Returns an error if the local backend's base directory cannot be created.
pub fn build_storage(config: &Config) -> anyhow::Result<ObjectStorage> {
    let backend: Arc<dyn ObjectStore> = match config.storage_backend {
        StorageBackend::Local => {
            std::fs::create_dir_all(&config.storage_base_path)?;
            Arc::new(LocalFileSystem::new_with_prefix(&config.storage_base_path)?)
        }
        StorageBackend::Memory => Arc::new(InMemory::new()),
    };

    Ok(ObjectStorage::new(backend, config.storage_bucket.clone())
        .with_allowed_buckets(config.allowed_buckets.clone())
        .with_download_retry(RetryPolicy::default().with_max_attempts(config.download_retries))
        .with_upload_retry(RetryPolicy::default().with_max_attempts(config.upload_retries)))
}
