//! Retrying, verifying wrapper around an `object_store` backend.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use object_store::ObjectStore;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::uri::ObjectUri;
use crate::StorageError;

/// Default URI scheme for artifacts.
const DEFAULT_SCHEME: &str = "gs";

/// Exponential backoff policy for object store operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn delay(&self, attempt: usize) -> Duration {
        let exp = u32::try_from(attempt).unwrap_or(u32::MAX);
        let factor = self.factor.saturating_pow(exp);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Typed access to the artifact bucket.
#[derive(Clone)]
pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
    scheme: String,
    bucket: String,
    allowed_buckets: Vec<String>,
    download_retry: RetryPolicy,
    upload_retry: RetryPolicy,
}

impl ObjectStorage {
    /// Wraps a backend for the given bucket; only that bucket is allowed.
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        Self {
            store,
            scheme: DEFAULT_SCHEME.to_string(),
            allowed_buckets: vec![bucket.clone()],
            bucket,
            download_retry: RetryPolicy::default(),
            upload_retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_allowed_buckets(mut self, allowed: Vec<String>) -> Self {
        self.allowed_buckets = allowed;
        if !self.allowed_buckets.contains(&self.bucket) {
            self.allowed_buckets.push(self.bucket.clone());
        }
        self
    }

    #[must_use]
    pub fn with_download_retry(mut self, policy: RetryPolicy) -> Self {
        self.download_retry = policy;
        self
    }

    #[must_use]
    pub fn with_upload_retry(mut self, policy: RetryPolicy) -> Self {
        self.upload_retry = policy;
        self
    }

    /// Builds a canonical URI under the configured bucket.
    ///
    /// # Errors
    ///
    /// Returns `InvalidUri` if `path` contains illegal segments.
    pub fn uri_for(&self, path: &str) -> Result<ObjectUri, StorageError> {
        ObjectUri::new(&self.scheme, &self.bucket, path)
    }

    /// Validates that the URI points into an allowed bucket.
    fn resolve(&self, uri: &ObjectUri) -> Result<object_store::path::Path, StorageError> {
        if !self.allowed_buckets.iter().any(|b| b == uri.bucket()) {
            return Err(StorageError::BucketNotAllowed(uri.bucket().to_string()));
        }
        Ok(uri.object_path())
    }

    /// Probes for the object, returning its size when present.
    ///
    /// # Errors
    ///
    /// Returns an error only on backend failure; a missing object is `Ok(None)`.
    pub async fn head(&self, uri: &ObjectUri) -> Result<Option<u64>, StorageError> {
        let path = self.resolve(uri)?;
        match self.store.head(&path).await {
            Ok(meta) => Ok(Some(meta.size as u64)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(StorageError::Backend(err.to_string())),
        }
    }

    /// Streams the object to `dest_path`, retrying transient failures.
    ///
    /// Writes go through a temp file in the destination directory which is
    /// renamed into place on success and removed on failure.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing object, `Backend` once the retry
    /// budget is exhausted.
    pub async fn download(&self, uri: &ObjectUri, dest_path: &Path) -> Result<u64, StorageError> {
        let path = self.resolve(uri)?;
        let mut last_err: Option<StorageError> = None;

        for attempt in 0..self.download_retry.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.download_retry.delay(attempt - 1)).await;
            }

            match self.try_download(&path, dest_path).await {
                Ok(size) => {
                    info!(uri = %uri, bytes = size, "Downloaded object");
                    return Ok(size);
                }
                Err(err @ StorageError::NotFound(_)) => return Err(err),
                Err(err) => {
                    warn!(
                        uri = %uri,
                        attempt = attempt + 1,
                        error = %err,
                        "Download attempt failed"
                    );
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| StorageError::Backend("download failed".to_string())))
    }

    async fn try_download(
        &self,
        path: &object_store::path::Path,
        dest_path: &Path,
    ) -> Result<u64, StorageError> {
        let result = self.store.get(path).await.map_err(classify)?;

        let tmp_path = dest_path.with_extension("part");
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let mut stream = result.into_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    written += bytes.len() as u64;
                    if let Err(err) = file.write_all(&bytes).await {
                        drop(file);
                        let _ = tokio::fs::remove_file(&tmp_path).await;
                        return Err(err.into());
                    }
                }
                Err(err) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    return Err(classify(err));
                }
            }
        }

        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, dest_path).await?;
        Ok(written)
    }

    /// Uploads a local file, then verifies existence and size with a `head`
    /// before returning.
    ///
    /// # Errors
    ///
    /// Returns `VerifyFailed` if the verifying `head` disagrees with the
    /// source size, `Backend` once the retry budget is exhausted.
    pub async fn upload(&self, src_path: &Path, uri: &ObjectUri) -> Result<u64, StorageError> {
        let path = self.resolve(uri)?;
        let data = Bytes::from(tokio::fs::read(src_path).await?);
        let expected = data.len() as u64;
        let mut last_err: Option<StorageError> = None;

        for attempt in 0..self.upload_retry.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.upload_retry.delay(attempt - 1)).await;
            }

            if let Err(err) = self.store.put(&path, data.clone().into()).await {
                let err = classify(err);
                warn!(uri = %uri, attempt = attempt + 1, error = %err, "Upload attempt failed");
                last_err = Some(err);
                continue;
            }

            // Uploads are only trusted once a head confirms them; DB rows
            // referencing this URI must always resolve.
            match self.head(uri).await? {
                Some(size) if size == expected => {
                    info!(uri = %uri, bytes = size, "Uploaded and verified object");
                    return Ok(size);
                }
                Some(size) => {
                    return Err(StorageError::VerifyFailed {
                        uri: uri.to_string(),
                        detail: format!("size mismatch: wrote {expected}, head reports {size}"),
                    });
                }
                None => {
                    return Err(StorageError::VerifyFailed {
                        uri: uri.to_string(),
                        detail: "object missing after upload".to_string(),
                    });
                }
            }
        }

        Err(last_err.unwrap_or_else(|| StorageError::Backend("upload failed".to_string())))
    }

    /// Returns a byte stream for gateway pass-through.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing object.
    pub async fn open_read(
        &self,
        uri: &ObjectUri,
    ) -> Result<BoxStream<'static, object_store::Result<Bytes>>, StorageError> {
        let path = self.resolve(uri)?;
        let result = self.store.get(&path).await.map_err(classify)?;
        Ok(result.into_stream())
    }

    /// Reads a whole object into memory. Intended for small artifacts.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing object.
    pub async fn get_bytes(&self, uri: &ObjectUri) -> Result<Bytes, StorageError> {
        let path = self.resolve(uri)?;
        let result = self.store.get(&path).await.map_err(classify)?;
        result.bytes().await.map_err(classify)
    }
}

fn classify(err: object_store::Error) -> StorageError {
    match err {
        object_store::Error::NotFound { path, .. } => StorageError::NotFound(path),
        other => StorageError::Backend(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;

    use super::*;

    fn memory_storage() -> ObjectStorage {
        ObjectStorage::new(Arc::new(InMemory::new()), "artifacts")
    }

    #[tokio::test]
    async fn test_upload_then_head_and_download() {
        let storage = memory_storage();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("payload.bin");
        tokio::fs::write(&src, b"hello artifacts").await.unwrap();

        let uri = storage.uri_for("raw/payload.bin").unwrap();
        let size = storage.upload(&src, &uri).await.unwrap();
        assert_eq!(size, 15);

        // The URI written to the database must resolve immediately.
        assert_eq!(storage.head(&uri).await.unwrap(), Some(15));

        let dest = dir.path().join("copy.bin");
        let downloaded = storage.download(&uri, &dest).await.unwrap();
        assert_eq!(downloaded, 15);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"hello artifacts");
    }

    #[tokio::test]
    async fn test_download_missing_object_is_not_found() {
        let storage = memory_storage();
        let dir = tempfile::tempdir().unwrap();
        let uri = storage.uri_for("raw/missing.bin").unwrap();

        let err = storage
            .download(&uri, &dir.path().join("out.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        assert!(!dir.path().join("out.bin").exists());
    }

    #[tokio::test]
    async fn test_bucket_allow_list_enforced() {
        let storage = memory_storage();
        let uri: ObjectUri = "gs://somewhere-else/raw/x.bin".parse().unwrap();

        let err = storage.head(&uri).await.unwrap_err();
        assert!(matches!(err, StorageError::BucketNotAllowed(_)));
    }

    #[tokio::test]
    async fn test_open_read_streams_bytes() {
        let storage = memory_storage();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("bundle.zip");
        tokio::fs::write(&src, vec![7u8; 4096]).await.unwrap();

        let uri = storage.uri_for("bundles/bundle.zip").unwrap();
        storage.upload(&src, &uri).await.unwrap();

        let mut stream = storage.open_read(&uri).await.unwrap();
        let mut total = 0;
        while let Some(chunk) = stream.next().await {
            total += chunk.unwrap().len();
        }
        assert_eq!(total, 4096);
    }
}
