//! Photo upload pipeline.
//!
//! Keys are named up front in input order, the writes run with bounded
//! concurrency, and the call returns only once every write has settled.
//! Either every key is returned, or the call fails and the photos it did
//! write are removed again (best effort, see `cleanup_on_failure`).

use crate::error::{within, StoreError};
use crate::keys::{file_extension, AssetPurpose, KeyNamer, ObjectKey};
use crate::model::OwnerId;
use crate::object_store::{content_type_for, ObjectStore};
use anyhow::Context;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// A local image selected for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoFile {
    pub filename: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl PhotoFile {
    /// Content type is derived from the filename extension
    pub fn new(filename: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let filename = filename.into();
        let content_type = content_type_for(&file_extension(&filename)).to_string();
        Self {
            filename,
            content_type,
            bytes: bytes.into(),
        }
    }

    /// Read a photo from disk
    pub async fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read photo {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self::new(filename, bytes))
    }
}

/// Why an upload batch failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailure {
    /// Position of the first failed photo in the input
    pub index: usize,
    pub source: StoreError,
    /// Photos written by this batch that are still in the store, plus timed-out
    /// writes that may yet land
    pub orphaned: Vec<ObjectKey>,
}

/// Uploads a bounded set of photos and returns their durable keys
pub struct UploadPipeline {
    store: Arc<dyn ObjectStore>,
    namer: Arc<KeyNamer>,
    concurrency: usize,
    timeout: Duration,
    cleanup_on_failure: bool,
}

impl UploadPipeline {
    pub fn new(store: Arc<dyn ObjectStore>, namer: Arc<KeyNamer>) -> Self {
        Self {
            store,
            namer,
            concurrency: 3,
            timeout: Duration::from_secs(30),
            cleanup_on_failure: true,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cleanup_on_failure(mut self, cleanup: bool) -> Self {
        self.cleanup_on_failure = cleanup;
        self
    }

    pub fn cleans_up_on_failure(&self) -> bool {
        self.cleanup_on_failure
    }

    /// Upload `files` for `entity_id`, returning one key per file in input order.
    ///
    /// The caller bounds the number of files before calling.
    #[instrument(skip(self, files), fields(owner = %owner, count = files.len()))]
    pub async fn upload_photos(
        &self,
        owner: &OwnerId,
        purpose: AssetPurpose,
        entity_id: &str,
        files: &[PhotoFile],
    ) -> Result<Vec<ObjectKey>, UploadFailure> {
        let keys: Vec<ObjectKey> = files
            .iter()
            .map(|file| self.namer.name(purpose, owner, entity_id, &file.filename))
            .collect();

        // `buffered` keeps results in input order; every write settles before we look
        let store = self.store.clone();
        let timeout = self.timeout;
        let results: Vec<Result<(), StoreError>> =
            stream::iter(keys.iter().cloned().zip(files.iter().cloned()))
                .map(move |(key, file)| {
                    let store = store.clone();
                    async move {
                        within(
                            timeout,
                            store.put(&key, file.bytes, &file.content_type),
                            StoreError::Timeout,
                        )
                        .await
                    }
                })
                .buffered(self.concurrency)
                .collect()
                .await;

        let mut written = Vec::with_capacity(keys.len());
        // A timed-out put may still land, so it is reported but never deleted
        let mut unsettled = Vec::new();
        let mut first_failure = None;
        for (index, (key, result)) in keys.iter().zip(results).enumerate() {
            match result {
                Ok(()) => written.push(key.clone()),
                Err(e) => {
                    warn!(key = %key, index, error = %e, "Photo upload failed");
                    if let StoreError::Timeout(_) = e {
                        unsettled.push(key.clone());
                    }
                    if first_failure.is_none() {
                        first_failure = Some((index, e));
                    }
                }
            }
        }

        if let Some((index, source)) = first_failure {
            metrics::counter!("closet.uploads.failed").increment(1);
            let mut orphaned = if self.cleanup_on_failure {
                self.remove_all(&written).await
            } else {
                written
            };
            orphaned.extend(unsettled);
            return Err(UploadFailure {
                index,
                source,
                orphaned,
            });
        }

        info!(count = keys.len(), "Photos uploaded");
        Ok(keys)
    }

    /// Best-effort removal of `keys`; returns the ones still in the store
    pub async fn remove_all(&self, keys: &[ObjectKey]) -> Vec<ObjectKey> {
        let mut remaining = Vec::new();

        for key in keys {
            match within(self.timeout, self.store.delete(key), StoreError::Timeout).await {
                Ok(()) => debug!(key = %key, "Removed uploaded photo"),
                Err(e) => {
                    warn!(key = %key, error = %e, "Photo left orphaned");
                    remaining.push(key.clone());
                }
            }
        }

        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryObjectStore;

    fn owner() -> OwnerId {
        OwnerId::new("owner-a").unwrap()
    }

    fn photos(n: usize) -> Vec<PhotoFile> {
        (0..n)
            .map(|i| PhotoFile::new(format!("photo{i}.jpg"), vec![i as u8; 16]))
            .collect()
    }

    fn pipeline(store: Arc<MemoryObjectStore>) -> UploadPipeline {
        UploadPipeline::new(store, Arc::new(KeyNamer::new())).with_concurrency(2)
    }

    #[test]
    fn test_photo_file_content_type() {
        let file = PhotoFile::new("IMG_1.PNG", vec![1, 2, 3]);
        assert_eq!(file.content_type, "image/png");
        assert_eq!(file.bytes.len(), 3);
    }

    #[tokio::test]
    async fn test_keys_follow_input_order() {
        let store = Arc::new(MemoryObjectStore::new());
        let files = photos(4);

        let keys = pipeline(store.clone())
            .upload_photos(&owner(), AssetPurpose::Closet, "tmp-1", &files)
            .await
            .unwrap();

        assert_eq!(keys.len(), 4);
        for (key, file) in keys.iter().zip(&files) {
            assert!(key.has_prefix("users/owner-a/closet/tmp-1/"));
            assert_eq!(store.get(key).unwrap(), file.bytes);
        }
    }

    #[tokio::test]
    async fn test_failure_removes_written_photos() {
        let store = Arc::new(MemoryObjectStore::new());
        store.fail_put_on_call(2);

        let err = pipeline(store.clone())
            .upload_photos(&owner(), AssetPurpose::Closet, "tmp-2", &photos(3))
            .await
            .unwrap_err();

        assert_eq!(err.index, 1);
        assert!(err.orphaned.is_empty());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_failure_without_cleanup_reports_orphans() {
        let store = Arc::new(MemoryObjectStore::new());
        store.fail_put_on_call(3);

        let err = pipeline(store.clone())
            .with_cleanup_on_failure(false)
            .upload_photos(&owner(), AssetPurpose::Closet, "tmp-3", &photos(3))
            .await
            .unwrap_err();

        assert_eq!(err.index, 2);
        assert_eq!(err.orphaned.len(), 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let store = Arc::new(MemoryObjectStore::new());
        store.set_put_delay(Duration::from_secs(5));

        let err = pipeline(store.clone())
            .with_timeout(Duration::from_millis(20))
            .upload_photos(&owner(), AssetPurpose::Closet, "tmp-4", &photos(2))
            .await
            .unwrap_err();

        assert_eq!(err.source, StoreError::Timeout(Duration::from_millis(20)));
        assert_eq!(err.orphaned.len(), 2);
    }
}
