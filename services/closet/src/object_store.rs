use crate::config::S3Config;
use crate::error::StoreError;
use crate::keys::ObjectKey;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// A time-limited, directly fetchable link to a stored object.
///
/// Never persisted; re-derive it from the key whenever it is needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

impl SignedUrl {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: ObjectKey,
    pub last_modified: Option<DateTime<Utc>>,
    pub size_bytes: i64,
}

/// Key-addressed blob storage with signed-URL retrieval
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Durable write; returns once the object is readable under `key`
    async fn put(&self, key: &ObjectKey, body: Bytes, content_type: &str) -> Result<(), StoreError>;

    /// Fresh signed URL, or `NotFound` when the object no longer exists
    async fn signed_url(&self, key: &ObjectKey, ttl: Duration) -> Result<SignedUrl, StoreError>;

    /// Remove an object; removing an absent key succeeds
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// Every object under `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, StoreError>;
}

/// S3-backed object store
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    /// Simple single-part upload for small files
    async fn simple_upload(&self, key: &ObjectKey, body: Bytes, content_type: &str) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| backend("put object", e))?;

        Ok(())
    }

    /// Multipart upload for large files; the upload is aborted on failure so
    /// no invisible parts are left behind
    async fn multipart_upload(&self, key: &ObjectKey, body: Bytes, content_type: &str) -> Result<(), StoreError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key.as_str())
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| backend("create multipart upload", e))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StoreError::Backend("no upload id in response".to_string()))?
            .to_string();

        match self.upload_parts(key, &upload_id, &body).await {
            Ok(parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key.as_str())
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .map_err(|e| backend("complete multipart upload", e))?;

                Ok(())
            }
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key.as_str())
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key = %key, error = %abort, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, key: &ObjectKey, upload_id: &str, body: &Bytes) -> Result<Vec<CompletedPart>, StoreError> {
        let part_size = self.config.part_size_bytes.max(1);
        let mut completed_parts = Vec::new();

        for (index, start) in (0..body.len()).step_by(part_size).enumerate() {
            let end = (start + part_size).min(body.len());
            let part_number = index as i32 + 1;

            let response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key.as_str())
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(body.slice(start..end)))
                .send()
                .await
                .map_err(|e| backend("upload part", e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body), fields(key = %key, size_bytes = body.len()))]
    async fn put(&self, key: &ObjectKey, body: Bytes, content_type: &str) -> Result<(), StoreError> {
        let size = body.len();

        if size > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, body, content_type).await?;
        } else {
            self.simple_upload(key, body, content_type).await?;
        }

        debug!(key = %key, size_bytes = size, "Object uploaded");
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn signed_url(&self, key: &ObjectKey, ttl: Duration) -> Result<SignedUrl, StoreError> {
        // Presigning never touches the bucket, so check the object is still there
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
        {
            Ok(_) => {}
            Err(e) => {
                if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) {
                    return Err(StoreError::NotFound(key.to_string()));
                }
                return Err(backend("head object", e));
            }
        }

        let presigning_config = PresigningConfig::expires_in(ttl)
            .map_err(|e| StoreError::Backend(format!("invalid presigning config: {e}")))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .presigned(presigning_config)
            .await
            .map_err(|e| backend("presign get object", e))?;

        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::Backend(format!("invalid ttl: {e}")))?;

        Ok(SignedUrl {
            url: presigned.uri().to_string(),
            expires_at,
        })
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        // DeleteObject succeeds for absent keys
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| backend("delete object", e))?;

        debug!(key = %key, "Object deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, StoreError> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| backend("list objects", e))?;

            for obj in response.contents() {
                let Some(key) = obj.key() else { continue };
                let key = match ObjectKey::try_from(key) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(error = %e, "Skipping object with unusable key");
                        continue;
                    }
                };

                let last_modified = obj
                    .last_modified()
                    .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()));

                objects.push(StoredObject {
                    key,
                    last_modified,
                    size_bytes: obj.size().unwrap_or_default(),
                });
            }

            match response.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(prefix = %prefix, count = objects.len(), "Listed objects");
        Ok(objects)
    }
}

fn backend(operation: &str, error: impl std::error::Error) -> StoreError {
    StoreError::Backend(format!("{operation} failed: {}", error_chain(&error)))
}

/// Flatten an SDK error and its sources into one message
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

/// Get content type for an image extension
pub fn content_type_for(extension: &str) -> &'static str {
    match extension.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("jpeg"), "image/jpeg");
        assert_eq!(content_type_for("JPG"), "image/jpeg");
        assert_eq!(content_type_for("png"), "image/png");
        assert_eq!(content_type_for("heic"), "image/heic");
        assert_eq!(content_type_for("unknown"), "application/octet-stream");
    }

    #[test]
    fn test_signed_url_expiry() {
        let now = Utc::now();
        let url = SignedUrl {
            url: "https://bucket.s3.amazonaws.com/k?X-Amz-Signature=abc".to_string(),
            expires_at: now + chrono::Duration::seconds(3600),
        };
        assert!(!url.is_expired_at(now));
        assert!(url.is_expired_at(now + chrono::Duration::seconds(3600)));
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "connection reset");
        let err = backend("put object", io);
        assert_eq!(
            err,
            StoreError::Backend("put object failed: connection reset".to_string())
        );
    }
}
