//! Signed URL resolution for stored photo keys.

use crate::error::{within, StoreError};
use crate::keys::ObjectKey;
use crate::object_store::{ObjectStore, SignedUrl};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

/// One photo of a hydrated item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum PhotoSlot {
    Resolved { key: ObjectKey, url: SignedUrl },
    /// The key no longer resolves; shown as a degraded slot instead of
    /// dropping the whole item
    Missing { key: ObjectKey, reason: String },
}

impl PhotoSlot {
    pub fn key(&self) -> &ObjectKey {
        match self {
            PhotoSlot::Resolved { key, .. } | PhotoSlot::Missing { key, .. } => key,
        }
    }

    pub fn url(&self) -> Option<&SignedUrl> {
        match self {
            PhotoSlot::Resolved { url, .. } => Some(url),
            PhotoSlot::Missing { .. } => None,
        }
    }
}

/// Turns durable keys into fresh signed URLs. Holds no cache: every call
/// asks the store again.
pub struct UrlResolver {
    store: Arc<dyn ObjectStore>,
    ttl: Duration,
    timeout: Duration,
}

impl UrlResolver {
    pub fn new(store: Arc<dyn ObjectStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh signed URL for `key`; `NotFound` once the object is gone
    #[instrument(skip(self), fields(key = %key))]
    pub async fn resolve(&self, key: &ObjectKey) -> Result<SignedUrl, StoreError> {
        within(self.timeout, self.store.signed_url(key, self.ttl), StoreError::Timeout).await
    }

    /// Resolve every key concurrently; failures become `Missing` slots, in place
    pub async fn resolve_all(&self, keys: &[ObjectKey]) -> Vec<PhotoSlot> {
        join_all(keys.iter().map(|key| async move {
            match self.resolve(key).await {
                Ok(url) => PhotoSlot::Resolved {
                    key: key.clone(),
                    url,
                },
                Err(e) => {
                    warn!(key = %key, error = %e, "Photo could not be resolved");
                    metrics::counter!("closet.photos.unresolved").increment(1);
                    PhotoSlot::Missing {
                        key: key.clone(),
                        reason: e.to_string(),
                    }
                }
            }
        }))
        .await
    }
}
