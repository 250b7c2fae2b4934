//! Closet item record service.
//!
//! Composes the auth gate, upload pipeline, URL resolver and item repository
//! into create/list/get/update/delete. The object store and the data API
//! share no transaction, so each mutation orders its two writes such that a
//! failure never leaves a record pointing at missing photos:
//!
//! - create: photos first, then the record. A failed upload stops before
//!   any record is written.
//! - delete: photos first, then the record. A failed photo removal stops
//!   before the record is touched, so the user can retry.
//!
//! Photos orphaned by a failure in between are removed best effort and are
//! otherwise reclaimed by [`crate::sweep::OrphanSweeper`].

use crate::error::{within, ClosetError, DataError, StoreError};
use crate::identity::AuthGate;
use crate::keys::{owner_prefix, AssetPurpose, ObjectKey};
use crate::model::{
    validate_details, ClosetItem, ItemDetails, ItemForm, ItemId, ItemQuery, NewClosetItem,
    OwnerId, PhotoLimits,
};
use crate::object_store::ObjectStore;
use crate::repository::ItemRepository;
use crate::resolver::{PhotoSlot, UrlResolver};
use crate::upload::UploadPipeline;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Progress of a single create call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatePhase {
    Idle,
    Uploading,
    UploadFailed,
    Uploaded,
    Persisting,
    PersistFailed,
    Persisted,
}

/// A record with its photo keys resolved for display
#[derive(Debug, Clone, Serialize)]
pub struct HydratedItem {
    #[serde(flatten)]
    pub item: ClosetItem,
    pub photos: Vec<PhotoSlot>,
}

impl HydratedItem {
    pub fn missing_photos(&self) -> usize {
        self.photos.iter().filter(|p| p.url().is_none()).count()
    }
}

/// What a successful delete removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub item_id: ItemId,
    pub removed_photos: Vec<ObjectKey>,
    /// Keys outside the owner's closet namespace that were not touched
    pub skipped_photos: Vec<ObjectKey>,
}

/// Handle to a create running on its own task.
///
/// Dropping the handle discards the result; the create still runs to the
/// end, so it never stops between the upload and the record write.
pub struct CreateHandle {
    task: JoinHandle<Result<ClosetItem, ClosetError>>,
}

impl CreateHandle {
    pub async fn join(self) -> Result<ClosetItem, ClosetError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ClosetError::Interrupted(e.to_string())),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Create, list, get, update and delete closet items
#[derive(Clone)]
pub struct ClosetService {
    gate: Arc<AuthGate>,
    pipeline: Arc<UploadPipeline>,
    resolver: Arc<UrlResolver>,
    store: Arc<dyn ObjectStore>,
    repository: Arc<dyn ItemRepository>,
    limits: PhotoLimits,
    timeout: Duration,
}

impl ClosetService {
    pub fn new(
        gate: Arc<AuthGate>,
        pipeline: UploadPipeline,
        resolver: UrlResolver,
        store: Arc<dyn ObjectStore>,
        repository: Arc<dyn ItemRepository>,
    ) -> Self {
        Self {
            gate,
            pipeline: Arc::new(pipeline),
            resolver: Arc::new(resolver),
            store,
            repository,
            limits: PhotoLimits::default(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_limits(mut self, limits: PhotoLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn gate(&self) -> &AuthGate {
        &self.gate
    }

    /// Validate the form, upload its photos, then persist the record.
    ///
    /// Either a record referencing exactly the uploaded keys exists
    /// afterwards, or no record was written.
    #[instrument(skip(self, form), fields(photos = form.photos.len()))]
    pub async fn create(&self, form: ItemForm) -> Result<ClosetItem, ClosetError> {
        let mut phase = CreatePhase::Idle;

        // Local checks happen before any network call
        let form = form.validate(self.limits)?;
        let owner = self.gate.require_owner().await?;

        let entity_id = Uuid::new_v4().to_string();
        advance(&mut phase, CreatePhase::Uploading);

        let photo_keys = match self
            .pipeline
            .upload_photos(&owner, AssetPurpose::Closet, &entity_id, &form.photos)
            .await
        {
            Ok(keys) => keys,
            Err(failure) => {
                advance(&mut phase, CreatePhase::UploadFailed);
                return Err(ClosetError::Upload {
                    index: failure.index,
                    source: failure.source,
                    orphaned: failure.orphaned,
                });
            }
        };
        advance(&mut phase, CreatePhase::Uploaded);

        advance(&mut phase, CreatePhase::Persisting);
        let record = NewClosetItem {
            owner_id: owner.clone(),
            details: form.details,
            photo_keys: photo_keys.clone(),
        };

        let persisted = within(
            self.timeout,
            self.repository.create(record),
            DataError::Timeout,
        )
        .await;

        match persisted {
            // Anything other than our exact keys would be a dangling or foreign reference
            Ok(item) if item.photo_keys == photo_keys && item.owner_id == owner => {
                advance(&mut phase, CreatePhase::Persisted);
                metrics::counter!("closet.items.created").increment(1);
                info!(item_id = %item.id, owner = %owner, photos = item.photo_keys.len(), "Closet item created");
                Ok(item)
            }
            Ok(item) => {
                advance(&mut phase, CreatePhase::PersistFailed);
                metrics::counter!("closet.items.persist_failed").increment(1);
                error!(item_id = %item.id, "Saved record does not reference the uploaded photos");
                self.discard_mismatched(&owner, item.id, photo_keys).await
            }
            Err(source) => {
                advance(&mut phase, CreatePhase::PersistFailed);
                metrics::counter!("closet.items.persist_failed").increment(1);
                // A timed-out write may still land; leave its photos to the sweep
                let orphaned = match source {
                    DataError::Timeout(_) => photo_keys,
                    _ => self.discard_photos(photo_keys).await,
                };
                Err(ClosetError::Persist { source, orphaned })
            }
        }
    }

    /// Roll back a record that was written with the wrong keys or owner. The
    /// record goes first; its photos are only removed once it is gone.
    async fn discard_mismatched(
        &self,
        owner: &OwnerId,
        id: ItemId,
        photo_keys: Vec<ObjectKey>,
    ) -> Result<ClosetItem, ClosetError> {
        let mismatch = format!("record {id} does not reference the uploaded photos");

        match within(self.timeout, self.repository.delete(owner, id), DataError::Timeout).await {
            Ok(true) => Err(ClosetError::Persist {
                source: DataError::Backend(mismatch),
                orphaned: self.discard_photos(photo_keys).await,
            }),
            // Not visible to this owner, so it may still reference the photos
            Ok(false) => {
                warn!(item_id = %id, "Mismatched record not found for removal, keeping its photos");
                Err(ClosetError::Persist {
                    source: DataError::Backend(mismatch),
                    orphaned: photo_keys,
                })
            }
            Err(e) => {
                warn!(item_id = %id, error = %e, "Could not remove mismatched record, keeping its photos");
                Err(ClosetError::Persist {
                    source: DataError::Backend(format!("{mismatch}; removing it failed: {e}")),
                    orphaned: Vec::new(),
                })
            }
        }
    }

    /// Remove photos of a create that saved nothing, if cleanup is enabled
    async fn discard_photos(&self, photo_keys: Vec<ObjectKey>) -> Vec<ObjectKey> {
        if self.pipeline.cleans_up_on_failure() {
            self.pipeline.remove_all(&photo_keys).await
        } else {
            photo_keys
        }
    }

    /// Run [`ClosetService::create`] on its own task
    pub fn spawn_create(&self, form: ItemForm) -> CreateHandle {
        let service = self.clone();
        CreateHandle {
            task: tokio::spawn(async move { service.create(form).await }),
        }
    }

    /// Records of the signed-in owner, each with freshly resolved photos.
    ///
    /// A photo that cannot be resolved becomes a `Missing` slot; the item is
    /// still returned.
    #[instrument(skip(self))]
    pub async fn list(&self, query: &ItemQuery) -> Result<Vec<HydratedItem>, ClosetError> {
        let owner = self.gate.require_owner().await?;

        let items = within(
            self.timeout,
            self.repository.list(&owner, query),
            DataError::Timeout,
        )
        .await?;

        let mut hydrated = Vec::with_capacity(items.len());
        for item in items {
            if item.owner_id != owner {
                // Scoping is the data API's job; never show someone else's item anyway
                error!(item_id = %item.id, "Data API returned a record of another owner");
                continue;
            }
            hydrated.push(self.hydrate(item).await);
        }

        debug!(count = hydrated.len(), "Closet listed");
        Ok(hydrated)
    }

    /// One record of the signed-in owner with resolved photos
    #[instrument(skip(self))]
    pub async fn get(&self, id: ItemId) -> Result<HydratedItem, ClosetError> {
        let (_, item) = self.fetch_owned(id).await?;
        Ok(self.hydrate(item).await)
    }

    /// Change descriptive fields; photos stay as they are. Last writer wins.
    #[instrument(skip(self, details))]
    pub async fn update(&self, id: ItemId, details: ItemDetails) -> Result<ClosetItem, ClosetError> {
        validate_details(&details)?;
        let owner = self.gate.require_owner().await?;

        let updated = within(
            self.timeout,
            self.repository.update(&owner, id, details),
            DataError::Timeout,
        )
        .await?
        .ok_or(ClosetError::NotFound(id))?;

        info!(item_id = %id, "Closet item updated");
        Ok(updated)
    }

    /// Remove every photo of the item, then the record.
    ///
    /// A photo removal failure aborts before the record is touched. Deleting
    /// an item that is already gone reports `NotFound`.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: ItemId) -> Result<DeleteOutcome, ClosetError> {
        let (owner, item) = self.fetch_owned(id).await?;

        let closet_prefix = owner_prefix(AssetPurpose::Closet, &owner);
        let (owned, foreign): (Vec<ObjectKey>, Vec<ObjectKey>) = item
            .photo_keys
            .into_iter()
            .partition(|key| key.has_prefix(&closet_prefix));

        for key in &foreign {
            warn!(item_id = %id, key = %key, "Photo outside the owner's closet left in place");
        }

        for key in &owned {
            // Deleting an absent object succeeds, so photos removed out of band are fine
            within(self.timeout, self.store.delete(key), StoreError::Timeout)
                .await
                .map_err(|source| {
                    warn!(item_id = %id, key = %key, error = %source, "Photo removal failed, keeping record");
                    ClosetError::PhotoRemoval {
                        key: key.clone(),
                        source,
                    }
                })?;
        }

        let removed = within(
            self.timeout,
            self.repository.delete(&owner, id),
            DataError::Timeout,
        )
        .await?;

        if !removed {
            // Gone between our read and our delete; its photos are gone too
            return Err(ClosetError::NotFound(id));
        }

        metrics::counter!("closet.items.deleted").increment(1);
        info!(item_id = %id, photos = owned.len(), "Closet item deleted");

        Ok(DeleteOutcome {
            item_id: id,
            removed_photos: owned,
            skipped_photos: foreign,
        })
    }

    async fn fetch_owned(&self, id: ItemId) -> Result<(OwnerId, ClosetItem), ClosetError> {
        let owner = self.gate.require_owner().await?;

        let item = within(
            self.timeout,
            self.repository.get(&owner, id),
            DataError::Timeout,
        )
        .await?
        .filter(|item| item.owner_id == owner)
        .ok_or(ClosetError::NotFound(id))?;

        Ok((owner, item))
    }

    async fn hydrate(&self, item: ClosetItem) -> HydratedItem {
        let photos = self.resolver.resolve_all(&item.photo_keys).await;
        HydratedItem { item, photos }
    }
}

fn advance(phase: &mut CreatePhase, next: CreatePhase) {
    match next {
        CreatePhase::UploadFailed | CreatePhase::PersistFailed => {
            warn!(from = ?phase, to = ?next, "Create failed")
        }
        _ => debug!(from = ?phase, to = ?next, "Create phase"),
    }
    *phase = next;
}
