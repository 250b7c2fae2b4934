//! In-memory collaborators with failure injection, for tests.

use crate::error::{AuthError, DataError, StoreError};
use crate::identity::{CurrentUser, IdentityService};
use crate::keys::ObjectKey;
use crate::model::{ClosetItem, ItemDetails, ItemId, ItemQuery, NewClosetItem, OwnerId};
use crate::object_store::{ObjectStore, SignedUrl, StoredObject};
use crate::repository::ItemRepository;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<ObjectKey, (Bytes, DateTime<Utc>)>,
    put_calls: usize,
    fail_put_on_call: Option<usize>,
    failing_deletes: HashSet<ObjectKey>,
    put_delay: Option<Duration>,
}

#[derive(Default)]
pub struct MemoryObjectStore {
    state: Mutex<StoreState>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `n`th put (1-based) fails
    pub fn fail_put_on_call(&self, n: usize) {
        self.state.lock().unwrap().fail_put_on_call = Some(n);
    }

    pub fn fail_delete_of(&self, key: &ObjectKey) {
        self.state.lock().unwrap().failing_deletes.insert(key.clone());
    }

    pub fn set_put_delay(&self, delay: Duration) {
        self.state.lock().unwrap().put_delay = Some(delay);
    }

    /// Place an object directly, with a chosen modification time
    pub fn insert(&self, key: &ObjectKey, modified: DateTime<Utc>) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(key.clone(), (Bytes::from_static(b"img"), modified));
    }

    /// Remove an object behind the service's back
    pub fn remove(&self, key: &ObjectKey) {
        self.state.lock().unwrap().objects.remove(key);
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Bytes> {
        self.state.lock().unwrap().objects.get(key).map(|(b, _)| b.clone())
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.state.lock().unwrap().objects.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    pub fn put_calls(&self) -> usize {
        self.state.lock().unwrap().put_calls
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &ObjectKey, body: Bytes, _content_type: &str) -> Result<(), StoreError> {
        let (fail, delay) = {
            let mut state = self.state.lock().unwrap();
            state.put_calls += 1;
            (state.fail_put_on_call == Some(state.put_calls), state.put_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(StoreError::Backend("connection reset".to_string()));
        }

        self.state
            .lock()
            .unwrap()
            .objects
            .insert(key.clone(), (body, Utc::now()));
        Ok(())
    }

    async fn signed_url(&self, key: &ObjectKey, ttl: Duration) -> Result<SignedUrl, StoreError> {
        if !self.contains(key) {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(SignedUrl {
            url: format!("https://storage.test/{key}?ttl={}", ttl.as_secs()),
            expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap(),
        })
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_deletes.contains(key) {
            return Err(StoreError::Backend("access denied".to_string()));
        }
        state.objects.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| key.has_prefix(prefix))
            .map(|(key, (body, modified))| StoredObject {
                key: key.clone(),
                last_modified: Some(*modified),
                size_bytes: body.len() as i64,
            })
            .collect())
    }
}

#[derive(Default)]
struct RepoState {
    items: Vec<ClosetItem>,
    fail_create: bool,
    fail_list: bool,
    fail_delete: bool,
    create_delay: Option<Duration>,
    reorder_created_keys: bool,
}

#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<RepoState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self) {
        self.state.lock().unwrap().fail_create = true;
    }

    pub fn fail_list(&self) {
        self.state.lock().unwrap().fail_list = true;
    }

    pub fn fail_delete(&self) {
        self.state.lock().unwrap().fail_delete = true;
    }

    /// `create` stores the record only after `delay`
    pub fn set_create_delay(&self, delay: Duration) {
        self.state.lock().unwrap().create_delay = Some(delay);
    }

    /// `create` stores the record as given but answers with its keys reversed
    pub fn reorder_created_keys(&self) {
        self.state.lock().unwrap().reorder_created_keys = true;
    }

    /// Every record regardless of owner
    pub fn all(&self) -> Vec<ClosetItem> {
        self.state.lock().unwrap().items.clone()
    }
}

#[async_trait]
impl ItemRepository for MemoryRepository {
    async fn create(&self, item: NewClosetItem) -> Result<ClosetItem, DataError> {
        let delay = self.state.lock().unwrap().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(DataError::Backend("service unavailable".to_string()));
        }
        let now = Utc::now();
        let record = ClosetItem {
            id: ItemId(Uuid::new_v4()),
            owner_id: item.owner_id,
            details: item.details,
            photo_keys: item.photo_keys,
            created_at: now,
            updated_at: now,
        };
        state.items.push(record.clone());

        let mut answer = record;
        if state.reorder_created_keys {
            answer.photo_keys.reverse();
        }
        Ok(answer)
    }

    async fn list(&self, owner: &OwnerId, query: &ItemQuery) -> Result<Vec<ClosetItem>, DataError> {
        let state = self.state.lock().unwrap();
        if state.fail_list {
            return Err(DataError::Backend("service unavailable".to_string()));
        }
        let offset = query.offset.unwrap_or(0).max(0) as usize;
        let limit = query.limit.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);
        Ok(state
            .items
            .iter()
            .filter(|i| &i.owner_id == owner)
            .filter(|i| query.category.map_or(true, |c| i.details.category == c))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get(&self, owner: &OwnerId, id: ItemId) -> Result<Option<ClosetItem>, DataError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .items
            .iter()
            .find(|i| i.id == id && &i.owner_id == owner)
            .cloned())
    }

    async fn update(
        &self,
        owner: &OwnerId,
        id: ItemId,
        details: ItemDetails,
    ) -> Result<Option<ClosetItem>, DataError> {
        let mut state = self.state.lock().unwrap();
        Ok(state
            .items
            .iter_mut()
            .find(|i| i.id == id && &i.owner_id == owner)
            .map(|i| {
                i.details = details;
                i.updated_at = Utc::now();
                i.clone()
            }))
    }

    async fn delete(&self, owner: &OwnerId, id: ItemId) -> Result<bool, DataError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_delete {
            return Err(DataError::Backend("service unavailable".to_string()));
        }
        let before = state.items.len();
        state.items.retain(|i| !(i.id == id && &i.owner_id == owner));
        Ok(state.items.len() < before)
    }
}

/// Identity provider that always reports the same user
pub struct StaticIdentity(pub Option<OwnerId>);

impl StaticIdentity {
    pub fn signed_in(owner: &str) -> Self {
        Self(OwnerId::new(owner))
    }

    pub fn signed_out() -> Self {
        Self(None)
    }
}

#[async_trait]
impl IdentityService for StaticIdentity {
    async fn current_user(&self) -> Result<CurrentUser, AuthError> {
        match &self.0 {
            Some(id) => Ok(CurrentUser {
                id: id.clone(),
                email: None,
                session_valid: true,
            }),
            None => Err(AuthError::NoSession),
        }
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        Ok(())
    }
}
