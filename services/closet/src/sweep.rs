//! Orphan reconciliation.
//!
//! Photos and records are written in two steps with no shared transaction,
//! so a failure in between can leave photos that no record references. The
//! sweeper compares an owner's closet prefix against the keys their records
//! reference and removes what is left over. Scheduling is up to the operator.

use crate::error::{within, ClosetError, DataError, StoreError};
use crate::keys::{owner_prefix, AssetPurpose, ObjectKey};
use crate::model::{ItemQuery, OwnerId};
use crate::object_store::{ObjectStore, StoredObject};
use crate::repository::ItemRepository;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// What one sweep found and did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub prefix: String,
    pub scanned: usize,
    pub referenced: usize,
    /// Removed, or due for removal on a dry run
    pub removed: Vec<ObjectKey>,
    pub failed: Vec<ObjectKey>,
    pub dry_run: bool,
}

pub struct OrphanSweeper {
    store: Arc<dyn ObjectStore>,
    repository: Arc<dyn ItemRepository>,
    grace_period: Duration,
    temp_max_age: Duration,
    timeout: Duration,
}

impl OrphanSweeper {
    pub fn new(store: Arc<dyn ObjectStore>, repository: Arc<dyn ItemRepository>) -> Self {
        Self {
            store,
            repository,
            grace_period: Duration::from_secs(3600),
            temp_max_age: Duration::from_secs(24 * 60 * 60),
            timeout: Duration::from_secs(30),
        }
    }

    /// Unreferenced photos younger than this may belong to a create in flight
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_temp_max_age(mut self, max_age: Duration) -> Self {
        self.temp_max_age = max_age;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Remove closet photos of `owner` that no record references
    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn sweep_owner(&self, owner: &OwnerId, dry_run: bool) -> Result<SweepReport, ClosetError> {
        let prefix = owner_prefix(AssetPurpose::Closet, owner);
        let objects = self.list(&prefix).await?;

        let records = within(
            self.timeout,
            self.repository.list(owner, &ItemQuery::default()),
            DataError::Timeout,
        )
        .await?;
        let referenced: HashSet<ObjectKey> = records
            .into_iter()
            .flat_map(|record| record.photo_keys)
            .collect();

        let cutoff = cutoff(Utc::now(), self.grace_period);
        let candidates: Vec<ObjectKey> = objects
            .iter()
            .filter(|obj| !referenced.contains(&obj.key))
            .filter(|obj| older_than(obj, cutoff))
            .map(|obj| obj.key.clone())
            .collect();

        let mut report = SweepReport {
            prefix,
            scanned: objects.len(),
            referenced: referenced.len(),
            dry_run,
            ..Default::default()
        };
        self.remove(candidates, &mut report).await;

        metrics::counter!("closet.sweep.removed").increment(report.removed.len() as u64);
        info!(
            scanned = report.scanned,
            removed = report.removed.len(),
            failed = report.failed.len(),
            dry_run,
            "Closet sweep finished"
        );
        Ok(report)
    }

    /// Remove temp uploads of `owner` older than the temp retention
    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn cleanup_temp(&self, owner: &OwnerId, dry_run: bool) -> Result<SweepReport, ClosetError> {
        let prefix = owner_prefix(AssetPurpose::Temp, owner);
        let objects = self.list(&prefix).await?;

        let cutoff = cutoff(Utc::now(), self.temp_max_age);
        let candidates: Vec<ObjectKey> = objects
            .iter()
            .filter(|obj| older_than(obj, cutoff))
            .map(|obj| obj.key.clone())
            .collect();

        let mut report = SweepReport {
            prefix,
            scanned: objects.len(),
            dry_run,
            ..Default::default()
        };
        self.remove(candidates, &mut report).await;

        info!(
            scanned = report.scanned,
            removed = report.removed.len(),
            dry_run,
            "Temp cleanup finished"
        );
        Ok(report)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, ClosetError> {
        Ok(within(self.timeout, self.store.list(prefix), StoreError::Timeout).await?)
    }

    async fn remove(&self, candidates: Vec<ObjectKey>, report: &mut SweepReport) {
        for key in candidates {
            if report.dry_run {
                report.removed.push(key);
                continue;
            }
            match within(self.timeout, self.store.delete(&key), StoreError::Timeout).await {
                Ok(()) => report.removed.push(key),
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to remove orphaned object");
                    report.failed.push(key);
                }
            }
        }
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Objects without a modification time are never considered old
fn older_than(obj: &StoredObject, cutoff: DateTime<Utc>) -> bool {
    obj.last_modified.map_or(false, |modified| modified < cutoff)
}
