//! Cache row repository trait and statistics.

use std::sync::Arc;

use async_trait::async_trait;
use horizon_core::{
    Amount, CacheRow, CommitOutcome, EntityKey, Expiration, ExpirationUpdate, HorizonResult,
    Refresh, Timestamp,
};

/// Storage for cached balance rows and their expiration index.
///
/// Every mutating method is one atomic unit on one row: the row and its
/// index entry change together, and no other writer observes a half-applied
/// change. Reads do not take a lock across rows.
///
/// # Versioning
///
/// Each change to a row bumps its `version`, and so does every
/// [`set_expiration`] call, including one that leaves the expiration as it
/// was. [`commit_refresh`] only
/// succeeds when the version still matches the one the caller observed,
/// which keeps a slow reader from overwriting an invalidation that landed
/// while it was recomputing.
///
/// [`set_expiration`]: CacheRowRepository::set_expiration
/// [`commit_refresh`]: CacheRowRepository::commit_refresh
#[async_trait]
pub trait CacheRowRepository: Send + Sync {
    /// Fetch a row. Unknown keys are `StorageError::NotFound`.
    async fn get(&self, key: &EntityKey) -> HorizonResult<CacheRow>;

    /// Insert a row if none exists for `key`.
    ///
    /// Returns `false` when a row was already present; it is left untouched
    /// so a redelivered creation cannot reset tracked state. Keys that are
    /// empty or longer than
    /// [`MAX_ENTITY_KEY_LEN`](super::expiry_key::MAX_ENTITY_KEY_LEN) bytes
    /// are `StorageError::KeyLength`.
    async fn create_row(
        &self,
        key: &EntityKey,
        value: Amount,
        expiration: Expiration,
    ) -> HorizonResult<bool>;

    /// Remove a row. Returns whether one existed.
    async fn delete_row(&self, key: &EntityKey) -> HorizonResult<bool>;

    /// Keys of all rows with `expiration <= as_of`, via the expiration index.
    async fn list_expired(&self, as_of: Timestamp) -> HorizonResult<Vec<EntityKey>>;

    /// Apply an expiration update against the row's current value.
    ///
    /// Returns the new expiration, or `None` when the update left the
    /// expiration unchanged. The version is bumped either way. Unknown keys
    /// are `StorageError::NotFound`.
    async fn set_expiration(
        &self,
        key: &EntityKey,
        update: ExpirationUpdate,
    ) -> HorizonResult<Option<Expiration>>;

    /// Replace value, expiration and `computed_at` with `refresh` if the row
    /// is still at `observed_version`.
    ///
    /// A version mismatch or a vanished row is `Superseded`, not an error.
    async fn commit_refresh(
        &self,
        key: &EntityKey,
        refresh: Refresh,
        observed_version: u64,
    ) -> HorizonResult<CommitOutcome>;

    /// Snapshot of every row key, in no particular order.
    async fn keys(&self) -> HorizonResult<Vec<EntityKey>>;

    /// Fetch several rows; missing keys come back as `None`.
    async fn get_many(&self, keys: &[EntityKey]) -> HorizonResult<Vec<Option<CacheRow>>> {
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get(key).await {
                Ok(row) => rows.push(Some(row)),
                Err(e) if e.is_not_found() => rows.push(None),
                Err(e) => return Err(e),
            }
        }
        Ok(rows)
    }

    /// Repository statistics.
    async fn stats(&self) -> HorizonResult<CacheStats>;
}

#[async_trait]
impl<T: CacheRowRepository + ?Sized> CacheRowRepository for Arc<T> {
    async fn get(&self, key: &EntityKey) -> HorizonResult<CacheRow> {
        (**self).get(key).await
    }

    async fn create_row(
        &self,
        key: &EntityKey,
        value: Amount,
        expiration: Expiration,
    ) -> HorizonResult<bool> {
        (**self).create_row(key, value, expiration).await
    }

    async fn delete_row(&self, key: &EntityKey) -> HorizonResult<bool> {
        (**self).delete_row(key).await
    }

    async fn list_expired(&self, as_of: Timestamp) -> HorizonResult<Vec<EntityKey>> {
        (**self).list_expired(as_of).await
    }

    async fn set_expiration(
        &self,
        key: &EntityKey,
        update: ExpirationUpdate,
    ) -> HorizonResult<Option<Expiration>> {
        (**self).set_expiration(key, update).await
    }

    async fn commit_refresh(
        &self,
        key: &EntityKey,
        refresh: Refresh,
        observed_version: u64,
    ) -> HorizonResult<CommitOutcome> {
        (**self).commit_refresh(key, refresh, observed_version).await
    }

    async fn keys(&self) -> HorizonResult<Vec<EntityKey>> {
        (**self).keys().await
    }

    async fn get_many(&self, keys: &[EntityKey]) -> HorizonResult<Vec<Option<CacheRow>>> {
        (**self).get_many(keys).await
    }

    async fn stats(&self) -> HorizonResult<CacheStats> {
        (**self).stats().await
    }
}

/// Statistics about repository usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of rows currently stored.
    pub row_count: u64,
    /// Expiration updates that changed a row.
    pub expiration_updates: u64,
    /// Refresh commits that replaced a row.
    pub commits: u64,
    /// Refresh commits rejected by the version check.
    pub superseded_commits: u64,
    /// Calls to `list_expired`.
    pub expired_scans: u64,
}

impl CacheStats {
    /// Share of refresh commits that lost a race (0.0 to 1.0).
    pub fn superseded_rate(&self) -> f64 {
        let total = self.commits + self.superseded_commits;
        if total == 0 {
            0.0
        } else {
            self.superseded_commits as f64 / total as f64
        }
    }
}
