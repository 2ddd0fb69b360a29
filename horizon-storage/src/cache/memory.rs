//! In-memory cache row repository.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use horizon_core::{
    Amount, CacheRow, CommitOutcome, EntityKey, Expiration, ExpirationUpdate, HorizonError,
    HorizonResult, Refresh, StorageError, Timestamp,
};

use super::expiry_key::check_key;
use super::traits::{CacheRowRepository, CacheStats};

#[derive(Debug, Default)]
struct RowTable {
    rows: HashMap<EntityKey, CacheRow>,
    by_expiration: BTreeSet<(Expiration, EntityKey)>,
}

/// Usage counters, kept outside the table lock so scans can stay readers.
#[derive(Debug, Default)]
struct Counters {
    expiration_updates: AtomicU64,
    commits: AtomicU64,
    superseded_commits: AtomicU64,
    expired_scans: AtomicU64,
}

impl Counters {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl RowTable {
    fn insert(&mut self, row: CacheRow) {
        self.by_expiration.insert((row.expiration, row.key.clone()));
        self.rows.insert(row.key.clone(), row);
    }

    /// Move a row to a new expiration, keeping the index in step.
    fn reindex(&mut self, key: &EntityKey, from: Expiration, to: Expiration) {
        self.by_expiration.remove(&(from, key.clone()));
        self.by_expiration.insert((to, key.clone()));
    }
}

/// Cache rows held in a `HashMap`, indexed by expiration in a `BTreeSet`.
///
/// Row and index live behind one lock, so each operation sees and leaves
/// them consistent.
#[derive(Debug, Default)]
pub struct InMemoryCacheRows {
    table: RwLock<RowTable>,
    counters: Counters,
}

impl InMemoryCacheRows {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> HorizonResult<RwLockReadGuard<'_, RowTable>> {
        self.table
            .read()
            .map_err(|_| HorizonError::Storage(StorageError::LockPoisoned))
    }

    fn write(&self) -> HorizonResult<RwLockWriteGuard<'_, RowTable>> {
        self.table
            .write()
            .map_err(|_| HorizonError::Storage(StorageError::LockPoisoned))
    }
}

#[async_trait]
impl CacheRowRepository for InMemoryCacheRows {
    async fn get(&self, key: &EntityKey) -> HorizonResult<CacheRow> {
        self.read()?
            .rows
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound { key: key.clone() }.into())
    }

    async fn create_row(
        &self,
        key: &EntityKey,
        value: Amount,
        expiration: Expiration,
    ) -> HorizonResult<bool> {
        check_key(key)?;
        let mut table = self.write()?;
        if table.rows.contains_key(key) {
            return Ok(false);
        }
        table.insert(CacheRow::new(key.clone(), value, expiration));
        Ok(true)
    }

    async fn delete_row(&self, key: &EntityKey) -> HorizonResult<bool> {
        let mut table = self.write()?;
        match table.rows.remove(key) {
            Some(row) => {
                table.by_expiration.remove(&(row.expiration, row.key));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_expired(&self, as_of: Timestamp) -> HorizonResult<Vec<EntityKey>> {
        Counters::incr(&self.counters.expired_scans);
        let table = self.read()?;
        let bound = Expiration::At(as_of);
        Ok(table
            .by_expiration
            .iter()
            .take_while(|(expiration, _)| *expiration <= bound)
            .map(|(_, key)| key.clone())
            .collect())
    }

    async fn set_expiration(
        &self,
        key: &EntityKey,
        update: ExpirationUpdate,
    ) -> HorizonResult<Option<Expiration>> {
        let mut guard = self.write()?;
        let table = &mut *guard;
        let row = table
            .rows
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound { key: key.clone() })?;

        // Any update means the facts moved; an in-flight refresh must lose
        // its commit even when the expiration stays put.
        row.version += 1;
        let current = row.expiration;
        let Some(next) = update.apply(current) else {
            return Ok(None);
        };
        row.expiration = next;

        table.reindex(key, current, next);
        Counters::incr(&self.counters.expiration_updates);
        Ok(Some(next))
    }

    async fn commit_refresh(
        &self,
        key: &EntityKey,
        refresh: Refresh,
        observed_version: u64,
    ) -> HorizonResult<CommitOutcome> {
        let mut guard = self.write()?;
        let table = &mut *guard;
        let current = match table.rows.get_mut(key) {
            Some(row) if row.version == observed_version => {
                let current = row.expiration;
                row.apply_refresh(refresh);
                row.version += 1;
                current
            }
            _ => {
                Counters::incr(&self.counters.superseded_commits);
                return Ok(CommitOutcome::Superseded);
            }
        };

        table.reindex(key, current, refresh.expiration);
        Counters::incr(&self.counters.commits);
        Ok(CommitOutcome::Committed)
    }

    async fn keys(&self) -> HorizonResult<Vec<EntityKey>> {
        Ok(self.read()?.rows.keys().cloned().collect())
    }

    async fn get_many(&self, keys: &[EntityKey]) -> HorizonResult<Vec<Option<CacheRow>>> {
        let table = self.read()?;
        Ok(keys.iter().map(|key| table.rows.get(key).cloned()).collect())
    }

    async fn stats(&self) -> HorizonResult<CacheStats> {
        let row_count = self.read()?.rows.len() as u64;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        Ok(CacheStats {
            row_count,
            expiration_updates: load(&self.counters.expiration_updates),
            commits: load(&self.counters.commits),
            superseded_commits: load(&self.counters.superseded_commits),
            expired_scans: load(&self.counters.expired_scans),
        })
    }
}
