//! LMDB-backed cache row repository.
//!
//! Uses the heed crate (Rust bindings for LMDB) to keep cache rows and
//! their expiration index in one memory-mapped environment that survives
//! restarts.
//!
//! # Layout
//!
//! Two named databases share the environment:
//! - `rows`: entity key bytes to the JSON-encoded [`CacheRow`]
//! - `by_expiration`: [`expiry_key`](super::expiry_key) bytes to an empty value
//!
//! # Atomicity
//!
//! Every mutation reads the row, writes the row and moves its index entry
//! inside a single write transaction. LMDB serializes writers, so there is
//! no interleaving between concurrent updates of the same row. Reads use
//! read transactions and never block writers.

use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use horizon_core::{
    Amount, CacheRow, CommitOutcome, EntityKey, Expiration, ExpirationUpdate, HorizonError,
    HorizonResult, Refresh, StorageError, Timestamp,
};

use super::expiry_key::{self, check_key, key_fits};
use super::traits::{CacheRowRepository, CacheStats};

const ROWS_DB: &str = "rows";
const EXPIRATION_DB: &str = "by_expiration";

/// Error type for LMDB cache operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbCacheError> for HorizonError {
    fn from(e: LmdbCacheError) -> Self {
        HorizonError::Storage(StorageError::TransactionFailed {
            reason: e.to_string(),
        })
    }
}

fn txn_err(e: heed::Error) -> LmdbCacheError {
    LmdbCacheError::Transaction(e.to_string())
}

/// Cache rows persisted in LMDB.
pub struct LmdbCacheRows {
    env: Env,
    rows: Database<Bytes, Bytes>,
    by_expiration: Database<Bytes, Bytes>,
    stats: RwLock<CacheStats>,
}

impl LmdbCacheRows {
    /// Open (or create) the environment at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the
    /// environment or either database cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbCacheError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per path by this process
        // and closed through `close` before any reopen.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(2)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let rows: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(ROWS_DB))
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        let by_expiration: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(EXPIRATION_DB))
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self {
            env,
            rows,
            by_expiration,
            stats: RwLock::new(CacheStats::default()),
        })
    }

    /// Close the environment and wait until LMDB has released it.
    pub fn close(self) {
        let Self { env, .. } = self;
        env.prepare_for_closing().wait();
    }

    fn load(&self, txn: &RoTxn<'_>, key: &EntityKey) -> Result<Option<CacheRow>, LmdbCacheError> {
        // LMDB rejects such keys outright; no row can be stored under one.
        if !key_fits(key) {
            return Ok(None);
        }
        match self.rows.get(txn, key.as_bytes()).map_err(txn_err)? {
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|e| LmdbCacheError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn store(&self, wtxn: &mut RwTxn<'_>, row: &CacheRow) -> Result<(), LmdbCacheError> {
        let bytes =
            serde_json::to_vec(row).map_err(|e| LmdbCacheError::Serialization(e.to_string()))?;
        self.rows
            .put(wtxn, row.key.as_bytes(), &bytes)
            .map_err(txn_err)
    }

    fn reindex(
        &self,
        wtxn: &mut RwTxn<'_>,
        key: &EntityKey,
        from: Option<Expiration>,
        to: Option<Expiration>,
    ) -> Result<(), LmdbCacheError> {
        if let Some(from) = from {
            self.by_expiration
                .delete(wtxn, &expiry_key::encode(from, key))
                .map_err(txn_err)?;
        }
        if let Some(to) = to {
            self.by_expiration
                .put(wtxn, &expiry_key::encode(to, key), &[])
                .map_err(txn_err)?;
        }
        Ok(())
    }

    fn record(&self, f: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }
}

#[async_trait]
impl CacheRowRepository for LmdbCacheRows {
    async fn get(&self, key: &EntityKey) -> HorizonResult<CacheRow> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        self.load(&rtxn, key)?
            .ok_or_else(|| StorageError::NotFound { key: key.clone() }.into())
    }

    async fn create_row(
        &self,
        key: &EntityKey,
        value: Amount,
        expiration: Expiration,
    ) -> HorizonResult<bool> {
        check_key(key)?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        if self.load(&wtxn, key)?.is_some() {
            return Ok(false);
        }
        let row = CacheRow::new(key.clone(), value, expiration);
        self.store(&mut wtxn, &row)?;
        self.reindex(&mut wtxn, key, None, Some(expiration))?;
        wtxn.commit().map_err(txn_err)?;
        Ok(true)
    }

    async fn delete_row(&self, key: &EntityKey) -> HorizonResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let Some(row) = self.load(&wtxn, key)? else {
            return Ok(false);
        };
        self.rows
            .delete(&mut wtxn, key.as_bytes())
            .map_err(txn_err)?;
        self.reindex(&mut wtxn, key, Some(row.expiration), None)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(true)
    }

    async fn list_expired(&self, as_of: Timestamp) -> HorizonResult<Vec<EntityKey>> {
        self.record(|s| s.expired_scans += 1);
        let bound = Expiration::At(as_of);
        let rtxn = self.env.read_txn().map_err(txn_err)?;

        let mut expired = Vec::new();
        for entry in self.by_expiration.iter(&rtxn).map_err(txn_err)? {
            let (bytes, _) = entry.map_err(txn_err)?;
            let (expiration, key) = expiry_key::decode(bytes).ok_or_else(|| {
                StorageError::IndexError {
                    index_name: EXPIRATION_DB.to_string(),
                    reason: "undecodable index key".to_string(),
                }
            })?;
            // Index is ordered by expiration; everything after is fresh.
            if expiration > bound {
                break;
            }
            expired.push(key);
        }
        Ok(expired)
    }

    async fn set_expiration(
        &self,
        key: &EntityKey,
        update: ExpirationUpdate,
    ) -> HorizonResult<Option<Expiration>> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut row = self
            .load(&wtxn, key)?
            .ok_or_else(|| StorageError::NotFound { key: key.clone() })?;

        row.version += 1;
        let current = row.expiration;
        let next = update.apply(current);
        if let Some(next) = next {
            row.expiration = next;
            self.reindex(&mut wtxn, key, Some(current), Some(next))?;
        }
        self.store(&mut wtxn, &row)?;
        wtxn.commit().map_err(txn_err)?;

        if next.is_some() {
            self.record(|s| s.expiration_updates += 1);
        }
        Ok(next)
    }

    async fn commit_refresh(
        &self,
        key: &EntityKey,
        refresh: Refresh,
        observed_version: u64,
    ) -> HorizonResult<CommitOutcome> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut row = match self.load(&wtxn, key)? {
            Some(row) if row.version == observed_version => row,
            _ => {
                self.record(|s| s.superseded_commits += 1);
                return Ok(CommitOutcome::Superseded);
            }
        };

        let current = row.expiration;
        row.apply_refresh(refresh);
        row.version += 1;

        self.store(&mut wtxn, &row)?;
        self.reindex(&mut wtxn, key, Some(current), Some(refresh.expiration))?;
        wtxn.commit().map_err(txn_err)?;

        self.record(|s| s.commits += 1);
        Ok(CommitOutcome::Committed)
    }

    async fn keys(&self) -> HorizonResult<Vec<EntityKey>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut keys = Vec::new();
        for entry in self.rows.iter(&rtxn).map_err(txn_err)? {
            let (bytes, _) = entry.map_err(txn_err)?;
            let key = std::str::from_utf8(bytes).map_err(|e| {
                LmdbCacheError::Deserialization(format!("row key is not UTF-8: {e}"))
            })?;
            keys.push(EntityKey::new(key));
        }
        Ok(keys)
    }

    async fn get_many(&self, keys: &[EntityKey]) -> HorizonResult<Vec<Option<CacheRow>>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            rows.push(self.load(&rtxn, key)?);
        }
        Ok(rows)
    }

    async fn stats(&self) -> HorizonResult<CacheStats> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let row_count = self.rows.len(&rtxn).map_err(txn_err)?;
        let stats = self
            .stats
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();
        Ok(CacheStats { row_count, ..stats })
    }
}
