//! Horizon Storage - Expiring Balance Cache
//!
//! Keeps a cached balance per account next to the instant it stops being
//! correct. Writes only lower that instant; reads recompute a row when the
//! read time has reached it.
//!
//! # Components
//!
//! - [`FactStore`]: read access to accounts and transactions, plus the
//!   [`InMemoryFactStore`] reference store that publishes mutation events
//! - [`CacheRowRepository`]: cache rows and their expiration index, in
//!   memory or in LMDB
//! - [`InvalidationTracker`]: turns mutation events into expiration updates
//! - [`LazyRefreshEngine`]: serves fresh balances, recomputing stale rows
//! - [`run_mutation_feed`] and [`run_expiry_sweeper`]: background tasks
//!
//! ```ignore
//! let facts = Arc::new(InMemoryFactStore::new());
//! let rows = Arc::new(InMemoryCacheRows::new());
//! let tracker = InvalidationTracker::new(rows.clone(), facts.clone(), config.policy);
//! let engine = LazyRefreshEngine::new(rows, facts.clone(), &config);
//!
//! let event = facts.insert_account(Account::new("checking", now))?;
//! tracker.apply(&event, now).await?;
//! let balances = engine.read_fresh(&[EntityKey::new("checking")], now).await?;
//! ```

pub mod cache;
pub mod fact_store;
pub mod feed;
pub mod metrics;
pub mod refresh;
pub mod tracker;

pub use cache::{
    open_rows, CacheRowRepository, CacheStats, InMemoryCacheRows, LmdbCacheError, LmdbCacheRows,
};
pub use fact_store::{FactStore, InMemoryFactStore, TransactionUpdate};
pub use feed::{run_expiry_sweeper, run_mutation_feed};
pub use metrics::{FeedMetrics, FeedMetricsSnapshot, RefreshMetrics, RefreshMetricsSnapshot};
pub use refresh::{recompute, refresh_row, FreshScan, LazyRefreshEngine};
pub use tracker::{InvalidationTracker, TrackOutcome};
