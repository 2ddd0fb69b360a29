//! Cache row storage with an expiration index.
//!
//! A cache row holds one entity's balance together with the instant it
//! stops being trustworthy. Repositories keep a secondary index ordered by
//! that instant so due rows can be found without touching fresh ones.
//!
//! Two implementations share the [`CacheRowRepository`] contract:
//! [`InMemoryCacheRows`] for tests and embedding, and [`LmdbCacheRows`]
//! when rows have to survive a restart. [`open_rows`] picks one from
//! [`HorizonConfig`].

pub mod expiry_key;
pub mod lmdb_backend;
pub mod memory;
pub mod traits;

use std::sync::Arc;

use horizon_core::{HorizonConfig, HorizonResult};

pub use lmdb_backend::{LmdbCacheError, LmdbCacheRows};
pub use memory::InMemoryCacheRows;
pub use traits::{CacheRowRepository, CacheStats};

/// Open the repository selected by `config.lmdb_path`.
pub fn open_rows(config: &HorizonConfig) -> HorizonResult<Arc<dyn CacheRowRepository>> {
    match &config.lmdb_path {
        Some(path) => {
            let rows = LmdbCacheRows::open(path, config.lmdb_max_size_mb)?;
            tracing::info!(path = %path.display(), "Opened LMDB cache rows");
            Ok(Arc::new(rows))
        }
        None => Ok(Arc::new(InMemoryCacheRows::new())),
    }
}
