//! Horizon Core - Entity Types
//!
//! Pure data structures for the expiring balance cache. All other crates
//! depend on this one. It performs no I/O.
//!
//! The central type is [`Expiration`]: every cached balance carries the
//! instant at which it stops being trustworthy, bracketed by the sentinels
//! `NegInfinity` (stale now) and `PosInfinity` (fresh until a write).

pub mod clock;
pub mod config;
pub mod entities;
pub mod error;
pub mod event;
pub mod expiration;
pub mod identity;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{HorizonConfig, InvalidationPolicy};
pub use entities::{Account, CacheRow, CommitOutcome, Refresh, Transaction};
pub use error::{ConfigError, HorizonError, HorizonResult, RefreshError, StorageError};
pub use event::MutationEvent;
pub use expiration::{Expiration, ExpirationUpdate};
pub use identity::{new_fact_id, Amount, EntityKey, FactId, Timestamp};
