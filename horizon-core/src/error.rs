//! Error types for Horizon operations

use crate::{EntityKey, FactId, Timestamp};
use thiserror::Error;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {key}")]
    NotFound { key: EntityKey },

    #[error("Fact not found: {id}")]
    FactNotFound { id: FactId },

    #[error("Insert failed for {key}: {reason}")]
    InsertFailed { key: EntityKey, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Index error on {index_name}: {reason}")]
    IndexError { index_name: String, reason: String },

    #[error("Fact store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Balance of {key} overflows at {as_of}")]
    AggregateOverflow { key: EntityKey, as_of: Timestamp },

    #[error("Key {key:?} is {len} bytes; allowed length is 1..={max}")]
    KeyLength { key: EntityKey, len: usize, max: usize },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Errors raised while refreshing a cache row.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("Recompute failed for {key}: {reason}")]
    RecomputeFailed { key: EntityKey, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Horizon errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HorizonError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Refresh error: {0}")]
    Refresh(#[from] RefreshError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl HorizonError {
    /// True when the error reports an unknown entity key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, HorizonError::Storage(StorageError::NotFound { .. }))
    }

    /// True when a recompute could not reach the fact store.
    pub fn is_recompute_failed(&self) -> bool {
        matches!(self, HorizonError::Refresh(RefreshError::RecomputeFailed { .. }))
    }
}

/// Result type alias for Horizon operations.
pub type HorizonResult<T> = Result<T, HorizonError>;

// =============================================================================
// TESTS
// =============================================================================
