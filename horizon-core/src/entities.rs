//! Core entity structures

use crate::{Amount, EntityKey, Expiration, FactId, Timestamp};
use serde::{Deserialize, Serialize};

/// Account - the entity that owns a balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub name: EntityKey,
    pub created_at: Timestamp,
}

impl Account {
    pub fn new(name: impl Into<EntityKey>, created_at: Timestamp) -> Self {
        Self {
            name: name.into(),
            created_at,
        }
    }
}

/// Transaction - a time-scoped contribution to an account balance.
/// It counts toward the balance once `post_time <= now`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: FactId,
    pub account: EntityKey,
    pub amount: Amount,
    pub post_time: Timestamp,
    /// Free-form memo; not part of the aggregate.
    pub memo: Option<String>,
}

impl Transaction {
    pub fn new(account: impl Into<EntityKey>, amount: Amount, post_time: Timestamp) -> Self {
        Self {
            transaction_id: crate::new_fact_id(),
            account: account.into(),
            amount,
            post_time,
            memo: None,
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    /// Effective at `now` (boundary inclusive).
    pub fn is_effective_at(&self, now: Timestamp) -> bool {
        self.post_time <= now
    }

    /// Still pending at `now` (boundary exclusive).
    pub fn is_pending_at(&self, now: Timestamp) -> bool {
        self.post_time > now
    }
}

/// A cached balance projection for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRow {
    pub key: EntityKey,
    pub value: Amount,
    pub expiration: Expiration,
    /// Bumped on every change to the row; guards refresh commits.
    pub version: u64,
    /// Instant `value` was last computed for. `None` until the first
    /// refresh: an account's opening balance holds at every earlier instant.
    #[serde(default)]
    pub computed_at: Option<Timestamp>,
}

impl CacheRow {
    /// Row for a freshly created entity.
    pub fn new(key: EntityKey, value: Amount, expiration: Expiration) -> Self {
        Self {
            key,
            value,
            expiration,
            version: 0,
            computed_at: None,
        }
    }

    /// Fresh when `now` is before the expiration and not before the instant
    /// the value was computed for. Facts in between may not count yet.
    pub fn is_fresh_at(&self, now: Timestamp) -> bool {
        !self.predates(now) && self.expiration.is_fresh_at(now)
    }

    /// Whether `now` is earlier than the instant the value was computed for.
    pub fn predates(&self, now: Timestamp) -> bool {
        self.computed_at.is_some_and(|at| now < at)
    }

    /// Install a committed refresh. The caller bumps the version.
    pub fn apply_refresh(&mut self, refresh: Refresh) {
        self.value = refresh.value;
        self.expiration = refresh.expiration;
        self.computed_at = Some(refresh.computed_at);
    }
}

/// Result of recomputing a row from the fact store at a single instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refresh {
    pub value: Amount,
    pub expiration: Expiration,
    pub computed_at: Timestamp,
}

/// Outcome of a compare-and-swap refresh commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The refresh replaced the row.
    Committed,
    /// The row changed (or vanished) after it was read; nothing was written.
    Superseded,
    /// The read was for an instant before the row's `computed_at`; the
    /// result was served without overwriting the newer row.
    Skipped,
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_transaction_boundary_semantics() {
        let now = Utc::now();
        let tx = Transaction::new("a", 50, now);
        assert!(tx.is_effective_at(now));
        assert!(!tx.is_pending_at(now));
        assert!(tx.is_pending_at(now - Duration::seconds(1)));
        assert!(!tx.is_effective_at(now - Duration::seconds(1)));
    }

    #[test]
    fn test_new_row_starts_at_version_zero() {
        let row = CacheRow::new(EntityKey::new("a"), 0, Expiration::PosInfinity);
        assert_eq!(row.version, 0);
        assert!(row.is_fresh_at(Utc::now()));
    }

    #[test]
    fn test_row_is_stale_before_computed_at() {
        let now = Utc::now();
        let mut row = CacheRow::new(EntityKey::new("a"), 0, Expiration::PosInfinity);
        assert!(row.is_fresh_at(now - Duration::days(365)));

        row.apply_refresh(Refresh {
            value: 100,
            expiration: Expiration::PosInfinity,
            computed_at: now,
        });
        assert!(row.is_fresh_at(now));
        assert!(row.is_fresh_at(now + Duration::hours(1)));
        assert!(row.predates(now - Duration::seconds(1)));
        assert!(!row.is_fresh_at(now - Duration::seconds(1)));
    }

    #[test]
    fn test_rows_without_computed_at_deserialize() {
        let json = r#"{"key":"a","value":5,"expiration":"PosInfinity","version":2}"#;
        let row: CacheRow = serde_json::from_str(json).unwrap();
        assert_eq!(row.computed_at, None);
        assert_eq!(row.version, 2);
    }

    #[test]
    fn test_transaction_memo_builder() {
        let tx = Transaction::new("a", -10, Utc::now()).with_memo("rent");
        assert_eq!(tx.memo.as_deref(), Some("rent"));
        assert_eq!(tx.account, EntityKey::new("a"));
    }
}
