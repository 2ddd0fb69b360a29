//! Expiration markers for cache rows.
//!
//! A row is fresh while `now < expiration` and stale once
//! `now >= expiration`. The two sentinels bracket every real instant:
//!
//! ```text
//! NegInfinity  <  At(t0)  <  At(t1)  <  ...  <  PosInfinity
//! "stale now"        "stale once the clock reaches t"       "fresh until a write"
//! ```
//!
//! The tracked expiration may be earlier than the true horizon (extra
//! recompute) but never later (a stale value served as fresh).

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Instant after which a cache row is considered stale.
///
/// The derived ordering follows variant order, so `NegInfinity` sorts
/// before every `At(_)` and `PosInfinity` sorts after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Expiration {
    /// Definitely stale; recompute unconditionally on next read.
    NegInfinity,
    /// Stale once the clock reaches this instant.
    At(Timestamp),
    /// Fresh until a write occurs.
    PosInfinity,
}

impl Expiration {
    /// Check whether a row carrying this expiration is fresh at `now`.
    pub fn is_fresh_at(&self, now: Timestamp) -> bool {
        match self {
            Expiration::NegInfinity => false,
            Expiration::At(at) => now < *at,
            Expiration::PosInfinity => true,
        }
    }

    /// Check whether a row carrying this expiration is stale at `now`.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        !self.is_fresh_at(now)
    }

    /// The concrete instant, if this is not a sentinel.
    pub fn instant(&self) -> Option<Timestamp> {
        match self {
            Expiration::At(at) => Some(*at),
            _ => None,
        }
    }

    /// Build an expiration from an optional next pending instant.
    /// `None` means nothing is pending, hence `PosInfinity`.
    pub fn from_next_pending(next: Option<Timestamp>) -> Self {
        next.map(Expiration::At).unwrap_or(Expiration::PosInfinity)
    }
}

impl From<Timestamp> for Expiration {
    fn from(at: Timestamp) -> Self {
        Expiration::At(at)
    }
}

impl fmt::Display for Expiration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expiration::NegInfinity => f.write_str("-infinity"),
            Expiration::At(at) => write!(f, "{}", at.to_rfc3339()),
            Expiration::PosInfinity => f.write_str("+infinity"),
        }
    }
}

// ============================================================================
// EXPIRATION UPDATES
// ============================================================================

/// A write-path adjustment of a row's expiration.
///
/// Updates are expressed relative to the current value so a repository can
/// apply them atomically (read, compare and write under one lock or one
/// transaction). Every variant can only lower the expiration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpirationUpdate {
    /// A fact pending at `t` was inserted: lower to `t` if `t < current`.
    Tighten(Timestamp),
    /// A fact at `t` was removed: force `NegInfinity` if `t <= current`.
    InvalidateIfCovers(Timestamp),
    /// Force `NegInfinity`.
    Invalidate,
}

impl ExpirationUpdate {
    /// Compute the new expiration, or `None` when the row is left unchanged.
    ///
    /// # Panics
    ///
    /// Panics if the result would be later than `current`. That would mark
    /// a row fresher than is known to be true, which is a defect in the
    /// caller and not a recoverable condition.
    pub fn apply(&self, current: Expiration) -> Option<Expiration> {
        let next = match *self {
            ExpirationUpdate::Tighten(t) => {
                let candidate = Expiration::At(t);
                (candidate < current).then_some(candidate)
            }
            ExpirationUpdate::InvalidateIfCovers(t) => {
                (Expiration::At(t) <= current).then_some(Expiration::NegInfinity)
            }
            ExpirationUpdate::Invalidate => Some(Expiration::NegInfinity),
        };

        if let Some(next) = next {
            assert!(
                next <= current,
                "expiration update {self:?} would widen freshness from {current} to {next}"
            );
        }

        // Invalidating an already invalidated row is not a change.
        next.filter(|next| *next != current)
    }
}
