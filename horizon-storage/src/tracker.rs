//! Invalidation tracker.
//!
//! Turns mutation events into expiration updates on cache rows. Under the
//! lazy policy it never computes a balance: it only lowers expirations so
//! that the next read knows to recompute.
//!
//! | Event | Row update |
//! |---|---|
//! | entity created | insert row `(0, +inf)` if absent |
//! | entity deleted | delete row |
//! | fact created at `t` | `Tighten(t)` |
//! | fact deleted at `t` | `InvalidateIfCovers(t)` |
//! | fact updated | `Invalidate` old and new owner |
//!
//! A pending insert can only pull the horizon in to its own time, which is
//! known. A delete or update can move the balance in ways only a recompute
//! can tell, so those invalidate.

use std::sync::Arc;

use horizon_core::{
    EntityKey, Expiration, ExpirationUpdate, HorizonResult, InvalidationPolicy, MutationEvent,
    Timestamp,
};

use crate::cache::CacheRowRepository;
use crate::fact_store::FactStore;
use crate::refresh::refresh_row;

/// What applying one event did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackOutcome {
    /// Rows created, deleted or given a new expiration.
    pub rows_touched: usize,
    /// Rows recomputed and committed by the eager policy.
    pub recomputed: usize,
}

/// Applies mutation events to the cache rows.
pub struct InvalidationTracker<R: ?Sized, F: ?Sized> {
    rows: Arc<R>,
    facts: Arc<F>,
    policy: InvalidationPolicy,
}

impl<R: ?Sized, F: ?Sized> Clone for InvalidationTracker<R, F> {
    fn clone(&self) -> Self {
        Self {
            rows: Arc::clone(&self.rows),
            facts: Arc::clone(&self.facts),
            policy: self.policy,
        }
    }
}

impl<R, F> InvalidationTracker<R, F>
where
    R: CacheRowRepository + ?Sized,
    F: FactStore + ?Sized,
{
    pub fn new(rows: Arc<R>, facts: Arc<F>, policy: InvalidationPolicy) -> Self {
        Self {
            rows,
            facts,
            policy,
        }
    }

    pub fn policy(&self) -> InvalidationPolicy {
        self.policy
    }

    /// Apply one event as of `now`.
    ///
    /// `now` only matters under the eager policy, where it is the instant
    /// affected rows are recomputed at.
    pub async fn apply(&self, event: &MutationEvent, now: Timestamp) -> HorizonResult<TrackOutcome> {
        let rows_touched = self.apply_lazy(event).await?;

        let recomputed = match (self.policy, event) {
            (InvalidationPolicy::Lazy, _) | (_, MutationEvent::EntityDeleted { .. }) => 0,
            (InvalidationPolicy::Eager, _) => self.recompute_affected(event, now).await?,
        };

        Ok(TrackOutcome {
            rows_touched,
            recomputed,
        })
    }

    async fn apply_lazy(&self, event: &MutationEvent) -> HorizonResult<usize> {
        match event {
            MutationEvent::EntityCreated { key } => {
                let created = self.rows.create_row(key, 0, Expiration::PosInfinity).await?;
                if !created {
                    tracing::debug!(key = %key, "Row already exists; creation ignored");
                }
                Ok(created as usize)
            }
            MutationEvent::EntityDeleted { key } => {
                Ok(self.rows.delete_row(key).await? as usize)
            }
            MutationEvent::FactCreated {
                owner,
                effective_time,
                ..
            } => {
                self.update(owner, ExpirationUpdate::Tighten(*effective_time))
                    .await
            }
            MutationEvent::FactDeleted {
                owner,
                effective_time,
                ..
            } => {
                self.update(owner, ExpirationUpdate::InvalidateIfCovers(*effective_time))
                    .await
            }
            MutationEvent::FactUpdated {
                old_owner,
                new_owner,
                relevant_change,
                ..
            } => {
                if !relevant_change && old_owner == new_owner {
                    tracing::debug!(key = %old_owner, "Update does not affect balance; skipped");
                    return Ok(0);
                }
                let mut touched = 0;
                for key in event.affected_keys() {
                    touched += self.update(key, ExpirationUpdate::Invalidate).await?;
                }
                Ok(touched)
            }
        }
    }

    async fn update(&self, key: &EntityKey, update: ExpirationUpdate) -> HorizonResult<usize> {
        match self.rows.set_expiration(key, update).await {
            Ok(Some(expiration)) => {
                tracing::debug!(key = %key, ?update, %expiration, "Expiration lowered");
                Ok(1)
            }
            Ok(None) => Ok(0),
            Err(e) if e.is_not_found() => {
                self.unknown_row(key).await;
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// Fact events for a deleted account are expected. A missing row for an
    /// account that still exists is not.
    async fn unknown_row(&self, key: &EntityKey) {
        match self.facts.entity_exists(key).await {
            Ok(true) => tracing::warn!(key = %key, "No cache row for existing entity"),
            _ => tracing::debug!(key = %key, "Event for unknown row ignored"),
        }
    }

    async fn recompute_affected(&self, event: &MutationEvent, now: Timestamp) -> HorizonResult<usize> {
        let mut recomputed = 0;
        for key in event.affected_keys() {
            let row = match self.rows.get(key).await {
                Ok(row) => row,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if row.is_fresh_at(now) {
                continue;
            }
            match refresh_row(&*self.rows, &*self.facts, &row, now).await {
                Ok((_, outcome)) if outcome.is_committed() => recomputed += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    key = %key,
                    error = %e,
                    "Eager recompute failed; row stays invalidated"
                ),
            }
        }
        Ok(recomputed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheRows;
    use crate::fact_store::InMemoryFactStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use horizon_core::{new_fact_id, Account, Amount, StorageError};

    fn t(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn key(name: &str) -> EntityKey {
        EntityKey::new(name)
    }

    fn lazy_tracker() -> InvalidationTracker<InMemoryCacheRows, InMemoryFactStore> {
        InvalidationTracker::new(
            Arc::new(InMemoryCacheRows::new()),
            Arc::new(InMemoryFactStore::new()),
            InvalidationPolicy::Lazy,
        )
    }

    fn created(at: i64) -> MutationEvent {
        MutationEvent::FactCreated {
            fact_id: new_fact_id(),
            owner: key("a"),
            effective_time: t(at),
        }
    }

    fn deleted(at: i64) -> MutationEvent {
        MutationEvent::FactDeleted {
            fact_id: new_fact_id(),
            owner: key("a"),
            effective_time: t(at),
        }
    }

    async fn expiration(tracker: &InvalidationTracker<InMemoryCacheRows, InMemoryFactStore>) -> Expiration {
        tracker.rows.get(&key("a")).await.unwrap().expiration
    }

    #[tokio::test]
    async fn test_entity_created_is_idempotent() {
        let tracker = lazy_tracker();
        let event = MutationEvent::EntityCreated { key: key("a") };
        assert_eq!(tracker.apply(&event, t(0)).await.unwrap().rows_touched, 1);
        tracker.apply(&created(5), t(0)).await.unwrap();

        assert_eq!(tracker.apply(&event, t(0)).await.unwrap().rows_touched, 0);
        assert_eq!(expiration(&tracker).await, Expiration::At(t(5)));
    }

    #[tokio::test]
    async fn test_fact_created_tightens_only() {
        let tracker = lazy_tracker();
        tracker
            .apply(&MutationEvent::EntityCreated { key: key("a") }, t(0))
            .await
            .unwrap();

        tracker.apply(&created(10), t(0)).await.unwrap();
        assert_eq!(expiration(&tracker).await, Expiration::At(t(10)));

        let later = tracker.apply(&created(20), t(0)).await.unwrap();
        assert_eq!(later.rows_touched, 0);
        assert_eq!(expiration(&tracker).await, Expiration::At(t(10)));

        tracker.apply(&created(3), t(0)).await.unwrap();
        assert_eq!(expiration(&tracker).await, Expiration::At(t(3)));
    }

    #[tokio::test]
    async fn test_fact_deleted_invalidates_when_covered() {
        let tracker = lazy_tracker();
        tracker
            .apply(&MutationEvent::EntityCreated { key: key("a") }, t(0))
            .await
            .unwrap();
        tracker.apply(&created(10), t(0)).await.unwrap();

        // A fact beyond the horizon was not counted yet.
        tracker.apply(&deleted(11), t(0)).await.unwrap();
        assert_eq!(expiration(&tracker).await, Expiration::At(t(10)));

        tracker.apply(&deleted(10), t(0)).await.unwrap();
        assert_eq!(expiration(&tracker).await, Expiration::NegInfinity);
    }

    #[tokio::test]
    async fn test_update_invalidates_both_owners() {
        let tracker = lazy_tracker();
        for name in ["a", "b"] {
            tracker
                .apply(&MutationEvent::EntityCreated { key: key(name) }, t(0))
                .await
                .unwrap();
        }
        let event = MutationEvent::FactUpdated {
            fact_id: new_fact_id(),
            old_owner: key("a"),
            new_owner: key("b"),
            relevant_change: false,
        };
        let outcome = tracker.apply(&event, t(0)).await.unwrap();
        assert_eq!(outcome.rows_touched, 2);
        for name in ["a", "b"] {
            assert_eq!(
                tracker.rows.get(&key(name)).await.unwrap().expiration,
                Expiration::NegInfinity
            );
        }
    }

    #[tokio::test]
    async fn test_irrelevant_update_is_skipped() {
        let tracker = lazy_tracker();
        tracker
            .apply(&MutationEvent::EntityCreated { key: key("a") }, t(0))
            .await
            .unwrap();
        let event = MutationEvent::FactUpdated {
            fact_id: new_fact_id(),
            old_owner: key("a"),
            new_owner: key("a"),
            relevant_change: false,
        };
        assert_eq!(tracker.apply(&event, t(0)).await.unwrap().rows_touched, 0);
        assert_eq!(expiration(&tracker).await, Expiration::PosInfinity);
    }

    #[tokio::test]
    async fn test_events_for_unknown_rows_are_noops() {
        let tracker = lazy_tracker();
        assert_eq!(
            tracker.apply(&created(1), t(0)).await.unwrap(),
            TrackOutcome::default()
        );
        assert_eq!(
            tracker
                .apply(&MutationEvent::EntityDeleted { key: key("a") }, t(0))
                .await
                .unwrap(),
            TrackOutcome::default()
        );
    }

    #[tokio::test]
    async fn test_eager_recomputes_stale_rows() {
        let facts = Arc::new(InMemoryFactStore::new());
        let rows = Arc::new(InMemoryCacheRows::new());
        let tracker = InvalidationTracker::new(
            Arc::clone(&rows),
            Arc::clone(&facts),
            InvalidationPolicy::Eager,
        );

        let event = facts.insert_account(Account::new("a", t(0))).unwrap();
        tracker.apply(&event, t(0)).await.unwrap();

        let event = facts
            .insert_transaction(horizon_core::Transaction::new("a", 40, t(0)))
            .unwrap();
        let outcome = tracker.apply(&event, t(1)).await.unwrap();
        assert_eq!(outcome.recomputed, 1);

        let row = rows.get(&key("a")).await.unwrap();
        assert_eq!(row.value, 40);
        assert!(row.is_fresh_at(t(1)));
    }

    struct DownStore;

    #[async_trait]
    impl FactStore for DownStore {
        async fn sum_effective(&self, _: &EntityKey, _: Timestamp) -> HorizonResult<Amount> {
            Err(StorageError::Unavailable {
                reason: "down".to_string(),
            }
            .into())
        }

        async fn min_pending(&self, _: &EntityKey, _: Timestamp) -> HorizonResult<Expiration> {
            Ok(Expiration::PosInfinity)
        }

        async fn entity_exists(&self, _: &EntityKey) -> HorizonResult<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_eager_failure_leaves_lazy_result() {
        let rows = Arc::new(InMemoryCacheRows::new());
        rows.create_row(&key("a"), 10, Expiration::PosInfinity)
            .await
            .unwrap();
        let tracker =
            InvalidationTracker::new(Arc::clone(&rows), Arc::new(DownStore), InvalidationPolicy::Eager);

        let outcome = tracker.apply(&deleted(0), t(1)).await.unwrap();
        assert_eq!(
            outcome,
            TrackOutcome {
                rows_touched: 1,
                recomputed: 0,
            }
        );
        assert_eq!(
            rows.get(&key("a")).await.unwrap().expiration,
            Expiration::NegInfinity
        );
    }
}
