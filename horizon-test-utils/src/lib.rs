//! Horizon Test Utilities
//!
//! Shared test infrastructure for the Horizon workspace:
//! - Proptest generators for keys, instants and mutation scripts
//! - A fault-injecting fact store
//! - A ledger harness wiring store, tracker and engine together
//! - Test fixtures and custom assertions

pub use horizon_core::{
    Account, Amount, CacheRow, Clock, EntityKey, Expiration, ExpirationUpdate, FactId,
    HorizonConfig, HorizonError, HorizonResult, InvalidationPolicy, ManualClock, MutationEvent,
    RefreshError, StorageError, Timestamp, Transaction,
};
pub use horizon_storage::{
    CacheRowRepository, FactStore, InMemoryCacheRows, InMemoryFactStore, InvalidationTracker,
    LazyRefreshEngine, TrackOutcome, TransactionUpdate,
};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Fact store wrapper that can be switched off to simulate an outage.
#[derive(Debug)]
pub struct FlakyFactStore<F> {
    inner: F,
    available: AtomicBool,
    calls: AtomicU64,
}

impl<F: FactStore> FlakyFactStore<F> {
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            available: AtomicBool::new(true),
            calls: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of queries made against the store, successful or not.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> HorizonResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable {
                reason: "fact store switched off".to_string(),
            }
            .into())
        }
    }
}

#[async_trait]
impl<F: FactStore> FactStore for FlakyFactStore<F> {
    async fn sum_effective(&self, key: &EntityKey, as_of: Timestamp) -> HorizonResult<Amount> {
        self.check()?;
        self.inner.sum_effective(key, as_of).await
    }

    async fn min_pending(&self, key: &EntityKey, as_of: Timestamp) -> HorizonResult<Expiration> {
        self.check()?;
        self.inner.min_pending(key, as_of).await
    }

    async fn entity_exists(&self, key: &EntityKey) -> HorizonResult<bool> {
        self.check()?;
        self.inner.entity_exists(key).await
    }

    async fn aggregate_at(
        &self,
        key: &EntityKey,
        as_of: Timestamp,
    ) -> HorizonResult<(Amount, Expiration)> {
        self.check()?;
        self.inner.aggregate_at(key, as_of).await
    }
}

// ============================================================================
// LEDGER HARNESS
// ============================================================================

/// A reference fact store wired to a tracker and engine.
///
/// Mutations go through the store and their events are routed straight to
/// the tracker, so the cache is up to date when each call returns.
pub struct TestLedger<R: ?Sized = InMemoryCacheRows> {
    pub facts: Arc<InMemoryFactStore>,
    pub rows: Arc<R>,
    pub tracker: InvalidationTracker<R, InMemoryFactStore>,
    pub engine: LazyRefreshEngine<R, InMemoryFactStore>,
}

impl TestLedger<InMemoryCacheRows> {
    pub fn new(policy: InvalidationPolicy) -> Self {
        Self::with_rows(Arc::new(InMemoryCacheRows::new()), policy)
    }
}

impl<R: CacheRowRepository + ?Sized> TestLedger<R> {
    pub fn with_rows(rows: Arc<R>, policy: InvalidationPolicy) -> Self {
        let config = HorizonConfig::default().with_policy(policy);
        let facts = Arc::new(InMemoryFactStore::new());
        Self {
            tracker: InvalidationTracker::new(Arc::clone(&rows), Arc::clone(&facts), policy),
            engine: LazyRefreshEngine::new(Arc::clone(&rows), Arc::clone(&facts), &config),
            facts,
            rows,
        }
    }

    pub async fn route(&self, event: MutationEvent, now: Timestamp) -> HorizonResult<TrackOutcome> {
        self.tracker.apply(&event, now).await
    }

    pub async fn create_account(&self, name: &str, now: Timestamp) -> HorizonResult<EntityKey> {
        let event = self.facts.insert_account(Account::new(name, now))?;
        self.route(event, now).await?;
        Ok(EntityKey::new(name))
    }

    pub async fn delete_account(&self, key: &EntityKey, now: Timestamp) -> HorizonResult<()> {
        let event = self.facts.delete_account(key)?;
        self.route(event, now).await.map(|_| ())
    }

    /// Post a transaction, returning its id.
    pub async fn post(
        &self,
        key: &EntityKey,
        amount: Amount,
        post_time: Timestamp,
        now: Timestamp,
    ) -> HorizonResult<FactId> {
        let tx = Transaction::new(key.clone(), amount, post_time);
        let id = tx.transaction_id;
        let event = self.facts.insert_transaction(tx)?;
        self.route(event, now).await?;
        Ok(id)
    }

    pub async fn update(
        &self,
        id: FactId,
        update: TransactionUpdate,
        now: Timestamp,
    ) -> HorizonResult<()> {
        let event = self.facts.update_transaction(id, update)?;
        self.route(event, now).await.map(|_| ())
    }

    pub async fn remove(&self, id: FactId, now: Timestamp) -> HorizonResult<()> {
        let event = self.facts.delete_transaction(id)?;
        self.route(event, now).await.map(|_| ())
    }

    /// Ground truth straight from the fact store.
    pub async fn truth(&self, key: &EntityKey, now: Timestamp) -> HorizonResult<(Amount, Expiration)> {
        self.facts.aggregate_at(key, now).await
    }

    /// Apply one scripted operation. Operations that reference missing
    /// accounts or transactions are skipped.
    pub async fn run(&self, op: &LedgerOp, now: &mut Timestamp) -> HorizonResult<()> {
        let accounts = self.facts.account_keys()?;
        let ids = self.facts.transaction_ids()?;
        let pick_account = |i: usize| fixtures::account_name(i);

        match op {
            LedgerOp::CreateAccount(i) => {
                let key = EntityKey::new(pick_account(*i));
                if !accounts.contains(&key) {
                    self.create_account(key.as_str(), *now).await?;
                }
            }
            LedgerOp::DeleteAccount(i) => {
                let key = EntityKey::new(pick_account(*i));
                if accounts.contains(&key) {
                    self.delete_account(&key, *now).await?;
                }
            }
            LedgerOp::Post {
                account,
                amount,
                offset_secs,
            } => {
                let key = EntityKey::new(pick_account(*account));
                if accounts.contains(&key) {
                    let post_time = *now + Duration::seconds(*offset_secs);
                    self.post(&key, *amount, post_time, *now).await?;
                }
            }
            LedgerOp::Amend {
                index,
                amount,
                offset_secs,
                move_to,
            } => {
                if ids.is_empty() {
                    return Ok(());
                }
                let account = move_to
                    .map(|i| EntityKey::new(pick_account(i)))
                    .filter(|key| accounts.contains(key));
                let update = TransactionUpdate {
                    account,
                    amount: *amount,
                    post_time: offset_secs.map(|secs| *now + Duration::seconds(secs)),
                    memo: None,
                };
                self.update(ids[index % ids.len()], update, *now).await?;
            }
            LedgerOp::Remove(index) => {
                if !ids.is_empty() {
                    self.remove(ids[index % ids.len()], *now).await?;
                }
            }
            LedgerOp::Advance(secs) => *now += Duration::seconds(*secs),
        }
        Ok(())
    }
}

/// One step of a randomized ledger script.
#[derive(Debug, Clone)]
pub enum LedgerOp {
    CreateAccount(usize),
    DeleteAccount(usize),
    Post {
        account: usize,
        amount: Amount,
        offset_secs: i64,
    },
    Amend {
        index: usize,
        amount: Option<Amount>,
        offset_secs: Option<i64>,
        move_to: Option<usize>,
    },
    Remove(usize),
    /// Move the clock forward; time never goes back.
    Advance(i64),
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Horizon types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a Timestamp (DateTime<Utc>).
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        // Generate timestamps within a reasonable range (2020-2030)
        (1577836800i64..1893456000i64, 0u32..1_000_000_000).prop_map(|(secs, nanos)| {
            chrono::DateTime::from_timestamp(secs, nanos).unwrap_or_else(fixtures::base_time)
        })
    }

    /// Generate an Expiration, sentinels included.
    pub fn arb_expiration() -> impl Strategy<Value = Expiration> {
        prop_oneof![
            1 => Just(Expiration::NegInfinity),
            6 => arb_timestamp().prop_map(Expiration::At),
            1 => Just(Expiration::PosInfinity),
        ]
    }

    /// Generate an ExpirationUpdate.
    pub fn arb_expiration_update() -> impl Strategy<Value = ExpirationUpdate> {
        prop_oneof![
            arb_timestamp().prop_map(ExpirationUpdate::Tighten),
            arb_timestamp().prop_map(ExpirationUpdate::InvalidateIfCovers),
            Just(ExpirationUpdate::Invalidate),
        ]
    }

    /// Generate a short entity key.
    pub fn arb_entity_key() -> impl Strategy<Value = EntityKey> {
        "[a-z][a-z0-9_-]{0,15}".prop_map(EntityKey::new)
    }

    /// Generate a transaction amount (debits and credits).
    pub fn arb_amount() -> impl Strategy<Value = Amount> {
        -10_000i64..10_000i64
    }

    /// Offsets around "now", biased to hit the boundary.
    pub fn arb_offset_secs() -> impl Strategy<Value = i64> {
        prop_oneof![
            2 => Just(0i64),
            3 => -3_600i64..3_600i64,
            1 => -864_000i64..864_000i64,
        ]
    }

    pub fn arb_ledger_op() -> impl Strategy<Value = LedgerOp> {
        let slot = 0usize..fixtures::ACCOUNT_POOL;
        prop_oneof![
            2 => slot.clone().prop_map(LedgerOp::CreateAccount),
            1 => slot.clone().prop_map(LedgerOp::DeleteAccount),
            5 => (slot.clone(), arb_amount(), arb_offset_secs()).prop_map(
                |(account, amount, offset_secs)| LedgerOp::Post {
                    account,
                    amount,
                    offset_secs,
                }
            ),
            2 => (
                any::<usize>(),
                proptest::option::of(arb_amount()),
                proptest::option::of(arb_offset_secs()),
                proptest::option::of(slot),
            )
                .prop_map(|(index, amount, offset_secs, move_to)| LedgerOp::Amend {
                    index,
                    amount,
                    offset_secs,
                    move_to,
                }),
            2 => any::<usize>().prop_map(LedgerOp::Remove),
            3 => (0i64..7_200i64).prop_map(LedgerOp::Advance),
        ]
    }

    /// A script that starts by creating every account in the pool.
    pub fn arb_ledger_script(max_len: usize) -> impl Strategy<Value = Vec<LedgerOp>> {
        proptest::collection::vec(arb_ledger_op(), 1..max_len).prop_map(|ops| {
            (0..fixtures::ACCOUNT_POOL)
                .map(LedgerOp::CreateAccount)
                .chain(ops)
                .collect()
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;
    use chrono::TimeZone;

    /// Number of distinct account names scripts draw from.
    pub const ACCOUNT_POOL: usize = 4;

    /// Fixed starting instant (2023-11-14T22:13:20Z).
    pub fn base_time() -> Timestamp {
        chrono::Utc
            .timestamp_opt(1_700_000_000, 0)
            .single()
            .unwrap_or_default()
    }

    pub fn account_name(slot: usize) -> String {
        format!("acct-{}", slot % ACCOUNT_POOL)
    }

    /// Config with a small scan batch so scans cross batch boundaries.
    pub fn small_batch_config(policy: InvalidationPolicy) -> HorizonConfig {
        HorizonConfig::default()
            .with_policy(policy)
            .with_scan_batch_size(2)
    }

    pub fn manual_clock() -> ManualClock {
        ManualClock::new(base_time())
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertions for Horizon results.

    use super::*;

    /// Assert that a HorizonResult is a NotFound storage error.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &HorizonResult<T>) {
        match result {
            Err(HorizonError::Storage(StorageError::NotFound { .. })) => {}
            other => panic!("Expected NotFound error, got: {:?}", other),
        }
    }

    /// Assert that a HorizonResult is a RecomputeFailed refresh error.
    #[track_caller]
    pub fn assert_recompute_failed<T: std::fmt::Debug>(result: &HorizonResult<T>) {
        match result {
            Err(HorizonError::Refresh(RefreshError::RecomputeFailed { .. })) => {}
            other => panic!("Expected RecomputeFailed error, got: {:?}", other),
        }
    }

    /// Assert that a tracked expiration never claims more freshness than
    /// the facts allow.
    #[track_caller]
    pub fn assert_not_over_fresh(tracked: Expiration, horizon: Expiration) {
        assert!(
            tracked <= horizon,
            "tracked expiration {} is later than true horizon {}",
            tracked,
            horizon
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_flaky_store_switches_off() {
        let store = FlakyFactStore::new(InMemoryFactStore::new());
        let key = EntityKey::new("a");
        let now = fixtures::base_time();
        assert!(store.sum_effective(&key, now).await.is_ok());

        store.set_available(false);
        let result = store.aggregate_at(&key, now).await;
        assert!(matches!(
            result,
            Err(HorizonError::Storage(StorageError::Unavailable { .. }))
        ));
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test]
    async fn test_ledger_routes_events() {
        let ledger = TestLedger::new(InvalidationPolicy::Lazy);
        let now = fixtures::base_time();
        let key = ledger.create_account("a", now).await.unwrap();
        ledger
            .post(&key, 10, now + Duration::hours(1), now)
            .await
            .unwrap();

        let row = ledger.rows.get(&key).await.unwrap();
        assert_eq!(row.expiration, Expiration::At(now + Duration::hours(1)));
        assert_eq!(
            ledger.truth(&key, now).await.unwrap(),
            (0, Expiration::At(now + Duration::hours(1)))
        );
    }

    #[test]
    fn test_account_names_wrap() {
        assert_eq!(fixtures::account_name(0), "acct-0");
        assert_eq!(fixtures::account_name(fixtures::ACCOUNT_POOL), "acct-0");
    }

    proptest! {
        #[test]
        fn prop_scripts_start_with_account_pool(script in generators::arb_ledger_script(8)) {
            prop_assert!(script.len() > fixtures::ACCOUNT_POOL);
            for (slot, op) in script.iter().take(fixtures::ACCOUNT_POOL).enumerate() {
                prop_assert!(matches!(op, LedgerOp::CreateAccount(i) if *i == slot));
            }
        }

        #[test]
        fn prop_generated_timestamps_in_range(ts in generators::arb_timestamp()) {
            prop_assert!(ts.timestamp() >= 1577836800);
            prop_assert!(ts.timestamp() < 1893456000);
        }
    }
}
