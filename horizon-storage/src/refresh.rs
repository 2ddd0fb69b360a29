//! Lazy refresh engine.
//!
//! Reads take a single `now` and split the requested rows into fresh
//! (`now < expiration`) and stale. Fresh rows are served as stored; stale
//! rows are recomputed from the fact store, committed under the version
//! check, and served with the recomputed value.
//!
//! A refresh that loses the version race still returns its value: it was
//! computed from the fact store at the caller's `now`, so it is correct for
//! that caller even though the row now holds something newer.
//!
//! Reads may go back in time. A row is never fresh before the instant its
//! value was computed for; such reads recompute at their own `now` and
//! leave the newer row in place.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use futures_util::future::{join_all, try_join_all};
use futures_util::stream::{self, Stream};
use horizon_core::{
    Amount, CacheRow, CommitOutcome, EntityKey, HorizonConfig, HorizonResult, Refresh,
    RefreshError, StorageError, Timestamp,
};

use crate::cache::CacheRowRepository;
use crate::fact_store::FactStore;
use crate::metrics::{RefreshMetrics, RefreshMetricsSnapshot};

/// Recompute an entity's balance and expiration from the fact store.
///
/// The expiration is the earliest fact still pending at `now`, so the
/// result is exactly as fresh as the facts allow. Any store failure is
/// reported as `RefreshError::RecomputeFailed`.
pub async fn recompute<F: FactStore + ?Sized>(
    facts: &F,
    key: &EntityKey,
    now: Timestamp,
) -> HorizonResult<Refresh> {
    let (value, expiration) =
        facts
            .aggregate_at(key, now)
            .await
            .map_err(|e| RefreshError::RecomputeFailed {
                key: key.clone(),
                reason: e.to_string(),
            })?;
    Ok(Refresh {
        value,
        expiration,
        computed_at: now,
    })
}

/// Recompute `row` at `now` and commit the result against its version.
///
/// Shared by lazy reads and eager invalidation. On failure nothing is
/// written. When `now` predates the row's `computed_at` the result is
/// returned as `Skipped` and not written.
pub async fn refresh_row<R, F>(
    rows: &R,
    facts: &F,
    row: &CacheRow,
    now: Timestamp,
) -> HorizonResult<(Amount, CommitOutcome)>
where
    R: CacheRowRepository + ?Sized,
    F: FactStore + ?Sized,
{
    let refresh = recompute(facts, &row.key, now).await?;
    if row.predates(now) {
        tracing::debug!(
            key = %row.key,
            computed_at = ?row.computed_at,
            %now,
            "Read predates cached row; serving without commit"
        );
        return Ok((refresh.value, CommitOutcome::Skipped));
    }

    let outcome = rows
        .commit_refresh(&row.key, refresh, row.version)
        .await?;

    if outcome == CommitOutcome::Superseded {
        tracing::debug!(
            key = %row.key,
            observed_version = row.version,
            "Refresh superseded by a concurrent change"
        );
    }
    Ok((refresh.value, outcome))
}

// ============================================================================
// ENGINE
// ============================================================================

/// Serves fresh balances, recomputing stale rows on demand.
pub struct LazyRefreshEngine<R: ?Sized, F: ?Sized> {
    rows: Arc<R>,
    facts: Arc<F>,
    scan_batch_size: usize,
    metrics: Arc<RefreshMetrics>,
}

impl<R: ?Sized, F: ?Sized> Clone for LazyRefreshEngine<R, F> {
    fn clone(&self) -> Self {
        Self {
            rows: Arc::clone(&self.rows),
            facts: Arc::clone(&self.facts),
            scan_batch_size: self.scan_batch_size,
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<R, F> LazyRefreshEngine<R, F>
where
    R: CacheRowRepository + ?Sized,
    F: FactStore + ?Sized,
{
    pub fn new(rows: Arc<R>, facts: Arc<F>, config: &HorizonConfig) -> Self {
        Self {
            rows,
            facts,
            scan_batch_size: config.scan_batch_size.max(1),
            metrics: Arc::new(RefreshMetrics::new()),
        }
    }

    pub fn rows(&self) -> &Arc<R> {
        &self.rows
    }

    pub fn facts(&self) -> &Arc<F> {
        &self.facts
    }

    pub fn metrics(&self) -> RefreshMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Fresh balances for `keys` as of `now`.
    ///
    /// Duplicate keys are read once. An unknown key fails the whole read
    /// with `StorageError::NotFound`; a failed recompute fails it with
    /// `RefreshError::RecomputeFailed` and leaves that row unchanged.
    pub async fn read_fresh(
        &self,
        keys: &[EntityKey],
        now: Timestamp,
    ) -> HorizonResult<HashMap<EntityKey, Amount>> {
        let mut seen = HashSet::with_capacity(keys.len());
        let unique: Vec<EntityKey> = keys
            .iter()
            .filter(|key| seen.insert(*key))
            .cloned()
            .collect();

        let fetched = self.rows.get_many(&unique).await?;

        let mut balances = HashMap::with_capacity(unique.len());
        let mut stale = Vec::new();
        for (key, row) in unique.into_iter().zip(fetched) {
            let row = row.ok_or(StorageError::NotFound { key })?;
            if row.is_fresh_at(now) {
                RefreshMetrics::incr(&self.metrics.fresh_hits);
                balances.insert(row.key, row.value);
            } else {
                stale.push(row);
            }
        }

        let refreshed = try_join_all(stale.iter().map(|row| self.refresh(row, now))).await?;
        for (row, (value, _)) in stale.into_iter().zip(refreshed) {
            balances.insert(row.key, value);
        }
        Ok(balances)
    }

    /// Fresh balance for a single key.
    pub async fn read_one(&self, key: &EntityKey, now: Timestamp) -> HorizonResult<Amount> {
        let row = self.rows.get(key).await?;
        if row.is_fresh_at(now) {
            RefreshMetrics::incr(&self.metrics.fresh_hits);
            return Ok(row.value);
        }
        self.refresh(&row, now).await.map(|(value, _)| value)
    }

    /// Recompute every row the expiration index reports as due at `now`.
    ///
    /// Returns how many refreshes were committed. Rows deleted or refreshed
    /// by someone else since the index lookup are skipped.
    pub async fn refresh_expired(&self, now: Timestamp) -> HorizonResult<usize> {
        let due = self.rows.list_expired(now).await?;
        let mut committed = 0;

        for batch in due.chunks(self.scan_batch_size) {
            let rows = self.rows.get_many(batch).await?;
            let still_due: Vec<CacheRow> = rows
                .into_iter()
                .flatten()
                .filter(|row| !row.is_fresh_at(now))
                .collect();

            let outcomes =
                try_join_all(still_due.iter().map(|row| self.refresh(row, now))).await?;
            committed += outcomes
                .iter()
                .filter(|(_, outcome)| outcome.is_committed())
                .count();
        }

        if committed > 0 {
            tracing::debug!(count = committed, due = due.len(), "Refreshed expired rows");
        }
        Ok(committed)
    }

    /// Lazily scan every row, yielding fresh balances as of `now`.
    pub fn read_all_fresh(&self, now: Timestamp) -> FreshScan<R, F> {
        FreshScan {
            engine: self.clone(),
            now,
            keys: None,
            snapshot_failed: false,
            cursor: 0,
            buffer: VecDeque::new(),
        }
    }

    async fn refresh(
        &self,
        row: &CacheRow,
        now: Timestamp,
    ) -> HorizonResult<(Amount, CommitOutcome)> {
        RefreshMetrics::incr(&self.metrics.recomputes);
        match refresh_row(&*self.rows, &*self.facts, row, now).await {
            Ok((value, outcome)) => {
                match outcome {
                    CommitOutcome::Committed => {}
                    CommitOutcome::Superseded => RefreshMetrics::incr(&self.metrics.superseded),
                    CommitOutcome::Skipped => RefreshMetrics::incr(&self.metrics.historical_reads),
                }
                Ok((value, outcome))
            }
            Err(e) => {
                RefreshMetrics::incr(&self.metrics.recompute_failures);
                Err(e)
            }
        }
    }
}

// ============================================================================
// FULL SCAN
// ============================================================================

/// A restartable, finite scan over all rows at one fixed `now`.
///
/// The key snapshot is taken on the first call to [`next`](Self::next) and
/// is advisory: each row is re-read when its batch is loaded, rows deleted
/// since the snapshot are skipped, and rows that went stale are recomputed.
/// Rows created after the snapshot are not visited.
pub struct FreshScan<R: ?Sized, F: ?Sized> {
    engine: LazyRefreshEngine<R, F>,
    now: Timestamp,
    keys: Option<Vec<EntityKey>>,
    /// The key snapshot could not be taken; `restart` retries it.
    snapshot_failed: bool,
    cursor: usize,
    buffer: VecDeque<HorizonResult<(EntityKey, Amount)>>,
}

impl<R, F> FreshScan<R, F>
where
    R: CacheRowRepository + ?Sized,
    F: FactStore + ?Sized,
{
    /// The instant every yielded balance is fresh at.
    pub fn as_of(&self) -> Timestamp {
        self.now
    }

    /// Next `(key, balance)` pair, or `None` once the snapshot is exhausted.
    pub async fn next(&mut self) -> Option<HorizonResult<(EntityKey, Amount)>> {
        if self.keys.is_none() {
            if let Err(e) = self.start().await {
                // End this pass; the error is reported once.
                self.keys = Some(Vec::new());
                self.snapshot_failed = true;
                return Some(Err(e));
            }
        }

        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(item);
            }

            let keys = self.keys.as_ref()?;
            if self.cursor >= keys.len() {
                return None;
            }
            let end = (self.cursor + self.engine.scan_batch_size).min(keys.len());
            let batch = keys[self.cursor..end].to_vec();
            self.cursor = end;
            self.load(batch).await;
        }
    }

    /// Rewind to the start of the key snapshot, or retake the snapshot if
    /// it failed.
    pub fn restart(&mut self) {
        if self.snapshot_failed {
            self.keys = None;
            self.snapshot_failed = false;
        }
        self.cursor = 0;
        self.buffer.clear();
    }

    /// Drain the scan into a map, stopping at the first error.
    pub async fn collect(mut self) -> HorizonResult<HashMap<EntityKey, Amount>> {
        let mut balances = HashMap::new();
        while let Some(item) = self.next().await {
            let (key, value) = item?;
            balances.insert(key, value);
        }
        Ok(balances)
    }

    /// Adapt the scan into a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = HorizonResult<(EntityKey, Amount)>> {
        stream::unfold(self, |mut scan| async move {
            scan.next().await.map(|item| (item, scan))
        })
    }

    async fn start(&mut self) -> HorizonResult<()> {
        // Catch-up is an optimisation; every row is re-checked on emission.
        if let Err(e) = self.engine.refresh_expired(self.now).await {
            tracing::warn!(error = %e, "Expired-row catch-up failed; scan continues");
        }
        self.keys = Some(self.engine.rows.keys().await?);
        Ok(())
    }

    async fn load(&mut self, batch: Vec<EntityKey>) {
        let rows = match self.engine.rows.get_many(&batch).await {
            Ok(rows) => rows,
            Err(e) => {
                self.buffer.push_back(Err(e));
                return;
            }
        };

        let now = self.now;
        let mut stale = Vec::new();
        for row in rows.into_iter().flatten() {
            if row.is_fresh_at(now) {
                RefreshMetrics::incr(&self.engine.metrics.fresh_hits);
                self.buffer.push_back(Ok((row.key, row.value)));
            } else {
                stale.push(row);
            }
        }

        let engine = &self.engine;
        let refreshed = join_all(stale.iter().map(|row| engine.refresh(row, now))).await;
        for (row, result) in stale.into_iter().zip(refreshed) {
            self.buffer
                .push_back(result.map(|(value, _)| (row.key, value)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheRows;
    use crate::fact_store::InMemoryFactStore;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use futures_util::StreamExt;
    use horizon_core::{Account, Expiration, HorizonError, Transaction};

    fn t(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    type Engine = LazyRefreshEngine<InMemoryCacheRows, InMemoryFactStore>;

    async fn setup(accounts: &[&str]) -> (Engine, Arc<InMemoryFactStore>) {
        let rows = Arc::new(InMemoryCacheRows::new());
        let facts = Arc::new(InMemoryFactStore::new());
        for name in accounts {
            facts.insert_account(Account::new(*name, t(0))).unwrap();
            rows.create_row(&EntityKey::new(*name), 0, Expiration::PosInfinity)
                .await
                .unwrap();
        }
        let engine = LazyRefreshEngine::new(rows, Arc::clone(&facts), &HorizonConfig::default());
        (engine, facts)
    }

    #[tokio::test]
    async fn test_recompute_boundary_semantics() {
        let facts = InMemoryFactStore::new();
        facts.insert_account(Account::new("a", t(0))).unwrap();
        facts.insert_transaction(Transaction::new("a", 50, t(10))).unwrap();
        facts.insert_transaction(Transaction::new("a", 7, t(20))).unwrap();

        let at_boundary = recompute(&facts, &EntityKey::new("a"), t(10)).await.unwrap();
        assert_eq!(at_boundary.value, 50);
        assert_eq!(at_boundary.expiration, Expiration::At(t(20)));
        assert_eq!(at_boundary.computed_at, t(10));
    }

    #[tokio::test]
    async fn test_fresh_rows_are_served_without_recompute() {
        let (engine, _facts) = setup(&["a"]).await;
        let balances = engine.read_fresh(&[EntityKey::new("a")], t(0)).await.unwrap();
        assert_eq!(balances[&EntityKey::new("a")], 0);
        assert_eq!(engine.metrics().recomputes, 0);
        assert_eq!(engine.metrics().fresh_hits, 1);
    }

    #[tokio::test]
    async fn test_stale_row_is_recomputed_and_committed() {
        let (engine, facts) = setup(&["a"]).await;
        let key = EntityKey::new("a");
        facts.insert_transaction(Transaction::new("a", 100, t(5))).unwrap();
        engine
            .rows()
            .set_expiration(&key, horizon_core::ExpirationUpdate::Tighten(t(5)))
            .await
            .unwrap();

        assert_eq!(engine.read_one(&key, t(4)).await.unwrap(), 0);
        assert_eq!(engine.read_one(&key, t(5)).await.unwrap(), 100);

        let row = engine.rows().get(&key).await.unwrap();
        assert_eq!(row.value, 100);
        assert_eq!(row.expiration, Expiration::PosInfinity);
        assert_eq!(engine.metrics().recomputes, 1);
    }

    #[tokio::test]
    async fn test_duplicate_keys_read_once() {
        let (engine, _facts) = setup(&["a"]).await;
        let key = EntityKey::new("a");
        let balances = engine
            .read_fresh(&[key.clone(), key.clone()], t(0))
            .await
            .unwrap();
        assert_eq!(balances.len(), 1);
        assert_eq!(engine.metrics().fresh_hits, 1);
    }

    #[tokio::test]
    async fn test_unknown_key_is_not_found() {
        let (engine, _facts) = setup(&["a"]).await;
        let err = engine
            .read_fresh(&[EntityKey::new("a"), EntityKey::new("zz")], t(0))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
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
            Err(StorageError::Unavailable {
                reason: "down".to_string(),
            }
            .into())
        }

        async fn entity_exists(&self, _: &EntityKey) -> HorizonResult<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_recompute_failure_leaves_row_unchanged() {
        let rows = Arc::new(InMemoryCacheRows::new());
        let key = EntityKey::new("a");
        rows.create_row(&key, 5, Expiration::NegInfinity).await.unwrap();
        let engine = LazyRefreshEngine::new(
            Arc::clone(&rows),
            Arc::new(DownStore),
            &HorizonConfig::default(),
        );

        let err = engine.read_one(&key, t(0)).await.unwrap_err();
        assert!(matches!(
            err,
            HorizonError::Refresh(RefreshError::RecomputeFailed { .. })
        ));
        let row = rows.get(&key).await.unwrap();
        assert_eq!(row, CacheRow::new(key, 5, Expiration::NegInfinity));
        assert_eq!(engine.metrics().recompute_failures, 1);
    }

    #[tokio::test]
    async fn test_earlier_read_is_not_served_from_newer_row() {
        let (engine, facts) = setup(&["a"]).await;
        let key = EntityKey::new("a");
        facts.insert_transaction(Transaction::new("a", 100, t(3600))).unwrap();
        engine
            .rows()
            .set_expiration(&key, horizon_core::ExpirationUpdate::Tighten(t(3600)))
            .await
            .unwrap();

        assert_eq!(engine.read_one(&key, t(7200)).await.unwrap(), 100);
        assert_eq!(engine.read_one(&key, t(0)).await.unwrap(), 0);
        let balances = engine.read_fresh(&[key.clone()], t(0)).await.unwrap();
        assert_eq!(balances[&key], 0);

        // The row computed for the later instant stays in place.
        let row = engine.rows().get(&key).await.unwrap();
        assert_eq!(row.value, 100);
        assert_eq!(row.computed_at, Some(t(7200)));
        assert_eq!(engine.read_one(&key, t(7200)).await.unwrap(), 100);

        let metrics = engine.metrics();
        assert_eq!(metrics.recomputes, 3);
        assert_eq!(metrics.historical_reads, 2);
        assert_eq!(metrics.fresh_hits, 1);
    }

    #[tokio::test]
    async fn test_refresh_expired_commits_due_rows() {
        let (engine, facts) = setup(&["a", "b", "c"]).await;
        facts.insert_transaction(Transaction::new("a", 10, t(1))).unwrap();
        facts.insert_transaction(Transaction::new("b", 20, t(1))).unwrap();
        for name in ["a", "b"] {
            engine
                .rows()
                .set_expiration(&EntityKey::new(name), horizon_core::ExpirationUpdate::Invalidate)
                .await
                .unwrap();
        }

        assert_eq!(engine.refresh_expired(t(2)).await.unwrap(), 2);
        assert!(engine.rows().list_expired(t(2)).await.unwrap().is_empty());
        assert_eq!(engine.refresh_expired(t(2)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_full_scan_yields_every_row() {
        let (engine, facts) = setup(&["a", "b", "c"]).await;
        facts.insert_transaction(Transaction::new("b", 3, t(0))).unwrap();
        engine
            .rows()
            .set_expiration(&EntityKey::new("b"), horizon_core::ExpirationUpdate::Invalidate)
            .await
            .unwrap();

        let balances = engine.read_all_fresh(t(1)).collect().await.unwrap();
        assert_eq!(balances.len(), 3);
        assert_eq!(balances[&EntityKey::new("b")], 3);
    }

    #[tokio::test]
    async fn test_scan_restart_and_stream() {
        let rows = Arc::new(InMemoryCacheRows::new());
        let facts = Arc::new(InMemoryFactStore::new());
        for i in 0..5 {
            let name = format!("acct-{i}");
            facts.insert_account(Account::new(name.as_str(), t(0))).unwrap();
            rows.create_row(&EntityKey::new(name), 0, Expiration::PosInfinity)
                .await
                .unwrap();
        }
        let config = HorizonConfig::default().with_scan_batch_size(2);
        let engine = LazyRefreshEngine::new(rows, facts, &config);

        let mut scan = engine.read_all_fresh(t(0));
        assert!(scan.next().await.is_some());
        assert!(scan.next().await.is_some());
        scan.restart();
        let mut count = 0;
        while let Some(item) = scan.next().await {
            item.unwrap();
            count += 1;
        }
        assert_eq!(count, 5);

        let streamed: Vec<_> = engine.read_all_fresh(t(0)).into_stream().collect().await;
        assert_eq!(streamed.len(), 5);
    }

    /// Row repository whose key listing can be switched off.
    struct KeylessRows {
        inner: InMemoryCacheRows,
        keys_available: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl CacheRowRepository for KeylessRows {
        async fn get(&self, key: &EntityKey) -> HorizonResult<CacheRow> {
            self.inner.get(key).await
        }

        async fn create_row(
            &self,
            key: &EntityKey,
            value: Amount,
            expiration: Expiration,
        ) -> HorizonResult<bool> {
            self.inner.create_row(key, value, expiration).await
        }

        async fn delete_row(&self, key: &EntityKey) -> HorizonResult<bool> {
            self.inner.delete_row(key).await
        }

        async fn list_expired(&self, as_of: Timestamp) -> HorizonResult<Vec<EntityKey>> {
            self.inner.list_expired(as_of).await
        }

        async fn set_expiration(
            &self,
            key: &EntityKey,
            update: horizon_core::ExpirationUpdate,
        ) -> HorizonResult<Option<Expiration>> {
            self.inner.set_expiration(key, update).await
        }

        async fn commit_refresh(
            &self,
            key: &EntityKey,
            refresh: Refresh,
            observed_version: u64,
        ) -> HorizonResult<CommitOutcome> {
            self.inner.commit_refresh(key, refresh, observed_version).await
        }

        async fn keys(&self) -> HorizonResult<Vec<EntityKey>> {
            if self.keys_available.load(std::sync::atomic::Ordering::SeqCst) {
                self.inner.keys().await
            } else {
                Err(StorageError::Unavailable {
                    reason: "key listing down".to_string(),
                }
                .into())
            }
        }

        async fn stats(&self) -> HorizonResult<crate::cache::CacheStats> {
            self.inner.stats().await
        }
    }

    #[tokio::test]
    async fn test_restart_retakes_failed_snapshot() {
        let rows = Arc::new(KeylessRows {
            inner: InMemoryCacheRows::new(),
            keys_available: std::sync::atomic::AtomicBool::new(false),
        });
        let facts = Arc::new(InMemoryFactStore::new());
        for name in ["a", "b"] {
            facts.insert_account(Account::new(name, t(0))).unwrap();
            rows.create_row(&EntityKey::new(name), 0, Expiration::PosInfinity)
                .await
                .unwrap();
        }
        let engine = LazyRefreshEngine::new(Arc::clone(&rows), facts, &HorizonConfig::default());

        let mut scan = engine.read_all_fresh(t(0));
        assert!(scan.next().await.unwrap().is_err());
        assert!(scan.next().await.is_none());

        rows.keys_available
            .store(true, std::sync::atomic::Ordering::SeqCst);
        scan.restart();
        let mut seen = 0;
        while let Some(item) = scan.next().await {
            item.unwrap();
            seen += 1;
        }
        assert_eq!(seen, 2);
    }

    #[tokio::test]
    async fn test_scan_skips_rows_deleted_after_snapshot() {
        let (engine, _facts) = setup(&["a", "b"]).await;

        let mut scan = engine.read_all_fresh(t(0) + Duration::days(1));
        let first = scan.next().await.unwrap().unwrap();
        let other = if first.0 == EntityKey::new("a") { "b" } else { "a" };
        // Both rows were buffered in one batch, so delete and restart to
        // force a reload.
        engine.rows().delete_row(&EntityKey::new(other)).await.unwrap();
        scan.restart();

        let mut seen = Vec::new();
        while let Some(item) = scan.next().await {
            seen.push(item.unwrap().0);
        }
        assert_eq!(seen, vec![first.0]);
    }
}
