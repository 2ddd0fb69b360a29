//! Background tasks: the mutation feed consumer and the expiry sweeper.
//!
//! Both run until a `watch` shutdown signal flips to `true`. The feed also
//! stops once its channel closes, which is how tests and embedders drain it.
//!
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let feed = tokio::spawn(run_mutation_feed(
//!     tracker,
//!     store.subscribe(),
//!     Arc::new(SystemClock),
//!     shutdown_rx,
//!     config.feed_log_events,
//! ));
//!
//! // Later, trigger shutdown
//! let _ = shutdown_tx.send(true);
//! let metrics = feed.await?;
//! ```

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use horizon_core::{Clock, MutationEvent};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

use crate::cache::CacheRowRepository;
use crate::fact_store::FactStore;
use crate::metrics::{FeedMetrics, FeedMetricsSnapshot};
use crate::refresh::LazyRefreshEngine;
use crate::tracker::InvalidationTracker;

/// Consume mutation events and apply them through `tracker`.
///
/// Each event is applied at `clock.now()` sampled when it is received.
/// Failures are logged and counted; the feed keeps going.
pub async fn run_mutation_feed<R, F, C>(
    tracker: InvalidationTracker<R, F>,
    mut events: mpsc::UnboundedReceiver<MutationEvent>,
    clock: Arc<C>,
    mut shutdown_rx: watch::Receiver<bool>,
    log_events: bool,
) -> FeedMetricsSnapshot
where
    R: CacheRowRepository + ?Sized,
    F: FactStore + ?Sized,
    C: Clock + ?Sized,
{
    let metrics = FeedMetrics::new();
    let mut shutdown_open = true;

    tracing::info!(policy = %tracker.policy(), "Mutation feed started");

    if *shutdown_rx.borrow() {
        tracing::info!("Mutation feed shut down before start");
        return metrics.snapshot();
    }

    loop {
        tokio::select! {
            changed = shutdown_rx.changed(), if shutdown_open => {
                match changed {
                    Ok(()) if *shutdown_rx.borrow() => {
                        tracing::info!("Mutation feed shutting down");
                        break;
                    }
                    Ok(()) => {}
                    // Nobody can signal shutdown any more; run until the
                    // channel closes.
                    Err(_) => shutdown_open = false,
                }
            }

            event = events.recv() => {
                let Some(event) = event else {
                    tracing::info!("Mutation feed channel closed");
                    break;
                };
                apply_event(&tracker, clock.as_ref(), &event, &metrics, log_events).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        events_applied = snapshot.events_applied,
        events_failed = snapshot.events_failed,
        "Mutation feed completed"
    );
    snapshot
}

async fn apply_event<R, F, C>(
    tracker: &InvalidationTracker<R, F>,
    clock: &C,
    event: &MutationEvent,
    metrics: &FeedMetrics,
    log_events: bool,
) where
    R: CacheRowRepository + ?Sized,
    F: FactStore + ?Sized,
    C: Clock + ?Sized,
{
    if log_events {
        tracing::info!(kind = event.kind(), ?event, "Mutation event received");
    } else {
        tracing::trace!(kind = event.kind(), ?event, "Mutation event received");
    }

    let now = clock.now();
    match tracker.apply(event, now).await {
        Ok(outcome) => {
            metrics.events_applied.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                kind = event.kind(),
                rows_touched = outcome.rows_touched,
                recomputed = outcome.recomputed,
                "Mutation event applied"
            );
        }
        Err(e) => {
            metrics.events_failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(kind = event.kind(), error = %e, "Failed to apply mutation event");
        }
    }
}

/// Periodically refresh rows whose expiration has passed.
///
/// Returns the total number of committed refreshes.
pub async fn run_expiry_sweeper<R, F, C>(
    engine: LazyRefreshEngine<R, F>,
    clock: Arc<C>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> usize
where
    R: CacheRowRepository + ?Sized,
    F: FactStore + ?Sized,
    C: Clock + ?Sized,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut total = 0usize;
    let mut sweeps = 0u64;

    tracing::info!(period_ms = period.as_millis() as u64, "Expiry sweeper started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Expiry sweeper shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                sweeps += 1;
                match engine.refresh_expired(clock.now()).await {
                    Ok(count) => total += count,
                    Err(e) => tracing::warn!(error = %e, "Expiry sweep failed"),
                }
            }
        }
    }

    tracing::info!(sweeps, refreshed = total, "Expiry sweeper completed");
    total
}
