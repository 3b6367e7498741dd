//! Periodic persistence tasks.
//!
//! Two independent cadences drive the pipeline output:
//!
//! - **position flush**: the stream pushes a full vehicle snapshot every
//!   few seconds; the newest snapshot replaces any unflushed predecessor
//!   (latest wins), and the flush task drains the slot on its own period;
//! - **route poll**: a REST GET against the route-list endpoint, skipped
//!   while a credential renewal is in flight so the tick never piles onto
//!   the solver.
//!
//! Both tasks write through the [`Sink`] trait. Positions pass a
//! deduplication filter at flush time, keyed by `(vehicle_id, timestamp)`,
//! so an unchanged snapshot repeated across pushes is written once.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::credentials::CredentialManager;
use crate::error::Result;
use crate::protocol::{VehiclePosition, extract_positions, is_position_event};
use crate::rest::{RestClient, RouteFetcher};
use crate::sink::{Sink, StreamName};
use crate::stats::PollerStats;

// ============================================================================
// Constants
// ============================================================================

/// Event name the feed uses for route pushes over the stream.
const ROUTES_EVENT: &str = "routes";

/// How long a `(vehicle_id, timestamp)` pair stays in the dedup filter.
///
/// Position timestamps advance within a minute or two of wall clock, so
/// five minutes comfortably outlives any legitimate repeat.
const DEDUP_TTL: Duration = Duration::from_secs(300);

// ============================================================================
// DeduplicationFilter
// ============================================================================

/// Remembers recently written position samples.
///
/// A sample is identified by `(vehicle_id, timestamp)`; a stationary
/// vehicle resent with the same timestamp is a repeat, the same vehicle
/// with a newer timestamp is fresh data.
pub struct DeduplicationFilter {
    seen: FxHashMap<(u64, i64), Instant>,
    ttl: Duration,
}

impl DeduplicationFilter {
    /// Creates an empty filter with the given retention.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: FxHashMap::default(),
            ttl,
        }
    }

    /// Records a sample; returns `true` if it has not been seen recently.
    pub fn observe(&mut self, vehicle_id: u64, timestamp: i64, now: Instant) -> bool {
        self.seen.insert((vehicle_id, timestamp), now).is_none()
    }

    /// Drops entries older than the retention window.
    pub fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.seen
            .retain(|_, seen_at| now.duration_since(*seen_at) < ttl);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.len()
    }
}

// ============================================================================
// Pending State
// ============================================================================

/// One unflushed snapshot from the stream.
#[derive(Debug)]
struct PendingBatch {
    captured_at: String,
    positions: Vec<VehiclePosition>,
}

/// Shared slot between the dispatch callback and the flush task.
struct PendingState {
    batch: Option<PendingBatch>,
    ws_routes: Option<Value>,
    dedup: DeduplicationFilter,
}

// ============================================================================
// Scheduler
// ============================================================================

/// Owner of the pending slot and the two periodic tasks.
pub struct Scheduler {
    config: Arc<Config>,
    credentials: Arc<CredentialManager>,
    fetcher: Arc<dyn RouteFetcher>,
    sink: Arc<dyn Sink>,
    stats: Arc<PollerStats>,
    pending: Mutex<PendingState>,
}

impl Scheduler {
    /// Creates a scheduler writing through the given sink.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Http`] if the REST client cannot be built.
    pub fn new(
        config: Arc<Config>,
        credentials: Arc<CredentialManager>,
        sink: Arc<dyn Sink>,
        stats: Arc<PollerStats>,
    ) -> Result<Self> {
        let fetcher: Arc<dyn RouteFetcher> = Arc::new(RestClient::new(
            config.routes_url.clone(),
            config.request_timeout,
        )?);
        Ok(Self::with_fetcher(config, credentials, fetcher, sink, stats))
    }

    fn with_fetcher(
        config: Arc<Config>,
        credentials: Arc<CredentialManager>,
        fetcher: Arc<dyn RouteFetcher>,
        sink: Arc<dyn Sink>,
        stats: Arc<PollerStats>,
    ) -> Self {
        Self {
            config,
            credentials,
            fetcher,
            sink,
            stats,
            pending: Mutex::new(PendingState {
                batch: None,
                ws_routes: None,
                dedup: DeduplicationFilter::new(DEDUP_TTL),
            }),
        }
    }

    /// Returns the dispatch callback handed to the stream session.
    ///
    /// Runs on the session task, so it only parses and swaps the pending
    /// slot; all I/O happens on the flush cadence.
    #[must_use]
    pub fn dispatcher(self: &Arc<Self>) -> crate::session::Dispatcher {
        let scheduler = Arc::clone(self);
        Arc::new(move |event, payload| scheduler.handle_event(event, &payload))
    }

    /// Routes one decoded data event into the pending slot.
    fn handle_event(&self, event: &str, payload: &Value) {
        if is_position_event(event) {
            let extracted = extract_positions(payload, self.config.bounds.as_ref());
            PollerStats::add(&self.stats.positions_parsed, extracted.positions.len() as u64);
            PollerStats::add(
                &self.stats.positions_out_of_bounds,
                extracted.out_of_bounds as u64,
            );

            if extracted.out_of_bounds > 0 {
                debug!(dropped = extracted.out_of_bounds, "positions outside bounds");
            }
            if extracted.positions.is_empty() {
                return;
            }

            trace!(count = extracted.positions.len(), "snapshot staged");
            // Latest wins: an unflushed predecessor is superseded whole.
            self.pending.lock().batch = Some(PendingBatch {
                captured_at: timestamp_now(),
                positions: extracted.positions,
            });
        } else if event == ROUTES_EVENT {
            if self.config.persist_ws_routes {
                self.pending.lock().ws_routes = Some(payload.clone());
            } else {
                trace!("stream route push ignored");
            }
        } else {
            trace!(event, "unhandled event");
        }
    }

    // ------------------------------------------------------------------------
    // Position flush task
    // ------------------------------------------------------------------------

    /// Runs the position flush cadence until shutdown.
    ///
    /// Always performs one final flush on the way out so a snapshot staged
    /// just before shutdown is not lost.
    pub async fn run_position_task(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.flush_pending().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.flush_pending().await;
        info!("position flush task stopped");
    }

    /// Drains the pending slot into the sink.
    async fn flush_pending(&self) {
        let now = Instant::now();
        let (batch, ws_routes) = {
            let mut pending = self.pending.lock();
            pending.dedup.prune(now);

            let batch = pending.batch.take().map(|mut batch| {
                let dedup = &mut pending.dedup;
                let before = batch.positions.len();
                batch
                    .positions
                    .retain(|p| dedup.observe(p.vehicle_id, p.timestamp, now));
                PollerStats::add(
                    &self.stats.positions_duplicate,
                    (before - batch.positions.len()) as u64,
                );
                batch
            });
            (batch, pending.ws_routes.take())
        };

        if let Some(batch) = batch
            && !batch.positions.is_empty()
        {
            let record = json!({
                "captured_at": batch.captured_at,
                "count": batch.positions.len(),
                "positions": batch.positions,
            });

            match self.sink.append(StreamName::Positions, &record).await {
                Ok(()) => {
                    PollerStats::bump(&self.stats.flushes);
                    debug!(count = batch.positions.len(), "batch flushed");
                }
                Err(e) => warn!(error = %e, "position flush failed"),
            }
        }

        if let Some(routes) = ws_routes {
            let record = json!({
                "captured_at": timestamp_now(),
                "source": "stream",
                "routes": routes,
            });
            if let Err(e) = self.sink.append(StreamName::Routes, &record).await {
                warn!(error = %e, "stream route write failed");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Route poll task
    // ------------------------------------------------------------------------

    /// Runs the route poll cadence until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ChallengeFailed`] if a renewal triggered by
    /// an expired poll exhausts its attempts.
    pub async fn run_route_task(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        let mut poll_number = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if self.credentials.renewal_pending() {
                debug!("renewal in flight, skipping route poll");
                continue;
            }

            let bundle = tokio::select! {
                bundle = self.credentials.ensure() => bundle?,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            // A stalled poll must not pin shutdown for the request timeout.
            let outcome = tokio::select! {
                outcome = self.fetcher.fetch_routes(&bundle) => outcome,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match outcome {
                Ok(routes) => {
                    // A poll that finished after shutdown began is dropped,
                    // not written.
                    if *shutdown.borrow() {
                        break;
                    }
                    poll_number += 1;
                    PollerStats::bump(&self.stats.polls_ok);

                    let record = json!({
                        "captured_at": timestamp_now(),
                        "poll": poll_number,
                        "routes": routes,
                    });
                    if let Err(e) = self.sink.append(StreamName::Routes, &record).await {
                        warn!(error = %e, "route write failed");
                    }
                }

                Err(e) if e.is_credentials_expired() => {
                    PollerStats::bump(&self.stats.polls_failed);
                    warn!("route poll rejected, renewing credentials");
                    tokio::select! {
                        renewed = self.credentials.renew() => {
                            renewed?;
                            PollerStats::bump(&self.stats.renewals);
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }

                Err(e) => {
                    // Transient: wait for the next scheduled tick.
                    PollerStats::bump(&self.stats.polls_failed);
                    warn!(error = %e, "route poll failed");
                }
            }
        }

        info!("route poll task stopped");
        Ok(())
    }
}

fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::credentials::{CredentialBundle, CredentialProvider};
    use crate::error::Result;

    /// Sink that records appends in memory.
    #[derive(Default)]
    struct MemorySink {
        records: Mutex<Vec<(StreamName, Value)>>,
    }

    impl MemorySink {
        fn records(&self) -> Vec<(StreamName, Value)> {
            self.records.lock().clone()
        }
    }

    #[async_trait]
    impl Sink for MemorySink {
        async fn append(&self, stream: StreamName, record: &Value) -> Result<()> {
            self.records.lock().push((stream, record.clone()));
            Ok(())
        }
    }

    /// Counting provider returning canned bundles.
    #[derive(Default)]
    struct NoopProvider {
        calls: AtomicU32,
    }

    impl NoopProvider {
        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialProvider for NoopProvider {
        async fn obtain(&self) -> Result<CredentialBundle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CredentialBundle::new(HashMap::new(), "ua"))
        }
    }

    /// Fetcher whose first call is rejected as expired, then succeeds.
    #[derive(Default)]
    struct ExpireOnceFetcher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl RouteFetcher for ExpireOnceFetcher {
        async fn fetch_routes(&self, _bundle: &CredentialBundle) -> Result<Value> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(crate::error::Error::CredentialsExpired)
            } else {
                Ok(json!([{ "id": 47 }]))
            }
        }
    }

    /// Fetcher that never completes, like a stalled upstream.
    struct HangingFetcher;

    #[async_trait]
    impl RouteFetcher for HangingFetcher {
        async fn fetch_routes(&self, _bundle: &CredentialBundle) -> Result<Value> {
            std::future::pending().await
        }
    }

    fn build(config: Config) -> (Arc<Scheduler>, Arc<MemorySink>) {
        let config = Arc::new(config);
        let credentials = Arc::new(CredentialManager::new(
            Arc::new(NoopProvider::default()),
            &config,
        ));
        let sink = Arc::new(MemorySink::default());
        let stats = Arc::new(PollerStats::new());
        let scheduler = Arc::new(
            Scheduler::new(config, credentials, sink.clone(), stats).expect("scheduler"),
        );
        (scheduler, sink)
    }

    fn build_with_fetcher(
        config: Config,
        provider: Arc<NoopProvider>,
        fetcher: Arc<dyn RouteFetcher>,
    ) -> (Arc<Scheduler>, Arc<MemorySink>) {
        let config = Arc::new(config);
        let credentials = Arc::new(CredentialManager::new(provider, &config));
        let sink = Arc::new(MemorySink::default());
        let stats = Arc::new(PollerStats::new());
        let scheduler = Arc::new(Scheduler::with_fetcher(
            config,
            credentials,
            fetcher,
            sink.clone(),
            stats,
        ));
        (scheduler, sink)
    }

    fn snapshot(records: &[&str]) -> Value {
        Value::Array(records.iter().map(|r| Value::String((*r).to_string())).collect())
    }

    #[tokio::test]
    async fn test_latest_snapshot_wins() {
        let (scheduler, sink) = build(Config::new().with_bounds(None));

        scheduler.handle_event("vehicles", &snapshot(&["1,2,50.5,30.5,0,0,100"]));
        scheduler.handle_event("vehicles", &snapshot(&["1,2,50.6,30.6,0,0,200"]));
        scheduler.flush_pending().await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        let (stream, record) = &records[0];
        assert_eq!(*stream, StreamName::Positions);
        assert_eq!(record["count"], json!(1));
        assert_eq!(record["positions"][0]["timestamp"], json!(200));
    }

    #[tokio::test]
    async fn test_flush_with_empty_slot_writes_nothing() {
        let (scheduler, sink) = build(Config::new());
        scheduler.flush_pending().await;
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_snapshot_deduplicated() {
        let (scheduler, sink) = build(Config::new().with_bounds(None));
        let payload = snapshot(&["1,2,50.5,30.5,0,0,100", "3,4,50.6,30.6,0,0,100"]);

        scheduler.handle_event("vehicles", &payload);
        scheduler.flush_pending().await;
        scheduler.handle_event("vehicles", &payload);
        scheduler.flush_pending().await;

        // Second flush drops both samples as duplicates, so no record.
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_new_timestamp_passes_dedup() {
        let (scheduler, sink) = build(Config::new().with_bounds(None));

        scheduler.handle_event("vehicles", &snapshot(&["1,2,50.5,30.5,0,0,100"]));
        scheduler.flush_pending().await;
        scheduler.handle_event("vehicles", &snapshot(&["1,2,50.5,30.5,0,0,105"]));
        scheduler.flush_pending().await;

        assert_eq!(sink.records().len(), 2);
    }

    #[tokio::test]
    async fn test_ws_routes_ignored_by_default() {
        let (scheduler, sink) = build(Config::new());

        scheduler.handle_event("routes", &json!([{ "id": 1 }]));
        scheduler.flush_pending().await;

        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_ws_routes_persisted_when_enabled() {
        let (scheduler, sink) = build(Config::new().with_persist_ws_routes());

        scheduler.handle_event("routes", &json!([{ "id": 1 }]));
        scheduler.flush_pending().await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, StreamName::Routes);
        assert_eq!(records[0].1["source"], json!("stream"));
    }

    #[tokio::test]
    async fn test_bounds_filter_applies_at_dispatch() {
        // Default Kyiv bounds; second record is far away.
        let (scheduler, sink) = build(Config::new());
        let payload = snapshot(&["1,2,50.5,30.5,0,0,100", "3,4,48.0,37.0,0,0,100"]);

        scheduler.handle_event("vehicles", &payload);
        scheduler.flush_pending().await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1["count"], json!(1));
    }

    #[tokio::test]
    async fn test_route_poll_recovers_after_renewal() {
        // First poll rejected as expired; renewal fires once; the next
        // tick polls again and persists the record.
        let config = Config::new().with_poll_interval(Duration::from_millis(20));
        let provider = Arc::new(NoopProvider::default());
        let fetcher = Arc::new(ExpireOnceFetcher::default());
        let (scheduler, sink) =
            build_with_fetcher(config, Arc::clone(&provider), fetcher.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&scheduler).run_route_task(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("task exits")
            .expect("task join")
            .expect("clean stop");

        // One provider call for the initial bundle, one for the renewal.
        assert_eq!(provider.calls(), 2);
        assert!(fetcher.calls.load(Ordering::SeqCst) >= 2);

        let records = sink.records();
        assert!(!records.is_empty());
        assert!(records.iter().all(|(stream, _)| *stream == StreamName::Routes));
        assert_eq!(records[0].1["poll"], json!(1));
        assert_eq!(records[0].1["routes"], json!([{ "id": 47 }]));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_stalled_poll() {
        let config = Config::new().with_poll_interval(Duration::from_millis(10));
        let provider = Arc::new(NoopProvider::default());
        let (scheduler, sink) =
            build_with_fetcher(config, provider, Arc::new(HangingFetcher));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&scheduler).run_route_task(shutdown_rx));

        // Let the first tick start a poll that will never complete.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send_replace(true);

        // Exit must be prompt, not pinned on the in-flight request.
        tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("shutdown not pinned by stalled poll")
            .expect("task join")
            .expect("clean stop");
        assert!(sink.records().is_empty());
    }

    #[test]
    fn test_dedup_prune_expires_entries() {
        let mut filter = DeduplicationFilter::new(Duration::from_secs(300));
        let start = Instant::now();

        assert!(filter.observe(1, 100, start));
        assert!(!filter.observe(1, 100, start));
        assert_eq!(filter.len(), 1);

        filter.prune(start + Duration::from_secs(301));
        assert_eq!(filter.len(), 0);
        assert!(filter.observe(1, 100, start + Duration::from_secs(301)));
    }
}
