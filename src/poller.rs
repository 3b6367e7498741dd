//! Pipeline supervisor.
//!
//! Wires the stream session, the two periodic tasks, and the shared
//! credential manager together, then supervises them until shutdown or a
//! fatal error. The only fatal condition is credential-renewal exhaustion;
//! everything else is absorbed by the component retry policies.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::credentials::{CredentialManager, CredentialProvider};
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use crate::session::{SessionEvent, SessionHandle, StreamSession};
use crate::sink::{JsonlSink, Sink};
use crate::stats::PollerStats;

// ============================================================================
// Constants
// ============================================================================

/// Cadence of the periodic stats snapshot in the log.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Poller
// ============================================================================

/// The assembled pipeline.
pub struct Poller {
    config: Arc<Config>,
    credentials: Arc<CredentialManager>,
    scheduler: Arc<Scheduler>,
    stats: Arc<PollerStats>,
}

impl Poller {
    /// Assembles the pipeline with the production JSONL sink.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on invalid configuration and [`Error::Io`]
    /// if the output directory cannot be created.
    pub fn new(config: Config, provider: Arc<dyn CredentialProvider>) -> Result<Self> {
        config.validate()?;
        let sink: Arc<dyn Sink> = Arc::new(JsonlSink::new(&config.output_dir)?);
        Self::with_sink(config, provider, sink)
    }

    /// Assembles the pipeline with an injected sink.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on invalid configuration.
    pub fn with_sink(
        config: Config,
        provider: Arc<dyn CredentialProvider>,
        sink: Arc<dyn Sink>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let credentials = Arc::new(CredentialManager::new(provider, &config));
        let stats = Arc::new(PollerStats::new());
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&config),
            Arc::clone(&credentials),
            sink,
            Arc::clone(&stats),
        )?);

        Ok(Self {
            config,
            credentials,
            scheduler,
            stats,
        })
    }

    /// Shared pipeline counters.
    #[inline]
    #[must_use]
    pub fn stats(&self) -> Arc<PollerStats> {
        Arc::clone(&self.stats)
    }

    /// Runs the pipeline until the shutdown signal flips or a fatal error
    /// surfaces.
    ///
    /// On either exit path every task is stopped, a final position flush
    /// happens, and a last stats snapshot is logged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChallengeFailed`] when credential renewal exhausts
    /// its attempts; no other error escapes the component retry policies.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<SessionHandle> {
        info!(
            base_url = %self.config.base_url,
            flush_s = self.config.flush_interval.as_secs(),
            poll_s = self.config.poll_interval.as_secs(),
            "starting poller"
        );

        // Internal stop flag: flipped by external shutdown or a fatal error,
        // observed by every task.
        let (stop_tx, stop_rx) = watch::channel(false);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<Error>(2);

        let session = StreamSession::new(
            Arc::clone(&self.config),
            Arc::clone(&self.credentials),
            self.scheduler.dispatcher(),
            event_tx,
            Arc::clone(&self.stats),
            stop_rx.clone(),
        )?;
        let handle = session.handle();

        let session_task = tokio::spawn({
            let fatal_tx = fatal_tx.clone();
            async move {
                if let Err(e) = session.run().await {
                    error!(error = %e, "stream session failed");
                    let _ = fatal_tx.send(e).await;
                }
            }
        });

        let position_task = tokio::spawn(
            Arc::clone(&self.scheduler).run_position_task(stop_rx.clone()),
        );

        let route_task = tokio::spawn({
            let scheduler = Arc::clone(&self.scheduler);
            let stop_rx = stop_rx.clone();
            async move {
                if let Err(e) = scheduler.run_route_task(stop_rx).await {
                    error!(error = %e, "route poll task failed");
                    let _ = fatal_tx.send(e).await;
                }
            }
        });

        let mut stats_ticker = tokio::time::interval(STATS_INTERVAL);
        stats_ticker.tick().await; // first tick fires immediately

        let result = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender counts as a shutdown request.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested");
                        break Ok(());
                    }
                }

                fatal = fatal_rx.recv() => {
                    break Err(fatal.unwrap_or_else(|| {
                        Error::transient("supervisor channel closed unexpectedly")
                    }));
                }

                event = event_rx.recv() => {
                    match event {
                        Some(SessionEvent::Active { connection }) => {
                            debug!(connection, "session event: active");
                        }
                        Some(SessionEvent::Disconnected { reason }) => {
                            debug!(?reason, "session event: disconnected");
                        }
                        None => {}
                    }
                }

                _ = stats_ticker.tick() => self.stats.log_snapshot(),
            }
        };

        stop_tx.send_replace(true);
        let _ = tokio::join!(session_task, position_task, route_task);

        self.stats.log_snapshot();
        info!("poller stopped");

        result.map(|()| handle)
    }
}

// ============================================================================
// Tests
// ============================================================================
