//! Stream session: one physical connection and its reconnect policy.
//!
//! [`StreamSession::run`] owns the whole lifecycle: transport handshake
//! (HTTP GET carrying the active bundle's cookies), WebSocket upgrade with
//! probe sequencing, the frame receive loop, heartbeat replies, staleness
//! detection, and reconnection with capped exponential backoff.
//!
//! The receive loop never blocks on slow work: decoded data events are
//! handed to the scheduler through a dispatch callback, and heartbeat
//! replies are written inline. Handshake rejection with a 403 (or a
//! challenge interstitial) is classified as credential expiry and routed
//! through the shared single-flight renewal.
//!
//! External observers read state through [`SessionHandle`] snapshots; the
//! machine itself is owned exclusively by the session task.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{COOKIE, ORIGIN, USER_AGENT};
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::credentials::{CredentialBundle, CredentialManager};
use crate::error::{Error, Result};
use crate::protocol::{FRAME_PROBE, HandshakeInfo, SocketFrame, parse_handshake};
use crate::rest::is_challenge_body;
use crate::stats::PollerStats;

use super::machine::{Action, DisconnectReason, SessionMachine, SessionStatus};

// ============================================================================
// Types
// ============================================================================

/// Callback receiving decoded data events, keyed by event name.
pub type Dispatcher = Arc<dyn Fn(&str, Value) + Send + Sync>;

/// Externally observable session transitions.
///
/// Active entry and Disconnected entry are the only events other
/// components act on (the scheduler uses them to know whether position
/// flushing is currently possible).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session reached Active.
    Active {
        /// Connection ordinal since process start.
        connection: u64,
    },
    /// The session dropped to Disconnected.
    Disconnected {
        /// Why the connection ended.
        reason: DisconnectReason,
    },
}

// ============================================================================
// SessionHandle
// ============================================================================

/// Snapshot view of session state for other components.
#[derive(Clone)]
pub struct SessionHandle {
    status: Arc<Mutex<SessionStatus>>,
    connection_count: Arc<AtomicU64>,
}

impl SessionHandle {
    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    /// Connections established since process start.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Returns `true` while the stream is established.
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.status(), SessionStatus::Active | SessionStatus::Stale)
    }
}

// ============================================================================
// Handshake Classification
// ============================================================================

/// Classifies the polling handshake response.
///
/// Pure so rejection handling is testable without a server.
pub(crate) fn classify_handshake(status: StatusCode, body: &str) -> Result<HandshakeInfo> {
    if status == StatusCode::FORBIDDEN || is_challenge_body(body) {
        return Err(Error::CredentialsExpired);
    }
    if !status.is_success() {
        return Err(Error::handshake_failed(format!("HTTP {status}")));
    }
    parse_handshake(body)
}

// ============================================================================
// StreamSession
// ============================================================================

/// Owner of the physical connection and its recovery policy.
pub struct StreamSession {
    config: Arc<Config>,
    http: reqwest::Client,
    credentials: Arc<CredentialManager>,
    dispatcher: Dispatcher,
    events: mpsc::UnboundedSender<SessionEvent>,
    stats: Arc<PollerStats>,
    shutdown: watch::Receiver<bool>,
    status: Arc<Mutex<SessionStatus>>,
    connection_count: Arc<AtomicU64>,
}

impl StreamSession {
    /// Creates a session; [`run`](Self::run) starts it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP client cannot be built.
    pub fn new(
        config: Arc<Config>,
        credentials: Arc<CredentialManager>,
        dispatcher: Dispatcher,
        events: mpsc::UnboundedSender<SessionEvent>,
        stats: Arc<PollerStats>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            config,
            http,
            credentials,
            dispatcher,
            events,
            stats,
            shutdown,
            status: Arc::new(Mutex::new(SessionStatus::Disconnected)),
            connection_count: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Returns a snapshot handle for external observers.
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            status: Arc::clone(&self.status),
            connection_count: Arc::clone(&self.connection_count),
        }
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.lock() = status;
    }

    /// Runs the session until shutdown or a fatal error.
    ///
    /// Transport failures reconnect with capped exponential backoff;
    /// credential rejection routes through single-flight renewal. Only
    /// renewal exhaustion ([`Error::ChallengeFailed`]) escapes.
    pub async fn run(mut self) -> Result<()> {
        let mut delay = self.config.reconnect_delay;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            // Shutdown must interrupt a renewal that is still solving.
            let bundle = tokio::select! {
                bundle = self.credentials.ensure() => bundle?,
                _ = self.shutdown.changed() => continue,
            };

            let connections_before = self.connection_count.load(Ordering::Relaxed);

            match self.connect_once(&bundle).await {
                Ok(DisconnectReason::Shutdown) => break,

                Ok(reason) => {
                    self.set_status(SessionStatus::Disconnected);
                    let reached_active = self.connection_count.load(Ordering::Relaxed)
                        > connections_before;
                    let _ = self.events.send(SessionEvent::Disconnected { reason });
                    PollerStats::bump(&self.stats.reconnects);

                    if reason == DisconnectReason::CredentialsRotated {
                        // Fresh bundle is already active; reconnect now.
                        delay = self.config.reconnect_delay;
                        continue;
                    }

                    // A session that made it to Active earns a fresh base
                    // delay; one that died mid-handshake keeps backing off.
                    if reached_active {
                        delay = self.config.reconnect_delay;
                    }
                    info!(?reason, delay_s = delay.as_secs(), "session lost, reconnecting");
                    self.sleep_unless_shutdown(delay).await;
                    delay = next_backoff(delay, reached_active, &self.config);
                }

                Err(e) if e.is_credentials_expired() => {
                    self.set_status(SessionStatus::Disconnected);
                    warn!("handshake rejected, renewing credentials");
                    tokio::select! {
                        renewed = self.credentials.renew() => { renewed?; }
                        _ = self.shutdown.changed() => {}
                    }
                }

                Err(e) if e.is_fatal() => return Err(e),

                Err(e) => {
                    self.set_status(SessionStatus::Disconnected);
                    PollerStats::bump(&self.stats.reconnects);
                    warn!(error = %e, delay_s = delay.as_secs(), "session setup failed");
                    self.sleep_unless_shutdown(delay).await;
                    delay = next_backoff(delay, false, &self.config);
                }
            }
        }

        self.set_status(SessionStatus::Disconnected);
        info!("stream session stopped");
        Ok(())
    }

    async fn sleep_unless_shutdown(&mut self, delay: std::time::Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    /// Establishes one connection and drives it until it ends.
    async fn connect_once(&mut self, bundle: &CredentialBundle) -> Result<DisconnectReason> {
        self.set_status(SessionStatus::Handshaking);
        let info = self.handshake(bundle).await?;
        debug!(
            sid_prefix = info.sid.get(..12).unwrap_or(&info.sid),
            ping_s = info.ping_interval.as_secs(),
            "handshake complete"
        );

        let mut request = self
            .config
            .websocket_url(&info.sid)
            .into_client_request()
            .map_err(|e| Error::handshake_failed(format!("bad websocket url: {e}")))?;
        let headers = request.headers_mut();
        headers.insert(COOKIE, header_value(&bundle.cookie_header())?);
        headers.insert(USER_AGENT, header_value(&bundle.user_agent)?);
        headers.insert(ORIGIN, header_value(&self.config.base_url)?);

        let (ws, _) = connect_async(request).await?;
        let (mut write, mut read) = ws.split();

        write.send(Message::Text(FRAME_PROBE.into())).await?;
        self.set_status(SessionStatus::ProbeSent);
        debug!("upgrade probe sent");

        let mut machine = SessionMachine::new(info.ping_interval, Instant::now());
        let mut ticker = tokio::time::interval(info.ping_interval);
        let mut generation = self.credentials.subscribe();
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reason) =
                                self.handle_text(text.as_str(), &mut machine, &mut write).await?
                            {
                                let _ = write.close().await;
                                return Ok(reason);
                            }
                        }

                        // Transport-level ping, distinct from the
                        // Socket.IO heartbeat.
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }

                        Some(Ok(Message::Close(_))) => {
                            debug!("socket closed by remote");
                            return Ok(DisconnectReason::Closed);
                        }

                        Some(Err(e)) => {
                            warn!(error = %e, "socket error");
                            return Ok(DisconnectReason::Closed);
                        }

                        None => {
                            debug!("socket stream ended");
                            return Ok(DisconnectReason::Closed);
                        }

                        _ => {}
                    }
                }

                _ = ticker.tick() => {
                    for action in machine.on_tick(Instant::now()) {
                        if let Some(reason) = self.apply(action, &mut write).await? {
                            let _ = write.close().await;
                            return Ok(reason);
                        }
                    }
                    self.set_status(machine.status());
                }

                _ = generation.changed() => {
                    info!("credentials superseded, tearing down session");
                    let _ = write.close().await;
                    return Ok(DisconnectReason::CredentialsRotated);
                }

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = write.close().await;
                        return Ok(DisconnectReason::Shutdown);
                    }
                }
            }
        }
    }

    /// Decodes one text frame and applies the machine's actions.
    async fn handle_text<W>(
        &self,
        text: &str,
        machine: &mut SessionMachine,
        write: &mut W,
    ) -> Result<Option<DisconnectReason>>
    where
        W: SinkExt<Message> + Unpin,
        W::Error: std::fmt::Display,
    {
        match SocketFrame::decode(text) {
            Ok(Some(frame)) => {
                PollerStats::bump(&self.stats.frames_decoded);
                trace!(?frame, "frame decoded");

                for action in machine.on_frame(frame, Instant::now()) {
                    if let Some(reason) = self.apply(action, write).await? {
                        return Ok(Some(reason));
                    }
                }
                self.set_status(machine.status());
            }
            Ok(None) => trace!(frame = text, "frame ignored"),
            Err(e) => {
                // A single malformed frame never terminates the
                // connection; it is dropped and counted.
                PollerStats::bump(&self.stats.decode_errors);
                warn!(error = %e, frame = preview(text), "frame dropped");
            }
        }
        Ok(None)
    }

    /// Applies one machine action to the socket/observers.
    async fn apply<W>(&self, action: Action, write: &mut W) -> Result<Option<DisconnectReason>>
    where
        W: SinkExt<Message> + Unpin,
        W::Error: std::fmt::Display,
    {
        match action {
            Action::Send(frame) => {
                write
                    .send(Message::Text(frame.into()))
                    .await
                    .map_err(|e| Error::handshake_failed(format!("send failed: {e}")))?;
            }

            Action::Dispatch { event, payload } => {
                (self.dispatcher)(&event, payload);
            }

            Action::BecameActive => {
                let connection = self.connection_count.fetch_add(1, Ordering::Relaxed) + 1;
                self.set_status(SessionStatus::Active);
                info!(connection, "stream session active");
                let _ = self.events.send(SessionEvent::Active { connection });
            }

            Action::Disconnect(reason) => return Ok(Some(reason)),
        }
        Ok(None)
    }

    /// Issues the transport handshake GET.
    async fn handshake(&self, bundle: &CredentialBundle) -> Result<HandshakeInfo> {
        let url = self.config.handshake_url();
        debug!(%url, "transport handshake");

        let response = self
            .http
            .get(&url)
            .header(reqwest::header::COOKIE, bundle.cookie_header())
            .header(reqwest::header::USER_AGENT, &bundle.user_agent)
            .send()
            .await
            .map_err(|e| Error::handshake_failed(format!("handshake request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::handshake_failed(format!("handshake body unreadable: {e}")))?;

        classify_handshake(status, &body)
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::handshake_failed(format!("invalid header value: {e}")))
}

/// Delay before the attempt after next.
///
/// Connections that reached Active restart at the base delay; anything
/// that died during setup or the probe window keeps doubling, capped.
fn next_backoff(current: Duration, reached_active: bool, config: &Config) -> Duration {
    if reached_active {
        config.reconnect_delay
    } else {
        (current * 2).min(config.max_reconnect_delay)
    }
}

/// Truncated frame excerpt for log lines.
fn preview(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(120)
        .map_or(text.len(), |(i, _)| i);
    &text[..end]
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_handshake_ok() {
        let body = r#"97:0{"sid":"abc123","pingInterval":25000,"pingTimeout":20000}"#;
        let info = classify_handshake(StatusCode::OK, body).expect("ok");
        assert_eq!(info.sid, "abc123");
    }

    #[test]
    fn test_classify_handshake_forbidden_is_expired() {
        let err = classify_handshake(StatusCode::FORBIDDEN, "").unwrap_err();
        assert!(err.is_credentials_expired());
    }

    #[test]
    fn test_classify_handshake_interstitial_is_expired() {
        let body = "<html><title>Just a moment...</title></html>";
        let err = classify_handshake(StatusCode::OK, body).unwrap_err();
        assert!(err.is_credentials_expired());
    }

    #[test]
    fn test_classify_handshake_server_error() {
        let err = classify_handshake(StatusCode::BAD_GATEWAY, "oops").unwrap_err();
        assert!(matches!(err, Error::HandshakeFailed { .. }));
    }

    #[test]
    fn test_classify_handshake_garbage_body() {
        let err = classify_handshake(StatusCode::OK, "not a handshake").unwrap_err();
        assert!(matches!(err, Error::HandshakeFailed { .. }));
    }

    #[test]
    fn test_backoff_grows_until_capped_without_active() {
        let config = Config::new();
        let mut delay = config.reconnect_delay;

        // Repeated probe-window failures: 5s, 10s, 20s, ... capped at 300s.
        for _ in 0..10 {
            delay = next_backoff(delay, false, &config);
        }
        assert_eq!(delay, config.max_reconnect_delay);
    }

    #[test]
    fn test_backoff_resets_after_active_session() {
        let config = Config::new();
        let grown = next_backoff(config.reconnect_delay * 8, false, &config);
        assert!(grown > config.reconnect_delay);

        assert_eq!(
            next_backoff(grown, true, &config),
            config.reconnect_delay
        );
    }

    #[test]
    fn test_handle_snapshot_defaults() {
        let handle = SessionHandle {
            status: Arc::new(Mutex::new(SessionStatus::Disconnected)),
            connection_count: Arc::new(AtomicU64::new(0)),
        };
        assert_eq!(handle.status(), SessionStatus::Disconnected);
        assert_eq!(handle.connection_count(), 0);
        assert!(!handle.is_active());
    }
}
