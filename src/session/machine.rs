//! Handshake and heartbeat state machine.
//!
//! Pure transition logic: decoded frames and clock ticks go in, actions
//! come out. The I/O wrapper in [`super::stream`] applies the actions to
//! the socket. Keeping the machine free of I/O makes handshake ordering
//! and staleness detection unit-testable with a fake clock.
//!
//! # States
//!
//! ```text
//! Disconnected → Handshaking → ProbeSent → UpgradeSent → Active ⇄ Stale
//!        ▲                                                  │
//!        └──────────── close / timeout / protocol ──────────┘
//! ```
//!
//! A machine instance covers exactly one connection attempt; reconnects
//! construct a fresh instance, never resurrect the old one.

// ============================================================================
// Imports
// ============================================================================

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::protocol::{FRAME_CONNECT, FRAME_PONG, FRAME_UPGRADE, SocketFrame};

// ============================================================================
// SessionStatus
// ============================================================================

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No connection.
    Disconnected,
    /// Transport handshake (HTTP) in progress.
    Handshaking,
    /// Socket open, upgrade probe sent, waiting for the acknowledgement.
    ProbeSent,
    /// Probe acknowledged, upgrade-complete frames sent.
    UpgradeSent,
    /// Fully established; data events flow.
    Active,
    /// Two heartbeat intervals without traffic.
    Stale,
}

// ============================================================================
// DisconnectReason
// ============================================================================

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Upgrade probe unacknowledged, or an out-of-order frame during it.
    ProbeTimeout,
    /// Heartbeats stopped while Active/Stale.
    HeartbeatLost,
    /// Socket closed by the remote or errored.
    Closed,
    /// The credential bundle was superseded; the session id is dead weight.
    CredentialsRotated,
    /// Orderly process shutdown.
    Shutdown,
}

// ============================================================================
// Action
// ============================================================================

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send a fixed protocol frame.
    Send(&'static str),
    /// Hand a data event to the scheduler's dispatch callback.
    Dispatch {
        /// Event name.
        event: String,
        /// Opaque payload.
        payload: Value,
    },
    /// The session just entered Active; observable externally.
    BecameActive,
    /// Tear the connection down.
    Disconnect(DisconnectReason),
}

// ============================================================================
// SessionMachine
// ============================================================================

/// Per-connection state machine.
#[derive(Debug)]
pub struct SessionMachine {
    status: SessionStatus,
    ping_interval: Duration,
    state_entered_at: Instant,
    last_message_at: Instant,
}

impl SessionMachine {
    /// Creates a machine in `ProbeSent`.
    ///
    /// The caller has already opened the socket and sent the probe frame.
    #[must_use]
    pub fn new(ping_interval: Duration, now: Instant) -> Self {
        Self {
            status: SessionStatus::ProbeSent,
            ping_interval,
            state_entered_at: now,
            last_message_at: now,
        }
    }

    /// Current state snapshot.
    #[inline]
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Time of the last inbound frame.
    #[inline]
    #[must_use]
    pub fn last_message_at(&self) -> Instant {
        self.last_message_at
    }

    fn transition(&mut self, status: SessionStatus, now: Instant) {
        self.status = status;
        self.state_entered_at = now;
    }

    /// Feeds one decoded frame through the machine.
    pub fn on_frame(&mut self, frame: SocketFrame, now: Instant) -> Vec<Action> {
        self.last_message_at = now;

        match (self.status, frame) {
            // --- handshake sequencing ---------------------------------
            (SessionStatus::ProbeSent, SocketFrame::ProbeAck) => {
                self.transition(SessionStatus::UpgradeSent, now);
                vec![Action::Send(FRAME_UPGRADE), Action::Send(FRAME_CONNECT)]
            }

            // Out-of-order traffic during the probe window never leads to
            // Active; the connection is abandoned and retried.
            (SessionStatus::ProbeSent, _) => {
                vec![Action::Disconnect(DisconnectReason::ProbeTimeout)]
            }

            (SessionStatus::UpgradeSent, SocketFrame::ConnectAck) => {
                self.transition(SessionStatus::Active, now);
                vec![Action::BecameActive]
            }

            // First well-formed data event also completes the handshake.
            (SessionStatus::UpgradeSent, SocketFrame::Message { event, payload }) => {
                self.transition(SessionStatus::Active, now);
                vec![Action::BecameActive, Action::Dispatch { event, payload }]
            }

            (SessionStatus::UpgradeSent, SocketFrame::Ping) => vec![Action::Send(FRAME_PONG)],

            (SessionStatus::UpgradeSent, _) => Vec::new(),

            // --- established ------------------------------------------
            (SessionStatus::Active | SessionStatus::Stale, frame) => {
                let recovered = self.status == SessionStatus::Stale;
                if recovered {
                    self.transition(SessionStatus::Active, now);
                }
                match frame {
                    SocketFrame::Ping => vec![Action::Send(FRAME_PONG)],
                    SocketFrame::Message { event, payload } => {
                        vec![Action::Dispatch { event, payload }]
                    }
                    _ => Vec::new(),
                }
            }

            // Disconnected/Handshaking are owned by the I/O layer; frames
            // cannot arrive there.
            (SessionStatus::Disconnected | SessionStatus::Handshaking, _) => Vec::new(),
        }
    }

    /// Advances the clock; called once per heartbeat interval.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Action> {
        match self.status {
            SessionStatus::ProbeSent | SessionStatus::UpgradeSent => {
                if now.duration_since(self.state_entered_at) > self.ping_interval {
                    self.transition(SessionStatus::Disconnected, now);
                    vec![Action::Disconnect(DisconnectReason::ProbeTimeout)]
                } else {
                    Vec::new()
                }
            }

            SessionStatus::Active => {
                if now.duration_since(self.last_message_at) > self.ping_interval * 2 {
                    self.transition(SessionStatus::Stale, now);
                }
                Vec::new()
            }

            SessionStatus::Stale => {
                if now.duration_since(self.last_message_at) > self.ping_interval * 2 {
                    self.transition(SessionStatus::Disconnected, now);
                    vec![Action::Disconnect(DisconnectReason::HeartbeatLost)]
                } else {
                    // Traffic resumed between ticks; on_frame restored Active.
                    Vec::new()
                }
            }

            SessionStatus::Disconnected | SessionStatus::Handshaking => Vec::new(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
