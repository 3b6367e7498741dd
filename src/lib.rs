//! # kpt-poller
//!
//! Continuous collector for the Kyivpastrans real-time feed: vehicle
//! positions pushed over a Socket.IO-style WebSocket, route metadata polled
//! over REST, both persisted as daily-rotated line-delimited JSON.
//!
//! The upstream sits behind a bot-detection challenge, so every request
//! carries a short-lived cookie/user-agent bundle obtained out-of-band; the
//! pipeline renews it on rejection and keeps collecting across renewals,
//! disconnects, and transient faults without losing buffered data.
//!
//! ## Architecture
//!
//! | Component | Module | Role |
//! |-----------|--------|------|
//! | Stream session | [`session`] | Transport handshake, WebSocket upgrade, heartbeat, reconnect |
//! | Frame codec | [`protocol`] | Digit-prefixed text frames to typed values, pure |
//! | Positions | [`protocol`] | CSV/JSON position records, bounds filter |
//! | Credentials | [`credentials`] | Active bundle, single-flight renewal |
//! | Route poll | [`rest`] | Authenticated GET, outcome classification |
//! | Scheduler | [`scheduler`] | Latest-wins batching, dedup, periodic tasks |
//! | Sink | [`sink`] | Daily-rotated JSONL streams |
//! | Supervisor | [`poller`] | Task wiring, shutdown, fatal-error routing |
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use kpt_poller::{Config, FileProvider, Poller};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> kpt_poller::Result<()> {
//!     let config = Config::from_env();
//!     let provider = Arc::new(FileProvider::new("credentials.json"));
//!     let poller = Poller::new(config, provider)?;
//!
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     poller.run(shutdown_rx).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Failure model
//!
//! Every fault is classified and most are absorbed locally: decode errors
//! drop the frame, transient poll failures wait for the next tick, lost
//! connections reconnect with capped backoff, credential rejection routes
//! through single-flight renewal. The single fatal condition is
//! [`Error::ChallengeFailed`]: renewal exhausted its attempt cap, and
//! continuing would hammer a gate that will not open.

pub mod config;
pub mod credentials;
pub mod error;
pub mod poller;
pub mod protocol;
pub mod rest;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod stats;

pub use config::Config;
pub use credentials::{CredentialBundle, CredentialManager, CredentialProvider, FileProvider};
pub use error::{Error, Result};
pub use poller::Poller;
pub use protocol::{CoordinateBounds, SocketFrame, VehiclePosition};
pub use scheduler::Scheduler;
pub use session::{SessionEvent, SessionHandle, SessionStatus, StreamSession};
pub use sink::{JsonlSink, Sink, StreamName};
pub use stats::PollerStats;
