//! Error types for the KPT poller.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use kpt_poller::{Result, Error};
//!
//! async fn example(client: &RestClient, bundle: &CredentialBundle) -> Result<()> {
//!     let routes = client.fetch_routes(bundle).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Credentials | [`Error::ChallengeFailed`], [`Error::CredentialsExpired`] |
//! | Session | [`Error::HandshakeFailed`] |
//! | Recoverable | [`Error::Transient`] |
//! | Sink | [`Error::Sink`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Http`] |
//!
//! Only [`Error::ChallengeFailed`] is fatal to the pipeline: every other
//! variant is recovered locally by reconnect, renewal, or next-tick retry.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when poller configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Credential Errors
    // ========================================================================
    /// Credential acquisition failed after bounded retries.
    ///
    /// The only error the core treats as fatal: the surrounding process
    /// decides shutdown/alerting.
    #[error("Challenge solving failed after {attempts} attempts: {message}")]
    ChallengeFailed {
        /// Renewal attempts made before giving up.
        attempts: u32,
        /// Description of the last failure.
        message: String,
    },

    /// The active cookie/token bundle was rejected upstream.
    ///
    /// Raised on REST 403 or handshake rejection; triggers single-flight
    /// credential renewal, never a process fault.
    #[error("Credentials expired (upstream rejected the active bundle)")]
    CredentialsExpired,

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// Transport-level handshake failed.
    ///
    /// Returned when the Socket.IO polling handshake does not yield a
    /// session id. Triggers a backed-off reconnect attempt.
    #[error("Handshake failed: {message}")]
    HandshakeFailed {
        /// Description of the handshake failure.
        message: String,
    },

    // ========================================================================
    // Recoverable Errors
    // ========================================================================
    /// Network/HTTP hiccup eligible for retry at the next schedule tick.
    #[error("Transient failure: {message}")]
    Transient {
        /// Description of the transient failure.
        message: String,
    },

    // ========================================================================
    // Sink Errors
    // ========================================================================
    /// Durable sink write failed.
    #[error("Sink error: {message}")]
    Sink {
        /// Description of the sink failure.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a challenge-failed error.
    #[inline]
    pub fn challenge_failed(attempts: u32, message: impl Into<String>) -> Self {
        Self::ChallengeFailed {
            attempts,
            message: message.into(),
        }
    }

    /// Creates a handshake-failed error.
    #[inline]
    pub fn handshake_failed(message: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            message: message.into(),
        }
    }

    /// Creates a transient error.
    #[inline]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a sink error.
    #[inline]
    pub fn sink(message: impl Into<String>) -> Self {
        Self::Sink {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this error signals credential expiry.
    ///
    /// Expiry is the sole trigger for single-flight renewal.
    #[inline]
    #[must_use]
    pub fn is_credentials_expired(&self) -> bool {
        matches!(self, Self::CredentialsExpired)
    }

    /// Returns `true` if this error is fatal to the pipeline.
    ///
    /// Only renewal exhaustion is fatal; everything else is recovered
    /// locally.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ChallengeFailed { .. })
    }

    /// Returns `true` if this is a connection-level error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::HandshakeFailed { .. } | Self::WebSocket(_))
    }

    /// Returns `true` if this error may succeed on a plain retry.
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Http(_) | Self::Io(_))
    }
}

// ============================================================================
// Tests
// ============================================================================
