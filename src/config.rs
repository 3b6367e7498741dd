//! Poller configuration.
//!
//! Static configuration supplied at startup; no runtime reconfiguration.
//! Values can be set fluently or loaded from `KPT_*` environment variables.
//!
//! # Example
//!
//! ```ignore
//! use kpt_poller::Config;
//!
//! let config = Config::new()
//!     .with_output_dir("/var/lib/kpt")
//!     .with_flush_interval(Duration::from_secs(5))
//!     .with_poll_interval(Duration::from_secs(30));
//! config.validate()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::CoordinateBounds;

// ============================================================================
// Constants
// ============================================================================

/// Default upstream base URL (handshake + WebSocket host).
const DEFAULT_BASE_URL: &str = "https://online.kpt.kyiv.ua";

/// Default route-list REST endpoint.
const DEFAULT_ROUTES_URL: &str = "https://online.kpt.kyiv.ua/api/route/list";

/// Default position flush period (P1).
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Default route poll period (P2).
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Initial reconnect delay after a lost session.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Reconnect backoff cap.
const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(300);

/// Renewal attempts before the pipeline gives up.
const DEFAULT_RENEWAL_ATTEMPTS: u32 = 3;

/// Fixed delay between renewal attempts.
const DEFAULT_RENEWAL_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Upper bound on a single challenge solve.
const DEFAULT_RENEWAL_TIMEOUT: Duration = Duration::from_secs(120);

/// HTTP request timeout (handshake and route poll).
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Config
// ============================================================================

/// Poller configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Upstream base URL hosting the Socket.IO endpoint.
    pub base_url: String,

    /// Route-list REST endpoint.
    pub routes_url: String,

    /// Output directory for sink files.
    pub output_dir: PathBuf,

    /// Position flush period (P1).
    pub flush_interval: Duration,

    /// Route poll period (P2).
    pub poll_interval: Duration,

    /// Initial reconnect delay; doubled on repeated failures.
    pub reconnect_delay: Duration,

    /// Reconnect backoff cap.
    pub max_reconnect_delay: Duration,

    /// Renewal attempts per renewal request before a fatal error.
    pub renewal_attempts: u32,

    /// Fixed delay between renewal attempts.
    pub renewal_retry_delay: Duration,

    /// Upper bound on a single challenge solve.
    pub renewal_timeout: Duration,

    /// HTTP request timeout.
    pub request_timeout: Duration,

    /// Coordinate plausibility filter; `None` disables filtering.
    pub bounds: Option<CoordinateBounds>,

    /// Persist `routes` events arriving over the WebSocket.
    ///
    /// Off by default: REST is the canonical route source.
    pub persist_ws_routes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            routes_url: DEFAULT_ROUTES_URL.to_string(),
            output_dir: PathBuf::from("./data"),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
            renewal_attempts: DEFAULT_RENEWAL_ATTEMPTS,
            renewal_retry_delay: DEFAULT_RENEWAL_RETRY_DELAY,
            renewal_timeout: DEFAULT_RENEWAL_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            bounds: Some(CoordinateBounds::default()),
            persist_ws_routes: false,
        }
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl Config {
    /// Creates a configuration with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from `KPT_*` environment variables.
    ///
    /// Unset variables keep their defaults. Recognized keys:
    /// `KPT_BASE_URL`, `KPT_ROUTES_URL`, `KPT_OUTPUT_DIR`,
    /// `KPT_FLUSH_INTERVAL`, `KPT_POLL_INTERVAL` (seconds),
    /// `KPT_PERSIST_WS_ROUTES`, `KPT_DISABLE_BOUNDS`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("KPT_BASE_URL") {
            config.base_url = url;
        }
        if let Ok(url) = std::env::var("KPT_ROUTES_URL") {
            config.routes_url = url;
        }
        if let Ok(dir) = std::env::var("KPT_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_u64("KPT_FLUSH_INTERVAL") {
            config.flush_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("KPT_POLL_INTERVAL") {
            config.poll_interval = Duration::from_secs(secs);
        }
        if env_bool("KPT_PERSIST_WS_ROUTES") {
            config.persist_ws_routes = true;
        }
        if env_bool("KPT_DISABLE_BOUNDS") {
            config.bounds = None;
        }

        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

// ============================================================================
// Builder Methods
// ============================================================================

impl Config {
    /// Sets the upstream base URL.
    #[inline]
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Sets the route-list REST endpoint.
    #[inline]
    #[must_use]
    pub fn with_routes_url(mut self, url: impl Into<String>) -> Self {
        self.routes_url = url.into();
        self
    }

    /// Sets the output directory.
    #[inline]
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Sets the position flush period (P1).
    #[inline]
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the route poll period (P2).
    #[inline]
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the renewal attempt cap.
    #[inline]
    #[must_use]
    pub fn with_renewal_attempts(mut self, attempts: u32) -> Self {
        self.renewal_attempts = attempts;
        self
    }

    /// Sets the coordinate bounds filter; `None` disables it.
    #[inline]
    #[must_use]
    pub fn with_bounds(mut self, bounds: Option<CoordinateBounds>) -> Self {
        self.bounds = bounds;
        self
    }

    /// Enables persisting WebSocket `routes` events.
    #[inline]
    #[must_use]
    pub fn with_persist_ws_routes(mut self) -> Self {
        self.persist_ws_routes = true;
        self
    }
}

// ============================================================================
// Validation & Derived Endpoints
// ============================================================================

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on empty URLs, zero periods, or a zero
    /// renewal attempt cap.
    pub fn validate(&self) -> Result<()> {
        let base = url::Url::parse(&self.base_url)
            .map_err(|e| Error::config(format!("invalid base_url {:?}: {e}", self.base_url)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(Error::config(format!(
                "base_url must be an http(s) URL, got: {}",
                self.base_url
            )));
        }
        if self.routes_url.is_empty() {
            return Err(Error::config("routes_url must not be empty"));
        }
        if self.flush_interval.is_zero() || self.poll_interval.is_zero() {
            return Err(Error::config("flush and poll intervals must be non-zero"));
        }
        if self.renewal_attempts == 0 {
            return Err(Error::config("renewal_attempts must be at least 1"));
        }
        Ok(())
    }

    /// Returns the Socket.IO polling handshake URL.
    #[must_use]
    pub fn handshake_url(&self) -> String {
        format!(
            "{}/socket.io/?EIO=3&transport=polling",
            self.base_url.trim_end_matches('/')
        )
    }

    /// Returns the WebSocket URL for an established session id.
    #[must_use]
    pub fn websocket_url(&self, sid: &str) -> String {
        let host = self
            .base_url
            .trim_end_matches('/')
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        format!("wss://{host}/socket.io/?EIO=3&transport=websocket&sid={sid}")
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert!(!config.persist_ws_routes);
        assert!(config.bounds.is_some());
    }

    #[test]
    fn test_builder_chain() {
        let config = Config::new()
            .with_base_url("https://example.com")
            .with_output_dir("/tmp/kpt")
            .with_flush_interval(Duration::from_secs(2))
            .with_persist_ws_routes();

        assert_eq!(config.base_url, "https://example.com");
        assert_eq!(config.output_dir, PathBuf::from("/tmp/kpt"));
        assert_eq!(config.flush_interval, Duration::from_secs(2));
        assert!(config.persist_ws_routes);
    }

    #[test]
    fn test_validate_rejects_bad_base_url() {
        // Unparseable and non-http(s) URLs both map to Error::Config.
        let err = Config::new().with_base_url("not-a-url").validate().unwrap_err();
        assert!(matches!(err, Error::Config { .. }));

        let err = Config::new().with_base_url("ftp://host").validate().unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = Config::new().with_flush_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_renewal_attempts() {
        let config = Config::new().with_renewal_attempts(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_handshake_url() {
        let config = Config::new().with_base_url("https://example.com/");
        assert_eq!(
            config.handshake_url(),
            "https://example.com/socket.io/?EIO=3&transport=polling"
        );
    }

    #[test]
    fn test_websocket_url() {
        let config = Config::new().with_base_url("https://example.com");
        assert_eq!(
            config.websocket_url("abc123"),
            "wss://example.com/socket.io/?EIO=3&transport=websocket&sid=abc123"
        );
    }
}
