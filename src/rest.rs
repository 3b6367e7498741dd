//! Authenticated route polling.
//!
//! A single GET against the route-list endpoint, carrying the active
//! bundle's cookie jar and user agent. Outcomes are classified rather than
//! bubbled raw:
//!
//! - 200 + valid JSON → the route payload;
//! - 403, or a body that looks like a bot-challenge interstitial →
//!   [`Error::CredentialsExpired`], the sole renewal trigger on this path;
//! - anything else (5xx, network fault, JSON parse failure) →
//!   [`Error::Transient`], retried at the next scheduled tick only.

// ============================================================================
// Imports
// ============================================================================

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::header::{COOKIE, USER_AGENT};
use serde_json::Value;
use tracing::{debug, warn};

use crate::credentials::CredentialBundle;
use crate::error::{Error, Result};

// ============================================================================
// RouteFetcher
// ============================================================================

/// Route-list fetch capability.
///
/// Object-safe so the scheduler can be driven by a fake in tests, the same
/// seam shape as [`crate::sink::Sink`].
#[async_trait]
pub trait RouteFetcher: Send + Sync {
    /// Fetches the route list with the given credentials.
    ///
    /// # Errors
    ///
    /// - [`Error::CredentialsExpired`] on 403 or a challenge interstitial
    /// - [`Error::Transient`] on any other failure
    async fn fetch_routes(&self, bundle: &CredentialBundle) -> Result<Value>;
}

// ============================================================================
// Challenge Detection
// ============================================================================

/// Markers of a bot-challenge interstitial served in place of data.
fn challenge_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| {
        Regex::new(r"(?i)just a moment|challenge-platform|cf-browser-verification|turnstile")
            .expect("static pattern compiles")
    })
}

/// Returns `true` if the body is a challenge page rather than data.
#[inline]
#[must_use]
pub fn is_challenge_body(body: &str) -> bool {
    challenge_marker().is_match(body)
}

// ============================================================================
// Classification
// ============================================================================

/// Classifies a route-poll response into the error taxonomy.
///
/// Pure so the classification table is testable without a server.
pub fn classify_response(status: StatusCode, body: &str) -> Result<Value> {
    if status == StatusCode::FORBIDDEN {
        return Err(Error::CredentialsExpired);
    }

    if is_challenge_body(body) {
        // Some gateways serve the interstitial with a 200 or 503.
        return Err(Error::CredentialsExpired);
    }

    if status != StatusCode::OK {
        return Err(Error::transient(format!("HTTP {status} from route poll")));
    }

    serde_json::from_str(body)
        .map_err(|e| Error::transient(format!("invalid JSON in route response: {e}")))
}

// ============================================================================
// RestClient
// ============================================================================

/// Client for the route-list endpoint.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    routes_url: String,
}

impl RestClient {
    /// Creates a client for the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the underlying client cannot be built.
    pub fn new(routes_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            http,
            routes_url: routes_url.into(),
        })
    }
}

#[async_trait]
impl RouteFetcher for RestClient {
    async fn fetch_routes(&self, bundle: &CredentialBundle) -> Result<Value> {
        debug!(url = %self.routes_url, "polling routes");

        let response = self
            .http
            .get(&self.routes_url)
            .header(COOKIE, bundle.cookie_header())
            .header(USER_AGENT, &bundle.user_agent)
            .send()
            .await
            .map_err(|e| Error::transient(format!("route poll failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::transient(format!("route body unreadable: {e}")))?;

        let routes = classify_response(status, &body)?;

        if let Some(count) = routes.as_array().map(Vec::len) {
            debug!(count, "routes fetched");
        } else {
            warn!("route payload is not an array");
        }

        Ok(routes)
    }
}

// ============================================================================
// Tests
// ============================================================================
