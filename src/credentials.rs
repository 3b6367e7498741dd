//! Credential bundles and single-flight renewal.
//!
//! The upstream sits behind a bot-detection challenge; access requires a
//! short-lived cookie/user-agent bundle produced out-of-band by a
//! challenge-solving capability. That capability is opaque here: it is the
//! [`CredentialProvider`] trait, injectable and mockable.
//!
//! [`CredentialManager`] owns the one active bundle. Renewal is
//! single-flight: concurrent triggers (route poll hitting a 403, the stream
//! session seeing a handshake rejection) coalesce into one provider call;
//! late arrivals adopt the in-flight result instead of solving again.
//! Supersession is an atomic swap: there is no window where both the old
//! and the new bundle are partially live.

// ============================================================================
// Imports
// ============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::{Mutex, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};

// ============================================================================
// CredentialBundle
// ============================================================================

/// One authorization artifact: cookie jar plus the user agent that earned it.
///
/// Immutable once issued; handed around as `Arc<CredentialBundle>`.
#[derive(Debug, Clone)]
pub struct CredentialBundle {
    /// Cookie jar extracted after the challenge solve.
    pub cookies: HashMap<String, String>,

    /// User agent the cookies are bound to.
    pub user_agent: String,

    /// When the bundle was issued.
    pub obtained_at: Instant,
}

impl CredentialBundle {
    /// Creates a bundle issued now.
    #[must_use]
    pub fn new(cookies: HashMap<String, String>, user_agent: impl Into<String>) -> Self {
        Self {
            cookies,
            user_agent: user_agent.into(),
            obtained_at: Instant::now(),
        }
    }

    /// Renders the jar as a `Cookie` header value.
    #[must_use]
    pub fn cookie_header(&self) -> String {
        let mut pairs: Vec<String> = self
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        // Stable ordering keeps headers reproducible across requests.
        pairs.sort();
        pairs.join("; ")
    }
}

// ============================================================================
// CredentialProvider
// ============================================================================

/// External challenge-solving capability.
///
/// Implementations may take tens of seconds (a browser solving a Turnstile
/// challenge); the manager wraps every call in a timeout.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Obtains a fresh credential bundle.
    ///
    /// # Errors
    ///
    /// Any error is treated as a failed attempt; the manager retries with a
    /// fixed delay up to its attempt cap.
    async fn obtain(&self) -> Result<CredentialBundle>;
}

// ============================================================================
// FileProvider
// ============================================================================

/// Shape of the credential file written by an out-of-process solver.
#[derive(Debug, Deserialize)]
struct CredentialFile {
    cookies: HashMap<String, String>,
    user_agent: String,
}

/// Provider that reads a credential file maintained by an external solver.
///
/// Bridges the browser-automation subsystem, which runs as a separate
/// process and rewrites the file whenever it solves a challenge.
#[derive(Debug, Clone)]
pub struct FileProvider {
    path: PathBuf,
}

impl FileProvider {
    /// Creates a provider reading the given JSON file.
    #[inline]
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialProvider for FileProvider {
    async fn obtain(&self) -> Result<CredentialBundle> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::transient(format!(
                "credential file {} unreadable: {e}",
                self.path.display()
            ))
        })?;

        let file: CredentialFile = serde_json::from_str(&raw)?;
        debug!(
            path = %self.path.display(),
            cookies = file.cookies.len(),
            "loaded credential file"
        );
        Ok(CredentialBundle::new(file.cookies, file.user_agent))
    }
}

// ============================================================================
// CredentialManager
// ============================================================================

/// Owner of the active bundle and the single-flight renewal procedure.
pub struct CredentialManager {
    /// The injected challenge solver.
    provider: Arc<dyn CredentialProvider>,

    /// Active bundle; swapped atomically under the lock.
    active: RwLock<Option<Arc<CredentialBundle>>>,

    /// Bumped on every successful swap; watchers reconnect on change.
    generation: AtomicU64,

    /// Publishes generation changes to the stream session.
    generation_tx: watch::Sender<u64>,

    /// Serializes renewal; also doubles as the "renewal pending" flag.
    renew_lock: Mutex<()>,

    /// Attempt cap per renewal request.
    max_attempts: u32,

    /// Fixed delay between attempts.
    retry_delay: std::time::Duration,

    /// Upper bound on one provider call.
    obtain_timeout: std::time::Duration,
}

impl CredentialManager {
    /// Creates a manager with no active bundle.
    #[must_use]
    pub fn new(provider: Arc<dyn CredentialProvider>, config: &Config) -> Self {
        let (generation_tx, _) = watch::channel(0);
        Self {
            provider,
            active: RwLock::new(None),
            generation: AtomicU64::new(0),
            generation_tx,
            renew_lock: Mutex::new(()),
            max_attempts: config.renewal_attempts,
            retry_delay: config.renewal_retry_delay,
            obtain_timeout: config.renewal_timeout,
        }
    }

    /// Returns the active bundle, if any.
    #[inline]
    #[must_use]
    pub fn active(&self) -> Option<Arc<CredentialBundle>> {
        self.active.read().clone()
    }

    /// Returns the current bundle generation.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Subscribes to generation changes.
    ///
    /// The stream session watches this to tear itself down when its bundle
    /// is superseded.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation_tx.subscribe()
    }

    /// Returns `true` while a renewal is in flight.
    ///
    /// The periodic tasks observe this flag and skip their tick instead of
    /// piling onto the renewal.
    #[inline]
    #[must_use]
    pub fn renewal_pending(&self) -> bool {
        self.renew_lock.try_lock().is_err()
    }

    /// Returns the active bundle, renewing first if none exists.
    pub async fn ensure(&self) -> Result<Arc<CredentialBundle>> {
        if let Some(bundle) = self.active() {
            return Ok(bundle);
        }
        self.renew().await
    }

    /// Runs the single-flight renewal procedure.
    ///
    /// A caller that arrives while a renewal is in flight blocks on the
    /// lock, then observes the bumped generation and adopts that result
    /// without invoking the provider again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChallengeFailed`] once the attempt cap is reached;
    /// this is the pipeline's only fatal condition.
    pub async fn renew(&self) -> Result<Arc<CredentialBundle>> {
        let observed = self.generation();
        let _guard = self.renew_lock.lock().await;

        if self.generation() != observed
            && let Some(bundle) = self.active()
        {
            debug!("renewal already completed by another caller");
            return Ok(bundle);
        }

        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            info!(attempt, max = self.max_attempts, "renewing credentials");

            match timeout(self.obtain_timeout, self.provider.obtain()).await {
                Ok(Ok(bundle)) => {
                    let bundle = Arc::new(bundle);
                    {
                        let mut active = self.active.write();
                        *active = Some(Arc::clone(&bundle));
                    }
                    let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                    self.generation_tx.send_replace(generation);

                    info!(generation, cookies = bundle.cookies.len(), "credentials renewed");
                    return Ok(bundle);
                }
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "challenge solve failed");
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(
                        attempt,
                        timeout_s = self.obtain_timeout.as_secs(),
                        "challenge solve timed out"
                    );
                    last_error = "challenge solve timed out".to_string();
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(Error::challenge_failed(self.max_attempts, last_error))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Counting fake provider returning canned bundles.
    struct FakeProvider {
        calls: AtomicU32,
        fail_first: u32,
        delay: Duration,
    }

    impl FakeProvider {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: 0,
                delay: Duration::from_millis(50),
            }
        }

        fn failing(n: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: n,
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialProvider for FakeProvider {
        async fn obtain(&self) -> Result<CredentialBundle> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;

            if call <= self.fail_first {
                return Err(Error::transient("solver crashed"));
            }

            let mut cookies = HashMap::new();
            cookies.insert("cf_clearance".to_string(), format!("token-{call}"));
            Ok(CredentialBundle::new(cookies, "Mozilla/5.0 (test)"))
        }
    }

    fn test_config() -> Config {
        let mut config = Config::new();
        config.renewal_retry_delay = Duration::from_millis(10);
        config.renewal_timeout = Duration::from_secs(5);
        config
    }

    #[test]
    fn test_cookie_header_sorted() {
        let mut cookies = HashMap::new();
        cookies.insert("b".to_string(), "2".to_string());
        cookies.insert("a".to_string(), "1".to_string());
        let bundle = CredentialBundle::new(cookies, "ua");

        assert_eq!(bundle.cookie_header(), "a=1; b=2");
    }

    #[tokio::test]
    async fn test_renew_swaps_active_bundle() {
        let provider = Arc::new(FakeProvider::new());
        let manager = CredentialManager::new(provider.clone(), &test_config());

        assert!(manager.active().is_none());
        let bundle = manager.renew().await.expect("renew");

        assert_eq!(bundle.cookies["cf_clearance"], "token-1");
        assert_eq!(manager.generation(), 1);
        assert!(manager.active().is_some());
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_concurrent_triggers() {
        let provider = Arc::new(FakeProvider::new());
        let manager = Arc::new(CredentialManager::new(provider.clone(), &test_config()));

        // One trigger from the polling path, one from the stream session.
        let a = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.renew().await }
        });
        let b = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.renew().await }
        });

        let (ra, rb) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

        assert_eq!(provider.calls(), 1);
        assert_eq!(ra.cookies["cf_clearance"], rb.cookies["cf_clearance"]);
        assert_eq!(manager.generation(), 1);
    }

    #[tokio::test]
    async fn test_renew_retries_then_succeeds() {
        let provider = Arc::new(FakeProvider::failing(2));
        let manager = CredentialManager::new(provider.clone(), &test_config());

        let bundle = manager.renew().await.expect("third attempt succeeds");
        assert_eq!(provider.calls(), 3);
        assert_eq!(bundle.cookies["cf_clearance"], "token-3");
    }

    #[tokio::test]
    async fn test_renew_exhaustion_is_fatal() {
        let provider = Arc::new(FakeProvider::failing(10));
        let manager = CredentialManager::new(provider.clone(), &test_config());

        let err = manager.renew().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_ensure_renews_when_empty() {
        let provider = Arc::new(FakeProvider::new());
        let manager = CredentialManager::new(provider.clone(), &test_config());

        let _ = manager.ensure().await.expect("ensure");
        let _ = manager.ensure().await.expect("ensure again");

        // Second ensure reuses the active bundle.
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_generation_watch_signals_swap() {
        let provider = Arc::new(FakeProvider::new());
        let manager = CredentialManager::new(provider, &test_config());
        let mut rx = manager.subscribe();

        manager.renew().await.expect("renew");

        rx.changed().await.expect("generation change");
        assert_eq!(*rx.borrow(), 1);
    }
}
