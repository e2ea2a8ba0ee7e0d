//! Cached access tokens with proactive refresh and single-flight acquisition.
//!
//! A [`CredentialCache`] belongs to exactly one sink. It hands out the cached
//! token until it is within [`REFRESH_MARGIN`] of expiry, then acquires a new
//! one through its [`TokenSource`]. Callers that arrive while an acquisition
//! is running wait for it and share its outcome, success or failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tokens are refreshed this long before their reported expiry.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Failure to obtain a token from the backend's token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquisitionError {
    /// Network or timeout failure talking to the token endpoint.
    #[error("token request failed: {0}")]
    Transport(String),
    /// Token endpoint answered with a non-success HTTP status.
    #[error("token endpoint returned status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Sanitized response body.
        body: String,
    },
    /// Token endpoint answered but refused to issue a token.
    #[error("token endpoint refused: code {code}: {message}")]
    Rejected {
        /// Backend error code.
        code: i64,
        /// Backend error message.
        message: String,
    },
    /// Token endpoint response did not match the expected schema.
    #[error("token response parse error: {0}")]
    Parse(String),
}

/// A freshly issued token and its lifetime as reported by the backend.
#[derive(Clone, PartialEq, Eq)]
pub struct AcquiredToken {
    /// Opaque access token.
    pub token: String,
    /// Lifetime counted from the moment of acquisition.
    pub expires_in: Duration,
}

impl std::fmt::Debug for AcquiredToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredToken")
            .field("token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Backend call that issues a new access token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Request a new token.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError`] when the backend cannot issue a token.
    async fn acquire(&self) -> Result<AcquiredToken, AcquisitionError>;
}

/// A token together with the instant it stops being usable.
#[derive(Clone)]
pub struct CachedCredential {
    token: String,
    expires_at: Instant,
}

impl std::fmt::Debug for CachedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedCredential")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl CachedCredential {
    /// The cached token value.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Reported expiry of the token.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    fn is_fresh(&self, now: Instant, margin: Duration) -> bool {
        match self.expires_at.checked_sub(margin) {
            Some(refresh_at) => now < refresh_at,
            None => false,
        }
    }
}

#[derive(Default)]
struct Slot {
    cached: Option<CachedCredential>,
    last_error: Option<AcquisitionError>,
}

/// Guarded single-token cache. See the module docs for the refresh policy.
pub struct CredentialCache {
    source: Arc<dyn TokenSource>,
    slot: Mutex<Slot>,
    // Bumped under the slot lock each time an acquisition completes.
    acquisitions: AtomicU64,
    margin: Duration,
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache")
            .field("acquisitions", &self.acquisitions.load(Ordering::Relaxed))
            .field("margin", &self.margin)
            .finish_non_exhaustive()
    }
}

impl CredentialCache {
    /// Create an empty cache using the default refresh margin.
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self::with_margin(source, REFRESH_MARGIN)
    }

    /// Create an empty cache with a custom refresh margin.
    pub fn with_margin(source: Arc<dyn TokenSource>, margin: Duration) -> Self {
        Self {
            source,
            slot: Mutex::new(Slot::default()),
            acquisitions: AtomicU64::new(0),
            margin,
        }
    }

    /// Return a token that is not within the refresh margin of expiry.
    ///
    /// Acquires a new token when the cache is empty or expiring. When another
    /// caller completes an acquisition while this one waits for the lock, its
    /// outcome is returned instead of issuing a second request.
    ///
    /// # Errors
    ///
    /// Returns the [`AcquisitionError`] of the acquisition this call waited
    /// on or performed. A previously cached token is kept on failure.
    pub async fn get_valid(&self) -> Result<String, AcquisitionError> {
        let observed = self.acquisitions.load(Ordering::Acquire);
        let mut slot = self.slot.lock().await;

        if let Some(cached) = &slot.cached {
            if cached.is_fresh(Instant::now(), self.margin) {
                return Ok(cached.token.clone());
            }
        }

        if self.acquisitions.load(Ordering::Acquire) != observed {
            if let Some(err) = &slot.last_error {
                debug!(error = %err, "sharing failed token acquisition");
                return Err(err.clone());
            }
            if let Some(cached) = &slot.cached {
                return Ok(cached.token.clone());
            }
        }

        let result = self.source.acquire().await;
        self.acquisitions.fetch_add(1, Ordering::AcqRel);

        match result {
            Ok(acquired) => {
                let now = Instant::now();
                let expires_at = now.checked_add(acquired.expires_in).unwrap_or(now);
                let wall_expiry = chrono::Duration::from_std(acquired.expires_in)
                    .ok()
                    .and_then(|d| chrono::Utc::now().checked_add_signed(d));
                info!(
                    expires_in_secs = acquired.expires_in.as_secs(),
                    expires_at = ?wall_expiry,
                    "access token acquired"
                );
                let token = acquired.token.clone();
                slot.cached = Some(CachedCredential {
                    token: acquired.token,
                    expires_at,
                });
                slot.last_error = None;
                Ok(token)
            }
            Err(err) => {
                warn!(error = %err, "access token acquisition failed");
                slot.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Drop the cached token so the next [`get_valid`](Self::get_valid) acquires.
    pub async fn invalidate(&self) {
        let mut slot = self.slot.lock().await;
        if slot.cached.take().is_some() {
            debug!("cached access token invalidated");
        }
    }

    /// Drop the cached token only if it is still the one the backend rejected.
    ///
    /// Returns `true` when the cache was cleared. A concurrent caller may
    /// already have replaced the rejected token, in which case the fresh one
    /// is kept.
    pub async fn invalidate_rejected(&self, rejected: &str) -> bool {
        let mut slot = self.slot.lock().await;
        let matches = slot
            .cached
            .as_ref()
            .is_some_and(|cached| cached.token == rejected);
        if matches {
            slot.cached = None;
            debug!("rejected access token invalidated");
        }
        matches
    }

    /// Snapshot of the cached credential, if any.
    pub async fn peek(&self) -> Option<CachedCredential> {
        self.slot.lock().await.cached.clone()
    }

    /// Number of completed acquisition calls.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Acquire)
    }
}
