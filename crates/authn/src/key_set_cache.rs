//! Key-set cache for assertion verification.
//!
//! This module provides [`KeySetCache`], which holds one issuer's current
//! [`SigningKeySet`] and refreshes it through a [`KeySetSource`].
//!
//! # Architecture
//!
//! ```text
//! resolve_key(kid)
//!   → cached set fresh and kid present?  → return key
//!   → otherwise take the refresh gate
//!       → another resolver refreshed while we waited? → reuse its outcome
//!       → fetch (bounded by fetch_timeout)
//!           → ok:   swap in the new set
//!           → err:  serve the old set if within stale grace, else KeySetUnavailable
//!   → kid present in the resulting set? → return key, else UnknownSigningKey
//! ```
//!
//! # Cache Strategy
//!
//! - **TTL**: Default 300 seconds (5 minutes)
//! - **Stale grace**: Default 3600 seconds past TTL expiry, only used while the endpoint is failing
//! - **Single flight**: at most one fetch in flight; waiters reuse its outcome
//! - **Bounded retries**: at most one fetch per `resolve_key` call
//!
//! # Examples
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use iap_authn::{HttpKeySetSource, KeySetCache, key_source::IAP_JWK_URL};
//!
//! # async fn example() -> Result<(), iap_authn::AuthError> {
//! let source = HttpKeySetSource::new(IAP_JWK_URL, Duration::from_secs(5))?;
//! let cache = KeySetCache::new(Arc::new(source), Duration::from_secs(300));
//!
//! let key = cache.resolve_key("0oeLcQ").await?;
//! println!("resolved {}", key.kid());
//! # Ok(())
//! # }
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use fail::fail_point;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::{
    error::AuthError,
    key_set::{SigningKeySet, VerificationKey},
    key_source::KeySetSource,
};

/// Default key-set TTL (5 minutes).
///
/// IAP rotates keys without notice but publishes new keys before signing
/// with them, and unknown kids force a refresh regardless of TTL.
pub const DEFAULT_KEY_SET_TTL: Duration = Duration::from_secs(300);

/// Default stale grace (1 hour).
///
/// How long past TTL expiry a cached set may still be served while the
/// endpoint is failing. Bounds how long a withdrawn key stays trusted during
/// an outage:
///
/// - **Shorter grace** (e.g., 5 minutes): withdrawn keys stop verifying sooner, higher risk of
///   rejecting all traffic during an endpoint outage
/// - **Longer grace** (e.g., 6 hours): more availability, withdrawn keys trusted longer
pub const DEFAULT_STALE_GRACE: Duration = Duration::from_secs(3_600);

/// Default fetch timeout (5 seconds).
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Point-in-time counters for a [`KeySetCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeySetCacheMetrics {
    /// Fetches issued to the source.
    pub fetches: u64,
    /// Fetches that failed or timed out.
    pub fetch_failures: u64,
    /// Refreshes forced by a kid missing from a fresh set.
    pub forced_refreshes: u64,
    /// Resolutions answered from a set past its TTL because the refresh failed.
    pub stale_served: u64,
    /// Resolutions that waited for another caller's refresh instead of fetching.
    pub coalesced_waits: u64,
    /// Completed background refresh cycles.
    pub background_refreshes: u64,
}

#[derive(Default)]
struct Counters {
    fetches: AtomicU64,
    fetch_failures: AtomicU64,
    forced_refreshes: AtomicU64,
    stale_served: AtomicU64,
    coalesced_waits: AtomicU64,
    background_refreshes: AtomicU64,
}

#[derive(Default)]
struct CacheState {
    /// Last successfully fetched set.
    current: Option<Arc<SigningKeySet>>,
    /// Completed refresh attempts. Lets gate waiters detect that someone
    /// else refreshed while they were queued.
    attempts: u64,
    /// Outcome of the most recent attempt, if it failed.
    last_error: Option<AuthError>,
}

/// Set produced by a refresh, and whether it came from a successful fetch.
struct Refreshed {
    set: Arc<SigningKeySet>,
    stale: bool,
}

/// Cache for one issuer's signing-key set.
///
/// Construct once per process per issuer endpoint and share by [`Arc`].
/// Lookups on a fresh set never block. Refreshes are serialized by an async
/// gate so that a burst of resolvers for an unknown or expired key set causes
/// a single outbound fetch.
///
/// # Graceful Degradation
///
/// When a fetch fails (transport error, non-success status, unusable
/// document, or timeout), the previous set keeps being served until it is
/// older than TTL + stale grace. After that, resolution fails with
/// [`AuthError::KeySetUnavailable`].
pub struct KeySetCache {
    source: Arc<dyn KeySetSource>,
    ttl: Duration,
    stale_grace: Duration,
    fetch_timeout: Duration,
    state: RwLock<CacheState>,
    /// Held for the duration of a fetch.
    refresh_gate: tokio::sync::Mutex<()>,
    counters: Counters,
    /// Cancellation token for stopping the background refresh task.
    cancel_token: CancellationToken,
    /// Wrapped in `Mutex` so `shutdown()` can take ownership via `&self`.
    refresh_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl KeySetCache {
    /// Creates a cache with the default stale grace and fetch timeout.
    ///
    /// Nothing is fetched until the first [`resolve_key`](Self::resolve_key)
    /// or [`refresh`](Self::refresh).
    pub fn new(source: Arc<dyn KeySetSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            stale_grace: DEFAULT_STALE_GRACE,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            state: RwLock::new(CacheState::default()),
            refresh_gate: tokio::sync::Mutex::new(()),
            counters: Counters::default(),
            cancel_token: CancellationToken::new(),
            refresh_handle: Mutex::new(None),
        }
    }

    /// Sets how long past TTL a set may be served while the endpoint fails.
    #[must_use]
    pub fn with_stale_grace(mut self, stale_grace: Duration) -> Self {
        self.stale_grace = stale_grace;
        self
    }

    /// Sets the upper bound on a single fetch.
    #[must_use]
    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    /// Resolve the verification key for `kid`.
    ///
    /// Issues at most one fetch. A kid missing from a fresh set forces that
    /// fetch; a kid still missing afterwards is unknown.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The kid is absent from the refreshed set ([`AuthError::UnknownSigningKey`])
    /// - The fetch failed and no set within the stale grace exists, or the stale set lacks the kid
    ///   ([`AuthError::KeySetUnavailable`])
    #[tracing::instrument(skip(self), fields(endpoint = self.source.endpoint()))]
    pub async fn resolve_key(&self, kid: &str) -> Result<Arc<VerificationKey>, AuthError> {
        let (snapshot, attempts) = {
            let state = self.state.read();
            (state.current.clone(), state.attempts)
        };

        match &snapshot {
            Some(set) if self.is_fresh(set) => {
                if let Some(key) = set.get(kid) {
                    tracing::debug!(cache = "hit", "key resolved from cached set");
                    return Ok(key);
                }
                self.counters.forced_refreshes.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cache = "miss", "unknown kid, forcing key set refresh");
            },
            Some(set) => {
                tracing::debug!(age_secs = set.age().as_secs(), "key set expired, refreshing");
            },
            None => tracing::debug!("no key set cached, fetching"),
        }

        let Refreshed { set, stale } = self.refresh_after(Some(attempts)).await?;
        match set.get(kid) {
            Some(key) => Ok(key),
            None if stale => Err(AuthError::key_set_unavailable(
                "kid not in stale key set and refresh failed",
            )),
            None => Err(AuthError::unknown_signing_key(kid)),
        }
    }

    /// Fetch the key set now, regardless of TTL.
    ///
    /// Useful to warm the cache at startup. Waits for any refresh already in
    /// flight, then issues its own fetch.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeySetUnavailable`] if the fetch fails and no set
    /// within the stale grace exists.
    pub async fn refresh(&self) -> Result<Arc<SigningKeySet>, AuthError> {
        self.refresh_after(None).await.map(|refreshed| refreshed.set)
    }

    /// Refresh under the gate. With `seen_attempts`, a refresh completed by
    /// someone else since that snapshot is reused instead of fetching again.
    async fn refresh_after(&self, seen_attempts: Option<u64>) -> Result<Refreshed, AuthError> {
        let _gate = self.refresh_gate.lock().await;

        if let Some(seen) = seen_attempts {
            let outcome = {
                let state = self.state.read();
                (state.attempts != seen).then(|| (state.current.clone(), state.last_error.clone()))
            };
            if let Some((current, last_error)) = outcome {
                self.counters.coalesced_waits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("reusing concurrent refresh outcome");
                return match (current, last_error) {
                    (Some(set), None) => Ok(Refreshed { set, stale: false }),
                    (current, Some(err)) => self.fall_back(current, err),
                    (None, None) => Err(AuthError::key_set_unavailable("key set was cleared")),
                };
            }
        }

        let result = self.fetch().await;

        let mut state = self.state.write();
        state.attempts += 1;
        match result {
            Ok(set) => {
                let set = Arc::new(set);
                state.current = Some(Arc::clone(&set));
                state.last_error = None;
                drop(state);
                tracing::debug!(keys = set.len(), "key set refreshed");
                Ok(Refreshed { set, stale: false })
            },
            Err(err) => {
                state.last_error = Some(err.clone());
                let current = state.current.clone();
                drop(state);
                self.fall_back(current, err)
            },
        }
    }

    async fn fetch(&self) -> Result<SigningKeySet, AuthError> {
        fail_point!("key-set-before-fetch", |_| {
            Err(AuthError::key_set_unavailable("injected failure before key set fetch"))
        });

        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        let result = match tokio::time::timeout(self.fetch_timeout, self.source.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::key_set_unavailable(format!(
                "key set fetch timed out after {}ms",
                self.fetch_timeout.as_millis()
            ))),
        };

        if let Err(err) = &result {
            self.counters.fetch_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(endpoint = self.source.endpoint(), error = %err, "key set fetch failed");
        }
        result
    }

    fn fall_back(
        &self,
        current: Option<Arc<SigningKeySet>>,
        err: AuthError,
    ) -> Result<Refreshed, AuthError> {
        match current {
            Some(set) if self.within_grace(&set) => {
                self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    cache = "stale",
                    age_secs = set.age().as_secs(),
                    "serving cached key set, endpoint unavailable"
                );
                Ok(Refreshed { set, stale: true })
            },
            Some(set) => {
                tracing::warn!(
                    age_secs = set.age().as_secs(),
                    "cached key set is past its stale grace"
                );
                Err(err)
            },
            None => Err(err),
        }
    }

    fn is_fresh(&self, set: &SigningKeySet) -> bool {
        set.age() < self.ttl
    }

    fn within_grace(&self, set: &SigningKeySet) -> bool {
        set.age() <= self.ttl.saturating_add(self.stale_grace)
    }

    /// Drops the cached set. The next resolution fetches.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.current = None;
        state.last_error = None;
    }

    /// Stops the background refresh task, if running, and drops the cached set.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        // Take the handle so we can await it without holding the lock.
        let handle = self.refresh_handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "background refresh task panicked");
        }
        self.clear();
    }

    /// Spawns a background task that refreshes the set every `interval`.
    ///
    /// Keeps the set fresh so that request-path resolutions rarely fetch.
    /// Failures are logged and leave the current set in place. Stop the task
    /// with [`shutdown`](Self::shutdown) or by cancelling
    /// [`cancel_token`](Self::cancel_token).
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn with_refresh_interval(self: Arc<Self>, interval: Duration) -> Arc<Self> {
        let cache = Arc::clone(&self);
        let token = self.cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; consume it so we start
            // with a full interval wait.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!(endpoint = cache.source.endpoint(), "background key set refresh stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = cache.refresh().await {
                            tracing::warn!(error = %err, "background key set refresh failed");
                        }
                        cache.counters.background_refreshes.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        });

        *self.refresh_handle.lock() = Some(handle);
        self
    }

    /// Returns the cancellation token for the background refresh task.
    ///
    /// Callers can use this to integrate with external shutdown signals.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// The currently cached set, fresh or not.
    #[must_use]
    pub fn current(&self) -> Option<Arc<SigningKeySet>> {
        self.state.read().current.clone()
    }

    /// The endpoint this cache fetches from.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        self.source.endpoint()
    }

    /// The configured TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Snapshot of the cache counters.
    #[must_use]
    pub fn metrics(&self) -> KeySetCacheMetrics {
        let c = &self.counters;
        KeySetCacheMetrics {
            fetches: c.fetches.load(Ordering::Relaxed),
            fetch_failures: c.fetch_failures.load(Ordering::Relaxed),
            forced_refreshes: c.forced_refreshes.load(Ordering::Relaxed),
            stale_served: c.stale_served.load(Ordering::Relaxed),
            coalesced_waits: c.coalesced_waits.load(Ordering::Relaxed),
            background_refreshes: c.background_refreshes.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for KeySetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySetCache")
            .field("endpoint", &self.source.endpoint())
            .field("ttl", &self.ttl)
            .field("stale_grace", &self.stale_grace)
            .field("fetch_timeout", &self.fetch_timeout)
            .finish_non_exhaustive()
    }
}
