//! Query coordination: serve-cached-first reads with background revalidation
//! and request de-duplication.
//!
//! A [`QueryClient`] owns the process-wide cache engine and pending-request
//! registry for one payload type and hands out [`QueryCoordinator`]s per
//! call site. A coordinator serves whatever the cache holds immediately,
//! fetches in the background when the entry is stale or absent, and joins an
//! already in-flight fetch for the same key instead of duplicating it.
//!
//! The primary correctness invariant of the layer lives here: for any number
//! of concurrent queries on one key, the underlying fetch function runs at
//! most once, and every caller observes the same settled result. The
//! registry entry is released on every outcome — success, failure, or
//! cancellation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheConfig, CacheEngine, CacheSubscription};
use crate::error::FetchError;

type FetchOutcome<T> = Result<T, Arc<FetchError>>;
type SharedFetch<T> = Shared<BoxFuture<'static, FetchOutcome<T>>>;
type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, FetchError>> + Send + Sync>;

/// Global revalidation policy, consumed by every query site.
///
/// Per-site [`QueryOptions`] override individual fields; unset options fall
/// back to these defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevalidationConfig {
    /// Revalidate on first activation (mount-equivalent).
    pub refetch_on_activate: bool,
    /// Revalidate when the window regains focus. Off by default to avoid
    /// network spikes when switching tabs or opening devtools.
    pub refetch_on_focus: bool,
    /// Revalidate when network connectivity returns.
    pub refetch_on_reconnect: bool,
}

impl Default for RevalidationConfig {
    fn default() -> Self {
        Self {
            refetch_on_activate: true,
            refetch_on_focus: false,
            refetch_on_reconnect: true,
        }
    }
}

/// Per-call-site query options. Local overrides win over the client's
/// [`RevalidationConfig`] defaults.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// TTL for entries written by this query; the cache default when unset.
    pub ttl: Option<Duration>,
    /// Override for [`RevalidationConfig::refetch_on_activate`].
    pub refetch_on_activate: Option<bool>,
    /// Override for [`RevalidationConfig::refetch_on_focus`].
    pub refetch_on_focus: Option<bool>,
    /// Override for [`RevalidationConfig::refetch_on_reconnect`].
    pub refetch_on_reconnect: Option<bool>,
    /// Caller-provided cancellation signal for this query's fetches. A
    /// cancelled fetch surfaces [`FetchError::Cancelled`] and still releases
    /// its pending-registry entry.
    pub cancel: Option<CancellationToken>,
}

/// Snapshot of a query's observable state, the shape handed to the UI shell.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    /// Last known value, cached or freshly fetched. Never cleared by a
    /// failed fetch.
    pub data: Option<T>,
    /// A fetch is running and there is no usable data yet.
    pub is_loading: bool,
    /// A background revalidation is running while stale data is shown.
    pub is_refreshing: bool,
    /// Error from the most recent failed fetch, cleared by the next success.
    pub error: Option<Arc<FetchError>>,
    /// The served value is past its TTL.
    pub is_stale: bool,
    /// The served value is within its TTL.
    pub is_fresh: bool,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            is_loading: false,
            is_refreshing: false,
            error: None,
            is_stale: false,
            is_fresh: false,
        }
    }
}

/// Registry of in-flight fetches, keyed by cache key.
///
/// At most one fetch per key is outstanding at any time; concurrent callers
/// for the same key share the registered future and observe the same
/// eventual result.
pub struct PendingRegistry<T> {
    inflight: Mutex<HashMap<String, SharedFetch<T>>>,
}

impl<T> Default for PendingRegistry<T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> PendingRegistry<T> {
    /// Number of in-flight fetches.
    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    /// `true` when no fetch is in flight.
    pub fn is_empty(&self) -> bool {
        self.inflight.lock().is_empty()
    }

    /// `true` when a fetch for `key` is in flight.
    pub fn contains(&self, key: &str) -> bool {
        self.inflight.lock().contains_key(key)
    }

    /// Join the in-flight fetch for `key`, or register the one built by
    /// `make`. The decision and the registration are one atomic step.
    fn join_or_register(
        &self,
        key: &str,
        force: bool,
        make: impl FnOnce() -> SharedFetch<T>,
    ) -> (SharedFetch<T>, bool) {
        let mut inflight = self.inflight.lock();
        if !force {
            if let Some(existing) = inflight.get(key) {
                return (existing.clone(), true);
            }
        }
        let shared = make();
        inflight.insert(key.to_string(), shared.clone());
        (shared, false)
    }

    fn settle(&self, key: &str) {
        self.inflight.lock().remove(key);
    }

    fn clear(&self) {
        self.inflight.lock().clear();
    }
}

/// Owner of the shared cache engine and pending registry for one payload
/// type; the injected singleton service behind every query site in the tab.
///
/// Create one per resource family, share it via `Arc`, and call
/// [`query`](Self::query) per call site. [`reset`](Self::reset) restores a
/// pristine state, which keeps the layer replaceable per test case.
pub struct QueryClient<T> {
    cache: Arc<CacheEngine<T>>,
    pending: Arc<PendingRegistry<T>>,
    config: RevalidationConfig,
}

impl<T: Clone + Send + Sync + 'static> Default for QueryClient<T> {
    fn default() -> Self {
        Self::new(RevalidationConfig::default(), CacheConfig::default())
    }
}

impl<T: Clone + Send + Sync + 'static> QueryClient<T> {
    /// Create a client with the given revalidation defaults and cache
    /// configuration.
    pub fn new(config: RevalidationConfig, cache_config: CacheConfig) -> Self {
        Self {
            cache: Arc::new(CacheEngine::new(cache_config)),
            pending: Arc::new(PendingRegistry::default()),
            config,
        }
    }

    /// The shared cache engine.
    pub fn cache(&self) -> &Arc<CacheEngine<T>> {
        &self.cache
    }

    /// The shared pending-request registry.
    pub fn pending(&self) -> &Arc<PendingRegistry<T>> {
        &self.pending
    }

    /// The global revalidation defaults.
    pub fn config(&self) -> RevalidationConfig {
        self.config
    }

    /// Build a coordinator for `key` backed by `fetcher`.
    ///
    /// The coordinator starts cold; call [`QueryCoordinator::activate`] at
    /// the mount-equivalent point.
    pub fn query<F, Fut>(&self, key: &str, fetcher: F, options: QueryOptions) -> QueryCoordinator<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let policy = RevalidationConfig {
            refetch_on_activate: options
                .refetch_on_activate
                .unwrap_or(self.config.refetch_on_activate),
            refetch_on_focus: options.refetch_on_focus.unwrap_or(self.config.refetch_on_focus),
            refetch_on_reconnect: options
                .refetch_on_reconnect
                .unwrap_or(self.config.refetch_on_reconnect),
        };
        let ttl = options.ttl.unwrap_or_else(|| self.cache.default_ttl());
        let state: Arc<RwLock<QueryState<T>>> = Arc::new(RwLock::new(QueryState::default()));

        // Any cache write for this key, from this coordinator or another,
        // settles this coordinator's view.
        let subscription = {
            let state = Arc::clone(&state);
            let cache = Arc::clone(&self.cache);
            let key = key.to_string();
            self.cache.subscribe(&key.clone(), move |value: &T| {
                let mut snapshot = state.write();
                snapshot.data = Some(value.clone());
                snapshot.error = None;
                snapshot.is_loading = false;
                snapshot.is_refreshing = false;
                snapshot.is_fresh = cache.is_fresh(&key);
                snapshot.is_stale = cache.is_stale(&key);
            })
        };

        QueryCoordinator {
            key: key.to_string(),
            fetcher: Arc::new(move || fetcher().boxed()),
            ttl,
            policy,
            cancel: options.cancel,
            cache: Arc::clone(&self.cache),
            pending: Arc::clone(&self.pending),
            state,
            subscription: Some(subscription),
        }
    }

    /// Drop every cache entry and forget in-flight registrations.
    pub fn reset(&self) {
        self.cache.clear();
        self.pending.clear();
    }
}

/// One query site: a key, a fetch function, and the observable state the UI
/// consumes.
pub struct QueryCoordinator<T> {
    key: String,
    fetcher: Fetcher<T>,
    ttl: Duration,
    policy: RevalidationConfig,
    cancel: Option<CancellationToken>,
    cache: Arc<CacheEngine<T>>,
    pending: Arc<PendingRegistry<T>>,
    state: Arc<RwLock<QueryState<T>>>,
    subscription: Option<CacheSubscription<T>>,
}

impl<T: Clone + Send + Sync + 'static> QueryCoordinator<T> {
    /// The cache key this coordinator serves.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current observable state.
    pub fn state(&self) -> QueryState<T> {
        self.state.read().clone()
    }

    /// First activation (mount-equivalent): serve the cache immediately and
    /// revalidate in the background per policy.
    ///
    /// Returns without waiting for any network fetch; observe progress via
    /// [`state`](Self::state).
    pub fn activate(&self) {
        if self.policy.refetch_on_activate {
            self.spawn_load(false, "activate");
        } else {
            self.serve_cached();
        }
    }

    /// Forced refresh: start a fetch regardless of freshness and wait for it
    /// to settle.
    pub async fn refresh(&self) {
        debug!(key = %self.key, trigger = "refresh", "revalidating query");
        if let Some(shared) = self.begin_load(true) {
            let outcome = shared.await;
            Self::apply(&self.state, &self.cache, &self.key, &outcome);
        }
    }

    /// Drop the cache entry and reset this coordinator's state.
    pub fn invalidate(&self) {
        self.cache.remove(&self.key);
        *self.state.write() = QueryState::default();
    }

    /// Window regained focus; revalidates when the policy allows it.
    pub fn notify_focus(&self) {
        if self.policy.refetch_on_focus {
            self.spawn_load(false, "window focus");
        }
    }

    /// Network connectivity returned; revalidates when the policy allows it.
    pub fn notify_reconnect(&self) {
        if self.policy.refetch_on_reconnect {
            self.spawn_load(false, "network reconnect");
        }
    }

    /// Detach from cache notifications. Deterministic teardown for the
    /// unmount-equivalent point; an in-flight fetch still completes and
    /// writes through the cache.
    pub fn detach(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }

    /// Copy the cache's current view of this key into the local state
    /// without any network activity.
    fn serve_cached(&self) {
        if let Some(value) = self.cache.get(&self.key) {
            let mut snapshot = self.state.write();
            snapshot.data = Some(value);
            snapshot.is_fresh = self.cache.is_fresh(&self.key);
            snapshot.is_stale = self.cache.is_stale(&self.key);
        }
    }

    fn spawn_load(&self, force: bool, trigger: &str) {
        if let Some(shared) = self.begin_load(force) {
            debug!(key = %self.key, trigger, "revalidating query");
            let state = Arc::clone(&self.state);
            let cache = Arc::clone(&self.cache);
            let key = self.key.clone();
            tokio::spawn(async move {
                let outcome = shared.await;
                Self::apply(&state, &cache, &key, &outcome);
            });
        }
    }

    /// The load algorithm. Serves cached data into the state, then returns
    /// the future to settle — an in-flight fetch joined through the
    /// registry, or a newly registered one — or `None` when the cache is
    /// fresh and no fetch is needed.
    fn begin_load(&self, force: bool) -> Option<SharedFetch<T>> {
        let cached = self.cache.get(&self.key);
        let fresh = self.cache.is_fresh(&self.key);
        let stale = self.cache.is_stale(&self.key);

        match cached {
            Some(value) => {
                let mut snapshot = self.state.write();
                snapshot.data = Some(value);
                snapshot.error = None;
                snapshot.is_fresh = fresh;
                snapshot.is_stale = stale;
                if fresh && !force && !self.pending.contains(&self.key) {
                    // Fresh cache hit: no network call.
                    return None;
                }
                // Stale: keep serving the cached value while revalidating.
                snapshot.is_refreshing = true;
            }
            None => {
                self.state.write().is_loading = true;
            }
        }

        let (shared, joined) =
            self.pending
                .join_or_register(&self.key, force, || self.make_fetch());
        if joined {
            debug!(key = %self.key, "joining in-flight fetch");
        }
        Some(shared)
    }

    fn make_fetch(&self) -> SharedFetch<T> {
        let fetcher = Arc::clone(&self.fetcher);
        let pending = Arc::clone(&self.pending);
        let cache = Arc::clone(&self.cache);
        let cancel = self.cancel.clone();
        let key = self.key.clone();
        let ttl = self.ttl;
        async move {
            let result = match cancel {
                Some(token) => tokio::select! {
                    _ = token.cancelled() => Err(FetchError::Cancelled),
                    result = fetcher() => result,
                },
                None => fetcher().await,
            };
            // Registry cleanup runs on every outcome.
            pending.settle(&key);
            match result {
                Ok(value) => {
                    cache.set(&key, value.clone(), ttl);
                    Ok(value)
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "fetch failed; cached value untouched");
                    Err(Arc::new(err))
                }
            }
        }
        .boxed()
        .shared()
    }

    fn apply(
        state: &Arc<RwLock<QueryState<T>>>,
        cache: &Arc<CacheEngine<T>>,
        key: &str,
        outcome: &FetchOutcome<T>,
    ) {
        let mut snapshot = state.write();
        snapshot.is_loading = false;
        snapshot.is_refreshing = false;
        match outcome {
            Ok(value) => {
                snapshot.data = Some(value.clone());
                snapshot.error = None;
                snapshot.is_fresh = cache.is_fresh(key);
                snapshot.is_stale = cache.is_stale(key);
            }
            Err(err) => {
                // Prior cached value, if any, stays servable.
                snapshot.error = Some(Arc::clone(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client() -> QueryClient<String> {
        QueryClient::default()
    }

    #[tokio::test]
    async fn refresh_populates_state_and_cache() {
        let client = client();
        let coordinator = client.query(
            "greeting",
            || async { Ok("ola".to_string()) },
            QueryOptions::default(),
        );

        coordinator.refresh().await;

        let state = coordinator.state();
        assert_eq!(state.data.as_deref(), Some("ola"));
        assert!(state.is_fresh);
        assert!(!state.is_loading);
        assert!(state.error.is_none());
        assert_eq!(client.cache().get("greeting").as_deref(), Some("ola"));
        assert!(client.pending().is_empty());
    }

    #[tokio::test]
    async fn fresh_cache_hit_skips_network() {
        let client = client();
        let calls = Arc::new(AtomicUsize::new(0));

        client
            .cache()
            .set("k", "cached".to_string(), Duration::from_secs(60));

        let counter = Arc::clone(&calls);
        let coordinator = client.query(
            "k",
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok("network".to_string()) }
            },
            QueryOptions::default(),
        );

        coordinator.activate();
        tokio::task::yield_now().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.state().data.as_deref(), Some("cached"));
        assert!(coordinator.state().is_fresh);
    }

    #[tokio::test]
    async fn fetch_failure_keeps_cached_value() {
        let client = client();
        client
            .cache()
            .set("k", "stale-but-good".to_string(), Duration::ZERO);

        let coordinator = client.query(
            "k",
            || async { Err(FetchError::remote("backend down")) },
            QueryOptions::default(),
        );

        coordinator.refresh().await;

        let state = coordinator.state();
        assert_eq!(state.data.as_deref(), Some("stale-but-good"));
        assert!(matches!(
            state.error.as_deref(),
            Some(FetchError::Remote { .. })
        ));
        assert!(client.pending().is_empty());
    }

    #[tokio::test]
    async fn cancelled_fetch_releases_registry_entry() {
        let client = client();
        let token = CancellationToken::new();
        token.cancel();

        let coordinator = client.query(
            "k",
            || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("never".to_string())
            },
            QueryOptions {
                cancel: Some(token),
                ..QueryOptions::default()
            },
        );

        coordinator.refresh().await;

        assert!(matches!(
            coordinator.state().error.as_deref(),
            Some(FetchError::Cancelled)
        ));
        assert!(client.pending().is_empty());
    }

    #[tokio::test]
    async fn focus_trigger_respects_policy() {
        let client = client();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let coordinator = client.query(
            "k",
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok("v".to_string()) }
            },
            // Global default leaves focus revalidation off; opt in locally.
            QueryOptions {
                refetch_on_focus: Some(true),
                ..QueryOptions::default()
            },
        );

        coordinator.notify_focus();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let default_site = client.query(
            "other",
            || async { Ok("v".to_string()) },
            QueryOptions::default(),
        );
        default_site.notify_focus();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(default_site.state().data.is_none());
    }

    #[tokio::test]
    async fn invalidate_clears_entry_and_state() {
        let client = client();
        let coordinator = client.query(
            "k",
            || async { Ok("v".to_string()) },
            QueryOptions::default(),
        );
        coordinator.refresh().await;
        assert!(client.cache().get("k").is_some());

        coordinator.invalidate();
        assert!(client.cache().get("k").is_none());
        assert!(coordinator.state().data.is_none());
    }
}
