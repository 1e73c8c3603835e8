//! Fetch coordinator: at most one in-flight network call per key.
//!
//! Every caller of [`FetchCoordinator::request`] for a key that already has
//! a pending fetch joins it instead of starting another. The fetch itself
//! runs on a spawned task, so it completes and updates the store even when
//! every caller has gone away. Only when every caller asked for the result
//! through a cancel token, and all of those tokens were cancelled, is the
//! result discarded.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use lectern_common::{Error, ResourceKey, Result};

use crate::staleness::StalenessPolicy;
use crate::store::{CacheStore, Entry, EntryStatus};

/// Result shared by every caller of one fetch.
pub type FetchResult = Result<Arc<Value>>;

type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// Per-request knobs.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the coordinator's default timeout.
    pub timeout: Option<Duration>,
    /// This caller's interest in the result. The fetch result is dropped
    /// only if every caller passed a token and all were cancelled.
    pub cancel: Option<CancellationToken>,
    /// Leave an `Error` entry as is instead of flipping it to `Loading`.
    pub preserve_error: bool,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_preserve_error(mut self, preserve: bool) -> Self {
        self.preserve_error = preserve;
        self
    }
}

struct InFlight {
    id: u64,
    shared: SharedFetch,
    subscribers: Arc<AtomicUsize>,
    interest: Arc<Interest>,
}

/// Tokens of the callers that want a fetch stored; `None` once a caller
/// joined without one.
struct Interest(Mutex<Option<Vec<CancellationToken>>>);

impl Interest {
    fn new() -> Self {
        Self(Mutex::new(Some(Vec::new())))
    }

    fn register(&self, cancel: Option<&CancellationToken>) {
        let mut tokens = self.0.lock().unwrap_or_else(|e| e.into_inner());
        match (tokens.as_mut(), cancel) {
            (Some(tokens), Some(token)) => tokens.push(token.clone()),
            (Some(_), None) => *tokens = None,
            (None, _) => {}
        }
    }

    fn is_wanted(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(true, |tokens| tokens.iter().any(|token| !token.is_cancelled()))
    }
}

/// Decrements the subscriber count when a caller's future is dropped.
struct SubscriberGuard(Arc<AtomicUsize>);

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// De-duplicating fetch executor.
pub struct FetchCoordinator {
    store: Arc<CacheStore>,
    policy: Arc<StalenessPolicy>,
    in_flight: Arc<Mutex<HashMap<ResourceKey, InFlight>>>,
    default_timeout: Duration,
    next_id: AtomicU64,
}

impl FetchCoordinator {
    pub fn new(store: Arc<CacheStore>, policy: Arc<StalenessPolicy>, default_timeout: Duration) -> Self {
        Self {
            store,
            policy,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            default_timeout,
            next_id: AtomicU64::new(0),
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<ResourceKey, InFlight>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn policy(&self) -> &Arc<StalenessPolicy> {
        &self.policy
    }

    /// Number of live callers waiting on the pending fetch for `key`.
    pub fn in_flight(&self, key: &ResourceKey) -> Option<usize> {
        self.lock_in_flight()
            .get(key)
            .map(|pending| pending.subscribers.load(Ordering::SeqCst))
    }

    pub fn is_in_flight(&self, key: &ResourceKey) -> bool {
        self.lock_in_flight().contains_key(key)
    }

    /// Keys with a pending fetch.
    pub fn in_flight_keys(&self) -> Vec<ResourceKey> {
        self.lock_in_flight().keys().cloned().collect()
    }

    fn join(pending: &InFlight, cancel: Option<&CancellationToken>) -> BoxFuture<'static, FetchResult> {
        pending.interest.register(cancel);
        pending.subscribers.fetch_add(1, Ordering::SeqCst);
        let guard = SubscriberGuard(pending.subscribers.clone());
        let shared = pending.shared.clone();
        async move {
            let _guard = guard;
            shared.await
        }
        .boxed()
    }

    /// Fetch `key`, joining a pending fetch if there is one.
    ///
    /// `fetch_fn` is only invoked when no fetch is pending; otherwise it is
    /// dropped uninvoked. The fetch starts immediately; the returned future
    /// only waits for its shared result, and dropping it unsubscribes the
    /// caller without cancelling the fetch.
    ///
    /// # Postconditions
    /// - On success the value is stored with the policy's TTL for `key`
    /// - On failure the entry becomes `Error`, keeping any previous value
    ///
    /// # Panics
    /// - Must be called from within a tokio runtime
    pub fn request<F, Fut>(
        &self,
        key: ResourceKey,
        fetch_fn: F,
        options: RequestOptions,
    ) -> BoxFuture<'static, FetchResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<FetchResult>();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let interest;
        let joined = {
            let mut in_flight = self.lock_in_flight();
            if let Some(pending) = in_flight.get(&key) {
                debug!(%key, "Joining in-flight fetch");
                return Self::join(pending, options.cancel.as_ref());
            }

            let shared = async move {
                rx.await.unwrap_or_else(|_| {
                    Err(Error::Network("Fetch task ended without a result".to_string()))
                })
            }
            .boxed()
            .shared();
            let pending = InFlight {
                id,
                shared,
                subscribers: Arc::new(AtomicUsize::new(0)),
                interest: Arc::new(Interest::new()),
            };
            let joined = Self::join(&pending, options.cancel.as_ref());
            interest = pending.interest.clone();
            in_flight.insert(key.clone(), pending);
            joined
        };

        let previous = self.store.get(&key);
        let keep_error = options.preserve_error
            && previous
                .as_ref()
                .is_some_and(|entry| entry.status == EntryStatus::Error);
        if !keep_error {
            self.store.set_status(&key, EntryStatus::Loading, None);
        }

        debug!(%key, "Starting fetch");
        let fetch = fetch_fn();
        let settle = Settle {
            id,
            key,
            store: self.store.clone(),
            policy: self.policy.clone(),
            in_flight: self.in_flight.clone(),
            previous,
            flipped_to_loading: !keep_error,
            interest,
        };
        let timeout = options.timeout.unwrap_or(self.default_timeout);

        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, fetch).await {
                Ok(result) => result.map(Arc::new),
                Err(_) => Err(Error::Network(format!(
                    "Request timed out after {:?}",
                    timeout
                ))),
            };
            settle.apply(&result);
            // Every caller may already be gone.
            let _ = tx.send(result);
        });

        joined
    }
}

/// Everything the spawned fetch task needs to settle one request.
struct Settle {
    id: u64,
    key: ResourceKey,
    store: Arc<CacheStore>,
    policy: Arc<StalenessPolicy>,
    in_flight: Arc<Mutex<HashMap<ResourceKey, InFlight>>>,
    previous: Option<Entry>,
    flipped_to_loading: bool,
    interest: Arc<Interest>,
}

impl Settle {
    fn apply(self, result: &FetchResult) {
        if !self.interest.is_wanted() {
            debug!(key = %self.key, "Discarding result of cancelled fetch");
            self.revert_loading();
        } else {
            match result {
                Ok(value) => {
                    let ttl = self.policy.ttl_for(&self.key);
                    self.store
                        .put(&self.key, value.clone(), self.store.now(), ttl);
                    debug!(key = %self.key, "Fetch succeeded");
                }
                Err(err) => {
                    self.store
                        .set_status(&self.key, EntryStatus::Error, Some(err.clone()));
                    debug!(key = %self.key, error = %err, "Fetch failed");
                }
            }
        }

        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if in_flight.get(&self.key).is_some_and(|pending| pending.id == self.id) {
            in_flight.remove(&self.key);
        }
    }

    /// Undo the `Loading` transition made for a fetch whose result is dropped.
    fn revert_loading(&self) {
        if !self.flipped_to_loading {
            return;
        }
        match &self.previous {
            Some(entry) => {
                self.store
                    .revert_loading(&self.key, entry.status, entry.last_error.clone())
            }
            None => self.store.revert_loading(&self.key, EntryStatus::Idle, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lectern_common::{Clock, ManualClock};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn coordinator() -> (Arc<ManualClock>, FetchCoordinator) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(CacheStore::new(clock.clone()));
        let policy = Arc::new(StalenessPolicy::new(Duration::from_secs(60)));
        let coordinator = FetchCoordinator::new(store, policy, Duration::from_secs(5));
        (clock, coordinator)
    }

    fn quiz() -> ResourceKey {
        ResourceKey::new("quiz").with(42)
    }

    fn slow(value: Value, calls: Arc<AtomicU32>) -> impl FnOnce() -> BoxFuture<'static, Result<Value>> {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(value)
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_fetch() {
        let (_, coordinator) = coordinator();
        let calls = Arc::new(AtomicU32::new(0));

        let first = coordinator.request(quiz(), slow(json!(["q1"]), calls.clone()), RequestOptions::new());
        let second = coordinator.request(quiz(), slow(json!(["other"]), calls.clone()), RequestOptions::new());
        assert_eq!(coordinator.in_flight(&quiz()), Some(2));

        let (a, b) = tokio::join!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), b.unwrap());
        assert!(!coordinator.is_in_flight(&quiz()));

        let entry = coordinator.store().get(&quiz()).unwrap();
        assert_eq!(entry.status, EntryStatus::Success);
        assert_eq!(entry.value.as_deref(), Some(&json!(["q1"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_shared_and_keep_value() {
        let (clock, coordinator) = coordinator();
        coordinator
            .store()
            .put(&quiz(), Arc::new(json!(["old"])), clock.now(), Duration::ZERO);

        let fail = || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<Value, _>(Error::from_status(502, "bad gateway"))
        };
        let first = coordinator.request(quiz(), fail, RequestOptions::new());
        let second = coordinator.request(quiz(), fail, RequestOptions::new());

        let entry = coordinator.store().get(&quiz()).unwrap();
        assert_eq!(entry.status, EntryStatus::Loading);
        assert_eq!(entry.value.as_deref(), Some(&json!(["old"])));

        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap_err(), b.unwrap_err());

        let entry = coordinator.store().get(&quiz()).unwrap();
        assert_eq!(entry.status, EntryStatus::Error);
        assert_eq!(entry.value.as_deref(), Some(&json!(["old"])));
        assert!(matches!(entry.last_error, Some(Error::Server { status: 502, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_callers_do_not_cancel_fetch() {
        let (_, coordinator) = coordinator();
        let calls = Arc::new(AtomicU32::new(0));

        let pending = coordinator.request(quiz(), slow(json!([1]), calls.clone()), RequestOptions::new());
        assert_eq!(coordinator.in_flight(&quiz()), Some(1));
        drop(pending);
        assert_eq!(coordinator.in_flight(&quiz()), Some(0));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let entry = coordinator.store().get(&quiz()).unwrap();
        assert_eq!(entry.status, EntryStatus::Success);
        assert_eq!(coordinator.in_flight(&quiz()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_request_allows_new_fetch() {
        let (_, coordinator) = coordinator();
        let calls = Arc::new(AtomicU32::new(0));

        coordinator
            .request(quiz(), slow(json!(1), calls.clone()), RequestOptions::new())
            .await
            .unwrap();
        coordinator
            .request(quiz(), slow(json!(2), calls.clone()), RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_network_error() {
        let (_, coordinator) = coordinator();
        let never = || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, Error>(json!(null))
        };

        let result = coordinator
            .request(
                quiz(),
                never,
                RequestOptions::new().with_timeout(Duration::from_millis(50)),
            )
            .await;
        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(
            coordinator.store().get(&quiz()).unwrap().status,
            EntryStatus::Error
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_result_is_discarded() {
        let (clock, coordinator) = coordinator();
        coordinator
            .store()
            .put(&quiz(), Arc::new(json!("cached")), clock.now(), Duration::ZERO);
        let before = coordinator.store().get(&quiz()).unwrap();

        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let pending = coordinator.request(
            quiz(),
            slow(json!("fresh"), calls),
            RequestOptions::new().with_cancel(token.clone()),
        );
        token.cancel();
        let _ = pending.await;

        let after = coordinator.store().get(&quiz()).unwrap();
        assert_eq!(after.value, before.value);
        assert_eq!(after.status, EntryStatus::Success);
        assert_eq!(after.stale_at, before.stale_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_fetch_does_not_notify() {
        let (_, coordinator) = coordinator();
        let events = Arc::new(Mutex::new(Vec::new()));
        let log = events.clone();
        let _sub = coordinator.store().subscribers().subscribe(quiz(), move |event| {
            log.lock().unwrap().push(event.kind);
        });

        let token = CancellationToken::new();
        let pending = coordinator.request(
            quiz(),
            slow(json!("fresh"), Arc::new(AtomicU32::new(0))),
            RequestOptions::new().with_cancel(token.clone()),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        events.lock().unwrap().clear();

        let _ = pending.await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(
            coordinator.store().get(&quiz()).unwrap().status,
            EntryStatus::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_only_affects_its_caller() {
        let (_, coordinator) = coordinator();
        let calls = Arc::new(AtomicU32::new(0));

        let token = CancellationToken::new();
        let first = coordinator.request(
            quiz(),
            slow(json!("fresh"), calls.clone()),
            RequestOptions::new().with_cancel(token.clone()),
        );
        let other = CancellationToken::new();
        let second = coordinator.request(
            quiz(),
            slow(json!("unused"), calls.clone()),
            RequestOptions::new().with_cancel(other),
        );
        token.cancel();

        let (_, b) = tokio::join!(first, second);
        assert_eq!(b.unwrap().as_ref(), &json!("fresh"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let entry = coordinator.store().get(&quiz()).unwrap();
        assert_eq!(entry.status, EntryStatus::Success);
        assert_eq!(entry.value.as_deref(), Some(&json!("fresh")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_caller_keeps_cancelled_fetch() {
        let (_, coordinator) = coordinator();
        let token = CancellationToken::new();
        let cancelled = coordinator.request(
            quiz(),
            slow(json!("fresh"), Arc::new(AtomicU32::new(0))),
            RequestOptions::new().with_cancel(token.clone()),
        );
        drop(coordinator.request(quiz(), || async { Ok::<_, Error>(json!(null)) }, RequestOptions::new()));
        token.cancel();

        let _ = cancelled.await;
        assert_eq!(
            coordinator.store().get(&quiz()).unwrap().value.as_deref(),
            Some(&json!("fresh"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_preserve_error_skips_loading() {
        let (_, coordinator) = coordinator();
        coordinator.store().set_status(
            &quiz(),
            EntryStatus::Error,
            Some(Error::Network("down".to_string())),
        );

        let calls = Arc::new(AtomicU32::new(0));
        let pending = coordinator.request(
            quiz(),
            slow(json!("up"), calls),
            RequestOptions::new().with_preserve_error(true),
        );
        assert_eq!(
            coordinator.store().get(&quiz()).unwrap().status,
            EntryStatus::Error
        );

        pending.await.unwrap();
        assert_eq!(
            coordinator.store().get(&quiz()).unwrap().status,
            EntryStatus::Success
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_comes_from_policy() {
        let (clock, coordinator) = coordinator();
        coordinator
            .request(quiz(), || async { Ok::<_, Error>(json!([])) }, RequestOptions::new())
            .await
            .unwrap();

        let entry = coordinator.store().get(&quiz()).unwrap();
        assert_eq!(
            entry.stale_at,
            Some(clock.now() + chrono::TimeDelta::seconds(60))
        );
    }
}
