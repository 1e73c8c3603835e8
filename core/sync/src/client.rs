//! Application-facing sync client.
//!
//! [`SyncClient`] owns one store and the components that act on it. Reads
//! follow stale-while-revalidate: fresh values are returned directly, stale
//! values are returned immediately while a background fetch refreshes them,
//! and missing values wait for the first fetch.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use lectern_common::{Clock, KeyPattern, ResourceKey, Result, SystemClock};

use crate::accessor::{FetchFn, ResourceAccessor};
use crate::config::SyncConfig;
use crate::coordinator::{FetchCoordinator, FetchResult, RequestOptions};
use crate::mutation::{MutationExecutor, MutationOutcome, MutationSpec};
use crate::poller::{PollConfig, PollStatus, Poller};
use crate::staleness::StalenessPolicy;
use crate::store::{CacheStore, Entry};
use crate::subscribers::{CacheEvent, Subscription};

struct Janitor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Cache, fetch coordination, mutations and polling behind one handle.
pub struct SyncClient {
    config: SyncConfig,
    store: Arc<CacheStore>,
    policy: Arc<StalenessPolicy>,
    coordinator: Arc<FetchCoordinator>,
    executor: Arc<MutationExecutor>,
    poller: Poller,
    watched: Mutex<HashMap<ResourceKey, FetchFn>>,
    janitor: Mutex<Option<Janitor>>,
}

impl SyncClient {
    pub fn new(config: SyncConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build a client whose staleness arithmetic uses `clock`.
    pub fn with_clock(config: SyncConfig, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(CacheStore::new(clock));
        let policy = Arc::new(config.staleness_policy());
        let coordinator = Arc::new(FetchCoordinator::new(
            store.clone(),
            policy.clone(),
            config.fetch_timeout,
        ));
        let executor = Arc::new(MutationExecutor::new(
            store.clone(),
            policy.clone(),
            Arc::new(config.invalidation.clone()),
            config.mutation_timeout,
        ));
        let poller = Poller::new(coordinator.clone());

        Self {
            config,
            store,
            policy,
            coordinator,
            executor,
            poller,
            watched: Mutex::new(HashMap::new()),
            janitor: Mutex::new(None),
        }
    }

    fn lock_watched(&self) -> MutexGuard<'_, HashMap<ResourceKey, FetchFn>> {
        self.watched.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn policy(&self) -> &Arc<StalenessPolicy> {
        &self.policy
    }

    pub fn coordinator(&self) -> &Arc<FetchCoordinator> {
        &self.coordinator
    }

    pub fn executor(&self) -> &Arc<MutationExecutor> {
        &self.executor
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    fn request(&self, key: ResourceKey, fetch: FetchFn) -> BoxFuture<'static, FetchResult> {
        self.coordinator
            .request(key, move || fetch(), RequestOptions::new())
    }

    /// Read and decode a resource.
    ///
    /// # Errors
    /// - The fetch error when nothing is cached yet
    /// - `Parse` when the value does not decode into `T`
    pub async fn read<T: DeserializeOwned>(&self, accessor: &ResourceAccessor<T>) -> Result<T> {
        let value = self.read_value(accessor).await?;
        accessor.decode(&value)
    }

    /// Read the raw cached value with stale-while-revalidate semantics.
    pub async fn read_value<T: DeserializeOwned>(
        &self,
        accessor: &ResourceAccessor<T>,
    ) -> Result<Arc<Value>> {
        let key = accessor.key();
        if let Some(entry) = self.store.get(key) {
            let fresh = self.policy.is_fresh(&entry, self.store.now());
            if let Some(value) = entry.value {
                if !fresh {
                    debug!(%key, "Serving stale value, revalidating");
                    self.prefetch(accessor);
                }
                return Ok(value);
            }
        }
        self.request(key.clone(), accessor.fetcher()).await
    }

    /// Fetch from the network regardless of staleness.
    ///
    /// Joins a pending fetch for the same key instead of starting another.
    pub async fn fetch<T: DeserializeOwned>(&self, accessor: &ResourceAccessor<T>) -> Result<T> {
        let value = self.request(accessor.key().clone(), accessor.fetcher()).await?;
        accessor.decode(&value)
    }

    /// Start a background fetch; the result only lands in the store.
    pub fn prefetch<T: DeserializeOwned>(&self, accessor: &ResourceAccessor<T>) {
        drop(self.request(accessor.key().clone(), accessor.fetcher()));
    }

    /// Subscribe to changes of the accessor's key.
    ///
    /// The key is fetched in the background unless a fresh value is cached,
    /// and refetched whenever it is invalidated while subscribed.
    pub fn watch<T, F>(&self, accessor: &ResourceAccessor<T>, listener: F) -> Subscription
    where
        T: DeserializeOwned,
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let key = accessor.key().clone();
        self.lock_watched().insert(key.clone(), accessor.fetcher());
        let subscription = self.store.subscribers().subscribe(key.clone(), listener);

        let fresh = self
            .store
            .get(&key)
            .is_some_and(|entry| self.policy.is_fresh(&entry, self.store.now()));
        if !fresh {
            self.prefetch(accessor);
        }
        subscription
    }

    /// Run a mutation, then refetch the watched keys it invalidated.
    ///
    /// The mutation runs on its own task: once submitted it settles even if
    /// the returned future is dropped.
    ///
    /// # Errors
    /// - Whatever [`MutationExecutor::execute`] returns
    pub async fn mutate(&self, spec: MutationSpec) -> Result<MutationOutcome> {
        let outcome = self.executor.execute(spec).await?;
        self.refetch_watched(&outcome.invalidated);
        Ok(outcome)
    }

    /// Mark every entry matching `pattern` stale and refetch watched ones.
    pub fn invalidate(&self, pattern: &KeyPattern) -> Vec<ResourceKey> {
        let keys = self.store.invalidate(pattern);
        debug!(%pattern, count = keys.len(), "Invalidated");
        self.refetch_watched(&keys);
        keys
    }

    fn refetch_watched(&self, keys: &[ResourceKey]) {
        let targets: Vec<(ResourceKey, FetchFn)> = {
            let subscribers = self.store.subscribers();
            let mut watched = self.lock_watched();
            watched.retain(|key, _| subscribers.subscriber_count(key) > 0);
            keys.iter()
                .filter_map(|key| watched.get(key).map(|fetch| (key.clone(), fetch.clone())))
                .collect()
        };
        for (key, fetch) in targets {
            debug!(%key, "Refetching watched key");
            drop(self.request(key, fetch));
        }
    }

    /// Poll the accessor's key with the configured defaults.
    pub fn start_polling<T: DeserializeOwned>(&self, accessor: &ResourceAccessor<T>) {
        self.start_polling_with(accessor, self.config.poll.clone());
    }

    pub fn start_polling_with<T: DeserializeOwned>(
        &self,
        accessor: &ResourceAccessor<T>,
        config: PollConfig,
    ) {
        self.poller
            .start_polling_with(accessor.key().clone(), accessor.fetcher(), config);
    }

    pub fn stop_polling(&self, key: &ResourceKey) -> bool {
        self.poller.stop_polling(key)
    }

    pub fn poll_status(&self, key: &ResourceKey) -> Option<PollStatus> {
        self.poller.status(key)
    }

    pub fn entry(&self, key: &ResourceKey) -> Option<Entry> {
        self.store.get(key)
    }

    /// Drop unobserved entries past the configured retention.
    pub fn sweep(&self) -> usize {
        self.store.sweep(self.config.sweep_retention)
    }

    /// Sweep every `interval` on a background task, replacing any running
    /// janitor.
    ///
    /// # Panics
    /// - Must be called from within a tokio runtime
    pub fn spawn_janitor(&self, interval: Duration) {
        let store = self.store.clone();
        let retention = self.config.sweep_retention;
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = store.sweep(retention);
                        if removed > 0 {
                            debug!(removed, "Janitor swept entries");
                        }
                    }
                }
            }
        });

        let previous = self
            .janitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Janitor { cancel, task });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        info!(?interval, "Janitor started");
    }

    pub fn has_janitor(&self) -> bool {
        self.janitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|janitor| !janitor.task.is_finished())
    }

    /// Stop every poll loop and the janitor.
    pub fn shutdown(&self) {
        self.poller.stop_all();
        let janitor = self.janitor.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(janitor) = janitor {
            janitor.cancel.cancel();
            info!("Janitor stopped");
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidation::InvalidationGraph;
    use crate::mutation::CommitPolicy;
    use crate::retry::RetryConfig;
    use crate::store::EntryStatus;
    use lectern_common::{Error, ManualClock, MutationParams};
    use lectern_transport::{ApiRequest, MemoryTransport, SharedTransport, Transport};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Doc {
        id: i64,
        name: String,
    }

    fn config() -> SyncConfig {
        SyncConfig::default()
            .with_ttl(KeyPattern::parse("documents/*").unwrap(), Duration::from_secs(30))
            .with_ttl(KeyPattern::parse("quiz/#").unwrap(), Duration::from_secs(300))
            .with_invalidation(
                InvalidationGraph::new()
                    .with_rule(
                        "document.delete",
                        [
                            KeyPattern::parse("documents/{document_id}").unwrap(),
                            KeyPattern::parse("documents/{lecture_id:text}").unwrap(),
                        ],
                    )
                    .with_rule(
                        "document.update",
                        [KeyPattern::parse("documents/{document_id}").unwrap()],
                    ),
            )
    }

    fn client() -> (SyncClient, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (SyncClient::with_clock(config(), clock.clone()), clock)
    }

    fn lecture_docs(transport: &Arc<MemoryTransport>) -> ResourceAccessor<Vec<Doc>> {
        let transport: SharedTransport = transport.clone();
        ResourceAccessor::from_request(
            ResourceKey::new("documents").with("L1"),
            transport,
            ApiRequest::get("/api/documents/lecture/{lecture_id}").param("lecture_id", "L1"),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_invalidates_listing_and_refetches() {
        let (client, _clock) = client();
        let memory = Arc::new(MemoryTransport::new());
        let route = "GET /api/documents/lecture/L1";
        memory.enqueue(
            route,
            Ok(json!([{ "id": 1, "name": "A" }, { "id": 2, "name": "B" }])),
        );
        memory.respond(route, json!([{ "id": 2, "name": "B" }]));
        memory.respond("DELETE /api/documents/1", json!(null));
        let accessor = lecture_docs(&memory);

        let first = client.read(&accessor).await.unwrap();
        assert_eq!(first.len(), 2);
        let key = accessor.key().clone();
        assert!(client.policy().is_fresh(&client.entry(&key).unwrap(), client.store().now()));

        let transport: SharedTransport = memory.clone();
        let remote = async move {
            transport
                .perform(ApiRequest::delete("/api/documents/{id}").param("id", 1))
                .await
        };
        let outcome = client
            .mutate(
                MutationSpec::new(remote)
                    .with_target(ResourceKey::new("documents").with(1))
                    .with_commit_policy(CommitPolicy::RemoveTarget)
                    .with_invalidation(
                        "document.delete",
                        MutationParams::new()
                            .with("document_id", 1)
                            .with("lecture_id", "L1"),
                    ),
            )
            .await
            .unwrap();
        assert_eq!(outcome.invalidated, vec![key.clone()]);
        assert!(!client.policy().is_fresh(&client.entry(&key).unwrap(), client.store().now()));

        // Stale value is served once, then the refetch lands.
        let stale = client.read(&accessor).await.unwrap();
        assert_eq!(stale.len(), 2);
        settle().await;
        let refreshed = client.read(&accessor).await.unwrap();
        assert_eq!(refreshed, vec![Doc { id: 2, name: "B".to_string() }]);
        assert_eq!(memory.call_count(route), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reads_share_one_call() {
        let (client, _clock) = client();
        let memory = Arc::new(MemoryTransport::new().with_latency(Duration::from_millis(50)));
        memory.respond("POST /api/quiz/42", json!([{ "question": "2 + 2?" }]));
        let transport: SharedTransport = memory.clone();
        let accessor: ResourceAccessor<Vec<Value>> = ResourceAccessor::from_request(
            ResourceKey::new("quiz").with(42),
            transport,
            ApiRequest::post("/api/quiz/{id}").param("id", 42),
        );

        let (a, b) = tokio::join!(client.read(&accessor), client.read(&accessor));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(memory.call_count("POST /api/quiz/42"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_optimistic_update_reverts() {
        let (client, clock) = client();
        let key = ResourceKey::new("documents").with(7);
        client.store().put(
            &key,
            Arc::new(json!({ "id": 7, "name": "Old" })),
            clock.now(),
            Duration::from_secs(300),
        );
        let before = client.entry(&key).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _subscription = client.store().subscribers().subscribe(key.clone(), move |event| {
            if let Some(value) = &event.value {
                sink.lock().unwrap().push(value["name"].clone());
            }
        });

        let remote = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<Value, _>(Error::from_status(500, "boom"))
        };
        let result = client
            .mutate(
                MutationSpec::new(remote)
                    .with_target(key.clone())
                    .with_optimistic(|current| {
                        let mut doc = current.cloned()?;
                        doc["name"] = json!("New");
                        Some(doc)
                    }),
            )
            .await;

        assert!(matches!(result, Err(Error::Server { status: 500, .. })));
        assert_eq!(client.entry(&key).unwrap(), before);
        assert_eq!(*seen.lock().unwrap(), vec![json!("New"), json!("Old")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_survives_failures() {
        let (client, _clock) = client();
        let memory = Arc::new(MemoryTransport::new());
        memory.fail("GET /api/chat/health", Error::from_status(503, "down"));
        let transport: SharedTransport = memory.clone();
        let accessor: ResourceAccessor<Value> = ResourceAccessor::from_request(
            ResourceKey::new("health").with("chat"),
            transport,
            ApiRequest::get("/api/chat/health"),
        );

        client.start_polling_with(
            &accessor,
            PollConfig::new(Duration::from_millis(3000))
                .with_max_consecutive_failures(3)
                .with_retry(RetryConfig::none()),
        );
        let key = accessor.key().clone();
        for tick in 1..=3u32 {
            settle().await;
            assert_eq!(client.entry(&key).unwrap().status, EntryStatus::Error);
            assert_eq!(client.poll_status(&key).unwrap().consecutive_failures, tick);
            tokio::time::sleep(Duration::from_millis(3000)).await;
        }
        assert!(client.poller().is_polling(&key));
        assert!(client.stop_polling(&key));
        assert!(client.poll_status(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_read_returns_immediately_and_revalidates() {
        let (client, clock) = client();
        let memory = Arc::new(MemoryTransport::new().with_latency(Duration::from_millis(100)));
        memory.respond("GET /api/documents/lecture/L1", json!([{ "id": 3, "name": "C" }]));
        let accessor = lecture_docs(&memory);
        client.store().put(
            accessor.key(),
            Arc::new(json!([])),
            clock.now(),
            Duration::from_secs(30),
        );
        clock.advance(Duration::from_secs(31));

        let stale = client.read(&accessor).await.unwrap();
        assert!(stale.is_empty());
        assert!(client.coordinator().is_in_flight(accessor.key()));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let fresh = client.read(&accessor).await.unwrap();
        assert_eq!(fresh.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_forces_network() {
        let (client, _clock) = client();
        let memory = Arc::new(MemoryTransport::new());
        memory.respond("GET /api/documents/lecture/L1", json!([]));
        let accessor = lecture_docs(&memory);

        client.read(&accessor).await.unwrap();
        client.read(&accessor).await.unwrap();
        assert_eq!(memory.call_count("GET /api/documents/lecture/L1"), 1);
        client.fetch(&accessor).await.unwrap();
        assert_eq!(memory.call_count("GET /api/documents/lecture/L1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_surfaces_and_is_recorded() {
        let (client, _clock) = client();
        let memory = Arc::new(MemoryTransport::new());
        memory.fail("GET /api/documents/lecture/L1", Error::from_status(404, "missing"));
        let accessor = lecture_docs(&memory);

        let result = client.read(&accessor).await;
        assert!(matches!(result, Err(Error::Client { status: 404, .. })));
        let entry = client.entry(accessor.key()).unwrap();
        assert_eq!(entry.status, EntryStatus::Error);
        assert!(entry.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_fetches_and_refetches_on_invalidate() {
        let (client, _clock) = client();
        let memory = Arc::new(MemoryTransport::new());
        memory.respond("GET /api/documents/lecture/L1", json!([]));
        let accessor = lecture_docs(&memory);

        let events = Arc::new(AtomicUsize::new(0));
        let counter = events.clone();
        let subscription = client.watch(&accessor, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        settle().await;
        assert_eq!(memory.call_count("GET /api/documents/lecture/L1"), 1);
        assert!(events.load(Ordering::SeqCst) > 0);

        let invalidated = client.invalidate(&KeyPattern::parse("documents/*").unwrap());
        assert_eq!(invalidated, vec![accessor.key().clone()]);
        settle().await;
        assert_eq!(memory.call_count("GET /api/documents/lecture/L1"), 2);

        subscription.unsubscribe();
        client.invalidate(&KeyPattern::parse("documents/*").unwrap());
        settle().await;
        assert_eq!(memory.call_count("GET /api/documents/lecture/L1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_without_watchers_does_not_refetch() {
        let (client, clock) = client();
        let memory = Arc::new(MemoryTransport::new());
        let key = ResourceKey::new("documents").with(7);
        client
            .store()
            .put(&key, Arc::new(json!({ "id": 7 })), clock.now(), Duration::from_secs(300));

        let outcome = client
            .mutate(
                MutationSpec::new(async { Ok::<_, Error>(json!({ "id": 7, "name": "Renamed" })) })
                    .with_target(key.clone())
                    .with_invalidation(
                        "document.update",
                        MutationParams::new().with("document_id", 7),
                    ),
            )
            .await
            .unwrap();
        settle().await;
        assert_eq!(outcome.value["name"], "Renamed");
        assert_eq!(client.entry(&key).unwrap().value, Some(outcome.value));
        assert!(memory.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_janitor_sweeps_and_shutdown_stops_it() {
        let (client, clock) = client();
        let key = ResourceKey::new("quiz").with(1);
        client
            .store()
            .put(&key, Arc::new(json!([])), clock.now(), Duration::ZERO);
        clock.advance(client.config().sweep_retention + Duration::from_secs(1));

        client.spawn_janitor(Duration::from_secs(60));
        assert!(client.has_janitor());
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(client.entry(&key).is_none());

        client.shutdown();
        settle().await;
        assert!(!client.has_janitor());
    }

    #[tokio::test]
    async fn test_sweep_keeps_watched_entries() {
        let (client, clock) = client();
        let key = ResourceKey::new("quiz").with(2);
        client
            .store()
            .put(&key, Arc::new(json!([])), clock.now(), Duration::ZERO);
        let _subscription = client.store().subscribers().subscribe(key.clone(), |_| {});
        clock.advance(Duration::from_secs(3600));
        assert_eq!(client.sweep(), 0);
        assert!(client.entry(&key).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_mutations_on_one_key_keep_submission_order() {
        let client = Arc::new(SyncClient::new(config()));
        let order = Arc::new(Mutex::new(Vec::new()));
        let rename = |name: &'static str| {
            let order = order.clone();
            MutationSpec::new(async move {
                order.lock().unwrap().push(name);
                Ok(json!({ "id": 7, "name": name }))
            })
            .with_target(ResourceKey::new("documents").with(7))
            .with_optimistic(move |_| Some(json!({ "id": 7, "name": name })))
        };
        let (first, second) = (rename("first"), rename("second"));

        let runner = client.clone();
        let (a, b) = tokio::spawn(async move {
            tokio::join!(runner.mutate(first), runner.mutate(second))
        })
        .await
        .unwrap();

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        let entry = client.entry(&ResourceKey::new("documents").with(7)).unwrap();
        assert_eq!(entry.value.unwrap()["name"], "second");
    }
}
