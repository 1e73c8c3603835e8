//! Mutation executor: optimistic patch, remote write, commit or rollback.
//!
//! A mutation moves through `Pending -> (OptimisticApplied)? -> Sent ->
//! Committed | RolledBack`. Mutations that target the same key run one at
//! a time in submission order; each captures its rollback snapshot only
//! after the previous one has settled.

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use lectern_common::{Error, KeyPattern, MutationParams, ResourceKey, Result};

use crate::invalidation::InvalidationGraph;
use crate::staleness::StalenessPolicy;
use crate::store::{CacheStore, Snapshot};

/// Computes the optimistic value from the current one. Returning `None`
/// skips the optimistic write.
pub type OptimisticPatch = Box<dyn FnOnce(Option<&Value>) -> Option<Value> + Send>;

/// What to do with the target entry once the server accepted the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitPolicy {
    /// Store the server response at the target (the server value wins).
    #[default]
    StoreResponse,
    /// Drop the target entry.
    RemoveTarget,
    /// Leave the target as it is (optimistic value included).
    Ignore,
}

/// Phase of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationPhase {
    Pending,
    OptimisticApplied,
    Sent,
    Committed,
    RolledBack,
}

/// Description of one remote write.
pub struct MutationSpec {
    pub target: Option<ResourceKey>,
    pub remote: BoxFuture<'static, Result<Value>>,
    pub optimistic: Option<OptimisticPatch>,
    pub invalidation: Option<(String, MutationParams)>,
    pub on_commit: CommitPolicy,
    pub timeout: Option<Duration>,
}

impl MutationSpec {
    /// Spec that performs `remote` and nothing else.
    pub fn new<Fut>(remote: Fut) -> Self
    where
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            target: None,
            remote: remote.boxed(),
            optimistic: None,
            invalidation: None,
            on_commit: CommitPolicy::default(),
            timeout: None,
        }
    }

    pub fn with_target(mut self, key: ResourceKey) -> Self {
        self.target = Some(key);
        self
    }

    pub fn with_optimistic<F>(mut self, patch: F) -> Self
    where
        F: FnOnce(Option<&Value>) -> Option<Value> + Send + 'static,
    {
        self.optimistic = Some(Box::new(patch));
        self
    }

    pub fn with_invalidation(mut self, class: impl Into<String>, params: MutationParams) -> Self {
        self.invalidation = Some((class.into(), params));
        self
    }

    pub fn with_commit_policy(mut self, policy: CommitPolicy) -> Self {
        self.on_commit = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for MutationSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationSpec")
            .field("target", &self.target)
            .field("optimistic", &self.optimistic.is_some())
            .field("invalidation", &self.invalidation)
            .field("on_commit", &self.on_commit)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Bookkeeping for one `execute` call.
#[derive(Debug, Clone)]
pub struct MutationRecord {
    pub id: Uuid,
    pub target: Option<ResourceKey>,
    pub previous: Option<Snapshot>,
    pub optimistic_value: Option<Arc<Value>>,
    pub phase: MutationPhase,
}

impl MutationRecord {
    fn new(target: Option<ResourceKey>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            previous: None,
            optimistic_value: None,
            phase: MutationPhase::Pending,
        }
    }

    fn advance(&mut self, phase: MutationPhase) {
        debug!(id = %self.id, from = ?self.phase, to = ?phase, "Mutation phase");
        self.phase = phase;
    }
}

/// Result of a committed mutation.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub id: Uuid,
    /// The server response.
    pub value: Arc<Value>,
    /// Keys marked stale by the invalidation graph.
    pub invalidated: Vec<ResourceKey>,
}

type Queues = Arc<Mutex<HashMap<ResourceKey, (u64, oneshot::Receiver<()>)>>>;

/// A mutation's place in its target's queue, taken at submission.
///
/// The ticket waits for the one submitted before it; dropping it releases
/// the next one.
struct Ticket {
    queues: Queues,
    key: ResourceKey,
    seq: u64,
    previous: Option<oneshot::Receiver<()>>,
    _done: oneshot::Sender<()>,
}

impl Ticket {
    fn reserve(queues: &Queues, key: &ResourceKey, seq: u64) -> Self {
        let (done, released) = oneshot::channel();
        let previous = queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), (seq, released))
            .map(|(_, previous)| previous);
        Self {
            queues: queues.clone(),
            key: key.clone(),
            seq,
            previous,
            _done: done,
        }
    }

    async fn wait_turn(&mut self) {
        if let Some(previous) = self.previous.take() {
            // A dropped sender means the previous mutation is done as well.
            let _ = previous.await;
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        if queues.get(&self.key).is_some_and(|(seq, _)| *seq == self.seq) {
            queues.remove(&self.key);
        }
    }
}

/// Runs mutations against the store.
pub struct MutationExecutor {
    store: Arc<CacheStore>,
    policy: Arc<StalenessPolicy>,
    graph: Arc<InvalidationGraph>,
    queues: Queues,
    next_seq: AtomicU64,
    default_timeout: Duration,
}

impl MutationExecutor {
    pub fn new(
        store: Arc<CacheStore>,
        policy: Arc<StalenessPolicy>,
        graph: Arc<InvalidationGraph>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            store,
            policy,
            graph,
            queues: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
            default_timeout,
        }
    }

    pub fn graph(&self) -> &Arc<InvalidationGraph> {
        &self.graph
    }

    /// Number of targets with a running or queued mutation.
    pub fn pending_targets(&self) -> usize {
        self.queues.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Submit one mutation.
    ///
    /// Validation and the place in the target's queue happen before this
    /// returns, so mutations on one key run in the order `execute` was
    /// called. The mutation itself runs on its own task: dropping the
    /// returned future neither cancels it nor skips its rollback.
    ///
    /// # Errors
    /// - `InvalidInput` before anything is sent when an optimistic patch has
    ///   no target or the invalidation parameters are incomplete
    /// - The remote error (a timeout is a `Network` error), after rollback
    ///
    /// # Panics
    /// - Must be called from within a tokio runtime
    pub fn execute(
        self: &Arc<Self>,
        spec: MutationSpec,
    ) -> BoxFuture<'static, Result<MutationOutcome>> {
        if spec.optimistic.is_some() && spec.target.is_none() {
            return futures::future::ready(Err(Error::InvalidInput(
                "Optimistic update requires a target key".to_string(),
            )))
            .boxed();
        }
        let patterns = match &spec.invalidation {
            Some((class, params)) => match self.graph.resolve(class, params) {
                Ok(patterns) => patterns,
                Err(err) => return futures::future::ready(Err(err)).boxed(),
            },
            None => Vec::new(),
        };

        let ticket = spec.target.as_ref().map(|key| {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            Ticket::reserve(&self.queues, key, seq)
        });
        let executor = self.clone();
        let task = tokio::spawn(async move { executor.run(spec, patterns, ticket).await });

        async move {
            task.await
                .map_err(|e| Error::Network(format!("Mutation task failed: {}", e)))?
        }
        .boxed()
    }

    async fn run(
        &self,
        spec: MutationSpec,
        patterns: Vec<KeyPattern>,
        mut ticket: Option<Ticket>,
    ) -> Result<MutationOutcome> {
        let MutationSpec {
            target,
            remote,
            optimistic,
            on_commit,
            timeout,
            ..
        } = spec;
        let mut record = MutationRecord::new(target.clone());

        if let Some(ticket) = ticket.as_mut() {
            ticket.wait_turn().await;
        }

        if let (Some(key), Some(patch)) = (&target, optimistic) {
            let snapshot = self.store.snapshot(key);
            let current = snapshot.entry().and_then(|entry| entry.value.clone());
            if let Some(value) = patch(current.as_deref()) {
                let value = Arc::new(value);
                self.store.put(
                    key,
                    value.clone(),
                    self.store.now(),
                    self.policy.ttl_for(key),
                );
                record.previous = Some(snapshot);
                record.optimistic_value = Some(value);
                record.advance(MutationPhase::OptimisticApplied);
            }
        }

        record.advance(MutationPhase::Sent);
        let timeout = timeout.unwrap_or(self.default_timeout);
        let result = match tokio::time::timeout(timeout, remote).await {
            Ok(result) => result,
            Err(_) => Err(Error::Network(format!(
                "Mutation timed out after {:?}",
                timeout
            ))),
        };

        match result {
            Ok(value) => {
                let value = Arc::new(value);
                if let Some(key) = &target {
                    match on_commit {
                        CommitPolicy::StoreResponse => self.store.put(
                            key,
                            value.clone(),
                            self.store.now(),
                            self.policy.ttl_for(key),
                        ),
                        CommitPolicy::RemoveTarget => {
                            self.store.remove(key);
                        }
                        CommitPolicy::Ignore => {}
                    }
                }

                let mut invalidated = BTreeSet::new();
                for pattern in &patterns {
                    invalidated.extend(self.store.invalidate(pattern));
                }
                record.previous = None;
                record.advance(MutationPhase::Committed);
                debug!(
                    id = %record.id,
                    invalidated = invalidated.len(),
                    "Mutation committed"
                );

                Ok(MutationOutcome {
                    id: record.id,
                    value,
                    invalidated: invalidated.into_iter().collect(),
                })
            }
            Err(err) => {
                if let (Some(key), Some(snapshot)) = (&target, record.previous.take()) {
                    self.store.restore(key, snapshot);
                }
                record.advance(MutationPhase::RolledBack);
                warn!(id = %record.id, error = %err, "Mutation rolled back");
                Err(err)
            }
        }
    }
}
