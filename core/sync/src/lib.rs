//! Lectern Sync Engine
//!
//! Keeps a client's local view of server-owned resources consistent with the
//! backend:
//! - Keyed cache with per-entry status and staleness
//! - Single-flight fetching shared by concurrent callers
//! - Optimistic mutations with rollback and cascading invalidation
//! - Fixed-interval polling with retry and backoff

pub mod accessor;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod invalidation;
pub mod mutation;
pub mod poller;
pub mod retry;
pub mod staleness;
pub mod store;
pub mod subscribers;

// Re-export main types
pub use accessor::{FetchFn, ResourceAccessor};
pub use client::SyncClient;
pub use config::SyncConfig;
pub use coordinator::{FetchCoordinator, FetchResult, RequestOptions};
pub use invalidation::InvalidationGraph;
pub use mutation::{
    CommitPolicy, MutationExecutor, MutationOutcome, MutationPhase, MutationRecord, MutationSpec,
    OptimisticPatch,
};
pub use poller::{PollConfig, PollStatus, Poller};
pub use retry::{RetryConfig, RetryExecutor};
pub use staleness::{StalenessPolicy, TtlRule};
pub use store::{CacheStore, Entry, EntryStatus, Snapshot};
pub use subscribers::{CacheEvent, EventKind, SubscriberRegistry, Subscription};
