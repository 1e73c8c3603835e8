//! Cache store: the single owner of every cached entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::debug;

use lectern_common::clock::add_duration;
use lectern_common::{Clock, Error, KeyPattern, ResourceKey};

use crate::subscribers::{CacheEvent, EventKind, SubscriberRegistry};

/// Lifecycle of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Known key, never fetched.
    Idle,
    /// A fetch is outstanding.
    Loading,
    /// Last fetch succeeded.
    Success,
    /// Last fetch failed; any previous value is kept.
    Error,
}

/// Cached state of one resource key.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: ResourceKey,
    pub value: Option<Arc<Value>>,
    pub fetched_at: Option<DateTime<Utc>>,
    /// Instant after which the value is stale. Only meaningful while the
    /// status is `Success`; kept on error so stale values stay displayable.
    pub stale_at: Option<DateTime<Utc>>,
    pub status: EntryStatus,
    pub last_error: Option<Error>,
    pub created_at: DateTime<Utc>,
}

impl Entry {
    fn new(key: ResourceKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            value: None,
            fetched_at: None,
            stale_at: None,
            status: EntryStatus::Idle,
            last_error: None,
            created_at: now,
        }
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    fn event(&self, kind: EventKind) -> CacheEvent {
        CacheEvent {
            key: self.key.clone(),
            kind,
            status: self.status,
            value: self.value.clone(),
        }
    }

    /// Point after which an unobserved entry may be swept.
    fn expires_at(&self, retention: Duration) -> DateTime<Utc> {
        add_duration(self.stale_at.unwrap_or(self.created_at), retention)
    }
}

/// Exact capture of an entry, or of its absence.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot(Option<Entry>);

impl Snapshot {
    pub fn entry(&self) -> Option<&Entry> {
        self.0.as_ref()
    }
}

/// Keyed store of cache entries.
///
/// All writes happen in one short critical section; listeners are notified
/// after the lock is released.
pub struct CacheStore {
    entries: RwLock<HashMap<ResourceKey, Entry>>,
    subscribers: SubscriberRegistry,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_subscribers(clock, SubscriberRegistry::new())
    }

    pub fn with_subscribers(clock: Arc<dyn Clock>, subscribers: SubscriberRegistry) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            subscribers,
            clock,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ResourceKey, Entry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ResourceKey, Entry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, events: Vec<CacheEvent>) {
        for event in &events {
            self.subscribers.notify(event);
        }
    }

    pub fn subscribers(&self) -> &SubscriberRegistry {
        &self.subscribers
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Pure lookup; never fetches.
    pub fn get(&self, key: &ResourceKey) -> Option<Entry> {
        self.read().get(key).cloned()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// All keys currently stored.
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.read().keys().cloned().collect()
    }

    /// Stored keys matching `pattern`.
    pub fn keys_matching(&self, pattern: &KeyPattern) -> Vec<ResourceKey> {
        self.read()
            .keys()
            .filter(|key| pattern.matches(key))
            .cloned()
            .collect()
    }

    /// Write a fresh value.
    ///
    /// # Postconditions
    /// - `status = Success`, `stale_at = fetched_at + ttl`, no last error
    pub fn put(
        &self,
        key: &ResourceKey,
        value: Arc<Value>,
        fetched_at: DateTime<Utc>,
        ttl: Duration,
    ) {
        let event = {
            let now = self.now();
            let mut entries = self.write();
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| Entry::new(key.clone(), now));
            entry.value = Some(value);
            entry.fetched_at = Some(fetched_at);
            entry.stale_at = Some(add_duration(fetched_at, ttl));
            entry.status = EntryStatus::Success;
            entry.last_error = None;
            entry.event(EventKind::Updated)
        };
        self.emit(vec![event]);
    }

    /// Transition the status without touching the value.
    ///
    /// Creates an empty entry when the key is unknown. `Error` records
    /// `error`; `Idle` and `Success` clear the last error; `Loading` keeps it.
    pub fn set_status(&self, key: &ResourceKey, status: EntryStatus, error: Option<Error>) {
        let event = {
            let now = self.now();
            let mut entries = self.write();
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| Entry::new(key.clone(), now));
            entry.status = status;
            match status {
                EntryStatus::Error => entry.last_error = error,
                EntryStatus::Idle | EntryStatus::Success => entry.last_error = None,
                EntryStatus::Loading => {}
            }
            entry.event(EventKind::StatusChanged)
        };
        self.emit(vec![event]);
    }

    /// Undo the `Loading` transition of a fetch whose result was discarded.
    ///
    /// Does nothing unless the entry is still `Loading`. Nobody is notified:
    /// the callers that wanted the result are gone.
    pub(crate) fn revert_loading(&self, key: &ResourceKey, status: EntryStatus, error: Option<Error>) {
        let mut entries = self.write();
        if let Some(entry) = entries
            .get_mut(key)
            .filter(|entry| entry.status == EntryStatus::Loading)
        {
            entry.status = status;
            entry.last_error = error;
        }
    }

    /// Mark every entry matching `pattern` stale.
    ///
    /// Values are never deleted and `stale_at` never moves forward.
    /// Returns the affected keys.
    pub fn invalidate(&self, pattern: &KeyPattern) -> Vec<ResourceKey> {
        let events: Vec<CacheEvent> = {
            let now = self.now();
            let mut entries = self.write();
            entries
                .values_mut()
                .filter(|entry| pattern.matches(&entry.key))
                .map(|entry| {
                    if let Some(stale_at) = entry.stale_at {
                        entry.stale_at = Some(stale_at.min(now));
                    }
                    entry.event(EventKind::Invalidated)
                })
                .collect()
        };

        let keys: Vec<ResourceKey> = events.iter().map(|event| event.key.clone()).collect();
        debug!(%pattern, count = keys.len(), "Invalidated entries");
        self.emit(events);
        keys
    }

    /// Capture the entry at `key` (or its absence).
    pub fn snapshot(&self, key: &ResourceKey) -> Snapshot {
        Snapshot(self.get(key))
    }

    /// Put back what `snapshot` captured.
    ///
    /// A captured `Loading` status is not restored, since the fetch behind it
    /// may have settled meanwhile: the entry comes back as `Success` when it
    /// holds a value (keeping its `stale_at`) and `Idle` otherwise.
    pub fn restore(&self, key: &ResourceKey, snapshot: Snapshot) {
        let event = {
            let mut entries = self.write();
            match snapshot.0 {
                Some(mut entry) => {
                    if entry.status == EntryStatus::Loading {
                        entry.status = if entry.value.is_some() {
                            EntryStatus::Success
                        } else {
                            EntryStatus::Idle
                        };
                        entry.last_error = None;
                    }
                    let event = entry.event(EventKind::Restored);
                    entries.insert(key.clone(), entry);
                    event
                }
                None => {
                    entries.remove(key);
                    CacheEvent {
                        key: key.clone(),
                        kind: EventKind::Restored,
                        status: EntryStatus::Idle,
                        value: None,
                    }
                }
            }
        };
        self.emit(vec![event]);
    }

    /// Drop the entry at `key`.
    pub fn remove(&self, key: &ResourceKey) -> Option<Entry> {
        let removed = self.write().remove(key);
        if removed.is_some() {
            self.emit(vec![CacheEvent {
                key: key.clone(),
                kind: EventKind::Removed,
                status: EntryStatus::Idle,
                value: None,
            }]);
        }
        removed
    }

    /// Remove entries nobody observes whose retention has passed.
    ///
    /// Loading entries and entries with live subscribers are kept. Returns
    /// the number of removed entries.
    pub fn sweep(&self, retention: Duration) -> usize {
        let watched: HashSet<ResourceKey> = self.subscribers.watched_keys().into_iter().collect();
        let now = self.now();

        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|key, entry| {
            entry.status == EntryStatus::Loading
                || watched.contains(key)
                || entry.expires_at(retention) > now
        });
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Swept unused entries");
        }
        removed
    }
}
