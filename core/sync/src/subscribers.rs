//! Subscriber registry: change notification for cache entries.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use lectern_common::ResourceKey;

use crate::store::EntryStatus;

/// What happened to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A new value was written.
    Updated,
    /// Status changed without touching the value.
    StatusChanged,
    /// The entry was marked stale.
    Invalidated,
    /// The entry was rolled back to a snapshot.
    Restored,
    /// The entry was dropped from the store.
    Removed,
}

/// Notification delivered to listeners.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub key: ResourceKey,
    pub kind: EventKind,
    /// Status after the change (`Idle` when the entry no longer exists).
    pub status: EntryStatus,
    /// Value after the change.
    pub value: Option<Arc<Value>>,
}

type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<ResourceKey, Vec<(u64, Listener)>>,
}

impl Registry {
    fn contains(&self, key: &ResourceKey, id: u64) -> bool {
        self.listeners
            .get(key)
            .is_some_and(|listeners| listeners.iter().any(|(lid, _)| *lid == id))
    }

    fn remove(&mut self, key: &ResourceKey, id: u64) {
        if let Some(listeners) = self.listeners.get_mut(key) {
            listeners.retain(|(lid, _)| *lid != id);
            if listeners.is_empty() {
                self.listeners.remove(key);
            }
        }
    }
}

/// Registry of per-key listeners.
///
/// Listeners run on the notifying thread, outside every internal lock, so
/// they may call back into the store or subscribe and unsubscribe freely.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `listener` for changes to `key`.
    ///
    /// The listener stays registered until the returned subscription is
    /// unsubscribed or dropped.
    pub fn subscribe<F>(&self, key: ResourceKey, listener: F) -> Subscription
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .listeners
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(listener)));

        Subscription {
            key,
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live listeners for `key`.
    pub fn subscriber_count(&self, key: &ResourceKey) -> usize {
        self.lock().listeners.get(key).map_or(0, Vec::len)
    }

    /// Keys with at least one live listener.
    pub fn watched_keys(&self) -> Vec<ResourceKey> {
        self.lock().listeners.keys().cloned().collect()
    }

    /// Deliver `event` to every listener of its key.
    pub fn notify(&self, event: &CacheEvent) {
        let listeners: Vec<(u64, Listener)> = match self.lock().listeners.get(&event.key) {
            Some(listeners) => listeners.clone(),
            None => return,
        };

        for (id, listener) in listeners {
            // An earlier listener may have unsubscribed this one.
            if self.lock().contains(&event.key, id) {
                listener(event);
            }
        }
    }
}

/// Handle of one registered listener.
#[must_use = "dropping a subscription unsubscribes its listener"]
pub struct Subscription {
    key: ResourceKey,
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Key this subscription observes.
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Remove the listener. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.key, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(key: &ResourceKey) -> CacheEvent {
        CacheEvent {
            key: key.clone(),
            kind: EventKind::Updated,
            status: EntryStatus::Success,
            value: None,
        }
    }

    #[test]
    fn test_notify_reaches_key_listeners_only() {
        let registry = SubscriberRegistry::new();
        let quiz = ResourceKey::new("quiz").with(42);
        let summary = ResourceKey::new("summary").with(42);
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let _sub = registry.subscribe(quiz.clone(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.notify(&event(&quiz));
        registry.notify(&event(&summary));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let registry = SubscriberRegistry::new();
        let key = ResourceKey::new("documents");
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let sub = registry.subscribe(key.clone(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(registry.subscriber_count(&key), 1);

        sub.unsubscribe();
        registry.notify(&event(&key));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(registry.subscriber_count(&key), 0);
        assert!(registry.watched_keys().is_empty());
    }

    #[test]
    fn test_listener_unsubscribed_mid_notify_is_skipped() {
        let registry = SubscriberRegistry::new();
        let key = ResourceKey::new("lectures");
        let second_hits = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let to_drop = slot.clone();
        let _first = registry.subscribe(key.clone(), move |_| {
            to_drop.lock().unwrap().take();
        });
        let counter = second_hits.clone();
        let second = registry.subscribe(key.clone(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        *slot.lock().unwrap() = Some(second);

        registry.notify(&event(&key));
        assert_eq!(second_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_may_subscribe_during_notify() {
        let registry = SubscriberRegistry::new();
        let key = ResourceKey::new("health").with("chat");
        let nested: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));

        let inner_registry = registry.clone();
        let inner_key = key.clone();
        let holder = nested.clone();
        let _sub = registry.subscribe(key.clone(), move |_| {
            let sub = inner_registry.subscribe(inner_key.clone(), |_| {});
            holder.lock().unwrap().push(sub);
        });

        registry.notify(&event(&key));
        assert_eq!(registry.subscriber_count(&key), 2);
    }
}
