//! Typed, per-call-site view of one cached resource.

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use lectern_common::{Error, ResourceKey, Result};
use lectern_transport::{ApiRequest, SharedTransport, Transport};

/// Type-erased fetch function producing the raw JSON of a resource.
pub type FetchFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A resource key paired with the function that fetches it.
///
/// The cache stores raw JSON; `T` is only the shape a call site expects.
/// Two accessors with the same key share one cache slot.
pub struct ResourceAccessor<T> {
    key: ResourceKey,
    fetch: FetchFn,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ResourceAccessor<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            fetch: self.fetch.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ResourceAccessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceAccessor")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl<T: DeserializeOwned> ResourceAccessor<T> {
    pub fn new<F, Fut>(key: ResourceKey, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            key,
            fetch: Arc::new(move || fetch().boxed()),
            _marker: PhantomData,
        }
    }

    /// Accessor that performs `request` on `transport`.
    pub fn from_request(key: ResourceKey, transport: SharedTransport, request: ApiRequest) -> Self {
        Self::new(key, move || {
            let transport = transport.clone();
            let request = request.clone();
            async move { transport.perform(request).await }
        })
    }

    /// Post-process the raw response before it is cached.
    pub fn map_raw<F>(self, transform: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        let inner = self.fetch;
        let transform = Arc::new(transform);
        Self {
            key: self.key,
            fetch: Arc::new(move || {
                let transform = transform.clone();
                let pending = inner();
                async move { transform(pending.await?) }.boxed()
            }),
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// The type-erased fetch function.
    pub fn fetcher(&self) -> FetchFn {
        self.fetch.clone()
    }

    /// Start one raw fetch, bypassing the cache.
    pub fn fetch_raw(&self) -> BoxFuture<'static, Result<Value>> {
        (self.fetch)()
    }

    /// Decode a cached value into `T`.
    ///
    /// # Errors
    /// - `Parse` when the value does not have the expected shape
    pub fn decode(&self, value: &Value) -> Result<T> {
        T::deserialize(value).map_err(|e| {
            Error::Parse(format!("Unexpected shape for {}: {}", self.key, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lectern_transport::MemoryTransport;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Lecture {
        id: i64,
        name: String,
    }

    #[test]
    fn test_decode() {
        let accessor: ResourceAccessor<Lecture> =
            ResourceAccessor::new(ResourceKey::new("lectures").with(1), || async {
                Ok(json!(null))
            });
        let lecture = accessor.decode(&json!({ "id": 1, "name": "Algebra" })).unwrap();
        assert_eq!(lecture, Lecture { id: 1, name: "Algebra".to_string() });
    }

    #[test]
    fn test_decode_failure_is_parse_error() {
        let accessor: ResourceAccessor<Vec<Lecture>> =
            ResourceAccessor::new(ResourceKey::new("lectures"), || async { Ok(json!(null)) });
        let result = accessor.decode(&json!({ "unexpected": true }));
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn test_from_request_uses_transport() {
        let memory = Arc::new(MemoryTransport::new());
        memory.respond("GET /api/lectures/1", json!({ "id": 1, "name": "Algebra" }));
        let transport: SharedTransport = memory.clone();

        let accessor: ResourceAccessor<Lecture> = ResourceAccessor::from_request(
            ResourceKey::new("lectures").with(1),
            transport,
            ApiRequest::get("/api/lectures/{id}").param("id", 1),
        );
        let raw = accessor.fetch_raw().await.unwrap();
        assert_eq!(accessor.decode(&raw).unwrap().name, "Algebra");
        assert_eq!(memory.call_count("GET /api/lectures/1"), 1);
        assert_eq!(memory.name(), "memory");
    }

    #[tokio::test]
    async fn test_map_raw() {
        let accessor: ResourceAccessor<Vec<String>> =
            ResourceAccessor::new(ResourceKey::new("conversation").with(7), || async {
                Ok(json!({ "id": 7, "conversation": ["hi"] }))
            })
            .map_raw(|document| Ok(document["conversation"].clone()));

        let raw = accessor.fetch_raw().await.unwrap();
        assert_eq!(accessor.decode(&raw).unwrap(), vec!["hi".to_string()]);
    }
}
