//! Transport trait definition.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use lectern_common::Result;

use crate::request::ApiRequest;

/// Transport for issuing backend calls.
///
/// Implementations own URL construction, body encoding, authentication
/// headers and status mapping. The sync core only sees decoded JSON.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get the transport name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Perform one request.
    ///
    /// # Postconditions
    /// - Returns the decoded response body (`Null` for an empty body)
    ///
    /// # Errors
    /// - `Client` for 4xx and `Server` for 5xx responses
    /// - `Network` for connection failures and timeouts
    /// - `Parse` when the body is not valid JSON
    /// - `InvalidInput` when the request cannot be built
    async fn perform(&self, request: ApiRequest) -> Result<Value>;

    /// Perform one request and return the raw response body.
    ///
    /// # Errors
    /// - Same status and network mapping as [`Transport::perform`]
    async fn download(&self, request: ApiRequest) -> Result<Vec<u8>>;
}

/// Transport shared between accessors and mutations.
pub type SharedTransport = Arc<dyn Transport>;

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn perform(&self, request: ApiRequest) -> Result<Value> {
        (**self).perform(request).await
    }

    async fn download(&self, request: ApiRequest) -> Result<Vec<u8>> {
        (**self).download(request).await
    }
}
