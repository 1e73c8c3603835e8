//! Fetch contract between the sync core and the backend.
//!
//! This crate provides:
//! - The `Transport` trait the sync core fetches and mutates through
//! - `ApiRequest`, a backend-agnostic description of one call
//! - `HttpTransport`, the reqwest-backed implementation
//! - `MemoryTransport`, a scripted implementation for tests and demos

pub mod http;
pub mod memory;
pub mod request;
pub mod transport;

pub use http::{HttpConfig, HttpTransport};
pub use memory::{MemoryTransport, RecordedCall};
pub use request::{ApiRequest, FormPart, Method, RequestBody};
pub use transport::{SharedTransport, Transport};
