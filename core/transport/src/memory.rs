//! In-memory transport for testing.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lectern_common::{Error, Result};

use crate::request::ApiRequest;
use crate::transport::Transport;

type Handler = Arc<dyn Fn(&ApiRequest) -> Result<Value> + Send + Sync>;

/// Scripted responses for one route.
#[derive(Default)]
struct Route {
    /// One-shot responses consumed in order before the handler.
    queued: VecDeque<Result<Value>>,
    handler: Option<Handler>,
}

/// A call observed by the memory transport.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// `METHOD /resolved/path`.
    pub route: String,
    pub request: ApiRequest,
}

/// In-memory transport.
///
/// Routes are matched on `METHOD /resolved/path` (query excluded). Unknown
/// routes answer with a 404 client error. All data is lost on drop.
#[derive(Default)]
pub struct MemoryTransport {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<RecordedCall>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryTransport {
    /// Create a transport with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response by `latency` (uses tokio time).
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(Some(latency));
        self
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Serve `data` as the raw body of `route` for downloads.
    pub fn serve(&self, route: &str, data: Vec<u8>) {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(route.to_string(), data);
    }

    /// Always answer `route` with `value`.
    pub fn respond(&self, route: &str, value: Value) {
        self.respond_with(route, move |_| Ok(value.clone()));
    }

    /// Always answer `route` with `error`.
    pub fn fail(&self, route: &str, error: Error) {
        self.respond_with(route, move |_| Err(error.clone()));
    }

    /// Answer `route` by calling `handler`.
    pub fn respond_with<F>(&self, route: &str, handler: F)
    where
        F: Fn(&ApiRequest) -> Result<Value> + Send + Sync + 'static,
    {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.entry(route.to_string()).or_default().handler = Some(Arc::new(handler));
    }

    /// Queue a one-shot response for `route`.
    pub fn enqueue(&self, route: &str, response: Result<Value>) {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes
            .entry(route.to_string())
            .or_default()
            .queued
            .push_back(response);
    }

    /// Every call performed so far, oldest first.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of calls made to `route`.
    pub fn call_count(&self, route: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|call| call.route == route)
            .count()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Log the call and apply the configured latency.
    async fn record(&self, request: &ApiRequest) -> Result<String> {
        let route = request.route()?;
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedCall {
                route: route.clone(),
                request: request.clone(),
            });

        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(route)
    }

    fn answer(&self, route: &str, request: &ApiRequest) -> Result<Value> {
        let handler = {
            let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
            match routes.get_mut(route) {
                Some(scripted) => {
                    if let Some(response) = scripted.queued.pop_front() {
                        return response;
                    }
                    scripted.handler.clone()
                }
                None => None,
            }
        };

        match handler {
            Some(handler) => handler(request),
            None => Err(Error::Client {
                status: 404,
                message: format!("No route for {}", route),
            }),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn perform(&self, request: ApiRequest) -> Result<Value> {
        let route = self.record(&request).await?;
        self.answer(&route, &request)
    }

    async fn download(&self, request: ApiRequest) -> Result<Vec<u8>> {
        let route = self.record(&request).await?;
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&route)
            .cloned()
            .ok_or_else(|| Error::Client {
                status: 404,
                message: format!("No file for {}", route),
            })
    }
}
