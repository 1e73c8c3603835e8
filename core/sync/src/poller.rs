//! Fixed-interval polling of health and status keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lectern_common::{Error, ResourceKey, Result};

use crate::accessor::FetchFn;
use crate::config::duration_ms;
use crate::coordinator::{FetchCoordinator, RequestOptions};
use crate::retry::{RetryConfig, RetryExecutor};

/// Polling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// Failed ticks in a row before the key enters persistent-error mode.
    pub max_consecutive_failures: u32,
    /// Retry applied inside one tick.
    pub retry: RetryConfig,
}

impl PollConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(3000),
            max_consecutive_failures: 3,
            retry: RetryConfig::default(),
        }
    }
}

/// Observable state of one poll loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollStatus {
    pub ticks: u64,
    pub consecutive_failures: u32,
    /// Set once `max_consecutive_failures` is reached, cleared by a success.
    pub persistent_error: bool,
    pub last_error: Option<Error>,
    pub last_success: Option<DateTime<Utc>>,
}

struct PollLoop {
    cancel: CancellationToken,
    status: Arc<Mutex<PollStatus>>,
    task: JoinHandle<()>,
}

/// Owner of every running poll loop.
pub struct Poller {
    coordinator: Arc<FetchCoordinator>,
    loops: Mutex<HashMap<ResourceKey, PollLoop>>,
}

impl Poller {
    pub fn new(coordinator: Arc<FetchCoordinator>) -> Self {
        Self {
            coordinator,
            loops: Mutex::new(HashMap::new()),
        }
    }

    fn lock_loops(&self) -> std::sync::MutexGuard<'_, HashMap<ResourceKey, PollLoop>> {
        self.loops.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Poll `key` every `interval`, using the default retry policy.
    pub fn start_polling(
        &self,
        key: ResourceKey,
        fetch: FetchFn,
        interval: Duration,
        max_consecutive_failures: u32,
    ) {
        let config = PollConfig::new(interval).with_max_consecutive_failures(max_consecutive_failures);
        self.start_polling_with(key, fetch, config);
    }

    /// Poll `key` with explicit parameters, replacing any running loop.
    ///
    /// The first tick fires immediately. Ticks that fall behind are
    /// delayed, never bursted. No error escapes the loop.
    ///
    /// # Panics
    /// - Must be called from within a tokio runtime
    pub fn start_polling_with(&self, key: ResourceKey, fetch: FetchFn, config: PollConfig) {
        let cancel = CancellationToken::new();
        let status = Arc::new(Mutex::new(PollStatus::default()));

        let task = tokio::spawn(poll_loop(
            self.coordinator.clone(),
            key.clone(),
            fetch,
            config.clone(),
            cancel.clone(),
            status.clone(),
        ));

        let previous = self.lock_loops().insert(
            key.clone(),
            PollLoop {
                cancel,
                status,
                task,
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        info!(%key, interval = ?config.interval, "Polling started");
    }

    /// Stop polling `key`. A tick in flight completes but its result is
    /// discarded and subscribers hear nothing more from it, unless another
    /// caller joined that fetch. Returns whether a loop was running.
    pub fn stop_polling(&self, key: &ResourceKey) -> bool {
        match self.lock_loops().remove(key) {
            Some(running) => {
                running.cancel.cancel();
                info!(%key, "Polling stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every loop.
    pub fn stop_all(&self) {
        let stopped: Vec<(ResourceKey, PollLoop)> = self.lock_loops().drain().collect();
        for (key, running) in stopped {
            running.cancel.cancel();
            info!(%key, "Polling stopped");
        }
    }

    pub fn is_polling(&self, key: &ResourceKey) -> bool {
        self.lock_loops()
            .get(key)
            .is_some_and(|running| !running.task.is_finished())
    }

    pub fn status(&self, key: &ResourceKey) -> Option<PollStatus> {
        self.lock_loops()
            .get(key)
            .map(|running| running.status.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    pub fn polled_keys(&self) -> Vec<ResourceKey> {
        self.lock_loops().keys().cloned().collect()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop_all();
    }
}

async fn poll_loop(
    coordinator: Arc<FetchCoordinator>,
    key: ResourceKey,
    fetch: FetchFn,
    config: PollConfig,
    cancel: CancellationToken,
    status: Arc<Mutex<PollStatus>>,
) {
    let mut ticker = tokio::time::interval(config.interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let retry = RetryExecutor::new(config.retry.clone());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let persistent = status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .persistent_error;
        let options = RequestOptions::new()
            .with_cancel(cancel.clone())
            .with_preserve_error(persistent);

        let attempt = {
            let fetch = fetch.clone();
            let retry = retry.clone();
            move || async move { retry.execute(|| fetch()).await }
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = coordinator.request(key.clone(), attempt, options) => result,
        };
        if cancel.is_cancelled() {
            break;
        }

        let mut state = status.lock().unwrap_or_else(|e| e.into_inner());
        state.ticks += 1;
        match result {
            Ok(_) => {
                if state.persistent_error {
                    info!(%key, "Poll recovered");
                }
                state.consecutive_failures = 0;
                state.persistent_error = false;
                state.last_error = None;
                state.last_success = Some(coordinator.store().now());
            }
            Err(err) => {
                state.consecutive_failures += 1;
                warn!(
                    %key,
                    failures = state.consecutive_failures,
                    error = %err,
                    "Poll failed"
                );
                if !state.persistent_error
                    && state.consecutive_failures >= config.max_consecutive_failures
                {
                    state.persistent_error = true;
                    error!(%key, failures = state.consecutive_failures, "Poll entered persistent error");
                }
                state.last_error = Some(err);
            }
        }
    }
}
