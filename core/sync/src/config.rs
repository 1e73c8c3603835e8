//! Sync client configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use lectern_common::{Error, KeyPattern, Result};

use crate::invalidation::InvalidationGraph;
use crate::poller::PollConfig;
use crate::staleness::{StalenessPolicy, TtlRule};

/// Serialize a `Duration` as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Configuration for a [`crate::SyncClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Ordered TTL rules, first match wins.
    pub ttl_rules: Vec<TtlRule>,
    /// TTL for keys no rule matches.
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,
    /// Timeout applied to every fetch unless overridden per request.
    #[serde(with = "duration_ms")]
    pub fetch_timeout: Duration,
    /// Timeout applied to every mutation unless overridden per spec.
    #[serde(with = "duration_ms")]
    pub mutation_timeout: Duration,
    /// Defaults for polled keys.
    pub poll: PollConfig,
    /// How long an unobserved entry survives past its staleness.
    #[serde(with = "duration_ms")]
    pub sweep_retention: Duration,
    /// Mutation class to affected key patterns.
    pub invalidation: InvalidationGraph,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ttl_rules: Vec::new(),
            default_ttl: Duration::ZERO,
            fetch_timeout: Duration::from_secs(30),
            mutation_timeout: Duration::from_secs(30),
            poll: PollConfig::default(),
            sweep_retention: Duration::from_secs(5 * 60),
            invalidation: InvalidationGraph::default(),
        }
    }
}

impl SyncConfig {
    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Invalid sync configuration: {}", e)))
    }

    /// Load a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// Render as pretty-printed JSON.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize configuration: {}", e)))
    }

    /// Append a TTL rule.
    pub fn with_ttl(mut self, pattern: KeyPattern, ttl: Duration) -> Self {
        self.ttl_rules.push(TtlRule::new(pattern, ttl));
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_mutation_timeout(mut self, timeout: Duration) -> Self {
        self.mutation_timeout = timeout;
        self
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_sweep_retention(mut self, retention: Duration) -> Self {
        self.sweep_retention = retention;
        self
    }

    pub fn with_invalidation(mut self, invalidation: InvalidationGraph) -> Self {
        self.invalidation = invalidation;
        self
    }

    /// Build the staleness policy described by this configuration.
    pub fn staleness_policy(&self) -> StalenessPolicy {
        StalenessPolicy::from_rules(self.ttl_rules.clone(), self.default_ttl)
    }
}
