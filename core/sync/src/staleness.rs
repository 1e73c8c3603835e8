//! Per-key-class time-to-live configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use lectern_common::{KeyPattern, ResourceKey};

use crate::config::duration_ms;
use crate::store::{Entry, EntryStatus};

/// TTL applied to every key matching `pattern`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlRule {
    pub pattern: KeyPattern,
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
}

impl TtlRule {
    pub fn new(pattern: KeyPattern, ttl: Duration) -> Self {
        Self { pattern, ttl }
    }
}

/// Ordered TTL rules; the first matching rule wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StalenessPolicy {
    rules: Vec<TtlRule>,
    default_ttl: Duration,
}

impl StalenessPolicy {
    /// Policy with no rules.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            rules: Vec::new(),
            default_ttl,
        }
    }

    pub fn from_rules(rules: Vec<TtlRule>, default_ttl: Duration) -> Self {
        Self { rules, default_ttl }
    }

    /// Append a rule; earlier rules take precedence.
    pub fn with_rule(mut self, pattern: KeyPattern, ttl: Duration) -> Self {
        self.rules.push(TtlRule::new(pattern, ttl));
        self
    }

    pub fn rules(&self) -> &[TtlRule] {
        &self.rules
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// TTL for `key`.
    pub fn ttl_for(&self, key: &ResourceKey) -> Duration {
        self.rules
            .iter()
            .find(|rule| rule.pattern.matches(key))
            .map_or(self.default_ttl, |rule| rule.ttl)
    }

    /// An entry is fresh iff it holds a successful value that has not
    /// reached its staleness point.
    pub fn is_fresh(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        entry.status == EntryStatus::Success && entry.stale_at.is_some_and(|stale_at| now < stale_at)
    }
}
