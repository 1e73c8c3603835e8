//! Invalidation graph: which cached keys a committed mutation makes stale.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use lectern_common::{Error, KeyPattern, MutationParams, ResourceKey, Result};

use crate::store::CacheStore;

/// Static mapping from mutation class (e.g. `document.delete`) to the key
/// patterns it affects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvalidationGraph {
    rules: BTreeMap<String, Vec<KeyPattern>>,
}

impl InvalidationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the patterns of a mutation class, replacing earlier ones.
    pub fn with_rule(
        mut self,
        class: impl Into<String>,
        patterns: impl IntoIterator<Item = KeyPattern>,
    ) -> Self {
        self.rules
            .insert(class.into(), patterns.into_iter().collect());
        self
    }

    /// Add one pattern to a mutation class.
    pub fn add(&mut self, class: impl Into<String>, pattern: KeyPattern) {
        self.rules.entry(class.into()).or_default().push(pattern);
    }

    pub fn contains(&self, class: &str) -> bool {
        self.rules.contains_key(class)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    /// Declared patterns of a class (empty for unknown classes).
    pub fn patterns(&self, class: &str) -> &[KeyPattern] {
        self.rules.get(class).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Bind the class's patterns with `params`.
    ///
    /// # Errors
    /// - `class` is not declared
    /// - A pattern needs a parameter `params` does not provide
    pub fn resolve(&self, class: &str, params: &MutationParams) -> Result<Vec<KeyPattern>> {
        let patterns = self.rules.get(class).ok_or_else(|| {
            Error::InvalidInput(format!("Unknown mutation class '{}'", class))
        })?;
        patterns.iter().map(|pattern| pattern.bind(params)).collect()
    }

    /// Resolve and expand against the keys currently held by `store`.
    pub fn resolve_keys(
        &self,
        class: &str,
        params: &MutationParams,
        store: &CacheStore,
    ) -> Result<Vec<ResourceKey>> {
        let patterns = self.resolve(class, params)?;
        let keys: BTreeSet<ResourceKey> = store
            .keys()
            .into_iter()
            .filter(|key| patterns.iter().any(|pattern| pattern.matches(key)))
            .collect();
        Ok(keys.into_iter().collect())
    }
}
