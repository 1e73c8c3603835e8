//! Common types used throughout Lectern.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One component of a resource key.
///
/// Numeric and textual components are distinct: `documents/7` (a single
/// document) and `documents/"7"` (the listing of lecture "7") never share
/// a cache slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    /// Numeric identifier.
    Id(i64),
    /// Free-form text (resource names, query strings, external ids).
    Text(String),
}

impl KeyPart {
    /// Parse a component, treating integers as `Id`.
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<i64>() {
            Ok(id) => KeyPart::Id(id),
            Err(_) => KeyPart::Text(raw.to_string()),
        }
    }

    /// Convert into the textual form (`Id(7)` becomes `Text("7")`).
    pub fn into_text(self) -> Self {
        match self {
            KeyPart::Id(id) => KeyPart::Text(id.to_string()),
            text => text,
        }
    }

    /// Convert into the numeric form, if the text is an integer.
    pub fn into_id(self) -> Option<Self> {
        match self {
            KeyPart::Id(id) => Some(KeyPart::Id(id)),
            KeyPart::Text(text) => text.parse::<i64>().ok().map(KeyPart::Id),
        }
    }

    /// Get the text value, if this is a textual component.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            KeyPart::Text(text) => Some(text),
            KeyPart::Id(_) => None,
        }
    }

    /// Get the numeric value, if this is a numeric component.
    pub fn as_id(&self) -> Option<i64> {
        match self {
            KeyPart::Id(id) => Some(*id),
            KeyPart::Text(_) => None,
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Id(id) => write!(f, "{}", id),
            KeyPart::Text(text) => write!(f, "{}", text),
        }
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Text(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::Text(value)
    }
}

impl From<&String> for KeyPart {
    fn from(value: &String) -> Self {
        KeyPart::Text(value.clone())
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        KeyPart::Id(value)
    }
}

impl From<i32> for KeyPart {
    fn from(value: i32) -> Self {
        KeyPart::Id(i64::from(value))
    }
}

impl From<u32> for KeyPart {
    fn from(value: u32) -> Self {
        KeyPart::Id(i64::from(value))
    }
}

/// Canonical identifier of a cacheable unit of remote data.
///
/// An ordered tuple of (resource class, scope discriminators...). Two keys
/// address the same cache slot iff every component matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawResourceKey")]
pub struct ResourceKey {
    parts: Vec<KeyPart>,
}

/// Unvalidated wire form of [`ResourceKey`].
#[derive(Deserialize)]
struct RawResourceKey {
    parts: Vec<KeyPart>,
}

impl TryFrom<RawResourceKey> for ResourceKey {
    type Error = crate::Error;

    fn try_from(raw: RawResourceKey) -> crate::Result<Self> {
        Self::from_parts(raw.parts)
    }
}

impl ResourceKey {
    /// Create a key for a resource class with no scope.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            parts: vec![KeyPart::Text(resource.into())],
        }
    }

    /// Create a key from raw components.
    ///
    /// # Errors
    /// - Returns error if `parts` is empty or the first part is not textual
    pub fn from_parts(parts: Vec<KeyPart>) -> crate::Result<Self> {
        match parts.first() {
            Some(KeyPart::Text(resource)) if !resource.is_empty() => Ok(Self { parts }),
            Some(_) => Err(crate::Error::InvalidInput(
                "Resource class must be a non-empty name".to_string(),
            )),
            None => Err(crate::Error::InvalidInput(
                "Resource key cannot be empty".to_string(),
            )),
        }
    }

    /// Parse a `/`-separated key such as `documents/7`.
    ///
    /// Integer components become `Id`, everything else `Text`.
    pub fn parse(raw: &str) -> crate::Result<Self> {
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Resource key cannot be empty".to_string(),
            ));
        }
        let mut segments = trimmed.split('/');
        let resource = segments.next().unwrap_or_default();
        let mut parts = vec![KeyPart::Text(resource.to_string())];
        for segment in segments {
            if segment.is_empty() {
                return Err(crate::Error::InvalidInput(format!(
                    "Empty component in resource key '{}'",
                    raw
                )));
            }
            parts.push(KeyPart::parse(segment));
        }
        Self::from_parts(parts)
    }

    /// Append a scope discriminator.
    pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
        self.parts.push(part.into());
        self
    }

    /// The resource class (first component).
    pub fn resource(&self) -> &str {
        match self.parts.first() {
            Some(KeyPart::Text(resource)) => resource,
            _ => "",
        }
    }

    /// All components, resource class included.
    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    /// Scope discriminators (everything after the resource class).
    pub fn scope(&self) -> &[KeyPart] {
        self.parts.get(1..).unwrap_or(&[])
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Keys always carry a resource class.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Check whether `prefix` is a leading subsequence of this key.
    pub fn starts_with(&self, prefix: &ResourceKey) -> bool {
        self.parts.starts_with(&prefix.parts)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, part) in self.parts.iter().enumerate() {
            if index > 0 {
                write!(f, "/")?;
            }
            write!(f, "{}", part)?;
        }
        Ok(())
    }
}

/// Named parameters of a mutation, used to bind invalidation patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationParams {
    values: BTreeMap<String, KeyPart>,
}

impl MutationParams {
    /// Create an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<KeyPart>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Set a parameter in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<KeyPart>) {
        self.values.insert(name.into(), value.into());
    }

    /// Look up a parameter.
    pub fn get(&self, name: &str) -> Option<&KeyPart> {
        self.values.get(name)
    }

    /// Look up a parameter that must be present.
    ///
    /// # Errors
    /// - Returns `InvalidInput` naming the missing parameter
    pub fn require(&self, name: &str) -> crate::Result<&KeyPart> {
        self.values.get(name).ok_or_else(|| {
            crate::Error::InvalidInput(format!("Missing mutation parameter '{}'", name))
        })
    }

    /// Check if no parameters are set.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_key_structural_equality() {
        let a = ResourceKey::new("documents").with("L1");
        let b = ResourceKey::new("documents").with("L1");
        let c = ResourceKey::new("documents").with(1);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_text_and_id_are_distinct() {
        let listing = ResourceKey::new("documents").with("7");
        let detail = ResourceKey::new("documents").with(7);
        assert_ne!(listing, detail);
        assert_eq!(listing.to_string(), detail.to_string());
    }

    #[test]
    fn test_key_parse() {
        let key = ResourceKey::parse("/documents/search/rust/").unwrap();
        assert_eq!(key.resource(), "documents");
        assert_eq!(
            key.scope(),
            &[KeyPart::from("search"), KeyPart::from("rust")]
        );

        let key = ResourceKey::parse("quiz/42").unwrap();
        assert_eq!(key, ResourceKey::new("quiz").with(42));
    }

    #[test]
    fn test_key_parse_rejects_bad_input() {
        assert!(ResourceKey::parse("").is_err());
        assert!(ResourceKey::parse("/").is_err());
        assert!(ResourceKey::parse("7/documents").is_err());
        assert!(ResourceKey::parse("documents//7").is_err());
    }

    #[test]
    fn test_deserialize_validates_parts() {
        let key: ResourceKey =
            serde_json::from_value(serde_json::json!({ "parts": ["documents", 7] })).unwrap();
        assert_eq!(key, ResourceKey::new("documents").with(7));
        assert_eq!(key.scope(), &[KeyPart::Id(7)]);

        assert!(serde_json::from_value::<ResourceKey>(serde_json::json!({ "parts": [] })).is_err());
        assert!(serde_json::from_value::<ResourceKey>(serde_json::json!({ "parts": [7] })).is_err());
    }

    #[test]
    fn test_starts_with() {
        let key = ResourceKey::new("lectures").with("user").with("u1");
        assert!(key.starts_with(&ResourceKey::new("lectures")));
        assert!(!key.starts_with(&ResourceKey::new("documents")));
    }

    #[test]
    fn test_key_part_conversions() {
        assert_eq!(KeyPart::Id(7).into_text(), KeyPart::from("7"));
        assert_eq!(KeyPart::from("7").into_id(), Some(KeyPart::Id(7)));
        assert_eq!(KeyPart::from("L1").into_id(), None);
    }

    #[test]
    fn test_mutation_params() {
        let params = MutationParams::new().with("lecture_id", "L1").with("document_id", 7);
        assert_eq!(params.get("lecture_id"), Some(&KeyPart::from("L1")));
        assert_eq!(params.require("document_id").unwrap(), &KeyPart::Id(7));
        assert!(matches!(
            params.require("user_id"),
            Err(crate::Error::InvalidInput(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_display_parse_roundtrip(
            resource in "[a-z]{1,8}",
            scope in proptest::collection::vec(
                prop_oneof![
                    any::<i64>().prop_map(KeyPart::Id),
                    "[a-zA-Z][a-zA-Z0-9_-]{0,8}".prop_map(KeyPart::Text),
                ],
                0..4,
            ),
        ) {
            let mut key = ResourceKey::new(resource);
            for part in scope {
                key = key.with(part);
            }
            let parsed = ResourceKey::parse(&key.to_string()).unwrap();
            prop_assert_eq!(parsed, key);
        }
    }
}
