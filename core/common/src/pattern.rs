//! Key patterns for invalidation and staleness rules.
//!
//! A pattern either fully specifies a key or wildcards some of its scope
//! discriminators. The string form is used in configuration files:
//!
//! | Segment       | Matches                                        |
//! |---------------|------------------------------------------------|
//! | `documents`   | the literal text component                     |
//! | `42`          | the literal numeric component                  |
//! | `'42'`        | the literal text component "42"                |
//! | `*`           | any single component                           |
//! | `#`           | any numeric component                          |
//! | `$`           | any text component                             |
//! | `{name}`      | a mutation parameter, bound before matching    |
//! | `{name:text}` | a parameter coerced to a text component        |
//! | `{name:id}`   | a parameter coerced to a numeric component     |
//! | `**`          | zero or more trailing components (last only)   |

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::types::{KeyPart, MutationParams, ResourceKey};
use crate::{Error, Result};

/// Kind of a key component, used to coerce bound parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartKind {
    Id,
    Text,
}

/// One segment of a key pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PatternSegment {
    /// Matches exactly this component.
    Exact(KeyPart),
    /// Matches any single component.
    Any,
    /// Matches any numeric component.
    AnyId,
    /// Matches any text component.
    AnyText,
    /// Placeholder bound from mutation parameters.
    ///
    /// An unbound parameter matches like `Any`.
    Param { name: String, kind: Option<PartKind> },
}

impl PatternSegment {
    fn matches(&self, part: &KeyPart) -> bool {
        match self {
            PatternSegment::Exact(expected) => expected == part,
            PatternSegment::Any => true,
            PatternSegment::AnyId => matches!(part, KeyPart::Id(_)),
            PatternSegment::AnyText => matches!(part, KeyPart::Text(_)),
            PatternSegment::Param { kind, .. } => match kind {
                None => true,
                Some(PartKind::Id) => matches!(part, KeyPart::Id(_)),
                Some(PartKind::Text) => matches!(part, KeyPart::Text(_)),
            },
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "" => Err(Error::InvalidInput("Empty pattern segment".to_string())),
            "*" => Ok(PatternSegment::Any),
            "#" => Ok(PatternSegment::AnyId),
            "$" => Ok(PatternSegment::AnyText),
            _ if raw.starts_with('{') && raw.ends_with('}') && raw.len() > 2 => {
                let inner = &raw[1..raw.len() - 1];
                let (name, kind) = match inner.split_once(':') {
                    Some((name, "text")) => (name, Some(PartKind::Text)),
                    Some((name, "id")) => (name, Some(PartKind::Id)),
                    Some((_, other)) => {
                        return Err(Error::InvalidInput(format!(
                            "Unknown parameter kind '{}' in '{}'",
                            other, raw
                        )));
                    }
                    None => (inner, None),
                };
                if name.is_empty() {
                    return Err(Error::InvalidInput(format!(
                        "Parameter name missing in '{}'",
                        raw
                    )));
                }
                Ok(PatternSegment::Param {
                    name: name.to_string(),
                    kind,
                })
            }
            _ if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') => Ok(
                PatternSegment::Exact(KeyPart::Text(raw[1..raw.len() - 1].to_string())),
            ),
            _ => Ok(PatternSegment::Exact(KeyPart::parse(raw))),
        }
    }
}

impl fmt::Display for PatternSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternSegment::Exact(KeyPart::Id(id)) => write!(f, "{}", id),
            PatternSegment::Exact(KeyPart::Text(text)) => {
                if needs_quotes(text) {
                    write!(f, "'{}'", text)
                } else {
                    write!(f, "{}", text)
                }
            }
            PatternSegment::Any => write!(f, "*"),
            PatternSegment::AnyId => write!(f, "#"),
            PatternSegment::AnyText => write!(f, "$"),
            PatternSegment::Param { name, kind: None } => write!(f, "{{{}}}", name),
            PatternSegment::Param {
                name,
                kind: Some(PartKind::Id),
            } => write!(f, "{{{}:id}}", name),
            PatternSegment::Param {
                name,
                kind: Some(PartKind::Text),
            } => write!(f, "{{{}:text}}", name),
        }
    }
}

fn needs_quotes(text: &str) -> bool {
    text.parse::<i64>().is_ok()
        || matches!(text, "*" | "#" | "$" | "**")
        || (text.starts_with('{') && text.ends_with('}'))
        || (text.starts_with('\'') && text.ends_with('\''))
}

/// A matcher over resource keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPattern {
    segments: Vec<PatternSegment>,
    rest: bool,
}

impl KeyPattern {
    /// Pattern matching exactly the resource class key (e.g. `documents`).
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            segments: vec![PatternSegment::Exact(KeyPart::Text(resource.into()))],
            rest: false,
        }
    }

    /// Pattern matching exactly one key.
    pub fn exact(key: &ResourceKey) -> Self {
        Self {
            segments: key
                .parts()
                .iter()
                .cloned()
                .map(PatternSegment::Exact)
                .collect(),
            rest: false,
        }
    }

    /// Pattern matching a key and every key extending it.
    pub fn prefix(key: &ResourceKey) -> Self {
        Self::exact(key).rest()
    }

    /// Parse the string form (see module docs).
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("Key pattern cannot be empty".to_string()));
        }

        let raw_segments: Vec<&str> = trimmed.split('/').collect();
        let mut segments = Vec::with_capacity(raw_segments.len());
        let mut rest = false;

        for (index, raw_segment) in raw_segments.iter().enumerate() {
            if *raw_segment == "**" {
                if index + 1 != raw_segments.len() {
                    return Err(Error::InvalidInput(format!(
                        "'**' must be the last segment in '{}'",
                        raw
                    )));
                }
                rest = true;
            } else {
                segments.push(PatternSegment::parse(raw_segment)?);
            }
        }

        if !matches!(segments.first(), Some(PatternSegment::Exact(KeyPart::Text(_)))) {
            return Err(Error::InvalidInput(format!(
                "Key pattern '{}' must start with a resource class",
                raw
            )));
        }

        Ok(Self { segments, rest })
    }

    /// Append an exact component.
    pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
        self.segments.push(PatternSegment::Exact(part.into()));
        self
    }

    /// Append a single-component wildcard.
    pub fn any(mut self) -> Self {
        self.segments.push(PatternSegment::Any);
        self
    }

    /// Append a numeric-component wildcard.
    pub fn any_id(mut self) -> Self {
        self.segments.push(PatternSegment::AnyId);
        self
    }

    /// Append a text-component wildcard.
    pub fn any_text(mut self) -> Self {
        self.segments.push(PatternSegment::AnyText);
        self
    }

    /// Append a parameter placeholder.
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.segments.push(PatternSegment::Param {
            name: name.into(),
            kind: None,
        });
        self
    }

    /// Append a parameter placeholder coerced to `kind` when bound.
    pub fn param_as(mut self, name: impl Into<String>, kind: PartKind) -> Self {
        self.segments.push(PatternSegment::Param {
            name: name.into(),
            kind: Some(kind),
        });
        self
    }

    /// Also match any number of trailing components.
    pub fn rest(mut self) -> Self {
        self.rest = true;
        self
    }

    /// Pattern segments (without the trailing rest marker).
    pub fn segments(&self) -> &[PatternSegment] {
        &self.segments
    }

    /// Whether trailing components are accepted.
    pub fn has_rest(&self) -> bool {
        self.rest
    }

    /// Names of the parameters this pattern needs.
    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            PatternSegment::Param { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }

    /// Check whether `key` matches this pattern.
    pub fn matches(&self, key: &ResourceKey) -> bool {
        let parts = key.parts();
        if parts.len() < self.segments.len() {
            return false;
        }
        if !self.rest && parts.len() != self.segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(parts)
            .all(|(segment, part)| segment.matches(part))
    }

    /// Replace every parameter with its value from `params`.
    ///
    /// # Errors
    /// - A required parameter is missing
    /// - A parameter cannot be coerced to the requested kind
    pub fn bind(&self, params: &MutationParams) -> Result<Self> {
        let mut segments = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            let bound = match segment {
                PatternSegment::Param { name, kind } => {
                    let value = params.require(name)?.clone();
                    let value = match kind {
                        None => value,
                        Some(PartKind::Text) => value.into_text(),
                        Some(PartKind::Id) => value.into_id().ok_or_else(|| {
                            Error::InvalidInput(format!(
                                "Parameter '{}' must be numeric",
                                name
                            ))
                        })?,
                    };
                    PatternSegment::Exact(value)
                }
                other => other.clone(),
            };
            segments.push(bound);
        }
        Ok(Self {
            segments,
            rest: self.rest,
        })
    }

    /// Check whether this pattern addresses exactly one key.
    pub fn is_concrete(&self) -> bool {
        !self.rest
            && self
                .segments
                .iter()
                .all(|segment| matches!(segment, PatternSegment::Exact(_)))
    }

    /// Convert a concrete pattern into the key it addresses.
    pub fn to_key(&self) -> Option<ResourceKey> {
        if !self.is_concrete() {
            return None;
        }
        let parts = self
            .segments
            .iter()
            .filter_map(|segment| match segment {
                PatternSegment::Exact(part) => Some(part.clone()),
                _ => None,
            })
            .collect();
        ResourceKey::from_parts(parts).ok()
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, segment) in self.segments.iter().enumerate() {
            if index > 0 {
                write!(f, "/")?;
            }
            write!(f, "{}", segment)?;
        }
        if self.rest {
            write!(f, "/**")?;
        }
        Ok(())
    }
}

impl From<&ResourceKey> for KeyPattern {
    fn from(key: &ResourceKey) -> Self {
        KeyPattern::exact(key)
    }
}

impl Serialize for KeyPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for KeyPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        KeyPattern::parse(&raw).map_err(serde::de::Error::custom)
    }
}
