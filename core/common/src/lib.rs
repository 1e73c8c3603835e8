//! Common utilities and types shared across Lectern modules.
//!
//! This module provides the resource key space, key patterns, the error
//! taxonomy and the clock abstraction used throughout the codebase.

pub mod clock;
pub mod error;
pub mod pattern;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use pattern::{KeyPattern, PartKind, PatternSegment};
pub use types::{KeyPart, MutationParams, ResourceKey};
