//! Lectern API catalog
//!
//! Typed models, resource keys, accessors and mutation specs for the
//! Lectern backend, plus the staleness and invalidation tables tuned for it.

pub mod catalog;
pub mod defaults;
pub mod keys;
pub mod models;
mod mutations;

pub use catalog::{Catalog, DEFAULT_SIMILAR_LIMIT};
pub use defaults::{default_config, invalidation_graph, ttl_rules};
pub use models::{
    ChatRequest, ChatResponse, ConversationMessage, Document, DocumentUpdate, DocumentUpload,
    GatewayServices, HealthStatus, Lecture, LectureRequest, MessageType, QuizQuestion, Service,
    Summary,
};
