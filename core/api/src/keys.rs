//! Resource keys of the Lectern catalog.
//!
//! Lecture ids inside document listings are textual (`documents/"5"`) so a
//! lecture listing never shares a slot with document 5.

use lectern_common::ResourceKey;

use crate::models::Service;

pub const DOCUMENTS: &str = "documents";
pub const CONVERSATION: &str = "conversation";
pub const QUIZ: &str = "quiz";
pub const SUMMARY: &str = "summary";
pub const HEALTH: &str = "health";
pub const GATEWAY: &str = "gateway";
pub const LECTURES: &str = "lectures";

/// Every document.
pub fn documents() -> ResourceKey {
    ResourceKey::new(DOCUMENTS)
}

/// Documents of one lecture.
pub fn lecture_documents(lecture_id: &str) -> ResourceKey {
    ResourceKey::new(DOCUMENTS).with(lecture_id)
}

pub fn document(id: i64) -> ResourceKey {
    ResourceKey::new(DOCUMENTS).with(id)
}

pub fn document_search(query: &str) -> ResourceKey {
    ResourceKey::new(DOCUMENTS).with("search").with(query)
}

pub fn similar_documents(query: &str, limit: u32) -> ResourceKey {
    ResourceKey::new(DOCUMENTS)
        .with("similar")
        .with(query)
        .with(limit)
}

pub fn conversation(document_id: i64) -> ResourceKey {
    ResourceKey::new(CONVERSATION).with(document_id)
}

pub fn quiz(document_id: i64) -> ResourceKey {
    ResourceKey::new(QUIZ).with(document_id)
}

pub fn summary(document_id: i64) -> ResourceKey {
    ResourceKey::new(SUMMARY).with(document_id)
}

pub fn health(service: Service) -> ResourceKey {
    ResourceKey::new(HEALTH).with(service.as_str())
}

pub fn gateway_services() -> ResourceKey {
    ResourceKey::new(GATEWAY).with("services")
}

pub fn lectures() -> ResourceKey {
    ResourceKey::new(LECTURES)
}

pub fn user_lectures(user_id: &str) -> ResourceKey {
    ResourceKey::new(LECTURES).with("user").with(user_id)
}

pub fn lecture(id: i64) -> ResourceKey {
    ResourceKey::new(LECTURES).with(id)
}
