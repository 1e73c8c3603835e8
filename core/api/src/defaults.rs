//! Default staleness and invalidation tables for the Lectern backend.

use std::time::Duration;

use lectern_common::{KeyPattern, PartKind};
use lectern_sync::{InvalidationGraph, SyncConfig, TtlRule};

use crate::keys::{CONVERSATION, DOCUMENTS, GATEWAY, HEALTH, LECTURES, QUIZ, SUMMARY};

pub const DOCUMENT_CREATE: &str = "document.create";
pub const DOCUMENT_UPDATE: &str = "document.update";
pub const DOCUMENT_DELETE: &str = "document.delete";
pub const CONVERSATION_CLEAR: &str = "conversation.clear";
pub const CHAT_SEND: &str = "chat.send";
pub const SUMMARY_GENERATE: &str = "summary.generate";
pub const LECTURE_CREATE: &str = "lecture.create";
pub const LECTURE_UPDATE: &str = "lecture.update";
pub const LECTURE_DELETE: &str = "lecture.delete";

const SHORT: Duration = Duration::from_secs(30);
const LONG: Duration = Duration::from_secs(5 * 60);

/// TTL rules, most specific first.
pub fn ttl_rules() -> Vec<TtlRule> {
    vec![
        TtlRule::new(KeyPattern::new(DOCUMENTS), SHORT),
        TtlRule::new(KeyPattern::new(DOCUMENTS).with("search").any(), SHORT),
        TtlRule::new(KeyPattern::new(DOCUMENTS).with("similar").rest(), SHORT),
        TtlRule::new(KeyPattern::new(DOCUMENTS).any_text(), SHORT),
        TtlRule::new(KeyPattern::new(DOCUMENTS).any_id(), LONG),
        TtlRule::new(KeyPattern::new(CONVERSATION).any_id(), LONG),
        TtlRule::new(KeyPattern::new(QUIZ).any_id(), LONG),
        TtlRule::new(KeyPattern::new(SUMMARY).any_id(), LONG),
        TtlRule::new(KeyPattern::new(GATEWAY).with("services"), Duration::from_secs(60)),
        TtlRule::new(KeyPattern::new(HEALTH).rest(), Duration::ZERO),
        TtlRule::new(KeyPattern::new(LECTURES), SHORT),
        TtlRule::new(KeyPattern::new(LECTURES).with("user").any(), SHORT),
        TtlRule::new(KeyPattern::new(LECTURES).any_id(), LONG),
    ]
}

fn document_pattern() -> KeyPattern {
    KeyPattern::new(DOCUMENTS).param_as("document_id", PartKind::Id)
}

fn listing_pattern() -> KeyPattern {
    KeyPattern::new(DOCUMENTS).param_as("lecture_id", PartKind::Text)
}

fn derived_document_patterns() -> Vec<KeyPattern> {
    vec![
        document_pattern(),
        listing_pattern(),
        KeyPattern::new(DOCUMENTS),
        KeyPattern::new(DOCUMENTS).with("search").rest(),
        KeyPattern::new(DOCUMENTS).with("similar").rest(),
    ]
}

fn lecture_patterns() -> Vec<KeyPattern> {
    vec![
        KeyPattern::new(LECTURES),
        KeyPattern::new(LECTURES).with("user").param("user_id"),
    ]
}

/// Which keys each mutation class makes stale.
///
/// Document mutations touch the document, its lecture listing, the
/// aggregate listing and derived search results, never the whole
/// `documents` namespace.
pub fn invalidation_graph() -> InvalidationGraph {
    let by_document = |resource: &str| KeyPattern::new(resource).param_as("document_id", PartKind::Id);
    let lecture = KeyPattern::new(LECTURES).param_as("lecture_id", PartKind::Id);

    let mut deleted = derived_document_patterns();
    deleted.extend([by_document(QUIZ), by_document(SUMMARY), by_document(CONVERSATION)]);

    let mut lecture_update = lecture_patterns();
    lecture_update.push(lecture);
    let mut lecture_delete = lecture_update.clone();
    lecture_delete.push(listing_pattern());

    InvalidationGraph::new()
        .with_rule(DOCUMENT_CREATE, [listing_pattern(), KeyPattern::new(DOCUMENTS)])
        .with_rule(DOCUMENT_UPDATE, derived_document_patterns())
        .with_rule(DOCUMENT_DELETE, deleted)
        .with_rule(CONVERSATION_CLEAR, [by_document(CONVERSATION)])
        .with_rule(CHAT_SEND, [by_document(CONVERSATION)])
        .with_rule(SUMMARY_GENERATE, Vec::new())
        .with_rule(LECTURE_CREATE, lecture_patterns())
        .with_rule(LECTURE_UPDATE, lecture_update)
        .with_rule(LECTURE_DELETE, lecture_delete)
}

/// Sync configuration tuned for the Lectern backend.
pub fn default_config() -> SyncConfig {
    SyncConfig {
        ttl_rules: ttl_rules(),
        ..SyncConfig::default()
    }
    .with_invalidation(invalidation_graph())
}
