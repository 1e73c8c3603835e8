//! Wire models of the Lectern backend services.
//!
//! The Java services answer in camelCase, the Python ones in snake_case;
//! multi-word fields accept both.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use lectern_common::Error;

/// An uploaded document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, alias = "original_filename")]
    pub original_filename: Option<String>,
    #[serde(default, alias = "content_type")]
    pub content_type: Option<String>,
    #[serde(default, alias = "file_size")]
    pub file_size: Option<i64>,
    #[serde(default, alias = "organization_id", skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(default, alias = "lecture_id", skip_serializing_if = "Option::is_none")]
    pub lecture_id: Option<String>,
    #[serde(default, alias = "created_at")]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default, alias = "updated_at")]
    pub updated_at: Option<NaiveDateTime>,
    #[serde(default, alias = "chunk_count")]
    pub chunk_count: i64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub conversation: Vec<ConversationMessage>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Human,
    Ai,
}

/// One message of a document's chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    #[serde(alias = "message_index")]
    pub message_index: i64,
    #[serde(alias = "message_type")]
    pub message_type: MessageType,
    pub content: String,
    #[serde(alias = "created_at")]
    pub created_at: String,
}

/// Editable document metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentUpdate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl DocumentUpdate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A file to upload into a lecture.
#[derive(Clone)]
pub struct DocumentUpload {
    pub lecture_id: String,
    pub metadata: DocumentUpdate,
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl fmt::Debug for DocumentUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentUpload")
            .field("lecture_id", &self.lecture_id)
            .field("metadata", &self.metadata)
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("size", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lecture {
    pub id: i64,
    pub name: String,
    #[serde(default, alias = "created_by")]
    pub created_by: Option<String>,
    #[serde(default, alias = "created_at")]
    pub created_at: Option<NaiveDateTime>,
}

/// Body of lecture create and update calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LectureRequest {
    pub name: String,
    pub user_id: String,
}

impl LectureRequest {
    pub fn new(name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            user_id: user_id.into(),
        }
    }
}

/// A generated multiple-choice question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizQuestion {
    pub id: String,
    pub question: String,
    pub options: Vec<String>,
    /// Index into `options`.
    #[serde(alias = "correct_answer")]
    pub correct_answer: usize,
    #[serde(default)]
    pub explanation: String,
}

impl QuizQuestion {
    pub fn correct_option(&self) -> Option<&str> {
        self.options.get(self.correct_answer).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub document_id: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    #[serde(default)]
    pub document: Option<Document>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub chunk_count: i64,
}

/// Health report of one backend service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl HealthStatus {
    /// Services report either `UP` or `healthy`.
    pub fn is_up(&self) -> bool {
        self.status.eq_ignore_ascii_case("up") || self.status.eq_ignore_ascii_case("healthy")
    }
}

/// Services registered at the gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayServices {
    pub services: Vec<String>,
    #[serde(default)]
    pub instances: BTreeMap<String, Vec<Value>>,
}

/// Backend services with a health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Service {
    Gateway,
    Summary,
    Chat,
    Quiz,
    Lectures,
}

impl Service {
    pub const ALL: [Service; 5] = [
        Service::Gateway,
        Service::Summary,
        Service::Chat,
        Service::Quiz,
        Service::Lectures,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Gateway => "gateway",
            Service::Summary => "summary",
            Service::Chat => "chat",
            Service::Quiz => "quiz",
            Service::Lectures => "lectures",
        }
    }

    pub fn health_path(&self) -> &'static str {
        match self {
            Service::Gateway => "/api/gateway/health",
            Service::Summary => "/api/summary/health",
            Service::Chat => "/api/chat/health",
            Service::Quiz => "/api/quiz/health",
            Service::Lectures => "/api/lectures/health",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Service::ALL
            .into_iter()
            .find(|service| service.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidInput(format!("Unknown service '{}'", s)))
    }
}
