//! Mutation specs for every Lectern write endpoint.
//!
//! Each spec carries the invalidation class of the write; optimistic
//! patches are attached where the local result is predictable.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use tracing::debug;

use lectern_common::{MutationParams, Result};
use lectern_sync::{CommitPolicy, MutationSpec};
use lectern_transport::{ApiRequest, FormPart, Transport};

use crate::catalog::{summary_request, Catalog};
use crate::defaults::{
    CHAT_SEND, CONVERSATION_CLEAR, DOCUMENT_CREATE, DOCUMENT_DELETE, DOCUMENT_UPDATE,
    LECTURE_CREATE, LECTURE_DELETE, LECTURE_UPDATE, SUMMARY_GENERATE,
};
use crate::keys;
use crate::models::{ChatRequest, DocumentUpdate, DocumentUpload, LectureRequest};

impl Catalog {
    fn send(&self, request: ApiRequest) -> impl Future<Output = Result<Value>> + Send + 'static {
        let transport = self.transport().clone();
        async move {
            debug!(method = %request.method, path = %request.path, "Sending write");
            transport.perform(request).await
        }
    }

    fn send_json<T>(&self, request: ApiRequest, body: T) -> impl Future<Output = Result<Value>> + Send + 'static
    where
        T: Serialize + Send + 'static,
    {
        let transport = self.transport().clone();
        async move {
            let request = request.json_from(&body)?;
            transport.perform(request).await
        }
    }

    /// Upload a file into a lecture.
    pub fn upload_document(&self, upload: DocumentUpload) -> MutationSpec {
        let DocumentUpload {
            lecture_id,
            metadata,
            filename,
            content_type,
            data,
        } = upload;

        let mut parts = vec![
            FormPart::File {
                name: "file".to_string(),
                filename,
                content_type,
                data,
            },
            FormPart::Text {
                name: "name".to_string(),
                value: metadata.name,
            },
        ];
        if let Some(description) = metadata.description {
            parts.push(FormPart::Text {
                name: "description".to_string(),
                value: description,
            });
        }
        parts.push(FormPart::Text {
            name: "lectureId".to_string(),
            value: lecture_id.clone(),
        });

        let request = ApiRequest::post("/api/documents/upload").multipart(parts);
        MutationSpec::new(self.send(request)).with_invalidation(
            DOCUMENT_CREATE,
            MutationParams::new().with("lecture_id", lecture_id),
        )
    }

    /// Rename or re-describe a document. The cached document shows the new
    /// metadata until the server answers.
    pub fn update_document(&self, id: i64, lecture_id: &str, update: DocumentUpdate) -> MutationSpec {
        let patch = update.clone();
        let request = ApiRequest::put("/api/documents/{id}").param("id", id);

        MutationSpec::new(self.send_json(request, update))
            .with_target(keys::document(id))
            .with_optimistic(move |current| {
                let mut document = current?.clone();
                let fields = document.as_object_mut()?;
                fields.insert("name".to_string(), Value::String(patch.name));
                if let Some(description) = patch.description {
                    fields.insert("description".to_string(), Value::String(description));
                }
                Some(document)
            })
            .with_invalidation(
                DOCUMENT_UPDATE,
                MutationParams::new()
                    .with("document_id", id)
                    .with("lecture_id", lecture_id),
            )
    }

    /// Delete a document. It disappears from its lecture listing at once.
    pub fn delete_document(&self, id: i64, lecture_id: &str) -> MutationSpec {
        let request = ApiRequest::delete("/api/documents/{id}").param("id", id);

        MutationSpec::new(self.send(request))
            .with_target(keys::lecture_documents(lecture_id))
            .with_optimistic(move |current| {
                let documents = current?.as_array()?;
                let remaining = documents
                    .iter()
                    .filter(|document| document.get("id").and_then(Value::as_i64) != Some(id))
                    .cloned()
                    .collect();
                Some(Value::Array(remaining))
            })
            .with_commit_policy(CommitPolicy::Ignore)
            .with_invalidation(
                DOCUMENT_DELETE,
                MutationParams::new()
                    .with("document_id", id)
                    .with("lecture_id", lecture_id),
            )
    }

    pub fn clear_conversation(&self, document_id: i64) -> MutationSpec {
        let request =
            ApiRequest::delete("/api/documents/{id}/conversation").param("id", document_id);

        MutationSpec::new(self.send(request))
            .with_target(keys::conversation(document_id))
            .with_optimistic(|_| Some(Value::Array(Vec::new())))
            .with_commit_policy(CommitPolicy::Ignore)
            .with_invalidation(
                CONVERSATION_CLEAR,
                MutationParams::new().with("document_id", document_id),
            )
    }

    /// Ask the chat service about a document.
    ///
    /// The question is appended to the cached conversation right away; the
    /// committed value is the raw [`crate::models::ChatResponse`].
    pub fn send_chat(&self, document_id: i64, message: &str) -> MutationSpec {
        let body = ChatRequest {
            message: message.to_string(),
            document_id: Some(document_id.to_string()),
        };
        let content = message.to_string();

        MutationSpec::new(self.send_json(ApiRequest::post("/api/chat"), body))
            .with_target(keys::conversation(document_id))
            .with_optimistic(move |current| {
                let mut messages = current
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let index = messages.len();
                messages.push(json!({
                    "messageIndex": index,
                    "messageType": "human",
                    "content": content,
                    "createdAt": Utc::now().to_rfc3339(),
                }));
                Some(Value::Array(messages))
            })
            .with_commit_policy(CommitPolicy::Ignore)
            .with_invalidation(CHAT_SEND, MutationParams::new().with("document_id", document_id))
    }

    /// Generate a fresh summary and store it.
    pub fn generate_summary(&self, document_id: i64) -> MutationSpec {
        MutationSpec::new(self.send(summary_request(document_id)))
            .with_target(keys::summary(document_id))
            .with_invalidation(
                SUMMARY_GENERATE,
                MutationParams::new().with("document_id", document_id),
            )
    }

    pub fn create_lecture(&self, request: LectureRequest) -> MutationSpec {
        let params = MutationParams::new().with("user_id", request.user_id.as_str());
        MutationSpec::new(self.send_json(ApiRequest::post("/api/lectures"), request))
            .with_invalidation(LECTURE_CREATE, params)
    }

    pub fn update_lecture(&self, id: i64, request: LectureRequest) -> MutationSpec {
        let params = MutationParams::new()
            .with("lecture_id", id)
            .with("user_id", request.user_id.as_str());
        let name = request.name.clone();
        let call = ApiRequest::put("/api/lectures/{id}").param("id", id);

        MutationSpec::new(self.send_json(call, request))
            .with_target(keys::lecture(id))
            .with_optimistic(move |current| {
                let mut lecture = current?.clone();
                lecture
                    .as_object_mut()?
                    .insert("name".to_string(), Value::String(name));
                Some(lecture)
            })
            .with_invalidation(LECTURE_UPDATE, params)
    }

    /// Delete a lecture; the server removes its documents too.
    pub fn delete_lecture(&self, id: i64, user_id: &str) -> MutationSpec {
        let request = ApiRequest::delete("/api/lectures/{id}").param("id", id);
        MutationSpec::new(self.send(request))
            .with_target(keys::lecture(id))
            .with_commit_policy(CommitPolicy::RemoveTarget)
            .with_invalidation(
                LECTURE_DELETE,
                MutationParams::new()
                    .with("lecture_id", id)
                    .with("user_id", user_id),
            )
    }
}
