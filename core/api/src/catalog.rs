//! Accessors for every cacheable Lectern endpoint.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use lectern_common::{Error, ResourceKey, Result};
use lectern_sync::ResourceAccessor;
use lectern_transport::{ApiRequest, SharedTransport};

use crate::keys;
use crate::models::{
    ConversationMessage, Document, GatewayServices, HealthStatus, Lecture, QuizQuestion, Service,
    Summary,
};

/// Default result count of similarity searches.
pub const DEFAULT_SIMILAR_LIMIT: u32 = 10;

/// Builds accessors and mutation specs against one transport.
#[derive(Clone)]
pub struct Catalog {
    transport: SharedTransport,
}

impl Catalog {
    pub fn new(transport: SharedTransport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    fn accessor<T: DeserializeOwned>(&self, key: ResourceKey, request: ApiRequest) -> ResourceAccessor<T> {
        ResourceAccessor::from_request(key, self.transport.clone(), request)
    }

    pub fn documents(&self) -> ResourceAccessor<Vec<Document>> {
        self.accessor(keys::documents(), ApiRequest::get("/api/documents"))
    }

    pub fn lecture_documents(&self, lecture_id: &str) -> ResourceAccessor<Vec<Document>> {
        self.accessor(
            keys::lecture_documents(lecture_id),
            ApiRequest::get("/api/documents/lecture/{lecture_id}").param("lecture_id", lecture_id),
        )
    }

    pub fn document(&self, id: i64) -> ResourceAccessor<Document> {
        self.accessor(
            keys::document(id),
            ApiRequest::get("/api/documents/{id}").param("id", id),
        )
    }

    /// Full-text search.
    ///
    /// # Errors
    /// - `InvalidInput` for a blank query, which is never sent or cached
    pub fn search(&self, query: &str) -> Result<ResourceAccessor<Vec<Document>>> {
        require_query(query)?;
        Ok(self.accessor(
            keys::document_search(query),
            ApiRequest::get("/api/documents/search").query("q", query),
        ))
    }

    /// Similarity search returning at most `limit` documents.
    ///
    /// # Errors
    /// - `InvalidInput` for a blank query
    pub fn similar(&self, query: &str, limit: u32) -> Result<ResourceAccessor<Vec<Document>>> {
        require_query(query)?;
        Ok(self.accessor(
            keys::similar_documents(query, limit),
            ApiRequest::get("/api/documents/search/similar")
                .query("q", query)
                .query("limit", limit),
        ))
    }

    /// Download the raw file of a document.
    ///
    /// Not cached: the body is returned as is.
    pub async fn download(&self, id: i64) -> Result<Vec<u8>> {
        self.transport
            .download(ApiRequest::get("/api/documents/{id}/download").param("id", id))
            .await
    }

    /// The chat history stored on a document.
    pub fn conversation(&self, document_id: i64) -> ResourceAccessor<Vec<ConversationMessage>> {
        let accessor: ResourceAccessor<Vec<ConversationMessage>> = self.accessor(
            keys::conversation(document_id),
            ApiRequest::get("/api/documents/{id}").param("id", document_id),
        );
        accessor.map_raw(|document| Ok(conversation_of(&document)))
    }

    /// Quiz questions are generated on demand, hence the POST.
    pub fn quiz(&self, document_id: i64) -> ResourceAccessor<Vec<QuizQuestion>> {
        self.accessor(
            keys::quiz(document_id),
            ApiRequest::post("/api/quiz/{document_id}").param("document_id", document_id),
        )
    }

    pub fn summary(&self, document_id: i64) -> ResourceAccessor<Summary> {
        self.accessor(keys::summary(document_id), summary_request(document_id))
    }

    pub fn health(&self, service: Service) -> ResourceAccessor<HealthStatus> {
        self.accessor(keys::health(service), ApiRequest::get(service.health_path()))
    }

    pub fn gateway_services(&self) -> ResourceAccessor<GatewayServices> {
        self.accessor(keys::gateway_services(), ApiRequest::get("/api/gateway/services"))
    }

    pub fn lectures(&self) -> ResourceAccessor<Vec<Lecture>> {
        self.accessor(keys::lectures(), ApiRequest::get("/api/lectures"))
    }

    pub fn user_lectures(&self, user_id: &str) -> ResourceAccessor<Vec<Lecture>> {
        self.accessor(
            keys::user_lectures(user_id),
            ApiRequest::get("/api/lectures/user/{user_id}").param("user_id", user_id),
        )
    }

    pub fn lecture(&self, id: i64) -> ResourceAccessor<Lecture> {
        self.accessor(
            keys::lecture(id),
            ApiRequest::get("/api/lectures/{id}").param("id", id),
        )
    }
}

fn require_query(query: &str) -> Result<()> {
    if query.trim().is_empty() {
        return Err(Error::InvalidInput("Search query cannot be blank".to_string()));
    }
    Ok(())
}

pub(crate) fn summary_request(document_id: i64) -> ApiRequest {
    ApiRequest::post("/api/summary").json(json!({ "document_id": document_id.to_string() }))
}

/// Extract the conversation of a document, `[]` when it has none.
pub(crate) fn conversation_of(document: &Value) -> Value {
    match document.get("conversation") {
        Some(Value::Array(messages)) => Value::Array(messages.clone()),
        _ => Value::Array(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lectern_common::ManualClock;
    use lectern_sync::SyncClient;
    use lectern_transport::MemoryTransport;
    use std::sync::Arc;

    fn setup() -> (Catalog, Arc<MemoryTransport>, SyncClient) {
        let memory = Arc::new(MemoryTransport::new());
        let transport: SharedTransport = memory.clone();
        let client = SyncClient::with_clock(
            crate::defaults::default_config(),
            Arc::new(ManualClock::default()),
        );
        (Catalog::new(transport), memory, client)
    }

    #[tokio::test]
    async fn test_lecture_documents() {
        let (catalog, memory, client) = setup();
        memory.respond(
            "GET /api/documents/lecture/L1",
            json!([{ "id": 1, "name": "Week 1", "lectureId": "L1" }]),
        );

        let documents = client.read(&catalog.lecture_documents("L1")).await.unwrap();
        assert_eq!(documents[0].lecture_id.as_deref(), Some("L1"));
        assert!(client.entry(&keys::lecture_documents("L1")).is_some());
    }

    #[tokio::test]
    async fn test_search_encodes_query() {
        let (catalog, memory, client) = setup();
        memory.respond("GET /api/documents/search/similar", json!([]));

        client
            .read(&catalog.similar("linear algebra", 5).unwrap())
            .await
            .unwrap();
        let calls = memory.calls();
        assert_eq!(
            calls[0].request.query,
            vec![
                ("q".to_string(), "linear algebra".to_string()),
                ("limit".to_string(), "5".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_blank_search_is_never_sent() {
        let (catalog, memory, client) = setup();
        assert!(matches!(catalog.search("   "), Err(Error::InvalidInput(_))));
        assert!(matches!(catalog.similar("", 10), Err(Error::InvalidInput(_))));
        assert!(memory.calls().is_empty());
        assert!(client.store().is_empty());

        memory.respond("GET /api/documents/search", json!([{ "id": 1, "name": "Week 1" }]));
        let found = client.read(&catalog.search(" rust ").unwrap()).await.unwrap();
        assert_eq!(found[0].id, 1);
    }

    #[tokio::test]
    async fn test_download_returns_raw_body_uncached() {
        let (catalog, memory, client) = setup();
        memory.serve("GET /api/documents/7/download", b"slides".to_vec());

        assert_eq!(catalog.download(7).await.unwrap(), b"slides");
        assert!(matches!(
            catalog.download(8).await,
            Err(Error::Client { status: 404, .. })
        ));
        assert!(client.store().is_empty());
    }

    #[tokio::test]
    async fn test_conversation_reads_document_field() {
        let (catalog, memory, client) = setup();
        memory.respond(
            "GET /api/documents/7",
            json!({
                "id": 7,
                "name": "Week 1",
                "conversation": [
                    { "messageIndex": 0, "messageType": "human", "content": "Hi", "createdAt": "t0" },
                    { "messageIndex": 1, "messageType": "ai", "content": "Hello", "createdAt": "t1" }
                ]
            }),
        );

        let conversation = client.read(&catalog.conversation(7)).await.unwrap();
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation[1].content, "Hello");
        assert!(client.entry(&keys::document(7)).is_none());
    }

    #[tokio::test]
    async fn test_conversation_missing_field_is_empty() {
        let (catalog, memory, client) = setup();
        memory.respond("GET /api/documents/8", json!({ "id": 8, "name": "Week 2" }));
        assert!(client.read(&catalog.conversation(8)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quiz_and_summary_are_posts() {
        let (catalog, memory, client) = setup();
        memory.respond(
            "POST /api/quiz/42",
            json!([{
                "id": "q1",
                "question": "2 + 2?",
                "options": ["3", "4", "5", "6"],
                "correctAnswer": 1,
                "explanation": ""
            }]),
        );
        memory.respond(
            "POST /api/summary",
            json!({ "document_id": "42", "summary": "Short." }),
        );

        let quiz = client.read(&catalog.quiz(42)).await.unwrap();
        assert_eq!(quiz[0].correct_option(), Some("4"));
        let summary = client.read(&catalog.summary(42)).await.unwrap();
        assert_eq!(summary.summary, "Short.");

        let summary_call = memory
            .calls()
            .into_iter()
            .find(|call| call.route == "POST /api/summary")
            .unwrap();
        assert_eq!(
            summary_call.request.body,
            lectern_transport::RequestBody::Json(json!({ "document_id": "42" }))
        );
    }

    #[tokio::test]
    async fn test_health_error_is_recorded() {
        let (catalog, memory, client) = setup();
        memory.fail("GET /api/chat/health", Error::from_status(503, "unavailable"));

        let result = client.read(&catalog.health(Service::Chat)).await;
        assert!(matches!(result, Err(Error::Server { status: 503, .. })));
    }

    #[tokio::test]
    async fn test_user_lectures() {
        let (catalog, memory, client) = setup();
        memory.respond(
            "GET /api/lectures/user/user_1",
            json!([{ "id": 3, "name": "Algebra", "createdBy": "user_1" }]),
        );
        let lectures = client.read(&catalog.user_lectures("user_1")).await.unwrap();
        assert_eq!(lectures[0].created_by.as_deref(), Some("user_1"));
    }
}
