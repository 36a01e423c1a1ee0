//! REST API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ask` | Answer a question, optionally within a conversation |
//! | `POST` | `/conversations` | Start a conversation |
//! | `GET` | `/conversations/{id}/messages` | Transcript, oldest first (`?limit=`) |
//! | `DELETE` | `/conversations/{id}` | Delete a conversation and its messages |
//! | `POST` | `/documents/{id}/index` | (Re-)index one document from the source |
//! | `DELETE` | `/documents/{id}` | Remove a document from the index |
//! | `GET` | `/health` | Health check (version, chunk count) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "conversation_not_found", "message": "conversation not found: 42" } }
//! ```
//!
//! Codes are those of [`RagError::code`] plus `bad_request` for malformed
//! input. Caller errors map to 4xx, provider and storage failures to 5xx.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use knowbridge_core::error::ProviderError;
use knowbridge_core::models::{Conversation, Message};

use crate::app::App;
use crate::error::RagError;
use crate::indexer::IndexReport;
use crate::orchestrator::AskResponse;

const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Start the HTTP server on `[server].bind` and run until terminated.
pub async fn run_server(app: Arc<App>) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let router = router(app);

    info!(bind = %bind_addr, "knowbridge server listening");
    println!("Knowbridge server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

/// Build the API router over an assembled [`App`].
pub fn router(app: Arc<App>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ask", post(handle_ask))
        .route("/conversations", post(handle_create_conversation))
        .route("/conversations/{id}", delete(handle_delete_conversation))
        .route("/conversations/{id}/messages", get(handle_get_messages))
        .route("/documents/{id}", delete(handle_delete_document))
        .route("/documents/{id}/index", post(handle_index_document))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(app)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn status_for(err: &RagError) -> StatusCode {
    match err {
        RagError::ConversationNotFound(_) | RagError::DocumentNotFound(_) => StatusCode::NOT_FOUND,
        RagError::Completion(ProviderError::ContentFiltered(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        RagError::Completion(ProviderError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
        RagError::Completion(ProviderError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        RagError::Completion(_) | RagError::EmbeddingFailed(_) => StatusCode::BAD_GATEWAY,
        RagError::RetrievalUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        RagError::TemplateConfiguration(_) | RagError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            error!(code = err.code(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    chunks: usize,
}

async fn handle_health(State(app): State<Arc<App>>) -> Result<Json<HealthResponse>, AppError> {
    let chunks = app
        .search
        .count_chunks()
        .await
        .map_err(RagError::Storage)?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        chunks,
    }))
}

// ============ POST /ask ============

#[derive(Deserialize)]
struct AskRequest {
    query: String,
    conversation_id: Option<String>,
    user_id: Option<String>,
    template: Option<String>,
}

async fn handle_ask(
    State(app): State<Arc<App>>,
    Json(req): Json<AskRequest>,
) -> Result<Json<AskResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let response = app
        .orchestrator
        .ask(
            &req.query,
            req.conversation_id.as_deref(),
            req.user_id.as_deref(),
            req.template.as_deref(),
        )
        .await?;
    Ok(Json(response))
}

// ============ Conversations ============

#[derive(Deserialize, Default)]
struct CreateConversationRequest {
    user_id: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

async fn handle_create_conversation(
    State(app): State<Arc<App>>,
    body: Option<Json<CreateConversationRequest>>,
) -> Result<(StatusCode, Json<Conversation>), AppError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let conversation = app
        .orchestrator
        .conversations()
        .create_conversation(req.user_id.as_deref(), req.metadata)
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct HistoryResponse {
    conversation_id: String,
    messages: Vec<Message>,
}

async fn handle_get_messages(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, AppError> {
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit == 0 {
        return Err(bad_request("limit must be >= 1"));
    }
    let messages = app.orchestrator.get_history(&id, limit).await?;
    Ok(Json(HistoryResponse {
        conversation_id: id,
        messages,
    }))
}

async fn handle_delete_conversation(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    app.orchestrator
        .conversations()
        .delete_conversation(&id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Documents ============

async fn handle_index_document(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<Json<IndexReport>, AppError> {
    let report = app.indexer.index_document(&id).await?;
    Ok(Json(report))
}

#[derive(Serialize)]
struct DeleteDocumentResponse {
    document_id: String,
    chunks_deleted: usize,
}

async fn handle_delete_document(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteDocumentResponse>, AppError> {
    let chunks_deleted = app.indexer.delete_document(&id).await?;
    if chunks_deleted == 0 {
        return Err(RagError::DocumentNotFound(id).into());
    }
    Ok(Json(DeleteDocumentResponse {
        document_id: id,
        chunks_deleted,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use knowbridge_core::embedding::HashingProvider;
    use knowbridge_core::store::memory::InMemoryBackend;

    use crate::app::Components;
    use crate::completion::DisabledCompleter;
    use crate::conversation::InMemoryConversations;
    use crate::sources::StaticDocumentSource;

    fn memory_config() -> crate::config::Config {
        crate::config::parse_config(
            r#"
            [db]
            path = "unused.sqlite"

            [retrieval]
            backend = "memory"
            "#,
        )
        .unwrap()
    }

    async fn serve(app: App) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Arc::new(app);
        tokio::spawn(async move {
            axum::serve(listener, router(app)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// Serve a memory-backed app on an ephemeral port; returns the base URL.
    async fn spawn_app() -> String {
        serve(App::build(memory_config()).await.unwrap()).await
    }

    #[tokio::test]
    async fn test_index_then_delete_document() {
        let source = Arc::new(StaticDocumentSource::new(20));
        source
            .put_text(
                "handbook",
                "handbook.md",
                "Expense reports go through the finance portal.\n\nLaptops are refreshed every three years.",
            )
            .unwrap();
        let components = Components {
            search: Arc::new(InMemoryBackend::new()),
            conversations: Arc::new(InMemoryConversations::new()),
            embedder: Arc::new(HashingProvider::new(64)),
            completer: Arc::new(DisabledCompleter),
            source,
        };
        let base = serve(App::assemble(memory_config(), components).unwrap()).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/documents/handbook/index", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let report: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(report["document_id"], "handbook");
        assert_eq!(report["chunks_indexed"], 2);
        assert_eq!(report["embedded"], 2);

        let health: serde_json::Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["chunks"], 2);

        let resp = client
            .delete(format!("{}/documents/handbook", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["chunks_deleted"], 2);
    }

    #[tokio::test]
    async fn test_health() {
        let base = spawn_app().await;
        let resp = reqwest::get(format!("{}/health", base)).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["chunks"], 0);
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_404() {
        let base = spawn_app().await;
        let resp = reqwest::get(format!("{}/conversations/nope/messages", base))
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "conversation_not_found");
    }

    #[tokio::test]
    async fn test_empty_query_is_400() {
        let base = spawn_app().await;
        let resp = reqwest::Client::new()
            .post(format!("{}/ask", base))
            .json(&serde_json::json!({ "query": "  " }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_create_then_delete_conversation() {
        let base = spawn_app().await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/conversations", base))
            .json(&serde_json::json!({ "user_id": "u9" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["user_id"], "u9");
        let id = body["id"].as_str().unwrap().to_string();

        let resp = client
            .delete(format!("{}/conversations/{}", base, id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NO_CONTENT);

        let resp = client
            .delete(format!("{}/conversations/{}", base, id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_document_is_404() {
        let base = spawn_app().await;
        let resp = reqwest::Client::new()
            .post(format!("{}/documents/missing/index", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "document_not_found");
    }
}
