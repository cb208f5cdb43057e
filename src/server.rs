//! HTTP server for the chat relay.
//!
//! Exposes the streaming chat endpoint plus the surrounding conversation
//! CRUD and operational endpoints.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/chat` | Run one chat turn, streamed as framed events |
//! | `GET`  | `/conversations` | List the caller's conversations |
//! | `GET`  | `/conversations/{id}` | One conversation with its messages |
//! | `PATCH` | `/conversations/{id}` | Rename a conversation |
//! | `DELETE` | `/conversations/{id}` | Delete a conversation |
//! | `POST` | `/mapping/invalidate` | Drop the file-mapping cache |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! The `/chat` request body carries the message, optional client-side
//! history, and an optional conversation id; the response is a
//! unidirectional `text/event-stream` of frames for the duration of the
//! turn (see [`crate::protocol`]). The conversation id (fresh or echoed)
//! is returned in the `x-conversation-id` response header before the first
//! frame.
//!
//! # Identity
//!
//! The authentication layer in front of this service injects the caller's
//! identity as the `x-atlas-user` header; conversations are scoped to it.
//! Requests without the header fall back to `anonymous`.
//!
//! # Error Contract
//!
//! Non-streaming error responses use one JSON shape:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//! Failures after streaming has begun are in-band `error` frames instead.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser
//! clients served from a different origin.

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::models::{Conversation, Message, Role};
use crate::protocol::{encode_frame, StreamEvent};
use crate::relay::ChatRelay;
use crate::resolver::{CitationResolver, HttpMappingFetcher, SystemClock};
use crate::store::{ChatStore, SqliteStore};
use crate::upstream::{ChatTurn, HttpUpstreamClient};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    store: Arc<dyn ChatStore>,
    relay: Arc<ChatRelay>,
    resolver: Arc<CitationResolver>,
}

/// Starts the relay HTTP server.
///
/// Binds to the address configured in `[server].bind` and runs until the
/// process is terminated. Expects the database schema to exist
/// (`atlas init`).
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(&config.db.path).await?;
    let store: Arc<dyn ChatStore> = Arc::new(SqliteStore::new(pool));

    let fetcher = HttpMappingFetcher::new(&config.mapping)?;
    let resolver = Arc::new(CitationResolver::new(
        Box::new(fetcher),
        Box::new(SystemClock),
        Duration::from_secs(config.mapping.ttl_secs),
    ));

    let upstream = Arc::new(HttpUpstreamClient::new(&config.upstream)?);
    let relay = Arc::new(ChatRelay::new(
        upstream,
        resolver.clone(),
        store.clone(),
        config.upstream.knowledge_source.clone(),
        config.upstream.title_max_chars,
    ));

    let state = AppState {
        store,
        relay,
        resolver,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/chat", post(handle_chat))
        .route("/conversations", get(handle_list_conversations))
        .route(
            "/conversations/{id}",
            get(handle_get_conversation)
                .patch(handle_rename_conversation)
                .delete(handle_delete_conversation),
        )
        .route("/mapping/invalidate", post(handle_invalidate_mapping))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    let bind_addr = &config.server.bind;
    info!(bind = %bind_addr, "starting relay server");
    println!("Atlas relay listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"not_found"`).
    code: String,
    /// Human-readable error message.
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
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

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

/// Caller identity injected by the fronting auth layer.
fn owner_from(headers: &HeaderMap) -> String {
    headers
        .get("x-atlas-user")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

// ============ POST /chat ============

/// JSON request body for `POST /chat`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    message: String,
    /// Existing conversation to continue; omitted on the first turn.
    conversation_id: Option<String>,
    /// Client-held history, only used when no conversation id is given
    /// (stateless clients). For known conversations the store is the
    /// source of truth.
    #[serde(default)]
    history: Vec<HistoryTurn>,
}

#[derive(Deserialize)]
struct HistoryTurn {
    role: Role,
    text: String,
}

/// Handler for `POST /chat`.
///
/// Resolves (or creates) the conversation, persists the user message,
/// then hands the turn to the relay and streams its events back as
/// frames. Everything after the response headers is in-band: upstream
/// failures arrive as an `error` frame, not an HTTP status.
async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, AppError> {
    if request.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    let owner = owner_from(&headers);

    let (conversation, history) = match &request.conversation_id {
        Some(id) => {
            let conversation = state
                .store
                .get_conversation(&owner, id)
                .await
                .map_err(|e| internal_error(e.to_string()))?
                .ok_or_else(|| not_found(format!("no conversation with id: {}", id)))?;
            let history = state
                .store
                .list_messages(id)
                .await
                .map_err(|e| internal_error(e.to_string()))?
                .iter()
                .map(|m: &Message| ChatTurn {
                    role: m.role,
                    text: m.content.clone(),
                })
                .collect::<Vec<_>>();
            (conversation, history)
        }
        None => {
            let conversation = state
                .store
                .create_conversation(&owner)
                .await
                .map_err(|e| internal_error(e.to_string()))?;
            let history = request
                .history
                .iter()
                .map(|t| ChatTurn {
                    role: t.role,
                    text: t.text.clone(),
                })
                .collect::<Vec<_>>();
            (conversation, history)
        }
    };

    // Fire-and-forget relative to the stream.
    if let Err(e) = state
        .store
        .append_message(&conversation.id, Role::User, &request.message, &[])
        .await
    {
        warn!(conversation_id = %conversation.id, error = %e, "failed to persist user message");
    }

    let (tx, rx) = mpsc::channel::<StreamEvent>(32);
    let relay = state.relay.clone();
    let conversation_id = conversation.id.clone();
    let question = request.message.clone();
    tokio::spawn(async move {
        relay
            .run_turn(&conversation_id, &history, &question, tx)
            .await;
    });

    let frames = ReceiverStream::new(rx)
        .map(|event| Ok::<_, Infallible>(Bytes::from(encode_frame(&event))));

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-conversation-id", conversation.id)
        .body(Body::from_stream(frames))
        .map_err(|e| internal_error(e.to_string()))
}

// ============ Conversation CRUD ============

/// JSON response body for `GET /conversations`.
#[derive(Serialize)]
struct ConversationListResponse {
    conversations: Vec<Conversation>,
}

async fn handle_list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ConversationListResponse>, AppError> {
    let owner = owner_from(&headers);
    let conversations = state
        .store
        .list_conversations(&owner)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(ConversationListResponse { conversations }))
}

/// JSON response body for `GET /conversations/{id}`.
#[derive(Serialize)]
struct ConversationResponse {
    #[serde(flatten)]
    conversation: Conversation,
    messages: Vec<Message>,
}

async fn handle_get_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, AppError> {
    let owner = owner_from(&headers);
    let conversation = state
        .store
        .get_conversation(&owner, &id)
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .ok_or_else(|| not_found(format!("no conversation with id: {}", id)))?;
    let messages = state
        .store
        .list_messages(&id)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(ConversationResponse {
        conversation,
        messages,
    }))
}

/// JSON request body for `PATCH /conversations/{id}`.
#[derive(Deserialize)]
struct RenameRequest {
    title: String,
}

async fn handle_rename_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Result<Json<Conversation>, AppError> {
    if request.title.trim().is_empty() {
        return Err(bad_request("title must not be empty"));
    }
    let owner = owner_from(&headers);
    state
        .store
        .get_conversation(&owner, &id)
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .ok_or_else(|| not_found(format!("no conversation with id: {}", id)))?;

    state
        .store
        .set_title(&id, request.title.trim())
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    let conversation = state
        .store
        .get_conversation(&owner, &id)
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .ok_or_else(|| internal_error("conversation vanished during rename"))?;
    Ok(Json(conversation))
}

async fn handle_delete_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let owner = owner_from(&headers);
    let deleted = state
        .store
        .delete_conversation(&owner, &id)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    if !deleted {
        return Err(not_found(format!("no conversation with id: {}", id)));
    }
    Ok(Json(serde_json::json!({ "deleted": id })))
}

// ============ POST /mapping/invalidate ============

/// Handler for `POST /mapping/invalidate`.
///
/// Drops the cached file-mapping snapshot so the next citation lookup
/// refreshes. Used after a sync run rewrites the mapping document.
async fn handle_invalidate_mapping(
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    state.resolver.invalidate().await;
    Json(serde_json::json!({ "status": "ok" }))
}

// ============ GET /health ============

/// JSON response body for `GET /health`.
#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    /// The crate version from `Cargo.toml`.
    version: String,
}

/// Handler for `GET /health`.
///
/// Used by load balancers and monitoring tools.
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
