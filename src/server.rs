//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/ingest` | Ingest one piece of text |
//! | `POST` | `/ingest/bulk` | Ingest several items in order |
//! | `POST` | `/search` | Vector search with filters |
//! | `POST` | `/ask` | Agentic search plus answer synthesis |
//! | `POST` | `/history/clear` | Forget the server-side conversation |
//! | `GET`  | `/file/{*path}` | A note with its citations |
//! | `GET`  | `/files?path=` | Directory listing inside the vault |
//! | `GET`  | `/connectors` | Registered connectors |
//! | `POST` | `/connectors/{id}/sync` | Fetch (and optionally ingest) updates |
//! | `POST` | `/mcp` | MCP Streamable HTTP endpoint (see [`crate::mcp`]) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "forbidden", "message": "Access denied: path escapes the vault: ../x" } }
//! ```
//!
//! Codes: `bad_request` (400), `forbidden` (403), `not_found` (404),
//! `internal` (500). Search, ask and ingest report degraded backends inside a
//! normal 200 body rather than as HTTP errors.
//!
//! Ingestion from `/ingest`, `/ingest/bulk` and connector syncs goes through a
//! single lock, so at most one request mutates the vault at a time.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};

use crate::agentic::{read_file, ToolError};
use crate::app::Services;
use crate::citations::Citations;
use crate::connectors::{ConnectorMetadata, ConnectorRegistry, SyncContext, SyncResult};
use crate::history::{ChatMessage, ConversationHistory};
use crate::ingest::{BulkOutcome, IngestItem};
use crate::mcp::mcp_service;
use crate::models::{IngestOutcome, SourceMetadata};
use crate::progress::NoProgress;
use crate::retrieval::{SearchRequest, SearchResponse};
use crate::synthesis::{AskResponse, ChatScene};
use crate::vault::{list_dir, DirEntryInfo, VaultPathError};

const HISTORY_FOR_ASK: usize = 6;

#[derive(Clone)]
pub struct AppState {
    services: Arc<Services>,
    connectors: Arc<ConnectorRegistry>,
    ingest_lock: Arc<Mutex<()>>,
    history: Arc<Mutex<ConversationHistory>>,
}

impl AppState {
    pub fn new(services: Services, connectors: ConnectorRegistry) -> Self {
        Self {
            services: Arc::new(services),
            connectors: Arc::new(connectors),
            ingest_lock: Arc::new(Mutex::new(())),
            history: Arc::new(Mutex::new(ConversationHistory::default())),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .route("/health", get(handle_health))
        .route("/ingest", post(handle_ingest))
        .route("/ingest/bulk", post(handle_ingest_bulk))
        .route("/search", post(handle_search))
        .route("/ask", post(handle_ask))
        .route("/history/clear", post(handle_history_clear))
        .route("/file/{*path}", get(handle_file))
        .route("/files", get(handle_files))
        .route("/connectors", get(handle_connectors))
        .route("/connectors/{id}/sync", post(handle_sync));

    if state.services.config.server.mcp {
        app = app.nest_service("/mcp", mcp_service(state.services.clone()));
    }

    app.layer(cors).with_state(state)
}

/// Serve on an already-bound listener until the process is stopped.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Bind to `[server].bind` and serve.
pub async fn run_server(services: Services, connectors: ConnectorRegistry) -> anyhow::Result<()> {
    let bind_addr = services.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, vault = %services.config.vault.root.display(), "server listening");
    println!("brainvault listening on http://{}", bind_addr);
    if services.config.server.mcp {
        println!("MCP endpoint at http://{}/mcp", bind_addr);
    }
    serve(listener, AppState::new(services, connectors)).await
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
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn forbidden(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::FORBIDDEN,
        code: "forbidden",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

impl From<ToolError> for AppError {
    fn from(e: ToolError) -> Self {
        match e {
            ToolError::PathEscapes(_) => forbidden(e.to_string()),
            ToolError::NotFound(_) => not_found(e.to_string()),
            ToolError::InvalidInput(_) | ToolError::BadPattern(_) => bad_request(e.to_string()),
            ToolError::UnknownTool(_) | ToolError::Io(_) => internal(e.to_string()),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ POST /ingest, /ingest/bulk ============

#[derive(Deserialize)]
struct IngestRequest {
    text: String,
    #[serde(default)]
    metadata: Option<SourceMetadata>,
    #[serde(default)]
    max_retries: Option<u32>,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Json<IngestOutcome> {
    let _guard = state.ingest_lock.lock().await;
    let outcome = state
        .services
        .orchestrator
        .ingest(&req.text, req.metadata, req.max_retries)
        .await;
    Json(outcome)
}

#[derive(Deserialize)]
struct BulkRequest {
    items: Vec<IngestItem>,
}

async fn handle_ingest_bulk(
    State(state): State<AppState>,
    Json(req): Json<BulkRequest>,
) -> Json<BulkOutcome> {
    let _guard = state.ingest_lock.lock().await;
    Json(state.services.orchestrator.ingest_bulk(req.items).await)
}

// ============ POST /search ============

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Json<SearchResponse> {
    Json(state.services.retrieval.search(&req).await)
}

// ============ POST /ask, /history/clear ============

#[derive(Deserialize)]
struct AskRequest {
    query: String,
    /// Client-held history; the server keeps its own when absent.
    #[serde(default)]
    conversation_history: Option<Vec<ChatMessage>>,
    /// Answer in the owner's voice for this chat scene.
    #[serde(default)]
    persona: Option<ChatScene>,
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<AskResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }

    let client_history = req.conversation_history.is_some();
    let history = match req.conversation_history {
        Some(h) => h,
        None => state.history.lock().await.recent(HISTORY_FOR_ASK),
    };

    let response = match &req.persona {
        Some(scene) => {
            let (contexts, strategy, iterations) = state.services.ask.gather(&req.query).await;
            let answer = state
                .services
                .persona
                .reply(&req.query, &contexts, scene, &history)
                .await;
            AskResponse {
                answer,
                contexts,
                strategy: strategy.to_string(),
                iterations,
            }
        }
        None => state.services.ask.ask(&req.query, &history).await,
    };

    if !client_history {
        state
            .history
            .lock()
            .await
            .record_exchange(&req.query, &response.answer);
    }
    Ok(Json(response))
}

#[derive(Serialize)]
struct HistoryClearResponse {
    cleared: usize,
}

async fn handle_history_clear(State(state): State<AppState>) -> Json<HistoryClearResponse> {
    let mut history = state.history.lock().await;
    let cleared = history.len();
    history.clear();
    Json(HistoryClearResponse { cleared })
}

// ============ GET /file/{*path}, /files ============

#[derive(Serialize)]
struct FileResponse {
    path: String,
    content: String,
    citations: Citations,
}

async fn handle_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Json<FileResponse>, AppError> {
    let file = read_file(
        &state.services.config.vault.root,
        &path,
        state.services.ledger.as_ref(),
    )?;
    Ok(Json(FileResponse {
        path: file.filepath,
        content: file.content,
        citations: file.citations,
    }))
}

#[derive(Deserialize)]
struct FilesQuery {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Serialize)]
struct FilesResponse {
    path: String,
    entries: Vec<DirEntryInfo>,
}

async fn handle_files(
    State(state): State<AppState>,
    Query(q): Query<FilesQuery>,
) -> Result<Json<FilesResponse>, AppError> {
    let entries = list_dir(&state.services.config.vault.root, q.path.as_deref()).map_err(|e| {
        match e.downcast_ref::<VaultPathError>() {
            Some(VaultPathError::Escapes(_)) => forbidden(e.to_string()),
            Some(VaultPathError::Invalid(_)) => bad_request(e.to_string()),
            None => not_found(e.to_string()),
        }
    })?;
    Ok(Json(FilesResponse {
        path: q.path.unwrap_or_default(),
        entries,
    }))
}

// ============ Connectors ============

#[derive(Serialize)]
struct ConnectorListResponse {
    connectors: Vec<ConnectorMetadata>,
}

async fn handle_connectors(State(state): State<AppState>) -> Json<ConnectorListResponse> {
    Json(ConnectorListResponse {
        connectors: state.connectors.list(),
    })
}

#[derive(Deserialize)]
struct SyncRequest {
    #[serde(default = "default_auto_ingest")]
    auto_ingest: bool,
    #[serde(default)]
    limit: Option<usize>,
}

fn default_auto_ingest() -> bool {
    true
}

async fn handle_sync(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<SyncResult>, AppError> {
    let req: SyncRequest = if body.iter().all(u8::is_ascii_whitespace) {
        SyncRequest {
            auto_ingest: true,
            limit: None,
        }
    } else {
        serde_json::from_slice(&body).map_err(|e| bad_request(format!("invalid sync body: {}", e)))?
    };
    let connector = state
        .connectors
        .get(&id)
        .ok_or_else(|| not_found(format!("no connector registered with id: {}", id)))?;

    let state_dir = state.services.config.vault.state_dir();
    let _guard = state.ingest_lock.lock().await;
    let ctx = SyncContext {
        state_dir: &state_dir,
        ingest: req.auto_ingest.then_some(&state.services.orchestrator),
        progress: &NoProgress,
    };
    Ok(Json(connector.sync(&ctx, req.limit).await))
}
