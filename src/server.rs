//! HTTP API server.
//!
//! Exposes ingestion, retrieval-grounded chat, conversation management,
//! and the accounting surface as a JSON API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents/upload?name=` | Ingest raw body bytes as one document |
//! | `POST` | `/documents/sources` | Batch ingestion of URL sources |
//! | `POST` | `/documents/preview` | Preview a URL without creating a document |
//! | `GET`  | `/documents?skip=&limit=` | Paginated document listing |
//! | `GET`  | `/documents/stats` | Document/chunk statistics |
//! | `DELETE` | `/documents/{id}` | Delete a document (cascades to chunks) |
//! | `POST` | `/chat` | One chat turn (general or document-grounded) |
//! | `GET`  | `/conversations?skip=&limit=` | List conversations |
//! | `GET`  | `/conversations/{id}/messages?skip=&limit=` | List messages |
//! | `DELETE` | `/conversations/{id}` | Delete a conversation + messages |
//! | `GET`  | `/accounting/status` | Connection state + liveness probe |
//! | `POST` | `/accounting/connect` · `/accounting/disconnect` | Lifecycle |
//! | `GET`  | `/accounting/companies` | Cached company list |
//! | `GET`  | `/accounting/ledgers` · `/vouchers` · `/stock-items` | Record lists |
//! | `GET`  | `/accounting/metrics` | Financial snapshot (live or demo) |
//! | `GET`  | `/health` | Health check |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Codes: `bad_request` (400), `not_found` (404), `timeout` (408),
//! `upstream_unavailable` (502), `internal` (500). Degraded accounting
//! reads never error — they return empty lists or demo snapshots.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser
//! frontends.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::aggregator::AccountingAggregator;
use crate::chat::{ChatError, ChatOrchestrator, ChatRequest};
use crate::config::Config;
use crate::connector::AccountingConnector;
use crate::conversation::{ConversationLocks, ConversationStore};
use crate::db;
use crate::error::{IngestionError, ValidationError};
use crate::extract::ContentKind;
use crate::ingest::IngestPipeline;
use crate::migrate;
use crate::models::{Company, LedgerEntry, StockItem, Voucher};
use crate::registry::DocumentRegistry;
use crate::sources::SourceInput;

/// Everything the handlers need, built once at startup.
pub struct AppContext {
    pub config: Arc<Config>,
    pub pipeline: Arc<IngestPipeline>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub registry: Arc<DocumentRegistry>,
    pub conversations: Arc<ConversationStore>,
    pub connector: Arc<AccountingConnector>,
    pub aggregator: Arc<AccountingAggregator>,
}

type AppState = Arc<AppContext>;

/// Build the shared application context: database, pipeline, orchestrator,
/// and the (single) accounting connector.
pub async fn build_context(config: Arc<Config>) -> anyhow::Result<AppState> {
    let pool = db::connect(&config).await?;
    migrate::apply_schema(&pool).await?;

    let connector = Arc::new(AccountingConnector::new(config.accounting.clone()));
    let aggregator = Arc::new(AccountingAggregator::new(
        Arc::clone(&connector),
        &config.accounting,
    ));
    let locks = Arc::new(ConversationLocks::new());

    Ok(Arc::new(AppContext {
        pipeline: Arc::new(IngestPipeline::new(Arc::clone(&config), pool.clone())?),
        orchestrator: Arc::new(ChatOrchestrator::new(
            Arc::clone(&config),
            pool.clone(),
            locks,
        )?),
        registry: Arc::new(DocumentRegistry::new(pool.clone())),
        conversations: Arc::new(ConversationStore::new(pool)),
        connector,
        aggregator,
        config,
    }))
}

/// Build the router over an existing context. Separated from
/// [`run_server`] so tests can drive the API in-process.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/documents/upload", post(handle_upload))
        .route("/documents/sources", post(handle_sources))
        .route("/documents/preview", post(handle_preview))
        .route("/documents", get(handle_list_documents))
        .route("/documents/stats", get(handle_stats))
        .route("/documents/{id}", delete(handle_delete_document))
        .route("/chat", post(handle_chat))
        .route("/conversations", get(handle_list_conversations))
        .route(
            "/conversations/{id}/messages",
            get(handle_list_messages),
        )
        .route("/conversations/{id}", delete(handle_delete_conversation))
        .route("/accounting/status", get(handle_accounting_status))
        .route("/accounting/connect", post(handle_accounting_connect))
        .route("/accounting/disconnect", post(handle_accounting_disconnect))
        .route("/accounting/companies", get(handle_companies))
        .route("/accounting/ledgers", get(handle_ledgers))
        .route("/accounting/vouchers", get(handle_vouchers))
        .route("/accounting/stock-items", get(handle_stock_items))
        .route("/accounting/metrics", get(handle_metrics))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Start the server on the configured bind address and run until the
/// process is terminated. Spawns the accounting poller when enabled.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let state = build_context(Arc::new(config.clone())).await?;

    state.connector.spawn_poller().await;

    let app = build_router(state);

    info!(bind = %bind_addr, "API server listening");
    println!("finsight API listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
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

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn timeout_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::REQUEST_TIMEOUT,
        code: "timeout",
        message: message.into(),
    }
}

fn upstream_unavailable(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_GATEWAY,
        code: "upstream_unavailable",
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

impl From<ValidationError> for AppError {
    fn from(e: ValidationError) -> Self {
        bad_request(e.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        internal(e.to_string())
    }
}

// ============ Pagination ============

#[derive(Deserialize)]
struct Page {
    #[serde(default)]
    skip: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

impl Page {
    fn resolve(&self, default_limit: i64, max_limit: i64) -> (i64, i64) {
        let skip = self.skip.unwrap_or(0).max(0);
        let limit = self.limit.unwrap_or(default_limit).clamp(1, max_limit);
        (skip, limit)
    }
}

// ============ Documents ============

#[derive(Deserialize)]
struct UploadParams {
    name: String,
}

async fn handle_upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let documents = state
        .pipeline
        .ingest(vec![SourceInput::Upload {
            name: params.name,
            bytes: body.to_vec(),
        }])
        .await?;
    Ok(Json(serde_json::json!({ "documents": documents })))
}

#[derive(Deserialize)]
struct SourcesRequest {
    sources: Vec<SourceSpec>,
}

#[derive(Deserialize)]
struct SourceSpec {
    kind: String,
    #[serde(default)]
    url: Option<String>,
    /// For `kind = "upload"`: file name plus base64-encoded content.
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    content_base64: Option<String>,
}

impl SourceSpec {
    fn into_input(self) -> Result<SourceInput, AppError> {
        if self.kind == "upload" {
            let name = self
                .name
                .ok_or_else(|| bad_request("upload source requires name"))?;
            let encoded = self
                .content_base64
                .ok_or_else(|| bad_request("upload source requires content_base64"))?;
            let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
                .map_err(|e| bad_request(format!("invalid base64 content: {}", e)))?;
            return Ok(SourceInput::Upload { name, bytes });
        }

        let url = self
            .url
            .ok_or_else(|| bad_request(format!("{} source requires url", self.kind)))?;
        match self.kind.as_str() {
            "pdf_url" => Ok(SourceInput::PdfUrl { url }),
            "web_url" => Ok(SourceInput::WebUrl { url }),
            "drive_file" => Ok(SourceInput::DriveFile { url }),
            "drive_folder" => Ok(SourceInput::DriveFolder { url }),
            other => Err(bad_request(format!("unknown source kind: {}", other))),
        }
    }
}

async fn handle_sources(
    State(state): State<AppState>,
    Json(request): Json<SourcesRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let inputs: Vec<SourceInput> = request
        .sources
        .into_iter()
        .map(SourceSpec::into_input)
        .collect::<Result<_, _>>()?;

    let documents = state.pipeline.ingest(inputs).await?;
    Ok(Json(serde_json::json!({ "documents": documents })))
}

#[derive(Deserialize)]
struct PreviewRequest {
    url: String,
    #[serde(default)]
    kind: Option<String>,
}

fn parse_declared_kind(kind: &str) -> Option<ContentKind> {
    match kind {
        "pdf" | "pdf_url" => Some(ContentKind::Pdf),
        "html" | "web" | "web_url" => Some(ContentKind::Html),
        "xlsx" => Some(ContentKind::Xlsx),
        "csv" => Some(ContentKind::Csv),
        "docx" => Some(ContentKind::Docx),
        "image" => Some(ContentKind::Image),
        "text" => Some(ContentKind::Text),
        _ => None,
    }
}

async fn handle_preview(
    State(state): State<AppState>,
    Json(request): Json<PreviewRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    url::Url::parse(&request.url)
        .map_err(|_| bad_request(format!("malformed URL: {}", request.url)))?;

    let declared = request.kind.as_deref().and_then(parse_declared_kind);
    let preview = state
        .pipeline
        .preview(&request.url, declared)
        .await
        .map_err(|e| match e {
            IngestionError::Unreachable(m) if m.contains("timed out") => timeout_error(m),
            IngestionError::Unreachable(m) => upstream_unavailable(m),
            other => bad_request(other.to_string()),
        })?;
    Ok(Json(serde_json::to_value(preview).map_err(|e| internal(e.to_string()))?))
}

async fn handle_list_documents(
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (skip, limit) = page.resolve(50, 200);
    let documents = state.registry.list(skip, limit).await?;
    Ok(Json(serde_json::json!({ "documents": documents })))
}

async fn handle_stats(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let stats = state.registry.stats().await?;
    Ok(Json(serde_json::to_value(stats).map_err(|e| internal(e.to_string()))?))
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let deleted = state.registry.delete(&id).await?;
    if !deleted {
        return Err(not_found(format!("document not found: {}", id)));
    }
    Ok(Json(serde_json::json!({ "deleted": id })))
}

// ============ Chat ============

async fn handle_chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let response = state.orchestrator.chat(request).await.map_err(|e| match e {
        ChatError::Validation(v) => bad_request(v.to_string()),
        ChatError::ConversationNotFound(id) => not_found(format!("conversation not found: {}", id)),
        ChatError::Internal(e) => internal(e.to_string()),
    })?;
    Ok(Json(serde_json::to_value(response).map_err(|e| internal(e.to_string()))?))
}

// ============ Conversations ============

async fn handle_list_conversations(
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (skip, limit) = page.resolve(20, 100);
    let conversations = state.conversations.list(skip, limit).await?;
    Ok(Json(serde_json::json!({ "conversations": conversations })))
}

async fn handle_list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(page): Query<Page>,
) -> Result<Json<serde_json::Value>, AppError> {
    if state.conversations.get(&id).await?.is_none() {
        return Err(not_found(format!("conversation not found: {}", id)));
    }
    let (skip, limit) = page.resolve(50, 200);
    let messages = state.conversations.list_messages(&id, skip, limit).await?;
    Ok(Json(serde_json::json!({ "messages": messages })))
}

async fn handle_delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let deleted = state.conversations.delete(&id).await?;
    if !deleted {
        return Err(not_found(format!("conversation not found: {}", id)));
    }
    Ok(Json(serde_json::json!({ "deleted": id })))
}

// ============ Accounting ============

async fn handle_accounting_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let status = state.connector.test_connection().await;
    Json(serde_json::json!({
        "status": status.status,
        "company_name": status.company_name,
        "endpoint": state.connector.endpoint(),
        "last_error": status.last_error,
    }))
}

async fn handle_accounting_connect(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    match state.connector.connect().await {
        Ok(status) => {
            state.connector.spawn_poller().await;
            Ok(Json(serde_json::json!({
                "status": status.status,
                "company_name": status.company_name,
            })))
        }
        Err(e) => Err(upstream_unavailable(e.to_string())),
    }
}

async fn handle_accounting_disconnect(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.connector.disconnect().await;
    Json(serde_json::json!({ "status": "disconnected" }))
}

async fn handle_companies(State(state): State<AppState>) -> Json<serde_json::Value> {
    let companies: Vec<Company> = state.connector.companies().await;
    Json(serde_json::json!({ "companies": companies }))
}

#[derive(Deserialize)]
struct CompanyParams {
    company: String,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    voucher_type: Option<String>,
}

async fn handle_ledgers(
    State(state): State<AppState>,
    Query(params): Query<CompanyParams>,
) -> Json<serde_json::Value> {
    // Degraded reads return empty lists, never errors.
    let ledgers: Vec<LedgerEntry> = state
        .connector
        .ledgers(&params.company)
        .await
        .unwrap_or_default();
    Json(serde_json::json!({ "ledgers": ledgers }))
}

async fn handle_vouchers(
    State(state): State<AppState>,
    Query(params): Query<CompanyParams>,
) -> Json<serde_json::Value> {
    let vouchers: Vec<Voucher> = state
        .connector
        .vouchers(
            &params.company,
            params.from.as_deref(),
            params.to.as_deref(),
            params.voucher_type.as_deref(),
        )
        .await
        .unwrap_or_default();
    Json(serde_json::json!({ "vouchers": vouchers }))
}

async fn handle_stock_items(
    State(state): State<AppState>,
    Query(params): Query<CompanyParams>,
) -> Json<serde_json::Value> {
    let stock_items: Vec<StockItem> = state
        .connector
        .stock_items(&params.company)
        .await
        .unwrap_or_default();
    Json(serde_json::json!({ "stock_items": stock_items }))
}

async fn handle_metrics(
    State(state): State<AppState>,
    Query(params): Query<CompanyParams>,
) -> Json<serde_json::Value> {
    let snapshot = state
        .aggregator
        .financial_metrics(&params.company, params.from.as_deref(), params.to.as_deref())
        .await;
    Json(serde_json::json!({
        "success": true,
        "data": {
            "revenue": snapshot.revenue,
            "expenses": snapshot.expenses,
            "profit": snapshot.profit,
            "net_worth": snapshot.net_worth,
        },
        "data_source": snapshot.data_source,
        "company": snapshot.company,
    }))
}

// ============ Health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
