//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/documents` | List stored documents with their classification |
//! | `DELETE` | `/documents?doc_names=a&doc_names=b` | Delete documents, then reindex |
//! | `POST`   | `/upload` | Multipart upload: `files` parts plus one `categories` field per file |
//! | `POST`   | `/chat` | Answer the latest user message from retrieved context |
//! | `POST`   | `/run_indexer` | Trigger an indexer run |
//! | `GET`    | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "extraction_failed", "message": "Failed to process XLSX: ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `extraction_failed` (400 for
//! spreadsheets, 500 otherwise), `internal` (500).
//!
//! # CORS
//!
//! Only origins listed in `server.allowed_origins` are allowed. Credentials
//! are permitted; methods and headers are mirrored from the preflight.

use axum::{
    extract::{DefaultBodyLimit, Multipart, RawQuery, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::chat::{self, ChatSettings};
use crate::config::Config;
use crate::documents;
use crate::extract::FileKind;
use crate::ingest::{self, IngestError, IngestSettings, UploadFile};
use crate::models::{ChatMessage, ChatReply, DeleteReport, DocumentList, IndexerRun, UploadReport};
use crate::services::Services;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    services: Services,
    config: Arc<Config>,
}

/// Build the router with all routes and layers.
///
/// Fails if an entry of `server.allowed_origins` is not a valid header value.
pub fn build_router(services: Services, config: Arc<Config>) -> anyhow::Result<Router> {
    let cors = cors_layer(&config.server.allowed_origins)?;
    let body_limit = config.server.max_upload_bytes;
    let state = AppState { services, config };

    Ok(Router::new()
        .route(
            "/documents",
            get(handle_list_documents).delete(handle_delete_documents),
        )
        .route("/upload", post(handle_upload))
        .route("/chat", post(handle_chat))
        .route("/run_indexer", post(handle_run_indexer))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let origins = origins
        .iter()
        .map(|o| {
            HeaderValue::from_str(o.trim_end_matches('/'))
                .map_err(|_| anyhow::anyhow!("invalid CORS origin: {}", o))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true))
}

/// Starts the HTTP server on `server.bind` and runs until the process exits.
pub async fn run_server(config: Config, services: Services) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = build_router(services, Arc::new(config))?;

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("listening on http://{}", bind_addr);
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

#[derive(Debug)]
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

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{:#}", err), "request failed");
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal".to_string(),
            message: format!("{:#}", err),
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Extraction { file, source } => {
                // Spreadsheets are the one format reported as a client error.
                let status = if source.kind() == Some(FileKind::Spreadsheet) {
                    StatusCode::BAD_REQUEST
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                tracing::warn!(file = %file, error = %source, "upload rejected");
                AppError {
                    status,
                    code: "extraction_failed".to_string(),
                    message: source.to_string(),
                }
            }
            IngestError::Service(e) => e.into(),
        }
    }
}

// ============ GET /health ============

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

// ============ /documents ============

async fn handle_list_documents(
    State(state): State<AppState>,
) -> Result<Json<DocumentList>, AppError> {
    let documents = documents::list_documents(state.services.store.as_ref()).await?;
    Ok(Json(DocumentList { documents }))
}

/// Repeated `doc_names` query parameters, in order.
fn doc_names_from_query(query: Option<&str>) -> Vec<String> {
    query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .filter(|(k, _)| k == "doc_names")
                .map(|(_, v)| v.into_owned())
                .collect()
        })
        .unwrap_or_default()
}

async fn handle_delete_documents(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Result<Json<DeleteReport>, AppError> {
    let doc_names = doc_names_from_query(query.as_deref());
    if doc_names.iter().all(|n| n.is_empty()) {
        return Err(bad_request("doc_names must not be empty"));
    }
    let doc_names: Vec<String> = doc_names.into_iter().filter(|n| !n.is_empty()).collect();

    let report = documents::delete_and_reindex(
        state.services.store.as_ref(),
        state.services.search.as_ref(),
        &doc_names,
        state.config.documents.delete_match,
    )
    .await?;
    Ok(Json(report))
}

// ============ POST /upload ============

/// Pair `files` parts with `categories` fields by position.
async fn read_upload_form(mut multipart: Multipart) -> Result<Vec<UploadFile>, AppError> {
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();
    let mut categories: Vec<String> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        match field.name() {
            Some("files") => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| bad_request("file part has no filename"))?;
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("failed to read {}: {}", filename, e)))?;
                files.push((filename, bytes.to_vec()));
            }
            Some("categories") => {
                let category = field
                    .text()
                    .await
                    .map_err(|e| bad_request(format!("invalid categories field: {}", e)))?;
                categories.push(category);
            }
            _ => {}
        }
    }

    if files.is_empty() {
        return Err(bad_request("no files uploaded"));
    }
    if files.len() != categories.len() {
        return Err(bad_request(format!(
            "got {} files but {} categories",
            files.len(),
            categories.len()
        )));
    }

    Ok(files
        .into_iter()
        .zip(categories)
        .map(|((filename, bytes), category)| UploadFile::new(&filename, category, bytes))
        .collect())
}

async fn handle_upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<UploadReport>, AppError> {
    let files = read_upload_form(multipart).await?;
    if let Some(bad) = files
        .iter()
        .find(|f| f.filename.is_empty() || f.classification.contains('/'))
    {
        return Err(bad_request(format!(
            "invalid file name or category: {:?} / {:?}",
            bad.filename, bad.classification
        )));
    }

    tracing::info!(files = files.len(), "upload received");
    let report = ingest::upload_batch(
        state.services.store.as_ref(),
        state.services.search.as_ref(),
        state.services.layout.as_deref(),
        files,
        IngestSettings::from(state.config.as_ref()),
    )
    .await?;
    Ok(Json(report))
}

// ============ POST /chat ============

/// A bare array of messages, or an object wrapping one.
#[derive(Deserialize)]
#[serde(untagged)]
enum ChatRequest {
    Messages(Vec<ChatMessage>),
    Wrapped { messages: Vec<ChatMessage> },
}

impl ChatRequest {
    fn into_messages(self) -> Vec<ChatMessage> {
        match self {
            ChatRequest::Messages(m) | ChatRequest::Wrapped { messages: m } => m,
        }
    }
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatReply>, AppError> {
    let messages = request.into_messages();
    let reply = chat::answer(
        state.services.search.as_ref(),
        state.services.completion.as_ref(),
        &messages,
        ChatSettings::from(state.config.as_ref()),
    )
    .await?;
    Ok(Json(reply))
}

// ============ POST /run_indexer ============

async fn handle_run_indexer(State(state): State<AppState>) -> Json<IndexerRun> {
    Json(state.services.search.run_indexer().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_names_parsed_in_order() {
        assert_eq!(
            doc_names_from_query(Some("doc_names=a%20b.pdf&other=x&doc_names=c.txt")),
            vec!["a b.pdf", "c.txt"]
        );
        assert!(doc_names_from_query(None).is_empty());
        assert!(doc_names_from_query(Some("x=1")).is_empty());
    }

    #[test]
    fn invalid_origin_rejected() {
        assert!(cors_layer(&["https://ok.example".to_string()]).is_ok());
        assert!(cors_layer(&["bad\norigin".to_string()]).is_err());
    }

    #[test]
    fn chat_request_accepts_both_shapes() {
        let bare: ChatRequest =
            serde_json::from_str(r#"[{"role":"user","content":"hi"}]"#).unwrap();
        assert_eq!(bare.into_messages().len(), 1);
        let wrapped: ChatRequest =
            serde_json::from_str(r#"{"messages":[{"role":"user","content":"hi"}]}"#).unwrap();
        assert_eq!(wrapped.into_messages()[0].content, "hi");
    }

    #[test]
    fn spreadsheet_failures_are_client_errors() {
        let err: AppError = IngestError::Extraction {
            file: "book.xlsx".into(),
            source: crate::extract::extract_local(b"junk", FileKind::Spreadsheet).unwrap_err(),
        }
        .into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "extraction_failed");
        assert!(err.message.starts_with("Failed to process XLSX"));

        let err: AppError = IngestError::Extraction {
            file: "notes.txt".into(),
            source: crate::extract::extract_local(&[0xff], FileKind::PlainText).unwrap_err(),
        }
        .into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
