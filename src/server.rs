//! HTTP front-end.
//!
//! Endpoints:
//! - GET    /health                    - liveness and engine availability
//! - POST   /v1/ocr                    - upload and wait for the result
//! - POST   /v1/documents              - upload, 202 with the document id
//! - GET    /v1/documents/:id          - status and page progress
//! - GET    /v1/documents/:id/result   - result, handed out once
//! - DELETE /v1/documents/:id          - request cancellation
//!
//! Uploads are `multipart/form-data` with a `file` field and optional
//! `languages` and `pages` fields.

use crate::config::PageSelection;
use crate::engine::{OcrEngine, Submission};
use crate::error::OcrError;
use crate::output::OcrOutput;
use crate::pipeline::recognize::parse_languages;
use crate::registry::{DocumentRegistry, DocumentSummary};
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Room for multipart framing and the small text fields on top of
/// `max_input_bytes`.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// How often finished documents past their TTL are dropped.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Where to listen.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7860,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: DocumentRegistry,
}

impl AppState {
    pub fn new(engine: OcrEngine) -> Self {
        Self {
            registry: DocumentRegistry::new(engine),
        }
    }

    fn engine(&self) -> &OcrEngine {
        self.registry.engine()
    }
}

// ============================================================================
// Error Response
// ============================================================================

/// Error returned by handlers.
#[derive(Debug)]
pub enum ApiError {
    Ocr(OcrError),
    Multipart(MultipartError),
}

impl From<OcrError> for ApiError {
    fn from(e: OcrError) -> Self {
        ApiError::Ocr(e)
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        ApiError::Multipart(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: String,
    message: String,
}

/// HTTP status for an engine error.
pub fn status_for(error: &OcrError) -> StatusCode {
    match error {
        OcrError::UnsupportedFormat { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        OcrError::CorruptInput { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        OcrError::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
        OcrError::InputTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        OcrError::InvalidRequest(_) | OcrError::PageOutOfRange { .. } => StatusCode::BAD_REQUEST,
        OcrError::NotFound { .. } => StatusCode::NOT_FOUND,
        OcrError::NotReady { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match &self {
            ApiError::Ocr(e) => {
                let status = status_for(e);
                if status.is_server_error() {
                    tracing::error!("Request failed: {}", e);
                } else if e.is_submission_error() {
                    tracing::debug!("Submission rejected ({}): {}", e.kind(), e);
                }
                (status, e.kind().to_string(), e.to_string())
            }
            ApiError::Multipart(e) => {
                let status = e.status();
                let kind = if status == StatusCode::PAYLOAD_TOO_LARGE {
                    "input_too_large"
                } else {
                    "invalid_request"
                };
                (status, kind.to_string(), e.body_text())
            }
        };

        let body = Json(ErrorBody {
            error: ErrorDetail { kind, message },
        });

        if status == StatusCode::TOO_MANY_REQUESTS {
            (status, [(header::RETRY_AFTER, "1")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let body_limit = state.engine().config().max_input_bytes + MULTIPART_OVERHEAD;

    Router::new()
        .route("/health", get(health))
        .route("/v1/ocr", post(ocr_sync))
        .route("/v1/documents", post(submit_document))
        .route(
            "/v1/documents/:id",
            get(document_status).delete(cancel_document),
        )
        .route("/v1/documents/:id/result", get(document_result))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until Ctrl+C or SIGTERM.
pub async fn serve(config: ServerConfig, engine: OcrEngine) -> Result<(), OcrError> {
    let state = AppState::new(engine);
    let sweeper = state.registry.spawn_sweeper(SWEEP_INTERVAL);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .map_err(|e| {
            OcrError::InvalidConfig(format!("cannot bind {}:{}: {e}", config.host, config.port))
        })?;
    let addr: SocketAddr = listener
        .local_addr()
        .map_err(|e| OcrError::Internal(format!("listener has no address: {e}")))?;
    tracing::info!("OCR server listening on {}", addr);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| OcrError::Internal(format!("server error: {e}")));

    sweeper.abort();
    tracing::info!("Server shutdown complete");
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    engine: String,
    engine_available: bool,
    in_flight: usize,
    capacity: usize,
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine = state.engine();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        engine: engine.recognizer_name().to_string(),
        engine_available: engine.is_available().await,
        in_flight: engine.in_flight(),
        capacity: engine.capacity(),
    })
}

/// POST /v1/ocr
///
/// Runs the document through the pipeline within the request.
async fn ocr_sync(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<OcrOutput>, ApiError> {
    let submission = read_submission(multipart).await?;
    let output = state.engine().recognize(submission).await?;
    Ok(Json(output))
}

/// POST /v1/documents
async fn submit_document(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<DocumentSummary>), ApiError> {
    let submission = read_submission(multipart).await?;
    let summary = state.registry.submit(submission)?;
    Ok((StatusCode::ACCEPTED, Json(summary)))
}

/// GET /v1/documents/:id
async fn document_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentSummary>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.registry.status(id)?))
}

/// GET /v1/documents/:id/result
async fn document_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OcrOutput>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.registry.take_result(id)?))
}

/// DELETE /v1/documents/:id
async fn cancel_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<DocumentSummary>), ApiError> {
    let id = parse_id(&id)?;
    let summary = state.registry.cancel(id)?;
    Ok((StatusCode::ACCEPTED, Json(summary)))
}

/// A malformed id cannot name a document.
fn parse_id(raw: &str) -> Result<Uuid, OcrError> {
    Uuid::parse_str(raw).map_err(|_| OcrError::NotFound { id: raw.to_string() })
}

async fn read_submission(mut multipart: Multipart) -> Result<Submission, ApiError> {
    let mut file: Option<Submission> = None;
    let mut languages: Option<Vec<String>> = None;
    let mut pages: Option<PageSelection> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await?;
                tracing::debug!(
                    "Received file field: name={:?}, content_type={:?}, {} bytes",
                    file_name,
                    content_type,
                    data.len()
                );

                let mut submission = Submission::new(data.to_vec());
                if let Some(ct) = content_type {
                    submission = submission.with_declared_type(ct);
                }
                if let Some(n) = file_name {
                    submission = submission.with_name(n);
                }
                file = Some(submission);
            }
            "languages" => {
                let text = field.text().await?;
                languages = Some(parse_languages(&text));
            }
            "pages" => {
                let text = field.text().await?;
                pages = Some(PageSelection::parse(&text)?);
            }
            other => tracing::debug!("Ignoring multipart field '{}'", other),
        }
    }

    let mut submission =
        file.ok_or_else(|| OcrError::InvalidRequest("missing 'file' field".into()))?;
    submission.languages = languages;
    submission.pages = pages;
    Ok(submission)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let cases = [
            (
                OcrError::UnsupportedFormat {
                    media_type: "image/gif".into(),
                },
                415,
            ),
            (
                OcrError::CorruptInput {
                    media_type: "application/pdf".into(),
                    detail: "x".into(),
                },
                422,
            ),
            (OcrError::QueueFull { capacity: 3 }, 429),
            (OcrError::InputTooLarge { size: 2, limit: 1 }, 413),
            (OcrError::InvalidRequest("x".into()), 400),
            (OcrError::PageOutOfRange { total: 2 }, 400),
            (OcrError::NotFound { id: "x".into() }, 404),
            (
                OcrError::NotReady {
                    id: "x".into(),
                    status: "processing".into(),
                },
                409,
            ),
            (OcrError::Internal("x".into()), 500),
        ];
        for (err, code) in cases {
            assert_eq!(status_for(&err).as_u16(), code, "{}", err.kind());
        }
    }

    #[test]
    fn queue_full_sets_retry_after() {
        let resp = ApiError::from(OcrError::QueueFull { capacity: 1 }).into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "1");
    }

    #[test]
    fn malformed_id_is_not_found() {
        assert!(matches!(parse_id("nope"), Err(OcrError::NotFound { .. })));
        let id = Uuid::new_v4();
        assert_eq!(parse_id(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn default_listen_address() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 7860);
        assert_eq!(config.host, "0.0.0.0");
    }
}
