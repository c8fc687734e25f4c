//! JSON HTTP API for the reasoning pipeline.
//!
//! Exposes retrieval, composition, deterministic rules, and evidence
//! lookups to the simulator frontend, plus the operator cache surface.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/v1/retrieve` | Rank case passages for a query |
//! | `POST` | `/v1/explain` | Compose a grounded answer bundle |
//! | `POST` | `/v1/dose` | Weight-based dose calculation |
//! | `POST` | `/v1/algo` | Algorithm steps and stage gate |
//! | `POST` | `/v1/evidence` | External literature search |
//! | `GET`  | `/v1/cache/stats` | Session-cache statistics |
//! | `POST` | `/v1/cache/clear` | Clear one session or everything |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "rate_limited", "message": "rate limit exceeded for retrieval" } }
//! ```
//!
//! Error codes: `bad_request` (400), `timeout` (408), `rate_limited` (429),
//! `circuit_open` (503), `internal` (500). Note that composition failures
//! downstream of the guard do not error at all: they arrive as a normal
//! bundle with `fallback: true`.
//!
//! # Requester identity
//!
//! Rate limits and circuit breakers key on a requester id. Retrieval and
//! explain requests carry it in the body; the rules and evidence endpoints
//! read the `X-Requester-Id` header and fall back to `anonymous`.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted; the simulator frontend
//! is served from a different origin.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::compose::ExplainRequest;
use crate::config::Config;
use crate::error::PipelineError;
use crate::evidence::EvidenceQuery;
use crate::models::{
    AlgoQuery, AlgoResponse, Article, CacheStats, DoseQuery, DoseResponse, GroundedBundle,
    PassageQuery, RetrievalResult,
};
use crate::pipeline::Pipeline;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
}

/// Starts the HTTP server.
///
/// Binds to the address configured in `[server].bind` and serves until the
/// process is terminated. Assumes `evh init` has already been run.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let pipeline = Arc::new(Pipeline::connect(config).await?);

    let state = AppState { pipeline };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/v1/retrieve", post(handle_retrieve))
        .route("/v1/explain", post(handle_explain))
        .route("/v1/dose", post(handle_dose))
        .route("/v1/algo", post(handle_algo))
        .route("/v1/evidence", post(handle_evidence))
        .route("/v1/cache/stats", get(handle_cache_stats))
        .route("/v1/cache/clear", post(handle_cache_clear))
        .layer(cors)
        .with_state(state);

    println!("evidence harness listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
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
    /// Machine-readable error code (e.g., `"rate_limited"`).
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

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

/// Map pipeline failures onto the HTTP error contract. Only guard
/// rejections carry their own status; anything else that escapes a
/// handler is a server fault.
fn classify_pipeline_error(err: PipelineError) -> AppError {
    let message = err.to_string();
    match err {
        PipelineError::RateLimited(_) => AppError {
            status: StatusCode::TOO_MANY_REQUESTS,
            code: "rate_limited".to_string(),
            message,
        },
        PipelineError::CircuitOpen(_) => AppError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "circuit_open".to_string(),
            message,
        },
        PipelineError::Timeout(_) => AppError {
            status: StatusCode::REQUEST_TIMEOUT,
            code: "timeout".to_string(),
            message,
        },
        PipelineError::Validation(_) => bad_request(message),
        _ => internal(message),
    }
}

fn requester_from(headers: &HeaderMap) -> String {
    headers
        .get("x-requester-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(|| "anonymous".to_string())
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

// ============ POST /v1/retrieve ============

async fn handle_retrieve(
    State(state): State<AppState>,
    Json(query): Json<PassageQuery>,
) -> Result<Json<RetrievalResult>, AppError> {
    if query.text.trim().is_empty() {
        return Err(bad_request("query text must not be empty"));
    }

    let result = state
        .pipeline
        .retriever()
        .retrieve(&query)
        .await
        .map_err(classify_pipeline_error)?;

    Ok(Json(result))
}

// ============ POST /v1/explain ============

async fn handle_explain(
    State(state): State<AppState>,
    Json(request): Json<ExplainRequest>,
) -> Result<Json<GroundedBundle>, AppError> {
    let bundle = state
        .pipeline
        .composer()
        .explain(&request)
        .await
        .map_err(classify_pipeline_error)?;

    Ok(Json(bundle))
}

// ============ POST /v1/dose ============

async fn handle_dose(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(query): Json<DoseQuery>,
) -> Result<Json<DoseResponse>, AppError> {
    let requester = requester_from(&headers);
    let response = state
        .pipeline
        .rules()
        .dose(&requester, &query)
        .await
        .map_err(classify_pipeline_error)?;

    Ok(Json(response))
}

// ============ POST /v1/algo ============

async fn handle_algo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(query): Json<AlgoQuery>,
) -> Result<Json<AlgoResponse>, AppError> {
    let requester = requester_from(&headers);
    let response = state
        .pipeline
        .rules()
        .algorithm(&requester, &query)
        .await
        .map_err(classify_pipeline_error)?;

    Ok(Json(response))
}

// ============ POST /v1/evidence ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvidenceBody {
    intervention: String,
    case_type: String,
    #[serde(default)]
    age_group: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ArticlesResponse {
    articles: Vec<Article>,
}

async fn handle_evidence(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EvidenceBody>,
) -> Result<Json<ArticlesResponse>, AppError> {
    if body.intervention.trim().is_empty() {
        return Err(bad_request("intervention must not be empty"));
    }

    let requester = requester_from(&headers);
    let query = EvidenceQuery {
        intervention: body.intervention,
        case_type: body.case_type,
        age_group: body.age_group,
        limit: body
            .limit
            .unwrap_or_else(|| state.pipeline.evidence().default_limit()),
    };

    let articles = state
        .pipeline
        .evidence()
        .search(&requester, &query)
        .await
        .map_err(classify_pipeline_error)?;

    Ok(Json(ArticlesResponse { articles }))
}

// ============ Cache management ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearBody {
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClearResponse {
    cleared: usize,
}

async fn handle_cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.pipeline.cache().stats())
}

async fn handle_cache_clear(
    State(state): State<AppState>,
    Json(body): Json<ClearBody>,
) -> Json<ClearResponse> {
    let cache = state.pipeline.cache();
    let cleared = match body.session_id {
        Some(session_id) => cache.clear_session(&session_id),
        None => cache.clear_all(),
    };
    Json(ClearResponse { cleared })
}
