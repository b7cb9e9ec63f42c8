// src/api.rs
//! HTTP surface over the Storage Coordinator.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::analyze::DynAnalyzer;
use crate::error::{AnalysisError, StorageError};
use crate::ingest::AggregateResult;
use crate::metrics::Metrics;
use crate::storage::{ArtifactId, DocumentId, Origin, StorageCoordinator};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<StorageCoordinator>,
    pub analyzer: DynAnalyzer,
}

impl AppState {
    pub fn new(coordinator: Arc<StorageCoordinator>, analyzer: DynAnalyzer) -> Self {
        Self {
            coordinator,
            analyzer,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let metrics = Metrics::init(state.coordinator.settings());

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/snapshot/{subject}", get(get_snapshot))
        .route("/reports/{subject}", get(get_report).post(compile_report))
        .route("/search", post(search))
        .route("/documents/{id}", get(get_document).delete(delete_document))
        .route(
            "/subjects/{subject}/documents",
            axum::routing::delete(delete_subject_documents),
        )
        .route("/admin/invalidate/{subject}", post(invalidate))
        .route("/admin/cleanup", post(cleanup))
        .route("/admin/clear-cache", post(clear_cache))
        .route("/admin/stats", get(stats))
        .merge(metrics.router())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// JSON error body with a status picked from the error kind.
#[derive(Debug)]
pub struct ApiError(StorageError);

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        ApiError(e)
    }
}

impl From<AnalysisError> for ApiError {
    fn from(e: AnalysisError) -> Self {
        ApiError(StorageError::Analysis(e))
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            StorageError::NoDataAvailable { .. }
            | StorageError::DocumentNotFound(_)
            | StorageError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
            StorageError::ArtifactExpired(_) => StatusCode::GONE,
            StorageError::InvalidSubject(_) => StatusCode::BAD_REQUEST,
            StorageError::EmbeddingDimensionMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            StorageError::SimilarityMismatch { .. }
            | StorageError::Backend(_) | StorageError::Schema { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            StorageError::Analysis(AnalysisError::Disabled) => StatusCode::SERVICE_UNAVAILABLE,
            StorageError::Analysis(AnalysisError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            StorageError::Analysis(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn kind(&self) -> &'static str {
        match &self.0 {
            StorageError::ArtifactExpired(_) => "artifact_expired",
            StorageError::ArtifactNotFound(_) => "artifact_not_found",
            StorageError::EmbeddingDimensionMismatch { .. } => "embedding_dimension_mismatch",
            StorageError::NoDataAvailable { .. } => "no_data_available",
            StorageError::DocumentNotFound(_) => "document_not_found",
            StorageError::InvalidSubject(_) => "invalid_subject",
            StorageError::SimilarityMismatch { .. } => "similarity_mismatch",
            StorageError::Schema { .. } | StorageError::Backend(_) => "backend_unavailable",
            StorageError::Analysis(_) => "analysis_failed",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, status = status.as_u16(), "request failed");
        }
        let mut body = json!({
            "error": self.kind(),
            "message": self.0.to_string(),
        });
        if let StorageError::NoDataAvailable { failures, .. } = &self.0 {
            body["failures"] = json!(failures);
        }
        (status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "bad_request", "message": message.into() })),
    )
        .into_response()
}

fn cache_headers(origin: Origin) -> HeaderMap {
    let mut h = HeaderMap::new();
    let v = match origin {
        Origin::Cache => "HIT",
        Origin::Fresh => "MISS",
    };
    h.insert("x-cache", HeaderValue::from_static(v));
    h
}

#[derive(Debug, Default, Deserialize)]
struct RefreshQuery {
    #[serde(default)]
    force_refresh: bool,
}

#[derive(Serialize)]
struct SnapshotResp {
    origin: Origin,
    #[serde(flatten)]
    aggregate: AggregateResult,
    raw_artifacts: Vec<ArtifactId>,
}

async fn get_snapshot(
    State(state): State<AppState>,
    Path(subject): Path<String>,
    Query(q): Query<RefreshQuery>,
) -> Result<Response, ApiError> {
    let r = state
        .coordinator
        .get_or_fetch(&subject, q.force_refresh)
        .await?;
    let headers = cache_headers(r.origin);
    let body = SnapshotResp {
        origin: r.origin,
        aggregate: r.aggregate,
        raw_artifacts: r.raw_artifacts,
    };
    Ok((headers, Json(body)).into_response())
}

async fn compile_report(
    State(state): State<AppState>,
    Path(subject): Path<String>,
    Query(q): Query<RefreshQuery>,
) -> Result<Response, ApiError> {
    let (report, origin) = state
        .coordinator
        .compile_report(&subject, q.force_refresh, state.analyzer.as_ref())
        .await?;
    let mut headers = cache_headers(origin);
    if let Ok(v) = HeaderValue::from_str(&report.analyzer) {
        headers.insert("x-analyzer", v);
    }
    Ok((headers, Json(report)).into_response())
}

async fn get_report(
    State(state): State<AppState>,
    Path(subject): Path<String>,
) -> Result<Response, ApiError> {
    Ok(match state.coordinator.cached_report(&subject).await? {
        Some(report) => Json(report).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "report_not_cached", "subject": subject })),
        )
            .into_response(),
    })
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize)]
struct SearchReq {
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    /// Free text, embedded with the configured analyzer when `embedding` is absent.
    #[serde(default)]
    query: Option<String>,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default)]
    subject: Option<String>,
}

async fn search(
    State(state): State<AppState>,
    Json(req): Json<SearchReq>,
) -> Result<Response, ApiError> {
    let embedding = match (req.embedding, req.query) {
        (Some(e), _) => e,
        (None, Some(q)) if !q.trim().is_empty() => state.analyzer.embed(&q).await?,
        _ => return Ok(bad_request("either `embedding` or `query` is required")),
    };
    let matches = state
        .coordinator
        .semantic_search_filtered(&embedding, req.top_k, req.subject.as_deref())
        .await?;
    Ok(Json(matches).into_response())
}

async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let Ok(id) = id.parse::<DocumentId>() else {
        return Ok(bad_request(format!("'{id}' is not a document id")));
    };
    let doc = state.coordinator.fetch_document(&id).await?;
    Ok(Json(doc).into_response())
}

async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let Ok(id) = id.parse::<DocumentId>() else {
        return Ok(bad_request(format!("'{id}' is not a document id")));
    };
    if state.coordinator.delete_document(&id).await? {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(StorageError::DocumentNotFound(id).into())
    }
}

async fn delete_subject_documents(
    State(state): State<AppState>,
    Path(subject): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state.coordinator.delete_subject(&subject).await?;
    Ok(Json(json!({ "removed": removed })))
}

async fn invalidate(
    State(state): State<AppState>,
    Path(subject): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state.coordinator.invalidate(&subject).await?;
    Ok(Json(json!({ "invalidated": removed })))
}

async fn cleanup(State(state): State<AppState>) -> Result<Response, ApiError> {
    let report = state.coordinator.cleanup_expired().await?;
    Ok(Json(report).into_response())
}

async fn clear_cache(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state.coordinator.clear_cache().await?;
    Ok(Json(json!({ "removed": removed })))
}

async fn stats(State(state): State<AppState>) -> Result<Response, ApiError> {
    let stats = state.coordinator.stats().await?;
    Ok(Json(stats).into_response())
}
