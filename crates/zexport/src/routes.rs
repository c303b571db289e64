//! HTTP surface.
//!
//! - `GET|POST /refresh` - run a full export
//! - `GET /data` - latest snapshot as a text attachment
//! - `GET /snapshots` - committed snapshot metadata, newest first
//! - `GET /snapshots/:id` - one snapshot's text
//! - `GET /health` - supervisor status

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use zexport_core::{DownstreamStatus, HealthState, Snapshot, SnapshotMeta, ZexportError, ZexportState};

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 1000;

/// Build the router over shared service state.
pub fn router(state: Arc<ZexportState>) -> Router {
    Router::new()
        .route("/refresh", get(refresh_handler).post(refresh_handler))
        .route("/data", get(data_handler))
        .route("/snapshots", get(list_handler))
        .route("/snapshots/:id", get(snapshot_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    status: &'static str,
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Serialize)]
struct RefreshResponse {
    status: &'static str,
    snapshot_id: i64,
    count: usize,
    saved: String,
    downstream: DownstreamStatus,
    elapsed_ms: u64,
}

#[derive(Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(e: ZexportError) -> ApiError {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    if e.is_transient() {
        tracing::info!(error = %e, code = e.error_code(), "Request deferred");
    } else if status.is_server_error() {
        tracing::warn!(error = %e, code = e.error_code(), "Request failed");
    }

    let info = e.to_error_info();
    (
        status,
        Json(ErrorResponse {
            status: "error",
            error: e.error_code(),
            message: info.message,
            hint: info.hint,
            detail: info.technical_detail,
        }),
    )
}

fn not_found(message: impl Into<String>) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            status: "error",
            error: "not_found",
            message: message.into(),
            hint: None,
            detail: None,
        }),
    )
}

/// `attachment` disposition, with an RFC 5987 form for non-ASCII names.
fn content_disposition(file_name: &str) -> HeaderValue {
    let value = if file_name.is_ascii() && !file_name.contains('"') {
        format!("attachment; filename=\"{file_name}\"")
    } else {
        let fallback: String =
            file_name.chars().map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' }).collect();
        format!(
            "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
            urlencoding::encode(file_name)
        )
    };
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

fn text_attachment(snapshot: Snapshot, file_name: &str) -> Response {
    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8")),
            (header::CONTENT_DISPOSITION, content_disposition(file_name)),
        ],
        snapshot.content(),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

async fn refresh_handler(State(state): State<Arc<ZexportState>>) -> Result<Response, ApiError> {
    tracing::debug!("Refresh requested");

    let report = state.export().await.map_err(error_response)?;

    let status = if report.downstream.is_failed() {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::OK
    };

    let body = RefreshResponse {
        status: "ok",
        snapshot_id: report.snapshot_id,
        count: report.count,
        saved: report.saved,
        downstream: report.downstream,
        elapsed_ms: report.elapsed_ms,
    };
    Ok((status, Json(body)).into_response())
}

async fn data_handler(State(state): State<Arc<ZexportState>>) -> Result<Response, ApiError> {
    let latest = state.latest_snapshot().await.map_err(error_response)?;
    let snapshot = latest.ok_or_else(|| not_found("No snapshot has been exported yet"))?;

    let file_name = state.config().export.current_file_name.clone();
    Ok(text_attachment(snapshot, &file_name))
}

async fn list_handler(
    State(state): State<Arc<ZexportState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<SnapshotMeta>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let snapshots = state.list_snapshots(limit).await.map_err(error_response)?;
    Ok(Json(snapshots))
}

async fn snapshot_handler(
    State(state): State<Arc<ZexportState>>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let snapshot = state
        .snapshot(id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| not_found(format!("Snapshot {id} not found")))?;

    let file_name = snapshot.file_name.clone();
    Ok(text_attachment(snapshot, &file_name))
}

async fn health_handler(State(state): State<Arc<ZexportState>>) -> Response {
    let status = state.status();
    let code = if status.health == HealthState::Alive {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status)).into_response()
}
