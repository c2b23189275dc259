//! `/v1/vms` endpoints.
//!
//! Grounded on `control-plane/src/api/v1/instances.rs`'s handler shape
//! (`State<AppState>` + `Result<impl IntoResponse, ApiError>`), narrowed
//! to this surface's single-resource-table model: no org/env scoping, no
//! cursor pagination, just the VM lifecycle and exec/run/file-transfer
//! operations `VmService` already implements.

use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, MethodRouter};
use axum::{BoxError, Json, Router};
use serde::Deserialize;
use tower::buffer::BufferLayer;
use tower::limit::RateLimitLayer;
use tower::ServiceBuilder;

use crate::agent_protocol::{ExecRequest, RunRequest};
use crate::vm_service::CreateVmRequest;

use super::error::ApiError;
use super::AppState;

const CREATE_BODY_LIMIT: usize = 64 * 1024;
const EXEC_BODY_LIMIT: usize = 1024 * 1024;
const UPLOAD_BODY_LIMIT: usize = 10 * 1024 * 1024;

const CREATE_RATE: (u64, u64) = (30, 60);
const EXEC_RATE: (u64, u64) = (60, 60);

/// §5's per-endpoint rate limits, built from `tower::limit::RateLimitLayer`.
/// `RateLimit` throttles by delaying `poll_ready` rather than rejecting, so
/// it must sit behind a `BufferLayer` to stay well-behaved under axum's
/// clone-per-request service model; `HandleErrorLayer` discharges the
/// resulting fallible stack back down to the `Infallible` error type
/// `MethodRouter::layer` requires, mapping the (rare) buffer-closed case to
/// `503` rather than panicking the connection.
fn rate_limited(router: MethodRouter<AppState>, (requests, per_secs): (u64, u64)) -> MethodRouter<AppState> {
    router.layer(
        ServiceBuilder::new()
            .layer(HandleErrorLayer::new(|_: BoxError| async {
                ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "rate_limiter_unavailable",
                    "request could not be scheduled",
                )
            }))
            .layer(BufferLayer::new(1024))
            .layer(RateLimitLayer::new(requests, Duration::from_secs(per_secs))),
    )
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(list_vms).merge(rate_limited(
                post(create_vm).layer(DefaultBodyLimit::max(CREATE_BODY_LIMIT)),
                CREATE_RATE,
            )),
        )
        .route("/{id}", get(get_vm).delete(destroy_vm))
        .route("/{id}/start", post(start_vm))
        .route("/{id}/stop", post(stop_vm))
        .route(
            "/{id}/exec",
            rate_limited(
                post(exec_vm).layer(DefaultBodyLimit::max(EXEC_BODY_LIMIT)),
                EXEC_RATE,
            ),
        )
        .route(
            "/{id}/run-ts",
            rate_limited(
                post(run_ts).layer(DefaultBodyLimit::max(EXEC_BODY_LIMIT)),
                EXEC_RATE,
            ),
        )
        .route(
            "/{id}/run-js",
            rate_limited(
                post(run_js).layer(DefaultBodyLimit::max(EXEC_BODY_LIMIT)),
                EXEC_RATE,
            ),
        )
        .route(
            "/{id}/files/upload",
            post(upload_files).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        .route("/{id}/files/download", get(download_files))
        .route("/{id}/snapshots", post(create_snapshot))
}

async fn list_vms(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let vms = state.vm_service.list().await?;
    Ok(Json(vms))
}

async fn get_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let vm = state.vm_service.get(&id).await?;
    Ok(Json(vm))
}

async fn create_vm(
    State(state): State<AppState>,
    Json(req): Json<CreateVmRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let vm = state.vm_service.create(req).await?;
    Ok((StatusCode::CREATED, Json(vm)))
}

async fn start_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let vm = state.vm_service.start(&id).await?;
    Ok(Json(vm))
}

async fn stop_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.vm_service.stop(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn destroy_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.vm_service.destroy(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn exec_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state.vm_service.exec(&id, req).await?;
    Ok(Json(result))
}

async fn run_ts(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state.vm_service.run_ts(&id, req).await?;
    Ok(Json(result))
}

async fn run_js(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state.vm_service.run_js(&id, req).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    dest: String,
}

async fn upload_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<UploadQuery>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    state
        .vm_service
        .upload_files(&id, &query.dest, body.to_vec())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    path: String,
}

async fn download_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let archive = state.vm_service.download_files(&id, &query.path).await?;
    Ok(([(header::CONTENT_TYPE, "application/gzip")], archive))
}

async fn create_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.enable_snapshots {
        return Err(ApiError::not_found("snapshots are disabled"));
    }
    let meta = state.vm_service.create_snapshot(&id).await?;
    Ok((StatusCode::CREATED, Json(meta)))
}
