//! `/v1/snapshots` endpoints.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use super::error::ApiError;
use super::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(list_snapshots))
}

async fn list_snapshots(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    if !state.enable_snapshots {
        return Err(ApiError::not_found("snapshots are disabled"));
    }
    let snapshots = state.vm_service.list_snapshots().await?;
    Ok(Json(snapshots))
}
