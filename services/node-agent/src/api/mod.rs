//! HTTP API: router construction, auth, and per-resource handler modules.
//!
//! Grounded on `control-plane/src/api/mod.rs`'s `create_router` shape:
//! same request-id middleware (`SetRequestIdLayer`/`PropagateRequestIdLayer`
//! with a custom `MakeRequestId`), the same `TraceLayer`/`CorsLayer` stack,
//! and the same per-resource `pub fn routes() -> Router<AppState>` module
//! layout (`vms.rs`, `snapshots.rs` in place of the teacher's
//! `v1/instances.rs` and friends). Authentication is new: a single
//! `X-API-Key` compared in constant time, applied as a `from_fn_with_state`
//! layer over the whole `/v1` surface rather than the teacher's
//! actor-table extractor, since there is no multi-tenant caller model here.
//!
//! Request correlation drops the teacher's `RequestContext` extractor —
//! there's no actor/idempotency-key concept to carry alongside it here.
//! The `x-request-id` header set by `MakePlfmRequestId` below and echoed
//! back by `PropagateRequestIdLayer` is enough for a caller to correlate
//! a response with server-side logs without threading an id through
//! every handler body.

mod auth;
pub mod error;
mod snapshots;
mod vms;

use std::sync::Arc;

use axum::http::{header, Method, StatusCode};
use axum::routing::get;
use axum::{middleware, Json, Router};
use plfm_id::RequestId as PlfmRequestId;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId as TowerRequestId, SetRequestIdLayer,
};
use tower_http::trace::TraceLayer;

use crate::vm_service::VmService;

#[derive(Clone)]
pub struct AppState {
    pub vm_service: Arc<VmService>,
    pub api_key: Arc<str>,
    pub enable_snapshots: bool,
}

#[derive(Clone, Copy)]
struct MakePlfmRequestId;

impl MakeRequestId for MakePlfmRequestId {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<TowerRequestId> {
        let request_id = PlfmRequestId::new().to_string();
        let header_value = axum::http::HeaderValue::from_str(&request_id).ok()?;
        Some(TowerRequestId::new(header_value))
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::HeaderName::from_static("x-api-key")])
        .allow_origin(Any);

    let request_id_header = header::HeaderName::from_static("x-request-id");
    let set_request_id = SetRequestIdLayer::new(request_id_header.clone(), MakePlfmRequestId);
    let propagate_request_id = PropagateRequestIdLayer::new(request_id_header);

    let v1 = Router::new()
        .nest("/vms", vms::routes())
        .nest("/snapshots", snapshots::routes())
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_api_key));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", v1)
        .layer(TraceLayer::new_for_http())
        .layer(propagate_request_id)
        .layer(set_request_id)
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    version: &'static str,
}

async fn healthz() -> (StatusCode, Json<HealthBody>) {
    (
        StatusCode::OK,
        Json(HealthBody {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}
