//! Common API error type and response body.
//!
//! Grounded on `control-plane/src/api/error.rs`: same `ErrorResponse{code,
//! message, request_id, details}` shape and the same `ApiError{status,
//! response}` wrapper implementing `IntoResponse`, narrowed to the status
//! codes this surface actually returns and extended with a `From<VmServiceError>`
//! that maps each variant's `reason_code()` straight through as `code`.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::vm_service::VmServiceError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub response: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            response: ErrorResponse::new(code, message),
        }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.response = self.response.with_request_id(request_id);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.response)).into_response()
    }
}

/// Maps each `VmServiceError` variant onto the status codes §7 assigns to
/// its error kind. `GuestAgentUnreachable` and `FirecrackerApi` are both
/// infrastructure failures with no direct analogue in §7's table; they
/// surface as `503`/`502` respectively rather than a bare `500`, so a
/// caller can distinguish "guest never came up" / "Firecracker rejected
/// the call" from a generic internal error.
impl From<VmServiceError> for ApiError {
    fn from(err: VmServiceError) -> Self {
        let code = err.reason_code().to_string();
        let status = match &err {
            VmServiceError::Validation { .. } => StatusCode::BAD_REQUEST,
            VmServiceError::Quota { .. } => StatusCode::TOO_MANY_REQUESTS,
            VmServiceError::NotFound { .. } => StatusCode::NOT_FOUND,
            VmServiceError::PreconditionFailed { .. } => StatusCode::CONFLICT,
            VmServiceError::GuestAgentUnreachable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            VmServiceError::FirecrackerApi { .. } => StatusCode::BAD_GATEWAY,
            VmServiceError::HostResource { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            VmServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, code, err.to_string())
    }
}
