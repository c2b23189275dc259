//! `X-API-Key` authentication middleware.
//!
//! Implements the `ValidateKey(opaque) -> bool` port base-spec §6 calls
//! for: a single configured key, compared in constant time via `subtle`
//! so a timing side-channel can't be used to guess it byte-by-byte. The
//! teacher authenticates via a `RequestContext` extractor reading a
//! bearer token against a Postgres-backed actor table (`api/authz.rs`);
//! there is no such table here, so this is a plain `from_fn_with_state`
//! layer instead of an extractor.

use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

use super::error::ApiError;
use super::AppState;

const HEADER_NAME: &str = "x-api-key";

pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = request
        .headers()
        .get(HEADER_NAME)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !keys_match(provided, &state.api_key) {
        return Err(ApiError::unauthorized("missing or invalid X-API-Key"));
    }

    Ok(next.run(request).await)
}

fn keys_match(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    if provided.len() != expected.len() {
        return false;
    }
    provided.ct_eq(expected).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_length_without_panicking() {
        assert!(!keys_match("short", "a-much-longer-key"));
    }

    #[test]
    fn accepts_exact_match() {
        assert!(keys_match("secret-key", "secret-key"));
    }

    #[test]
    fn rejects_wrong_key_same_length() {
        assert!(!keys_match("secret-keyA", "secret-keyB"));
    }
}
