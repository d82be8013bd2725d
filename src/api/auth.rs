// =============================================================================
// API token authentication — X-API-Token header
// =============================================================================
//
// A single shared token guards the admin and data-plane endpoints. The
// check is toggled by `API_TOKEN_ENABLED`; comparison runs in constant
// time so the token cannot be probed byte-by-byte. Used as an Axum
// extractor:
//
//   async fn handler(_auth: ApiToken, State(state): State<Arc<AppState>>)
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::app_state::AppState;

/// Compare two byte slices in constant time. Every byte of both slices is
/// examined even after a mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Validate a presented token against the configured one. Disabled auth
/// accepts anything; enabled auth with an empty configured token rejects
/// everything.
pub fn validate_token(state: &AppState, presented: Option<&str>) -> bool {
    if !state.settings.api_token_enabled {
        return true;
    }
    let expected = state.settings.api_token.as_bytes();
    if expected.is_empty() {
        warn!("API_TOKEN_ENABLED is set but API_TOKEN is empty, rejecting all requests");
        return false;
    }
    match presented {
        Some(token) => constant_time_eq(token.as_bytes(), expected),
        None => false,
    }
}

/// Extractor enforcing the `X-API-Token` header.
pub struct ApiToken;

pub struct AuthRejection;

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "message": "无效的API令牌",
            "data": null,
        });
        (StatusCode::FORBIDDEN, axum::Json(body)).into_response()
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for ApiToken {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get("X-API-Token")
            .and_then(|v| v.to_str().ok());

        if validate_token(state, presented) {
            Ok(ApiToken)
        } else {
            warn!("request rejected: missing or invalid X-API-Token");
            Err(AuthRejection)
        }
    }
}
