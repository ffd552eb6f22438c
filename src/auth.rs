//! Admin authentication for the REST surface.
//!
//! WebSocket peers authenticate against the credential store; the handful
//! of `/api/*` admin routes are guarded by the pre-shared key from `[auth]`
//! in the config instead. Failed attempts are logged with the request path
//! so key probing shows up in the relay's logs next to the connection
//! traffic it targets.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::state::AppState;

/// Axum middleware guarding the admin routes. Reads the expected key from
/// [`AppState`] and requires `Authorization: Bearer <key>`.
///
/// # Error responses
///
/// - `401 Unauthorized` — no bearer token on the request
/// - `403 Forbidden` — bearer token present but wrong
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let Some(presented) = presented else {
        warn!(path = %request.uri().path(), "Admin request without bearer key");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Admin key required", "code": "ADMIN_KEY_REQUIRED"})),
        )
            .into_response();
    };

    if !keys_match(state.config.auth.admin_key.as_bytes(), presented.as_bytes()) {
        warn!(path = %request.uri().path(), "Admin request with rejected key");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Admin key rejected", "code": "ADMIN_KEY_REJECTED"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Compare the presented key against the configured one in constant time.
///
/// Accumulates mismatch bits over the configured key's full length whatever
/// the input looks like, so a prober cannot learn the key length from
/// response timing. A missing byte is folded in as the complement of the
/// expected one, which is guaranteed to set a bit.
fn keys_match(expected: &[u8], presented: &[u8]) -> bool {
    let mut mismatch = expected.len() ^ presented.len();
    for (i, &byte) in expected.iter().enumerate() {
        let other = presented.get(i).copied().unwrap_or(!byte);
        mismatch |= usize::from(byte ^ other);
    }
    mismatch == 0
}
