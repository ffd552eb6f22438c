//! Device log-capture endpoints, proxied over the relay.
//!
//! Each handler forwards a control message to the device and awaits the
//! correlated `<type>_response` via [`crate::relay::request`]. The device
//! socket is untouched by timeouts; only the HTTP caller sees them.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::relay::request::{request_device, DeviceRequestError, DEVICE_REQUEST_TIMEOUT};
use crate::state::AppState;

fn to_http(err: DeviceRequestError) -> (StatusCode, Json<Value>) {
    match err {
        DeviceRequestError::NotConnected => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "Device not connected", "code": "DEVICE_OFFLINE"})),
        ),
        DeviceRequestError::Timeout => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({"error": "Request timeout", "code": "TIMEOUT"})),
        ),
        DeviceRequestError::RelayClosed => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "Relay is shutting down", "code": "SHUTTING_DOWN"})),
        ),
        DeviceRequestError::Device(message) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": message, "code": "DEVICE_ERROR"})),
        ),
    }
}

async fn proxied(
    state: &AppState,
    device_id: &str,
    msg_type: &str,
    payload: Value,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let device_id = device_id.to_ascii_uppercase();
    let response = request_device(
        &state.relay,
        &device_id,
        msg_type,
        payload,
        DEVICE_REQUEST_TIMEOUT,
    )
    .await
    .map_err(to_http)?;
    Ok(Json(response))
}

/// `GET /api/devices/{id}/logs/info` — log-capture configuration and usage.
pub async fn get_log_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    proxied(&state, &id, "get_log_info", json!({})).await
}

/// `GET /api/devices/{id}/logs` — captured log lines.
pub async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    proxied(&state, &id, "get_logs", json!({})).await
}

/// `DELETE /api/devices/{id}/logs` — clear the capture buffer.
pub async fn clear_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    proxied(&state, &id, "clear_logs", json!({})).await
}

/// `POST /api/devices/{id}/logs/enabled` — toggle log capture.
pub async fn set_log_enabled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let enabled = body["enabled"].as_bool().unwrap_or(false);
    proxied(&state, &id, "set_log_enabled", json!({"enabled": enabled})).await
}

/// `POST /api/devices/{id}/logs/pico-forwarding` — toggle pico log
/// forwarding over the inter-MCU link.
pub async fn set_pico_forwarding(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let enabled = body["enabled"].as_bool().unwrap_or(false);
    proxied(
        &state,
        &id,
        "set_pico_log_forwarding",
        json!({"enabled": enabled}),
    )
    .await
}

/// `POST /api/devices/{id}/logs/debug` — toggle verbose firmware logging.
pub async fn set_debug_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let enabled = body["enabled"].as_bool().unwrap_or(false);
    proxied(
        &state,
        &id,
        "set_debug_logs_enabled",
        json!({"enabled": enabled}),
    )
    .await
}
