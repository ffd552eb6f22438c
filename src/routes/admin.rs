//! Admin surface: relay metrics and forced device disconnect.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;
use crate::util::now_ms;

/// `GET /api/stats` — combined relay and proxy statistics.
pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "relay": state.relay.stats().await,
        "proxy": state.proxy.stats().await,
        "serverTime": now_ms(),
    }))
}

/// `GET /api/devices` — summaries of currently connected devices.
pub async fn list_devices(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"devices": state.relay.device_summaries().await}))
}

/// `DELETE /api/devices/{id}` — force-close a device connection.
pub async fn disconnect_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let device_id = id.to_ascii_uppercase();
    if state.relay.disconnect_device(&device_id).await {
        Ok(Json(json!({"disconnected": true, "deviceId": device_id})))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Device '{device_id}' not connected"), "code": "DEVICE_NOT_FOUND"})),
        ))
    }
}
