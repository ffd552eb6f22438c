//! Public liveness endpoint.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /api/health` — liveness plus headline connection counts.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeMs": state.start_time.elapsed().as_millis() as u64,
        "connectedDevices": state.relay.connected_device_count().await,
        "connectedClients": state.proxy.client_count().await,
    }))
}
