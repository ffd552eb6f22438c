//! Awaitable request/response over the device WebSocket.
//!
//! HTTP handlers that need a device reply tag the outgoing message with a
//! unique `requestId`, subscribe to the relay publication filtered by
//! `(deviceId, requestId)`, and wait for the matching `<type>_response` or
//! `error`. The subscription is dropped on every exit path — success,
//! device error, send failure, and timeout.

use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast;

use super::DeviceRelay;
use crate::util::{now_ms, short_id};

/// Default wait for a device reply.
pub const DEVICE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DeviceRequestError {
    #[error("Device not connected")]
    NotConnected,
    #[error("Request timeout")]
    Timeout,
    #[error("Relay is shutting down")]
    RelayClosed,
    /// The device answered with an `error` message; carries its `message`.
    #[error("{0}")]
    Device(String),
}

/// Build a correlation id: `req_<ms epoch>_<random6>`.
fn new_request_id() -> String {
    format!("req_{}_{}", now_ms(), short_id())
}

/// Send `payload` (tagged with `msg_type` and a fresh `requestId`) to a
/// device and await the correlated reply.
pub async fn request_device(
    relay: &DeviceRelay,
    device_id: &str,
    msg_type: &str,
    mut payload: Value,
    timeout: Duration,
) -> Result<Value, DeviceRequestError> {
    let request_id = new_request_id();
    payload["type"] = json!(msg_type);
    payload["requestId"] = json!(request_id);
    payload["timestamp"] = json!(now_ms());

    // Subscribe before sending so the reply cannot slip past us.
    let mut events = relay.subscribe();

    if !relay.send_to_device(device_id, &payload).await {
        return Err(DeviceRequestError::NotConnected);
    }

    let expected = format!("{msg_type}_response");
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => return Err(DeviceRequestError::Timeout),
            event = events.recv() => match event {
                Ok(message) => {
                    if message["deviceId"].as_str() != Some(device_id)
                        || message["requestId"].as_str() != Some(request_id.as_str())
                    {
                        continue;
                    }
                    match message["type"].as_str() {
                        Some("error") => {
                            let detail = message["message"]
                                .as_str()
                                .unwrap_or("Device error")
                                .to_string();
                            return Err(DeviceRequestError::Device(detail));
                        }
                        Some(t) if t == expected => return Ok(message),
                        _ => continue,
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(DeviceRequestError::RelayClosed);
                }
            },
        }
    }
}
