//! Per-device state snapshot used to hydrate newly connecting clients.
//!
//! Devices stream full `status` messages roughly twice a second plus the
//! occasional `device_info` / `esp_status` / `pico_status`. Caching the most
//! recent full message of each kind lets a new client render immediately
//! instead of waiting for the next periodic update. `status_delta` messages
//! are applied client-side; here they only refresh the snapshot's age — a
//! delta is not a snapshot replacement.

use std::time::{Duration, Instant};

use serde_json::Value;

/// A snapshot older than this triggers a `request_state` on client connect.
pub const CACHE_STALE_AFTER: Duration = Duration::from_secs(10);

/// Most recent full-state messages seen from one device.
#[derive(Debug)]
pub struct DeviceSnapshot {
    status: Option<Value>,
    device_info: Option<Value>,
    esp_status: Option<Value>,
    pico_status: Option<Value>,
    last_updated: Instant,
}

impl Default for DeviceSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSnapshot {
    pub fn new() -> Self {
        Self {
            status: None,
            device_info: None,
            esp_status: None,
            pico_status: None,
            last_updated: Instant::now(),
        }
    }

    /// Apply a device message to the snapshot. Full-state types replace
    /// their slot; `status_delta` only advances freshness. Returns false
    /// for types the cache does not track.
    pub fn apply(&mut self, msg_type: &str, message: &Value) -> bool {
        match msg_type {
            "status" => self.status = Some(message.clone()),
            "device_info" => self.device_info = Some(message.clone()),
            "esp_status" => self.esp_status = Some(message.clone()),
            "pico_status" => self.pico_status = Some(message.clone()),
            "status_delta" => {}
            _ => return false,
        }
        self.last_updated = Instant::now();
        true
    }

    pub fn is_stale(&self) -> bool {
        self.last_updated.elapsed() > CACHE_STALE_AFTER
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.device_info.is_none()
            && self.esp_status.is_none()
            && self.pico_status.is_none()
    }

    /// Cached frames in hydration order: `status`, `device_info`,
    /// `esp_status`, `pico_status` (absent slots omitted).
    pub fn frames(&self) -> Vec<Value> {
        [
            &self.status,
            &self.device_info,
            &self.esp_status,
            &self.pico_status,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: Duration) {
        self.last_updated = Instant::now() - by;
    }
}
