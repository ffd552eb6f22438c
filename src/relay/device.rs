//! Device registry, accept path, and keep-alive.
//!
//! ## Connection lifecycle
//!
//! 1. Device connects to `GET /ws/device?id=<BRW-XXXXXXXX>&key=<secret>`.
//!    The upgrade always completes; validation failures are reported as a
//!    close frame with a 4xxx code (embedded WebSocket clients cannot read
//!    HTTP error bodies).
//! 2. On success the relay greets with `connected` followed by
//!    `request_state`, prompting an immediate full state dump.
//! 3. Every decoded message is stamped with `deviceId` (and `timestamp`
//!    when absent) and published to subscribers.
//! 4. A keep-alive sweep pings each device every 10 s; two unanswered
//!    sweeps terminate the connection.
//! 5. On close the device is marked offline in the store and a
//!    `device_offline` event is published.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{codec, CLOSE_ADMIN, CLOSE_AUTH, CLOSE_BAD_REQUEST, CLOSE_REPLACED};
use crate::config::RelayConfig;
use crate::state::AppState;
use crate::store::CredentialStore;
use crate::util::now_ms;

/// Consecutive keep-alive sweeps a device may miss before termination.
const MAX_MISSED_PINGS: u32 = 2;

/// Outbound frame queued for a device's writer task.
#[derive(Debug)]
pub enum DeviceFrame {
    /// JSON-encoded text frame (all cloud→device traffic is JSON).
    Json(Value),
    /// WebSocket protocol ping.
    Ping,
    /// Close the socket with an application code; the writer exits after
    /// sending it.
    Close { code: u16, reason: &'static str },
}

/// Registry entry for one connected device.
pub struct DeviceConnection {
    pub device_id: String,
    pub tx: mpsc::Sender<DeviceFrame>,
    /// Monotonic sequence distinguishing this connection from a successor
    /// with the same id.
    pub(crate) conn_seq: u64,
    pub connected_at: Instant,
    pub last_seen_ms: Arc<AtomicU64>,
    pub missed_pings: Arc<AtomicU32>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
}

/// Owns the device registry and the device-event publication.
pub struct DeviceRelay {
    devices: RwLock<HashMap<String, DeviceConnection>>,
    /// Last-seen timestamps retained for devices that have disconnected.
    departed: RwLock<HashMap<String, u64>>,
    events: broadcast::Sender<Value>,
    store: Arc<dyn CredentialStore>,
    conn_seq: AtomicU64,
    total_connections: AtomicU64,
    messages_published: AtomicU64,
    start_time: Instant,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceRelay {
    pub fn new(store: Arc<dyn CredentialStore>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            devices: RwLock::new(HashMap::new()),
            departed: RwLock::new(HashMap::new()),
            events,
            store,
            conn_seq: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            start_time: Instant::now(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to device-origin events. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.events.subscribe()
    }

    /// Publish an event to all subscribers.
    fn publish(&self, message: Value) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        if self.events.send(message).is_err() {
            debug!("Device event dropped: no subscribers");
        }
    }

    /// Stamp `deviceId` (and `timestamp` when absent) on a device-origin
    /// message and publish it.
    pub(crate) fn ingest(&self, device_id: &str, mut message: Value) {
        let Some(obj) = message.as_object_mut() else {
            warn!(device_id = %device_id, "Dropping non-object device message");
            return;
        };
        if !obj.get("type").is_some_and(Value::is_string) {
            warn!(device_id = %device_id, "Dropping device message without a type");
            return;
        }
        obj.insert("deviceId".to_string(), json!(device_id));
        obj.entry("timestamp".to_string()).or_insert(json!(now_ms()));
        self.publish(message);
    }

    /// Register a connection, replacing (and closing with 4002) any prior
    /// connection for the same id. Publishes the replaced session's
    /// `device_offline` so ordering against the caller's `device_online`
    /// holds.
    pub(crate) async fn register(&self, connection: DeviceConnection) {
        let device_id = connection.device_id.clone();
        let replaced = {
            let mut devices = self.devices.write().await;
            let replaced = devices.remove(&device_id);
            if let Some(ref old) = replaced {
                let _ = old.tx.try_send(DeviceFrame::Close {
                    code: CLOSE_REPLACED,
                    reason: "Replaced by new connection",
                });
                let _ = old.shutdown_tx.send(true);
            }
            devices.insert(device_id.clone(), connection);
            replaced.is_some()
        };
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        if replaced {
            warn!(device_id = %device_id, "Device reconnected while a connection existed, replacing");
            self.publish(json!({
                "type": "device_offline",
                "deviceId": device_id,
                "timestamp": now_ms(),
            }));
        }
    }

    /// Remove a connection if it is still the registered one. Returns true
    /// when this call removed the entry (the caller then runs the offline
    /// path); false when a successor already replaced it.
    pub(crate) async fn unregister(&self, device_id: &str, conn_seq: u64) -> bool {
        let last_seen = {
            let mut devices = self.devices.write().await;
            match devices.get(device_id) {
                Some(current) if current.conn_seq == conn_seq => {
                    let last_seen = current.last_seen_ms.load(Ordering::Relaxed);
                    devices.remove(device_id);
                    last_seen
                }
                _ => return false,
            }
        };
        self.departed
            .write()
            .await
            .insert(device_id.to_string(), last_seen);
        true
    }

    pub(crate) fn next_conn_seq(&self) -> u64 {
        self.conn_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a JSON message to a device. Returns true iff the device is
    /// registered and the frame was handed to its writer without blocking.
    pub async fn send_to_device(&self, device_id: &str, message: &Value) -> bool {
        let devices = self.devices.read().await;
        match devices.get(device_id) {
            Some(conn) => conn.tx.try_send(DeviceFrame::Json(message.clone())).is_ok(),
            None => false,
        }
    }

    pub async fn is_device_connected(&self, device_id: &str) -> bool {
        self.devices.read().await.contains_key(device_id)
    }

    /// Wall-clock ms of the last frame seen from the device, if known
    /// (connected now, or connected earlier in this process's lifetime).
    pub async fn device_last_seen(&self, device_id: &str) -> Option<u64> {
        if let Some(conn) = self.devices.read().await.get(device_id) {
            return Some(conn.last_seen_ms.load(Ordering::Relaxed));
        }
        self.departed.read().await.get(device_id).copied()
    }

    pub async fn connected_device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn connected_devices(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }

    /// Per-device summaries for the admin surface.
    pub async fn device_summaries(&self) -> Vec<Value> {
        let devices = self.devices.read().await;
        let mut list: Vec<Value> = devices
            .values()
            .map(|d| {
                json!({
                    "deviceId": d.device_id,
                    "connectedForMs": d.connected_at.elapsed().as_millis() as u64,
                    "lastSeen": d.last_seen_ms.load(Ordering::Relaxed),
                    "missedPings": d.missed_pings.load(Ordering::Relaxed),
                })
            })
            .collect();
        list.sort_by(|a, b| a["deviceId"].as_str().cmp(&b["deviceId"].as_str()));
        list
    }

    /// Force-close a device connection (admin). Returns whether a device
    /// was connected.
    pub async fn disconnect_device(&self, device_id: &str) -> bool {
        let devices = self.devices.read().await;
        match devices.get(device_id) {
            Some(conn) => {
                info!(device_id = %device_id, "Disconnecting device by admin request");
                let _ = conn.tx.try_send(DeviceFrame::Close {
                    code: CLOSE_ADMIN,
                    reason: "Disconnected by admin",
                });
                let _ = conn.shutdown_tx.send(true);
                true
            }
            None => false,
        }
    }

    /// Keep-alive sweep: ping every registered device, terminating any that
    /// has gone [`MAX_MISSED_PINGS`] sweeps without a frame.
    pub async fn sweep_devices(&self) {
        let devices = self.devices.read().await;
        for (device_id, conn) in devices.iter() {
            let missed = conn.missed_pings.fetch_add(1, Ordering::Relaxed) + 1;
            if missed > MAX_MISSED_PINGS {
                warn!(device_id = %device_id, missed, "Device unresponsive, terminating");
                let _ = conn.shutdown_tx.send(true);
            } else {
                let _ = conn.tx.try_send(DeviceFrame::Ping);
            }
        }
    }

    /// Hand the store a snapshot of connected ids so it can mark stale
    /// online rows offline. Covers crashes and missed close events.
    pub async fn reconcile_store(&self) {
        let connected = self
            .devices
            .read()
            .await
            .keys()
            .cloned()
            .collect::<std::collections::HashSet<_>>();
        match self.store.sync_online_devices(&connected).await {
            Ok(0) => {}
            Ok(stale) => info!(stale, "Reconciled stale device online flags"),
            Err(e) => warn!("Device online-flag reconciliation failed: {e}"),
        }
    }

    pub async fn stats(&self) -> Value {
        json!({
            "connectedDevices": self.connected_device_count().await,
            "totalConnections": self.total_connections.load(Ordering::Relaxed),
            "messagesPublished": self.messages_published.load(Ordering::Relaxed),
            "uptimeMs": self.start_time.elapsed().as_millis() as u64,
        })
    }

    /// Start the keep-alive and reconciliation sweeps.
    pub async fn spawn_maintenance(self: &Arc<Self>, config: &RelayConfig) {
        let mut tasks = self.tasks.lock().await;

        let relay = self.clone();
        let ping_interval = std::time::Duration::from_secs(config.device_ping_interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(ping_interval);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                relay.sweep_devices().await;
            }
        }));

        let relay = self.clone();
        let reconcile_interval = std::time::Duration::from_secs(config.reconcile_interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(reconcile_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                relay.reconcile_store().await;
            }
        }));
    }

    /// Cancel all periodic tasks. Open sockets close on process teardown.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

/// `BRW-` followed by eight hex digits, case-insensitive.
fn is_valid_device_id(id: &str) -> bool {
    id.len() == 12
        && id[..4].eq_ignore_ascii_case("BRW-")
        && id[4..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Query parameters for the device WebSocket upgrade.
#[derive(Deserialize)]
pub struct DeviceWsQuery {
    pub id: Option<String>,
    pub key: Option<String>,
}

/// `GET /ws/device?id=<id>&key=<key>` — device WebSocket upgrade handler.
pub async fn device_ws(
    State(state): State<AppState>,
    Query(query): Query<DeviceWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_device_socket(socket, state, query))
}

/// Send a close frame with an application code and drop the socket.
async fn reject(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        })))
        .await;
}

async fn handle_device_socket(socket: WebSocket, state: AppState, query: DeviceWsQuery) {
    let (Some(id), Some(key)) = (query.id, query.key) else {
        reject(socket, CLOSE_BAD_REQUEST, "Missing id or key").await;
        return;
    };
    if !is_valid_device_id(&id) {
        reject(socket, CLOSE_BAD_REQUEST, "Invalid device id").await;
        return;
    }
    let device_id = id.to_ascii_uppercase();

    if key.len() < 32 || key.len() > 64 {
        reject(socket, CLOSE_AUTH, "Invalid device key").await;
        return;
    }
    match state.store.verify_device_key(&device_id, &key).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(device_id = %device_id, "Device key verification failed");
            reject(socket, CLOSE_AUTH, "Invalid device key").await;
            return;
        }
        Err(e) => {
            warn!(device_id = %device_id, "Device key verification unavailable: {e}");
            reject(socket, CLOSE_AUTH, "Invalid device key").await;
            return;
        }
    }

    let span = info_span!("device", device_id = %device_id);
    run_device_session(socket, state, device_id).instrument(span).await;
}

async fn run_device_session(socket: WebSocket, state: AppState, device_id: String) {
    let relay = state.relay.clone();
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<DeviceFrame>(256);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let conn_seq = relay.next_conn_seq();
    let last_seen_ms = Arc::new(AtomicU64::new(now_ms()));
    let missed_pings = Arc::new(AtomicU32::new(0));

    relay
        .register(DeviceConnection {
            device_id: device_id.clone(),
            tx: tx.clone(),
            conn_seq,
            connected_at: Instant::now(),
            last_seen_ms: last_seen_ms.clone(),
            missed_pings: missed_pings.clone(),
            shutdown_tx,
        })
        .await;
    info!("Device connected");

    // Mark online; store failures never abort the connection.
    if let Err(e) = state.store.update_device_status(&device_id, true).await {
        warn!("Failed to persist device online flag: {e}");
    }

    // Greet, then prompt an immediate state dump.
    let _ = tx
        .send(DeviceFrame::Json(
            json!({"type": "connected", "timestamp": now_ms()}),
        ))
        .await;
    let _ = tx
        .send(DeviceFrame::Json(
            json!({"type": "request_state", "timestamp": now_ms()}),
        ))
        .await;

    relay.publish(json!({
        "type": "device_online",
        "deviceId": device_id,
        "timestamp": now_ms(),
    }));

    // Writer: pump queued frames to the socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                DeviceFrame::Json(value) => {
                    let text = serde_json::to_string(&value).expect("JSON value serializes");
                    Message::Text(text.into())
                }
                DeviceFrame::Ping => Message::Ping(axum::body::Bytes::new()),
                DeviceFrame::Close { code, reason } => {
                    let _ = ws_sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: Utf8Bytes::from_static(reason),
                        })))
                        .await;
                    break;
                }
            };
            if ws_sink.send(message).await.is_err() {
                break;
            }
        }
    });

    // Reader: any received frame is liveness evidence.
    loop {
        let message = tokio::select! {
            message = ws_stream.next() => {
                let Some(Ok(message)) = message else { break };
                message
            }
            _ = shutdown_rx.changed() => break,
        };
        missed_pings.store(0, Ordering::Relaxed);
        last_seen_ms.store(now_ms(), Ordering::Relaxed);

        match message {
            Message::Binary(data) => match codec::decode_binary(&data) {
                Ok(messages) => {
                    for msg in messages {
                        relay.ingest(&device_id, msg);
                    }
                }
                Err(e) => warn!("Dropping undecodable binary frame: {e}"),
            },
            Message::Text(text) => match codec::decode_text(&text) {
                Ok(msg) => relay.ingest(&device_id, msg),
                Err(e) => warn!("Dropping undecodable text frame: {e}"),
            },
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }

    // Teardown — skipped when a successor already replaced this entry.
    if relay.unregister(&device_id, conn_seq).await {
        info!("Device disconnected");
        if let Err(e) = state.store.update_device_status(&device_id, false).await {
            warn!("Failed to persist device offline flag: {e}");
        }
        relay.publish(json!({
            "type": "device_offline",
            "deviceId": device_id,
            "timestamp": now_ms(),
        }));
    }
    writer.abort();
}
