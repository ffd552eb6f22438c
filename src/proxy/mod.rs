//! Client proxy — owns authenticated client sessions, binds each to a
//! target device, and bridges the two planes.
//!
//! Device publications fan out to every client bound to that device; client
//! messages are forwarded to the device, or buffered in the per-device
//! offline queue when it is unreachable. The proxy also maintains the state
//! cache used to hydrate new clients, pings clients on a 30 s cadence
//! (browsers are costlier to ping than devices — the cadences are
//! intentionally different), and manages in-band token refresh plus the
//! expiry warning timer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::relay::DeviceRelay;
use crate::store::CredentialStore;
use crate::util::now_ms;

pub mod cache;
pub mod queue;
pub mod socket;

use cache::DeviceSnapshot;
use queue::{PendingMessage, PendingQueue, MAX_SEND_RETRIES, QUEUE_TTL};

/// Consecutive keep-alive sweeps a client may miss before termination.
const MAX_MISSED_PONGS: u32 = 2;

/// Lead time for the `token_expiring` warning.
const TOKEN_EXPIRY_WARNING_SECS: i64 = 300;

/// Outbound frame queued for a client's writer task.
#[derive(Debug)]
pub enum ClientFrame {
    /// Per-client reply, serialized by the writer.
    Json(Value),
    /// Fan-out payload, serialized once and shared across clients.
    Text(Arc<str>),
    /// WebSocket protocol ping.
    Ping,
    /// Close the socket with an application code; the writer exits after
    /// sending it.
    Close { code: u16, reason: &'static str },
}

/// Per-connection traffic counters and ping RTT tracking.
#[derive(Debug, Default, Clone)]
pub struct ConnectionMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub last_ping_rtt_ms: Option<u64>,
    pub avg_ping_rtt_ms: f64,
    pub ping_count: u64,
    pub reconnect_count: u64,
}

impl ConnectionMetrics {
    fn record_rtt(&mut self, rtt_ms: u64) {
        self.ping_count += 1;
        self.last_ping_rtt_ms = Some(rtt_ms);
        self.avg_ping_rtt_ms +=
            (rtt_ms as f64 - self.avg_ping_rtt_ms) / self.ping_count as f64;
    }

    fn to_json(&self) -> Value {
        json!({
            "messagesSent": self.messages_sent,
            "messagesReceived": self.messages_received,
            "lastPingRTT": self.last_ping_rtt_ms,
            "avgPingRTT": self.avg_ping_rtt_ms,
            "pingCount": self.ping_count,
            "reconnectCount": self.reconnect_count,
        })
    }
}

/// One authenticated client session, bound to a single device.
pub struct ClientConnection {
    pub session_id: String,
    pub user_id: String,
    pub device_id: String,
    pub tx: mpsc::Sender<ClientFrame>,
    pub connected_at: Instant,
    pub last_activity_ms: AtomicU64,
    pub missed_pongs: AtomicU32,
    /// Wall-clock ms when the last keep-alive ping was sent; 0 = none
    /// outstanding.
    pub ping_start_ms: AtomicU64,
    pub token_expires_at: Mutex<DateTime<Utc>>,
    expiry_timer: Mutex<Option<JoinHandle<()>>>,
    pub metrics: Mutex<ConnectionMetrics>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
}

impl ClientConnection {
    pub(crate) fn new(
        session_id: String,
        user_id: String,
        device_id: String,
        tx: mpsc::Sender<ClientFrame>,
        token_expires_at: DateTime<Utc>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            session_id,
            user_id,
            device_id,
            tx,
            connected_at: Instant::now(),
            last_activity_ms: AtomicU64::new(now_ms()),
            missed_pongs: AtomicU32::new(0),
            ping_start_ms: AtomicU64::new(0),
            token_expires_at: Mutex::new(token_expires_at),
            expiry_timer: Mutex::new(None),
            metrics: Mutex::new(ConnectionMetrics::default()),
            shutdown_tx,
        }
    }

    /// Arm (or re-arm) the one-shot `token_expiring` warning at
    /// `expires_at` minus five minutes. The previous timer is cancelled
    /// first so a refresh never leaves two timers armed.
    pub async fn schedule_expiry_warning(&self, expires_at: DateTime<Utc>) {
        let mut timer = self.expiry_timer.lock().await;
        if let Some(old) = timer.take() {
            old.abort();
        }
        let tx = self.tx.clone();
        *timer = Some(tokio::spawn(async move {
            let lead = expires_at - TimeDelta::seconds(TOKEN_EXPIRY_WARNING_SECS) - Utc::now();
            let delay = lead.to_std().unwrap_or_default();
            tokio::time::sleep(delay).await;
            let expires_in = (expires_at - Utc::now()).num_seconds().max(0);
            let _ = tx.try_send(ClientFrame::Json(json!({
                "type": "token_expiring",
                "expiresAt": expires_at.timestamp_millis(),
                "expiresIn": expires_in,
                "refreshRequired": true,
                "timestamp": now_ms(),
            })));
        }));
    }

    /// Cancel the expiry warning timer, if armed.
    pub async fn cancel_expiry_warning(&self) {
        if let Some(timer) = self.expiry_timer.lock().await.take() {
            timer.abort();
        }
    }

    #[cfg(test)]
    pub(crate) async fn expiry_timer_armed(&self) -> bool {
        self.expiry_timer
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}

/// Owns client sessions, the per-device index, the offline queues, and the
/// state cache.
pub struct ClientProxy {
    sessions: RwLock<HashMap<String, Arc<ClientConnection>>>,
    by_device: RwLock<HashMap<String, HashSet<String>>>,
    queues: Mutex<HashMap<String, PendingQueue>>,
    cache: RwLock<HashMap<String, DeviceSnapshot>>,
    relay: Arc<DeviceRelay>,
    store: Arc<dyn CredentialStore>,
    total_connections: AtomicU64,
    total_messages: AtomicU64,
    start_time: Instant,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientProxy {
    pub fn new(relay: Arc<DeviceRelay>, store: Arc<dyn CredentialStore>) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            by_device: RwLock::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            relay,
            store,
            total_connections: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            start_time: Instant::now(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Insert the session into the primary table and the per-device index.
    pub async fn register_client(&self, conn: Arc<ClientConnection>) {
        let mut by_device = self.by_device.write().await;
        let mut sessions = self.sessions.write().await;
        by_device
            .entry(conn.device_id.clone())
            .or_default()
            .insert(conn.session_id.clone());
        sessions.insert(conn.session_id.clone(), conn);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove the session from both tables and cancel its timers.
    pub async fn remove_client(&self, session_id: &str) {
        let conn = {
            let mut by_device = self.by_device.write().await;
            let mut sessions = self.sessions.write().await;
            let Some(conn) = sessions.remove(session_id) else {
                return;
            };
            if let Some(bound) = by_device.get_mut(&conn.device_id) {
                bound.remove(session_id);
                if bound.is_empty() {
                    by_device.remove(&conn.device_id);
                }
            }
            conn
        };
        conn.cancel_expiry_warning().await;
    }

    /// Queue a JSON reply for one client. Writes to a closed or congested
    /// socket are silently skipped.
    async fn send_json(&self, conn: &ClientConnection, message: Value) {
        let _ = conn.tx.try_send(ClientFrame::Json(message));
    }

    /// Handle one publication from the device relay: update the cache,
    /// react to lifecycle events, and fan the message out to bound clients.
    pub async fn handle_device_event(&self, message: Value) {
        let Some(device_id) = message["deviceId"].as_str().map(ToString::to_string) else {
            return;
        };
        let msg_type = message["type"].as_str().unwrap_or("").to_string();

        match msg_type.as_str() {
            // Flush before anything later in the publication order is seen.
            "device_online" => self.flush_queue(&device_id).await,
            "device_offline" => {
                self.cache.write().await.remove(&device_id);
            }
            "status" | "device_info" | "esp_status" | "pico_status" | "status_delta" => {
                self.cache
                    .write()
                    .await
                    .entry(device_id.clone())
                    .or_default()
                    .apply(&msg_type, &message);
            }
            _ => {}
        }

        let bound: Vec<String> = {
            let by_device = self.by_device.read().await;
            match by_device.get(&device_id) {
                Some(sessions) => sessions.iter().cloned().collect(),
                None => Vec::new(),
            }
        };
        if bound.is_empty() {
            debug!(device_id = %device_id, msg_type = %msg_type, "No clients bound, dropping publication");
            return;
        }

        // Serialize once; every bound client gets the same bytes.
        let raw: Arc<str> = serde_json::to_string(&message)
            .expect("JSON value serializes")
            .into();
        let sessions = self.sessions.read().await;
        for session_id in bound {
            if let Some(conn) = sessions.get(&session_id) {
                if conn.tx.try_send(ClientFrame::Text(raw.clone())).is_ok() {
                    conn.metrics.lock().await.messages_received += 1;
                    self.total_messages.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Single-shot flush of a device's offline queue, run when the device
    /// comes online. Expired entries are discarded; the rest get one send
    /// attempt each and the queue is emptied regardless of outcome.
    async fn flush_queue(&self, device_id: &str) {
        let Some(mut queue) = self.queues.lock().await.remove(device_id) else {
            return;
        };
        for mut pending in queue.drain() {
            if pending.is_expired() {
                debug!(device_id = %device_id, "Discarding expired queued message");
                continue;
            }
            if !self.relay.send_to_device(device_id, &pending.message).await {
                pending.retries += 1;
                if pending.retries >= MAX_SEND_RETRIES {
                    debug!(device_id = %device_id, "Dropping queued message after {} failed sends", pending.retries);
                }
                continue;
            }
            let sessions = self.sessions.read().await;
            if let Some(conn) = sessions.get(&pending.session_id) {
                self.send_json(
                    conn,
                    json!({
                        "type": "queued_message_sent",
                        "originalTimestamp": pending.message["timestamp"],
                        "messageType": pending.message["type"],
                        "timestamp": now_ms(),
                    }),
                )
                .await;
            }
        }
    }

    /// Hydrate a just-connected client from the state cache, asking the
    /// device for a fresh dump when the cache is empty or stale.
    pub async fn hydrate_client(&self, conn: &ClientConnection) {
        if !self.relay.is_device_connected(&conn.device_id).await {
            // Offline: the client hears about it when the device comes up.
            return;
        }
        let (frames, stale) = {
            let cache = self.cache.read().await;
            match cache.get(&conn.device_id) {
                Some(snapshot) if !snapshot.is_empty() => {
                    (snapshot.frames(), snapshot.is_stale())
                }
                _ => (Vec::new(), true),
            }
        };
        for frame in frames {
            self.send_json(conn, frame).await;
        }
        if stale {
            self.relay
                .send_to_device(
                    &conn.device_id,
                    &json!({"type": "request_state", "timestamp": now_ms()}),
                )
                .await;
        }
    }

    /// Dispatch one JSON message from a client: the control types
    /// (`refresh_auth`, `ping`, `get_metrics`) are answered locally, all
    /// other types are forwarded to the bound device.
    pub async fn handle_client_message(&self, conn: &Arc<ClientConnection>, mut message: Value) {
        match message["type"].as_str().unwrap_or("") {
            "refresh_auth" => {
                let token = message["token"].as_str().unwrap_or("");
                let reply = match self.store.verify_access_token(token).await {
                    Ok(Some(session)) if session.user.id == conn.user_id => {
                        *conn.token_expires_at.lock().await = session.access_expires_at;
                        conn.schedule_expiry_warning(session.access_expires_at).await;
                        json!({
                            "type": "auth_refreshed",
                            "success": true,
                            "tokenExpiresAt": session.access_expires_at.timestamp_millis(),
                            "timestamp": now_ms(),
                        })
                    }
                    Ok(Some(_)) => json!({
                        "type": "auth_refreshed",
                        "success": false,
                        "error": "Token belongs to a different user",
                        "timestamp": now_ms(),
                    }),
                    Ok(None) => json!({
                        "type": "auth_refreshed",
                        "success": false,
                        "error": "Invalid or expired token",
                        "timestamp": now_ms(),
                    }),
                    Err(e) => {
                        warn!(session_id = %conn.session_id, "Token refresh verification failed: {e}");
                        json!({
                            "type": "auth_refreshed",
                            "success": false,
                            "error": "Verification unavailable",
                            "timestamp": now_ms(),
                        })
                    }
                };
                self.send_json(conn, reply).await;
            }
            "ping" => {
                self.send_json(
                    conn,
                    json!({
                        "type": "pong",
                        "timestamp": now_ms(),
                        "clientTimestamp": message["timestamp"],
                    }),
                )
                .await;
            }
            "get_metrics" => {
                let metrics = conn.metrics.lock().await.to_json();
                let online = self.relay.is_device_connected(&conn.device_id).await;
                let queued = self.queued_count(&conn.device_id).await;
                self.send_json(
                    conn,
                    json!({
                        "type": "metrics",
                        "connection": metrics,
                        "deviceOnline": online,
                        "queuedMessages": queued,
                        "timestamp": now_ms(),
                    }),
                )
                .await;
            }
            _ => {
                message["timestamp"] = json!(now_ms());
                if self.relay.send_to_device(&conn.device_id, &message).await {
                    conn.metrics.lock().await.messages_sent += 1;
                } else {
                    let queued = {
                        let mut queues = self.queues.lock().await;
                        queues
                            .entry(conn.device_id.clone())
                            .or_default()
                            .push(PendingMessage::new(message, conn.session_id.clone()))
                    };
                    let last_seen = self.relay.device_last_seen(&conn.device_id).await;
                    self.send_json(
                        conn,
                        json!({
                            "type": "device_status",
                            "online": false,
                            "lastSeen": last_seen,
                            "messageQueued": true,
                            "queuedMessages": queued,
                            "queueTTL": QUEUE_TTL.as_secs(),
                            "timestamp": now_ms(),
                        }),
                    )
                    .await;
                }
            }
        }
    }

    /// Record a WebSocket pong from a client.
    pub async fn handle_pong(&self, conn: &ClientConnection) {
        conn.missed_pongs.store(0, Ordering::Relaxed);
        let started = conn.ping_start_ms.swap(0, Ordering::Relaxed);
        if started > 0 {
            let rtt = now_ms().saturating_sub(started);
            conn.metrics.lock().await.record_rtt(rtt);
        }
    }

    /// Keep-alive sweep: ping every client, terminating any that has gone
    /// [`MAX_MISSED_PONGS`] sweeps without liveness evidence.
    pub async fn sweep_clients(&self) {
        let sessions = self.sessions.read().await;
        for (session_id, conn) in sessions.iter() {
            let missed = conn.missed_pongs.fetch_add(1, Ordering::Relaxed) + 1;
            if missed > MAX_MISSED_PONGS {
                warn!(session_id = %session_id, missed, "Client unresponsive, terminating");
                let _ = conn.shutdown_tx.send(true);
            } else {
                conn.ping_start_ms.store(now_ms(), Ordering::Relaxed);
                let _ = conn.tx.try_send(ClientFrame::Ping);
            }
        }
    }

    /// Purge expired pending messages and drop empty queues.
    pub async fn sweep_queues(&self) {
        let mut queues = self.queues.lock().await;
        queues.retain(|device_id, queue| {
            let removed = queue.purge_expired();
            if removed > 0 {
                debug!(device_id = %device_id, removed, "Purged expired queued messages");
            }
            !queue.is_empty()
        });
    }

    pub async fn queued_count(&self, device_id: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(device_id)
            .map_or(0, PendingQueue::len)
    }

    pub async fn client_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn stats(&self) -> Value {
        let clients_by_device: HashMap<String, usize> = {
            let by_device = self.by_device.read().await;
            by_device
                .iter()
                .map(|(device, bound)| (device.clone(), bound.len()))
                .collect()
        };
        let queued_total: usize = self.queues.lock().await.values().map(PendingQueue::len).sum();
        json!({
            "connectedClients": self.client_count().await,
            "totalConnections": self.total_connections.load(Ordering::Relaxed),
            "totalMessages": self.total_messages.load(Ordering::Relaxed),
            "uptimeMs": self.start_time.elapsed().as_millis() as u64,
            "queuedMessagesTotal": queued_total,
            "clientsByDevice": clients_by_device,
        })
    }

    /// Start the relay subscription plus the keep-alive and queue sweeps.
    pub async fn spawn_maintenance(self: &Arc<Self>, config: &ProxyConfig) {
        let mut tasks = self.tasks.lock().await;

        let proxy = self.clone();
        let mut events = self.relay.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(message) => proxy.handle_device_event(message).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Fan-out lagged behind device publications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let proxy = self.clone();
        let ping_interval = std::time::Duration::from_secs(config.client_ping_interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(ping_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                proxy.sweep_clients().await;
            }
        }));

        let proxy = self.clone();
        let sweep_interval = std::time::Duration::from_secs(config.queue_sweep_interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                proxy.sweep_queues().await;
            }
        }));
    }

    /// Cancel periodic tasks and every armed expiry timer. In-flight queues
    /// and caches are discarded with the process.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let sessions = self.sessions.read().await;
        for conn in sessions.values() {
            conn.cancel_expiry_warning().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::device::{DeviceConnection, DeviceFrame};
    use crate::store::mock::MockStore;
    use std::time::Duration;

    const DEVICE: &str = "BRW-01ABCDEF";

    fn setup(store: MockStore) -> (Arc<DeviceRelay>, Arc<ClientProxy>) {
        let store = Arc::new(store);
        let relay = DeviceRelay::new(store.clone());
        let proxy = ClientProxy::new(relay.clone(), store);
        (relay, proxy)
    }

    async fn attach_device(relay: &DeviceRelay, device_id: &str) -> mpsc::Receiver<DeviceFrame> {
        let (tx, rx) = mpsc::channel(64);
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        relay
            .register(DeviceConnection {
                device_id: device_id.to_string(),
                tx,
                conn_seq: relay.next_conn_seq(),
                connected_at: Instant::now(),
                last_seen_ms: Arc::new(AtomicU64::new(now_ms())),
                missed_pings: Arc::new(AtomicU32::new(0)),
                shutdown_tx,
            })
            .await;
        rx
    }

    async fn attach_client(
        proxy: &ClientProxy,
        session_id: &str,
        user_id: &str,
        device_id: &str,
    ) -> (
        Arc<ClientConnection>,
        mpsc::Receiver<ClientFrame>,
        watch::Receiver<bool>,
    ) {
        let (tx, rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let conn = Arc::new(ClientConnection::new(
            session_id.to_string(),
            user_id.to_string(),
            device_id.to_string(),
            tx,
            Utc::now() + TimeDelta::seconds(600),
            shutdown_tx,
        ));
        proxy.register_client(conn.clone()).await;
        (conn, rx, shutdown_rx)
    }

    async fn next_json(rx: &mut mpsc::Receiver<ClientFrame>) -> Value {
        match rx.recv().await.unwrap() {
            ClientFrame::Json(value) => value,
            ClientFrame::Text(raw) => serde_json::from_str(&raw).unwrap(),
            other => panic!("expected data frame, got {other:?}"),
        }
    }

    fn online_event(device_id: &str) -> Value {
        json!({"type": "device_online", "deviceId": device_id, "timestamp": now_ms()})
    }

    #[tokio::test]
    async fn ping_is_answered_with_client_timestamp() {
        let (_relay, proxy) = setup(MockStore::new());
        let (conn, mut rx, _s) = attach_client(&proxy, "s1", "user-1", DEVICE).await;

        proxy
            .handle_client_message(&conn, json!({"type": "ping", "timestamp": 12345}))
            .await;
        let pong = next_json(&mut rx).await;
        assert_eq!(pong["type"], "pong");
        assert_eq!(pong["clientTimestamp"], 12345);
        assert!(pong["timestamp"].as_u64().is_some());

        // Repeated pings yield independent pongs.
        proxy
            .handle_client_message(&conn, json!({"type": "ping", "timestamp": 12346}))
            .await;
        let pong = next_json(&mut rx).await;
        assert_eq!(pong["clientTimestamp"], 12346);
    }

    #[tokio::test]
    async fn forwarded_message_is_stamped_and_otherwise_unchanged() {
        let (relay, proxy) = setup(MockStore::new());
        let mut device_rx = attach_device(&relay, DEVICE).await;
        let (conn, _rx, _s) = attach_client(&proxy, "s1", "user-1", DEVICE).await;

        proxy
            .handle_client_message(&conn, json!({"type": "brew_start", "profile": "lungo"}))
            .await;
        let DeviceFrame::Json(sent) = device_rx.recv().await.unwrap() else {
            panic!("expected json frame");
        };
        assert_eq!(sent["type"], "brew_start");
        assert_eq!(sent["profile"], "lungo");
        assert!(sent["timestamp"].as_u64().is_some());
        assert_eq!(conn.metrics.lock().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn offline_sends_queue_and_notify_then_flush_on_online() {
        let (relay, proxy) = setup(MockStore::new());
        let (conn, mut rx, _s) = attach_client(&proxy, "s1", "user-1", DEVICE).await;

        for expected_depth in 1..=3u64 {
            proxy
                .handle_client_message(&conn, json!({"type": "brew_start"}))
                .await;
            let notice = next_json(&mut rx).await;
            assert_eq!(notice["type"], "device_status");
            assert_eq!(notice["online"], false);
            assert_eq!(notice["messageQueued"], true);
            assert_eq!(notice["queuedMessages"], expected_depth);
            assert_eq!(notice["queueTTL"], 10);
        }
        assert_eq!(proxy.queued_count(DEVICE).await, 3);

        // Device comes online: the queue is flushed in order and the
        // originating client is told about each delivery.
        let mut device_rx = attach_device(&relay, DEVICE).await;
        proxy.handle_device_event(online_event(DEVICE)).await;

        let mut sent_timestamps = Vec::new();
        for _ in 0..3 {
            let DeviceFrame::Json(sent) = device_rx.recv().await.unwrap() else {
                panic!("expected json frame");
            };
            assert_eq!(sent["type"], "brew_start");
            sent_timestamps.push(sent["timestamp"].as_u64().unwrap());
        }
        for timestamp in sent_timestamps {
            let notice = next_json(&mut rx).await;
            assert_eq!(notice["type"], "queued_message_sent");
            assert_eq!(notice["messageType"], "brew_start");
            assert_eq!(notice["originalTimestamp"], timestamp);
        }
        // The online event itself still fans out to the client.
        let online = next_json(&mut rx).await;
        assert_eq!(online["type"], "device_online");
        assert_eq!(proxy.queued_count(DEVICE).await, 0);
    }

    #[tokio::test]
    async fn expired_queue_entries_are_not_flushed() {
        let (relay, proxy) = setup(MockStore::new());
        let (conn, mut rx, _s) = attach_client(&proxy, "s1", "user-1", DEVICE).await;

        proxy
            .handle_client_message(&conn, json!({"type": "brew_start"}))
            .await;
        let _ = next_json(&mut rx).await; // device_status notice
        proxy
            .queues
            .lock()
            .await
            .get_mut(DEVICE)
            .unwrap()
            .backdate_all(Duration::from_secs(11));

        let mut device_rx = attach_device(&relay, DEVICE).await;
        proxy.handle_device_event(online_event(DEVICE)).await;

        // Only the fanned-out online event reaches the client; the device
        // receives nothing.
        let online = next_json(&mut rx).await;
        assert_eq!(online["type"], "device_online");
        assert!(rx.try_recv().is_err());
        assert!(device_rx.try_recv().is_err());
        assert_eq!(proxy.queued_count(DEVICE).await, 0);
    }

    #[tokio::test]
    async fn queue_sweep_purges_expired_and_drops_empty_queues() {
        let (_relay, proxy) = setup(MockStore::new());
        let (conn, _rx, _s) = attach_client(&proxy, "s1", "user-1", DEVICE).await;
        proxy
            .handle_client_message(&conn, json!({"type": "brew_start"}))
            .await;
        proxy
            .queues
            .lock()
            .await
            .get_mut(DEVICE)
            .unwrap()
            .backdate_all(Duration::from_secs(11));

        proxy.sweep_queues().await;
        assert!(proxy.queues.lock().await.is_empty());
    }

    #[tokio::test]
    async fn hydration_with_fresh_cache_skips_request_state() {
        let (relay, proxy) = setup(MockStore::new());
        let mut device_rx = attach_device(&relay, DEVICE).await;
        proxy
            .handle_device_event(json!({"type": "status", "deviceId": DEVICE, "temp": 92.0}))
            .await;

        let (conn, mut rx, _s) = attach_client(&proxy, "s1", "user-1", DEVICE).await;
        proxy.hydrate_client(&conn).await;

        let cached = next_json(&mut rx).await;
        assert_eq!(cached["type"], "status");
        assert_eq!(cached["temp"], 92.0);
        assert!(device_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn hydration_with_stale_cache_requests_fresh_state() {
        let (relay, proxy) = setup(MockStore::new());
        let mut device_rx = attach_device(&relay, DEVICE).await;
        proxy
            .handle_device_event(json!({"type": "status", "deviceId": DEVICE, "temp": 92.0}))
            .await;
        proxy
            .cache
            .write()
            .await
            .get_mut(DEVICE)
            .unwrap()
            .backdate(Duration::from_secs(15));

        let (conn, mut rx, _s) = attach_client(&proxy, "s1", "user-1", DEVICE).await;
        proxy.hydrate_client(&conn).await;

        let cached = next_json(&mut rx).await;
        assert_eq!(cached["type"], "status");
        let DeviceFrame::Json(sent) = device_rx.recv().await.unwrap() else {
            panic!("expected json frame");
        };
        assert_eq!(sent["type"], "request_state");
    }

    #[tokio::test]
    async fn hydration_with_empty_cache_requests_fresh_state() {
        let (relay, proxy) = setup(MockStore::new());
        let mut device_rx = attach_device(&relay, DEVICE).await;

        let (conn, mut rx, _s) = attach_client(&proxy, "s1", "user-1", DEVICE).await;
        proxy.hydrate_client(&conn).await;

        assert!(rx.try_recv().is_err());
        let DeviceFrame::Json(sent) = device_rx.recv().await.unwrap() else {
            panic!("expected json frame");
        };
        assert_eq!(sent["type"], "request_state");
    }

    #[tokio::test]
    async fn hydration_of_offline_device_sends_nothing() {
        let (_relay, proxy) = setup(MockStore::new());
        let (conn, mut rx, _s) = attach_client(&proxy, "s1", "user-1", DEVICE).await;
        proxy.hydrate_client(&conn).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn device_offline_clears_the_cache() {
        let (_relay, proxy) = setup(MockStore::new());
        proxy
            .handle_device_event(json!({"type": "status", "deviceId": DEVICE}))
            .await;
        assert!(proxy.cache.read().await.contains_key(DEVICE));

        proxy
            .handle_device_event(json!({"type": "device_offline", "deviceId": DEVICE}))
            .await;
        assert!(!proxy.cache.read().await.contains_key(DEVICE));
    }

    #[tokio::test]
    async fn fan_out_reaches_every_bound_client_once() {
        let (_relay, proxy) = setup(MockStore::new());
        let (conn_a, mut rx_a, _sa) = attach_client(&proxy, "s1", "user-1", DEVICE).await;
        let (_conn_b, mut rx_b, _sb) = attach_client(&proxy, "s2", "user-2", DEVICE).await;
        let (_conn_c, mut rx_c, _sc) = attach_client(&proxy, "s3", "user-3", "BRW-FFFFFFFF").await;

        proxy
            .handle_device_event(json!({"type": "status", "deviceId": DEVICE, "temp": 92.0}))
            .await;

        assert_eq!(next_json(&mut rx_a).await["temp"], 92.0);
        assert_eq!(next_json(&mut rx_b).await["temp"], 92.0);
        assert!(rx_c.try_recv().is_err());
        assert_eq!(conn_a.metrics.lock().await.messages_received, 1);
    }

    #[tokio::test]
    async fn refresh_auth_replaces_expiry_and_reschedules_warning() {
        let new_expiry = Utc::now() + TimeDelta::seconds(1800);
        let store = MockStore::new().with_session("fresh-token", "user-1", new_expiry);
        let (_relay, proxy) = setup(store);
        let (conn, mut rx, _s) = attach_client(&proxy, "s1", "user-1", DEVICE).await;
        conn.schedule_expiry_warning(*conn.token_expires_at.lock().await)
            .await;

        proxy
            .handle_client_message(&conn, json!({"type": "refresh_auth", "token": "fresh-token"}))
            .await;

        let reply = next_json(&mut rx).await;
        assert_eq!(reply["type"], "auth_refreshed");
        assert_eq!(reply["success"], true);
        assert_eq!(reply["tokenExpiresAt"], new_expiry.timestamp_millis());
        assert_eq!(*conn.token_expires_at.lock().await, new_expiry);
        assert!(conn.expiry_timer_armed().await);
    }

    #[tokio::test]
    async fn refresh_auth_rejects_other_users_token_without_closing() {
        let store = MockStore::new().with_session(
            "stolen-token",
            "user-2",
            Utc::now() + TimeDelta::seconds(1800),
        );
        let (_relay, proxy) = setup(store);
        let (conn, mut rx, mut shutdown) = attach_client(&proxy, "s1", "user-1", DEVICE).await;
        let original_expiry = *conn.token_expires_at.lock().await;

        proxy
            .handle_client_message(&conn, json!({"type": "refresh_auth", "token": "stolen-token"}))
            .await;

        let reply = next_json(&mut rx).await;
        assert_eq!(reply["success"], false);
        assert!(reply["error"].as_str().is_some());
        assert_eq!(*conn.token_expires_at.lock().await, original_expiry);
        assert!(!shutdown.has_changed().unwrap());
    }

    #[tokio::test]
    async fn refresh_auth_rejects_unknown_token() {
        let (_relay, proxy) = setup(MockStore::new());
        let (conn, mut rx, _s) = attach_client(&proxy, "s1", "user-1", DEVICE).await;

        proxy
            .handle_client_message(&conn, json!({"type": "refresh_auth", "token": "bogus"}))
            .await;
        let reply = next_json(&mut rx).await;
        assert_eq!(reply["type"], "auth_refreshed");
        assert_eq!(reply["success"], false);
    }

    #[tokio::test]
    async fn get_metrics_reports_connection_and_queue_state() {
        let (_relay, proxy) = setup(MockStore::new());
        let (conn, mut rx, _s) = attach_client(&proxy, "s1", "user-1", DEVICE).await;

        proxy
            .handle_client_message(&conn, json!({"type": "brew_start"}))
            .await;
        let _ = next_json(&mut rx).await; // device_status notice

        proxy
            .handle_client_message(&conn, json!({"type": "get_metrics"}))
            .await;
        let reply = next_json(&mut rx).await;
        assert_eq!(reply["type"], "metrics");
        assert_eq!(reply["deviceOnline"], false);
        assert_eq!(reply["queuedMessages"], 1);
        assert_eq!(reply["connection"]["messagesSent"], 0);
        assert_eq!(reply["connection"]["reconnectCount"], 0);
        assert!(reply["connection"]["lastPingRTT"].is_null());
    }

    #[tokio::test]
    async fn sweep_terminates_after_two_missed_pongs() {
        let (_relay, proxy) = setup(MockStore::new());
        let (_conn, mut rx, mut shutdown) = attach_client(&proxy, "s1", "user-1", DEVICE).await;

        proxy.sweep_clients().await; // missed = 1 → ping
        proxy.sweep_clients().await; // missed = 2 → ping
        assert!(!shutdown.has_changed().unwrap());
        assert!(matches!(rx.recv().await.unwrap(), ClientFrame::Ping));
        assert!(matches!(rx.recv().await.unwrap(), ClientFrame::Ping));

        proxy.sweep_clients().await; // missed = 3 → terminate
        assert!(shutdown.has_changed().unwrap());
    }

    #[tokio::test]
    async fn pong_resets_counter_and_records_rtt() {
        let (_relay, proxy) = setup(MockStore::new());
        let (conn, _rx, _s) = attach_client(&proxy, "s1", "user-1", DEVICE).await;

        proxy.sweep_clients().await;
        assert_eq!(conn.missed_pongs.load(Ordering::Relaxed), 1);

        proxy.handle_pong(&conn).await;
        assert_eq!(conn.missed_pongs.load(Ordering::Relaxed), 0);
        let metrics = conn.metrics.lock().await;
        assert_eq!(metrics.ping_count, 1);
        assert!(metrics.last_ping_rtt_ms.is_some());
    }

    #[tokio::test]
    async fn remove_client_clears_both_tables_and_cancels_timer() {
        let (_relay, proxy) = setup(MockStore::new());
        let (conn, _rx, _s) = attach_client(&proxy, "s1", "user-1", DEVICE).await;
        conn.schedule_expiry_warning(*conn.token_expires_at.lock().await)
            .await;

        proxy.remove_client("s1").await;
        assert_eq!(proxy.client_count().await, 0);
        assert!(proxy.by_device.read().await.is_empty());
        assert!(!conn.expiry_timer_armed().await);
    }

    #[tokio::test]
    async fn stats_reflect_clients_and_queues() {
        let (_relay, proxy) = setup(MockStore::new());
        let (conn, mut rx, _s) = attach_client(&proxy, "s1", "user-1", DEVICE).await;
        let (_c2, _rx2, _s2) = attach_client(&proxy, "s2", "user-2", DEVICE).await;
        proxy
            .handle_client_message(&conn, json!({"type": "brew_start"}))
            .await;
        let _ = next_json(&mut rx).await;

        let stats = proxy.stats().await;
        assert_eq!(stats["connectedClients"], 2);
        assert_eq!(stats["totalConnections"], 2);
        assert_eq!(stats["queuedMessagesTotal"], 1);
        assert_eq!(stats["clientsByDevice"][DEVICE], 2);
    }

    #[test]
    fn running_mean_rtt() {
        let mut metrics = ConnectionMetrics::default();
        metrics.record_rtt(10);
        metrics.record_rtt(20);
        metrics.record_rtt(30);
        assert_eq!(metrics.last_ping_rtt_ms, Some(30));
        assert!((metrics.avg_ping_rtt_ms - 20.0).abs() < f64::EPSILON);
        assert_eq!(metrics.ping_count, 3);
    }
}
