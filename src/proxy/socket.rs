//! Client WebSocket accept path and session loop.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /ws?token=<access token>&device=<BRW-...>`.
//!    The upgrade always completes; failures close with 4001 (missing
//!    params), 4002 (bad token), or 4003 (device not owned).
//! 2. The proxy assigns a session id and replies with a `connected` frame
//!    carrying the device's liveness and the token expiry.
//! 3. The client is hydrated from the state cache ([`super::cache`]).
//! 4. All client frames are JSON; `refresh_auth`, `ping`, and
//!    `get_metrics` are answered locally, everything else is forwarded to
//!    the device (or queued while it is offline).

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, info_span, warn, Instrument};

use super::{ClientConnection, ClientFrame};
use crate::relay::{CLOSE_AUTH, CLOSE_BAD_REQUEST, CLOSE_BAD_TOKEN};
use crate::state::AppState;
use crate::util::now_ms;

/// Query parameters for the client WebSocket upgrade.
#[derive(Deserialize)]
pub struct ClientWsQuery {
    pub token: Option<String>,
    pub device: Option<String>,
}

/// `GET /ws?token=<token>&device=<id>` — client WebSocket upgrade handler.
pub async fn client_ws(
    State(state): State<AppState>,
    Query(query): Query<ClientWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_client_socket(socket, state, query))
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

async fn handle_client_socket(socket: WebSocket, state: AppState, query: ClientWsQuery) {
    let (Some(token), Some(device)) = (query.token, query.device) else {
        reject(socket, CLOSE_BAD_REQUEST, "Missing token or device").await;
        return;
    };
    let device_id = device.to_ascii_uppercase();

    let session = match state.store.verify_access_token(&token).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            reject(socket, CLOSE_BAD_TOKEN, "Invalid or expired token").await;
            return;
        }
        Err(e) => {
            warn!("Access token verification unavailable: {e}");
            reject(socket, CLOSE_BAD_TOKEN, "Invalid or expired token").await;
            return;
        }
    };
    match state
        .store
        .user_owns_device(&session.user.id, &device_id)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            reject(socket, CLOSE_AUTH, "Device not owned by user").await;
            return;
        }
        Err(e) => {
            warn!("Device ownership check unavailable: {e}");
            reject(socket, CLOSE_AUTH, "Device not owned by user").await;
            return;
        }
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    let span = info_span!("client", session_id = %session_id, device_id = %device_id);
    run_client_session(socket, state, session_id, session, device_id)
        .instrument(span)
        .await;
}

async fn run_client_session(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    session: crate::store::AuthSession,
    device_id: String,
) {
    let proxy = state.proxy.clone();
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ClientFrame>(256);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let conn = Arc::new(ClientConnection::new(
        session_id.clone(),
        session.user.id.clone(),
        device_id.clone(),
        tx,
        session.access_expires_at,
        shutdown_tx,
    ));
    proxy.register_client(conn.clone()).await;
    info!(user_id = %session.user.id, "Client connected");

    // Writer: pump queued frames to the socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                ClientFrame::Json(value) => {
                    let text = serde_json::to_string(&value).expect("JSON value serializes");
                    Message::Text(text.into())
                }
                ClientFrame::Text(raw) => Message::Text(raw.to_string().into()),
                ClientFrame::Ping => Message::Ping(axum::body::Bytes::new()),
                ClientFrame::Close { code, reason } => {
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

    let device_online = state.relay.is_device_connected(&device_id).await;
    let device_last_seen = state.relay.device_last_seen(&device_id).await;
    let _ = conn.tx.try_send(ClientFrame::Json(json!({
        "type": "connected",
        "sessionId": session_id,
        "deviceId": device_id,
        "deviceOnline": device_online,
        "deviceLastSeen": device_last_seen,
        "tokenExpiresAt": session.access_expires_at.timestamp_millis(),
        "serverTime": now_ms(),
        "timestamp": now_ms(),
    })));

    proxy.hydrate_client(&conn).await;
    conn.schedule_expiry_warning(session.access_expires_at).await;

    // Reader: any received frame is liveness evidence.
    loop {
        let message = tokio::select! {
            message = ws_stream.next() => {
                let Some(Ok(message)) = message else { break };
                message
            }
            _ = shutdown_rx.changed() => break,
        };
        conn.missed_pongs.store(0, Ordering::Relaxed);
        conn.last_activity_ms.store(now_ms(), Ordering::Relaxed);

        match message {
            Message::Text(text) => match serde_json::from_str::<Value>(&text) {
                Ok(parsed) if parsed.is_object() => {
                    proxy.handle_client_message(&conn, parsed).await;
                }
                Ok(_) => warn!("Dropping non-object client frame"),
                Err(e) => warn!("Dropping unparseable client frame: {e}"),
            },
            Message::Pong(_) => proxy.handle_pong(&conn).await,
            Message::Ping(_) => {}
            Message::Binary(_) => warn!("Dropping unexpected binary client frame"),
            Message::Close(_) => break,
        }
    }

    info!("Client disconnected");
    proxy.remove_client(&session_id).await;
    writer.abort();
}
