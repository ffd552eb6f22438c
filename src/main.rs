#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # brewlink
//!
//! Cloud WebSocket relay for BrewOS espresso machines.
//!
//! Machines keep one persistent outbound WebSocket to the relay; browser
//! and mobile clients connect with a session token and a target device id.
//! The relay routes control messages from client to device, streams
//! telemetry from device to every subscribed client, buffers client
//! messages while a device is offline, and keeps a per-device state cache
//! so new clients render instantly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use brewlink::{
    auth, proxy, relay, routes, util, AppState, ClientProxy, Config, DeviceRelay,
    HttpCredentialStore,
};

/// Cloud WebSocket relay for BrewOS espresso machines.
#[derive(Parser)]
#[command(name = "brewlink", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("brewlink v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!("Account service: {}", config.store.base_url);

    if config.auth.admin_key == "change-me" {
        warn!("Using default admin key — set BREWLINK_ADMIN_KEY or update config");
    }

    let store = Arc::new(HttpCredentialStore::new(
        &config.store.base_url,
        Duration::from_millis(config.store.request_timeout_ms),
    ));
    let relay = DeviceRelay::new(store.clone());
    let proxy = ClientProxy::new(relay.clone(), store.clone());

    relay.spawn_maintenance(&config.relay).await;
    proxy.spawn_maintenance(&config.proxy).await;

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        store,
        relay: relay.clone(),
        proxy: proxy.clone(),
    };

    // Build router
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let admin_routes = Router::new()
        .route("/api/stats", get(routes::admin::stats))
        .route("/api/devices", get(routes::admin::list_devices))
        .route("/api/devices/{id}", delete(routes::admin::disconnect_device))
        .route("/api/devices/{id}/logs/info", get(routes::logs::get_log_info))
        .route(
            "/api/devices/{id}/logs",
            get(routes::logs::get_logs).delete(routes::logs::clear_logs),
        )
        .route(
            "/api/devices/{id}/logs/enabled",
            post(routes::logs::set_log_enabled),
        )
        .route(
            "/api/devices/{id}/logs/pico-forwarding",
            post(routes::logs::set_pico_forwarding),
        )
        .route(
            "/api/devices/{id}/logs/debug",
            post(routes::logs::set_debug_logs),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_admin,
        ));

    let ws_routes = Router::new()
        .route("/ws", get(proxy::socket::client_ws))
        .route("/ws/device", get(relay::device::device_ws));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
        ]);

    let app = Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .merge(ws_routes)
        .with_state(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            state.config.server.max_connections,
        ));

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let signal = util::termination_signal().await;
            info!(signal, "Shutting down");
        })
        .await
        .expect("Server error");

    // Cancel sweeps and timers; sockets close with the process.
    relay.shutdown().await;
    proxy.shutdown().await;
    info!("Relay stopped");
}
