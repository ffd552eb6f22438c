//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::proxy::ClientProxy;
use crate::relay::DeviceRelay;
use crate::store::CredentialStore;

/// Shared application state for the brewlink server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Account-service client used by both accept paths.
    pub store: Arc<dyn CredentialStore>,
    /// Device-side registry and publication.
    pub relay: Arc<DeviceRelay>,
    /// Client-side sessions, queues, and state cache.
    pub proxy: Arc<ClientProxy>,
}
