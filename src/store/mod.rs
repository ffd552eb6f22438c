//! Credential and ownership store — the relay's view of the account service.
//!
//! The relay never owns user or device rows; it asks the account service to
//! verify device keys and session tokens, check ownership, and keep the
//! persisted online flag in sync with the in-memory registries. All of that
//! is behind [`CredentialStore`] so the relay plane can be exercised against
//! an in-memory double in tests.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod http;

pub use http::HttpCredentialStore;

/// Errors surfaced by store operations.
///
/// Store failures never reach socket peers: callers log and continue, or
/// treat the failure as a verification miss on the auth paths.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("account service request failed: {0}")]
    Transport(String),
    #[error("account service returned status {0}")]
    Status(u16),
    #[error("account service returned malformed body: {0}")]
    Decode(String),
}

/// An authenticated user, as reported by the account service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
}

/// A verified client session: the user plus the access-token expiry.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub user: AuthUser,
    pub access_expires_at: DateTime<Utc>,
}

/// Contract consumed from the account service.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// True iff `key` is the registered secret for device `id`.
    async fn verify_device_key(&self, id: &str, key: &str) -> Result<bool, StoreError>;

    /// Resolve an access token to its session, or `None` if the token is
    /// unknown, revoked, or expired.
    async fn verify_access_token(&self, token: &str) -> Result<Option<AuthSession>, StoreError>;

    /// True iff `user_id` owns `device_id`.
    async fn user_owns_device(&self, user_id: &str, device_id: &str) -> Result<bool, StoreError>;

    /// Persist the device's online flag.
    async fn update_device_status(&self, device_id: &str, online: bool) -> Result<(), StoreError>;

    /// Mark any device flagged online in persistence but absent from
    /// `connected` as offline. Returns the number of rows fixed up.
    async fn sync_online_devices(&self, connected: &HashSet<String>) -> Result<u64, StoreError>;
}
