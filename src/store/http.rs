//! HTTP-backed [`CredentialStore`] talking to the account service.
//!
//! The account service exposes a small internal JSON API (not reachable from
//! the public ingress):
//!
//! - `POST /internal/devices/{id}/verify-key` `{"key"}` → `{"valid"}`
//! - `POST /internal/sessions/verify` `{"token"}` → 200 session body | 404
//! - `GET  /internal/users/{uid}/devices/{did}` → `{"owned"}` (404 = not owned)
//! - `PUT  /internal/devices/{id}/status` `{"online"}`
//! - `POST /internal/devices/reconcile` `{"connected": [ids]}` → `{"stale"}`

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::{json, Value};

use super::{AuthSession, AuthUser, CredentialStore, StoreError};

/// Account-service client.
pub struct HttpCredentialStore {
    client: Client<HttpConnector, Full<Bytes>>,
    base_url: String,
    timeout: Duration,
}

impl HttpCredentialStore {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Issue a JSON request and return `(status, body)`. A non-2xx status is
    /// not an error here; callers decide which statuses are meaningful.
    async fn request_json(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, Value), StoreError> {
        let uri = format!("{}{path}", self.base_url);
        let payload = body
            .map(|b| serde_json::to_vec(&b).expect("JSON value serializes"))
            .unwrap_or_default();
        let request = Request::builder()
            .method(method)
            .uri(&uri)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| StoreError::Transport(format!("timeout contacting {uri}")))?
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?
            .to_bytes();

        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Decode(e.to_string()))?
        };
        Ok((status, value))
    }
}

#[async_trait]
impl CredentialStore for HttpCredentialStore {
    async fn verify_device_key(&self, id: &str, key: &str) -> Result<bool, StoreError> {
        let (status, body) = self
            .request_json(
                Method::POST,
                &format!("/internal/devices/{id}/verify-key"),
                Some(json!({"key": key})),
            )
            .await?;
        if !status.is_success() {
            return Err(StoreError::Status(status.as_u16()));
        }
        Ok(body["valid"].as_bool().unwrap_or(false))
    }

    async fn verify_access_token(&self, token: &str) -> Result<Option<AuthSession>, StoreError> {
        let (status, body) = self
            .request_json(
                Method::POST,
                "/internal/sessions/verify",
                Some(json!({"token": token})),
            )
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StoreError::Status(status.as_u16()));
        }

        let user_id = body["user"]["id"]
            .as_str()
            .ok_or_else(|| StoreError::Decode("missing user.id".into()))?;
        let email = body["user"]["email"].as_str().unwrap_or_default();
        let expires_raw = body["session"]["access_expires_at"]
            .as_str()
            .ok_or_else(|| StoreError::Decode("missing session.access_expires_at".into()))?;
        let access_expires_at = DateTime::parse_from_rfc3339(expires_raw)
            .map_err(|e| StoreError::Decode(format!("bad access_expires_at: {e}")))?
            .with_timezone(&chrono::Utc);

        Ok(Some(AuthSession {
            user: AuthUser {
                id: user_id.to_string(),
                email: email.to_string(),
            },
            access_expires_at,
        }))
    }

    async fn user_owns_device(&self, user_id: &str, device_id: &str) -> Result<bool, StoreError> {
        let (status, body) = self
            .request_json(
                Method::GET,
                &format!("/internal/users/{user_id}/devices/{device_id}"),
                None,
            )
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(StoreError::Status(status.as_u16()));
        }
        Ok(body["owned"].as_bool().unwrap_or(false))
    }

    async fn update_device_status(&self, device_id: &str, online: bool) -> Result<(), StoreError> {
        let (status, _) = self
            .request_json(
                Method::PUT,
                &format!("/internal/devices/{device_id}/status"),
                Some(json!({"online": online})),
            )
            .await?;
        if !status.is_success() {
            return Err(StoreError::Status(status.as_u16()));
        }
        Ok(())
    }

    async fn sync_online_devices(&self, connected: &HashSet<String>) -> Result<u64, StoreError> {
        let ids: Vec<&String> = connected.iter().collect();
        let (status, body) = self
            .request_json(
                Method::POST,
                "/internal/devices/reconcile",
                Some(json!({"connected": ids})),
            )
            .await?;
        if !status.is_success() {
            return Err(StoreError::Status(status.as_u16()));
        }
        Ok(body["stale"].as_u64().unwrap_or(0))
    }
}
