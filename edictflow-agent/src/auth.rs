//! Device-authorization login
//!
//! `start` asks the identity endpoint for a device code the user confirms in
//! a browser; `poll_until_authorized` then polls for the bearer token at the
//! advertised interval until it is issued, refused, or the code expires.
//! Token-endpoint failures follow the device-flow error strings
//! (`authorization_pending`, `slow_down`, `expired_token`, `access_denied`).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{AgentError, Result};
use crate::store::AuthRecord;

/// Seconds added to the poll interval on `slow_down`
pub const SLOW_DOWN_STEP_SECS: u64 = 5;

/// HTTP timeout for each identity request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

fn default_interval() -> u64 {
    5
}

/// Device code handed out by `start`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    /// Seconds the code stays valid
    pub expires_in: u64,
    /// Minimum seconds between polls
    #[serde(default = "default_interval")]
    pub interval: u64,
}

/// Token issued once the user confirms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Seconds until the token expires; absent for non-expiring tokens
    #[serde(default)]
    pub expires_in: Option<u64>,
    pub user_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
}

impl TokenGrant {
    /// Store form; the agent id defaults to the user id
    pub fn into_auth_record(self, now: DateTime<Utc>) -> AuthRecord {
        let expires_at = self
            .expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| now + chrono::Duration::seconds(secs));
        AuthRecord {
            token: self.access_token,
            expires_at,
            agent_id: self.agent_id.unwrap_or_else(|| self.user_id.clone()),
            user_id: self.user_id,
        }
    }
}

/// One failed poll
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("authorization pending")]
    AuthorizationPending,

    #[error("polling too fast")]
    SlowDown,

    #[error("device code expired")]
    ExpiredToken,

    #[error("authorization denied")]
    AccessDenied,

    #[error("transport error: {0}")]
    Transport(String),
}

impl PollError {
    /// Map a device-flow error string
    pub fn from_code(code: &str) -> Self {
        match code {
            "authorization_pending" => PollError::AuthorizationPending,
            "slow_down" => PollError::SlowDown,
            "expired_token" => PollError::ExpiredToken,
            "access_denied" => PollError::AccessDenied,
            other => PollError::Transport(format!("unexpected error '{}'", other)),
        }
    }
}

impl From<PollError> for AgentError {
    fn from(e: PollError) -> Self {
        AgentError::Auth(e.to_string())
    }
}

/// One token-endpoint round trip
#[async_trait]
pub trait TokenPoller: Send + Sync {
    async fn poll_token(&self, device_code: &str) -> std::result::Result<TokenGrant, PollError>;
}

/// Poll until a token is issued or the code's lifetime runs out
pub async fn poll_until_authorized(poller: &dyn TokenPoller, code: &DeviceCode) -> Result<TokenGrant> {
    let deadline = Instant::now() + Duration::from_secs(code.expires_in);
    let mut interval = Duration::from_secs(code.interval.max(1));

    loop {
        if Instant::now() + interval > deadline {
            return Err(PollError::ExpiredToken.into());
        }
        tokio::time::sleep(interval).await;

        match poller.poll_token(&code.device_code).await {
            Ok(grant) => {
                tracing::info!(user_id = %grant.user_id, "device authorized");
                return Ok(grant);
            }
            Err(PollError::AuthorizationPending) => continue,
            Err(PollError::SlowDown) => {
                interval += Duration::from_secs(SLOW_DOWN_STEP_SECS);
                tracing::debug!(interval_secs = interval.as_secs(), "slowing down");
            }
            Err(PollError::Transport(e)) => {
                tracing::warn!(error = %e, "token poll failed; retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// `reqwest` client for the identity endpoints under `{base}/api/v1/auth`
pub struct DeviceAuthClient {
    http: reqwest::Client,
    base_url: String,
}

impl DeviceAuthClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Request a device code
    pub async fn start(&self) -> Result<DeviceCode> {
        let url = format!("{}/api/v1/auth/device", self.base_url);
        let response = self.http.post(&url).send().await?;
        if !response.status().is_success() {
            return Err(AgentError::Auth(format!(
                "device authorization failed with status {}",
                response.status().as_u16()
            )));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl TokenPoller for DeviceAuthClient {
    async fn poll_token(&self, device_code: &str) -> std::result::Result<TokenGrant, PollError> {
        let url = format!("{}/api/v1/auth/device/token", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "device_code": device_code }))
            .send()
            .await
            .map_err(|e| PollError::Transport(e.to_string()))?;

        if response.status().is_success() {
            return response
                .json::<TokenGrant>()
                .await
                .map_err(|e| PollError::Transport(e.to_string()));
        }
        let status = response.status().as_u16();
        match response.json::<ErrorBody>().await {
            Ok(body) => Err(PollError::from_code(&body.error)),
            Err(_) => Err(PollError::Transport(format!("token endpoint returned {}", status))),
        }
    }
}
