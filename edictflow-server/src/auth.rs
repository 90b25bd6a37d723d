//! Bearer credential authentication
//!
//! Both the session handshake and the HTTP API authenticate with
//! `Authorization: Bearer <token>`. A token resolves to the user it was
//! issued to and, for agent credentials, the agent id it binds.

use std::collections::HashMap;
use std::path::Path;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};

/// Who a bearer credential belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    /// Bound agent; absent for operator credentials
    #[serde(default)]
    pub agent_id: Option<String>,
}

impl Identity {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            agent_id: None,
        }
    }

    pub fn agent(user_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            agent_id: Some(agent_id.into()),
        }
    }
}

/// Resolves bearer tokens to identities
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<Identity>;
}

/// Fixed token table, loaded from JSON `{ "<token>": { "user_id": ..., "agent_id": ... } }`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct StaticTokens {
    tokens: HashMap<String, Identity>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            ServerError::Config(format!("invalid token file {}: {}", path.display(), e))
        })
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).cloned()
    }
}

/// The bearer token from an `Authorization` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then_some(token)
}

/// Authenticate a request by its headers
pub fn identify(auth: &dyn Authenticator, headers: &HeaderMap) -> Result<Identity> {
    bearer_token(headers)
        .and_then(|token| auth.authenticate(token))
        .ok_or(ServerError::Unauthorized)
}
