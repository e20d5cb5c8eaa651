//! Credential and session persistence on top of the host's [`KvStore`].
//!
//! Values are JSON. Client credentials are shared by every user of a server
//! URL; sessions and tokens are private to one user.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::auth::token::OAuthToken;
use crate::core::error::{McpError, McpResult};
use crate::core::store::KvStore;

const CLIENT_KEY_PREFIX: &str = "mcp_oauth_client_v1_";
const TOKEN_KEY_PREFIX: &str = "mcp_oauth_token_v1_";
const SESSION_KEY_PREFIX: &str = "oauth_session_";

/// Hex characters of the URL digest kept in the credentials key.
const CLIENT_KEY_HASH_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCredentials {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub server_url: String,
    pub created_at: DateTime<Utc>,
}

/// A pending authorization, consumed by exactly one matching callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthSession {
    pub user_id: String,
    pub server_id: String,
    pub server_url: String,
    #[serde(default)]
    pub server_metadata_url: Option<String>,
    pub code_verifier: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
}

pub fn client_credentials_key(server_url: &str) -> String {
    let digest = hex::encode(Sha256::digest(server_url.as_bytes()));
    format!("{CLIENT_KEY_PREFIX}{}", &digest[..CLIENT_KEY_HASH_LEN])
}

pub fn session_key(user_id: &str, state: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{user_id}_{state}")
}

pub fn token_key(user_id: &str, server_id: &str) -> String {
    format!("{TOKEN_KEY_PREFIX}{user_id}_{server_id}")
}

/// Typed access to the three record kinds.
#[derive(Clone)]
pub struct CredentialStore {
    kv: Arc<dyn KvStore>,
}

impl CredentialStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn client_credentials(&self, server_url: &str) -> McpResult<Option<ClientCredentials>> {
        self.get_json(&client_credentials_key(server_url)).await
    }

    pub async fn save_client_credentials(&self, credentials: &ClientCredentials) -> McpResult<()> {
        self.set_json(&client_credentials_key(&credentials.server_url), credentials)
            .await
    }

    pub async fn session(&self, user_id: &str, state: &str) -> McpResult<Option<OAuthSession>> {
        self.get_json(&session_key(user_id, state)).await
    }

    pub async fn save_session(&self, session: &OAuthSession) -> McpResult<()> {
        self.set_json(&session_key(&session.user_id, &session.state), session)
            .await
    }

    pub async fn delete_session(&self, user_id: &str, state: &str) -> McpResult<()> {
        self.kv.delete(&session_key(user_id, state)).await
    }

    pub async fn token(&self, user_id: &str, server_id: &str) -> McpResult<Option<OAuthToken>> {
        self.get_json(&token_key(user_id, server_id)).await
    }

    pub async fn save_token(&self, user_id: &str, server_id: &str, token: &OAuthToken) -> McpResult<()> {
        self.set_json(&token_key(user_id, server_id), token).await
    }

    pub async fn delete_token(&self, user_id: &str, server_id: &str) -> McpResult<()> {
        self.kv.delete(&token_key(user_id, server_id)).await
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> McpResult<Option<T>> {
        let Some(bytes) = self.kv.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| McpError::storage(format!("corrupt record {key}: {err}")))
    }

    async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> McpResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|err| McpError::storage(format!("failed to encode {key}: {err}")))?;
        self.kv.set(key, &bytes).await
    }
}
