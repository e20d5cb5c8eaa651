use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::store::ClientCredentials;
use crate::core::error::{McpError, McpResult};

pub const REFRESH_SAFETY_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// A user's grant for one server, persisted under
/// `mcp_oauth_token_v1_{user}_{server}`. Remembers the token endpoint so a
/// refresh needs no rediscovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub token_endpoint: String,
    pub client_id: String,
}

impl OAuthToken {
    pub fn from_response(
        response: OAuthTokenResponse,
        token_endpoint: &str,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            token_type: response.token_type,
            scope: response.scope,
            expires_at: expiry(response.expires_in, now),
            token_endpoint: token_endpoint.to_string(),
            client_id: client_id.to_string(),
        }
    }

    /// Servers may omit fields on refresh; keep what we already had.
    pub fn refreshed(&self, response: OAuthTokenResponse, now: DateTime<Utc>) -> Self {
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or_else(|| self.refresh_token.clone()),
            token_type: response.token_type.or_else(|| self.token_type.clone()),
            scope: response.scope.or_else(|| self.scope.clone()),
            expires_at: expiry(response.expires_in, now),
            token_endpoint: self.token_endpoint.clone(),
            client_id: self.client_id.clone(),
        }
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + Duration::seconds(REFRESH_SAFETY_WINDOW_SECS),
            None => false,
        }
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token
            .as_deref()
            .is_some_and(|token| !token.trim().is_empty())
            && !self.token_endpoint.trim().is_empty()
    }
}

fn expiry(expires_in: Option<i64>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    expires_in
        .filter(|seconds| *seconds > 0)
        .and_then(|seconds| now.checked_add_signed(Duration::seconds(seconds)))
}

pub struct CodeExchange<'a> {
    pub token_endpoint: &'a str,
    pub credentials: &'a ClientCredentials,
    pub redirect_uri: &'a str,
    pub code: &'a str,
    pub code_verifier: &'a str,
    pub resource: Option<&'a str>,
}

pub async fn exchange_code(
    client: &reqwest::Client,
    exchange: CodeExchange<'_>,
) -> McpResult<OAuthTokenResponse> {
    let mut form_fields = vec![
        ("grant_type", "authorization_code"),
        ("redirect_uri", exchange.redirect_uri),
        ("code", exchange.code),
        ("code_verifier", exchange.code_verifier),
    ];
    push_client_auth(&mut form_fields, exchange.credentials);
    if let Some(resource) = exchange.resource {
        form_fields.push(("resource", resource));
    }

    debug!(url = %exchange.token_endpoint, "Exchanging OAuth authorization code");
    post_token_form(client, exchange.token_endpoint, &form_fields, "token exchange").await
}

pub async fn refresh_access_token(
    client: &reqwest::Client,
    token: &OAuthToken,
    credentials: Option<&ClientCredentials>,
    resource: Option<&str>,
) -> McpResult<OAuthTokenResponse> {
    let refresh_token = token
        .refresh_token
        .as_deref()
        .ok_or_else(|| McpError::protocol("OAuth token has no refresh token; re-auth required"))?;

    let mut form_fields = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ];
    match credentials {
        Some(credentials) => push_client_auth(&mut form_fields, credentials),
        None if !token.client_id.trim().is_empty() => {
            form_fields.push(("client_id", token.client_id.as_str()))
        }
        None => {}
    }
    if let Some(resource) = resource {
        form_fields.push(("resource", resource));
    }

    debug!(url = %token.token_endpoint, "Refreshing OAuth access token");
    post_token_form(client, &token.token_endpoint, &form_fields, "refresh").await
}

fn push_client_auth<'a>(form_fields: &mut Vec<(&'a str, &'a str)>, credentials: &'a ClientCredentials) {
    if !credentials.client_id.trim().is_empty() {
        form_fields.push(("client_id", credentials.client_id.as_str()));
    }
    if let Some(secret) = credentials
        .client_secret
        .as_deref()
        .filter(|secret| !secret.is_empty())
    {
        form_fields.push(("client_secret", secret));
    }
}

async fn post_token_form(
    client: &reqwest::Client,
    token_endpoint: &str,
    form_fields: &[(&str, &str)],
    operation: &str,
) -> McpResult<OAuthTokenResponse> {
    let response = client.post(token_endpoint).form(form_fields).send().await?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(McpError::protocol(format!(
            "OAuth {operation} failed ({status}): {text}"
        )));
    }
    let body = response.bytes().await?;
    serde_json::from_slice::<OAuthTokenResponse>(&body)
        .map_err(|err| McpError::protocol(format!("invalid OAuth {operation} response: {err}")))
}
