//! OAuth endpoint discovery (RFC 9728, RFC 8414) and dynamic client
//! registration (RFC 7591).
//!
//! Every function here is a single request/response exchange with strict JSON
//! decoding; none of them touch the store.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::error::{McpError, McpResult, RegistrationError, ValidationError};

pub const PROTECTED_RESOURCE_WELL_KNOWN: &str = "/.well-known/oauth-protected-resource";
pub const AUTHORIZATION_SERVER_WELL_KNOWN: &str = "/.well-known/oauth-authorization-server";

const FALLBACK_AUTHORIZE_PATH: &str = "/authorize";
const FALLBACK_TOKEN_PATH: &str = "/token";
const FALLBACK_REGISTER_PATH: &str = "/register";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProtectedResourceMetadata {
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub authorization_servers: Vec<String>,
    #[serde(default)]
    pub scopes_supported: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthorizationServerMetadata {
    #[serde(default)]
    pub issuer: String,
    #[serde(default)]
    pub authorization_endpoint: String,
    #[serde(default)]
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Option<Vec<String>>,
    #[serde(default)]
    pub code_challenge_methods_supported: Option<Vec<String>>,
}

/// Where the orchestrator sends the user and the code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthEndpoints {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub registration_endpoint: Option<String>,
}

impl From<AuthorizationServerMetadata> for OAuthEndpoints {
    fn from(metadata: AuthorizationServerMetadata) -> Self {
        Self {
            issuer: metadata.issuer,
            authorization_endpoint: metadata.authorization_endpoint,
            token_endpoint: metadata.token_endpoint,
            registration_endpoint: metadata
                .registration_endpoint
                .filter(|endpoint| !endpoint.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientRegistrationRequest {
    pub redirect_uris: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub grant_types: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_types: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl ClientRegistrationRequest {
    /// Public client using the authorization code grant with refresh.
    pub fn public_client(redirect_uri: &str, client_name: &str) -> Self {
        Self {
            redirect_uris: vec![redirect_uri.to_string()],
            client_name: Some(client_name.to_string()),
            token_endpoint_auth_method: Some("none".to_string()),
            grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
            response_types: vec!["code".to_string()],
            scope: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientRegistrationResponse {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub client_id_issued_at: Option<i64>,
    #[serde(default)]
    pub client_secret_expires_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RegistrationErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// `scheme://host[:port]` of an absolute http(s) URL.
pub fn origin_of(url: &str) -> McpResult<String> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|err| ValidationError::InvalidUrl(format!("{url}: {err}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ValidationError::InvalidUrl(format!("{url}: unsupported scheme")).into());
    }
    let Some(host) = parsed.host_str().filter(|host| !host.is_empty()) else {
        return Err(ValidationError::InvalidUrl(format!("{url}: missing host")).into());
    };
    Ok(match parsed.port() {
        Some(port) => format!("{}://{host}:{port}", parsed.scheme()),
        None => format!("{}://{host}", parsed.scheme()),
    })
}

pub fn default_protected_resource_url(base_url: &str) -> String {
    format!(
        "{}{PROTECTED_RESOURCE_WELL_KNOWN}",
        base_url.trim_end_matches('/')
    )
}

pub async fn fetch_protected_resource_metadata(
    client: &reqwest::Client,
    url: &str,
) -> McpResult<ProtectedResourceMetadata> {
    debug!(url = %url, "Fetching protected resource metadata");
    let body = get_json_body(client, url).await?;
    let metadata: ProtectedResourceMetadata = serde_json::from_slice(&body).map_err(|err| {
        McpError::protocol(format!("invalid protected resource metadata from {url}: {err}"))
    })?;
    if metadata
        .authorization_servers
        .iter()
        .all(|server| server.trim().is_empty())
    {
        return Err(McpError::protocol(format!(
            "protected resource metadata from {url} lists no authorization_servers"
        )));
    }
    Ok(metadata)
}

pub async fn fetch_authorization_server_metadata(
    client: &reqwest::Client,
    issuer: &str,
) -> McpResult<AuthorizationServerMetadata> {
    let url = format!(
        "{}{AUTHORIZATION_SERVER_WELL_KNOWN}",
        issuer.trim_end_matches('/')
    );
    debug!(url = %url, "Fetching authorization server metadata");
    let body = get_json_body(client, &url).await?;
    let metadata: AuthorizationServerMetadata = serde_json::from_slice(&body).map_err(|err| {
        McpError::protocol(format!("invalid authorization server metadata from {url}: {err}"))
    })?;

    let missing: Vec<&str> = [
        ("issuer", &metadata.issuer),
        ("authorization_endpoint", &metadata.authorization_endpoint),
        ("token_endpoint", &metadata.token_endpoint),
    ]
    .into_iter()
    .filter(|(_, value)| value.trim().is_empty())
    .map(|(field, _)| field)
    .collect();
    if !missing.is_empty() {
        return Err(McpError::protocol(format!(
            "authorization server metadata from {url} is missing {}",
            missing.join(", ")
        )));
    }
    Ok(metadata)
}

/// Resolves the authorization and token endpoints for a resource server.
///
/// Tries protected-resource metadata first (the advertised URL, or the
/// well-known default), then the resource's own origin as an authorization
/// server, and finally assumes `/authorize`, `/token` and `/register` under
/// the origin.
pub async fn resolve_endpoints(
    client: &reqwest::Client,
    base_url: &str,
    metadata_url: Option<&str>,
) -> McpResult<OAuthEndpoints> {
    let origin = origin_of(base_url)?;
    let resource_url = metadata_url
        .map(str::to_string)
        .unwrap_or_else(|| default_protected_resource_url(base_url));

    match discover_via_protected_resource(client, &resource_url).await {
        Ok(endpoints) => return Ok(endpoints),
        Err(err) => {
            debug!(url = %resource_url, error = %err, "Protected resource discovery failed");
        }
    }

    match fetch_authorization_server_metadata(client, &origin).await {
        Ok(metadata) => return Ok(metadata.into()),
        Err(err) => {
            debug!(issuer = %origin, error = %err, "Origin authorization server discovery failed");
        }
    }

    debug!(origin = %origin, "Falling back to default OAuth endpoint paths");
    Ok(OAuthEndpoints {
        issuer: origin.clone(),
        authorization_endpoint: format!("{origin}{FALLBACK_AUTHORIZE_PATH}"),
        token_endpoint: format!("{origin}{FALLBACK_TOKEN_PATH}"),
        registration_endpoint: Some(format!("{origin}{FALLBACK_REGISTER_PATH}")),
    })
}

async fn discover_via_protected_resource(
    client: &reqwest::Client,
    resource_url: &str,
) -> McpResult<OAuthEndpoints> {
    let resource = fetch_protected_resource_metadata(client, resource_url).await?;
    let mut last_error = None;
    for issuer in resource
        .authorization_servers
        .iter()
        .filter(|server| !server.trim().is_empty())
    {
        match fetch_authorization_server_metadata(client, issuer).await {
            Ok(metadata) => return Ok(metadata.into()),
            Err(err) => last_error = Some(err),
        }
    }
    Err(last_error
        .unwrap_or_else(|| McpError::protocol("no usable authorization server advertised")))
}

pub async fn register_client(
    client: &reqwest::Client,
    registration_endpoint: &str,
    request: &ClientRegistrationRequest,
) -> McpResult<ClientRegistrationResponse> {
    if request.redirect_uris.is_empty() {
        return Err(ValidationError::MissingRedirectUris.into());
    }
    for uri in &request.redirect_uris {
        reqwest::Url::parse(uri)
            .map_err(|err| ValidationError::InvalidUrl(format!("redirect URI {uri}: {err}")))?;
    }

    debug!(url = %registration_endpoint, "Registering OAuth client");
    let response = client
        .post(registration_endpoint)
        .json(request)
        .send()
        .await?;
    let status = response.status();
    let body = response.bytes().await?;

    if status != reqwest::StatusCode::CREATED {
        let parsed = serde_json::from_slice::<RegistrationErrorBody>(&body).ok();
        let (error, error_description) = match parsed {
            Some(RegistrationErrorBody {
                error: Some(error),
                error_description,
            }) => (error, error_description),
            _ => (
                "unexpected_response".to_string(),
                Some(String::from_utf8_lossy(&body).trim().to_string())
                    .filter(|text| !text.is_empty()),
            ),
        };
        return Err(RegistrationError {
            status: status.as_u16(),
            error,
            error_description,
        }
        .into());
    }

    let registration: ClientRegistrationResponse = serde_json::from_slice(&body)
        .map_err(|err| McpError::protocol(format!("invalid registration response: {err}")))?;
    if registration.client_id.trim().is_empty() {
        return Err(McpError::protocol("registration response is missing client_id"));
    }
    Ok(registration)
}

async fn get_json_body(client: &reqwest::Client, url: &str) -> McpResult<Vec<u8>> {
    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(McpError::protocol(format!("GET {url} returned {status}")));
    }
    Ok(response.bytes().await?.to_vec())
}
