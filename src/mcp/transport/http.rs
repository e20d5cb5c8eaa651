//! The authenticating HTTP transport.
//!
//! Decorates a shared `reqwest::Client` with the per-user identity header, the
//! server's static headers and the user's bearer token, and turns HTTP 401
//! into [`McpError::Unauthorized`] carrying the advertised metadata URL.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::debug;

use super::{
    ConnectRequest, TransportVariant, MCP_JSON_AND_SSE_ACCEPT, MCP_JSON_CONTENT_TYPE,
    MCP_PROTOCOL_VERSION_HEADER,
};
use crate::auth::www_authenticate::parse_resource_metadata_url;
use crate::core::error::{McpError, McpResult, ValidationError};

#[derive(Debug, Clone)]
pub struct AuthenticatingTransport {
    client: reqwest::Client,
    headers: HeaderMap,
    variant: TransportVariant,
}

impl AuthenticatingTransport {
    pub fn new(client: reqwest::Client, request: &ConnectRequest) -> McpResult<Self> {
        let mut headers = HeaderMap::new();
        if request.variant == TransportVariant::Authenticated {
            if !request.user_id_header.trim().is_empty() {
                insert_header(&mut headers, &request.user_id_header, &request.user_id)?;
            }
            for (name, value) in &request.server.headers {
                insert_header(&mut headers, name, value)?;
            }
            if let Some(token) = request
                .bearer_token
                .as_deref()
                .filter(|token| !token.trim().is_empty())
            {
                let value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|err| McpError::Config(format!("invalid bearer token: {err}")))?;
                headers.insert(AUTHORIZATION, value);
            }
        }
        Ok(Self {
            client,
            headers,
            variant: request.variant,
        })
    }

    pub fn post(&self, url: &str, protocol_version: Option<&str>) -> RequestBuilder {
        let request = self
            .client
            .post(url)
            .headers(self.headers.clone())
            .header(reqwest::header::CONTENT_TYPE, MCP_JSON_CONTENT_TYPE)
            .header(reqwest::header::ACCEPT, MCP_JSON_AND_SSE_ACCEPT);
        with_protocol_version(request, protocol_version)
    }

    pub fn delete(&self, url: &str, protocol_version: Option<&str>) -> RequestBuilder {
        let request = self.client.delete(url).headers(self.headers.clone());
        with_protocol_version(request, protocol_version)
    }

    /// Sends the request. Only an authenticated transport intercepts 401;
    /// every other status is returned for the caller to judge.
    pub async fn send(&self, request: RequestBuilder) -> McpResult<Response> {
        let response = request.send().await?;
        if response.status() == StatusCode::UNAUTHORIZED
            && self.variant == TransportVariant::Authenticated
        {
            return Err(unauthorized_from(&response)?);
        }
        Ok(response)
    }
}

fn unauthorized_from(response: &Response) -> McpResult<McpError> {
    let Some(header) = response.headers().get(WWW_AUTHENTICATE) else {
        debug!(url = %response.url(), "401 without WWW-Authenticate");
        return Ok(McpError::Unauthorized { metadata_url: None });
    };
    let header = header.to_str().map_err(|_| {
        ValidationError::MalformedWwwAuthenticate(
            "header is not visible ASCII".to_string(),
        )
    })?;
    let metadata_url = parse_resource_metadata_url(header)?;
    debug!(
        url = %response.url(),
        metadata_url = ?metadata_url,
        "MCP server requires authorization"
    );
    Ok(McpError::Unauthorized { metadata_url })
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> McpResult<()> {
    let name = HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|err| McpError::Config(format!("invalid header name {name}: {err}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|err| McpError::Config(format!("invalid value for header {name}: {err}")))?;
    headers.insert(name, value);
    Ok(())
}

fn with_protocol_version(request: RequestBuilder, protocol_version: Option<&str>) -> RequestBuilder {
    match protocol_version {
        Some(protocol_version) if !protocol_version.trim().is_empty() => {
            request.header(MCP_PROTOCOL_VERSION_HEADER, protocol_version)
        }
        _ => request,
    }
}
