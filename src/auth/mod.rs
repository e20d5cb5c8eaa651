//! OAuth 2.0 authorization-code + PKCE orchestration for remote MCP servers.
//!
//! [`AuthManager::initiate`] persists a pending [`OAuthSession`] and hands back
//! the URL the end user must visit; [`AuthManager::process_callback`] consumes
//! that session exactly once and stores the resulting token for the user.

pub mod discovery;
pub mod pkce;
pub mod store;
pub mod token;
pub mod www_authenticate;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::config::{OAuthConfig, ServerConfig};
use crate::core::error::{McpError, McpResult, ValidationError};
use crate::core::store::KvStore;

use self::discovery::{resolve_endpoints, ClientRegistrationRequest, OAuthEndpoints};
use self::pkce::{generate_code_verifier, generate_state, pkce_s256_challenge, CODE_CHALLENGE_METHOD};
use self::store::{ClientCredentials, CredentialStore, OAuthSession};
use self::token::{exchange_code, refresh_access_token, CodeExchange, OAuthToken};

pub struct AuthorizationUrlParams<'a> {
    pub authorization_endpoint: &'a str,
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub state: &'a str,
    pub code_challenge: &'a str,
    pub scope: Option<&'a str>,
    pub resource: Option<&'a str>,
}

pub fn build_authorization_url(params: AuthorizationUrlParams<'_>) -> McpResult<reqwest::Url> {
    let mut url = reqwest::Url::parse(params.authorization_endpoint).map_err(|err| {
        ValidationError::InvalidUrl(format!("{}: {err}", params.authorization_endpoint))
    })?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("response_type", "code");
        query.append_pair("client_id", params.client_id);
        query.append_pair("redirect_uri", params.redirect_uri);
        query.append_pair("state", params.state);
        query.append_pair("code_challenge", params.code_challenge);
        query.append_pair("code_challenge_method", CODE_CHALLENGE_METHOD);
        if let Some(scope) = params.scope.filter(|value| !value.trim().is_empty()) {
            query.append_pair("scope", scope);
        }
        if let Some(resource) = params.resource {
            query.append_pair("resource", resource);
        }
    }
    Ok(url)
}

pub struct AuthManager {
    http: reqwest::Client,
    store: CredentialStore,
    oauth: OAuthConfig,
    clock: Arc<dyn Clock>,
}

impl AuthManager {
    pub fn new(
        oauth: OAuthConfig,
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            http,
            store: CredentialStore::new(kv),
            oauth,
            clock,
        }
    }

    pub fn credential_store(&self) -> &CredentialStore {
        &self.store
    }

    /// When a flow initiated now stops being completable.
    pub fn pending_authorization_deadline(&self) -> DateTime<Utc> {
        self.clock
            .now()
            .checked_add_signed(self.oauth.session_ttl())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Starts a flow for `user_id` against `server` and returns the URL the
    /// user must open. Nothing is persisted unless every step succeeds.
    pub async fn initiate(
        &self,
        user_id: &str,
        server: &ServerConfig,
        metadata_url: Option<&str>,
    ) -> McpResult<String> {
        let code_verifier = generate_code_verifier()?;
        let state = generate_state()?;

        let endpoints = resolve_endpoints(&self.http, &server.base_url, metadata_url).await?;
        let credentials = self
            .get_or_register_client(&endpoints, &server.base_url)
            .await?;

        let scope = self.oauth.scope();
        let url = build_authorization_url(AuthorizationUrlParams {
            authorization_endpoint: &endpoints.authorization_endpoint,
            client_id: &credentials.client_id,
            redirect_uri: &self.oauth.redirect_uri,
            state: &state,
            code_challenge: &pkce_s256_challenge(&code_verifier),
            scope: scope.as_deref(),
            resource: Some(&server.base_url),
        })?;

        let session = OAuthSession {
            user_id: user_id.to_string(),
            server_id: server.id().to_string(),
            server_url: server.base_url.clone(),
            server_metadata_url: metadata_url.map(str::to_string),
            code_verifier,
            state,
            created_at: self.clock.now(),
        };
        self.store.save_session(&session).await?;

        info!(
            user_id = %user_id,
            server_id = %server.id(),
            "OAuth authorization required"
        );
        Ok(url.to_string())
    }

    /// Runs [`Self::initiate`] and wraps the URL in the error callers surface
    /// to the end user.
    pub async fn authorization_needed(
        &self,
        user_id: &str,
        server: &ServerConfig,
        metadata_url: Option<&str>,
    ) -> McpError {
        match self.initiate(user_id, server, metadata_url).await {
            Ok(auth_url) => McpError::AuthorizationNeeded {
                server_name: server.name.clone(),
                auth_url,
            },
            Err(err) => err,
        }
    }

    pub async fn process_callback(
        &self,
        user_id: &str,
        state: &str,
        code: &str,
    ) -> McpResult<OAuthSession> {
        let session = self
            .store
            .session(user_id, state)
            .await?
            .ok_or(ValidationError::SessionNotFound)?;

        if session.state != state {
            return Err(ValidationError::StateMismatch {
                expected: session.state,
                actual: state.to_string(),
            }
            .into());
        }
        if session.user_id != user_id {
            return Err(ValidationError::UserMismatch {
                session_user: session.user_id,
                calling_user: user_id.to_string(),
            }
            .into());
        }
        if self.is_expired(&session) {
            self.delete_session_logged(user_id, state).await;
            return Err(ValidationError::SessionExpired.into());
        }

        let endpoints = resolve_endpoints(
            &self.http,
            &session.server_url,
            session.server_metadata_url.as_deref(),
        )
        .await?;
        let credentials = self
            .get_or_register_client(&endpoints, &session.server_url)
            .await?;

        let response = exchange_code(
            &self.http,
            CodeExchange {
                token_endpoint: &endpoints.token_endpoint,
                credentials: &credentials,
                redirect_uri: &self.oauth.redirect_uri,
                code,
                code_verifier: &session.code_verifier,
                resource: Some(&session.server_url),
            },
        )
        .await?;
        let token = OAuthToken::from_response(
            response,
            &endpoints.token_endpoint,
            &credentials.client_id,
            self.clock.now(),
        );
        self.store
            .save_token(user_id, &session.server_id, &token)
            .await?;
        info!(
            user_id = %user_id,
            server_id = %session.server_id,
            "OAuth authorization completed"
        );

        self.delete_session_logged(user_id, state).await;
        Ok(session)
    }

    /// Deletes the session if it outlived the configured TTL. Returns whether
    /// a session was removed.
    pub async fn purge_expired_session(&self, user_id: &str, state: &str) -> McpResult<bool> {
        match self.store.session(user_id, state).await? {
            Some(session) if self.is_expired(&session) => {
                self.store.delete_session(user_id, state).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// The bearer token to present to `server`, refreshed first when it is
    /// about to expire. A token whose refresh fails is dropped so the next
    /// 401 starts a fresh authorization.
    pub async fn access_token(
        &self,
        user_id: &str,
        server: &ServerConfig,
    ) -> McpResult<Option<String>> {
        let Some(token) = self.store.token(user_id, server.id()).await? else {
            return Ok(None);
        };
        let now = self.clock.now();
        if !token.needs_refresh(now) || !token.can_refresh() {
            return Ok(Some(token.access_token));
        }

        let credentials = self.store.client_credentials(&server.base_url).await?;
        match refresh_access_token(
            &self.http,
            &token,
            credentials.as_ref(),
            Some(&server.base_url),
        )
        .await
        {
            Ok(response) => {
                let refreshed = token.refreshed(response, now);
                self.store
                    .save_token(user_id, server.id(), &refreshed)
                    .await?;
                debug!(user_id = %user_id, server_id = %server.id(), "Refreshed OAuth token");
                Ok(Some(refreshed.access_token))
            }
            Err(err) => {
                warn!(
                    user_id = %user_id,
                    server_id = %server.id(),
                    error = %err,
                    "OAuth refresh failed; discarding stored token"
                );
                self.store.delete_token(user_id, server.id()).await?;
                Ok(None)
            }
        }
    }

    async fn get_or_register_client(
        &self,
        endpoints: &OAuthEndpoints,
        server_url: &str,
    ) -> McpResult<ClientCredentials> {
        if let Some(credentials) = self.store.client_credentials(server_url).await? {
            if !credentials.client_id.trim().is_empty() {
                return Ok(credentials);
            }
        }

        let registration_endpoint = endpoints.registration_endpoint.as_deref().ok_or_else(|| {
            McpError::protocol(format!(
                "authorization server {} offers no registration endpoint",
                endpoints.issuer
            ))
        })?;
        let mut request =
            ClientRegistrationRequest::public_client(&self.oauth.redirect_uri, &self.oauth.client_name);
        request.redirect_uris.retain(|uri| !uri.trim().is_empty());
        request.scope = self.oauth.scope();

        let registration =
            discovery::register_client(&self.http, registration_endpoint, &request).await?;
        let credentials = ClientCredentials {
            client_id: registration.client_id,
            client_secret: registration.client_secret,
            server_url: server_url.to_string(),
            created_at: self.clock.now(),
        };
        // Concurrent registrations race here; the last writer wins.
        self.store.save_client_credentials(&credentials).await?;
        debug!(url = %server_url, "Registered OAuth client");
        Ok(credentials)
    }

    fn is_expired(&self, session: &OAuthSession) -> bool {
        session
            .created_at
            .checked_add_signed(self.oauth.session_ttl())
            .is_some_and(|deadline| deadline <= self.clock.now())
    }

    async fn delete_session_logged(&self, user_id: &str, state: &str) {
        if let Err(err) = self.store.delete_session(user_id, state).await {
            warn!(user_id = %user_id, error = %err, "Failed to delete OAuth session");
        }
    }
}
