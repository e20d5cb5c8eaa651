//! Error taxonomy shared by the pool, the per-server sessions and the OAuth
//! orchestrator.
//!
//! Callers branch on [`McpError::kind`] rather than on message text.

use thiserror::Error;

pub type McpResult<T> = Result<T, McpError>;

/// Broad classification used by callers to decide how to surface a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The end user must visit a URL before the server can be used.
    AuthorizationNeeded,
    /// Malformed metadata, missing fields, rejected registration.
    Protocol,
    /// Network failure or a closed remote session.
    Transport,
    /// Forged or stale input; never retried.
    Validation,
    /// The key-value collaborator failed.
    Storage,
    /// Invalid or missing configuration.
    Config,
}

#[derive(Debug, Error)]
pub enum McpError {
    #[error("authorization required for MCP server {server_name}: {auth_url}")]
    AuthorizationNeeded {
        server_name: String,
        auth_url: String,
    },

    /// Raised by the authenticating transport on HTTP 401. Per-server sessions
    /// turn it into [`McpError::AuthorizationNeeded`].
    #[error("MCP server responded 401 Unauthorized")]
    Unauthorized { metadata_url: Option<String> },

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("MCP transport error: {0}")]
    Transport(String),

    #[error("MCP session closed: {0}")]
    SessionClosed(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("MCP client pool has been shut down")]
    PoolShutdown,
}

impl McpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            McpError::AuthorizationNeeded { .. } | McpError::Unauthorized { .. } => {
                ErrorKind::AuthorizationNeeded
            }
            McpError::Protocol(_) | McpError::Registration(_) => ErrorKind::Protocol,
            McpError::Transport(_) | McpError::SessionClosed(_) => ErrorKind::Transport,
            McpError::Validation(_) => ErrorKind::Validation,
            McpError::Storage(_) => ErrorKind::Storage,
            McpError::Config(_) | McpError::PoolShutdown => ErrorKind::Config,
        }
    }

    /// True when the remote session is gone and a full reconnect may help.
    pub fn is_session_closed(&self) -> bool {
        matches!(self, McpError::SessionClosed(_))
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        McpError::Protocol(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        McpError::Transport(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        McpError::Storage(message.into())
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        McpError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::Protocol(err.to_string())
    }
}

/// Input that was rejected outright: these indicate an attack, a stale
/// callback, or a misbehaving server.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("OAuth state mismatch: expected {expected}, got {actual}")]
    StateMismatch { expected: String, actual: String },

    #[error("OAuth session belongs to user {session_user}, but callback came from user {calling_user}")]
    UserMismatch {
        session_user: String,
        calling_user: String,
    },

    #[error("OAuth session not found")]
    SessionNotFound,

    #[error("OAuth session expired")]
    SessionExpired,

    #[error("malformed WWW-Authenticate header: {0}")]
    MalformedWwwAuthenticate(String),

    #[error("WWW-Authenticate header too long ({len} bytes)")]
    HeaderTooLong { len: usize },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("client registration requires at least one redirect URI")]
    MissingRedirectUris,
}

/// Structured RFC 7591 registration failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("client registration failed ({status}): {error}{}", format_description(.error_description))]
pub struct RegistrationError {
    pub status: u16,
    pub error: String,
    pub error_description: Option<String>,
}

fn format_description(description: &Option<String>) -> String {
    match description {
        Some(description) if !description.trim().is_empty() => format!(" - {description}"),
        _ => String::new(),
    }
}
