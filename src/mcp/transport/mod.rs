//! Transport seams between per-server sessions and the wire.
//!
//! A [`Connector`] dials one server for one user and completes the MCP
//! handshake; the resulting [`McpConnection`] lists and calls tools until it is
//! closed. Sessions only see these traits, so tests substitute in-memory fakes.

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::ServerMessage;
use rust_mcp_schema::{CallToolResult, Tool};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::core::config::ServerConfig;
use crate::core::error::McpResult;

pub mod http;
pub mod streamable_http;

pub const MCP_JSON_CONTENT_TYPE: &str = "application/json";
pub const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// JSON-RPC code used by servers to indicate unsupported methods.
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;

/// How a connection attempt presents itself to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportVariant {
    /// Identity header, static headers and bearer token; HTTP 401 becomes
    /// [`crate::core::error::McpError::Unauthorized`].
    Authenticated,
    /// Bare requests with no extra headers; 401 is an ordinary HTTP failure.
    Plain,
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub user_id: String,
    pub server: ServerConfig,
    pub user_id_header: String,
    pub bearer_token: Option<String>,
    pub variant: TransportVariant,
}

impl ConnectRequest {
    pub fn authenticated(
        user_id: &str,
        server: &ServerConfig,
        user_id_header: &str,
        bearer_token: Option<String>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            server: server.clone(),
            user_id_header: user_id_header.to_string(),
            bearer_token,
            variant: TransportVariant::Authenticated,
        }
    }

    pub fn plain(user_id: &str, server: &ServerConfig) -> Self {
        Self {
            user_id: user_id.to_string(),
            server: server.clone(),
            user_id_header: String::new(),
            bearer_token: None,
            variant: TransportVariant::Plain,
        }
    }
}

/// One live, initialized MCP session.
#[async_trait]
pub trait McpConnection: Send + Sync {
    async fn list_tools(&self) -> McpResult<Vec<Tool>>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> McpResult<CallToolResult>;

    /// Ends the remote session. Calls after the first are no-ops.
    async fn close(&self) -> McpResult<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> McpResult<Arc<dyn McpConnection>>;
}

/// Returns true when a server reports the JSON-RPC method-not-found code.
pub fn is_method_not_found(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Error(error) if error.error.code == MCP_METHOD_NOT_FOUND
    )
}
