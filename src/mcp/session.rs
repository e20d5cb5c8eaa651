//! Per-server session: one user's live connection to one MCP server.
//!
//! Negotiation tries the authenticating transport first. A 401 from it starts
//! an OAuth flow and surfaces [`McpError::AuthorizationNeeded`]; any other
//! failure is retried once over the plain transport. Tool calls that find the
//! remote session gone reconnect once and retry once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rust_mcp_schema::CallToolResult;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::auth::AuthManager;
use crate::core::config::ServerConfig;
use crate::core::error::{McpError, McpResult};
use crate::mcp::tool::{Tool, ToolResolver};
use crate::mcp::transport::{ConnectRequest, Connector, McpConnection};

/// Collaborators shared by every session of one pool generation.
#[derive(Clone)]
pub struct SessionContext {
    pub connector: Arc<dyn Connector>,
    pub auth: Arc<AuthManager>,
    pub user_id_header: String,
}

struct Live {
    connection: Arc<dyn McpConnection>,
    tools: Vec<rust_mcp_schema::Tool>,
}

pub struct ServerSession {
    user_id: String,
    server: ServerConfig,
    context: SessionContext,
    live: RwLock<Option<Live>>,
    closed: AtomicBool,
}

impl ServerSession {
    pub fn new(user_id: &str, server: ServerConfig, context: SessionContext) -> Self {
        Self {
            user_id: user_id.to_string(),
            server,
            context,
            live: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    pub async fn connect(&self) -> McpResult<()> {
        self.ensure_open()?;
        let live = self.negotiate().await?;
        let previous = self.live.write().await.replace(live);
        if let Some(previous) = previous {
            self.close_logged(&previous.connection).await;
        }
        Ok(())
    }

    /// Tool descriptors cached at connect time.
    pub async fn list_tools(&self) -> Vec<rust_mcp_schema::Tool> {
        self.live
            .read()
            .await
            .as_ref()
            .map(|live| live.tools.clone())
            .unwrap_or_default()
    }

    /// Wraps every cached descriptor in a [`Tool`] whose resolver calls back
    /// into this session.
    pub async fn tools(self: &Arc<Self>) -> Vec<Tool> {
        self.list_tools()
            .await
            .into_iter()
            .map(|descriptor| {
                let session = Arc::clone(self);
                let name = descriptor.name.clone();
                let resolver: ToolResolver = Arc::new(
                    move |arguments: Option<Map<String, Value>>| -> BoxFuture<'static, McpResult<CallToolResult>> {
                        let session = Arc::clone(&session);
                        let name = name.clone();
                        async move { session.call_tool(&name, arguments).await }.boxed()
                    },
                );
                Tool::new(self.server.name.clone(), descriptor, resolver)
            })
            .collect()
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> McpResult<CallToolResult> {
        let connection = self.connection().await?;
        match connection.call_tool(name, arguments.clone()).await {
            Err(err) if err.is_session_closed() => {
                info!(
                    user_id = %self.user_id,
                    server_id = %self.server.id(),
                    error = %err,
                    "MCP session closed; reconnecting"
                );
                let fresh = self.reconnect(&connection).await?;
                let result = fresh.call_tool(name, arguments).await;
                self.authorize_if_needed(result).await
            }
            result => self.authorize_if_needed(result).await,
        }
    }

    /// Closes the live connection. Later calls are no-ops.
    pub async fn close(&self) -> McpResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.live.write().await.take() {
            Some(live) => live.connection.close().await,
            None => Ok(()),
        }
    }

    fn ensure_open(&self) -> McpResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(McpError::SessionClosed(format!(
                "session for {} was closed",
                self.server.name
            )));
        }
        Ok(())
    }

    async fn connection(&self) -> McpResult<Arc<dyn McpConnection>> {
        self.ensure_open()?;
        if let Some(live) = self.live.read().await.as_ref() {
            return Ok(Arc::clone(&live.connection));
        }
        self.reconnect_from(None).await
    }

    async fn reconnect(&self, failed: &Arc<dyn McpConnection>) -> McpResult<Arc<dyn McpConnection>> {
        self.reconnect_from(Some(failed)).await
    }

    /// Replaces the live connection unless another caller already replaced
    /// `failed`, in which case that newer connection is returned.
    async fn reconnect_from(
        &self,
        failed: Option<&Arc<dyn McpConnection>>,
    ) -> McpResult<Arc<dyn McpConnection>> {
        let mut live = self.live.write().await;
        self.ensure_open()?;
        if let Some(current) = live.as_ref() {
            let superseded = failed.is_none_or(|failed| {
                !std::ptr::addr_eq(Arc::as_ptr(&current.connection), Arc::as_ptr(failed))
            });
            if superseded {
                return Ok(Arc::clone(&current.connection));
            }
        }

        let fresh = self.negotiate().await?;
        let connection = Arc::clone(&fresh.connection);
        if let Some(previous) = live.replace(fresh) {
            self.close_logged(&previous.connection).await;
        }
        Ok(connection)
    }

    async fn negotiate(&self) -> McpResult<Live> {
        let bearer = self
            .context
            .auth
            .access_token(&self.user_id, &self.server)
            .await?;
        let authenticated = ConnectRequest::authenticated(
            &self.user_id,
            &self.server,
            &self.context.user_id_header,
            bearer,
        );

        let connection = match self.context.connector.connect(&authenticated).await {
            Ok(connection) => connection,
            Err(McpError::Unauthorized { metadata_url }) => {
                return Err(self.authorization_needed(metadata_url.as_deref()).await);
            }
            Err(err @ McpError::Validation(_)) => return Err(err),
            Err(first) => {
                debug!(
                    user_id = %self.user_id,
                    server_id = %self.server.id(),
                    error = %first,
                    "Authenticated connect failed; trying plain transport"
                );
                let plain = ConnectRequest::plain(&self.user_id, &self.server);
                match self.context.connector.connect(&plain).await {
                    Ok(connection) => connection,
                    Err(second) => {
                        return Err(McpError::transport(format!(
                            "failed to connect to {}: {first}; plain transport also failed: {second}",
                            self.server.name
                        )));
                    }
                }
            }
        };

        let tools = match connection.list_tools().await {
            Ok(tools) => tools,
            Err(err) => {
                self.close_logged(&connection).await;
                return Err(match err {
                    McpError::Unauthorized { metadata_url } => {
                        self.authorization_needed(metadata_url.as_deref()).await
                    }
                    other => other,
                });
            }
        };
        if tools.is_empty() {
            self.close_logged(&connection).await;
            return Err(McpError::protocol(format!(
                "no tools found on MCP server {}",
                self.server.name
            )));
        }

        debug!(
            user_id = %self.user_id,
            server_id = %self.server.id(),
            tools = tools.len(),
            "MCP session ready"
        );
        Ok(Live { connection, tools })
    }

    async fn authorize_if_needed(
        &self,
        result: McpResult<CallToolResult>,
    ) -> McpResult<CallToolResult> {
        match result {
            Err(McpError::Unauthorized { metadata_url }) => {
                Err(self.authorization_needed(metadata_url.as_deref()).await)
            }
            other => other,
        }
    }

    async fn authorization_needed(&self, metadata_url: Option<&str>) -> McpError {
        self.context
            .auth
            .authorization_needed(&self.user_id, &self.server, metadata_url)
            .await
    }

    async fn close_logged(&self, connection: &Arc<dyn McpConnection>) {
        if let Err(err) = connection.close().await {
            warn!(
                user_id = %self.user_id,
                server_id = %self.server.id(),
                error = %err,
                "Failed to close MCP connection"
            );
        }
    }
}
