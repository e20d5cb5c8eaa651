use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use rust_mcp_schema::CallToolResult;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::core::config::ServerConfig;
use crate::core::error::{ErrorKind, McpError, McpResult};
use crate::mcp::session::{ServerSession, SessionContext};
use crate::mcp::tool::Tool;

const MCP_CONNECT_CONCURRENCY_LIMIT: usize = 3;

/// A server the user must authorize before its tools become available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolAuthError {
    pub server_name: String,
    pub auth_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub server_name: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Per-server failures from one connect pass, split by what the caller can do
/// about them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionErrors {
    pub auth_errors: Vec<ToolAuthError>,
    pub errors: Vec<ServerError>,
}

impl ConnectionErrors {
    pub fn is_empty(&self) -> bool {
        self.auth_errors.is_empty() && self.errors.is_empty()
    }

    fn record(&mut self, server_name: &str, err: McpError) {
        match err {
            McpError::AuthorizationNeeded {
                server_name,
                auth_url,
            } => self.auth_errors.push(ToolAuthError {
                server_name,
                auth_url,
            }),
            other => self.errors.push(ServerError {
                server_name: server_name.to_string(),
                kind: other.kind(),
                message: other.to_string(),
            }),
        }
    }

    fn sort(&mut self) {
        self.auth_errors
            .sort_by(|a, b| a.server_name.cmp(&b.server_name));
        self.errors.sort_by(|a, b| a.server_name.cmp(&b.server_name));
    }
}

impl fmt::Display for ConnectionErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for auth in &self.auth_errors {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(f, "{} requires authorization: {}", auth.server_name, auth.auth_url)?;
        }
        for error in &self.errors {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(f, "{}: {}", error.server_name, error.message)?;
        }
        Ok(())
    }
}

/// Every server session for one user, plus the errors from connecting them.
pub struct UserSessionSet {
    user_id: String,
    sessions: BTreeMap<String, Arc<ServerSession>>,
    tool_owners: HashMap<String, String>,
    errors: Option<ConnectionErrors>,
    authorizations_expire_at: Option<DateTime<Utc>>,
    closed: AtomicBool,
}

impl UserSessionSet {
    /// Connects to every enabled server with a URL. Failures are collected,
    /// never returned: whatever connected is usable.
    pub async fn connect_all(
        user_id: &str,
        servers: &[ServerConfig],
        context: &SessionContext,
    ) -> Self {
        let connectable: Vec<&ServerConfig> = servers
            .iter()
            .filter(|server| {
                if !server.enabled {
                    return false;
                }
                if server.base_url.trim().is_empty() {
                    warn!(
                        user_id = %user_id,
                        server_id = %server.id(),
                        "Skipping MCP server without base_url"
                    );
                    return false;
                }
                true
            })
            .collect();

        let authorization_deadline = context.auth.pending_authorization_deadline();
        let results = stream::iter(connectable)
            .map(|server| {
                let session = Arc::new(ServerSession::new(user_id, server.clone(), context.clone()));
                async move {
                    let result = session.connect().await;
                    (session, result)
                }
            })
            .buffer_unordered(MCP_CONNECT_CONCURRENCY_LIMIT)
            .collect::<Vec<_>>()
            .await;

        let mut sessions = BTreeMap::new();
        let mut errors = ConnectionErrors::default();
        for (session, result) in results {
            let server_name = session.server().name.clone();
            match result {
                Ok(()) => {
                    sessions.insert(server_name, session);
                }
                Err(err) => {
                    if err.kind() == ErrorKind::AuthorizationNeeded {
                        info!(
                            user_id = %user_id,
                            server_id = %server_name,
                            "MCP server awaiting user authorization"
                        );
                    } else {
                        warn!(
                            user_id = %user_id,
                            server_id = %server_name,
                            error = %err,
                            "Failed to connect to MCP server"
                        );
                    }
                    errors.record(&server_name, err);
                }
            }
        }
        errors.sort();

        let tool_owners = index_tools(user_id, &sessions).await;
        Self {
            user_id: user_id.to_string(),
            sessions,
            tool_owners,
            authorizations_expire_at: (!errors.auth_errors.is_empty())
                .then_some(authorization_deadline),
            errors: (!errors.is_empty()).then_some(errors),
            closed: AtomicBool::new(false),
        }
    }

    /// Errors from the connect pass; they stay until the set is dropped.
    pub fn errors(&self) -> Option<&ConnectionErrors> {
        self.errors.as_ref()
    }

    /// Whether the authorization URLs in [`Self::errors`] can no longer be
    /// completed.
    pub fn authorizations_expired(&self, now: DateTime<Utc>) -> bool {
        self.authorizations_expire_at
            .is_some_and(|deadline| deadline <= now)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tools from every connected server. A name advertised by more than one
    /// server resolves to the server whose name sorts first.
    pub async fn tools(&self) -> Vec<Tool> {
        let mut tools = Vec::new();
        for (server_name, session) in &self.sessions {
            tools.extend(
                session
                    .tools()
                    .await
                    .into_iter()
                    .filter(|tool| self.tool_owners.get(tool.name()) == Some(server_name)),
            );
        }
        tools
    }

    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> McpResult<CallToolResult> {
        let session = self
            .tool_owners
            .get(tool_name)
            .and_then(|server_name| self.sessions.get(server_name))
            .ok_or_else(|| {
                McpError::protocol(format!(
                    "no connected MCP server provides tool {tool_name}"
                ))
            })?;
        session.call_tool(tool_name, arguments).await
    }

    /// Closes every server session. Only the first call does any work.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for (server_name, session) in &self.sessions {
            if let Err(err) = session.close().await {
                warn!(
                    user_id = %self.user_id,
                    server_id = %server_name,
                    error = %err,
                    "Failed to close MCP session"
                );
            }
        }
    }
}

async fn index_tools(
    user_id: &str,
    sessions: &BTreeMap<String, Arc<ServerSession>>,
) -> HashMap<String, String> {
    let mut owners: HashMap<String, String> = HashMap::new();
    for (server_name, session) in sessions {
        for tool in session.list_tools().await {
            match owners.get(&tool.name) {
                Some(owner) => warn!(
                    user_id = %user_id,
                    tool = %tool.name,
                    kept = %owner,
                    dropped = %server_name,
                    "Duplicate MCP tool name; keeping first server"
                ),
                None => {
                    owners.insert(tool.name, server_name.clone());
                }
            }
        }
    }
    owners
}
