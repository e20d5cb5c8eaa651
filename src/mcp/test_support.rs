//! In-memory fakes for the connection seams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rust_mcp_schema::{CallToolResult, TextContent, ToolInputSchema};
use serde_json::{Map, Value};

use crate::auth::store::ClientCredentials;
use crate::auth::AuthManager;
use crate::core::clock::ManualClock;
use crate::core::config::{OAuthConfig, PoolConfig, ServerConfig};
use crate::core::error::{McpError, McpResult};
use crate::core::store::MemoryStore;
use crate::mcp::session::{ServerSession, SessionContext};
use crate::mcp::transport::{ConnectRequest, Connector, McpConnection, TransportVariant};

/// Nothing listens here, so OAuth discovery fails fast and falls back to
/// default endpoint paths.
pub(crate) const UNREACHABLE: &str = "http://127.0.0.1:9";
pub(crate) const REDIRECT_URI: &str = "https://chat.example.com/oauth/callback";

#[derive(Debug, Clone)]
pub(crate) enum Behaviour {
    Tools(Vec<&'static str>),
    Unauthorized,
    Fail,
    PlainOnly(Vec<&'static str>),
}

impl Behaviour {
    pub(crate) fn tools(names: &[&'static str]) -> Self {
        Behaviour::Tools(names.to_vec())
    }
}

pub(crate) fn descriptor(name: &str) -> rust_mcp_schema::Tool {
    rust_mcp_schema::Tool {
        annotations: None,
        description: Some(format!("{name} tool")),
        execution: None,
        icons: Vec::new(),
        input_schema: ToolInputSchema::new(Vec::new(), None, None),
        meta: None,
        name: name.to_string(),
        output_schema: None,
        title: None,
    }
}

pub(crate) fn text_of(result: &CallToolResult) -> String {
    let value = serde_json::to_value(result).expect("serializes");
    value["content"][0]["text"]
        .as_str()
        .expect("text content")
        .to_string()
}

#[derive(Debug)]
pub(crate) struct FakeConnection {
    pub server: String,
    pub variant: TransportVariant,
    tools: Vec<&'static str>,
    expired: AtomicBool,
    close_calls: AtomicUsize,
    calls: AtomicUsize,
}

impl FakeConnection {
    /// Makes every later tool call fail as if the server dropped the session.
    pub(crate) fn expire(&self) {
        self.expired.store(true, Ordering::SeqCst);
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl McpConnection for FakeConnection {
    async fn list_tools(&self) -> McpResult<Vec<rust_mcp_schema::Tool>> {
        Ok(self.tools.iter().map(|name| descriptor(name)).collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        _arguments: Option<Map<String, Value>>,
    ) -> McpResult<CallToolResult> {
        if self.expired.load(Ordering::SeqCst) || self.close_calls() > 0 {
            return Err(McpError::SessionClosed(format!("{} expired", self.server)));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CallToolResult::text_content(vec![TextContent::new(
            format!("{}:{name}", self.server),
            None,
            None,
        )]))
    }

    async fn close(&self) -> McpResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeConnector {
    behaviours: Mutex<HashMap<String, Behaviour>>,
    requests: Mutex<Vec<ConnectRequest>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    expire_new: AtomicBool,
}

impl FakeConnector {
    pub(crate) fn set(&self, server: &str, behaviour: Behaviour) {
        self.behaviours
            .lock()
            .expect("lock")
            .insert(server.to_string(), behaviour);
    }

    pub(crate) fn expire_new_connections(&self) {
        self.expire_new.store(true, Ordering::SeqCst);
    }

    pub(crate) fn requests(&self) -> Vec<ConnectRequest> {
        self.requests.lock().expect("lock").clone()
    }

    pub(crate) fn connections_for(&self, server: &str) -> Vec<Arc<FakeConnection>> {
        self.connections
            .lock()
            .expect("lock")
            .iter()
            .filter(|connection| connection.server == server)
            .cloned()
            .collect()
    }

    pub(crate) fn all_connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, request: &ConnectRequest) -> McpResult<Arc<dyn McpConnection>> {
        self.requests.lock().expect("lock").push(request.clone());
        let behaviour = self
            .behaviours
            .lock()
            .expect("lock")
            .get(&request.server.name)
            .cloned()
            .ok_or_else(|| McpError::transport("unknown server"))?;

        let tools = match (behaviour, request.variant) {
            (Behaviour::Tools(tools), _) => tools,
            (Behaviour::PlainOnly(tools), TransportVariant::Plain) => tools,
            (Behaviour::PlainOnly(_), TransportVariant::Authenticated) => {
                return Err(McpError::transport("HTTP error: 400 Bad Request"));
            }
            (Behaviour::Unauthorized, TransportVariant::Authenticated) => {
                return Err(McpError::Unauthorized { metadata_url: None });
            }
            (Behaviour::Unauthorized, TransportVariant::Plain) => {
                return Err(McpError::transport("HTTP error: 401 Unauthorized"));
            }
            (Behaviour::Fail, _) => return Err(McpError::transport("connection refused")),
        };

        let connection = Arc::new(FakeConnection {
            server: request.server.name.clone(),
            variant: request.variant,
            tools,
            expired: AtomicBool::new(self.expire_new.load(Ordering::SeqCst)),
            close_calls: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        });
        self.connections
            .lock()
            .expect("lock")
            .push(Arc::clone(&connection));
        Ok(connection)
    }
}

pub(crate) struct Fixture {
    pub connector: Arc<FakeConnector>,
    pub kv: Arc<MemoryStore>,
    pub clock: ManualClock,
    pub auth: Arc<AuthManager>,
    pub servers: Vec<ServerConfig>,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let kv = Arc::new(MemoryStore::new());
        let clock = ManualClock::default();
        let auth = Arc::new(AuthManager::new(
            oauth_config(),
            kv.clone(),
            Arc::new(clock.clone()),
            reqwest::Client::new(),
        ));
        Self {
            connector: Arc::new(FakeConnector::default()),
            kv,
            clock,
            auth,
            servers: Vec::new(),
        }
    }

    pub(crate) fn with(mut self, name: &str, behaviour: Behaviour) -> Self {
        self.connector.set(name, behaviour);
        self.servers
            .push(ServerConfig::new(name, format!("{UNREACHABLE}/{name}")));
        self
    }

    pub(crate) fn server(&self, name: &str) -> ServerConfig {
        self.servers
            .iter()
            .find(|server| server.name == name)
            .cloned()
            .expect("server configured")
    }

    pub(crate) fn context(&self) -> SessionContext {
        SessionContext {
            connector: self.connector.clone(),
            auth: self.auth.clone(),
            user_id_header: "X-MCP-User-ID".to_string(),
        }
    }

    pub(crate) fn session(&self, user_id: &str, server: &str) -> ServerSession {
        ServerSession::new(user_id, self.server(server), self.context())
    }

    pub(crate) fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            oauth: oauth_config(),
            ..PoolConfig::with_servers(self.servers.clone())
        }
    }

    /// Stores client credentials so authorization never needs registration.
    pub(crate) async fn register_client(&self, server: &str) {
        let credentials = ClientCredentials {
            client_id: format!("client-{server}"),
            client_secret: None,
            server_url: self.server(server).base_url,
            created_at: Utc::now(),
        };
        self.auth
            .credential_store()
            .save_client_credentials(&credentials)
            .await
            .expect("store credentials");
    }
}

fn oauth_config() -> OAuthConfig {
    OAuthConfig {
        redirect_uri: REDIRECT_URI.to_string(),
        ..OAuthConfig::default()
    }
}
