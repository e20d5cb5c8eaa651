//! Streamable HTTP implementation of the connection seams.

mod protocol;
mod transport_http;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::RequestFromClient;
use rust_mcp_schema::{
    CallToolRequestParams, CallToolResult, ClientCapabilities, Implementation,
    InitializeRequestParams, PaginatedRequestParams, Tool, LATEST_PROTOCOL_VERSION,
};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::config::PoolConfig;
use crate::core::error::{McpError, McpResult};
use crate::mcp::transport::http::AuthenticatingTransport;
use crate::mcp::transport::{is_method_not_found, ConnectRequest, Connector, McpConnection};
use transport_http::StreamableHttpSession;

const MCP_MAX_TOOL_LIST: usize = 100;
const MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const MCP_HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

/// The shared HTTP client every connection and OAuth call goes through.
pub fn build_http_client(config: &PoolConfig) -> McpResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.connect_timeout())
        .timeout(config.request_timeout())
        .pool_idle_timeout(Duration::from_secs(MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(MCP_HTTP_POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(|err| McpError::Config(format!("failed to build HTTP client: {err}")))
}

fn client_details() -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("mcpool MCP client".to_string()),
            description: Some("Multi-tenant MCP client pool".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}

fn paginated_params(cursor: Option<String>) -> Option<PaginatedRequestParams> {
    cursor.map(|cursor| PaginatedRequestParams {
        cursor: Some(cursor),
        meta: None,
    })
}

/// Dials servers over streamable HTTP with one shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, request: &ConnectRequest) -> McpResult<Arc<dyn McpConnection>> {
        let transport = AuthenticatingTransport::new(self.client.clone(), request)?;
        let session =
            StreamableHttpSession::initialize(transport, request.server.id(), &request.server.base_url)
                .await?;
        debug!(
            user_id = %request.user_id,
            server_id = %request.server.id(),
            variant = ?request.variant,
            session_id = ?session.session_id(),
            "Connected to MCP server"
        );
        Ok(Arc::new(StreamableHttpConnection {
            server_id: request.server.id().to_string(),
            session,
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
pub struct StreamableHttpConnection {
    server_id: String,
    session: StreamableHttpSession,
    closed: AtomicBool,
}

impl StreamableHttpConnection {
    fn ensure_open(&self) -> McpResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(McpError::SessionClosed(format!(
                "connection to {} was closed",
                self.server_id
            )));
        }
        Ok(())
    }

    async fn fetch_tools_page(&self, cursor: Option<String>) -> McpResult<Option<(Vec<Tool>, Option<String>)>> {
        let message = self
            .session
            .send_request(RequestFromClient::ListToolsRequest(paginated_params(cursor)))
            .await?;
        if is_method_not_found(&message) {
            return Ok(None);
        }
        let list = protocol::parse_list_tools(message)?;
        Ok(Some((list.tools, list.next_cursor)))
    }
}

#[async_trait]
impl McpConnection for StreamableHttpConnection {
    async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        self.ensure_open()?;
        let Some((mut tools, mut next_cursor)) = self.fetch_tools_page(None).await? else {
            debug!(server_id = %self.server_id, "Server does not implement tools/list");
            return Ok(Vec::new());
        };

        while tools.len() < MCP_MAX_TOOL_LIST {
            let Some(cursor) = next_cursor.take() else {
                break;
            };
            match self.fetch_tools_page(Some(cursor)).await? {
                Some((page, cursor)) => {
                    tools.extend(page);
                    next_cursor = cursor;
                }
                None => break,
            }
        }
        if tools.len() > MCP_MAX_TOOL_LIST {
            warn!(
                server_id = %self.server_id,
                advertised = tools.len(),
                "Truncating MCP tool listing"
            );
            tools.truncate(MCP_MAX_TOOL_LIST);
        }
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> McpResult<CallToolResult> {
        self.ensure_open()?;
        let mut params = CallToolRequestParams::new(name);
        if let Some(arguments) = arguments {
            params = params.with_arguments(arguments);
        }
        let message = self
            .session
            .send_request(RequestFromClient::CallToolRequest(params))
            .await?;
        protocol::parse_call_tool(message)
    }

    async fn close(&self) -> McpResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.session.terminate().await
    }
}
