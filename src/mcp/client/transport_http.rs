use std::sync::atomic::{AtomicI64, Ordering};

use reqwest::{Response, StatusCode};
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{RequestId, LATEST_PROTOCOL_VERSION};
use tracing::debug;

use super::{client_details, protocol};
use crate::core::error::{McpError, McpResult};
use crate::mcp::transport::http::AuthenticatingTransport;
use crate::mcp::transport::streamable_http::read_server_message;
use crate::mcp::transport::MCP_SESSION_ID_HEADER;

/// An initialized streamable HTTP session. The session id and negotiated
/// protocol version are fixed by the handshake.
#[derive(Debug)]
pub(crate) struct StreamableHttpSession {
    transport: AuthenticatingTransport,
    server_id: String,
    url: String,
    session_id: Option<String>,
    protocol_version: String,
    next_request_id: AtomicI64,
}

impl StreamableHttpSession {
    pub(crate) async fn initialize(
        transport: AuthenticatingTransport,
        server_id: &str,
        url: &str,
    ) -> McpResult<Self> {
        let message = request_message(RequestFromClient::InitializeRequest(client_details()), 0)?;
        debug!(server_id = %server_id, url = %url, "Initializing MCP session");

        let request = transport
            .post(url, Some(LATEST_PROTOCOL_VERSION))
            .body(serde_json::to_string(&message)?);
        let response = check_status(transport.send(request).await?, false)?;
        let session_id = session_id_from(&response);
        let initialize = protocol::parse_initialize_result(read_server_message(response).await?)?;

        let session = Self {
            transport,
            server_id: server_id.to_string(),
            url: url.to_string(),
            session_id,
            protocol_version: initialize.protocol_version,
            next_request_id: AtomicI64::new(1),
        };
        session
            .send_notification(NotificationFromClient::InitializedNotification(None))
            .await?;
        Ok(session)
    }

    pub(crate) fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub(crate) async fn send_request(&self, request: RequestFromClient) -> McpResult<ServerMessage> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let message = request_message(request, request_id)?;
        debug!(server_id = %self.server_id, url = %self.url, request_id, "Sending MCP HTTP request");

        let response = self.post(&message).await?;
        read_server_message(response).await
    }

    async fn send_notification(&self, notification: NotificationFromClient) -> McpResult<()> {
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| McpError::protocol(err.to_string()))?;
        self.post(&message).await.map(|_| ())
    }

    async fn post(&self, message: &ClientMessage) -> McpResult<Response> {
        let mut request = self
            .transport
            .post(&self.url, Some(&self.protocol_version))
            .body(serde_json::to_string(message)?);
        if let Some(session_id) = &self.session_id {
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
        }
        check_status(self.transport.send(request).await?, self.session_id.is_some())
    }

    /// Asks the server to drop the session. Servers that do not support
    /// explicit termination answer 405, which is fine.
    pub(crate) async fn terminate(&self) -> McpResult<()> {
        let Some(session_id) = &self.session_id else {
            return Ok(());
        };
        let request = self
            .transport
            .delete(&self.url, Some(&self.protocol_version))
            .header(MCP_SESSION_ID_HEADER, session_id);
        let response = self.transport.send(request).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_FOUND => Ok(()),
            status => Err(McpError::transport(format!(
                "HTTP error terminating session: {status}"
            ))),
        }
    }
}

fn request_message(request: RequestFromClient, request_id: i64) -> McpResult<ClientMessage> {
    ClientMessage::from_message(
        MessageFromClient::RequestFromClient(request),
        Some(RequestId::Integer(request_id)),
    )
    .map_err(|err| McpError::protocol(err.to_string()))
}

fn session_id_from(response: &Response) -> Option<String> {
    response
        .headers()
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn check_status(response: Response, has_session: bool) -> McpResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND && has_session {
        return Err(McpError::SessionClosed(format!(
            "server no longer recognizes session at {}",
            response.url()
        )));
    }
    Err(McpError::transport(format!("HTTP error: {status}")))
}
