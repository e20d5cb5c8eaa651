use rust_mcp_schema::schema_utils::ServerMessage;
use rust_mcp_schema::{CallToolResult, InitializeResult, ListToolsResult, RpcError};
use serde_json::Value;

use crate::core::error::{McpError, McpResult};

pub(crate) fn parse_initialize_result(message: ServerMessage) -> McpResult<InitializeResult> {
    let result: InitializeResult = parse_response(message)?;
    if result.protocol_version.trim().is_empty() {
        return Err(McpError::protocol("unexpected initialize response"));
    }
    Ok(result)
}

pub(crate) fn parse_list_tools(message: ServerMessage) -> McpResult<ListToolsResult> {
    parse_response(message)
}

pub(crate) fn parse_call_tool(message: ServerMessage) -> McpResult<CallToolResult> {
    parse_response(message)
}

fn parse_response<T: serde::de::DeserializeOwned>(message: ServerMessage) -> McpResult<T> {
    let value = parse_response_value(message)?;
    Ok(serde_json::from_value::<T>(value)?)
}

pub(crate) fn parse_response_value(message: ServerMessage) -> McpResult<Value> {
    match message {
        ServerMessage::Response(response) => Ok(serde_json::to_value(&response.result)?),
        ServerMessage::Error(error) => Err(McpError::Protocol(format_rpc_error(&error.error))),
        other => Err(McpError::Protocol(format!(
            "unexpected MCP server message: {other:?}"
        ))),
    }
}

pub(crate) fn format_rpc_error(error: &RpcError) -> String {
    let mut output = format!("MCP error {}: {}", error.code, error.message);
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| data.as_str().map(|value| value.to_string()))
            .or_else(|| serde_json::to_string(data).ok());

        if let Some(details) = details.filter(|details| !details.is_empty()) {
            output.push_str(": ");
            output.push_str(&details);
        }
    }
    output
}
