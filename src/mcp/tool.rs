use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use rust_mcp_schema::CallToolResult;
use serde_json::{Map, Value};

use crate::core::error::{McpError, McpResult};

pub type ToolResolver =
    Arc<dyn Fn(Option<Map<String, Value>>) -> BoxFuture<'static, McpResult<CallToolResult>> + Send + Sync>;

/// A remote tool as handed to the dispatch layer: the server's descriptor plus
/// a resolver that calls it through the owning per-server session.
#[derive(Clone)]
pub struct Tool {
    pub server_name: String,
    pub descriptor: rust_mcp_schema::Tool,
    resolver: ToolResolver,
}

impl Tool {
    pub fn new(server_name: impl Into<String>, descriptor: rust_mcp_schema::Tool, resolver: ToolResolver) -> Self {
        Self {
            server_name: server_name.into(),
            descriptor,
            resolver,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn description(&self) -> Option<&str> {
        self.descriptor.description.as_deref()
    }

    pub async fn call(&self, arguments: Option<Map<String, Value>>) -> McpResult<CallToolResult> {
        (self.resolver)(arguments).await
    }

    /// Calls the tool with arguments given as raw JSON text, as a model
    /// produces them. Empty input means no arguments.
    pub async fn call_json(&self, arguments: &str) -> McpResult<CallToolResult> {
        let arguments = arguments.trim();
        if arguments.is_empty() {
            return self.call(None).await;
        }
        match serde_json::from_str::<Value>(arguments)? {
            Value::Object(map) => self.call(Some(map)).await,
            Value::Null => self.call(None).await,
            other => Err(McpError::protocol(format!(
                "tool arguments for {} must be a JSON object, got {other}",
                self.name()
            ))),
        }
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("server_name", &self.server_name)
            .field("name", &self.descriptor.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use rust_mcp_schema::{TextContent, ToolInputSchema};

    fn echo_tool() -> Tool {
        let descriptor = rust_mcp_schema::Tool {
            annotations: None,
            description: Some("Echoes its arguments".to_string()),
            execution: None,
            icons: Vec::new(),
            input_schema: ToolInputSchema::new(Vec::new(), None, None),
            meta: None,
            name: "echo".to_string(),
            output_schema: None,
            title: None,
        };
        let resolver: ToolResolver = Arc::new(
            |arguments: Option<Map<String, Value>>| -> BoxFuture<'static, McpResult<CallToolResult>> {
                async move {
                    let text = serde_json::to_string(&arguments)?;
                    Ok(CallToolResult::text_content(vec![TextContent::new(
                        text, None, None,
                    )]))
                }
                .boxed()
            },
        );
        Tool::new("docs", descriptor, resolver)
    }

    fn first_text(result: &CallToolResult) -> String {
        let value = serde_json::to_value(result).expect("serializes");
        value["content"][0]["text"]
            .as_str()
            .expect("text content")
            .to_string()
    }

    #[tokio::test]
    async fn call_json_parses_object_arguments() {
        let tool = echo_tool();
        let result = tool.call_json(r#"{"q": "rust"}"#).await.expect("call");
        assert_eq!(first_text(&result), r#"{"q":"rust"}"#);
    }

    #[tokio::test]
    async fn call_json_treats_blank_as_no_arguments() {
        let tool = echo_tool();
        let result = tool.call_json("  ").await.expect("call");
        assert_eq!(first_text(&result), "null");
    }

    #[tokio::test]
    async fn call_json_rejects_non_objects() {
        let tool = echo_tool();
        let err = tool.call_json("[1, 2]").await.expect_err("array");
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Protocol);
    }
}
