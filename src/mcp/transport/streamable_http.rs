//! Response decoding for the streamable HTTP transport: a POST answers with
//! either a JSON body or an event stream carrying the JSON-RPC response.

use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::ServerMessage;
use tracing::debug;

use crate::core::error::{McpError, McpResult};

#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = self.buffer[search_index..].iter().position(|b| *b == b'\n')
        {
            let newline_index = search_index + relative_pos;
            push_trimmed(&mut lines, &self.buffer[search_index..newline_index]);
            search_index = newline_index + 1;
        }

        if flush {
            push_trimmed(&mut lines, &self.buffer[search_index..]);
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        lines
    }
}

fn push_trimmed(lines: &mut Vec<String>, bytes: &[u8]) {
    if let Ok(text) = std::str::from_utf8(bytes) {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Reads the JSON-RPC reply from a successful POST, whichever framing the
/// server chose.
pub async fn read_server_message(response: reqwest::Response) -> McpResult<ServerMessage> {
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    if is_event_stream_content_type(&content_type) {
        return next_sse_server_message(response).await;
    }
    let body = response.bytes().await?;
    serde_json::from_slice::<ServerMessage>(&body)
        .map_err(|err| McpError::protocol(format!("invalid MCP response body: {err}")))
}

/// Skips notifications and server-initiated requests until the response or
/// error for our request arrives.
pub async fn next_sse_server_message(response: reqwest::Response) -> McpResult<ServerMessage> {
    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for line in buffer.push(&chunk) {
            if let Some(message) = decode_sse_line(&line)? {
                return Ok(message);
            }
        }
    }

    for line in buffer.finish() {
        if let Some(message) = decode_sse_line(&line)? {
            return Ok(message);
        }
    }

    Err(McpError::protocol("empty event-stream response"))
}

fn decode_sse_line(line: &str) -> McpResult<Option<ServerMessage>> {
    let Some(payload) = sse_data_payload(line).filter(|payload| !payload.is_empty()) else {
        return Ok(None);
    };

    let message = serde_json::from_str::<ServerMessage>(payload)
        .map_err(|err| McpError::protocol(format!("invalid event-stream payload: {err}")))?;
    match message {
        ServerMessage::Response(_) | ServerMessage::Error(_) => Ok(Some(message)),
        other => {
            debug!(message = ?other, "Ignoring interleaved server message");
            Ok(None)
        }
    }
}
