//! mcpool gives a chat-bot runtime per-user access to remote MCP tool servers.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`mcp`] owns the connection pool, per-user session sets, per-server
//!   sessions and the streamable HTTP transport they run over.
//! - [`auth`] runs the OAuth 2 authorization-code flow with PKCE, including
//!   metadata discovery, dynamic client registration and token refresh.
//! - [`core`] holds configuration, the error taxonomy, the injected clock and
//!   the key-value persistence seam.
//!
//! Hosts build a [`mcp::pool::ClientPool`], ask it for a user's tools, and
//! forward OAuth redirects to [`mcp::pool::ClientPool::process_oauth_callback`].
//! The `mcpool` binary routes through [`crate::cli::main`].

pub mod auth;
pub mod cli;
pub mod core;
pub mod mcp;

pub use crate::core::config::{OAuthConfig, PoolConfig, ServerConfig};
pub use crate::core::error::{ErrorKind, McpError, McpResult};
pub use crate::mcp::pool::{ClientPool, UserTools};
pub use crate::mcp::tool::Tool;
