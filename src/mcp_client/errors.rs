//! MCP client error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during discovery, connection, and tool dispatch.
#[derive(Debug, Error)]
pub enum McpError {
    /// No search location yielded a parseable servers config file.
    #[error("no servers config found (searched: {})", display_paths(searched))]
    ConfigNotFound { searched: Vec<PathBuf> },

    /// A requested server name does not appear in the servers config.
    #[error("server '{name}' is not configured (known: {})", known.join(", "))]
    UnknownServer { name: String, known: Vec<String> },

    /// Launching or handshaking with a tool server failed.
    #[error("tool server '{server}' connection failed: {reason}")]
    ToolServerConnection { server: String, reason: String },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not found in the aggregated registry.
    #[error("unknown tool: '{name}'")]
    ToolNotFound { name: String },

    /// A tool call timed out.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// The session was already closed when a call arrived.
    #[error("session for server '{server}' is closed")]
    SessionClosed { server: String },
}

impl McpError {
    /// The server this error is attributed to, when there is one.
    pub fn server(&self) -> Option<&str> {
        match self {
            McpError::ToolServerConnection { server, .. }
            | McpError::TransportError { server, .. }
            | McpError::SessionClosed { server } => Some(server),
            McpError::UnknownServer { name, .. } => Some(name),
            _ => None,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
