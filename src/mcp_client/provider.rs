//! Capability seams between the session manager and concrete tool servers.

use std::sync::Arc;

use async_trait::async_trait;

use super::errors::McpError;
use super::types::{CallToolResult, ServerDescriptor, ToolDefinition};

/// A connected source of tools. Each live session is one implementation.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// The server name this provider was launched as.
    fn name(&self) -> &str;

    /// The catalog fetched during connection, in discovery order.
    fn list_tools(&self) -> &[ToolDefinition];

    /// Invoke a tool by its unqualified (server-local) name.
    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError>;

    /// Structured health signal: the most recent diagnostic output, if any.
    fn describe_last_error(&self) -> Option<String> {
        None
    }

    /// Release the underlying transport/process. Must be idempotent.
    async fn close(&self);
}

/// Turns a descriptor into a connected provider.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, descriptor: &ServerDescriptor)
        -> Result<Arc<dyn ToolProvider>, McpError>;
}
