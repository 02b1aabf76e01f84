//! Engine error types.
//!
//! Every component error is wrapped with the component it came from, and can
//! be flattened into a [`StructuredError`] for callers that want data rather
//! than a Rust error.

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::gateway::GatewayError;
use crate::mcp_client::McpError;
use crate::models::ModelError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    ToolServer(#[from] McpError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Backend(#[from] GatewayError),

    /// The model kept answering with neither text nor tool calls.
    #[error("backend returned {count} consecutive empty responses")]
    EmptyResponses { count: u32 },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The whole invocation exceeded its caller-imposed ceiling.
    #[error("execution exceeded its {ceiling_ms}ms deadline")]
    DeadlineExceeded { ceiling_ms: u64 },
}

/// Caller-facing error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructuredError {
    pub component: String,
    pub message: String,
    /// Valid choices the caller could use instead (model ids, server names).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<String>,
}

impl EngineError {
    /// The component the error originated in.
    pub fn component(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::ToolServer(_) => "tool_server",
            EngineError::Model(_) => "model",
            EngineError::Backend(_) => "backend",
            EngineError::EmptyResponses { .. }
            | EngineError::InvalidRequest { .. }
            | EngineError::DeadlineExceeded { .. } => "engine",
        }
    }

    pub fn to_structured(&self) -> StructuredError {
        let alternatives = match self {
            EngineError::Model(ModelError::NotFound { available, .. }) => available.clone(),
            EngineError::ToolServer(McpError::UnknownServer { known, .. }) => known.clone(),
            _ => Vec::new(),
        };
        StructuredError {
            component: self.component().to_string(),
            message: self.to_string(),
            alternatives,
        }
    }
}
