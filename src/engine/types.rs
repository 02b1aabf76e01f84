//! Request, result and transcript types for one engine invocation.

use std::path::PathBuf;

use serde::Serialize;
use serde_json::{Map, Value};

use super::errors::StructuredError;
use crate::config::ConversationMode;
use crate::mcp_client::types::ToolCallOutcome;

/// One autonomous task.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    /// Servers to connect. Empty means every enabled server.
    pub server_names: Vec<String>,
    pub task: String,
    pub model: Option<String>,
    pub max_rounds: Option<u32>,
    pub max_tokens: Option<u32>,
    /// Falls back to `engine.mode` from config.
    pub mode: Option<ConversationMode>,
    /// Explicit servers config path, ahead of the normal search.
    pub servers_config: Option<PathBuf>,
}

impl ExecutionRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Default::default()
        }
    }
}

/// Engine state, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    Discover,
    Connect,
    ValidateModel,
    CallBackend,
    ExecuteTools,
    Terminal(TerminalReason),
}

impl EngineState {
    pub fn name(&self) -> &'static str {
        match self {
            EngineState::Init => "init",
            EngineState::Discover => "discover",
            EngineState::Connect => "connect",
            EngineState::ValidateModel => "validate_model",
            EngineState::CallBackend => "call_backend",
            EngineState::ExecuteTools => "execute_tools",
            EngineState::Terminal(TerminalReason::Completed) => "terminal_completed",
            EngineState::Terminal(TerminalReason::MaxRounds) => "terminal_max_rounds",
            EngineState::Terminal(TerminalReason::Error) => "terminal_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    Completed,
    /// The round ceiling was reached while the model was still calling tools.
    MaxRounds,
    Error,
}

/// A tool call as requested by the model, with its arguments decoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub tool_name: String,
    /// Exactly what the backend sent.
    pub arguments_payload: Value,
    /// Empty when the payload could not be decoded into an object.
    pub parsed_arguments: Map<String, Value>,
}

/// What happened, in order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptEntry {
    Assistant {
        round: u32,
        text: Option<String>,
        tool_calls: Vec<ToolCallRequest>,
    },
    ToolResult {
        round: u32,
        outcome: ToolCallOutcome,
    },
    EmptyResponse {
        round: u32,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub final_text: Option<String>,
    pub rounds_used: u32,
    pub terminal_reason: TerminalReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StructuredError>,
    pub model: String,
    pub transcript: Vec<TranscriptEntry>,
}
