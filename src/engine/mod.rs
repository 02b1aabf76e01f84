//! Execution Engine - the autonomous tool-calling loop.
//!
//! This module handles:
//! - Resolving and connecting the requested tool servers
//! - Validating the model and making it available
//! - Alternating backend calls and tool dispatch until the model answers
//! - Stateless (full history) and stateful (continuation token) conversations
//! - Reporting every outcome as an `ExecutionResult` or a structured error

pub mod arguments;
pub mod conversation;
pub mod errors;
pub mod executor;
pub mod types;

pub use arguments::{parse_arguments, ArgumentParseError};
pub use conversation::{BackendCall, ConversationState};
pub use errors::{EngineError, StructuredError};
pub use executor::ExecutionEngine;
pub use types::{
    EngineState, ExecutionRequest, ExecutionResult, TerminalReason, ToolCallRequest,
    TranscriptEntry,
};
