//! LLM Gateway - resilient HTTP client for the local backend.
//!
//! This module handles:
//! - Stateless chat completions and stateful responses calls
//! - Normalising both response shapes into one turn type
//! - Listing the backend's models
//! - Timeouts, retries with backoff, and per-endpoint circuit breakers

pub mod client;
pub mod errors;
pub mod parse;
pub mod resilience;
pub mod types;

pub use client::{effective_request_timeout, GatewayClient, LlmBackend};
pub use errors::GatewayError;
pub use resilience::{BreakerRegistry, CircuitBreaker, RetryPolicy, SharedClock};
pub use types::{
    BackendResponse, ChatCompletionRequest, ChatMessage, FunctionCallOutput, RawToolCall,
    ResponsesInput, ResponsesRequest, Role,
};
