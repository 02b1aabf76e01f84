//! Wire types for the backend gateway.
//!
//! Request types mirror the OpenAI Chat Completions and Responses APIs.
//! Both response shapes are normalised into one [`BackendResponse`].

use serde::{Deserialize, Serialize};

// ─── Chat Completions ────────────────────────────────────────────────────────

/// A single message in a stateless conversation.
///
/// Serialization notes for OpenAI-compatible local models:
/// - `content` must be `""` (not `null`) for assistant messages with tool calls.
/// - `tool_call_id` and `tool_calls` are skipped when `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(serialize_with = "serialize_content")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallResponse>>,
}

/// Emit `""` instead of `null` when content is `None`.
fn serialize_content<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(value.as_deref().unwrap_or(""))
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    /// An assistant turn carrying tool calls (and any text emitted alongside).
    pub fn assistant_tool_calls(text: Option<String>, calls: Vec<ToolCallResponse>) -> Self {
        Self {
            role: Role::Assistant,
            content: text,
            tool_call_id: None,
            tool_calls: Some(calls),
        }
    }

    /// The result of one tool call.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_call_id: Some(call_id.into()),
            tool_calls: None,
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_call_id: None,
            tool_calls: None,
        }
    }
}

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Tool call as it appears in an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub id: String,
    pub r#type: String,
    pub function: FunctionCallResponse,
}

/// Function call details. `arguments` is a JSON-encoded string on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallResponse {
    pub name: String,
    pub arguments: String,
}

/// Request body for `POST /chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Nested-dialect tool schemas.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    pub max_tokens: u32,
    pub stream: bool,
}

// ─── Responses ───────────────────────────────────────────────────────────────

/// Request body for `POST /responses`.
#[derive(Debug, Clone, Serialize)]
pub struct ResponsesRequest {
    pub model: String,
    pub input: ResponsesInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    /// Flattened-dialect tool schemas.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub max_output_tokens: u32,
}

/// `input` is the task text on the first round and tool outputs afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponsesInput {
    Text(String),
    Items(Vec<FunctionCallOutput>),
}

/// One `function_call_output` input item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionCallOutput {
    pub r#type: &'static str,
    pub call_id: String,
    pub output: String,
}

impl FunctionCallOutput {
    pub fn new(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            r#type: "function_call_output",
            call_id: call_id.into(),
            output: output.into(),
        }
    }
}

// ─── Normalised Response ─────────────────────────────────────────────────────

/// A tool call exactly as the backend emitted it.
///
/// `arguments_payload` is left raw: usually a JSON-encoded string, sometimes
/// an object, occasionally garbage. The engine decides what to do with it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments_payload: serde_json::Value,
}

/// One backend turn, independent of the endpoint that produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendResponse {
    /// Non-empty assistant text, if any.
    pub text: Option<String>,
    pub tool_calls: Vec<RawToolCall>,
    /// Responses-endpoint `id`; `None` for chat completions.
    pub continuation_token: Option<String>,
}

impl BackendResponse {
    /// Neither text nor tool calls.
    pub fn is_empty(&self) -> bool {
        self.tool_calls.is_empty() && self.text.as_deref().map_or(true, |t| t.trim().is_empty())
    }
}
