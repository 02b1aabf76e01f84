//! Conversation state carried between rounds.
//!
//! Stateless mode owns the whole history and resends it every round.
//! Stateful mode owns only the backend's continuation token and the input
//! for the next call; nothing accumulates client-side.

use serde_json::Value;

use super::types::ToolCallRequest;
use crate::config::ConversationMode;
use crate::gateway::types::{FunctionCallResponse, ToolCallResponse};
use crate::gateway::{
    BackendResponse, ChatCompletionRequest, ChatMessage, FunctionCallOutput, ResponsesInput,
    ResponsesRequest,
};
use crate::mcp_client::types::ToolCallOutcome;

/// Inputs shared by every backend call of one invocation.
#[derive(Debug, Clone)]
pub struct CallSettings<'a> {
    pub model: &'a str,
    pub max_tokens: u32,
    pub tool_schemas: &'a [Value],
    pub resend_tools_each_round: bool,
}

/// One backend call, shaped for the conversation mode.
#[derive(Debug, Clone)]
pub enum BackendCall {
    Stateless(ChatCompletionRequest),
    Stateful(ResponsesRequest),
}

#[derive(Debug, Clone)]
pub enum ConversationState {
    History(Vec<ChatMessage>),
    Continuation {
        token: Option<String>,
        next_input: ResponsesInput,
        /// Sent once, with the first call.
        instructions: Option<String>,
    },
}

impl ConversationState {
    pub fn new(mode: ConversationMode, system_prompt: Option<&str>, task: &str) -> Self {
        match mode {
            ConversationMode::Stateless => {
                let mut history = Vec::with_capacity(2);
                if let Some(prompt) = system_prompt {
                    history.push(ChatMessage::system(prompt));
                }
                history.push(ChatMessage::user(task));
                ConversationState::History(history)
            }
            ConversationMode::Stateful => ConversationState::Continuation {
                token: None,
                next_input: ResponsesInput::Text(task.to_string()),
                instructions: system_prompt.map(str::to_string),
            },
        }
    }

    pub fn mode(&self) -> ConversationMode {
        match self {
            ConversationState::History(_) => ConversationMode::Stateless,
            ConversationState::Continuation { .. } => ConversationMode::Stateful,
        }
    }

    /// Number of messages held locally. Always zero in stateful mode.
    pub fn history_len(&self) -> usize {
        match self {
            ConversationState::History(history) => history.len(),
            ConversationState::Continuation { .. } => 0,
        }
    }

    // ─── Request Building ────────────────────────────────────────────────

    /// The request for the next backend call.
    pub fn next_call(&self, settings: &CallSettings<'_>) -> BackendCall {
        match self {
            ConversationState::History(history) => {
                let tools =
                    (!settings.tool_schemas.is_empty()).then(|| settings.tool_schemas.to_vec());
                BackendCall::Stateless(ChatCompletionRequest {
                    model: settings.model.to_string(),
                    messages: history.clone(),
                    tool_choice: tools.as_ref().map(|_| "auto".to_string()),
                    tools,
                    max_tokens: settings.max_tokens,
                    stream: false,
                })
            }
            ConversationState::Continuation {
                token,
                next_input,
                instructions,
            } => {
                let first_call = token.is_none();
                let send_tools = (first_call || settings.resend_tools_each_round)
                    && !settings.tool_schemas.is_empty();
                BackendCall::Stateful(ResponsesRequest {
                    model: settings.model.to_string(),
                    input: next_input.clone(),
                    previous_response_id: token.clone(),
                    tools: send_tools.then(|| settings.tool_schemas.to_vec()),
                    instructions: if first_call { instructions.clone() } else { None },
                    max_output_tokens: settings.max_tokens,
                })
            }
        }
    }

    // ─── State Updates ───────────────────────────────────────────────────

    /// Fold a backend turn that carried tool calls into the state.
    pub fn record_assistant_turn(&mut self, response: &BackendResponse, calls: &[ToolCallRequest]) {
        match self {
            ConversationState::History(history) => {
                let tool_calls = calls
                    .iter()
                    .map(|call| ToolCallResponse {
                        id: call.call_id.clone(),
                        r#type: "function".to_string(),
                        function: FunctionCallResponse {
                            name: call.tool_name.clone(),
                            // Re-encode so every history entry carries a JSON string.
                            arguments: Value::Object(call.parsed_arguments.clone()).to_string(),
                        },
                    })
                    .collect();
                history.push(ChatMessage::assistant_tool_calls(response.text.clone(), tool_calls));
            }
            ConversationState::Continuation { .. } => self.record_token(response),
        }
    }

    /// Feed tool results into the next call.
    pub fn record_tool_results(&mut self, outcomes: &[ToolCallOutcome]) {
        match self {
            ConversationState::History(history) => {
                history.extend(
                    outcomes
                        .iter()
                        .map(|o| ChatMessage::tool_result(&o.call_id, &o.result_text)),
                );
            }
            ConversationState::Continuation { next_input, .. } => {
                *next_input = ResponsesInput::Items(
                    outcomes
                        .iter()
                        .map(|o| FunctionCallOutput::new(&o.call_id, &o.result_text))
                        .collect(),
                );
            }
        }
    }

    /// Ask the model to try again after an empty turn.
    pub fn nudge(&mut self, response: &BackendResponse, text: &str) {
        match self {
            ConversationState::History(history) => history.push(ChatMessage::user(text)),
            ConversationState::Continuation { next_input, .. } => {
                *next_input = ResponsesInput::Text(text.to_string());
                self.record_token(response);
            }
        }
    }

    fn record_token(&mut self, response: &BackendResponse) {
        if let ConversationState::Continuation { token, .. } = self {
            if let Some(new_token) = &response.continuation_token {
                *token = Some(new_token.clone());
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
