//! Response body parsing for the two completion endpoints and the model list.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use super::errors::GatewayError;
use super::types::{BackendResponse, RawToolCall};
use crate::models::types::{ModelRecord, ModelStatus};

fn decode_error(what: &str, e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Decode {
        reason: format!("failed to parse {what}: {e}"),
    }
}

fn non_empty(text: Option<String>) -> Option<String> {
    text.filter(|t| !t.trim().is_empty())
}

fn fresh_call_id() -> String {
    format!("call_{}", Uuid::new_v4())
}

// ─── Chat Completions ────────────────────────────────────────────────────────

/// Parse a `/chat/completions` body.
///
/// Tool call `arguments` are kept raw; a malformed payload is the engine's
/// problem, not a decode failure.
pub fn parse_chat_completion(body: &str) -> Result<BackendResponse, GatewayError> {
    #[derive(Deserialize)]
    struct Completion {
        #[serde(default)]
        choices: Vec<Choice>,
    }

    #[derive(Deserialize)]
    struct Choice {
        message: Message,
    }

    #[derive(Deserialize)]
    struct Message {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        tool_calls: Option<Vec<Call>>,
    }

    #[derive(Deserialize)]
    struct Call {
        #[serde(default)]
        id: Option<String>,
        function: Function,
    }

    #[derive(Deserialize)]
    struct Function {
        name: String,
        #[serde(default)]
        arguments: Value,
    }

    let resp: Completion =
        serde_json::from_str(body).map_err(|e| decode_error("chat completion", e))?;
    let choice = resp.choices.into_iter().next().ok_or(GatewayError::Decode {
        reason: "empty choices array".into(),
    })?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| RawToolCall {
            call_id: call.id.filter(|id| !id.is_empty()).unwrap_or_else(fresh_call_id),
            name: call.function.name,
            arguments_payload: call.function.arguments,
        })
        .collect();

    Ok(BackendResponse {
        text: non_empty(choice.message.content),
        tool_calls,
        continuation_token: None,
    })
}

// ─── Responses ───────────────────────────────────────────────────────────────

/// Parse a `/responses` body.
///
/// `output` holds `function_call` and `message` items; message text comes
/// from `output_text` content parts. The top-level `id` is the new
/// continuation token.
pub fn parse_responses(body: &str) -> Result<BackendResponse, GatewayError> {
    #[derive(Deserialize)]
    struct Response {
        id: Option<String>,
        #[serde(default)]
        output: Vec<Value>,
        #[serde(default)]
        output_text: Option<String>,
    }

    let resp: Response = serde_json::from_str(body).map_err(|e| decode_error("response", e))?;
    // Without a fresh id the next call cannot continue this conversation.
    let token = resp
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or(GatewayError::Decode {
            reason: "responses body has no id to continue from".into(),
        })?;

    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();
    for item in resp.output {
        match item.get("type").and_then(Value::as_str) {
            Some("function_call") => {
                let name = item
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or(GatewayError::Decode {
                        reason: "function_call item without a name".into(),
                    })?;
                let call_id = item
                    .get("call_id")
                    .or_else(|| item.get("id"))
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(fresh_call_id);
                tool_calls.push(RawToolCall {
                    call_id,
                    name: name.to_string(),
                    arguments_payload: item.get("arguments").cloned().unwrap_or(Value::Null),
                });
            }
            Some("message") => {
                let parts = item.get("content").and_then(Value::as_array);
                for part in parts.into_iter().flatten() {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        texts.push(text.to_string());
                    }
                }
            }
            // Reasoning items and anything newer are not part of the contract.
            _ => {}
        }
    }

    let text = if texts.is_empty() {
        resp.output_text
    } else {
        Some(texts.join("\n"))
    };

    Ok(BackendResponse {
        text: non_empty(text),
        tool_calls,
        continuation_token: Some(token),
    })
}

// ─── Model List ──────────────────────────────────────────────────────────────

/// Parse a model listing (`{"data": [{"id", "state"|"status"}]}`).
pub fn parse_models(body: &str, observed_at: DateTime<Utc>) -> Result<Vec<ModelRecord>, GatewayError> {
    #[derive(Deserialize)]
    struct Listing {
        #[serde(default)]
        data: Vec<Entry>,
    }

    #[derive(Deserialize)]
    struct Entry {
        id: String,
        #[serde(default)]
        state: Option<String>,
        #[serde(default)]
        status: Option<String>,
    }

    let listing: Listing = serde_json::from_str(body).map_err(|e| decode_error("model list", e))?;
    Ok(listing
        .data
        .into_iter()
        .map(|entry| ModelRecord {
            status: ModelStatus::from_backend(entry.state.as_deref().or(entry.status.as_deref())),
            id: entry.id,
            last_observed_at: observed_at,
        })
        .collect())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
