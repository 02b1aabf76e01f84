//! Tool schema bridge - translate catalogs between backend wire dialects.
//!
//! The chat-completions endpoint wants each tool nested under a `function`
//! key; the responses endpoint wants the same fields flattened onto the tool
//! object. Both directions are pure and order-preserving.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::ConversationMode;
use crate::mcp_client::types::{empty_object_schema, ToolDefinition};

// ─── Types ───────────────────────────────────────────────────────────────────

/// Wire shape of a tool schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// `{"type":"function","function":{name,description,parameters}}`
    Nested,
    /// `{"type":"function",name,description,parameters}`
    Flattened,
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("tool schema #{index} is not a JSON object")]
    NotAnObject { index: usize },

    #[error("tool schema #{index} has no name")]
    MissingName { index: usize },

    #[error("tool schema #{index} is in the {found:?} dialect, expected {expected:?}")]
    DialectMismatch {
        index: usize,
        expected: Dialect,
        found: Dialect,
    },
}

// ─── Strategy ────────────────────────────────────────────────────────────────

/// Chooses the dialect used for a conversation mode.
pub trait DialectStrategy: Send + Sync {
    fn dialect_for(&self, mode: ConversationMode) -> Dialect;
}

/// Fixed mode → dialect table, normally read from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfiguredDialects {
    pub stateless: Dialect,
    pub stateful: Dialect,
}

impl Default for ConfiguredDialects {
    fn default() -> Self {
        Self {
            stateless: Dialect::Nested,
            stateful: Dialect::Flattened,
        }
    }
}

impl DialectStrategy for ConfiguredDialects {
    fn dialect_for(&self, mode: ConversationMode) -> Dialect {
        match mode {
            ConversationMode::Stateless => self.stateless,
            ConversationMode::Stateful => self.stateful,
        }
    }
}

// ─── Conversion ──────────────────────────────────────────────────────────────

/// Render a canonical catalog in `dialect`.
pub fn to_dialect(catalog: &[ToolDefinition], dialect: Dialect) -> Vec<Value> {
    catalog
        .iter()
        .map(|tool| match dialect {
            Dialect::Nested => json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                }
            }),
            Dialect::Flattened => json!({
                "type": "function",
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            }),
        })
        .collect()
}

/// Parse dialect-shaped schemas back into canonical definitions.
///
/// Every entry must be in `dialect`. Missing description or parameters are
/// normalised the same way a fetched catalog is.
pub fn from_dialect(schemas: &[Value], dialect: Dialect) -> Result<Vec<ToolDefinition>, SchemaError> {
    schemas
        .iter()
        .enumerate()
        .map(|(index, schema)| {
            let found = detect_dialect(schema).ok_or(SchemaError::NotAnObject { index })?;
            if found != dialect {
                return Err(SchemaError::DialectMismatch {
                    index,
                    expected: dialect,
                    found,
                });
            }

            let body = match dialect {
                Dialect::Nested => &schema["function"],
                Dialect::Flattened => schema,
            };
            let name = body
                .get("name")
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())
                .ok_or(SchemaError::MissingName { index })?;

            Ok(ToolDefinition {
                name: name.to_string(),
                description: body
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                parameters: body
                    .get("parameters")
                    .filter(|p| !p.is_null())
                    .cloned()
                    .unwrap_or_else(empty_object_schema),
            })
        })
        .collect()
}

/// Classify a schema object. `None` for anything that is not an object.
pub fn detect_dialect(schema: &Value) -> Option<Dialect> {
    let obj = schema.as_object()?;
    if obj.get("function").is_some_and(Value::is_object) {
        Some(Dialect::Nested)
    } else {
        Some(Dialect::Flattened)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
