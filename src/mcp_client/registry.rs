//! Tool registry - aggregates tool catalogs across all connected servers.
//!
//! Provides:
//! - Qualified naming (`server__tool`) so that catalogs from several servers
//!   can share one namespace without collisions
//! - A flat qualified-name → (server, tool) map built once at connect time
//! - The aggregated canonical catalog, in discovery order

use std::collections::HashMap;

use super::types::ToolDefinition;

/// Separator between server and tool in a qualified name.
///
/// OpenAI-compatible backends restrict function names to `[A-Za-z0-9_-]`,
/// which rules out the more readable `server.tool`.
pub const QUALIFIER: &str = "__";

/// Build the qualified name for a server-local tool.
pub fn qualify(server: &str, tool: &str) -> String {
    format!("{server}{QUALIFIER}{tool}")
}

/// Where a qualified tool name routes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRoute {
    pub server: String,
    pub tool: String,
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Aggregated tool registry across all sessions of one invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    /// Canonical definitions with qualified names, in registration order.
    catalog: Vec<ToolDefinition>,
    /// `qualified_name → route`.
    routes: HashMap<String, ToolRoute>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server's catalog under qualified names.
    ///
    /// A qualified name that is already taken keeps its first owner. That is
    /// either the same server advertising a tool twice or two servers whose
    /// names only line up across the separator (`a__b` + `c` vs `a` + `b__c`).
    pub fn register_server_tools(&mut self, server_name: &str, tools: &[ToolDefinition]) {
        for tool in tools {
            let qualified = qualify(server_name, &tool.name);
            if let Some(owner) = self.routes.get(&qualified) {
                tracing::warn!(
                    qualified = %qualified,
                    server = server_name,
                    tool = %tool.name,
                    owner_server = %owner.server,
                    owner_tool = %owner.tool,
                    "qualified tool name already registered, keeping first"
                );
                continue;
            }
            self.catalog.push(ToolDefinition {
                name: qualified.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            });
            self.routes.insert(
                qualified,
                ToolRoute {
                    server: server_name.to_string(),
                    tool: tool.name.clone(),
                },
            );
        }
    }

    /// Resolve a qualified tool name to its owning server and local name.
    pub fn route(&self, qualified_name: &str) -> Option<&ToolRoute> {
        self.routes.get(qualified_name)
    }

    /// The aggregated catalog with qualified names, in discovery order.
    pub fn catalog(&self) -> &[ToolDefinition] {
        &self.catalog
    }

    /// Return all registered tool names, in discovery order.
    pub fn tool_names(&self) -> Vec<&str> {
        self.catalog.iter().map(|t| t.name.as_str()).collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
