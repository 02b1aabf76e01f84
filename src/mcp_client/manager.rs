//! Session manager - the per-invocation owner of every tool-server session.
//!
//! Opens sessions for a set of descriptors, builds the qualified-name routing
//! table once, dispatches tool calls to the owning session, and tears every
//! session down on close.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;

use super::errors::McpError;
use super::provider::{SessionConnector, ToolProvider};
use super::registry::ToolRegistry;
use super::types::{ServerDescriptor, ToolCallOutcome, ToolDefinition};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for a single tool dispatch.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// How a connection failure of one descriptor affects the whole set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPolicy {
    /// Any failure aborts the open and closes sessions already started.
    FailFast,
    /// Failures are logged and recorded; the remaining servers are used.
    /// Fails only when every server fails.
    Degraded,
}

// ─── SessionManager ──────────────────────────────────────────────────────────

/// Owns the sessions of one engine invocation.
pub struct SessionManager {
    sessions: HashMap<String, Arc<dyn ToolProvider>>,
    registry: ToolRegistry,
    failures: Vec<(String, McpError)>,
    call_timeout: Duration,
    closed: bool,
}

impl SessionManager {
    /// Connect every descriptor concurrently and aggregate their catalogs.
    pub async fn open(
        descriptors: &[ServerDescriptor],
        policy: ConnectPolicy,
        connector: &dyn SessionConnector,
    ) -> Result<Self, McpError> {
        let attempts = join_all(descriptors.iter().map(|d| connector.connect(d))).await;

        let mut manager = Self {
            sessions: HashMap::new(),
            registry: ToolRegistry::new(),
            failures: Vec::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            closed: false,
        };

        // Register in descriptor order so the aggregated catalog is deterministic.
        for (descriptor, attempt) in descriptors.iter().zip(attempts) {
            match attempt {
                Ok(provider) => {
                    manager
                        .registry
                        .register_server_tools(&descriptor.name, provider.list_tools());
                    manager.sessions.insert(descriptor.name.clone(), provider);
                }
                Err(e) => {
                    tracing::warn!(
                        server = %descriptor.name,
                        error = %e,
                        policy = ?policy,
                        "tool server failed to connect"
                    );
                    manager.failures.push((descriptor.name.clone(), e));
                }
            }
        }

        if manager.failures.is_empty() {
            return Ok(manager);
        }

        match policy {
            ConnectPolicy::FailFast => {
                manager.close_all().await;
                let (_, first) = manager.failures.remove(0);
                Err(first)
            }
            ConnectPolicy::Degraded if manager.sessions.is_empty() => {
                manager.closed = true;
                match manager.failures.pop() {
                    Some((_, last)) => Err(last),
                    None => Ok(manager),
                }
            }
            ConnectPolicy::Degraded => {
                tracing::warn!(
                    connected = manager.sessions.len(),
                    failed = manager.failures.len(),
                    "continuing with a degraded set of tool servers"
                );
                Ok(manager)
            }
        }
    }

    /// Set the per-dispatch timeout.
    pub fn set_call_timeout(&mut self, timeout: Duration) {
        self.call_timeout = timeout;
    }

    // ─── Dispatch ────────────────────────────────────────────────────────

    /// Dispatch one tool call to the session that owns `tool_name`.
    ///
    /// Only an unknown tool name is an `Err`. Tool-level failures (JSON-RPC
    /// error, `isError` result, timeout, dead transport) come back as an
    /// outcome with `is_error = true` so the model can react to them.
    pub async fn dispatch(
        &self,
        call_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallOutcome, McpError> {
        let start = Instant::now();

        let route = self
            .registry
            .route(tool_name)
            .ok_or_else(|| McpError::ToolNotFound {
                name: tool_name.to_string(),
            })?;
        let session = self
            .sessions
            .get(&route.server)
            .ok_or_else(|| McpError::ToolNotFound {
                name: tool_name.to_string(),
            })?;

        let call = tokio::time::timeout(self.call_timeout, session.call_tool(&route.tool, arguments));
        let (result_text, is_error) = match call.await {
            Ok(Ok(result)) => (result.to_text(), result.is_error),
            Ok(Err(McpError::ServerError { code, message, .. })) => {
                (format!("[{code}] {message}"), true)
            }
            Ok(Err(e)) => {
                let detail = session
                    .describe_last_error()
                    .map(|d| format!(" ({d})"))
                    .unwrap_or_default();
                (format!("{e}{detail}"), true)
            }
            Err(_) => (
                McpError::Timeout {
                    tool: tool_name.to_string(),
                    timeout_ms: self.call_timeout.as_millis() as u64,
                }
                .to_string(),
                true,
            ),
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        if is_error {
            tracing::warn!(
                call_id,
                tool = tool_name,
                elapsed_ms,
                error = %result_text,
                "tool call failed"
            );
        } else {
            tracing::info!(call_id, tool = tool_name, elapsed_ms, "tool call completed");
        }

        Ok(ToolCallOutcome {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            result_text,
            is_error,
            elapsed_ms,
        })
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Close every session. Idempotent.
    pub async fn close_all(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let sessions: Vec<_> = self.sessions.drain().collect();
        join_all(sessions.iter().map(|(_, s)| s.close())).await;
        tracing::debug!(count = sessions.len(), "closed tool server sessions");
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// The aggregated catalog (qualified names, discovery order).
    pub fn catalog(&self) -> &[ToolDefinition] {
        self.registry.catalog()
    }

    /// The routing registry.
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Servers that failed to connect under the degraded policy.
    pub fn failures(&self) -> &[(String, McpError)] {
        &self.failures
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether `close_all` has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if !self.closed && !self.sessions.is_empty() {
            tracing::warn!(
                count = self.sessions.len(),
                "session manager dropped without close_all; child processes are killed on drop"
            );
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
