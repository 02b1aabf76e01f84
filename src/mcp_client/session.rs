//! Stdio tool-server sessions.
//!
//! Spawns a server as a child process, performs the MCP handshake, fetches
//! the catalog, and shuts the process down. Children are spawned with
//! `kill_on_drop`, so dropping a session (including through cancellation of
//! the owning future) never leaves an orphaned process behind.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, ChildStderr, Command};

use super::errors::McpError;
use super::provider::{SessionConnector, ToolProvider};
use super::transport::{extract_result, StdioTransport};
use super::types::{
    CallToolResult, InitializeResult, ListToolsResult, ServerDescriptor, ToolDefinition,
    PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for the initialize handshake plus catalog fetch.
///
/// Generous because some servers import heavy frameworks at startup.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of stderr lines retained for diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Upper bound on `tools/list` pages, guarding against a cursor that never ends.
const MAX_LIST_PAGES: usize = 64;

// ─── StdioSession ────────────────────────────────────────────────────────────

/// A running tool server process with its transport and catalog.
pub struct StdioSession {
    name: String,
    process: tokio::sync::Mutex<Option<Child>>,
    transport: StdioTransport,
    tools: Vec<ToolDefinition>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl StdioSession {
    /// Spawn the server described by `descriptor` and complete the handshake.
    pub async fn spawn(descriptor: &ServerDescriptor) -> Result<Self, McpError> {
        let name = descriptor.name.as_str();
        let mut cmd = Command::new(&descriptor.command);
        cmd.args(&descriptor.args);
        for (key, value) in &descriptor.env {
            cmd.env(key, value);
        }
        if let Some(dir) = descriptor.cwd.as_deref() {
            cmd.current_dir(dir);
        }

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| connection_error(name, format!("spawn failed: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| connection_error(name, "failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| connection_error(name, "failed to capture stdout".into()))?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_drain(name, stderr, Arc::clone(&stderr_tail));
        }

        let transport = StdioTransport::new(name, stdin, stdout);

        tracing::debug!(server = name, command = %descriptor.command, "spawned tool server");

        let tools = match tokio::time::timeout(INIT_TIMEOUT, handshake(&transport, name)).await {
            Ok(Ok(tools)) => tools,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                let reason = format!("{e}{}", format_stderr_suffix(&stderr_tail));
                return Err(connection_error(name, reason));
            }
            Err(_) => {
                let _ = child.kill().await;
                let reason = format!(
                    "initialization timed out after {}s{}",
                    INIT_TIMEOUT.as_secs(),
                    format_stderr_suffix(&stderr_tail)
                );
                return Err(connection_error(name, reason));
            }
        };

        tracing::info!(server = name, tool_count = tools.len(), "tool server connected");

        Ok(Self {
            name: name.to_string(),
            process: tokio::sync::Mutex::new(Some(child)),
            transport,
            tools,
            stderr_tail,
        })
    }
}

#[async_trait]
impl ToolProvider for StdioSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError> {
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let response = self.transport.request("tools/call", Some(params)).await?;
        let result = extract_result(response)?;
        serde_json::from_value(result).map_err(|e| McpError::TransportError {
            server: self.name.clone(),
            reason: format!("malformed tools/call result: {e}"),
        })
    }

    fn describe_last_error(&self) -> Option<String> {
        let tail = self.stderr_tail.lock().ok()?;
        if tail.is_empty() {
            None
        } else {
            Some(tail.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }

    async fn close(&self) {
        self.transport.close().await;

        let Some(mut child) = self.process.lock().await.take() else {
            return;
        };

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.name, %status, "tool server exited");
            }
            _ => {
                tracing::warn!(server = %self.name, "tool server did not exit in time, killing");
                let _ = child.kill().await;
            }
        }
    }
}

/// Production connector: launches each descriptor as a stdio child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioConnector;

#[async_trait]
impl SessionConnector for StdioConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<dyn ToolProvider>, McpError> {
        let session = StdioSession::spawn(descriptor).await?;
        Ok(Arc::new(session))
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// Perform `initialize` → `notifications/initialized` → `tools/list`.
async fn handshake(
    transport: &StdioTransport,
    server_name: &str,
) -> Result<Vec<ToolDefinition>, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "toolrelay",
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let result = extract_result(transport.request("initialize", Some(params)).await?)?;
    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::TransportError {
            server: server_name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    tracing::debug!(
        server = server_name,
        protocol = ?init.protocol_version,
        server_info = ?init.server_info.as_ref().and_then(|i| i.name.as_deref()),
        "initialize handshake complete"
    );

    transport.notify("notifications/initialized", None).await?;

    let tools = match init.tools {
        Some(tools) => tools,
        None => list_all_tools(transport, server_name).await?,
    };

    Ok(tools.into_iter().map(ToolDefinition::normalized).collect())
}

/// Fetch every page of `tools/list`.
async fn list_all_tools(
    transport: &StdioTransport,
    server_name: &str,
) -> Result<Vec<ToolDefinition>, McpError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_LIST_PAGES {
        let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
        let result = extract_result(transport.request("tools/list", params).await?)?;
        let page: ListToolsResult =
            serde_json::from_value(result).map_err(|e| McpError::TransportError {
                server: server_name.to_string(),
                reason: format!("failed to parse tools/list response: {e}"),
            })?;
        tools.extend(page.tools);
        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(tools),
        }
    }

    tracing::warn!(server = server_name, pages = MAX_LIST_PAGES, "tools/list pagination truncated");
    Ok(tools)
}

// ─── Stderr ──────────────────────────────────────────────────────────────────

/// Forward stderr lines to the log and keep the last few for diagnostics.
///
/// Draining continuously also keeps a chatty server from blocking on a full
/// stderr pipe.
fn spawn_stderr_drain(server: &str, stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let server = server.to_string();
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %server, line = %line, "tool server stderr");
            if let Ok(mut tail) = tail.lock() {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    });
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(tail: &Mutex<VecDeque<String>>) -> String {
    let joined = match tail.lock() {
        Ok(tail) => tail.iter().cloned().collect::<Vec<_>>().join(" | "),
        Err(_) => String::new(),
    };
    if joined.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", joined.trim())
    }
}

fn connection_error(server: &str, reason: String) -> McpError {
    McpError::ToolServerConnection {
        server: server.to_string(),
        reason,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_stderr_suffix_empty() {
        let tail = Mutex::new(VecDeque::new());
        assert_eq!(format_stderr_suffix(&tail), "");
    }

    #[test]
    fn test_stderr_suffix_joins_lines() {
        let tail = Mutex::new(VecDeque::from(vec![
            "Traceback".to_string(),
            "ImportError: torch".to_string(),
        ]));
        assert_eq!(
            format_stderr_suffix(&tail),
            " | stderr: Traceback | ImportError: torch"
        );
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_is_connection_error() {
        let descriptor = ServerDescriptor {
            name: "ghost".into(),
            command: "/nonexistent/toolrelay-test-binary".into(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
            enabled: true,
        };
        let err = StdioSession::spawn(&descriptor).await.err().unwrap();
        match err {
            McpError::ToolServerConnection { server, reason } => {
                assert_eq!(server, "ghost");
                assert!(reason.contains("spawn failed"));
            }
            other => panic!("expected ToolServerConnection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handshake_uses_inline_catalog() {
        let (to_server, from_client) = tokio::io::duplex(4096);
        let (mut to_client, from_server) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut lines = tokio::io::BufReader::new(from_client).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: serde_json::Value = serde_json::from_str(&line).unwrap();
                let Some(id) = req.get("id").cloned() else {
                    continue;
                };
                let reply = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"tools": [{"name": "ping", "description": "Ping"}]},
                });
                to_client.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
            }
        });

        let transport = StdioTransport::new("inline", to_server, from_server);
        let tools = handshake(&transport, "inline").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "ping");
        assert_eq!(tools[0].parameters["type"], "object");
    }

    #[tokio::test]
    async fn test_handshake_paginates_tools_list() {
        let (to_server, from_client) = tokio::io::duplex(8192);
        let (mut to_client, from_server) = tokio::io::duplex(8192);

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut lines = tokio::io::BufReader::new(from_client).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: serde_json::Value = serde_json::from_str(&line).unwrap();
                let Some(id) = req.get("id").cloned() else {
                    continue;
                };
                let result = match req["method"].as_str().unwrap() {
                    "initialize" => serde_json::json!({"protocolVersion": PROTOCOL_VERSION}),
                    "tools/list" if req["params"]["cursor"] == "p2" => {
                        serde_json::json!({"tools": [{"name": "b"}]})
                    }
                    "tools/list" => serde_json::json!({"tools": [{"name": "a"}], "nextCursor": "p2"}),
                    _ => serde_json::json!({}),
                };
                let reply = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result});
                to_client.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
            }
        });

        let transport = StdioTransport::new("paged", to_server, from_server);
        let tools = handshake(&transport, "paged").await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    /// Whether `pid` still names a live (not zombie) process.
    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .is_some_and(|state| state != 'Z' && state != 'X'),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancelled_spawn_kills_child() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("pid");
        let descriptor = ServerDescriptor {
            name: "mute".into(),
            command: "sh".into(),
            args: vec![
                "-c".into(),
                r#"echo $$ > "$0"; exec sleep 60"#.into(),
                pid_file.display().to_string(),
            ],
            env: HashMap::new(),
            cwd: None,
            enabled: true,
        };

        // The server never answers `initialize`, so the handshake hangs
        // until the outer future is dropped.
        let outcome =
            tokio::time::timeout(Duration::from_millis(500), StdioSession::spawn(&descriptor)).await;
        assert!(outcome.is_err(), "handshake should still be pending");

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut alive = true;
        for _ in 0..40 {
            alive = process_alive(pid);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive, "tool server {pid} outlived its cancelled session");
    }
}
