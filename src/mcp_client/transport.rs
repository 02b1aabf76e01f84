//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with tool server child processes:
//! - Writing JSON-RPC requests to stdin
//! - Reading JSON-RPC responses from stdout
//! - Line-delimited JSON protocol (one JSON object per line)

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::{JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

struct Pipes {
    /// `None` once the transport has been closed.
    writer: Option<BoxedWriter>,
    reader: BoxedReader,
}

/// Bi-directional JSON-RPC transport over a child process's stdio.
///
/// A request holds the pipe lock from write until its response is read, so
/// concurrent callers on one session are serialised and never consume each
/// other's responses.
pub struct StdioTransport {
    server_name: String,
    pipes: Mutex<Pipes>,
}

impl StdioTransport {
    /// Create a new transport from a writer (child stdin) and reader (child stdout).
    pub fn new<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            server_name: server_name.to_string(),
            pipes: Mutex::new(Pipes {
                writer: Some(Box::new(writer)),
                reader: BufReader::new(reader),
            }),
        }
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// Lines that are not JSON-RPC responses (server log output, notifications,
    /// responses to other ids) are skipped.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let line = self.encode(&req)?;

        let mut pipes = self.pipes.lock().await;
        self.write_line(&mut pipes, &line).await?;

        let mut line_buf = String::new();
        loop {
            line_buf.clear();
            let bytes_read = pipes
                .reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| self.transport_error(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(self.transport_error(
                    "server stdout closed (process may have exited)".into(),
                ));
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == Some(id) => return Ok(resp),
                Ok(_) => continue,
                Err(_) => {
                    tracing::trace!(server = %self.server_name, line = %trimmed, "skipping non-JSON-RPC line");
                    continue;
                }
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }
        let line = self.encode(&notification)?;

        let mut pipes = self.pipes.lock().await;
        self.write_line(&mut pipes, &line).await
    }

    /// Close the write half. Well-behaved servers exit on stdin EOF.
    ///
    /// Idempotent.
    pub async fn close(&self) {
        let mut pipes = self.pipes.lock().await;
        if let Some(mut writer) = pipes.writer.take() {
            let _ = writer.shutdown().await;
        }
    }

    fn encode<T: serde::Serialize>(&self, message: &T) -> Result<String, McpError> {
        let mut json = serde_json::to_string(message)
            .map_err(|e| self.transport_error(format!("failed to serialize message: {e}")))?;
        json.push('\n');
        Ok(json)
    }

    async fn write_line(&self, pipes: &mut Pipes, line: &str) -> Result<(), McpError> {
        let writer = pipes.writer.as_mut().ok_or_else(|| McpError::SessionClosed {
            server: self.server_name.clone(),
        })?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            id: Some(1),
            result: None,
            error: Some(super::super::types::JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result(resp).unwrap_err() {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            id: Some(1),
            result: None,
            error: None,
        };
        assert!(matches!(
            extract_result(resp).unwrap_err(),
            McpError::ServerError { .. }
        ));
    }

    /// Echo server: answers each request with its own method name, after
    /// emitting a log line and a notification that the transport must skip.
    async fn run_echo_server(client_out: tokio::io::DuplexStream, mut client_in: tokio::io::DuplexStream) {
        let mut lines = BufReader::new(client_out).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let req: serde_json::Value = serde_json::from_str(&line).unwrap();
            let Some(id) = req.get("id").cloned() else {
                continue;
            };
            let noise = "server booting...\n{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\"}\n";
            let reply = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {"method": req["method"]}});
            client_in.write_all(noise.as_bytes()).await.unwrap();
            client_in
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_request_skips_noise_and_matches_id() {
        let (to_server, from_client) = tokio::io::duplex(4096);
        let (to_client, from_server) = tokio::io::duplex(4096);
        tokio::spawn(run_echo_server(from_client, to_client));

        let transport = StdioTransport::new("echo", to_server, from_server);
        let resp = transport.request("tools/list", None).await.unwrap();
        let result = extract_result(resp).unwrap();
        assert_eq!(result["method"], "tools/list");
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_their_own_responses() {
        let (to_server, from_client) = tokio::io::duplex(4096);
        let (to_client, from_server) = tokio::io::duplex(4096);
        tokio::spawn(run_echo_server(from_client, to_client));

        let transport = StdioTransport::new("echo", to_server, from_server);
        let (a, b) = tokio::join!(transport.request("alpha", None), transport.request("beta", None));
        assert_eq!(extract_result(a.unwrap()).unwrap()["method"], "alpha");
        assert_eq!(extract_result(b.unwrap()).unwrap()["method"], "beta");
    }

    #[tokio::test]
    async fn test_closed_stdout_is_transport_error() {
        let (to_server, _from_client) = tokio::io::duplex(64);
        let (to_client, from_server) = tokio::io::duplex(64);
        drop(to_client);

        let transport = StdioTransport::new("dead", to_server, from_server);
        let err = transport.request("initialize", None).await.unwrap_err();
        assert!(matches!(err, McpError::TransportError { .. }));
    }

    #[tokio::test]
    async fn test_request_after_close_is_session_closed() {
        let (to_server, _from_client) = tokio::io::duplex(64);
        let (_to_client, from_server) = tokio::io::duplex(64);

        let transport = StdioTransport::new("gone", to_server, from_server);
        transport.close().await;
        transport.close().await;
        let err = transport.request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, McpError::SessionClosed { .. }));
    }
}
