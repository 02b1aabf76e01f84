//! MCP Client - JSON-RPC over stdio for tool-server sessions.
//!
//! This module handles:
//! - Locating and parsing the tool-server config file
//! - Spawning tool servers and running the MCP handshake
//! - Aggregating catalogs under qualified `server__tool` names
//! - Routing tool calls to the owning session
//! - Tearing every session down when an invocation ends

pub mod discovery;
pub mod errors;
pub mod manager;
pub mod provider;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

pub use discovery::{resolve_servers, select_servers, ServerSearch};
pub use errors::McpError;
pub use manager::{ConnectPolicy, SessionManager};
pub use provider::{SessionConnector, ToolProvider};
pub use registry::{qualify, ToolRegistry, ToolRoute, QUALIFIER};
pub use session::{StdioConnector, StdioSession};
pub use types::{CallToolResult, ServerConfig, ServerDescriptor, ToolCallOutcome, ToolDefinition};
