//! MCP protocol layer: a low-level tool server, the memory-stream bridge
//! that runs it over message transports, the transport client with its
//! pending-request table, and the FastMCP streamable-HTTP surface.

pub mod bridge;
pub mod client;
pub mod http;
pub mod server;
pub mod types;

pub use bridge::McpMemoryStreamBridge;
pub use client::McpClient;
pub use http::{FastMcpHttpBridge, FastMcpHttpClient};
pub use server::McpServer;
pub use types::{CallToolResult, McpTool, ToolContent};
