//! mcp-stdio-client - JSON-RPC client for MCP tool servers over stdio
//!
//! Spawns a tool server as a child process and talks JSON-RPC 2.0 to it over
//! its stdin/stdout, correlating responses to requests by id so that many
//! calls can be in flight at once.
//!
//! ```ignore
//! use mcp_stdio_client::{config, StdioRpcClient};
//!
//! let config = config::read_config()?;
//! let client = StdioRpcClient::spawn(&config).await?;
//! for tool in client.list_tools().await? {
//!     println!("{}: {}", tool.name, tool.description);
//! }
//! let result = client.call_tool("get_system_time", serde_json::json!({})).await?;
//! println!("{}", result.text());
//! ```

pub mod config;
pub mod process;
pub mod prompt;
pub mod rpc;
pub mod supervisor;
pub mod tools;

mod error;
mod utils;

pub use config::ToolServerConfig;
pub use error::{Error, Result};
pub use rpc::{ChannelState, ClientOptions, Framing, StdioRpcClient};
pub use supervisor::ToolServer;
pub use tools::{ToolDescriptor, ToolResult};
