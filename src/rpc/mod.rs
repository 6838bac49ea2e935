//! JSON-RPC 2.0 over a tool server's stdio
//!
//! This module handles framing, message classification, and request/response
//! correlation for the channel to a spawned MCP tool server.

mod client;
pub mod framing;
pub mod message;

pub(crate) use client::ChannelCloser;
pub use client::{ChannelState, ClientOptions, StdioRpcClient, DEFAULT_REQUEST_TIMEOUT};
pub use framing::{FrameDecoder, Framing, MAX_FRAME_SIZE};
pub use message::{Incoming, Notification, Outcome, Request, Response, RpcError};
