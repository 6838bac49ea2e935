//! Error types for mcp-stdio-client

use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No matching response arrived before the deadline
    #[error("Request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// Malformed frame, invalid JSON-RPC message or unexpected response id
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The tool server exited or one of its streams closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// The response carried an `error` member
    #[error("Remote error{}: {message}", code_suffix(.code))]
    Remote {
        code: Option<i64>,
        message: String,
        data: Option<JsonValue>,
    },

    #[error("Failed to spawn tool server: {0}")]
    Spawn(String),

    #[error("Tool server startup failed: {0}")]
    Startup(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid tool selection: {0}")]
    InvalidSelection(String),
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub fn is_channel_closed(&self) -> bool {
        matches!(self, Error::ChannelClosed(_))
    }
}

fn code_suffix(code: &Option<i64>) -> String {
    code.map(|c| format!(" {}", c)).unwrap_or_default()
}

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let timeout = Error::Timeout {
            method: "tools/list".to_string(),
            timeout: Duration::from_millis(5),
        };
        assert_eq!(timeout.to_string(), "Request 'tools/list' timed out after 5ms");
        assert!(timeout.is_timeout());

        let remote = Error::Remote {
            code: Some(-32601),
            message: "Method not found".to_string(),
            data: None,
        };
        assert_eq!(remote.to_string(), "Remote error -32601: Method not found");

        let remote_no_code = Error::Remote {
            code: None,
            message: "collection missing".to_string(),
            data: None,
        };
        assert_eq!(remote_no_code.to_string(), "Remote error: collection missing");

        let closed = Error::ChannelClosed("stdout EOF".to_string());
        assert!(closed.is_channel_closed());
        assert!(!closed.is_timeout());
    }
}
