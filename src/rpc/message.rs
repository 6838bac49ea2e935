//! JSON-RPC 2.0 message types
//!
//! Outgoing requests and notifications are plain serde structs. Incoming
//! frames are classified by which members are present, the same way the
//! tool server tells requests, responses and notifications apart.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::{Error, Result};

pub const JSONRPC_VERSION: &str = "2.0";

/// Error code sent back for server-initiated requests this client does not serve
pub const METHOD_NOT_FOUND: i64 = -32601;

/// JSON-RPC request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request<T = JsonValue> {
    pub jsonrpc: String,
    pub method: String,
    pub params: T,
    pub id: u64,
}

impl<T> Request<T> {
    pub fn new(id: u64, method: impl Into<String>, params: T) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// JSON-RPC notification (no id, no response expected)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<JsonValue>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl From<RpcError> for Error {
    fn from(err: RpcError) -> Self {
        Error::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Outgoing response to a server-initiated request
#[derive(Debug, Serialize)]
pub struct ErrorResponse<'a> {
    pub jsonrpc: &'static str,
    pub id: &'a JsonValue,
    pub error: RpcError,
}

/// Response payload: exactly one of result or error
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(JsonValue),
    Error(RpcError),
}

impl Outcome {
    pub fn into_result(self) -> Result<JsonValue> {
        match self {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(err) => Err(err.into()),
        }
    }
}

/// A response as read off the wire
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Raw id; only non-negative integers can match a pending call
    pub id: JsonValue,
    pub outcome: Outcome,
}

impl Response {
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_u64()
    }
}

/// Any message the tool server can emit
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response(Response),
    Notification(Notification),
    /// Server-initiated request (has both id and method)
    Request {
        id: JsonValue,
        method: String,
        params: Option<JsonValue>,
    },
}

impl Incoming {
    /// Classify one complete frame
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let value: JsonValue = serde_json::from_slice(frame)
            .map_err(|e| Error::Protocol(format!("frame is not valid JSON: {}", e)))?;

        let JsonValue::Object(mut map) = value else {
            return Err(Error::Protocol("message is not a JSON object".to_string()));
        };

        let method = match map.remove("method") {
            Some(JsonValue::String(method)) => Some(method),
            Some(other) => {
                return Err(Error::Protocol(format!("method is not a string: {}", other)));
            }
            None => None,
        };
        let id = map.remove("id").filter(|id| !id.is_null());

        match (id, method) {
            (Some(id), Some(method)) => Ok(Incoming::Request {
                id,
                method,
                params: map.remove("params"),
            }),
            (None, Some(method)) => Ok(Incoming::Notification(Notification {
                jsonrpc: JSONRPC_VERSION.to_string(),
                method,
                params: map.remove("params"),
            })),
            (Some(id), None) => Ok(Incoming::Response(Response {
                id,
                outcome: Self::outcome(&mut map)?,
            })),
            (None, None) => Err(Error::Protocol(
                "message has neither id nor method".to_string(),
            )),
        }
    }

    fn outcome(map: &mut Map<String, JsonValue>) -> Result<Outcome> {
        match (map.remove("result"), map.remove("error")) {
            (Some(result), None) => Ok(Outcome::Result(result)),
            (None, Some(error)) => {
                let error: RpcError = serde_json::from_value(error)
                    .map_err(|e| Error::Protocol(format!("malformed error object: {}", e)))?;
                Ok(Outcome::Error(error))
            }
            (Some(_), Some(_)) => Err(Error::Protocol(
                "response carries both result and error".to_string(),
            )),
            (None, None) => Err(Error::Protocol(
                "response carries neither result nor error".to_string(),
            )),
        }
    }
}
