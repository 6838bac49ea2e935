//! MCP tool payloads and the tool-level client operations
//!
//! Maps `tools/list`, `tools/call` and the `initialize` handshake onto
//! typed request/response structures.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::rpc::StdioRpcClient;
use crate::Result;

/// MCP protocol revision sent in the handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Metadata for one tool advertised by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub input_schema: InputSchema,
}

/// JSON Schema-like description of a tool's arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(rename = "type", default = "default_schema_type")]
    pub schema_type: String,

    /// Parameter name -> schema (description, type, default, ...)
    #[serde(default)]
    pub properties: BTreeMap<String, JsonValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,

    /// Anything else the server put in the schema
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

fn default_schema_type() -> String {
    "object".to_string()
}

impl Default for InputSchema {
    fn default() -> Self {
        Self {
            schema_type: default_schema_type(),
            properties: BTreeMap::new(),
            required: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl InputSchema {
    pub fn is_required(&self, param: &str) -> bool {
        self.required.iter().any(|r| r == param)
    }
}

/// `tools/list` result
#[derive(Debug, Deserialize)]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<ToolDescriptor>,
}

/// `tools/call` parameters
#[derive(Debug, Serialize)]
struct CallToolParams<'a> {
    name: &'a str,
    arguments: &'a JsonValue,
}

/// One item of a tool's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    /// "text", "image", "resource", ...
    #[serde(rename = "type", default = "default_content_type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

fn default_content_type() -> String {
    "text".to_string()
}

/// `tools/call` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,

    /// Set when the tool itself failed (as opposed to the RPC)
    #[serde(default)]
    pub is_error: bool,

    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl ToolResult {
    /// All text content joined with newlines
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|item| item.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Client identification for the handshake
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientInfo<'a> {
    name: &'a str,
    version: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams<'a> {
    protocol_version: &'a str,
    capabilities: JsonValue,
    client_info: ClientInfo<'a>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// `initialize` result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,

    #[serde(default)]
    pub server_info: Option<ServerInfo>,

    #[serde(default)]
    pub capabilities: JsonValue,
}

impl StdioRpcClient {
    /// List the tools the server advertises
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let result: ListToolsResult = self.call_typed("tools/list", JsonValue::Object(Map::new())).await?;
        tracing::debug!("Server advertises {} tool(s)", result.tools.len());
        Ok(result.tools)
    }

    /// Invoke a tool by name
    pub async fn call_tool(&self, name: &str, arguments: JsonValue) -> Result<ToolResult> {
        tracing::info!("Calling tool {}", name);
        let params = CallToolParams {
            name,
            arguments: &arguments,
        };
        self.call_typed("tools/call", params).await
    }

    /// MCP handshake: `initialize`, then `notifications/initialized`
    pub async fn initialize(&self, client_name: &str) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION,
            capabilities: JsonValue::Object(Map::new()),
            client_info: ClientInfo {
                name: client_name,
                version: env!("CARGO_PKG_VERSION"),
            },
        };

        let result: InitializeResult = self.call_typed("initialize", params).await?;
        self.notify("notifications/initialized", None).await?;

        tracing::info!(
            "Tool server initialized: {} (protocol {})",
            result
                .server_info
                .as_ref()
                .map(|s| s.name.as_str())
                .unwrap_or("unknown"),
            result.protocol_version.as_deref().unwrap_or("unknown")
        );
        Ok(result)
    }
}
