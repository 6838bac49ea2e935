//! Tool-selection prompts for models without native function calling
//!
//! [`render_tool_prompt`] turns the server's tool descriptors into a plain
//! text block asking the model to answer with a single JSON object, and
//! [`parse_tool_selection`] pulls that object back out of the reply.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::tools::ToolDescriptor;
use crate::{Error, Result};

/// The tool call a model picked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSelection {
    pub name: String,
    pub arguments: Map<String, JsonValue>,
}

impl ToolSelection {
    pub fn arguments_value(&self) -> JsonValue {
        JsonValue::Object(self.arguments.clone())
    }
}

/// Render the full prompt: rules, instructions, tools, request, format.
///
/// Pure and deterministic: parameters are listed in name order.
pub fn render_tool_prompt(
    instructions: Option<&str>,
    tools: &[ToolDescriptor],
    user_request: &str,
) -> String {
    let mut prompt = String::new();

    prompt.push_str("IMPORTANT RULES FOR TOOL SELECTION:\n");
    prompt.push_str("1. You must include ALL required parameters in your response\n");
    prompt.push_str("2. Use default values for optional parameters unless the user asks otherwise\n");
    prompt.push_str("3. Return a valid JSON object with exactly these fields:\n");
    prompt.push_str("   - name: the selected tool name\n");
    prompt.push_str("   - arguments: an object containing ALL required parameters\n\n");

    if let Some(instructions) = instructions.filter(|s| !s.trim().is_empty()) {
        let _ = write!(prompt, "SYSTEM INSTRUCTIONS:\n{}\n\n", instructions.trim());
    }

    prompt.push_str("AVAILABLE TOOLS:\n");
    for tool in tools {
        prompt.push_str(&describe_tool(tool));
    }

    let _ = write!(prompt, "\nUSER REQUEST:\n{}\n", user_request.trim());

    prompt.push_str("\nRESPONSE REQUIREMENTS:\n");
    prompt.push_str("1. Return ONLY a JSON object\n");
    prompt.push_str("2. No additional text before or after the JSON\n");
    prompt.push_str("3. Include all required parameters\n");
    prompt.push_str("4. Use default values unless specified\n");
    prompt.push_str("Example format:\n");
    prompt.push_str("{\n  \"name\": \"tool_name\",\n  \"arguments\": {\n    \"param1\": \"value1\"\n  }\n}");

    prompt
}

/// One tool's block within the prompt
pub fn describe_tool(tool: &ToolDescriptor) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\nTool: {}", tool.name);
    let description = if tool.description.is_empty() {
        "(no description)"
    } else {
        tool.description.as_str()
    };
    let _ = writeln!(out, "Description: {}", description);

    if tool.input_schema.properties.is_empty() {
        out.push_str("Parameters: none\n");
        return out;
    }

    out.push_str("Parameters:\n");
    for (name, details) in &tool.input_schema.properties {
        let description = details
            .get("description")
            .and_then(JsonValue::as_str)
            .unwrap_or("(no description)");
        let param_type = match details.get("type") {
            Some(JsonValue::String(t)) => t.clone(),
            Some(JsonValue::Array(types)) => types
                .iter()
                .filter_map(JsonValue::as_str)
                .collect::<Vec<_>>()
                .join(" | "),
            _ => "any".to_string(),
        };
        let default = match details.get("default") {
            None | Some(JsonValue::Null) => String::new(),
            Some(JsonValue::String(s)) => format!(" (default: {})", s),
            Some(other) => format!(" (default: {})", other),
        };
        let status = if tool.input_schema.is_required(name) {
            "REQUIRED"
        } else {
            "Optional"
        };

        let _ = writeln!(out, "  - {}: {}", name, description);
        let _ = writeln!(out, "    Type: {}{}", param_type, default);
        let _ = writeln!(out, "    Status: {}", status);
    }
    out
}

/// Extract a `{name, arguments}` selection from a model reply.
///
/// The whole reply is tried as JSON first, then the span from the first
/// `{` to the last `}` (models like to wrap JSON in prose or code fences).
pub fn parse_tool_selection(reply: &str) -> Result<ToolSelection> {
    let value = match serde_json::from_str::<JsonValue>(reply.trim()) {
        Ok(value) => value,
        Err(_) => {
            let span = match (reply.find('{'), reply.rfind('}')) {
                (Some(start), Some(end)) if start < end => &reply[start..=end],
                _ => {
                    return Err(Error::InvalidSelection(
                        "reply contains no JSON object".to_string(),
                    ))
                }
            };
            serde_json::from_str(span).map_err(|e| {
                Error::InvalidSelection(format!("could not parse JSON in reply: {}", e))
            })?
        }
    };

    let JsonValue::Object(mut object) = value else {
        return Err(Error::InvalidSelection("reply is not a JSON object".to_string()));
    };

    let name = match object.remove("name") {
        Some(JsonValue::String(name)) if !name.trim().is_empty() => name,
        _ => {
            return Err(Error::InvalidSelection(
                "missing or empty \"name\"".to_string(),
            ))
        }
    };

    let arguments = match object.remove("arguments") {
        Some(JsonValue::Object(arguments)) => arguments,
        // Some models double-encode the arguments
        Some(JsonValue::String(encoded)) => match serde_json::from_str(&encoded) {
            Ok(JsonValue::Object(arguments)) => arguments,
            _ => {
                return Err(Error::InvalidSelection(
                    "\"arguments\" is not an object".to_string(),
                ))
            }
        },
        _ => {
            return Err(Error::InvalidSelection(
                "missing or non-object \"arguments\"".to_string(),
            ))
        }
    };

    Ok(ToolSelection { name, arguments })
}
