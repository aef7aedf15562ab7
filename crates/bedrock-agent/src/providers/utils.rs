use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::base::{Completion, StopReason, Usage};
use super::errors::ProviderError;
use crate::models::content::Content;
use crate::models::message::{Message, MessageContent, ToolResultStatus};
use crate::models::tool::Tool;

lazy_static! {
    static ref INVALID_NAME_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
    static ref VALID_NAME: Regex = Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").unwrap();
}

/// Convert internal Message format to the Bedrock Converse message specification
pub fn messages_to_converse_spec(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| {
            let content: Vec<Value> = message
                .content
                .iter()
                .map(|content| match content {
                    MessageContent::Text(text) => json!({ "text": text.text }),
                    MessageContent::ToolUse(tool_use) => json!({
                        "toolUse": {
                            "toolUseId": tool_use.id,
                            "name": tool_use.name,
                            "input": tool_use.input,
                        }
                    }),
                    MessageContent::ToolResult(result) => {
                        let blocks: Vec<Value> = result
                            .content
                            .iter()
                            .map(|item| match item {
                                Content::Text(text) => json!({ "text": text.text }),
                            })
                            .collect();
                        let status = match result.status {
                            ToolResultStatus::Success => "success",
                            ToolResultStatus::Error => "error",
                        };
                        json!({
                            "toolResult": {
                                "toolUseId": result.tool_use_id,
                                "content": blocks,
                                "status": status,
                            }
                        })
                    }
                })
                .collect();

            json!({
                "role": message.role.as_str(),
                "content": content,
            })
        })
        .collect()
}

/// Convert internal Tool format to the Converse toolConfig, with automatic tool choice
pub fn tools_to_converse_spec(tools: &[Tool]) -> Value {
    let specs: Vec<Value> = tools
        .iter()
        .map(|tool| {
            json!({
                "toolSpec": {
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": { "json": object_schema(&tool.input_schema) },
                }
            })
        })
        .collect();

    json!({
        "tools": specs,
        "toolChoice": { "auto": {} },
    })
}

/// Converse rejects tool schemas without a top level type, so default it to object
fn object_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) if map.contains_key("type") => schema.clone(),
        Value::Object(map) => {
            let mut map = map.clone();
            map.insert("type".to_string(), json!("object"));
            Value::Object(map)
        }
        _ => {
            let mut map = Map::new();
            map.insert("type".to_string(), json!("object"));
            map.insert("properties".to_string(), json!({}));
            Value::Object(map)
        }
    }
}

/// Convert a Converse API response into a Completion
pub fn converse_response_to_completion(response: &Value) -> Result<Completion, ProviderError> {
    let stop_reason = response
        .get("stopReason")
        .and_then(Value::as_str)
        .map(StopReason::from_wire)
        .ok_or_else(|| ProviderError::MalformedResponse("missing stopReason".to_string()))?;

    let blocks = response
        .pointer("/output/message/content")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            ProviderError::MalformedResponse("missing output.message.content".to_string())
        })?;

    let mut message = Message::assistant();
    for block in blocks {
        if let Some(text) = block.get("text").and_then(Value::as_str) {
            message = message.with_text(text);
        } else if let Some(tool_use) = block.get("toolUse") {
            let id = tool_use
                .get("toolUseId")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ProviderError::MalformedResponse("toolUse block without toolUseId".to_string())
                })?;
            let name = tool_use.get("name").and_then(Value::as_str).ok_or_else(|| {
                ProviderError::MalformedResponse(format!("toolUse block {} without name", id))
            })?;
            let input = tool_use.get("input").cloned().unwrap_or_else(|| json!({}));
            message = message.with_tool_use(id, name, input);
        } else {
            debug!(target: "bedrock", block = %block, "Skipping unsupported content block");
        }
    }

    Ok(Completion {
        message,
        stop_reason,
        usage: get_usage(response),
    })
}

/// Token usage is informational, so a missing or partial usage object is not an error
pub fn get_usage(response: &Value) -> Usage {
    let count = |key: &str| {
        response
            .pointer(&format!("/usage/{}", key))
            .and_then(Value::as_i64)
            .and_then(|v| i32::try_from(v).ok())
    };

    let input_tokens = count("inputTokens");
    let output_tokens = count("outputTokens");
    let total_tokens = count("totalTokens").or_else(|| match (input_tokens, output_tokens) {
        (Some(input), Some(output)) => Some(input + output),
        _ => None,
    });

    Usage::new(input_tokens, output_tokens, total_tokens)
}

/// Make a tool name acceptable to the Converse API
pub fn sanitize_tool_name(name: &str) -> String {
    let sanitized = INVALID_NAME_CHARS.replace_all(name, "_").to_string();
    if sanitized.len() > 64 {
        sanitized.chars().take(64).collect()
    } else {
        sanitized
    }
}

pub fn is_valid_tool_name(name: &str) -> bool {
    VALID_NAME.is_match(name)
}
