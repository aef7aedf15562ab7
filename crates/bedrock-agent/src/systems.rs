use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::errors::ToolError;
use crate::models::tool::Tool;

pub mod mcp;

/// How to launch a tool provider process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

impl SystemConfig {
    pub fn new<N: Into<String>, C: Into<String>>(name: N, command: C) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// A source of tools the agent can route calls to
#[async_trait]
pub trait System: Send + Sync {
    /// Get the name of the system
    fn name(&self) -> &str;

    /// Current tool descriptors. Called on every query, so a system may change its tools
    /// between queries.
    async fn list_tools(&self) -> Result<Vec<Tool>, ToolError>;

    /// Execute one tool and return its raw result
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError>;

    /// Release the system's resources. Must be safe to call more than once.
    async fn shutdown(&self);
}

/// Flatten a raw tool result into the text handed back to the model.
///
/// A non-empty array yields its first element's `text` field when there is one.
/// Anything else is stringified: bare strings as-is, other values as compact JSON.
pub fn normalize_tool_output(raw: &Value) -> String {
    if let Some(first) = raw.as_array().and_then(|items| items.first()) {
        if let Some(text) = first.get("text").and_then(Value::as_str) {
            return text.to_string();
        }
    }

    match raw {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
