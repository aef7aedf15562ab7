use super::content::{Content, TextContent};
use super::role::Role;
use super::tool::ToolCall;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request from the model to invoke a named tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolResultStatus {
    Success,
    Error,
}

/// The answer to a ToolUse, matched by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: Vec<Content>,
    pub status: ToolResultStatus,
}

impl ToolResult {
    pub fn success<S: Into<String>, T: Into<String>>(tool_use_id: S, text: T) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: vec![Content::text(text)],
            status: ToolResultStatus::Success,
        }
    }

    pub fn error<S: Into<String>, T: Into<String>>(tool_use_id: S, text: T) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: vec![Content::text(text)],
            status: ToolResultStatus::Error,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ToolResultStatus::Error
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Content passed inside a message, which can be both simple content and tool content
pub enum MessageContent {
    Text(TextContent),
    ToolUse(ToolUse),
    ToolResult(ToolResult),
}

impl MessageContent {
    pub fn text<S: Into<String>>(text: S) -> Self {
        MessageContent::Text(TextContent { text: text.into() })
    }

    pub fn tool_use<S: Into<String>, N: Into<String>>(id: S, name: N, input: Value) -> Self {
        MessageContent::ToolUse(ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        })
    }

    pub fn tool_result(result: ToolResult) -> Self {
        MessageContent::ToolResult(result)
    }

    pub fn as_tool_use(&self) -> Option<&ToolUse> {
        if let MessageContent::ToolUse(ref tool_use) = self {
            Some(tool_use)
        } else {
            None
        }
    }

    pub fn as_tool_result(&self) -> Option<&ToolResult> {
        if let MessageContent::ToolResult(ref tool_result) = self {
            Some(tool_result)
        } else {
            None
        }
    }

    /// Get the text content if this is a TextContent variant
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(text) => Some(&text.text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A message to or from the model
pub struct Message {
    pub role: Role,
    pub created: i64,
    pub content: Vec<MessageContent>,
}

impl Message {
    /// Create a new user message with the current timestamp
    pub fn user() -> Self {
        Message {
            role: Role::User,
            created: Utc::now().timestamp(),
            content: Vec::new(),
        }
    }

    /// Create a new assistant message with the current timestamp
    pub fn assistant() -> Self {
        Message {
            role: Role::Assistant,
            created: Utc::now().timestamp(),
            content: Vec::new(),
        }
    }

    /// Add any MessageContent to the message
    pub fn with_content(mut self, content: MessageContent) -> Self {
        self.content.push(content);
        self
    }

    /// Add text content to the message
    pub fn with_text<S: Into<String>>(self, text: S) -> Self {
        self.with_content(MessageContent::text(text))
    }

    /// Add a tool use request to the message
    pub fn with_tool_use<S: Into<String>, N: Into<String>>(
        self,
        id: S,
        name: N,
        input: Value,
    ) -> Self {
        self.with_content(MessageContent::tool_use(id, name, input))
    }

    /// Add a tool result to the message
    pub fn with_tool_result(self, result: ToolResult) -> Self {
        self.with_content(MessageContent::tool_result(result))
    }

    /// Tool calls requested in this message, in the order they appear
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|content| content.as_tool_use())
            .map(ToolCall::from)
            .collect()
    }

    /// All text blocks in order, joined by newlines. None when there are no text blocks.
    pub fn joined_text(&self) -> Option<String> {
        let texts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|content| content.as_text())
            .collect();
        if texts.is_empty() {
            None
        } else {
            Some(texts.join("\n"))
        }
    }
}
