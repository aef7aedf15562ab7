use std::time::Duration;
use thiserror::Error;

use crate::providers::errors::ProviderError;
use crate::retry::Retryable;

/// A tool provider could not be brought up. Fatal at startup.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to start system '{system}': {message}")]
    Spawn { system: String, message: String },

    #[error("System '{system}' failed its initialization handshake: {message}")]
    Handshake { system: String, message: String },

    #[error("Failed to list tools from system '{system}': {message}")]
    Discovery { system: String, message: String },

    #[error("System '{system}' offers a tool with an unusable name: '{name}'")]
    InvalidToolName { system: String, name: String },

    #[error("Tool '{name}' is provided by both '{first}' and '{second}'")]
    DuplicateTool {
        name: String,
        first: String,
        second: String,
    },
}

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tool execution failed: {0}")]
    Execution(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Tool call timed out after {0:?}")]
    Timeout(Duration),
}

impl Retryable for ToolError {
    fn is_retryable(&self) -> bool {
        !matches!(self, ToolError::NotFound(_))
    }

    fn timed_out(after: Duration) -> Self {
        ToolError::Timeout(after)
    }
}

/// Failures that abort a whole query
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Model endpoint failed after {attempts} attempt(s): {source}")]
    Endpoint {
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("Malformed response from model endpoint: {0}")]
    MalformedResponse(String),

    #[error("Query cancelled")]
    Cancelled,
}

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum TranscriptError {
    #[error("Failed to access transcript file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid transcript: {0}")]
    Json(#[from] serde_json::Error),
}
