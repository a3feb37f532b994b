use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One tool invocation recovered from model text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedToolCall {
    pub name: String,
    /// Argument tree in document order
    pub arguments: Map<String, Value>,
}

impl ExtractedToolCall {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    /// Arguments as JSON text, the way event-stream clients expect them
    pub fn arguments_json(&self) -> String {
        Value::Object(self.arguments.clone()).to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Failed to parse tool call: {0}")]
    ParseError(String),

    #[error("Invalid JSON arguments: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Raised by the bounded buffer when an append would exceed its limit
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Tool call buffer limit of {limit} bytes exceeded ({attempted} bytes requested)")]
pub struct BufferOverflow {
    pub limit: usize,
    pub attempted: usize,
}
