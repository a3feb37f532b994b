use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Streaming wire framing spoken by a client or a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// `data: {json}\n\n` events terminated by `data: [DONE]`
    EventStream,
    /// One JSON object per line, terminated by an object with `done: true`
    LineJson,
}

impl WireFormat {
    /// Content type announced before the first byte of a response in this framing
    pub fn content_type(&self) -> &'static str {
        match self {
            WireFormat::EventStream => "text/event-stream",
            WireFormat::LineJson => "application/x-ndjson",
        }
    }
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireFormat::EventStream => write!(f, "event-stream"),
            WireFormat::LineJson => write!(f, "line-json"),
        }
    }
}

/// Tracks token usage for a request/response pair
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy, Default)]
pub struct Usage {
    /// Number of tokens in the input (prompt)
    pub input_tokens: u32,
    /// Number of tokens in the output (completion)
    pub output_tokens: u32,
}

impl Usage {
    pub fn zero() -> Self {
        Usage {
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// A complete or partial function call carried by a stream chunk
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamToolCall {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    /// Arguments as JSON text; may be a fragment for incremental backends
    pub arguments: String,
}

/// Format-neutral unit both streaming framings are mapped to and from
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamChunk {
    pub content: Option<String>,
    pub role: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub model: Option<String>,
    /// Completion id reported by event-stream backends
    pub id: Option<String>,
    pub tool_calls: Vec<StreamToolCall>,
    /// Line-JSON completion flag
    pub done: bool,
}

impl StreamChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    /// Content delta, ignoring empty strings some backends send alongside role markers
    pub fn content_delta(&self) -> Option<&str> {
        self.content.as_deref().filter(|content| !content.is_empty())
    }

    /// Copy of this chunk with the content delta removed
    pub fn without_content(&self) -> Self {
        Self {
            content: None,
            ..self.clone()
        }
    }

    /// Whether the chunk carries anything besides a content delta
    pub fn has_signal(&self) -> bool {
        self.role.is_some()
            || self.finish_reason.is_some()
            || self.usage.is_some()
            || !self.tool_calls.is_empty()
    }
}

/// Identity shared by all chunks synthesized for one response stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMeta {
    pub id: String,
    pub model: String,
    /// Unix timestamp in seconds
    pub created: i64,
}

impl StreamMeta {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: generate_id("chatcmpl"),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
        }
    }

    /// RFC 3339 rendering of `created`, as line-JSON backends report it
    pub fn created_at(&self) -> String {
        chrono::DateTime::from_timestamp(self.created, 0)
            .unwrap_or_else(chrono::Utc::now)
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }
}

/// Random identifier like `call_3fJ9...`
pub fn generate_id(prefix: &str) -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("{prefix}_{suffix}")
}

/// Common error types for all backends
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Service error: {0}")]
    ServiceError(String),

    #[error("Service overloaded: {0}")]
    Overloaded(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Errors raised while decoding a single wire chunk
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid JSON in stream chunk: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("backend reported an error: {0}")]
    Backend(String),
}
