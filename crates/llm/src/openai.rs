//! Event-stream framing: OpenAI-compatible chat completion chunks
//!
//! Each event is a `data: {json}` line followed by a blank line. The stream ends with the
//! literal `data: [DONE]` sentinel rather than a flag inside the JSON.

use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DONE_MARKER: &str = "[DONE]";
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

fn chunk_object() -> String {
    "chat.completion.chunk".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default = "chunk_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<OpenAIUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FunctionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct OpenAIUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl From<OpenAIUsage> for Usage {
    fn from(usage: OpenAIUsage) -> Self {
        Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }
    }
}

impl From<Usage> for OpenAIUsage {
    fn from(usage: Usage) -> Self {
        OpenAIUsage {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            total_tokens: usage.input_tokens + usage.output_tokens,
        }
    }
}

/// One meaningful line of an event stream
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Data(String),
    Done,
}

/// Parse one line of an event stream. Comments, `event:`/`id:` fields and blank
/// separator lines yield `None`.
pub fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data).trim_end();
    if data.is_empty() {
        return None;
    }
    if data == DONE_MARKER {
        return Some(SseEvent::Done);
    }
    Some(SseEvent::Data(data.to_string()))
}

/// Frame a JSON payload as one event
pub fn encode_sse_frame(payload: &Value) -> String {
    format!("data: {payload}\n\n")
}

/// Decode an event payload into the neutral chunk form
pub fn decode_chunk(value: &Value) -> Result<StreamChunk, WireError> {
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(WireError::Backend(message));
    }

    let chunk: ChatCompletionChunk = serde_json::from_value(value.clone())?;
    Ok(chunk.into_stream_chunk())
}

/// Encode a neutral chunk as an event payload, or `None` if it carries neither a choice nor usage
pub fn encode_chunk(chunk: &StreamChunk, meta: &StreamMeta) -> Option<Value> {
    let completion = ChatCompletionChunk::from_stream_chunk(chunk, meta);
    if completion.choices.is_empty() && completion.usage.is_none() {
        return None;
    }
    serde_json::to_value(completion).ok()
}

impl ChatCompletionChunk {
    pub fn into_stream_chunk(self) -> StreamChunk {
        let mut chunk = StreamChunk {
            model: Some(self.model).filter(|model| !model.is_empty()),
            id: Some(self.id).filter(|id| !id.is_empty()),
            usage: self.usage.map(Usage::from),
            ..Default::default()
        };

        // Only the first choice is relevant for n=1 streams
        if let Some(choice) = self.choices.into_iter().next() {
            chunk.content = choice.delta.content;
            chunk.role = choice.delta.role;
            chunk.finish_reason = choice.finish_reason;
            chunk.tool_calls = choice
                .delta
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|call| {
                    let function = call.function.unwrap_or_default();
                    StreamToolCall {
                        index: call.index,
                        id: call.id,
                        name: function.name,
                        arguments: function.arguments.unwrap_or_default(),
                    }
                })
                .collect();
        }

        chunk
    }

    pub fn from_stream_chunk(chunk: &StreamChunk, meta: &StreamMeta) -> Self {
        let tool_calls = if chunk.tool_calls.is_empty() {
            None
        } else {
            Some(
                chunk
                    .tool_calls
                    .iter()
                    .map(|call| ToolCallDelta {
                        index: call.index,
                        id: call.id.clone(),
                        call_type: call.id.as_ref().map(|_| "function".to_string()),
                        function: Some(FunctionDelta {
                            name: call.name.clone(),
                            arguments: Some(call.arguments.clone()),
                        }),
                    })
                    .collect(),
            )
        };

        let carries_choice = chunk.content.is_some()
            || chunk.role.is_some()
            || chunk.finish_reason.is_some()
            || tool_calls.is_some();

        // Usage-only chunks carry an empty choices array
        let choices = if carries_choice {
            vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: chunk.role.clone(),
                    content: chunk.content.clone(),
                    tool_calls,
                },
                finish_reason: chunk.finish_reason.clone(),
            }]
        } else {
            Vec::new()
        };

        ChatCompletionChunk {
            id: meta.id.clone(),
            object: chunk_object(),
            created: meta.created,
            model: chunk.model.clone().unwrap_or_else(|| meta.model.clone()),
            choices,
            usage: chunk.usage.map(OpenAIUsage::from),
        }
    }
}
