//! Line-JSON framing: Ollama chat responses
//!
//! Every line is a complete JSON object. Content lives under `message.content` and completion is
//! signalled by `done: true` on the last object, which also carries the evaluation counts.

use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatResponseLine {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub message: ResponseMessage,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(default = "assistant_role")]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thinking: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OllamaToolCall>>,
}

impl Default for ResponseMessage {
    fn default() -> Self {
        Self {
            role: assistant_role(),
            content: String::new(),
            thinking: String::new(),
            tool_calls: None,
        }
    }
}

fn assistant_role() -> String {
    "assistant".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaToolCall {
    pub function: OllamaFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaFunction {
    pub name: String,
    /// Structured object, unlike the JSON text used by event streams
    pub arguments: Value,
}

/// Frame a JSON payload as one line
pub fn encode_line(payload: &Value) -> String {
    format!("{payload}\n")
}

/// Decode one response line into the neutral chunk form
pub fn decode_chunk(value: &Value) -> Result<StreamChunk, WireError> {
    if let Some(error) = value.get("error") {
        let message = error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(WireError::Backend(message));
    }

    let line: ChatResponseLine = serde_json::from_value(value.clone())?;
    Ok(line.into_stream_chunk())
}

/// Encode a neutral chunk as a response line.
///
/// Returns `None` when the chunk carries nothing a line can express, such as a bare finish
/// reason on a chunk that is not the final one.
pub fn encode_chunk(chunk: &StreamChunk, meta: &StreamMeta) -> Option<Value> {
    if chunk.content.is_none() && chunk.tool_calls.is_empty() && !chunk.done {
        return None;
    }
    let line = ChatResponseLine::from_stream_chunk(chunk, meta);
    serde_json::to_value(line).ok()
}

impl ChatResponseLine {
    pub fn into_stream_chunk(self) -> StreamChunk {
        let usage = match (self.prompt_eval_count, self.eval_count) {
            (None, None) => None,
            (prompt, eval) => Some(Usage {
                input_tokens: prompt.unwrap_or(0),
                output_tokens: eval.unwrap_or(0),
            }),
        };

        let tool_calls = self
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(index, call)| StreamToolCall {
                index: index as u32,
                id: None,
                name: Some(call.function.name),
                arguments: call.function.arguments.to_string(),
            })
            .collect();

        StreamChunk {
            content: Some(self.message.content),
            role: Some(self.message.role),
            finish_reason: if self.done {
                Some(self.done_reason.unwrap_or_else(|| "stop".to_string()))
            } else {
                None
            },
            usage,
            model: Some(self.model).filter(|model| !model.is_empty()),
            id: None,
            tool_calls,
            done: self.done,
        }
    }

    pub fn from_stream_chunk(chunk: &StreamChunk, meta: &StreamMeta) -> Self {
        let tool_calls = if chunk.tool_calls.is_empty() {
            None
        } else {
            Some(
                chunk
                    .tool_calls
                    .iter()
                    .map(|call| OllamaToolCall {
                        function: OllamaFunction {
                            name: call.name.clone().unwrap_or_default(),
                            // Fall back to an empty object for argument fragments that are not
                            // complete JSON
                            arguments: serde_json::from_str(&call.arguments)
                                .unwrap_or_else(|_| Value::Object(Default::default())),
                        },
                    })
                    .collect(),
            )
        };

        let (prompt_eval_count, eval_count) = match (chunk.done, chunk.usage) {
            (true, Some(usage)) => (Some(usage.input_tokens), Some(usage.output_tokens)),
            (true, None) => (Some(0), Some(0)),
            (false, _) => (None, None),
        };

        ChatResponseLine {
            model: chunk.model.clone().unwrap_or_else(|| meta.model.clone()),
            created_at: meta.created_at(),
            message: ResponseMessage {
                role: chunk.role.clone().unwrap_or_else(assistant_role),
                content: chunk.content.clone().unwrap_or_default(),
                thinking: String::new(),
                tool_calls,
            },
            done: chunk.done,
            done_reason: if chunk.done {
                Some(
                    chunk
                        .finish_reason
                        .clone()
                        .unwrap_or_else(|| "stop".to_string()),
                )
            } else {
                None
            },
            prompt_eval_count,
            eval_count,
        }
    }
}
