//! Field mapping between the two streaming chat formats
//!
//! The bridge hands every chunk that is not part of a tool call to a `ChunkConverter`. The
//! default `WireConverter` normalizes the source chunk into a `StreamChunk` and re-encodes it in
//! the target framing. Request bodies are mapped the same way before they go upstream.

use crate::types::*;
use crate::{ollama, openai};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{trace, warn};

/// Per-stream information available to every conversion
#[derive(Debug, Clone)]
pub struct ConversionContext {
    pub meta: StreamMeta,
}

impl ConversionContext {
    pub fn new(meta: StreamMeta) -> Self {
        Self { meta }
    }
}

/// Converts one decoded wire chunk from the source format into the target format.
///
/// Returning `Ok(None)` drops the chunk, which is how a converter signals that the target
/// cannot express anything it carries.
#[async_trait]
pub trait ChunkConverter: Send + Sync {
    async fn convert_chunk(
        &self,
        chunk: &Value,
        source: WireFormat,
        target: WireFormat,
        context: &ConversionContext,
    ) -> Result<Option<Value>>;
}

/// Default converter built on the `StreamChunk` codecs
#[derive(Debug, Clone, Copy, Default)]
pub struct WireConverter;

#[async_trait]
impl ChunkConverter for WireConverter {
    async fn convert_chunk(
        &self,
        chunk: &Value,
        source: WireFormat,
        target: WireFormat,
        context: &ConversionContext,
    ) -> Result<Option<Value>> {
        if source == target {
            let mut chunk = chunk.clone();
            // Synthesized chunks carry the stream's own identity; forwarded ones must match
            if target == WireFormat::EventStream {
                if let Some(fields) = chunk.as_object_mut() {
                    fields.insert("id".to_string(), json!(context.meta.id));
                    fields.insert("created".to_string(), json!(context.meta.created));
                }
            }
            return Ok(Some(chunk));
        }

        let mut decoded = decode_chunk(chunk, source)
            .with_context(|| format!("Failed to decode {source} chunk"))?;

        // Line-JSON repeats the role on every line; event streams announce it once
        if source == WireFormat::LineJson {
            decoded.role = None;
        }
        // Event-stream clients match results to calls by id
        if target == WireFormat::EventStream {
            for call in decoded.tool_calls.iter_mut().filter(|call| call.id.is_none()) {
                call.id = Some(generate_id("call"));
            }
        }

        let converted = encode_chunk(&decoded, target, &context.meta);
        trace!("Converted {} chunk to {}: {:?}", source, target, converted);
        Ok(converted)
    }
}

/// Decode a chunk of the given framing into the neutral form
pub fn decode_chunk(chunk: &Value, format: WireFormat) -> Result<StreamChunk, WireError> {
    match format {
        WireFormat::EventStream => openai::decode_chunk(chunk),
        WireFormat::LineJson => ollama::decode_chunk(chunk),
    }
}

/// Encode a neutral chunk in the given framing, or `None` if nothing in it can be expressed
pub fn encode_chunk(chunk: &StreamChunk, format: WireFormat, meta: &StreamMeta) -> Option<Value> {
    match format {
        WireFormat::EventStream => openai::encode_chunk(chunk, meta),
        WireFormat::LineJson => ollama::encode_chunk(chunk, meta),
    }
}

/// Tool definitions declared in a chat request. Both formats use the same
/// `{"type": "function", "function": {...}}` entries.
pub fn tool_definitions(body: &Value) -> Vec<ToolDefinition> {
    let Some(tools) = body.get("tools").and_then(Value::as_array) else {
        return Vec::new();
    };

    tools
        .iter()
        .filter_map(|tool| {
            let function = tool.get("function").unwrap_or(tool);
            match serde_json::from_value::<ToolDefinition>(function.clone()) {
                Ok(definition) => Some(definition),
                Err(e) => {
                    warn!("Ignoring malformed tool definition {}: {}", tool, e);
                    None
                }
            }
        })
        .collect()
}

/// Sampling options that live at the top level of event-stream requests and under `options`
/// in line-JSON requests. Pairs are (event-stream name, line-JSON name).
const SAMPLING_OPTIONS: &[(&str, &str)] = &[
    ("temperature", "temperature"),
    ("top_p", "top_p"),
    ("max_tokens", "num_predict"),
    ("stop", "stop"),
    ("seed", "seed"),
    ("presence_penalty", "presence_penalty"),
    ("frequency_penalty", "frequency_penalty"),
];

/// Map a chat request body from the client's format to the backend's format.
///
/// The result always requests a streaming response. Fields with no counterpart are dropped.
pub fn convert_request(body: &Value, source: WireFormat, target: WireFormat) -> Result<Value> {
    let object = body
        .as_object()
        .context("Chat request body must be a JSON object")?;

    let mut converted = if source == target {
        object.clone()
    } else {
        match (source, target) {
            (WireFormat::EventStream, WireFormat::LineJson) => event_stream_to_line_json(object),
            _ => line_json_to_event_stream(object),
        }
    };

    converted.insert("stream".to_string(), Value::Bool(true));
    Ok(Value::Object(converted))
}

fn event_stream_to_line_json(request: &Map<String, Value>) -> Map<String, Value> {
    let mut converted = Map::new();
    if let Some(model) = request.get("model") {
        converted.insert("model".to_string(), model.clone());
    }

    let messages = request
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| messages.iter().map(message_to_line_json).collect())
        .unwrap_or_default();
    converted.insert("messages".to_string(), Value::Array(messages));

    let mut options = Map::new();
    for (event_name, line_name) in SAMPLING_OPTIONS {
        if let Some(value) = request.get(*event_name) {
            options.insert(line_name.to_string(), value.clone());
        }
    }
    if let Some(value) = request.get("max_completion_tokens") {
        options.insert("num_predict".to_string(), value.clone());
    }
    if !options.is_empty() {
        converted.insert("options".to_string(), Value::Object(options));
    }

    if let Some(tools) = request.get("tools") {
        converted.insert("tools".to_string(), tools.clone());
    }
    if let Some(format) = request
        .get("response_format")
        .and_then(|format| format.get("type"))
        .and_then(Value::as_str)
    {
        if format == "json_object" {
            converted.insert("format".to_string(), json!("json"));
        }
    }

    converted
}

fn line_json_to_event_stream(request: &Map<String, Value>) -> Map<String, Value> {
    let mut converted = Map::new();
    if let Some(model) = request.get("model") {
        converted.insert("model".to_string(), model.clone());
    }

    let messages = request
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| messages.iter().map(message_to_event_stream).collect())
        .unwrap_or_default();
    converted.insert("messages".to_string(), Value::Array(messages));

    if let Some(options) = request.get("options").and_then(Value::as_object) {
        for (event_name, line_name) in SAMPLING_OPTIONS {
            if let Some(value) = options.get(*line_name) {
                converted.insert(event_name.to_string(), value.clone());
            }
        }
    }

    if let Some(tools) = request.get("tools") {
        converted.insert("tools".to_string(), tools.clone());
    }
    if request.get("format").and_then(Value::as_str) == Some("json") {
        converted.insert("response_format".to_string(), json!({"type": "json_object"}));
    }
    converted.insert(
        "stream_options".to_string(),
        json!({"include_usage": true}),
    );

    converted
}

/// Flatten event-stream message content, which may be a list of typed parts
pub fn message_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn message_to_line_json(message: &Value) -> Value {
    let role = message.get("role").cloned().unwrap_or(json!("user"));
    let content = message
        .get("content")
        .map(message_text)
        .unwrap_or_default();

    let mut converted = Map::new();
    converted.insert("role".to_string(), role);
    converted.insert("content".to_string(), Value::String(content));

    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        let calls: Vec<Value> = calls
            .iter()
            .map(|call| {
                let function = call.get("function").cloned().unwrap_or_default();
                let arguments = match function.get("arguments") {
                    Some(Value::String(text)) => {
                        serde_json::from_str(text).unwrap_or_else(|_| json!({}))
                    }
                    Some(other) => other.clone(),
                    None => json!({}),
                };
                json!({
                    "function": {
                        "name": function.get("name").cloned().unwrap_or_default(),
                        "arguments": arguments,
                    }
                })
            })
            .collect();
        converted.insert("tool_calls".to_string(), Value::Array(calls));
    }

    Value::Object(converted)
}

fn message_to_event_stream(message: &Value) -> Value {
    let mut converted = Map::new();
    converted.insert(
        "role".to_string(),
        message.get("role").cloned().unwrap_or(json!("user")),
    );
    converted.insert(
        "content".to_string(),
        message.get("content").cloned().unwrap_or(json!("")),
    );

    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        let calls: Vec<Value> = calls
            .iter()
            .enumerate()
            .map(|(index, call)| {
                let function = call.get("function").cloned().unwrap_or_default();
                let arguments = function.get("arguments").cloned().unwrap_or(json!({}));
                json!({
                    "id": format!("call_{index}"),
                    "type": "function",
                    "function": {
                        "name": function.get("name").cloned().unwrap_or_default(),
                        "arguments": arguments.to_string(),
                    }
                })
            })
            .collect();
        converted.insert("tool_calls".to_string(), Value::Array(calls));
    }

    Value::Object(converted)
}
