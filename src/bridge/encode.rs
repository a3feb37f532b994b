//! Target-format framing of bridge output

use super::state::Emission;
use bytes::Bytes;
use llm::convert::encode_chunk;
use llm::ollama::encode_line;
use llm::openai::{encode_sse_frame, DONE_FRAME};
use llm::{generate_id, StreamChunk, StreamMeta, StreamToolCall, WireFormat};
use serde_json::{json, Value};

/// Frames emissions and converted chunks for one response stream
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    target: WireFormat,
    meta: StreamMeta,
}

impl FrameEncoder {
    pub fn new(target: WireFormat, meta: StreamMeta) -> Self {
        Self { target, meta }
    }

    pub fn target(&self) -> WireFormat {
        self.target
    }

    pub fn meta(&self) -> &StreamMeta {
        &self.meta
    }

    /// Frame a payload that is already in the target format
    pub fn frame(&self, payload: &Value) -> Bytes {
        match self.target {
            WireFormat::EventStream => Bytes::from(encode_sse_frame(payload)),
            WireFormat::LineJson => Bytes::from(encode_line(payload)),
        }
    }

    /// Encode any emission except `Passthrough`, which needs the converter. Returns `None` when
    /// the target has nothing to say for it.
    pub fn encode(&self, emission: &Emission, model: Option<&str>) -> Option<Bytes> {
        let chunk = match emission {
            Emission::Passthrough(_) => return None,
            Emission::Synthesized(chunk) => chunk.clone(),
            Emission::ToolCall { call, index } => StreamChunk {
                tool_calls: vec![StreamToolCall {
                    index: *index,
                    id: Some(generate_id("call")),
                    name: Some(call.name.clone()),
                    arguments: call.arguments_json(),
                }],
                ..Default::default()
            },
            Emission::ToolCallFinish => match self.target {
                WireFormat::EventStream => StreamChunk {
                    finish_reason: Some("tool_calls".to_string()),
                    ..Default::default()
                },
                // Line-JSON has no per-call completion marker
                WireFormat::LineJson => return None,
            },
            Emission::Terminal(chunk) => match self.target {
                WireFormat::EventStream => return Some(Bytes::from_static(DONE_FRAME.as_bytes())),
                WireFormat::LineJson => chunk.clone(),
            },
        };

        let chunk = StreamChunk {
            model: chunk.model.or_else(|| model.map(str::to_string)),
            ..chunk
        };
        encode_chunk(&chunk, self.target, &self.meta).map(|payload| self.frame(&payload))
    }

    /// Protocol-shaped error frame
    pub fn error(&self, message: &str, kind: &str) -> Bytes {
        let payload = match self.target {
            WireFormat::EventStream => json!({"error": {"message": message, "type": kind}}),
            WireFormat::LineJson => json!({"error": message}),
        };
        self.frame(&payload)
    }
}
