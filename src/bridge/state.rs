//! Per-request tool-call interception state machine
//!
//! `StreamBridge` is synchronous: it turns each decoded backend chunk into a list of
//! `Emission`s in output order and leaves conversion and writing to the driver.

use crate::tools::{
    detect, parse_fragment, parse_unterminated, BoundedBuffer, Detection, ExtractedToolCall,
    PartialState, ToolNames,
};
use clap::ValueEnum;
use llm::{StreamChunk, Usage, WireFormat};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// How many tool calls are surfaced per backend turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallPolicy {
    /// The first call ends the turn; later text is forwarded as plain content
    #[default]
    SinglePerTurn,
    /// Keep scanning after each call; one finish marker at end of stream
    Multiple,
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeOptions {
    pub policy: ToolCallPolicy,
    pub max_buffer_bytes: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            policy: ToolCallPolicy::default(),
            max_buffer_bytes: 64 * 1024,
        }
    }
}

/// A backend chunk as received and in its normalized form
#[derive(Debug, Clone)]
pub struct InboundChunk {
    pub raw: Value,
    pub chunk: StreamChunk,
}

/// One unit of output, in the order it must be written
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    /// Original backend chunk, to be converted by the field-mapping collaborator
    Passthrough(Value),
    /// Chunk produced by the bridge, encoded directly in the target format
    Synthesized(StreamChunk),
    ToolCall {
        call: ExtractedToolCall,
        index: u32,
    },
    /// Completion marker after tool calls
    ToolCallFinish,
    /// The target format's end-of-stream marker
    Terminal(StreamChunk),
}

/// Phase-specific state; each variant owns exactly the buffers of its phase
#[derive(Debug)]
pub enum BridgeState {
    /// Plain text flows through; `window` holds a possible marker split across chunks
    Streaming { window: String },
    /// A candidate tool call is being accumulated
    ToolCallPending {
        buffer: BoundedBuffer,
        partial: PartialState,
    },
    /// A call was emitted and the turn allows no further calls. Whitespace is held back and
    /// only released in front of later text.
    ToolCallSent { trailing: String },
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Streaming,
    ToolCallPending,
    ToolCallSent,
    Closed,
}

pub struct StreamBridge {
    names: Arc<ToolNames>,
    options: BridgeOptions,
    source: WireFormat,
    target: WireFormat,
    state: BridgeState,
    calls_sent: u32,
    model: Option<String>,
    usage: Option<Usage>,
    backend_finish: Option<String>,
    role_sent: bool,
    finish_sent: bool,
}

impl StreamBridge {
    pub fn new(
        names: Arc<ToolNames>,
        options: BridgeOptions,
        source: WireFormat,
        target: WireFormat,
    ) -> Self {
        Self {
            names,
            options,
            source,
            target,
            state: BridgeState::Streaming {
                window: String::new(),
            },
            calls_sent: 0,
            model: None,
            usage: None,
            backend_finish: None,
            role_sent: false,
            finish_sent: false,
        }
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            BridgeState::Streaming { .. } => Phase::Streaming,
            BridgeState::ToolCallPending { .. } => Phase::ToolCallPending,
            BridgeState::ToolCallSent { .. } => Phase::ToolCallSent,
            BridgeState::Closed => Phase::Closed,
        }
    }

    /// Latest model name reported by the backend
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn calls_sent(&self) -> u32 {
        self.calls_sent
    }

    fn intercepting(&self) -> bool {
        !self.names.is_empty()
    }

    /// Process one backend chunk
    pub fn on_chunk(&mut self, inbound: InboundChunk) -> Vec<Emission> {
        if matches!(self.state, BridgeState::Closed) {
            trace!("Ignoring chunk after close");
            return Vec::new();
        }

        let InboundChunk { raw, chunk } = inbound;
        if let Some(model) = &chunk.model {
            self.model = Some(model.clone());
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }
        if let Some(reason) = &chunk.finish_reason {
            self.backend_finish = Some(reason.clone());
        }

        let mut out = if self.intercepting() {
            self.intercept(raw, &chunk)
        } else {
            self.forward(raw, &chunk)
        };

        self.announce_role(&chunk, &mut out);
        out
    }

    /// Pure protocol conversion, used when there is nothing to intercept
    fn forward(&mut self, raw: Value, chunk: &StreamChunk) -> Vec<Emission> {
        if chunk.done {
            // Line-JSON completion; the bridge writes its own terminal
            return chunk
                .content_delta()
                .map(|text| vec![self.text(text)])
                .unwrap_or_default();
        }
        if chunk.finish_reason.is_some() && self.target == WireFormat::EventStream {
            self.finish_sent = true;
        }
        if chunk.usage.is_some() && self.source == self.target {
            self.usage = None;
        }
        vec![Emission::Passthrough(raw)]
    }

    fn intercept(&mut self, raw: Value, chunk: &StreamChunk) -> Vec<Emission> {
        let mut out = Vec::new();
        // Finish reasons and usage are held until end of stream so they follow held text
        let plain = chunk.finish_reason.is_none()
            && chunk.usage.is_none()
            && !chunk.done
            && chunk.tool_calls.is_empty();

        match chunk.content_delta() {
            Some(text) => {
                let passthrough = plain.then_some(&raw);
                self.process_text(text, passthrough, &mut out);
            }
            None if plain => out.push(Emission::Passthrough(raw)),
            None => {}
        }

        if !chunk.tool_calls.is_empty() {
            warn!("Backend sent native tool calls while calls are being intercepted");
            out.push(Emission::Synthesized(StreamChunk {
                tool_calls: chunk.tool_calls.clone(),
                model: self.model.clone(),
                ..Default::default()
            }));
        }
        out
    }

    /// Run one content delta through the current phase. When the delta is released unchanged
    /// and `raw` is given, the original chunk is forwarded instead of a synthesized one.
    fn process_text(&mut self, text: &str, raw: Option<&Value>, out: &mut Vec<Emission>) {
        let state = std::mem::replace(&mut self.state, BridgeState::Closed);
        self.state = match state {
            BridgeState::Streaming { mut window } => {
                if window.is_empty() {
                    if let Some(raw) = raw {
                        let (detection, _) = detect(text, &self.names, &PartialState::Idle);
                        if detection == Detection::NotACall {
                            out.push(Emission::Passthrough(raw.clone()));
                            return self.restore_streaming(String::new());
                        }
                    }
                }
                window.push_str(text);
                return self.scan_window(window, out);
            }
            BridgeState::ToolCallPending {
                mut buffer,
                partial,
            } => {
                if let Err(overflow) = buffer.append(text) {
                    warn!("{}; releasing held text", overflow);
                    let mut held = buffer.take();
                    held.push_str(text);
                    out.push(self.text(&held));
                    BridgeState::Streaming {
                        window: String::new(),
                    }
                } else {
                    return self.advance_candidate(buffer, partial, out);
                }
            }
            BridgeState::ToolCallSent { mut trailing } => {
                if text.trim().is_empty() {
                    if trailing.len() + text.len() > self.options.max_buffer_bytes {
                        warn!(
                            "Trailing whitespace exceeds {} bytes; releasing it",
                            self.options.max_buffer_bytes
                        );
                        trailing.push_str(text);
                        out.push(self.text(&trailing));
                        trailing.clear();
                    } else {
                        trailing.push_str(text);
                    }
                } else if let (true, Some(raw)) = (trailing.is_empty(), raw) {
                    out.push(Emission::Passthrough(raw.clone()));
                } else {
                    trailing.push_str(text);
                    out.push(self.text(&trailing));
                    trailing.clear();
                }
                BridgeState::ToolCallSent { trailing }
            }
            BridgeState::Closed => BridgeState::Closed,
        };
    }

    fn restore_streaming(&mut self, window: String) {
        self.state = BridgeState::Streaming { window };
    }

    /// Look for a candidate in the idle window
    fn scan_window(&mut self, mut window: String, out: &mut Vec<Emission>) {
        let (detection, partial) = detect(&window, &self.names, &PartialState::Idle);
        match detection {
            Detection::NotACall => {
                out.push(self.text(&window));
                self.restore_streaming(String::new());
            }
            Detection::PartialMarker { start } => {
                if start > 0 {
                    out.push(self.text(&window[..start]));
                    window.drain(..start);
                }
                self.restore_streaming(window);
            }
            Detection::Candidate { root, start, .. } => {
                debug!("Tool call candidate <{}> started", root);
                if start > 0 {
                    out.push(self.text(&window[..start]));
                }
                let mut buffer = BoundedBuffer::new(self.options.max_buffer_bytes);
                match buffer.append(&window[start..]) {
                    Ok(()) => {
                        self.state = BridgeState::ToolCallPending { buffer, partial };
                    }
                    Err(overflow) => {
                        warn!("{}; releasing held text", overflow);
                        out.push(self.text(&window[start..]));
                        self.restore_streaming(String::new());
                    }
                }
            }
            Detection::Complete { start, end, .. } => {
                if start > 0 {
                    out.push(self.text(&window[..start]));
                }
                self.complete(&window[start..end], &window[end..], out);
            }
        }
    }

    /// Re-check a pending candidate after its buffer grew
    fn advance_candidate(
        &mut self,
        mut buffer: BoundedBuffer,
        partial: PartialState,
        out: &mut Vec<Emission>,
    ) {
        let (detection, partial) = detect(buffer.content(), &self.names, &partial);
        match detection {
            Detection::Candidate { start, .. } => {
                if start > 0 {
                    // A wrapper took over from a bare candidate
                    let held = buffer.take();
                    out.push(self.text(&held[..start]));
                    if let Err(overflow) = buffer.set_content(&held[start..]) {
                        warn!("{}; releasing held text", overflow);
                        out.push(self.text(&held[start..]));
                        self.restore_streaming(String::new());
                        return;
                    }
                }
                self.state = BridgeState::ToolCallPending { buffer, partial };
            }
            Detection::Complete { start, end, .. } => {
                let held = buffer.take();
                if start > 0 {
                    out.push(self.text(&held[..start]));
                }
                self.complete(&held[start..end], &held[end..], out);
            }
            Detection::NotACall | Detection::PartialMarker { .. } => {
                let held = buffer.take();
                out.push(self.text(&held));
                self.restore_streaming(String::new());
            }
        }
    }

    /// Handle a balanced fragment and whatever followed it
    fn complete(&mut self, fragment: &str, remainder: &str, out: &mut Vec<Emission>) {
        match parse_fragment(fragment, &self.names) {
            Some(calls) => {
                self.emit_calls(calls, out);
                match self.options.policy {
                    ToolCallPolicy::SinglePerTurn => {
                        out.push(Emission::ToolCallFinish);
                        self.finish_sent = true;
                        self.state = BridgeState::ToolCallSent {
                            trailing: String::new(),
                        };
                        if !remainder.is_empty() {
                            self.process_text(remainder, None, out);
                        }
                    }
                    ToolCallPolicy::Multiple => {
                        self.restore_streaming(String::new());
                        if !remainder.is_empty() {
                            self.process_text(remainder, None, out);
                        }
                    }
                }
            }
            None => {
                debug!("Tool call fragment did not parse; releasing it as text");
                out.push(self.text(fragment));
                self.restore_streaming(String::new());
                if !remainder.is_empty() {
                    self.process_text(remainder, None, out);
                }
            }
        }
    }

    fn emit_calls(&mut self, calls: Vec<ExtractedToolCall>, out: &mut Vec<Emission>) {
        for call in calls {
            debug!("Emitting tool call {} #{}", call.name, self.calls_sent);
            out.push(Emission::ToolCall {
                call,
                index: self.calls_sent,
            });
            self.calls_sent += 1;
        }
    }

    fn text(&self, text: &str) -> Emission {
        Emission::Synthesized(StreamChunk {
            content: Some(text.to_string()),
            model: self.model.clone(),
            ..Default::default()
        })
    }

    /// Event-stream clients expect the role on the first delta. Line-JSON sources carry it on
    /// every line and the converter drops it, so it is announced once here.
    fn announce_role(&mut self, chunk: &StreamChunk, out: &mut Vec<Emission>) {
        if self.role_sent || self.target != WireFormat::EventStream || out.is_empty() {
            return;
        }
        self.role_sent = true;

        let carried = self.source == WireFormat::EventStream
            && chunk.role.is_some()
            && matches!(out.first(), Some(Emission::Passthrough(_)));
        if !carried {
            out.insert(0, self.role_marker());
        }
    }

    fn role_marker(&self) -> Emission {
        Emission::Synthesized(StreamChunk {
            role: Some("assistant".to_string()),
            content: Some(String::new()),
            model: self.model.clone(),
            ..Default::default()
        })
    }

    /// End of the backend stream: resolve held text, emit the finish marker and the terminal.
    /// Calling it again returns nothing.
    pub fn finish(&mut self) -> Vec<Emission> {
        let mut out = Vec::new();
        let state = std::mem::replace(&mut self.state, BridgeState::Closed);

        match state {
            BridgeState::Closed => return out,
            BridgeState::Streaming { window } => {
                if !window.is_empty() {
                    out.push(self.text(&window));
                }
            }
            BridgeState::ToolCallPending { mut buffer, .. } => {
                let held = buffer.take();
                match parse_unterminated(&held, &self.names) {
                    Some(calls) => {
                        debug!("Tool call resolved at end of stream");
                        self.emit_calls(calls, &mut out);
                    }
                    None => {
                        debug!("Unfinished tool call released as text at end of stream");
                        out.push(self.text(&held));
                    }
                }
            }
            BridgeState::ToolCallSent { trailing } => {
                if !trailing.is_empty() {
                    trace!("Dropping whitespace after tool call");
                }
            }
        }

        if self.target == WireFormat::EventStream {
            if !self.role_sent && !out.is_empty() {
                self.role_sent = true;
                out.insert(0, self.role_marker());
            }
            if self.calls_sent > 0 && !self.finish_sent {
                out.push(Emission::ToolCallFinish);
                self.finish_sent = true;
            }
            if !self.finish_sent {
                out.push(Emission::Synthesized(StreamChunk {
                    finish_reason: Some(
                        self.backend_finish
                            .clone()
                            .unwrap_or_else(|| "stop".to_string()),
                    ),
                    model: self.model.clone(),
                    ..Default::default()
                }));
                self.finish_sent = true;
            }
            if let Some(usage) = self.usage.take() {
                out.push(Emission::Synthesized(StreamChunk {
                    usage: Some(usage),
                    model: self.model.clone(),
                    ..Default::default()
                }));
            }
        }

        out.push(self.terminal());
        debug!(
            "Stream closed after {} tool call(s), {} emission(s) at close",
            self.calls_sent,
            out.len()
        );
        out
    }

    /// Drop all held state after a fatal error and return only the terminal marker
    pub fn abort(&mut self) -> Vec<Emission> {
        if matches!(self.state, BridgeState::Closed) {
            return Vec::new();
        }
        self.state = BridgeState::Closed;
        vec![self.terminal()]
    }

    fn terminal(&self) -> Emission {
        Emission::Terminal(StreamChunk {
            content: Some(String::new()),
            finish_reason: Some(if self.calls_sent > 0 {
                "stop".to_string()
            } else {
                self.backend_finish
                    .clone()
                    .unwrap_or_else(|| "stop".to_string())
            }),
            usage: Some(self.usage.unwrap_or_else(Usage::zero)),
            model: self.model.clone(),
            done: true,
            ..Default::default()
        })
    }
}
