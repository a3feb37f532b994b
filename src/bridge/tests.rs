use super::*;
use crate::tests::utils::{chunk_str, two_way_splits};
use crate::tools::ToolNames;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use llm::convert::decode_chunk;
use llm::{
    ChunkConverter, ConversionContext, ReplayChunkStream, StreamMeta, WireConverter, WireFormat,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const WEATHER_CALL: &str = "<get_weather><location>Paris</location></get_weather>";

fn names() -> Arc<ToolNames> {
    Arc::new(ToolNames::new(["get_weather", "search"]))
}

fn no_tools() -> Arc<ToolNames> {
    Arc::new(ToolNames::new(Vec::<String>::new()))
}

fn options(policy: ToolCallPolicy) -> BridgeOptions {
    BridgeOptions {
        policy,
        ..Default::default()
    }
}

fn bridge(policy: ToolCallPolicy) -> StreamBridge {
    StreamBridge::new(
        names(),
        options(policy),
        WireFormat::EventStream,
        WireFormat::EventStream,
    )
}

fn sse_delta(content: &str) -> Value {
    json!({
        "id": "chatcmpl-upstream",
        "object": "chat.completion.chunk",
        "created": 1,
        "model": "upstream-model",
        "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
    })
}

fn sse_finish(reason: &str) -> Value {
    json!({
        "id": "chatcmpl-upstream",
        "object": "chat.completion.chunk",
        "created": 1,
        "model": "upstream-model",
        "choices": [{"index": 0, "delta": {}, "finish_reason": reason}]
    })
}

fn inbound(raw: Value) -> InboundChunk {
    let chunk = decode_chunk(&raw, WireFormat::EventStream).unwrap();
    InboundChunk { raw, chunk }
}

fn run_deltas<S: AsRef<str>>(bridge: &mut StreamBridge, deltas: &[S]) -> Vec<Emission> {
    let mut out = Vec::new();
    for delta in deltas {
        out.extend(bridge.on_chunk(inbound(sse_delta(delta.as_ref()))));
    }
    out.extend(bridge.finish());
    out
}

/// What a client would see, independent of how text was split into chunks
#[derive(Debug, Default, PartialEq)]
struct Summary {
    text: String,
    calls: Vec<(String, Value, u32)>,
    finishes: usize,
    terminals: usize,
}

fn summarize(emissions: &[Emission]) -> Summary {
    let mut summary = Summary::default();
    for emission in emissions {
        match emission {
            Emission::Passthrough(raw) => {
                let chunk = decode_chunk(raw, WireFormat::EventStream).unwrap();
                summary.text.push_str(chunk.content.as_deref().unwrap_or(""));
            }
            Emission::Synthesized(chunk) => {
                summary.text.push_str(chunk.content.as_deref().unwrap_or(""));
            }
            Emission::ToolCall { call, index } => summary.calls.push((
                call.name.clone(),
                Value::Object(call.arguments.clone()),
                *index,
            )),
            Emission::ToolCallFinish => summary.finishes += 1,
            Emission::Terminal(_) => summary.terminals += 1,
        }
    }
    summary
}

fn weather(location: &str, index: u32) -> (String, Value, u32) {
    (
        "get_weather".to_string(),
        json!({"location": location}),
        index,
    )
}

#[test]
fn test_plain_text_passes_through_unchanged() {
    let mut bridge = bridge(ToolCallPolicy::SinglePerTurn);
    let out = run_deltas(&mut bridge, &["The sky", " is blue."]);

    // Role marker first, then the original chunks untouched
    assert!(matches!(&out[0], Emission::Synthesized(chunk) if chunk.role.as_deref() == Some("assistant")));
    assert_eq!(out[1], Emission::Passthrough(sse_delta("The sky")));
    assert_eq!(out[2], Emission::Passthrough(sse_delta(" is blue.")));

    let summary = summarize(&out);
    assert_eq!(summary.text, "The sky is blue.");
    assert!(summary.calls.is_empty());
    assert_eq!(summary.terminals, 1);
    assert_eq!(bridge.phase(), Phase::Closed);
}

#[test]
fn test_tool_call_split_across_chunks() {
    let mut bridge = bridge(ToolCallPolicy::SinglePerTurn);
    let deltas = [
        "<get_",
        "weather><loc",
        "ation>Paris</location></get_w",
        "eather>",
    ];

    for delta in &deltas[..3] {
        let out = bridge.on_chunk(inbound(sse_delta(delta)));
        assert!(out.is_empty(), "held text leaked: {:?}", out);
    }
    assert_eq!(bridge.phase(), Phase::ToolCallPending);

    let mut out = bridge.on_chunk(inbound(sse_delta(deltas[3])));
    assert_eq!(bridge.phase(), Phase::ToolCallSent);
    assert_eq!(bridge.calls_sent(), 1);
    assert_eq!(bridge.model(), Some("upstream-model"));

    out.extend(bridge.on_chunk(inbound(sse_finish("stop"))));
    out.extend(bridge.finish());

    let summary = summarize(&out);
    assert_eq!(summary.text, "");
    assert_eq!(summary.calls, vec![weather("Paris", 0)]);
    assert_eq!(summary.finishes, 1);
    assert_eq!(summary.terminals, 1);
    assert!(matches!(out.last(), Some(Emission::Terminal(_))));
}

#[test]
fn test_chunk_boundaries_do_not_change_output() {
    let text = format!("Let me check. {WEATHER_CALL} Done.");
    let expected = Summary {
        text: "Let me check.  Done.".to_string(),
        calls: vec![weather("Paris", 0)],
        finishes: 1,
        terminals: 1,
    };

    for chunk_size in 1..=text.len() {
        let mut bridge = bridge(ToolCallPolicy::SinglePerTurn);
        let out = run_deltas(&mut bridge, &chunk_str(&text, chunk_size));
        assert_eq!(summarize(&out), expected, "chunk size {}", chunk_size);
    }

    for chunks in two_way_splits(&text) {
        let mut bridge = bridge(ToolCallPolicy::SinglePerTurn);
        let out = run_deltas(&mut bridge, &chunks);
        assert_eq!(summarize(&out), expected, "split {:?}", chunks);
    }
}

#[test]
fn test_mismatched_closing_tag_released_as_text() {
    let text = "<get_weather><location>Paris</location></get_weather_typo>";
    let mut bridge = bridge(ToolCallPolicy::SinglePerTurn);
    let out = run_deltas(&mut bridge, &chunk_str(text, 7));

    let summary = summarize(&out);
    assert_eq!(summary.text, text);
    assert!(summary.calls.is_empty());
    assert_eq!(summary.finishes, 0);
    assert_eq!(summary.terminals, 1);
}

#[test]
fn test_unterminated_call_resolved_at_end_of_stream() {
    let mut bridge = bridge(ToolCallPolicy::SinglePerTurn);
    let out = run_deltas(&mut bridge, &["<get_weather>", "<location>Paris</location>"]);

    let summary = summarize(&out);
    assert_eq!(summary.calls, vec![weather("Paris", 0)]);
    assert_eq!(summary.finishes, 1);
    assert_eq!(summary.text, "");
}

#[test]
fn test_wrapper_supersedes_pending_bare_candidate() {
    let mut bridge = bridge(ToolCallPolicy::SinglePerTurn);
    let out = run_deltas(
        &mut bridge,
        &[
            "<search>",
            "x <tool_calls><get_weather><location>Oslo</location></get_weather></tool_calls>",
        ],
    );

    let summary = summarize(&out);
    assert_eq!(summary.text, "<search>x ");
    assert_eq!(summary.calls, vec![weather("Oslo", 0)]);
}

#[test]
fn test_text_split_marker_released_when_not_a_call() {
    let mut bridge = bridge(ToolCallPolicy::SinglePerTurn);
    let out = run_deltas(&mut bridge, &["x <", " 5 apples"]);
    assert_eq!(summarize(&out).text, "x < 5 apples");
}

#[test]
fn test_buffer_overflow_flushes_held_text() {
    let mut bridge = StreamBridge::new(
        names(),
        BridgeOptions {
            policy: ToolCallPolicy::SinglePerTurn,
            max_buffer_bytes: 32,
        },
        WireFormat::EventStream,
        WireFormat::EventStream,
    );

    let mut out = Vec::new();
    for delta in ["<get_weather>", "<location>"] {
        out.extend(bridge.on_chunk(inbound(sse_delta(delta))));
    }
    assert_eq!(bridge.phase(), Phase::ToolCallPending);

    out.extend(bridge.on_chunk(inbound(sse_delta("a location name that never ends"))));
    assert_eq!(bridge.phase(), Phase::Streaming);

    // Back to plain streaming: the next chunk is forwarded as is
    let next = bridge.on_chunk(inbound(sse_delta("!")));
    assert_eq!(next, vec![Emission::Passthrough(sse_delta("!"))]);
    out.extend(next);
    out.extend(bridge.finish());

    let summary = summarize(&out);
    assert_eq!(
        summary.text,
        "<get_weather><location>a location name that never ends!"
    );
    assert!(summary.calls.is_empty());
}

#[test]
fn test_trailing_whitespace_is_bounded() {
    let mut bridge = StreamBridge::new(
        names(),
        BridgeOptions {
            policy: ToolCallPolicy::SinglePerTurn,
            max_buffer_bytes: 64,
        },
        WireFormat::EventStream,
        WireFormat::EventStream,
    );

    let mut out = bridge.on_chunk(inbound(sse_delta(WEATHER_CALL)));
    assert_eq!(bridge.phase(), Phase::ToolCallSent);

    let spaces = " ".repeat(40);
    assert!(bridge.on_chunk(inbound(sse_delta(&spaces))).is_empty());
    let released = bridge.on_chunk(inbound(sse_delta(&spaces)));
    assert_eq!(summarize(&released).text, " ".repeat(80));
    out.extend(released);
    out.extend(bridge.finish());

    let summary = summarize(&out);
    assert_eq!(summary.calls, vec![weather("Paris", 0)]);
    assert_eq!(summary.terminals, 1);
}

#[test]
fn test_raw_code_survives_any_chunking() {
    let names = Arc::new(ToolNames::new(["write_file"]));
    let samples = [
        "if a <b and c:  # it's fine\n    pass",
        "parts = html.split(\"</\")",
        "<![CDATA[s = \"</code>\"]]>",
    ];

    for code in samples {
        let text = format!("Writing. <write_file><path>a.py</path><code>{code}</code></write_file>");
        let expected_code = code
            .trim_start_matches("<![CDATA[")
            .trim_end_matches("]]>");
        let expected = Summary {
            text: "Writing. ".to_string(),
            calls: vec![(
                "write_file".to_string(),
                json!({"path": "a.py", "code": expected_code}),
                0,
            )],
            finishes: 1,
            terminals: 1,
        };

        let mut splits: Vec<Vec<String>> = (1..=text.len())
            .map(|size| chunk_str(&text, size))
            .collect();
        splits.extend(two_way_splits(&text));

        for chunks in splits {
            let mut bridge = StreamBridge::new(
                names.clone(),
                options(ToolCallPolicy::SinglePerTurn),
                WireFormat::EventStream,
                WireFormat::EventStream,
            );
            let mut out = Vec::new();
            for chunk in &chunks {
                out.extend(bridge.on_chunk(inbound(sse_delta(chunk))));
            }
            // Extracted while streaming, not by the end-of-stream fallback
            assert_eq!(bridge.phase(), Phase::ToolCallSent, "split {:?}", chunks);
            out.extend(bridge.finish());
            assert_eq!(summarize(&out), expected, "split {:?}", chunks);
        }
    }
}

#[test]
fn test_finish_is_idempotent() {
    let mut bridge = bridge(ToolCallPolicy::SinglePerTurn);
    let out = run_deltas(&mut bridge, &[WEATHER_CALL]);
    assert_eq!(summarize(&out).terminals, 1);

    assert!(bridge.finish().is_empty());
    assert!(bridge.abort().is_empty());
    assert!(bridge.on_chunk(inbound(sse_delta("late"))).is_empty());
}

#[test]
fn test_abort_drops_held_text() {
    let mut bridge = bridge(ToolCallPolicy::SinglePerTurn);
    assert!(bridge.on_chunk(inbound(sse_delta("<get_weather>"))).is_empty());

    let out = bridge.abort();
    assert_eq!(out.len(), 1);
    assert!(matches!(&out[0], Emission::Terminal(chunk) if chunk.done));
    assert!(bridge.finish().is_empty());
}

#[test]
fn test_multiple_policy_emits_every_call() {
    let mut bridge = bridge(ToolCallPolicy::Multiple);
    let out = run_deltas(
        &mut bridge,
        &[
            WEATHER_CALL,
            " and ",
            "<search><query>rust</query></search>",
        ],
    );

    let summary = summarize(&out);
    assert_eq!(summary.text, " and ");
    assert_eq!(
        summary.calls,
        vec![
            weather("Paris", 0),
            ("search".to_string(), json!({"query": "rust"}), 1),
        ]
    );
    assert_eq!(summary.finishes, 1);

    let finish = out
        .iter()
        .position(|e| *e == Emission::ToolCallFinish)
        .unwrap();
    let last_call = out
        .iter()
        .rposition(|e| matches!(e, Emission::ToolCall { .. }))
        .unwrap();
    assert!(finish > last_call);
}

#[test]
fn test_single_policy_forwards_later_calls_as_text() {
    let mut bridge = bridge(ToolCallPolicy::SinglePerTurn);
    let out = run_deltas(
        &mut bridge,
        &[
            WEATHER_CALL,
            "\n",
            " and ",
            "<search><query>rust</query></search>",
            "\n",
        ],
    );

    let summary = summarize(&out);
    assert_eq!(summary.calls, vec![weather("Paris", 0)]);
    assert_eq!(summary.text, "\n and <search><query>rust</query></search>");
    assert_eq!(summary.finishes, 1);
}

#[test]
fn test_finish_reason_follows_held_text() {
    let mut bridge = bridge(ToolCallPolicy::SinglePerTurn);
    let mut out = bridge.on_chunk(inbound(sse_delta("x <")));
    let held = bridge.on_chunk(inbound(sse_finish("length")));
    assert!(held.is_empty());
    out.extend(bridge.finish());

    let text_at = out
        .iter()
        .position(|e| matches!(e, Emission::Synthesized(c) if c.content.as_deref() == Some("<")))
        .unwrap();
    let finish_at = out
        .iter()
        .position(|e| {
            matches!(e, Emission::Synthesized(c) if c.finish_reason.as_deref() == Some("length"))
        })
        .unwrap();
    assert!(text_at < finish_at);
    assert!(matches!(out.last(), Some(Emission::Terminal(_))));
}

#[test]
fn test_no_declared_tools_forwards_markup() {
    let mut bridge = StreamBridge::new(
        no_tools(),
        options(ToolCallPolicy::SinglePerTurn),
        WireFormat::EventStream,
        WireFormat::EventStream,
    );
    let mut out = bridge.on_chunk(inbound(sse_delta(WEATHER_CALL)));
    out.extend(bridge.on_chunk(inbound(sse_finish("stop"))));
    out.extend(bridge.finish());

    assert!(out.contains(&Emission::Passthrough(sse_delta(WEATHER_CALL))));
    assert!(out.contains(&Emission::Passthrough(sse_finish("stop"))));
    // The backend's finish was forwarded, so none is synthesized
    assert!(!out.iter().any(
        |e| matches!(e, Emission::Synthesized(c) if c.finish_reason.is_some())
    ));
    assert_eq!(summarize(&out).terminals, 1);
}

// Driver tests: backend bytes in, client frames out

fn sse_body(deltas: &[&str]) -> Vec<String> {
    let mut frames = vec![format!(
        "data: {}\n\n",
        json!({
            "id": "chatcmpl-upstream",
            "object": "chat.completion.chunk",
            "created": 1,
            "model": "upstream-model",
            "choices": [{"index": 0, "delta": {"role": "assistant", "content": ""}, "finish_reason": null}]
        })
    )];
    frames.extend(
        deltas
            .iter()
            .map(|delta| format!("data: {}\n\n", sse_delta(delta))),
    );
    frames.push(format!("data: {}\n\n", sse_finish("stop")));
    frames.push("data: [DONE]\n\n".to_string());
    frames
}

fn line_body(deltas: &[&str]) -> Vec<String> {
    let mut lines: Vec<String> = deltas
        .iter()
        .map(|delta| {
            format!(
                "{}\n",
                json!({
                    "model": "llama3",
                    "created_at": "2024-01-01T00:00:00Z",
                    "message": {"role": "assistant", "content": delta},
                    "done": false
                })
            )
        })
        .collect();
    lines.push(format!(
        "{}\n",
        json!({
            "model": "llama3",
            "created_at": "2024-01-01T00:00:01Z",
            "message": {"role": "assistant", "content": ""},
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 5,
            "eval_count": 7
        })
    ));
    lines
}

async fn drive(
    source: WireFormat,
    target: WireFormat,
    names: Arc<ToolNames>,
    stream: ReplayChunkStream,
    converter: Arc<dyn ChunkConverter>,
) -> Vec<String> {
    let (sink, mut output) = mpsc::channel(4);
    let bridge = StreamBridge::new(
        names,
        options(ToolCallPolicy::SinglePerTurn),
        source,
        target,
    );
    let encoder = FrameEncoder::new(target, StreamMeta::new("client-model"));
    let driver = BridgeDriver::new(bridge, converter, encoder, source, sink, 8);
    let handle = tokio::spawn(driver.run(Box::new(stream)));

    let mut frames = Vec::new();
    while let Some(frame) = output.recv().await {
        frames.push(String::from_utf8(frame.to_vec()).unwrap());
    }
    handle.await.unwrap();
    frames
}

/// Event-stream payloads plus the number of terminal markers
fn sse_payloads(frames: &[String]) -> (Vec<Value>, usize) {
    let mut payloads = Vec::new();
    let mut done = 0;
    for frame in frames {
        let data = frame
            .strip_prefix("data: ")
            .and_then(|rest| rest.strip_suffix("\n\n"))
            .unwrap_or_else(|| panic!("not an event frame: {:?}", frame));
        if data == "[DONE]" {
            done += 1;
        } else {
            payloads.push(serde_json::from_str(data).unwrap());
        }
    }
    (payloads, done)
}

fn line_payloads(frames: &[String]) -> Vec<Value> {
    frames
        .iter()
        .map(|frame| serde_json::from_str(frame.strip_suffix('\n').unwrap()).unwrap())
        .collect()
}

fn content_of(payloads: &[Value]) -> String {
    payloads
        .iter()
        .filter_map(|p| p["choices"][0]["delta"]["content"].as_str())
        .collect()
}

fn tool_call_deltas(payloads: &[Value]) -> Vec<&Value> {
    payloads
        .iter()
        .filter_map(|p| p["choices"][0]["delta"]["tool_calls"].as_array())
        .flatten()
        .collect()
}

fn finish_reasons(payloads: &[Value]) -> Vec<&str> {
    payloads
        .iter()
        .filter_map(|p| p["choices"][0]["finish_reason"].as_str())
        .collect()
}

#[tokio::test]
async fn test_event_stream_tool_call_end_to_end() {
    let body = sse_body(&[
        "Sure. ",
        "<get_",
        "weather><loc",
        "ation>Paris</location></get_w",
        "eather>",
    ]);
    let frames = drive(
        WireFormat::EventStream,
        WireFormat::EventStream,
        names(),
        ReplayChunkStream::new(body),
        Arc::new(WireConverter),
    )
    .await;

    let (payloads, done) = sse_payloads(&frames);
    assert_eq!(done, 1);
    assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
    assert_eq!(content_of(&payloads), "Sure. ");

    // Forwarded and synthesized chunks share one completion id
    let ids: Vec<&str> = payloads.iter().filter_map(|p| p["id"].as_str()).collect();
    assert_eq!(ids.len(), payloads.len());
    assert!(ids.iter().all(|id| *id == ids[0]), "{:?}", ids);
    assert_ne!(ids[0], "chatcmpl-upstream");

    let calls = tool_call_deltas(&payloads);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["function"]["name"], "get_weather");
    let arguments: Value =
        serde_json::from_str(calls[0]["function"]["arguments"].as_str().unwrap()).unwrap();
    assert_eq!(arguments, json!({"location": "Paris"}));
    assert_eq!(finish_reasons(&payloads), vec!["tool_calls"]);
}

#[tokio::test]
async fn test_line_json_tool_call_end_to_end() {
    let body = line_body(&[
        "<get_",
        "weather><loc",
        "ation>Paris</location></get_w",
        "eather>",
    ]);
    let frames = drive(
        WireFormat::LineJson,
        WireFormat::LineJson,
        names(),
        ReplayChunkStream::new(body),
        Arc::new(WireConverter),
    )
    .await;

    let lines = line_payloads(&frames);
    assert_eq!(lines.len(), 2, "{:?}", lines);
    assert_eq!(lines[0]["done"], false);
    assert_eq!(
        lines[0]["message"]["tool_calls"],
        json!([{"function": {"name": "get_weather", "arguments": {"location": "Paris"}}}])
    );
    assert_eq!(lines[1]["done"], true);
    assert_eq!(lines[1]["done_reason"], "stop");
    assert_eq!(lines[1]["prompt_eval_count"], 5);
    assert_eq!(lines[1]["eval_count"], 7);
}

#[tokio::test]
async fn test_plain_text_converted_from_line_json_to_event_stream() {
    let frames = drive(
        WireFormat::LineJson,
        WireFormat::EventStream,
        names(),
        ReplayChunkStream::new(line_body(&["The sky", " is blue."])),
        Arc::new(WireConverter),
    )
    .await;

    let (payloads, done) = sse_payloads(&frames);
    assert_eq!(done, 1);
    assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
    assert_eq!(content_of(&payloads), "The sky is blue.");

    let roles: Vec<_> = payloads
        .iter()
        .filter_map(|p| p["choices"][0]["delta"]["role"].as_str())
        .collect();
    assert_eq!(roles, vec!["assistant"]);
    assert_eq!(payloads[0]["choices"][0]["delta"]["role"], "assistant");

    assert_eq!(finish_reasons(&payloads), vec!["stop"]);
    let usage = payloads.iter().find_map(|p| p.get("usage")).unwrap();
    assert_eq!(usage["prompt_tokens"], 5);
    assert_eq!(usage["completion_tokens"], 7);
    assert!(tool_call_deltas(&payloads).is_empty());
}

#[tokio::test]
async fn test_mismatched_tags_reach_client_as_text() {
    let text = "<get_weather><location>Paris</location></get_weather_typo>";
    let frames = drive(
        WireFormat::EventStream,
        WireFormat::EventStream,
        names(),
        ReplayChunkStream::new(sse_body(&[
            "<get_weather><location>Paris</location>",
            "</get_weather_typo>",
        ])),
        Arc::new(WireConverter),
    )
    .await;

    let (payloads, done) = sse_payloads(&frames);
    assert_eq!(done, 1);
    assert_eq!(content_of(&payloads), text);
    assert!(tool_call_deltas(&payloads).is_empty());
}

#[tokio::test]
async fn test_backend_bytes_split_anywhere() {
    let body = sse_body(&[WEATHER_CALL]).concat();
    for at in 1..body.len() {
        let bytes = body.as_bytes();
        let stream = ReplayChunkStream::new(vec![bytes[..at].to_vec(), bytes[at..].to_vec()]);
        let frames = drive(
            WireFormat::EventStream,
            WireFormat::EventStream,
            names(),
            stream,
            Arc::new(WireConverter),
        )
        .await;

        let (payloads, done) = sse_payloads(&frames);
        assert_eq!(done, 1, "split at {}", at);
        assert_eq!(tool_call_deltas(&payloads).len(), 1, "split at {}", at);
    }
}

/// Fails on chunks whose content mentions "boom"
struct FailingConverter;

#[async_trait]
impl ChunkConverter for FailingConverter {
    async fn convert_chunk(
        &self,
        chunk: &Value,
        source: WireFormat,
        target: WireFormat,
        context: &ConversionContext,
    ) -> Result<Option<Value>> {
        if chunk.to_string().contains("boom") {
            return Err(anyhow!("cannot convert this chunk"));
        }
        WireConverter
            .convert_chunk(chunk, source, target, context)
            .await
    }
}

#[tokio::test]
async fn test_conversion_error_becomes_error_frame() {
    let frames = drive(
        WireFormat::EventStream,
        WireFormat::EventStream,
        no_tools(),
        ReplayChunkStream::new(sse_body(&["a", "boom", "c"])),
        Arc::new(FailingConverter),
    )
    .await;

    let (payloads, done) = sse_payloads(&frames);
    assert_eq!(done, 1);
    assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
    assert_eq!(content_of(&payloads), "ac");

    let errors: Vec<_> = payloads.iter().filter_map(|p| p.get("error")).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["type"], "conversion_error");
}

/// Delays conversion so later chunks finish first
struct SlowConverter;

#[async_trait]
impl ChunkConverter for SlowConverter {
    async fn convert_chunk(
        &self,
        chunk: &Value,
        source: WireFormat,
        target: WireFormat,
        context: &ConversionContext,
    ) -> Result<Option<Value>> {
        let delay = match chunk["choices"][0]["delta"]["content"].as_str() {
            Some("1") => 40,
            Some("3") => 10,
            _ => 0,
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        WireConverter
            .convert_chunk(chunk, source, target, context)
            .await
    }
}

#[tokio::test]
async fn test_slow_conversion_keeps_order() {
    let frames = drive(
        WireFormat::EventStream,
        WireFormat::EventStream,
        names(),
        ReplayChunkStream::new(sse_body(&["1", "2", "3", "4"])),
        Arc::new(SlowConverter),
    )
    .await;

    let (payloads, done) = sse_payloads(&frames);
    assert_eq!(done, 1);
    assert_eq!(content_of(&payloads), "1234");
}

#[tokio::test]
async fn test_backend_error_chunk_ends_stream() {
    let mut body = sse_body(&["partial answer"]);
    body.insert(
        2,
        format!(
            "data: {}\n\n",
            json!({"error": {"message": "model overloaded", "type": "server_error"}})
        ),
    );
    body.insert(3, format!("data: {}\n\n", sse_delta("never seen")));

    let frames = drive(
        WireFormat::EventStream,
        WireFormat::EventStream,
        names(),
        ReplayChunkStream::new(body),
        Arc::new(WireConverter),
    )
    .await;

    let (payloads, done) = sse_payloads(&frames);
    assert_eq!(done, 1);
    assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
    assert_eq!(content_of(&payloads), "partial answer");

    let error = payloads.iter().find_map(|p| p.get("error")).unwrap();
    assert_eq!(error["message"], "model overloaded");
    assert_eq!(error["type"], "backend_error");
}

#[tokio::test]
async fn test_line_json_backend_error() {
    let mut body = line_body(&["Hello"]);
    body.insert(1, "{\"error\":\"out of memory\"}\n".to_string());

    let frames = drive(
        WireFormat::LineJson,
        WireFormat::LineJson,
        names(),
        ReplayChunkStream::new(body),
        Arc::new(WireConverter),
    )
    .await;

    let lines = line_payloads(&frames);
    assert_eq!(lines[0]["message"]["content"], "Hello");
    assert_eq!(lines[1], json!({"error": "out of memory"}));
    assert_eq!(lines[2]["done"], true);
    assert_eq!(lines.len(), 3);
}

#[tokio::test]
async fn test_transport_error_ends_stream_once() {
    let mut body = sse_body(&["Hello"]);
    body.truncate(2);

    let frames = drive(
        WireFormat::EventStream,
        WireFormat::EventStream,
        names(),
        ReplayChunkStream::new(body).with_trailing_error("connection reset"),
        Arc::new(WireConverter),
    )
    .await;

    let (payloads, done) = sse_payloads(&frames);
    assert_eq!(done, 1);
    assert_eq!(content_of(&payloads), "Hello");
    let error = payloads.iter().find_map(|p| p.get("error")).unwrap();
    assert_eq!(error["message"], "connection reset");
}

#[tokio::test]
async fn test_malformed_chunk_is_reported_and_skipped() {
    let mut body = sse_body(&["one", "two"]);
    body.insert(2, "data: {not json\n\n".to_string());

    let frames = drive(
        WireFormat::EventStream,
        WireFormat::EventStream,
        names(),
        ReplayChunkStream::new(body),
        Arc::new(WireConverter),
    )
    .await;

    let (payloads, done) = sse_payloads(&frames);
    assert_eq!(done, 1);
    assert_eq!(content_of(&payloads), "onetwo");
    let error = payloads.iter().find_map(|p| p.get("error")).unwrap();
    assert_eq!(error["type"], "invalid_chunk");
}

#[tokio::test]
async fn test_client_disconnect_stops_driver() {
    let (sink, output) = mpsc::channel(1);
    drop(output);

    let deltas: Vec<String> = (0..200).map(|i| format!("word {i} ")).collect();
    let deltas: Vec<&str> = deltas.iter().map(String::as_str).collect();
    let bridge = StreamBridge::new(
        names(),
        options(ToolCallPolicy::SinglePerTurn),
        WireFormat::EventStream,
        WireFormat::EventStream,
    );
    let encoder = FrameEncoder::new(WireFormat::EventStream, StreamMeta::new("client-model"));
    let driver = BridgeDriver::new(
        bridge,
        Arc::new(WireConverter),
        encoder,
        WireFormat::EventStream,
        sink,
        2,
    );

    let run = driver.run(Box::new(ReplayChunkStream::new(sse_body(&deltas))));
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("driver did not stop after the client went away");
}
