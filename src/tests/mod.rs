pub mod utils;

use crate::config::{BackendConfig, ProxyConfig};
use crate::server::{build_router, AppState};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use llm::WireFormat;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

type Captured = Arc<Mutex<Vec<Value>>>;

#[derive(Clone)]
struct MockBackend {
    captured: Captured,
    status: StatusCode,
    content_type: &'static str,
    body: Arc<String>,
}

async fn spawn(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn mock_chat(State(mock): State<MockBackend>, Json(body): Json<Value>) -> impl IntoResponse {
    mock.captured.lock().unwrap().push(body);
    (
        mock.status,
        [(CONTENT_TYPE, mock.content_type)],
        mock.body.as_ref().clone(),
    )
}

/// Backend answering both chat routes with a canned body; returns its address and the
/// requests it received
async fn mock_backend(status: StatusCode, format: WireFormat, body: String) -> (SocketAddr, Captured) {
    let captured = Captured::default();
    let mock = MockBackend {
        captured: captured.clone(),
        status,
        content_type: format.content_type(),
        body: Arc::new(body),
    };
    let router = Router::new()
        .route("/api/chat", post(mock_chat))
        .route("/v1/chat/completions", post(mock_chat))
        .with_state(mock);
    (spawn(router).await, captured)
}

async fn spawn_proxy(backend: SocketAddr, format: WireFormat) -> SocketAddr {
    let config = ProxyConfig {
        backend: BackendConfig {
            base_url: format!("http://{backend}"),
            format,
            ..Default::default()
        },
        ..Default::default()
    };
    spawn(build_router(AppState::new(config).unwrap())).await
}

fn line_json_body(deltas: &[&str]) -> String {
    let mut body: String = deltas
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
    body.push_str(&format!(
        "{}\n",
        json!({
            "model": "llama3",
            "created_at": "2024-01-01T00:00:01Z",
            "message": {"role": "assistant", "content": ""},
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 12,
            "eval_count": 9
        })
    ));
    body
}

fn event_stream_body(deltas: &[&str]) -> String {
    let mut body: String = deltas
        .iter()
        .map(|delta| {
            format!(
                "data: {}\n\n",
                json!({
                    "id": "chatcmpl-1",
                    "object": "chat.completion.chunk",
                    "created": 1,
                    "model": "gpt-4o",
                    "choices": [{"index": 0, "delta": {"content": delta}, "finish_reason": null}]
                })
            )
        })
        .collect();
    body.push_str(&format!(
        "data: {}\n\n",
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 1,
            "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]
        })
    ));
    body.push_str("data: [DONE]\n\n");
    body
}

fn weather_request(stream: Option<bool>) -> Value {
    let mut request = json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": "What's the weather in Paris?"}],
        "tools": [{
            "type": "function",
            "function": {
                "name": "get_weather",
                "description": "Get current weather",
                "parameters": {
                    "type": "object",
                    "properties": {"location": {"type": "string"}},
                    "required": ["location"]
                }
            }
        }]
    });
    if let Some(stream) = stream {
        request["stream"] = json!(stream);
    }
    request
}

fn event_payloads(text: &str) -> (Vec<Value>, usize) {
    let mut payloads = Vec::new();
    let mut done = 0;
    for data in text.lines().filter_map(|line| line.strip_prefix("data: ")) {
        if data == "[DONE]" {
            done += 1;
        } else {
            payloads.push(serde_json::from_str(data).unwrap());
        }
    }
    (payloads, done)
}

#[tokio::test]
async fn test_line_json_backend_tool_call_through_event_stream_route() {
    let (backend, captured) = mock_backend(
        StatusCode::OK,
        WireFormat::LineJson,
        line_json_body(&[
            "<get_",
            "weather><loc",
            "ation>Paris</location></get_w",
            "eather>",
        ]),
    )
    .await;
    let proxy = spawn_proxy(backend, WireFormat::LineJson).await;

    let response = reqwest::Client::new()
        .post(format!("http://{proxy}/v1/chat/completions"))
        .json(&weather_request(Some(true)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    let text = response.text().await.unwrap();

    let (payloads, done) = event_payloads(&text);
    assert_eq!(done, 1);
    assert!(text.ends_with("data: [DONE]\n\n"));

    let calls: Vec<&Value> = payloads
        .iter()
        .filter_map(|p| p["choices"][0]["delta"]["tool_calls"].as_array())
        .flatten()
        .collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["function"]["name"], "get_weather");
    assert_eq!(calls[0]["function"]["arguments"], r#"{"location":"Paris"}"#);
    assert!(payloads
        .iter()
        .any(|p| p["choices"][0]["finish_reason"] == "tool_calls"));
    assert!(payloads.iter().all(|p| p["model"] == "llama3"));

    // The backend saw a prompt instead of tool definitions
    let requests = captured.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let upstream = &requests[0];
    assert!(upstream.get("tools").is_none());
    assert_eq!(upstream["stream"], true);
    let system = upstream["messages"][0]["content"].as_str().unwrap();
    assert!(system.contains("<tool_calls>"));
    assert!(system.contains("### get_weather"));
}

#[tokio::test]
async fn test_event_stream_backend_text_through_line_json_route() {
    let (backend, captured) = mock_backend(
        StatusCode::OK,
        WireFormat::EventStream,
        event_stream_body(&["The sky", " is blue."]),
    )
    .await;
    let proxy = spawn_proxy(backend, WireFormat::EventStream).await;

    let request = json!({
        "model": "llama3",
        "messages": [{"role": "user", "content": "Color of the sky?"}],
        "options": {"temperature": 0.2}
    });
    let response = reqwest::Client::new()
        .post(format!("http://{proxy}/api/chat"))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let text = response.text().await.unwrap();

    let lines: Vec<Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let content: String = lines
        .iter()
        .filter_map(|line| line["message"]["content"].as_str())
        .collect();
    assert_eq!(content, "The sky is blue.");
    assert_eq!(lines.iter().filter(|line| line["done"] == true).count(), 1);
    assert_eq!(lines.last().unwrap()["done"], true);

    let requests = captured.lock().unwrap();
    assert_eq!(requests[0]["temperature"], 0.2);
    assert_eq!(requests[0]["stream"], true);
}

#[tokio::test]
async fn test_non_streaming_requests_rejected() {
    let (backend, captured) =
        mock_backend(StatusCode::OK, WireFormat::LineJson, String::new()).await;
    let proxy = spawn_proxy(backend, WireFormat::LineJson).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{proxy}/v1/chat/completions"))
        .json(&weather_request(None))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let response = client
        .post(format!("http://{proxy}/api/chat"))
        .json(&weather_request(Some(false)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let response = client
        .post(format!("http://{proxy}/api/chat"))
        .body("{ not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    assert!(captured.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_upstream_errors_keep_their_meaning() {
    let cases = [
        (StatusCode::TOO_MANY_REQUESTS, 429),
        (StatusCode::UNAUTHORIZED, 401),
        (StatusCode::INTERNAL_SERVER_ERROR, 502),
    ];

    for (upstream_status, expected) in cases {
        let (backend, _) = mock_backend(
            upstream_status,
            WireFormat::LineJson,
            "{\"error\":\"nope\"}".to_string(),
        )
        .await;
        let proxy = spawn_proxy(backend, WireFormat::LineJson).await;

        let response = reqwest::Client::new()
            .post(format!("http://{proxy}/v1/chat/completions"))
            .json(&weather_request(Some(true)))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), expected);
        let body: Value = response.json().await.unwrap();
        assert!(body["error"]["message"].as_str().unwrap().contains("nope"));
    }
}

#[tokio::test]
async fn test_unreachable_backend_is_bad_gateway() {
    // Bind and drop to get a port nobody listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = listener.local_addr().unwrap();
    drop(listener);
    let proxy = spawn_proxy(backend, WireFormat::LineJson).await;

    let response = reqwest::Client::new()
        .post(format!("http://{proxy}/api/chat"))
        .json(&weather_request(Some(true)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 502);
}

#[tokio::test]
async fn test_health() {
    let (backend, _) = mock_backend(StatusCode::OK, WireFormat::LineJson, String::new()).await;
    let proxy = spawn_proxy(backend, WireFormat::LineJson).await;

    let body: Value = reqwest::get(format!("http://{proxy}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"status": "ok"}));
}
