//! HTTP surface: one chat route per client format plus a health check

use crate::bridge::{BridgeDriver, FrameEncoder, StreamBridge};
use crate::config::ProxyConfig;
use crate::rewrite::rewrite_request;
use crate::tools::ToolNames;
use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use llm::convert::tool_definitions;
use llm::{
    check_response_error, ApiError, ChunkConverter, HttpChunkStream, StreamMeta, WireConverter,
    WireFormat,
};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Errors raised before the response stream starts
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("request body is not valid JSON: {0}")]
    MalformedJson(String),

    #[error("only streaming requests are supported; set \"stream\": true")]
    NotStreaming,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Upstream(#[from] ApiError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::MalformedJson(_)
            | ProxyError::NotStreaming
            | ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(ApiError::RateLimit(_)) => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::Upstream(ApiError::Authentication(_)) => StatusCode::UNAUTHORIZED,
            ProxyError::Upstream(ApiError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ProxyError::MalformedJson(_)
            | ProxyError::NotStreaming
            | ProxyError::InvalidRequest(_) => "invalid_request_error",
            ProxyError::Upstream(_) => "upstream_error",
            ProxyError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        warn!("Request failed with {}: {}", status, self);
        let body = json!({"error": {"message": self.to_string(), "type": self.kind()}});
        (status, Json(body)).into_response()
    }
}

/// Shared per-server state
pub struct AppState {
    config: ProxyConfig,
    client: reqwest::Client,
    converter: Arc<dyn ChunkConverter>,
}

impl AppState {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            config,
            client,
            converter: Arc::new(WireConverter),
        })
    }

    /// Replace the field-mapping collaborator used for chunks that are not tool calls
    pub fn with_converter(mut self, converter: Arc<dyn ChunkConverter>) -> Self {
        self.converter = converter;
        self
    }

    fn tool_names(&self, request: &Value) -> ToolNames {
        if self.config.backend.native_tools {
            return ToolNames::default();
        }
        let tool_config = &self.config.tool_calls;
        ToolNames::from_definitions(&tool_definitions(request))
            .with_raw_parameters(tool_config.raw_parameters.iter().cloned())
            .with_require_wrapper(tool_config.require_wrapper)
    }

    /// Forward one chat request and stream the bridged response back
    async fn proxy(&self, request: Value, client_format: WireFormat) -> Result<Response, ProxyError> {
        let backend = &self.config.backend;
        let names = self.tool_names(&request);
        let rewritten = rewrite_request(&request, client_format, backend, &names)
            .map_err(|e| ProxyError::InvalidRequest(format!("{e:#}")))?;

        let model = request
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        debug!(
            "Forwarding {} request for {} to {} ({} tool(s), intercepting: {})",
            client_format,
            model,
            backend.chat_url(),
            rewritten.tools.len(),
            !names.is_empty()
        );

        let mut upstream = self.client.post(backend.chat_url()).json(&rewritten.body);
        if let Some(api_key) = &backend.api_key {
            upstream = upstream.bearer_auth(api_key);
        }
        let response = upstream
            .send()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))?;
        let response = check_response_error(response).await?;

        let capacity = self.config.channel_capacity.max(1);
        let (sink, frames) = mpsc::channel::<Bytes>(capacity);
        let bridge = StreamBridge::new(
            Arc::new(names),
            self.config.tool_calls.bridge_options(),
            backend.format,
            client_format,
        );
        let encoder = FrameEncoder::new(client_format, StreamMeta::new(model));
        let driver = BridgeDriver::new(
            bridge,
            self.converter.clone(),
            encoder,
            backend.format,
            sink,
            capacity,
        );
        tokio::spawn(driver.run(Box::new(HttpChunkStream::new(response))));

        let body = Body::from_stream(ReceiverStream::new(frames).map(Ok::<_, Infallible>));
        Response::builder()
            .header(CONTENT_TYPE, client_format.content_type())
            .header(CACHE_CONTROL, "no-cache")
            .body(body)
            .map_err(|e| ProxyError::Internal(e.to_string()))
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/api/chat", post(line_json_chat))
        .route("/health", get(health))
        .with_state(Arc::new(state))
}

/// Bind `config.listen` and serve until the process ends
pub async fn serve(config: ProxyConfig) -> Result<()> {
    let listen = config.listen;
    let state = AppState::new(config)?;
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {listen}"))?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, build_router(state))
        .await
        .context("Server error")
}

fn parse_body(body: &[u8]) -> Result<Value, ProxyError> {
    serde_json::from_slice(body).map_err(|e| ProxyError::MalformedJson(e.to_string()))
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let request = parse_body(&body)?;
    // Event-stream clients default to a single JSON response
    if request.get("stream").and_then(Value::as_bool) != Some(true) {
        return Err(ProxyError::NotStreaming);
    }
    state.proxy(request, WireFormat::EventStream).await
}

async fn line_json_chat(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let request = parse_body(&body)?;
    // Line-JSON clients stream unless told otherwise
    if request.get("stream").and_then(Value::as_bool) == Some(false) {
        return Err(ProxyError::NotStreaming);
    }
    state.proxy(request, WireFormat::LineJson).await
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}
