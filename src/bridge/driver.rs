//! Async driver: reads backend bytes, runs the bridge, queues converted frames

use super::encode::FrameEncoder;
use super::queue::{FrameTask, OrderedQueue, QueueClosed};
use super::state::{Emission, InboundChunk, StreamBridge};
use bytes::Bytes;
use llm::convert::decode_chunk;
use llm::openai::{parse_sse_line, SseEvent};
use llm::{ChunkConverter, ChunkStream, ConversionContext, FrameDecoder, WireError, WireFormat};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// Outcome of handling one backend line
enum LineOutcome {
    Continue,
    /// The backend signalled the end of its stream
    Finished,
    /// The backend reported an error; the stream cannot continue
    Failed(String),
    /// The client went away
    Disconnected,
}

pub struct BridgeDriver {
    bridge: StreamBridge,
    converter: Arc<dyn ChunkConverter>,
    context: Arc<ConversionContext>,
    encoder: FrameEncoder,
    source: WireFormat,
    queue: OrderedQueue,
    closed: bool,
}

impl BridgeDriver {
    pub fn new(
        bridge: StreamBridge,
        converter: Arc<dyn ChunkConverter>,
        encoder: FrameEncoder,
        source: WireFormat,
        sink: mpsc::Sender<Bytes>,
        capacity: usize,
    ) -> Self {
        let context = Arc::new(ConversionContext::new(encoder.meta().clone()));
        Self {
            bridge,
            converter,
            context,
            encoder,
            source,
            queue: OrderedQueue::spawn(sink, capacity),
            closed: false,
        }
    }

    /// Consume the backend stream to the end and write exactly one terminal marker
    pub async fn run(mut self, mut stream: Box<dyn ChunkStream>) {
        let mut decoder = FrameDecoder::new();

        loop {
            let lines = match stream.next_chunk().await {
                Ok(Some(bytes)) => decoder.push(&bytes),
                Ok(None) => {
                    if let Some(line) = decoder.finish() {
                        if let LineOutcome::Failed(message) = self.handle_line(&line).await {
                            self.fail(&message).await;
                            return;
                        }
                    }
                    break;
                }
                Err(e) => {
                    error!("Backend stream failed: {:#}", e);
                    self.fail(&e.to_string()).await;
                    return;
                }
            };

            for line in lines {
                match self.handle_line(&line).await {
                    LineOutcome::Continue => {}
                    LineOutcome::Finished => {
                        self.close().await;
                        return;
                    }
                    LineOutcome::Failed(message) => {
                        self.fail(&message).await;
                        return;
                    }
                    LineOutcome::Disconnected => {
                        debug!("Client disconnected; dropping backend stream");
                        self.queue.close().await;
                        return;
                    }
                }
            }
        }

        self.close().await;
    }

    async fn handle_line(&mut self, line: &str) -> LineOutcome {
        trace!("Backend line: {}", line);
        let payload = match self.source {
            WireFormat::EventStream => match parse_sse_line(line) {
                None => return LineOutcome::Continue,
                Some(SseEvent::Done) => return LineOutcome::Finished,
                Some(SseEvent::Data(data)) => data,
            },
            WireFormat::LineJson => line.to_string(),
        };

        let raw: Value = match serde_json::from_str(&payload) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Skipping malformed backend chunk: {}", e);
                return self.push_error(&e.to_string(), "invalid_chunk").await;
            }
        };

        let chunk = match decode_chunk(&raw, self.source) {
            Ok(chunk) => chunk,
            Err(WireError::Backend(message)) => return LineOutcome::Failed(message),
            Err(e) => {
                warn!("Skipping undecodable backend chunk: {}", e);
                return self.push_error(&e.to_string(), "invalid_chunk").await;
            }
        };
        let done = chunk.done;

        let emissions = self.bridge.on_chunk(InboundChunk { raw, chunk });
        if self.dispatch(emissions).await.is_err() {
            return LineOutcome::Disconnected;
        }

        if done {
            LineOutcome::Finished
        } else {
            LineOutcome::Continue
        }
    }

    async fn push_error(&self, message: &str, kind: &str) -> LineOutcome {
        match self.queue.push_ready(self.encoder.error(message, kind)).await {
            Ok(()) => LineOutcome::Continue,
            Err(QueueClosed) => LineOutcome::Disconnected,
        }
    }

    /// Queue emissions in order; passthrough chunks are converted asynchronously
    async fn dispatch(&self, emissions: Vec<Emission>) -> Result<(), QueueClosed> {
        for emission in emissions {
            let task: FrameTask = match emission {
                Emission::Passthrough(raw) => self.convert_task(raw),
                other => {
                    let frame = self.encoder.encode(&other, self.bridge.model());
                    Box::pin(async move { frame })
                }
            };
            self.queue.push(task).await?;
        }
        Ok(())
    }

    fn convert_task(&self, raw: Value) -> FrameTask {
        let converter = self.converter.clone();
        let context = self.context.clone();
        let encoder = self.encoder.clone();
        let source = self.source;

        Box::pin(async move {
            match converter
                .convert_chunk(&raw, source, encoder.target(), &context)
                .await
            {
                Ok(Some(converted)) => Some(encoder.frame(&converted)),
                Ok(None) => None,
                Err(e) => {
                    warn!("Chunk conversion failed: {:#}", e);
                    Some(encoder.error(&format!("{e:#}"), "conversion_error"))
                }
            }
        })
    }

    /// Error frame, then the terminal marker, then close
    async fn fail(&mut self, message: &str) {
        error!("Ending stream after backend error: {}", message);
        if self
            .queue
            .push_ready(self.encoder.error(message, "backend_error"))
            .await
            .is_ok()
        {
            let emissions = self.bridge.abort();
            let _ = self.dispatch(emissions).await;
        }
        self.close().await;
    }

    /// Resolve held state, write the terminal marker and wait for the writer. Idempotent.
    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let emissions = self.bridge.finish();
        if self.dispatch(emissions).await.is_err() {
            debug!("Client disconnected before the terminal marker");
        }
        self.queue.close().await;
    }
}
