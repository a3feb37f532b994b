//! Ordered per-stream output queue
//!
//! Frames are produced by futures that may complete out of order (chunk conversion is async).
//! The queue runs them concurrently but writes their results strictly in submission order, and
//! a bounded task channel plus the bounded sink propagate downstream backpressure to the reader.

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

pub type FrameTask = BoxFuture<'static, Option<Bytes>>;

/// The downstream side stopped accepting frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Output stream closed by the client")]
pub struct QueueClosed;

pub struct OrderedQueue {
    tasks: Option<mpsc::Sender<FrameTask>>,
    writer: Option<JoinHandle<()>>,
}

impl OrderedQueue {
    /// Start the writer task. At most `capacity` frame tasks are queued or in flight.
    pub fn spawn(sink: mpsc::Sender<Bytes>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tasks, receiver) = mpsc::channel::<FrameTask>(capacity);

        let writer = tokio::spawn(async move {
            let mut frames = ReceiverStream::new(receiver).buffered(capacity);
            while let Some(frame) = frames.next().await {
                let Some(bytes) = frame else { continue };
                if sink.send(bytes).await.is_err() {
                    debug!("Client disconnected; stopping output writer");
                    break;
                }
            }
        });

        Self {
            tasks: Some(tasks),
            writer: Some(writer),
        }
    }

    /// Queue a frame future behind everything submitted before it
    pub async fn push(&self, task: FrameTask) -> Result<(), QueueClosed> {
        let Some(tasks) = &self.tasks else {
            return Err(QueueClosed);
        };
        tasks.send(task).await.map_err(|_| QueueClosed)
    }

    /// Queue a frame that is already encoded
    pub async fn push_ready(&self, frame: Bytes) -> Result<(), QueueClosed> {
        self.push(Box::pin(async move { Some(frame) })).await
    }

    /// Wait until every queued frame has been written. Only the first call has any effect.
    pub async fn close(&mut self) {
        // Dropping the sender ends the task stream once it drains
        drop(self.tasks.take());
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                warn!("Output writer failed: {}", e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tasks.is_none()
    }
}
