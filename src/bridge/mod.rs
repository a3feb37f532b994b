//! Per-request stream bridge: tool-call interception plus protocol conversion

mod driver;
mod encode;
mod queue;
mod state;

#[cfg(test)]
mod tests;

pub use driver::BridgeDriver;
pub use encode::FrameEncoder;
pub use queue::{FrameTask, OrderedQueue, QueueClosed};
pub use state::{
    BridgeOptions, BridgeState, Emission, InboundChunk, Phase, StreamBridge, ToolCallPolicy,
};
