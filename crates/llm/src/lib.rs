//! Wire formats for streaming chat backends
//!
//! This crate implements:
//! - The format-neutral `StreamChunk` both streaming framings are normalized to
//! - Event-stream framing (OpenAI chat completion chunks, `data: {json}` lines)
//! - Line-JSON framing (Ollama chat responses, one object per line)
//! - Byte-to-line frame decoding and chunk sources (HTTP or replayed)
//! - The `ChunkConverter` field-mapping interface and its default implementation
//! - Request field mapping between the two chat request shapes


mod utils;

pub mod convert;
pub mod ollama;
pub mod openai;
pub mod streaming;
pub mod types;

pub use convert::{ChunkConverter, ConversionContext, WireConverter};
pub use streaming::{ChunkStream, FrameDecoder, HttpChunkStream, ReplayChunkStream};
pub use types::*;
pub use utils::check_response_error;
