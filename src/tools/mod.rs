// Tag scanning shared by detection and parsing
mod scan;
mod types;

// Streaming detection of tool invocations
pub mod buffer;
pub mod detect;
pub mod names;

// Fragment parsing and prompt generation
pub mod parse;
pub mod prompt;

pub use buffer::BoundedBuffer;
pub use detect::{detect, CandidateKind, Detection, PartialState};
pub use names::{ToolNames, WRAPPER_TAGS};
pub use parse::{extract_tool_calls, parse_fragment, parse_unterminated, Extraction};
pub use prompt::build_tool_prompt;
pub use types::{BufferOverflow, ExtractedToolCall, ToolError};
