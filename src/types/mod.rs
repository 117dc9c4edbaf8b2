//! Core conversation types shared by every layer of the engine.

mod content;
mod message;
mod usage;

pub use content::{ContentBlock, ToolResultBlock, ToolResultContent, ToolUseBlock};
pub use message::{Message, Role};
pub use usage::{TokenUsage, TranscriptStats};
