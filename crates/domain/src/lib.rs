//! Shared domain types for SerialAgent: config, errors, provider-agnostic
//! tool/stream formats, capability advertisement and structured trace events.

pub mod capability;
pub mod config;
pub mod error;
pub mod stream;
pub mod tool;
pub mod trace;

pub use capability::{LlmCapabilities, ToolSupport};
pub use config::Config;
pub use error::{Error, Result};
pub use stream::{StreamEvent, Usage};
pub use tool::{ToolCall, ToolDefinition};
pub use trace::TraceEvent;
