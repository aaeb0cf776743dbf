//! Context pack assembly: builds the system-prompt-adjacent workspace
//! context injected into every turn, with truncation and reporting.

pub mod builder;
pub mod injection;
pub mod report;
pub mod truncation;

pub use builder::{ContextPackBuilder, SessionMode, WorkspaceFile};
pub use report::{ContextReport, FileReport};
