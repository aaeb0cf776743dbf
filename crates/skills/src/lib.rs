//! Filesystem-backed skill discovery, installation and readiness tracking.

pub mod aliases;
pub mod installer;
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod types;

pub use aliases::ToolAliasMap;
pub use manifest::{SkillManifest, SkillReadiness};
pub use registry::{ReadinessSummary, SkillsRegistry};
pub use types::{RiskTier, SkillEntry};
