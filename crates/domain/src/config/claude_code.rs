use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Claude-Code mode (spec 4.G "Claude-Code mode")
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Settings for the alternative turn path that delegates the whole turn to
/// an external CLI process instead of the in-process tool loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeCodeConfig {
    /// Executable to spawn (resolved via `PATH` unless absolute).
    #[serde(default = "d_command")]
    pub command: String,
    /// Extra args appended before the prompt argument.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the child process. Defaults to the
    /// workspace root when unset.
    #[serde(default)]
    pub working_dir: Option<std::path::PathBuf>,
    /// Wall-clock cap on the whole turn (spec §5 timeouts apply equally
    /// to this mode; default mirrors the provider stream's 120s cap).
    #[serde(default = "d_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ClaudeCodeConfig {
    fn default() -> Self {
        Self {
            command: d_command(),
            args: Vec::new(),
            working_dir: None,
            timeout_ms: d_timeout_ms(),
        }
    }
}

fn d_command() -> String {
    "claude".into()
}

fn d_timeout_ms() -> u64 {
    120_000
}
