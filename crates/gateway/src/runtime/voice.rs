//! Voice-mode helpers (spec 4.G "Voice mode"): stream sanitization and the
//! progress-filler state machine that lets a voice client TTS-speak
//! contextual acknowledgements while a tool call is outstanding.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use super::turn::TurnEvent;

/// Delays (from tool-dispatch start) at which a filler utterance fires if
/// the tool hasn't returned yet (spec 4.G: defaults 900ms, 4200ms, 8000ms).
const FILLER_DELAYS_MS: [u64; 3] = [900, 4200, 8000];

/// Generic contextual acknowledgements, indexed by stage (0..2). Kept short
/// and free of punctuation a TTS engine would stumble over.
const FILLER_TEXT: [&str; 3] = [
    "One moment",
    "Still working on that",
    "This is taking a little longer than usual",
];

/// Strip `[bracketed_tag]`-style markup from a stream delta before it
/// reaches a voice client (spec 4.G "Voice mode" (b)). Non-bracket text is
/// passed through unchanged; brackets that never close are dropped to end
/// of string rather than leaked raw.
pub fn strip_bracketed_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0u32;
    for ch in text.chars() {
        match ch {
            '[' => depth += 1,
            ']' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(ch),
            _ => {}
        }
    }
    out
}

/// One outstanding tool call's progress-filler timers. Spawns background
/// tasks that emit [`TurnEvent::Thought`]-shaped filler deltas at each stage
/// delay; cancelled the moment the real tool result arrives via `stop()`.
pub struct ProgressFiller {
    stop: Arc<Notify>,
}

impl ProgressFiller {
    /// Start the filler timers for one outstanding tool call. `tx` is the
    /// turn's event channel; `tool_name` labels the filler so a client can
    /// distinguish which pending call it belongs to.
    pub fn start(tx: mpsc::Sender<TurnEvent>, call_id: String, tool_name: String) -> Self {
        let stop = Arc::new(Notify::new());
        let stop_clone = stop.clone();

        tokio::spawn(async move {
            for (stage, delay_ms) in FILLER_DELAYS_MS.iter().enumerate() {
                tokio::select! {
                    _ = stop_clone.notified() => return,
                    _ = tokio::time::sleep(Duration::from_millis(*delay_ms)) => {
                        let _ = tx
                            .send(TurnEvent::Filler {
                                call_id: call_id.clone(),
                                tool_name: tool_name.clone(),
                                stage: stage as u8,
                                text: FILLER_TEXT[stage].to_string(),
                            })
                            .await;
                    }
                }
            }
        });

        Self { stop }
    }

    /// Cancel any timers that haven't fired yet (tool result arrived).
    pub fn stop(&self) {
        self.stop.notify_one();
    }
}

impl Drop for ProgressFiller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_single_tag() {
        assert_eq!(strip_bracketed_tags("hello [pause] world"), "hello  world");
    }

    #[test]
    fn strips_multiple_tags() {
        assert_eq!(
            strip_bracketed_tags("[tone:happy]Great news![/tone]"),
            "Great news!"
        );
    }

    #[test]
    fn passes_through_plain_text() {
        assert_eq!(strip_bracketed_tags("no tags here"), "no tags here");
    }

    #[test]
    fn unclosed_bracket_drops_rest() {
        assert_eq!(strip_bracketed_tags("keep this [dangling"), "keep this ");
    }

    #[test]
    fn unmatched_close_bracket_passes_through() {
        assert_eq!(strip_bracketed_tags("a] b"), "a] b");
    }
}
