//! Claude-Code mode (spec 4.G "Claude-Code mode"): an alternative turn path
//! that delegates the whole turn to an external CLI process instead of the
//! in-process tool loop in [`super::turn`]. The child's stdout is streamed
//! line-by-line; each line is either a structured envelope (tool-use/tool-
//! result) or raw text treated as an assistant delta. Cost is always zero
//! (no provider call was made by this process); persistence (spec step 8)
//! follows the same helpers the normal loop uses.

use std::process::Stdio;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::cancel::CancelToken;
use super::runs;
use super::turn::{TurnEvent, TurnInput};
use super::{maybe_set_title, persist_message_db, persist_transcript, resolve_or_create_conversation, truncate_str};
use crate::state::AppState;

/// One line of the external CLI's stdout protocol. Unrecognized or
/// non-JSON lines fall back to a plain text delta (`Text`) via
/// [`parse_line`] rather than being dropped.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CliEnvelope {
    Text { text: String },
    ToolUse { call_id: String, name: String, input: serde_json::Value },
    ToolResult { call_id: String, content: String, #[serde(default)] is_error: bool },
    Done,
    Error { message: String },
}

fn parse_line(line: &str) -> Option<CliEnvelope> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<CliEnvelope>(trimmed) {
        Ok(env) => Some(env),
        Err(_) => Some(CliEnvelope::Text { text: format!("{line}\n") }),
    }
}

/// Run one turn by delegating to the configured external CLI.
pub(super) async fn run(
    state: &AppState,
    input: TurnInput,
    tx: mpsc::Sender<TurnEvent>,
    cancel: &CancelToken,
    run_id: uuid::Uuid,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let agent_id = input
        .agent
        .as_ref()
        .map(|a| a.agent_id.as_str())
        .unwrap_or("default");
    let conversation_id = resolve_or_create_conversation(state, &input.session_key, agent_id).map(|c| c.id);
    persist_message_db(
        state,
        conversation_id,
        sa_storage::model::MessageRole::User,
        Some(&input.user_message),
        serde_json::json!([]),
        serde_json::json!([]),
        None,
        sa_storage::model::TokenUsage::default(),
    );
    persist_transcript(
        &state.transcripts,
        &input.session_id,
        "user",
        &input.user_message,
        None,
        Some(state.sessions.search_index()),
    )
    .await;

    let cfg = &state.config.claude_code;
    let mut cmd = Command::new(&cfg.command);
    cmd.args(&cfg.args)
        .arg(&input.user_message)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &cfg.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            let message = format!("claude-code mode: failed to spawn `{}`: {e}", cfg.command);
            let _ = tx.send(TurnEvent::Error { message: message.clone() }).await;
            state.run_store.update(&run_id, |r| {
                r.error = Some(message);
                r.finish(runs::RunStatus::Failed);
            });
            if let Some(run) = state.run_store.get(&run_id) {
                state.run_store.persist(&run);
            }
            state.run_store.cleanup_channel(&run_id);
            return Ok(());
        }
    };

    let stdout = child.stdout.take().expect("piped stdout");
    let mut lines = BufReader::new(stdout).lines();

    let mut text_buf = String::new();
    let mut was_cancelled = false;

    loop {
        if cancel.is_cancelled() {
            was_cancelled = true;
            break;
        }

        let next = tokio::time::timeout(
            std::time::Duration::from_millis(cfg.timeout_ms),
            lines.next_line(),
        )
        .await;

        let line = match next {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => break, // EOF
            Ok(Err(e)) => {
                let _ = tx
                    .send(TurnEvent::Error { message: format!("claude-code mode: read error: {e}") })
                    .await;
                break;
            }
            Err(_) => {
                let _ = tx
                    .send(TurnEvent::Error { message: "claude-code mode: timed out".into() })
                    .await;
                was_cancelled = true;
                break;
            }
        };

        match parse_line(&line) {
            Some(CliEnvelope::Text { text }) => {
                text_buf.push_str(&text);
                let delivered = if input.voice_mode { super::voice::strip_bracketed_tags(&text) } else { text };
                if !delivered.is_empty() {
                    let _ = tx.send(TurnEvent::AssistantDelta { text: delivered }).await;
                }
            }
            Some(CliEnvelope::ToolUse { call_id, name, input: tool_input }) => {
                let _ = tx
                    .send(TurnEvent::ToolCallEvent { call_id, tool_name: name, arguments: tool_input })
                    .await;
            }
            Some(CliEnvelope::ToolResult { call_id, content, is_error }) => {
                let _ = tx
                    .send(TurnEvent::ToolResult {
                        call_id,
                        tool_name: String::new(),
                        content,
                        is_error,
                    })
                    .await;
            }
            Some(CliEnvelope::Done) => break,
            Some(CliEnvelope::Error { message }) => {
                let _ = tx.send(TurnEvent::Error { message }).await;
                break;
            }
            None => {}
        }
    }

    let _ = child.kill().await;

    if was_cancelled {
        let interrupted = match cancel.spoken_text() {
            Some(spoken) => format!("{spoken} [Interrupted by user]"),
            None if !text_buf.is_empty() => format!("{text_buf} [Interrupted by user]"),
            None => String::new(),
        };
        if !interrupted.is_empty() {
            persist_message_db(
                state,
                conversation_id,
                sa_storage::model::MessageRole::Assistant,
                Some(&interrupted),
                serde_json::json!([]),
                serde_json::json!([]),
                None,
                sa_storage::model::TokenUsage::default(),
            );
        }
        state.run_store.update(&run_id, |r| {
            r.output_preview = Some(truncate_str(&interrupted, 200));
            r.finish(runs::RunStatus::Stopped);
        });
        if let Some(run) = state.run_store.get(&run_id) {
            state.run_store.persist(&run);
        }
        state.run_store.cleanup_channel(&run_id);
        let _ = tx.send(TurnEvent::Stopped { content: interrupted }).await;
        return Ok(());
    }

    persist_transcript(
        &state.transcripts,
        &input.session_id,
        "assistant",
        &text_buf,
        None,
        Some(state.sessions.search_index()),
    )
    .await;

    let message_id = persist_message_db(
        state,
        conversation_id,
        sa_storage::model::MessageRole::Assistant,
        Some(&text_buf),
        serde_json::json!([]),
        serde_json::json!([]),
        Some("claude-code"),
        sa_storage::model::TokenUsage::default(),
    );
    if let Some(cid) = conversation_id {
        maybe_set_title(state, cid, &input.user_message);
        if let Err(e) = state.db.touch_conversation(cid) {
            tracing::warn!(error = %e, "failed to touch conversation updated_at");
        }
    }

    let _ = tx
        .send(TurnEvent::Final { content: text_buf.clone(), message_id })
        .await;
    let _ = tx
        .send(TurnEvent::UsageEvent { input_tokens: 0, output_tokens: 0, total_tokens: 0 })
        .await;

    state.run_store.update(&run_id, |r| {
        r.output_preview = Some(truncate_str(&text_buf, 200));
        r.estimated_cost_usd = 0.0;
        r.finish(runs::RunStatus::Completed);
    });
    if let Some(run) = state.run_store.get(&run_id) {
        state.run_store.persist(&run);
    }
    state.run_store.emit(
        &run_id,
        runs::RunEvent::RunStatus { run_id, status: runs::RunStatus::Completed },
    );
    state.run_store.cleanup_channel(&run_id);

    Ok(())
}
