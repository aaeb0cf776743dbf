//! Turn execution loop — the inner orchestrator that streams LLM
//! responses, dispatches tool calls, and tracks run state.
//!
//! Entry point: [`run_turn`] spawns the async loop and returns a
//! channel of [`TurnEvent`]s.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::Instrument;

use sa_domain::stream::{StreamEvent, Usage};
use sa_domain::tool::{Message, ToolCall, ToolDefinition};

use crate::state::AppState;

use super::agent;
use super::cancel::CancelToken;
use super::compact;
use super::runs;
use super::tools;
use super::voice;
use super::{
    build_assistant_tool_message, build_memory_digest, build_system_context, fire_auto_capture,
    load_raw_transcript, maybe_set_title, persist_message_db, persist_transcript,
    resolve_or_create_conversation, resolve_provider, resolve_summarizer,
    transcript_lines_to_messages, truncate_str,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transient-provider handling (spec 7)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// No data at all for this long on an open stream counts as a stall.
const STREAM_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
/// Hard ceiling on total time spent reading one streamed response.
const STREAM_OVERALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);
const PROVIDER_RETRY_BASE_MS: u64 = 500;
const PROVIDER_RETRY_CAP_MS: u64 = 4_000;

/// Delay before retry attempt `attempt` (0-indexed): doubles from a
/// 500ms base, capped at 4s.
fn provider_retry_delay(attempt: u32) -> std::time::Duration {
    let ms = PROVIDER_RETRY_BASE_MS.saturating_mul(1u64 << attempt).min(PROVIDER_RETRY_CAP_MS);
    std::time::Duration::from_millis(ms)
}

/// 429 and 5xx provider responses are treated as transient and worth one
/// retry; everything else (4xx auth/validation errors, malformed
/// responses) is terminal on first failure.
fn is_transient_provider_error(err: &sa_domain::error::Error) -> bool {
    let message = match err {
        sa_domain::error::Error::Provider { message, .. } => message,
        sa_domain::error::Error::Http(message) => message,
        _ => return false,
    };
    let Some(code) = message.strip_prefix("HTTP ").and_then(|s| s.split(' ').next()) else {
        return false;
    };
    matches!(code.parse::<u16>(), Ok(429) | Ok(500..=599))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnContext — pre-built state for one turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the tool loop needs, built once before the first LLM call.
pub(super) struct TurnContext {
    provider: Arc<dyn sa_providers::LlmProvider>,
    /// Model resolved by [`resolve_provider`] (smart router / agent mapping).
    /// Falls back to the request's explicit override when `None`.
    resolved_model: Option<String>,
    messages: Vec<Message>,
    tool_defs: Arc<Vec<ToolDefinition>>,
    /// Task class + provider id the turn was actually routed to, for the
    /// `routed` event.
    route_info: (sa_storage::model::TaskClass, String),
    /// Durable Conversation row backing this turn (spec §3/§4.G step 1),
    /// `None` only when the storage layer itself failed.
    conversation_id: Option<uuid::Uuid>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnEvent — the SSE event type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted during a single agent turn.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TurnEvent {
    /// Reasoning/thinking content from the model.
    #[serde(rename = "thought")]
    Thought { content: String },

    /// Incremental text from the assistant.
    #[serde(rename = "assistant_delta")]
    AssistantDelta { text: String },

    /// The model is invoking a tool.
    #[serde(rename = "tool_call")]
    ToolCallEvent {
        call_id: String,
        tool_name: String,
        arguments: Value,
    },

    /// Tool execution result.
    #[serde(rename = "tool_result")]
    ToolResult {
        call_id: String,
        tool_name: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },

    /// The final assistant message (full text).
    #[serde(rename = "final")]
    Final {
        content: String,
        /// Id of the persisted assistant message row, or `None` if the
        /// durable write failed (spec §7: `chat.done.message_id=null`).
        message_id: Option<uuid::Uuid>,
    },

    /// The turn was stopped by a cancellation request.
    #[serde(rename = "stopped")]
    Stopped {
        /// Partial content accumulated before the stop.
        content: String,
    },

    /// An error occurred.
    #[serde(rename = "error")]
    Error { message: String },

    /// Token usage for the turn.
    #[serde(rename = "usage")]
    UsageEvent {
        input_tokens: u32,
        output_tokens: u32,
        total_tokens: u32,
    },

    /// The routing decision made before the first provider call (spec 4.G
    /// step 5 / spec 4.A).
    #[serde(rename = "routed")]
    Routed {
        task_class: String,
        provider: String,
        model: Option<String>,
    },

    /// A short imperative plan derived from the pending tool calls,
    /// emitted once before the first tool dispatch of a loop iteration
    /// (spec 4.G step 7).
    #[serde(rename = "plan")]
    Plan { steps: Vec<String> },

    /// A sub-agent delegation started via `agent.run` (spec 4.G.9).
    #[serde(rename = "agent_spawn")]
    AgentSpawn {
        call_id: String,
        agent_id: String,
        task: String,
    },

    /// A sub-agent delegation finished.
    #[serde(rename = "agent_result")]
    AgentResult {
        call_id: String,
        agent_id: String,
        success: bool,
        duration_ms: u64,
    },

    /// Voice-mode contextual acknowledgement emitted while a tool call is
    /// still outstanding (spec 4.G "Voice mode" progress fillers).
    #[serde(rename = "filler")]
    Filler {
        call_id: String,
        tool_name: String,
        stage: u8,
        text: String,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run parameters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The execution path a turn takes (spec 4.G "Claude-Code mode" / "Voice
/// mode"). `Default` is the normal in-process tool loop in this file;
/// `ClaudeCode` delegates the whole turn to an external CLI
/// ([`super::claude_code`]); `Voice` stays on the normal loop but layers
/// mandatory tool-intent gating, bracketed-tag stripping, and progress
/// fillers on top (driven by `TurnInput::voice_mode`, kept as a separate
/// bool rather than folded into this enum since voice-ness and
/// claude-code-ness are independent axes in principle even though no
/// caller currently combines them).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnMode {
    #[default]
    Default,
    ClaudeCode,
}

/// Input to a single turn.
pub struct TurnInput {
    pub session_key: String,
    pub session_id: String,
    pub user_message: String,
    /// Model override (e.g. "openai/gpt-4o"). None = use role default.
    pub model: Option<String>,
    /// Controls the response format (text, json_object, json_schema).
    pub response_format: Option<sa_providers::ResponseFormat>,
    /// When running as a sub-agent, carries agent-scoped overrides.
    pub agent: Option<agent::AgentContext>,
    /// Whether the tool loop is available at all (spec 4.G step 4). When
    /// `false` the turn never offers tool definitions to the model.
    pub enable_tools: bool,
    /// Skip the tool-intent gate and always route to the `tool` task class,
    /// retrying once with a stronger instruction if the first response
    /// comes back with no tool calls (spec 4.G step 6).
    pub force_tool_use: bool,
    /// Inject a best-effort Memory Store digest into the system prompt
    /// (spec 4.G step 3c). Voice mode forces this off when the tool-intent
    /// gate doesn't match, regardless of this flag.
    pub include_memory: bool,
    /// Appended verbatim after the assembled system prompt (spec 4.G step 3d).
    pub system_prompt_suffix: Option<String>,
    /// Treat this turn as voice-originated (spec 4.G "Voice mode"): mandatory
    /// tool-intent gating, `[bracketed_tag]` stripped from stream deltas,
    /// and progress-filler scheduling around outstanding tool calls.
    pub voice_mode: bool,
    /// Delegation nesting depth (0 = top-level conversation). Propagated
    /// into the `agent` context's depth when this turn itself delegates.
    pub depth: u32,
    /// Execution path (spec 4.G "Claude-Code mode"). Defaults to the normal
    /// in-process tool loop below.
    pub mode: TurnMode,
}

impl TurnInput {
    /// Convenience constructor for the common top-level-conversation case:
    /// tools on, no forced tool use, memory injection on, no voice mode.
    pub fn new(session_key: String, session_id: String, user_message: String) -> Self {
        Self {
            session_key,
            session_id,
            user_message,
            model: None,
            response_format: None,
            agent: None,
            enable_tools: true,
            force_tool_use: false,
            include_memory: true,
            system_prompt_suffix: None,
            voice_mode: false,
            depth: 0,
            mode: TurnMode::Default,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_turn — the core orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one agent turn: build context, call LLM, dispatch tools, loop.
///
/// Returns the `run_id` (UUID) and a channel receiver of [`TurnEvent`]s
/// (the caller reads events as they arrive for SSE streaming, or drains
/// them for non-streaming).
///
/// Registers a cancel token so `POST /v1/sessions/:key/stop` can abort
/// the turn cleanly.
pub fn run_turn(
    state: AppState,
    input: TurnInput,
) -> (uuid::Uuid, mpsc::Receiver<TurnEvent>) {
    let (tx, rx) = mpsc::channel::<TurnEvent>(64);

    // ── Create run record ────────────────────────────────────────
    let mut run = runs::Run::new(
        input.session_key.clone(),
        input.session_id.clone(),
        &input.user_message,
    );
    run.model = input.model.clone();
    run.agent_id = input.agent.as_ref().map(|a| a.agent_id.clone());
    run.status = runs::RunStatus::Running;
    let run_id = run.run_id;
    state.run_store.insert(run);
    state.run_store.emit(
        &run_id,
        runs::RunEvent::RunStatus {
            run_id,
            status: runs::RunStatus::Running,
        },
    );

    // Register a cancel token for this session.
    let cancel_token = state.cancel_map.register(&input.session_key);
    let session_key = input.session_key.clone();
    let state_ref = state;

    let turn_span = tracing::info_span!(
        "turn",
        %run_id,
        session_key = %session_key,
        "otel.kind" = "SERVER",
    );
    tokio::spawn(tracing::Instrument::instrument(async move {
        tracing::debug!("turn started");
        let result =
            run_turn_inner(state_ref.clone(), input, tx.clone(), &cancel_token, run_id).await;

        // Cleanup: remove the cancel token.
        state_ref.cancel_map.remove(&session_key);

        if let Err(e) = result {
            let err_msg = e.to_string();
            state_ref.run_store.update(&run_id, |r| {
                r.error = Some(err_msg.clone());
                r.finish(runs::RunStatus::Failed);
            });
            if let Some(run) = state_ref.run_store.get(&run_id) {
                state_ref.run_store.persist(&run);
            }
            state_ref.run_store.emit(
                &run_id,
                runs::RunEvent::RunStatus {
                    run_id,
                    status: runs::RunStatus::Failed,
                },
            );
            state_ref.run_store.cleanup_channel(&run_id);
            let _ = tx
                .send(TurnEvent::Error {
                    message: err_msg,
                })
                .await;
        }
    }, turn_span));

    (run_id, rx)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Extracted helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle a cancellation event: update the run store, persist a
/// transcript marker, and send a [`TurnEvent::Stopped`] to the caller.
///
/// Used by the streaming and tool-dispatch cancellation sites.
#[allow(clippy::too_many_arguments)]
async fn handle_cancellation(
    state: &AppState,
    tx: &mpsc::Sender<TurnEvent>,
    session_id: &str,
    run_id: uuid::Uuid,
    partial_content: &str,
    context_msg: &str,
    cancel: &CancelToken,
    conversation_id: Option<uuid::Uuid>,
) {
    state.run_store.update(&run_id, |r| {
        r.output_preview = Some(truncate_str(partial_content, 200));
        r.finish(runs::RunStatus::Stopped);
    });
    if let Some(run) = state.run_store.get(&run_id) {
        state.run_store.persist(&run);
    }
    state.run_store.emit(
        &run_id,
        runs::RunEvent::RunStatus {
            run_id,
            status: runs::RunStatus::Stopped,
        },
    );
    state.run_store.cleanup_channel(&run_id);
    persist_transcript(
        &state.transcripts,
        session_id,
        "system",
        &format!(
            "[run aborted by user{context_msg}]{}",
            if partial_content.is_empty() {
                String::new()
            } else {
                format!(" partial: {partial_content}")
            }
        ),
        Some(serde_json::json!({ "stopped": true })),
        Some(state.sessions.search_index()),
    )
    .await;

    // `chat.interrupt {messageId, spokenText}` (spec §4.H): the persisted
    // assistant message becomes `spokenText + " [Interrupted by user]"`
    // rather than the raw partial stream content. A plain REST-triggered
    // stop (no spokenText) persists the partial draft with the same suffix.
    let interrupted_content = match cancel.spoken_text() {
        Some(spoken) => format!("{spoken} [Interrupted by user]"),
        None if !partial_content.is_empty() => {
            format!("{partial_content} [Interrupted by user]")
        }
        None => String::new(),
    };
    if !interrupted_content.is_empty() {
        persist_message_db(
            state,
            conversation_id,
            sa_storage::model::MessageRole::Assistant,
            Some(&interrupted_content),
            serde_json::json!([]),
            serde_json::json!([]),
            None,
            sa_storage::model::TokenUsage::default(),
        );
    }

    let _ = tx
        .send(TurnEvent::Stopped {
            content: interrupted_content,
        })
        .await;
}

/// Finalize a successful run: persist the assistant transcript, send
/// Final + Usage events, record usage in the session store, update and
/// persist the run, emit completion events, and fire auto-capture.
async fn finalize_run_success(
    state: &AppState,
    tx: &mpsc::Sender<TurnEvent>,
    input: &TurnInput,
    run_id: uuid::Uuid,
    text_buf: &str,
    total_usage: &Usage,
    conversation_id: Option<uuid::Uuid>,
    effective_model: Option<&str>,
    route_info: &(sa_storage::model::TaskClass, String),
) {
    persist_transcript(
        &state.transcripts,
        &input.session_id,
        "assistant",
        text_buf,
        None,
        Some(state.sessions.search_index()),
    )
    .await;

    let message_id = persist_message_db(
        state,
        conversation_id,
        sa_storage::model::MessageRole::Assistant,
        Some(text_buf),
        serde_json::json!([]),
        serde_json::json!([]),
        effective_model,
        sa_storage::model::TokenUsage {
            input_tokens: total_usage.prompt_tokens,
            output_tokens: total_usage.completion_tokens,
            ..Default::default()
        },
    );
    if let Some(cid) = conversation_id {
        maybe_set_title(state, cid, &input.user_message);
        if let Err(e) = state.db.touch_conversation(cid) {
            tracing::warn!(error = %e, "failed to touch conversation updated_at");
        }
    }

    let _ = tx
        .send(TurnEvent::Final {
            content: text_buf.to_string(),
            message_id,
        })
        .await;

    let _ = tx
        .send(TurnEvent::UsageEvent {
            input_tokens: total_usage.prompt_tokens,
            output_tokens: total_usage.completion_tokens,
            total_tokens: total_usage.total_tokens,
        })
        .await;

    state.sessions.record_usage(
        &input.session_key,
        total_usage.prompt_tokens as u64,
        total_usage.completion_tokens as u64,
    );

    // ── Finalize run (success) ───────────────────────────
    let pricing_map = &state.config.llm.pricing;
    state.run_store.update(&run_id, |r| {
        r.input_tokens = total_usage.prompt_tokens;
        r.output_tokens = total_usage.completion_tokens;
        r.total_tokens = total_usage.total_tokens;
        r.output_preview = Some(truncate_str(text_buf, 200));
        // Compute estimated cost from per-model pricing config.
        if let Some(model_name) = r.model.as_deref() {
            if let Some(pricing) = pricing_map.get(model_name) {
                r.estimated_cost_usd =
                    pricing.estimate_cost(total_usage.prompt_tokens, total_usage.completion_tokens);
            }
        }
        r.finish(runs::RunStatus::Completed);
    });
    if let Some(run) = state.run_store.get(&run_id) {
        state.run_store.persist(&run);
    }
    state.run_store.emit(
        &run_id,
        runs::RunEvent::RunStatus {
            run_id,
            status: runs::RunStatus::Completed,
        },
    );
    state.run_store.emit(
        &run_id,
        runs::RunEvent::Usage {
            run_id,
            input_tokens: total_usage.prompt_tokens,
            output_tokens: total_usage.completion_tokens,
            total_tokens: total_usage.total_tokens,
        },
    );
    state.run_store.cleanup_channel(&run_id);

    // ── Record usage against quota tracker ─────────────────
    let estimated_cost = state
        .run_store
        .get(&run_id)
        .map(|r| r.estimated_cost_usd)
        .unwrap_or(0.0);
    {
        state.quota_tracker.record_usage(
            input.agent.as_ref().map(|a| a.agent_id.as_str()),
            total_usage.total_tokens as u64,
            estimated_cost,
        );
    }

    // ── Model Router usage ledger (spec 4.A record_usage) ──
    // Append-only, best-effort: failures are logged, never propagated
    // into the turn result (P9).
    if let Err(e) = state.db.record_usage(sa_storage::usage::NewUsage {
        provider: &route_info.1,
        model: effective_model.unwrap_or("unknown"),
        task: route_info.0,
        input_tokens: total_usage.prompt_tokens,
        output_tokens: total_usage.completion_tokens,
        cost_usd: estimated_cost,
        latency_ms: 0,
        conversation_id,
        agent_id: input.agent.as_ref().map(|a| a.agent_id.as_str()),
        error: None,
    }) {
        tracing::warn!(error = %e, "failed to record model-router usage (non-fatal)");
    }

    // ── Memory auto-capture (fire-and-forget) ─────────────
    fire_auto_capture(state, input, text_buf);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_turn_inner — the main tool loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_turn_inner(
    state: AppState,
    input: TurnInput,
    tx: mpsc::Sender<TurnEvent>,
    cancel: &CancelToken,
    run_id: uuid::Uuid,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut node_seq: u32 = 0;

    // ── Pre-flight: quota check ─────────────────────────────────────────
    {
        let agent_id = input.agent.as_ref().map(|a| a.agent_id.as_str());
        if let Err(exceeded) = state.quota_tracker.check_quota(agent_id) {
            let msg = format!(
                "daily {} quota exceeded: {:.2}/{:.2}",
                exceeded.kind, exceeded.used, exceeded.limit,
            );
            let _ = tx.send(TurnEvent::Error { message: msg }).await;
            state.run_store.update(&run_id, |r| {
                r.error = Some(format!("quota exceeded: {}", exceeded.kind));
                r.finish(runs::RunStatus::Failed);
            });
            if let Some(run) = state.run_store.get(&run_id) {
                state.run_store.persist(&run);
            }
            state.run_store.emit(
                &run_id,
                runs::RunEvent::RunStatus {
                    run_id,
                    status: runs::RunStatus::Failed,
                },
            );
            state.run_store.cleanup_channel(&run_id);
            return Ok(());
        }
    }

    // ── Claude-Code mode: delegate the whole turn to an external CLI ─────
    // (spec 4.G "Claude-Code mode"). Persistence (step 8) still applies,
    // handled inside `claude_code::run` via the same `persist_*` helpers.
    if input.mode == TurnMode::ClaudeCode {
        return super::claude_code::run(&state, input, tx, cancel, run_id).await;
    }

    // ── Phase 1: Build the turn context (provider, messages, tool defs) ──
    let ctx = prepare_turn_context(&state, &input).await?;
    let TurnContext {
        provider,
        resolved_model,
        mut messages,
        tool_defs,
        route_info,
        conversation_id,
    } = ctx;
    let effective_model = resolved_model.or_else(|| input.model.clone());

    let _ = tx
        .send(TurnEvent::Routed {
            task_class: route_info.0.to_string(),
            provider: route_info.1.clone(),
            model: effective_model.clone(),
        })
        .await;

    // Force-tool-use retry state (spec 4.G step 6): if the turn requires a
    // tool call and the first response comes back with none, retry once
    // with a stronger instruction appended to the user message.
    let mut force_retry_done = false;

    // Plan frame (spec 5 / 8-P8) fires at most once per turn, before the
    // first tool dispatch — not once per loop iteration.
    let mut plan_emitted = false;

    // ── Phase 2: Tool loop ───────────────────────────────────────────────
    let mut total_usage = Usage {
        prompt_tokens: 0,
        completion_tokens: 0,
        total_tokens: 0,
    };

    let max_tool_loops = state.config.tools.max_tool_loops.max(1);

    for loop_idx in 0..max_tool_loops {
        tracing::debug!(loop_idx, "tool loop iteration");
        // ── Check cancellation before each LLM call ──────────────
        // (lightweight: no run-store update since we haven't started yet)
        if cancel.is_cancelled() {
            persist_transcript(
                &state.transcripts,
                &input.session_id,
                "system",
                "[run aborted by user]",
                Some(serde_json::json!({ "stopped": true })),
                Some(state.sessions.search_index()),
            )
            .await;
            let _ = tx
                .send(TurnEvent::Stopped {
                    content: String::new(),
                })
                .await;
            return Ok(());
        }

        // ── Track LLM node ────────────────────────────────────────
        node_seq += 1;
        let llm_node_id = node_seq;
        let llm_start = chrono::Utc::now();
        let llm_node = runs::RunNode {
            node_id: llm_node_id,
            kind: runs::NodeKind::LlmRequest,
            name: "llm".into(),
            status: runs::RunStatus::Running,
            started_at: llm_start,
            ended_at: None,
            duration_ms: None,
            input_preview: None,
            output_preview: None,
            is_error: false,
            input_tokens: 0,
            output_tokens: 0,
        };
        state.run_store.update(&run_id, |r| {
            r.loop_count = loop_idx as u32 + 1;
            r.nodes.push(llm_node.clone());
        });
        state.run_store.emit(
            &run_id,
            runs::RunEvent::NodeStarted {
                run_id,
                node: llm_node,
            },
        );

        // Call LLM (streaming).
        let req = sa_providers::ChatRequest {
            messages: messages.clone(),
            tools: (*tool_defs).clone(),
            temperature: Some(0.2),
            max_tokens: None,
            response_format: input
                .response_format
                .clone()
                .unwrap_or_default(),
            model: effective_model.clone(),
        };

        let llm_call_span = tracing::info_span!(
            "llm.call",
            "otel.kind" = "CLIENT",
            model = req.model.as_deref().unwrap_or("default"),
            input_tokens = tracing::field::Empty,
            output_tokens = tracing::field::Empty,
        );

        // Enter the span for the entire LLM interaction (connect + stream
        // consumption + token recording) so OTel captures the full duration.
        let _llm_guard = llm_call_span.enter();

        // Accumulate the response. Reset on every retry attempt below —
        // a retried request re-streams the whole answer from scratch.
        let mut text_buf = String::new();
        let mut pending_tool_calls: Vec<ToolCall> = Vec::new();
        let mut turn_usage: Option<Usage> = None;
        let mut was_cancelled = false;
        let mut tc_bufs: std::collections::HashMap<String, (String, String)> =
            std::collections::HashMap::new(); // call_id -> (name, args_json)

        // Transient-provider handling (spec 7): a single retry with
        // exponential backoff on 429/5xx, and an idle/overall timeout on
        // the stream read that surfaces `Error::ProviderTimeout`. Both
        // failure modes share the same terminal path below.
        let mut stream_failure: Option<sa_domain::error::Error> = None;

        'attempts: for attempt in 0..2u32 {
            if attempt > 0 {
                text_buf.clear();
                pending_tool_calls.clear();
                tc_bufs.clear();
                turn_usage = None;
                stream_failure = None;
            }

            let mut stream = match provider.chat_stream(&req).await {
                Ok(s) => s,
                Err(e) if attempt == 0 && is_transient_provider_error(&e) => {
                    let delay = provider_retry_delay(attempt);
                    tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "transient provider error on connect, retrying");
                    tokio::time::sleep(delay).await;
                    continue 'attempts;
                }
                Err(e) => {
                    stream_failure = Some(e);
                    break 'attempts;
                }
            };

            let deadline = tokio::time::Instant::now() + STREAM_OVERALL_TIMEOUT;
            let mut retry_after_stream = false;

            loop {
                let now = tokio::time::Instant::now();
                let remaining = if now >= deadline {
                    std::time::Duration::ZERO
                } else {
                    deadline - now
                };
                if remaining.is_zero() {
                    stream_failure = Some(sa_domain::error::Error::ProviderTimeout(format!(
                        "stream exceeded {}s overall timeout",
                        STREAM_OVERALL_TIMEOUT.as_secs()
                    )));
                    break;
                }

                let event_result = match tokio::time::timeout(remaining.min(STREAM_IDLE_TIMEOUT), stream.next()).await {
                    Ok(Some(r)) => r,
                    Ok(None) => break, // stream ended cleanly
                    Err(_) => {
                        stream_failure = Some(sa_domain::error::Error::ProviderTimeout(format!(
                            "no data received for {}s",
                            STREAM_IDLE_TIMEOUT.as_secs()
                        )));
                        break;
                    }
                };

                // Check cancellation during streaming.
                if cancel.is_cancelled() {
                    was_cancelled = true;
                    break;
                }

                let event = match event_result {
                    Ok(ev) => ev,
                    Err(e) => {
                        if attempt == 0 && is_transient_provider_error(&e) {
                            retry_after_stream = true;
                        }
                        stream_failure = Some(e);
                        break;
                    }
                };
                match event {
                    StreamEvent::Thinking { text } => {
                        let _ = tx
                            .send(TurnEvent::Thought { content: text })
                            .await;
                    }
                    StreamEvent::Token { text } => {
                        // Voice mode (spec 4.G (b)): strip `[bracketed_tag]`
                        // markup from the delta delivered to the client, but
                        // keep the raw text in the accumulated draft so it is
                        // persisted and fed back to the model unmodified.
                        let delivered = if input.voice_mode {
                            voice::strip_bracketed_tags(&text)
                        } else {
                            text.clone()
                        };
                        if !delivered.is_empty() {
                            let _ = tx
                                .send(TurnEvent::AssistantDelta { text: delivered })
                                .await;
                        }
                        text_buf.push_str(&text);
                    }
                    StreamEvent::ToolCallStarted {
                        call_id,
                        tool_name,
                    } => {
                        tc_bufs.insert(call_id, (tool_name, String::new()));
                    }
                    StreamEvent::ToolCallDelta { call_id, delta } => {
                        if let Some((_, args)) = tc_bufs.get_mut(&call_id) {
                            args.push_str(&delta);
                        }
                    }
                    StreamEvent::ToolCallFinished {
                        call_id,
                        tool_name,
                        arguments,
                    } => {
                        pending_tool_calls.push(ToolCall {
                            call_id: call_id.clone(),
                            tool_name: tool_name.clone(),
                            arguments: arguments.clone(),
                        });
                        tc_bufs.remove(&call_id);
                    }
                    StreamEvent::Done {
                        usage,
                        finish_reason: _,
                    } => {
                        turn_usage = usage;
                    }
                    StreamEvent::Error { message } => {
                        let e = sa_domain::error::Error::Provider {
                            provider: provider.provider_id().to_string(),
                            message,
                        };
                        if attempt == 0 && is_transient_provider_error(&e) {
                            retry_after_stream = true;
                        }
                        stream_failure = Some(e);
                        break;
                    }
                }
            }

            if was_cancelled || stream_failure.is_none() {
                break 'attempts;
            }
            if retry_after_stream {
                let delay = provider_retry_delay(attempt);
                tracing::warn!(
                    error = %stream_failure.as_ref().unwrap(),
                    delay_ms = delay.as_millis() as u64,
                    "transient provider error mid-stream, retrying"
                );
                tokio::time::sleep(delay).await;
                continue 'attempts;
            }
            break 'attempts;
        }

        // Record token usage while the span is still entered.
        if let Some(u) = &turn_usage {
            llm_call_span.record("input_tokens", u.prompt_tokens);
            llm_call_span.record("output_tokens", u.completion_tokens);
        }

        // Close the llm.call span — duration now covers the full streaming interaction.
        drop(_llm_guard);

        // ── Finalize LLM node ─────────────────────────────────────
        {
            let llm_end = chrono::Utc::now();
            let llm_dur = (llm_end - llm_start).num_milliseconds().max(0) as u64;
            let llm_status = if was_cancelled {
                runs::RunStatus::Stopped
            } else if stream_failure.is_some() {
                runs::RunStatus::Failed
            } else {
                runs::RunStatus::Completed
            };
            let t_in = turn_usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0);
            let t_out = turn_usage
                .as_ref()
                .map(|u| u.completion_tokens)
                .unwrap_or(0);
            state.run_store.update(&run_id, |r| {
                if let Some(n) = r.nodes.iter_mut().find(|n| n.node_id == llm_node_id) {
                    n.status = llm_status;
                    n.ended_at = Some(llm_end);
                    n.duration_ms = Some(llm_dur);
                    n.input_tokens = t_in;
                    n.output_tokens = t_out;
                    n.output_preview = Some(truncate_str(&text_buf, 200));
                }
            });
        }

        // Handle cancellation during streaming.
        if was_cancelled {
            handle_cancellation(
                &state,
                &tx,
                &input.session_id,
                run_id,
                &text_buf,
                "",
                cancel,
                conversation_id,
            )
            .await;
            return Ok(());
        }

        // Terminal provider failure (spec 7): the retry above is already
        // exhausted (or the error wasn't retryable). Surface a final
        // `[error: …]` delta so the client sees it inline, then persist
        // it like any other assistant turn rather than silently dropping
        // the partial content.
        if let Some(err) = stream_failure {
            let error_delta = format!("[error: {err}]");
            let _ = tx
                .send(TurnEvent::AssistantDelta {
                    text: error_delta.clone(),
                })
                .await;
            text_buf.push_str(&error_delta);

            persist_transcript(
                &state.transcripts,
                &input.session_id,
                "assistant",
                &text_buf,
                Some(serde_json::json!({ "error": err.to_string() })),
                Some(state.sessions.search_index()),
            )
            .await;
            let message_id = persist_message_db(
                &state,
                conversation_id,
                sa_storage::model::MessageRole::Assistant,
                Some(&text_buf),
                serde_json::json!([]),
                serde_json::json!([]),
                effective_model.as_deref(),
                sa_storage::model::TokenUsage {
                    input_tokens: total_usage.prompt_tokens,
                    output_tokens: total_usage.completion_tokens,
                    ..Default::default()
                },
            );
            let _ = tx
                .send(TurnEvent::Final {
                    content: text_buf.clone(),
                    message_id,
                })
                .await;
            let _ = tx
                .send(TurnEvent::Error {
                    message: err.to_string(),
                })
                .await;

            state.run_store.update(&run_id, |r| {
                r.error = Some(err.to_string());
                r.finish(runs::RunStatus::Failed);
            });
            if let Some(run) = state.run_store.get(&run_id) {
                state.run_store.persist(&run);
            }
            state.run_store.emit(
                &run_id,
                runs::RunEvent::RunStatus {
                    run_id,
                    status: runs::RunStatus::Failed,
                },
            );
            state.run_store.cleanup_channel(&run_id);
            return Ok(());
        }

        // Assemble any tool calls that came through start/delta but not
        // through ToolCallFinished (some providers only use start+delta).
        for (call_id, (name, args_str)) in tc_bufs.drain() {
            let arguments = if args_str.trim().is_empty() {
                // Empty arguments (common with DeepSeek) → default to empty object.
                Value::Object(Default::default())
            } else {
                match serde_json::from_str(&args_str) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(
                            call_id = %call_id,
                            tool = %name,
                            error = %e,
                            "tool call arguments are not valid JSON; defaulting to empty object"
                        );
                        Value::Object(Default::default())
                    }
                }
            };
            pending_tool_calls.push(ToolCall {
                call_id,
                tool_name: name,
                arguments,
            });
        }

        // Accumulate usage.
        if let Some(u) = &turn_usage {
            total_usage.prompt_tokens += u.prompt_tokens;
            total_usage.completion_tokens += u.completion_tokens;
            total_usage.total_tokens += u.total_tokens;
        }

        // If no tool calls, this is the final answer — unless the caller
        // forced tool use and we haven't retried yet (spec 4.G step 6).
        if pending_tool_calls.is_empty() {
            if input.force_tool_use && !force_retry_done {
                force_retry_done = true;
                messages.push(Message::assistant(&text_buf));
                messages.push(Message::user(&state.config.llm.tool_intent.force_retry_suffix));
                continue;
            }
            finalize_run_success(
                &state,
                &tx,
                &input,
                run_id,
                &text_buf,
                &total_usage,
                conversation_id,
                effective_model.as_deref(),
                &route_info,
            )
            .await;
            return Ok(());
        }

        // ── Tool dispatch ──────────────────────────────────────────
        messages.push(build_assistant_tool_message(&text_buf, &pending_tool_calls));

        let tc_json = serde_json::to_string(&pending_tool_calls).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to serialize tool calls for transcript");
            String::new()
        });
        persist_transcript(
            &state.transcripts,
            &input.session_id,
            "assistant",
            &text_buf,
            Some(serde_json::json!({ "tool_calls": tc_json })),
            Some(state.sessions.search_index()),
        )
        .await;

        // P1: the assistant message carrying tool_calls is persisted before
        // dispatch; the matching tool messages land below, in the same
        // conversation, before the next assistant turn.
        persist_message_db(
            &state,
            conversation_id,
            sa_storage::model::MessageRole::Assistant,
            if text_buf.is_empty() { None } else { Some(&text_buf) },
            serde_json::to_value(&pending_tool_calls).unwrap_or(serde_json::json!([])),
            serde_json::json!([]),
            effective_model.as_deref(),
            sa_storage::model::TokenUsage::default(),
        );

        // 0. Emit a short imperative plan derived from the pending tool
        // calls, at most once per turn, before the first tool dispatch
        // (spec 4.G step 7).
        if !plan_emitted {
            plan_emitted = true;
            let _ = tx
                .send(TurnEvent::Plan {
                    steps: pending_tool_calls
                        .iter()
                        .map(|tc| format!("Call {} with {}", tc.tool_name, truncate_str(&tc.arguments.to_string(), 120)))
                        .collect(),
                })
                .await;
        }

        for tc in &pending_tool_calls {
            if tc.tool_name == "agent.run" {
                let agent_id = tc
                    .arguments
                    .get("agent_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let task = tc
                    .arguments
                    .get("task")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let _ = tx
                    .send(TurnEvent::AgentSpawn {
                        call_id: tc.call_id.clone(),
                        agent_id,
                        task,
                    })
                    .await;
            }
        }

        // 1. Emit all ToolCallEvents and create run nodes.
        let mut tool_node_info: Vec<(u32, chrono::DateTime<chrono::Utc>)> = Vec::new();
        for tc in &pending_tool_calls {
            // Check cancellation before each tool.
            if cancel.is_cancelled() {
                handle_cancellation(
                    &state,
                    &tx,
                    &input.session_id,
                    run_id,
                    &text_buf,
                    " during tool dispatch",
                    cancel,
                    conversation_id,
                )
                .await;
                return Ok(());
            }

            // ── Track tool node ────────────────────────────────
            node_seq += 1;
            let tool_node_id = node_seq;
            let tool_start = chrono::Utc::now();
            let tool_input_preview = serde_json::to_string(&tc.arguments)
                .ok()
                .map(|s| truncate_str(&s, 200));
            let tool_node = runs::RunNode {
                node_id: tool_node_id,
                kind: runs::NodeKind::ToolCall,
                name: tc.tool_name.clone(),
                status: runs::RunStatus::Running,
                started_at: tool_start,
                ended_at: None,
                duration_ms: None,
                input_preview: tool_input_preview,
                output_preview: None,
                is_error: false,
                input_tokens: 0,
                output_tokens: 0,
            };
            state.run_store.update(&run_id, |r| {
                r.nodes.push(tool_node.clone());
            });
            state.run_store.emit(
                &run_id,
                runs::RunEvent::NodeStarted {
                    run_id,
                    node: tool_node,
                },
            );
            tool_node_info.push((tool_node_id, tool_start));

            let _ = tx
                .send(TurnEvent::ToolCallEvent {
                    call_id: tc.call_id.clone(),
                    tool_name: tc.tool_name.clone(),
                    arguments: tc.arguments.clone(),
                })
                .await;
        }

        // 2. Check cancellation once before the batch.
        if cancel.is_cancelled() {
            handle_cancellation(
                &state,
                &tx,
                &input.session_id,
                run_id,
                &text_buf,
                " during tool dispatch",
                cancel,
                conversation_id,
            )
            .await;
            return Ok(());
        }

        // 3. Dispatch all tools concurrently.
        //    Latency = max(tool_latencies) instead of sum(tool_latencies).
        //    Results are collected in original order via join_all to preserve
        //    deterministic SSE sequencing.
        // Voice mode (spec 4.G (c)): start a progress-filler timer per
        // outstanding tool call. Each is cancelled the instant its own
        // result arrives via `ProgressFiller::drop`.
        let _fillers: Vec<voice::ProgressFiller> = if input.voice_mode {
            pending_tool_calls
                .iter()
                .map(|tc| voice::ProgressFiller::start(tx.clone(), tc.call_id.clone(), tc.tool_name.clone()))
                .collect()
        } else {
            Vec::new()
        };

        let tool_futures: Vec<_> = pending_tool_calls
            .iter()
            .map(|tc| {
                let tool_span = tracing::info_span!(
                    "tool.call",
                    tool_name = %tc.tool_name,
                );
                tools::dispatch_tool(
                    &state,
                    &tc.tool_name,
                    &tc.arguments,
                    Some(&input.session_key),
                    input.agent.as_ref(),
                )
                .instrument(tool_span)
            })
            .collect();
        let tool_results = futures_util::future::join_all(tool_futures).await;
        // All results are in hand — drop the fillers so none fire late.
        drop(_fillers);

        // 4. Emit results, finalize nodes, and persist transcripts.
        for ((tc, (result_content, is_error)), (tool_node_id, tool_start)) in
            pending_tool_calls.iter().zip(tool_results).zip(tool_node_info)
        {
            // ── Finalize tool node ───────────────────────────────
            let tool_end = chrono::Utc::now();
            let tool_dur = (tool_end - tool_start).num_milliseconds().max(0) as u64;
            let tool_status = if is_error {
                runs::RunStatus::Failed
            } else {
                runs::RunStatus::Completed
            };
            state.run_store.update(&run_id, |r| {
                if let Some(n) = r.nodes.iter_mut().find(|n| n.node_id == tool_node_id) {
                    n.status = tool_status;
                    n.ended_at = Some(tool_end);
                    n.duration_ms = Some(tool_dur);
                    n.output_preview = Some(truncate_str(&result_content, 200));
                    n.is_error = is_error;
                }
            });

            let _ = tx
                .send(TurnEvent::ToolResult {
                    call_id: tc.call_id.clone(),
                    tool_name: tc.tool_name.clone(),
                    content: result_content.clone(),
                    is_error,
                })
                .await;

            if tc.tool_name == "agent.run" {
                let agent_id = tc
                    .arguments
                    .get("agent_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let _ = tx
                    .send(TurnEvent::AgentResult {
                        call_id: tc.call_id.clone(),
                        agent_id,
                        success: !is_error,
                        duration_ms: tool_dur,
                    })
                    .await;
            }

            messages.push(Message::tool_result(&tc.call_id, &result_content));

            persist_transcript(
                &state.transcripts,
                &input.session_id,
                "tool",
                &result_content,
                Some(serde_json::json!({
                    "call_id": tc.call_id,
                    "tool_name": tc.tool_name,
                    "is_error": is_error,
                })),
                Some(state.sessions.search_index()),
            )
            .await;

            persist_message_db(
                &state,
                conversation_id,
                sa_storage::model::MessageRole::Tool,
                None,
                serde_json::json!([]),
                serde_json::json!([{
                    "call_id": tc.call_id,
                    "tool_name": tc.tool_name,
                    "content": result_content,
                    "is_error": is_error,
                }]),
                None,
                sa_storage::model::TokenUsage::default(),
            );
        }

        if loop_idx == max_tool_loops - 1 {
            let err = sa_domain::error::Error::ToolLoopExhausted;
            let _ = tx
                .send(TurnEvent::Error {
                    message: err.to_string(),
                })
                .await;

            persist_transcript(
                &state.transcripts,
                &input.session_id,
                "assistant",
                &text_buf,
                Some(serde_json::json!({ "error": err.to_string() })),
                Some(state.sessions.search_index()),
            )
            .await;
            persist_message_db(
                &state,
                conversation_id,
                sa_storage::model::MessageRole::Assistant,
                if text_buf.is_empty() { None } else { Some(&text_buf) },
                serde_json::json!([]),
                serde_json::json!([]),
                effective_model.as_deref(),
                sa_storage::model::TokenUsage {
                    input_tokens: total_usage.prompt_tokens,
                    output_tokens: total_usage.completion_tokens,
                    ..Default::default()
                },
            );

            state.run_store.update(&run_id, |r| {
                r.error = Some(err.to_string());
                r.finish(runs::RunStatus::Failed);
            });
            if let Some(run) = state.run_store.get(&run_id) {
                state.run_store.persist(&run);
            }
            state.run_store.emit(
                &run_id,
                runs::RunEvent::RunStatus {
                    run_id,
                    status: runs::RunStatus::Failed,
                },
            );
            state.run_store.cleanup_channel(&run_id);
        }
    }

    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Phase 1 helper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Phase 1: Resolve the provider, build the system prompt, load and
/// compact the transcript, assemble messages, and persist the user turn.
///
/// Returns a [`TurnContext`] containing everything the tool loop needs.
async fn prepare_turn_context(
    state: &AppState,
    input: &TurnInput,
) -> Result<TurnContext, Box<dyn std::error::Error + Send + Sync>> {
    // 1. Two-phase tool-intent routing (spec 4.G step 5): classify the turn,
    //    then try the persisted task-class Model Router before falling back
    //    to the teacher's smart-router/role-based resolution.
    let task_class = super::classify_task(state, input);
    let (provider, resolved_model) = match super::resolve_task_route(state, task_class) {
        Some(routed) if input.model.is_none() => routed,
        _ => resolve_provider(state, input.model.as_deref(), input.agent.as_ref(), None)?,
    };
    let route_info = (task_class, provider.provider_id().to_string());

    // 2. Build system context (agent-scoped workspace/skills if present).
    let mut system_prompt = build_system_context(state, input.agent.as_ref()).await;

    // 2b. Memory digest injection (spec 4.G step 3c) — best-effort, never
    // blocks the turn. Voice mode forces this off unless the tool-intent
    // gate matched, since the digest adds latency to a low-latency channel.
    if input.include_memory && !(input.voice_mode && task_class != sa_storage::model::TaskClass::Tool) {
        if let Some(digest) = build_memory_digest(state, &input.user_message).await {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(&digest);
        }
    }

    // 2c. Caller-supplied system prompt suffix (spec 4.G step 3d).
    if let Some(suffix) = &input.system_prompt_suffix {
        system_prompt.push_str("\n\n");
        system_prompt.push_str(suffix);
    }

    // 3. Load raw transcript and check compaction.
    //    Child agents have compaction disabled by default (short-lived sessions).
    let mut all_lines = load_raw_transcript(&state.transcripts, &input.session_id);

    let compaction_enabled = input
        .agent
        .as_ref()
        .map_or(state.config.compaction.auto, |a| a.compaction_enabled);

    // Compute the compaction boundary once to avoid redundant reverse scans.
    let mut boundary = compact::compaction_boundary(&all_lines);

    if compaction_enabled
        && compact::should_compact_with_boundary(&all_lines, &state.config.compaction, boundary)
    {
        // Pick the summarizer (or fall back to the executor provider).
        let summarizer = resolve_summarizer(state).unwrap_or_else(|| provider.clone());
        match compact::run_compaction(
            summarizer.as_ref(),
            &state.transcripts,
            &input.session_id,
            &all_lines,
            &state.config.compaction,
        )
        .await
        {
            Ok(summary) => {
                // Optionally ingest the summary to long-term memory.
                if state.config.memory_lifecycle.capture_on_compaction && !summary.is_empty() {
                    let memory = state.memory.clone();
                    let sk = input.session_key.clone();
                    let sid = input.session_id.clone();
                    // Build provenance metadata (includes agent fields for child agents).
                    let mut meta =
                        agent::provenance_metadata(input.agent.as_ref(), &sk, &sid)
                            .unwrap_or_default();
                    meta.insert("sa.compaction".into(), serde_json::json!(true));
                    meta.insert("sa.session_key".into(), serde_json::json!(&sk));

                    tokio::spawn(async move {
                        let req = sa_memory::MemoryIngestRequest {
                            content: format!("Session summary (compacted):\n{summary}"),
                            source: Some("session_summary".into()),
                            session_id: Some(sid),
                            metadata: Some(meta),
                            extract_entities: Some(true),
                        };
                        if let Err(e) = memory.ingest(req).await {
                            tracing::warn!(error = %e, "compaction memory ingest failed");
                        }
                    });
                }

                // Reload transcript (now includes the compaction marker).
                all_lines = load_raw_transcript(&state.transcripts, &input.session_id);
                boundary = compact::compaction_boundary(&all_lines);
            }
            Err(e) => {
                tracing::warn!(error = %e, "auto-compaction failed, continuing with full history");
            }
        }
    }

    // 4. Convert active transcript lines (after last compaction) to messages.
    let history = transcript_lines_to_messages(&all_lines[boundary..]);

    // 5. Build the tool definitions (filtered by agent tool policy). When
    //    tools are disabled for this turn (spec 4.G step 4), offer none.
    let tool_policy = input.agent.as_ref().map(|a| &a.tool_policy);
    let tool_defs = if input.enable_tools {
        Arc::new(tools::build_tool_definitions(state, tool_policy))
    } else {
        Arc::new(Vec::new())
    };

    // 6. Build conversation messages.
    let mut messages = Vec::new();
    messages.push(Message::system(&system_prompt));
    messages.extend(history);
    messages.push(Message::user(&input.user_message));

    // 7. Persist user message to transcript.
    persist_transcript(
        &state.transcripts,
        &input.session_id,
        "user",
        &input.user_message,
        None,
        Some(state.sessions.search_index()),
    )
    .await;

    // 7b. Resolve (or create) the durable Conversation row and persist the
    // user message into it (spec 4.G steps 1-2). Best-effort: a storage
    // failure here degrades to transcript-only history, never aborts the
    // turn (spec §7 "Storage error").
    let agent_id = input
        .agent
        .as_ref()
        .map(|a| a.agent_id.as_str())
        .unwrap_or("default");
    let conversation_id = resolve_or_create_conversation(state, &input.session_key, agent_id)
        .map(|c| c.id);
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

    Ok(TurnContext {
        provider,
        resolved_model,
        messages,
        tool_defs,
        route_info,
        conversation_id,
    })
}
