//! Session Gateway (spec §4.H): a long-lived bidirectional WebSocket that
//! multiplexes session listing, chat turns, interrupts, and review
//! resolution over a single connection, instead of chat.rs's one-shot
//! SSE stream.
//!
//! Grounded on `crate::nodes::ws`'s socket-handling idiom (split
//! sink/stream, per-connection outbound channel, spawned writer task,
//! `Message::Text/Close/Ping/Pong` reader loop) and `api::review`'s
//! CAS-resolve-then-broadcast-exactly-once pattern for `review.resolve`.
//!
//! Unlike the node WS, the shared secret here is the same one
//! `api::auth::require_api_token` checks, so this route lives in the
//! `public` router group and performs that check itself — accepting it
//! from a `token` query parameter as well as the `Authorization` header,
//! since browsers cannot set a header on a WebSocket upgrade request.

use std::collections::HashSet;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;

use sa_sessions::store::SessionOrigin;
use sa_storage::model::{ConversationType, ReviewStatus};

use crate::runtime::session_lock::SessionBusy;
use crate::runtime::{run_turn, TurnEvent, TurnInput};
use crate::state::AppState;

/// `{type, id?, data?, error?}` — the wire envelope (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Frame {
    fn data(kind: &str, id: Option<&str>, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            id: id.map(str::to_string),
            data: Some(data),
            error: None,
        }
    }

    fn error(kind: &str, id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            id: id.map(str::to_string),
            data: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GatewayQuery {
    /// Shared secret (spec §4.H: bearer header OR this query param for the
    /// WS upgrade specifically).
    pub token: Option<String>,
}

/// GET /v1/gateway/ws — upgrade to the session gateway WebSocket.
pub async fn gateway_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    headers: axum::http::HeaderMap,
) -> impl IntoResponse {
    if let Some(expected_hash) = &state.api_token_hash {
        let header_token = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let provided = header_token
            .or(query.token.as_deref())
            .unwrap_or("");
        let provided_hash = Sha256::digest(provided.as_bytes());
        if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
            return (
                axum::http::StatusCode::UNAUTHORIZED,
                "invalid or missing API token",
            )
                .into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(256);

    // Writer task: serializes everything sent to this client onto one sink,
    // whether it's a chat turn's stream or a broadcast review event.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(json) = serde_json::to_string(&frame) else {
                continue;
            };
            if ws_sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Forward review.created/review.resolved to every connected client
    // (spec §4.H: review.* broadcasts rather than targeting one client).
    let review_forwarder = {
        let out_tx = out_tx.clone();
        let mut rx = state.review_bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(crate::runtime::review::ReviewEvent::ReviewCreated { item }) => {
                        let _ = out_tx
                            .send(Frame::data("review.created", None, serde_json::json!({ "item": item })))
                            .await;
                    }
                    Ok(crate::runtime::review::ReviewEvent::ReviewResolved { item }) => {
                        let _ = out_tx
                            .send(Frame::data("review.resolved", None, serde_json::json!({ "item": item })))
                            .await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    // Session key of the most recent `chat.send` on this connection, used
    // to target a subsequent `chat.interrupt` (the frame itself only
    // carries `messageId`/`spokenText`, spec §4.H, so the connection tracks
    // which turn a client is actually listening to).
    let mut last_session_key: Option<String> = None;

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                let frame: Frame = match serde_json::from_str(&text) {
                    Ok(f) => f,
                    Err(e) => {
                        let _ = out_tx
                            .send(Frame::error("chat.error", None, format!("malformed frame: {e}")))
                            .await;
                        continue;
                    }
                };
                handle_inbound(&state, &out_tx, frame, &mut last_session_key).await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {}
        }
    }

    review_forwarder.abort();
    writer.abort();
    tracing::info!("session gateway client disconnected");
}

async fn handle_inbound(
    state: &AppState,
    out_tx: &mpsc::Sender<Frame>,
    frame: Frame,
    last_session_key: &mut Option<String>,
) {
    let id = frame.id.as_deref();
    let data = frame.data.unwrap_or(Value::Null);

    match frame.kind.as_str() {
        "session.list" => {
            let agent_id = data.get("agentId").and_then(Value::as_str).unwrap_or("default");
            let limit = data.get("limit").and_then(Value::as_i64).unwrap_or(50);
            match state.db.list_conversations_for_agent(agent_id, limit) {
                Ok(conversations) => {
                    let _ = out_tx
                        .send(Frame::data("session.data", id, serde_json::json!({ "conversations": conversations })))
                        .await;
                }
                Err(e) => {
                    let _ = out_tx.send(Frame::error("chat.error", id, e.to_string())).await;
                }
            }
        }

        "session.load" => {
            let Some(session_key) = data.get("sessionKey").and_then(Value::as_str) else {
                let _ = out_tx
                    .send(Frame::error("chat.error", id, "session.load requires sessionKey"))
                    .await;
                return;
            };
            match state.db.find_conversation_by_session_key(session_key) {
                Ok(Some(conv)) => {
                    let limit = data.get("limit").and_then(Value::as_i64).unwrap_or(50);
                    match state.db.recent_messages(conv.id, limit) {
                        Ok(messages) => {
                            let _ = out_tx
                                .send(Frame::data(
                                    "session.data",
                                    id,
                                    serde_json::json!({ "conversation": conv, "messages": messages }),
                                ))
                                .await;
                        }
                        Err(e) => {
                            let _ = out_tx.send(Frame::error("chat.error", id, e.to_string())).await;
                        }
                    }
                }
                Ok(None) => {
                    let _ = out_tx
                        .send(Frame::error("chat.error", id, "no conversation for that sessionKey"))
                        .await;
                }
                Err(e) => {
                    let _ = out_tx.send(Frame::error("chat.error", id, e.to_string())).await;
                }
            }
        }

        "session.create" => {
            let agent_id = data.get("agentId").and_then(Value::as_str).unwrap_or("default");
            let session_key = data
                .get("sessionKey")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("gateway:{}:{}", agent_id, uuid::Uuid::new_v4()));
            let channel_id = data.get("channelId").and_then(Value::as_str);
            match state.db.create_conversation(
                agent_id,
                channel_id,
                Some(&session_key),
                ConversationType::Direct,
                None,
            ) {
                Ok(conv) => {
                    let _ = out_tx
                        .send(Frame::data("session.data", id, serde_json::json!({ "conversation": conv })))
                        .await;
                }
                Err(e) => {
                    let _ = out_tx.send(Frame::error("chat.error", id, e.to_string())).await;
                }
            }
        }

        "chat.send" => {
            handle_chat_send(state, out_tx, id, data, last_session_key).await;
        }

        "chat.interrupt" => {
            let spoken_text = data
                .get("spokenText")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if let Some(session_key) = last_session_key.clone() {
                state.cancel_map.interrupt(&session_key, spoken_text);
            }
            // Soft cancellation (spec §4.G/§4.H): the in-flight `chat.send`
            // forwarding loop observes `TurnEvent::Stopped` and persists the
            // truncated content itself; no `chat.done` is emitted here.
        }

        "review.resolve" => {
            handle_review_resolve(state, out_tx, id, data).await;
        }

        "agent.list" => {
            let agents: Vec<Value> = match &state.agents {
                Some(manager) => manager
                    .list()
                    .into_iter()
                    .map(|agent_id| serde_json::json!({ "id": agent_id }))
                    .collect(),
                None => Vec::new(),
            };
            let _ = out_tx
                .send(Frame::data("session.data", id, serde_json::json!({ "agents": agents })))
                .await;
        }

        "system.ping" => {
            let _ = out_tx
                .send(Frame::data(
                    "system.pong",
                    id,
                    serde_json::json!({ "timestamp": data.get("timestamp").cloned().unwrap_or(Value::Null) }),
                ))
                .await;
        }

        other => {
            let _ = out_tx
                .send(Frame::error("chat.error", id, format!("Unknown frame type: {other}")))
                .await;
        }
    }
}

async fn handle_chat_send(
    state: &AppState,
    out_tx: &mpsc::Sender<Frame>,
    id: Option<&str>,
    data: Value,
    last_session_key: &mut Option<String>,
) {
    let Some(message) = data.get("content").and_then(Value::as_str) else {
        let _ = out_tx
            .send(Frame::error("chat.error", id, "chat.send requires content"))
            .await;
        return;
    };
    let Some(session_key) = data.get("sessionKey").and_then(Value::as_str) else {
        let _ = out_tx
            .send(Frame::error("chat.error", id, "chat.send requires sessionKey"))
            .await;
        return;
    };

    let (entry, _is_new) = state
        .sessions
        .resolve_or_create(session_key, SessionOrigin::default());
    state.sessions.touch(session_key);

    let permit = match state.session_locks.acquire(session_key).await {
        Ok(p) => p,
        Err(SessionBusy) => {
            let _ = out_tx
                .send(Frame::error("chat.error", id, "session is busy — a turn is already in progress"))
                .await;
            return;
        }
    };

    let mut input = TurnInput::new(session_key.to_string(), entry.session_id.clone(), message.to_string());
    input.model = data.get("model").and_then(Value::as_str).map(str::to_string);
    input.enable_tools = data.get("enableTools").and_then(Value::as_bool).unwrap_or(true);
    input.force_tool_use = data.get("forceToolUse").and_then(Value::as_bool).unwrap_or(false);
    input.include_memory = data.get("includeMemory").and_then(Value::as_bool).unwrap_or(true);
    input.system_prompt_suffix = data
        .get("systemPromptSuffix")
        .and_then(Value::as_str)
        .map(str::to_string);
    input.voice_mode = data.get("voiceMode").and_then(Value::as_bool).unwrap_or(false);
    input.mode = match data.get("mode").and_then(Value::as_str) {
        Some("claude-code") => crate::runtime::turn::TurnMode::ClaudeCode,
        _ => crate::runtime::turn::TurnMode::Default,
    };

    *last_session_key = Some(session_key.to_string());

    let (_run_id, mut rx) = run_turn(state.clone(), input);

    let mut seen_tool_use: HashSet<String> = HashSet::new();

    while let Some(event) = rx.recv().await {
        match event {
            TurnEvent::Thought { content } => {
                let _ = out_tx
                    .send(Frame::data("chat.stream", id, serde_json::json!({ "delta": content, "thinking": true })))
                    .await;
            }
            TurnEvent::AssistantDelta { text } => {
                let _ = out_tx
                    .send(Frame::data("chat.stream", id, serde_json::json!({ "delta": text })))
                    .await;
            }
            TurnEvent::ToolCallEvent { call_id, tool_name, arguments } => {
                // At-most-once per call_id even if a provider re-reports a
                // partial tool call (spec §4.H ordering guarantee).
                if !seen_tool_use.insert(call_id.clone()) {
                    continue;
                }
                let _ = out_tx
                    .send(Frame::data(
                        "chat.tool_use",
                        id,
                        serde_json::json!({ "callId": call_id, "name": tool_name, "input": arguments }),
                    ))
                    .await;
            }
            TurnEvent::ToolResult { call_id, tool_name, content, is_error } => {
                let _ = out_tx
                    .send(Frame::data(
                        "chat.tool_result",
                        id,
                        serde_json::json!({
                            "callId": call_id,
                            "name": tool_name,
                            "content": content,
                            "isError": is_error,
                        }),
                    ))
                    .await;
            }
            TurnEvent::Routed { task_class, provider, model } => {
                let _ = out_tx
                    .send(Frame::data(
                        "chat.routed",
                        id,
                        serde_json::json!({ "taskClass": task_class, "provider": provider, "model": model }),
                    ))
                    .await;
            }
            TurnEvent::Plan { steps } => {
                let _ = out_tx
                    .send(Frame::data("chat.plan", id, serde_json::json!({ "steps": steps })))
                    .await;
            }
            TurnEvent::AgentSpawn { call_id, agent_id, task } => {
                let _ = out_tx
                    .send(Frame::data(
                        "chat.agent_spawn",
                        id,
                        serde_json::json!({ "callId": call_id, "agentId": agent_id, "task": task }),
                    ))
                    .await;
            }
            TurnEvent::AgentResult { call_id, agent_id, success, duration_ms } => {
                let _ = out_tx
                    .send(Frame::data(
                        "chat.agent_result",
                        id,
                        serde_json::json!({
                            "callId": call_id,
                            "agentId": agent_id,
                            "success": success,
                            "durationMs": duration_ms,
                        }),
                    ))
                    .await;
            }
            TurnEvent::UsageEvent { input_tokens, output_tokens, total_tokens } => {
                let _ = out_tx
                    .send(Frame::data(
                        "chat.done",
                        id,
                        serde_json::json!({
                            "usage": {
                                "inputTokens": input_tokens,
                                "outputTokens": output_tokens,
                                "totalTokens": total_tokens,
                            },
                        }),
                    ))
                    .await;
            }
            TurnEvent::Final { content, message_id } => {
                let _ = out_tx
                    .send(Frame::data(
                        "chat.done",
                        id,
                        serde_json::json!({ "content": content, "messageId": message_id }),
                    ))
                    .await;
            }
            TurnEvent::Filler { call_id, tool_name, stage, text } => {
                let _ = out_tx
                    .send(Frame::data(
                        "chat.stream",
                        id,
                        serde_json::json!({
                            "delta": text,
                            "filler": true,
                            "callId": call_id,
                            "toolName": tool_name,
                            "stage": stage,
                        }),
                    ))
                    .await;
            }
            TurnEvent::Stopped { .. } => {
                // Interrupted turn: partial content already persisted by
                // the runtime (spec §4.H: no `chat.done` on interrupt).
            }
            TurnEvent::Error { message } => {
                let _ = out_tx.send(Frame::error("chat.error", id, message)).await;
            }
        }
    }

    drop(permit);
}

async fn handle_review_resolve(state: &AppState, out_tx: &mpsc::Sender<Frame>, id: Option<&str>, data: Value) {
    let Some(item_id) = data
        .get("id")
        .and_then(Value::as_str)
        .and_then(|s| uuid::Uuid::parse_str(s).ok())
    else {
        let _ = out_tx
            .send(Frame::error("chat.error", id, "review.resolve requires a valid id"))
            .await;
        return;
    };
    let Some(status_str) = data.get("status").and_then(Value::as_str) else {
        let _ = out_tx
            .send(Frame::error("chat.error", id, "review.resolve requires status"))
            .await;
        return;
    };
    let status = match status_str.parse::<ReviewStatus>() {
        Ok(s) if s != ReviewStatus::Pending => s,
        Ok(_) => {
            let _ = out_tx
                .send(Frame::error("chat.error", id, "resolution status must be terminal"))
                .await;
            return;
        }
        Err(e) => {
            let _ = out_tx.send(Frame::error("chat.error", id, e)).await;
            return;
        }
    };
    let resolution = data.get("resolution").and_then(Value::as_str);
    let resolved_by = data.get("resolvedBy").and_then(Value::as_str).unwrap_or("gateway-client");

    let resolved = match state.db.resolve_review(item_id, status, resolution, resolved_by) {
        Ok(Some(item)) => item,
        Ok(None) => {
            let message = match state.db.get_review_item(item_id) {
                Ok(Some(_)) => "review item already resolved",
                Ok(None) => "review item not found",
                Err(_) => "storage error while resolving review item",
            };
            let _ = out_tx.send(Frame::error("chat.error", id, message)).await;
            return;
        }
        Err(e) => {
            let _ = out_tx.send(Frame::error("chat.error", id, e.to_string())).await;
            return;
        }
    };

    // This call won the CAS race (I1): fire the side effect exactly once.
    // The `review.resolved` broadcast itself goes out via `review_bus`,
    // picked up by every connection's forwarder task (including this one).
    crate::runtime::review::on_review_resolved(state, &resolved).await;

    let _ = out_tx
        .send(Frame::data("session.data", id, serde_json::json!({ "item": resolved })))
        .await;
}

