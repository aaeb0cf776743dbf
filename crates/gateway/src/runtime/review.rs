//! Review Queue side effects and event bus (spec §4.E, invariant I1).
//!
//! The queue itself lives in `sa_storage::review` (the table + CAS
//! transition); this module is the in-process broadcast + per-`type`
//! side-effect dispatch that fires exactly once per resolution, grounded
//! on `DeliveryStore`'s `broadcast::Sender` + ring-buffer shape.

use std::collections::VecDeque;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

use sa_storage::model::{ReviewItem, ReviewStatus, ReviewType};

use crate::state::AppState;

const MAX_RECENT: usize = 256;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReviewEvent {
    ReviewCreated { item: ReviewItem },
    ReviewResolved { item: ReviewItem },
}

/// Holds the broadcast channel plus a small ring of recent events so a
/// client connecting right after a resolve can still see it via
/// `GET /v1/review`. Created once in `AppState`.
pub struct ReviewBus {
    tx: broadcast::Sender<ReviewEvent>,
    recent: RwLock<VecDeque<ReviewEvent>>,
}

impl ReviewBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(128);
        Self { tx, recent: RwLock::new(VecDeque::new()) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReviewEvent> {
        self.tx.subscribe()
    }

    async fn publish(&self, event: ReviewEvent) {
        let mut recent = self.recent.write().await;
        recent.push_back(event.clone());
        if recent.len() > MAX_RECENT {
            recent.pop_front();
        }
        drop(recent);
        let _ = self.tx.send(event);
    }
}

impl Default for ReviewBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Called once per review item, on creation (by whoever calls
/// `db.enqueue_review`) to broadcast `review.created` (I1).
pub async fn on_review_created(state: &AppState, item: &ReviewItem) {
    state.review_bus.publish(ReviewEvent::ReviewCreated { item: item.clone() }).await;
}

/// Called exactly once per review item — only by the caller that won the
/// `resolve_review` CAS — to broadcast `review.resolved` and run the
/// per-`type` side effect (spec §4.E). Side-effect failures are logged,
/// never propagated: the resolution itself already committed.
pub async fn on_review_resolved(state: &AppState, item: &ReviewItem) {
    state.review_bus.publish(ReviewEvent::ReviewResolved { item: item.clone() }).await;

    match (item.kind, item.status) {
        (ReviewType::Triage, ReviewStatus::Approved) | (ReviewType::Triage, ReviewStatus::Modified) => {
            dispatch_triage_action(state, item).await;
        }
        (ReviewType::VerifyFact, ReviewStatus::Approved) => {
            write_verified_fact(state, item).await;
        }
        _ => {}
    }

    fire_learning_feedback(state, item);
}

/// Triage approved/modified: hand the (possibly edited) proposed action
/// list to the tool dispatcher the same way an in-turn tool call would be
/// executed. Modeled on `runtime::tools::dispatch_tool`'s per-call error
/// handling — a failed action is logged, not retried.
async fn dispatch_triage_action(state: &AppState, item: &ReviewItem) {
    let actions = item.proposed_action.as_array().cloned().unwrap_or_default();
    for action in actions {
        let Some(name) = action.get("tool").and_then(|v| v.as_str()) else {
            tracing::warn!(review_id = %item.id, "triage action missing 'tool' field, skipping");
            continue;
        };
        let args = action.get("args").cloned().unwrap_or(serde_json::json!({}));
        let (result, ok) =
            crate::runtime::tools::dispatch_tool(state, name, &args, None, None).await;
        if !ok {
            tracing::warn!(review_id = %item.id, tool = name, result = %result, "triage action dispatch failed");
        }
    }
}

/// Verify-fact approved: commit the reviewed content into the Memory
/// Store as a new `knowledge`-area memory, attributed to the human
/// reviewer via `MemorySource::Feedback`.
async fn write_verified_fact(state: &AppState, item: &ReviewItem) {
    let content = item
        .content
        .as_array()
        .and_then(|blocks| blocks.first())
        .and_then(|b| b.get("text"))
        .and_then(|v| v.as_str())
        .unwrap_or(item.title.as_str());

    let write = sa_storage::memory::WriteMemory {
        area: sa_storage::model::MemoryArea::Knowledge,
        content,
        summary: None,
        tags: item.tags.clone(),
        embedding: Vec::new(),
        confidence: 0.95,
        source: sa_storage::model::MemorySource::Feedback,
        conversation_id: item.conversation_id,
        channel_id: None,
        project_id: None,
        scope: None,
        visibility: sa_storage::model::MemoryVisibility::Shared,
        expires_at: None,
    };
    if let Err(e) = state.db.write_memory(write) {
        tracing::warn!(review_id = %item.id, error = %e, "failed to write verified fact to memory store");
    }
}

/// Best-effort trace event so downstream analytics can learn from
/// human review outcomes. Never blocks or fails the resolution.
fn fire_learning_feedback(_state: &AppState, item: &ReviewItem) {
    tracing::info!(
        review_id = %item.id,
        kind = %item.kind,
        status = %item.status,
        "review.resolved learning-feedback"
    );
}
