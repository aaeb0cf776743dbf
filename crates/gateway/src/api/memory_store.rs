//! Memory Store API (spec §4.B): area-scoped write/search over
//! `sa_storage::memory`, the hybrid dense+lexical store with temporal
//! decay and supersession. Distinct from `api/memory.rs`, which proxies
//! the legacy external SerialMemory service — this surface is backed
//! directly by this gateway's own persisted store. Follows the
//! `knowledge.rs` / `review.rs` JSON-error convention.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use sa_storage::memory::{SearchRequest, WriteMemory};
use sa_storage::model::{MemoryArea, MemorySource, MemoryVisibility};

use crate::runtime::tools::try_embed;
use crate::state::AppState;

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/memories
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct WriteMemoryRequest {
    pub area: String,
    pub content: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default)]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn write_memory(
    State(state): State<AppState>,
    Json(req): Json<WriteMemoryRequest>,
) -> Response {
    let area = match req.area.parse::<MemoryArea>() {
        Ok(a) => a,
        Err(e) => return api_error(StatusCode::BAD_REQUEST, e),
    };
    let source = match req.source.as_deref().map(str::parse::<MemorySource>) {
        Some(Ok(s)) => s,
        Some(Err(e)) => return api_error(StatusCode::BAD_REQUEST, e),
        None => MemorySource::User,
    };
    let visibility = match req.visibility.as_deref().map(str::parse::<MemoryVisibility>) {
        Some(Ok(v)) => v,
        Some(Err(e)) => return api_error(StatusCode::BAD_REQUEST, e),
        None => MemoryVisibility::Shared,
    };
    if req.content.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "content must not be empty");
    }

    // Embedding computed over summary||content||tags per spec 4.B; a
    // failed embedding call degrades the write to a text-only row
    // rather than failing it (4.B failure semantics).
    let basis = format!(
        "{} {} {}",
        req.summary.as_deref().unwrap_or(""),
        req.content,
        req.tags.join(" ")
    );
    let embedding = try_embed(&state, &basis).await.unwrap_or_default();

    let write = WriteMemory {
        area,
        content: &req.content,
        summary: req.summary.as_deref(),
        tags: req.tags,
        embedding,
        confidence: req.confidence.unwrap_or(0.8),
        source,
        conversation_id: req.conversation_id,
        channel_id: req.channel_id.as_deref(),
        project_id: req.project_id.as_deref(),
        scope: req.scope.as_deref(),
        visibility,
        expires_at: req.expires_at,
    };

    match state.db.write_memory(write) {
        Ok(memory) => (StatusCode::CREATED, Json(serde_json::json!({ "memory": memory }))).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/memories/search
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct SearchMemoriesQuery {
    pub query: String,
    #[serde(default)]
    pub areas: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub min_confidence: Option<f32>,
    #[serde(default)]
    pub include_superseded: bool,
}

fn default_limit() -> usize {
    8
}

pub async fn search_memories(
    State(state): State<AppState>,
    Query(q): Query<SearchMemoriesQuery>,
) -> Response {
    if q.query.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "query must not be empty");
    }
    let areas = match &q.areas {
        Some(s) => {
            let mut parsed = Vec::new();
            for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                match part.parse::<MemoryArea>() {
                    Ok(a) => parsed.push(a),
                    Err(e) => return api_error(StatusCode::BAD_REQUEST, e),
                }
            }
            Some(parsed)
        }
        None => None,
    };

    // Best-effort query embedding; a failure degrades to text-only
    // ranking, flagged in the response envelope (4.B failure semantics).
    let query_embedding = try_embed(&state, &q.query).await;

    let req = SearchRequest {
        query: &q.query,
        query_embedding,
        areas,
        project: q.project.as_deref(),
        limit: q.limit,
        min_confidence: q.min_confidence,
        include_superseded: q.include_superseded,
    };

    match state.db.search_memory(req) {
        Ok(result) => Json(serde_json::json!({
            "hits": result.hits,
            "degraded_text_only": result.degraded_text_only,
        }))
        .into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/memories/consolidate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn consolidate(State(state): State<AppState>) -> Response {
    match state.db.consolidate_memories() {
        Ok(report) => Json(serde_json::json!({ "report": report })).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
