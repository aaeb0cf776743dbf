//! Review Queue API (spec §4.E): list/get/resolve human-in-the-loop items
//! persisted in `sa_storage::review`. Mirrors the `schedules.rs` JSON-error
//! convention and the CAS-then-broadcast shape `runtime::runs::RunStore`
//! uses for its SSE event stream.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use uuid::Uuid;

use sa_storage::model::{ReviewStatus, ReviewType};
use sa_storage::review::ReviewFilter;

use crate::state::AppState;

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/review
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListReviewQuery {
    pub status: Option<String>,
    pub agent_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list_review_items(
    State(state): State<AppState>,
    Query(q): Query<ListReviewQuery>,
) -> impl IntoResponse {
    let status = match q.status.as_deref().map(str::parse::<ReviewStatus>) {
        Some(Ok(s)) => Some(s),
        Some(Err(e)) => return api_error(StatusCode::BAD_REQUEST, e),
        None => None,
    };
    let kind = match q.kind.as_deref().map(str::parse::<ReviewType>) {
        Some(Ok(k)) => Some(k),
        Some(Err(e)) => return api_error(StatusCode::BAD_REQUEST, e),
        None => None,
    };
    let filter = ReviewFilter { status, agent_id: q.agent_id, kind };
    match state.db.list_review_items(filter, q.limit) {
        Ok(items) => Json(serde_json::json!({ "items": items, "count": items.len() })).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/review/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_review_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.db.get_review_item(id) {
        Ok(Some(item)) => Json(serde_json::json!({ "item": item })).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "review item not found"),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/review/:id/resolve
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ResolveReviewRequest {
    pub status: String,
    #[serde(default)]
    pub resolution: Option<String>,
    pub resolved_by: String,
}

pub async fn resolve_review_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ResolveReviewRequest>,
) -> impl IntoResponse {
    let status = match req.status.parse::<ReviewStatus>() {
        Ok(s) if s != ReviewStatus::Pending => s,
        Ok(_) => return api_error(StatusCode::BAD_REQUEST, "resolution status must be terminal"),
        Err(e) => return api_error(StatusCode::BAD_REQUEST, e),
    };

    let resolved = match state
        .db
        .resolve_review(id, status, req.resolution.as_deref(), &req.resolved_by)
    {
        Ok(Some(item)) => item,
        Ok(None) => {
            // Either already resolved by a concurrent caller, or unknown id.
            return match state.db.get_review_item(id) {
                Ok(Some(_)) => api_error(StatusCode::CONFLICT, "review item already resolved"),
                Ok(None) => api_error(StatusCode::NOT_FOUND, "review item not found"),
                Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            };
        }
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    // This call won the CAS race (I1): fire the one-time side effect and
    // broadcast exactly once.
    crate::runtime::review::on_review_resolved(&state, &resolved).await;

    Json(serde_json::json!({ "item": resolved })).into_response()
}
