//! Knowledge Store API (spec §4.C): typed object collections with
//! relations, audit trail and hybrid search, backed by `sa_storage::knowledge`.
//! Follows the `schedules.rs` JSON-error + flat-handler convention.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use uuid::Uuid;

use sa_storage::knowledge::{ObjectFilters, ObjectSort};
use sa_storage::model::ObjectStatus;

use crate::state::AppState;

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/knowledge/collections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct CreateCollectionRequest {
    pub name: String,
    #[serde(default)]
    pub schema: serde_json::Value,
    #[serde(default)]
    pub config: serde_json::Value,
}

pub async fn create_collection(
    State(state): State<AppState>,
    Json(req): Json<CreateCollectionRequest>,
) -> impl IntoResponse {
    match state.db.create_knowledge_collection(&req.name, req.schema, req.config) {
        Ok(c) => (StatusCode::CREATED, Json(serde_json::json!({ "collection": c }))).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/knowledge/objects
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct CreateObjectRequest {
    pub collection_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_by: String,
}

pub async fn create_object(
    State(state): State<AppState>,
    Json(req): Json<CreateObjectRequest>,
) -> impl IntoResponse {
    match state.db.create_knowledge_object(req.collection_id, &req.title, req.data, req.tags, &req.created_by) {
        Ok(obj) => (StatusCode::CREATED, Json(serde_json::json!({ "object": obj }))).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/knowledge/objects/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_object(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.db.get_knowledge_object(id) {
        Ok(Some(obj)) => Json(serde_json::json!({ "object": obj })).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "knowledge object not found"),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PUT /v1/knowledge/objects/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct UpdateObjectRequest {
    #[serde(default)]
    pub patch: serde_json::Value,
    pub performed_by: String,
}

pub async fn update_object(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateObjectRequest>,
) -> impl IntoResponse {
    match state.db.update_knowledge_object(id, req.patch, &req.performed_by) {
        Ok(obj) => Json(serde_json::json!({ "object": obj })).into_response(),
        Err(e) => api_error(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/knowledge/objects/:id/archive
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ArchiveObjectRequest {
    pub performed_by: String,
}

pub async fn archive_object(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ArchiveObjectRequest>,
) -> impl IntoResponse {
    match state.db.archive_knowledge_object(id, &req.performed_by) {
        Ok(()) => Json(serde_json::json!({ "archived": true })).into_response(),
        Err(e) => api_error(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/knowledge/objects/:id/audit
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn audit_trail(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.db.knowledge_audit_trail(id) {
        Ok(entries) => Json(serde_json::json!({ "entries": entries })).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/knowledge/relations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct RelateObjectsRequest {
    pub source: Uuid,
    pub target: Uuid,
    pub relation_name: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

pub async fn relate_objects(
    State(state): State<AppState>,
    Json(req): Json<RelateObjectsRequest>,
) -> impl IntoResponse {
    match state.db.relate_knowledge_objects(req.source, req.target, &req.relation_name, req.metadata) {
        Ok(rel) => (StatusCode::CREATED, Json(serde_json::json!({ "relation": rel }))).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/knowledge/objects
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct QueryObjectsQuery {
    pub collection_id: Option<Uuid>,
    pub status: Option<String>,
    pub tag: Option<String>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn query_objects(
    State(state): State<AppState>,
    Query(q): Query<QueryObjectsQuery>,
) -> impl IntoResponse {
    let status = match q.status.as_deref().map(str::parse::<ObjectStatus>) {
        Some(Ok(s)) => Some(s),
        Some(Err(e)) => return api_error(StatusCode::BAD_REQUEST, e),
        None => None,
    };
    let sort = match q.sort.as_deref() {
        Some("created_at_asc") => ObjectSort::CreatedAtAsc,
        Some("updated_at_desc") => ObjectSort::UpdatedAtDesc,
        _ => ObjectSort::CreatedAtDesc,
    };
    let filters = ObjectFilters { collection_id: q.collection_id, status, tag: q.tag };
    match state.db.query_knowledge_objects(filters, sort, q.limit, q.offset) {
        Ok(objects) => Json(serde_json::json!({ "objects": objects, "count": objects.len() })).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/knowledge/objects/search
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct SearchObjectsQuery {
    pub q: String,
    pub collection_id: Option<Uuid>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

pub async fn search_objects(
    State(state): State<AppState>,
    Query(q): Query<SearchObjectsQuery>,
) -> impl IntoResponse {
    match state.db.search_knowledge_objects(&q.q, q.collection_id, q.limit) {
        Ok(hits) => Json(serde_json::json!({ "objects": hits, "count": hits.len() })).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
