//! Review Queue persistence: pending items carry no resolution fields,
//! resolved items carry both, and a resolve transitions a row exactly once.
//!
//! Grounded on the teacher's `Run`/`RunStore` SSE event-tracking shape
//! (`runtime/run.rs`) for the create → broadcast → resolve → broadcast
//! lifecycle, adapted from an in-memory map to a table. `resolve` is a
//! CAS (`WHERE status = 'pending'`) so two concurrent resolve calls for
//! the same id (scenario 6) transition the row exactly once; the caller
//! uses the returned bool to decide whether to fire the one-time
//! side effect and broadcast.

use chrono::Utc;
use rusqlite::{params, Row};
use serde_json::Value;
use uuid::Uuid;

use crate::db::Db;
use crate::error::Result;
use crate::model::{ReviewItem, ReviewStatus, ReviewType};
use crate::util::{get_dt, get_json, get_opt_dt, get_opt_uuid, get_tags, get_uuid, json_text, ok, parse_enum};

pub struct NewReviewItem<'a> {
    pub agent_id: &'a str,
    pub conversation_id: Option<Uuid>,
    pub kind: ReviewType,
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub content: Value,
    pub proposed_action: Value,
    pub alternatives: Value,
    pub priority: i32,
    pub tags: Vec<String>,
    pub batch_id: Option<Uuid>,
    pub expires_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ReviewFilter {
    pub status: Option<ReviewStatus>,
    pub agent_id: Option<String>,
    pub kind: Option<ReviewType>,
}

impl Db {
    pub fn enqueue_review(&self, new: NewReviewItem<'_>) -> Result<ReviewItem> {
        let conn = self.conn()?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        ok(conn.execute(
            "INSERT INTO review_items
                (id, agent_id, conversation_id, type, title, description, content,
                 proposed_action, alternatives, status, resolution, resolved_by, resolved_at,
                 priority, tags, batch_id, expires_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', NULL, NULL, NULL,
                     ?10, ?11, ?12, ?13, ?14, ?14)",
            params![
                id.to_string(),
                new.agent_id,
                new.conversation_id.map(|u| u.to_string()),
                new.kind.to_string(),
                new.title,
                new.description,
                json_text(&new.content)?,
                json_text(&new.proposed_action)?,
                json_text(&new.alternatives)?,
                new.priority,
                json_text(&new.tags)?,
                new.batch_id.map(|u| u.to_string()),
                new.expires_at.map(crate::util::ts),
                now.to_rfc3339(),
            ],
        ))?;

        Ok(ReviewItem {
            id,
            agent_id: new.agent_id.to_string(),
            conversation_id: new.conversation_id,
            kind: new.kind,
            title: new.title.to_string(),
            description: new.description.map(str::to_string),
            content: new.content,
            proposed_action: new.proposed_action,
            alternatives: new.alternatives,
            status: ReviewStatus::Pending,
            resolution: None,
            resolved_by: None,
            resolved_at: None,
            priority: new.priority,
            tags: new.tags,
            batch_id: new.batch_id,
            expires_at: new.expires_at,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_review_item(&self, id: Uuid) -> Result<Option<ReviewItem>> {
        let conn = self.conn()?;
        let mut stmt = ok(conn.prepare(&format!("{SELECT_REVIEW} WHERE id = ?1")))?;
        let mut rows = ok(stmt.query(params![id.to_string()]))?;
        match ok(rows.next())? {
            Some(row) => Ok(Some(row_to_review(row)?)),
            None => Ok(None),
        }
    }

    /// CAS transition pending → terminal. Returns `Some(item)` only for
    /// the caller that won the race; later callers get `None` and must
    /// not re-fire the side effect or broadcast.
    pub fn resolve_review(
        &self,
        id: Uuid,
        status: ReviewStatus,
        resolution: Option<&str>,
        resolved_by: &str,
    ) -> Result<Option<ReviewItem>> {
        if status == ReviewStatus::Pending {
            return Err(sa_domain::error::Error::Storage(
                "resolve_review requires a terminal status".into(),
            ));
        }
        let conn = self.conn()?;
        let now = Utc::now();
        let changed = ok(conn.execute(
            "UPDATE review_items
             SET status = ?1, resolution = ?2, resolved_by = ?3, resolved_at = ?4, updated_at = ?4
             WHERE id = ?5 AND status = 'pending'",
            params![status.to_string(), resolution, resolved_by, now.to_rfc3339(), id.to_string()],
        ))?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_review_item(id)
    }

    pub fn list_review_items(&self, filter: ReviewFilter, limit: i64) -> Result<Vec<ReviewItem>> {
        let conn = self.conn()?;
        let mut sql = SELECT_REVIEW.to_string();
        sql.push_str(" WHERE 1=1");
        if let Some(status) = filter.status {
            sql.push_str(&format!(" AND status = '{status}'"));
        }
        if let Some(agent_id) = &filter.agent_id {
            sql.push_str(&format!(" AND agent_id = '{}'", agent_id.replace('\'', "''")));
        }
        if let Some(kind) = filter.kind {
            sql.push_str(&format!(" AND type = '{kind}'"));
        }
        // Pending items sort ahead of resolved ones regardless of status
        // filter, then by priority, then newest first (spec 4.E).
        sql.push_str(" ORDER BY (status = 'pending') DESC, priority DESC, created_at DESC LIMIT ?1");

        let mut stmt = ok(conn.prepare(&sql))?;
        let rows = ok(stmt.query_map(params![limit], row_to_review))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(ok(r)??);
        }
        Ok(out)
    }
}

const SELECT_REVIEW: &str = "SELECT id, agent_id, conversation_id, type, title, description,
    content, proposed_action, alternatives, status, resolution, resolved_by, resolved_at,
    priority, tags, batch_id, expires_at, created_at, updated_at FROM review_items";

fn row_to_review(row: &Row) -> rusqlite::Result<ReviewItem> {
    Ok(ReviewItem {
        id: get_uuid(row, "id")?,
        agent_id: row.get("agent_id")?,
        conversation_id: get_opt_uuid(row, "conversation_id")?,
        kind: parse_enum::<ReviewType>(row, "type")?,
        title: row.get("title")?,
        description: row.get("description")?,
        content: get_json(row, "content")?,
        proposed_action: get_json(row, "proposed_action")?,
        alternatives: get_json(row, "alternatives")?,
        status: parse_enum::<ReviewStatus>(row, "status")?,
        resolution: row.get("resolution")?,
        resolved_by: row.get("resolved_by")?,
        resolved_at: get_opt_dt(row, "resolved_at")?,
        priority: row.get("priority")?,
        tags: get_tags(row, "tags")?,
        batch_id: get_opt_uuid(row, "batch_id")?,
        expires_at: get_opt_dt(row, "expires_at")?,
        created_at: get_dt(row, "created_at")?,
        updated_at: get_dt(row, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_item(kind: ReviewType) -> NewReviewItem<'static> {
        NewReviewItem {
            agent_id: "agent-1",
            conversation_id: None,
            kind,
            title: "Approve outreach email",
            description: None,
            content: serde_json::json!([]),
            proposed_action: serde_json::json!(["A", "B"]),
            alternatives: serde_json::json!([]),
            priority: 5,
            tags: vec![],
            batch_id: None,
            expires_at: None,
        }
    }

    #[test]
    fn enqueue_then_resolve_transitions_once() {
        let db = Db::open_in_memory().unwrap();
        let item = db.enqueue_review(new_item(ReviewType::Triage)).unwrap();
        assert_eq!(item.status, ReviewStatus::Pending);
        assert!(item.invariant_holds());

        let first = db.resolve_review(item.id, ReviewStatus::Approved, Some("looks good"), "user-1").unwrap();
        assert!(first.is_some());
        let second = db.resolve_review(item.id, ReviewStatus::Approved, Some("looks good"), "user-1").unwrap();
        assert!(second.is_none(), "concurrent resolve must not transition twice");

        let fetched = db.get_review_item(item.id).unwrap().unwrap();
        assert!(fetched.invariant_holds());
        assert_eq!(fetched.status, ReviewStatus::Approved);
    }

    #[test]
    fn list_filters_by_status() {
        let db = Db::open_in_memory().unwrap();
        let a = db.enqueue_review(new_item(ReviewType::Approve)).unwrap();
        db.enqueue_review(new_item(ReviewType::Classify)).unwrap();
        db.resolve_review(a.id, ReviewStatus::Rejected, None, "user-1").unwrap();

        let pending = db.list_review_items(ReviewFilter { status: Some(ReviewStatus::Pending), ..Default::default() }, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, ReviewType::Classify);
    }
}
