//! Conversation records (spec §3 Conversation entity, P1/P2 invariants).
//!
//! Grounded on `skynet-memory`'s `conversations` table handling in
//! `manager.rs` — a thin CRUD layer in front of the rusqlite pool, no
//! ORM. `session_key` carries the teacher's existing session-key
//! concept through to durable storage so a reconnect resolves the same
//! conversation row.

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use crate::db::Db;
use crate::error::Result;
use crate::model::{Conversation, ConversationType};
use crate::util::{get_json, get_uuid, json_text, ok};

impl Db {
    pub fn create_conversation(
        &self,
        agent_id: &str,
        channel_id: Option<&str>,
        session_key: Option<&str>,
        kind: ConversationType,
        contact_id: Option<&str>,
    ) -> Result<Conversation> {
        let conn = self.conn()?;
        let now = Utc::now();
        let id = Uuid::new_v4();
        ok(conn.execute(
            "INSERT INTO conversations
                (id, agent_id, channel_id, session_key, title, type, inbox_status,
                 contact_id, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, NULL, ?6, '{}', ?7, ?7)",
            params![
                id.to_string(),
                agent_id,
                channel_id,
                session_key,
                kind.to_string(),
                contact_id,
                now.to_rfc3339(),
            ],
        ))?;
        Ok(Conversation {
            id,
            agent_id: agent_id.to_string(),
            channel_id: channel_id.map(str::to_string),
            session_key: session_key.map(str::to_string),
            title: None,
            kind,
            inbox_status: None,
            contact_id: contact_id.map(str::to_string),
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn find_conversation_by_session_key(&self, session_key: &str) -> Result<Option<Conversation>> {
        let conn = self.conn()?;
        let mut stmt = ok(conn.prepare(
            "SELECT id, agent_id, channel_id, session_key, title, type, inbox_status,
                    contact_id, metadata, created_at, updated_at
             FROM conversations WHERE session_key = ?1",
        ))?;
        let mut rows = ok(stmt.query(params![session_key]))?;
        match ok(rows.next())? {
            Some(row) => Ok(Some(row_to_conversation(row)?)),
            None => Ok(None),
        }
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        let conn = self.conn()?;
        let mut stmt = ok(conn.prepare(
            "SELECT id, agent_id, channel_id, session_key, title, type, inbox_status,
                    contact_id, metadata, created_at, updated_at
             FROM conversations WHERE id = ?1",
        ))?;
        let mut rows = ok(stmt.query(params![id.to_string()]))?;
        match ok(rows.next())? {
            Some(row) => Ok(Some(row_to_conversation(row)?)),
            None => Ok(None),
        }
    }

    /// Sets the title once, if it isn't already set. Auto-derivation (4.G)
    /// only ever assigns a title to a conversation that has none yet.
    pub fn set_title_if_absent(&self, id: Uuid, title: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = ok(conn.execute(
            "UPDATE conversations SET title = ?1, updated_at = ?2
             WHERE id = ?3 AND title IS NULL",
            params![title, Utc::now().to_rfc3339(), id.to_string()],
        ))?;
        Ok(changed > 0)
    }

    pub fn touch_conversation(&self, id: Uuid) -> Result<()> {
        let conn = self.conn()?;
        ok(conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.to_string()],
        ))?;
        Ok(())
    }

    pub fn set_inbox_status(&self, id: Uuid, status: &str) -> Result<()> {
        let conn = self.conn()?;
        ok(conn.execute(
            "UPDATE conversations SET inbox_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, Utc::now().to_rfc3339(), id.to_string()],
        ))?;
        Ok(())
    }

    pub fn merge_conversation_metadata(&self, id: Uuid, patch: &serde_json::Value) -> Result<()> {
        let conn = self.conn()?;
        let current = self.get_conversation(id)?;
        let mut merged = current.map(|c| c.metadata).unwrap_or_else(|| serde_json::json!({}));
        if let (Some(obj), Some(patch_obj)) = (merged.as_object_mut(), patch.as_object()) {
            for (k, v) in patch_obj {
                obj.insert(k.clone(), v.clone());
            }
        }
        ok(conn.execute(
            "UPDATE conversations SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
            params![json_text(&merged)?, Utc::now().to_rfc3339(), id.to_string()],
        ))?;
        Ok(())
    }

    pub fn list_conversations_for_agent(&self, agent_id: &str, limit: i64) -> Result<Vec<Conversation>> {
        let conn = self.conn()?;
        let mut stmt = ok(conn.prepare(
            "SELECT id, agent_id, channel_id, session_key, title, type, inbox_status,
                    contact_id, metadata, created_at, updated_at
             FROM conversations WHERE agent_id = ?1 ORDER BY updated_at DESC LIMIT ?2",
        ))?;
        let rows = ok(stmt.query_map(params![agent_id, limit], |row| {
            Ok(row_to_conversation(row))
        }))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(ok(r)??);
        }
        Ok(out)
    }
}

fn row_to_conversation(row: &rusqlite::Row) -> rusqlite::Result<Conversation> {
    let kind_str: String = row.get("type")?;
    Ok(Conversation {
        id: get_uuid(row, "id")?,
        agent_id: row.get("agent_id")?,
        channel_id: row.get("channel_id")?,
        session_key: row.get("session_key")?,
        title: row.get("title")?,
        kind: kind_str.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
        })?,
        inbox_status: row.get("inbox_status")?,
        contact_id: row.get("contact_id")?,
        metadata: get_json(row, "metadata")?,
        created_at: crate::util::get_dt(row, "created_at")?,
        updated_at: crate::util::get_dt(row, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_fetch_by_session_key() {
        let db = Db::open_in_memory().unwrap();
        let conv = db
            .create_conversation("agent-1", None, Some("sess-1"), ConversationType::Direct, None)
            .unwrap();
        let found = db.find_conversation_by_session_key("sess-1").unwrap().unwrap();
        assert_eq!(found.id, conv.id);
        assert!(found.title.is_none());
    }

    #[test]
    fn title_is_set_once() {
        let db = Db::open_in_memory().unwrap();
        let conv = db
            .create_conversation("agent-1", None, Some("sess-2"), ConversationType::Direct, None)
            .unwrap();
        assert!(db.set_title_if_absent(conv.id, "First title").unwrap());
        assert!(!db.set_title_if_absent(conv.id, "Second title").unwrap());
        let got = db.get_conversation(conv.id).unwrap().unwrap();
        assert_eq!(got.title.as_deref(), Some("First title"));
    }
}
