//! Message records (spec §3 Message entity, P1 tool_calls/tool_results
//! invariant: a message with `role = tool` always carries the
//! `tool_results` it answers; a message with pending tool calls carries
//! them in `tool_calls` until the matching tool message lands).

use chrono::Utc;
use rusqlite::{params, Row};
use uuid::Uuid;

use crate::db::Db;
use crate::error::Result;
use crate::model::{Message, MessageRole, TokenUsage};
use crate::util::{get_json, get_opt_uuid, get_uuid, json_text, ok, parse_enum};

pub struct NewMessage<'a> {
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: Option<&'a str>,
    pub tool_calls: serde_json::Value,
    pub tool_results: serde_json::Value,
    pub model: Option<&'a str>,
    pub token_usage: TokenUsage,
    pub attachments: serde_json::Value,
    pub reply_to: Option<Uuid>,
    pub forwarded_from: Option<Uuid>,
}

impl Db {
    pub fn append_message(&self, new: NewMessage<'_>) -> Result<Message> {
        let conn = self.conn()?;
        let now = Utc::now();
        let id = Uuid::new_v4();
        ok(conn.execute(
            "INSERT INTO messages
                (id, conversation_id, role, content, tool_calls, tool_results, model,
                 input_tokens, output_tokens, cache_read_tokens, cache_write_tokens,
                 attachments, pinned, reported, reply_to, forwarded_from, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, 0, ?13, ?14, ?15)",
            params![
                id.to_string(),
                new.conversation_id.to_string(),
                new.role.to_string(),
                new.content,
                json_text(&new.tool_calls)?,
                json_text(&new.tool_results)?,
                new.model,
                new.token_usage.input_tokens,
                new.token_usage.output_tokens,
                new.token_usage.cache_read_tokens,
                new.token_usage.cache_write_tokens,
                json_text(&new.attachments)?,
                new.reply_to.map(|u| u.to_string()),
                new.forwarded_from.map(|u| u.to_string()),
                now.to_rfc3339(),
            ],
        ))?;
        ok(conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), new.conversation_id.to_string()],
        ))?;
        Ok(Message {
            id,
            conversation_id: new.conversation_id,
            role: new.role,
            content: new.content.map(str::to_string),
            tool_calls: new.tool_calls,
            tool_results: new.tool_results,
            model: new.model.map(str::to_string),
            token_usage: new.token_usage,
            attachments: new.attachments,
            pinned: false,
            reported: false,
            reply_to: new.reply_to,
            forwarded_from: new.forwarded_from,
            created_at: now,
        })
    }

    pub fn recent_messages(&self, conversation_id: Uuid, limit: i64) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = ok(conn.prepare(
            "SELECT * FROM (
                SELECT id, conversation_id, role, content, tool_calls, tool_results, model,
                       input_tokens, output_tokens, cache_read_tokens, cache_write_tokens,
                       attachments, pinned, reported, reply_to, forwarded_from, created_at
                FROM messages WHERE conversation_id = ?1 ORDER BY created_at DESC LIMIT ?2
             ) ORDER BY created_at ASC",
        ))?;
        let rows = ok(stmt.query_map(params![conversation_id.to_string(), limit], row_to_message))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(ok(r)??);
        }
        Ok(out)
    }

    pub fn set_message_pinned(&self, id: Uuid, pinned: bool) -> Result<()> {
        let conn = self.conn()?;
        ok(conn.execute(
            "UPDATE messages SET pinned = ?1 WHERE id = ?2",
            params![pinned, id.to_string()],
        ))?;
        Ok(())
    }

    pub fn set_message_reported(&self, id: Uuid, reported: bool) -> Result<()> {
        let conn = self.conn()?;
        ok(conn.execute(
            "UPDATE messages SET reported = ?1 WHERE id = ?2",
            params![reported, id.to_string()],
        ))?;
        Ok(())
    }
}

fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: get_uuid(row, "id")?,
        conversation_id: get_uuid(row, "conversation_id")?,
        role: parse_enum::<MessageRole>(row, "role")?,
        content: row.get("content")?,
        tool_calls: get_json(row, "tool_calls")?,
        tool_results: get_json(row, "tool_results")?,
        model: row.get("model")?,
        token_usage: TokenUsage {
            input_tokens: row.get("input_tokens")?,
            output_tokens: row.get("output_tokens")?,
            cache_read_tokens: row.get("cache_read_tokens")?,
            cache_write_tokens: row.get("cache_write_tokens")?,
        },
        attachments: get_json(row, "attachments")?,
        pinned: row.get("pinned")?,
        reported: row.get("reported")?,
        reply_to: get_opt_uuid(row, "reply_to")?,
        forwarded_from: get_opt_uuid(row, "forwarded_from")?,
        created_at: crate::util::get_dt(row, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConversationType;

    #[test]
    fn append_and_fetch_recent() {
        let db = Db::open_in_memory().unwrap();
        let conv = db
            .create_conversation("agent-1", None, Some("s"), ConversationType::Direct, None)
            .unwrap();
        db.append_message(NewMessage {
            conversation_id: conv.id,
            role: MessageRole::User,
            content: Some("hi"),
            tool_calls: serde_json::json!([]),
            tool_results: serde_json::json!([]),
            model: None,
            token_usage: TokenUsage::default(),
            attachments: serde_json::json!([]),
            reply_to: None,
            forwarded_from: None,
        })
        .unwrap();
        db.append_message(NewMessage {
            conversation_id: conv.id,
            role: MessageRole::Assistant,
            content: Some("hello"),
            tool_calls: serde_json::json!([]),
            tool_results: serde_json::json!([]),
            model: Some("claude-sonnet-4-20250514"),
            token_usage: TokenUsage { input_tokens: 5, output_tokens: 2, ..Default::default() },
            attachments: serde_json::json!([]),
            reply_to: None,
            forwarded_from: None,
        })
        .unwrap();

        let msgs = db.recent_messages(conv.id, 10).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, MessageRole::User);
        assert_eq!(msgs[1].token_usage.input_tokens, 5);
    }
}
