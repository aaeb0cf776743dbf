//! Knowledge Store: typed collections of objects with
//! relations and an audit trail, searchable the same hybrid way as
//! memory. Grounded on the same `skynet-memory` FTS5 pattern as
//! `memory.rs`; the audit table follows the before/after diff shape the
//! teacher's `workspace` module uses for file-change history.

use chrono::Utc;
use rusqlite::{params, Row};
use serde_json::Value;
use uuid::Uuid;

use crate::db::Db;
use crate::error::Result;
use crate::model::{KnowledgeAuditEntry, KnowledgeCollection, KnowledgeObject, KnowledgeRelation, ObjectStatus};
use crate::util::{get_dt, get_json, get_tags, get_uuid, json_text, ok, parse_enum};

#[derive(Debug, Clone, Default)]
pub struct ObjectFilters {
    pub collection_id: Option<Uuid>,
    pub status: Option<ObjectStatus>,
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub enum ObjectSort {
    CreatedAtDesc,
    CreatedAtAsc,
    UpdatedAtDesc,
}

impl Db {
    pub fn create_knowledge_collection(
        &self,
        name: &str,
        schema: Value,
        config: Value,
    ) -> Result<KnowledgeCollection> {
        let conn = self.conn()?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        ok(conn.execute(
            "INSERT INTO knowledge_collections (id, name, schema, config, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id.to_string(), name, json_text(&schema)?, json_text(&config)?, now.to_rfc3339()],
        ))?;
        Ok(KnowledgeCollection { id, name: name.to_string(), schema, config, created_at: now })
    }

    pub fn create_knowledge_object(
        &self,
        collection_id: Uuid,
        title: &str,
        data: Value,
        tags: Vec<String>,
        created_by: &str,
    ) -> Result<KnowledgeObject> {
        let conn = self.conn()?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        ok(conn.execute(
            "INSERT INTO knowledge_objects
                (id, collection_id, title, data, tags, embedding, status, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, 'active', ?6, ?7, ?7)",
            params![
                id.to_string(),
                collection_id.to_string(),
                title,
                json_text(&data)?,
                json_text(&tags)?,
                created_by,
                now.to_rfc3339(),
            ],
        ))?;
        insert_object_fts(&conn, &id.to_string(), title, &data, &tags)?;
        self.write_knowledge_audit(id, "create", Value::Null, serde_json::json!({"title": title, "data": data}), created_by)?;

        Ok(KnowledgeObject {
            id,
            collection_id,
            title: title.to_string(),
            data,
            tags,
            embedding: Vec::new(),
            status: ObjectStatus::Active,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_knowledge_object(&self, id: Uuid) -> Result<Option<KnowledgeObject>> {
        let conn = self.conn()?;
        let mut stmt = ok(conn.prepare(
            "SELECT id, collection_id, title, data, tags, embedding, status, created_by, created_at, updated_at
             FROM knowledge_objects WHERE id = ?1",
        ))?;
        let mut rows = ok(stmt.query(params![id.to_string()]))?;
        match ok(rows.next())? {
            Some(row) => Ok(Some(row_to_object(row)?)),
            None => Ok(None),
        }
    }

    pub fn update_knowledge_object(&self, id: Uuid, patch: Value, performed_by: &str) -> Result<KnowledgeObject> {
        let before = self
            .get_knowledge_object(id)?
            .ok_or_else(|| sa_domain::error::Error::Storage(format!("knowledge object not found: {id}")))?;

        let conn = self.conn()?;
        let mut merged = before.data.clone();
        if let (Some(obj), Some(patch_obj)) = (merged.as_object_mut(), patch.as_object()) {
            for (k, v) in patch_obj {
                obj.insert(k.clone(), v.clone());
            }
        }
        let title = patch
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| before.title.clone());
        let tags = patch
            .get("tags")
            .and_then(|v| serde_json::from_value::<Vec<String>>(v.clone()).ok())
            .unwrap_or_else(|| before.tags.clone());
        let now = Utc::now();

        remove_object_fts(&conn, &id.to_string(), &before.title, &before.data, &before.tags)?;
        ok(conn.execute(
            "UPDATE knowledge_objects SET title = ?1, data = ?2, tags = ?3, updated_at = ?4 WHERE id = ?5",
            params![title, json_text(&merged)?, json_text(&tags)?, now.to_rfc3339(), id.to_string()],
        ))?;
        insert_object_fts(&conn, &id.to_string(), &title, &merged, &tags)?;

        self.write_knowledge_audit(
            id,
            "update",
            serde_json::json!({"title": before.title, "data": before.data}),
            serde_json::json!({"title": title, "data": merged}),
            performed_by,
        )?;

        Ok(KnowledgeObject {
            id,
            collection_id: before.collection_id,
            title,
            data: merged,
            tags,
            embedding: before.embedding,
            status: before.status,
            created_by: before.created_by,
            created_at: before.created_at,
            updated_at: now,
        })
    }

    pub fn archive_knowledge_object(&self, id: Uuid, performed_by: &str) -> Result<()> {
        let before = self
            .get_knowledge_object(id)?
            .ok_or_else(|| sa_domain::error::Error::Storage(format!("knowledge object not found: {id}")))?;
        let conn = self.conn()?;
        ok(conn.execute(
            "UPDATE knowledge_objects SET status = 'archived', updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.to_string()],
        ))?;
        self.write_knowledge_audit(
            id,
            "archive",
            serde_json::json!({"status": before.status.to_string()}),
            serde_json::json!({"status": "archived"}),
            performed_by,
        )?;
        Ok(())
    }

    pub fn relate_knowledge_objects(
        &self,
        source: Uuid,
        target: Uuid,
        relation_name: &str,
        metadata: Value,
    ) -> Result<KnowledgeRelation> {
        let conn = self.conn()?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        ok(conn.execute(
            "INSERT OR REPLACE INTO knowledge_relations
                (id, source_object, target_object, relation_name, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                source.to_string(),
                target.to_string(),
                relation_name,
                json_text(&metadata)?,
                now.to_rfc3339(),
            ],
        ))?;
        Ok(KnowledgeRelation { id, source_object: source, target_object: target, relation_name: relation_name.to_string(), metadata, created_at: now })
    }

    pub fn query_knowledge_objects(
        &self,
        filters: ObjectFilters,
        sort: ObjectSort,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<KnowledgeObject>> {
        let conn = self.conn()?;
        let mut sql = String::from(
            "SELECT id, collection_id, title, data, tags, embedding, status, created_by, created_at, updated_at
             FROM knowledge_objects WHERE 1=1",
        );
        if let Some(cid) = filters.collection_id {
            sql.push_str(&format!(" AND collection_id = '{}'", cid));
        }
        if let Some(status) = filters.status {
            sql.push_str(&format!(" AND status = '{}'", status));
        } else {
            sql.push_str(" AND status != 'deleted'");
        }
        if let Some(tag) = &filters.tag {
            sql.push_str(&format!(" AND tags LIKE '%{}%'", tag.replace('\'', "''").replace('%', "")));
        }
        sql.push_str(match sort {
            ObjectSort::CreatedAtDesc => " ORDER BY created_at DESC",
            ObjectSort::CreatedAtAsc => " ORDER BY created_at ASC",
            ObjectSort::UpdatedAtDesc => " ORDER BY updated_at DESC",
        });
        sql.push_str(" LIMIT ?1 OFFSET ?2");

        let mut stmt = ok(conn.prepare(&sql))?;
        let rows = ok(stmt.query_map(params![limit, offset], row_to_object))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(ok(r)??);
        }
        Ok(out)
    }

    pub fn search_knowledge_objects(&self, query: &str, collection_id: Option<Uuid>, limit: i64) -> Result<Vec<KnowledgeObject>> {
        let conn = self.conn()?;
        let mut sql = String::from(
            "SELECT o.id, o.collection_id, o.title, o.data, o.tags, o.embedding, o.status,
                    o.created_by, o.created_at, o.updated_at
             FROM knowledge_objects_fts
             JOIN knowledge_objects o ON o.rowid = knowledge_objects_fts.rowid
             WHERE knowledge_objects_fts MATCH ?1 AND o.status = 'active'",
        );
        if let Some(cid) = collection_id {
            sql.push_str(&format!(" AND o.collection_id = '{}'", cid));
        }
        sql.push_str(" ORDER BY bm25(knowledge_objects_fts) LIMIT ?2");

        let fts_query = format!("\"{}\"", query.replace('"', " ").trim());
        let mut stmt = ok(conn.prepare(&sql))?;
        let rows = ok(stmt.query_map(params![fts_query, limit], row_to_object))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(ok(r)??);
        }
        Ok(out)
    }

    fn write_knowledge_audit(&self, object_id: Uuid, action: &str, before: Value, after: Value, performed_by: &str) -> Result<()> {
        let conn = self.conn()?;
        ok(conn.execute(
            "INSERT INTO knowledge_audit (id, object_id, action, before, after, performed_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                object_id.to_string(),
                action,
                json_text(&before)?,
                json_text(&after)?,
                performed_by,
                Utc::now().to_rfc3339(),
            ],
        ))?;
        Ok(())
    }

    pub fn knowledge_audit_trail(&self, object_id: Uuid) -> Result<Vec<KnowledgeAuditEntry>> {
        let conn = self.conn()?;
        let mut stmt = ok(conn.prepare(
            "SELECT id, object_id, action, before, after, performed_by, created_at
             FROM knowledge_audit WHERE object_id = ?1 ORDER BY created_at ASC",
        ))?;
        let rows = ok(stmt.query_map(params![object_id.to_string()], |row| {
            Ok(KnowledgeAuditEntry {
                id: get_uuid(row, "id")?,
                object_id: get_uuid(row, "object_id")?,
                action: row.get("action")?,
                before: get_json(row, "before")?,
                after: get_json(row, "after")?,
                performed_by: row.get("performed_by")?,
                created_at: get_dt(row, "created_at")?,
            })
        }))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(ok(r)?);
        }
        Ok(out)
    }
}

/// Concatenates title + every scalar string value in `data` + tags,
/// matching the 4.C FTS-vector derivation rule.
fn object_fts_body(data: &Value) -> String {
    let mut parts = Vec::new();
    collect_scalar_strings(data, &mut parts);
    parts.join(" ")
}

fn collect_scalar_strings(v: &Value, out: &mut Vec<String>) {
    match v {
        Value::String(s) => out.push(s.clone()),
        Value::Array(arr) => arr.iter().for_each(|x| collect_scalar_strings(x, out)),
        Value::Object(obj) => obj.values().for_each(|x| collect_scalar_strings(x, out)),
        _ => {}
    }
}

/// Indexes a freshly-inserted object's tokens. Only valid for rows with no
/// prior FTS entry (i.e. right after `INSERT INTO knowledge_objects`) —
/// updating an existing row must go through [`remove_object_fts`] first.
fn insert_object_fts(conn: &rusqlite::Connection, id: &str, title: &str, data: &Value, tags: &[String]) -> Result<()> {
    ok(conn.execute(
        "INSERT INTO knowledge_objects_fts(rowid, title, data, tags)
         SELECT rowid, ?2, ?3, ?4 FROM knowledge_objects WHERE id = ?1",
        params![id, title, object_fts_body(data), tags.join(" ")],
    ))?;
    Ok(())
}

/// Removes a row's tokens from the index ahead of re-indexing it with new
/// values. A plain `DELETE FROM knowledge_objects_fts WHERE rowid = ...`
/// doesn't work here: for an external-content FTS5 table, SQLite reads the
/// old token values back out of the content table by column name to know
/// what to remove, and `knowledge_objects` has no column matching the FTS
/// table's derived `data` column. Supplying the old (title, data, tags)
/// explicitly via FTS5's special `'delete'` command sidesteps that lookup.
fn remove_object_fts(conn: &rusqlite::Connection, id: &str, title: &str, data: &Value, tags: &[String]) -> Result<()> {
    ok(conn.execute(
        "INSERT INTO knowledge_objects_fts(knowledge_objects_fts, rowid, title, data, tags)
         SELECT 'delete', rowid, ?2, ?3, ?4 FROM knowledge_objects WHERE id = ?1",
        params![id, title, object_fts_body(data), tags.join(" ")],
    ))?;
    Ok(())
}

fn row_to_object(row: &Row) -> rusqlite::Result<KnowledgeObject> {
    Ok(KnowledgeObject {
        id: get_uuid(row, "id")?,
        collection_id: get_uuid(row, "collection_id")?,
        title: row.get("title")?,
        data: get_json(row, "data")?,
        tags: get_tags(row, "tags")?,
        embedding: crate::util::get_embedding(row, "embedding")?,
        status: parse_enum::<ObjectStatus>(row, "status")?,
        created_by: row.get("created_by")?,
        created_at: get_dt(row, "created_at")?,
        updated_at: get_dt(row, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_update_archive_roundtrip() {
        let db = Db::open_in_memory().unwrap();
        let coll = db.create_knowledge_collection("projects", serde_json::json!({}), serde_json::json!({})).unwrap();
        let obj = db
            .create_knowledge_object(coll.id, "Project Atlas", serde_json::json!({"owner": "maya"}), vec!["active".into()], "user-1")
            .unwrap();

        let updated = db.update_knowledge_object(obj.id, serde_json::json!({"status": "blocked"}), "user-1").unwrap();
        assert_eq!(updated.data["owner"], "maya");
        assert_eq!(updated.data["status"], "blocked");

        db.archive_knowledge_object(obj.id, "user-1").unwrap();
        let fetched = db.get_knowledge_object(obj.id).unwrap().unwrap();
        assert_eq!(fetched.status, ObjectStatus::Archived);

        let audit = db.knowledge_audit_trail(obj.id).unwrap();
        assert_eq!(audit.len(), 3);
    }

    #[test]
    fn search_matches_title_and_data() {
        let db = Db::open_in_memory().unwrap();
        let coll = db.create_knowledge_collection("notes", serde_json::json!({}), serde_json::json!({})).unwrap();
        db.create_knowledge_object(coll.id, "Atlas rollout plan", serde_json::json!({"summary": "ship by friday"}), vec![], "u").unwrap();
        let hits = db.search_knowledge_objects("rollout", Some(coll.id), 10).unwrap();
        assert_eq!(hits.len(), 1);
    }
}
