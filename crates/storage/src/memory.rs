//! Memory Store (spec §4.B): area-scoped writes with a hybrid
//! dense+lexical search and temporal decay, plus periodic consolidation.
//!
//! Grounded on `skynet-memory`'s FTS5 external-content pattern (query
//! via `MATCH`, keep the base table authoritative) and its `manager.rs`
//! search/access-bump shape. Cosine similarity and the Jaccard near-dup
//! check are plain arithmetic — no vector extension is assumed to be
//! present, matching the "local model expected" / no vector-DB framing
//! in 4.A.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use crate::db::Db;
use crate::error::Result;
use crate::model::{Memory, MemoryArea, MemorySource, MemoryVisibility};
use crate::util::{embedding_to_blob, get_dt, get_embedding, get_opt_dt, get_opt_uuid, get_tags, get_uuid, json_text, ok, parse_enum};

/// Per-area search tuning (spec 4.B defaults table).
#[derive(Debug, Clone, Copy)]
pub struct MemorySearchConfig {
    pub w_vec: f32,
    pub w_text: f32,
    pub decay: bool,
    pub half_life_days: f32,
    pub min_confidence: f32,
}

pub fn default_search_config(area: MemoryArea) -> MemorySearchConfig {
    match area {
        MemoryArea::Identity => MemorySearchConfig { w_vec: 0.3, w_text: 0.7, decay: false, half_life_days: 0.0, min_confidence: 0.1 },
        MemoryArea::Preferences => MemorySearchConfig { w_vec: 0.3, w_text: 0.7, decay: true, half_life_days: 180.0, min_confidence: 0.2 },
        MemoryArea::Knowledge => MemorySearchConfig { w_vec: 0.6, w_text: 0.4, decay: true, half_life_days: 60.0, min_confidence: 0.3 },
        MemoryArea::Solutions => MemorySearchConfig { w_vec: 0.8, w_text: 0.2, decay: true, half_life_days: 120.0, min_confidence: 0.3 },
        MemoryArea::Episodes => MemorySearchConfig { w_vec: 0.4, w_text: 0.3, decay: true, half_life_days: 14.0, min_confidence: 0.2 },
    }
}

pub struct WriteMemory<'a> {
    pub area: MemoryArea,
    pub content: &'a str,
    pub summary: Option<&'a str>,
    pub tags: Vec<String>,
    pub embedding: Vec<f32>,
    pub confidence: f32,
    pub source: MemorySource,
    pub conversation_id: Option<Uuid>,
    pub channel_id: Option<&'a str>,
    pub project_id: Option<&'a str>,
    pub scope: Option<&'a str>,
    pub visibility: MemoryVisibility,
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct SearchRequest<'a> {
    pub query: &'a str,
    pub query_embedding: Option<Vec<f32>>,
    pub areas: Option<Vec<MemoryArea>>,
    pub project: Option<&'a str>,
    pub limit: usize,
    pub min_confidence: Option<f32>,
    pub include_superseded: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchHit {
    pub memory: Memory,
    pub score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub hits: Vec<SearchHit>,
    /// True when any area's embedding query failed and the result
    /// degraded to text-only ranking (spec 4.B failure semantics).
    pub degraded_text_only: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConsolidateReport {
    pub superseded: usize,
    pub archived_expired: usize,
    pub dropped_degenerate: usize,
}

const DEGENERATE_IDENTITY: &[&str] = &["user", "assistant", "unknown"];

impl Db {
    pub fn write_memory(&self, req: WriteMemory<'_>) -> Result<Memory> {
        let conn = self.conn()?;
        let now = Utc::now();
        let id = Uuid::new_v4();

        if req.source == MemorySource::User && req.area == MemoryArea::Identity {
            let normalized = normalize(req.content);
            let mut stmt = ok(conn.prepare(
                "SELECT id, content FROM memories
                 WHERE area = ?1 AND superseded_by IS NULL",
            ))?;
            let existing = ok(stmt.query_map(params![req.area.to_string()], |row| {
                let id: String = row.get(0)?;
                let content: String = row.get(1)?;
                Ok((id, content))
            }))?;
            for row in existing {
                let (existing_id, existing_content) = ok(row)?;
                if normalize(&existing_content) == normalized {
                    ok(conn.execute(
                        "UPDATE memories SET superseded_by = ?1 WHERE id = ?2",
                        params![id.to_string(), existing_id],
                    ))?;
                }
            }
        }

        ok(conn.execute(
            "INSERT INTO memories
                (id, area, content, summary, tags, embedding, confidence, access_count,
                 reinforcement_count, source, conversation_id, channel_id, project_id,
                 scope, visibility, pinned, superseded_by, created_at, updated_at,
                 last_accessed_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, ?8, ?9, ?10, ?11, ?12, ?13, 0, NULL,
                     ?14, ?14, NULL, ?15)",
            params![
                id.to_string(),
                req.area.to_string(),
                req.content,
                req.summary,
                json_text(&req.tags)?,
                embedding_to_blob(&req.embedding),
                req.confidence,
                req.source.to_string(),
                req.conversation_id.map(|u| u.to_string()),
                req.channel_id,
                req.project_id,
                req.scope,
                req.visibility.to_string(),
                now.to_rfc3339(),
                req.expires_at.map(|d| d.to_rfc3339()),
            ],
        ))?;
        sync_memory_fts(&conn, &id.to_string())?;

        Ok(Memory {
            id,
            area: req.area,
            content: req.content.to_string(),
            summary: req.summary.map(str::to_string),
            tags: req.tags,
            embedding: req.embedding,
            confidence: req.confidence,
            access_count: 0,
            reinforcement_count: 0,
            source: req.source,
            conversation_id: req.conversation_id,
            channel_id: req.channel_id.map(str::to_string),
            project_id: req.project_id.map(str::to_string),
            scope: req.scope.map(str::to_string),
            visibility: req.visibility,
            pinned: false,
            superseded_by: None,
            created_at: now,
            updated_at: now,
            last_accessed_at: None,
            expires_at: req.expires_at,
        })
    }

    pub fn search_memory(&self, req: SearchRequest<'_>) -> Result<SearchResult> {
        let conn = self.conn()?;
        let now = Utc::now();
        let areas: Vec<MemoryArea> = req.areas.unwrap_or_else(|| MemoryArea::ALL.to_vec());
        let degraded = req.query_embedding.is_none();

        let mut all_hits: Vec<SearchHit> = Vec::new();

        for area in areas {
            let cfg = default_search_config(area);
            let min_conf = req.min_confidence.unwrap_or(cfg.min_confidence);

            let mut sql = String::from(
                "SELECT m.id, m.area, m.content, m.summary, m.tags, m.embedding, m.confidence,
                        m.access_count, m.reinforcement_count, m.source, m.conversation_id,
                        m.channel_id, m.project_id, m.scope, m.visibility, m.pinned,
                        m.superseded_by, m.created_at, m.updated_at, m.last_accessed_at,
                        m.expires_at, bm25(memories_fts) AS rank
                 FROM memories_fts
                 JOIN memories m ON m.rowid = memories_fts.rowid
                 WHERE memories_fts MATCH ?1 AND m.area = ?2",
            );
            if let Some(project) = req.project {
                sql.push_str(&format!(" AND m.project_id = '{}'", project.replace('\'', "''")));
            }
            sql.push_str(" ORDER BY rank LIMIT 200");

            let mut stmt = match conn.prepare(&sql) {
                Ok(s) => s,
                Err(_) => continue,
            };
            let fts_query = fts_escape(req.query);
            let rows = match stmt.query_map(params![fts_query, area.to_string()], |row| {
                let mem = row_to_memory(row)?;
                let rank: f64 = row.get("rank")?;
                Ok((mem, rank))
            }) {
                Ok(r) => r,
                Err(_) => continue,
            };

            for row in rows {
                let (mem, rank) = match row {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if !req.include_superseded && !mem.is_active(now) {
                    continue;
                }
                if mem.confidence < min_conf {
                    continue;
                }

                let text_score = ts_rank_to_unit(rank);
                let vec_score = match &req.query_embedding {
                    Some(qe) if !mem.embedding.is_empty() => cosine(qe, &mem.embedding),
                    _ => 0.0,
                };
                let mut score = cfg.w_vec * vec_score + cfg.w_text * text_score;

                if cfg.decay {
                    let age_days = (now - mem.created_at).num_seconds() as f32 / 86_400.0;
                    score *= 2f32.powf(-age_days / cfg.half_life_days.max(0.01));
                }

                all_hits.push(SearchHit { memory: mem, score });
            }
        }

        all_hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        all_hits.truncate(req.limit.max(1));

        for hit in &all_hits {
            let _ = conn.execute(
                "UPDATE memories SET access_count = access_count + 1, last_accessed_at = ?1
                 WHERE id = ?2",
                params![now.to_rfc3339(), hit.memory.id.to_string()],
            );
        }

        Ok(SearchResult { hits: all_hits, degraded_text_only: degraded })
    }

    pub fn consolidate_memories(&self) -> Result<ConsolidateReport> {
        let conn = self.conn()?;
        let now = Utc::now();
        let mut report = ConsolidateReport::default();

        ok(conn.execute(
            "UPDATE memories SET confidence = 0 WHERE expires_at IS NOT NULL AND expires_at <= ?1 AND superseded_by IS NULL",
            params![now.to_rfc3339()],
        ))
        .map(|n| report.archived_expired = n)?;

        for area in MemoryArea::ALL {
            let mut stmt = ok(conn.prepare(
                "SELECT id, content, confidence, embedding FROM memories
                 WHERE area = ?1 AND superseded_by IS NULL AND confidence > 0",
            ))?;
            let candidates: Vec<(Uuid, String, f32, Vec<f32>)> = {
                let rows = ok(stmt.query_map(params![area.to_string()], |row| {
                    Ok((
                        get_uuid(row, "id")?,
                        row.get::<_, String>("content")?,
                        row.get::<_, f32>("confidence")?,
                        get_embedding(row, "embedding")?,
                    ))
                }))?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(ok(r)?);
                }
                out
            };

            let mut superseded_ids: HashSet<Uuid> = HashSet::new();
            for i in 0..candidates.len() {
                if superseded_ids.contains(&candidates[i].0) {
                    continue;
                }
                for j in (i + 1)..candidates.len() {
                    if superseded_ids.contains(&candidates[j].0) {
                        continue;
                    }
                    let cos = if candidates[i].3.is_empty() || candidates[j].3.is_empty() {
                        0.0
                    } else {
                        cosine(&candidates[i].3, &candidates[j].3)
                    };
                    let jac = jaccard(&normalize(&candidates[i].1), &normalize(&candidates[j].1));
                    if cos >= 0.92 && jac >= 0.7 {
                        let (keep, drop) = if candidates[i].2 >= candidates[j].2 {
                            (i, j)
                        } else {
                            (j, i)
                        };
                        let drop_id = candidates[drop].0;
                        let keep_id = candidates[keep].0;
                        if superseded_ids.insert(drop_id) {
                            ok(conn.execute(
                                "UPDATE memories SET superseded_by = ?1 WHERE id = ?2",
                                params![keep_id.to_string(), drop_id.to_string()],
                            ))?;
                            report.superseded += 1;
                        }
                    }
                }
            }

            if area == MemoryArea::Identity {
                let mut stmt = ok(conn.prepare(
                    "SELECT id, content FROM memories WHERE area = 'identity' AND superseded_by IS NULL AND confidence > 0",
                ))?;
                let rows = ok(stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                }))?;
                for r in rows {
                    let (id, content) = ok(r)?;
                    if is_degenerate_identity(&content) {
                        ok(conn.execute("UPDATE memories SET confidence = 0 WHERE id = ?1", params![id]))?;
                        report.dropped_degenerate += 1;
                    }
                }
            }
        }

        Ok(report)
    }
}

fn sync_memory_fts(conn: &rusqlite::Connection, id: &str) -> Result<()> {
    ok(conn.execute(
        "INSERT INTO memories_fts(rowid, summary, content, tags)
         SELECT rowid, coalesce(summary, ''), content, tags FROM memories WHERE id = ?1",
        params![id],
    ))?;
    Ok(())
}

fn row_to_memory(row: &Row) -> rusqlite::Result<Memory> {
    Ok(Memory {
        id: get_uuid(row, "id")?,
        area: parse_enum::<MemoryArea>(row, "area")?,
        content: row.get("content")?,
        summary: row.get("summary")?,
        tags: get_tags(row, "tags")?,
        embedding: get_embedding(row, "embedding")?,
        confidence: row.get("confidence")?,
        access_count: row.get::<_, i64>("access_count")? as u64,
        reinforcement_count: row.get::<_, i64>("reinforcement_count")? as u64,
        source: parse_enum::<MemorySource>(row, "source")?,
        conversation_id: get_opt_uuid(row, "conversation_id")?,
        channel_id: row.get("channel_id")?,
        project_id: row.get("project_id")?,
        scope: row.get("scope")?,
        visibility: parse_enum::<MemoryVisibility>(row, "visibility")?,
        pinned: row.get("pinned")?,
        superseded_by: get_opt_uuid(row, "superseded_by")?,
        created_at: get_dt(row, "created_at")?,
        updated_at: get_dt(row, "updated_at")?,
        last_accessed_at: get_opt_dt(row, "last_accessed_at")?,
        expires_at: get_opt_dt(row, "expires_at")?,
    })
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        (dot / (na * nb)).clamp(-1.0, 1.0)
    }
}

fn normalize(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn jaccard(a: &str, b: &str) -> f32 {
    let sa: HashSet<&str> = a.split_whitespace().collect();
    let sb: HashSet<&str> = b.split_whitespace().collect();
    if sa.is_empty() && sb.is_empty() {
        return 1.0;
    }
    let inter = sa.intersection(&sb).count() as f32;
    let union = sa.union(&sb).count() as f32;
    if union == 0.0 {
        0.0
    } else {
        inter / union
    }
}

fn is_degenerate_identity(content: &str) -> bool {
    let n = normalize(content);
    if n.ends_with('?') || content.trim_end().ends_with('?') {
        return true;
    }
    if DEGENERATE_IDENTITY.contains(&n.as_str()) {
        return true;
    }
    let time_pattern = n.contains("am") || n.contains("pm");
    let looks_like_clock = n.chars().filter(|c| c.is_ascii_digit()).count() >= 1 && n.contains(':');
    time_pattern && looks_like_clock
}

fn fts_escape(query: &str) -> String {
    let cleaned: String = query
        .chars()
        .map(|c| if c == '"' { ' ' } else { c })
        .collect();
    format!("\"{}\"", cleaned.trim())
}

/// SQLite's `bm25()` returns lower-is-better unbounded scores; map to a
/// roughly-[0,1] unit scale via a logistic squash so it composes with
/// cosine similarity in the weighted sum.
fn ts_rank_to_unit(bm25: f64) -> f32 {
    let x = -bm25;
    (1.0 / (1.0 + (-x / 4.0).exp())) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_search_text_only() {
        let db = Db::open_in_memory().unwrap();
        db.write_memory(WriteMemory {
            area: MemoryArea::Knowledge,
            content: "the sky is blue during the day",
            summary: Some("sky color fact"),
            tags: vec!["color".into()],
            embedding: vec![],
            confidence: 0.9,
            source: MemorySource::Inferred,
            conversation_id: None,
            channel_id: None,
            project_id: None,
            scope: None,
            visibility: MemoryVisibility::Shared,
            expires_at: None,
        })
        .unwrap();

        let result = db
            .search_memory(SearchRequest {
                query: "sky blue",
                query_embedding: None,
                areas: Some(vec![MemoryArea::Knowledge]),
                project: None,
                limit: 5,
                min_confidence: None,
                include_superseded: false,
            })
            .unwrap();
        assert!(result.degraded_text_only);
        assert_eq!(result.hits.len(), 1);
        assert!(result.hits[0].score > 0.0);
    }

    #[test]
    fn user_identity_write_supersedes_duplicate() {
        let db = Db::open_in_memory().unwrap();
        let first = db
            .write_memory(WriteMemory {
                area: MemoryArea::Identity,
                content: "My name is Alex",
                summary: None,
                tags: vec![],
                embedding: vec![],
                confidence: 0.9,
                source: MemorySource::User,
                conversation_id: None,
                channel_id: None,
                project_id: None,
                scope: None,
                visibility: MemoryVisibility::Shared,
                expires_at: None,
            })
            .unwrap();
        db.write_memory(WriteMemory {
            area: MemoryArea::Identity,
            content: "my name is alex",
            summary: None,
            tags: vec![],
            embedding: vec![],
            confidence: 0.9,
            source: MemorySource::User,
            conversation_id: None,
            channel_id: None,
            project_id: None,
            scope: None,
            visibility: MemoryVisibility::Shared,
            expires_at: None,
        })
        .unwrap();

        let conn = db.conn().unwrap();
        let superseded: Option<String> = conn
            .query_row(
                "SELECT superseded_by FROM memories WHERE id = ?1",
                params![first.id.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        assert!(superseded.is_some());
    }

    #[test]
    fn consolidate_drops_degenerate_identity() {
        let db = Db::open_in_memory().unwrap();
        db.write_memory(WriteMemory {
            area: MemoryArea::Identity,
            content: "unknown",
            summary: None,
            tags: vec![],
            embedding: vec![],
            confidence: 0.5,
            source: MemorySource::Inferred,
            conversation_id: None,
            channel_id: None,
            project_id: None,
            scope: None,
            visibility: MemoryVisibility::Shared,
            expires_at: None,
        })
        .unwrap();
        let report = db.consolidate_memories().unwrap();
        assert_eq!(report.dropped_degenerate, 1);
    }
}
