//! SQLite-backed persistence pool and schema migration.
//!
//! Grounded on `inkolin-smartopol-ai/skynet`'s `skynet-memory::db::init_db`
//! (rusqlite + FTS5 external-content tables, synced manually on write) —
//! the only repo in the retrieval pack that persists this class of data.
//! The teacher's own stores (`ScheduleStore`, session transcripts) use a
//! JSON file + `parking_lot::RwLock`, which has no transactional CAS
//! primitive and no FTS, both required by spec P5 and the hybrid-search
//! contract.

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::error::{map_pool, map_rusqlite, Result};

pub type Pool = r2d2::Pool<SqliteConnectionManager>;
pub type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

/// Handle to the orchestration core's relational store.
#[derive(Clone)]
pub struct Db {
    pool: Pool,
}

impl Db {
    /// Open (and migrate) a SQLite database at `path`. Safe to call on
    /// every startup — all DDL is `IF NOT EXISTS`.
    pub fn open(path: &std::path::Path, pool_size: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
            )
        });
        let pool = r2d2::Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(map_pool)?;
        let db = Self { pool };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database for tests — a fresh schema per call.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = r2d2::Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(map_pool)?;
        let db = Self { pool };
        db.migrate()?;
        Ok(db)
    }

    pub fn conn(&self) -> Result<PooledConn> {
        self.pool.get().map_err(map_pool)
    }

    /// `GET /health/db` probe: a cheap round-trip query.
    pub fn health_check(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(())).map_err(map_rusqlite)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        create_schema(&conn).map_err(map_rusqlite)
    }
}

fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conversations (
            id            TEXT PRIMARY KEY,
            agent_id      TEXT NOT NULL,
            channel_id    TEXT,
            session_key   TEXT UNIQUE,
            title         TEXT,
            type          TEXT NOT NULL DEFAULT 'direct',
            inbox_status  TEXT,
            contact_id    TEXT,
            metadata      TEXT NOT NULL DEFAULT '{}',
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_agent ON conversations(agent_id);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            role            TEXT NOT NULL,
            content         TEXT,
            tool_calls      TEXT NOT NULL DEFAULT '[]',
            tool_results    TEXT NOT NULL DEFAULT '[]',
            model           TEXT,
            input_tokens    INTEGER NOT NULL DEFAULT 0,
            output_tokens   INTEGER NOT NULL DEFAULT 0,
            cache_read_tokens  INTEGER NOT NULL DEFAULT 0,
            cache_write_tokens INTEGER NOT NULL DEFAULT 0,
            attachments     TEXT NOT NULL DEFAULT '[]',
            pinned          INTEGER NOT NULL DEFAULT 0,
            reported        INTEGER NOT NULL DEFAULT 0,
            reply_to        TEXT,
            forwarded_from  TEXT,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        CREATE TABLE IF NOT EXISTS memories (
            id                  TEXT PRIMARY KEY,
            area                TEXT NOT NULL,
            content             TEXT NOT NULL,
            summary             TEXT,
            tags                TEXT NOT NULL DEFAULT '[]',
            embedding           BLOB,
            confidence          REAL NOT NULL DEFAULT 0.8,
            access_count        INTEGER NOT NULL DEFAULT 0,
            reinforcement_count INTEGER NOT NULL DEFAULT 0,
            source              TEXT NOT NULL,
            conversation_id     TEXT,
            channel_id          TEXT,
            project_id          TEXT,
            scope               TEXT,
            visibility          TEXT NOT NULL DEFAULT 'shared',
            pinned              INTEGER NOT NULL DEFAULT 0,
            superseded_by       TEXT,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL,
            last_accessed_at    TEXT,
            expires_at          TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_memories_area ON memories(area);
        CREATE INDEX IF NOT EXISTS idx_memories_superseded ON memories(superseded_by);

        CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts
            USING fts5(summary, content, tags, content='memories', content_rowid='rowid');

        CREATE TABLE IF NOT EXISTS knowledge_collections (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL UNIQUE,
            schema      TEXT NOT NULL DEFAULT '{}',
            config      TEXT NOT NULL DEFAULT '{}',
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS knowledge_objects (
            id              TEXT PRIMARY KEY,
            collection_id   TEXT NOT NULL REFERENCES knowledge_collections(id),
            title           TEXT NOT NULL,
            data            TEXT NOT NULL DEFAULT '{}',
            tags            TEXT NOT NULL DEFAULT '[]',
            embedding       BLOB,
            status          TEXT NOT NULL DEFAULT 'active',
            created_by      TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_knowledge_objects_collection
            ON knowledge_objects(collection_id, status);

        CREATE VIRTUAL TABLE IF NOT EXISTS knowledge_objects_fts
            USING fts5(title, data, tags, content='knowledge_objects', content_rowid='rowid');

        CREATE TABLE IF NOT EXISTS knowledge_relations (
            id              TEXT PRIMARY KEY,
            source_object   TEXT NOT NULL REFERENCES knowledge_objects(id) ON DELETE CASCADE,
            target_object   TEXT NOT NULL REFERENCES knowledge_objects(id) ON DELETE CASCADE,
            relation_name   TEXT NOT NULL,
            metadata        TEXT NOT NULL DEFAULT '{}',
            created_at      TEXT NOT NULL,
            UNIQUE(source_object, target_object, relation_name)
        );

        CREATE TABLE IF NOT EXISTS knowledge_audit (
            id              TEXT PRIMARY KEY,
            object_id       TEXT NOT NULL,
            action          TEXT NOT NULL,
            before          TEXT NOT NULL DEFAULT 'null',
            after           TEXT NOT NULL DEFAULT 'null',
            performed_by    TEXT NOT NULL,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_knowledge_audit_object ON knowledge_audit(object_id);

        CREATE TABLE IF NOT EXISTS cron_jobs (
            id                  TEXT PRIMARY KEY,
            agent_id            TEXT NOT NULL,
            name                TEXT NOT NULL UNIQUE,
            enabled             INTEGER NOT NULL DEFAULT 1,
            schedule_kind       TEXT NOT NULL,
            schedule_at         TEXT,
            schedule_interval_ms INTEGER,
            schedule_cron_expr  TEXT,
            schedule_cron_tz    TEXT,
            session_target      TEXT NOT NULL DEFAULT 'main',
            payload_kind        TEXT NOT NULL,
            payload_text        TEXT NOT NULL DEFAULT '',
            model               TEXT,
            timeout_ms          INTEGER,
            next_run_at         TEXT,
            running_at          TEXT,
            last_run_at         TEXT,
            last_status         TEXT,
            last_error          TEXT,
            last_duration_ms    INTEGER,
            consecutive_errors  INTEGER NOT NULL DEFAULT 0,
            delete_after_run    INTEGER NOT NULL DEFAULT 0,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_cron_jobs_next_run ON cron_jobs(next_run_at);

        CREATE TABLE IF NOT EXISTS cron_job_runs (
            id          TEXT PRIMARY KEY,
            job_id      TEXT NOT NULL REFERENCES cron_jobs(id) ON DELETE CASCADE,
            status      TEXT NOT NULL,
            error       TEXT,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            started_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_cron_job_runs_job ON cron_job_runs(job_id, started_at);

        CREATE TABLE IF NOT EXISTS review_items (
            id              TEXT PRIMARY KEY,
            agent_id        TEXT NOT NULL,
            conversation_id TEXT,
            type            TEXT NOT NULL,
            title           TEXT NOT NULL,
            description     TEXT,
            content         TEXT NOT NULL DEFAULT '[]',
            proposed_action TEXT NOT NULL DEFAULT '[]',
            alternatives    TEXT NOT NULL DEFAULT '[]',
            status          TEXT NOT NULL DEFAULT 'pending',
            resolution      TEXT,
            resolved_by     TEXT,
            resolved_at     TEXT,
            priority        INTEGER NOT NULL DEFAULT 0,
            tags            TEXT NOT NULL DEFAULT '[]',
            batch_id        TEXT,
            expires_at      TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_review_items_status ON review_items(status, priority DESC, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_review_items_agent ON review_items(agent_id);

        CREATE TABLE IF NOT EXISTS model_routes (
            task        TEXT PRIMARY KEY,
            provider    TEXT NOT NULL,
            model       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS usage_log (
            id              TEXT PRIMARY KEY,
            provider        TEXT NOT NULL,
            model           TEXT NOT NULL,
            task            TEXT NOT NULL,
            input_tokens    INTEGER NOT NULL DEFAULT 0,
            output_tokens   INTEGER NOT NULL DEFAULT 0,
            cost_usd        REAL NOT NULL DEFAULT 0,
            latency_ms      INTEGER NOT NULL DEFAULT 0,
            conversation_id TEXT,
            agent_id        TEXT,
            error           TEXT,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_log_created ON usage_log(created_at);
        ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_migrates_without_error() {
        let db = Db::open_in_memory().unwrap();
        db.health_check().unwrap();
    }

    #[test]
    fn migrate_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        // Re-running the schema DDL against the same connection must not error.
        let conn = db.conn().unwrap();
        create_schema(&conn).unwrap();
    }
}
