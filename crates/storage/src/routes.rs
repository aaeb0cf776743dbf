//! Model Route persistence (spec §4.A): a persisted task-class →
//! (provider, model) mapping with hard-coded defaults as fallback.
//!
//! Grounded on the teacher's `LlmRouter::resolve_model` (in
//! `sa-providers`), which already does string-keyed role resolution
//! against a config map — here the map moves from static config into
//! a DB table so `update()` persists across restarts.

use chrono::Utc;
use rusqlite::params;

use crate::db::Db;
use crate::error::Result;
use crate::model::{default_route, ModelRoute, ProviderKind, TaskClass};
use crate::util::{get_dt, ok, parse_enum};

impl Db {
    /// Resolves a task class to its route, falling back to the
    /// hard-coded default when no row is persisted yet.
    pub fn resolve_route(&self, task: TaskClass) -> Result<(ModelRoute, bool)> {
        let conn = self.conn()?;
        let mut stmt = ok(conn.prepare(
            "SELECT task, provider, model, updated_at FROM model_routes WHERE task = ?1",
        ))?;
        let mut rows = ok(stmt.query(params![task.to_string()]))?;
        if let Some(row) = ok(rows.next())? {
            let route = ModelRoute {
                task: parse_enum::<TaskClass>(row, "task").map_err(crate::error::map_rusqlite)?,
                provider: parse_enum::<ProviderKind>(row, "provider").map_err(crate::error::map_rusqlite)?,
                model: row.get("model").map_err(crate::error::map_rusqlite)?,
                updated_at: get_dt(row, "updated_at").map_err(crate::error::map_rusqlite)?,
            };
            return Ok((route, true));
        }
        let (provider, model) = default_route(task);
        Ok((
            ModelRoute { task, provider, model: model.to_string(), updated_at: Utc::now() },
            false,
        ))
    }

    pub fn update_route(&self, task: TaskClass, provider: ProviderKind, model: &str) -> Result<ModelRoute> {
        let conn = self.conn()?;
        let now = Utc::now();
        ok(conn.execute(
            "INSERT INTO model_routes (task, provider, model, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(task) DO UPDATE SET provider = excluded.provider, model = excluded.model, updated_at = excluded.updated_at",
            params![task.to_string(), provider.to_string(), model, now.to_rfc3339()],
        ))?;
        Ok(ModelRoute { task, provider, model: model.to_string(), updated_at: now })
    }

    pub fn list_routes(&self) -> Result<Vec<ModelRoute>> {
        let mut out = Vec::new();
        for task in TaskClass::ALL {
            out.push(self.resolve_route(task)?.0);
        }
        Ok(out)
    }

    /// Seeds every task class with its hard-coded default if absent.
    /// Safe to call on every boot.
    pub fn seed_default_routes(&self) -> Result<()> {
        let conn = self.conn()?;
        let now = Utc::now();
        for task in TaskClass::ALL {
            let (provider, model) = default_route(task);
            ok(conn.execute(
                "INSERT OR IGNORE INTO model_routes (task, provider, model, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![task.to_string(), provider.to_string(), model, now.to_rfc3339()],
            ))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_falls_back_to_default_when_unseeded() {
        let db = Db::open_in_memory().unwrap();
        let (route, from_db) = db.resolve_route(TaskClass::Chat).unwrap();
        assert!(!from_db);
        assert_eq!(route.model, "claude-sonnet-4-20250514");
    }

    #[test]
    fn update_persists_override() {
        let db = Db::open_in_memory().unwrap();
        db.update_route(TaskClass::Chat, ProviderKind::Openrouter, "openai/gpt-4o").unwrap();
        let (route, from_db) = db.resolve_route(TaskClass::Chat).unwrap();
        assert!(from_db);
        assert_eq!(route.model, "openai/gpt-4o");
    }

    #[test]
    fn seed_defaults_covers_every_task() {
        let db = Db::open_in_memory().unwrap();
        db.seed_default_routes().unwrap();
        assert_eq!(db.list_routes().unwrap().len(), 8);
    }
}
