//! Append-only usage ledger backing Model Router `record_usage` (4.A)
//! and per-model cost reporting. Grounded on the teacher's
//! `ModelPricing`/cost-estimation table in `sa_domain::config::llm`,
//! which computed cost per call but never persisted it — this module
//! is the durable sink for that figure.

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use crate::db::Db;
use crate::error::Result;
use crate::model::{TaskClass, UsageRecord};
use crate::util::ok;

pub struct NewUsage<'a> {
    pub provider: &'a str,
    pub model: &'a str,
    pub task: TaskClass,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub conversation_id: Option<Uuid>,
    pub agent_id: Option<&'a str>,
    pub error: Option<&'a str>,
}

impl Db {
    pub fn record_usage(&self, rec: NewUsage<'_>) -> Result<UsageRecord> {
        let conn = self.conn()?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        ok(conn.execute(
            "INSERT INTO usage_log
                (id, provider, model, task, input_tokens, output_tokens, cost_usd, latency_ms,
                 conversation_id, agent_id, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                id.to_string(),
                rec.provider,
                rec.model,
                rec.task.to_string(),
                rec.input_tokens,
                rec.output_tokens,
                rec.cost_usd,
                rec.latency_ms,
                rec.conversation_id.map(|u| u.to_string()),
                rec.agent_id,
                rec.error,
                now.to_rfc3339(),
            ],
        ))?;
        Ok(UsageRecord {
            id,
            provider: rec.provider.to_string(),
            model: rec.model.to_string(),
            task: rec.task,
            input_tokens: rec.input_tokens,
            output_tokens: rec.output_tokens,
            cost_usd: rec.cost_usd,
            latency_ms: rec.latency_ms,
            conversation_id: rec.conversation_id,
            agent_id: rec.agent_id.map(str::to_string),
            error: rec.error.map(str::to_string),
            created_at: now,
        })
    }

    pub fn usage_total_cost_since(&self, since: chrono::DateTime<Utc>) -> Result<f64> {
        let conn = self.conn()?;
        let total: f64 = ok(conn.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM usage_log WHERE created_at >= ?1",
            params![since.to_rfc3339()],
            |row| row.get(0),
        ))?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn record_and_sum_cost() {
        let db = Db::open_in_memory().unwrap();
        db.record_usage(NewUsage {
            provider: "anthropic",
            model: "claude-sonnet-4-20250514",
            task: TaskClass::Chat,
            input_tokens: 100,
            output_tokens: 50,
            cost_usd: 0.0045,
            latency_ms: 900,
            conversation_id: None,
            agent_id: Some("personal"),
            error: None,
        })
        .unwrap();
        let total = db.usage_total_cost_since(Utc::now() - Duration::hours(1)).unwrap();
        assert!((total - 0.0045).abs() < 1e-9);
    }
}
