//! Cron job runner (spec §4.F): claims due `sa_storage::cron` rows via the
//! DB-level CAS (P5) and dispatches `system_event` jobs to a registered
//! handler or `agent_turn` jobs through [`crate::runtime::run_turn`].
//!
//! Modeled on `schedule_runner::ScheduleRunner::tick`/`spawn_run` (fetch
//! due work, spawn, collect, record completion) but against the
//! relational store instead of the JSON-file `ScheduleStore`, since only
//! a DB CAS survives a crash with "at most one running claim" intact
//! (P5) — see the redesign note in `sa_storage::cron`.

use std::time::Duration as StdDuration;

use chrono::Utc;

use sa_storage::model::{CronJob, CronRunStatus, PayloadKind};

use crate::state::AppState;

/// Minimum wake interval for the claim loop (spec §4.F).
const TICK_INTERVAL: StdDuration = StdDuration::from_secs(1);
/// A job whose `running_at` is older than this is presumed abandoned by
/// a crashed runner and recovered at startup.
const ABANDONED_TIMEOUT_SECONDS: i64 = 600;

/// Registry of in-process handlers for `system_event` cron jobs, keyed by
/// `payload_text` prefix before the first `:` (e.g. `prune:` -> pruning).
/// Kept tiny and explicit rather than a dynamic dispatch table, matching
/// the teacher's preference for a flat match over a plugin registry.
async fn run_system_event(state: &AppState, job: &CronJob) -> Result<(), String> {
    let (kind, _rest) = job.payload_text.split_once(':').unwrap_or((job.payload_text.as_str(), ""));
    match kind {
        "session_flush" => {
            state.sessions.flush().await.map_err(|e| e.to_string())?;
            Ok(())
        }
        "prune_stale_nodes" => {
            state.nodes.prune_stale(120);
            Ok(())
        }
        "recover_abandoned_cron" => {
            state
                .db
                .recover_abandoned_cron_jobs(ABANDONED_TIMEOUT_SECONDS)
                .map_err(|e| e.to_string())?;
            Ok(())
        }
        other => Err(format!("unknown system_event cron payload: {other}")),
    }
}

/// Run one `agent_turn` job to completion and return its final content.
async fn run_agent_turn(state: &AppState, job: &CronJob) -> Result<String, String> {
    let session_key = match job.session_target {
        sa_storage::model::SessionTarget::Main => format!("cron:{}", job.agent_id),
        sa_storage::model::SessionTarget::Isolated => format!("cron:{}:{}", job.id, Utc::now().format("%Y%m%d%H%M%S")),
    };
    let session_id = format!("cron-{}-{}", job.id, Utc::now().format("%Y%m%d%H%M%S"));

    let mut input = crate::runtime::TurnInput::new(session_key, session_id, job.payload_text.clone());
    input.model = job.model.clone();

    let (_run_id, mut rx) = crate::runtime::run_turn(state.clone(), input);

    let collect = async {
        let mut final_content = String::new();
        while let Some(event) = rx.recv().await {
            match event {
                crate::runtime::TurnEvent::Final { content, .. } => final_content = content,
                crate::runtime::TurnEvent::Error { message } => return Err(message),
                _ => {}
            }
        }
        Ok(final_content)
    };

    match job.timeout_ms {
        Some(ms) => tokio::time::timeout(StdDuration::from_millis(ms), collect)
            .await
            .map_err(|_| format!("cron job {} timed out after {}ms", job.id, ms))?,
        None => collect.await,
    }
}

async fn run_job(state: &AppState, job: CronJob) {
    let started = std::time::Instant::now();
    let result = match job.payload_kind {
        PayloadKind::SystemEvent => run_system_event(state, &job).await,
        PayloadKind::AgentTurn => run_agent_turn(state, &job).await.map(|_| ()),
    };
    let duration_ms = started.elapsed().as_millis() as i64;

    let (status, error) = match &result {
        Ok(()) => (CronRunStatus::Ok, None),
        Err(msg) => (CronRunStatus::Error, Some(msg.as_str())),
    };
    if let Err(e) = state.db.complete_cron_run(job.id, status, error, duration_ms) {
        tracing::error!(job_id = %job.id, error = %e, "failed to record cron run completion");
    }
    if let Err(msg) = result {
        tracing::warn!(job_id = %job.id, name = %job.name, error = %msg, "cron job run failed");
    }
}

/// Spawn the cron claim loop. Call once from `bootstrap::spawn_background_tasks`.
pub fn spawn(state: AppState) {
    tokio::spawn(async move {
        match state.db.recover_abandoned_cron_jobs(ABANDONED_TIMEOUT_SECONDS) {
            Ok(0) => {}
            Ok(n) => tracing::info!(recovered = n, "recovered abandoned cron jobs on startup"),
            Err(e) => tracing::warn!(error = %e, "cron job crash recovery failed"),
        }

        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            loop {
                let claimed = match state.db.claim_due_cron_job(Utc::now()) {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "cron claim query failed");
                        break;
                    }
                };
                let state = state.clone();
                tokio::spawn(async move { run_job(&state, claimed).await });
            }
        }
    });
}
