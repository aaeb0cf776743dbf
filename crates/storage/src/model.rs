//! Entity structs and closed-set enums for every persisted type in the
//! orchestration core's data model (conversations/messages, memories,
//! knowledge objects/relations, cron jobs, review items, model routes).
//!
//! Open-ended JSON columns (`metadata`, `data`, `tool_calls`, `config`,
//! review `content`) are kept as [`serde_json::Value`] at this boundary
//! and parsed into specific record types at each use site, per the
//! "Open-ended JSONB" design note — this module does not attempt a
//! single sum type for "any JSON".

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversations & messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    Direct,
    Inbox,
}

impl fmt::Display for ConversationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConversationType::Direct => "direct",
            ConversationType::Inbox => "inbox",
        })
    }
}

impl FromStr for ConversationType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "inbox" => Ok(Self::Inbox),
            other => Err(format!("unknown conversation type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub agent_id: String,
    pub channel_id: Option<String>,
    pub session_key: Option<String>,
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub kind: ConversationType,
    pub inbox_status: Option<String>,
    pub contact_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Tool => "tool",
        })
    }
}

impl FromStr for MessageRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_read_tokens: u32,
    #[serde(default)]
    pub cache_write_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: Option<String>,
    /// `Vec<sa_domain::tool::ToolCall>`-shaped JSON, kept raw at the
    /// storage boundary.
    pub tool_calls: serde_json::Value,
    pub tool_results: serde_json::Value,
    pub model: Option<String>,
    pub token_usage: TokenUsage,
    pub attachments: serde_json::Value,
    pub pinned: bool,
    pub reported: bool,
    pub reply_to: Option<Uuid>,
    pub forwarded_from: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryArea {
    Identity,
    Preferences,
    Knowledge,
    Solutions,
    Episodes,
}

impl MemoryArea {
    pub const ALL: [MemoryArea; 5] = [
        MemoryArea::Identity,
        MemoryArea::Preferences,
        MemoryArea::Knowledge,
        MemoryArea::Solutions,
        MemoryArea::Episodes,
    ];
}

impl fmt::Display for MemoryArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemoryArea::Identity => "identity",
            MemoryArea::Preferences => "preferences",
            MemoryArea::Knowledge => "knowledge",
            MemoryArea::Solutions => "solutions",
            MemoryArea::Episodes => "episodes",
        })
    }
}

impl FromStr for MemoryArea {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" => Ok(Self::Identity),
            "preferences" => Ok(Self::Preferences),
            "knowledge" => Ok(Self::Knowledge),
            "solutions" => Ok(Self::Solutions),
            "episodes" => Ok(Self::Episodes),
            other => Err(format!("unknown memory area: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    User,
    Inferred,
    SolutionCapture,
    Episode,
    Flush,
    Feedback,
}

impl fmt::Display for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemorySource::User => "user",
            MemorySource::Inferred => "inferred",
            MemorySource::SolutionCapture => "solution_capture",
            MemorySource::Episode => "episode",
            MemorySource::Flush => "flush",
            MemorySource::Feedback => "feedback",
        })
    }
}

impl FromStr for MemorySource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "inferred" => Ok(Self::Inferred),
            "solution_capture" => Ok(Self::SolutionCapture),
            "episode" => Ok(Self::Episode),
            "flush" => Ok(Self::Flush),
            "feedback" => Ok(Self::Feedback),
            other => Err(format!("unknown memory source: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryVisibility {
    Shared,
    Private,
    Restricted,
}

impl fmt::Display for MemoryVisibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemoryVisibility::Shared => "shared",
            MemoryVisibility::Private => "private",
            MemoryVisibility::Restricted => "restricted",
        })
    }
}

impl FromStr for MemoryVisibility {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(Self::Shared),
            "private" => Ok(Self::Private),
            "restricted" => Ok(Self::Restricted),
            other => Err(format!("unknown memory visibility: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: Uuid,
    pub area: MemoryArea,
    pub content: String,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    /// `D`-dimensional embedding; empty when the embed call failed.
    pub embedding: Vec<f32>,
    pub confidence: f32,
    pub access_count: u64,
    pub reinforcement_count: u64,
    pub source: MemorySource,
    pub conversation_id: Option<Uuid>,
    pub channel_id: Option<String>,
    pub project_id: Option<String>,
    pub scope: Option<String>,
    pub visibility: MemoryVisibility,
    pub pinned: bool,
    pub superseded_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Memory {
    /// Active iff not superseded, not expired, and confidence above floor.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.superseded_by.is_none()
            && self.expires_at.map_or(true, |exp| exp > now)
            && self.confidence > 0.05
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Knowledge store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeCollection {
    pub id: Uuid,
    pub name: String,
    pub schema: serde_json::Value,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStatus {
    Active,
    Archived,
    Deleted,
}

impl fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ObjectStatus::Active => "active",
            ObjectStatus::Archived => "archived",
            ObjectStatus::Deleted => "deleted",
        })
    }
}

impl FromStr for ObjectStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown object status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeObject {
    pub id: Uuid,
    pub collection_id: Uuid,
    pub title: String,
    pub data: serde_json::Value,
    pub tags: Vec<String>,
    pub embedding: Vec<f32>,
    pub status: ObjectStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeRelation {
    pub id: Uuid,
    pub source_object: Uuid,
    pub target_object: Uuid,
    pub relation_name: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeAuditEntry {
    pub id: Uuid,
    pub object_id: Uuid,
    pub action: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
    pub performed_by: String,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cron jobs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleKind {
    At { at: DateTime<Utc> },
    Every { interval_ms: i64 },
    Cron { expr: String, tz: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTarget {
    Main,
    Isolated,
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionTarget::Main => "main",
            SessionTarget::Isolated => "isolated",
        })
    }
}

impl FromStr for SessionTarget {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(Self::Main),
            "isolated" => Ok(Self::Isolated),
            other => Err(format!("unknown session target: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    SystemEvent,
    AgentTurn,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PayloadKind::SystemEvent => "system_event",
            PayloadKind::AgentTurn => "agent_turn",
        })
    }
}

impl FromStr for PayloadKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system_event" => Ok(Self::SystemEvent),
            "agent_turn" => Ok(Self::AgentTurn),
            other => Err(format!("unknown payload kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronRunStatus {
    Ok,
    Error,
    Skipped,
}

impl fmt::Display for CronRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CronRunStatus::Ok => "ok",
            CronRunStatus::Error => "error",
            CronRunStatus::Skipped => "skipped",
        })
    }
}

impl FromStr for CronRunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown cron run status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: Uuid,
    pub agent_id: String,
    pub name: String,
    pub enabled: bool,
    pub schedule: ScheduleKind,
    pub session_target: SessionTarget,
    pub payload_kind: PayloadKind,
    pub payload_text: String,
    pub model: Option<String>,
    pub timeout_ms: Option<u64>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub running_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<CronRunStatus>,
    pub last_error: Option<String>,
    pub last_duration_ms: Option<i64>,
    pub consecutive_errors: u32,
    pub delete_after_run: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobRun {
    pub id: Uuid,
    pub job_id: Uuid,
    pub status: CronRunStatus,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub started_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Review queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewType {
    Approve,
    Classify,
    Match,
    Select,
    Verify,
    Freeform,
    Triage,
    VerifyFact,
}

impl fmt::Display for ReviewType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReviewType::Approve => "approve",
            ReviewType::Classify => "classify",
            ReviewType::Match => "match",
            ReviewType::Select => "select",
            ReviewType::Verify => "verify",
            ReviewType::Freeform => "freeform",
            ReviewType::Triage => "triage",
            ReviewType::VerifyFact => "verify_fact",
        })
    }
}

impl FromStr for ReviewType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "classify" => Ok(Self::Classify),
            "match" => Ok(Self::Match),
            "select" => Ok(Self::Select),
            "verify" => Ok(Self::Verify),
            "freeform" => Ok(Self::Freeform),
            "triage" => Ok(Self::Triage),
            "verify_fact" => Ok(Self::VerifyFact),
            other => Err(format!("unknown review type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    Modified,
}

impl ReviewStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ReviewStatus::Pending)
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
            ReviewStatus::Modified => "modified",
        })
    }
}

impl FromStr for ReviewStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "modified" => Ok(Self::Modified),
            other => Err(format!("unknown review status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: Uuid,
    pub agent_id: String,
    pub conversation_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub kind: ReviewType,
    pub title: String,
    pub description: Option<String>,
    /// Ordered list of typed content blocks, kept raw.
    pub content: serde_json::Value,
    pub proposed_action: serde_json::Value,
    pub alternatives: serde_json::Value,
    pub status: ReviewStatus,
    pub resolution: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub priority: i32,
    pub tags: Vec<String>,
    pub batch_id: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReviewItem {
    /// Pending items carry no resolved_*; resolved items carry both.
    pub fn invariant_holds(&self) -> bool {
        if self.status == ReviewStatus::Pending {
            self.resolved_at.is_none() && self.resolution.is_none()
        } else {
            self.resolved_at.is_some() && self.status.is_terminal()
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model routes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskClass {
    Chat,
    Tool,
    Utility,
    Triage,
    Classifier,
    Embedding,
    Voice,
    Lightweight,
}

impl TaskClass {
    pub const ALL: [TaskClass; 8] = [
        TaskClass::Chat,
        TaskClass::Tool,
        TaskClass::Utility,
        TaskClass::Triage,
        TaskClass::Classifier,
        TaskClass::Embedding,
        TaskClass::Voice,
        TaskClass::Lightweight,
    ];
}

impl fmt::Display for TaskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskClass::Chat => "chat",
            TaskClass::Tool => "tool",
            TaskClass::Utility => "utility",
            TaskClass::Triage => "triage",
            TaskClass::Classifier => "classifier",
            TaskClass::Embedding => "embedding",
            TaskClass::Voice => "voice",
            TaskClass::Lightweight => "lightweight",
        })
    }
}

impl FromStr for TaskClass {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Self::Chat),
            "tool" => Ok(Self::Tool),
            "utility" => Ok(Self::Utility),
            "triage" => Ok(Self::Triage),
            "classifier" => Ok(Self::Classifier),
            "embedding" => Ok(Self::Embedding),
            "voice" => Ok(Self::Voice),
            "lightweight" => Ok(Self::Lightweight),
            other => Err(format!("unknown task class: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    Openrouter,
    Ollama,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Openrouter => "openrouter",
            ProviderKind::Ollama => "ollama",
        })
    }
}

impl FromStr for ProviderKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anthropic" => Ok(Self::Anthropic),
            "openrouter" => Ok(Self::Openrouter),
            "ollama" => Ok(Self::Ollama),
            other => Err(format!("unknown provider kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRoute {
    pub task: TaskClass,
    pub provider: ProviderKind,
    pub model: String,
    pub updated_at: DateTime<Utc>,
}

/// The default route table seeded on first boot.
pub fn default_route(task: TaskClass) -> (ProviderKind, &'static str) {
    match task {
        TaskClass::Chat => (ProviderKind::Anthropic, "claude-sonnet-4-20250514"),
        TaskClass::Tool => (ProviderKind::Openrouter, "openai/gpt-4o-mini"),
        TaskClass::Utility => (ProviderKind::Openrouter, "anthropic/claude-haiku-3-5"),
        TaskClass::Triage => (ProviderKind::Openrouter, "openai/gpt-4o-mini"),
        TaskClass::Classifier => (ProviderKind::Openrouter, "openai/gpt-4.1-nano"),
        TaskClass::Embedding => (ProviderKind::Ollama, "nomic-embed-text"),
        TaskClass::Voice => (ProviderKind::Openrouter, "openai/gpt-4o-mini"),
        TaskClass::Lightweight => (ProviderKind::Openrouter, "openai/gpt-4o-mini"),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub provider: String,
    pub model: String,
    pub task: TaskClass,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub conversation_id: Option<Uuid>,
    pub agent_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_active_predicate() {
        let now = Utc::now();
        let mut m = Memory {
            id: Uuid::new_v4(),
            area: MemoryArea::Identity,
            content: "x".into(),
            summary: None,
            tags: vec![],
            embedding: vec![],
            confidence: 0.5,
            access_count: 0,
            reinforcement_count: 0,
            source: MemorySource::User,
            conversation_id: None,
            channel_id: None,
            project_id: None,
            scope: None,
            visibility: MemoryVisibility::Shared,
            pinned: false,
            superseded_by: None,
            created_at: now,
            updated_at: now,
            last_accessed_at: None,
            expires_at: None,
        };
        assert!(m.is_active(now));
        m.superseded_by = Some(Uuid::new_v4());
        assert!(!m.is_active(now));
        m.superseded_by = None;
        m.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(!m.is_active(now));
        m.expires_at = None;
        m.confidence = 0.01;
        assert!(!m.is_active(now));
    }

    #[test]
    fn review_invariant_pending_vs_resolved() {
        let now = Utc::now();
        let mut r = ReviewItem {
            id: Uuid::new_v4(),
            agent_id: "a".into(),
            conversation_id: None,
            kind: ReviewType::Triage,
            title: "t".into(),
            description: None,
            content: serde_json::json!([]),
            proposed_action: serde_json::json!([]),
            alternatives: serde_json::json!([]),
            status: ReviewStatus::Pending,
            resolution: None,
            resolved_by: None,
            resolved_at: None,
            priority: 0,
            tags: vec![],
            batch_id: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(r.invariant_holds());
        r.status = ReviewStatus::Approved;
        assert!(!r.invariant_holds());
        r.resolved_at = Some(now);
        assert!(r.invariant_holds());
    }

    #[test]
    fn task_class_round_trips_through_display_and_fromstr() {
        for t in TaskClass::ALL {
            let s = t.to_string();
            assert_eq!(TaskClass::from_str(&s).unwrap(), t);
        }
    }

    #[test]
    fn default_routes_cover_every_task() {
        for t in TaskClass::ALL {
            let (_p, m) = default_route(t);
            assert!(!m.is_empty());
        }
    }
}
