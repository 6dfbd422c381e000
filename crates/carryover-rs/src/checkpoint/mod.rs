//! Versioned session checkpoints: data model, builder, store, enrichment,
//! and injection rendering.
//!
//! A [`Checkpoint`] is an immutable snapshot of a session's working memory,
//! frozen either when token utilization crosses the auto threshold or when
//! the host compacts conversation history. The modules here split the
//! lifecycle:
//!
//! - [`builder`] — pure construction from accumulated state + messages.
//! - [`store`] — identity assignment, atomic persistence, the latest
//!   pointer, skip-on-insignificant-change, retention pruning.
//! - [`enrich`] — field-by-field merge of an optional LLM refinement.
//! - [`inject`] — rendering a checkpoint back into agent-consumable text.

pub mod builder;
pub mod enrich;
pub mod inject;
pub mod store;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::state::FileKind;

pub use builder::{BuildOptions, FileOpSummary, RuntimeFacts, build};
pub use enrich::{CheckpointRefinement, enrich_checkpoint};
pub use inject::{InjectionReason, RenderOptions, render_injection};
pub use store::{CheckpointStore, CheckpointStoreConfig, WriteOutcome};

/// Format tag carried by every persisted checkpoint document.
pub const CHECKPOINT_SCHEMA: &str = "context-checkpoint";

/// Current document version.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 2;

// ── Enums ──────────────────────────────────────────────────────────

/// What caused a checkpoint to be written.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointTrigger {
    /// Token utilization crossed the automatic threshold.
    #[serde(rename = "auto-80pct")]
    AutoThreshold,
    /// The host compacted conversation history.
    #[serde(rename = "compaction")]
    Compaction,
}

impl std::fmt::Display for CheckpointTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointTrigger::AutoThreshold => write!(f, "auto-80pct"),
            CheckpointTrigger::Compaction => write!(f, "compaction"),
        }
    }
}

/// Where the session's task stands.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    InProgress,
    Idle,
    WaitingForUser,
    Done,
    Aborted,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Idle => write!(f, "idle"),
            TaskStatus::WaitingForUser => write!(f, "waiting_for_user"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Who spoke in a key exchange.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeRole {
    User,
    Agent,
}

impl std::fmt::Display for ExchangeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeRole::User => write!(f, "user"),
            ExchangeRole::Agent => write!(f, "agent"),
        }
    }
}

// ── Structures ─────────────────────────────────────────────────────

/// Token consumption at checkpoint time.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub context_window: u64,
    pub utilization: f64,
}

/// Checkpoint identity and provenance.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CheckpointMeta {
    pub checkpoint_id: String,
    pub session_key: String,
    pub created_at: DateTime<Utc>,
    pub trigger: CheckpointTrigger,
    pub compaction_count: u32,
    pub token_usage: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_checkpoint: Option<String>,
    pub channel: String,
    pub agent_id: String,
    /// Set when an LLM refinement actually changed a field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enriched_by: Option<String>,
}

/// Name and parameter gist of the most recent tool call.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ToolCallSummary {
    pub name: String,
    pub params: String,
}

/// What the session was doing when the checkpoint was taken.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WorkingState {
    pub topic: String,
    pub status: TaskStatus,
    pub interrupted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tool_call: Option<ToolCallSummary>,
    pub next_action: String,
}

/// A recorded decision with its assigned id.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Decision {
    pub id: String,
    pub what: String,
    pub when: DateTime<Utc>,
}

/// One scored file in the checkpoint's resource set.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileResource {
    pub path: String,
    pub access_count: u32,
    pub kind: FileKind,
    pub score: f64,
}

/// Files and tools the session touched.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ResourceSet {
    pub files: Vec<FileResource>,
    pub tools_used: Vec<String>,
}

/// One side of a notable conversation exchange.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq, Eq)]
pub struct KeyExchange {
    pub role: ExchangeRole,
    pub gist: String,
}

/// Conversation-thread digest.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ThreadState {
    pub summary: String,
    pub key_exchanges: Vec<KeyExchange>,
}

/// Full checkpoint document. Immutable once written by the store.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Checkpoint {
    pub schema: String,
    pub schema_version: u32,
    pub meta: CheckpointMeta,
    pub working: WorkingState,
    pub decisions: Vec<Decision>,
    pub resources: ResourceSet,
    pub thread: ThreadState,
    pub open_items: Vec<String>,
    pub learnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_serializes_with_legacy_tag() {
        let json = serde_json::to_string(&CheckpointTrigger::AutoThreshold).unwrap();
        assert_eq!(json, "\"auto-80pct\"");
        let parsed: CheckpointTrigger = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, CheckpointTrigger::AutoThreshold);
    }

    #[test]
    fn status_snake_case_roundtrip() {
        let json = serde_json::to_string(&TaskStatus::WaitingForUser).unwrap();
        assert_eq!(json, "\"waiting_for_user\"");
        assert_eq!(TaskStatus::WaitingForUser.to_string(), "waiting_for_user");
    }

    #[test]
    fn exchange_role_display() {
        assert_eq!(ExchangeRole::User.to_string(), "user");
        assert_eq!(ExchangeRole::Agent.to_string(), "agent");
    }
}
