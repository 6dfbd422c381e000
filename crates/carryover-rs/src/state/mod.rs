//! Per-session working-memory accumulation.
//!
//! While a session runs, the engine records what matters into a
//! category-partitioned [`StateStore`](store::StateStore): tools called,
//! files touched, decisions made, open items, learnings, the last tool call,
//! and a rolling thread snapshot. Every category is a small JSON document
//! under a session-scoped directory, written best-effort; losing one
//! observation must never abort a conversation turn.
//!
//! [`scoring`] ranks accumulated file accesses by recency-weighted activity;
//! [`learnings`] promotes session learnings into a durable agent-scoped
//! store that survives session resets.

pub mod learnings;
pub mod scoring;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::KeyExchange;

pub use learnings::{CrossSessionLearning, LearningStore};
pub use store::{CategoryCaps, StateSnapshot, StateStore};

// ── Category entry types ───────────────────────────────────────────

/// How a file was touched. Once a file is `Modified` it never downgrades
/// back to `Read`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Read,
    Modified,
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileKind::Read => write!(f, "read"),
            FileKind::Modified => write!(f, "modified"),
        }
    }
}

/// One file-access record. `path` is the unique key within a session.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileAccess {
    pub path: String,
    pub access_count: u32,
    pub last_accessed: DateTime<Utc>,
    pub kind: FileKind,
}

/// A recorded decision: free text plus when it was made.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DecisionEntry {
    pub what: String,
    pub when: DateTime<Utc>,
}

/// An unresolved item the agent should come back to.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OpenItemEntry {
    pub text: String,
    pub when: DateTime<Utc>,
}

/// A session-scoped learning, candidate for cross-session promotion.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LearningEntry {
    pub text: String,
    pub when: DateTime<Utc>,
}

/// Rolling snapshot of the conversation thread, overwritten continuously
/// from the full message history. Checkpoint construction at compaction time
/// may only see a partial message slice; the snapshot preserves an accurate
/// topic and summary from before the truncation point.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ThreadSnapshot {
    pub topic: String,
    pub summary: String,
    pub key_exchanges: Vec<KeyExchange>,
    pub updated_at: DateTime<Utc>,
}
