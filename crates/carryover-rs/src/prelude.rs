//! Convenience re-exports for embedding the engine in a host.
//!
//! ```ignore
//! use carryover_rs::prelude::*;
//! ```
//!
//! This pulls in the types most hosts need: the [`Engine`] facade with its
//! per-session stores, the message and gauge inputs, and the collaborator
//! contract. Specialized knobs (dedup thresholds, store configs, compaction
//! internals) are intentionally excluded; import those from their modules
//! directly.

// ── Core inputs ─────────────────────────────────────────────────────
pub use crate::{Message, MessageRole, SessionContext, TokenGauge, ToolCallRecord};

// ── Engine & stores ─────────────────────────────────────────────────
pub use crate::engine::{Engine, EngineConfig};
pub use crate::state::{CategoryCaps, FileKind, LearningStore, StateStore};

// ── Checkpoints ─────────────────────────────────────────────────────
pub use crate::checkpoint::{
    Checkpoint, CheckpointStore, CheckpointTrigger, FileOpSummary, InjectionReason, RenderOptions,
    TaskStatus, WriteOutcome, render_injection,
};

// ── Compaction & collaborator ───────────────────────────────────────
pub use crate::collab::{CallBounds, Collaborator, OpenRouterCollaborator, SummarizeRequest};
pub use crate::compaction::{CompactionConfig, CompactionOutcome, FallbackNotes, run_compaction};
