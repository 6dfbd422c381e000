//! Context checkpoint & compaction engine for long-running LLM agent
//! sessions.
//!
//! A conversational agent's context window is finite; a useful session is
//! not. `carryover-rs` lets a session outlive its window: while the
//! conversation runs it accumulates a bounded model of what matters
//! (decisions, touched files, open items, learnings, recent exchanges),
//! freezes that model into versioned durable checkpoints, fits history into
//! a hard token budget when the host compacts, and renders the latest
//! checkpoint back into injectable text when a session resumes or loses its
//! history.
//!
//! The host stays in charge of *when*: it dispatches turns, decides when to
//! compact, and supplies message history, token gauges, and file-operation
//! summaries. This crate supplies the *how* as plain functions and
//! per-session stores: no hidden globals, no event registration.
//!
//! # Getting started
//!
//! ```ignore
//! use carryover_rs::prelude::*;
//!
//! let engine = Engine::new("/var/lib/agent/carryover");
//! let mut ctx = SessionContext::new("sess-42", "cli", "agent-a", 200_000);
//! let mut state = engine.open_state(&ctx);
//!
//! // Every turn: feed observations, let the engine checkpoint at the
//! // utilization threshold.
//! state.append_file("src/main.rs", FileKind::Modified);
//! let gauge = TokenGauge { input_tokens: 164_000, context_window: 200_000 };
//! engine.observe_turn(&mut ctx, &mut state, &messages, &gauge, &FileOpSummary::default())?;
//!
//! // On resume: inject the previous session's context.
//! if let Some(block) = engine.render_resume(&mut ctx) {
//!     messages.insert(0, Message::user(block));
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`state`] | Per-session accumulator, file-access scoring, cross-session learnings |
//! | [`checkpoint`] | Checkpoint model, builder, versioned store, enrichment, injection rendering |
//! | [`compaction`] | Token budgeting, staged summarization, deterministic fallback |
//! | [`collab`] | Summarization/enrichment collaborator trait, call bounds, default OpenRouter client |
//! | [`dedup`] | Three-tier semantic duplicate oracle gating accumulation |
//! | [`engine`] | Facade wiring the above into the turn/compaction/resume control flow |
//!
//! # Design principles
//!
//! 1. **Observations are disposable, checkpoints are not.** State appends
//!    are best-effort and never interrupt a turn; checkpoint writes are
//!    atomic and versioned.
//! 2. **Degrade, never fail.** Collaborator outages produce a deterministic
//!    fallback summary; corrupt pointers read as absence. Nothing in this
//!    crate is fatal to the host.
//! 3. **Budgets are enforced, content is advisory.** The engine guarantees
//!    structural invariants (token budgets, id sequences, dedup,
//!    atomicity) around whatever text the collaborator returns.

pub mod checkpoint;
pub mod collab;
pub mod compaction;
pub mod dedup;
pub mod engine;
mod persist;
pub mod prelude;
pub mod state;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::TaskStatus;
use crate::checkpoint::builder::RuntimeFacts;

// ── Messages ───────────────────────────────────────────────────────

/// Role of a conversation message.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A tool invocation recorded on an assistant message.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: String,
}

/// One conversation message as the host supplies it. Tool-only turns have
/// no content but carry their calls.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRecord>>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: Some(content.into()),
            tool_calls: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: Some(content.into()),
            tool_calls: None,
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Some(content.into()),
            tool_calls: None,
        }
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCallRecord>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: None,
            tool_calls: Some(calls),
        }
    }

    pub fn tool_result(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
        }
    }
}

// ── Token gauge ────────────────────────────────────────────────────

/// Snapshot of token consumption, supplied by the host each turn.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default)]
pub struct TokenGauge {
    pub input_tokens: u64,
    pub context_window: u64,
}

impl TokenGauge {
    /// Consumed fraction of the window. A zero-sized window reads as fully
    /// consumed rather than dividing by zero.
    pub fn utilization(&self) -> f64 {
        if self.context_window == 0 {
            1.0
        } else {
            self.input_tokens as f64 / self.context_window as f64
        }
    }

    /// Short log-friendly rendering.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: {} / {} tokens ({:.0}%)",
            self.input_tokens,
            self.context_window,
            self.utilization() * 100.0
        )
    }
}

// ── Session context ────────────────────────────────────────────────

/// Explicit per-session handle, owned by the caller and passed into every
/// engine call. Replaces hidden module-level session registries: teardown
/// and reuse are the caller dropping or keeping this value.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_key: String,
    pub channel: String,
    pub agent_id: String,
    pub context_window: u64,
    /// Compactions completed this session.
    pub compaction_count: u32,
    pub status: TaskStatus,
    pub interrupted: bool,
    /// Whether the resume injection already happened for this session.
    pub resume_injected: bool,
    pub started_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(
        session_key: impl Into<String>,
        channel: impl Into<String>,
        agent_id: impl Into<String>,
        context_window: u64,
    ) -> Self {
        Self {
            session_key: session_key.into(),
            channel: channel.into(),
            agent_id: agent_id.into(),
            context_window,
            compaction_count: 0,
            status: TaskStatus::InProgress,
            interrupted: false,
            resume_injected: false,
            started_at: Utc::now(),
        }
    }

    /// The builder-facing view of this context.
    pub fn runtime_facts(&self) -> RuntimeFacts {
        RuntimeFacts {
            session_key: self.session_key.clone(),
            channel: self.channel.clone(),
            agent_id: self.agent_id.clone(),
            compaction_count: self.compaction_count,
            status: self.status,
            interrupted: self.interrupted,
        }
    }
}
