//! Engine facade: the turn / compaction / resume control flow.
//!
//! The host drives; the engine reacts. Three entry points:
//!
//! - [`Engine::observe_turn`] — every turn: refresh the rolling thread
//!   snapshot and, when token utilization crosses the threshold, write an
//!   automatic checkpoint.
//! - [`Engine::checkpoint_for_compaction`] — when the host compacts: build
//!   a compaction checkpoint, optionally enrich it through the
//!   collaborator, write it, promote the session's learnings, and reset
//!   the session accumulator.
//! - [`Engine::render_resume`] / [`Engine::render_post_compaction`] — read
//!   the latest checkpoint back as an injection block.
//!
//! Directory layout, all under one root:
//!
//! ```text
//! root/
//!   sessions/<session_key>/state/...          (category documents)
//!   sessions/<session_key>/checkpoints/...    (cp_NNN.json + latest.json)
//!   agents/<agent_id>/learnings.json
//! ```

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::checkpoint::{
    self, BuildOptions, CheckpointStore, CheckpointStoreConfig, CheckpointTrigger, FileOpSummary,
    InjectionReason, RenderOptions, WriteOutcome, enrich_checkpoint, render_injection,
};
use crate::collab::{CallBounds, Collaborator};
use crate::dedup::DedupConfig;
use crate::state::{LearningStore, StateStore};
use crate::{Message, SessionContext, TokenGauge};

/// Messages handed to the enrichment collaborator alongside the checkpoint.
const ENRICH_RECENT_MESSAGES: usize = 12;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Utilization at which `observe_turn` writes an automatic checkpoint.
    pub checkpoint_threshold: f64,
    /// Checkpoint store retention and skip-write tuning.
    pub store: CheckpointStoreConfig,
    /// Injection rendering options.
    pub render: RenderOptions,
    /// Dedup thresholds used for enrichment merging.
    pub dedup: DedupConfig,
    /// Provenance tag stamped on enriched checkpoints.
    pub enrichment_tag: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_threshold: 0.8,
            store: CheckpointStoreConfig::default(),
            render: RenderOptions::default(),
            dedup: DedupConfig::default(),
            enrichment_tag: "llm".to_string(),
        }
    }
}

/// Facade over the per-session stores, rooted at one data directory.
pub struct Engine {
    root: PathBuf,
    config: EngineConfig,
}

impl Engine {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    // ── Paths ──────────────────────────────────────────────────────

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sessions_root(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn state_dir(&self, session_key: &str) -> PathBuf {
        self.sessions_root().join(session_key).join("state")
    }

    pub fn checkpoint_dir(&self, session_key: &str) -> PathBuf {
        self.sessions_root().join(session_key).join("checkpoints")
    }

    pub fn learnings_path(&self, agent_id: &str) -> PathBuf {
        self.root.join("agents").join(agent_id).join("learnings.json")
    }

    // ── Stores ─────────────────────────────────────────────────────

    /// Open the session's state accumulator.
    pub fn open_state(&self, ctx: &SessionContext) -> StateStore {
        StateStore::open(self.state_dir(&ctx.session_key))
    }

    /// Open the session's checkpoint store.
    pub fn checkpoint_store(&self, ctx: &SessionContext) -> Result<CheckpointStore, String> {
        Ok(CheckpointStore::new(self.checkpoint_dir(&ctx.session_key))?
            .with_config(self.config.store.clone()))
    }

    /// Open the agent-scoped learning store.
    pub fn learning_store(&self, ctx: &SessionContext) -> LearningStore {
        LearningStore::new(self.learnings_path(&ctx.agent_id))
    }

    // ── Turn flow ──────────────────────────────────────────────────

    /// Per-turn hook. Refreshes the rolling thread snapshot from the full
    /// history, and writes an automatic checkpoint when utilization crosses
    /// the threshold. Returns the write outcome when a checkpoint was
    /// attempted.
    pub fn observe_turn(
        &self,
        ctx: &SessionContext,
        state: &mut StateStore,
        messages: &[Message],
        gauge: &TokenGauge,
        file_ops: &FileOpSummary,
    ) -> Result<Option<WriteOutcome>, String> {
        if let Some(snapshot) = checkpoint::builder::derive_thread_snapshot(messages, Utc::now()) {
            state.set_thread_snapshot(snapshot);
        }

        if gauge.utilization() < self.config.checkpoint_threshold {
            return Ok(None);
        }
        debug!(
            "utilization {:.0}% crossed threshold, checkpointing",
            gauge.utilization() * 100.0
        );

        let mut cp = checkpoint::build(
            &state.snapshot(),
            gauge,
            messages,
            &ctx.runtime_facts(),
            CheckpointTrigger::AutoThreshold,
            &BuildOptions {
                file_ops: file_ops.clone(),
                now: None,
            },
        );
        let outcome = self.checkpoint_store(ctx)?.write(&mut cp)?;
        Ok(Some(outcome))
    }

    /// Compaction hook. Builds and writes a compaction checkpoint,
    /// enriching it first when a collaborator is supplied, then promotes
    /// the session's learnings and resets the accumulator. State is reset
    /// even when enrichment fails; it is only preserved if the write itself
    /// fails.
    pub async fn checkpoint_for_compaction(
        &self,
        ctx: &mut SessionContext,
        state: &mut StateStore,
        messages: &[Message],
        gauge: &TokenGauge,
        file_ops: &FileOpSummary,
        collaborator: Option<(&dyn Collaborator, &CallBounds)>,
    ) -> Result<WriteOutcome, String> {
        let snapshot = state.snapshot();
        let mut cp = checkpoint::build(
            &snapshot,
            gauge,
            messages,
            &ctx.runtime_facts(),
            CheckpointTrigger::Compaction,
            &BuildOptions {
                file_ops: file_ops.clone(),
                now: None,
            },
        );

        // Enrichment happens before the write: checkpoints are immutable
        // once persisted. Failure of any kind leaves the heuristic value.
        if let Some((collab, bounds)) = collaborator {
            match serde_json::to_string_pretty(&cp) {
                Ok(json) => {
                    let recent_from = messages.len().saturating_sub(ENRICH_RECENT_MESSAGES);
                    match bounds.run(collab.enrich(&json, &messages[recent_from..])).await {
                        Ok(Some(raw)) => {
                            enrich_checkpoint(
                                &mut cp,
                                &raw,
                                &self.config.enrichment_tag,
                                &self.config.dedup,
                            );
                        }
                        Ok(None) => debug!("collaborator returned no refinement"),
                        Err(e) => warn!("enrichment failed, keeping heuristic checkpoint: {e}"),
                    }
                }
                Err(e) => warn!("checkpoint not serializable for enrichment: {e}"),
            }
        }

        let outcome = self.checkpoint_store(ctx)?.write(&mut cp)?;

        // Fold working memory into durable artifacts, then restart empty.
        self.learning_store(ctx)
            .promote(&snapshot.learnings, &ctx.session_key, outcome.id());
        state.reset();
        ctx.compaction_count += 1;

        Ok(outcome)
    }

    // ── Injection ──────────────────────────────────────────────────

    /// Render the latest checkpoint for session resume. Injects at most
    /// once per session context; returns `None` when already injected or
    /// when no checkpoint exists.
    pub fn render_resume(&self, ctx: &mut SessionContext) -> Option<String> {
        if ctx.resume_injected {
            return None;
        }
        let cp = self.checkpoint_store(ctx).ok()?.read_latest()?;
        ctx.resume_injected = true;
        Some(render_injection(
            &cp,
            InjectionReason::SessionResume,
            &self.config.render,
        ))
    }

    /// Render the latest checkpoint right after a compaction.
    pub fn render_post_compaction(&self, ctx: &SessionContext) -> Option<String> {
        let cp = self.checkpoint_store(ctx).ok()?.read_latest()?;
        Some(render_injection(
            &cp,
            InjectionReason::PostCompaction,
            &self.config.render,
        ))
    }
}
