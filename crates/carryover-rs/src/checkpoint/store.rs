//! Checkpoint identity, atomic persistence, and retention.
//!
//! Directory layout, one per session:
//!
//! ```text
//! checkpoints_dir/
//!   cp_001.json
//!   cp_002.json
//!   latest.json
//! ```
//!
//! The store owns identity: ids are `cp_NNN`, strictly increasing and
//! gapless, assigned at write time from the latest pointer. Writes whose
//! input-token count barely moved since the last checkpoint are skipped to
//! avoid flooding storage during slow token growth. Every write lands via
//! temp-file + rename; the pointer is rewritten with the same discipline
//! after the checkpoint file is durable.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Checkpoint;
use crate::persist::{read_json, write_json_atomic};

/// Store tuning. The skip-write delta is a tunable parameter, not a hard
/// constant.
#[derive(Debug, Clone)]
pub struct CheckpointStoreConfig {
    /// Checkpoints kept per session; older files are pruned after each
    /// successful write.
    pub keep: usize,
    /// Relative input-token delta below which a write is skipped.
    pub skip_write_delta: f64,
}

impl Default for CheckpointStoreConfig {
    fn default() -> Self {
        Self {
            keep: 5,
            skip_write_delta: 0.05,
        }
    }
}

/// Pointer record identifying the most recent checkpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct LatestPointer {
    checkpoint_id: String,
    path: String,
    input_tokens: u64,
}

/// Result of a write attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A new checkpoint file was persisted.
    Written { id: String, path: PathBuf },
    /// The write was skipped; the existing latest checkpoint still stands.
    Skipped { id: String, path: PathBuf },
}

impl WriteOutcome {
    /// The id of the checkpoint this outcome points at.
    pub fn id(&self) -> &str {
        match self {
            WriteOutcome::Written { id, .. } | WriteOutcome::Skipped { id, .. } => id,
        }
    }

    pub fn was_written(&self) -> bool {
        matches!(self, WriteOutcome::Written { .. })
    }
}

/// Per-session checkpoint store.
pub struct CheckpointStore {
    dir: PathBuf,
    config: CheckpointStoreConfig,
}

impl CheckpointStore {
    /// Open the store for a session checkpoint directory, creating it if
    /// missing.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, String> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| format!("failed to create {}: {e}", dir.display()))?;
        Ok(Self {
            dir,
            config: CheckpointStoreConfig::default(),
        })
    }

    pub fn with_config(mut self, config: CheckpointStoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a checkpoint, assigning its identity.
    ///
    /// When a latest pointer exists with a recorded token count and the new
    /// checkpoint's count moved by less than the configured delta, nothing
    /// is written and the outcome points at the existing file. Otherwise
    /// the checkpoint gets the next id, its `previous_checkpoint` link, and
    /// both the document and the pointer are replaced atomically. Retention
    /// pruning runs after each successful write.
    pub fn write(&self, checkpoint: &mut Checkpoint) -> Result<WriteOutcome, String> {
        let pointer = self.load_pointer();

        if let Some(p) = &pointer
            && p.input_tokens > 0
        {
            let new_tokens = checkpoint.meta.token_usage.input_tokens;
            let delta = (new_tokens.abs_diff(p.input_tokens)) as f64 / p.input_tokens as f64;
            if delta < self.config.skip_write_delta {
                debug!(
                    "checkpoint write skipped: input tokens moved {:.1}% (< {:.1}%)",
                    delta * 100.0,
                    self.config.skip_write_delta * 100.0
                );
                return Ok(WriteOutcome::Skipped {
                    id: p.checkpoint_id.clone(),
                    path: self.dir.join(&p.path),
                });
            }
        }

        let id = next_id(pointer.as_ref().map(|p| p.checkpoint_id.as_str()));
        checkpoint.meta.checkpoint_id = id.clone();
        checkpoint.meta.previous_checkpoint = pointer.map(|p| p.checkpoint_id);

        let filename = format!("{id}.json");
        let path = self.dir.join(&filename);
        write_json_atomic(&path, checkpoint)?;

        write_json_atomic(
            &self.dir.join("latest.json"),
            &LatestPointer {
                checkpoint_id: id.clone(),
                path: filename,
                input_tokens: checkpoint.meta.token_usage.input_tokens,
            },
        )?;

        // Retention is best-effort; a failed prune never fails the write.
        self.prune(self.config.keep);

        Ok(WriteOutcome::Written { id, path })
    }

    /// Load the checkpoint the latest pointer refers to.
    ///
    /// Absence on any failure: a missing or malformed pointer, a filename
    /// that doesn't match the `cp_NNN` pattern, a path that escapes the
    /// checkpoint directory, or an unparsable document all yield `None`.
    pub fn read_latest(&self) -> Option<Checkpoint> {
        let pointer = self.load_pointer()?;

        let referenced = self.dir.join(&pointer.path);
        let filename = referenced.file_name().and_then(|n| n.to_str())?;
        if !is_checkpoint_filename(filename) {
            warn!("latest pointer references invalid filename {filename:?}");
            return None;
        }

        // A corrupted pointer must not escape the checkpoint directory.
        let canonical_dir = self.dir.canonicalize().ok()?;
        let canonical = referenced.canonicalize().ok()?;
        if !canonical.starts_with(&canonical_dir) {
            warn!(
                "latest pointer escapes checkpoint directory: {}",
                canonical.display()
            );
            return None;
        }

        match read_json::<Checkpoint>(&canonical) {
            Ok(found) => found,
            Err(e) => {
                warn!("latest checkpoint unreadable: {e}");
                None
            }
        }
    }

    /// Delete the oldest checkpoint files beyond `keep`. Returns how many
    /// were removed. A missing directory is a no-op, and failures are
    /// logged rather than raised.
    pub fn prune(&self, keep: usize) -> usize {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return 0,
        };

        let mut files: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|name| is_checkpoint_filename(name))
            .collect();
        if files.len() <= keep {
            return 0;
        }

        // Zero-padded ids: lexicographic order is version order.
        files.sort_unstable();
        let excess = files.len() - keep;
        let mut removed = 0;
        for name in files.into_iter().take(excess) {
            match std::fs::remove_file(self.dir.join(&name)) {
                Ok(()) => {
                    debug!("pruned checkpoint {name}");
                    removed += 1;
                }
                Err(e) => warn!("failed to prune checkpoint {name}: {e}"),
            }
        }
        removed
    }

    fn load_pointer(&self) -> Option<LatestPointer> {
        match read_json::<LatestPointer>(&self.dir.join("latest.json")) {
            Ok(found) => found,
            Err(e) => {
                warn!("latest pointer unreadable, treating as absent: {e}");
                None
            }
        }
    }
}

/// Next id in the `cp_NNN` sequence. A missing or malformed predecessor
/// restarts the sequence at `cp_001`.
fn next_id(previous: Option<&str>) -> String {
    let n = previous
        .and_then(|id| id.strip_prefix("cp_"))
        .and_then(|suffix| suffix.parse::<u32>().ok())
        .unwrap_or(0);
    format!("cp_{:03}", n + 1)
}

/// `cp_` + exactly three ASCII digits + `.json`.
fn is_checkpoint_filename(name: &str) -> bool {
    name.strip_prefix("cp_")
        .and_then(|rest| rest.strip_suffix(".json"))
        .is_some_and(|digits| digits.len() == 3 && digits.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{
        CHECKPOINT_SCHEMA, CHECKPOINT_SCHEMA_VERSION, CheckpointMeta, CheckpointTrigger,
        ResourceSet, TaskStatus, ThreadState, TokenUsage, WorkingState,
    };
    use chrono::Utc;

    fn checkpoint(input_tokens: u64) -> Checkpoint {
        Checkpoint {
            schema: CHECKPOINT_SCHEMA.into(),
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            meta: CheckpointMeta {
                checkpoint_id: String::new(),
                session_key: "sess".into(),
                created_at: Utc::now(),
                trigger: CheckpointTrigger::AutoThreshold,
                compaction_count: 0,
                token_usage: TokenUsage {
                    input_tokens,
                    context_window: 200_000,
                    utilization: input_tokens as f64 / 200_000.0,
                },
                previous_checkpoint: None,
                channel: "cli".into(),
                agent_id: "agent".into(),
                enriched_by: None,
            },
            working: WorkingState {
                topic: "t".into(),
                status: TaskStatus::InProgress,
                interrupted: false,
                last_tool_call: None,
                next_action: String::new(),
            },
            decisions: vec![],
            resources: ResourceSet::default(),
            thread: ThreadState::default(),
            open_items: vec![],
            learnings: vec![],
        }
    }

    #[test]
    fn ids_are_sequential_and_linked() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("cps")).unwrap();

        let mut first = checkpoint(100_000);
        let mut second = checkpoint(120_000);
        let mut third = checkpoint(150_000);

        assert_eq!(store.write(&mut first).unwrap().id(), "cp_001");
        assert_eq!(store.write(&mut second).unwrap().id(), "cp_002");
        assert_eq!(store.write(&mut third).unwrap().id(), "cp_003");

        assert_eq!(first.meta.previous_checkpoint, None);
        assert_eq!(second.meta.previous_checkpoint.as_deref(), Some("cp_001"));
        assert_eq!(third.meta.previous_checkpoint.as_deref(), Some("cp_002"));
    }

    #[test]
    fn small_token_delta_skips_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("cps")).unwrap();

        let mut first = checkpoint(100_000);
        store.write(&mut first).unwrap();
        let original = std::fs::read_to_string(store.dir().join("cp_001.json")).unwrap();

        // 3% growth: below the 5% delta.
        let mut near = checkpoint(103_000);
        let outcome = store.write(&mut near).unwrap();
        assert!(!outcome.was_written());
        assert_eq!(outcome.id(), "cp_001");

        // The original file is untouched and no cp_002 appeared.
        assert_eq!(
            std::fs::read_to_string(store.dir().join("cp_001.json")).unwrap(),
            original
        );
        assert!(!store.dir().join("cp_002.json").exists());

        // 6% growth crosses the threshold.
        let mut grown = checkpoint(106_000);
        assert!(store.write(&mut grown).unwrap().was_written());
        assert_eq!(grown.meta.checkpoint_id, "cp_002");
    }

    #[test]
    fn read_latest_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("cps")).unwrap();
        let mut cp = checkpoint(100_000);
        store.write(&mut cp).unwrap();

        let loaded = store.read_latest().unwrap();
        assert_eq!(loaded.meta.checkpoint_id, "cp_001");
        assert_eq!(loaded.meta.session_key, "sess");
    }

    #[test]
    fn read_latest_absent_store_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("cps")).unwrap();
        assert!(store.read_latest().is_none());
    }

    #[test]
    fn malformed_pointer_is_absence_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("cps")).unwrap();
        std::fs::write(store.dir().join("latest.json"), "{broken").unwrap();
        assert!(store.read_latest().is_none());
    }

    #[test]
    fn traversal_pointer_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("cps")).unwrap();

        // A real file outside the checkpoint dir, referenced via traversal.
        std::fs::write(dir.path().join("cp_007.json"), "{}").unwrap();
        let pointer = LatestPointer {
            checkpoint_id: "cp_007".into(),
            path: "../cp_007.json".into(),
            input_tokens: 1,
        };
        write_json_atomic(&store.dir().join("latest.json"), &pointer).unwrap();

        assert!(store.read_latest().is_none());
    }

    #[test]
    fn invalid_filename_in_pointer_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("cps")).unwrap();
        let pointer = LatestPointer {
            checkpoint_id: "cp_001".into(),
            path: "notes.txt".into(),
            input_tokens: 1,
        };
        write_json_atomic(&store.dir().join("latest.json"), &pointer).unwrap();
        assert!(store.read_latest().is_none());
    }

    #[test]
    fn prune_deletes_exactly_the_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("cps"))
            .unwrap()
            .with_config(CheckpointStoreConfig {
                keep: 100, // disable auto-prune during setup
                skip_write_delta: 0.0,
            });

        let mut tokens = 100_000;
        for _ in 0..8 {
            let mut cp = checkpoint(tokens);
            store.write(&mut cp).unwrap();
            tokens += 20_000;
        }

        let removed = store.prune(5);
        assert_eq!(removed, 3);
        for old in ["cp_001.json", "cp_002.json", "cp_003.json"] {
            assert!(!store.dir().join(old).exists(), "{old} should be pruned");
        }
        for kept in ["cp_004.json", "cp_008.json"] {
            assert!(store.dir().join(kept).exists(), "{kept} should remain");
        }
        // The pointer document survives pruning and still resolves.
        assert_eq!(store.read_latest().unwrap().meta.checkpoint_id, "cp_008");
    }

    #[test]
    fn auto_prune_runs_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("cps"))
            .unwrap()
            .with_config(CheckpointStoreConfig {
                keep: 2,
                skip_write_delta: 0.0,
            });
        let mut tokens = 100_000;
        for _ in 0..4 {
            let mut cp = checkpoint(tokens);
            store.write(&mut cp).unwrap();
            tokens += 50_000;
        }
        assert!(!store.dir().join("cp_001.json").exists());
        assert!(!store.dir().join("cp_002.json").exists());
        assert!(store.dir().join("cp_003.json").exists());
        assert!(store.dir().join("cp_004.json").exists());
    }

    #[test]
    fn prune_on_missing_directory_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("cps")).unwrap();
        std::fs::remove_dir_all(store.dir()).unwrap();
        assert_eq!(store.prune(5), 0);
    }

    #[test]
    fn malformed_pointer_id_restarts_sequence() {
        assert_eq!(next_id(None), "cp_001");
        assert_eq!(next_id(Some("cp_041")), "cp_042");
        assert_eq!(next_id(Some("garbage")), "cp_001");
    }

    #[test]
    fn filename_pattern_is_strict() {
        assert!(is_checkpoint_filename("cp_001.json"));
        assert!(!is_checkpoint_filename("cp_1.json"));
        assert!(!is_checkpoint_filename("cp_0001.json"));
        assert!(!is_checkpoint_filename("cp_abc.json"));
        assert!(!is_checkpoint_filename("latest.json"));
    }
}
