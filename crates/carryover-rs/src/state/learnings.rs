//! Cross-session learning promotion.
//!
//! Session-scoped learnings die with the session reset after compaction.
//! Anything worth keeping longer is folded into an agent-scoped store that
//! survives resets: one JSON document per agent, capacity-bounded, evicted
//! by the entry least recently promoted. Promotion is idempotent per
//! checkpoint id: replaying the same checkpoint's learnings does not
//! inflate promotion counts.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::LearningEntry;
use crate::dedup;
use crate::persist::{read_json, write_json_atomic};

/// Default capacity of the agent-scoped store.
pub const DEFAULT_MAX_ENTRIES: usize = 50;

const STORE_VERSION: u32 = 1;

/// One promoted learning.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CrossSessionLearning {
    pub id: String,
    pub text: String,
    pub source_session: String,
    pub created_at: DateTime<Utc>,
    pub last_promoted_at: DateTime<Utc>,
    pub promotion_count: u32,
    pub last_checkpoint_id: String,
}

#[derive(Serialize, Deserialize)]
struct LearningDoc {
    version: u32,
    max_entries: usize,
    learnings: Vec<CrossSessionLearning>,
}

impl Default for LearningDoc {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            max_entries: DEFAULT_MAX_ENTRIES,
            learnings: Vec::new(),
        }
    }
}

/// Agent-scoped learning store backed by a single JSON document.
pub struct LearningStore {
    path: PathBuf,
    max_entries: usize,
}

impl LearningStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    /// Override the store capacity.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fold session learnings into the store. Returns the number of entries
    /// inserted or re-promoted. Best-effort: failures are logged and produce
    /// a zero count, never an error; promotion loss must not interrupt the
    /// turn that triggered it.
    pub fn promote(
        &self,
        learnings: &[LearningEntry],
        source_session: &str,
        checkpoint_id: &str,
    ) -> usize {
        let mut doc = match read_json::<LearningDoc>(&self.path) {
            Ok(Some(d)) => d,
            Ok(None) => LearningDoc::default(),
            Err(e) => {
                warn!("learning store unreadable, skipping promotion: {e}");
                return 0;
            }
        };

        let now = Utc::now();
        let mut touched = 0;

        for learning in learnings {
            let fp = dedup::fingerprint(&learning.text);
            match doc
                .learnings
                .iter_mut()
                .find(|l| dedup::fingerprint(&l.text) == fp)
            {
                Some(existing) => {
                    if existing.last_checkpoint_id == checkpoint_id {
                        continue;
                    }
                    existing.promotion_count += 1;
                    existing.last_promoted_at = now;
                    existing.last_checkpoint_id = checkpoint_id.to_string();
                    touched += 1;
                }
                None => {
                    let id = next_id(&doc.learnings);
                    doc.learnings.push(CrossSessionLearning {
                        id,
                        text: learning.text.clone(),
                        source_session: source_session.to_string(),
                        created_at: learning.when,
                        last_promoted_at: now,
                        promotion_count: 1,
                        last_checkpoint_id: checkpoint_id.to_string(),
                    });
                    touched += 1;
                }
            }
        }

        // Evict the least recently promoted entries beyond capacity.
        while doc.learnings.len() > self.max_entries {
            let oldest = doc
                .learnings
                .iter()
                .enumerate()
                .min_by_key(|(_, l)| l.last_promoted_at)
                .map(|(i, _)| i);
            match oldest {
                Some(i) => {
                    let evicted = doc.learnings.remove(i);
                    debug!("learning store over capacity, evicted {}", evicted.id);
                }
                None => break,
            }
        }

        doc.max_entries = self.max_entries;
        if let Err(e) = write_json_atomic(&self.path, &doc) {
            warn!("learning promotion not persisted: {e}");
            return 0;
        }
        touched
    }

    /// All promoted learnings, empty on any read failure.
    pub fn all(&self) -> Vec<CrossSessionLearning> {
        match read_json::<LearningDoc>(&self.path) {
            Ok(Some(d)) => d.learnings,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("learning store unreadable: {e}");
                Vec::new()
            }
        }
    }
}

fn next_id(existing: &[CrossSessionLearning]) -> String {
    let max = existing
        .iter()
        .filter_map(|l| l.id.strip_prefix("cl_"))
        .filter_map(|s| s.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("cl_{:03}", max + 1)
}
