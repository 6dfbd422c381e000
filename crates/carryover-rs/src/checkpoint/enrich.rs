//! Field-by-field merge of an LLM-produced checkpoint refinement.
//!
//! The heuristic checkpoint is always valid on its own; enrichment is a
//! best-effort upgrade. A refinement is a partial structure (every field
//! independently optional) and only non-empty fields are applied. There is
//! no all-or-nothing gate: a refinement that only improves the topic still
//! lands. A refinement that parses to nothing, or fails schema validation,
//! leaves the heuristic checkpoint untouched.
//!
//! Model output is untrusted: the raw text is unfenced, parsed as JSON, and
//! validated against the schema derived from [`CheckpointRefinement`]
//! before any field is read.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Checkpoint, Decision, KeyExchange, TaskStatus};
use crate::dedup::{self, DedupConfig};

/// Partial refinement of a heuristic checkpoint. Every field is optional;
/// absent or empty fields leave the heuristic value in place.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Default)]
#[serde(default)]
pub struct CheckpointRefinement {
    pub topic: Option<String>,
    pub next_action: Option<String>,
    pub status: Option<TaskStatus>,
    pub decisions: Option<Vec<String>>,
    pub open_items: Option<Vec<String>>,
    pub thread_summary: Option<String>,
    pub key_exchanges: Option<Vec<KeyExchange>>,
}

/// Parse, validate, and apply a raw refinement onto a checkpoint. Marks the
/// checkpoint's provenance with `tag` only when a field actually changed.
/// Returns whether anything changed; all failures leave the checkpoint
/// untouched.
pub fn enrich_checkpoint(
    checkpoint: &mut Checkpoint,
    raw: &str,
    tag: &str,
    config: &DedupConfig,
) -> bool {
    let Some(refinement) = parse_refinement(raw) else {
        return false;
    };
    let changed = apply_refinement(checkpoint, &refinement, config);
    if changed {
        checkpoint.meta.enriched_by = Some(tag.to_string());
    } else {
        debug!("refinement applied no changes");
    }
    changed
}

/// Parse raw model output into a refinement, validating against the derived
/// JSON Schema first. `None` on any failure.
pub fn parse_refinement(raw: &str) -> Option<CheckpointRefinement> {
    let body = unfence(raw);
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            warn!("refinement is not valid JSON: {e}");
            return None;
        }
    };

    let schema = serde_json::to_value(schemars::schema_for!(CheckpointRefinement)).ok()?;
    if let Ok(validator) = jsonschema::validator_for(&schema)
        && !validator.is_valid(&value)
    {
        warn!("refinement failed schema validation");
        return None;
    }

    match serde_json::from_value(value) {
        Ok(refinement) => Some(refinement),
        Err(e) => {
            warn!("refinement shape mismatch: {e}");
            None
        }
    }
}

/// Apply the non-empty fields of a refinement. Returns whether any field
/// changed.
pub fn apply_refinement(
    checkpoint: &mut Checkpoint,
    refinement: &CheckpointRefinement,
    config: &DedupConfig,
) -> bool {
    let mut changed = false;

    if let Some(topic) = nonempty(&refinement.topic)
        && topic != checkpoint.working.topic
    {
        checkpoint.working.topic = topic.to_string();
        changed = true;
    }
    if let Some(next_action) = nonempty(&refinement.next_action)
        && next_action != checkpoint.working.next_action
    {
        checkpoint.working.next_action = next_action.to_string();
        changed = true;
    }
    if let Some(status) = refinement.status
        && status != checkpoint.working.status
    {
        checkpoint.working.status = status;
        changed = true;
    }
    if let Some(summary) = nonempty(&refinement.thread_summary)
        && summary != checkpoint.thread.summary
    {
        checkpoint.thread.summary = summary.to_string();
        changed = true;
    }
    if let Some(exchanges) = &refinement.key_exchanges
        && !exchanges.is_empty()
        && *exchanges != checkpoint.thread.key_exchanges
    {
        checkpoint.thread.key_exchanges = exchanges.clone();
        changed = true;
    }

    if let Some(refined) = &refinement.decisions
        && !refined.is_empty()
    {
        let heuristic: Vec<String> =
            checkpoint.decisions.iter().map(|d| d.what.clone()).collect();
        let merged = merge_refined(refined, &heuristic, config);
        if merged != heuristic {
            checkpoint.decisions =
                rebuild_decisions(&merged, &checkpoint.decisions, checkpoint.meta.created_at);
            changed = true;
        }
    }

    if let Some(refined) = &refinement.open_items
        && !refined.is_empty()
    {
        let merged = merge_refined(refined, &checkpoint.open_items, config);
        if merged != checkpoint.open_items {
            checkpoint.open_items = merged;
            changed = true;
        }
    }

    changed
}

/// Merge refined entries with heuristic ones. Refined entries are
/// authoritative and come first; heuristic entries survive only if not a
/// semantic duplicate of any refined entry. The concatenation is then
/// deduplicated internally, which also collapses near-duplicate refined
/// entries. Applying the same refinement twice is a fixed point.
fn merge_refined(refined: &[String], heuristic: &[String], config: &DedupConfig) -> Vec<String> {
    let mut combined: Vec<&String> = refined.iter().collect();
    combined.extend(heuristic.iter().filter(|h| {
        !refined
            .iter()
            .any(|r| dedup::is_semantic_duplicate_with(h, r, config))
    }));

    let mut deduped: Vec<String> = Vec::new();
    for entry in combined {
        if !deduped
            .iter()
            .any(|kept| dedup::is_semantic_duplicate_with(kept, entry, config))
        {
            deduped.push(entry.clone());
        }
    }
    deduped
}

/// Rebuild the decision list from merged texts, keeping the original
/// timestamp where the text survived verbatim and reassigning ids.
fn rebuild_decisions(
    merged: &[String],
    previous: &[Decision],
    fallback_when: DateTime<Utc>,
) -> Vec<Decision> {
    merged
        .iter()
        .enumerate()
        .map(|(i, what)| {
            let when = previous
                .iter()
                .find(|d| &d.what == what)
                .map(|d| d.when)
                .unwrap_or(fallback_when);
            Decision {
                id: format!("d_{:03}", i + 1),
                what: what.clone(),
                when,
            }
        })
        .collect()
}

fn nonempty(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Strip a surrounding markdown code fence, if any. Models often wrap JSON
/// despite instructions.
fn unfence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") up to the first newline.
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
    body.strip_suffix("```").unwrap_or(body).trim()
}
