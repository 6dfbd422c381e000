//! Compaction budgeting and staged summarization.
//!
//! The host decides *when* to compact; this module decides how to fit the
//! eligible history into the destination context window:
//!
//! 1. **Budget check** — estimate tokens for the summarizable history plus
//!    any split-turn prefix against `window × max_history_share ×
//!    safety_margin`. Over budget, the oldest fixed-size chunks of history
//!    are dropped until the remainder fits.
//! 2. **Recovery pass** — dropped messages are not silently lost: they are
//!    summarized separately and the result seeds the primary pass as its
//!    previous summary.
//! 3. **Staged primary pass** — the kept history is split into chunks sized
//!    by an adaptive ratio (bounded between a minimum and a base ratio) so
//!    each chunk plus per-call overhead fits the window; the collaborator
//!    is invoked chunk by chunk, carrying the running summary forward.
//! 4. **Split-turn prefix** — partial assistant output preceding the
//!    truncation point is summarized separately, with instructions to
//!    preserve the original request, and appended as a labeled section.
//!
//! Any primary-pass failure degrades to a deterministic fallback noting the
//! truncation, recent failed tool calls, and touched files; operational
//! continuity survives even with no generative summarizer at all.

use tracing::{debug, warn};

use crate::Message;
use crate::collab::{CallBounds, Collaborator, SummarizeRequest};

/// Conservative characters-per-token estimate for budget arithmetic.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Failed tool calls listed in the fallback summary, at most.
const FALLBACK_MAX_TOOL_CALLS: usize = 8;

/// Characters kept of each failed tool call in the fallback summary.
const FALLBACK_TOOL_CALL_CHARS: usize = 240;

const DROPPED_HISTORY_INSTRUCTIONS: &str = "These are the oldest messages of a conversation, \
about to be discarded entirely. Capture anything with lasting relevance: what the user \
originally asked for, decisions, and file paths.";

const TURN_PREFIX_INSTRUCTIONS: &str = "These messages are the beginning of a conversation \
turn that was cut off mid-response. Preserve the original request context so the response \
can be completed coherently.";

const TURN_PREFIX_LABEL: &str = "--- Current turn (before truncation) ---";

// ── Configuration ──────────────────────────────────────────────────

/// Budget arithmetic knobs.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Destination context window, in tokens.
    pub context_window: usize,
    /// Maximum fraction of the window history summaries may occupy.
    pub max_history_share: f64,
    /// Multiplicative margin (< 1) guarding against token-count
    /// underestimation.
    pub safety_margin: f64,
    /// Upper bound on the fraction of the kept history summarized per
    /// collaborator call.
    pub base_chunk_ratio: f64,
    /// Lower bound on that fraction; bounds the number of stages.
    pub min_chunk_ratio: f64,
    /// Tokens reserved per call for the system prompt, the running summary,
    /// and reasoning headroom.
    pub call_overhead_tokens: usize,
    /// Characters-per-token ratio for estimation.
    pub chars_per_token: f64,
    /// Messages per chunk when dropping oldest history.
    pub drop_chunk_messages: usize,
    /// Token budget for each summarization response.
    pub summary_max_tokens: u32,
}

impl CompactionConfig {
    /// Defaults for a given context window.
    pub fn for_window(context_window: usize) -> Self {
        Self {
            context_window,
            max_history_share: 0.5,
            safety_margin: 0.9,
            base_chunk_ratio: 0.5,
            min_chunk_ratio: 0.1,
            call_overhead_tokens: 2_000,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            drop_chunk_messages: 10,
            summary_max_tokens: 1_024,
        }
    }

    fn history_budget(&self) -> usize {
        (self.context_window as f64 * self.max_history_share * self.safety_margin) as usize
    }
}

/// Estimate tokens for a message slice from character counts.
pub fn estimate_tokens(messages: &[Message], chars_per_token: f64) -> usize {
    let total_chars: usize = messages
        .iter()
        .map(|m| {
            let content = m.content.as_ref().map_or(0, |c| c.len());
            let calls = m.tool_calls.as_ref().map_or(0, |calls| {
                calls.iter().map(|c| c.name.len() + c.arguments.len()).sum()
            });
            content + calls
        })
        .sum();
    (total_chars as f64 / chars_per_token) as usize
}

// ── Budget plan ────────────────────────────────────────────────────

/// Outcome of the budget check: what stays, what goes.
#[derive(Debug, Clone)]
pub struct BudgetPlan {
    pub kept: Vec<Message>,
    pub dropped: Vec<Message>,
    pub chunks_dropped: usize,
}

impl BudgetPlan {
    pub fn messages_dropped(&self) -> usize {
        self.dropped.len()
    }
}

/// Decide how much of the eligible history must be dropped so that the
/// remainder plus the turn prefix fits the history budget. Drops whole
/// chunks, oldest first.
pub fn plan_history_budget(
    messages: &[Message],
    turn_prefix: &[Message],
    config: &CompactionConfig,
) -> BudgetPlan {
    let budget = config.history_budget();
    let prefix_tokens = estimate_tokens(turn_prefix, config.chars_per_token);
    let chunk = config.drop_chunk_messages.max(1);

    let mut boundary = 0;
    let mut chunks_dropped = 0;
    while boundary < messages.len() {
        let kept_tokens = estimate_tokens(&messages[boundary..], config.chars_per_token);
        if kept_tokens + prefix_tokens <= budget {
            break;
        }
        boundary = (boundary + chunk).min(messages.len());
        chunks_dropped += 1;
    }

    if chunks_dropped > 0 {
        debug!(
            "history over budget: dropping {} chunk(s), {} message(s)",
            chunks_dropped, boundary
        );
    }

    BudgetPlan {
        kept: messages[boundary..].to_vec(),
        dropped: messages[..boundary].to_vec(),
        chunks_dropped,
    }
}

/// Fraction of the kept history each collaborator call may carry, derived
/// from actual sizes and clamped between the configured bounds.
fn adaptive_chunk_ratio(total_tokens: usize, config: &CompactionConfig) -> f64 {
    if total_tokens == 0 {
        return config.base_chunk_ratio;
    }
    let usable = config
        .context_window
        .saturating_sub(config.call_overhead_tokens + config.summary_max_tokens as usize);
    let fit = usable as f64 / total_tokens as f64;
    fit.clamp(config.min_chunk_ratio, config.base_chunk_ratio)
}

/// Split messages into ordered chunks targeting the adaptive ratio. Every
/// chunk holds at least one message.
fn split_chunks<'a>(messages: &'a [Message], config: &CompactionConfig) -> Vec<&'a [Message]> {
    if messages.is_empty() {
        return Vec::new();
    }
    let total = estimate_tokens(messages, config.chars_per_token);
    let ratio = adaptive_chunk_ratio(total, config);
    let target = ((total as f64 * ratio) as usize).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    let mut used = 0;
    for (i, msg) in messages.iter().enumerate() {
        let tokens = estimate_tokens(std::slice::from_ref(msg), config.chars_per_token);
        if used + tokens > target && i > start {
            chunks.push(&messages[start..i]);
            start = i;
            used = 0;
        }
        used += tokens;
    }
    chunks.push(&messages[start..]);
    chunks
}

// ── Fallback ───────────────────────────────────────────────────────

/// Operational context for the deterministic fallback summary.
#[derive(Debug, Clone, Default)]
pub struct FallbackNotes {
    pub failed_tool_calls: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
}

/// Fixed summary used when the collaborator is unavailable: the truncation
/// is named, recent failures and touched files are listed, nothing is
/// silently lost.
pub fn fallback_summary(notes: &FallbackNotes) -> String {
    let mut out = String::from(
        "[Conversation history was truncated to fit the context window; \
a generated summary was unavailable.]",
    );
    if !notes.failed_tool_calls.is_empty() {
        out.push_str("\nRecent failed tool calls:");
        for call in notes.failed_tool_calls.iter().take(FALLBACK_MAX_TOOL_CALLS) {
            let gist: String = call.chars().take(FALLBACK_TOOL_CALL_CHARS).collect();
            out.push_str(&format!("\n- {gist}"));
        }
    }
    if !notes.files_read.is_empty() {
        out.push_str(&format!("\nFiles read: {}", notes.files_read.join(", ")));
    }
    if !notes.files_modified.is_empty() {
        out.push_str(&format!(
            "\nFiles modified: {}",
            notes.files_modified.join(", ")
        ));
    }
    out
}

// ── Driver ─────────────────────────────────────────────────────────

/// Result of a compaction run. Always a usable summary, even degraded.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub summary: String,
    pub chunks_dropped: usize,
    pub messages_dropped: usize,
    /// Collaborator calls that succeeded in the primary pass.
    pub stages: usize,
    /// True when the fallback replaced generative summarization.
    pub degraded: bool,
}

/// Run the full compaction pipeline: budget check, dropped-history
/// recovery, staged primary summarization, split-turn prefix.
pub async fn run_compaction(
    collaborator: &dyn Collaborator,
    bounds: &CallBounds,
    messages: &[Message],
    turn_prefix: &[Message],
    notes: &FallbackNotes,
    config: &CompactionConfig,
) -> CompactionOutcome {
    let plan = plan_history_budget(messages, turn_prefix, config);
    let chunks_dropped = plan.chunks_dropped;
    let messages_dropped = plan.messages_dropped();

    // Recover dropped history into the seed summary.
    let mut running: Option<String> = None;
    if !plan.dropped.is_empty() {
        match summarize_once(
            collaborator,
            bounds,
            &plan.dropped,
            None,
            Some(DROPPED_HISTORY_INSTRUCTIONS),
            config,
        )
        .await
        {
            Ok(seed) => running = Some(seed),
            Err(e) => {
                warn!("dropped-history recovery failed: {e}");
                running = Some(format!(
                    "[{messages_dropped} earlier messages were dropped before summarization]"
                ));
            }
        }
    }

    // Primary staged pass.
    let mut stages = 0;
    for chunk in split_chunks(&plan.kept, config) {
        match summarize_once(collaborator, bounds, chunk, running.clone(), None, config).await {
            Ok(merged) => {
                running = Some(merged);
                stages += 1;
            }
            Err(e) => {
                warn!("summarization failed at stage {stages}, degrading to fallback: {e}");
                return CompactionOutcome {
                    summary: fallback_summary(notes),
                    chunks_dropped,
                    messages_dropped,
                    stages,
                    degraded: true,
                };
            }
        }
    }

    let mut summary = running.unwrap_or_default();

    // Summarize the split turn's prefix separately, preserving the original
    // request, and append it as a clearly labeled section.
    if !turn_prefix.is_empty() {
        let section = match summarize_once(
            collaborator,
            bounds,
            turn_prefix,
            None,
            Some(TURN_PREFIX_INSTRUCTIONS),
            config,
        )
        .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!("turn-prefix summarization failed: {e}");
                "[The current turn was cut off mid-response; its beginning could not be \
summarized.]"
                    .to_string()
            }
        };
        if !summary.is_empty() {
            summary.push_str("\n\n");
        }
        summary.push_str(TURN_PREFIX_LABEL);
        summary.push('\n');
        summary.push_str(&section);
    }

    CompactionOutcome {
        summary,
        chunks_dropped,
        messages_dropped,
        stages,
        degraded: false,
    }
}

async fn summarize_once(
    collaborator: &dyn Collaborator,
    bounds: &CallBounds,
    messages: &[Message],
    previous_summary: Option<String>,
    custom_instructions: Option<&str>,
    config: &CompactionConfig,
) -> Result<String, String> {
    let request = SummarizeRequest {
        messages,
        previous_summary,
        custom_instructions: custom_instructions.map(str::to_string),
        max_tokens: config.summary_max_tokens,
    };
    bounds.run(collaborator.summarize(request)).await
}
