//! Pure checkpoint construction.
//!
//! `build()` turns the accumulated session state, a token gauge, the
//! message history the host happens to have, and session runtime facts into
//! a full [`Checkpoint`] value. No I/O; identity (`checkpoint_id`,
//! `previous_checkpoint`) is assigned later by the store.
//!
//! The message slice at compaction time may be partial; the rolling thread
//! snapshot (when present) wins over re-derivation for topic and summary.
//! Injected artifacts (prior checkpoint blocks, token-gauge lines,
//! synthetic system text) are never mistaken for user intent.

use chrono::{DateTime, Utc};

use super::{
    CHECKPOINT_SCHEMA, CHECKPOINT_SCHEMA_VERSION, Checkpoint, CheckpointMeta, CheckpointTrigger,
    Decision, ExchangeRole, FileResource, KeyExchange, ResourceSet, TaskStatus, ThreadState,
    TokenUsage, WorkingState,
};
use crate::dedup;
use crate::state::{FileAccess, FileKind, StateSnapshot, scoring};
use crate::{Message, MessageRole, TokenGauge};

/// Maximum characters kept of an extracted topic.
const TOPIC_MAX_CHARS: usize = 200;

/// Maximum characters kept of a key-exchange gist or summary fragment.
const GIST_MAX_CHARS: usize = 120;

/// Maximum key-exchange entries in a checkpoint.
const MAX_KEY_EXCHANGES: usize = 8;

/// Assistant turns shorter than this never trigger decision capture.
const CAPTURE_MIN_ASSISTANT_CHARS: usize = 500;

/// User replies at or above this length never trigger decision capture.
const CAPTURE_MAX_REPLY_CHARS: usize = 50;

/// Replies below this length count as implicit confirmation (unless they
/// are questions) without needing a keyword match.
const CAPTURE_SHORT_REPLY_CHARS: usize = 15;

// ── Inputs ─────────────────────────────────────────────────────────

/// Session facts the host supplies at build time.
#[derive(Debug, Clone)]
pub struct RuntimeFacts {
    pub session_key: String,
    pub channel: String,
    pub agent_id: String,
    pub compaction_count: u32,
    pub status: TaskStatus,
    pub interrupted: bool,
}

/// File operations observed by the caller during the current turn, merged
/// into the accumulated resource table at build time.
#[derive(Debug, Clone, Default)]
pub struct FileOpSummary {
    pub read: Vec<String>,
    pub modified: Vec<String>,
}

/// Optional build inputs.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub file_ops: FileOpSummary,
    /// Override the build clock (tests); defaults to `Utc::now()`.
    pub now: Option<DateTime<Utc>>,
}

// ── Build ──────────────────────────────────────────────────────────

/// Construct a checkpoint from session state and message history.
pub fn build(
    state: &StateSnapshot,
    gauge: &TokenGauge,
    messages: &[Message],
    facts: &RuntimeFacts,
    trigger: CheckpointTrigger,
    options: &BuildOptions,
) -> Checkpoint {
    let now = options.now.unwrap_or_else(Utc::now);

    let topic = extract_topic(state, messages);
    let summary = synthesize_summary(state, messages);
    let key_exchanges = extract_key_exchanges(messages, state);

    // Explicitly recorded decisions first, then autonomous captures that
    // aren't duplicates of them.
    let mut decision_entries: Vec<(String, DateTime<Utc>)> = state
        .decisions
        .iter()
        .map(|d| (d.what.clone(), d.when))
        .collect();
    for captured in capture_decisions(messages) {
        if !decision_entries
            .iter()
            .any(|(what, _)| dedup::is_semantic_duplicate(what, &captured))
        {
            decision_entries.push((captured, now));
        }
    }
    let decisions = decision_entries
        .into_iter()
        .enumerate()
        .map(|(i, (what, when))| Decision {
            id: format!("d_{:03}", i + 1),
            what,
            when,
        })
        .collect();

    let files = merge_file_resources(&state.files, &options.file_ops, now);
    let next_action = state
        .open_items
        .last()
        .map(|o| o.text.clone())
        .unwrap_or_default();

    Checkpoint {
        schema: CHECKPOINT_SCHEMA.to_string(),
        schema_version: CHECKPOINT_SCHEMA_VERSION,
        meta: CheckpointMeta {
            // Identity is assigned by the store at write time.
            checkpoint_id: String::new(),
            session_key: facts.session_key.clone(),
            created_at: now,
            trigger,
            compaction_count: facts.compaction_count,
            token_usage: TokenUsage {
                input_tokens: gauge.input_tokens,
                context_window: gauge.context_window,
                utilization: gauge.utilization(),
            },
            previous_checkpoint: None,
            channel: facts.channel.clone(),
            agent_id: facts.agent_id.clone(),
            enriched_by: None,
        },
        working: WorkingState {
            topic,
            status: facts.status,
            interrupted: facts.interrupted,
            last_tool_call: state.last_tool_call.clone(),
            next_action,
        },
        decisions,
        resources: ResourceSet {
            files,
            tools_used: state.tools.clone(),
        },
        thread: ThreadState {
            summary,
            key_exchanges,
        },
        open_items: state.open_items.iter().map(|o| o.text.clone()).collect(),
        learnings: state.learnings.iter().map(|l| l.text.clone()).collect(),
    }
}

/// Derive a rolling thread snapshot from the full message history. The
/// engine refreshes this every turn so that a later build over a truncated
/// slice still sees an accurate topic and summary. `None` when the history
/// yields nothing worth snapshotting.
pub fn derive_thread_snapshot(
    messages: &[Message],
    now: DateTime<Utc>,
) -> Option<crate::state::ThreadSnapshot> {
    let empty = StateSnapshot::default();
    let topic = extract_topic(&empty, messages);
    let summary = synthesize_summary(&empty, messages);
    let key_exchanges = extract_key_exchanges(messages, &empty);
    if topic.is_empty() && summary.is_empty() && key_exchanges.is_empty() {
        return None;
    }
    Some(crate::state::ThreadSnapshot {
        topic,
        summary,
        key_exchanges,
        updated_at: now,
    })
}

// ── Genuine user messages ──────────────────────────────────────────

/// Prefixes that mark a user-role message as injected rather than typed.
const SYNTHETIC_PREFIXES: &[&str] = &[
    "System:",
    "[System Message]",
    "[Token usage:",
    super::inject::INJECTION_OPEN_TAG,
    super::inject::RESTORE_HEADER,
    super::inject::RESUME_HEADER_PREFIX,
    "[Conversation history was truncated",
];

/// True for user-role messages that carry actual user intent, not
/// reinjected checkpoint blocks, compaction boilerplate, or synthetic
/// system lines.
pub(crate) fn is_genuine_user_message(msg: &Message) -> bool {
    if msg.role != MessageRole::User {
        return false;
    }
    match msg.content.as_deref() {
        None => true,
        Some(text) => {
            let trimmed = text.trim_start();
            !text.contains(CHECKPOINT_SCHEMA)
                && !SYNTHETIC_PREFIXES.iter().any(|p| trimmed.starts_with(p))
        }
    }
}

fn genuine_user_texts<'a>(messages: &'a [Message]) -> Vec<&'a str> {
    messages
        .iter()
        .filter(|m| is_genuine_user_message(m))
        .filter_map(|m| m.content.as_deref())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect()
}

// ── Topic & summary ────────────────────────────────────────────────

fn extract_topic(state: &StateSnapshot, messages: &[Message]) -> String {
    if let Some(snapshot) = &state.thread_snapshot {
        let topic = snapshot.topic.trim();
        if !topic.is_empty() {
            return truncate_chars(topic, TOPIC_MAX_CHARS);
        }
    }
    genuine_user_texts(messages)
        .last()
        .map(|t| truncate_chars(t, TOPIC_MAX_CHARS))
        .unwrap_or_default()
}

fn synthesize_summary(state: &StateSnapshot, messages: &[Message]) -> String {
    if let Some(snapshot) = &state.thread_snapshot {
        let summary = snapshot.summary.trim();
        if !summary.is_empty() {
            return summary.to_string();
        }
    }
    let texts = genuine_user_texts(messages);
    match (texts.first(), texts.last()) {
        (Some(first), Some(last)) if first != last => format!(
            "Session started with: {}. Latest user focus: {}.",
            truncate_chars(first, GIST_MAX_CHARS),
            truncate_chars(last, GIST_MAX_CHARS)
        ),
        (Some(only), _) => format!("Session focus: {}.", truncate_chars(only, GIST_MAX_CHARS)),
        _ => String::new(),
    }
}

// ── Key exchanges ──────────────────────────────────────────────────

struct ExchangePair {
    user: usize,
    assistant: Option<usize>,
}

fn collect_pairs(messages: &[Message]) -> Vec<ExchangePair> {
    let mut pairs: Vec<ExchangePair> = Vec::new();
    for (idx, msg) in messages.iter().enumerate() {
        if is_genuine_user_message(msg) {
            pairs.push(ExchangePair {
                user: idx,
                assistant: None,
            });
        } else if msg.role == MessageRole::Assistant
            && let Some(last) = pairs.last_mut()
            && last.assistant.is_none()
        {
            last.assistant = Some(idx);
        }
    }
    pairs
}

/// Extract up to [`MAX_KEY_EXCHANGES`] role/gist entries preserving the
/// conversational arc: always the first pair and the last two pairs, with
/// up to three pairs sampled evenly from the middle. When the budget forces
/// a cut, middle samples go first.
fn extract_key_exchanges(messages: &[Message], state: &StateSnapshot) -> Vec<KeyExchange> {
    let pairs = collect_pairs(messages);
    if pairs.is_empty() {
        // Partial slice with no genuine user message left: fall back to the
        // rolling snapshot.
        return state
            .thread_snapshot
            .as_ref()
            .map(|s| s.key_exchanges.clone())
            .unwrap_or_default();
    }

    let mut selected: Vec<usize> = Vec::new();
    let mut middle_samples: Vec<usize> = Vec::new();

    if pairs.len() <= 3 {
        selected.extend(0..pairs.len());
    } else {
        selected.push(0);
        let middle_start = 1;
        let middle_end = pairs.len() - 2; // exclusive
        let middle_count = middle_end - middle_start;
        if middle_count > 0 {
            let step = middle_count.div_ceil(3);
            let mut i = middle_start;
            while i < middle_end && middle_samples.len() < 3 {
                middle_samples.push(i);
                i += step;
            }
        }
        selected.extend(middle_samples.iter().copied());
        selected.push(pairs.len() - 2);
        selected.push(pairs.len() - 1);
    }
    selected.sort_unstable();
    selected.dedup();

    // Trim middle samples first when over the entry budget.
    let entry_count = |sel: &[usize]| -> usize {
        sel.iter()
            .map(|&i| 1 + usize::from(pairs[i].assistant.is_some()))
            .sum()
    };
    while entry_count(&selected) > MAX_KEY_EXCHANGES {
        match middle_samples.pop() {
            Some(victim) => selected.retain(|&i| i != victim),
            None => break,
        }
    }

    let mut exchanges: Vec<KeyExchange> = Vec::new();
    for &i in &selected {
        let pair = &pairs[i];
        exchanges.push(KeyExchange {
            role: ExchangeRole::User,
            gist: gist_of(&messages[pair.user], ExchangeRole::User),
        });
        if let Some(a) = pair.assistant {
            exchanges.push(KeyExchange {
                role: ExchangeRole::Agent,
                gist: gist_of(&messages[a], ExchangeRole::Agent),
            });
        }
    }
    exchanges.truncate(MAX_KEY_EXCHANGES);
    exchanges
}

fn gist_of(msg: &Message, role: ExchangeRole) -> String {
    if let Some(text) = msg.content.as_deref() {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            return truncate_chars(trimmed, GIST_MAX_CHARS);
        }
    }
    if let Some(calls) = &msg.tool_calls
        && !calls.is_empty()
    {
        let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
        return format!("[called {}]", names.join(", "));
    }
    match role {
        ExchangeRole::User => "[user message without text]".to_string(),
        ExchangeRole::Agent => "[assistant message without text]".to_string(),
    }
}

// ── File resources ─────────────────────────────────────────────────

fn merge_file_resources(
    state_files: &[FileAccess],
    ops: &FileOpSummary,
    now: DateTime<Utc>,
) -> Vec<FileResource> {
    let mut merged: Vec<FileAccess> = state_files.to_vec();

    for path in &ops.read {
        if !merged.iter().any(|f| &f.path == path) {
            merged.push(FileAccess {
                path: path.clone(),
                access_count: 1,
                last_accessed: now,
                kind: FileKind::Read,
            });
        }
    }
    for path in &ops.modified {
        match merged.iter_mut().find(|f| &f.path == path) {
            Some(existing) => existing.kind = FileKind::Modified,
            None => merged.push(FileAccess {
                path: path.clone(),
                access_count: 1,
                last_accessed: now,
                kind: FileKind::Modified,
            }),
        }
    }

    let mut files: Vec<FileResource> = merged
        .iter()
        .map(|f| FileResource {
            path: f.path.clone(),
            access_count: f.access_count,
            kind: f.kind,
            score: scoring::score(f, now),
        })
        .collect();
    files.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    files
}

// ── Autonomous decision capture ────────────────────────────────────

/// Short replies in several languages that ratify a preceding proposal.
/// Fixed set; inherently approximate on some phrasing.
const CONFIRMATION_KEYWORDS: &[&str] = &[
    "ok", "okay", "yes", "yep", "yeah", "sure", "sounds good", "go ahead", "do it", "go for it",
    "lgtm", "ship it", "perfect", "agreed", "sí", "si", "vale", "claro", "dale", "oui",
    "d'accord", "ja", "genau", "da", "давай", "хорошо", "はい", "好", "好的", "可以",
];

const TIER1_MARKERS: &[&str] = &[
    "decision:", "plan:", "approach:", "going with", "chose ", "choosing ",
];

const INTENT_PREFIXES: &[&str] = &[
    "i'll ", "i will ", "we'll ", "we will ", "let's ", "let me ",
];

const INTENT_MARKERS: &[&str] = &[
    "the approach is", "the plan is", "the fix is", "the solution is",
];

const FILLER_OPENERS: &[&str] = &[
    "you're right", "you are right", "good question", "great question", "hmm", "ohoho", "haha",
    "lol", "thanks", "interesting",
];

const ACTION_VERBS: &[&str] = &[
    "use", "add", "create", "implement", "fix", "refactor", "move", "rename", "remove", "delete",
    "switch", "migrate", "update", "change", "replace", "adopt", "keep", "split", "merge",
    "write", "build", "drop", "extract", "introduce", "make", "set", "choose", "chose", "stick",
    "store", "cache", "persist", "validate", "wrap", "going",
];

/// True when a short user reply ratifies a substantial assistant proposal,
/// the only situation in which autonomous decision extraction runs.
pub(crate) fn should_capture_decision(assistant_text: &str, user_reply: &str) -> bool {
    if assistant_text.chars().count() <= CAPTURE_MIN_ASSISTANT_CHARS {
        return false;
    }
    let reply = user_reply.trim();
    let len = reply.chars().count();
    if len == 0 || len >= CAPTURE_MAX_REPLY_CHARS {
        return false;
    }
    if len < CAPTURE_SHORT_REPLY_CHARS && !reply.ends_with('?') {
        return true;
    }
    is_confirmation_reply(reply)
}

fn is_confirmation_reply(reply: &str) -> bool {
    let normalized = reply
        .trim()
        .trim_end_matches(['.', '!', ',', ' '])
        .to_lowercase();
    CONFIRMATION_KEYWORDS.iter().any(|k| normalized == *k)
}

fn capture_decisions(messages: &[Message]) -> Vec<String> {
    let mut captured: Vec<String> = Vec::new();
    let mut last_assistant_text: Option<&str> = None;

    for msg in messages {
        match msg.role {
            MessageRole::Assistant => {
                if let Some(text) = msg.content.as_deref() {
                    last_assistant_text = Some(text);
                }
            }
            MessageRole::User if is_genuine_user_message(msg) => {
                if let (Some(assistant), Some(reply)) =
                    (last_assistant_text.take(), msg.content.as_deref())
                    && should_capture_decision(assistant, reply)
                    && let Some(decision) = extract_decision(assistant)
                    && !captured
                        .iter()
                        .any(|c| dedup::is_semantic_duplicate(c, &decision))
                {
                    captured.push(decision);
                }
            }
            _ => {}
        }
    }
    captured
}

/// Classify assistant text for a decision statement. Tiers are tried in
/// order; within a tier the first line that also clears the quality gate
/// wins. Code-fenced regions are never scanned.
pub(crate) fn extract_decision(text: &str) -> Option<String> {
    let scannable = strip_code_fences(text);
    let lines: Vec<&str> = scannable
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let tiers: [&dyn Fn(&str) -> bool; 4] = [
        &is_tier1_line,
        &is_tier2_line,
        &is_tier3_line,
        &is_tier4_line,
    ];
    for tier in tiers {
        if let Some(line) = lines
            .iter()
            .find(|l| tier(l) && passes_quality_gate(l))
        {
            return Some(clean_decision_line(line));
        }
    }
    None
}

fn is_tier1_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    TIER1_MARKERS.iter().any(|m| lower.contains(m))
}

fn is_tier2_line(line: &str) -> bool {
    let lower = strip_list_marker(line).trim_start_matches('*').to_lowercase();
    INTENT_PREFIXES.iter().any(|p| lower.starts_with(p))
        || INTENT_MARKERS.iter().any(|m| lower.contains(m))
}

fn is_tier3_line(line: &str) -> bool {
    (starts_with_list_marker(line) || line.starts_with('#'))
        && line.contains("**")
        && contains_action_verb(line)
}

fn is_tier4_line(line: &str) -> bool {
    starts_with_list_marker(line) && action_verb_in_first_words(line, 5)
}

fn passes_quality_gate(line: &str) -> bool {
    let lower = strip_list_marker(line)
        .trim_start_matches('*')
        .trim()
        .to_lowercase();
    if FILLER_OPENERS.iter().any(|f| lower.starts_with(f)) {
        return false;
    }
    if line.trim_end().ends_with('?') {
        return false;
    }
    let structural = line.contains("**")
        || starts_with_list_marker(line)
        || line.contains(':');
    contains_action_verb(line) || structural
}

fn starts_with_list_marker(line: &str) -> bool {
    let t = line.trim_start();
    if t.starts_with("- ") || t.starts_with("* ") || t.starts_with("+ ") || t.starts_with("• ") {
        return true;
    }
    let digits = t.chars().take_while(|c| c.is_ascii_digit()).count();
    digits > 0
        && (t[digits..].starts_with(". ") || t[digits..].starts_with(") "))
}

fn strip_list_marker(line: &str) -> &str {
    let t = line.trim_start();
    for prefix in ["- ", "* ", "+ ", "• "] {
        if let Some(rest) = t.strip_prefix(prefix) {
            return rest.trim_start();
        }
    }
    let digits = t.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &t[digits..];
        if let Some(r) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return r.trim_start();
        }
    }
    t
}

fn tokens_lower(line: &str) -> Vec<String> {
    line.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn contains_action_verb(line: &str) -> bool {
    tokens_lower(line)
        .iter()
        .any(|t| ACTION_VERBS.contains(&t.as_str()))
}

fn action_verb_in_first_words(line: &str, n: usize) -> bool {
    tokens_lower(strip_list_marker(line))
        .iter()
        .take(n)
        .any(|t| ACTION_VERBS.contains(&t.as_str()))
}

fn clean_decision_line(line: &str) -> String {
    let stripped = strip_list_marker(line).replace("**", "");
    truncate_chars(stripped.trim(), TOPIC_MAX_CHARS)
}

fn strip_code_fences(text: &str) -> String {
    let mut out = String::new();
    let mut in_fence = false;
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if !in_fence {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
