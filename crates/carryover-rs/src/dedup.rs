//! Semantic duplicate detection for accumulated text entries.
//!
//! Decisions, open items, and learnings accumulate over a long session and
//! the same fact tends to arrive phrased three different ways. This module
//! is the admission oracle: given two free-text entries, decide whether they
//! express the same content. Three tiers, cheapest first:
//!
//! 1. **Normalized equality** — strip list markers and markdown glyphs,
//!    collapse whitespace, lowercase. Catches `- **Use X**` vs `use x`.
//! 2. **Keyword overlap** — Jaccard similarity over stemmed keywords.
//!    Only evaluated when the combined keyword set is large enough to mean
//!    anything.
//! 3. **Containment** — the shorter normalized string occurs inside the
//!    longer one at a word boundary on both sides. Word boundaries prevent
//!    "Decision 1" from matching inside "Decision 10".
//!
//! Pure functions, no state, deterministic for identical inputs.

use std::collections::HashSet;

/// Tunable thresholds for the keyword-overlap and containment tiers.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Jaccard similarity at or above which two keyword sets match.
    pub jaccard_threshold: f64,
    /// Relaxed threshold applied when both texts are long enough that less
    /// overlap still indicates the same content.
    pub relaxed_jaccard_threshold: f64,
    /// Minimum size of the smaller keyword set before the relaxed threshold
    /// applies.
    pub relaxed_min_keywords: usize,
    /// Minimum size of the keyword union before tier 2 is evaluated at all.
    pub min_keyword_union: usize,
    /// Minimum length (chars) of the shorter normalized string before the
    /// containment tier is evaluated.
    pub min_containment_len: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            jaccard_threshold: 0.5,
            relaxed_jaccard_threshold: 0.4,
            relaxed_min_keywords: 6,
            min_keyword_union: 3,
            min_containment_len: 10,
        }
    }
}

/// Stop words excluded from keyword extraction. English plus the Spanish
/// function words that show up in mixed-language sessions.
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "are", "was",
    "were", "will", "would", "should", "could", "have", "has", "had", "not",
    "but", "all", "can", "when", "then", "than", "its", "it's", "our", "your",
    "los", "las", "una", "uno", "del", "por", "para", "con", "que", "este",
    "esta", "como", "pero", "más", "sus", "ser",
];

// ── Normalization ──────────────────────────────────────────────────

/// Normalize a text entry for comparison: strip a single leading bullet or
/// number marker, remove markdown emphasis glyphs, collapse whitespace,
/// lowercase.
pub fn normalize(text: &str) -> String {
    let stripped = strip_leading_marker(text.trim());
    let without_glyphs: String = stripped
        .chars()
        .filter(|c| !matches!(c, '*' | '_' | '`'))
        .collect();
    without_glyphs
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Strip one leading bullet glyph or a `12.` / `3)` number marker.
fn strip_leading_marker(text: &str) -> &str {
    for prefix in ["- ", "* ", "+ ", "• "] {
        if let Some(rest) = text.strip_prefix(prefix) {
            return rest.trim_start();
        }
    }
    let digits = text.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &text[digits..];
        if let Some(r) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return r.trim_start();
        }
    }
    text
}

/// Cheap fingerprint for exact-match dedup (learnings): lowercase, strip one
/// leading bullet glyph, collapse whitespace. Deliberately weaker than
/// [`normalize`]: no glyph removal, no keyword analysis.
pub fn fingerprint(text: &str) -> String {
    let stripped = strip_leading_marker(text.trim());
    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ── Keyword extraction ─────────────────────────────────────────────

/// Extract the stemmed keyword set from a text entry.
///
/// Tokenizes the normalized text on non-alphanumeric boundaries, drops
/// tokens shorter than 3 characters and stop words, and applies light
/// suffix stemming ("ies" → "y"; trailing "es"/"s" stripped on tokens
/// longer than 4 characters).
pub fn extract_keywords(text: &str) -> HashSet<String> {
    keywords_of_normalized(&normalize(text))
}

fn keywords_of_normalized(normalized: &str) -> HashSet<String> {
    normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .filter(|t| !STOP_WORDS.contains(t))
        .map(stem)
        .collect()
}

fn stem(token: &str) -> String {
    if let Some(base) = token.strip_suffix("ies") {
        return format!("{base}y");
    }
    if token.chars().count() > 4 {
        if let Some(base) = token.strip_suffix("es") {
            return base.to_string();
        }
        if let Some(base) = token.strip_suffix('s') {
            return base.to_string();
        }
    }
    token.to_string()
}

// ── Duplicate oracle ───────────────────────────────────────────────

/// Judge whether two text entries express the same content, using the
/// default thresholds.
pub fn is_semantic_duplicate(a: &str, b: &str) -> bool {
    is_semantic_duplicate_with(a, b, &DedupConfig::default())
}

/// Judge whether two text entries express the same content. Tiers are
/// evaluated in order; first match wins. Tiers 1 and 2 are symmetric in
/// their arguments; tier 3 is containment of the shorter in the longer.
pub fn is_semantic_duplicate_with(a: &str, b: &str, config: &DedupConfig) -> bool {
    let na = normalize(a);
    let nb = normalize(b);

    // Tier 1: normalized equality.
    if na == nb {
        return true;
    }

    // Tier 2: keyword overlap. Skipped when the union is too small for the
    // ratio to be meaningful.
    let ka = keywords_of_normalized(&na);
    let kb = keywords_of_normalized(&nb);
    let union = ka.union(&kb).count();
    if union >= config.min_keyword_union {
        let intersection = ka.intersection(&kb).count();
        let jaccard = intersection as f64 / union as f64;
        let smaller = ka.len().min(kb.len());
        let threshold = if smaller >= config.relaxed_min_keywords {
            config.relaxed_jaccard_threshold
        } else {
            config.jaccard_threshold
        };
        if jaccard >= threshold {
            return true;
        }
    }

    // Tier 3: word-boundary containment of the shorter string.
    let (shorter, longer) = if na.len() <= nb.len() {
        (&na, &nb)
    } else {
        (&nb, &na)
    };
    shorter.chars().count() >= config.min_containment_len
        && contains_at_word_boundary(longer, shorter)
}

/// True when `needle` occurs in `haystack` with a non-alphanumeric character
/// (or string edge) on both sides of the match.
fn contains_at_word_boundary(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let mut search_from = 0;
    while let Some(found) = haystack[search_from..].find(needle) {
        let start = search_from + found;
        let end = start + needle.len();

        let boundary_before = start == 0
            || !haystack[..start]
                .chars()
                .next_back()
                .is_some_and(char::is_alphanumeric);
        let boundary_after = end == haystack.len()
            || !haystack[end..].chars().next().is_some_and(char::is_alphanumeric);

        if boundary_before && boundary_after {
            return true;
        }

        // Advance past the first character of this match.
        let step = haystack[start..].chars().next().map_or(1, char::len_utf8);
        search_from = start + step;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_bullet_bold_case() {
        assert_eq!(normalize("- **Use X**"), "use x");
        assert_eq!(normalize("  3. `cargo build`  first"), "cargo build first");
        assert_eq!(normalize("* _emphasis_   everywhere"), "emphasis everywhere");
    }

    #[test]
    fn normalize_strips_only_one_marker() {
        // The second "- " is content, not a marker.
        assert_eq!(normalize("- - nested"), "- nested");
    }

    #[test]
    fn tier1_marker_and_glyph_variants_match() {
        assert!(is_semantic_duplicate("- **Use X**", "use x"));
        assert!(is_semantic_duplicate("1. Fix the parser", "fix the parser"));
    }

    #[test]
    fn short_texts_with_tiny_keyword_union_do_not_match() {
        assert!(!is_semantic_duplicate("fix bug", "fix typo"));
    }

    #[test]
    fn containment_at_word_boundary_matches() {
        assert!(is_semantic_duplicate(
            "checkpoint re-write",
            "use atomicWrite for checkpoint re-write to bypass dedup"
        ));
    }

    #[test]
    fn containment_inside_a_word_does_not_match() {
        // "decision 1" is a prefix of "decision 10" but the boundary check
        // rejects the digit continuation.
        assert!(!is_semantic_duplicate("decision 1", "decision 10 was reverted later on"));
    }

    #[test]
    fn containment_requires_minimum_length() {
        // "plan b" (6 chars) is below the containment floor.
        assert!(!is_semantic_duplicate("plan b", "we went with plan b yesterday"));
    }

    #[test]
    fn keyword_overlap_matches_paraphrase() {
        assert!(is_semantic_duplicate(
            "migrate the session storage to sqlite database backend",
            "migrate session storage to a sqlite backend"
        ));
    }

    #[test]
    fn tier1_and_tier2_are_symmetric() {
        let pairs = [
            ("- **Use X**", "use x"),
            ("migrate storage to sqlite backend", "storage migration"),
            ("fix bug", "fix typo"),
        ];
        for (a, b) in pairs {
            assert_eq!(
                is_semantic_duplicate(a, b),
                is_semantic_duplicate(b, a),
                "asymmetric for ({a:?}, {b:?})"
            );
        }
    }

    #[test]
    fn stemming_folds_plural_forms() {
        let k = extract_keywords("retries caches sessions");
        assert!(k.contains("retry"));
        assert!(k.contains("cach"));
        assert!(k.contains("session"));
    }

    #[test]
    fn stop_words_and_short_tokens_dropped() {
        let k = extract_keywords("the fix for a db");
        assert!(!k.contains("the"));
        assert!(!k.contains("for"));
        assert!(!k.contains("db"));
        assert!(k.contains("fix"));
    }

    #[test]
    fn fingerprint_collapses_whitespace_and_bullets() {
        assert_eq!(fingerprint("-   Always   pin versions"), "always pin versions");
        assert_eq!(fingerprint("always pin versions"), "always pin versions");
        // Unlike normalize, glyphs survive.
        assert_ne!(fingerprint("**always pin versions**"), "always pin versions");
    }

    #[test]
    fn empty_inputs_are_equal_not_crashing() {
        assert!(is_semantic_duplicate("", ""));
        assert!(!is_semantic_duplicate("", "something"));
    }
}
