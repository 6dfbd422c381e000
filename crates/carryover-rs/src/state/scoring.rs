//! Recency-weighted scoring of file-access records.
//!
//! `score = access_count × exp(-0.003 × age_minutes) × kind_bonus`. The
//! exponential decay gives a ~3.8-hour half-life; files the agent edited get
//! a 50% bonus over files it only read. Used both to pick the eviction
//! victim when the resource table is full and to order hot/cold files for
//! checkpoint rendering.

use chrono::{DateTime, Utc};

use super::{FileAccess, FileKind};

/// Exponential decay applied per minute since the last access.
pub const RECENCY_DECAY_PER_MINUTE: f64 = 0.003;

/// Multiplier applied to files the agent modified.
pub const MODIFIED_KIND_BONUS: f64 = 1.5;

/// Score a file-access record at time `now`. Clock skew (a record stamped in
/// the future) is treated as zero age, never a boost.
pub fn score(access: &FileAccess, now: DateTime<Utc>) -> f64 {
    let age_minutes = (now - access.last_accessed).num_seconds().max(0) as f64 / 60.0;
    let kind_bonus = match access.kind {
        FileKind::Modified => MODIFIED_KIND_BONUS,
        FileKind::Read => 1.0,
    };
    access.access_count as f64 * (-RECENCY_DECAY_PER_MINUTE * age_minutes).exp() * kind_bonus
}

/// Index of the lowest-scoring record, or `None` for an empty slice.
pub fn lowest_scoring(files: &[FileAccess], now: DateTime<Utc>) -> Option<usize> {
    files
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            score(a, now)
                .partial_cmp(&score(b, now))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
}
