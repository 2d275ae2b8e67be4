//! Retrieval scoring.
//!
//! Every returned memory carries a composite score assembled from four
//! sub-scores, each in [0, 1]:
//!
//! | Sub-score    | Weight | Source                                       |
//! |--------------|--------|----------------------------------------------|
//! | `semantic`   | 0.4    | cosine similarity between embeddings         |
//! | `recency`    | 0.3    | exponential decay with a 24 h half-life-ish  |
//! | `importance` | 0.2    | the write-time importance score              |
//! | `frequency`  | 0.1    | log-scaled access count                      |
//!
//! Multi-tier searches additionally add a small constant bonus for hotter
//! tiers so that, all else equal, a working-tier memory outranks its
//! longterm twin.  Hybrid search replaces the semantic weight with a
//! blend of an exact-match indicator and the semantic score.

use chrono::{DateTime, Utc};

use crate::schema::{MemoryRecord, MemoryTier, ScoredMemory};
use crate::tiering::frequency_score;

pub const SEMANTIC_WEIGHT: f32 = 0.4;
pub const RECENCY_WEIGHT: f32 = 0.3;
pub const IMPORTANCE_WEIGHT: f32 = 0.2;
pub const FREQUENCY_WEIGHT: f32 = 0.1;

/// Hours after which recency has decayed to 1/e.
const RECENCY_DECAY_HOURS: f64 = 24.0;

const WORKING_TIER_BONUS: f32 = 0.10;
const SESSION_TIER_BONUS: f32 = 0.05;

/// Cosine similarity clamped to [0, 1].  Mismatched lengths and zero
/// vectors score 0 rather than erroring.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

/// Exponential recency decay anchored on creation time.
pub fn recency_score(age_hours: f64) -> f32 {
    (-age_hours.max(0.0) / RECENCY_DECAY_HOURS).exp() as f32
}

/// Constant boost for hotter tiers, applied only when the search spans
/// more than one tier (within a single tier it would shift every score
/// equally).
pub fn tier_bonus(tier: MemoryTier, multi_tier: bool) -> f32 {
    if !multi_tier {
        return 0.0;
    }
    match tier {
        MemoryTier::Working => WORKING_TIER_BONUS,
        MemoryTier::Session => SESSION_TIER_BONUS,
        MemoryTier::Longterm => 0.0,
    }
}

/// Score a semantic search hit.
pub fn score_semantic(
    record: MemoryRecord,
    semantic: f32,
    now: DateTime<Utc>,
    multi_tier: bool,
) -> ScoredMemory {
    let recency = recency_score(record.age_hours(now));
    let frequency = frequency_score(record.access_count);
    let importance = record.importance;
    let score = SEMANTIC_WEIGHT * semantic
        + RECENCY_WEIGHT * recency
        + IMPORTANCE_WEIGHT * importance
        + FREQUENCY_WEIGHT * frequency
        + tier_bonus(record.tier, multi_tier);
    ScoredMemory {
        record,
        score,
        semantic,
        recency,
        importance,
        frequency,
        exact_match: false,
    }
}

/// Score a hybrid search hit.  `exact_weight` (default 0.4) controls how
/// much a keyword hit is worth relative to semantic similarity: the
/// exact-match indicator takes `exact_weight` of the budget and the
/// semantic sub-score keeps the remainder of its usual share.
pub fn score_hybrid(
    record: MemoryRecord,
    semantic: f32,
    exact_match: bool,
    exact_weight: f32,
    now: DateTime<Utc>,
) -> ScoredMemory {
    let exact_weight = exact_weight.clamp(0.0, 1.0);
    let recency = recency_score(record.age_hours(now));
    let frequency = frequency_score(record.access_count);
    let importance = record.importance;
    let exact = if exact_match { 1.0 } else { 0.0 };
    let score = exact * exact_weight
        + semantic * (1.0 - exact_weight) * SEMANTIC_WEIGHT
        + RECENCY_WEIGHT * recency
        + IMPORTANCE_WEIGHT * importance
        + FREQUENCY_WEIGHT * frequency;
    ScoredMemory {
        record,
        score,
        semantic,
        recency,
        importance,
        frequency,
        exact_match,
    }
}

/// Sort scored results best-first with a stable tie-break on recency.
pub fn rank(results: &mut [ScoredMemory]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.record.last_accessed_at.cmp(&a.record.last_accessed_at))
    });
}
