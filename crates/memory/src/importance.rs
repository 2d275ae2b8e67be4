//! Write-time importance assessment.
//!
//! Importance is computed once, at store time, and never recomputed on
//! read.  The score is a weighted combination of three signals:
//!
//! ```text
//! importance = context_weight + marker_bonus (≤ 0.15) + length_bonus
//! ```
//!
//! Records below the configured admission threshold are never persisted —
//! rejection is a normal outcome, not an error.

use crate::schema::MemoryContext;

/// Phrases that signal the caller wants this remembered.  Each match adds
/// [`MARKER_BONUS`], capped at [`MARKER_BONUS_MAX`].
const IMPORTANCE_MARKERS: &[&str] = &[
    "remember",
    "important",
    "critical",
    "always",
    "never",
    "must",
    "preference",
    "decision",
];

const MARKER_BONUS: f32 = 0.05;
const MARKER_BONUS_MAX: f32 = 0.15;

/// Content longer than this many characters earns a small bonus — longer
/// writes tend to be deliberate.
const LENGTH_BONUS_THRESHOLD: usize = 200;
const LENGTH_BONUS: f32 = 0.05;

/// Base importance weight per context.
pub fn context_weight(context: MemoryContext) -> f32 {
    match context {
        MemoryContext::General => 0.50,
        MemoryContext::Note => 0.55,
        MemoryContext::CodeSnippet => 0.55,
        MemoryContext::CodeSymbol => 0.60,
        MemoryContext::CodePattern => 0.65,
        MemoryContext::CodeError => 0.70,
        MemoryContext::UserPreference => 0.75,
        MemoryContext::CodeDecision => 0.75,
        MemoryContext::TaskCritical => 0.85,
    }
}

/// Compute the importance score for a piece of content in [0, 1].
pub fn assess(content: &str, context: MemoryContext) -> f32 {
    let lowered = content.to_lowercase();

    let marker_hits = IMPORTANCE_MARKERS
        .iter()
        .filter(|marker| lowered.contains(*marker))
        .count() as f32;
    let marker_bonus = (marker_hits * MARKER_BONUS).min(MARKER_BONUS_MAX);

    let length_bonus = if content.chars().count() > LENGTH_BONUS_THRESHOLD {
        LENGTH_BONUS
    } else {
        0.0
    };

    (context_weight(context) + marker_bonus + length_bonus).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_general_content_scores_at_base_weight() {
        let score = assess("saw a bird outside", MemoryContext::General);
        assert_eq!(score, 0.50);
    }

    #[test]
    fn task_critical_with_markers_clears_point_nine() {
        let score = assess(
            "remember this, it is important for the deploy",
            MemoryContext::TaskCritical,
        );
        assert!(score >= 0.9, "got {score}");
    }

    #[test]
    fn marker_bonus_is_capped() {
        // Five markers, but the bonus tops out at 0.15.
        let score = assess(
            "remember: always important, never optional, must do",
            MemoryContext::General,
        );
        assert!((score - 0.65).abs() < 1e-6, "got {score}");
    }

    #[test]
    fn long_content_earns_length_bonus() {
        let long = "x".repeat(300);
        let short = "x".repeat(100);
        assert!(
            assess(&long, MemoryContext::Note) > assess(&short, MemoryContext::Note)
        );
    }

    #[test]
    fn markers_match_case_insensitively() {
        assert!(
            assess("IMPORTANT!", MemoryContext::General)
                > assess("whatever", MemoryContext::General)
        );
    }

    #[test]
    fn score_never_exceeds_one() {
        let loaded = format!(
            "remember always important critical must {}",
            "y".repeat(500)
        );
        assert!(assess(&loaded, MemoryContext::TaskCritical) <= 1.0);
    }
}
