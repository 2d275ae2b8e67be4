//! Token-budget context compression.
//!
//! Retrieval results are packed into a single prompt-ready string that
//! fits a caller-supplied token budget.  Tokens are estimated, not
//! counted: one token per four characters, rounded up, which tracks
//! common BPE vocabularies closely enough for budgeting.
//!
//! Packing walks results best-first.  A result that fits whole is
//! emitted whole; the first one that does not fit is truncated to the
//! remaining budget, keeping a window centered on the first query-token
//! match (head and tail when the query matches nowhere); everything
//! after that is dropped.  Lowest-ranked results are always the ones to
//! go.

use crate::index::tokenize;
use crate::schema::ScoredMemory;

/// Marker emitted when there is nothing to compress.
pub const EMPTY_CONTEXT_MARKER: &str = "[no relevant memories]";

/// Marker spliced in where a truncated entry's middle was removed.
const ELLIPSIS_MARKER: &str = " [...] ";

/// Smallest entry worth truncating into; below this the entry is dropped
/// instead of reduced to a marker and a few characters.
const MIN_TRUNCATED_TOKENS: usize = 16;

/// Estimated token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// The packed context plus accounting for observability.
#[derive(Debug, Clone)]
pub struct CompressedContext {
    pub text: String,
    /// Estimated tokens of `text`.
    pub token_estimate: usize,
    /// Results included, whole or truncated.
    pub included: usize,
    /// Results dropped for lack of budget.
    pub omitted: usize,
    /// Whether any included entry was truncated.
    pub truncated: bool,
    /// Output tokens over input tokens, at most 1.0.
    pub compression_ratio: f32,
}

fn entry_header(rank: usize, memory: &ScoredMemory) -> String {
    format!(
        "[{rank}] {tier}/{context} score={score:.2}\n",
        tier = memory.record.tier.slug(),
        context = memory.record.context.slug(),
        score = memory.score,
    )
}

/// Char index of the middle of the earliest query-token occurrence in
/// `content`, case-insensitive.
fn query_match_center(content: &str, query: &str) -> Option<usize> {
    let lowered = content.to_lowercase();
    let mut earliest: Option<(usize, usize)> = None;
    for token in tokenize(query) {
        if let Some(pos) = lowered.find(&token) {
            if earliest.is_none_or(|(best, _)| pos < best) {
                earliest = Some((pos, token.len()));
            }
        }
    }
    let (pos, len) = earliest?;
    Some(lowered[..pos].chars().count() + len / 2)
}

/// Reduce `content` to at most `token_budget` tokens.  The kept window is
/// centered on the first query match so the part the caller asked about
/// survives; with no match the head and tail are kept instead.  Elided
/// sides are marked.
fn truncate_to_budget(content: &str, token_budget: usize, query: &str) -> String {
    let char_budget = token_budget.saturating_mul(4);
    let chars: Vec<char> = content.chars().collect();
    if chars.len() <= char_budget {
        return content.to_string();
    }

    if let Some(center) = query_match_center(content, query) {
        let keep = char_budget.saturating_sub(2 * ELLIPSIS_MARKER.len());
        let start = center
            .saturating_sub(keep / 2)
            .min(chars.len().saturating_sub(keep));
        let end = (start + keep).min(chars.len());
        let mut out = String::with_capacity(char_budget);
        if start > 0 {
            out.push_str(ELLIPSIS_MARKER);
        }
        out.extend(&chars[start..end]);
        if end < chars.len() {
            out.push_str(ELLIPSIS_MARKER);
        }
        return out;
    }

    let keep = char_budget.saturating_sub(ELLIPSIS_MARKER.len());
    let head = keep * 3 / 5;
    let tail = keep - head;
    let mut out = String::with_capacity(char_budget);
    out.extend(&chars[..head]);
    out.push_str(ELLIPSIS_MARKER);
    out.extend(&chars[chars.len() - tail..]);
    out
}

/// Pack ranked results into at most `token_budget` estimated tokens.
/// `query` anchors truncation of an oversized entry on its match.
pub fn compress(query: &str, results: &[ScoredMemory], token_budget: usize) -> CompressedContext {
    if results.is_empty() {
        return CompressedContext {
            text: EMPTY_CONTEXT_MARKER.to_string(),
            token_estimate: estimate_tokens(EMPTY_CONTEXT_MARKER),
            included: 0,
            omitted: 0,
            truncated: false,
            compression_ratio: 1.0,
        };
    }

    let input_tokens: usize = results
        .iter()
        .map(|m| estimate_tokens(&m.record.content))
        .sum();

    let mut text = String::new();
    let mut included = 0usize;
    let mut truncated = false;

    for (rank, memory) in results.iter().enumerate() {
        let header = entry_header(rank + 1, memory);
        let separator = if text.is_empty() { "" } else { "\n\n" };
        let overhead = estimate_tokens(separator) + estimate_tokens(&header);
        let used = estimate_tokens(&text);
        let remaining = token_budget.saturating_sub(used + overhead);

        let content_tokens = estimate_tokens(&memory.record.content);
        if content_tokens <= remaining {
            text.push_str(separator);
            text.push_str(&header);
            text.push_str(&memory.record.content);
            included += 1;
        } else if remaining >= MIN_TRUNCATED_TOKENS {
            text.push_str(separator);
            text.push_str(&header);
            text.push_str(&truncate_to_budget(&memory.record.content, remaining, query));
            included += 1;
            truncated = true;
            break;
        } else {
            break;
        }
    }

    if included == 0 {
        // Budget too small for even a truncated first entry.
        return CompressedContext {
            text: EMPTY_CONTEXT_MARKER.to_string(),
            token_estimate: estimate_tokens(EMPTY_CONTEXT_MARKER),
            included: 0,
            omitted: results.len(),
            truncated: false,
            compression_ratio: 1.0,
        };
    }

    let token_estimate = estimate_tokens(&text);
    let ratio = if input_tokens == 0 {
        1.0
    } else {
        (token_estimate as f32 / input_tokens as f32).min(1.0)
    };

    CompressedContext {
        text,
        token_estimate,
        included,
        omitted: results.len() - included,
        truncated,
        compression_ratio: ratio,
    }
}
