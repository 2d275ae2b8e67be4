//! Retrieval surfaces: semantic, exact, hybrid, and compressed context.
//!
//! All three search paths share two rules: access metadata is touched
//! only for records actually returned (never for candidates scanned and
//! discarded), and a query that matches nothing returns an empty result,
//! not an error.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::compress::{compress, CompressedContext};
use crate::schema::{MemoryContext, MemoryRecord, MemoryTier, ScoredMemory};
use crate::scoring::{cosine_similarity, rank, score_hybrid, score_semantic};

use super::MemoryEngine;

/// Query words that pin a search to the hot tiers.
const RECENCY_TERMS: &[&str] = &[
    "recent", "recently", "today", "now", "latest", "current", "currently",
];

/// Query words that widen a search to cold storage first.
const HISTORICAL_TERMS: &[&str] = &[
    "remember", "before", "previously", "earlier", "past", "ago", "history", "originally",
];

/// Pick which tiers to search, and in what order, from the query's own
/// language.  Recency wording restricts to `working + session`; historical
/// wording searches everything coldest-first; anything else searches all
/// tiers hottest-first.
pub(super) fn tiers_for_query(query: &str) -> Vec<MemoryTier> {
    let lowered = query.to_lowercase();
    let words: HashSet<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    if RECENCY_TERMS.iter().any(|t| words.contains(t)) {
        vec![MemoryTier::Working, MemoryTier::Session]
    } else if HISTORICAL_TERMS.iter().any(|t| words.contains(t)) || lowered.contains("last time") {
        vec![MemoryTier::Longterm, MemoryTier::Session, MemoryTier::Working]
    } else {
        MemoryTier::ALL.to_vec()
    }
}

/// Options for [`MemoryEngine::compressed_context`].
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// How many memories to recall before packing.
    pub limit: usize,
    /// Restrict recall to one context kind.
    pub context: Option<MemoryContext>,
    /// Recall with hybrid search instead of pure semantic.
    pub hybrid: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            context: None,
            hybrid: false,
        }
    }
}

impl MemoryEngine {
    // ── Semantic ──────────────────────────────────────────────────────────────

    /// Embedding-similarity search across the tiers selected by the query's
    /// wording, ranked by the composite score.
    pub async fn recall_semantic(
        &self,
        query: &str,
        context: Option<MemoryContext>,
        limit: usize,
    ) -> Result<Vec<ScoredMemory>> {
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let tiers = tiers_for_query(query);
        let multi_tier = tiers.len() > 1;
        let embedding = self.embedder.embed(query).await?;
        let now = Utc::now();

        let mut results = Vec::new();
        for tier in &tiers {
            for (record, similarity) in self.store.query(*tier, &embedding, limit).await? {
                if context.is_some_and(|c| record.context != c) {
                    continue;
                }
                results.push(score_semantic(record, similarity, now, multi_tier));
            }
        }
        rank(&mut results);
        results.truncate(limit);
        self.touch_results(&mut results).await;
        debug!(query_tiers = ?tiers, returned = results.len(), "semantic recall");
        Ok(results)
    }

    // ── Exact ─────────────────────────────────────────────────────────────────

    /// Exact search: keyword intersection over content, or field equality
    /// when `field` is given (the query string is ignored for field
    /// lookups).  Results come back most-recently-accessed first.
    pub async fn search_exact(
        &self,
        query: &str,
        field: Option<(&str, &str)>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ids = match field {
            Some((name, value)) => self.index.search_field(name, value),
            None => self.index.search_keywords(query),
        };

        let from_mirror = self.route_read_to_mirror();
        let mut records = Vec::new();
        for id in ids {
            if let Some(record) = self.hydrate(id, from_mirror).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.last_accessed_at.cmp(&a.last_accessed_at));
        records.truncate(limit);

        for record in &mut records {
            match self.touch(record.id).await {
                Ok(Some(touched)) => {
                    record.access_count = touched.access_count;
                    record.last_accessed_at = touched.last_accessed_at;
                }
                Ok(None) => {}
                Err(err) => warn!(id = %record.id_short(), error = %err, "access touch failed"),
            }
        }
        Ok(records)
    }

    // ── Hybrid ────────────────────────────────────────────────────────────────

    /// Union of exact and semantic candidates, scored with the exact-match
    /// indicator blended in.  `exact_weight` defaults from configuration.
    pub async fn search_hybrid(
        &self,
        query: &str,
        context: Option<MemoryContext>,
        exact_weight: Option<f32>,
        limit: usize,
    ) -> Result<Vec<ScoredMemory>> {
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let exact_weight = exact_weight.unwrap_or(self.config.memory.default_exact_weight);
        let embedding = self.embedder.embed(query).await?;
        let now = Utc::now();

        let exact_ids: HashSet<Uuid> = self.index.search_keywords(query).into_iter().collect();

        let mut candidates: HashMap<Uuid, (MemoryRecord, f32)> = HashMap::new();
        for tier in MemoryTier::ALL {
            for (record, similarity) in self.store.query(tier, &embedding, limit).await? {
                candidates.entry(record.id).or_insert((record, similarity));
            }
        }
        // Exact hits the semantic pass missed still belong in the union.
        for id in &exact_ids {
            if !candidates.contains_key(id) {
                if let Some(record) = self.store.get(*id).await? {
                    let similarity = cosine_similarity(&record.embedding, &embedding);
                    candidates.insert(*id, (record, similarity));
                }
            }
        }

        let mut results: Vec<ScoredMemory> = candidates
            .into_values()
            .filter(|(record, _)| context.is_none_or(|c| record.context == c))
            .map(|(record, similarity)| {
                let exact = exact_ids.contains(&record.id);
                score_hybrid(record, similarity, exact, exact_weight, now)
            })
            .collect();
        rank(&mut results);
        results.truncate(limit);
        self.touch_results(&mut results).await;
        Ok(results)
    }

    // ── Compressed context ────────────────────────────────────────────────────

    /// Recall for `query` and pack the results into a prompt-ready string
    /// of at most `max_tokens` estimated tokens.
    pub async fn compressed_context(
        &self,
        query: &str,
        max_tokens: usize,
        options: ContextOptions,
    ) -> Result<CompressedContext> {
        let results = if options.hybrid {
            self.search_hybrid(query, options.context, None, options.limit)
                .await?
        } else {
            self.recall_semantic(query, options.context, options.limit)
                .await?
        };
        Ok(compress(query, &results, max_tokens))
    }

    // ── Shared plumbing ───────────────────────────────────────────────────────

    /// Bernoulli sample against the configured read ratio.  Only meaningful
    /// when hybrid storage is on.
    fn route_read_to_mirror(&self) -> bool {
        self.mirror.is_some()
            && self.config.storage.hybrid_enabled
            && self.config.storage.read_ratio > 0.0
            && rand::rng().random::<f64>() < self.config.storage.read_ratio
    }

    /// Fetch a record for an exact-search hit, from the mirror when the
    /// read was routed there, falling back to the authoritative store when
    /// the mirror is behind.
    async fn hydrate(&self, id: Uuid, from_mirror: bool) -> Result<Option<MemoryRecord>> {
        if from_mirror {
            if let Some(mirror) = &self.mirror {
                if let Some(record) = mirror.fetch(id).await? {
                    return Ok(Some(record));
                }
                debug!(%id, "mirror miss on routed read, falling back to tier store");
            }
        }
        self.store.get(id).await
    }

    /// Bump access metadata for one returned record, in the tier store and
    /// (best effort) the mirror.  The store increments under its own lock,
    /// so concurrent recalls returning the same record never lose a count
    /// and a record deleted mid-search is never written back.
    async fn touch(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        let Some(record) = self.store.increment_access(id, Utc::now()).await? else {
            return Ok(None);
        };
        if let Some(mirror) = &self.mirror {
            if let Err(err) = mirror
                .record_access(record.id, record.last_accessed_at, record.access_count)
                .await
            {
                warn!(id = %record.id_short(), error = %err, "mirror access update failed, queued for repair");
                self.repair.push(record.id);
            }
        }
        Ok(Some(record))
    }

    async fn touch_results(&self, results: &mut [ScoredMemory]) {
        for result in results {
            match self.touch(result.record.id).await {
                Ok(Some(touched)) => {
                    result.record.access_count = touched.access_count;
                    result.record.last_accessed_at = touched.last_accessed_at;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(id = %result.record.id_short(), error = %err, "access touch failed");
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
