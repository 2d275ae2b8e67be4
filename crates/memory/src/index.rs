//! In-memory exact-match index over memory content and flat metadata.
//!
//! The tier store remains the **source of truth**.  This index is a derived
//! structure: it is rebuilt from the store at process start (never the
//! reverse) and incrementally maintained on every store, delete, and
//! migrate.  It is never persisted.
//!
//! | Map        | Key                    | Value                          |
//! |------------|------------------------|--------------------------------|
//! | `keywords` | lowercased token (>2)  | set of record ids              |
//! | `fields`   | field name → value     | set of record ids              |
//! | `postings` | record id              | everything indexed for the id  |
//!
//! All maps live behind a single `RwLock`: searches take a read lock (a
//! consistent snapshot — a partially indexed record is never observable)
//! while per-record updates take the write lock, swap the id's postings
//! out, and insert the new ones atomically.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use uuid::Uuid;

use crate::schema::{MemoryRecord, MemoryTier};

/// Tokenize content for exact keyword matching: lowercase, punctuation
/// stripped, tokens shorter than three characters dropped.
pub(crate) fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Everything indexed for one record, kept so unindexing is exact even if
/// the live record has since changed.
#[derive(Debug, Clone)]
struct Postings {
    keywords: Vec<String>,
    fields: Vec<(String, String)>,
    tier: MemoryTier,
}

#[derive(Debug, Default)]
struct IndexInner {
    keywords: HashMap<String, HashSet<Uuid>>,
    fields: HashMap<String, HashMap<String, HashSet<Uuid>>>,
    postings: HashMap<Uuid, Postings>,
}

impl IndexInner {
    fn unindex(&mut self, id: Uuid) -> bool {
        let Some(postings) = self.postings.remove(&id) else {
            return false;
        };
        for keyword in &postings.keywords {
            if let Some(set) = self.keywords.get_mut(keyword) {
                set.remove(&id);
                if set.is_empty() {
                    self.keywords.remove(keyword);
                }
            }
        }
        for (field, value) in &postings.fields {
            if let Some(values) = self.fields.get_mut(field) {
                if let Some(set) = values.get_mut(value) {
                    set.remove(&id);
                    if set.is_empty() {
                        values.remove(value);
                    }
                }
                if values.is_empty() {
                    self.fields.remove(field);
                }
            }
        }
        true
    }
}

/// The exact-match inverted index.
#[derive(Debug, Default)]
pub struct ExactIndex {
    inner: RwLock<IndexInner>,
}

impl ExactIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index (or re-index) a record.  Any previous postings for the same id
    /// are removed first, so a record is never findable under a keyword or
    /// field value it no longer has.
    pub fn insert(&self, record: &MemoryRecord) {
        let keywords: Vec<String> = tokenize(&record.content).into_iter().collect();
        let fields: Vec<(String, String)> = record
            .metadata
            .iter()
            .map(|(name, value)| (name.clone(), value.index_key()))
            .collect();

        let mut inner = self.inner.write().expect("exact index lock poisoned");
        inner.unindex(record.id);
        for keyword in &keywords {
            inner
                .keywords
                .entry(keyword.clone())
                .or_default()
                .insert(record.id);
        }
        for (field, value) in &fields {
            inner
                .fields
                .entry(field.clone())
                .or_default()
                .entry(value.clone())
                .or_default()
                .insert(record.id);
        }
        inner.postings.insert(
            record.id,
            Postings {
                keywords,
                fields,
                tier: record.tier,
            },
        );
    }

    /// Remove a record from every map.  Returns `false` if it was not
    /// indexed.
    pub fn remove(&self, id: Uuid) -> bool {
        self.inner
            .write()
            .expect("exact index lock poisoned")
            .unindex(id)
    }

    /// Update the tier annotation for an already-indexed record (used by the
    /// migration engine; keywords and fields are unchanged by a move).
    pub fn set_tier(&self, id: Uuid, tier: MemoryTier) {
        let mut inner = self.inner.write().expect("exact index lock poisoned");
        if let Some(postings) = inner.postings.get_mut(&id) {
            postings.tier = tier;
        }
    }

    /// Tier annotation for an indexed record.
    pub fn tier_of(&self, id: Uuid) -> Option<MemoryTier> {
        self.inner
            .read()
            .expect("exact index lock poisoned")
            .postings
            .get(&id)
            .map(|p| p.tier)
    }

    /// Keyword search: intersect the id sets of every query token.  An
    /// empty intersection (or a query with no usable tokens) yields an
    /// empty result, not an error.
    pub fn search_keywords(&self, query: &str) -> Vec<Uuid> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Vec::new();
        }

        let inner = self.inner.read().expect("exact index lock poisoned");
        let mut result: Option<HashSet<Uuid>> = None;
        for token in &tokens {
            let Some(ids) = inner.keywords.get(token) else {
                return Vec::new();
            };
            result = Some(match result {
                None => ids.clone(),
                Some(acc) => acc.intersection(ids).copied().collect(),
            });
            if result.as_ref().is_some_and(HashSet::is_empty) {
                return Vec::new();
            }
        }

        let mut ids: Vec<Uuid> = result.unwrap_or_default().into_iter().collect();
        ids.sort_unstable();
        ids
    }

    /// Field-equality search: a direct map lookup.
    pub fn search_field(&self, field: &str, value: &str) -> Vec<Uuid> {
        let inner = self.inner.read().expect("exact index lock poisoned");
        let mut ids: Vec<Uuid> = inner
            .fields
            .get(field)
            .and_then(|values| values.get(value))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Drop everything and index the given records.  Called at startup with
    /// the full contents of the tier store.
    pub fn rebuild(&self, records: &[MemoryRecord]) {
        {
            let mut inner = self.inner.write().expect("exact index lock poisoned");
            *inner = IndexInner::default();
        }
        for record in records {
            self.insert(record);
        }
        tracing::info!(records = records.len(), "exact index rebuilt from tier store");
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("exact index lock poisoned");
        *inner = IndexInner::default();
    }

    /// Number of indexed records.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("exact index lock poisoned")
            .postings
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{MemoryContext, MetadataValue};
    use chrono::Utc;
    use serde_json::json;

    fn record(content: &str, metadata: serde_json::Value) -> MemoryRecord {
        MemoryRecord {
            id: Uuid::new_v4(),
            content: content.to_string(),
            context: MemoryContext::General,
            importance: 0.8,
            tier: MemoryTier::Working,
            created_at: Utc::now(),
            last_accessed_at: Utc::now(),
            access_count: 0,
            metadata: crate::schema::sanitize_metadata(metadata),
            embedding: Vec::new(),
        }
    }

    #[test]
    fn tokenize_strips_punctuation_and_short_tokens() {
        let tokens = tokenize("fn calculateTotal(a, b) -> u64;");
        assert!(tokens.contains("calculatetotal"));
        assert!(tokens.contains("u64"));
        assert!(!tokens.contains("fn"), "two-char tokens are dropped");
        assert!(!tokens.contains("a"));
    }

    #[test]
    fn keyword_search_intersects_all_tokens() {
        let index = ExactIndex::new();
        let both = record("rust borrow checker rules", json!({}));
        let one = record("rust iterators", json!({}));
        index.insert(&both);
        index.insert(&one);

        assert_eq!(index.search_keywords("rust borrow"), vec![both.id]);
        let mut all = index.search_keywords("rust");
        all.sort_unstable();
        let mut expected = vec![both.id, one.id];
        expected.sort_unstable();
        assert_eq!(all, expected);
    }

    #[test]
    fn empty_intersection_is_empty_not_an_error() {
        let index = ExactIndex::new();
        index.insert(&record("alpha beta", json!({})));
        assert!(index.search_keywords("alpha gamma").is_empty());
        assert!(index.search_keywords("").is_empty());
        assert!(index.search_keywords("a b").is_empty());
    }

    #[test]
    fn field_search_is_a_direct_lookup() {
        let index = ExactIndex::new();
        let rec = record("some note", json!({"project": "engram", "line": 7}));
        index.insert(&rec);

        assert_eq!(index.search_field("project", "engram"), vec![rec.id]);
        assert_eq!(index.search_field("line", "7"), vec![rec.id]);
        assert!(index.search_field("project", "other").is_empty());
        assert!(index.search_field("missing", "x").is_empty());
    }

    #[test]
    fn remove_clears_every_reference() {
        let index = ExactIndex::new();
        let rec = record("ephemeral entry", json!({"kind": "temp"}));
        index.insert(&rec);
        assert!(index.remove(rec.id));

        assert!(index.search_keywords("ephemeral").is_empty());
        assert!(index.search_field("kind", "temp").is_empty());
        assert!(index.is_empty());
        assert!(!index.remove(rec.id), "second remove is a no-op");
    }

    #[test]
    fn reinsert_drops_stale_postings() {
        let index = ExactIndex::new();
        let mut rec = record("old keyword", json!({"state": "draft"}));
        index.insert(&rec);

        rec.content = "new keyword".to_string();
        rec.metadata = crate::schema::sanitize_metadata(json!({"state": "final"}));
        index.insert(&rec);

        assert!(index.search_keywords("old").is_empty());
        assert_eq!(index.search_keywords("new"), vec![rec.id]);
        assert!(index.search_field("state", "draft").is_empty());
        assert_eq!(index.search_field("state", "final"), vec![rec.id]);
    }

    #[test]
    fn tier_annotation_follows_migration() {
        let index = ExactIndex::new();
        let rec = record("migrating entry", json!({}));
        index.insert(&rec);
        assert_eq!(index.tier_of(rec.id), Some(MemoryTier::Working));

        index.set_tier(rec.id, MemoryTier::Session);
        assert_eq!(index.tier_of(rec.id), Some(MemoryTier::Session));
    }

    #[test]
    fn rebuild_replaces_previous_contents() {
        let index = ExactIndex::new();
        index.insert(&record("stale before rebuild", json!({})));

        let fresh = record("fresh after rebuild", json!({}));
        index.rebuild(std::slice::from_ref(&fresh));

        assert!(index.search_keywords("stale").is_empty());
        assert_eq!(index.search_keywords("fresh"), vec![fresh.id]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn metadata_values_index_canonically() {
        let index = ExactIndex::new();
        let rec = record("typed metadata", json!({"count": 3.0, "ok": true}));
        index.insert(&rec);
        assert_eq!(
            rec.metadata.get("count"),
            Some(&MetadataValue::Num(3.0))
        );
        assert_eq!(index.search_field("count", "3"), vec![rec.id]);
        assert_eq!(index.search_field("ok", "true"), vec![rec.id]);
    }
}
