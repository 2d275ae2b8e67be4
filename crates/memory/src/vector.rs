//! Tiered vector store.
//!
//! The vector store is the **source of truth** for memory contents: every
//! record lives in exactly one tier collection, and both the exact index
//! and the relational mirror are derived from it.  The trait is the seam
//! for swapping the bundled in-memory store for an external vector
//! database without touching the engine.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::schema::{MemoryRecord, MemoryTier};
use crate::scoring::cosine_similarity;

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace a record in the given tier.  A record already
    /// present in a *different* tier is moved, not duplicated.
    async fn upsert(&self, tier: MemoryTier, record: MemoryRecord) -> Result<()>;

    /// Nearest-neighbour query within one tier: records paired with their
    /// cosine similarity to `embedding`, best first, at most `limit`.
    async fn query(
        &self,
        tier: MemoryTier,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<(MemoryRecord, f32)>>;

    /// Fetch a record by id, whichever tier holds it.
    async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>>;

    /// Atomically bump `access_count` and set `last_accessed_at` on a
    /// record, returning the updated copy.  `Ok(None)` when the id is not
    /// present.  Must be a single read-modify-write inside the store so
    /// concurrent bumps never lose an increment.
    async fn increment_access(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<MemoryRecord>>;

    /// Remove a record from a tier.  Returns `false` if it was not there.
    async fn delete(&self, tier: MemoryTier, id: Uuid) -> Result<bool>;

    /// All records in one tier, in no particular order.
    async fn list(&self, tier: MemoryTier) -> Result<Vec<MemoryRecord>>;

    /// Number of records in one tier.
    async fn count(&self, tier: MemoryTier) -> Result<usize>;

    /// Look up a record by its content hash, across all tiers.
    async fn find_by_content_hash(&self, hash: &str) -> Result<Option<MemoryRecord>>;

    /// Drop every record in every tier.
    async fn clear(&self) -> Result<()>;
}

// ── In-memory implementation ──────────────────────────────────────────────────

/// The bundled store: per-tier hash maps with brute-force cosine scans.
/// Queries are O(tier size), which is the intended trade-off for an
/// embedded engine.
#[derive(Default)]
pub struct InMemoryVectorStore {
    tiers: RwLock<HashMap<MemoryTier, HashMap<Uuid, MemoryRecord>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, tier: MemoryTier, mut record: MemoryRecord) -> Result<()> {
        record.tier = tier;
        let mut tiers = self.tiers.write().expect("vector store lock poisoned");
        for other in MemoryTier::ALL {
            if other != tier {
                if let Some(map) = tiers.get_mut(&other) {
                    map.remove(&record.id);
                }
            }
        }
        tiers.entry(tier).or_default().insert(record.id, record);
        Ok(())
    }

    async fn query(
        &self,
        tier: MemoryTier,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<(MemoryRecord, f32)>> {
        let tiers = self.tiers.read().expect("vector store lock poisoned");
        let mut scored: Vec<(MemoryRecord, f32)> = tiers
            .get(&tier)
            .map(|map| {
                map.values()
                    .map(|r| (r.clone(), cosine_similarity(&r.embedding, embedding)))
                    .collect()
            })
            .unwrap_or_default();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        let tiers = self.tiers.read().expect("vector store lock poisoned");
        for tier in MemoryTier::ALL {
            if let Some(record) = tiers.get(&tier).and_then(|m| m.get(&id)) {
                return Ok(Some(record.clone()));
            }
        }
        Ok(None)
    }

    async fn increment_access(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<MemoryRecord>> {
        let mut tiers = self.tiers.write().expect("vector store lock poisoned");
        for tier in MemoryTier::ALL {
            if let Some(record) = tiers.get_mut(&tier).and_then(|m| m.get_mut(&id)) {
                record.access_count += 1;
                record.last_accessed_at = at;
                return Ok(Some(record.clone()));
            }
        }
        Ok(None)
    }

    async fn delete(&self, tier: MemoryTier, id: Uuid) -> Result<bool> {
        let mut tiers = self.tiers.write().expect("vector store lock poisoned");
        Ok(tiers
            .get_mut(&tier)
            .and_then(|map| map.remove(&id))
            .is_some())
    }

    async fn list(&self, tier: MemoryTier) -> Result<Vec<MemoryRecord>> {
        let tiers = self.tiers.read().expect("vector store lock poisoned");
        Ok(tiers
            .get(&tier)
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn count(&self, tier: MemoryTier) -> Result<usize> {
        let tiers = self.tiers.read().expect("vector store lock poisoned");
        Ok(tiers.get(&tier).map_or(0, HashMap::len))
    }

    async fn find_by_content_hash(&self, hash: &str) -> Result<Option<MemoryRecord>> {
        let tiers = self.tiers.read().expect("vector store lock poisoned");
        for tier in MemoryTier::ALL {
            if let Some(map) = tiers.get(&tier) {
                if let Some(record) = map.values().find(|r| r.content_hash() == hash) {
                    return Ok(Some(record.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn clear(&self) -> Result<()> {
        self.tiers.write().expect("vector store lock poisoned").clear();
        Ok(())
    }
}
