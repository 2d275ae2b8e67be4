//! The memory engine facade.
//!
//! `MemoryEngine` wires the collaborators together: embedding provider,
//! tiered vector store, optional relational mirror, exact index, and the
//! migration runner.  Every public method takes `&self` and is safe to
//! call concurrently.
//!
//! The write path is strictly ordered: admission gate, deduplication,
//! embedding, vector store, relational mirror, exact index.  The vector
//! store write is the commit point — a mirror failure after it is logged
//! and queued for repair, never rolled back.

mod recall;

pub use recall::ContextOptions;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use engram_config::EngramConfig;
use engram_embedding::{provider_from_config, EmbeddingProvider};

use crate::importance;
use crate::index::ExactIndex;
use crate::migration::{
    spawn_scheduler, MigrationReport, MigrationRunner, MigrationStatus, RepairQueue,
};
use crate::relational::{RelationalMirror, SqliteMirror};
use crate::schema::{content_hash, MemoryContext, MemoryRecord, MemoryTier, sanitize_metadata};
use crate::tiering::TierPolicy;
use crate::vector::{InMemoryVectorStore, VectorStore};

// ── Outcomes & stats ──────────────────────────────────────────────────────────

/// What happened to a single store request.
///
/// `stored == false` with an id means the content already existed (the id
/// is the existing record's); without an id it was rejected at the
/// admission gate.  Neither is an error.
#[derive(Debug, Clone, Serialize)]
pub struct StoreOutcome {
    pub stored: bool,
    pub id: Option<Uuid>,
    pub importance: f32,
    pub tier: Option<MemoryTier>,
}

/// One input to [`MemoryEngine::store_batch`].
#[derive(Debug, Clone)]
pub struct StoreItem {
    pub content: String,
    pub context: MemoryContext,
    pub metadata: serde_json::Value,
}

/// Per-item batch result: exactly one of `outcome` / `error` is set.
#[derive(Debug, Clone, Serialize)]
pub struct BatchStoreOutcome {
    pub outcome: Option<StoreOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TierStats {
    pub count: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub tiers: BTreeMap<MemoryTier, TierStats>,
    pub total: usize,
    pub indexed: usize,
    pub repair_backlog: usize,
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct MemoryEngine {
    config: EngramConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    mirror: Option<Arc<dyn RelationalMirror>>,
    index: Arc<ExactIndex>,
    repair: Arc<RepairQueue>,
    migration: Arc<MigrationRunner>,
    policy: TierPolicy,
}

impl MemoryEngine {
    pub fn new(
        config: EngramConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        mirror: Option<Arc<dyn RelationalMirror>>,
    ) -> Self {
        let index = Arc::new(ExactIndex::new());
        let repair = Arc::new(RepairQueue::default());
        let policy = TierPolicy::from_config(&config.memory);
        let migration = Arc::new(MigrationRunner::new(
            Arc::clone(&store),
            mirror.clone(),
            Arc::clone(&index),
            Arc::clone(&repair),
            policy,
            config.memory.migration_move_retries,
        ));
        Self {
            config,
            embedder,
            store,
            mirror,
            index,
            repair,
            migration,
            policy,
        }
    }

    /// Assemble an engine from configuration: the bundled in-memory vector
    /// store, the configured embedding provider, and (when hybrid storage
    /// is enabled) a SQLite mirror.
    pub fn from_config(config: EngramConfig) -> Result<Self> {
        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::from(provider_from_config(&config.embedding)?);
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let mirror: Option<Arc<dyn RelationalMirror>> = if config.storage.hybrid_enabled {
            let mirror = if config.storage.sqlite_path.is_empty() {
                SqliteMirror::open_in_memory()?
            } else {
                SqliteMirror::open(&config.storage.sqlite_path)?
            };
            Some(Arc::new(mirror))
        } else {
            None
        };
        Ok(Self::new(config, embedder, store, mirror))
    }

    pub fn config(&self) -> &EngramConfig {
        &self.config
    }

    // ── Store path ────────────────────────────────────────────────────────────

    /// Store one piece of content.  Below-threshold importance and
    /// duplicate content both come back as `stored: false` outcomes.
    pub async fn store(
        &self,
        content: &str,
        context: MemoryContext,
        metadata: serde_json::Value,
    ) -> Result<StoreOutcome> {
        let content = content.trim();
        if content.is_empty() {
            bail!("cannot store empty content");
        }

        let importance = importance::assess(content, context);
        if importance < self.config.memory.importance_threshold {
            debug!(
                importance,
                threshold = self.config.memory.importance_threshold,
                "memory rejected at admission gate"
            );
            return Ok(StoreOutcome {
                stored: false,
                id: None,
                importance,
                tier: None,
            });
        }

        let hash = content_hash(content);
        if let Some(existing) = self.store.find_by_content_hash(&hash).await? {
            debug!(id = %existing.id_short(), "duplicate content, reusing existing record");
            return Ok(StoreOutcome {
                stored: false,
                id: Some(existing.id),
                importance: existing.importance,
                tier: Some(existing.tier),
            });
        }

        let embedding = self.embedder.embed(content).await.context("embedding content")?;
        let now = Utc::now();
        let tier = self.policy.target_tier(0.0, 0);
        let record = MemoryRecord {
            id: Uuid::new_v4(),
            content: content.to_string(),
            context,
            importance,
            tier,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            metadata: sanitize_metadata(metadata),
            embedding,
        };

        self.store
            .upsert(tier, record.clone())
            .await
            .context("writing to tier store")?;
        self.mirror_write(&record).await;
        self.index.insert(&record);
        self.enforce_capacity(tier).await?;

        info!(
            id = %record.id_short(),
            tier = tier.slug(),
            context = context.slug(),
            importance,
            "memory stored"
        );
        Ok(StoreOutcome {
            stored: true,
            id: Some(record.id),
            importance,
            tier: Some(tier),
        })
    }

    /// Store many items in chunks, pausing between chunks so a large
    /// import never saturates the backing stores.  One outcome per input,
    /// in order; a failed item never aborts the rest.
    pub async fn store_batch(&self, items: Vec<StoreItem>) -> Vec<BatchStoreOutcome> {
        let chunk_size = self.config.memory.batch_size.max(1);
        let delay = Duration::from_millis(self.config.memory.batch_delay_ms);
        let mut outcomes = Vec::with_capacity(items.len());

        for (idx, item) in items.into_iter().enumerate() {
            if idx > 0 && idx % chunk_size == 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match self.store(&item.content, item.context, item.metadata).await {
                Ok(outcome) => outcomes.push(BatchStoreOutcome {
                    outcome: Some(outcome),
                    error: None,
                }),
                Err(err) => outcomes.push(BatchStoreOutcome {
                    outcome: None,
                    error: Some(format!("{err:#}")),
                }),
            }
        }
        outcomes
    }

    async fn mirror_write(&self, record: &MemoryRecord) {
        if let Some(mirror) = &self.mirror {
            if let Err(err) = mirror.upsert(record).await {
                warn!(
                    id = %record.id_short(),
                    error = %err,
                    "mirror write failed, queued for repair"
                );
                self.repair.push(record.id);
            }
        }
    }

    /// Evict least-recently-accessed records past the per-tier cap.  A cap
    /// of zero means unbounded.
    async fn enforce_capacity(&self, tier: MemoryTier) -> Result<()> {
        let max = self.config.memory.max_records_per_tier;
        if max == 0 {
            return Ok(());
        }
        let mut records = self.store.list(tier).await?;
        if records.len() <= max {
            return Ok(());
        }
        records.sort_by_key(|r| r.last_accessed_at);
        let excess = records.len() - max;
        for victim in &records[..excess] {
            self.remove_everywhere(victim.tier, victim.id).await?;
            debug!(id = %victim.id_short(), tier = tier.slug(), "evicted over-capacity record");
        }
        Ok(())
    }

    async fn remove_everywhere(&self, tier: MemoryTier, id: Uuid) -> Result<bool> {
        let removed = self.store.delete(tier, id).await?;
        self.index.remove(id);
        if let Some(mirror) = &self.mirror {
            if let Err(err) = mirror.delete(id).await {
                warn!(%id, error = %err, "mirror delete failed");
            }
        }
        Ok(removed)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Delete a record from every store and the index.
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let Some(record) = self.store.get(id).await? else {
            return Ok(false);
        };
        let removed = self.remove_everywhere(record.tier, id).await?;
        if removed {
            info!(id = %record.id_short(), "memory deleted");
        }
        Ok(removed)
    }

    pub async fn clear_all(&self) -> Result<()> {
        self.store.clear().await?;
        if let Some(mirror) = &self.mirror {
            mirror.clear().await?;
        }
        self.index.clear();
        while self.repair.pop().is_some() {}
        info!("all memories cleared");
        Ok(())
    }

    /// Rebuild the exact index from the tier store.  The store is always
    /// authoritative; call this once at startup when reattaching to
    /// pre-existing data.
    pub async fn rebuild_index(&self) -> Result<usize> {
        let mut records = Vec::new();
        for tier in MemoryTier::ALL {
            records.extend(self.store.list(tier).await?);
        }
        self.index.rebuild(&records);
        Ok(records.len())
    }

    pub async fn tier_stats(&self) -> Result<MemoryStats> {
        let mut tiers = BTreeMap::new();
        let mut total = 0usize;
        for tier in MemoryTier::ALL {
            let records = self.store.list(tier).await?;
            total += records.len();
            tiers.insert(
                tier,
                TierStats {
                    count: records.len(),
                    oldest: records.iter().map(|r| r.created_at).min(),
                    newest: records.iter().map(|r| r.created_at).max(),
                },
            );
        }
        Ok(MemoryStats {
            tiers,
            total,
            indexed: self.index.len(),
            repair_backlog: self.repair.len(),
        })
    }

    // ── Migration ─────────────────────────────────────────────────────────────

    /// Run one migration pass now, regardless of the schedule.
    pub async fn run_migration(&self) -> Result<MigrationReport> {
        self.migration.run_once().await
    }

    pub fn migration_status(&self) -> MigrationStatus {
        self.migration.status()
    }

    /// Start the background migration scheduler.  Returns `None` when the
    /// configured interval is zero (scheduler disabled).
    pub fn start_migration_scheduler(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        let minutes = self.config.memory.migration_interval_minutes;
        if minutes == 0 {
            return None;
        }
        Some(spawn_scheduler(
            Arc::clone(&self.migration),
            Duration::from_secs(minutes * 60),
            shutdown,
        ))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
