//! Background tier migration.
//!
//! A migration pass snapshots every record id, re-evaluates placement
//! with the same [`TierPolicy`] used at write time, and moves each record
//! whose tier no longer matches.  Moves are per-record and independent: a
//! failed move is retried a bounded number of times, then logged and
//! skipped, and never halts the pass.  The pass also drains the repair
//! queue of records whose mirror write failed at store time.
//!
//! The scheduler runs passes on a fixed interval and honours shutdown at
//! record granularity, so a stop request never waits for a full pass.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::index::ExactIndex;
use crate::relational::RelationalMirror;
use crate::schema::MemoryTier;
use crate::tiering::TierPolicy;
use crate::vector::VectorStore;

// ── Repair queue ──────────────────────────────────────────────────────────────

/// Ids whose relational mirror write failed and needs to be replayed.
/// Pushed by the store path, drained by the migration pass.
#[derive(Debug, Default)]
pub struct RepairQueue {
    inner: Mutex<VecDeque<Uuid>>,
}

impl RepairQueue {
    pub fn push(&self, id: Uuid) {
        self.inner.lock().expect("repair queue lock poisoned").push_back(id);
    }

    pub fn pop(&self) -> Option<Uuid> {
        self.inner.lock().expect("repair queue lock poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("repair queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Reports ───────────────────────────────────────────────────────────────────

/// Move count for one (source, target) tier pair.
#[derive(Debug, Clone, Serialize)]
pub struct TierMove {
    pub from: MemoryTier,
    pub to: MemoryTier,
    pub count: usize,
}

/// Outcome of one migration pass.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Records whose placement was evaluated.
    pub examined: usize,
    /// Moves per (source, target) pair.
    pub moved: Vec<TierMove>,
    /// Mirror writes replayed from the repair queue.
    pub repaired: usize,
    /// Per-record failures; the pass continued past each of these.
    pub errors: Vec<String>,
    /// Whether the pass was cut short by shutdown.
    pub interrupted: bool,
}

impl MigrationReport {
    pub fn total_moved(&self) -> usize {
        self.moved.iter().map(|m| m.count).sum()
    }

    fn record_move(&mut self, from: MemoryTier, to: MemoryTier) {
        match self.moved.iter_mut().find(|m| m.from == from && m.to == to) {
            Some(entry) => entry.count += 1,
            None => self.moved.push(TierMove { from, to, count: 1 }),
        }
    }
}

/// Rolling migration state, queryable at any time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationStatus {
    pub runs: u64,
    pub last_report: Option<MigrationReport>,
    pub repair_backlog: usize,
}

// ── Runner ────────────────────────────────────────────────────────────────────

pub struct MigrationRunner {
    store: Arc<dyn VectorStore>,
    mirror: Option<Arc<dyn RelationalMirror>>,
    index: Arc<ExactIndex>,
    repair: Arc<RepairQueue>,
    policy: TierPolicy,
    move_retries: u32,
    status: Mutex<MigrationStatus>,
}

impl MigrationRunner {
    pub fn new(
        store: Arc<dyn VectorStore>,
        mirror: Option<Arc<dyn RelationalMirror>>,
        index: Arc<ExactIndex>,
        repair: Arc<RepairQueue>,
        policy: TierPolicy,
        move_retries: u32,
    ) -> Self {
        Self {
            store,
            mirror,
            index,
            repair,
            policy,
            move_retries,
            status: Mutex::new(MigrationStatus::default()),
        }
    }

    pub fn status(&self) -> MigrationStatus {
        let mut status = self
            .status
            .lock()
            .expect("migration status lock poisoned")
            .clone();
        status.repair_backlog = self.repair.len();
        status
    }

    /// Run one full pass to completion.
    pub async fn run_once(&self) -> Result<MigrationReport> {
        self.run(None).await
    }

    /// Run one pass, stopping between records if `shutdown` flips to true.
    pub async fn run(&self, shutdown: Option<&watch::Receiver<bool>>) -> Result<MigrationReport> {
        let started_at = Utc::now();
        let mut report = MigrationReport {
            started_at,
            finished_at: started_at,
            examined: 0,
            moved: Vec::new(),
            repaired: 0,
            errors: Vec::new(),
            interrupted: false,
        };

        // Snapshot ids up front; records stored mid-pass are picked up next
        // time.
        let mut snapshot: Vec<(MemoryTier, Uuid)> = Vec::new();
        for tier in MemoryTier::ALL {
            for record in self.store.list(tier).await? {
                snapshot.push((tier, record.id));
            }
        }

        let stop_requested =
            |rx: Option<&watch::Receiver<bool>>| rx.is_some_and(|rx| *rx.borrow());

        for (source, id) in snapshot {
            if stop_requested(shutdown) {
                report.interrupted = true;
                break;
            }
            report.examined += 1;

            // Re-read: the record may have been deleted or touched since the
            // snapshot.
            let Some(record) = self.store.get(id).await? else {
                continue;
            };
            if record.tier != source {
                continue;
            }
            let target = self.policy.target_tier_for(&record, Utc::now());
            if target == source {
                continue;
            }

            let mut attempt = 0u32;
            loop {
                match self.move_record(&record, source, target).await {
                    Ok(()) => {
                        report.record_move(source, target);
                        debug!(
                            id = %record.id_short(),
                            from = source.slug(),
                            to = target.slug(),
                            "migrated record"
                        );
                        break;
                    }
                    Err(err) if attempt < self.move_retries => {
                        attempt += 1;
                        warn!(
                            id = %record.id_short(),
                            attempt,
                            error = %err,
                            "migration move failed, retrying"
                        );
                    }
                    Err(err) => {
                        report
                            .errors
                            .push(format!("{}: {err:#}", record.id_short()));
                        break;
                    }
                }
            }
        }

        if !report.interrupted {
            report.repaired = self.drain_repair_queue(shutdown, &mut report.interrupted).await;
        }

        report.finished_at = Utc::now();
        info!(
            examined = report.examined,
            moved = report.total_moved(),
            repaired = report.repaired,
            errors = report.errors.len(),
            interrupted = report.interrupted,
            "migration pass finished"
        );

        let mut status = self.status.lock().expect("migration status lock poisoned");
        status.runs += 1;
        status.last_report = Some(report.clone());
        drop(status);

        Ok(report)
    }

    async fn move_record(
        &self,
        record: &crate::schema::MemoryRecord,
        source: MemoryTier,
        target: MemoryTier,
    ) -> Result<()> {
        let mut moved = record.clone();
        moved.tier = target;
        self.store
            .upsert(target, moved)
            .await
            .context("inserting into target tier")?;
        self.store
            .delete(source, record.id)
            .await
            .context("removing from source tier")?;
        self.index.set_tier(record.id, target);

        // Mirror drift is repaired, not fatal.
        if let Some(mirror) = &self.mirror {
            if let Err(err) = mirror.update_tier(record.id, target).await {
                warn!(id = %record.id_short(), error = %err, "mirror tier update failed, queued for repair");
                self.repair.push(record.id);
            }
        }
        Ok(())
    }

    async fn drain_repair_queue(
        &self,
        shutdown: Option<&watch::Receiver<bool>>,
        interrupted: &mut bool,
    ) -> usize {
        let Some(mirror) = &self.mirror else {
            return 0;
        };
        let mut repaired = 0usize;
        let mut requeue = Vec::new();
        while let Some(id) = self.repair.pop() {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                *interrupted = true;
                requeue.push(id);
                break;
            }
            match self.store.get(id).await {
                Ok(Some(record)) => match mirror.upsert(&record).await {
                    Ok(()) => repaired += 1,
                    Err(err) => {
                        warn!(id = %record.id_short(), error = %err, "repair write failed, requeued");
                        requeue.push(id);
                    }
                },
                // Deleted since it was queued; nothing left to mirror.
                Ok(None) => {}
                Err(err) => {
                    warn!(%id, error = %err, "repair lookup failed, requeued");
                    requeue.push(id);
                }
            }
        }
        for id in requeue {
            self.repair.push(id);
        }
        repaired
    }
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

/// Run migration passes every `every` until `shutdown` flips to true.
pub fn spawn_scheduler(
    runner: Arc<MigrationRunner>,
    every: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the engine settles
        // before the first pass.
        interval.tick().await;
        let mut shutdown_rx = shutdown;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = runner.run(Some(&shutdown_rx)).await {
                        warn!(error = %err, "migration pass failed");
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("migration scheduler stopping");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relational::SqliteMirror;
    use crate::schema::{MemoryContext, MemoryRecord};
    use crate::vector::InMemoryVectorStore;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeMap as Meta;

    fn aged_record(content: &str, age_hours: i64) -> MemoryRecord {
        let created = Utc::now() - ChronoDuration::hours(age_hours);
        MemoryRecord {
            id: Uuid::new_v4(),
            content: content.into(),
            context: MemoryContext::General,
            importance: 0.8,
            tier: MemoryTier::Working,
            created_at: created,
            last_accessed_at: created,
            access_count: 0,
            metadata: Meta::new(),
            embedding: vec![1.0],
        }
    }

    fn runner(
        store: Arc<dyn VectorStore>,
        mirror: Option<Arc<dyn RelationalMirror>>,
    ) -> (MigrationRunner, Arc<ExactIndex>, Arc<RepairQueue>) {
        let index = Arc::new(ExactIndex::new());
        let repair = Arc::new(RepairQueue::default());
        let runner = MigrationRunner::new(
            store,
            mirror,
            Arc::clone(&index),
            Arc::clone(&repair),
            TierPolicy::default(),
            2,
        );
        (runner, index, repair)
    }

    #[tokio::test]
    async fn aged_records_move_down_through_tiers() {
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let mirror: Arc<dyn RelationalMirror> = Arc::new(SqliteMirror::open_in_memory().unwrap());

        let fresh = aged_record("fresh entry", 1);
        let cooling = aged_record("cooling entry", 48);
        let cold = aged_record("cold entry", 500);
        for rec in [&fresh, &cooling, &cold] {
            store.upsert(MemoryTier::Working, rec.clone()).await.unwrap();
            mirror.upsert(rec).await.unwrap();
        }

        let (runner, index, _) = runner(Arc::clone(&store), Some(Arc::clone(&mirror)));
        for rec in [&fresh, &cooling, &cold] {
            index.insert(rec);
        }

        let report = runner.run_once().await.unwrap();
        assert_eq!(report.examined, 3);
        assert_eq!(report.total_moved(), 2);
        assert!(report.errors.is_empty());

        assert_eq!(store.get(fresh.id).await.unwrap().unwrap().tier, MemoryTier::Working);
        assert_eq!(store.get(cooling.id).await.unwrap().unwrap().tier, MemoryTier::Session);
        assert_eq!(store.get(cold.id).await.unwrap().unwrap().tier, MemoryTier::Longterm);

        // Index and mirror follow the moves.
        assert_eq!(index.tier_of(cold.id), Some(MemoryTier::Longterm));
        assert_eq!(
            mirror.fetch(cooling.id).await.unwrap().unwrap().tier,
            MemoryTier::Session
        );
    }

    #[tokio::test]
    async fn settled_records_do_not_move_again() {
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let rec = aged_record("settled", 500);
        store.upsert(MemoryTier::Working, rec.clone()).await.unwrap();

        let (runner, _, _) = runner(Arc::clone(&store), None);
        let first = runner.run_once().await.unwrap();
        assert_eq!(first.total_moved(), 1);
        let second = runner.run_once().await.unwrap();
        assert_eq!(second.total_moved(), 0, "second pass is a no-op");
        assert_eq!(runner.status().runs, 2);
    }

    #[tokio::test]
    async fn reports_serialize_to_json() {
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        store
            .upsert(MemoryTier::Working, aged_record("old enough to move", 500))
            .await
            .unwrap();
        let (runner, _, _) = runner(Arc::clone(&store), None);
        let report = runner.run_once().await.unwrap();

        let rendered = serde_json::to_string(&report).unwrap();
        assert!(rendered.contains("\"from\":\"working\""));
        assert!(rendered.contains("\"to\":\"longterm\""));
        let status = serde_json::to_string(&runner.status()).unwrap();
        assert!(status.contains("\"runs\":1"));
    }

    #[tokio::test]
    async fn repair_queue_is_drained_into_the_mirror() {
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let mirror: Arc<dyn RelationalMirror> = Arc::new(SqliteMirror::open_in_memory().unwrap());

        let rec = aged_record("unmirrored", 1);
        store.upsert(MemoryTier::Working, rec.clone()).await.unwrap();

        let (runner, _, repair) = runner(Arc::clone(&store), Some(Arc::clone(&mirror)));
        repair.push(rec.id);
        // A queued id whose record was deleted is silently discarded.
        repair.push(Uuid::new_v4());

        let report = runner.run_once().await.unwrap();
        assert_eq!(report.repaired, 1);
        assert!(repair.is_empty());
        assert_eq!(
            mirror.fetch(rec.id).await.unwrap().unwrap().content,
            "unmirrored"
        );
    }

    /// Vector store wrapper that fails every upsert of one poisoned id.
    struct PoisonedStore {
        inner: InMemoryVectorStore,
        poisoned: Uuid,
    }

    #[async_trait]
    impl VectorStore for PoisonedStore {
        async fn upsert(&self, tier: MemoryTier, record: MemoryRecord) -> Result<()> {
            if record.id == self.poisoned && record.tier != MemoryTier::Working {
                anyhow::bail!("simulated upsert failure");
            }
            self.inner.upsert(tier, record).await
        }
        async fn query(
            &self,
            tier: MemoryTier,
            embedding: &[f32],
            limit: usize,
        ) -> Result<Vec<(MemoryRecord, f32)>> {
            self.inner.query(tier, embedding, limit).await
        }
        async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
            self.inner.get(id).await
        }
        async fn increment_access(
            &self,
            id: Uuid,
            at: chrono::DateTime<Utc>,
        ) -> Result<Option<MemoryRecord>> {
            self.inner.increment_access(id, at).await
        }
        async fn delete(&self, tier: MemoryTier, id: Uuid) -> Result<bool> {
            self.inner.delete(tier, id).await
        }
        async fn list(&self, tier: MemoryTier) -> Result<Vec<MemoryRecord>> {
            self.inner.list(tier).await
        }
        async fn count(&self, tier: MemoryTier) -> Result<usize> {
            self.inner.count(tier).await
        }
        async fn find_by_content_hash(&self, hash: &str) -> Result<Option<MemoryRecord>> {
            self.inner.find_by_content_hash(hash).await
        }
        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }
    }

    #[tokio::test]
    async fn a_failing_move_never_halts_the_pass() {
        let bad = aged_record("bad entry", 500);
        let good = aged_record("good entry", 500);
        let store = Arc::new(PoisonedStore {
            inner: InMemoryVectorStore::new(),
            poisoned: bad.id,
        });
        store.upsert(MemoryTier::Working, bad.clone()).await.unwrap();
        store.upsert(MemoryTier::Working, good.clone()).await.unwrap();

        let (runner, _, _) = runner(store.clone() as Arc<dyn VectorStore>, None);
        let report = runner.run_once().await.unwrap();

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.total_moved(), 1);
        assert_eq!(store.get(good.id).await.unwrap().unwrap().tier, MemoryTier::Longterm);
        assert_eq!(store.get(bad.id).await.unwrap().unwrap().tier, MemoryTier::Working);
    }

    #[tokio::test]
    async fn shutdown_interrupts_between_records() {
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        for i in 0..10 {
            store
                .upsert(MemoryTier::Working, aged_record(&format!("rec {i}"), 500))
                .await
                .unwrap();
        }

        let (runner, _, _) = runner(Arc::clone(&store), None);
        let (tx, rx) = watch::channel(true);
        let report = runner.run(Some(&rx)).await.unwrap();
        drop(tx);

        assert!(report.interrupted);
        assert_eq!(report.examined, 0, "stop before the first record");
    }
}
