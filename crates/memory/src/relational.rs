//! Relational mirror of the tier store.
//!
//! The mirror is a secondary, durable copy kept in SQLite.  Writes go to
//! the vector store first; the mirror write follows and is allowed to
//! fail without failing the store operation (the engine queues the record
//! for repair instead).  Reads normally come from the vector store, with
//! an optional sampled fraction served from here to shake out drift.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::schema::{MemoryContext, MemoryRecord, MemoryTier, MetadataValue};

#[async_trait]
pub trait RelationalMirror: Send + Sync {
    /// Insert or replace a record.
    async fn upsert(&self, record: &MemoryRecord) -> Result<()>;

    /// Change a record's tier in place.
    async fn update_tier(&self, id: Uuid, tier: MemoryTier) -> Result<()>;

    /// Persist an access touch.
    async fn record_access(&self, id: Uuid, at: DateTime<Utc>, count: u64) -> Result<()>;

    async fn fetch(&self, id: Uuid) -> Result<Option<MemoryRecord>>;

    /// All mirrored records, optionally restricted to one tier.
    async fn fetch_all(&self, tier: Option<MemoryTier>) -> Result<Vec<MemoryRecord>>;

    async fn delete(&self, id: Uuid) -> Result<bool>;

    async fn clear(&self) -> Result<()>;
}

// ── SQLite implementation ─────────────────────────────────────────────────────

/// Mirror backed by a single SQLite file.  The connection sits behind a
/// mutex; statements are short and the engine never holds it across an
/// await point.
pub struct SqliteMirror {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS memories (
    id               TEXT PRIMARY KEY,
    content          TEXT NOT NULL,
    context          TEXT NOT NULL,
    importance       REAL NOT NULL,
    tier             TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL,
    access_count     INTEGER NOT NULL,
    metadata         TEXT NOT NULL,
    content_hash     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memories_tier ON memories(tier);
CREATE INDEX IF NOT EXISTS idx_memories_hash ON memories(content_hash);
";

impl SqliteMirror {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("opening mirror db at {}", path.as_ref().display()))?;
        conn.execute_batch(SCHEMA).context("creating mirror schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database, used by tests and by callers that want
    /// the mirror semantics without a file.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory mirror")?;
        conn.execute_batch(SCHEMA).context("creating mirror schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<MemoryRecord> {
        let id: String = row.get("id")?;
        let context: String = row.get("context")?;
        let tier: String = row.get("tier")?;
        let metadata: String = row.get("metadata")?;
        let access_count: i64 = row.get("access_count")?;
        Ok(MemoryRecord {
            id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
            content: row.get("content")?,
            context: MemoryContext::from_label(&context).unwrap_or(MemoryContext::General),
            importance: row.get("importance")?,
            tier: MemoryTier::from_label(&tier).unwrap_or(MemoryTier::Longterm),
            created_at: row.get("created_at")?,
            last_accessed_at: row.get("last_accessed_at")?,
            access_count: access_count.max(0) as u64,
            metadata: serde_json::from_str::<BTreeMap<String, MetadataValue>>(&metadata)
                .unwrap_or_default(),
            embedding: Vec::new(),
        })
    }
}

#[async_trait]
impl RelationalMirror for SqliteMirror {
    async fn upsert(&self, record: &MemoryRecord) -> Result<()> {
        let metadata = serde_json::to_string(&record.metadata)?;
        let conn = self.conn.lock().expect("mirror lock poisoned");
        conn.execute(
            "INSERT INTO memories
                 (id, content, context, importance, tier,
                  created_at, last_accessed_at, access_count, metadata, content_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                 content = excluded.content,
                 context = excluded.context,
                 importance = excluded.importance,
                 tier = excluded.tier,
                 last_accessed_at = excluded.last_accessed_at,
                 access_count = excluded.access_count,
                 metadata = excluded.metadata,
                 content_hash = excluded.content_hash",
            params![
                record.id.to_string(),
                record.content,
                record.context.slug(),
                record.importance,
                record.tier.slug(),
                record.created_at,
                record.last_accessed_at,
                record.access_count as i64,
                metadata,
                record.content_hash(),
            ],
        )
        .context("mirroring record")?;
        Ok(())
    }

    async fn update_tier(&self, id: Uuid, tier: MemoryTier) -> Result<()> {
        let conn = self.conn.lock().expect("mirror lock poisoned");
        conn.execute(
            "UPDATE memories SET tier = ?1 WHERE id = ?2",
            params![tier.slug(), id.to_string()],
        )
        .context("updating mirrored tier")?;
        Ok(())
    }

    async fn record_access(&self, id: Uuid, at: DateTime<Utc>, count: u64) -> Result<()> {
        let conn = self.conn.lock().expect("mirror lock poisoned");
        conn.execute(
            "UPDATE memories SET last_accessed_at = ?1, access_count = ?2 WHERE id = ?3",
            params![at, count as i64, id.to_string()],
        )
        .context("recording mirrored access")?;
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        let conn = self.conn.lock().expect("mirror lock poisoned");
        conn.query_row(
            "SELECT * FROM memories WHERE id = ?1",
            params![id.to_string()],
            Self::row_to_record,
        )
        .optional()
        .context("fetching mirrored record")
    }

    async fn fetch_all(&self, tier: Option<MemoryTier>) -> Result<Vec<MemoryRecord>> {
        let conn = self.conn.lock().expect("mirror lock poisoned");
        let mut records = Vec::new();
        match tier {
            Some(tier) => {
                let mut stmt = conn.prepare("SELECT * FROM memories WHERE tier = ?1")?;
                let rows = stmt.query_map(params![tier.slug()], Self::row_to_record)?;
                for row in rows {
                    records.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare("SELECT * FROM memories")?;
                let rows = stmt.query_map([], Self::row_to_record)?;
                for row in rows {
                    records.push(row?);
                }
            }
        }
        Ok(records)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().expect("mirror lock poisoned");
        let changed = conn
            .execute("DELETE FROM memories WHERE id = ?1", params![id.to_string()])
            .context("deleting mirrored record")?;
        Ok(changed > 0)
    }

    async fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mirror lock poisoned");
        conn.execute("DELETE FROM memories", [])
            .context("clearing mirror")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::sanitize_metadata;
    use serde_json::json;

    fn record(content: &str) -> MemoryRecord {
        MemoryRecord {
            id: Uuid::new_v4(),
            content: content.into(),
            context: MemoryContext::Note,
            importance: 0.72,
            tier: MemoryTier::Working,
            created_at: Utc::now(),
            last_accessed_at: Utc::now(),
            access_count: 3,
            metadata: sanitize_metadata(json!({"file": "lib.rs", "line": 10})),
            embedding: vec![1.0, 2.0],
        }
    }

    #[tokio::test]
    async fn round_trip_preserves_fields_except_embedding() {
        let mirror = SqliteMirror::open_in_memory().unwrap();
        let rec = record("mirrored note");
        mirror.upsert(&rec).await.unwrap();

        let got = mirror.fetch(rec.id).await.unwrap().unwrap();
        assert_eq!(got.content, rec.content);
        assert_eq!(got.context, rec.context);
        assert_eq!(got.tier, rec.tier);
        assert_eq!(got.access_count, 3);
        assert_eq!(got.metadata, rec.metadata);
        assert!(got.embedding.is_empty(), "embeddings stay in the vector store");
    }

    #[tokio::test]
    async fn upsert_replaces_existing_row() {
        let mirror = SqliteMirror::open_in_memory().unwrap();
        let mut rec = record("v1");
        mirror.upsert(&rec).await.unwrap();
        rec.content = "v2".into();
        mirror.upsert(&rec).await.unwrap();

        let all = mirror.fetch_all(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content, "v2");
    }

    #[tokio::test]
    async fn tier_update_and_filtered_fetch() {
        let mirror = SqliteMirror::open_in_memory().unwrap();
        let rec = record("moving");
        mirror.upsert(&rec).await.unwrap();
        mirror.update_tier(rec.id, MemoryTier::Longterm).await.unwrap();

        assert!(mirror
            .fetch_all(Some(MemoryTier::Working))
            .await
            .unwrap()
            .is_empty());
        let longterm = mirror.fetch_all(Some(MemoryTier::Longterm)).await.unwrap();
        assert_eq!(longterm.len(), 1);
        assert_eq!(longterm[0].tier, MemoryTier::Longterm);
    }

    #[tokio::test]
    async fn access_touch_persists() {
        let mirror = SqliteMirror::open_in_memory().unwrap();
        let rec = record("touched");
        mirror.upsert(&rec).await.unwrap();

        let at = Utc::now();
        mirror.record_access(rec.id, at, 9).await.unwrap();
        let got = mirror.fetch(rec.id).await.unwrap().unwrap();
        assert_eq!(got.access_count, 9);
        assert_eq!(got.last_accessed_at.timestamp(), at.timestamp());
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let mirror = SqliteMirror::open_in_memory().unwrap();
        let a = record("a");
        let b = record("b");
        mirror.upsert(&a).await.unwrap();
        mirror.upsert(&b).await.unwrap();

        assert!(mirror.delete(a.id).await.unwrap());
        assert!(!mirror.delete(a.id).await.unwrap());
        mirror.clear().await.unwrap();
        assert!(mirror.fetch_all(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_backed_mirror_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.db");
        let rec = record("durable");
        {
            let mirror = SqliteMirror::open(&path).unwrap();
            mirror.upsert(&rec).await.unwrap();
        }
        let mirror = SqliteMirror::open(&path).unwrap();
        let got = mirror.fetch(rec.id).await.unwrap().unwrap();
        assert_eq!(got.content, "durable");
    }
}
