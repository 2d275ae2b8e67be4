use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── Memory engine config ──────────────────────────────────────────────────────

/// Tuning knobs for the tiered memory engine.
///
/// The importance heuristic and tier placement policy read their thresholds
/// from here; the values below are defaults, not contracts.  Lowering
/// `importance_threshold` admits more (and noisier) memories; shortening the
/// retention windows pushes records toward `longterm` sooner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Minimum importance score a record must reach to be stored at all.
    /// Records below this are rejected at the admission gate (not an error).
    pub importance_threshold: f32,
    /// Age in hours below which a record belongs to the `working` tier.
    pub working_retention_hours: u64,
    /// Age in hours below which a record belongs to the `session` tier.
    pub session_retention_hours: u64,
    /// Access-frequency score above which a record stays in `working`
    /// regardless of age.
    pub working_frequency_threshold: f32,
    /// Access-frequency score above which a record stays in `session`
    /// regardless of age.
    pub session_frequency_threshold: f32,
    /// Minutes between background migration passes.  `0` disables the
    /// scheduler (migration can still be run on demand).
    pub migration_interval_minutes: u64,
    /// Per-record retries for each step of a tier move before the record is
    /// skipped and reported in the migration errors.
    pub migration_move_retries: u32,
    /// Maximum records held per tier.  When exceeded the least-recently
    /// accessed records in that tier are evicted.  `0` (the default) means
    /// unbounded — the durable, non-cache posture.
    pub max_records_per_tier: usize,
    /// Number of records written per chunk during batch stores.
    pub batch_size: usize,
    /// Delay between batch-store chunks, to avoid overwhelming the backing
    /// stores.
    pub batch_delay_ms: u64,
    /// Default weight given to an exact-index hit in hybrid search.
    /// Callers may override per query.
    pub default_exact_weight: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            importance_threshold: 0.7,
            working_retention_hours: 24,
            session_retention_hours: 168,
            working_frequency_threshold: 0.7,
            session_frequency_threshold: 0.3,
            migration_interval_minutes: 60,
            migration_move_retries: 2,
            max_records_per_tier: 0,
            batch_size: 20,
            batch_delay_ms: 50,
            default_exact_weight: 0.4,
        }
    }
}

// ── Embedding provider config ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Embedding backend: `hash` (deterministic, local, no network) or
    /// `http` (OpenAI-style `/embeddings` endpoint).
    pub provider: String,
    /// Base URL for the HTTP embedding API.  Overridden at runtime by the
    /// `ENGRAM_EMBEDDING_BASE_URL` environment variable when set.
    pub base_url: String,
    /// Model name sent with every HTTP embedding request.
    pub model: String,
    /// API key for the HTTP provider.  Can also be set via the
    /// `ENGRAM_EMBEDDING_API_KEY` env var (env takes precedence).
    pub api_key: String,
    /// Dimension of the vectors the provider returns.  The hash provider
    /// produces exactly this many components.
    pub dimension: usize,
    /// Per-request timeout for the HTTP provider.
    pub timeout_secs: u64,
    /// Attempts per embedding call before the error is surfaced.
    pub retry_attempts: u32,
    /// Base delay for exponential backoff between retries.
    pub retry_base_delay_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hash".to_string(),
            base_url: "http://localhost:8080/v1".to_string(),
            model: "all-MiniLM-L6-v2".to_string(),
            api_key: String::new(),
            dimension: 384,
            timeout_secs: 30,
            retry_attempts: 3,
            retry_base_delay_ms: 200,
        }
    }
}

// ── Storage config ────────────────────────────────────────────────────────────

/// Backing-store selection and dual-write behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// When `true`, every write goes to both the vector store and the
    /// relational mirror (vector first).  A mirror failure is logged and
    /// repaired later, never rolled back.
    pub hybrid_enabled: bool,
    /// Fraction of read traffic (0.0–1.0) routed to the relational mirror to
    /// validate parity during a migration.  Ignored when `hybrid_enabled`
    /// is false.
    pub read_ratio: f64,
    /// Path of the SQLite mirror database.  Overridden by the
    /// `ENGRAM_SQLITE_PATH` env var.  An empty string selects an in-memory
    /// database (useful for tests).
    pub sqlite_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            hybrid_enabled: false,
            read_ratio: 0.0,
            sqlite_path: "engram.db".to_string(),
        }
    }
}

// ── Top-level config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngramConfig {
    pub memory: MemoryConfig,
    pub embedding: EmbeddingConfig,
    pub storage: StorageConfig,
}

impl EngramConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(url) = env::var("ENGRAM_EMBEDDING_BASE_URL") {
            if !url.is_empty() {
                config.embedding.base_url = url;
            }
        }

        // API key env override (takes precedence over config file).
        if let Ok(key) = env::var("ENGRAM_EMBEDDING_API_KEY") {
            if !key.is_empty() {
                config.embedding.api_key = key;
            }
        }

        if let Ok(path) = env::var("ENGRAM_SQLITE_PATH") {
            if !path.is_empty() {
                config.storage.sqlite_path = path;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
