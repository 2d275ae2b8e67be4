//! Tiered memory and hybrid retrieval engine.
//!
//! Memories live in three tiers (`working`, `session`, `longterm`) and
//! move between them based on age and access frequency.  Retrieval
//! combines embedding similarity, an in-memory exact index, and a
//! multi-factor ranking; results can be packed into a token-budgeted
//! context string for prompting.
//!
//! [`MemoryEngine`] is the entry point; the collaborator traits
//! ([`VectorStore`], [`RelationalMirror`],
//! [`engram_embedding::EmbeddingProvider`]) are the seams for swapping
//! backing services.

pub mod compress;
pub mod engine;
pub mod importance;
pub mod index;
pub mod migration;
pub mod relational;
pub mod schema;
pub mod scoring;
pub mod tiering;
pub mod vector;

pub use compress::{estimate_tokens, CompressedContext, EMPTY_CONTEXT_MARKER};
pub use engine::{
    BatchStoreOutcome, ContextOptions, MemoryEngine, MemoryStats, StoreItem, StoreOutcome,
    TierStats,
};
pub use index::ExactIndex;
pub use migration::{MigrationReport, MigrationStatus, RepairQueue, TierMove};
pub use relational::{RelationalMirror, SqliteMirror};
pub use schema::{
    content_hash, sanitize_metadata, MemoryContext, MemoryRecord, MemoryTier, MetadataValue,
    ScoredMemory,
};
pub use tiering::{frequency_score, TierPolicy};
pub use vector::{InMemoryVectorStore, VectorStore};
