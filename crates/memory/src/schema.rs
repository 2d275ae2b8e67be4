use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Storage tiers from hottest to coldest.
///
/// | Tier       | Purpose                                               |
/// |------------|-------------------------------------------------------|
/// | `Working`  | Fresh or frequently accessed memories                 |
/// | `Session`  | Recent but cooling memories                           |
/// | `Longterm` | Everything that aged out of the first two             |
///
/// A record belongs to exactly one tier at a time; only the migration
/// engine (or the write-time placement decision) changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTier {
    Working,
    Session,
    Longterm,
}

impl MemoryTier {
    pub const ALL: [MemoryTier; 3] = [Self::Working, Self::Session, Self::Longterm];

    /// Canonical display label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Working => "Working",
            Self::Session => "Session",
            Self::Longterm => "Longterm",
        }
    }

    /// Lowercase slug used for index keys, SQL values, and log lines.
    pub fn slug(self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::Session => "session",
            Self::Longterm => "longterm",
        }
    }

    /// Parse a tier from its slug or label (case-insensitive).
    pub fn from_label(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "working" => Some(Self::Working),
            "session" => Some(Self::Session),
            "longterm" | "long_term" | "long-term" => Some(Self::Longterm),
            _ => None,
        }
    }
}

/// What kind of information a memory carries.  Drives the base importance
/// weight assigned at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryContext {
    General,
    UserPreference,
    TaskCritical,
    Note,
    CodeSymbol,
    CodePattern,
    CodeDecision,
    CodeSnippet,
    CodeError,
}

impl MemoryContext {
    pub fn slug(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::UserPreference => "user_preference",
            Self::TaskCritical => "task_critical",
            Self::Note => "note",
            Self::CodeSymbol => "code_symbol",
            Self::CodePattern => "code_pattern",
            Self::CodeDecision => "code_decision",
            Self::CodeSnippet => "code_snippet",
            Self::CodeError => "code_error",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "general" => Some(Self::General),
            "user_preference" | "user-preference" | "preference" => Some(Self::UserPreference),
            "task_critical" | "task-critical" => Some(Self::TaskCritical),
            "note" => Some(Self::Note),
            "code_symbol" => Some(Self::CodeSymbol),
            "code_pattern" => Some(Self::CodePattern),
            "code_decision" => Some(Self::CodeDecision),
            "code_snippet" => Some(Self::CodeSnippet),
            "code_error" => Some(Self::CodeError),
            _ => None,
        }
    }
}

// ── Metadata ──────────────────────────────────────────────────────────────────

/// A flat metadata value.  Both the exact index and the relational mirror
/// require scalar, typed fields, so structural values never get past the
/// write boundary — see [`sanitize_metadata`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Num(f64),
    Str(String),
}

impl MetadataValue {
    /// Canonical string form used as the exact-index field-value key.
    pub fn index_key(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Num(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Self::Str(s) => s.clone(),
        }
    }
}

/// Flatten arbitrary JSON metadata into scalar values.
///
/// Primitives pass through; nested arrays and objects are stringified rather
/// than rejected, so a sloppy caller still gets its write.  Nulls are
/// dropped.
pub fn sanitize_metadata(raw: Value) -> BTreeMap<String, MetadataValue> {
    let mut out = BTreeMap::new();
    let Value::Object(map) = raw else {
        return out;
    };
    for (key, value) in map {
        match value {
            Value::Null => {}
            Value::Bool(b) => {
                out.insert(key, MetadataValue::Bool(b));
            }
            Value::Number(n) => {
                if let Some(f) = n.as_f64() {
                    out.insert(key, MetadataValue::Num(f));
                }
            }
            Value::String(s) => {
                out.insert(key, MetadataValue::Str(s));
            }
            nested @ (Value::Array(_) | Value::Object(_)) => {
                out.insert(key, MetadataValue::Str(nested.to_string()));
            }
        }
    }
    out
}

// ── Memory record ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub content: String,
    pub context: MemoryContext,
    /// Assigned once at write time; never recomputed on read.
    pub importance: f32,
    pub tier: MemoryTier,
    pub created_at: DateTime<Utc>,
    /// Updated on every successful retrieval of this record.
    pub last_accessed_at: DateTime<Utc>,
    /// Incremented on every successful retrieval of this record.
    pub access_count: u64,
    pub metadata: BTreeMap<String, MetadataValue>,
    /// Fixed-length vector from the embedding provider — lives in the vector
    /// store, never serialized alongside the rest of the record.
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

impl MemoryRecord {
    /// First 8 characters of the UUID, used as a compact display identifier.
    pub fn id_short(&self) -> String {
        self.id.to_string()[..8].to_string()
    }

    /// Record age in fractional hours at `now`.
    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_seconds().max(0) as f64 / 3600.0
    }

    /// SHA-256 hex of the content — used for deduplication.
    pub fn content_hash(&self) -> String {
        content_hash(&self.content)
    }
}

/// SHA-256 hex digest of a content string.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A retrieval result with its composite score and sub-score provenance.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub record: MemoryRecord,
    pub score: f32,
    pub semantic: f32,
    pub recency: f32,
    pub importance: f32,
    pub frequency: f32,
    /// Whether the exact index matched this record (hybrid search only).
    pub exact_match: bool,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tier_labels_round_trip() {
        for tier in MemoryTier::ALL {
            assert_eq!(MemoryTier::from_label(tier.slug()), Some(tier));
            assert_eq!(MemoryTier::from_label(tier.label()), Some(tier));
        }
        assert_eq!(MemoryTier::from_label("long-term"), Some(MemoryTier::Longterm));
        assert_eq!(MemoryTier::from_label("hot"), None);
    }

    #[test]
    fn context_labels_round_trip() {
        assert_eq!(
            MemoryContext::from_label("task_critical"),
            Some(MemoryContext::TaskCritical)
        );
        assert_eq!(
            MemoryContext::from_label("CODE_ERROR"),
            Some(MemoryContext::CodeError)
        );
        assert_eq!(MemoryContext::from_label("poetry"), None);
    }

    #[test]
    fn sanitize_keeps_primitives_and_flattens_structures() {
        let meta = sanitize_metadata(json!({
            "file": "src/main.rs",
            "line": 42,
            "pinned": true,
            "nothing": null,
            "nested": { "a": 1 },
            "list": [1, 2, 3],
        }));

        assert_eq!(meta.get("file"), Some(&MetadataValue::Str("src/main.rs".into())));
        assert_eq!(meta.get("line"), Some(&MetadataValue::Num(42.0)));
        assert_eq!(meta.get("pinned"), Some(&MetadataValue::Bool(true)));
        assert!(!meta.contains_key("nothing"));
        // Structural values survive as JSON strings, not as errors.
        assert_eq!(meta.get("nested"), Some(&MetadataValue::Str("{\"a\":1}".into())));
        assert_eq!(meta.get("list"), Some(&MetadataValue::Str("[1,2,3]".into())));
    }

    #[test]
    fn sanitize_non_object_yields_empty_map() {
        assert!(sanitize_metadata(json!("just a string")).is_empty());
        assert!(sanitize_metadata(json!(null)).is_empty());
    }

    #[test]
    fn metadata_index_keys_are_canonical() {
        assert_eq!(MetadataValue::Num(42.0).index_key(), "42");
        assert_eq!(MetadataValue::Num(2.5).index_key(), "2.5");
        assert_eq!(MetadataValue::Bool(false).index_key(), "false");
        assert_eq!(MetadataValue::Str("x".into()).index_key(), "x");
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
    }
}
