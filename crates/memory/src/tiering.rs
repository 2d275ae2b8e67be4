//! Tier placement policy.
//!
//! Placement is a pure function of age and access frequency:
//!
//! ```text
//! working  ⇐ age < working_retention  OR  frequency > 0.7
//! session  ⇐ age < session_retention  OR  frequency > 0.3
//! longterm ⇐ otherwise
//! ```
//!
//! where `frequency = min(1, log10(access_count + 1) / 2)`.  The same
//! function is evaluated at write time and by every migration pass, so a
//! record's tier is always explainable from its own fields.

use chrono::{DateTime, Utc};

use crate::schema::{MemoryRecord, MemoryTier};
use engram_config::MemoryConfig;

/// Access-frequency score in [0, 1].  100 accesses saturate the scale.
pub fn frequency_score(access_count: u64) -> f32 {
    (((access_count + 1) as f32).log10() / 2.0).min(1.0)
}

/// Retention windows and frequency thresholds for tier placement.
#[derive(Debug, Clone, Copy)]
pub struct TierPolicy {
    pub working_retention_hours: f64,
    pub session_retention_hours: f64,
    pub working_frequency_threshold: f32,
    pub session_frequency_threshold: f32,
}

impl TierPolicy {
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self {
            working_retention_hours: config.working_retention_hours as f64,
            session_retention_hours: config.session_retention_hours as f64,
            working_frequency_threshold: config.working_frequency_threshold,
            session_frequency_threshold: config.session_frequency_threshold,
        }
    }

    /// Compute the tier a record with the given age and access count belongs
    /// in.
    pub fn target_tier(&self, age_hours: f64, access_count: u64) -> MemoryTier {
        let frequency = frequency_score(access_count);
        if age_hours < self.working_retention_hours
            || frequency > self.working_frequency_threshold
        {
            MemoryTier::Working
        } else if age_hours < self.session_retention_hours
            || frequency > self.session_frequency_threshold
        {
            MemoryTier::Session
        } else {
            MemoryTier::Longterm
        }
    }

    /// Placement for an existing record at `now`.
    pub fn target_tier_for(&self, record: &MemoryRecord, now: DateTime<Utc>) -> MemoryTier {
        self.target_tier(record.age_hours(now), record.access_count)
    }
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self::from_config(&MemoryConfig::default())
    }
}
