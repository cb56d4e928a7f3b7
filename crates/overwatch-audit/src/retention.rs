//! Retention horizons.
//!
//! A sweep flags entries older than their policy's horizon as archived.
//! Nothing is ever deleted, so archived entries still take part in chain
//! verification.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use overwatch_types::RetentionPolicy;
use serde::{Deserialize, Serialize};

fn default_permanent_days() -> u32 {
    3650
}
fn default_long_term_days() -> u32 {
    2555
}
fn default_standard_days() -> u32 {
    365
}
fn default_short_term_days() -> u32 {
    90
}

/// Horizon, in days, after which an entry of each policy is archived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_permanent_days")]
    pub permanent_days: u32,
    #[serde(default = "default_long_term_days")]
    pub long_term_days: u32,
    #[serde(default = "default_standard_days")]
    pub standard_days: u32,
    #[serde(default = "default_short_term_days")]
    pub short_term_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            permanent_days: default_permanent_days(),
            long_term_days: default_long_term_days(),
            standard_days: default_standard_days(),
            short_term_days: default_short_term_days(),
        }
    }
}

impl RetentionConfig {
    pub fn horizon(&self, policy: RetentionPolicy) -> Duration {
        let days = match policy {
            RetentionPolicy::Permanent => self.permanent_days,
            RetentionPolicy::LongTerm => self.long_term_days,
            RetentionPolicy::Standard => self.standard_days,
            RetentionPolicy::ShortTerm => self.short_term_days,
        };
        Duration::days(i64::from(days))
    }

    /// Entries of `policy` stamped before the returned instant are due.
    pub fn cutoff(&self, policy: RetentionPolicy, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.horizon(policy)
    }

    /// Horizons must be non-zero and must not shrink as the policy gets
    /// stricter.
    pub fn validate(&self) -> Result<(), String> {
        let ordered = [
            ("short_term_days", self.short_term_days),
            ("standard_days", self.standard_days),
            ("long_term_days", self.long_term_days),
            ("permanent_days", self.permanent_days),
        ];
        if let Some((name, _)) = ordered.iter().find(|(_, d)| *d == 0) {
            return Err(format!("retention.{name} must be greater than zero"));
        }
        for pair in ordered.windows(2) {
            if pair[0].1 > pair[1].1 {
                return Err(format!(
                    "retention.{} ({}) exceeds retention.{} ({})",
                    pair[0].0, pair[0].1, pair[1].0, pair[1].1
                ));
            }
        }
        Ok(())
    }
}

/// Outcome of one retention sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    /// Newly archived entries per policy tag.
    pub archived: BTreeMap<String, usize>,
    pub swept_at: Option<DateTime<Utc>>,
}

impl RetentionReport {
    pub fn total(&self) -> usize {
        self.archived.values().sum()
    }
}
