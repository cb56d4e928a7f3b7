//! Allocator policy, deserialised from the `[allocator]` table.

use std::collections::BTreeMap;
use std::time::Duration;

use overwatch_types::GovernanceError;
use serde::{Deserialize, Serialize};

use crate::request::ResourceMap;

fn default_max_duration_secs() -> u64 {
    3600
}

fn default_priority_boost() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Resource type → total capacity.
    #[serde(default)]
    pub pools: ResourceMap,
    /// Team → resource type → ceiling.
    #[serde(default)]
    pub team_ceilings: BTreeMap<String, ResourceMap>,
    /// Upper bound on any allocation's lifetime.
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
    /// Divides the availability visible to Normal and lower bands.
    #[serde(default = "default_priority_boost")]
    pub priority_boost: f64,
    /// Queue unsatisfiable Critical requests instead of denying them.
    #[serde(default)]
    pub queue_critical: bool,
    /// Keep Critical allocations alive through an emergency release.
    #[serde(default)]
    pub preserve_critical_on_emergency: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            pools: ResourceMap::new(),
            team_ceilings: BTreeMap::new(),
            max_duration_secs: default_max_duration_secs(),
            priority_boost: default_priority_boost(),
            queue_critical: false,
            preserve_critical_on_emergency: false,
        }
    }
}

impl AllocatorConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn validate(&self) -> Result<(), GovernanceError> {
        if self.pools.is_empty() {
            return Err(GovernanceError::Configuration(
                "allocator.pools must define at least one resource type".into(),
            ));
        }
        if let Some((name, _)) = self.pools.iter().find(|(_, total)| **total == 0) {
            return Err(GovernanceError::Configuration(format!(
                "allocator.pools.{name} must be greater than zero"
            )));
        }
        if self.max_duration_secs == 0 {
            return Err(GovernanceError::Configuration(
                "allocator.max_duration_secs must be greater than zero".into(),
            ));
        }
        if !self.priority_boost.is_finite() || self.priority_boost < 1.0 {
            return Err(GovernanceError::Configuration(format!(
                "allocator.priority_boost must be >= 1.0, got {}",
                self.priority_boost
            )));
        }
        for (team, ceilings) in &self.team_ceilings {
            for name in ceilings.keys() {
                if !self.pools.contains_key(name) {
                    return Err(GovernanceError::Configuration(format!(
                        "allocator.team_ceilings.{team} names unknown resource type {name:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}
