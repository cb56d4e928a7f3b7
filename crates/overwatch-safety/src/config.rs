//! Monitor policy, deserialised from the `[safety]` table.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use overwatch_types::GovernanceError;
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::BreakerConfig;
use crate::threshold::Threshold;

fn default_max_concurrent_agents() -> usize {
    64
}
fn default_metric_window() -> usize {
    20
}
fn default_auto_escalate_after_cycles() -> u32 {
    3
}
fn default_kill_switch_cooldown_ms() -> u64 {
    300_000
}
fn default_max_runtime_secs() -> u64 {
    86_400
}
fn default_max_idle_secs() -> u64 {
    3_600
}
fn default_max_actions_per_minute() -> u64 {
    600
}
fn default_throttle_actions_per_minute() -> u32 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillSwitchConfig {
    #[serde(default = "default_kill_switch_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Write a monitor snapshot during graceful shutdown.
    #[serde(default)]
    pub save_state: bool,
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_kill_switch_cooldown_ms(),
            save_state: false,
            snapshot_path: None,
        }
    }
}

impl KillSwitchConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Limits for the agent health rules. Zero disables a limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_max_runtime_secs")]
    pub max_runtime_secs: u64,
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
    #[serde(default = "default_max_actions_per_minute")]
    pub max_actions_per_minute: u64,
    /// Rate imposed on an agent by a Throttle intervention.
    #[serde(default = "default_throttle_actions_per_minute")]
    pub throttle_actions_per_minute: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_runtime_secs: default_max_runtime_secs(),
            max_idle_secs: default_max_idle_secs(),
            max_actions_per_minute: default_max_actions_per_minute(),
            throttle_actions_per_minute: default_throttle_actions_per_minute(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: usize,
    /// Samples kept per rolling metric window.
    #[serde(default = "default_metric_window")]
    pub metric_window: usize,
    /// Consecutive firing cycles before an auto-escalating threshold climbs
    /// one severity.
    #[serde(default = "default_auto_escalate_after_cycles")]
    pub auto_escalate_after_cycles: u32,
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,
    #[serde(default)]
    pub kill_switch: KillSwitchConfig,
    #[serde(default)]
    pub health: HealthConfig,
    /// Evaluated in this order every cycle.
    #[serde(default)]
    pub thresholds: Vec<Threshold>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: default_max_concurrent_agents(),
            metric_window: default_metric_window(),
            auto_escalate_after_cycles: default_auto_escalate_after_cycles(),
            circuit_breaker: BreakerConfig::default(),
            kill_switch: KillSwitchConfig::default(),
            health: HealthConfig::default(),
            thresholds: Vec::new(),
        }
    }
}

impl SafetyConfig {
    pub fn validate(&self) -> Result<(), GovernanceError> {
        let fail = |msg: String| Err(GovernanceError::Configuration(msg));
        if self.max_concurrent_agents == 0 {
            return fail("safety.max_concurrent_agents must be greater than zero".into());
        }
        if self.metric_window == 0 {
            return fail("safety.metric_window must be greater than zero".into());
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return fail("safety.circuit_breaker.failure_threshold must be greater than zero".into());
        }
        if self.circuit_breaker.success_threshold == 0 {
            return fail("safety.circuit_breaker.success_threshold must be greater than zero".into());
        }
        if self.circuit_breaker.half_open_max_requests < self.circuit_breaker.success_threshold {
            return fail(
                "safety.circuit_breaker.half_open_max_requests must be at least success_threshold"
                    .into(),
            );
        }
        if self.health.throttle_actions_per_minute == 0 {
            return fail("safety.health.throttle_actions_per_minute must be greater than zero".into());
        }
        if self.kill_switch.save_state && self.kill_switch.snapshot_path.is_none() {
            return fail("safety.kill_switch.save_state requires snapshot_path".into());
        }
        if self.thresholds.is_empty() {
            return fail("safety.thresholds must define at least one threshold".into());
        }
        let mut seen = HashSet::new();
        for threshold in &self.thresholds {
            threshold
                .validate()
                .map_err(|e| GovernanceError::Configuration(format!("safety.thresholds: {e}")))?;
            if !seen.insert(threshold.name.as_str()) {
                return fail(format!(
                    "safety.thresholds: duplicate threshold name {:?}",
                    threshold.name
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threshold::{Metric, Operator, SafetyLevel};

    fn cpu_threshold(name: &str) -> Threshold {
        Threshold {
            name: name.into(),
            metric: Metric::Cpu,
            operator: Operator::Gt,
            value: 95.0,
            severity: SafetyLevel::Emergency,
            grace_period_ms: 0,
            auto_escalate: false,
        }
    }

    #[test]
    fn defaults_need_thresholds() {
        let mut cfg = SafetyConfig::default();
        assert!(cfg.validate().is_err());
        cfg.thresholds.push(cpu_threshold("cpu"));
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.circuit_breaker.success_threshold, 3);
        assert_eq!(cfg.kill_switch.cooldown(), Duration::from_secs(300));
    }

    #[test]
    fn duplicate_threshold_names_rejected() {
        let cfg = SafetyConfig {
            thresholds: vec![cpu_threshold("cpu"), cpu_threshold("cpu")],
            ..SafetyConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn save_state_requires_a_path() {
        let mut cfg = SafetyConfig {
            thresholds: vec![cpu_threshold("cpu")],
            ..SafetyConfig::default()
        };
        cfg.kill_switch.save_state = true;
        assert!(cfg.validate().is_err());
        cfg.kill_switch.snapshot_path = Some("snap.json".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_document_fills_defaults() {
        let cfg: SafetyConfig = serde_json::from_str(
            r#"{"max_concurrent_agents":4,"circuit_breaker":{"failure_threshold":2}}"#,
        )
        .unwrap();
        assert_eq!(cfg.max_concurrent_agents, 4);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 2);
        assert_eq!(cfg.circuit_breaker.cooldown_ms, 30_000);
        assert_eq!(cfg.health.max_actions_per_minute, 600);
    }
}
