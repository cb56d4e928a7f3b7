//! [`HealthVerifier`] – agent health rule engine.
//!
//! Health rules look at an agent's liveness clock rather than its metrics:
//! how long it has been running, how long it has been silent and how fast it
//! is acting. Rules are evaluated in insertion order and the first one that
//! objects decides the intervention.
//!
//! Three built-in rules are provided:
//! - [`MaxRuntimeRule`] – terminate agents that have run too long.
//! - [`MaxIdleRule`] – terminate agents that stopped reporting.
//! - [`ActionRateRule`] – throttle agents acting too quickly.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::HealthConfig;
use crate::intervention::InterventionKind;
use crate::watchdog::AgentClock;

/// A rule objected to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthFinding {
    pub rule: String,
    pub action: InterventionKind,
    pub detail: String,
}

pub trait HealthRule: Send + Sync {
    fn name(&self) -> &str;

    /// `Some` when the agent violates the rule.
    fn check(&self, clock: &AgentClock, now: Instant) -> Option<HealthFinding>;
}

#[derive(Default)]
pub struct HealthVerifier {
    rules: Vec<Box<dyn HealthRule>>,
}

impl HealthVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// The three built-in rules, configured from `config`. A limit of zero
    /// disables its rule.
    pub fn from_config(config: &HealthConfig) -> Self {
        let mut verifier = Self::new();
        if config.max_runtime_secs > 0 {
            verifier.add_rule(Box::new(MaxRuntimeRule {
                max_runtime: Duration::from_secs(config.max_runtime_secs),
            }));
        }
        if config.max_idle_secs > 0 {
            verifier.add_rule(Box::new(MaxIdleRule {
                max_idle: Duration::from_secs(config.max_idle_secs),
            }));
        }
        if config.max_actions_per_minute > 0 {
            verifier.add_rule(Box::new(ActionRateRule {
                max_actions_per_minute: config.max_actions_per_minute,
            }));
        }
        verifier
    }

    pub fn add_rule(&mut self, rule: Box<dyn HealthRule>) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First finding across the rules, in insertion order.
    pub fn verify(&self, clock: &AgentClock, now: Instant) -> Option<HealthFinding> {
        self.rules.iter().find_map(|rule| rule.check(clock, now))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

pub struct MaxRuntimeRule {
    pub max_runtime: Duration,
}

impl HealthRule for MaxRuntimeRule {
    fn name(&self) -> &str {
        "max_runtime"
    }

    fn check(&self, clock: &AgentClock, now: Instant) -> Option<HealthFinding> {
        let runtime = clock.runtime(now);
        (runtime > self.max_runtime).then(|| HealthFinding {
            rule: self.name().to_string(),
            action: InterventionKind::Terminate,
            detail: format!(
                "runtime {}s exceeds limit {}s",
                runtime.as_secs(),
                self.max_runtime.as_secs()
            ),
        })
    }
}

pub struct MaxIdleRule {
    pub max_idle: Duration,
}

impl HealthRule for MaxIdleRule {
    fn name(&self) -> &str {
        "max_idle"
    }

    fn check(&self, clock: &AgentClock, now: Instant) -> Option<HealthFinding> {
        let idle = clock.idle(now);
        (idle > self.max_idle).then(|| HealthFinding {
            rule: self.name().to_string(),
            action: InterventionKind::Terminate,
            detail: format!(
                "idle for {}s, limit {}s",
                idle.as_secs(),
                self.max_idle.as_secs()
            ),
        })
    }
}

pub struct ActionRateRule {
    pub max_actions_per_minute: u64,
}

impl HealthRule for ActionRateRule {
    fn name(&self) -> &str {
        "action_rate"
    }

    fn check(&self, clock: &AgentClock, now: Instant) -> Option<HealthFinding> {
        let actions = clock.actions_in_window(now);
        (actions > self.max_actions_per_minute).then(|| HealthFinding {
            rule: self.name().to_string(),
            action: InterventionKind::Throttle,
            detail: format!(
                "{actions} actions in the last minute, limit {}",
                self.max_actions_per_minute
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::Watchdog;

    fn clock_with_actions(actions: u32) -> (Watchdog, Instant) {
        let mut wd = Watchdog::new();
        wd.register("a");
        let now = Instant::now();
        wd.touch("a", actions, now);
        (wd, now)
    }

    #[test]
    fn empty_verifier_finds_nothing() {
        let (wd, now) = clock_with_actions(1_000);
        assert!(HealthVerifier::new().verify(wd.clock("a").unwrap(), now).is_none());
    }

    #[test]
    fn action_rate_throttles() {
        let (wd, now) = clock_with_actions(11);
        let mut v = HealthVerifier::new();
        v.add_rule(Box::new(ActionRateRule {
            max_actions_per_minute: 10,
        }));
        let finding = v.verify(wd.clock("a").unwrap(), now).unwrap();
        assert_eq!(finding.action, InterventionKind::Throttle);
        assert_eq!(finding.rule, "action_rate");
    }

    #[test]
    fn idle_agent_is_terminated() {
        let (wd, now) = clock_with_actions(0);
        let mut v = HealthVerifier::new();
        v.add_rule(Box::new(MaxIdleRule {
            max_idle: Duration::from_secs(5),
        }));
        let later = now + Duration::from_secs(6);
        let finding = v.verify(wd.clock("a").unwrap(), later).unwrap();
        assert_eq!(finding.action, InterventionKind::Terminate);
    }

    #[test]
    fn first_rule_wins() {
        let (wd, now) = clock_with_actions(100);
        let mut v = HealthVerifier::new();
        v.add_rule(Box::new(MaxRuntimeRule {
            max_runtime: Duration::from_secs(1),
        }));
        v.add_rule(Box::new(ActionRateRule {
            max_actions_per_minute: 10,
        }));
        let later = now + Duration::from_secs(2);
        assert_eq!(
            v.verify(wd.clock("a").unwrap(), later).unwrap().rule,
            "max_runtime"
        );
    }

    #[test]
    fn zero_limits_disable_rules() {
        let config = HealthConfig {
            max_runtime_secs: 0,
            max_idle_secs: 0,
            max_actions_per_minute: 0,
            throttle_actions_per_minute: 10,
        };
        assert!(HealthVerifier::from_config(&config).is_empty());
        assert_eq!(HealthVerifier::from_config(&HealthConfig::default()).len(), 3);
    }
}
