//! Thresholds, safety levels and breach tracking.
//!
//! Thresholds are evaluated in configuration order for every scope (the
//! whole system, then each agent). A threshold *fires* once its condition has
//! held for the threshold's grace period; a threshold with `auto_escalate`
//! that keeps firing for enough consecutive cycles fires one level higher.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Vocabulary
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Percent.
    Cpu,
    /// Percent.
    Memory,
    /// Fraction of failed operations in the window, `0.0..=1.0`.
    ErrorRate,
    /// Milliseconds.
    Latency,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cpu => "cpu",
            Metric::Memory => "memory",
            Metric::ErrorRate => "error_rate",
            Metric::Latency => "latency",
        }
    }

    /// `true` for cpu and memory, which are answered with resource
    /// interventions; error rate and latency are answered with behavioural
    /// ones.
    pub fn is_resource_class(&self) -> bool {
        matches!(self, Metric::Cpu | Metric::Memory)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
}

impl Operator {
    pub fn holds(&self, observed: f64, boundary: f64) -> bool {
        match self {
            Operator::Gt => observed > boundary,
            Operator::Ge => observed >= boundary,
            Operator::Lt => observed < boundary,
            Operator::Le => observed <= boundary,
            Operator::Eq => (observed - boundary).abs() < f64::EPSILON,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Eq => "==",
        }
    }
}

/// Overall safety level, ordered from calm to emergency.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    #[default]
    Normal,
    Caution,
    Warning,
    Critical,
    Emergency,
}

impl SafetyLevel {
    /// One level up, capped at `Emergency`.
    pub fn escalated(&self) -> Self {
        match self {
            SafetyLevel::Normal => SafetyLevel::Caution,
            SafetyLevel::Caution => SafetyLevel::Warning,
            SafetyLevel::Warning => SafetyLevel::Critical,
            SafetyLevel::Critical | SafetyLevel::Emergency => SafetyLevel::Emergency,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyLevel::Normal => "normal",
            SafetyLevel::Caution => "caution",
            SafetyLevel::Warning => "warning",
            SafetyLevel::Critical => "critical",
            SafetyLevel::Emergency => "emergency",
        }
    }
}

impl fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One operator-supplied threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub name: String,
    pub metric: Metric,
    pub operator: Operator,
    pub value: f64,
    pub severity: SafetyLevel,
    #[serde(default)]
    pub grace_period_ms: u64,
    #[serde(default)]
    pub auto_escalate: bool,
}

impl Threshold {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("threshold name must not be empty".into());
        }
        if !self.value.is_finite() {
            return Err(format!("threshold {}: value must be finite", self.name));
        }
        if self.severity == SafetyLevel::Normal {
            return Err(format!(
                "threshold {}: severity must be caution, warning, critical or emergency",
                self.name
            ));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Breach tracking
// ────────────────────────────────────────────────────────────────────────────

/// Where a breach was observed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum Scope {
    System,
    Agent(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::System => f.write_str("system"),
            Scope::Agent(id) => write!(f, "agent:{id}"),
        }
    }
}

/// A threshold that fired this cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breach {
    pub scope: Scope,
    pub threshold: String,
    pub metric: Metric,
    pub observed: f64,
    pub boundary: f64,
    /// Effective severity after auto-escalation.
    pub severity: SafetyLevel,
    pub escalated: bool,
    /// `true` the first cycle it fires at this severity.
    pub is_new: bool,
}

#[derive(Debug, Default)]
struct TrackState {
    since: Option<Instant>,
    fired_cycles: u32,
    last_fired: Option<SafetyLevel>,
}

/// Grace-period and escalation bookkeeping per (scope, threshold).
#[derive(Debug, Default)]
pub struct BreachTracker {
    states: HashMap<(Scope, String), TrackState>,
}

impl BreachTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate every threshold for `scope`. `value` yields the scope's
    /// current reading per metric; metrics with no reading do not fire.
    pub fn evaluate(
        &mut self,
        scope: &Scope,
        thresholds: &[Threshold],
        value: impl Fn(Metric) -> Option<f64>,
        escalate_after_cycles: u32,
        now: Instant,
    ) -> Vec<Breach> {
        let mut breaches = Vec::new();
        for threshold in thresholds {
            let key = (scope.clone(), threshold.name.clone());
            let observed = value(threshold.metric);
            let holding = observed.is_some_and(|v| threshold.operator.holds(v, threshold.value));
            if !holding {
                self.states.remove(&key);
                continue;
            }

            let state = self.states.entry(key).or_default();
            let since = *state.since.get_or_insert(now);
            if now.saturating_duration_since(since) < threshold.grace_period() {
                continue;
            }

            state.fired_cycles += 1;
            let escalated = threshold.auto_escalate
                && escalate_after_cycles > 0
                && state.fired_cycles > escalate_after_cycles;
            let severity = if escalated {
                threshold.severity.escalated()
            } else {
                threshold.severity
            };
            let is_new = state.last_fired != Some(severity);
            state.last_fired = Some(severity);

            breaches.push(Breach {
                scope: scope.clone(),
                threshold: threshold.name.clone(),
                metric: threshold.metric,
                observed: observed.unwrap_or_default(),
                boundary: threshold.value,
                severity,
                escalated,
                is_new,
            });
        }
        breaches
    }

    /// Drop all state for `scope` (agent unregistered or restarted).
    pub fn forget(&mut self, scope: &Scope) {
        self.states.retain(|(s, _), _| s != scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn threshold(severity: SafetyLevel, grace_ms: u64, auto_escalate: bool) -> Threshold {
        Threshold {
            name: "cpu-high".into(),
            metric: Metric::Cpu,
            operator: Operator::Gt,
            value: 90.0,
            severity,
            grace_period_ms: grace_ms,
            auto_escalate,
        }
    }

    #[test]
    fn operators() {
        assert!(Operator::Gt.holds(96.0, 95.0));
        assert!(!Operator::Gt.holds(95.0, 95.0));
        assert!(Operator::Ge.holds(95.0, 95.0));
        assert!(Operator::Lt.holds(1.0, 2.0));
        assert!(Operator::Le.holds(2.0, 2.0));
        assert!(Operator::Eq.holds(0.5, 0.5));
    }

    #[test]
    fn levels_are_ordered_and_escalation_caps() {
        assert!(SafetyLevel::Normal < SafetyLevel::Caution);
        assert!(SafetyLevel::Critical < SafetyLevel::Emergency);
        assert_eq!(SafetyLevel::Emergency.escalated(), SafetyLevel::Emergency);
        assert_eq!(SafetyLevel::Warning.escalated(), SafetyLevel::Critical);
    }

    #[test]
    fn threshold_deserialises_operator_symbols() {
        let t: Threshold = serde_json::from_str(
            r#"{"name":"e","metric":"error_rate","operator":">=","value":0.5,"severity":"critical"}"#,
        )
        .unwrap();
        assert_eq!(t.operator, Operator::Ge);
        assert_eq!(t.metric, Metric::ErrorRate);
        assert_eq!(t.grace_period_ms, 0);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn normal_severity_is_invalid() {
        assert!(threshold(SafetyLevel::Normal, 0, false).validate().is_err());
    }

    #[test]
    fn fires_immediately_without_grace() {
        let mut tracker = BreachTracker::new();
        let t = [threshold(SafetyLevel::Warning, 0, false)];
        let breaches = tracker.evaluate(&Scope::System, &t, |_| Some(95.0), 3, Instant::now());
        assert_eq!(breaches.len(), 1);
        assert!(breaches[0].is_new);

        let again = tracker.evaluate(&Scope::System, &t, |_| Some(95.0), 3, Instant::now());
        assert!(!again[0].is_new);
    }

    #[test]
    fn grace_period_delays_firing() {
        let mut tracker = BreachTracker::new();
        let t = [threshold(SafetyLevel::Warning, 30, false)];
        assert!(tracker
            .evaluate(&Scope::System, &t, |_| Some(95.0), 3, Instant::now())
            .is_empty());
        thread::sleep(Duration::from_millis(40));
        assert_eq!(
            tracker
                .evaluate(&Scope::System, &t, |_| Some(95.0), 3, Instant::now())
                .len(),
            1
        );
    }

    #[test]
    fn recovery_resets_grace() {
        let mut tracker = BreachTracker::new();
        let t = [threshold(SafetyLevel::Warning, 30, false)];
        tracker.evaluate(&Scope::System, &t, |_| Some(95.0), 3, Instant::now());
        tracker.evaluate(&Scope::System, &t, |_| Some(10.0), 3, Instant::now());
        thread::sleep(Duration::from_millis(40));
        // The clock restarted on the second breach.
        assert!(tracker
            .evaluate(&Scope::System, &t, |_| Some(95.0), 3, Instant::now())
            .is_empty());
    }

    #[test]
    fn persistent_breach_auto_escalates() {
        let mut tracker = BreachTracker::new();
        let t = [threshold(SafetyLevel::Warning, 0, true)];
        let scope = Scope::Agent("a".into());
        for _ in 0..2 {
            let b = tracker.evaluate(&scope, &t, |_| Some(99.0), 2, Instant::now());
            assert_eq!(b[0].severity, SafetyLevel::Warning);
        }
        let b = tracker.evaluate(&scope, &t, |_| Some(99.0), 2, Instant::now());
        assert_eq!(b[0].severity, SafetyLevel::Critical);
        assert!(b[0].escalated);
        assert!(b[0].is_new);
    }

    #[test]
    fn missing_reading_never_fires() {
        let mut tracker = BreachTracker::new();
        let t = [threshold(SafetyLevel::Emergency, 0, false)];
        assert!(tracker
            .evaluate(&Scope::System, &t, |_| None, 3, Instant::now())
            .is_empty());
    }
}
