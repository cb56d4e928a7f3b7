//! [`SafetyMonitor`] – per-agent supervision, threshold evaluation and
//! escalating interventions.
//!
//! All mutable monitor state lives behind one lock; the kill switch has its
//! own. Calls out of the monitor (the host's [`AgentController`], the
//! allocator's [`ResourceControl`]) are always made with both locks released.
//! The audit sink is a leaf and may be called with the state lock held.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use overwatch_types::{
    ActorType, AuditEvent, AuditEventType, AuditSeverity, AuditSink, EmergencyReleaseSummary,
    GovernanceError, ResourceControl,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertBus, AlertKind, SafetyAlert};
use crate::circuit_breaker::{BreakerTransition, CircuitBreaker, CircuitState};
use crate::config::SafetyConfig;
use crate::health::{HealthFinding, HealthVerifier};
use crate::intervention::{AgentController, InterventionKind, InterventionRecord};
use crate::kill_switch::{KillSwitch, KillSwitchState};
use crate::metrics::{AgentMetrics, MetricWindow, pooled_mean};
use crate::threshold::{Breach, BreachTracker, Metric, SafetyLevel, Scope};
use crate::watchdog::Watchdog;

/// Upper bound on an emergency stop raised by the monitor itself.
pub const EMERGENCY_STOP_TIMEOUT: Duration = Duration::from_secs(10);

// ────────────────────────────────────────────────────────────────────────────
// Activity reports
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// One batch of observations for an agent.
///
/// ```
/// use overwatch_safety::ActivityReport;
///
/// let report = ActivityReport::success().cpu(42.0).latency(120.0).actions(3);
/// assert_eq!(report.actions, 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityReport {
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
    pub latency_ms: Option<f64>,
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub actions: u32,
}

impl ActivityReport {
    pub fn success() -> Self {
        Self {
            outcome: Some(Outcome::Success),
            ..Self::default()
        }
    }

    pub fn failure() -> Self {
        Self {
            outcome: Some(Outcome::Failure),
            ..Self::default()
        }
    }

    pub fn cpu(mut self, percent: f64) -> Self {
        self.cpu = Some(percent);
        self
    }

    pub fn memory(mut self, percent: f64) -> Self {
        self.memory = Some(percent);
        self
    }

    pub fn latency(mut self, ms: f64) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    pub fn actions(mut self, n: u32) -> Self {
        self.actions = n;
        self
    }

    fn validate(&self) -> Result<(), GovernanceError> {
        for (name, value) in [
            ("cpu", self.cpu),
            ("memory", self.memory),
            ("latency_ms", self.latency_ms),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(GovernanceError::Validation(format!(
                        "{name} must be a non-negative number, got {v}"
                    )));
                }
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Snapshots and reports
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub team: Option<String>,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    /// Seconds since the last reported failure, if any.
    pub last_failure_secs: Option<u64>,
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
    pub latency_ms: Option<f64>,
    pub error_rate: Option<f64>,
    pub paused: bool,
    pub throttled_to: Option<u32>,
    pub resource_limited: bool,
    pub runtime_secs: u64,
    pub idle_secs: u64,
    pub actions_last_minute: u64,
    pub last_intervention: Option<InterventionKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
    pub error_rate: Option<f64>,
    pub latency_ms: Option<f64>,
}

impl SystemMetrics {
    fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Cpu => self.cpu,
            Metric::Memory => self.memory,
            Metric::ErrorRate => self.error_rate,
            Metric::Latency => self.latency_ms,
        }
    }
}

/// Point-in-time copy of the monitor's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub taken_at: DateTime<Utc>,
    pub level: SafetyLevel,
    pub kill_switch: KillSwitchState,
    /// When and why the kill switch last fired.
    pub last_emergency: Option<(DateTime<Utc>, String)>,
    pub system: SystemMetrics,
    pub agents: Vec<AgentStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmergencyStopReport {
    pub reason: String,
    /// Agents confirmed stopped (all terminations here are forced).
    pub force_terminated: Vec<String>,
    /// Agents that could not be stopped before the timeout.
    pub incomplete: Vec<String>,
    pub release: Option<EmergencyReleaseSummary>,
    pub audit_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub paused: Vec<String>,
    /// Stopped cooperatively within the timeout.
    pub terminated: Vec<String>,
    /// Stopped with `force` after the timeout or a cooperative failure.
    pub force_terminated: Vec<String>,
    /// Could not be stopped at all.
    pub incomplete: Vec<String>,
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_error: Option<String>,
    pub audit_error: Option<String>,
}

/// What one evaluation cycle observed and did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub previous_level: SafetyLevel,
    pub level: SafetyLevel,
    pub breaches: Vec<Breach>,
    pub health: Vec<(String, HealthFinding)>,
    pub interventions: Vec<InterventionRecord>,
    pub emergency: Option<EmergencyStopReport>,
    /// Actions the cycle wanted but could not carry out.
    pub failures: Vec<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

struct Throttle {
    actions_per_minute: u32,
    limiter: DefaultDirectRateLimiter,
}

struct AgentMonitor {
    team: Option<String>,
    metrics: AgentMetrics,
    breaker: CircuitBreaker,
    paused: bool,
    resource_limited: bool,
    throttle: Option<Throttle>,
    last_intervention: Option<InterventionKind>,
}

impl AgentMonitor {
    fn already_applied(&self, kind: InterventionKind) -> bool {
        match kind {
            InterventionKind::Throttle => self.throttle.is_some(),
            InterventionKind::ResourceLimit => self.resource_limited,
            InterventionKind::Pause => self.paused,
            _ => false,
        }
    }
}

struct MonitorState {
    agents: HashMap<String, AgentMonitor>,
    watchdog: Watchdog,
    tracker: BreachTracker,
    system_cpu: MetricWindow,
    system_memory: MetricWindow,
    level: SafetyLevel,
}

impl MonitorState {
    fn system_metrics(&self) -> SystemMetrics {
        SystemMetrics {
            cpu: self.system_cpu.mean(),
            memory: self.system_memory.mean(),
            error_rate: pooled_mean(self.agents.values().map(|a| &a.metrics.errors)),
            latency_ms: pooled_mean(self.agents.values().map(|a| &a.metrics.latency)),
        }
    }

    fn status(&self, agent_id: &str, agent: &AgentMonitor, now: Instant) -> AgentStatus {
        let clock = self.watchdog.clock(agent_id);
        AgentStatus {
            agent_id: agent_id.to_string(),
            team: agent.team.clone(),
            circuit: agent.breaker.state(),
            consecutive_failures: agent.breaker.failure_count(),
            last_failure_secs: agent
                .breaker
                .last_failure()
                .map(|t| now.saturating_duration_since(t).as_secs()),
            cpu: agent.metrics.value(Metric::Cpu),
            memory: agent.metrics.value(Metric::Memory),
            latency_ms: agent.metrics.value(Metric::Latency),
            error_rate: agent.metrics.value(Metric::ErrorRate),
            paused: agent.paused,
            throttled_to: agent.throttle.as_ref().map(|t| t.actions_per_minute),
            resource_limited: agent.resource_limited,
            runtime_secs: clock.map_or(0, |c| c.runtime(now).as_secs()),
            idle_secs: clock.map_or(0, |c| c.idle(now).as_secs()),
            actions_last_minute: clock.map_or(0, |c| c.actions_in_window(now)),
            last_intervention: agent.last_intervention,
        }
    }

    fn forget(&mut self, agent_id: &str) {
        self.agents.remove(agent_id);
        self.watchdog.forget(agent_id);
        self.tracker.forget(&Scope::Agent(agent_id.to_string()));
    }
}

fn audit_severity(level: SafetyLevel) -> AuditSeverity {
    match level {
        SafetyLevel::Normal | SafetyLevel::Caution => AuditSeverity::Info,
        SafetyLevel::Warning => AuditSeverity::Warning,
        SafetyLevel::Critical => AuditSeverity::Error,
        SafetyLevel::Emergency => AuditSeverity::Critical,
    }
}

fn intervention_severity(kind: InterventionKind) -> AuditSeverity {
    match kind {
        InterventionKind::Throttle | InterventionKind::ResourceLimit => AuditSeverity::Warning,
        InterventionKind::Pause | InterventionKind::Restart | InterventionKind::Terminate => {
            AuditSeverity::Error
        }
        InterventionKind::EmergencyStop => AuditSeverity::Critical,
    }
}

/// Intervention for a breach at `severity` on a metric of the given class.
/// `None` means alert only.
fn mapped_intervention(scope: &Scope, metric: Metric, severity: SafetyLevel) -> Option<InterventionKind> {
    match (severity, scope, metric.is_resource_class()) {
        (SafetyLevel::Normal | SafetyLevel::Caution, _, _) => None,
        (SafetyLevel::Emergency, _, _) => Some(InterventionKind::EmergencyStop),
        (SafetyLevel::Warning, Scope::System, _) => Some(InterventionKind::Throttle),
        (SafetyLevel::Critical, Scope::System, _) => Some(InterventionKind::Pause),
        (SafetyLevel::Warning, Scope::Agent(_), true) => Some(InterventionKind::ResourceLimit),
        (SafetyLevel::Warning, Scope::Agent(_), false) => Some(InterventionKind::Throttle),
        (SafetyLevel::Critical, Scope::Agent(_), true) => Some(InterventionKind::Pause),
        (SafetyLevel::Critical, Scope::Agent(_), false) => Some(InterventionKind::Restart),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SafetyMonitor
// ────────────────────────────────────────────────────────────────────────────

pub struct SafetyMonitor {
    config: SafetyConfig,
    health: HealthVerifier,
    state: Mutex<MonitorState>,
    kill_switch: Mutex<KillSwitch>,
    controller: Arc<dyn AgentController>,
    audit: Arc<dyn AuditSink>,
    resources: Option<Arc<dyn ResourceControl>>,
    preserve_critical: bool,
    alerts: AlertBus,
}

impl SafetyMonitor {
    pub fn new(
        config: SafetyConfig,
        controller: Arc<dyn AgentController>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, GovernanceError> {
        config.validate()?;
        let window = config.metric_window;
        Ok(Self {
            health: HealthVerifier::from_config(&config.health),
            kill_switch: Mutex::new(KillSwitch::new(config.kill_switch.cooldown())),
            state: Mutex::new(MonitorState {
                agents: HashMap::new(),
                watchdog: Watchdog::new(),
                tracker: BreachTracker::new(),
                system_cpu: MetricWindow::new(window),
                system_memory: MetricWindow::new(window),
                level: SafetyLevel::Normal,
            }),
            config,
            controller,
            audit,
            resources: None,
            preserve_critical: false,
            alerts: AlertBus::default(),
        })
    }

    /// Wire the allocator so resource interventions and emergency stops can
    /// reach it. `preserve_critical` is passed through to its emergency
    /// release.
    pub fn with_resource_control(
        mut self,
        resources: Arc<dyn ResourceControl>,
        preserve_critical: bool,
    ) -> Self {
        self.resources = Some(resources);
        self.preserve_critical = preserve_critical;
        self
    }

    /// Replace the health rule set (the built-ins come from configuration).
    pub fn with_health_rules(mut self, health: HealthVerifier) -> Self {
        self.health = health;
        self
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    pub fn alerts(&self) -> &AlertBus {
        &self.alerts
    }

    fn record(&self, event: AuditEvent) -> Result<u64, GovernanceError> {
        self.audit.record(event)
    }

    /// Record an event whose governed change has already happened. The
    /// failure is logged here and handed back for the caller to surface.
    #[must_use]
    fn record_after(&self, event: AuditEvent) -> Option<String> {
        let event_type = event.event_type.clone();
        match self.audit.record(event) {
            Ok(_) => None,
            Err(e) => {
                error!(event = %event_type, error = %e, "Safety event could not be recorded");
                Some(e.to_string())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    pub fn register_agent(&self, agent_id: &str) -> Result<(), GovernanceError> {
        self.register_agent_for_team(agent_id, None)
    }

    /// Register an agent, optionally tied to the team whose allocations a
    /// ResourceLimit intervention should release.
    pub fn register_agent_for_team(
        &self,
        agent_id: &str,
        team: Option<&str>,
    ) -> Result<(), GovernanceError> {
        if agent_id.trim().is_empty() {
            return Err(GovernanceError::Validation("agent id must not be empty".into()));
        }
        let mut state = self.state.lock();
        if state.agents.contains_key(agent_id) {
            return Err(GovernanceError::Validation(format!(
                "agent {agent_id} is already registered"
            )));
        }
        if state.agents.len() >= self.config.max_concurrent_agents {
            return Err(GovernanceError::CapacityExhausted(format!(
                "max_concurrent_agents ({}) reached",
                self.config.max_concurrent_agents
            )));
        }

        self.record(
            AuditEvent::new(AuditEventType::AgentRegistered, AuditSeverity::Info)
                .actor(ActorType::Agent, agent_id)
                .payload(json!({ "team": team })),
        )?;

        state.agents.insert(
            agent_id.to_string(),
            AgentMonitor {
                team: team.map(str::to_string),
                metrics: AgentMetrics::new(self.config.metric_window),
                breaker: CircuitBreaker::new(self.config.circuit_breaker.clone()),
                paused: false,
                resource_limited: false,
                throttle: None,
                last_intervention: None,
            },
        );
        state.watchdog.register(agent_id);
        info!(agent = %agent_id, team = ?team, "Agent registered");
        Ok(())
    }

    pub fn unregister_agent(&self, agent_id: &str) -> Result<(), GovernanceError> {
        let mut state = self.state.lock();
        if !state.agents.contains_key(agent_id) {
            return Err(GovernanceError::NotFound(format!("agent {agent_id}")));
        }
        self.record(
            AuditEvent::new(AuditEventType::AgentUnregistered, AuditSeverity::Info)
                .actor(ActorType::Agent, agent_id),
        )?;
        state.forget(agent_id);
        info!(agent = %agent_id, "Agent unregistered");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Observations
    // -----------------------------------------------------------------------

    pub fn report_activity(
        &self,
        agent_id: &str,
        report: ActivityReport,
    ) -> Result<(), GovernanceError> {
        report.validate()?;
        let now = Instant::now();
        let transition = {
            let mut state = self.state.lock();
            let agent = state
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| GovernanceError::NotFound(format!("agent {agent_id}")))?;
            if let Some(v) = report.cpu {
                agent.metrics.cpu.push(v);
            }
            if let Some(v) = report.memory {
                agent.metrics.memory.push(v);
            }
            if let Some(v) = report.latency_ms {
                agent.metrics.latency.push(v);
            }
            let transition = match report.outcome {
                Some(Outcome::Success) => {
                    agent.metrics.errors.push(0.0);
                    agent.breaker.record_success()
                }
                Some(Outcome::Failure) => {
                    agent.metrics.errors.push(1.0);
                    agent.breaker.record_failure()
                }
                None => agent.breaker.poll(),
            };
            state.watchdog.touch(agent_id, report.actions, now);
            transition
        };
        if let Some(t) = transition {
            self.on_breaker_transition(agent_id, t);
        }
        Ok(())
    }

    /// Host-level cpu and memory readings (percent).
    pub fn report_system_metrics(&self, cpu: f64, memory: f64) -> Result<(), GovernanceError> {
        for (name, v) in [("cpu", cpu), ("memory", memory)] {
            if !v.is_finite() || v < 0.0 {
                return Err(GovernanceError::Validation(format!(
                    "system {name} must be a non-negative number, got {v}"
                )));
            }
        }
        let mut state = self.state.lock();
        state.system_cpu.push(cpu);
        state.system_memory.push(memory);
        Ok(())
    }

    fn on_breaker_transition(&self, agent_id: &str, transition: BreakerTransition) {
        let (event_type, severity, kind, level) = match transition {
            BreakerTransition::Opened => (
                AuditEventType::CircuitOpened,
                AuditSeverity::Warning,
                AlertKind::CircuitOpened {
                    agent_id: agent_id.to_string(),
                },
                SafetyLevel::Warning,
            ),
            BreakerTransition::Closed => (
                AuditEventType::CircuitClosed,
                AuditSeverity::Info,
                AlertKind::CircuitClosed {
                    agent_id: agent_id.to_string(),
                },
                SafetyLevel::Normal,
            ),
            BreakerTransition::HalfOpened => {
                debug!(agent = %agent_id, "Circuit half-open");
                return;
            }
        };
        warn!(agent = %agent_id, transition = ?transition, "Circuit breaker changed state");
        let mut message = format!("{event_type} for {agent_id}");
        if let Some(e) = self.record_after(
            AuditEvent::new(event_type.clone(), severity).actor(ActorType::Agent, agent_id),
        ) {
            message.push_str(&format!(" (not recorded: {e})"));
        }
        self.alerts.publish(SafetyAlert::new(level, kind, message));
    }

    // -----------------------------------------------------------------------
    // Gates and status
    // -----------------------------------------------------------------------

    /// `true` while the agent's breaker lets operations through.
    pub fn check_circuit_breaker(&self, agent_id: &str) -> Result<bool, GovernanceError> {
        let (allowed, transition) = {
            let mut state = self.state.lock();
            let agent = state
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| GovernanceError::NotFound(format!("agent {agent_id}")))?;
            agent.breaker.allows()
        };
        if let Some(t) = transition {
            self.on_breaker_transition(agent_id, t);
        }
        Ok(allowed)
    }

    /// Full gate for one operation: kill switch, pause, breaker and throttle.
    /// A `true` answer consumes one throttle permit, and a half-open trial
    /// slot while the breaker is probing.
    pub fn allow_operation(&self, agent_id: &str) -> Result<bool, GovernanceError> {
        if self.kill_switch.lock().is_triggered() {
            return Ok(false);
        }
        let (allowed, transition) = {
            let mut state = self.state.lock();
            let agent = state
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| GovernanceError::NotFound(format!("agent {agent_id}")))?;
            if agent.paused {
                (false, None)
            } else {
                let (open, transition) = agent.breaker.allows();
                let permitted = open
                    && agent
                        .throttle
                        .as_ref()
                        .is_none_or(|t| t.limiter.check().is_ok())
                    && agent.breaker.acquire().0;
                (permitted, transition)
            }
        };
        if let Some(t) = transition {
            self.on_breaker_transition(agent_id, t);
        }
        Ok(allowed)
    }

    pub fn check_status(&self) -> SafetyLevel {
        if self.kill_switch.lock().is_triggered() {
            return SafetyLevel::Emergency;
        }
        self.state.lock().level
    }

    pub fn agent_status(&self, agent_id: &str) -> Result<AgentStatus, GovernanceError> {
        let state = self.state.lock();
        let agent = state
            .agents
            .get(agent_id)
            .ok_or_else(|| GovernanceError::NotFound(format!("agent {agent_id}")))?;
        Ok(state.status(agent_id, agent, Instant::now()))
    }

    /// Every registered agent, ordered by id.
    pub fn agents(&self) -> Vec<AgentStatus> {
        let state = self.state.lock();
        let now = Instant::now();
        let mut out: Vec<_> = state
            .agents
            .iter()
            .map(|(id, agent)| state.status(id, agent, now))
            .collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    pub fn kill_switch_state(&self) -> KillSwitchState {
        self.kill_switch.lock().state()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let (kill_switch, last_emergency) = {
            let ks = self.kill_switch.lock();
            (ks.state(), ks.last_trigger().cloned())
        };
        let (level, system) = {
            let state = self.state.lock();
            (state.level, state.system_metrics())
        };
        MonitorSnapshot {
            taken_at: Utc::now(),
            level: if kill_switch == KillSwitchState::EmergencyTriggered {
                SafetyLevel::Emergency
            } else {
                level
            },
            kill_switch,
            last_emergency,
            system,
            agents: self.agents(),
        }
    }

    // -----------------------------------------------------------------------
    // Evaluation cycle
    // -----------------------------------------------------------------------

    /// Evaluate thresholds and health rules, update the safety level and
    /// carry out the resulting interventions.
    pub fn run_cycle(&self) -> CycleReport {
        let now = Instant::now();
        let triggered = self.kill_switch.lock().is_triggered();

        // Decide under the lock, act after releasing it.
        let (previous_level, level, breaches, health, plan) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let system = state.system_metrics();
            let escalate_after = self.config.auto_escalate_after_cycles;

            let mut breaches = state.tracker.evaluate(
                &Scope::System,
                &self.config.thresholds,
                |m| system.value(m),
                escalate_after,
                now,
            );
            let mut ids: Vec<String> = state.agents.keys().cloned().collect();
            ids.sort();
            for id in &ids {
                let Some(agent) = state.agents.get(id) else {
                    continue;
                };
                breaches.extend(state.tracker.evaluate(
                    &Scope::Agent(id.clone()),
                    &self.config.thresholds,
                    |m| agent.metrics.value(m),
                    escalate_after,
                    now,
                ));
            }

            let health: Vec<(String, HealthFinding)> = ids
                .iter()
                .filter_map(|id| {
                    let clock = state.watchdog.clock(id)?;
                    self.health.verify(clock, now).map(|f| (id.clone(), f))
                })
                .collect();

            let mut level = breaches
                .iter()
                .map(|b| b.severity)
                .max()
                .unwrap_or(SafetyLevel::Normal);
            if triggered {
                level = SafetyLevel::Emergency;
            }
            let previous_level = std::mem::replace(&mut state.level, level);

            // Most disruptive action per agent; EmergencyStop is global.
            let mut plan: HashMap<String, (InterventionKind, String)> = HashMap::new();
            let mut propose = |id: &str, kind: InterventionKind, reason: String| {
                let entry = plan
                    .entry(id.to_string())
                    .or_insert_with(|| (kind, reason.clone()));
                if kind > entry.0 {
                    *entry = (kind, reason);
                }
            };
            for breach in &breaches {
                let Some(kind) = mapped_intervention(&breach.scope, breach.metric, breach.severity)
                else {
                    continue;
                };
                let reason = format!(
                    "threshold {} ({} {} {})",
                    breach.threshold,
                    breach.metric.as_str(),
                    breach.observed,
                    breach.boundary
                );
                match (&breach.scope, kind) {
                    (_, InterventionKind::EmergencyStop) => propose("*", kind, reason),
                    (Scope::System, _) => {
                        for id in &ids {
                            propose(id, kind, reason.clone());
                        }
                    }
                    (Scope::Agent(id), _) => propose(id, kind, reason),
                }
            }
            for (id, finding) in &health {
                propose(id, finding.action, format!("{}: {}", finding.rule, finding.detail));
            }

            let mut plan: Vec<(String, InterventionKind, String)> = plan
                .into_iter()
                .filter(|(id, (kind, _))| {
                    id == "*"
                        || state
                            .agents
                            .get(id)
                            .is_some_and(|a| !a.already_applied(*kind))
                })
                .map(|(id, (kind, reason))| (id, kind, reason))
                .collect();
            plan.sort_by(|a, b| a.0.cmp(&b.0));
            (previous_level, level, breaches, health, plan)
        };

        let mut report = CycleReport {
            previous_level,
            level,
            breaches,
            health,
            interventions: Vec::new(),
            emergency: None,
            failures: Vec::new(),
        };

        let mut unrecorded_breaches = Vec::new();
        for breach in report.breaches.iter().filter(|b| b.is_new) {
            warn!(
                threshold = %breach.threshold,
                scope = %breach.scope,
                observed = breach.observed,
                severity = %breach.severity,
                "Threshold breached"
            );
            let actor = match &breach.scope {
                Scope::System => (ActorType::System, "overwatch".to_string()),
                Scope::Agent(id) => (ActorType::Agent, id.clone()),
            };
            let unrecorded = self.record_after(
                AuditEvent::new(AuditEventType::ThresholdBreached, audit_severity(breach.severity))
                    .actor(actor.0, actor.1)
                    .payload(json!({
                        "threshold": breach.threshold,
                        "metric": breach.metric.as_str(),
                        "observed": breach.observed,
                        "boundary": breach.boundary,
                        "severity": breach.severity,
                        "escalated": breach.escalated,
                    })),
            );
            if let Some(e) = unrecorded {
                unrecorded_breaches.push(format!("threshold {} not recorded: {e}", breach.threshold));
            }
            self.alerts.publish(SafetyAlert::new(
                breach.severity,
                AlertKind::ThresholdBreached {
                    threshold: breach.threshold.clone(),
                    scope: breach.scope.to_string(),
                    observed: breach.observed,
                },
                format!("threshold {} breached", breach.threshold),
            ));
        }
        report.failures.extend(unrecorded_breaches);

        if level != previous_level {
            info!(from = %previous_level, to = %level, "Safety level changed");
            if let Some(e) = self.record_after(
                AuditEvent::new(
                    AuditEventType::SafetyLevelChanged,
                    audit_severity(level.max(previous_level)),
                )
                .payload(json!({ "from": previous_level, "to": level })),
            ) {
                report.failures.push(format!("level change not recorded: {e}"));
            }
            self.alerts.publish(SafetyAlert::new(
                level,
                AlertKind::LevelChanged {
                    from: previous_level,
                    to: level,
                },
                format!("safety level {previous_level} -> {level}"),
            ));
        }

        for (agent_id, kind, reason) in plan {
            if kind == InterventionKind::EmergencyStop {
                if triggered {
                    continue;
                }
                match self.emergency_stop(&reason, EMERGENCY_STOP_TIMEOUT) {
                    Ok(stop) => report.emergency = Some(stop),
                    Err(e) => {
                        error!(error = %e, %reason, "Emergency stop refused");
                        report.failures.push(format!("emergency_stop: {e}"));
                        if let Some(audit) = self.record_after(
                            AuditEvent::new(AuditEventType::InterventionFailed, AuditSeverity::Critical)
                                .payload(json!({
                                    "action": InterventionKind::EmergencyStop,
                                    "reason": reason,
                                    "error": e.to_string(),
                                })),
                        ) {
                            report
                                .failures
                                .push(format!("emergency_stop failure not recorded: {audit}"));
                        }
                    }
                }
                continue;
            }
            // An emergency stop earlier in the plan already took every agent.
            if report.emergency.is_some() {
                break;
            }
            let record = self.intervene(&agent_id, kind, &reason);
            if !record.succeeded() {
                let mut details = record.failures.clone();
                if let Some(e) = &record.audit_error {
                    details.push(format!("not recorded: {e}"));
                }
                report
                    .failures
                    .push(format!("{kind} on {agent_id}: {}", details.join("; ")));
            }
            report.interventions.push(record);
        }

        if report.emergency.is_some() {
            report.level = SafetyLevel::Emergency;
        }
        report
    }

    // -----------------------------------------------------------------------
    // Interventions
    // -----------------------------------------------------------------------

    /// Apply `kind` to `agent_id`, retrying once and escalating on repeated
    /// failure.
    pub fn intervene(&self, agent_id: &str, kind: InterventionKind, reason: &str) -> InterventionRecord {
        let mut record = InterventionRecord {
            agent_id: agent_id.to_string(),
            requested: kind,
            applied: None,
            reason: reason.to_string(),
            attempts: 0,
            failures: Vec::new(),
            audit_error: None,
            at: Utc::now(),
        };
        let mut current = kind;
        loop {
            if current == InterventionKind::EmergencyStop {
                record.attempts += 1;
                match self.emergency_stop(reason, EMERGENCY_STOP_TIMEOUT) {
                    Ok(stop) => {
                        record.applied = Some(InterventionKind::EmergencyStop);
                        record.audit_error = stop.audit_error;
                    }
                    Err(e) => record.failures.push(format!("emergency_stop: {e}")),
                }
                return record;
            }

            let mut outcome = Err(String::new());
            for _ in 0..2 {
                record.attempts += 1;
                outcome = self.apply(agent_id, current, reason);
                if outcome.is_ok() {
                    break;
                }
            }

            match outcome {
                Ok(applied) => {
                    record.applied = Some(applied);
                    record.audit_error = self.record_after(
                        AuditEvent::new(AuditEventType::Intervention, intervention_severity(applied))
                            .actor(ActorType::Agent, agent_id)
                            .payload(json!({
                                "action": applied,
                                "requested": kind,
                                "reason": reason,
                                "attempts": record.attempts,
                            })),
                    );
                    let message = match &record.audit_error {
                        None => {
                            info!(agent = %agent_id, action = %applied, %reason, "Intervention applied");
                            format!("{applied} applied to {agent_id}")
                        }
                        Some(e) => {
                            error!(agent = %agent_id, action = %applied, error = %e, "Intervention applied but not recorded; not complete");
                            format!("{applied} applied to {agent_id} but not recorded: {e}")
                        }
                    };
                    self.alerts.publish(SafetyAlert::new(
                        self.check_status(),
                        AlertKind::Intervention {
                            agent_id: agent_id.to_string(),
                            action: applied,
                            succeeded: record.audit_error.is_none(),
                        },
                        message,
                    ));
                    return record;
                }
                Err(details) => {
                    let failure = GovernanceError::InterventionFailure {
                        kind: current.to_string(),
                        target: agent_id.to_string(),
                        details,
                    };
                    error!(error = %failure, "Intervention failed after retry");
                    if let Some(e) = self.record_after(
                        AuditEvent::new(AuditEventType::InterventionFailed, AuditSeverity::Error)
                            .actor(ActorType::Agent, agent_id)
                            .payload(json!({
                                "action": current,
                                "reason": reason,
                                "error": failure.to_string(),
                            })),
                    ) {
                        record.failures.push(format!("{current} failure not recorded: {e}"));
                    }
                    self.alerts.publish(SafetyAlert::new(
                        SafetyLevel::Critical,
                        AlertKind::Intervention {
                            agent_id: agent_id.to_string(),
                            action: current,
                            succeeded: false,
                        },
                        failure.to_string(),
                    ));
                    record.failures.push(failure.to_string());
                    match current.escalated() {
                        Some(next) => current = next,
                        None => return record,
                    }
                }
            }
        }
    }

    /// One attempt at `kind`. Returns the kind actually applied.
    fn apply(
        &self,
        agent_id: &str,
        kind: InterventionKind,
        reason: &str,
    ) -> Result<InterventionKind, String> {
        let team = {
            let state = self.state.lock();
            let agent = state
                .agents
                .get(agent_id)
                .ok_or_else(|| format!("agent {agent_id} is not registered"))?;
            agent.team.clone()
        };

        let applied = match kind {
            InterventionKind::ResourceLimit => match (team, &self.resources) {
                (Some(team), Some(resources)) => {
                    let released = resources
                        .release_team(&team, reason)
                        .map_err(|e| e.to_string())?;
                    debug!(agent = %agent_id, %team, released, "Team allocations released");
                    InterventionKind::ResourceLimit
                }
                _ => {
                    debug!(agent = %agent_id, "No team allocations to limit; throttling instead");
                    self.apply_throttle(agent_id)?;
                    InterventionKind::Throttle
                }
            },
            InterventionKind::Throttle => {
                self.apply_throttle(agent_id)?;
                InterventionKind::Throttle
            }
            InterventionKind::Pause => {
                self.controller.pause(agent_id).map_err(|e| e.to_string())?;
                InterventionKind::Pause
            }
            InterventionKind::Restart => {
                self.controller.restart(agent_id).map_err(|e| e.to_string())?;
                InterventionKind::Restart
            }
            InterventionKind::Terminate => {
                self.controller
                    .terminate(agent_id, false)
                    .map_err(|e| e.to_string())?;
                InterventionKind::Terminate
            }
            InterventionKind::EmergencyStop => {
                return Err("emergency stop is not a per-agent action".into());
            }
        };

        let mut state = self.state.lock();
        if applied == InterventionKind::Terminate {
            state.forget(agent_id);
            return Ok(applied);
        }
        if applied == InterventionKind::Restart {
            state.watchdog.register(agent_id);
            state.tracker.forget(&Scope::Agent(agent_id.to_string()));
        }
        if let Some(agent) = state.agents.get_mut(agent_id) {
            match applied {
                InterventionKind::Throttle => {}
                InterventionKind::ResourceLimit => agent.resource_limited = true,
                InterventionKind::Pause => agent.paused = true,
                InterventionKind::Restart => {
                    agent.metrics.clear();
                    agent.breaker.reset();
                    agent.paused = false;
                    agent.throttle = None;
                    agent.resource_limited = false;
                }
                InterventionKind::Terminate | InterventionKind::EmergencyStop => {}
            }
            agent.last_intervention = Some(applied);
        }
        Ok(applied)
    }

    fn apply_throttle(&self, agent_id: &str) -> Result<(), String> {
        let apm = self.config.health.throttle_actions_per_minute;
        self.controller
            .throttle(agent_id, apm)
            .map_err(|e| e.to_string())?;
        let quota = Quota::per_minute(NonZeroU32::new(apm).unwrap_or(NonZeroU32::MIN));
        if let Some(agent) = self.state.lock().agents.get_mut(agent_id) {
            agent.throttle = Some(Throttle {
                actions_per_minute: apm,
                limiter: RateLimiter::direct(quota),
            });
        }
        Ok(())
    }

    /// Lift a pause and any throttle. Operator action.
    pub fn resume_agent(&self, agent_id: &str) -> Result<(), GovernanceError> {
        if !self.state.lock().agents.contains_key(agent_id) {
            return Err(GovernanceError::NotFound(format!("agent {agent_id}")));
        }
        self.controller
            .resume(agent_id)
            .map_err(|e| GovernanceError::InterventionFailure {
                kind: "resume".into(),
                target: agent_id.to_string(),
                details: e.to_string(),
            })?;
        if let Some(agent) = self.state.lock().agents.get_mut(agent_id) {
            agent.paused = false;
            agent.throttle = None;
            agent.resource_limited = false;
        }
        match self.record_after(
            AuditEvent::new(AuditEventType::Intervention, AuditSeverity::Info)
                .actor(ActorType::Operator, "operator")
                .payload(json!({ "action": "resume", "agent": agent_id })),
        ) {
            None => Ok(()),
            Some(e) => Err(GovernanceError::AuditStorage(format!(
                "resume of {agent_id} not recorded: {e}"
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Kill switch
    // -----------------------------------------------------------------------

    /// Stop every agent, release every allocation and latch the kill switch.
    ///
    /// Only an armed switch can fire; otherwise `Validation` is returned and
    /// nothing is touched. Agents that cannot be stopped before `timeout` are
    /// listed as incomplete.
    pub fn emergency_stop(
        &self,
        reason: &str,
        timeout: Duration,
    ) -> Result<EmergencyStopReport, GovernanceError> {
        self.kill_switch.lock().trigger(reason)?;
        error!(%reason, "EMERGENCY STOP");
        let deadline = Instant::now() + timeout;

        let mut ids: Vec<String> = self.state.lock().agents.keys().cloned().collect();
        ids.sort();

        let mut report = EmergencyStopReport {
            reason: reason.to_string(),
            ..EmergencyStopReport::default()
        };
        for id in ids {
            if Instant::now() >= deadline {
                report.incomplete.push(id);
                continue;
            }
            let stopped = self.controller.terminate(&id, true).is_ok()
                || self.controller.terminate(&id, true).is_ok();
            if stopped {
                report.force_terminated.push(id);
            } else {
                report.incomplete.push(id);
            }
        }

        {
            let mut state = self.state.lock();
            for id in &report.force_terminated {
                state.forget(id);
            }
            for id in &report.incomplete {
                if let Some(agent) = state.agents.get_mut(id) {
                    agent.paused = true;
                }
            }
            state.level = SafetyLevel::Emergency;
        }

        if let Some(resources) = &self.resources {
            report.release = Some(resources.emergency_release_all(reason, self.preserve_critical));
        }

        report.audit_error = self.record_after(
            AuditEvent::new(AuditEventType::EmergencyStop, AuditSeverity::Critical).payload(json!({
                "reason": reason,
                "force_terminated": report.force_terminated,
                "incomplete": report.incomplete,
                "allocations_released": report.release.as_ref().map(|r| r.released.len()),
            })),
        );
        if !report.incomplete.is_empty() {
            error!(agents = ?report.incomplete, "Agents not stopped within the emergency timeout");
        }
        self.alerts.publish(SafetyAlert::new(
            SafetyLevel::Emergency,
            AlertKind::EmergencyStop {
                reason: reason.to_string(),
            },
            format!("emergency stop: {reason}"),
        ));
        Ok(report)
    }

    /// Operator arms the kill switch. Returns `true` when the state changed.
    pub fn arm(&self, operator: &str) -> Result<bool, GovernanceError> {
        let mut ks = self.kill_switch.lock();
        if ks.state() == KillSwitchState::Armed {
            return Ok(false);
        }
        self.record(
            AuditEvent::new(AuditEventType::KillSwitchArmed, AuditSeverity::Warning)
                .actor(ActorType::Operator, operator)
                .payload(json!({ "previous": ks.state() })),
        )?;
        Ok(ks.arm())
    }

    /// Operator disarms the kill switch. Returns `true` when the state changed.
    pub fn disarm(&self, operator: &str) -> Result<bool, GovernanceError> {
        let mut ks = self.kill_switch.lock();
        match ks.state() {
            KillSwitchState::Disarmed => return Ok(false),
            KillSwitchState::EmergencyTriggered => {
                // Refused without an audit record.
                return ks.disarm();
            }
            KillSwitchState::Armed => {}
        }
        self.record(
            AuditEvent::new(AuditEventType::KillSwitchDisarmed, AuditSeverity::Warning)
                .actor(ActorType::Operator, operator),
        )?;
        ks.disarm()
    }

    /// Re-arm a triggered switch once its cool-down has elapsed. Called from
    /// the sampling worker.
    pub fn poll_kill_switch(&self) -> bool {
        let reset = self.kill_switch.lock().poll();
        if reset {
            info!("Kill switch cool-down elapsed; re-armed");
            let message = match self.record_after(AuditEvent::new(
                AuditEventType::KillSwitchReset,
                AuditSeverity::Warning,
            )) {
                None => "kill switch re-armed".to_string(),
                Some(e) => format!("kill switch re-armed (not recorded: {e})"),
            };
            self.alerts.publish(SafetyAlert::new(
                self.state.lock().level,
                AlertKind::KillSwitchReset,
                message,
            ));
        }
        reset
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Pause everything, optionally persist a snapshot, then stop agents one
    /// by one. Agents still running at `timeout` are force-terminated.
    pub fn graceful_shutdown(&self, timeout: Duration) -> ShutdownReport {
        let deadline = Instant::now() + timeout;
        let mut ids: Vec<String> = self.state.lock().agents.keys().cloned().collect();
        ids.sort();
        let mut report = ShutdownReport::default();

        for id in &ids {
            match self.controller.pause(id) {
                Ok(()) => report.paused.push(id.clone()),
                Err(e) => warn!(agent = %id, error = %e, "Pause before shutdown failed"),
            }
        }
        {
            let mut state = self.state.lock();
            for id in &report.paused {
                if let Some(agent) = state.agents.get_mut(id) {
                    agent.paused = true;
                }
            }
        }

        if self.config.kill_switch.save_state {
            if let Some(path) = &self.config.kill_switch.snapshot_path {
                match self.save_snapshot(path) {
                    Ok(()) => report.snapshot_path = Some(path.clone()),
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "Monitor snapshot not saved");
                        report.snapshot_error = Some(e.to_string());
                    }
                }
            }
        }

        for id in ids {
            if Instant::now() < deadline && self.controller.terminate(&id, false).is_ok() {
                report.terminated.push(id);
                continue;
            }
            match self.controller.terminate(&id, true) {
                Ok(()) => report.force_terminated.push(id),
                Err(e) => {
                    error!(agent = %id, error = %e, "Agent could not be stopped");
                    report.incomplete.push(id);
                }
            }
        }

        {
            let mut state = self.state.lock();
            for id in report.terminated.iter().chain(&report.force_terminated) {
                state.forget(id);
            }
        }

        let clean = report.force_terminated.is_empty() && report.incomplete.is_empty();
        report.audit_error = self.record_after(
            AuditEvent::new(
                AuditEventType::SystemShutdown,
                if clean {
                    AuditSeverity::Info
                } else {
                    AuditSeverity::Warning
                },
            )
            .payload(json!({
                "terminated": report.terminated,
                "force_terminated": report.force_terminated,
                "incomplete": report.incomplete,
            })),
        );
        info!(
            terminated = report.terminated.len(),
            forced = report.force_terminated.len(),
            incomplete = report.incomplete.len(),
            "Safety monitor shut down"
        );
        report
    }

    fn save_snapshot(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&self.snapshot())?;
        std::fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerConfig;
    use crate::intervention::ControllerError;
    use crate::threshold::{Operator, Threshold};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<AuditEvent>>,
        fail: AtomicBool,
    }

    impl RecordingSink {
        fn of_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
            self.events
                .lock()
                .iter()
                .filter(|e| e.event_type == event_type)
                .cloned()
                .collect()
        }
    }

    impl AuditSink for RecordingSink {
        fn record(&self, event: AuditEvent) -> Result<u64, GovernanceError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(GovernanceError::AuditStorage("disk full".into()));
            }
            let mut events = self.events.lock();
            events.push(event);
            Ok(events.len() as u64)
        }
    }

    #[derive(Default)]
    struct MockController {
        calls: Mutex<Vec<String>>,
        failing: Mutex<HashSet<&'static str>>,
        graceful_terminate_fails: AtomicBool,
    }

    impl MockController {
        fn act(&self, action: &'static str, agent_id: &str) -> Result<(), ControllerError> {
            self.calls.lock().push(format!("{action}:{agent_id}"));
            if self.failing.lock().contains(action) {
                return Err(ControllerError(format!("{action} refused")));
            }
            Ok(())
        }

        fn fail(&self, action: &'static str) {
            self.failing.lock().insert(action);
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .count()
        }
    }

    impl AgentController for MockController {
        fn pause(&self, agent_id: &str) -> Result<(), ControllerError> {
            self.act("pause", agent_id)
        }
        fn resume(&self, agent_id: &str) -> Result<(), ControllerError> {
            self.act("resume", agent_id)
        }
        fn restart(&self, agent_id: &str) -> Result<(), ControllerError> {
            self.act("restart", agent_id)
        }
        fn terminate(&self, agent_id: &str, force: bool) -> Result<(), ControllerError> {
            if !force && self.graceful_terminate_fails.load(Ordering::SeqCst) {
                self.calls.lock().push(format!("terminate:{agent_id}"));
                return Err(ControllerError("busy".into()));
            }
            self.act(if force { "kill" } else { "terminate" }, agent_id)
        }
        fn throttle(&self, agent_id: &str, _apm: u32) -> Result<(), ControllerError> {
            self.act("throttle", agent_id)
        }
    }

    #[derive(Default)]
    struct MockResources {
        emergency_releases: AtomicUsize,
        team_releases: Mutex<Vec<String>>,
    }

    impl ResourceControl for MockResources {
        fn emergency_release_all(&self, _reason: &str, _preserve: bool) -> EmergencyReleaseSummary {
            self.emergency_releases.fetch_add(1, Ordering::SeqCst);
            EmergencyReleaseSummary::default()
        }
        fn release_team(&self, team: &str, _reason: &str) -> Result<usize, GovernanceError> {
            self.team_releases.lock().push(team.to_string());
            Ok(1)
        }
    }

    fn threshold(name: &str, metric: Metric, value: f64, severity: SafetyLevel) -> Threshold {
        Threshold {
            name: name.into(),
            metric,
            operator: Operator::Gt,
            value,
            severity,
            grace_period_ms: 0,
            auto_escalate: false,
        }
    }

    fn config(thresholds: Vec<Threshold>) -> SafetyConfig {
        SafetyConfig {
            max_concurrent_agents: 4,
            metric_window: 5,
            circuit_breaker: BreakerConfig {
                failure_threshold: 3,
                cooldown_ms: 20,
                success_threshold: 3,
                half_open_max_requests: 3,
            },
            thresholds,
            ..SafetyConfig::default()
        }
    }

    struct Harness {
        monitor: SafetyMonitor,
        sink: Arc<RecordingSink>,
        controller: Arc<MockController>,
        resources: Arc<MockResources>,
    }

    fn harness(cfg: SafetyConfig) -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let controller = Arc::new(MockController::default());
        let resources = Arc::new(MockResources::default());
        let monitor = SafetyMonitor::new(cfg, controller.clone(), sink.clone())
            .unwrap()
            .with_resource_control(resources.clone(), false);
        Harness {
            monitor,
            sink,
            controller,
            resources,
        }
    }

    fn default_harness() -> Harness {
        harness(config(vec![threshold(
            "cpu-emergency",
            Metric::Cpu,
            95.0,
            SafetyLevel::Emergency,
        )]))
    }

    #[test]
    fn registration_is_capped_and_unique() {
        let h = default_harness();
        for i in 0..4 {
            h.monitor.register_agent(&format!("a{i}")).unwrap();
        }
        assert!(matches!(
            h.monitor.register_agent("a0"),
            Err(GovernanceError::Validation(_))
        ));
        assert!(matches!(
            h.monitor.register_agent("a4"),
            Err(GovernanceError::CapacityExhausted(_))
        ));
        h.monitor.unregister_agent("a0").unwrap();
        assert!(h.monitor.register_agent("a4").is_ok());
        assert_eq!(h.sink.of_type(AuditEventType::AgentRegistered).len(), 5);
        assert_eq!(h.sink.of_type(AuditEventType::AgentUnregistered).len(), 1);
    }

    #[test]
    fn unknown_agent_reports_are_rejected() {
        let h = default_harness();
        assert!(matches!(
            h.monitor.report_activity("ghost", ActivityReport::success()),
            Err(GovernanceError::NotFound(_))
        ));
        h.monitor.register_agent("a").unwrap();
        assert!(matches!(
            h.monitor.report_activity("a", ActivityReport::success().cpu(f64::NAN)),
            Err(GovernanceError::Validation(_))
        ));
    }

    #[test]
    fn breaker_blocks_after_failures_and_recovers() {
        let h = default_harness();
        h.monitor.register_agent("a").unwrap();
        assert!(h.monitor.agent_status("a").unwrap().last_failure_secs.is_none());
        for _ in 0..3 {
            h.monitor
                .report_activity("a", ActivityReport::failure())
                .unwrap();
        }
        assert!(!h.monitor.check_circuit_breaker("a").unwrap());
        assert_eq!(h.sink.of_type(AuditEventType::CircuitOpened).len(), 1);
        assert_eq!(h.monitor.agent_status("a").unwrap().last_failure_secs, Some(0));

        thread::sleep(Duration::from_millis(30));
        assert!(h.monitor.check_circuit_breaker("a").unwrap());
        for _ in 0..3 {
            h.monitor
                .report_activity("a", ActivityReport::success())
                .unwrap();
        }
        assert!(h.monitor.check_circuit_breaker("a").unwrap());
        assert_eq!(
            h.monitor.agent_status("a").unwrap().circuit,
            CircuitState::Closed
        );
        assert_eq!(h.sink.of_type(AuditEventType::CircuitClosed).len(), 1);
    }

    #[test]
    fn half_open_gate_admits_limited_trials() {
        let h = default_harness();
        h.monitor.register_agent("a").unwrap();
        for _ in 0..3 {
            h.monitor
                .report_activity("a", ActivityReport::failure())
                .unwrap();
        }
        thread::sleep(Duration::from_millis(30));

        let admitted = (0..100)
            .filter(|_| h.monitor.allow_operation("a").unwrap())
            .count();
        assert_eq!(admitted, 3);
        assert_eq!(
            h.monitor.agent_status("a").unwrap().circuit,
            CircuitState::HalfOpen
        );

        for _ in 0..3 {
            h.monitor
                .report_activity("a", ActivityReport::success())
                .unwrap();
        }
        assert!(h.monitor.allow_operation("a").unwrap());
        assert!(h.monitor.allow_operation("a").unwrap());
    }

    #[test]
    fn cpu_over_emergency_threshold_stops_everything() {
        let h = default_harness();
        h.monitor.register_agent_for_team("a", Some("alpha")).unwrap();
        h.monitor.register_agent("b").unwrap();
        h.monitor
            .report_activity("a", ActivityReport::success().cpu(96.0))
            .unwrap();

        let report = h.monitor.run_cycle();
        assert_eq!(report.level, SafetyLevel::Emergency);
        assert_eq!(h.monitor.check_status(), SafetyLevel::Emergency);
        let stop = report.emergency.unwrap();
        assert_eq!(stop.force_terminated, vec!["a".to_string(), "b".to_string()]);
        assert!(stop.incomplete.is_empty());
        assert_eq!(h.resources.emergency_releases.load(Ordering::SeqCst), 1);

        let stops = h.sink.of_type(AuditEventType::EmergencyStop);
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].severity, AuditSeverity::Critical);
        assert!(h.monitor.agents().is_empty());
        assert!(!h.monitor.allow_operation("a").unwrap_or(false));

        let (_, reason) = h.monitor.snapshot().last_emergency.unwrap();
        assert_eq!(reason, stop.reason);
    }

    #[test]
    fn level_stays_emergency_until_cooldown() {
        let mut cfg = config(vec![threshold("cpu", Metric::Cpu, 95.0, SafetyLevel::Emergency)]);
        cfg.kill_switch.cooldown_ms = 20;
        let h = harness(cfg);
        h.monitor.register_agent("a").unwrap();
        h.monitor
            .report_activity("a", ActivityReport::success().cpu(99.0))
            .unwrap();
        h.monitor.run_cycle();

        // Agent is gone, nothing breaches, yet the switch holds the level.
        assert_eq!(h.monitor.run_cycle().level, SafetyLevel::Emergency);
        thread::sleep(Duration::from_millis(30));
        assert!(h.monitor.poll_kill_switch());
        assert_eq!(h.sink.of_type(AuditEventType::KillSwitchReset).len(), 1);
        assert_eq!(h.monitor.run_cycle().level, SafetyLevel::Normal);
    }

    #[test]
    fn disarmed_switch_records_failed_emergency() {
        let h = default_harness();
        h.monitor.disarm("ops").unwrap();
        h.monitor.register_agent("a").unwrap();
        h.monitor
            .report_activity("a", ActivityReport::success().cpu(99.0))
            .unwrap();
        let report = h.monitor.run_cycle();
        assert!(report.emergency.is_none());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(h.resources.emergency_releases.load(Ordering::SeqCst), 0);
        assert_eq!(h.sink.of_type(AuditEventType::InterventionFailed).len(), 1);
        assert_eq!(h.sink.of_type(AuditEventType::KillSwitchDisarmed).len(), 1);
        assert!(matches!(
            h.monitor.emergency_stop("manual", Duration::from_secs(1)),
            Err(GovernanceError::Validation(_))
        ));
    }

    #[test]
    fn warning_cpu_releases_team_allocations() {
        let h = harness(config(vec![threshold(
            "cpu-warn",
            Metric::Cpu,
            70.0,
            SafetyLevel::Warning,
        )]));
        h.monitor.register_agent_for_team("a", Some("alpha")).unwrap();
        h.monitor
            .report_activity("a", ActivityReport::success().cpu(80.0))
            .unwrap();
        let report = h.monitor.run_cycle();
        assert_eq!(report.level, SafetyLevel::Warning);
        assert_eq!(report.interventions.len(), 1);
        assert_eq!(
            report.interventions[0].applied,
            Some(InterventionKind::ResourceLimit)
        );
        assert_eq!(*h.resources.team_releases.lock(), vec!["alpha".to_string()]);

        // Not re-applied while the breach persists.
        assert!(h.monitor.run_cycle().interventions.is_empty());
        assert_eq!(h.sink.of_type(AuditEventType::ThresholdBreached).len(), 1);
        assert_eq!(h.sink.of_type(AuditEventType::SafetyLevelChanged).len(), 1);
    }

    #[test]
    fn resource_limit_without_team_throttles() {
        let h = harness(config(vec![threshold(
            "mem-warn",
            Metric::Memory,
            70.0,
            SafetyLevel::Warning,
        )]));
        h.monitor.register_agent("a").unwrap();
        h.monitor
            .report_activity("a", ActivityReport::success().memory(90.0))
            .unwrap();
        let report = h.monitor.run_cycle();
        assert_eq!(report.interventions[0].applied, Some(InterventionKind::Throttle));
        assert_eq!(h.monitor.agent_status("a").unwrap().throttled_to, Some(60));
    }

    #[test]
    fn critical_error_rate_restarts_agent() {
        let h = harness(config(vec![threshold(
            "errors",
            Metric::ErrorRate,
            0.5,
            SafetyLevel::Critical,
        )]));
        h.monitor.register_agent("a").unwrap();
        h.monitor
            .report_activity("a", ActivityReport::failure())
            .unwrap();
        let report = h.monitor.run_cycle();
        assert_eq!(report.interventions[0].applied, Some(InterventionKind::Restart));
        let status = h.monitor.agent_status("a").unwrap();
        assert!(status.error_rate.is_none());
        assert_eq!(status.last_intervention, Some(InterventionKind::Restart));
    }

    #[test]
    fn failed_intervention_is_retried_then_escalated() {
        let h = harness(config(vec![threshold(
            "latency",
            Metric::Latency,
            500.0,
            SafetyLevel::Warning,
        )]));
        h.controller.fail("throttle");
        h.monitor.register_agent("a").unwrap();
        h.monitor
            .report_activity("a", ActivityReport::success().latency(900.0))
            .unwrap();
        let report = h.monitor.run_cycle();
        let record = &report.interventions[0];
        assert_eq!(record.requested, InterventionKind::Throttle);
        assert_eq!(record.applied, Some(InterventionKind::Pause));
        assert_eq!(record.attempts, 3);
        assert_eq!(h.controller.count("throttle:"), 2);
        assert_eq!(h.sink.of_type(AuditEventType::InterventionFailed).len(), 1);
        assert!(h.monitor.agent_status("a").unwrap().paused);
        assert!(!h.monitor.allow_operation("a").unwrap());
    }

    #[test]
    fn system_warning_throttles_every_agent() {
        let h = harness(config(vec![threshold(
            "host-cpu",
            Metric::Cpu,
            80.0,
            SafetyLevel::Warning,
        )]));
        h.monitor.register_agent("a").unwrap();
        h.monitor.register_agent("b").unwrap();
        h.monitor.report_system_metrics(90.0, 10.0).unwrap();
        let report = h.monitor.run_cycle();
        assert_eq!(report.interventions.len(), 2);
        assert!(report
            .interventions
            .iter()
            .all(|r| r.applied == Some(InterventionKind::Throttle)));
    }

    #[test]
    fn caution_only_alerts() {
        let h = harness(config(vec![threshold(
            "cpu-caution",
            Metric::Cpu,
            50.0,
            SafetyLevel::Caution,
        )]));
        let mut alerts = h.monitor.alerts().subscribe();
        h.monitor.register_agent("a").unwrap();
        h.monitor
            .report_activity("a", ActivityReport::success().cpu(60.0))
            .unwrap();
        let report = h.monitor.run_cycle();
        assert_eq!(report.level, SafetyLevel::Caution);
        assert!(report.interventions.is_empty());
        assert!(alerts.try_recv().is_ok());
    }

    #[test]
    fn action_rate_rule_throttles_and_gate_enforces() {
        let mut cfg = config(vec![threshold("cpu", Metric::Cpu, 95.0, SafetyLevel::Emergency)]);
        cfg.health.max_actions_per_minute = 5;
        cfg.health.throttle_actions_per_minute = 1;
        let h = harness(cfg);
        h.monitor.register_agent("a").unwrap();
        h.monitor
            .report_activity("a", ActivityReport::success().actions(10))
            .unwrap();
        let report = h.monitor.run_cycle();
        assert_eq!(report.health.len(), 1);
        assert_eq!(report.interventions[0].applied, Some(InterventionKind::Throttle));

        assert!(h.monitor.allow_operation("a").unwrap());
        assert!(!h.monitor.allow_operation("a").unwrap());
    }

    #[test]
    fn graceful_shutdown_forces_stragglers() {
        let mut cfg = config(vec![threshold("cpu", Metric::Cpu, 95.0, SafetyLevel::Emergency)]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.json");
        cfg.kill_switch.save_state = true;
        cfg.kill_switch.snapshot_path = Some(path.clone());
        let h = harness(cfg);
        h.monitor.register_agent("a").unwrap();
        h.monitor.register_agent("b").unwrap();
        h.controller
            .graceful_terminate_fails
            .store(true, Ordering::SeqCst);

        let report = h.monitor.graceful_shutdown(Duration::from_secs(1));
        assert_eq!(report.paused.len(), 2);
        assert!(report.terminated.is_empty());
        assert_eq!(report.force_terminated, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(report.snapshot_path.as_deref(), Some(path.as_path()));

        let snapshot: MonitorSnapshot =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(snapshot.agents.len(), 2);
        assert!(snapshot.agents.iter().all(|a| a.paused));

        let shutdown = h.sink.of_type(AuditEventType::SystemShutdown);
        assert_eq!(shutdown.len(), 1);
        assert_eq!(shutdown[0].severity, AuditSeverity::Warning);
    }

    #[test]
    fn unstoppable_agents_are_reported_incomplete() {
        let h = default_harness();
        h.controller.fail("kill");
        h.controller.fail("terminate");
        h.monitor.register_agent("a").unwrap();
        let report = h.monitor.graceful_shutdown(Duration::from_millis(0));
        assert_eq!(report.incomplete, vec!["a".to_string()]);
        assert_eq!(h.monitor.agents().len(), 1);
    }

    #[test]
    fn arm_and_disarm_are_audited() {
        let h = default_harness();
        assert!(!h.monitor.arm("ops").unwrap());
        assert!(h.monitor.disarm("ops").unwrap());
        assert_eq!(h.monitor.kill_switch_state(), KillSwitchState::Disarmed);
        assert!(h.monitor.arm("ops").unwrap());
        let armed = h.sink.of_type(AuditEventType::KillSwitchArmed);
        assert_eq!(armed.len(), 1);
        assert_eq!(armed[0].actor_type, ActorType::Operator);
    }

    #[test]
    fn snapshot_reports_system_metrics() {
        let h = default_harness();
        h.monitor.register_agent("a").unwrap();
        h.monitor.report_system_metrics(40.0, 60.0).unwrap();
        h.monitor
            .report_activity("a", ActivityReport::failure().latency(100.0))
            .unwrap();
        h.monitor
            .report_activity("a", ActivityReport::success().latency(300.0))
            .unwrap();
        let snap = h.monitor.snapshot();
        assert_eq!(snap.system.cpu, Some(40.0));
        assert_eq!(snap.system.error_rate, Some(0.5));
        assert_eq!(snap.system.latency_ms, Some(200.0));
        assert_eq!(snap.level, SafetyLevel::Normal);
        assert_eq!(snap.kill_switch, KillSwitchState::Armed);
    }

    #[test]
    fn resume_lifts_pause() {
        let h = default_harness();
        h.monitor.register_agent("a").unwrap();
        let record = h.monitor.intervene("a", InterventionKind::Pause, "manual");
        assert!(record.succeeded());
        assert!(!h.monitor.allow_operation("a").unwrap());
        h.monitor.resume_agent("a").unwrap();
        assert!(h.monitor.allow_operation("a").unwrap());
    }

    #[test]
    fn unrecorded_intervention_is_not_complete() {
        let h = default_harness();
        h.monitor.register_agent("a").unwrap();
        let mut alerts = h.monitor.alerts().subscribe();
        h.sink.fail.store(true, Ordering::SeqCst);

        let record = h.monitor.intervene("a", InterventionKind::Pause, "manual");
        assert_eq!(record.applied, Some(InterventionKind::Pause));
        assert!(record.audit_error.as_deref().unwrap().contains("disk full"));
        assert!(!record.succeeded());

        let alert = alerts.try_recv().unwrap();
        assert!(matches!(
            alert.kind,
            AlertKind::Intervention { succeeded: false, .. }
        ));
        assert!(alert.message.contains("not recorded"));
        assert!(matches!(
            h.monitor.resume_agent("a"),
            Err(GovernanceError::AuditStorage(_))
        ));
    }

    #[test]
    fn unrecorded_breaker_trip_is_flagged_on_the_alert() {
        let h = default_harness();
        h.monitor.register_agent("a").unwrap();
        let mut alerts = h.monitor.alerts().subscribe();
        h.sink.fail.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            h.monitor
                .report_activity("a", ActivityReport::failure())
                .unwrap();
        }
        let alert = alerts.try_recv().unwrap();
        assert!(matches!(alert.kind, AlertKind::CircuitOpened { .. }));
        assert!(alert.message.contains("not recorded"));
        assert!(h.sink.of_type(AuditEventType::CircuitOpened).is_empty());
    }

    #[test]
    fn cycle_reports_unrecorded_intervention() {
        let mut cfg = config(vec![threshold(
            "cpu-critical",
            Metric::Cpu,
            80.0,
            SafetyLevel::Critical,
        )]);
        cfg.auto_escalate_after_cycles = 10;
        let h = harness(cfg);
        h.monitor.register_agent("a").unwrap();
        h.monitor
            .report_activity("a", ActivityReport::success().cpu(90.0))
            .unwrap();
        h.sink.fail.store(true, Ordering::SeqCst);

        let report = h.monitor.run_cycle();
        assert_eq!(report.interventions.len(), 1);
        assert!(!report.interventions[0].succeeded());
        assert!(report.failures.iter().any(|f| f.contains("not recorded")));
    }
}
