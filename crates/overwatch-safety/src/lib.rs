//! `overwatch-safety` – agent supervision and automated intervention.
//!
//! The [`SafetyMonitor`] keeps rolling metric windows and a circuit breaker
//! per agent, evaluates operator-supplied [`Threshold`]s and health rules
//! every cycle, and escalates interventions through the host's
//! [`AgentController`] up to an emergency stop that also empties the
//! resource allocator.
//!
//! # Modules
//!
//! | Module | Contents |
//! |---|---|
//! | [`metrics`] | Bounded rolling windows |
//! | [`threshold`] | Thresholds, safety levels, grace and escalation tracking |
//! | [`circuit_breaker`] | Closed / Open / HalfOpen breaker |
//! | [`watchdog`] | Runtime, idle time and action rate per agent |
//! | [`health`] | Health rule engine |
//! | [`intervention`] | Intervention kinds and the controller seam |
//! | [`kill_switch`] | Armed / Disarmed / EmergencyTriggered switch |
//! | [`alerts`] | Broadcast alert bus |
//! | [`monitor`] | The monitor itself |

pub mod alerts;
pub mod circuit_breaker;
pub mod config;
pub mod health;
pub mod intervention;
pub mod kill_switch;
pub mod metrics;
pub mod monitor;
pub mod threshold;
pub mod watchdog;

pub use alerts::{AlertBus, AlertKind, SafetyAlert};
pub use circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use config::{HealthConfig, KillSwitchConfig, SafetyConfig};
pub use health::{HealthFinding, HealthRule, HealthVerifier};
pub use intervention::{
    AgentController, ControllerError, InterventionKind, InterventionRecord, LoggingAgentController,
};
pub use kill_switch::{KillSwitch, KillSwitchState};
pub use monitor::{
    ActivityReport, AgentStatus, CycleReport, EmergencyStopReport, MonitorSnapshot, Outcome,
    SafetyMonitor, ShutdownReport, SystemMetrics,
};
pub use threshold::{Breach, Metric, Operator, SafetyLevel, Scope, Threshold};
