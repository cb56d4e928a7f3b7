//! Interventions and the host-side [`AgentController`] seam.
//!
//! The monitor decides *what* to do to an agent; the host decides *how*. The
//! host supplies an [`AgentController`] that actually pauses, restarts,
//! throttles or terminates its agents.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Enforcement actions, ordered from least to most disruptive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionKind {
    Throttle,
    ResourceLimit,
    Pause,
    Restart,
    Terminate,
    EmergencyStop,
}

impl InterventionKind {
    /// What to try after this kind has failed twice. `None` for
    /// `EmergencyStop`, which has nothing above it.
    pub fn escalated(&self) -> Option<Self> {
        match self {
            InterventionKind::Throttle | InterventionKind::ResourceLimit => {
                Some(InterventionKind::Pause)
            }
            InterventionKind::Pause | InterventionKind::Restart => {
                Some(InterventionKind::Terminate)
            }
            InterventionKind::Terminate => Some(InterventionKind::EmergencyStop),
            InterventionKind::EmergencyStop => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionKind::Throttle => "throttle",
            InterventionKind::ResourceLimit => "resource_limit",
            InterventionKind::Pause => "pause",
            InterventionKind::Restart => "restart",
            InterventionKind::Terminate => "terminate",
            InterventionKind::EmergencyStop => "emergency_stop",
        }
    }
}

impl fmt::Display for InterventionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by the host while carrying out an action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ControllerError(pub String);

/// Host glue that acts on real agents.
///
/// Implementations must be safe to call from the monitor's worker threads.
/// Each call should return once the action has taken effect (or failed).
pub trait AgentController: Send + Sync {
    fn pause(&self, agent_id: &str) -> Result<(), ControllerError>;

    fn resume(&self, agent_id: &str) -> Result<(), ControllerError>;

    fn restart(&self, agent_id: &str) -> Result<(), ControllerError>;

    /// `force` skips any cooperative wind-down.
    fn terminate(&self, agent_id: &str, force: bool) -> Result<(), ControllerError>;

    /// Limit the agent to `actions_per_minute`.
    fn throttle(&self, agent_id: &str, actions_per_minute: u32) -> Result<(), ControllerError>;
}

/// Controller that only logs. Used when the host has not wired its own,
/// e.g. by the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAgentController;

impl AgentController for LoggingAgentController {
    fn pause(&self, agent_id: &str) -> Result<(), ControllerError> {
        info!(agent = %agent_id, "pause requested");
        Ok(())
    }

    fn resume(&self, agent_id: &str) -> Result<(), ControllerError> {
        info!(agent = %agent_id, "resume requested");
        Ok(())
    }

    fn restart(&self, agent_id: &str) -> Result<(), ControllerError> {
        info!(agent = %agent_id, "restart requested");
        Ok(())
    }

    fn terminate(&self, agent_id: &str, force: bool) -> Result<(), ControllerError> {
        if force {
            warn!(agent = %agent_id, "forced termination requested");
        } else {
            info!(agent = %agent_id, "termination requested");
        }
        Ok(())
    }

    fn throttle(&self, agent_id: &str, actions_per_minute: u32) -> Result<(), ControllerError> {
        info!(agent = %agent_id, actions_per_minute, "throttle requested");
        Ok(())
    }
}

/// Outcome of one intervention, after retries and escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionRecord {
    pub agent_id: String,
    /// What was asked for.
    pub requested: InterventionKind,
    /// What was finally applied (differs from `requested` after escalation).
    pub applied: Option<InterventionKind>,
    pub reason: String,
    pub attempts: u32,
    /// Failure details for every kind that failed on its retry.
    pub failures: Vec<String>,
    /// Set when the applied action could not be written to the audit trail.
    pub audit_error: Option<String>,
    pub at: DateTime<Utc>,
}

impl InterventionRecord {
    /// Applied and recorded. An action the audit trail never saw is not
    /// complete.
    pub fn succeeded(&self) -> bool {
        self.applied.is_some() && self.audit_error.is_none()
    }
}
