//! System-wide kill switch.
//!
//! ```text
//!   Disarmed ◀──disarm── Armed ──trigger──▶ EmergencyTriggered
//!      │                   ▲                       │
//!      └───────arm─────────┴──(cooldown / arm)─────┘
//! ```

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use overwatch_types::GovernanceError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchState {
    Armed,
    Disarmed,
    EmergencyTriggered,
}

#[derive(Debug, Clone)]
pub struct KillSwitch {
    state: KillSwitchState,
    cooldown: Duration,
    triggered_at: Option<Instant>,
    last_trigger: Option<(DateTime<Utc>, String)>,
}

impl KillSwitch {
    /// A new switch starts armed.
    pub fn new(cooldown: Duration) -> Self {
        Self {
            state: KillSwitchState::Armed,
            cooldown,
            triggered_at: None,
            last_trigger: None,
        }
    }

    pub fn state(&self) -> KillSwitchState {
        self.state
    }

    pub fn is_triggered(&self) -> bool {
        self.state == KillSwitchState::EmergencyTriggered
    }

    /// When and why the switch last fired.
    pub fn last_trigger(&self) -> Option<&(DateTime<Utc>, String)> {
        self.last_trigger.as_ref()
    }

    /// Returns `true` when the state changed.
    pub fn arm(&mut self) -> bool {
        if self.state == KillSwitchState::Armed {
            return false;
        }
        self.state = KillSwitchState::Armed;
        self.triggered_at = None;
        true
    }

    /// Returns `true` when the state changed. A triggered switch must be
    /// re-armed (or cool down) before it can be disarmed.
    pub fn disarm(&mut self) -> Result<bool, GovernanceError> {
        match self.state {
            KillSwitchState::Disarmed => Ok(false),
            KillSwitchState::Armed => {
                self.state = KillSwitchState::Disarmed;
                Ok(true)
            }
            KillSwitchState::EmergencyTriggered => Err(GovernanceError::Validation(
                "kill switch is in emergency state; re-arm it before disarming".into(),
            )),
        }
    }

    /// Fire the switch. Only an armed switch can fire.
    pub fn trigger(&mut self, reason: &str) -> Result<(), GovernanceError> {
        match self.state {
            KillSwitchState::Armed => {
                self.state = KillSwitchState::EmergencyTriggered;
                self.triggered_at = Some(Instant::now());
                self.last_trigger = Some((Utc::now(), reason.to_string()));
                Ok(())
            }
            KillSwitchState::Disarmed => Err(GovernanceError::Validation(
                "kill switch is disarmed".into(),
            )),
            KillSwitchState::EmergencyTriggered => Err(GovernanceError::Validation(
                "emergency stop already in progress".into(),
            )),
        }
    }

    /// Return to Armed once the cool-down has elapsed. `true` when it did.
    pub fn poll(&mut self) -> bool {
        if self.state == KillSwitchState::EmergencyTriggered
            && self.triggered_at.is_some_and(|t| t.elapsed() >= self.cooldown)
        {
            self.state = KillSwitchState::Armed;
            self.triggered_at = None;
            return true;
        }
        false
    }
}
