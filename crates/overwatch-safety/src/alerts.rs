//! Broadcast channel of safety alerts.
//!
//! Uses [`tokio::sync::broadcast`] so every subscriber sees every alert and a
//! slow subscriber never blocks the monitor. Publishing with nobody listening
//! is the normal case when no dashboard is attached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::intervention::InterventionKind;
use crate::threshold::SafetyLevel;

/// Alerts buffered per subscriber before the oldest are dropped.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertKind {
    LevelChanged {
        from: SafetyLevel,
        to: SafetyLevel,
    },
    ThresholdBreached {
        threshold: String,
        scope: String,
        observed: f64,
    },
    CircuitOpened {
        agent_id: String,
    },
    CircuitClosed {
        agent_id: String,
    },
    Intervention {
        agent_id: String,
        action: InterventionKind,
        succeeded: bool,
    },
    EmergencyStop {
        reason: String,
    },
    KillSwitchReset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyAlert {
    pub level: SafetyLevel,
    pub message: String,
    pub kind: AlertKind,
    pub raised_at: DateTime<Utc>,
}

impl SafetyAlert {
    pub fn new(level: SafetyLevel, kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            kind,
            raised_at: Utc::now(),
        }
    }
}

/// Cheap to clone; all clones share one channel.
#[derive(Clone, Debug)]
pub struct AlertBus {
    sender: broadcast::Sender<SafetyAlert>,
}

impl AlertBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Number of subscribers that received the alert; 0 when none listen.
    pub fn publish(&self, alert: SafetyAlert) -> usize {
        self.sender.send(alert).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SafetyAlert> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for AlertBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
