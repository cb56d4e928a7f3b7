//! `overwatch-types` – shared governance vocabulary.
//!
//! Every other crate in the workspace speaks in these types:
//!
//! - the audit event model ([`AuditEvent`], [`AuditEventType`],
//!   [`AuditSeverity`], [`AuditCategory`], [`ActorType`], [`RetentionPolicy`]),
//! - the error taxonomy ([`GovernanceError`]),
//! - the two seams between components: [`AuditSink`] (anything that can durably
//!   record an [`AuditEvent`]) and [`ResourceControl`] (the subset of the
//!   resource allocator the safety monitor is allowed to drive).

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Actors
// ────────────────────────────────────────────────────────────────────────────

/// Kind of principal responsible for an audited event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A governance component (allocator, monitor, audit trail).
    System,
    /// An autonomous agent under supervision.
    Agent,
    /// A team submitting resource requests.
    Team,
    /// A human operator acting through the CLI or an admin surface.
    Operator,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::System => "system",
            ActorType::Agent => "agent",
            ActorType::Team => "team",
            ActorType::Operator => "operator",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(ActorType::System),
            "agent" => Some(ActorType::Agent),
            "team" => Some(ActorType::Team),
            "operator" => Some(ActorType::Operator),
            _ => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Severity, category, retention
// ────────────────────────────────────────────────────────────────────────────

/// Severity attached to every audit entry.
///
/// Ordered so that `Info < Warning < Error < Critical`, which lets queries ask
/// for "at least WARNING".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Info => "INFO",
            AuditSeverity::Warning => "WARNING",
            AuditSeverity::Error => "ERROR",
            AuditSeverity::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INFO" => Some(AuditSeverity::Info),
            "WARNING" => Some(AuditSeverity::Warning),
            "ERROR" => Some(AuditSeverity::Error),
            "CRITICAL" => Some(AuditSeverity::Critical),
            _ => None,
        }
    }

    /// Retention policy applied when the caller does not pick one.
    pub fn default_retention(&self) -> RetentionPolicy {
        match self {
            AuditSeverity::Critical => RetentionPolicy::Permanent,
            AuditSeverity::Error => RetentionPolicy::LongTerm,
            AuditSeverity::Warning => RetentionPolicy::Standard,
            AuditSeverity::Info => RetentionPolicy::ShortTerm,
        }
    }
}

/// Coarse grouping used by compliance queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Resource,
    Safety,
    Agent,
    Integrity,
    System,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Resource => "resource",
            AuditCategory::Safety => "safety",
            AuditCategory::Agent => "agent",
            AuditCategory::Integrity => "integrity",
            AuditCategory::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "resource" => Some(AuditCategory::Resource),
            "safety" => Some(AuditCategory::Safety),
            "agent" => Some(AuditCategory::Agent),
            "integrity" => Some(AuditCategory::Integrity),
            "system" => Some(AuditCategory::System),
            _ => None,
        }
    }
}

/// How long an audit entry must stay in the live (non-archived) set.
///
/// The tag is fixed at creation and is part of the hashed entry content, so a
/// changed tag shows up as tampering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    Permanent,
    LongTerm,
    Standard,
    ShortTerm,
}

impl RetentionPolicy {
    pub const ALL: [RetentionPolicy; 4] = [
        RetentionPolicy::Permanent,
        RetentionPolicy::LongTerm,
        RetentionPolicy::Standard,
        RetentionPolicy::ShortTerm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionPolicy::Permanent => "permanent",
            RetentionPolicy::LongTerm => "long_term",
            RetentionPolicy::Standard => "standard",
            RetentionPolicy::ShortTerm => "short_term",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "permanent" => Some(RetentionPolicy::Permanent),
            "long_term" => Some(RetentionPolicy::LongTerm),
            "standard" => Some(RetentionPolicy::Standard),
            "short_term" => Some(RetentionPolicy::ShortTerm),
            _ => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Event types
// ────────────────────────────────────────────────────────────────────────────

/// Every kind of governance decision that ends up in the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditEventType {
    // Resource allocator
    ResourceQueued,
    ResourceDenied,
    Allocated,
    Released,
    Expired,
    RequestCancelled,
    EmergencyRelease,
    // Safety monitor
    AgentRegistered,
    AgentUnregistered,
    ThresholdBreached,
    SafetyLevelChanged,
    CircuitOpened,
    CircuitClosed,
    Intervention,
    InterventionFailed,
    EmergencyStop,
    KillSwitchArmed,
    KillSwitchDisarmed,
    KillSwitchReset,
    // Lifecycle / trail maintenance
    SystemStarted,
    SystemShutdown,
    RetentionSweep,
    IntegrityViolation,
    /// Events recorded by external collaborators.
    Custom(String),
}

impl AuditEventType {
    pub fn as_str(&self) -> &str {
        match self {
            AuditEventType::ResourceQueued => "ResourceQueued",
            AuditEventType::ResourceDenied => "ResourceDenied",
            AuditEventType::Allocated => "Allocated",
            AuditEventType::Released => "Released",
            AuditEventType::Expired => "Expired",
            AuditEventType::RequestCancelled => "RequestCancelled",
            AuditEventType::EmergencyRelease => "EmergencyRelease",
            AuditEventType::AgentRegistered => "AgentRegistered",
            AuditEventType::AgentUnregistered => "AgentUnregistered",
            AuditEventType::ThresholdBreached => "ThresholdBreached",
            AuditEventType::SafetyLevelChanged => "SafetyLevelChanged",
            AuditEventType::CircuitOpened => "CircuitOpened",
            AuditEventType::CircuitClosed => "CircuitClosed",
            AuditEventType::Intervention => "Intervention",
            AuditEventType::InterventionFailed => "InterventionFailed",
            AuditEventType::EmergencyStop => "EmergencyStop",
            AuditEventType::KillSwitchArmed => "KillSwitchArmed",
            AuditEventType::KillSwitchDisarmed => "KillSwitchDisarmed",
            AuditEventType::KillSwitchReset => "KillSwitchReset",
            AuditEventType::SystemStarted => "SystemStarted",
            AuditEventType::SystemShutdown => "SystemShutdown",
            AuditEventType::RetentionSweep => "RetentionSweep",
            AuditEventType::IntegrityViolation => "IntegrityViolation",
            AuditEventType::Custom(name) => name,
        }
    }

    /// Inverse of [`as_str`][Self::as_str]; unknown names become
    /// [`AuditEventType::Custom`].
    pub fn parse(s: &str) -> Self {
        match s {
            "ResourceQueued" => AuditEventType::ResourceQueued,
            "ResourceDenied" => AuditEventType::ResourceDenied,
            "Allocated" => AuditEventType::Allocated,
            "Released" => AuditEventType::Released,
            "Expired" => AuditEventType::Expired,
            "RequestCancelled" => AuditEventType::RequestCancelled,
            "EmergencyRelease" => AuditEventType::EmergencyRelease,
            "AgentRegistered" => AuditEventType::AgentRegistered,
            "AgentUnregistered" => AuditEventType::AgentUnregistered,
            "ThresholdBreached" => AuditEventType::ThresholdBreached,
            "SafetyLevelChanged" => AuditEventType::SafetyLevelChanged,
            "CircuitOpened" => AuditEventType::CircuitOpened,
            "CircuitClosed" => AuditEventType::CircuitClosed,
            "Intervention" => AuditEventType::Intervention,
            "InterventionFailed" => AuditEventType::InterventionFailed,
            "EmergencyStop" => AuditEventType::EmergencyStop,
            "KillSwitchArmed" => AuditEventType::KillSwitchArmed,
            "KillSwitchDisarmed" => AuditEventType::KillSwitchDisarmed,
            "KillSwitchReset" => AuditEventType::KillSwitchReset,
            "SystemStarted" => AuditEventType::SystemStarted,
            "SystemShutdown" => AuditEventType::SystemShutdown,
            "RetentionSweep" => AuditEventType::RetentionSweep,
            "IntegrityViolation" => AuditEventType::IntegrityViolation,
            other => AuditEventType::Custom(other.to_string()),
        }
    }

    /// Default category for this event type.
    pub fn category(&self) -> AuditCategory {
        match self {
            AuditEventType::ResourceQueued
            | AuditEventType::ResourceDenied
            | AuditEventType::Allocated
            | AuditEventType::Released
            | AuditEventType::Expired
            | AuditEventType::RequestCancelled
            | AuditEventType::EmergencyRelease => AuditCategory::Resource,
            AuditEventType::AgentRegistered | AuditEventType::AgentUnregistered => {
                AuditCategory::Agent
            }
            AuditEventType::ThresholdBreached
            | AuditEventType::SafetyLevelChanged
            | AuditEventType::CircuitOpened
            | AuditEventType::CircuitClosed
            | AuditEventType::Intervention
            | AuditEventType::InterventionFailed
            | AuditEventType::EmergencyStop
            | AuditEventType::KillSwitchArmed
            | AuditEventType::KillSwitchDisarmed
            | AuditEventType::KillSwitchReset => AuditCategory::Safety,
            AuditEventType::IntegrityViolation | AuditEventType::RetentionSweep => {
                AuditCategory::Integrity
            }
            AuditEventType::SystemStarted
            | AuditEventType::SystemShutdown
            | AuditEventType::Custom(_) => AuditCategory::System,
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// AuditEvent
// ────────────────────────────────────────────────────────────────────────────

/// A governance decision ready to be appended to the audit trail.
///
/// The trail assigns sequence number, id, timestamp, hashes and signature on
/// append; an `AuditEvent` only carries what the emitting component knows.
///
/// ```
/// use overwatch_types::{ActorType, AuditEvent, AuditEventType, AuditSeverity, RetentionPolicy};
///
/// let event = AuditEvent::new(AuditEventType::Allocated, AuditSeverity::Info)
///     .actor(ActorType::Team, "alpha")
///     .payload(serde_json::json!({ "cpu": 10 }));
///
/// assert_eq!(event.retention, RetentionPolicy::ShortTerm);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub actor_type: ActorType,
    pub actor_id: String,
    pub event_type: AuditEventType,
    pub category: AuditCategory,
    pub severity: AuditSeverity,
    pub payload: serde_json::Value,
    pub retention: RetentionPolicy,
}

impl AuditEvent {
    /// Start an event attributed to the `system` actor, with the event type's
    /// default category and the severity's default retention policy.
    pub fn new(event_type: AuditEventType, severity: AuditSeverity) -> Self {
        Self {
            actor_type: ActorType::System,
            actor_id: "overwatch".to_string(),
            category: event_type.category(),
            event_type,
            severity,
            payload: serde_json::Value::Null,
            retention: severity.default_retention(),
        }
    }

    pub fn actor(mut self, actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        self.actor_type = actor_type;
        self.actor_id = actor_id.into();
        self
    }

    pub fn category(mut self, category: AuditCategory) -> Self {
        self.category = category;
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Error taxonomy
// ────────────────────────────────────────────────────────────────────────────

/// Error taxonomy shared by every governance component.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GovernanceError {
    /// Malformed request or input; rejected synchronously, never queued.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Transient shortage of a finite resource (capacity, agent slots).
    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Hash, signature or sequence mismatch in the audit trail.
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    /// An enforcement action failed after its retry.
    #[error("Intervention {kind} against {target} failed: {details}")]
    InterventionFailure {
        kind: String,
        target: String,
        details: String,
    },

    /// Missing or invalid configuration at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The audit trail could not durably record an event.
    #[error("Audit storage failure: {0}")]
    AuditStorage(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

// ────────────────────────────────────────────────────────────────────────────
// Component seams
// ────────────────────────────────────────────────────────────────────────────

/// Anything that can durably record an [`AuditEvent`].
///
/// Implementations must never drop an event silently: when the event cannot be
/// persisted the error is returned so the caller can refuse to complete the
/// governed action.
pub trait AuditSink: Send + Sync {
    /// Append `event` and return the sequence number it was stored under.
    fn record(&self, event: AuditEvent) -> Result<u64, GovernanceError>;
}

/// Outcome of an emergency release of every live allocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmergencyReleaseSummary {
    /// Allocations returned to the pool.
    pub released: Vec<Uuid>,
    /// Critical allocations left in place at the caller's request.
    pub preserved: Vec<Uuid>,
    /// Pending requests dropped from the queue.
    pub cancelled_requests: Vec<Uuid>,
    /// Set when the release happened but could not be recorded.
    pub audit_error: Option<String>,
}

/// The resource-allocator operations the safety monitor may invoke.
pub trait ResourceControl: Send + Sync {
    /// Release every live allocation and clear the pending queue.
    fn emergency_release_all(&self, reason: &str, preserve_critical: bool)
    -> EmergencyReleaseSummary;

    /// Release every live allocation held by `team`; returns how many were
    /// released.
    fn release_team(&self, team: &str, reason: &str) -> Result<usize, GovernanceError>;
}
