//! Requests, allocations and the outcome of a submission.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resource type → quantity.
pub type ResourceMap = BTreeMap<String, u64>;

/// Priority band of a request; `Critical` is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Background,
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Background => "background",
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    /// Bands that see the full physical availability regardless of the
    /// priority boost.
    pub fn is_elevated(&self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }
}

/// An immutable request for resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub id: Uuid,
    pub team: String,
    pub resources: ResourceMap,
    pub priority: Priority,
    pub submitted_at: DateTime<Utc>,
    pub duration: Duration,
    pub metadata: BTreeMap<String, String>,
}

impl ResourceRequest {
    pub fn new(
        team: impl Into<String>,
        resources: ResourceMap,
        priority: Priority,
        duration: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            team: team.into(),
            resources,
            priority,
            submitted_at: Utc::now(),
            duration,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Build a [`ResourceMap`] from `(type, quantity)` pairs.
pub fn resources<'a>(pairs: impl IntoIterator<Item = (&'a str, u64)>) -> ResourceMap {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Allocated,
    /// Reserved for a future partial-grant policy; arbitration never
    /// produces it.
    Partial,
    Released,
    Expired,
}

/// A granted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub id: Uuid,
    pub request_id: Uuid,
    pub team: String,
    pub priority: Priority,
    pub resources: ResourceMap,
    pub status: AllocationStatus,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub release_reason: Option<String>,
}

/// Why a request was refused outright.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenialReason {
    /// The team's committed amount plus this request is above its ceiling.
    CeilingExceeded {
        resource: String,
        requested: u64,
        committed: u64,
        ceiling: u64,
    },
    /// More than the pool could ever hold.
    ExceedsPoolCapacity {
        resource: String,
        requested: u64,
        total: u64,
    },
    /// A critical request that cannot be met right now.
    CapacityExhausted {
        resource: String,
        requested: u64,
        available: u64,
    },
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::CeilingExceeded {
                resource,
                requested,
                committed,
                ceiling,
            } => write!(
                f,
                "team ceiling exceeded for {resource}: {committed} committed + {requested} requested > {ceiling}"
            ),
            DenialReason::ExceedsPoolCapacity {
                resource,
                requested,
                total,
            } => write!(f, "{requested} {resource} exceeds pool capacity {total}"),
            DenialReason::CapacityExhausted {
                resource,
                requested,
                available,
            } => write!(f, "{requested} {resource} requested, {available} available"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestStatus {
    Allocated { allocation_id: Uuid },
    /// 1-based position in arbitration order.
    Queued { position: usize },
    Denied { reason: DenialReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub request_id: Uuid,
    pub status: RequestStatus,
}

impl RequestOutcome {
    pub fn allocation_id(&self) -> Option<Uuid> {
        match self.status {
            RequestStatus::Allocated { allocation_id } => Some(allocation_id),
            _ => None,
        }
    }

    pub fn is_denied(&self) -> bool {
        matches!(self.status, RequestStatus::Denied { .. })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Queue ordering
// ─────────────────────────────────────────────────────────────────────────────

/// A queued request. Ordered so that `BinaryHeap::peek` yields the next
/// request to serve: higher priority, then earlier submission, then lower
/// submission sequence.
#[derive(Debug, Clone)]
pub(crate) struct Pending {
    pub request: ResourceRequest,
    pub seq: u64,
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.request
            .priority
            .cmp(&other.request.priority)
            .then_with(|| other.request.submitted_at.cmp(&self.request.submitted_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}
