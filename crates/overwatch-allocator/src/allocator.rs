//! Priority arbitration over the shared resource pool.
//!
//! One mutex guards the pool, the team ledger, the pending queue and the live
//! allocation set. Every state change is recorded through the [`AuditSink`]
//! while that mutex is held and before the change is applied; if the record
//! fails, the change does not happen. The single exception is
//! [`ResourceAllocator::emergency_release_all`], which always releases.

use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use overwatch_types::{
    ActorType, AuditEvent, AuditEventType, AuditSeverity, AuditSink, EmergencyReleaseSummary,
    GovernanceError, ResourceControl,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AllocatorConfig;
use crate::pool::{PoolStatus, ResourcePool};
use crate::quota::TeamLedger;
use crate::request::{
    AllocationStatus, DenialReason, Pending, Priority, RequestOutcome, RequestStatus,
    ResourceAllocation, ResourceMap, ResourceRequest,
};

/// Serialisable view of the allocator, persisted on graceful shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorSnapshot {
    pub taken_at: DateTime<Utc>,
    pub pools: Vec<PoolStatus>,
    pub live: Vec<ResourceAllocation>,
    /// In arbitration order.
    pub pending: Vec<ResourceRequest>,
    pub team_usage: BTreeMap<String, ResourceMap>,
}

struct AllocatorState {
    pool: ResourcePool,
    ledger: TeamLedger,
    queue: BinaryHeap<Pending>,
    live: HashMap<Uuid, ResourceAllocation>,
    next_seq: u64,
}

pub struct ResourceAllocator {
    config: AllocatorConfig,
    state: Mutex<AllocatorState>,
    audit: Arc<dyn AuditSink>,
}

impl ResourceAllocator {
    pub fn new(config: AllocatorConfig, audit: Arc<dyn AuditSink>) -> Result<Self, GovernanceError> {
        config.validate()?;
        let pool = ResourcePool::new(&config.pools)?;
        let ledger = TeamLedger::new(config.team_ceilings.clone());
        info!(
            resource_types = pool.resource_types().count(),
            teams_with_ceilings = config.team_ceilings.len(),
            "Resource allocator initialised"
        );
        Ok(Self {
            config,
            state: Mutex::new(AllocatorState {
                pool,
                ledger,
                queue: BinaryHeap::new(),
                live: HashMap::new(),
                next_seq: 0,
            }),
            audit,
        })
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    // ─── Submission ──────────────────────────────────────────────────────────

    /// Submit a request.
    ///
    /// Malformed requests return [`GovernanceError::Validation`]. Policy
    /// refusals are not errors: they come back as
    /// [`RequestStatus::Denied`] and are recorded in the audit trail.
    pub fn request(&self, request: ResourceRequest) -> Result<RequestOutcome, GovernanceError> {
        let mut state = self.state.lock();
        validate(&state.pool, &request)?;

        // Lower bands only ever see the boosted share of the pool.
        for (name, &requested) in &request.resources {
            let total = self.visible(request.priority, state.pool.total(name));
            if requested > total {
                let reason = DenialReason::ExceedsPoolCapacity {
                    resource: name.clone(),
                    requested,
                    total,
                };
                return self.deny(&request, reason);
            }
        }
        if let Err(reason) = state.ledger.check(&request.team, &request.resources, &state.pool) {
            return self.deny(&request, reason);
        }

        let band_waiting = state
            .queue
            .iter()
            .any(|p| p.request.priority >= request.priority);
        if request.priority == Priority::Critical && !band_waiting {
            match state.pool.shortfall(&request.resources, |a| a) {
                None => {
                    let allocation = self.grant(&mut state, &request)?;
                    return Ok(RequestOutcome {
                        request_id: request.id,
                        status: RequestStatus::Allocated {
                            allocation_id: allocation.id,
                        },
                    });
                }
                Some((resource, available)) if !self.config.queue_critical => {
                    let reason = DenialReason::CapacityExhausted {
                        resource: resource.clone(),
                        requested: request.resources.get(&resource).copied().unwrap_or(0),
                        available,
                    };
                    return self.deny(&request, reason);
                }
                Some(_) => {}
            }
        }

        self.audit.record(
            request_event(AuditEventType::ResourceQueued, AuditSeverity::Info, &request)
                .payload(json!({
                    "request_id": request.id,
                    "resources": request.resources,
                    "priority": request.priority.as_str(),
                    "metadata": request.metadata,
                })),
        )?;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.ledger.add_pending(&request.team, &request.resources);
        state.queue.push(Pending {
            request: request.clone(),
            seq,
        });
        debug!(request_id = %request.id, team = %request.team, "Request queued");

        let granted = self.arbitrate_locked(&mut state);
        if let Some(allocation) = granted.iter().find(|a| a.request_id == request.id) {
            return Ok(RequestOutcome {
                request_id: request.id,
                status: RequestStatus::Allocated {
                    allocation_id: allocation.id,
                },
            });
        }

        let position = state
            .queue
            .iter()
            .find(|p| p.request.id == request.id)
            .map(|target| state.queue.iter().filter(|p| *p > target).count() + 1)
            .unwrap_or(0);
        Ok(RequestOutcome {
            request_id: request.id,
            status: RequestStatus::Queued { position },
        })
    }

    fn deny(
        &self,
        request: &ResourceRequest,
        reason: DenialReason,
    ) -> Result<RequestOutcome, GovernanceError> {
        self.audit.record(
            request_event(AuditEventType::ResourceDenied, AuditSeverity::Warning, request).payload(
                json!({
                    "request_id": request.id,
                    "resources": request.resources,
                    "priority": request.priority.as_str(),
                    "reason": reason,
                }),
            ),
        )?;
        info!(team = %request.team, request_id = %request.id, %reason, "Request denied");
        Ok(RequestOutcome {
            request_id: request.id,
            status: RequestStatus::Denied { reason },
        })
    }

    // ─── Arbitration ─────────────────────────────────────────────────────────

    /// Availability a band may draw from.
    fn visible(&self, priority: Priority, available: u64) -> u64 {
        if priority.is_elevated() || self.config.priority_boost <= 1.0 {
            available
        } else {
            ((available as f64 / self.config.priority_boost).floor() as u64).min(available)
        }
    }

    /// Serve the queue head for as long as it is satisfiable.
    pub fn arbitrate(&self) -> Vec<ResourceAllocation> {
        let mut state = self.state.lock();
        self.arbitrate_locked(&mut state)
    }

    fn arbitrate_locked(&self, state: &mut AllocatorState) -> Vec<ResourceAllocation> {
        let mut granted = Vec::new();
        while let Some(head) = state.queue.peek() {
            let priority = head.request.priority;
            // Head-of-line: a blocked head stops the pass.
            if state
                .pool
                .shortfall(&head.request.resources, |a| self.visible(priority, a))
                .is_some()
            {
                break;
            }
            let request = head.request.clone();
            match self.grant(state, &request) {
                Ok(allocation) => {
                    state.queue.pop();
                    state.ledger.remove_pending(&request.team, &request.resources);
                    granted.push(allocation);
                }
                Err(e) => {
                    error!(request_id = %request.id, error = %e, "Grant not recorded; request stays queued");
                    break;
                }
            }
        }
        granted
    }

    /// Record, then apply, a grant of `request`.
    fn grant(
        &self,
        state: &mut AllocatorState,
        request: &ResourceRequest,
    ) -> Result<ResourceAllocation, GovernanceError> {
        if let Some((name, available)) = state.pool.shortfall(&request.resources, |a| a) {
            return Err(GovernanceError::CapacityExhausted(format!(
                "{name}: {available} available"
            )));
        }
        let lifetime = request.duration.min(self.config.max_duration());
        let lifetime = chrono::Duration::from_std(lifetime)
            .map_err(|e| GovernanceError::Validation(format!("duration out of range: {e}")))?;
        let granted_at = Utc::now();
        let allocation = ResourceAllocation {
            id: Uuid::new_v4(),
            request_id: request.id,
            team: request.team.clone(),
            priority: request.priority,
            resources: request.resources.clone(),
            status: AllocationStatus::Allocated,
            granted_at,
            expires_at: granted_at + lifetime,
            released_at: None,
            release_reason: None,
        };

        self.audit.record(
            request_event(AuditEventType::Allocated, AuditSeverity::Info, request).payload(json!({
                "request_id": request.id,
                "allocation_id": allocation.id,
                "resources": allocation.resources,
                "priority": request.priority.as_str(),
                "expires_at": allocation.expires_at,
            })),
        )?;
        state.pool.take(&allocation.resources)?;
        state.ledger.add_usage(&allocation.team, &allocation.resources);
        state.live.insert(allocation.id, allocation.clone());
        info!(
            team = %allocation.team,
            allocation_id = %allocation.id,
            priority = request.priority.as_str(),
            "Resources allocated"
        );
        Ok(allocation)
    }

    // ─── Release paths ───────────────────────────────────────────────────────

    /// Remove a live allocation and hand its resources back.
    fn finish_locked(
        state: &mut AllocatorState,
        allocation_id: Uuid,
        status: AllocationStatus,
        reason: &str,
    ) -> Option<ResourceAllocation> {
        let mut allocation = state.live.remove(&allocation_id)?;
        state.pool.give_back(&allocation.resources);
        state.ledger.remove_usage(&allocation.team, &allocation.resources);
        allocation.status = status;
        allocation.released_at = Some(Utc::now());
        allocation.release_reason = Some(reason.to_string());
        Some(allocation)
    }

    fn release_event(
        event_type: AuditEventType,
        allocation: &ResourceAllocation,
        reason: &str,
    ) -> AuditEvent {
        AuditEvent::new(event_type, AuditSeverity::Info)
            .actor(ActorType::Team, allocation.team.clone())
            .payload(json!({
                "allocation_id": allocation.id,
                "request_id": allocation.request_id,
                "resources": allocation.resources,
                "reason": reason,
            }))
    }

    pub fn release(
        &self,
        allocation_id: Uuid,
        reason: &str,
    ) -> Result<ResourceAllocation, GovernanceError> {
        let mut state = self.state.lock();
        let allocation = state
            .live
            .get(&allocation_id)
            .cloned()
            .ok_or_else(|| GovernanceError::NotFound(format!("allocation {allocation_id}")))?;

        self.audit
            .record(Self::release_event(AuditEventType::Released, &allocation, reason))?;
        let released = Self::finish_locked(&mut state, allocation_id, AllocationStatus::Released, reason)
            .ok_or_else(|| GovernanceError::NotFound(format!("allocation {allocation_id}")))?;
        info!(allocation_id = %allocation_id, team = %released.team, reason, "Resources released");

        self.arbitrate_locked(&mut state);
        Ok(released)
    }

    /// Withdraw a request that has not been granted yet.
    pub fn cancel(&self, request_id: Uuid) -> Result<ResourceRequest, GovernanceError> {
        let mut state = self.state.lock();
        let request = state
            .queue
            .iter()
            .find(|p| p.request.id == request_id)
            .map(|p| p.request.clone())
            .ok_or_else(|| GovernanceError::NotFound(format!("pending request {request_id}")))?;

        self.audit.record(
            request_event(AuditEventType::RequestCancelled, AuditSeverity::Info, &request)
                .payload(json!({ "request_id": request.id, "resources": request.resources })),
        )?;
        state.queue.retain(|p| p.request.id != request_id);
        state.ledger.remove_pending(&request.team, &request.resources);
        debug!(request_id = %request_id, "Request cancelled");

        self.arbitrate_locked(&mut state);
        Ok(request)
    }

    /// Release every allocation whose `expires_at` is not after `now`.
    ///
    /// An allocation whose expiry cannot be recorded stays live and is
    /// retried on the next sweep.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<ResourceAllocation> {
        let mut state = self.state.lock();
        let mut due: Vec<(DateTime<Utc>, Uuid)> = state
            .live
            .values()
            .filter(|a| a.expires_at <= now)
            .map(|a| (a.expires_at, a.id))
            .collect();
        due.sort();

        let mut expired = Vec::new();
        for (_, id) in due {
            let Some(allocation) = state.live.get(&id).cloned() else {
                continue;
            };
            if let Err(e) = self
                .audit
                .record(Self::release_event(AuditEventType::Expired, &allocation, "expired"))
            {
                error!(allocation_id = %id, error = %e, "Expiry not recorded; allocation kept");
                break;
            }
            if let Some(a) = Self::finish_locked(&mut state, id, AllocationStatus::Expired, "expired") {
                expired.push(a);
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired allocations released");
            self.arbitrate_locked(&mut state);
        }
        expired
    }

    /// Release every live allocation (optionally keeping Critical ones) and
    /// drop the whole queue. Runs even when the audit record fails; the
    /// failure is reported in the summary.
    pub fn emergency_release_all(
        &self,
        reason: &str,
        preserve_critical: bool,
    ) -> EmergencyReleaseSummary {
        let mut state = self.state.lock();
        let (preserved, released): (Vec<(Uuid, Priority)>, Vec<(Uuid, Priority)>) = state
            .live
            .values()
            .map(|a| (a.id, a.priority))
            .partition(|(_, p)| preserve_critical && *p == Priority::Critical);
        let preserved: Vec<Uuid> = preserved.into_iter().map(|(id, _)| id).collect();
        let released: Vec<Uuid> = released.into_iter().map(|(id, _)| id).collect();
        let cancelled_requests: Vec<Uuid> = state.queue.iter().map(|p| p.request.id).collect();

        let audit_error = self
            .audit
            .record(
                AuditEvent::new(AuditEventType::EmergencyRelease, AuditSeverity::Critical).payload(
                    json!({
                        "reason": reason,
                        "released": released,
                        "preserved": preserved,
                        "cancelled_requests": cancelled_requests,
                    }),
                ),
            )
            .err()
            .map(|e| e.to_string());
        if let Some(e) = &audit_error {
            error!(error = %e, "Emergency release could not be recorded; releasing anyway");
        }

        for id in &released {
            Self::finish_locked(&mut state, *id, AllocationStatus::Released, reason);
        }
        state.queue.clear();
        state.ledger.clear_pending();
        warn!(
            released = released.len(),
            preserved = preserved.len(),
            cancelled = cancelled_requests.len(),
            reason,
            "Emergency release of all allocations"
        );

        EmergencyReleaseSummary {
            released,
            preserved,
            cancelled_requests,
            audit_error,
        }
    }

    /// Release every live allocation held by `team`.
    ///
    /// One audit record covers the whole batch; when it cannot be written
    /// nothing is released.
    pub fn release_team(&self, team: &str, reason: &str) -> Result<usize, GovernanceError> {
        let mut state = self.state.lock();
        let mut held: Vec<&ResourceAllocation> =
            state.live.values().filter(|a| a.team == team).collect();
        if held.is_empty() {
            return Ok(0);
        }
        held.sort_by_key(|a| a.granted_at);
        let ids: Vec<Uuid> = held.iter().map(|a| a.id).collect();
        let released: Vec<&ResourceMap> = held.iter().map(|a| &a.resources).collect();

        self.audit.record(
            AuditEvent::new(AuditEventType::Released, AuditSeverity::Warning)
                .actor(ActorType::Team, team.to_string())
                .payload(json!({
                    "allocation_ids": ids,
                    "resources": released,
                    "reason": reason,
                })),
        )?;

        let mut count = 0;
        for id in ids {
            if Self::finish_locked(&mut state, id, AllocationStatus::Released, reason).is_some() {
                count += 1;
            }
        }
        if count > 0 {
            info!(team, count, reason, "Team allocations released");
            self.arbitrate_locked(&mut state);
        }
        Ok(count)
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    pub fn pool_status(&self) -> Vec<PoolStatus> {
        self.state.lock().pool.status()
    }

    pub fn allocation(&self, allocation_id: Uuid) -> Option<ResourceAllocation> {
        self.state.lock().live.get(&allocation_id).cloned()
    }

    /// Live allocations, oldest grant first.
    pub fn live_allocations(&self) -> Vec<ResourceAllocation> {
        let state = self.state.lock();
        let mut live: Vec<ResourceAllocation> = state.live.values().cloned().collect();
        live.sort_by_key(|a| a.granted_at);
        live
    }

    /// Pending requests in the order they would be served.
    pub fn pending_requests(&self) -> Vec<ResourceRequest> {
        let state = self.state.lock();
        let mut pending: Vec<Pending> = state.queue.iter().cloned().collect();
        pending.sort_by(|a, b| b.cmp(a));
        pending.into_iter().map(|p| p.request).collect()
    }

    pub fn team_usage(&self, team: &str) -> ResourceMap {
        self.state.lock().ledger.usage(team)
    }

    pub fn snapshot(&self) -> AllocatorSnapshot {
        let state = self.state.lock();
        let mut live: Vec<ResourceAllocation> = state.live.values().cloned().collect();
        live.sort_by_key(|a| a.granted_at);
        let mut pending: Vec<Pending> = state.queue.iter().cloned().collect();
        pending.sort_by(|a, b| b.cmp(a));
        AllocatorSnapshot {
            taken_at: Utc::now(),
            pools: state.pool.status(),
            live,
            pending: pending.into_iter().map(|p| p.request).collect(),
            team_usage: state.ledger.all_usage(),
        }
    }
}

impl ResourceControl for ResourceAllocator {
    fn emergency_release_all(
        &self,
        reason: &str,
        preserve_critical: bool,
    ) -> EmergencyReleaseSummary {
        ResourceAllocator::emergency_release_all(self, reason, preserve_critical)
    }

    fn release_team(&self, team: &str, reason: &str) -> Result<usize, GovernanceError> {
        ResourceAllocator::release_team(self, team, reason)
    }
}

fn request_event(
    event_type: AuditEventType,
    severity: AuditSeverity,
    request: &ResourceRequest,
) -> AuditEvent {
    AuditEvent::new(event_type, severity).actor(ActorType::Team, request.team.clone())
}

fn validate(pool: &ResourcePool, request: &ResourceRequest) -> Result<(), GovernanceError> {
    if request.team.trim().is_empty() {
        return Err(GovernanceError::Validation("team must not be empty".into()));
    }
    if request.resources.is_empty() {
        return Err(GovernanceError::Validation(
            "request must name at least one resource".into(),
        ));
    }
    if request.duration.is_zero() {
        return Err(GovernanceError::Validation(
            "duration must be greater than zero".into(),
        ));
    }
    for (name, qty) in &request.resources {
        if !pool.contains(name) {
            return Err(GovernanceError::Validation(format!(
                "unknown resource type {name:?}"
            )));
        }
        if *qty == 0 {
            return Err(GovernanceError::Validation(format!(
                "quantity of {name:?} must be greater than zero"
            )));
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
