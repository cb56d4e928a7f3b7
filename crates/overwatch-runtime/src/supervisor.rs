//! [`Supervisor`] – wires the audit trail, allocator and safety monitor
//! together and runs their periodic workers.
//!
//! | Worker | Period | Work |
//! |---|---|---|
//! | arbitration | `workers.arbitration_interval_ms` | drain the allocator queue |
//! | expiry | `workers.expiry_sweep_secs` | release expired allocations |
//! | sampling | `workers.sampling_interval_ms` | kill-switch cool-down, threshold cycle |
//! | retention | `workers.retention_sweep_secs` | archive audit entries past their horizon |
//!
//! Worker bodies take blocking locks and touch SQLite, so each tick runs on
//! the blocking pool. Every worker watches one shutdown signal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use overwatch_allocator::ResourceAllocator;
use overwatch_audit::{AuditSigner, AuditTrail, IntegrityReport};
use overwatch_safety::{
    AgentController, EmergencyStopReport, LoggingAgentController, SafetyMonitor, ShutdownReport,
};
use overwatch_types::{AuditEvent, AuditEventType, AuditSeverity, AuditSink, GovernanceError};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::GovernanceConfig;

struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// What [`Supervisor::shutdown`] did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownSummary {
    /// `false` when a worker had to be aborted at the timeout.
    pub workers_stopped: bool,
    pub graceful: Option<ShutdownReport>,
    pub emergency: Option<EmergencyStopReport>,
    pub allocator_snapshot: Option<PathBuf>,
}

pub struct Supervisor {
    config: GovernanceConfig,
    audit: Arc<AuditTrail>,
    allocator: Arc<ResourceAllocator>,
    monitor: Arc<SafetyMonitor>,
    workers: Mutex<Option<Workers>>,
}

impl Supervisor {
    /// Open the audit trail and build every component with a logging-only
    /// agent controller.
    pub fn initialize(config: GovernanceConfig) -> Result<Self, GovernanceError> {
        Self::initialize_with_controller(config, Arc::new(LoggingAgentController))
    }

    /// As [`Supervisor::initialize`], with the host's own controller.
    pub fn initialize_with_controller(
        config: GovernanceConfig,
        controller: Arc<dyn AgentController>,
    ) -> Result<Self, GovernanceError> {
        config.validate()?;

        if let Some(parent) = config
            .audit
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                GovernanceError::Configuration(format!(
                    "cannot create audit directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let signer = AuditSigner::from_secret(config.audit.secret.as_bytes());
        let audit = Arc::new(
            AuditTrail::open(&config.audit.path, signer)?
                .with_retention(config.audit.retention.clone()),
        );

        let report = audit.verify_integrity(..)?;
        if !report.ok {
            // Reported and recorded, never repaired.
            error!(
                violations = report.violations.len(),
                "Audit trail failed integrity verification at startup"
            );
            audit.record(
                AuditEvent::new(AuditEventType::IntegrityViolation, AuditSeverity::Critical)
                    .payload(json!({ "violations": report.violations })),
            )?;
        }

        let allocator = Arc::new(ResourceAllocator::new(
            config.allocator.clone(),
            audit.clone(),
        )?);
        let monitor = Arc::new(
            SafetyMonitor::new(config.safety.clone(), controller, audit.clone())?
                .with_resource_control(
                    allocator.clone(),
                    config.allocator.preserve_critical_on_emergency,
                ),
        );

        audit.record(
            AuditEvent::new(AuditEventType::SystemStarted, AuditSeverity::Info).payload(json!({
                "pools": config.allocator.pools,
                "thresholds": config.safety.thresholds.len(),
                "audit_head": report.last_sequence,
            })),
        )?;
        info!(path = %config.audit.path.display(), "Governance layer initialised");

        Ok(Self {
            config,
            audit,
            allocator,
            monitor,
            workers: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.allocator
    }

    pub fn monitor(&self) -> &Arc<SafetyMonitor> {
        &self.monitor
    }

    /// Full-chain integrity check.
    pub fn verify_audit(&self) -> Result<IntegrityReport, GovernanceError> {
        Ok(self.audit.verify_integrity(..)?)
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().is_some()
    }

    /// Spawn the periodic workers on the current Tokio runtime.
    pub fn start(&self) -> Result<(), GovernanceError> {
        let mut slot = self.workers.lock();
        if slot.is_some() {
            return Err(GovernanceError::Validation("supervisor already started".into()));
        }
        let (tx, rx) = watch::channel(false);
        let w = &self.config.workers;
        let mut handles = Vec::with_capacity(4);

        let allocator = self.allocator.clone();
        handles.push(spawn_worker("arbitration", w.arbitration_interval(), rx.clone(), move || {
            let allocator = allocator.clone();
            async move {
                let granted = blocking(move || allocator.arbitrate()).await;
                if let Some(granted) = granted.filter(|g| !g.is_empty()) {
                    debug!(count = granted.len(), "Queued requests granted");
                }
            }
        }));

        let allocator = self.allocator.clone();
        handles.push(spawn_worker("expiry", w.expiry_sweep(), rx.clone(), move || {
            let allocator = allocator.clone();
            async move {
                blocking(move || allocator.sweep_expired(Utc::now())).await;
            }
        }));

        let monitor = self.monitor.clone();
        handles.push(spawn_worker("sampling", w.sampling_interval(), rx.clone(), move || {
            let monitor = monitor.clone();
            async move {
                blocking(move || {
                    monitor.poll_kill_switch();
                    monitor.run_cycle()
                })
                .await;
            }
        }));

        let audit = self.audit.clone();
        handles.push(spawn_worker("retention", w.retention_sweep(), rx, move || {
            let audit = audit.clone();
            async move {
                if let Some(Err(e)) = blocking(move || audit.apply_retention(Utc::now())).await {
                    error!(error = %e, "Retention sweep failed");
                }
            }
        }));

        *slot = Some(Workers {
            shutdown: tx,
            handles,
        });
        info!("Governance workers started");
        Ok(())
    }

    /// Stop the workers, then stop every agent.
    ///
    /// `graceful` pauses agents and terminates them one by one within
    /// `timeout`; otherwise an emergency stop is raised (falling back to a
    /// forced shutdown when the kill switch is not armed). The allocator
    /// snapshot is written when `save_state` is configured.
    pub async fn shutdown(
        &self,
        graceful: bool,
        timeout: Duration,
    ) -> Result<ShutdownSummary, GovernanceError> {
        let mut summary = ShutdownSummary {
            workers_stopped: true,
            ..ShutdownSummary::default()
        };

        let workers = self.workers.lock().take();
        if let Some(workers) = workers {
            let _ = workers.shutdown.send(true);
            for handle in workers.handles {
                let abort = handle.abort_handle();
                if tokio::time::timeout(timeout, handle).await.is_err() {
                    warn!("Worker did not stop within the timeout; aborting");
                    abort.abort();
                    summary.workers_stopped = false;
                }
            }
        }

        let monitor = self.monitor.clone();
        if graceful {
            summary.graceful =
                blocking(move || monitor.graceful_shutdown(timeout)).await;
        } else {
            let stopped = blocking(move || {
                monitor
                    .emergency_stop("supervisor shutdown", timeout)
                    .map_err(|e| (e, monitor.graceful_shutdown(Duration::ZERO)))
            })
            .await;
            match stopped {
                Some(Ok(report)) => summary.emergency = Some(report),
                Some(Err((e, forced))) => {
                    warn!(error = %e, "Emergency stop refused; agents force-terminated");
                    summary.graceful = Some(forced);
                }
                None => {}
            }
        }

        if self.config.safety.kill_switch.save_state
            && let Some(path) = &self.config.safety.kill_switch.snapshot_path
        {
            let path = path.with_extension("allocator.json");
            let snapshot = self.allocator.snapshot();
            let written = serde_json::to_vec_pretty(&snapshot)
                .map_err(std::io::Error::from)
                .and_then(|json| std::fs::write(&path, json));
            match written {
                Ok(()) => summary.allocator_snapshot = Some(path),
                Err(e) => error!(path = %path.display(), error = %e, "Allocator snapshot not saved"),
            }
        }

        info!(graceful, "Governance layer shut down");
        Ok(summary)
    }
}

/// Run `work` on the blocking pool. `None` if it panicked.
async fn blocking<T, F>(work: F) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(v) => Some(v),
        Err(e) => {
            error!(error = %e, "Blocking task failed");
            None
        }
    }
}

fn spawn_worker<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        debug!(worker = name, ?period, "Worker started");
        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(worker = name, "Worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use overwatch_allocator::{Priority, ResourceRequest, resources};
    use overwatch_audit::AuditQuery;
    use overwatch_safety::{ActivityReport, SafetyLevel};
    use std::path::Path;

    fn config_for(dir: &Path) -> GovernanceConfig {
        let raw = format!(
            r#"
[audit]
path = "{audit}"
secret = "test-secret"

[allocator]
max_duration_secs = 600

[allocator.pools]
cpu = 100

[allocator.team_ceilings.alpha]
cpu = 80

[safety]
max_concurrent_agents = 8

[safety.kill_switch]
save_state = true
snapshot_path = "{snapshot}"

[[safety.thresholds]]
name = "cpu-emergency"
metric = "cpu"
operator = ">"
value = 95.0
severity = "emergency"

[workers]
arbitration_interval_ms = 10
sampling_interval_ms = 10
expiry_sweep_secs = 1
retention_sweep_secs = 1
"#,
            audit = dir.join("audit.db").display(),
            snapshot = dir.join("safety.json").display(),
        );
        GovernanceConfig::from_toml_str(&raw).unwrap()
    }

    fn cpu(team: &str, n: u64) -> ResourceRequest {
        ResourceRequest::new(team, resources([("cpu", n)]), Priority::Normal, Duration::from_secs(60))
    }

    #[test]
    fn ceiling_scenario_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::initialize(config_for(dir.path())).unwrap();
        let alloc = sup.allocator();

        assert!(alloc.request(cpu("alpha", 90)).unwrap().is_denied());
        assert!(alloc.request(cpu("alpha", 50)).unwrap().allocation_id().is_some());
        assert!(alloc.request(cpu("alpha", 50)).unwrap().is_denied());

        let denied = sup
            .audit()
            .query(&AuditQuery::new().event_type(AuditEventType::ResourceDenied))
            .unwrap();
        assert_eq!(denied.len(), 2);
        assert!(sup.verify_audit().unwrap().ok);
    }

    #[test]
    fn emergency_scenario_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::initialize(config_for(dir.path())).unwrap();
        sup.allocator().request(cpu("alpha", 40)).unwrap();
        sup.monitor()
            .register_agent_for_team("agent-1", Some("alpha"))
            .unwrap();
        sup.monitor()
            .report_activity("agent-1", ActivityReport::success().cpu(96.0))
            .unwrap();

        let cycle = sup.monitor().run_cycle();
        assert_eq!(cycle.level, SafetyLevel::Emergency);
        assert!(sup.allocator().live_allocations().is_empty());
        assert_eq!(sup.allocator().pool_status()[0].available, 100);

        let stops = sup
            .audit()
            .query(&AuditQuery::new().event_type(AuditEventType::EmergencyStop))
            .unwrap();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].severity, AuditSeverity::Critical);

        let released = sup
            .audit()
            .query(&AuditQuery::new().event_type(AuditEventType::EmergencyRelease))
            .unwrap();
        assert_eq!(released.len(), 1);
        assert!(sup.verify_audit().unwrap().ok);
    }

    #[test]
    fn reopening_resumes_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let head = {
            let sup = Supervisor::initialize(config_for(dir.path())).unwrap();
            sup.allocator().request(cpu("alpha", 10)).unwrap();
            sup.audit().head()
        };
        let sup = Supervisor::initialize(config_for(dir.path())).unwrap();
        let started = sup
            .audit()
            .query(&AuditQuery::new().event_type(AuditEventType::SystemStarted))
            .unwrap();
        assert_eq!(started.len(), 2);
        assert_eq!(started[1].previous_hash, head.1);
        assert!(sup.verify_audit().unwrap().ok);
    }

    #[tokio::test]
    async fn workers_run_and_shut_down_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::initialize(config_for(dir.path())).unwrap();
        sup.monitor().register_agent("agent-1").unwrap();
        sup.start().unwrap();
        assert!(sup.is_running());
        assert!(matches!(sup.start(), Err(GovernanceError::Validation(_))));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let summary = sup.shutdown(true, Duration::from_secs(2)).await.unwrap();
        assert!(summary.workers_stopped);
        assert!(!sup.is_running());
        let graceful = summary.graceful.unwrap();
        assert_eq!(graceful.terminated, vec!["agent-1".to_string()]);
        assert!(dir.path().join("safety.json").exists());
        assert_eq!(
            summary.allocator_snapshot,
            Some(dir.path().join("safety.allocator.json"))
        );

        let shutdown = sup
            .audit()
            .query(&AuditQuery::new().event_type(AuditEventType::SystemShutdown))
            .unwrap();
        assert_eq!(shutdown.len(), 1);
    }

    #[tokio::test]
    async fn queued_request_is_granted_by_the_arbitration_worker() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::initialize(config_for(dir.path())).unwrap();
        let first = sup.allocator().request(cpu("beta", 70)).unwrap();
        let queued = sup.allocator().request(cpu("gamma", 50)).unwrap();
        assert!(queued.allocation_id().is_none() && !queued.is_denied());

        sup.start().unwrap();
        sup.allocator()
            .release(first.allocation_id().unwrap(), "done")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sup.allocator().live_allocations().len(), 1);
        assert!(sup.allocator().pending_requests().is_empty());
        sup.shutdown(true, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn forced_shutdown_raises_emergency_stop() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::initialize(config_for(dir.path())).unwrap();
        sup.monitor().register_agent("agent-1").unwrap();
        let summary = sup.shutdown(false, Duration::from_secs(1)).await.unwrap();
        let stop = summary.emergency.unwrap();
        assert_eq!(stop.force_terminated, vec!["agent-1".to_string()]);
    }

    #[test]
    fn tampered_trail_is_flagged_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_for(dir.path());
        {
            let sup = Supervisor::initialize(cfg.clone()).unwrap();
            sup.allocator().request(cpu("alpha", 10)).unwrap();
        }
        forge_entry(&dir.path().join("audit.db"));

        let sup = Supervisor::initialize(cfg).unwrap();
        let flagged = sup
            .audit()
            .query(&AuditQuery::new().event_type(AuditEventType::IntegrityViolation))
            .unwrap();
        assert_eq!(flagged.len(), 1);
        assert!(!sup.verify_audit().unwrap().ok);
    }

    /// Append a correctly chained entry signed with the wrong secret.
    fn forge_entry(path: &Path) {
        let forged = AuditTrail::open(path, AuditSigner::from_secret(b"not-the-secret")).unwrap();
        forged
            .append(AuditEvent::new(AuditEventType::Allocated, AuditSeverity::Info))
            .unwrap();
    }
}
