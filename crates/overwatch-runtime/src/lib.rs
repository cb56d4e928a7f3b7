//! `overwatch-runtime` – configuration, lifecycle and telemetry for the
//! governance layer.
//!
//! [`Supervisor::initialize`] opens the audit trail and builds the allocator
//! and safety monitor from one validated [`GovernanceConfig`];
//! [`Supervisor::start`] spawns the periodic workers and
//! [`Supervisor::shutdown`] stops them and every supervised agent.

pub mod config;
pub mod supervisor;
pub mod telemetry;

pub use config::{AuditSection, ConfigError, GovernanceConfig, WorkersConfig};
pub use supervisor::{ShutdownSummary, Supervisor};
