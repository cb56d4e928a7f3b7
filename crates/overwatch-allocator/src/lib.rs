//! `overwatch-allocator` – priority arbitration of finite compute resources
//! across teams.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use overwatch_allocator::{resources, AllocatorConfig, Priority, ResourceAllocator, ResourceRequest};
//! use overwatch_types::{AuditEvent, AuditSink, GovernanceError};
//!
//! struct Discard;
//! impl AuditSink for Discard {
//!     fn record(&self, _: AuditEvent) -> Result<u64, GovernanceError> { Ok(0) }
//! }
//!
//! let config = AllocatorConfig { pools: resources([("cpu", 100)]), ..Default::default() };
//! let allocator = ResourceAllocator::new(config, Arc::new(Discard)).unwrap();
//! let outcome = allocator
//!     .request(ResourceRequest::new("alpha", resources([("cpu", 10)]), Priority::Normal, Duration::from_secs(60)))
//!     .unwrap();
//! assert!(outcome.allocation_id().is_some());
//! ```

pub mod allocator;
pub mod config;
pub mod pool;
pub mod quota;
pub mod request;

pub use allocator::{AllocatorSnapshot, ResourceAllocator};
pub use config::AllocatorConfig;
pub use pool::{PoolStatus, ResourcePool};
pub use quota::TeamLedger;
pub use request::{
    AllocationStatus, DenialReason, Priority, RequestOutcome, RequestStatus, ResourceAllocation,
    ResourceMap, ResourceRequest, resources,
};
