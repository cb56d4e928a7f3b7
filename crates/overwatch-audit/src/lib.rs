//! `overwatch-audit` – tamper-evident record of every governance decision.
//!
//! - [`trail`] – the SQLite-backed, hash-chained [`AuditTrail`] with query,
//!   retention sweep and export.
//! - [`entry`] – stored [`AuditEntry`] rows, canonical hashing and the
//!   BLAKE3 [`AuditSigner`].
//! - [`integrity`] – chain verification and [`IntegrityReport`]s.
//! - [`query`] – [`AuditQuery`] filters.
//! - [`retention`] – policy horizons.
//!
//! # Example
//!
//! ```rust
//! use overwatch_audit::{AuditSigner, AuditTrail};
//! use overwatch_types::{AuditEvent, AuditEventType, AuditSeverity};
//!
//! let trail = AuditTrail::open_in_memory(AuditSigner::from_secret(b"secret")).unwrap();
//! trail
//!     .append(AuditEvent::new(AuditEventType::SystemStarted, AuditSeverity::Info))
//!     .unwrap();
//! assert!(trail.verify_integrity(..).unwrap().ok);
//! ```

pub mod entry;
pub mod integrity;
pub mod query;
pub mod retention;
pub mod trail;

pub use entry::{AuditEntry, AuditSigner, GENESIS_HASH};
pub use integrity::{IntegrityReport, Violation, ViolationKind};
pub use query::{AuditQuery, SortOrder};
pub use retention::{RetentionConfig, RetentionReport};
pub use trail::{AuditError, AuditExport, AuditTrail, verify_export};
