//! SQLite-backed, hash-chained audit trail.
//!
//! # Storage layout
//!
//! A single table `audit_entries`:
//!
//! | column        | type    | hashed | description                           |
//! |---------------|---------|--------|---------------------------------------|
//! | sequence      | INTEGER | yes    | 1-based, gap-free primary key         |
//! | entry_id      | TEXT    | yes    | UUID v4                               |
//! | timestamp     | TEXT    | yes    | RFC 3339 UTC, microseconds            |
//! | actor_type    | TEXT    | yes    | `system`, `agent`, `team`, `operator` |
//! | actor_id      | TEXT    | yes    |                                       |
//! | event_type    | TEXT    | yes    |                                       |
//! | category      | TEXT    | yes    |                                       |
//! | severity      | TEXT    | yes    | `INFO` … `CRITICAL`                   |
//! | payload       | TEXT    | yes    | JSON, sorted keys                     |
//! | retention     | TEXT    | yes    | retention policy tag                  |
//! | previous_hash | TEXT    | yes    | predecessor's `current_hash`          |
//! | current_hash  | TEXT    | –      | SHA-256 over the hashed columns       |
//! | signature     | TEXT    | –      | BLAKE3 keyed hash                     |
//! | archived      | INTEGER | no     | set by the retention sweep            |
//! | archived_at   | TEXT    | no     |                                       |
//!
//! The database runs in WAL mode with `synchronous = FULL`, so an append is
//! on disk before [`AuditTrail::append`] returns.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::ops::{Bound, RangeBounds};
use std::path::Path;

use chrono::{DateTime, SubsecRound, Utc};
use overwatch_types::{
    ActorType, AuditCategory, AuditEvent, AuditEventType, AuditSeverity, AuditSink,
    GovernanceError, RetentionPolicy,
};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entry::{AuditEntry, AuditSigner, GENESIS_HASH, format_timestamp};
use crate::integrity::{ChainWalker, IntegrityReport, Violation, ViolationKind};
use crate::query::AuditQuery;
use crate::retention::{RetentionConfig, RetentionReport};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed audit entry {sequence}: {detail}")]
    Malformed { sequence: u64, detail: String },
}

impl From<AuditError> for GovernanceError {
    fn from(err: AuditError) -> Self {
        GovernanceError::AuditStorage(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row decoding
// ─────────────────────────────────────────────────────────────────────────────

const COLUMNS: &str = "sequence, entry_id, timestamp, actor_type, actor_id, event_type, \
     category, severity, payload, retention, previous_hash, current_hash, signature, \
     archived, archived_at";

/// A row as stored, before any field is interpreted.
struct RawRow {
    sequence: u64,
    entry_id: String,
    timestamp: String,
    actor_type: String,
    actor_id: String,
    event_type: String,
    category: String,
    severity: String,
    payload: String,
    retention: String,
    previous_hash: String,
    current_hash: String,
    signature: String,
    archived: bool,
    archived_at: Option<String>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence: row.get::<_, i64>(0)? as u64,
            entry_id: row.get(1)?,
            timestamp: row.get(2)?,
            actor_type: row.get(3)?,
            actor_id: row.get(4)?,
            event_type: row.get(5)?,
            category: row.get(6)?,
            severity: row.get(7)?,
            payload: row.get(8)?,
            retention: row.get(9)?,
            previous_hash: row.get(10)?,
            current_hash: row.get(11)?,
            signature: row.get(12)?,
            archived: row.get::<_, i64>(13)? != 0,
            archived_at: row.get(14)?,
        })
    }

    fn decode(self) -> Result<AuditEntry, String> {
        fn parse_ts(s: &str) -> Result<DateTime<Utc>, String> {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| format!("bad timestamp {s:?}: {e}"))
        }

        let id = Uuid::parse_str(&self.entry_id).map_err(|e| format!("bad entry id: {e}"))?;
        let timestamp = parse_ts(&self.timestamp)?;
        let actor_type = ActorType::parse(&self.actor_type)
            .ok_or_else(|| format!("unknown actor type {:?}", self.actor_type))?;
        let category = AuditCategory::parse(&self.category)
            .ok_or_else(|| format!("unknown category {:?}", self.category))?;
        let severity = AuditSeverity::parse(&self.severity)
            .ok_or_else(|| format!("unknown severity {:?}", self.severity))?;
        let retention = RetentionPolicy::parse(&self.retention)
            .ok_or_else(|| format!("unknown retention policy {:?}", self.retention))?;
        let archived_at = self.archived_at.as_deref().map(parse_ts).transpose()?;

        Ok(AuditEntry {
            sequence: self.sequence,
            id,
            timestamp,
            actor_type,
            actor_id: self.actor_id,
            event_type: AuditEventType::parse(&self.event_type),
            category,
            severity,
            payload: self.payload,
            retention,
            previous_hash: self.previous_hash,
            current_hash: self.current_hash,
            signature: self.signature,
            archived: self.archived,
            archived_at,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Export document
// ─────────────────────────────────────────────────────────────────────────────

/// Self-contained copy of the trail written by [`AuditTrail::export`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditExport {
    pub exported_at: DateTime<Utc>,
    pub head_sequence: u64,
    pub head_hash: String,
    pub entries: Vec<AuditEntry>,
}

// ─────────────────────────────────────────────────────────────────────────────
// AuditTrail
// ─────────────────────────────────────────────────────────────────────────────

struct TrailInner {
    conn: Connection,
    last_sequence: u64,
    last_hash: String,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Append-only audit trail.
///
/// The connection and the chain cursor (last sequence, last hash) share one
/// mutex, so appends are strictly serialised and the cursor only moves after
/// the row is durably stored.
pub struct AuditTrail {
    inner: Mutex<TrailInner>,
    signer: AuditSigner,
    retention: RetentionConfig,
}

impl AuditTrail {
    /// Open (or create) a trail at `path`, resuming the chain from its last
    /// stored entry.
    pub fn open(path: impl AsRef<Path>, signer: AuditSigner) -> Result<Self, AuditError> {
        let conn = Connection::open(path.as_ref())?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        let trail = Self::with_connection(conn, signer)?;
        info!(
            path = %path.as_ref().display(),
            journal_mode = %mode,
            head = trail.head().0,
            "Audit trail opened"
        );
        Ok(trail)
    }

    /// Open a temporary in-memory trail (useful for testing).
    pub fn open_in_memory(signer: AuditSigner) -> Result<Self, AuditError> {
        Self::with_connection(Connection::open_in_memory()?, signer)
    }

    fn with_connection(conn: Connection, signer: AuditSigner) -> Result<Self, AuditError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_entries (
                sequence      INTEGER NOT NULL PRIMARY KEY,
                entry_id      TEXT    NOT NULL UNIQUE,
                timestamp     TEXT    NOT NULL,
                actor_type    TEXT    NOT NULL,
                actor_id      TEXT    NOT NULL,
                event_type    TEXT    NOT NULL,
                category      TEXT    NOT NULL,
                severity      TEXT    NOT NULL,
                payload       TEXT    NOT NULL,
                retention     TEXT    NOT NULL,
                previous_hash TEXT    NOT NULL,
                current_hash  TEXT    NOT NULL,
                signature     TEXT    NOT NULL,
                archived      INTEGER NOT NULL DEFAULT 0,
                archived_at   TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_entries(timestamp);
            CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_entries(actor_id);
            CREATE INDEX IF NOT EXISTS idx_audit_event_type ON audit_entries(event_type);",
        )?;

        let head: Option<(i64, String, String)> = conn
            .query_row(
                "SELECT sequence, current_hash, timestamp FROM audit_entries
                 ORDER BY sequence DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (last_sequence, last_hash, last_timestamp) = match head {
            Some((seq, hash, ts)) => {
                let ts = DateTime::parse_from_rfc3339(&ts)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| AuditError::Malformed {
                        sequence: seq as u64,
                        detail: format!("bad timestamp {ts:?}: {e}"),
                    })?;
                (seq as u64, hash, Some(ts))
            }
            None => (0, GENESIS_HASH.to_string(), None),
        };

        Ok(Self {
            inner: Mutex::new(TrailInner {
                conn,
                last_sequence,
                last_hash,
                last_timestamp,
            }),
            signer,
            retention: RetentionConfig::default(),
        })
    }

    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    pub fn signer(&self) -> &AuditSigner {
        &self.signer
    }

    /// `(sequence, hash)` of the last appended entry; `(0, GENESIS_HASH)` when
    /// the trail is empty.
    pub fn head(&self) -> (u64, String) {
        let inner = self.inner.lock();
        (inner.last_sequence, inner.last_hash.clone())
    }

    /// Append `event`, returning the stored entry.
    ///
    /// The timestamp never runs backwards: when the wall clock is behind the
    /// previous entry, the previous timestamp is reused.
    pub fn append(&self, event: AuditEvent) -> Result<AuditEntry, AuditError> {
        let payload = serde_json::to_string(&event.payload)?;
        let mut inner = self.inner.lock();

        let mut timestamp = Utc::now().trunc_subsecs(6);
        if let Some(last) = inner.last_timestamp {
            if timestamp < last {
                timestamp = last;
            }
        }

        let mut entry = AuditEntry {
            sequence: inner.last_sequence + 1,
            id: Uuid::new_v4(),
            timestamp,
            actor_type: event.actor_type,
            actor_id: event.actor_id,
            event_type: event.event_type,
            category: event.category,
            severity: event.severity,
            payload,
            retention: event.retention,
            previous_hash: inner.last_hash.clone(),
            current_hash: String::new(),
            signature: String::new(),
            archived: false,
            archived_at: None,
        };
        entry.current_hash = entry.compute_hash();
        entry.signature = self
            .signer
            .sign(&entry.id, &entry.current_hash, &entry.timestamp);

        inner.conn.execute(
            &format!(
                "INSERT INTO audit_entries ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0, NULL)"
            ),
            params![
                entry.sequence as i64,
                entry.id.to_string(),
                format_timestamp(&entry.timestamp),
                entry.actor_type.as_str(),
                entry.actor_id,
                entry.event_type.as_str(),
                entry.category.as_str(),
                entry.severity.as_str(),
                entry.payload,
                entry.retention.as_str(),
                entry.previous_hash,
                entry.current_hash,
                entry.signature,
            ],
        )?;

        inner.last_sequence = entry.sequence;
        inner.last_hash = entry.current_hash.clone();
        inner.last_timestamp = Some(entry.timestamp);
        debug!(
            sequence = entry.sequence,
            event_type = %entry.event_type,
            actor = %entry.actor_id,
            "Audit entry appended"
        );
        Ok(entry)
    }

    /// Fetch one entry by sequence number.
    pub fn entry(&self, sequence: u64) -> Result<Option<AuditEntry>, AuditError> {
        let inner = self.inner.lock();
        let raw = inner
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM audit_entries WHERE sequence = ?1"),
                params![sequence as i64],
                RawRow::from_row,
            )
            .optional()?;
        raw.map(|r| r.decode().map_err(|detail| AuditError::Malformed { sequence, detail }))
            .transpose()
    }

    pub fn len(&self) -> Result<u64, AuditError> {
        let inner = self.inner.lock();
        let n: i64 = inner
            .conn
            .query_row("SELECT COUNT(*) FROM audit_entries", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn is_empty(&self) -> Result<bool, AuditError> {
        Ok(self.len()? == 0)
    }

    /// Entries matching `query`.
    pub fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, AuditError> {
        let (tail, values) = query.to_sql();
        let inner = self.inner.lock();
        let mut stmt = inner
            .conn
            .prepare(&format!("SELECT {COLUMNS} FROM audit_entries{tail}"))?;
        let rows = stmt.query_map(params_from_iter(values.iter()), RawRow::from_row)?;

        let mut entries = Vec::new();
        for row in rows {
            let raw = row?;
            let sequence = raw.sequence;
            let entry = raw
                .decode()
                .map_err(|detail| AuditError::Malformed { sequence, detail })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Recompute the chain over `range` and report every violation found.
    ///
    /// A range not starting at 1 is anchored on the stored hash of its
    /// predecessor. When the range reaches the end of the trail, the last
    /// stored row is also compared with the in-memory head to catch a
    /// truncated tail.
    pub fn verify_integrity<R: RangeBounds<u64>>(
        &self,
        range: R,
    ) -> Result<IntegrityReport, AuditError> {
        let start = match range.start_bound() {
            Bound::Included(&s) => s.max(1),
            Bound::Excluded(&s) => s + 1,
            Bound::Unbounded => 1,
        };
        let end = match range.end_bound() {
            Bound::Included(&e) => Some(e),
            Bound::Excluded(&e) => Some(e.saturating_sub(1)),
            Bound::Unbounded => None,
        };

        let inner = self.inner.lock();
        let anchor = if start == 1 {
            Some(GENESIS_HASH.to_string())
        } else {
            inner
                .conn
                .query_row(
                    "SELECT current_hash FROM audit_entries WHERE sequence = ?1",
                    params![(start - 1) as i64],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
        };

        let mut walker = ChainWalker::new(&self.signer, Some(start), anchor);
        let upper = end.map_or(i64::MAX, |e| e.min(i64::MAX as u64) as i64);
        let mut stmt = inner.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM audit_entries
             WHERE sequence >= ?1 AND sequence <= ?2 ORDER BY sequence ASC"
        ))?;
        let rows = stmt.query_map(params![start as i64, upper], |row| {
            // Keep going when one row's columns have the wrong SQL type.
            let sequence = row.get::<_, i64>(0)? as u64;
            Ok(RawRow::from_row(row).map_err(|e| (sequence, e.to_string())))
        })?;

        for row in rows {
            match row? {
                Ok(raw) => {
                    let sequence = raw.sequence;
                    let stored_hash = raw.current_hash.clone();
                    match raw.decode() {
                        Ok(entry) => walker.visit(&entry),
                        Err(detail) => walker.visit_malformed(sequence, Some(stored_hash), detail),
                    }
                }
                Err((sequence, detail)) => walker.visit_malformed(sequence, None, detail),
            }
        }

        if end.is_none_or(|e| e >= inner.last_sequence) {
            walker.expect_head(inner.last_sequence);
        }
        drop(stmt);
        drop(inner);

        let report = walker.finish();
        if report.ok {
            debug!(checked = report.checked, "Audit chain verified");
        } else {
            warn!(
                checked = report.checked,
                violations = report.violations.len(),
                "Audit chain verification found violations"
            );
        }
        Ok(report)
    }

    /// Flag every entry past its policy horizon as archived, then record the
    /// sweep itself when anything changed.
    pub fn apply_retention(&self, now: DateTime<Utc>) -> Result<RetentionReport, AuditError> {
        let mut report = RetentionReport {
            swept_at: Some(now),
            ..RetentionReport::default()
        };
        {
            let inner = self.inner.lock();
            let archived_at = format_timestamp(&now);
            for policy in RetentionPolicy::ALL {
                let cutoff = format_timestamp(&self.retention.cutoff(policy, now));
                let n = inner.conn.execute(
                    "UPDATE audit_entries SET archived = 1, archived_at = ?1
                     WHERE archived = 0 AND retention = ?2 AND timestamp < ?3",
                    params![archived_at, policy.as_str(), cutoff],
                )?;
                if n > 0 {
                    report.archived.insert(policy.as_str().to_string(), n);
                }
            }
        }

        if report.total() > 0 {
            info!(archived = report.total(), "Retention sweep archived audit entries");
            self.append(
                AuditEvent::new(AuditEventType::RetentionSweep, AuditSeverity::Info)
                    .payload(serde_json::json!({ "archived": report.archived })),
            )?;
        }
        Ok(report)
    }

    /// Write every entry, archived ones included, to `path` as JSON.
    pub fn export(&self, path: impl AsRef<Path>) -> Result<AuditExport, AuditError> {
        let (head_sequence, head_hash) = self.head();
        let mut query = AuditQuery::new().include_archived();
        query.to_sequence = Some(head_sequence);
        let entries = self.query(&query)?;
        let export = AuditExport {
            exported_at: Utc::now(),
            head_sequence,
            head_hash,
            entries,
        };

        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &export)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        info!(
            path = %path.as_ref().display(),
            entries = export.entries.len(),
            "Audit trail exported"
        );
        Ok(export)
    }
}

/// Verify an export file on its own, without touching the live store.
pub fn verify_export(
    path: impl AsRef<Path>,
    signer: &AuditSigner,
) -> Result<IntegrityReport, AuditError> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let export: AuditExport = serde_json::from_reader(reader)?;

    let mut walker = ChainWalker::new(signer, Some(1), Some(GENESIS_HASH.to_string()));
    for entry in &export.entries {
        walker.visit(entry);
    }
    walker.expect_head(export.head_sequence);

    let mut report = walker.finish();
    let tail_hash = export.entries.last().map(|e| e.current_hash.as_str());
    if export.head_sequence > 0 && tail_hash != Some(export.head_hash.as_str()) {
        report.violations.push(Violation {
            sequence: export.head_sequence,
            kind: ViolationKind::BrokenLink,
            detail: "head hash does not match the last exported entry".to_string(),
        });
        report.ok = false;
    }
    Ok(report)
}

impl AuditSink for AuditTrail {
    fn record(&self, event: AuditEvent) -> Result<u64, GovernanceError> {
        Ok(self.append(event)?.sequence)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn signer() -> AuditSigner {
        AuditSigner::from_secret(b"unit-test-secret")
    }

    fn event(n: u64) -> AuditEvent {
        AuditEvent::new(AuditEventType::Allocated, AuditSeverity::Info)
            .actor(ActorType::Team, "alpha")
            .payload(json!({ "n": n, "resources": { "cpu": 10, "gpu": 1 } }))
    }

    fn on_disk(n: u64) -> (tempfile::TempDir, std::path::PathBuf, AuditTrail) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        let trail = AuditTrail::open(&path, signer()).unwrap();
        for i in 0..n {
            trail.append(event(i)).unwrap();
        }
        (dir, path, trail)
    }

    /// Simulate an attacker with direct database access.
    fn tamper(path: &Path, sql: &str) {
        let conn = Connection::open(path).unwrap();
        conn.execute(sql, []).unwrap();
    }

    #[test]
    fn append_chains_entries() {
        let trail = AuditTrail::open_in_memory(signer()).unwrap();
        let first = trail.append(event(1)).unwrap();
        let second = trail.append(event(2)).unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(first.previous_hash, GENESIS_HASH);
        assert_eq!(second.previous_hash, first.current_hash);
        assert!(second.timestamp >= first.timestamp);
        assert_eq!(trail.head(), (2, second.current_hash.clone()));
        assert_eq!(trail.len().unwrap(), 2);
    }

    #[test]
    fn stored_rows_reproduce_their_hashes() {
        let trail = AuditTrail::open_in_memory(signer()).unwrap();
        for i in 0..10 {
            trail.append(event(i)).unwrap();
        }
        for entry in trail.query(&AuditQuery::new()).unwrap() {
            assert_eq!(entry.compute_hash(), entry.current_hash);
            assert!(trail.signer().verify(&entry));
        }
        let report = trail.verify_integrity(..).unwrap();
        assert!(report.ok, "{:?}", report.violations);
        assert_eq!(report.checked, 10);
    }

    #[test]
    fn payload_keys_are_stored_sorted() {
        let trail = AuditTrail::open_in_memory(signer()).unwrap();
        let entry = trail
            .append(
                AuditEvent::new(AuditEventType::Custom("Note".into()), AuditSeverity::Info)
                    .payload(json!({ "zeta": 1, "alpha": 2 })),
            )
            .unwrap();
        assert_eq!(entry.payload, r#"{"alpha":2,"zeta":1}"#);
        assert_eq!(entry.payload_value().unwrap()["zeta"], 1);
    }

    #[test]
    fn reopen_resumes_chain() {
        let (_dir, path, trail) = on_disk(3);
        let head = trail.head();
        drop(trail);

        let reopened = AuditTrail::open(&path, signer()).unwrap();
        assert_eq!(reopened.head(), head);
        let next = reopened.append(event(9)).unwrap();
        assert_eq!(next.sequence, 4);
        assert_eq!(next.previous_hash, head.1);
        assert!(reopened.verify_integrity(..).unwrap().ok);
    }

    #[test]
    fn edited_payload_is_a_hash_mismatch_at_that_sequence() {
        let (_dir, path, trail) = on_disk(5);
        tamper(&path, r#"UPDATE audit_entries SET payload = '{"n":99}' WHERE sequence = 3"#);

        let report = trail.verify_integrity(..).unwrap();
        assert!(!report.ok);
        assert!(report.has(3, ViolationKind::HashMismatch));
        assert_eq!(report.violations.len(), 1);
    }

    #[test]
    fn downgraded_retention_tag_is_detected() {
        let (_dir, path, trail) = on_disk(2);
        tamper(
            &path,
            "UPDATE audit_entries SET retention = 'permanent' WHERE sequence = 1",
        );
        assert!(trail.verify_integrity(..).unwrap().has(1, ViolationKind::HashMismatch));
    }

    #[test]
    fn unknown_retention_tag_is_malformed() {
        let (_dir, path, trail) = on_disk(3);
        tamper(&path, "UPDATE audit_entries SET retention = 'forever' WHERE sequence = 2");

        let report = trail.verify_integrity(..).unwrap();
        assert!(report.has(2, ViolationKind::Malformed));
        // The stored hash of row 2 still anchors row 3.
        assert!(!report.has(3, ViolationKind::BrokenLink));
    }

    #[test]
    fn forged_signature_is_detected() {
        let (_dir, path, trail) = on_disk(2);
        tamper(
            &path,
            &format!(
                "UPDATE audit_entries SET signature = '{}' WHERE sequence = 2",
                "ab".repeat(32)
            ),
        );
        let report = trail.verify_integrity(..).unwrap();
        assert!(report.has(2, ViolationKind::InvalidSignature));
    }

    #[test]
    fn deleted_rows_are_gaps_and_truncation() {
        let (_dir, path, trail) = on_disk(5);
        tamper(&path, "DELETE FROM audit_entries WHERE sequence = 2");
        tamper(&path, "DELETE FROM audit_entries WHERE sequence = 5");

        let report = trail.verify_integrity(..).unwrap();
        assert!(report.has(3, ViolationKind::SequenceGap));
        assert!(report.has(5, ViolationKind::TruncatedTail));
    }

    #[test]
    fn range_verification_is_anchored_on_predecessor() {
        let (_dir, path, trail) = on_disk(6);
        let report = trail.verify_integrity(3..=5).unwrap();
        assert!(report.ok);
        assert_eq!(report.checked, 3);
        assert_eq!(report.first_sequence, Some(3));

        tamper(
            &path,
            &format!(
                "UPDATE audit_entries SET current_hash = '{}' WHERE sequence = 2",
                "f".repeat(64)
            ),
        );
        let report = trail.verify_integrity(3..).unwrap();
        assert!(report.has(3, ViolationKind::BrokenLink));
    }

    #[test]
    fn wrong_secret_fails_every_signature() {
        let (_dir, path, trail) = on_disk(3);
        drop(trail);
        let other = AuditTrail::open(&path, AuditSigner::from_secret(b"nope")).unwrap();
        let report = other.verify_integrity(..).unwrap();
        assert_eq!(
            report
                .violations
                .iter()
                .filter(|v| v.kind == ViolationKind::InvalidSignature)
                .count(),
            3
        );
    }

    #[test]
    fn query_filters_by_actor_severity_and_type() {
        let trail = AuditTrail::open_in_memory(signer()).unwrap();
        trail.append(event(1)).unwrap();
        trail
            .append(
                AuditEvent::new(AuditEventType::EmergencyStop, AuditSeverity::Critical)
                    .actor(ActorType::Operator, "ops"),
            )
            .unwrap();
        trail
            .append(
                AuditEvent::new(AuditEventType::ThresholdBreached, AuditSeverity::Warning)
                    .actor(ActorType::Agent, "agent-1"),
            )
            .unwrap();

        let severe = trail
            .query(&AuditQuery::new().min_severity(AuditSeverity::Warning))
            .unwrap();
        assert_eq!(severe.len(), 2);

        let stops = trail
            .query(&AuditQuery::new().event_type(AuditEventType::EmergencyStop))
            .unwrap();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].retention, RetentionPolicy::Permanent);

        let alpha = trail
            .query(&AuditQuery::new().actor(ActorType::Team, "alpha"))
            .unwrap();
        assert_eq!(alpha.len(), 1);

        let latest = trail
            .query(&AuditQuery::new().newest_first().limit(1))
            .unwrap();
        assert_eq!(latest[0].sequence, 3);
    }

    #[test]
    fn query_time_window() {
        let trail = AuditTrail::open_in_memory(signer()).unwrap();
        let before = Utc::now() - Duration::seconds(1);
        trail.append(event(1)).unwrap();
        let after = Utc::now() + Duration::seconds(1);

        assert_eq!(
            trail
                .query(&AuditQuery::new().between(before, after))
                .unwrap()
                .len(),
            1
        );
        assert!(
            trail
                .query(&AuditQuery::new().between(after, after + Duration::hours(1)))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn retention_archives_without_breaking_chain() {
        let trail = AuditTrail::open_in_memory(signer()).unwrap();
        trail.append(event(1)).unwrap(); // INFO → short term
        trail
            .append(AuditEvent::new(AuditEventType::EmergencyStop, AuditSeverity::Critical))
            .unwrap();

        let report = trail
            .apply_retention(Utc::now() + Duration::days(100))
            .unwrap();
        assert_eq!(report.total(), 1);
        assert_eq!(report.archived.get("short_term"), Some(&1));

        // The archived entry is hidden by default but still present.
        let live = trail.query(&AuditQuery::new()).unwrap();
        assert!(live.iter().all(|e| !e.archived));
        let all = trail.query(&AuditQuery::new().include_archived()).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].archived);
        assert!(all[0].archived_at.is_some());
        assert_eq!(all[2].event_type, AuditEventType::RetentionSweep);

        assert!(trail.verify_integrity(..).unwrap().ok);
    }

    #[test]
    fn retention_sweep_with_nothing_due_appends_nothing() {
        let trail = AuditTrail::open_in_memory(signer()).unwrap();
        trail.append(event(1)).unwrap();
        let report = trail.apply_retention(Utc::now()).unwrap();
        assert_eq!(report.total(), 0);
        assert_eq!(trail.len().unwrap(), 1);
    }

    #[test]
    fn export_then_verify_export() {
        let (dir, _path, trail) = on_disk(4);
        let out = dir.path().join("export.json");
        let export = trail.export(&out).unwrap();
        assert_eq!(export.head_sequence, 4);

        let report = verify_export(&out, &signer()).unwrap();
        assert!(report.ok, "{:?}", report.violations);
        assert_eq!(report.checked, 4);
    }

    #[test]
    fn edited_export_fails_verification() {
        let (dir, _path, trail) = on_disk(3);
        let out = dir.path().join("export.json");
        trail.export(&out).unwrap();

        let text = std::fs::read_to_string(&out).unwrap();
        let mut doc: AuditExport = serde_json::from_str(&text).unwrap();
        doc.entries[1].actor_id = "mallory".into();
        std::fs::write(&out, serde_json::to_string(&doc).unwrap()).unwrap();

        let report = verify_export(&out, &signer()).unwrap();
        assert!(report.has(2, ViolationKind::HashMismatch));
    }

    #[test]
    fn truncated_export_is_detected() {
        let (dir, _path, trail) = on_disk(3);
        let out = dir.path().join("export.json");
        let mut doc = trail.export(&out).unwrap();
        doc.entries.pop();
        std::fs::write(&out, serde_json::to_string(&doc).unwrap()).unwrap();

        let report = verify_export(&out, &signer()).unwrap();
        assert!(report.has(3, ViolationKind::TruncatedTail));
    }

    #[test]
    fn sink_returns_sequence_and_maps_errors() {
        let trail = AuditTrail::open_in_memory(signer()).unwrap();
        let sink: &dyn AuditSink = &trail;
        assert_eq!(sink.record(event(1)).unwrap(), 1);

        let err: GovernanceError = AuditError::Malformed {
            sequence: 7,
            detail: "x".into(),
        }
        .into();
        assert!(matches!(err, GovernanceError::AuditStorage(_)));
    }

    #[test]
    fn concurrent_appends_stay_gap_free() {
        let trail = std::sync::Arc::new(AuditTrail::open_in_memory(signer()).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let trail = trail.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        trail.append(event(t * 100 + i)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let report = trail.verify_integrity(..).unwrap();
        assert!(report.ok, "{:?}", report.violations);
        assert_eq!(report.checked, 100);
    }
}
