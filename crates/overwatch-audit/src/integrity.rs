//! Chain verification.
//!
//! [`ChainWalker`] is fed entries in sequence order, from the live store or
//! from an export file, and collects every violation it sees instead of
//! stopping at the first one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::{AuditEntry, AuditSigner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationKind {
    /// A sequence number is missing.
    SequenceGap,
    /// `previous_hash` does not match the predecessor's hash.
    BrokenLink,
    /// Recomputed content hash differs from the stored one.
    HashMismatch,
    InvalidSignature,
    TimestampRegression,
    /// The stored row could not be decoded.
    Malformed,
    /// Entries at the end of the trail are missing.
    TruncatedTail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub sequence: u64,
    pub kind: ViolationKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub ok: bool,
    pub checked: u64,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
    pub violations: Vec<Violation>,
}

impl IntegrityReport {
    pub fn has(&self, sequence: u64, kind: ViolationKind) -> bool {
        self.violations
            .iter()
            .any(|v| v.sequence == sequence && v.kind == kind)
    }
}

pub struct ChainWalker<'a> {
    signer: &'a AuditSigner,
    expected_sequence: Option<u64>,
    previous_hash: Option<String>,
    previous_timestamp: Option<DateTime<Utc>>,
    report: IntegrityReport,
}

impl<'a> ChainWalker<'a> {
    /// `start` is the first sequence number expected; `anchor` the hash the
    /// first entry must link to (unknown anchors skip the first link check).
    pub fn new(signer: &'a AuditSigner, start: Option<u64>, anchor: Option<String>) -> Self {
        Self {
            signer,
            expected_sequence: start,
            previous_hash: anchor,
            previous_timestamp: None,
            report: IntegrityReport {
                ok: true,
                checked: 0,
                first_sequence: None,
                last_sequence: None,
                violations: Vec::new(),
            },
        }
    }

    fn push(&mut self, sequence: u64, kind: ViolationKind, detail: String) {
        self.report.violations.push(Violation {
            sequence,
            kind,
            detail,
        });
    }

    /// Returns `true` when the sequence is where it should be.
    fn check_sequence(&mut self, sequence: u64) -> bool {
        self.report.checked += 1;
        self.report.first_sequence.get_or_insert(sequence);
        self.report.last_sequence = Some(sequence);
        match self.expected_sequence {
            Some(expected) if expected != sequence => {
                self.push(
                    sequence,
                    ViolationKind::SequenceGap,
                    format!("expected sequence {expected}, found {sequence}"),
                );
                false
            }
            _ => true,
        }
    }

    pub fn visit(&mut self, entry: &AuditEntry) {
        let seq = entry.sequence;
        // After a gap the predecessor is unknown, so the link is not judged.
        if self.check_sequence(seq) {
            if let Some(prev) = self.previous_hash.as_deref() {
                if entry.previous_hash != prev {
                    let detail = format!(
                        "previous_hash {} does not match predecessor {}",
                        entry.previous_hash, prev
                    );
                    self.push(seq, ViolationKind::BrokenLink, detail);
                }
            }
        }

        let recomputed = entry.compute_hash();
        if recomputed != entry.current_hash {
            self.push(
                seq,
                ViolationKind::HashMismatch,
                format!("stored {}, recomputed {}", entry.current_hash, recomputed),
            );
        }
        if !self.signer.verify(entry) {
            self.push(
                seq,
                ViolationKind::InvalidSignature,
                "signature does not verify".to_string(),
            );
        }
        if let Some(prev_ts) = self.previous_timestamp {
            if entry.timestamp < prev_ts {
                self.push(
                    seq,
                    ViolationKind::TimestampRegression,
                    format!("{} precedes {}", entry.timestamp, prev_ts),
                );
            }
        }

        self.expected_sequence = Some(seq + 1);
        self.previous_hash = Some(entry.current_hash.clone());
        self.previous_timestamp = Some(entry.timestamp);
    }

    /// Record a row that could not be decoded. Its stored hash, when readable,
    /// still anchors the next link.
    pub fn visit_malformed(&mut self, sequence: u64, stored_hash: Option<String>, detail: String) {
        self.check_sequence(sequence);
        self.push(sequence, ViolationKind::Malformed, detail);
        self.expected_sequence = Some(sequence + 1);
        self.previous_hash = stored_hash;
    }

    /// Compare the walk's end against the head the writer believes in.
    pub fn expect_head(&mut self, head_sequence: u64) {
        let seen = self.report.last_sequence.unwrap_or(0);
        if seen < head_sequence {
            self.push(
                head_sequence,
                ViolationKind::TruncatedTail,
                format!("trail ends at {seen}, head is {head_sequence}"),
            );
        }
    }

    pub fn finish(mut self) -> IntegrityReport {
        self.report.ok = self.report.violations.is_empty();
        self.report
    }
}
