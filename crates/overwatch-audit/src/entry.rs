//! Stored audit entries, their canonical hash and their keyed signature.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use overwatch_types::{ActorType, AuditCategory, AuditEventType, AuditSeverity, RetentionPolicy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use zeroize::Zeroizing;

/// `previous_hash` of the first entry in every trail.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const SIGNING_CONTEXT: &str = "overwatch 2026-01 audit entry signing";

/// Render a timestamp the way it is hashed and stored: RFC 3339, UTC,
/// microsecond precision. Strings in this form sort chronologically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// One row of the audit trail.
///
/// `payload` holds the JSON text exactly as it was hashed; use
/// [`payload_value`][Self::payload_value] to inspect it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor_type: ActorType,
    pub actor_id: String,
    pub event_type: AuditEventType,
    pub category: AuditCategory,
    pub severity: AuditSeverity,
    pub payload: String,
    pub retention: RetentionPolicy,
    pub previous_hash: String,
    pub current_hash: String,
    pub signature: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

impl AuditEntry {
    /// Pipe-joined canonical form of every hashed field.
    pub fn canonical_content(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.sequence,
            self.id,
            format_timestamp(&self.timestamp),
            self.actor_type.as_str(),
            self.actor_id,
            self.event_type.as_str(),
            self.category.as_str(),
            self.severity.as_str(),
            self.payload,
            self.retention.as_str(),
            self.previous_hash,
        )
    }

    /// SHA-256 of [`canonical_content`][Self::canonical_content], hex encoded.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_content().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn payload_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.payload)
    }
}

/// Signs entries with a BLAKE3 keyed hash.
///
/// The 32-byte key is derived from the process-wide secret and wiped when the
/// signer is dropped.
#[derive(Clone)]
pub struct AuditSigner {
    key: Zeroizing<[u8; 32]>,
}

impl AuditSigner {
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            key: Zeroizing::new(blake3::derive_key(SIGNING_CONTEXT, secret)),
        }
    }

    fn keyed(&self, id: &Uuid, current_hash: &str, timestamp: &DateTime<Utc>) -> blake3::Hash {
        let message = format!("{}|{}|{}", id, current_hash, format_timestamp(timestamp));
        blake3::keyed_hash(&self.key, message.as_bytes())
    }

    pub fn sign(&self, id: &Uuid, current_hash: &str, timestamp: &DateTime<Utc>) -> String {
        self.keyed(id, current_hash, timestamp).to_hex().to_string()
    }

    /// Constant-time check of `entry.signature`.
    pub fn verify(&self, entry: &AuditEntry) -> bool {
        match blake3::Hash::from_hex(&entry.signature) {
            Ok(stored) => stored == self.keyed(&entry.id, &entry.current_hash, &entry.timestamp),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for AuditSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditSigner").field("key", &"<redacted>").finish()
    }
}
