//! Governance configuration – one TOML document, validated at load.
//!
//! ```toml
//! [audit]
//! path = "/var/lib/overwatch/audit.db"
//! secret = "change-me"
//!
//! [allocator.pools]
//! cpu = 100
//!
//! [[safety.thresholds]]
//! name = "cpu-emergency"
//! metric = "cpu"
//! operator = ">"
//! value = 95.0
//! severity = "emergency"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use overwatch_allocator::AllocatorConfig;
use overwatch_audit::RetentionConfig;
use overwatch_safety::SafetyConfig;
use overwatch_types::GovernanceError;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for GovernanceError {
    fn from(e: ConfigError) -> Self {
        GovernanceError::Configuration(e.to_string())
    }
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("overwatch-audit.db")
}
fn default_arbitration_interval_ms() -> u64 {
    500
}
fn default_expiry_sweep_secs() -> u64 {
    30
}
fn default_sampling_interval_ms() -> u64 {
    1_000
}
fn default_retention_sweep_secs() -> u64 {
    3_600
}

fn deserialize_secret<'de, D: Deserializer<'de>>(d: D) -> Result<Zeroizing<String>, D::Error> {
    String::deserialize(d).map(Zeroizing::new)
}

/// `[audit]` table.
#[derive(Clone, Deserialize)]
pub struct AuditSection {
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,
    /// Signing secret; wiped from memory on drop.
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub secret: Zeroizing<String>,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
            secret: Zeroizing::new(String::new()),
            retention: RetentionConfig::default(),
        }
    }
}

impl std::fmt::Debug for AuditSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSection")
            .field("path", &self.path)
            .field(
                "secret",
                if self.secret.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("retention", &self.retention)
            .finish()
    }
}

/// `[workers]` table: periods of the background activities.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_arbitration_interval_ms")]
    pub arbitration_interval_ms: u64,
    #[serde(default = "default_expiry_sweep_secs")]
    pub expiry_sweep_secs: u64,
    #[serde(default = "default_sampling_interval_ms")]
    pub sampling_interval_ms: u64,
    #[serde(default = "default_retention_sweep_secs")]
    pub retention_sweep_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            arbitration_interval_ms: default_arbitration_interval_ms(),
            expiry_sweep_secs: default_expiry_sweep_secs(),
            sampling_interval_ms: default_sampling_interval_ms(),
            retention_sweep_secs: default_retention_sweep_secs(),
        }
    }
}

impl WorkersConfig {
    pub fn arbitration_interval(&self) -> Duration {
        Duration::from_millis(self.arbitration_interval_ms)
    }

    pub fn expiry_sweep(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_secs)
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }

    pub fn retention_sweep(&self) -> Duration {
        Duration::from_secs(self.retention_sweep_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GovernanceConfig {
    #[serde(default)]
    pub audit: AuditSection,
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
}

impl GovernanceConfig {
    /// Read, apply `OVERWATCH_*` overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg: GovernanceConfig = toml::from_str(&raw)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse and validate without consulting the environment.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: GovernanceConfig = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `OVERWATCH_*` environment variable overrides.
    ///
    /// | Variable | Config field |
    /// |---|---|
    /// | `OVERWATCH_AUDIT_PATH` | `audit.path` |
    /// | `OVERWATCH_AUDIT_SECRET` | `audit.secret` |
    /// | `OVERWATCH_SAMPLING_MS` | `workers.sampling_interval_ms` |
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Extracted for testability without mutating environment variables.
    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("OVERWATCH_AUDIT_PATH") {
            self.audit.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("OVERWATCH_AUDIT_SECRET") {
            self.audit.secret = Zeroizing::new(v);
        }
        if let Some(v) = lookup("OVERWATCH_SAMPLING_MS")
            && let Ok(ms) = v.parse::<u64>()
        {
            self.workers.sampling_interval_ms = ms;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audit.secret.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "audit.secret must be set (or OVERWATCH_AUDIT_SECRET)".into(),
            ));
        }
        if self.audit.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("audit.path must not be empty".into()));
        }
        self.audit.retention.validate().map_err(ConfigError::Invalid)?;
        self.allocator
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.safety
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let w = &self.workers;
        for (name, v) in [
            ("arbitration_interval_ms", w.arbitration_interval_ms),
            ("expiry_sweep_secs", w.expiry_sweep_secs),
            ("sampling_interval_ms", w.sampling_interval_ms),
            ("retention_sweep_secs", w.retention_sweep_secs),
        ] {
            if v == 0 {
                return Err(ConfigError::Invalid(format!(
                    "workers.{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}
