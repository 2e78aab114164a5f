//! Engine configuration and the dcl-config lock document.
//!
//! The lock document pins the hashing and canonicalization profile a
//! governance root was initialized with. A runtime whose own profile
//! disagrees refuses to start: silently mixing profiles would make every
//! stored hash unverifiable.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::canonical::CANONICALIZATION_VERSION;
use crate::dcl::DCL_VERSION;
use crate::error::{GovernanceError, IntegrityErrorKind, Result};
use crate::hash::HASH_ALGORITHM;
use crate::state::STATE_SCHEMA_VERSION;
use crate::store;

/// Environment variable naming the governance root directory.
pub const ENV_ROOT: &str = "PKTGOV_ROOT";
/// Environment variable enabling strict doctor mode at startup.
pub const ENV_STRICT: &str = "PKTGOV_STRICT";
/// Environment variable overriding the default heartbeat interval.
pub const ENV_HEARTBEAT_INTERVAL: &str = "PKTGOV_HEARTBEAT_INTERVAL_SECS";
/// Environment variable overriding the stall threshold floor.
pub const ENV_STALL_THRESHOLD: &str = "PKTGOV_STALL_THRESHOLD_SECS";
/// Environment variable overriding the preflight timeout.
pub const ENV_PREFLIGHT_TIMEOUT: &str = "PKTGOV_PREFLIGHT_TIMEOUT_SECS";

/// Default heartbeat interval in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 900;
/// Default stall threshold floor in seconds.
pub const DEFAULT_STALL_THRESHOLD_SECS: u64 = 1800;
/// Default preflight timeout in seconds.
pub const DEFAULT_PREFLIGHT_TIMEOUT_SECS: u64 = 3600;

/// The dcl-config lock document (`dcl/dcl-config.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DclConfig {
    /// Commitment mode; always `dcl`.
    pub mode: String,
    /// Hash algorithm in use.
    pub hash_algorithm: String,
    /// Canonicalization profile version.
    pub canonicalization_version: String,
    /// DCL protocol version.
    pub dcl_version: String,
    /// State document schema version.
    pub state_schema_version: String,
}

impl DclConfig {
    /// The profile compiled into this binary.
    #[must_use]
    pub fn current() -> Self {
        Self {
            mode: "dcl".to_string(),
            hash_algorithm: HASH_ALGORITHM.to_string(),
            canonicalization_version: CANONICALIZATION_VERSION.to_string(),
            dcl_version: DCL_VERSION.to_string(),
            state_schema_version: STATE_SCHEMA_VERSION.to_string(),
        }
    }

    /// The lock document path under a governance root.
    #[must_use]
    pub fn path(root: &Path) -> PathBuf {
        root.join("dcl").join("dcl-config.json")
    }

    /// Writes the current profile as the lock document.
    ///
    /// # Errors
    ///
    /// Returns `Io` on persistence failure.
    pub fn write(root: &Path) -> Result<Self> {
        let config = Self::current();
        store::atomic_write_json(&Self::path(root), &config)?;
        Ok(config)
    }

    /// Verifies the stored lock document matches the running binary.
    ///
    /// # Errors
    ///
    /// Returns `IntegrityFailure{ConfigLockMismatch}` when the lock is
    /// missing or disagrees on any field.
    pub fn verify(root: &Path) -> Result<Self> {
        let path = Self::path(root);
        let stored: Option<Self> = store::read_json_opt(&path)?;
        let Some(stored) = stored else {
            return Err(GovernanceError::IntegrityFailure {
                kind: IntegrityErrorKind::ConfigLockMismatch,
                packet_id: None,
                message: format!("dcl-config lock missing: {}", path.display()),
            });
        };
        let current = Self::current();
        if stored != current {
            return Err(GovernanceError::IntegrityFailure {
                kind: IntegrityErrorKind::ConfigLockMismatch,
                packet_id: None,
                message: format!(
                    "dcl-config lock disagrees with runtime (stored {stored:?}, runtime {current:?})"
                ),
            });
        }
        Ok(stored)
    }
}

/// Runtime configuration for the engine and operator surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Governance root directory.
    pub root: PathBuf,
    /// Abort startup on any doctor failure instead of failing open.
    pub strict: bool,
    /// Default heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Stall threshold floor in seconds.
    pub stall_threshold_secs: u64,
    /// Preflight timeout in seconds.
    pub preflight_timeout_secs: u64,
}

impl EngineConfig {
    /// Configuration for a root with default tunables.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            strict: false,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            stall_threshold_secs: DEFAULT_STALL_THRESHOLD_SECS,
            preflight_timeout_secs: DEFAULT_PREFLIGHT_TIMEOUT_SECS,
        }
    }

    /// Configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let root = std::env::var(ENV_ROOT).unwrap_or_else(|_| ".".to_string());
        let mut config = Self::new(root);
        config.strict = std::env::var(ENV_STRICT)
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"))
            .unwrap_or(false);
        if let Some(secs) = env_secs(ENV_HEARTBEAT_INTERVAL) {
            config.heartbeat_interval_secs = secs;
        }
        if let Some(secs) = env_secs(ENV_STALL_THRESHOLD) {
            config.stall_threshold_secs = secs;
        }
        if let Some(secs) = env_secs(ENV_PREFLIGHT_TIMEOUT) {
            config.preflight_timeout_secs = secs;
        }
        config
    }

    /// The stall window for a packet: `max(2 x interval, threshold)`,
    /// with the packet's own interval override when present.
    #[must_use]
    pub fn stall_window_secs(&self, packet_interval_secs: Option<u64>) -> u64 {
        let interval = packet_interval_secs.unwrap_or(self.heartbeat_interval_secs);
        (2 * interval).max(self.stall_threshold_secs)
    }
}

fn env_secs(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}
