//! Crate-wide error taxonomy with stable machine codes.
//!
//! Every rejected operation surfaces one [`GovernanceError`]. The variant
//! set mirrors the operator contract: callers branch on [`code`] strings or
//! [`exit_code`] values, never on human-readable messages.
//!
//! [`code`]: GovernanceError::code
//! [`exit_code`]: GovernanceError::exit_code

use thiserror::Error;

use crate::canonical::CanonicalError;

/// Subcodes for state-machine rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TransitionErrorKind {
    /// The packet is not in a status the operation accepts.
    WrongStatus,
    /// The actor identity violates an identity rule (e.g. reviewer equals
    /// executor, or a non-owner acting on owned work).
    IdentityConflict,
    /// One or more dependencies are not `done`.
    DependencyUnmet,
    /// A required context-manifest entry was not attested.
    ContextAttestationMissing,
    /// A `done` transition arrived without evidence.
    EvidenceMissing,
    /// The packet is in a terminal status.
    AlreadyTerminal,
    /// The residual-risk acknowledgement is malformed.
    InvalidResidualRisk,
    /// An assessment or heartbeat payload is missing required keys.
    PayloadInvalid,
}

impl TransitionErrorKind {
    /// Stable machine subcode.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::WrongStatus => "wrong_status",
            Self::IdentityConflict => "identity_conflict",
            Self::DependencyUnmet => "dependency_unmet",
            Self::ContextAttestationMissing => "context_attestation_missing",
            Self::EvidenceMissing => "evidence_missing",
            Self::AlreadyTerminal => "already_terminal",
            Self::InvalidResidualRisk => "invalid_residual_risk",
            Self::PayloadInvalid => "payload_invalid",
        }
    }
}

/// Subcodes for verifier and doctor failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum IntegrityErrorKind {
    /// Commit sequence numbers are not dense starting at 1.
    SeqDiscontinuity,
    /// `prev_commit_hash` does not match the previous commit.
    PrevHashMismatch,
    /// `pre_state_hash` does not continue the previous `post_state_hash`.
    StateHashMismatch,
    /// HEAD does not point at the last commit.
    HeadDrift,
    /// A commit's recomputed hash differs from its stored hash.
    CommitHashMismatch,
    /// The live runtime state does not hash to HEAD's `post_state_hash`.
    RuntimeBindingMismatch,
    /// The dcl-config lock document is missing or disagrees with the
    /// running binary.
    ConfigLockMismatch,
    /// The latest project checkpoint disagrees with current HEADs.
    CheckpointMismatch,
    /// A journal file is unreadable or internally inconsistent.
    JournalCorrupt,
}

impl IntegrityErrorKind {
    /// Stable machine subcode.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::SeqDiscontinuity => "seq_discontinuity",
            Self::PrevHashMismatch => "prev_hash_mismatch",
            Self::StateHashMismatch => "state_hash_mismatch",
            Self::HeadDrift => "head_drift",
            Self::CommitHashMismatch => "commit_hash_mismatch",
            Self::RuntimeBindingMismatch => "runtime_binding_mismatch",
            Self::ConfigLockMismatch => "config_lock_mismatch",
            Self::CheckpointMismatch => "checkpoint_mismatch",
            Self::JournalCorrupt => "journal_corrupt",
        }
    }
}

/// Errors surfaced by every governance operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GovernanceError {
    /// Caller mistake; no state change occurred.
    #[error("usage error: {message}")]
    Usage {
        /// What the caller got wrong.
        message: String,
    },

    /// The definition or a lock document was rejected at load.
    #[error("schema invalid: {message}")]
    SchemaInvalid {
        /// Description of the rejection.
        message: String,
    },

    /// An unknown packet, area, or risk id.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// The kind of object ("packet", "area", "risk", "commit").
        kind: &'static str,
        /// The id that was not found.
        id: String,
    },

    /// The state machine rejected the transition.
    #[error("invalid transition for {packet_id}: {message}")]
    InvalidTransition {
        /// The rejection subcode.
        kind: TransitionErrorKind,
        /// The packet the operation targeted.
        packet_id: String,
        /// Human-readable detail.
        message: String,
    },

    /// Lock contention exceeded the retry budget.
    #[error("concurrency conflict on {path}: lock not acquired within retry budget")]
    ConcurrencyConflict {
        /// The contended lock path.
        path: String,
    },

    /// A verifier or doctor check failed. Never recovered silently.
    #[error("integrity failure ({}): {message}", .kind.code())]
    IntegrityFailure {
        /// The failure subcode.
        kind: IntegrityErrorKind,
        /// The packet involved, when packet-scoped.
        packet_id: Option<String>,
        /// Human-readable detail.
        message: String,
    },

    /// A value could not be canonicalized for hashing.
    #[error("canonicalization failed: {0}")]
    Canonical(#[from] CanonicalError),

    /// Filesystem failure after exhausting any applicable retries.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The path the operation touched.
        path: String,
        /// Whether the failure was classified as transient (retried) before
        /// surfacing.
        transient: bool,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl GovernanceError {
    /// Stable machine code for the operator envelope.
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            Self::Usage { .. } => "usage".to_string(),
            Self::SchemaInvalid { .. } => "schema_invalid".to_string(),
            Self::NotFound { .. } => "not_found".to_string(),
            Self::InvalidTransition { kind, .. } => {
                format!("invalid_transition.{}", kind.code())
            },
            Self::ConcurrencyConflict { .. } => "concurrency_conflict".to_string(),
            Self::IntegrityFailure { kind, .. } => {
                format!("integrity_failure.{}", kind.code())
            },
            Self::Canonical(_) => "invalid_value".to_string(),
            Self::Io { .. } => "io".to_string(),
        }
    }

    /// Process exit code for the operator surface.
    ///
    /// 2 usage/schema, 3 governance rejection, 4 precondition missing,
    /// 5 integrity failure, 1 unrecovered I/O.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Usage { .. } | Self::SchemaInvalid { .. } => 2,
            Self::InvalidTransition {
                kind: TransitionErrorKind::DependencyUnmet,
                ..
            } => 4,
            Self::NotFound { .. }
            | Self::InvalidTransition { .. }
            | Self::ConcurrencyConflict { .. }
            | Self::Canonical(_) => 3,
            Self::IntegrityFailure { .. } => 5,
            Self::Io { .. } => 1,
        }
    }

    /// Convenience constructor for I/O failures.
    pub fn io(path: impl Into<String>, transient: bool, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            transient,
            source,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, GovernanceError>;
