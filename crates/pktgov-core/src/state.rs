//! Runtime packet state and the single state document.
//!
//! # Committed view
//!
//! Heartbeats carry a `transition_only` commit policy: a heartbeat that
//! does not change status updates the state document without emitting a
//! DCL commit. To keep the at-rest runtime-binding invariant
//! (`SHA256(canonical(state)) == HEAD.post_state_hash`) true across such
//! writes, the hashable "committed view" of a packet excludes the two
//! heartbeat-volatile fields `last_heartbeat_at` and `heartbeat_payload`.
//! Everything else that changes must go through a commit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GovernanceError, Result};
use crate::hash;
use crate::payloads::{HeartbeatPayload, PreflightAssessment, ReviewAssessment};
use crate::store;
use crate::time;

/// State document schema version, also recorded in the dcl-config lock.
pub const STATE_SCHEMA_VERSION: &str = "1.0";

/// Default maximum review reject/rework cycles before escalation.
pub const DEFAULT_MAX_REVIEW_CYCLES: u32 = 3;

/// Fields excluded from the committed (hashable) view of a packet.
pub const VOLATILE_FIELDS: [&str; 2] = ["last_heartbeat_at", "heartbeat_payload"];

/// The lifecycle status of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum PacketStatus {
    /// Available for claiming once dependencies are done.
    Pending,
    /// Claimed; awaiting preflight approval.
    Preflight,
    /// Actively being worked.
    InProgress,
    /// Heartbeat overdue; awaiting revival or intervention.
    Stalled,
    /// Completed by the executor; awaiting independent review.
    Review,
    /// Needs supervisor attention.
    Escalated,
    /// Successfully completed. Terminal and immutable.
    Done,
    /// Failed. Terminal except for supervisor reset.
    Failed,
    /// A dependency failed or is itself blocked.
    Blocked,
}

impl PacketStatus {
    /// Parses a status from a string.
    ///
    /// # Errors
    ///
    /// Returns `Usage` for unrecognized values.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(Self::Pending),
            "preflight" => Ok(Self::Preflight),
            "in_progress" => Ok(Self::InProgress),
            "stalled" => Ok(Self::Stalled),
            "review" => Ok(Self::Review),
            "escalated" => Ok(Self::Escalated),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            _ => Err(GovernanceError::Usage {
                message: format!("invalid packet status: {s}"),
            }),
        }
    }

    /// The string representation of this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Preflight => "preflight",
            Self::InProgress => "in_progress",
            Self::Stalled => "stalled",
            Self::Review => "review",
            Self::Escalated => "escalated",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    /// True for `done` and `failed`.
    ///
    /// `done` admits no forward transition at all; `failed` admits only the
    /// supervisor `reset`, which is a new commit, not a history rewrite.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// True when a supervisor reset may return this packet to pending.
    #[must_use]
    pub const fn is_resettable(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Stalled | Self::Escalated | Self::Preflight
        )
    }

    /// True when the executor (or a supervisor) may fail the packet.
    #[must_use]
    pub const fn is_failable(&self) -> bool {
        matches!(
            self,
            Self::InProgress | Self::Preflight | Self::Review | Self::Stalled
        )
    }
}

impl std::fmt::Display for PacketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A submitted preflight assessment and its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreflightRecord {
    /// The assessment payload.
    pub assessment: PreflightAssessment,
    /// Who submitted it.
    pub submitted_by: String,
    /// When it was submitted.
    pub submitted_at: String,
}

/// Review bookkeeping for a packet in (or past) review.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    /// The reviewer who claimed the review, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    /// When the review was claimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<String>,
    /// The last verdict, as submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<String>,
    /// The last assessment, as submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessment: Option<ReviewAssessment>,
    /// When the last verdict was submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<String>,
    /// Completed reject/rework cycles.
    #[serde(default)]
    pub cycle_count: u32,
}

/// The mutable runtime state of one packet. Owned by the lifecycle engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketRuntimeState {
    /// Current lifecycle status.
    pub status: PacketStatus,
    /// Executor identity while owned; `None` otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    /// Evidence narrative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// When work started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// When the packet reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    /// Last heartbeat time. Volatile: excluded from the committed view.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<String>,
    /// Context-manifest paths the executor attested at claim.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_attestation: Vec<String>,
    /// Submitted preflight assessment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preflight: Option<PreflightRecord>,
    /// Review bookkeeping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewRecord>,
    /// Residual-risk acknowledgement: `"none"` or a structured record.
    #[serde(default = "default_residual_risk")]
    pub residual_risk: Value,
    /// Last heartbeat payload. Volatile: excluded from the committed view.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_payload: Option<HeartbeatPayload>,
    /// Link to a template instantiation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_link: Option<String>,
}

fn default_residual_risk() -> Value {
    Value::String("none".to_string())
}

impl Default for PacketRuntimeState {
    fn default() -> Self {
        Self {
            status: PacketStatus::Pending,
            assigned_to: None,
            notes: None,
            started_at: None,
            completed_at: None,
            last_heartbeat_at: None,
            context_attestation: Vec::new(),
            preflight: None,
            review: None,
            residual_risk: default_residual_risk(),
            heartbeat_payload: None,
            template_link: None,
        }
    }
}

impl PacketRuntimeState {
    /// The committed (hashable) view: the serialized state minus the
    /// heartbeat-volatile fields.
    ///
    /// # Errors
    ///
    /// Returns `SchemaInvalid` if the state cannot be serialized.
    pub fn committed_view(&self) -> Result<Value> {
        let mut value =
            serde_json::to_value(self).map_err(|e| GovernanceError::SchemaInvalid {
                message: format!("cannot serialize runtime state: {e}"),
            })?;
        if let Value::Object(map) = &mut value {
            for field in VOLATILE_FIELDS {
                map.remove(field);
            }
        }
        Ok(value)
    }

    /// SHA-256 of the canonical committed view.
    ///
    /// # Errors
    ///
    /// Returns `Canonical` or `SchemaInvalid` on serialization failure.
    pub fn committed_hash(&self) -> Result<String> {
        Ok(hash::hash_value(&self.committed_view()?)?)
    }

    /// The review record, created on first access.
    pub fn review_mut(&mut self) -> &mut ReviewRecord {
        self.review.get_or_insert_with(ReviewRecord::default)
    }
}

/// A level-2 area closeout record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaCloseout {
    /// Area display title at closeout time.
    pub area_title: String,
    /// The supervisor who closed the area.
    pub closed_by: String,
    /// When it was closed.
    pub closed_at: String,
    /// Path to the assessment document.
    pub assessment_path: String,
    /// Optional closeout notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// The project checkpoint emitted by the closeout.
    pub checkpoint_id: String,
}

/// Tunables and bookkeeping carried by the state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMetadata {
    /// Review reject/rework cycles allowed before forced escalation.
    #[serde(default = "default_max_review_cycles")]
    pub max_review_cycles: u32,
    /// Forward-compatible extras.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_max_review_cycles() -> u32 {
    DEFAULT_MAX_REVIEW_CYCLES
}

impl Default for StateMetadata {
    fn default() -> Self {
        Self {
            max_review_cycles: DEFAULT_MAX_REVIEW_CYCLES,
            extra: serde_json::Map::new(),
        }
    }
}

/// The single canonical state document (`state.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    /// State schema version.
    pub schema_version: String,
    /// Creation timestamp.
    pub created_at: String,
    /// Last write timestamp.
    pub updated_at: String,
    /// Runtime state per packet. Created implicitly at first touch.
    #[serde(default)]
    pub packets: BTreeMap<String, PacketRuntimeState>,
    /// The append-only lifecycle log.
    #[serde(default)]
    pub log: Vec<crate::log::LifecycleLogEntry>,
    /// Level-2 closeout records per area.
    #[serde(default)]
    pub area_closeouts: BTreeMap<String, AreaCloseout>,
    /// Tunables.
    #[serde(default)]
    pub metadata: StateMetadata,
}

impl StateDocument {
    /// A fresh empty document.
    #[must_use]
    pub fn new_empty() -> Self {
        let now = time::now_utc_string();
        Self {
            schema_version: STATE_SCHEMA_VERSION.to_string(),
            created_at: now.clone(),
            updated_at: now,
            packets: BTreeMap::new(),
            log: Vec::new(),
            area_closeouts: BTreeMap::new(),
            metadata: StateMetadata::default(),
        }
    }

    /// The runtime state for a packet, created pending at first touch.
    pub fn packet_mut(&mut self, packet_id: &str) -> &mut PacketRuntimeState {
        self.packets.entry(packet_id.to_string()).or_default()
    }

    /// The runtime state for a packet, or a pending default without
    /// inserting.
    #[must_use]
    pub fn packet(&self, packet_id: &str) -> PacketRuntimeState {
        self.packets.get(packet_id).cloned().unwrap_or_default()
    }

    /// The status of a packet, `pending` if untouched.
    #[must_use]
    pub fn status_of(&self, packet_id: &str) -> PacketStatus {
        self.packets
            .get(packet_id)
            .map_or(PacketStatus::Pending, |p| p.status)
    }

    /// Per-status packet counts over the touched packets.
    #[must_use]
    pub fn status_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for packet in self.packets.values() {
            *counts.entry(packet.status.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

/// Filesystem-backed access to the state document.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Creates a store for `state.json` under the governance root.
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join("state.json"),
        }
    }

    /// The state document path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The lock path guarding state mutation (the global lock).
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.path.with_extension("json.lock")
    }

    /// True once `init` has produced a state document.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Loads the document, defaulting to empty when absent.
    ///
    /// # Errors
    ///
    /// Returns `Io` or `SchemaInvalid` on a present-but-unreadable file.
    pub fn load(&self) -> Result<StateDocument> {
        Ok(store::read_json_opt(&self.path)?.unwrap_or_else(StateDocument::new_empty))
    }

    /// Persists the document atomically, stamping `updated_at`.
    ///
    /// The caller must hold the global state lock.
    ///
    /// # Errors
    ///
    /// Returns `Io` on persistence failure.
    pub fn save(&self, doc: &mut StateDocument) -> Result<()> {
        doc.updated_at = time::now_utc_string();
        store::atomic_write_json(&self.path, doc)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(PacketStatus::Done.is_terminal());
        assert!(PacketStatus::Failed.is_terminal());
        for status in [
            PacketStatus::Pending,
            PacketStatus::Preflight,
            PacketStatus::InProgress,
            PacketStatus::Stalled,
            PacketStatus::Review,
            PacketStatus::Escalated,
            PacketStatus::Blocked,
        ] {
            assert!(!status.is_terminal(), "{status} must not be terminal");
        }
    }

    #[test]
    fn test_status_resettable_set() {
        assert!(PacketStatus::Failed.is_resettable());
        assert!(PacketStatus::Stalled.is_resettable());
        assert!(PacketStatus::Escalated.is_resettable());
        assert!(PacketStatus::Preflight.is_resettable());
        assert!(!PacketStatus::Done.is_resettable());
        assert!(!PacketStatus::InProgress.is_resettable());
        assert!(!PacketStatus::Pending.is_resettable());
    }

    #[test]
    fn test_status_parse_round_trip() {
        for status in [
            PacketStatus::Pending,
            PacketStatus::Preflight,
            PacketStatus::InProgress,
            PacketStatus::Stalled,
            PacketStatus::Review,
            PacketStatus::Escalated,
            PacketStatus::Done,
            PacketStatus::Failed,
            PacketStatus::Blocked,
        ] {
            assert_eq!(PacketStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(PacketStatus::parse("unknown").is_err());
    }

    #[test]
    fn test_committed_view_excludes_volatile_fields() {
        let mut packet = PacketRuntimeState::default();
        packet.last_heartbeat_at = Some("2026-08-02T10:00:00.000000Z".to_string());
        packet.heartbeat_payload = Some(
            serde_json::from_value(json!({
                "status": "working",
                "decisions": [],
                "obstacles": [],
                "completion_estimate": "50%",
            }))
            .unwrap(),
        );

        let view = packet.committed_view().unwrap();
        let map = view.as_object().unwrap();
        assert!(!map.contains_key("last_heartbeat_at"));
        assert!(!map.contains_key("heartbeat_payload"));
        assert!(map.contains_key("status"));
    }

    #[test]
    fn test_committed_hash_unchanged_by_heartbeat() {
        let mut packet = PacketRuntimeState {
            status: PacketStatus::InProgress,
            assigned_to: Some("alice".to_string()),
            ..PacketRuntimeState::default()
        };
        let before = packet.committed_hash().unwrap();
        packet.last_heartbeat_at = Some("2026-08-02T10:00:00.000000Z".to_string());
        assert_eq!(packet.committed_hash().unwrap(), before);

        packet.status = PacketStatus::Stalled;
        assert_ne!(packet.committed_hash().unwrap(), before);
    }

    #[test]
    fn test_document_first_touch_is_pending() {
        let mut doc = StateDocument::new_empty();
        assert_eq!(doc.status_of("PKT-1"), PacketStatus::Pending);
        let packet = doc.packet_mut("PKT-1");
        assert_eq!(packet.status, PacketStatus::Pending);
        assert!(packet.assigned_to.is_none());
    }

    #[test]
    fn test_store_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = StateStore::new(dir.path());
        assert!(!state.exists());

        let mut doc = StateDocument::new_empty();
        doc.packet_mut("PKT-1").status = PacketStatus::InProgress;
        state.save(&mut doc).unwrap();

        let loaded = state.load().unwrap();
        assert_eq!(loaded.status_of("PKT-1"), PacketStatus::InProgress);
        assert_eq!(loaded.schema_version, STATE_SCHEMA_VERSION);
    }

    #[test]
    fn test_status_counts() {
        let mut doc = StateDocument::new_empty();
        doc.packet_mut("A").status = PacketStatus::Done;
        doc.packet_mut("B").status = PacketStatus::Done;
        doc.packet_mut("C").status = PacketStatus::InProgress;
        let counts = doc.status_counts();
        assert_eq!(counts["done"], 2);
        assert_eq!(counts["in_progress"], 1);
    }
}
