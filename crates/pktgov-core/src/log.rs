//! Append-only lifecycle log.
//!
//! The log is the embedded `log` array of the state document, written
//! under the same atomic rewrite as the packet map. Entries are only ever
//! appended; nothing rewrites or removes an existing entry.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every event the lifecycle log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum LifecycleEvent {
    /// A packet was claimed into preflight.
    Claimed,
    /// A preflight assessment was submitted.
    PreflightSubmitted,
    /// A supervisor approved preflight.
    PreflightApproved,
    /// A supervisor (or timeout observer) returned the packet to pending.
    PreflightReturned,
    /// Work started (claim without preflight, or preflight approval).
    Started,
    /// A liveness heartbeat arrived.
    Heartbeat,
    /// The stall sweep marked the packet stalled.
    Stalled,
    /// A heartbeat revived a stalled packet.
    ResumedFromStalled,
    /// The packet completed (or entered review).
    Completed,
    /// A reviewer claimed the review.
    ReviewClaimed,
    /// A reviewer submitted a verdict.
    ReviewSubmitted,
    /// The packet was escalated.
    Escalated,
    /// The packet failed.
    Failed,
    /// A supervisor reset the packet to pending.
    Reset,
    /// Evidence narrative appended without a status change.
    Noted,
    /// A level-2 area closeout.
    CloseoutL2,
    /// Dependency failure propagated onto this packet.
    Blocked,
    /// Dependency recovery returned this packet to pending.
    Unblocked,
    /// Ontology advisory event (recorded by external collaborators).
    OntologyEvent,
    /// Template event (recorded by external collaborators).
    TemplateEvent,
}

impl LifecycleEvent {
    /// The string representation of this event.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::PreflightSubmitted => "preflight_submitted",
            Self::PreflightApproved => "preflight_approved",
            Self::PreflightReturned => "preflight_returned",
            Self::Started => "started",
            Self::Heartbeat => "heartbeat",
            Self::Stalled => "stalled",
            Self::ResumedFromStalled => "resumed_from_stalled",
            Self::Completed => "completed",
            Self::ReviewClaimed => "review_claimed",
            Self::ReviewSubmitted => "review_submitted",
            Self::Escalated => "escalated",
            Self::Failed => "failed",
            Self::Reset => "reset",
            Self::Noted => "noted",
            Self::CloseoutL2 => "closeout_l2",
            Self::Blocked => "blocked",
            Self::Unblocked => "unblocked",
            Self::OntologyEvent => "ontology_event",
            Self::TemplateEvent => "template_event",
        }
    }
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One lifecycle log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleLogEntry {
    /// UTC timestamp (RFC 3339, microsecond precision).
    pub timestamp: String,
    /// The packet (or `AREA-<id>` pseudo-packet for closeouts).
    pub packet_id: String,
    /// The event kind.
    pub event: LifecycleEvent,
    /// Who triggered it (`system` for observer transitions).
    pub actor: String,
    /// Free-form structured detail.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}
