//! The lifecycle engine: state-machine transitions over the work graph.
//!
//! Every operation takes an explicit actor identity, runs under the global
//! state lock plus the per-packet lock(s) in fixed id order, and either
//! completes fully (runtime state written, log entry appended, exactly
//! one DCL commit per touched packet) or leaves every artifact unchanged.
//!
//! The engine is an explicit handle: all stores hang off [`Engine`], and
//! nothing in this crate mutates governance state through module-level
//! globals.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::DateTime;
use serde_json::{Value, json};

use crate::config::{DclConfig, EngineConfig};
use crate::dcl::{ActionEnvelope, CommitStore, DclCommit, ProjectCheckpoint};
use crate::definition::Definition;
use crate::error::{GovernanceError, Result, TransitionErrorKind};
use crate::gate::{self, BlockChange, ReadyPacket};
use crate::hash;
use crate::log::{LifecycleEvent, LifecycleLogEntry};
use crate::payloads::{
    HeartbeatPayload, PreflightAssessment, ResidualRiskAck, ReviewAssessment, ReviewVerdict,
};
use crate::risk::RiskStore;
use crate::state::{
    AreaCloseout, PacketRuntimeState, PacketStatus, PreflightRecord, StateDocument, StateStore,
};
use crate::store::{self, DirLock};
use crate::time;

/// Default constitution seeded by `init` when none exists.
const DEFAULT_CONSTITUTION: &str = "\
Packet governance constitution.

1. Work moves only through recorded lifecycle transitions.
2. Completion requires evidence; review requires a second person.
3. Terminal packets are immutable; reset is a supervisor action and a new
   commit, never a history rewrite.
";

/// The outcome of one accepted transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult {
    /// The packet that moved.
    pub packet_id: String,
    /// Its status after the transition.
    pub status: PacketStatus,
    /// The emitted commit's sequence number, if one was emitted.
    pub commit_seq: Option<u64>,
    /// Human-readable summary.
    pub message: String,
}

/// The governance engine handle.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    definition: Definition,
    state_store: StateStore,
    commit_store: CommitStore,
    risk_store: RiskStore,
}

impl Engine {
    /// Initializes a governance root: validates and installs the
    /// definition, writes an empty state document and the dcl-config lock,
    /// and seeds a default constitution when none exists.
    ///
    /// # Errors
    ///
    /// Returns `SchemaInvalid` for a rejected definition, `Io` on
    /// persistence failure.
    pub fn init(config: EngineConfig, definition_path: &Path) -> Result<Self> {
        let definition = Definition::load(definition_path)?;
        let root = config.root.clone();

        store::atomic_write_json(&root.join("definition.json"), definition.document())?;
        DclConfig::write(&root)?;

        let constitution = root.join("constitution.txt");
        if !constitution.exists() {
            crate::store::atomic_write_bytes(&constitution, DEFAULT_CONSTITUTION.as_bytes())?;
        }

        let state_store = StateStore::new(&root);
        if !state_store.exists() {
            let _global = DirLock::acquire(&state_store.lock_path())?;
            let mut doc = StateDocument::new_empty();
            state_store.save(&mut doc)?;
        }

        tracing::info!(root = %root.display(), "governance root initialized");
        Ok(Self {
            commit_store: CommitStore::new(&root),
            risk_store: RiskStore::new(&root),
            state_store,
            definition,
            config,
        })
    }

    /// Opens an initialized governance root.
    ///
    /// Refuses to start when the dcl-config lock is missing or disagrees
    /// with the running binary.
    ///
    /// # Errors
    ///
    /// Returns `IntegrityFailure{ConfigLockMismatch}` on a lock mismatch,
    /// `NotFound`/`SchemaInvalid` for the definition.
    pub fn open(config: EngineConfig) -> Result<Self> {
        DclConfig::verify(&config.root)?;
        let definition = Definition::load(&config.root.join("definition.json"))?;
        Ok(Self {
            state_store: StateStore::new(&config.root),
            commit_store: CommitStore::new(&config.root),
            risk_store: RiskStore::new(&config.root),
            definition,
            config,
        })
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The loaded definition.
    #[must_use]
    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    /// The state store.
    #[must_use]
    pub fn state_store(&self) -> &StateStore {
        &self.state_store
    }

    /// The commit store.
    #[must_use]
    pub fn commit_store(&self) -> &CommitStore {
        &self.commit_store
    }

    /// The residual-risk store.
    #[must_use]
    pub fn risk_store(&self) -> &RiskStore {
        &self.risk_store
    }

    /// SHA-256 of the constitution document; empty-string sentinel when the
    /// file is absent.
    ///
    /// # Errors
    ///
    /// Returns `Io` on read failure other than absence.
    pub fn constitution_hash(&self) -> Result<String> {
        let path = self.config.root.join("constitution.txt");
        match std::fs::read(&path) {
            Ok(bytes) => Ok(hash::sha256_hex(&bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(GovernanceError::io(path.display().to_string(), false, e)),
        }
    }

    fn lock_state(&self) -> Result<DirLock> {
        DirLock::acquire(&self.state_store.lock_path())
    }

    fn require_actor(actor: &str) -> Result<()> {
        if actor.trim().is_empty() {
            return Err(GovernanceError::Usage {
                message: "actor identity is required".to_string(),
            });
        }
        Ok(())
    }

    fn wrong_status(
        packet_id: &str,
        actual: PacketStatus,
        expected: &str,
    ) -> GovernanceError {
        GovernanceError::InvalidTransition {
            kind: if actual.is_terminal() {
                TransitionErrorKind::AlreadyTerminal
            } else {
                TransitionErrorKind::WrongStatus
            },
            packet_id: packet_id.to_string(),
            message: format!("packet is {actual}, not {expected}"),
        }
    }

    fn identity_conflict(packet_id: &str, message: impl Into<String>) -> GovernanceError {
        GovernanceError::InvalidTransition {
            kind: TransitionErrorKind::IdentityConflict,
            packet_id: packet_id.to_string(),
            message: message.into(),
        }
    }

    /// Appends a log entry and emits the DCL commit for one packet whose
    /// state inside `doc` was already mutated from `pre_view`.
    fn seal_packet(
        &self,
        doc: &mut StateDocument,
        packet_id: &str,
        event: LifecycleEvent,
        actor: &str,
        reason: &str,
        inputs: Value,
        details: Value,
        pre_view: &Value,
    ) -> Result<DclCommit> {
        let post_view = doc.packet(packet_id).committed_view()?;
        doc.log.push(LifecycleLogEntry {
            timestamp: time::now_utc_string(),
            packet_id: packet_id.to_string(),
            event,
            actor: if actor.is_empty() {
                "system".to_string()
            } else {
                actor.to_string()
            },
            details,
        });
        let envelope = ActionEnvelope::new(event.as_str(), actor, inputs, reason);
        self.commit_store.append(
            packet_id,
            envelope,
            pre_view,
            &post_view,
            &self.constitution_hash()?,
        )
    }

    /// Applies blocked/unblocked propagation after a status-touching
    /// transition. The caller holds the global lock and the primary
    /// packet's lock; propagation targets are locked in id order.
    fn propagate_blocking(
        &self,
        doc: &mut StateDocument,
        skip: &str,
    ) -> Result<Vec<TransitionResult>> {
        let mut changes: Vec<BlockChange> = gate::compute_block_changes(&self.definition, doc)
            .into_iter()
            .filter(|c| c.packet_id != skip)
            .collect();
        // Per-packet locks are taken in fixed id order.
        changes.sort_by(|a, b| a.packet_id.cmp(&b.packet_id));
        let mut locks = Vec::with_capacity(changes.len());
        for change in &changes {
            locks.push(self.commit_store.lock_packet(&change.packet_id)?);
        }

        let mut results = Vec::with_capacity(changes.len());
        for change in changes {
            let pre_view = doc.packet(&change.packet_id).committed_view()?;
            let (event, details) = match change.to {
                PacketStatus::Blocked => (
                    LifecycleEvent::Blocked,
                    json!({"caused_by": change.caused_by}),
                ),
                _ => (LifecycleEvent::Unblocked, Value::Null),
            };
            {
                let packet = doc.packet_mut(&change.packet_id);
                packet.status = change.to;
                if change.to == PacketStatus::Pending {
                    packet.assigned_to = None;
                    packet.started_at = None;
                }
            }
            let commit = self.seal_packet(
                doc,
                &change.packet_id,
                event,
                "",
                "dependency propagation",
                json!({}),
                details,
                &pre_view,
            )?;
            results.push(TransitionResult {
                packet_id: change.packet_id,
                status: change.to,
                commit_seq: Some(commit.seq),
                message: format!("{event} by dependency propagation"),
            });
        }
        Ok(results)
    }

    /// Claims a pending packet for an executor.
    ///
    /// # Errors
    ///
    /// Rejects with `DependencyUnmet`, `WrongStatus` (already claimed),
    /// or `ContextAttestationMissing`.
    pub fn claim(
        &self,
        packet_id: &str,
        actor: &str,
        context_attestation: &[String],
    ) -> Result<TransitionResult> {
        Self::require_actor(actor)?;
        let packet_def = self.definition.require_packet(packet_id)?;

        let _global = self.lock_state()?;
        let _packet_lock = self.commit_store.lock_packet(packet_id)?;
        let mut doc = self.state_store.load()?;

        let current = doc.status_of(packet_id);
        if current != PacketStatus::Pending {
            let packet = doc.packet(packet_id);
            if let Some(owner) = packet.assigned_to {
                return Err(GovernanceError::InvalidTransition {
                    kind: TransitionErrorKind::WrongStatus,
                    packet_id: packet_id.to_string(),
                    message: format!("already claimed by {owner} ({current})"),
                });
            }
            return Err(Self::wrong_status(packet_id, current, "pending"));
        }
        if let Some(dep) = gate::first_unmet_dependency(&self.definition, &doc, packet_id) {
            return Err(GovernanceError::InvalidTransition {
                kind: TransitionErrorKind::DependencyUnmet,
                packet_id: packet_id.to_string(),
                message: format!("blocked by {dep} (not done yet)"),
            });
        }
        for required in packet_def.required_context_paths() {
            if !context_attestation.iter().any(|a| a == required) {
                return Err(GovernanceError::InvalidTransition {
                    kind: TransitionErrorKind::ContextAttestationMissing,
                    packet_id: packet_id.to_string(),
                    message: format!("context manifest entry not attested: {required}"),
                });
            }
        }

        let to = if packet_def.preflight_required {
            PacketStatus::Preflight
        } else {
            PacketStatus::InProgress
        };
        let event = if packet_def.preflight_required {
            LifecycleEvent::Claimed
        } else {
            LifecycleEvent::Started
        };

        let pre_view = doc.packet(packet_id).committed_view()?;
        {
            let packet = doc.packet_mut(packet_id);
            packet.status = to;
            packet.assigned_to = Some(actor.to_string());
            packet.started_at = Some(time::now_utc_string());
            packet.context_attestation = context_attestation.to_vec();
        }
        let commit = self.seal_packet(
            &mut doc,
            packet_id,
            event,
            actor,
            "",
            json!({"context_attestation": context_attestation}),
            json!({"note": format!("claimed by {actor}")}),
            &pre_view,
        )?;
        self.state_store.save(&mut doc)?;

        Ok(TransitionResult {
            packet_id: packet_id.to_string(),
            status: to,
            commit_seq: Some(commit.seq),
            message: format!("{packet_id} claimed by {actor} ({to})"),
        })
    }

    /// Stores the executor's preflight assessment. No status change.
    ///
    /// # Errors
    ///
    /// Rejects with `WrongStatus`, `IdentityConflict`, or `PayloadInvalid`.
    pub fn preflight(
        &self,
        packet_id: &str,
        actor: &str,
        assessment: PreflightAssessment,
    ) -> Result<TransitionResult> {
        Self::require_actor(actor)?;
        self.definition.require_packet(packet_id)?;
        assessment.validate(packet_id)?;

        let _global = self.lock_state()?;
        let _packet_lock = self.commit_store.lock_packet(packet_id)?;
        let mut doc = self.state_store.load()?;

        let current = doc.status_of(packet_id);
        if current != PacketStatus::Preflight {
            return Err(Self::wrong_status(packet_id, current, "preflight"));
        }
        let packet = doc.packet(packet_id);
        if packet.assigned_to.as_deref() != Some(actor) {
            return Err(Self::identity_conflict(
                packet_id,
                format!(
                    "preflight must come from the claiming executor ({})",
                    packet.assigned_to.as_deref().unwrap_or("unassigned")
                ),
            ));
        }

        let inputs = serde_json::to_value(&assessment).unwrap_or(Value::Null);
        let pre_view = doc.packet(packet_id).committed_view()?;
        doc.packet_mut(packet_id).preflight = Some(PreflightRecord {
            assessment,
            submitted_by: actor.to_string(),
            submitted_at: time::now_utc_string(),
        });
        let commit = self.seal_packet(
            &mut doc,
            packet_id,
            LifecycleEvent::PreflightSubmitted,
            actor,
            "",
            inputs,
            Value::Null,
            &pre_view,
        )?;
        self.state_store.save(&mut doc)?;

        Ok(TransitionResult {
            packet_id: packet_id.to_string(),
            status: PacketStatus::Preflight,
            commit_seq: Some(commit.seq),
            message: format!("{packet_id} preflight assessment submitted"),
        })
    }

    /// Supervisor decision on a preflight: approve into `in_progress` or
    /// return to `pending`.
    ///
    /// # Errors
    ///
    /// Rejects with `WrongStatus` or `IdentityConflict` (supervisor must
    /// differ from the executor).
    pub fn preflight_decide(
        &self,
        packet_id: &str,
        supervisor: &str,
        approve: bool,
        reason: &str,
    ) -> Result<TransitionResult> {
        Self::require_actor(supervisor)?;
        self.definition.require_packet(packet_id)?;

        let _global = self.lock_state()?;
        let _packet_lock = self.commit_store.lock_packet(packet_id)?;
        let mut doc = self.state_store.load()?;

        let current = doc.status_of(packet_id);
        if current != PacketStatus::Preflight {
            return Err(Self::wrong_status(packet_id, current, "preflight"));
        }
        let packet = doc.packet(packet_id);
        if packet.assigned_to.as_deref() == Some(supervisor) {
            return Err(Self::identity_conflict(
                packet_id,
                "preflight decisions require a supervisor distinct from the executor",
            ));
        }

        let (to, event) = if approve {
            (PacketStatus::InProgress, LifecycleEvent::PreflightApproved)
        } else {
            (PacketStatus::Pending, LifecycleEvent::PreflightReturned)
        };

        let pre_view = doc.packet(packet_id).committed_view()?;
        {
            let packet = doc.packet_mut(packet_id);
            packet.status = to;
            if !approve {
                packet.assigned_to = None;
                packet.started_at = None;
                packet.preflight = None;
            }
        }
        let commit = self.seal_packet(
            &mut doc,
            packet_id,
            event,
            supervisor,
            reason,
            json!({"approve": approve}),
            json!({"reason": reason}),
            &pre_view,
        )?;
        self.state_store.save(&mut doc)?;

        Ok(TransitionResult {
            packet_id: packet_id.to_string(),
            status: to,
            commit_seq: Some(commit.seq),
            message: format!("{packet_id} preflight {}", if approve { "approved" } else { "returned" }),
        })
    }

    /// Records a liveness heartbeat.
    ///
    /// Policy is `transition_only`: a heartbeat on an `in_progress` packet
    /// updates the volatile fields and the log without emitting a commit;
    /// a heartbeat on a `stalled` packet revives it to `in_progress` and
    /// emits a commit.
    ///
    /// # Errors
    ///
    /// Rejects with `WrongStatus`, `IdentityConflict`, or `PayloadInvalid`.
    pub fn heartbeat(
        &self,
        packet_id: &str,
        actor: &str,
        payload: HeartbeatPayload,
    ) -> Result<TransitionResult> {
        Self::require_actor(actor)?;
        self.definition.require_packet(packet_id)?;
        payload.validate(packet_id)?;

        let _global = self.lock_state()?;
        let mut doc = self.state_store.load()?;

        let current = doc.status_of(packet_id);
        if !matches!(current, PacketStatus::InProgress | PacketStatus::Stalled) {
            return Err(Self::wrong_status(packet_id, current, "in_progress or stalled"));
        }
        let packet = doc.packet(packet_id);
        if packet.assigned_to.as_deref() != Some(actor) {
            return Err(Self::identity_conflict(
                packet_id,
                format!(
                    "heartbeat must come from the assigned executor ({})",
                    packet.assigned_to.as_deref().unwrap_or("unassigned")
                ),
            ));
        }

        let now = time::now_utc_string();
        if current == PacketStatus::Stalled {
            let _packet_lock = self.commit_store.lock_packet(packet_id)?;
            let inputs = serde_json::to_value(&payload).unwrap_or(Value::Null);
            let pre_view = doc.packet(packet_id).committed_view()?;
            {
                let packet = doc.packet_mut(packet_id);
                packet.status = PacketStatus::InProgress;
                packet.last_heartbeat_at = Some(now);
                packet.heartbeat_payload = Some(payload);
            }
            let commit = self.seal_packet(
                &mut doc,
                packet_id,
                LifecycleEvent::ResumedFromStalled,
                actor,
                "",
                inputs,
                Value::Null,
                &pre_view,
            )?;
            self.state_store.save(&mut doc)?;
            return Ok(TransitionResult {
                packet_id: packet_id.to_string(),
                status: PacketStatus::InProgress,
                commit_seq: Some(commit.seq),
                message: format!("{packet_id} resumed from stalled"),
            });
        }

        // Payload-only heartbeat: volatile fields, no commit.
        {
            let packet = doc.packet_mut(packet_id);
            packet.last_heartbeat_at = Some(now.clone());
            packet.heartbeat_payload = Some(payload);
        }
        doc.log.push(LifecycleLogEntry {
            timestamp: now,
            packet_id: packet_id.to_string(),
            event: LifecycleEvent::Heartbeat,
            actor: actor.to_string(),
            details: Value::Null,
        });
        self.state_store.save(&mut doc)?;

        Ok(TransitionResult {
            packet_id: packet_id.to_string(),
            status: PacketStatus::InProgress,
            commit_seq: None,
            message: format!("{packet_id} heartbeat recorded"),
        })
    }

    /// The observer sweep: stalls overdue `in_progress` packets and
    /// returns timed-out preflights to `pending`. Idempotent within one
    /// stall window.
    ///
    /// # Errors
    ///
    /// Returns `Io` on persistence failure.
    pub fn check_stalled(&self) -> Result<Vec<TransitionResult>> {
        let _global = self.lock_state()?;
        let mut doc = self.state_store.load()?;
        let now = time::now_utc();

        let mut results = Vec::new();
        for packet_def in self.definition.packets() {
            let packet_id = packet_def.id.as_str();
            let packet = doc.packet(packet_id);
            match packet.status {
                PacketStatus::InProgress => {
                    let anchor = packet
                        .last_heartbeat_at
                        .as_deref()
                        .or(packet.started_at.as_deref());
                    let Some(elapsed) = elapsed_secs(anchor, now) else {
                        continue;
                    };
                    let window = self
                        .config
                        .stall_window_secs(packet_def.heartbeat_interval_seconds);
                    if elapsed <= window {
                        continue;
                    }
                    let _packet_lock = self.commit_store.lock_packet(packet_id)?;
                    let pre_view = doc.packet(packet_id).committed_view()?;
                    doc.packet_mut(packet_id).status = PacketStatus::Stalled;
                    let commit = self.seal_packet(
                        &mut doc,
                        packet_id,
                        LifecycleEvent::Stalled,
                        "",
                        "heartbeat overdue",
                        json!({"elapsed_secs": elapsed, "window_secs": window}),
                        json!({"elapsed_secs": elapsed}),
                        &pre_view,
                    )?;
                    results.push(TransitionResult {
                        packet_id: packet_id.to_string(),
                        status: PacketStatus::Stalled,
                        commit_seq: Some(commit.seq),
                        message: format!("{packet_id} stalled ({elapsed}s since last heartbeat)"),
                    });
                },
                PacketStatus::Preflight => {
                    let anchor = packet
                        .preflight
                        .as_ref()
                        .map(|p| p.submitted_at.as_str())
                        .or(packet.started_at.as_deref());
                    let Some(elapsed) = elapsed_secs(anchor, now) else {
                        continue;
                    };
                    if elapsed <= self.config.preflight_timeout_secs {
                        continue;
                    }
                    let _packet_lock = self.commit_store.lock_packet(packet_id)?;
                    let pre_view = doc.packet(packet_id).committed_view()?;
                    {
                        let packet = doc.packet_mut(packet_id);
                        packet.status = PacketStatus::Pending;
                        packet.assigned_to = None;
                        packet.started_at = None;
                        packet.preflight = None;
                    }
                    let commit = self.seal_packet(
                        &mut doc,
                        packet_id,
                        LifecycleEvent::PreflightReturned,
                        "",
                        "preflight timeout",
                        json!({"elapsed_secs": elapsed}),
                        json!({"reason": "preflight timeout"}),
                        &pre_view,
                    )?;
                    results.push(TransitionResult {
                        packet_id: packet_id.to_string(),
                        status: PacketStatus::Pending,
                        commit_seq: Some(commit.seq),
                        message: format!("{packet_id} preflight timed out after {elapsed}s"),
                    });
                },
                _ => {},
            }
        }

        if !results.is_empty() {
            self.state_store.save(&mut doc)?;
        }
        Ok(results)
    }

    /// Completes a packet with evidence, routing through review when the
    /// definition requires it.
    ///
    /// # Errors
    ///
    /// Rejects with `WrongStatus`, `IdentityConflict`, `EvidenceMissing`,
    /// or `InvalidResidualRisk`.
    pub fn done(
        &self,
        packet_id: &str,
        actor: &str,
        evidence: &str,
        residual_risk: ResidualRiskAck,
    ) -> Result<TransitionResult> {
        Self::require_actor(actor)?;
        let packet_def = self.definition.require_packet(packet_id)?;
        if evidence.trim().is_empty() {
            return Err(GovernanceError::InvalidTransition {
                kind: TransitionErrorKind::EvidenceMissing,
                packet_id: packet_id.to_string(),
                message: "completion requires non-empty evidence".to_string(),
            });
        }
        residual_risk.validate(packet_id)?;

        let _global = self.lock_state()?;
        let _packet_lock = self.commit_store.lock_packet(packet_id)?;
        let mut doc = self.state_store.load()?;

        let current = doc.status_of(packet_id);
        if current != PacketStatus::InProgress {
            return Err(Self::wrong_status(packet_id, current, "in_progress"));
        }
        let packet = doc.packet(packet_id);
        if packet.assigned_to.as_deref() != Some(actor) {
            return Err(Self::identity_conflict(
                packet_id,
                format!(
                    "done must come from the assigned executor ({})",
                    packet.assigned_to.as_deref().unwrap_or("unassigned")
                ),
            ));
        }

        let risk_value = match &residual_risk {
            ResidualRiskAck::None => Value::String("none".to_string()),
            ResidualRiskAck::Declared(declarations) => {
                let register_ids =
                    self.risk_store
                        .add_declarations(packet_id, actor, declarations)?;
                json!({
                    "ack": "declared",
                    "register_ids": register_ids,
                    "risks": declarations,
                })
            },
        };

        let to = if packet_def.review_required {
            PacketStatus::Review
        } else {
            PacketStatus::Done
        };
        let pre_view = doc.packet(packet_id).committed_view()?;
        {
            let packet = doc.packet_mut(packet_id);
            packet.status = to;
            packet.notes = Some(evidence.to_string());
            packet.residual_risk = risk_value;
            if to == PacketStatus::Done {
                packet.completed_at = Some(time::now_utc_string());
            } else {
                packet.review_mut().reviewer = None;
            }
        }
        let commit = self.seal_packet(
            &mut doc,
            packet_id,
            LifecycleEvent::Completed,
            actor,
            "",
            json!({"evidence": evidence}),
            json!({"evidence": evidence, "routed_to": to.as_str()}),
            &pre_view,
        )?;

        let mut message = format!("{packet_id} {}", if to == PacketStatus::Done {
            "marked done"
        } else {
            "submitted for review"
        });
        if to == PacketStatus::Done {
            let unblocked = self.propagate_blocking(&mut doc, packet_id)?;
            if !unblocked.is_empty() {
                message.push_str(&format!(
                    "; recomputed: {}",
                    unblocked
                        .iter()
                        .map(|r| r.packet_id.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
            }
        }
        self.state_store.save(&mut doc)?;

        Ok(TransitionResult {
            packet_id: packet_id.to_string(),
            status: to,
            commit_seq: Some(commit.seq),
            message,
        })
    }

    /// Claims the review of a packet for a reviewer distinct from the
    /// executor.
    ///
    /// # Errors
    ///
    /// Rejects with `WrongStatus` or `IdentityConflict`.
    pub fn review_claim(&self, packet_id: &str, reviewer: &str) -> Result<TransitionResult> {
        Self::require_actor(reviewer)?;
        self.definition.require_packet(packet_id)?;

        let _global = self.lock_state()?;
        let _packet_lock = self.commit_store.lock_packet(packet_id)?;
        let mut doc = self.state_store.load()?;

        let current = doc.status_of(packet_id);
        if current != PacketStatus::Review {
            return Err(Self::wrong_status(packet_id, current, "review"));
        }
        let packet = doc.packet(packet_id);
        if packet.assigned_to.as_deref() == Some(reviewer) {
            return Err(Self::identity_conflict(
                packet_id,
                "two-person integrity: reviewer must differ from the executor",
            ));
        }
        if let Some(existing) = packet.review.as_ref().and_then(|r| r.reviewer.as_deref()) {
            if existing != reviewer {
                return Err(Self::identity_conflict(
                    packet_id,
                    format!("review already claimed by {existing}"),
                ));
            }
        }

        let pre_view = doc.packet(packet_id).committed_view()?;
        {
            let review = doc.packet_mut(packet_id).review_mut();
            review.reviewer = Some(reviewer.to_string());
            review.claimed_at = Some(time::now_utc_string());
        }
        let commit = self.seal_packet(
            &mut doc,
            packet_id,
            LifecycleEvent::ReviewClaimed,
            reviewer,
            "",
            json!({}),
            Value::Null,
            &pre_view,
        )?;
        self.state_store.save(&mut doc)?;

        Ok(TransitionResult {
            packet_id: packet_id.to_string(),
            status: PacketStatus::Review,
            commit_seq: Some(commit.seq),
            message: format!("{packet_id} review claimed by {reviewer}"),
        })
    }

    /// Submits a review verdict.
    ///
    /// APPROVE completes the packet; REJECT returns it to the executor and
    /// counts a cycle (escalating once the cycle budget is spent);
    /// ESCALATE hands it to a supervisor.
    ///
    /// # Errors
    ///
    /// Rejects with `WrongStatus`, `IdentityConflict`, or `PayloadInvalid`.
    pub fn review_submit(
        &self,
        packet_id: &str,
        reviewer: &str,
        verdict: ReviewVerdict,
        assessment: ReviewAssessment,
    ) -> Result<TransitionResult> {
        Self::require_actor(reviewer)?;
        self.definition.require_packet(packet_id)?;
        assessment.validate(packet_id)?;

        let _global = self.lock_state()?;
        let _packet_lock = self.commit_store.lock_packet(packet_id)?;
        let mut doc = self.state_store.load()?;

        let current = doc.status_of(packet_id);
        if current != PacketStatus::Review {
            return Err(Self::wrong_status(packet_id, current, "review"));
        }
        let packet = doc.packet(packet_id);
        if packet.assigned_to.as_deref() == Some(reviewer) {
            return Err(Self::identity_conflict(
                packet_id,
                "two-person integrity: reviewer must differ from the executor",
            ));
        }
        match packet.review.as_ref().and_then(|r| r.reviewer.as_deref()) {
            Some(claimed) if claimed == reviewer => {},
            Some(claimed) => {
                return Err(Self::identity_conflict(
                    packet_id,
                    format!("review is claimed by {claimed}"),
                ));
            },
            None => {
                return Err(Self::wrong_status(packet_id, current, "claimed review"));
            },
        }

        let max_cycles = doc.metadata.max_review_cycles;
        let cycle_count = packet.review.as_ref().map_or(0, |r| r.cycle_count);

        let (to, event, next_cycles) = match verdict {
            ReviewVerdict::Approve => (PacketStatus::Done, LifecycleEvent::ReviewSubmitted, cycle_count),
            ReviewVerdict::Escalate => {
                (PacketStatus::Escalated, LifecycleEvent::Escalated, cycle_count)
            },
            ReviewVerdict::Reject => {
                let next = cycle_count + 1;
                if next >= max_cycles {
                    (PacketStatus::Escalated, LifecycleEvent::Escalated, next)
                } else {
                    (PacketStatus::InProgress, LifecycleEvent::ReviewSubmitted, next)
                }
            },
        };

        let inputs = json!({
            "verdict": verdict.as_str(),
            "assessment": serde_json::to_value(&assessment).unwrap_or(Value::Null),
        });
        let pre_view = doc.packet(packet_id).committed_view()?;
        {
            let now = time::now_utc_string();
            let packet = doc.packet_mut(packet_id);
            packet.status = to;
            if to == PacketStatus::Done {
                packet.completed_at = Some(now.clone());
            }
            let review = packet.review_mut();
            review.verdict = Some(verdict.as_str().to_string());
            review.assessment = Some(assessment);
            review.submitted_at = Some(now);
            review.cycle_count = next_cycles;
            if to == PacketStatus::InProgress {
                // Next round gets a fresh claim.
                review.reviewer = None;
                review.claimed_at = None;
            }
        }
        let commit = self.seal_packet(
            &mut doc,
            packet_id,
            event,
            reviewer,
            "",
            inputs,
            json!({"verdict": verdict.as_str(), "cycle_count": next_cycles}),
            &pre_view,
        )?;

        let mut message = format!("{packet_id} review {}: now {to}", verdict.as_str());
        if to == PacketStatus::Done {
            let unblocked = self.propagate_blocking(&mut doc, packet_id)?;
            if !unblocked.is_empty() {
                message.push_str("; dependents recomputed");
            }
        }
        self.state_store.save(&mut doc)?;

        Ok(TransitionResult {
            packet_id: packet_id.to_string(),
            status: to,
            commit_seq: Some(commit.seq),
            message,
        })
    }

    /// Fails a packet. Allowed for the assigned executor, or for a
    /// supervisor (`supervisor = true`). Dependents are recomputed as
    /// blocked.
    ///
    /// # Errors
    ///
    /// Rejects with `WrongStatus` or `IdentityConflict`.
    pub fn fail(
        &self,
        packet_id: &str,
        actor: &str,
        reason: &str,
        supervisor: bool,
    ) -> Result<TransitionResult> {
        Self::require_actor(actor)?;
        self.definition.require_packet(packet_id)?;

        let _global = self.lock_state()?;
        let _packet_lock = self.commit_store.lock_packet(packet_id)?;
        let mut doc = self.state_store.load()?;

        let current = doc.status_of(packet_id);
        if !current.is_failable() {
            return Err(Self::wrong_status(
                packet_id,
                current,
                "in_progress, preflight, review, or stalled",
            ));
        }
        let packet = doc.packet(packet_id);
        if !supervisor && packet.assigned_to.as_deref() != Some(actor) {
            return Err(Self::identity_conflict(
                packet_id,
                format!(
                    "fail must come from the assigned executor ({}) or a supervisor",
                    packet.assigned_to.as_deref().unwrap_or("unassigned")
                ),
            ));
        }

        let pre_view = doc.packet(packet_id).committed_view()?;
        {
            let packet = doc.packet_mut(packet_id);
            packet.status = PacketStatus::Failed;
            packet.completed_at = Some(time::now_utc_string());
            packet.notes = Some(reason.to_string());
        }
        let commit = self.seal_packet(
            &mut doc,
            packet_id,
            LifecycleEvent::Failed,
            actor,
            reason,
            json!({"reason": reason}),
            json!({"reason": reason}),
            &pre_view,
        )?;

        let blocked = self.propagate_blocking(&mut doc, packet_id)?;
        self.state_store.save(&mut doc)?;

        let mut message = format!("{packet_id} failed");
        if !blocked.is_empty() {
            message.push_str(&format!(
                "; blocked: {}",
                blocked
                    .iter()
                    .map(|r| r.packet_id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        Ok(TransitionResult {
            packet_id: packet_id.to_string(),
            status: PacketStatus::Failed,
            commit_seq: Some(commit.seq),
            message,
        })
    }

    /// Supervisor-only reset: returns a failed, stalled, escalated, or
    /// preflight packet to `pending` with a new commit.
    ///
    /// # Errors
    ///
    /// Rejects with `WrongStatus` (including `done`, which is immutable).
    pub fn reset(&self, packet_id: &str, supervisor: &str) -> Result<TransitionResult> {
        Self::require_actor(supervisor)?;
        self.definition.require_packet(packet_id)?;

        let _global = self.lock_state()?;
        let _packet_lock = self.commit_store.lock_packet(packet_id)?;
        let mut doc = self.state_store.load()?;

        let current = doc.status_of(packet_id);
        if !current.is_resettable() {
            return Err(Self::wrong_status(
                packet_id,
                current,
                "failed, stalled, escalated, or preflight",
            ));
        }

        let pre_view = doc.packet(packet_id).committed_view()?;
        {
            let packet = doc.packet_mut(packet_id);
            packet.status = PacketStatus::Pending;
            packet.assigned_to = None;
            packet.started_at = None;
            packet.completed_at = None;
            packet.preflight = None;
            packet.review = None;
        }
        let commit = self.seal_packet(
            &mut doc,
            packet_id,
            LifecycleEvent::Reset,
            supervisor,
            "supervisor reset",
            json!({}),
            Value::Null,
            &pre_view,
        )?;

        let recomputed = self.propagate_blocking(&mut doc, packet_id)?;
        self.state_store.save(&mut doc)?;

        let mut message = format!("{packet_id} reset to pending");
        if !recomputed.is_empty() {
            message.push_str(&format!(
                "; recomputed: {}",
                recomputed
                    .iter()
                    .map(|r| r.packet_id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        Ok(TransitionResult {
            packet_id: packet_id.to_string(),
            status: PacketStatus::Pending,
            commit_seq: Some(commit.seq),
            message,
        })
    }

    /// Appends evidence narrative without changing status. Emits a commit
    /// whose diff captures the note.
    ///
    /// # Errors
    ///
    /// Rejects with `AlreadyTerminal` on `done`/`failed` packets.
    pub fn note(&self, packet_id: &str, actor: &str, notes: &str) -> Result<TransitionResult> {
        Self::require_actor(actor)?;
        self.definition.require_packet(packet_id)?;
        if notes.trim().is_empty() {
            return Err(GovernanceError::Usage {
                message: "note text is required".to_string(),
            });
        }

        let _global = self.lock_state()?;
        let _packet_lock = self.commit_store.lock_packet(packet_id)?;
        let mut doc = self.state_store.load()?;

        let current = doc.status_of(packet_id);
        if current.is_terminal() {
            return Err(GovernanceError::InvalidTransition {
                kind: TransitionErrorKind::AlreadyTerminal,
                packet_id: packet_id.to_string(),
                message: format!("packet is {current}; terminal state is immutable"),
            });
        }

        let pre_view = doc.packet(packet_id).committed_view()?;
        {
            let packet = doc.packet_mut(packet_id);
            packet.notes = Some(match packet.notes.take() {
                Some(existing) if !existing.is_empty() => format!("{existing}\n{notes}"),
                _ => notes.to_string(),
            });
        }
        let commit = self.seal_packet(
            &mut doc,
            packet_id,
            LifecycleEvent::Noted,
            actor,
            "",
            json!({"notes": notes}),
            json!({"notes": notes}),
            &pre_view,
        )?;
        self.state_store.save(&mut doc)?;

        Ok(TransitionResult {
            packet_id: packet_id.to_string(),
            status: current,
            commit_seq: Some(commit.seq),
            message: format!("{packet_id} notes updated"),
        })
    }

    /// Closes out a level-2 area once every packet in it is `done`:
    /// records the closeout, logs it, and emits a project checkpoint.
    ///
    /// # Errors
    ///
    /// Rejects with `NotFound` for unknown areas, `Usage` for a missing
    /// assessment document, `WrongStatus` while packets are incomplete.
    pub fn closeout_l2(
        &self,
        area_id: &str,
        supervisor: &str,
        assessment_path: &Path,
        notes: Option<&str>,
    ) -> Result<(AreaCloseout, ProjectCheckpoint)> {
        Self::require_actor(supervisor)?;
        let area = self
            .definition
            .area(area_id)
            .ok_or_else(|| GovernanceError::NotFound {
                kind: "area",
                id: area_id.to_string(),
            })?
            .clone();
        if !assessment_path.is_file() {
            return Err(GovernanceError::Usage {
                message: format!(
                    "assessment document not found: {}",
                    assessment_path.display()
                ),
            });
        }

        let _global = self.lock_state()?;
        let mut doc = self.state_store.load()?;

        let incomplete: Vec<String> = self
            .definition
            .packets_in_area(area_id)
            .iter()
            .filter(|p| doc.status_of(&p.id) != PacketStatus::Done)
            .map(|p| format!("{}({})", p.id, doc.status_of(&p.id)))
            .collect();
        if !incomplete.is_empty() {
            return Err(GovernanceError::InvalidTransition {
                kind: TransitionErrorKind::WrongStatus,
                packet_id: format!("AREA-{area_id}"),
                message: format!("incomplete packets: {}", incomplete.join(", ")),
            });
        }

        let checkpoint = self.snapshot_heads()?;
        let closeout = AreaCloseout {
            area_title: area.title,
            closed_by: supervisor.to_string(),
            closed_at: time::now_utc_string(),
            assessment_path: assessment_path.display().to_string(),
            notes: notes.map(ToString::to_string),
            checkpoint_id: checkpoint.checkpoint_id.clone(),
        };
        doc.area_closeouts
            .insert(area_id.to_string(), closeout.clone());
        doc.log.push(LifecycleLogEntry {
            timestamp: time::now_utc_string(),
            packet_id: format!("AREA-{area_id}"),
            event: LifecycleEvent::CloseoutL2,
            actor: supervisor.to_string(),
            details: json!({
                "assessment_path": closeout.assessment_path,
                "checkpoint_id": checkpoint.checkpoint_id,
                "notes": notes,
            }),
        });
        self.state_store.save(&mut doc)?;

        Ok((closeout, checkpoint))
    }

    /// Snapshots every packet HEAD into a new project checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `Io` on persistence failure.
    pub fn snapshot_heads(&self) -> Result<ProjectCheckpoint> {
        let mut head_table = BTreeMap::new();
        for packet_id in self.commit_store.packet_ids()? {
            if let Some(head) = self.commit_store.head(&packet_id)? {
                head_table.insert(packet_id, head);
            }
        }
        self.commit_store.write_checkpoint(head_table)
    }

    /// Ready packets, ordered by `(area_id, wbs_ref)`.
    ///
    /// # Errors
    ///
    /// Returns `Io`/`SchemaInvalid` on state load failure.
    pub fn ready(&self) -> Result<Vec<ReadyPacket>> {
        let doc = self.state_store.load()?;
        Ok(gate::ready_packets(&self.definition, &doc))
    }

    /// A snapshot of the full state document.
    ///
    /// # Errors
    ///
    /// Returns `Io`/`SchemaInvalid` on state load failure.
    pub fn status_snapshot(&self) -> Result<StateDocument> {
        self.state_store.load()
    }

    /// The last `limit` lifecycle log entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Io`/`SchemaInvalid` on state load failure.
    pub fn log_tail(&self, limit: usize) -> Result<Vec<LifecycleLogEntry>> {
        let doc = self.state_store.load()?;
        Ok(doc.log.into_iter().rev().take(limit).collect())
    }

    /// The runtime state of one packet (pending default if untouched).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for packets absent from the definition.
    pub fn packet_state(&self, packet_id: &str) -> Result<PacketRuntimeState> {
        self.definition.require_packet(packet_id)?;
        Ok(self.state_store.load()?.packet(packet_id))
    }
}

/// Seconds elapsed since an RFC 3339 anchor, `None` when unparseable.
fn elapsed_secs(anchor: Option<&str>, now: chrono::DateTime<chrono::Utc>) -> Option<u64> {
    let anchor = DateTime::parse_from_rfc3339(anchor?).ok()?;
    let elapsed = now.signed_duration_since(anchor.with_timezone(&chrono::Utc));
    u64::try_from(elapsed.num_seconds()).ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::definition::{DefinitionDocument, DefinitionMetadata, PacketDefinition, WorkArea};

    fn packet_def(id: &str, deps: &[&str]) -> PacketDefinition {
        PacketDefinition {
            id: id.to_string(),
            wbs_ref: format!("1.{id}"),
            area_id: "1.0".to_string(),
            title: format!("Packet {id}"),
            scope: "scope".to_string(),
            preconditions: Vec::new(),
            required_actions: Vec::new(),
            required_outputs: Vec::new(),
            validation_checks: Vec::new(),
            exit_criteria: Vec::new(),
            halt_conditions: Vec::new(),
            dependencies: deps.iter().map(ToString::to_string).collect(),
            preflight_required: false,
            review_required: false,
            heartbeat_required: false,
            heartbeat_interval_seconds: None,
            context_manifest: Vec::new(),
            template_ref: None,
            ontology_required: false,
        }
    }

    fn write_definition(dir: &Path, packets: Vec<PacketDefinition>) -> std::path::PathBuf {
        let doc = DefinitionDocument {
            schema_version: "1.0".to_string(),
            metadata: DefinitionMetadata::default(),
            work_areas: vec![WorkArea {
                id: "1.0".to_string(),
                title: "Area".to_string(),
                description: String::new(),
            }],
            packets,
        };
        let path = dir.join("definition-input.json");
        store::atomic_write_json(&path, &doc).unwrap();
        path
    }

    fn engine_with(packets: Vec<PacketDefinition>) -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().expect("tempdir");
        let def_path = write_definition(dir.path(), packets);
        let engine = Engine::init(EngineConfig::new(dir.path()), &def_path).unwrap();
        (dir, engine)
    }

    fn heartbeat_payload() -> HeartbeatPayload {
        serde_json::from_value(json!({
            "status": "working",
            "decisions": ["kept scope"],
            "obstacles": [],
            "completion_estimate": "70%",
        }))
        .unwrap()
    }

    fn review_assessment() -> ReviewAssessment {
        serde_json::from_value(json!({
            "exit_criteria_assessment": {"all": "pass"},
            "findings": "none",
            "risk_flags": [],
        }))
        .unwrap()
    }

    #[test]
    fn test_happy_path_two_packets() {
        let (_dir, engine) = engine_with(vec![packet_def("A", &[]), packet_def("B", &["A"])]);

        let claimed = engine.claim("A", "alice", &[]).unwrap();
        assert_eq!(claimed.status, PacketStatus::InProgress);
        assert_eq!(claimed.commit_seq, Some(1));

        // B is gated on A.
        let err = engine.claim("B", "bob", &[]).unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::InvalidTransition {
                kind: TransitionErrorKind::DependencyUnmet,
                ..
            }
        ));

        let done = engine
            .done("A", "alice", "impl+tests", ResidualRiskAck::None)
            .unwrap();
        assert_eq!(done.status, PacketStatus::Done);
        assert_eq!(done.commit_seq, Some(2));

        let ready: Vec<String> = engine.ready().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ready, ["B"]);

        engine.claim("B", "bob", &[]).unwrap();
        engine
            .done("B", "bob", "impl", ResidualRiskAck::None)
            .unwrap();
        assert_eq!(engine.commit_store().commit_count("A").unwrap(), 2);
        assert_eq!(engine.commit_store().commit_count("B").unwrap(), 2);
    }

    #[test]
    fn test_claim_rejected_when_already_claimed() {
        let (_dir, engine) = engine_with(vec![packet_def("A", &[])]);
        engine.claim("A", "alice", &[]).unwrap();
        let err = engine.claim("A", "bob", &[]).unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::InvalidTransition {
                kind: TransitionErrorKind::WrongStatus,
                ..
            }
        ));
        // Rejection left no commit behind.
        assert_eq!(engine.commit_store().commit_count("A").unwrap(), 1);
    }

    #[test]
    fn test_context_attestation_enforced() {
        let mut packet = packet_def("A", &[]);
        packet.context_manifest = vec![crate::definition::ContextManifestEntry {
            file: "docs/spec.md".to_string(),
            priority: "high".to_string(),
            required: true,
        }];
        let (_dir, engine) = engine_with(vec![packet]);

        let err = engine.claim("A", "alice", &[]).unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::InvalidTransition {
                kind: TransitionErrorKind::ContextAttestationMissing,
                ..
            }
        ));

        engine
            .claim("A", "alice", &["docs/spec.md".to_string()])
            .unwrap();
    }

    #[test]
    fn test_preflight_flow_approve_and_return() {
        let mut pf1 = packet_def("PF-1", &[]);
        pf1.preflight_required = true;
        let mut pf2 = packet_def("PF-2", &[]);
        pf2.preflight_required = true;
        let (_dir, engine) = engine_with(vec![pf1, pf2]);

        let claimed = engine.claim("PF-1", "alice", &[]).unwrap();
        assert_eq!(claimed.status, PacketStatus::Preflight);

        let assessment: PreflightAssessment = serde_json::from_value(json!({
            "context_confirmation": {"ok": true},
            "ambiguity_register": [],
            "risk_flags": [],
            "execution_plan": {"steps": ["x"]},
        }))
        .unwrap();
        engine.preflight("PF-1", "alice", assessment.clone()).unwrap();

        // The executor cannot approve their own preflight.
        let err = engine.preflight_decide("PF-1", "alice", true, "").unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::InvalidTransition {
                kind: TransitionErrorKind::IdentityConflict,
                ..
            }
        ));

        let approved = engine.preflight_decide("PF-1", "sam", true, "").unwrap();
        assert_eq!(approved.status, PacketStatus::InProgress);

        engine.claim("PF-2", "alice", &[]).unwrap();
        engine.preflight("PF-2", "alice", assessment).unwrap();
        let returned = engine
            .preflight_decide("PF-2", "sam", false, "needs clarification")
            .unwrap();
        assert_eq!(returned.status, PacketStatus::Pending);
        let state = engine.packet_state("PF-2").unwrap();
        assert!(state.assigned_to.is_none());
        assert!(state.preflight.is_none());
    }

    #[test]
    fn test_done_requires_evidence_and_owner() {
        let (_dir, engine) = engine_with(vec![packet_def("A", &[])]);
        engine.claim("A", "alice", &[]).unwrap();

        let err = engine
            .done("A", "alice", "  ", ResidualRiskAck::None)
            .unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::InvalidTransition {
                kind: TransitionErrorKind::EvidenceMissing,
                ..
            }
        ));

        let err = engine
            .done("A", "mallory", "done it", ResidualRiskAck::None)
            .unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::InvalidTransition {
                kind: TransitionErrorKind::IdentityConflict,
                ..
            }
        ));
    }

    #[test]
    fn test_done_with_declared_risk_lands_in_register() {
        let (_dir, engine) = engine_with(vec![packet_def("A", &[])]);
        engine.claim("A", "alice", &[]).unwrap();
        engine
            .done(
                "A",
                "alice",
                "impl done",
                ResidualRiskAck::Declared(vec![crate::payloads::ResidualRiskDeclaration {
                    severity: crate::risk::RiskSeverity::Medium,
                    description: "rate limiter untested under burst load".to_string(),
                    owner: None,
                }]),
            )
            .unwrap();

        let risks = engine.risk_store().list(Some("A"), None).unwrap();
        assert_eq!(risks.len(), 1);
        assert_eq!(risks[0].id, "RR-0001");

        let state = engine.packet_state("A").unwrap();
        assert_eq!(state.residual_risk["ack"], "declared");
    }

    #[test]
    fn test_review_cycle_reject_then_approve() {
        let mut packet = packet_def("C", &[]);
        packet.review_required = true;
        let (_dir, engine) = engine_with(vec![packet]);

        engine.claim("C", "alice", &[]).unwrap();
        let routed = engine
            .done("C", "alice", "ready for review", ResidualRiskAck::None)
            .unwrap();
        assert_eq!(routed.status, PacketStatus::Review);

        // Two-person integrity on claim.
        let err = engine.review_claim("C", "alice").unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::InvalidTransition {
                kind: TransitionErrorKind::IdentityConflict,
                ..
            }
        ));

        engine.review_claim("C", "bob").unwrap();
        let rejected = engine
            .review_submit("C", "bob", ReviewVerdict::Reject, review_assessment())
            .unwrap();
        assert_eq!(rejected.status, PacketStatus::InProgress);
        assert_eq!(
            engine.packet_state("C").unwrap().review.unwrap().cycle_count,
            1
        );

        engine
            .done("C", "alice", "fixed findings", ResidualRiskAck::None)
            .unwrap();
        engine.review_claim("C", "bob").unwrap();
        let approved = engine
            .review_submit("C", "bob", ReviewVerdict::Approve, review_assessment())
            .unwrap();
        assert_eq!(approved.status, PacketStatus::Done);
    }

    #[test]
    fn test_review_rejects_exhaust_cycle_budget() {
        let mut packet = packet_def("C", &[]);
        packet.review_required = true;
        let (_dir, engine) = engine_with(vec![packet]);

        // Tighten the budget to one cycle.
        {
            let store = engine.state_store();
            let mut doc = store.load().unwrap();
            doc.metadata.max_review_cycles = 1;
            store.save(&mut doc).unwrap();
        }

        engine.claim("C", "alice", &[]).unwrap();
        engine
            .done("C", "alice", "evidence", ResidualRiskAck::None)
            .unwrap();
        engine.review_claim("C", "bob").unwrap();
        let result = engine
            .review_submit("C", "bob", ReviewVerdict::Reject, review_assessment())
            .unwrap();
        assert_eq!(result.status, PacketStatus::Escalated);
    }

    #[test]
    fn test_failure_propagates_and_reset_recovers() {
        // X <- Y <- Z
        let (_dir, engine) = engine_with(vec![
            packet_def("X", &[]),
            packet_def("Y", &["X"]),
            packet_def("Z", &["Y"]),
        ]);

        engine.claim("X", "alice", &[]).unwrap();
        let failed = engine.fail("X", "alice", "cannot", false).unwrap();
        assert_eq!(failed.status, PacketStatus::Failed);
        assert_eq!(engine.packet_state("Y").unwrap().status, PacketStatus::Blocked);
        assert_eq!(engine.packet_state("Z").unwrap().status, PacketStatus::Blocked);

        // Blocked dependents each carry a commit binding their state.
        assert_eq!(engine.commit_store().commit_count("Y").unwrap(), 1);

        let reset = engine.reset("X", "sam").unwrap();
        assert_eq!(reset.status, PacketStatus::Pending);
        assert_eq!(engine.packet_state("Y").unwrap().status, PacketStatus::Pending);
        assert_eq!(engine.packet_state("Z").unwrap().status, PacketStatus::Pending);
    }

    #[test]
    fn test_reset_rejected_for_done() {
        let (_dir, engine) = engine_with(vec![packet_def("A", &[])]);
        engine.claim("A", "alice", &[]).unwrap();
        engine
            .done("A", "alice", "evidence", ResidualRiskAck::None)
            .unwrap();
        let err = engine.reset("A", "sam").unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::InvalidTransition {
                kind: TransitionErrorKind::AlreadyTerminal,
                ..
            }
        ));
    }

    #[test]
    fn test_heartbeat_updates_without_commit() {
        let (_dir, engine) = engine_with(vec![packet_def("A", &[])]);
        engine.claim("A", "alice", &[]).unwrap();
        let before = engine.commit_store().commit_count("A").unwrap();

        let result = engine.heartbeat("A", "alice", heartbeat_payload()).unwrap();
        assert_eq!(result.commit_seq, None);
        assert_eq!(engine.commit_store().commit_count("A").unwrap(), before);
        assert!(engine
            .packet_state("A")
            .unwrap()
            .last_heartbeat_at
            .is_some());
    }

    #[test]
    fn test_stall_and_revive() {
        let (_dir, engine) = engine_with(vec![packet_def("D", &[])]);
        engine.claim("D", "alice", &[]).unwrap();

        // Backdate the heartbeat anchor past the stall window.
        {
            let store = engine.state_store();
            let mut doc = store.load().unwrap();
            doc.packet_mut("D").started_at =
                Some("2020-01-01T00:00:00.000000Z".to_string());
            store.save(&mut doc).unwrap();
        }

        let stalled = engine.check_stalled().unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].status, PacketStatus::Stalled);
        let stall_seq = stalled[0].commit_seq.unwrap();

        // Idempotent within the window: nothing further to do.
        assert!(engine.check_stalled().unwrap().is_empty());

        let revived = engine.heartbeat("D", "alice", heartbeat_payload()).unwrap();
        assert_eq!(revived.status, PacketStatus::InProgress);
        assert_eq!(revived.commit_seq, Some(stall_seq + 1));
    }

    #[test]
    fn test_preflight_timeout_returns_to_pending() {
        let mut packet = packet_def("PF", &[]);
        packet.preflight_required = true;
        let (_dir, engine) = engine_with(vec![packet]);
        engine.claim("PF", "alice", &[]).unwrap();

        {
            let store = engine.state_store();
            let mut doc = store.load().unwrap();
            doc.packet_mut("PF").started_at =
                Some("2020-01-01T00:00:00.000000Z".to_string());
            store.save(&mut doc).unwrap();
        }

        let swept = engine.check_stalled().unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].status, PacketStatus::Pending);
        assert!(engine.packet_state("PF").unwrap().assigned_to.is_none());
    }

    #[test]
    fn test_note_appends_and_respects_terminality() {
        let (_dir, engine) = engine_with(vec![packet_def("A", &[])]);
        engine.claim("A", "alice", &[]).unwrap();
        engine.note("A", "alice", "first finding").unwrap();
        engine.note("A", "alice", "second finding").unwrap();
        assert_eq!(
            engine.packet_state("A").unwrap().notes.as_deref(),
            Some("first finding\nsecond finding")
        );

        engine
            .done("A", "alice", "evidence", ResidualRiskAck::None)
            .unwrap();
        let err = engine.note("A", "alice", "too late").unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::InvalidTransition {
                kind: TransitionErrorKind::AlreadyTerminal,
                ..
            }
        ));
    }

    #[test]
    fn test_closeout_l2_requires_all_done() {
        let (dir, engine) = engine_with(vec![packet_def("A", &[]), packet_def("B", &[])]);
        let assessment = dir.path().join("assessment.md");
        std::fs::write(&assessment, "area assessment").unwrap();

        let err = engine
            .closeout_l2("1.0", "sam", &assessment, None)
            .unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::InvalidTransition {
                kind: TransitionErrorKind::WrongStatus,
                ..
            }
        ));

        for (id, actor) in [("A", "alice"), ("B", "bob")] {
            engine.claim(id, actor, &[]).unwrap();
            engine.done(id, actor, "evidence", ResidualRiskAck::None).unwrap();
        }
        let (closeout, checkpoint) = engine
            .closeout_l2("1.0", "sam", &assessment, Some("clean"))
            .unwrap();
        assert_eq!(closeout.checkpoint_id, checkpoint.checkpoint_id);
        assert_eq!(checkpoint.head_table.len(), 2);

        let doc = engine.status_snapshot().unwrap();
        assert!(doc.area_closeouts.contains_key("1.0"));
    }

    #[test]
    fn test_runtime_binding_after_every_transition() {
        let (_dir, engine) = engine_with(vec![packet_def("A", &[])]);
        engine.claim("A", "alice", &[]).unwrap();
        engine.heartbeat("A", "alice", heartbeat_payload()).unwrap();
        engine.note("A", "alice", "midway").unwrap();
        engine
            .done("A", "alice", "evidence", ResidualRiskAck::None)
            .unwrap();

        let head = engine.commit_store().head("A").unwrap().unwrap();
        let state = engine.packet_state("A").unwrap();
        assert_eq!(state.committed_hash().unwrap(), head.post_state_hash);
    }
}
