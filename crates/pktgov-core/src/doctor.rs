//! Startup integrity runtime.
//!
//! The doctor binds live state to committed history before the process
//! serves operators:
//!
//! 1. dcl-config lock check (refuse a profile mismatch),
//! 2. journal recovery for every packet,
//! 3. replay of committed-but-unapplied state writes from commit diffs,
//! 4. **fast** checks: HEAD-equality and runtime-state binding per packet,
//! 5. **full** mode adds complete chain recomputation and checkpoint
//!    verification.
//!
//! Strict mode aborts startup on any failure. Fail-open mode serves reads
//! but refuses mutation; the operator surface enforces that by running a
//! fast doctor before every mutating command.

use serde::{Deserialize, Serialize};

use crate::config::DclConfig;
use crate::dcl::RecoveryAction;
use crate::engine::Engine;
use crate::error::{GovernanceError, IntegrityErrorKind, Result};
use crate::state::PacketRuntimeState;
use crate::store::DirLock;
use crate::verify::{Verifier, VerifyIssue};

/// Doctor depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoctorMode {
    /// Journal recovery + HEAD-equality + runtime-state binding.
    Fast,
    /// Fast checks plus complete chain recomputation.
    Full,
}

/// The structured doctor report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoctorReport {
    /// True when no failure was found.
    pub ok: bool,
    /// The depth that ran.
    pub mode: DoctorMode,
    /// Packets with chains.
    pub packet_count: u64,
    /// Total commits on disk.
    pub commit_count: u64,
    /// Checkpoints on disk.
    pub checkpoint_count: u64,
    /// Packets whose journals were recovered.
    pub recovered: Vec<String>,
    /// Packets whose state document was replayed from a commit diff.
    pub repaired: Vec<String>,
    /// All failures found.
    pub failures: Vec<VerifyIssue>,
}

/// Runs the doctor at the requested depth.
///
/// # Errors
///
/// Returns `Io` on storage failure; integrity findings land in the report.
pub fn run(engine: &Engine, mode: DoctorMode) -> Result<DoctorReport> {
    let mut failures = Vec::new();
    let mut recovered = Vec::new();
    let mut repaired = Vec::new();

    // 1. Config lock.
    if let Err(GovernanceError::IntegrityFailure { kind, message, .. }) =
        DclConfig::verify(&engine.config().root)
    {
        failures.push(VerifyIssue {
            packet_id: None,
            code: kind.code().to_string(),
            message,
        });
    }

    // 2. Journal recovery.
    for (packet_id, action) in engine.commit_store().recover_all()? {
        tracing::info!(packet_id, ?action, "doctor recovered journal");
        if matches!(
            action,
            RecoveryAction::Completed { .. } | RecoveryAction::RolledBack { .. }
        ) {
            recovered.push(packet_id);
        }
    }

    // 3 + 4. Per-packet repair and fast checks, under the global lock so a
    // repair write cannot race an operator mutation.
    let commit_store = engine.commit_store();
    let state_store = engine.state_store();
    let packet_ids = commit_store.packet_ids()?;
    let mut commit_count = 0;
    {
        let _global = DirLock::acquire(&state_store.lock_path())?;
        let mut doc = state_store.load()?;
        let mut doc_dirty = false;

        for packet_id in &packet_ids {
            let Some(head) = commit_store.head(packet_id)? else {
                continue;
            };
            commit_count += commit_store.commit_count(packet_id)?;

            // HEAD-equality: the commit HEAD points at must exist, carry
            // HEAD's hash, and be the last one on disk.
            match commit_store.commit(packet_id, head.seq) {
                Ok(commit) if commit.commit_hash == head.commit_hash => {
                    if commit_store.commit(packet_id, head.seq + 1).is_ok() {
                        failures.push(VerifyIssue {
                            packet_id: Some(packet_id.clone()),
                            code: IntegrityErrorKind::HeadDrift.code().to_string(),
                            message: format!(
                                "commit {} exists beyond HEAD seq {}",
                                head.seq + 1,
                                head.seq
                            ),
                        });
                    }
                },
                Ok(_) => failures.push(VerifyIssue {
                    packet_id: Some(packet_id.clone()),
                    code: IntegrityErrorKind::HeadDrift.code().to_string(),
                    message: format!("HEAD hash disagrees with commit at seq {}", head.seq),
                }),
                Err(_) => failures.push(VerifyIssue {
                    packet_id: Some(packet_id.clone()),
                    code: IntegrityErrorKind::HeadDrift.code().to_string(),
                    message: format!("HEAD points at missing commit seq {}", head.seq),
                }),
            }

            // Runtime binding, with diff replay for the crash window where
            // the commit landed but the state write did not.
            let packet = doc.packet(packet_id);
            let state_hash = packet.committed_hash()?;
            if state_hash == head.post_state_hash {
                continue;
            }
            let replayed = replay_last_commit(commit_store, packet_id, &packet, &head)?;
            match replayed {
                Some(repaired_packet) => {
                    doc.packets.insert(packet_id.clone(), repaired_packet);
                    doc_dirty = true;
                    repaired.push(packet_id.clone());
                    tracing::warn!(packet_id, "replayed committed state from commit diff");
                },
                None => failures.push(VerifyIssue {
                    packet_id: Some(packet_id.clone()),
                    code: IntegrityErrorKind::RuntimeBindingMismatch.code().to_string(),
                    message: "runtime state does not hash to HEAD post_state_hash".to_string(),
                }),
            }
        }

        if doc_dirty {
            state_store.save(&mut doc)?;
        }
    }

    // 5. Full chain recomputation.
    if mode == DoctorMode::Full {
        let report = Verifier::new(engine).verify_all()?;
        for issue in report.issues {
            if !failures.contains(&issue) {
                failures.push(issue);
            }
        }
    }

    let report = DoctorReport {
        ok: failures.is_empty(),
        mode,
        packet_count: packet_ids.len() as u64,
        commit_count,
        checkpoint_count: engine.commit_store().checkpoint_count()?,
        recovered,
        repaired,
        failures,
    };
    if report.ok {
        tracing::info!(mode = ?mode, packets = report.packet_count, "doctor clean");
    } else {
        tracing::error!(mode = ?mode, failures = report.failures.len(), "doctor found failures");
    }
    Ok(report)
}

/// Attempts to rebuild a packet's runtime state by applying the HEAD
/// commit's diff to the current (pre) state. Returns the repaired state
/// only when it hashes to HEAD's `post_state_hash`.
fn replay_last_commit(
    commit_store: &crate::dcl::CommitStore,
    packet_id: &str,
    current: &PacketRuntimeState,
    head: &crate::dcl::Head,
) -> Result<Option<PacketRuntimeState>> {
    let Ok(commit) = commit_store.commit(packet_id, head.seq) else {
        return Ok(None);
    };
    let current_view = current.committed_view()?;
    if crate::hash::hash_value(&current_view)? != commit.pre_state_hash {
        return Ok(None);
    }
    let candidate_view = commit.diff.apply(&current_view);
    if crate::hash::hash_value(&candidate_view)? != head.post_state_hash {
        return Ok(None);
    }
    let mut repaired: PacketRuntimeState =
        serde_json::from_value(candidate_view).map_err(|e| GovernanceError::SchemaInvalid {
            message: format!("replayed state for {packet_id} is malformed: {e}"),
        })?;
    // Volatile fields are outside the committed view; carry them over.
    repaired.last_heartbeat_at = current.last_heartbeat_at.clone();
    repaired.heartbeat_payload = current.heartbeat_payload.clone();
    Ok(Some(repaired))
}

/// Enforces strict-mode semantics over a report.
///
/// # Errors
///
/// Returns the first failure as `IntegrityFailure` when the report is not
/// clean.
pub fn enforce_strict(report: &DoctorReport) -> Result<()> {
    match report.failures.first() {
        None => Ok(()),
        Some(issue) => Err(GovernanceError::IntegrityFailure {
            kind: IntegrityErrorKind::HeadDrift,
            packet_id: issue.packet_id.clone(),
            message: format!("{} ({})", issue.message, issue.code),
        }),
    }
}
