//! Chain, HEAD, and runtime-state verification; history and proof export.
//!
//! Verification recomputes every hash from first principles: commit
//! hashes, action hashes, prev-hash links, pre/post state continuity,
//! HEAD binding, and the binding between the live runtime state and
//! HEAD's `post_state_hash`. Findings are collected as typed issues so
//! the doctor can report them all; strict callers convert the first
//! issue into an `IntegrityFailure`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dcl::{DclCommit, GENESIS, Head};
use crate::engine::Engine;
use crate::error::{GovernanceError, IntegrityErrorKind, Result};
use crate::hash;
use crate::state::StateDocument;
use crate::store;
use crate::time;

/// One verification finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyIssue {
    /// The packet involved, when packet-scoped.
    pub packet_id: Option<String>,
    /// Stable subcode (see [`IntegrityErrorKind::code`]).
    pub code: String,
    /// Human-readable detail.
    pub message: String,
}

impl VerifyIssue {
    fn packet(packet_id: &str, kind: IntegrityErrorKind, message: impl Into<String>) -> Self {
        Self {
            packet_id: Some(packet_id.to_string()),
            code: kind.code().to_string(),
            message: message.into(),
        }
    }

    fn global(kind: IntegrityErrorKind, message: impl Into<String>) -> Self {
        Self {
            packet_id: None,
            code: kind.code().to_string(),
            message: message.into(),
        }
    }
}

/// Verification result for one packet chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketReport {
    /// The packet verified.
    pub packet_id: String,
    /// Commits inspected.
    pub commit_count: u64,
    /// Findings; empty means the chain verified clean.
    pub issues: Vec<VerifyIssue>,
}

impl PacketReport {
    /// True when no issue was found.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Verification result across the whole root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    /// True when no issue was found anywhere.
    pub ok: bool,
    /// Packets with chains.
    pub packet_count: u64,
    /// Total commits inspected.
    pub commit_count: u64,
    /// Checkpoints on disk.
    pub checkpoint_count: u64,
    /// All findings.
    pub issues: Vec<VerifyIssue>,
}

/// A sealed, self-contained proof bundle for one packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofBundle {
    /// Display id (`PROOF-<packet>`).
    pub bundle_id: String,
    /// When the bundle was exported.
    pub created_at: String,
    /// The packet covered.
    pub packet_id: String,
    /// The packet's definition at export time.
    pub definition_excerpt: Value,
    /// The full commit chain.
    pub commits: Vec<DclCommit>,
    /// The HEAD pointer at export time.
    pub head: Option<Head>,
    /// The committed runtime-state view at export time.
    pub runtime_state: Value,
    /// Constitution document snapshot.
    pub constitution: String,
    /// Hash over the canonical bundle minus this field.
    pub manifest_hash: String,
}

impl ProofBundle {
    /// Recomputes this bundle's manifest hash from its contents.
    ///
    /// # Errors
    ///
    /// Returns `SchemaInvalid`/`Canonical` on serialization failure.
    pub fn compute_manifest_hash(&self) -> Result<String> {
        let mut value =
            serde_json::to_value(self).map_err(|e| GovernanceError::SchemaInvalid {
                message: format!("cannot serialize proof bundle: {e}"),
            })?;
        if let Value::Object(map) = &mut value {
            map.remove("manifest_hash");
        }
        Ok(hash::hash_value(&value)?)
    }
}

/// Verifier over an engine's stores.
#[derive(Debug)]
pub struct Verifier<'a> {
    engine: &'a Engine,
}

impl<'a> Verifier<'a> {
    /// Creates a verifier for an engine.
    #[must_use]
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Verifies one packet's chain, HEAD, and runtime binding. Journal
    /// recovery runs first, under the packet lock.
    ///
    /// # Errors
    ///
    /// Returns `Io` on storage failure; integrity findings are collected
    /// in the report rather than raised.
    pub fn verify_packet(&self, packet_id: &str) -> Result<PacketReport> {
        {
            let _lock = self.engine.commit_store().lock_packet(packet_id)?;
            self.engine.commit_store().recover(packet_id)?;
        }
        let doc = self.engine.state_store().load()?;
        self.verify_packet_inner(packet_id, &doc)
    }

    fn verify_packet_inner(&self, packet_id: &str, doc: &StateDocument) -> Result<PacketReport> {
        let commits = self.engine.commit_store().commits(packet_id)?;
        let mut issues = Vec::new();

        let mut prev: Option<&DclCommit> = None;
        for (idx, commit) in commits.iter().enumerate() {
            let expected_seq = idx as u64 + 1;
            if commit.seq != expected_seq {
                issues.push(VerifyIssue::packet(
                    packet_id,
                    IntegrityErrorKind::SeqDiscontinuity,
                    format!("expected seq {expected_seq}, found {}", commit.seq),
                ));
            }
            match commit.compute_hash() {
                Ok(computed) if computed == commit.commit_hash => {},
                Ok(_) => issues.push(VerifyIssue::packet(
                    packet_id,
                    IntegrityErrorKind::CommitHashMismatch,
                    format!("commit_hash mismatch at seq {}", commit.seq),
                )),
                Err(e) => issues.push(VerifyIssue::packet(
                    packet_id,
                    IntegrityErrorKind::CommitHashMismatch,
                    format!("commit at seq {} not hashable: {e}", commit.seq),
                )),
            }
            match hash::hash_serializable(&commit.action_envelope) {
                Ok(computed) if computed == commit.action_hash => {},
                Ok(_) => issues.push(VerifyIssue::packet(
                    packet_id,
                    IntegrityErrorKind::CommitHashMismatch,
                    format!("action_hash mismatch at seq {}", commit.seq),
                )),
                Err(e) => issues.push(VerifyIssue::packet(
                    packet_id,
                    IntegrityErrorKind::CommitHashMismatch,
                    format!("action envelope at seq {} not hashable: {e}", commit.seq),
                )),
            }
            match prev {
                None => {
                    if commit.prev_commit_hash != GENESIS {
                        issues.push(VerifyIssue::packet(
                            packet_id,
                            IntegrityErrorKind::PrevHashMismatch,
                            format!(
                                "seq 1 must link to {GENESIS}, found {}",
                                commit.prev_commit_hash
                            ),
                        ));
                    }
                },
                Some(previous) => {
                    if commit.prev_commit_hash != previous.commit_hash {
                        issues.push(VerifyIssue::packet(
                            packet_id,
                            IntegrityErrorKind::PrevHashMismatch,
                            format!("prev_commit_hash mismatch at seq {}", commit.seq),
                        ));
                    }
                    if commit.pre_state_hash != previous.post_state_hash {
                        issues.push(VerifyIssue::packet(
                            packet_id,
                            IntegrityErrorKind::StateHashMismatch,
                            format!("pre/post state chain mismatch at seq {}", commit.seq),
                        ));
                    }
                },
            }
            prev = Some(commit);
        }

        let head = self.engine.commit_store().head(packet_id)?;
        match (commits.last(), &head) {
            (Some(last), Some(head)) => {
                if head.seq != last.seq
                    || head.commit_hash != last.commit_hash
                    || head.post_state_hash != last.post_state_hash
                {
                    issues.push(VerifyIssue::packet(
                        packet_id,
                        IntegrityErrorKind::HeadDrift,
                        format!(
                            "HEAD at seq {} does not match last commit seq {}",
                            head.seq, last.seq
                        ),
                    ));
                }
            },
            (Some(last), None) => issues.push(VerifyIssue::packet(
                packet_id,
                IntegrityErrorKind::HeadDrift,
                format!("HEAD missing while chain has {} commits", last.seq),
            )),
            (None, Some(_)) => issues.push(VerifyIssue::packet(
                packet_id,
                IntegrityErrorKind::HeadDrift,
                "HEAD present without any commits",
            )),
            (None, None) => {},
        }

        if let Some(head) = &head {
            let state_hash = doc.packet(packet_id).committed_hash()?;
            if state_hash != head.post_state_hash {
                issues.push(VerifyIssue::packet(
                    packet_id,
                    IntegrityErrorKind::RuntimeBindingMismatch,
                    "runtime state does not hash to HEAD post_state_hash",
                ));
            }
        }

        Ok(PacketReport {
            packet_id: packet_id.to_string(),
            commit_count: commits.len() as u64,
            issues,
        })
    }

    /// Verifies every packet with a chain, plus the latest project
    /// checkpoint when one exists.
    ///
    /// # Errors
    ///
    /// Returns `Io` on storage failure.
    pub fn verify_all(&self) -> Result<VerifyReport> {
        let commit_store = self.engine.commit_store();
        let doc = self.engine.state_store().load()?;

        let mut issues = Vec::new();
        let mut commit_count = 0;
        let packet_ids = commit_store.packet_ids()?;
        for packet_id in &packet_ids {
            {
                let _lock = commit_store.lock_packet(packet_id)?;
                commit_store.recover(packet_id)?;
            }
            let report = self.verify_packet_inner(packet_id, &doc)?;
            commit_count += report.commit_count;
            issues.extend(report.issues);
        }

        if let Some(checkpoint) = commit_store.latest_checkpoint()? {
            match checkpoint.compute_hash() {
                Ok(computed) if computed == checkpoint.checkpoint_hash => {},
                Ok(_) => issues.push(VerifyIssue::global(
                    IntegrityErrorKind::CheckpointMismatch,
                    format!("checkpoint_hash mismatch in {}", checkpoint.checkpoint_id),
                )),
                Err(e) => issues.push(VerifyIssue::global(
                    IntegrityErrorKind::CheckpointMismatch,
                    format!("checkpoint {} not hashable: {e}", checkpoint.checkpoint_id),
                )),
            }
            for (packet_id, recorded) in &checkpoint.head_table {
                match commit_store.commit(packet_id, recorded.seq) {
                    Ok(commit) => {
                        if commit.commit_hash != recorded.commit_hash
                            || commit.post_state_hash != recorded.post_state_hash
                        {
                            issues.push(VerifyIssue::packet(
                                packet_id,
                                IntegrityErrorKind::CheckpointMismatch,
                                format!(
                                    "chain diverges from checkpoint {} at seq {}",
                                    checkpoint.checkpoint_id, recorded.seq
                                ),
                            ));
                        }
                    },
                    Err(_) => issues.push(VerifyIssue::packet(
                        packet_id,
                        IntegrityErrorKind::CheckpointMismatch,
                        format!(
                            "commit at seq {} recorded by {} is missing",
                            recorded.seq, checkpoint.checkpoint_id
                        ),
                    )),
                }
            }
        }

        Ok(VerifyReport {
            ok: issues.is_empty(),
            packet_count: packet_ids.len() as u64,
            commit_count,
            checkpoint_count: commit_store.checkpoint_count()?,
            issues,
        })
    }

    /// The ordered commit list for inspection.
    ///
    /// # Errors
    ///
    /// Returns `Io`/`SchemaInvalid` on unreadable commits.
    pub fn history(&self, packet_id: &str) -> Result<Vec<DclCommit>> {
        self.engine.definition().require_packet(packet_id)?;
        self.engine.commit_store().commits(packet_id)
    }

    /// Exports a sealed proof bundle for one packet.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown packets, `Io` on write failure.
    pub fn export_proof(&self, packet_id: &str, out_path: &Path) -> Result<ProofBundle> {
        let packet_def = self.engine.definition().require_packet(packet_id)?;
        let doc = self.engine.state_store().load()?;
        let constitution_path = self.engine.config().root.join("constitution.txt");
        let constitution = std::fs::read_to_string(&constitution_path).unwrap_or_default();

        let mut bundle = ProofBundle {
            bundle_id: format!("PROOF-{packet_id}"),
            created_at: time::now_utc_string(),
            packet_id: packet_id.to_string(),
            definition_excerpt: serde_json::to_value(packet_def).map_err(|e| {
                GovernanceError::SchemaInvalid {
                    message: format!("cannot serialize definition excerpt: {e}"),
                }
            })?,
            commits: self.engine.commit_store().commits(packet_id)?,
            head: self.engine.commit_store().head(packet_id)?,
            runtime_state: doc.packet(packet_id).committed_view()?,
            constitution,
            manifest_hash: String::new(),
        };
        bundle.manifest_hash = bundle.compute_manifest_hash()?;
        store::atomic_write_json(out_path, &bundle)?;
        Ok(bundle)
    }

    /// Verifies a proof bundle: manifest hash, chain linkage, and the
    /// binding between the bundled runtime state and HEAD.
    ///
    /// # Errors
    ///
    /// Returns `IntegrityFailure` on the first failed check.
    pub fn verify_proof(bundle: &ProofBundle) -> Result<()> {
        if bundle.compute_manifest_hash()? != bundle.manifest_hash {
            return Err(GovernanceError::IntegrityFailure {
                kind: IntegrityErrorKind::CommitHashMismatch,
                packet_id: Some(bundle.packet_id.clone()),
                message: "proof bundle manifest_hash mismatch".to_string(),
            });
        }
        let mut prev: Option<&DclCommit> = None;
        for (idx, commit) in bundle.commits.iter().enumerate() {
            let expected_seq = idx as u64 + 1;
            if commit.seq != expected_seq {
                return Err(integrity(
                    &bundle.packet_id,
                    IntegrityErrorKind::SeqDiscontinuity,
                    format!("expected seq {expected_seq}, found {}", commit.seq),
                ));
            }
            if commit.compute_hash()? != commit.commit_hash {
                return Err(integrity(
                    &bundle.packet_id,
                    IntegrityErrorKind::CommitHashMismatch,
                    format!("commit_hash mismatch at seq {}", commit.seq),
                ));
            }
            if let Some(previous) = prev {
                if commit.prev_commit_hash != previous.commit_hash {
                    return Err(integrity(
                        &bundle.packet_id,
                        IntegrityErrorKind::PrevHashMismatch,
                        format!("prev_commit_hash mismatch at seq {}", commit.seq),
                    ));
                }
            } else if commit.prev_commit_hash != GENESIS {
                return Err(integrity(
                    &bundle.packet_id,
                    IntegrityErrorKind::PrevHashMismatch,
                    "seq 1 must link to GENESIS",
                ));
            }
            prev = Some(commit);
        }
        if let (Some(last), Some(head)) = (bundle.commits.last(), &bundle.head) {
            if head.seq != last.seq || head.commit_hash != last.commit_hash {
                return Err(integrity(
                    &bundle.packet_id,
                    IntegrityErrorKind::HeadDrift,
                    "bundled HEAD does not match last commit",
                ));
            }
            let state_hash = hash::hash_value(&bundle.runtime_state)?;
            if state_hash != head.post_state_hash {
                return Err(integrity(
                    &bundle.packet_id,
                    IntegrityErrorKind::RuntimeBindingMismatch,
                    "bundled runtime state does not hash to HEAD post_state_hash",
                ));
            }
        }
        Ok(())
    }

    /// Loads and verifies a proof bundle file.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing file, `IntegrityFailure` on any
    /// failed check.
    pub fn verify_proof_file(path: &Path) -> Result<ProofBundle> {
        let bundle: ProofBundle = store::read_json(path, "proof bundle")?;
        Self::verify_proof(&bundle)?;
        Ok(bundle)
    }
}

fn integrity(
    packet_id: &str,
    kind: IntegrityErrorKind,
    message: impl Into<String>,
) -> GovernanceError {
    GovernanceError::IntegrityFailure {
        kind,
        packet_id: Some(packet_id.to_string()),
        message: message.into(),
    }
}

/// Converts a report's first issue into a strict error.
///
/// # Errors
///
/// Returns `IntegrityFailure` when the report carries any issue.
pub fn require_clean(report: &VerifyReport) -> Result<()> {
    match report.issues.first() {
        None => Ok(()),
        Some(issue) => Err(GovernanceError::IntegrityFailure {
            kind: IntegrityErrorKind::HeadDrift,
            packet_id: issue.packet_id.clone(),
            message: format!("{} ({})", issue.message, issue.code),
        }),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::definition::{DefinitionDocument, DefinitionMetadata, PacketDefinition, WorkArea};
    use crate::payloads::ResidualRiskAck;

    fn packet_def(id: &str) -> PacketDefinition {
        PacketDefinition {
            id: id.to_string(),
            wbs_ref: format!("1.{id}"),
            area_id: "1.0".to_string(),
            title: format!("Packet {id}"),
            scope: String::new(),
            preconditions: Vec::new(),
            required_actions: Vec::new(),
            required_outputs: Vec::new(),
            validation_checks: Vec::new(),
            exit_criteria: Vec::new(),
            halt_conditions: Vec::new(),
            dependencies: Vec::new(),
            preflight_required: false,
            review_required: false,
            heartbeat_required: false,
            heartbeat_interval_seconds: None,
            context_manifest: Vec::new(),
            template_ref: None,
            ontology_required: false,
        }
    }

    fn seeded_engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().expect("tempdir");
        let doc = DefinitionDocument {
            schema_version: "1.0".to_string(),
            metadata: DefinitionMetadata::default(),
            work_areas: vec![WorkArea {
                id: "1.0".to_string(),
                title: "Area".to_string(),
                description: String::new(),
            }],
            packets: vec![packet_def("A"), packet_def("B")],
        };
        let def_path = dir.path().join("def.json");
        store::atomic_write_json(&def_path, &doc).unwrap();
        let engine = Engine::init(EngineConfig::new(dir.path()), &def_path).unwrap();
        engine.claim("A", "alice", &[]).unwrap();
        engine
            .done("A", "alice", "impl+tests", ResidualRiskAck::None)
            .unwrap();
        (dir, engine)
    }

    #[test]
    fn test_clean_chain_verifies() {
        let (_dir, engine) = seeded_engine();
        let report = Verifier::new(&engine).verify_packet("A").unwrap();
        assert!(report.ok(), "issues: {:?}", report.issues);
        assert_eq!(report.commit_count, 2);
    }

    #[test]
    fn test_verify_all_reports_counts() {
        let (_dir, engine) = seeded_engine();
        engine.claim("B", "bob", &[]).unwrap();
        let report = Verifier::new(&engine).verify_all().unwrap();
        assert!(report.ok);
        assert_eq!(report.packet_count, 2);
        assert_eq!(report.commit_count, 3);
    }

    #[test]
    fn test_tampered_commit_detected() {
        let (dir, engine) = seeded_engine();
        let path = dir
            .path()
            .join("dcl/packets/A/commits/000002.json");
        let mut commit: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        commit["post_state_hash"] = json!("0000");
        std::fs::write(&path, serde_json::to_string_pretty(&commit).unwrap()).unwrap();

        let report = Verifier::new(&engine).verify_packet("A").unwrap();
        assert!(!report.ok());
        assert!(report
            .issues
            .iter()
            .any(|i| i.code == "commit_hash_mismatch"));
    }

    #[test]
    fn test_deleted_commit_detected() {
        let (dir, engine) = seeded_engine();
        engine.note("A", "alice", "extra").unwrap_err(); // terminal, no third commit
        std::fs::remove_file(dir.path().join("dcl/packets/A/commits/000001.json")).unwrap();

        let report = Verifier::new(&engine).verify_packet("A").unwrap();
        assert!(report
            .issues
            .iter()
            .any(|i| i.code == "seq_discontinuity"));
    }

    #[test]
    fn test_head_drift_detected() {
        let (dir, engine) = seeded_engine();
        let head_path = dir.path().join("dcl/packets/A/HEAD");
        let mut head: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&head_path).unwrap()).unwrap();
        head["seq"] = json!(1);
        std::fs::write(&head_path, serde_json::to_string_pretty(&head).unwrap()).unwrap();

        let report = Verifier::new(&engine).verify_packet("A").unwrap();
        assert!(report.issues.iter().any(|i| i.code == "head_drift"));
    }

    #[test]
    fn test_runtime_binding_mismatch_detected() {
        let (_dir, engine) = seeded_engine();
        {
            let store = engine.state_store();
            let mut doc = store.load().unwrap();
            doc.packet_mut("A").notes = Some("edited outside the engine".to_string());
            store.save(&mut doc).unwrap();
        }
        let report = Verifier::new(&engine).verify_packet("A").unwrap();
        assert!(report
            .issues
            .iter()
            .any(|i| i.code == "runtime_binding_mismatch"));
    }

    #[test]
    fn test_checkpoint_verified_in_verify_all() {
        let (_dir, engine) = seeded_engine();
        engine.snapshot_heads().unwrap();
        let report = Verifier::new(&engine).verify_all().unwrap();
        assert!(report.ok);
        assert_eq!(report.checkpoint_count, 1);
    }

    #[test]
    fn test_proof_bundle_round_trip() {
        let (dir, engine) = seeded_engine();
        let out = dir.path().join("proof-A.json");
        let verifier = Verifier::new(&engine);
        let bundle = verifier.export_proof("A", &out).unwrap();
        assert_eq!(bundle.commits.len(), 2);

        let loaded = Verifier::verify_proof_file(&out).unwrap();
        assert_eq!(loaded.manifest_hash, bundle.manifest_hash);
    }

    #[test]
    fn test_tampered_proof_rejected() {
        let (dir, engine) = seeded_engine();
        let out = dir.path().join("proof-A.json");
        Verifier::new(&engine).export_proof("A", &out).unwrap();

        let mut bundle: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        bundle["runtime_state"]["notes"] = json!("forged");
        std::fs::write(&out, serde_json::to_string_pretty(&bundle).unwrap()).unwrap();

        assert!(matches!(
            Verifier::verify_proof_file(&out),
            Err(GovernanceError::IntegrityFailure { .. })
        ));
    }
}
