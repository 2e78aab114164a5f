//! Deterministic commitment layer: per-packet hash-linked commit chains.
//!
//! Layout under the governance root:
//!
//! ```text
//! dcl/
//!   dcl-config.json
//!   packets/<packet_id>/
//!     HEAD
//!     journal.json            # transient
//!     commits/000001.json ... NNNNNN.json
//!   project-checkpoints/<seq>.json
//! ```
//!
//! # Write protocol (under the per-packet lock)
//!
//! 1. Read `HEAD` (or GENESIS if absent); compute the next `seq`.
//! 2. Write `journal.json` with `{phase: prepare, target_seq, payload_hash}`.
//! 3. Write `commits/<seq>.json` atomically.
//! 4. Update `HEAD` atomically.
//! 5. Set the journal phase to `done`, then unlink it.
//!
//! Recovery classifies a leftover journal deterministically: a `prepare`
//! journal without its commit file rolls back; a `prepare` journal whose
//! commit landed completes the HEAD advance; a `done` journal is unlinked.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{GovernanceError, IntegrityErrorKind, Result};
use crate::hash;
use crate::store::{self, DirLock};
use crate::time;

/// Sentinel previous-hash for the first commit of a chain.
pub const GENESIS: &str = "GENESIS";

/// DCL protocol version recorded in the dcl-config lock.
pub const DCL_VERSION: &str = "1.0";

/// Delay before the single retry when a read observes a transient journal.
const JOURNAL_READ_RETRY: Duration = Duration::from_millis(50);

/// The identity that triggered a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionActor {
    /// Actor kind; the engine always records `agent`.
    pub kind: String,
    /// Actor identity.
    pub id: String,
}

/// The original action record bound into each commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    /// Record type; always `transition`.
    #[serde(rename = "type")]
    pub record_type: String,
    /// The transition name (log event string).
    pub name: String,
    /// Who triggered it.
    pub actor: ActionActor,
    /// Free-form reason.
    pub reason: String,
    /// Operation inputs.
    pub inputs: Value,
    /// When the action was taken.
    pub timestamp: String,
}

impl ActionEnvelope {
    /// Builds an envelope for a transition.
    #[must_use]
    pub fn new(name: &str, actor: &str, inputs: Value, reason: &str) -> Self {
        Self {
            record_type: "transition".to_string(),
            name: name.to_string(),
            actor: ActionActor {
                kind: "agent".to_string(),
                id: if actor.is_empty() {
                    "system".to_string()
                } else {
                    actor.to_string()
                },
            },
            reason: reason.to_string(),
            inputs,
            timestamp: time::now_utc_string(),
        }
    }
}

/// A shallow top-level delta between two runtime-state views.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDiff {
    /// Keys present in both with differing values: key -> `{from, to}`.
    pub changed: Map<String, Value>,
    /// Keys only in the post-state.
    pub added: Map<String, Value>,
    /// Keys only in the pre-state.
    pub removed: Map<String, Value>,
}

impl StateDiff {
    /// Computes the diff between two object values.
    #[must_use]
    pub fn build(before: &Value, after: &Value) -> Self {
        let empty = Map::new();
        let before = before.as_object().unwrap_or(&empty);
        let after = after.as_object().unwrap_or(&empty);

        let mut diff = Self::default();
        let mut keys: Vec<&String> = before.keys().chain(after.keys()).collect();
        keys.sort();
        keys.dedup();

        for key in keys {
            match (before.get(key), after.get(key)) {
                (None, Some(new)) => {
                    diff.added.insert(key.clone(), new.clone());
                },
                (Some(old), None) => {
                    diff.removed.insert(key.clone(), old.clone());
                },
                (Some(old), Some(new)) if old != new => {
                    diff.changed.insert(
                        key.clone(),
                        serde_json::json!({"from": old, "to": new}),
                    );
                },
                _ => {},
            }
        }
        diff
    }

    /// Applies the diff to a pre-state view, producing the post-state view.
    ///
    /// Used by doctor recovery to replay a committed-but-unapplied state
    /// write.
    #[must_use]
    pub fn apply(&self, base: &Value) -> Value {
        let mut map = base.as_object().cloned().unwrap_or_default();
        for key in self.removed.keys() {
            map.remove(key);
        }
        for (key, value) in &self.added {
            map.insert(key.clone(), value.clone());
        }
        for (key, change) in &self.changed {
            if let Some(to) = change.get("to") {
                map.insert(key.clone(), to.clone());
            }
        }
        Value::Object(map)
    }

    /// True when the diff records no change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }
}

/// One immutable hash-linked commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DclCommit {
    /// Display id (`CMT-<packet>-<seq>`).
    pub commit_id: String,
    /// The packet this commit belongs to.
    pub packet_id: String,
    /// Dense 1-based sequence number within the packet's chain.
    pub seq: u64,
    /// Hash of the previous commit, or [`GENESIS`] for seq 1.
    pub prev_commit_hash: String,
    /// Hash of the canonical action envelope.
    pub action_hash: String,
    /// Hash of the canonical pre-state view.
    pub pre_state_hash: String,
    /// Hash of the canonical post-state view.
    pub post_state_hash: String,
    /// Hash of the constitution document at transition time.
    pub constitution_hash: String,
    /// Structured top-level delta.
    pub diff: StateDiff,
    /// When the commit was created.
    pub created_at: String,
    /// The original action record.
    pub action_envelope: ActionEnvelope,
    /// Hash of the canonical commit minus this field.
    pub commit_hash: String,
}

impl DclCommit {
    /// Recomputes this commit's hash from its contents.
    ///
    /// # Errors
    ///
    /// Returns `SchemaInvalid`/`Canonical` on serialization failure.
    pub fn compute_hash(&self) -> Result<String> {
        let mut value =
            serde_json::to_value(self).map_err(|e| GovernanceError::SchemaInvalid {
                message: format!("cannot serialize commit: {e}"),
            })?;
        if let Value::Object(map) = &mut value {
            map.remove("commit_hash");
        }
        Ok(hash::hash_value(&value)?)
    }
}

/// The per-packet latest-commit pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
    /// Sequence number of the latest commit.
    pub seq: u64,
    /// Hash of the latest commit.
    pub commit_hash: String,
    /// Post-state hash of the latest commit.
    pub post_state_hash: String,
}

/// Journal phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalPhase {
    /// The commit write is in flight.
    Prepare,
    /// The commit and HEAD both landed.
    Done,
}

/// The transient per-packet crash-recovery journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Journal {
    /// Current phase.
    pub phase: JournalPhase,
    /// The sequence number being written.
    pub target_seq: u64,
    /// The commit hash of the in-flight commit.
    pub payload_hash: String,
}

/// What journal recovery did.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RecoveryAction {
    /// No journal was present.
    None,
    /// A prepare journal without its commit was rolled back.
    RolledBack {
        /// The abandoned sequence number.
        target_seq: u64,
    },
    /// A prepare journal with a landed commit had its HEAD advance
    /// completed.
    Completed {
        /// The completed sequence number.
        target_seq: u64,
    },
    /// A done journal was cleared.
    Cleared,
}

/// A snapshot of every packet HEAD at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectCheckpoint {
    /// Display id (`CHK-<seq>`).
    pub checkpoint_id: String,
    /// When the checkpoint was taken.
    pub created_at: String,
    /// packet id -> HEAD.
    pub head_table: BTreeMap<String, Head>,
    /// Hash of the canonical checkpoint minus this field.
    pub checkpoint_hash: String,
}

impl ProjectCheckpoint {
    /// Recomputes this checkpoint's hash from its contents.
    ///
    /// # Errors
    ///
    /// Returns `SchemaInvalid`/`Canonical` on serialization failure.
    pub fn compute_hash(&self) -> Result<String> {
        let mut value =
            serde_json::to_value(self).map_err(|e| GovernanceError::SchemaInvalid {
                message: format!("cannot serialize checkpoint: {e}"),
            })?;
        if let Value::Object(map) = &mut value {
            map.remove("checkpoint_hash");
        }
        Ok(hash::hash_value(&value)?)
    }
}

/// Filesystem-backed per-packet commit chains.
#[derive(Debug, Clone)]
pub struct CommitStore {
    dcl_root: PathBuf,
}

impl CommitStore {
    /// Creates a store rooted at `<root>/dcl`.
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            dcl_root: root.join("dcl"),
        }
    }

    /// The `dcl/` directory.
    #[must_use]
    pub fn dcl_root(&self) -> &Path {
        &self.dcl_root
    }

    fn packets_dir(&self) -> PathBuf {
        self.dcl_root.join("packets")
    }

    fn packet_dir(&self, packet_id: &str) -> PathBuf {
        self.packets_dir().join(packet_id)
    }

    fn commits_dir(&self, packet_id: &str) -> PathBuf {
        self.packet_dir(packet_id).join("commits")
    }

    fn head_path(&self, packet_id: &str) -> PathBuf {
        self.packet_dir(packet_id).join("HEAD")
    }

    fn journal_path(&self, packet_id: &str) -> PathBuf {
        self.packet_dir(packet_id).join("journal.json")
    }

    fn commit_path(&self, packet_id: &str, seq: u64) -> PathBuf {
        self.commits_dir(packet_id).join(format!("{seq:06}.json"))
    }

    fn checkpoints_dir(&self) -> PathBuf {
        self.dcl_root.join("project-checkpoints")
    }

    /// Acquires the per-packet mutation lock.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrencyConflict` when the retry budget is exhausted.
    pub fn lock_packet(&self, packet_id: &str) -> Result<DirLock> {
        DirLock::acquire(&self.packet_dir(packet_id).join(".lock"))
    }

    /// Reads a packet's HEAD, if the chain exists.
    ///
    /// # Errors
    ///
    /// Returns `Io`/`SchemaInvalid` on a present-but-unreadable file.
    pub fn head(&self, packet_id: &str) -> Result<Option<Head>> {
        store::read_json_opt(&self.head_path(packet_id))
    }

    /// Reads a packet's journal, if present.
    ///
    /// # Errors
    ///
    /// Returns `IntegrityFailure{JournalCorrupt}` on an unreadable journal.
    pub fn journal(&self, packet_id: &str) -> Result<Option<Journal>> {
        store::read_json_opt(&self.journal_path(packet_id)).map_err(|e| match e {
            GovernanceError::SchemaInvalid { message } => GovernanceError::IntegrityFailure {
                kind: IntegrityErrorKind::JournalCorrupt,
                packet_id: Some(packet_id.to_string()),
                message,
            },
            other => other,
        })
    }

    /// Packet ids that have a commit chain on disk, sorted.
    ///
    /// # Errors
    ///
    /// Returns `Io` on directory enumeration failure.
    pub fn packet_ids(&self) -> Result<Vec<String>> {
        let dir = self.packets_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(GovernanceError::io(dir.display().to_string(), false, e)),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| GovernanceError::io(dir.display().to_string(), false, e))?;
            if entry.path().is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Appends a commit to a packet's chain. The caller must hold the
    /// packet lock; recovery runs first so the write never builds on a
    /// half-applied predecessor.
    ///
    /// # Errors
    ///
    /// Returns `Io` on write failure, `IntegrityFailure` when recovery
    /// finds corruption.
    pub fn append(
        &self,
        packet_id: &str,
        envelope: ActionEnvelope,
        pre_state: &Value,
        post_state: &Value,
        constitution_hash: &str,
    ) -> Result<DclCommit> {
        self.recover(packet_id)?;

        let head = self.head(packet_id)?;
        let seq = head.as_ref().map_or(1, |h| h.seq + 1);
        let prev_commit_hash = head
            .map(|h| h.commit_hash)
            .unwrap_or_else(|| GENESIS.to_string());

        let action_hash = hash::hash_serializable(&envelope)?;
        let pre_state_hash = hash::hash_value(pre_state)?;
        let post_state_hash = hash::hash_value(post_state)?;
        let diff = StateDiff::build(pre_state, post_state);

        let mut commit = DclCommit {
            commit_id: format!("CMT-{packet_id}-{seq:06}"),
            packet_id: packet_id.to_string(),
            seq,
            prev_commit_hash,
            action_hash,
            pre_state_hash,
            post_state_hash,
            constitution_hash: constitution_hash.to_string(),
            diff,
            created_at: time::now_utc_string(),
            action_envelope: envelope,
            commit_hash: String::new(),
        };
        commit.commit_hash = commit.compute_hash()?;

        // Step 2: journal the intent.
        let journal_path = self.journal_path(packet_id);
        store::atomic_write_json(
            &journal_path,
            &Journal {
                phase: JournalPhase::Prepare,
                target_seq: seq,
                payload_hash: commit.commit_hash.clone(),
            },
        )?;

        // Step 3: the commit file.
        store::atomic_write_json(&self.commit_path(packet_id, seq), &commit)?;

        // Step 4: advance HEAD.
        store::atomic_write_json(
            &self.head_path(packet_id),
            &Head {
                seq,
                commit_hash: commit.commit_hash.clone(),
                post_state_hash: commit.post_state_hash.clone(),
            },
        )?;

        // Step 5: mark done, then clear.
        store::atomic_write_json(
            &journal_path,
            &Journal {
                phase: JournalPhase::Done,
                target_seq: seq,
                payload_hash: commit.commit_hash.clone(),
            },
        )?;
        remove_file_if_present(&journal_path)?;

        tracing::debug!(packet_id, seq, commit_hash = %commit.commit_hash, "commit appended");
        Ok(commit)
    }

    /// Runs journal recovery for one packet. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `IntegrityFailure{JournalCorrupt}` on an unreadable journal,
    /// `Io` on filesystem failure.
    pub fn recover(&self, packet_id: &str) -> Result<RecoveryAction> {
        let Some(journal) = self.journal(packet_id)? else {
            return Ok(RecoveryAction::None);
        };
        let journal_path = self.journal_path(packet_id);

        match journal.phase {
            JournalPhase::Done => {
                remove_file_if_present(&journal_path)?;
                tracing::info!(packet_id, "cleared done-phase journal");
                Ok(RecoveryAction::Cleared)
            },
            JournalPhase::Prepare => {
                let commit_path = self.commit_path(packet_id, journal.target_seq);
                let commit: Option<DclCommit> = store::read_json_opt(&commit_path).ok().flatten();
                let commit_is_valid = commit.as_ref().is_some_and(|c| {
                    c.seq == journal.target_seq
                        && c.commit_hash == journal.payload_hash
                        && c.compute_hash().is_ok_and(|h| h == c.commit_hash)
                });

                if let Some(commit) = commit.filter(|_| commit_is_valid) {
                    let head = self.head(packet_id)?;
                    let head_behind = head.as_ref().is_none_or(|h| h.seq < journal.target_seq);
                    if head_behind {
                        store::atomic_write_json(
                            &self.head_path(packet_id),
                            &Head {
                                seq: commit.seq,
                                commit_hash: commit.commit_hash.clone(),
                                post_state_hash: commit.post_state_hash.clone(),
                            },
                        )?;
                        tracing::info!(
                            packet_id,
                            seq = journal.target_seq,
                            "completed interrupted HEAD advance"
                        );
                    }
                    remove_file_if_present(&journal_path)?;
                    Ok(RecoveryAction::Completed {
                        target_seq: journal.target_seq,
                    })
                } else {
                    // Partial write: drop any invalid commit artifact, keep
                    // HEAD where it was.
                    remove_file_if_present(&commit_path)?;
                    remove_file_if_present(&journal_path)?;
                    tracing::warn!(
                        packet_id,
                        seq = journal.target_seq,
                        "rolled back interrupted commit"
                    );
                    Ok(RecoveryAction::RolledBack {
                        target_seq: journal.target_seq,
                    })
                }
            },
        }
    }

    /// Runs journal recovery for every packet with a chain.
    ///
    /// # Errors
    ///
    /// Propagates the first recovery failure.
    pub fn recover_all(&self) -> Result<Vec<(String, RecoveryAction)>> {
        let mut actions = Vec::new();
        for packet_id in self.packet_ids()? {
            let _lock = self.lock_packet(&packet_id)?;
            let action = self.recover(&packet_id)?;
            if action != RecoveryAction::None {
                actions.push((packet_id, action));
            }
        }
        Ok(actions)
    }

    /// Reads a packet's commits ordered by sequence number.
    ///
    /// Lock-free; a transiently present journal is treated as in-progress
    /// and the read retries once.
    ///
    /// # Errors
    ///
    /// Returns `Io`/`SchemaInvalid` on unreadable commits.
    pub fn commits(&self, packet_id: &str) -> Result<Vec<DclCommit>> {
        if self.journal_path(packet_id).exists() {
            std::thread::sleep(JOURNAL_READ_RETRY);
        }
        let dir = self.commits_dir(packet_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(GovernanceError::io(dir.display().to_string(), false, e)),
        };
        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| GovernanceError::io(dir.display().to_string(), false, e))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        let mut commits = Vec::with_capacity(paths.len());
        for path in paths {
            commits.push(store::read_json(&path, "commit")?);
        }
        Ok(commits)
    }

    /// Reads one commit by sequence number.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when absent.
    pub fn commit(&self, packet_id: &str, seq: u64) -> Result<DclCommit> {
        store::read_json(&self.commit_path(packet_id, seq), "commit")
    }

    /// The number of commits in a packet's chain.
    ///
    /// # Errors
    ///
    /// Returns `Io` on enumeration failure.
    pub fn commit_count(&self, packet_id: &str) -> Result<u64> {
        Ok(self.commits(packet_id)?.len() as u64)
    }

    /// Writes a new project checkpoint over the given HEAD table.
    ///
    /// # Errors
    ///
    /// Returns `Io` on persistence failure.
    pub fn write_checkpoint(
        &self,
        head_table: BTreeMap<String, Head>,
    ) -> Result<ProjectCheckpoint> {
        let dir = self.checkpoints_dir();
        let seq = self.checkpoint_count()? + 1;
        let mut checkpoint = ProjectCheckpoint {
            checkpoint_id: format!("CHK-{seq:06}"),
            created_at: time::now_utc_string(),
            head_table,
            checkpoint_hash: String::new(),
        };
        checkpoint.checkpoint_hash = checkpoint.compute_hash()?;
        store::atomic_write_json(&dir.join(format!("{seq:06}.json")), &checkpoint)?;
        tracing::info!(checkpoint_id = %checkpoint.checkpoint_id, "project checkpoint written");
        Ok(checkpoint)
    }

    /// The number of checkpoints on disk.
    ///
    /// # Errors
    ///
    /// Returns `Io` on enumeration failure.
    pub fn checkpoint_count(&self) -> Result<u64> {
        Ok(self.checkpoint_paths()?.len() as u64)
    }

    /// The latest checkpoint, if any.
    ///
    /// # Errors
    ///
    /// Returns `Io`/`SchemaInvalid` on unreadable checkpoints.
    pub fn latest_checkpoint(&self) -> Result<Option<ProjectCheckpoint>> {
        let paths = self.checkpoint_paths()?;
        match paths.last() {
            Some(path) => Ok(Some(store::read_json(path, "checkpoint")?)),
            None => Ok(None),
        }
    }

    fn checkpoint_paths(&self) -> Result<Vec<PathBuf>> {
        let dir = self.checkpoints_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(GovernanceError::io(dir.display().to_string(), false, e)),
        };
        let mut paths = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| GovernanceError::io(dir.display().to_string(), false, e))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn remove_file_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GovernanceError::io(path.display().to_string(), false, e)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn append_two(store: &CommitStore) {
        store
            .append(
                "PKT-1",
                ActionEnvelope::new("claimed", "alice", json!({}), ""),
                &json!({"status": "pending"}),
                &json!({"status": "in_progress", "assigned_to": "alice"}),
                "const-hash",
            )
            .unwrap();
        store
            .append(
                "PKT-1",
                ActionEnvelope::new("completed", "alice", json!({}), ""),
                &json!({"status": "in_progress", "assigned_to": "alice"}),
                &json!({"status": "done", "assigned_to": "alice"}),
                "const-hash",
            )
            .unwrap();
    }

    #[test]
    fn test_chain_links_and_head() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CommitStore::new(dir.path());
        append_two(&store);

        let commits = store.commits("PKT-1").unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].seq, 1);
        assert_eq!(commits[0].prev_commit_hash, GENESIS);
        assert_eq!(commits[1].prev_commit_hash, commits[0].commit_hash);
        assert_eq!(commits[1].pre_state_hash, commits[0].post_state_hash);

        let head = store.head("PKT-1").unwrap().unwrap();
        assert_eq!(head.seq, 2);
        assert_eq!(head.commit_hash, commits[1].commit_hash);
        assert_eq!(head.post_state_hash, commits[1].post_state_hash);
        assert!(store.journal("PKT-1").unwrap().is_none());
    }

    #[test]
    fn test_commit_hash_recomputes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CommitStore::new(dir.path());
        append_two(&store);
        for commit in store.commits("PKT-1").unwrap() {
            assert_eq!(commit.compute_hash().unwrap(), commit.commit_hash);
        }
    }

    #[test]
    fn test_diff_build_and_apply() {
        let before = json!({"status": "pending", "notes": "x", "stale": 1});
        let after = json!({"status": "in_progress", "notes": "x", "assigned_to": "alice"});
        let diff = StateDiff::build(&before, &after);

        assert!(diff.changed.contains_key("status"));
        assert!(diff.added.contains_key("assigned_to"));
        assert!(diff.removed.contains_key("stale"));
        assert!(!diff.changed.contains_key("notes"));

        assert_eq!(diff.apply(&before), after);
    }

    #[test]
    fn test_recovery_rollback_without_commit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CommitStore::new(dir.path());
        append_two(&store);

        // Simulate a crash after journaling but before the commit landed.
        store::atomic_write_json(
            &store.journal_path("PKT-1"),
            &Journal {
                phase: JournalPhase::Prepare,
                target_seq: 3,
                payload_hash: "deadbeef".to_string(),
            },
        )
        .unwrap();

        let action = store.recover("PKT-1").unwrap();
        assert_eq!(action, RecoveryAction::RolledBack { target_seq: 3 });
        assert_eq!(store.head("PKT-1").unwrap().unwrap().seq, 2);
        assert!(store.journal("PKT-1").unwrap().is_none());
    }

    #[test]
    fn test_recovery_completes_head_advance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CommitStore::new(dir.path());
        append_two(&store);

        // Simulate a crash after the commit file landed but before HEAD
        // advanced: rewind HEAD and leave a prepare journal behind.
        let commits = store.commits("PKT-1").unwrap();
        let first = &commits[0];
        let second = &commits[1];
        store::atomic_write_json(
            &store.head_path("PKT-1"),
            &Head {
                seq: 1,
                commit_hash: first.commit_hash.clone(),
                post_state_hash: first.post_state_hash.clone(),
            },
        )
        .unwrap();
        store::atomic_write_json(
            &store.journal_path("PKT-1"),
            &Journal {
                phase: JournalPhase::Prepare,
                target_seq: 2,
                payload_hash: second.commit_hash.clone(),
            },
        )
        .unwrap();

        let action = store.recover("PKT-1").unwrap();
        assert_eq!(action, RecoveryAction::Completed { target_seq: 2 });
        let head = store.head("PKT-1").unwrap().unwrap();
        assert_eq!(head.seq, 2);
        assert_eq!(head.commit_hash, second.commit_hash);
        assert!(store.journal("PKT-1").unwrap().is_none());
    }

    #[test]
    fn test_recovery_clears_done_journal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CommitStore::new(dir.path());
        append_two(&store);

        store::atomic_write_json(
            &store.journal_path("PKT-1"),
            &Journal {
                phase: JournalPhase::Done,
                target_seq: 2,
                payload_hash: "irrelevant".to_string(),
            },
        )
        .unwrap();

        assert_eq!(store.recover("PKT-1").unwrap(), RecoveryAction::Cleared);
        assert!(store.journal("PKT-1").unwrap().is_none());
        assert_eq!(store.head("PKT-1").unwrap().unwrap().seq, 2);
    }

    #[test]
    fn test_recovery_noop_without_journal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CommitStore::new(dir.path());
        append_two(&store);
        assert_eq!(store.recover("PKT-1").unwrap(), RecoveryAction::None);
    }

    #[test]
    fn test_append_after_rollback_reuses_seq() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CommitStore::new(dir.path());
        append_two(&store);

        store::atomic_write_json(
            &store.journal_path("PKT-1"),
            &Journal {
                phase: JournalPhase::Prepare,
                target_seq: 3,
                payload_hash: "deadbeef".to_string(),
            },
        )
        .unwrap();

        let commit = store
            .append(
                "PKT-1",
                ActionEnvelope::new("noted", "alice", json!({}), ""),
                &json!({"status": "done"}),
                &json!({"status": "done", "notes": "wrap-up"}),
                "const-hash",
            )
            .unwrap();
        assert_eq!(commit.seq, 3);
        assert_eq!(store.commits("PKT-1").unwrap().len(), 3);
    }

    #[test]
    fn test_checkpoints_are_sequential() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CommitStore::new(dir.path());
        append_two(&store);

        let head = store.head("PKT-1").unwrap().unwrap();
        let mut table = BTreeMap::new();
        table.insert("PKT-1".to_string(), head);

        let first = store.write_checkpoint(table.clone()).unwrap();
        let second = store.write_checkpoint(table).unwrap();
        assert_eq!(first.checkpoint_id, "CHK-000001");
        assert_eq!(second.checkpoint_id, "CHK-000002");
        assert_eq!(store.checkpoint_count().unwrap(), 2);

        let latest = store.latest_checkpoint().unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, "CHK-000002");
        assert_eq!(latest.compute_hash().unwrap(), latest.checkpoint_hash);
    }

    #[test]
    fn test_packet_ids_listed_sorted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CommitStore::new(dir.path());
        for packet_id in ["B", "A"] {
            store
                .append(
                    packet_id,
                    ActionEnvelope::new("claimed", "alice", json!({}), ""),
                    &json!({"status": "pending"}),
                    &json!({"status": "in_progress"}),
                    "",
                )
                .unwrap();
        }
        assert_eq!(store.packet_ids().unwrap(), ["A", "B"]);
    }
}
