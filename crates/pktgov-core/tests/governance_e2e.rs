//! End-to-end lifecycle scenarios exercised through the public engine,
//! verifier, and doctor surfaces.

mod common;

use common::{heartbeat_payload, init_engine, packet, preflight_assessment, review_assessment};
use pktgov_core::doctor::{self, DoctorMode};
use pktgov_core::error::{GovernanceError, TransitionErrorKind};
use pktgov_core::payloads::{ResidualRiskAck, ReviewVerdict};
use pktgov_core::state::PacketStatus;
use pktgov_core::verify::Verifier;

#[test]
fn happy_path_without_preflight_or_review() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = init_engine(
        dir.path(),
        vec![packet("A", "1.1", &[]), packet("B", "1.2", &["A"])],
    );

    engine.claim("A", "alice", &[]).unwrap();
    assert_eq!(engine.packet_state("A").unwrap().status, PacketStatus::InProgress);
    assert_eq!(engine.commit_store().commit_count("A").unwrap(), 1);

    engine
        .done("A", "alice", "impl+tests", ResidualRiskAck::None)
        .unwrap();
    assert_eq!(engine.packet_state("A").unwrap().status, PacketStatus::Done);

    let ready: Vec<String> = engine.ready().unwrap().into_iter().map(|r| r.id).collect();
    assert_eq!(ready, ["B"]);

    engine.claim("B", "bob", &[]).unwrap();
    engine.done("B", "bob", "impl", ResidualRiskAck::None).unwrap();

    let report = Verifier::new(&engine).verify_all().unwrap();
    assert!(report.ok, "issues: {:?}", report.issues);
    assert_eq!(engine.commit_store().commit_count("A").unwrap(), 2);
    assert_eq!(engine.commit_store().commit_count("B").unwrap(), 2);
}

#[test]
fn preflight_and_review_cycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut c = packet("C", "1.1", &[]);
    c.preflight_required = true;
    c.review_required = true;
    let engine = init_engine(dir.path(), vec![c]);

    engine.claim("C", "alice", &[]).unwrap();
    assert_eq!(engine.packet_state("C").unwrap().status, PacketStatus::Preflight);

    engine
        .preflight("C", "alice", preflight_assessment())
        .unwrap();
    engine.preflight_decide("C", "sam", true, "").unwrap();
    assert_eq!(engine.packet_state("C").unwrap().status, PacketStatus::InProgress);

    engine.done("C", "alice", "done", ResidualRiskAck::None).unwrap();
    assert_eq!(engine.packet_state("C").unwrap().status, PacketStatus::Review);

    engine.review_claim("C", "bob").unwrap();
    engine
        .review_submit("C", "bob", ReviewVerdict::Reject, review_assessment("fail"))
        .unwrap();
    let state = engine.packet_state("C").unwrap();
    assert_eq!(state.status, PacketStatus::InProgress);
    assert_eq!(state.review.unwrap().cycle_count, 1);

    engine.done("C", "alice", "fixed", ResidualRiskAck::None).unwrap();
    engine.review_claim("C", "bob").unwrap();
    engine
        .review_submit("C", "bob", ReviewVerdict::Approve, review_assessment("pass"))
        .unwrap();
    assert_eq!(engine.packet_state("C").unwrap().status, PacketStatus::Done);

    let report = Verifier::new(&engine).verify_packet("C").unwrap();
    assert!(report.ok(), "issues: {:?}", report.issues);
}

#[test]
fn dependency_failure_propagation_and_reset() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = init_engine(
        dir.path(),
        vec![
            packet("X", "1.1", &[]),
            packet("Y", "1.2", &["X"]),
            packet("Z", "1.3", &["Y"]),
        ],
    );

    engine.claim("X", "alice", &[]).unwrap();
    engine.fail("X", "alice", "cannot", false).unwrap();

    assert_eq!(engine.packet_state("Y").unwrap().status, PacketStatus::Blocked);
    assert_eq!(engine.packet_state("Z").unwrap().status, PacketStatus::Blocked);

    engine.reset("X", "sam").unwrap();
    assert_eq!(engine.packet_state("X").unwrap().status, PacketStatus::Pending);
    assert_eq!(engine.packet_state("Y").unwrap().status, PacketStatus::Pending);
    assert_eq!(engine.packet_state("Z").unwrap().status, PacketStatus::Pending);

    // Every propagated transition is commit-bearing and the chains verify.
    let report = Verifier::new(&engine).verify_all().unwrap();
    assert!(report.ok, "issues: {:?}", report.issues);
}

#[test]
fn identity_separation_enforced_without_side_effects() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut p = packet("P", "1.1", &[]);
    p.review_required = true;
    let engine = init_engine(dir.path(), vec![p]);

    engine.claim("P", "alice", &[]).unwrap();
    engine.done("P", "alice", "evidence", ResidualRiskAck::None).unwrap();
    let commits_before = engine.commit_store().commit_count("P").unwrap();
    let state_before = engine.packet_state("P").unwrap();

    let err = engine.review_claim("P", "alice").unwrap_err();
    assert!(matches!(
        err,
        GovernanceError::InvalidTransition {
            kind: TransitionErrorKind::IdentityConflict,
            ..
        }
    ));

    // Rejection left state and chain byte-identical.
    assert_eq!(engine.packet_state("P").unwrap(), state_before);
    assert_eq!(engine.commit_store().commit_count("P").unwrap(), commits_before);
}

#[test]
fn stale_work_detection_and_revival() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = init_engine(dir.path(), vec![packet("D", "1.1", &[])]);
    engine.claim("D", "alice", &[]).unwrap();

    // Backdate the anchor 2000 seconds: beyond the default 1800 s window.
    {
        let store = engine.state_store();
        let mut doc = store.load().unwrap();
        let anchor = pktgov_core::time::format_utc(
            pktgov_core::time::now_utc() - chrono::Duration::seconds(2000),
        );
        doc.packet_mut("D").last_heartbeat_at = Some(anchor);
        store.save(&mut doc).unwrap();
    }

    let swept = engine.check_stalled().unwrap();
    assert_eq!(swept.len(), 1);
    assert_eq!(engine.packet_state("D").unwrap().status, PacketStatus::Stalled);

    // Repeated sweep within the window changes nothing further.
    assert!(engine.check_stalled().unwrap().is_empty());

    let revived = engine.heartbeat("D", "alice", heartbeat_payload("80%")).unwrap();
    assert_eq!(revived.status, PacketStatus::InProgress);
    assert!(revived.commit_seq.is_some());

    let report = Verifier::new(&engine).verify_packet("D").unwrap();
    assert!(report.ok(), "issues: {:?}", report.issues);
}

#[test]
fn append_only_log_prefix_is_stable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = init_engine(dir.path(), vec![packet("A", "1.1", &[]), packet("B", "1.2", &[])]);

    engine.claim("A", "alice", &[]).unwrap();
    let log_before = engine.status_snapshot().unwrap().log;

    engine.claim("B", "bob", &[]).unwrap();
    engine.note("B", "bob", "progress").unwrap();
    let log_after = engine.status_snapshot().unwrap().log;

    assert!(log_after.len() > log_before.len());
    assert_eq!(&log_after[..log_before.len()], &log_before[..]);
}

#[test]
fn proof_export_verifies_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = init_engine(dir.path(), vec![packet("A", "1.1", &[])]);
    engine.claim("A", "alice", &[]).unwrap();
    engine.done("A", "alice", "evidence", ResidualRiskAck::None).unwrap();

    let out = dir.path().join("proof.json");
    Verifier::new(&engine).export_proof("A", &out).unwrap();
    let bundle = Verifier::verify_proof_file(&out).unwrap();
    assert_eq!(bundle.packet_id, "A");
    assert_eq!(bundle.commits.len(), 2);
}

#[test]
fn doctor_fast_and_full_agree_when_idle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = init_engine(dir.path(), vec![packet("A", "1.1", &[])]);
    engine.claim("A", "alice", &[]).unwrap();
    engine.done("A", "alice", "evidence", ResidualRiskAck::None).unwrap();
    engine.snapshot_heads().unwrap();

    let fast = doctor::run(&engine, DoctorMode::Fast).unwrap();
    let full = doctor::run(&engine, DoctorMode::Full).unwrap();
    assert!(fast.ok && full.ok);
    assert_eq!(fast.packet_count, full.packet_count);
    assert_eq!(fast.commit_count, full.commit_count);
    assert_eq!(fast.checkpoint_count, full.checkpoint_count);
    assert_eq!(fast.failures, full.failures);
}

#[test]
fn closeout_emits_checkpoint_bound_to_heads() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = init_engine(
        dir.path(),
        vec![packet("A", "1.1", &[]), packet("B", "1.2", &[])],
    );
    for (id, actor) in [("A", "alice"), ("B", "bob")] {
        engine.claim(id, actor, &[]).unwrap();
        engine.done(id, actor, "evidence", ResidualRiskAck::None).unwrap();
    }
    let assessment = dir.path().join("assessment.md");
    std::fs::write(&assessment, "scope reviewed; no drift").unwrap();

    let (closeout, checkpoint) = engine
        .closeout_l2("1.0", "sam", &assessment, Some("clean"))
        .unwrap();
    assert_eq!(closeout.checkpoint_id, checkpoint.checkpoint_id);
    for id in ["A", "B"] {
        let head = engine.commit_store().head(id).unwrap().unwrap();
        assert_eq!(checkpoint.head_table[id], head);
    }

    let report = Verifier::new(&engine).verify_all().unwrap();
    assert!(report.ok, "issues: {:?}", report.issues);
}
