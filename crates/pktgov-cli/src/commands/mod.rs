//! Command handlers: validate inputs, invoke one core operation, print a
//! structured result envelope.

use std::path::Path;
use std::process::ExitCode;

use pktgov_core::config::EngineConfig;
use pktgov_core::doctor::{self, DoctorMode};
use pktgov_core::engine::{Engine, TransitionResult};
use pktgov_core::error::{GovernanceError, IntegrityErrorKind, Result};
use pktgov_core::payloads::{
    HeartbeatPayload, PreflightAssessment, ResidualRiskAck, ResidualRiskDeclaration,
    ReviewAssessment, ReviewVerdict,
};
use pktgov_core::risk::{RiskSeverity, RiskStatus};
use pktgov_core::verify::Verifier;
use serde::Serialize;
use serde_json::{Value, json};

/// How results are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human-readable text.
    Text,
    /// One JSON envelope per invocation.
    Json,
}

/// The structured result envelope printed for every mutation.
#[derive(Debug, Serialize)]
struct Envelope {
    ok: bool,
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_snapshot: Option<Value>,
}

fn print_envelope(envelope: &Envelope, output: OutputMode) {
    match output {
        OutputMode::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(envelope).unwrap_or_else(|_| "{}".to_string())
            );
        },
        OutputMode::Text => {
            println!("{}", envelope.message);
        },
    }
}

fn print_value(value: &impl Serialize, text: &str, output: OutputMode) {
    match output {
        OutputMode::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
            );
        },
        OutputMode::Text => println!("{text}"),
    }
}

/// Prints a rejection envelope for a typed error.
pub fn print_error(err: &GovernanceError, output: OutputMode) {
    let envelope = Envelope {
        ok: false,
        code: err.code(),
        message: err.to_string(),
        state_snapshot: None,
    };
    match output {
        OutputMode::Json => print_envelope(&envelope, output),
        OutputMode::Text => eprintln!("error: {}", envelope.message),
    }
}

fn parse_json_arg(raw: &str, what: &str) -> Result<Value> {
    let body = match raw.strip_prefix('@') {
        Some(path) => {
            std::fs::read_to_string(path).map_err(|e| GovernanceError::Usage {
                message: format!("cannot read {what} file {path}: {e}"),
            })?
        },
        None => raw.to_string(),
    };
    serde_json::from_str(&body).map_err(|e| GovernanceError::Usage {
        message: format!("invalid {what} JSON: {e}"),
    })
}

fn open_engine(config: EngineConfig) -> Result<Engine> {
    let strict = config.strict;
    let engine = Engine::open(config)?;
    if strict {
        let report = doctor::run(&engine, DoctorMode::Fast)?;
        doctor::enforce_strict(&report)?;
    }
    Ok(engine)
}

/// Fail-open discipline: a mutating command refuses to run while the
/// fast doctor reports failures.
fn guard_mutation(engine: &Engine) -> Result<()> {
    let report = doctor::run(engine, DoctorMode::Fast)?;
    if report.ok {
        return Ok(());
    }
    let first = report.failures.first();
    Err(GovernanceError::IntegrityFailure {
        kind: IntegrityErrorKind::HeadDrift,
        packet_id: first.and_then(|f| f.packet_id.clone()),
        message: format!(
            "mutation refused: doctor found {} failure(s), first: {}",
            report.failures.len(),
            first.map_or_else(String::new, |f| format!("{} ({})", f.message, f.code)),
        ),
    })
}

fn transition_envelope(engine: &Engine, result: &TransitionResult) -> Envelope {
    let snapshot = engine
        .packet_state(&result.packet_id)
        .ok()
        .and_then(|state| serde_json::to_value(state).ok());
    Envelope {
        ok: true,
        code: "ok".to_string(),
        message: result.message.clone(),
        state_snapshot: snapshot,
    }
}

fn ok_exit() -> ExitCode {
    ExitCode::SUCCESS
}

pub fn init(
    config: EngineConfig,
    definition: &Path,
    output: OutputMode,
) -> Result<ExitCode> {
    if !definition.is_file() {
        return Err(GovernanceError::Usage {
            message: format!("definition document not found: {}", definition.display()),
        });
    }
    let engine = Engine::init(config, definition)?;
    let envelope = Envelope {
        ok: true,
        code: "ok".to_string(),
        message: format!(
            "initialized governance root at {} ({} packets, {} areas)",
            engine.config().root.display(),
            engine.definition().packets().len(),
            engine.definition().areas().len(),
        ),
        state_snapshot: None,
    };
    print_envelope(&envelope, output);
    Ok(ok_exit())
}

pub fn ready(config: EngineConfig, output: OutputMode) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    let ready = engine.ready()?;
    let text = if ready.is_empty() {
        "no packets ready".to_string()
    } else {
        ready
            .iter()
            .map(|r| format!("{}  [{} {}]  {}", r.id, r.area_id, r.wbs_ref, r.title))
            .collect::<Vec<_>>()
            .join("\n")
    };
    print_value(&json!({"ready": ready}), &text, output);
    Ok(ok_exit())
}

pub fn status(config: EngineConfig, output: OutputMode) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    let doc = engine.status_snapshot()?;
    let counts = doc.status_counts();
    let text = {
        let mut lines = vec![format!(
            "{} packets touched; counts: {}",
            doc.packets.len(),
            counts
                .iter()
                .map(|(status, n)| format!("{status}={n}"))
                .collect::<Vec<_>>()
                .join(" ")
        )];
        for (packet_id, packet) in &doc.packets {
            lines.push(format!(
                "{packet_id}: {}{}",
                packet.status,
                packet
                    .assigned_to
                    .as_deref()
                    .map(|a| format!(" ({a})"))
                    .unwrap_or_default()
            ));
        }
        lines.join("\n")
    };
    print_value(&json!({"counts": counts, "state": doc}), &text, output);
    Ok(ok_exit())
}

pub fn claim(
    config: EngineConfig,
    packet_id: &str,
    actor: &str,
    context_attestation: &[String],
    output: OutputMode,
) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    guard_mutation(&engine)?;
    let result = engine.claim(packet_id, actor, context_attestation)?;
    print_envelope(&transition_envelope(&engine, &result), output);
    Ok(ok_exit())
}

pub fn preflight(
    config: EngineConfig,
    packet_id: &str,
    actor: &str,
    assessment: &str,
    output: OutputMode,
) -> Result<ExitCode> {
    let assessment: PreflightAssessment =
        serde_json::from_value(parse_json_arg(assessment, "assessment")?).map_err(|e| {
            GovernanceError::Usage {
                message: format!("assessment is missing required keys: {e}"),
            }
        })?;
    let engine = open_engine(config)?;
    guard_mutation(&engine)?;
    let result = engine.preflight(packet_id, actor, assessment)?;
    print_envelope(&transition_envelope(&engine, &result), output);
    Ok(ok_exit())
}

pub fn preflight_decide(
    config: EngineConfig,
    packet_id: &str,
    supervisor: &str,
    approve: bool,
    reason: &str,
    output: OutputMode,
) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    guard_mutation(&engine)?;
    let result = engine.preflight_decide(packet_id, supervisor, approve, reason)?;
    print_envelope(&transition_envelope(&engine, &result), output);
    Ok(ok_exit())
}

pub fn heartbeat(
    config: EngineConfig,
    packet_id: &str,
    actor: &str,
    payload: &str,
    output: OutputMode,
) -> Result<ExitCode> {
    let payload: HeartbeatPayload =
        serde_json::from_value(parse_json_arg(payload, "payload")?).map_err(|e| {
            GovernanceError::Usage {
                message: format!("payload is missing required keys: {e}"),
            }
        })?;
    let engine = open_engine(config)?;
    guard_mutation(&engine)?;
    let result = engine.heartbeat(packet_id, actor, payload)?;
    print_envelope(&transition_envelope(&engine, &result), output);
    Ok(ok_exit())
}

pub fn check_stalled(config: EngineConfig, output: OutputMode) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    guard_mutation(&engine)?;
    let results = engine.check_stalled()?;
    let text = if results.is_empty() {
        "no stalled work detected".to_string()
    } else {
        results
            .iter()
            .map(|r| r.message.clone())
            .collect::<Vec<_>>()
            .join("\n")
    };
    let summary: Vec<Value> = results
        .iter()
        .map(|r| {
            json!({
                "packet_id": r.packet_id,
                "status": r.status.as_str(),
                "commit_seq": r.commit_seq,
            })
        })
        .collect();
    print_value(&json!({"transitions": summary}), &text, output);
    Ok(ok_exit())
}

pub fn done(
    config: EngineConfig,
    packet_id: &str,
    actor: &str,
    evidence: &str,
    risk: &str,
    risk_payload: Option<&str>,
    output: OutputMode,
) -> Result<ExitCode> {
    let ack = match risk.to_lowercase().as_str() {
        "none" => ResidualRiskAck::None,
        "declared" => {
            let raw = risk_payload.ok_or_else(|| GovernanceError::Usage {
                message: "--risk declared requires --risk-payload".to_string(),
            })?;
            let declarations: Vec<ResidualRiskDeclaration> =
                serde_json::from_value(parse_json_arg(raw, "risk payload")?).map_err(|e| {
                    GovernanceError::Usage {
                        message: format!("invalid risk payload: {e}"),
                    }
                })?;
            ResidualRiskAck::Declared(declarations)
        },
        other => {
            return Err(GovernanceError::Usage {
                message: format!("invalid --risk value: {other} (use none|declared)"),
            });
        },
    };
    let engine = open_engine(config)?;
    guard_mutation(&engine)?;
    let result = engine.done(packet_id, actor, evidence, ack)?;
    print_envelope(&transition_envelope(&engine, &result), output);
    Ok(ok_exit())
}

pub fn review_claim(
    config: EngineConfig,
    packet_id: &str,
    reviewer: &str,
    output: OutputMode,
) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    guard_mutation(&engine)?;
    let result = engine.review_claim(packet_id, reviewer)?;
    print_envelope(&transition_envelope(&engine, &result), output);
    Ok(ok_exit())
}

pub fn review_submit(
    config: EngineConfig,
    packet_id: &str,
    reviewer: &str,
    verdict: &str,
    assessment: &str,
    output: OutputMode,
) -> Result<ExitCode> {
    let verdict = ReviewVerdict::parse(verdict)?;
    let assessment: ReviewAssessment =
        serde_json::from_value(parse_json_arg(assessment, "assessment")?).map_err(|e| {
            GovernanceError::Usage {
                message: format!("assessment is missing required keys: {e}"),
            }
        })?;
    let engine = open_engine(config)?;
    guard_mutation(&engine)?;
    let result = engine.review_submit(packet_id, reviewer, verdict, assessment)?;
    print_envelope(&transition_envelope(&engine, &result), output);
    Ok(ok_exit())
}

pub fn fail(
    config: EngineConfig,
    packet_id: &str,
    actor: &str,
    reason: &str,
    supervisor: bool,
    output: OutputMode,
) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    guard_mutation(&engine)?;
    let result = engine.fail(packet_id, actor, reason, supervisor)?;
    print_envelope(&transition_envelope(&engine, &result), output);
    Ok(ok_exit())
}

pub fn reset(
    config: EngineConfig,
    packet_id: &str,
    supervisor: &str,
    output: OutputMode,
) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    guard_mutation(&engine)?;
    let result = engine.reset(packet_id, supervisor)?;
    print_envelope(&transition_envelope(&engine, &result), output);
    Ok(ok_exit())
}

pub fn note(
    config: EngineConfig,
    packet_id: &str,
    actor: &str,
    text: &str,
    output: OutputMode,
) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    guard_mutation(&engine)?;
    let result = engine.note(packet_id, actor, text)?;
    print_envelope(&transition_envelope(&engine, &result), output);
    Ok(ok_exit())
}

pub fn closeout_l2(
    config: EngineConfig,
    area_id: &str,
    supervisor: &str,
    assessment_path: &Path,
    notes: Option<&str>,
    output: OutputMode,
) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    guard_mutation(&engine)?;
    let (closeout, checkpoint) = engine.closeout_l2(area_id, supervisor, assessment_path, notes)?;
    let envelope = Envelope {
        ok: true,
        code: "ok".to_string(),
        message: format!(
            "area {area_id} closed by {supervisor}; checkpoint {}",
            checkpoint.checkpoint_id
        ),
        state_snapshot: serde_json::to_value(&closeout).ok(),
    };
    print_envelope(&envelope, output);
    Ok(ok_exit())
}

pub fn verify(
    config: EngineConfig,
    packet_id: Option<&str>,
    all: bool,
    output: OutputMode,
) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    let verifier = Verifier::new(&engine);

    if all || packet_id.is_none() {
        let report = verifier.verify_all()?;
        let text = if report.ok {
            format!(
                "ok: {} packets, {} commits, {} checkpoints",
                report.packet_count, report.commit_count, report.checkpoint_count
            )
        } else {
            report
                .issues
                .iter()
                .map(|i| {
                    format!(
                        "{}: {} ({})",
                        i.packet_id.as_deref().unwrap_or("-"),
                        i.message,
                        i.code
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        print_value(&report, &text, output);
        return Ok(if report.ok {
            ok_exit()
        } else {
            ExitCode::from(5)
        });
    }

    let packet_id = packet_id.expect("checked above");
    engine.definition().require_packet(packet_id)?;
    let report = verifier.verify_packet(packet_id)?;
    let text = if report.ok() {
        format!("ok: {packet_id} verified ({} commits)", report.commit_count)
    } else {
        report
            .issues
            .iter()
            .map(|i| format!("{}: {} ({})", packet_id, i.message, i.code))
            .collect::<Vec<_>>()
            .join("\n")
    };
    print_value(&report, &text, output);
    Ok(if report.ok() {
        ok_exit()
    } else {
        ExitCode::from(5)
    })
}

pub fn history(config: EngineConfig, packet_id: &str, output: OutputMode) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    let commits = Verifier::new(&engine).history(packet_id)?;
    let text = commits
        .iter()
        .map(|c| {
            format!(
                "{:>6}  {}  {}  {}",
                c.seq, c.created_at, c.action_envelope.name, c.commit_hash
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    print_value(&commits, &text, output);
    Ok(ok_exit())
}

pub fn export_proof(
    config: EngineConfig,
    packet_id: &str,
    out: &Path,
    output: OutputMode,
) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    let bundle = Verifier::new(&engine).export_proof(packet_id, out)?;
    let envelope = Envelope {
        ok: true,
        code: "ok".to_string(),
        message: format!(
            "proof bundle {} written to {} (manifest {})",
            bundle.bundle_id,
            out.display(),
            bundle.manifest_hash
        ),
        state_snapshot: None,
    };
    print_envelope(&envelope, output);
    Ok(ok_exit())
}

pub fn checkpoint(config: EngineConfig, output: OutputMode) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    guard_mutation(&engine)?;
    let checkpoint = engine.snapshot_heads()?;
    let envelope = Envelope {
        ok: true,
        code: "ok".to_string(),
        message: format!(
            "checkpoint {} over {} packets",
            checkpoint.checkpoint_id,
            checkpoint.head_table.len()
        ),
        state_snapshot: None,
    };
    print_envelope(&envelope, output);
    Ok(ok_exit())
}

pub fn doctor(config: EngineConfig, mode: DoctorMode, output: OutputMode) -> Result<ExitCode> {
    let strict = config.strict;
    // The doctor inspects the root directly; strict enforcement happens on
    // the report below rather than inside open_engine.
    let engine = Engine::open(config)?;
    let report = doctor::run(&engine, mode)?;
    let text = if report.ok {
        format!(
            "ok: {} packets, {} commits, {} checkpoints{}",
            report.packet_count,
            report.commit_count,
            report.checkpoint_count,
            if report.recovered.is_empty() {
                String::new()
            } else {
                format!("; recovered: {}", report.recovered.join(", "))
            }
        )
    } else {
        report
            .failures
            .iter()
            .map(|f| {
                format!(
                    "{}: {} ({})",
                    f.packet_id.as_deref().unwrap_or("-"),
                    f.message,
                    f.code
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    print_value(&report, &text, output);
    if strict {
        doctor::enforce_strict(&report)?;
    }
    Ok(if report.ok {
        ok_exit()
    } else {
        ExitCode::from(5)
    })
}

pub fn log_tail(config: EngineConfig, n: usize, output: OutputMode) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    let entries = engine.log_tail(n)?;
    let text = entries
        .iter()
        .map(|e| {
            format!(
                "{}  {:<24} {:<20} {}",
                e.timestamp,
                e.packet_id,
                e.event.as_str(),
                e.actor
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    print_value(&entries, &text, output);
    Ok(ok_exit())
}

pub fn risk_list(
    config: EngineConfig,
    packet_id: Option<&str>,
    status: Option<&str>,
    output: OutputMode,
) -> Result<ExitCode> {
    let status = status.map(RiskStatus::parse).transpose()?;
    let engine = open_engine(config)?;
    let risks = engine.risk_store().list(packet_id, status)?;
    let text = if risks.is_empty() {
        "no risks recorded".to_string()
    } else {
        risks
            .iter()
            .map(|r| {
                format!(
                    "{}  {:<10} {:<9} {:<10} {}",
                    r.id,
                    r.packet_id,
                    r.severity.as_str(),
                    r.status.as_str(),
                    r.description
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    print_value(&risks, &text, output);
    Ok(ok_exit())
}

pub fn risk_show(config: EngineConfig, risk_id: &str, output: OutputMode) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    let risk = engine.risk_store().get(risk_id)?;
    let text = format!(
        "{}: [{}] {} against {} owned by {} ({})",
        risk.id,
        risk.severity.as_str(),
        risk.description,
        risk.packet_id,
        risk.owner,
        risk.status.as_str()
    );
    print_value(&risk, &text, output);
    Ok(ok_exit())
}

pub fn risk_add(
    config: EngineConfig,
    packet_id: &str,
    actor: &str,
    severity: &str,
    description: &str,
    output: OutputMode,
) -> Result<ExitCode> {
    let severity = RiskSeverity::parse(severity)?;
    let engine = open_engine(config)?;
    engine.definition().require_packet(packet_id)?;
    let ids = engine.risk_store().add_declarations(
        packet_id,
        actor,
        &[ResidualRiskDeclaration {
            severity,
            description: description.to_string(),
            owner: None,
        }],
    )?;
    let envelope = Envelope {
        ok: true,
        code: "ok".to_string(),
        message: format!("recorded {} against {packet_id}", ids.join(", ")),
        state_snapshot: None,
    };
    print_envelope(&envelope, output);
    Ok(ok_exit())
}

pub fn risk_update_status(
    config: EngineConfig,
    risk_id: &str,
    status: &str,
    notes: Option<&str>,
    output: OutputMode,
) -> Result<ExitCode> {
    let status = RiskStatus::parse(status)?;
    let engine = open_engine(config)?;
    let updated = engine.risk_store().update_status(risk_id, status, notes)?;
    let envelope = Envelope {
        ok: true,
        code: "ok".to_string(),
        message: format!("{} updated to {}", updated.id, updated.status.as_str()),
        state_snapshot: serde_json::to_value(&updated).ok(),
    };
    print_envelope(&envelope, output);
    Ok(ok_exit())
}

pub fn risk_summary(config: EngineConfig, output: OutputMode) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    let summary = engine.risk_store().summary()?;
    let text = format!(
        "{} risks: {} open, {} mitigated, {} accepted",
        summary.total, summary.open, summary.mitigated, summary.accepted
    );
    print_value(&summary, &text, output);
    Ok(ok_exit())
}
