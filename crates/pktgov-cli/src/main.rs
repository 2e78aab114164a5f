//! pktgov - operator CLI for the packet governance control plane.
//!
//! A thin, synchronous dispatcher: parse arguments, open the engine,
//! invoke one core operation, print the result envelope, exit with a
//! stable code. No business logic lives here.
//!
//! Exit codes: 0 success, 2 usage, 3 governance rejection, 4 precondition
//! missing (dependency gate), 5 integrity failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use pktgov_core::config::EngineConfig;
use pktgov_core::doctor::DoctorMode;
use pktgov_core::error::GovernanceError;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::OutputMode;

/// pktgov - governance control plane for multi-agent delivery
#[derive(Parser, Debug)]
#[command(name = "pktgov")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Governance root directory (defaults to $PKTGOV_ROOT, then `.`)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Emit results as JSON envelopes instead of text
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a governance root from a definition document
    Init {
        /// Path to the definition document
        definition: PathBuf,
    },

    /// List ready packets (pending with all dependencies done)
    Ready,

    /// Dump full status: packet map, counts, closeouts
    Status,

    /// Claim a pending packet
    Claim {
        /// Packet id
        packet_id: String,
        /// Executor identity
        actor: String,
        /// Attested context-manifest paths (comma-separated)
        #[arg(long, value_delimiter = ',')]
        context_attestation: Vec<String>,
    },

    /// Submit a preflight assessment
    Preflight {
        /// Packet id
        packet_id: String,
        /// Executor identity
        actor: String,
        /// Assessment JSON (inline, or @path to a file)
        #[arg(long)]
        assessment: String,
    },

    /// Approve a preflight into in_progress
    PreflightApprove {
        /// Packet id
        packet_id: String,
        /// Supervisor identity (must differ from the executor)
        supervisor: String,
    },

    /// Return a preflight to pending
    PreflightReturn {
        /// Packet id
        packet_id: String,
        /// Supervisor identity (must differ from the executor)
        supervisor: String,
        /// Reason for the return
        #[arg(long, default_value = "")]
        reason: String,
    },

    /// Record a liveness heartbeat
    Heartbeat {
        /// Packet id
        packet_id: String,
        /// Executor identity
        actor: String,
        /// Heartbeat payload JSON (inline, or @path to a file)
        #[arg(long)]
        payload: String,
    },

    /// Sweep for stalled packets and timed-out preflights
    CheckStalled,

    /// Complete a packet with evidence
    Done {
        /// Packet id
        packet_id: String,
        /// Executor identity
        actor: String,
        /// Evidence narrative (non-empty)
        evidence: String,
        /// Residual-risk acknowledgement: none | declared
        #[arg(long, default_value = "none")]
        risk: String,
        /// Declared risks JSON array (inline, or @path), required with
        /// --risk declared
        #[arg(long)]
        risk_payload: Option<String>,
    },

    /// Claim the review of a packet
    ReviewClaim {
        /// Packet id
        packet_id: String,
        /// Reviewer identity (must differ from the executor)
        reviewer: String,
    },

    /// Submit a review verdict
    ReviewSubmit {
        /// Packet id
        packet_id: String,
        /// Reviewer identity
        reviewer: String,
        /// Verdict: APPROVE | REJECT | ESCALATE
        verdict: String,
        /// Assessment JSON (inline, or @path to a file)
        #[arg(long)]
        assessment: String,
    },

    /// Fail a packet
    Fail {
        /// Packet id
        packet_id: String,
        /// Actor identity
        actor: String,
        /// Failure reason
        reason: String,
        /// Act with supervisor authority (not the assigned executor)
        #[arg(long)]
        supervisor: bool,
    },

    /// Supervisor reset of a failed/stalled/escalated/preflight packet
    Reset {
        /// Packet id
        packet_id: String,
        /// Supervisor identity
        supervisor: String,
    },

    /// Append evidence narrative without changing status
    Note {
        /// Packet id
        packet_id: String,
        /// Actor identity
        actor: String,
        /// Note text
        text: String,
    },

    /// Close out a level-2 area once all its packets are done
    CloseoutL2 {
        /// Area id
        area_id: String,
        /// Supervisor identity
        supervisor: String,
        /// Path to the assessment document
        assessment_path: PathBuf,
        /// Optional closeout notes
        notes: Option<String>,
    },

    /// Verify one packet's chain, or everything with --all
    Verify {
        /// Packet id (omit with --all)
        packet_id: Option<String>,
        /// Verify every packet plus the latest checkpoint
        #[arg(long)]
        all: bool,
    },

    /// Print the ordered commit list for a packet
    History {
        /// Packet id
        packet_id: String,
    },

    /// Export a sealed proof bundle for a packet
    ExportProof {
        /// Packet id
        packet_id: String,
        /// Output path for the bundle
        #[arg(long)]
        out: PathBuf,
    },

    /// Snapshot all packet HEADs into a project checkpoint
    Checkpoint,

    /// Run the integrity doctor
    Doctor {
        /// Fast mode: journal recovery + HEAD + runtime binding (the
        /// default depth, made explicit)
        #[arg(long, conflicts_with = "full")]
        fast: bool,
        /// Full mode: fast checks plus complete chain recomputation
        #[arg(long)]
        full: bool,
    },

    /// Show the last N lifecycle log entries
    Log {
        /// Number of entries (default 20)
        #[arg(default_value_t = 20)]
        n: usize,
    },

    /// Residual-risk register
    #[command(subcommand)]
    Risk(RiskCommands),
}

#[derive(Subcommand, Debug)]
enum RiskCommands {
    /// List risks, optionally filtered
    List {
        /// Filter by packet id
        #[arg(long)]
        packet_id: Option<String>,
        /// Filter by status: open | mitigated | accepted
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one risk entry
    Show {
        /// Risk id (RR-NNNN)
        risk_id: String,
    },

    /// Declare a risk against a packet
    Add {
        /// Packet id
        packet_id: String,
        /// Declaring actor
        actor: String,
        /// Severity: low | medium | high | critical
        severity: String,
        /// Risk description
        description: String,
    },

    /// Update a risk's status
    UpdateStatus {
        /// Risk id (RR-NNNN)
        risk_id: String,
        /// New status: open | mitigated | accepted
        status: String,
        /// Resolution notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Aggregate counts over the register
    Summary,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = EngineConfig::from_env();
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    let output = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    match dispatch(cli.command, config, output) {
        Ok(code) => code,
        Err(err) => {
            commands::print_error(&err, output);
            exit_code_of(&err)
        },
    }
}

fn dispatch(
    command: Commands,
    config: EngineConfig,
    output: OutputMode,
) -> Result<ExitCode, GovernanceError> {
    match command {
        Commands::Init { definition } => commands::init(config, &definition, output),
        Commands::Ready => commands::ready(config, output),
        Commands::Status => commands::status(config, output),
        Commands::Claim {
            packet_id,
            actor,
            context_attestation,
        } => commands::claim(config, &packet_id, &actor, &context_attestation, output),
        Commands::Preflight {
            packet_id,
            actor,
            assessment,
        } => commands::preflight(config, &packet_id, &actor, &assessment, output),
        Commands::PreflightApprove {
            packet_id,
            supervisor,
        } => commands::preflight_decide(config, &packet_id, &supervisor, true, "", output),
        Commands::PreflightReturn {
            packet_id,
            supervisor,
            reason,
        } => commands::preflight_decide(config, &packet_id, &supervisor, false, &reason, output),
        Commands::Heartbeat {
            packet_id,
            actor,
            payload,
        } => commands::heartbeat(config, &packet_id, &actor, &payload, output),
        Commands::CheckStalled => commands::check_stalled(config, output),
        Commands::Done {
            packet_id,
            actor,
            evidence,
            risk,
            risk_payload,
        } => commands::done(
            config,
            &packet_id,
            &actor,
            &evidence,
            &risk,
            risk_payload.as_deref(),
            output,
        ),
        Commands::ReviewClaim {
            packet_id,
            reviewer,
        } => commands::review_claim(config, &packet_id, &reviewer, output),
        Commands::ReviewSubmit {
            packet_id,
            reviewer,
            verdict,
            assessment,
        } => commands::review_submit(config, &packet_id, &reviewer, &verdict, &assessment, output),
        Commands::Fail {
            packet_id,
            actor,
            reason,
            supervisor,
        } => commands::fail(config, &packet_id, &actor, &reason, supervisor, output),
        Commands::Reset {
            packet_id,
            supervisor,
        } => commands::reset(config, &packet_id, &supervisor, output),
        Commands::Note {
            packet_id,
            actor,
            text,
        } => commands::note(config, &packet_id, &actor, &text, output),
        Commands::CloseoutL2 {
            area_id,
            supervisor,
            assessment_path,
            notes,
        } => commands::closeout_l2(
            config,
            &area_id,
            &supervisor,
            &assessment_path,
            notes.as_deref(),
            output,
        ),
        Commands::Verify { packet_id, all } => {
            commands::verify(config, packet_id.as_deref(), all, output)
        },
        Commands::History { packet_id } => commands::history(config, &packet_id, output),
        Commands::ExportProof { packet_id, out } => {
            commands::export_proof(config, &packet_id, &out, output)
        },
        Commands::Checkpoint => commands::checkpoint(config, output),
        Commands::Doctor { fast, full } => {
            // The flags are mutually exclusive; omitting both selects fast.
            let mode = match (fast, full) {
                (false, true) => DoctorMode::Full,
                _ => DoctorMode::Fast,
            };
            commands::doctor(config, mode, output)
        },
        Commands::Log { n } => commands::log_tail(config, n, output),
        Commands::Risk(risk) => match risk {
            RiskCommands::List { packet_id, status } => {
                commands::risk_list(config, packet_id.as_deref(), status.as_deref(), output)
            },
            RiskCommands::Show { risk_id } => commands::risk_show(config, &risk_id, output),
            RiskCommands::Add {
                packet_id,
                actor,
                severity,
                description,
            } => commands::risk_add(config, &packet_id, &actor, &severity, &description, output),
            RiskCommands::UpdateStatus {
                risk_id,
                status,
                notes,
            } => commands::risk_update_status(
                config,
                &risk_id,
                &status,
                notes.as_deref(),
                output,
            ),
            RiskCommands::Summary => commands::risk_summary(config, output),
        },
    }
}

fn exit_code_of(err: &GovernanceError) -> ExitCode {
    // GovernanceError::exit_code is i32 for the operator contract; clamp
    // into the u8 range ExitCode accepts.
    ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
}
