//! # pktgov-core
//!
//! Core library for pktgov - a governance control plane for coordinating
//! multi-agent software delivery.
//!
//! Each unit of work is a packet moving through a formal state machine
//! with strict dependency gating, evidence-bearing completion, and a
//! tamper-evident audit trail:
//!
//! - **Lifecycle engine** ([`engine`]): claim, preflight, heartbeat,
//!   review, completion, failure propagation, and supervisor reset, with
//!   identity guards on every transition.
//! - **Deterministic commitment layer** ([`canonical`], [`hash`],
//!   [`dcl`]): canonical serialization, per-packet hash-linked commit
//!   chains, journaled atomic writes, project checkpoints.
//! - **Integrity runtime** ([`verify`], [`doctor`]): chain verification,
//!   runtime-state binding, startup recovery, strict/fail-open modes.
//! - **Persistence substrate** ([`store`], [`state`]): advisory locks and
//!   temp-file-plus-rename atomic replacement.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pktgov_core::config::EngineConfig;
//! use pktgov_core::engine::Engine;
//! use pktgov_core::payloads::ResidualRiskAck;
//!
//! # fn main() -> pktgov_core::error::Result<()> {
//! let engine = Engine::open(EngineConfig::new("/srv/project"))?;
//! engine.claim("PKT-001", "alice", &[])?;
//! engine.done("PKT-001", "alice", "implemented with tests", ResidualRiskAck::None)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod canonical;
pub mod config;
pub mod dcl;
pub mod definition;
pub mod doctor;
pub mod engine;
pub mod error;
pub mod gate;
pub mod hash;
pub mod log;
pub mod payloads;
pub mod risk;
pub mod state;
pub mod store;
pub mod time;
pub mod verify;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{DclConfig, EngineConfig};
    pub use crate::engine::{Engine, TransitionResult};
    pub use crate::error::{GovernanceError, Result};
    pub use crate::payloads::{
        HeartbeatPayload, PreflightAssessment, ResidualRiskAck, ReviewAssessment, ReviewVerdict,
    };
    pub use crate::state::{PacketRuntimeState, PacketStatus};
    pub use crate::verify::Verifier;
}

pub use config::EngineConfig;
pub use engine::{Engine, TransitionResult};
pub use error::{GovernanceError, Result};
pub use state::PacketStatus;
