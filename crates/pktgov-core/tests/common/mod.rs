//! Shared fixtures for integration tests.
#![allow(dead_code)] // Not every test binary uses every fixture.

use std::path::Path;

use pktgov_core::config::EngineConfig;
use pktgov_core::definition::{
    DefinitionDocument, DefinitionMetadata, PacketDefinition, WorkArea,
};
use pktgov_core::engine::Engine;
use pktgov_core::payloads::{HeartbeatPayload, PreflightAssessment, ReviewAssessment};
use serde_json::json;

/// A minimal packet definition with the given dependencies.
pub fn packet(id: &str, wbs_ref: &str, deps: &[&str]) -> PacketDefinition {
    PacketDefinition {
        id: id.to_string(),
        wbs_ref: wbs_ref.to_string(),
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

/// Initializes a governance root under `dir` with the given packets.
pub fn init_engine(dir: &Path, packets: Vec<PacketDefinition>) -> Engine {
    let doc = DefinitionDocument {
        schema_version: "1.0".to_string(),
        metadata: DefinitionMetadata::default(),
        work_areas: vec![WorkArea {
            id: "1.0".to_string(),
            title: "Area One".to_string(),
            description: String::new(),
        }],
        packets,
    };
    let def_path = dir.join("definition-input.json");
    std::fs::write(&def_path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
    Engine::init(EngineConfig::new(dir), &def_path).unwrap()
}

/// A valid preflight assessment.
pub fn preflight_assessment() -> PreflightAssessment {
    serde_json::from_value(json!({
        "context_confirmation": {"read": true},
        "ambiguity_register": [],
        "risk_flags": [],
        "execution_plan": {"steps": ["implement", "verify"]},
    }))
    .unwrap()
}

/// A valid review assessment.
pub fn review_assessment(outcome: &str) -> ReviewAssessment {
    serde_json::from_value(json!({
        "exit_criteria_assessment": {"all": outcome},
        "findings": outcome,
        "risk_flags": [],
    }))
    .unwrap()
}

/// A valid heartbeat payload.
pub fn heartbeat_payload(estimate: &str) -> HeartbeatPayload {
    serde_json::from_value(json!({
        "status": "working",
        "decisions": [],
        "obstacles": [],
        "completion_estimate": estimate,
    }))
    .unwrap()
}
