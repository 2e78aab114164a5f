//! Immutable work-area and packet definitions.
//!
//! The definition document is loaded once per process and never mutated
//! afterwards; changing it is an out-of-band replacement followed by
//! re-initialization. [`Definition`] wraps the parsed document with
//! indices so lookups never scan.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GovernanceError, Result};
use crate::store;

/// One entry of a packet's context manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextManifestEntry {
    /// Repository-relative path the executor must attest having read.
    pub file: String,
    /// Display priority ("high", "medium", ...). Free-form.
    #[serde(default)]
    pub priority: String,
    /// Whether claiming requires attestation of this entry.
    #[serde(default)]
    pub required: bool,
}

/// A named grouping of packets supporting level-2 closeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkArea {
    /// Unique area id (e.g. `"2.0"`).
    pub id: String,
    /// Display title.
    pub title: String,
    /// Optional longer description.
    #[serde(default)]
    pub description: String,
}

/// The immutable definition of one governed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketDefinition {
    /// Unique packet id.
    pub id: String,
    /// Work-breakdown reference used for display and ready ordering.
    #[serde(default)]
    pub wbs_ref: String,
    /// Owning work area.
    pub area_id: String,
    /// Display title.
    pub title: String,
    /// Scope statement.
    #[serde(default)]
    pub scope: String,
    /// Conditions that must hold before work starts.
    #[serde(default)]
    pub preconditions: Vec<String>,
    /// Actions the executor must take.
    #[serde(default)]
    pub required_actions: Vec<String>,
    /// Artifacts the executor must produce.
    #[serde(default)]
    pub required_outputs: Vec<String>,
    /// Checks reviewers run against the outputs.
    #[serde(default)]
    pub validation_checks: Vec<String>,
    /// Criteria that define completion.
    #[serde(default)]
    pub exit_criteria: Vec<String>,
    /// Conditions that require stopping and escalating.
    #[serde(default)]
    pub halt_conditions: Vec<String>,
    /// Ids of packets that must be `done` before this one may be claimed.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Whether claiming routes through the preflight gate.
    #[serde(default)]
    pub preflight_required: bool,
    /// Whether completion routes through independent review.
    #[serde(default)]
    pub review_required: bool,
    /// Whether the executor must heartbeat while in progress.
    #[serde(default)]
    pub heartbeat_required: bool,
    /// Per-packet heartbeat interval override, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_seconds: Option<u64>,
    /// Files the executor must attest before claiming.
    #[serde(default)]
    pub context_manifest: Vec<ContextManifestEntry>,
    /// Optional template reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<String>,
    /// Whether ontology review applies (advisory; carried for schema
    /// compatibility, the core engine does not act on it).
    #[serde(default)]
    pub ontology_required: bool,
}

impl PacketDefinition {
    /// Context-manifest paths whose attestation is mandatory at claim.
    #[must_use]
    pub fn required_context_paths(&self) -> Vec<&str> {
        self.context_manifest
            .iter()
            .filter(|entry| entry.required)
            .map(|entry| entry.file.as_str())
            .collect()
    }
}

/// Project-level metadata carried by the definition document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefinitionMetadata {
    /// Human project name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    /// Who approved the plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    /// When the plan was approved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<String>,
    /// Forward-compatible extras.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The on-disk definition document (`definition.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionDocument {
    /// Definition schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// Project metadata.
    #[serde(default)]
    pub metadata: DefinitionMetadata,
    /// Work areas.
    #[serde(default)]
    pub work_areas: Vec<WorkArea>,
    /// Packet definitions.
    #[serde(default)]
    pub packets: Vec<PacketDefinition>,
}

fn default_schema_version() -> String {
    "1.0".to_string()
}

/// An indexed, validated, read-only view of the definition document.
#[derive(Debug, Clone)]
pub struct Definition {
    doc: DefinitionDocument,
    packet_index: BTreeMap<String, usize>,
    area_index: BTreeMap<String, usize>,
    dependents: BTreeMap<String, Vec<String>>,
}

impl Definition {
    /// Loads and validates `definition.json` from `path`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the file is absent, `SchemaInvalid` if the
    /// document fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let doc: DefinitionDocument = store::read_json(path, "definition")?;
        Self::from_document(doc)
    }

    /// Validates a parsed document and builds the indexed view.
    ///
    /// # Errors
    ///
    /// Returns `SchemaInvalid` on duplicate ids, unknown area references,
    /// unknown dependency references, or dependency cycles.
    pub fn from_document(doc: DefinitionDocument) -> Result<Self> {
        let mut area_index = BTreeMap::new();
        for (idx, area) in doc.work_areas.iter().enumerate() {
            if area.id.trim().is_empty() {
                return Err(schema_invalid("work area with empty id"));
            }
            if area_index.insert(area.id.clone(), idx).is_some() {
                return Err(schema_invalid(format!("duplicate area id: {}", area.id)));
            }
        }

        let mut packet_index = BTreeMap::new();
        for (idx, packet) in doc.packets.iter().enumerate() {
            if packet.id.trim().is_empty() {
                return Err(schema_invalid("packet with empty id"));
            }
            if packet.title.trim().is_empty() {
                return Err(schema_invalid(format!("packet {} has empty title", packet.id)));
            }
            if packet_index.insert(packet.id.clone(), idx).is_some() {
                return Err(schema_invalid(format!("duplicate packet id: {}", packet.id)));
            }
        }

        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for packet in &doc.packets {
            if !area_index.contains_key(&packet.area_id) {
                return Err(schema_invalid(format!(
                    "packet {} references unknown area {}",
                    packet.id, packet.area_id
                )));
            }
            let mut seen = BTreeSet::new();
            for dep in &packet.dependencies {
                if !packet_index.contains_key(dep) {
                    return Err(schema_invalid(format!(
                        "packet {} depends on unknown packet {dep}",
                        packet.id
                    )));
                }
                if dep == &packet.id {
                    return Err(schema_invalid(format!(
                        "packet {} depends on itself",
                        packet.id
                    )));
                }
                if !seen.insert(dep.clone()) {
                    return Err(schema_invalid(format!(
                        "packet {} lists dependency {dep} twice",
                        packet.id
                    )));
                }
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(packet.id.clone());
            }
        }

        let definition = Self {
            doc,
            packet_index,
            area_index,
            dependents,
        };
        definition.reject_cycles()?;
        Ok(definition)
    }

    /// Rejects dependency cycles with Kahn's algorithm.
    fn reject_cycles(&self) -> Result<()> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .doc
            .packets
            .iter()
            .map(|p| (p.id.as_str(), p.dependencies.len()))
            .collect();
        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop() {
            visited += 1;
            if let Some(children) = self.dependents.get(id) {
                for child in children {
                    let deg = in_degree
                        .get_mut(child.as_str())
                        .expect("dependent references validated packet");
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push(child.as_str());
                    }
                }
            }
        }
        if visited != self.doc.packets.len() {
            return Err(schema_invalid("dependency graph contains a cycle"));
        }
        Ok(())
    }

    /// The underlying document.
    #[must_use]
    pub fn document(&self) -> &DefinitionDocument {
        &self.doc
    }

    /// Looks up a packet definition by id.
    #[must_use]
    pub fn packet(&self, id: &str) -> Option<&PacketDefinition> {
        self.packet_index.get(id).map(|idx| &self.doc.packets[*idx])
    }

    /// Looks up a packet definition, erroring with `NotFound` if absent.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids.
    pub fn require_packet(&self, id: &str) -> Result<&PacketDefinition> {
        self.packet(id).ok_or_else(|| GovernanceError::NotFound {
            kind: "packet",
            id: id.to_string(),
        })
    }

    /// Looks up a work area by id.
    #[must_use]
    pub fn area(&self, id: &str) -> Option<&WorkArea> {
        self.area_index.get(id).map(|idx| &self.doc.work_areas[*idx])
    }

    /// All packets, in document order.
    #[must_use]
    pub fn packets(&self) -> &[PacketDefinition] {
        &self.doc.packets
    }

    /// All work areas, in document order.
    #[must_use]
    pub fn areas(&self) -> &[WorkArea] {
        &self.doc.work_areas
    }

    /// Packets belonging to an area, in document order.
    #[must_use]
    pub fn packets_in_area(&self, area_id: &str) -> Vec<&PacketDefinition> {
        self.doc
            .packets
            .iter()
            .filter(|p| p.area_id == area_id)
            .collect()
    }

    /// Packets that list `id` as a dependency.
    #[must_use]
    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.dependents.get(id).map_or(&[], Vec::as_slice)
    }
}

fn schema_invalid(message: impl Into<String>) -> GovernanceError {
    GovernanceError::SchemaInvalid {
        message: message.into(),
    }
}
