//! Dependency gating: readiness and blocked propagation.
//!
//! A packet is **ready** iff it is `pending` and every dependency is
//! `done`. A packet is **blocked** iff any dependency is `failed` or is
//! itself (transitively) blocked, and the packet is not terminal. Blocked
//! propagation is recomputed after any transition that touches a status
//! field; the dependency DAG is cycle-free by construction (rejected at
//! definition load).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::definition::Definition;
use crate::state::{PacketStatus, StateDocument};

/// One entry of the ready listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyPacket {
    /// Packet id.
    pub id: String,
    /// Work-breakdown reference.
    pub wbs_ref: String,
    /// Owning area.
    pub area_id: String,
    /// Display title.
    pub title: String,
}

/// A status change demanded by blocked recomputation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockChange {
    /// The packet to retarget.
    pub packet_id: String,
    /// The status it must move to (`Blocked` or back to `Pending`).
    pub to: PacketStatus,
    /// The dependency that caused a block, when blocking.
    pub caused_by: Option<String>,
}

/// Returns the first unmet dependency of `packet_id`, if any.
#[must_use]
pub fn first_unmet_dependency(
    definition: &Definition,
    state: &StateDocument,
    packet_id: &str,
) -> Option<String> {
    let packet = definition.packet(packet_id)?;
    packet
        .dependencies
        .iter()
        .find(|dep| state.status_of(dep) != PacketStatus::Done)
        .cloned()
}

/// Lists ready packets ordered strictly by `(area_id, wbs_ref)` ascending.
#[must_use]
pub fn ready_packets(definition: &Definition, state: &StateDocument) -> Vec<ReadyPacket> {
    let mut ready: Vec<ReadyPacket> = definition
        .packets()
        .iter()
        .filter(|packet| state.status_of(&packet.id) == PacketStatus::Pending)
        .filter(|packet| {
            packet
                .dependencies
                .iter()
                .all(|dep| state.status_of(dep) == PacketStatus::Done)
        })
        .map(|packet| ReadyPacket {
            id: packet.id.clone(),
            wbs_ref: packet.wbs_ref.clone(),
            area_id: packet.area_id.clone(),
            title: packet.title.clone(),
        })
        .collect();
    ready.sort_by(|a, b| (&a.area_id, &a.wbs_ref).cmp(&(&b.area_id, &b.wbs_ref)));
    ready
}

/// Computes the transitive blocked set over the dependency DAG.
fn blocked_set(definition: &Definition, state: &StateDocument) -> BTreeSet<String> {
    let mut blocked = BTreeSet::new();
    // Fixed point: the DAG is cycle-free so this terminates in at most
    // |packets| passes.
    loop {
        let mut changed = false;
        for packet in definition.packets() {
            if blocked.contains(&packet.id) {
                continue;
            }
            let has_blocking_dep = packet.dependencies.iter().any(|dep| {
                state.status_of(dep) == PacketStatus::Failed || blocked.contains(dep)
            });
            if has_blocking_dep {
                blocked.insert(packet.id.clone());
                changed = true;
            }
        }
        if !changed {
            return blocked;
        }
    }
}

/// Computes the status changes blocked recomputation demands.
///
/// Non-terminal packets with a failed or blocked dependency move to
/// `blocked`; packets sitting in `blocked` whose dependencies have all
/// recovered move back to `pending`.
#[must_use]
pub fn compute_block_changes(
    definition: &Definition,
    state: &StateDocument,
) -> Vec<BlockChange> {
    let blocked = blocked_set(definition, state);
    let mut changes = Vec::new();
    for packet in definition.packets() {
        let current = state.status_of(&packet.id);
        if current.is_terminal() {
            continue;
        }
        let should_block = blocked.contains(&packet.id);
        if should_block && current != PacketStatus::Blocked {
            let caused_by = packet
                .dependencies
                .iter()
                .find(|dep| {
                    state.status_of(dep) == PacketStatus::Failed || blocked.contains(*dep)
                })
                .cloned();
            changes.push(BlockChange {
                packet_id: packet.id.clone(),
                to: PacketStatus::Blocked,
                caused_by,
            });
        } else if !should_block && current == PacketStatus::Blocked {
            changes.push(BlockChange {
                packet_id: packet.id.clone(),
                to: PacketStatus::Pending,
                caused_by: None,
            });
        }
    }
    changes
}
