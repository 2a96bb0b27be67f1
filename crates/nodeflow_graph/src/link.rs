// SPDX-License-Identifier: MIT OR Apache-2.0
//! Link (edge) definitions for the graph.
//!
//! On the wire a link is a flat array
//! `[id, origin_id, origin_slot, target_id, target_slot, type]`.

use crate::node::NodeId;
use crate::slot::SlotType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a link within its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A directed link from an output slot to an input slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "LinkRecord", from = "LinkRecord")]
pub struct Link {
    /// Unique link ID
    pub id: LinkId,
    /// Origin node ID
    pub origin_id: NodeId,
    /// Output index on the origin node
    pub origin_slot: usize,
    /// Target node ID
    pub target_id: NodeId,
    /// Input index on the target node
    pub target_slot: usize,
    /// Type resolved when the link was made
    pub link_type: SlotType,
}

impl Link {
    /// Create a new link
    pub fn new(
        id: LinkId,
        origin_id: NodeId,
        origin_slot: usize,
        target_id: NodeId,
        target_slot: usize,
        link_type: SlotType,
    ) -> Self {
        Self {
            id,
            origin_id,
            origin_slot,
            target_id,
            target_slot,
            link_type,
        }
    }

    /// Resolve the type a new link carries between two slot types.
    pub fn resolve_type(origin: &SlotType, target: &SlotType) -> SlotType {
        if origin.is_trigger() || target.is_trigger() {
            SlotType::Event
        } else if origin.is_wildcard() {
            target.clone()
        } else {
            origin.clone()
        }
    }

    /// Trigger links are delivered by the event router and do not
    /// constrain execution order.
    pub fn is_event(&self) -> bool {
        self.link_type == SlotType::Event
    }

    /// Check if this link touches a specific node
    pub fn involves_node(&self, node_id: NodeId) -> bool {
        self.origin_id == node_id || self.target_id == node_id
    }
}

#[derive(Serialize, Deserialize)]
struct LinkRecord(LinkId, NodeId, usize, NodeId, usize, SlotType);

impl From<Link> for LinkRecord {
    fn from(link: Link) -> Self {
        Self(
            link.id,
            link.origin_id,
            link.origin_slot,
            link.target_id,
            link.target_slot,
            link.link_type,
        )
    }
}

impl From<LinkRecord> for Link {
    fn from(record: LinkRecord) -> Self {
        let LinkRecord(id, origin_id, origin_slot, target_id, target_slot, link_type) = record;
        Self::new(id, origin_id, origin_slot, target_id, target_slot, link_type)
    }
}
