// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph data structure: owns nodes, the link table and graph-level I/O.
//!
//! Nodes live in an insertion-ordered table keyed by [`NodeId`]; a node only
//! keeps the [`GraphId`] of its owner. Every structural mutation bumps the
//! graph version, which invalidates the cached execution order (see
//! [`crate::scheduler`]).

use crate::context::EngineConfig;
use crate::evaluation::{self, NodeContext};
use crate::link::{Link, LinkId};
use crate::node::{ActionOptions, Node, NodeBehavior, NodeError, NodeId, NodeMode};
use crate::nodes::boundary::GRAPH_INPUT_TYPE;
use crate::nodes::subgraph::sync_boundary_slots;
use crate::scheduler::OrderCache;
use crate::slot::{is_valid_connection, InputSlot, OutputSlot, SlotDirection, SlotType};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// Unique identifier for a graph instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphId(pub Uuid);

impl GraphId {
    /// Create a new random graph ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GraphId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run state of a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraphStatus {
    /// Not running; `update` does nothing
    #[default]
    Stopped,
    /// Running; `update` steps the graph
    Running,
    /// Running but suspended
    Paused,
}

/// Handle to the subgraph node that owns a nested graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphParent {
    /// Graph containing the subgraph node
    pub graph: GraphId,
    /// The subgraph node
    pub node: NodeId,
}

/// A named graph-level input or output
#[derive(Debug, Clone, PartialEq)]
pub struct GraphPort {
    /// Port name
    pub name: String,
    /// Port type
    pub slot_type: SlotType,
    /// Current value
    pub value: Option<Value>,
}

/// Edit to the graph's named inputs/outputs, mirrored by the owning
/// subgraph node onto its own slots
#[derive(Debug, Clone, PartialEq)]
pub enum BoundaryChange {
    /// Input added
    InputAdded {
        /// Port name
        name: String,
        /// Port type
        slot_type: SlotType,
    },
    /// Input renamed
    InputRenamed {
        /// Previous name
        old: String,
        /// New name
        new: String,
    },
    /// Input type changed
    InputRetyped {
        /// Port name
        name: String,
        /// New type
        slot_type: SlotType,
    },
    /// Input removed
    InputRemoved {
        /// Port name
        name: String,
    },
    /// Output added
    OutputAdded {
        /// Port name
        name: String,
        /// Port type
        slot_type: SlotType,
    },
    /// Output renamed
    OutputRenamed {
        /// Previous name
        old: String,
        /// New name
        new: String,
    },
    /// Output type changed
    OutputRetyped {
        /// Port name
        name: String,
        /// New type
        slot_type: SlotType,
    },
    /// Output removed
    OutputRemoved {
        /// Port name
        name: String,
    },
}

/// Host callbacks
pub trait GraphHooks {
    /// Before any node of a step runs
    fn on_before_step(&mut self, _iteration: u64) {}
    /// After every node of a step ran
    fn on_after_step(&mut self, _iteration: u64) {}
    /// A graph-level event left a root graph
    fn on_trigger(&mut self, _event: &str, _param: &Value) {}
    /// A node joined the graph
    fn on_node_added(&mut self, _node: NodeId) {}
    /// A node left the graph
    fn on_node_removed(&mut self, _node: NodeId) {}
}

/// A node graph
pub struct Graph {
    id: GraphId,
    pub(crate) config: EngineConfig,
    pub(crate) nodes: IndexMap<NodeId, Node>,
    pub(crate) links: IndexMap<LinkId, Link>,
    inputs: IndexMap<String, GraphPort>,
    outputs: IndexMap<String, GraphPort>,
    boundary_changes: Vec<BoundaryChange>,
    outbox: Vec<(String, Value)>,
    pub(crate) parent: Option<GraphParent>,
    pub(crate) groups: Vec<Value>,
    pub(crate) settings: IndexMap<String, Value>,
    pub(crate) extra: IndexMap<String, Value>,
    pub(crate) last_node_id: u64,
    pub(crate) last_link_id: u64,
    pub(crate) status: GraphStatus,
    pub(crate) enabled: bool,
    pub(crate) iteration: u64,
    pub(crate) globaltime: f64,
    pub(crate) elapsed_time: f64,
    pub(crate) last_update: Option<Instant>,
    pub(crate) version: u64,
    pub(crate) order_cache: Option<OrderCache>,
    hooks: Option<Box<dyn GraphHooks>>,
}

impl Graph {
    /// Create a new empty graph
    pub fn new(config: EngineConfig) -> Self {
        Self {
            id: GraphId::new(),
            config,
            nodes: IndexMap::new(),
            links: IndexMap::new(),
            inputs: IndexMap::new(),
            outputs: IndexMap::new(),
            boundary_changes: Vec::new(),
            outbox: Vec::new(),
            parent: None,
            groups: Vec::new(),
            settings: IndexMap::new(),
            extra: IndexMap::new(),
            last_node_id: 0,
            last_link_id: 0,
            status: GraphStatus::Stopped,
            enabled: true,
            iteration: 0,
            globaltime: 0.0,
            elapsed_time: 0.0,
            last_update: None,
            version: 0,
            order_cache: None,
            hooks: None,
        }
    }

    /// Graph ID
    pub fn id(&self) -> GraphId {
        self.id
    }

    /// Settings this graph runs with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Owning subgraph node, for nested graphs
    pub fn parent(&self) -> Option<GraphParent> {
        self.parent
    }

    /// Structural version; changes on every topology edit
    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    /// Install host hooks, returning the previous ones
    pub fn set_hooks(&mut self, hooks: Box<dyn GraphHooks>) -> Option<Box<dyn GraphHooks>> {
        self.hooks.replace(hooks)
    }

    /// Remove host hooks
    pub fn take_hooks(&mut self) -> Option<Box<dyn GraphHooks>> {
        self.hooks.take()
    }

    pub(crate) fn with_hooks(&mut self, call: impl FnOnce(&mut dyn GraphHooks)) {
        if let Some(hooks) = self.hooks.as_deref_mut() {
            call(hooks);
        }
    }

    /// Run a callback on a node's behavior with a context for that node.
    ///
    /// The behavior is taken out of the node for the duration of the call,
    /// so a re-entrant call for the same node yields `None`.
    pub(crate) fn with_behavior<R>(
        &mut self,
        id: NodeId,
        depth: usize,
        call: impl FnOnce(&mut dyn NodeBehavior, &mut NodeContext<'_>) -> R,
    ) -> Option<R> {
        let mut behavior = self.nodes.get_mut(&id)?.behavior.take()?;
        let result = {
            let mut ctx = NodeContext::new(self, id, depth);
            call(behavior.as_mut(), &mut ctx)
        };
        if let Some(node) = self.nodes.get_mut(&id) {
            node.behavior = Some(behavior);
        }
        Some(result)
    }

    /// Apply the error policy to a failed node callback
    pub(crate) fn absorb_node_error(
        &self,
        node: NodeId,
        phase: NodePhase,
        error: NodeError,
    ) -> Result<(), GraphError> {
        match error {
            NodeError::Graph(inner) if inner.is_fatal() || !self.config.catch_errors => Err(*inner),
            error if self.config.catch_errors => {
                tracing::error!(node = %node, %phase, %error, "node callback failed");
                Ok(())
            }
            error => Err(GraphError::Node {
                node,
                phase,
                source: error,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    /// Add a node to the graph.
    ///
    /// The node keeps its requested id unless it is unassigned or already
    /// taken, in which case a fresh one is allocated.
    pub fn add_node(&mut self, mut node: Node) -> NodeId {
        let id = self.claim_node_id(node.id);
        node.id = id;
        node.graph = Some(self.id);
        tracing::debug!(node = %id, type_name = %node.type_name, "node added");
        self.nodes.insert(id, node);
        self.bump_version();
        self.with_behavior(id, 0, |behavior, ctx| behavior.on_added(ctx));
        self.with_hooks(|hooks| hooks.on_node_added(id));
        id
    }

    fn claim_node_id(&mut self, requested: NodeId) -> NodeId {
        if !requested.is_unassigned() && !self.nodes.contains_key(&requested) {
            if let NodeId::Index(index) = requested {
                self.last_node_id = self.last_node_id.max(index);
            }
            return requested;
        }
        if self.config.use_uuids {
            NodeId::new_uuid()
        } else {
            self.last_node_id += 1;
            NodeId::Index(self.last_node_id)
        }
    }

    /// Remove a node, severing every link that touches it
    pub fn remove_node(&mut self, node_id: NodeId) -> Option<Node> {
        if !self.nodes.contains_key(&node_id) {
            return None;
        }
        self.with_behavior(node_id, 0, |behavior, ctx| behavior.on_removed(ctx));

        let touching: Vec<LinkId> = self
            .links
            .values()
            .filter(|link| link.involves_node(node_id))
            .map(|link| link.id)
            .collect();
        for link_id in touching {
            self.disconnect(link_id);
        }

        let mut node = self.nodes.shift_remove(&node_id)?;
        node.graph = None;
        self.bump_version();
        tracing::debug!(node = %node_id, "node removed");
        self.with_hooks(|hooks| hooks.on_node_removed(node_id));
        Some(node)
    }

    /// Get a node by ID
    pub fn node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    /// Get a mutable node by ID
    pub fn node_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }

    /// All nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// All node IDs in insertion order
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Get the number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// IDs of every node of a type
    pub fn find_nodes_by_type(&self, type_name: &str) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|node| node.type_name == type_name)
            .map(|node| node.id)
            .collect()
    }

    /// First node with a title
    pub fn find_node_by_title(&self, title: &str) -> Option<NodeId> {
        self.nodes
            .values()
            .find(|node| node.title == title)
            .map(|node| node.id)
    }

    /// Downcast a node's behavior
    pub fn behavior<T: NodeBehavior>(&self, node_id: NodeId) -> Option<&T> {
        self.nodes.get(&node_id)?.behavior_as::<T>()
    }

    /// Mutably downcast a node's behavior
    pub fn behavior_mut<T: NodeBehavior>(&mut self, node_id: NodeId) -> Option<&mut T> {
        self.nodes.get_mut(&node_id)?.behavior_as_mut::<T>()
    }

    /// Write a property and notify the node
    pub fn set_property(
        &mut self,
        node_id: NodeId,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(GraphError::NodeNotFound(node_id))?;
        let previous = node.properties.insert(name.to_string(), value.into());
        let outcome = self.with_behavior(node_id, 0, |behavior, ctx| {
            behavior.on_property_changed(ctx, name, previous.as_ref())
        });
        match outcome {
            Some(Err(error)) => self.absorb_node_error(node_id, NodePhase::PropertyChanged, error),
            _ => Ok(()),
        }
    }

    /// Change a node's mode
    pub fn set_mode(&mut self, node_id: NodeId, mode: NodeMode) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(GraphError::NodeNotFound(node_id))?;
        if node.mode != mode {
            tracing::debug!(node = %node_id, from = node.mode.name(), to = mode.name(), "mode changed");
            node.mode = mode;
            node.pending_event = false;
            self.bump_version();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Link table
    // ------------------------------------------------------------------

    /// Link an output slot to an input slot.
    ///
    /// A link already attached to the input is replaced.
    pub fn connect(
        &mut self,
        origin: NodeId,
        origin_slot: usize,
        target: NodeId,
        target_slot: usize,
    ) -> Result<LinkId, ConnectionError> {
        let (link_type, replaced, fanout) = {
            let origin_node = self
                .nodes
                .get(&origin)
                .ok_or(ConnectionError::NodeNotFound(origin))?;
            let target_node = self
                .nodes
                .get(&target)
                .ok_or(ConnectionError::NodeNotFound(target))?;
            let output = origin_node
                .outputs
                .get(origin_slot)
                .ok_or(ConnectionError::SlotNotFound {
                    node: origin,
                    slot: origin_slot,
                    direction: SlotDirection::Output,
                })?;
            let input = target_node
                .inputs
                .get(target_slot)
                .ok_or(ConnectionError::SlotNotFound {
                    node: target,
                    slot: target_slot,
                    direction: SlotDirection::Input,
                })?;

            if !is_valid_connection(&output.slot_type, &input.slot_type) {
                return Err(ConnectionError::IncompatibleType {
                    output: output.slot_type.clone(),
                    input: input.slot_type.clone(),
                });
            }
            if origin == target {
                return Err(ConnectionError::SelfLoop(origin));
            }

            let fanout = if output.slot_type == SlotType::Event && !self.config.multi_output_events {
                output.links.clone()
            } else {
                Vec::new()
            };
            (
                Link::resolve_type(&output.slot_type, &input.slot_type),
                input.link,
                fanout,
            )
        };

        if let Some(previous) = replaced {
            tracing::debug!(link = %previous, node = %target, slot = target_slot, "replacing input link");
            self.disconnect(previous);
        }
        for previous in fanout {
            self.disconnect(previous);
        }

        self.last_link_id += 1;
        let id = LinkId(self.last_link_id);
        self.links.insert(
            id,
            Link::new(id, origin, origin_slot, target, target_slot, link_type),
        );
        if let Some(output) = self
            .nodes
            .get_mut(&origin)
            .and_then(|node| node.outputs.get_mut(origin_slot))
        {
            output.links.push(id);
        }
        if let Some(input) = self
            .nodes
            .get_mut(&target)
            .and_then(|node| node.inputs.get_mut(target_slot))
        {
            input.link = Some(id);
        }
        self.bump_version();
        tracing::debug!(link = %id, %origin, origin_slot, %target, target_slot, "connected");
        Ok(id)
    }

    /// Link slots by name
    pub fn connect_by_name(
        &mut self,
        origin: NodeId,
        output: &str,
        target: NodeId,
        input: &str,
    ) -> Result<LinkId, ConnectionError> {
        let origin_slot = self
            .nodes
            .get(&origin)
            .ok_or(ConnectionError::NodeNotFound(origin))?
            .find_output(output)
            .ok_or_else(|| ConnectionError::SlotNameNotFound {
                node: origin,
                name: output.to_string(),
            })?;
        let target_slot = self
            .nodes
            .get(&target)
            .ok_or(ConnectionError::NodeNotFound(target))?
            .find_input(input)
            .ok_or_else(|| ConnectionError::SlotNameNotFound {
                node: target,
                name: input.to_string(),
            })?;
        self.connect(origin, origin_slot, target, target_slot)
    }

    /// Remove a link
    pub fn disconnect(&mut self, link_id: LinkId) -> Option<Link> {
        let link = self.links.shift_remove(&link_id)?;
        if let Some(output) = self
            .nodes
            .get_mut(&link.origin_id)
            .and_then(|node| node.outputs.get_mut(link.origin_slot))
        {
            output.links.retain(|id| *id != link_id);
        }
        if let Some(input) = self
            .nodes
            .get_mut(&link.target_id)
            .and_then(|node| node.inputs.get_mut(link.target_slot))
        {
            if input.link == Some(link_id) {
                input.link = None;
            }
        }
        self.bump_version();
        tracing::trace!(link = %link_id, "disconnected");
        Some(link)
    }

    /// Remove the link attached to an input
    pub fn disconnect_input(&mut self, node_id: NodeId, slot: usize) -> Option<Link> {
        let link_id = self.nodes.get(&node_id)?.inputs.get(slot)?.link?;
        self.disconnect(link_id)
    }

    /// Remove every link leaving an output, returning how many were removed
    pub fn disconnect_output(&mut self, node_id: NodeId, slot: usize) -> usize {
        let link_ids = self
            .nodes
            .get(&node_id)
            .and_then(|node| node.outputs.get(slot))
            .map(|output| output.links.clone())
            .unwrap_or_default();
        link_ids
            .into_iter()
            .filter_map(|id| self.disconnect(id))
            .count()
    }

    /// Get a link by ID
    pub fn link(&self, link_id: LinkId) -> Option<&Link> {
        self.links.get(&link_id)
    }

    /// All links in creation order
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    /// Get the number of links
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Links leaving an output slot
    pub fn links_for_output(&self, node_id: NodeId, slot: usize) -> impl Iterator<Item = &Link> + '_ {
        self.nodes
            .get(&node_id)
            .and_then(|node| node.outputs.get(slot))
            .into_iter()
            .flat_map(|output| output.links.iter())
            .filter_map(move |id| self.links.get(id))
    }

    /// The link entering an input slot
    pub fn link_for_input(&self, node_id: NodeId, slot: usize) -> Option<&Link> {
        let link_id = self.nodes.get(&node_id)?.inputs.get(slot)?.link?;
        self.links.get(&link_id)
    }

    // ------------------------------------------------------------------
    // Slot edits that keep the link table consistent
    // ------------------------------------------------------------------

    /// Append an input slot to a node
    pub fn add_node_input(&mut self, node_id: NodeId, slot: InputSlot) -> Result<usize, GraphError> {
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(GraphError::NodeNotFound(node_id))?;
        Ok(node.add_input(slot))
    }

    /// Append an output slot to a node
    pub fn add_node_output(&mut self, node_id: NodeId, slot: OutputSlot) -> Result<usize, GraphError> {
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(GraphError::NodeNotFound(node_id))?;
        Ok(node.add_output(slot))
    }

    /// Remove an input slot; links on later inputs are re-indexed
    pub fn remove_node_input(&mut self, node_id: NodeId, slot: usize) -> Result<InputSlot, GraphError> {
        self.slot_exists(node_id, slot, SlotDirection::Input)?;
        self.disconnect_input(node_id, slot);

        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(GraphError::NodeNotFound(node_id))?;
        let removed = node.inputs.remove(slot);
        node.size = node.compute_size();
        let shifted: Vec<LinkId> = node.inputs[slot..]
            .iter()
            .filter_map(|input| input.link)
            .collect();
        for link_id in shifted {
            if let Some(link) = self.links.get_mut(&link_id) {
                link.target_slot -= 1;
            }
        }
        self.bump_version();
        Ok(removed)
    }

    /// Remove an output slot; links on later outputs are re-indexed
    pub fn remove_node_output(&mut self, node_id: NodeId, slot: usize) -> Result<OutputSlot, GraphError> {
        self.slot_exists(node_id, slot, SlotDirection::Output)?;
        self.disconnect_output(node_id, slot);

        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(GraphError::NodeNotFound(node_id))?;
        let removed = node.outputs.remove(slot);
        node.size = node.compute_size();
        let shifted: Vec<LinkId> = node.outputs[slot..]
            .iter()
            .flat_map(|output| output.links.iter().copied())
            .collect();
        for link_id in shifted {
            if let Some(link) = self.links.get_mut(&link_id) {
                link.origin_slot -= 1;
            }
        }
        self.bump_version();
        Ok(removed)
    }

    /// Rename an input slot
    pub fn rename_node_input(&mut self, node_id: NodeId, slot: usize, name: &str) -> Result<(), GraphError> {
        self.slot_exists(node_id, slot, SlotDirection::Input)?;
        if let Some(input) = self
            .nodes
            .get_mut(&node_id)
            .and_then(|node| node.inputs.get_mut(slot))
        {
            input.name = name.to_string();
        }
        Ok(())
    }

    /// Rename an output slot
    pub fn rename_node_output(&mut self, node_id: NodeId, slot: usize, name: &str) -> Result<(), GraphError> {
        self.slot_exists(node_id, slot, SlotDirection::Output)?;
        if let Some(output) = self
            .nodes
            .get_mut(&node_id)
            .and_then(|node| node.outputs.get_mut(slot))
        {
            output.name = name.to_string();
        }
        Ok(())
    }

    /// Change an input's type, dropping its link if it no longer type-checks
    pub fn set_node_input_type(
        &mut self,
        node_id: NodeId,
        slot: usize,
        slot_type: SlotType,
    ) -> Result<(), GraphError> {
        self.slot_exists(node_id, slot, SlotDirection::Input)?;
        let link = self.link_for_input(node_id, slot).cloned();
        if let Some(input) = self
            .nodes
            .get_mut(&node_id)
            .and_then(|node| node.inputs.get_mut(slot))
        {
            if input.slot_type == slot_type {
                return Ok(());
            }
            input.slot_type = slot_type.clone();
        }
        if let Some(link) = link {
            self.revalidate_link(link.id, None, Some(&slot_type));
        }
        self.bump_version();
        Ok(())
    }

    /// Change an output's type, dropping links that no longer type-check
    pub fn set_node_output_type(
        &mut self,
        node_id: NodeId,
        slot: usize,
        slot_type: SlotType,
    ) -> Result<(), GraphError> {
        self.slot_exists(node_id, slot, SlotDirection::Output)?;
        let links: Vec<LinkId> = self.links_for_output(node_id, slot).map(|link| link.id).collect();
        if let Some(output) = self
            .nodes
            .get_mut(&node_id)
            .and_then(|node| node.outputs.get_mut(slot))
        {
            if output.slot_type == slot_type {
                return Ok(());
            }
            output.slot_type = slot_type.clone();
        }
        for link_id in links {
            self.revalidate_link(link_id, Some(&slot_type), None);
        }
        self.bump_version();
        Ok(())
    }

    fn revalidate_link(&mut self, link_id: LinkId, origin: Option<&SlotType>, target: Option<&SlotType>) {
        let Some(link) = self.links.get(&link_id) else {
            return;
        };
        let origin_type = match origin {
            Some(slot_type) => Some(slot_type.clone()),
            None => self
                .nodes
                .get(&link.origin_id)
                .and_then(|node| node.outputs.get(link.origin_slot))
                .map(|output| output.slot_type.clone()),
        };
        let target_type = match target {
            Some(slot_type) => Some(slot_type.clone()),
            None => self
                .nodes
                .get(&link.target_id)
                .and_then(|node| node.inputs.get(link.target_slot))
                .map(|input| input.slot_type.clone()),
        };
        match (origin_type, target_type) {
            (Some(origin_type), Some(target_type)) if is_valid_connection(&origin_type, &target_type) => {
                if let Some(link) = self.links.get_mut(&link_id) {
                    link.link_type = Link::resolve_type(&origin_type, &target_type);
                }
            }
            _ => {
                tracing::debug!(link = %link_id, "link no longer type-checks; disconnecting");
                self.disconnect(link_id);
            }
        }
    }

    fn slot_exists(&self, node_id: NodeId, slot: usize, direction: SlotDirection) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get(&node_id)
            .ok_or(GraphError::NodeNotFound(node_id))?;
        let count = match direction {
            SlotDirection::Input => node.inputs.len(),
            SlotDirection::Output => node.outputs.len(),
        };
        if slot < count {
            Ok(())
        } else {
            Err(GraphError::Connection(ConnectionError::SlotNotFound {
                node: node_id,
                slot,
                direction,
            }))
        }
    }

    // ------------------------------------------------------------------
    // Graph-level inputs and outputs
    // ------------------------------------------------------------------

    /// Declare a named graph input. Returns false if the name is taken.
    pub fn add_input(&mut self, name: &str, slot_type: SlotType, value: Option<Value>) -> bool {
        if self.inputs.contains_key(name) {
            return false;
        }
        self.inputs.insert(
            name.to_string(),
            GraphPort {
                name: name.to_string(),
                slot_type: slot_type.clone(),
                value,
            },
        );
        self.boundary_changes.push(BoundaryChange::InputAdded {
            name: name.to_string(),
            slot_type,
        });
        self.bump_version();
        true
    }

    /// Rename a graph input, keeping its position
    pub fn rename_input(&mut self, old: &str, new: &str) -> bool {
        if old == new || !self.inputs.contains_key(old) || self.inputs.contains_key(new) {
            return false;
        }
        self.inputs = rename_port(std::mem::take(&mut self.inputs), old, new);
        self.boundary_changes.push(BoundaryChange::InputRenamed {
            old: old.to_string(),
            new: new.to_string(),
        });
        self.bump_version();
        true
    }

    /// Change a graph input's type
    pub fn change_input_type(&mut self, name: &str, slot_type: SlotType) -> bool {
        let Some(port) = self.inputs.get_mut(name) else {
            return false;
        };
        if port.slot_type == slot_type {
            return true;
        }
        port.slot_type = slot_type.clone();
        self.boundary_changes.push(BoundaryChange::InputRetyped {
            name: name.to_string(),
            slot_type,
        });
        self.bump_version();
        true
    }

    /// Remove a graph input
    pub fn remove_input(&mut self, name: &str) -> bool {
        if self.inputs.shift_remove(name).is_none() {
            return false;
        }
        self.boundary_changes.push(BoundaryChange::InputRemoved {
            name: name.to_string(),
        });
        self.bump_version();
        true
    }

    /// Set the value of a graph input
    pub fn set_input_data(&mut self, name: &str, value: impl Into<Value>) -> bool {
        match self.inputs.get_mut(name) {
            Some(port) => {
                port.value = Some(value.into());
                true
            }
            None => false,
        }
    }

    /// Clear the value of a graph input
    pub fn clear_input_data(&mut self, name: &str) {
        if let Some(port) = self.inputs.get_mut(name) {
            port.value = None;
        }
    }

    /// Current value of a graph input
    pub fn input_data(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)?.value.as_ref()
    }

    /// A graph input by name
    pub fn graph_input(&self, name: &str) -> Option<&GraphPort> {
        self.inputs.get(name)
    }

    /// All graph inputs in declaration order
    pub fn inputs(&self) -> impl Iterator<Item = &GraphPort> {
        self.inputs.values()
    }

    /// Declare a named graph output. Returns false if the name is taken.
    pub fn add_output(&mut self, name: &str, slot_type: SlotType, value: Option<Value>) -> bool {
        if self.outputs.contains_key(name) {
            return false;
        }
        self.outputs.insert(
            name.to_string(),
            GraphPort {
                name: name.to_string(),
                slot_type: slot_type.clone(),
                value,
            },
        );
        self.boundary_changes.push(BoundaryChange::OutputAdded {
            name: name.to_string(),
            slot_type,
        });
        self.bump_version();
        true
    }

    /// Rename a graph output, keeping its position
    pub fn rename_output(&mut self, old: &str, new: &str) -> bool {
        if old == new || !self.outputs.contains_key(old) || self.outputs.contains_key(new) {
            return false;
        }
        self.outputs = rename_port(std::mem::take(&mut self.outputs), old, new);
        self.boundary_changes.push(BoundaryChange::OutputRenamed {
            old: old.to_string(),
            new: new.to_string(),
        });
        self.bump_version();
        true
    }

    /// Change a graph output's type
    pub fn change_output_type(&mut self, name: &str, slot_type: SlotType) -> bool {
        let Some(port) = self.outputs.get_mut(name) else {
            return false;
        };
        if port.slot_type == slot_type {
            return true;
        }
        port.slot_type = slot_type.clone();
        self.boundary_changes.push(BoundaryChange::OutputRetyped {
            name: name.to_string(),
            slot_type,
        });
        self.bump_version();
        true
    }

    /// Remove a graph output
    pub fn remove_output(&mut self, name: &str) -> bool {
        if self.outputs.shift_remove(name).is_none() {
            return false;
        }
        self.boundary_changes.push(BoundaryChange::OutputRemoved {
            name: name.to_string(),
        });
        self.bump_version();
        true
    }

    /// Set the value of a graph output
    pub fn set_output_data(&mut self, name: &str, value: impl Into<Value>) -> bool {
        match self.outputs.get_mut(name) {
            Some(port) => {
                port.value = Some(value.into());
                true
            }
            None => false,
        }
    }

    /// Clear the value of a graph output
    pub fn clear_output_data(&mut self, name: &str) {
        if let Some(port) = self.outputs.get_mut(name) {
            port.value = None;
        }
    }

    /// Current value of a graph output
    pub fn output_data(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)?.value.as_ref()
    }

    /// A graph output by name
    pub fn graph_output(&self, name: &str) -> Option<&GraphPort> {
        self.outputs.get(name)
    }

    /// All graph outputs in declaration order
    pub fn outputs(&self) -> impl Iterator<Item = &GraphPort> {
        self.outputs.values()
    }

    /// Drain the boundary edits recorded since the last call
    pub fn take_boundary_changes(&mut self) -> Vec<BoundaryChange> {
        std::mem::take(&mut self.boundary_changes)
    }

    /// Run an edit on a subgraph node's inner graph, then mirror the inner
    /// boundary onto the node's slots.
    pub fn edit_subgraph<R>(
        &mut self,
        node_id: NodeId,
        edit: impl FnOnce(&mut Graph) -> R,
    ) -> Result<R, GraphError> {
        let node = self
            .nodes
            .get(&node_id)
            .ok_or(GraphError::NodeNotFound(node_id))?;
        if !node.has_subgraph() {
            return Err(GraphError::NotASubgraph(node_id));
        }
        self.with_behavior(node_id, 0, |behavior, ctx| {
            let inner = behavior.inner_graph_mut()?;
            let result = edit(inner);
            Some(sync_boundary_slots(ctx, inner).map(|()| result))
        })
        .flatten()
        .ok_or(GraphError::NotASubgraph(node_id))?
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Fire an output slot from the host, cascading synchronously
    pub fn trigger_slot(&mut self, node_id: NodeId, slot: usize, param: &Value) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&node_id) {
            return Err(GraphError::NodeNotFound(node_id));
        }
        evaluation::trigger_slot(self, node_id, slot, param, 0)
    }

    /// Call a node's action handler directly
    pub fn invoke_action(&mut self, node_id: NodeId, action: &str, param: &Value) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&node_id) {
            return Err(GraphError::NodeNotFound(node_id));
        }
        evaluation::deliver_action(self, node_id, action, param, &ActionOptions::default())
    }

    /// Graph-level event entry: delivered to the graph input node with
    /// that name. Returns false if there is none.
    pub fn on_action(&mut self, action: &str, param: &Value) -> Result<bool, GraphError> {
        self.deliver_graph_action(action, param, 0)
    }

    pub(crate) fn deliver_graph_action(
        &mut self,
        action: &str,
        param: &Value,
        depth: usize,
    ) -> Result<bool, GraphError> {
        let entry = self
            .nodes
            .values()
            .find(|node| {
                node.type_name == GRAPH_INPUT_TYPE
                    && node.property("name").and_then(Value::as_str) == Some(action)
            })
            .map(|node| node.id);
        let Some(entry) = entry else {
            tracing::debug!(graph = %self.id, action, "no graph input for action");
            return Ok(false);
        };
        let options = ActionOptions { link: None, depth };
        evaluation::deliver_action(self, entry, action, param, &options)?;
        Ok(true)
    }

    /// Graph-level event exit. Nested graphs queue the event for the owning
    /// subgraph node; root graphs hand it to the host hooks.
    pub fn trigger(&mut self, event: &str, param: &Value) {
        if self.parent.is_some() {
            self.outbox.push((event.to_string(), param.clone()));
        } else if self.hooks.is_some() {
            self.with_hooks(|hooks| hooks.on_trigger(event, param));
        } else {
            tracing::debug!(graph = %self.id, event, "graph event with no listener");
        }
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<(String, Value)> {
        std::mem::take(&mut self.outbox)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Current run state
    pub fn status(&self) -> GraphStatus {
        self.status
    }

    /// Start running. Returns false if already running.
    pub fn start(&mut self) -> bool {
        match self.status {
            GraphStatus::Running => false,
            GraphStatus::Paused => self.resume(),
            GraphStatus::Stopped => {
                self.status = GraphStatus::Running;
                self.globaltime = 0.0;
                self.elapsed_time = 0.0;
                self.last_update = None;
                tracing::debug!(graph = %self.id, "graph started");
                self.broadcast(|behavior, ctx| behavior.on_start(ctx));
                true
            }
        }
    }

    /// Stop running. Returns false if already stopped.
    pub fn stop(&mut self) -> bool {
        if self.status == GraphStatus::Stopped {
            return false;
        }
        self.status = GraphStatus::Stopped;
        tracing::debug!(graph = %self.id, "graph stopped");
        self.broadcast(|behavior, ctx| behavior.on_stop(ctx));
        true
    }

    /// Pause a running graph. Returns false unless it was running.
    pub fn pause(&mut self) -> bool {
        if self.status != GraphStatus::Running {
            return false;
        }
        self.status = GraphStatus::Paused;
        self.broadcast(|behavior, ctx| behavior.on_pause(ctx));
        true
    }

    /// Resume a paused graph. Returns false unless it was paused.
    pub fn resume(&mut self) -> bool {
        if self.status != GraphStatus::Paused {
            return false;
        }
        self.status = GraphStatus::Running;
        self.last_update = None;
        self.broadcast(|behavior, ctx| behavior.on_unpause(ctx));
        true
    }

    fn broadcast(&mut self, call: impl Fn(&mut dyn NodeBehavior, &mut NodeContext<'_>)) {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            self.with_behavior(id, 0, |behavior, ctx| call(behavior, ctx));
        }
    }

    /// Whether steps evaluate nodes
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Disable to let steps advance the clock without evaluating nodes
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Remove every node and link and reset counters and clock
    pub fn clear(&mut self) {
        self.stop();
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            self.with_behavior(id, 0, |behavior, ctx| behavior.on_removed(ctx));
        }
        self.nodes.clear();
        self.links.clear();
        self.inputs.clear();
        self.outputs.clear();
        self.boundary_changes.clear();
        self.outbox.clear();
        self.groups.clear();
        self.settings.clear();
        self.extra.clear();
        self.last_node_id = 0;
        self.last_link_id = 0;
        self.iteration = 0;
        self.globaltime = 0.0;
        self.elapsed_time = 0.0;
        self.last_update = None;
        self.bump_version();
    }

    /// Steps run so far
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Seconds accumulated since start
    pub fn globaltime(&self) -> f64 {
        self.globaltime
    }

    /// Seconds covered by the last step
    pub fn elapsed_time(&self) -> f64 {
        self.elapsed_time
    }

    /// Opaque visual groups
    pub fn groups(&self) -> &[Value] {
        &self.groups
    }

    /// Free-form graph settings, persisted as `config`
    pub fn settings_mut(&mut self) -> &mut IndexMap<String, Value> {
        &mut self.settings
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("nodes", &self.nodes.len())
            .field("links", &self.links.len())
            .field("status", &self.status)
            .field("iteration", &self.iteration)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

fn rename_port(ports: IndexMap<String, GraphPort>, old: &str, new: &str) -> IndexMap<String, GraphPort> {
    ports
        .into_iter()
        .map(|(name, mut port)| {
            if name == old {
                port.name = new.to_string();
                (new.to_string(), port)
            } else {
                (name, port)
            }
        })
        .collect()
}

/// Which callback failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    /// `on_execute`
    Execute,
    /// `on_action`
    Action,
    /// `on_property_changed`
    PropertyChanged,
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Execute => f.write_str("execute"),
            Self::Action => f.write_str("action"),
            Self::PropertyChanged => f.write_str("property change"),
        }
    }
}

/// Error when creating a link
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Node not found
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// Slot index out of range
    #[error("Node {node} has no {direction} slot {slot}")]
    SlotNotFound {
        /// Node
        node: NodeId,
        /// Slot index
        slot: usize,
        /// Slot direction
        direction: SlotDirection,
    },

    /// Slot name not found
    #[error("Node {node} has no slot named '{name}'")]
    SlotNameNotFound {
        /// Node
        node: NodeId,
        /// Slot name
        name: String,
    },

    /// Slot types do not unify
    #[error("Incompatible slot types: {output} -> {input}")]
    IncompatibleType {
        /// Output type
        output: SlotType,
        /// Input type
        input: SlotType,
    },

    /// Output and input on the same node
    #[error("Self-loop not allowed on node {0}")]
    SelfLoop(NodeId),
}

/// Error raised by graph operations and steps
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Node not found
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// Link could not be made
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A node callback failed and errors are not being caught
    #[error("Node {node} failed during {phase}: {source}")]
    Node {
        /// Failing node
        node: NodeId,
        /// Failing callback
        phase: NodePhase,
        /// Underlying error
        source: NodeError,
    },

    /// An event cascade went deeper than `max_event_depth`
    #[error("Event cascade from node {node} exceeded depth {limit}")]
    EventDepthExceeded {
        /// Node whose output was being triggered
        node: NodeId,
        /// Configured limit
        limit: usize,
    },

    /// The node has no inner graph
    #[error("Node {0} is not a subgraph")]
    NotASubgraph(NodeId),
}

impl GraphError {
    /// Errors that are never swallowed by `catch_errors`
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::EventDepthExceeded { .. } => true,
            Self::Node {
                source: NodeError::Graph(inner),
                ..
            } => inner.is_fatal(),
            _ => false,
        }
    }
}
