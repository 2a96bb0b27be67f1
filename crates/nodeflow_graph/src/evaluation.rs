// SPDX-License-Identifier: MIT OR Apache-2.0
//! Node evaluation context and the event router.
//!
//! Node callbacks receive a [`NodeContext`] scoped to the node being run. Data
//! inputs are read lazily from the most recent value on the linked output, so
//! a node always sees what its upstream produced earlier in the same step (or
//! in the previous step, inside a cycle).
//!
//! Events are routed synchronously and depth-first: triggering an output calls
//! the action handler of every linked node before returning.

use crate::graph::{Graph, GraphError, NodePhase};
use crate::node::{ActionOptions, Node, NodeError, NodeId, NodeMode};
use crate::slot::SlotType;
use serde_json::Value;

/// Access to the graph from inside a node callback
pub struct NodeContext<'a> {
    graph: &'a mut Graph,
    node: NodeId,
    depth: usize,
}

impl<'a> NodeContext<'a> {
    pub(crate) fn new(graph: &'a mut Graph, node: NodeId, depth: usize) -> Self {
        Self { graph, node, depth }
    }

    /// ID of the node being run
    pub fn id(&self) -> NodeId {
        self.node
    }

    /// Current event cascade depth (0 outside of events)
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The graph containing the node
    pub fn graph(&self) -> &Graph {
        &*self.graph
    }

    /// Mutable access to the containing graph
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut *self.graph
    }

    /// The node being run
    pub fn node(&self) -> Option<&Node> {
        self.graph.node(self.node)
    }

    /// The node being run, mutably
    pub fn node_mut(&mut self) -> Option<&mut Node> {
        self.graph.node_mut(self.node)
    }

    /// Most recent value on the output linked to an input, without copying
    pub fn input_ref(&self, slot: usize) -> Option<&Value> {
        let link = self.graph.link_for_input(self.node, slot)?;
        self.graph
            .node(link.origin_id)?
            .outputs
            .get(link.origin_slot)?
            .value
            .as_ref()
    }

    /// Most recent value on the output linked to an input.
    ///
    /// `None` if the input is unconnected or upstream has produced nothing.
    pub fn input_data(&self, slot: usize) -> Option<Value> {
        self.input_ref(slot).cloned()
    }

    /// Linked value, falling back to the input's default value
    pub fn input_data_or_default(&self, slot: usize) -> Option<Value> {
        self.input_data(slot).or_else(|| {
            self.node()?
                .inputs
                .get(slot)?
                .default_value
                .clone()
        })
    }

    /// Linked value of the first input with this name
    pub fn input_data_by_name(&self, name: &str) -> Option<Value> {
        let slot = self.node()?.find_input(name)?;
        self.input_data(slot)
    }

    /// Whether an input has a link attached
    pub fn is_input_connected(&self, slot: usize) -> bool {
        self.node()
            .and_then(|node| node.inputs.get(slot))
            .is_some_and(|input| input.is_connected())
    }

    /// Publish a value on an output. Returns false if the slot does not exist.
    pub fn set_output_data(&mut self, slot: usize, value: impl Into<Value>) -> bool {
        match self.node_mut().and_then(|node| node.outputs.get_mut(slot)) {
            Some(output) => {
                output.value = Some(value.into());
                true
            }
            None => false,
        }
    }

    /// Publish a value on the first output with this name
    pub fn set_output_data_by_name(&mut self, name: &str, value: impl Into<Value>) -> bool {
        match self.node().and_then(|node| node.find_output(name)) {
            Some(slot) => self.set_output_data(slot, value),
            None => false,
        }
    }

    /// Withdraw the value on an output
    pub fn clear_output_data(&mut self, slot: usize) {
        if let Some(output) = self.node_mut().and_then(|node| node.outputs.get_mut(slot)) {
            output.value = None;
        }
    }

    /// Read a property
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.node()?.property(name)
    }

    /// Write a property without notifying the node
    pub fn set_property(&mut self, name: &str, value: impl Into<Value>) {
        if let Some(node) = self.node_mut() {
            node.properties.insert(name.to_string(), value.into());
        }
    }

    /// Fire one of this node's outputs. Linked action handlers have run by
    /// the time this returns.
    pub fn trigger_slot(&mut self, slot: usize, param: &Value) -> Result<(), GraphError> {
        trigger_slot(self.graph, self.node, slot, param, self.depth)
    }

    /// Fire every EVENT output named `event`, or every EVENT output when
    /// `event` is empty
    pub fn trigger(&mut self, event: &str, param: &Value) -> Result<(), GraphError> {
        let slots: Vec<usize> = self
            .node()
            .map(|node| {
                node.outputs
                    .iter()
                    .enumerate()
                    .filter(|(_, output)| output.slot_type == SlotType::Event)
                    .filter(|(_, output)| event.is_empty() || output.name == event)
                    .map(|(index, _)| index)
                    .collect()
            })
            .unwrap_or_default();
        for slot in slots {
            self.trigger_slot(slot, param)?;
        }
        Ok(())
    }

    /// Raise a graph-level event (leaves the graph through its owner)
    pub fn emit(&mut self, event: &str, param: &Value) {
        self.graph.trigger(event, param);
    }

    /// Seconds since the graph started
    pub fn globaltime(&self) -> f64 {
        self.graph.globaltime()
    }

    /// Seconds covered by the current step
    pub fn elapsed_time(&self) -> f64 {
        self.graph.elapsed_time()
    }

    /// Current step number
    pub fn iteration(&self) -> u64 {
        self.graph.iteration()
    }
}

/// Deliver an event from `origin`'s output `slot` to every linked input.
///
/// Targets are resolved from a snapshot of the output's links, so handlers
/// may edit the graph while the cascade runs.
pub(crate) fn trigger_slot(
    graph: &mut Graph,
    origin: NodeId,
    slot: usize,
    param: &Value,
    depth: usize,
) -> Result<(), GraphError> {
    let depth = depth + 1;
    let limit = graph.config.max_event_depth;
    if depth > limit {
        return Err(GraphError::EventDepthExceeded { node: origin, limit });
    }

    let links: Vec<_> = graph.links_for_output(origin, slot).cloned().collect();
    tracing::trace!(node = %origin, slot, targets = links.len(), depth, "trigger");
    for link in links {
        let Some(action) = graph
            .node(link.target_id)
            .and_then(|target| target.inputs.get(link.target_slot))
            .map(|input| input.name.clone())
        else {
            continue;
        };
        let target = link.target_id;
        let options = ActionOptions {
            link: Some(link),
            depth,
        };
        deliver_action(graph, target, &action, param, &options)?;
    }
    Ok(())
}

/// Run a node's action handler, honoring its mode.
pub(crate) fn deliver_action(
    graph: &mut Graph,
    target: NodeId,
    action: &str,
    param: &Value,
    options: &ActionOptions,
) -> Result<(), GraphError> {
    let Some(node) = graph.nodes.get_mut(&target) else {
        return Ok(());
    };
    let mode = node.mode;
    match mode {
        NodeMode::Never => return Ok(()),
        NodeMode::OnEvent => node.pending_event = true,
        NodeMode::Always | NodeMode::OnTrigger => {}
    }
    let Some(behavior) = node.behavior.as_deref() else {
        tracing::warn!(node = %target, action, "node is already handling an event; skipping re-entrant delivery");
        return Ok(());
    };
    let accepts = behavior.accepts_actions();
    if !accepts && mode != NodeMode::OnTrigger {
        return Ok(());
    }

    let outcome = graph.with_behavior(
        target,
        options.depth,
        |behavior, ctx| -> Result<(), (NodePhase, NodeError)> {
            if accepts {
                behavior
                    .on_action(ctx, action, param, options)
                    .map_err(|error| (NodePhase::Action, error))?;
            }
            if mode == NodeMode::OnTrigger {
                behavior
                    .on_execute(ctx)
                    .map_err(|error| (NodePhase::Execute, error))?;
            }
            Ok(())
        },
    );
    match outcome {
        Some(Err((phase, error))) => graph.absorb_node_error(target, phase, error),
        _ => Ok(()),
    }
}
