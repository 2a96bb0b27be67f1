// SPDX-License-Identifier: MIT OR Apache-2.0
//! Subgraph node: a node whose body is a nested graph.
//!
//! The node's slots mirror the inner graph's named inputs and outputs. Data
//! inputs are copied into the inner graph before a single inner step and the
//! inner outputs are copied back afterwards. Actions on the node enter the
//! inner graph through its input nodes, and events leaving the inner graph are
//! fired from the matching outputs before the node's callback returns.

use crate::context::EngineConfig;
use crate::evaluation::NodeContext;
use crate::graph::{BoundaryChange, Graph, GraphError, GraphParent};
use crate::node::{ActionOptions, NodeBehavior, NodeError, NodeRegistry, NodeType};
use crate::slot::{InputSlot, OutputSlot, SlotType};
use serde_json::Value;

/// Type string of the subgraph node
pub const SUBGRAPH_TYPE: &str = "graph/subgraph";

pub(crate) fn register(registry: &mut NodeRegistry) {
    registry.register(
        NodeType::with_factory(SUBGRAPH_TYPE, "Subgraph", |config| {
            Box::new(Subgraph::new(config.clone()))
        })
        .description("Runs a nested graph as a single node"),
    );
}

/// Node behavior owning an inner graph
#[derive(Debug)]
pub struct Subgraph {
    graph: Graph,
}

impl Subgraph {
    /// Create a subgraph with an empty inner graph
    pub fn new(config: EngineConfig) -> Self {
        Self {
            graph: Graph::new(config),
        }
    }

    /// The inner graph
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Fire the node's outputs for every event the inner graph raised
    fn flush_events(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), NodeError> {
        for (event, param) in self.graph.take_outbox() {
            let slot = ctx.node().and_then(|node| {
                node.outputs()
                    .iter()
                    .position(|output| output.name == event && output.slot_type == SlotType::Event)
            });
            match slot {
                Some(slot) => ctx.trigger_slot(slot, &param)?,
                None => tracing::debug!(node = %ctx.id(), event = %event, "inner event has no matching output"),
            }
        }
        Ok(())
    }
}

impl NodeBehavior for Subgraph {
    fn on_added(&mut self, ctx: &mut NodeContext<'_>) {
        self.graph.parent = Some(GraphParent {
            graph: ctx.graph().id(),
            node: ctx.id(),
        });
        if let Err(error) = sync_boundary_slots(ctx, &mut self.graph) {
            tracing::warn!(node = %ctx.id(), %error, "could not mirror inner graph boundary");
        }
    }

    fn on_removed(&mut self, _ctx: &mut NodeContext<'_>) {
        self.graph.parent = None;
    }

    fn on_execute(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), NodeError> {
        sync_boundary_slots(ctx, &mut self.graph)?;

        let inputs: Vec<(usize, String)> = ctx
            .node()
            .map(|node| {
                node.inputs()
                    .iter()
                    .enumerate()
                    .filter(|(_, input)| !input.slot_type.is_trigger())
                    .map(|(slot, input)| (slot, input.name.clone()))
                    .collect()
            })
            .unwrap_or_default();
        for (slot, name) in inputs {
            match ctx.input_data_or_default(slot) {
                Some(value) => {
                    self.graph.set_input_data(&name, value);
                }
                None => self.graph.clear_input_data(&name),
            }
        }

        self.graph.run_step(1)?;

        let outputs: Vec<(usize, String)> = ctx
            .node()
            .map(|node| {
                node.outputs()
                    .iter()
                    .enumerate()
                    .filter(|(_, output)| !output.slot_type.is_trigger())
                    .map(|(slot, output)| (slot, output.name.clone()))
                    .collect()
            })
            .unwrap_or_default();
        for (slot, name) in outputs {
            match self.graph.output_data(&name).cloned() {
                Some(value) => {
                    ctx.set_output_data(slot, value);
                }
                None => ctx.clear_output_data(slot),
            }
        }

        self.flush_events(ctx)
    }

    fn accepts_actions(&self) -> bool {
        true
    }

    fn on_action(
        &mut self,
        ctx: &mut NodeContext<'_>,
        action: &str,
        param: &Value,
        options: &ActionOptions,
    ) -> Result<(), NodeError> {
        self.graph.deliver_graph_action(action, param, options.depth)?;
        self.flush_events(ctx)
    }

    fn on_start(&mut self, _ctx: &mut NodeContext<'_>) {
        self.graph.start();
    }

    fn on_stop(&mut self, _ctx: &mut NodeContext<'_>) {
        self.graph.stop();
    }

    fn on_pause(&mut self, _ctx: &mut NodeContext<'_>) {
        self.graph.pause();
    }

    fn on_unpause(&mut self, _ctx: &mut NodeContext<'_>) {
        self.graph.resume();
    }

    fn inner_graph(&self) -> Option<&Graph> {
        Some(&self.graph)
    }

    fn inner_graph_mut(&mut self) -> Option<&mut Graph> {
        Some(&mut self.graph)
    }
}

/// Mirror the inner graph's named inputs and outputs onto the subgraph
/// node's slots.
///
/// Renames recorded by the inner graph are applied in place so existing
/// links survive; everything else is reconciled against the port tables.
pub(crate) fn sync_boundary_slots(
    ctx: &mut NodeContext<'_>,
    inner: &mut Graph,
) -> Result<(), GraphError> {
    let id = ctx.id();
    for change in inner.take_boundary_changes() {
        match change {
            BoundaryChange::InputRenamed { old, new } => {
                if let Some(slot) = ctx.node().and_then(|node| node.find_input(&old)) {
                    ctx.graph_mut().rename_node_input(id, slot, &new)?;
                }
            }
            BoundaryChange::OutputRenamed { old, new } => {
                if let Some(slot) = ctx.node().and_then(|node| node.find_output(&old)) {
                    ctx.graph_mut().rename_node_output(id, slot, &new)?;
                }
            }
            _ => {}
        }
    }

    let wanted_inputs: Vec<(String, SlotType)> = inner
        .inputs()
        .map(|port| {
            let slot_type = if port.slot_type.is_trigger() {
                SlotType::Action
            } else {
                port.slot_type.clone()
            };
            (port.name.clone(), slot_type)
        })
        .collect();
    let wanted_outputs: Vec<(String, SlotType)> = inner
        .outputs()
        .map(|port| {
            let slot_type = if port.slot_type.is_trigger() {
                SlotType::Event
            } else {
                port.slot_type.clone()
            };
            (port.name.clone(), slot_type)
        })
        .collect();

    let Some(node) = ctx.node() else {
        return Err(GraphError::NodeNotFound(id));
    };
    let stale_inputs: Vec<usize> = node
        .inputs()
        .iter()
        .enumerate()
        .filter(|(_, input)| !wanted_inputs.iter().any(|(name, _)| *name == input.name))
        .map(|(slot, _)| slot)
        .collect();
    let stale_outputs: Vec<usize> = node
        .outputs()
        .iter()
        .enumerate()
        .filter(|(_, output)| !wanted_outputs.iter().any(|(name, _)| *name == output.name))
        .map(|(slot, _)| slot)
        .collect();

    let graph = ctx.graph_mut();
    for slot in stale_inputs.into_iter().rev() {
        graph.remove_node_input(id, slot)?;
    }
    for slot in stale_outputs.into_iter().rev() {
        graph.remove_node_output(id, slot)?;
    }

    for (name, slot_type) in wanted_inputs {
        match graph.node(id).and_then(|node| node.find_input(&name)) {
            Some(slot) => {
                graph.set_node_input_type(id, slot, slot_type)?;
            }
            None => {
                graph.add_node_input(id, InputSlot::new(name, slot_type))?;
            }
        }
    }
    for (name, slot_type) in wanted_outputs {
        match graph.node(id).and_then(|node| node.find_output(&name)) {
            Some(slot) => {
                graph.set_node_output_type(id, slot, slot_type)?;
            }
            None => {
                graph.add_node_output(id, OutputSlot::new(name, slot_type))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EngineContext;
    use crate::nodes::basic::{CONST_NUMBER_TYPE, WATCH_TYPE};
    use crate::nodes::boundary::{GRAPH_INPUT_TYPE, GRAPH_OUTPUT_TYPE};

    fn engine() -> EngineContext {
        EngineContext::with_builtin_nodes(EngineConfig::default())
    }

    fn passthrough(engine: &EngineContext, graph: &mut Graph) -> crate::node::NodeId {
        let subgraph = graph.add_node(engine.create_node(SUBGRAPH_TYPE).unwrap());
        graph
            .edit_subgraph(subgraph, |inner| {
                let input = inner.add_node(
                    engine
                        .create_node(GRAPH_INPUT_TYPE)
                        .unwrap()
                        .with_property("name", "x")
                        .with_property("type", "number"),
                );
                let output = inner.add_node(
                    engine
                        .create_node(GRAPH_OUTPUT_TYPE)
                        .unwrap()
                        .with_property("name", "y")
                        .with_property("type", "number"),
                );
                inner.connect(input, 0, output, 0).unwrap();
            })
            .unwrap();
        subgraph
    }

    #[test]
    fn test_slots_mirror_inner_ports() {
        let engine = engine();
        let mut graph = engine.create_graph();
        let subgraph = passthrough(&engine, &mut graph);

        let node = graph.node(subgraph).unwrap();
        assert_eq!(node.inputs().len(), 1);
        assert_eq!(node.inputs()[0].name, "x");
        assert_eq!(node.outputs()[0].name, "y");
        assert_eq!(node.outputs()[0].slot_type, SlotType::Named("number".into()));

        let parent = graph
            .behavior::<Subgraph>(subgraph)
            .unwrap()
            .graph()
            .parent()
            .unwrap();
        assert_eq!(parent.node, subgraph);
        assert_eq!(parent.graph, graph.id());
    }

    #[test]
    fn test_value_passes_through() {
        let engine = engine();
        let mut graph = engine.create_graph();
        let subgraph = passthrough(&engine, &mut graph);
        graph.node_mut(subgraph).unwrap().set_input_default(0, 5);

        graph.run_step(1).unwrap();
        assert_eq!(graph.node(subgraph).unwrap().output_value(0), Some(&Value::from(5)));
    }

    #[test]
    fn test_linked_pipeline_through_subgraph() {
        let engine = engine();
        let mut graph = engine.create_graph();
        let constant = graph.add_node(
            engine
                .create_node(CONST_NUMBER_TYPE)
                .unwrap()
                .with_property("value", 7.5),
        );
        let subgraph = passthrough(&engine, &mut graph);
        let watch = graph.add_node(engine.create_node(WATCH_TYPE).unwrap());
        graph.connect(constant, 0, subgraph, 0).unwrap();
        graph.connect(subgraph, 0, watch, 0).unwrap();

        graph.run_step(1).unwrap();
        let watched = graph.behavior::<crate::nodes::basic::Watch>(watch).unwrap();
        assert_eq!(watched.value(), Some(&Value::from(7.5)));
    }

    #[test]
    fn test_inner_rename_keeps_outer_link() {
        let engine = engine();
        let mut graph = engine.create_graph();
        let subgraph = passthrough(&engine, &mut graph);
        let watch = graph.add_node(engine.create_node(WATCH_TYPE).unwrap());
        let link = graph.connect(subgraph, 0, watch, 0).unwrap();

        graph
            .edit_subgraph(subgraph, |inner| {
                let output = inner.find_nodes_by_type(GRAPH_OUTPUT_TYPE)[0];
                inner.set_property(output, "name", "result").unwrap();
            })
            .unwrap();

        let node = graph.node(subgraph).unwrap();
        assert_eq!(node.outputs()[0].name, "result");
        assert_eq!(graph.link(link).unwrap().origin_slot, 0);

        graph
            .edit_subgraph(subgraph, |inner| {
                let output = inner.find_nodes_by_type(GRAPH_OUTPUT_TYPE)[0];
                inner.remove_node(output);
            })
            .unwrap();
        assert!(graph.node(subgraph).unwrap().outputs().is_empty());
        assert!(graph.link(link).is_none());
    }

    #[test]
    fn test_events_cross_both_ways() {
        let engine = engine();
        let mut graph = engine.create_graph();
        let subgraph = graph.add_node(engine.create_node(SUBGRAPH_TYPE).unwrap());
        graph
            .edit_subgraph(subgraph, |inner| {
                let input = inner.add_node(
                    engine
                        .create_node(GRAPH_INPUT_TYPE)
                        .unwrap()
                        .with_property("name", "go")
                        .with_property("type", "event"),
                );
                let output = inner.add_node(
                    engine
                        .create_node(GRAPH_OUTPUT_TYPE)
                        .unwrap()
                        .with_property("name", "done")
                        .with_property("type", "event"),
                );
                inner.connect(input, 0, output, 0).unwrap();
            })
            .unwrap();
        let log = graph.add_node(engine.create_node(crate::nodes::basic::LOG_EVENT_TYPE).unwrap());
        graph.connect(subgraph, 0, log, 0).unwrap();

        let node = graph.node(subgraph).unwrap();
        assert_eq!(node.inputs()[0].slot_type, SlotType::Action);
        assert_eq!(node.outputs()[0].slot_type, SlotType::Event);

        graph.invoke_action(subgraph, "go", &Value::from(3)).unwrap();
        let logged = graph.behavior::<crate::nodes::basic::LogEvent>(log).unwrap();
        assert_eq!(logged.count(), 1);
        assert_eq!(logged.last(), Some(&Value::from(3)));
    }

    #[test]
    fn test_lifecycle_reaches_inner_graph() {
        let engine = engine();
        let mut graph = engine.create_graph();
        let subgraph = passthrough(&engine, &mut graph);
        graph.start();
        let inner = graph.behavior::<Subgraph>(subgraph).unwrap().graph();
        assert_eq!(inner.status(), crate::graph::GraphStatus::Running);
        graph.stop();
        let inner = graph.behavior::<Subgraph>(subgraph).unwrap().graph();
        assert_eq!(inner.status(), crate::graph::GraphStatus::Stopped);
    }

    #[test]
    fn test_edit_requires_subgraph() {
        let engine = engine();
        let mut graph = engine.create_graph();
        let watch = graph.add_node(engine.create_node(WATCH_TYPE).unwrap());
        assert!(matches!(
            graph.edit_subgraph(watch, |_| ()),
            Err(crate::graph::GraphError::NotASubgraph(_))
        ));
    }
}
