// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph boundary nodes.
//!
//! A "graph input" node publishes one named input of its graph and a "graph
//! output" node collects one named output. They keep the graph's port tables
//! in step with their `name` and `type` properties, which in turn lets an
//! owning subgraph node mirror the ports as its own slots.
//!
//! A boundary of EVENT or ACTION type carries events instead of values: an
//! action arriving at the graph is fired from the input node, and an event
//! reaching the output node leaves the graph.

use crate::evaluation::NodeContext;
use crate::graph::GraphError;
use crate::node::{ActionOptions, NodeBehavior, NodeError, NodeRegistry, NodeType};
use crate::slot::SlotType;
use serde_json::Value;

/// Type string of the graph input node
pub const GRAPH_INPUT_TYPE: &str = "graph/input";
/// Type string of the graph output node
pub const GRAPH_OUTPUT_TYPE: &str = "graph/output";

pub(crate) fn register(registry: &mut NodeRegistry) {
    registry.register(
        NodeType::new::<GraphInput>(GRAPH_INPUT_TYPE, "Input")
            .description("Named input of the containing graph")
            .output("", SlotType::Default)
            .property("name", "")
            .property("type", "*")
            .property("value", Value::Null),
    );
    registry.register(
        NodeType::new::<GraphOutput>(GRAPH_OUTPUT_TYPE, "Output")
            .description("Named output of the containing graph")
            .input("", SlotType::Default)
            .property("name", "")
            .property("type", "*"),
    );
}

fn port_name(ctx: &NodeContext<'_>) -> String {
    ctx.property("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn port_type(ctx: &NodeContext<'_>) -> SlotType {
    ctx.property("type")
        .and_then(Value::as_str)
        .map(SlotType::parse)
        .unwrap_or_default()
}

fn name_of(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// Publishes a named graph input on its single output
#[derive(Debug, Default)]
pub struct GraphInput {
    registered: Option<String>,
}

impl GraphInput {
    /// Name of the graph input this node currently publishes
    pub fn port(&self) -> Option<&str> {
        self.registered.as_deref()
    }

    fn refresh_slot(ctx: &mut NodeContext<'_>) -> Result<(), GraphError> {
        let id = ctx.id();
        let name = port_name(ctx);
        let slot_type = match port_type(ctx) {
            port if port.is_trigger() => SlotType::Event,
            port => port,
        };
        let graph = ctx.graph_mut();
        // the node always carries exactly one output
        graph.rename_node_output(id, 0, &name)?;
        graph.set_node_output_type(id, 0, slot_type)
    }
}

impl NodeBehavior for GraphInput {
    fn on_added(&mut self, ctx: &mut NodeContext<'_>) {
        if let Err(error) = Self::refresh_slot(ctx) {
            tracing::warn!(node = %ctx.id(), %error, "boundary node has no slot to publish on");
        }
        let name = port_name(ctx);
        if name.is_empty() {
            return;
        }
        let slot_type = port_type(ctx);
        ctx.graph_mut().add_input(&name, slot_type, None);
        self.registered = Some(name);
    }

    fn on_removed(&mut self, ctx: &mut NodeContext<'_>) {
        if let Some(name) = self.registered.take() {
            ctx.graph_mut().remove_input(&name);
        }
    }

    fn on_property_changed(
        &mut self,
        ctx: &mut NodeContext<'_>,
        name: &str,
        previous: Option<&Value>,
    ) -> Result<(), NodeError> {
        match name {
            "name" => {
                let new = name_of(ctx.property("name"));
                let old = self.registered.take().or_else(|| name_of(previous));
                let slot_type = port_type(ctx);
                let graph = ctx.graph_mut();
                let renamed = match (&old, &new) {
                    (Some(old), Some(new)) => graph.rename_input(old, new),
                    _ => false,
                };
                if !renamed {
                    if let Some(old) = &old {
                        graph.remove_input(old);
                    }
                    if let Some(new) = &new {
                        graph.add_input(new, slot_type, None);
                    }
                }
                self.registered = new;
                Self::refresh_slot(ctx)?;
            }
            "type" => {
                if let Some(port) = &self.registered {
                    let slot_type = port_type(ctx);
                    ctx.graph_mut().change_input_type(port, slot_type);
                }
                Self::refresh_slot(ctx)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn on_execute(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), NodeError> {
        let value = self
            .registered
            .as_deref()
            .and_then(|port| ctx.graph().input_data(port))
            .cloned()
            .or_else(|| ctx.property("value").filter(|value| !value.is_null()).cloned());
        match value {
            Some(value) => {
                ctx.set_output_data(0, value);
            }
            None => ctx.clear_output_data(0),
        }
        Ok(())
    }

    fn accepts_actions(&self) -> bool {
        true
    }

    fn on_action(
        &mut self,
        ctx: &mut NodeContext<'_>,
        _action: &str,
        param: &Value,
        _options: &ActionOptions,
    ) -> Result<(), NodeError> {
        ctx.trigger_slot(0, param)?;
        Ok(())
    }
}

/// Collects its single input into a named graph output
#[derive(Debug, Default)]
pub struct GraphOutput {
    registered: Option<String>,
}

impl GraphOutput {
    /// Name of the graph output this node currently feeds
    pub fn port(&self) -> Option<&str> {
        self.registered.as_deref()
    }

    fn refresh_slot(ctx: &mut NodeContext<'_>) -> Result<(), GraphError> {
        let id = ctx.id();
        let name = port_name(ctx);
        let slot_type = match port_type(ctx) {
            port if port.is_trigger() => SlotType::Action,
            port => port,
        };
        let graph = ctx.graph_mut();
        graph.rename_node_input(id, 0, &name)?;
        graph.set_node_input_type(id, 0, slot_type)
    }
}

impl NodeBehavior for GraphOutput {
    fn on_added(&mut self, ctx: &mut NodeContext<'_>) {
        if let Err(error) = Self::refresh_slot(ctx) {
            tracing::warn!(node = %ctx.id(), %error, "boundary node has no slot to publish on");
        }
        let name = port_name(ctx);
        if name.is_empty() {
            return;
        }
        let slot_type = port_type(ctx);
        ctx.graph_mut().add_output(&name, slot_type, None);
        self.registered = Some(name);
    }

    fn on_removed(&mut self, ctx: &mut NodeContext<'_>) {
        if let Some(name) = self.registered.take() {
            ctx.graph_mut().remove_output(&name);
        }
    }

    fn on_property_changed(
        &mut self,
        ctx: &mut NodeContext<'_>,
        name: &str,
        previous: Option<&Value>,
    ) -> Result<(), NodeError> {
        match name {
            "name" => {
                let new = name_of(ctx.property("name"));
                let old = self.registered.take().or_else(|| name_of(previous));
                let slot_type = port_type(ctx);
                let graph = ctx.graph_mut();
                let renamed = match (&old, &new) {
                    (Some(old), Some(new)) => graph.rename_output(old, new),
                    _ => false,
                };
                if !renamed {
                    if let Some(old) = &old {
                        graph.remove_output(old);
                    }
                    if let Some(new) = &new {
                        graph.add_output(new, slot_type, None);
                    }
                }
                self.registered = new;
                Self::refresh_slot(ctx)?;
            }
            "type" => {
                if let Some(port) = &self.registered {
                    let slot_type = port_type(ctx);
                    ctx.graph_mut().change_output_type(port, slot_type);
                }
                Self::refresh_slot(ctx)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn on_execute(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), NodeError> {
        let Some(port) = self.registered.as_deref() else {
            return Ok(());
        };
        match ctx.input_data(0) {
            Some(value) => {
                ctx.graph_mut().set_output_data(port, value);
            }
            None => ctx.graph_mut().clear_output_data(port),
        }
        Ok(())
    }

    fn accepts_actions(&self) -> bool {
        true
    }

    fn on_action(
        &mut self,
        ctx: &mut NodeContext<'_>,
        _action: &str,
        param: &Value,
        _options: &ActionOptions,
    ) -> Result<(), NodeError> {
        if let Some(port) = self.registered.as_deref() {
            ctx.emit(port, param);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{EngineConfig, EngineContext};
    use crate::graph::{BoundaryChange, ConnectionError};
    use crate::node::NodeId;

    fn engine() -> EngineContext {
        EngineContext::with_builtin_nodes(EngineConfig::default())
    }

    #[test]
    fn test_input_node_registers_port() {
        let engine = engine();
        let mut graph = engine.create_graph();
        let node = graph.add_node(
            engine
                .create_node(GRAPH_INPUT_TYPE)
                .unwrap()
                .with_property("name", "x")
                .with_property("type", "number"),
        );

        let port = graph.graph_input("x").unwrap();
        assert_eq!(port.slot_type, SlotType::Named("number".into()));
        let output = &graph.node(node).unwrap().outputs()[0];
        assert_eq!(output.name, "x");
        assert_eq!(output.slot_type, SlotType::Named("number".into()));

        graph.remove_node(node);
        assert!(graph.graph_input("x").is_none());
    }

    #[test]
    fn test_rename_and_retype_follow_properties() {
        let engine = engine();
        let mut graph = engine.create_graph();
        let node = graph.add_node(
            engine
                .create_node(GRAPH_OUTPUT_TYPE)
                .unwrap()
                .with_property("name", "y"),
        );
        graph.take_boundary_changes();

        graph.set_property(node, "name", "result").unwrap();
        graph.set_property(node, "type", "action").unwrap();

        assert!(graph.graph_output("y").is_none());
        assert_eq!(graph.graph_output("result").unwrap().slot_type, SlotType::Action);
        let input = &graph.node(node).unwrap().inputs()[0];
        assert_eq!(input.name, "result");
        assert_eq!(input.slot_type, SlotType::Action);
        assert_eq!(
            graph.take_boundary_changes(),
            vec![
                BoundaryChange::OutputRenamed {
                    old: "y".into(),
                    new: "result".into()
                },
                BoundaryChange::OutputRetyped {
                    name: "result".into(),
                    slot_type: SlotType::Action
                },
            ]
        );
    }

    #[test]
    fn test_missing_slot_surfaces_on_rename() {
        let engine = EngineContext::with_builtin_nodes(EngineConfig {
            catch_errors: false,
            ..EngineConfig::default()
        });
        let mut graph = engine.create_graph();
        let node = graph.add_node(
            engine
                .create_node(GRAPH_OUTPUT_TYPE)
                .unwrap()
                .with_property("name", "y"),
        );
        graph.remove_node_input(node, 0).unwrap();

        let error = graph.set_property(node, "name", "z").unwrap_err();
        assert!(matches!(
            error,
            GraphError::Connection(ConnectionError::SlotNotFound { node: failed, slot: 0, .. })
                if failed == node
        ));
        assert_eq!(graph.graph_output("z").unwrap().name, "z");
    }

    #[test]
    fn test_values_cross_the_boundary() {
        let engine = engine();
        let mut graph = engine.create_graph();
        let input = graph.add_node(
            engine
                .create_node(GRAPH_INPUT_TYPE)
                .unwrap()
                .with_property("name", "x"),
        );
        let output = graph.add_node(
            engine
                .create_node(GRAPH_OUTPUT_TYPE)
                .unwrap()
                .with_property("name", "y"),
        );
        graph.connect(input, 0, output, 0).unwrap();

        graph.set_input_data("x", 5);
        graph.run_step(1).unwrap();
        assert_eq!(graph.output_data("y"), Some(&Value::from(5)));

        graph.clear_input_data("x");
        graph.run_step(1).unwrap();
        assert_eq!(graph.output_data("y"), None);
    }

    #[test]
    fn test_graph_action_enters_through_input_node() {
        let engine = engine();
        let mut graph = engine.create_graph();
        graph.add_node(
            engine
                .create_node(GRAPH_INPUT_TYPE)
                .unwrap()
                .with_property("name", "go")
                .with_property("type", "event"),
        );
        let log = graph.add_node(engine.create_node(crate::nodes::basic::LOG_EVENT_TYPE).unwrap());
        graph.connect(NodeId::Index(1), 0, log, 0).unwrap();

        assert!(graph.on_action("go", &Value::from("hello")).unwrap());
        assert!(!graph.on_action("missing", &Value::Null).unwrap());
        let logged = graph.behavior::<crate::nodes::basic::LogEvent>(log).unwrap();
        assert_eq!(logged.count(), 1);
        assert_eq!(logged.last(), Some(&Value::from("hello")));
    }
}
