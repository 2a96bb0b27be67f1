// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end scenarios over the public API.

use nodeflow_graph::nodes::basic::{LogEvent, Watch, CONST_NUMBER_TYPE, LOG_EVENT_TYPE, WATCH_TYPE};
use nodeflow_graph::nodes::boundary::{GRAPH_INPUT_TYPE, GRAPH_OUTPUT_TYPE};
use nodeflow_graph::nodes::subgraph::SUBGRAPH_TYPE;
use nodeflow_graph::{
    ActionOptions, EngineConfig, EngineContext, Graph, GraphDocument, GraphError, NodeBehavior,
    NodeContext, NodeError, NodeId, NodeMode, NodeType, OutputSlot, SlotType,
};
use serde_json::Value;
use std::sync::{Arc, Mutex};

type Journal = Arc<Mutex<Vec<String>>>;

/// Writes to a shared journal around forwarding an action to its event output
struct Forward {
    label: String,
    journal: Journal,
}

impl NodeBehavior for Forward {
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
        self.journal.lock().unwrap().push(format!("{}:enter", self.label));
        ctx.trigger_slot(0, param)?;
        self.journal.lock().unwrap().push(format!("{}:leave", self.label));
        Ok(())
    }
}

fn forward_type(journal: &Journal) -> NodeType {
    let journal = Arc::clone(journal);
    NodeType::with_factory("test/forward", "Forward", move |_| {
        Box::new(Forward {
            label: String::new(),
            journal: Arc::clone(&journal),
        })
    })
    .input("in", SlotType::Action)
    .output("out", SlotType::Event)
}

fn add_forward(graph: &mut Graph, engine: &EngineContext, label: &str) -> NodeId {
    let id = graph.add_node(engine.create_node("test/forward").unwrap().with_title(label));
    graph.behavior_mut::<Forward>(id).unwrap().label = label.to_string();
    id
}

#[test]
fn event_cascade_completes_before_trigger_returns() {
    let journal = Journal::default();
    let mut engine = EngineContext::new(EngineConfig::default());
    engine.register(forward_type(&journal));

    let mut graph = engine.create_graph();
    let a = add_forward(&mut graph, &engine, "A");
    let b = add_forward(&mut graph, &engine, "B");
    let c = add_forward(&mut graph, &engine, "C");
    graph.connect(a, 0, b, 0).unwrap();
    graph.connect(b, 0, c, 0).unwrap();

    graph.trigger_slot(a, 0, &Value::Null).unwrap();
    assert_eq!(
        *journal.lock().unwrap(),
        vec!["B:enter", "C:enter", "C:leave", "B:leave"]
    );
}

#[test]
fn event_fanout_visits_links_in_connection_order() {
    let journal = Journal::default();
    let mut engine = EngineContext::new(EngineConfig::default());
    engine.register(forward_type(&journal));

    let mut graph = engine.create_graph();
    let source = add_forward(&mut graph, &engine, "S");
    let second = add_forward(&mut graph, &engine, "2");
    let first = add_forward(&mut graph, &engine, "1");
    graph.connect(source, 0, first, 0).unwrap();
    graph.connect(source, 0, second, 0).unwrap();

    graph.invoke_action(source, "in", &Value::Null).unwrap();
    assert_eq!(
        *journal.lock().unwrap(),
        vec!["S:enter", "1:enter", "1:leave", "2:enter", "2:leave", "S:leave"]
    );
}

#[test]
fn simple_pipeline() {
    let engine = EngineContext::with_builtin_nodes(EngineConfig::default());
    let mut graph = engine.create_graph();
    let constant = graph.add_node(
        engine
            .create_node(CONST_NUMBER_TYPE)
            .unwrap()
            .with_property("value", 10),
    );
    let watch = graph.add_node(engine.create_node(WATCH_TYPE).unwrap());
    graph.connect(constant, 0, watch, 0).unwrap();

    graph.run_step(1).unwrap();
    assert_eq!(
        graph.behavior::<Watch>(watch).unwrap().value(),
        Some(&Value::from(10))
    );
}

#[test]
fn mode_gating() {
    let engine = EngineContext::with_builtin_nodes(EngineConfig::default());
    let mut graph = engine.create_graph();
    let constant = graph.add_node(engine.create_node(CONST_NUMBER_TYPE).unwrap());
    let disabled = graph.add_node(
        engine
            .create_node(WATCH_TYPE)
            .unwrap()
            .with_mode(NodeMode::Never),
    );
    let triggered = graph.add_node(
        engine
            .create_node(LOG_EVENT_TYPE)
            .unwrap()
            .with_mode(NodeMode::OnTrigger),
    );

    assert!(graph.node(disabled).is_some());
    assert_eq!(&*graph.execution_order(), &[constant]);
    graph.set_mode(constant, NodeMode::OnEvent).unwrap();
    assert!(!graph.execution_order().contains(&disabled));
    assert!(!graph.execution_order().contains(&triggered));

    graph.invoke_action(triggered, "event", &Value::from(1)).unwrap();
    assert_eq!(graph.behavior::<LogEvent>(triggered).unwrap().count(), 1);

    let doc = graph.serialize();
    assert_eq!(doc.nodes[1].mode, NodeMode::Never);
}

fn passthrough_subgraph(engine: &EngineContext, graph: &mut Graph) -> NodeId {
    let subgraph = graph.add_node(engine.create_node(SUBGRAPH_TYPE).unwrap());
    graph
        .edit_subgraph(subgraph, |inner| {
            let x = inner.add_node(
                engine
                    .create_node(GRAPH_INPUT_TYPE)
                    .unwrap()
                    .with_property("name", "x"),
            );
            let y = inner.add_node(
                engine
                    .create_node(GRAPH_OUTPUT_TYPE)
                    .unwrap()
                    .with_property("name", "y"),
            );
            inner.connect(x, 0, y, 0).unwrap();
        })
        .unwrap();
    subgraph
}

#[test]
fn subgraph_boundary() {
    let engine = EngineContext::with_builtin_nodes(EngineConfig::default());
    let mut graph = engine.create_graph();
    let subgraph = passthrough_subgraph(&engine, &mut graph);

    let node = graph.node_mut(subgraph).unwrap();
    assert_eq!(node.find_input("x"), Some(0));
    assert_eq!(node.find_output("y"), Some(0));
    node.set_input_default(0, 5);

    graph.run_step(1).unwrap();
    assert_eq!(
        graph.node(subgraph).unwrap().output_value(0),
        Some(&Value::from(5))
    );
}

#[test]
fn subgraph_round_trip_nests_inner_document() {
    let engine = EngineContext::with_builtin_nodes(EngineConfig::default());
    let mut graph = engine.create_graph();
    let constant = graph.add_node(
        engine
            .create_node(CONST_NUMBER_TYPE)
            .unwrap()
            .with_property("value", 2.5),
    );
    let subgraph = passthrough_subgraph(&engine, &mut graph);
    let watch = graph.add_node(engine.create_node(WATCH_TYPE).unwrap());
    graph.connect(constant, 0, subgraph, 0).unwrap();
    graph.connect(subgraph, 0, watch, 0).unwrap();

    let doc = graph.serialize();
    let inner = doc.nodes[1].subgraph.as_deref().unwrap();
    assert_eq!(inner.nodes.len(), 2);
    assert_eq!(inner.links.len(), 1);

    let json = doc.to_json().unwrap();
    let mut restored = engine.create_graph();
    let report = restored.load_json(&json, &engine).unwrap();
    assert!(report.is_complete());
    assert_eq!(restored.serialize(), doc);

    restored.run_step(1).unwrap();
    assert_eq!(
        restored.behavior::<Watch>(watch).unwrap().value(),
        Some(&Value::from(2.5))
    );
}

#[test]
fn ron_document_round_trip() {
    let engine = EngineContext::with_builtin_nodes(EngineConfig::default());
    let mut graph = engine.create_graph();
    passthrough_subgraph(&engine, &mut graph);
    let doc = graph.serialize();

    let text = doc.to_ron().unwrap();
    assert_eq!(GraphDocument::from_ron(&text).unwrap(), doc);
}

#[test]
fn data_cycle_does_not_hang() {
    let engine = EngineContext::with_builtin_nodes(EngineConfig::default());
    let mut graph = engine.create_graph();
    let a = graph.add_node(engine.create_node(WATCH_TYPE).unwrap());
    let b = graph.add_node(engine.create_node(WATCH_TYPE).unwrap());
    graph.add_node_output(a, OutputSlot::new("out", "*")).unwrap();
    graph.add_node_output(b, OutputSlot::new("out", "*")).unwrap();
    graph.connect(a, 0, b, 0).unwrap();
    graph.connect(b, 0, a, 0).unwrap();

    let order = graph.execution_order();
    assert_eq!(order.len(), 2);
    graph.run_step(10).unwrap();
    assert!(Arc::ptr_eq(&order, &graph.execution_order()));
}

#[test]
fn chain_after_data_cycle_stays_ordered() {
    let engine = EngineContext::with_builtin_nodes(EngineConfig::default());
    let mut graph = engine.create_graph();
    let tail = graph.add_node(engine.create_node(WATCH_TYPE).unwrap());
    let middle = graph.add_node(engine.create_node(WATCH_TYPE).unwrap());
    let a = graph.add_node(engine.create_node(WATCH_TYPE).unwrap());
    let b = graph.add_node(engine.create_node(WATCH_TYPE).unwrap());
    for id in [middle, a, b] {
        graph.add_node_output(id, OutputSlot::new("out", "*")).unwrap();
    }
    graph.connect(a, 0, b, 0).unwrap();
    graph.connect(b, 0, a, 0).unwrap();
    graph.connect(b, 0, middle, 0).unwrap();
    graph.connect(middle, 0, tail, 0).unwrap();

    let order = graph.execution_order();
    let position = |id: NodeId| order.iter().position(|node| *node == id).unwrap();
    assert!(position(a) < position(middle));
    assert!(position(b) < position(middle));
    assert!(position(middle) < position(tail));
}

#[derive(Default)]
struct Broken;

impl NodeBehavior for Broken {
    fn on_execute(&mut self, _ctx: &mut NodeContext<'_>) -> Result<(), NodeError> {
        Err(NodeError::MissingInput("in".into()))
    }
}

#[test]
fn broken_node_is_skipped_or_fatal_by_config() {
    for catch_errors in [true, false] {
        let mut engine = EngineContext::with_builtin_nodes(EngineConfig {
            catch_errors,
            ..EngineConfig::default()
        });
        engine.register(NodeType::new::<Broken>("test/broken", "Broken"));

        let mut graph = engine.create_graph();
        graph.add_node(engine.create_node("test/broken").unwrap());
        let constant = graph.add_node(engine.create_node(CONST_NUMBER_TYPE).unwrap());
        let watch = graph.add_node(engine.create_node(WATCH_TYPE).unwrap());
        graph.connect(constant, 0, watch, 0).unwrap();

        let result = graph.run_step(1);
        let watched = graph.behavior::<Watch>(watch).unwrap().value().cloned();
        if catch_errors {
            assert!(result.is_ok());
            assert_eq!(watched, Some(Value::from(1.0)));
        } else {
            assert!(matches!(result, Err(GraphError::Node { .. })));
            assert_eq!(watched, None);
        }
    }
}

#[test]
fn unknown_types_do_not_block_loading() {
    let engine = EngineContext::with_builtin_nodes(EngineConfig::default());
    let json = r#"{
        "last_node_id": 3,
        "last_link_id": 2,
        "nodes": [
            {"id": 1, "type": "basic/const", "mode": 0,
             "outputs": [{"name": "value", "type": "number", "links": [1, 2]}],
             "properties": {"value": 4}},
            {"id": 2, "type": "plugin/gone", "mode": 0,
             "inputs": [{"name": "in", "type": "number", "link": 1}]},
            {"id": 3, "type": "basic/watch", "mode": 0,
             "inputs": [{"name": "value", "type": "*", "link": 2}]}
        ],
        "links": [[1, 1, 0, 2, 0, "number"], [2, 1, 0, 3, 0, "number"]],
        "version": 0.4
    }"#;

    let mut graph = engine.create_graph();
    let report = graph.load_json(json, &engine).unwrap();
    assert_eq!(report.skipped_nodes.len(), 1);
    assert_eq!(report.skipped_nodes[0].type_name, "plugin/gone");
    assert_eq!(report.dropped_links, 1);
    assert_eq!(graph.node_count(), 2);

    let constant = graph.node(NodeId::Index(1)).unwrap();
    assert_eq!(constant.outputs()[0].links.len(), 1);

    graph.run_step(1).unwrap();
    assert_eq!(
        graph.behavior::<Watch>(NodeId::Index(3)).unwrap().value(),
        Some(&Value::from(4))
    );
}
