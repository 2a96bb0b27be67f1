// SPDX-License-Identifier: MIT OR Apache-2.0
//! Node definitions, the node capability trait and the type registry.

use crate::context::EngineConfig;
use crate::evaluation::NodeContext;
use crate::graph::{Graph, GraphError, GraphId};
use crate::link::Link;
use crate::slot::{InputSlot, OutputSlot, SlotType};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Unique identifier for a node within its graph
///
/// Integer ids come from the graph's counter and start at 1. UUID ids are
/// used when node ids must be unique across a whole project of nested graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeId {
    /// Counter-assigned id
    Index(u64),
    /// Globally unique id
    Uuid(Uuid),
}

impl NodeId {
    /// Placeholder carried by nodes that have not been added to a graph yet
    pub const UNASSIGNED: NodeId = NodeId::Index(0);

    /// Create a new random node ID
    pub fn new_uuid() -> Self {
        Self::Uuid(Uuid::new_v4())
    }

    /// Whether the graph still has to assign a real id
    pub fn is_unassigned(&self) -> bool {
        *self == Self::UNASSIGNED
    }
}

impl From<u64> for NodeId {
    fn from(index: u64) -> Self {
        Self::Index(index)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{index}"),
            Self::Uuid(uuid) => write!(f, "{uuid}"),
        }
    }
}

/// Gate controlling when the scheduler evaluates a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum NodeMode {
    /// Evaluated every step
    #[default]
    Always,
    /// Evaluated in the step following an incoming event
    OnEvent,
    /// Disabled; kept in the graph and serialized
    Never,
    /// Evaluated only when an event arrives, never by the step pass
    OnTrigger,
}

impl NodeMode {
    /// Whether the node takes part in the per-step order at all
    pub fn is_scheduled(self) -> bool {
        matches!(self, Self::Always | Self::OnEvent)
    }

    /// Display name
    pub fn name(self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::OnEvent => "On Event",
            Self::Never => "Never",
            Self::OnTrigger => "On Trigger",
        }
    }
}

impl From<NodeMode> for u8 {
    fn from(mode: NodeMode) -> Self {
        match mode {
            NodeMode::Always => 0,
            NodeMode::OnEvent => 1,
            NodeMode::Never => 2,
            NodeMode::OnTrigger => 3,
        }
    }
}

impl TryFrom<u8> for NodeMode {
    type Error = InvalidMode;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Always),
            1 => Ok(Self::OnEvent),
            2 => Ok(Self::Never),
            3 => Ok(Self::OnTrigger),
            other => Err(InvalidMode(other)),
        }
    }
}

/// Unknown node mode code
#[derive(Debug, thiserror::Error)]
#[error("Invalid node mode: {0}")]
pub struct InvalidMode(pub u8);

/// Editor flags persisted with a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeFlags {
    /// Collapsed in the editor
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub collapsed: bool,
    /// Pinned in place
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pinned: bool,
}

/// Error raised by a node callback
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Free-form failure
    #[error("{0}")]
    Message(String),

    /// A required input had no value
    #[error("Missing input: {0}")]
    MissingInput(String),

    /// A property held an unusable value
    #[error("Invalid property '{name}': {reason}")]
    InvalidProperty {
        /// Property name
        name: String,
        /// What was wrong with it
        reason: String,
    },

    /// Failure bubbling up from the graph (event cascade, nested graph)
    #[error(transparent)]
    Graph(Box<GraphError>),
}

impl NodeError {
    /// Create a free-form error
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

impl From<GraphError> for NodeError {
    fn from(error: GraphError) -> Self {
        Self::Graph(Box::new(error))
    }
}

/// Details passed along with an action delivery
#[derive(Debug, Clone, Default)]
pub struct ActionOptions {
    /// Link the event travelled over, if any
    pub link: Option<Link>,
    /// Cascade depth at delivery
    pub depth: usize,
}

/// Upcast helper so behaviors can be downcast by hosts
pub trait AsAny: Any {
    /// View as `Any`
    fn as_any(&self) -> &dyn Any;
    /// View as mutable `Any`
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Per-node-type behavior.
///
/// Every method has a no-op default, so a node type implements only the
/// capabilities it has. Callbacks get a [`NodeContext`] scoped to the node
/// they run for.
pub trait NodeBehavior: AsAny {
    /// Called after the node was inserted into a graph
    fn on_added(&mut self, _ctx: &mut NodeContext<'_>) {}

    /// Called before the node is taken out of its graph
    fn on_removed(&mut self, _ctx: &mut NodeContext<'_>) {}

    /// Per-step evaluation
    fn on_execute(&mut self, _ctx: &mut NodeContext<'_>) -> Result<(), NodeError> {
        Ok(())
    }

    /// Whether [`NodeBehavior::on_action`] does anything. The router skips
    /// nodes that return false here.
    fn accepts_actions(&self) -> bool {
        false
    }

    /// Handle an event delivered to the input named `action`
    fn on_action(
        &mut self,
        _ctx: &mut NodeContext<'_>,
        _action: &str,
        _param: &Value,
        _options: &ActionOptions,
    ) -> Result<(), NodeError> {
        Ok(())
    }

    /// Graph transitioned to running
    fn on_start(&mut self, _ctx: &mut NodeContext<'_>) {}

    /// Graph transitioned to stopped
    fn on_stop(&mut self, _ctx: &mut NodeContext<'_>) {}

    /// Graph was paused
    fn on_pause(&mut self, _ctx: &mut NodeContext<'_>) {}

    /// Graph resumed from pause
    fn on_unpause(&mut self, _ctx: &mut NodeContext<'_>) {}

    /// A property was written through [`Graph::set_property`]
    fn on_property_changed(
        &mut self,
        _ctx: &mut NodeContext<'_>,
        _name: &str,
        _previous: Option<&Value>,
    ) -> Result<(), NodeError> {
        Ok(())
    }

    /// Nested graph, for subgraph nodes
    fn inner_graph(&self) -> Option<&Graph> {
        None
    }

    /// Mutable nested graph, for subgraph nodes
    fn inner_graph_mut(&mut self) -> Option<&mut Graph> {
        None
    }
}

/// A node instance in a graph
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) type_name: String,
    /// Display title
    pub title: String,
    /// Position in the editor
    pub pos: [f32; 2],
    /// Size in the editor
    pub size: [f32; 2],
    /// Editor flags
    pub flags: NodeFlags,
    /// Custom color
    pub color: Option<String>,
    pub(crate) mode: NodeMode,
    pub(crate) inputs: Vec<InputSlot>,
    pub(crate) outputs: Vec<OutputSlot>,
    pub(crate) properties: IndexMap<String, Value>,
    pub(crate) graph: Option<GraphId>,
    pub(crate) behavior: Option<Box<dyn NodeBehavior>>,
    pub(crate) pending_event: bool,
}

impl Node {
    pub(crate) fn new(node_type: &NodeType, behavior: Box<dyn NodeBehavior>) -> Self {
        let mut node = Self {
            id: NodeId::UNASSIGNED,
            type_name: node_type.type_name.clone(),
            title: node_type.title.clone(),
            pos: [0.0, 0.0],
            size: [0.0, 0.0],
            flags: NodeFlags::default(),
            color: None,
            mode: node_type.mode,
            inputs: node_type.inputs.clone(),
            outputs: node_type.outputs.clone(),
            properties: node_type.properties.clone(),
            graph: None,
            behavior: Some(behavior),
            pending_event: false,
        };
        node.size = node.compute_size();
        node
    }

    /// Node ID; [`NodeId::UNASSIGNED`] until added to a graph
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Registered type string, e.g. `"basic/const"`
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Current mode
    pub fn mode(&self) -> NodeMode {
        self.mode
    }

    /// Handle of the owning graph
    pub fn graph_id(&self) -> Option<GraphId> {
        self.graph
    }

    /// Set the title
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Set the position
    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.pos = [x, y];
        self
    }

    /// Set the mode before the node joins a graph
    pub fn with_mode(mut self, mode: NodeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set a property before the node joins a graph
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Request a specific id; the graph keeps it unless it collides
    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }

    /// Input slots
    pub fn inputs(&self) -> &[InputSlot] {
        &self.inputs
    }

    /// Output slots
    pub fn outputs(&self) -> &[OutputSlot] {
        &self.outputs
    }

    /// Get an input slot by index
    pub fn input(&self, index: usize) -> Option<&InputSlot> {
        self.inputs.get(index)
    }

    /// Get an output slot by index
    pub fn output(&self, index: usize) -> Option<&OutputSlot> {
        self.outputs.get(index)
    }

    /// Index of the first input with this name
    pub fn find_input(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|slot| slot.name == name)
    }

    /// Index of the first output with this name
    pub fn find_output(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|slot| slot.name == name)
    }

    /// Append an unconnected input, returning its index
    pub fn add_input(&mut self, slot: InputSlot) -> usize {
        let mut slot = slot;
        slot.link = None;
        self.inputs.push(slot);
        self.size = self.compute_size();
        self.inputs.len() - 1
    }

    /// Append an unconnected output, returning its index
    pub fn add_output(&mut self, slot: OutputSlot) -> usize {
        let mut slot = slot;
        slot.links.clear();
        self.outputs.push(slot);
        self.size = self.compute_size();
        self.outputs.len() - 1
    }

    /// Set the value an unconnected input reads as
    pub fn set_input_default(&mut self, index: usize, value: impl Into<Value>) -> bool {
        match self.inputs.get_mut(index) {
            Some(slot) => {
                slot.default_value = Some(value.into());
                true
            }
            None => false,
        }
    }

    /// Most recently produced value of an output
    pub fn output_value(&self, index: usize) -> Option<&Value> {
        self.outputs.get(index)?.value.as_ref()
    }

    /// Get a property
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// All properties in declaration order
    pub fn properties(&self) -> &IndexMap<String, Value> {
        &self.properties
    }

    /// Whether an event arrived since the last evaluation (ON_EVENT nodes)
    pub fn has_pending_event(&self) -> bool {
        self.pending_event
    }

    /// The behavior, unless it is currently executing
    pub fn behavior(&self) -> Option<&dyn NodeBehavior> {
        self.behavior.as_deref()
    }

    /// Downcast the behavior to a concrete type
    pub fn behavior_as<T: NodeBehavior>(&self) -> Option<&T> {
        self.behavior.as_deref()?.as_any().downcast_ref::<T>()
    }

    /// Mutably downcast the behavior to a concrete type
    pub fn behavior_as_mut<T: NodeBehavior>(&mut self) -> Option<&mut T> {
        self.behavior.as_deref_mut()?.as_any_mut().downcast_mut::<T>()
    }

    /// Default editor size derived from the slot count
    pub fn compute_size(&self) -> [f32; 2] {
        let rows = self.inputs.len().max(self.outputs.len()).max(1);
        [140.0, rows as f32 * 20.0 + 6.0]
    }

    pub(crate) fn has_subgraph(&self) -> bool {
        self.behavior
            .as_deref()
            .is_some_and(|behavior| behavior.inner_graph().is_some())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("title", &self.title)
            .field("mode", &self.mode)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

/// Constructor stored in the registry
pub type NodeFactory = Arc<dyn Fn(&EngineConfig) -> Box<dyn NodeBehavior> + Send + Sync>;

/// Node type definition
#[derive(Clone)]
pub struct NodeType {
    /// Unique dotted type string, e.g. `"math/operation"`
    pub type_name: String,
    /// Default title
    pub title: String,
    /// Description
    pub description: String,
    /// Declared inputs
    pub inputs: Vec<InputSlot>,
    /// Declared outputs
    pub outputs: Vec<OutputSlot>,
    /// Declared properties with their defaults
    pub properties: IndexMap<String, Value>,
    /// Initial mode
    pub mode: NodeMode,
    factory: NodeFactory,
}

impl NodeType {
    /// Define a type whose behavior is built with `Default`
    pub fn new<B: NodeBehavior + Default>(
        type_name: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self::with_factory(type_name, title, |_| Box::new(B::default()))
    }

    /// Define a type with a custom constructor
    pub fn with_factory(
        type_name: impl Into<String>,
        title: impl Into<String>,
        factory: impl Fn(&EngineConfig) -> Box<dyn NodeBehavior> + Send + Sync + 'static,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            title: title.into(),
            description: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            properties: IndexMap::new(),
            mode: NodeMode::Always,
            factory: Arc::new(factory),
        }
    }

    /// Set the description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Declare an input
    pub fn input(self, name: impl Into<String>, slot_type: impl Into<SlotType>) -> Self {
        self.input_slot(InputSlot::new(name, slot_type))
    }

    /// Declare a fully configured input
    pub fn input_slot(mut self, slot: InputSlot) -> Self {
        self.inputs.push(slot);
        self
    }

    /// Declare an output
    pub fn output(mut self, name: impl Into<String>, slot_type: impl Into<SlotType>) -> Self {
        self.outputs.push(OutputSlot::new(name, slot_type));
        self
    }

    /// Declare a property and its default
    pub fn property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Set the initial mode
    pub fn mode(mut self, mode: NodeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Category: the part of the type string before the last `/`
    pub fn category(&self) -> &str {
        self.type_name
            .rsplit_once('/')
            .map_or("", |(category, _)| category)
    }

    /// Build a fresh node of this type
    pub fn instantiate(&self, config: &EngineConfig) -> Node {
        Node::new(self, (self.factory)(config))
    }
}

impl fmt::Debug for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeType")
            .field("type_name", &self.type_name)
            .field("title", &self.title)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

/// Registry of available node types
#[derive(Debug, Default)]
pub struct NodeRegistry {
    /// Registered node types by type string
    types: IndexMap<String, NodeType>,
}

impl NodeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node type, replacing any previous type with the same name
    pub fn register(&mut self, node_type: NodeType) {
        if self.types.contains_key(&node_type.type_name) {
            tracing::debug!(type_name = %node_type.type_name, "replacing registered node type");
        }
        self.types.insert(node_type.type_name.clone(), node_type);
    }

    /// Remove a node type
    pub fn unregister(&mut self, type_name: &str) -> Option<NodeType> {
        self.types.shift_remove(type_name)
    }

    /// Get a node type by name
    pub fn get(&self, type_name: &str) -> Option<&NodeType> {
        self.types.get(type_name)
    }

    /// Whether a type is registered
    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Get all registered types
    pub fn types(&self) -> impl Iterator<Item = &NodeType> {
        self.types.values()
    }

    /// Get types in a category
    pub fn types_in_category<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a NodeType> {
        self.types.values().filter(move |t| t.category() == category)
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Create a node from a type name
    pub fn create_node(&self, type_name: &str, config: &EngineConfig) -> Option<Node> {
        self.get(type_name).map(|node_type| node_type.instantiate(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Dummy;

    impl NodeBehavior for Dummy {}

    #[test]
    fn test_mode_codes() {
        for mode in [
            NodeMode::Always,
            NodeMode::OnEvent,
            NodeMode::Never,
            NodeMode::OnTrigger,
        ] {
            let code: u8 = mode.into();
            assert_eq!(NodeMode::try_from(code).unwrap(), mode);
        }
        assert!(NodeMode::try_from(9).is_err());
        assert_eq!(serde_json::to_string(&NodeMode::OnTrigger).unwrap(), "3");
    }

    #[test]
    fn test_node_id_untagged() {
        assert_eq!(serde_json::to_string(&NodeId::Index(4)).unwrap(), "4");
        let uuid = NodeId::new_uuid();
        let json = serde_json::to_string(&uuid).unwrap();
        assert!(json.starts_with('"'));
        assert_eq!(serde_json::from_str::<NodeId>(&json).unwrap(), uuid);
        assert_eq!(serde_json::from_str::<NodeId>("12").unwrap(), NodeId::Index(12));
    }

    #[test]
    fn test_registry_create() {
        let mut registry = NodeRegistry::new();
        registry.register(
            NodeType::new::<Dummy>("math/dummy", "Dummy")
                .input("a", "number")
                .output("out", "number")
                .property("gain", 2.0),
        );

        assert_eq!(registry.types_in_category("math").count(), 1);
        let node = registry
            .create_node("math/dummy", &EngineConfig::default())
            .unwrap();
        assert_eq!(node.type_name(), "math/dummy");
        assert!(node.id().is_unassigned());
        assert_eq!(node.inputs().len(), 1);
        assert_eq!(node.property("gain"), Some(&Value::from(2.0)));
        assert!(node.behavior_as::<Dummy>().is_some());
        assert!(registry.create_node("math/missing", &EngineConfig::default()).is_none());
    }

    #[test]
    fn test_added_slots_are_unconnected() {
        let registry = {
            let mut registry = NodeRegistry::new();
            registry.register(NodeType::new::<Dummy>("dummy", "Dummy"));
            registry
        };
        let mut node = registry.create_node("dummy", &EngineConfig::default()).unwrap();
        let mut slot = InputSlot::new("x", "number");
        slot.link = Some(crate::link::LinkId(9));
        let index = node.add_input(slot);
        assert_eq!(index, 0);
        assert!(!node.inputs()[0].is_connected());
        assert_eq!(node.find_input("x"), Some(0));
    }
}
