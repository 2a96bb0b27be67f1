// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dataflow graph execution engine.
//!
//! Typed nodes are wired into a directed graph and evaluated step by step,
//! with values travelling along data links and discrete events along
//! trigger links.
//!
//! ## Architecture
//!
//! - [`slot`]: slot types and the connection compatibility rule
//! - [`link`]: links and their flat wire form
//! - [`node`]: nodes, modes, the [`NodeBehavior`] trait and the type registry
//! - [`graph`]: the graph owning nodes, the link table and named I/O
//! - [`scheduler`]: cached cycle-tolerant execution order and `run_step`
//! - [`evaluation`]: node callback context and the synchronous event router
//! - [`document`]: serialization and `configure`
//! - [`context`]: the explicit engine context (registry plus settings)
//! - [`nodes`]: built-in node types, including the subgraph adapter
//!
//! ## Example
//!
//! ```
//! use nodeflow_graph::{EngineConfig, EngineContext};
//! use nodeflow_graph::nodes::basic::{Watch, CONST_NUMBER_TYPE, WATCH_TYPE};
//!
//! let engine = EngineContext::with_builtin_nodes(EngineConfig::default());
//! let mut graph = engine.create_graph();
//! let constant = graph.add_node(
//!     engine.create_node(CONST_NUMBER_TYPE).unwrap().with_property("value", 10),
//! );
//! let watch = graph.add_node(engine.create_node(WATCH_TYPE).unwrap());
//! graph.connect(constant, 0, watch, 0).unwrap();
//!
//! graph.run_step(1).unwrap();
//! assert_eq!(
//!     graph.behavior::<Watch>(watch).unwrap().value(),
//!     Some(&serde_json::Value::from(10))
//! );
//! ```

pub mod context;
pub mod document;
pub mod evaluation;
pub mod graph;
pub mod link;
pub mod node;
pub mod nodes;
pub mod scheduler;
pub mod slot;

pub use context::{ConfigError, EngineConfig, EngineContext};
pub use document::{ConfigureReport, DocumentError, GraphDocument, NodeDocument};
pub use evaluation::NodeContext;
pub use graph::{
    BoundaryChange, ConnectionError, Graph, GraphError, GraphHooks, GraphId, GraphStatus,
};
pub use link::{Link, LinkId};
pub use node::{
    ActionOptions, Node, NodeBehavior, NodeError, NodeId, NodeMode, NodeRegistry, NodeType,
};
pub use slot::{is_valid_connection, InputSlot, OutputSlot, SlotType};
