// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persisted graph layout.
//!
//! [`Graph::serialize`] produces a [`GraphDocument`] and [`Graph::configure`]
//! rebuilds a graph from one. Configuring from a document and serializing
//! again yields an equal document. Node types missing from the registry are
//! skipped with a warning and links that no longer resolve are dropped.

use crate::context::EngineContext;
use crate::graph::Graph;
use crate::link::{Link, LinkId};
use crate::node::{Node, NodeFlags, NodeId, NodeMode};
use crate::slot::{InputSlot, OutputSlot};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Layout version written into every document
pub const FORMAT_VERSION: f32 = 0.4;

/// Serialized graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    /// Node id counter
    #[serde(default)]
    pub last_node_id: u64,
    /// Link id counter
    #[serde(default)]
    pub last_link_id: u64,
    /// Nodes in insertion order
    #[serde(default)]
    pub nodes: Vec<NodeDocument>,
    /// Links as flat arrays
    #[serde(default)]
    pub links: Vec<Link>,
    /// Visual groups, opaque to the engine
    #[serde(default)]
    pub groups: Vec<Value>,
    /// Free-form graph settings
    #[serde(default)]
    pub config: IndexMap<String, Value>,
    /// Host data carried along untouched
    #[serde(default)]
    pub extra: IndexMap<String, Value>,
    /// Layout version
    #[serde(default = "format_version")]
    pub version: f32,
}

fn format_version() -> f32 {
    FORMAT_VERSION
}

impl Default for GraphDocument {
    fn default() -> Self {
        Self {
            last_node_id: 0,
            last_link_id: 0,
            nodes: Vec::new(),
            links: Vec::new(),
            groups: Vec::new(),
            config: IndexMap::new(),
            extra: IndexMap::new(),
            version: FORMAT_VERSION,
        }
    }
}

/// Serialized node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDocument {
    /// Node id
    pub id: NodeId,
    /// Registered type string
    #[serde(rename = "type")]
    pub type_name: String,
    /// Display title
    #[serde(default)]
    pub title: String,
    /// Editor position
    #[serde(default)]
    pub pos: [f32; 2],
    /// Editor size
    #[serde(default)]
    pub size: [f32; 2],
    /// Editor flags
    #[serde(default)]
    pub flags: NodeFlags,
    /// Mode code
    #[serde(default)]
    pub mode: NodeMode,
    /// Input slots
    #[serde(default)]
    pub inputs: Vec<InputSlot>,
    /// Output slots
    #[serde(default)]
    pub outputs: Vec<OutputSlot>,
    /// Properties
    #[serde(default)]
    pub properties: IndexMap<String, Value>,
    /// Custom color
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Inner graph of a subgraph node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subgraph: Option<Box<GraphDocument>>,
}

impl GraphDocument {
    /// Compact JSON
    pub fn to_json(&self) -> Result<String, DocumentError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Indented JSON
    pub fn to_json_pretty(&self) -> Result<String, DocumentError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse JSON
    pub fn from_json(source: &str) -> Result<Self, DocumentError> {
        Ok(serde_json::from_str(source)?)
    }

    /// Pretty RON
    pub fn to_ron(&self) -> Result<String, DocumentError> {
        Ok(ron::ser::to_string_pretty(
            self,
            ron::ser::PrettyConfig::default(),
        )?)
    }

    /// Parse RON
    pub fn from_ron(source: &str) -> Result<Self, DocumentError> {
        Ok(ron::from_str(source)?)
    }
}

/// Node left out while configuring a graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedNode {
    /// Id the node had in the document
    pub id: NodeId,
    /// Its unregistered type
    pub type_name: String,
}

/// What [`Graph::configure`] could not restore
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigureReport {
    /// Nodes skipped, including those inside subgraphs
    pub skipped_nodes: Vec<SkippedNode>,
    /// Document nodes rejected because their id was zero or already taken
    pub rejected_ids: Vec<NodeId>,
    /// Links dropped because an endpoint was missing
    pub dropped_links: usize,
}

impl ConfigureReport {
    /// Whether everything was restored
    pub fn is_complete(&self) -> bool {
        self.skipped_nodes.is_empty() && self.rejected_ids.is_empty() && self.dropped_links == 0
    }

    fn merge(&mut self, other: ConfigureReport) {
        self.skipped_nodes.extend(other.skipped_nodes);
        self.rejected_ids.extend(other.rejected_ids);
        self.dropped_links += other.dropped_links;
    }
}

impl Node {
    /// Serialized form of this node
    pub fn to_document(&self) -> NodeDocument {
        NodeDocument {
            id: self.id,
            type_name: self.type_name.clone(),
            title: self.title.clone(),
            pos: self.pos,
            size: self.size,
            flags: self.flags,
            mode: self.mode,
            inputs: self.inputs.clone(),
            outputs: self
                .outputs
                .iter()
                .map(|output| OutputSlot {
                    value: None,
                    ..output.clone()
                })
                .collect(),
            properties: self.properties.clone(),
            color: self.color.clone(),
            subgraph: self
                .behavior
                .as_deref()
                .and_then(|behavior| behavior.inner_graph())
                .map(|inner| Box::new(inner.serialize())),
        }
    }

    fn apply_document(&mut self, doc: &NodeDocument) {
        self.id = doc.id;
        self.title = doc.title.clone();
        self.pos = doc.pos;
        self.size = doc.size;
        self.flags = doc.flags;
        self.color = doc.color.clone();
        self.mode = doc.mode;
        self.inputs = doc.inputs.clone();
        self.outputs = doc.outputs.clone();
        for (name, value) in &doc.properties {
            self.properties.insert(name.clone(), value.clone());
        }
    }
}

impl Graph {
    /// Serialize the graph
    pub fn serialize(&self) -> GraphDocument {
        GraphDocument {
            last_node_id: self.last_node_id,
            last_link_id: self.last_link_id,
            nodes: self.nodes.values().map(Node::to_document).collect(),
            links: self.links.values().cloned().collect(),
            groups: self.groups.clone(),
            config: self.settings.clone(),
            extra: self.extra.clone(),
            version: FORMAT_VERSION,
        }
    }

    /// Replace the graph's contents with a document.
    ///
    /// Nodes are created through the context's registry. Unknown types and
    /// links that do not resolve are reported rather than failing the load.
    pub fn configure(&mut self, doc: &GraphDocument, engine: &EngineContext) -> ConfigureReport {
        self.clear();
        let mut report = ConfigureReport::default();
        self.last_node_id = doc.last_node_id;
        self.last_link_id = doc.last_link_id;
        self.groups = doc.groups.clone();
        self.settings = doc.config.clone();
        self.extra = doc.extra.clone();

        for node_doc in &doc.nodes {
            if self.nodes.contains_key(&node_doc.id) || node_doc.id.is_unassigned() {
                tracing::warn!(node = %node_doc.id, "duplicate or missing node id in document; skipping");
                report.rejected_ids.push(node_doc.id);
                continue;
            }
            let Some(mut node) = engine.create_node(&node_doc.type_name) else {
                report.skipped_nodes.push(SkippedNode {
                    id: node_doc.id,
                    type_name: node_doc.type_name.clone(),
                });
                continue;
            };
            node.apply_document(node_doc);
            if let Some(sub_doc) = &node_doc.subgraph {
                match node
                    .behavior
                    .as_deref_mut()
                    .and_then(|behavior| behavior.inner_graph_mut())
                {
                    Some(inner) => report.merge(inner.configure(sub_doc, engine)),
                    None => {
                        tracing::warn!(node = %node_doc.id, type_name = %node_doc.type_name, "subgraph document on a node without an inner graph");
                    }
                }
            }
            self.add_node(node);
        }

        for link in &doc.links {
            if self.link_resolves(link) && !self.links.contains_key(&link.id) {
                self.links.insert(link.id, link.clone());
                self.last_link_id = self.last_link_id.max(link.id.0);
            } else {
                report.dropped_links += 1;
            }
        }
        report.dropped_links += self.repair_slot_links();
        self.bump_version();

        if report.is_complete() {
            tracing::info!(nodes = self.nodes.len(), links = self.links.len(), "graph configured");
        } else {
            tracing::warn!(
                nodes = self.nodes.len(),
                links = self.links.len(),
                skipped = report.skipped_nodes.len(),
                rejected = report.rejected_ids.len(),
                dropped_links = report.dropped_links,
                "graph configured with losses"
            );
        }
        report
    }

    fn link_resolves(&self, link: &Link) -> bool {
        let origin_ok = self
            .nodes
            .get(&link.origin_id)
            .is_some_and(|node| link.origin_slot < node.outputs.len());
        let target_ok = self
            .nodes
            .get(&link.target_id)
            .is_some_and(|node| link.target_slot < node.inputs.len());
        origin_ok && target_ok
    }

    /// Make slot link references agree with the link table. Returns the
    /// number of links removed because their input was taken.
    fn repair_slot_links(&mut self) -> usize {
        let table: Vec<Link> = self.links.values().cloned().collect();
        let known: HashSet<LinkId> = table.iter().map(|link| link.id).collect();

        let mut orphaned = Vec::new();
        for link in &table {
            let Some(input) = self
                .nodes
                .get_mut(&link.target_id)
                .and_then(|node| node.inputs.get_mut(link.target_slot))
            else {
                continue;
            };
            match input.link {
                Some(current) if current == link.id => {}
                Some(current) if known.contains(&current) => orphaned.push(link.id),
                _ => input.link = Some(link.id),
            }
        }
        for id in &orphaned {
            self.links.shift_remove(id);
        }

        for node in self.nodes.values_mut() {
            let node_id = node.id;
            for (index, input) in node.inputs.iter_mut().enumerate() {
                if let Some(id) = input.link {
                    let valid = self.links.get(&id).is_some_and(|link| {
                        link.target_id == node_id && link.target_slot == index
                    });
                    if !valid {
                        input.link = None;
                    }
                }
            }
            for (index, output) in node.outputs.iter_mut().enumerate() {
                output.links.retain(|id| {
                    self.links.get(id).is_some_and(|link| {
                        link.origin_id == node_id && link.origin_slot == index
                    })
                });
            }
        }
        for link in self.links.values() {
            if let Some(output) = self
                .nodes
                .get_mut(&link.origin_id)
                .and_then(|node| node.outputs.get_mut(link.origin_slot))
            {
                if !output.links.contains(&link.id) {
                    output.links.push(link.id);
                }
            }
        }
        orphaned.len()
    }

    /// Serialize to compact JSON
    pub fn to_json(&self) -> Result<String, DocumentError> {
        self.serialize().to_json()
    }

    /// Serialize to pretty RON
    pub fn to_ron(&self) -> Result<String, DocumentError> {
        self.serialize().to_ron()
    }

    /// Replace the graph's contents with a JSON document
    pub fn load_json(&mut self, source: &str, engine: &EngineContext) -> Result<ConfigureReport, DocumentError> {
        let doc = GraphDocument::from_json(source)?;
        Ok(self.configure(&doc, engine))
    }

    /// Replace the graph's contents with a RON document
    pub fn load_ron(&mut self, source: &str, engine: &EngineContext) -> Result<ConfigureReport, DocumentError> {
        let doc = GraphDocument::from_ron(source)?;
        Ok(self.configure(&doc, engine))
    }
}

/// Error reading or writing a document
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// JSON failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// RON parse failure
    #[error("RON parse error: {0}")]
    RonParse(#[from] ron::error::SpannedError),

    /// RON write failure
    #[error("RON error: {0}")]
    RonWrite(#[from] ron::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EngineConfig;
    use crate::nodes::basic::{CONST_NUMBER_TYPE, WATCH_TYPE};

    fn pipeline(engine: &EngineContext) -> Graph {
        let mut graph = engine.create_graph();
        let constant = graph.add_node(
            engine
                .create_node(CONST_NUMBER_TYPE)
                .unwrap()
                .with_property("value", 10.0)
                .with_position(20.0, 40.0),
        );
        let watch = graph.add_node(engine.create_node(WATCH_TYPE).unwrap());
        graph.connect(constant, 0, watch, 0).unwrap();
        graph
    }

    #[test]
    fn test_document_layout() {
        let engine = EngineContext::with_builtin_nodes(EngineConfig::default());
        let doc = pipeline(&engine).serialize();
        let json: Value = serde_json::from_str(&doc.to_json().unwrap()).unwrap();

        assert_eq!(json["links"][0], serde_json::json!([1, 1, 0, 2, 0, "number"]));
        assert_eq!(json["nodes"][0]["type"], "basic/const");
        assert_eq!(json["nodes"][0]["mode"], 0);
        assert_eq!(json["nodes"][0]["outputs"][0]["links"], serde_json::json!([1]));
        assert_eq!(json["nodes"][1]["inputs"][0]["link"], 1);
        assert_eq!(json["version"].as_f64().map(|v| v as f32), Some(FORMAT_VERSION));
    }

    #[test]
    fn test_configure_round_trip() {
        let engine = EngineContext::with_builtin_nodes(EngineConfig::default());
        let mut original = pipeline(&engine);
        original.run_step(1).unwrap();
        let doc = original.serialize();

        let mut restored = engine.create_graph();
        let report = restored.configure(&doc, &engine);
        assert!(report.is_complete());
        assert_eq!(restored.serialize(), doc);
    }

    #[test]
    fn test_unknown_type_is_skipped() {
        let engine = EngineContext::with_builtin_nodes(EngineConfig::default());
        let mut doc = pipeline(&engine).serialize();
        doc.nodes[0].type_name = "retired/type".into();

        let mut graph = engine.create_graph();
        let report = graph.configure(&doc, &engine);
        assert_eq!(
            report.skipped_nodes,
            vec![SkippedNode {
                id: NodeId::Index(1),
                type_name: "retired/type".into()
            }]
        );
        assert_eq!(report.dropped_links, 1);
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.link_count(), 0);
        assert!(graph.node(NodeId::Index(2)).unwrap().inputs()[0].link.is_none());
    }

    #[test]
    fn test_duplicate_and_zero_ids_are_reported() {
        let engine = EngineContext::with_builtin_nodes(EngineConfig::default());
        let mut doc = pipeline(&engine).serialize();
        doc.nodes[1].id = NodeId::Index(1);
        let mut unassigned = doc.nodes[0].clone();
        unassigned.id = NodeId::UNASSIGNED;
        doc.nodes.push(unassigned);

        let mut graph = engine.create_graph();
        let report = graph.configure(&doc, &engine);
        assert_eq!(report.rejected_ids, vec![NodeId::Index(1), NodeId::UNASSIGNED]);
        assert!(report.skipped_nodes.is_empty());
        assert!(!report.is_complete());
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn test_configure_resumes_counters() {
        let engine = EngineContext::with_builtin_nodes(EngineConfig::default());
        let doc = pipeline(&engine).serialize();
        let mut graph = engine.create_graph();
        graph.configure(&doc, &engine);

        let next = graph.add_node(engine.create_node(WATCH_TYPE).unwrap());
        assert_eq!(next, NodeId::Index(3));
        let link = graph.connect(NodeId::Index(1), 0, next, 0).unwrap();
        assert_eq!(link, LinkId(2));
    }

    #[test]
    fn test_ron_round_trip() {
        let engine = EngineContext::with_builtin_nodes(EngineConfig::default());
        let graph = pipeline(&engine);
        let text = graph.to_ron().unwrap();

        let mut restored = engine.create_graph();
        let report = restored.load_ron(&text, &engine).unwrap();
        assert!(report.is_complete());
        assert_eq!(restored.serialize(), graph.serialize());
    }

    #[test]
    fn test_bad_json_is_an_error() {
        assert!(matches!(
            GraphDocument::from_json("{\"nodes\": 3}"),
            Err(DocumentError::Json(_))
        ));
    }
}
