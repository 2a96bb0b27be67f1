// SPDX-License-Identifier: MIT OR Apache-2.0
//! Engine context: the node type registry plus engine-wide settings.
//!
//! One context is built per process (or per test) and passed explicitly to
//! node creation and document loading.

use crate::graph::Graph;
use crate::node::{Node, NodeRegistry, NodeType};
use crate::nodes;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default bound on event cascade depth
pub const DEFAULT_MAX_EVENT_DEPTH: usize = 256;

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Log and skip failing node callbacks instead of aborting the step
    pub catch_errors: bool,
    /// Assign UUID node ids instead of counter ids
    pub use_uuids: bool,
    /// Deepest allowed event cascade
    pub max_event_depth: usize,
    /// Fixed step length in seconds; wall clock when unset
    pub fixed_time_step: Option<f64>,
    /// Allow EVENT outputs to fan out to several actions
    pub multi_output_events: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            catch_errors: true,
            use_uuids: false,
            max_event_depth: DEFAULT_MAX_EVENT_DEPTH,
            fixed_time_step: None,
            multi_output_events: true,
        }
    }
}

impl EngineConfig {
    /// Parse a RON settings string
    pub fn from_ron_str(source: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(source)?)
    }

    /// Load settings from a RON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_ron_str(&source)?;
        tracing::debug!(path = %path.display(), ?config, "loaded engine config");
        Ok(config)
    }

    /// Serialize to pretty RON
    pub fn to_ron(&self) -> Result<String, ConfigError> {
        Ok(ron::ser::to_string_pretty(
            self,
            ron::ser::PrettyConfig::default(),
        )?)
    }
}

/// Error loading engine settings
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// Settings did not parse
    #[error("Invalid config: {0}")]
    Parse(#[from] ron::error::SpannedError),

    /// Settings did not serialize
    #[error("Failed to write config: {0}")]
    Write(#[from] ron::Error),
}

/// Registry and settings shared by every graph built from it
#[derive(Debug, Default)]
pub struct EngineContext {
    registry: NodeRegistry,
    config: EngineConfig,
}

impl EngineContext {
    /// Context with an empty registry
    pub fn new(config: EngineConfig) -> Self {
        Self {
            registry: NodeRegistry::new(),
            config,
        }
    }

    /// Context with the built-in node types registered
    pub fn with_builtin_nodes(config: EngineConfig) -> Self {
        let mut context = Self::new(config);
        nodes::register_builtin_nodes(&mut context.registry);
        context
    }

    /// The node type registry
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Mutable registry, for plugins registering their types
    pub fn registry_mut(&mut self) -> &mut NodeRegistry {
        &mut self.registry
    }

    /// Register a node type
    pub fn register(&mut self, node_type: NodeType) {
        self.registry.register(node_type);
    }

    /// Engine settings
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Instantiate a registered node type. Unknown types are logged and
    /// yield `None`.
    pub fn create_node(&self, type_name: &str) -> Option<Node> {
        let node = self.registry.create_node(type_name, &self.config);
        if node.is_none() {
            tracing::warn!(type_name, "node type not registered");
        }
        node
    }

    /// Create an empty graph using these settings
    pub fn create_graph(&self) -> Graph {
        Graph::new(self.config.clone())
    }
}
