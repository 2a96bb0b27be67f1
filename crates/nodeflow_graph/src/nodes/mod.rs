// SPDX-License-Identifier: MIT OR Apache-2.0
//! Built-in node types.
//!
//! The graph boundary and subgraph types are needed by the engine itself; the
//! basic types cover constants, inspection and timed events.

pub mod basic;
pub mod boundary;
pub mod subgraph;

use crate::node::NodeRegistry;

/// Register every built-in node type
pub fn register_builtin_nodes(registry: &mut NodeRegistry) {
    // Graph plumbing
    boundary::register(registry);
    subgraph::register(registry);

    // Basic values and events
    basic::register(registry);
}
