// SPDX-License-Identifier: MIT OR Apache-2.0
//! Execution order and the per-step pass.
//!
//! The order is a stable sort of the scheduled nodes by topological level,
//! insertion order breaking ties. Levels follow data links only; event links
//! are routed out of band and never constrain the order. A data cycle does not
//! fail: its members collapse into one strongly connected component that gets
//! a single level, so the cyclic part reads values from the previous step
//! while nodes downstream of it still run after it.
//!
//! The computed order is cached against the graph version.

use crate::graph::{Graph, GraphError, GraphStatus, NodePhase};
use crate::node::{NodeId, NodeMode};
use std::sync::Arc;
use std::time::Instant;

/// Cached execution order, valid for one graph version
#[derive(Debug, Clone)]
pub(crate) struct OrderCache {
    version: u64,
    order: Arc<[NodeId]>,
}

impl Graph {
    /// Order in which the per-step pass visits nodes.
    ///
    /// Recomputed only when the graph version changed since the last call.
    pub fn execution_order(&mut self) -> Arc<[NodeId]> {
        if let Some(cache) = &self.order_cache {
            if cache.version == self.version {
                return Arc::clone(&cache.order);
            }
        }
        let order: Arc<[NodeId]> = self.compute_execution_order().into();
        tracing::trace!(graph = %self.id(), nodes = order.len(), version = self.version, "execution order rebuilt");
        self.order_cache = Some(OrderCache {
            version: self.version,
            order: Arc::clone(&order),
        });
        order
    }

    /// Whether the cached order matches the current version
    pub fn is_order_cached(&self) -> bool {
        self.order_cache
            .as_ref()
            .is_some_and(|cache| cache.version == self.version)
    }

    /// Compute the order from scratch, bypassing the cache
    pub fn compute_execution_order(&self) -> Vec<NodeId> {
        let levels = self.node_levels();
        let mut order: Vec<(usize, NodeId)> = self
            .nodes
            .values()
            .zip(levels)
            .filter(|(node, _)| node.mode.is_scheduled())
            .map(|(node, level)| (level, node.id))
            .collect();
        // stable: equal levels keep insertion order
        order.sort_by_key(|(level, _)| *level);
        order.into_iter().map(|(_, id)| id).collect()
    }

    /// Topological level of every node, in insertion order.
    ///
    /// Nodes on a data cycle share the level of their strongly connected
    /// component, and everything downstream of the cycle is layered after it.
    pub fn node_levels(&self) -> Vec<usize> {
        let count = self.nodes.len();
        let mut successors = vec![Vec::new(); count];
        for link in self
            .links
            .values()
            .filter(|link| !link.is_event() && link.origin_id != link.target_id)
        {
            if let (Some(origin), Some(target)) = (
                self.nodes.get_index_of(&link.origin_id),
                self.nodes.get_index_of(&link.target_id),
            ) {
                successors[origin].push(target);
            }
        }

        let (component, component_count) = strongly_connected(&successors);
        let mut sizes = vec![0usize; component_count];
        for &c in &component {
            sizes[c] += 1;
        }
        if sizes.iter().any(|&size| size > 1) {
            tracing::warn!(graph = %self.id(), "data links form a cycle; nodes on it read values from the previous step");
        }

        // longest path over the condensation, which is acyclic
        let mut condensed = vec![Vec::new(); component_count];
        let mut indegree = vec![0usize; component_count];
        for (origin, targets) in successors.iter().enumerate() {
            for &target in targets {
                let (from, to) = (component[origin], component[target]);
                if from != to {
                    condensed[from].push(to);
                    indegree[to] += 1;
                }
            }
        }
        let mut levels = vec![0usize; component_count];
        let mut ready: Vec<usize> = (0..component_count)
            .filter(|&c| indegree[c] == 0)
            .collect();
        while let Some(current) = ready.pop() {
            for &next in &condensed[current] {
                levels[next] = levels[next].max(levels[current] + 1);
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push(next);
                }
            }
        }
        component.iter().map(|&c| levels[c]).collect()
    }

    /// Run `steps` evaluation passes regardless of run status
    pub fn run_step(&mut self, steps: usize) -> Result<(), GraphError> {
        for _ in 0..steps {
            self.step_once()?;
        }
        Ok(())
    }

    /// Run one pass if the graph is running. Returns whether a pass ran.
    pub fn update(&mut self) -> Result<bool, GraphError> {
        if self.status != GraphStatus::Running {
            return Ok(false);
        }
        self.step_once()?;
        Ok(true)
    }

    fn step_once(&mut self) -> Result<(), GraphError> {
        self.iteration += 1;
        self.advance_clock();
        let iteration = self.iteration;
        self.with_hooks(|hooks| hooks.on_before_step(iteration));

        if self.enabled {
            let order = self.execution_order();
            for &id in order.iter() {
                self.run_scheduled(id)?;
            }
        }

        self.with_hooks(|hooks| hooks.on_after_step(iteration));
        Ok(())
    }

    fn advance_clock(&mut self) {
        let elapsed = match self.config.fixed_time_step {
            Some(step) => step,
            None => {
                let now = Instant::now();
                let elapsed = self
                    .last_update
                    .map_or(0.0, |last| now.duration_since(last).as_secs_f64());
                self.last_update = Some(now);
                elapsed
            }
        };
        self.elapsed_time = elapsed;
        self.globaltime += elapsed;
    }

    fn run_scheduled(&mut self, id: NodeId) -> Result<(), GraphError> {
        // nodes removed or re-moded since the order was built are skipped
        let Some(node) = self.nodes.get_mut(&id) else {
            return Ok(());
        };
        match node.mode {
            NodeMode::Always => {}
            NodeMode::OnEvent if node.pending_event => node.pending_event = false,
            _ => return Ok(()),
        }
        self.execute_node(id)
    }

    /// Run a node's per-step callback now, whatever its mode
    pub fn execute_node(&mut self, id: NodeId) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&id) {
            return Err(GraphError::NodeNotFound(id));
        }
        match self.with_behavior(id, 0, |behavior, ctx| behavior.on_execute(ctx)) {
            Some(Err(error)) => self.absorb_node_error(id, NodePhase::Execute, error),
            _ => Ok(()),
        }
    }
}

/// Strongly connected components (iterative Tarjan). Returns the component
/// index of every vertex and the number of components.
fn strongly_connected(successors: &[Vec<usize>]) -> (Vec<usize>, usize) {
    const UNVISITED: usize = usize::MAX;
    let count = successors.len();
    let mut index = vec![UNVISITED; count];
    let mut lowlink = vec![0usize; count];
    let mut on_stack = vec![false; count];
    let mut stack = Vec::new();
    let mut component = vec![0usize; count];
    let mut components = 0;
    let mut next_index = 0;

    for root in 0..count {
        if index[root] != UNVISITED {
            continue;
        }
        index[root] = next_index;
        lowlink[root] = next_index;
        next_index += 1;
        stack.push(root);
        on_stack[root] = true;
        // (vertex, position of the next successor to visit)
        let mut frames = vec![(root, 0usize)];

        while let Some(frame) = frames.last_mut() {
            let vertex = frame.0;
            if let Some(&next) = successors[vertex].get(frame.1) {
                frame.1 += 1;
                if index[next] == UNVISITED {
                    index[next] = next_index;
                    lowlink[next] = next_index;
                    next_index += 1;
                    stack.push(next);
                    on_stack[next] = true;
                    frames.push((next, 0));
                } else if on_stack[next] {
                    lowlink[vertex] = lowlink[vertex].min(index[next]);
                }
                continue;
            }

            frames.pop();
            if let Some(&(parent, _)) = frames.last() {
                lowlink[parent] = lowlink[parent].min(lowlink[vertex]);
            }
            if lowlink[vertex] == index[vertex] {
                while let Some(member) = stack.pop() {
                    on_stack[member] = false;
                    component[member] = components;
                    if member == vertex {
                        break;
                    }
                }
                components += 1;
            }
        }
    }
    (component, components)
}
