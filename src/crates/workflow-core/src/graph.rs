//! The dependency graph: nodes keyed by actionID, `Requires` adjacency, cycle
//! detection, and the topological order restricted to one target's closure.
//!
//! # Example
//!
//! ```rust
//! use workflow_core::graph::Graph;
//!
//! let mut graph = Graph::new();
//! graph.add_resource("a", vec![]).unwrap();
//! graph.add_resource("b", vec!["a".to_string()]).unwrap();
//! graph.add_resource("c", vec!["b".to_string()]).unwrap();
//! graph.build().unwrap();
//!
//! assert_eq!(graph.execution_order("c").unwrap(), vec!["a", "b", "c"]);
//! ```

use crate::error::{EngineError, Result};
use std::collections::{HashMap, HashSet};

/// One node of the graph: an actionID and its declared `Requires` list, kept
/// in the order resources were added so topo-sort ties break deterministically.
#[derive(Debug, Clone)]
struct Node {
    /// insertion index, used to break ties deterministically
    order: usize,
    requires: Vec<String>,
}

/// The dependency graph built from a workflow's resource list.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: HashMap<String, Node>,
    /// insertion order of action ids, for stable iteration
    insertion_order: Vec<String>,
    built: bool,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource's actionID and its `Requires` edges.
    ///
    /// Fails with [`EngineError::DuplicateAction`] if `action_id` was already added.
    pub fn add_resource(&mut self, action_id: impl Into<String>, requires: Vec<String>) -> Result<()> {
        let action_id = action_id.into();
        if self.nodes.contains_key(&action_id) {
            return Err(EngineError::DuplicateAction(action_id));
        }
        let order = self.insertion_order.len();
        self.insertion_order.push(action_id.clone());
        self.nodes.insert(action_id, Node { order, requires });
        self.built = false;
        Ok(())
    }

    /// Validates every `Requires` edge points at a known action. Idempotent —
    /// safe to call repeatedly; cycle detection itself happens lazily inside
    /// [`execution_order`](Self::execution_order) so a cycle outside the
    /// requested target's closure never blocks unrelated runs.
    pub fn build(&mut self) -> Result<()> {
        for (action_id, node) in &self.nodes {
            for dep in &node.requires {
                if !self.nodes.contains_key(dep) {
                    return Err(EngineError::UnknownDependency {
                        resource: action_id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        self.built = true;
        Ok(())
    }

    pub fn contains(&self, action_id: &str) -> bool {
        self.nodes.contains_key(action_id)
    }

    /// Computes the topological order of `target`'s transitive `Requires`
    /// closure (target included). Order is a stable function of insertion
    /// order: among resources with no ordering constraint between them, the
    /// one declared first in the workflow comes first.
    ///
    /// Uses iterative DFS with an explicit recursion stack so a cycle inside
    /// the reachable subgraph is always reported, whether or not
    /// [`build`](Self::build) was called first.
    pub fn execution_order(&self, target: &str) -> Result<Vec<String>> {
        if !self.nodes.contains_key(target) {
            return Err(EngineError::UnknownTarget(target.to_string()));
        }

        let mut visited: HashSet<String> = HashSet::new();
        let mut on_stack: HashSet<String> = HashSet::new();
        let mut order: Vec<String> = Vec::new();
        let mut stack: Vec<Frame> = Vec::new();

        stack.push(self.open_frame(target, &mut on_stack)?);

        while let Some(frame) = stack.last_mut() {
            match frame.deps.get(frame.next).cloned() {
                Some(dep) => {
                    frame.next += 1;
                    if visited.contains(&dep) {
                        continue;
                    }
                    if on_stack.contains(&dep) {
                        return Err(EngineError::DependencyCycle(dep));
                    }
                    stack.push(self.open_frame(&dep, &mut on_stack)?);
                }
                None => {
                    let frame = stack.pop().expect("stack non-empty in this arm");
                    on_stack.remove(&frame.action_id);
                    visited.insert(frame.action_id.clone());
                    order.push(frame.action_id);
                }
            }
        }

        Ok(order)
    }

    /// Opens a stack frame for `action_id`: looks up its node, sorts its
    /// `requires` into declared order, and marks it on-stack.
    fn open_frame(&self, action_id: &str, on_stack: &mut HashSet<String>) -> Result<Frame> {
        let node = self
            .nodes
            .get(action_id)
            .ok_or_else(|| EngineError::UnknownDependency {
                resource: action_id.to_string(),
                dependency: action_id.to_string(),
            })?;

        let mut deps = node.requires.clone();
        deps.sort_by_key(|d| self.nodes.get(d).map(|n| n.order).unwrap_or(usize::MAX));

        on_stack.insert(action_id.to_string());
        Ok(Frame {
            action_id: action_id.to_string(),
            deps,
            next: 0,
        })
    }
}

/// One level of the explicit recursion stack used by [`Graph::execution_order`]:
/// the node being visited, its dependencies in visit order, and how many of
/// them have already been pushed.
struct Frame {
    action_id: String,
    deps: Vec<String>,
    next: usize,
}
