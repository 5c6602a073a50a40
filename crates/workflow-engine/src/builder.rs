//! Fluent builder for workflow graphs
//!
//! Provides a fluent API for constructing a `BuiltWorkflow` programmatically.
//! `build()` derives dependencies, dependents, depths and execution levels
//! from the declared edges.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{EngineError, Result};
use crate::types::{
    BuiltEdge, BuiltNode, BuiltWorkflow, LoopContext, NodeId, NodeKind, DEFAULT_HANDLE,
    DEFAULT_MAX_CONCURRENT_NODES,
};

/// Which node `with_config` applies to
enum LastAdded {
    None,
    Node(usize),
    Body(NodeId, usize),
}

/// Fluent builder for constructing workflow graphs
///
/// # Example
///
/// ```ignore
/// let graph = WorkflowBuilder::new("wf-1", "My Workflow")
///     .add_node("trigger", NodeKind::Trigger)
///     .add_node("fetch", NodeKind::Transform)
///     .with_config(serde_json::json!({"url": "https://example.com"}))
///     .add_edge("trigger", "fetch")
///     .build()?;
/// ```
pub struct WorkflowBuilder {
    id: String,
    name: String,
    nodes: Vec<BuiltNode>,
    edges: Vec<BuiltEdge>,
    loop_bodies: Vec<(NodeId, Vec<BuiltNode>)>,
    max_concurrent_nodes: usize,
    edge_counter: usize,
    last: LastAdded,
}

impl WorkflowBuilder {
    /// Create a new workflow builder
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            loop_bodies: Vec::new(),
            max_concurrent_nodes: DEFAULT_MAX_CONCURRENT_NODES,
            edge_counter: 0,
            last: LastAdded::None,
        }
    }

    /// Add a node to the graph
    pub fn add_node(mut self, id: impl Into<String>, kind: NodeKind) -> Self {
        self.nodes.push(BuiltNode::new(id, kind));
        self.last = LastAdded::Node(self.nodes.len() - 1);
        self
    }

    /// Set config on the most recently added node (or loop body node)
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        match &self.last {
            LastAdded::Node(idx) => {
                if let Some(node) = self.nodes.get_mut(*idx) {
                    node.config = config;
                }
            }
            LastAdded::Body(loop_id, idx) => {
                if let Some(node) = self
                    .loop_bodies
                    .iter_mut()
                    .find(|(id, _)| id == loop_id)
                    .and_then(|(_, body)| body.get_mut(*idx))
                {
                    node.config = config;
                }
            }
            LastAdded::None => {}
        }
        self
    }

    /// Append a body node to a loop. Body nodes run in the order added.
    pub fn add_loop_body(
        mut self,
        loop_id: impl Into<String>,
        id: impl Into<String>,
        kind: NodeKind,
    ) -> Self {
        let loop_id = loop_id.into();
        let pos = match self.loop_bodies.iter().position(|(l, _)| *l == loop_id) {
            Some(pos) => pos,
            None => {
                self.loop_bodies.push((loop_id.clone(), Vec::new()));
                self.loop_bodies.len() - 1
            }
        };
        let body = &mut self.loop_bodies[pos].1;
        let mut node = BuiltNode::new(id, kind);
        node.declaration_index = body.len();
        if let Some(prev) = body.last_mut() {
            prev.dependents.push(node.id.clone());
            node.dependencies.push(prev.id.clone());
            node.depth = prev.depth + 1;
        }
        body.push(node);
        self.last = LastAdded::Body(loop_id, body.len() - 1);
        self
    }

    /// Add an edge between two nodes on the default handle
    pub fn add_edge(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.add_edge_with_handle(source, DEFAULT_HANDLE, target)
    }

    /// Add an edge leaving a named source handle (e.g. a switch case label)
    pub fn add_edge_with_handle(
        mut self,
        source: impl Into<String>,
        source_handle: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.edge_counter += 1;
        self.edges.push(BuiltEdge {
            id: format!("edge-{}", self.edge_counter),
            source: source.into(),
            source_handle: source_handle.into(),
            target: target.into(),
            target_handle: "input".to_string(),
        });
        self
    }

    /// Set the admission limit for concurrently executing nodes
    pub fn max_concurrent_nodes(mut self, max: usize) -> Self {
        self.max_concurrent_nodes = max.max(1);
        self
    }

    /// Build the graph, deriving dependencies, depths and execution levels
    pub fn build(self) -> Result<BuiltWorkflow> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(EngineError::invalid_graph(format!(
                    "Duplicate node id '{}'",
                    node.id
                )));
            }
        }

        let mut nodes: BTreeMap<NodeId, BuiltNode> = BTreeMap::new();
        for (index, mut node) in self.nodes.into_iter().enumerate() {
            node.declaration_index = index;
            nodes.insert(node.id.clone(), node);
        }

        for edge in &self.edges {
            for end in [&edge.source, &edge.target] {
                if !nodes.contains_key(end) {
                    return Err(EngineError::invalid_graph(format!(
                        "Edge '{}' references unknown node '{}'",
                        edge.id, end
                    )));
                }
            }
            if let Some(target) = nodes.get_mut(&edge.target) {
                if !target.dependencies.contains(&edge.source) {
                    target.dependencies.push(edge.source.clone());
                }
            }
            if let Some(source) = nodes.get_mut(&edge.source) {
                if !source.dependents.contains(&edge.target) {
                    source.dependents.push(edge.target.clone());
                }
            }
        }

        let order: HashMap<NodeId, usize> = nodes
            .values()
            .map(|n| (n.id.clone(), n.declaration_index))
            .collect();
        let rank = |id: &NodeId| order.get(id).copied().unwrap_or(usize::MAX);
        for node in nodes.values_mut() {
            node.dependencies.sort_by_key(|id| rank(id));
            node.dependents.sort_by_key(|id| rank(id));
        }

        let execution_levels = compute_levels(&mut nodes, &rank)?;

        // Nested loops are declared as body nodes of an outer loop.
        let nested_loops: HashSet<NodeId> = self
            .loop_bodies
            .iter()
            .flat_map(|(_, body)| body.iter())
            .filter(|n| n.kind == NodeKind::Loop)
            .map(|n| n.id.clone())
            .collect();

        let mut loop_contexts = BTreeMap::new();
        for (loop_id, body) in self.loop_bodies {
            let is_loop = nodes
                .get(&loop_id)
                .map(|n| n.kind == NodeKind::Loop)
                .unwrap_or(false);
            if !is_loop && !nested_loops.contains(&loop_id) {
                return Err(EngineError::invalid_graph(format!(
                    "Loop body declared for '{}', which is not a loop node",
                    loop_id
                )));
            }
            loop_contexts.insert(
                loop_id.clone(),
                LoopContext {
                    loop_node_id: loop_id,
                    body,
                },
            );
        }

        let mut ordered: Vec<&BuiltNode> = nodes.values().collect();
        ordered.sort_by_key(|n| n.declaration_index);

        let trigger_node_id = ordered
            .iter()
            .find(|n| n.dependencies.is_empty() && n.kind == NodeKind::Trigger)
            .or_else(|| ordered.iter().find(|n| n.dependencies.is_empty()))
            .map(|n| n.id.clone());

        let mut output_node_ids: Vec<NodeId> = ordered
            .iter()
            .filter(|n| n.kind == NodeKind::Output)
            .map(|n| n.id.clone())
            .collect();
        if output_node_ids.is_empty() {
            output_node_ids = ordered
                .iter()
                .filter(|n| n.dependents.is_empty())
                .map(|n| n.id.clone())
                .collect();
        }

        Ok(BuiltWorkflow {
            id: self.id,
            name: self.name,
            nodes,
            edges: self.edges,
            execution_levels,
            loop_contexts,
            max_concurrent_nodes: self.max_concurrent_nodes,
            trigger_node_id,
            output_node_ids,
        })
    }
}

/// Layer nodes by longest dependency chain, recording each node's depth.
fn compute_levels(
    nodes: &mut BTreeMap<NodeId, BuiltNode>,
    rank: &impl Fn(&NodeId) -> usize,
) -> Result<Vec<Vec<NodeId>>> {
    let mut remaining: HashMap<NodeId, usize> = nodes
        .values()
        .map(|n| (n.id.clone(), n.dependencies.len()))
        .collect();
    let mut depths: HashMap<NodeId, usize> = HashMap::new();
    let mut current: Vec<NodeId> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| id.clone())
        .collect();
    let mut levels = Vec::new();

    while !current.is_empty() {
        current.sort_by_key(|id| rank(id));
        let depth = levels.len();
        let mut next = Vec::new();
        for id in &current {
            depths.insert(id.clone(), depth);
            for dependent in nodes.get(id).map(|n| n.dependents.clone()).unwrap_or_default() {
                if let Some(count) = remaining.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        next.push(dependent);
                    }
                }
            }
        }
        levels.push(std::mem::take(&mut current));
        current = next;
    }

    if depths.len() != nodes.len() {
        let mut unresolved: Vec<NodeId> = nodes
            .keys()
            .filter(|id| !depths.contains_key(*id))
            .cloned()
            .collect();
        unresolved.sort_by_key(|id| rank(id));
        return Err(EngineError::invalid_graph(format!(
            "Unresolvable dependencies for nodes: {}",
            unresolved.join(", ")
        )));
    }

    for node in nodes.values_mut() {
        node.depth = depths.get(&node.id).copied().unwrap_or(0);
    }
    Ok(levels)
}
