//! Core types for built workflow graphs
//!
//! A `BuiltWorkflow` is produced once per run (by `WorkflowBuilder` or an
//! external builder) and is read-only afterwards. The scheduler only ever
//! borrows it.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a node
pub type NodeId = String;

/// Unique identifier for an edge
pub type EdgeId = String;

/// Milliseconds since the Unix epoch.
///
/// Transitions take timestamps from the caller so that replaying the same
/// event sequence yields the same state.
pub type Timestamp = u64;

/// Default admission limit when the graph does not declare one
pub const DEFAULT_MAX_CONCURRENT_NODES: usize = 10;

/// Source handle used for edges that carry no routing label
pub const DEFAULT_HANDLE: &str = "output";

/// Current wall-clock time as a `Timestamp`
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

/// The kind of a node
///
/// Closed set: adding a kind means adding a variant, never matching on
/// free-form type strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry point of the run
    Trigger,
    /// Ordinary unit of work delegated to an activity
    Transform,
    /// Selects exactly one outgoing route
    Switch,
    /// Re-executes its body nodes under the loop controller
    Loop,
    /// Fans out to its sibling branches
    Parallel,
    /// Converges parallel branches
    Join,
    /// Marks a workflow result
    Output,
}

impl NodeKind {
    /// Get a human-readable label for this node kind.
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Trigger => "Trigger",
            NodeKind::Transform => "Transform",
            NodeKind::Switch => "Switch",
            NodeKind::Loop => "Loop",
            NodeKind::Parallel => "Parallel",
            NodeKind::Join => "Join",
            NodeKind::Output => "Output",
        }
    }

    /// Whether the engine completes this node itself without an activity call.
    pub fn is_engine_handled(&self) -> bool {
        matches!(self, NodeKind::Parallel | NodeKind::Join)
    }
}

/// A node in a built workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuiltNode {
    /// Unique identifier for this node
    pub id: NodeId,
    /// The kind of node
    pub kind: NodeKind,
    /// Node-specific configuration, passed untouched to activities
    #[serde(default)]
    pub config: serde_json::Value,
    /// Upstream nodes, in declaration order
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
    /// Downstream nodes, in declaration order
    #[serde(default)]
    pub dependents: Vec<NodeId>,
    /// Length of the longest dependency chain leading to this node
    #[serde(default)]
    pub depth: usize,
    /// Position in the original definition
    #[serde(default)]
    pub declaration_index: usize,
}

impl BuiltNode {
    /// Create a node with no configuration and no connections.
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            config: serde_json::Value::Null,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            depth: 0,
            declaration_index: 0,
        }
    }

    /// Attach configuration to the node.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// An edge between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuiltEdge {
    /// Unique identifier for this edge
    pub id: EdgeId,
    /// Source node ID
    pub source: NodeId,
    /// Source handle (switch case label, or `output`)
    pub source_handle: String,
    /// Target node ID
    pub target: NodeId,
    /// Target handle
    pub target_handle: String,
}

/// Loop metadata for a `Loop` node
///
/// Body nodes are not part of the scheduled graph; the loop controller runs
/// them in order once per iteration. A body node of kind `Loop` has its own
/// entry in `BuiltWorkflow::loop_contexts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopContext {
    /// The loop node that owns this body
    pub loop_node_id: NodeId,
    /// Body nodes in execution order
    pub body: Vec<BuiltNode>,
}

impl LoopContext {
    /// Whether any body node is itself a loop.
    pub fn has_nested_loop(&self) -> bool {
        self.body.iter().any(|n| n.kind == NodeKind::Loop)
    }
}

/// A validated, read-only workflow graph
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuiltWorkflow {
    /// Unique identifier for this workflow
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Nodes keyed by id
    pub nodes: BTreeMap<NodeId, BuiltNode>,
    /// Edges in declaration order
    pub edges: Vec<BuiltEdge>,
    /// Topological layers of mutually schedulable nodes
    pub execution_levels: Vec<Vec<NodeId>>,
    /// Loop bodies keyed by loop node id
    #[serde(default)]
    pub loop_contexts: BTreeMap<NodeId, LoopContext>,
    /// Admission limit for concurrently executing nodes
    pub max_concurrent_nodes: usize,
    /// The node that starts the run
    pub trigger_node_id: Option<NodeId>,
    /// Nodes whose outputs form the workflow result
    pub output_node_ids: Vec<NodeId>,
}

impl BuiltWorkflow {
    /// Find a node by ID
    pub fn node(&self, id: &str) -> Option<&BuiltNode> {
        self.nodes.get(id)
    }

    /// Number of scheduled nodes (loop bodies excluded)
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Upstream nodes of `id` (empty for unknown ids)
    pub fn dependencies(&self, id: &str) -> &[NodeId] {
        self.nodes
            .get(id)
            .map(|n| n.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Downstream nodes of `id` (empty for unknown ids)
    pub fn dependents(&self, id: &str) -> &[NodeId] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Declaration position of a node; unknown ids sort last
    pub fn declaration_index(&self, id: &str) -> usize {
        self.nodes
            .get(id)
            .map(|n| n.declaration_index)
            .unwrap_or(usize::MAX)
    }

    /// Nodes in declaration order
    pub fn nodes_in_order(&self) -> Vec<&BuiltNode> {
        let mut nodes: Vec<&BuiltNode> = self.nodes.values().collect();
        nodes.sort_by_key(|n| n.declaration_index);
        nodes
    }

    /// Get edges going out of a node
    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a BuiltEdge> + 'a {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// Get edges coming into a node
    pub fn incoming_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a BuiltEdge> + 'a {
        self.edges.iter().filter(move |e| e.target == node_id)
    }

    /// Loop body for a loop node
    pub fn loop_context(&self, loop_node_id: &str) -> Option<&LoopContext> {
        self.loop_contexts.get(loop_node_id)
    }

    /// Sort ids by declaration order, in place
    pub fn sort_by_declaration(&self, ids: &mut [NodeId]) {
        ids.sort_by_key(|id| self.declaration_index(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_kind_labels() {
        assert_eq!(NodeKind::Switch.label(), "Switch");
        assert!(NodeKind::Join.is_engine_handled());
        assert!(!NodeKind::Transform.is_engine_handled());
    }

    #[test]
    fn test_kind_serialization() {
        let node = BuiltNode::new("n1", NodeKind::Parallel);
        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains("\"kind\":\"parallel\""));
        assert!(json.contains("\"declarationIndex\":0"));
    }

    #[test]
    fn test_unknown_node_lookups() {
        let graph = BuiltWorkflow::default();
        assert!(graph.dependencies("missing").is_empty());
        assert!(graph.dependents("missing").is_empty());
        assert_eq!(graph.declaration_index("missing"), usize::MAX);
    }
}
