//! Switch routing
//!
//! A switch node's outgoing edges are labelled with route names through
//! their source handle. The route itself is decided by the switch's
//! activity; the router only applies it: every entry node of a route that
//! was not selected is marked skipped, which cascades through that route's
//! subtree. Nested switches need nothing extra since each one only touches
//! its own outgoing edges.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::queue::ExecutionQueueState;
use crate::types::{BuiltNode, BuiltWorkflow, NodeId, Timestamp};

/// Route taken when the selected label matches no case
pub const DEFAULT_ROUTE: &str = "default";

/// Configuration for a Switch node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchConfig {
    /// Declared case labels, checked against the edge handles by
    /// `validate_workflow`. Routing itself always reads the edge handles.
    #[serde(default)]
    pub cases: Vec<String>,
}

impl SwitchConfig {
    /// Parse the config of a Switch node
    pub fn from_node(node: &BuiltNode) -> Result<Self> {
        if node.config.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(node.config.clone()).map_err(|e| {
            EngineError::invalid_config(format!("Invalid switch config on '{}': {}", node.id, e))
        })
    }
}

/// Route labels available on a switch, in edge declaration order
pub fn available_routes(graph: &BuiltWorkflow, switch_node_id: &str) -> Vec<String> {
    let mut routes: Vec<String> = Vec::new();
    for edge in graph.outgoing_edges(switch_node_id) {
        if !routes.contains(&edge.source_handle) {
            routes.push(edge.source_handle.clone());
        }
    }
    routes
}

/// Pick the route to take.
///
/// A non-empty label that names an available route wins. Anything else
/// falls back to `default` when declared; otherwise no route is taken.
pub fn resolve_route(selected: Option<&str>, routes: &[String]) -> Option<String> {
    match selected {
        Some(label) if !label.is_empty() && routes.iter().any(|r| r == label) => {
            Some(label.to_string())
        }
        _ if routes.iter().any(|r| r == DEFAULT_ROUTE) => Some(DEFAULT_ROUTE.to_string()),
        _ => None,
    }
}

/// Read the decided route from a switch activity's output.
///
/// Accepts `{"selectedRoute": "<label>"}` or a bare string.
pub fn selected_route_from_output(output: &Value) -> Option<String> {
    match output {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("selectedRoute")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => None,
    }
}

/// Result of applying a route
#[derive(Debug, Clone)]
pub struct SwitchOutcome {
    pub queue: ExecutionQueueState,
    /// The route taken, if any
    pub route: Option<String>,
    /// Entry nodes of the routes that were not taken
    pub skipped_entries: Vec<NodeId>,
}

/// Apply the decided route of a completed switch node.
///
/// Entry nodes of non-selected routes are skipped with cascade. A node
/// reachable from both the selected route and another route is kept.
pub fn route_switch(
    queue: &ExecutionQueueState,
    graph: &BuiltWorkflow,
    switch_node_id: &str,
    selected: Option<&str>,
    at: Timestamp,
) -> SwitchOutcome {
    let routes = available_routes(graph, switch_node_id);
    let route = resolve_route(selected, &routes);

    let selected_targets: Vec<&NodeId> = graph
        .outgoing_edges(switch_node_id)
        .filter(|e| Some(&e.source_handle) == route.as_ref())
        .map(|e| &e.target)
        .collect();

    let mut skipped_entries: Vec<NodeId> = Vec::new();
    for edge in graph.outgoing_edges(switch_node_id) {
        if selected_targets.contains(&&edge.target) || skipped_entries.contains(&edge.target) {
            continue;
        }
        skipped_entries.push(edge.target.clone());
    }

    let mut next = queue.clone();
    for entry in &skipped_entries {
        next = next.mark_skipped(entry, graph, at);
    }

    match &route {
        Some(r) => log::info!("Switch '{}' selected route '{}'", switch_node_id, r),
        None => log::info!(
            "Switch '{}': route {:?} unmatched and no default, skipping all routes",
            switch_node_id,
            selected
        ),
    }

    SwitchOutcome {
        queue: next,
        route,
        skipped_entries,
    }
}
