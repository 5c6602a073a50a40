//! Structural validation for built workflow graphs
//!
//! The scheduler trusts the graph it is given. Hosts that receive graphs
//! from elsewhere can run `validate_workflow` first. Cycles are not
//! checked here; the builder refuses graphs whose dependencies never
//! resolve.

use std::collections::HashSet;

use crate::loops::LoopConfig;
use crate::switch::{available_routes, SwitchConfig, DEFAULT_ROUTE};
use crate::types::{BuiltWorkflow, NodeKind};

/// Validation error with location context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// An edge references a non-existent node
    UnknownNode { edge_id: String, node_id: String },
    /// A node lists a dependency or dependent that does not exist
    UnknownDependency { node_id: String, other: String },
    /// `a` lists `b` as a dependency but `b` does not list `a` as a
    /// dependent, or the other way round
    AsymmetricDependency { node_id: String, other: String },
    /// No node can start the run
    MissingTrigger,
    /// Node config could not be parsed for its kind
    InvalidNodeConfig { node_id: String, message: String },
    /// A switch has no outgoing edges
    SwitchWithoutRoutes { node_id: String },
    /// A declared switch case has no edge leaving its handle
    MissingRequiredHandle { node_id: String, handle: String },
    /// A loop node has no body
    MissingLoopBody { node_id: String },
    /// A loop body is attached to something that is not a loop
    OrphanedLoopBody { node_id: String },
    /// The admission limit is zero
    InvalidConcurrencyLimit,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownNode { edge_id, node_id } => {
                write!(f, "Edge '{}' references unknown node '{}'", edge_id, node_id)
            }
            Self::UnknownDependency { node_id, other } => {
                write!(f, "Node '{}' is linked to unknown node '{}'", node_id, other)
            }
            Self::AsymmetricDependency { node_id, other } => {
                write!(
                    f,
                    "Dependency between '{}' and '{}' is recorded on one side only",
                    node_id, other
                )
            }
            Self::MissingTrigger => write!(f, "Workflow has no node without dependencies"),
            Self::InvalidNodeConfig { node_id, message } => {
                write!(f, "Invalid config on node '{}': {}", node_id, message)
            }
            Self::SwitchWithoutRoutes { node_id } => {
                write!(f, "Switch '{}' has no outgoing routes", node_id)
            }
            Self::MissingRequiredHandle { node_id, handle } => {
                write!(
                    f,
                    "Node '{}' is missing required handle '{}'",
                    node_id, handle
                )
            }
            Self::MissingLoopBody { node_id } => write!(f, "Loop '{}' has no body", node_id),
            Self::OrphanedLoopBody { node_id } => {
                write!(f, "Loop body attached to '{}', which is not a loop", node_id)
            }
            Self::InvalidConcurrencyLimit => write!(f, "maxConcurrentNodes must be at least 1"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a built workflow
///
/// Returns all validation errors found (not just the first).
pub fn validate_workflow(graph: &BuiltWorkflow) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if graph.max_concurrent_nodes == 0 {
        errors.push(ValidationError::InvalidConcurrencyLimit);
    }
    validate_edge_references(graph, &mut errors);
    validate_dependency_symmetry(graph, &mut errors);
    validate_trigger(graph, &mut errors);
    validate_switches(graph, &mut errors);
    validate_loops(graph, &mut errors);

    errors
}

fn validate_edge_references(graph: &BuiltWorkflow, errors: &mut Vec<ValidationError>) {
    for edge in &graph.edges {
        for end in [&edge.source, &edge.target] {
            if graph.node(end).is_none() {
                errors.push(ValidationError::UnknownNode {
                    edge_id: edge.id.clone(),
                    node_id: end.clone(),
                });
            }
        }
    }
}

fn validate_dependency_symmetry(graph: &BuiltWorkflow, errors: &mut Vec<ValidationError>) {
    for node in graph.nodes_in_order() {
        for dep in &node.dependencies {
            match graph.node(dep) {
                None => errors.push(ValidationError::UnknownDependency {
                    node_id: node.id.clone(),
                    other: dep.clone(),
                }),
                Some(upstream) if !upstream.dependents.contains(&node.id) => {
                    errors.push(ValidationError::AsymmetricDependency {
                        node_id: node.id.clone(),
                        other: dep.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        for dependent in &node.dependents {
            match graph.node(dependent) {
                None => errors.push(ValidationError::UnknownDependency {
                    node_id: node.id.clone(),
                    other: dependent.clone(),
                }),
                Some(downstream) if !downstream.dependencies.contains(&node.id) => {
                    errors.push(ValidationError::AsymmetricDependency {
                        node_id: dependent.clone(),
                        other: node.id.clone(),
                    })
                }
                Some(_) => {}
            }
        }
    }
}

fn validate_trigger(graph: &BuiltWorkflow, errors: &mut Vec<ValidationError>) {
    if graph.node_count() == 0 {
        return;
    }
    let has_root = graph.nodes.values().any(|n| n.dependencies.is_empty());
    let trigger_known = graph
        .trigger_node_id
        .as_deref()
        .map(|id| graph.node(id).is_some())
        .unwrap_or(false);
    if !has_root || !trigger_known {
        errors.push(ValidationError::MissingTrigger);
    }
}

fn validate_switches(graph: &BuiltWorkflow, errors: &mut Vec<ValidationError>) {
    for node in graph.nodes_in_order() {
        if node.kind != NodeKind::Switch {
            continue;
        }
        let config = match SwitchConfig::from_node(node) {
            Ok(config) => config,
            Err(e) => {
                errors.push(ValidationError::InvalidNodeConfig {
                    node_id: node.id.clone(),
                    message: e.to_string(),
                });
                continue;
            }
        };
        let routes = available_routes(graph, &node.id);
        if routes.is_empty() {
            errors.push(ValidationError::SwitchWithoutRoutes {
                node_id: node.id.clone(),
            });
            continue;
        }
        for case in config.cases.iter().filter(|c| *c != DEFAULT_ROUTE) {
            if !routes.contains(case) {
                errors.push(ValidationError::MissingRequiredHandle {
                    node_id: node.id.clone(),
                    handle: case.clone(),
                });
            }
        }
    }
}

fn validate_loops(graph: &BuiltWorkflow, errors: &mut Vec<ValidationError>) {
    let nested: HashSet<&str> = graph
        .loop_contexts
        .values()
        .flat_map(|ctx| ctx.body.iter())
        .filter(|n| n.kind == NodeKind::Loop)
        .map(|n| n.id.as_str())
        .collect();

    let top_level = graph.nodes_in_order().into_iter();
    let bodies = graph.loop_contexts.values().flat_map(|ctx| ctx.body.iter());
    for node in top_level.chain(bodies) {
        if node.kind != NodeKind::Loop {
            continue;
        }
        if let Err(e) = LoopConfig::from_node(node) {
            errors.push(ValidationError::InvalidNodeConfig {
                node_id: node.id.clone(),
                message: e.to_string(),
            });
        }
        let has_body = graph
            .loop_context(&node.id)
            .map(|ctx| !ctx.body.is_empty())
            .unwrap_or(false);
        if !has_body {
            errors.push(ValidationError::MissingLoopBody {
                node_id: node.id.clone(),
            });
        }
    }

    for loop_id in graph.loop_contexts.keys() {
        let is_loop = graph
            .node(loop_id)
            .map(|n| n.kind == NodeKind::Loop)
            .unwrap_or(false);
        if !is_loop && !nested.contains(loop_id.as_str()) {
            errors.push(ValidationError::OrphanedLoopBody {
                node_id: loop_id.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::WorkflowBuilder;
    use crate::types::{BuiltEdge, LoopContext};
    use serde_json::json;

    fn valid_graph() -> BuiltWorkflow {
        WorkflowBuilder::new("wf", "Valid")
            .add_node("t", NodeKind::Trigger)
            .add_node("s", NodeKind::Switch)
            .with_config(json!({"cases": ["hot", "cold"]}))
            .add_node("hot", NodeKind::Transform)
            .add_node("cold", NodeKind::Transform)
            .add_node("l", NodeKind::Loop)
            .with_config(json!({"kind": "counter", "count": 2}))
            .add_loop_body("l", "step", NodeKind::Transform)
            .add_edge("t", "s")
            .add_edge_with_handle("s", "hot", "hot")
            .add_edge_with_handle("s", "cold", "cold")
            .add_edge("hot", "l")
            .build()
            .unwrap()
    }

    #[test]
    fn test_valid_graph() {
        let errors = validate_workflow(&valid_graph());
        assert!(errors.is_empty(), "{:?}", errors);
    }

    #[test]
    fn test_edge_references_missing_node() {
        let mut graph = valid_graph();
        graph.edges.push(BuiltEdge {
            id: "bad".to_string(),
            source: "t".to_string(),
            source_handle: "output".to_string(),
            target: "ghost".to_string(),
            target_handle: "input".to_string(),
        });
        let errors = validate_workflow(&graph);
        assert!(errors.contains(&ValidationError::UnknownNode {
            edge_id: "bad".to_string(),
            node_id: "ghost".to_string(),
        }));
    }

    #[test]
    fn test_asymmetric_dependency() {
        let mut graph = valid_graph();
        if let Some(node) = graph.nodes.get_mut("t") {
            node.dependents.retain(|d| d != "s");
        }
        let errors = validate_workflow(&graph);
        assert!(errors.iter().any(|e| matches!(
            e,
            ValidationError::AsymmetricDependency { node_id, other } if node_id == "s" && other == "t"
        )));
    }

    #[test]
    fn test_missing_trigger() {
        let mut graph = valid_graph();
        graph.trigger_node_id = None;
        assert!(validate_workflow(&graph).contains(&ValidationError::MissingTrigger));
    }

    #[test]
    fn test_switch_case_without_edge() {
        let graph = WorkflowBuilder::new("wf", "Switch")
            .add_node("s", NodeKind::Switch)
            .with_config(json!({"cases": ["a", "b", "default"]}))
            .add_node("a", NodeKind::Transform)
            .add_edge_with_handle("s", "a", "a")
            .build()
            .unwrap();
        let errors = validate_workflow(&graph);
        assert_eq!(
            errors,
            vec![ValidationError::MissingRequiredHandle {
                node_id: "s".to_string(),
                handle: "b".to_string(),
            }]
        );
    }

    #[test]
    fn test_switch_without_routes() {
        let graph = WorkflowBuilder::new("wf", "Switch")
            .add_node("s", NodeKind::Switch)
            .build()
            .unwrap();
        assert_eq!(
            validate_workflow(&graph),
            vec![ValidationError::SwitchWithoutRoutes {
                node_id: "s".to_string()
            }]
        );
    }

    #[test]
    fn test_loop_problems() {
        let mut graph = WorkflowBuilder::new("wf", "Loops")
            .add_node("t", NodeKind::Trigger)
            .add_node("l", NodeKind::Loop)
            .with_config(json!({"kind": "sometimes"}))
            .add_edge("t", "l")
            .build()
            .unwrap();
        graph.loop_contexts.insert(
            "t".to_string(),
            LoopContext {
                loop_node_id: "t".to_string(),
                body: Vec::new(),
            },
        );

        let errors = validate_workflow(&graph);
        assert_eq!(errors.len(), 3, "{:?}", errors);
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InvalidNodeConfig { node_id, .. } if node_id == "l")));
        assert!(errors.contains(&ValidationError::MissingLoopBody {
            node_id: "l".to_string()
        }));
        assert!(errors.contains(&ValidationError::OrphanedLoopBody {
            node_id: "t".to_string()
        }));
    }

    #[test]
    fn test_collects_multiple_errors() {
        let mut graph = valid_graph();
        graph.max_concurrent_nodes = 0;
        graph.trigger_node_id = Some("ghost".to_string());
        let errors = validate_workflow(&graph);
        assert!(errors.len() >= 2);
        assert!(errors.iter().any(|e| e.to_string().contains("at least 1")));
    }
}
