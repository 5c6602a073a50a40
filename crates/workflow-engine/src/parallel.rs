//! Parallel fan-out and join
//!
//! A `Parallel` node's dependents are its branches. Once the node
//! completes, `fan_out` admits every ready branch at once (bounded by the
//! queue's capacity) and records each branch's identity in a reserved
//! variable `parallel_<branchId>`. Branches share the variable bag; nothing
//! isolates their writes from each other.
//!
//! A `Join` node needs no special scheduling: it becomes ready through the
//! usual dependency bookkeeping once every branch has completed.
//! `assemble_join` then collects branch outputs in declaration order,
//! whatever order they finished in.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::{ContextSnapshot, PARALLEL_VARIABLE_PREFIX};
use crate::queue::{ExecutionQueueState, NodeStatus};
use crate::types::{BuiltWorkflow, NodeId, Timestamp};

/// Identity written for each branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchIdentity {
    pub index: usize,
    pub branch_id: NodeId,
    pub total: usize,
}

/// Name of the reserved variable for a branch
pub fn parallel_variable(branch_id: &str) -> String {
    format!("{}{}", PARALLEL_VARIABLE_PREFIX, branch_id)
}

/// Branches of `parallel_node_id` that are currently ready, in declaration
/// order
pub fn ready_branches(
    queue: &ExecutionQueueState,
    graph: &BuiltWorkflow,
    parallel_node_id: &str,
) -> Vec<NodeId> {
    graph
        .dependents(parallel_node_id)
        .iter()
        .filter(|id| queue.status_of(id) == NodeStatus::Ready)
        .cloned()
        .collect()
}

/// Result of a fan-out
#[derive(Debug, Clone)]
pub struct FanOut {
    pub queue: ExecutionQueueState,
    pub context: ContextSnapshot,
    /// Branches now executing
    pub dispatched: Vec<NodeId>,
    /// Branches left ready because the queue was at capacity
    pub deferred: Vec<NodeId>,
}

/// Admit `branches` together and write their identities.
///
/// `index` and `total` count every branch of the parallel node, so a
/// branch's identity does not depend on which siblings were admitted in
/// the same batch.
pub fn fan_out(
    queue: &ExecutionQueueState,
    context: &ContextSnapshot,
    graph: &BuiltWorkflow,
    parallel_node_id: &str,
    branches: &[NodeId],
    at: Timestamp,
) -> FanOut {
    let siblings = graph.dependents(parallel_node_id);
    let total = siblings.len();

    let identities = branches.iter().filter_map(|branch_id| {
        let index = siblings.iter().position(|s| s == branch_id)?;
        let identity = BranchIdentity {
            index,
            branch_id: branch_id.clone(),
            total,
        };
        let value = serde_json::to_value(&identity).ok()?;
        Some((parallel_variable(branch_id), value))
    });
    let context = context.with_variables(identities);

    let queue = queue.mark_executing(branches, at);
    let (dispatched, deferred): (Vec<NodeId>, Vec<NodeId>) = branches
        .iter()
        .cloned()
        .partition(|id| queue.status_of(id) == NodeStatus::Executing);

    log::debug!(
        "Parallel '{}': dispatched {} of {} branches",
        parallel_node_id,
        dispatched.len(),
        total
    );
    FanOut {
        queue,
        context,
        dispatched,
        deferred,
    }
}

/// Collect branch outputs for a join node.
///
/// Produces `{"results": [...], "byBranch": {id: output}}`, where `results`
/// follows the join's dependency order. Branches without an output (skipped
/// or failed) are left out.
pub fn assemble_join(context: &ContextSnapshot, graph: &BuiltWorkflow, join_node_id: &str) -> Value {
    let mut results = Vec::new();
    let mut by_branch = Map::new();
    for dep in graph.dependencies(join_node_id) {
        if let Some(output) = context.get_node_output(dep) {
            results.push(output.clone());
            by_branch.insert(dep.clone(), output.clone());
        }
    }
    serde_json::json!({
        "results": results,
        "byBranch": by_branch,
    })
}
