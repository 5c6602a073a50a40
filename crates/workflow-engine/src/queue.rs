//! Execution queue: node status bookkeeping and readiness over the DAG
//!
//! `ExecutionQueueState` is replaced, never mutated: every transition takes
//! `&self` and returns the next state. Transitions never fail; an event that
//! does not apply to the node's current status leaves the state unchanged.
//!
//! # Status sets
//!
//! Every node is in at most one of `ready`, `executing`, `completed`,
//! `failed`, `skipped`. A node in none of them is pending. `completed`,
//! `failed` and `skipped` are terminal, except that `mark_retry` moves a
//! failed node back to `ready`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{BuiltWorkflow, NodeId, Timestamp};

/// Status of a single node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Executing,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    /// Whether no further transition is expected (retry aside)
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped)
    }
}

/// Per-node descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub status: NodeStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
}

impl NodeState {
    fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            retry_count: 0,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub executing: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ExecutionSummary {
    /// Nodes that reached a terminal status
    pub fn terminal(&self) -> usize {
        self.completed + self.failed + self.skipped
    }

    /// Nothing is ready or running, yet some nodes never reached a terminal
    /// status. Only a malformed graph gets here.
    pub fn is_stalled(&self) -> bool {
        self.ready == 0 && self.executing == 0 && self.terminal() < self.total
    }

    /// Fraction of nodes in a terminal status, in percent
    pub fn percentage(&self) -> f32 {
        if self.total == 0 {
            return 100.0;
        }
        (self.terminal() as f32 / self.total as f32) * 100.0
    }
}

/// Status sets and node descriptors for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionQueueState {
    /// Ready nodes in FIFO order
    ready: Vec<NodeId>,
    executing: BTreeSet<NodeId>,
    completed: BTreeSet<NodeId>,
    failed: BTreeSet<NodeId>,
    skipped: BTreeSet<NodeId>,
    node_states: BTreeMap<NodeId, NodeState>,
    max_concurrent_nodes: usize,
}

/// Seed a queue for `graph`. Equivalent to `ExecutionQueueState::initialize`.
pub fn initialize_queue(graph: &BuiltWorkflow) -> ExecutionQueueState {
    ExecutionQueueState::initialize(graph)
}

impl ExecutionQueueState {
    /// Seed `ready` with every node that has no dependencies, in declaration
    /// order. All other nodes start pending.
    pub fn initialize(graph: &BuiltWorkflow) -> Self {
        Self::with_capacity(graph, graph.max_concurrent_nodes)
    }

    /// Like `initialize`, with an explicit admission limit
    pub fn with_capacity(graph: &BuiltWorkflow, max_concurrent_nodes: usize) -> Self {
        let mut state = Self {
            ready: Vec::new(),
            executing: BTreeSet::new(),
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            skipped: BTreeSet::new(),
            node_states: BTreeMap::new(),
            max_concurrent_nodes: max_concurrent_nodes.max(1),
        };
        for node in graph.nodes_in_order() {
            state.node_states.insert(node.id.clone(), NodeState::pending());
            if node.dependencies.is_empty() {
                state.push_ready(&node.id);
            }
        }
        state
    }

    /// Admission limit this queue enforces
    pub fn max_concurrent_nodes(&self) -> usize {
        self.max_concurrent_nodes
    }

    /// Free execution slots
    pub fn available_capacity(&self) -> usize {
        self.max_concurrent_nodes.saturating_sub(self.executing.len())
    }

    /// Up to `max_concurrent - executing` ready nodes, oldest first
    pub fn get_ready_nodes(&self, max_concurrent: usize) -> Vec<NodeId> {
        let limit = max_concurrent
            .min(self.max_concurrent_nodes)
            .saturating_sub(self.executing.len());
        self.ready.iter().take(limit).cloned().collect()
    }

    /// Move ready nodes to executing.
    ///
    /// Ids that are not ready are ignored, and admission stops once the
    /// queue's capacity is reached.
    pub fn mark_executing<S: AsRef<str>>(&self, node_ids: &[S], at: Timestamp) -> Self {
        let mut next = self.clone();
        for id in node_ids {
            let id = id.as_ref();
            if !next.ready.iter().any(|r| r == id) {
                log::debug!("mark_executing: '{}' is not ready, ignoring", id);
                continue;
            }
            if next.executing.len() >= next.max_concurrent_nodes {
                log::warn!(
                    "mark_executing: capacity {} reached, '{}' stays ready",
                    next.max_concurrent_nodes,
                    id
                );
                break;
            }
            next.ready.retain(|r| r != id);
            next.executing.insert(id.to_string());
            let state = next.state_mut(id);
            state.status = NodeStatus::Executing;
            state.started_at = Some(at);
        }
        next
    }

    /// Record a successful execution and promote dependents whose
    /// dependencies have all completed.
    ///
    /// The output itself belongs in the context snapshot; the queue only
    /// tracks status.
    pub fn mark_completed(&self, node_id: &str, graph: &BuiltWorkflow, at: Timestamp) -> Self {
        if !self.executing.contains(node_id) {
            log::debug!("mark_completed: '{}' is not executing, ignoring", node_id);
            return self.clone();
        }
        let mut next = self.clone();
        next.executing.remove(node_id);
        next.completed.insert(node_id.to_string());
        let state = next.state_mut(node_id);
        state.status = NodeStatus::Completed;
        state.completed_at = Some(at);

        for dependent in graph.dependents(node_id) {
            if next.status_of(dependent) != NodeStatus::Pending {
                continue;
            }
            let satisfied = graph
                .dependencies(dependent)
                .iter()
                .all(|dep| next.completed.contains(dep));
            if satisfied {
                next.push_ready(dependent);
            }
        }
        next
    }

    /// Record a failure and cascade `skipped` to every transitive dependent
    /// that has not already reached a terminal status.
    ///
    /// Accepts executing or ready nodes, so a host can cancel queued work.
    pub fn mark_failed(
        &self,
        node_id: &str,
        error: impl Into<String>,
        graph: &BuiltWorkflow,
        at: Timestamp,
    ) -> Self {
        let status = self.status_of(node_id);
        if !matches!(status, NodeStatus::Executing | NodeStatus::Ready) {
            log::debug!("mark_failed: '{}' is {:?}, ignoring", node_id, status);
            return self.clone();
        }
        let error = error.into();
        log::warn!("Node '{}' failed: {}", node_id, error);

        let mut next = self.clone();
        next.remove_from_active(node_id);
        next.failed.insert(node_id.to_string());
        let state = next.state_mut(node_id);
        state.status = NodeStatus::Failed;
        state.error = Some(error);
        state.completed_at = Some(at);

        next.cascade_skip(node_id, graph, at);
        next
    }

    /// Mark a node skipped (no error) and cascade to its dependents.
    ///
    /// Used for switch routes that were not selected and for cancellation.
    pub fn mark_skipped(&self, node_id: &str, graph: &BuiltWorkflow, at: Timestamp) -> Self {
        let status = self.status_of(node_id);
        if status.is_terminal() {
            return self.clone();
        }
        if !self.node_states.contains_key(node_id) {
            log::debug!("mark_skipped: unknown node '{}'", node_id);
            return self.clone();
        }
        let mut next = self.clone();
        next.skip_one(node_id, at);
        next.cascade_skip(node_id, graph, at);
        next
    }

    /// Move a failed node back to ready, incrementing its retry count.
    ///
    /// Dependents already cascaded into `skipped` by the failure stay
    /// skipped.
    pub fn mark_retry(&self, node_id: &str) -> Self {
        if !self.failed.contains(node_id) {
            log::debug!("mark_retry: '{}' has not failed, ignoring", node_id);
            return self.clone();
        }
        let mut next = self.clone();
        next.failed.remove(node_id);
        next.ready.push(node_id.to_string());
        let state = next.state_mut(node_id);
        state.status = NodeStatus::Ready;
        state.retry_count += 1;
        state.error = None;
        state.completed_at = None;
        log::info!("Retrying node '{}' (attempt {})", node_id, state.retry_count + 1);
        next
    }

    /// Skip every ready and pending node. In-flight nodes are left for the
    /// host to resolve with `mark_failed` or `mark_completed`.
    pub fn cancel_remaining(&self, at: Timestamp) -> Self {
        let mut next = self.clone();
        let targets: Vec<NodeId> = next
            .node_states
            .iter()
            .filter(|(_, s)| matches!(s.status, NodeStatus::Ready | NodeStatus::Pending))
            .map(|(id, _)| id.clone())
            .collect();
        for id in targets {
            next.skip_one(&id, at);
        }
        next
    }

    /// `ready` and `executing` are both empty
    pub fn is_execution_complete(&self) -> bool {
        self.ready.is_empty() && self.executing.is_empty()
    }

    /// Something is ready or running
    pub fn can_continue(&self) -> bool {
        !self.executing.is_empty() || !self.ready.is_empty()
    }

    /// Counts per status
    pub fn get_execution_summary(&self) -> ExecutionSummary {
        let pending = self
            .node_states
            .values()
            .filter(|s| s.status == NodeStatus::Pending)
            .count();
        ExecutionSummary {
            total: self.node_states.len(),
            pending,
            ready: self.ready.len(),
            executing: self.executing.len(),
            completed: self.completed.len(),
            failed: self.failed.len(),
            skipped: self.skipped.len(),
        }
    }

    /// Descriptor for a single node
    pub fn get_node_state(&self, node_id: &str) -> Option<&NodeState> {
        self.node_states.get(node_id)
    }

    /// Status of a node; unknown ids report `Pending`
    pub fn status_of(&self, node_id: &str) -> NodeStatus {
        self.node_states
            .get(node_id)
            .map(|s| s.status)
            .unwrap_or(NodeStatus::Pending)
    }

    /// Retry count of a node (0 for unknown ids)
    pub fn retry_count(&self, node_id: &str) -> u32 {
        self.node_states
            .get(node_id)
            .map(|s| s.retry_count)
            .unwrap_or(0)
    }

    /// Ready nodes in dispatch order
    pub fn ready_nodes(&self) -> &[NodeId] {
        &self.ready
    }

    pub fn executing_nodes(&self) -> &BTreeSet<NodeId> {
        &self.executing
    }

    pub fn completed_nodes(&self) -> &BTreeSet<NodeId> {
        &self.completed
    }

    pub fn failed_nodes(&self) -> &BTreeSet<NodeId> {
        &self.failed
    }

    pub fn skipped_nodes(&self) -> &BTreeSet<NodeId> {
        &self.skipped
    }

    /// Nodes in no status set, in declaration order
    pub fn pending_nodes(&self, graph: &BuiltWorkflow) -> Vec<NodeId> {
        graph
            .nodes_in_order()
            .into_iter()
            .filter(|n| self.status_of(&n.id) == NodeStatus::Pending)
            .map(|n| n.id.clone())
            .collect()
    }

    /// Errors recorded for failed nodes
    pub fn errors(&self) -> BTreeMap<NodeId, String> {
        self.node_states
            .iter()
            .filter_map(|(id, s)| s.error.as_ref().map(|e| (id.clone(), e.clone())))
            .collect()
    }

    fn state_mut(&mut self, node_id: &str) -> &mut NodeState {
        self.node_states
            .entry(node_id.to_string())
            .or_insert_with(NodeState::pending)
    }

    fn push_ready(&mut self, node_id: &str) {
        if !self.ready.iter().any(|r| r == node_id) {
            self.ready.push(node_id.to_string());
        }
        self.state_mut(node_id).status = NodeStatus::Ready;
    }

    fn remove_from_active(&mut self, node_id: &str) {
        self.ready.retain(|r| r != node_id);
        self.executing.remove(node_id);
    }

    fn skip_one(&mut self, node_id: &str, at: Timestamp) {
        self.remove_from_active(node_id);
        self.skipped.insert(node_id.to_string());
        let state = self.state_mut(node_id);
        state.status = NodeStatus::Skipped;
        state.completed_at = Some(at);
    }

    /// Depth-first walk over dependents. Terminal and in-flight nodes stop
    /// the walk along their path.
    fn cascade_skip(&mut self, origin: &str, graph: &BuiltWorkflow, at: Timestamp) {
        let mut stack: Vec<NodeId> = graph.dependents(origin).iter().rev().cloned().collect();
        let mut cascaded = Vec::new();
        while let Some(id) = stack.pop() {
            let status = self.status_of(&id);
            if status.is_terminal() || status == NodeStatus::Executing {
                continue;
            }
            self.skip_one(&id, at);
            cascaded.push(id.clone());
            stack.extend(graph.dependents(&id).iter().rev().cloned());
        }
        if !cascaded.is_empty() {
            log::debug!("Skipped dependents of '{}': {}", origin, cascaded.join(", "));
        }
    }
}
