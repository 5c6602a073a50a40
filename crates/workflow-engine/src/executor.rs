//! Workflow executor
//!
//! A host loop over the queue and context primitives. All state
//! transitions happen on the executor's own task, one completion at a
//! time; only activity calls run concurrently.
//!
//! Per pass the executor:
//! 1. takes ready nodes up to the free capacity
//! 2. asks the admission gate for each one (refused nodes stay ready)
//! 3. marks the admitted nodes executing, fanning out parallel branches
//! 4. waits for the next completion and folds it back into queue and context
//!
//! The run ends when nothing is in flight and nothing more can be
//! admitted. The final status is derived from the queue summary.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::future::{self, BoxFuture};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

use crate::config::EngineConfig;
use crate::context::{is_reserved_variable, ContextSnapshot};
use crate::error::{EngineError, Result};
use crate::events::{EventSink, WorkflowEvent};
use crate::loops::{LoopConfig, LoopRun, LoopScope, LoopStep};
use crate::parallel::{assemble_join, fan_out};
use crate::queue::{ExecutionQueueState, ExecutionSummary, NodeStatus};
use crate::switch::{route_switch, selected_route_from_output};
use crate::types::{now_millis, BuiltNode, BuiltWorkflow, LoopContext, NodeId, NodeKind};

/// Result of one activity call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityResult {
    /// Output stored for the node
    #[serde(default)]
    pub output: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Variables to set on the context. Reserved names are ignored.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,
}

impl ActivityResult {
    /// A successful call
    pub fn success(output: Value) -> Self {
        Self {
            output,
            success: true,
            error: None,
            variables: BTreeMap::new(),
        }
    }

    /// A failed call
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            output: Value::Null,
            success: false,
            error: Some(error.into()),
            variables: BTreeMap::new(),
        }
    }

    /// Set a context variable alongside the output
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }
}

/// Performs the work of a node.
///
/// Implementations own timeouts and any I/O. A returned failure is
/// retried according to the engine's retry policy while the node stays
/// executing; attempts are reported in `ExecutionResult::retries`. The
/// queue's `mark_retry` and `retry_count` are for hosts that drive the
/// queue themselves and stay untouched by this executor.
#[async_trait]
pub trait ActivityExecutor: Send + Sync {
    async fn execute(&self, node: &BuiltNode, context: &ContextSnapshot) -> ActivityResult;
}

/// Gates dispatch on an external budget (credits, quotas).
///
/// The executor calls `estimate` then `reserve` before a node starts,
/// `finalize` after it completes and `release` when it fails or is
/// cancelled.
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    /// Expected cost of running a node
    async fn estimate(&self, node: &BuiltNode) -> u64;

    /// Try to reserve `amount` for a node. `false` keeps the node ready.
    async fn reserve(&self, node: &BuiltNode, amount: u64) -> bool;

    /// Return an unused reservation
    async fn release(&self, node_id: &str, amount: u64);

    /// Settle a reservation for a completed node
    async fn finalize(&self, node_id: &str, amount: u64);
}

/// Admission gate that admits everything
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlimitedAdmission;

#[async_trait]
impl AdmissionGate for UnlimitedAdmission {
    async fn estimate(&self, _node: &BuiltNode) -> u64 {
        0
    }

    async fn reserve(&self, _node: &BuiltNode, _amount: u64) -> bool {
        true
    }

    async fn release(&self, _node_id: &str, _amount: u64) {}

    async fn finalize(&self, _node_id: &str, _amount: u64) {}
}

/// Shared cancellation flag for a run
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. In-flight activities are dropped and every
    /// node that has not finished is skipped.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Final status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No node failed and every node reached a terminal status
    Completed,
    /// Some nodes failed, others completed
    PartiallyFailed,
    /// Nothing completed
    Failed,
    /// Work was left that nothing could make progress on
    Stalled,
    Cancelled,
}

/// Outcome of `WorkflowExecutor::execute`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub summary: ExecutionSummary,
    /// Final context snapshot
    pub context: ContextSnapshot,
    /// Outputs of the workflow's output nodes
    pub outputs: BTreeMap<NodeId, Value>,
    /// Error per failed node
    pub errors: BTreeMap<NodeId, String>,
    /// Retries spent per node, for nodes that needed any
    #[serde(default)]
    pub retries: BTreeMap<NodeId, u32>,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

struct NodeSuccess {
    output: Value,
    /// Context the node was dispatched with
    base: ContextSnapshot,
    /// `base` plus the node's own writes
    updated: ContextSnapshot,
}

struct NodeRun {
    node_id: NodeId,
    outcome: std::result::Result<NodeSuccess, String>,
    retries: u32,
}

impl NodeRun {
    fn completed(node_id: &str, base: ContextSnapshot, updated: ContextSnapshot, output: Value) -> Self {
        Self {
            node_id: node_id.to_string(),
            outcome: Ok(NodeSuccess {
                output,
                base,
                updated,
            }),
            retries: 0,
        }
    }

    fn failed(node_id: &str, error: String) -> Self {
        Self {
            node_id: node_id.to_string(),
            outcome: Err(error),
            retries: 0,
        }
    }

    fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Final result of an activity call and the retries it took
struct Attempted {
    result: std::result::Result<ActivityResult, String>,
    retries: u32,
}

/// Executor for built workflows.
pub struct WorkflowExecutor<A: ActivityExecutor> {
    activities: A,
    admission: Arc<dyn AdmissionGate>,
    config: EngineConfig,
    execution_id: String,
    cancel: CancelHandle,
}

impl<A: ActivityExecutor> WorkflowExecutor<A> {
    /// Create a new executor around an activity implementation.
    pub fn new(activities: A) -> Self {
        Self {
            activities,
            admission: Arc::new(UnlimitedAdmission),
            config: EngineConfig::default(),
            execution_id: format!("wf-exec-{}", uuid::Uuid::new_v4()),
            cancel: CancelHandle::new(),
        }
    }

    /// Set the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the admission gate.
    pub fn with_admission(mut self, admission: Arc<dyn AdmissionGate>) -> Self {
        self.admission = admission;
        self
    }

    /// Set the execution ID.
    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handle that cancels this executor's run
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run a workflow to completion.
    ///
    /// Node failures are part of the result, not errors. An error is
    /// returned only when the graph references a node it does not contain.
    pub async fn execute(
        &self,
        graph: &BuiltWorkflow,
        initial_context: ContextSnapshot,
        event_sink: &dyn EventSink,
    ) -> Result<ExecutionResult> {
        let start_time = Instant::now();
        let capacity = self
            .config
            .max_concurrent_nodes
            .unwrap_or(graph.max_concurrent_nodes)
            .max(1);
        let mut queue = ExecutionQueueState::with_capacity(graph, capacity);
        let mut context = initial_context;
        let mut reservations: HashMap<NodeId, u64> = HashMap::new();
        let mut retries: BTreeMap<NodeId, u32> = BTreeMap::new();
        let mut in_flight: FuturesUnordered<BoxFuture<'_, NodeRun>> = FuturesUnordered::new();
        let mut cancelled = false;

        log::info!(
            "Executing workflow '{}' ({} nodes, capacity {}) as {}",
            graph.id,
            graph.node_count(),
            capacity,
            self.execution_id
        );
        self.emit(
            event_sink,
            WorkflowEvent::ExecutionStarted {
                workflow_id: graph.id.clone(),
                execution_id: self.execution_id.clone(),
                total_nodes: graph.node_count(),
            },
        );

        loop {
            if self.cancel.is_cancelled() {
                cancelled = true;
                in_flight.clear();
                queue = self
                    .cancel_run(graph, queue, &mut reservations, event_sink)
                    .await;
                break;
            }

            let started = self
                .dispatch_ready(graph, &mut queue, &mut context, &mut reservations, event_sink)
                .await?;
            for node in started {
                in_flight.push(self.start_node(graph, node, context.clone(), event_sink));
            }

            if in_flight.is_empty() {
                break;
            }

            let run = tokio::select! {
                run = in_flight.next() => run,
                _ = self.cancel.cancelled() => continue,
            };
            if let Some(run) = run {
                if run.retries > 0 {
                    retries.insert(run.node_id.clone(), run.retries);
                }
                self.handle_run(graph, run, &mut queue, &mut context, &mut reservations, event_sink)
                    .await;
            }
        }

        let summary = queue.get_execution_summary();
        let status = if cancelled {
            RunStatus::Cancelled
        } else if summary.terminal() < summary.total {
            RunStatus::Stalled
        } else if summary.failed == 0 {
            RunStatus::Completed
        } else if summary.completed > 0 {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Failed
        };

        if status == RunStatus::Stalled {
            log::warn!(
                "Workflow '{}' stalled with unfinished nodes: {}",
                graph.id,
                queue.pending_nodes(graph)
                    .into_iter()
                    .chain(queue.ready_nodes().iter().cloned())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        let errors = queue.errors();
        match status {
            RunStatus::Completed => self.emit(
                event_sink,
                WorkflowEvent::ExecutionCompleted {
                    workflow_id: graph.id.clone(),
                    execution_id: self.execution_id.clone(),
                },
            ),
            RunStatus::Cancelled => self.emit(
                event_sink,
                WorkflowEvent::ExecutionCancelled {
                    workflow_id: graph.id.clone(),
                    execution_id: self.execution_id.clone(),
                },
            ),
            _ => self.emit(
                event_sink,
                WorkflowEvent::ExecutionFailed {
                    workflow_id: graph.id.clone(),
                    execution_id: self.execution_id.clone(),
                    error: failure_message(status, &summary, &errors),
                },
            ),
        }

        let elapsed_ms = start_time.elapsed().as_millis() as u64;
        log::info!(
            "Workflow '{}' finished as {:?} in {}ms ({} completed, {} failed, {} skipped)",
            graph.id,
            status,
            elapsed_ms,
            summary.completed,
            summary.failed,
            summary.skipped
        );

        Ok(ExecutionResult {
            execution_id: self.execution_id.clone(),
            workflow_id: graph.id.clone(),
            status,
            summary,
            outputs: context.final_outputs(&graph.output_node_ids),
            context,
            errors,
            retries,
            elapsed_ms,
        })
    }

    /// Admit ready nodes and mark them executing. Returns the nodes that
    /// started.
    async fn dispatch_ready<'a>(
        &self,
        graph: &'a BuiltWorkflow,
        queue: &mut ExecutionQueueState,
        context: &mut ContextSnapshot,
        reservations: &mut HashMap<NodeId, u64>,
        event_sink: &dyn EventSink,
    ) -> Result<Vec<&'a BuiltNode>> {
        let capacity = queue.available_capacity();
        if capacity == 0 || queue.ready_nodes().is_empty() {
            return Ok(Vec::new());
        }

        // Refused nodes stay ready but must not hold back the ones behind them.
        let ready: Vec<NodeId> = queue.ready_nodes().to_vec();
        let mut admitted = Vec::new();
        for id in ready {
            if admitted.len() == capacity {
                break;
            }
            let node = graph
                .node(&id)
                .ok_or_else(|| EngineError::UnknownNode(id.clone()))?;
            if !node.kind.is_engine_handled() {
                let cost = self.admission.estimate(node).await;
                if !self.admission.reserve(node, cost).await {
                    log::debug!("Admission refused for '{}', leaving it ready", id);
                    continue;
                }
                reservations.insert(id.clone(), cost);
            }
            admitted.push(node);
        }

        let at = now_millis();
        let mut plain: Vec<NodeId> = Vec::new();
        let mut branches: BTreeMap<&str, Vec<NodeId>> = BTreeMap::new();
        for node in &admitted {
            match parallel_parent(graph, &node.id) {
                Some(parent) => branches.entry(parent).or_default().push(node.id.clone()),
                None => plain.push(node.id.clone()),
            }
        }
        *queue = queue.mark_executing(&plain, at);
        for (parent, ids) in branches {
            let fan = fan_out(queue, context, graph, parent, &ids, at);
            *queue = fan.queue;
            *context = fan.context;
        }

        let mut started = Vec::new();
        for node in admitted {
            if queue.status_of(&node.id) == NodeStatus::Executing {
                self.emit(
                    event_sink,
                    WorkflowEvent::NodeStarted {
                        node_id: node.id.clone(),
                        execution_id: self.execution_id.clone(),
                    },
                );
                started.push(node);
            } else {
                self.release(reservations, &node.id).await;
            }
        }
        Ok(started)
    }

    /// Build the future that runs one node
    fn start_node<'a>(
        &'a self,
        graph: &'a BuiltWorkflow,
        node: &'a BuiltNode,
        context: ContextSnapshot,
        event_sink: &'a dyn EventSink,
    ) -> BoxFuture<'a, NodeRun> {
        match node.kind {
            NodeKind::Join => {
                let output = assemble_join(&context, graph, &node.id);
                Box::pin(future::ready(NodeRun::completed(
                    &node.id,
                    context.clone(),
                    context,
                    output,
                )))
            }
            NodeKind::Parallel => {
                let output = serde_json::json!({ "branches": graph.dependents(&node.id) });
                Box::pin(future::ready(NodeRun::completed(
                    &node.id,
                    context.clone(),
                    context,
                    output,
                )))
            }
            NodeKind::Loop => Box::pin(async move {
                match self
                    .run_loop_node(graph, node, context.clone(), 0, event_sink)
                    .await
                {
                    Ok((updated, output)) => NodeRun::completed(&node.id, context, updated, output),
                    Err(error) => NodeRun::failed(&node.id, error),
                }
            }),
            _ => Box::pin(async move {
                let attempted = self.run_activity(node, &context, event_sink).await;
                let run = match attempted.result {
                    Ok(result) => {
                        let updated = apply_variables(&context, &node.id, result.variables);
                        NodeRun::completed(&node.id, context, updated, result.output)
                    }
                    Err(error) => NodeRun::failed(&node.id, error),
                };
                run.with_retries(attempted.retries)
            }),
        }
    }

    /// Call the activity, retrying failures per the retry policy
    async fn run_activity(
        &self,
        node: &BuiltNode,
        context: &ContextSnapshot,
        event_sink: &dyn EventSink,
    ) -> Attempted {
        let policy = &self.config.retry;
        let mut retries = 0u32;
        loop {
            let result = self.activities.execute(node, context).await;
            if result.success {
                return Attempted {
                    result: Ok(result),
                    retries,
                };
            }
            let error = result.error.unwrap_or_else(|| {
                EngineError::activity(&node.id, "failed without an error message").to_string()
            });
            if !policy.allows_retry(retries) {
                return Attempted {
                    result: Err(error),
                    retries,
                };
            }
            retries += 1;
            let delay = policy.delay_for(retries);
            log::warn!(
                "Node '{}' failed ({}), retry {} in {}ms",
                node.id,
                error,
                retries,
                delay.as_millis()
            );
            self.emit(
                event_sink,
                WorkflowEvent::NodeRetrying {
                    node_id: node.id.clone(),
                    execution_id: self.execution_id.clone(),
                    attempt: retries + 1,
                    delay_ms: delay.as_millis() as u64,
                    error,
                },
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Run a loop node's body under the loop controller.
    ///
    /// Body nodes run in order, once per iteration; a body node of kind
    /// `Loop` recurses one level deeper. The iteration's output is the last
    /// body node's output.
    fn run_loop_node<'a>(
        &'a self,
        graph: &'a BuiltWorkflow,
        node: &'a BuiltNode,
        context: ContextSnapshot,
        depth: usize,
        event_sink: &'a dyn EventSink,
    ) -> BoxFuture<'a, std::result::Result<(ContextSnapshot, Value), String>> {
        Box::pin(async move {
            let config = LoopConfig::from_node(node).map_err(|e| e.to_string())?;
            let loop_context = graph.loop_context(&node.id);
            let body: &[BuiltNode] = loop_context.map(|ctx| ctx.body.as_slice()).unwrap_or(&[]);
            let has_nested = loop_context.map(LoopContext::has_nested_loop).unwrap_or(false);
            let scope = LoopScope::for_depth(depth, has_nested);

            let mut run = LoopRun::begin(&config, scope, &context, self.config.default_max_iterations);
            if run.is_exhausted() {
                let reason = run.empty_exit_reason();
                let outcome = run.into_outcome(context, reason);
                let output = outcome.to_output();
                return Ok::<_, String>((outcome.context, output));
            }

            let mut context = context;
            loop {
                let mut iteration_ctx = run.enter_iteration(&context);
                let mut last_output = Value::Null;
                for body_node in body {
                    let (next, output) = if body_node.kind == NodeKind::Loop {
                        self.run_loop_node(graph, body_node, iteration_ctx.clone(), depth + 1, event_sink)
                            .await?
                    } else {
                        let result = self
                            .run_activity(body_node, &iteration_ctx, event_sink)
                            .await
                            .result
                            .map_err(|e| format!("Loop body node '{}' failed: {}", body_node.id, e))?;
                        let next = apply_variables(&iteration_ctx, &body_node.id, result.variables);
                        (next, result.output)
                    };
                    iteration_ctx = next.store_node_output(body_node.id.clone(), output.clone());
                    last_output = output;
                }

                let (next, step) = run.finish_iteration(&iteration_ctx, last_output);
                context = next;
                self.emit(
                    event_sink,
                    WorkflowEvent::LoopIteration {
                        node_id: node.id.clone(),
                        execution_id: self.execution_id.clone(),
                        iteration: run.iteration_count(),
                    },
                );
                if let LoopStep::Exit(reason) = step {
                    let outcome = run.into_outcome(context, reason);
                    let output = outcome.to_output();
                    return Ok((outcome.context, output));
                }
            }
        })
    }

    /// Fold one completion back into queue and context
    async fn handle_run(
        &self,
        graph: &BuiltWorkflow,
        run: NodeRun,
        queue: &mut ExecutionQueueState,
        context: &mut ContextSnapshot,
        reservations: &mut HashMap<NodeId, u64>,
        event_sink: &dyn EventSink,
    ) {
        let at = now_millis();
        let skipped_before = queue.skipped_nodes().clone();
        let node_id = run.node_id;

        match run.outcome {
            Ok(success) => {
                *context = context
                    .overlay_changes(&success.base, &success.updated)
                    .store_node_output(node_id.clone(), success.output.clone());
                *queue = queue.mark_completed(&node_id, graph, at);
                if let Some(amount) = reservations.remove(&node_id) {
                    self.admission.finalize(&node_id, amount).await;
                }
                log::debug!("Node '{}' completed", node_id);

                let route = match graph.node(&node_id).map(|n| n.kind) {
                    Some(NodeKind::Switch) => {
                        let selected = selected_route_from_output(&success.output);
                        let outcome = route_switch(queue, graph, &node_id, selected.as_deref(), at);
                        *queue = outcome.queue;
                        Some(outcome.route)
                    }
                    _ => None,
                };

                self.emit(
                    event_sink,
                    WorkflowEvent::NodeCompleted {
                        node_id: node_id.clone(),
                        execution_id: self.execution_id.clone(),
                        output: Some(success.output),
                    },
                );
                if let Some(route) = route {
                    self.emit(
                        event_sink,
                        WorkflowEvent::RouteSelected {
                            node_id: node_id.clone(),
                            execution_id: self.execution_id.clone(),
                            route,
                        },
                    );
                }
            }
            Err(error) => {
                *queue = queue.mark_failed(&node_id, error.as_str(), graph, at);
                self.release(reservations, &node_id).await;
                self.emit(
                    event_sink,
                    WorkflowEvent::NodeFailed {
                        node_id: node_id.clone(),
                        execution_id: self.execution_id.clone(),
                        error,
                    },
                );
            }
        }

        self.emit_new_skips(event_sink, &skipped_before, queue);
        self.emit_progress(event_sink, queue);
    }

    /// Skip everything not yet finished and fail what was in flight
    async fn cancel_run(
        &self,
        graph: &BuiltWorkflow,
        queue: ExecutionQueueState,
        reservations: &mut HashMap<NodeId, u64>,
        event_sink: &dyn EventSink,
    ) -> ExecutionQueueState {
        log::info!("Cancelling execution {}", self.execution_id);
        let at = now_millis();
        let skipped_before = queue.skipped_nodes().clone();
        let mut queue = queue.cancel_remaining(at);

        let running: Vec<NodeId> = queue.executing_nodes().iter().cloned().collect();
        let message = EngineError::Cancelled.to_string();
        for id in running {
            queue = queue.mark_failed(&id, message.as_str(), graph, at);
            self.release(reservations, &id).await;
            self.emit(
                event_sink,
                WorkflowEvent::NodeFailed {
                    node_id: id,
                    execution_id: self.execution_id.clone(),
                    error: message.clone(),
                },
            );
        }
        self.emit_new_skips(event_sink, &skipped_before, &queue);
        queue
    }

    async fn release(&self, reservations: &mut HashMap<NodeId, u64>, node_id: &str) {
        if let Some(amount) = reservations.remove(node_id) {
            self.admission.release(node_id, amount).await;
        }
    }

    fn emit_new_skips(
        &self,
        event_sink: &dyn EventSink,
        before: &BTreeSet<NodeId>,
        queue: &ExecutionQueueState,
    ) {
        for id in queue.skipped_nodes().difference(before) {
            self.emit(
                event_sink,
                WorkflowEvent::NodeSkipped {
                    node_id: id.clone(),
                    execution_id: self.execution_id.clone(),
                },
            );
        }
    }

    fn emit_progress(&self, event_sink: &dyn EventSink, queue: &ExecutionQueueState) {
        if !self.config.emit_progress_events {
            return;
        }
        let summary = queue.get_execution_summary();
        self.emit(
            event_sink,
            WorkflowEvent::progress(&self.execution_id, summary.terminal(), summary.total),
        );
    }

    fn emit(&self, event_sink: &dyn EventSink, event: WorkflowEvent) {
        let _ = event_sink.send(event);
    }
}

/// The parallel node a node hangs off, if any
fn parallel_parent<'a>(graph: &'a BuiltWorkflow, node_id: &str) -> Option<&'a str> {
    graph
        .dependencies(node_id)
        .iter()
        .find(|dep| {
            graph
                .node(dep)
                .map(|n| n.kind == NodeKind::Parallel)
                .unwrap_or(false)
        })
        .map(String::as_str)
}

/// Apply activity variable writes, dropping reserved names
fn apply_variables(
    context: &ContextSnapshot,
    node_id: &str,
    variables: BTreeMap<String, Value>,
) -> ContextSnapshot {
    let allowed = variables.into_iter().filter(|(name, _)| {
        let reserved = is_reserved_variable(name);
        if reserved {
            log::warn!("Node '{}' tried to set reserved variable '{}'", node_id, name);
        }
        !reserved
    });
    context.with_variables(allowed)
}

fn failure_message(
    status: RunStatus,
    summary: &ExecutionSummary,
    errors: &BTreeMap<NodeId, String>,
) -> String {
    match status {
        RunStatus::Stalled => format!(
            "Execution stalled with {} of {} nodes unfinished",
            summary.total - summary.terminal(),
            summary.total
        ),
        _ => {
            let failed: Vec<&str> = errors.keys().map(String::as_str).collect();
            format!("{} node(s) failed: {}", failed.len(), failed.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::WorkflowBuilder;
    use crate::config::RetryPolicy;
    use crate::context::create_context;
    use crate::events::{NullEventSink, VecEventSink};
    use crate::loops::LoopState;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    type Behavior = Arc<dyn Fn(&BuiltNode, &ContextSnapshot, u32) -> ActivityResult + Send + Sync>;

    /// Activities scripted per node id; unscripted nodes echo their id.
    #[derive(Default)]
    struct MockActivities {
        behaviors: HashMap<String, Behavior>,
        delays: HashMap<String, u64>,
        calls: Mutex<HashMap<String, u32>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MockActivities {
        fn new() -> Self {
            Self::default()
        }

        fn with<F>(mut self, node_id: &str, behavior: F) -> Self
        where
            F: Fn(&BuiltNode, &ContextSnapshot, u32) -> ActivityResult + Send + Sync + 'static,
        {
            self.behaviors.insert(node_id.to_string(), Arc::new(behavior));
            self
        }

        fn with_delay(mut self, node_id: &str, ms: u64) -> Self {
            self.delays.insert(node_id.to_string(), ms);
            self
        }

        fn calls(&self, node_id: &str) -> u32 {
            self.calls.lock().unwrap().get(node_id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ActivityExecutor for MockActivities {
        async fn execute(&self, node: &BuiltNode, context: &ContextSnapshot) -> ActivityResult {
            let attempt = {
                let mut calls = self.calls.lock().unwrap();
                let count = calls.entry(node.id.clone()).or_insert(0);
                *count += 1;
                *count
            };
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(ms) = self.delays.get(&node.id) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            match self.behaviors.get(&node.id) {
                Some(behavior) => behavior(node, context, attempt),
                None => ActivityResult::success(json!(node.id)),
            }
        }
    }

    /// Admission gate that refuses one node and records settlements
    #[derive(Default)]
    struct RefusingGate {
        refuse: String,
        finalized: Mutex<Vec<String>>,
        released: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AdmissionGate for RefusingGate {
        async fn estimate(&self, _node: &BuiltNode) -> u64 {
            5
        }

        async fn reserve(&self, node: &BuiltNode, _amount: u64) -> bool {
            node.id != self.refuse
        }

        async fn release(&self, node_id: &str, _amount: u64) {
            self.released.lock().unwrap().push(node_id.to_string());
        }

        async fn finalize(&self, node_id: &str, _amount: u64) {
            self.finalized.lock().unwrap().push(node_id.to_string());
        }
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn no_retry() -> EngineConfig {
        EngineConfig::default().with_retry(RetryPolicy::none())
    }

    fn linear() -> BuiltWorkflow {
        WorkflowBuilder::new("linear", "A -> B -> C")
            .add_node("A", NodeKind::Trigger)
            .add_node("B", NodeKind::Transform)
            .add_node("C", NodeKind::Output)
            .add_edge("A", "B")
            .add_edge("B", "C")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_linear_workflow_completes() {
        init_logging();
        let executor = WorkflowExecutor::new(MockActivities::new()).with_execution_id("exec-1");
        let sink = VecEventSink::new();

        let result = executor
            .execute(&linear(), ContextSnapshot::default(), &sink)
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.is_success());
        assert_eq!(result.execution_id, "exec-1");
        assert_eq!(result.outputs.get("C"), Some(&json!("C")));
        assert_eq!(result.summary.completed, 3);

        let events = sink.events();
        assert!(matches!(events.first(), Some(WorkflowEvent::ExecutionStarted { total_nodes: 3, .. })));
        assert!(matches!(events.last(), Some(WorkflowEvent::ExecutionCompleted { .. })));
        let started: Vec<&str> = events
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::NodeStarted { .. }))
            .filter_map(|e| e.node_id())
            .collect();
        assert_eq!(started, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents() {
        let activities = MockActivities::new()
            .with("B", |_, _, _| ActivityResult::failure("Connection timeout after 30s"));
        let executor = WorkflowExecutor::new(activities).with_config(no_retry());
        let sink = VecEventSink::new();

        let result = executor
            .execute(&linear(), ContextSnapshot::default(), &sink)
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::PartiallyFailed);
        assert_eq!(
            result.errors.get("B").map(String::as_str),
            Some("Connection timeout after 30s")
        );
        assert_eq!(result.summary.skipped, 1);
        assert!(result.outputs.is_empty());
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, WorkflowEvent::NodeSkipped { node_id, .. } if node_id == "C")));
        assert!(matches!(sink.events().last(), Some(WorkflowEvent::ExecutionFailed { .. })));
    }

    #[tokio::test]
    async fn test_trigger_failure_fails_run() {
        let activities = MockActivities::new().with("A", |_, _, _| ActivityResult::failure("bad input"));
        let executor = WorkflowExecutor::new(activities).with_config(no_retry());
        let result = executor
            .execute(&linear(), ContextSnapshot::default(), &NullEventSink)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.summary.skipped, 2);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let activities = MockActivities::new().with("B", |_, _, attempt| {
            if attempt < 3 {
                ActivityResult::failure("flaky")
            } else {
                ActivityResult::success(json!("recovered"))
            }
        });
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 1,
            backoff_multiplier: 1.0,
            max_backoff_ms: 1,
        };
        let executor =
            WorkflowExecutor::new(activities).with_config(EngineConfig::default().with_retry(policy));
        let sink = VecEventSink::new();

        let result = executor
            .execute(&linear(), ContextSnapshot::default(), &sink)
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.context.get_node_output("B"), Some(&json!("recovered")));
        let retries = sink
            .events()
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::NodeRetrying { .. }))
            .count();
        assert_eq!(retries, 2);
        assert_eq!(result.retries.get("B"), Some(&2));
        assert!(result.retries.get("A").is_none());
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let activities = MockActivities::new().with("B", |_, _, _| ActivityResult::failure("down"));
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff_ms: 0,
            backoff_multiplier: 1.0,
            max_backoff_ms: 0,
        };
        let executor =
            WorkflowExecutor::new(activities).with_config(EngineConfig::default().with_retry(policy));
        let result = executor
            .execute(&linear(), ContextSnapshot::default(), &NullEventSink)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::PartiallyFailed);
        assert_eq!(executor.activities.calls("B"), 2);
        assert_eq!(result.retries.get("B"), Some(&1));
    }

    #[tokio::test]
    async fn test_parallel_join_is_order_independent() {
        let graph = WorkflowBuilder::new("fan", "Fan-out")
            .add_node("Input", NodeKind::Trigger)
            .add_node("Split", NodeKind::Parallel)
            .add_node("Branch1", NodeKind::Transform)
            .add_node("Branch2", NodeKind::Transform)
            .add_node("Branch3", NodeKind::Transform)
            .add_node("Join", NodeKind::Join)
            .add_edge("Input", "Split")
            .add_edge("Split", "Branch1")
            .add_edge("Split", "Branch2")
            .add_edge("Split", "Branch3")
            .add_edge("Branch1", "Join")
            .add_edge("Branch2", "Join")
            .add_edge("Branch3", "Join")
            .build()
            .unwrap();
        let activities = MockActivities::new()
            .with("Branch1", |_, ctx, _| {
                assert_eq!(ctx.resolve_path("parallel_Branch1.index"), Some(&json!(0)));
                ActivityResult::success(json!(10))
            })
            .with("Branch2", |_, _, _| ActivityResult::success(json!(20)))
            .with("Branch3", |_, _, _| ActivityResult::success(json!(30)))
            .with_delay("Branch1", 60)
            .with_delay("Branch2", 30)
            .with_delay("Branch3", 5);
        let executor = WorkflowExecutor::new(activities);
        let sink = VecEventSink::new();

        let result = executor
            .execute(&graph, ContextSnapshot::default(), &sink)
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.outputs["Join"]["results"], json!([10, 20, 30]));
        assert_eq!(executor.activities.peak.load(Ordering::SeqCst), 3);

        let events = sink.events();
        let branch_order: Vec<&str> = events
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::NodeCompleted { .. }))
            .filter_map(|e| e.node_id())
            .filter(|id| id.starts_with("Branch"))
            .collect();
        assert_eq!(branch_order, vec!["Branch3", "Branch2", "Branch1"]);
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let mut builder = WorkflowBuilder::new("wide", "Wide").add_node("T", NodeKind::Trigger);
        let mut activities = MockActivities::new();
        for i in 0..5 {
            let id = format!("n{}", i);
            builder = builder.add_node(id.as_str(), NodeKind::Transform).add_edge("T", id.as_str());
            activities = activities.with_delay(&id, 20);
        }
        let graph = builder.build().unwrap();
        let executor = WorkflowExecutor::new(activities)
            .with_config(EngineConfig::default().with_max_concurrent_nodes(2));

        let result = executor
            .execute(&graph, ContextSnapshot::default(), &NullEventSink)
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(executor.activities.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_switch_unmatched_route_takes_default() {
        let graph = WorkflowBuilder::new("sw", "Router")
            .add_node("T", NodeKind::Trigger)
            .add_node("S", NodeKind::Switch)
            .add_node("A", NodeKind::Transform)
            .add_node("B", NodeKind::Transform)
            .add_node("C", NodeKind::Transform)
            .add_node("D", NodeKind::Transform)
            .add_node("D2", NodeKind::Output)
            .add_edge("T", "S")
            .add_edge_with_handle("S", "a", "A")
            .add_edge_with_handle("S", "b", "B")
            .add_edge_with_handle("S", "c", "C")
            .add_edge_with_handle("S", "default", "D")
            .add_edge("D", "D2")
            .build()
            .unwrap();
        let activities = MockActivities::new()
            .with("S", |_, _, _| ActivityResult::success(json!({"selectedRoute": "zzz"})));
        let executor = WorkflowExecutor::new(activities);
        let sink = VecEventSink::new();

        let result = executor
            .execute(&graph, ContextSnapshot::default(), &sink)
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.summary.skipped, 3);
        assert_eq!(result.outputs.get("D2"), Some(&json!("D2")));
        for id in ["A", "B", "C"] {
            assert_eq!(executor.activities.calls(id), 0);
        }
        assert!(sink.events().iter().any(|e| matches!(
            e,
            WorkflowEvent::RouteSelected { route: Some(r), .. } if r == "default"
        )));
    }

    #[tokio::test]
    async fn test_while_loop_node() {
        let graph = WorkflowBuilder::new("loop", "Accumulate")
            .add_node("T", NodeKind::Trigger)
            .add_node("L", NodeKind::Loop)
            .with_config(json!({
                "kind": "while",
                "condition": {"path": "sum", "operator": "lt", "value": 100}
            }))
            .add_loop_body("L", "inc", NodeKind::Transform)
            .add_edge("T", "L")
            .build()
            .unwrap();
        let activities = MockActivities::new().with("inc", |_, ctx, _| {
            let state = LoopState::read(ctx, LoopScope::Single).unwrap();
            let sum = ctx.get_variable("sum").and_then(|v| v.as_i64()).unwrap_or(0)
                + (state.index as i64 + 1) * 10;
            ActivityResult::success(json!(sum)).with_variable("sum", json!(sum))
        });
        let executor = WorkflowExecutor::new(activities);
        let sink = VecEventSink::new();

        let result = executor
            .execute(&graph, create_context([("sum", json!(0))]), &sink)
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.context.get_variable("sum"), Some(&json!(100)));
        let output = result.context.get_node_output("L").unwrap();
        assert_eq!(output["iterations"], json!(4));
        assert_eq!(output["exitReason"], json!("condition"));
        let iterations = sink
            .events()
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::LoopIteration { .. }))
            .count();
        assert_eq!(iterations, 4);
    }

    #[tokio::test]
    async fn test_nested_loop_nodes() {
        let graph = WorkflowBuilder::new("nested", "Grid")
            .add_node("T", NodeKind::Trigger)
            .add_node("rows", NodeKind::Loop)
            .with_config(json!({"kind": "counter", "count": 2}))
            .add_loop_body("rows", "cols", NodeKind::Loop)
            .with_config(json!({"kind": "counter", "count": 3}))
            .add_loop_body("cols", "cell", NodeKind::Transform)
            .add_edge("T", "rows")
            .build()
            .unwrap();
        let activities = MockActivities::new().with("cell", |_, ctx, _| {
            let row = LoopState::read(ctx, LoopScope::Outer).unwrap().index;
            let col = LoopState::read(ctx, LoopScope::Inner).unwrap().index;
            ActivityResult::success(json!(format!("{}:{}", row, col)))
        });
        let executor = WorkflowExecutor::new(activities);

        let result = executor
            .execute(&graph, ContextSnapshot::default(), &NullEventSink)
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(executor.activities.calls("cell"), 6);
        assert_eq!(result.context.get_node_output("cell"), Some(&json!("1:2")));
        let rows = result.context.get_node_output("rows").unwrap();
        assert_eq!(rows["iterations"], json!(2));
    }

    #[tokio::test]
    async fn test_loop_body_failure_fails_loop() {
        let graph = WorkflowBuilder::new("loop", "Broken")
            .add_node("L", NodeKind::Loop)
            .with_config(json!({"kind": "counter", "count": 3}))
            .add_loop_body("L", "step", NodeKind::Transform)
            .add_node("after", NodeKind::Output)
            .add_edge("L", "after")
            .build()
            .unwrap();
        let activities = MockActivities::new().with("step", |_, _, _| ActivityResult::failure("no"));
        let executor = WorkflowExecutor::new(activities).with_config(no_retry());

        let result = executor
            .execute(&graph, ContextSnapshot::default(), &NullEventSink)
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.errors["L"].contains("step"));
        assert_eq!(result.summary.skipped, 1);
    }

    #[tokio::test]
    async fn test_admission_refusal_stalls() {
        let gate = Arc::new(RefusingGate {
            refuse: "B".to_string(),
            ..Default::default()
        });
        let executor = WorkflowExecutor::new(MockActivities::new()).with_admission(gate.clone());
        let sink = VecEventSink::new();

        let result = executor
            .execute(&linear(), ContextSnapshot::default(), &sink)
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Stalled);
        assert_eq!(result.summary.ready, 1);
        assert_eq!(result.summary.pending, 1);
        assert_eq!(*gate.finalized.lock().unwrap(), vec!["A".to_string()]);
        assert!(matches!(sink.events().last(), Some(WorkflowEvent::ExecutionFailed { .. })));
    }

    #[tokio::test]
    async fn test_refused_node_does_not_block_ready_siblings() {
        let graph = WorkflowBuilder::new("siblings", "T -> X, Y")
            .add_node("T", NodeKind::Trigger)
            .add_node("X", NodeKind::Transform)
            .add_node("Y", NodeKind::Output)
            .add_edge("T", "X")
            .add_edge("T", "Y")
            .max_concurrent_nodes(1)
            .build()
            .unwrap();
        let gate = Arc::new(RefusingGate {
            refuse: "X".to_string(),
            ..Default::default()
        });
        let executor = WorkflowExecutor::new(MockActivities::new()).with_admission(gate.clone());

        let result = executor
            .execute(&graph, ContextSnapshot::default(), &NullEventSink)
            .await
            .unwrap();

        assert_eq!(result.outputs.get("Y"), Some(&json!("Y")));
        assert_eq!(result.summary.completed, 2);
        assert_eq!(result.summary.ready, 1);
        assert_eq!(result.status, RunStatus::Stalled);
        assert_eq!(executor.activities.calls("X"), 0);
        assert_eq!(
            *gate.finalized.lock().unwrap(),
            vec!["T".to_string(), "Y".to_string()]
        );
    }

    #[tokio::test]
    async fn test_zero_limit_loop_node() {
        let graph = WorkflowBuilder::new("loop", "Never")
            .add_node("L", NodeKind::Loop)
            .with_config(json!({"kind": "while", "maxIterations": 0}))
            .add_loop_body("L", "step", NodeKind::Transform)
            .build()
            .unwrap();
        let executor = WorkflowExecutor::new(MockActivities::new());

        let result = executor
            .execute(&graph, ContextSnapshot::default(), &NullEventSink)
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(executor.activities.calls("step"), 0);
        let output = result.context.get_node_output("L").unwrap();
        assert_eq!(output["iterations"], json!(0));
        assert_eq!(output["exitReason"], json!("max-iterations"));
    }

    #[tokio::test]
    async fn test_cancellation() {
        init_logging();
        let activities = MockActivities::new().with_delay("B", 10_000);
        let executor = WorkflowExecutor::new(activities);
        let handle = executor.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });
        let sink = VecEventSink::new();

        let result = executor
            .execute(&linear(), ContextSnapshot::default(), &sink)
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.errors.get("B").map(String::as_str), Some("Workflow cancelled"));
        assert_eq!(result.summary.skipped, 1);
        assert!(result.elapsed_ms < 10_000);
        assert!(matches!(sink.events().last(), Some(WorkflowEvent::ExecutionCancelled { .. })));
    }

    #[test]
    fn test_cancel_handle() {
        let handle = CancelHandle::new();
        assert!(!handle.is_cancelled());
        handle.clone().cancel();
        tokio_test::block_on(handle.cancelled());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_reserved_variables_are_not_writable() {
        let activities = MockActivities::new().with("B", |_, _, _| {
            ActivityResult::success(json!(1))
                .with_variable("loop", json!("hijack"))
                .with_variable("note", json!("kept"))
        });
        let executor = WorkflowExecutor::new(activities);
        let result = executor
            .execute(&linear(), ContextSnapshot::default(), &NullEventSink)
            .await
            .unwrap();
        assert!(result.context.get_variable("loop").is_none());
        assert_eq!(result.context.get_variable("note"), Some(&json!("kept")));
    }

    #[tokio::test]
    async fn test_progress_events() {
        let executor = WorkflowExecutor::new(MockActivities::new());
        let sink = VecEventSink::new();
        executor
            .execute(&linear(), ContextSnapshot::default(), &sink)
            .await
            .unwrap();
        let last_progress = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                WorkflowEvent::ExecutionProgress { percentage, .. } => Some(percentage),
                _ => None,
            })
            .last();
        assert_eq!(last_progress, Some(100.0));
    }
}
