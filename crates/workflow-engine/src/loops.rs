//! Loop controller
//!
//! A loop re-executes its body nodes against the context, once per
//! iteration, in do-while order:
//!
//! 1. write the scope's state object (`index`, `iteration`, `isFirst`, ...)
//! 2. run the body
//! 3. append the body output to `results`
//! 4. evaluate the continuation predicate against the body-mutated context
//!
//! The loop stops when the predicate is false (`condition`) or when the
//! iteration count reaches the limit (`max-iterations`). Neither is an
//! error. A body breaks out early by setting a variable the predicate reads.
//!
//! Each nesting level writes its own reserved variable (see [`LoopScope`]),
//! so an inner body can read the outer loop's state while the inner index
//! restarts at 0 every outer iteration.

use std::borrow::Cow;
use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{ContextSnapshot, INNER_LOOP_VARIABLE, LOOP_VARIABLE, OUTER_LOOP_VARIABLE};
use crate::error::{EngineError, Result};
use crate::types::BuiltNode;

/// Iteration limit applied when a loop does not declare one
pub const DEFAULT_MAX_ITERATIONS: u32 = 100;

/// Why a loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopExitReason {
    /// The continuation predicate returned false
    Condition,
    /// The iteration count reached the limit
    MaxIterations,
}

impl LoopExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopExitReason::Condition => "condition",
            LoopExitReason::MaxIterations => "max-iterations",
        }
    }
}

/// Reserved variable a loop level writes its state to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopScope {
    /// A loop with no nested loop in its body
    Single,
    /// The top level of a nest
    Outer,
    /// The second level of a nest
    Inner,
    /// Any deeper level
    Depth(usize),
}

impl LoopScope {
    /// Pick the scope for a loop at `depth` (0 = top level).
    ///
    /// A top-level loop only takes `outerLoop` when its body contains
    /// another loop.
    pub fn for_depth(depth: usize, has_nested_loop: bool) -> Self {
        match depth {
            0 if has_nested_loop => LoopScope::Outer,
            0 => LoopScope::Single,
            1 => LoopScope::Inner,
            d => LoopScope::Depth(d),
        }
    }

    /// Name of the reserved context variable
    pub fn variable_name(&self) -> Cow<'static, str> {
        match self {
            LoopScope::Single => Cow::Borrowed(LOOP_VARIABLE),
            LoopScope::Outer => Cow::Borrowed(OUTER_LOOP_VARIABLE),
            LoopScope::Inner => Cow::Borrowed(INNER_LOOP_VARIABLE),
            LoopScope::Depth(d) => Cow::Owned(format!("loop_{}", d)),
        }
    }
}

/// State object written to the scope's reserved variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopState {
    /// Zero-based iteration index
    pub index: u32,
    /// One-based iteration number
    pub iteration: u32,
    /// Current element of a for-each loop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Value>,
    /// Planned iteration count (the limit, for while loops)
    pub total: u32,
    /// Body outputs of the finished iterations
    #[serde(default)]
    pub results: Vec<Value>,
    pub is_first: bool,
    pub is_last: bool,
}

impl LoopState {
    /// Read a scope's state back out of a context
    pub fn read(context: &ContextSnapshot, scope: LoopScope) -> Option<Self> {
        context
            .get_variable(&scope.variable_name())
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Comparison used by a [`LoopCondition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Ne,
    Truthy,
    Falsy,
}

/// Continuation predicate of a while loop, read from node config.
///
/// `path` is resolved with [`ContextSnapshot::resolve_path`]; a missing
/// value compares as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopCondition {
    pub path: String,
    pub operator: CompareOp,
    #[serde(default)]
    pub value: Value,
}

impl LoopCondition {
    pub fn new(path: impl Into<String>, operator: CompareOp, value: Value) -> Self {
        Self {
            path: path.into(),
            operator,
            value,
        }
    }

    /// Evaluate against a context
    pub fn evaluate(&self, context: &ContextSnapshot) -> bool {
        let null = Value::Null;
        let actual = context.resolve_path(&self.path).unwrap_or(&null);
        match self.operator {
            CompareOp::Truthy => is_truthy(actual),
            CompareOp::Falsy => !is_truthy(actual),
            CompareOp::Eq => values_equal(actual, &self.value),
            CompareOp::Ne => !values_equal(actual, &self.value),
            CompareOp::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            CompareOp::Lte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            CompareOp::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            CompareOp::Gte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

/// Check if a JSON value is "truthy".
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// What drives the iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoopKind {
    /// Repeat while the condition holds. Without a condition, only the
    /// iteration limit stops the loop.
    While {
        #[serde(default)]
        condition: Option<LoopCondition>,
    },
    /// Repeat a fixed number of times
    Counter { count: u32 },
    /// One iteration per element
    #[serde(rename_all = "camelCase")]
    ForEach {
        #[serde(default)]
        items: Vec<Value>,
        /// Context path of an array, used when `items` is empty
        #[serde(default)]
        items_path: Option<String>,
    },
}

/// Configuration for a Loop node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    #[serde(flatten)]
    pub kind: LoopKind,
    /// Iteration limit; the engine default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            kind: LoopKind::While { condition: None },
            max_iterations: None,
        }
    }
}

impl LoopConfig {
    pub fn while_condition(condition: LoopCondition) -> Self {
        Self {
            kind: LoopKind::While {
                condition: Some(condition),
            },
            max_iterations: None,
        }
    }

    pub fn counter(count: u32) -> Self {
        Self {
            kind: LoopKind::Counter { count },
            max_iterations: None,
        }
    }

    pub fn for_each(items: Vec<Value>) -> Self {
        Self {
            kind: LoopKind::ForEach {
                items,
                items_path: None,
            },
            max_iterations: None,
        }
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }

    /// Parse the config of a Loop node. A node without config loops until
    /// the iteration limit.
    pub fn from_node(node: &BuiltNode) -> Result<Self> {
        if node.config.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(node.config.clone()).map_err(|e| {
            EngineError::invalid_config(format!("Invalid loop config on '{}': {}", node.id, e))
        })
    }
}

/// Result of one finished iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStep {
    Continue,
    Exit(LoopExitReason),
}

/// Final result of a loop
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    /// Context after the last iteration, state object included
    pub context: ContextSnapshot,
    pub iterations: u32,
    pub exit_reason: LoopExitReason,
    /// Body outputs in iteration order
    pub results: Vec<Value>,
}

impl LoopOutcome {
    /// Output recorded for the loop node itself
    pub fn to_output(&self) -> Value {
        serde_json::json!({
            "iterations": self.iterations,
            "exitReason": self.exit_reason.as_str(),
            "results": self.results,
        })
    }
}

/// Step-wise controller for one run of one loop level.
///
/// Hosts that run body nodes asynchronously drive the loop with
/// [`enter_iteration`](Self::enter_iteration) and
/// [`finish_iteration`](Self::finish_iteration); [`run_loop`] drives it with
/// a closure.
#[derive(Debug, Clone)]
pub struct LoopRun {
    scope: LoopScope,
    kind: LoopKind,
    items: Vec<Value>,
    max_iterations: u32,
    iteration_count: u32,
    results: Vec<Value>,
}

impl LoopRun {
    /// Start a loop. For-each items given by path are resolved here, once.
    pub fn begin(
        config: &LoopConfig,
        scope: LoopScope,
        context: &ContextSnapshot,
        default_max_iterations: u32,
    ) -> Self {
        let items = match &config.kind {
            LoopKind::ForEach { items, items_path } if items.is_empty() => items_path
                .as_deref()
                .and_then(|path| context.resolve_path(path))
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default(),
            LoopKind::ForEach { items, .. } => items.clone(),
            _ => Vec::new(),
        };
        Self {
            scope,
            kind: config.kind.clone(),
            items,
            max_iterations: config.max_iterations.unwrap_or(default_max_iterations),
            iteration_count: 0,
            results: Vec::new(),
        }
    }

    pub fn scope(&self) -> LoopScope {
        self.scope
    }

    /// Iterations finished so far
    pub fn iteration_count(&self) -> u32 {
        self.iteration_count
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Planned iteration count, capped by the limit
    pub fn total(&self) -> u32 {
        let planned = match &self.kind {
            LoopKind::While { .. } => self.max_iterations,
            LoopKind::Counter { count } => *count,
            LoopKind::ForEach { .. } => self.items.len() as u32,
        };
        planned.min(self.max_iterations)
    }

    /// Counter and for-each loops with nothing to do, or a zero limit,
    /// run no iteration at all.
    pub fn is_exhausted(&self) -> bool {
        self.iteration_count == 0 && self.total() == 0
    }

    /// Exit reason for a loop that runs no iteration: a zero limit counts
    /// as reaching it, an empty counter or item list as the condition
    /// failing.
    pub fn empty_exit_reason(&self) -> LoopExitReason {
        if self.max_iterations == 0 {
            LoopExitReason::MaxIterations
        } else {
            LoopExitReason::Condition
        }
    }

    /// Write the state object for the next iteration
    pub fn enter_iteration(&self, context: &ContextSnapshot) -> ContextSnapshot {
        let state = self.state();
        context.set_variable(self.scope.variable_name(), state_value(&state))
    }

    /// Record the body output and decide whether to go on.
    ///
    /// The returned context carries the updated `results`.
    pub fn finish_iteration(
        &mut self,
        context: &ContextSnapshot,
        body_output: Value,
    ) -> (ContextSnapshot, LoopStep) {
        self.results.push(body_output);
        self.iteration_count += 1;

        let mut state = self.state_for(self.iteration_count - 1);
        state.results = self.results.clone();
        let context = context.set_variable(self.scope.variable_name(), state_value(&state));

        let step = if !self.should_continue(&context) {
            LoopStep::Exit(LoopExitReason::Condition)
        } else if self.iteration_count >= self.max_iterations {
            LoopStep::Exit(LoopExitReason::MaxIterations)
        } else {
            LoopStep::Continue
        };
        if let LoopStep::Exit(reason) = step {
            log::debug!(
                "Loop '{}' finished after {} iterations ({})",
                self.scope.variable_name(),
                self.iteration_count,
                reason.as_str()
            );
        }
        (context, step)
    }

    /// Body outputs so far
    pub fn results(&self) -> &[Value] {
        &self.results
    }

    /// Package the run once it has exited
    pub fn into_outcome(self, context: ContextSnapshot, exit_reason: LoopExitReason) -> LoopOutcome {
        LoopOutcome {
            context,
            iterations: self.iteration_count,
            exit_reason,
            results: self.results,
        }
    }

    fn should_continue(&self, context: &ContextSnapshot) -> bool {
        match &self.kind {
            LoopKind::While { condition } => condition
                .as_ref()
                .map(|c| c.evaluate(context))
                .unwrap_or(true),
            LoopKind::Counter { count } => self.iteration_count < *count,
            LoopKind::ForEach { .. } => (self.iteration_count as usize) < self.items.len(),
        }
    }

    fn state(&self) -> LoopState {
        let mut state = self.state_for(self.iteration_count);
        state.results = self.results.clone();
        state
    }

    fn state_for(&self, index: u32) -> LoopState {
        let total = self.total();
        LoopState {
            index,
            iteration: index + 1,
            item: self.items.get(index as usize).cloned(),
            total,
            results: Vec::new(),
            is_first: index == 0,
            is_last: index + 1 >= total,
        }
    }
}

fn state_value(state: &LoopState) -> Value {
    serde_json::to_value(state).unwrap_or(Value::Null)
}

/// Run a loop to completion with a synchronous body.
///
/// `body` receives the context with the state object already written and
/// returns the updated context plus the iteration's output.
pub fn run_loop<F, E>(
    config: &LoopConfig,
    scope: LoopScope,
    context: ContextSnapshot,
    default_max_iterations: u32,
    mut body: F,
) -> std::result::Result<LoopOutcome, E>
where
    F: FnMut(ContextSnapshot) -> std::result::Result<(ContextSnapshot, Value), E>,
{
    let mut run = LoopRun::begin(config, scope, &context, default_max_iterations);
    if run.is_exhausted() {
        let reason = run.empty_exit_reason();
        return Ok(run.into_outcome(context, reason));
    }
    let mut context = context;
    loop {
        let entered = run.enter_iteration(&context);
        let (after_body, output) = body(entered)?;
        let (next, step) = run.finish_iteration(&after_body, output);
        context = next;
        if let LoopStep::Exit(reason) = step {
            return Ok(run.into_outcome(context, reason));
        }
    }
}
