//! Workflow Engine - DAG scheduling for node-based workflows
//!
//! This crate runs workflows described as directed acyclic graphs of typed
//! nodes. It supports:
//!
//! - Dependency-driven scheduling with a bounded admission window
//! - Cascading skips when a node fails or a route is not taken
//! - Switch routing, parallel fan-out/join and do-while loops
//! - Retries with exponential backoff
//! - Cooperative cancellation and pluggable admission control
//!
//! # Architecture
//!
//! State is kept in immutable values; every transition returns a new one:
//!
//! - `ExecutionQueueState`: per-node status, readiness and skip cascades
//! - `ContextSnapshot`: node outputs and variables, copy-on-write
//! - `LoopRun`, `route_switch`, `fan_out`: control-flow helpers on top of both
//! - `WorkflowExecutor`: async host loop that drives activities through
//!   the queue
//!
//! # Example
//!
//! ```ignore
//! use workflow_engine::{ContextSnapshot, NodeKind, NullEventSink, WorkflowBuilder, WorkflowExecutor};
//!
//! let graph = WorkflowBuilder::new("etl", "Nightly ETL")
//!     .add_node("fetch", NodeKind::Trigger)
//!     .add_node("store", NodeKind::Output)
//!     .add_edge("fetch", "store")
//!     .build()?;
//!
//! let result = WorkflowExecutor::new(my_activities)
//!     .execute(&graph, ContextSnapshot::default(), &NullEventSink)
//!     .await?;
//! ```

pub mod builder;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod loops;
pub mod parallel;
pub mod queue;
pub mod switch;
pub mod types;
pub mod validation;

// Re-export key types
pub use builder::WorkflowBuilder;
pub use config::{EngineConfig, RetryPolicy};
pub use context::{create_context, ContextSnapshot};
pub use error::{EngineError, Result};
pub use events::{EventError, EventSink, NullEventSink, VecEventSink, WorkflowEvent};
pub use executor::{
    ActivityExecutor, ActivityResult, AdmissionGate, CancelHandle, ExecutionResult, RunStatus,
    UnlimitedAdmission, WorkflowExecutor,
};
pub use loops::{LoopConfig, LoopExitReason, LoopScope, LoopState};
pub use queue::{initialize_queue, ExecutionQueueState, ExecutionSummary, NodeState, NodeStatus};
pub use switch::{route_switch, SwitchConfig};
pub use types::{BuiltEdge, BuiltNode, BuiltWorkflow, LoopContext, NodeId, NodeKind, Timestamp};
pub use validation::{validate_workflow, ValidationError};
