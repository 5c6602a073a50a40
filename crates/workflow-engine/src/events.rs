//! Event types for observing workflow runs
//!
//! Events are emitted by the executor to report node transitions and
//! progress. They are observer-only: a sink that fails to deliver an event
//! never changes the outcome of a run.

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Trait for sending workflow events
///
/// This abstracts over the transport mechanism (channel, log, collector)
/// so the executor can be embedded in different hosts.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be sent (e.g., channel closed)
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// Events emitted during workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkflowEvent {
    /// Run started
    #[serde(rename_all = "camelCase")]
    ExecutionStarted {
        workflow_id: String,
        execution_id: String,
        total_nodes: usize,
    },

    /// A node was dispatched
    #[serde(rename_all = "camelCase")]
    NodeStarted {
        node_id: NodeId,
        execution_id: String,
    },

    /// A node completed
    #[serde(rename_all = "camelCase")]
    NodeCompleted {
        node_id: NodeId,
        execution_id: String,
        output: Option<serde_json::Value>,
    },

    /// A node failed for good
    #[serde(rename_all = "camelCase")]
    NodeFailed {
        node_id: NodeId,
        execution_id: String,
        error: String,
    },

    /// A node will never run
    #[serde(rename_all = "camelCase")]
    NodeSkipped {
        node_id: NodeId,
        execution_id: String,
    },

    /// A failed attempt is about to be retried
    #[serde(rename_all = "camelCase")]
    NodeRetrying {
        node_id: NodeId,
        execution_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    /// Terminal node counts
    #[serde(rename_all = "camelCase")]
    ExecutionProgress {
        execution_id: String,
        completed: usize,
        total: usize,
        percentage: f32,
    },

    /// A loop iteration finished
    #[serde(rename_all = "camelCase")]
    LoopIteration {
        node_id: NodeId,
        execution_id: String,
        iteration: u32,
    },

    /// A switch picked its route
    #[serde(rename_all = "camelCase")]
    RouteSelected {
        node_id: NodeId,
        execution_id: String,
        route: Option<String>,
    },

    /// Run finished with every node completed
    #[serde(rename_all = "camelCase")]
    ExecutionCompleted {
        workflow_id: String,
        execution_id: String,
    },

    /// Run finished with failed or unfinished nodes
    #[serde(rename_all = "camelCase")]
    ExecutionFailed {
        workflow_id: String,
        execution_id: String,
        error: String,
    },

    /// Run was cancelled
    #[serde(rename_all = "camelCase")]
    ExecutionCancelled {
        workflow_id: String,
        execution_id: String,
    },
}

impl WorkflowEvent {
    /// Create a progress event
    pub fn progress(execution_id: &str, completed: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            100.0
        } else {
            completed as f32 / total as f32 * 100.0
        };
        Self::ExecutionProgress {
            execution_id: execution_id.to_string(),
            completed,
            total,
            percentage,
        }
    }

    /// Node the event refers to, if any
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeStarted { node_id, .. }
            | Self::NodeCompleted { node_id, .. }
            | Self::NodeFailed { node_id, .. }
            | Self::NodeSkipped { node_id, .. }
            | Self::NodeRetrying { node_id, .. }
            | Self::LoopIteration { node_id, .. }
            | Self::RouteSelected { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

/// A no-op event sink that discards all events
///
/// Useful for testing or when events aren't needed.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: WorkflowEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
pub struct VecEventSink {
    events: std::sync::Mutex<Vec<WorkflowEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError> {
        self.events
            .lock()
            .map_err(|_| EventError {
                message: "Event buffer poisoned".to_string(),
            })?
            .push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_event_sink() {
        let sink = VecEventSink::new();

        sink.send(WorkflowEvent::progress("exec1", 1, 4)).unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);

        match &events[0] {
            WorkflowEvent::ExecutionProgress {
                completed,
                percentage,
                ..
            } => {
                assert_eq!(*completed, 1);
                assert_eq!(*percentage, 25.0);
            }
            _ => panic!("Expected ExecutionProgress event"),
        }

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_null_event_sink() {
        let sink = NullEventSink;
        // Should not panic
        sink.send(WorkflowEvent::progress("exec1", 0, 0)).unwrap();
    }

    #[test]
    fn test_event_serialization() {
        let event = WorkflowEvent::NodeSkipped {
            node_id: "b".to_string(),
            execution_id: "e".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "nodeSkipped", "nodeId": "b", "executionId": "e"})
        );
        assert_eq!(event.node_id(), Some("b"));
    }
}
