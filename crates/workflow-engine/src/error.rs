//! Error types for the workflow engine
//!
//! Queue and context transitions never fail; these errors cover graph
//! construction, configuration loading and the orchestrator entry points.

use thiserror::Error;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the workflow engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// A node id was referenced that does not exist in the graph
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// The graph is structurally unusable
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// Node or engine configuration could not be interpreted
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An activity could not be invoked at all
    #[error("Activity error for node '{node_id}': {message}")]
    Activity { node_id: String, message: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Workflow was cancelled
    #[error("Workflow cancelled")]
    Cancelled,
}

impl EngineError {
    /// Create an invalid graph error with a message
    pub fn invalid_graph(msg: impl Into<String>) -> Self {
        Self::InvalidGraph(msg.into())
    }

    /// Create an invalid configuration error with a message
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an activity error for a node
    pub fn activity(node_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Activity {
            node_id: node_id.into(),
            message: msg.into(),
        }
    }
}
