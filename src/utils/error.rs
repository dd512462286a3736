use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::resource::ResourceType;

/// Error taxonomy for the agent mesh.
///
/// Every failed public operation returns one of these kinds together with a
/// human-readable message. Variants are serializable so that errors raised on
/// a worker node can travel back through the RPC layer intact.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum MeshError {
    /// Lifecycle and registry errors
    #[error("Invalid state for {operation}: {state}")]
    InvalidState { operation: String, state: String },

    #[error("Agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },

    #[error("Node not found: {node_id}")]
    NodeNotFound { node_id: String },

    #[error("Agent already registered: {agent_id}")]
    AlreadyExists { agent_id: String },

    /// Resource management errors
    #[error("Resource constraint violated: {resource_type} ({current} > {limit}) for agent {agent_id}")]
    ConstraintViolation {
        resource_type: ResourceType,
        current: f64,
        limit: f64,
        agent_id: String,
    },

    /// Timeout and handoff errors
    #[error("Operation timed out: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Unsupported handoff target: {target}")]
    UnsupportedTarget { target: String },

    /// Cluster errors
    #[error("No eligible node: {reason}")]
    Unavailable { reason: String },

    #[error("RPC to node {node_id} failed: {cause}")]
    Rpc { node_id: String, cause: String },

    /// Execution errors
    #[error("Agent execution failed: {agent_id}, cause: {cause}")]
    AgentExecution { agent_id: String, cause: String },

    /// Persistence errors
    #[error("State I/O error during {operation}: {cause}")]
    StateIo { operation: String, cause: String },

    /// Configuration errors
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// System errors; always logged at the raise site
    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

impl MeshError {
    /// Rewrap a worker-side error with the node it came from.
    #[must_use]
    pub fn from_node(self, node_id: &str) -> Self {
        match self {
            MeshError::Rpc { cause, .. } => MeshError::Rpc {
                node_id: node_id.to_string(),
                cause,
            },
            other => MeshError::Rpc {
                node_id: node_id.to_string(),
                cause: other.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::StateIo {
            operation: "io".to_string(),
            cause: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::StateIo {
            operation: "serialize".to_string(),
            cause: err.to_string(),
        }
    }
}

/// Result type alias for the mesh
pub type MeshResult<T> = Result<T, MeshError>;
