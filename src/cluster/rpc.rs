//! Inter-node RPC message schemas and the transport abstraction.
//!
//! The wire format is transport-agnostic: every request travels in an
//! [`RpcEnvelope`] carrying a correlation id and a deadline, and replies
//! carry either a [`NodeResponse`] or a structured error. The in-process
//! transport wires multi-node clusters inside one process and is what the
//! integration tests run on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentBlueprint;
use crate::cluster::node::{NodeInfo, NodeResources};
use crate::runtime::resource::ResourceLimits;
use crate::runtime::state::AgentStatus;
use crate::utils::error::{MeshError, MeshResult};

/// Default RPC deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Agent status as reported across the cluster. `Unknown` covers agents on
/// offline nodes and quarantined agents awaiting re-placement; the runtime
/// registry itself never stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentStatusReport {
    Initializing,
    Ready,
    Running,
    Paused,
    Completed,
    Error,
    Unknown,
}

impl From<AgentStatus> for AgentStatusReport {
    fn from(status: AgentStatus) -> Self {
        match status {
            AgentStatus::Initializing => AgentStatusReport::Initializing,
            AgentStatus::Ready => AgentStatusReport::Ready,
            AgentStatus::Running => AgentStatusReport::Running,
            AgentStatus::Paused => AgentStatusReport::Paused,
            AgentStatus::Completed => AgentStatusReport::Completed,
            AgentStatus::Error => AgentStatusReport::Error,
        }
    }
}

/// Request bodies. `PlaceAgent` flows both ways: coordinator -> worker to
/// host an agent, worker -> coordinator to request placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeRequest {
    RegisterNode {
        node: NodeInfo,
    },
    UnregisterNode {
        node_id: String,
    },
    Heartbeat {
        node_id: String,
        timestamp: DateTime<Utc>,
        resources: NodeResources,
        agent_ids: Vec<String>,
    },
    PlaceAgent {
        agent_id: String,
        blueprint: AgentBlueprint,
        limits: Option<ResourceLimits>,
        /// Restored memory shipped with migrations
        #[serde(default)]
        memory: Option<serde_json::Value>,
    },
    UnplaceAgent {
        agent_id: String,
    },
    RunAgent {
        agent_id: String,
        query: String,
        #[serde(default)]
        context: HashMap<String, serde_json::Value>,
    },
    QueryStatus {
        agent_id: String,
    },
    SaveState {
        agent_id: String,
    },
    LoadState {
        agent_id: String,
    },
    Recover {
        agent_id: String,
    },
}

/// Response bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeResponse {
    Ack,
    Placed { node_id: String },
    Response { text: String },
    Status { status: AgentStatusReport },
    Recovered { success: bool },
    Loaded { found: bool },
}

/// One request on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub correlation_id: Uuid,
    pub deadline_ms: u64,
    pub body: NodeRequest,
}

impl RpcEnvelope {
    #[must_use]
    pub fn new(body: NodeRequest) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            deadline_ms: DEFAULT_DEADLINE.as_millis() as u64,
            body,
        }
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = deadline.as_millis() as u64;
        self
    }
}

/// One reply on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    pub correlation_id: Uuid,
    pub result: Result<NodeResponse, MeshError>,
}

/// Server side of the RPC boundary.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, request: NodeRequest) -> MeshResult<NodeResponse>;
}

/// Client side of the RPC boundary.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Deliver an envelope to the node behind `endpoint` and await the reply.
    async fn call(&self, endpoint: &str, envelope: RpcEnvelope) -> MeshResult<NodeResponse>;
}

/// Routes envelopes to handlers registered in the same process.
#[derive(Clone, Default)]
pub struct InProcessTransport {
    handlers: Arc<DashMap<String, Arc<dyn RpcHandler>>>,
}

impl InProcessTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint: &str, handler: Arc<dyn RpcHandler>) {
        self.handlers.insert(endpoint.to_string(), handler);
    }

    pub fn deregister(&self, endpoint: &str) {
        self.handlers.remove(endpoint);
    }

    /// Whether a node is currently reachable.
    #[must_use]
    pub fn is_registered(&self, endpoint: &str) -> bool {
        self.handlers.contains_key(endpoint)
    }
}

#[async_trait]
impl NodeTransport for InProcessTransport {
    async fn call(&self, endpoint: &str, envelope: RpcEnvelope) -> MeshResult<NodeResponse> {
        let handler = self
            .handlers
            .get(endpoint)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| MeshError::Rpc {
                node_id: endpoint.to_string(),
                cause: "node unreachable".to_string(),
            })?;

        let deadline = Duration::from_millis(envelope.deadline_ms);
        let reply = RpcReply {
            correlation_id: envelope.correlation_id,
            result: match tokio::time::timeout(deadline, handler.handle(envelope.body)).await {
                Ok(result) => result,
                Err(_) => Err(MeshError::Timeout {
                    operation: format!("rpc to {endpoint}"),
                    timeout_ms: deadline.as_millis() as u64,
                }),
            },
        };
        reply.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl RpcHandler for EchoHandler {
        async fn handle(&self, request: NodeRequest) -> MeshResult<NodeResponse> {
            match request {
                NodeRequest::RunAgent { query, .. } => {
                    Ok(NodeResponse::Response { text: query })
                }
                _ => Ok(NodeResponse::Ack),
            }
        }
    }

    #[tokio::test]
    async fn transport_routes_to_registered_handler() {
        let transport = InProcessTransport::new();
        transport.register("mem://n1", Arc::new(EchoHandler));

        let response = transport
            .call(
                "mem://n1",
                RpcEnvelope::new(NodeRequest::RunAgent {
                    agent_id: "a1".to_string(),
                    query: "ping".to_string(),
                    context: HashMap::new(),
                }),
            )
            .await
            .unwrap();
        assert!(matches!(response, NodeResponse::Response { text } if text == "ping"));
    }

    #[tokio::test]
    async fn unreachable_node_is_an_rpc_error() {
        let transport = InProcessTransport::new();
        let err = transport
            .call(
                "mem://ghost",
                RpcEnvelope::new(NodeRequest::UnregisterNode {
                    node_id: "ghost".to_string(),
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Rpc { .. }));
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = RpcEnvelope::new(NodeRequest::QueryStatus {
            agent_id: "a1".to_string(),
        });
        let json = serde_json::to_string(&envelope).unwrap();
        let decoded: RpcEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.correlation_id, envelope.correlation_id);
        assert!(matches!(
            decoded.body,
            NodeRequest::QueryStatus { agent_id } if agent_id == "a1"
        ));
    }

    #[test]
    fn reply_carries_structured_errors() {
        let reply = RpcReply {
            correlation_id: Uuid::new_v4(),
            result: Err(MeshError::AgentNotFound {
                agent_id: "a1".to_string(),
            }),
        };
        let json = serde_json::to_string(&reply).unwrap();
        let decoded: RpcReply = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            decoded.result,
            Err(MeshError::AgentNotFound { agent_id }) if agent_id == "a1"
        ));
    }
}
