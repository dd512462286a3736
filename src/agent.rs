//! # Agent Contract
//!
//! The runtime treats agents as opaque compute units: they carry a stable
//! identity, consume text queries, and emit text responses. The runtime never
//! inspects agent memory; it only round-trips it through the state provider.
//!
//! Cluster placement and migration cannot ship live agent objects between
//! nodes, so every agent is described by an [`AgentBlueprint`] that an
//! [`AgentFactory`] can turn back into a running instance on any node.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::utils::error::MeshResult;

/// Context passed to an agent run: opaque key/value data supplied by the
/// caller (conversation hints, user info, routing metadata).
pub type RunContext = HashMap<String, serde_json::Value>;

/// Data handed to a target agent during a handoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub handoff_id: Uuid,
    pub source_agent_id: String,
    pub source_agent_name: String,
    pub message: String,
    pub context: RunContext,
    pub metadata: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// The embedded agent contract consumed by the runtimes.
///
/// Implementations must use interior mutability: `run` and the memory
/// operations take `&self` because the runtime shares agents across tasks.
///
/// ## Cancellation
///
/// `run` receives a cancellation token. The runtime fires it when the run's
/// deadline expires or the agent is being torn down; an agent that observes
/// the token, stops its work, and returns promptly is treated as having
/// cancelled cleanly and stays runnable. Agents that ignore the token are
/// abandoned after a grace period and marked `ERROR`.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// Machine-readable type tag recorded in persisted snapshots and matched
    /// by agent factories.
    fn type_name(&self) -> &str {
        "agent"
    }

    /// Consume a query and produce a response. May fail.
    ///
    /// `cancel` fires when the runtime wants this run to stop; see the trait
    /// docs for the contract.
    async fn run(
        &self,
        query: &str,
        context: &RunContext,
        cancel: &CancellationToken,
    ) -> MeshResult<String>;

    /// Export the agent's memory as an opaque structured blob.
    fn memory_snapshot(&self) -> serde_json::Value;

    /// Restore memory from a blob previously produced by `memory_snapshot`.
    fn restore_memory(&self, blob: serde_json::Value) -> MeshResult<()>;

    /// Accept an incoming handoff. The default implementation drops it;
    /// conversational agents append it to their memory as a system message.
    fn receive_handoff(&self, _record: HandoffRecord) {}
}

/// Serializable recipe for re-instantiating an agent on another node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentBlueprint {
    pub agent_type: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl AgentBlueprint {
    #[must_use]
    pub fn new(agent_type: &str, name: &str, description: &str) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            config: serde_json::Value::Null,
        }
    }
}

/// Builds agent instances from blueprints. Each node in a cluster carries a
/// factory so migrated agents can be reconstructed where they land.
pub trait AgentFactory: Send + Sync {
    fn build(&self, agent_id: &str, blueprint: &AgentBlueprint) -> MeshResult<std::sync::Arc<dyn Agent>>;
}

/// Minimal deterministic agent used by tests and the in-process cluster.
///
/// Echoes queries back and keeps an append-only memory log so state
/// round-trips are observable.
pub struct EchoAgent {
    id: String,
    name: String,
    description: String,
    memory: Mutex<Vec<serde_json::Value>>,
}

impl EchoAgent {
    #[must_use]
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: "Echoes queries back to the caller".to_string(),
            memory: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn type_name(&self) -> &str {
        "echo"
    }

    async fn run(
        &self,
        query: &str,
        _context: &RunContext,
        _cancel: &CancellationToken,
    ) -> MeshResult<String> {
        let response = format!("echo: {query}");
        if let Ok(mut memory) = self.memory.lock() {
            memory.push(serde_json::json!({
                "role": "user",
                "content": query,
            }));
            memory.push(serde_json::json!({
                "role": "assistant",
                "content": response,
            }));
        }
        Ok(response)
    }

    fn memory_snapshot(&self) -> serde_json::Value {
        match self.memory.lock() {
            Ok(memory) => serde_json::Value::Array(memory.clone()),
            Err(_) => serde_json::Value::Array(Vec::new()),
        }
    }

    fn restore_memory(&self, blob: serde_json::Value) -> MeshResult<()> {
        if let serde_json::Value::Array(entries) = blob {
            if let Ok(mut memory) = self.memory.lock() {
                *memory = entries;
            }
        }
        Ok(())
    }

    fn receive_handoff(&self, record: HandoffRecord) {
        if let Ok(mut memory) = self.memory.lock() {
            memory.push(serde_json::json!({
                "role": "system",
                "content": format!(
                    "Handoff {} from agent {}: {}",
                    record.handoff_id, record.source_agent_name, record.message
                ),
                "handoff_id": record.handoff_id.to_string(),
            }));
        }
    }
}

/// Factory for [`EchoAgent`] instances, keyed by the `"echo"` agent type.
pub struct EchoAgentFactory;

impl AgentFactory for EchoAgentFactory {
    fn build(
        &self,
        agent_id: &str,
        blueprint: &AgentBlueprint,
    ) -> MeshResult<std::sync::Arc<dyn Agent>> {
        if blueprint.agent_type != "echo" {
            return Err(crate::utils::error::MeshError::Internal {
                reason: format!("Unknown agent type: {}", blueprint.agent_type),
            });
        }
        Ok(std::sync::Arc::new(EchoAgent::new(agent_id, &blueprint.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_agent_round_trips_memory() {
        let agent = EchoAgent::new("a1", "echo-1");
        let response = agent
            .run("hello", &RunContext::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response, "echo: hello");

        let snapshot = agent.memory_snapshot();
        let restored = EchoAgent::new("a1", "echo-1");
        restored.restore_memory(snapshot.clone()).unwrap();
        assert_eq!(restored.memory_snapshot(), snapshot);
    }

    #[test]
    fn factory_rejects_unknown_types() {
        let blueprint = AgentBlueprint::new("mystery", "m", "unknown");
        assert!(EchoAgentFactory.build("a1", &blueprint).is_err());
    }
}
