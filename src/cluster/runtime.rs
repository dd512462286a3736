//! # Cluster Agent Runtime
//!
//! A node instance is either the coordinator or a worker, chosen at
//! construction. Both wrap a [`LocalAgentRuntime`] for on-node execution.
//!
//! The coordinator owns the roster and the placement table and runs the node
//! monitor loop: nodes whose heartbeat is overdue are marked offline and
//! their agents migrated to healthy nodes from their last persisted state.
//! Workers register with the coordinator at start, heartbeat periodically,
//! and serve forwarded requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::{AgentBlueprint, AgentFactory};
use crate::cluster::node::{NodeInfo, NodeResources, NodeStatus};
use crate::cluster::placement::select_node;
use crate::cluster::rpc::{
    AgentStatusReport, NodeRequest, NodeResponse, NodeTransport, RpcEnvelope, RpcHandler,
};
use crate::observability::metrics::RuntimeMetrics;
use crate::runtime::local::{LocalAgentRuntime, RuntimeStatus};
use crate::runtime::resource::ResourceLimits;
use crate::utils::error::{MeshError, MeshResult};

/// Role of this node in the cluster.
#[derive(Debug, Clone)]
pub enum NodeRole {
    Coordinator,
    Worker { coordinator_endpoint: String },
}

/// Settings for one cluster node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub node_id: String,
    pub node_name: String,
    pub endpoint: String,
    pub role: NodeRole,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub node_check_interval: Duration,
    /// Advertised capacity for the placement policy
    pub capacity: NodeResources,
}

impl ClusterConfig {
    #[must_use]
    pub fn coordinator(node_id: &str, endpoint: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_name: format!("coordinator-{node_id}"),
            endpoint: endpoint.to_string(),
            role: NodeRole::Coordinator,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            node_check_interval: Duration::from_secs(10),
            capacity: NodeResources::default(),
        }
    }

    #[must_use]
    pub fn worker(node_id: &str, endpoint: &str, coordinator_endpoint: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_name: format!("worker-{node_id}"),
            endpoint: endpoint.to_string(),
            role: NodeRole::Worker {
                coordinator_endpoint: coordinator_endpoint.to_string(),
            },
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            node_check_interval: Duration::from_secs(10),
            capacity: NodeResources::default(),
        }
    }
}

struct QuarantinedAgent {
    blueprint: AgentBlueprint,
    limits: Option<ResourceLimits>,
}

/// Coordinator-owned cluster state. All mutations go through the write lock,
/// giving the single serialised path the roster and placement table require.
#[derive(Default)]
struct ClusterState {
    nodes: HashMap<String, NodeInfo>,
    /// agent_id -> node_id
    placements: HashMap<String, String>,
    /// Recipes kept for migration
    blueprints: HashMap<String, (AgentBlueprint, Option<ResourceLimits>)>,
    /// Agents with no viable node, retried every monitor tick
    quarantined: HashMap<String, QuarantinedAgent>,
}

struct ClusterInner {
    config: ClusterConfig,
    local: LocalAgentRuntime,
    factory: Arc<dyn AgentFactory>,
    transport: Arc<dyn NodeTransport>,
    status: RwLock<RuntimeStatus>,
    state: RwLock<ClusterState>,
    metrics: RuntimeMetrics,
    shutdown: std::sync::Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Distributed agent runtime node.
///
/// A node is either the cluster coordinator or a worker, chosen at
/// construction; both wrap a [`LocalAgentRuntime`] for on-node execution.
///
/// ## Coordinator Responsibilities
///
/// - **Roster**: authoritative view of every node, fed by heartbeats
/// - **Placement**: assigns agents to nodes through the minimal-utilisation
///   policy and keeps the placement table current
/// - **Failure handling**: marks silent nodes offline and migrates their
///   agents from the last persisted snapshot, quarantining agents that no
///   node can admit
/// - **Routing**: forwards register/run/status/save/load/recover requests
///   to the owning node
///
/// ## Worker Responsibilities
///
/// - **Membership**: registers with the coordinator at start and
///   unregisters on graceful stop
/// - **Heartbeats**: periodic liveness, resource, and agent-list reports
/// - **Serving**: executes forwarded requests against its local runtime
///
/// ## Thread Safety
///
/// Cheap to clone; clones share state. Roster, placement, and quarantine
/// mutations all pass through a single write lock, so readers always see
/// consistent snapshots.
#[derive(Clone)]
pub struct ClusterAgentRuntime {
    inner: Arc<ClusterInner>,
}

impl ClusterAgentRuntime {
    #[must_use]
    pub fn new(
        config: ClusterConfig,
        local: LocalAgentRuntime,
        factory: Arc<dyn AgentFactory>,
        transport: Arc<dyn NodeTransport>,
    ) -> Self {
        let metrics = RuntimeMetrics::new(&local.metrics());
        Self {
            inner: Arc::new(ClusterInner {
                config,
                local,
                factory,
                transport,
                status: RwLock::new(RuntimeStatus::Initializing),
                state: RwLock::new(ClusterState::default()),
                metrics,
                shutdown: std::sync::Mutex::new(CancellationToken::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    #[must_use]
    pub fn is_coordinator(&self) -> bool {
        matches!(self.inner.config.role, NodeRole::Coordinator)
    }

    #[must_use]
    pub fn local(&self) -> &LocalAgentRuntime {
        &self.inner.local
    }

    pub async fn status(&self) -> RuntimeStatus {
        *self.inner.status.read().await
    }

    /// Snapshot of the roster. Meaningful on the coordinator.
    pub async fn nodes(&self) -> Vec<NodeInfo> {
        self.inner.state.read().await.nodes.values().cloned().collect()
    }

    /// Node currently hosting an agent, if placed. Coordinator-side view.
    pub async fn placement(&self, agent_id: &str) -> Option<String> {
        self.inner.state.read().await.placements.get(agent_id).cloned()
    }

    /// Handler to plug into a transport so peers can reach this node.
    #[must_use]
    pub fn rpc_handler(&self) -> Arc<dyn RpcHandler> {
        Arc::new(ClusterRpcHandler {
            runtime: self.clone(),
        })
    }

    fn coordinator_endpoint(&self) -> Option<&str> {
        match &self.inner.config.role {
            NodeRole::Coordinator => None,
            NodeRole::Worker {
                coordinator_endpoint,
            } => Some(coordinator_endpoint),
        }
    }

    async fn call(&self, endpoint: &str, request: NodeRequest) -> MeshResult<NodeResponse> {
        self.inner
            .transport
            .call(endpoint, RpcEnvelope::new(request))
            .await
    }

    fn own_node_info(&self) -> NodeInfo {
        let mut node = NodeInfo::new(
            &self.inner.config.node_id,
            &self.inner.config.node_name,
            &self.inner.config.endpoint,
            self.inner.config.capacity.clone(),
        );
        node.agent_ids = self.inner.local.agent_ids();
        node
    }

    /// Start the node.
    ///
    /// ## Startup Process
    ///
    /// 1. Starts the wrapped local runtime
    /// 2. Coordinator: seeds the roster with its own record.
    ///    Worker: registers with the coordinator over the transport
    /// 3. Spawns the role-specific loop (node monitor or heartbeat)
    /// 4. Transitions the node to `RUNNING`
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::InvalidState`] when the node has already been
    /// started. A worker that cannot reach its coordinator is marked
    /// `ERROR` and the RPC failure propagates.
    pub async fn start(&self) -> MeshResult<()> {
        {
            let status = self.inner.status.read().await;
            if *status != RuntimeStatus::Initializing {
                return Err(MeshError::InvalidState {
                    operation: "start".to_string(),
                    state: status.to_string(),
                });
            }
        }

        self.inner.local.start().await?;

        if self.is_coordinator() {
            let mut state = self.inner.state.write().await;
            state
                .nodes
                .insert(self.inner.config.node_id.clone(), self.own_node_info());
        } else if let Some(coordinator) = self.coordinator_endpoint() {
            let coordinator = coordinator.to_string();
            if let Err(e) = self
                .call(
                    &coordinator,
                    NodeRequest::RegisterNode {
                        node: self.own_node_info(),
                    },
                )
                .await
            {
                *self.inner.status.write().await = RuntimeStatus::Error;
                error!("Error registering with coordinator: {e}");
                return Err(e);
            }
        }

        let token = {
            let token = CancellationToken::new();
            if let Ok(mut slot) = self.inner.shutdown.lock() {
                *slot = token.clone();
            }
            token
        };
        {
            let mut tasks = self.inner.tasks.lock().await;
            if self.is_coordinator() {
                tasks.push(self.clone().spawn_node_monitor_loop(token.clone()));
            } else {
                tasks.push(self.clone().spawn_heartbeat_loop(token.clone()));
            }
        }

        *self.inner.status.write().await = RuntimeStatus::Running;
        info!(
            "Cluster runtime started (node_id={}, coordinator={})",
            self.inner.config.node_id,
            self.is_coordinator()
        );
        Ok(())
    }

    async fn cancel_loops(&self) {
        let token = self
            .inner
            .shutdown
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default();
        token.cancel();
        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }

    /// Graceful stop: cancel loops, unregister from the coordinator, and stop
    /// the local runtime. Idempotent once stopped.
    pub async fn stop(&self) -> MeshResult<()> {
        {
            let status = self.inner.status.read().await;
            if *status == RuntimeStatus::Stopped {
                return Ok(());
            }
        }
        *self.inner.status.write().await = RuntimeStatus::Stopping;

        self.cancel_loops().await;

        if let Some(coordinator) = self.coordinator_endpoint() {
            let coordinator = coordinator.to_string();
            if let Err(e) = self
                .call(
                    &coordinator,
                    NodeRequest::UnregisterNode {
                        node_id: self.inner.config.node_id.clone(),
                    },
                )
                .await
            {
                error!("Error unregistering from coordinator: {e}");
            }
        }

        self.inner.local.stop().await?;
        *self.inner.status.write().await = RuntimeStatus::Stopped;
        info!("Cluster runtime stopped (node_id={})", self.inner.config.node_id);
        Ok(())
    }

    /// Abrupt shutdown with no coordinator notification. Persists local agent
    /// state, then goes dark; peers only notice through missed heartbeats.
    /// Used to exercise failure detection and migration.
    pub async fn halt(&self) -> MeshResult<()> {
        self.cancel_loops().await;
        self.inner.local.stop().await?;
        *self.inner.status.write().await = RuntimeStatus::Stopped;
        warn!("Cluster runtime halted (node_id={})", self.inner.config.node_id);
        Ok(())
    }

    /// Pause request processing. Cluster coordination loops keep running.
    pub async fn pause(&self) -> MeshResult<()> {
        let mut status = self.inner.status.write().await;
        if *status != RuntimeStatus::Running {
            return Err(MeshError::InvalidState {
                operation: "pause".to_string(),
                state: status.to_string(),
            });
        }
        *status = RuntimeStatus::Paused;
        info!("Cluster runtime paused");
        Ok(())
    }

    pub async fn resume(&self) -> MeshResult<()> {
        let mut status = self.inner.status.write().await;
        if *status != RuntimeStatus::Paused {
            return Err(MeshError::InvalidState {
                operation: "resume".to_string(),
                state: status.to_string(),
            });
        }
        *status = RuntimeStatus::Running;
        info!("Cluster runtime resumed");
        Ok(())
    }

    async fn require_running(&self, operation: &str) -> MeshResult<()> {
        let status = self.inner.status.read().await;
        if *status != RuntimeStatus::Running {
            return Err(MeshError::InvalidState {
                operation: operation.to_string(),
                state: status.to_string(),
            });
        }
        Ok(())
    }

    /// Register an agent described by a blueprint somewhere in the cluster.
    pub async fn register_agent(
        &self,
        blueprint: AgentBlueprint,
        agent_id: Option<String>,
        limits: Option<ResourceLimits>,
    ) -> MeshResult<String> {
        self.require_running("register_agent").await?;
        let agent_id = agent_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        if self.is_coordinator() {
            self.place_agent(&agent_id, blueprint, limits, None).await?;
        } else if let Some(coordinator) = self.coordinator_endpoint() {
            let coordinator = coordinator.to_string();
            self.call(
                &coordinator,
                NodeRequest::PlaceAgent {
                    agent_id: agent_id.clone(),
                    blueprint,
                    limits,
                    memory: None,
                },
            )
            .await?;
        }

        info!("Agent {agent_id} registered with the cluster");
        Ok(agent_id)
    }

    /// Coordinator-side placement: pick a node, install the agent there, and
    /// record the placement.
    async fn place_agent(
        &self,
        agent_id: &str,
        blueprint: AgentBlueprint,
        limits: Option<ResourceLimits>,
        memory: Option<serde_json::Value>,
    ) -> MeshResult<String> {
        let target = {
            let state = self.inner.state.read().await;
            if state.placements.contains_key(agent_id) {
                return Err(MeshError::AlreadyExists {
                    agent_id: agent_id.to_string(),
                });
            }
            select_node(state.nodes.values(), limits.as_ref()).ok_or_else(|| {
                MeshError::Unavailable {
                    reason: format!("no node can admit agent {agent_id}"),
                }
            })?
        };

        if target == self.inner.config.node_id {
            self.install_local_agent(agent_id, &blueprint, limits.clone(), memory)
                .await?;
        } else {
            let endpoint = self.node_endpoint(&target).await?;
            self.call(
                &endpoint,
                NodeRequest::PlaceAgent {
                    agent_id: agent_id.to_string(),
                    blueprint: blueprint.clone(),
                    limits: limits.clone(),
                    memory,
                },
            )
            .await
            .map_err(|e| e.from_node(&target))?;
        }

        let mut state = self.inner.state.write().await;
        state
            .placements
            .insert(agent_id.to_string(), target.clone());
        state
            .blueprints
            .insert(agent_id.to_string(), (blueprint, limits));
        state.quarantined.remove(agent_id);
        if let Some(node) = state.nodes.get_mut(&target) {
            if !node.agent_ids.iter().any(|id| id == agent_id) {
                node.agent_ids.push(agent_id.to_string());
            }
        }
        Ok(target)
    }

    /// Build an agent from its blueprint and register it with the wrapped
    /// local runtime, restoring shipped memory first.
    async fn install_local_agent(
        &self,
        agent_id: &str,
        blueprint: &AgentBlueprint,
        limits: Option<ResourceLimits>,
        memory: Option<serde_json::Value>,
    ) -> MeshResult<()> {
        let agent = self.inner.factory.build(agent_id, blueprint)?;
        if let Some(memory) = memory {
            agent.restore_memory(memory)?;
        }
        self.inner
            .local
            .register_agent(agent, Some(agent_id.to_string()), limits)
            .await?;
        Ok(())
    }

    async fn node_endpoint(&self, node_id: &str) -> MeshResult<String> {
        let state = self.inner.state.read().await;
        state
            .nodes
            .get(node_id)
            .map(|node| node.endpoint.clone())
            .ok_or_else(|| MeshError::NodeNotFound {
                node_id: node_id.to_string(),
            })
    }

    async fn placement_of(&self, agent_id: &str) -> MeshResult<String> {
        let state = self.inner.state.read().await;
        state
            .placements
            .get(agent_id)
            .cloned()
            .ok_or_else(|| MeshError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })
    }

    /// Unregister an agent from wherever it lives.
    pub async fn unregister_agent(&self, agent_id: &str) -> MeshResult<()> {
        self.require_running("unregister_agent").await?;

        if self.is_coordinator() {
            let node_id = {
                let state = self.inner.state.read().await;
                if state.quarantined.contains_key(agent_id) {
                    None
                } else {
                    Some(state.placements.get(agent_id).cloned().ok_or_else(|| {
                        MeshError::AgentNotFound {
                            agent_id: agent_id.to_string(),
                        }
                    })?)
                }
            };

            if let Some(node_id) = node_id {
                if node_id == self.inner.config.node_id {
                    self.inner.local.unregister_agent(agent_id).await?;
                } else {
                    let endpoint = self.node_endpoint(&node_id).await?;
                    self.call(
                        &endpoint,
                        NodeRequest::UnplaceAgent {
                            agent_id: agent_id.to_string(),
                        },
                    )
                    .await
                    .map_err(|e| e.from_node(&node_id))?;
                }
            }

            let mut state = self.inner.state.write().await;
            let node_id = state.placements.remove(agent_id);
            state.blueprints.remove(agent_id);
            state.quarantined.remove(agent_id);
            if let Some(node_id) = node_id {
                if let Some(node) = state.nodes.get_mut(&node_id) {
                    node.agent_ids.retain(|id| id != agent_id);
                }
            }
            Ok(())
        } else if let Some(coordinator) = self.coordinator_endpoint() {
            let coordinator = coordinator.to_string();
            self.call(
                &coordinator,
                NodeRequest::UnplaceAgent {
                    agent_id: agent_id.to_string(),
                },
            )
            .await?;
            Ok(())
        } else {
            Err(MeshError::Internal {
                reason: "worker has no coordinator endpoint".to_string(),
            })
        }
    }

    /// Run an agent, forwarding across the cluster when it lives elsewhere.
    pub async fn run_agent(
        &self,
        agent_id: &str,
        query: &str,
        context: Option<HashMap<String, serde_json::Value>>,
    ) -> MeshResult<String> {
        self.require_running("run_agent").await?;

        if self.is_coordinator() {
            let node_id = self.placement_of(agent_id).await?;
            if node_id == self.inner.config.node_id {
                return self.inner.local.run_agent(agent_id, query, context).await;
            }
            let (endpoint, online) = {
                let state = self.inner.state.read().await;
                let node =
                    state
                        .nodes
                        .get(&node_id)
                        .ok_or_else(|| MeshError::NodeNotFound {
                            node_id: node_id.clone(),
                        })?;
                (node.endpoint.clone(), node.status == NodeStatus::Online)
            };
            if !online {
                return Err(MeshError::Unavailable {
                    reason: format!("agent {agent_id} is on offline node {node_id}"),
                });
            }
            match self
                .call(
                    &endpoint,
                    NodeRequest::RunAgent {
                        agent_id: agent_id.to_string(),
                        query: query.to_string(),
                        context: context.unwrap_or_default(),
                    },
                )
                .await
                .map_err(|e| e.from_node(&node_id))?
            {
                NodeResponse::Response { text } => Ok(text),
                other => Err(unexpected_response("RunAgent", &other)),
            }
        } else if self.inner.local.agent_ids().iter().any(|id| id == agent_id) {
            self.inner.local.run_agent(agent_id, query, context).await
        } else if let Some(coordinator) = self.coordinator_endpoint() {
            let coordinator = coordinator.to_string();
            match self
                .call(
                    &coordinator,
                    NodeRequest::RunAgent {
                        agent_id: agent_id.to_string(),
                        query: query.to_string(),
                        context: context.unwrap_or_default(),
                    },
                )
                .await?
            {
                NodeResponse::Response { text } => Ok(text),
                other => Err(unexpected_response("RunAgent", &other)),
            }
        } else {
            Err(MeshError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })
        }
    }

    /// Status of an agent anywhere in the cluster. Agents on offline nodes
    /// and quarantined agents report `UNKNOWN`.
    pub async fn get_agent_status(&self, agent_id: &str) -> MeshResult<AgentStatusReport> {
        if self.is_coordinator() {
            {
                let state = self.inner.state.read().await;
                if state.quarantined.contains_key(agent_id) {
                    return Ok(AgentStatusReport::Unknown);
                }
            }
            let node_id = self.placement_of(agent_id).await?;
            if node_id == self.inner.config.node_id {
                return Ok(self.inner.local.get_agent_status(agent_id).await?.into());
            }
            let (endpoint, online) = {
                let state = self.inner.state.read().await;
                let node =
                    state
                        .nodes
                        .get(&node_id)
                        .ok_or_else(|| MeshError::NodeNotFound {
                            node_id: node_id.clone(),
                        })?;
                (node.endpoint.clone(), node.status == NodeStatus::Online)
            };
            if !online {
                return Ok(AgentStatusReport::Unknown);
            }
            match self
                .call(
                    &endpoint,
                    NodeRequest::QueryStatus {
                        agent_id: agent_id.to_string(),
                    },
                )
                .await
                .map_err(|e| e.from_node(&node_id))?
            {
                NodeResponse::Status { status } => Ok(status),
                other => Err(unexpected_response("QueryStatus", &other)),
            }
        } else if self.inner.local.agent_ids().iter().any(|id| id == agent_id) {
            Ok(self.inner.local.get_agent_status(agent_id).await?.into())
        } else if let Some(coordinator) = self.coordinator_endpoint() {
            let coordinator = coordinator.to_string();
            match self
                .call(
                    &coordinator,
                    NodeRequest::QueryStatus {
                        agent_id: agent_id.to_string(),
                    },
                )
                .await?
            {
                NodeResponse::Status { status } => Ok(status),
                other => Err(unexpected_response("QueryStatus", &other)),
            }
        } else {
            Err(MeshError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })
        }
    }

    /// Persist an agent's state on its owning node.
    pub async fn save_agent_state(&self, agent_id: &str) -> MeshResult<()> {
        self.route_simple(agent_id, NodeRequest::SaveState {
            agent_id: agent_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    /// Restore an agent from its snapshot on its owning node.
    pub async fn load_agent_state(&self, agent_id: &str) -> MeshResult<bool> {
        match self
            .route_simple(agent_id, NodeRequest::LoadState {
                agent_id: agent_id.to_string(),
            })
            .await?
        {
            NodeResponse::Loaded { found } => Ok(found),
            other => Err(unexpected_response("LoadState", &other)),
        }
    }

    /// Recover an agent in the `ERROR` state on its owning node.
    pub async fn recover_agent(&self, agent_id: &str) -> MeshResult<bool> {
        match self
            .route_simple(agent_id, NodeRequest::Recover {
                agent_id: agent_id.to_string(),
            })
            .await?
        {
            NodeResponse::Recovered { success } => Ok(success),
            other => Err(unexpected_response("Recover", &other)),
        }
    }

    async fn route_simple(
        &self,
        agent_id: &str,
        request: NodeRequest,
    ) -> MeshResult<NodeResponse> {
        self.require_running("route").await?;

        if self.is_coordinator() {
            let node_id = self.placement_of(agent_id).await?;
            if node_id == self.inner.config.node_id {
                return self.handle_local(request).await;
            }
            let endpoint = self.node_endpoint(&node_id).await?;
            self.call(&endpoint, request)
                .await
                .map_err(|e| e.from_node(&node_id))
        } else if self.inner.local.agent_ids().iter().any(|id| id == agent_id) {
            self.handle_local(request).await
        } else if let Some(coordinator) = self.coordinator_endpoint() {
            let coordinator = coordinator.to_string();
            self.call(&coordinator, request).await
        } else {
            Err(MeshError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })
        }
    }

    /// Serve a request against the wrapped local runtime.
    async fn handle_local(&self, request: NodeRequest) -> MeshResult<NodeResponse> {
        match request {
            NodeRequest::PlaceAgent {
                agent_id,
                blueprint,
                limits,
                memory,
            } => {
                self.install_local_agent(&agent_id, &blueprint, limits, memory)
                    .await?;
                Ok(NodeResponse::Placed {
                    node_id: self.inner.config.node_id.clone(),
                })
            }
            NodeRequest::UnplaceAgent { agent_id } => {
                self.inner.local.unregister_agent(&agent_id).await?;
                Ok(NodeResponse::Ack)
            }
            NodeRequest::RunAgent {
                agent_id,
                query,
                context,
            } => {
                let text = self
                    .inner
                    .local
                    .run_agent(&agent_id, &query, Some(context))
                    .await?;
                Ok(NodeResponse::Response { text })
            }
            NodeRequest::QueryStatus { agent_id } => {
                let status = self.inner.local.get_agent_status(&agent_id).await?;
                Ok(NodeResponse::Status {
                    status: status.into(),
                })
            }
            NodeRequest::SaveState { agent_id } => {
                self.inner.local.save_agent_state(&agent_id).await?;
                Ok(NodeResponse::Ack)
            }
            NodeRequest::LoadState { agent_id } => {
                let found = self.inner.local.load_agent_state(&agent_id).await?;
                Ok(NodeResponse::Loaded { found })
            }
            NodeRequest::Recover { agent_id } => {
                let success = self.inner.local.recover_agent(&agent_id).await?;
                Ok(NodeResponse::Recovered { success })
            }
            other => Err(MeshError::Internal {
                reason: format!("request not servable locally: {other:?}"),
            }),
        }
    }

    /// Coordinator handling of cluster-membership requests.
    async fn handle_membership(&self, request: NodeRequest) -> MeshResult<NodeResponse> {
        match request {
            NodeRequest::RegisterNode { mut node } => {
                node.status = NodeStatus::Online;
                node.last_heartbeat = Utc::now();
                let node_id = node.node_id.clone();
                self.inner
                    .state
                    .write()
                    .await
                    .nodes
                    .insert(node_id.clone(), node);
                info!("Node {node_id} joined the cluster");
                Ok(NodeResponse::Ack)
            }
            NodeRequest::UnregisterNode { node_id } => {
                let orphaned: Vec<String> = {
                    let mut state = self.inner.state.write().await;
                    state.nodes.remove(&node_id);
                    state
                        .placements
                        .iter()
                        .filter(|(_, on)| **on == node_id)
                        .map(|(agent_id, _)| agent_id.clone())
                        .collect()
                };
                info!(
                    "Node {node_id} left the cluster ({} agents to re-place)",
                    orphaned.len()
                );
                for agent_id in orphaned {
                    if let Err(e) = self.migrate_agent(&agent_id, &node_id, "node_shutdown").await
                    {
                        error!("Error migrating agent {agent_id}: {e}");
                    }
                }
                Ok(NodeResponse::Ack)
            }
            NodeRequest::Heartbeat {
                node_id,
                timestamp,
                resources,
                agent_ids,
            } => {
                let mut state = self.inner.state.write().await;
                let Some(node) = state.nodes.get_mut(&node_id) else {
                    return Err(MeshError::NodeNotFound { node_id });
                };
                // Reordered heartbeats must never move last_heartbeat backwards
                if timestamp > node.last_heartbeat {
                    node.last_heartbeat = timestamp;
                    node.resources = resources;
                    node.agent_ids = agent_ids;
                    if node.status == NodeStatus::Offline {
                        info!("Node {node_id} came back online");
                        node.status = NodeStatus::Online;
                    }
                } else {
                    debug!("Ignoring stale heartbeat from node {node_id}");
                }
                Ok(NodeResponse::Ack)
            }
            other => Err(MeshError::Internal {
                reason: format!("not a membership request: {other:?}"),
            }),
        }
    }

    /// Move an agent off a dead node: restore its last snapshot, place it on
    /// a healthy node, and update the placement table.
    async fn migrate_agent(
        &self,
        agent_id: &str,
        from_node_id: &str,
        reason: &str,
    ) -> MeshResult<()> {
        let (blueprint, limits) = {
            let state = self.inner.state.read().await;
            state
                .blueprints
                .get(agent_id)
                .cloned()
                .ok_or_else(|| MeshError::Internal {
                    reason: format!("no blueprint recorded for agent {agent_id}"),
                })?
        };

        let memory = match self.inner.local.state_provider().load_state(agent_id).await {
            Ok(Some(state)) => Some(state.conversation_history),
            Ok(None) => {
                warn!("No persisted state for agent {agent_id}, migrating empty");
                None
            }
            Err(e) => {
                warn!("Unable to load persisted state for agent {agent_id}: {e}");
                None
            }
        };

        let target = {
            let state = self.inner.state.read().await;
            select_node(
                state
                    .nodes
                    .values()
                    .filter(|node| node.node_id != from_node_id),
                limits.as_ref(),
            )
        };

        let Some(target) = target else {
            let mut state = self.inner.state.write().await;
            state.placements.remove(agent_id);
            state.quarantined.insert(
                agent_id.to_string(),
                QuarantinedAgent { blueprint, limits },
            );
            warn!("No viable node for agent {agent_id}, quarantined for retry");
            return Err(MeshError::Unavailable {
                reason: format!("no viable node for agent {agent_id}"),
            });
        };

        if target == self.inner.config.node_id {
            self.install_local_agent(agent_id, &blueprint, limits.clone(), memory)
                .await?;
        } else {
            let endpoint = self.node_endpoint(&target).await?;
            self.call(
                &endpoint,
                NodeRequest::PlaceAgent {
                    agent_id: agent_id.to_string(),
                    blueprint: blueprint.clone(),
                    limits: limits.clone(),
                    memory,
                },
            )
            .await
            .map_err(|e| e.from_node(&target))?;
        }

        {
            let mut state = self.inner.state.write().await;
            state
                .placements
                .insert(agent_id.to_string(), target.clone());
            state.quarantined.remove(agent_id);
            if let Some(node) = state.nodes.get_mut(&target) {
                if !node.agent_ids.iter().any(|id| id == agent_id) {
                    node.agent_ids.push(agent_id.to_string());
                }
            }
            if let Some(node) = state.nodes.get_mut(from_node_id) {
                node.agent_ids.retain(|id| id != agent_id);
            }
        }

        self.inner.metrics.migrations_total.inc(1.0, &[("reason", reason)]);
        info!("Agent {agent_id} migrated from node {from_node_id} to node {target}");
        Ok(())
    }

    /// Retry placement of quarantined agents.
    async fn retry_quarantined(&self) {
        let pending: Vec<(String, AgentBlueprint, Option<ResourceLimits>)> = {
            let state = self.inner.state.read().await;
            state
                .quarantined
                .iter()
                .map(|(id, q)| (id.clone(), q.blueprint.clone(), q.limits.clone()))
                .collect()
        };
        for (agent_id, blueprint, limits) in pending {
            let memory = self
                .inner
                .local
                .state_provider()
                .load_state(&agent_id)
                .await
                .ok()
                .flatten()
                .map(|state| state.conversation_history);
            match self.place_agent(&agent_id, blueprint, limits, memory).await {
                Ok(node_id) => info!("Quarantined agent {agent_id} placed on node {node_id}"),
                Err(MeshError::Unavailable { .. }) => {}
                Err(e) => warn!("Error re-placing quarantined agent {agent_id}: {e}"),
            }
        }
    }

    fn spawn_heartbeat_loop(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.inner.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("Heartbeat loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(coordinator) = self.coordinator_endpoint() else {
                            break;
                        };
                        let coordinator = coordinator.to_string();
                        let heartbeat = NodeRequest::Heartbeat {
                            node_id: self.inner.config.node_id.clone(),
                            timestamp: Utc::now(),
                            resources: self.inner.config.capacity.clone(),
                            agent_ids: self.inner.local.agent_ids(),
                        };
                        match self.call(&coordinator, heartbeat).await {
                            Ok(_) => {}
                            Err(MeshError::NodeNotFound { .. }) => {
                                // Coordinator lost track of us; rejoin
                                warn!("Coordinator does not know this node, re-registering");
                                if let Err(e) = self
                                    .call(
                                        &coordinator,
                                        NodeRequest::RegisterNode {
                                            node: self.own_node_info(),
                                        },
                                    )
                                    .await
                                {
                                    error!("Error re-registering with coordinator: {e}");
                                }
                            }
                            Err(e) => warn!("Heartbeat delivery failed: {e}"),
                        }
                    }
                }
            }
        })
    }

    fn spawn_node_monitor_loop(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.inner.config.node_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("Node monitor loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        let timeout = chrono::Duration::from_std(
                            self.inner.config.heartbeat_timeout,
                        )
                        .unwrap_or_else(|_| chrono::Duration::seconds(30));

                        let failed: Vec<(String, Vec<String>)> = {
                            let mut state = self.inner.state.write().await;
                            let mut failed = Vec::new();
                            let own_id = self.inner.config.node_id.clone();
                            for node in state.nodes.values_mut() {
                                if node.node_id == own_id {
                                    continue;
                                }
                                // A heartbeat exactly at the timeout is still online
                                if node.status == NodeStatus::Online
                                    && now - node.last_heartbeat > timeout
                                {
                                    warn!(
                                        "Node {} missed heartbeat, marking offline",
                                        node.node_id
                                    );
                                    node.status = NodeStatus::Offline;
                                    failed.push(node.node_id.clone());
                                }
                            }
                            failed
                                .into_iter()
                                .map(|node_id| {
                                    let agents = state
                                        .placements
                                        .iter()
                                        .filter(|(_, on)| **on == node_id)
                                        .map(|(agent_id, _)| agent_id.clone())
                                        .collect();
                                    (node_id, agents)
                                })
                                .collect()
                        };

                        for (node_id, agent_ids) in failed {
                            info!(
                                "Handling failure of node {node_id} with {} agents",
                                agent_ids.len()
                            );
                            for agent_id in agent_ids {
                                if let Err(e) = self
                                    .migrate_agent(&agent_id, &node_id, "node_failure")
                                    .await
                                {
                                    error!("Error migrating agent {agent_id}: {e}");
                                }
                            }
                        }

                        self.retry_quarantined().await;
                    }
                }
            }
        })
    }
}

fn unexpected_response(operation: &str, response: &NodeResponse) -> MeshError {
    MeshError::Internal {
        reason: format!("unexpected response to {operation}: {response:?}"),
    }
}

struct ClusterRpcHandler {
    runtime: ClusterAgentRuntime,
}

#[async_trait]
impl RpcHandler for ClusterRpcHandler {
    async fn handle(&self, request: NodeRequest) -> MeshResult<NodeResponse> {
        // Workers serve every forwarded request against their local runtime.
        if !self.runtime.is_coordinator() {
            return self.runtime.handle_local(request).await;
        }

        match request {
            NodeRequest::RegisterNode { .. }
            | NodeRequest::UnregisterNode { .. }
            | NodeRequest::Heartbeat { .. } => self.runtime.handle_membership(request).await,
            // A placement request arriving at the coordinator goes through
            // the placement policy; at a worker it installs locally.
            NodeRequest::PlaceAgent {
                agent_id,
                blueprint,
                limits,
                memory,
            } => {
                let node_id = self
                    .runtime
                    .place_agent(&agent_id, blueprint, limits, memory)
                    .await?;
                Ok(NodeResponse::Placed { node_id })
            }
            NodeRequest::UnplaceAgent { agent_id } => {
                self.runtime.unregister_agent(&agent_id).await?;
                Ok(NodeResponse::Ack)
            }
            NodeRequest::RunAgent {
                agent_id,
                query,
                context,
            } => {
                let text = self
                    .runtime
                    .run_agent(&agent_id, &query, Some(context))
                    .await?;
                Ok(NodeResponse::Response { text })
            }
            NodeRequest::QueryStatus { agent_id } => {
                let status = self.runtime.get_agent_status(&agent_id).await?;
                Ok(NodeResponse::Status { status })
            }
            NodeRequest::SaveState { agent_id } => {
                self.runtime.save_agent_state(&agent_id).await?;
                Ok(NodeResponse::Ack)
            }
            NodeRequest::LoadState { agent_id } => {
                let found = self.runtime.load_agent_state(&agent_id).await?;
                Ok(NodeResponse::Loaded { found })
            }
            NodeRequest::Recover { agent_id } => {
                let success = self.runtime.recover_agent(&agent_id).await?;
                Ok(NodeResponse::Recovered { success })
            }
        }
    }
}
