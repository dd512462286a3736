//! # Local Agent Runtime
//!
//! Manages agents running in this process: registration, the lifecycle state
//! machine, run dispatch, resource and health wiring, state persistence, and
//! the background health-check and state-save loops.
//!
//! Lifecycle transitions are the only legal status mutations:
//!
//! ```text
//! INITIALIZING --register--> READY
//! READY --run start--> RUNNING
//! RUNNING --run ok--> READY
//! RUNNING --run fail--> ERROR
//! READY/ERROR --pause--> PAUSED
//! PAUSED --resume--> READY
//! ERROR --recover ok--> READY
//! *  --stop--> COMPLETED  (terminal)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::{Agent, RunContext};
use crate::observability::metrics::{MetricsRegistry, RuntimeMetrics};
use crate::observability::tracer::{SpanContext, SpanKind, SpanStatus, Tracer, TRACE_CONTEXT_KEY};
use crate::observability::Observability;
use crate::runtime::config::RuntimeConfig;
use crate::runtime::health::{
    HealthCheck, HealthContext, HealthMonitor, HealthReport, HealthStatus, ResourceHealthCheck,
    ResponseTimeHealthCheck,
};
use crate::runtime::resource::{ResourceLimits, ResourceTracker, ResourceType, ResourceUsage};
use crate::runtime::state::{AgentState, AgentStatus, InMemoryStateProvider, StateProvider};
use crate::utils::error::{MeshError, MeshResult};

/// Window a timed-out run gets to observe its cancellation token and return
/// before it is abandoned.
const RUN_CANCEL_GRACE: Duration = Duration::from_millis(250);

/// Operational status of a runtime instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuntimeStatus {
    Initializing,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeStatus::Initializing => write!(f, "INITIALIZING"),
            RuntimeStatus::Running => write!(f, "RUNNING"),
            RuntimeStatus::Paused => write!(f, "PAUSED"),
            RuntimeStatus::Stopping => write!(f, "STOPPING"),
            RuntimeStatus::Stopped => write!(f, "STOPPED"),
            RuntimeStatus::Error => write!(f, "ERROR"),
        }
    }
}

struct AgentRecord {
    agent: Arc<dyn Agent>,
    status: AgentStatus,
    last_error: Option<String>,
    metadata: HashMap<String, serde_json::Value>,
    /// Cancelled to abort in-flight runs when the agent is unregistered
    cancel: CancellationToken,
}

struct Inner {
    config: RuntimeConfig,
    status: RwLock<RuntimeStatus>,
    agents: DashMap<String, AgentRecord>,
    state_provider: Arc<dyn StateProvider>,
    tracker: ResourceTracker,
    health: HealthMonitor,
    response_times: Arc<ResponseTimeHealthCheck>,
    tracer: Arc<Tracer>,
    metrics: Arc<MetricsRegistry>,
    runtime_metrics: RuntimeMetrics,
    shutdown: std::sync::Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Local implementation of the agent runtime.
///
/// Manages agents running in this process and wires them into the resource,
/// health, persistence, and observability subsystems.
///
/// ## Responsibilities
///
/// - **Registry**: owns the agent records and their lifecycle status
/// - **Dispatch**: runs queries against agents with resource accounting,
///   tracing spans, and the built-in metric set
/// - **Background loops**: periodic health checks, state snapshots, and
///   metric flushes
/// - **Recovery**: restores agents from persisted state after failures,
///   automatically from the health loop or explicitly via `recover_agent`
///
/// ## Thread Safety
///
/// Every public operation is safe to call concurrently. The runtime is cheap
/// to clone; all clones share the same state through an internal `Arc`.
/// Per-agent mutations are serialised through the registry entry.
///
/// ## Error Handling
///
/// Failures inside the background loops are logged and swallowed so the
/// loops stay alive. Failures in public operations surface as [`MeshError`]
/// and never poison the runtime itself.
#[derive(Clone)]
pub struct LocalAgentRuntime {
    inner: Arc<Inner>,
}

impl LocalAgentRuntime {
    /// Runtime with an in-memory state provider and fresh instruments.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_components(
            config,
            Arc::new(InMemoryStateProvider::new()),
            &Observability::new(),
        )
    }

    /// Runtime with an explicit state provider and instruments.
    #[must_use]
    pub fn with_components(
        config: RuntimeConfig,
        state_provider: Arc<dyn StateProvider>,
        observability: &Observability,
    ) -> Self {
        let (tracer, metrics) = observability.handles();
        let runtime_metrics = RuntimeMetrics::new(&metrics);

        let health = HealthMonitor::new(config.health_check_interval);
        let response_times = Arc::new(ResponseTimeHealthCheck::new(
            config.response_warning_ms,
            config.response_critical_ms,
            config.response_history,
        ));
        health.register_check(Arc::new(ResourceHealthCheck::new(
            config.resource_warning_threshold,
            config.resource_critical_threshold,
        )));
        let response_check: Arc<dyn HealthCheck> = Arc::clone(&response_times) as Arc<dyn HealthCheck>;
        health.register_check(response_check);

        Self {
            inner: Arc::new(Inner {
                config,
                status: RwLock::new(RuntimeStatus::Initializing),
                agents: DashMap::new(),
                state_provider,
                tracker: ResourceTracker::new(),
                health,
                response_times,
                tracer,
                metrics,
                runtime_metrics,
                shutdown: std::sync::Mutex::new(CancellationToken::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub async fn status(&self) -> RuntimeStatus {
        *self.inner.status.read().await
    }

    #[must_use]
    pub fn tracer(&self) -> Arc<Tracer> {
        Arc::clone(&self.inner.tracer)
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.inner.metrics)
    }

    #[must_use]
    pub fn runtime_metrics(&self) -> &RuntimeMetrics {
        &self.inner.runtime_metrics
    }

    #[must_use]
    pub fn state_provider(&self) -> Arc<dyn StateProvider> {
        Arc::clone(&self.inner.state_provider)
    }

    /// Registered agent ids.
    #[must_use]
    pub fn agent_ids(&self) -> Vec<String> {
        self.inner.agents.iter().map(|e| e.key().clone()).collect()
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.inner
            .shutdown
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    fn reset_shutdown_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut slot) = self.inner.shutdown.lock() {
            *slot = token.clone();
        }
        token
    }

    /// Start the runtime.
    ///
    /// ## Startup Process
    ///
    /// 1. Verifies the runtime is still `INITIALIZING`
    /// 2. Initialises the state provider and lists any saved agent states
    /// 3. Spawns the health-check, state-save, and metrics-flush loops
    /// 4. Transitions the runtime to `RUNNING`
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::InvalidState`] when called on a runtime that has
    /// already been started. A state-provider failure marks the runtime
    /// `ERROR` and propagates.
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

        if let Err(e) = self.inner.state_provider.initialize().await {
            *self.inner.status.write().await = RuntimeStatus::Error;
            error!("Error starting runtime: {e}");
            return Err(e);
        }

        match self.inner.state_provider.list_states().await {
            Ok(agent_ids) => {
                for agent_id in agent_ids {
                    info!("Found saved state for agent {agent_id}");
                }
            }
            Err(e) => warn!("Unable to enumerate saved agent states: {e}"),
        }

        let token = self.reset_shutdown_token();
        self.spawn_background_loops(&token).await;

        *self.inner.status.write().await = RuntimeStatus::Running;
        info!("Local agent runtime started");
        Ok(())
    }

    async fn spawn_background_loops(&self, token: &CancellationToken) {
        let mut tasks = self.inner.tasks.lock().await;
        tasks.push(self.clone().spawn_health_loop(token.clone()));
        tasks.push(self.clone().spawn_state_save_loop(token.clone()));
        tasks.push(
            Arc::clone(&self.inner.metrics)
                .spawn_flush_loop(self.inner.config.metrics_flush_interval, token.clone()),
        );
    }

    async fn cancel_background_loops(&self) {
        self.shutdown_token().cancel();
        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Background task ended abnormally: {e}");
                }
            }
        }
    }

    /// Stop the runtime.
    ///
    /// ## Shutdown Process
    ///
    /// 1. Cancels the background loops and waits for them to finish; the
    ///    state-save loop performs a final snapshot pass on the way out
    /// 2. Persists each agent's state, marks it `COMPLETED`, and releases
    ///    its resource tracker entry
    /// 3. Flushes buffered spans and metrics
    ///
    /// Idempotent: calling `stop` on a stopped runtime is a no-op. Errors
    /// while persisting individual agents are logged and do not abort the
    /// shutdown.
    pub async fn stop(&self) -> MeshResult<()> {
        {
            let status = self.inner.status.read().await;
            if *status == RuntimeStatus::Stopped {
                return Ok(());
            }
        }
        *self.inner.status.write().await = RuntimeStatus::Stopping;

        self.cancel_background_loops().await;

        for agent_id in self.agent_ids() {
            if let Err(e) = self.save_agent_state(&agent_id).await {
                error!("Error saving state for agent {agent_id}: {e}");
            }
            if let Some(mut record) = self.inner.agents.get_mut(&agent_id) {
                record.status = AgentStatus::Completed;
                record.cancel.cancel();
            }
            let _ = self.inner.tracker.unregister_agent(&agent_id);
        }
        self.inner.runtime_metrics.active_agents.set(0.0, &[]);

        self.inner.tracer.flush().await;
        self.inner.metrics.flush().await;

        *self.inner.status.write().await = RuntimeStatus::Stopped;
        info!("Local agent runtime stopped");
        Ok(())
    }

    /// Pause the runtime: suspend the background loops and pause every agent.
    /// Status queries keep working; runs are rejected until resume.
    pub async fn pause(&self) -> MeshResult<()> {
        {
            let status = self.inner.status.read().await;
            if *status != RuntimeStatus::Running {
                return Err(MeshError::InvalidState {
                    operation: "pause".to_string(),
                    state: status.to_string(),
                });
            }
        }
        *self.inner.status.write().await = RuntimeStatus::Paused;

        self.cancel_background_loops().await;

        for agent_id in self.agent_ids() {
            if let Err(e) = self.pause_agent(&agent_id).await {
                error!("Error pausing agent {agent_id}: {e}");
            }
        }
        info!("Local agent runtime paused");
        Ok(())
    }

    /// Resume a paused runtime: restart the background loops and resume
    /// previously paused agents.
    pub async fn resume(&self) -> MeshResult<()> {
        {
            let status = self.inner.status.read().await;
            if *status != RuntimeStatus::Paused {
                return Err(MeshError::InvalidState {
                    operation: "resume".to_string(),
                    state: status.to_string(),
                });
            }
        }

        let token = self.reset_shutdown_token();
        self.spawn_background_loops(&token).await;

        for agent_id in self.agent_ids() {
            if let Err(e) = self.resume_agent(&agent_id).await {
                error!("Error resuming agent {agent_id}: {e}");
            }
        }

        *self.inner.status.write().await = RuntimeStatus::Running;
        info!("Local agent runtime resumed");
        Ok(())
    }

    async fn require_started(&self, operation: &str) -> MeshResult<()> {
        let status = self.inner.status.read().await;
        match *status {
            RuntimeStatus::Initializing | RuntimeStatus::Stopped | RuntimeStatus::Error => {
                Err(MeshError::InvalidState {
                    operation: operation.to_string(),
                    state: status.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Register an agent. Without an explicit id a UUID is generated.
    pub async fn register_agent(
        &self,
        agent: Arc<dyn Agent>,
        agent_id: Option<String>,
        resource_limits: Option<ResourceLimits>,
    ) -> MeshResult<String> {
        self.require_started("register_agent").await?;

        let agent_id = agent_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        if self.inner.agents.len() >= self.inner.config.max_agents {
            return Err(MeshError::ConstraintViolation {
                resource_type: ResourceType::Agents,
                current: self.inner.agents.len() as f64 + 1.0,
                limit: self.inner.config.max_agents as f64,
                agent_id: agent_id.clone(),
            });
        }

        match self.inner.agents.entry(agent_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(MeshError::AlreadyExists { agent_id });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let metadata = HashMap::from([
                    (
                        "name".to_string(),
                        serde_json::Value::String(agent.name().to_string()),
                    ),
                    (
                        "description".to_string(),
                        serde_json::Value::String(agent.description().to_string()),
                    ),
                ]);
                slot.insert(AgentRecord {
                    agent,
                    status: AgentStatus::Initializing,
                    last_error: None,
                    metadata,
                    cancel: CancellationToken::new(),
                });
            }
        }

        let limits = resource_limits.unwrap_or_else(|| self.inner.config.default_limits.clone());
        self.inner.tracker.register_agent(&agent_id, Some(limits));

        if let Some(mut record) = self.inner.agents.get_mut(&agent_id) {
            record.status = AgentStatus::Ready;
        }
        self.inner.runtime_metrics.active_agents.inc(1.0, &[]);

        info!("Agent {agent_id} registered");
        Ok(agent_id)
    }

    /// Unregister an agent: cancel in-flight work, release tracker and health
    /// entries, remove from the registry.
    pub async fn unregister_agent(&self, agent_id: &str) -> MeshResult<()> {
        self.require_started("unregister_agent").await?;

        let (_, record) =
            self.inner
                .agents
                .remove(agent_id)
                .ok_or_else(|| MeshError::AgentNotFound {
                    agent_id: agent_id.to_string(),
                })?;
        record.cancel.cancel();

        let _ = self.inner.tracker.unregister_agent(agent_id);
        self.inner.health.clear_entity(agent_id);
        self.inner.response_times.clear(agent_id);
        self.inner.runtime_metrics.active_agents.dec(1.0, &[]);

        info!("Agent {agent_id} unregistered");
        Ok(())
    }

    pub async fn get_agent_status(&self, agent_id: &str) -> MeshResult<AgentStatus> {
        self.inner
            .agents
            .get(agent_id)
            .map(|record| record.status)
            .ok_or_else(|| MeshError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })
    }

    /// Run an agent with a query and return its response.
    ///
    /// Uses the runtime's configured default deadline, when one is set.
    /// See [`LocalAgentRuntime::run_agent_with_timeout`] for the full
    /// request flow and error behaviour.
    pub async fn run_agent(
        &self,
        agent_id: &str,
        query: &str,
        context: Option<RunContext>,
    ) -> MeshResult<String> {
        self.run_agent_with_timeout(agent_id, query, context, self.inner.config.run_timeout)
            .await
    }

    /// Run an agent under an explicit deadline.
    ///
    /// ## Request Flow
    ///
    /// 1. Requires the runtime to be `RUNNING` and the agent `READY` or
    ///    `RUNNING`; marks the agent `RUNNING`
    /// 2. Opens a request record in the resource tracker, failing fast on
    ///    rate or concurrency limits
    /// 3. Begins an `agent.run` span, linked to any span context found in
    ///    the caller's context map
    /// 4. Invokes the agent's `run` with a per-run cancellation token
    /// 5. On success: records the response time, estimated token usage, and
    ///    request metrics; returns the agent to `READY`
    /// 6. On failure: marks the agent `ERROR` and propagates the cause
    ///
    /// ## Timeout Behaviour
    ///
    /// When the deadline expires the run's cancellation token fires and the
    /// agent gets a short grace window to wind down. An agent that returns
    /// cleanly within the window goes back to `READY`; one that ignores the
    /// signal is abandoned and marked `ERROR`. The caller receives
    /// [`MeshError::Timeout`] either way.
    ///
    /// # Errors
    ///
    /// [`MeshError::InvalidState`] for a stopped/paused runtime or an agent
    /// outside `READY`/`RUNNING`, [`MeshError::AgentNotFound`] for unknown
    /// ids, [`MeshError::ConstraintViolation`] on tracker rejection,
    /// [`MeshError::Timeout`] on deadline expiry, and
    /// [`MeshError::AgentExecution`] when the agent's own `run` fails.
    pub async fn run_agent_with_timeout(
        &self,
        agent_id: &str,
        query: &str,
        context: Option<RunContext>,
        timeout: Option<Duration>,
    ) -> MeshResult<String> {
        {
            let status = self.inner.status.read().await;
            if *status != RuntimeStatus::Running {
                return Err(MeshError::InvalidState {
                    operation: "run_agent".to_string(),
                    state: status.to_string(),
                });
            }
        }

        let (agent, agent_name, cancel) = {
            let mut record =
                self.inner
                    .agents
                    .get_mut(agent_id)
                    .ok_or_else(|| MeshError::AgentNotFound {
                        agent_id: agent_id.to_string(),
                    })?;
            if !matches!(record.status, AgentStatus::Ready | AgentStatus::Running) {
                return Err(MeshError::InvalidState {
                    operation: "run_agent".to_string(),
                    state: record.status.to_string(),
                });
            }
            record.status = AgentStatus::Running;
            (
                Arc::clone(&record.agent),
                record.agent.name().to_string(),
                record.cancel.clone(),
            )
        };

        if let Err(violation) = self.inner.tracker.record_request(agent_id) {
            self.mark_agent_error(agent_id, &violation.to_string());
            self.inner.runtime_metrics.agent_requests_total.inc(
                1.0,
                &[
                    ("agent_id", agent_id),
                    ("agent_name", agent_name.as_str()),
                    ("status", "rejected"),
                ],
            );
            return Err(violation);
        }

        let mut context = context.unwrap_or_default();
        let parent = context
            .get(TRACE_CONTEXT_KEY)
            .and_then(SpanContext::from_value);
        let mut span =
            self.inner
                .tracer
                .start_span("agent.run", parent.as_ref(), SpanKind::Agent);
        span.set_attribute("agent_id", agent_id);
        span.set_attribute("agent_name", agent_name.clone());
        context.insert(TRACE_CONTEXT_KEY.to_string(), span.context.to_value());

        let started = Instant::now();
        let run_cancel = CancellationToken::new();
        let run = agent.run(query, &context, &run_cancel);
        tokio::pin!(run);
        let outcome = match timeout {
            Some(deadline) => tokio::select! {
                result = &mut run => RunOutcome::Finished(result),
                () = cancel.cancelled() => RunOutcome::Cancelled,
                () = tokio::time::sleep(deadline) => {
                    // Deadline hit: signal the agent, then give it a bounded
                    // window to observe the token and return.
                    run_cancel.cancel();
                    let clean = matches!(
                        tokio::time::timeout(RUN_CANCEL_GRACE, &mut run).await,
                        Ok(Ok(_))
                    );
                    RunOutcome::TimedOut { deadline, clean }
                }
            },
            None => tokio::select! {
                result = &mut run => RunOutcome::Finished(result),
                () = cancel.cancelled() => RunOutcome::Cancelled,
            },
        };
        let elapsed = started.elapsed();
        self.inner.tracker.complete_request(agent_id);

        match outcome {
            RunOutcome::Finished(Ok(response)) => {
                self.inner
                    .response_times
                    .record_response_time(agent_id, elapsed.as_secs_f64() * 1000.0);

                // Rough token estimate; real accounting belongs to the agent.
                let estimated_tokens = (response.len() / 4) as u64;
                self.inner.tracker.record_tokens(agent_id, estimated_tokens);
                self.inner.runtime_metrics.model_tokens_total.inc(
                    estimated_tokens as f64,
                    &[
                        ("model_name", "estimated"),
                        ("provider", "runtime"),
                        ("type", "output"),
                    ],
                );

                if let Some(mut record) = self.inner.agents.get_mut(agent_id) {
                    record.status = AgentStatus::Ready;
                    record.last_error = None;
                }
                self.inner.runtime_metrics.agent_requests_total.inc(
                    1.0,
                    &[
                        ("agent_id", agent_id),
                        ("agent_name", agent_name.as_str()),
                        ("status", "success"),
                    ],
                );
                self.inner.runtime_metrics.agent_latency_seconds.observe(
                    elapsed.as_secs_f64(),
                    &[("agent_id", agent_id), ("agent_name", agent_name.as_str())],
                );

                span.set_status(SpanStatus::Ok, "");
                self.inner.tracer.end_span(span);
                Ok(response)
            }
            RunOutcome::Finished(Err(e)) => {
                let cause = e.to_string();
                error!("Error running agent {agent_id}: {cause}");
                self.mark_agent_error(agent_id, &cause);
                self.inner.runtime_metrics.agent_requests_total.inc(
                    1.0,
                    &[
                        ("agent_id", agent_id),
                        ("agent_name", agent_name.as_str()),
                        ("status", "error"),
                    ],
                );
                span.set_status(SpanStatus::Error, &cause);
                span.add_event(
                    "exception",
                    HashMap::from([(
                        "message".to_string(),
                        serde_json::Value::String(cause.clone()),
                    )]),
                );
                self.inner.tracer.end_span(span);
                Err(MeshError::AgentExecution {
                    agent_id: agent_id.to_string(),
                    cause,
                })
            }
            RunOutcome::TimedOut { deadline, clean } => {
                let cause = format!("run timed out after {}ms", deadline.as_millis());
                if clean {
                    // The agent honoured its cancellation token, so it stays
                    // runnable; only the caller sees the timeout.
                    warn!("Agent {agent_id}: {cause}, cancelled cleanly");
                    if let Some(mut record) = self.inner.agents.get_mut(agent_id) {
                        record.status = AgentStatus::Ready;
                    }
                } else {
                    warn!("Agent {agent_id}: {cause}");
                    self.mark_agent_error(agent_id, &cause);
                }
                self.inner.runtime_metrics.agent_requests_total.inc(
                    1.0,
                    &[
                        ("agent_id", agent_id),
                        ("agent_name", agent_name.as_str()),
                        ("status", "timeout"),
                    ],
                );
                span.set_status(SpanStatus::Error, &cause);
                self.inner.tracer.end_span(span);
                Err(MeshError::Timeout {
                    operation: "run_agent".to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                })
            }
            RunOutcome::Cancelled => {
                let cause = "run cancelled: agent unregistered".to_string();
                span.set_status(SpanStatus::Error, &cause);
                self.inner.tracer.end_span(span);
                Err(MeshError::AgentExecution {
                    agent_id: agent_id.to_string(),
                    cause,
                })
            }
        }
    }

    fn mark_agent_error(&self, agent_id: &str, cause: &str) {
        if let Some(mut record) = self.inner.agents.get_mut(agent_id) {
            record.status = AgentStatus::Error;
            record.last_error = Some(cause.to_string());
        }
    }

    /// Snapshot an agent and hand it to the state provider.
    pub async fn save_agent_state(&self, agent_id: &str) -> MeshResult<()> {
        let state = {
            let record =
                self.inner
                    .agents
                    .get(agent_id)
                    .ok_or_else(|| MeshError::AgentNotFound {
                        agent_id: agent_id.to_string(),
                    })?;
            AgentState {
                agent_id: agent_id.to_string(),
                agent_type: record.agent.type_name().to_string(),
                status: record.status,
                timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
                conversation_history: record.agent.memory_snapshot(),
                metadata: serde_json::to_value(&record.metadata)?,
                config: serde_json::Value::Null,
                custom_data: serde_json::Value::Null,
            }
        };

        self.inner.state_provider.save_state(state).await?;
        debug!("Saved state for agent {agent_id}");
        Ok(())
    }

    /// Restore an agent from its most recent snapshot. Returns whether a
    /// snapshot was found.
    pub async fn load_agent_state(&self, agent_id: &str) -> MeshResult<bool> {
        let agent = {
            let record =
                self.inner
                    .agents
                    .get(agent_id)
                    .ok_or_else(|| MeshError::AgentNotFound {
                        agent_id: agent_id.to_string(),
                    })?;
            Arc::clone(&record.agent)
        };

        let Some(state) = self.inner.state_provider.load_state(agent_id).await? else {
            warn!("No saved state found for agent {agent_id}");
            return Ok(false);
        };

        if !state.conversation_history.is_null() {
            if let Err(e) = agent.restore_memory(state.conversation_history.clone()) {
                error!("Error restoring memory for agent {agent_id}: {e}");
            }
        }
        if let Some(mut record) = self.inner.agents.get_mut(agent_id) {
            record.status = state.status;
        }
        info!("Loaded state for agent {agent_id}");
        Ok(true)
    }

    pub async fn get_resource_usage(&self, agent_id: &str) -> MeshResult<ResourceUsage> {
        if !self.inner.agents.contains_key(agent_id) {
            return Err(MeshError::AgentNotFound {
                agent_id: agent_id.to_string(),
            });
        }
        self.inner.tracker.get_usage(agent_id)
    }

    pub fn update_resource_usage(&self, agent_id: &str, usage: ResourceUsage) -> MeshResult<()> {
        self.inner.tracker.update_usage(agent_id, usage)
    }

    pub fn set_resource_limits(&self, agent_id: &str, limits: ResourceLimits) {
        self.inner.tracker.set_limits(agent_id, limits);
    }

    /// Run every registered health check for an agent and return the
    /// aggregated report.
    pub async fn check_health(&self, agent_id: &str) -> MeshResult<HealthReport> {
        if !self.inner.agents.contains_key(agent_id) {
            return Err(MeshError::AgentNotFound {
                agent_id: agent_id.to_string(),
            });
        }

        let context = HealthContext {
            entity_id: agent_id.to_string(),
            usage: self.inner.tracker.get_usage(agent_id).ok(),
            limits: self.inner.tracker.get_limits(agent_id).ok(),
        };
        self.inner.health.check_health(agent_id, &context).await;
        Ok(self.inner.health.health_details(agent_id))
    }

    /// Recover an agent from the `ERROR` state by reloading its last
    /// snapshot. Agents not in `ERROR` need no recovery and report success.
    pub async fn recover_agent(&self, agent_id: &str) -> MeshResult<bool> {
        {
            let record =
                self.inner
                    .agents
                    .get(agent_id)
                    .ok_or_else(|| MeshError::AgentNotFound {
                        agent_id: agent_id.to_string(),
                    })?;
            if record.status != AgentStatus::Error {
                debug!("Agent {agent_id} is not in error state, no recovery needed");
                return Ok(true);
            }
        }

        match self.load_agent_state(agent_id).await {
            Ok(_) => {
                if let Some(mut record) = self.inner.agents.get_mut(agent_id) {
                    record.status = AgentStatus::Ready;
                    record.last_error = None;
                }
                info!("Agent {agent_id} recovered");
                Ok(true)
            }
            Err(e) => {
                error!("Error recovering agent {agent_id}: {e}");
                Ok(false)
            }
        }
    }

    /// Mark a registered agent runnable again after an explicit stop.
    pub async fn start_agent(&self, agent_id: &str) -> MeshResult<()> {
        let mut record =
            self.inner
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| MeshError::AgentNotFound {
                    agent_id: agent_id.to_string(),
                })?;
        if record.status == AgentStatus::Running {
            debug!("Agent {agent_id} is already running");
            return Ok(());
        }
        record.status = AgentStatus::Ready;
        info!("Agent {agent_id} started");
        Ok(())
    }

    /// Stop one agent: cancel in-flight work, persist state, mark terminal.
    pub async fn stop_agent(&self, agent_id: &str) -> MeshResult<()> {
        {
            let record =
                self.inner
                    .agents
                    .get(agent_id)
                    .ok_or_else(|| MeshError::AgentNotFound {
                        agent_id: agent_id.to_string(),
                    })?;
            record.cancel.cancel();
        }
        if let Err(e) = self.save_agent_state(agent_id).await {
            error!("Error saving state for agent {agent_id}: {e}");
        }
        if let Some(mut record) = self.inner.agents.get_mut(agent_id) {
            record.status = AgentStatus::Completed;
        }
        info!("Agent {agent_id} stopped");
        Ok(())
    }

    /// Pause one agent, persisting its state first.
    pub async fn pause_agent(&self, agent_id: &str) -> MeshResult<()> {
        {
            let record =
                self.inner
                    .agents
                    .get(agent_id)
                    .ok_or_else(|| MeshError::AgentNotFound {
                        agent_id: agent_id.to_string(),
                    })?;
            if record.status == AgentStatus::Running {
                warn!("Agent {agent_id} has an in-flight run and cannot be fully paused");
            }
        }
        if let Err(e) = self.save_agent_state(agent_id).await {
            error!("Error saving state for agent {agent_id}: {e}");
        }
        if let Some(mut record) = self.inner.agents.get_mut(agent_id) {
            record.status = AgentStatus::Paused;
        }
        info!("Agent {agent_id} paused");
        Ok(())
    }

    /// Resume one paused agent. A no-op for agents in any other state.
    pub async fn resume_agent(&self, agent_id: &str) -> MeshResult<()> {
        let mut record =
            self.inner
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| MeshError::AgentNotFound {
                    agent_id: agent_id.to_string(),
                })?;
        if record.status != AgentStatus::Paused {
            warn!("Agent {agent_id} is not paused, cannot resume");
            return Ok(());
        }
        record.status = AgentStatus::Ready;
        info!("Agent {agent_id} resumed");
        Ok(())
    }

    fn spawn_health_loop(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.inner.config.health_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("Health check loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if *self.inner.status.read().await != RuntimeStatus::Running {
                            continue;
                        }
                        for agent_id in self.agent_ids() {
                            match self.check_health(&agent_id).await {
                                Ok(report) => {
                                    if matches!(
                                        report.status,
                                        HealthStatus::Critical | HealthStatus::Unhealthy
                                    ) {
                                        warn!(
                                            "Agent {agent_id} health status: {}",
                                            report.status
                                        );
                                        let in_error = self
                                            .get_agent_status(&agent_id)
                                            .await
                                            .map(|s| s == AgentStatus::Error)
                                            .unwrap_or(false);
                                        if in_error {
                                            info!("Attempting auto-recovery for agent {agent_id}");
                                            if let Err(e) = self.recover_agent(&agent_id).await {
                                                error!(
                                                    "Error recovering agent {agent_id}: {e}"
                                                );
                                            }
                                        }
                                    }
                                }
                                Err(e) => {
                                    error!("Error checking health for agent {agent_id}: {e}");
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    fn spawn_state_save_loop(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.inner.config.state_save_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        // Final snapshot pass before exit
                        for agent_id in self.agent_ids() {
                            if let Err(e) = self.save_agent_state(&agent_id).await {
                                error!("Error saving state for agent {agent_id}: {e}");
                            }
                        }
                        debug!("State save loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if *self.inner.status.read().await != RuntimeStatus::Running {
                            continue;
                        }
                        for agent_id in self.agent_ids() {
                            if let Err(e) = self.save_agent_state(&agent_id).await {
                                error!("Error saving state for agent {agent_id}: {e}");
                            }
                        }
                    }
                }
            }
        })
    }
}

enum RunOutcome {
    Finished(MeshResult<String>),
    TimedOut { deadline: Duration, clean: bool },
    Cancelled,
}
