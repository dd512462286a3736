//! End-to-end tests for the local runtime lifecycle: the happy path,
//! error recovery, resource violations, and the idempotence laws.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use agent_mesh::agent::{Agent, EchoAgent, RunContext};
use agent_mesh::observability::tracer::MemorySpanExporter;
use agent_mesh::observability::Observability;
use agent_mesh::runtime::resource::{ResourceLimits, ResourceType, ResourceUsage};
use agent_mesh::runtime::state::InMemoryStateProvider;
use agent_mesh::runtime::{AgentStatus, LocalAgentRuntime, RuntimeConfig, RuntimeStatus};
use agent_mesh::{MeshError, MeshResult};

/// Fails its first run, succeeds afterwards.
struct FlakyAgent {
    calls: AtomicUsize,
}

impl FlakyAgent {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Agent for FlakyAgent {
    fn id(&self) -> &str {
        "flaky"
    }
    fn name(&self) -> &str {
        "flaky"
    }
    fn description(&self) -> &str {
        "fails once, then recovers"
    }

    async fn run(
        &self,
        query: &str,
        _context: &RunContext,
        _cancel: &CancellationToken,
    ) -> MeshResult<String> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(MeshError::Internal {
                reason: "transient failure".to_string(),
            });
        }
        Ok(format!("ok: {query}"))
    }

    fn memory_snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn restore_memory(&self, _blob: serde_json::Value) -> MeshResult<()> {
        Ok(())
    }
}

/// Stops its work as soon as the cancellation token fires.
struct CooperativeAgent;

#[async_trait]
impl Agent for CooperativeAgent {
    fn id(&self) -> &str {
        "cooperative"
    }
    fn name(&self) -> &str {
        "cooperative"
    }
    fn description(&self) -> &str {
        "winds down on cancellation"
    }

    async fn run(
        &self,
        query: &str,
        _context: &RunContext,
        cancel: &CancellationToken,
    ) -> MeshResult<String> {
        tokio::select! {
            () = cancel.cancelled() => Ok("stopped early".to_string()),
            () = tokio::time::sleep(Duration::from_secs(30)) => Ok(format!("done: {query}")),
        }
    }

    fn memory_snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn restore_memory(&self, _blob: serde_json::Value) -> MeshResult<()> {
        Ok(())
    }
}

/// Ignores the cancellation token entirely.
struct StubbornAgent;

#[async_trait]
impl Agent for StubbornAgent {
    fn id(&self) -> &str {
        "stubborn"
    }
    fn name(&self) -> &str {
        "stubborn"
    }
    fn description(&self) -> &str {
        "never checks its cancellation token"
    }

    async fn run(
        &self,
        query: &str,
        _context: &RunContext,
        _cancel: &CancellationToken,
    ) -> MeshResult<String> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(format!("late: {query}"))
    }

    fn memory_snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn restore_memory(&self, _blob: serde_json::Value) -> MeshResult<()> {
        Ok(())
    }
}

fn runtime_with_observability() -> (LocalAgentRuntime, Observability) {
    let observability = Observability::new();
    let runtime = LocalAgentRuntime::with_components(
        RuntimeConfig::default(),
        Arc::new(InMemoryStateProvider::new()),
        &observability,
    );
    (runtime, observability)
}

#[tokio::test]
async fn lifecycle_happy_path() {
    let (runtime, observability) = runtime_with_observability();
    let exporter = Arc::new(MemorySpanExporter::default());
    observability.tracer.add_exporter(exporter.clone()).await;

    runtime.start().await.unwrap();
    assert_eq!(runtime.status().await, RuntimeStatus::Running);

    let agent_id = runtime
        .register_agent(Arc::new(EchoAgent::new("a1", "echo-1")), Some("a1".into()), None)
        .await
        .unwrap();
    assert_eq!(agent_id, "a1");
    assert_eq!(
        runtime.get_agent_status("a1").await.unwrap(),
        AgentStatus::Ready
    );

    let response = runtime.run_agent("a1", "hello", None).await.unwrap();
    assert!(!response.is_empty());
    assert_eq!(
        runtime.get_agent_status("a1").await.unwrap(),
        AgentStatus::Ready
    );

    let requests = runtime.runtime_metrics().agent_requests_total.get(&[
        ("agent_id", "a1"),
        ("agent_name", "echo-1"),
        ("status", "success"),
    ]);
    assert!((requests - 1.0).abs() < f64::EPSILON);

    let latency = runtime
        .runtime_metrics()
        .agent_latency_seconds
        .get(&[("agent_id", "a1"), ("agent_name", "echo-1")]);
    assert_eq!(latency.count, 1);

    observability.tracer.flush().await;
    let spans = exporter.finished();
    let run_span = spans
        .iter()
        .find(|span| span.name == "agent.run")
        .expect("agent.run span was exported");
    assert!(run_span.duration() >= chrono::Duration::zero());
    assert!(run_span.end_time.is_some());

    let live = runtime.runtime_metrics().active_agents.get(&[]);
    assert!((live - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn recovery_from_error() {
    let (runtime, _observability) = runtime_with_observability();
    runtime.start().await.unwrap();

    runtime
        .register_agent(Arc::new(FlakyAgent::new()), Some("a1".into()), None)
        .await
        .unwrap();

    let err = runtime.run_agent("a1", "first", None).await.unwrap_err();
    assert!(matches!(err, MeshError::AgentExecution { .. }));
    assert_eq!(
        runtime.get_agent_status("a1").await.unwrap(),
        AgentStatus::Error
    );

    assert!(runtime.recover_agent("a1").await.unwrap());
    assert_eq!(
        runtime.get_agent_status("a1").await.unwrap(),
        AgentStatus::Ready
    );

    let response = runtime.run_agent("a1", "second", None).await.unwrap();
    assert_eq!(response, "ok: second");
}

#[tokio::test]
async fn resource_violation_is_structured_and_non_destructive() {
    let (runtime, _observability) = runtime_with_observability();
    runtime.start().await.unwrap();

    runtime
        .register_agent(
            Arc::new(EchoAgent::new("a1", "echo-1")),
            Some("a1".into()),
            Some(ResourceLimits {
                max_memory_mb: Some(100.0),
                ..ResourceLimits::default()
            }),
        )
        .await
        .unwrap();

    runtime
        .update_resource_usage(
            "a1",
            ResourceUsage {
                memory_mb: 50.0,
                ..ResourceUsage::default()
            },
        )
        .unwrap();

    let err = runtime
        .update_resource_usage(
            "a1",
            ResourceUsage {
                memory_mb: 150.0,
                ..ResourceUsage::default()
            },
        )
        .unwrap_err();
    match err {
        MeshError::ConstraintViolation {
            resource_type,
            current,
            limit,
            agent_id,
        } => {
            assert_eq!(resource_type, ResourceType::Memory);
            assert!((current - 150.0).abs() < f64::EPSILON);
            assert!((limit - 100.0).abs() < f64::EPSILON);
            assert_eq!(agent_id, "a1");
        }
        other => panic!("unexpected error: {other}"),
    }

    let usage = runtime.get_resource_usage("a1").await.unwrap();
    assert!((usage.memory_mb - 50.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn paused_runtime_rejects_runs_but_serves_status() {
    let (runtime, _observability) = runtime_with_observability();
    runtime.start().await.unwrap();
    runtime
        .register_agent(Arc::new(EchoAgent::new("a1", "echo-1")), Some("a1".into()), None)
        .await
        .unwrap();

    runtime.pause().await.unwrap();
    assert_eq!(runtime.status().await, RuntimeStatus::Paused);

    let err = runtime.run_agent("a1", "hello", None).await.unwrap_err();
    assert!(matches!(err, MeshError::InvalidState { .. }));
    assert_eq!(
        runtime.get_agent_status("a1").await.unwrap(),
        AgentStatus::Paused
    );

    runtime.resume().await.unwrap();
    assert_eq!(
        runtime.get_agent_status("a1").await.unwrap(),
        AgentStatus::Ready
    );
    runtime.run_agent("a1", "hello", None).await.unwrap();
}

#[tokio::test]
async fn register_unregister_register_ends_ready() {
    let (runtime, _observability) = runtime_with_observability();
    runtime.start().await.unwrap();

    runtime
        .register_agent(Arc::new(EchoAgent::new("a1", "echo-1")), Some("a1".into()), None)
        .await
        .unwrap();
    runtime.unregister_agent("a1").await.unwrap();
    assert!(matches!(
        runtime.get_agent_status("a1").await,
        Err(MeshError::AgentNotFound { .. })
    ));

    runtime
        .register_agent(Arc::new(EchoAgent::new("a1", "echo-1")), Some("a1".into()), None)
        .await
        .unwrap();
    assert_eq!(
        runtime.get_agent_status("a1").await.unwrap(),
        AgentStatus::Ready
    );
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let (runtime, _observability) = runtime_with_observability();
    runtime.start().await.unwrap();

    runtime
        .register_agent(Arc::new(EchoAgent::new("a1", "echo-1")), Some("a1".into()), None)
        .await
        .unwrap();
    let err = runtime
        .register_agent(Arc::new(EchoAgent::new("a1", "echo-1")), Some("a1".into()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::AlreadyExists { .. }));
}

#[tokio::test]
async fn stop_is_idempotent_and_terminal() {
    let (runtime, _observability) = runtime_with_observability();
    runtime.start().await.unwrap();
    runtime
        .register_agent(Arc::new(EchoAgent::new("a1", "echo-1")), Some("a1".into()), None)
        .await
        .unwrap();

    runtime.stop().await.unwrap();
    assert_eq!(runtime.status().await, RuntimeStatus::Stopped);
    assert_eq!(
        runtime.get_agent_status("a1").await.unwrap(),
        AgentStatus::Completed
    );

    runtime.stop().await.unwrap();
    assert_eq!(runtime.status().await, RuntimeStatus::Stopped);
}

#[tokio::test]
async fn start_requires_initializing_state() {
    let (runtime, _observability) = runtime_with_observability();
    runtime.start().await.unwrap();
    let err = runtime.start().await.unwrap_err();
    assert!(matches!(err, MeshError::InvalidState { .. }));
}

#[tokio::test]
async fn max_agents_bound_is_enforced() {
    let observability = Observability::new();
    let runtime = LocalAgentRuntime::with_components(
        RuntimeConfig {
            max_agents: 1,
            ..RuntimeConfig::default()
        },
        Arc::new(InMemoryStateProvider::new()),
        &observability,
    );
    runtime.start().await.unwrap();

    runtime
        .register_agent(Arc::new(EchoAgent::new("a1", "echo-1")), Some("a1".into()), None)
        .await
        .unwrap();
    let err = runtime
        .register_agent(Arc::new(EchoAgent::new("a2", "echo-2")), Some("a2".into()), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MeshError::ConstraintViolation {
            resource_type: ResourceType::Agents,
            ..
        }
    ));
}

#[tokio::test]
async fn timeout_with_clean_cancellation_keeps_agent_ready() {
    let (runtime, _observability) = runtime_with_observability();
    runtime.start().await.unwrap();
    runtime
        .register_agent(Arc::new(CooperativeAgent), Some("a1".into()), None)
        .await
        .unwrap();

    let err = runtime
        .run_agent_with_timeout("a1", "slow", None, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Timeout { .. }));

    // The agent honoured its cancellation token, so it is still runnable
    assert_eq!(
        runtime.get_agent_status("a1").await.unwrap(),
        AgentStatus::Ready
    );
}

#[tokio::test]
async fn timeout_ignored_marks_agent_error() {
    let (runtime, _observability) = runtime_with_observability();
    runtime.start().await.unwrap();
    runtime
        .register_agent(Arc::new(StubbornAgent), Some("a1".into()), None)
        .await
        .unwrap();

    let err = runtime
        .run_agent_with_timeout("a1", "slow", None, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Timeout { .. }));
    assert_eq!(
        runtime.get_agent_status("a1").await.unwrap(),
        AgentStatus::Error
    );
}

#[tokio::test]
async fn request_backpressure_fails_fast_and_marks_error() {
    let (runtime, _observability) = runtime_with_observability();
    runtime.start().await.unwrap();
    runtime
        .register_agent(
            Arc::new(EchoAgent::new("a1", "echo-1")),
            Some("a1".into()),
            Some(ResourceLimits {
                max_requests_per_minute: Some(1),
                ..ResourceLimits::default()
            }),
        )
        .await
        .unwrap();

    runtime.run_agent("a1", "first", None).await.unwrap();
    let err = runtime.run_agent("a1", "second", None).await.unwrap_err();
    assert!(matches!(err, MeshError::ConstraintViolation { .. }));
    assert_eq!(
        runtime.get_agent_status("a1").await.unwrap(),
        AgentStatus::Error
    );
}
