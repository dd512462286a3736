//! Cross-runtime handoff between agents.
//!
//! Internal agents exchange a handoff record through the target's memory and
//! run directly. Targets living outside the runtime are probed for a
//! recognised invocation shape, in order `run`, `invoke`, `execute`, `call`,
//! and the first supported shape is used.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::agent::{Agent, HandoffRecord, RunContext};
use crate::observability::metrics::RuntimeMetrics;
use crate::observability::tracer::{SpanKind, SpanStatus, Tracer};
use crate::utils::error::{MeshError, MeshResult};

/// Invocation shapes recognised on external targets, in probe order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationShape {
    Run,
    Invoke,
    Execute,
    Call,
}

const PROBE_ORDER: [InvocationShape; 4] = [
    InvocationShape::Run,
    InvocationShape::Invoke,
    InvocationShape::Execute,
    InvocationShape::Call,
];

/// A target outside the internal agent contract, entered at the process
/// boundary. Implementations declare which shapes they answer to.
#[async_trait]
pub trait ExternalCallable: Send + Sync {
    fn target_name(&self) -> &str;
    fn supported_shapes(&self) -> Vec<InvocationShape>;
    async fn invoke(&self, shape: InvocationShape, message: &str) -> MeshResult<String>;
}

/// Where a handoff lands.
pub enum HandoffTarget {
    Internal(Arc<dyn Agent>),
    External(Arc<dyn ExternalCallable>),
}

impl HandoffTarget {
    fn name(&self) -> String {
        match self {
            HandoffTarget::Internal(agent) => agent.name().to_string(),
            HandoffTarget::External(target) => target.target_name().to_string(),
        }
    }

    fn id(&self) -> String {
        match self {
            HandoffTarget::Internal(agent) => agent.id().to_string(),
            HandoffTarget::External(target) => target.target_name().to_string(),
        }
    }
}

/// Optional handoff parameters.
#[derive(Default)]
pub struct HandoffOptions {
    pub context: RunContext,
    pub metadata: HashMap<String, serde_json::Value>,
    pub timeout: Option<Duration>,
}

/// Executes handoffs and meters their outcomes.
pub struct HandoffBroker {
    tracer: Arc<Tracer>,
    metrics: Arc<RuntimeMetrics>,
}

impl HandoffBroker {
    #[must_use]
    pub fn new(tracer: Arc<Tracer>, metrics: Arc<RuntimeMetrics>) -> Self {
        Self { tracer, metrics }
    }

    /// Hand control from one agent to another and return the target's result.
    pub async fn handoff(
        &self,
        source: &dyn Agent,
        target: &HandoffTarget,
        message: &str,
        options: HandoffOptions,
    ) -> MeshResult<String> {
        let handoff_id = Uuid::new_v4();
        let target_id = target.id();
        info!(
            "Handoff {handoff_id} initiated: {} -> {}",
            source.name(),
            target.name()
        );

        let mut span = self.tracer.start_span("agent.handoff", None, SpanKind::Handoff);
        span.set_attribute("handoff_id", handoff_id.to_string());
        span.set_attribute("source_agent_id", source.id());
        span.set_attribute("target_agent_id", target_id.clone());

        let result = self
            .dispatch(source, target, message, handoff_id, options)
            .await;

        let status = match &result {
            Ok(_) => "success",
            Err(MeshError::Timeout { .. }) => "timeout",
            Err(MeshError::UnsupportedTarget { .. }) => "unsupported",
            Err(_) => "error",
        };
        self.metrics.handoffs_total.inc(
            1.0,
            &[
                ("source_agent_id", source.id()),
                ("target_agent_id", &target_id),
                ("status", status),
            ],
        );
        match &result {
            Ok(_) => span.set_status(SpanStatus::Ok, ""),
            Err(e) => span.set_status(SpanStatus::Error, &e.to_string()),
        }
        self.tracer.end_span(span);
        result
    }

    async fn dispatch(
        &self,
        source: &dyn Agent,
        target: &HandoffTarget,
        message: &str,
        handoff_id: Uuid,
        options: HandoffOptions,
    ) -> MeshResult<String> {
        match target {
            HandoffTarget::Internal(agent) => {
                let record = HandoffRecord {
                    handoff_id,
                    source_agent_id: source.id().to_string(),
                    source_agent_name: source.name().to_string(),
                    message: message.to_string(),
                    context: options.context.clone(),
                    metadata: options.metadata,
                    timestamp: Utc::now(),
                };
                agent.receive_handoff(record);
                let run_cancel = CancellationToken::new();
                with_timeout(
                    options.timeout,
                    agent.run(message, &options.context, &run_cancel),
                )
                .await
            }
            HandoffTarget::External(external) => {
                let supported = external.supported_shapes();
                let shape = PROBE_ORDER
                    .iter()
                    .find(|shape| supported.contains(shape))
                    .copied()
                    .ok_or_else(|| MeshError::UnsupportedTarget {
                        target: external.target_name().to_string(),
                    })?;
                with_timeout(options.timeout, external.invoke(shape, message)).await
            }
        }
    }
}

async fn with_timeout<F>(timeout: Option<Duration>, fut: F) -> MeshResult<String>
where
    F: std::future::Future<Output = MeshResult<String>>,
{
    match timeout {
        Some(deadline) => tokio::time::timeout(deadline, fut).await.map_err(|_| {
            MeshError::Timeout {
                operation: "handoff".to_string(),
                timeout_ms: deadline.as_millis() as u64,
            }
        })?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::EchoAgent;
    use crate::observability::Observability;

    fn broker() -> HandoffBroker {
        let observability = Observability::new();
        let metrics = Arc::new(RuntimeMetrics::new(&observability.metrics));
        HandoffBroker::new(observability.tracer, metrics)
    }

    #[tokio::test]
    async fn internal_handoff_reaches_target_memory() {
        let broker = broker();
        let source = EchoAgent::new("a1", "source");
        let target = Arc::new(EchoAgent::new("a2", "target"));

        let result = broker
            .handoff(
                &source,
                &HandoffTarget::Internal(target.clone()),
                "take over",
                HandoffOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result, "echo: take over");

        let memory = target.memory_snapshot();
        let entries = memory.as_array().unwrap();
        assert!(entries
            .iter()
            .any(|entry| entry["role"] == "system"
                && entry["content"].as_str().unwrap().contains("source")));
    }

    struct ShapedTarget {
        shapes: Vec<InvocationShape>,
    }

    #[async_trait]
    impl ExternalCallable for ShapedTarget {
        fn target_name(&self) -> &str {
            "shaped"
        }
        fn supported_shapes(&self) -> Vec<InvocationShape> {
            self.shapes.clone()
        }
        async fn invoke(&self, shape: InvocationShape, message: &str) -> MeshResult<String> {
            Ok(format!("{shape:?}: {message}"))
        }
    }

    #[tokio::test]
    async fn external_probe_prefers_run_over_later_shapes() {
        let broker = broker();
        let source = EchoAgent::new("a1", "source");
        let target = HandoffTarget::External(Arc::new(ShapedTarget {
            shapes: vec![InvocationShape::Call, InvocationShape::Run],
        }));

        let result = broker
            .handoff(&source, &target, "hi", HandoffOptions::default())
            .await
            .unwrap();
        assert_eq!(result, "Run: hi");
    }

    #[tokio::test]
    async fn shapeless_target_is_unsupported() {
        let broker = broker();
        let source = EchoAgent::new("a1", "source");
        let target = HandoffTarget::External(Arc::new(ShapedTarget { shapes: vec![] }));

        let err = broker
            .handoff(&source, &target, "hi", HandoffOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::UnsupportedTarget { .. }));
    }

    struct SlowTarget;

    #[async_trait]
    impl ExternalCallable for SlowTarget {
        fn target_name(&self) -> &str {
            "slow"
        }
        fn supported_shapes(&self) -> Vec<InvocationShape> {
            vec![InvocationShape::Invoke]
        }
        async fn invoke(&self, _shape: InvocationShape, message: &str) -> MeshResult<String> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(message.to_string())
        }
    }

    #[tokio::test]
    async fn handoff_honours_timeout() {
        let broker = broker();
        let source = EchoAgent::new("a1", "source");
        let target = HandoffTarget::External(Arc::new(SlowTarget));

        let err = broker
            .handoff(
                &source,
                &target,
                "hi",
                HandoffOptions {
                    timeout: Some(Duration::from_millis(20)),
                    ..HandoffOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Timeout { .. }));
    }
}
