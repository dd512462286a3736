//! Tracing spans with parent/child linkage and pluggable exporters.
//!
//! A child span copies its parent's `trace_id` and records the parent's
//! `span_id` as `parent_id`. Finished spans are buffered and handed to
//! exporters in batches; exporter failures are logged and counted, never
//! propagated into the traced operation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::observability::metrics::Counter;
use crate::utils::error::MeshResult;

/// Key under which a span context travels inside an agent run context.
pub const TRACE_CONTEXT_KEY: &str = "trace_context";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
    Agent,
    Tool,
    Handoff,
    Model,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Unset,
    Ok,
    Error,
}

/// Identifiers locating a span within a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parent_id: Option<Uuid>,
}

impl SpanContext {
    #[must_use]
    pub fn root() -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            span_id: Uuid::new_v4(),
            parent_id: None,
        }
    }

    #[must_use]
    pub fn child_of(parent: &SpanContext) -> Self {
        Self {
            trace_id: parent.trace_id,
            span_id: Uuid::new_v4(),
            parent_id: Some(parent.span_id),
        }
    }

    /// Embed into an opaque context map value.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "trace_id": self.trace_id.to_string(),
            "span_id": self.span_id.to_string(),
        })
    }

    /// Recover a context previously embedded with [`SpanContext::to_value`].
    #[must_use]
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let trace_id = value.get("trace_id")?.as_str()?.parse().ok()?;
        let span_id = value.get("span_id")?.as_str()?.parse().ok()?;
        Some(Self {
            trace_id,
            span_id,
            parent_id: None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub attributes: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// A single traced operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub name: String,
    pub context: SpanContext,
    pub kind: SpanKind,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub attributes: HashMap<String, serde_json::Value>,
    pub events: Vec<SpanEvent>,
    pub status: SpanStatus,
    pub status_message: String,
}

impl Span {
    fn new(name: &str, context: SpanContext, kind: SpanKind) -> Self {
        Self {
            name: name.to_string(),
            context,
            kind,
            start_time: Utc::now(),
            end_time: None,
            attributes: HashMap::new(),
            events: Vec::new(),
            status: SpanStatus::Unset,
            status_message: String::new(),
        }
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    pub fn add_event(&mut self, name: &str, attributes: HashMap<String, serde_json::Value>) {
        self.events.push(SpanEvent {
            name: name.to_string(),
            attributes,
            timestamp: Utc::now(),
        });
    }

    pub fn set_status(&mut self, status: SpanStatus, message: &str) {
        self.status = status;
        self.status_message = message.to_string();
    }

    /// Duration so far, or total duration once ended. Never negative.
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).max(chrono::Duration::zero())
    }
}

/// Receives batches of finished spans.
#[async_trait]
pub trait SpanExporter: Send + Sync {
    async fn export(&self, spans: &[Span]) -> anyhow::Result<()>;
    fn name(&self) -> &str;
}

/// Logs each finished span batch as JSON.
pub struct ConsoleSpanExporter;

#[async_trait]
impl SpanExporter for ConsoleSpanExporter {
    async fn export(&self, spans: &[Span]) -> anyhow::Result<()> {
        let payload = serde_json::to_string(spans)?;
        tracing::info!(target: "agent_mesh::traces", "{payload}");
        Ok(())
    }

    fn name(&self) -> &str {
        "console"
    }
}

/// Collects exported spans in memory. Used by tests.
#[derive(Default)]
pub struct MemorySpanExporter {
    pub spans: Mutex<Vec<Span>>,
}

impl MemorySpanExporter {
    #[must_use]
    pub fn finished(&self) -> Vec<Span> {
        self.spans.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SpanExporter for MemorySpanExporter {
    async fn export(&self, spans: &[Span]) -> anyhow::Result<()> {
        if let Ok(mut stored) = self.spans.lock() {
            stored.extend_from_slice(spans);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Span factory and finished-span buffer.
pub struct Tracer {
    finished: Mutex<Vec<Span>>,
    exporters: RwLock<Vec<Arc<dyn SpanExporter>>>,
    exporter_errors: Mutex<Option<Arc<Counter>>>,
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            finished: Mutex::new(Vec::new()),
            exporters: RwLock::new(Vec::new()),
            exporter_errors: Mutex::new(None),
        }
    }

    /// Wire the shared exporter-failure counter from a metrics registry.
    pub fn set_error_counter(&self, counter: Arc<Counter>) {
        if let Ok(mut slot) = self.exporter_errors.lock() {
            *slot = Some(counter);
        }
    }

    pub async fn add_exporter(&self, exporter: Arc<dyn SpanExporter>) {
        self.exporters.write().await.push(exporter);
    }

    /// Start a span. With a parent, the new span joins the parent's trace.
    #[must_use]
    pub fn start_span(&self, name: &str, parent: Option<&SpanContext>, kind: SpanKind) -> Span {
        let context = match parent {
            Some(parent) => SpanContext::child_of(parent),
            None => SpanContext::root(),
        };
        Span::new(name, context, kind)
    }

    /// End a span and move it into the finished buffer.
    pub fn end_span(&self, mut span: Span) {
        if span.end_time.is_none() {
            span.end_time = Some(Utc::now());
        }
        if let Ok(mut finished) = self.finished.lock() {
            finished.push(span);
        }
    }

    /// Run a future inside a span, ending it on every exit path. Failures set
    /// the span status to error and record an exception event.
    pub async fn in_span<T, Fut>(
        &self,
        name: &str,
        parent: Option<&SpanContext>,
        kind: SpanKind,
        fut: Fut,
    ) -> MeshResult<T>
    where
        Fut: Future<Output = MeshResult<T>>,
    {
        let mut span = self.start_span(name, parent, kind);
        let result = fut.await;
        match &result {
            Ok(_) => span.set_status(SpanStatus::Ok, ""),
            Err(e) => {
                span.set_status(SpanStatus::Error, &e.to_string());
                span.add_event(
                    "exception",
                    HashMap::from([(
                        "message".to_string(),
                        serde_json::Value::String(e.to_string()),
                    )]),
                );
            }
        }
        self.end_span(span);
        result
    }

    /// Hand all buffered finished spans to the exporters.
    pub async fn flush(&self) {
        let batch: Vec<Span> = match self.finished.lock() {
            Ok(mut finished) => finished.drain(..).collect(),
            Err(_) => return,
        };
        if batch.is_empty() {
            return;
        }
        let exporters = self.exporters.read().await.clone();
        for exporter in exporters {
            if let Err(e) = exporter.export(&batch).await {
                warn!("Span exporter {} failed: {e}", exporter.name());
                let counter = self.exporter_errors.lock().ok().and_then(|c| c.clone());
                if let Some(counter) = counter {
                    counter.inc(1.0, &[("exporter", exporter.name())]);
                }
            }
        }
    }

    /// Number of finished spans waiting for export.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.finished.lock().map_or(0, |f| f.len())
    }
}
