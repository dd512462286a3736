//! Observability substrate: structured logging, tracing spans, and metrics.
//!
//! The tracer and metric registry are explicit dependencies of the runtimes;
//! [`global_observability`] provides a shared process-wide instance for
//! callers that do not inject their own.

pub mod logging;
pub mod metrics;
pub mod tracer;

use std::sync::Arc;

use once_cell::sync::Lazy;

pub use metrics::{MetricsRegistry, RuntimeMetrics};
pub use tracer::Tracer;

/// Tracer plus metric registry handed to a runtime as one unit.
pub struct Observability {
    pub tracer: Arc<Tracer>,
    pub metrics: Arc<MetricsRegistry>,
}

impl Default for Observability {
    fn default() -> Self {
        Self::new()
    }
}

impl Observability {
    /// Fresh, isolated instruments. Preferred for tests.
    #[must_use]
    pub fn new() -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let tracer = Arc::new(Tracer::new());
        tracer.set_error_counter(metrics.exporter_errors());
        Self { tracer, metrics }
    }

    #[must_use]
    pub fn handles(&self) -> (Arc<Tracer>, Arc<MetricsRegistry>) {
        (Arc::clone(&self.tracer), Arc::clone(&self.metrics))
    }
}

static GLOBAL: Lazy<Observability> = Lazy::new(Observability::new);

/// The process-wide default instruments.
#[must_use]
pub fn global_observability() -> &'static Observability {
    &GLOBAL
}
