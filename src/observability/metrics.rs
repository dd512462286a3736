//! Metric registry: counters, gauges, and histograms keyed by
//! `(name, sorted label set)`, with snapshot export on a periodic flush.
//!
//! Counters are monotonic, gauges settable, histograms bucketed with sum and
//! count. A value exactly equal to a bucket boundary is counted in that
//! bucket. Exporter failures are logged and counted, never propagated.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default histogram bucket boundaries, in seconds.
pub const DEFAULT_BUCKETS: [f64; 8] = [0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// Sorted label pairs identifying one series within a metric.
pub type LabelSet = BTreeMap<String, String>;

fn label_set(declared: &[String], provided: &[(&str, &str)], metric: &str) -> LabelSet {
    for (name, _) in provided {
        if !declared.iter().any(|d| d.as_str() == *name) {
            warn!("Unexpected label {name} for metric {metric}");
        }
    }
    declared
        .iter()
        .map(|name| {
            let value = provided
                .iter()
                .find(|(n, _)| *n == name.as_str())
                .map_or(String::new(), |(_, v)| (*v).to_string());
            (name.clone(), value)
        })
        .collect()
}

/// Monotonic counter.
pub struct Counter {
    name: String,
    description: String,
    label_names: Vec<String>,
    values: DashMap<LabelSet, f64>,
}

impl Counter {
    fn new(name: &str, description: &str, label_names: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            label_names: label_names.iter().map(ToString::to_string).collect(),
            values: DashMap::new(),
        }
    }

    /// Increment the counter. Negative deltas are ignored with a warning.
    pub fn inc(&self, delta: f64, labels: &[(&str, &str)]) {
        if delta < 0.0 {
            warn!("Counter {} cannot be decremented, ignoring {delta}", self.name);
            return;
        }
        let key = label_set(&self.label_names, labels, &self.name);
        *self.values.entry(key).or_insert(0.0) += delta;
    }

    #[must_use]
    pub fn get(&self, labels: &[(&str, &str)]) -> f64 {
        let key = label_set(&self.label_names, labels, &self.name);
        self.values.get(&key).map_or(0.0, |v| *v)
    }

    fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot {
            name: self.name.clone(),
            description: self.description.clone(),
            metric_type: MetricType::Counter,
            values: self
                .values
                .iter()
                .map(|entry| MetricPoint {
                    labels: entry.key().clone(),
                    value: MetricValue::Scalar(*entry.value()),
                })
                .collect(),
        }
    }
}

/// Gauge that can move in both directions.
pub struct Gauge {
    name: String,
    description: String,
    label_names: Vec<String>,
    values: DashMap<LabelSet, f64>,
}

impl Gauge {
    fn new(name: &str, description: &str, label_names: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            label_names: label_names.iter().map(ToString::to_string).collect(),
            values: DashMap::new(),
        }
    }

    pub fn set(&self, value: f64, labels: &[(&str, &str)]) {
        let key = label_set(&self.label_names, labels, &self.name);
        self.values.insert(key, value);
    }

    pub fn inc(&self, delta: f64, labels: &[(&str, &str)]) {
        let key = label_set(&self.label_names, labels, &self.name);
        *self.values.entry(key).or_insert(0.0) += delta;
    }

    pub fn dec(&self, delta: f64, labels: &[(&str, &str)]) {
        self.inc(-delta, labels);
    }

    #[must_use]
    pub fn get(&self, labels: &[(&str, &str)]) -> f64 {
        let key = label_set(&self.label_names, labels, &self.name);
        self.values.get(&key).map_or(0.0, |v| *v)
    }

    fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot {
            name: self.name.clone(),
            description: self.description.clone(),
            metric_type: MetricType::Gauge,
            values: self
                .values
                .iter()
                .map(|entry| MetricPoint {
                    labels: entry.key().clone(),
                    value: MetricValue::Scalar(*entry.value()),
                })
                .collect(),
        }
    }
}

/// Per-series histogram data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistogramData {
    pub sum: f64,
    pub count: u64,
    /// Cumulative counts keyed by bucket upper bound.
    pub buckets: BTreeMap<String, u64>,
}

impl HistogramData {
    fn empty(bounds: &[f64]) -> Self {
        Self {
            sum: 0.0,
            count: 0,
            buckets: bounds.iter().map(|b| (b.to_string(), 0)).collect(),
        }
    }
}

/// Histogram with caller-provided bucket boundaries.
pub struct Histogram {
    name: String,
    description: String,
    label_names: Vec<String>,
    bounds: Vec<f64>,
    values: DashMap<LabelSet, HistogramData>,
}

impl Histogram {
    fn new(name: &str, description: &str, bounds: &[f64], label_names: &[&str]) -> Self {
        let mut sorted = bounds.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Self {
            name: name.to_string(),
            description: description.to_string(),
            label_names: label_names.iter().map(ToString::to_string).collect(),
            bounds: sorted,
            values: DashMap::new(),
        }
    }

    pub fn observe(&self, value: f64, labels: &[(&str, &str)]) {
        let key = label_set(&self.label_names, labels, &self.name);
        let mut entry = self
            .values
            .entry(key)
            .or_insert_with(|| HistogramData::empty(&self.bounds));
        entry.sum += value;
        entry.count += 1;
        for bound in &self.bounds {
            if value <= *bound {
                if let Some(count) = entry.buckets.get_mut(&bound.to_string()) {
                    *count += 1;
                }
            }
        }
    }

    #[must_use]
    pub fn get(&self, labels: &[(&str, &str)]) -> HistogramData {
        let key = label_set(&self.label_names, labels, &self.name);
        self.values
            .get(&key)
            .map_or_else(|| HistogramData::empty(&self.bounds), |v| v.clone())
    }

    fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot {
            name: self.name.clone(),
            description: self.description.clone(),
            metric_type: MetricType::Histogram,
            values: self
                .values
                .iter()
                .map(|entry| MetricPoint {
                    labels: entry.key().clone(),
                    value: MetricValue::Histogram(entry.value().clone()),
                })
                .collect(),
        }
    }
}

/// One exported series value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Histogram(HistogramData),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    pub labels: LabelSet,
    pub value: MetricValue,
}

/// Exported form of one metric with all of its series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub values: Vec<MetricPoint>,
}

/// Receives metric snapshots on each flush.
#[async_trait]
pub trait MetricsExporter: Send + Sync {
    async fn export(&self, snapshot: &[MetricSnapshot]) -> anyhow::Result<()>;
    fn name(&self) -> &str;
}

/// Logs each flush as a JSON document.
pub struct ConsoleMetricsExporter;

#[async_trait]
impl MetricsExporter for ConsoleMetricsExporter {
    async fn export(&self, snapshot: &[MetricSnapshot]) -> anyhow::Result<()> {
        let payload = serde_json::to_string(snapshot)?;
        tracing::info!(target: "agent_mesh::metrics", "{payload}");
        Ok(())
    }

    fn name(&self) -> &str {
        "console"
    }
}

/// Appends each flush as one JSON line to a file.
pub struct FileMetricsExporter {
    path: std::path::PathBuf,
}

impl FileMetricsExporter {
    #[must_use]
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl MetricsExporter for FileMetricsExporter {
    async fn export(&self, snapshot: &[MetricSnapshot]) -> anyhow::Result<()> {
        use std::io::Write;
        let line = serde_json::to_string(snapshot)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            writeln!(file, "{line}")?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// Keeps flushed snapshots in memory. Used by tests.
#[derive(Default)]
pub struct MemoryMetricsExporter {
    pub snapshots: std::sync::Mutex<Vec<Vec<MetricSnapshot>>>,
}

#[async_trait]
impl MetricsExporter for MemoryMetricsExporter {
    async fn export(&self, snapshot: &[MetricSnapshot]) -> anyhow::Result<()> {
        if let Ok(mut snapshots) = self.snapshots.lock() {
            snapshots.push(snapshot.to_vec());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Registry of all metrics in one runtime, with get-or-create accessors.
pub struct MetricsRegistry {
    counters: DashMap<String, Arc<Counter>>,
    gauges: DashMap<String, Arc<Gauge>>,
    histograms: DashMap<String, Arc<Histogram>>,
    exporters: RwLock<Vec<Arc<dyn MetricsExporter>>>,
    exporter_errors: Arc<Counter>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        let exporter_errors = Arc::new(Counter::new(
            "exporter_errors_total",
            "Failures while exporting metric or trace snapshots",
            &["exporter"],
        ));
        let registry = Self {
            counters: DashMap::new(),
            gauges: DashMap::new(),
            histograms: DashMap::new(),
            exporters: RwLock::new(Vec::new()),
            exporter_errors: Arc::clone(&exporter_errors),
        };
        registry
            .counters
            .insert("exporter_errors_total".to_string(), exporter_errors);
        registry
    }

    pub fn counter(&self, name: &str, description: &str, labels: &[&str]) -> Arc<Counter> {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Counter::new(name, description, labels)))
            .clone()
    }

    pub fn gauge(&self, name: &str, description: &str, labels: &[&str]) -> Arc<Gauge> {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Gauge::new(name, description, labels)))
            .clone()
    }

    pub fn histogram(
        &self,
        name: &str,
        description: &str,
        buckets: &[f64],
        labels: &[&str],
    ) -> Arc<Histogram> {
        self.histograms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::new(name, description, buckets, labels)))
            .clone()
    }

    /// Counter for exporter failures, shared with the tracer.
    #[must_use]
    pub fn exporter_errors(&self) -> Arc<Counter> {
        Arc::clone(&self.exporter_errors)
    }

    pub async fn add_exporter(&self, exporter: Arc<dyn MetricsExporter>) {
        self.exporters.write().await.push(exporter);
    }

    /// Consistent snapshot of every registered metric.
    #[must_use]
    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        let mut out: Vec<MetricSnapshot> = Vec::new();
        out.extend(self.counters.iter().map(|e| e.value().snapshot()));
        out.extend(self.gauges.iter().map(|e| e.value().snapshot()));
        out.extend(self.histograms.iter().map(|e| e.value().snapshot()));
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Hand the current snapshot to every exporter. Failures are logged and
    /// counted; they never interrupt the caller.
    pub async fn flush(&self) {
        let snapshot = self.snapshot();
        let exporters = self.exporters.read().await.clone();
        for exporter in exporters {
            if let Err(e) = exporter.export(&snapshot).await {
                warn!("Metrics exporter {} failed: {e}", exporter.name());
                self.exporter_errors.inc(1.0, &[("exporter", exporter.name())]);
            }
        }
    }

    /// Spawn the periodic flush loop. Cancellation triggers one final flush.
    pub fn spawn_flush_loop(
        self: Arc<Self>,
        interval: std::time::Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        registry.flush().await;
                        debug!("Metrics flush loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        registry.flush().await;
                    }
                }
            }
        })
    }
}

/// The built-in metric set every runtime populates.
pub struct RuntimeMetrics {
    pub agent_requests_total: Arc<Counter>,
    pub agent_latency_seconds: Arc<Histogram>,
    pub model_tokens_total: Arc<Counter>,
    pub tool_calls_total: Arc<Counter>,
    pub tool_latency_seconds: Arc<Histogram>,
    pub handoffs_total: Arc<Counter>,
    pub active_agents: Arc<Gauge>,
    pub migrations_total: Arc<Counter>,
}

impl RuntimeMetrics {
    #[must_use]
    pub fn new(registry: &MetricsRegistry) -> Self {
        Self {
            agent_requests_total: registry.counter(
                "agent_requests_total",
                "Outcomes of agent run requests",
                &["agent_id", "agent_name", "status"],
            ),
            agent_latency_seconds: registry.histogram(
                "agent_latency_seconds",
                "End-to-end agent run duration",
                &DEFAULT_BUCKETS,
                &["agent_id", "agent_name"],
            ),
            model_tokens_total: registry.counter(
                "model_tokens_total",
                "Token accounting per model",
                &["model_name", "provider", "type"],
            ),
            tool_calls_total: registry.counter(
                "tool_calls_total",
                "Tool invocations recorded by agents",
                &["tool_name", "agent_id", "status"],
            ),
            tool_latency_seconds: registry.histogram(
                "tool_latency_seconds",
                "Tool call duration",
                &DEFAULT_BUCKETS,
                &["tool_name", "agent_id"],
            ),
            handoffs_total: registry.counter(
                "handoffs_total",
                "Handoff outcomes between agents",
                &["source_agent_id", "target_agent_id", "status"],
            ),
            active_agents: registry.gauge("active_agents", "Live registered agents", &[]),
            migrations_total: registry.counter(
                "migrations_total",
                "Agent migrations between nodes",
                &["reason"],
            ),
        }
    }

    /// Record one tool invocation made on behalf of an agent.
    pub fn record_tool_call(
        &self,
        tool_name: &str,
        agent_id: &str,
        success: bool,
        duration: std::time::Duration,
    ) {
        let status = if success { "success" } else { "error" };
        self.tool_calls_total.inc(
            1.0,
            &[
                ("tool_name", tool_name),
                ("agent_id", agent_id),
                ("status", status),
            ],
        );
        self.tool_latency_seconds.observe(
            duration.as_secs_f64(),
            &[("tool_name", tool_name), ("agent_id", agent_id)],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_is_monotone_and_ignores_negative() {
        let registry = MetricsRegistry::new();
        let counter = registry.counter("requests", "test", &["status"]);
        counter.inc(1.0, &[("status", "ok")]);
        counter.inc(2.0, &[("status", "ok")]);
        counter.inc(-5.0, &[("status", "ok")]);
        assert!((counter.get(&[("status", "ok")]) - 3.0).abs() < f64::EPSILON);
        assert!((counter.get(&[("status", "err")]) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn gauge_moves_both_ways() {
        let registry = MetricsRegistry::new();
        let gauge = registry.gauge("live", "test", &[]);
        gauge.set(5.0, &[]);
        gauge.inc(2.0, &[]);
        gauge.dec(3.0, &[]);
        assert!((gauge.get(&[]) - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn histogram_boundary_value_lands_in_its_bucket() {
        let registry = MetricsRegistry::new();
        let histogram = registry.histogram("latency", "test", &[0.5, 1.0, 5.0], &[]);
        histogram.observe(1.0, &[]);
        let data = histogram.get(&[]);
        assert_eq!(data.count, 1);
        assert_eq!(data.buckets.get("0.5"), Some(&0));
        assert_eq!(data.buckets.get("1"), Some(&1));
        assert_eq!(data.buckets.get("5"), Some(&1));
    }

    #[test]
    fn histogram_count_matches_observations() {
        let registry = MetricsRegistry::new();
        let histogram = registry.histogram("latency", "test", &DEFAULT_BUCKETS, &[]);
        for value in [0.005, 0.2, 7.0, 100.0] {
            histogram.observe(value, &[]);
        }
        let data = histogram.get(&[]);
        assert_eq!(data.count, 4);
        assert!((data.sum - 107.205).abs() < 1e-9);
        // 100.0 is above every bound and only shows up in sum/count
        assert_eq!(data.buckets.get("60"), Some(&3));
    }

    #[test]
    fn series_are_keyed_by_sorted_labels() {
        let registry = MetricsRegistry::new();
        let counter = registry.counter("calls", "test", &["a", "b"]);
        counter.inc(1.0, &[("b", "2"), ("a", "1")]);
        counter.inc(1.0, &[("a", "1"), ("b", "2")]);
        assert!((counter.get(&[("a", "1"), ("b", "2")]) - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn flush_feeds_exporters_and_counts_failures() {
        struct FailingExporter;

        #[async_trait]
        impl MetricsExporter for FailingExporter {
            async fn export(&self, _snapshot: &[MetricSnapshot]) -> anyhow::Result<()> {
                anyhow::bail!("sink unavailable")
            }
            fn name(&self) -> &str {
                "failing"
            }
        }

        let registry = Arc::new(MetricsRegistry::new());
        let memory = Arc::new(MemoryMetricsExporter::default());
        registry.add_exporter(memory.clone()).await;
        registry.add_exporter(Arc::new(FailingExporter)).await;

        registry.counter("x", "test", &[]).inc(1.0, &[]);
        registry.flush().await;

        assert_eq!(memory.snapshots.lock().unwrap().len(), 1);
        assert!(
            (registry.exporter_errors().get(&[("exporter", "failing")]) - 1.0).abs()
                < f64::EPSILON
        );
    }
}
