//! Health monitoring for agents and runtime components.
//!
//! A monitor runs a registry of pluggable checks against an entity, caches
//! results for a check-interval floor, attempts recovery once per cached
//! result, and aggregates to an overall status where the worst check wins.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::runtime::resource::{ResourceLimits, ResourceUsage};

/// Graded health status. Ordering for aggregation:
/// `Healthy < Unknown < Degraded < Unhealthy < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
    Unknown,
}

impl HealthStatus {
    fn severity(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Unknown => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Unhealthy => 3,
            HealthStatus::Critical => 4,
        }
    }

    /// The worse of two statuses.
    #[must_use]
    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Degraded => write!(f, "DEGRADED"),
            HealthStatus::Unhealthy => write!(f, "UNHEALTHY"),
            HealthStatus::Critical => write!(f, "CRITICAL"),
            HealthStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Result of a single health check run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
    pub recovery_attempted: bool,
    pub recovery_successful: bool,
}

impl HealthCheckResult {
    #[must_use]
    pub fn new(status: HealthStatus, message: &str) -> Self {
        Self {
            status,
            message: message.to_string(),
            timestamp: Utc::now(),
            details: HashMap::new(),
            recovery_attempted: false,
            recovery_successful: false,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: HashMap<String, serde_json::Value>) -> Self {
        self.details = details;
        self
    }
}

/// Context handed to each check.
#[derive(Debug, Clone, Default)]
pub struct HealthContext {
    pub entity_id: String,
    pub usage: Option<ResourceUsage>,
    pub limits: Option<ResourceLimits>,
}

/// A single pluggable health check with an optional recovery action.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    async fn check_health(&self, context: &HealthContext) -> HealthCheckResult;

    /// Attempt to recover from an unhealthy state. Returns true on success.
    async fn attempt_recovery(&self, _context: &HealthContext) -> bool {
        false
    }
}

/// Checks resource utilisation ratios against warning/critical bands.
pub struct ResourceHealthCheck {
    warning_threshold: f64,
    critical_threshold: f64,
}

impl Default for ResourceHealthCheck {
    fn default() -> Self {
        Self::new(0.8, 0.95)
    }
}

impl ResourceHealthCheck {
    #[must_use]
    pub fn new(warning_threshold: f64, critical_threshold: f64) -> Self {
        Self {
            warning_threshold,
            critical_threshold,
        }
    }
}

#[async_trait]
impl HealthCheck for ResourceHealthCheck {
    fn name(&self) -> &str {
        "resource_health"
    }

    fn description(&self) -> &str {
        "Checks resource usage against defined limits"
    }

    async fn check_health(&self, context: &HealthContext) -> HealthCheckResult {
        let (Some(usage), Some(limits)) = (&context.usage, &context.limits) else {
            return HealthCheckResult::new(
                HealthStatus::Unknown,
                "Missing usage or limits information in context",
            );
        };

        let mut utilization: HashMap<String, f64> = HashMap::new();
        if let Some(limit) = limits.max_memory_mb {
            if limit > 0.0 {
                utilization.insert("memory".to_string(), usage.memory_mb / limit);
            }
        }
        if let Some(limit) = limits.max_cpu_percent {
            if limit > 0.0 {
                utilization.insert("cpu".to_string(), usage.cpu_percent / limit);
            }
        }
        if let Some(limit) = limits.max_requests_per_minute {
            if limit > 0 {
                utilization.insert(
                    "requests".to_string(),
                    f64::from(usage.requests_per_minute) / f64::from(limit),
                );
            }
        }
        if let Some(limit) = limits.max_tokens_per_minute {
            if limit > 0 {
                utilization.insert(
                    "tokens".to_string(),
                    usage.tokens_last_minute as f64 / limit as f64,
                );
            }
        }
        if let Some(limit) = limits.max_concurrent_requests {
            if limit > 0 {
                utilization.insert(
                    "concurrent_requests".to_string(),
                    f64::from(usage.concurrent_requests) / f64::from(limit),
                );
            }
        }

        if utilization.is_empty() {
            return HealthCheckResult::new(
                HealthStatus::Unknown,
                "No resource utilisation data available",
            );
        }

        let max_utilization = utilization.values().fold(0.0_f64, |acc, v| acc.max(*v));
        let (status, message) = if max_utilization >= self.critical_threshold {
            (
                HealthStatus::Critical,
                "Critical resource limit violations detected",
            )
        } else if max_utilization >= self.warning_threshold {
            (HealthStatus::Degraded, "Resource usage approaching limits")
        } else {
            (
                HealthStatus::Healthy,
                "Resource usage within acceptable limits",
            )
        };

        HealthCheckResult::new(status, message).with_details(HashMap::from([
            (
                "utilization".to_string(),
                serde_json::to_value(&utilization).unwrap_or_default(),
            ),
            (
                "warning_threshold".to_string(),
                serde_json::json!(self.warning_threshold),
            ),
            (
                "critical_threshold".to_string(),
                serde_json::json!(self.critical_threshold),
            ),
        ]))
    }
}

/// Tracks a rolling window of recent response times per agent and grades the
/// window mean against latency thresholds.
pub struct ResponseTimeHealthCheck {
    warning_threshold_ms: f64,
    critical_threshold_ms: f64,
    history_size: usize,
    response_times: DashMap<String, VecDeque<f64>>,
}

impl Default for ResponseTimeHealthCheck {
    fn default() -> Self {
        Self::new(2000.0, 5000.0, 10)
    }
}

impl ResponseTimeHealthCheck {
    #[must_use]
    pub fn new(warning_threshold_ms: f64, critical_threshold_ms: f64, history_size: usize) -> Self {
        Self {
            warning_threshold_ms,
            critical_threshold_ms,
            history_size,
            response_times: DashMap::new(),
        }
    }

    pub fn record_response_time(&self, agent_id: &str, response_time_ms: f64) {
        let mut times = self
            .response_times
            .entry(agent_id.to_string())
            .or_default();
        times.push_back(response_time_ms);
        while times.len() > self.history_size {
            times.pop_front();
        }
    }

    pub fn clear(&self, agent_id: &str) {
        self.response_times.remove(agent_id);
    }
}

#[async_trait]
impl HealthCheck for ResponseTimeHealthCheck {
    fn name(&self) -> &str {
        "response_time"
    }

    fn description(&self) -> &str {
        "Monitors agent response times against thresholds"
    }

    async fn check_health(&self, context: &HealthContext) -> HealthCheckResult {
        let Some(times) = self.response_times.get(&context.entity_id) else {
            return HealthCheckResult::new(
                HealthStatus::Unknown,
                &format!("No response time data available for {}", context.entity_id),
            );
        };
        if times.is_empty() {
            return HealthCheckResult::new(
                HealthStatus::Unknown,
                &format!("No response time data available for {}", context.entity_id),
            );
        }

        let avg = times.iter().sum::<f64>() / times.len() as f64;
        let max = times.iter().fold(0.0_f64, |acc, v| acc.max(*v));
        let details = HashMap::from([
            ("average_response_time_ms".to_string(), serde_json::json!(avg)),
            ("max_response_time_ms".to_string(), serde_json::json!(max)),
            (
                "warning_threshold_ms".to_string(),
                serde_json::json!(self.warning_threshold_ms),
            ),
            (
                "critical_threshold_ms".to_string(),
                serde_json::json!(self.critical_threshold_ms),
            ),
        ]);

        let result = if avg > self.critical_threshold_ms {
            HealthCheckResult::new(
                HealthStatus::Critical,
                &format!(
                    "Average response time {avg:.2}ms exceeds critical threshold {:.0}ms",
                    self.critical_threshold_ms
                ),
            )
        } else if avg > self.warning_threshold_ms {
            HealthCheckResult::new(
                HealthStatus::Degraded,
                &format!(
                    "Average response time {avg:.2}ms exceeds warning threshold {:.0}ms",
                    self.warning_threshold_ms
                ),
            )
        } else {
            HealthCheckResult::new(
                HealthStatus::Healthy,
                &format!("Average response time {avg:.2}ms within acceptable limits"),
            )
        };
        result.with_details(details)
    }
}

/// Aggregated report for one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: HashMap<String, HealthCheckResult>,
}

struct CachedResult {
    checked_at: Instant,
    result: HealthCheckResult,
}

/// Coordinates running registered checks and caching their results.
pub struct HealthMonitor {
    checks: RwLock<Vec<Arc<dyn HealthCheck>>>,
    check_interval: Duration,
    cache: DashMap<(String, String), CachedResult>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(check_interval: Duration) -> Self {
        Self {
            checks: RwLock::new(Vec::new()),
            check_interval,
            cache: DashMap::new(),
        }
    }

    pub fn register_check(&self, check: Arc<dyn HealthCheck>) {
        if let Ok(mut checks) = self.checks.write() {
            checks.retain(|c| c.name() != check.name());
            checks.push(check);
        }
    }

    pub fn unregister_check(&self, name: &str) {
        if let Ok(mut checks) = self.checks.write() {
            checks.retain(|c| c.name() != name);
        }
    }

    /// Run every registered check for an entity.
    ///
    /// Results cached within the check interval are returned as-is. A fresh
    /// result that is neither healthy nor unknown triggers one recovery
    /// attempt followed by a re-check.
    pub async fn check_health(
        &self,
        entity_id: &str,
        context: &HealthContext,
    ) -> HashMap<String, HealthCheckResult> {
        let checks: Vec<Arc<dyn HealthCheck>> = self
            .checks
            .read()
            .map(|c| c.clone())
            .unwrap_or_default();

        let mut results = HashMap::new();
        for check in checks {
            let cache_key = (entity_id.to_string(), check.name().to_string());
            if let Some(cached) = self.cache.get(&cache_key) {
                if cached.checked_at.elapsed() < self.check_interval {
                    results.insert(check.name().to_string(), cached.result.clone());
                    continue;
                }
            }

            let mut result = check.check_health(context).await;
            if !matches!(result.status, HealthStatus::Healthy | HealthStatus::Unknown)
                && !result.recovery_attempted
            {
                info!(
                    "Attempting recovery for {entity_id} from {} health check",
                    check.name()
                );
                result.recovery_attempted = true;
                result.recovery_successful = check.attempt_recovery(context).await;
                if result.recovery_successful {
                    let recheck = check.check_health(context).await;
                    result = HealthCheckResult {
                        recovery_attempted: true,
                        recovery_successful: true,
                        ..recheck
                    };
                    info!("Recovery successful for {entity_id}");
                } else {
                    warn!("Recovery failed for {entity_id}");
                }
            }

            self.cache.insert(
                cache_key,
                CachedResult {
                    checked_at: Instant::now(),
                    result: result.clone(),
                },
            );
            results.insert(check.name().to_string(), result);
        }
        results
    }

    /// Worst status across the cached results for an entity.
    #[must_use]
    pub fn overall_health(&self, entity_id: &str) -> HealthStatus {
        let mut seen = false;
        let mut worst = HealthStatus::Healthy;
        for entry in self.cache.iter() {
            if entry.key().0 == entity_id {
                seen = true;
                worst = worst.worst(entry.value().result.status);
            }
        }
        if seen {
            worst
        } else {
            HealthStatus::Unknown
        }
    }

    /// Detailed report: overall status plus per-check results.
    #[must_use]
    pub fn health_details(&self, entity_id: &str) -> HealthReport {
        let mut checks = HashMap::new();
        for entry in self.cache.iter() {
            if entry.key().0 == entity_id {
                checks.insert(entry.key().1.clone(), entry.value().result.clone());
            }
        }
        HealthReport {
            status: self.overall_health(entity_id),
            checks,
        }
    }

    /// Drop all cached data for an entity.
    pub fn clear_entity(&self, entity_id: &str) {
        self.cache.retain(|key, _| key.0 != entity_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_with(memory_mb: f64, limit_mb: f64) -> HealthContext {
        HealthContext {
            entity_id: "a1".to_string(),
            usage: Some(ResourceUsage {
                memory_mb,
                ..ResourceUsage::default()
            }),
            limits: Some(ResourceLimits {
                max_memory_mb: Some(limit_mb),
                ..ResourceLimits::default()
            }),
        }
    }

    #[tokio::test]
    async fn utilisation_exactly_at_warning_is_degraded() {
        let check = ResourceHealthCheck::default();
        let result = check.check_health(&context_with(80.0, 100.0)).await;
        assert_eq!(result.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn utilisation_exactly_at_critical_is_critical() {
        let check = ResourceHealthCheck::default();
        let result = check.check_health(&context_with(95.0, 100.0)).await;
        assert_eq!(result.status, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn utilisation_below_warning_is_healthy() {
        let check = ResourceHealthCheck::default();
        let result = check.check_health(&context_with(50.0, 100.0)).await;
        assert_eq!(result.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn missing_context_is_unknown() {
        let check = ResourceHealthCheck::default();
        let result = check
            .check_health(&HealthContext {
                entity_id: "a1".to_string(),
                usage: None,
                limits: None,
            })
            .await;
        assert_eq!(result.status, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn response_time_windows_grade_by_mean() {
        let check = ResponseTimeHealthCheck::default();
        let context = HealthContext {
            entity_id: "a1".to_string(),
            ..HealthContext::default()
        };

        assert_eq!(
            check.check_health(&context).await.status,
            HealthStatus::Unknown
        );

        check.record_response_time("a1", 100.0);
        assert_eq!(
            check.check_health(&context).await.status,
            HealthStatus::Healthy
        );

        for _ in 0..10 {
            check.record_response_time("a1", 3000.0);
        }
        assert_eq!(
            check.check_health(&context).await.status,
            HealthStatus::Degraded
        );

        for _ in 0..10 {
            check.record_response_time("a1", 9000.0);
        }
        assert_eq!(
            check.check_health(&context).await.status,
            HealthStatus::Critical
        );
    }

    #[tokio::test]
    async fn response_window_keeps_only_recent_history() {
        let check = ResponseTimeHealthCheck::new(2000.0, 5000.0, 3);
        for ms in [9000.0, 9000.0, 100.0, 100.0, 100.0] {
            check.record_response_time("a1", ms);
        }
        let context = HealthContext {
            entity_id: "a1".to_string(),
            ..HealthContext::default()
        };
        assert_eq!(
            check.check_health(&context).await.status,
            HealthStatus::Healthy
        );
    }

    #[test]
    fn aggregation_is_worst_wins() {
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Unknown),
            HealthStatus::Unknown
        );
        assert_eq!(
            HealthStatus::Unknown.worst(HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::Critical.worst(HealthStatus::Degraded),
            HealthStatus::Critical
        );
    }

    #[tokio::test]
    async fn results_are_cached_within_the_interval() {
        struct CountingCheck {
            runs: std::sync::atomic::AtomicUsize,
        }

        #[async_trait]
        impl HealthCheck for CountingCheck {
            fn name(&self) -> &str {
                "counting"
            }
            fn description(&self) -> &str {
                "counts invocations"
            }
            async fn check_health(&self, _context: &HealthContext) -> HealthCheckResult {
                self.runs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                HealthCheckResult::new(HealthStatus::Healthy, "ok")
            }
        }

        let monitor = HealthMonitor::new(Duration::from_secs(60));
        let check = Arc::new(CountingCheck {
            runs: std::sync::atomic::AtomicUsize::new(0),
        });
        monitor.register_check(check.clone());

        let context = HealthContext {
            entity_id: "a1".to_string(),
            ..HealthContext::default()
        };
        monitor.check_health("a1", &context).await;
        monitor.check_health("a1", &context).await;
        assert_eq!(check.runs.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovery_runs_once_and_rechecks() {
        struct RecoveringCheck {
            recovered: std::sync::atomic::AtomicBool,
        }

        #[async_trait]
        impl HealthCheck for RecoveringCheck {
            fn name(&self) -> &str {
                "recovering"
            }
            fn description(&self) -> &str {
                "degraded until recovered"
            }
            async fn check_health(&self, _context: &HealthContext) -> HealthCheckResult {
                if self.recovered.load(std::sync::atomic::Ordering::SeqCst) {
                    HealthCheckResult::new(HealthStatus::Healthy, "recovered")
                } else {
                    HealthCheckResult::new(HealthStatus::Unhealthy, "failing")
                }
            }
            async fn attempt_recovery(&self, _context: &HealthContext) -> bool {
                self.recovered
                    .store(true, std::sync::atomic::Ordering::SeqCst);
                true
            }
        }

        let monitor = HealthMonitor::new(Duration::from_secs(60));
        monitor.register_check(Arc::new(RecoveringCheck {
            recovered: std::sync::atomic::AtomicBool::new(false),
        }));

        let context = HealthContext {
            entity_id: "a1".to_string(),
            ..HealthContext::default()
        };
        let results = monitor.check_health("a1", &context).await;
        let result = &results["recovering"];
        assert_eq!(result.status, HealthStatus::Healthy);
        assert!(result.recovery_attempted);
        assert!(result.recovery_successful);
        assert_eq!(monitor.overall_health("a1"), HealthStatus::Healthy);
    }
}
