//! Runtime-level configuration.

use std::time::Duration;

use crate::runtime::resource::ResourceLimits;
use crate::utils::config::MeshConfig;

/// Settings for one runtime instance.
///
/// Derivable from a [`MeshConfig`] or built directly; tests typically shrink
/// the intervals.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Upper bound on concurrent registrations
    pub max_agents: usize,
    /// Fallback limits when registration passes none
    pub default_limits: ResourceLimits,
    /// Minimum time between health runs per entity, also the health loop cadence
    pub health_check_interval: Duration,
    /// Background snapshot cadence
    pub state_save_interval: Duration,
    /// Metric exporter cadence
    pub metrics_flush_interval: Duration,
    /// Default deadline applied to agent runs; `None` waits indefinitely
    pub run_timeout: Option<Duration>,
    /// Resource health bands
    pub resource_warning_threshold: f64,
    pub resource_critical_threshold: f64,
    /// Response-time health bands
    pub response_warning_ms: f64,
    pub response_critical_ms: f64,
    /// Rolling response-time window length
    pub response_history: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_agents: 100,
            default_limits: ResourceLimits::standard(),
            health_check_interval: Duration::from_secs(60),
            state_save_interval: Duration::from_secs(300),
            metrics_flush_interval: Duration::from_secs(60),
            run_timeout: None,
            resource_warning_threshold: 0.8,
            resource_critical_threshold: 0.95,
            response_warning_ms: 2000.0,
            response_critical_ms: 5000.0,
            response_history: 10,
        }
    }
}

impl From<&MeshConfig> for RuntimeConfig {
    fn from(config: &MeshConfig) -> Self {
        Self {
            max_agents: config.runtime.max_agents,
            default_limits: ResourceLimits {
                max_memory_mb: Some(config.runtime.default_max_memory_mb),
                max_cpu_percent: Some(config.runtime.default_max_cpu_percent),
                max_requests_per_minute: Some(config.runtime.default_max_requests_per_minute),
                ..ResourceLimits::default()
            },
            health_check_interval: config.health_check_interval(),
            state_save_interval: config.state_save_interval(),
            metrics_flush_interval: config.metrics_flush_interval(),
            run_timeout: None,
            resource_warning_threshold: config.health.warning_threshold,
            resource_critical_threshold: config.health.critical_threshold,
            response_warning_ms: config.health.response_warning_ms,
            response_critical_ms: config.health.response_critical_ms,
            response_history: 10,
        }
    }
}
