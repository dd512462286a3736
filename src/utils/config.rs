use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::error::{MeshError, MeshResult};

/// Top-level configuration for the agent mesh.
///
/// Loaded with precedence file -> environment -> defaults. Every tunable is a
/// named scalar with a default matching the runtime's documented behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub runtime: RuntimeSection,
    pub cluster: ClusterSection,
    pub health: HealthSection,
    pub observability: ObservabilitySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    /// Upper bound on concurrent registrations per runtime
    pub max_agents: usize,
    /// Fallback resource limits applied when registration passes none
    pub default_max_memory_mb: f64,
    pub default_max_cpu_percent: f64,
    pub default_max_requests_per_minute: u32,
    /// Minimum time between health runs per entity
    pub health_check_interval_secs: u64,
    /// Background snapshot cadence
    pub state_save_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Worker -> coordinator heartbeat cadence
    pub heartbeat_interval_secs: u64,
    /// Coordinator's offline threshold
    pub heartbeat_timeout_secs: u64,
    /// Coordinator monitor cadence
    pub node_check_interval_secs: u64,
    /// Advertised node capacity used by the placement policy
    pub memory_capacity_mb: f64,
    pub cpu_capacity_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    /// Resource utilisation band boundaries
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    /// Response-time band boundaries in milliseconds
    pub response_warning_ms: f64,
    pub response_critical_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySection {
    pub metrics_flush_interval_secs: u64,
    pub log_level: String,
    /// "text" or "json"
    pub log_format: String,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            max_agents: 100,
            default_max_memory_mb: 1024.0,
            default_max_cpu_percent: 50.0,
            default_max_requests_per_minute: 120,
            health_check_interval_secs: 60,
            state_save_interval_secs: 300,
        }
    }
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            heartbeat_timeout_secs: 30,
            node_check_interval_secs: 10,
            memory_capacity_mb: 16384.0,
            cpu_capacity_percent: 100.0,
        }
    }
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            warning_threshold: 0.8,
            critical_threshold: 0.95,
            response_warning_ms: 2000.0,
            response_critical_ms: 5000.0,
        }
    }
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            metrics_flush_interval_secs: 60,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeSection::default(),
            cluster: ClusterSection::default(),
            health: HealthSection::default(),
            observability: ObservabilitySection::default(),
        }
    }
}

impl MeshConfig {
    /// Load configuration with precedence: file -> env -> defaults.
    ///
    /// The file path is taken from `MESH_CONFIG_FILE` when set.
    pub fn load() -> MeshResult<Self> {
        let mut config = Self::default();

        if let Ok(config_path) = env::var("MESH_CONFIG_FILE") {
            if Path::new(&config_path).exists() {
                config = Self::from_file(config_path)?;
            }
        }

        config.load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> MeshResult<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| MeshError::Configuration {
            reason: format!("Failed to read config file: {e}"),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| MeshError::Configuration {
            reason: format!("Failed to parse config file: {e}"),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables and defaults.
    pub fn from_env() -> MeshResult<Self> {
        let mut config = Self::default();
        config.load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env(&mut self) -> MeshResult<()> {
        if let Ok(max_agents) = env::var("MESH_MAX_AGENTS") {
            self.runtime.max_agents =
                max_agents
                    .parse()
                    .map_err(|_| MeshError::Configuration {
                        reason: format!("Invalid max_agents value: {max_agents}"),
                    })?;
        }
        if let Ok(interval) = env::var("MESH_HEALTH_CHECK_INTERVAL") {
            self.runtime.health_check_interval_secs =
                interval.parse().map_err(|_| MeshError::Configuration {
                    reason: format!("Invalid health_check_interval value: {interval}"),
                })?;
        }
        if let Ok(interval) = env::var("MESH_STATE_SAVE_INTERVAL") {
            self.runtime.state_save_interval_secs =
                interval.parse().map_err(|_| MeshError::Configuration {
                    reason: format!("Invalid state_save_interval value: {interval}"),
                })?;
        }
        if let Ok(interval) = env::var("MESH_HEARTBEAT_INTERVAL") {
            self.cluster.heartbeat_interval_secs =
                interval.parse().map_err(|_| MeshError::Configuration {
                    reason: format!("Invalid heartbeat_interval value: {interval}"),
                })?;
        }
        if let Ok(timeout) = env::var("MESH_HEARTBEAT_TIMEOUT") {
            self.cluster.heartbeat_timeout_secs =
                timeout.parse().map_err(|_| MeshError::Configuration {
                    reason: format!("Invalid heartbeat_timeout value: {timeout}"),
                })?;
        }
        if let Ok(interval) = env::var("MESH_NODE_CHECK_INTERVAL") {
            self.cluster.node_check_interval_secs =
                interval.parse().map_err(|_| MeshError::Configuration {
                    reason: format!("Invalid node_check_interval value: {interval}"),
                })?;
        }
        if let Ok(interval) = env::var("MESH_METRICS_FLUSH_INTERVAL") {
            self.observability.metrics_flush_interval_secs =
                interval.parse().map_err(|_| MeshError::Configuration {
                    reason: format!("Invalid metrics_flush_interval value: {interval}"),
                })?;
        }
        if let Ok(level) = env::var("MESH_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Ok(format) = env::var("MESH_LOG_FORMAT") {
            self.observability.log_format = format;
        }
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> MeshResult<()> {
        if self.runtime.max_agents == 0 {
            return Err(MeshError::Configuration {
                reason: "max_agents must be greater than 0".to_string(),
            });
        }
        if self.runtime.health_check_interval_secs == 0 {
            return Err(MeshError::Configuration {
                reason: "health_check_interval_secs must be greater than 0".to_string(),
            });
        }
        if self.cluster.heartbeat_interval_secs == 0 {
            return Err(MeshError::Configuration {
                reason: "heartbeat_interval_secs must be greater than 0".to_string(),
            });
        }
        if self.cluster.heartbeat_timeout_secs < self.cluster.heartbeat_interval_secs {
            return Err(MeshError::Configuration {
                reason: "heartbeat_timeout_secs must not be below heartbeat_interval_secs"
                    .to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.health.warning_threshold)
            || !(0.0..=1.0).contains(&self.health.critical_threshold)
        {
            return Err(MeshError::Configuration {
                reason: "health thresholds must be within [0.0, 1.0]".to_string(),
            });
        }
        if self.health.warning_threshold > self.health.critical_threshold {
            return Err(MeshError::Configuration {
                reason: "warning_threshold must not exceed critical_threshold".to_string(),
            });
        }
        match self.observability.log_format.as_str() {
            "text" | "json" => {}
            other => {
                return Err(MeshError::Configuration {
                    reason: format!("Unknown log format: {other}"),
                })
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.runtime.health_check_interval_secs)
    }

    #[must_use]
    pub fn state_save_interval(&self) -> Duration {
        Duration::from_secs(self.runtime.state_save_interval_secs)
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.cluster.heartbeat_interval_secs)
    }

    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.heartbeat_timeout_secs)
    }

    #[must_use]
    pub fn node_check_interval(&self) -> Duration {
        Duration::from_secs(self.cluster.node_check_interval_secs)
    }

    #[must_use]
    pub fn metrics_flush_interval(&self) -> Duration {
        Duration::from_secs(self.observability.metrics_flush_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.runtime.max_agents, 100);
        assert_eq!(config.cluster.heartbeat_timeout_secs, 30);
        assert!((config.health.warning_threshold - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = MeshConfig::default();
        config.health.warning_threshold = 0.99;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_toml_overrides() {
        let config: MeshConfig = toml::from_str(
            r#"
            [runtime]
            max_agents = 7

            [cluster]
            heartbeat_timeout_secs = 45
            "#,
        )
        .unwrap();
        assert_eq!(config.runtime.max_agents, 7);
        assert_eq!(config.cluster.heartbeat_timeout_secs, 45);
        // untouched sections keep defaults
        assert_eq!(config.runtime.state_save_interval_secs, 300);
    }
}
