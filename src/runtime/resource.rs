//! Per-agent resource accounting and limit enforcement.
//!
//! The tracker owns a usage record and a limit record per agent. Limit checks
//! run in field-declaration order and fail on the first violation; a rejected
//! update never overwrites the last accepted usage. Per-minute counters are
//! backed by rolling 60-second windows.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::utils::error::{MeshError, MeshResult};

const WINDOW: Duration = Duration::from_secs(60);

/// Types of resources that can be tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Memory,
    Cpu,
    Tokens,
    Requests,
    Bandwidth,
    Custom,
    /// Registration slots in a runtime
    Agents,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Memory => write!(f, "memory"),
            ResourceType::Cpu => write!(f, "cpu"),
            ResourceType::Tokens => write!(f, "tokens"),
            ResourceType::Requests => write!(f, "requests"),
            ResourceType::Bandwidth => write!(f, "bandwidth"),
            ResourceType::Custom => write!(f, "custom"),
            ResourceType::Agents => write!(f, "agents"),
        }
    }
}

/// Measured resource usage for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceUsage {
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub tokens_total: u64,
    pub tokens_last_minute: u64,
    pub requests_per_minute: u32,
    pub bandwidth_kb: f64,
    pub concurrent_requests: u32,
    #[serde(default)]
    pub custom: HashMap<String, f64>,
}

/// Resource limits for one agent. Absent fields are unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceLimits {
    pub max_memory_mb: Option<f64>,
    pub max_cpu_percent: Option<f64>,
    pub max_tokens_total: Option<u64>,
    pub max_tokens_per_minute: Option<u64>,
    pub max_requests_per_minute: Option<u32>,
    pub max_bandwidth_kb: Option<f64>,
    pub max_concurrent_requests: Option<u32>,
    #[serde(default)]
    pub custom: HashMap<String, f64>,
}

impl ResourceLimits {
    /// The fallback limits applied when registration passes none.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            max_memory_mb: Some(1024.0),
            max_cpu_percent: Some(50.0),
            max_requests_per_minute: Some(120),
            ..Self::default()
        }
    }
}

struct AgentResources {
    usage: ResourceUsage,
    limits: ResourceLimits,
    request_window: VecDeque<Instant>,
    token_window: VecDeque<(Instant, u64)>,
}

impl AgentResources {
    fn new(limits: ResourceLimits) -> Self {
        Self {
            usage: ResourceUsage::default(),
            limits,
            request_window: VecDeque::new(),
            token_window: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.request_window.front() {
            if now.duration_since(*front) > WINDOW {
                self.request_window.pop_front();
            } else {
                break;
            }
        }
        while let Some((front, _)) = self.token_window.front() {
            if now.duration_since(*front) > WINDOW {
                self.token_window.pop_front();
            } else {
                break;
            }
        }
        self.usage.requests_per_minute = self.request_window.len() as u32;
        self.usage.tokens_last_minute = self.token_window.iter().map(|(_, n)| n).sum();
    }
}

/// Tracks and limits resource usage for registered agents.
#[derive(Default)]
pub struct ResourceTracker {
    agents: DashMap<String, AgentResources>,
}

impl ResourceTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_agent(&self, agent_id: &str, limits: Option<ResourceLimits>) {
        self.agents.insert(
            agent_id.to_string(),
            AgentResources::new(limits.unwrap_or_default()),
        );
    }

    pub fn unregister_agent(&self, agent_id: &str) -> MeshResult<()> {
        self.agents
            .remove(agent_id)
            .map(|_| ())
            .ok_or_else(|| MeshError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })
    }

    /// Replace the stored usage for an agent.
    ///
    /// Limits are evaluated before the store: on violation the previous
    /// accepted usage remains in place.
    pub fn update_usage(&self, agent_id: &str, usage: ResourceUsage) -> MeshResult<()> {
        let mut entry = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| MeshError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })?;
        check_limits(agent_id, &usage, &entry.limits)?;
        entry.usage = usage;
        Ok(())
    }

    pub fn get_usage(&self, agent_id: &str) -> MeshResult<ResourceUsage> {
        let mut entry = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| MeshError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })?;
        entry.prune(Instant::now());
        Ok(entry.usage.clone())
    }

    pub fn set_limits(&self, agent_id: &str, limits: ResourceLimits) {
        match self.agents.get_mut(agent_id) {
            Some(mut entry) => entry.limits = limits,
            None => self.register_agent(agent_id, Some(limits)),
        }
    }

    pub fn get_limits(&self, agent_id: &str) -> MeshResult<ResourceLimits> {
        self.agents
            .get(agent_id)
            .map(|entry| entry.limits.clone())
            .ok_or_else(|| MeshError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })
    }

    /// Open a request record. Enforces the request-rate and concurrency
    /// limits before admission, so callers fail fast instead of queuing.
    pub fn record_request(&self, agent_id: &str) -> MeshResult<()> {
        let now = Instant::now();
        let mut entry = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| MeshError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })?;
        entry.prune(now);

        if let Some(limit) = entry.limits.max_requests_per_minute {
            let next = entry.request_window.len() as u32 + 1;
            if next > limit {
                return Err(MeshError::ConstraintViolation {
                    resource_type: ResourceType::Requests,
                    current: f64::from(next),
                    limit: f64::from(limit),
                    agent_id: agent_id.to_string(),
                });
            }
        }
        if let Some(limit) = entry.limits.max_concurrent_requests {
            let next = entry.usage.concurrent_requests + 1;
            if next > limit {
                return Err(MeshError::ConstraintViolation {
                    resource_type: ResourceType::Requests,
                    current: f64::from(next),
                    limit: f64::from(limit),
                    agent_id: agent_id.to_string(),
                });
            }
        }

        entry.request_window.push_back(now);
        entry.usage.requests_per_minute = entry.request_window.len() as u32;
        entry.usage.concurrent_requests += 1;
        Ok(())
    }

    /// Close a request record opened by [`ResourceTracker::record_request`].
    pub fn complete_request(&self, agent_id: &str) {
        if let Some(mut entry) = self.agents.get_mut(agent_id) {
            entry.usage.concurrent_requests = entry.usage.concurrent_requests.saturating_sub(1);
        }
    }

    pub fn record_tokens(&self, agent_id: &str, tokens: u64) {
        let now = Instant::now();
        if let Some(mut entry) = self.agents.get_mut(agent_id) {
            entry.usage.tokens_total += tokens;
            entry.token_window.push_back((now, tokens));
            entry.prune(now);
        }
    }
}

/// Evaluate every present limit, in field-declaration order, failing on the
/// first violation encountered.
fn check_limits(agent_id: &str, usage: &ResourceUsage, limits: &ResourceLimits) -> MeshResult<()> {
    let violation = |resource_type, current: f64, limit: f64| {
        Err(MeshError::ConstraintViolation {
            resource_type,
            current,
            limit,
            agent_id: agent_id.to_string(),
        })
    };

    if let Some(limit) = limits.max_memory_mb {
        if usage.memory_mb > limit {
            return violation(ResourceType::Memory, usage.memory_mb, limit);
        }
    }
    if let Some(limit) = limits.max_cpu_percent {
        if usage.cpu_percent > limit {
            return violation(ResourceType::Cpu, usage.cpu_percent, limit);
        }
    }
    if let Some(limit) = limits.max_tokens_total {
        if usage.tokens_total > limit {
            return violation(ResourceType::Tokens, usage.tokens_total as f64, limit as f64);
        }
    }
    if let Some(limit) = limits.max_tokens_per_minute {
        if usage.tokens_last_minute > limit {
            return violation(
                ResourceType::Tokens,
                usage.tokens_last_minute as f64,
                limit as f64,
            );
        }
    }
    if let Some(limit) = limits.max_requests_per_minute {
        if usage.requests_per_minute > limit {
            return violation(
                ResourceType::Requests,
                f64::from(usage.requests_per_minute),
                f64::from(limit),
            );
        }
    }
    if let Some(limit) = limits.max_bandwidth_kb {
        if usage.bandwidth_kb > limit {
            return violation(ResourceType::Bandwidth, usage.bandwidth_kb, limit);
        }
    }
    if let Some(limit) = limits.max_concurrent_requests {
        if usage.concurrent_requests > limit {
            return violation(
                ResourceType::Requests,
                f64::from(usage.concurrent_requests),
                f64::from(limit),
            );
        }
    }
    let mut custom_keys: Vec<&String> = limits.custom.keys().collect();
    custom_keys.sort();
    for key in custom_keys {
        let limit = limits.custom[key];
        if let Some(current) = usage.custom.get(key) {
            if *current > limit {
                return violation(ResourceType::Custom, *current, limit);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_update_keeps_last_accepted_usage() {
        let tracker = ResourceTracker::new();
        tracker.register_agent(
            "a1",
            Some(ResourceLimits {
                max_memory_mb: Some(100.0),
                ..ResourceLimits::default()
            }),
        );

        tracker
            .update_usage(
                "a1",
                ResourceUsage {
                    memory_mb: 80.0,
                    ..ResourceUsage::default()
                },
            )
            .unwrap();

        let err = tracker
            .update_usage(
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

        let usage = tracker.get_usage("a1").unwrap();
        assert!((usage.memory_mb - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn memory_violation_reported_before_cpu() {
        let tracker = ResourceTracker::new();
        tracker.register_agent(
            "a1",
            Some(ResourceLimits {
                max_memory_mb: Some(10.0),
                max_cpu_percent: Some(10.0),
                ..ResourceLimits::default()
            }),
        );
        let err = tracker
            .update_usage(
                "a1",
                ResourceUsage {
                    memory_mb: 20.0,
                    cpu_percent: 20.0,
                    ..ResourceUsage::default()
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            MeshError::ConstraintViolation {
                resource_type: ResourceType::Memory,
                ..
            }
        ));
    }

    #[test]
    fn request_rate_limit_fails_fast() {
        let tracker = ResourceTracker::new();
        tracker.register_agent(
            "a1",
            Some(ResourceLimits {
                max_requests_per_minute: Some(2),
                ..ResourceLimits::default()
            }),
        );

        tracker.record_request("a1").unwrap();
        tracker.record_request("a1").unwrap();
        assert!(tracker.record_request("a1").is_err());
    }

    #[test]
    fn concurrency_limit_released_on_completion() {
        let tracker = ResourceTracker::new();
        tracker.register_agent(
            "a1",
            Some(ResourceLimits {
                max_concurrent_requests: Some(1),
                ..ResourceLimits::default()
            }),
        );

        tracker.record_request("a1").unwrap();
        assert!(tracker.record_request("a1").is_err());
        tracker.complete_request("a1");
        tracker.record_request("a1").unwrap();
    }

    #[test]
    fn token_accounting_accumulates() {
        let tracker = ResourceTracker::new();
        tracker.register_agent("a1", None);
        tracker.record_tokens("a1", 40);
        tracker.record_tokens("a1", 2);
        let usage = tracker.get_usage("a1").unwrap();
        assert_eq!(usage.tokens_total, 42);
        assert_eq!(usage.tokens_last_minute, 42);
    }

    #[test]
    fn unknown_agent_is_not_found() {
        let tracker = ResourceTracker::new();
        assert!(matches!(
            tracker.get_usage("ghost"),
            Err(MeshError::AgentNotFound { .. })
        ));
    }
}
