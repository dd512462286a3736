//! Node roster records for the cluster runtime.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    Online,
    Offline,
    Degraded,
    Maintenance,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "ONLINE"),
            NodeStatus::Offline => write!(f, "OFFLINE"),
            NodeStatus::Degraded => write!(f, "DEGRADED"),
            NodeStatus::Maintenance => write!(f, "MAINTENANCE"),
        }
    }
}

/// Resource snapshot a node advertises in heartbeats. Capacities feed the
/// placement policy's utilisation ratios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResources {
    pub memory_used_mb: f64,
    pub memory_capacity_mb: f64,
    pub cpu_used_percent: f64,
    pub cpu_capacity_percent: f64,
}

impl Default for NodeResources {
    fn default() -> Self {
        Self {
            memory_used_mb: 0.0,
            memory_capacity_mb: 16384.0,
            cpu_used_percent: 0.0,
            cpu_capacity_percent: 100.0,
        }
    }
}

impl NodeResources {
    #[must_use]
    pub fn memory_ratio(&self) -> f64 {
        if self.memory_capacity_mb > 0.0 {
            self.memory_used_mb / self.memory_capacity_mb
        } else {
            1.0
        }
    }

    #[must_use]
    pub fn cpu_ratio(&self) -> f64 {
        if self.cpu_capacity_percent > 0.0 {
            self.cpu_used_percent / self.cpu_capacity_percent
        } else {
            1.0
        }
    }
}

/// Everything the coordinator knows about one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub name: String,
    pub status: NodeStatus,
    pub endpoint: String,
    pub resources: NodeResources,
    #[serde(default)]
    pub agent_ids: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl NodeInfo {
    #[must_use]
    pub fn new(node_id: &str, name: &str, endpoint: &str, resources: NodeResources) -> Self {
        Self {
            node_id: node_id.to_string(),
            name: name.to_string(),
            status: NodeStatus::Online,
            endpoint: endpoint.to_string(),
            resources,
            agent_ids: Vec::new(),
            last_heartbeat: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}
