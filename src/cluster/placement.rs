//! Agent placement policy.
//!
//! A pure function of the roster snapshot and the requested limits: among
//! online nodes that can admit the request, pick the one with the smallest
//! sum of memory and cpu utilisation ratios, breaking ties by node id.

use crate::cluster::node::{NodeInfo, NodeStatus};
use crate::runtime::resource::ResourceLimits;

fn admits(node: &NodeInfo, limits: Option<&ResourceLimits>) -> bool {
    let Some(limits) = limits else {
        return true;
    };
    if let Some(requested) = limits.max_memory_mb {
        let headroom = node.resources.memory_capacity_mb - node.resources.memory_used_mb;
        if headroom < requested {
            return false;
        }
    }
    if let Some(requested) = limits.max_cpu_percent {
        let headroom = node.resources.cpu_capacity_percent - node.resources.cpu_used_percent;
        if headroom < requested {
            return false;
        }
    }
    true
}

/// Select the target node for an agent, or `None` when no online node has
/// sufficient headroom.
#[must_use]
pub fn select_node<'a>(
    nodes: impl IntoIterator<Item = &'a NodeInfo>,
    limits: Option<&ResourceLimits>,
) -> Option<String> {
    nodes
        .into_iter()
        .filter(|node| node.status == NodeStatus::Online)
        .filter(|node| admits(node, limits))
        .min_by(|a, b| {
            let score_a = a.resources.memory_ratio() + a.resources.cpu_ratio();
            let score_b = b.resources.memory_ratio() + b.resources.cpu_ratio();
            score_a
                .total_cmp(&score_b)
                .then_with(|| a.node_id.cmp(&b.node_id))
        })
        .map(|node| node.node_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::NodeResources;

    fn node(node_id: &str, memory_used: f64, cpu_used: f64) -> NodeInfo {
        NodeInfo::new(
            node_id,
            node_id,
            &format!("mem://{node_id}"),
            NodeResources {
                memory_used_mb: memory_used,
                memory_capacity_mb: 1000.0,
                cpu_used_percent: cpu_used,
                cpu_capacity_percent: 100.0,
            },
        )
    }

    #[test]
    fn picks_least_utilised_node() {
        let nodes = [node("n1", 800.0, 50.0), node("n2", 100.0, 10.0)];
        assert_eq!(select_node(&nodes, None), Some("n2".to_string()));
    }

    #[test]
    fn breaks_ties_lexicographically() {
        let nodes = [node("n2", 100.0, 10.0), node("n1", 100.0, 10.0)];
        assert_eq!(select_node(&nodes, None), Some("n1".to_string()));
    }

    #[test]
    fn excludes_offline_nodes() {
        let mut offline = node("n1", 0.0, 0.0);
        offline.status = NodeStatus::Offline;
        let nodes = [offline, node("n2", 500.0, 50.0)];
        assert_eq!(select_node(&nodes, None), Some("n2".to_string()));
    }

    #[test]
    fn respects_memory_headroom() {
        let nodes = [node("n1", 900.0, 0.0), node("n2", 100.0, 90.0)];
        let limits = ResourceLimits {
            max_memory_mb: Some(500.0),
            ..ResourceLimits::default()
        };
        assert_eq!(select_node(&nodes, Some(&limits)), Some("n2".to_string()));
    }

    #[test]
    fn returns_none_when_nothing_admits() {
        let nodes = [node("n1", 990.0, 0.0)];
        let limits = ResourceLimits {
            max_memory_mb: Some(500.0),
            ..ResourceLimits::default()
        };
        assert_eq!(select_node(&nodes, Some(&limits)), None);
    }

    #[test]
    fn policy_is_deterministic() {
        let nodes = [node("n1", 300.0, 30.0), node("n2", 300.0, 30.0)];
        let first = select_node(&nodes, None);
        for _ in 0..10 {
            assert_eq!(select_node(&nodes, None), first);
        }
    }
}
