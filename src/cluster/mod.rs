//! Cluster runtime: node roster, heartbeats, placement, failure detection,
//! migration, and request forwarding over an abstract transport.

pub mod node;
pub mod placement;
pub mod rpc;
pub mod runtime;

pub use node::{NodeInfo, NodeResources, NodeStatus};
pub use rpc::{AgentStatusReport, InProcessTransport, NodeTransport};
pub use runtime::{ClusterAgentRuntime, ClusterConfig, NodeRole};
