//! # agent-mesh
//!
//! A distributed agent runtime: a local lifecycle engine (registry, state
//! machine, resource accounting, health-driven recovery, periodic state
//! persistence) wrapped by a coordinator/worker cluster layer (node
//! discovery via heartbeats, placement, failure detection, migration, and
//! request forwarding).
//!
//! ## Architecture Overview
//!
//! - [`agent`]: the embedded agent contract and blueprints
//! - [`runtime`]: the local runtime, resource tracker, health monitor, state
//!   providers, and the handoff helper
//! - [`cluster`]: the coordinator/worker cluster runtime and RPC schemas
//! - [`observability`]: structured logging, tracing spans, and metrics
//! - [`utils`]: error taxonomy and layered configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agent_mesh::agent::EchoAgent;
//! use agent_mesh::runtime::{LocalAgentRuntime, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = LocalAgentRuntime::new(RuntimeConfig::default());
//!     runtime.start().await?;
//!
//!     let agent = Arc::new(EchoAgent::new("a1", "echo-1"));
//!     let agent_id = runtime.register_agent(agent, None, None).await?;
//!     let response = runtime.run_agent(&agent_id, "hello", None).await?;
//!     println!("{response}");
//!
//!     runtime.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod cluster;
pub mod observability;
pub mod runtime;
pub mod utils;

pub use agent::{Agent, AgentBlueprint, AgentFactory, EchoAgent};
pub use cluster::{ClusterAgentRuntime, ClusterConfig, InProcessTransport, NodeRole};
pub use observability::{global_observability, Observability};
pub use runtime::{AgentStatus, LocalAgentRuntime, RuntimeConfig, RuntimeStatus};
pub use utils::{MeshConfig, MeshError, MeshResult};
