//! Local agent runtime: lifecycle engine, resource accounting, health
//! monitoring, state persistence, and the handoff helper.

pub mod config;
pub mod handoff;
pub mod health;
pub mod local;
pub mod resource;
pub mod state;

pub use config::RuntimeConfig;
pub use local::{LocalAgentRuntime, RuntimeStatus};
pub use state::AgentStatus;
