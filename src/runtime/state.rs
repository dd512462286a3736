//! Agent state persistence.
//!
//! A state provider persists and restores agent snapshots. The in-memory
//! variant lives for the process; the file-backed variant writes one JSON
//! document per agent at `<dir>/<agent_id>.json` with whole-file replacement.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::utils::error::{MeshError, MeshResult};

/// Lifecycle status of an agent.
///
/// Transitions are owned by the runtime: `Initializing -> Ready -> Running ->
/// {Ready | Error}`, pause toggles `Ready/Error -> Paused -> Ready`, recovery
/// moves `Error -> Ready`, and `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentStatus {
    Initializing,
    Ready,
    Running,
    Paused,
    Completed,
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Initializing => write!(f, "INITIALIZING"),
            AgentStatus::Ready => write!(f, "READY"),
            AgentStatus::Running => write!(f, "RUNNING"),
            AgentStatus::Paused => write!(f, "PAUSED"),
            AgentStatus::Completed => write!(f, "COMPLETED"),
            AgentStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Serializable snapshot of an agent, sufficient to restart it elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub agent_type: String,
    pub status: AgentStatus,
    /// Epoch seconds at snapshot time
    pub timestamp: f64,
    #[serde(default)]
    pub conversation_history: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub custom_data: serde_json::Value,
}

impl AgentState {
    #[must_use]
    pub fn new(agent_id: &str, agent_type: &str, status: AgentStatus) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            agent_type: agent_type.to_string(),
            status,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            conversation_history: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            config: serde_json::Value::Null,
            custom_data: serde_json::Value::Null,
        }
    }
}

/// Persistence abstraction for agent snapshots.
#[async_trait]
pub trait StateProvider: Send + Sync {
    async fn initialize(&self) -> MeshResult<()>;
    async fn save_state(&self, state: AgentState) -> MeshResult<()>;
    async fn load_state(&self, agent_id: &str) -> MeshResult<Option<AgentState>>;
    async fn delete_state(&self, agent_id: &str) -> MeshResult<()>;
    async fn list_states(&self) -> MeshResult<Vec<String>>;
}

/// In-memory provider for development, testing, and single-process clusters.
#[derive(Default)]
pub struct InMemoryStateProvider {
    states: DashMap<String, AgentState>,
}

impl InMemoryStateProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateProvider for InMemoryStateProvider {
    async fn initialize(&self) -> MeshResult<()> {
        Ok(())
    }

    async fn save_state(&self, state: AgentState) -> MeshResult<()> {
        self.states.insert(state.agent_id.clone(), state);
        Ok(())
    }

    async fn load_state(&self, agent_id: &str) -> MeshResult<Option<AgentState>> {
        Ok(self.states.get(agent_id).map(|s| s.clone()))
    }

    async fn delete_state(&self, agent_id: &str) -> MeshResult<()> {
        self.states.remove(agent_id);
        Ok(())
    }

    async fn list_states(&self) -> MeshResult<Vec<String>> {
        Ok(self.states.iter().map(|e| e.key().clone()).collect())
    }
}

/// File-backed provider: one JSON document per agent.
pub struct FileStateProvider {
    directory: PathBuf,
}

impl FileStateProvider {
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn state_path(&self, agent_id: &str) -> MeshResult<PathBuf> {
        // Agent ids are opaque strings but become file names here; anything
        // that could escape the state directory is rejected.
        if agent_id.is_empty()
            || agent_id.contains('/')
            || agent_id.contains('\\')
            || agent_id.contains("..")
        {
            return Err(MeshError::StateIo {
                operation: "path".to_string(),
                cause: format!("Invalid agent id for file storage: {agent_id}"),
            });
        }
        Ok(self.directory.join(format!("{agent_id}.json")))
    }
}

async fn run_blocking<T, F>(operation: &str, f: F) -> MeshResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    let op = operation.to_string();
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MeshError::Internal {
            reason: format!("State worker task failed: {e}"),
        })?
        .map_err(|e| MeshError::StateIo {
            operation: op,
            cause: e.to_string(),
        })
}

#[async_trait]
impl StateProvider for FileStateProvider {
    async fn initialize(&self) -> MeshResult<()> {
        let dir = self.directory.clone();
        run_blocking("initialize", move || std::fs::create_dir_all(dir)).await
    }

    async fn save_state(&self, state: AgentState) -> MeshResult<()> {
        let path = self.state_path(&state.agent_id)?;
        let payload = serde_json::to_vec_pretty(&state)?;
        run_blocking("save", move || std::fs::write(path, payload)).await
    }

    async fn load_state(&self, agent_id: &str) -> MeshResult<Option<AgentState>> {
        let path = self.state_path(agent_id)?;
        let bytes = run_blocking("load", move || match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        })
        .await?;

        let Some(bytes) = bytes else {
            return Ok(None);
        };
        match serde_json::from_slice::<AgentState>(&bytes) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!("Invalid state document for agent {agent_id}: {e}");
                Ok(None)
            }
        }
    }

    async fn delete_state(&self, agent_id: &str) -> MeshResult<()> {
        let path = self.state_path(agent_id)?;
        run_blocking("delete", move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        })
        .await
    }

    async fn list_states(&self) -> MeshResult<Vec<String>> {
        let dir = self.directory.clone();
        run_blocking("list", move || {
            let mut agent_ids = Vec::new();
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let name = Path::new(&name);
                if name.extension().is_some_and(|ext| ext == "json") {
                    if let Some(stem) = name.file_stem().and_then(|s| s.to_str()) {
                        agent_ids.push(stem.to_string());
                    }
                }
            }
            Ok(agent_ids)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state(agent_id: &str) -> AgentState {
        AgentState {
            agent_id: agent_id.to_string(),
            agent_type: "echo".to_string(),
            status: AgentStatus::Ready,
            timestamp: 1_700_000_000.5,
            conversation_history: serde_json::json!([{"role": "user", "content": "hi"}]),
            metadata: serde_json::json!({"name": "echo-1"}),
            config: serde_json::json!({}),
            custom_data: serde_json::json!(null),
        }
    }

    #[test]
    fn status_serialises_as_upper_case_name() {
        let json = serde_json::to_string(&AgentStatus::Ready).unwrap();
        assert_eq!(json, "\"READY\"");
        let status: AgentStatus = serde_json::from_str("\"ERROR\"").unwrap();
        assert_eq!(status, AgentStatus::Error);
    }

    #[tokio::test]
    async fn memory_provider_round_trips() {
        let provider = InMemoryStateProvider::new();
        provider.initialize().await.unwrap();

        let state = sample_state("a1");
        provider.save_state(state.clone()).await.unwrap();
        assert_eq!(provider.load_state("a1").await.unwrap(), Some(state));
        assert_eq!(provider.list_states().await.unwrap(), vec!["a1".to_string()]);

        provider.delete_state("a1").await.unwrap();
        assert_eq!(provider.load_state("a1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_provider_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileStateProvider::new(dir.path());
        provider.initialize().await.unwrap();

        let state = sample_state("a1");
        provider.save_state(state.clone()).await.unwrap();
        assert!(dir.path().join("a1.json").exists());
        assert_eq!(provider.list_states().await.unwrap(), vec!["a1".to_string()]);
        assert_eq!(provider.load_state("a1").await.unwrap(), Some(state));

        provider.delete_state("a1").await.unwrap();
        assert_eq!(provider.load_state("a1").await.unwrap(), None);
        assert!(provider.list_states().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_provider_ignores_malformed_documents() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileStateProvider::new(dir.path());
        provider.initialize().await.unwrap();

        std::fs::write(dir.path().join("broken.json"), b"not json").unwrap();
        assert_eq!(provider.load_state("broken").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_provider_rejects_path_separators() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileStateProvider::new(dir.path());
        provider.initialize().await.unwrap();

        assert!(provider.load_state("../escape").await.is_err());
        assert!(provider.save_state(sample_state("a/b")).await.is_err());
    }

    #[tokio::test]
    async fn missing_state_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileStateProvider::new(dir.path());
        provider.initialize().await.unwrap();
        assert_eq!(provider.load_state("ghost").await.unwrap(), None);
    }
}
