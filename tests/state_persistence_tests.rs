//! End-to-end persistence tests: file-provider round trips and runtime
//! save/restore of agent memory.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use agent_mesh::agent::{Agent, EchoAgent};
use agent_mesh::observability::Observability;
use agent_mesh::runtime::state::{
    AgentState, AgentStatus, FileStateProvider, StateProvider,
};
use agent_mesh::runtime::{LocalAgentRuntime, RuntimeConfig};

fn sample_state() -> AgentState {
    AgentState {
        agent_id: "a1".to_string(),
        agent_type: "echo".to_string(),
        status: AgentStatus::Ready,
        timestamp: 1_700_000_000.25,
        conversation_history: serde_json::json!([
            {"role": "user", "content": "hello"},
            {"role": "assistant", "content": "echo: hello"},
        ]),
        metadata: serde_json::json!({"name": "echo-1", "description": "test"}),
        config: serde_json::json!({"temperature": 0.2}),
        custom_data: serde_json::json!({"notes": ["x", "y"]}),
    }
}

#[tokio::test]
async fn file_state_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FileStateProvider::new(dir.path());
    provider.initialize().await.unwrap();

    let state = sample_state();
    provider.save_state(state.clone()).await.unwrap();
    assert!(dir.path().join("a1.json").exists());
    assert_eq!(provider.list_states().await.unwrap(), vec!["a1".to_string()]);

    let loaded = provider.load_state("a1").await.unwrap().unwrap();
    assert_eq!(loaded, state);

    provider.delete_state("a1").await.unwrap();
    assert_eq!(provider.load_state("a1").await.unwrap(), None);
}

#[tokio::test]
async fn save_load_save_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FileStateProvider::new(dir.path());
    provider.initialize().await.unwrap();

    provider.save_state(sample_state()).await.unwrap();
    let first: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("a1.json")).unwrap()).unwrap();

    let loaded = provider.load_state("a1").await.unwrap().unwrap();
    provider.save_state(loaded).await.unwrap();
    let second: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("a1.json")).unwrap()).unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn runtime_persists_and_restores_agent_memory() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(FileStateProvider::new(dir.path()));
    let observability = Observability::new();
    let runtime = LocalAgentRuntime::with_components(
        RuntimeConfig::default(),
        provider.clone(),
        &observability,
    );
    runtime.start().await.unwrap();

    let agent = Arc::new(EchoAgent::new("a1", "echo-1"));
    runtime
        .register_agent(agent.clone(), Some("a1".into()), None)
        .await
        .unwrap();
    runtime.run_agent("a1", "remember me", None).await.unwrap();
    runtime.save_agent_state("a1").await.unwrap();

    let persisted = provider.load_state("a1").await.unwrap().unwrap();
    assert_eq!(persisted.agent_type, "echo");
    assert_eq!(persisted.status, AgentStatus::Ready);
    let history = persisted.conversation_history.as_array().unwrap();
    assert!(history
        .iter()
        .any(|entry| entry["content"] == "remember me"));

    // Wipe the live memory, then restore from the snapshot
    agent.restore_memory(serde_json::json!([])).unwrap();
    assert!(runtime.load_agent_state("a1").await.unwrap());
    let restored = agent.memory_snapshot();
    assert!(restored
        .as_array()
        .unwrap()
        .iter()
        .any(|entry| entry["content"] == "remember me"));
}

#[tokio::test]
async fn stop_performs_a_final_snapshot_pass() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(FileStateProvider::new(dir.path()));
    let observability = Observability::new();
    let runtime = LocalAgentRuntime::with_components(
        RuntimeConfig::default(),
        provider.clone(),
        &observability,
    );
    runtime.start().await.unwrap();
    runtime
        .register_agent(Arc::new(EchoAgent::new("a1", "echo-1")), Some("a1".into()), None)
        .await
        .unwrap();
    runtime.run_agent("a1", "hello", None).await.unwrap();

    runtime.stop().await.unwrap();

    let persisted = provider.load_state("a1").await.unwrap().unwrap();
    assert!(persisted
        .conversation_history
        .as_array()
        .unwrap()
        .iter()
        .any(|entry| entry["content"] == "hello"));
}
