use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{conflict, not_found, Checkpoint, CheckpointStore};
use crate::core::{AgentError, AgentState};

/// 进程内检查点存储（不跨重启）
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    threads: RwLock<BTreeMap<String, BTreeMap<u32, Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, thread_id: &str, state: &AgentState) -> Result<Checkpoint, AgentError> {
        let mut threads = self.threads.write().await;
        let turns = threads.entry(thread_id.to_string()).or_default();
        if let Some(existing) = turns.get(&state.turn_count) {
            if &existing.state == state {
                return Ok(existing.clone());
            }
            return Err(conflict(thread_id, state.turn_count));
        }
        // 与 SQLite 实现一致：存的是序列化后再读回的副本
        let snapshot = AgentState::from_json(&state.to_json()?)?;
        let checkpoint = Checkpoint::new(thread_id, snapshot);
        turns.insert(checkpoint.turn, checkpoint.clone());
        Ok(checkpoint)
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>, AgentError> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(thread_id)
            .map(|turns| turns.values().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn load(&self, thread_id: &str, turn: Option<u32>) -> Result<AgentState, AgentError> {
        let threads = self.threads.read().await;
        let turns = threads.get(thread_id).ok_or_else(|| not_found(thread_id, turn))?;
        let checkpoint = match turn {
            Some(t) => turns.get(&t),
            None => turns.values().next_back(),
        };
        checkpoint
            .map(|c| c.state.clone())
            .ok_or_else(|| not_found(thread_id, turn))
    }
}
