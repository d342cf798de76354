//! 检查点：按 (thread_id, turn) 写一次的 AgentState 快照
//!
//! - `SqliteCheckpointStore`：sqlx 连接池，跨进程重启持久
//! - `MemoryCheckpointStore`：进程内实现，用于测试与 `--mock` 演示

mod memory;
mod sqlite;

pub use memory::MemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::{AgentError, AgentState};

/// 一个不可变的快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub turn: u32,
    pub state: AgentState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(thread_id: impl Into<String>, state: AgentState) -> Self {
        Self {
            thread_id: thread_id.into(),
            turn: state.turn_count,
            state,
            created_at: Utc::now(),
        }
    }
}

/// 检查点存储
///
/// 同一 thread_id 只有一个写者；不同 thread_id 可并发写。
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 以 state.turn_count 为 turn 写入；同键已存在且内容不同时返回 CheckpointWrite
    async fn save(&self, thread_id: &str, state: &AgentState) -> Result<Checkpoint, AgentError>;

    /// 按 turn 从新到旧
    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>, AgentError>;

    /// turn 为 None 时取最新
    async fn load(&self, thread_id: &str, turn: Option<u32>) -> Result<AgentState, AgentError>;
}

fn not_found(thread_id: &str, turn: Option<u32>) -> AgentError {
    AgentError::CheckpointNotFound {
        thread_id: thread_id.to_string(),
        turn,
    }
}

fn conflict(thread_id: &str, turn: u32) -> AgentError {
    AgentError::CheckpointWrite(format!(
        "checkpoint {thread_id}@{turn} already exists with different content"
    ))
}
