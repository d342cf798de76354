//! Agent 错误类型
//!
//! 工具级错误不在此处：它们在 ToolDispatcher 中被转为数据（Failure）回写给模型。
//! 这里只有会中止一次运行或一次恢复请求的错误。

use thiserror::Error;

/// 运行过程中的致命错误（模型调用、存储、配置等）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Model invocation failed: {0}")]
    ModelInvocation(String),

    #[error("Checkpoint not found: thread={thread_id} turn={}", display_turn(*turn))]
    CheckpointNotFound { thread_id: String, turn: Option<u32> },

    /// 运行不能在没有持久状态的情况下继续
    #[error("Checkpoint write failed: {0}")]
    CheckpointWrite(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),
}

fn display_turn(turn: Option<u32>) -> String {
    turn.map(|t| t.to_string()).unwrap_or_else(|| "latest".to_string())
}

impl AgentError {
    /// 是否只影响恢复请求本身（而非正在进行的运行）
    pub fn is_resume_error(&self) -> bool {
        matches!(self, AgentError::CheckpointNotFound { .. })
    }
}
