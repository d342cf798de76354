//! SQLite 检查点存储（sqlx 异步连接池）
//!
//! 每个 (thread_id, turn) 一行，state 列为完整的 AgentState JSON。
//! 连接池满时请求排队等待而不是立即失败；排队超过 `ACQUIRE_TIMEOUT` 才报 Storage 错误，
//! 此时运行以 error 事件结束，不会在没有检查点的情况下继续。

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::{conflict, not_found, Checkpoint, CheckpointStore};
use crate::core::{AgentError, AgentState};

/// 取连接的最长排队时间（远大于单次写入耗时，只在存储卡死时触发）
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// 打开（必要时创建）数据库文件
    pub async fn open(db_path: impl AsRef<Path>, max_connections: u32) -> Result<Self, AgentError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::Config(format!("create {}: {e}", parent.display())))?;
        }
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        tracing::info!(path = %db_path.display(), "checkpoint store ready");
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id TEXT NOT NULL,
                turn INTEGER NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (thread_id, turn)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_one(
        &self,
        thread_id: &str,
        turn: u32,
    ) -> Result<Option<Checkpoint>, AgentError> {
        let row = sqlx::query(
            "SELECT thread_id, turn, state, created_at FROM checkpoints WHERE thread_id = ? AND turn = ?",
        )
        .bind(thread_id)
        .bind(i64::from(turn))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_checkpoint).transpose()
    }
}

fn row_to_checkpoint(row: &SqliteRow) -> Result<Checkpoint, AgentError> {
    let thread_id: String = row.get("thread_id");
    let turn: i64 = row.get("turn");
    let state: String = row.get("state");
    let created_at: String = row.get("created_at");
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AgentError::Config(format!("bad checkpoint timestamp {created_at}: {e}")))?;
    Ok(Checkpoint {
        thread_id,
        turn: turn as u32,
        state: AgentState::from_json(&state)?,
        created_at,
    })
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, thread_id: &str, state: &AgentState) -> Result<Checkpoint, AgentError> {
        let body = state.to_json()?;
        let checkpoint = Checkpoint::new(thread_id, AgentState::from_json(&body)?);

        let inserted = sqlx::query(
            "INSERT INTO checkpoints (thread_id, turn, state, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT (thread_id, turn) DO NOTHING",
        )
        .bind(thread_id)
        .bind(i64::from(checkpoint.turn))
        .bind(&body)
        .bind(checkpoint.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| AgentError::CheckpointWrite(e.to_string()))?
        .rows_affected();

        if inserted == 1 {
            tracing::debug!(thread_id, turn = checkpoint.turn, "checkpoint saved");
            return Ok(checkpoint);
        }

        match self.fetch_one(thread_id, checkpoint.turn).await? {
            Some(existing) if &existing.state == state => Ok(existing),
            _ => Err(conflict(thread_id, checkpoint.turn)),
        }
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>, AgentError> {
        let rows = sqlx::query(
            "SELECT thread_id, turn, state, created_at FROM checkpoints WHERE thread_id = ? ORDER BY turn DESC",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_checkpoint).collect()
    }

    async fn load(&self, thread_id: &str, turn: Option<u32>) -> Result<AgentState, AgentError> {
        let row = match turn {
            Some(t) => {
                sqlx::query("SELECT state FROM checkpoints WHERE thread_id = ? AND turn = ?")
                    .bind(thread_id)
                    .bind(i64::from(t))
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => {
                sqlx::query(
                    "SELECT state FROM checkpoints WHERE thread_id = ? ORDER BY turn DESC LIMIT 1",
                )
                .bind(thread_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        let row = row.ok_or_else(|| not_found(thread_id, turn))?;
        let state: String = row.get("state");
        AgentState::from_json(&state)
    }
}
