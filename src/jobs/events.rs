//! 任务事件：progress / result / error / done
//!
//! 可序列化为 JSON；SSE 输出时事件名取 `name()`，数据取 `data()`。

use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// 一个周期结束后的进度
    Progress {
        turn: u32,
        metrics: Vec<Value>,
        /// 模型本周期请求的工具
        next_tools: Vec<String>,
    },
    /// 最终结论（或兜底错误对象 / 停止说明）
    Result { payload: Value },
    Error { message: String },
    Done,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Progress { .. } => "progress",
            Event::Result { .. } => "result",
            Event::Error { .. } => "error",
            Event::Done => "done",
        }
    }

    /// error 与 done 之后不会再有事件
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Error { .. } | Event::Done)
    }

    /// SSE data 字段；done 没有数据
    pub fn data(&self) -> Option<String> {
        match self {
            Event::Progress {
                turn,
                metrics,
                next_tools,
            } => Some(
                json!({"turn": turn, "metrics": metrics, "next_tools": next_tools}).to_string(),
            ),
            Event::Result { payload } => Some(payload.to_string()),
            Event::Error { message } => Some(message.clone()),
            Event::Done => None,
        }
    }
}
