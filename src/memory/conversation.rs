//! 对话日志：消息、工具调用请求与工具结果
//!
//! 持久日志只追加不删除；发送给模型的视图由 [`crate::memory::window`] 负责裁剪。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 消息角色（与 LLM API 一致，tool 表示工具结果）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// 模型请求的一次工具调用；call_id 在一次运行内唯一
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    pub call_id: String,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value, call_id: impl Into<String>) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };
        Self {
            name: name.into(),
            arguments,
            call_id: call_id.into(),
        }
    }
}

/// 工具结果消息携带的结果类别，用于终止判定（Stop）与进度展示
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Metric,
    Raw,
    Stop,
    Failure,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// 仅 assistant：本轮请求的工具调用
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// 仅 tool：对应请求的 call_id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// 仅 tool：结果类别
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_kind: Option<ResultKind>,
}

impl Message {
    fn plain(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            result_kind: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content.into())
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content.into())
    }

    /// 带工具调用请求的 assistant 消息
    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content.into())
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        kind: ResultKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            result_kind: Some(kind),
            ..Self::plain(Role::Tool, content.into())
        }
    }

    pub fn requests_tools(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }

    pub fn is_tool_result(&self) -> bool {
        self.role == Role::Tool
    }

    pub fn is_stop_signal(&self) -> bool {
        self.role == Role::Tool && self.result_kind == Some(ResultKind::Stop)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tool_calls.iter().map(|c| c.name.clone()).collect()
    }
}

/// 检查日志中每个 tool 结果是否都回应了紧邻其前的 assistant 请求
pub fn tool_results_are_linked(messages: &[Message]) -> bool {
    let mut open: Option<&Message> = None;
    for msg in messages {
        match msg.role {
            Role::Assistant => open = Some(msg),
            Role::Tool => {
                let Some(request) = open else {
                    return false;
                };
                let Some(id) = msg.tool_call_id.as_deref() else {
                    return false;
                };
                if !request.tool_calls.iter().any(|c| c.call_id == id) {
                    return false;
                }
            }
            Role::System | Role::User => open = None,
        }
    }
    true
}
