//! 工具分发器
//!
//! 按请求顺序依次执行一批工具调用。每次调用施加超时并捕获 panic，
//! 任何失败都转为 `ToolOutcome::Failure` 数据，绝不向调用方传播；
//! 遇到 Stop 立即结束本批次，其后的调用被丢弃。每次调用输出结构化审计日志（JSON）。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::timeout;

use crate::core::Metric;
use crate::memory::{Message, ResultKind, ToolCall};
use crate::tools::{ToolOutput, ToolRegistry};

/// 工具失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 参数校验、外部调用、超时或 panic
    ToolError,
    /// 模型请求了未注册的工具
    UnknownTool,
}

/// 单个工具调用的结果，每个被处理的 ToolCall 恰好一个
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Metric(Metric),
    Raw(Value),
    Stop,
    Failure { kind: FailureKind, message: String },
}

impl ToolOutcome {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        ToolOutcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn result_kind(&self) -> ResultKind {
        match self {
            ToolOutcome::Metric(_) => ResultKind::Metric,
            ToolOutcome::Raw(_) => ResultKind::Raw,
            ToolOutcome::Stop => ResultKind::Stop,
            ToolOutcome::Failure { .. } => ResultKind::Failure,
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, ToolOutcome::Stop)
    }

    /// 序列化为回写给模型的内容（失败也以结构化 JSON 呈现）
    pub fn to_content(&self) -> String {
        let value = match self {
            ToolOutcome::Metric(metric) => metric.to_json(),
            ToolOutcome::Raw(value) => value.clone(),
            ToolOutcome::Stop => json!({"type": "stop_now"}),
            ToolOutcome::Failure { kind, message } => json!({
                "status": "error",
                "kind": kind,
                "message": format!("Tool failed with error: {message}"),
            }),
        };
        value.to_string()
    }

    pub fn to_message(&self, call_id: &str) -> Message {
        Message::tool_result(call_id, self.result_kind(), self.to_content())
    }
}

impl From<ToolOutput> for ToolOutcome {
    fn from(output: ToolOutput) -> Self {
        match output {
            ToolOutput::Metric(metric) => ToolOutcome::Metric(metric),
            ToolOutput::Raw(value) => ToolOutcome::Raw(value),
            ToolOutput::Stop => ToolOutcome::Stop,
        }
    }
}

/// 工具分发器：持有注册表与单次调用超时
#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 依次执行；返回的 call_id 为输入的有序子集，Stop 之后的调用不出现
    pub async fn dispatch(&self, requested: &[ToolCall]) -> Vec<(ToolCall, ToolOutcome)> {
        let mut results = Vec::with_capacity(requested.len());
        for call in requested {
            let outcome = self.invoke_one(call).await;
            let stop = outcome.is_stop();
            results.push((call.clone(), outcome));
            if stop {
                let dropped = requested.len() - results.len();
                if dropped > 0 {
                    tracing::info!(dropped, "stop signal received, dropping remaining calls");
                }
                break;
            }
        }
        results
    }

    async fn invoke_one(&self, call: &ToolCall) -> ToolOutcome {
        let start = Instant::now();
        let args = Value::Object(call.arguments.clone());
        let args_preview = args_preview(&args);

        let outcome = match self.registry.get(&call.name) {
            None => ToolOutcome::failure(
                FailureKind::UnknownTool,
                format!("Unknown tool: {}", call.name),
            ),
            Some(tool) => {
                let guarded = AssertUnwindSafe(tool.invoke(args)).catch_unwind();
                match timeout(self.timeout, guarded).await {
                    Ok(Ok(Ok(output))) => output.into(),
                    Ok(Ok(Err(e))) => ToolOutcome::failure(FailureKind::ToolError, e),
                    Ok(Err(panic)) => ToolOutcome::failure(
                        FailureKind::ToolError,
                        format!("tool panicked: {}", panic_message(panic.as_ref())),
                    ),
                    Err(_) => ToolOutcome::failure(
                        FailureKind::ToolError,
                        format!("timed out after {}s", self.timeout.as_secs()),
                    ),
                }
            }
        };

        let (ok, kind) = match &outcome {
            ToolOutcome::Metric(_) => (true, "metric"),
            ToolOutcome::Raw(_) => (true, "raw"),
            ToolOutcome::Stop => (true, "stop"),
            ToolOutcome::Failure { kind: FailureKind::ToolError, .. } => (false, "tool_error"),
            ToolOutcome::Failure { kind: FailureKind::UnknownTool, .. } => (false, "unknown_tool"),
        };
        let audit = json!({
            "event": "tool_audit",
            "tool": call.name,
            "call_id": call.call_id,
            "ok": ok,
            "outcome": kind,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        if ok {
            tracing::info!(audit = %audit, "tool");
        } else {
            tracing::warn!(audit = %audit, "tool");
        }
        outcome
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
