//! 脚本化 Mock LLM 客户端（用于测试与离线演示，无需 API）
//!
//! 按顺序弹出预设回复；脚本耗尽后返回不带工具调用的纯文本。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::{AgentError, ModelConfig};
use crate::llm::{LlmClient, ModelProvider};
use crate::memory::{Message, ToolCall};
use crate::tools::ToolSpec;

/// Mock 客户端：think 回复与最终结论各一个队列
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<Message, String>>>,
    verdicts: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<Vec<Message>>>,
    next_call_id: AtomicU64,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一轮工具调用回复；call_id 自动生成
    pub fn then_tools(self, calls: Vec<(&str, Value)>) -> Self {
        let calls = calls
            .into_iter()
            .map(|(name, args)| {
                let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
                ToolCall::new(name, args, format!("call_{id}"))
            })
            .collect();
        self.push_reply(Ok(Message::assistant_with_calls("", calls)))
    }

    /// 追加一轮纯文本回复（不请求工具）
    pub fn then_text(self, text: &str) -> Self {
        self.push_reply(Ok(Message::assistant(text)))
    }

    /// 追加一次模型调用失败
    pub fn then_error(self, error: &str) -> Self {
        self.push_reply(Err(error.to_string()))
    }

    /// 设置最终结论的原始文本
    pub fn with_verdict(self, raw: &str) -> Self {
        self.lock_verdicts().push_back(Ok(raw.to_string()));
        self
    }

    pub fn with_verdict_error(self, error: &str) -> Self {
        self.lock_verdicts().push_back(Err(error.to_string()));
        self
    }

    /// 每次调用收到的完整 prompt（按调用顺序）
    pub fn prompts(&self) -> Vec<Vec<Message>> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// 离线演示脚本：两轮算出五个内置指标后给出结论
    pub fn demo() -> Self {
        Self::new()
            .then_tools(vec![
                ("metric_calculate_portfolio_concentration", json!({"asset_values": [7000.0, 12.5, 150.0]})),
                (
                    "metric_calculate_exotic_asset_exposure",
                    json!({"assets": [
                        {"symbol": "WETH", "usd_value": 7000.0, "market_cap_rank": 2},
                        {"symbol": "PEPE", "usd_value": 12.5, "market_cap_rank": 95},
                        {"symbol": "UNKNOWN_TKN", "usd_value": 150.0, "market_cap_rank": null}
                    ]}),
                ),
                (
                    "metric_calculate_bridged_asset_exposure",
                    json!({"assets": [
                        {"symbol": "WETH", "usd_value": 7000.0, "is_bridged": false},
                        {"symbol": "PEPE", "usd_value": 12.5, "is_bridged": false},
                        {"symbol": "UNKNOWN_TKN", "usd_value": 150.0, "is_bridged": true}
                    ]}),
                ),
            ])
            .then_tools(vec![
                (
                    "metric_calculate_portfolio_churn_rate",
                    json!({
                        "outgoing_transactions": [{"timestamp": "2025-01-01T00:00:00Z", "usd_value": 800.0}],
                        "start_period_value_usd": 7500.0,
                        "end_period_value_usd": 7162.5,
                        "period_days": 30
                    }),
                ),
                (
                    "metric_calculate_low_tvl_protocol_concentration",
                    json!({"positions": [
                        {"protocol_name": "Aave", "usd_value": 3000.0, "protocol_tvl_usd": 12000000000.0},
                        {"protocol_name": "TinyFarm", "usd_value": 150.0, "protocol_tvl_usd": 800000.0}
                    ]}),
                ),
            ])
            .with_verdict(
                "```json\n{\"risk_score\": 38, \"justification\": \"Concentrated in WETH with small exotic exposure.\"}\n```",
            )
    }

    fn push_reply(self, reply: Result<Message, String>) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
        self
    }

    fn lock_verdicts(&self) -> MutexGuard<'_, VecDeque<Result<String, String>>> {
        self.verdicts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, messages: &[Message]) {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(messages.to_vec());
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn invoke(&self, messages: &[Message], _tools: &[ToolSpec]) -> Result<Message, String> {
        self.record(messages);
        let next = self.replies.lock().ok().and_then(|mut r| r.pop_front());
        next.unwrap_or_else(|| Ok(Message::assistant("Nothing left to do.")))
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.record(messages);
        let next = self.lock_verdicts().pop_front();
        next.unwrap_or_else(|| {
            Ok(r#"{"risk_score": 50, "justification": "No scripted verdict."}"#.to_string())
        })
    }
}

/// 每次运行构建一个新的离线演示客户端（`--mock` 与 `provider = "mock"`）
#[derive(Debug, Default, Clone, Copy)]
pub struct DemoModelProvider;

impl ModelProvider for DemoModelProvider {
    fn build(&self, _config: &ModelConfig) -> Result<Arc<dyn LlmClient>, AgentError> {
        Ok(Arc::new(ScriptedLlmClient::demo()))
    }
}
