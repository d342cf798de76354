//! AgentState：检查点的基本单元
//!
//! 只含可序列化的数据；模型客户端等运行时句柄在加载后按 ModelConfig 重建。

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::AgentError;
use crate::memory::Message;

/// 一个已命名的结构化分析结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(rename = "metric_name")]
    pub name: String,
    pub data: Value,
}

impl Metric {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// 展平为 `{"metric_name": ..., <data 字段>}`，供工具结果与最终输出使用
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        out.insert("metric_name".to_string(), Value::String(self.name.clone()));
        match &self.data {
            Value::Object(fields) => {
                for (k, v) in fields {
                    if k != "metric_name" {
                        out.insert(k.clone(), v.clone());
                    }
                }
            }
            other => {
                out.insert("value".to_string(), other.clone());
            }
        }
        Value::Object(out)
    }
}

/// 模型配置：检查点中只保存这些字段，恢复时据此重建客户端
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_tokens_per_prompt")]
    pub max_tokens_per_prompt: usize,
    #[serde(default = "default_max_tokens_per_message")]
    pub max_tokens_per_message: Option<usize>,
}

fn default_max_tokens_per_prompt() -> usize {
    100_000
}

fn default_max_tokens_per_message() -> Option<usize> {
    Some(20_000)
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "gpt-4o".to_string(),
            temperature: 0.0,
            max_tokens_per_prompt: default_max_tokens_per_prompt(),
            max_tokens_per_message: default_max_tokens_per_message(),
        }
    }
}

/// 一次运行的完整状态
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// 分析对象（钱包地址）
    pub subject_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// 按指标名去重，后写覆盖
    #[serde(default)]
    pub metrics: BTreeMap<String, Metric>,
    #[serde(default)]
    pub turn_count: u32,
    pub max_turns: u32,
    pub max_messages: usize,
    #[serde(default)]
    pub model: ModelConfig,
}

impl AgentState {
    pub fn new(
        subject_id: impl Into<String>,
        max_turns: u32,
        max_messages: usize,
        model: ModelConfig,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            messages: Vec::new(),
            metrics: BTreeMap::new(),
            turn_count: 0,
            max_turns,
            max_messages,
            model,
        }
    }

    pub fn metric_names(&self) -> BTreeSet<String> {
        self.metrics.keys().cloned().collect()
    }

    pub fn merge_metric(&mut self, metric: Metric) {
        self.metrics.insert(metric.name.clone(), metric);
    }

    pub fn metrics_json(&self) -> Vec<Value> {
        self.metrics.values().map(Metric::to_json).collect()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn to_json(&self) -> Result<String, AgentError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, AgentError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ResultKind, ToolCall};
    use serde_json::json;

    #[test]
    fn test_metric_to_json_flattens_object() {
        let m = Metric::new("Portfolio Concentration Index (HHI)", json!({"hhi_score": 0.42}));
        assert_eq!(
            m.to_json(),
            json!({"metric_name": "Portfolio Concentration Index (HHI)", "hhi_score": 0.42})
        );
        let scalar = Metric::new("x", json!(1.5));
        assert_eq!(scalar.to_json(), json!({"metric_name": "x", "value": 1.5}));
    }

    #[test]
    fn test_merge_metric_last_writer_wins() {
        let mut state = AgentState::new("0xabc", 10, 7, ModelConfig::default());
        state.merge_metric(Metric::new("a", json!(1)));
        state.merge_metric(Metric::new("a", json!(2)));
        assert_eq!(state.metrics.len(), 1);
        assert_eq!(state.metrics["a"].data, json!(2));
    }

    #[test]
    fn test_state_json_round_trip_is_stable() {
        let mut state = AgentState::new("0xabc", 10, 7, ModelConfig::default());
        state.turn_count = 2;
        state.messages.push(Message::assistant_with_calls(
            "",
            vec![ToolCall::new("util_math_divide_numbers", json!({"a": "1", "b": "3"}), "c1")],
        ));
        state.messages.push(Message::tool_result("c1", ResultKind::Raw, "0.3333333333333333"));
        state.merge_metric(Metric::new("m", json!({"v": 0.1 + 0.2})));

        let first = state.to_json().unwrap();
        let reloaded = AgentState::from_json(&first).unwrap();
        assert_eq!(reloaded, state);
        assert_eq!(reloaded.to_json().unwrap(), first);
    }
}
