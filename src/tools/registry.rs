//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / invoke），
//! 启动时一次性构建，之后只读；ToolDispatcher 通过它按名查找。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::core::Metric;

/// 工具产出的结果：指标 / 任意结构化数据 / 停止信号
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Metric(Metric),
    Raw(Value),
    Stop,
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（模型请求中的 name 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 若该工具产出指标，返回其稳定的指标名；终止判定以此构成目标集合
    fn metric_name(&self) -> Option<&str> {
        None
    }

    /// 执行工具；参数校验失败或外部调用失败都以 Err 返回
    async fn invoke(&self, args: Value) -> Result<ToolOutput, String>;
}

/// 绑定给模型的工具声明
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 工具注册表：构建后不可变，可在多个运行之间以 Arc 共享
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 能产出的全部指标名（终止判定的目标集合）
    pub fn target_metrics(&self) -> BTreeSet<String> {
        self.tools
            .values()
            .filter_map(|t| t.metric_name().map(str::to_string))
            .collect()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistryBuilder {
    /// 注册工具；同名后注册者覆盖
    pub fn register(mut self, tool: impl Tool + 'static) -> Self {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), Arc::new(tool)).is_some() {
            tracing::warn!(tool = %name, "tool registered twice, keeping the last one");
        }
        self
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(&'static str, Option<&'static str>);

    #[async_trait]
    impl Tool for Fixed {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "fixed"
        }
        fn metric_name(&self) -> Option<&str> {
            self.1
        }
        async fn invoke(&self, _args: Value) -> Result<ToolOutput, String> {
            Ok(ToolOutput::Raw(json!(1)))
        }
    }

    #[test]
    fn test_registry_targets_and_specs() {
        let registry = ToolRegistry::builder()
            .register(Fixed("metric_a", Some("A")))
            .register(Fixed("metric_b", Some("B")))
            .register(Fixed("util_x", None))
            .build();
        assert_eq!(registry.len(), 3);
        let targets: Vec<_> = registry.target_metrics().into_iter().collect();
        assert_eq!(targets, vec!["A".to_string(), "B".to_string()]);
        let specs = registry.specs();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].parameters["type"], "object");
        assert!(registry.get("util_x").is_some());
        assert!(registry.get("nope").is_none());
    }
}
