//! LLM 客户端抽象
//!
//! 引擎把模型当黑盒：给定对话，返回一条 assistant 消息（可能携带工具调用）。
//! 每次运行按检查点中的 ModelConfig 由 ModelProvider 构建自己的客户端，运行之间不共享可变状态。

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{AgentError, ModelConfig};
use crate::memory::Message;
use crate::tools::ToolSpec;

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 绑定工具模式：返回的 assistant 消息可携带 tools 中声明的工具调用
    async fn invoke(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<Message, String>;

    /// 纯文本完成（用于生成最终结论）
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;
}

/// 按模型配置构建客户端（新运行与检查点恢复都走这里）
pub trait ModelProvider: Send + Sync {
    fn build(&self, config: &ModelConfig) -> Result<Arc<dyn LlmClient>, AgentError>;
}

/// 总是返回同一个客户端，用于测试与离线演示
pub struct FixedModelProvider {
    client: Arc<dyn LlmClient>,
}

impl FixedModelProvider {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }
}

impl ModelProvider for FixedModelProvider {
    fn build(&self, _config: &ModelConfig) -> Result<Arc<dyn LlmClient>, AgentError> {
        Ok(self.client.clone())
    }
}
