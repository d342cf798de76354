//! LLM 层：客户端抽象与实现（OpenAI 兼容 / 脚本化 Mock）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{DemoModelProvider, ScriptedLlmClient};
pub use openai::{OpenAiClient, OpenAiProvider};
pub use traits::{FixedModelProvider, LlmClient, ModelProvider};
