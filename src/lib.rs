//! Warden - 钱包风险分析智能体引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 运行状态、错误类型、引擎构建
//! - **memory**: 对话日志、token 预算、历史窗口
//! - **tools**: 工具注册表、分发器与内置工具
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **react**: 回合状态机、prompt、最终结论
//! - **checkpoint**: 按 (thread, turn) 的状态快照
//! - **jobs**: 后台任务与事件流

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod jobs;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;
