//! 核心：运行状态、指标、模型配置、错误与引擎构建

pub mod builder;
pub mod error;
pub mod state;

pub use builder::{initial_state, EngineBuilder, RunOverrides};
pub use error::AgentError;
pub use state::{AgentState, Metric, ModelConfig};
