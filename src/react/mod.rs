//! 推理层：回合状态机、prompt 模板、最终结论解析

pub mod controller;
pub mod prompts;
pub mod verdict;

pub use controller::{decide, ConversationController, Cycle, Decision, Phase, StopReason};
pub use prompts::PromptSet;
pub use verdict::{finalize_payload, parse_verdict, strip_code_fence, RiskVerdict, VerdictError};
