//! 记忆层：持久对话日志、token 预算、历史窗口

pub mod conversation;
pub mod token_budget;
pub mod window;

pub use conversation::{tool_results_are_linked, Message, ResultKind, Role, ToolCall};
pub use token_budget::{TokenBudget, TokenEstimator, Tokenizer};
pub use window::{select_window, HistoryWindower};
