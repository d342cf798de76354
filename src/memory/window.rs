//! 历史窗口：限制发送给模型的消息条数与 token 数
//!
//! 只产出持久日志的一个后缀视图，不修改日志本身。

use crate::memory::{Message, TokenBudget, Tokenizer};

/// 选出至多 max_messages 条的后缀；若切点落在某个工具结果上，
/// 向前扩展到发起该调用的 assistant 消息（可超过 max_messages）
pub fn select_window(log: &[Message], max_messages: usize) -> &[Message] {
    if max_messages == 0 || log.is_empty() {
        return &[];
    }
    let mut start = log.len().saturating_sub(max_messages);
    while start > 0 && log[start].is_tool_result() {
        start -= 1;
    }
    // 日志开头的孤立工具结果找不到请求方，直接丢弃
    while start < log.len() && log[start].is_tool_result() {
        start += 1;
    }
    &log[start..]
}

/// 历史窗口器：条数裁剪 + 单条消息 token 截断
pub struct HistoryWindower<'a> {
    tokenizer: &'a dyn Tokenizer,
    budget: TokenBudget,
}

impl<'a> HistoryWindower<'a> {
    pub fn new(tokenizer: &'a dyn Tokenizer, budget: TokenBudget) -> Self {
        Self { tokenizer, budget }
    }

    pub fn window(&self, log: &[Message], max_messages: usize) -> Vec<Message> {
        let selected = select_window(log, max_messages);
        let limit = self.budget.message_limit(selected.len());
        selected
            .iter()
            .map(|msg| {
                if self.tokenizer.count(&msg.content) <= limit {
                    return msg.clone();
                }
                let mut truncated = msg.clone();
                truncated.content = self.tokenizer.truncate(&msg.content, limit);
                truncated
            })
            .collect()
    }
}
