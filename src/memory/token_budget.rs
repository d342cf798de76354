//! Token 预算控制
//!
//! 单条消息与整个 prompt 的 token 上限；超限时从消息末尾截断，保留最早的 token。

/// 分词器抽象：计数与按 token 截断
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;

    /// 截断到至多 max_tokens 个 token，保留开头部分
    fn truncate(&self, text: &str, max_tokens: usize) -> String;
}

/// Token 估算器（简单的字符计数近似）
///
/// 英文约 4 字符/token，中文等非 ASCII 约 1.5 字符/token。
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量（非空文本至少 1）
    pub fn estimate(text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let (ascii, non_ascii) = text.chars().fold((0usize, 0usize), |(a, n), c| {
            if c.is_ascii() {
                (a + 1, n)
            } else {
                (a, n + 1)
            }
        });
        raw_estimate(ascii, non_ascii).max(1)
    }
}

fn raw_estimate(ascii: usize, non_ascii: usize) -> usize {
    ascii / 4 + (non_ascii as f64 / 1.5).ceil() as usize
}

impl Tokenizer for TokenEstimator {
    fn count(&self, text: &str) -> usize {
        Self::estimate(text)
    }

    fn truncate(&self, text: &str, max_tokens: usize) -> String {
        if Self::estimate(text) <= max_tokens {
            return text.to_string();
        }
        let mut ascii = 0;
        let mut non_ascii = 0;
        let mut end = 0;
        for (idx, c) in text.char_indices() {
            if c.is_ascii() {
                ascii += 1;
            } else {
                non_ascii += 1;
            }
            if raw_estimate(ascii, non_ascii) > max_tokens {
                break;
            }
            end = idx + c.len_utf8();
        }
        text[..end].to_string()
    }
}

/// 窗口内消息的 token 预算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    /// 单条消息上限；None 表示不限
    pub per_message: Option<usize>,
    /// 整个窗口的上限
    pub per_prompt: usize,
}

impl TokenBudget {
    pub fn new(per_prompt: usize, per_message: Option<usize>) -> Self {
        Self {
            per_message,
            per_prompt,
        }
    }

    /// 扣除窗口之外已占用的 token（例如固定的 system + 任务消息）
    pub fn reserve(self, tokens: usize) -> Self {
        Self {
            per_prompt: self.per_prompt.saturating_sub(tokens),
            ..self
        }
    }

    /// 单条消息在窗口含 `count` 条消息时的有效上限：
    /// 先取 per_message，再按 per_prompt 平均分摊
    pub fn message_limit(&self, count: usize) -> usize {
        let share = if count == 0 {
            self.per_prompt
        } else {
            self.per_prompt / count
        };
        match self.per_message {
            Some(limit) => limit.min(share),
            None => share,
        }
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new(100_000, Some(20_000))
    }
}
