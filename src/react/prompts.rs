//! Prompt 模板
//!
//! 内置 system / 任务 / 结论三份模板；可从目录中的 system.md、input.md、risk.md 覆盖。
//! 占位符：`{subject_id}`（任务模板）与 `{metrics_blob}`（结论模板）。

use std::path::Path;

use serde_json::{json, Value};

const SYSTEM_PROMPT: &str = "You are a crypto wallet risk analyst. \
There are no data-fetching tools: every metric tool takes the wallet data as arguments, so you \
supply the holdings, DeFi positions and outgoing transactions yourself from what you know about \
the wallet. Call each metric tool exactly once, and call several per turn when they do not \
depend on each other. Use the arithmetic tools when you need exact sums or ratios, and \
util_wait_seconds to back off when throttled. If the wallet cannot be analysed, call util_stop_now.";

const TASK_PROMPT: &str = "Analyse the wallet {subject_id}. \
Compute all risk metrics from its holdings, DeFi protocol positions and recent outgoing transactions.";

const VERDICT_PROMPT: &str = "You are given risk metrics computed for a crypto wallet:\n\n\
{metrics_blob}\n\n\
Give a global risk score from 0 (very safe investor) to 100 (complete defi degen) and a short \
justification in English. Answer with a single JSON object of the form \
{\"risk_score\": <number>, \"justification\": \"<text>\"} and nothing else.";

/// 一次运行使用的三份模板
#[derive(Debug, Clone, PartialEq)]
pub struct PromptSet {
    pub system: String,
    pub task: String,
    pub verdict: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            system: SYSTEM_PROMPT.to_string(),
            task: TASK_PROMPT.to_string(),
            verdict: VERDICT_PROMPT.to_string(),
        }
    }
}

impl PromptSet {
    /// 从目录加载；缺失的文件沿用内置模板
    pub fn from_dir(dir: &Path) -> std::io::Result<Self> {
        let mut prompts = Self::default();
        for (file, slot) in [
            ("system.md", &mut prompts.system),
            ("input.md", &mut prompts.task),
            ("risk.md", &mut prompts.verdict),
        ] {
            let path = dir.join(file);
            if path.exists() {
                *slot = std::fs::read_to_string(&path)?;
                tracing::debug!(path = %path.display(), "loaded prompt override");
            }
        }
        Ok(prompts)
    }

    pub fn task_for(&self, subject_id: &str) -> String {
        self.task.replace("{subject_id}", subject_id)
    }

    /// 把指标列表以 `{"data": [...]}` 形式缩进嵌入结论模板
    pub fn verdict_for(&self, metrics: &[Value]) -> String {
        let blob = serde_json::to_string_pretty(&json!({ "data": metrics }))
            .unwrap_or_else(|_| "{}".to_string());
        self.verdict.replace("{metrics_blob}", &blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_are_filled() {
        let prompts = PromptSet::default();
        assert!(prompts.task_for("0xabc").contains("0xabc"));
        let verdict = prompts.verdict_for(&[json!({"metric_name": "m", "v": 1})]);
        assert!(verdict.contains("\"metric_name\": \"m\""));
        assert!(!verdict.contains("{metrics_blob}"));
    }

    #[test]
    fn test_from_dir_overrides_present_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("input.md"), "Look at {subject_id} carefully").unwrap();

        let prompts = PromptSet::from_dir(dir.path()).unwrap();
        assert_eq!(prompts.task_for("0x1"), "Look at 0x1 carefully");
        assert_eq!(prompts.system, PromptSet::default().system);
    }

    #[test]
    fn test_system_prompt_names_only_registered_tools() {
        let registry = crate::tools::default_registry();
        let system = PromptSet::default().system;
        let named: Vec<&str> = system
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .filter(|w| w.starts_with("util_") || w.starts_with("metric_"))
            .collect();
        assert!(!named.is_empty());
        for name in named {
            assert!(registry.get(name).is_some(), "{name} is not registered");
        }
    }
}
