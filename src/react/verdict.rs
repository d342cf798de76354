//! 最终结论的解析与校验
//!
//! 模型回复可能包在 ``` 代码块里：先剥掉围栏，再严格解析为 RiskVerdict。
//! 解析或校验失败不会中止运行，而是产出 `{error, raw, metrics}` 兜底结果。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// 风险结论：score ∈ [0, 100]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskVerdict {
    pub risk_score: f64,
    pub justification: String,
}

#[derive(Error, Debug)]
pub enum VerdictError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Validation(String),
}

/// 去掉首尾的 ``` / ```json 围栏；没有围栏时原样返回（仅 trim）
pub fn strip_code_fence(raw: &str) -> &str {
    let text = raw.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // 围栏后的语言标记占据首行剩余部分
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

pub fn parse_verdict(raw: &str) -> Result<RiskVerdict, VerdictError> {
    let verdict: RiskVerdict = serde_json::from_str(strip_code_fence(raw))?;
    if !verdict.risk_score.is_finite() || !(0.0..=100.0).contains(&verdict.risk_score) {
        return Err(VerdictError::Validation(format!(
            "risk_score must be within [0, 100], got {}",
            verdict.risk_score
        )));
    }
    Ok(verdict)
}

/// 组装最终输出：合法结论附带指标，否则为兜底错误对象
pub fn finalize_payload(raw: &str, metrics: Vec<Value>) -> Value {
    match parse_verdict(raw) {
        Ok(verdict) => json!({
            "risk_score": verdict.risk_score,
            "justification": verdict.justification,
            "metrics": metrics,
        }),
        Err(e) => {
            tracing::warn!(error = %e, "verdict validation failed");
            json!({
                "error": format!("Failed to validate: {e}"),
                "raw": strip_code_fence(raw),
                "metrics": metrics,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{}\n```\n"), "{}");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json\n{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn test_parse_valid_verdict() {
        let v = parse_verdict("```json\n{\"risk_score\": 42, \"justification\": \"ok\"}\n```").unwrap();
        assert_eq!(v.risk_score, 42.0);
        assert_eq!(v.justification, "ok");
    }

    #[test]
    fn test_score_out_of_range_is_rejected() {
        let err = parse_verdict(r#"{"risk_score": 140, "justification": "x"}"#).unwrap_err();
        assert!(matches!(err, VerdictError::Validation(_)));
    }

    #[test]
    fn test_unparsable_text_yields_error_payload() {
        let payload = finalize_payload("I think this wallet is risky.", vec![json!({"metric_name": "m"})]);
        assert!(payload["error"].as_str().unwrap().starts_with("Failed to validate"));
        assert_eq!(payload["raw"], "I think this wallet is risky.");
        assert_eq!(payload["metrics"].as_array().unwrap().len(), 1);
        assert!(payload.get("risk_score").is_none());
    }

    #[test]
    fn test_valid_payload_carries_metrics() {
        let payload = finalize_payload(r#"{"risk_score": 10.5, "justification": "calm"}"#, vec![]);
        assert_eq!(payload["risk_score"], json!(10.5));
        assert_eq!(payload["metrics"], json!([]));
    }
}
