//! 通用工具：停止信号、限流等待、字符串浮点四则运算

use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::{args_schema, parse_args, Tool, ToolOutput};

/// 停止工具：没有进展时由模型调用，立即结束循环
pub struct StopNowTool;

#[async_trait]
impl Tool for StopNowTool {
    fn name(&self) -> &str {
        "util_stop_now"
    }

    fn description(&self) -> &str {
        "This will stop the program loop. To be used when no progress is being made towards the end goal"
    }

    async fn invoke(&self, _args: Value) -> Result<ToolOutput, String> {
        Ok(ToolOutput::Stop)
    }
}

#[derive(Deserialize, JsonSchema)]
struct WaitArgs {
    /// 等待秒数，默认 5；超过上限时截断
    #[serde(default = "default_wait_seconds")]
    seconds: u64,
}

fn default_wait_seconds() -> u64 {
    5
}

const MAX_WAIT_SECONDS: u64 = 60;
/// 等待结束后留给分发器的余量
const WAIT_MARGIN_SECS: u64 = 2;

/// 等待工具：给外部 API 的限流窗口留出恢复时间
///
/// 上限始终低于分发器的单次调用超时，否则长等待会被判为工具失败。
#[derive(Debug, Clone, Copy)]
pub struct WaitTool {
    max_seconds: u64,
}

impl WaitTool {
    /// 按单次调用超时（秒）推出等待上限
    pub fn within(tool_timeout_secs: u64) -> Self {
        Self {
            max_seconds: tool_timeout_secs
                .saturating_sub(WAIT_MARGIN_SECS)
                .min(MAX_WAIT_SECONDS),
        }
    }

    pub fn max_seconds(&self) -> u64 {
        self.max_seconds
    }
}

#[async_trait]
impl Tool for WaitTool {
    fn name(&self) -> &str {
        "util_wait_seconds"
    }

    fn description(&self) -> &str {
        "Wait for a number of seconds (default 5, capped below the tool timeout) and return. \
Use it to wait for API rate limits to reset"
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<WaitArgs>()
    }

    async fn invoke(&self, args: Value) -> Result<ToolOutput, String> {
        let args: WaitArgs = parse_args(args)?;
        let seconds = args.seconds.min(self.max_seconds);
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        Ok(ToolOutput::Raw(serde_json::json!({"waited_seconds": seconds})))
    }
}

#[derive(Deserialize, JsonSchema)]
struct PairArgs {
    /// 浮点数字符串，如 "3.14"、"1.2e3"、"0x1a"
    a: String,
    b: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathOp {
    Sum,
    Subtract,
    Multiply,
    Divide,
}

/// 字符串浮点运算工具（模型自己算数不可靠）
pub struct MathTool {
    op: MathOp,
}

impl MathTool {
    pub fn new(op: MathOp) -> Self {
        Self { op }
    }
}

#[async_trait]
impl Tool for MathTool {
    fn name(&self) -> &str {
        match self.op {
            MathOp::Sum => "util_math_sum_numbers",
            MathOp::Subtract => "util_math_subtract_numbers",
            MathOp::Multiply => "util_math_multiply_numbers",
            MathOp::Divide => "util_math_divide_numbers",
        }
    }

    fn description(&self) -> &str {
        match self.op {
            MathOp::Sum => "Sum two floating point numbers in string format (like '3.14' and '2.0'). Return a floating point in string format",
            MathOp::Subtract => "Subtract b from a, both floating point numbers in string format. Return a floating point in string format",
            MathOp::Multiply => "Multiply two floating point numbers in string format (like '3.14' and '2.0'). Return a floating point in string format",
            MathOp::Divide => "Divide a by b, both floating point numbers in string format. Return a floating point in string format",
        }
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<PairArgs>()
    }

    async fn invoke(&self, args: Value) -> Result<ToolOutput, String> {
        let args: PairArgs = parse_args(args)?;
        let a = str_to_float(&args.a)?;
        let b = str_to_float(&args.b)?;
        let out = match self.op {
            MathOp::Sum => a + b,
            MathOp::Subtract => a - b,
            MathOp::Multiply => a * b,
            MathOp::Divide => {
                if b == 0.0 {
                    return Err("division by zero".to_string());
                }
                a / b
            }
        };
        Ok(ToolOutput::Raw(Value::String(out.to_string())))
    }
}

/// 解析数值字符串：十进制、科学计数法（含 Fortran 风格 `d` 指数）、十六进制整数（可带 0x）
pub fn str_to_float(value: &str) -> Result<f64, String> {
    let s = value.trim().to_lowercase();
    let s = if s.contains('d') && !s.contains('e') {
        fortran_exponent(&s)
    } else {
        s
    };
    if let Ok(v) = s.parse::<f64>() {
        return Ok(v);
    }
    let hex = s.strip_prefix("0x").unwrap_or(&s);
    if !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        if let Ok(v) = u128::from_str_radix(hex, 16) {
            return Ok(v as f64);
        }
    }
    Err(format!("Cannot convert '{value}' to float"))
}

/// "1.23d04" -> "1.23e04"（仅替换首个位于数字与指数之间的 d）
fn fortran_exponent(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    for i in 1..chars.len() {
        if chars[i] != 'd' || !chars[i - 1].is_ascii_digit() {
            continue;
        }
        let mut j = i + 1;
        if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].is_ascii_digit() {
            let mut out = chars.clone();
            out[i] = 'e';
            return out.into_iter().collect();
        }
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_str_to_float_formats() {
        assert_eq!(str_to_float("123.45").unwrap(), 123.45);
        assert_eq!(str_to_float(" -0.001 ").unwrap(), -0.001);
        assert_eq!(str_to_float("1.2e3").unwrap(), 1200.0);
        assert_eq!(str_to_float("3.4d05").unwrap(), 340000.0);
        assert_eq!(str_to_float("-8.1d-2").unwrap(), -0.081);
        assert_eq!(str_to_float("0x1a").unwrap(), 26.0);
        assert_eq!(str_to_float("1A").unwrap(), 26.0);
        assert!(str_to_float("wei").is_err());
    }

    #[tokio::test]
    async fn test_math_tools() {
        let sum = MathTool::new(MathOp::Sum)
            .invoke(json!({"a": "1.5", "b": "2"}))
            .await
            .unwrap();
        assert_eq!(sum, ToolOutput::Raw(json!("3.5")));

        let div = MathTool::new(MathOp::Divide)
            .invoke(json!({"a": "1", "b": "0"}))
            .await;
        assert_eq!(div.err().as_deref(), Some("division by zero"));

        let bad = MathTool::new(MathOp::Multiply).invoke(json!({"a": "1"})).await;
        assert!(bad.err().unwrap().starts_with("invalid arguments"));
    }

    #[tokio::test]
    async fn test_stop_tool() {
        assert_eq!(StopNowTool.invoke(Value::Null).await.unwrap(), ToolOutput::Stop);
    }

    #[tokio::test]
    async fn test_wait_tool_zero_seconds() {
        let out = WaitTool::within(30).invoke(json!({"seconds": 0})).await.unwrap();
        assert_eq!(out, ToolOutput::Raw(json!({"waited_seconds": 0})));
    }

    #[test]
    fn test_wait_cap_stays_under_timeout() {
        assert_eq!(WaitTool::within(30).max_seconds(), 28);
        assert_eq!(WaitTool::within(600).max_seconds(), MAX_WAIT_SECONDS);
        assert_eq!(WaitTool::within(1).max_seconds(), 0);
    }

    #[tokio::test]
    async fn test_long_wait_is_clamped_not_timed_out() {
        use crate::tools::{ToolDispatcher, ToolOutcome, ToolRegistry};
        use std::sync::Arc;

        let registry = ToolRegistry::builder().register(WaitTool::within(1)).build();
        let dispatcher = ToolDispatcher::new(Arc::new(registry), 1);
        let call = crate::memory::ToolCall::new("util_wait_seconds", json!({"seconds": 600}), "w1");
        let results = dispatcher.dispatch(&[call]).await;
        assert_eq!(results[0].1, ToolOutcome::Raw(json!({"waited_seconds": 0})));
    }
}
