//! 工具层：注册表、参数 schema、分发器与内置工具

pub mod dispatcher;
pub mod metrics;
pub mod registry;
pub mod schema;
pub mod utility;

pub use dispatcher::{FailureKind, ToolDispatcher, ToolOutcome};
pub use metrics::{
    BridgedAssetExposureTool, ExoticAssetExposureTool, LowTvlProtocolConcentrationTool,
    PortfolioChurnRateTool, PortfolioConcentrationTool,
};
pub use registry::{Tool, ToolOutput, ToolRegistry, ToolRegistryBuilder, ToolSpec};
pub use schema::{args_schema, parse_args};
pub use utility::{MathOp, MathTool, StopNowTool, WaitTool};

/// 默认单次工具调用超时（秒），与 `tools.tool_timeout_secs` 的默认值一致
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;

/// 默认超时下的内置工具集
pub fn default_registry() -> ToolRegistry {
    builtin_registry(DEFAULT_TOOL_TIMEOUT_SECS)
}

/// 进程启动时构建的内置工具集；等待工具的上限随超时收紧
pub fn builtin_registry(tool_timeout_secs: u64) -> ToolRegistry {
    ToolRegistry::builder()
        .register(StopNowTool)
        .register(WaitTool::within(tool_timeout_secs))
        .register(MathTool::new(MathOp::Sum))
        .register(MathTool::new(MathOp::Subtract))
        .register(MathTool::new(MathOp::Multiply))
        .register(MathTool::new(MathOp::Divide))
        .register(PortfolioConcentrationTool)
        .register(ExoticAssetExposureTool)
        .register(PortfolioChurnRateTool)
        .register(LowTvlProtocolConcentrationTool)
        .register(BridgedAssetExposureTool)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_targets() {
        let registry = default_registry();
        assert_eq!(registry.len(), 11);
        let targets = registry.target_metrics();
        assert_eq!(targets.len(), 5);
        assert!(targets.contains(metrics::PORTFOLIO_CHURN_RATE));
        assert!(targets.contains(metrics::LOW_TVL_PROTOCOL_CONCENTRATION));
        assert!(targets.contains(metrics::BRIDGED_ASSET_EXPOSURE));
    }
}
