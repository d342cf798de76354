//! 指标工具：由模型组装输入后调用，产出带稳定名称的 Metric
//!
//! 指标名构成终止判定的目标集合；具体公式只是参考实现。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::Metric;
use crate::tools::{args_schema, parse_args, Tool, ToolOutput};

pub const PORTFOLIO_CONCENTRATION: &str = "Portfolio Concentration Index (HHI)";
pub const EXOTIC_ASSET_EXPOSURE: &str = "Exotic & Unproven Asset Exposure";
pub const PORTFOLIO_CHURN_RATE: &str = "Portfolio Churn Rate";
pub const LOW_TVL_PROTOCOL_CONCENTRATION: &str = "Low-TVL Protocol Concentration";
pub const BRIDGED_ASSET_EXPOSURE: &str = "Bridged Asset Exposure";

/// 排名在此之后（或无排名）的资产视为 exotic
const EXOTIC_RANK_THRESHOLD: u32 = 200;

/// 未指定阈值时，TVL 低于 500 万美元的协议视为低 TVL
const DEFAULT_TVL_THRESHOLD_USD: f64 = 5_000_000.0;

/// part / total 的百分比；total 为 0 时记 0
fn percentage(part: f64, total: f64) -> f64 {
    if total == 0.0 {
        0.0
    } else {
        part / total * 100.0
    }
}

#[derive(Deserialize, JsonSchema)]
struct ConcentrationArgs {
    /// 各资产的美元价值
    asset_values: Vec<f64>,
}

/// Herfindahl-Hirschman 指数（0 分散 → 1 集中）
pub struct PortfolioConcentrationTool;

#[async_trait]
impl Tool for PortfolioConcentrationTool {
    fn name(&self) -> &str {
        "metric_calculate_portfolio_concentration"
    }

    fn description(&self) -> &str {
        "Compute the Herfindahl-Hirschman Index of the wallet's USD holdings (0 diversified, 1 concentrated)."
    }

    fn metric_name(&self) -> Option<&str> {
        Some(PORTFOLIO_CONCENTRATION)
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<ConcentrationArgs>()
    }

    async fn invoke(&self, args: Value) -> Result<ToolOutput, String> {
        let args: ConcentrationArgs = parse_args(args)?;
        if args.asset_values.iter().any(|v| *v < 0.0 || !v.is_finite()) {
            return Err("asset_values must be finite and non-negative".to_string());
        }
        let total: f64 = args.asset_values.iter().sum();
        let hhi = if total == 0.0 {
            0.0
        } else {
            args.asset_values.iter().map(|v| (v / total).powi(2)).sum()
        };
        Ok(ToolOutput::Metric(Metric::new(
            PORTFOLIO_CONCENTRATION,
            json!({
                "metric_description": "Sum of squared portfolio weights.",
                "hhi_score": hhi,
                "value_explanation": format!("HHI of {hhi:.4} over {} assets.", args.asset_values.len()),
            }),
        )))
    }
}

#[derive(Deserialize, JsonSchema)]
struct ExoticAsset {
    symbol: String,
    usd_value: f64,
    /// 无排名时为 null
    market_cap_rank: Option<u32>,
}

#[derive(Deserialize, JsonSchema)]
struct ExoticExposureArgs {
    assets: Vec<ExoticAsset>,
}

/// 排名 >200 或无排名资产的美元占比
pub struct ExoticAssetExposureTool;

#[async_trait]
impl Tool for ExoticAssetExposureTool {
    fn name(&self) -> &str {
        "metric_calculate_exotic_asset_exposure"
    }

    fn description(&self) -> &str {
        "Percent of USD value held in assets ranked beyond 200 by market cap or unranked."
    }

    fn metric_name(&self) -> Option<&str> {
        Some(EXOTIC_ASSET_EXPOSURE)
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<ExoticExposureArgs>()
    }

    async fn invoke(&self, args: Value) -> Result<ToolOutput, String> {
        let args: ExoticExposureArgs = parse_args(args)?;
        let total: f64 = args.assets.iter().map(|a| a.usd_value).sum();
        let exotic: Vec<&ExoticAsset> = args
            .assets
            .iter()
            .filter(|a| a.market_cap_rank.map_or(true, |r| r > EXOTIC_RANK_THRESHOLD))
            .collect();
        let pct = percentage(exotic.iter().map(|a| a.usd_value).sum(), total);
        let symbols: Vec<&str> = exotic.iter().map(|a| a.symbol.as_str()).collect();
        Ok(ToolOutput::Metric(Metric::new(
            EXOTIC_ASSET_EXPOSURE,
            json!({
                "metric_description": "Share of value in unranked or low-ranked assets.",
                "percentage_exposure": pct,
                "exotic_symbols": symbols,
                "value_explanation": format!("{pct:.2}% of value in assets ranked >{EXOTIC_RANK_THRESHOLD} or unranked."),
            }),
        )))
    }
}

#[derive(Deserialize, JsonSchema)]
struct Transaction {
    timestamp: DateTime<Utc>,
    /// 转出或换出的美元价值
    usd_value: f64,
}

#[derive(Deserialize, JsonSchema)]
struct ChurnArgs {
    outgoing_transactions: Vec<Transaction>,
    start_period_value_usd: f64,
    end_period_value_usd: f64,
    #[serde(default = "default_period_days")]
    period_days: u32,
}

fn default_period_days() -> u32 {
    30
}

/// 年化换手率：期间转出总额 / 平均持仓价值
pub struct PortfolioChurnRateTool;

#[async_trait]
impl Tool for PortfolioChurnRateTool {
    fn name(&self) -> &str {
        "metric_calculate_portfolio_churn_rate"
    }

    fn description(&self) -> &str {
        "Annualized value of assets swapped or transferred out as a percentage of the wallet's average value over a period."
    }

    fn metric_name(&self) -> Option<&str> {
        Some(PORTFOLIO_CHURN_RATE)
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<ChurnArgs>()
    }

    async fn invoke(&self, args: Value) -> Result<ToolOutput, String> {
        let args: ChurnArgs = parse_args(args)?;
        if args.period_days == 0 {
            return Err("period_days must be positive".to_string());
        }
        let outgoing: f64 = args.outgoing_transactions.iter().map(|t| t.usd_value).sum();
        let average = (args.start_period_value_usd + args.end_period_value_usd) / 2.0;
        let churn = if average == 0.0 {
            0.0
        } else {
            outgoing / average * (365.0 / args.period_days as f64) * 100.0
        };
        let last_seen = args.outgoing_transactions.iter().map(|t| t.timestamp).max();
        Ok(ToolOutput::Metric(Metric::new(
            PORTFOLIO_CHURN_RATE,
            json!({
                "metric_description": "Annualized outgoing value over average wallet value.",
                "churn_rate_percentage": churn,
                "last_transaction": last_seen.map(|t| t.to_rfc3339()),
                "value_explanation": format!(
                    "Annualized churn over the last {} days is {churn:.2}%.",
                    args.period_days
                ),
            }),
        )))
    }
}

#[derive(Deserialize, JsonSchema)]
struct ProtocolPosition {
    protocol_name: String,
    usd_value: f64,
    /// 协议总锁仓价值（美元）
    protocol_tvl_usd: f64,
}

#[derive(Deserialize, JsonSchema)]
struct LowTvlArgs {
    positions: Vec<ProtocolPosition>,
    #[serde(default = "default_tvl_threshold")]
    tvl_threshold_usd: f64,
}

fn default_tvl_threshold() -> f64 {
    DEFAULT_TVL_THRESHOLD_USD
}

/// TVL 低于阈值的协议中持仓的美元占比
pub struct LowTvlProtocolConcentrationTool;

#[async_trait]
impl Tool for LowTvlProtocolConcentrationTool {
    fn name(&self) -> &str {
        "metric_calculate_low_tvl_protocol_concentration"
    }

    fn description(&self) -> &str {
        "Percent of the wallet's DeFi position value held in protocols whose TVL is below a threshold (default $5M)."
    }

    fn metric_name(&self) -> Option<&str> {
        Some(LOW_TVL_PROTOCOL_CONCENTRATION)
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<LowTvlArgs>()
    }

    async fn invoke(&self, args: Value) -> Result<ToolOutput, String> {
        let args: LowTvlArgs = parse_args(args)?;
        let total: f64 = args.positions.iter().map(|p| p.usd_value).sum();
        let low: Vec<&ProtocolPosition> = args
            .positions
            .iter()
            .filter(|p| p.protocol_tvl_usd < args.tvl_threshold_usd)
            .collect();
        let pct = percentage(low.iter().map(|p| p.usd_value).sum(), total);
        let explanation = if total == 0.0 {
            "Wallet has no assets in DeFi protocols.".to_string()
        } else {
            format!(
                "{pct:.2}% of assets are in protocols with less than ${:.0} TVL.",
                args.tvl_threshold_usd
            )
        };
        let protocols: Vec<&str> = low.iter().map(|p| p.protocol_name.as_str()).collect();
        Ok(ToolOutput::Metric(Metric::new(
            LOW_TVL_PROTOCOL_CONCENTRATION,
            json!({
                "metric_description": "Share of DeFi position value in low-TVL protocols.",
                "percentage_exposure": pct,
                "low_tvl_protocols": protocols,
                "value_explanation": explanation,
            }),
        )))
    }
}

#[derive(Deserialize, JsonSchema)]
struct BridgedAsset {
    symbol: String,
    usd_value: f64,
    /// 是否为跨链桥接（非原生）版本
    is_bridged: bool,
}

#[derive(Deserialize, JsonSchema)]
struct BridgedExposureArgs {
    assets: Vec<BridgedAsset>,
}

pub struct BridgedAssetExposureTool;

#[async_trait]
impl Tool for BridgedAssetExposureTool {
    fn name(&self) -> &str {
        "metric_calculate_bridged_asset_exposure"
    }

    fn description(&self) -> &str {
        "Percent of the wallet's total USD value held in bridged (non-native) assets."
    }

    fn metric_name(&self) -> Option<&str> {
        Some(BRIDGED_ASSET_EXPOSURE)
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<BridgedExposureArgs>()
    }

    async fn invoke(&self, args: Value) -> Result<ToolOutput, String> {
        let args: BridgedExposureArgs = parse_args(args)?;
        let total: f64 = args.assets.iter().map(|a| a.usd_value).sum();
        let bridged: Vec<&BridgedAsset> = args.assets.iter().filter(|a| a.is_bridged).collect();
        let pct = percentage(bridged.iter().map(|a| a.usd_value).sum(), total);
        let symbols: Vec<&str> = bridged.iter().map(|a| a.symbol.as_str()).collect();
        Ok(ToolOutput::Metric(Metric::new(
            BRIDGED_ASSET_EXPOSURE,
            json!({
                "metric_description": "Share of value in bridged assets.",
                "percentage_exposure": pct,
                "bridged_symbols": symbols,
                "value_explanation": format!("{pct:.2}% of the portfolio's value is held in bridged assets."),
            }),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric_of(out: ToolOutput) -> Metric {
        match out {
            ToolOutput::Metric(m) => m,
            other => panic!("expected metric, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hhi() {
        let m = metric_of(
            PortfolioConcentrationTool
                .invoke(json!({"asset_values": [50.0, 50.0]}))
                .await
                .unwrap(),
        );
        assert_eq!(m.name, PORTFOLIO_CONCENTRATION);
        assert_eq!(m.data["hhi_score"], json!(0.5));

        let empty = metric_of(
            PortfolioConcentrationTool
                .invoke(json!({"asset_values": []}))
                .await
                .unwrap(),
        );
        assert_eq!(empty.data["hhi_score"], json!(0.0));
    }

    #[tokio::test]
    async fn test_exotic_exposure() {
        let m = metric_of(
            ExoticAssetExposureTool
                .invoke(json!({"assets": [
                    {"symbol": "WETH", "usd_value": 75.0, "market_cap_rank": 2},
                    {"symbol": "PEPE", "usd_value": 15.0, "market_cap_rank": 250},
                    {"symbol": "UNKNOWN_TKN", "usd_value": 10.0, "market_cap_rank": null}
                ]}))
                .await
                .unwrap(),
        );
        assert_eq!(m.data["percentage_exposure"], json!(25.0));
        assert_eq!(m.data["exotic_symbols"], json!(["PEPE", "UNKNOWN_TKN"]));
    }

    #[tokio::test]
    async fn test_churn_rate() {
        let m = metric_of(
            PortfolioChurnRateTool
                .invoke(json!({
                    "outgoing_transactions": [
                        {"timestamp": "2025-01-01T00:00:00Z", "usd_value": 50.0}
                    ],
                    "start_period_value_usd": 100.0,
                    "end_period_value_usd": 100.0,
                    "period_days": 365
                }))
                .await
                .unwrap(),
        );
        assert_eq!(m.data["churn_rate_percentage"], json!(50.0));
    }

    #[tokio::test]
    async fn test_churn_rejects_bad_input() {
        let err = PortfolioChurnRateTool
            .invoke(json!({"outgoing_transactions": "nope"}))
            .await
            .err()
            .unwrap();
        assert!(err.starts_with("invalid arguments"));
    }

    #[tokio::test]
    async fn test_low_tvl_concentration() {
        let m = metric_of(
            LowTvlProtocolConcentrationTool
                .invoke(json!({"positions": [
                    {"protocol_name": "Aave", "usd_value": 80.0, "protocol_tvl_usd": 10_000_000_000.0},
                    {"protocol_name": "TinySwap", "usd_value": 20.0, "protocol_tvl_usd": 1_000_000.0}
                ]}))
                .await
                .unwrap(),
        );
        assert_eq!(m.name, LOW_TVL_PROTOCOL_CONCENTRATION);
        assert_eq!(m.data["percentage_exposure"], json!(20.0));
        assert_eq!(m.data["low_tvl_protocols"], json!(["TinySwap"]));

        // 自定义阈值
        let strict = metric_of(
            LowTvlProtocolConcentrationTool
                .invoke(json!({
                    "positions": [{"protocol_name": "TinySwap", "usd_value": 20.0, "protocol_tvl_usd": 1_000_000.0}],
                    "tvl_threshold_usd": 500_000.0
                }))
                .await
                .unwrap(),
        );
        assert_eq!(strict.data["percentage_exposure"], json!(0.0));
    }

    #[tokio::test]
    async fn test_bridged_exposure() {
        let m = metric_of(
            BridgedAssetExposureTool
                .invoke(json!({"assets": [
                    {"symbol": "ETH", "usd_value": 60.0, "is_bridged": false},
                    {"symbol": "USDC.e", "usd_value": 40.0, "is_bridged": true}
                ]}))
                .await
                .unwrap(),
        );
        assert_eq!(m.name, BRIDGED_ASSET_EXPOSURE);
        assert_eq!(m.data["percentage_exposure"], json!(40.0));

        let empty = metric_of(BridgedAssetExposureTool.invoke(json!({"assets": []})).await.unwrap());
        assert_eq!(empty.data["percentage_exposure"], json!(0.0));
    }
}
