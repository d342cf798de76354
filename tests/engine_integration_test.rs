//! 引擎集成测试：脚本化模型 + SQLite 检查点 + 后台任务事件流

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use warden::checkpoint::{CheckpointStore, SqliteCheckpointStore};
use warden::config::AppConfig;
use warden::core::{initial_state, AgentState, EngineBuilder, ModelConfig, RunOverrides};
use warden::jobs::{Event, JobRunner};
use warden::llm::{DemoModelProvider, FixedModelProvider, ScriptedLlmClient};
use warden::memory::tool_results_are_linked;

async fn events(runner: &JobRunner, task_id: &str) -> Vec<Event> {
    runner
        .subscribe(task_id, CancellationToken::new())
        .unwrap()
        .collect()
        .await
}

fn result_of(events: &[Event]) -> serde_json::Value {
    events
        .iter()
        .find_map(|e| match e {
            Event::Result { payload } => Some(payload.clone()),
            _ => None,
        })
        .expect("result event")
}

const CHURN: &str = "metric_calculate_portfolio_churn_rate";
const LOW_TVL: &str = "metric_calculate_low_tvl_protocol_concentration";

fn churn_args() -> serde_json::Value {
    json!({
        "outgoing_transactions": [],
        "start_period_value_usd": 100.0,
        "end_period_value_usd": 100.0
    })
}

fn low_tvl_args() -> serde_json::Value {
    json!({"positions": [{"protocol_name": "Aave", "usd_value": 10.0, "protocol_tvl_usd": 1.0e10}]})
}

fn config_in(dir: &tempfile::TempDir) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.storage.database_path = dir.path().join("checkpoints.db");
    cfg.tools.tool_timeout_secs = 5;
    cfg
}

#[tokio::test]
async fn test_full_run_then_resume_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_in(&dir);

    let runner = EngineBuilder::new(cfg.clone()).with_mock(true).build().await.unwrap();
    let handle = runner
        .start(initial_state(&cfg, "0xabc", &RunOverrides::default()))
        .unwrap();
    let first = events(&runner, &handle.task_id).await;
    let names: Vec<&str> = first.iter().map(Event::name).collect();
    assert_eq!(names, vec!["progress", "progress", "result", "done"]);
    assert_eq!(result_of(&first)["risk_score"], json!(38.0));
    drop(runner);

    // 新进程：重新打开同一个数据库
    let llm = ScriptedLlmClient::new()
        .then_tools(vec![(CHURN, churn_args()), (LOW_TVL, low_tvl_args())])
        .with_verdict(r#"{"risk_score": 12, "justification": "Quiet wallet."}"#);
    let runner = EngineBuilder::new(cfg.clone())
        .with_model_provider(Arc::new(FixedModelProvider::new(Arc::new(llm))))
        .build()
        .await
        .unwrap();

    let at_turn_1 = runner.store().load(&handle.thread_id, Some(1)).await.unwrap();
    assert_eq!(at_turn_1.turn_count, 1);
    assert_eq!(at_turn_1.metrics.len(), 3);
    assert!(tool_results_are_linked(&at_turn_1.messages));

    let resumed = runner.resume(&handle.thread_id, Some(1)).await.unwrap();
    let second = events(&runner, &resumed.task_id).await;
    let payload = result_of(&second);
    assert_eq!(payload["risk_score"], json!(12.0));
    assert_eq!(payload["metrics"].as_array().unwrap().len(), 5);

    let forked = runner.store().load(&resumed.thread_id, None).await.unwrap();
    assert_eq!(forked.turn_count, 2);
    assert_eq!(&forked.messages[..at_turn_1.messages.len()], &at_turn_1.messages[..]);
    // 原 thread 保持不变
    assert_eq!(runner.store().list(&handle.thread_id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_unparsable_verdict_still_completes() {
    let dir = tempfile::tempdir().unwrap();
    let llm = ScriptedLlmClient::new()
        .then_tools(vec![
            ("metric_calculate_portfolio_concentration", json!({"asset_values": [1.0, 1.0]})),
            (
                "metric_calculate_exotic_asset_exposure",
                json!({"assets": [{"symbol": "X", "usd_value": 1.0, "market_cap_rank": 500}]}),
            ),
            (
                "metric_calculate_bridged_asset_exposure",
                json!({"assets": [{"symbol": "X", "usd_value": 1.0, "is_bridged": true}]}),
            ),
            (CHURN, churn_args()),
            (LOW_TVL, low_tvl_args()),
        ])
        .with_verdict("The wallet looks fine to me!");
    let runner = EngineBuilder::new(config_in(&dir))
        .with_model_provider(Arc::new(FixedModelProvider::new(Arc::new(llm))))
        .build()
        .await
        .unwrap();

    let handle = runner
        .start(AgentState::new("0xabc", 10, 7, ModelConfig::default()))
        .unwrap();
    let all = events(&runner, &handle.task_id).await;
    assert_eq!(all.last(), Some(&Event::Done));
    let payload = result_of(&all);
    assert!(payload["error"].as_str().unwrap().starts_with("Failed to validate"));
    assert_eq!(payload["raw"], "The wallet looks fine to me!");
    assert_eq!(payload["metrics"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn test_history_window_keeps_tool_pairs() {
    let dir = tempfile::tempdir().unwrap();
    let mut script = ScriptedLlmClient::new();
    for i in 0..6 {
        script = script.then_tools(vec![
            ("util_math_sum_numbers", json!({"a": i.to_string(), "b": "1"})),
            ("util_math_multiply_numbers", json!({"a": i.to_string(), "b": "2"})),
        ]);
    }
    let llm = Arc::new(script.then_text("done"));
    let runner = EngineBuilder::new(config_in(&dir))
        .with_model_provider(Arc::new(FixedModelProvider::new(llm.clone())))
        .build()
        .await
        .unwrap();

    let handle = runner
        .start(AgentState::new("0xabc", 20, 2, ModelConfig::default()))
        .unwrap();
    let all = events(&runner, &handle.task_id).await;
    assert_eq!(result_of(&all)["reason"], "no_tool_calls");

    let prompts = llm.prompts();
    assert_eq!(prompts.len(), 7);
    for prompt in &prompts {
        let window = &prompt[2..];
        assert!(window.first().map_or(true, |m| !m.is_tool_result()));
        assert!(tool_results_are_linked(window));
    }
    // 切点落在工具结果上时保留发起调用的 assistant，超出 max_messages
    assert_eq!(prompts[6].len(), 2 + 3);
}

#[tokio::test]
async fn test_concurrent_jobs_share_one_pool() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config_in(&dir);
    cfg.storage.max_connections = 2;
    let store: Arc<dyn CheckpointStore> = Arc::new(
        SqliteCheckpointStore::open(&cfg.storage.database_path, cfg.storage.max_connections)
            .await
            .unwrap(),
    );
    let runner = EngineBuilder::new(cfg.clone())
        .with_store(store)
        .with_model_provider(Arc::new(DemoModelProvider))
        .build()
        .await
        .unwrap();

    let handles: Vec<_> = (0..6)
        .map(|i| {
            runner
                .start(initial_state(&cfg, &format!("0x{i:040x}"), &RunOverrides::default()))
                .unwrap()
        })
        .collect();
    for handle in &handles {
        let all = events(&runner, &handle.task_id).await;
        assert_eq!(all.last(), Some(&Event::Done));
        let turns = runner.store().list(&handle.thread_id).await.unwrap();
        assert_eq!(turns.iter().map(|c| c.turn).collect::<Vec<_>>(), vec![2, 1, 0]);
    }
    assert_eq!(runner.active_jobs(), 0);
}
