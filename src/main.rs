//! Warden CLI：对单个钱包地址运行一次分析

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use warden::config::load_config;
use warden::core::{initial_state, EngineBuilder, RunOverrides};
use warden::jobs::{Event, ResumeTarget};

#[derive(Debug, Parser)]
#[command(name = "warden", about = "Wallet risk analysis agent")]
struct Args {
    /// 要分析的钱包地址
    #[arg(required_unless_present = "resume")]
    address: Option<String>,
    #[arg(long)]
    max_turns: Option<u32>,
    /// CLI 默认历史窗口更小
    #[arg(long, default_value_t = 5)]
    max_messages: usize,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    temperature: Option<f32>,
    /// 从已有检查点恢复：THREAD[:TURN]
    #[arg(long, value_name = "THREAD[:TURN]", conflicts_with = "address")]
    resume: Option<ResumeTarget>,
    /// 使用离线演示模型
    #[arg(long)]
    mock: bool,
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// 输出 info 日志与每轮进度
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn overrides(&self) -> RunOverrides {
        RunOverrides {
            model: self.model.clone(),
            temperature: self.temperature,
            max_turns: self.max_turns,
            max_messages: Some(self.max_messages),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    warden::observability::init_with(if args.verbose { "info" } else { "warn" });

    let config = load_config(args.config.clone()).context("Failed to load config")?;
    let runner = EngineBuilder::new(config.clone())
        .with_mock(args.mock)
        .build()
        .await
        .context("Failed to build engine")?;

    let handle = match (&args.resume, &args.address) {
        (Some(target), _) => runner.resume(&target.thread_id, target.turn).await?,
        (None, Some(address)) => {
            runner.start(initial_state(&config, address, &args.overrides()))?
        }
        (None, None) => anyhow::bail!("an address or --resume is required"),
    };
    if args.verbose {
        eprintln!("task {} (thread {})", handle.task_id, handle.thread_id);
    }

    let mut events = Box::pin(runner.subscribe(&handle.task_id, CancellationToken::new())?);
    let mut failed = false;
    while let Some(event) = events.next().await {
        match event {
            Event::Progress { turn, next_tools, metrics } if args.verbose => {
                eprintln!("turn {turn}: {} metrics, next tools {next_tools:?}", metrics.len());
            }
            Event::Progress { .. } | Event::Done => {}
            Event::Result { payload } => {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            }
            Event::Error { message } => {
                eprintln!("error: {message}");
                failed = true;
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
