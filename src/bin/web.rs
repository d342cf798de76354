//! Warden HTTP 服务：提交分析任务、SSE 订阅事件、从检查点恢复
//!
//! 启动: cargo run --bin warden-web --features web
//!
//! - POST /run                          {address, model?, temperature?, max_turns?, max_messages?}
//! - GET  /events/{task_id}             SSE：progress / result / error / done
//! - POST /resume                       {thread_id, turn?}
//! - GET  /threads/{thread_id}/checkpoints

#![cfg(feature = "web")]

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use warden::config::{load_config, AppConfig};
use warden::core::{initial_state, AgentError, EngineBuilder, RunOverrides};
use warden::jobs::{Event, JobHandle, JobRunner};

struct AppState {
    config: AppConfig,
    runner: JobRunner,
}

type ApiError = (StatusCode, String);

fn api_error(e: AgentError) -> ApiError {
    let status = match &e {
        AgentError::CheckpointNotFound { .. } | AgentError::TaskNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        AgentError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

#[derive(Deserialize)]
struct RunRequest {
    address: Option<String>,
    #[serde(flatten)]
    overrides: RunOverrides,
}

#[derive(Deserialize)]
struct ResumeRequest {
    thread_id: String,
    turn: Option<u32>,
}

#[derive(Serialize)]
struct CheckpointInfo {
    turn: u32,
    created_at: DateTime<Utc>,
    messages: usize,
    metrics: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    warden::observability::init();

    let config = load_config(None).unwrap_or_default();
    let mock = std::env::args().any(|a| a == "--mock");
    let runner = EngineBuilder::new(config.clone()).with_mock(mock).build().await?;
    let bind = config.server.bind.clone();
    let state = Arc::new(AppState { config, runner });

    let app = Router::new()
        .route("/run", post(api_run))
        .route("/events/:task_id", get(api_events))
        .route("/resume", post(api_resume))
        .route("/threads/:thread_id/checkpoints", get(api_checkpoints))
        .with_state(state);

    tracing::info!("Warden API: http://{}", bind);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// POST /run：提交新任务，立即返回 task_id
async fn api_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RunRequest>,
) -> Result<Json<JobHandle>, ApiError> {
    let address = req
        .address
        .filter(|a| !a.trim().is_empty())
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "'address' is required".to_string()))?;
    let initial = initial_state(&state.config, address.trim(), &req.overrides);
    let handle = state.runner.start(initial).map_err(api_error)?;
    Ok(Json(handle))
}

/// POST /resume：从 thread_id[:turn] 恢复为新任务
async fn api_resume(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResumeRequest>,
) -> Result<Json<JobHandle>, ApiError> {
    let handle = state
        .runner
        .resume(&req.thread_id, req.turn)
        .await
        .map_err(api_error)?;
    Ok(Json(handle))
}

/// GET /threads/{thread_id}/checkpoints：从新到旧
async fn api_checkpoints(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> Result<Json<Vec<CheckpointInfo>>, ApiError> {
    let checkpoints = state.runner.store().list(&thread_id).await.map_err(api_error)?;
    Ok(Json(
        checkpoints
            .into_iter()
            .map(|c| CheckpointInfo {
                turn: c.turn,
                created_at: c.created_at,
                messages: c.state.messages.len(),
                metrics: c.state.metrics.keys().cloned().collect(),
            })
            .collect(),
    ))
}

/// 连接断开时取消订阅（SSE 流被 drop 即视为断开）
struct DisconnectGuard(CancellationToken);

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// GET /events/{task_id}：SSE 事件流；未知任务返回单个 error 事件
async fn api_events(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Sse<std::pin::Pin<Box<dyn Stream<Item = Result<SseEvent, Infallible>> + Send>>> {
    let cancel = CancellationToken::new();
    let stream: std::pin::Pin<Box<dyn Stream<Item = Result<SseEvent, Infallible>> + Send>> =
        match state.runner.subscribe(&task_id, cancel.clone()) {
            Ok(events) => {
                let guard = DisconnectGuard(cancel);
                Box::pin(events.map(move |event| {
                    let _ = &guard;
                    Ok(to_sse(&event))
                }))
            }
            Err(e) => Box::pin(stream::once(async move {
                Ok(SseEvent::default().event("error").data(e.to_string()))
            })),
        };
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

fn to_sse(event: &Event) -> SseEvent {
    let sse = SseEvent::default().event(event.name());
    match event.data() {
        Some(data) => sse.data(data),
        None => sse,
    }
}
