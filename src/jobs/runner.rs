//! 后台任务运行器
//!
//! 每个任务在独立的 tokio 任务中驱动一个 ConversationController，
//! 每个周期后写检查点并发布 progress 事件。事件保存在任务自己的 backlog 中，
//! 订阅者先收到全部 backlog 再接着收实时事件；订阅者断开不影响运行本身。
//! 任务结束后保留 `retention` 时长供晚到的订阅者读取，之后没有订阅者即释放。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;
use crate::core::{AgentError, AgentState};
use crate::jobs::Event;
use crate::llm::ModelProvider;
use crate::react::{ConversationController, PromptSet};
use crate::tools::ToolDispatcher;

/// 结束的任务默认保留时长
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Done,
    Error,
}

/// start / resume 的返回值
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub task_id: String,
    pub thread_id: String,
}

type JobMap = Arc<Mutex<HashMap<String, Arc<Job>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Job {
    task_id: String,
    thread_id: String,
    status: Mutex<JobStatus>,
    events: Mutex<Vec<Event>>,
    /// 已发布事件数；订阅者据此等待新事件
    published: watch::Sender<usize>,
    subscribers: AtomicUsize,
    /// 是否有订阅者读到了终止事件
    drained: AtomicBool,
    /// 结束后的保留期已过
    expired: AtomicBool,
}

impl Job {
    fn new(task_id: String, thread_id: String) -> Self {
        let (published, _) = watch::channel(0);
        Self {
            task_id,
            thread_id,
            status: Mutex::new(JobStatus::Running),
            events: Mutex::new(Vec::new()),
            published,
            subscribers: AtomicUsize::new(0),
            drained: AtomicBool::new(false),
            expired: AtomicBool::new(false),
        }
    }

    fn publish(&self, event: Event) {
        let count = {
            let mut events = lock(&self.events);
            events.push(event);
            events.len()
        };
        self.published.send_replace(count);
    }

    /// 先标记状态再发布终止事件，订阅者读到终止事件时任务必然已结束
    fn finish(&self, status: JobStatus, terminal: Event) {
        *lock(&self.status) = status;
        self.publish(terminal);
    }

    fn status(&self) -> JobStatus {
        *lock(&self.status)
    }

    fn event_at(&self, index: usize) -> Option<Event> {
        lock(&self.events).get(index).cloned()
    }

    /// 已结束，且终止事件已被读到或保留期已过
    fn releasable(&self) -> bool {
        self.status() != JobStatus::Running
            && (self.drained.load(Ordering::Acquire) || self.expired.load(Ordering::Acquire))
    }
}

/// 在注册表锁内检查并移除，与 subscribe 的计数互斥
fn release_if_idle(jobs: &JobMap, job: &Job) {
    let mut jobs = lock(jobs);
    if job.subscribers.load(Ordering::Acquire) == 0
        && job.releasable()
        && jobs.remove(&job.task_id).is_some()
    {
        tracing::debug!(task_id = %job.task_id, "job released");
    }
}

/// 订阅期间持有；最后一个订阅者释放时尝试从注册表移除任务
struct Subscription {
    job: Arc<Job>,
    jobs: JobMap,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.job.subscribers.fetch_sub(1, Ordering::AcqRel) == 1 {
            release_if_idle(&self.jobs, &self.job);
        }
    }
}

struct Cursor {
    sub: Subscription,
    next: usize,
    rx: watch::Receiver<usize>,
    cancel: CancellationToken,
    ended: bool,
}

/// 任务运行器：共享检查点存储、工具分发器与模型构建器
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn CheckpointStore>,
    dispatcher: Arc<ToolDispatcher>,
    models: Arc<dyn ModelProvider>,
    prompts: Arc<PromptSet>,
    jobs: JobMap,
    retention: Duration,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        dispatcher: Arc<ToolDispatcher>,
        models: Arc<dyn ModelProvider>,
        prompts: Arc<PromptSet>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            models,
            prompts,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            retention: DEFAULT_JOB_RETENTION,
        }
    }

    /// 任务结束后的保留时长
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// 新运行：thread_id 与 task_id 相同；立即返回，运行在后台进行
    pub fn start(&self, state: AgentState) -> Result<JobHandle, AgentError> {
        let task_id = uuid::Uuid::new_v4().to_string();
        self.spawn(task_id.clone(), task_id, state, true)
    }

    /// 从 (thread_id, turn) 恢复：状态复制到一个新 thread 上继续，原 thread 保持不变
    pub async fn resume(
        &self,
        thread_id: &str,
        turn: Option<u32>,
    ) -> Result<JobHandle, AgentError> {
        let state = self.store.load(thread_id, turn).await?;
        let task_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            from_thread = thread_id,
            turn = state.turn_count,
            new_thread = %task_id,
            "resuming from checkpoint"
        );
        self.spawn(task_id.clone(), task_id, state, false)
    }

    pub fn status(&self, task_id: &str) -> Option<JobStatus> {
        lock(&self.jobs).get(task_id).map(|job| job.status())
    }

    /// 注册表中仍存在的任务数
    pub fn active_jobs(&self) -> usize {
        lock(&self.jobs).len()
    }

    fn spawn(
        &self,
        task_id: String,
        thread_id: String,
        state: AgentState,
        seed: bool,
    ) -> Result<JobHandle, AgentError> {
        let llm = self.models.build(&state.model)?;
        let controller =
            ConversationController::new(state, self.dispatcher.clone(), llm, self.prompts.clone());

        let job = Arc::new(Job::new(task_id.clone(), thread_id.clone()));
        lock(&self.jobs).insert(task_id.clone(), job.clone());

        let store = self.store.clone();
        let jobs = self.jobs.clone();
        let retention = self.retention;
        tokio::spawn(async move {
            drive(job.clone(), controller, store, seed).await;
            tokio::time::sleep(retention).await;
            job.expired.store(true, Ordering::Release);
            release_if_idle(&jobs, &job);
        });

        Ok(JobHandle { task_id, thread_id })
    }

    /// 订阅任务事件：先 backlog 后实时，读到 error / done 后结束；cancel 触发时提前结束
    pub fn subscribe(
        &self,
        task_id: &str,
        cancel: CancellationToken,
    ) -> Result<impl Stream<Item = Event> + Send + 'static, AgentError> {
        let job = {
            let jobs = lock(&self.jobs);
            let job = jobs
                .get(task_id)
                .cloned()
                .ok_or_else(|| AgentError::TaskNotFound(task_id.to_string()))?;
            job.subscribers.fetch_add(1, Ordering::AcqRel);
            job
        };

        let cursor = Cursor {
            rx: job.published.subscribe(),
            sub: Subscription {
                job,
                jobs: self.jobs.clone(),
            },
            next: 0,
            cancel,
            ended: false,
        };

        Ok(stream::unfold(cursor, |mut cursor| async move {
            if cursor.ended {
                return None;
            }
            loop {
                if cursor.cancel.is_cancelled() {
                    tracing::debug!(task_id = %cursor.sub.job.task_id, "subscriber disconnected");
                    return None;
                }
                cursor.rx.borrow_and_update();
                if let Some(event) = cursor.sub.job.event_at(cursor.next) {
                    cursor.next += 1;
                    if event.is_terminal() {
                        cursor.ended = true;
                        cursor.sub.job.drained.store(true, Ordering::Release);
                    }
                    return Some((event, cursor));
                }
                let closed = tokio::select! {
                    _ = cursor.cancel.cancelled() => false,
                    changed = cursor.rx.changed() => changed.is_err(),
                };
                if closed {
                    return None;
                }
            }
        }))
    }
}

async fn drive(
    job: Arc<Job>,
    mut controller: ConversationController,
    store: Arc<dyn CheckpointStore>,
    seed: bool,
) {
    tracing::info!(
        task_id = %job.task_id,
        thread_id = %job.thread_id,
        subject = %controller.state().subject_id,
        "job started"
    );

    let outcome = async {
        if seed {
            store.save(&job.thread_id, controller.state()).await?;
        }
        while !controller.is_terminal() {
            let cycle = controller.step().await?;
            store.save(&job.thread_id, controller.state()).await?;
            job.publish(Event::Progress {
                turn: cycle.turn,
                metrics: controller.state().metrics_json(),
                next_tools: cycle.requested_tools,
            });
        }
        Ok::<_, AgentError>(controller.result_payload())
    }
    .await;

    match outcome {
        Ok(payload) => {
            job.publish(Event::Result { payload });
            job.finish(JobStatus::Done, Event::Done);
            tracing::info!(
                task_id = %job.task_id,
                turns = controller.state().turn_count,
                "job finished"
            );
        }
        Err(e) => {
            tracing::error!(task_id = %job.task_id, error = %e, "job failed");
            job.finish(JobStatus::Error, Event::Error { message: e.to_string() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::core::ModelConfig;
    use crate::llm::{FixedModelProvider, ScriptedLlmClient};
    use crate::tools::default_registry;
    use futures_util::StreamExt;
    use serde_json::json;

    fn runner(llm: ScriptedLlmClient) -> JobRunner {
        JobRunner::new(
            Arc::new(MemoryCheckpointStore::new()),
            Arc::new(ToolDispatcher::new(Arc::new(default_registry()), 5)),
            Arc::new(FixedModelProvider::new(Arc::new(llm))),
            Arc::new(PromptSet::default()),
        )
    }

    fn fresh() -> AgentState {
        AgentState::new("0xabc", 10, 7, ModelConfig::default())
    }

    async fn collect(runner: &JobRunner, task_id: &str) -> Vec<Event> {
        runner
            .subscribe(task_id, CancellationToken::new())
            .unwrap()
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_events_in_order_then_released() {
        let runner = runner(ScriptedLlmClient::demo());
        let handle = runner.start(fresh()).unwrap();
        assert_eq!(handle.task_id, handle.thread_id);

        let events = collect(&runner, &handle.task_id).await;
        let names: Vec<&str> = events.iter().map(Event::name).collect();
        assert_eq!(names, vec!["progress", "progress", "result", "done"]);
        match &events[2] {
            Event::Result { payload } => assert_eq!(payload["risk_score"], json!(38.0)),
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(runner.active_jobs(), 0);
        let turns: Vec<u32> = runner
            .store()
            .list(&handle.thread_id)
            .await
            .unwrap()
            .iter()
            .map(|c| c.turn)
            .collect();
        assert_eq!(turns, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_late_and_concurrent_subscribers_see_full_backlog() {
        let runner = runner(ScriptedLlmClient::demo());
        let handle = runner.start(fresh()).unwrap();

        let a = runner.subscribe(&handle.task_id, CancellationToken::new()).unwrap();
        let b = runner.subscribe(&handle.task_id, CancellationToken::new()).unwrap();
        let (a, b): (Vec<Event>, Vec<Event>) = tokio::join!(a.collect(), b.collect());
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
        assert_eq!(runner.active_jobs(), 0);
        assert!(matches!(
            runner.subscribe(&handle.task_id, CancellationToken::new()),
            Err(AgentError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_model_failure_publishes_error() {
        let runner = runner(ScriptedLlmClient::new().then_error("401 Unauthorized"));
        let handle = runner.start(fresh()).unwrap();

        let events = collect(&runner, &handle.task_id).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Error { message } => assert!(message.contains("401")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_subscriber_does_not_stop_run() {
        let runner = runner(ScriptedLlmClient::demo());
        let handle = runner.start(fresh()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let early: Vec<Event> = runner.subscribe(&handle.task_id, cancel).unwrap().collect().await;
        assert!(early.is_empty());

        // 任务继续运行，后来的订阅者仍能拿到完整结果
        let events = collect(&runner, &handle.task_id).await;
        assert_eq!(events.last(), Some(&Event::Done));
    }

    #[tokio::test]
    async fn test_resume_forks_new_thread() {
        let runner = runner(ScriptedLlmClient::demo());
        let first = runner.start(fresh()).unwrap();
        collect(&runner, &first.task_id).await;

        let resumed = runner.resume(&first.thread_id, Some(1)).await.unwrap();
        assert_ne!(resumed.thread_id, first.thread_id);
        collect(&runner, &resumed.task_id).await;

        // 原 thread 不被改写
        let original = runner.store().list(&first.thread_id).await.unwrap();
        assert_eq!(original.len(), 3);
        assert!(runner.store().load(&resumed.thread_id, None).await.unwrap().turn_count >= 1);

        let missing = runner.resume(&first.thread_id, Some(42)).await.unwrap_err();
        assert!(missing.is_resume_error());
    }

    #[tokio::test]
    async fn test_unobserved_job_is_released_after_retention() {
        let runner = runner(ScriptedLlmClient::demo()).with_retention(Duration::from_millis(20));
        let unobserved = runner.start(fresh()).unwrap();

        // 中途断开的订阅者不会让任务永久驻留
        let abandoned = runner.start(fresh()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let early: Vec<Event> =
            runner.subscribe(&abandoned.task_id, cancel).unwrap().collect().await;
        assert!(early.is_empty());

        tokio::time::timeout(Duration::from_secs(5), async {
            while runner.active_jobs() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("jobs were never released");

        // 运行本身照常完成并写完检查点
        for handle in [&unobserved, &abandoned] {
            let turns = runner.store().list(&handle.thread_id).await.unwrap();
            assert_eq!(turns.len(), 3);
        }
    }

    #[tokio::test]
    async fn test_resuming_stopped_thread_only_reports_result() {
        let llm = ScriptedLlmClient::new().then_tools(vec![("util_stop_now", json!({}))]);
        let runner = runner(llm);
        let first = runner.start(fresh()).unwrap();
        collect(&runner, &first.task_id).await;

        let resumed = runner.resume(&first.thread_id, None).await.unwrap();
        let events = collect(&runner, &resumed.task_id).await;
        let names: Vec<&str> = events.iter().map(Event::name).collect();
        assert_eq!(names, vec!["result", "done"]);
        match &events[0] {
            Event::Result { payload } => assert_eq!(payload["reason"], "stop_signal"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(runner.store().list(&resumed.thread_id).await.unwrap().is_empty());
    }
}
