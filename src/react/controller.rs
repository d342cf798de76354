//! 会话控制器：回合状态机
//!
//! INIT → THINKING → (ACTING → THINKING)* → FINALIZING → DONE，另有从 THINKING/ACTING 可达的 STOPPED。
//! 每次 `step` 推进一个周期：一次 THINK 加随后的 ACT 和/或 FINALIZE；JobRunner 在周期之间写检查点。

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::core::{AgentError, AgentState};
use crate::llm::LlmClient;
use crate::memory::{HistoryWindower, Message, Role, TokenBudget, TokenEstimator, Tokenizer};
use crate::react::{finalize_payload, PromptSet};
use crate::tools::{ToolDispatcher, ToolOutcome};

/// STOPPED 的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// 工具返回了停止信号
    StopSignal,
    /// 模型没有请求工具且指标未收齐
    NoToolCalls,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::StopSignal => "stop_signal",
            StopReason::NoToolCalls => "no_tool_calls",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Thinking,
    Acting,
    Finalizing,
    Done,
    Stopped(StopReason),
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Stopped(_))
    }
}

/// THINKING 之后的转移决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Finalize,
    Stop(StopReason),
    Act,
}

/// 按固定优先级决定 THINKING 之后的去向：
/// 1. 超过 max_turns 强制结束；2. 最近的工具结果是停止信号；3. 指标已收齐；
/// 4. 最新 assistant 请求了工具；5. 否则停止
pub fn decide(state: &AgentState, targets: &BTreeSet<String>) -> Decision {
    if state.turn_count > state.max_turns {
        return Decision::Finalize;
    }
    if latest_results_carry_stop(&state.messages) {
        return Decision::Stop(StopReason::StopSignal);
    }
    if state.metric_names().is_superset(targets) {
        return Decision::Finalize;
    }
    let requests_tools = state
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .is_some_and(Message::requests_tools);
    if requests_tools {
        Decision::Act
    } else {
        Decision::Stop(StopReason::NoToolCalls)
    }
}

/// 最新 assistant 消息之前紧邻的那一组工具结果中是否有停止信号
fn latest_results_carry_stop(messages: &[Message]) -> bool {
    let mut iter = messages.iter().rev();
    for msg in iter.by_ref() {
        if msg.role == Role::Assistant {
            break;
        }
    }
    iter.take_while(|m| m.is_tool_result()).any(Message::is_stop_signal)
}

/// 一个周期的摘要（供 progress 事件使用）
#[derive(Debug, Clone, PartialEq)]
pub struct Cycle {
    pub turn: u32,
    /// 本周期模型请求的工具名
    pub requested_tools: Vec<String>,
    pub phase: Phase,
}

/// 驱动单次运行；独占 AgentState，运行之间不共享可变数据
pub struct ConversationController {
    state: AgentState,
    phase: Phase,
    targets: BTreeSet<String>,
    dispatcher: Arc<ToolDispatcher>,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptSet>,
    tokenizer: Arc<dyn Tokenizer>,
}

impl ConversationController {
    /// 新建或从检查点状态恢复；起始阶段由日志推断
    pub fn new(
        state: AgentState,
        dispatcher: Arc<ToolDispatcher>,
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptSet>,
    ) -> Self {
        let targets = dispatcher.registry().target_metrics();
        let phase = resume_phase(&state, &targets);
        Self {
            state,
            phase,
            targets,
            dispatcher,
            llm,
            prompts,
            tokenizer: Arc::new(TokenEstimator),
        }
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// 推进一个周期；终态下为空操作
    ///
    /// 正常运行中每个周期都以 THINK 开始，因此周期与 turn 一一对应；
    /// 从检查点恢复时第一个周期可能直接从 ACTING 或 FINALIZING 开始。
    pub async fn step(&mut self) -> Result<Cycle, AgentError> {
        let mut requested_tools = Vec::new();
        let entered = self.phase;

        if self.phase == Phase::Init {
            self.phase = Phase::Thinking;
        }

        if self.phase == Phase::Thinking {
            let reply = self.think().await?;
            requested_tools = reply.tool_names();
            self.phase = match decide(&self.state, &self.targets) {
                Decision::Act => Phase::Acting,
                Decision::Finalize => Phase::Finalizing,
                Decision::Stop(reason) => Phase::Stopped(reason),
            };
        }

        if self.phase == Phase::Acting {
            self.phase = self.act().await;
        }

        // 最后一个指标可以在同一周期内补齐并直接出结论
        if self.phase == Phase::Finalizing {
            self.finalize().await?;
            self.phase = Phase::Done;
        }

        if let (Phase::Stopped(reason), false) = (self.phase, entered.is_terminal()) {
            tracing::info!(reason = reason.as_str(), "run stopped");
        }

        Ok(Cycle {
            turn: self.state.turn_count,
            requested_tools,
            phase: self.phase,
        })
    }

    /// 一直推进到终态，返回最终结果
    pub async fn run(&mut self) -> Result<Value, AgentError> {
        while !self.is_terminal() {
            self.step().await?;
        }
        Ok(self.result_payload())
    }

    /// 终态下的结果：DONE 为结论（或兜底错误对象），STOPPED 为停止说明
    pub fn result_payload(&self) -> Value {
        let last = self.state.last_message().map(|m| m.content.clone()).unwrap_or_default();
        match self.phase {
            Phase::Stopped(reason) => json!({
                "stopped": true,
                "reason": reason,
                "metrics": self.state.metrics_json(),
                "last_message": last,
            }),
            _ => serde_json::from_str(&last).unwrap_or(Value::String(last)),
        }
    }

    async fn think(&mut self) -> Result<Message, AgentError> {
        tracing::info!(
            "─── Turn start: {}/{} ───",
            self.state.turn_count,
            self.state.max_turns
        );
        let prompt = self.build_prompt();
        let prompt_tokens: usize = prompt.iter().map(|m| self.tokenizer.count(&m.content)).sum();
        tracing::info!(messages = prompt.len(), tokens = prompt_tokens, "invoking model");

        let specs = self.dispatcher.registry().specs();
        let reply = self
            .llm
            .invoke(&prompt, &specs)
            .await
            .map_err(AgentError::ModelInvocation)?;
        if reply.requests_tools() {
            tracing::info!(tools = ?reply.tool_names(), "model requested tools");
        }

        self.state.messages.push(reply.clone());
        self.state.turn_count += 1;
        Ok(reply)
    }

    /// 固定的 system + 任务消息在前，其后为窗口化的持久日志；
    /// 固定消息的 token 先从整个 prompt 的预算中扣除
    fn build_prompt(&self) -> Vec<Message> {
        let mut prompt = vec![
            Message::system(self.prompts.system.clone()),
            Message::user(self.prompts.task_for(&self.state.subject_id)),
        ];
        let pinned: usize = prompt.iter().map(|m| self.tokenizer.count(&m.content)).sum();

        let model = &self.state.model;
        let budget = TokenBudget::new(model.max_tokens_per_prompt, model.max_tokens_per_message)
            .reserve(pinned);
        let windower = HistoryWindower::new(self.tokenizer.as_ref(), budget);
        prompt.extend(windower.window(&self.state.messages, self.state.max_messages));
        prompt
    }

    /// 执行最新 assistant 请求的工具，合并指标后给出下一阶段
    async fn act(&mut self) -> Phase {
        let calls = self
            .state
            .messages
            .last()
            .filter(|m| m.requests_tools())
            .map(|m| m.tool_calls.clone())
            .unwrap_or_default();

        let mut stopped = false;
        for (call, outcome) in self.dispatcher.dispatch(&calls).await {
            self.state.messages.push(outcome.to_message(&call.call_id));
            match outcome {
                ToolOutcome::Metric(metric) => self.state.merge_metric(metric),
                ToolOutcome::Stop => stopped = true,
                _ => {}
            }
        }

        if stopped {
            Phase::Stopped(StopReason::StopSignal)
        } else if self.state.metric_names().is_superset(&self.targets) {
            tracing::info!(metrics = self.state.metrics.len(), "all target metrics collected");
            Phase::Finalizing
        } else {
            Phase::Thinking
        }
    }

    async fn finalize(&mut self) -> Result<(), AgentError> {
        let metrics = self.state.metrics_json();
        let prompt = vec![Message::user(self.prompts.verdict_for(&metrics))];
        tracing::info!(metrics = metrics.len(), "finalizing");

        let raw = self
            .llm
            .complete(&prompt)
            .await
            .map_err(AgentError::ModelInvocation)?;
        let payload = finalize_payload(&raw, metrics);
        self.state
            .messages
            .push(Message::assistant(serde_json::to_string_pretty(&payload)?));
        Ok(())
    }
}

/// 从状态推断起始阶段（新运行或检查点恢复）
fn resume_phase(state: &AgentState, targets: &BTreeSet<String>) -> Phase {
    let Some(last) = state.last_message() else {
        return Phase::Init;
    };
    if last.requests_tools() {
        return Phase::Acting;
    }
    if last.is_tool_result() {
        // 以停止信号结束的运行保持 STOPPED
        if trailing_results_carry_stop(&state.messages) {
            return Phase::Stopped(StopReason::StopSignal);
        }
        if state.metric_names().is_superset(targets) {
            return Phase::Finalizing;
        }
        return Phase::Thinking;
    }
    if last.role == Role::Assistant {
        // 最终结论消息之后不再推进
        if is_verdict(&last.content) {
            return Phase::Done;
        }
        return match decide(state, targets) {
            Decision::Act => Phase::Acting,
            Decision::Finalize => Phase::Finalizing,
            Decision::Stop(reason) => Phase::Stopped(reason),
        };
    }
    Phase::Thinking
}

/// 日志末尾那一组工具结果中是否有停止信号
fn trailing_results_carry_stop(messages: &[Message]) -> bool {
    messages
        .iter()
        .rev()
        .take_while(|m| m.is_tool_result())
        .any(Message::is_stop_signal)
}

fn is_verdict(content: &str) -> bool {
    serde_json::from_str::<Value>(content)
        .map(|v| {
            let scored = v.get("risk_score").is_some() || v.get("error").is_some();
            v.get("metrics").is_some() && scored
        })
        .unwrap_or(false)
}
