//! 引擎构建器：CLI 与 HTTP 服务共用的初始化逻辑
//!
//! 由 AppConfig 组装工具注册表、分发器、模型构建器、检查点存储与 prompt，产出 JobRunner。

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::checkpoint::{CheckpointStore, SqliteCheckpointStore};
use crate::config::AppConfig;
use crate::core::{AgentError, AgentState};
use crate::jobs::JobRunner;
use crate::llm::{DemoModelProvider, ModelProvider, OpenAiProvider};
use crate::react::PromptSet;
use crate::tools::{builtin_registry, ToolDispatcher};

/// 单次运行可覆盖的参数（未给出时取配置值）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunOverrides {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_turns: Option<u32>,
    pub max_messages: Option<usize>,
}

/// 按配置与覆盖参数构造一次新运行的初始状态
pub fn initial_state(config: &AppConfig, subject_id: &str, overrides: &RunOverrides) -> AgentState {
    let mut model = config.llm.model_config();
    if let Some(name) = &overrides.model {
        model.name = name.clone();
    }
    if let Some(t) = overrides.temperature {
        model.temperature = t;
    }
    AgentState::new(
        subject_id,
        overrides.max_turns.unwrap_or(config.agent.max_turns),
        overrides.max_messages.unwrap_or(config.agent.max_messages),
        model,
    )
}

pub struct EngineBuilder {
    config: AppConfig,
    mock: bool,
    store: Option<Arc<dyn CheckpointStore>>,
    models: Option<Arc<dyn ModelProvider>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            mock: false,
            store: None,
            models: None,
        }
    }

    /// 使用离线演示模型，不访问任何 API
    pub fn with_mock(mut self, mock: bool) -> Self {
        self.mock = mock;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_model_provider(mut self, models: Arc<dyn ModelProvider>) -> Self {
        self.models = Some(models);
        self
    }

    fn model_provider(&self) -> Result<Arc<dyn ModelProvider>, AgentError> {
        if let Some(models) = &self.models {
            return Ok(models.clone());
        }
        let llm = &self.config.llm;
        if self.mock || llm.provider == "mock" {
            return Ok(Arc::new(DemoModelProvider));
        }
        match llm.provider.as_str() {
            "openai" => Ok(Arc::new(OpenAiProvider::new(
                llm.base_url.clone(),
                llm.api_key.clone(),
                llm.timeouts.request,
            ))),
            other => Err(AgentError::Config(format!("unknown llm provider: {other}"))),
        }
    }

    fn prompts(&self) -> Result<PromptSet, AgentError> {
        match &self.config.agent.prompts_dir {
            Some(dir) => PromptSet::from_dir(dir)
                .map_err(|e| AgentError::Config(format!("prompts_dir {}: {e}", dir.display()))),
            None => Ok(PromptSet::default()),
        }
    }

    pub async fn build(self) -> Result<JobRunner, AgentError> {
        let models = self.model_provider()?;
        let prompts = self.prompts()?;
        let store: Arc<dyn CheckpointStore> = match &self.store {
            Some(store) => store.clone(),
            None => {
                let storage = &self.config.storage;
                let store =
                    SqliteCheckpointStore::open(&storage.database_path, storage.max_connections)
                        .await?;
                Arc::new(store)
            }
        };

        let timeout_secs = self.config.tools.tool_timeout_secs;
        let registry = Arc::new(builtin_registry(timeout_secs));
        tracing::info!(
            tools = registry.len(),
            targets = ?registry.target_metrics(),
            "tool registry ready"
        );
        let dispatcher = Arc::new(ToolDispatcher::new(registry, timeout_secs));

        let retention = Duration::from_secs(self.config.agent.job_retention_secs);
        Ok(JobRunner::new(store, dispatcher, models, Arc::new(prompts)).with_retention(retention))
    }
}
