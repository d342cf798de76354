//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `WARDEN__*` 覆盖（双下划线表示嵌套，如 `WARDEN__LLM__MODEL=gpt-4o-mini`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::ModelConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub storage: StorageSection,
    pub server: ServerSection,
}

/// [agent] 段：轮数上限、历史窗口、prompt 目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_turns: u32,
    /// 每次发给模型的历史消息条数上限
    pub max_messages: usize,
    /// 覆盖内置 prompt 的目录（system.md / input.md / risk.md）
    pub prompts_dir: Option<PathBuf>,
    /// 任务结束后仍可订阅的秒数；之后若无订阅者则释放
    pub job_retention_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_turns: 10,
            max_messages: 7,
            prompts_dir: None,
            job_retention_secs: 300,
        }
    }
}

/// [llm] 段：后端、模型与 token 预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / mock
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub max_tokens_per_prompt: usize,
    pub max_tokens_per_message: Option<usize>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        let model = ModelConfig::default();
        Self {
            provider: "openai".to_string(),
            model: model.name,
            temperature: model.temperature,
            base_url: None,
            api_key: None,
            max_tokens_per_prompt: model.max_tokens_per_prompt,
            max_tokens_per_message: model.max_tokens_per_message,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

impl LlmSection {
    /// 新运行使用的模型配置（可被请求参数覆盖）
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            name: self.model.clone(),
            temperature: self.temperature,
            max_tokens_per_prompt: self.max_tokens_per_prompt,
            max_tokens_per_message: self.max_tokens_per_message,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: crate::tools::DEFAULT_TOOL_TIMEOUT_SECS,
        }
    }
}

/// [storage] 段：检查点数据库
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub database_path: PathBuf,
    /// 连接池上限；超出时排队而不是失败
    pub max_connections: u32,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("workspace/checkpoints.db"),
            max_connections: 10,
        }
    }
}

/// [server] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 WARDEN__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 WARDEN__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("WARDEN")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
