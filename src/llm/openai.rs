//! OpenAI 兼容 API 客户端
//!
//! 纯文本完成走 async_openai；绑定工具的调用直接构造 chat/completions 请求体（reqwest），
//! 工具 schema 原样透传。可配置 base_url，支持 OpenAI、DeepSeek、自建代理等。

use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::core::{AgentError, ModelConfig};
use crate::llm::{LlmClient, ModelProvider};
use crate::memory::{Message, Role, ToolCall};
use crate::tools::ToolSpec;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI 兼容客户端：每次运行一个实例
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAiClient {
    pub fn new(
        base_url: Option<&str>,
        api_key: Option<&str>,
        config: &ModelConfig,
        request_timeout: Duration,
    ) -> Result<Self, AgentError> {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| AgentError::Config("OPENAI_API_KEY is not set".to_string()))?;
        let base_url = base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string();

        let openai_config = OpenAIConfig::new()
            .with_api_base(base_url.clone())
            .with_api_key(api_key.clone());
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("http client: {e}")))?;

        Ok(Self {
            client: Client::with_config(openai_config),
            http,
            base_url,
            api_key,
            model: config.name.clone(),
            temperature: config.temperature,
        })
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, String> {
        messages
            .iter()
            .map(|m| {
                let msg = match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(|e| e.to_string())?,
                    ),
                    Role::User | Role::Tool => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(|e| e.to_string())?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(|e| e.to_string())?,
                    ),
                };
                Ok(msg)
            })
            .collect()
    }
}

/// 转为 chat/completions 的消息 JSON（含 tool_calls 与 tool_call_id）
pub fn wire_message(m: &Message) -> Value {
    let mut out = Map::new();
    out.insert("role".to_string(), json!(m.role.as_str()));
    out.insert("content".to_string(), json!(m.content));
    if !m.tool_calls.is_empty() {
        let calls: Vec<Value> = m
            .tool_calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.call_id,
                    "type": "function",
                    "function": {
                        "name": c.name,
                        "arguments": Value::Object(c.arguments.clone()).to_string(),
                    }
                })
            })
            .collect();
        out.insert("tool_calls".to_string(), Value::Array(calls));
    }
    if let Some(id) = &m.tool_call_id {
        out.insert("tool_call_id".to_string(), json!(id));
    }
    Value::Object(out)
}

fn wire_tool(spec: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": spec.parameters,
        }
    })
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// 解析模型回复；工具参数不是合法 JSON 时原样保留在 `_raw` 中，交给工具校验报错
fn parse_wire_response(response: WireResponse) -> Result<Message, String> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| "empty choices in model response".to_string())?;
    let calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|tc| {
            let args = if tc.function.arguments.trim().is_empty() {
                Value::Object(Map::new())
            } else {
                serde_json::from_str(&tc.function.arguments)
                    .unwrap_or_else(|_| json!({"_raw": tc.function.arguments}))
            };
            ToolCall::new(tc.function.name, args, tc.id)
        })
        .collect();
    Ok(Message::assistant_with_calls(
        choice.message.content.unwrap_or_default(),
        calls,
    ))
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn invoke(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<Message, String> {
        let mut body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(wire_tool).collect());
        }

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(format!("HTTP {status}: {text}"));
        }
        let parsed: WireResponse = response.json().await.map_err(|e| e.to_string())?;
        if let Some(usage) = &parsed.usage {
            tracing::debug!(
                model = %self.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "model usage"
            );
        }
        parse_wire_response(parsed)
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(self.temperature)
            .messages(self.to_openai_messages(messages)?)
            .build()
            .map_err(|e| e.to_string())?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| e.to_string())?;

        if let Some(usage) = &response.usage {
            tracing::debug!(
                model = %self.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "model usage"
            );
        }

        Ok(response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

/// 按 ModelConfig 构建 OpenAiClient
pub struct OpenAiProvider {
    base_url: Option<String>,
    api_key: Option<String>,
    request_timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(
        base_url: Option<String>,
        api_key: Option<String>,
        request_timeout_secs: u64,
    ) -> Self {
        Self {
            base_url,
            api_key,
            request_timeout: Duration::from_secs(request_timeout_secs.max(1)),
        }
    }
}

impl ModelProvider for OpenAiProvider {
    fn build(&self, config: &ModelConfig) -> Result<Arc<dyn LlmClient>, AgentError> {
        let client = OpenAiClient::new(
            self.base_url.as_deref(),
            self.api_key.as_deref(),
            config,
            self.request_timeout,
        )?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_message_carries_tool_links() {
        let call = ToolCall::new("util_stop_now", json!({}), "call_1");
        let assistant = wire_message(&Message::assistant_with_calls("", vec![call]));
        assert_eq!(assistant["tool_calls"][0]["id"], "call_1");
        assert_eq!(assistant["tool_calls"][0]["function"]["arguments"], "{}");

        let result = wire_message(&Message::tool_result(
            "call_1",
            crate::memory::ResultKind::Stop,
            "{}",
        ));
        assert_eq!(result["role"], "tool");
        assert_eq!(result["tool_call_id"], "call_1");
    }

    #[test]
    fn test_parse_wire_response() {
        let raw = json!({
            "choices": [{"message": {"content": null, "tool_calls": [
                {"id": "a", "type": "function", "function": {"name": "util_math_sum_numbers", "arguments": "{\"a\":\"1\",\"b\":\"2\"}"}},
                {"id": "b", "type": "function", "function": {"name": "util_stop_now", "arguments": "not json"}}
            ]}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        });
        let parsed: WireResponse = serde_json::from_value(raw).unwrap();
        let msg = parse_wire_response(parsed).unwrap();
        assert_eq!(msg.content, "");
        assert_eq!(msg.tool_calls.len(), 2);
        assert_eq!(msg.tool_calls[0].arguments["a"], "1");
        assert_eq!(msg.tool_calls[1].arguments["_raw"], "not json");
    }

    #[test]
    fn test_parse_wire_response_rejects_empty_choices() {
        let parsed: WireResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(parse_wire_response(parsed).is_err());
    }
}
