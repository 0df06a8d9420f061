//! Language model invocation.
//!
//! The model is an external capability: it receives a prompt (history,
//! optional retrieved context, and the user message) and returns text.
//! Three backends hide behind [`LlmProvider`]:
//!
//! - **[`OpenAiChatProvider`]** — any OpenAI-compatible
//!   `/v1/chat/completions` endpoint (OpenAI itself, Ollama, vLLM, ...),
//!   with timeout and bounded retries on 429/5xx.
//! - **[`EchoProvider`]** — deterministic offline provider that answers
//!   from the supplied context; the default, so the system works with no
//!   model server at all.
//! - **[`DisabledProvider`]** — always errors, which the orchestrator
//!   turns into an error-marker assistant message.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::ModelInvocationError;

/// One turn handed to the model.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    /// `system`, `user`, or `assistant`.
    pub role: &'static str,
    pub content: String,
}

/// Trait for chat-completion backends.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete(&self, turns: &[ChatTurn]) -> Result<String, ModelInvocationError>;
}

pub fn create_provider(config: &LlmConfig) -> Result<Box<dyn LlmProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "echo" => Ok(Box::new(EchoProvider)),
        "openai" => Ok(Box::new(OpenAiChatProvider::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

// ============ Disabled ============

pub struct DisabledProvider;

#[async_trait]
impl LlmProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn complete(&self, _turns: &[ChatTurn]) -> Result<String, ModelInvocationError> {
        Err(ModelInvocationError("llm provider is disabled".to_string()))
    }
}

// ============ Echo ============

/// Deterministic offline backend. Replies by quoting the most relevant
/// lines of the supplied context, or acknowledging the question when no
/// context was given. Useful for tests, demos, and air-gapped setups.
pub struct EchoProvider;

#[async_trait]
impl LlmProvider for EchoProvider {
    fn model_name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, turns: &[ChatTurn]) -> Result<String, ModelInvocationError> {
        let question = turns
            .iter()
            .rev()
            .find(|t| t.role == "user")
            .map(|t| t.content.as_str())
            .unwrap_or("");

        let context = turns
            .iter()
            .find(|t| t.role == "system" && t.content.contains("Context:"))
            .map(|t| t.content.as_str());

        match context {
            Some(ctx) => {
                let body = ctx.split("Context:").nth(1).unwrap_or(ctx).trim();
                let excerpt: String = body.chars().take(600).collect();
                Ok(format!(
                    "Based on the indexed documents:\n{}\n\n(answering: {})",
                    excerpt, question
                ))
            }
            None => Ok(format!(
                "I don't have document context for this turn, answering generally: {}",
                question
            )),
        }
    }
}

// ============ OpenAI-compatible ============

pub struct OpenAiChatProvider {
    base_url: String,
    model: String,
    timeout_secs: u64,
    max_retries: u32,
}

impl OpenAiChatProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiChatProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, turns: &[ChatTurn]) -> Result<String, ModelInvocationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| ModelInvocationError(e.to_string()))?;

        let messages: Vec<serde_json::Value> = turns
            .iter()
            .map(|t| serde_json::json!({ "role": t.role, "content": t.content }))
            .collect();
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });

        let url = format!("{}/chat/completions", self.base_url);
        // The key is optional for local OpenAI-compatible servers.
        let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = client.post(&url).json(&body);
            if !api_key.is_empty() {
                request = request.header("Authorization", format!("Bearer {}", api_key));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| ModelInvocationError(e.to_string()))?;
                        return parse_chat_response(&json);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        last_err = Some(ModelInvocationError(format!(
                            "chat API error {}: {}",
                            status, text
                        )));
                        continue;
                    }
                    let text = response.text().await.unwrap_or_default();
                    return Err(ModelInvocationError(format!(
                        "chat API error {}: {}",
                        status, text
                    )));
                }
                Err(e) => {
                    last_err = Some(ModelInvocationError(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| ModelInvocationError("model call failed after retries".to_string())))
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String, ModelInvocationError> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ModelInvocationError("empty model response".to_string()))
}
