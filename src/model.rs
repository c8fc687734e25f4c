//! Completion model providers.
//!
//! The composer talks to a [`CompletionModel`] trait object, so the rest of
//! the pipeline is identical whether the provider is a real hosted model,
//! the disabled stub, or a scripted double in tests. The OpenAI-compatible
//! client retries transient failures (429 and 5xx) with exponential backoff
//! and fails fast on other client errors.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::ModelConfig;
use crate::error::PipelineError;

#[async_trait]
pub trait CompletionModel: Send + Sync {
    fn name(&self) -> &str;

    /// One completion for a system prompt plus a user prompt.
    async fn complete(&self, system: &str, user: &str) -> Result<String, PipelineError>;
}

/// Stand-in when no provider is configured. Always errors, which the
/// composer turns into a deterministic fallback bundle.
pub struct DisabledModel;

#[async_trait]
impl CompletionModel for DisabledModel {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _system: &str, _user: &str) -> Result<String, PipelineError> {
        Err(PipelineError::model("model provider is disabled"))
    }
}

/// Client for an OpenAI-compatible chat-completions endpoint.
pub struct OpenAiModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    max_retries: u32,
    temperature: f64,
}

impl OpenAiModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} not set", config.api_key_env))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("model.model is required when the provider is openai"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            model,
            api_key,
            max_retries: config.max_retries,
            temperature: config.temperature,
        })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait]
impl CompletionModel for OpenAiModel {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, PipelineError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        let mut last_err: Option<PipelineError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(attempt, delay_secs = delay.as_secs(), "retrying completion");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed: ChatResponse = response.json().await.map_err(|e| {
                            PipelineError::model(format!("decode completion response: {}", e))
                        })?;
                        let content = parsed
                            .choices
                            .into_iter()
                            .next()
                            .map(|choice| choice.message.content)
                            .unwrap_or_default();
                        if content.is_empty() {
                            return Err(PipelineError::model(
                                "completion response had no content",
                            ));
                        }
                        return Ok(content);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(PipelineError::model(format!(
                            "completion request returned {}",
                            status
                        )));
                        continue;
                    }

                    let text = response.text().await.unwrap_or_default();
                    return Err(PipelineError::model(format!(
                        "completion request failed ({}): {}",
                        status, text
                    )));
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| PipelineError::model("completion request failed")))
    }
}

/// Deterministic test double: replays a queue of canned outcomes and
/// records every prompt pair it was handed.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Result<String, PipelineError>>>,
    requests: Mutex<Vec<(String, String)>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(responses: Vec<Result<String, PipelineError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every (system, user) prompt pair seen so far.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl CompletionModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((system.to_string(), user.to_string()));
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Err(PipelineError::model("scripted responses exhausted")))
    }
}

/// Build the provider the config names.
pub fn create_model(config: &ModelConfig) -> Result<Arc<dyn CompletionModel>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiModel::new(config)?)),
        _ => Ok(Arc::new(DisabledModel)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_model_always_errors() {
        let model = DisabledModel;
        let err = model.complete("system", "user").await.unwrap_err();
        assert!(matches!(err, PipelineError::Model(_)));
    }

    #[tokio::test]
    async fn test_scripted_model_replays_in_order() {
        let model = ScriptedModel::new(vec![
            Ok("first".to_string()),
            Err(PipelineError::model("boom")),
        ]);

        assert_eq!(model.complete("s1", "u1").await.unwrap(), "first");
        assert!(model.complete("s2", "u2").await.is_err());
        // exhausted scripts keep erroring instead of panicking
        assert!(model.complete("s3", "u3").await.is_err());

        assert_eq!(model.calls(), 3);
        let requests = model.requests();
        assert_eq!(requests[0], ("s1".to_string(), "u1".to_string()));
        assert_eq!(requests[1].1, "u2");
    }

    #[test]
    fn test_create_model_defaults_to_disabled() {
        let model = create_model(&ModelConfig::default()).unwrap();
        assert_eq!(model.name(), "disabled");
    }
}
