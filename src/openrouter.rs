use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CompletionConfig;
use crate::models::ChatMessage;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion API key not configured")]
    NotConfigured,
    #[error("completion request failed: {0}")]
    Request(String),
    #[error("completion API returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("failed to decode completion response: {0}")]
    Decode(String),
}

/// Opaque text-completion service.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Returns the first choice's content, or an empty string when the
    /// service answered without one.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, CompletionError>;

    fn is_configured(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct OpenRouterClient {
    client: Client,
    config: CompletionConfig,
}

impl OpenRouterClient {
    pub fn new(config: CompletionConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl CompletionClient for OpenRouterClient {
    fn is_configured(&self) -> bool {
        self.config.api_key.is_some()
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, CompletionError> {
        #[derive(Serialize)]
        struct CompletionReq<'a> {
            model: &'a str,
            messages: &'a [ChatMessage],
            max_tokens: u32,
            temperature: f32,
        }

        #[derive(Deserialize)]
        struct CompletionResp {
            #[serde(default)]
            choices: Vec<Choice>,
        }

        #[derive(Deserialize)]
        struct Choice {
            message: Option<ChoiceMessage>,
        }

        #[derive(Deserialize)]
        struct ChoiceMessage {
            content: Option<String>,
        }

        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(CompletionError::NotConfigured)?;

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .header("HTTP-Referer", &self.config.referer)
            .header("X-Title", &self.config.title)
            .json(&CompletionReq {
                model: &self.config.model,
                messages,
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
            })
            .send()
            .await
            .map_err(|err| CompletionError::Request(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status {
                status,
                message: normalize_err_body(&body),
            });
        }

        let response = response
            .json::<CompletionResp>()
            .await
            .map_err(|err| CompletionError::Decode(err.to_string()))?;

        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .map(|content| content.trim().to_string())
            .unwrap_or_default())
    }
}

fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        let error = json.get("error");
        if let Some(err) = error.and_then(|v| v.as_str()) {
            return err.to_string();
        }
        if let Some(err) = error
            .and_then(|v| v.get("message"))
            .and_then(|v| v.as_str())
        {
            return err.to_string();
        }
    }

    trimmed.to_string()
}
