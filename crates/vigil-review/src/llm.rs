use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_core::{LlmConfig, VigilError};

use crate::transport::{ensure_success, transport_error};

/// One turn of a chat completion request.
///
/// # Examples
///
/// ```
/// use vigil_review::llm::{ChatMessage, Role};
///
/// let msg = ChatMessage::user("Review this merge request");
/// assert_eq!(msg.role, Role::User);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    /// Who is speaking.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// A system-role message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// A user-role message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Speaker of a [`ChatMessage`], serialized in lowercase.
///
/// # Examples
///
/// ```
/// use vigil_review::llm::Role;
///
/// let role = Role::System;
/// assert_eq!(serde_json::to_string(&role).unwrap(), "\"system\"");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Reviewer instructions.
    System,
    /// The merge request to review.
    User,
    /// Model output.
    Assistant,
}

/// OpenAI-compatible chat completions client.
///
/// Works with any provider that exposes the `/v1/chat/completions` endpoint:
/// OpenAI, Ollama, vLLM, LiteLLM, etc. Failures are classified so the
/// invoker can retry transient ones and trip the `llm` circuit.
///
/// # Examples
///
/// ```
/// use vigil_core::LlmConfig;
/// use vigil_review::llm::LlmClient;
///
/// let config = LlmConfig {
///     api_key: Some("test-key".into()),
///     ..LlmConfig::default()
/// };
/// let client = LlmClient::new(&config).unwrap();
/// assert_eq!(client.endpoint(), "https://api.openai.com/v1/chat/completions");
/// ```
pub struct LlmClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    /// Create a new LLM client from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Config`] if the HTTP client cannot be built.
    pub fn new(config: &LlmConfig) -> Result<Self, VigilError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VigilError::Config(format!("failed to create LLM client: {e}")))?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Configured model identifier.
    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Full URL of the chat completions endpoint.
    ///
    /// Uses `base_url` when set, otherwise the provider's usual address.
    pub fn endpoint(&self) -> String {
        let base_url = match (&self.config.base_url, self.config.provider.as_str()) {
            (Some(url), _) => url.trim_end_matches('/').to_string(),
            (None, "ollama") => "http://localhost:11434".to_string(),
            (None, _) => "https://api.openai.com".to_string(),
        };
        format!("{base_url}/v1/chat/completions")
    }

    /// Send `messages` and return the first choice's text.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Timeout`] or [`VigilError::Connection`] on
    /// transport failures, [`VigilError::Http`] on a non-success status, and
    /// [`VigilError::InvalidInput`] if the response has no message content.
    pub async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String, VigilError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": 0.1,
        });

        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(api_key) = &self.config.api_key {
            request = request.header("Authorization", format!("Bearer {api_key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error("LLM request", e))?;
        let response = ensure_success("LLM request", response).await?;

        let response_body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| transport_error("LLM response", e))?;

        extract_content(&response_body)
    }
}

fn extract_content(response_body: &serde_json::Value) -> Result<String, VigilError> {
    response_body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            VigilError::InvalidInput(format!("unexpected LLM response structure: {response_body}"))
        })
}
