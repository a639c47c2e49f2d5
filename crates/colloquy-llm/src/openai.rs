//! Adapter for OpenAI-compatible chat-completion endpoints.
//!
//! Non-streaming: one request per generation, JSON response format, schema
//! embedded in the system message. Works against any server speaking the
//! `/v1/chat/completions` shape.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::generator::{
    GenerationHints, GeneratorError, JsonGeneration, SchematicGenerator, UsageInfo,
};

#[derive(Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: String,
    /// Zeroized on drop, redacted in Debug.
    pub api_key: SecretString,
    pub model: String,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for OpenAiCompatConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Default for OpenAiCompatConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            api_key: SecretString::from(""),
            model: "gpt-4o-mini".into(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

pub struct OpenAiCompatGenerator {
    config: OpenAiCompatConfig,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OpenAiCompatGenerator {
    pub fn new(config: OpenAiCompatConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("reqwest client");
        Self { config, client }
    }

    fn classify_status(status: u16, body: String) -> GeneratorError {
        match status {
            400 | 401 | 403 | 404 => GeneratorError::InvalidRequest(body),
            429 => GeneratorError::RateLimited { retry_after: None },
            _ => GeneratorError::Transient(format!("status {status}: {body}")),
        }
    }
}

#[async_trait]
impl SchematicGenerator for OpenAiCompatGenerator {
    fn name(&self) -> &str {
        "openai-compat"
    }

    async fn generate_json(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        hints: &GenerationHints,
    ) -> Result<JsonGeneration, GeneratorError> {
        let system = format!(
            "Respond with a single JSON object conforming to this JSON Schema. \
             Output only the JSON object, nothing else.\n\n{schema}"
        );

        let mut body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
            "response_format": {"type": "json_object"},
        });
        if let Some(temperature) = hints.temperature {
            body["temperature"] = json!(temperature);
        }

        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GeneratorError::Timeout(self.config.request_timeout)
                } else {
                    GeneratorError::Transient(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| GeneratorError::Transient(format!("malformed response body: {e}")))?;

        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| GeneratorError::Transient("response had no choices".into()))?;

        debug!(model = %self.config.model, bytes = content.len(), "chat completion received");

        let value: serde_json::Value = serde_json::from_str(content)
            .map_err(|e| GeneratorError::SchemaParse(format!("not valid JSON: {e}")))?;

        let usage = chat.usage.unwrap_or_default();
        Ok(JsonGeneration {
            value,
            usage: UsageInfo {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
        })
    }
}
