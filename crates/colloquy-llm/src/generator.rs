use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

/// Per-call generation knobs. The engine varies temperature across retry
/// attempts; everything else is adapter-level configuration.
#[derive(Clone, Debug, Default)]
pub struct GenerationHints {
    pub temperature: Option<f64>,
}

impl GenerationHints {
    pub fn with_temperature(temperature: f64) -> Self {
        Self {
            temperature: Some(temperature),
        }
    }
}

/// Token accounting reported by the adapter for one call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UsageInfo {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageInfo {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn accumulate(&mut self, other: &UsageInfo) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Raw JSON result of one generation call.
#[derive(Clone, Debug)]
pub struct JsonGeneration {
    pub value: serde_json::Value,
    pub usage: UsageInfo,
}

/// Schema-typed result of one generation call.
#[derive(Clone, Debug)]
pub struct Generation<T> {
    pub value: T,
    pub usage: UsageInfo,
}

/// Typed error hierarchy for generation calls. Transient errors are retried
/// by callers; fatal and schema errors are not.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("response did not match the requested schema: {0}")]
    SchemaParse(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl GeneratorError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::RateLimited { .. } | Self::SchemaParse(_) | Self::Timeout(_)
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Transient(_) => "transient",
            Self::RateLimited { .. } => "rate_limited",
            Self::SchemaParse(_) => "schema_parse",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// The engine's only view of an LLM: a prompt and a JSON-schema description
/// go in, validated JSON comes out. Adapters own hosting concerns entirely.
#[async_trait]
pub trait SchematicGenerator: Send + Sync {
    /// Human-readable adapter identity for logs.
    fn name(&self) -> &str;

    /// Generate a JSON object following `schema` (a JSON Schema document the
    /// adapter embeds or enforces as it sees fit).
    async fn generate_json(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        hints: &GenerationHints,
    ) -> Result<JsonGeneration, GeneratorError>;
}

/// Typed wrapper over [`SchematicGenerator::generate_json`]: parses the raw
/// value into `T`, mapping parse failures to `SchemaParse` so callers retry.
pub async fn generate<T: DeserializeOwned>(
    generator: &dyn SchematicGenerator,
    prompt: &str,
    schema: &serde_json::Value,
    hints: &GenerationHints,
) -> Result<Generation<T>, GeneratorError> {
    let raw = generator.generate_json(prompt, schema, hints).await?;
    let value: T = serde_json::from_value(raw.value)
        .map_err(|e| GeneratorError::SchemaParse(e.to_string()))?;
    Ok(Generation {
        value,
        usage: raw.usage,
    })
}
