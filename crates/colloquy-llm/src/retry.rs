//! Temperature-ladder retries for schematic generation.
//!
//! Call families each retry up to the length of their temperature ladder:
//! one attempt per temperature, exponential-ish backoff between attempts
//! (200 ms, 600 ms, 1.4 s), honoring server-suggested delays.

use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::generator::{
    generate, Generation, GenerationHints, GeneratorError, SchematicGenerator,
};

/// Backoff delays between attempt `n` and `n+1`.
pub const BACKOFF_DELAYS: [Duration; 3] = [
    Duration::from_millis(200),
    Duration::from_millis(600),
    Duration::from_millis(1400),
];

fn backoff_delay(attempt: usize, suggested: Option<Duration>) -> Duration {
    suggested.unwrap_or_else(|| {
        BACKOFF_DELAYS
            .get(attempt)
            .copied()
            .unwrap_or(BACKOFF_DELAYS[BACKOFF_DELAYS.len() - 1])
    })
}

/// Run a typed generation with one attempt per temperature. Non-retryable
/// errors surface immediately; the last error surfaces once the ladder is
/// exhausted.
pub async fn generate_with_temperatures<T: DeserializeOwned>(
    generator: &dyn SchematicGenerator,
    prompt: &str,
    schema: &serde_json::Value,
    temperatures: &[f64],
) -> Result<Generation<T>, GeneratorError> {
    debug_assert!(!temperatures.is_empty());

    let mut last_error = GeneratorError::Transient("no generation attempts configured".into());

    for (attempt, temperature) in temperatures.iter().enumerate() {
        let hints = GenerationHints::with_temperature(*temperature);
        match generate::<T>(generator, prompt, schema, &hints).await {
            Ok(generation) => return Ok(generation),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                let is_last = attempt + 1 == temperatures.len();
                warn!(
                    attempt = attempt + 1,
                    attempts = temperatures.len(),
                    temperature,
                    kind = e.error_kind(),
                    error = %e,
                    "generation attempt failed"
                );
                if is_last {
                    return Err(e);
                }
                let delay = backoff_delay(attempt, e.suggested_delay());
                last_error = e;
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGenerator;
    use serde_json::json;

    #[derive(serde::Deserialize)]
    struct Reply {
        answer: String,
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_success_needs_no_retry() {
        let mock = MockGenerator::queued(vec![Ok(json!({"answer": "yes"}))]);
        let result = generate_with_temperatures::<Reply>(
            &mock,
            "prompt",
            &json!({"type": "object"}),
            &[0.1, 0.3, 0.5],
        )
        .await
        .unwrap();
        assert_eq!(result.value.answer, "yes");
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let mock = MockGenerator::queued(vec![
            Err(GeneratorError::Transient("503".into())),
            Err(GeneratorError::SchemaParse("truncated".into())),
            Ok(json!({"answer": "eventually"})),
        ]);
        let result = generate_with_temperatures::<Reply>(
            &mock,
            "prompt",
            &json!({"type": "object"}),
            &[0.1, 0.3, 0.5],
        )
        .await
        .unwrap();
        assert_eq!(result.value.answer, "eventually");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_surfaces_immediately() {
        let mock = MockGenerator::queued(vec![
            Err(GeneratorError::InvalidRequest("bad".into())),
            Ok(json!({"answer": "unreachable"})),
        ]);
        let result = generate_with_temperatures::<Reply>(
            &mock,
            "prompt",
            &json!({"type": "object"}),
            &[0.1, 0.3],
        )
        .await;
        assert!(matches!(result, Err(GeneratorError::InvalidRequest(_))));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ladder_exhaustion_returns_last_error() {
        let mock = MockGenerator::queued(vec![
            Err(GeneratorError::Transient("1".into())),
            Err(GeneratorError::Transient("2".into())),
            Err(GeneratorError::Transient("3".into())),
        ]);
        let result = generate_with_temperatures::<Reply>(
            &mock,
            "prompt",
            &json!({"type": "object"}),
            &[0.1, 0.3, 0.5],
        )
        .await;
        assert!(matches!(result, Err(GeneratorError::Transient(msg)) if msg == "3"));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn temperatures_passed_per_attempt() {
        let mock = MockGenerator::queued(vec![
            Err(GeneratorError::Transient("x".into())),
            Ok(json!({"answer": "ok"})),
        ]);
        let _ = generate_with_temperatures::<Reply>(
            &mock,
            "prompt",
            &json!({"type": "object"}),
            &[0.1, 0.7],
        )
        .await
        .unwrap();
        assert_eq!(mock.temperatures(), vec![Some(0.1), Some(0.7)]);
    }
}
