//! Pre-programmed generator for deterministic testing without API calls.
//!
//! Two dispatch modes, combinable:
//! - **Routes**: a reply keyed by a substring of the prompt. Concurrent
//!   callers (matching batches, tool inferences) hit routes independent of
//!   scheduling order. When several routes match, the longest needle wins.
//! - **Queue**: replies consumed in call order, for strictly sequential call
//!   sites.
//!
//! Routes are tried first; an empty queue with no matching route fails the
//! call loudly rather than hanging the test.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::generator::{
    GenerationHints, GeneratorError, JsonGeneration, SchematicGenerator, UsageInfo,
};

type MockReply = Result<serde_json::Value, GeneratorError>;

struct Route {
    needle: String,
    replies: VecDeque<MockReply>,
    /// Last reply repeats once the queue empties.
    sticky: Option<serde_json::Value>,
}

pub struct MockGenerator {
    routes: Mutex<Vec<Route>>,
    queue: Mutex<VecDeque<MockReply>>,
    delay: Option<Duration>,
    call_count: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    temperatures: Mutex<Vec<Option<f64>>>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            delay: None,
            call_count: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            temperatures: Mutex::new(Vec::new()),
        }
    }

    /// Generator answering from an in-order queue.
    pub fn queued(replies: Vec<MockReply>) -> Self {
        let mock = Self::new();
        *mock.queue.lock() = replies.into();
        mock
    }

    /// Add a reply for any prompt containing `needle`. Repeats indefinitely
    /// when the value is `Ok`.
    pub fn route(self, needle: impl Into<String>, reply: MockReply) -> Self {
        let sticky = reply.as_ref().ok().cloned();
        self.routes.lock().push(Route {
            needle: needle.into(),
            replies: VecDeque::from([reply]),
            sticky,
        });
        self
    }

    /// Add a sequence of replies for prompts containing `needle`; the last
    /// `Ok` value repeats once the sequence is consumed.
    pub fn route_seq(self, needle: impl Into<String>, replies: Vec<MockReply>) -> Self {
        let sticky = replies.iter().rev().find_map(|r| r.as_ref().ok().cloned());
        self.routes.lock().push(Route {
            needle: needle.into(),
            replies: replies.into(),
            sticky,
        });
        self
    }

    /// Simulate provider latency on every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn temperatures(&self) -> Vec<Option<f64>> {
        self.temperatures.lock().clone()
    }

    fn next_reply(&self, prompt: &str) -> MockReply {
        {
            let mut routes = self.routes.lock();
            // Most specific (longest) matching needle wins
            let best = routes
                .iter_mut()
                .filter(|r| prompt.contains(&r.needle))
                .max_by_key(|r| r.needle.len());
            if let Some(route) = best {
                if let Some(reply) = route.replies.pop_front() {
                    return reply;
                }
                if let Some(sticky) = &route.sticky {
                    return Ok(sticky.clone());
                }
            }
        }

        self.queue.lock().pop_front().unwrap_or_else(|| {
            let preview: String = prompt.chars().take(120).collect();
            Err(GeneratorError::InvalidRequest(format!(
                "MockGenerator: no reply configured for prompt: {preview}"
            )))
        })
    }
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchematicGenerator for MockGenerator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate_json(
        &self,
        prompt: &str,
        _schema: &serde_json::Value,
        hints: &GenerationHints,
    ) -> Result<JsonGeneration, GeneratorError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.prompts.lock().push(prompt.to_string());
        self.temperatures.lock().push(hints.temperature);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.next_reply(prompt).map(|value| JsonGeneration {
            value,
            usage: UsageInfo {
                input_tokens: (prompt.len() / 4) as u64,
                output_tokens: 32,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn queued_replies_in_order() {
        let mock = MockGenerator::queued(vec![Ok(json!({"n": 1})), Ok(json!({"n": 2}))]);
        let schema = json!({"type": "object"});
        let a = mock
            .generate_json("first", &schema, &GenerationHints::default())
            .await
            .unwrap();
        let b = mock
            .generate_json("second", &schema, &GenerationHints::default())
            .await
            .unwrap();
        assert_eq!(a.value["n"], 1);
        assert_eq!(b.value["n"], 2);
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_queue_errors() {
        let mock = MockGenerator::queued(vec![]);
        let result = mock
            .generate_json("anything", &json!({}), &GenerationHints::default())
            .await;
        assert!(matches!(result, Err(GeneratorError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn routes_match_by_substring() {
        let mock = MockGenerator::new()
            .route("guideline", Ok(json!({"kind": "matching"})))
            .route("tool", Ok(json!({"kind": "tooling"})));

        let schema = json!({});
        let a = mock
            .generate_json("evaluate each guideline below", &schema, &Default::default())
            .await
            .unwrap();
        let b = mock
            .generate_json("candidate tool description", &schema, &Default::default())
            .await
            .unwrap();
        assert_eq!(a.value["kind"], "matching");
        assert_eq!(b.value["kind"], "tooling");
    }

    #[tokio::test]
    async fn route_ok_reply_repeats() {
        let mock = MockGenerator::new().route("stage", Ok(json!({"x": 1})));
        let schema = json!({});
        for _ in 0..3 {
            let r = mock
                .generate_json("stage prompt", &schema, &Default::default())
                .await
                .unwrap();
            assert_eq!(r.value["x"], 1);
        }
    }

    #[tokio::test]
    async fn route_seq_then_sticky() {
        let mock = MockGenerator::new().route_seq(
            "step",
            vec![
                Err(GeneratorError::Transient("flaky".into())),
                Ok(json!({"ok": true})),
            ],
        );
        let schema = json!({});
        assert!(mock
            .generate_json("step one", &schema, &Default::default())
            .await
            .is_err());
        for _ in 0..2 {
            assert!(mock
                .generate_json("step again", &schema, &Default::default())
                .await
                .is_ok());
        }
    }

    #[tokio::test]
    async fn longest_needle_wins_on_overlap() {
        let mock = MockGenerator::new()
            .route("rule", Ok(json!({"kind": "short"})))
            .route("rule evaluation", Ok(json!({"kind": "long"})));
        let schema = json!({});
        let r = mock
            .generate_json("run the rule evaluation now", &schema, &Default::default())
            .await
            .unwrap();
        assert_eq!(r.value["kind"], "long");
        let r = mock
            .generate_json("just a rule here", &schema, &Default::default())
            .await
            .unwrap();
        assert_eq!(r.value["kind"], "short");
    }

    #[tokio::test]
    async fn records_prompts() {
        let mock = MockGenerator::new().route("", Ok(json!({})));
        let _ = mock
            .generate_json("remember me", &json!({}), &Default::default())
            .await;
        assert_eq!(mock.prompts(), vec!["remember me".to_string()]);
    }
}
