//! Latency-masking preamble replies.
//!
//! While the first preparation iteration runs, the engine may emit a short
//! acknowledgement ("Let me check that for you") so the customer is not
//! staring at silence. The perceived-performance policy decides whether one
//! is warranted; the delays are drawn from configured ranges so the reply
//! feels typed rather than instant.

use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use colloquy_core::agents::CompositionMode;
use colloquy_core::canned::PREAMBLE_TAG;
use colloquy_core::correlation::Context;
use colloquy_core::events::{MessagePayload, Participant, StatusPayload};
use colloquy_llm::retry::generate_with_temperatures;
use colloquy_llm::SchematicGenerator;
use colloquy_store::CannedResponseStore;

use crate::context::LoadedContext;
use crate::emission::EventEmitter;
use crate::error::EngineError;
use crate::policy::{agent_wait_times, preamble_required, OptimizationPolicy, PreambleTiming};
use crate::prompts::PromptBuilder;

const PREAMBLE_EXEMPLARS: &[&str] = &[
    "Let me check that for you.",
    "One moment while I look into it.",
    "Good question — give me a second.",
    "Let me pull that up.",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreambleOutcome {
    NotRequired,
    Emitted,
    /// Cancellation arrived mid-preamble; the cycle should stop quietly.
    Bailed,
}

#[derive(Deserialize)]
struct PreambleReply {
    message: String,
}

#[derive(Deserialize)]
struct PreamblePick {
    choice: usize,
}

pub struct PreambleGenerator {
    generator: Arc<dyn SchematicGenerator>,
    policy: Arc<dyn OptimizationPolicy>,
    store: Arc<dyn CannedResponseStore>,
    timing: PreambleTiming,
}

impl PreambleGenerator {
    pub fn new(
        generator: Arc<dyn SchematicGenerator>,
        policy: Arc<dyn OptimizationPolicy>,
        store: Arc<dyn CannedResponseStore>,
        timing: PreambleTiming,
    ) -> Self {
        Self {
            generator,
            policy,
            store,
            timing,
        }
    }

    /// Emit at most one preamble message, then the first `processing`
    /// status. Only called on iteration zero.
    pub async fn maybe_generate(
        &self,
        ctx: &Context,
        loaded: &LoadedContext,
        emitter: &dyn EventEmitter,
    ) -> Result<PreambleOutcome, EngineError> {
        let waits = agent_wait_times(&loaded.interaction.history);
        let last_was_preamble = last_agent_message_was_preamble(loaded);
        if !preamble_required(&waits, last_was_preamble) {
            debug!(prior_waits = waits.len(), "preamble not required");
            return Ok(PreambleOutcome::NotRequired);
        }

        let ctx = ctx.scoped("preamble");
        tokio::time::sleep(self.timing.draw_initial()).await;
        if ctx.is_cancelled() {
            return Ok(PreambleOutcome::Bailed);
        }

        let text = match loaded.agent.composition_mode {
            CompositionMode::CannedStrict => self.pick_canned(&ctx, loaded).await?,
            _ => Some(self.generate_phrase(&ctx, loaded).await?),
        };

        if ctx.is_cancelled() {
            return Ok(PreambleOutcome::Bailed);
        }

        if let Some(text) = text {
            emitter
                .emit_message(
                    ctx.scope().clone(),
                    MessagePayload {
                        message: text,
                        participant: Participant {
                            id: loaded.agent.id.to_string(),
                            display_name: loaded.agent.name.clone(),
                        },
                        draft: None,
                        canned_responses: Vec::new(),
                        tags: vec![PREAMBLE_TAG.to_string()],
                    },
                )
                .await?;
        }

        tokio::time::sleep(self.timing.draw_follow_up()).await;
        if ctx.is_cancelled() {
            return Ok(PreambleOutcome::Bailed);
        }

        emitter
            .emit_status(ctx.scope().clone(), StatusPayload::processing("Interpreting"))
            .await?;

        Ok(PreambleOutcome::Emitted)
    }

    /// Strict mode: shuffle the preamble-tagged templates and have the LLM
    /// pick one verbatim.
    async fn pick_canned(
        &self,
        ctx: &Context,
        loaded: &LoadedContext,
    ) -> Result<Option<String>, EngineError> {
        let mut candidates: Vec<String> = self
            .store
            .find_for_context(&loaded.agent.id, &[], &[])
            .await?
            .into_iter()
            .filter(|c| c.is_preamble() && c.fields.is_empty())
            .map(|c| c.template)
            .collect();

        if candidates.is_empty() {
            return Ok(None);
        }
        candidates.shuffle(&mut rand::thread_rng());
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let numbered: Vec<String> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{}. {}", i + 1, c))
            .collect();
        let prompt = PromptBuilder::new()
            .agent_identity(&loaded.agent, &loaded.customer)
            .interaction_history(&loaded.interaction.history, 4)
            .section("Acknowledgement options", numbered.join("\n"))
            .section(
                "Task",
                "Pick the single option that best acknowledges the customer's last \
                 message. You must pick one of the options exactly as written.",
            )
            .output_schema("Pick one option.", &json!({"choice": 1}))
            .build();

        let generation = generate_with_temperatures::<PreamblePick>(
            self.generator.as_ref(),
            &prompt,
            &json!({
                "type": "object",
                "properties": {"choice": {"type": "integer"}},
                "required": ["choice"]
            }),
            &self.policy.canned_selection_retry_temperatures(),
        )
        .await?;

        let index = generation.value.choice.saturating_sub(1);
        Ok(Some(
            candidates
                .get(index)
                .cloned()
                .unwrap_or_else(|| candidates[0].clone()),
        ))
    }

    async fn generate_phrase(
        &self,
        ctx: &Context,
        loaded: &LoadedContext,
    ) -> Result<String, EngineError> {
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let prompt = PromptBuilder::new()
            .agent_identity(&loaded.agent, &loaded.customer)
            .interaction_history(&loaded.interaction.history, 4)
            .section("Examples", PREAMBLE_EXEMPLARS.join("\n"))
            .section(
                "Task",
                "Write one short bridging phrase acknowledging the customer's last \
                 message while you work on the real answer. No substance, no questions.",
            )
            .output_schema("Produce the phrase.", &json!({"message": "the phrase"}))
            .build();

        let generation = generate_with_temperatures::<PreambleReply>(
            self.generator.as_ref(),
            &prompt,
            &json!({
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"]
            }),
            &self.policy.message_retry_temperatures(),
        )
        .await?;
        Ok(generation.value.message)
    }
}

fn last_agent_message_was_preamble(loaded: &LoadedContext) -> bool {
    loaded
        .interaction
        .history
        .iter()
        .rev()
        .find_map(|e| {
            if e.source == colloquy_core::events::EventSource::AiAgent {
                e.message()
            } else {
                None
            }
        })
        .map(|m| m.tags.iter().any(|t| t == PREAMBLE_TAG))
        .unwrap_or(false)
}
