//! Message composition and emission.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `fluid` | Pure-LLM drafting with the temperature-ramp retry |
//! | `canned` | Draft → retrieve → render → select → revise pipeline |
//! | `preamble` | Optional latency-masking acknowledgement reply |
//!
//! The composer produces one final text; emission splits it on blank lines
//! and paces the chunks with typing indicators so the reply reads as typed,
//! not pasted.

pub mod canned;
pub mod fluid;
pub mod preamble;

use std::time::Duration;

use tracing::debug;

use colloquy_core::agents::CompositionMode;
use colloquy_core::correlation::Context;
use colloquy_core::events::{Event, MessagePayload, Participant, SessionStatus, StatusPayload};
use colloquy_llm::UsageInfo;

use crate::context::LoadedContext;
use crate::emission::EventEmitter;
use crate::error::EngineError;
use crate::hooks::EngineHooks;

pub use canned::CannedResponseGenerator;
pub use fluid::FluidGenerator;
pub use preamble::{PreambleGenerator, PreambleOutcome};

/// A composed reply ready for emission.
#[derive(Clone, Debug)]
pub struct ComposedMessage {
    pub text: String,
    /// The pre-selection draft, carried on canned-mode messages.
    pub draft: Option<String>,
    /// Rendered candidate templates considered during selection.
    pub canned_responses: Vec<String>,
    pub tags: Vec<String>,
    pub usage: UsageInfo,
}

/// What emission produced: the message events and how many `ready` statuses
/// went out (the last one terminates the cycle's main path).
#[derive(Debug, Default)]
pub struct EmitOutcome {
    pub message_events: Vec<Event>,
    pub ready_count: usize,
}

/// Split a draft into chunks on blank lines, dropping empty chunks.
pub fn split_draft(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .map(String::from)
        .collect()
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Delay after emitting a chunk, before the next typing indicator: reading
/// time at ~50 words per minute-fraction, floored at half a second.
pub fn post_chunk_delay(words_sent: usize) -> Duration {
    Duration::from_secs_f64((words_sent as f64 / 50.0).max(0.5))
}

/// Delay between the typing indicator and the next chunk: a base pause
/// scaled by how long the next chunk is.
pub fn pre_chunk_delay(next_words: usize) -> Duration {
    let base = if next_words <= 10 { 1.0 } else { 2.0 };
    Duration::from_secs_f64(base + next_words as f64 / 50.0)
}

/// Dispatches to the fluid or canned generator by the agent's composition
/// mode.
pub struct MessageComposer {
    fluid: FluidGenerator,
    canned: CannedResponseGenerator,
}

impl MessageComposer {
    pub fn new(fluid: FluidGenerator, canned: CannedResponseGenerator) -> Self {
        Self { fluid, canned }
    }

    pub async fn compose(
        &self,
        ctx: &Context,
        loaded: &LoadedContext,
    ) -> Result<ComposedMessage, EngineError> {
        let ctx = ctx.scoped("message-composer");
        match loaded.agent.composition_mode {
            CompositionMode::Fluid => self.fluid.compose(&ctx, loaded).await,
            CompositionMode::CannedStrict
            | CompositionMode::CannedComposited
            | CompositionMode::CannedFluid => self.canned.compose(&ctx, loaded, &self.fluid).await,
        }
    }

    /// Emit a composed message as paced chunks. Each emitted chunk is
    /// followed by one `ready`; every inter-chunk gap contains exactly one
    /// `typing`. A chunk hook bail drops that chunk but the rest continue.
    pub async fn emit_composed(
        &self,
        ctx: &Context,
        loaded: &LoadedContext,
        hooks: &EngineHooks,
        composed: &ComposedMessage,
        emitter: &dyn EventEmitter,
    ) -> Result<EmitOutcome, EngineError> {
        let chunks = split_draft(&composed.text);
        let mut outcome = EmitOutcome::default();

        let participant = Participant {
            id: loaded.agent.id.to_string(),
            display_name: loaded.agent.name.clone(),
        };

        let mut emitted_any = false;
        let mut pending_words: Option<usize> = None;

        for chunk in &chunks {
            if !hooks.call_on_message_generated(loaded, chunk).await {
                debug!("message chunk dropped by hook");
                continue;
            }

            if let Some(words_sent) = pending_words.take() {
                tokio::time::sleep(post_chunk_delay(words_sent)).await;
                emitter
                    .emit_status(ctx.scope().clone(), StatusPayload::bare(SessionStatus::Typing))
                    .await?;
                tokio::time::sleep(pre_chunk_delay(word_count(chunk))).await;
            } else if !emitted_any {
                emitter
                    .emit_status(ctx.scope().clone(), StatusPayload::bare(SessionStatus::Typing))
                    .await?;
            }

            let event = emitter
                .emit_message(
                    ctx.scope().clone(),
                    MessagePayload {
                        message: chunk.clone(),
                        participant: participant.clone(),
                        draft: composed.draft.clone(),
                        canned_responses: composed.canned_responses.clone(),
                        tags: composed.tags.clone(),
                    },
                )
                .await?;
            outcome.message_events.push(event);
            emitted_any = true;

            emitter
                .emit_status(ctx.scope().clone(), StatusPayload::bare(SessionStatus::Ready))
                .await?;
            outcome.ready_count += 1;

            pending_words = Some(word_count(chunk));
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_on_blank_lines() {
        let chunks = split_draft("Hello there!\n\nHow can I help?\n\n");
        assert_eq!(chunks, vec!["Hello there!", "How can I help?"]);
    }

    #[test]
    fn whitespace_only_chunks_dropped() {
        let chunks = split_draft("First\n\n   \n\nSecond");
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn single_chunk_unsplit() {
        assert_eq!(split_draft("Just one line.\nStill one chunk."), vec![
            "Just one line.\nStill one chunk."
        ]);
    }

    #[test]
    fn post_chunk_delay_floors_at_half_second() {
        assert_eq!(post_chunk_delay(5), Duration::from_secs_f64(0.5));
        assert_eq!(post_chunk_delay(100), Duration::from_secs_f64(2.0));
    }

    #[test]
    fn pre_chunk_delay_scales_with_length() {
        // Short next chunk: 1s base
        assert_eq!(pre_chunk_delay(10), Duration::from_secs_f64(1.0 + 0.2));
        // Long next chunk: 2s base
        assert_eq!(pre_chunk_delay(25), Duration::from_secs_f64(2.0 + 0.5));
    }

    #[test]
    fn word_counting() {
        assert_eq!(word_count("one two  three"), 3);
        assert_eq!(word_count(""), 0);
    }
}
