//! Canned-response composition.
//!
//! Pipeline: draft the reply as if fluid, retrieve candidate templates,
//! resolve their fields (standard → tool-based → generative) and render,
//! have the LLM pick the best candidate against the draft, then apply the
//! per-mode rule: strict emits a candidate verbatim or the no-match
//! template; composited rewrites the draft in the candidate's style; fluid
//! falls back to the draft when the match is not high quality.

use std::collections::BTreeMap;
use std::sync::Arc;

use minijinja::Environment;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use colloquy_core::agents::CompositionMode;
use colloquy_core::canned::{template_fields, CannedResponse};
use colloquy_core::correlation::Context;
use colloquy_core::events::ToolEventPayload;
use colloquy_core::ids::{GuidelineId, JourneyId};
use colloquy_llm::retry::generate_with_temperatures;
use colloquy_llm::{SchematicGenerator, UsageInfo};
use colloquy_store::CannedResponseStore;

use crate::context::LoadedContext;
use crate::error::EngineError;
use crate::message::{ComposedMessage, FluidGenerator};
use crate::policy::OptimizationPolicy;
use crate::prompts::PromptBuilder;

pub const DEFAULT_NO_MATCH_TEMPLATE: &str =
    "I'm sorry, I don't have a good answer for that. Could you rephrase?";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchQuality {
    High,
    Partial,
    None,
}

#[derive(Deserialize)]
struct SelectionReply {
    /// 1-based index into the candidate list, or null when nothing fits.
    choice: Option<usize>,
    match_quality: MatchQuality,
}

#[derive(Deserialize)]
struct RevisionReply {
    message: String,
}

#[derive(Deserialize)]
struct ExtractionReply {
    value: Option<String>,
}

struct RenderedCandidate {
    text: String,
}

pub struct CannedResponseGenerator {
    generator: Arc<dyn SchematicGenerator>,
    policy: Arc<dyn OptimizationPolicy>,
    store: Arc<dyn CannedResponseStore>,
    no_match_template: String,
}

impl CannedResponseGenerator {
    pub fn new(
        generator: Arc<dyn SchematicGenerator>,
        policy: Arc<dyn OptimizationPolicy>,
        store: Arc<dyn CannedResponseStore>,
    ) -> Self {
        Self {
            generator,
            policy,
            store,
            no_match_template: DEFAULT_NO_MATCH_TEMPLATE.to_string(),
        }
    }

    pub fn with_no_match_template(mut self, template: impl Into<String>) -> Self {
        self.no_match_template = template.into();
        self
    }

    pub async fn compose(
        &self,
        ctx: &Context,
        loaded: &LoadedContext,
        fluid: &FluidGenerator,
    ) -> Result<ComposedMessage, EngineError> {
        let mode = loaded.agent.composition_mode;
        let draft = fluid.draft(ctx, loaded).await?;
        let mut usage = draft.usage;

        let journey_ids: Vec<JourneyId> =
            loaded.state.journeys.iter().map(|j| j.id.clone()).collect();
        let guideline_ids: Vec<GuidelineId> = loaded
            .state
            .all_matches()
            .map(|m| m.guideline.id.clone())
            .collect();
        let candidates = self
            .store
            .find_for_context(&loaded.agent.id, &journey_ids, &guideline_ids)
            .await?;

        let ranked = rank_candidates(&draft.text, candidates);
        let rendered = self
            .render_candidates(ctx, loaded, &draft.text, ranked, &mut usage)
            .await?;

        if rendered.is_empty() {
            debug!("no renderable canned candidates");
            return Ok(self.no_candidate_fallback(mode, draft, usage));
        }

        let (selection, selection_usage) = self.select(ctx, loaded, &draft.text, &rendered).await?;
        usage.accumulate(&selection_usage);

        let rendered_texts: Vec<String> = rendered.iter().map(|c| c.text.clone()).collect();
        let chosen = selection
            .choice
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| rendered.get(i));

        let text = match (mode, chosen, selection.match_quality) {
            (CompositionMode::CannedStrict, Some(candidate), MatchQuality::High) => {
                candidate.text.clone()
            }
            (CompositionMode::CannedStrict, _, _) => self.no_match_template.clone(),
            (CompositionMode::CannedComposited, Some(candidate), _) => {
                let (revised, revision_usage) =
                    self.revise(ctx, loaded, &draft.text, &candidate.text).await?;
                usage.accumulate(&revision_usage);
                revised
            }
            (CompositionMode::CannedComposited, None, _) => draft.text.clone(),
            (CompositionMode::CannedFluid, Some(candidate), MatchQuality::High) => {
                candidate.text.clone()
            }
            (CompositionMode::CannedFluid, _, _) => draft.text.clone(),
            // Fluid agents never reach the canned generator
            (CompositionMode::Fluid, _, _) => draft.text.clone(),
        };

        Ok(ComposedMessage {
            text,
            draft: Some(draft.text),
            canned_responses: rendered_texts,
            tags: Vec::new(),
            usage,
        })
    }

    fn no_candidate_fallback(
        &self,
        mode: CompositionMode,
        draft: ComposedMessage,
        usage: UsageInfo,
    ) -> ComposedMessage {
        let text = match mode {
            CompositionMode::CannedStrict => self.no_match_template.clone(),
            _ => draft.text.clone(),
        };
        ComposedMessage {
            text,
            draft: Some(draft.text),
            canned_responses: Vec::new(),
            tags: Vec::new(),
            usage,
        }
    }

    /// Resolve each candidate's fields and render it; candidates with a
    /// field no method can supply are discarded.
    async fn render_candidates(
        &self,
        ctx: &Context,
        loaded: &LoadedContext,
        draft: &str,
        candidates: Vec<CannedResponse>,
        usage: &mut UsageInfo,
    ) -> Result<Vec<RenderedCandidate>, EngineError> {
        let std_context = standard_context(loaded);
        let tool_fields = tool_field_values(loaded);
        let env = Environment::new();

        let mut rendered = Vec::new();
        'candidates: for candidate in candidates {
            let mut render_ctx = serde_json::Map::new();
            render_ctx.insert("std".into(), std_context.clone());

            for field in template_fields(&candidate.template) {
                if field == "std" {
                    continue;
                }
                if let Some(value) = tool_fields.get(&field) {
                    render_ctx.insert(field, value.clone());
                    continue;
                }
                match self.extract_field(ctx, loaded, draft, &field).await? {
                    (Some(value), extraction_usage) => {
                        usage.accumulate(&extraction_usage);
                        render_ctx.insert(field, json!(value));
                    }
                    (None, extraction_usage) => {
                        usage.accumulate(&extraction_usage);
                        debug!(field, "field unresolvable; discarding candidate");
                        continue 'candidates;
                    }
                }
            }

            match env.render_str(&candidate.template, serde_json::Value::Object(render_ctx)) {
                Ok(text) => rendered.push(RenderedCandidate { text }),
                Err(e) => {
                    debug!(error = %e, "template failed to render; discarding candidate");
                }
            }
        }
        Ok(rendered)
    }

    /// Generative field resolution: the LLM extracts the value from the
    /// draft and interaction, or reports it unavailable.
    async fn extract_field(
        &self,
        ctx: &Context,
        loaded: &LoadedContext,
        draft: &str,
        field: &str,
    ) -> Result<(Option<String>, UsageInfo), EngineError> {
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let prompt = PromptBuilder::new()
            .agent_identity(&loaded.agent, &loaded.customer)
            .interaction_history(
                &loaded.interaction.history,
                self.policy.max_history_for_message_generation(),
            )
            .section("Drafted reply", draft)
            .section(
                "Task",
                format!(
                    "Extract the value of \"{field}\" from the drafted reply and the \
                     conversation. Use null if the value is not determinable."
                ),
            )
            .output_schema(
                "Extract the field value.",
                &json!({"value": "the extracted value or null"}),
            )
            .build();

        let generation = generate_with_temperatures::<ExtractionReply>(
            self.generator.as_ref(),
            &prompt,
            &json!({
                "type": "object",
                "properties": {"value": {"type": ["string", "null"]}},
                "required": ["value"]
            }),
            &self.policy.canned_selection_retry_temperatures(),
        )
        .await?;
        Ok((generation.value.value, generation.usage))
    }

    async fn select(
        &self,
        ctx: &Context,
        loaded: &LoadedContext,
        draft: &str,
        rendered: &[RenderedCandidate],
    ) -> Result<(SelectionReply, UsageInfo), EngineError> {
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let numbered: Vec<String> = rendered
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{}. {}", i + 1, c.text))
            .collect();

        let prompt = PromptBuilder::new()
            .agent_identity(&loaded.agent, &loaded.customer)
            .section("Drafted reply", draft)
            .section("Candidate replies", numbered.join("\n"))
            .section(
                "Task",
                "Pick the candidate that best conveys the drafted reply. Report match \
                 quality: \"high\" when a candidate says essentially the same thing, \
                 \"partial\" when it covers only part, \"none\" when nothing fits (use a \
                 null choice).",
            )
            .output_schema(
                "Select the best candidate.",
                &json!({"choice": 1, "match_quality": "high"}),
            )
            .build();

        let generation = generate_with_temperatures::<SelectionReply>(
            self.generator.as_ref(),
            &prompt,
            &json!({
                "type": "object",
                "properties": {
                    "choice": {"type": ["integer", "null"]},
                    "match_quality": {"type": "string", "enum": ["high", "partial", "none"]}
                },
                "required": ["match_quality"]
            }),
            &self.policy.canned_selection_retry_temperatures(),
        )
        .await?;
        Ok((generation.value, generation.usage))
    }

    /// Rewrite the draft in the style of the selected template, preserving
    /// factual content.
    async fn revise(
        &self,
        ctx: &Context,
        loaded: &LoadedContext,
        draft: &str,
        selected: &str,
    ) -> Result<(String, UsageInfo), EngineError> {
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let prompt = PromptBuilder::new()
            .agent_identity(&loaded.agent, &loaded.customer)
            .section("Drafted reply", draft)
            .section("Style reference", selected)
            .section(
                "Task",
                "Rewrite the drafted reply in the voice and structure of the style \
                 reference. Keep every fact from the draft; change only phrasing.",
            )
            .output_schema(
                "Rewrite the reply.",
                &json!({"message": "the rewritten reply"}),
            )
            .build();

        let generation = generate_with_temperatures::<RevisionReply>(
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
        Ok((generation.value.message, generation.usage))
    }
}

/// Standard template namespace: `std.customer.name`, `std.agent.name`,
/// `std.variables.*`, `std.missing_params`.
fn standard_context(loaded: &LoadedContext) -> serde_json::Value {
    let variables: serde_json::Map<String, serde_json::Value> = loaded
        .state
        .context_variables
        .iter()
        .map(|(var, value)| (var.name.clone(), value.data.clone()))
        .collect();
    let missing: Vec<String> = loaded
        .state
        .tool_insights
        .filter_problematic()
        .missing_data
        .iter()
        .map(|p| p.parameter.clone())
        .collect();
    json!({
        "customer": {"name": loaded.customer.name},
        "agent": {"name": loaded.agent.name},
        "variables": variables,
        "missing_params": missing,
    })
}

/// Field values supplied by this cycle's tool results.
fn tool_field_values(loaded: &LoadedContext) -> BTreeMap<String, serde_json::Value> {
    let mut fields = BTreeMap::new();
    for event in &loaded.state.tool_events {
        let Ok(payload) = serde_json::from_value::<ToolEventPayload>(event.data.clone()) else {
            continue;
        };
        for record in payload.tool_calls {
            for (name, value) in record.result.canned_response_fields {
                fields.insert(name, value);
            }
        }
    }
    fields
}

/// Order candidates by lexical overlap between the draft and the template
/// plus its signals, best first. Stands in for the vector ranking the
/// engine's stores do not own.
fn rank_candidates(draft: &str, candidates: Vec<CannedResponse>) -> Vec<CannedResponse> {
    let draft_words: Vec<String> = draft
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect();

    let mut scored: Vec<(usize, CannedResponse)> = candidates
        .into_iter()
        .map(|c| {
            let haystack = format!("{} {}", c.template, c.signals.join(" ")).to_lowercase();
            let score = draft_words.iter().filter(|w| haystack.contains(*w)).count();
            (score, c)
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().map(|(_, c)| c).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use colloquy_core::agents::Agent;
    use colloquy_core::correlation::CorrelationScope;
    use colloquy_core::customers::Customer;
    use colloquy_core::events::{Event, EventKind, EventSource, ToolCallRecord};
    use colloquy_core::ids::EventId;
    use colloquy_core::sessions::Session;
    use colloquy_core::tools::{ToolCall, ToolId, ToolResult};
    use colloquy_llm::mock::MockGenerator;
    use colloquy_store::MemoryStores;

    use crate::policy::BasicOptimizationPolicy;

    fn loaded(mode: CompositionMode) -> LoadedContext {
        let mut agent = Agent::new("Quinn", "support");
        agent.composition_mode = mode;
        let customer = Customer::guest();
        let session = Session::new(agent.id.clone(), customer.id.clone());
        LoadedContext::new(session, agent, customer, Vec::new())
    }

    fn generators(mock: Arc<MockGenerator>, stores: Arc<MemoryStores>) -> (FluidGenerator, CannedResponseGenerator) {
        let policy = Arc::new(BasicOptimizationPolicy);
        (
            FluidGenerator::new(mock.clone(), policy.clone()),
            CannedResponseGenerator::new(mock, policy, stores),
        )
    }

    fn tool_event_with_fields(fields: &[(&str, serde_json::Value)]) -> Event {
        let mut result = ToolResult::ok(json!({}));
        for (name, value) in fields {
            result
                .canned_response_fields
                .insert((*name).into(), value.clone());
        }
        Event {
            id: EventId::new(),
            offset: 0,
            kind: EventKind::Tool,
            source: EventSource::AiAgent,
            correlation_id: CorrelationScope::from_raw("Rx"),
            creation_utc: Utc::now(),
            data: serde_json::to_value(ToolEventPayload {
                tool_calls: vec![ToolCallRecord {
                    call: ToolCall {
                        tool_id: ToolId::new("inventory", "check"),
                        arguments: Default::default(),
                    },
                    result,
                }],
            })
            .unwrap(),
        }
    }

    #[tokio::test]
    async fn strict_high_quality_emits_candidate_verbatim() {
        let stores = MemoryStores::new();
        stores.add_canned_response(CannedResponse::new(
            "We have {{count}} units in stock right now.",
        ));
        let mock = Arc::new(
            MockGenerator::new()
                .route("Produce the reply", Ok(json!({"message": "We have 14 in stock."})))
                .route(
                    "Candidate replies",
                    Ok(json!({"choice": 1, "match_quality": "high"})),
                ),
        );
        let (fluid, canned) = generators(mock, stores);

        let mut ctx = loaded(CompositionMode::CannedStrict);
        ctx.state
            .tool_events
            .push(tool_event_with_fields(&[("count", json!(14))]));

        let composed = canned
            .compose(&Context::root(), &ctx, &fluid)
            .await
            .unwrap();
        assert_eq!(composed.text, "We have 14 units in stock right now.");
        assert_eq!(composed.draft.as_deref(), Some("We have 14 in stock."));
        assert!(composed
            .canned_responses
            .contains(&"We have 14 units in stock right now.".to_string()));
    }

    #[tokio::test]
    async fn strict_low_quality_falls_back_to_no_match_template() {
        let stores = MemoryStores::new();
        stores.add_canned_response(CannedResponse::new("Our store opens at nine."));
        let mock = Arc::new(
            MockGenerator::new()
                .route("Produce the reply", Ok(json!({"message": "Quantum computing is neat."})))
                .route(
                    "Candidate replies",
                    Ok(json!({"choice": null, "match_quality": "none"})),
                ),
        );
        let (fluid, canned) = generators(mock, stores);

        let composed = canned
            .compose(&Context::root(), &loaded(CompositionMode::CannedStrict), &fluid)
            .await
            .unwrap();
        assert_eq!(composed.text, DEFAULT_NO_MATCH_TEMPLATE);
    }

    #[tokio::test]
    async fn strict_out_of_range_choice_rejected() {
        let stores = MemoryStores::new();
        stores.add_canned_response(CannedResponse::new("Only candidate."));
        let mock = Arc::new(
            MockGenerator::new()
                .route("Produce the reply", Ok(json!({"message": "hello"})))
                .route(
                    "Candidate replies",
                    Ok(json!({"choice": 7, "match_quality": "high"})),
                ),
        );
        let (fluid, canned) = generators(mock, stores);

        let composed = canned
            .compose(&Context::root(), &loaded(CompositionMode::CannedStrict), &fluid)
            .await
            .unwrap();
        assert_eq!(composed.text, DEFAULT_NO_MATCH_TEMPLATE);
    }

    #[tokio::test]
    async fn canned_fluid_uses_draft_when_quality_partial() {
        let stores = MemoryStores::new();
        stores.add_canned_response(CannedResponse::new("Partially related reply."));
        let mock = Arc::new(
            MockGenerator::new()
                .route("Produce the reply", Ok(json!({"message": "The full specific answer."})))
                .route(
                    "Candidate replies",
                    Ok(json!({"choice": 1, "match_quality": "partial"})),
                ),
        );
        let (fluid, canned) = generators(mock, stores);

        let composed = canned
            .compose(&Context::root(), &loaded(CompositionMode::CannedFluid), &fluid)
            .await
            .unwrap();
        assert_eq!(composed.text, "The full specific answer.");
    }

    #[tokio::test]
    async fn composited_revises_draft_in_template_style() {
        let stores = MemoryStores::new();
        stores.add_canned_response(CannedResponse::new("Certainly! The item is available."));
        let mock = Arc::new(
            MockGenerator::new()
                .route("Produce the reply", Ok(json!({"message": "yes we have it"})))
                .route(
                    "Candidate replies",
                    Ok(json!({"choice": 1, "match_quality": "partial"})),
                )
                .route(
                    "Rewrite the drafted reply",
                    Ok(json!({"message": "Certainly! We have it in stock."})),
                ),
        );
        let (fluid, canned) = generators(mock, stores);

        let composed = canned
            .compose(
                &Context::root(),
                &loaded(CompositionMode::CannedComposited),
                &fluid,
            )
            .await
            .unwrap();
        assert_eq!(composed.text, "Certainly! We have it in stock.");
    }

    #[tokio::test]
    async fn unresolvable_field_discards_candidate() {
        let stores = MemoryStores::new();
        stores.add_canned_response(CannedResponse::new("Your order {{order_id}} shipped."));
        let mock = Arc::new(
            MockGenerator::new()
                .route("Produce the reply", Ok(json!({"message": "hi there"})))
                .route("Extract the field value", Ok(json!({"value": null}))),
        );
        let (fluid, canned) = generators(mock, stores);

        // Sole candidate discarded → strict falls to no-match without a
        // selection call
        let composed = canned
            .compose(&Context::root(), &loaded(CompositionMode::CannedStrict), &fluid)
            .await
            .unwrap();
        assert_eq!(composed.text, DEFAULT_NO_MATCH_TEMPLATE);
    }

    #[tokio::test]
    async fn std_fields_resolve_without_llm() {
        let stores = MemoryStores::new();
        stores.add_canned_response(CannedResponse::new("Hello {{std.customer.name}}!"));
        let mock = Arc::new(
            MockGenerator::new()
                .route("Produce the reply", Ok(json!({"message": "greetings"})))
                .route(
                    "Candidate replies",
                    Ok(json!({"choice": 1, "match_quality": "high"})),
                ),
        );
        let (fluid, canned) = generators(mock.clone(), stores);

        let composed = canned
            .compose(&Context::root(), &loaded(CompositionMode::CannedStrict), &fluid)
            .await
            .unwrap();
        assert_eq!(composed.text, "Hello Guest!");
        // Two calls only: draft + selection, no extraction
        assert_eq!(mock.call_count(), 2);
    }

    #[test]
    fn ranking_prefers_lexical_overlap() {
        let a = CannedResponse::new("We stock laptops and tablets.");
        let mut b = CannedResponse::new("Our opening hours are nine to five.");
        b.signals.push("when are you open".into());
        let ranked = rank_candidates("do you have laptops available", vec![b.clone(), a.clone()]);
        assert_eq!(ranked[0].template, a.template);
    }
}
