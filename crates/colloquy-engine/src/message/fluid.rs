//! Free-text drafting.
//!
//! One prompt carrying the full working set; up to three attempts at rising
//! temperatures, accepting the first response that parses into the schema.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use colloquy_core::correlation::Context;
use colloquy_llm::retry::generate_with_temperatures;
use colloquy_llm::SchematicGenerator;

use crate::context::LoadedContext;
use crate::error::EngineError;
use crate::message::ComposedMessage;
use crate::policy::OptimizationPolicy;
use crate::prompts::PromptBuilder;

const GENERAL_INSTRUCTIONS: &str = "Write the agent's next reply to the customer. Stay \
    within the matched guidelines and the known capabilities. Never mention internal \
    machinery: no tool names, no rule texts, no correlation identifiers. If information \
    the customer asked for is listed as missing, ask for it plainly. Separate \
    independently readable parts of the reply with a blank line.";

const EXEMPLARS: &str = "Good replies are short, specific, and grounded in tool results \
    when present. Example: \"We have 14 laptops in stock right now. Want me to put one \
    aside for you?\" Example: \"I can book that flight, but I still need your departure \
    city and travel dates.\"";

#[derive(Deserialize)]
struct FluidDraft {
    message: String,
}

pub struct FluidGenerator {
    generator: Arc<dyn SchematicGenerator>,
    policy: Arc<dyn OptimizationPolicy>,
}

impl FluidGenerator {
    pub fn new(generator: Arc<dyn SchematicGenerator>, policy: Arc<dyn OptimizationPolicy>) -> Self {
        Self { generator, policy }
    }

    pub async fn compose(
        &self,
        ctx: &Context,
        loaded: &LoadedContext,
    ) -> Result<ComposedMessage, EngineError> {
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let prompt = self.prompt(loaded);
        let generation = generate_with_temperatures::<FluidDraft>(
            self.generator.as_ref(),
            &prompt,
            &Self::schema(),
            &self.policy.message_retry_temperatures(),
        )
        .await?;

        Ok(ComposedMessage {
            text: generation.value.message,
            draft: None,
            canned_responses: Vec::new(),
            tags: Vec::new(),
            usage: generation.usage,
        })
    }

    /// Draft text for the canned pipeline: same prompt, but the result feeds
    /// selection rather than emission.
    pub async fn draft(
        &self,
        ctx: &Context,
        loaded: &LoadedContext,
    ) -> Result<ComposedMessage, EngineError> {
        self.compose(ctx, loaded).await
    }

    fn prompt(&self, loaded: &LoadedContext) -> String {
        let insights = loaded.state.tool_insights.filter_problematic();
        PromptBuilder::new()
            .section("Instructions", GENERAL_INSTRUCTIONS)
            .agent_identity(&loaded.agent, &loaded.customer)
            .interaction_history(
                &loaded.interaction.history,
                self.policy.max_history_for_message_generation(),
            )
            .guideline_matches("Guidelines", &loaded.state.ordinary_matches)
            .guideline_matches(
                "Guidelines backed by tools",
                &loaded.state.tool_enabled_matches,
            )
            .tool_results(&loaded.state.tool_events)
            .glossary(&loaded.state.glossary_terms)
            .capabilities(&loaded.state.capabilities)
            .context_variables(&loaded.state.context_variables)
            .tool_insights(&insights)
            .section("Style", EXEMPLARS)
            .output_schema(
                "Produce the reply.",
                &json!({"message": "the full reply text"}),
            )
            .build()
    }

    fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "message": {"type": "string"}
            },
            "required": ["message"]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_core::agents::Agent;
    use colloquy_core::customers::Customer;
    use colloquy_core::guidelines::{Guideline, GuidelineMatch};
    use colloquy_core::sessions::Session;
    use colloquy_llm::mock::MockGenerator;
    use colloquy_llm::GeneratorError;
    use crate::policy::BasicOptimizationPolicy;

    fn loaded() -> LoadedContext {
        let agent = Agent::new("Quinn", "support");
        let customer = Customer::guest();
        let session = Session::new(agent.id.clone(), customer.id.clone());
        LoadedContext::new(session, agent, customer, Vec::new())
    }

    #[tokio::test]
    async fn first_valid_response_accepted() {
        let mock = Arc::new(MockGenerator::new().route(
            "Produce the reply",
            Ok(json!({"message": "Hello! How can I help?"})),
        ));
        let generator = FluidGenerator::new(mock.clone(), Arc::new(BasicOptimizationPolicy));
        let composed = generator.compose(&Context::root(), &loaded()).await.unwrap();
        assert_eq!(composed.text, "Hello! How can I help?");
        assert_eq!(mock.call_count(), 1);
        assert_eq!(mock.temperatures()[0], Some(0.1));
    }

    #[tokio::test(start_paused = true)]
    async fn temperature_ramps_across_attempts() {
        let mock = Arc::new(MockGenerator::new().route_seq(
            "Produce the reply",
            vec![
                Err(GeneratorError::SchemaParse("junk".into())),
                Err(GeneratorError::SchemaParse("junk".into())),
                Ok(json!({"message": "third time lucky"})),
            ],
        ));
        let generator = FluidGenerator::new(mock.clone(), Arc::new(BasicOptimizationPolicy));
        let composed = generator.compose(&Context::root(), &loaded()).await.unwrap();
        assert_eq!(composed.text, "third time lucky");
        assert_eq!(
            mock.temperatures(),
            vec![Some(0.1), Some(0.3), Some(0.5)]
        );
    }

    #[tokio::test]
    async fn prompt_carries_matches_and_insights() {
        let mock = Arc::new(MockGenerator::new().route(
            "Produce the reply",
            Ok(json!({"message": "ok"})),
        ));
        let generator = FluidGenerator::new(mock.clone(), Arc::new(BasicOptimizationPolicy));

        let mut ctx = loaded();
        ctx.state.ordinary_matches.push(GuidelineMatch {
            guideline: Guideline::new("asked about weather", "ask for their location"),
            score: 0.9,
            rationale: "weather".into(),
            metadata: None,
        });
        ctx.state.tool_insights.missing_data.push(crate::context::ProblemParameter {
            tool_id: colloquy_core::tools::ToolId::new("travel", "book_flight"),
            parameter: "destination".into(),
            precedence: 0.9,
        });

        generator.compose(&Context::root(), &ctx).await.unwrap();
        let prompt = &mock.prompts()[0];
        assert!(prompt.contains("ask for their location"));
        assert!(prompt.contains("destination"));
        assert!(prompt.contains("Never mention internal machinery"));
    }

    #[tokio::test]
    async fn cancelled_context_rejected() {
        let mock = Arc::new(MockGenerator::new());
        let generator = FluidGenerator::new(mock, Arc::new(BasicOptimizationPolicy));
        let ctx = Context::root();
        ctx.cancel_token().cancel();
        assert!(matches!(
            generator.compose(&ctx, &loaded()).await,
            Err(EngineError::Cancelled)
        ));
    }
}
