//! The default matching strategy.
//!
//! Classifies guidelines into six buckets, each with its own evaluation
//! framing, and produces dynamically sized batches per bucket. Every batch
//! issues one LLM call returning per-guideline decisions in input order.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use colloquy_core::correlation::Context;
use colloquy_core::guidelines::{Guideline, GuidelineMatch};
use colloquy_llm::retry::generate_with_temperatures;
use colloquy_llm::SchematicGenerator;

use super::response_analysis::{AnalysisSnapshot, GenericAnalysisBatch};
use super::strategy::{
    GuidelineMatchingBatch, GuidelineMatchingStrategy, ResponseAnalysisBatch,
};
use super::{MatchingBatchResult, MatchingSnapshot};
use crate::error::EngineError;
use crate::policy::OptimizationPolicy;
use crate::prompts::PromptBuilder;

/// The six evaluation buckets of the generic strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuidelineBucket {
    JourneyStep,
    Observational,
    Disambiguation,
    PrevAppliedCustomerDependent,
    PrevAppliedActionable,
    Actionable,
}

impl GuidelineBucket {
    fn instructions(&self) -> &'static str {
        match self {
            Self::JourneyStep => {
                "Each rule below is a step in an ongoing multi-turn process. Decide which \
                 single step the conversation has reached; a step applies only if its \
                 transition condition holds right now."
            }
            Self::Observational => {
                "Each rule below is a pure observation with no action. Decide whether the \
                 observation currently holds for this conversation."
            }
            Self::Disambiguation => {
                "Each rule below detects an ambiguous customer request that must be \
                 clarified before acting. Decide whether the customer's intent is \
                 genuinely ambiguous between the alternatives the rule covers."
            }
            Self::PrevAppliedCustomerDependent => {
                "Each rule below was already acted on earlier in this conversation, but its \
                 outcome depends on what the customer says. Decide whether the customer's \
                 latest input calls for acting on it again."
            }
            Self::PrevAppliedActionable => {
                "Each rule below was already acted on earlier in this conversation. It \
                 applies again only if the customer has explicitly reopened the topic."
            }
            Self::Actionable => {
                "Decide, for each rule below, whether its condition holds for the current \
                 state of the conversation."
            }
        }
    }
}

/// Classify one guideline against the current snapshot.
pub fn classify(guideline: &Guideline, snapshot: &MatchingSnapshot) -> GuidelineBucket {
    if let Some(journey_id) = guideline.journey_id() {
        if snapshot.journey_is_active(journey_id) {
            return GuidelineBucket::JourneyStep;
        }
    }
    if guideline.is_observational() {
        return if guideline.is_disambiguation_head() {
            GuidelineBucket::Disambiguation
        } else {
            GuidelineBucket::Observational
        };
    }
    let applied = snapshot.applied_guideline_ids.contains(&guideline.id);
    if applied && !guideline.metadata.continuous {
        return if guideline.metadata.customer_dependent_action_data {
            GuidelineBucket::PrevAppliedCustomerDependent
        } else {
            GuidelineBucket::PrevAppliedActionable
        };
    }
    GuidelineBucket::Actionable
}

pub struct GenericStrategy {
    generator: Arc<dyn SchematicGenerator>,
    policy: Arc<dyn OptimizationPolicy>,
}

impl GenericStrategy {
    pub fn new(generator: Arc<dyn SchematicGenerator>, policy: Arc<dyn OptimizationPolicy>) -> Self {
        Self { generator, policy }
    }
}

#[async_trait]
impl GuidelineMatchingStrategy for GenericStrategy {
    fn name(&self) -> &'static str {
        "generic"
    }

    async fn create_matching_batches(
        &self,
        guidelines: Vec<Guideline>,
        snapshot: Arc<MatchingSnapshot>,
    ) -> Vec<Box<dyn GuidelineMatchingBatch>> {
        let total = guidelines.len();
        let batch_size = self.policy.matching_batch_size(total);

        // Bucket in input order, then chunk each bucket.
        let mut buckets: Vec<(GuidelineBucket, Vec<Guideline>)> = Vec::new();
        for guideline in guidelines {
            let bucket = classify(&guideline, &snapshot);
            match buckets.iter().position(|(b, _)| *b == bucket) {
                Some(i) => buckets[i].1.push(guideline),
                None => buckets.push((bucket, vec![guideline])),
            }
        }

        let mut batches: Vec<Box<dyn GuidelineMatchingBatch>> = Vec::new();
        for (bucket, group) in buckets {
            for chunk in group.chunks(batch_size) {
                batches.push(Box::new(GenericMatchingBatch {
                    bucket,
                    guidelines: chunk.to_vec(),
                    snapshot: snapshot.clone(),
                    generator: self.generator.clone(),
                    policy: self.policy.clone(),
                }));
            }
        }
        debug!(batch_count = batches.len(), batch_size, "created matching batches");
        batches
    }

    async fn create_response_analysis_batches(
        &self,
        matches: Vec<GuidelineMatch>,
        snapshot: Arc<AnalysisSnapshot>,
    ) -> Vec<Box<dyn ResponseAnalysisBatch>> {
        let batch_size = self.policy.matching_batch_size(matches.len()).max(1);
        matches
            .chunks(batch_size)
            .map(|chunk| {
                Box::new(GenericAnalysisBatch::new(
                    chunk.to_vec(),
                    snapshot.clone(),
                    self.generator.clone(),
                    self.policy.clone(),
                )) as Box<dyn ResponseAnalysisBatch>
            })
            .collect()
    }

    /// A journey-node match is retained only if its journey is in the
    /// activated set; everything else passes through untouched.
    async fn transform_matches(
        &self,
        snapshot: &MatchingSnapshot,
        matches: Vec<GuidelineMatch>,
    ) -> Vec<GuidelineMatch> {
        matches
            .into_iter()
            .filter(|m| match m.guideline.journey_id() {
                Some(journey_id) => snapshot.journey_is_active(journey_id),
                None => true,
            })
            .collect()
    }
}

#[derive(Deserialize)]
struct BatchReply {
    decisions: Vec<Decision>,
}

#[derive(Deserialize)]
struct Decision {
    rule_number: usize,
    applies: bool,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    rationale: String,
}

struct GenericMatchingBatch {
    bucket: GuidelineBucket,
    guidelines: Vec<Guideline>,
    snapshot: Arc<MatchingSnapshot>,
    generator: Arc<dyn SchematicGenerator>,
    policy: Arc<dyn OptimizationPolicy>,
}

impl GenericMatchingBatch {
    fn prompt(&self) -> String {
        let rules: Vec<String> = self
            .guidelines
            .iter()
            .enumerate()
            .map(|(i, g)| {
                let action = g.action.as_deref().unwrap_or("(observation only)");
                format!("{}. Condition: {} | Action: {}", i + 1, g.condition, action)
            })
            .collect();

        PromptBuilder::new()
            .agent_identity(&self.snapshot.agent, &self.snapshot.customer)
            .interaction_history(
                &self.snapshot.interaction_history,
                self.policy.max_history_for_matching(),
            )
            .context_variables(&self.snapshot.context_variables)
            .glossary(&self.snapshot.terms)
            .tool_results(&self.snapshot.staged_tool_events)
            .section("Task", self.bucket.instructions())
            .section("Rules", rules.join("\n"))
            .output_schema(
                "Evaluate every rule, in the order given.",
                &json!({
                    "decisions": [{
                        "rule_number": 1,
                        "applies": true,
                        "score": 0.9,
                        "rationale": "why the condition holds or not"
                    }]
                }),
            )
            .build()
    }

    fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "decisions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "rule_number": {"type": "integer"},
                            "applies": {"type": "boolean"},
                            "score": {"type": "number"},
                            "rationale": {"type": "string"}
                        },
                        "required": ["rule_number", "applies"]
                    }
                }
            },
            "required": ["decisions"]
        })
    }
}

#[async_trait]
impl GuidelineMatchingBatch for GenericMatchingBatch {
    async fn process(&self, ctx: &Context) -> Result<MatchingBatchResult, EngineError> {
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let generation = generate_with_temperatures::<BatchReply>(
            self.generator.as_ref(),
            &self.prompt(),
            &Self::schema(),
            &self.policy.matching_retry_temperatures(),
        )
        .await?;

        // Map decisions back to guidelines by rule number, preserving input
        // order in the emitted matches.
        let mut matches = Vec::new();
        for (i, guideline) in self.guidelines.iter().enumerate() {
            let decision = generation
                .value
                .decisions
                .iter()
                .find(|d| d.rule_number == i + 1);
            if let Some(d) = decision {
                if d.applies {
                    matches.push(GuidelineMatch {
                        guideline: guideline.clone(),
                        score: if d.score > 0.0 { d.score.min(1.0) } else { 1.0 },
                        rationale: d.rationale.clone(),
                        metadata: None,
                    });
                }
            }
        }

        Ok(MatchingBatchResult {
            matches,
            usage: generation.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_core::agents::Agent;
    use colloquy_core::customers::Customer;
    use colloquy_core::guidelines::JourneyNodeRef;
    use colloquy_core::ids::{GuidelineId, JourneyEdgeId, JourneyId, JourneyNodeId};
    use colloquy_core::journeys::{Journey, JourneyNode};
    use colloquy_llm::mock::MockGenerator;
    use std::collections::BTreeMap;

    use crate::matching::strategy::StrategyResolver;
    use crate::matching::GuidelineMatcher;
    use crate::policy::BasicOptimizationPolicy;
    use colloquy_core::ids::SessionId;

    fn snapshot() -> MatchingSnapshot {
        MatchingSnapshot {
            agent: Agent::new("Quinn", "support agent"),
            customer: Customer::guest(),
            interaction_history: Vec::new(),
            context_variables: Vec::new(),
            terms: Vec::new(),
            capabilities: Vec::new(),
            staged_tool_events: Vec::new(),
            active_journeys: Vec::new(),
            journey_paths: BTreeMap::new(),
            applied_guideline_ids: Vec::new(),
        }
    }

    fn journey(id: &str) -> Journey {
        let root = JourneyNodeId::from_raw("n1");
        Journey {
            id: JourneyId::from_raw(id),
            title: "booking".into(),
            condition: "customer wants to book".into(),
            root: root.clone(),
            nodes: [(
                root.clone(),
                JourneyNode {
                    id: root,
                    action: "ask destination".into(),
                },
            )]
            .into(),
            edges: Vec::new(),
        }
    }

    fn journey_guideline(journey_id: &str) -> Guideline {
        let mut g = Guideline::new("at this step", "do the step");
        g.metadata.journey_node = Some(JourneyNodeRef {
            journey_id: JourneyId::from_raw(journey_id),
            node_id: JourneyNodeId::from_raw("n1"),
            edge_id: None::<JourneyEdgeId>,
        });
        g
    }

    #[test]
    fn classification_covers_all_buckets() {
        let mut snap = snapshot();
        snap.active_journeys.push(journey("j1"));

        assert_eq!(
            classify(&journey_guideline("j1"), &snap),
            GuidelineBucket::JourneyStep
        );
        // Journey not active → falls through to actionable
        assert_eq!(
            classify(&journey_guideline("j2"), &snap),
            GuidelineBucket::Actionable
        );

        assert_eq!(
            classify(&Guideline::observational("customer is upset"), &snap),
            GuidelineBucket::Observational
        );

        let mut head = Guideline::observational("ambiguous request");
        head.metadata.disambiguation_targets = vec![GuidelineId::new()];
        assert_eq!(classify(&head, &snap), GuidelineBucket::Disambiguation);

        let mut applied = Guideline::new("asked about hours", "state the hours");
        snap.applied_guideline_ids.push(applied.id.clone());
        assert_eq!(
            classify(&applied, &snap),
            GuidelineBucket::PrevAppliedActionable
        );

        applied.metadata.customer_dependent_action_data = true;
        assert_eq!(
            classify(&applied, &snap),
            GuidelineBucket::PrevAppliedCustomerDependent
        );

        // Continuous guidelines re-evaluate as actionable even when applied
        applied.metadata.customer_dependent_action_data = false;
        applied.metadata.continuous = true;
        assert_eq!(classify(&applied, &snap), GuidelineBucket::Actionable);

        assert_eq!(
            classify(&Guideline::new("greeting", "greet back"), &snap),
            GuidelineBucket::Actionable
        );
    }

    #[tokio::test]
    async fn batch_maps_decisions_in_input_order() {
        let mock: Arc<dyn SchematicGenerator> = Arc::new(MockGenerator::new().route(
            "Rules",
            Ok(json!({
                "decisions": [
                    {"rule_number": 1, "applies": true, "score": 0.8, "rationale": "greeting seen"},
                    {"rule_number": 2, "applies": false, "score": 0.1, "rationale": "no refund talk"},
                    {"rule_number": 3, "applies": true, "score": 0.6, "rationale": "location missing"}
                ]
            })),
        ));
        let policy = Arc::new(BasicOptimizationPolicy);
        let batch = GenericMatchingBatch {
            bucket: GuidelineBucket::Actionable,
            guidelines: vec![
                Guideline::new("customer greets", "greet back"),
                Guideline::new("refund requested", "explain policy"),
                Guideline::new("weather asked", "ask for location"),
            ],
            snapshot: Arc::new(snapshot()),
            generator: mock,
            policy,
        };

        let result = batch.process(&Context::root()).await.unwrap();
        assert_eq!(result.matches.len(), 2);
        assert_eq!(result.matches[0].guideline.condition, "customer greets");
        assert_eq!(result.matches[1].guideline.condition, "weather asked");
        assert!((result.matches[0].score - 0.8).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let mock: Arc<dyn SchematicGenerator> = Arc::new(MockGenerator::new());
        let batch = GenericMatchingBatch {
            bucket: GuidelineBucket::Actionable,
            guidelines: vec![Guideline::new("a", "b")],
            snapshot: Arc::new(snapshot()),
            generator: mock,
            policy: Arc::new(BasicOptimizationPolicy),
        };
        let ctx = Context::root();
        ctx.cancel_token().cancel();
        assert!(matches!(
            batch.process(&ctx).await,
            Err(EngineError::Cancelled)
        ));
    }

    fn matcher_with(mock: Arc<MockGenerator>) -> GuidelineMatcher {
        let policy = Arc::new(BasicOptimizationPolicy);
        let generic = Arc::new(GenericStrategy::new(mock, policy));
        GuidelineMatcher::new(Arc::new(StrategyResolver::new(generic)))
    }

    #[tokio::test]
    async fn empty_guideline_set_makes_no_llm_calls() {
        let mock = Arc::new(MockGenerator::new());
        let matcher = matcher_with(mock.clone());
        let result = matcher
            .match_guidelines(
                &Context::root(),
                &SessionId::new(),
                Arc::new(snapshot()),
                Vec::new(),
            )
            .await
            .unwrap();
        assert!(result.matches.is_empty());
        assert_eq!(result.batch_count, 0);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn small_sets_get_single_guideline_batches() {
        let mock = Arc::new(MockGenerator::new().route(
            "Rules",
            Ok(json!({
                "decisions": [
                    {"rule_number": 1, "applies": true, "score": 0.9, "rationale": "yes"}
                ]
            })),
        ));
        let matcher = matcher_with(mock.clone());

        let guidelines = vec![
            Guideline::new("a", "1"),
            Guideline::new("b", "2"),
            Guideline::new("c", "3"),
        ];
        let result = matcher
            .match_guidelines(
                &Context::root(),
                &SessionId::new(),
                Arc::new(snapshot()),
                guidelines,
            )
            .await
            .unwrap();

        // ≤10 guidelines → batch size 1 → one call per guideline
        assert_eq!(result.batch_count, 3);
        assert_eq!(mock.call_count(), 3);
        assert_eq!(result.matches.len(), 3);
        assert_eq!(result.batch_usages.len(), 3);
    }

    #[tokio::test]
    async fn transform_drops_inactive_journey_matches() {
        let mock = Arc::new(MockGenerator::new().route(
            "Rules",
            Ok(json!({
                "decisions": [
                    {"rule_number": 1, "applies": true, "score": 0.9, "rationale": "step"}
                ]
            })),
        ));
        let matcher = matcher_with(mock.clone());

        let mut snap = snapshot();
        snap.active_journeys.push(journey("j1"));

        let result = matcher
            .match_guidelines(
                &Context::root(),
                &SessionId::new(),
                Arc::new(snap),
                vec![journey_guideline("j1"), journey_guideline("j2")],
            )
            .await
            .unwrap();

        // j2's journey is not active: its match is filtered by the transform
        assert_eq!(result.matches.len(), 1);
        assert_eq!(
            result.matches[0].guideline.journey_id().unwrap().as_str(),
            "j1"
        );
    }

    #[tokio::test]
    async fn cancellation_salvages_partial_generations() {
        let mock = Arc::new(MockGenerator::new());
        let matcher = matcher_with(mock);
        let session_id = SessionId::new();

        let ctx = Context::root();
        ctx.cancel_token().cancel();

        let result = matcher
            .match_guidelines(
                &ctx,
                &session_id,
                Arc::new(snapshot()),
                vec![Guideline::new("a", "b")],
            )
            .await;
        assert!(matches!(result, Err(EngineError::Cancelled)));

        // Nothing completed, so the salvaged set is empty but present
        let partial = matcher.pop_partial_generations(&session_id);
        assert!(partial.is_empty());
    }
}
