//! Post-reply response analysis.
//!
//! After messages are emitted, each eligible matched guideline is evaluated
//! against the reply: did the message fulfill its action? A reply missing a
//! `functional` part (core to the task) leaves the guideline unapplied so it
//! fires again next turn; a missing `behavioral` part (tone, politeness)
//! still counts as applied.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use colloquy_core::agents::Agent;
use colloquy_core::correlation::Context;
use colloquy_core::customers::Customer;
use colloquy_core::events::Event;
use colloquy_core::guidelines::{Guideline, GuidelineMatch};
use colloquy_core::ids::GuidelineId;
use colloquy_llm::retry::generate_with_temperatures;
use colloquy_llm::{SchematicGenerator, UsageInfo};

use super::strategy::ResponseAnalysisBatch;
use crate::error::EngineError;
use crate::policy::OptimizationPolicy;
use crate::prompts::PromptBuilder;

/// Read-only working set for response analysis.
#[derive(Clone, Debug)]
pub struct AnalysisSnapshot {
    pub agent: Agent,
    pub customer: Customer,
    pub interaction_history: Vec<Event>,
    pub emitted_messages: Vec<Event>,
    pub staged_tool_events: Vec<Event>,
    pub applied_guideline_ids: Vec<GuidelineId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPart {
    Functional,
    Behavioral,
}

#[derive(Clone, Debug)]
pub struct AnalyzedGuideline {
    pub guideline: Guideline,
    /// Whether the emitted reply counts as having applied the guideline.
    pub applied: bool,
}

#[derive(Clone, Debug, Default)]
pub struct AnalysisBatchResult {
    pub analyzed: Vec<AnalyzedGuideline>,
    pub usage: UsageInfo,
}

#[derive(Clone, Debug, Default)]
pub struct ResponseAnalysisResult {
    pub analyzed: Vec<AnalyzedGuideline>,
    pub batch_usages: Vec<UsageInfo>,
    pub total_duration: Duration,
}

impl ResponseAnalysisResult {
    pub fn applied_ids(&self) -> Vec<GuidelineId> {
        self.analyzed
            .iter()
            .filter(|a| a.applied)
            .map(|a| a.guideline.id.clone())
            .collect()
    }
}

#[derive(Deserialize)]
struct AnalysisReply {
    evaluations: Vec<Evaluation>,
}

#[derive(Deserialize)]
struct Evaluation {
    rule_number: usize,
    fulfilled: bool,
    #[serde(default)]
    missing_part: Option<MissingPart>,
}

pub struct GenericAnalysisBatch {
    matches: Vec<GuidelineMatch>,
    snapshot: Arc<AnalysisSnapshot>,
    generator: Arc<dyn SchematicGenerator>,
    policy: Arc<dyn OptimizationPolicy>,
}

impl GenericAnalysisBatch {
    pub fn new(
        matches: Vec<GuidelineMatch>,
        snapshot: Arc<AnalysisSnapshot>,
        generator: Arc<dyn SchematicGenerator>,
        policy: Arc<dyn OptimizationPolicy>,
    ) -> Self {
        Self {
            matches,
            snapshot,
            generator,
            policy,
        }
    }

    fn prompt(&self) -> String {
        let reply_text: Vec<String> = self
            .snapshot
            .emitted_messages
            .iter()
            .filter_map(|e| e.message())
            .map(|m| m.message)
            .collect();

        let rules: Vec<String> = self
            .matches
            .iter()
            .enumerate()
            .map(|(i, m)| {
                format!(
                    "{}. When {}: {}",
                    i + 1,
                    m.guideline.condition,
                    m.guideline.action.as_deref().unwrap_or_default()
                )
            })
            .collect();

        PromptBuilder::new()
            .agent_identity(&self.snapshot.agent, &self.snapshot.customer)
            .interaction_history(
                &self.snapshot.interaction_history,
                self.policy.max_history_for_matching(),
            )
            .tool_results(&self.snapshot.staged_tool_events)
            .section("Reply under analysis", reply_text.join("\n\n"))
            .section(
                "Task",
                "For each rule, decide whether the reply carried out its action. If part of \
                 the action is missing, classify the missing part: \"functional\" when it is \
                 core to the customer's task, \"behavioral\" when it only concerns tone or \
                 politeness.",
            )
            .section("Rules", rules.join("\n"))
            .output_schema(
                "Evaluate every rule, in the order given.",
                &json!({
                    "evaluations": [{
                        "rule_number": 1,
                        "fulfilled": true,
                        "missing_part": null
                    }]
                }),
            )
            .build()
    }

    fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "evaluations": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "rule_number": {"type": "integer"},
                            "fulfilled": {"type": "boolean"},
                            "missing_part": {"type": ["string", "null"], "enum": ["functional", "behavioral", null]}
                        },
                        "required": ["rule_number", "fulfilled"]
                    }
                }
            },
            "required": ["evaluations"]
        })
    }
}

#[async_trait]
impl ResponseAnalysisBatch for GenericAnalysisBatch {
    async fn process(&self, ctx: &Context) -> Result<AnalysisBatchResult, EngineError> {
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let generation = generate_with_temperatures::<AnalysisReply>(
            self.generator.as_ref(),
            &self.prompt(),
            &Self::schema(),
            &self.policy.response_analysis_retry_temperatures(),
        )
        .await?;

        let mut analyzed = Vec::new();
        for (i, m) in self.matches.iter().enumerate() {
            let evaluation = generation
                .value
                .evaluations
                .iter()
                .find(|e| e.rule_number == i + 1);
            let applied = match evaluation {
                Some(e) => e.fulfilled || e.missing_part == Some(MissingPart::Behavioral),
                // No verdict returned: be conservative, leave unapplied
                None => false,
            };
            analyzed.push(AnalyzedGuideline {
                guideline: m.guideline.clone(),
                applied,
            });
        }

        Ok(AnalysisBatchResult {
            analyzed,
            usage: generation.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::generic::GenericStrategy;
    use crate::matching::strategy::StrategyResolver;
    use crate::matching::GuidelineMatcher;
    use crate::policy::BasicOptimizationPolicy;
    use colloquy_llm::mock::MockGenerator;

    fn snapshot() -> AnalysisSnapshot {
        AnalysisSnapshot {
            agent: Agent::new("Quinn", "support"),
            customer: Customer::guest(),
            interaction_history: Vec::new(),
            emitted_messages: Vec::new(),
            staged_tool_events: Vec::new(),
            applied_guideline_ids: Vec::new(),
        }
    }

    fn matched(condition: &str, action: &str) -> GuidelineMatch {
        GuidelineMatch {
            guideline: Guideline::new(condition, action),
            score: 0.9,
            rationale: "matched".into(),
            metadata: None,
        }
    }

    fn matcher_with(mock: Arc<MockGenerator>) -> GuidelineMatcher {
        let policy = Arc::new(BasicOptimizationPolicy);
        let generic = Arc::new(GenericStrategy::new(mock, policy));
        GuidelineMatcher::new(Arc::new(StrategyResolver::new(generic)))
    }

    #[tokio::test]
    async fn behavioral_miss_counts_as_applied() {
        let mock = Arc::new(MockGenerator::new().route(
            "Reply under analysis",
            Ok(json!({
                "evaluations": [
                    {"rule_number": 1, "fulfilled": false, "missing_part": "behavioral"}
                ]
            })),
        ));
        let batch = GenericAnalysisBatch::new(
            vec![matched("greeting", "greet warmly")],
            Arc::new(snapshot()),
            mock,
            Arc::new(BasicOptimizationPolicy),
        );
        let result = batch.process(&Context::root()).await.unwrap();
        assert!(result.analyzed[0].applied);
    }

    #[tokio::test]
    async fn functional_miss_stays_unapplied() {
        let mock = Arc::new(MockGenerator::new().route(
            "Reply under analysis",
            Ok(json!({
                "evaluations": [
                    {"rule_number": 1, "fulfilled": false, "missing_part": "functional"}
                ]
            })),
        ));
        let batch = GenericAnalysisBatch::new(
            vec![matched("asked for invoice", "send the invoice link")],
            Arc::new(snapshot()),
            mock,
            Arc::new(BasicOptimizationPolicy),
        );
        let result = batch.process(&Context::root()).await.unwrap();
        assert!(!result.analyzed[0].applied);
    }

    #[tokio::test]
    async fn analyze_response_filters_ineligible_matches() {
        let mock = Arc::new(MockGenerator::new().route(
            "Reply under analysis",
            Ok(json!({
                "evaluations": [
                    {"rule_number": 1, "fulfilled": true, "missing_part": null}
                ]
            })),
        ));
        let matcher = matcher_with(mock.clone());

        let mut continuous = matched("always", "stay polite");
        continuous.guideline.metadata.continuous = true;
        let observational = GuidelineMatch {
            guideline: Guideline::observational("customer is happy"),
            score: 0.8,
            rationale: "obs".into(),
            metadata: None,
        };
        let mut already_applied = matched("asked hours", "state hours");
        let actionable = matched("asked price", "state the price");

        let mut snap = snapshot();
        snap.applied_guideline_ids
            .push(already_applied.guideline.id.clone());
        already_applied.guideline.id = snap.applied_guideline_ids[0].clone();

        let result = matcher
            .analyze_response(
                &Context::root(),
                Arc::new(snap),
                vec![continuous, observational, already_applied, actionable],
            )
            .await
            .unwrap();

        // Only the plain actionable guideline was eligible
        assert_eq!(result.analyzed.len(), 1);
        assert_eq!(result.analyzed[0].guideline.condition, "asked price");
        assert_eq!(result.applied_ids().len(), 1);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn no_eligible_matches_means_no_calls() {
        let mock = Arc::new(MockGenerator::new());
        let matcher = matcher_with(mock.clone());
        let result = matcher
            .analyze_response(&Context::root(), Arc::new(snapshot()), Vec::new())
            .await
            .unwrap();
        assert!(result.analyzed.is_empty());
        assert_eq!(mock.call_count(), 0);
    }
}
