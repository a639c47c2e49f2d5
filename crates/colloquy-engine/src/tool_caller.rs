//! Per-tool applicability inference, parameter validation, and execution.
//!
//! Candidate tools come from the guideline-tool association registry (exact
//! id match) plus journey node-tool associations. Each candidate gets one
//! LLM inference deciding applicability and evaluating every argument;
//! executions run only when all required arguments are valid. Inferences run
//! in parallel across candidates, and each candidate's execution starts as
//! soon as its own inference completes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use colloquy_core::correlation::Context;
use colloquy_core::events::{Event, StatusPayload, ToolCallRecord, ToolEventPayload};
use colloquy_core::guidelines::GuidelineMatch;
use colloquy_core::ids::GuidelineId;
use colloquy_core::sessions::SessionMode;
use colloquy_core::tools::{Tool, ToolCall, ToolError, ToolId, ToolResult};
use colloquy_llm::retry::{generate_with_temperatures, BACKOFF_DELAYS};
use colloquy_llm::{SchematicGenerator, UsageInfo};
use colloquy_store::{GuidelineToolAssociationStore, JourneyNodeToolAssociationStore};

use crate::context::{ProblemParameter, ToolInsights};
use crate::emission::EventEmitter;
use crate::error::EngineError;
use crate::matching::MatchingSnapshot;
use crate::policy::OptimizationPolicy;
use crate::prompts::PromptBuilder;

/// Executes one tool. Implementations wrap whatever transport the service
/// actually uses.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(
        &self,
        arguments: &BTreeMap<String, serde_json::Value>,
    ) -> Result<ToolResult, ToolError>;
}

struct RegisteredTool {
    definition: Tool,
    runner: Arc<dyn ToolRunner>,
}

/// Tool definitions and runners available to the engine.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<ToolId, RegisteredTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, definition: Tool, runner: Arc<dyn ToolRunner>) {
        self.tools
            .write()
            .insert(definition.id.clone(), RegisteredTool { definition, runner });
    }

    pub fn definition(&self, id: &ToolId) -> Option<Tool> {
        self.tools.read().get(id).map(|t| t.definition.clone())
    }

    fn runner(&self, id: &ToolId) -> Option<Arc<dyn ToolRunner>> {
        self.tools.read().get(id).map(|t| t.runner.clone())
    }
}

/// Everything the tool caller produced for one iteration.
#[derive(Debug, Default)]
pub struct ToolCallOutcome {
    pub tool_events: Vec<Event>,
    pub insights: ToolInsights,
    pub usage: UsageInfo,
    /// Session mode switch requested by a tool result.
    pub requested_mode: Option<SessionMode>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ArgState {
    Valid,
    Invalid,
    Missing,
}

#[derive(Deserialize)]
struct ArgumentEvaluation {
    parameter_name: String,
    state: ArgState,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    is_optional: bool,
}

#[derive(Deserialize)]
struct CandidateCall {
    #[allow(dead_code)]
    applicability_rationale: String,
    is_applicable: bool,
    #[serde(default)]
    same_call_is_already_staged: bool,
    #[serde(default)]
    argument_evaluations: Vec<ArgumentEvaluation>,
}

#[derive(Deserialize)]
struct ToolInference {
    tool_calls_for_candidate_tool: Vec<CandidateCall>,
}

pub struct ToolCaller {
    generator: Arc<dyn SchematicGenerator>,
    registry: Arc<ToolRegistry>,
    associations: Arc<dyn GuidelineToolAssociationStore>,
    node_associations: Arc<dyn JourneyNodeToolAssociationStore>,
    policy: Arc<dyn OptimizationPolicy>,
}

impl ToolCaller {
    pub fn new(
        generator: Arc<dyn SchematicGenerator>,
        registry: Arc<ToolRegistry>,
        associations: Arc<dyn GuidelineToolAssociationStore>,
        node_associations: Arc<dyn JourneyNodeToolAssociationStore>,
        policy: Arc<dyn OptimizationPolicy>,
    ) -> Self {
        Self {
            generator,
            registry,
            associations,
            node_associations,
            policy,
        }
    }

    /// Guideline ids associated with at least one registered tool. Used by
    /// the engine to split matches into tool-enabled and ordinary.
    pub async fn tool_enabled_guideline_ids(&self) -> Result<HashSet<GuidelineId>, EngineError> {
        let mut ids = HashSet::new();
        for assoc in self.associations.find_all().await? {
            if self.registry.definition(&assoc.tool_id).is_some() {
                ids.insert(assoc.guideline_id);
            }
        }
        Ok(ids)
    }

    /// Whether a guideline has any registered tool behind it, either through
    /// a direct association or through its journey node's tools.
    pub async fn is_tool_enabled(
        &self,
        guideline: &colloquy_core::guidelines::Guideline,
    ) -> Result<bool, EngineError> {
        if self.tool_enabled_guideline_ids().await?.contains(&guideline.id) {
            return Ok(true);
        }
        if let Some(node_ref) = &guideline.metadata.journey_node {
            let node_tools = self.node_associations.find_node_tools(&node_ref.node_id).await?;
            return Ok(node_tools
                .iter()
                .any(|t| self.registry.definition(t).is_some()));
        }
        Ok(false)
    }

    /// Candidate tools for the given matches: exact guideline-tool
    /// associations plus the journey's node-tool associations for matched
    /// journey-node guidelines.
    async fn collect_candidates(
        &self,
        matches: &[GuidelineMatch],
    ) -> Result<Vec<(ToolId, Vec<GuidelineMatch>)>, EngineError> {
        let associations = self.associations.find_all().await?;
        // Insertion-ordered so tool events come out deterministically.
        let mut candidates: Vec<(ToolId, Vec<GuidelineMatch>)> = Vec::new();

        let mut push = |tool_id: ToolId, m: &GuidelineMatch| {
            match candidates.iter().position(|(id, _)| *id == tool_id) {
                Some(i) => candidates[i].1.push(m.clone()),
                None => candidates.push((tool_id, vec![m.clone()])),
            }
        };

        for m in matches {
            for assoc in associations
                .iter()
                .filter(|a| a.guideline_id == m.guideline.id)
            {
                push(assoc.tool_id.clone(), m);
            }
            if let Some(node_ref) = &m.guideline.metadata.journey_node {
                for tool_id in self.node_associations.find_node_tools(&node_ref.node_id).await? {
                    push(tool_id, m);
                }
            }
        }

        // Drop candidates with no registered definition.
        candidates.retain(|(tool_id, _)| self.registry.definition(tool_id).is_some());
        Ok(candidates)
    }

    /// Run inference and execution for every candidate tool of this
    /// iteration's tool-enabled matches, emitting one `Tool` event per
    /// actually-invoked call.
    pub async fn call_tools(
        &self,
        ctx: &Context,
        snapshot: &MatchingSnapshot,
        matches: &[GuidelineMatch],
        emitter: &dyn EventEmitter,
    ) -> Result<ToolCallOutcome, EngineError> {
        let candidates = self.collect_candidates(matches).await?;
        if candidates.is_empty() {
            return Ok(ToolCallOutcome::default());
        }

        let ctx = ctx.scoped("tool-caller");
        emitter
            .emit_status(ctx.scope().clone(), StatusPayload::processing("Fetching data"))
            .await?;

        // One pipeline per candidate: inference, then execution of the calls
        // that passed the policy. Pipelines run concurrently.
        let outcomes = join_all(candidates.iter().map(|(tool_id, guideline_matches)| {
            let ctx = ctx.clone();
            async move {
                self.run_candidate(&ctx, snapshot, tool_id, guideline_matches)
                    .await
            }
        }))
        .await;

        let mut outcome = ToolCallOutcome::default();
        for result in outcomes {
            let candidate = result?;
            outcome.usage.accumulate(&candidate.usage);
            outcome.insights.merge(candidate.insights);
            if candidate.requested_mode.is_some() {
                outcome.requested_mode = candidate.requested_mode;
            }
            for record in candidate.records {
                let event = emitter
                    .emit_tool(
                        ctx.scope().clone(),
                        ToolEventPayload {
                            tool_calls: vec![record],
                        },
                    )
                    .await?;
                outcome.tool_events.push(event);
            }
        }

        Ok(outcome)
    }

    async fn run_candidate(
        &self,
        ctx: &Context,
        snapshot: &MatchingSnapshot,
        tool_id: &ToolId,
        matches: &[GuidelineMatch],
    ) -> Result<CandidateOutcome, EngineError> {
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let definition = self
            .registry
            .definition(tool_id)
            .ok_or_else(|| EngineError::Internal(format!("unregistered tool {tool_id}")))?;

        let prompt = self.inference_prompt(snapshot, &definition, matches);
        let generation = generate_with_temperatures::<ToolInference>(
            self.generator.as_ref(),
            &prompt,
            &inference_schema(),
            &self.policy.tool_calling_retry_temperatures(),
        )
        .await?;

        let precedence = matches.iter().map(|m| m.score).fold(0.0, f64::max);
        let mut outcome = CandidateOutcome {
            usage: generation.usage,
            ..CandidateOutcome::default()
        };

        let mut executable: Vec<ToolCall> = Vec::new();
        for call in &generation.value.tool_calls_for_candidate_tool {
            if !call.is_applicable || call.same_call_is_already_staged {
                continue;
            }

            let mut blocked = false;
            for eval in &call.argument_evaluations {
                let required = definition.is_required(&eval.parameter_name) && !eval.is_optional;
                match eval.state {
                    ArgState::Missing if required => {
                        outcome.insights.missing_data.push(ProblemParameter {
                            tool_id: tool_id.clone(),
                            parameter: eval.parameter_name.clone(),
                            precedence,
                        });
                        blocked = true;
                    }
                    ArgState::Invalid => {
                        outcome.insights.invalid_data.push(ProblemParameter {
                            tool_id: tool_id.clone(),
                            parameter: eval.parameter_name.clone(),
                            precedence,
                        });
                        blocked = true;
                    }
                    _ => {}
                }
            }
            if blocked {
                continue;
            }

            let arguments = call
                .argument_evaluations
                .iter()
                .filter(|e| e.state == ArgState::Valid)
                .filter_map(|e| {
                    e.value
                        .as_ref()
                        .map(|v| (e.parameter_name.clone(), parse_argument(v)))
                })
                .collect();
            executable.push(ToolCall {
                tool_id: tool_id.clone(),
                arguments,
            });
        }

        // Execute sequentially within the candidate; distinct invocations of
        // the same tool often depend on side-effect ordering.
        for call in executable {
            let result = self.execute_with_retries(&call).await;
            if let Some(mode) = requested_mode(&result) {
                outcome.requested_mode = Some(mode);
            }
            outcome.records.push(ToolCallRecord { call, result });
        }

        Ok(outcome)
    }

    fn inference_prompt(
        &self,
        snapshot: &MatchingSnapshot,
        definition: &Tool,
        matches: &[GuidelineMatch],
    ) -> String {
        let parameters: Vec<String> = definition
            .required
            .iter()
            .map(|p| format!("- {} (required): {}", p.name, p.description))
            .chain(
                definition
                    .optional
                    .iter()
                    .map(|p| format!("- {} (optional): {}", p.name, p.description)),
            )
            .collect();

        PromptBuilder::new()
            .agent_identity(&snapshot.agent, &snapshot.customer)
            .interaction_history(
                &snapshot.interaction_history,
                self.policy.max_history_for_tool_calls(),
            )
            .guideline_matches("Guidelines wanting this tool", matches)
            .section(
                "Candidate tool",
                format!("{}: {}\nParameters:\n{}", definition.id, definition.description, parameters.join("\n")),
            )
            .tool_results(&snapshot.staged_tool_events)
            .section(
                "Task",
                "Decide whether this tool should run now, and with which arguments. Produce \
                 one entry per distinct intended invocation. Mark an invocation as already \
                 staged if an identical call appears in the tool results above. For every \
                 parameter, state whether the value you can extract is valid, invalid, or \
                 missing.",
            )
            .output_schema(
                "Evaluate the candidate tool.",
                &json!({
                    "tool_calls_for_candidate_tool": [{
                        "applicability_rationale": "why this invocation is (not) warranted",
                        "is_applicable": true,
                        "same_call_is_already_staged": false,
                        "argument_evaluations": [{
                            "parameter_name": "products",
                            "state": "valid",
                            "value": "[\"laptop\"]",
                            "is_optional": false
                        }]
                    }]
                }),
            )
            .build()
    }

    async fn execute_with_retries(&self, call: &ToolCall) -> ToolResult {
        let attempts = self.policy.max_tool_execution_attempts();
        let Some(runner) = self.registry.runner(&call.tool_id) else {
            return ToolResult::failed(format!("no runner for {}", call.tool_id));
        };

        let mut last_error = String::new();
        for attempt in 0..attempts {
            match runner.run(&call.arguments).await {
                Ok(result) => return result,
                Err(e) => {
                    warn!(
                        tool = %call.tool_id,
                        attempt = attempt + 1,
                        attempts,
                        error = %e,
                        "tool execution failed"
                    );
                    last_error = e.to_string();
                    if attempt + 1 < attempts {
                        let delay = BACKOFF_DELAYS
                            .get(attempt)
                            .copied()
                            .unwrap_or(BACKOFF_DELAYS[BACKOFF_DELAYS.len() - 1]);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        debug!(tool = %call.tool_id, "recording failed tool result");
        ToolResult::failed(last_error)
    }
}

#[derive(Default)]
struct CandidateOutcome {
    records: Vec<ToolCallRecord>,
    insights: ToolInsights,
    usage: UsageInfo,
    requested_mode: Option<SessionMode>,
}

fn parse_argument(value: &str) -> serde_json::Value {
    serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()))
}

/// A tool result may request a session mode switch through its control
/// field: `{"control": {"mode": "manual"}}`.
fn requested_mode(result: &ToolResult) -> Option<SessionMode> {
    match result.data.get("control")?.get("mode")?.as_str()? {
        "manual" => Some(SessionMode::Manual),
        "auto" => Some(SessionMode::Auto),
        _ => None,
    }
}

fn inference_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "tool_calls_for_candidate_tool": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "applicability_rationale": {"type": "string"},
                        "is_applicable": {"type": "boolean"},
                        "same_call_is_already_staged": {"type": "boolean"},
                        "argument_evaluations": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "parameter_name": {"type": "string"},
                                    "state": {"type": "string", "enum": ["valid", "invalid", "missing"]},
                                    "value": {"type": ["string", "null"]},
                                    "is_optional": {"type": "boolean"}
                                },
                                "required": ["parameter_name", "state"]
                            }
                        }
                    },
                    "required": ["applicability_rationale", "is_applicable"]
                }
            }
        },
        "required": ["tool_calls_for_candidate_tool"]
    })
}
