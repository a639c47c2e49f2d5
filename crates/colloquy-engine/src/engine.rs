//! The per-session processing engine.
//!
//! One `process` call drives a session through Acknowledgement → Preparation
//! (bounded iterative guideline matching + tool calling, with an optional
//! concurrent preamble) → Message generation (under the cancellation-
//! suppression latch) → `ready` → detached post-processing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use colloquy_core::correlation::Context;
use colloquy_core::events::{Event, SessionStatus, StatusPayload};
use colloquy_core::guidelines::{Guideline, GuidelineMatch};
use colloquy_core::ids::{AgentId, SessionId};
use colloquy_core::sessions::{AgentState, SessionMode};
use colloquy_llm::SchematicGenerator;
use colloquy_store::{
    AgentStore, CannedResponseStore, CapabilityStore, ContextVariableStore, CustomerStore,
    EventFilter, GlossaryStore, GuidelineStore, GuidelineToolAssociationStore, Inspection,
    InspectionStore, JourneyNodeToolAssociationStore, JourneyStore, SessionStore,
};

use crate::context::{IterationState, LoadedContext};
use crate::emission::EventEmitter;
use crate::error::EngineError;
use crate::hooks::EngineHooks;
use crate::latch::CancellationSuppressionLatch;
use crate::matching::{AnalysisSnapshot, GuidelineMatcher, MatchingSnapshot};
use crate::message::{MessageComposer, PreambleGenerator, PreambleOutcome};
use crate::policy::{BasicOptimizationPolicy, OptimizationPolicy, PreambleTiming};
use crate::tool_caller::{ToolCaller, ToolRegistry};

const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(57);
const MAX_ACTIVE_JOURNEYS: usize = 3;
const MAX_GLOSSARY_TERMS: usize = 20;

/// Every store seam the engine consumes, bundled for wiring.
#[derive(Clone)]
pub struct StoreBundle {
    pub sessions: Arc<dyn SessionStore>,
    pub agents: Arc<dyn AgentStore>,
    pub customers: Arc<dyn CustomerStore>,
    pub guidelines: Arc<dyn GuidelineStore>,
    pub journeys: Arc<dyn JourneyStore>,
    pub guideline_tool_associations: Arc<dyn GuidelineToolAssociationStore>,
    pub node_tool_associations: Arc<dyn JourneyNodeToolAssociationStore>,
    pub canned_responses: Arc<dyn CannedResponseStore>,
    pub variables: Arc<dyn ContextVariableStore>,
    pub glossary: Arc<dyn GlossaryStore>,
    pub capabilities: Arc<dyn CapabilityStore>,
    pub inspections: Arc<dyn InspectionStore>,
}

impl StoreBundle {
    /// Wire every seam to one in-memory store (tests, demos).
    pub fn from_memory(stores: Arc<colloquy_store::MemoryStores>) -> Self {
        Self {
            sessions: stores.clone(),
            agents: stores.clone(),
            customers: stores.clone(),
            guidelines: stores.clone(),
            journeys: stores.clone(),
            guideline_tool_associations: stores.clone(),
            node_tool_associations: stores.clone(),
            canned_responses: stores.clone(),
            variables: stores.clone(),
            glossary: stores.clone(),
            capabilities: stores.clone(),
            inspections: stores,
        }
    }
}

/// Collaborators handed to the engine as one constructor-parameter object.
pub struct EngineComponents {
    pub stores: StoreBundle,
    pub matcher: Arc<GuidelineMatcher>,
    pub tool_caller: Arc<ToolCaller>,
    pub composer: Arc<MessageComposer>,
    pub preamble: Arc<PreambleGenerator>,
    pub hooks: EngineHooks,
    pub policy: Arc<dyn OptimizationPolicy>,
}

impl EngineComponents {
    /// Standard wiring: generic matching strategy, the given tool registry,
    /// fluid + canned composers.
    pub fn standard(
        stores: StoreBundle,
        generator: Arc<dyn SchematicGenerator>,
        tool_registry: Arc<ToolRegistry>,
        hooks: EngineHooks,
        preamble_timing: PreambleTiming,
    ) -> Self {
        use crate::matching::generic::GenericStrategy;
        use crate::matching::strategy::StrategyResolver;
        use crate::message::{CannedResponseGenerator, FluidGenerator};

        let policy: Arc<dyn OptimizationPolicy> = Arc::new(BasicOptimizationPolicy);
        let generic = Arc::new(GenericStrategy::new(generator.clone(), policy.clone()));
        let matcher = Arc::new(GuidelineMatcher::new(Arc::new(StrategyResolver::new(
            generic,
        ))));
        let tool_caller = Arc::new(ToolCaller::new(
            generator.clone(),
            tool_registry,
            stores.guideline_tool_associations.clone(),
            stores.node_tool_associations.clone(),
            policy.clone(),
        ));
        let fluid = FluidGenerator::new(generator.clone(), policy.clone());
        let canned = CannedResponseGenerator::new(
            generator.clone(),
            policy.clone(),
            stores.canned_responses.clone(),
        );
        let composer = Arc::new(MessageComposer::new(fluid, canned));
        let preamble = Arc::new(PreambleGenerator::new(
            generator,
            policy.clone(),
            stores.canned_responses.clone(),
            preamble_timing,
        ));

        Self {
            stores,
            matcher,
            tool_caller,
            composer,
            preamble,
            hooks,
            policy,
        }
    }
}

enum Loaded {
    Manual,
    Ready(Box<LoadedContext>),
}

/// The processing engine. One instance serves every session; all per-cycle
/// state lives in the `LoadedContext`.
pub struct Processor {
    c: EngineComponents,
    latch: CancellationSuppressionLatch,
    timeout: Duration,
}

impl Processor {
    pub fn new(components: EngineComponents) -> Self {
        Self {
            c: components,
            latch: CancellationSuppressionLatch::new(),
            timeout: DEFAULT_PROCESS_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one processing cycle. Returns `true` if the cycle reached
    /// terminal emission, `false` if it was cancelled or bailed.
    #[instrument(skip(self, ctx, emitter), fields(session_id = %session_id, correlation = %ctx.scope()))]
    pub async fn process(
        &self,
        ctx: &Context,
        session_id: &SessionId,
        agent_id: &AgentId,
        emitter: &dyn EventEmitter,
    ) -> Result<bool, EngineError> {
        let started = Instant::now();

        let loaded = match self.load_context(session_id, agent_id).await? {
            Loaded::Manual => {
                debug!("manual session; nothing to do");
                return Ok(true);
            }
            Loaded::Ready(loaded) => *loaded,
        };

        match tokio::time::timeout(self.timeout, self.run_cycle(ctx, loaded, emitter, started))
            .await
        {
            Ok(result) => result,
            Err(_elapsed) => {
                warn!(timeout_secs = self.timeout.as_secs(), "processing timed out");
                let _ = emitter
                    .emit_status(
                        ctx.scope().clone(),
                        StatusPayload::error("processing timed out"),
                    )
                    .await;
                Ok(false)
            }
        }
    }

    async fn load_context(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
    ) -> Result<Loaded, EngineError> {
        let session = self.c.stores.sessions.read_session(session_id).await?;
        if session.mode == SessionMode::Manual {
            return Ok(Loaded::Manual);
        }

        let agent = self.c.stores.agents.read_agent(agent_id).await?;
        let customer = self
            .c
            .stores
            .customers
            .read_customer(&session.customer_id)
            .await?;
        let history = self
            .c
            .stores
            .sessions
            .list_events(session_id, &EventFilter::default())
            .await?;

        let mut loaded = LoadedContext::new(session, agent, customer, history);

        loaded.state.context_variables = self
            .c
            .stores
            .variables
            .read_values(agent_id, &loaded.customer.id)
            .await?;
        loaded.state.capabilities = self
            .c
            .stores
            .capabilities
            .find_capabilities(agent_id)
            .await?;

        let query = last_customer_text(&loaded);
        loaded.state.glossary_terms = self
            .c
            .stores
            .glossary
            .find_relevant_terms(&query, MAX_GLOSSARY_TERMS)
            .await?;

        let available: Vec<_> = self
            .c
            .stores
            .journeys
            .list_journeys()
            .await?
            .into_iter()
            .map(|j| j.id)
            .collect();
        loaded.state.journeys = self
            .c
            .stores
            .journeys
            .find_relevant_journeys(&query, &available, MAX_ACTIVE_JOURNEYS)
            .await?;
        loaded.state.journey_paths = loaded.session.current_agent_state().journey_paths;

        Ok(Loaded::Ready(Box::new(loaded)))
    }

    async fn run_cycle(
        &self,
        ctx: &Context,
        mut loaded: LoadedContext,
        emitter: &dyn EventEmitter,
        started: Instant,
    ) -> Result<bool, EngineError> {
        let hooks = self.c.hooks.clone();

        if !hooks.call_on_acknowledging(&mut loaded).await {
            return Ok(false);
        }
        if ctx.is_cancelled() {
            return Ok(false);
        }
        emitter
            .emit_status(
                ctx.scope().clone(),
                StatusPayload::bare(SessionStatus::Acknowledged),
            )
            .await?;
        if !hooks.call_on_acknowledged(&mut loaded).await {
            return Ok(false);
        }
        if !hooks.call_on_preparing(&mut loaded).await {
            return Ok(false);
        }

        // Preparation loop
        let mut iteration_index = 0usize;
        while !loaded.state.prepared_to_respond {
            if ctx.is_cancelled() {
                return Ok(false);
            }
            if !hooks.call_on_preparation_iteration_start(&mut loaded).await {
                break;
            }

            // The preamble runs concurrently with the first iteration, over
            // its own read-only view of the context.
            let preamble_view = (iteration_index == 0).then(|| loaded.clone());
            let preamble_fut = async {
                match preamble_view {
                    Some(view) => self.c.preamble.maybe_generate(ctx, &view, emitter).await,
                    None => Ok(PreambleOutcome::NotRequired),
                }
            };

            let (preamble_result, iteration_result) = tokio::join!(
                preamble_fut,
                self.run_iteration(ctx, &mut loaded, iteration_index, emitter)
            );

            match iteration_result {
                Ok(()) => {}
                Err(e) if e.is_cancellation() => return Ok(false),
                Err(e) => {
                    // A failed iteration still proceeds to message
                    // generation with whatever state it has.
                    error!(correlation = %ctx.scope(), error = %e, "preparation iteration failed");
                    loaded.state.prepared_to_respond = true;
                }
            }

            match preamble_result {
                Ok(PreambleOutcome::Bailed) => break,
                Ok(_) => {}
                Err(e) if e.is_cancellation() => return Ok(false),
                Err(e) => warn!(error = %e, "preamble generation failed"),
            }

            if let Some(mode) = loaded.state.requested_mode.take() {
                info!(?mode, "tool requested session mode change");
                self.c
                    .stores
                    .sessions
                    .update_mode(&loaded.session.id, mode)
                    .await?;
                loaded.session.mode = mode;
            }

            if !hooks.call_on_preparation_iteration_end(&mut loaded).await {
                break;
            }
            iteration_index += 1;
        }

        if !hooks.call_on_generating_messages(&mut loaded).await {
            return Ok(false);
        }

        // Missing beats invalid for the same parameter
        loaded.state.tool_insights = loaded.state.tool_insights.filter_problematic();

        // Message generation under the cancellation-suppression latch: once
        // the customer sees typing, a reply or an explicit error follows.
        let gen_loaded = &loaded;
        let gen_hooks = &hooks;
        let suppressed = self
            .latch
            .run(ctx, |gen_ctx| async move {
                let composed = self.c.composer.compose(&gen_ctx, gen_loaded).await?;
                let outcome = self
                    .c
                    .composer
                    .emit_composed(&gen_ctx, gen_loaded, gen_hooks, &composed, emitter)
                    .await?;
                Ok::<_, EngineError>((composed, outcome))
            })
            .await;

        let (composed, emit_outcome) = match suppressed.output {
            Ok(result) => result,
            Err(e) if e.is_cancellation() => return Ok(false),
            Err(e) => {
                error!(correlation = %ctx.scope(), error = %e, "message generation failed");
                let _ = hooks.call_on_error(&mut loaded, &e).await;
                emitter
                    .emit_status(ctx.scope().clone(), StatusPayload::error(e.to_string()))
                    .await?;
                return Ok(false);
            }
        };
        loaded.state.usage.accumulate(&composed.usage);

        if suppressed.cancellation_deferred {
            // The reply is out; honour the deferred cancellation now by
            // emitting nothing further.
            info!(correlation = %ctx.scope(), "cancellation deferred through message generation");
            return Ok(false);
        }

        if emit_outcome.ready_count == 0 {
            emitter
                .emit_status(ctx.scope().clone(), StatusPayload::bare(SessionStatus::Ready))
                .await?;
        }

        self.post_process(ctx.clone(), loaded, emit_outcome.message_events, started);

        Ok(true)
    }

    /// One preparation iteration: match guidelines and journeys, refresh the
    /// glossary, split matches, run the tool caller, merge, refresh again.
    async fn run_iteration(
        &self,
        ctx: &Context,
        loaded: &mut LoadedContext,
        index: usize,
        emitter: &dyn EventEmitter,
    ) -> Result<(), EngineError> {
        let ctx = ctx.scoped(&format!("prep-{index}"));

        // Candidates: stored guidelines plus journey-node projections, minus
        // anything already matched in a prior iteration. Later iterations
        // thereby only consider guidelines newly activated by tool events.
        let matched_ids: HashSet<_> = loaded
            .state
            .all_matches()
            .map(|m| m.guideline.id.clone())
            .collect();
        let mut candidates: Vec<Guideline> = self
            .c
            .stores
            .guidelines
            .list_guidelines(&loaded.agent.tags)
            .await?;
        for journey in &loaded.state.journeys {
            candidates.extend(journey.project_node_guidelines());
        }
        candidates.retain(|g| !matched_ids.contains(&g.id));

        let snapshot = Arc::new(MatchingSnapshot::from_loaded(loaded));
        let result = self
            .c
            .matcher
            .match_guidelines(&ctx, &loaded.session.id, snapshot, candidates)
            .await?;
        for usage in &result.batch_usages {
            loaded.state.usage.accumulate(usage);
        }

        self.refresh_glossary(loaded).await?;

        // Split new matches into tool-enabled and ordinary
        let mut new_tool_enabled: Vec<GuidelineMatch> = Vec::new();
        let mut new_ordinary: Vec<GuidelineMatch> = Vec::new();
        for m in &result.matches {
            if self.c.tool_caller.is_tool_enabled(&m.guideline).await? {
                new_tool_enabled.push(m.clone());
            } else {
                new_ordinary.push(m.clone());
            }
        }

        let tool_snapshot = Arc::new(MatchingSnapshot::from_loaded(loaded));
        let outcome = self
            .c
            .tool_caller
            .call_tools(&ctx, &tool_snapshot, &new_tool_enabled, emitter)
            .await?;

        let new_tool_event_count = outcome.tool_events.len();
        loaded.state.usage.accumulate(&outcome.usage);
        loaded.state.tool_insights.merge(outcome.insights.clone());
        loaded.state.tool_events.extend(outcome.tool_events.clone());
        if outcome.requested_mode.is_some() {
            loaded.state.requested_mode = outcome.requested_mode;
        }

        self.refresh_glossary(loaded).await?;

        // Update journey paths: the step taken this turn, or None
        for journey in loaded.state.journeys.clone() {
            let step = result
                .matches
                .iter()
                .find(|m| m.guideline.journey_id() == Some(&journey.id))
                .map(|m| m.guideline.id.clone());
            loaded
                .state
                .journey_paths
                .entry(journey.id)
                .or_default()
                .push(step);
        }

        loaded.state.iterations.push(IterationState {
            matched_guidelines: result.matches.clone(),
            tool_enabled_matches: new_tool_enabled.clone(),
            ordinary_matches: new_ordinary.clone(),
            tool_events: outcome.tool_events,
            glossary_terms: loaded.state.glossary_terms.clone(),
            journeys_considered: loaded.state.journeys.iter().map(|j| j.id.clone()).collect(),
            tool_insights: outcome.insights,
        });
        loaded.state.ordinary_matches.extend(new_ordinary);
        loaded.state.tool_enabled_matches.extend(new_tool_enabled);

        // Convergence: nothing new this iteration, or the iteration cap
        let new_matches = !result.matches.is_empty();
        let new_tool_calls = new_tool_event_count > 0;
        if (!new_matches && !new_tool_calls)
            || loaded.state.iterations.len() >= loaded.agent.max_engine_iterations
        {
            loaded.state.prepared_to_respond = true;
        }
        debug!(
            iteration = index,
            matches = result.matches.len(),
            tool_events = new_tool_event_count,
            prepared = loaded.state.prepared_to_respond,
            "preparation iteration finished"
        );

        Ok(())
    }

    async fn refresh_glossary(&self, loaded: &mut LoadedContext) -> Result<(), EngineError> {
        let mut query = last_customer_text(loaded);
        for m in loaded.state.all_matches() {
            if let Some(action) = &m.guideline.action {
                query.push(' ');
                query.push_str(action);
            }
        }
        loaded.state.glossary_terms = self
            .c
            .stores
            .glossary
            .find_relevant_terms(&query, MAX_GLOSSARY_TERMS)
            .await?;
        Ok(())
    }

    /// Detached post-processing: inspection record, response analysis, the
    /// new agent state, and the post-generation hook. Failures are logged
    /// and never reach the customer.
    fn post_process(
        &self,
        ctx: Context,
        mut loaded: LoadedContext,
        emitted_messages: Vec<Event>,
        started: Instant,
    ) {
        let stores = self.c.stores.clone();
        let matcher = self.c.matcher.clone();
        let hooks = self.c.hooks.clone();

        tokio::spawn(async move {
            let ctx = ctx.scoped("post-processing");
            let session_id = loaded.session.id.clone();

            let analysis_snapshot = Arc::new(AnalysisSnapshot {
                agent: loaded.agent.clone(),
                customer: loaded.customer.clone(),
                interaction_history: loaded.interaction.history.clone(),
                emitted_messages,
                staged_tool_events: loaded.state.tool_events.clone(),
                applied_guideline_ids: loaded.applied_guideline_ids(),
            });
            let matches: Vec<GuidelineMatch> = loaded.state.all_matches().cloned().collect();

            let mut applied = loaded.applied_guideline_ids();
            match matcher
                .analyze_response(&ctx, analysis_snapshot, matches.clone())
                .await
            {
                Ok(analysis) => {
                    for usage in &analysis.batch_usages {
                        loaded.state.usage.accumulate(usage);
                    }
                    for id in analysis.applied_ids() {
                        if !applied.contains(&id) {
                            applied.push(id);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "response analysis failed"),
            }

            let state = AgentState {
                applied_guideline_ids: applied,
                journey_paths: loaded.state.journey_paths.clone(),
            };
            if let Err(e) = stores.sessions.append_agent_state(&session_id, state).await {
                warn!(error = %e, "failed to append agent state");
            }

            // Fold in generations salvaged from any cancelled matching pass
            for usage in matcher.pop_partial_generations(&session_id) {
                loaded.state.usage.accumulate(&usage);
            }

            let inspection = Inspection {
                session_id: session_id.clone(),
                correlation_id: ctx.scope().clone(),
                iteration_count: loaded.state.iterations.len(),
                matched_guideline_ids: matches.iter().map(|m| m.guideline.id.clone()).collect(),
                tool_call_count: loaded.state.tool_events.len(),
                total_input_tokens: loaded.state.usage.input_tokens,
                total_output_tokens: loaded.state.usage.output_tokens,
                total_duration_ms: started.elapsed().as_millis() as u64,
            };
            if let Err(e) = stores.inspections.save_inspection(inspection).await {
                warn!(error = %e, "failed to save inspection");
            }

            let _ = hooks.call_on_generated_messages(&mut loaded).await;
        });
    }
}

fn last_customer_text(loaded: &LoadedContext) -> String {
    loaded
        .interaction
        .history
        .iter()
        .rev()
        .filter(|e| e.source == colloquy_core::events::EventSource::Customer)
        .find_map(|e| e.message())
        .map(|m| m.message)
        .unwrap_or_default()
}
