//! Strategy-based parallel batched guideline matching.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `strategy` | Strategy/batch traits and the resolver priority chain |
//! | `generic` | Default strategy: six buckets, dynamic batch sizing |
//! | `response_analysis` | Post-reply evaluation of which actions were fulfilled |

pub mod generic;
pub mod response_analysis;
pub mod strategy;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use colloquy_core::agents::Agent;
use colloquy_core::capabilities::Capability;
use colloquy_core::context_vars::{ContextVariable, ContextVariableValue};
use colloquy_core::correlation::Context;
use colloquy_core::customers::Customer;
use colloquy_core::events::Event;
use colloquy_core::glossary::Term;
use colloquy_core::guidelines::{Guideline, GuidelineMatch};
use colloquy_core::ids::{GuidelineId, JourneyId, SessionId};
use colloquy_core::journeys::Journey;
use colloquy_llm::UsageInfo;

use crate::context::LoadedContext;
use crate::error::EngineError;
use strategy::StrategyResolver;

pub use response_analysis::{
    AnalysisSnapshot, AnalyzedGuideline, ResponseAnalysisResult,
};

/// Read-only working set handed to matching batches. Concurrent batches each
/// hold the same `Arc`; the engine's own state is never shared mutably.
#[derive(Clone, Debug)]
pub struct MatchingSnapshot {
    pub agent: Agent,
    pub customer: Customer,
    pub interaction_history: Vec<Event>,
    pub context_variables: Vec<(ContextVariable, ContextVariableValue)>,
    pub terms: Vec<Term>,
    pub capabilities: Vec<Capability>,
    pub staged_tool_events: Vec<Event>,
    pub active_journeys: Vec<Journey>,
    pub journey_paths: BTreeMap<JourneyId, Vec<Option<GuidelineId>>>,
    pub applied_guideline_ids: Vec<GuidelineId>,
}

impl MatchingSnapshot {
    pub fn from_loaded(loaded: &LoadedContext) -> Self {
        Self {
            agent: loaded.agent.clone(),
            customer: loaded.customer.clone(),
            interaction_history: loaded.interaction.history.clone(),
            context_variables: loaded.state.context_variables.clone(),
            terms: loaded.state.glossary_terms.clone(),
            capabilities: loaded.state.capabilities.clone(),
            staged_tool_events: loaded.state.tool_events.clone(),
            active_journeys: loaded.state.journeys.clone(),
            journey_paths: loaded.state.journey_paths.clone(),
            applied_guideline_ids: loaded.applied_guideline_ids(),
        }
    }

    pub fn journey_is_active(&self, id: &JourneyId) -> bool {
        self.active_journeys.iter().any(|j| &j.id == id)
    }
}

/// One batch's output.
#[derive(Clone, Debug, Default)]
pub struct MatchingBatchResult {
    pub matches: Vec<GuidelineMatch>,
    pub usage: UsageInfo,
}

/// The matcher's aggregate output for one call.
#[derive(Clone, Debug, Default)]
pub struct MatchingResult {
    pub matches: Vec<GuidelineMatch>,
    pub batch_count: usize,
    pub batch_usages: Vec<UsageInfo>,
    pub total_duration: Duration,
}

pub struct GuidelineMatcher {
    resolver: Arc<StrategyResolver>,
    /// Usages of batches that completed before a cancellation, keyed by
    /// session so concurrent sessions don't clobber each other. Popped by
    /// post-processing for inspection.
    partial_generations: Mutex<HashMap<SessionId, Vec<UsageInfo>>>,
}

impl GuidelineMatcher {
    pub fn new(resolver: Arc<StrategyResolver>) -> Self {
        Self {
            resolver,
            partial_generations: Mutex::new(HashMap::new()),
        }
    }

    pub fn pop_partial_generations(&self, session_id: &SessionId) -> Vec<UsageInfo> {
        self.partial_generations
            .lock()
            .remove(session_id)
            .unwrap_or_default()
    }

    /// Decide which of `guidelines` apply in the current turn.
    pub async fn match_guidelines(
        &self,
        ctx: &Context,
        session_id: &SessionId,
        snapshot: Arc<MatchingSnapshot>,
        guidelines: Vec<Guideline>,
    ) -> Result<MatchingResult, EngineError> {
        if guidelines.is_empty() {
            return Ok(MatchingResult::default());
        }

        let started = Instant::now();
        let ctx = ctx.scoped("guideline-matcher");

        // Group by strategy, insertion-ordered so batch creation and the
        // transform pass run in a stable order.
        let mut groups: Vec<(&'static str, Arc<dyn strategy::GuidelineMatchingStrategy>, Vec<Guideline>)> =
            Vec::new();
        for guideline in guidelines {
            let strategy = self.resolver.resolve(&guideline);
            match groups.iter().position(|(name, _, _)| *name == strategy.name()) {
                Some(i) => groups[i].2.push(guideline),
                None => groups.push((strategy.name(), strategy, vec![guideline])),
            }
        }

        let batch_groups = join_all(groups.iter().map(|(_, strategy, group)| {
            strategy.create_matching_batches(group.clone(), snapshot.clone())
        }))
        .await;

        let batches: Vec<_> = batch_groups.into_iter().flatten().collect();
        let batch_count = batches.len();
        debug!(batch_count, "processing guideline-matching batches");

        let results = join_all(batches.iter().map(|batch| {
            let ctx = ctx.clone();
            async move {
                if ctx.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                batch.process(&ctx).await
            }
        }))
        .await;

        let mut matches = Vec::new();
        let mut batch_usages = Vec::new();
        let mut failure: Option<EngineError> = None;
        let mut cancelled = false;

        for result in results {
            match result {
                Ok(batch_result) => {
                    batch_usages.push(batch_result.usage);
                    matches.extend(batch_result.matches);
                }
                Err(e) if e.is_cancellation() => cancelled = true,
                Err(e) => failure = Some(e),
            }
        }

        if cancelled && ctx.is_cancelled() {
            // Salvage completed batch generations for inspection.
            info!(
                session_id = %session_id,
                completed = batch_usages.len(),
                total = batch_count,
                "matching cancelled; keeping completed batch generations"
            );
            self.partial_generations
                .lock()
                .insert(session_id.clone(), batch_usages);
            return Err(EngineError::Cancelled);
        }

        if let Some(e) = failure {
            warn!(error = %e, "guideline-matching batch failed after retries");
            return Err(e);
        }

        for (_, strategy, _) in &groups {
            matches = strategy.transform_matches(&snapshot, matches).await;
        }

        Ok(MatchingResult {
            matches,
            batch_count,
            batch_usages,
            total_duration: started.elapsed(),
        })
    }

    /// After messages are emitted, decide which matched guidelines' actions
    /// the reply fulfilled. Only actionable, non-continuous, not-yet-applied
    /// guidelines are evaluated.
    pub async fn analyze_response(
        &self,
        ctx: &Context,
        snapshot: Arc<AnalysisSnapshot>,
        matches: Vec<GuidelineMatch>,
    ) -> Result<ResponseAnalysisResult, EngineError> {
        let eligible: Vec<GuidelineMatch> = matches
            .into_iter()
            .filter(|m| {
                m.guideline.is_actionable()
                    && !m.guideline.metadata.continuous
                    && !snapshot.applied_guideline_ids.contains(&m.guideline.id)
            })
            .collect();

        if eligible.is_empty() {
            return Ok(ResponseAnalysisResult::default());
        }

        let started = Instant::now();
        let ctx = ctx.scoped("response-analysis");

        let mut groups: Vec<(&'static str, Arc<dyn strategy::GuidelineMatchingStrategy>, Vec<GuidelineMatch>)> =
            Vec::new();
        for m in eligible {
            let strategy = self.resolver.resolve(&m.guideline);
            match groups.iter().position(|(name, _, _)| *name == strategy.name()) {
                Some(i) => groups[i].2.push(m),
                None => groups.push((strategy.name(), strategy, vec![m])),
            }
        }

        let batch_groups = join_all(groups.iter().map(|(_, strategy, group)| {
            strategy.create_response_analysis_batches(group.clone(), snapshot.clone())
        }))
        .await;

        let batches: Vec<_> = batch_groups.into_iter().flatten().collect();
        let results = join_all(batches.iter().map(|batch| batch.process(&ctx))).await;

        let mut analyzed = Vec::new();
        let mut batch_usages = Vec::new();
        for result in results {
            let batch_result = result?;
            batch_usages.push(batch_result.usage);
            analyzed.extend(batch_result.analyzed);
        }

        Ok(ResponseAnalysisResult {
            analyzed,
            batch_usages,
            total_duration: started.elapsed(),
        })
    }
}
