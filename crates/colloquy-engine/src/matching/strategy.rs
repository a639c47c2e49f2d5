//! Strategy and batch seams, plus the resolver priority chain.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use colloquy_core::correlation::Context;
use colloquy_core::guidelines::{Guideline, GuidelineMatch};
use colloquy_core::ids::GuidelineId;

use super::response_analysis::{AnalysisBatchResult, AnalysisSnapshot};
use super::{MatchingBatchResult, MatchingSnapshot};
use crate::error::EngineError;

#[async_trait]
pub trait GuidelineMatchingBatch: Send + Sync {
    /// Issue one LLM call and map its decisions back to matches. Retries for
    /// transient failures happen inside, via the policy's temperature ladder.
    async fn process(&self, ctx: &Context) -> Result<MatchingBatchResult, EngineError>;
}

#[async_trait]
pub trait ResponseAnalysisBatch: Send + Sync {
    async fn process(&self, ctx: &Context) -> Result<AnalysisBatchResult, EngineError>;
}

#[async_trait]
pub trait GuidelineMatchingStrategy: Send + Sync {
    /// Stable grouping key; guidelines resolving to the same name share one
    /// batch-creation call.
    fn name(&self) -> &'static str;

    async fn create_matching_batches(
        &self,
        guidelines: Vec<Guideline>,
        snapshot: Arc<MatchingSnapshot>,
    ) -> Vec<Box<dyn GuidelineMatchingBatch>>;

    async fn create_response_analysis_batches(
        &self,
        matches: Vec<GuidelineMatch>,
        snapshot: Arc<AnalysisSnapshot>,
    ) -> Vec<Box<dyn ResponseAnalysisBatch>>;

    /// Post-process the merged match list (identity for most strategies).
    async fn transform_matches(
        &self,
        snapshot: &MatchingSnapshot,
        matches: Vec<GuidelineMatch>,
    ) -> Vec<GuidelineMatch>;
}

/// Resolves the strategy for a guideline: per-guideline override, then
/// per-tag override, then the default generic strategy.
pub struct StrategyResolver {
    by_guideline: HashMap<GuidelineId, Arc<dyn GuidelineMatchingStrategy>>,
    by_tag: HashMap<String, Arc<dyn GuidelineMatchingStrategy>>,
    default: Arc<dyn GuidelineMatchingStrategy>,
}

impl StrategyResolver {
    pub fn new(default: Arc<dyn GuidelineMatchingStrategy>) -> Self {
        Self {
            by_guideline: HashMap::new(),
            by_tag: HashMap::new(),
            default,
        }
    }

    pub fn override_for_guideline(
        mut self,
        id: GuidelineId,
        strategy: Arc<dyn GuidelineMatchingStrategy>,
    ) -> Self {
        self.by_guideline.insert(id, strategy);
        self
    }

    pub fn override_for_tag(
        mut self,
        tag: impl Into<String>,
        strategy: Arc<dyn GuidelineMatchingStrategy>,
    ) -> Self {
        self.by_tag.insert(tag.into(), strategy);
        self
    }

    pub fn resolve(&self, guideline: &Guideline) -> Arc<dyn GuidelineMatchingStrategy> {
        if let Some(strategy) = self.by_guideline.get(&guideline.id) {
            return strategy.clone();
        }
        for tag in &guideline.tags {
            if let Some(strategy) = self.by_tag.get(tag) {
                return strategy.clone();
            }
        }
        self.default.clone()
    }
}
