//! The per-cycle working set.
//!
//! A `LoadedContext` exists only for the duration of one processing cycle.
//! It is mutated exclusively from the engine's own task; concurrent
//! sub-operations receive snapshots and their results are merged on join.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use colloquy_core::agents::Agent;
use colloquy_core::capabilities::Capability;
use colloquy_core::context_vars::{ContextVariable, ContextVariableValue};
use colloquy_core::customers::Customer;
use colloquy_core::events::Event;
use colloquy_core::glossary::Term;
use colloquy_core::guidelines::GuidelineMatch;
use colloquy_core::ids::{GuidelineId, JourneyId};
use colloquy_core::journeys::Journey;
use colloquy_core::sessions::{Session, SessionMode};
use colloquy_core::tools::ToolId;
use colloquy_llm::UsageInfo;

/// The interaction history loaded at cycle start: every event up to now.
#[derive(Clone, Debug, Default)]
pub struct Interaction {
    pub history: Vec<Event>,
    pub last_known_offset: Option<u64>,
}

impl Interaction {
    pub fn new(history: Vec<Event>) -> Self {
        let last_known_offset = history.last().map(|e| e.offset);
        Self {
            history,
            last_known_offset,
        }
    }
}

/// A parameter the engine needed but could not supply this turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProblemParameter {
    pub tool_id: ToolId,
    pub parameter: String,
    /// Priority of the guideline that wanted the tool, for message ordering.
    pub precedence: f64,
}

/// Missing and invalid tool parameters recorded during tool inference.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToolInsights {
    pub missing_data: Vec<ProblemParameter>,
    pub invalid_data: Vec<ProblemParameter>,
}

impl ToolInsights {
    pub fn is_empty(&self) -> bool {
        self.missing_data.is_empty() && self.invalid_data.is_empty()
    }

    pub fn merge(&mut self, other: ToolInsights) {
        self.missing_data.extend(other.missing_data);
        self.invalid_data.extend(other.invalid_data);
    }

    /// Apply precedence: for a parameter reported both missing and invalid,
    /// keep missing; deduplicate by `(tool_id, parameter)`.
    pub fn filter_problematic(&self) -> ToolInsights {
        let mut seen: BTreeSet<(ToolId, String)> = BTreeSet::new();
        let mut missing = Vec::new();
        for p in &self.missing_data {
            if seen.insert((p.tool_id.clone(), p.parameter.clone())) {
                missing.push(p.clone());
            }
        }
        let mut invalid = Vec::new();
        for p in &self.invalid_data {
            if seen.insert((p.tool_id.clone(), p.parameter.clone())) {
                invalid.push(p.clone());
            }
        }
        ToolInsights {
            missing_data: missing,
            invalid_data: invalid,
        }
    }
}

/// Snapshot of one preparation iteration.
#[derive(Clone, Debug, Default)]
pub struct IterationState {
    pub matched_guidelines: Vec<GuidelineMatch>,
    pub tool_enabled_matches: Vec<GuidelineMatch>,
    pub ordinary_matches: Vec<GuidelineMatch>,
    pub tool_events: Vec<Event>,
    pub glossary_terms: Vec<Term>,
    pub journeys_considered: Vec<JourneyId>,
    pub tool_insights: ToolInsights,
}

/// Mutable response state accumulated across iterations.
#[derive(Clone, Debug, Default)]
pub struct ResponseState {
    pub iterations: Vec<IterationState>,
    pub prepared_to_respond: bool,
    pub context_variables: Vec<(ContextVariable, ContextVariableValue)>,
    pub glossary_terms: Vec<Term>,
    pub capabilities: Vec<Capability>,
    /// Journeys activated for this cycle.
    pub journeys: Vec<Journey>,
    pub journey_paths: BTreeMap<JourneyId, Vec<Option<GuidelineId>>>,
    pub ordinary_matches: Vec<GuidelineMatch>,
    pub tool_enabled_matches: Vec<GuidelineMatch>,
    pub tool_events: Vec<Event>,
    pub tool_insights: ToolInsights,
    /// Token usage aggregated across every LLM call of the cycle.
    pub usage: UsageInfo,
    /// Mode change requested by a tool result, applied between iterations.
    pub requested_mode: Option<SessionMode>,
}

impl ResponseState {
    pub fn all_matches(&self) -> impl Iterator<Item = &GuidelineMatch> {
        self.ordinary_matches
            .iter()
            .chain(self.tool_enabled_matches.iter())
    }
}

/// Everything one processing cycle works with.
#[derive(Clone, Debug)]
pub struct LoadedContext {
    pub session: Session,
    pub agent: Agent,
    pub customer: Customer,
    pub interaction: Interaction,
    pub state: ResponseState,
}

impl LoadedContext {
    pub fn new(session: Session, agent: Agent, customer: Customer, history: Vec<Event>) -> Self {
        Self {
            session,
            agent,
            customer,
            interaction: Interaction::new(history),
            state: ResponseState::default(),
        }
    }

    /// Guideline ids already applied in previous cycles.
    pub fn applied_guideline_ids(&self) -> Vec<GuidelineId> {
        self.session
            .current_agent_state()
            .applied_guideline_ids
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(tool: &str, name: &str) -> ProblemParameter {
        ProblemParameter {
            tool_id: ToolId::new("svc", tool),
            parameter: name.into(),
            precedence: 0.5,
        }
    }

    #[test]
    fn missing_wins_over_invalid_for_same_parameter() {
        let insights = ToolInsights {
            missing_data: vec![param("book", "destination")],
            invalid_data: vec![param("book", "destination"), param("book", "date")],
        };
        let filtered = insights.filter_problematic();
        assert_eq!(filtered.missing_data.len(), 1);
        assert_eq!(filtered.invalid_data.len(), 1);
        assert_eq!(filtered.invalid_data[0].parameter, "date");
    }

    #[test]
    fn duplicates_deduplicated() {
        let insights = ToolInsights {
            missing_data: vec![param("book", "origin"), param("book", "origin")],
            invalid_data: vec![],
        };
        let filtered = insights.filter_problematic();
        assert_eq!(filtered.missing_data.len(), 1);
    }

    #[test]
    fn same_parameter_on_different_tools_kept() {
        let insights = ToolInsights {
            missing_data: vec![param("book", "date")],
            invalid_data: vec![param("cancel", "date")],
        };
        let filtered = insights.filter_problematic();
        assert_eq!(filtered.missing_data.len(), 1);
        assert_eq!(filtered.invalid_data.len(), 1);
    }

    #[test]
    fn merge_concatenates() {
        let mut a = ToolInsights {
            missing_data: vec![param("t", "x")],
            invalid_data: vec![],
        };
        a.merge(ToolInsights {
            missing_data: vec![param("t", "y")],
            invalid_data: vec![param("t", "z")],
        });
        assert_eq!(a.missing_data.len(), 2);
        assert_eq!(a.invalid_data.len(), 1);
        assert!(!a.is_empty());
    }

    #[test]
    fn interaction_tracks_last_offset() {
        let interaction = Interaction::new(Vec::new());
        assert_eq!(interaction.last_known_offset, None);
    }
}
