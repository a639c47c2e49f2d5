//! Sessions and the per-cycle agent state ledger.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, CustomerId, GuidelineId, JourneyId, SessionId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// The engine replies to every customer message.
    #[default]
    Auto,
    /// A human has taken over; the engine performs no work.
    Manual,
}

/// Snapshot appended once per completed processing cycle.
///
/// `applied_guideline_ids` is the cumulative set of guidelines whose actions
/// the agent has already carried out; `journey_paths` records, per journey,
/// the node-guideline chosen at each turn (`None` when no step matched).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentState {
    pub applied_guideline_ids: Vec<GuidelineId>,
    #[serde(default)]
    pub journey_paths: BTreeMap<JourneyId, Vec<Option<GuidelineId>>>,
}

impl AgentState {
    pub fn is_applied(&self, id: &GuidelineId) -> bool {
        self.applied_guideline_ids.contains(id)
    }
}

/// An ordered conversation between a customer and an agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub agent_id: AgentId,
    pub customer_id: CustomerId,
    pub creation_utc: DateTime<Utc>,
    pub mode: SessionMode,
    pub title: Option<String>,
    /// One entry per completed processing cycle; the last entry reflects the
    /// state before the current cycle.
    #[serde(default)]
    pub agent_states: Vec<AgentState>,
}

impl Session {
    pub fn new(agent_id: AgentId, customer_id: CustomerId) -> Self {
        Self {
            id: SessionId::new(),
            agent_id,
            customer_id,
            creation_utc: Utc::now(),
            mode: SessionMode::Auto,
            title: None,
            agent_states: Vec::new(),
        }
    }

    /// The agent state going into the current cycle (empty for a new session).
    pub fn current_agent_state(&self) -> AgentState {
        self.agent_states.last().cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_has_empty_state() {
        let session = Session::new(AgentId::new(), CustomerId::new());
        assert_eq!(session.mode, SessionMode::Auto);
        let state = session.current_agent_state();
        assert!(state.applied_guideline_ids.is_empty());
        assert!(state.journey_paths.is_empty());
    }

    #[test]
    fn current_agent_state_is_last_entry() {
        let mut session = Session::new(AgentId::new(), CustomerId::new());
        let g1 = GuidelineId::new();
        let g2 = GuidelineId::new();
        session.agent_states.push(AgentState {
            applied_guideline_ids: vec![g1.clone()],
            journey_paths: BTreeMap::new(),
        });
        session.agent_states.push(AgentState {
            applied_guideline_ids: vec![g1.clone(), g2.clone()],
            journey_paths: BTreeMap::new(),
        });

        let state = session.current_agent_state();
        assert!(state.is_applied(&g1));
        assert!(state.is_applied(&g2));
    }

    #[test]
    fn session_mode_serde() {
        assert_eq!(
            serde_json::to_string(&SessionMode::Manual).unwrap(),
            "\"manual\""
        );
    }
}
