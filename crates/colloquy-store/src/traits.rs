//! The narrow store interfaces the engine consumes.
//!
//! Persistence itself is an external concern; the engine only sees these
//! traits. The session store is the single cross-task shared mutable
//! resource, serialized through append-only events with gap-free per-session
//! offsets.

use std::time::Duration;

use async_trait::async_trait;

use colloquy_core::agents::Agent;
use colloquy_core::canned::CannedResponse;
use colloquy_core::capabilities::Capability;
use colloquy_core::context_vars::{ContextVariable, ContextVariableValue};
use colloquy_core::correlation::CorrelationScope;
use colloquy_core::customers::Customer;
use colloquy_core::events::{Event, EventKind, EventSource};
use colloquy_core::glossary::Term;
use colloquy_core::guidelines::Guideline;
use colloquy_core::ids::{
    AgentId, CustomerId, GuidelineId, JourneyId, JourneyNodeId, SessionId,
};
use colloquy_core::journeys::Journey;
use colloquy_core::sessions::{AgentState, Session, SessionMode};
use colloquy_core::tools::ToolId;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Filters for listing session events.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    pub min_offset: Option<u64>,
    /// Empty means all kinds.
    pub kinds: Vec<EventKind>,
    /// Empty means all sources.
    pub sources: Vec<EventSource>,
}

impl EventFilter {
    pub fn since(min_offset: u64) -> Self {
        Self {
            min_offset: Some(min_offset),
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(min) = self.min_offset {
            if event.offset < min {
                return false;
            }
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.sources.is_empty() && !self.sources.contains(&event.source) {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: Session) -> Result<Session, StoreError>;

    async fn read_session(&self, id: &SessionId) -> Result<Session, StoreError>;

    async fn update_mode(&self, id: &SessionId, mode: SessionMode) -> Result<(), StoreError>;

    /// Append a new agent-state snapshot for a completed cycle.
    async fn append_agent_state(
        &self,
        id: &SessionId,
        state: AgentState,
    ) -> Result<(), StoreError>;

    /// Append an event. The store assigns the id, the next gap-free offset,
    /// and the creation timestamp.
    async fn create_event(
        &self,
        session_id: &SessionId,
        kind: EventKind,
        source: EventSource,
        correlation_id: CorrelationScope,
        data: serde_json::Value,
    ) -> Result<Event, StoreError>;

    async fn list_events(
        &self,
        session_id: &SessionId,
        filter: &EventFilter,
    ) -> Result<Vec<Event>, StoreError>;

    /// Long-poll: return matching events as soon as any exist, waiting up to
    /// `timeout` for new appends. An empty result means the timeout elapsed.
    async fn wait_for_events(
        &self,
        session_id: &SessionId,
        filter: &EventFilter,
        timeout: Duration,
    ) -> Result<Vec<Event>, StoreError>;
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn read_agent(&self, id: &AgentId) -> Result<Agent, StoreError>;
}

#[async_trait]
pub trait CustomerStore: Send + Sync {
    async fn read_customer(&self, id: &CustomerId) -> Result<Customer, StoreError>;
}

#[async_trait]
pub trait GuidelineStore: Send + Sync {
    /// Enabled guidelines carrying any of `tags` (all when `tags` is empty).
    async fn list_guidelines(&self, tags: &[String]) -> Result<Vec<Guideline>, StoreError>;
}

#[async_trait]
pub trait JourneyStore: Send + Sync {
    async fn read_journey(&self, id: &JourneyId) -> Result<Journey, StoreError>;

    async fn list_journeys(&self) -> Result<Vec<Journey>, StoreError>;

    /// The journeys most relevant to `query` among `available`, at most
    /// `max_n`, in descending relevance.
    async fn find_relevant_journeys(
        &self,
        query: &str,
        available: &[JourneyId],
        max_n: usize,
    ) -> Result<Vec<Journey>, StoreError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidelineToolAssociation {
    pub guideline_id: GuidelineId,
    pub tool_id: ToolId,
}

#[async_trait]
pub trait GuidelineToolAssociationStore: Send + Sync {
    async fn find_all(&self) -> Result<Vec<GuidelineToolAssociation>, StoreError>;
}

#[async_trait]
pub trait JourneyNodeToolAssociationStore: Send + Sync {
    async fn find_node_tools(&self, node_id: &JourneyNodeId) -> Result<Vec<ToolId>, StoreError>;
}

#[async_trait]
pub trait CannedResponseStore: Send + Sync {
    /// Templates relevant to the agent, its active journeys, and the matched
    /// guidelines.
    async fn find_for_context(
        &self,
        agent_id: &AgentId,
        journeys: &[JourneyId],
        guidelines: &[GuidelineId],
    ) -> Result<Vec<CannedResponse>, StoreError>;
}

#[async_trait]
pub trait ContextVariableStore: Send + Sync {
    async fn read_values(
        &self,
        agent_id: &AgentId,
        customer_id: &CustomerId,
    ) -> Result<Vec<(ContextVariable, ContextVariableValue)>, StoreError>;
}

#[async_trait]
pub trait GlossaryStore: Send + Sync {
    async fn find_relevant_terms(
        &self,
        query: &str,
        max_terms: usize,
    ) -> Result<Vec<Term>, StoreError>;
}

#[async_trait]
pub trait CapabilityStore: Send + Sync {
    async fn find_capabilities(&self, agent_id: &AgentId) -> Result<Vec<Capability>, StoreError>;
}

/// Per-cycle trace persisted during post-processing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Inspection {
    pub session_id: SessionId,
    pub correlation_id: CorrelationScope,
    pub iteration_count: usize,
    pub matched_guideline_ids: Vec<GuidelineId>,
    pub tool_call_count: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_duration_ms: u64,
}

#[async_trait]
pub trait InspectionStore: Send + Sync {
    async fn save_inspection(&self, inspection: Inspection) -> Result<(), StoreError>;

    /// Most recent inspection for a session, if any cycle completed.
    async fn last_inspection(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<Inspection>, StoreError>;
}
