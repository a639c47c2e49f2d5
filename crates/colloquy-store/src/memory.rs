//! In-memory implementation of every store seam.
//!
//! Backs tests and local demos. Event appends take a per-session write lock
//! so offsets stay gap-free under concurrent emitters; long-polling is
//! served through a per-session `Notify`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::Instant;

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
    AgentId, CustomerId, EventId, GuidelineId, JourneyId, JourneyNodeId, SessionId,
};
use colloquy_core::journeys::Journey;
use colloquy_core::sessions::{AgentState, Session, SessionMode};
use colloquy_core::tools::ToolId;

use crate::error::StoreError;
use crate::traits::*;

/// All stores in one struct, shared behind an `Arc`.
#[derive(Default)]
pub struct MemoryStores {
    sessions: RwLock<HashMap<SessionId, Session>>,
    events: RwLock<HashMap<SessionId, Vec<Event>>>,
    notifiers: Mutex<HashMap<SessionId, Arc<Notify>>>,

    agents: RwLock<HashMap<AgentId, Agent>>,
    customers: RwLock<HashMap<CustomerId, Customer>>,
    guidelines: RwLock<Vec<Guideline>>,
    journeys: RwLock<HashMap<JourneyId, Journey>>,
    guideline_tool_associations: RwLock<Vec<GuidelineToolAssociation>>,
    node_tools: RwLock<HashMap<JourneyNodeId, Vec<ToolId>>>,
    canned_responses: RwLock<Vec<CannedResponse>>,
    variables: RwLock<Vec<(AgentId, CustomerId, ContextVariable, ContextVariableValue)>>,
    terms: RwLock<Vec<Term>>,
    capabilities: RwLock<HashMap<AgentId, Vec<Capability>>>,
    inspections: Mutex<Vec<Inspection>>,
}

impl MemoryStores {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_agent(&self, agent: Agent) {
        self.agents.write().insert(agent.id.clone(), agent);
    }

    pub fn add_customer(&self, customer: Customer) {
        self.customers.write().insert(customer.id.clone(), customer);
    }

    pub fn add_guideline(&self, guideline: Guideline) {
        self.guidelines.write().push(guideline);
    }

    pub fn add_journey(&self, journey: Journey) {
        self.journeys.write().insert(journey.id.clone(), journey);
    }

    pub fn associate_tool(&self, guideline_id: GuidelineId, tool_id: ToolId) {
        self.guideline_tool_associations
            .write()
            .push(GuidelineToolAssociation {
                guideline_id,
                tool_id,
            });
    }

    pub fn associate_node_tool(&self, node_id: JourneyNodeId, tool_id: ToolId) {
        self.node_tools.write().entry(node_id).or_default().push(tool_id);
    }

    pub fn add_canned_response(&self, response: CannedResponse) {
        self.canned_responses.write().push(response);
    }

    pub fn add_variable(
        &self,
        agent_id: AgentId,
        customer_id: CustomerId,
        variable: ContextVariable,
        value: ContextVariableValue,
    ) {
        self.variables
            .write()
            .push((agent_id, customer_id, variable, value));
    }

    pub fn add_term(&self, term: Term) {
        self.terms.write().push(term);
    }

    pub fn add_capability(&self, agent_id: AgentId, capability: Capability) {
        self.capabilities
            .write()
            .entry(agent_id)
            .or_default()
            .push(capability);
    }

    pub fn saved_inspections(&self) -> Vec<Inspection> {
        self.inspections.lock().clone()
    }

    fn notifier(&self, session_id: &SessionId) -> Arc<Notify> {
        self.notifiers
            .lock()
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

/// Crude lexical relevance: the number of distinct query words appearing in
/// the haystack. Stands in for the vector store this crate does not own.
fn lexical_overlap(query: &str, haystack: &str) -> usize {
    let haystack = haystack.to_lowercase();
    let mut words: Vec<&str> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .collect();
    words.sort_unstable();
    words.dedup();
    words
        .iter()
        .filter(|w| haystack.contains(&w.to_lowercase()))
        .count()
}

#[async_trait]
impl SessionStore for MemoryStores {
    async fn create_session(&self, session: Session) -> Result<Session, StoreError> {
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn read_session(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    async fn update_mode(&self, id: &SessionId, mode: SessionMode) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
        session.mode = mode;
        Ok(())
    }

    async fn append_agent_state(
        &self,
        id: &SessionId,
        state: AgentState,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
        session.agent_states.push(state);
        Ok(())
    }

    async fn create_event(
        &self,
        session_id: &SessionId,
        kind: EventKind,
        source: EventSource,
        correlation_id: CorrelationScope,
        data: serde_json::Value,
    ) -> Result<Event, StoreError> {
        if !self.sessions.read().contains_key(session_id) {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }

        let event = {
            let mut events = self.events.write();
            let log = events.entry(session_id.clone()).or_default();
            let event = Event {
                id: EventId::new(),
                offset: log.len() as u64,
                kind,
                source,
                correlation_id,
                creation_utc: Utc::now(),
                data,
            };
            log.push(event.clone());
            event
        };

        self.notifier(session_id).notify_waiters();
        Ok(event)
    }

    async fn list_events(
        &self,
        session_id: &SessionId,
        filter: &EventFilter,
    ) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .events
            .read()
            .get(session_id)
            .map(|log| log.iter().filter(|e| filter.matches(e)).cloned().collect())
            .unwrap_or_default())
    }

    async fn wait_for_events(
        &self,
        session_id: &SessionId,
        filter: &EventFilter,
        timeout: Duration,
    ) -> Result<Vec<Event>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notify = self.notifier(session_id);
            let notified = notify.notified();
            tokio::pin!(notified);

            let events = self.list_events(session_id, filter).await?;
            if !events.is_empty() {
                return Ok(events);
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(Vec::new());
            };
            if tokio::time::timeout(remaining, &mut notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}

#[async_trait]
impl AgentStore for MemoryStores {
    async fn read_agent(&self, id: &AgentId) -> Result<Agent, StoreError> {
        self.agents
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("agent {id}")))
    }
}

#[async_trait]
impl CustomerStore for MemoryStores {
    async fn read_customer(&self, id: &CustomerId) -> Result<Customer, StoreError> {
        self.customers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("customer {id}")))
    }
}

#[async_trait]
impl GuidelineStore for MemoryStores {
    async fn list_guidelines(&self, tags: &[String]) -> Result<Vec<Guideline>, StoreError> {
        Ok(self
            .guidelines
            .read()
            .iter()
            .filter(|g| g.enabled)
            .filter(|g| tags.is_empty() || g.tags.iter().any(|t| tags.contains(t)))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl JourneyStore for MemoryStores {
    async fn read_journey(&self, id: &JourneyId) -> Result<Journey, StoreError> {
        self.journeys
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("journey {id}")))
    }

    async fn list_journeys(&self) -> Result<Vec<Journey>, StoreError> {
        Ok(self.journeys.read().values().cloned().collect())
    }

    async fn find_relevant_journeys(
        &self,
        query: &str,
        available: &[JourneyId],
        max_n: usize,
    ) -> Result<Vec<Journey>, StoreError> {
        let journeys = self.journeys.read();
        let mut scored: Vec<(usize, Journey)> = available
            .iter()
            .filter_map(|id| journeys.get(id))
            .map(|j| {
                let text = format!("{} {}", j.title, j.condition);
                (lexical_overlap(query, &text), j.clone())
            })
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored.into_iter().take(max_n).map(|(_, j)| j).collect())
    }
}

#[async_trait]
impl GuidelineToolAssociationStore for MemoryStores {
    async fn find_all(&self) -> Result<Vec<GuidelineToolAssociation>, StoreError> {
        Ok(self.guideline_tool_associations.read().clone())
    }
}

#[async_trait]
impl JourneyNodeToolAssociationStore for MemoryStores {
    async fn find_node_tools(&self, node_id: &JourneyNodeId) -> Result<Vec<ToolId>, StoreError> {
        Ok(self
            .node_tools
            .read()
            .get(node_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl CannedResponseStore for MemoryStores {
    async fn find_for_context(
        &self,
        _agent_id: &AgentId,
        _journeys: &[JourneyId],
        _guidelines: &[GuidelineId],
    ) -> Result<Vec<CannedResponse>, StoreError> {
        // The in-memory store keeps one flat pool; contextual narrowing is
        // the ranking stage's job.
        Ok(self.canned_responses.read().clone())
    }
}

#[async_trait]
impl ContextVariableStore for MemoryStores {
    async fn read_values(
        &self,
        agent_id: &AgentId,
        customer_id: &CustomerId,
    ) -> Result<Vec<(ContextVariable, ContextVariableValue)>, StoreError> {
        Ok(self
            .variables
            .read()
            .iter()
            .filter(|(a, c, _, _)| a == agent_id && c == customer_id)
            .map(|(_, _, var, value)| (var.clone(), value.clone()))
            .collect())
    }
}

#[async_trait]
impl GlossaryStore for MemoryStores {
    async fn find_relevant_terms(
        &self,
        query: &str,
        max_terms: usize,
    ) -> Result<Vec<Term>, StoreError> {
        let terms = self.terms.read();
        let mut scored: Vec<(usize, Term)> = terms
            .iter()
            .map(|t| {
                let text = format!("{} {} {}", t.name, t.description, t.synonyms.join(" "));
                (lexical_overlap(query, &text), t.clone())
            })
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored.into_iter().take(max_terms).map(|(_, t)| t).collect())
    }
}

#[async_trait]
impl CapabilityStore for MemoryStores {
    async fn find_capabilities(&self, agent_id: &AgentId) -> Result<Vec<Capability>, StoreError> {
        Ok(self
            .capabilities
            .read()
            .get(agent_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl InspectionStore for MemoryStores {
    async fn save_inspection(&self, inspection: Inspection) -> Result<(), StoreError> {
        self.inspections.lock().push(inspection);
        Ok(())
    }

    async fn last_inspection(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<Inspection>, StoreError> {
        Ok(self
            .inspections
            .lock()
            .iter()
            .rev()
            .find(|i| &i.session_id == session_id)
            .cloned())
    }
}
