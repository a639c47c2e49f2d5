//! Event emission seam.
//!
//! `Publisher` writes through to the session store and returns the persisted
//! event; `BufferedEmitter` accumulates in memory and is flushed by its owner
//! (used inside nested sub-engines). Emissions from a single correlation
//! scope are delivered in program order; ordering across scopes only exists
//! through the store's monotonic offsets.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use colloquy_core::correlation::CorrelationScope;
use colloquy_core::events::{
    Event, EventKind, EventSource, MessagePayload, StatusPayload, ToolEventPayload,
};
use colloquy_core::ids::SessionId;
use colloquy_store::{SessionStore, StoreError};

#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(
        &self,
        kind: EventKind,
        source: EventSource,
        correlation_id: CorrelationScope,
        data: serde_json::Value,
    ) -> Result<Event, StoreError>;

    async fn emit_status(
        &self,
        correlation_id: CorrelationScope,
        payload: StatusPayload,
    ) -> Result<Event, StoreError> {
        self.emit(
            EventKind::Status,
            EventSource::AiAgent,
            correlation_id,
            serde_json::to_value(payload)?,
        )
        .await
    }

    async fn emit_message(
        &self,
        correlation_id: CorrelationScope,
        payload: MessagePayload,
    ) -> Result<Event, StoreError> {
        self.emit(
            EventKind::Message,
            EventSource::AiAgent,
            correlation_id,
            serde_json::to_value(payload)?,
        )
        .await
    }

    async fn emit_tool(
        &self,
        correlation_id: CorrelationScope,
        payload: ToolEventPayload,
    ) -> Result<Event, StoreError> {
        self.emit(
            EventKind::Tool,
            EventSource::AiAgent,
            correlation_id,
            serde_json::to_value(payload)?,
        )
        .await
    }

    async fn emit_custom(
        &self,
        correlation_id: CorrelationScope,
        data: serde_json::Value,
    ) -> Result<Event, StoreError> {
        self.emit(EventKind::Custom, EventSource::AiAgent, correlation_id, data)
            .await
    }
}

/// Write-through emitter bound to one session.
pub struct Publisher {
    store: Arc<dyn SessionStore>,
    session_id: SessionId,
}

impl Publisher {
    pub fn new(store: Arc<dyn SessionStore>, session_id: SessionId) -> Self {
        Self { store, session_id }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

#[async_trait]
impl EventEmitter for Publisher {
    async fn emit(
        &self,
        kind: EventKind,
        source: EventSource,
        correlation_id: CorrelationScope,
        data: serde_json::Value,
    ) -> Result<Event, StoreError> {
        self.store
            .create_event(&self.session_id, kind, source, correlation_id, data)
            .await
    }
}

/// Accumulates events in memory without touching the store. Offsets are
/// buffer-local; the owner assigns real offsets by flushing into a
/// write-through emitter.
#[derive(Default)]
pub struct BufferedEmitter {
    events: Mutex<Vec<Event>>,
}

impl BufferedEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Replay buffered events into `target` in order.
    pub async fn flush_into(&self, target: &dyn EventEmitter) -> Result<Vec<Event>, StoreError> {
        let mut out = Vec::new();
        for event in self.drain() {
            out.push(
                target
                    .emit(event.kind, event.source, event.correlation_id, event.data)
                    .await?,
            );
        }
        Ok(out)
    }
}

#[async_trait]
impl EventEmitter for BufferedEmitter {
    async fn emit(
        &self,
        kind: EventKind,
        source: EventSource,
        correlation_id: CorrelationScope,
        data: serde_json::Value,
    ) -> Result<Event, StoreError> {
        let mut events = self.events.lock();
        let event = Event {
            id: colloquy_core::ids::EventId::new(),
            offset: events.len() as u64,
            kind,
            source,
            correlation_id,
            creation_utc: chrono::Utc::now(),
            data,
        };
        events.push(event.clone());
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_core::agents::Agent;
    use colloquy_core::customers::Customer;
    use colloquy_core::events::SessionStatus;
    use colloquy_core::sessions::Session;
    use colloquy_store::{EventFilter, MemoryStores};

    async fn setup() -> (Arc<MemoryStores>, SessionId) {
        let stores = MemoryStores::new();
        let agent = Agent::new("a", "d");
        let customer = Customer::guest();
        let session = Session::new(agent.id.clone(), customer.id.clone());
        let sid = session.id.clone();
        stores.create_session(session).await.unwrap();
        (stores, sid)
    }

    #[tokio::test]
    async fn publisher_writes_through() {
        let (stores, sid) = setup().await;
        let publisher = Publisher::new(stores.clone(), sid.clone());

        let event = publisher
            .emit_status(
                CorrelationScope::from_raw("Rx::process"),
                StatusPayload::bare(SessionStatus::Acknowledged),
            )
            .await
            .unwrap();
        assert_eq!(event.offset, 0);

        let stored = stores
            .list_events(&sid, &EventFilter::default())
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, event.id);
    }

    #[tokio::test]
    async fn buffer_accumulates_without_store_writes() {
        let (stores, sid) = setup().await;
        let buffer = BufferedEmitter::new();

        buffer
            .emit_status(
                CorrelationScope::from_raw("Rx"),
                StatusPayload::processing("Interpreting"),
            )
            .await
            .unwrap();
        buffer
            .emit_custom(CorrelationScope::from_raw("Rx"), serde_json::json!({"n": 1}))
            .await
            .unwrap();

        assert_eq!(buffer.len(), 2);
        assert!(stores
            .list_events(&sid, &EventFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn flush_preserves_order_and_assigns_offsets() {
        let (stores, sid) = setup().await;
        let buffer = BufferedEmitter::new();
        for i in 0..3 {
            buffer
                .emit_custom(CorrelationScope::from_raw("Rx"), serde_json::json!({"n": i}))
                .await
                .unwrap();
        }

        let publisher = Publisher::new(stores.clone(), sid.clone());
        let flushed = buffer.flush_into(&publisher).await.unwrap();
        assert_eq!(flushed.len(), 3);
        assert!(buffer.is_empty());

        let stored = stores
            .list_events(&sid, &EventFilter::default())
            .await
            .unwrap();
        for (i, event) in stored.iter().enumerate() {
            assert_eq!(event.offset, i as u64);
            assert_eq!(event.data["n"], i);
        }
    }
}
