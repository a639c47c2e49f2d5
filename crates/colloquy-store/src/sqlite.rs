//! Durable session/event store over SQLite.
//!
//! Events are linearized per session: appends take a per-session lock, read
//! the current max offset, and insert at `max + 1`, so `(session_id, offset)`
//! is unique and gap-free even under concurrent emitters.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::sync::Notify;
use tokio::time::Instant;

use colloquy_core::correlation::CorrelationScope;
use colloquy_core::events::{Event, EventKind, EventSource};
use colloquy_core::ids::{AgentId, CustomerId, EventId, SessionId};
use colloquy_core::sessions::{AgentState, Session, SessionMode};

use crate::error::StoreError;
use crate::traits::{EventFilter, SessionStore};

/// Shared SQLite handle with serialized access.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS sessions (
                 id TEXT PRIMARY KEY,
                 agent_id TEXT NOT NULL,
                 customer_id TEXT NOT NULL,
                 creation_utc TEXT NOT NULL,
                 mode TEXT NOT NULL,
                 title TEXT,
                 agent_states TEXT NOT NULL DEFAULT '[]'
             );
             CREATE TABLE IF NOT EXISTS events (
                 session_id TEXT NOT NULL REFERENCES sessions(id),
                 offset INTEGER NOT NULL,
                 id TEXT NOT NULL,
                 kind TEXT NOT NULL,
                 source TEXT NOT NULL,
                 correlation_id TEXT NOT NULL,
                 creation_utc TEXT NOT NULL,
                 data TEXT NOT NULL,
                 PRIMARY KEY (session_id, offset)
             );
             CREATE INDEX IF NOT EXISTS idx_events_kind ON events(session_id, kind);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock();
        f(&conn)
    }
}

pub struct SqliteSessionStore {
    db: Database,
    append_locks: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
    notifiers: Mutex<HashMap<SessionId, Arc<Notify>>>,
}

impl SqliteSessionStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            append_locks: Mutex::new(HashMap::new()),
            notifiers: Mutex::new(HashMap::new()),
        }
    }

    fn append_lock(&self, session_id: &SessionId) -> Arc<Mutex<()>> {
        self.append_locks
            .lock()
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn notifier(&self, session_id: &SessionId) -> Arc<Notify> {
        self.notifiers
            .lock()
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

fn kind_to_sql(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Message => "message",
        EventKind::Tool => "tool",
        EventKind::Status => "status",
        EventKind::Custom => "custom",
    }
}

fn kind_from_sql(s: &str) -> EventKind {
    match s {
        "message" => EventKind::Message,
        "tool" => EventKind::Tool,
        "status" => EventKind::Status,
        _ => EventKind::Custom,
    }
}

fn source_to_sql(source: EventSource) -> &'static str {
    match source {
        EventSource::Customer => "customer",
        EventSource::AiAgent => "ai_agent",
        EventSource::HumanAgent => "human_agent",
        EventSource::System => "system",
    }
}

fn source_from_sql(s: &str) -> EventSource {
    match s {
        "customer" => EventSource::Customer,
        "ai_agent" => EventSource::AiAgent,
        "human_agent" => EventSource::HumanAgent,
        _ => EventSource::System,
    }
}

fn mode_to_sql(mode: SessionMode) -> &'static str {
    match mode {
        SessionMode::Auto => "auto",
        SessionMode::Manual => "manual",
    }
}

fn mode_from_sql(s: &str) -> SessionMode {
    match s {
        "manual" => SessionMode::Manual,
        _ => SessionMode::Auto,
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<Event, rusqlite::Error> {
    let kind: String = row.get(2)?;
    let source: String = row.get(3)?;
    let correlation: String = row.get(4)?;
    let creation: String = row.get(5)?;
    let data: String = row.get(6)?;
    Ok(Event {
        id: EventId::from_raw(row.get::<_, String>(1)?),
        offset: row.get::<_, i64>(0)? as u64,
        kind: kind_from_sql(&kind),
        source: source_from_sql(&source),
        correlation_id: CorrelationScope::from_raw(correlation),
        creation_utc: creation
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
    })
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, session: Session) -> Result<Session, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, agent_id, customer_id, creation_utc, mode, title, agent_states)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    session.id.as_str(),
                    session.agent_id.as_str(),
                    session.customer_id.as_str(),
                    session.creation_utc.to_rfc3339(),
                    mode_to_sql(session.mode),
                    session.title,
                    serde_json::to_string(&session.agent_states)?,
                ],
            )?;
            Ok(())
        })?;
        Ok(session)
    }

    async fn read_session(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, agent_id, customer_id, creation_utc, mode, title, agent_states
                 FROM sessions WHERE id = ?1",
                [id.as_str()],
                |row| {
                    let creation: String = row.get(3)?;
                    let mode: String = row.get(4)?;
                    let states: String = row.get(6)?;
                    Ok(Session {
                        id: SessionId::from_raw(row.get::<_, String>(0)?),
                        agent_id: AgentId::from_raw(row.get::<_, String>(1)?),
                        customer_id: CustomerId::from_raw(row.get::<_, String>(2)?),
                        creation_utc: creation
                            .parse::<DateTime<Utc>>()
                            .unwrap_or_else(|_| Utc::now()),
                        mode: mode_from_sql(&mode),
                        title: row.get(5)?,
                        agent_states: serde_json::from_str(&states).unwrap_or_default(),
                    })
                },
            )
            .map_err(|_| StoreError::NotFound(format!("session {id}")))
        })
    }

    async fn update_mode(&self, id: &SessionId, mode: SessionMode) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE sessions SET mode = ?1 WHERE id = ?2",
                rusqlite::params![mode_to_sql(mode), id.as_str()],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    async fn append_agent_state(
        &self,
        id: &SessionId,
        state: AgentState,
    ) -> Result<(), StoreError> {
        let lock = self.append_lock(id);
        let _guard = lock.lock();
        self.db.with_conn(|conn| {
            let states: String = conn
                .query_row(
                    "SELECT agent_states FROM sessions WHERE id = ?1",
                    [id.as_str()],
                    |row| row.get(0),
                )
                .map_err(|_| StoreError::NotFound(format!("session {id}")))?;
            let mut states: Vec<AgentState> = serde_json::from_str(&states).unwrap_or_default();
            states.push(state);
            conn.execute(
                "UPDATE sessions SET agent_states = ?1 WHERE id = ?2",
                rusqlite::params![serde_json::to_string(&states)?, id.as_str()],
            )?;
            Ok(())
        })
    }

    async fn create_event(
        &self,
        session_id: &SessionId,
        kind: EventKind,
        source: EventSource,
        correlation_id: CorrelationScope,
        data: serde_json::Value,
    ) -> Result<Event, StoreError> {
        let lock = self.append_lock(session_id);
        let event = {
            let _guard = lock.lock();
            self.db.with_conn(|conn| {
                // Verify the session exists before computing the next offset
                conn.query_row(
                    "SELECT 1 FROM sessions WHERE id = ?1",
                    [session_id.as_str()],
                    |_| Ok(()),
                )
                .map_err(|_| StoreError::NotFound(format!("session {session_id}")))?;

                let max: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(offset), -1) FROM events WHERE session_id = ?1",
                    [session_id.as_str()],
                    |row| row.get(0),
                )?;

                let event = Event {
                    id: EventId::new(),
                    offset: (max + 1) as u64,
                    kind,
                    source,
                    correlation_id: correlation_id.clone(),
                    creation_utc: Utc::now(),
                    data: data.clone(),
                };

                conn.execute(
                    "INSERT INTO events (session_id, offset, id, kind, source, correlation_id, creation_utc, data)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        session_id.as_str(),
                        event.offset as i64,
                        event.id.as_str(),
                        kind_to_sql(kind),
                        source_to_sql(source),
                        event.correlation_id.as_str(),
                        event.creation_utc.to_rfc3339(),
                        serde_json::to_string(&event.data)?,
                    ],
                )?;
                Ok(event)
            })?
        };

        self.notifier(session_id).notify_waiters();
        Ok(event)
    }

    async fn list_events(
        &self,
        session_id: &SessionId,
        filter: &EventFilter,
    ) -> Result<Vec<Event>, StoreError> {
        let events = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT offset, id, kind, source, correlation_id, creation_utc, data
                 FROM events WHERE session_id = ?1 AND offset >= ?2
                 ORDER BY offset ASC",
            )?;
            let min = filter.min_offset.unwrap_or(0) as i64;
            let rows = stmt
                .query_map(rusqlite::params![session_id.as_str(), min], row_to_event)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(events.into_iter().filter(|e| filter.matches(e)).collect())
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

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_core::events::{SessionStatus, StatusPayload};
    use colloquy_core::ids::GuidelineId;

    async fn setup() -> (SqliteSessionStore, Session) {
        let db = Database::in_memory().unwrap();
        let store = SqliteSessionStore::new(db);
        let session = Session::new(AgentId::new(), CustomerId::new());
        store.create_session(session.clone()).await.unwrap();
        (store, session)
    }

    #[tokio::test]
    async fn session_roundtrip() {
        let (store, session) = setup().await;
        let read = store.read_session(&session.id).await.unwrap();
        assert_eq!(read.id, session.id);
        assert_eq!(read.agent_id, session.agent_id);
        assert_eq!(read.mode, SessionMode::Auto);
    }

    #[tokio::test]
    async fn missing_session_not_found() {
        let (store, _) = setup().await;
        assert!(matches!(
            store.read_session(&SessionId::new()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn mode_update_persists() {
        let (store, session) = setup().await;
        store
            .update_mode(&session.id, SessionMode::Manual)
            .await
            .unwrap();
        let read = store.read_session(&session.id).await.unwrap();
        assert_eq!(read.mode, SessionMode::Manual);
    }

    #[tokio::test]
    async fn agent_states_accumulate() {
        let (store, session) = setup().await;
        let g = GuidelineId::new();
        store
            .append_agent_state(
                &session.id,
                AgentState {
                    applied_guideline_ids: vec![g.clone()],
                    ..AgentState::default()
                },
            )
            .await
            .unwrap();
        store
            .append_agent_state(&session.id, AgentState::default())
            .await
            .unwrap();

        let read = store.read_session(&session.id).await.unwrap();
        assert_eq!(read.agent_states.len(), 2);
        assert!(read.agent_states[0].is_applied(&g));
    }

    #[tokio::test]
    async fn event_roundtrip_preserves_fields() {
        let (store, session) = setup().await;
        let payload =
            serde_json::to_value(StatusPayload::bare(SessionStatus::Acknowledged)).unwrap();
        let written = store
            .create_event(
                &session.id,
                EventKind::Status,
                EventSource::AiAgent,
                CorrelationScope::from_raw("Rx::process"),
                payload.clone(),
            )
            .await
            .unwrap();

        let events = store
            .list_events(&session.id, &EventFilter::default())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        let read = &events[0];
        assert_eq!(read.id, written.id);
        assert_eq!(read.offset, 0);
        assert_eq!(read.kind, EventKind::Status);
        assert_eq!(read.source, EventSource::AiAgent);
        assert_eq!(read.correlation_id.as_str(), "Rx::process");
        assert_eq!(read.data, payload);
    }

    #[tokio::test]
    async fn offsets_monotonic_and_gap_free() {
        let (store, session) = setup().await;
        for _ in 0..10 {
            store
                .create_event(
                    &session.id,
                    EventKind::Custom,
                    EventSource::System,
                    CorrelationScope::from_raw("Rx"),
                    serde_json::Value::Null,
                )
                .await
                .unwrap();
        }
        let events = store
            .list_events(&session.id, &EventFilter::default())
            .await
            .unwrap();
        for (i, e) in events.iter().enumerate() {
            assert_eq!(e.offset, i as u64);
        }
    }

    #[tokio::test]
    async fn list_respects_filter() {
        let (store, session) = setup().await;
        for source in [EventSource::Customer, EventSource::AiAgent] {
            store
                .create_event(
                    &session.id,
                    EventKind::Message,
                    source,
                    CorrelationScope::from_raw("Rx"),
                    serde_json::Value::Null,
                )
                .await
                .unwrap();
        }

        let filter = EventFilter {
            min_offset: None,
            kinds: vec![EventKind::Message],
            sources: vec![EventSource::AiAgent],
        };
        let events = store.list_events(&session.id, &filter).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, EventSource::AiAgent);
    }

    #[tokio::test]
    async fn wait_for_events_wakes_on_append() {
        let (store, session) = setup().await;
        let store = Arc::new(store);

        let waiter = {
            let store = store.clone();
            let sid = session.id.clone();
            tokio::spawn(async move {
                store
                    .wait_for_events(
                        &sid,
                        &EventFilter::since(0),
                        Duration::from_secs(5),
                    )
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .create_event(
                &session.id,
                EventKind::Message,
                EventSource::AiAgent,
                CorrelationScope::from_raw("Rx"),
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        assert_eq!(waiter.await.unwrap().len(), 1);
    }
}
