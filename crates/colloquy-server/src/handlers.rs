//! Request handlers.
//!
//! `chat_async` appends the customer message, dispatches a processing task
//! for the session (cancelling any in-flight cycle), and long-waits for the
//! agent's reply up to the request timeout. Events are fetched separately
//! with optional long-polling.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{info, warn};

use colloquy_core::canned::PREAMBLE_TAG;
use colloquy_core::correlation::{Context, CorrelationScope};
use colloquy_core::events::{
    Event, EventKind, EventSource, MessagePayload, Participant,
};
use colloquy_core::ids::{AgentId, CustomerId, SessionId};
use colloquy_core::sessions::Session;
use colloquy_engine::emission::Publisher;
use colloquy_store::EventFilter;

use crate::server::AppState;

const DEFAULT_TIMEOUT_SECS: u64 = 57;

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Deserialize)]
pub struct ChatAsyncRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub tenant_id: String,
    pub chatbot_id: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub session_title: Option<String>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
    #[serde(default)]
    pub is_preview: bool,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub preview_action_book_ids: Vec<String>,
    #[serde(default)]
    pub autofill_params: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct ChatAsyncResponse {
    pub session_id: SessionId,
    pub correlation_id: CorrelationScope,
    pub message: String,
    pub total_tokens: u64,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unprocessable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: message.into(),
        }
    }

    fn timeout() -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            message: "the agent did not reply in time".into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn chat_async(
    State(state): State<AppState>,
    Json(request): Json<ChatAsyncRequest>,
) -> Result<Json<ChatAsyncResponse>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::unprocessable("message must not be empty"));
    }
    if request.tenant_id.trim().is_empty() || request.chatbot_id.trim().is_empty() {
        return Err(ApiError::unprocessable("tenant_id and chatbot_id are required"));
    }

    let agent_id = AgentId::from_raw(request.chatbot_id.clone());
    state
        .agents
        .read_agent(&agent_id)
        .await
        .map_err(|_| ApiError::unprocessable(format!("unknown chatbot {}", request.chatbot_id)))?;

    let customer_id = request
        .customer_id
        .clone()
        .map(CustomerId::from_raw)
        .unwrap_or_else(|| state.guest_customer_id.clone());
    let customer = state
        .customers
        .read_customer(&customer_id)
        .await
        .map_err(|_| ApiError::unprocessable("unknown customer"))?;

    // Resolve or create the session
    let session = match &request.session_id {
        Some(id) => state
            .sessions
            .read_session(&SessionId::from_raw(id.clone()))
            .await
            .map_err(|_| ApiError::unprocessable(format!("unknown session {id}")))?,
        None => {
            let mut session = Session::new(agent_id.clone(), customer_id.clone());
            session.title = request.session_title.clone();
            state
                .sessions
                .create_session(session)
                .await
                .map_err(|e| ApiError::internal(e.to_string()))?
        }
    };

    // Append the customer message under a fresh root scope
    let root = CorrelationScope::root();
    let customer_event = state
        .sessions
        .create_event(
            &session.id,
            EventKind::Message,
            EventSource::Customer,
            root.clone(),
            serde_json::to_value(MessagePayload {
                message: request.message.clone(),
                participant: Participant {
                    id: customer.id.to_string(),
                    display_name: customer.name.clone(),
                },
                draft: None,
                canned_responses: Vec::new(),
                tags: Vec::new(),
            })
            .map_err(|e| ApiError::internal(e.to_string()))?,
        )
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    info!(
        session_id = %session.id,
        correlation = %root,
        "dispatching processing for customer message"
    );

    // Dispatch the processing cycle, superseding any in-flight one
    let processor = state.processor.clone();
    let sessions = state.sessions.clone();
    let session_id = session.id.clone();
    let dispatch_agent_id = agent_id.clone();
    let dispatch_root = root.clone();
    state.tasks.dispatch(&session.id, move |cancel| async move {
        let ctx = Context::new(dispatch_root, cancel).scoped("process");
        let publisher = Publisher::new(sessions, session_id.clone());
        match processor
            .process(&ctx, &session_id, &dispatch_agent_id, &publisher)
            .await
        {
            Ok(completed) => {
                info!(session_id = %session_id, completed, "processing cycle finished")
            }
            Err(e) => warn!(session_id = %session_id, error = %e, "processing cycle failed"),
        }
    });

    // Long-wait for the reply
    let deadline = Instant::now() + Duration::from_secs(request.timeout.max(1));
    let mut filter = EventFilter {
        min_offset: Some(customer_event.offset + 1),
        kinds: vec![EventKind::Message],
        sources: vec![EventSource::AiAgent],
    };

    let reply = loop {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return Err(ApiError::timeout());
        };
        let events = state
            .sessions
            .wait_for_events(&session.id, &filter, remaining)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?;

        // Preamble messages mask latency; the caller wants the real reply
        let real_reply = events.iter().find_map(|e| {
            e.message()
                .filter(|m| !m.tags.iter().any(|t| t == PREAMBLE_TAG))
        });
        if let Some(message) = real_reply {
            break message;
        }
        if events.is_empty() {
            return Err(ApiError::timeout());
        }
        // Only preambles so far: move the window past them and keep waiting
        filter.min_offset = events.iter().map(|e| e.offset + 1).max();
    };

    // Post-processing persists the inspection slightly after the reply;
    // give it a short grace period for token accounting.
    let mut total_tokens = 0;
    for _ in 0..20 {
        if let Ok(Some(inspection)) = state.inspections.last_inspection(&session.id).await {
            if inspection.correlation_id.descends_from(&root) {
                total_tokens = inspection.total_input_tokens + inspection.total_output_tokens;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    Ok(Json(ChatAsyncResponse {
        session_id: session.id,
        correlation_id: root,
        message: reply.message,
        total_tokens,
    }))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub min_offset: Option<u64>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub kinds: Option<String>,
    /// Long-poll up to this many seconds for matching events.
    #[serde(default)]
    pub wait_for_data: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub session_id: SessionId,
    pub events: Vec<Event>,
}

pub async fn list_session_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, ApiError> {
    let session_id = SessionId::from_raw(session_id);
    state
        .sessions
        .read_session(&session_id)
        .await
        .map_err(|_| ApiError::unprocessable(format!("unknown session {session_id}")))?;

    let filter = EventFilter {
        min_offset: query.min_offset,
        kinds: query
            .kinds
            .as_deref()
            .map(parse_kinds)
            .transpose()?
            .unwrap_or_default(),
        sources: query
            .source
            .as_deref()
            .map(parse_source)
            .transpose()?
            .map(|s| vec![s])
            .unwrap_or_default(),
    };

    let events = match query.wait_for_data {
        Some(secs) if secs > 0 => state
            .sessions
            .wait_for_events(&session_id, &filter, Duration::from_secs(secs))
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?,
        _ => state
            .sessions
            .list_events(&session_id, &filter)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?,
    };

    Ok(Json(EventsResponse { session_id, events }))
}

fn parse_kinds(csv: &str) -> Result<Vec<EventKind>, ApiError> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s {
            "message" => Ok(EventKind::Message),
            "tool" => Ok(EventKind::Tool),
            "status" => Ok(EventKind::Status),
            "custom" => Ok(EventKind::Custom),
            other => Err(ApiError::unprocessable(format!("unknown event kind {other}"))),
        })
        .collect()
}

fn parse_source(s: &str) -> Result<EventSource, ApiError> {
    match s {
        "customer" => Ok(EventSource::Customer),
        "ai_agent" => Ok(EventSource::AiAgent),
        "human_agent" => Ok(EventSource::HumanAgent),
        "system" => Ok(EventSource::System),
        other => Err(ApiError::unprocessable(format!("unknown source {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_csv_parsing() {
        assert_eq!(
            parse_kinds("message, status").unwrap(),
            vec![EventKind::Message, EventKind::Status]
        );
        assert!(parse_kinds("bogus").is_err());
        assert!(parse_kinds("").unwrap().is_empty());
    }

    #[test]
    fn source_parsing() {
        assert_eq!(parse_source("ai_agent").unwrap(), EventSource::AiAgent);
        assert!(parse_source("alien").is_err());
    }
}
