//! Session-log events and their typed payloads.
//!
//! Events are append-only; offsets are assigned by the session store and are
//! gap-free per session. The `data` field holds one of the typed payloads
//! below, serialized as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationScope;
use crate::ids::EventId;
use crate::tools::{ToolCall, ToolResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Tool,
    Status,
    Custom,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Customer,
    AiAgent,
    HumanAgent,
    System,
}

/// An element of a session's event log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub offset: u64,
    pub kind: EventKind,
    pub source: EventSource,
    pub correlation_id: CorrelationScope,
    pub creation_utc: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Event {
    /// Decode the payload of a status event, if this is one.
    pub fn status(&self) -> Option<StatusPayload> {
        if self.kind != EventKind::Status {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }

    /// Decode the payload of a message event, if this is one.
    pub fn message(&self) -> Option<MessagePayload> {
        if self.kind != EventKind::Message {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }
}

/// Session lifecycle statuses emitted by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Acknowledged,
    Processing,
    Typing,
    Ready,
    Cancelled,
    Error,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatusData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: SessionStatus,
    #[serde(default)]
    pub data: StatusData,
}

impl StatusPayload {
    pub fn bare(status: SessionStatus) -> Self {
        Self {
            status,
            data: StatusData::default(),
        }
    }

    pub fn processing(stage: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Processing,
            data: StatusData {
                stage: Some(stage.into()),
                exception: None,
            },
        }
    }

    pub fn error(exception: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Error,
            data: StatusData {
                stage: None,
                exception: Some(exception.into()),
            },
        }
    }
}

/// The replying party as rendered to the customer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message: String,
    pub participant: Participant,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub canned_responses: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRecord {
    #[serde(flatten)]
    pub call: ToolCall,
    pub result: ToolResult,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolEventPayload {
    pub tool_calls: Vec<ToolCallRecord>,
}
