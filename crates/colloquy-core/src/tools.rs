//! Tool definitions, calls, and results.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Composite tool identity: `(service_name, tool_name)`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ToolId {
    pub service_name: String,
    pub tool_name: String,
}

impl ToolId {
    pub fn new(service: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            service_name: service.into(),
            tool_name: tool.into(),
        }
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service_name, self.tool_name)
    }
}

/// A single declared parameter of a tool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    pub description: String,
}

/// Tool definition as the engine sees it: identity plus parameter schemas.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tool {
    pub id: ToolId,
    pub description: String,
    #[serde(default)]
    pub required: Vec<ToolParameter>,
    #[serde(default)]
    pub optional: Vec<ToolParameter>,
}

impl Tool {
    pub fn is_required(&self, parameter: &str) -> bool {
        self.required.iter().any(|p| p.name == parameter)
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.required
            .iter()
            .chain(self.optional.iter())
            .map(|p| p.name.as_str())
    }
}

/// A resolved invocation: tool plus extracted arguments.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_id: ToolId,
    pub arguments: BTreeMap<String, serde_json::Value>,
}

/// Outcome of running a tool. `canned_response_fields` feeds template
/// substitution in the canned composer; `canned_responses` are textual
/// fallbacks a tool may supply directly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    pub data: serde_json::Value,
    #[serde(default)]
    pub canned_response_fields: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub canned_responses: Vec<String>,
}

impl ToolResult {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            data,
            canned_response_fields: BTreeMap::new(),
            canned_responses: Vec::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            data: serde_json::json!({ "error": error.into() }),
            canned_response_fields: BTreeMap::new(),
            canned_responses: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
}
