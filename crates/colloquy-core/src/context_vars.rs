use serde::{Deserialize, Serialize};

use crate::ids::VariableId;

/// A named per-customer variable (e.g. plan tier) injected into prompts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextVariable {
    pub id: VariableId,
    pub name: String,
    pub description: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextVariableValue {
    pub data: serde_json::Value,
}

impl ContextVariable {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: VariableId::new(),
            name: name.into(),
            description: description.into(),
        }
    }
}
