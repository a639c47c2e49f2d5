use serde::{Deserialize, Serialize};

use crate::ids::CapabilityId;

/// Something the agent can do, surfaced to the LLM so replies stay within
/// what the deployment actually offers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Capability {
    pub id: CapabilityId,
    pub title: String,
    pub description: String,
}

impl Capability {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: CapabilityId::new(),
            title: title.into(),
            description: description.into(),
        }
    }
}
