use serde::{Deserialize, Serialize};

use crate::ids::AgentId;

/// How the agent's final reply text is produced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionMode {
    /// Pure LLM free text.
    #[default]
    Fluid,
    /// Only verbatim rendered templates may be emitted.
    CannedStrict,
    /// Draft rewritten in the style of the best-matching template.
    CannedComposited,
    /// Best-matching template if the match is high quality, else the draft.
    CannedFluid,
}

impl CompositionMode {
    pub fn uses_canned_responses(&self) -> bool {
        !matches!(self, Self::Fluid)
    }
}

/// Identity of the replying party. Immutable within a processing cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub description: String,
    pub composition_mode: CompositionMode,
    pub max_engine_iterations: usize,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Agent {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: AgentId::new(),
            name: name.into(),
            description: description.into(),
            composition_mode: CompositionMode::Fluid,
            max_engine_iterations: 3,
            tags: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composition_mode_classification() {
        assert!(!CompositionMode::Fluid.uses_canned_responses());
        assert!(CompositionMode::CannedStrict.uses_canned_responses());
        assert!(CompositionMode::CannedComposited.uses_canned_responses());
        assert!(CompositionMode::CannedFluid.uses_canned_responses());
    }

    #[test]
    fn agent_defaults() {
        let agent = Agent::new("Quinn", "Support agent");
        assert_eq!(agent.composition_mode, CompositionMode::Fluid);
        assert_eq!(agent.max_engine_iterations, 3);
    }

    #[test]
    fn composition_mode_serde() {
        let json = serde_json::to_string(&CompositionMode::CannedStrict).unwrap();
        assert_eq!(json, "\"canned_strict\"");
    }
}
