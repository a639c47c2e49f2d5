//! Behavioral rules and the matcher's decisions about them.

use serde::{Deserialize, Serialize};

use crate::ids::{GuidelineId, JourneyEdgeId, JourneyId, JourneyNodeId};

/// Marks a guideline as projected from a journey (edge, node) pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyNodeRef {
    pub journey_id: JourneyId,
    pub node_id: JourneyNodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<JourneyEdgeId>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GuidelineMetadata {
    /// Re-evaluated each turn regardless of prior application.
    #[serde(default)]
    pub continuous: bool,
    /// The action's outcome depends on what the customer says, so a prior
    /// application does not retire the guideline.
    #[serde(default)]
    pub customer_dependent_action_data: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journey_node: Option<JourneyNodeRef>,
    /// Guidelines this one disambiguates between (it is a disambiguation
    /// head when non-empty).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disambiguation_targets: Vec<GuidelineId>,
}

/// A condition/action behavioral rule. Observational when the action is
/// empty, actionable otherwise.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Guideline {
    pub id: GuidelineId,
    pub condition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: GuidelineMetadata,
}

fn default_enabled() -> bool {
    true
}

impl Guideline {
    pub fn new(condition: impl Into<String>, action: impl Into<String>) -> Self {
        let action: String = action.into();
        Self {
            id: GuidelineId::new(),
            condition: condition.into(),
            action: (!action.is_empty()).then_some(action),
            enabled: true,
            tags: Vec::new(),
            metadata: GuidelineMetadata::default(),
        }
    }

    pub fn observational(condition: impl Into<String>) -> Self {
        Self::new(condition, "")
    }

    pub fn is_observational(&self) -> bool {
        self.action.as_deref().map_or(true, str::is_empty)
    }

    pub fn is_actionable(&self) -> bool {
        !self.is_observational()
    }

    pub fn is_disambiguation_head(&self) -> bool {
        !self.metadata.disambiguation_targets.is_empty()
    }

    pub fn journey_id(&self) -> Option<&JourneyId> {
        self.metadata.journey_node.as_ref().map(|n| &n.journey_id)
    }
}

/// The matcher's positive decision that a guideline applies this turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GuidelineMatch {
    pub guideline: Guideline,
    /// Confidence in 0..1.
    pub score: f64,
    pub rationale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observational_vs_actionable() {
        let obs = Guideline::observational("the customer sounds frustrated");
        assert!(obs.is_observational());
        assert!(!obs.is_actionable());

        let act = Guideline::new("the customer greets you", "greet them back");
        assert!(act.is_actionable());
    }

    #[test]
    fn empty_action_string_is_observational() {
        let g = Guideline::new("condition", "");
        assert!(g.action.is_none());
        assert!(g.is_observational());
    }

    #[test]
    fn disambiguation_head_detection() {
        let mut g = Guideline::observational("ambiguous request");
        assert!(!g.is_disambiguation_head());
        g.metadata.disambiguation_targets = vec![GuidelineId::new()];
        assert!(g.is_disambiguation_head());
    }

    #[test]
    fn journey_id_accessor() {
        let mut g = Guideline::new("at step", "do step");
        assert!(g.journey_id().is_none());
        let journey = JourneyId::new();
        g.metadata.journey_node = Some(JourneyNodeRef {
            journey_id: journey.clone(),
            node_id: JourneyNodeId::new(),
            edge_id: None,
        });
        assert_eq!(g.journey_id(), Some(&journey));
    }
}
