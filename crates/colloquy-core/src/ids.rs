use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(SessionId, "sess");
branded_id!(AgentId, "agent");
branded_id!(CustomerId, "cust");
branded_id!(EventId, "evt");
branded_id!(GuidelineId, "guide");
branded_id!(JourneyId, "journey");
branded_id!(JourneyNodeId, "jnode");
branded_id!(JourneyEdgeId, "jedge");
branded_id!(TermId, "term");
branded_id!(VariableId, "var");
branded_id!(CapabilityId, "cap");
branded_id!(CannedResponseId, "creps");

impl GuidelineId {
    /// Synthetic id for a guideline projected from a journey (edge, node) pair.
    pub fn for_journey_node(node: &JourneyNodeId, edge: Option<&JourneyEdgeId>) -> Self {
        match edge {
            Some(edge) => Self(format!("journey_node:{node}:{edge}")),
            None => Self(format!("journey_node:{node}")),
        }
    }

    pub fn is_journey_node(&self) -> bool {
        self.0.starts_with("journey_node:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_prefixes() {
        assert!(SessionId::new().as_str().starts_with("sess_"));
        assert!(GuidelineId::new().as_str().starts_with("guide_"));
        assert!(JourneyId::new().as_str().starts_with("journey_"));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn serde_roundtrip() {
        let id = GuidelineId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: GuidelineId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn journey_node_guideline_id_formats() {
        let node = JourneyNodeId::from_raw("jnode_1");
        let edge = JourneyEdgeId::from_raw("jedge_9");
        assert_eq!(
            GuidelineId::for_journey_node(&node, Some(&edge)).as_str(),
            "journey_node:jnode_1:jedge_9"
        );
        assert_eq!(
            GuidelineId::for_journey_node(&node, None).as_str(),
            "journey_node:jnode_1"
        );
        assert!(GuidelineId::for_journey_node(&node, None).is_journey_node());
        assert!(!GuidelineId::new().is_journey_node());
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<EventId> = (0..50).map(|_| EventId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0].as_str() < w[1].as_str());
        }
    }
}
