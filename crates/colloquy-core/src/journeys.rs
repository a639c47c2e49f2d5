//! Journey graphs and their projection onto guidelines.
//!
//! A journey is a (possibly cyclic) graph of nodes and edges. For uniform
//! matching, each reachable (edge, node) pair is projected into a synthetic
//! "journey-node guideline" whose id is `journey_node:<node_id>[:<edge_id>]`.

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::guidelines::{Guideline, GuidelineMetadata, JourneyNodeRef};
use crate::ids::{GuidelineId, JourneyEdgeId, JourneyId, JourneyNodeId};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JourneyNode {
    pub id: JourneyNodeId,
    pub action: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JourneyEdge {
    pub id: JourneyEdgeId,
    pub source: JourneyNodeId,
    pub target: JourneyNodeId,
    /// Natural-language transition condition; `None` means unconditional.
    pub condition: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Journey {
    pub id: JourneyId,
    pub title: String,
    /// Natural-language description of when this journey applies.
    pub condition: String,
    pub root: JourneyNodeId,
    pub nodes: BTreeMap<JourneyNodeId, JourneyNode>,
    pub edges: Vec<JourneyEdge>,
}

impl Journey {
    pub fn node(&self, id: &JourneyNodeId) -> Option<&JourneyNode> {
        self.nodes.get(id)
    }

    fn edges_from(&self, node: &JourneyNodeId) -> impl Iterator<Item = &JourneyEdge> {
        let node = node.clone();
        self.edges.iter().filter(move |e| e.source == node)
    }

    /// Project reachable (edge, node) pairs into synthetic guidelines.
    ///
    /// BFS from the root; the visited set is keyed by `(edge_id, node_id)` so
    /// cyclic graphs terminate while still yielding one guideline per distinct
    /// way of arriving at a node. The root itself projects with no edge.
    pub fn project_node_guidelines(&self) -> Vec<Guideline> {
        let mut guidelines = Vec::new();
        let mut visited: HashSet<(Option<JourneyEdgeId>, JourneyNodeId)> = HashSet::new();
        let mut queue: VecDeque<(Option<&JourneyEdge>, &JourneyNodeId)> = VecDeque::new();

        queue.push_back((None, &self.root));

        while let Some((edge, node_id)) = queue.pop_front() {
            let key = (edge.map(|e| e.id.clone()), node_id.clone());
            if !visited.insert(key) {
                continue;
            }

            let Some(node) = self.nodes.get(node_id) else {
                continue;
            };

            guidelines.push(self.node_guideline(edge, node));

            for next in self.edges_from(node_id) {
                queue.push_back((Some(next), &next.target));
            }
        }

        guidelines
    }

    fn node_guideline(&self, edge: Option<&JourneyEdge>, node: &JourneyNode) -> Guideline {
        let condition = edge
            .and_then(|e| e.condition.clone())
            .unwrap_or_else(|| self.condition.clone());

        Guideline {
            id: GuidelineId::for_journey_node(&node.id, edge.map(|e| &e.id)),
            condition,
            action: (!node.action.is_empty()).then(|| node.action.clone()),
            enabled: true,
            tags: Vec::new(),
            metadata: GuidelineMetadata {
                journey_node: Some(JourneyNodeRef {
                    journey_id: self.id.clone(),
                    node_id: node.id.clone(),
                    edge_id: edge.map(|e| e.id.clone()),
                }),
                ..GuidelineMetadata::default()
            },
        }
    }
}
