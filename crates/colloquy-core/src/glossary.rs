use serde::{Deserialize, Serialize};

use crate::ids::TermId;

/// A domain term surfaced to the LLM when semantically relevant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Term {
    pub id: TermId,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
}

impl Term {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: TermId::new(),
            name: name.into(),
            description: description.into(),
            synonyms: Vec::new(),
        }
    }
}
