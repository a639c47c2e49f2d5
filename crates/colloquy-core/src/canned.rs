//! Pre-authored reply templates with variable fields and retrieval signals.

use serde::{Deserialize, Serialize};

use crate::ids::CannedResponseId;

/// Tag marking a template as usable for preamble replies.
pub const PREAMBLE_TAG: &str = "preamble";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CannedResponse {
    pub id: CannedResponseId,
    /// Jinja-style template, e.g. `"We have {{count}} {{product}} in stock."`.
    pub template: String,
    /// Declared substitution fields.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Paraphrases used for semantic retrieval.
    #[serde(default)]
    pub signals: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CannedResponse {
    pub fn new(template: impl Into<String>) -> Self {
        let template: String = template.into();
        let fields = template_fields(&template);
        Self {
            id: CannedResponseId::new(),
            template,
            fields,
            signals: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn is_preamble(&self) -> bool {
        self.tags.iter().any(|t| t == PREAMBLE_TAG)
    }
}

/// Extract `{{ field }}` variable names from a template, in order of first
/// appearance.
pub fn template_fields(template: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(end) = rest[start + 2..].find("}}") else {
            break;
        };
        let name = rest[start + 2..start + 2 + end].trim();
        // Only the root variable matters for resolution ("std.customer.name" → "std")
        let root = name.split('.').next().unwrap_or(name).to_string();
        if !root.is_empty() && !fields.contains(&root) {
            fields.push(root);
        }
        rest = &rest[start + 2 + end + 2..];
    }
    fields
}
