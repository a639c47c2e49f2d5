//! Sectioned prompt assembly.
//!
//! Every LLM call builds its prompt from titled sections in a fixed order.
//! The builder renders interaction history, matched guidelines, tool
//! results, and the rest of the working set into plain text the generator
//! consumes alongside a JSON output schema.

use colloquy_core::agents::Agent;
use colloquy_core::capabilities::Capability;
use colloquy_core::context_vars::{ContextVariable, ContextVariableValue};
use colloquy_core::customers::Customer;
use colloquy_core::events::{Event, EventSource};
use colloquy_core::glossary::Term;
use colloquy_core::guidelines::GuidelineMatch;

use crate::context::ToolInsights;

#[derive(Default)]
pub struct PromptBuilder {
    sections: Vec<(String, String)>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(mut self, title: &str, body: impl Into<String>) -> Self {
        let body: String = body.into();
        if !body.trim().is_empty() {
            self.sections.push((title.to_string(), body));
        }
        self
    }

    pub fn agent_identity(self, agent: &Agent, customer: &Customer) -> Self {
        self.section(
            "Identity",
            format!(
                "You are {}, {}. You are conversing with {}.",
                agent.name, agent.description, customer.name
            ),
        )
    }

    /// Most recent `window` interaction events rendered as a transcript
    /// (0 means no limit).
    pub fn interaction_history(self, history: &[Event], window: usize) -> Self {
        let start = if window > 0 && history.len() > window {
            history.len() - window
        } else {
            0
        };
        let transcript: Vec<String> = history[start..]
            .iter()
            .filter_map(render_event)
            .collect();
        if transcript.is_empty() {
            return self.section("Interaction", "The conversation has just started.");
        }
        self.section("Interaction", transcript.join("\n"))
    }

    pub fn context_variables(
        self,
        variables: &[(ContextVariable, ContextVariableValue)],
    ) -> Self {
        let body: Vec<String> = variables
            .iter()
            .map(|(var, value)| format!("- {} ({}): {}", var.name, var.description, value.data))
            .collect();
        self.section("Known context", body.join("\n"))
    }

    pub fn glossary(self, terms: &[Term]) -> Self {
        let body: Vec<String> = terms
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect();
        self.section("Glossary", body.join("\n"))
    }

    pub fn capabilities(self, capabilities: &[Capability]) -> Self {
        let body: Vec<String> = capabilities
            .iter()
            .map(|c| format!("- {}: {}", c.title, c.description))
            .collect();
        self.section("Capabilities", body.join("\n"))
    }

    /// Matched guidelines numbered from 1, conditions plus rendered actions.
    pub fn guideline_matches(self, title: &str, matches: &[GuidelineMatch]) -> Self {
        let body: Vec<String> = matches
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let action = m
                    .guideline
                    .action
                    .as_deref()
                    .unwrap_or("(observation only)");
                format!("{}. When {}: {}", i + 1, m.guideline.condition, action)
            })
            .collect();
        self.section(title, body.join("\n"))
    }

    pub fn tool_results(self, tool_events: &[Event]) -> Self {
        let body: Vec<String> = tool_events
            .iter()
            .filter_map(|e| {
                serde_json::from_value::<colloquy_core::events::ToolEventPayload>(e.data.clone())
                    .ok()
            })
            .flat_map(|payload| payload.tool_calls)
            .map(|record| {
                format!(
                    "- {} with {} returned: {}",
                    record.call.tool_id,
                    serde_json::to_string(&record.call.arguments).unwrap_or_default(),
                    record.result.data
                )
            })
            .collect();
        self.section("Tool results", body.join("\n"))
    }

    pub fn tool_insights(self, insights: &ToolInsights) -> Self {
        let mut body = Vec::new();
        for p in &insights.missing_data {
            body.push(format!(
                "- You still need \"{}\" before {} can run. Ask the customer for it.",
                p.parameter, p.tool_id.tool_name
            ));
        }
        for p in &insights.invalid_data {
            body.push(format!(
                "- The value given for \"{}\" was not usable by {}. Ask the customer to clarify.",
                p.parameter, p.tool_id.tool_name
            ));
        }
        self.section("Missing information", body.join("\n"))
    }

    pub fn output_schema(self, description: &str, example: &serde_json::Value) -> Self {
        self.section(
            "Output",
            format!(
                "{description}\nRespond with a single JSON object shaped like:\n{}",
                serde_json::to_string_pretty(example).unwrap_or_default()
            ),
        )
    }

    pub fn build(self) -> String {
        self.sections
            .into_iter()
            .map(|(title, body)| format!("## {title}\n{body}"))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn render_event(event: &Event) -> Option<String> {
    let message = event.message()?;
    let speaker = match event.source {
        EventSource::Customer => "Customer",
        EventSource::AiAgent | EventSource::HumanAgent => "Agent",
        EventSource::System => "System",
    };
    Some(format!("{speaker}: {}", message.message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use colloquy_core::correlation::CorrelationScope;
    use colloquy_core::events::{EventKind, MessagePayload, Participant};
    use colloquy_core::guidelines::Guideline;
    use colloquy_core::ids::EventId;

    fn msg(source: EventSource, text: &str) -> Event {
        Event {
            id: EventId::new(),
            offset: 0,
            kind: EventKind::Message,
            source,
            correlation_id: CorrelationScope::from_raw("Rx"),
            creation_utc: Utc::now(),
            data: serde_json::to_value(MessagePayload {
                message: text.into(),
                participant: Participant {
                    id: "p".into(),
                    display_name: "P".into(),
                },
                draft: None,
                canned_responses: Vec::new(),
                tags: Vec::new(),
            })
            .unwrap(),
        }
    }

    #[test]
    fn sections_render_in_order() {
        let prompt = PromptBuilder::new()
            .section("First", "alpha")
            .section("Second", "beta")
            .build();
        let first = prompt.find("## First").unwrap();
        let second = prompt.find("## Second").unwrap();
        assert!(first < second);
    }

    #[test]
    fn empty_sections_omitted() {
        let prompt = PromptBuilder::new()
            .section("Kept", "body")
            .section("Dropped", "")
            .glossary(&[])
            .build();
        assert!(prompt.contains("## Kept"));
        assert!(!prompt.contains("Dropped"));
        assert!(!prompt.contains("Glossary"));
    }

    #[test]
    fn history_window_keeps_most_recent() {
        let history: Vec<Event> = (0..5)
            .map(|i| msg(EventSource::Customer, &format!("message {i}")))
            .collect();
        let prompt = PromptBuilder::new().interaction_history(&history, 2).build();
        assert!(!prompt.contains("message 2"));
        assert!(prompt.contains("message 3"));
        assert!(prompt.contains("message 4"));
    }

    #[test]
    fn empty_history_notes_fresh_conversation() {
        let prompt = PromptBuilder::new().interaction_history(&[], 10).build();
        assert!(prompt.contains("just started"));
    }

    #[test]
    fn guidelines_numbered_from_one() {
        let matches = vec![
            GuidelineMatch {
                guideline: Guideline::new("the customer greets you", "greet them back"),
                score: 0.9,
                rationale: "greeting".into(),
                metadata: None,
            },
            GuidelineMatch {
                guideline: Guideline::observational("the customer is terse"),
                score: 0.7,
                rationale: "style".into(),
                metadata: None,
            },
        ];
        let prompt = PromptBuilder::new()
            .guideline_matches("Guidelines", &matches)
            .build();
        assert!(prompt.contains("1. When the customer greets you: greet them back"));
        assert!(prompt.contains("2. When the customer is terse: (observation only)"));
    }
}
