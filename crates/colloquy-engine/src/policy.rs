//! Engine tuning policies.
//!
//! `OptimizationPolicy` centralizes batch sizing, retry-temperature ladders
//! per call family, and interaction-history windows. The perceived-
//! performance policy decides when a preamble reply is warranted and how the
//! preamble's masking delays are drawn.

use std::ops::Range;
use std::time::Duration;

use colloquy_core::events::{Event, EventSource, SessionStatus};

pub trait OptimizationPolicy: Send + Sync {
    /// Guidelines per matching batch, scaled to the total under evaluation.
    fn matching_batch_size(&self, guideline_count: usize) -> usize;

    /// One attempt per temperature.
    fn matching_retry_temperatures(&self) -> Vec<f64>;
    fn response_analysis_retry_temperatures(&self) -> Vec<f64>;
    fn tool_calling_retry_temperatures(&self) -> Vec<f64>;
    fn message_retry_temperatures(&self) -> Vec<f64>;
    fn canned_selection_retry_temperatures(&self) -> Vec<f64>;

    fn max_tool_execution_attempts(&self) -> usize;

    /// Interaction events included per call family; tool calling needs only
    /// recent turns, message generation needs more.
    fn max_history_for_tool_calls(&self) -> usize;
    fn max_history_for_matching(&self) -> usize;
    fn max_history_for_message_generation(&self) -> usize;
}

#[derive(Clone, Debug, Default)]
pub struct BasicOptimizationPolicy;

impl OptimizationPolicy for BasicOptimizationPolicy {
    fn matching_batch_size(&self, guideline_count: usize) -> usize {
        match guideline_count {
            0..=10 => 1,
            11..=20 => 2,
            21..=30 => 3,
            _ => 5,
        }
    }

    fn matching_retry_temperatures(&self) -> Vec<f64> {
        vec![0.15, 0.3, 0.1]
    }

    fn response_analysis_retry_temperatures(&self) -> Vec<f64> {
        vec![0.15, 0.3, 0.1]
    }

    fn tool_calling_retry_temperatures(&self) -> Vec<f64> {
        vec![0.15, 0.3, 0.1]
    }

    fn message_retry_temperatures(&self) -> Vec<f64> {
        vec![0.1, 0.3, 0.5]
    }

    fn canned_selection_retry_temperatures(&self) -> Vec<f64> {
        vec![0.1, 0.05, 0.2]
    }

    fn max_tool_execution_attempts(&self) -> usize {
        3
    }

    fn max_history_for_tool_calls(&self) -> usize {
        10
    }

    fn max_history_for_matching(&self) -> usize {
        10
    }

    fn max_history_for_message_generation(&self) -> usize {
        30
    }
}

/// Timing knobs for the preamble generator. Tests zero these out.
#[derive(Clone, Debug)]
pub struct PreambleTiming {
    /// Drawn uniformly before generating the preamble.
    pub initial_delay: Range<f64>,
    /// Drawn uniformly between the preamble and the first `processing`.
    pub follow_up_delay: Range<f64>,
}

impl Default for PreambleTiming {
    fn default() -> Self {
        Self {
            initial_delay: 1.5..2.0,
            follow_up_delay: 0.5..1.5,
        }
    }
}

impl PreambleTiming {
    pub fn immediate() -> Self {
        Self {
            initial_delay: 0.0..0.0,
            follow_up_delay: 0.0..0.0,
        }
    }

    pub fn draw_initial(&self) -> Duration {
        draw(&self.initial_delay)
    }

    pub fn draw_follow_up(&self) -> Duration {
        draw(&self.follow_up_delay)
    }
}

fn draw(range: &Range<f64>) -> Duration {
    if range.end <= range.start {
        return Duration::from_secs_f64(range.start.max(0.0));
    }
    let secs = rand::Rng::gen_range(&mut rand::thread_rng(), range.clone());
    Duration::from_secs_f64(secs)
}

/// Whether a preamble is warranted for this cycle.
///
/// Required iff the last agent message was not itself a preamble AND either
/// there have been at most two prior wait-cycles, or the last two waits were
/// each at least five seconds (a customer used to slow replies still benefits
/// from the mask).
pub fn preamble_required(previous_wait_times: &[f64], last_message_was_preamble: bool) -> bool {
    if last_message_was_preamble {
        return false;
    }
    if previous_wait_times.len() <= 2 {
        return true;
    }
    previous_wait_times
        .iter()
        .rev()
        .take(2)
        .all(|&wait| wait >= 5.0)
}

/// Seconds the customer waited for each agent reply, derived from the gap
/// between a customer message and the first subsequent agent `ready` or
/// message event.
pub fn agent_wait_times(history: &[Event]) -> Vec<f64> {
    let mut waits = Vec::new();
    let mut pending: Option<chrono::DateTime<chrono::Utc>> = None;

    for event in history {
        match event.source {
            EventSource::Customer => {
                pending = Some(event.creation_utc);
            }
            EventSource::AiAgent => {
                let ends_wait = event.message().is_some()
                    || event
                        .status()
                        .map(|s| s.status == SessionStatus::Ready)
                        .unwrap_or(false);
                if ends_wait {
                    if let Some(start) = pending.take() {
                        let wait = (event.creation_utc - start)
                            .num_milliseconds()
                            .max(0) as f64
                            / 1000.0;
                        waits.push(wait);
                    }
                }
            }
            _ => {}
        }
    }

    waits
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use colloquy_core::correlation::CorrelationScope;
    use colloquy_core::events::{EventKind, MessagePayload, Participant};
    use colloquy_core::ids::EventId;

    #[test]
    fn batch_size_scales_with_guideline_count() {
        let policy = BasicOptimizationPolicy;
        assert_eq!(policy.matching_batch_size(5), 1);
        assert_eq!(policy.matching_batch_size(10), 1);
        assert_eq!(policy.matching_batch_size(11), 2);
        assert_eq!(policy.matching_batch_size(20), 2);
        assert_eq!(policy.matching_batch_size(30), 3);
        assert_eq!(policy.matching_batch_size(31), 5);
        assert_eq!(policy.matching_batch_size(200), 5);
    }

    #[test]
    fn temperature_ladders() {
        let policy = BasicOptimizationPolicy;
        assert_eq!(policy.message_retry_temperatures(), vec![0.1, 0.3, 0.5]);
        assert_eq!(policy.matching_retry_temperatures().len(), 3);
        assert_eq!(policy.canned_selection_retry_temperatures(), vec![0.1, 0.05, 0.2]);
    }

    #[test]
    fn preamble_required_with_no_prior_waits() {
        assert!(preamble_required(&[], false));
    }

    #[test]
    fn preamble_not_required_after_three_fast_cycles() {
        assert!(!preamble_required(&[1.0, 1.0, 1.0], false));
    }

    #[test]
    fn preamble_required_when_recent_waits_slow() {
        assert!(preamble_required(&[1.0, 6.0, 7.5], false));
        assert!(!preamble_required(&[6.0, 7.5, 1.0], false));
    }

    #[test]
    fn preamble_suppressed_after_preamble() {
        assert!(!preamble_required(&[], true));
    }

    #[test]
    fn immediate_timing_draws_zero() {
        let timing = PreambleTiming::immediate();
        assert_eq!(timing.draw_initial(), Duration::ZERO);
        assert_eq!(timing.draw_follow_up(), Duration::ZERO);
    }

    #[test]
    fn default_timing_within_ranges() {
        let timing = PreambleTiming::default();
        for _ in 0..20 {
            let d = timing.draw_initial().as_secs_f64();
            assert!((1.5..2.0).contains(&d), "initial delay out of range: {d}");
            let f = timing.draw_follow_up().as_secs_f64();
            assert!((0.5..1.5).contains(&f), "follow-up delay out of range: {f}");
        }
    }

    fn message_event(source: EventSource, at: chrono::DateTime<Utc>) -> Event {
        Event {
            id: EventId::new(),
            offset: 0,
            kind: EventKind::Message,
            source,
            correlation_id: CorrelationScope::from_raw("Rx"),
            creation_utc: at,
            data: serde_json::to_value(MessagePayload {
                message: "hi".into(),
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
    fn wait_times_from_history() {
        let t0 = Utc::now();
        let history = vec![
            message_event(EventSource::Customer, t0),
            message_event(EventSource::AiAgent, t0 + ChronoDuration::seconds(3)),
            message_event(EventSource::Customer, t0 + ChronoDuration::seconds(10)),
            message_event(EventSource::AiAgent, t0 + ChronoDuration::seconds(17)),
        ];
        let waits = agent_wait_times(&history);
        assert_eq!(waits.len(), 2);
        assert!((waits[0] - 3.0).abs() < 0.01);
        assert!((waits[1] - 7.0).abs() < 0.01);
    }

    #[test]
    fn unanswered_customer_message_has_no_wait() {
        let t0 = Utc::now();
        let history = vec![message_event(EventSource::Customer, t0)];
        assert!(agent_wait_times(&history).is_empty());
    }
}
