//! Dialog engine
//!
//! Everything that decides what the agent says next: intent
//! classification, the stage transition function, reply-method selection
//! and validation, the hot-reloadable script table, hallucination
//! filtering, and silence handling. [`DialogSession`] is the per-call
//! aggregate these pieces operate over; it is owned exclusively by the
//! call's [`crate::orchestrator::CallOrchestrator`] task for the call's
//! lifetime (§3 Ownership).

pub mod classifier;
pub mod hallucination_guard;
pub mod response_selector;
pub mod script_table;
pub mod silence_policy;
pub mod state_machine;

use std::collections::HashMap;

use crate::types::{ConversationTurn, Intent, Speaker, Stage};
use silence_policy::SilenceHistory;

/// Per-call dialog state (§3 DialogSession): stage, turn history, and
/// per-(stage,intent) repeat counters that drive escalation.
#[derive(Debug, Clone)]
pub struct DialogSession {
    pub stage: Stage,
    pub history: Vec<ConversationTurn>,
    repeat_counters: HashMap<(Stage, Intent), u32>,
    pub silence: SilenceHistory,
}

impl DialogSession {
    pub fn new() -> Self {
        Self {
            stage: Stage::Start,
            history: Vec::new(),
            repeat_counters: HashMap::new(),
            silence: SilenceHistory::default(),
        }
    }

    /// Current repeat count for `(stage, intent)`, used as the `repeat`
    /// input to [`state_machine::next`] and [`response_selector::select_method`].
    pub fn repeat_count(&self, stage: Stage, intent: Intent) -> u32 {
        self.repeat_counters.get(&(stage, intent)).copied().unwrap_or(0)
    }

    /// §8 invariant 1: append-only, alternating speaker roles starting
    /// with agent.
    pub fn append_turn(&mut self, turn: ConversationTurn) {
        self.history.push(turn);
    }

    /// Advance to `next_stage`, bumping the repeat counter for the
    /// `(stage, intent)` pair that produced this transition. Counters are
    /// keyed on the *originating* stage so successive same-stage repeats
    /// are tracked correctly even as `next_stage` changes.
    pub fn advance(&mut self, from_stage: Stage, intent: Intent, next_stage: Stage) {
        *self.repeat_counters.entry((from_stage, intent)).or_insert(0) += 1;
        self.stage = next_stage;
    }

    pub fn next_speaker(&self) -> Speaker {
        match self.history.last() {
            Some(turn) if turn.speaker == Speaker::Agent => Speaker::Callee,
            _ => Speaker::Agent,
        }
    }
}

impl Default for DialogSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn new_session_starts_at_start_stage_with_no_history() {
        let session = DialogSession::new();
        assert_eq!(session.stage, Stage::Start);
        assert!(session.history.is_empty());
    }

    #[test]
    fn repeat_counter_increments_per_stage_intent_pair() {
        let mut session = DialogSession::new();
        assert_eq!(session.repeat_count(Stage::Negotiation, Intent::Negative), 0);
        session.advance(Stage::Negotiation, Intent::Negative, Stage::Escalation);
        assert_eq!(session.repeat_count(Stage::Negotiation, Intent::Negative), 1);
        session.stage = Stage::Negotiation;
        session.advance(Stage::Negotiation, Intent::Negative, Stage::Escalation);
        assert_eq!(session.repeat_count(Stage::Negotiation, Intent::Negative), 2);
    }

    #[test]
    fn next_speaker_alternates_starting_with_agent() {
        let mut session = DialogSession::new();
        assert_eq!(session.next_speaker(), Speaker::Agent);
        session.append_turn(ConversationTurn {
            timestamp: Utc::now(),
            speaker: Speaker::Agent,
            text: "hello".to_string(),
            intent: None,
        });
        assert_eq!(session.next_speaker(), Speaker::Callee);
    }
}
