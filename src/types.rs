//! Shared data model (§3 DATA MODEL)
//!
//! Types used across the dialog, queue, persistence, and orchestrator
//! modules, kept in one place to avoid circular dependencies between them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque call identity, minted locally when a call is initiated.
pub type CallId = Uuid;

/// Lifecycle status of a [`Call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Answered,
    InProgress,
    Completed,
    Failed,
    Busy,
    NoAnswer,
    Canceled,
}

impl CallStatus {
    /// Terminal statuses admit no further transitions (§8 invariant 5).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Completed
                | CallStatus::Failed
                | CallStatus::Busy
                | CallStatus::NoAnswer
                | CallStatus::Canceled
        )
    }

    /// Parse a carrier `CallStatus` webhook value.
    pub fn from_carrier_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "queued" | "initiated" => Some(CallStatus::Initiated),
            "ringing" => Some(CallStatus::Ringing),
            "answered" | "in-progress" | "in_progress" => Some(CallStatus::InProgress),
            "completed" => Some(CallStatus::Completed),
            "failed" => Some(CallStatus::Failed),
            "busy" => Some(CallStatus::Busy),
            "no-answer" | "no_answer" => Some(CallStatus::NoAnswer),
            "canceled" | "cancelled" => Some(CallStatus::Canceled),
            _ => None,
        }
    }
}

/// Dialog stage (§3 Stage). Drives reply selection in [`crate::dialog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    GreetingSent,
    WaitingResponse,
    Listening,
    Negotiation,
    DeEscalation,
    PaymentDiscussion,
    Escalation,
    FinalWarning,
    Completed,
    Error,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Error)
    }
}

/// Callee-utterance intent (§3 Intent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Positive,
    Negative,
    Neutral,
    Aggressive,
    HangUp,
    Silence,
}

/// Speaker role in a [`ConversationTurn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Agent,
    Callee,
}

/// One contiguous utterance by one speaker (§3 ConversationTurn).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub timestamp: DateTime<Utc>,
    pub speaker: Speaker,
    pub text: String,
    pub intent: Option<Intent>,
}

/// Source of a recorded callee turn, kept for the recordings audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub url: String,
    pub duration: std::time::Duration,
    pub transcription: String,
    pub intent: Option<Intent>,
}

/// One entry in the recording-events audit trail (§3.1 RecordingEvent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: RecordingEventKind,
    pub recording_sid: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingEventKind {
    RecordingAvailable,
    RecordingStatus,
}

/// Terminal reason recorded on [`CallResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    Agreement,
    HangUp,
    Abandoned,
    Flagged,
    ServerShutdown,
    Error,
}

/// Outcome summary attached to a [`Call`] when it reaches a terminal status
/// (§3.1 CallResult).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResult {
    pub agreement: bool,
    pub promised_payment: Option<f64>,
    pub next_contact_date: Option<DateTime<Utc>>,
    pub notes: Vec<String>,
    pub terminal_reason: TerminalReason,
}

/// Primary call entity (§3 Call). Owned by the persistence layer; mutated
/// only through [`crate::persistence::CallStore`] operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub call_id: CallId,
    pub call_sid: Option<String>,
    pub client_id: String,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub history: Vec<ConversationTurn>,
    pub result: Option<CallResult>,
    pub recordings: Vec<Recording>,
    pub recording_events: Vec<RecordingEvent>,
}

impl Call {
    pub fn new(call_id: CallId, client_id: String) -> Self {
        Self {
            call_id,
            call_sid: None,
            client_id,
            status: CallStatus::Initiated,
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            history: Vec::new(),
            result: None,
            recordings: Vec::new(),
            recording_events: Vec::new(),
        }
    }

    /// §8 invariant 7: non-decreasing (start ≤ answer ≤ end) timestamp triple.
    pub fn timestamps_are_ordered(&self) -> bool {
        if let Some(answered) = self.answered_at {
            if answered < self.started_at {
                return false;
            }
            if let Some(ended) = self.ended_at {
                if ended < answered {
                    return false;
                }
            }
        } else if let Some(ended) = self.ended_at {
            if ended < self.started_at {
                return false;
            }
        }
        true
    }
}

/// Minimal client record the persistence port returns to `initiate`
/// (§3.1 Client).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub debt_amount: f64,
    pub company: String,
    pub contract_ref: String,
    pub partial_payment_offer: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_exactly_five() {
        let all = [
            CallStatus::Initiated,
            CallStatus::Ringing,
            CallStatus::Answered,
            CallStatus::InProgress,
            CallStatus::Completed,
            CallStatus::Failed,
            CallStatus::Busy,
            CallStatus::NoAnswer,
            CallStatus::Canceled,
        ];
        let terminal_count = all.iter().filter(|s| s.is_terminal()).count();
        assert_eq!(terminal_count, 5);
    }

    #[test]
    fn call_status_parses_twilio_strings() {
        assert_eq!(CallStatus::from_carrier_str("completed"), Some(CallStatus::Completed));
        assert_eq!(CallStatus::from_carrier_str("no-answer"), Some(CallStatus::NoAnswer));
        assert_eq!(CallStatus::from_carrier_str("bogus"), None);
    }

    #[test]
    fn timestamp_ordering_detects_violation() {
        let mut call = Call::new(Uuid::nil(), "c1".to_string());
        call.answered_at = Some(call.started_at - chrono::Duration::seconds(5));
        assert!(!call.timestamps_are_ordered());
    }
}
