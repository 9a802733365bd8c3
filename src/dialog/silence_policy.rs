//! SilencePolicy (C11, §4.8)
//!
//! Consumes the [`crate::dialog::hallucination_guard`] verdict plus a
//! call's cumulative silence history to decide how (or whether) the agent
//! should respond to dead air.

use std::time::Duration;

use crate::dialog::hallucination_guard::GuardVerdict;
use crate::voice::tts::{SynthesizeRequest, TtsEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilenceSeverity {
    Short,
    Medium,
    Long,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prescription {
    Ignore,
    GentlePrompt,
    PatientWait,
    DemandResponse,
    FinalWarning,
    HangUp,
}

/// Running count of silence events and accumulated silence time since the
/// last real speech on a call; owned by the call's dialog session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilenceHistory {
    pub count_since_last_speech: u32,
    pub cumulative: Duration,
}

impl SilenceHistory {
    pub fn record(&mut self, gap: Duration) {
        self.count_since_last_speech += 1;
        self.cumulative += gap;
    }

    pub fn reset(&mut self) {
        self.count_since_last_speech = 0;
        self.cumulative = Duration::ZERO;
    }

    fn severity(&self) -> SilenceSeverity {
        match self.cumulative.as_secs() {
            0..=5 => SilenceSeverity::Short,
            6..=15 => SilenceSeverity::Medium,
            16..=30 => SilenceSeverity::Long,
            _ => SilenceSeverity::Critical,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SilenceOutcome {
    pub prescription: Prescription,
    pub reply_text: Option<String>,
    pub should_continue: bool,
}

/// Decide what to do about silence on a given turn (§4.8). `is_negotiation`
/// narrows the "patient wait" prescription to the negotiation stage, where
/// a thinking pause is expected and should not be rushed.
pub fn prescribe(
    guard_verdict: &GuardVerdict,
    history: &SilenceHistory,
    is_negotiation: bool,
) -> SilenceOutcome {
    if guard_verdict.is_hallucination() {
        return SilenceOutcome {
            prescription: Prescription::Ignore,
            reply_text: None,
            should_continue: true,
        };
    }

    let severity = history.severity();
    match (severity, history.count_since_last_speech) {
        (SilenceSeverity::Critical, _) => SilenceOutcome {
            prescription: Prescription::HangUp,
            reply_text: Some("Не слышу ответа, завершаю звонок. До свидания.".to_string()),
            should_continue: false,
        },
        (_, n) if n >= 4 => SilenceOutcome {
            prescription: Prescription::FinalWarning,
            reply_text: Some("Если вы не ответите, мы будем вынуждены завершить звонок.".to_string()),
            should_continue: true,
        },
        (_, n) if n >= 3 => SilenceOutcome {
            prescription: Prescription::DemandResponse,
            reply_text: Some("Пожалуйста, ответьте, слышите ли вы меня?".to_string()),
            should_continue: true,
        },
        (SilenceSeverity::Long, _) | (SilenceSeverity::Medium, _) if is_negotiation => SilenceOutcome {
            prescription: Prescription::PatientWait,
            reply_text: None,
            should_continue: true,
        },
        (SilenceSeverity::Medium, _) | (SilenceSeverity::Long, _) => SilenceOutcome {
            prescription: Prescription::GentlePrompt,
            reply_text: Some("Вы меня слышите?".to_string()),
            should_continue: true,
        },
        (SilenceSeverity::Short, _) => SilenceOutcome {
            prescription: Prescription::Ignore,
            reply_text: None,
            should_continue: true,
        },
    }
}

/// Synthesize the prescribed reply, if any, using the TTS engine (§4.8
/// "Uses C3 to synthesize any non-null reply").
pub async fn synthesize_outcome(
    tts: &TtsEngine,
    outcome: &SilenceOutcome,
) -> Option<crate::voice::tts::TtsResult> {
    let text = outcome.reply_text.as_ref()?;
    let mut request = SynthesizeRequest::new(text.clone());
    request.priority = matches!(outcome.prescription, Prescription::FinalWarning | Prescription::HangUp);
    tts.synthesize(request).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn real_speech_verdict() -> GuardVerdict {
        crate::dialog::hallucination_guard::classify_utterance("нормальная речь", 48000, 3.0)
    }

    #[test]
    fn hallucination_is_always_ignored() {
        let verdict = crate::dialog::hallucination_guard::classify_utterance("Продолжение следует", 2000, 3.0);
        let outcome = prescribe(&verdict, &SilenceHistory::default(), false);
        assert_eq!(outcome.prescription, Prescription::Ignore);
        assert!(outcome.reply_text.is_none());
    }

    #[test]
    fn short_silence_is_ignored() {
        let mut history = SilenceHistory::default();
        history.record(Duration::from_secs(2));
        let outcome = prescribe(&real_speech_verdict(), &history, false);
        assert_eq!(outcome.prescription, Prescription::Ignore);
    }

    #[test]
    fn medium_silence_outside_negotiation_gets_gentle_prompt() {
        let mut history = SilenceHistory::default();
        history.record(Duration::from_secs(10));
        let outcome = prescribe(&real_speech_verdict(), &history, false);
        assert_eq!(outcome.prescription, Prescription::GentlePrompt);
        assert!(outcome.reply_text.is_some());
    }

    #[test]
    fn medium_silence_during_negotiation_waits_patiently() {
        let mut history = SilenceHistory::default();
        history.record(Duration::from_secs(10));
        let outcome = prescribe(&real_speech_verdict(), &history, true);
        assert_eq!(outcome.prescription, Prescription::PatientWait);
    }

    #[test]
    fn three_or_more_silences_demands_a_response() {
        let mut history = SilenceHistory::default();
        history.count_since_last_speech = 3;
        history.cumulative = Duration::from_secs(3);
        let outcome = prescribe(&real_speech_verdict(), &history, false);
        assert_eq!(outcome.prescription, Prescription::DemandResponse);
        assert!(outcome.should_continue);
    }

    #[test]
    fn critical_silence_hangs_up_and_stops_the_call() {
        let mut history = SilenceHistory::default();
        history.cumulative = Duration::from_secs(31);
        let outcome = prescribe(&real_speech_verdict(), &history, false);
        assert_eq!(outcome.prescription, Prescription::HangUp);
        assert!(!outcome.should_continue);
    }

    #[test]
    fn reset_clears_accumulated_history() {
        let mut history = SilenceHistory::default();
        history.record(Duration::from_secs(20));
        history.reset();
        assert_eq!(history.count_since_last_speech, 0);
        assert_eq!(history.cumulative, Duration::ZERO);
    }
}
