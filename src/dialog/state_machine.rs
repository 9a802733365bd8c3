//! DialogStateMachine (§4.6)
//!
//! The per-call transition function `next(stage, intent, repeat) ->
//! (reply_text, next_stage, priority)`. Total over (Stage × Intent): any
//! pair without an explicit rule returns to `Listening` with a neutral
//! clarifying prompt rather than panicking or stalling the call.

use crate::types::{Intent, Stage};

/// TTS priority hint threaded through to [`crate::voice::tts::SynthesizeRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPriority {
    Normal,
    Urgent,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub reply_template: String,
    pub next_stage: Stage,
    pub priority: ReplyPriority,
}

const NEUTRAL_CLARIFYING_PROMPT: &str = "Извините, я не совсем понял. Не могли бы вы уточнить?";

/// Built-in literal rules (§4.6 authoritative subset). The orchestrator
/// consults the external [`crate::dialog::script_table::ScriptTable`]
/// first on every turn and only falls back to these baseline transitions
/// when no script rule matches `(stage, intent, repeat)` — so the call
/// never stalls even with an empty or unavailable script file.
pub fn next(stage: Stage, intent: Intent, repeat: u32) -> Transition {
    use Intent::*;
    use Stage::*;

    match (stage, intent) {
        (Start, Positive) => Transition {
            reply_template: "Здравствуйте, {clientName}! Это звонок от {company} по поводу договора {contract}.".into(),
            next_stage: GreetingSent,
            priority: ReplyPriority::Normal,
        },
        (Listening, Positive) => Transition {
            reply_template:
                "Отлично! Давайте обсудим детали погашения долга на {amount} рублей.".into(),
            next_stage: PaymentDiscussion,
            priority: ReplyPriority::Normal,
        },
        (Listening, Negative) => Transition {
            reply_template: "Я понимаю вашу ситуацию. Возможно, мы могли бы обсудить частичную оплату в размере {partialAmount} рублей?".into(),
            next_stage: Negotiation,
            priority: ReplyPriority::Normal,
        },
        (Listening, Aggressive) => Transition {
            reply_template: "Пожалуйста, давайте сохранять спокойствие и обсудим это конструктивно.".into(),
            next_stage: DeEscalation,
            priority: ReplyPriority::Urgent,
        },
        (Listening, HangUp) => Transition {
            reply_template: "Спасибо за разговор. До свидания.".into(),
            next_stage: Completed,
            priority: ReplyPriority::Normal,
        },
        (Negotiation, Negative) if repeat >= 1 => Transition {
            reply_template: "К сожалению, без согласия мы вынуждены передать дело на дальнейшее рассмотрение.".into(),
            next_stage: Escalation,
            priority: ReplyPriority::Normal,
        },
        (Escalation, Negative) => Transition {
            reply_template: "Это последнее предупреждение перед передачей дела юристам.".into(),
            next_stage: FinalWarning,
            priority: ReplyPriority::Urgent,
        },
        (FinalWarning, Negative) => Transition {
            reply_template: "Ваш отказ зафиксирован, дело будет передано в работу.".into(),
            next_stage: Completed,
            priority: ReplyPriority::Normal,
        },
        (FinalWarning, Positive) => Transition {
            reply_template: "Благодарим за готовность решить вопрос. Договор оформлен.".into(),
            next_stage: Completed,
            priority: ReplyPriority::Normal,
        },
        (_, Silence) if repeat >= 3 => Transition {
            reply_template: "Не слышу ответа, завершаю звонок.".into(),
            next_stage: Completed,
            priority: ReplyPriority::Normal,
        },
        _ => Transition {
            reply_template: NEUTRAL_CLARIFYING_PROMPT.into(),
            next_stage: Listening,
            priority: ReplyPriority::Normal,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_total_over_every_stage_and_intent_pair() {
        let stages = [
            Stage::Start,
            Stage::GreetingSent,
            Stage::WaitingResponse,
            Stage::Listening,
            Stage::Negotiation,
            Stage::DeEscalation,
            Stage::PaymentDiscussion,
            Stage::Escalation,
            Stage::FinalWarning,
            Stage::Completed,
            Stage::Error,
        ];
        let intents = [
            Intent::Positive,
            Intent::Negative,
            Intent::Neutral,
            Intent::Aggressive,
            Intent::HangUp,
            Intent::Silence,
        ];
        for &stage in &stages {
            for &intent in &intents {
                // Must not panic for any input, repeat 0..=5.
                for repeat in 0..=5 {
                    let _ = next(stage, intent, repeat);
                }
            }
        }
    }

    #[test]
    fn positive_flow_reaches_payment_discussion() {
        let t = next(Stage::Listening, Intent::Positive, 0);
        assert_eq!(t.next_stage, Stage::PaymentDiscussion);
    }

    #[test]
    fn hang_up_is_terminal() {
        let t = next(Stage::Listening, Intent::HangUp, 0);
        assert_eq!(t.next_stage, Stage::Completed);
    }

    #[test]
    fn repeated_silence_ends_the_call() {
        let t = next(Stage::Negotiation, Intent::Silence, 3);
        assert_eq!(t.next_stage, Stage::Completed);
        assert!(next(Stage::Negotiation, Intent::Silence, 1).next_stage != Stage::Completed);
    }

    #[test]
    fn unmapped_pair_returns_to_listening_with_clarifying_prompt() {
        let t = next(Stage::PaymentDiscussion, Intent::Neutral, 0);
        assert_eq!(t.next_stage, Stage::Listening);
        assert_eq!(t.reply_template, NEUTRAL_CLARIFYING_PROMPT);
    }

    #[test]
    fn escalation_chain_reaches_final_warning_then_completes() {
        let escalated = next(Stage::Negotiation, Intent::Negative, 1);
        assert_eq!(escalated.next_stage, Stage::Escalation);
        let warned = next(Stage::Escalation, Intent::Negative, 0);
        assert_eq!(warned.next_stage, Stage::FinalWarning);
        let ended = next(Stage::FinalWarning, Intent::Negative, 0);
        assert_eq!(ended.next_stage, Stage::Completed);
    }
}
