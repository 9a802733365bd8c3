//! ResponseSelector (C6, §4.6)
//!
//! Picks which of `{script, cache, generated}` produces the reply text for
//! a turn, then validates whatever text was produced before it is allowed
//! to reach the TTS engine.

use std::collections::HashMap;

use crate::types::Intent;

/// Method used to produce a turn's reply text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMethod {
    Script,
    Cache,
    Generated,
}

/// Vocabulary that triggers the "always use the script" critical path
/// regardless of repeat count, so legal/threat language gets the
/// carefully-worded canned response rather than an LLM improvisation.
const CRITICAL_KEYWORDS: &[&str] = &["суд", "жалоб", "прокурат", "угроз", "адвокат"];

const FORBIDDEN_VOCABULARY: &[&str] = &["гарантирую", "обещаю стопроцентно", "бесплатно спишем"];

/// Vocabulary a reply must contain at least one of, once it's long enough
/// that drifting off-topic becomes a real risk (§4.6 "must mention
/// debt/payment vocabulary if >50 chars").
const ON_TOPIC_VOCABULARY: &[&str] = &["долг", "оплат", "плат", "рубл", "договор", "звон"];

const MAX_REPLY_LENGTH: usize = 200;
const FALLBACK_PHRASE: &str = "Извините, уточните, пожалуйста, ваш вопрос.";

/// Decide which method should produce this turn's reply (§4.6 selection
/// rules, in priority order).
pub fn select_method(
    utterance: &str,
    repeat: u32,
    is_off_topic: bool,
    is_unusual_length: bool,
    repeats_recent_history: bool,
    has_cache_entry: bool,
) -> ReplyMethod {
    let lower = utterance.to_lowercase();
    if CRITICAL_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return ReplyMethod::Script;
    }
    if repeat >= 2 || is_off_topic || is_unusual_length || repeats_recent_history {
        return ReplyMethod::Generated;
    }
    if has_cache_entry {
        return ReplyMethod::Cache;
    }
    ReplyMethod::Script
}

/// Run the reply validator (§4.6): max length, forbidden vocabulary,
/// on-topic check for long replies. Returns the original text if it
/// passes, or [`FALLBACK_PHRASE`] if it doesn't — a reply is always
/// produced, it is never rejected outright.
pub fn validate(reply: &str) -> &str {
    if reply.chars().count() > MAX_REPLY_LENGTH {
        return FALLBACK_PHRASE;
    }
    let lower = reply.to_lowercase();
    if FORBIDDEN_VOCABULARY.iter().any(|w| lower.contains(w)) {
        return FALLBACK_PHRASE;
    }
    if reply.chars().count() > 50 && !ON_TOPIC_VOCABULARY.iter().any(|w| lower.contains(w)) {
        return FALLBACK_PHRASE;
    }
    reply
}

/// Substitute `{clientName}`, `{company}`, `{amount}`, `{contract}`,
/// `{partialAmount}` placeholders, falling back to stated defaults for any
/// value the client record leaves unset (§4.6 Personalization).
pub fn personalize(
    template: &str,
    client_name: &str,
    company: &str,
    amount: f64,
    contract: &str,
    partial_amount: Option<f64>,
) -> String {
    let mut values = HashMap::new();
    values.insert("clientName", client_name.to_string());
    values.insert("company", company.to_string());
    values.insert("amount", format!("{amount:.0}"));
    values.insert("contract", contract.to_string());
    values.insert(
        "partialAmount",
        partial_amount.map(|a| format!("{a:.0}")).unwrap_or_else(|| "частичной суммы".to_string()),
    );
    crate::dialog::script_table::render_template(template, &values)
}

/// Used only to decide critical-keyword routing independent of intent —
/// kept separate from [`select_method`] so callers that already know the
/// intent can short-circuit obviously non-critical turns.
pub fn is_critical_turn(utterance: &str, intent: Intent) -> bool {
    matches!(intent, Intent::Aggressive) || CRITICAL_KEYWORDS.iter().any(|k| utterance.to_lowercase().contains(k))
}

/// A callee utterance counts as off-topic once it's long enough to carry
/// real content but mentions none of the debt/payment vocabulary — the
/// same rule [`validate`] applies to a produced reply, applied here to the
/// input utterance to decide whether to route it to `generated` instead.
pub fn is_off_topic(utterance: &str) -> bool {
    let lower = utterance.to_lowercase();
    lower.chars().count() > 15 && !ON_TOPIC_VOCABULARY.iter().any(|w| lower.contains(w))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_keywords_force_script_method() {
        let method = select_method("Я подам жалобу в прокуратуру", 0, false, false, false, true);
        assert_eq!(method, ReplyMethod::Script);
    }

    #[test]
    fn high_repeat_forces_generated() {
        let method = select_method("обычная фраза", 2, false, false, false, true);
        assert_eq!(method, ReplyMethod::Generated);
    }

    #[test]
    fn cache_used_when_stable_key_exists_and_nothing_unusual() {
        let method = select_method("да", 0, false, false, false, true);
        assert_eq!(method, ReplyMethod::Cache);
    }

    #[test]
    fn defaults_to_script_without_a_cache_entry() {
        let method = select_method("да", 0, false, false, false, false);
        assert_eq!(method, ReplyMethod::Script);
    }

    #[test]
    fn validator_rejects_overlong_reply() {
        let long = "а".repeat(250);
        assert_eq!(validate(&long), FALLBACK_PHRASE);
    }

    #[test]
    fn validator_rejects_forbidden_vocabulary() {
        assert_eq!(validate("Гарантирую списание долга полностью"), FALLBACK_PHRASE);
    }

    #[test]
    fn validator_requires_on_topic_vocabulary_for_long_replies() {
        let off_topic = "Сегодня прекрасная погода, давайте поговорим о чем-нибудь приятном вместо скучных дел";
        assert_eq!(validate(off_topic), FALLBACK_PHRASE);
    }

    #[test]
    fn validator_passes_short_on_topic_reply() {
        let reply = "Обсудим оплату долга.";
        assert_eq!(validate(reply), reply);
    }

    #[test]
    fn is_off_topic_flags_long_utterance_with_no_debt_vocabulary() {
        assert!(is_off_topic("Сегодня прекрасная погода, давайте поговорим о чем-нибудь приятном"));
        assert!(!is_off_topic("да"));
        assert!(!is_off_topic("Я обсужу оплату долга завтра"));
    }

    #[test]
    fn personalize_substitutes_all_placeholders() {
        let rendered = personalize(
            "{clientName} должен {company} сумму {amount} по {contract}, либо {partialAmount}",
            "Иван",
            "Acme",
            50000.0,
            "K-123",
            Some(20000.0),
        );
        assert!(rendered.contains("Иван"));
        assert!(rendered.contains("50000"));
        assert!(rendered.contains("20000"));
        assert!(rendered.contains("K-123"));
    }
}
