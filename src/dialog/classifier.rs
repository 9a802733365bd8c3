//! Intent classifier
//!
//! Primary path routes the callee's transcript through the LLM job queue
//! (§4.9) for a nuanced classification; if that queue call fails (vendor
//! down, queue shutting down), a deterministic Russian-language keyword
//! classifier takes over so a call in progress never stalls waiting on a
//! degraded dependency.

use tracing::warn;

use crate::types::{ConversationTurn, Intent, Speaker, Stage};

/// Payload for a C6 "generated" reply job (§4.6): everything the LLM
/// needs to improvise a free-text, on-character reply instead of a
/// templated one, without the job queue depending on `DialogSession`.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub transcript: String,
    pub stage: Stage,
    pub recent_history: Vec<ConversationTurn>,
    pub client_name: String,
    pub company: String,
    pub debt_amount: f64,
}

/// Case-insensitive, first-match-wins keyword rules. Order matters:
/// hang-up and aggression are checked before the broader positive/negative
/// buckets so a word like "нет" inside an aggressive sentence doesn't
/// misclassify as plain negative.
const HANG_UP_KEYWORDS: &[&str] = &["до свидания", "пока", "не звоните", "повесить трубку"];
const AGGRESSIVE_KEYWORDS: &[&str] = &["идиот", "достали", "заткнись", "дебил", "угрожа"];
const POSITIVE_KEYWORDS: &[&str] = &["да", "согласен", "хорошо", "оплачу", "конечно"];
const NEGATIVE_KEYWORDS: &[&str] = &["нет", "не буду", "не могу", "отказ", "не собираюсь"];

/// Deterministic fallback used when the LLM classifier is unavailable
/// (§4.12). Scans the lowercased transcript for the first matching
/// keyword group; no match defaults to neutral.
pub fn classify_by_keywords(text: &str) -> Intent {
    let lower = text.to_lowercase();
    if HANG_UP_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Intent::HangUp;
    }
    if AGGRESSIVE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Intent::Aggressive;
    }
    if POSITIVE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Intent::Positive;
    }
    if NEGATIVE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Intent::Negative;
    }
    Intent::Neutral
}

/// Primary LLM-backed classification call. Takes an already-transcribed
/// utterance and asks the chat-completion vendor to pick one of the
/// [`Intent`] variants; any vendor/parse failure is treated as "unavailable"
/// by the caller, which falls back to [`classify_by_keywords`].
pub struct Classifier {
    http: reqwest::Client,
    api_key: String,
    timeout: std::time::Duration,
}

impl Classifier {
    pub fn new(api_key: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            timeout,
        }
    }

    /// Classify `text`, falling back to the keyword rules on any failure
    /// of the LLM call so the pipeline never stalls on a degraded vendor.
    pub async fn classify(&self, text: &str) -> Intent {
        match self.classify_via_llm(text).await {
            Ok(intent) => intent,
            Err(e) => {
                warn!(error = %e, "llm classification failed, using keyword fallback");
                classify_by_keywords(text)
            }
        }
    }

    /// The raw, fallible LLM call, with no keyword fallback applied. Used
    /// directly by [`crate::queue::JobQueue`] callers that want the
    /// queue's own retry/backoff policy rather than an immediate
    /// fallback-on-first-failure (§4.9).
    pub(crate) async fn classify_via_llm(&self, text: &str) -> Result<Intent, String> {
        #[derive(serde::Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(serde::Deserialize)]
        struct Message {
            content: String,
        }
        #[derive(serde::Deserialize)]
        struct ChatResponse {
            choices: Vec<Choice>,
        }

        let prompt = format!(
            "Classify the intent of this debt-collection call transcript as exactly one word: \
             positive, negative, neutral, aggressive, or hang_up. Transcript: {text}"
        );

        let body = serde_json::json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": 5,
            "temperature": 0.0,
        });

        let response = tokio::time::timeout(
            self.timeout,
            self.http
                .post("https://api.openai.com/v1/chat/completions")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| "classification timed out".to_string())?
        .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("vendor returned {}", response.status()));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| e.to_string())?;
        let label = parsed
            .choices
            .first()
            .map(|c| c.message.content.trim().to_lowercase())
            .ok_or_else(|| "empty choices".to_string())?;

        parse_intent_label(&label).ok_or_else(|| format!("unrecognized label: {label}"))
    }

    /// The C6 "generated" reply job (§4.6): asks the LLM to improvise a
    /// free-text reply in character, grounded in the last few turns,
    /// rather than selecting one of the templated transitions. Used when
    /// [`crate::dialog::response_selector::select_method`] picks
    /// [`crate::dialog::response_selector::ReplyMethod::Generated`].
    pub(crate) async fn generate_reply(&self, request: GenerationRequest) -> Result<String, String> {
        #[derive(serde::Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(serde::Deserialize)]
        struct Message {
            content: String,
        }
        #[derive(serde::Deserialize)]
        struct ChatResponse {
            choices: Vec<Choice>,
        }

        let history: String = request
            .recent_history
            .iter()
            .rev()
            .take(4)
            .rev()
            .map(|turn| match turn.speaker {
                Speaker::Agent => format!("Агент: {}", turn.text),
                Speaker::Callee => format!("Клиент: {}", turn.text),
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Ты — вежливый оператор по взысканию долгов компании {}. Клиента зовут {}, \
             сумма долга {:.0} рублей. Текущий этап разговора: {:?}. Вот последние реплики:\n{}\n\
             Клиент только что сказал: \"{}\". Ответь одной короткой репликой по-русски (не более 200 символов), \
             оставаясь в рамках темы долга и оплаты, без обещаний и гарантий.",
            request.company, request.client_name, request.debt_amount, request.stage, history, request.transcript
        );

        let body = serde_json::json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": 120,
            "temperature": 0.6,
        });

        let response = tokio::time::timeout(
            self.timeout,
            self.http
                .post("https://api.openai.com/v1/chat/completions")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| "generation timed out".to_string())?
        .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("vendor returned {}", response.status()));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| e.to_string())?;
        parsed
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| "empty choices".to_string())
    }
}

fn parse_intent_label(label: &str) -> Option<Intent> {
    match label {
        "positive" => Some(Intent::Positive),
        "negative" => Some(Intent::Negative),
        "neutral" => Some(Intent::Neutral),
        "aggressive" => Some(Intent::Aggressive),
        "hang_up" | "hangup" => Some(Intent::HangUp),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_fallback_detects_hang_up() {
        assert_eq!(classify_by_keywords("Ну ладно, до свидания"), Intent::HangUp);
    }

    #[test]
    fn keyword_fallback_detects_aggression_before_negative() {
        assert_eq!(classify_by_keywords("Вы меня достали, идиоты"), Intent::Aggressive);
    }

    #[test]
    fn keyword_fallback_detects_positive() {
        assert_eq!(classify_by_keywords("Да, согласен заплатить"), Intent::Positive);
    }

    #[test]
    fn keyword_fallback_defaults_to_neutral() {
        assert_eq!(classify_by_keywords("Какой сегодня день недели?"), Intent::Neutral);
    }

    #[test]
    fn parse_intent_label_accepts_hangup_variants() {
        assert_eq!(parse_intent_label("hang_up"), Some(Intent::HangUp));
        assert_eq!(parse_intent_label("hangup"), Some(Intent::HangUp));
        assert_eq!(parse_intent_label("bogus"), None);
    }
}
