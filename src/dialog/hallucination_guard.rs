//! HallucinationGuard (§4.5)
//!
//! Advisory classifier run on every transcript before it reaches the
//! dialog state machine: is this real speech, silence, or an STT
//! hallucination (boilerplate the vendor imagined out of near-silent
//! audio)? Never raises — a guard that can fail would defeat its purpose.

use once_cell::sync::Lazy;
use regex::RegexSet;

/// Boilerplate patterns known to be STT hallucinations on near-silent
/// audio: video-closing credits, subtitle watermarks, and similar stock
/// phrases that have nothing to do with a debt-collection call.
static HALLUCINATION_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)продолжение следует",
        r"(?i)подпишитесь на канал",
        r"(?i)субтитры сделал",
        r"(?i)спасибо за просмотр",
        r"(?i)thanks for watching",
        r"(?i)subscribe to",
    ])
    .expect("static hallucination pattern set")
});

/// Domain vocabulary that, combined with a plausible word rate, marks a
/// transcript as real speech rather than noise.
const DOMAIN_VOCABULARY: &[&str] = &[
    "долг", "оплат", "деньги", "рубл", "договор", "плат", "звон", "да", "нет", "согласен",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardLabel {
    Hallucination,
    Silence,
    Real,
}

#[derive(Debug, Clone)]
pub struct GuardVerdict {
    pub label: GuardLabel,
    pub confidence: f32,
    pub reason: &'static str,
}

impl GuardVerdict {
    pub fn is_hallucination(&self) -> bool {
        self.label == GuardLabel::Hallucination
    }

    pub fn is_silence(&self) -> bool {
        self.label == GuardLabel::Silence
    }

    pub fn is_real(&self) -> bool {
        self.label == GuardLabel::Real
    }
}

/// `classify_utterance(text, audio_bytes, duration_sec) -> GuardVerdict`
/// (§4.5). Each rule below contributes a candidate label and confidence;
/// the highest-confidence candidate wins.
pub fn classify_utterance(text: &str, audio_bytes: usize, duration_sec: f32) -> GuardVerdict {
    let mut candidates: Vec<GuardVerdict> = Vec::new();
    let trimmed = text.trim();

    if HALLUCINATION_PATTERNS.is_match(trimmed) {
        candidates.push(GuardVerdict {
            label: GuardLabel::Hallucination,
            confidence: 0.95,
            reason: "matched known hallucination phrase",
        });
    }

    if duration_sec > 0.0 {
        let density_kb_per_sec = (audio_bytes as f32 / 1024.0) / duration_sec;
        if density_kb_per_sec < 4.0 {
            candidates.push(GuardVerdict {
                label: GuardLabel::Silence,
                confidence: 0.7,
                reason: "audio density below silence threshold",
            });
        }
    }

    if duration_sec > 8.0 && trimmed.chars().count() < 20 {
        candidates.push(GuardVerdict {
            label: GuardLabel::Silence,
            confidence: 0.8,
            reason: "long duration with implausibly short transcript",
        });
    }

    if let Some(ratio) = char_repeat_ratio(trimmed) {
        if ratio > 0.7 {
            candidates.push(GuardVerdict {
                label: GuardLabel::Hallucination,
                confidence: 0.75,
                reason: "character repeat ratio exceeds threshold",
            });
        }
    }

    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_punctuation() || c.is_whitespace()) {
        candidates.push(GuardVerdict {
            label: GuardLabel::Hallucination,
            confidence: 0.9,
            reason: "transcript is punctuation only",
        });
    }

    if duration_sec > 0.0 {
        let word_count = trimmed.split_whitespace().count();
        let rate = word_count as f32 / duration_sec;
        let lower = trimmed.to_lowercase();
        let has_domain_word = DOMAIN_VOCABULARY.iter().any(|w| lower.contains(w));
        if (0.5..=4.0).contains(&rate) && has_domain_word {
            candidates.push(GuardVerdict {
                label: GuardLabel::Real,
                confidence: 0.85,
                reason: "plausible word rate with domain vocabulary",
            });
        }
    }

    candidates
        .into_iter()
        .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap_or(GuardVerdict {
            label: GuardLabel::Real,
            confidence: 0.5,
            reason: "no rule matched, defaulting to real speech",
        })
}

fn char_repeat_ratio(text: &str) -> Option<f32> {
    let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if chars.len() < 4 {
        return None;
    }
    let mut counts = std::collections::HashMap::new();
    for &c in &chars {
        *counts.entry(c).or_insert(0usize) += 1;
    }
    let max_count = counts.values().copied().max().unwrap_or(0);
    Some(max_count as f32 / chars.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_known_hallucination_phrase() {
        let verdict = classify_utterance("Продолжение следует...", 2000, 3.0);
        assert!(verdict.is_hallucination());
    }

    #[test]
    fn flags_low_density_audio_as_silence() {
        let verdict = classify_utterance("а", 100, 5.0);
        assert!(verdict.is_silence());
    }

    #[test]
    fn flags_punctuation_only_as_hallucination() {
        let verdict = classify_utterance("... !! ...", 5000, 2.0);
        assert!(verdict.is_hallucination());
    }

    #[test]
    fn real_speech_with_domain_vocabulary_passes() {
        let verdict = classify_utterance("Да, я согласен оплатить долг в этом месяце", 48000, 3.0);
        assert!(verdict.is_real());
    }

    #[test]
    fn empty_transcript_defaults_safely() {
        let verdict = classify_utterance("", 0, 0.0);
        // Zero duration skips the density/word-rate rules; falls through
        // to the Real default rather than panicking.
        assert_eq!(verdict.label, GuardLabel::Real);
    }

    #[test]
    fn never_panics_on_pathological_input() {
        let _ = classify_utterance(&"я".repeat(10_000), usize::MAX, f32::MAX);
    }
}
