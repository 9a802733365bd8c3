//! Voice engines
//!
//! Thin, independently-testable wrappers around the three vendor calls the
//! pipeline makes per utterance: speech-to-text ([`stt`]), intent-agnostic
//! text-to-speech with caching and fallback ([`tts`]), and the streaming
//! telephony voice-activity detector ([`vad`]) that turns a raw μ-law
//! frame stream into discrete utterances.

pub mod stt;
pub mod tts;
pub mod vad;
