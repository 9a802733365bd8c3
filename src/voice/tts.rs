//! Text-to-speech engine (C3)
//!
//! Wraps a cloud TTS vendor (ElevenLabs-shaped REST API) behind the
//! cache/retry/fallback policy §4.3 specifies: a cache hit skips the
//! network entirely, a vendor failure retries with exponential backoff,
//! and exhausting retries degrades to a text-only fallback rather than
//! failing the turn outright.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::TtsConfig;
use crate::error::TtsError;
use crate::metrics::EngineCounters;
use crate::phrase_cache::PhraseCache;

/// Caller-supplied synthesis parameters (§4.3 Synthesize inputs).
#[derive(Debug, Clone)]
pub struct SynthesizeRequest {
    pub text: String,
    pub voice: Option<String>,
    /// Urgent requests (e.g. a silence-policy nudge) skip the cache lookup
    /// so they are never delayed by a disk read under load; see §4.3.
    pub priority: bool,
    pub allow_cache: bool,
}

impl SynthesizeRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: None,
            priority: false,
            allow_cache: true,
        }
    }
}

/// Outcome of a synthesis attempt (§4.3 TTSResult variants).
#[derive(Debug, Clone)]
pub enum TtsResult {
    /// Served straight from the phrase cache; no vendor call made.
    Cache { url: String },
    /// Freshly synthesized audio from the primary vendor voice.
    Primary { blob: Vec<u8>, voice: String },
    /// All retries against the primary and fallback voice failed; the
    /// caller should fall back to a text-only channel (e.g. logging or a
    /// pre-recorded apology clip) rather than blocking the call.
    Fallback { text: String, fallback_voice_id: String },
}

#[derive(Debug, Deserialize)]
struct VendorErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Cloud TTS engine: one instance shared across calls via `Arc`.
pub struct TtsEngine {
    http: reqwest::Client,
    config: TtsConfig,
    cache: Option<Arc<PhraseCache>>,
    counters: EngineCounters,
}

impl TtsEngine {
    pub fn new(config: TtsConfig, cache: Option<Arc<PhraseCache>>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            cache,
            counters: EngineCounters::new(),
        }
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    /// `synthesize(text, options) -> TTSResult` (§4.3).
    pub async fn synthesize(&self, request: SynthesizeRequest) -> Result<TtsResult, TtsError> {
        self.counters.record_request();

        let voice = request.voice.clone().unwrap_or_else(|| self.config.voice_id.clone());

        if request.allow_cache && !request.priority {
            if let Some(cache) = &self.cache {
                if let Some(url) = cache.lookup(&request.text, &voice) {
                    self.counters.record_cache_hit();
                    debug!(voice = %voice, "tts cache hit");
                    return Ok(TtsResult::Cache { url });
                }
                self.counters.record_cache_miss();
            }
        }

        match self.synthesize_with_retry(&request.text, &voice).await {
            Ok(blob) => {
                if request.allow_cache {
                    if let Some(cache) = &self.cache {
                        if let Some(category) = crate::phrase_cache::should_cache(&request.text) {
                            debug!(?category, "caching freshly synthesized phrase");
                            if let Err(e) = cache.store(&request.text, &blob, &voice) {
                                warn!(error = %e, "failed to persist cached phrase");
                            }
                        }
                    }
                }
                Ok(TtsResult::Primary { blob, voice })
            }
            Err(primary_err) => {
                warn!(error = %primary_err, voice = %voice, "primary tts voice exhausted retries");
                if voice != self.config.fallback_voice_id {
                    match self.synthesize_with_retry(&request.text, &self.config.fallback_voice_id).await {
                        Ok(blob) => {
                            self.counters.record_fallback();
                            return Ok(TtsResult::Primary {
                                blob,
                                voice: self.config.fallback_voice_id.clone(),
                            });
                        }
                        Err(fallback_err) => {
                            warn!(error = %fallback_err, "fallback tts voice also exhausted retries");
                        }
                    }
                }
                self.counters.record_error();
                self.counters.record_fallback();
                Ok(TtsResult::Fallback {
                    text: request.text,
                    fallback_voice_id: self.config.fallback_voice_id.clone(),
                })
            }
        }
    }

    /// §4.3 retry policy: up to `max_attempts`, base-2 exponential
    /// backoff between attempts, each attempt bounded by a per-request
    /// timeout.
    async fn synthesize_with_retry(&self, text: &str, voice: &str) -> Result<Vec<u8>, TtsError> {
        let mut last_err = None;
        for attempt in 0..self.config.max_attempts {
            match self.call_vendor(text, voice).await {
                Ok(blob) => return Ok(blob),
                Err(e) => {
                    warn!(attempt, voice = %voice, error = %e, "tts vendor call failed");
                    last_err = Some(e);
                    if attempt + 1 < self.config.max_attempts {
                        let backoff = Duration::from_secs(2u64.saturating_pow(attempt));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| TtsError::VendorUnreachable("no attempts made".to_string())))
    }

    async fn call_vendor(&self, text: &str, voice: &str) -> Result<Vec<u8>, TtsError> {
        let url = format!("https://api.elevenlabs.io/v1/text-to-speech/{voice}");
        let body = serde_json::json!({
            "text": text,
            "model_id": "eleven_multilingual_v2",
            "language_code": self.config.language,
        });

        let response = tokio::time::timeout(
            self.config.request_timeout,
            self.http
                .post(&url)
                .header("xi-api-key", &self.config.api_key)
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| TtsError::Timeout(self.config.request_timeout))?
        .map_err(|e| TtsError::VendorUnreachable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response
                .json::<VendorErrorBody>()
                .await
                .ok()
                .and_then(|b| b.message)
                .unwrap_or_else(|| status.to_string());
            return Err(TtsError::VendorError(message));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| TtsError::VendorUnreachable(e.to_string()))
    }

    /// Cheap vendor reachability probe for `/health` (§6.1), bounded by a
    /// short timeout so a dead vendor never blocks the liveness check.
    pub async fn health_check(&self) -> bool {
        let probe = self
            .http
            .get("https://api.elevenlabs.io/v1/voices")
            .header("xi-api-key", &self.config.api_key)
            .send();
        matches!(
            tokio::time::timeout(self.config.health_check_timeout, probe).await,
            Ok(Ok(resp)) if resp.status().is_success()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> TtsEngine {
        TtsEngine::new(crate::config::Config::for_tests().tts, None)
    }

    #[test]
    fn synthesize_request_defaults_allow_cache() {
        let req = SynthesizeRequest::new("hello");
        assert!(req.allow_cache);
        assert!(!req.priority);
        assert!(req.voice.is_none());
    }

    #[tokio::test]
    async fn synthesize_falls_back_when_vendor_unreachable() {
        // config.rs `for_tests()` points at a non-routable vendor URL
        // implicitly via an invalid key against the real ElevenLabs host,
        // but we don't make network calls in unit tests; exercise the
        // retry/fallback bookkeeping using a deliberately short timeout so
        // the whole path resolves quickly under test.
        let engine = engine();
        let result = engine
            .synthesize_with_retry("unreachable from a unit test sandbox", "missing-voice-id")
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn counters_start_at_zero() {
        let engine = engine();
        let snap = engine.counters().snapshot();
        assert_eq!(snap.requests, 0);
    }
}
