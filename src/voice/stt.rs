//! Speech-to-text engine (C4)
//!
//! Transcribes a WAV-wrapped utterance through a cloud STT vendor
//! (Whisper-shaped REST API). Concurrency is bounded by the caller via the
//! STT job queue (§4.9), not here; this module only owns the vendor call,
//! its timeout, and its error taxonomy.

use serde::Deserialize;
use tracing::warn;

use crate::config::SttConfig;
use crate::error::SttError;
use crate::metrics::EngineCounters;

/// `transcribe(blob) -> {text, confidence, ms}` output (§4.4).
#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    pub text: String,
    pub confidence: f32,
    pub duration: std::time::Duration,
}

#[derive(Debug, Deserialize)]
struct VendorResponse {
    text: String,
    #[serde(default)]
    avg_logprob: Option<f32>,
}

pub struct SttEngine {
    http: reqwest::Client,
    config: SttConfig,
    counters: EngineCounters,
}

impl SttEngine {
    pub fn new(config: SttConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            counters: EngineCounters::new(),
        }
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    /// `transcribe(pcm-wav-blob) -> {text, confidence, ms}` (§4.4).
    pub async fn transcribe(&self, wav_blob: Vec<u8>) -> Result<TranscriptionResult, SttError> {
        self.counters.record_request();
        let duration = wav_duration(&wav_blob);

        let form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(wav_blob).file_name("utterance.wav"))
            .text("model", "whisper-1")
            .text("language", self.config.language.clone());

        let response = tokio::time::timeout(
            self.config.timeout,
            self.http
                .post("https://api.openai.com/v1/audio/transcriptions")
                .header("Authorization", format!("Bearer {}", self.config.api_key))
                .multipart(form)
                .send(),
        )
        .await
        .map_err(|_| {
            self.counters.record_error();
            SttError::Timeout(self.config.timeout)
        })?
        .map_err(|e| {
            self.counters.record_error();
            warn!(error = %e, "stt vendor unreachable");
            SttError::ServiceUnavailable(e.to_string())
        })?;

        if !response.status().is_success() {
            self.counters.record_error();
            return Err(SttError::VendorError(response.status().to_string()));
        }

        let body: VendorResponse = response.json().await.map_err(|e| {
            self.counters.record_error();
            SttError::VendorError(e.to_string())
        })?;

        // Whisper's `avg_logprob` is a log-probability in (-inf, 0]; map it
        // onto a 0..1 confidence heuristic rather than exposing the raw
        // vendor unit to callers.
        let confidence = body
            .avg_logprob
            .map(|lp| (lp.exp()).clamp(0.0, 1.0))
            .unwrap_or(0.8);

        Ok(TranscriptionResult {
            text: body.text,
            confidence,
            duration,
        })
    }
}

/// Length of the spoken utterance itself, derived from the WAV header's
/// sample count rather than the vendor round-trip time — the hallucination
/// guard and silence policy need actual speech duration, not HTTP latency.
/// Unparseable audio yields zero, which both downstream consumers treat as
/// "no speech detected".
fn wav_duration(wav_blob: &[u8]) -> std::time::Duration {
    match hound::WavReader::new(std::io::Cursor::new(wav_blob)) {
        Ok(reader) => {
            let spec = reader.spec();
            if spec.sample_rate == 0 {
                return std::time::Duration::ZERO;
            }
            std::time::Duration::from_secs_f64(reader.duration() as f64 / spec.sample_rate as f64)
        }
        Err(_) => std::time::Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_starts_with_zero_counters() {
        let engine = SttEngine::new(crate::config::Config::for_tests().stt);
        assert_eq!(engine.counters().snapshot().requests, 0);
    }

    #[test]
    fn wav_duration_reflects_sample_count_not_wallclock() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut buf, spec).unwrap();
            for _ in 0..4000 {
                writer.write_sample(0i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        let duration = wav_duration(&buf.into_inner());
        assert!((duration.as_secs_f64() - 0.5).abs() < 0.01);
    }

    #[test]
    fn wav_duration_of_garbage_bytes_is_zero() {
        assert_eq!(wav_duration(b"not a wav file"), std::time::Duration::ZERO);
    }

    #[tokio::test]
    async fn transcribe_times_out_against_unreachable_vendor() {
        let mut cfg = crate::config::Config::for_tests().stt;
        cfg.timeout = std::time::Duration::from_millis(1);
        let engine = SttEngine::new(cfg);
        let result = engine.transcribe(b"RIFF....WAVEfmt ".to_vec()).await;
        assert!(result.is_err());
        assert_eq!(engine.counters().snapshot().errors, 1);
    }
}
