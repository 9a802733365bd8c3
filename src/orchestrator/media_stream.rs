//! Realtime media-stream handler (§4.11)
//!
//! Terminates the `/media-stream/{call-id}` WebSocket the carrier opens
//! when a call wants duplex audio instead of record-then-webhook turns.
//! Frames arrive as JSON envelopes carrying base64 mu-law payloads (the
//! shape Twilio's Media Streams protocol uses); the call id rides in the
//! WebSocket's own URL path rather than the carrier's `start` event (that
//! event only carries the carrier's own call SID, not ours). Each stream
//! gets its own [`crate::voice::vad::VoiceActivityDetector`], and a
//! completed utterance is handed to an [`UtteranceSink`] rather than
//! directly to [`crate::orchestrator::CallOrchestrator`] — this narrow
//! trait is what keeps the media-stream module from depending on the
//! orchestrator's concrete type, breaking what would otherwise be a
//! cyclic dependency between the two (§3 Design Notes).

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::VadConfig;
use crate::types::CallId;
use crate::voice::vad::VoiceActivityDetector;

/// 8kHz μ-law, one byte per sample: 160 bytes is exactly 20ms, the frame
/// size Twilio's Media Streams protocol expects per outbound `media` event.
const MULAW_FRAME_BYTES: usize = 160;

/// Narrow interface the media-stream handler hands completed utterances
/// to, and uses to check whether a call is still being tracked.
#[async_trait]
pub trait UtteranceSink: Send + Sync {
    async fn on_utterance(self: Arc<Self>, call_id: CallId, wav_blob: Vec<u8>);
    fn is_call_active(&self, call_id: CallId) -> bool;

    /// Register the channel a reply's synthesized audio (raw μ-law bytes)
    /// should be pushed down for this call, for the duration of the
    /// WebSocket connection.
    fn register_reply_sink(&self, call_id: CallId, sender: mpsc::UnboundedSender<Vec<u8>>);
    /// Drop the registration once the connection closes, so a later reply
    /// for this call id doesn't try to send down a dead channel.
    fn unregister_reply_sink(&self, call_id: CallId);
}

/// The subset of Twilio's Media Streams envelope this handler understands.
/// Unrecognized `event` values (e.g. `mark`) are ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
enum StreamEvent {
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "start")]
    Start { start: StreamStart },
    #[serde(rename = "media")]
    Media { media: StreamMedia },
    #[serde(rename = "stop")]
    Stop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamStart {
    #[serde(rename = "streamSid")]
    stream_sid: String,
}

#[derive(Debug, Deserialize)]
struct StreamMedia {
    payload: String,
}

/// One live `/media-stream/{call-id}` connection.
pub struct MediaStreamHandler {
    sink: Arc<dyn UtteranceSink>,
    vad: VoiceActivityDetector,
    stream_sid: Option<String>,
}

impl MediaStreamHandler {
    pub fn new(sink: Arc<dyn UtteranceSink>, vad_config: VadConfig) -> Self {
        Self {
            sink,
            vad: VoiceActivityDetector::new(vad_config.energy_threshold, vad_config.silence_timeout, vad_config.min_utterance),
            stream_sid: None,
        }
    }

    /// Drive one WebSocket connection to completion for the given call.
    /// Interleaves inbound carrier frames with outbound reply audio staged
    /// by [`crate::orchestrator::CallOrchestrator::process_utterance`]
    /// (§4.11 "streams the synthesized audio back as outbound media
    /// frames plus a trailing mark event").
    pub async fn run(mut self, call_id: CallId, mut socket: WebSocket) {
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.sink.register_reply_sink(call_id, reply_tx);

        loop {
            tokio::select! {
                incoming = socket.recv() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => self.handle_text_frame(call_id, &text).await,
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(call_id = %call_id, "media stream closed by carrier");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(call_id = %call_id, error = %e, "media stream recv error");
                            break;
                        }
                    }
                }
                reply = reply_rx.recv() => {
                    match reply {
                        Some(mulaw) => {
                            if self.send_reply_audio(call_id, &mut socket, mulaw).await.is_err() {
                                break;
                            }
                        }
                        None => {}
                    }
                }
            }
        }

        self.sink.unregister_reply_sink(call_id);
        debug!(call_id = %call_id, "media stream handler exiting");
    }

    async fn handle_text_frame(&mut self, call_id: CallId, text: &str) {
        let event: StreamEvent = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "malformed media-stream frame, ignoring");
                return;
            }
        };

        match event {
            StreamEvent::Start { start } => self.stream_sid = Some(start.stream_sid),
            StreamEvent::Connected | StreamEvent::Stop | StreamEvent::Other => {}
            StreamEvent::Media { media } => {
                if !self.sink.is_call_active(call_id) {
                    return;
                }
                let Ok(mulaw) = base64::engine::general_purpose::STANDARD.decode(&media.payload) else {
                    warn!(call_id = %call_id, "failed to base64-decode media-stream payload");
                    return;
                };
                if let Some(wav_blob) = self.vad.feed(&mulaw) {
                    let sink = self.sink.clone();
                    tokio::spawn(async move {
                        sink.on_utterance(call_id, wav_blob).await;
                    });
                }
            }
        }
    }

    /// Send one reply's μ-law audio as 20ms `media` frames followed by a
    /// trailing `mark` event, the shape Twilio expects for outbound audio
    /// on a Media Streams connection.
    async fn send_reply_audio(&self, call_id: CallId, socket: &mut WebSocket, mulaw: Vec<u8>) -> Result<(), axum::Error> {
        let stream_sid = self.stream_sid.clone().unwrap_or_default();
        for chunk in mulaw.chunks(MULAW_FRAME_BYTES) {
            let payload = base64::engine::general_purpose::STANDARD.encode(chunk);
            let frame = serde_json::json!({
                "event": "media",
                "streamSid": stream_sid,
                "media": { "payload": payload },
            });
            socket.send(Message::Text(frame.to_string())).await?;
        }
        let mark = serde_json::json!({
            "event": "mark",
            "streamSid": stream_sid,
            "mark": { "name": "reply-complete" },
        });
        socket.send(Message::Text(mark.to_string())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    struct RecordingSink {
        active: bool,
        received: Mutex<Vec<(CallId, usize)>>,
        called: AtomicBool,
    }

    #[async_trait]
    impl UtteranceSink for RecordingSink {
        async fn on_utterance(self: Arc<Self>, call_id: CallId, wav_blob: Vec<u8>) {
            self.called.store(true, Ordering::SeqCst);
            self.received.lock().await.push((call_id, wav_blob.len()));
        }

        fn is_call_active(&self, _call_id: CallId) -> bool {
            self.active
        }

        fn register_reply_sink(&self, _call_id: CallId, _sender: mpsc::UnboundedSender<Vec<u8>>) {}
        fn unregister_reply_sink(&self, _call_id: CallId) {}
    }

    #[tokio::test]
    async fn start_event_captures_stream_sid() {
        let sink = Arc::new(RecordingSink {
            active: true,
            received: Mutex::new(Vec::new()),
            called: AtomicBool::new(false),
        });
        let mut handler = MediaStreamHandler::new(sink, crate::config::Config::for_tests().vad);
        assert!(handler.stream_sid.is_none());
        handler
            .handle_text_frame(CallId::new_v4(), r#"{"event":"start","start":{"streamSid":"MZ123"}}"#)
            .await;
        assert_eq!(handler.stream_sid.as_deref(), Some("MZ123"));
    }

    #[tokio::test]
    async fn media_frame_for_inactive_call_is_dropped() {
        let sink = Arc::new(RecordingSink {
            active: false,
            received: Mutex::new(Vec::new()),
            called: AtomicBool::new(false),
        });
        let mut handler = MediaStreamHandler::new(sink.clone(), crate::config::Config::for_tests().vad);
        let payload = base64::engine::general_purpose::STANDARD.encode([0u8; 160]);
        handler
            .handle_text_frame(CallId::new_v4(), &format!(r#"{{"event":"media","media":{{"payload":"{payload}"}}}}"#))
            .await;
        assert!(!sink.called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unrecognized_event_is_ignored_without_panicking() {
        let sink = Arc::new(RecordingSink {
            active: true,
            received: Mutex::new(Vec::new()),
            called: AtomicBool::new(false),
        });
        let mut handler = MediaStreamHandler::new(sink, crate::config::Config::for_tests().vad);
        handler.handle_text_frame(CallId::new_v4(), r#"{"event":"mark","mark":{"name":"x"}}"#).await;
    }

    #[tokio::test]
    async fn malformed_json_is_ignored_without_panicking() {
        let sink = Arc::new(RecordingSink {
            active: true,
            received: Mutex::new(Vec::new()),
            called: AtomicBool::new(false),
        });
        let mut handler = MediaStreamHandler::new(sink, crate::config::Config::for_tests().vad);
        handler.handle_text_frame(CallId::new_v4(), "not json").await;
    }
}
