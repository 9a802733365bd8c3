//! Outbound voice-call core for goal-directed debt-collection dialog
//!
//! Telephony webhooks, a streaming voice-activity detector, the
//! STT/LLM/TTS vendor pipelines behind a bounded job queue, and the
//! per-call dialog state machine that drives what the agent says next.
//! See `SPEC_FULL.md` for the full component design.

pub mod audio_store;
pub mod carrier;
pub mod config;
pub mod dialog;
pub mod error;
pub mod markup;
pub mod metrics;
pub mod orchestrator;
pub mod persistence;
pub mod phrase_cache;
pub mod queue;
pub mod server;
pub mod types;
pub mod voice;

pub use config::Config;
pub use error::CoreError;
pub use orchestrator::CallOrchestrator;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
