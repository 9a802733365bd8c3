//! Shared error taxonomy
//!
//! Each engine gets its own `thiserror` enum so callers can match on the
//! taxonomy from spec §7 (transient external / degraded-content / permanent
//! configuration / protocol / fatal) without downcasting a boxed error.

use thiserror::Error;

/// Errors raised by [`crate::voice::tts::TtsEngine`].
#[derive(Debug, Error)]
pub enum TtsError {
    #[error("primary TTS vendor unreachable: {0}")]
    VendorUnreachable(String),
    #[error("primary TTS vendor returned an error response: {0}")]
    VendorError(String),
    #[error("TTS request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors raised by [`crate::voice::stt::SttEngine`].
#[derive(Debug, Error)]
pub enum SttError {
    #[error("STT vendor unreachable: {0}")]
    ServiceUnavailable(String),
    #[error("STT vendor returned an error response: {0}")]
    VendorError(String),
    #[error("STT request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors raised by the classify/respond LLM job.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("LLM vendor unreachable: {0}")]
    ServiceUnavailable(String),
    #[error("LLM response could not be parsed: {0}")]
    BadResponse(String),
}

/// Errors raised by [`crate::queue::JobQueue`].
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job exceeded its maximum attempts ({0})")]
    MaxAttemptsExceeded(u32),
    #[error("job queue is shutting down")]
    ShuttingDown,
    #[error("job was cancelled before completion")]
    Cancelled,
}

/// Permanent-configuration errors surfaced at startup or on initiate.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for environment variable {name}: {value}")]
    InvalidEnvVar { name: String, value: String },
}

/// Top-level error type for the call core, composing the per-engine enums.
///
/// Binaries and tests use `anyhow::Result`; within the library, call sites
/// that need to branch on the taxonomy match on these variants directly.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid client id: {0}")]
    InvalidClientId(String),
    #[error("client not found: {0}")]
    ClientNotFound(String),
    #[error("call not found: {0}")]
    CallNotFound(String),
    #[error(transparent)]
    Tts(#[from] TtsError),
    #[error(transparent)]
    Stt(#[from] SttError),
    #[error(transparent)]
    Classify(#[from] ClassifyError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("carrier API error: {0}")]
    Carrier(String),
    #[error("malformed webhook payload: {0}")]
    MalformedWebhook(String),
}

impl CoreError {
    /// Whether this error should be surfaced to an API caller as a 4xx
    /// (client-caused) rather than a 5xx (server/vendor-caused) response.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidClientId(_) | CoreError::ClientNotFound(_) | CoreError::CallNotFound(_)
        )
    }
}
