//! Configuration management
//!
//! A single [`Config`] struct loaded once from environment variables and
//! passed by `Arc` into every service constructor (no singletons — see
//! Design Notes in SPEC_FULL.md). Required keys are validated eagerly so a
//! misconfigured deploy fails fast at startup (§7 "Permanent configuration").

use std::time::Duration;

use crate::error::ConfigError;

/// Top-level configuration, assembled from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub carrier: CarrierConfig,
    pub stt: SttConfig,
    pub tts: TtsConfig,
    pub llm: LlmConfig,
    pub vad: VadConfig,
    pub queues: QueueConfig,
    pub persistence: PersistenceConfig,
    /// Path to the hot-reloadable YAML script table (§4.6); `None` runs
    /// with [`crate::dialog::script_table::ScriptTable::empty`], so every
    /// turn falls through to the built-in literal rules.
    pub script_table_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Public base URL this process is reachable at, used to build webhook
    /// and audio-retrieval URLs handed to the carrier.
    pub server_url: String,
}

#[derive(Debug, Clone)]
pub struct CarrierConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    /// Shared secret used to verify inbound webhook signatures. `None`
    /// disables verification (local development only).
    pub webhook_signing_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SttConfig {
    pub api_key: String,
    pub language: String,
    /// Upper bound on concurrent in-flight transcribe calls (§4.4).
    pub parallelism: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub api_key: String,
    pub voice_id: String,
    pub fallback_voice_id: String,
    pub language: String,
    pub max_attempts: u32,
    pub request_timeout: Duration,
    pub health_check_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub max_response_tokens: u32,
    pub max_response_length: usize,
    pub response_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    pub energy_threshold: f32,
    pub silence_timeout: Duration,
    pub min_utterance: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub stt_concurrency: usize,
    pub llm_concurrency: usize,
    pub tts_concurrency: usize,
    /// Upper bound on concurrent in-flight "generated"-reply LLM calls
    /// (§4.6 C6, distinct from `llm_concurrency`'s classify-only calls).
    pub generate_concurrency: usize,
    pub default_max_attempts: u32,
    /// Aggregate waiting-depth threshold above which a backpressure
    /// warning is logged (§5 Backpressure).
    pub warn_depth: usize,
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Accepted for forward-compatibility; not wired to a live driver in
    /// this core (persistence CRUD is out of scope — see SPEC_FULL.md §1.1).
    pub mongodb_url: Option<String>,
    pub redis_url: Option<String>,
}

fn env_var(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

fn env_var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from the process environment, failing fast on
    /// missing required keys.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = env_parse_or("PORT", 3000u16);
        let server_url = env_var_or("SERVER_URL", "http://localhost:3000");

        let carrier = CarrierConfig {
            account_sid: env_var("TWILIO_ACCOUNT_SID")?,
            auth_token: env_var("TWILIO_AUTH_TOKEN")?,
            from_number: env_var("TWILIO_FROM_NUMBER")?,
            webhook_signing_key: std::env::var("TWILIO_AUTH_TOKEN").ok(),
        };

        let stt = SttConfig {
            api_key: env_var("OPENAI_API_KEY")?,
            language: env_var_or("STT_LANGUAGE", "ru"),
            parallelism: env_parse_or("STT_PARALLELISM", 5usize),
            timeout: Duration::from_secs(env_parse_or("STT_TIMEOUT_SECS", 15u64)),
        };

        let tts = TtsConfig {
            api_key: env_var("ELEVENLABS_API_KEY")?,
            voice_id: env_var_or("TTS_VOICE_ID", "default"),
            fallback_voice_id: env_var_or("TTS_FALLBACK_VOICE_ID", "alice"),
            language: env_var_or("TTS_LANGUAGE", "ru-RU"),
            max_attempts: env_parse_or("TTS_MAX_ATTEMPTS", 3u32),
            request_timeout: Duration::from_secs(15),
            health_check_timeout: Duration::from_secs(5),
        };

        let llm = LlmConfig {
            api_key: env_var("OPENAI_API_KEY")?,
            max_response_tokens: env_parse_or("GPT_MAX_RESPONSE_TOKENS", 150u32),
            max_response_length: env_parse_or("MAX_RESPONSE_LENGTH", 200usize),
            response_timeout: Duration::from_secs(15),
        };

        let vad = VadConfig {
            energy_threshold: env_parse_or("VAD_THRESHOLD", 0.03f32),
            silence_timeout: Duration::from_millis(env_parse_or("SILENCE_TIMEOUT", 1500u64)),
            min_utterance: Duration::from_millis(500),
        };

        let queues = QueueConfig {
            stt_concurrency: env_parse_or("STT_QUEUE_CONCURRENCY", 5usize),
            llm_concurrency: env_parse_or("LLM_QUEUE_CONCURRENCY", 3usize),
            tts_concurrency: env_parse_or("TTS_QUEUE_CONCURRENCY", 3usize),
            generate_concurrency: env_parse_or("GENERATE_QUEUE_CONCURRENCY", 2usize),
            default_max_attempts: 3,
            warn_depth: 10,
        };

        let persistence = PersistenceConfig {
            mongodb_url: std::env::var("MONGODB_URL").ok(),
            redis_url: std::env::var("REDIS_URL").ok(),
        };

        let script_table_path = std::env::var("SCRIPT_TABLE_PATH").ok();

        Ok(Self {
            server: ServerConfig { port, server_url },
            carrier,
            stt,
            tts,
            llm,
            vad,
            queues,
            persistence,
            script_table_path,
        })
    }

    /// Build a config for tests: no real vendor keys, short timeouts,
    /// localhost URLs. Never reads the environment.
    pub fn for_tests() -> Self {
        Self {
            server: ServerConfig {
                port: 0,
                server_url: "http://localhost:0".to_string(),
            },
            carrier: CarrierConfig {
                account_sid: "ACtest".to_string(),
                auth_token: "test-token".to_string(),
                from_number: "+10000000000".to_string(),
                webhook_signing_key: None,
            },
            stt: SttConfig {
                api_key: "test".to_string(),
                language: "ru".to_string(),
                parallelism: 2,
                timeout: Duration::from_millis(200),
            },
            tts: TtsConfig {
                api_key: "test".to_string(),
                voice_id: "default".to_string(),
                fallback_voice_id: "alice".to_string(),
                language: "ru-RU".to_string(),
                max_attempts: 2,
                request_timeout: Duration::from_millis(200),
                health_check_timeout: Duration::from_millis(100),
            },
            llm: LlmConfig {
                api_key: "test".to_string(),
                max_response_tokens: 150,
                max_response_length: 200,
                response_timeout: Duration::from_millis(200),
            },
            vad: VadConfig {
                energy_threshold: 0.03,
                silence_timeout: Duration::from_millis(1500),
                min_utterance: Duration::from_millis(500),
            },
            queues: QueueConfig {
                stt_concurrency: 2,
                llm_concurrency: 2,
                tts_concurrency: 2,
                generate_concurrency: 2,
                default_max_attempts: 2,
                warn_depth: 10,
            },
            persistence: PersistenceConfig {
                mongodb_url: None,
                redis_url: None,
            },
            script_table_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_has_short_timeouts() {
        let cfg = Config::for_tests();
        assert!(cfg.stt.timeout < Duration::from_secs(1));
        assert_eq!(cfg.queues.default_max_attempts, 2);
    }
}
