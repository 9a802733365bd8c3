//! `call-core` binary entry point
//!
//! Loads configuration, constructs the process-wide singletons (stores,
//! vendor engines, job queues via [`CallOrchestrator::new`]), and serves
//! the webhook/media-stream HTTP surface until a shutdown signal arrives.

use std::sync::Arc;

use dunning_call_core::audio_store::AudioStore;
use dunning_call_core::carrier::CarrierClient;
use dunning_call_core::config::Config;
use dunning_call_core::dialog::classifier::Classifier;
use dunning_call_core::dialog::script_table::ScriptTable;
use dunning_call_core::orchestrator::CallOrchestrator;
use dunning_call_core::persistence::{InMemoryCallStore, InMemoryClientStore};
use dunning_call_core::phrase_cache::PhraseCache;
use dunning_call_core::server::{self, AppState};
use dunning_call_core::voice::stt::SttEngine;
use dunning_call_core::voice::tts::TtsEngine;

const PHRASE_CACHE_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = Arc::new(Config::from_env()?);

    let audio_base = std::env::var("AUDIO_STORE_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| dirs::cache_dir().unwrap_or_else(std::env::temp_dir).join("dunning-call-core/audio"));
    let audio_store = Arc::new(AudioStore::new(audio_base, config.server.server_url.clone())?);
    let phrase_cache = Arc::new(PhraseCache::new(audio_store.clone(), PHRASE_CACHE_CAPACITY));

    let call_store: Arc<dyn dunning_call_core::persistence::CallStore> = Arc::new(InMemoryCallStore::new());
    let client_store: Arc<dyn dunning_call_core::persistence::ClientStore> = Arc::new(InMemoryClientStore::new());

    let carrier = Arc::new(CarrierClient::new(config.carrier.clone()));
    let tts = Arc::new(TtsEngine::new(config.tts.clone(), Some(phrase_cache.clone())));
    let stt = Arc::new(SttEngine::new(config.stt.clone()));
    let classifier = Arc::new(Classifier::new(config.llm.api_key.clone(), config.llm.response_timeout));

    let script_table = Arc::new(match &config.script_table_path {
        Some(path) => ScriptTable::watch(path.clone()).unwrap_or_else(|e| {
            tracing::warn!(path, error = %e, "failed to load script table, running with built-in rules only");
            ScriptTable::empty()
        }),
        None => ScriptTable::empty(),
    });

    let orchestrator = CallOrchestrator::new(
        config.clone(),
        call_store,
        client_store,
        carrier.clone(),
        audio_store.clone(),
        phrase_cache,
        tts,
        stt,
        classifier,
        script_table,
    );

    let purge_audio_store = audio_store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            if let Err(e) = purge_audio_store.purge_older_than(std::time::Duration::from_secs(3600)) {
                tracing::warn!(error = %e, "audio store purge sweep failed");
            }
        }
    });

    let state = AppState {
        config,
        orchestrator,
        audio_store,
        carrier,
    };

    server::serve(state).await
}
