//! Integration test for `CallOrchestrator` webhook/markup handling
//!
//! Exercises the orchestrator purely through its public surface, the way
//! an axum handler would. Deliberately avoids `initiate()` here: placing a
//! call reaches out to the carrier's real REST API, which this test suite
//! has no business depending on.

use std::sync::Arc;

use dunning_call_core::audio_store::AudioStore;
use dunning_call_core::carrier::CarrierClient;
use dunning_call_core::config::Config;
use dunning_call_core::dialog::classifier::Classifier;
use dunning_call_core::dialog::script_table::ScriptTable;
use dunning_call_core::orchestrator::CallOrchestrator;
use dunning_call_core::persistence::{CallStore, ClientStore, InMemoryCallStore, InMemoryClientStore};
use dunning_call_core::phrase_cache::PhraseCache;
use dunning_call_core::types::{CallId, Client, TerminalReason};
use dunning_call_core::voice::stt::SttEngine;
use dunning_call_core::voice::tts::TtsEngine;

fn test_orchestrator() -> Arc<CallOrchestrator> {
    let config = Arc::new(Config::for_tests());

    let call_store: Arc<dyn CallStore> = Arc::new(InMemoryCallStore::new());

    let client_store = InMemoryClientStore::new();
    client_store.seed(Client {
        id: "c1".to_string(),
        name: "Ivan Petrov".to_string(),
        phone: "+70000000000".to_string(),
        debt_amount: 50_000.0,
        company: "Acme Collections".to_string(),
        contract_ref: "K-123".to_string(),
        partial_payment_offer: None,
    });
    let client_store: Arc<dyn ClientStore> = Arc::new(client_store);

    let carrier = Arc::new(CarrierClient::new(config.carrier.clone()));
    let audio_dir = tempfile::tempdir().unwrap();
    let audio_store = Arc::new(AudioStore::new(audio_dir.path(), config.server.server_url.clone()).unwrap());
    let phrase_cache = Arc::new(PhraseCache::new(audio_store.clone(), 32));
    let tts = Arc::new(TtsEngine::new(config.tts.clone(), Some(phrase_cache.clone())));
    let stt = Arc::new(SttEngine::new(config.stt.clone()));
    let classifier = Arc::new(Classifier::new(config.llm.api_key.clone(), config.llm.response_timeout));
    let script_table = Arc::new(ScriptTable::empty());

    CallOrchestrator::new(
        config,
        call_store,
        client_store,
        carrier,
        audio_store,
        phrase_cache,
        tts,
        stt,
        classifier,
        script_table,
    )
}

#[tokio::test]
async fn health_snapshot_reflects_no_active_calls_on_a_fresh_orchestrator() {
    let orchestrator = test_orchestrator();

    assert!(orchestrator.active_call_ids().is_empty());

    let health = orchestrator.health_snapshot();
    assert_eq!(health.active_calls, 0);
    assert_eq!(health.stt_queue_depth, 0);
    assert_eq!(health.llm_queue_depth, 0);
    assert_eq!(health.generate_queue_depth, 0);
    assert_eq!(health.tts_queue_depth, 0);
}

#[tokio::test]
async fn markup_request_for_unknown_call_returns_safe_error_markup() {
    let orchestrator = test_orchestrator();
    let markup = orchestrator.handle_markup_request(CallId::new_v4()).await;
    let xml = markup.render();
    assert!(xml.contains("<Say"));
    assert!(xml.contains("<Hangup"));
}

#[tokio::test]
async fn status_update_for_unknown_call_is_ignored_without_panicking() {
    let orchestrator = test_orchestrator();
    orchestrator.handle_status_update(CallId::new_v4(), "completed").await;
    assert!(orchestrator.active_call_ids().is_empty());
}

#[tokio::test]
async fn status_update_with_unrecognized_carrier_status_is_ignored() {
    let orchestrator = test_orchestrator();
    orchestrator.handle_status_update(CallId::new_v4(), "not-a-real-status").await;
    assert!(orchestrator.active_call_ids().is_empty());
}

#[tokio::test]
async fn ending_an_untracked_call_is_a_harmless_no_op() {
    let orchestrator = test_orchestrator();
    orchestrator.end(CallId::new_v4(), TerminalReason::HangUp).await;
    assert!(orchestrator.active_call_ids().is_empty());
}
