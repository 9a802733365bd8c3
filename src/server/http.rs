//! HTTP/webhook handlers (§6, §6.1 EXTERNAL INTERFACES)
//!
//! Each handler is a thin adapter between axum's extractors and
//! [`crate::orchestrator::CallOrchestrator`]; all actual dialog/telephony
//! logic lives in the orchestrator.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Form, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::error::CoreError;
use crate::markup::MarkupResponse;
use crate::server::AppState;
use crate::types::CallId;

const TWILIO_SIGNATURE_HEADER: &str = "X-Twilio-Signature";

fn markup_response(markup: MarkupResponse) -> Response {
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/xml")], markup.render()).into_response()
}

fn core_error_response(err: CoreError) -> Response {
    let status = if err.is_client_fault() { StatusCode::BAD_REQUEST } else { StatusCode::INTERNAL_SERVER_ERROR };
    let status = match &err {
        CoreError::ClientNotFound(_) | CoreError::CallNotFound(_) => StatusCode::NOT_FOUND,
        _ => status,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

/// Reconstruct the full webhook URL the carrier originally signed, so
/// [`crate::carrier::CarrierClient::verify_signature`] can recompute the
/// same HMAC. Assumes this process is reachable at `server.server_url`
/// (the value handed to the carrier when the call was placed).
fn webhook_url(state: &AppState, path: &str) -> String {
    format!("{}{}", state.config.server.server_url.trim_end_matches('/'), path)
}

fn verify_webhook(state: &AppState, url: &str, form: &HashMap<String, String>, headers: &HeaderMap) -> bool {
    let signature = headers.get(TWILIO_SIGNATURE_HEADER).and_then(|v| v.to_str().ok()).unwrap_or("");
    let params: Vec<(String, String)> = form.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    state.carrier.verify_signature(url, &params, signature)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct InitiateResponse {
    call_id: CallId,
    carrier_sid: String,
    client_name: String,
    phone: String,
    status: crate::types::CallStatus,
}

/// `POST /calls/client/{clientId}` (§6 Initiate API).
pub async fn initiate_call_handler(State(state): State<AppState>, Path(client_id): Path<String>) -> Response {
    match state.orchestrator.initiate(&client_id).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(InitiateResponse {
                call_id: outcome.call_id,
                carrier_sid: outcome.carrier_sid,
                client_name: outcome.client_name,
                phone: outcome.phone,
                status: outcome.status,
            }),
        )
            .into_response(),
        Err(e) => {
            warn!(client_id, error = %e, "failed to initiate call");
            core_error_response(e)
        }
    }
}

#[derive(Debug, Deserialize)]
struct BulkInitiateRequest {
    client_ids: Vec<String>,
    #[serde(default)]
    delay_ms: u64,
}

/// `POST /calls/bulk` (§6.1): sequences `initiate` calls over a single
/// background task with an inter-call delay, rather than blocking the
/// HTTP response on every call in the batch.
pub async fn bulk_initiate_handler(State(state): State<AppState>, Json(req): Json<BulkInitiateRequest>) -> Response {
    let accepted = req.client_ids.len();
    let delay = Duration::from_millis(req.delay_ms);

    tokio::spawn(async move {
        for (index, client_id) in req.client_ids.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = state.orchestrator.initiate(&client_id).await {
                warn!(client_id, error = %e, "bulk initiate: call failed");
            }
        }
    });

    (StatusCode::ACCEPTED, Json(json!({ "accepted": accepted }))).into_response()
}

/// `POST /webhooks/twiml` (no call id): the orchestrator cannot act
/// without a call id, so this responds with the safe terminal-error
/// markup rather than attempting to dispatch (§7 Protocol errors).
pub async fn twiml_no_id_handler() -> Response {
    warn!("twiml webhook hit without a call id");
    markup_response(MarkupResponse::error("Внутренняя ошибка, попробуйте позже.", "alice", "ru-RU"))
}

/// `POST /webhooks/twiml/{callId}` and `POST /webhooks/continue/{callId}`
/// (§6): both dispatch identically to the markup responder.
pub async fn twiml_handler(State(state): State<AppState>, Path(call_id): Path<CallId>) -> Response {
    markup_response(state.orchestrator.handle_markup_request(call_id).await)
}

#[derive(Debug, Deserialize)]
struct StatusForm {
    #[serde(rename = "CallStatus")]
    call_status: String,
}

/// `POST /webhooks/status/{callId}` (§6): body keys `CallStatus, CallSid,
/// CallDuration, SipResponseCode`.
pub async fn status_handler(
    State(state): State<AppState>,
    Path(call_id): Path<CallId>,
    headers: HeaderMap,
    Form(raw): Form<HashMap<String, String>>,
) -> Response {
    let url = webhook_url(&state, &format!("/webhooks/status/{call_id}"));
    if !verify_webhook(&state, &url, &raw, &headers) {
        warn!(%call_id, "status webhook failed signature verification");
        return StatusCode::FORBIDDEN.into_response();
    }
    let Some(form) = parse_form::<StatusForm>(&raw) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    state.orchestrator.handle_status_update(call_id, &form.call_status).await;
    StatusCode::OK.into_response()
}

#[derive(Debug, Deserialize)]
struct RecordingForm {
    #[serde(rename = "RecordingUrl")]
    recording_url: String,
    #[serde(rename = "Digits", default)]
    digits: Option<String>,
}

/// `POST /webhooks/recording/{callId}` (§6): body keys `RecordingUrl,
/// RecordingDuration, Digits`.
pub async fn recording_handler(
    State(state): State<AppState>,
    Path(call_id): Path<CallId>,
    headers: HeaderMap,
    Form(raw): Form<HashMap<String, String>>,
) -> Response {
    let url = webhook_url(&state, &format!("/webhooks/recording/{call_id}"));
    if !verify_webhook(&state, &url, &raw, &headers) {
        warn!(%call_id, "recording webhook failed signature verification");
        return StatusCode::FORBIDDEN.into_response();
    }
    let Some(form) = parse_form::<RecordingForm>(&raw) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let markup = state.orchestrator.handle_recording_available(call_id, form.recording_url, form.digits).await;
    markup_response(markup)
}

#[derive(Debug, Deserialize)]
struct RecordingStatusForm {
    #[serde(rename = "RecordingStatus")]
    recording_status: String,
    #[serde(rename = "RecordingSid", default)]
    recording_sid: Option<String>,
}

/// `POST /webhooks/recording-status/{callId}` (§6): body keys
/// `RecordingStatus, RecordingSid, RecordingUrl`.
pub async fn recording_status_handler(
    State(state): State<AppState>,
    Path(call_id): Path<CallId>,
    headers: HeaderMap,
    Form(raw): Form<HashMap<String, String>>,
) -> Response {
    let url = webhook_url(&state, &format!("/webhooks/recording-status/{call_id}"));
    if !verify_webhook(&state, &url, &raw, &headers) {
        warn!(%call_id, "recording-status webhook failed signature verification");
        return StatusCode::FORBIDDEN.into_response();
    }
    let Some(form) = parse_form::<RecordingStatusForm>(&raw) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    state.orchestrator.handle_recording_status(call_id, form.recording_status, form.recording_sid).await;
    StatusCode::OK.into_response()
}

/// Re-deserialize a generic form map into a concrete struct; lets every
/// handler verify the signature against the raw map before committing to
/// a typed shape.
fn parse_form<T: serde::de::DeserializeOwned>(raw: &HashMap<String, String>) -> Option<T> {
    serde_json::from_value(serde_json::to_value(raw).ok()?).ok()
}

/// `GET /audio/{*path}` (§6.1): thin static responder over
/// [`crate::audio_store::AudioStore`]'s `temp/` and `cache/` subtrees.
pub async fn audio_handler(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    match state.audio_store.read(&path) {
        Ok(bytes) => (StatusCode::OK, [(header::CONTENT_TYPE, "audio/wav")], bytes).into_response(),
        Err(e) => {
            warn!(path, error = %e, "audio lookup failed");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// `GET /health` (§6.1): liveness/readiness probe returning queue depths
/// and worker-pool occupancy, in the teacher's `status_handler` idiom.
pub async fn health_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.orchestrator.health_snapshot();
    (StatusCode::OK, Json(json!({ "status": "ok", "health": snapshot }))).into_response()
}
