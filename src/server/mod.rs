//! Webhook/media-stream HTTP server (§6 EXTERNAL INTERFACES)
//!
//! Thin axum `Router` assembly over [`crate::orchestrator::CallOrchestrator`].
//! Every handler's actual logic lives in [`http`]; this module owns
//! [`AppState`], route wiring, CORS/trace layers, the `/media-stream`
//! WebSocket upgrade, and the graceful-shutdown sequence.

pub mod http;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::audio_store::AudioStore;
use crate::carrier::CarrierClient;
use crate::config::Config;
use crate::orchestrator::media_stream::MediaStreamHandler;
use crate::orchestrator::CallOrchestrator;
use crate::types::{CallId, TerminalReason};

/// Shared state handed into every axum handler via `with_state`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<CallOrchestrator>,
    pub audio_store: Arc<AudioStore>,
    pub carrier: Arc<CarrierClient>,
}

/// Assemble the router and serve it until a shutdown signal arrives,
/// then run the ordered shutdown sequence (§5 Cancellation & timeouts).
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", state.config.server.port).parse()?;

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/calls/client/{client_id}", post(http::initiate_call_handler))
        .route("/calls/bulk", post(http::bulk_initiate_handler))
        .route("/webhooks/twiml", post(http::twiml_no_id_handler))
        .route("/webhooks/twiml/{call_id}", post(http::twiml_handler))
        .route("/webhooks/continue/{call_id}", post(http::twiml_handler))
        .route("/webhooks/status/{call_id}", post(http::status_handler))
        .route("/webhooks/recording/{call_id}", post(http::recording_handler))
        .route("/webhooks/recording-status/{call_id}", post(http::recording_status_handler))
        .route("/media-stream", get(media_stream_handler))
        .route("/audio/{*path}", get(http::audio_handler))
        .route("/health", get(http::health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    info!(%addr, "listening");
    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown(state).await;
    Ok(())
}

/// Resolves once the process receives SIGINT or (on unix) SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining active calls");
}

/// §5 ordered shutdown: end every call this process still tracks with
/// `reason=server_shutdown`, then return once the queues have had a
/// moment to drain.
async fn shutdown(state: AppState) {
    for call_id in state.orchestrator.active_call_ids() {
        state.orchestrator.end(call_id, TerminalReason::ServerShutdown).await;
    }
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    info!("shutdown complete");
}

#[derive(Debug, Deserialize)]
struct MediaStreamQuery {
    #[serde(rename = "callId")]
    call_id: Option<CallId>,
}

/// `GET /media-stream` (§6, §6.1): the call id rides in a `?callId=`
/// query parameter rather than the path, since the carrier's `start`
/// event only carries its own call SID, not ours.
async fn media_stream_handler(Query(query): Query<MediaStreamQuery>, State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let Some(call_id) = query.call_id else {
        warn!("media-stream connection without a callId query parameter, rejecting");
        return Response::builder()
            .status(axum::http::StatusCode::BAD_REQUEST)
            .body(axum::body::Body::from("missing callId"))
            .unwrap();
    };

    ws.on_upgrade(move |socket| async move {
        let handler = MediaStreamHandler::new(state.orchestrator.clone(), state.config.vad);
        handler.run(call_id, socket).await;
    })
}
