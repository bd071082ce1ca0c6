//! Device-facing server
//!
//! One WebSocket endpoint carries the session protocol; a pair of thin HTTP
//! routes covers liveness and device provisioning. Everything a connection
//! needs hangs off [`GatewayState`].

mod connection;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::asr::Recognition;
use crate::config::Config;
use crate::llm::ChatClient;
use crate::orchestrator::Orchestrator;
use crate::session::SessionRegistry;
use crate::tts::SynthesisClient;
use crate::wake::WakeWordGate;
use crate::Result;

/// Shared state for all connections and routes
pub struct GatewayState {
    /// Loaded configuration
    pub config: Config,
    /// Session registry, the single source of truth for live devices
    pub registry: SessionRegistry,
    /// Recognition provider facade
    pub recognition: Recognition,
    /// Response turn orchestrator
    pub orchestrator: Orchestrator,
    /// Wake-word gate over recognized text
    pub wake: WakeWordGate,
}

impl GatewayState {
    /// Assemble the gateway from configuration
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = SessionRegistry::new(config.audio.clone(), config.server.max_sessions);
        let recognition = Recognition::from_config(&config.recognition);
        let orchestrator = Orchestrator::new(
            Box::new(ChatClient::new(config.chat.clone())),
            Box::new(SynthesisClient::new(config.synthesis.clone())),
        );
        let wake = WakeWordGate::new(config.wake_words.clone());

        if !recognition.is_configured() {
            tracing::warn!("recognition backend not credentialed, running degraded");
        }

        Self {
            config,
            registry,
            recognition,
            orchestrator,
            wake,
        }
    }
}

/// Build the gateway router
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/lantern/v1/", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .route("/api/ota", get(ota))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind the listener and serve until a shutdown signal
///
/// # Errors
///
/// Returns error if the listener cannot bind — the only process-fatal
/// condition in this crate.
pub async fn serve(config: Config) -> Result<()> {
    let state = Arc::new(GatewayState::new(config));
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "lantern gateway listening");

    let sweep_state = Arc::clone(&state);
    let sweeper = tokio::spawn(async move {
        let horizon = chrono::Duration::from_std(sweep_state.config.server.session_idle)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let evicted = sweep_state.registry.sweep_idle(horizon);
            if evicted > 0 {
                tracing::info!(evicted, "idle session sweep");
            }
        }
    });

    let result = axum::serve(listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal())
        .await;
    sweeper.abort();

    result?;
    let drained = state.registry.drain();
    tracing::info!(sessions = drained, "gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

/// Handle WebSocket upgrade for a device connection
async fn ws_upgrade(State(state): State<Arc<GatewayState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state))
}

/// Liveness probe with session and counter visibility
async fn healthz(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.registry.len(),
        "recognition_configured": state.recognition.is_configured(),
    }))
}

/// Device provisioning document
///
/// Points the device at the WebSocket endpoint and advertises the current
/// firmware version. OTA payload delivery itself happens elsewhere.
async fn ota(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "websocket": {
            "url": state.config.server.advertised_ws_url,
        },
        "firmware": {
            "version": state.config.server.firmware_version,
        },
        "server_time": {
            "timestamp": chrono::Utc::now().timestamp_millis(),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_assembles_from_default_config() {
        let state = GatewayState::new(Config::default());
        assert!(state.registry.is_empty());
        assert!(!state.recognition.is_configured());
        assert!(!state.wake.words().is_empty());
    }
}
