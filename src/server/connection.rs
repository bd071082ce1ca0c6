//! Per-connection protocol state machine
//!
//! One task per device connection. Control frames are JSON and dispatched by
//! message type; anything binary is audio and goes to the session's buffer,
//! never treated as a protocol error. Control handling for a session is
//! strictly ordered (it runs on this connection's receive loop), while
//! recognition and response turns run on a side task that the next abort or
//! teardown cancels.

use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::GatewayState;
use crate::asr::RecognitionResult;
use crate::audio::{AudioChunk, VadEdge};
use crate::protocol::{
    ABORT_WAKE_WORD, AudioParams, Frame, Inbound, ListenMode, ListenState, Outbound,
};
use crate::session::{DeviceHints, SessionHandle};

/// Protocol version this server speaks
const PROTOCOL_VERSION: u32 = 1;

/// Transport name devices are expected to announce
const TRANSPORT: &str = "websocket";

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Handshaking,
    Active,
    Closing,
    Closed,
}

/// The in-flight recognition/response task for a session; a new dispatch or
/// an abort replaces and cancels the previous one
type PipelineSlot = Arc<Mutex<Option<JoinHandle<()>>>>;

/// Handle one device socket from accept to teardown
pub(super) async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let (mut sender, mut receiver) = socket.split();

    let session = match state.registry.create() {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(error = %e, "rejecting connection");
            let rejection = Outbound::Error {
                session_id: None,
                message: e.to_string(),
            };
            if let Ok(text) = serde_json::to_string(&rejection) {
                let _ = sender.send(Message::Text(text.into())).await;
            }
            return;
        }
    };
    let connection_id = session.connection_id.clone();
    tracing::info!(connection_id, "device connected");

    let (tx, mut rx) = mpsc::channel::<Frame>(64);

    // Forward outbound frames to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                Frame::Control(control) => match serde_json::to_string(&control) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        tracing::error!(error = %e, "unserializable outbound frame");
                        continue;
                    }
                },
                Frame::Audio(audio) => Message::Binary(audio.into()),
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut conn = Connection {
        state: Arc::clone(&state),
        session: Arc::clone(&session),
        tx: tx.clone(),
        conn_state: ConnState::Connecting,
        pipeline: Arc::new(Mutex::new(None)),
    };
    let pipeline = Arc::clone(&conn.pipeline);

    // Transport accepted: acknowledge with the connection id
    let ack = Outbound::Ack {
        connection_id: connection_id.clone(),
    };
    if tx.send(Frame::Control(ack)).await.is_err() {
        state.registry.remove(&connection_id);
        send_task.abort();
        return;
    }
    conn.transition(ConnState::Handshaking);

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => conn.handle_control(&text).await,
                Message::Binary(data) => conn.handle_audio(&data),
                Message::Close(_) => {
                    tracing::info!(connection_id = %conn.session.connection_id, "closed by device");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
        conn.shutdown();
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Teardown is idempotent; this also covers the aborted-receive path
    abort_pipeline(&pipeline);
    state.registry.remove(&connection_id);
    tracing::info!(connection_id, "device disconnected");
}

fn abort_pipeline(pipeline: &PipelineSlot) {
    let task = pipeline
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .take();
    if let Some(task) = task {
        task.abort();
    }
}

struct Connection {
    state: Arc<GatewayState>,
    session: Arc<SessionHandle>,
    tx: mpsc::Sender<Frame>,
    conn_state: ConnState,
    pipeline: PipelineSlot,
}

impl Connection {
    fn transition(&mut self, to: ConnState) {
        tracing::debug!(
            connection_id = %self.session.connection_id,
            from = ?self.conn_state,
            to = ?to,
            "connection state"
        );
        self.conn_state = to;
    }

    async fn send(&self, outbound: Outbound) {
        let _ = self.tx.send(Frame::Control(outbound)).await;
    }

    async fn protocol_error(&self, session_id: Option<String>, message: String) {
        tracing::warn!(
            connection_id = %self.session.connection_id,
            message = %message,
            "protocol error"
        );
        self.send(Outbound::Error { session_id, message }).await;
    }

    /// Dispatch one JSON control frame
    async fn handle_control(&mut self, text: &str) {
        let inbound: Inbound = match serde_json::from_str(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                // Parseable-as-JSON-but-malformed: structured error, stay open
                self.protocol_error(self.session.session_id(), format!("invalid message: {e}"))
                    .await;
                return;
            }
        };
        self.session.touch();

        match inbound {
            Inbound::Hello {
                version,
                transport,
                audio_params,
                device_id,
                device_name,
                device_mac,
            } => {
                self.handle_hello(
                    version,
                    transport,
                    audio_params,
                    DeviceHints {
                        device_id,
                        device_name,
                        device_mac,
                    },
                )
                .await;
            }
            Inbound::Listen {
                session_id,
                state,
                mode,
                text,
            } => {
                self.handle_listen(&session_id, state, mode, text).await;
            }
            Inbound::Abort { session_id, reason } => {
                self.handle_abort(&session_id, reason.as_deref()).await;
            }
            Inbound::Chat { session_id, text, state } => {
                if state.as_deref().is_some_and(|s| s != "complete") {
                    tracing::debug!(state = ?state, "partial chat submission");
                }
                let Some(_handle) = self.resolve_own(&session_id).await else {
                    return;
                };
                self.dispatch_turn(session_id, text);
            }
            Inbound::Iot {
                session_id,
                descriptors,
                states,
            } => {
                // Capability/state reports are forwarded to the device
                // manager; here they are validated and retained
                if let Some(session_id) = session_id {
                    let Some(handle) = self.resolve_own(&session_id).await else {
                        return;
                    };
                    if let Some(descriptors) = descriptors {
                        tracing::debug!(session_id, ?descriptors, "device descriptors");
                    }
                    if let Some(states) = states {
                        handle.record_iot_states(states);
                    }
                } else {
                    tracing::debug!("iot report without session id");
                }
            }
            Inbound::Unknown => {
                tracing::info!(
                    connection_id = %self.session.connection_id,
                    "ignoring unknown message type"
                );
            }
        }
    }

    async fn handle_hello(
        &mut self,
        version: Option<u32>,
        transport: Option<String>,
        audio_params: Option<AudioParams>,
        hints: DeviceHints,
    ) {
        // Field devices are observed to omit or mangle these fields; accept
        // and log rather than hard-reject
        if version != Some(PROTOCOL_VERSION) || transport.as_deref() != Some(TRANSPORT) {
            tracing::warn!(
                connection_id = %self.session.connection_id,
                ?version,
                ?transport,
                "handshake version/transport anomaly, accepting anyway"
            );
        }

        match self
            .state
            .registry
            .authenticate(&self.session.connection_id, audio_params, hints)
        {
            Ok(session_id) => {
                tracing::info!(
                    connection_id = %self.session.connection_id,
                    session_id,
                    "handshake complete"
                );
                self.send(Outbound::Hello {
                    session_id,
                    transport: TRANSPORT.to_string(),
                    audio_params: self.state.config.audio.server_params.clone(),
                })
                .await;
                self.transition(ConnState::Active);
            }
            Err(e) => {
                self.protocol_error(None, format!("handshake failed: {e}")).await;
            }
        }
    }

    async fn handle_listen(
        &mut self,
        session_id: &str,
        listen_state: ListenState,
        mode: Option<ListenMode>,
        text: Option<String>,
    ) {
        let Some(handle) = self.resolve_own(session_id).await else {
            return;
        };
        if let Some(mode) = mode {
            handle.set_mode(mode);
        }

        match listen_state {
            ListenState::Start => {
                handle.set_voice_active(true);
            }
            ListenState::Stop => {
                // Auto mode: the device-side VAD crossed to inactive.
                // Manual mode: the explicit end of the utterance.
                handle.set_voice_active(false);
                self.dispatch_recognition(session_id.to_string());
            }
            ListenState::Detect => {
                // Device-side wake word; drop any buffered playback echo
                handle.clear_audio();
                match text.filter(|t| !t.is_empty()) {
                    Some(text) => {
                        if let Some(word) = self.state.wake.evaluate(&text) {
                            tracing::info!(session_id, wake_word = word, "wake event");
                        }
                        self.dispatch_turn(session_id.to_string(), text);
                    }
                    None => {
                        handle.set_voice_active(true);
                    }
                }
            }
        }
    }

    async fn handle_abort(&mut self, session_id: &str, reason: Option<&str>) {
        let Some(handle) = self.resolve_own(session_id).await else {
            return;
        };
        tracing::info!(session_id, ?reason, "abort requested");
        abort_pipeline(&self.pipeline);
        if reason == Some(ABORT_WAKE_WORD) {
            // Barge-in: the device heard its wake word during playback
            handle.clear_audio();
        }
    }

    /// Route one binary frame into the session's audio path
    fn handle_audio(&mut self, data: &[u8]) {
        let edge = self.session.ingest_audio(data);
        if edge == Some(VadEdge::Fall) && self.session.mode() == ListenMode::Auto {
            if let Some(session_id) = self.session.session_id() {
                self.dispatch_recognition(session_id);
            }
        }
    }

    /// Resolve a session id and verify it belongs to this connection
    async fn resolve_own(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        match self.state.registry.resolve(session_id) {
            Ok(handle) if handle.connection_id == self.session.connection_id => Some(handle),
            Ok(_) => {
                self.protocol_error(
                    Some(session_id.to_string()),
                    "session does not belong to this connection".to_string(),
                )
                .await;
                None
            }
            Err(e) => {
                self.protocol_error(Some(session_id.to_string()), e.to_string()).await;
                None
            }
        }
    }

    /// Flush the buffered utterance and run recognition + response on a side
    /// task, replacing any previous in-flight pipeline
    fn dispatch_recognition(&self, session_id: String) {
        let Some(utterance) = self.session.flush_utterance() else {
            return;
        };

        let state = Arc::clone(&self.state);
        let session = Arc::clone(&self.session);
        let tx = self.tx.clone();
        let mode = self.session.mode();

        self.store_pipeline(tokio::spawn(async move {
            run_recognition(state, session, session_id, mode, utterance, tx).await;
        }));
    }

    /// Run a response turn for already-recognized or device-supplied text
    fn dispatch_turn(&self, session_id: String, text: String) {
        let state = Arc::clone(&self.state);
        let session = Arc::clone(&self.session);
        let tx = self.tx.clone();

        self.store_pipeline(tokio::spawn(async move {
            state.orchestrator.run_turn(&session, &session_id, &text, &tx).await;
        }));
    }

    fn store_pipeline(&self, task: JoinHandle<()>) {
        let mut slot = self
            .pipeline
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(previous) = slot.replace(task) {
            if !previous.is_finished() {
                tracing::debug!(
                    connection_id = %self.session.connection_id,
                    "superseding in-flight pipeline"
                );
                previous.abort();
            }
        }
    }

    fn shutdown(&mut self) {
        if self.conn_state == ConnState::Closed {
            return;
        }
        self.transition(ConnState::Closing);
        abort_pipeline(&self.pipeline);
        self.state.registry.remove(&self.session.connection_id);
        self.transition(ConnState::Closed);
    }
}

/// Recognition half of the pipeline: recognize, gate, respond
async fn run_recognition(
    state: Arc<GatewayState>,
    session: Arc<SessionHandle>,
    session_id: String,
    mode: ListenMode,
    utterance: Vec<AudioChunk>,
    tx: mpsc::Sender<Frame>,
) {
    let chunks: Vec<Bytes> = utterance.into_iter().map(|c| c.pcm).collect();
    let result = state
        .recognition
        .recognize_utterance(&session_id, mode, chunks)
        .await;

    // A session torn down mid-call completes-and-discards
    if !state.registry.is_live(&session_id) {
        tracing::debug!(session_id, "session closed during recognition, discarding");
        return;
    }

    if result.is_degraded() {
        // Placeholder stays visible to the device but never reaches the model
        let _ = tx
            .send(Frame::Control(Outbound::Stt {
                session_id,
                text: result.text,
            }))
            .await;
        return;
    }
    if result.text.is_empty() {
        tracing::debug!(session_id, provider = result.provider, "empty recognition result");
        return;
    }

    let transcript = session.absorb_transcript(&result.text);
    let wake_word = state.wake.evaluate(&transcript).map(ToString::to_string);
    let result = RecognitionResult {
        wake: wake_word.is_some(),
        ..result
    };
    tracing::info!(
        session_id,
        provider = result.provider,
        confidence = result.confidence,
        wake = result.wake,
        wake_word = wake_word.as_deref().unwrap_or(""),
        chars = transcript.len(),
        "utterance recognized"
    );

    state
        .orchestrator
        .run_turn(&session, &session_id, &transcript, &tx)
        .await;
}
