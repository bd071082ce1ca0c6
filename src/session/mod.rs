//! Device session state and registry
//!
//! The registry is the single source of truth for "is this device currently
//! talking". Sessions are addressed by an opaque connection id; the
//! protocol-level session id only exists after a successful handshake and is
//! regenerated on every handshake. All mutation goes through the registry and
//! session handles — protocol code never writes fields directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::audio::{AudioBuffer, AudioChunk, AudioCodec, VadEdge};
use crate::config::AudioConfig;
use crate::protocol::{AudioParams, ListenMode};
use crate::{Error, Result};

/// Device identity hints supplied in the handshake
#[derive(Debug, Clone, Default)]
pub struct DeviceHints {
    /// Device-assigned identifier
    pub device_id: Option<String>,
    /// Human-readable device name
    pub device_name: Option<String>,
    /// Hardware MAC address
    pub device_mac: Option<String>,
}

/// Mutable per-session state
#[derive(Debug)]
struct SessionState {
    session_id: Option<String>,
    authenticated: bool,
    audio_params: Option<AudioParams>,
    hints: DeviceHints,
    last_activity: DateTime<Utc>,
    mode: ListenMode,
    voice_active: bool,
    /// Accumulated recognized text; manual mode appends across listen turns,
    /// auto mode replaces each turn
    transcript: String,
    /// Last device-state report, kept for observability
    iot_states: Option<serde_json::Value>,
}

/// One logical device connection
///
/// The handle owns the session's audio buffer and codec; each lives behind
/// its own lock so a recognition call and the next inbound chunk can race
/// safely, and flush-then-clear is atomic with respect to concurrent ingest.
pub struct SessionHandle {
    /// Opaque connection id, unique for process lifetime
    pub connection_id: String,
    state: Mutex<SessionState>,
    buffer: Mutex<AudioBuffer>,
    codec: Mutex<Option<AudioCodec>>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    fn new(connection_id: String, audio: &AudioConfig) -> Self {
        Self {
            connection_id,
            state: Mutex::new(SessionState {
                session_id: None,
                authenticated: false,
                audio_params: None,
                hints: DeviceHints::default(),
                last_activity: Utc::now(),
                mode: ListenMode::default(),
                voice_active: false,
                transcript: String::new(),
                iot_states: None,
            }),
            buffer: Mutex::new(AudioBuffer::new(
                audio.buffer_capacity,
                audio.min_utterance_chunks,
            )),
            codec: Mutex::new(None),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_buffer(&self) -> std::sync::MutexGuard<'_, AudioBuffer> {
        self.buffer.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Protocol session id, present only after a successful handshake
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.lock_state().session_id.clone()
    }

    /// Whether the handshake has completed
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.lock_state().authenticated
    }

    /// Record activity, postponing idle eviction
    pub fn touch(&self) {
        self.lock_state().last_activity = Utc::now();
    }

    /// Time of the last observed activity
    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.lock_state().last_activity
    }

    /// Current listening mode
    #[must_use]
    pub fn mode(&self) -> ListenMode {
        self.lock_state().mode
    }

    /// Change the listening mode; it persists until changed again
    pub fn set_mode(&self, mode: ListenMode) {
        self.lock_state().mode = mode;
    }

    /// Whether the device currently reports voice activity
    #[must_use]
    pub fn voice_active(&self) -> bool {
        self.lock_state().voice_active
    }

    /// Update the voice-activity flag, returning the previous value
    pub fn set_voice_active(&self, active: bool) -> bool {
        let mut state = self.lock_state();
        std::mem::replace(&mut state.voice_active, active)
    }

    /// Store a device-state report
    pub fn record_iot_states(&self, states: serde_json::Value) {
        self.lock_state().iot_states = Some(states);
    }

    /// Most recent device-state report, if any
    #[must_use]
    pub fn iot_states(&self) -> Option<serde_json::Value> {
        self.lock_state().iot_states.clone()
    }

    /// Fold newly recognized text into the session transcript
    ///
    /// Manual mode appends across listen turns; auto mode replaces. Returns
    /// the resulting full transcript.
    pub fn absorb_transcript(&self, text: &str) -> String {
        let mut state = self.lock_state();
        match state.mode {
            ListenMode::Auto => {
                state.transcript = text.to_string();
            }
            ListenMode::Manual => {
                if !state.transcript.is_empty() && !text.is_empty() {
                    state.transcript.push(' ');
                }
                state.transcript.push_str(text);
            }
        }
        state.transcript.clone()
    }

    /// Take and clear the accumulated transcript
    pub fn take_transcript(&self) -> String {
        std::mem::take(&mut self.lock_state().transcript)
    }

    /// Decode one inbound Opus frame and append it to the buffer
    ///
    /// Undecodable frames are dropped (counted by the codec) without
    /// reaching the buffer. Returns any voice-activity edge the chunk
    /// produced. A frame arriving before the handshake is ignored.
    pub fn ingest_audio(&self, frame: &[u8]) -> Option<VadEdge> {
        let voiced = self.voice_active();
        let pcm = {
            let mut codec = self.codec.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            codec.as_mut()?.decode(frame)
        };
        if pcm.is_empty() {
            return None;
        }
        self.lock_buffer().ingest(AudioChunk::new(pcm, voiced))
    }

    /// Flush the buffered utterance if it clears the minimum chunk count
    pub fn flush_utterance(&self) -> Option<Vec<AudioChunk>> {
        self.lock_buffer().flush()
    }

    /// Drop buffered audio without producing an utterance
    pub fn clear_audio(&self) {
        self.lock_buffer().clear();
    }

    /// Chunks currently buffered
    #[must_use]
    pub fn buffered_chunks(&self) -> usize {
        self.lock_buffer().len()
    }

    /// (buffer overflow count, codec decode-failure count)
    #[must_use]
    pub fn counters(&self) -> (u64, u64) {
        let overflow = self.lock_buffer().overflow_count();
        let failures = self
            .codec
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map_or(0, AudioCodec::decode_failures);
        (overflow, failures)
    }

    /// Encode one silent frame with the session codec
    ///
    /// # Errors
    ///
    /// Returns error if no codec has been negotiated or encoding fails.
    pub fn encode_silence(&self) -> Result<Vec<u8>> {
        let mut codec = self.codec.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        codec
            .as_mut()
            .ok_or_else(|| Error::Codec("no negotiated codec".to_string()))?
            .encode_silence()
    }
}

/// In-memory registry of device sessions
///
/// Mutation funnels through these methods so the lifecycle invariants hold:
/// a session id is only resolvable after a successful handshake, and
/// teardown is idempotent.
pub struct SessionRegistry {
    audio: AudioConfig,
    max_sessions: usize,
    by_connection: RwLock<HashMap<String, Arc<SessionHandle>>>,
    by_session: RwLock<HashMap<String, String>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("max_sessions", &self.max_sessions)
            .field("active", &self.len())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(audio: AudioConfig, max_sessions: usize) -> Self {
        Self {
            audio,
            max_sessions,
            by_connection: RwLock::new(HashMap::new()),
            by_session: RwLock::new(HashMap::new()),
        }
    }

    fn read_connections(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<SessionHandle>>> {
        self.by_connection
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Create an unauthenticated session at socket-accept time
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionLimit`] when the session cap is reached; the
    /// rejected connection leaves no registry state behind.
    pub fn create(&self) -> Result<Arc<SessionHandle>> {
        let mut connections = self
            .by_connection
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if connections.len() >= self.max_sessions {
            return Err(Error::SessionLimit(connections.len()));
        }

        let connection_id = Uuid::new_v4().to_string();
        let handle = Arc::new(SessionHandle::new(connection_id.clone(), &self.audio));
        connections.insert(connection_id, Arc::clone(&handle));
        Ok(handle)
    }

    /// Promote a session on handshake success
    ///
    /// Allocates a fresh protocol session id, stores the negotiated audio
    /// parameters (device-supplied, falling back to the server defaults when
    /// the device omits them), creates the session codec, and marks the
    /// session authenticated.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is unknown or the codec cannot be
    /// created for the negotiated parameters.
    pub fn authenticate(
        &self,
        connection_id: &str,
        params: Option<AudioParams>,
        hints: DeviceHints,
    ) -> Result<String> {
        let handle = self
            .read_connections()
            .get(connection_id)
            .cloned()
            .ok_or_else(|| Error::UnknownSession(connection_id.to_string()))?;

        let params = params.unwrap_or_else(|| self.audio.server_params.clone());
        let codec = AudioCodec::new(&params)?;
        let session_id = Uuid::new_v4().to_string();

        {
            let mut state = handle.lock_state();
            // Re-handshake regenerates the session id; retire the old index
            if let Some(old) = state.session_id.take() {
                self.by_session
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&old);
            }
            state.session_id = Some(session_id.clone());
            state.authenticated = true;
            state.audio_params = Some(params);
            state.hints = hints;
            state.last_activity = Utc::now();
        }
        *handle
            .codec
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(codec);

        self.by_session
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(session_id.clone(), connection_id.to_string());

        Ok(session_id)
    }

    /// Resolve a protocol session id to its handle
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownSession`] for ids that were never established
    /// via a successful handshake or whose session has since closed — the
    /// caller rejects the message without mutating any buffer.
    pub fn resolve(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        let connection_id = self
            .by_session
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::UnknownSession(session_id.to_string()))?;
        self.read_connections()
            .get(&connection_id)
            .cloned()
            .ok_or_else(|| Error::UnknownSession(session_id.to_string()))
    }

    /// Whether a session id is still live
    ///
    /// In-flight recognition calls check this after completing so a call
    /// whose session closed mid-flight can complete-and-discard.
    #[must_use]
    pub fn is_live(&self, session_id: &str) -> bool {
        self.by_session
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(session_id)
    }

    /// Destroy a session, releasing its buffer synchronously
    ///
    /// Idempotent: removing an already-removed connection is a no-op.
    pub fn remove(&self, connection_id: &str) -> Option<Arc<SessionHandle>> {
        let handle = self
            .by_connection
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(connection_id)?;

        if let Some(session_id) = handle.session_id() {
            self.by_session
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&session_id);
        }
        handle.clear_audio();
        tracing::debug!(connection_id, "session destroyed");
        Some(handle)
    }

    /// Evict sessions idle beyond `horizon`, returning how many were removed
    pub fn sweep_idle(&self, horizon: chrono::Duration) -> usize {
        let cutoff = Utc::now() - horizon;
        let stale: Vec<String> = self
            .read_connections()
            .values()
            .filter(|h| h.last_activity() < cutoff)
            .map(|h| h.connection_id.clone())
            .collect();

        let count = stale.len();
        for connection_id in stale {
            tracing::info!(connection_id, "evicting idle session");
            self.remove(&connection_id);
        }
        count
    }

    /// Tear down every session, releasing all buffers
    ///
    /// Used on graceful shutdown so teardown runs through the same path as
    /// a transport close.
    pub fn drain(&self) -> usize {
        let all: Vec<String> = self
            .read_connections()
            .keys()
            .cloned()
            .collect();
        let count = all.len();
        for connection_id in all {
            self.remove(&connection_id);
        }
        count
    }

    /// Number of active sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_connections().len()
    }

    /// Whether no sessions are active
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_connections().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(AudioConfig::default(), 8)
    }

    #[test]
    fn session_id_only_valid_after_handshake() {
        let registry = registry();
        let handle = registry.create().unwrap();
        assert!(!handle.is_authenticated());
        assert!(handle.session_id().is_none());
        assert!(registry.resolve("never-issued").is_err());

        let session_id = registry
            .authenticate(&handle.connection_id, None, DeviceHints::default())
            .unwrap();
        assert!(handle.is_authenticated());
        assert!(registry.resolve(&session_id).is_ok());
    }

    #[test]
    fn rehandshake_regenerates_session_id() {
        let registry = registry();
        let handle = registry.create().unwrap();
        let first = registry
            .authenticate(&handle.connection_id, None, DeviceHints::default())
            .unwrap();
        let second = registry
            .authenticate(&handle.connection_id, None, DeviceHints::default())
            .unwrap();

        assert_ne!(first, second);
        assert!(registry.resolve(&first).is_err());
        assert!(registry.resolve(&second).is_ok());
    }

    #[test]
    fn session_cap_rejects_creation() {
        let registry = SessionRegistry::new(AudioConfig::default(), 2);
        let _a = registry.create().unwrap();
        let _b = registry.create().unwrap();
        assert!(matches!(registry.create(), Err(Error::SessionLimit(2))));
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = registry();
        let handle = registry.create().unwrap();
        let session_id = registry
            .authenticate(&handle.connection_id, None, DeviceHints::default())
            .unwrap();

        assert!(registry.remove(&handle.connection_id).is_some());
        assert!(registry.remove(&handle.connection_id).is_none());
        assert!(!registry.is_live(&session_id));
    }

    #[test]
    fn transcript_mode_asymmetry() {
        let registry = registry();
        let handle = registry.create().unwrap();
        registry
            .authenticate(&handle.connection_id, None, DeviceHints::default())
            .unwrap();

        handle.set_mode(ListenMode::Manual);
        handle.absorb_transcript("turn one");
        assert_eq!(handle.absorb_transcript("turn two"), "turn one turn two");

        handle.take_transcript();
        handle.set_mode(ListenMode::Auto);
        handle.absorb_transcript("first");
        assert_eq!(handle.absorb_transcript("second"), "second");
    }

    #[test]
    fn iot_states_are_recorded() {
        let registry = registry();
        let handle = registry.create().unwrap();
        assert!(handle.iot_states().is_none());

        handle.record_iot_states(serde_json::json!({"lamp": "on"}));
        assert_eq!(handle.iot_states().unwrap()["lamp"], "on");
    }

    #[test]
    fn audio_before_handshake_is_ignored() {
        let registry = registry();
        let handle = registry.create().unwrap();
        assert!(handle.ingest_audio(&[1, 2, 3]).is_none());
        assert_eq!(handle.buffered_chunks(), 0);
    }

    #[test]
    fn idle_sweep_evicts_stale_sessions() {
        let registry = registry();
        let handle = registry.create().unwrap();
        registry
            .authenticate(&handle.connection_id, None, DeviceHints::default())
            .unwrap();

        assert_eq!(registry.sweep_idle(chrono::Duration::seconds(600)), 0);
        assert_eq!(registry.sweep_idle(chrono::Duration::seconds(-1)), 1);
        assert!(registry.is_empty());
    }
}
