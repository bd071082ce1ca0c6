//! Audio pipeline and concurrency integration tests

use std::sync::Arc;

use lantern_gateway::config::{AudioConfig, ChatConfig, SynthesisConfig};
use lantern_gateway::llm::ChatClient;
use lantern_gateway::orchestrator::Orchestrator;
use lantern_gateway::protocol::{Frame, Outbound, TtsState};
use lantern_gateway::session::{DeviceHints, SessionRegistry};
use lantern_gateway::tts::SynthesisClient;
use tokio::sync::mpsc;

fn degraded_orchestrator() -> Orchestrator {
    Orchestrator::new(
        Box::new(ChatClient::new(ChatConfig::default())),
        Box::new(SynthesisClient::new(SynthesisConfig::default())),
    )
}

/// Short snapshots never reach recognition, and the buffer is left empty
#[test]
fn short_utterance_produces_no_recognition_input() {
    let registry = SessionRegistry::new(AudioConfig::default(), 4);
    let handle = registry.create().unwrap();
    registry
        .authenticate(&handle.connection_id, None, DeviceHints::default())
        .unwrap();
    handle.set_voice_active(true);

    // A real Opus frame, so chunks travel the actual decode path
    let frame = handle.encode_silence().unwrap();
    for _ in 0..10 {
        handle.ingest_audio(&frame);
    }
    assert_eq!(handle.buffered_chunks(), 10);

    // Below the minimum chunk count nothing is handed to recognition,
    // and the buffer still clears
    assert!(handle.flush_utterance().is_none());
    assert_eq!(handle.buffered_chunks(), 0);

    // At the threshold the utterance is forwarded
    for _ in 0..15 {
        handle.ingest_audio(&frame);
    }
    let utterance = handle.flush_utterance().unwrap();
    assert_eq!(utterance.len(), 15);
    assert!(utterance.iter().all(|c| c.voiced && !c.pcm.is_empty()));
}

/// Teardown mid-turn leaves the registry clean and is idempotent
#[test]
fn teardown_races_are_idempotent() {
    let registry = SessionRegistry::new(AudioConfig::default(), 4);
    let handle = registry.create().unwrap();
    let session_id = registry
        .authenticate(&handle.connection_id, None, DeviceHints::default())
        .unwrap();

    assert!(registry.is_live(&session_id));
    registry.remove(&handle.connection_id);
    registry.remove(&handle.connection_id);
    assert!(!registry.is_live(&session_id));
    assert!(registry.is_empty());
}

fn event_shape(frame: &Frame) -> &'static str {
    match frame {
        Frame::Control(Outbound::Stt { .. }) => "stt",
        Frame::Control(Outbound::Llm { .. }) => "llm",
        Frame::Control(Outbound::Tts { state: TtsState::Start, .. }) => "tts_start",
        Frame::Control(Outbound::Tts { state: TtsState::SentenceStart, .. }) => "tts_sentence",
        Frame::Control(Outbound::Tts { state: TtsState::Stop, .. }) => "tts_stop",
        Frame::Control(_) => "other",
        Frame::Audio(_) => "audio",
    }
}

/// Concurrent sessions see per-session event orderings identical to the
/// single-session case — no cross-session interleaving corruption
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_turns_keep_per_session_ordering() {
    const SESSIONS: usize = 64;

    let registry = Arc::new(SessionRegistry::new(AudioConfig::default(), SESSIONS));
    let orchestrator = Arc::new(degraded_orchestrator());

    let mut turns = Vec::new();
    for i in 0..SESSIONS {
        let handle = registry.create().unwrap();
        let session_id = registry
            .authenticate(&handle.connection_id, None, DeviceHints::default())
            .unwrap();
        let orchestrator = Arc::clone(&orchestrator);

        turns.push(tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel(16);
            let text = format!("session {i} says hello");
            orchestrator.run_turn(&handle, &session_id, &text, &tx).await;
            drop(tx);

            let mut shapes = Vec::new();
            let mut stt_text = None;
            while let Some(frame) = rx.recv().await {
                if let Frame::Control(Outbound::Stt { text, .. }) = &frame {
                    stt_text = Some(text.clone());
                }
                shapes.push(event_shape(&frame));
            }
            (text, stt_text, shapes)
        }));
    }

    for turn in turns {
        let (sent, stt_text, shapes) = turn.await.unwrap();
        // Each session's events carry its own text, in the canonical order
        assert_eq!(stt_text.as_deref(), Some(sent.as_str()));
        assert_eq!(
            shapes,
            ["stt", "llm", "tts_start", "tts_sentence", "audio", "tts_stop"]
        );
    }
}

/// The session cap rejects excess sessions without disturbing existing ones
#[test]
fn session_cap_is_enforced_under_pressure() {
    let registry = SessionRegistry::new(AudioConfig::default(), 10);
    let mut handles = Vec::new();
    for _ in 0..10 {
        handles.push(registry.create().unwrap());
    }
    assert!(registry.create().is_err());

    // Releasing one slot admits one new session
    registry.remove(&handles[0].connection_id);
    assert!(registry.create().is_ok());
}
