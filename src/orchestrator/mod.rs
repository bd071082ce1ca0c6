//! Response orchestrator
//!
//! Sequences one triggered turn: recognized text goes out as an `stt` event,
//! the language-model collaborator produces a reply, the reply streams back
//! as synthesized audio bracketed by `tts` phase events. Every collaborator
//! failure degrades — a canned reply for the model, a silent frame for
//! synthesis — so the device never sees a hard failure mid-turn.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::llm::ChatCollaborator;
use crate::protocol::{Frame, Outbound, TtsState};
use crate::session::SessionHandle;
use crate::tts::SynthesisCollaborator;

/// Phases of one response turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    SttDone,
    LlmPending,
    LlmDone,
    TtsPending,
    TtsStreaming,
    Done,
}

/// Fixed fallback replies used when the model call fails or is unconfigured
pub const CANNED_REPLIES: &[&str] = &[
    "Hmm, give me a second and ask me that again.",
    "I didn't quite catch that, could you say it once more?",
    "Let me think about that one and get back to you.",
    "Sorry, my train of thought derailed. One more time?",
];

/// Minimal silent Opus frame sent when synthesis produces nothing, so the
/// device playback state machine still advances
const SILENT_OPUS_FRAME: &[u8] = &[0xF8, 0xFF, 0xFE];

/// Delay before `tts stop` so client-side playback can drain
const PLAYBACK_DRAIN_DELAY: Duration = Duration::from_millis(300);

/// Coarse emotion bucket for a model reply
///
/// Keyword/emoji matching against fixed buckets; neutral is the default.
#[must_use]
pub fn classify_emotion(text: &str) -> &'static str {
    const HAPPY: &[&str] = &["glad", "great", "happy", "wonderful", "😀", "😄", "哈哈", "开心", "太好了"];
    const SAD: &[&str] = &["sorry", "sad", "unfortunately", "afraid", "😢", "😭", "难过", "抱歉"];
    const SURPRISED: &[&str] = &["wow", "really", "amazing", "incredible", "😮", "😲", "居然", "惊"];

    let lowered = text.to_lowercase();
    for (bucket, needles) in [("happy", HAPPY), ("sad", SAD), ("surprised", SURPRISED)] {
        if needles.iter().any(|n| lowered.contains(n)) {
            return bucket;
        }
    }
    "neutral"
}

/// Drives the recognition → model → synthesis response cycle
pub struct Orchestrator {
    chat: Box<dyn ChatCollaborator>,
    synthesis: Box<dyn SynthesisCollaborator>,
    canned_cursor: AtomicUsize,
}

impl Orchestrator {
    /// Create an orchestrator over the two collaborators
    #[must_use]
    pub fn new(chat: Box<dyn ChatCollaborator>, synthesis: Box<dyn SynthesisCollaborator>) -> Self {
        Self {
            chat,
            synthesis,
            canned_cursor: AtomicUsize::new(0),
        }
    }

    /// Next canned reply, round-robin so repeated failures vary
    fn canned_reply(&self) -> &'static str {
        let index = self.canned_cursor.fetch_add(1, Ordering::Relaxed);
        CANNED_REPLIES[index % CANNED_REPLIES.len()]
    }

    /// Run one triggered turn end to end
    ///
    /// Emits, in order: `stt`, `llm`, `tts(start)`, `tts(sentence_start)`,
    /// one binary audio frame, `tts(stop)`. A closed outbound channel means
    /// the connection is gone; the turn ends quietly.
    pub async fn run_turn(
        &self,
        session: &SessionHandle,
        session_id: &str,
        text: &str,
        tx: &mpsc::Sender<Frame>,
    ) -> TurnPhase {
        let mut phase = TurnPhase::Idle;

        let stt_event = Outbound::Stt {
            session_id: session_id.to_string(),
            text: text.to_string(),
        };
        if tx.send(Frame::Control(stt_event)).await.is_err() {
            return phase;
        }
        advance(&mut phase, TurnPhase::SttDone, session_id);

        advance(&mut phase, TurnPhase::LlmPending, session_id);
        let reply = if self.chat.is_configured() {
            let started = Instant::now();
            match self.chat.chat(session_id, text).await {
                Ok(reply) => {
                    tracing::info!(session_id, elapsed = ?started.elapsed(), "model reply received");
                    reply
                }
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "model call failed, using canned reply");
                    self.canned_reply().to_string()
                }
            }
        } else {
            tracing::info!(session_id, "model not configured, using canned reply");
            self.canned_reply().to_string()
        };
        advance(&mut phase, TurnPhase::LlmDone, session_id);

        let emotion = classify_emotion(&reply);
        let llm_event = Outbound::Llm {
            session_id: session_id.to_string(),
            text: reply.clone(),
            emotion: emotion.to_string(),
        };
        if tx.send(Frame::Control(llm_event)).await.is_err() {
            return phase;
        }

        advance(&mut phase, TurnPhase::TtsPending, session_id);
        let start = Outbound::Tts {
            session_id: session_id.to_string(),
            state: TtsState::Start,
            text: None,
        };
        let sentence = Outbound::Tts {
            session_id: session_id.to_string(),
            state: TtsState::SentenceStart,
            text: Some(reply.clone()),
        };
        if tx.send(Frame::Control(start)).await.is_err()
            || tx.send(Frame::Control(sentence)).await.is_err()
        {
            return phase;
        }

        let audio = self.synthesize_or_silence(session, session_id, &reply).await;
        advance(&mut phase, TurnPhase::TtsStreaming, session_id);
        if tx.send(Frame::Audio(audio)).await.is_err() {
            return phase;
        }

        // Let client-side playback drain before signalling stop
        tokio::time::sleep(PLAYBACK_DRAIN_DELAY).await;
        let stop = Outbound::Tts {
            session_id: session_id.to_string(),
            state: TtsState::Stop,
            text: None,
        };
        let _ = tx.send(Frame::Control(stop)).await;

        TurnPhase::Done
    }

    /// Synthesized audio, or one silent frame when synthesis cannot deliver
    async fn synthesize_or_silence(
        &self,
        session: &SessionHandle,
        session_id: &str,
        reply: &str,
    ) -> Vec<u8> {
        if self.synthesis.is_configured() {
            match self.synthesis.synthesize(reply).await {
                Ok(audio) if !audio.is_empty() => return audio,
                Ok(_) => {
                    tracing::warn!(session_id, "synthesis returned no audio");
                }
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "synthesis failed");
                }
            }
        } else {
            tracing::info!(session_id, "synthesis not configured");
        }

        session
            .encode_silence()
            .unwrap_or_else(|_| SILENT_OPUS_FRAME.to_vec())
    }
}

fn advance(phase: &mut TurnPhase, to: TurnPhase, session_id: &str) {
    *phase = to;
    tracing::trace!(session_id, phase = ?to, "turn phase");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioConfig, ChatConfig, SynthesisConfig};
    use crate::llm::ChatClient;
    use crate::session::SessionRegistry;
    use crate::tts::SynthesisClient;
    use crate::{Error, Result};
    use async_trait::async_trait;

    fn orchestrator() -> Orchestrator {
        // Neither collaborator credentialed: canned reply + silent frame
        Orchestrator::new(
            Box::new(ChatClient::new(ChatConfig::default())),
            Box::new(SynthesisClient::new(SynthesisConfig::default())),
        )
    }

    /// Collaborators that claim to be configured but fail every call
    struct FailingChat;

    #[async_trait]
    impl ChatCollaborator for FailingChat {
        fn is_configured(&self) -> bool {
            true
        }
        async fn chat(&self, _session_id: &str, _text: &str) -> Result<String> {
            Err(Error::Chat("collaborator exploded".to_string()))
        }
    }

    struct FailingSynthesis;

    #[async_trait]
    impl SynthesisCollaborator for FailingSynthesis {
        fn is_configured(&self) -> bool {
            true
        }
        async fn synthesize(&self, _text: &str) -> Result<Vec<u8>> {
            Err(Error::Synthesis("collaborator exploded".to_string()))
        }
    }

    fn authenticated_session() -> (SessionRegistry, std::sync::Arc<SessionHandle>, String) {
        let registry = SessionRegistry::new(AudioConfig::default(), 8);
        let handle = registry.create().unwrap();
        let session_id = registry
            .authenticate(&handle.connection_id, None, crate::session::DeviceHints::default())
            .unwrap();
        (registry, handle, session_id)
    }

    #[test]
    fn emotion_buckets() {
        assert_eq!(classify_emotion("I'm so happy for you!"), "happy");
        assert_eq!(classify_emotion("Unfortunately that failed."), "sad");
        assert_eq!(classify_emotion("Wow, that's unexpected"), "surprised");
        assert_eq!(classify_emotion("The light is on."), "neutral");
        assert_eq!(classify_emotion("哈哈，太好了"), "happy");
    }

    #[test]
    fn canned_replies_rotate() {
        let orchestrator = orchestrator();
        let first = orchestrator.canned_reply();
        let second = orchestrator.canned_reply();
        assert_ne!(first, second);
        assert!(CANNED_REPLIES.contains(&first));
        assert!(CANNED_REPLIES.contains(&second));
    }

    #[tokio::test]
    async fn turn_emits_ordered_events_with_degraded_collaborators() {
        let (_registry, handle, session_id) = authenticated_session();
        let orchestrator = orchestrator();
        let (tx, mut rx) = mpsc::channel(16);

        let phase = orchestrator
            .run_turn(&handle, &session_id, "hello there", &tx)
            .await;
        assert_eq!(phase, TurnPhase::Done);
        drop(tx);

        let mut events = Vec::new();
        while let Some(frame) = rx.recv().await {
            events.push(frame);
        }

        // stt, llm, tts start, tts sentence_start, audio, tts stop
        assert_eq!(events.len(), 6);
        assert!(matches!(&events[0], Frame::Control(Outbound::Stt { text, .. }) if text == "hello there"));
        match &events[1] {
            Frame::Control(Outbound::Llm { text, emotion, .. }) => {
                assert!(CANNED_REPLIES.contains(&text.as_str()));
                assert!(!emotion.is_empty());
            }
            other => panic!("expected llm event, got {other:?}"),
        }
        assert!(matches!(
            &events[2],
            Frame::Control(Outbound::Tts { state: TtsState::Start, .. })
        ));
        assert!(matches!(
            &events[3],
            Frame::Control(Outbound::Tts { state: TtsState::SentenceStart, text: Some(_), .. })
        ));
        assert!(matches!(&events[4], Frame::Audio(audio) if !audio.is_empty()));
        assert!(matches!(
            &events[5],
            Frame::Control(Outbound::Tts { state: TtsState::Stop, .. })
        ));
    }

    #[tokio::test]
    async fn throwing_collaborators_never_reach_the_device() {
        let (_registry, handle, session_id) = authenticated_session();
        let orchestrator = Orchestrator::new(Box::new(FailingChat), Box::new(FailingSynthesis));
        let (tx, mut rx) = mpsc::channel(16);

        let phase = orchestrator.run_turn(&handle, &session_id, "hello", &tx).await;
        assert_eq!(phase, TurnPhase::Done);
        drop(tx);

        let mut saw_llm = false;
        let mut saw_audio = false;
        while let Some(frame) = rx.recv().await {
            match frame {
                // Model failure degrades to a canned reply, never an error payload
                Frame::Control(Outbound::Llm { text, .. }) => {
                    assert!(CANNED_REPLIES.contains(&text.as_str()));
                    saw_llm = true;
                }
                Frame::Control(Outbound::Error { .. }) => {
                    panic!("collaborator failure leaked to the device");
                }
                // Synthesis failure degrades to one silent frame
                Frame::Audio(audio) => {
                    assert!(!audio.is_empty());
                    saw_audio = true;
                }
                Frame::Control(_) => {}
            }
        }
        assert!(saw_llm);
        assert!(saw_audio);
    }

    #[tokio::test]
    async fn closed_channel_ends_turn_quietly() {
        let (_registry, handle, session_id) = authenticated_session();
        let orchestrator = orchestrator();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let phase = orchestrator.run_turn(&handle, &session_id, "hi", &tx).await;
        assert_eq!(phase, TurnPhase::Idle);
    }
}
