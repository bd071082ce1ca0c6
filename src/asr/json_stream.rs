//! JSON-framed streaming recognition provider
//!
//! Speaks the protocol of a self-hosted ASR server: one JSON configuration
//! message, raw PCM as binary frames, a JSON end-of-speech marker, then a
//! reply stream whose `text` fields are concatenated until a final-flagged
//! reply arrives. Some models prefix their output with positional
//! `<|lang|><|emotion|>` tags; those are stripped into a structured
//! annotation.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::{RecognitionResult, RecognitionStream, ResultAnnotation};
use crate::config::JsonProviderConfig;
use crate::{Error, Result};

/// Recognized text with tags stripped into structured fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedText {
    /// Visible text with tag markup removed
    pub content: String,
    /// First positional tag, the detected language
    pub language: Option<String>,
    /// Second positional tag, the detected emotion (lowercased)
    pub emotion: Option<String>,
}

/// Strip leading `<|tag|>` markup from recognized text
///
/// Tags are positional: the first is the language, the second the emotion.
/// Text without tags passes through unchanged with no metadata.
#[must_use]
pub fn strip_tags(text: &str) -> TaggedText {
    let mut rest = text;
    let mut tags = Vec::new();

    while let Some(after_open) = rest.strip_prefix("<|") {
        let Some(close) = after_open.find("|>") else { break };
        tags.push(&after_open[..close]);
        rest = &after_open[close + 2..];
    }

    TaggedText {
        content: rest.to_string(),
        language: tags.first().map(|t| t.to_lowercase()),
        emotion: tags.get(1).map(|t| t.to_lowercase()),
    }
}

#[derive(Debug, Deserialize)]
struct BackendReply {
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_final: bool,
}

/// Adapter for the JSON-framed self-hosted ASR
pub struct JsonStreamAsr {
    config: JsonProviderConfig,
}

impl JsonStreamAsr {
    /// Provider tag stamped on results
    pub const PROVIDER: &'static str = "json_asr";

    /// Create the adapter; an empty endpoint puts it in degraded mode
    #[must_use]
    pub const fn new(config: JsonProviderConfig) -> Self {
        Self { config }
    }

    /// Whether an endpoint has been supplied
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    /// Open a streaming recognition session
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is invalid or the socket cannot be
    /// established.
    pub async fn open_stream(&self, session_id: &str) -> Result<RecognitionStream> {
        url::Url::parse(&self.config.endpoint)
            .map_err(|e| Error::Config(format!("asr endpoint: {e}")))?;

        let correlation_id = Uuid::new_v4().to_string();
        let (ws, _) = connect_async(self.config.endpoint.as_str()).await?;
        tracing::debug!(session_id, correlation_id = %correlation_id, "json asr stream open");

        let configuration = serde_json::json!({
            "mode": self.config.mode,
            "chunk_size": [5, 10, 5],
            "chunk_interval": 10,
            "wav_name": session_id,
            "wav_format": "pcm",
            "is_speaking": true,
            "itn": self.config.use_itn,
        });

        let (feed_tx, feed_rx) = mpsc::channel(64);
        let (result_tx, result_rx) = oneshot::channel();
        let partial = Arc::new(Mutex::new(String::new()));

        let worker_partial = Arc::clone(&partial);
        let worker = tokio::spawn(async move {
            let outcome =
                drive_stream(ws, configuration.to_string(), feed_rx, &worker_partial).await;
            let _ = result_tx.send(outcome);
        });

        Ok(RecognitionStream::new(
            correlation_id,
            Self::PROVIDER,
            feed_tx,
            result_rx,
            partial,
            worker,
        ))
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn drive_stream(
    ws: WsStream,
    configuration: String,
    mut feed_rx: mpsc::Receiver<Bytes>,
    partial: &Arc<Mutex<String>>,
) -> Result<RecognitionResult> {
    let (mut sink, mut stream) = ws.split();
    sink.send(Message::Text(configuration)).await?;

    let mut accumulated = String::new();
    let mut audio_done = false;

    loop {
        tokio::select! {
            chunk = feed_rx.recv(), if !audio_done => {
                match chunk {
                    Some(pcm) => {
                        sink.send(Message::Binary(pcm.to_vec())).await?;
                    }
                    None => {
                        sink.send(Message::Text(
                            serde_json::json!({"is_speaking": false}).to_string(),
                        ))
                        .await?;
                        audio_done = true;
                    }
                }
            }
            reply = stream.next() => {
                let Some(message) = reply else { break };
                let message = message?;
                let Message::Text(body) = message else { continue };
                let reply: BackendReply = match serde_json::from_str(&body) {
                    Ok(reply) => reply,
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping unparseable asr reply");
                        continue;
                    }
                };

                accumulated.push_str(&reply.text);
                partial
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .clone_from(&accumulated);

                if reply.is_final {
                    return Ok(finalize(&accumulated, 1.0));
                }
            }
        }
    }

    // Backend closed before a final reply; settle for what accumulated
    Ok(finalize(&accumulated, 0.0))
}

fn finalize(accumulated: &str, confidence: f32) -> RecognitionResult {
    let tagged = strip_tags(accumulated);
    let annotation = if tagged.language.is_some() || tagged.emotion.is_some() {
        Some(ResultAnnotation {
            language: tagged.language,
            emotion: tagged.emotion,
        })
    } else {
        None
    };
    RecognitionResult {
        text: tagged.content,
        confidence,
        provider: JsonStreamAsr::PROVIDER,
        annotation,
        wake: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_language_and_emotion_tags() {
        let tagged = strip_tags("<|zh|><|SAD|>你好");
        assert_eq!(tagged.content, "你好");
        assert_eq!(tagged.language.as_deref(), Some("zh"));
        assert_eq!(tagged.emotion.as_deref(), Some("sad"));
    }

    #[test]
    fn plain_text_passes_through() {
        let tagged = strip_tags("plain text");
        assert_eq!(tagged.content, "plain text");
        assert!(tagged.language.is_none());
        assert!(tagged.emotion.is_none());
    }

    #[test]
    fn single_tag_is_language_only() {
        let tagged = strip_tags("<|en|>hello");
        assert_eq!(tagged.content, "hello");
        assert_eq!(tagged.language.as_deref(), Some("en"));
        assert!(tagged.emotion.is_none());
    }

    #[test]
    fn unterminated_tag_is_left_in_place() {
        let tagged = strip_tags("<|zh hello");
        assert_eq!(tagged.content, "<|zh hello");
        assert!(tagged.language.is_none());
    }

    #[test]
    fn extra_tags_beyond_two_are_stripped_but_unmapped() {
        let tagged = strip_tags("<|zh|><|HAPPY|><|Speech|>早上好");
        assert_eq!(tagged.content, "早上好");
        assert_eq!(tagged.language.as_deref(), Some("zh"));
        assert_eq!(tagged.emotion.as_deref(), Some("happy"));
    }

    #[test]
    fn finalize_carries_annotation() {
        let result = finalize("<|en|><|NEUTRAL|>good morning", 1.0);
        assert_eq!(result.text, "good morning");
        let annotation = result.annotation.unwrap();
        assert_eq!(annotation.language.as_deref(), Some("en"));
        assert_eq!(annotation.emotion.as_deref(), Some("neutral"));
    }

    #[test]
    fn finalize_without_tags_has_no_annotation() {
        let result = finalize("good morning", 1.0);
        assert!(result.annotation.is_none());
    }
}
