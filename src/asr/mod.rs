//! Streaming speech-recognition orchestration
//!
//! One adapter per backend, each translating the generic "recognize this
//! utterance" contract into that backend's wire protocol. Every call carries
//! a hard deadline; expiry returns whatever partial text accumulated rather
//! than failing the utterance. A provider without its required secrets runs
//! in a documented degraded mode that returns a tagged placeholder — never
//! something confusable with a real result.

mod binary;
mod json_stream;

pub use binary::BinaryAsr;
pub use json_stream::{JsonStreamAsr, TaggedText, strip_tags};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{RecognitionBackend, RecognitionConfig};
use crate::protocol::ListenMode;
use crate::Result;

/// Placeholder text returned by the degraded no-credentials path
pub const DEGRADED_PLACEHOLDER: &str = "[recognition unavailable]";

/// Provider tag for degraded-mode results
pub const DEGRADED_PROVIDER: &str = "degraded";

/// Structured annotation carried when the backend emits tagged output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultAnnotation {
    /// Detected language tag (e.g. "zh", "en")
    pub language: Option<String>,
    /// Detected emotion, mapped to a lowercase bucket name
    pub emotion: Option<String>,
}

/// Generic output of a recognition call
#[derive(Debug, Clone)]
pub struct RecognitionResult {
    /// Recognized text, stripped of any backend tag markup
    pub text: String,
    /// Backend-reported or synthesized confidence in [0, 1]
    pub confidence: f32,
    /// Which adapter produced this result
    pub provider: &'static str,
    /// Language/emotion annotation when the backend supplies tagged output
    pub annotation: Option<ResultAnnotation>,
    /// Whether this result represents a wake-word trigger
    pub wake: bool,
}

impl RecognitionResult {
    /// A result carrying only text from the named provider
    #[must_use]
    pub const fn text_only(text: String, confidence: f32, provider: &'static str) -> Self {
        Self {
            text,
            confidence,
            provider,
            annotation: None,
            wake: false,
        }
    }

    /// The tagged placeholder for the degraded no-credentials path
    #[must_use]
    pub fn degraded() -> Self {
        Self {
            text: DEGRADED_PLACEHOLDER.to_string(),
            confidence: 0.0,
            provider: DEGRADED_PROVIDER,
            annotation: None,
            wake: false,
        }
    }

    /// Whether this is the degraded placeholder rather than real output
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.provider == DEGRADED_PROVIDER
    }
}

/// Aborts the backend worker (dropping its socket) when the stream itself
/// is dropped, so an abandoned recognition call never leaks a connection
struct WorkerGuard(JoinHandle<()>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Transient state for one in-flight utterance
///
/// Owns the feed side of the backend connection and exactly one response
/// channel, keyed by the correlation id the adapter stamped on the request.
/// Destroyed on final-result receipt, explicit close, or deadline expiry.
pub struct RecognitionStream {
    /// Correlation id matching backend replies to this request
    pub correlation_id: String,
    provider: &'static str,
    feed_tx: mpsc::Sender<Bytes>,
    result_rx: oneshot::Receiver<Result<RecognitionResult>>,
    partial: Arc<Mutex<String>>,
    worker: WorkerGuard,
}

impl RecognitionStream {
    pub(crate) fn new(
        correlation_id: String,
        provider: &'static str,
        feed_tx: mpsc::Sender<Bytes>,
        result_rx: oneshot::Receiver<Result<RecognitionResult>>,
        partial: Arc<Mutex<String>>,
        worker: JoinHandle<()>,
    ) -> Self {
        Self {
            correlation_id,
            provider,
            feed_tx,
            result_rx,
            partial,
            worker: WorkerGuard(worker),
        }
    }

    /// Feed one PCM chunk to the backend
    ///
    /// A send to a worker that already finished is not an error — the final
    /// result (or its absence) is what matters.
    pub async fn feed(&self, pcm: Bytes) {
        if self.feed_tx.send(pcm).await.is_err() {
            tracing::debug!(
                correlation_id = %self.correlation_id,
                "feed after recognition worker exit"
            );
        }
    }

    /// Signal end of audio and await the final result under `deadline`
    ///
    /// Deadline expiry or a backend failure tears down the backend socket
    /// and resolves to whatever partial text accumulated, with confidence
    /// zero — never an error for the caller.
    pub async fn finish(self, deadline: Duration) -> RecognitionResult {
        let Self {
            correlation_id,
            provider,
            feed_tx,
            result_rx,
            partial,
            worker,
        } = self;

        // Closing the feed channel is the end-of-audio signal
        drop(feed_tx);

        let partial_result = || {
            let text = partial
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone();
            RecognitionResult::text_only(text, 0.0, provider)
        };

        let result = match tokio::time::timeout(deadline, result_rx).await {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => {
                tracing::warn!(correlation_id = %correlation_id, error = %e, "recognition failed, using partial text");
                partial_result()
            }
            Ok(Err(_)) => {
                tracing::warn!(correlation_id = %correlation_id, "recognition worker dropped its reply channel");
                partial_result()
            }
            Err(_) => {
                tracing::warn!(correlation_id = %correlation_id, "recognition deadline expired, using partial text");
                partial_result()
            }
        };

        // Dropping the guard aborts the worker, tearing down the backend
        // socket rather than merely abandoning the pending result
        drop(worker);
        result
    }
}

enum Backend {
    Binary(BinaryAsr),
    JsonStream(JsonStreamAsr),
}

/// Recognition provider facade selected from configuration
pub struct Recognition {
    backend: Backend,
    deadline: Duration,
}

impl Recognition {
    /// Build the configured adapter
    #[must_use]
    pub fn from_config(config: &RecognitionConfig) -> Self {
        let backend = match config.backend {
            RecognitionBackend::Binary => Backend::Binary(BinaryAsr::new(config.binary.clone())),
            RecognitionBackend::JsonStream => {
                Backend::JsonStream(JsonStreamAsr::new(config.json.clone()))
            }
        };
        Self {
            backend,
            deadline: config.deadline(),
        }
    }

    /// Whether the selected backend has its required secrets
    #[must_use]
    pub fn is_configured(&self) -> bool {
        match &self.backend {
            Backend::Binary(b) => b.is_configured(),
            Backend::JsonStream(j) => j.is_configured(),
        }
    }

    /// Open a streaming recognition session for one utterance
    ///
    /// # Errors
    ///
    /// Returns error if the backend connection cannot be established.
    pub async fn open_stream(
        &self,
        session_id: &str,
        mode: ListenMode,
    ) -> Result<RecognitionStream> {
        match &self.backend {
            Backend::Binary(b) => b.open_stream(session_id, mode).await,
            Backend::JsonStream(j) => j.open_stream(session_id).await,
        }
    }

    /// Recognize one complete utterance
    ///
    /// Never fails: missing credentials yield the tagged degraded
    /// placeholder, and backend failures yield an empty (or partial-text)
    /// result the caller can ignore.
    pub async fn recognize_utterance(
        &self,
        session_id: &str,
        mode: ListenMode,
        chunks: Vec<Bytes>,
    ) -> RecognitionResult {
        if !self.is_configured() {
            tracing::info!(session_id, "recognition not credentialed, returning placeholder");
            return RecognitionResult::degraded();
        }

        let stream = match self.open_stream(session_id, mode).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "recognition backend unreachable");
                return RecognitionResult::text_only(String::new(), 0.0, self.provider_tag());
            }
        };

        for chunk in chunks {
            stream.feed(chunk).await;
        }
        stream.finish(self.deadline).await
    }

    /// Tag of the selected provider
    #[must_use]
    pub const fn provider_tag(&self) -> &'static str {
        match &self.backend {
            Backend::Binary(_) => BinaryAsr::PROVIDER,
            Backend::JsonStream(_) => JsonStreamAsr::PROVIDER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BinaryProviderConfig;

    #[test]
    fn degraded_result_is_tagged() {
        let result = RecognitionResult::degraded();
        assert!(result.is_degraded());
        assert_eq!(result.provider, DEGRADED_PROVIDER);
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn unconfigured_backend_returns_placeholder() {
        let config = RecognitionConfig {
            binary: BinaryProviderConfig::default(),
            ..RecognitionConfig::default()
        };
        let recognition = Recognition::from_config(&config);
        assert!(!recognition.is_configured());

        let result = recognition
            .recognize_utterance("s1", ListenMode::Auto, vec![Bytes::from_static(&[0u8; 640])])
            .await;
        assert!(result.is_degraded());
    }
}
