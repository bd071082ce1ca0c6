//! Speech-synthesis collaborator client

use async_trait::async_trait;

use crate::config::SynthesisConfig;
use crate::{Error, Result};

/// Interface boundary to the speech-synthesis collaborator
///
/// The orchestrator checks `is_configured` before calling so the silent
/// fallback frame is picked proactively rather than via error handling.
#[async_trait]
pub trait SynthesisCollaborator: Send + Sync {
    /// Whether a call can be attempted at all
    fn is_configured(&self) -> bool;

    /// Synthesize text, returning pre-encoded audio bytes
    ///
    /// # Errors
    ///
    /// Returns error if the collaborator cannot deliver audio; the
    /// orchestrator degrades to a single silent frame rather than surfacing it.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// Synthesizes speech from reply text
pub struct SynthesisClient {
    client: reqwest::Client,
    config: SynthesisConfig,
}

impl SynthesisClient {
    /// Create a client from configuration
    #[must_use]
    pub fn new(config: SynthesisConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl SynthesisCollaborator for SynthesisClient {
    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    /// # Errors
    ///
    /// Returns error if the collaborator is unreachable or replies with a
    /// non-success status. The returned bytes are delivered pre-encoded and
    /// streamed to the device as-is.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| Error::Synthesis("no API key configured".to_string()))?;

        #[derive(serde::Serialize)]
        struct SynthesisRequest<'a> {
            input: &'a str,
            voice: &'a str,
            response_format: &'a str,
        }

        let request = SynthesisRequest {
            input: text,
            voice: &self.config.voice,
            response_format: "opus",
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!(
                "synthesis endpoint error {status}: {body}"
            )));
        }

        let audio = response.bytes().await?;
        tracing::debug!(bytes = audio.len(), "synthesis complete");
        Ok(audio.to_vec())
    }
}
