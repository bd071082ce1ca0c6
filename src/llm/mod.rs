//! Language-model collaborator client
//!
//! The collaborator maintains its own per-session conversation history; this
//! client only correlates calls by session id and awaits a single text reply.

use async_trait::async_trait;

use crate::config::ChatConfig;
use crate::{Error, Result};

/// Interface boundary to the language-model collaborator
///
/// The orchestrator checks `is_configured` before calling so it can pick
/// its degraded path proactively rather than via error handling.
#[async_trait]
pub trait ChatCollaborator: Send + Sync {
    /// Whether a call can be attempted at all
    fn is_configured(&self) -> bool;

    /// Request one reply for the session's text
    ///
    /// # Errors
    ///
    /// Returns error if the collaborator cannot produce a reply; the
    /// orchestrator degrades to a canned reply rather than surfacing it.
    async fn chat(&self, session_id: &str, text: &str) -> Result<String>;
}

/// Response from the chat-completions endpoint
#[derive(serde::Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(serde::Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(serde::Deserialize)]
struct ChatMessage {
    content: String,
}

/// Produces assistant replies for recognized device speech
pub struct ChatClient {
    client: reqwest::Client,
    config: ChatConfig,
}

impl ChatClient {
    /// Create a client from configuration
    #[must_use]
    pub fn new(config: ChatConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl ChatCollaborator for ChatClient {
    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    /// # Errors
    ///
    /// Returns error if the collaborator is unreachable, replies with a
    /// non-success status, or returns no choices.
    async fn chat(&self, session_id: &str, text: &str) -> Result<String> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| Error::Chat("no API key configured".to_string()))?;

        #[derive(serde::Serialize)]
        struct ChatRequest<'a> {
            model: &'a str,
            messages: Vec<RequestMessage<'a>>,
            user: &'a str,
        }

        #[derive(serde::Serialize)]
        struct RequestMessage<'a> {
            role: &'a str,
            content: &'a str,
        }

        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![RequestMessage {
                role: "user",
                content: text,
            }],
            user: session_id,
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
            return Err(Error::Chat(format!("chat endpoint error {status}: {body}")));
        }

        let reply: ChatResponse = response.json().await?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Chat("empty choice list".to_string()))?;

        tracing::debug!(session_id, reply_chars = content.len(), "chat reply received");
        Ok(content)
    }
}
