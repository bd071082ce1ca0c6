//! TOML configuration file loading
//!
//! All fields are optional — the file is a partial overlay on top of defaults.
//! Secrets can live here for development but normally arrive via environment
//! variables (see `Config::apply_env`).

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::{Config, RecognitionBackend};
use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Audio ingestion configuration
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Recognition provider configuration
    #[serde(default)]
    pub recognition: RecognitionFileConfig,

    /// Wake-word list
    #[serde(default)]
    pub wake_words: Option<Vec<String>>,

    /// Language-model collaborator
    #[serde(default)]
    pub chat: ChatFileConfig,

    /// Speech-synthesis collaborator
    #[serde(default)]
    pub synthesis: SynthesisFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// Listen port
    pub port: Option<u16>,
    /// Maximum concurrent device sessions
    pub max_sessions: Option<usize>,
    /// Idle eviction horizon in seconds
    pub session_idle_secs: Option<u64>,
    /// WebSocket URL advertised to devices
    pub advertised_ws_url: Option<String>,
    /// Firmware version advertised to devices
    pub firmware_version: Option<String>,
}

/// Audio ingestion configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Ring capacity in chunks
    pub buffer_capacity: Option<usize>,
    /// Minimum chunks for a flush to reach recognition
    pub min_utterance_chunks: Option<usize>,
}

/// Recognition provider configuration
#[derive(Debug, Default, Deserialize)]
pub struct RecognitionFileConfig {
    /// Backend selector: "binary" or `"json_stream"`
    pub backend: Option<String>,
    /// Per-call deadline in seconds
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub binary: BinaryFileConfig,

    #[serde(default)]
    pub json: JsonFileConfig,
}

/// Binary-framed provider fields
#[derive(Debug, Default, Deserialize)]
pub struct BinaryFileConfig {
    pub endpoint: Option<String>,
    pub app_id: Option<String>,
    pub access_token: Option<String>,
    pub cluster: Option<String>,
}

/// JSON-framed provider fields
#[derive(Debug, Default, Deserialize)]
pub struct JsonFileConfig {
    pub endpoint: Option<String>,
    pub mode: Option<String>,
    pub use_itn: Option<bool>,
}

/// Language-model collaborator fields
#[derive(Debug, Default, Deserialize)]
pub struct ChatFileConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

/// Speech-synthesis collaborator fields
#[derive(Debug, Default, Deserialize)]
pub struct SynthesisFileConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub voice: Option<String>,
}

impl ConfigFile {
    /// Overlay the file's values onto a runtime config
    pub fn apply(self, config: &mut Config) {
        let Self {
            server,
            audio,
            recognition,
            wake_words,
            chat,
            synthesis,
        } = self;

        if let Some(port) = server.port {
            config.server.port = port;
        }
        if let Some(max) = server.max_sessions {
            config.server.max_sessions = max;
        }
        if let Some(secs) = server.session_idle_secs {
            config.server.session_idle = Duration::from_secs(secs);
        }
        if let Some(url) = server.advertised_ws_url {
            config.server.advertised_ws_url = url;
        }
        if let Some(version) = server.firmware_version {
            config.server.firmware_version = version;
        }

        if let Some(capacity) = audio.buffer_capacity {
            config.audio.buffer_capacity = capacity;
        }
        if let Some(min) = audio.min_utterance_chunks {
            config.audio.min_utterance_chunks = min;
        }

        match recognition.backend.as_deref() {
            Some("json_stream") => config.recognition.backend = RecognitionBackend::JsonStream,
            Some("binary") | None => {}
            Some(other) => {
                tracing::warn!(backend = other, "unknown recognition backend, keeping default");
            }
        }
        if let Some(secs) = recognition.timeout_secs {
            config.recognition.timeout = Some(Duration::from_secs(secs));
        }
        if let Some(endpoint) = recognition.binary.endpoint {
            config.recognition.binary.endpoint = endpoint;
        }
        if recognition.binary.app_id.is_some() {
            config.recognition.binary.app_id = recognition.binary.app_id;
        }
        if recognition.binary.access_token.is_some() {
            config.recognition.binary.access_token = recognition.binary.access_token;
        }
        if let Some(cluster) = recognition.binary.cluster {
            config.recognition.binary.cluster = cluster;
        }
        if let Some(endpoint) = recognition.json.endpoint {
            config.recognition.json.endpoint = endpoint;
        }
        if let Some(mode) = recognition.json.mode {
            config.recognition.json.mode = mode;
        }
        if let Some(itn) = recognition.json.use_itn {
            config.recognition.json.use_itn = itn;
        }

        if let Some(words) = wake_words {
            config.wake_words = words;
        }

        if let Some(endpoint) = chat.endpoint {
            config.chat.endpoint = endpoint;
        }
        if chat.api_key.is_some() {
            config.chat.api_key = chat.api_key;
        }
        if let Some(model) = chat.model {
            config.chat.model = model;
        }

        if let Some(endpoint) = synthesis.endpoint {
            config.synthesis.endpoint = endpoint;
        }
        if synthesis.api_key.is_some() {
            config.synthesis.api_key = synthesis.api_key;
        }
        if let Some(voice) = synthesis.voice {
            config.synthesis.voice = voice;
        }
    }
}

/// Load and parse a TOML config file
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed. A missing file is
/// fine at the caller (pass `None` to `Config::load`); a named file that
/// fails to parse is not silently ignored.
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)?;
    let parsed = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_overlays_defaults() {
        let file: ConfigFile = toml::from_str(
            r#"
            wake_words = ["hi gadget"]

            [server]
            port = 9100

            [recognition]
            backend = "json_stream"
            timeout_secs = 5

            [recognition.json]
            endpoint = "ws://localhost:10095"
            "#,
        )
        .unwrap();

        let mut config = Config::default();
        file.apply(&mut config);

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.recognition.backend, RecognitionBackend::JsonStream);
        assert_eq!(config.recognition.deadline(), Duration::from_secs(5));
        assert_eq!(config.recognition.json.endpoint, "ws://localhost:10095");
        assert_eq!(config.wake_words, vec!["hi gadget".to_string()]);
        // Untouched sections keep their defaults
        assert_eq!(config.audio.buffer_capacity, 100);
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let file: ConfigFile = toml::from_str("").unwrap();
        let mut config = Config::default();
        file.apply(&mut config);
        assert_eq!(config.server.port, 8000);
    }
}
