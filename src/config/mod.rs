//! Configuration management for the Lantern gateway

pub mod file;

use std::path::Path;
use std::time::Duration;

use crate::protocol::AudioParams;
use crate::{Error, Result};

/// Lantern gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server/runtime configuration
    pub server: ServerConfig,

    /// Audio ingestion configuration
    pub audio: AudioConfig,

    /// Speech-recognition provider configuration
    pub recognition: RecognitionConfig,

    /// Wake words that promote an utterance to an assistant-directed turn
    pub wake_words: Vec<String>,

    /// Language-model collaborator configuration
    pub chat: ChatConfig,

    /// Speech-synthesis collaborator configuration
    pub synthesis: SynthesisConfig,
}

/// Server/runtime configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Maximum concurrent device sessions; new connections beyond this are
    /// rejected with a structured error frame
    pub max_sessions: usize,

    /// Idle horizon after which a session is evicted
    pub session_idle: Duration,

    /// WebSocket URL advertised to devices via the provisioning endpoint
    pub advertised_ws_url: String,

    /// Firmware version advertised via the provisioning endpoint
    pub firmware_version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            max_sessions: 1024,
            session_idle: Duration::from_secs(600),
            advertised_ws_url: "ws://127.0.0.1:8000/lantern/v1/".to_string(),
            firmware_version: "1.0.0".to_string(),
        }
    }
}

/// Audio ingestion configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Audio parameters the server speaks back to devices
    pub server_params: AudioParams,

    /// Ring capacity in chunks; oldest chunks are evicted on overflow
    pub buffer_capacity: usize,

    /// Minimum chunks for a flushed snapshot to be forwarded to recognition
    pub min_utterance_chunks: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            server_params: AudioParams::default(),
            buffer_capacity: 100,
            min_utterance_chunks: 15,
        }
    }
}

/// Which recognition backend services utterances
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecognitionBackend {
    /// Cloud ASR speaking the binary/gzip envelope protocol
    #[default]
    Binary,
    /// Self-hosted ASR speaking the JSON-framed streaming protocol
    JsonStream,
}

/// Speech-recognition provider configuration
#[derive(Debug, Clone, Default)]
pub struct RecognitionConfig {
    /// Selected backend
    pub backend: RecognitionBackend,

    /// Hard deadline per recognition call
    pub timeout: Option<Duration>,

    /// Binary-framed cloud provider credentials
    pub binary: BinaryProviderConfig,

    /// JSON-framed self-hosted provider endpoint
    pub json: JsonProviderConfig,
}

impl RecognitionConfig {
    /// Effective per-call deadline (default 10 s)
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.timeout.unwrap_or(Duration::from_secs(10))
    }
}

/// Credentials and endpoint for the binary-framed cloud ASR
#[derive(Debug, Clone)]
pub struct BinaryProviderConfig {
    /// WebSocket endpoint of the backend
    pub endpoint: String,

    /// Application id issued by the backend
    pub app_id: Option<String>,

    /// Access token issued by the backend
    pub access_token: Option<String>,

    /// Backend cluster name
    pub cluster: String,
}

impl Default for BinaryProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://openspeech.example.com/api/v2/asr".to_string(),
            app_id: None,
            access_token: None,
            cluster: "volcengine_streaming_common".to_string(),
        }
    }
}

impl BinaryProviderConfig {
    /// Whether required secrets are present; absent secrets put the adapter
    /// into its degraded placeholder mode rather than failing calls
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.app_id.is_some() && self.access_token.is_some()
    }
}

/// Endpoint and decoding options for the JSON-framed self-hosted ASR
#[derive(Debug, Clone)]
pub struct JsonProviderConfig {
    /// WebSocket endpoint of the backend; empty means not configured
    pub endpoint: String,

    /// Decoding mode sent in the configuration message
    pub mode: String,

    /// Apply inverse text normalization on the backend
    pub use_itn: bool,
}

impl Default for JsonProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            mode: "offline".to_string(),
            use_itn: true,
        }
    }
}

impl JsonProviderConfig {
    /// Whether an endpoint has been supplied
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.endpoint.is_empty()
    }
}

/// Language-model collaborator configuration
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Chat-completions endpoint
    pub endpoint: String,

    /// API key; absent key selects the degraded canned-reply path
    pub api_key: Option<String>,

    /// Model identifier
    pub model: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
        }
    }
}

impl ChatConfig {
    /// Whether a call can be attempted at all
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Speech-synthesis collaborator configuration
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Synthesis endpoint
    pub endpoint: String,

    /// API key; absent key selects the silent-frame fallback
    pub api_key: Option<String>,

    /// Voice identifier
    pub voice: String,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/audio/speech".to_string(),
            api_key: None,
            voice: "alloy".to_string(),
        }
    }
}

impl SynthesisConfig {
    /// Whether a call can be attempted at all
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Default wake words used when the config file supplies none
pub const DEFAULT_WAKE_WORDS: &[&str] = &["hello lantern", "hey lantern", "你好小灯"];

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            audio: AudioConfig::default(),
            recognition: RecognitionConfig::default(),
            wake_words: DEFAULT_WAKE_WORDS.iter().map(ToString::to_string).collect(),
            chat: ChatConfig::default(),
            synthesis: SynthesisConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, overlaid by an optional TOML file,
    /// overlaid by environment variables
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let overlay = match path {
            Some(p) => file::load_config_file(p)?,
            None => file::ConfigFile::default(),
        };

        let mut config = Self::default();
        overlay.apply(&mut config);
        Self::apply_env(&mut config);

        if config.audio.min_utterance_chunks > config.audio.buffer_capacity {
            return Err(Error::Config(format!(
                "min_utterance_chunks ({}) exceeds buffer_capacity ({})",
                config.audio.min_utterance_chunks, config.audio.buffer_capacity
            )));
        }

        Ok(config)
    }

    /// Environment-variable overrides (secrets are expected to arrive here)
    fn apply_env(config: &mut Self) {
        if let Ok(v) = std::env::var("LANTERN_ASR_APP_ID") {
            config.recognition.binary.app_id = Some(v);
        }
        if let Ok(v) = std::env::var("LANTERN_ASR_ACCESS_TOKEN") {
            config.recognition.binary.access_token = Some(v);
        }
        if let Ok(v) = std::env::var("LANTERN_CHAT_API_KEY") {
            config.chat.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("LANTERN_TTS_API_KEY") {
            config.synthesis.api_key = Some(v);
        }
    }
}
