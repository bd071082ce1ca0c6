//! Device wire protocol
//!
//! Control frames are newline-free JSON objects multiplexed with raw binary
//! audio over one bidirectional stream per device. Dispatch is a closed
//! tagged union on the `type` field; anything that parses but carries an
//! unrecognized type lands in [`Inbound::Unknown`] and is ignored.

use serde::{Deserialize, Serialize};

/// Negotiated audio stream parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    /// Codec name (devices send "opus")
    pub format: String,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u8,
    /// Frame duration in milliseconds
    pub frame_duration: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: "opus".to_string(),
            sample_rate: 16_000,
            channels: 1,
            frame_duration: 60,
        }
    }
}

impl AudioParams {
    /// Samples per channel in one frame at these parameters
    #[must_use]
    pub const fn frame_size(&self) -> usize {
        (self.sample_rate * self.frame_duration / 1000) as usize
    }
}

/// Listening state reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenState {
    /// Device opened its microphone
    Start,
    /// Device closed its microphone (end of utterance in manual mode,
    /// VAD-stop hint in auto mode)
    Stop,
    /// Device-side wake word fired; `text` carries the trigger phrase
    Detect,
}

/// Listening mode for a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenMode {
    /// Server flushes on voice-activity stop; transcript replaced each turn
    #[default]
    Auto,
    /// Device controls utterance boundaries; transcript appended across turns
    Manual,
}

/// Control frames received from a device
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Capability handshake
    Hello {
        /// Protocol version the device speaks
        version: Option<u32>,
        /// Transport name ("websocket")
        transport: Option<String>,
        /// Device audio parameters
        audio_params: Option<AudioParams>,
        /// Device-assigned identifier
        #[serde(default)]
        device_id: Option<String>,
        /// Human-readable device name
        #[serde(default)]
        device_name: Option<String>,
        /// Hardware MAC address
        #[serde(default)]
        device_mac: Option<String>,
    },
    /// Listening-state change or device-side wake event
    Listen {
        session_id: String,
        state: ListenState,
        #[serde(default)]
        mode: Option<ListenMode>,
        /// Wake phrase for `detect`, appended text otherwise unused
        #[serde(default)]
        text: Option<String>,
    },
    /// Cancel the in-flight response turn
    Abort {
        session_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Direct chat-text submission, bypassing recognition
    Chat {
        session_id: String,
        text: String,
        #[serde(default)]
        state: Option<String>,
    },
    /// Device capability descriptors and state reports
    Iot {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        descriptors: Option<serde_json::Value>,
        #[serde(default)]
        states: Option<serde_json::Value>,
    },
    /// Any well-formed frame with an unrecognized type — logged and ignored
    #[serde(other)]
    Unknown,
}

/// Abort reason sent by devices that barge in on playback
pub const ABORT_WAKE_WORD: &str = "wake_word_detected";

/// Phase of a synthesis event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    /// Synthesis is starting; device should prepare playback
    Start,
    /// A sentence is about to stream; `text` carries it
    SentenceStart,
    /// Playback can drain; no more audio follows for this turn
    Stop,
}

/// Control frames sent to a device
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// Immediate post-accept acknowledgment carrying the connection id
    Ack { connection_id: String },
    /// Handshake reply with the server's session id and audio parameters
    Hello {
        session_id: String,
        transport: String,
        audio_params: AudioParams,
    },
    /// Recognized text for the current utterance
    Stt { session_id: String, text: String },
    /// Language-model reply with a coarse emotion bucket
    Llm {
        session_id: String,
        text: String,
        emotion: String,
    },
    /// Synthesis phase event; `sentence_start` carries the sentence text
    Tts {
        session_id: String,
        state: TtsState,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// Structured protocol error; the connection stays open
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        message: String,
    },
}

/// One outbound unit: either a JSON control frame or raw audio bytes
#[derive(Debug, Clone)]
pub enum Frame {
    /// JSON control frame
    Control(Outbound),
    /// Raw binary audio (Opus-encoded)
    Audio(Vec<u8>),
}
