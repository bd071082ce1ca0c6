//! Per-session audio pipeline
//!
//! Inbound Opus frames are decoded by the codec adapter and accumulated in a
//! bounded ring until a voice-activity stop (auto mode) or an explicit stop
//! control message (manual mode) flushes the utterance to recognition.

mod buffer;
mod codec;

pub use buffer::{AudioBuffer, AudioChunk, VadEdge};
pub use codec::AudioCodec;
