//! Lantern Gateway - Voice session backend for ESP32-class IoT endpoints
//!
//! This library provides the core functionality for the Lantern gateway:
//! - Device session protocol (handshake, control dispatch, teardown)
//! - Per-session audio ingestion (Opus decode, VAD-gated buffering)
//! - Streaming speech-recognition orchestration across backends
//! - Wake-word gating and the response turn pipeline (LLM + TTS)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 Devices (WebSocket)                   │
//! │   control JSON frames  │  binary Opus audio frames   │
//! └───────────────────────┬──────────────────────────────┘
//!                         │
//! ┌───────────────────────▼──────────────────────────────┐
//! │                  Lantern Gateway                      │
//! │  Protocol FSM │ Registry │ Audio Buffer │ Wake Gate  │
//! └───────────────────────┬──────────────────────────────┘
//!                         │
//! ┌───────────────────────▼──────────────────────────────┐
//! │              Collaborator backends                    │
//! │   Streaming ASR  │  Chat model  │  Speech synthesis  │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod asr;
pub mod audio;
pub mod config;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tts;
pub mod wake;

pub use asr::{Recognition, RecognitionResult, RecognitionStream, strip_tags};
pub use audio::{AudioBuffer, AudioChunk, AudioCodec, VadEdge};
pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, TurnPhase, classify_emotion};
pub use protocol::{AudioParams, Frame, Inbound, ListenMode, ListenState, Outbound, TtsState};
pub use server::{GatewayState, router, serve};
pub use session::{DeviceHints, SessionHandle, SessionRegistry};
pub use wake::WakeWordGate;
