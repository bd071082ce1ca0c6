//! Binary-framed streaming recognition provider
//!
//! Speaks a proprietary binary envelope to a cloud ASR backend: a 4-byte
//! header carrying protocol version, message type, serialization and
//! compression nibbles, a 4-byte big-endian payload length, and a
//! gzip-compressed payload. The initialization envelope carries JSON
//! (credentials, audio format, request id); audio envelopes carry raw PCM
//! under a different message-type nibble.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use uuid::Uuid;

use super::{RecognitionResult, RecognitionStream};
use crate::config::BinaryProviderConfig;
use crate::protocol::ListenMode;
use crate::{Error, Result};

const PROTOCOL_VERSION: u8 = 0b0001;
const HEADER_SIZE: u8 = 0b0001;

const FULL_CLIENT_REQUEST: u8 = 0b0001;
const AUDIO_ONLY_REQUEST: u8 = 0b0010;
const FULL_SERVER_RESPONSE: u8 = 0b1001;
const SERVER_ERROR_RESPONSE: u8 = 0b1111;

const FLAG_LAST_AUDIO: u8 = 0b0010;

const SERIALIZATION_JSON: u8 = 0b0001;
const SERIALIZATION_RAW: u8 = 0b0000;
const COMPRESSION_GZIP: u8 = 0b0001;

/// Offset of the JSON payload in a normal server reply:
/// header (4) + sequence (4) + payload size (4)
const REPLY_PAYLOAD_OFFSET: usize = 12;

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Writing to a Vec cannot fail
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Recognition(format!("gzip payload: {e}")))?;
    Ok(out)
}

fn envelope(message_type: u8, flags: u8, serialization: u8, payload: &[u8]) -> Vec<u8> {
    let compressed = gzip(payload);
    let mut frame = Vec::with_capacity(8 + compressed.len());
    frame.push((PROTOCOL_VERSION << 4) | HEADER_SIZE);
    frame.push((message_type << 4) | flags);
    frame.push((serialization << 4) | COMPRESSION_GZIP);
    frame.push(0x00);
    #[allow(clippy::cast_possible_truncation)]
    frame.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
    frame.extend_from_slice(&compressed);
    frame
}

/// Build the initialization envelope for one recognition request
#[must_use]
pub fn build_init_envelope(payload_json: &[u8]) -> Vec<u8> {
    envelope(FULL_CLIENT_REQUEST, 0, SERIALIZATION_JSON, payload_json)
}

/// Build an audio envelope; `last` marks the end of the utterance
#[must_use]
pub fn build_audio_envelope(pcm: &[u8], last: bool) -> Vec<u8> {
    let flags = if last { FLAG_LAST_AUDIO } else { 0 };
    envelope(AUDIO_ONLY_REQUEST, flags, SERIALIZATION_RAW, pcm)
}

/// Parsed server reply
#[derive(Debug)]
pub enum Reply {
    /// Normal reply; `last` is set on the closing message of the stream
    Result {
        payload: ReplyPayload,
        last: bool,
    },
    /// Backend-signalled error
    Error {
        /// Signed 32-bit error code from bytes 4..8
        code: i32,
        message: String,
    },
}

/// JSON body of a normal reply
#[derive(Debug, Default, Deserialize)]
pub struct ReplyPayload {
    #[serde(default)]
    pub reqid: Option<String>,
    #[serde(default)]
    pub result: Option<Vec<ReplyResult>>,
}

/// One recognition alternative
#[derive(Debug, Deserialize)]
pub struct ReplyResult {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub utterances: Option<Vec<ReplyUtterance>>,
}

/// One utterance within an alternative; `definite` marks settled text
#[derive(Debug, Deserialize)]
pub struct ReplyUtterance {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub definite: bool,
}

/// Parse a server reply envelope
///
/// # Errors
///
/// Returns error on truncated frames, unknown message types, or payloads
/// that fail to decompress or parse.
pub fn parse_reply(data: &[u8]) -> Result<Reply> {
    if data.len() < 4 {
        return Err(Error::Recognition(format!("reply too short: {} bytes", data.len())));
    }
    let message_type = data[1] >> 4;
    let flags = data[1] & 0x0F;
    let compression = data[2] & 0x0F;

    match message_type {
        SERVER_ERROR_RESPONSE => {
            if data.len() < REPLY_PAYLOAD_OFFSET {
                return Err(Error::Recognition("truncated error reply".to_string()));
            }
            let code = i32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            let body = &data[REPLY_PAYLOAD_OFFSET..];
            let message = if compression == COMPRESSION_GZIP {
                gunzip(body)
                    .ok()
                    .and_then(|b| String::from_utf8(b).ok())
                    .unwrap_or_default()
            } else {
                String::from_utf8_lossy(body).into_owned()
            };
            Ok(Reply::Error { code, message })
        }
        FULL_SERVER_RESPONSE => {
            if data.len() < REPLY_PAYLOAD_OFFSET {
                return Err(Error::Recognition("truncated reply".to_string()));
            }
            let body = &data[REPLY_PAYLOAD_OFFSET..];
            let json = if compression == COMPRESSION_GZIP {
                gunzip(body)?
            } else {
                body.to_vec()
            };
            let payload: ReplyPayload = if json.is_empty() {
                ReplyPayload::default()
            } else {
                serde_json::from_slice(&json)?
            };
            Ok(Reply::Result {
                payload,
                last: flags & FLAG_LAST_AUDIO != 0,
            })
        }
        other => Err(Error::Recognition(format!("unknown reply type {other:#06b}"))),
    }
}

/// Adapter for the binary-framed cloud ASR
pub struct BinaryAsr {
    config: BinaryProviderConfig,
}

impl BinaryAsr {
    /// Provider tag stamped on results
    pub const PROVIDER: &'static str = "binary_asr";

    /// Create the adapter; missing secrets put it in degraded mode
    #[must_use]
    pub const fn new(config: BinaryProviderConfig) -> Self {
        Self { config }
    }

    /// Whether the required secrets are present
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    fn init_payload(&self, session_id: &str, reqid: &str) -> serde_json::Value {
        serde_json::json!({
            "app": {
                "appid": self.config.app_id.as_deref().unwrap_or_default(),
                "token": self.config.access_token.as_deref().unwrap_or_default(),
                "cluster": self.config.cluster,
            },
            "user": { "uid": session_id },
            "request": {
                "reqid": reqid,
                "nbest": 1,
                "result_type": "full",
                "show_utterances": true,
                "sequence": 1,
            },
            "audio": {
                "format": "pcm",
                "rate": 16_000,
                "bits": 16,
                "channel": 1,
            },
        })
    }

    /// Open a streaming recognition session
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is invalid or the socket cannot be
    /// established.
    pub async fn open_stream(
        &self,
        session_id: &str,
        mode: ListenMode,
    ) -> Result<RecognitionStream> {
        url::Url::parse(&self.config.endpoint)
            .map_err(|e| Error::Config(format!("asr endpoint: {e}")))?;

        let reqid = Uuid::new_v4().to_string();
        let mut request = self
            .config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(Error::WebSocket)?;
        if let Some(token) = &self.config.access_token {
            let value = format!("Bearer; {token}")
                .parse()
                .map_err(|_| Error::Config("access token is not a valid header value".to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws, _) = connect_async(request).await?;
        tracing::debug!(session_id, reqid = %reqid, "binary asr stream open");

        let init = build_init_envelope(&serde_json::to_vec(
            &self.init_payload(session_id, &reqid),
        )?);

        let (feed_tx, feed_rx) = mpsc::channel(64);
        let (result_tx, result_rx) = oneshot::channel();
        let partial = Arc::new(Mutex::new(String::new()));

        let worker_partial = Arc::clone(&partial);
        let worker = tokio::spawn(async move {
            let outcome = drive_stream(ws, init, mode, feed_rx, &worker_partial).await;
            let _ = result_tx.send(outcome);
        });

        Ok(RecognitionStream::new(
            reqid,
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
    init: Vec<u8>,
    mode: ListenMode,
    mut feed_rx: mpsc::Receiver<Bytes>,
    partial: &Arc<Mutex<String>>,
) -> Result<RecognitionResult> {
    let (mut sink, mut stream) = ws.split();
    sink.send(Message::Binary(init)).await?;

    // Text settled by `definite` utterances, concatenated for manual mode
    let mut assembled = String::new();
    // Full text of the most recent reply, used in auto mode
    let mut latest = String::new();
    let mut audio_done = false;

    loop {
        tokio::select! {
            chunk = feed_rx.recv(), if !audio_done => {
                match chunk {
                    Some(pcm) => {
                        sink.send(Message::Binary(build_audio_envelope(&pcm, false))).await?;
                    }
                    None => {
                        sink.send(Message::Binary(build_audio_envelope(&[], true))).await?;
                        audio_done = true;
                    }
                }
            }
            reply = stream.next() => {
                let Some(message) = reply else { break };
                let message = message?;
                if !message.is_binary() {
                    continue;
                }
                match parse_reply(&message.into_data())? {
                    Reply::Error { code, message } => {
                        return Err(Error::Backend { code, message });
                    }
                    Reply::Result { payload, last } => {
                        absorb_reply(&payload, &mut assembled, &mut latest, partial);
                        if last {
                            let text = match mode {
                                ListenMode::Auto => latest,
                                ListenMode::Manual => assembled,
                            };
                            return Ok(RecognitionResult::text_only(
                                text,
                                1.0,
                                BinaryAsr::PROVIDER,
                            ));
                        }
                    }
                }
            }
        }
    }

    // Backend closed without a last-flagged reply; settle for what we have
    let text = match mode {
        ListenMode::Auto => latest,
        ListenMode::Manual => assembled,
    };
    Ok(RecognitionResult::text_only(text, 0.0, BinaryAsr::PROVIDER))
}

fn absorb_reply(
    payload: &ReplyPayload,
    assembled: &mut String,
    latest: &mut String,
    partial: &Arc<Mutex<String>>,
) {
    let Some(results) = &payload.result else { return };
    for result in results {
        if let Some(text) = &result.text {
            latest.clone_from(text);
        }
        for utterance in result.utterances.iter().flatten() {
            if utterance.definite {
                assembled.push_str(&utterance.text);
            }
        }
    }
    let mut guard = partial.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    guard.clone_from(latest);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_envelope_length_field_matches_gzip_payload() {
        // Round-trip property on the framing layer, independent of network
        for payload in [
            br#"{}"#.to_vec(),
            br#"{"app":{"appid":"a","token":"t","cluster":"c"}}"#.to_vec(),
            vec![0u8; 10_000],
            "非 ASCII ペイロード".as_bytes().to_vec(),
        ] {
            let frame = build_init_envelope(&payload);
            let declared =
                u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
            assert_eq!(declared, frame.len() - 8);
            assert_eq!(gunzip(&frame[8..]).unwrap(), payload);
        }
    }

    #[test]
    fn init_header_nibbles() {
        let frame = build_init_envelope(b"{}");
        assert_eq!(frame[0], 0x11);
        assert_eq!(frame[1] >> 4, FULL_CLIENT_REQUEST);
        assert_eq!(frame[2], (SERIALIZATION_JSON << 4) | COMPRESSION_GZIP);
        assert_eq!(frame[3], 0x00);
    }

    #[test]
    fn audio_envelope_uses_audio_type_and_last_flag() {
        let frame = build_audio_envelope(&[1, 2, 3], false);
        assert_eq!(frame[1] >> 4, AUDIO_ONLY_REQUEST);
        assert_eq!(frame[1] & 0x0F, 0);

        let frame = build_audio_envelope(&[], true);
        assert_eq!(frame[1] & 0x0F, FLAG_LAST_AUDIO);
    }

    #[test]
    fn parses_error_reply_code() {
        let mut frame = vec![
            0x11,
            SERVER_ERROR_RESPONSE << 4,
            0x00,
            0x00,
        ];
        frame.extend_from_slice(&(-1001i32).to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(b"quota exceeded");

        match parse_reply(&frame).unwrap() {
            Reply::Error { code, message } => {
                assert_eq!(code, -1001);
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("expected error reply, got {other:?}"),
        }
    }

    #[test]
    fn parses_normal_reply_with_definite_utterances() {
        let body = serde_json::json!({
            "reqid": "r1",
            "result": [{
                "text": "hello world",
                "utterances": [
                    {"text": "hello ", "definite": true},
                    {"text": "world", "definite": false},
                ],
            }],
        });
        let compressed = gzip(&serde_json::to_vec(&body).unwrap());
        let mut frame = vec![
            0x11,
            (FULL_SERVER_RESPONSE << 4) | FLAG_LAST_AUDIO,
            (SERIALIZATION_JSON << 4) | COMPRESSION_GZIP,
            0x00,
        ];
        frame.extend_from_slice(&1u32.to_be_bytes()); // sequence
        #[allow(clippy::cast_possible_truncation)]
        frame.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
        frame.extend_from_slice(&compressed);

        match parse_reply(&frame).unwrap() {
            Reply::Result { payload, last } => {
                assert!(last);
                let result = &payload.result.unwrap()[0];
                assert_eq!(result.text.as_deref(), Some("hello world"));
                let utterances = result.utterances.as_ref().unwrap();
                assert!(utterances[0].definite);
                assert!(!utterances[1].definite);
            }
            other => panic!("expected result reply, got {other:?}"),
        }
    }

    #[test]
    fn short_frame_is_an_error_not_a_panic() {
        assert!(parse_reply(&[0x11]).is_err());
        assert!(parse_reply(&[0x11, FULL_SERVER_RESPONSE << 4, 0x11, 0x00]).is_err());
    }

    #[test]
    fn absorb_accumulates_definite_only() {
        let partial = Arc::new(Mutex::new(String::new()));
        let mut assembled = String::new();
        let mut latest = String::new();

        let payload: ReplyPayload = serde_json::from_value(serde_json::json!({
            "result": [{
                "text": "partial tex",
                "utterances": [{"text": "settled.", "definite": true}],
            }],
        }))
        .unwrap();
        absorb_reply(&payload, &mut assembled, &mut latest, &partial);

        assert_eq!(assembled, "settled.");
        assert_eq!(latest, "partial tex");
        assert_eq!(*partial.lock().unwrap(), "partial tex");
    }
}
