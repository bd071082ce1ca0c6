//! Opus codec adapter
//!
//! Each session owns exactly one instance, created when audio parameters are
//! negotiated. Decoder state and frame-size expectations are per-stream, so
//! instances are never shared across sessions.

use bytes::Bytes;

use crate::protocol::AudioParams;
use crate::{Error, Result};

/// Per-session Opus decoder/encoder pair
pub struct AudioCodec {
    decoder: opus::Decoder,
    encoder: opus::Encoder,
    /// Samples per channel in one frame
    frame_size: usize,
    channels: usize,
    decode_failures: u64,
}

impl std::fmt::Debug for AudioCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCodec")
            .field("frame_size", &self.frame_size)
            .field("channels", &self.channels)
            .field("decode_failures", &self.decode_failures)
            .finish_non_exhaustive()
    }
}

impl AudioCodec {
    /// Create a codec sized to the negotiated stream parameters
    ///
    /// # Errors
    ///
    /// Returns error if the sample rate or channel count is not one Opus
    /// supports.
    pub fn new(params: &AudioParams) -> Result<Self> {
        let channels = match params.channels {
            1 => opus::Channels::Mono,
            2 => opus::Channels::Stereo,
            other => {
                return Err(Error::Codec(format!("unsupported channel count: {other}")));
            }
        };

        let decoder = opus::Decoder::new(params.sample_rate, channels)
            .map_err(|e| Error::Codec(format!("decoder init: {e}")))?;
        let encoder = opus::Encoder::new(params.sample_rate, channels, opus::Application::Voip)
            .map_err(|e| Error::Codec(format!("encoder init: {e}")))?;

        Ok(Self {
            decoder,
            encoder,
            frame_size: params.frame_size(),
            channels: params.channels as usize,
            decode_failures: 0,
        })
    }

    /// Decode one Opus frame to little-endian 16-bit PCM
    ///
    /// Decode failures are non-fatal: a corrupt frame yields an empty result
    /// and bumps the failure counter, and the stream carries on.
    pub fn decode(&mut self, frame: &[u8]) -> Bytes {
        let mut pcm = vec![0i16; self.frame_size * self.channels];
        match self.decoder.decode(frame, &mut pcm, false) {
            Ok(samples) => {
                pcm.truncate(samples * self.channels);
                let mut out = Vec::with_capacity(pcm.len() * 2);
                for sample in pcm {
                    out.extend_from_slice(&sample.to_le_bytes());
                }
                Bytes::from(out)
            }
            Err(e) => {
                self.decode_failures += 1;
                tracing::debug!(error = %e, bytes = frame.len(), "dropping undecodable frame");
                Bytes::new()
            }
        }
    }

    /// Encode one frame of silence
    ///
    /// Used by the response orchestrator when synthesis fails, so the device
    /// playback state machine still sees exactly one audio frame.
    ///
    /// # Errors
    ///
    /// Returns error if the encoder rejects the frame.
    pub fn encode_silence(&mut self) -> Result<Vec<u8>> {
        let pcm = vec![0i16; self.frame_size * self.channels];
        self.encoder
            .encode_vec(&pcm, 4000)
            .map_err(|e| Error::Codec(format!("encode: {e}")))
    }

    /// Frames that failed to decode since creation
    #[must_use]
    pub const fn decode_failures(&self) -> u64 {
        self.decode_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> AudioCodec {
        AudioCodec::new(&AudioParams::default()).unwrap()
    }

    #[test]
    fn corrupt_frame_yields_empty_and_counts() {
        let mut codec = codec();
        let garbage = [0xFFu8; 7];
        let pcm = codec.decode(&garbage);
        assert!(pcm.is_empty());
        assert_eq!(codec.decode_failures(), 1);
    }

    #[test]
    fn decode_survives_repeated_corruption() {
        let mut codec = codec();
        for _ in 0..10 {
            codec.decode(&[0xAB, 0xCD, 0xEF]);
        }
        assert_eq!(codec.decode_failures(), 10);
        // A valid frame afterwards still decodes
        let silence = codec.encode_silence().unwrap();
        assert!(!codec.decode(&silence).is_empty());
    }

    #[test]
    fn silence_round_trip() {
        let mut codec = codec();
        let frame = codec.encode_silence().unwrap();
        assert!(!frame.is_empty());

        let pcm = codec.decode(&frame);
        let params = AudioParams::default();
        assert_eq!(pcm.len(), params.frame_size() * 2);
    }

    #[test]
    fn rejects_unsupported_channel_count() {
        let params = AudioParams {
            channels: 6,
            ..AudioParams::default()
        };
        assert!(AudioCodec::new(&params).is_err());
    }
}
