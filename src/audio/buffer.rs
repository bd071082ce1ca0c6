//! Bounded per-session audio ring
//!
//! Overflow is not an error: the oldest chunk is evicted and counted so tests
//! and the health surface can observe data loss beyond the window.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;

/// One inbound unit of audio, already decoded to linear PCM
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Little-endian 16-bit PCM samples
    pub pcm: Bytes,
    /// Arrival time
    pub received_at: Instant,
    /// Voice-activity hint supplied by the sender or on-device VAD
    pub voiced: bool,
}

impl AudioChunk {
    /// Build a chunk stamped with the current time
    #[must_use]
    pub fn new(pcm: Bytes, voiced: bool) -> Self {
        Self {
            pcm,
            received_at: Instant::now(),
            voiced,
        }
    }
}

/// Voice-activity transition observed across consecutive chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEdge {
    /// Hint crossed inactive → active
    Rise,
    /// Hint crossed active → inactive; in auto mode this ends the utterance
    Fall,
}

/// Rolling store of received chunks with a voice-activity flag
#[derive(Debug)]
pub struct AudioBuffer {
    chunks: VecDeque<AudioChunk>,
    capacity: usize,
    min_flush_chunks: usize,
    overflow: u64,
    last_voiced: bool,
}

impl AudioBuffer {
    /// Create a buffer holding at most `capacity` chunks; flushes with fewer
    /// than `min_flush_chunks` are discarded as noise
    #[must_use]
    pub fn new(capacity: usize, min_flush_chunks: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(capacity),
            capacity,
            min_flush_chunks,
            overflow: 0,
            last_voiced: false,
        }
    }

    /// Append a chunk, evicting the oldest on overflow
    ///
    /// Returns the voice-activity edge this chunk produced, if any. The
    /// caller flushes on [`VadEdge::Fall`] when the session is in auto mode.
    pub fn ingest(&mut self, chunk: AudioChunk) -> Option<VadEdge> {
        let edge = match (self.last_voiced, chunk.voiced) {
            (false, true) => Some(VadEdge::Rise),
            (true, false) => Some(VadEdge::Fall),
            _ => None,
        };
        self.last_voiced = chunk.voiced;

        if self.chunks.len() == self.capacity {
            self.chunks.pop_front();
            self.overflow += 1;
        }
        self.chunks.push_back(chunk);

        edge
    }

    /// Atomically snapshot and clear the accumulated utterance
    ///
    /// Returns `None` when the snapshot is below the minimum chunk count;
    /// the buffer is cleared either way, so an utterance is delivered at
    /// most once and the next `ingest` starts a fresh accumulation.
    pub fn flush(&mut self) -> Option<Vec<AudioChunk>> {
        let snapshot: Vec<AudioChunk> = self.chunks.drain(..).collect();
        self.last_voiced = false;

        if snapshot.len() < self.min_flush_chunks {
            if !snapshot.is_empty() {
                tracing::debug!(chunks = snapshot.len(), "discarding short utterance");
            }
            return None;
        }
        Some(snapshot)
    }

    /// Drop everything without producing an utterance (barge-in, teardown)
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.last_voiced = false;
    }

    /// Chunks currently buffered
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the buffer holds no chunks
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunks evicted due to overflow since creation
    #[must_use]
    pub const fn overflow_count(&self) -> u64 {
        self.overflow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voiced_chunk() -> AudioChunk {
        AudioChunk::new(Bytes::from_static(&[0u8; 320]), true)
    }

    fn silent_chunk() -> AudioChunk {
        AudioChunk::new(Bytes::from_static(&[0u8; 320]), false)
    }

    #[test]
    fn overflow_evicts_oldest_and_counts() {
        let mut buffer = AudioBuffer::new(3, 1);
        for _ in 0..5 {
            buffer.ingest(voiced_chunk());
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.overflow_count(), 2);
    }

    #[test]
    fn short_flush_is_discarded_but_clears() {
        let mut buffer = AudioBuffer::new(100, 15);
        for _ in 0..10 {
            buffer.ingest(voiced_chunk());
        }
        assert!(buffer.flush().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn flush_at_threshold_is_forwarded() {
        let mut buffer = AudioBuffer::new(100, 15);
        for _ in 0..15 {
            buffer.ingest(voiced_chunk());
        }
        let utterance = buffer.flush().unwrap();
        assert_eq!(utterance.len(), 15);
        assert!(buffer.is_empty());
    }

    #[test]
    fn no_leakage_across_utterances() {
        let mut buffer = AudioBuffer::new(100, 2);
        for _ in 0..4 {
            buffer.ingest(voiced_chunk());
        }
        assert_eq!(buffer.flush().unwrap().len(), 4);

        buffer.ingest(voiced_chunk());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn vad_edges_reported_on_crossings() {
        let mut buffer = AudioBuffer::new(100, 1);
        assert_eq!(buffer.ingest(silent_chunk()), None);
        assert_eq!(buffer.ingest(voiced_chunk()), Some(VadEdge::Rise));
        assert_eq!(buffer.ingest(voiced_chunk()), None);
        assert_eq!(buffer.ingest(silent_chunk()), Some(VadEdge::Fall));
    }

    #[test]
    fn flush_resets_vad_tracking() {
        let mut buffer = AudioBuffer::new(100, 1);
        buffer.ingest(voiced_chunk());
        buffer.flush();
        // Fresh accumulation: first voiced chunk is a new rise
        assert_eq!(buffer.ingest(voiced_chunk()), Some(VadEdge::Rise));
    }
}
