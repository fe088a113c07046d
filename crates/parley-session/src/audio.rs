//! Bounded audio buffer and PCM16 level metering.

use std::collections::VecDeque;

/// Ordered PCM bytes held while the connection is down.
///
/// Never grows past `max_bytes`: appending beyond the cap drops the oldest
/// bytes first.
#[derive(Debug)]
pub struct AudioBuffer {
    data: VecDeque<u8>,
    max_bytes: usize,
    dropped: u64,
}

impl AudioBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            data: VecDeque::new(),
            max_bytes,
            dropped: 0,
        }
    }

    /// Append bytes, trimming from the front. Returns how many bytes were dropped.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        if bytes.len() >= self.max_bytes {
            let dropped = self.data.len() + (bytes.len() - self.max_bytes);
            self.data.clear();
            self.data.extend(&bytes[bytes.len() - self.max_bytes..]);
            self.dropped += dropped as u64;
            return dropped;
        }

        self.data.extend(bytes);
        let excess = self.data.len().saturating_sub(self.max_bytes);
        if excess > 0 {
            self.data.drain(..excess);
            self.dropped += excess as u64;
        }
        excess
    }

    /// Remove and return everything, oldest first.
    pub fn take(&mut self) -> Vec<u8> {
        self.data.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Total bytes discarded by trimming since creation.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped
    }
}

/// RMS level of little-endian PCM16 audio, normalised to `0.0..=1.0`.
/// A trailing odd byte is ignored.
pub fn pcm16_level(bytes: &[u8]) -> f32 {
    let samples = bytes.chunks_exact(2);
    let count = samples.len();
    if count == 0 {
        return 0.0;
    }
    let sum: f64 = samples
        .map(|pair| {
            let s = i16::from_le_bytes([pair[0], pair[1]]) as f64;
            s * s
        })
        .sum();
    let rms = (sum / count as f64).sqrt();
    (rms / i16::MAX as f64).min(1.0) as f32
}
