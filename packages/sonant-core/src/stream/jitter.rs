//! Byte-addressed circular buffer smoothing model audio into carrier
//! frames.
//!
//! The ring absorbs variable-size chunks from the output pipeline and
//! releases exactly `frame_size` bytes per read. Capacity is fixed at
//! construction (≥ 4 × the configured maximum buffered audio, floor
//! 32 KiB) so writes never allocate; wrap-around is handled with two
//! copies. Overflow discards the oldest bytes, never the newest.

use crate::protocol_constants::{RING_CAPACITY_FACTOR, RING_CAPACITY_MIN};

/// Fixed-capacity byte ring with drop-oldest overflow.
///
/// Single-writer (output pipeline) / single-reader (framer tick); the
/// owner serializes access.
pub struct JitterBuffer {
    ring: Vec<u8>,
    read: usize,
    write: usize,
    len: usize,
    frame_size: usize,
    max_buffer_bytes: usize,
}

impl JitterBuffer {
    /// Creates a ring sized for `max_buffer_bytes` of queued audio.
    pub fn new(frame_size: usize, max_buffer_bytes: usize) -> Self {
        let capacity = (max_buffer_bytes * RING_CAPACITY_FACTOR).max(RING_CAPACITY_MIN);
        Self {
            ring: vec![0u8; capacity],
            read: 0,
            write: 0,
            len: 0,
            frame_size,
            max_buffer_bytes,
        }
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Configured frame size in bytes.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Fill level relative to the configured maximum, 0.0-1.0+.
    #[must_use]
    pub fn level(&self) -> f64 {
        self.len as f64 / self.max_buffer_bytes as f64
    }

    /// Whether a full frame is available to read.
    #[must_use]
    pub fn has_frame(&self) -> bool {
        self.len >= self.frame_size
    }

    /// Appends audio, discarding the oldest bytes when the configured
    /// maximum would be exceeded.
    ///
    /// Returns the fill level observed at the moment of overflow, or
    /// `None` when nothing was discarded.
    pub fn push(&mut self, mut bytes: &[u8]) -> Option<f64> {
        if bytes.is_empty() {
            return None;
        }

        let mut overflow_level = None;

        // A chunk larger than the whole window keeps only its newest tail.
        if bytes.len() > self.max_buffer_bytes {
            overflow_level = Some(self.level());
            bytes = &bytes[bytes.len() - self.max_buffer_bytes..];
        }

        if self.len + bytes.len() > self.max_buffer_bytes {
            let level = self.level();
            let excess = self.len + bytes.len() - self.max_buffer_bytes;
            self.discard_oldest(excess);
            overflow_level.get_or_insert(level);
        }

        // Two-copy write around the wrap point.
        let capacity = self.ring.len();
        let first = bytes.len().min(capacity - self.write);
        self.ring[self.write..self.write + first].copy_from_slice(&bytes[..first]);
        let rest = bytes.len() - first;
        if rest > 0 {
            self.ring[..rest].copy_from_slice(&bytes[first..]);
        }
        self.write = (self.write + bytes.len()) % capacity;
        self.len += bytes.len();

        overflow_level
    }

    /// Advances the read cursor past the oldest `count` bytes.
    fn discard_oldest(&mut self, count: usize) {
        let dropped = count.min(self.len);
        self.read = (self.read + dropped) % self.ring.len();
        self.len -= dropped;
    }

    /// Reads exactly one frame into `out`.
    ///
    /// Returns false (leaving the buffer untouched) when less than a
    /// full frame is available. `out` must be `frame_size` bytes.
    pub fn pop_frame(&mut self, out: &mut [u8]) -> bool {
        debug_assert_eq!(out.len(), self.frame_size);
        if self.len < self.frame_size {
            return false;
        }
        self.read_into(out);
        true
    }

    /// Drains whatever remains (less than one frame) into the front of
    /// `out`, returning the byte count moved.
    pub fn drain_partial(&mut self, out: &mut [u8]) -> usize {
        let count = self.len.min(out.len());
        if count > 0 {
            let mut scratch = vec![0u8; count];
            self.read_into(&mut scratch);
            out[..count].copy_from_slice(&scratch);
        }
        count
    }

    fn read_into(&mut self, out: &mut [u8]) {
        let capacity = self.ring.len();
        let count = out.len();
        let first = count.min(capacity - self.read);
        out[..first].copy_from_slice(&self.ring[self.read..self.read + first]);
        let rest = count - first;
        if rest > 0 {
            out[first..].copy_from_slice(&self.ring[..rest]);
        }
        self.read = (self.read + count) % capacity;
        self.len -= count;
    }

    /// Zeroes the ring and resets the cursors.
    pub fn clear(&mut self) {
        self.ring.fill(0);
        self.read = 0;
        self.write = 0;
        self.len = 0;
    }
}
