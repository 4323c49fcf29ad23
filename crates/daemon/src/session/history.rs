//! Bounded output history for replay to late-joining clients.

use std::collections::VecDeque;

/// Fixed-capacity byte buffer holding the most recent session output.
///
/// Appends past the capacity evict the oldest bytes first, so the buffer
/// always holds the trailing `capacity` bytes of everything written.
#[derive(Debug)]
pub struct HistoryBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl HistoryBuffer {
    /// Creates an empty buffer retaining at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
        }
    }

    /// Appends output, evicting from the front to stay within capacity.
    pub fn append(&mut self, data: &[u8]) {
        if data.len() >= self.capacity {
            // Larger than the whole buffer: keep only the tail
            self.bytes.clear();
            self.bytes.extend(&data[data.len() - self.capacity..]);
            return;
        }

        let overflow = (self.bytes.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.bytes.drain(..overflow);
        }
        self.bytes.extend(data);
    }

    /// Returns a contiguous copy of the retained bytes, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        let (front, back) = self.bytes.as_slices();
        let mut out = Vec::with_capacity(self.bytes.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        out
    }

    /// Number of bytes currently retained.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when nothing has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Maximum number of bytes the buffer retains.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_buffer() {
        let buf = HistoryBuffer::new(16);
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.snapshot(), Vec::<u8>::new());
    }

    #[test]
    fn test_append_under_capacity() {
        let mut buf = HistoryBuffer::new(16);
        buf.append(b"hello");
        buf.append(b" world");
        assert_eq!(buf.snapshot(), b"hello world");
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn test_eviction_keeps_newest_bytes() {
        let mut buf = HistoryBuffer::new(8);
        buf.append(b"abcdefgh");
        buf.append(b"XY");
        // Oldest two bytes dropped, newest retained in order
        assert_eq!(buf.snapshot(), b"cdefghXY");
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_oversized_append_keeps_tail() {
        let mut buf = HistoryBuffer::new(4);
        buf.append(b"0123456789");
        assert_eq!(buf.snapshot(), b"6789");
    }

    #[test]
    fn test_exact_capacity_append() {
        let mut buf = HistoryBuffer::new(4);
        buf.append(b"abcd");
        assert_eq!(buf.snapshot(), b"abcd");

        buf.append(b"efgh");
        assert_eq!(buf.snapshot(), b"efgh");
    }

    #[test]
    fn test_replay_equals_tail_of_all_output() {
        // The property clients rely on: after N bytes of output, the
        // snapshot equals the last min(N, cap) bytes, byte for byte.
        let cap = 32;
        let mut buf = HistoryBuffer::new(cap);
        let mut all = Vec::new();

        for chunk in 0..20u8 {
            let data: Vec<u8> = (0..7).map(|i| chunk.wrapping_mul(7).wrapping_add(i)).collect();
            all.extend_from_slice(&data);
            buf.append(&data);

            let expected_start = all.len().saturating_sub(cap);
            assert_eq!(buf.snapshot(), &all[expected_start..]);
        }
    }
}
