//! LZ history window shared by the chunks of an LZMA2 stream.
//!
//! The window is a ring of the dictionary size. Unlike a plain ring buffer
//! it tracks the total number of bytes produced since the last dictionary
//! reset, which is what match distances are validated against: a distance is
//! only usable if that many bytes exist since the reset.

/// Smallest dictionary the format allows.
pub const DICT_SIZE_MIN: u32 = 4096;

/// LZ history ring with dictionary-reset tracking.
#[derive(Debug)]
pub struct DecodeWindow {
    buf: Vec<u8>,
    /// Next write index in `buf`.
    pos: usize,
    /// Bytes produced since the last dictionary reset.
    total: u64,
}

impl DecodeWindow {
    /// Create a window of `dict_size` bytes (clamped up to the format
    /// minimum).
    pub fn new(dict_size: u32) -> Self {
        let size = dict_size.max(DICT_SIZE_MIN) as usize;
        Self {
            buf: vec![0; size],
            pos: 0,
            total: 0,
        }
    }

    /// Forget all history (dictionary reset).
    pub fn reset(&mut self) {
        self.pos = 0;
        self.total = 0;
    }

    /// Bytes produced since the last reset.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Whether a match distance is backed by real history.
    /// `dist` is zero-based: 0 refers to the most recent byte.
    pub fn has_history(&self, dist: u32) -> bool {
        u64::from(dist) < self.total && (dist as usize) < self.buf.len()
    }

    /// Record one produced byte.
    pub fn push(&mut self, byte: u8) {
        self.buf[self.pos] = byte;
        self.pos += 1;
        if self.pos == self.buf.len() {
            self.pos = 0;
        }
        self.total += 1;
    }

    /// Fetch the byte `dist` positions back (0 = most recent).
    ///
    /// The caller must have validated the distance with
    /// [`has_history`](Self::has_history).
    pub fn peek(&self, dist: u32) -> u8 {
        let dist = dist as usize;
        let idx = if self.pos > dist {
            self.pos - dist - 1
        } else {
            self.buf.len() - (dist - self.pos) - 1
        };
        self.buf[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_peek() {
        let mut window = DecodeWindow::new(DICT_SIZE_MIN);
        for byte in b"abcdef" {
            window.push(*byte);
        }
        assert_eq!(window.peek(0), b'f');
        assert_eq!(window.peek(5), b'a');
        assert_eq!(window.total(), 6);
    }

    #[test]
    fn test_wraparound() {
        let mut window = DecodeWindow::new(DICT_SIZE_MIN);
        let size = DICT_SIZE_MIN as usize;
        for i in 0..size + 10 {
            window.push((i % 251) as u8);
        }
        assert_eq!(window.peek(0), ((size + 9) % 251) as u8);
        assert_eq!(window.peek(size as u32 - 1), (11 % 251) as u8);
    }

    #[test]
    fn test_history_validation() {
        let mut window = DecodeWindow::new(DICT_SIZE_MIN);
        assert!(!window.has_history(0));
        window.push(1);
        assert!(window.has_history(0));
        assert!(!window.has_history(1));

        window.reset();
        assert_eq!(window.total(), 0);
        assert!(!window.has_history(0));
    }
}
