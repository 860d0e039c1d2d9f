// ABOUTME: Small per-connection receive buffer feeding synchronous reads
// ABOUTME: Lets byte-scanning framers avoid one kernel call per byte

/// Capacity of the per-connection receive buffer.
pub(crate) const RXBUF_CAPACITY: usize = 2048;

/// Fixed-capacity receive buffer with two cursors.
///
/// Filled opportunistically by the transport, consumed byte-by-byte (or in
/// small slices) by framers that scan for delimiters. When the caller's
/// remaining need is at least the buffer capacity the transport bypasses the
/// buffer entirely and reads straight into the caller's memory.
pub(crate) struct RxBuf {
    data: Box<[u8]>,
    pos: usize,
    len: usize,
}

impl RxBuf {
    pub(crate) fn new() -> Self {
        RxBuf {
            data: vec![0u8; RXBUF_CAPACITY].into_boxed_slice(),
            pos: 0,
            len: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos == self.len
    }

    /// Copy up to `dst.len()` buffered bytes into `dst`, advancing the read
    /// cursor. Returns the number of bytes copied; zero means the buffer is
    /// empty and needs a refill.
    pub(crate) fn consume(&mut self, dst: &mut [u8]) -> usize {
        let avail = self.len - self.pos;
        let n = avail.min(dst.len());
        dst[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    /// The writable region for a refill. Only valid when the buffer is empty;
    /// the cursors are reset so the whole capacity is available.
    pub(crate) fn writable(&mut self) -> &mut [u8] {
        debug_assert!(self.is_empty());
        self.pos = 0;
        self.len = 0;
        &mut self.data[..]
    }

    /// Record that `n` bytes were written into the region returned by
    /// [`RxBuf::writable`].
    pub(crate) fn filled(&mut self, n: usize) {
        debug_assert!(n <= self.data.len());
        self.len = n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_in_pieces() {
        let mut buf = RxBuf::new();
        let w = buf.writable();
        w[..5].copy_from_slice(b"hello");
        buf.filled(5);

        let mut out = [0u8; 2];
        assert_eq!(buf.consume(&mut out), 2);
        assert_eq!(&out, b"he");
        let mut out = [0u8; 8];
        assert_eq!(buf.consume(&mut out), 3);
        assert_eq!(&out[..3], b"llo");
        assert!(buf.is_empty());
        assert_eq!(buf.consume(&mut out), 0);
    }

    #[test]
    fn test_refill_resets_cursors() {
        let mut buf = RxBuf::new();
        let w = buf.writable();
        w[0] = b'x';
        buf.filled(1);
        let mut out = [0u8; 1];
        assert_eq!(buf.consume(&mut out), 1);

        let w = buf.writable();
        assert_eq!(w.len(), RXBUF_CAPACITY);
    }
}
