//! Inbound byte accumulator.

use bytes::{Bytes, BytesMut};

const INITIAL_CAPACITY: usize = 1024 * 4;

/// Append-only FIFO of bytes with a committed read cursor.
///
/// The transport appends on one end, the framer reads on the other.
/// Parsers match tentatively against [`Buffer::unread`] and only commit
/// by calling [`Buffer::advance`]; everything before the cursor is
/// reclaimed lazily by `BytesMut`, so the cursor never regresses.
#[derive(Debug, Default)]
pub(crate) struct Buffer {
    buf: BytesMut,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Append bytes delivered by the transport.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The bytes between the cursor and the write end.
    pub fn unread(&self) -> &[u8] {
        &self.buf
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Commit `n` bytes, handing them out without copying.
    pub fn advance(&mut self, n: usize) -> Bytes {
        debug_assert!(n <= self.buf.len());
        self.buf.split_to(n).freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_commits_in_order() {
        let mut buf = Buffer::new();
        buf.append(b"* OK ");
        buf.append(b"ready\r\n");
        assert_eq!(buf.remaining(), 12);
        assert_eq!(&buf.advance(5)[..], b"* OK ");
        assert_eq!(buf.unread(), b"ready\r\n");
    }

    #[test]
    fn unread_is_stable_across_appends() {
        let mut buf = Buffer::new();
        buf.append(b"{3}\r\n");
        buf.advance(3);
        buf.append(b"abc");
        assert_eq!(buf.unread(), b"\r\nabc");
    }
}
