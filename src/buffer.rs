//! Byte staging buffers for the per-node write and read paths.
//!
//! # Design
//! - [`WriteBuf`] is a fixed-capacity staging area between operation
//!   serialization and the socket. Appends go at the tail, socket writes
//!   drain from the head, and the gap left by a partial write is reclaimed
//!   by compaction on the next append.
//! - [`ReadCursor`] is a draining view over one socket read. Operations
//!   consume from the front; the cursor tracks how far the current fill has
//!   been handed out.
//!
//! # Invariants
//! - `start <= end <= capacity` in [`WriteBuf`]; the pending region is
//!   exactly `buf[start..end]`.
//! - `pending_len()` is the number of bytes accepted but not yet written to
//!   the socket; the loop's `to_write` is this value, by construction.
//!
//! # Threading
//! Neither type is synchronized; both are owned and used by the I/O thread
//! only.

use std::fmt::Write as _;

/// Fixed-capacity write staging buffer.
///
/// Capacity is fixed at construction so a node's memory footprint is
/// deterministic; an operation that does not fit in one pass simply spans
/// multiple fill/drain rounds.
pub struct WriteBuf {
    buf: Box<[u8]>,
    start: usize,
    end: usize,
}

impl WriteBuf {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "write buffer capacity must be > 0");
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes accepted but not yet drained to the socket.
    #[inline]
    pub fn pending_len(&self) -> usize {
        self.end - self.start
    }

    /// True when nothing is pending.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Room left for appends, assuming compaction.
    #[inline]
    pub fn space_left(&self) -> usize {
        self.capacity() - self.pending_len()
    }

    /// The pending region, in drain order.
    #[inline]
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Copies as much of `src` as fits, returning the number of bytes taken.
    ///
    /// Compacts first when the tail gap alone is too small but head space
    /// exists. Never fails; a zero return means the buffer is full.
    pub fn push_slice(&mut self, src: &[u8]) -> usize {
        if src.is_empty() || self.space_left() == 0 {
            return 0;
        }
        if self.buf.len() - self.end < src.len() && self.start > 0 {
            self.compact();
        }
        let n = src.len().min(self.buf.len() - self.end);
        self.buf[self.end..self.end + n].copy_from_slice(&src[..n]);
        self.end += n;
        n
    }

    /// Marks `n` pending bytes as written to the socket.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(
            n <= self.pending_len(),
            "consumed {n} bytes with only {} pending",
            self.pending_len()
        );
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Discards all pending bytes.
    pub(crate) fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    fn compact(&mut self) {
        let len = self.pending_len();
        self.buf.copy_within(self.start..self.end, 0);
        self.start = 0;
        self.end = len;
    }
}

/// Draining view over the bytes of one socket read.
///
/// Successive operations consume from the front until the fill is exhausted.
pub struct ReadCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ReadCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True when the fill is exhausted.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    /// The unconsumed bytes, without advancing.
    #[inline]
    pub fn peek(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Consumes `n` bytes. `n` must not exceed `remaining()`.
    #[inline]
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining(), "advance past end of read cursor");
        self.pos += n;
    }

    /// Consumes and returns the next `n` bytes.
    #[inline]
    pub fn take(&mut self, n: usize) -> &'a [u8] {
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        out
    }
}

/// Renders bytes for trace logs: printable ASCII as-is, the rest as `\x..`.
pub(crate) fn printable(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        if b == b' ' || b.is_ascii_graphic() {
            out.push(b as char);
        } else {
            let _ = write!(out, "\\x{b:02x}");
        }
    }
    out
}
