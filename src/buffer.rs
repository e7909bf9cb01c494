// src/buffer.rs
//! Fixed-capacity trace buffer and varint encoding primitives.
//!
//! Buffers are anonymous memory maps so the host collector never observes
//! them. The append API is deliberately unchecked: callers pre-compute the
//! worst-case record size and flush before writing, never mid-record.

use crate::utils::errors::fatal;
use memmap2::{MmapMut, MmapOptions};

/// Maximum bytes a `u64` takes in base-128 varint encoding.
pub const BYTES_PER_NUMBER: usize = 10;

/// Worst-case size of one generic event record: type byte, length byte,
/// then tick delta, up to three arguments, and a stack id.
pub const MAX_EVENT_BYTES: usize = 2 + 5 * BYTES_PER_NUMBER;

/// Append-only byte region owned by exactly one producer at a time.
pub struct TraceBuffer {
    data: MmapMut,
    pos: usize,
    last_ticks: u64,
}

impl TraceBuffer {
    pub fn new(capacity: usize) -> Self {
        let data = match MmapOptions::new().len(capacity).map_anon() {
            Ok(m) => m,
            Err(e) => {
                tracing::error!("failed to map trace buffer: {e}");
                fatal("out of memory mapping trace buffer");
            }
        };
        Self {
            data,
            pos: 0,
            last_ticks: 0,
        }
    }

    /// Reset the write cursor and tick cache for reuse.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.last_ticks = 0;
    }

    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes written so far.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.pos]
    }

    /// Tick count of the last event written to this buffer.
    pub fn last_ticks(&self) -> u64 {
        self.last_ticks
    }

    pub fn set_last_ticks(&mut self, ticks: u64) {
        self.last_ticks = ticks;
    }

    /// Append a single byte.
    #[inline]
    pub fn byte(&mut self, v: u8) {
        self.data[self.pos] = v;
        self.pos += 1;
    }

    /// Append `v` in little-endian base-128 encoding, continuation bit in
    /// the high bit of each byte.
    #[inline]
    pub fn varint(&mut self, mut v: u64) {
        while v >= 0x80 {
            self.byte(0x80 | v as u8);
            v >>= 7;
        }
        self.byte(v as u8);
    }

    /// Append raw bytes.
    pub fn put_slice(&mut self, s: &[u8]) {
        self.data[self.pos..self.pos + s.len()].copy_from_slice(s);
        self.pos += s.len();
    }

    /// Write a placeholder length byte and return its position for
    /// [`TraceBuffer::patch_length_byte`] once the record body is complete.
    pub fn reserve_length_byte(&mut self) -> usize {
        let at = self.pos;
        self.byte(0);
        at
    }

    /// Fill in a previously reserved length byte. The single-byte budget is
    /// an explicit invariant, not a silent truncation.
    pub fn patch_length_byte(&mut self, at: usize, len: usize) {
        if len > 0x7f {
            fatal("trace event body exceeds single length byte");
        }
        self.data[at] = len as u8;
    }
}

/// Append `v` to a plain byte vector in the same varint encoding.
pub fn varint_into(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push(0x80 | v as u8);
        v >>= 7;
    }
    out.push(v as u8);
}

/// Number of bytes `v` occupies when varint-encoded.
pub fn varint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

/// Decode one varint from the front of `buf`, returning the value and the
/// number of bytes consumed. `None` on truncated or over-long input.
pub fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut v: u64 = 0;
    for (i, &b) in buf.iter().enumerate() {
        if i >= BYTES_PER_NUMBER {
            return None;
        }
        v |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Some((v, i + 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode(v: u64) -> Vec<u8> {
        let mut out = Vec::new();
        varint_into(&mut out, v);
        out
    }

    #[test]
    fn test_varint_known_vectors() {
        assert_eq!(encode(0), vec![0x00]);
        assert_eq!(encode(1), vec![0x01]);
        assert_eq!(encode(127), vec![0x7f]);
        assert_eq!(encode(128), vec![0x80, 0x01]);
        assert_eq!(encode(300), vec![0xac, 0x02]);
        assert_eq!(encode(u64::MAX).len(), BYTES_PER_NUMBER);
    }

    #[test]
    fn test_buffer_varint_matches_vec_encoding() {
        let mut buf = TraceBuffer::new(4096);
        for v in [0u64, 1, 127, 128, 16_383, 16_384, u64::MAX] {
            buf.varint(v);
        }
        let mut expect = Vec::new();
        for v in [0u64, 1, 127, 128, 16_383, 16_384, u64::MAX] {
            varint_into(&mut expect, v);
        }
        assert_eq!(buf.bytes(), expect.as_slice());
    }

    #[test]
    fn test_reserve_then_patch() {
        let mut buf = TraceBuffer::new(64);
        buf.byte(0xEE);
        let at = buf.reserve_length_byte();
        buf.varint(5);
        buf.varint(300);
        let body = buf.len() - at - 1;
        buf.patch_length_byte(at, body);
        assert_eq!(buf.bytes()[at] as usize, body);
    }

    #[test]
    fn test_reset_clears_cursor_and_ticks() {
        let mut buf = TraceBuffer::new(64);
        buf.varint(9999);
        buf.set_last_ticks(42);
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.last_ticks(), 0);
        assert_eq!(buf.remaining(), 64);
    }

    #[test]
    fn test_decode_rejects_truncated() {
        assert_eq!(decode_varint(&[0x80]), None);
        assert_eq!(decode_varint(&[]), None);
    }

    proptest! {
        #[test]
        fn prop_varint_roundtrip(v in any::<u64>()) {
            let bytes = encode(v);
            prop_assert!(bytes.len() <= BYTES_PER_NUMBER);
            prop_assert_eq!(bytes.len(), varint_len(v));
            let (decoded, used) = decode_varint(&bytes).unwrap();
            prop_assert_eq!(decoded, v);
            prop_assert_eq!(used, bytes.len());
        }

        #[test]
        fn prop_varint_minimal(v in 1u64..) {
            // The top byte of a minimal encoding is never zero.
            let bytes = encode(v);
            prop_assert_ne!(*bytes.last().unwrap(), 0);
        }
    }
}
