// src/strings.rs
//! String interning for the trace dictionary.
//!
//! Each distinct string is assigned a sequential id and emitted onto the
//! wire exactly once, at first sight. Interning therefore has a side
//! effect of producing bytes: it may only be called while holding the
//! right to write to an output buffer, which the [`FlushSink`] represents.

use crate::buffer::BYTES_PER_NUMBER;
use crate::event::EventType;
use crate::pool::FlushSink;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reserved id for the empty string; never allocated or emitted.
pub const EMPTY_STRING_ID: u64 = 0;

/// Content → id dictionary, session-scoped.
pub struct StringTable {
    map: DashMap<String, u64>,
    seq: AtomicU64,
}

impl StringTable {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Intern `s`, emitting a dictionary record on first occurrence.
    /// Ids start at 1 and follow first-seen order.
    pub(crate) fn intern(&self, sink: &mut FlushSink<'_>, s: &str) -> u64 {
        if s.is_empty() {
            return EMPTY_STRING_ID;
        }
        if let Some(id) = self.map.get(s) {
            return *id;
        }
        match self.map.entry(s.to_owned()) {
            Entry::Occupied(e) => *e.get(),
            Entry::Vacant(e) => {
                let id = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
                e.insert(id);
                sink.ensure(1 + 2 * BYTES_PER_NUMBER + s.len());
                sink.byte(EventType::String.code());
                sink.varint(id);
                sink.varint(s.len() as u64);
                sink.put_slice(s.as_bytes());
                id
            }
        }
    }

    /// Number of interned strings.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drop the dictionary at session teardown.
    pub(crate) fn reset(&self) {
        self.map.clear();
        self.seq.store(0, Ordering::Relaxed);
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::decode_varint;
    use crate::pool::BufferPool;
    use crate::utils::config::TracerConfig;

    fn with_sink<R>(f: impl FnOnce(&StringTable, &mut FlushSink<'_>) -> R) -> (R, Vec<u8>) {
        let pool = BufferPool::new(&TracerConfig::default());
        let table = StringTable::new();
        let mut q = pool.lock_queue();
        let mut sink = FlushSink::new(&pool, &mut q);
        let r = f(&table, &mut sink);
        sink.finish();
        let mut wire = Vec::new();
        while let Some(buf) = q.full.pop_front() {
            wire.extend_from_slice(buf.bytes());
        }
        (r, wire)
    }

    #[test]
    fn test_empty_string_is_id_zero_and_emits_nothing() {
        let (id, wire) = with_sink(|t, sink| t.intern(sink, ""));
        assert_eq!(id, EMPTY_STRING_ID);
        assert!(wire.is_empty());
    }

    #[test]
    fn test_first_seen_order_from_one() {
        let (ids, _) = with_sink(|t, sink| {
            vec![
                t.intern(sink, "alpha"),
                t.intern(sink, "beta"),
                t.intern(sink, "alpha"),
                t.intern(sink, "gamma"),
            ]
        });
        assert_eq!(ids, vec![1, 2, 1, 3]);
    }

    #[test]
    fn test_dictionary_record_layout() {
        let (_, wire) = with_sink(|t, sink| t.intern(sink, "main"));
        assert_eq!(wire[0], EventType::String.code());
        let (id, n) = decode_varint(&wire[1..]).unwrap();
        assert_eq!(id, 1);
        let (len, m) = decode_varint(&wire[1 + n..]).unwrap();
        assert_eq!(len, 4);
        assert_eq!(&wire[1 + n + m..1 + n + m + 4], b"main");
    }

    #[test]
    fn test_reset_forgets_ids() {
        let pool = BufferPool::new(&TracerConfig::default());
        let table = StringTable::new();
        {
            let mut q = pool.lock_queue();
            let mut sink = FlushSink::new(&pool, &mut q);
            assert_eq!(table.intern(&mut sink, "x"), 1);
            sink.finish();
        }
        table.reset();
        assert!(table.is_empty());
        {
            let mut q = pool.lock_queue();
            let mut sink = FlushSink::new(&pool, &mut q);
            assert_eq!(table.intern(&mut sink, "y"), 1);
            sink.finish();
        }
    }
}
