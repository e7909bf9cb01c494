// src/stack.rs
//! Call-stack hash-consing: each distinct stack gets one 32-bit id.
//!
//! Lookups are lock-free; inserts are double-checked under a mutex. A new
//! record is fully written into arena memory before a single release-store
//! publishes it as its bucket's head, so a concurrent reader that observes
//! the head with an acquire load always sees an initialized record. This is
//! the one place in the crate with an explicit memory-ordering contract.

use crate::arena::Arena;
use crate::buffer::{varint_into, BYTES_PER_NUMBER};
use crate::event::{EventType, ARG_COUNT_SHIFT};
use crate::hooks::RuntimeHooks;
use crate::pool::FlushSink;
use crate::strings::StringTable;
use parking_lot::Mutex;
use std::mem;
use std::sync::atomic::{AtomicPtr, Ordering};
use tracing::debug;

/// Reserved id for the empty stack.
pub const EMPTY_STACK_ID: u32 = 0;

/// Frames kept per captured stack; deeper stacks are truncated.
pub const MAX_STACK_FRAMES: usize = 128;

/// Symbol strings longer than this are truncated to their suffix before
/// interning.
const MAX_FRAME_STRING: usize = 1 << 10;

/// Immutable deduplicated stack, allocated in the arena. `len` program
/// counters follow the header in the same allocation.
#[repr(C)]
struct StackRecord {
    link: *const StackRecord,
    hash: u64,
    id: u32,
    len: u32,
}

/// Program counters of the record at `rec`.
///
/// # Safety
/// `rec` must point to a published record whose arena is still alive.
unsafe fn record_pcs<'a>(rec: *const StackRecord) -> &'a [u64] {
    let base = (rec as *const u8).add(mem::size_of::<StackRecord>()) as *const u64;
    std::slice::from_raw_parts(base, (*rec).len as usize)
}

struct StackTableInner {
    arena: Arena,
    next_id: u32,
    count: usize,
}

/// Stack → id table, session-scoped.
pub struct StackTable {
    buckets: Box<[AtomicPtr<StackRecord>]>,
    inner: Mutex<StackTableInner>,
}

impl StackTable {
    pub fn new(buckets: usize, arena_block_size: usize) -> Self {
        let buckets = buckets.max(1);
        Self {
            buckets: (0..buckets)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
            inner: Mutex::new(StackTableInner {
                arena: Arena::new(arena_block_size),
                next_id: 0,
                count: 0,
            }),
        }
    }

    /// Intern `pcs`, returning its id. The empty stack is id 0. Ids are
    /// assigned sequentially and never reused within a session.
    pub fn intern(&self, pcs: &[u64]) -> u32 {
        if pcs.is_empty() {
            return EMPTY_STACK_ID;
        }
        let hash = stack_hash(pcs);
        // Fast path: lock-free search.
        if let Some(id) = self.find(pcs, hash) {
            return id;
        }
        // Slow path: double-check under the insert lock.
        let mut inner = self.inner.lock();
        if let Some(id) = self.find(pcs, hash) {
            return id;
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let size = mem::size_of::<StackRecord>() + pcs.len() * mem::size_of::<u64>();
        let rec = inner.arena.alloc(size).as_ptr() as *mut StackRecord;
        let bucket = &self.buckets[(hash % self.buckets.len() as u64) as usize];
        // SAFETY: `rec` is a fresh, exclusively owned arena allocation of
        // `size` bytes. The record and its trailing frames are written in
        // full before the release-store below makes it reachable.
        unsafe {
            rec.write(StackRecord {
                link: bucket.load(Ordering::Relaxed),
                hash,
                id,
                len: pcs.len() as u32,
            });
            let frames = (rec as *mut u8).add(mem::size_of::<StackRecord>()) as *mut u64;
            std::ptr::copy_nonoverlapping(pcs.as_ptr(), frames, pcs.len());
        }
        inner.count += 1;
        bucket.store(rec, Ordering::Release);
        id
    }

    /// Lock-free exact-match search: compare hash, then frame count, then
    /// every frame in order.
    fn find(&self, pcs: &[u64], hash: u64) -> Option<u32> {
        let bucket = &self.buckets[(hash % self.buckets.len() as u64) as usize];
        let mut cur = bucket.load(Ordering::Acquire) as *const StackRecord;
        while !cur.is_null() {
            // SAFETY: every reachable record was fully initialized before
            // its release-store publication (acquire load above pairs with
            // it), and records are immutable once published.
            unsafe {
                if (*cur).hash == hash
                    && (*cur).len as usize == pcs.len()
                    && record_pcs(cur) == pcs
                {
                    return Some((*cur).id);
                }
                cur = (*cur).link;
            }
        }
        None
    }

    /// Number of interned stacks.
    pub fn len(&self) -> usize {
        self.inner.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode every record as a stack dictionary record, then reset the
    /// table and drop the arena.
    ///
    /// Frames are resolved through `hooks` and their symbol strings
    /// interned, so string dictionary records are interleaved into the
    /// sink. Must run only while the session is quiescent (the stop
    /// sequence), with no concurrent inserts.
    pub(crate) fn dump(
        &self,
        hooks: &dyn RuntimeHooks,
        strings: &StringTable,
        sink: &mut FlushSink<'_>,
    ) {
        let mut inner = self.inner.lock();
        let mut tmp: Vec<u8> = Vec::with_capacity(256);
        let mut dumped = 0usize;
        for bucket in self.buckets.iter() {
            let mut cur = bucket.load(Ordering::Acquire) as *const StackRecord;
            while !cur.is_null() {
                // SAFETY: quiescent single-threaded walk; the arena is
                // released only after the loop completes.
                let (id, len, pcs) = unsafe { ((*cur).id, (*cur).len, record_pcs(cur)) };
                tmp.clear();
                varint_into(&mut tmp, u64::from(id));
                varint_into(&mut tmp, u64::from(len));
                for &pc in pcs {
                    let frame = hooks.resolve_frame(pc);
                    let func_id = strings.intern(sink, tail(&frame.function, MAX_FRAME_STRING));
                    let file_id = strings.intern(sink, tail(&frame.file, MAX_FRAME_STRING));
                    varint_into(&mut tmp, pc);
                    varint_into(&mut tmp, func_id);
                    varint_into(&mut tmp, file_id);
                    varint_into(&mut tmp, frame.line);
                }
                sink.ensure(1 + BYTES_PER_NUMBER + tmp.len());
                sink.byte(EventType::Stack.code() | 3 << ARG_COUNT_SHIFT);
                sink.varint(tmp.len() as u64);
                sink.put_slice(&tmp);
                dumped += 1;
                cur = unsafe { (*cur).link };
            }
        }
        for bucket in self.buckets.iter() {
            bucket.store(std::ptr::null_mut(), Ordering::Relaxed);
        }
        inner.arena.release();
        inner.next_id = 0;
        inner.count = 0;
        debug!(stacks = dumped, "stack table dumped and reset");
    }
}

/// Content hash: sum each frame's pc, avalanche-mixing after every frame.
fn stack_hash(pcs: &[u64]) -> u64 {
    let mut h: u64 = 0;
    for &pc in pcs {
        h = h.wrapping_add(pc);
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
    }
    h
}

/// Suffix of `s` at most `max` bytes long, respecting char boundaries.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{FrameInfo, TaskSnapshot};
    use crate::pool::BufferPool;
    use crate::utils::config::TracerConfig;
    use std::sync::Arc;

    struct TestHooks;

    impl RuntimeHooks for TestHooks {
        fn pause_workers(&self) {}
        fn resume_workers(&self) {}
        fn live_tasks(&self) -> Vec<TaskSnapshot> {
            Vec::new()
        }
        fn processor_count(&self) -> u64 {
            1
        }
        fn capture_stack(&self, _skip: usize, _out: &mut [u64]) -> usize {
            0
        }
        fn resolve_frame(&self, pc: u64) -> FrameInfo {
            FrameInfo {
                function: format!("fn_{pc}"),
                file: format!("file_{pc}.rs"),
                line: pc + 1,
            }
        }
    }

    fn table() -> StackTable {
        let cfg = TracerConfig::default();
        StackTable::new(cfg.stack_buckets, cfg.arena_block_size)
    }

    #[test]
    fn test_empty_stack_is_zero() {
        let t = table();
        assert_eq!(t.intern(&[]), EMPTY_STACK_ID);
        assert!(t.is_empty());
    }

    #[test]
    fn test_same_content_same_id() {
        let t = table();
        let a = t.intern(&[1, 2, 3]);
        let b = t.intern(&[1, 2, 3]);
        assert_eq!(a, b);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_distinct_stacks_sequential_ids() {
        let t = table();
        assert_eq!(t.intern(&[10]), 1);
        assert_eq!(t.intern(&[10, 20]), 2);
        assert_eq!(t.intern(&[20, 10]), 3);
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn test_concurrent_duplicate_inserts_converge() {
        let t = Arc::new(table());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let t = Arc::clone(&t);
            handles.push(std::thread::spawn(move || t.intern(&[0xA, 0xB, 0xC])));
        }
        let ids: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.iter().all(|&id| id == ids[0]));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_concurrent_distinct_inserts_unique_ids() {
        let t = Arc::new(table());
        let mut handles = Vec::new();
        for i in 0u64..16 {
            let t = Arc::clone(&t);
            handles.push(std::thread::spawn(move || t.intern(&[i, i + 1])));
        }
        let mut ids: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);
        assert_eq!(t.len(), 16);
    }

    #[test]
    fn test_dump_emits_records_and_resets() {
        let t = table();
        t.intern(&[1, 2]);
        t.intern(&[3]);

        let pool = BufferPool::new(&TracerConfig::default());
        let strings = StringTable::new();
        let mut q = pool.lock_queue();
        let mut sink = FlushSink::new(&pool, &mut q);
        t.dump(&TestHooks, &strings, &mut sink);
        sink.finish();

        let mut wire = Vec::new();
        while let Some(buf) = q.full.pop_front() {
            wire.extend_from_slice(buf.bytes());
        }
        let stack_header = EventType::Stack.code() | 3 << ARG_COUNT_SHIFT;
        let stack_records = wire.iter().filter(|&&b| b == stack_header).count();
        assert!(stack_records >= 2);
        // Two pcs in one stack plus one in the other, each with distinct
        // function and file names.
        assert_eq!(strings.len(), 6);

        // Table is empty again; ids restart at 1.
        assert!(t.is_empty());
        assert_eq!(t.intern(&[9, 9, 9]), 1);
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        let s = "αβγδ";
        let cut = tail(s, 3);
        assert!(cut.len() <= 3);
        assert!(s.ends_with(cut));
    }
}
