// src/pool.rs
//! Per-worker buffer slots, the shared fallback slot, and the global
//! full/free buffer queues.
//!
//! Ownership rules:
//!
//! - A buffer is owned by exactly one slot, the full queue, or the free
//!   list; never two at once. Transfer happens only by moving the box.
//! - Worker slots are exclusive to their worker, so their mutexes are
//!   uncontended on the recording path; the shared slot's mutex is the
//!   real lock for callers without worker affinity.
//! - The full queue is strict FIFO: the reader observes buffers in flush
//!   order.

use crate::buffer::TraceBuffer;
use crate::utils::config::TracerConfig;
use crate::utils::errors::fatal;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Smallest usable buffer: must hold a batch header plus one worst-case
/// event, and a worst-case stack dictionary record.
const MIN_BUFFER_CAPACITY: usize = 8 << 10;

/// Owner id recorded in batch headers for the shared slot.
pub(crate) const SHARED_OWNER: u64 = u64::MAX;

/// Identifies one worker's private buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u32);

impl WorkerId {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

type BufferSlot = Mutex<Option<Box<TraceBuffer>>>;

/// Queue state guarded by one lock: the FIFO of full buffers awaiting the
/// reader, the free list, and the reader's stream-progress flags.
pub(crate) struct QueueState {
    pub full: VecDeque<Box<TraceBuffer>>,
    pub free: Vec<Box<TraceBuffer>>,
    pub header_written: bool,
    pub footer_written: bool,
}

pub(crate) struct BufferPool {
    buffer_capacity: usize,
    shared: BufferSlot,
    workers: Vec<BufferSlot>,
    queue: Mutex<QueueState>,
    reader_cv: Condvar,
}

impl BufferPool {
    pub fn new(config: &TracerConfig) -> Self {
        let buffer_capacity = config.buffer_capacity.max(MIN_BUFFER_CAPACITY);
        if buffer_capacity != config.buffer_capacity {
            tracing::warn!(
                requested = config.buffer_capacity,
                effective = buffer_capacity,
                "buffer capacity raised to minimum"
            );
        }
        let workers = (0..config.max_workers).map(|_| Mutex::new(None)).collect();
        debug!(
            slots = config.max_workers,
            buffer_capacity, "buffer pool initialized"
        );
        Self {
            buffer_capacity,
            shared: Mutex::new(None),
            workers,
            queue: Mutex::new(QueueState {
                full: VecDeque::new(),
                free: Vec::new(),
                header_written: false,
                footer_written: false,
            }),
            reader_cv: Condvar::new(),
        }
    }

    /// Resolve the caller's buffer slot. Worker slots are uncontended by
    /// construction; the shared path takes the session-wide shared lock.
    /// Returns the slot guard and the owner id used in batch headers.
    pub fn acquire(&self, worker: Option<WorkerId>) -> (MutexGuard<'_, Option<Box<TraceBuffer>>>, u64) {
        match worker {
            Some(id) => match self.workers.get(id.index()) {
                Some(slot) => (slot.lock(), id.index() as u64),
                None => fatal("worker id out of range"),
            },
            None => (self.shared.lock(), SHARED_OWNER),
        }
    }

    /// The shared fallback slot, locked. Used by the session controller
    /// while workers are paused.
    pub fn shared_slot(&self) -> MutexGuard<'_, Option<Box<TraceBuffer>>> {
        self.shared.lock()
    }

    /// One worker's slot, locked. Used by the stop sweep.
    pub fn worker_slot(&self, index: usize) -> MutexGuard<'_, Option<Box<TraceBuffer>>> {
        match self.workers.get(index) {
            Some(slot) => slot.lock(),
            None => fatal("worker id out of range"),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn lock_queue(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock()
    }

    /// Hand `buf` (if any) to the full queue and return a recycled or
    /// freshly mapped empty buffer.
    pub fn flush(&self, buf: Option<Box<TraceBuffer>>) -> Box<TraceBuffer> {
        let mut q = self.queue.lock();
        self.flush_locked(&mut q, buf)
    }

    /// As [`BufferPool::flush`], for callers already holding the queue
    /// lock (the reader draining on its own behalf during the footer).
    pub fn flush_locked(
        &self,
        q: &mut QueueState,
        buf: Option<Box<TraceBuffer>>,
    ) -> Box<TraceBuffer> {
        if let Some(full) = buf {
            trace!(bytes = full.len(), queued = q.full.len() + 1, "buffer flushed");
            q.full.push_back(full);
            self.reader_cv.notify_one();
        }
        let mut fresh = match q.free.pop() {
            Some(b) => b,
            None => Box::new(TraceBuffer::new(self.buffer_capacity)),
        };
        fresh.reset();
        fresh
    }

    /// Append a swept buffer to the full queue without taking a
    /// replacement.
    pub fn queue_full(&self, buf: Box<TraceBuffer>) {
        let mut q = self.queue.lock();
        q.full.push_back(buf);
        self.reader_cv.notify_one();
    }

    /// Return an empty buffer to the free list for reuse.
    pub fn recycle(&self, buf: Box<TraceBuffer>) {
        let mut q = self.queue.lock();
        q.free.push(buf);
    }

    /// Park the reader until a buffer is queued or the session begins
    /// draining. The queue lock is released while parked.
    pub fn park_reader(&self, q: &mut MutexGuard<'_, QueueState>) {
        self.reader_cv.wait(q);
    }

    /// Wake a parked reader. Takes the queue lock so the notification
    /// cannot slip between a reader's emptiness check and its park.
    pub fn wake_reader(&self) {
        let _q = self.queue.lock();
        self.reader_cv.notify_one();
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }
}

/// Write cursor over the full queue for the dictionary-dump path, which
/// runs while the reader already holds the queue lock. Flushing through the
/// sink never re-locks; completed buffers go straight onto `q.full`.
pub(crate) struct FlushSink<'a> {
    pool: &'a BufferPool,
    q: &'a mut QueueState,
    buf: Box<TraceBuffer>,
}

impl<'a> FlushSink<'a> {
    pub fn new(pool: &'a BufferPool, q: &'a mut QueueState) -> Self {
        let buf = pool.flush_locked(q, None);
        Self { pool, q, buf }
    }

    /// Guarantee at least `need` writable bytes, flushing the current
    /// buffer if necessary. A record that cannot fit any buffer aborts.
    pub fn ensure(&mut self, need: usize) {
        if need > self.pool.buffer_capacity() {
            fatal("dictionary record exceeds trace buffer capacity");
        }
        if self.buf.remaining() < need {
            let fresh = self.pool.flush_locked(self.q, None);
            let full = std::mem::replace(&mut self.buf, fresh);
            self.q.full.push_back(full);
        }
    }

    pub fn byte(&mut self, v: u8) {
        self.buf.byte(v);
    }

    pub fn varint(&mut self, v: u64) {
        self.buf.varint(v);
    }

    pub fn put_slice(&mut self, s: &[u8]) {
        self.buf.put_slice(s);
    }

    /// Queue the final buffer (or recycle it if nothing was written).
    pub fn finish(self) {
        if self.buf.is_empty() {
            self.q.free.push(self.buf);
        } else {
            self.q.full.push_back(self.buf);
        }
    }
}
