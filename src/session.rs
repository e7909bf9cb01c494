// src/session.rs
//! Session lifecycle control and the reader.
//!
//! One `Tracer` owns every session-scoped resource: the buffer pool, the
//! stack and string tables, and the state machine
//! `Idle → Starting → Active → Stopping → Idle`. At most one session is
//! active at a time; transitions are serialized by an exclusive guard and
//! surrounded by the host's checkpoint pause so no producer is mid-event
//! while buffers are swept.

use crate::buffer::{varint_into, TraceBuffer, BYTES_PER_NUMBER, MAX_EVENT_BYTES};
use crate::clock;
use crate::event::{EventType, StackCapture, ARG_COUNT_SHIFT, MAGIC};
use crate::hooks::{RuntimeHooks, TaskStatus};
use crate::pool::{BufferPool, FlushSink, WorkerId, SHARED_OWNER};
use crate::stack::{StackTable, MAX_STACK_FRAMES};
use crate::strings::StringTable;
use crate::utils::config::TracerConfig;
use crate::utils::errors::{fatal, Result, TraceError};
use bytes::Bytes;
use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bounded spins waiting for the wall clock to advance at stop time.
const CLOCK_RETRY_LIMIT: u32 = 64;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Starting = 1,
    Active = 2,
    /// Stopped but still draining; no new session may start.
    Stopping = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Idle,
            1 => SessionState::Starting,
            2 => SessionState::Active,
            _ => SessionState::Stopping,
        }
    }
}

/// Process-wide execution-event tracer.
pub struct Tracer {
    hooks: Arc<dyn RuntimeHooks>,
    pool: BufferPool,
    stacks: StackTable,
    strings: StringTable,

    state: AtomicU8,
    /// Serializes start/stop; taken with `try_lock` so overlapping
    /// transitions fail fast instead of queueing.
    transition: Mutex<()>,
    idle_mutex: Mutex<()>,
    idle_cv: Condvar,
    reader_busy: AtomicBool,

    ticks_start: AtomicU64,
    ticks_end: AtomicU64,
    wall_start: AtomicU64,
    wall_end: AtomicU64,
    gc_seq: AtomicU64,
}

impl Tracer {
    pub fn new(config: TracerConfig, hooks: Arc<dyn RuntimeHooks>) -> Self {
        let pool = BufferPool::new(&config);
        let stacks = StackTable::new(config.stack_buckets, config.arena_block_size);
        info!(
            workers = config.max_workers,
            buffer_capacity = config.buffer_capacity,
            "tracer initialized"
        );
        Self {
            hooks,
            pool,
            stacks,
            strings: StringTable::new(),
            state: AtomicU8::new(SessionState::Idle as u8),
            transition: Mutex::new(()),
            idle_mutex: Mutex::new(()),
            idle_cv: Condvar::new(),
            reader_busy: AtomicBool::new(false),
            ticks_start: AtomicU64::new(0),
            ticks_end: AtomicU64::new(0),
            wall_start: AtomicU64::new(0),
            wall_end: AtomicU64::new(0),
            gc_seq: AtomicU64::new(0),
        }
    }

    /// Current lifecycle state.
    pub fn session_state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: SessionState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub(crate) fn is_active(&self) -> bool {
        self.session_state() == SessionState::Active
    }

    pub(crate) fn next_gc_seq(&self) -> u64 {
        self.gc_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn intern_stack(&self, pcs: &[u64]) -> u32 {
        self.stacks.intern(pcs)
    }

    /// Begin a session. Pauses all workers, seeds the stream with a state
    /// snapshot of every live task, then resumes and goes `Active`.
    ///
    /// Fails with [`TraceError::AlreadyEnabled`] if a session is active,
    /// still draining, or another transition is in flight.
    pub fn start(&self) -> Result<()> {
        let _guard = match self.transition.try_lock() {
            Some(g) => g,
            None => return Err(TraceError::AlreadyEnabled),
        };
        if self.session_state() != SessionState::Idle {
            return Err(TraceError::AlreadyEnabled);
        }
        self.set_state(SessionState::Starting);
        self.hooks.pause_workers();
        {
            let mut shared = self.pool.shared_slot();
            {
                let mut q = self.pool.lock_queue();
                q.header_written = false;
                q.footer_written = false;
            }
            self.strings.reset();
            self.gc_seq.store(0, Ordering::Relaxed);

            // Synthetic snapshot so the reader can reconstruct pre-existing
            // state. Workers are paused, so the view is consistent.
            for task in self.hooks.live_tasks() {
                let entry = self.stacks.intern(&[task.start_pc]);
                self.write_event_slot(
                    &mut shared,
                    SHARED_OWNER,
                    EventType::TaskCreate,
                    StackCapture::Empty,
                    &[task.id, u64::from(entry)],
                );
                match task.status {
                    TaskStatus::Waiting => self.write_event_slot(
                        &mut shared,
                        SHARED_OWNER,
                        EventType::TaskWaiting,
                        StackCapture::Omit,
                        &[task.id],
                    ),
                    TaskStatus::Syscall => self.write_event_slot(
                        &mut shared,
                        SHARED_OWNER,
                        EventType::TaskInSyscall,
                        StackCapture::Omit,
                        &[task.id],
                    ),
                    TaskStatus::Runnable => {}
                }
            }
            let procs = self.hooks.processor_count();
            self.write_event_slot(
                &mut shared,
                SHARED_OWNER,
                EventType::Procs,
                StackCapture::Omit,
                &[procs],
            );

            // Start timestamps are recorded only after snapshot emission so
            // no snapshot event postdates the session start.
            self.ticks_start.store(clock::ticks(), Ordering::Relaxed);
            self.wall_start.store(clock::wall_ns(), Ordering::Relaxed);
        }
        self.set_state(SessionState::Active);
        self.hooks.resume_workers();
        info!("trace session started");
        Ok(())
    }

    /// End the active session and block until the reader has drained the
    /// stream completely. Stop while idle (or while another transition is
    /// in flight) is a silent no-op.
    pub fn stop(&self) {
        let _guard = match self.transition.try_lock() {
            Some(g) => g,
            None => return,
        };
        if self.session_state() != SessionState::Active {
            return;
        }
        self.hooks.pause_workers();
        {
            let mut shared = self.pool.shared_slot();
            // Final scheduling event before the sweep.
            self.write_event_slot(
                &mut shared,
                SHARED_OWNER,
                EventType::TaskYield,
                StackCapture::Skip(1),
                &[],
            );
            for i in 0..self.pool.worker_count() {
                let mut slot = self.pool.worker_slot(i);
                if let Some(buf) = slot.take() {
                    if buf.is_empty() {
                        self.pool.recycle(buf);
                    } else {
                        self.pool.queue_full(buf);
                    }
                }
            }
            if let Some(buf) = shared.take() {
                if buf.is_empty() {
                    self.pool.recycle(buf);
                } else {
                    self.pool.queue_full(buf);
                }
            }

            // End timestamps; some platform clocks tick coarsely, so retry
            // briefly until the wall clock advances.
            let wall_start = self.wall_start.load(Ordering::Relaxed);
            let backoff = Backoff::new();
            let mut wall_end = clock::wall_ns();
            let mut tries = 0;
            while wall_end == wall_start && tries < CLOCK_RETRY_LIMIT {
                backoff.snooze();
                wall_end = clock::wall_ns();
                tries += 1;
            }
            if wall_end == wall_start {
                warn!("wall clock did not advance during stop");
            }
            self.ticks_end.store(clock::ticks(), Ordering::Relaxed);
            self.wall_end.store(wall_end, Ordering::Relaxed);
            self.set_state(SessionState::Stopping);
        }
        self.hooks.resume_workers();
        self.pool.wake_reader();
        debug!("trace session stopping; waiting for reader drain");

        let mut g = self.idle_mutex.lock();
        while self.session_state() != SessionState::Idle {
            self.idle_cv.wait(&mut g);
        }
        info!("trace session stopped");
    }

    /// Return the next chunk of binary trace data, blocking while the
    /// session is active and no data is pending. Returns `None` once a
    /// stopping session has fully drained (and on anomalies, which are
    /// logged). Single-consumer: a second concurrent caller gets `None`.
    ///
    /// Chunks are copies; buffers are recycled immediately after hand-off.
    pub fn read(&self) -> Option<Bytes> {
        if self
            .reader_busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            warn!("trace read called from multiple threads simultaneously");
            return None;
        }
        let chunk = self.read_chunk();
        self.reader_busy.store(false, Ordering::Release);
        chunk
    }

    fn read_chunk(&self) -> Option<Bytes> {
        let mut q = self.pool.lock_queue();

        if !q.header_written {
            q.header_written = true;
            return Some(Bytes::from_static(MAGIC));
        }

        if q.full.is_empty() && self.session_state() != SessionState::Stopping {
            self.pool.park_reader(&mut q);
        }

        if let Some(buf) = q.full.pop_front() {
            let chunk = Bytes::copy_from_slice(buf.bytes());
            q.free.push(buf);
            return Some(chunk);
        }

        if self.session_state() == SessionState::Stopping {
            if !q.footer_written {
                q.footer_written = true;
                let mut footer = Vec::with_capacity(2 + 2 * BYTES_PER_NUMBER);
                footer.push(EventType::Frequency.code());
                varint_into(&mut footer, self.effective_frequency());
                if let Some(task) = self.hooks.timer_task() {
                    footer.push(EventType::TimerTask.code());
                    varint_into(&mut footer, task);
                }
                // Dump the stack dictionary; the buffers it fills are
                // picked up on subsequent reads.
                let mut sink = FlushSink::new(&self.pool, &mut q);
                self.stacks.dump(self.hooks.as_ref(), &self.strings, &mut sink);
                sink.finish();
                return Some(Bytes::from(footer));
            }

            // Fully drained: release every free buffer, clear the string
            // dictionary, and flip to Idle, unblocking stop().
            q.free.clear();
            drop(q);
            self.strings.reset();
            self.set_state(SessionState::Idle);
            let _g = self.idle_mutex.lock();
            self.idle_cv.notify_all();
            debug!("trace reader finished; session idle");
            return None;
        }

        warn!("spurious wakeup of trace reader");
        None
    }

    /// Measured ticks per second over the session, for the footer.
    fn effective_frequency(&self) -> u64 {
        let ticks = self
            .ticks_end
            .load(Ordering::Relaxed)
            .saturating_sub(self.ticks_start.load(Ordering::Relaxed));
        let wall = self
            .wall_end
            .load(Ordering::Relaxed)
            .saturating_sub(self.wall_start.load(Ordering::Relaxed));
        if ticks == 0 || wall == 0 {
            return clock::NOMINAL_TICKS_PER_SEC;
        }
        (ticks as f64 * 1e9 / wall as f64) as u64
    }

    /// Shared encoding path for every event: resolve the caller's buffer,
    /// re-check the session under the slot lock, encode, release.
    pub(crate) fn emit(
        &self,
        worker: Option<WorkerId>,
        ev: EventType,
        stack: StackCapture,
        args: &[u64],
    ) {
        if !self.is_active() {
            return;
        }
        let (mut slot, owner) = self.pool.acquire(worker);
        // The state may have flipped between the check above and taking
        // the slot; stop() owns these locks while sweeping.
        if !self.is_active() {
            return;
        }
        self.write_event_slot(&mut slot, owner, ev, stack, args);
    }

    /// Encode one event into `slot`, flushing first if the worst case
    /// would not fit. Never flushes mid-event.
    fn write_event_slot(
        &self,
        slot: &mut Option<Box<TraceBuffer>>,
        owner: u64,
        ev: EventType,
        stack: StackCapture,
        args: &[u64],
    ) {
        let mut buf = match slot.take() {
            Some(b) if b.remaining() >= MAX_EVENT_BYTES => b,
            other => self.pool.flush(other),
        };

        let ticks = clock::ticks();
        let mut delta = ticks.saturating_sub(buf.last_ticks());
        if buf.is_empty() {
            // First record of a buffer: batch header with the owner id and
            // the absolute base tick all deltas build on.
            buf.byte(EventType::Batch.code() | 1 << ARG_COUNT_SHIFT);
            buf.varint(owner);
            buf.varint(ticks);
            delta = 0;
        }
        buf.set_last_ticks(ticks);

        let stack_id = match stack {
            StackCapture::Omit => None,
            StackCapture::Empty => Some(0u64),
            StackCapture::Skip(skip) => {
                let mut pcs = [0u64; MAX_STACK_FRAMES];
                let n = self.hooks.capture_stack(skip, &mut pcs).min(MAX_STACK_FRAMES);
                Some(u64::from(self.stacks.intern(&pcs[..n])))
            }
        };

        let mut narg = args.len() + usize::from(stack_id.is_some());
        if narg > 3 {
            narg = 3;
        }
        let start = buf.len();
        buf.byte(ev.code() | (narg as u8) << ARG_COUNT_SHIFT);
        let len_at = if narg == 3 {
            Some(buf.reserve_length_byte())
        } else {
            None
        };
        buf.varint(delta);
        for &a in args {
            buf.varint(a);
        }
        if let Some(id) = stack_id {
            buf.varint(id);
        }

        let size = buf.len() - start;
        if size > MAX_EVENT_BYTES {
            fatal("trace event exceeds reserved size budget");
        }
        if let Some(at) = len_at {
            // Length counts everything after the type and length bytes.
            buf.patch_length_byte(at, size - 2);
        }
        *slot = Some(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{FrameInfo, TaskSnapshot};

    struct NullHooks;

    impl RuntimeHooks for NullHooks {
        fn pause_workers(&self) {}
        fn resume_workers(&self) {}
        fn live_tasks(&self) -> Vec<TaskSnapshot> {
            Vec::new()
        }
        fn processor_count(&self) -> u64 {
            4
        }
        fn capture_stack(&self, _skip: usize, out: &mut [u64]) -> usize {
            out[0] = 0x1000;
            1
        }
        fn resolve_frame(&self, pc: u64) -> FrameInfo {
            FrameInfo {
                function: format!("f{pc:x}"),
                file: "main.rs".into(),
                line: 1,
            }
        }
    }

    fn tracer() -> Tracer {
        Tracer::new(TracerConfig::default(), Arc::new(NullHooks))
    }

    #[test]
    fn test_start_flips_active() {
        let t = tracer();
        assert_eq!(t.session_state(), SessionState::Idle);
        t.start().unwrap();
        assert_eq!(t.session_state(), SessionState::Active);
    }

    #[test]
    fn test_start_while_active_fails() {
        let t = tracer();
        t.start().unwrap();
        assert!(matches!(t.start(), Err(TraceError::AlreadyEnabled)));
        assert_eq!(t.session_state(), SessionState::Active);
    }

    #[test]
    fn test_stop_while_idle_is_noop() {
        let t = tracer();
        t.stop();
        assert_eq!(t.session_state(), SessionState::Idle);
        t.start().unwrap();
    }

    #[test]
    fn test_first_chunk_is_header() {
        let t = tracer();
        let chunk = t.read().unwrap();
        assert_eq!(&chunk[..], MAGIC);
    }

    #[test]
    fn test_events_dropped_while_idle() {
        let t = tracer();
        t.task_start(None, 7);
        let q = t.pool.lock_queue();
        assert!(q.full.is_empty());
    }

    #[test]
    fn test_emit_writes_batch_header_first() {
        let t = tracer();
        t.start().unwrap();
        t.task_start(Some(WorkerId::new(0)), 7);
        let (slot, _) = t.pool.acquire(Some(WorkerId::new(0)));
        let buf = slot.as_ref().unwrap();
        assert_eq!(
            buf.bytes()[0],
            EventType::Batch.code() | 1 << ARG_COUNT_SHIFT
        );
    }

    #[test]
    fn test_effective_frequency_falls_back_when_unset() {
        let t = tracer();
        assert_eq!(t.effective_frequency(), clock::NOMINAL_TICKS_PER_SEC);
    }
}
