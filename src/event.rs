// src/event.rs
//! Wire-format event codes and the typed emission API.
//!
//! Record layout: `byte(type | argcount << 6)`, a length byte when the
//! argument count saturates at 3, `varint(tick delta)`, the varint
//! arguments, and an optional varint stack id. Dictionary records (string,
//! stack) and the batch/footer records use their own layouts, documented on
//! each variant.

use crate::pool::WorkerId;
use crate::session::Tracer;

/// Shift of the argument count within the first record byte.
pub const ARG_COUNT_SHIFT: u32 = 6;

/// 16-byte stream header identifying the format version.
pub const MAGIC: &[u8; 16] = b"exectrace 1.0\0\0\0";

/// Record type codes. The low 6 bits of a record's first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    /// Start of a per-owner buffer: `[owner id, absolute base tick]`.
    Batch = 1,
    /// Footer: effective ticks per second `[frequency]`.
    Frequency = 2,
    /// Stack dictionary record: `[payload length]` then
    /// `id, frame count, (pc, func id, file id, line)*`.
    Stack = 3,
    /// String dictionary record: `[id, length]` then raw bytes.
    String = 4,
    /// Footer marker naming the host's timer task: `[task id]`.
    TimerTask = 5,

    /// Processor count changed: `[count]`.
    Procs = 6,
    /// Live heap size changed: `[bytes]`.
    HeapLive = 7,
    /// Heap growth target changed: `[bytes]`.
    HeapGoal = 8,

    /// GC cycle started: `[gc sequence]` + stack.
    GcStart = 9,
    GcDone = 10,
    /// Sweep phase started, with the sweeper's stack.
    GcSweepStart = 11,
    GcSweepDone = 12,

    /// Task created: `[task id, entry stack id]` + creator stack.
    TaskCreate = 13,
    /// Task started running: `[task id]`.
    TaskStart = 14,
    TaskEnd = 15,
    /// Task yielded the processor, also the final event of a session.
    TaskYield = 16,

    TaskBlock = 17,
    TaskBlockSend = 18,
    TaskBlockRecv = 19,
    TaskBlockSelect = 20,
    TaskBlockSync = 21,
    TaskBlockCond = 22,
    TaskBlockNet = 23,
    /// Task became runnable again: `[task id]` + waker stack.
    TaskUnblock = 24,

    SyscallEnter = 25,
    /// Syscall returned: `[task id, real exit tick]`.
    SyscallExit = 26,
    /// Syscall declared blocking.
    SyscallBlock = 27,

    /// Snapshot: task was waiting when the session started: `[task id]`.
    TaskWaiting = 28,
    /// Snapshot: task was in a syscall when the session started: `[task id]`.
    TaskInSyscall = 29,
}

impl EventType {
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Why a task blocked. Each reason has its own wire code so consumers can
/// classify waits without extra arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Other,
    ChannelSend,
    ChannelRecv,
    Select,
    Sync,
    Condition,
    Network,
}

impl BlockReason {
    fn event(self) -> EventType {
        match self {
            BlockReason::Other => EventType::TaskBlock,
            BlockReason::ChannelSend => EventType::TaskBlockSend,
            BlockReason::ChannelRecv => EventType::TaskBlockRecv,
            BlockReason::Select => EventType::TaskBlockSelect,
            BlockReason::Sync => EventType::TaskBlockSync,
            BlockReason::Condition => EventType::TaskBlockCond,
            BlockReason::Network => EventType::TaskBlockNet,
        }
    }
}

/// Per-call-site stack policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackCapture {
    /// The event carries no stack argument at all.
    Omit,
    /// The event carries a stack argument, recorded as the empty stack.
    Empty,
    /// Capture the live stack, skipping the `n` innermost frames.
    Skip(usize),
}

/// Typed event wrappers. Each resolves the caller's buffer, reserves
/// worst-case space, encodes, and releases the buffer; see
/// [`Tracer::emit`] for the shared encoding path.
impl Tracer {
    pub fn task_create(&self, worker: Option<WorkerId>, task: u64, start_pc: u64) {
        if !self.is_active() {
            return;
        }
        let entry = self.intern_stack(&[start_pc]);
        self.emit(
            worker,
            EventType::TaskCreate,
            StackCapture::Skip(2),
            &[task, u64::from(entry)],
        );
    }

    pub fn task_start(&self, worker: Option<WorkerId>, task: u64) {
        self.emit(worker, EventType::TaskStart, StackCapture::Omit, &[task]);
    }

    pub fn task_end(&self, worker: Option<WorkerId>) {
        self.emit(worker, EventType::TaskEnd, StackCapture::Omit, &[]);
    }

    pub fn task_yield(&self, worker: Option<WorkerId>) {
        self.emit(worker, EventType::TaskYield, StackCapture::Skip(1), &[]);
    }

    pub fn task_block(&self, worker: Option<WorkerId>, reason: BlockReason, stack: StackCapture) {
        self.emit(worker, reason.event(), stack, &[]);
    }

    pub fn task_unblock(&self, worker: Option<WorkerId>, task: u64, stack: StackCapture) {
        self.emit(worker, EventType::TaskUnblock, stack, &[task]);
    }

    pub fn syscall_enter(&self, worker: Option<WorkerId>, stack: StackCapture) {
        self.emit(worker, EventType::SyscallEnter, stack, &[]);
    }

    /// `real_ticks` is the tick count observed at the actual syscall
    /// return, which may predate this event's own timestamp.
    pub fn syscall_exit(&self, worker: Option<WorkerId>, task: u64, real_ticks: u64) {
        self.emit(
            worker,
            EventType::SyscallExit,
            StackCapture::Omit,
            &[task, real_ticks],
        );
    }

    pub fn syscall_block(&self, worker: Option<WorkerId>) {
        self.emit(worker, EventType::SyscallBlock, StackCapture::Omit, &[]);
    }

    pub fn gc_start(&self, worker: Option<WorkerId>) {
        let seq = self.next_gc_seq();
        self.emit(worker, EventType::GcStart, StackCapture::Skip(2), &[seq]);
    }

    pub fn gc_done(&self, worker: Option<WorkerId>) {
        self.emit(worker, EventType::GcDone, StackCapture::Omit, &[]);
    }

    pub fn gc_sweep_start(&self, worker: Option<WorkerId>) {
        self.emit(worker, EventType::GcSweepStart, StackCapture::Skip(1), &[]);
    }

    pub fn gc_sweep_done(&self, worker: Option<WorkerId>) {
        self.emit(worker, EventType::GcSweepDone, StackCapture::Omit, &[]);
    }

    pub fn procs_changed(&self, worker: Option<WorkerId>, procs: u64) {
        self.emit(
            worker,
            EventType::Procs,
            StackCapture::Skip(1),
            &[procs],
        );
    }

    pub fn heap_live(&self, worker: Option<WorkerId>, bytes: u64) {
        self.emit(worker, EventType::HeapLive, StackCapture::Omit, &[bytes]);
    }

    pub fn heap_goal(&self, worker: Option<WorkerId>, bytes: u64) {
        self.emit(worker, EventType::HeapGoal, StackCapture::Omit, &[bytes]);
    }
}
