//! Runtime C-ABI facade.
//!
//! The `extern "C"` symbols lowered IR calls. Their names, signatures and
//! semantics are the binary contract with compiled code; keep them stable.
//!
//! ## Protocol
//!
//! A *parallel-for* over `n` iterations queues `n` body invocations
//! against a latch created with count `-(n-1)`; each body's epilogue
//! releases once ([`weft_finish_func`]), and the coordinator blocks in
//! [`weft_await_synch`] until the `n`-th release tips the count positive.
//!
//! A *task* is queued with a heap arg-struct whose header is
//! `{ future, depth }`; the synthesized wrapper stores the return value
//! into the struct and releases the future. The first consumer of the
//! result awaits the future, loads the return slot, then retires the
//! task's storage.
//!
//! A *parallel-reduce* uses a latch that also carries an accumulator and
//! a combine operator; body epilogues feed their partial through
//! [`weft_reduce_finish`] and the coordinator collects the total from
//! [`weft_await_reduce`].
//!
//! ## Handles
//!
//! Latches cross the boundary as opaque pointers. Internally each handle
//! carries a magic tag checked on every entry; a facade call with a
//! mismatched handle logs an error and becomes a no-op instead of
//! corrupting memory.
//!
//! ## Blocking on workers
//!
//! Awaits that land on a pool worker thread *help*: they drain queued
//! items while the latch is unready. Recursive fork-join (a task awaiting
//! tasks it spawned) therefore cannot starve the pool, at any worker
//! count.

use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::pool::{self, ThreadPool, WorkFn};
use crate::vsem::VSem;

/// Priority for parallel-for and parallel-reduce iterations.
pub const ITER_PRIORITY: i32 = 1;
/// Priority for tasks. Loop iterations preempt freshly queued tasks.
pub const TASK_PRIORITY: i32 = 0;

/// How long a helping await blocks when the queue is momentarily empty
/// before re-checking for new work.
const HELP_RECHECK: Duration = Duration::from_millis(1);

// ── Latch handles ─────────────────────────────────────────────────────

const LATCH_TAG: u32 = 0x5EAF_17C4;

/// Combine operator for parallel reductions. The discriminants are ABI:
/// lowered IR passes them as plain `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReduceOp {
    Add = 0,
    Mul = 1,
    Min = 2,
    Max = 3,
    And = 4,
    Or = 5,
    Xor = 6,
}

impl ReduceOp {
    pub fn from_i32(v: i32) -> Option<ReduceOp> {
        Some(match v {
            0 => ReduceOp::Add,
            1 => ReduceOp::Mul,
            2 => ReduceOp::Min,
            3 => ReduceOp::Max,
            4 => ReduceOp::And,
            5 => ReduceOp::Or,
            6 => ReduceOp::Xor,
            _ => return None,
        })
    }

    /// The operator's identity element (the accumulator's initial value).
    pub fn identity(self) -> i64 {
        match self {
            ReduceOp::Add | ReduceOp::Or | ReduceOp::Xor => 0,
            ReduceOp::Mul => 1,
            ReduceOp::Min => i64::MAX,
            ReduceOp::Max => i64::MIN,
            ReduceOp::And => -1,
        }
    }

    fn combine(self, a: i64, b: i64) -> i64 {
        match self {
            ReduceOp::Add => a.wrapping_add(b),
            ReduceOp::Mul => a.wrapping_mul(b),
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
            ReduceOp::And => a & b,
            ReduceOp::Or => a | b,
            ReduceOp::Xor => a ^ b,
        }
    }
}

enum LatchKind {
    Plain,
    Reduce { op: ReduceOp, acc: Mutex<i64> },
}

/// A tagged completion latch / future. Opaque to compiled code.
pub struct Latch {
    tag: u32,
    sem: VSem,
    kind: LatchKind,
}

impl Latch {
    fn plain(count: i64) -> Box<Latch> {
        Box::new(Latch {
            tag: LATCH_TAG,
            sem: VSem::new(count),
            kind: LatchKind::Plain,
        })
    }

    fn reduce(count: i64, op: ReduceOp, init: i64) -> Box<Latch> {
        Box::new(Latch {
            tag: LATCH_TAG,
            sem: VSem::new(count),
            kind: LatchKind::Reduce {
                op,
                acc: Mutex::new(init),
            },
        })
    }
}

/// Validate a latch handle coming in over the ABI.
///
/// # Safety
///
/// `ptr` must be null or point to readable memory at least `Latch`-sized;
/// a valid handle is one previously returned by this facade and not yet
/// freed.
unsafe fn latch_ref<'a>(ptr: *mut Latch, op: &'static str) -> Option<&'a Latch> {
    if ptr.is_null() {
        tracing::error!(op, "null latch handle");
        return None;
    }
    let latch = &*ptr;
    if latch.tag != LATCH_TAG {
        tracing::error!(op, tag = latch.tag, "invalid latch handle");
        return None;
    }
    Some(latch)
}

/// Acquire, draining pool work while waiting if the calling thread is a
/// pool worker.
fn acquire_with_help(sem: &VSem) {
    loop {
        if sem.try_acquire() {
            return;
        }
        match pool::help_current_pool() {
            // Ran an item; the latch may have tipped, re-check.
            Some(true) => {}
            // Worker with an empty queue: block briefly, then look again
            // (new work may have arrived that only this thread can run).
            Some(false) => {
                if sem.acquire_timeout(HELP_RECHECK) {
                    return;
                }
            }
            // Not a worker thread: a plain block is safe.
            None => {
                sem.acquire();
                return;
            }
        }
    }
}

// ── Argument blocks ───────────────────────────────────────────────────

/// Per-iteration argument triple built by [`weft_queue_func`] and freed
/// by [`weft_finish_func`]. Layout is ABI: `{ i8*, i32, i8* }`.
#[repr(C)]
pub struct IterArg {
    pub synch: *mut Latch,
    pub index: i32,
    pub args: *mut u8,
}

/// Leading fields of every task arg-struct. Layout is ABI: the return
/// slot and call arguments follow at C offsets.
#[repr(C)]
struct TaskHeader {
    future: *mut Latch,
    depth: i32,
}

// ── Heap allocation ───────────────────────────────────────────────────

/// Bytes reserved in front of every [`weft_alloc`] block for the size,
/// keeping the payload 16-aligned.
const ALLOC_HEADER: usize = 16;

/// Allocate `bytes` of zeroed heap memory. Returns null (and logs) on a
/// negative or absurd size instead of aborting; the caller owns the
/// block until it is retired.
#[no_mangle]
pub extern "C" fn weft_alloc(bytes: i64) -> *mut u8 {
    let Ok(size) = usize::try_from(bytes) else {
        tracing::error!(bytes, "weft_alloc: negative size");
        return std::ptr::null_mut();
    };
    let Some(total) = size.checked_add(ALLOC_HEADER) else {
        tracing::error!(bytes, "weft_alloc: size overflow");
        return std::ptr::null_mut();
    };
    let Ok(layout) = std::alloc::Layout::from_size_align(total, ALLOC_HEADER) else {
        tracing::error!(bytes, "weft_alloc: size too large");
        return std::ptr::null_mut();
    };
    // Safety: layout has non-zero size (header included).
    unsafe {
        let base = std::alloc::alloc_zeroed(layout);
        if base.is_null() {
            tracing::error!(bytes, "weft_alloc: out of memory");
            return std::ptr::null_mut();
        }
        (base as *mut usize).write(total);
        base.add(ALLOC_HEADER)
    }
}

/// Free a block from [`weft_alloc`].
///
/// # Safety
///
/// `ptr` must have come from [`weft_alloc`] and not been freed before.
unsafe fn rt_free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let base = ptr.sub(ALLOC_HEADER);
    let total = (base as *const usize).read();
    let layout = std::alloc::Layout::from_size_align_unchecked(total, ALLOC_HEADER);
    std::alloc::dealloc(base, layout);
}

// ── Runtime context ───────────────────────────────────────────────────

/// The process-wide runtime: the pool, behind explicit init/teardown.
/// The ABI symbols are thin trampolines over this.
struct Runtime {
    pool: ThreadPool,
}

static RUNTIME: Mutex<Option<Arc<Runtime>>> = Mutex::new(None);

fn runtime() -> Arc<Runtime> {
    let mut guard = RUNTIME.lock();
    guard
        .get_or_insert_with(|| {
            tracing::debug!("runtime starting on demand");
            Arc::new(Runtime {
                pool: ThreadPool::new(0),
            })
        })
        .clone()
}

/// Initialize the global runtime with `workers` pool threads (0 = the
/// machine's available parallelism). Idempotent: once the runtime exists
/// -- from an earlier init or from first use -- the call is a no-op.
#[no_mangle]
pub extern "C" fn weft_rt_init(workers: i32) {
    let mut guard = RUNTIME.lock();
    if guard.is_some() {
        tracing::warn!("weft_rt_init: runtime already running");
        return;
    }
    *guard = Some(Arc::new(Runtime {
        pool: ThreadPool::new(workers.max(0) as usize),
    }));
}

/// Drain queued work and stop the pool. Safe to call more than once.
#[no_mangle]
pub extern "C" fn weft_rt_shutdown() {
    let taken = RUNTIME.lock().take();
    if let Some(rt) = taken {
        rt.pool.shutdown();
    }
}

// ── Parallel-for facade ───────────────────────────────────────────────

/// Create the completion latch for an `n`-iteration parallel region:
/// initial count `-(n-1)`, so the `n`-th release is what tips it.
/// `n == 0` yields `+1` and the await returns immediately.
#[no_mangle]
pub extern "C" fn weft_create_synch(n: i32) -> *mut Latch {
    Box::into_raw(Latch::plain(1 - n as i64))
}

/// Queue one iteration: build the `{synch, index, args}` triple and push
/// `(func, triple, priority)` onto the pool.
///
/// # Safety
///
/// `synch` must be a live latch handle; `func` must be callable with the
/// triple pointer; `args` is carried through opaquely.
#[no_mangle]
pub unsafe extern "C" fn weft_queue_func(
    synch: *mut Latch,
    args: *mut u8,
    func: WorkFn,
    index: i32,
    priority: i32,
) {
    if latch_ref(synch, "weft_queue_func").is_none() {
        return;
    }
    let triple = Box::new(IterArg { synch, index, args });
    runtime()
        .pool
        .push(func, Box::into_raw(triple) as *mut u8, priority);
}

/// Body epilogue: release the triple's latch and free the triple.
///
/// # Safety
///
/// `arg` must be the triple pointer the body was invoked with; it is
/// consumed here and must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn weft_finish_func(arg: *mut u8) {
    if arg.is_null() {
        tracing::error!("weft_finish_func: null triple");
        return;
    }
    let triple = Box::from_raw(arg as *mut IterArg);
    if let Some(latch) = latch_ref(triple.synch, "weft_finish_func") {
        latch.sem.release();
    }
}

/// Coordinator side: block until every iteration has finished, then free
/// the latch (the coordinator owns it).
///
/// # Safety
///
/// `synch` must be a live latch handle; it is consumed here.
#[no_mangle]
pub unsafe extern "C" fn weft_await_synch(synch: *mut Latch) {
    let Some(latch) = latch_ref(synch, "weft_await_synch") else {
        return;
    };
    acquire_with_help(&latch.sem);
    drop(Box::from_raw(synch));
}

// ── Task facade ───────────────────────────────────────────────────────

thread_local! {
    /// Depth of the task currently running on this thread; 0 outside any
    /// task. Children queued from inside a task get depth + 1.
    static TASK_DEPTH: Cell<i32> = const { Cell::new(0) };
}

/// Runtime-internal envelope so the worker can restore task depth around
/// the wrapper call.
struct TaskTicket {
    func: WorkFn,
    args: *mut u8,
}

extern "C-unwind" fn run_task(arg: *mut u8) {
    // Safety: arg is the TaskTicket queued by weft_task_queue.
    let ticket = unsafe { Box::from_raw(arg as *mut TaskTicket) };
    // Safety: the args block was written by weft_task_queue and is at
    // least TaskHeader-sized by the lowering contract.
    let depth = unsafe { (*(ticket.args as *const TaskHeader)).depth };
    TASK_DEPTH.with(|d| {
        let saved = d.get();
        d.set(depth);
        (ticket.func)(ticket.args);
        d.set(saved);
    });
}

/// Queue a task: allocate its future (a latch at count 0) into the
/// arg-struct header, stamp the spawn depth, and push the wrapper at
/// task priority.
///
/// # Safety
///
/// `args` must point to a task arg-struct (header `{future, depth}`
/// first) from [`weft_alloc`]; `func` must be the task's wrapper.
#[no_mangle]
pub unsafe extern "C" fn weft_task_queue(func: WorkFn, args: *mut u8) {
    if args.is_null() {
        tracing::error!("weft_task_queue: null arg-struct");
        return;
    }
    let header = args as *mut TaskHeader;
    (*header).future = Box::into_raw(Latch::plain(0));
    (*header).depth = TASK_DEPTH.with(|d| d.get()) + 1;
    tracing::trace!(depth = (*header).depth, "task queued");

    let ticket = Box::new(TaskTicket { func, args });
    runtime()
        .pool
        .push(run_task, Box::into_raw(ticket) as *mut u8, TASK_PRIORITY);
}

/// Force the task's future: block until the wrapper has released it.
/// On a pool worker this drains other work while waiting.
///
/// # Safety
///
/// `args` must be a task arg-struct previously queued and not retired.
#[no_mangle]
pub unsafe extern "C" fn weft_task_await_future(args: *mut u8) {
    let future = (*(args as *const TaskHeader)).future;
    let Some(latch) = latch_ref(future, "weft_task_await_future") else {
        return;
    };
    acquire_with_help(&latch.sem);
}

/// Wrapper epilogue: signal completion. The return value store in the
/// wrapper happens-before this release, so an awaiter may read the slot
/// once its acquire returns.
///
/// # Safety
///
/// `args` must be a task arg-struct previously queued and not retired.
#[no_mangle]
pub unsafe extern "C" fn weft_task_release_future(args: *mut u8) {
    let future = (*(args as *const TaskHeader)).future;
    if let Some(latch) = latch_ref(future, "weft_task_release_future") {
        latch.sem.release();
    }
}

/// Free a task's future and arg-struct. Lowered IR calls this after the
/// awaiter has loaded the return slot; a task whose result is never used
/// is never retired and leaks (see the design notes).
///
/// # Safety
///
/// `args` must be a task arg-struct whose future has been awaited; the
/// block is consumed here.
#[no_mangle]
pub unsafe extern "C" fn weft_task_retire(args: *mut u8) {
    let future = (*(args as *const TaskHeader)).future;
    if latch_ref(future, "weft_task_retire").is_some() {
        drop(Box::from_raw(future));
    }
    rt_free(args);
}

// ── Parallel-reduce facade ────────────────────────────────────────────

/// Create a reduction latch: an `n`-party latch carrying an accumulator
/// (starting at `init`) and a combine operator code (see [`ReduceOp`]).
#[no_mangle]
pub extern "C" fn weft_create_reduce(n: i32, op: i32, init: i64) -> *mut Latch {
    let Some(op) = ReduceOp::from_i32(op) else {
        tracing::error!(op, "weft_create_reduce: unknown operator");
        return std::ptr::null_mut();
    };
    Box::into_raw(Latch::reduce(1 - n as i64, op, init))
}

/// Reduce-body epilogue: fold `partial` into the accumulator, release
/// the latch, free the triple. Combination order is completion order --
/// deterministic results require a commutative operator.
///
/// # Safety
///
/// `arg` must be the triple the body was invoked with; consumed here.
#[no_mangle]
pub unsafe extern "C" fn weft_reduce_finish(arg: *mut u8, partial: i64) {
    if arg.is_null() {
        tracing::error!("weft_reduce_finish: null triple");
        return;
    }
    let triple = Box::from_raw(arg as *mut IterArg);
    let Some(latch) = latch_ref(triple.synch, "weft_reduce_finish") else {
        return;
    };
    match &latch.kind {
        LatchKind::Reduce { op, acc } => {
            let mut acc = acc.lock();
            *acc = op.combine(*acc, partial);
        }
        LatchKind::Plain => {
            tracing::error!("weft_reduce_finish: latch has no accumulator");
        }
    }
    latch.sem.release();
}

/// Coordinator side: await all partials, read the total, free the latch.
///
/// # Safety
///
/// `synch` must be a live reduction latch handle; it is consumed here.
#[no_mangle]
pub unsafe extern "C" fn weft_await_reduce(synch: *mut Latch) -> i64 {
    let Some(latch) = latch_ref(synch, "weft_await_reduce") else {
        return 0;
    };
    let LatchKind::Reduce { acc, .. } = &latch.kind else {
        tracing::error!("weft_await_reduce: latch has no accumulator");
        return 0;
    };
    acquire_with_help(&latch.sem);
    let total = *acc.lock();
    drop(Box::from_raw(synch));
    total
}
