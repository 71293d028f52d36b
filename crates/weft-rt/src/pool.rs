//! Priority thread pool.
//!
//! A fixed set of worker threads drains a single priority-ordered queue
//! of `(function, argument, priority)` work items. Higher priority drains
//! first; items of equal priority drain in push order (a monotonic
//! sequence number breaks ties). A [`VSem`] serves as the work-available
//! counter: released once per push, acquired by a worker per item.
//!
//! Work items run to completion on one thread. A panicking item is
//! caught and logged; the worker survives. Shutdown is drain-then-exit:
//! workers finish everything already queued, then stop.

use std::cell::RefCell;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::vsem::VSem;

/// The shape of a work-item body: the C ABI the lowered IR produces
/// function pointers for.
pub type WorkFn = extern "C-unwind" fn(*mut u8);

struct WorkItem {
    func: WorkFn,
    arg: *mut u8,
    priority: i32,
    seq: u64,
}

// Safety: the argument pointer is owned by the runtime protocol -- the
// queueing side hands it off and does not touch it again until the body
// (or an awaiter synchronized with the body) takes over.
unsafe impl Send for WorkItem {}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for WorkItem {}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: greater = higher priority, then lower sequence number
        // (FIFO among equal priorities).
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct Shared {
    queue: Mutex<BinaryHeap<WorkItem>>,
    /// Work-available counter: one release per queued item (plus one per
    /// worker at shutdown).
    work: VSem,
    shutdown: AtomicBool,
    next_seq: AtomicU64,
}

thread_local! {
    /// Set while a thread runs a worker loop; lets blocking runtime calls
    /// on a worker help drain the queue instead of deadlocking it.
    static CURRENT_POOL: RefCell<Weak<Shared>> = const { RefCell::new(Weak::new()) };
}

/// Run one queued item on the current thread if this thread belongs to a
/// pool and an item is immediately available. `None` when the current
/// thread is not a pool worker.
pub(crate) fn help_current_pool() -> Option<bool> {
    let shared = CURRENT_POOL.with(|p| p.borrow().upgrade())?;
    Some(try_run_one(&shared))
}

fn try_run_one(shared: &Shared) -> bool {
    if !shared.work.try_acquire() {
        return false;
    }
    let item = shared.queue.lock().pop();
    match item {
        Some(item) => {
            run_item(&item);
            true
        }
        None => {
            // The unit we took was a shutdown token; put it back for the
            // workers it was meant for.
            shared.work.release();
            false
        }
    }
}

fn run_item(item: &WorkItem) {
    let result = catch_unwind(AssertUnwindSafe(|| (item.func)(item.arg)));
    if result.is_err() {
        tracing::error!(priority = item.priority, seq = item.seq, "work item panicked");
    }
}

fn worker_loop(shared: Arc<Shared>) {
    CURRENT_POOL.with(|p| *p.borrow_mut() = Arc::downgrade(&shared));
    loop {
        shared.work.acquire();
        let item = shared.queue.lock().pop();
        match item {
            Some(item) => run_item(&item),
            None => {
                if shared.shutdown.load(Ordering::Acquire) {
                    break;
                }
            }
        }
    }
    CURRENT_POOL.with(|p| *p.borrow_mut() = Weak::new());
    tracing::debug!("worker exiting");
}

/// The pool. Dropping it drains and joins the workers.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl ThreadPool {
    /// Spawn a pool with the given worker count; 0 means the machine's
    /// available parallelism.
    pub fn new(workers: usize) -> Self {
        let worker_count = if workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            workers
        };

        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            work: VSem::new(0),
            shutdown: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        });

        let mut handles = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("weft-worker-{i}"))
                .stack_size(16 * 1024 * 1024)
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        tracing::debug!(workers = worker_count, "thread pool started");

        ThreadPool {
            shared,
            workers: Mutex::new(handles),
            worker_count,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Enqueue a work item. Higher `priority` drains first; equal
    /// priorities drain in push order. Items pushed after shutdown are
    /// dropped with a warning.
    pub fn push(&self, func: WorkFn, arg: *mut u8, priority: i32) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            tracing::warn!(priority, "push after shutdown; work item dropped");
            return;
        }
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        self.shared.queue.lock().push(WorkItem {
            func,
            arg,
            priority,
            seq,
        });
        self.shared.work.release();
    }

    /// Run one queued item on the calling thread, if any is immediately
    /// available.
    pub fn try_run_one(&self) -> bool {
        try_run_one(&self.shared)
    }

    /// Drain the queue and stop the workers; idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        // One wakeup per worker: each drains until the queue is empty,
        // then sees the flag and exits.
        for _ in 0..self.worker_count {
            self.shared.work.release();
        }
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        tracing::debug!("thread pool stopped");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vsem::VSem;

    /// Recorder payload: which log to append to, and what.
    struct Rec {
        log: *const Mutex<Vec<i32>>,
        tag: i32,
    }

    extern "C-unwind" fn record(arg: *mut u8) {
        // Safety: arg is a leaked Box<Rec>; the log it points at outlives
        // the pool (tests shut the pool down before dropping the log).
        let rec = unsafe { Box::from_raw(arg as *mut Rec) };
        unsafe { &*rec.log }.lock().push(rec.tag);
    }

    extern "C-unwind" fn block_on_gate(arg: *mut u8) {
        // Safety: arg points at a VSem owned by the pushing test, which
        // joins the pool before dropping it.
        let gate = unsafe { &*(arg as *const VSem) };
        gate.acquire();
    }

    extern "C-unwind" fn panic_body(_arg: *mut u8) {
        panic!("intentional test panic");
    }

    fn push_record(pool: &ThreadPool, log: &Mutex<Vec<i32>>, tag: i32, priority: i32) {
        let rec = Box::new(Rec { log, tag });
        pool.push(record, Box::into_raw(rec) as *mut u8, priority);
    }

    #[test]
    fn priority_then_fifo_ordering() {
        // One worker; a gate item holds it while the queue fills, so the
        // drain order is decided purely by the comparator.
        let log = Mutex::new(Vec::new());
        let pool = ThreadPool::new(1);
        let gate = VSem::new(0);

        pool.push(block_on_gate, &gate as *const VSem as *mut u8, 100);
        // Low-priority items 0..5, then high-priority items 100..105.
        for i in 0..5 {
            push_record(&pool, &log, i, 0);
        }
        for i in 100..105 {
            push_record(&pool, &log, i, 1);
        }
        gate.release();

        pool.shutdown();
        let got = log.lock().clone();
        assert_eq!(got, vec![100, 101, 102, 103, 104, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn shutdown_drains_queued_items() {
        let log = Mutex::new(Vec::new());
        let pool = ThreadPool::new(2);
        for i in 0..32 {
            push_record(&pool, &log, i, 0);
        }
        pool.shutdown();
        let mut got = log.lock().clone();
        got.sort_unstable();
        assert_eq!(got, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn worker_survives_panicking_item() {
        let log = Mutex::new(Vec::new());
        let pool = ThreadPool::new(1);
        pool.push(panic_body, std::ptr::null_mut(), 0);
        push_record(&pool, &log, 777, 0);
        pool.shutdown();
        assert_eq!(log.lock().clone(), vec![777]);
    }

    /// Gate with a started-handshake so tests can wait until the worker
    /// is parked inside the item.
    struct Gate {
        started: VSem,
        release: VSem,
    }

    extern "C-unwind" fn block_on_gate_with_handshake(arg: *mut u8) {
        // Safety: arg points at a Gate owned by the pushing test, which
        // joins the pool before dropping it.
        let gate = unsafe { &*(arg as *const Gate) };
        gate.started.release();
        gate.release.acquire();
    }

    #[test]
    fn try_run_one_executes_on_caller_thread() {
        // Park the only worker inside a gate item, then drain by hand.
        let log = Mutex::new(Vec::new());
        let pool = ThreadPool::new(1);
        let gate = Gate {
            started: VSem::new(0),
            release: VSem::new(0),
        };
        pool.push(
            block_on_gate_with_handshake,
            &gate as *const Gate as *mut u8,
            100,
        );
        gate.started.acquire();

        push_record(&pool, &log, 5, 0);
        push_record(&pool, &log, 6, 0);
        while pool.try_run_one() {}
        gate.release.release();
        pool.shutdown();
        assert_eq!(log.lock().clone(), vec![5, 6]);
    }

    #[test]
    fn push_after_shutdown_is_dropped() {
        let log = Mutex::new(Vec::new());
        let pool = ThreadPool::new(1);
        pool.shutdown();
        // Dropped, not executed.
        push_record(&pool, &log, -1, 0);
        assert!(!pool.try_run_one());
        assert!(log.lock().is_empty());
    }
}
