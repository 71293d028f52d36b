//! Weft runtime library.
//!
//! This crate provides the runtime support compiled Weft programs call at
//! runtime. It is compiled as both:
//!
//! - A static library (`libweft_rt.a`) for linking into native binaries
//! - A Rust library (`lib`) for unit testing and for driving lowered IR
//!   from the evaluator in integration tests
//!
//! ## Modules
//!
//! - [`vsem`]: virtual semaphore -- signed count, optional cap, the
//!   N-party latch idiom
//! - [`pool`]: fixed worker threads draining one priority-ordered queue
//! - [`abi`]: the `extern "C"` facade lowered IR calls (latches, futures,
//!   task queueing, reductions, allocation)
//!
//! ## ABI Contract
//!
//! All public `extern "C"` functions in this crate form the runtime ABI.
//! Lowered IR calls these symbols directly. The function signatures and
//! the argument-block layouts documented in [`abi`] must remain stable.

pub mod abi;
pub mod pool;
pub mod vsem;

// Re-export key items for convenient Rust-side access and testing.
pub use abi::{
    weft_alloc, weft_await_reduce, weft_await_synch, weft_create_reduce, weft_create_synch,
    weft_finish_func, weft_queue_func, weft_reduce_finish, weft_rt_init, weft_rt_shutdown,
    weft_task_await_future, weft_task_queue, weft_task_release_future, weft_task_retire,
    IterArg, Latch, ReduceOp, ITER_PRIORITY, TASK_PRIORITY,
};
pub use pool::{ThreadPool, WorkFn};
pub use vsem::VSem;
