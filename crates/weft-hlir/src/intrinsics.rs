//! Runtime facade declarations.
//!
//! The lowering layer talks to the runtime purely through named extern
//! symbols; the signatures here mirror `weft-rt`'s `extern "C"` facade
//! and must stay in lockstep with it (that agreement is the ABI -- there
//! is no compile-time dependency in either direction).
//!
//! The `hlir.*` declarations are not runtime symbols: they are the
//! marker/anchor placeholders construct creation plants in the IR, and
//! every one of them is erased by lowering.

use weft_ir::{FuncRef, Module, TypeId};

/// Declared facade symbols plus the shared triple type, resolved once
/// per module.
pub(crate) struct Intrinsics {
    pub create_synch: FuncRef,
    pub queue_func: FuncRef,
    pub finish_func: FuncRef,
    pub await_synch: FuncRef,
    pub alloc: FuncRef,
    pub task_queue: FuncRef,
    pub task_await_future: FuncRef,
    pub task_release_future: FuncRef,
    pub task_retire: FuncRef,
    pub create_reduce: FuncRef,
    pub reduce_finish: FuncRef,
    pub await_reduce: FuncRef,
    /// Caller-side placeholder for parallel-for: `hlir.marker(id)`.
    pub marker: FuncRef,
    /// Caller-side placeholder for parallel-reduce; its result stands in
    /// for the reduction total until lowering: `hlir.reduce.marker(id)`.
    pub reduce_marker: FuncRef,
    /// Body-side insertion anchors: `hlir.anchor(id)`.
    pub anchor: FuncRef,
    /// The per-iteration triple `{synch, index, args}` as an IR type.
    pub triple_ty: TypeId,
}

impl Intrinsics {
    pub fn declare(m: &mut Module) -> Self {
        let void = m.void_ty();
        let i32t = m.i32_ty();
        let i64t = m.i64_ty();
        let bp = m.byte_ptr_ty();
        let triple_ty = m.struct_ty(vec![bp, i32t, bp]);

        Intrinsics {
            create_synch: m.declare_func("weft_create_synch", vec![i32t], bp),
            queue_func: m.declare_func(
                "weft_queue_func",
                vec![bp, bp, bp, i32t, i32t],
                void,
            ),
            finish_func: m.declare_func("weft_finish_func", vec![bp], void),
            await_synch: m.declare_func("weft_await_synch", vec![bp], void),
            alloc: m.declare_func("weft_alloc", vec![i64t], bp),
            task_queue: m.declare_func("weft_task_queue", vec![bp, bp], void),
            task_await_future: m.declare_func("weft_task_await_future", vec![bp], void),
            task_release_future: m.declare_func("weft_task_release_future", vec![bp], void),
            task_retire: m.declare_func("weft_task_retire", vec![bp], void),
            create_reduce: m.declare_func("weft_create_reduce", vec![i32t, i32t, i64t], bp),
            reduce_finish: m.declare_func("weft_reduce_finish", vec![bp, i64t], void),
            await_reduce: m.declare_func("weft_await_reduce", vec![bp], i64t),
            marker: m.declare_func("hlir.marker", vec![i32t], void),
            reduce_marker: m.declare_func("hlir.reduce.marker", vec![i32t], i64t),
            anchor: m.declare_func("hlir.anchor", vec![i32t], void),
            triple_ty,
        }
    }
}

/// Priority lowered parallel-region iterations are queued at. Tasks use
/// [`TASK_PRIORITY`]; iterations preempt freshly queued tasks.
pub const ITER_PRIORITY: i32 = 1;
pub const TASK_PRIORITY: i32 = 0;
