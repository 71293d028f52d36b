//! Task lowering.
//!
//! Every direct call `C = f(a0, ...)` outside the task's own wrapper
//! becomes an asynchronous launch:
//!
//! ```text
//!   %args = call @weft_alloc(sizeof S)
//!   store a0.. into fields base..            ; depth is stamped by the
//!   call @weft_task_queue(@wrapper, %args)   ; runtime, not stored here
//! ```
//!
//! and the future is forced at the caller-side anchor of `C`'s first
//! consumer:
//!
//! ```text
//!   call @weft_task_await_future(%args)
//!   %r = load (fieldptr %args, 2)
//!   call @weft_task_retire(%args)            ; frees future + arg-struct
//! ```
//!
//! with every use of `C` rewritten to `%r`. The anchor is the first
//! caller instruction using the result -- or, when the only consumer is
//! the body of a construct lowered after this one, that construct's
//! marker, since the body's captures are spilled in the caller right
//! before it. (A region lowered *before* this pass has already spilled;
//! its store is an ordinary caller use.) A call whose result is never
//! used anywhere is queued but never awaited: it runs, and its
//! arg-struct and future are intentionally left to leak, matching the
//! fork-and-forget reading of the construct.

use rustc_hash::FxHashMap;

use weft_ir::{Builder, FuncRef, InstKind, InstRef, Module, Value};

use crate::construct::Task;
use crate::error::LowerError;
use crate::intrinsics::Intrinsics;

pub(crate) fn lower(
    m: &mut Module,
    intr: &Intrinsics,
    task: &Task,
    region_markers: &FxHashMap<FuncRef, InstRef>,
) -> Result<(), LowerError> {
    // Collect first: rewriting mutates the blocks being walked.
    let mut sites: Vec<(FuncRef, InstRef)> = Vec::new();
    let funcs: Vec<_> = m.funcs().collect();
    for f in funcs {
        if f == task.wrapper || m.func(f).is_extern {
            continue;
        }
        for inst in m.func_insts(f) {
            if let InstKind::Call { callee, .. } = &m.inst(inst).kind {
                if *callee == Value::Func(task.func) {
                    sites.push((f, inst));
                }
            }
        }
    }

    tracing::debug!(task = %task.name, sites = sites.len(), "lowering task call sites");
    for (caller, site) in sites {
        rewrite_call_site(m, intr, task, caller, site, region_markers);
    }
    Ok(())
}

fn uses_value(m: &Module, inst: InstRef, value: Value) -> bool {
    let mut found = false;
    m.inst(inst).kind.for_each_value(|v| {
        if v == value {
            found = true;
        }
    });
    found
}

/// Caller-side position the await sequence is inserted before: the
/// earliest, in the caller's program order, of
///
/// - the first caller instruction using `result`, and
/// - the marker of any still-unlowered parallel region whose body uses
///   `result` (the region's capture spill will land just before its
///   marker and must read the awaited value).
fn await_anchor(
    m: &Module,
    caller: FuncRef,
    site: InstRef,
    result: Value,
    region_markers: &FxHashMap<FuncRef, InstRef>,
) -> Option<InstRef> {
    let order = m.func_insts(caller);
    let mut anchor: Option<usize> = None;

    for (pos, &inst) in order.iter().enumerate() {
        if inst != site && uses_value(m, inst, result) {
            anchor = Some(pos);
            break;
        }
    }

    for (&body, &marker) in region_markers {
        // A live marker in this caller means the region still lowers
        // later; an erased one already spilled its captures (covered by
        // the caller scan above).
        let in_caller = m
            .position_in_block(marker)
            .map(|(block, _)| m.block(block).func == caller)
            .unwrap_or(false);
        if !in_caller {
            continue;
        }
        if !m.func_insts(body).iter().any(|&i| uses_value(m, i, result)) {
            continue;
        }
        if let Some(pos) = order.iter().position(|&i| i == marker) {
            anchor = Some(anchor.map_or(pos, |a| a.min(pos)));
        }
    }

    anchor.map(|pos| order[pos])
}

fn rewrite_call_site(
    m: &mut Module,
    intr: &Intrinsics,
    task: &Task,
    caller: FuncRef,
    site: InstRef,
    region_markers: &FxHashMap<FuncRef, InstRef>,
) {
    let call_args = match &m.inst(site).kind {
        InstKind::Call { args, .. } => args.clone(),
        _ => unreachable!("collected sites are calls"),
    };
    let size = m.layout_of(task.arg_struct).size;

    // Launch sequence, in place of the call.
    let mut b = Builder::before(m, site);
    let size = b.module().const_i64(size as i64);
    let args_raw = b.call(intr.alloc, vec![size], "task.args");
    let struct_ptr_ty = b.module().ptr_ty(task.arg_struct);
    let args = b.ptr_cast(args_raw, struct_ptr_ty, "task.args.typed");
    for (j, &a) in call_args.iter().enumerate() {
        let fp = b.field_ptr(args, task.args_base + j as u32, "");
        b.store(a, fp);
    }
    let bp = b.module().byte_ptr_ty();
    let wrapper_fn = b.ptr_cast(Value::Func(task.wrapper), bp, "task.fn");
    b.call(intr.task_queue, vec![wrapper_fn, args_raw], "");
    drop(b);

    // Force the future at the result's first consumer, if it has one.
    let result = Value::Inst(site);
    let first_use = await_anchor(m, caller, site, result, region_markers);

    if let (Some(use_at), Some(ret_field)) = (first_use, task.ret_field) {
        let mut b = Builder::before(m, use_at);
        b.call(intr.task_await_future, vec![args_raw], "");
        let rp = b.field_ptr(args, ret_field, "");
        let loaded = b.load(rp, "task.ret");
        b.call(intr.task_retire, vec![args_raw], "");
        drop(b);

        // The result may also be referenced from construct bodies created
        // off this caller; rewrite module-wide.
        let funcs: Vec<_> = m.funcs().collect();
        for f in funcs {
            if !m.func(f).is_extern {
                m.replace_uses_in_func(f, result, loaded);
            }
        }
    }

    m.erase_inst(site);
}
