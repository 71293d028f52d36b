//! Parallel-reduce lowering.
//!
//! The caller side mirrors parallel-for, with a reduction latch instead
//! of a plain one: `weft_create_reduce(n, op, identity)` carries the
//! accumulator, each body feeds its partial through
//! `weft_reduce_finish` (emitted at construction), and the await becomes
//! `weft_await_reduce`, whose result replaces every use of the
//! construct's marker value. Combination happens runtime-side in
//! completion order: operators must be associative, and the result is
//! deterministic only when they are also commutative.

use weft_ir::{BinOp, Builder, Cond, Module, TypeData, Value};

use super::{capture_struct, collect_captures, spill_captures, unpack_captures};
use crate::construct::{reduce_identity, ParallelReduce};
use crate::error::LowerError;
use crate::intrinsics::{Intrinsics, ITER_PRIORITY};

pub(crate) fn lower(
    m: &mut Module,
    intr: &Intrinsics,
    pr: &ParallelReduce,
) -> Result<(), LowerError> {
    let (marker_block, _) = m
        .position_in_block(pr.marker)
        .ok_or_else(|| LowerError::MarkerNotFound {
            construct: pr.name.clone(),
        })?;

    let captures = collect_captures(m, pr.region.body);
    let cap_ty = capture_struct(m, &captures);
    let init = reduce_identity(pr.op, m.type_data(pr.reduce_ty));

    let mut b = Builder::before(m, pr.marker);
    let cap_raw = spill_captures(&mut b, &captures, cap_ty);
    let n = b.binary(BinOp::Sub, pr.end, pr.start, "n");
    let op_code = b.module().const_i32(pr.op.code());
    let init = b.module().const_i64(init);
    let handle = b.call(intr.create_reduce, vec![n, op_code, init], "reduce.synch");
    let i32t = b.module().i32_ty();
    let idx_slot = b.alloca(i32t, "i.slot");
    b.store(pr.start, idx_slot);
    let bp = b.module().byte_ptr_ty();
    let body_fn = b.ptr_cast(Value::Func(pr.region.body), bp, "body.fn");
    drop(b);

    let head = m.append_block(pr.caller, "reduce.head");
    let queue = m.append_block(pr.caller, "reduce.queue");
    let await_bb = m.append_block(pr.caller, "reduce.await");
    let cont = m.split_block_after(pr.marker, "reduce.cont");

    let mut b = Builder::at_end(m, marker_block);
    b.br(head);

    b.position_at_end(head);
    let i = b.load(idx_slot, "i");
    let more = b.icmp(Cond::Slt, i, pr.end, "more");
    b.cond_br(more, queue, await_bb);

    b.position_at_end(queue);
    let i = b.load(idx_slot, "i");
    let pri = b.module().const_i32(ITER_PRIORITY);
    b.call(intr.queue_func, vec![handle, cap_raw, body_fn, i, pri], "");
    let one = b.module().const_i32(1);
    let next = b.binary(BinOp::Add, i, one, "i.next");
    b.store(next, idx_slot);
    b.br(head);

    b.position_at_end(await_bb);
    let total = b.call(intr.await_reduce, vec![handle], "total");
    let result = if matches!(b.module().type_data(pr.reduce_ty), TypeData::I32) {
        let i32t = b.module().i32_ty();
        b.trunc(total, i32t, "total.narrow")
    } else {
        total
    };
    b.br(cont);
    drop(b);

    // The marker's value stood in for the total; swap it everywhere --
    // later-created construct bodies may reference it too.
    let marker_value = Value::Inst(pr.marker);
    let funcs: Vec<_> = m.funcs().collect();
    for f in funcs {
        if !m.func(f).is_extern {
            m.replace_uses_in_func(f, marker_value, result);
        }
    }
    m.erase_inst(pr.marker);

    unpack_captures(m, &pr.region, &captures, cap_ty);
    m.erase_inst(pr.region.args_insertion);
    m.erase_inst(pr.region.insertion);
    Ok(())
}
