//! Parallel-for lowering.
//!
//! At the caller's marker, the construct becomes:
//!
//! ```text
//!   ; marker block (pre)
//!   %captures = alloca S ; store each captured value
//!   %n     = sub %end, %start
//!   %synch = call @weft_create_synch(%n)
//!   %i.slot = alloca i32 ; store %start
//!   br ^head
//! head:
//!   %i = load %i.slot
//!   condbr (icmp slt %i, %end), ^queue, ^await
//! queue:
//!   call @weft_queue_func(%synch, %captures, @body, %i, 1)
//!   store (add %i, 1), %i.slot ; br ^head
//! await:
//!   call @weft_await_synch(%synch)
//!   br ^cont            ; cont = everything after the marker
//! ```
//!
//! and the body prologue gains the capture unpacking before its
//! args-insertion anchor. The head re-checks the bound before the first
//! queue, so an empty range queues nothing and the await returns on the
//! latch's initial `+1`.

use weft_ir::{BinOp, Builder, Cond, Module, Value};

use super::{capture_struct, collect_captures, spill_captures, unpack_captures};
use crate::construct::ParallelFor;
use crate::error::LowerError;
use crate::intrinsics::{Intrinsics, ITER_PRIORITY};

pub(crate) fn lower(m: &mut Module, intr: &Intrinsics, pf: &ParallelFor) -> Result<(), LowerError> {
    let (marker_block, _) = m
        .position_in_block(pf.marker)
        .ok_or_else(|| LowerError::MarkerNotFound {
            construct: pf.name.clone(),
        })?;

    // Capture discovery and the caller-side spill, all before the marker
    // (store-before-queue: bodies observe the values held here).
    let captures = collect_captures(m, pf.region.body);
    let cap_ty = capture_struct(m, &captures);

    let mut b = Builder::before(m, pf.marker);
    let cap_raw = spill_captures(&mut b, &captures, cap_ty);
    let n = b.binary(BinOp::Sub, pf.end, pf.start, "n");
    let synch = b.call(intr.create_synch, vec![n], "synch");
    let i32t = b.module().i32_ty();
    let idx_slot = b.alloca(i32t, "i.slot");
    b.store(pf.start, idx_slot);
    let bp = b.module().byte_ptr_ty();
    let body_fn = b.ptr_cast(Value::Func(pf.region.body), bp, "body.fn");
    drop(b);

    // Control flow: new blocks, then split the marker block so the
    // original post-marker code becomes the continuation.
    let head = m.append_block(pf.caller, "parfor.head");
    let queue = m.append_block(pf.caller, "parfor.queue");
    let await_bb = m.append_block(pf.caller, "parfor.await");
    let cont = m.split_block_after(pf.marker, "parfor.cont");
    m.erase_inst(pf.marker);

    let mut b = Builder::at_end(m, marker_block);
    b.br(head);

    b.position_at_end(head);
    let i = b.load(idx_slot, "i");
    let more = b.icmp(Cond::Slt, i, pf.end, "more");
    b.cond_br(more, queue, await_bb);

    b.position_at_end(queue);
    let i = b.load(idx_slot, "i");
    let pri = b.module().const_i32(ITER_PRIORITY);
    b.call(intr.queue_func, vec![synch, cap_raw, body_fn, i, pri], "");
    let one = b.module().const_i32(1);
    let next = b.binary(BinOp::Add, i, one, "i.next");
    b.store(next, idx_slot);
    b.br(head);

    b.position_at_end(await_bb);
    b.call(intr.await_synch, vec![synch], "");
    b.br(cont);
    drop(b);

    // Body side: plumb the captures through, then drop the anchors.
    unpack_captures(m, &pf.region, &captures, cap_ty);
    m.erase_inst(pf.region.args_insertion);
    m.erase_inst(pf.region.insertion);
    Ok(())
}
