//! Construct lowering passes.
//!
//! One pass per construct kind, plus the capture machinery they share.
//! A construct body fresh from the emitter references values defined in
//! the caller; lowering marshals those through a per-construct struct:
//! the caller spills each captured value into a stack slot, and the body
//! prologue reloads them through the opaque pointer the runtime carries
//! in the iteration triple.

pub(crate) mod parallel_for;
pub(crate) mod reduce;
pub(crate) mod task;

use rustc_hash::FxHashSet;

use weft_ir::{Builder, FuncRef, Module, TypeId, Value};

use crate::construct::RegionBody;

/// Discover the capture set of `body`: every operand defined in a
/// different function, deduplicated, in first-encounter order (the order
/// fixes the captured-args struct layout).
pub(crate) fn collect_captures(m: &Module, body: FuncRef) -> Vec<Value> {
    let mut seen = FxHashSet::default();
    let mut captures = Vec::new();
    for inst in m.func_insts(body) {
        m.inst(inst).kind.for_each_value(|v| {
            if let Some(def) = m.defining_func(v) {
                if def != body && seen.insert(v) {
                    captures.push(v);
                }
            }
        });
    }
    captures
}

/// The captured-args struct type for a capture set: one field per value,
/// in capture order.
pub(crate) fn capture_struct(m: &mut Module, captures: &[Value]) -> TypeId {
    let fields: Vec<TypeId> = captures.iter().map(|&v| m.value_ty(v)).collect();
    m.struct_ty(fields)
}

/// Caller side: allocate one captured-args struct and store every
/// captured value into its slot. Returns the struct as an opaque `i8*`.
/// The builder must be positioned before the construct's marker, so the
/// stores happen before anything is queued.
pub(crate) fn spill_captures(b: &mut Builder, captures: &[Value], cap_ty: TypeId) -> Value {
    let slot = b.alloca(cap_ty, "captures");
    for (i, &v) in captures.iter().enumerate() {
        let fp = b.field_ptr(slot, i as u32, "");
        b.store(v, fp);
    }
    let bp = b.module().byte_ptr_ty();
    b.ptr_cast(slot, bp, "captures.raw")
}

/// Body side: before the args-insertion anchor, cast the opaque
/// captured-args pointer to the struct type, reload every captured
/// value, and rewrite its uses *inside the body only* to the reloaded
/// copy. Uses in the caller (or anywhere else) are untouched.
pub(crate) fn unpack_captures(
    m: &mut Module,
    region: &RegionBody,
    captures: &[Value],
    cap_ty: TypeId,
) {
    let mut b = Builder::before(m, region.args_insertion);
    let cap_ptr_ty = b.module().ptr_ty(cap_ty);
    let caps = b.ptr_cast(region.captured_args, cap_ptr_ty, "captures");
    let mut reloaded = Vec::with_capacity(captures.len());
    for (i, &v) in captures.iter().enumerate() {
        let fp = b.field_ptr(caps, i as u32, "");
        reloaded.push((v, b.load(fp, &format!("cap{i}"))));
    }
    drop(b);
    for (old, new) in reloaded {
        m.replace_uses_in_func(region.body, old, new);
    }
}
