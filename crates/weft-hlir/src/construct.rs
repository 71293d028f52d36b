//! Construct records and body/wrapper synthesis.
//!
//! Each construct kind is an explicit struct behind a tagged enum; the
//! attributes an emitter needs (body, insertion points, the index
//! pointer, the reduce slot) are plain fields. Construct creation
//! synthesizes the stereotyped parts of the IR up front -- the body
//! prologue that unpacks the iteration triple and the epilogue that
//! reports completion -- leaving two anchor points for the emitter's
//! user code and for the capture unpacking the lowering pass adds later.

use weft_ir::{Builder, FuncRef, InstRef, Module, TypeData, TypeId, Value};

use crate::intrinsics::Intrinsics;

/// Handle to a construct within its [`crate::HlirModule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstructRef(pub(crate) usize);

/// Combine operator for parallel reductions. Discriminant codes are ABI:
/// they are emitted as `i32` constants into calls of
/// `weft_create_reduce` and must match the runtime's operator table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Add,
    Mul,
    Min,
    Max,
    And,
    Or,
    Xor,
}

impl ReduceOp {
    /// The wire code passed to `weft_create_reduce`.
    pub fn code(self) -> i32 {
        match self {
            ReduceOp::Add => 0,
            ReduceOp::Mul => 1,
            ReduceOp::Min => 2,
            ReduceOp::Max => 3,
            ReduceOp::And => 4,
            ReduceOp::Or => 5,
            ReduceOp::Xor => 6,
        }
    }
}

/// Identity element of `op` over the given reduce type; initializes both
/// the body-local accumulator slot and the runtime-side accumulator.
pub(crate) fn reduce_identity(op: ReduceOp, ty: &TypeData) -> i64 {
    let narrow = matches!(ty, TypeData::I32);
    match op {
        ReduceOp::Add | ReduceOp::Or | ReduceOp::Xor => 0,
        ReduceOp::Mul => 1,
        ReduceOp::And => -1,
        ReduceOp::Min => {
            if narrow {
                i32::MAX as i64
            } else {
                i64::MAX
            }
        }
        ReduceOp::Max => {
            if narrow {
                i32::MIN as i64
            } else {
                i64::MIN
            }
        }
    }
}

// ── Construct records ─────────────────────────────────────────────────

pub(crate) enum Construct {
    ParallelFor(ParallelFor),
    ParallelReduce(ParallelReduce),
    Task(Task),
}

impl Construct {
    pub fn name(&self) -> &str {
        match self {
            Construct::ParallelFor(c) => &c.name,
            Construct::ParallelReduce(c) => &c.name,
            Construct::Task(c) => &c.name,
        }
    }
}

/// The synthesized body shared by parallel-for and parallel-reduce: its
/// prologue values and the two anchor points.
pub(crate) struct RegionBody {
    pub body: FuncRef,
    /// Capture unpacking is inserted immediately before this anchor.
    pub args_insertion: InstRef,
    /// The emitter writes user body IR immediately before this anchor.
    pub insertion: InstRef,
    /// Pointer to the iteration index inside the triple (`i32*`).
    pub index_ptr: Value,
    /// The opaque captured-args pointer loaded from the triple (`i8*`).
    pub captured_args: Value,
}

pub(crate) struct ParallelFor {
    pub name: String,
    pub caller: FuncRef,
    /// Caller-side placeholder the queue/await sequence replaces.
    pub marker: InstRef,
    pub region: RegionBody,
    pub start: Value,
    pub end: Value,
}

pub(crate) struct ParallelReduce {
    pub name: String,
    pub caller: FuncRef,
    /// Caller-side placeholder; its i64 result stands in for the total.
    pub marker: InstRef,
    pub region: RegionBody,
    pub start: Value,
    pub end: Value,
    /// Accumulator slot in the body entry (`reduce_ty*`), exposed to the
    /// emitter.
    pub reduce_var: Value,
    pub reduce_ty: TypeId,
    pub op: ReduceOp,
}

pub(crate) struct Task {
    pub name: String,
    /// The user function being wrapped.
    pub func: FuncRef,
    /// The synthesized wrapper the runtime dispatches to.
    pub wrapper: FuncRef,
    /// `{ future, depth, [ret,] args... }`.
    pub arg_struct: TypeId,
    /// Field index of the return slot, `None` for void tasks.
    pub ret_field: Option<u32>,
    /// Field index of the first call argument.
    pub args_base: u32,
}

// ── Body synthesis ────────────────────────────────────────────────────

/// Build the stereotyped region body:
///
/// ```text
/// fn @<name>(i8* %arg0) -> void {
/// entry:
///   %triple = ptrcast %arg0 to {i8*, i32, i8*}*
///   %index  = fieldptr %triple, 1          ; exposed induction pointer
///   %argsp  = fieldptr %triple, 2
///   %args   = load %argsp                  ; opaque captured-args
///   [reduce only: %acc = alloca RT; store identity, %acc]
///   call @hlir.anchor(id)                  ; capture unpacking goes here
///   call @hlir.anchor(id)                  ; user body IR goes here
///   <epilogue>
///   ret
/// }
/// ```
///
/// The epilogue is `weft_finish_func(%arg0)` for parallel-for, or a load
/// of the accumulator fed to `weft_reduce_finish(%arg0, partial)` for
/// parallel-reduce (returned as the second tuple element).
pub(crate) fn synth_region_body(
    m: &mut Module,
    intr: &Intrinsics,
    name: &str,
    id: u32,
    reduce: Option<(TypeId, ReduceOp)>,
) -> (RegionBody, Option<Value>) {
    let void = m.void_ty();
    let bp = m.byte_ptr_ty();
    let body = m.define_func(name, vec![bp], void);
    let entry = m.append_block(body, "entry");
    let triple_ptr_ty = m.ptr_ty(intr.triple_ty);

    let mut b = Builder::at_end(m, entry);
    let param = Value::Param(body, 0);
    let triple = b.ptr_cast(param, triple_ptr_ty, "triple");
    let index_ptr = b.field_ptr(triple, 1, "index");
    let argsp = b.field_ptr(triple, 2, "argsp");
    let captured_args = b.load(argsp, "args");

    let reduce_var = reduce.map(|(ty, op)| {
        let slot = b.alloca(ty, "acc");
        let data = b.module().type_data(ty).clone();
        let init = Value::ConstInt(ty, reduce_identity(op, &data));
        b.store(init, slot);
        slot
    });

    let id_const = b.module().const_i32(id as i32);
    let args_insertion = b
        .call(intr.anchor, vec![id_const], "")
        .as_inst()
        .expect("calls are instructions");
    let insertion = b
        .call(intr.anchor, vec![id_const], "")
        .as_inst()
        .expect("calls are instructions");

    match reduce_var {
        None => {
            b.call(intr.finish_func, vec![param], "");
        }
        Some(slot) => {
            let partial = b.load(slot, "partial");
            let i64t = b.module().i64_ty();
            let partial = if b.module().value_ty(partial) == i64t {
                partial
            } else {
                b.sext(partial, i64t, "partial.wide")
            };
            b.call(intr.reduce_finish, vec![param, partial], "");
        }
    }
    b.ret(None);

    (
        RegionBody {
            body,
            args_insertion,
            insertion,
            index_ptr,
            captured_args,
        },
        reduce_var,
    )
}

/// Build a task's wrapper function:
///
/// ```text
/// fn @__task_wrapper_<f>(i8* %arg0) -> void {
/// entry:
///   %a  = ptrcast %arg0 to S*
///   %pN = load (fieldptr %a, base+N)       ; each call argument
///   %r  = call @f(%p0, ...)
///   store %r, (fieldptr %a, 2)             ; unless f returns void
///   call @weft_task_release_future(%arg0)
///   ret
/// }
/// ```
pub(crate) fn synth_task_wrapper(
    m: &mut Module,
    intr: &Intrinsics,
    func: FuncRef,
) -> (FuncRef, TypeId, Option<u32>, u32) {
    let void = m.void_ty();
    let i32t = m.i32_ty();
    let bp = m.byte_ptr_ty();

    let params = m.func(func).params.clone();
    let ret = m.func(func).ret;
    let has_ret = ret != void;

    // { future, depth, [ret,] args... }
    let mut fields = vec![bp, i32t];
    if has_ret {
        fields.push(ret);
    }
    let args_base = fields.len() as u32;
    fields.extend_from_slice(&params);
    let arg_struct = m.struct_ty(fields);
    let arg_struct_ptr = m.ptr_ty(arg_struct);

    let fname = m.func(func).name.clone();
    let wrapper = m.define_func(format!("__task_wrapper_{fname}"), vec![bp], void);
    let entry = m.append_block(wrapper, "entry");

    let mut b = Builder::at_end(m, entry);
    let param = Value::Param(wrapper, 0);
    let a = b.ptr_cast(param, arg_struct_ptr, "task.args");
    let mut call_args = Vec::with_capacity(params.len());
    for j in 0..params.len() as u32 {
        let fp = b.field_ptr(a, args_base + j, "");
        call_args.push(b.load(fp, &format!("p{j}")));
    }
    let r = b.call(func, call_args, if has_ret { "r" } else { "" });
    if has_ret {
        let rp = b.field_ptr(a, 2, "");
        b.store(r, rp);
    }
    b.call(intr.task_release_future, vec![param], "");
    b.ret(None);

    (wrapper, arg_struct, has_ret.then_some(2), args_base)
}
