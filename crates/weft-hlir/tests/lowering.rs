//! Structural tests for the lowering passes: emit constructs through the
//! HLIR API, lower, and assert the shape of the rewritten IR.

use weft_hlir::{HlirModule, ReduceOp};
use weft_ir::{verify, BinOp, Builder, FuncRef, InstKind, Module, Value};

/// Names of directly-called functions in `func`, in block order.
fn called_names(m: &Module, func: FuncRef) -> Vec<String> {
    m.func_insts(func)
        .into_iter()
        .filter_map(|i| match &m.inst(i).kind {
            InstKind::Call {
                callee: Value::Func(f),
                ..
            } => Some(m.func(*f).name.clone()),
            _ => None,
        })
        .collect()
}

fn count_foreign_operands(m: &Module, func: FuncRef) -> usize {
    let mut n = 0;
    for i in m.func_insts(func) {
        m.inst(i).kind.for_each_value(|v| {
            if let Some(def) = m.defining_func(v) {
                if def != func {
                    n += 1;
                }
            }
        });
    }
    n
}

/// Emit a fill-style parallel-for: `for i in [0, n): base[i] = 2 * i`.
/// The body references the caller's `base` parameter directly, which is
/// exactly the capture the pass must plumb through.
fn build_fill() -> (HlirModule, FuncRef) {
    let mut hm = HlirModule::new("fill");
    let m = hm.ir_mut();
    let i32t = m.i32_ty();
    let i64t = m.i64_ty();
    let void = m.void_ty();
    let i64p = m.ptr_ty(i64t);

    let caller = m.define_func("fill", vec![i64p, i32t], void);
    let entry = m.append_block(caller, "entry");

    let start = m.const_i32(0);
    let end = Value::Param(caller, 1);
    let c = hm.create_parallel_for(entry, start, end);

    // Body: *(base + 8 * i) = 2 * i, with `base` defined in the caller.
    let insertion = hm.insertion(c).expect("parallel-for has a body anchor");
    let index_ptr = hm.index_ptr(c).expect("parallel-for exposes the index");
    let mut b = Builder::before(hm.ir_mut(), insertion);
    let i = b.load(index_ptr, "i");
    let i_wide = b.sext(i, i64t, "i.wide");
    let eight = b.module().const_i64(8);
    let off = b.binary(BinOp::Mul, i_wide, eight, "off");
    let slot = b.ptr_add(Value::Param(caller, 0), off, "slot");
    let two = b.module().const_i64(2);
    let v = b.binary(BinOp::Mul, i_wide, two, "v");
    b.store(v, slot);
    drop(b);

    // Caller code after the construct.
    let mut b = Builder::at_end(hm.ir_mut(), entry);
    b.ret(None);

    (hm, caller)
}

#[test]
fn parallel_for_caller_shape() {
    let (hm, caller) = build_fill();
    let m = hm.lower_to_ir().expect("lowering succeeds");

    // The caller calls exactly the facade, in protocol order.
    assert_eq!(
        called_names(&m, caller),
        vec!["weft_create_synch", "weft_queue_func", "weft_await_synch"]
    );
    // Five blocks: pre, head, queue, await, cont.
    assert_eq!(m.func(caller).blocks.len(), 5);
}

#[test]
fn parallel_for_body_is_self_contained() {
    let (hm, _) = build_fill();
    let m = hm.lower_to_ir().expect("lowering succeeds");
    let body = m.func_by_name("__parfor_body_0").expect("body exists");

    // Capture unpacking rewrote every foreign reference; the module as a
    // whole verifies.
    assert_eq!(count_foreign_operands(&m, body), 0);
    assert!(verify(&m).is_ok());
    assert!(called_names(&m, body).contains(&"weft_finish_func".to_string()));
}

#[test]
fn markers_and_anchors_are_erased() {
    let (hm, _) = build_fill();
    let m = hm.lower_to_ir().expect("lowering succeeds");
    for f in m.funcs().collect::<Vec<_>>() {
        for name in called_names(&m, f) {
            assert!(
                !name.starts_with("hlir."),
                "placeholder call survived lowering: {name}"
            );
        }
    }
}

#[test]
fn capture_set_preserves_first_encounter_order() {
    // Two captures used in a known order; the spilled struct must match.
    let mut hm = HlirModule::new("two_caps");
    let m = hm.ir_mut();
    let i32t = m.i32_ty();
    let i64t = m.i64_ty();
    let void = m.void_ty();
    let caller = m.define_func("caller", vec![i64t, i32t], void);
    let entry = m.append_block(caller, "entry");

    let start = m.const_i32(0);
    let end = m.const_i32(4);
    let c = hm.create_parallel_for(entry, start, end);

    let insertion = hm.insertion(c).unwrap();
    let mut b = Builder::before(hm.ir_mut(), insertion);
    // First use param1 (i32), then param0 (i64).
    let p1 = Value::Param(caller, 1);
    let p0 = Value::Param(caller, 0);
    let one = b.module().const_i32(1);
    let t = b.binary(BinOp::Add, p1, one, "t");
    let t_wide = b.sext(t, i64t, "t.wide");
    let sum = b.binary(BinOp::Add, t_wide, p0, "sum");
    let sink = b.alloca(i64t, "sink");
    b.store(sum, sink);
    drop(b);
    let mut b = Builder::at_end(hm.ir_mut(), entry);
    b.ret(None);

    let m = hm.lower_to_ir().expect("lowering succeeds");
    let caller = m.func_by_name("caller").unwrap();

    // The captured-args alloca holds {i32, i64}: p1 first, p0 second.
    let cap_alloca = m
        .func_insts(caller)
        .into_iter()
        .find_map(|i| match m.inst(i).kind {
            InstKind::Alloca { ty } => m.struct_fields(ty).map(|f| f.to_vec()),
            _ => None,
        })
        .expect("captured-args alloca");
    assert_eq!(cap_alloca, vec![m.i32_ty(), m.i64_ty()]);
}

#[test]
fn task_rewrites_call_and_awaits_at_first_use() {
    let mut hm = HlirModule::new("task");
    let m = hm.ir_mut();
    let i64t = m.i64_ty();

    // double(x) = x * 2
    let double = m.define_func("double", vec![i64t], i64t);
    let de = m.append_block(double, "entry");
    let mut b = Builder::at_end(m, de);
    let two = b.module().const_i64(2);
    let r = b.binary(BinOp::Mul, Value::Param(double, 0), two, "r");
    b.ret(Some(r));

    // caller(x) = double(x) + 1
    let caller = m.define_func("caller", vec![i64t], i64t);
    let ce = m.append_block(caller, "entry");
    let mut b = Builder::at_end(m, ce);
    let call = b.call(double, vec![Value::Param(caller, 0)], "call");
    let one = b.module().const_i64(1);
    let out = b.binary(BinOp::Add, call, one, "out");
    b.ret(Some(out));

    hm.create_task(double).expect("task on a defined function");
    let m = hm.lower_to_ir().expect("lowering succeeds");
    let caller = m.func_by_name("caller").unwrap();

    // Launch, then force-at-first-use, then retire -- in program order.
    assert_eq!(
        called_names(&m, caller),
        vec![
            "weft_alloc",
            "weft_task_queue",
            "weft_task_await_future",
            "weft_task_retire"
        ]
    );
    // The original direct call is gone.
    assert!(!called_names(&m, caller).contains(&"double".to_string()));
    // The wrapper still calls the user function directly.
    let wrapper = m.func_by_name("__task_wrapper_double").unwrap();
    assert!(called_names(&m, wrapper).contains(&"double".to_string()));
    assert!(called_names(&m, wrapper).contains(&"weft_task_release_future".to_string()));
}

#[test]
fn unused_task_result_is_never_awaited() {
    let mut hm = HlirModule::new("fire_and_forget");
    let m = hm.ir_mut();
    let i64t = m.i64_ty();
    let void = m.void_ty();

    let work = m.define_func("work", vec![i64t], i64t);
    let we = m.append_block(work, "entry");
    let mut b = Builder::at_end(m, we);
    b.ret(Some(Value::Param(work, 0)));

    let caller = m.define_func("caller", vec![], void);
    let ce = m.append_block(caller, "entry");
    let mut b = Builder::at_end(m, ce);
    let arg = b.module().const_i64(9);
    b.call(work, vec![arg], "ignored");
    b.ret(None);

    hm.create_task(work).expect("task on a defined function");
    let m = hm.lower_to_ir().expect("lowering succeeds");
    let caller = m.func_by_name("caller").unwrap();

    let names = called_names(&m, caller);
    assert!(names.contains(&"weft_task_queue".to_string()));
    assert!(!names.contains(&"weft_task_await_future".to_string()));
    assert!(!names.contains(&"weft_task_retire".to_string()));
}

#[test]
fn task_result_used_only_in_later_region_body_is_awaited_at_marker() {
    // The task is created (and therefore lowered) before the region, and
    // its result is consumed only inside the region's body. The await
    // must anchor at the region's marker so the capture spill reads the
    // forced value, not a dangling call result.
    let mut hm = HlirModule::new("task_feeds_region");
    let m = hm.ir_mut();
    let i32t = m.i32_ty();
    let i64t = m.i64_ty();
    let void = m.void_ty();
    let i64p = m.ptr_ty(i64t);

    let work = m.define_func("work", vec![i64t], i64t);
    let we = m.append_block(work, "entry");
    let mut b = Builder::at_end(m, we);
    let three = b.module().const_i64(3);
    let r = b.binary(BinOp::Mul, Value::Param(work, 0), three, "r");
    b.ret(Some(r));

    let caller = m.define_func("caller", vec![i64p, i32t], void);
    let ce = m.append_block(caller, "entry");
    let mut b = Builder::at_end(m, ce);
    let seven = b.module().const_i64(7);
    let call = b.call(work, vec![seven], "call");
    drop(b);

    hm.create_task(work).expect("task on a defined function");
    let start = hm.ir().const_i32(0);
    let c = hm.create_parallel_for(ce, start, Value::Param(caller, 1));

    // Body: base[i] = call -- the only use of the task's result.
    let insertion = hm.insertion(c).unwrap();
    let index_ptr = hm.index_ptr(c).unwrap();
    let mut b = Builder::before(hm.ir_mut(), insertion);
    let i = b.load(index_ptr, "i");
    let i_wide = b.sext(i, i64t, "i.wide");
    let eight = b.module().const_i64(8);
    let off = b.binary(BinOp::Mul, i_wide, eight, "off");
    let slot = b.ptr_add(Value::Param(caller, 0), off, "slot");
    b.store(call, slot);
    drop(b);
    let mut b = Builder::at_end(hm.ir_mut(), ce);
    b.ret(None);

    let m = hm.lower_to_ir().expect("lowering succeeds");
    let caller = m.func_by_name("caller").unwrap();

    // The future is forced (and retired) before the region is queued.
    assert_eq!(
        called_names(&m, caller),
        vec![
            "weft_alloc",
            "weft_task_queue",
            "weft_task_await_future",
            "weft_task_retire",
            "weft_create_synch",
            "weft_queue_func",
            "weft_await_synch",
        ]
    );
    // The region body is self-contained and the module verifies: no
    // dangling reference to the erased call survives anywhere.
    let body = m.func_by_name("__parfor_body_1").expect("region body");
    assert_eq!(count_foreign_operands(&m, body), 0);
    assert!(verify(&m).is_ok());
}

#[test]
fn reduce_caller_shape_and_result_rewrite() {
    let mut hm = HlirModule::new("reduce");
    let m = hm.ir_mut();
    let i64t = m.i64_ty();

    let caller = m.define_func("sum_range", vec![], i64t);
    let entry = m.append_block(caller, "entry");
    let start = m.const_i32(0);
    let end = m.const_i32(10);
    let c = hm
        .create_parallel_reduce(entry, start, end, i64t, ReduceOp::Add)
        .expect("i64 add reduce");

    // Body: acc += i
    let insertion = hm.insertion(c).unwrap();
    let index_ptr = hm.index_ptr(c).unwrap();
    let acc = hm.reduce_var(c).unwrap();
    let mut b = Builder::before(hm.ir_mut(), insertion);
    let i = b.load(index_ptr, "i");
    let i_wide = b.sext(i, i64t, "i.wide");
    let cur = b.load(acc, "cur");
    let next = b.binary(BinOp::Add, cur, i_wide, "next");
    b.store(next, acc);
    drop(b);

    // Caller returns the total: a use of the construct's result value.
    let total = hm.reduce_result(c).unwrap();
    let mut b = Builder::at_end(hm.ir_mut(), entry);
    b.ret(Some(total));

    let m = hm.lower_to_ir().expect("lowering succeeds");
    let caller = m.func_by_name("sum_range").unwrap();
    assert_eq!(
        called_names(&m, caller),
        vec!["weft_create_reduce", "weft_queue_func", "weft_await_reduce"]
    );

    let body = m.func_by_name("__reduce_body_0").unwrap();
    assert!(called_names(&m, body).contains(&"weft_reduce_finish".to_string()));
    assert!(verify(&m).is_ok());
}

#[test]
fn reduce_op_codes_match_runtime() {
    // The operator codes are ABI with weft-rt; keep the tables aligned.
    for (hlir, rt) in [
        (ReduceOp::Add, weft_rt::ReduceOp::Add),
        (ReduceOp::Mul, weft_rt::ReduceOp::Mul),
        (ReduceOp::Min, weft_rt::ReduceOp::Min),
        (ReduceOp::Max, weft_rt::ReduceOp::Max),
        (ReduceOp::And, weft_rt::ReduceOp::And),
        (ReduceOp::Or, weft_rt::ReduceOp::Or),
        (ReduceOp::Xor, weft_rt::ReduceOp::Xor),
    ] {
        assert_eq!(hlir.code(), rt as i32);
    }
    // Queue priorities are part of the same contract.
    assert_eq!(weft_hlir::ITER_PRIORITY, weft_rt::ITER_PRIORITY);
    assert_eq!(weft_hlir::TASK_PRIORITY, weft_rt::TASK_PRIORITY);
}

#[test]
fn empty_range_still_lowers_to_guarded_loop() {
    // [5, 5): the head check fails immediately, nothing is queued, and
    // the await rides the latch's initial +1.
    let mut hm = HlirModule::new("empty");
    let m = hm.ir_mut();
    let void = m.void_ty();
    let caller = m.define_func("noop", vec![], void);
    let entry = m.append_block(caller, "entry");
    let start = m.const_i32(5);
    let end = m.const_i32(5);
    let c = hm.create_parallel_for(entry, start, end);
    let _ = hm.insertion(c);
    let mut b = Builder::at_end(hm.ir_mut(), entry);
    b.ret(None);

    let m = hm.lower_to_ir().expect("lowering succeeds");
    assert!(verify(&m).is_ok());
    let caller = m.func_by_name("noop").unwrap();
    assert!(called_names(&m, caller).contains(&"weft_await_synch".to_string()));
}
