//! Word-level abstract machine for executing IR functions.
//!
//! The evaluator plays the role compiled native code plays in a full
//! back-end: it runs function bodies against *real* memory (allocas are
//! heap buffers, loads and stores go through raw pointers) and dispatches
//! calls to extern-declared functions through a host trait. A host bridges
//! the runtime facade symbols to their `extern "C"` implementations, which
//! is how end-to-end tests drive the real thread pool from lowered IR.
//!
//! Values are 64-bit machine words. Integers are kept in canonical
//! sign-extended form; pointers are addresses; `f64` is supported as a
//! storage type (bit pattern in a word). The machine assumes a 64-bit
//! platform, like the runtime ABI it exists to exercise.
//!
//! Function addresses are *tokens*, not callable machine pointers: a
//! tagged word a host can map back to a [`FuncRef`] when lowered IR hands
//! a body function to the runtime queue. Tokens live in the upper address
//! space no user allocation can occupy.
//!
//! The evaluator expects verified IR (see [`crate::verify`]); feeding it a
//! malformed module panics.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::module::{
    BinOp, Cond, FuncRef, InstKind, InstRef, Module, TypeData, TypeId, Value,
};

/// Tag occupying the top 16 bits of a function-address token.
const FUNC_TOKEN_TAG: u64 = 0xF17E_0000_0000_0000;

/// Host interface for calls that leave the module: every call to an
/// extern-declared function is routed here by symbol name.
pub trait ExternHost: Send + Sync {
    fn call_extern(&self, name: &str, args: &[u64]) -> u64;
}

/// An executable view over a module. Cheap to clone; safe to use from
/// several threads at once (the module is immutable while evaluating).
#[derive(Clone)]
pub struct Evaluator {
    module: Arc<Module>,
    host: Arc<dyn ExternHost>,
}

/// One stack slot: an owned, aligned heap buffer.
struct AllocaBuf {
    ptr: *mut u8,
    layout: std::alloc::Layout,
}

impl Drop for AllocaBuf {
    fn drop(&mut self) {
        // Safety: allocated with this exact layout in `Frame::alloca`.
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

struct Frame {
    regs: FxHashMap<InstRef, u64>,
    params: Vec<u64>,
    slots: Vec<AllocaBuf>,
}

impl Frame {
    fn alloca(&mut self, size: u64, align: u64) -> u64 {
        let layout = std::alloc::Layout::from_size_align(size.max(1) as usize, align.max(1) as usize)
            .expect("alloca layout");
        // Safety: non-zero size enforced above; freed by AllocaBuf::drop.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "alloca allocation failed");
        self.slots.push(AllocaBuf { ptr, layout });
        ptr as usize as u64
    }
}

impl Evaluator {
    pub fn new(module: Arc<Module>, host: Arc<dyn ExternHost>) -> Self {
        Evaluator { module, host }
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// The token standing in for `func`'s address.
    pub fn func_token(func: FuncRef) -> u64 {
        FUNC_TOKEN_TAG | func.index() as u64
    }

    /// Recover a function from a token previously produced by
    /// [`Evaluator::func_token`].
    pub fn decode_func_token(token: u64) -> Option<FuncRef> {
        if token & 0xFFFF_0000_0000_0000 == FUNC_TOKEN_TAG {
            Some(FuncRef::from_index((token as u32) as usize))
        } else {
            None
        }
    }

    /// Call a function with machine-word arguments; returns its result
    /// word (0 for void).
    pub fn call(&self, func: FuncRef, args: &[u64]) -> u64 {
        let f = self.module.func(func);
        if f.is_extern {
            return self.host.call_extern(&f.name, args);
        }
        assert_eq!(
            args.len(),
            f.params.len(),
            "argument count mismatch calling @{}",
            f.name
        );

        let mut frame = Frame {
            regs: FxHashMap::default(),
            params: args.to_vec(),
            slots: Vec::new(),
        };

        let mut block = *f.blocks.first().expect("cannot evaluate extern or empty function");
        'blocks: loop {
            let insts = self.module.block(block).insts.clone();
            for inst_ref in insts {
                let inst = self.module.inst(inst_ref);
                match &inst.kind {
                    InstKind::Alloca { ty } => {
                        let l = self.module.layout_of(*ty);
                        let addr = frame.alloca(l.size, l.align);
                        frame.regs.insert(inst_ref, addr);
                    }
                    InstKind::Load { ptr } => {
                        let addr = self.value(&frame, *ptr);
                        let word = self.read_mem(addr, inst.ty);
                        frame.regs.insert(inst_ref, word);
                    }
                    InstKind::Store { value, ptr } => {
                        let word = self.value(&frame, *value);
                        let addr = self.value(&frame, *ptr);
                        let ty = self.module.value_ty(*value);
                        self.write_mem(addr, ty, word);
                    }
                    InstKind::FieldPtr { base, field } => {
                        let addr = self.value(&frame, *base);
                        let strukt = self
                            .module
                            .pointee(self.module.value_ty(*base))
                            .expect("fieldptr through non-pointer");
                        let off = self.module.field_offset(strukt, *field);
                        frame.regs.insert(inst_ref, addr + off);
                    }
                    InstKind::PtrAdd { base, offset } => {
                        let b = self.value(&frame, *base);
                        let o = self.value(&frame, *offset);
                        frame.regs.insert(inst_ref, b.wrapping_add(o));
                    }
                    InstKind::PtrCast { value } => {
                        let word = self.value(&frame, *value);
                        frame.regs.insert(inst_ref, word);
                    }
                    InstKind::Binary { op, lhs, rhs } => {
                        let a = self.value(&frame, *lhs) as i64;
                        let b = self.value(&frame, *rhs) as i64;
                        let r = match op {
                            BinOp::Add => a.wrapping_add(b),
                            BinOp::Sub => a.wrapping_sub(b),
                            BinOp::Mul => a.wrapping_mul(b),
                            BinOp::And => a & b,
                            BinOp::Or => a | b,
                            BinOp::Xor => a ^ b,
                        };
                        frame.regs.insert(inst_ref, canon(self.module.type_data(inst.ty), r as u64));
                    }
                    InstKind::Icmp { cond, lhs, rhs } => {
                        let a = self.value(&frame, *lhs) as i64;
                        let b = self.value(&frame, *rhs) as i64;
                        let r = match cond {
                            Cond::Eq => a == b,
                            Cond::Ne => a != b,
                            Cond::Slt => a < b,
                            Cond::Sle => a <= b,
                            Cond::Sgt => a > b,
                            Cond::Sge => a >= b,
                        };
                        frame.regs.insert(inst_ref, r as u64);
                    }
                    InstKind::Sext { value } | InstKind::Trunc { value } => {
                        let word = self.value(&frame, *value);
                        frame
                            .regs
                            .insert(inst_ref, canon(self.module.type_data(inst.ty), word));
                    }
                    InstKind::Call { callee, args } => {
                        let target = match callee {
                            Value::Func(f) => *f,
                            other => {
                                let word = self.value(&frame, *other);
                                Self::decode_func_token(word)
                                    .expect("indirect call through a non-function word")
                            }
                        };
                        let words: Vec<u64> =
                            args.iter().map(|&a| self.value(&frame, a)).collect();
                        let r = self.call(target, &words);
                        if inst.ty != self.module.void_ty() {
                            frame.regs.insert(inst_ref, r);
                        }
                    }
                    InstKind::Br { dest } => {
                        block = *dest;
                        continue 'blocks;
                    }
                    InstKind::CondBr {
                        cond,
                        then_dest,
                        else_dest,
                    } => {
                        let c = self.value(&frame, *cond);
                        block = if c != 0 { *then_dest } else { *else_dest };
                        continue 'blocks;
                    }
                    InstKind::Ret { value } => {
                        return value.map(|v| self.value(&frame, v)).unwrap_or(0);
                    }
                }
            }
            panic!("fell off the end of an unterminated block");
        }
    }

    fn value(&self, frame: &Frame, v: Value) -> u64 {
        match v {
            Value::Inst(i) => *frame
                .regs
                .get(&i)
                .expect("use of a value not defined in this frame (unverified IR?)"),
            Value::Param(_, n) => frame.params[n as usize],
            Value::Func(f) => Self::func_token(f),
            Value::ConstInt(ty, v) => canon(self.module.type_data(ty), v as u64),
            Value::ConstNull(_) => 0,
        }
    }

    fn read_mem(&self, addr: u64, ty: TypeId) -> u64 {
        let p = addr as usize as *const u8;
        // Safety: the address comes from an alloca buffer, a runtime
        // allocation, or a pointer the caller passed in; the type's size
        // is readable there by the ABI contract.
        unsafe {
            match self.module.type_data(ty) {
                TypeData::I1 => (p.read() & 1) as u64,
                TypeData::I8 => p.cast::<i8>().read() as i64 as u64,
                TypeData::I32 => p.cast::<i32>().read_unaligned() as i64 as u64,
                TypeData::I64 => p.cast::<i64>().read_unaligned() as u64,
                TypeData::F64 => p.cast::<u64>().read_unaligned(),
                TypeData::Ptr(_) => p.cast::<u64>().read_unaligned(),
                other => panic!("cannot load a value of type {other:?}"),
            }
        }
    }

    fn write_mem(&self, addr: u64, ty: TypeId, word: u64) {
        let p = addr as usize as *mut u8;
        // Safety: see read_mem.
        unsafe {
            match self.module.type_data(ty) {
                TypeData::I1 => p.write(word as u8 & 1),
                TypeData::I8 => p.write(word as u8),
                TypeData::I32 => p.cast::<i32>().write_unaligned(word as i32),
                TypeData::I64 => p.cast::<i64>().write_unaligned(word as i64),
                TypeData::F64 => p.cast::<u64>().write_unaligned(word),
                TypeData::Ptr(_) => p.cast::<u64>().write_unaligned(word),
                other => panic!("cannot store a value of type {other:?}"),
            }
        }
    }
}

/// Canonical word form of an integer: sign-extended to 64 bits.
fn canon(ty: &TypeData, raw: u64) -> u64 {
    match ty {
        TypeData::I1 => raw & 1,
        TypeData::I8 => raw as u8 as i8 as i64 as u64,
        TypeData::I32 => raw as u32 as i32 as i64 as u64,
        _ => raw,
    }
}
