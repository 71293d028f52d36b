//! Positioned instruction builder.
//!
//! A builder owns a mutable borrow of the module and an insertion point:
//! either the end of a block or the slot immediately before an existing
//! instruction (how the lowering passes target markers). Every `build_*`
//! method inserts at the point and advances past the new instruction, so
//! consecutive calls emit in order.

use crate::module::{
    BinOp, BlockRef, Cond, FuncRef, Inst, InstKind, InstRef, Module, TypeData, TypeId, Value,
};

pub struct Builder<'m> {
    module: &'m mut Module,
    func: FuncRef,
    block: BlockRef,
    /// Index into the block's instruction list where the next instruction
    /// is inserted.
    at: usize,
}

impl<'m> Builder<'m> {
    /// Create a builder positioned at the end of `block`.
    pub fn at_end(module: &'m mut Module, block: BlockRef) -> Self {
        let func = module.block(block).func;
        let at = module.block(block).insts.len();
        Builder {
            module,
            func,
            block,
            at,
        }
    }

    /// Create a builder positioned immediately before `inst`.
    pub fn before(module: &'m mut Module, inst: InstRef) -> Self {
        let (block, at) = module
            .position_in_block(inst)
            .expect("cannot position before an erased instruction");
        let func = module.block(block).func;
        Builder {
            module,
            func,
            block,
            at,
        }
    }

    pub fn module(&mut self) -> &mut Module {
        self.module
    }

    /// The function the builder is inserting into.
    pub fn func(&self) -> FuncRef {
        self.func
    }

    pub fn block(&self) -> BlockRef {
        self.block
    }

    pub fn position_at_end(&mut self, block: BlockRef) {
        self.func = self.module.block(block).func;
        self.block = block;
        self.at = self.module.block(block).insts.len();
    }

    pub fn position_before(&mut self, inst: InstRef) {
        let (block, at) = self
            .module
            .position_in_block(inst)
            .expect("cannot position before an erased instruction");
        self.func = self.module.block(block).func;
        self.block = block;
        self.at = at;
    }

    /// Insert a raw instruction at the current point and advance past it.
    pub fn insert(&mut self, kind: InstKind, ty: TypeId, name: &str) -> InstRef {
        let inst = Inst {
            kind,
            ty,
            func: self.func,
            block: Some(self.block),
            name: name.to_string(),
        };
        let r = self.module.push_inst(inst);
        let at = self.at;
        self.module.block_mut(self.block).insts.insert(at, r);
        self.at += 1;
        r
    }

    // ── Memory ────────────────────────────────────────────────────────

    pub fn alloca(&mut self, ty: TypeId, name: &str) -> Value {
        let ptr = self.module.ptr_ty(ty);
        Value::Inst(self.insert(InstKind::Alloca { ty }, ptr, name))
    }

    pub fn load(&mut self, ptr: Value, name: &str) -> Value {
        let pty = self.module.value_ty(ptr);
        let pointee = self
            .module
            .pointee(pty)
            .expect("load requires a pointer operand");
        Value::Inst(self.insert(InstKind::Load { ptr }, pointee, name))
    }

    pub fn store(&mut self, value: Value, ptr: Value) -> InstRef {
        let void = self.module.void_ty();
        self.insert(InstKind::Store { value, ptr }, void, "")
    }

    /// Address of struct field `field` through a struct pointer.
    pub fn field_ptr(&mut self, base: Value, field: u32, name: &str) -> Value {
        let bty = self.module.value_ty(base);
        let strukt = self
            .module
            .pointee(bty)
            .expect("field_ptr requires a struct pointer");
        let field_ty = match self.module.type_data(strukt) {
            TypeData::Struct(fields) => fields[field as usize],
            _ => panic!("field_ptr requires a struct pointer"),
        };
        let ptr = self.module.ptr_ty(field_ty);
        Value::Inst(self.insert(InstKind::FieldPtr { base, field }, ptr, name))
    }

    /// Advance a pointer by a byte offset; the result keeps `base`'s type.
    pub fn ptr_add(&mut self, base: Value, offset: Value, name: &str) -> Value {
        let ty = self.module.value_ty(base);
        Value::Inst(self.insert(InstKind::PtrAdd { base, offset }, ty, name))
    }

    pub fn ptr_cast(&mut self, value: Value, to: TypeId, name: &str) -> Value {
        Value::Inst(self.insert(InstKind::PtrCast { value }, to, name))
    }

    // ── Arithmetic ────────────────────────────────────────────────────

    pub fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value, name: &str) -> Value {
        let ty = self.module.value_ty(lhs);
        Value::Inst(self.insert(InstKind::Binary { op, lhs, rhs }, ty, name))
    }

    pub fn icmp(&mut self, cond: Cond, lhs: Value, rhs: Value, name: &str) -> Value {
        let i1 = self.module.i1_ty();
        Value::Inst(self.insert(InstKind::Icmp { cond, lhs, rhs }, i1, name))
    }

    pub fn sext(&mut self, value: Value, to: TypeId, name: &str) -> Value {
        Value::Inst(self.insert(InstKind::Sext { value }, to, name))
    }

    pub fn trunc(&mut self, value: Value, to: TypeId, name: &str) -> Value {
        Value::Inst(self.insert(InstKind::Trunc { value }, to, name))
    }

    // ── Calls ─────────────────────────────────────────────────────────

    /// Call a function directly by reference.
    pub fn call(&mut self, callee: FuncRef, args: Vec<Value>, name: &str) -> Value {
        let ret = self.module.func(callee).ret;
        Value::Inst(self.insert(
            InstKind::Call {
                callee: Value::Func(callee),
                args,
            },
            ret,
            name,
        ))
    }

    /// Call through a function-pointer value.
    pub fn call_indirect(&mut self, callee: Value, args: Vec<Value>, name: &str) -> Value {
        let cty = self.module.value_ty(callee);
        let ret = match self.module.pointee(cty).map(|p| self.module.type_data(p)) {
            Some(TypeData::Fn { ret, .. }) => *ret,
            _ => panic!("call_indirect requires a function-pointer operand"),
        };
        Value::Inst(self.insert(InstKind::Call { callee, args }, ret, name))
    }

    // ── Terminators ───────────────────────────────────────────────────

    pub fn br(&mut self, dest: BlockRef) -> InstRef {
        let void = self.module.void_ty();
        self.insert(InstKind::Br { dest }, void, "")
    }

    pub fn cond_br(&mut self, cond: Value, then_dest: BlockRef, else_dest: BlockRef) -> InstRef {
        let void = self.module.void_ty();
        self.insert(
            InstKind::CondBr {
                cond,
                then_dest,
                else_dest,
            },
            void,
            "",
        )
    }

    pub fn ret(&mut self, value: Option<Value>) -> InstRef {
        let void = self.module.void_ty();
        self.insert(InstKind::Ret { value }, void, "")
    }
}
