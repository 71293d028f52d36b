//! Deterministic textual form of a module.
//!
//! The printed form is for humans and snapshot tests; there is no parser
//! for it. Result names come from builder hints, deduplicated with a
//! numeric suffix; unnamed results are numbered per function.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::module::{
    BinOp, BlockRef, Cond, FuncRef, InstKind, InstRef, Module, TypeData, TypeId, Value,
};

impl Module {
    fn fmt_ty(&self, ty: TypeId, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.type_data(ty) {
            TypeData::Void => write!(f, "void"),
            TypeData::I1 => write!(f, "i1"),
            TypeData::I8 => write!(f, "i8"),
            TypeData::I32 => write!(f, "i32"),
            TypeData::I64 => write!(f, "i64"),
            TypeData::F64 => write!(f, "f64"),
            TypeData::Ptr(p) => {
                self.fmt_ty(*p, f)?;
                write!(f, "*")
            }
            TypeData::Struct(fields) => {
                write!(f, "{{")?;
                for (i, &ft) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    self.fmt_ty(ft, f)?;
                }
                write!(f, "}}")
            }
            TypeData::Fn { params, ret } => {
                write!(f, "fn(")?;
                for (i, &pt) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    self.fmt_ty(pt, f)?;
                }
                write!(f, ") -> ")?;
                self.fmt_ty(*ret, f)
            }
        }
    }
}

/// Per-function printing state: stable names for results and blocks.
struct Names {
    inst: FxHashMap<InstRef, String>,
    block: FxHashMap<BlockRef, String>,
}

impl Names {
    fn assign(m: &Module, func: FuncRef) -> Names {
        let mut used: FxHashMap<String, u32> = FxHashMap::default();
        let mut uniq = |hint: &str, auto: &mut u32| -> String {
            if hint.is_empty() {
                let n = *auto;
                *auto += 1;
                return format!("{n}");
            }
            let count = used.entry(hint.to_string()).or_insert(0);
            let name = if *count == 0 {
                hint.to_string()
            } else {
                format!("{hint}.{count}")
            };
            *count += 1;
            name
        };

        let mut auto = 0u32;
        let mut inst = FxHashMap::default();
        let mut block = FxHashMap::default();
        for &b in &m.func(func).blocks {
            block.insert(b, uniq(&m.block(b).name, &mut auto));
            for &i in &m.block(b).insts {
                let data = m.inst(i);
                if data.ty != m.void_ty() {
                    inst.insert(i, uniq(&data.name, &mut auto));
                }
            }
        }
        Names { inst, block }
    }
}

struct ValueDisplay<'a> {
    m: &'a Module,
    names: &'a Names,
    v: Value,
}

impl fmt::Display for ValueDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.v {
            Value::Inst(i) => match self.names.inst.get(&i) {
                Some(n) => write!(f, "%{n}"),
                // A reference to a value defined in another function (or an
                // erased one): print its raw id so invalid pre-lowering
                // modules are still printable.
                None => write!(f, "%<foreign:{:?}>", i),
            },
            Value::Param(_, n) => write!(f, "%arg{n}"),
            Value::Func(fr) => write!(f, "@{}", self.m.func(fr).name),
            Value::ConstInt(_, v) => write!(f, "{v}"),
            Value::ConstNull(_) => write!(f, "null"),
        }
    }
}

fn op_name(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "add",
        BinOp::Sub => "sub",
        BinOp::Mul => "mul",
        BinOp::And => "and",
        BinOp::Or => "or",
        BinOp::Xor => "xor",
    }
}

fn cond_name(c: Cond) -> &'static str {
    match c {
        Cond::Eq => "eq",
        Cond::Ne => "ne",
        Cond::Slt => "slt",
        Cond::Sle => "sle",
        Cond::Sgt => "sgt",
        Cond::Sge => "sge",
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module @{}", self.name)?;
        for fr in self.funcs() {
            writeln!(f)?;
            let func = self.func(fr);
            if func.is_extern {
                write!(f, "declare @{}(", func.name)?;
                for (i, &p) in func.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    self.fmt_ty(p, f)?;
                }
                write!(f, ") -> ")?;
                self.fmt_ty(func.ret, f)?;
                writeln!(f)?;
                continue;
            }
            write!(f, "fn @{}(", func.name)?;
            for (i, &p) in func.params.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                self.fmt_ty(p, f)?;
                write!(f, " %arg{i}")?;
            }
            write!(f, ") -> ")?;
            self.fmt_ty(func.ret, f)?;
            writeln!(f, " {{")?;

            let names = Names::assign(self, fr);
            for &b in &func.blocks {
                writeln!(f, "{}:", names.block[&b])?;
                for &i in &self.block(b).insts {
                    self.fmt_inst(i, &names, f)?;
                }
            }
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}

impl Module {
    fn fmt_inst(&self, i: InstRef, names: &Names, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let val = |v: Value| ValueDisplay {
            m: self,
            names,
            v,
        };
        let data = self.inst(i);
        write!(f, "  ")?;
        if let Some(n) = names.inst.get(&i) {
            write!(f, "%{n} = ")?;
        }
        match &data.kind {
            InstKind::Alloca { ty } => {
                write!(f, "alloca ")?;
                self.fmt_ty(*ty, f)?;
            }
            InstKind::Load { ptr } => write!(f, "load {}", val(*ptr))?,
            InstKind::Store { value, ptr } => {
                write!(f, "store {}, {}", val(*value), val(*ptr))?
            }
            InstKind::FieldPtr { base, field } => {
                write!(f, "fieldptr {}, {}", val(*base), field)?
            }
            InstKind::PtrAdd { base, offset } => {
                write!(f, "ptradd {}, {}", val(*base), val(*offset))?
            }
            InstKind::PtrCast { value } => {
                write!(f, "ptrcast {} to ", val(*value))?;
                self.fmt_ty(data.ty, f)?;
            }
            InstKind::Binary { op, lhs, rhs } => {
                write!(f, "{} {}, {}", op_name(*op), val(*lhs), val(*rhs))?
            }
            InstKind::Icmp { cond, lhs, rhs } => {
                write!(f, "icmp {} {}, {}", cond_name(*cond), val(*lhs), val(*rhs))?
            }
            InstKind::Sext { value } => {
                write!(f, "sext {} to ", val(*value))?;
                self.fmt_ty(data.ty, f)?;
            }
            InstKind::Trunc { value } => {
                write!(f, "trunc {} to ", val(*value))?;
                self.fmt_ty(data.ty, f)?;
            }
            InstKind::Call { callee, args } => {
                write!(f, "call {}(", val(*callee))?;
                for (n, a) in args.iter().enumerate() {
                    if n > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", val(*a))?;
                }
                write!(f, ")")?;
            }
            InstKind::Br { dest } => write!(f, "br ^{}", names.block[dest])?,
            InstKind::CondBr {
                cond,
                then_dest,
                else_dest,
            } => write!(
                f,
                "condbr {}, ^{}, ^{}",
                val(*cond),
                names.block[then_dest],
                names.block[else_dest]
            )?,
            InstKind::Ret { value } => match value {
                Some(v) => write!(f, "ret {}", val(*v))?,
                None => write!(f, "ret")?,
            },
        }
        writeln!(f)
    }
}
