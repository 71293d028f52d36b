//! Module well-formedness checks.
//!
//! A module fresh from an emitter is allowed to be invalid: construct
//! bodies reference caller-defined values until lowering plumbs them
//! through a captured-args struct. The verifier is the gate *after*
//! lowering -- a lowered module must pass.

use std::fmt;

use serde::Serialize;

use crate::module::{FuncRef, InstKind, Module, TypeData, Value};

/// A verification failure, with the function it was found in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifyError {
    /// Name of the offending function.
    pub func: String,
    pub kind: VerifyErrorKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum VerifyErrorKind {
    /// A defined function has no blocks.
    EmptyFunction,
    /// A block has no terminator, or a terminator mid-block.
    BadTermination { block: String },
    /// An instruction names a value defined in another function.
    ForeignOperand { other_func: String },
    /// A call's argument count does not match the callee signature.
    CallArity { callee: String, expected: usize, got: usize },
    /// A call's callee is not of function-pointer type.
    BadCallee,
    /// A load or store through a non-pointer value.
    BadPointer,
}

impl fmt::Display for VerifyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyFunction => write!(f, "defined function has no blocks"),
            Self::BadTermination { block } => {
                write!(f, "block '{block}' is not terminated exactly once")
            }
            Self::ForeignOperand { other_func } => {
                write!(f, "operand defined in another function '{other_func}'")
            }
            Self::CallArity {
                callee,
                expected,
                got,
            } => write!(f, "call to '{callee}' expects {expected} arguments, got {got}"),
            Self::BadCallee => write!(f, "callee is not a function pointer"),
            Self::BadPointer => write!(f, "memory access through a non-pointer value"),
        }
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "in @{}: {}", self.func, self.kind)
    }
}

impl std::error::Error for VerifyError {}

/// Verify the whole module; the first failure is returned.
pub fn verify(m: &Module) -> Result<(), VerifyError> {
    for fr in m.funcs() {
        verify_func(m, fr)?;
    }
    Ok(())
}

fn err(m: &Module, func: FuncRef, kind: VerifyErrorKind) -> VerifyError {
    VerifyError {
        func: m.func(func).name.clone(),
        kind,
    }
}

fn verify_func(m: &Module, fr: FuncRef) -> Result<(), VerifyError> {
    let func = m.func(fr);
    if func.is_extern {
        return Ok(());
    }
    if func.blocks.is_empty() {
        return Err(err(m, fr, VerifyErrorKind::EmptyFunction));
    }

    for &b in &func.blocks {
        let block = m.block(b);
        let n = block.insts.len();
        let terminated = n > 0 && m.inst(block.insts[n - 1]).kind.is_terminator();
        let mid_terminator = block
            .insts
            .iter()
            .take(n.saturating_sub(1))
            .any(|&i| m.inst(i).kind.is_terminator());
        if !terminated || mid_terminator {
            return Err(err(
                m,
                fr,
                VerifyErrorKind::BadTermination {
                    block: block.name.clone(),
                },
            ));
        }

        for &i in &block.insts {
            let inst = m.inst(i);

            let mut foreign = None;
            inst.kind.for_each_value(|v| {
                if let Some(def) = m.defining_func(v) {
                    if def != fr && foreign.is_none() {
                        foreign = Some(def);
                    }
                }
            });
            if let Some(def) = foreign {
                return Err(err(
                    m,
                    fr,
                    VerifyErrorKind::ForeignOperand {
                        other_func: m.func(def).name.clone(),
                    },
                ));
            }

            match &inst.kind {
                InstKind::Call { callee, args } => {
                    let cty = m.value_ty(*callee);
                    let sig = m.pointee(cty).map(|p| m.type_data(p));
                    match sig {
                        Some(TypeData::Fn { params, .. }) => {
                            if params.len() != args.len() {
                                let callee_name = match callee {
                                    Value::Func(cf) => m.func(*cf).name.clone(),
                                    _ => "<indirect>".to_string(),
                                };
                                return Err(err(
                                    m,
                                    fr,
                                    VerifyErrorKind::CallArity {
                                        callee: callee_name,
                                        expected: params.len(),
                                        got: args.len(),
                                    },
                                ));
                            }
                        }
                        _ => return Err(err(m, fr, VerifyErrorKind::BadCallee)),
                    }
                }
                InstKind::Load { ptr } | InstKind::Store { ptr, .. } => {
                    if m.pointee(m.value_ty(*ptr)).is_none() {
                        return Err(err(m, fr, VerifyErrorKind::BadPointer));
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}
