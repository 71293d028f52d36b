//! Lowering errors.
//!
//! Emitter misuse and unsupported inputs surface as typed errors from the
//! construct API and the lowering driver, never as asserts: the emitter
//! is a client, not a trusted caller.

use std::fmt;

use serde::Serialize;

use weft_ir::VerifyError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LowerError {
    /// Parallel-reduce over a type the combine ABI does not carry.
    UnsupportedReduceType { ty: String },
    /// A task construct wrapping an extern declaration.
    TaskOnExternFunction { func: String },
    /// A construct whose caller-side marker has been erased or was never
    /// placed in a block.
    MarkerNotFound { construct: String },
    /// The lowered module failed verification -- the emitter handed over
    /// IR the passes could not make well-formed.
    Invalid(VerifyError),
}

impl fmt::Display for LowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedReduceType { ty } => {
                write!(f, "unsupported reduce type: {ty}")
            }
            Self::TaskOnExternFunction { func } => {
                write!(f, "cannot make a task of extern function '{func}'")
            }
            Self::MarkerNotFound { construct } => {
                write!(f, "construct '{construct}' has no live marker")
            }
            Self::Invalid(e) => write!(f, "lowered module is invalid: {e}"),
        }
    }
}

impl std::error::Error for LowerError {}

impl From<VerifyError> for LowerError {
    fn from(e: VerifyError) -> Self {
        LowerError::Invalid(e)
    }
}
