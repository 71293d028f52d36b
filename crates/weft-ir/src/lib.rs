//! Weft SSA IR.
//!
//! The IR provider the rest of the workspace builds on: a small typed SSA
//! with basic blocks, a positioned builder, C-rule data layout, a
//! printer, a verifier, and a word-level evaluator for executing modules
//! in tests.
//!
//! ## Modules
//!
//! - [`module`]: types, values, instructions, blocks, functions, arenas
//! - [`builder`]: positioned instruction builder
//! - [`layout`]: C-compatible sizes, alignments and field offsets
//! - [`print`]: deterministic textual IR (`Display` on [`Module`])
//! - [`verify`]: well-formedness checks (the post-lowering gate)
//! - [`eval`]: abstract machine + extern-call host interface
//!
//! A module under construction may be *invalid on purpose*: emitters
//! reference caller-defined values from inside parallel-construct bodies,
//! and the lowering layer rewrites those references before anything
//! executes. `verify` tells the two states apart.

pub mod builder;
pub mod eval;
pub mod layout;
pub mod module;
pub mod print;
pub mod verify;

pub use builder::Builder;
pub use eval::{Evaluator, ExternHost};
pub use layout::Layout;
pub use module::{
    BinOp, Block, BlockRef, Cond, FuncRef, Function, Inst, InstKind, InstRef, Module, TypeData,
    TypeId, Value,
};
pub use verify::{verify, VerifyError, VerifyErrorKind};
