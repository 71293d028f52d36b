//! High-level IR constructs and their lowering.
//!
//! A compiler front-end expresses parallelism as three constructs --
//! *parallel-for*, *parallel-reduce* and *task* -- attached to a
//! [`weft_ir`] module through [`HlirModule`]. Construct creation
//! synthesizes the stereotyped body/wrapper IR and plants markers;
//! [`HlirModule::lower_to_ir`] then rewrites everything into plain SSA
//! plus calls into the `weft-rt` C-ABI facade:
//!
//! - capture discovery marshals caller-defined values through a
//!   per-construct struct (store before queue, reload in the body),
//! - parallel regions become a queue loop over a completion latch plus
//!   an await,
//! - task calls become allocate/queue launches with the future forced at
//!   the first use of the result.
//!
//! The runtime is reached purely through named extern symbols; the
//! declarations in [`intrinsics`] mirror the `weft-rt` facade and form
//! the ABI between the two crates.

mod construct;
mod error;
mod intrinsics;
mod lower;
mod module;

pub use construct::{ConstructRef, ReduceOp};
pub use error::LowerError;
pub use intrinsics::{ITER_PRIORITY, TASK_PRIORITY};
pub use module::{register, registered, take, HlirModule};
