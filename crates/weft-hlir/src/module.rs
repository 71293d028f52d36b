//! HLIR module: the construct list attached to an IR module, and the
//! process-wide named-module registry.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use weft_ir as ir;
use weft_ir::{BlockRef, Builder, FuncRef, InstRef, TypeData, TypeId, Value};

use crate::construct::{
    synth_region_body, synth_task_wrapper, Construct, ConstructRef, ParallelFor, ParallelReduce,
    ReduceOp, Task,
};
use crate::error::LowerError;
use crate::intrinsics::Intrinsics;
use crate::lower;

/// An IR module plus its parallel constructs, in creation order.
///
/// The emitter builds caller and body IR through [`HlirModule::ir_mut`]
/// and the construct accessors, then hands the whole thing to
/// [`HlirModule::lower_to_ir`], which rewrites every construct into
/// plain SSA plus runtime facade calls.
pub struct HlirModule {
    ir: ir::Module,
    intr: Intrinsics,
    constructs: Vec<Construct>,
    next_id: u32,
}

impl HlirModule {
    pub fn new(name: impl Into<String>) -> Self {
        let mut ir = ir::Module::new(name);
        let intr = Intrinsics::declare(&mut ir);
        HlirModule {
            ir,
            intr,
            constructs: Vec::new(),
            next_id: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.ir.name
    }

    pub fn ir(&self) -> &ir::Module {
        &self.ir
    }

    pub fn ir_mut(&mut self) -> &mut ir::Module {
        &mut self.ir
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // ── Construct creation ────────────────────────────────────────────

    /// Create a parallel-for over `[start, end)` (both `i32`, evaluated
    /// in the caller). The marker is appended to `at`; caller IR emitted
    /// into `at` afterwards lands after the parallel region. The emitter
    /// writes the per-iteration body before
    /// [`HlirModule::insertion`].
    pub fn create_parallel_for(
        &mut self,
        at: BlockRef,
        start: Value,
        end: Value,
    ) -> ConstructRef {
        let id = self.next_id();
        let name = format!("parallel_for_{id}");
        let (region, _) = synth_region_body(
            &mut self.ir,
            &self.intr,
            &format!("__parfor_body_{id}"),
            id,
            None,
        );

        let caller = self.ir.block(at).func;
        let mut b = Builder::at_end(&mut self.ir, at);
        let id_const = b.module().const_i32(id as i32);
        let marker = b
            .call(self.intr.marker, vec![id_const], "")
            .as_inst()
            .expect("calls are instructions");

        self.constructs.push(Construct::ParallelFor(ParallelFor {
            name,
            caller,
            marker,
            region,
            start,
            end,
        }));
        ConstructRef(self.constructs.len() - 1)
    }

    /// Create a parallel-reduce over `[start, end)` combining with `op`
    /// over `ty` (`i32` or `i64`). The marker's result value stands in
    /// for the reduction total; lowering rewrites its uses.
    pub fn create_parallel_reduce(
        &mut self,
        at: BlockRef,
        start: Value,
        end: Value,
        ty: TypeId,
        op: ReduceOp,
    ) -> Result<ConstructRef, LowerError> {
        if !matches!(self.ir.type_data(ty), TypeData::I32 | TypeData::I64) {
            return Err(LowerError::UnsupportedReduceType {
                ty: format!("{:?}", self.ir.type_data(ty)),
            });
        }
        let id = self.next_id();
        let name = format!("parallel_reduce_{id}");
        let (region, reduce_var) = synth_region_body(
            &mut self.ir,
            &self.intr,
            &format!("__reduce_body_{id}"),
            id,
            Some((ty, op)),
        );
        let reduce_var = reduce_var.expect("reduce body has an accumulator slot");

        let caller = self.ir.block(at).func;
        let mut b = Builder::at_end(&mut self.ir, at);
        let id_const = b.module().const_i32(id as i32);
        let marker = b
            .call(self.intr.reduce_marker, vec![id_const], "reduce.total")
            .as_inst()
            .expect("calls are instructions");

        self.constructs
            .push(Construct::ParallelReduce(ParallelReduce {
                name,
                caller,
                marker,
                region,
                start,
                end,
                reduce_var,
                reduce_ty: ty,
                op,
            }));
        Ok(ConstructRef(self.constructs.len() - 1))
    }

    /// Create a task wrapping `func`: synthesizes the wrapper; lowering
    /// later rewrites every direct call of `func` into queue/await pairs.
    pub fn create_task(&mut self, func: FuncRef) -> Result<ConstructRef, LowerError> {
        if self.ir.func(func).is_extern {
            return Err(LowerError::TaskOnExternFunction {
                func: self.ir.func(func).name.clone(),
            });
        }
        let id = self.next_id();
        let name = format!("task_{id}");
        let (wrapper, arg_struct, ret_field, args_base) =
            synth_task_wrapper(&mut self.ir, &self.intr, func);
        self.constructs.push(Construct::Task(Task {
            name,
            func,
            wrapper,
            arg_struct,
            ret_field,
            args_base,
        }));
        Ok(ConstructRef(self.constructs.len() - 1))
    }

    // ── Construct attributes ──────────────────────────────────────────

    fn construct(&self, c: ConstructRef) -> &Construct {
        &self.constructs[c.0]
    }

    /// The synthesized body function (parallel-for/-reduce) or wrapper
    /// (task).
    pub fn body(&self, c: ConstructRef) -> FuncRef {
        match self.construct(c) {
            Construct::ParallelFor(pf) => pf.region.body,
            Construct::ParallelReduce(pr) => pr.region.body,
            Construct::Task(t) => t.wrapper,
        }
    }

    /// Anchor the emitter writes per-iteration body IR before.
    pub fn insertion(&self, c: ConstructRef) -> Option<InstRef> {
        match self.construct(c) {
            Construct::ParallelFor(pf) => Some(pf.region.insertion),
            Construct::ParallelReduce(pr) => Some(pr.region.insertion),
            Construct::Task(_) => None,
        }
    }

    /// Anchor capture unpacking is inserted before during lowering.
    pub fn args_insertion(&self, c: ConstructRef) -> Option<InstRef> {
        match self.construct(c) {
            Construct::ParallelFor(pf) => Some(pf.region.args_insertion),
            Construct::ParallelReduce(pr) => Some(pr.region.args_insertion),
            Construct::Task(_) => None,
        }
    }

    /// Pointer to the iteration index (`i32*`), valid inside the body.
    pub fn index_ptr(&self, c: ConstructRef) -> Option<Value> {
        match self.construct(c) {
            Construct::ParallelFor(pf) => Some(pf.region.index_ptr),
            Construct::ParallelReduce(pr) => Some(pr.region.index_ptr),
            Construct::Task(_) => None,
        }
    }

    /// The opaque captured-args pointer (`i8*`), valid inside the body.
    pub fn captured_args(&self, c: ConstructRef) -> Option<Value> {
        match self.construct(c) {
            Construct::ParallelFor(pf) => Some(pf.region.captured_args),
            Construct::ParallelReduce(pr) => Some(pr.region.captured_args),
            Construct::Task(_) => None,
        }
    }

    /// The accumulator slot (`reduce_ty*`) of a parallel-reduce body.
    pub fn reduce_var(&self, c: ConstructRef) -> Option<Value> {
        match self.construct(c) {
            Construct::ParallelReduce(pr) => Some(pr.reduce_var),
            _ => None,
        }
    }

    pub fn reduce_ty(&self, c: ConstructRef) -> Option<TypeId> {
        match self.construct(c) {
            Construct::ParallelReduce(pr) => Some(pr.reduce_ty),
            _ => None,
        }
    }

    /// Caller-side value standing in for the reduction total; usable as
    /// an operand before lowering.
    pub fn reduce_result(&self, c: ConstructRef) -> Option<Value> {
        match self.construct(c) {
            Construct::ParallelReduce(pr) => Some(Value::Inst(pr.marker)),
            _ => None,
        }
    }

    /// The caller-side marker instruction.
    pub fn marker(&self, c: ConstructRef) -> Option<InstRef> {
        match self.construct(c) {
            Construct::ParallelFor(pf) => Some(pf.marker),
            Construct::ParallelReduce(pr) => Some(pr.marker),
            Construct::Task(_) => None,
        }
    }

    // ── Lowering ──────────────────────────────────────────────────────

    /// Rewrite every construct, in creation order, into plain SSA plus
    /// runtime facade calls. The result is verifier-clean or an error.
    pub fn lower_to_ir(mut self) -> Result<ir::Module, LowerError> {
        let constructs = std::mem::take(&mut self.constructs);

        // Region body -> caller-side marker, for every parallel region in
        // the module. The task pass needs this to force a future whose
        // only consumer is a construct body lowered *after* it: the
        // await then anchors at the consuming construct's marker, where
        // that body's captures will be spilled.
        let mut region_markers: FxHashMap<FuncRef, InstRef> = FxHashMap::default();
        for construct in &constructs {
            match construct {
                Construct::ParallelFor(pf) => {
                    region_markers.insert(pf.region.body, pf.marker);
                }
                Construct::ParallelReduce(pr) => {
                    region_markers.insert(pr.region.body, pr.marker);
                }
                Construct::Task(_) => {}
            }
        }

        for construct in &constructs {
            tracing::debug!(construct = construct.name(), "lowering");
            match construct {
                Construct::ParallelFor(pf) => {
                    lower::parallel_for::lower(&mut self.ir, &self.intr, pf)?
                }
                Construct::ParallelReduce(pr) => {
                    lower::reduce::lower(&mut self.ir, &self.intr, pr)?
                }
                Construct::Task(t) => {
                    lower::task::lower(&mut self.ir, &self.intr, t, &region_markers)?
                }
            }
        }
        ir::verify(&self.ir)?;
        Ok(self.ir)
    }
}

// ── Named-module registry ─────────────────────────────────────────────

static MODULES: Mutex<Option<FxHashMap<String, HlirModule>>> = Mutex::new(None);

/// Park a module in the process-wide registry under its name. Returns
/// the module previously registered under that name, if any.
pub fn register(module: HlirModule) -> Option<HlirModule> {
    let mut guard = MODULES.lock();
    guard
        .get_or_insert_with(FxHashMap::default)
        .insert(module.name().to_string(), module)
}

/// Remove and return a registered module.
pub fn take(name: &str) -> Option<HlirModule> {
    MODULES.lock().as_mut()?.remove(name)
}

/// Names of all registered modules, sorted.
pub fn registered() -> Vec<String> {
    let guard = MODULES.lock();
    let mut names: Vec<String> = guard
        .as_ref()
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default();
    names.sort();
    names
}
