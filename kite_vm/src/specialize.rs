//! Specialization plans and guarded execution of planned sites.
//!
//! A plan is built from a hot code object's feedback. It maps instruction
//! offsets to guarded specializations and owns the validity flag its
//! dependencies are registered under. The dispatch loop hands a planned
//! instruction to [`run_site`] instead of the baseline handler.
//!
//! ```text
//! CodeProfile ──build_plan──► SpecializationPlan ──run_site──► fast path
//!                                   │                            │ guard fails
//!                                   ▼                            ▼
//!                        InvalidationRegistry            baseline handler
//! ```

use crate::branch::{BranchPrediction, CondBranchStats};
use crate::builtins::CallContext;
use crate::dispatch::{ControlFlow, handler};
use crate::error::{RuntimeError, VmResult};
use crate::feedback::{CalleeKind, CodeProfile, SiteFeedback};
use crate::frame::Frame;
use crate::guard::{
    BailoutReason, FastPath, Guard, GuardState, GuardedSpecialization, IllegalTransition,
};
use crate::invalidation::{InvalidationRegistry, ValidityFlag, new_validity_flag};
use crate::ops::objects::bind;
use crate::optimized_ops;
use crate::value::{Class, ObjectId, TypeTag, Value};
use crate::vm::Vm;
use kite_compiler::{CodeId, CompiledCode, Decoded, Opcode, call_nargs, decode};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

// =============================================================================
// Plan
// =============================================================================

/// Guarded specializations of one code object.
#[derive(Debug)]
pub struct SpecializationPlan {
    pub code_id: CodeId,
    /// Specialized sites by instruction offset.
    pub sites: FxHashMap<u32, GuardedSpecialization>,
    /// Cleared by the registry when a watched object is mutated.
    pub valid: ValidityFlag,
    /// Objects this plan registered watchers for.
    pub watched: SmallVec<[ObjectId; 4]>,
    /// Prediction outcome of every branch site at build time.
    pub branch_stats: CondBranchStats,
}

impl SpecializationPlan {
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Stop watching every object this plan depends on.
    pub fn release(&self, registry: &InvalidationRegistry) {
        for &object in &self.watched {
            registry.unregister_watcher(object, self.code_id);
        }
    }
}

/// Build a plan for `code` from `profile`, registering its dependencies.
///
/// Only monomorphic sites with a fast path are specialized; everything else
/// keeps running its baseline handler.
pub fn build_plan(
    code: &CompiledCode,
    profile: &CodeProfile,
    registry: &InvalidationRegistry,
) -> SpecializationPlan {
    let mut plan = SpecializationPlan {
        code_id: code.id,
        sites: FxHashMap::default(),
        valid: new_validity_flag(),
        watched: SmallVec::new(),
        branch_stats: CondBranchStats::default(),
    };

    for instr in decode(&code.bytecode).map_while(Result::ok) {
        let Some(feedback) = profile.sites.get(&instr.offset) else {
            continue;
        };
        if profile.declined.contains(&instr.offset) {
            continue;
        }
        let site = match feedback {
            SiteFeedback::Operands(fb) => fb.single().and_then(|(lhs, rhs)| {
                let key = optimized_ops::key_for(instr.opcode, instr.arg)?;
                let func = optimized_ops::lookup(key, lhs, rhs)?;
                Some(GuardedSpecialization::new(
                    FastPath::Operator(func),
                    [
                        Guard::TypeIs { slot: 1, ty: lhs },
                        Guard::TypeIs { slot: 0, ty: rhs },
                    ],
                ))
            }),
            SiteFeedback::Call(fb) => fb
                .single()
                .filter(|_| instr.opcode == Opcode::CallFunction)
                .and_then(|target| {
                    let fast = match target.kind {
                        CalleeKind::Native => FastPath::CallNative,
                        CalleeKind::Function => FastPath::CallFunction,
                        CalleeKind::Other => return None,
                    };
                    let slot = u8::try_from(call_nargs(instr.arg)).ok()?;
                    plan.watch(registry, target.id);
                    Some(GuardedSpecialization::new(
                        fast,
                        [Guard::CalleeIs { slot, id: target.id }, Guard::CodeValid],
                    ))
                }),
            SiteFeedback::Attr { classes, last } => classes
                .single()
                .and_then(|id| last.upgrade().filter(|class| class.id == id))
                .and_then(|class| attr_site(&mut plan, registry, code, &instr, &class)),
            SiteFeedback::Branch(fb) => {
                let prediction = fb.predict();
                plan.branch_stats.record(prediction);
                match (prediction, instr.opcode) {
                    (
                        BranchPrediction::Likely(likely),
                        Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue,
                    ) => Some(GuardedSpecialization::new(
                        FastPath::Branch { likely },
                        [Guard::TypeIs {
                            slot: 0,
                            ty: TypeTag::Bool,
                        }],
                    )),
                    _ => None,
                }
            }
        };
        if let Some(site) = site {
            plan.sites.insert(instr.offset, site);
        }
    }

    debug!(
        code = %code.name,
        sites = plan.sites.len(),
        watched = plan.watched.len(),
        "built specialization plan"
    );
    plan
}

impl SpecializationPlan {
    fn watch(&mut self, registry: &InvalidationRegistry, object: ObjectId) {
        if !self.watched.contains(&object) {
            registry.register_watcher(object, self.code_id, &self.valid);
            self.watched.push(object);
        }
    }
}

/// Attribute and method loads on instances of one class. The class and all
/// of its bases are watched, since a lookup may resolve through any of them.
fn attr_site(
    plan: &mut SpecializationPlan,
    registry: &InvalidationRegistry,
    code: &CompiledCode,
    instr: &Decoded,
    class: &Class,
) -> Option<GuardedSpecialization> {
    let name = code.names.get(instr.arg as usize)?;
    if &**name == "__class__" {
        return None;
    }
    let attr = class.lookup(name)?;
    let fast = match (instr.opcode, attr) {
        (Opcode::LoadAttr, value) => FastPath::ClassAttr { value },
        (Opcode::LoadMethod, function @ Value::Function(_)) => FastPath::Method { function },
        _ => return None,
    };
    watch_hierarchy(plan, registry, class);
    Some(GuardedSpecialization::new(
        fast,
        [
            Guard::ClassUnchanged {
                slot: 0,
                class: class.id,
                version: class.version(),
            },
            Guard::CodeValid,
        ],
    ))
}

fn watch_hierarchy(plan: &mut SpecializationPlan, registry: &InvalidationRegistry, class: &Class) {
    plan.watch(registry, class.id);
    for base in &class.bases {
        watch_hierarchy(plan, registry, base);
    }
}

// =============================================================================
// Guarded Execution
// =============================================================================

/// Work a fast path committed to after peeking at the stack.
enum Prepared {
    /// Pop `pop` operands and push `value`.
    Replace { pop: usize, value: Value },
    /// Replace the receiver with `[function, receiver]`.
    Method(Value),
    /// Pop the condition; it went the predicted way.
    Branch(bool),
    CallNative,
    CallFunction,
}

fn illegal(err: IllegalTransition) -> RuntimeError {
    RuntimeError::internal(err.to_string())
}

/// Execute one planned instruction.
///
/// Guards and the fast path's preparation only peek at the stack. If either
/// declines, the stack is exactly what the baseline handler expects and it
/// runs instead.
pub(crate) fn run_site(
    vm: &mut Vm,
    frame: &mut Frame,
    site: &GuardedSpecialization,
    valid: &AtomicBool,
    opcode: Opcode,
    arg: u32,
) -> VmResult<ControlFlow> {
    let state = GuardState::Eligible
        .advance(GuardState::Checking)
        .map_err(illegal)?;

    let prepared = if site.check(&frame.stack, valid) {
        prepare(&site.fast, frame, arg)
    } else {
        Err(BailoutReason::GuardFailed)
    };

    match prepared {
        Ok(prepared) => {
            let state = state.advance(GuardState::FastPath).map_err(illegal)?;
            let flow = commit(vm, frame, prepared, opcode, arg)?;
            state.advance(GuardState::Done).map_err(illegal)?;
            vm.stats.fast_hits += 1;
            Ok(flow)
        }
        Err(reason) => {
            let state = state
                .advance(GuardState::Bailout)
                .and_then(|s| s.advance(GuardState::SafePathRunning))
                .map_err(illegal)?;
            vm.stats.bailouts.record(reason);
            if reason == BailoutReason::FastPathDeclined {
                vm.observe_decline(frame);
            }
            trace!(
                code = %frame.code.name,
                offset = frame.last_offset,
                %opcode,
                reason = reason.as_str(),
                "bailout"
            );
            let flow = handler(opcode)(vm, frame, arg)?;
            state.advance(GuardState::Done).map_err(illegal)?;
            Ok(flow)
        }
    }
}

fn prepare(fast: &FastPath, frame: &Frame, arg: u32) -> Result<Prepared, BailoutReason> {
    let peek = |depth: usize| frame.peek(depth).map_err(|_| BailoutReason::GuardFailed);
    match fast {
        FastPath::Operator(func) => {
            let value = func(peek(1)?, peek(0)?).ok_or(BailoutReason::FastPathDeclined)?;
            Ok(Prepared::Replace { pop: 2, value })
        }
        FastPath::ClassAttr { value } | FastPath::Method { function: value } => {
            let receiver = peek(0)?;
            let Value::Instance(inst) = receiver else {
                return Err(BailoutReason::GuardFailed);
            };
            let name = frame.name(arg).map_err(|_| BailoutReason::GuardFailed)?;
            if inst.attrs.borrow().contains_key(&name) {
                return Err(BailoutReason::FastPathDeclined);
            }
            match fast {
                FastPath::Method { .. } => Ok(Prepared::Method(value.clone())),
                _ => Ok(Prepared::Replace {
                    pop: 1,
                    value: bind(receiver, value.clone()),
                }),
            }
        }
        FastPath::Branch { likely } => {
            if peek(0)?.truthy() == *likely {
                Ok(Prepared::Branch(*likely))
            } else {
                Err(BailoutReason::UnlikelyBranch)
            }
        }
        FastPath::CallNative => match peek(call_nargs(arg) as usize)? {
            Value::Builtin(_) => Ok(Prepared::CallNative),
            _ => Err(BailoutReason::GuardFailed),
        },
        FastPath::CallFunction => match peek(call_nargs(arg) as usize)? {
            Value::Function(func) if func.is_simple_call(call_nargs(arg) as usize) => {
                Ok(Prepared::CallFunction)
            }
            _ => Err(BailoutReason::FastPathDeclined),
        },
    }
}

fn commit(
    vm: &mut Vm,
    frame: &mut Frame,
    prepared: Prepared,
    opcode: Opcode,
    arg: u32,
) -> VmResult<ControlFlow> {
    match prepared {
        Prepared::Replace { pop, value } => {
            let len = frame.stack.len();
            frame.stack.truncate(len - pop);
            frame.push(value);
            Ok(ControlFlow::Continue)
        }
        Prepared::Method(function) => {
            let receiver = frame.pop()?;
            frame.push(function);
            frame.push(receiver);
            Ok(ControlFlow::Continue)
        }
        Prepared::Branch(condition) => {
            frame.pop()?;
            let jump_when = opcode == Opcode::PopJumpIfTrue;
            if condition == jump_when {
                Ok(ControlFlow::Jump(arg))
            } else {
                Ok(ControlFlow::Continue)
            }
        }
        Prepared::CallNative => {
            let args = frame.pop_n(call_nargs(arg) as usize)?;
            let Value::Builtin(builtin) = frame.pop()? else {
                return Err(RuntimeError::internal("native call site lost its callee"));
            };
            let ctx = CallContext::new(&frame.globals, frame.locals.as_ref());
            let result = (builtin.func)(vm, &ctx, args)?;
            frame.push(result);
            Ok(ControlFlow::Continue)
        }
        Prepared::CallFunction => {
            let args = frame.pop_n(call_nargs(arg) as usize)?;
            let Value::Function(func) = frame.pop()? else {
                return Err(RuntimeError::internal("function call site lost its callee"));
            };
            Ok(ControlFlow::Call(Box::new(Frame::for_simple_call(&func, args))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::MIN_BRANCH_SAMPLES;
    use crate::feedback::CallTarget;
    use kite_compiler::{CodeFlags, Constant, encode};
    use rustc_hash::FxHashMap;
    use std::sync::Arc;

    fn code(instrs: &[(Opcode, u32)], names: &[&str]) -> CompiledCode {
        let mut bytecode = Vec::new();
        for &(op, arg) in instrs {
            encode(op, arg, &mut bytecode);
        }
        CompiledCode {
            id: CodeId::fresh(),
            name: Arc::from("f"),
            filename: Arc::from("<test>"),
            bytecode: bytecode.into_boxed_slice(),
            constants: vec![Constant::None].into_boxed_slice(),
            names: names.iter().map(|n| Arc::from(*n)).collect(),
            varnames: Box::new([]),
            freevars: Box::new([]),
            cellvars: Box::new([]),
            argcount: 0,
            max_stack_depth: 4,
            flags: CodeFlags::NONE,
            lnotab: Box::new([]),
            first_line: 1,
        }
    }

    #[test]
    fn test_monomorphic_operands_get_a_site() {
        let code = code(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::LoadConst, 0),
                (Opcode::BinaryAdd, 0),
                (Opcode::ReturnValue, 0),
            ],
            &[],
        );
        let add_offset = 6;
        let mut profile = CodeProfile::default();
        profile.record_operands(add_offset, TypeTag::Int, TypeTag::Int);
        let registry = InvalidationRegistry::new();
        let plan = build_plan(&code, &profile, &registry);
        let site = &plan.sites[&add_offset];
        assert!(matches!(site.fast, FastPath::Operator(_)));
        assert_eq!(site.guards.len(), 2);
        assert!(plan.is_valid());
    }

    #[test]
    fn test_declined_site_stays_baseline() {
        let code = code(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::LoadConst, 0),
                (Opcode::BinaryAdd, 0),
                (Opcode::ReturnValue, 0),
            ],
            &[],
        );
        let mut profile = CodeProfile::default();
        profile.record_operands(6, TypeTag::Int, TypeTag::Int);
        profile.record_decline(6);
        let plan = build_plan(&code, &profile, &InvalidationRegistry::new());
        assert!(plan.sites.is_empty());
    }

    #[test]
    fn test_polymorphic_site_stays_baseline() {
        let code = code(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::LoadConst, 0),
                (Opcode::BinaryAdd, 0),
                (Opcode::ReturnValue, 0),
            ],
            &[],
        );
        let mut profile = CodeProfile::default();
        profile.record_operands(6, TypeTag::Int, TypeTag::Int);
        profile.record_operands(6, TypeTag::Float, TypeTag::Float);
        let plan = build_plan(&code, &profile, &InvalidationRegistry::new());
        assert!(plan.sites.is_empty());
    }

    #[test]
    fn test_call_site_registers_watcher() {
        let code = code(
            &[
                (Opcode::LoadGlobal, 0),
                (Opcode::CallFunction, 0),
                (Opcode::ReturnValue, 0),
            ],
            &["f"],
        );
        let target = CallTarget {
            id: ObjectId::fresh(),
            kind: CalleeKind::Native,
        };
        let mut profile = CodeProfile::default();
        profile.record_call(3, target);
        let registry = InvalidationRegistry::new();
        let plan = build_plan(&code, &profile, &registry);
        assert!(matches!(plan.sites[&3].fast, FastPath::CallNative));
        assert!(registry.is_watching(target.id, code.id));

        plan.release(&registry);
        assert!(!registry.is_watching(target.id, code.id));
    }

    #[test]
    fn test_attr_site_watches_bases() {
        let base = Class::new("Base".into(), vec![], FxHashMap::default());
        base.store("x".into(), Value::Int(1));
        let class = Class::new("C".into(), vec![base.clone()], FxHashMap::default());
        let code = code(
            &[
                (Opcode::LoadName, 0),
                (Opcode::LoadAttr, 1),
                (Opcode::ReturnValue, 0),
            ],
            &["obj", "x"],
        );
        let mut profile = CodeProfile::default();
        profile.record_attr(3, &class);
        let registry = InvalidationRegistry::new();
        let plan = build_plan(&code, &profile, &registry);
        assert!(matches!(plan.sites[&3].fast, FastPath::ClassAttr { .. }));
        assert!(registry.is_watching(base.id, code.id));

        registry.on_object_mutated(base.id, crate::invalidation::InvalidationReason::Manual);
        assert!(!plan.is_valid());
    }

    #[test]
    fn test_branch_sites_and_stats() {
        let code = code(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::PopJumpIfFalse, 0),
                (Opcode::LoadConst, 0),
                (Opcode::PopJumpIfTrue, 0),
                (Opcode::LoadConst, 0),
                (Opcode::ReturnValue, 0),
            ],
            &[],
        );
        let mut profile = CodeProfile::default();
        for _ in 0..=MIN_BRANCH_SAMPLES {
            profile.record_branch(3, true);
        }
        profile.record_branch(9, true);
        let plan = build_plan(&code, &profile, &InvalidationRegistry::new());
        assert!(matches!(
            plan.sites[&3].fast,
            FastPath::Branch { likely: true }
        ));
        assert!(!plan.sites.contains_key(&9));
        assert_eq!(plan.branch_stats.total, 2);
        assert_eq!(plan.branch_stats.optimized, 1);
        assert_eq!(plan.branch_stats.not_enough_data, 1);
    }
}
