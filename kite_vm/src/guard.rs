//! Guards, fast paths and the per-opcode guard state machine.
//!
//! A guarded specialization is a fast path plus the cheap checks that must
//! hold for it to produce exactly what the baseline handler would. Guards
//! only *peek* at the operand stack, so a failed check leaves the stack as
//! the safe path expects it.
//!
//! ```text
//! Eligible ──► Checking ──┬──► FastPath ───────────────────► Done
//!                         └──► Bailout ──► SafePathRunning ──► Done
//! ```

use crate::optimized_ops::OperatorFn;
use crate::value::{ObjectId, TypeTag, Value};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

// =============================================================================
// Guards
// =============================================================================

/// One cheap check. `slot` counts down from the top of the operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// The operand has this type.
    TypeIs { slot: u8, ty: TypeTag },
    /// The operand is this exact object.
    CalleeIs { slot: u8, id: ObjectId },
    /// The operand is an instance of `class`, and `class` has not been
    /// mutated since the plan was built.
    ClassUnchanged {
        slot: u8,
        class: ObjectId,
        version: u64,
    },
    /// The owning plan has not been invalidated.
    CodeValid,
}

impl Guard {
    /// Evaluate against `stack` without modifying it.
    #[inline]
    pub fn check(&self, stack: &[Value], valid: &AtomicBool) -> bool {
        match *self {
            Guard::TypeIs { slot, ty } => peek(stack, slot).is_some_and(|v| v.type_tag() == ty),
            Guard::CalleeIs { slot, id } => {
                peek(stack, slot).is_some_and(|v| v.object_id() == Some(id))
            }
            Guard::ClassUnchanged {
                slot,
                class,
                version,
            } => matches!(
                peek(stack, slot),
                Some(Value::Instance(inst))
                    if inst.class.id == class && inst.class.version() == version
            ),
            Guard::CodeValid => valid.load(Ordering::Acquire),
        }
    }
}

#[inline]
fn peek(stack: &[Value], slot: u8) -> Option<&Value> {
    stack.len().checked_sub(1 + usize::from(slot)).map(|i| &stack[i])
}

// =============================================================================
// Fast Paths
// =============================================================================

/// Specialized implementation of one instruction.
#[derive(Clone)]
pub enum FastPath {
    /// Native operator from the optimized-op table (binary, in-place, compare).
    Operator(OperatorFn),
    /// Direct call of a builtin, skipping callee dispatch.
    CallNative,
    /// Direct call of a simple Python function, skipping argument binding.
    CallFunction,
    /// Cached class attribute for `LOAD_ATTR` on an instance.
    ClassAttr { value: Value },
    /// Cached method for `LOAD_METHOD` on an instance.
    Method { function: Value },
    /// Predicted direction of a `POP_JUMP_IF_*`.
    Branch { likely: bool },
}

impl fmt::Debug for FastPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FastPath::Operator(_) => f.write_str("Operator"),
            FastPath::CallNative => f.write_str("CallNative"),
            FastPath::CallFunction => f.write_str("CallFunction"),
            FastPath::ClassAttr { value } => write!(f, "ClassAttr({value:?})"),
            FastPath::Method { function } => write!(f, "Method({function:?})"),
            FastPath::Branch { likely } => write!(f, "Branch(likely={likely})"),
        }
    }
}

/// A fast path with the guards that make it safe.
#[derive(Debug, Clone)]
pub struct GuardedSpecialization {
    pub fast: FastPath,
    pub guards: SmallVec<[Guard; 2]>,
}

impl GuardedSpecialization {
    pub fn new(fast: FastPath, guards: impl IntoIterator<Item = Guard>) -> Self {
        Self {
            fast,
            guards: guards.into_iter().collect(),
        }
    }

    /// Whether every guard holds.
    #[inline]
    pub fn check(&self, stack: &[Value], valid: &AtomicBool) -> bool {
        self.guards.iter().all(|g| g.check(stack, valid))
    }
}

// =============================================================================
// State Machine
// =============================================================================

/// Progress of one guarded opcode execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Eligible,
    Checking,
    FastPath,
    Bailout,
    SafePathRunning,
    Done,
}

/// A transition the protocol does not allow.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal guard transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: GuardState,
    pub to: GuardState,
}

impl GuardState {
    /// Whether `self → next` is allowed.
    pub const fn can_advance(self, next: GuardState) -> bool {
        use GuardState::*;
        matches!(
            (self, next),
            (Eligible, Checking)
                | (Checking, FastPath)
                | (Checking, Bailout)
                | (FastPath, Done)
                | (Bailout, SafePathRunning)
                | (SafePathRunning, Done)
        )
    }

    /// Move to `next`, rejecting illegal transitions.
    #[inline]
    pub fn advance(self, next: GuardState) -> Result<GuardState, IllegalTransition> {
        if self.can_advance(next) {
            Ok(next)
        } else {
            Err(IllegalTransition {
                from: self,
                to: next,
            })
        }
    }
}

// =============================================================================
// Bailouts
// =============================================================================

/// Why a guarded opcode fell back to its baseline handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BailoutReason {
    /// A guard check failed.
    GuardFailed = 0,
    /// Guards held but the fast path declined while still peeking
    /// (overflow, shadowing instance attribute).
    FastPathDeclined = 1,
    /// A predicted branch went the unlikely way.
    UnlikelyBranch = 2,
}

impl BailoutReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            BailoutReason::GuardFailed => "GuardFailed",
            BailoutReason::FastPathDeclined => "FastPathDeclined",
            BailoutReason::UnlikelyBranch => "UnlikelyBranch",
        }
    }
}

/// Bailout counts, total and per reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BailoutCounter {
    pub total: u64,
    pub by_reason: [u64; 3],
}

impl BailoutCounter {
    pub fn record(&mut self, reason: BailoutReason) {
        self.total += 1;
        self.by_reason[reason as usize] += 1;
    }

    #[inline]
    pub fn count(&self, reason: BailoutReason) -> u64 {
        self.by_reason[reason as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Class, Instance};
    use rustc_hash::FxHashMap;
    use std::rc::Rc;

    // -------------------------------------------------------------------------
    // State Machine
    // -------------------------------------------------------------------------

    #[test]
    fn test_fast_path_sequence() {
        let s = GuardState::Eligible
            .advance(GuardState::Checking)
            .and_then(|s| s.advance(GuardState::FastPath))
            .and_then(|s| s.advance(GuardState::Done));
        assert_eq!(s, Ok(GuardState::Done));
    }

    #[test]
    fn test_bailout_sequence() {
        let s = GuardState::Eligible
            .advance(GuardState::Checking)
            .and_then(|s| s.advance(GuardState::Bailout))
            .and_then(|s| s.advance(GuardState::SafePathRunning))
            .and_then(|s| s.advance(GuardState::Done));
        assert_eq!(s, Ok(GuardState::Done));
    }

    #[test]
    fn test_illegal_transitions() {
        for (from, to) in [
            (GuardState::Eligible, GuardState::FastPath),
            (GuardState::Checking, GuardState::Done),
            (GuardState::FastPath, GuardState::Bailout),
            (GuardState::Bailout, GuardState::Done),
            (GuardState::SafePathRunning, GuardState::FastPath),
            (GuardState::Done, GuardState::Checking),
        ] {
            assert_eq!(from.advance(to), Err(IllegalTransition { from, to }));
        }
    }

    // -------------------------------------------------------------------------
    // Guards
    // -------------------------------------------------------------------------

    #[test]
    fn test_type_guard_peeks_by_slot() {
        let stack = vec![Value::Int(1), Value::Float(2.0)];
        let valid = AtomicBool::new(true);
        let lhs = Guard::TypeIs {
            slot: 1,
            ty: TypeTag::Int,
        };
        let rhs = Guard::TypeIs {
            slot: 0,
            ty: TypeTag::Int,
        };
        assert!(lhs.check(&stack, &valid));
        assert!(!rhs.check(&stack, &valid));
        let deep = Guard::TypeIs {
            slot: 5,
            ty: TypeTag::Int,
        };
        assert!(!deep.check(&stack, &valid));
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn test_class_guard_sees_mutation() {
        let class = Class::new("C".into(), vec![], FxHashMap::default());
        let stack = vec![Value::Instance(Instance::new(class.clone()))];
        let valid = AtomicBool::new(true);
        let guard = Guard::ClassUnchanged {
            slot: 0,
            class: class.id,
            version: class.version(),
        };
        assert!(guard.check(&stack, &valid));
        class.store("x".into(), Value::None);
        assert!(!guard.check(&stack, &valid));
    }

    #[test]
    fn test_code_valid_guard() {
        let valid = AtomicBool::new(true);
        let spec = GuardedSpecialization::new(FastPath::Branch { likely: true }, [Guard::CodeValid]);
        assert!(spec.check(&[], &valid));
        valid.store(false, Ordering::Release);
        assert!(!spec.check(&[], &valid));
    }

    #[test]
    fn test_callee_guard() {
        let class = Class::new("C".into(), vec![], FxHashMap::default());
        let valid = AtomicBool::new(true);
        let stack = vec![Value::Class(Rc::clone(&class)), Value::Int(3)];
        let hit = Guard::CalleeIs {
            slot: 1,
            id: class.id,
        };
        let miss = Guard::CalleeIs {
            slot: 1,
            id: ObjectId::fresh(),
        };
        assert!(hit.check(&stack, &valid));
        assert!(!miss.check(&stack, &valid));
    }

    #[test]
    fn test_bailout_counter() {
        let mut c = BailoutCounter::default();
        c.record(BailoutReason::GuardFailed);
        c.record(BailoutReason::UnlikelyBranch);
        c.record(BailoutReason::GuardFailed);
        assert_eq!(c.total, 3);
        assert_eq!(c.count(BailoutReason::GuardFailed), 2);
        assert_eq!(BailoutReason::FastPathDeclined.as_str(), "FastPathDeclined");
    }
}
