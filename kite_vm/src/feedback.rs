//! Runtime feedback collected by the baseline handlers.
//!
//! Feedback only gates fast paths; it never changes results.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  record   ┌──────────────┐  hot   ┌────────────────────┐
//! │ baseline handler │──────────►│ CodeProfile  │───────►│ SpecializationPlan │
//! │ (safe path)      │           │ (per offset) │        │ (guarded sites)    │
//! └──────────────────┘           └──────────────┘        └────────────────────┘
//! ```
//!
//! Each site keeps at most three distinct observations. A fourth freezes the
//! set and marks it overflowed, so a megamorphic site stops costing anything.
//! Offsets whose fast path declined are kept in an unbounded set; plans built
//! afterwards leave those sites on the baseline handler.

use crate::branch::BranchFeedback;
use crate::specialize::SpecializationPlan;
use crate::value::{Class, ObjectId, TypeTag};
use kite_compiler::CodeId;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::hash::Hash;
use std::rc::{Rc, Weak};

/// Distinct observations kept per site.
pub const FEEDBACK_CAPACITY: usize = 3;

// =============================================================================
// Counters and Sets
// =============================================================================

/// A `u16` counter that sticks at `u16::MAX`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaturatingCounter(u16);

impl SaturatingCounter {
    #[inline]
    pub const fn new() -> Self {
        Self(0)
    }

    #[inline]
    pub fn increment(&mut self) {
        self.0 = self.0.saturating_add(1);
    }

    #[inline]
    pub const fn get(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn is_saturated(self) -> bool {
        self.0 == u16::MAX
    }

    #[inline]
    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

/// Site stability, coarsest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stability<T> {
    /// Nothing observed yet.
    Unobserved,
    /// Exactly one observation; safe to speculate on.
    Monomorphic(T),
    /// Two or three observations.
    Polymorphic,
    /// Overflowed; never speculated on.
    Megamorphic,
}

impl<T> Stability<T> {
    /// Whether a guarded fast path may be built.
    #[inline]
    pub fn can_speculate(&self) -> bool {
        matches!(self, Stability::Monomorphic(_))
    }
}

/// Up to [`FEEDBACK_CAPACITY`] distinct observations in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedFeedback<T> {
    items: SmallVec<[T; FEEDBACK_CAPACITY]>,
    overflowed: bool,
}

impl<T> Default for BoundedFeedback<T> {
    fn default() -> Self {
        Self {
            items: SmallVec::new(),
            overflowed: false,
        }
    }
}

impl<T: Copy + PartialEq> BoundedFeedback<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value`. Duplicates are elided; once overflowed the set is
    /// frozen. Returns whether the set changed.
    pub fn add(&mut self, value: T) -> bool {
        if self.overflowed || self.items.contains(&value) {
            return false;
        }
        if self.items.len() == FEEDBACK_CAPACITY {
            self.overflowed = true;
        } else {
            self.items.push(value);
        }
        true
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    #[inline]
    pub fn contains(&self, value: &T) -> bool {
        self.items.contains(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// The single observation of a monomorphic site.
    #[inline]
    pub fn single(&self) -> Option<T> {
        match self.stability() {
            Stability::Monomorphic(value) => Some(value),
            _ => None,
        }
    }

    pub fn stability(&self) -> Stability<T> {
        if self.overflowed {
            return Stability::Megamorphic;
        }
        match self.items.as_slice() {
            [] => Stability::Unobserved,
            [only] => Stability::Monomorphic(*only),
            _ => Stability::Polymorphic,
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.overflowed = false;
    }
}

/// Every distinct observation, without a bound.
#[derive(Debug, Clone)]
pub struct UnboundedFeedback<T> {
    seen: FxHashSet<T>,
}

impl<T> Default for UnboundedFeedback<T> {
    fn default() -> Self {
        Self {
            seen: FxHashSet::default(),
        }
    }
}

impl<T: Eq + Hash> UnboundedFeedback<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value`; returns whether it was new.
    pub fn add(&mut self, value: T) -> bool {
        self.seen.insert(value)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    #[inline]
    pub fn contains(&self, value: &T) -> bool {
        self.seen.contains(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.seen.iter()
    }
}

// =============================================================================
// Site Feedback
// =============================================================================

/// What kind of object a call site invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalleeKind {
    Native,
    Function,
    Other,
}

/// Identity and kind of an observed callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallTarget {
    pub id: ObjectId,
    pub kind: CalleeKind,
}

/// Feedback for one instruction.
#[derive(Debug, Clone)]
pub enum SiteFeedback {
    /// Operand type pairs of a binary, in-place or compare opcode.
    Operands(BoundedFeedback<(TypeTag, TypeTag)>),
    /// Callees of a call opcode.
    Call(BoundedFeedback<CallTarget>),
    /// Receiver classes of an attribute or method load.
    Attr {
        classes: BoundedFeedback<ObjectId>,
        last: Weak<Class>,
    },
    /// Directions taken by a conditional branch.
    Branch(BranchFeedback),
}

/// Everything the VM knows about one code object.
#[derive(Debug, Default)]
pub struct CodeProfile {
    /// Entries plus back-edges since the last plan was discarded.
    pub heat: SaturatingCounter,
    /// Total entries.
    pub entries: SaturatingCounter,
    pub sites: FxHashMap<u32, SiteFeedback>,
    /// Offsets whose fast path declined at least once. Plans leave them on
    /// the baseline handler.
    pub declined: UnboundedFeedback<u32>,
    /// Set when feedback changed in a way the current plan does not reflect.
    pub changed: bool,
    pub plan: Option<Rc<SpecializationPlan>>,
}

impl CodeProfile {
    pub fn record_operands(&mut self, offset: u32, lhs: TypeTag, rhs: TypeTag) {
        match self
            .sites
            .entry(offset)
            .or_insert_with(|| SiteFeedback::Operands(BoundedFeedback::new()))
        {
            SiteFeedback::Operands(fb) => self.changed |= fb.add((lhs, rhs)),
            other => debug_assert!(false, "operand feedback at a {other:?} site"),
        }
    }

    pub fn record_call(&mut self, offset: u32, target: CallTarget) {
        if let SiteFeedback::Call(fb) = self
            .sites
            .entry(offset)
            .or_insert_with(|| SiteFeedback::Call(BoundedFeedback::new()))
        {
            self.changed |= fb.add(target);
        }
    }

    pub fn record_attr(&mut self, offset: u32, class: &Rc<Class>) {
        if let SiteFeedback::Attr { classes, last } =
            self.sites.entry(offset).or_insert_with(|| SiteFeedback::Attr {
                classes: BoundedFeedback::new(),
                last: Weak::new(),
            })
        {
            self.changed |= classes.add(class.id);
            *last = Rc::downgrade(class);
        }
    }

    /// A specialized site declined its fast path. Only the first decline at
    /// an offset asks for a new plan.
    pub fn record_decline(&mut self, offset: u32) {
        self.changed |= self.declined.add(offset);
    }

    pub fn record_branch(&mut self, offset: u32, taken: bool) {
        if let SiteFeedback::Branch(fb) = self
            .sites
            .entry(offset)
            .or_insert_with(|| SiteFeedback::Branch(BranchFeedback::default()))
        {
            let before = fb.predict();
            fb.record(taken);
            self.changed |= fb.predict() != before;
        }
    }
}

/// Profiles of every code object a VM has run.
#[derive(Debug, Default)]
pub struct FeedbackStore {
    profiles: FxHashMap<CodeId, CodeProfile>,
}

impl FeedbackStore {
    #[inline]
    pub fn profile(&self, code: CodeId) -> Option<&CodeProfile> {
        self.profiles.get(&code)
    }

    #[inline]
    pub fn profile_mut(&mut self, code: CodeId) -> &mut CodeProfile {
        self.profiles.entry(code).or_default()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // SaturatingCounter
    // -------------------------------------------------------------------------

    #[test]
    fn test_counter_saturates() {
        let mut c = SaturatingCounter::new();
        for _ in 0..70_000 {
            c.increment();
        }
        assert_eq!(c.get(), u16::MAX);
        assert!(c.is_saturated());
        c.increment();
        assert_eq!(c.get(), u16::MAX);
        c.reset();
        assert_eq!(c.get(), 0);
    }

    // -------------------------------------------------------------------------
    // BoundedFeedback
    // -------------------------------------------------------------------------

    #[test]
    fn test_bounded_elides_duplicates() {
        let mut fb = BoundedFeedback::new();
        fb.add(1);
        fb.add(1);
        fb.add(1);
        assert_eq!(fb.len(), 1);
        assert_eq!(fb.single(), Some(1));
        assert!(fb.stability().can_speculate());
    }

    #[test]
    fn test_bounded_overflow_freezes() {
        let mut fb = BoundedFeedback::new();
        for v in [3, 1, 2] {
            fb.add(v);
        }
        assert_eq!(fb.stability(), Stability::Polymorphic);
        assert!(!fb.overflowed());

        fb.add(4);
        assert!(fb.overflowed());
        assert_eq!(fb.iter().copied().collect::<Vec<_>>(), vec![3, 1, 2]);
        assert!(!fb.contains(&4));
        assert_eq!(fb.stability(), Stability::Megamorphic);

        fb.add(5);
        assert_eq!(fb.len(), 3);

        fb.clear();
        assert_eq!(fb.stability(), Stability::Unobserved);
    }

    #[test]
    fn test_unbounded_keeps_everything() {
        let mut fb = UnboundedFeedback::new();
        for v in 0..10 {
            assert!(fb.add(v));
        }
        assert!(!fb.add(3));
        assert_eq!(fb.len(), 10);
        assert!(fb.contains(&9));
    }

    // -------------------------------------------------------------------------
    // CodeProfile
    // -------------------------------------------------------------------------

    #[test]
    fn test_profile_records_per_offset() {
        let mut profile = CodeProfile::default();
        profile.record_operands(4, TypeTag::Int, TypeTag::Int);
        profile.record_operands(4, TypeTag::Int, TypeTag::Int);
        profile.record_operands(9, TypeTag::Int, TypeTag::Float);
        match &profile.sites[&4] {
            SiteFeedback::Operands(fb) => assert_eq!(fb.single(), Some((TypeTag::Int, TypeTag::Int))),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(profile.sites.len(), 2);
        assert!(profile.changed);
    }

    #[test]
    fn test_branch_change_on_prediction_only() {
        let mut profile = CodeProfile::default();
        for _ in 0..200 {
            profile.record_branch(7, true);
        }
        profile.changed = false;
        profile.record_branch(7, true);
        assert!(profile.changed, "201st sample makes the branch predictable");
        profile.changed = false;
        profile.record_branch(7, true);
        assert!(!profile.changed);
    }

    #[test]
    fn test_decline_marks_changed_once() {
        let mut profile = CodeProfile::default();
        profile.record_decline(12);
        assert!(profile.changed);
        profile.changed = false;
        profile.record_decline(12);
        assert!(!profile.changed);
        profile.record_decline(20);
        assert!(profile.changed);
        assert_eq!(profile.declined.len(), 2);
        assert!(profile.declined.contains(&12));
    }

    #[test]
    fn test_attr_feedback_tracks_last_class() {
        let class = Class::new("C".into(), vec![], FxHashMap::default());
        let mut profile = CodeProfile::default();
        profile.record_attr(0, &class);
        match &profile.sites[&0] {
            SiteFeedback::Attr { classes, last } => {
                assert_eq!(classes.single(), Some(class.id));
                assert!(last.upgrade().is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
