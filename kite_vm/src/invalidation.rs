//! Invalidation registry for guarded specializations.
//!
//! Specialized code that relies on an object staying the same (a class's
//! attributes, a callee's identity) registers a watcher for that object.
//! Mutating the object must go through [`InvalidationRegistry::on_object_mutated`]
//! *before* the mutation is applied; it clears the validity flag of every
//! dependent code so no fast path observes the half-updated object.
//!
//! # Architecture
//!
//! - **Watcher**: `(ObjectId, CodeId)` plus the code's shared validity flag
//! - **InvalidationRegistry**: `RwLock`-guarded map from objects to watchers
//!
//! Specialized code checks its flag (an `AtomicBool`) before running a fast
//! path, so invalidation is a single store per dependent.

use crate::value::ObjectId;
use kite_compiler::CodeId;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// Shared validity flag of one specialization plan.
pub type ValidityFlag = Arc<AtomicBool>;

/// Create a flag in the valid state.
#[inline]
pub fn new_validity_flag() -> ValidityFlag {
    Arc::new(AtomicBool::new(true))
}

// =============================================================================
// Invalidation Event
// =============================================================================

/// Why a watched object is being mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    /// A class attribute was stored.
    AttributeStored,
    /// A class attribute was deleted.
    AttributeDeleted,
    /// Manual invalidation requested.
    Manual,
}

// =============================================================================
// Registry
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Watchers currently registered.
    pub watchers: u64,
    /// Mutation notifications received.
    pub notifications: u64,
    /// Validity flags cleared.
    pub invalidated: u64,
}

/// Object-to-dependent-code map with register/unregister/notify as the only
/// mutation surface. Thread-safe via internal locking.
#[derive(Debug, Default)]
pub struct InvalidationRegistry {
    /// Dependents indexed by watched object.
    watchers: RwLock<FxHashMap<ObjectId, FxHashMap<CodeId, ValidityFlag>>>,
    watcher_count: AtomicU64,
    notification_count: AtomicU64,
    invalidated_count: AtomicU64,
}

impl InvalidationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `code` as depending on `object`. Re-registering replaces the
    /// previous flag.
    pub fn register_watcher(&self, object: ObjectId, code: CodeId, validity: &ValidityFlag) {
        let mut watchers = self.watchers.write();
        let previous = watchers
            .entry(object)
            .or_default()
            .insert(code, Arc::clone(validity));
        if previous.is_none() {
            self.watcher_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop the dependency of `code` on `object`. Returns whether one existed.
    pub fn unregister_watcher(&self, object: ObjectId, code: CodeId) -> bool {
        let mut watchers = self.watchers.write();
        let Some(dependents) = watchers.get_mut(&object) else {
            return false;
        };
        let removed = dependents.remove(&code).is_some();
        if dependents.is_empty() {
            watchers.remove(&object);
        }
        if removed {
            self.watcher_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Invalidate every code watching `object`. Must be called before the
    /// mutation is applied; returns the number of flags cleared.
    pub fn on_object_mutated(&self, object: ObjectId, reason: InvalidationReason) -> usize {
        self.notification_count.fetch_add(1, Ordering::Relaxed);
        let dependents = {
            let mut watchers = self.watchers.write();
            let Some(dependents) = watchers.remove(&object) else {
                return 0;
            };
            for flag in dependents.values() {
                flag.store(false, Ordering::Release);
            }
            dependents
        };

        let count = dependents.len();
        self.watcher_count
            .fetch_sub(count as u64, Ordering::Relaxed);
        self.invalidated_count
            .fetch_add(count as u64, Ordering::Relaxed);
        debug!(%object, ?reason, dependents = count, "invalidated dependent code");
        count
    }

    /// Number of codes watching `object`.
    pub fn watcher_count(&self, object: ObjectId) -> usize {
        self.watchers.read().get(&object).map_or(0, FxHashMap::len)
    }

    /// Whether `code` currently watches `object`.
    pub fn is_watching(&self, object: ObjectId, code: CodeId) -> bool {
        self.watchers
            .read()
            .get(&object)
            .is_some_and(|d| d.contains_key(&code))
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            watchers: self.watcher_count.load(Ordering::Relaxed),
            notifications: self.notification_count.load(Ordering::Relaxed),
            invalidated: self.invalidated_count.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ids() -> (ObjectId, CodeId, CodeId) {
        (ObjectId::fresh(), CodeId::fresh(), CodeId::fresh())
    }

    #[test]
    fn test_mutation_clears_all_dependents() {
        let registry = InvalidationRegistry::new();
        let (class, a, b) = ids();
        let (fa, fb) = (new_validity_flag(), new_validity_flag());
        registry.register_watcher(class, a, &fa);
        registry.register_watcher(class, b, &fb);
        assert_eq!(registry.watcher_count(class), 2);

        let cleared = registry.on_object_mutated(class, InvalidationReason::AttributeStored);
        assert_eq!(cleared, 2);
        assert!(!fa.load(Ordering::Acquire));
        assert!(!fb.load(Ordering::Acquire));
        assert_eq!(registry.watcher_count(class), 0);
        assert_eq!(registry.stats().invalidated, 2);
    }

    #[test]
    fn test_unwatched_mutation_is_noop() {
        let registry = InvalidationRegistry::new();
        let (class, code, _) = ids();
        let flag = new_validity_flag();
        registry.register_watcher(ObjectId::fresh(), code, &flag);
        assert_eq!(registry.on_object_mutated(class, InvalidationReason::Manual), 0);
        assert!(flag.load(Ordering::Acquire));
        assert_eq!(registry.stats().notifications, 1);
    }

    #[test]
    fn test_unregister() {
        let registry = InvalidationRegistry::new();
        let (class, code, other) = ids();
        let flag = new_validity_flag();
        registry.register_watcher(class, code, &flag);
        registry.register_watcher(class, code, &flag);
        assert_eq!(registry.stats().watchers, 1);
        assert!(registry.is_watching(class, code));

        assert!(!registry.unregister_watcher(class, other));
        assert!(registry.unregister_watcher(class, code));
        assert!(!registry.is_watching(class, code));
        assert_eq!(registry.on_object_mutated(class, InvalidationReason::AttributeDeleted), 0);
        assert!(flag.load(Ordering::Acquire));
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(InvalidationRegistry::new());
        let class = ObjectId::fresh();
        let flags: Vec<_> = (0..8).map(|_| new_validity_flag()).collect();
        let handles: Vec<_> = flags
            .iter()
            .cloned()
            .map(|flag| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.register_watcher(class, CodeId::fresh(), &flag))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.on_object_mutated(class, InvalidationReason::Manual), 8);
        assert!(flags.iter().all(|f| !f.load(Ordering::Acquire)));
    }
}
