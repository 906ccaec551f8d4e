//! Interpreter configuration.

/// Configuration for a [`Vm`](crate::Vm).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Collect feedback and run guarded specializations.
    pub specialize: bool,
    /// Entries plus back-edges after which a code object gets a plan.
    ///
    /// Heat is a saturating `u16`; thresholds above `u16::MAX` are never met.
    pub hot_threshold: u32,
    /// Maximum nesting of calls before `RecursionLimit`.
    pub max_recursion_depth: usize,
    /// Validate every code object before its first execution.
    pub validate: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            specialize: true,
            hot_threshold: 100,
            max_recursion_depth: 1000,
            validate: true,
        }
    }
}

impl VmConfig {
    /// Config for tests: plans are built on first entry.
    pub fn for_testing() -> Self {
        Self {
            hot_threshold: 1,
            max_recursion_depth: 64,
            ..Self::default()
        }
    }

    /// Config that never specializes.
    pub fn baseline_only() -> Self {
        Self {
            specialize: false,
            ..Self::default()
        }
    }
}
