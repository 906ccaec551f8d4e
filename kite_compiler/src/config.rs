//! Compiler configuration.

use std::sync::Arc;

/// Hard limits enforced during compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum entries in any constants, names or locals table.
    pub max_table_entries: usize,
    /// Maximum assembled bytecode length in bytes.
    pub max_code_size: usize,
    /// Maximum statically nested loop/try/with blocks.
    pub max_nested_blocks: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_table_entries: 1 << 24,
            max_code_size: 1 << 28,
            max_nested_blocks: 20,
        }
    }
}

/// Compiler configuration.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// File name recorded in every code object.
    pub filename: Arc<str>,
    /// Strip `assert` statements and docstrings.
    pub optimize: bool,
    /// Resource limits.
    pub limits: Limits,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            filename: Arc::from("<string>"),
            optimize: false,
            limits: Limits::default(),
        }
    }
}

impl CompilerConfig {
    /// Default configuration for `filename`.
    pub fn new(filename: &str) -> Self {
        Self {
            filename: Arc::from(filename),
            ..Self::default()
        }
    }

    /// Configuration with asserts and docstrings stripped.
    pub fn optimized() -> Self {
        Self {
            optimize: true,
            ..Self::default()
        }
    }

    /// Small limits so tests can hit every resource error quickly.
    pub fn for_testing() -> Self {
        Self {
            filename: Arc::from("<test>"),
            optimize: false,
            limits: Limits {
                max_table_entries: 1024,
                max_code_size: 1 << 16,
                max_nested_blocks: 20,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CompilerConfig::default();
        assert_eq!(&*config.filename, "<string>");
        assert!(!config.optimize);
        assert_eq!(config.limits.max_nested_blocks, 20);
    }

    #[test]
    fn test_named_constructors() {
        assert!(CompilerConfig::optimized().optimize);
        assert_eq!(&*CompilerConfig::new("m.py").filename, "m.py");
        assert_eq!(CompilerConfig::for_testing().limits.max_table_entries, 1024);
    }
}
