//! The compiled code artifact.

use super::lnotab;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Code object property bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct CodeFlags(u32);

impl CodeFlags {
    /// No flags.
    pub const NONE: CodeFlags = CodeFlags(0);
    /// Locals live in fast slots rather than a namespace mapping.
    pub const OPTIMIZED: CodeFlags = CodeFlags(0x0001);
    /// A fresh locals namespace is created per call.
    pub const NEWLOCALS: CodeFlags = CodeFlags(0x0002);
    /// Takes `*args`.
    pub const VARARGS: CodeFlags = CodeFlags(0x0004);
    /// Takes `**kwargs`.
    pub const VARKEYWORDS: CodeFlags = CodeFlags(0x0008);
    /// Defined inside another function.
    pub const NESTED: CodeFlags = CodeFlags(0x0010);
    /// Calling returns a generator.
    pub const GENERATOR: CodeFlags = CodeFlags(0x0020);
    /// No free or cell variables.
    pub const NOFREE: CodeFlags = CodeFlags(0x0040);
    /// Uses the dynamic block stack (`try`, `with`).
    pub const BLOCKSTACK: CodeFlags = CodeFlags(0x0080);
    /// Contains an `exec` statement.
    pub const USES_EXEC: CodeFlags = CodeFlags(0x0100);

    /// Raw bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set.
    #[inline]
    pub const fn contains(self, other: CodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set or clear `other`.
    #[inline]
    pub fn set(&mut self, other: CodeFlags, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl BitOr for CodeFlags {
    type Output = CodeFlags;

    fn bitor(self, rhs: CodeFlags) -> CodeFlags {
        CodeFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for CodeFlags {
    fn bitor_assign(&mut self, rhs: CodeFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for CodeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(CodeFlags, &str); 9] = [
            (CodeFlags::OPTIMIZED, "OPTIMIZED"),
            (CodeFlags::NEWLOCALS, "NEWLOCALS"),
            (CodeFlags::VARARGS, "VARARGS"),
            (CodeFlags::VARKEYWORDS, "VARKEYWORDS"),
            (CodeFlags::NESTED, "NESTED"),
            (CodeFlags::GENERATOR, "GENERATOR"),
            (CodeFlags::NOFREE, "NOFREE"),
            (CodeFlags::BLOCKSTACK, "BLOCKSTACK"),
            (CodeFlags::USES_EXEC, "USES_EXEC"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// Process-unique identity of a compiled code object.
///
/// Feedback and invalidation state are keyed by this rather than by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CodeId(pub u64);

impl CodeId {
    /// Allocate a fresh id.
    pub fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        CodeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code#{}", self.0)
    }
}

/// Entry of the constants table.
#[derive(Debug, Clone)]
pub enum Constant {
    /// `None`
    None,
    /// `True` / `False`
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// String.
    Str(Arc<str>),
    /// Tuple of constants.
    Tuple(Arc<[Constant]>),
    /// Nested code object.
    Code(Arc<CompiledCode>),
}

impl PartialEq for Constant {
    /// Identity-style equality: floats compare by bits and code by id, so the
    /// constants table never merges `0.0` with `-0.0`.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::None, Constant::None) => true,
            (Constant::Bool(a), Constant::Bool(b)) => a == b,
            (Constant::Int(a), Constant::Int(b)) => a == b,
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (Constant::Str(a), Constant::Str(b)) => a == b,
            (Constant::Tuple(a), Constant::Tuple(b)) => a == b,
            (Constant::Code(a), Constant::Code(b)) => a.id == b.id,
            _ => false,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::None => f.write_str("None"),
            Constant::Bool(true) => f.write_str("True"),
            Constant::Bool(false) => f.write_str("False"),
            Constant::Int(i) => write!(f, "{i}"),
            Constant::Float(x) => write!(f, "{x:?}"),
            Constant::Str(s) => write!(f, "{s:?}"),
            Constant::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Constant::Code(code) => write!(f, "<code {}>", code.name),
        }
    }
}

/// Immutable result of assembling one compilation unit.
#[derive(Debug, Clone)]
pub struct CompiledCode {
    /// Unique identity.
    pub id: CodeId,
    /// Function, class or pseudo name (`<module>`, `<lambda>`, `<genexpr>`).
    pub name: Arc<str>,
    /// Source file name.
    pub filename: Arc<str>,
    /// Encoded instructions.
    pub bytecode: Box<[u8]>,
    /// Constants table.
    pub constants: Box<[Constant]>,
    /// Attribute and global names.
    pub names: Box<[Arc<str>]>,
    /// Fast local names; arguments first.
    pub varnames: Box<[Arc<str>]>,
    /// Variables captured from enclosing scopes.
    pub freevars: Box<[Arc<str>]>,
    /// Locals captured by nested scopes.
    pub cellvars: Box<[Arc<str>]>,
    /// Positional parameter count.
    pub argcount: u32,
    /// Operand stack slots required.
    pub max_stack_depth: u32,
    /// Property bits.
    pub flags: CodeFlags,
    /// Compressed line table.
    pub lnotab: Box<[u8]>,
    /// Line of the definition.
    pub first_line: u32,
}

impl CompiledCode {
    /// Source line in effect at `offset`.
    pub fn line_for_offset(&self, offset: u32) -> u32 {
        lnotab::line_for_offset(&self.lnotab, self.first_line, offset)
    }

    /// Number of fast local slots.
    #[inline]
    pub fn nlocals(&self) -> usize {
        self.varnames.len()
    }

    /// Number of cell plus free slots.
    #[inline]
    pub fn ncells(&self) -> usize {
        self.cellvars.len() + self.freevars.len()
    }

    /// Whether calling this code creates a generator.
    #[inline]
    pub fn is_generator(&self) -> bool {
        self.flags.contains(CodeFlags::GENERATOR)
    }

    /// Nested code objects in constant order.
    pub fn nested(&self) -> impl Iterator<Item = &Arc<CompiledCode>> {
        self.constants.iter().filter_map(|c| match c {
            Constant::Code(code) => Some(code),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_ops() {
        let mut flags = CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS;
        assert!(flags.contains(CodeFlags::OPTIMIZED));
        assert!(!flags.contains(CodeFlags::GENERATOR));
        flags.set(CodeFlags::GENERATOR, true);
        flags.set(CodeFlags::OPTIMIZED, false);
        assert_eq!(flags, CodeFlags::NEWLOCALS | CodeFlags::GENERATOR);
        assert_eq!(flags.to_string(), "NEWLOCALS | GENERATOR");
        assert_eq!(CodeFlags::NONE.to_string(), "NONE");
    }

    #[test]
    fn test_float_constants_distinguish_signed_zero() {
        assert_ne!(Constant::Float(0.0), Constant::Float(-0.0));
        assert_eq!(Constant::Float(1.5), Constant::Float(1.5));
        assert_ne!(Constant::Int(0), Constant::Bool(false));
    }

    #[test]
    fn test_code_ids_unique() {
        assert_ne!(CodeId::fresh(), CodeId::fresh());
    }

    #[test]
    fn test_constant_display() {
        let t = Constant::Tuple(Arc::from(vec![Constant::Int(1)]));
        assert_eq!(t.to_string(), "(1,)");
        assert_eq!(Constant::Str(Arc::from("a")).to_string(), "\"a\"");
    }
}
