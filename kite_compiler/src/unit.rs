//! Per-scope compilation state.
//!
//! A [`CompilationUnit`] owns everything needed to assemble one code object:
//! the block graph, the constant and name tables, the frame-block stack used
//! by `break`/`continue`, and the pending source line.

use crate::bytecode::block::{BlockGraph, BlockId};
use crate::bytecode::code::{CodeFlags, CodeId, Constant};
use crate::bytecode::instruction::Instr;
use crate::bytecode::opcode::Opcode;
use crate::error::{CompileError, CompileResult};
use crate::symtable::{Scope, ScopeId, ScopeKind};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;

// =============================================================================
// Tables
// =============================================================================

/// Deduplication key for constants. Distinguishes kinds so that `0`, `0.0`,
/// `-0.0` and `False` occupy separate slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstantKey {
    None,
    Bool(bool),
    Int(i64),
    /// Float bits for exact comparison.
    Float(u64),
    Str(Arc<str>),
    Tuple(Box<[ConstantKey]>),
    Code(CodeId),
}

impl ConstantKey {
    fn from_constant(value: &Constant) -> Self {
        match value {
            Constant::None => ConstantKey::None,
            Constant::Bool(b) => ConstantKey::Bool(*b),
            Constant::Int(i) => ConstantKey::Int(*i),
            Constant::Float(f) => ConstantKey::Float(f.to_bits()),
            Constant::Str(s) => ConstantKey::Str(s.clone()),
            Constant::Tuple(items) => {
                ConstantKey::Tuple(items.iter().map(ConstantKey::from_constant).collect())
            }
            Constant::Code(code) => ConstantKey::Code(code.id),
        }
    }
}

/// Insertion-ordered name table.
#[derive(Debug, Clone, Default)]
pub struct NameTable {
    names: Vec<Arc<str>>,
    index: FxHashMap<Arc<str>, u32>,
}

impl NameTable {
    /// Table pre-populated with `names` in order.
    pub fn from_names(names: impl IntoIterator<Item = Arc<str>>) -> Self {
        let mut table = Self::default();
        for name in names {
            table.add(&name);
        }
        table
    }

    /// Index of `name`, inserting it if absent.
    pub fn add(&mut self, name: &str) -> u32 {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.names.len() as u32;
        let name: Arc<str> = Arc::from(name);
        self.names.push(name.clone());
        self.index.insert(name, idx);
        idx
    }

    /// Index of `name`, if present.
    pub fn get(&self, name: &str) -> Option<u32> {
        self.index.get(name).copied()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Names in index order.
    pub fn names(&self) -> &[Arc<str>] {
        &self.names
    }

    /// Consume into the final table.
    pub fn into_boxed(self) -> Box<[Arc<str>]> {
        self.names.into_boxed_slice()
    }
}

// =============================================================================
// Frame Blocks
// =============================================================================

/// Kind of statically nested block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameBlockKind {
    /// Body of a `while` loop.
    WhileLoop,
    /// Body of a `for` loop; the iterator is on the stack.
    ForLoop,
    /// Body of `try ... except`.
    Except,
    /// Body of `try ... finally`.
    FinallyTry,
    /// The `finally` clause itself.
    FinallyEnd,
}

impl FrameBlockKind {
    /// Whether `break`/`continue` may target this block.
    #[inline]
    pub const fn is_loop(self) -> bool {
        matches!(self, FrameBlockKind::WhileLoop | FrameBlockKind::ForLoop)
    }
}

/// One entry of the frame-block stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBlock {
    /// Kind.
    pub kind: FrameBlockKind,
    /// Loop head or protected body block.
    pub block: BlockId,
    /// Loop exit, for `break` without the dynamic block stack.
    pub exit: Option<BlockId>,
}

// =============================================================================
// Compilation Unit
// =============================================================================

/// Compilation state for one scope.
#[derive(Debug)]
pub struct CompilationUnit {
    /// Object name.
    pub name: Arc<str>,
    /// Symbol-table scope this unit compiles.
    pub scope: ScopeId,
    /// Block kind.
    pub kind: ScopeKind,
    /// Flags known from scope analysis; the assembler adds the rest.
    pub flags: CodeFlags,
    /// Blocks.
    pub graph: BlockGraph,
    constants: Vec<Constant>,
    constant_map: FxHashMap<ConstantKey, u32>,
    /// Global and attribute names.
    pub names: NameTable,
    /// Fast locals, parameters first.
    pub varnames: NameTable,
    /// Cell variables.
    pub cellvars: NameTable,
    /// Free variables.
    pub freevars: NameTable,
    /// Positional parameter count.
    pub argcount: u32,
    fblocks: SmallVec<[FrameBlock; 8]>,
    max_fblocks: usize,
    lineno: u32,
    lineno_set: bool,
    /// An `exec` statement was compiled.
    pub uses_exec: bool,
    tmpname: u32,
    /// Line of the definition.
    pub first_line: u32,
}

impl CompilationUnit {
    /// Unit for `scope`, with the tables the scope analysis determines.
    pub fn new(scope_id: ScopeId, scope: &Scope, first_line: u32, max_fblocks: usize) -> Self {
        let mut flags = CodeFlags::NONE;
        if scope.kind != ScopeKind::Module {
            flags |= CodeFlags::NEWLOCALS;
        }
        if scope.kind.is_function() {
            flags.set(CodeFlags::OPTIMIZED, !scope.unoptimized);
            flags.set(CodeFlags::NESTED, scope.nested);
        }
        flags.set(CodeFlags::GENERATOR, scope.generator);
        flags.set(CodeFlags::VARARGS, scope.varargs);
        flags.set(CodeFlags::VARKEYWORDS, scope.varkeywords);
        flags.set(CodeFlags::BLOCKSTACK, scope.blockstack);

        let positional = scope.params.len()
            - usize::from(scope.varargs)
            - usize::from(scope.varkeywords);

        Self {
            name: scope.name.clone(),
            scope: scope_id,
            kind: scope.kind,
            flags,
            graph: BlockGraph::new(),
            constants: Vec::new(),
            constant_map: FxHashMap::default(),
            names: NameTable::default(),
            varnames: NameTable::from_names(scope.params.iter().cloned()),
            cellvars: NameTable::from_names(scope.cellvars()),
            freevars: NameTable::from_names(scope.freevars()),
            argcount: positional as u32,
            fblocks: SmallVec::new(),
            max_fblocks,
            lineno: 0,
            lineno_set: false,
            uses_exec: false,
            tmpname: 0,
            first_line,
        }
    }

    /// Whether the scope uses the dynamic block stack.
    #[inline]
    pub fn has_blockstack(&self) -> bool {
        self.flags.contains(CodeFlags::BLOCKSTACK)
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn push(&mut self, mut instr: Instr) -> CompileResult<()> {
        if !self.lineno_set {
            instr.line = self.lineno;
            self.lineno_set = true;
        }
        self.graph.append(instr)
    }

    /// Emit an instruction without an argument.
    pub fn emit(&mut self, op: Opcode) -> CompileResult<()> {
        debug_assert!(!op.has_arg(), "{op} takes an argument");
        self.push(Instr::new(op))
    }

    /// Emit an instruction with an argument.
    pub fn emit_arg(&mut self, op: Opcode, arg: u32) -> CompileResult<()> {
        debug_assert!(op.has_arg() && !op.is_jump(), "{op} is not a plain argument opcode");
        self.push(Instr::with_arg(op, arg))
    }

    /// Emit a jump to `target`.
    pub fn emit_jump(&mut self, op: Opcode, target: BlockId) -> CompileResult<()> {
        debug_assert!(op.is_jump(), "{op} is not a jump");
        self.push(Instr::jump(op, target))
    }

    /// Add `value` to the constants table and emit `LOAD_CONST`.
    pub fn emit_const(&mut self, value: Constant) -> CompileResult<()> {
        let idx = self.add_const(value);
        self.emit_arg(Opcode::LoadConst, idx)
    }

    // =========================================================================
    // Lines
    // =========================================================================

    /// Start a statement at `line`: the next instruction carries it.
    pub fn set_line(&mut self, line: u32) {
        self.lineno = line;
        self.lineno_set = false;
    }

    /// An expression on `line`; only moves the line forward.
    pub fn update_line(&mut self, line: u32) {
        if line > self.lineno {
            self.set_line(line);
        }
    }

    /// Current line.
    #[inline]
    pub fn line(&self) -> u32 {
        self.lineno
    }

    // =========================================================================
    // Tables
    // =========================================================================

    /// Index of `value` in the constants table.
    pub fn add_const(&mut self, value: Constant) -> u32 {
        let key = ConstantKey::from_constant(&value);
        if let Some(&idx) = self.constant_map.get(&key) {
            return idx;
        }
        let idx = self.constants.len() as u32;
        self.constants.push(value);
        self.constant_map.insert(key, idx);
        idx
    }

    /// Constants in index order.
    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    pub(crate) fn take_constants(&mut self) -> Vec<Constant> {
        self.constant_map.clear();
        std::mem::take(&mut self.constants)
    }

    /// A fresh temporary name, `_[1]`, `_[2]`, ...
    pub fn new_tmpname(&mut self) -> String {
        self.tmpname += 1;
        format!("_[{}]", self.tmpname)
    }

    // =========================================================================
    // Frame-Block Stack
    // =========================================================================

    /// Enter a statically nested block.
    pub fn push_fblock(
        &mut self,
        kind: FrameBlockKind,
        block: BlockId,
        exit: Option<BlockId>,
    ) -> CompileResult<()> {
        if self.fblocks.len() >= self.max_fblocks {
            return Err(CompileError::syntax(
                "too many statically nested blocks",
                self.lineno,
            ));
        }
        self.fblocks.push(FrameBlock { kind, block, exit });
        Ok(())
    }

    /// Leave the innermost block, which must be `kind`.
    pub fn pop_fblock(&mut self, kind: FrameBlockKind) -> CompileResult<()> {
        match self.fblocks.pop() {
            Some(fb) if fb.kind == kind => Ok(()),
            other => Err(CompileError::internal(format!(
                "frame block mismatch: expected {kind:?}, found {other:?}"
            ))),
        }
    }

    /// Frame-block stack, innermost last.
    #[inline]
    pub fn fblocks(&self) -> &[FrameBlock] {
        &self.fblocks
    }

    /// Whether any enclosing block is a loop.
    pub fn in_loop(&self) -> bool {
        self.fblocks.iter().any(|fb| fb.kind.is_loop())
    }
}
