//! Basic block graph.
//!
//! Blocks are stored in an arena owned by the compilation unit and referenced
//! by [`BlockId`]. A block has at most one fallthrough successor (`next`) and
//! any number of jump successors (the targets of its jump instructions).
//!
//! ```text
//!   entry ──next──▶ loop ──next──▶ anchor ──next──▶ end
//!                    ▲  │                             ▲
//!                    └──┘ JUMP_ABSOLUTE               │
//!                       └──── POP_JUMP_IF_FALSE ──────┘
//! ```
//!
//! Appending to a block that already ends in a terminator opens a fresh,
//! unlinked block, so statements after `return`/`break`/`raise` never end up
//! on a live path.

use super::instruction::Instr;
use crate::error::{CompileError, CompileResult};
use rustc_hash::FxHashSet;
use std::fmt;

/// Index of a block in its unit's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Arena index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// A straight-line run of instructions.
#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    /// Instructions in order.
    pub instrs: Vec<Instr>,
    /// Fallthrough successor.
    pub next: Option<BlockId>,
    /// Last instruction is `RETURN_VALUE`.
    pub return_terminated: bool,
    /// Byte offset; valid after the assembler's offset fixpoint.
    pub offset: u32,
    /// Stack depth on entry; valid after stack analysis.
    pub startdepth: i32,
    /// On the current stack-analysis path.
    pub seen: bool,
}

impl BasicBlock {
    /// Whether control cannot fall off the end of this block.
    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.instrs.last().is_some_and(|i| i.opcode.is_terminator())
    }

    /// Sum of encoded instruction sizes.
    #[inline]
    pub fn byte_size(&self) -> u32 {
        self.instrs.iter().map(Instr::size).sum()
    }
}

/// The blocks of one compilation unit.
#[derive(Debug, Clone, Default)]
pub struct BlockGraph {
    blocks: Vec<BasicBlock>,
    current: Option<BlockId>,
    entry: Option<BlockId>,
}

impl BlockGraph {
    /// Create an empty graph with no current block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh, unlinked block.
    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::default());
        if self.entry.is_none() {
            self.entry = Some(id);
        }
        id
    }

    /// Make `block` current, linking it as the fallthrough of the previous
    /// current block unless that block ends in a terminator.
    pub fn use_block(&mut self, block: BlockId) -> BlockId {
        if let Some(prev) = self.current {
            if prev != block && !self.blocks[prev.index()].is_terminated() {
                self.blocks[prev.index()].next = Some(block);
            }
        }
        self.current = Some(block);
        block
    }

    /// Allocate a block and make it current.
    pub fn next_block(&mut self) -> BlockId {
        let block = self.new_block();
        self.use_block(block)
    }

    /// The active block.
    #[inline]
    pub fn current(&self) -> Option<BlockId> {
        self.current
    }

    /// The first block allocated.
    #[inline]
    pub fn entry(&self) -> Option<BlockId> {
        self.entry
    }

    /// Append to the current block.
    ///
    /// Fails when no block has been opened. If the current block is already
    /// terminated, the instruction starts a new unreachable block instead.
    pub fn append(&mut self, instr: Instr) -> CompileResult<()> {
        let mut cur = self
            .current
            .ok_or_else(|| CompileError::internal("emit with no open block"))?;
        if self.blocks[cur.index()].is_terminated() {
            cur = self.new_block();
            self.current = Some(cur);
        }
        let block = &mut self.blocks[cur.index()];
        if instr.opcode == super::opcode::Opcode::ReturnValue {
            block.return_terminated = true;
        }
        block.instrs.push(instr);
        Ok(())
    }

    /// Borrow a block.
    #[inline]
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    /// Mutably borrow a block.
    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    /// Number of allocated blocks.
    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether no block was allocated.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Every successor of `id`: fallthrough first, then jump targets in
    /// instruction order.
    pub fn successors(&self, id: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        let block = self.block(id);
        block
            .next
            .into_iter()
            .chain(block.instrs.iter().filter_map(|i| i.target))
    }

    /// Blocks reachable from `entry` along fallthrough and jump edges.
    pub fn reachable(&self, entry: BlockId) -> FxHashSet<BlockId> {
        let mut seen = FxHashSet::default();
        let mut work = vec![entry];
        while let Some(b) = work.pop() {
            if seen.insert(b) {
                work.extend(self.successors(b));
            }
        }
        seen
    }

    /// Validate that every jump has a target in this graph.
    pub fn check_targets(&self) -> CompileResult<()> {
        for (idx, block) in self.blocks.iter().enumerate() {
            for instr in &block.instrs {
                match (instr.opcode.is_jump(), instr.target) {
                    (true, Some(t)) if t.index() < self.blocks.len() => {}
                    (true, _) => {
                        return Err(CompileError::internal(format!(
                            "{} in b{idx} has no valid target",
                            instr.opcode
                        )));
                    }
                    (false, Some(_)) => {
                        return Err(CompileError::internal(format!(
                            "{} in b{idx} is not a jump but has a target",
                            instr.opcode
                        )));
                    }
                    (false, None) => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcode::Opcode;

    #[test]
    fn test_append_without_block_fails() {
        let mut g = BlockGraph::new();
        assert!(g.append(Instr::new(Opcode::PopTop)).is_err());
    }

    #[test]
    fn test_use_block_links_fallthrough() {
        let mut g = BlockGraph::new();
        let a = g.next_block();
        g.append(Instr::with_arg(Opcode::LoadConst, 0)).unwrap();
        let b = g.new_block();
        g.use_block(b);
        assert_eq!(g.block(a).next, Some(b));
    }

    #[test]
    fn test_use_block_after_terminator_does_not_link() {
        let mut g = BlockGraph::new();
        let a = g.next_block();
        g.append(Instr::with_arg(Opcode::LoadConst, 0)).unwrap();
        g.append(Instr::new(Opcode::ReturnValue)).unwrap();
        let b = g.next_block();
        assert_eq!(g.block(a).next, None);
        assert!(g.block(a).return_terminated);
        assert!(!g.reachable(a).contains(&b));
    }

    #[test]
    fn test_append_after_terminator_opens_dead_block() {
        let mut g = BlockGraph::new();
        let a = g.next_block();
        g.append(Instr::new(Opcode::ReturnValue)).unwrap();
        g.append(Instr::new(Opcode::PopTop)).unwrap();
        let cur = g.current().unwrap();
        assert_ne!(cur, a);
        assert_eq!(g.block(a).instrs.len(), 1);
        assert_eq!(g.reachable(a).len(), 1);
    }

    #[test]
    fn test_jump_edges_are_reachable() {
        let mut g = BlockGraph::new();
        let a = g.next_block();
        let target = g.new_block();
        g.append(Instr::jump(Opcode::JumpAbsolute, target)).unwrap();
        let reach = g.reachable(a);
        assert!(reach.contains(&target));
        assert!(g.check_targets().is_ok());
    }
}
