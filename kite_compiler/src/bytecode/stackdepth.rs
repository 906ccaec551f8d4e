//! Maximum operand-stack depth analysis.
//!
//! Depth-first walk of the block graph carrying the simulated depth. Each
//! block remembers the largest depth it was entered with; a block is walked
//! again only when reached with a strictly larger depth. Loops are assumed to
//! have no net stack effect per iteration. That assumption is checked: reaching
//! a block that is already on the current path with a larger depth than it was
//! entered with is reported as [`StackDepthError::GrowingCycle`] instead of
//! being silently cut off.
//!
//! `CONTINUE_LOOP` unwinds the block stack at run time, so its target is not
//! walked from the jump; the loop header is always reached through the loop's
//! own entry edge.

use super::block::{BlockGraph, BlockId};
use super::opcode::Opcode;
use thiserror::Error;

/// Broken stack-depth invariant.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackDepthError {
    /// A cycle in the graph pushes more than it pops.
    #[error("stack grows around a cycle through {block}: entered at {entered}, re-entered at {reentered}")]
    GrowingCycle {
        /// Block re-entered on the same path.
        block: BlockId,
        /// Depth at the first entry.
        entered: i32,
        /// Depth at the re-entry.
        reentered: i32,
    },
    /// An instruction pops from an empty stack.
    #[error("stack underflow at {opcode} in {block}")]
    Underflow {
        /// Block containing the instruction.
        block: BlockId,
        /// The instruction's opcode.
        opcode: Opcode,
    },
}

/// Compute the maximum stack depth reachable from `entry`.
///
/// Resets the per-block analysis state first, so repeated calls on the same
/// graph give the same answer.
pub fn compute_max_depth(graph: &mut BlockGraph, entry: BlockId) -> Result<u32, StackDepthError> {
    for idx in 0..graph.len() {
        let block = graph.block_mut(BlockId(idx as u32));
        block.seen = false;
        block.startdepth = i32::MIN;
    }
    let max = walk(graph, entry, 0, 0)?;
    Ok(max as u32)
}

fn walk(graph: &mut BlockGraph, id: BlockId, depth: i32, mut maxdepth: i32) -> Result<i32, StackDepthError> {
    {
        let block = graph.block(id);
        if block.seen {
            if depth > block.startdepth {
                return Err(StackDepthError::GrowingCycle {
                    block: id,
                    entered: block.startdepth,
                    reentered: depth,
                });
            }
            return Ok(maxdepth);
        }
        if block.startdepth >= depth {
            return Ok(maxdepth);
        }
    }

    {
        let block = graph.block_mut(id);
        block.seen = true;
        block.startdepth = depth;
    }
    maxdepth = maxdepth.max(depth);

    let mut depth = depth;
    let mut falls_through = true;
    let count = graph.block(id).instrs.len();
    for i in 0..count {
        let instr = graph.block(id).instrs[i];
        let before = depth;
        depth += instr.opcode.stack_effect(instr.arg);
        if depth < 0 || before + instr.opcode.jump_effect(instr.arg) < 0 {
            graph.block_mut(id).seen = false;
            return Err(StackDepthError::Underflow {
                block: id,
                opcode: instr.opcode,
            });
        }
        maxdepth = maxdepth.max(depth);

        if let Some(target) = instr.target {
            if instr.opcode != Opcode::ContinueLoop {
                let target_depth = before + instr.opcode.jump_effect(instr.arg);
                maxdepth = maxdepth.max(target_depth);
                maxdepth = match walk(graph, target, target_depth, maxdepth) {
                    Ok(m) => m,
                    Err(e) => {
                        graph.block_mut(id).seen = false;
                        return Err(e);
                    }
                };
            }
        }
        if instr.opcode.is_terminator() {
            falls_through = false;
            break;
        }
    }

    if falls_through {
        if let Some(next) = graph.block(id).next {
            maxdepth = match walk(graph, next, depth, maxdepth) {
                Ok(m) => m,
                Err(e) => {
                    graph.block_mut(id).seen = false;
                    return Err(e);
                }
            };
        }
    }

    graph.block_mut(id).seen = false;
    Ok(maxdepth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::instruction::Instr;

    fn load(g: &mut BlockGraph) {
        g.append(Instr::with_arg(Opcode::LoadConst, 0)).unwrap();
    }

    #[test]
    fn test_straight_line() {
        let mut g = BlockGraph::new();
        let entry = g.next_block();
        load(&mut g);
        load(&mut g);
        g.append(Instr::new(Opcode::BinaryAdd)).unwrap();
        g.append(Instr::new(Opcode::ReturnValue)).unwrap();
        assert_eq!(compute_max_depth(&mut g, entry), Ok(2));
    }

    #[test]
    fn test_idempotent() {
        let mut g = BlockGraph::new();
        let entry = g.next_block();
        let body = g.new_block();
        let exit = g.new_block();
        load(&mut g);
        g.append(Instr::new(Opcode::GetIter)).unwrap();
        g.use_block(body);
        g.append(Instr::jump(Opcode::ForIter, exit)).unwrap();
        g.append(Instr::new(Opcode::PopTop)).unwrap();
        g.append(Instr::jump(Opcode::JumpAbsolute, body)).unwrap();
        g.use_block(exit);
        load(&mut g);
        g.append(Instr::new(Opcode::ReturnValue)).unwrap();

        let first = compute_max_depth(&mut g, entry).unwrap();
        let second = compute_max_depth(&mut g, entry).unwrap();
        assert_eq!(first, 2);
        assert_eq!(first, second);
    }

    #[test]
    fn test_unreachable_code_excluded() {
        let mut g = BlockGraph::new();
        let entry = g.next_block();
        load(&mut g);
        g.append(Instr::new(Opcode::ReturnValue)).unwrap();
        // Dead: lands in a fresh unlinked block.
        for _ in 0..5 {
            load(&mut g);
        }
        assert_eq!(compute_max_depth(&mut g, entry), Ok(1));
    }

    #[test]
    fn test_growing_cycle_is_detected() {
        let mut g = BlockGraph::new();
        let entry = g.next_block();
        let lp = g.new_block();
        g.use_block(lp);
        load(&mut g);
        g.append(Instr::jump(Opcode::JumpAbsolute, lp)).unwrap();

        let err = compute_max_depth(&mut g, entry).unwrap_err();
        assert_eq!(
            err,
            StackDepthError::GrowingCycle {
                block: lp,
                entered: 0,
                reentered: 1
            }
        );
    }

    #[test]
    fn test_underflow_is_detected() {
        let mut g = BlockGraph::new();
        let entry = g.next_block();
        g.append(Instr::new(Opcode::PopTop)).unwrap();
        assert!(matches!(
            compute_max_depth(&mut g, entry),
            Err(StackDepthError::Underflow { opcode: Opcode::PopTop, .. })
        ));
    }

    #[test]
    fn test_handler_edge_adds_three() {
        let mut g = BlockGraph::new();
        let entry = g.next_block();
        let handler = g.new_block();
        g.append(Instr::jump(Opcode::SetupExcept, handler)).unwrap();
        g.append(Instr::new(Opcode::PopBlock)).unwrap();
        load(&mut g);
        g.append(Instr::new(Opcode::ReturnValue)).unwrap();
        g.use_block(handler);
        g.append(Instr::new(Opcode::PopTop)).unwrap();
        g.append(Instr::new(Opcode::PopTop)).unwrap();
        g.append(Instr::new(Opcode::PopTop)).unwrap();
        load(&mut g);
        g.append(Instr::new(Opcode::ReturnValue)).unwrap();
        assert_eq!(compute_max_depth(&mut g, entry), Ok(3));
    }
}
