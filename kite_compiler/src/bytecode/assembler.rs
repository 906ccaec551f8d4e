//! Bytecode assembler.
//!
//! Turns a finished [`CompilationUnit`] into an immutable [`CompiledCode`]:
//!
//! 1. Append the implicit `LOAD_CONST None; RETURN_VALUE` tail.
//! 2. Compute the maximum stack depth.
//! 3. Lay out reachable blocks: fallthrough chains stay contiguous, chains are
//!    placed in reverse postorder with the entry chain first.
//! 4. Resolve jump arguments until the number of `EXTENDED_ARG` prefixes stops
//!    changing.
//! 5. Emit bytes and the line table in lockstep.
//! 6. Freeze the tables and compute the remaining flags.

use super::block::{BlockGraph, BlockId};
use super::code::{CodeFlags, CodeId, CompiledCode, Constant};
use super::instruction::encode;
use super::lnotab::LineTableBuilder;
use super::opcode::{JumpKind, Opcode};
use super::stackdepth::compute_max_depth;
use crate::config::Limits;
use crate::error::{CompileError, CompileResult};
use crate::unit::CompilationUnit;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tracing::debug;

/// Assemble `unit`.
pub fn assemble(
    mut unit: CompilationUnit,
    filename: &Arc<str>,
    limits: &Limits,
) -> CompileResult<CompiledCode> {
    let needs_tail = match unit.graph.current() {
        Some(cur) => !unit.graph.block(cur).return_terminated,
        None => true,
    };
    if needs_tail {
        unit.graph.next_block();
        unit.emit_const(Constant::None)?;
        unit.emit(Opcode::ReturnValue)?;
    }

    let entry = unit
        .graph
        .entry()
        .ok_or_else(|| CompileError::internal("unit has no entry block"))?;
    unit.graph.check_targets()?;

    let max_stack_depth = compute_max_depth(&mut unit.graph, entry)?;
    let order = block_order(&unit.graph, entry);
    let (code_len, extended) = resolve_jumps(&mut unit.graph, &order)?;
    if code_len as usize > limits.max_code_size {
        return Err(CompileError::ResourceLimit {
            what: "bytecode bytes",
            limit: limits.max_code_size,
        });
    }

    // A module starts at its first instruction carrying a line.
    if unit.first_line == 0 {
        unit.first_line = order
            .iter()
            .flat_map(|b| unit.graph.block(*b).instrs.iter())
            .map(|i| i.line)
            .find(|&line| line > 0)
            .unwrap_or(1);
    }

    let (bytecode, lnotab) = emit_code(&unit.graph, &order, unit.first_line, code_len);

    let constants = unit.take_constants();
    for (what, len) in [
        ("constants", constants.len()),
        ("names", unit.names.len()),
        ("local variables", unit.varnames.len()),
        ("cell and free variables", unit.cellvars.len() + unit.freevars.len()),
    ] {
        if len > limits.max_table_entries {
            return Err(CompileError::ResourceLimit {
                what,
                limit: limits.max_table_entries,
            });
        }
    }

    let mut flags = unit.flags;
    flags.set(CodeFlags::USES_EXEC, unit.uses_exec);
    flags.set(
        CodeFlags::NOFREE,
        unit.freevars.is_empty() && unit.cellvars.is_empty(),
    );

    debug!(
        name = %unit.name,
        bytes = bytecode.len(),
        blocks = order.len(),
        extended,
        max_stack_depth,
        %flags,
        "assembled unit"
    );

    Ok(CompiledCode {
        id: CodeId::fresh(),
        name: unit.name,
        filename: filename.clone(),
        bytecode: bytecode.into_boxed_slice(),
        constants: constants.into_boxed_slice(),
        names: unit.names.into_boxed(),
        varnames: unit.varnames.into_boxed(),
        freevars: unit.freevars.into_boxed(),
        cellvars: unit.cellvars.into_boxed(),
        argcount: unit.argcount,
        max_stack_depth,
        flags,
        lnotab: lnotab.into_boxed_slice(),
        first_line: unit.first_line,
    })
}

// =============================================================================
// Layout
// =============================================================================

/// Emission order of the reachable blocks.
///
/// A chain is a maximal run of blocks linked by fallthrough; it is laid out
/// contiguously. Chains are ordered by reverse postorder of a depth-first walk
/// over jump edges starting at the entry chain, so every forward edge of a
/// structured program lands after its source.
pub fn block_order(graph: &BlockGraph, entry: BlockId) -> Vec<BlockId> {
    let reachable = graph.reachable(entry);

    let mut has_fallthrough_pred = FxHashSet::default();
    for &b in &reachable {
        if let Some(next) = graph.block(b).next {
            has_fallthrough_pred.insert(next);
        }
    }

    // Heads in id order keeps the layout deterministic.
    let mut heads: Vec<BlockId> = reachable
        .iter()
        .copied()
        .filter(|b| *b == entry || !has_fallthrough_pred.contains(b))
        .collect();
    heads.sort();

    let mut chains: Vec<Vec<BlockId>> = Vec::with_capacity(heads.len());
    let mut chain_of: FxHashMap<BlockId, usize> = FxHashMap::default();
    for head in heads {
        if chain_of.contains_key(&head) {
            continue;
        }
        let idx = chains.len();
        let mut chain = Vec::new();
        let mut cur = Some(head);
        while let Some(b) = cur {
            if chain_of.contains_key(&b) {
                break;
            }
            chain_of.insert(b, idx);
            chain.push(b);
            cur = graph.block(b).next;
        }
        chains.push(chain);
    }

    let mut visited = vec![false; chains.len()];
    let mut postorder = Vec::with_capacity(chains.len());
    let Some(&entry_chain) = chain_of.get(&entry) else {
        return Vec::new();
    };
    visit_chain(graph, &chains, &chain_of, entry_chain, &mut visited, &mut postorder);

    postorder
        .iter()
        .rev()
        .flat_map(|&c| chains[c].iter().copied())
        .collect()
}

fn visit_chain(
    graph: &BlockGraph,
    chains: &[Vec<BlockId>],
    chain_of: &FxHashMap<BlockId, usize>,
    chain: usize,
    visited: &mut [bool],
    postorder: &mut Vec<usize>,
) {
    visited[chain] = true;
    for &b in &chains[chain] {
        for target in graph.block(b).instrs.iter().filter_map(|i| i.target) {
            if let Some(&c) = chain_of.get(&target) {
                if !visited[c] {
                    visit_chain(graph, chains, chain_of, c, visited, postorder);
                }
            }
        }
    }
    postorder.push(chain);
}

// =============================================================================
// Jump Resolution
// =============================================================================

/// Assign block offsets and jump arguments until the layout is stable.
/// Returns the code length and the number of extended arguments.
fn resolve_jumps(graph: &mut BlockGraph, order: &[BlockId]) -> CompileResult<(u32, usize)> {
    let mut last_extended = usize::MAX;
    loop {
        let mut offset = 0u32;
        for &b in order {
            let block = graph.block_mut(b);
            block.offset = offset;
            offset += block.byte_size();
        }
        let total = offset;

        let mut extended = 0usize;
        for &b in order {
            let mut pos = graph.block(b).offset;
            for i in 0..graph.block(b).instrs.len() {
                let instr = graph.block(b).instrs[i];
                let after = pos + instr.size();
                if let Some(target) = instr.target {
                    let target_offset = graph.block(target).offset;
                    let arg = match instr.jump_kind() {
                        JumpKind::Absolute => target_offset,
                        JumpKind::Relative => {
                            target_offset.checked_sub(after).ok_or_else(|| {
                                CompileError::internal(format!(
                                    "backward relative jump {} from offset {pos} to {target}",
                                    instr.opcode
                                ))
                            })?
                        }
                        JumpKind::None => {
                            return Err(CompileError::internal(format!(
                                "{} has a target but is not a jump",
                                instr.opcode
                            )));
                        }
                    };
                    graph.block_mut(b).instrs[i].arg = arg;
                }
                if graph.block(b).instrs[i].arg > 0xffff {
                    extended += 1;
                }
                pos = after;
            }
        }

        if extended == last_extended {
            return Ok((total, extended));
        }
        last_extended = extended;
    }
}

/// Encode the laid-out blocks and build the line table alongside.
fn emit_code(
    graph: &BlockGraph,
    order: &[BlockId],
    first_line: u32,
    code_len: u32,
) -> (Vec<u8>, Vec<u8>) {
    let mut bytecode = Vec::with_capacity(code_len as usize);
    let mut lines = LineTableBuilder::new(first_line);
    for &b in order {
        for instr in &graph.block(b).instrs {
            if instr.line > 0 {
                lines.add(bytecode.len() as u32, instr.line);
            }
            encode(instr.opcode, instr.arg, &mut bytecode);
        }
    }
    (bytecode, lines.finish())
}
