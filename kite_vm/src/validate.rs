//! Bytecode validation.
//!
//! Every code object is checked once before it first runs: instructions
//! decode, operands index their tables, jumps land on instruction boundaries
//! and no path over- or underflows the operand stack. Handlers may then
//! assume well-formed input; anything that still goes wrong at run time is an
//! internal error.

use kite_compiler::{COMPARE_EXC_MATCH, CompiledCode, DecodeError, Decoded, JumpKind, Opcode, call_nargs, decode};
use thiserror::Error;

/// Why a code object was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BytecodeError {
    /// Undecodable instruction stream.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// No instructions.
    #[error("empty code object")]
    Empty,

    /// Jump target past the end of the code.
    #[error("jump at offset {offset} targets {target}, outside the code")]
    JumpOutOfRange {
        /// Offset of the jump.
        offset: u32,
        /// Resolved target.
        target: u32,
    },

    /// Jump target inside another instruction.
    #[error("jump at offset {offset} targets {target}, not an instruction boundary")]
    MisalignedJump {
        /// Offset of the jump.
        offset: u32,
        /// Resolved target.
        target: u32,
    },

    /// Operand indexes past its table.
    #[error("{table} index {index} out of range at offset {offset}")]
    OperandOutOfRange {
        /// Offset of the instruction.
        offset: u32,
        /// Which table.
        table: &'static str,
        /// Offending index.
        index: u32,
    },

    /// An instruction consumes more slots than are on the stack.
    #[error("operand stack underflow at offset {offset}")]
    StackUnderflow {
        /// Offset of the instruction.
        offset: u32,
    },

    /// A path exceeds the declared maximum depth.
    #[error("operand stack depth {depth} exceeds declared maximum {max} at offset {offset}")]
    StackOverflow {
        /// Offset of the instruction.
        offset: u32,
        /// Depth reached.
        depth: i64,
        /// `max_stack_depth` of the code.
        max: u32,
    },

    /// Control reaches the end of the code without returning.
    #[error("execution falls off the end of the code at offset {offset}")]
    FallsOffEnd {
        /// Offset of the last instruction.
        offset: u32,
    },
}

/// Stack slots an instruction reads before it pushes anything.
pub const fn stack_inputs(op: Opcode, arg: u32) -> i64 {
    use Opcode::*;
    match op {
        PopTop | DupTop | UnaryPositive | UnaryNegative | UnaryNot | UnaryInvert | GetIter => 1,
        RotTwo | DupTopTwo => 2,
        RotThree | DupTopThree => 3,
        RotFour => 4,

        BinaryAdd | BinarySubtract | BinaryMultiply | BinaryDivide | BinaryFloorDivide
        | BinaryModulo | BinaryPower | BinaryLshift | BinaryRshift | BinaryAnd | BinaryXor
        | BinaryOr | BinarySubscr | InplaceAdd | InplaceSubtract | InplaceMultiply
        | InplaceDivide | InplaceFloorDivide | InplaceModulo | InplacePower | InplaceLshift
        | InplaceRshift | InplaceAnd | InplaceXor | InplaceOr => 2,

        StoreSubscr | StoreMap | BuildSliceThree => 3,
        DeleteSubscr | ListAppend | BuildSliceTwo => 2,

        WithCleanup => 4,
        ReturnValue | YieldValue => 1,
        EndFinally => 3,
        RaiseVarargsZero => 0,
        RaiseVarargsOne => 1,
        RaiseVarargsTwo => 2,
        RaiseVarargsThree => 3,

        StoreName | StoreGlobal | StoreFast | StoreDeref => 1,
        LoadAttr | DeleteAttr | LoadMethod => 1,
        StoreAttr => 2,

        BuildTuple | BuildList => arg as i64,
        UnpackSequence => 1,
        CompareOp => 2,

        PopJumpIfFalse | PopJumpIfTrue | JumpIfFalseOrPop | JumpIfTrueOrPop | ForIter => 1,

        CallFunction => call_nargs(arg) as i64 + 1,
        CallFunctionVar | CallFunctionKw => call_nargs(arg) as i64 + 2,
        CallFunctionVarKw => call_nargs(arg) as i64 + 3,
        CallMethod => call_nargs(arg) as i64 + 2,
        MakeFunction => arg as i64 + 1,
        MakeClosure => arg as i64 + 2,

        _ => 0,
    }
}

/// Validate `code` and every code object nested in its constants.
pub fn validate_tree(code: &CompiledCode) -> Result<(), BytecodeError> {
    validate(code)?;
    code.nested().try_for_each(|nested| validate_tree(nested))
}

/// Validate a single code object.
pub fn validate(code: &CompiledCode) -> Result<(), BytecodeError> {
    let instrs = decode(&code.bytecode).collect::<Result<Vec<Decoded>, _>>()?;
    if instrs.is_empty() {
        return Err(BytecodeError::Empty);
    }

    let len = code.bytecode.len();
    let mut index_of = vec![usize::MAX; len + 1];
    for (i, d) in instrs.iter().enumerate() {
        index_of[d.offset as usize] = i;
    }

    for d in &instrs {
        check_operand(code, d)?;
        if let Some(target) = d.jump_target() {
            if target as usize >= len {
                return Err(BytecodeError::JumpOutOfRange {
                    offset: d.offset,
                    target,
                });
            }
            if index_of[target as usize] == usize::MAX {
                return Err(BytecodeError::MisalignedJump {
                    offset: d.offset,
                    target,
                });
            }
        }
    }

    check_stack(code, &instrs, &index_of)
}

fn check_operand(code: &CompiledCode, d: &Decoded) -> Result<(), BytecodeError> {
    use Opcode::*;
    let (table, limit) = match d.opcode {
        LoadConst => ("constants", code.constants.len()),
        LoadName | StoreName | DeleteName | LoadGlobal | StoreGlobal | DeleteGlobal
        | LoadAttr | StoreAttr | DeleteAttr | LoadMethod => ("names", code.names.len()),
        LoadFast | StoreFast | DeleteFast => ("varnames", code.varnames.len()),
        LoadClosure | LoadDeref | StoreDeref => ("cells", code.ncells()),
        CompareOp => ("comparison", COMPARE_EXC_MATCH as usize + 1),
        _ => return Ok(()),
    };
    if d.arg as usize >= limit {
        return Err(BytecodeError::OperandOutOfRange {
            offset: d.offset,
            table,
            index: d.arg,
        });
    }
    Ok(())
}

/// Walk every path, keeping the deepest entry depth seen per instruction.
/// Depth is bounded by `max_stack_depth`, so the walk terminates.
fn check_stack(code: &CompiledCode, instrs: &[Decoded], index_of: &[usize]) -> Result<(), BytecodeError> {
    let max = i64::from(code.max_stack_depth);
    let mut depth_at: Vec<Option<i64>> = vec![None; instrs.len()];
    let mut worklist = vec![(0usize, 0i64)];

    while let Some((i, depth)) = worklist.pop() {
        if depth_at[i].is_some_and(|seen| seen >= depth) {
            continue;
        }
        depth_at[i] = Some(depth);
        let d = &instrs[i];

        if depth < stack_inputs(d.opcode, d.arg) {
            return Err(BytecodeError::StackUnderflow { offset: d.offset });
        }
        let mut visit = |offset: u32, effect: i32| -> Result<(), BytecodeError> {
            let next = depth + i64::from(effect);
            if next > max {
                return Err(BytecodeError::StackOverflow {
                    offset: d.offset,
                    depth: next,
                    max: code.max_stack_depth,
                });
            }
            match index_of.get(offset as usize) {
                Some(&j) if j != usize::MAX => {
                    worklist.push((j, next));
                    Ok(())
                }
                _ => Err(BytecodeError::FallsOffEnd { offset: d.offset }),
            }
        };

        // CONTINUE_LOOP unwinds to a loop header already reached by the
        // loop's own back-edge.
        if d.opcode != Opcode::ContinueLoop
            && d.opcode.jump_kind() != JumpKind::None
            && let Some(target) = d.jump_target()
        {
            visit(target, d.opcode.jump_effect(d.arg))?;
        }
        if !d.opcode.is_terminator() {
            visit(d.next_offset(), d.opcode.stack_effect(d.arg))?;
        }
    }
    Ok(())
}
