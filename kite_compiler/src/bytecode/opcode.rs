//! The opcode table.
//!
//! Every opcode's mnemonic, argument presence, jump kind and stack effect is
//! defined here and nowhere else. The stack depth analyzer, the assembler, the
//! disassembler and the interpreter all consult this module, so an opcode whose
//! handler moves the operand stack differently from [`Opcode::stack_effect`] is
//! a bug in one of the two.
//!
//! # Encoding
//!
//! ```text
//! opcode < HAVE_ARGUMENT     ┌────────┐
//!                            │ opcode │
//!                            └────────┘
//! opcode >= HAVE_ARGUMENT    ┌────────┬─────────┬─────────┐
//!                            │ opcode │ arg lo8 │ arg hi8 │
//!                            └────────┴─────────┴─────────┘
//! arg > 0xffff               EXTENDED_ARG (arg >> 16), then opcode (arg & 0xffff)
//! ```

use std::fmt;

/// First opcode that carries a 16-bit argument.
pub const HAVE_ARGUMENT: u8 = 0x60;

/// `COMPARE_OP` argument for exception matching in `except` clauses.
///
/// Arguments `0..=9` are the discriminants of [`kite_core::ast::CmpOp`].
pub const COMPARE_EXC_MATCH: u32 = 10;

/// How a jump instruction's argument is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JumpKind {
    /// Not a jump.
    None,
    /// Argument is a delta from the end of the instruction.
    Relative,
    /// Argument is a byte offset from the start of the code.
    Absolute,
}

/// Bytecode opcodes for the stack-based VM.
///
/// Opcodes are organized by category:
/// - 0x00-0x0F: Stack manipulation
/// - 0x10-0x1F: Unary operations
/// - 0x20-0x2F: Binary operations
/// - 0x30-0x3F: In-place operations
/// - 0x40-0x4F: Container stores
/// - 0x50-0x5F: Block, return and raise
/// - 0x60-0x6F: Name access (first opcodes with an argument)
/// - 0x70-0x7F: Collections and comparison
/// - 0x80-0x8F: Jumps and block setup
/// - 0x90-0x9F: Calls and function construction
/// - 0xA0: Argument prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // =========================================================================
    // Stack Manipulation (0x00-0x0F)
    // =========================================================================
    /// Discard TOS.
    PopTop = 0x01,
    /// Swap the two topmost items.
    RotTwo = 0x02,
    /// Lift the second and third items one position up, move TOS down to third.
    RotThree = 0x03,
    /// Lift the three items below TOS up one position, move TOS down to fourth.
    RotFour = 0x04,
    /// Duplicate TOS.
    DupTop = 0x05,
    /// Duplicate the two topmost items, keeping their order.
    DupTopTwo = 0x06,
    /// Duplicate the three topmost items, keeping their order.
    DupTopThree = 0x07,

    // =========================================================================
    // Unary Operations (0x10-0x1F)
    // =========================================================================
    /// `+TOS`
    UnaryPositive = 0x10,
    /// `-TOS`
    UnaryNegative = 0x11,
    /// `not TOS`
    UnaryNot = 0x12,
    /// `~TOS`
    UnaryInvert = 0x13,
    /// `iter(TOS)`
    GetIter = 0x14,

    // =========================================================================
    // Binary Operations (0x20-0x2F)
    // =========================================================================
    /// `TOS1 + TOS`
    BinaryAdd = 0x20,
    /// `TOS1 - TOS`
    BinarySubtract = 0x21,
    /// `TOS1 * TOS`
    BinaryMultiply = 0x22,
    /// `TOS1 / TOS`
    BinaryDivide = 0x23,
    /// `TOS1 // TOS`
    BinaryFloorDivide = 0x24,
    /// `TOS1 % TOS`
    BinaryModulo = 0x25,
    /// `TOS1 ** TOS`
    BinaryPower = 0x26,
    /// `TOS1 << TOS`
    BinaryLshift = 0x27,
    /// `TOS1 >> TOS`
    BinaryRshift = 0x28,
    /// `TOS1 & TOS`
    BinaryAnd = 0x29,
    /// `TOS1 ^ TOS`
    BinaryXor = 0x2A,
    /// `TOS1 | TOS`
    BinaryOr = 0x2B,
    /// `TOS1[TOS]`
    BinarySubscr = 0x2C,

    // =========================================================================
    // In-place Operations (0x30-0x3F)
    // =========================================================================
    /// `TOS1 += TOS`
    InplaceAdd = 0x30,
    /// `TOS1 -= TOS`
    InplaceSubtract = 0x31,
    /// `TOS1 *= TOS`
    InplaceMultiply = 0x32,
    /// `TOS1 /= TOS`
    InplaceDivide = 0x33,
    /// `TOS1 //= TOS`
    InplaceFloorDivide = 0x34,
    /// `TOS1 %= TOS`
    InplaceModulo = 0x35,
    /// `TOS1 **= TOS`
    InplacePower = 0x36,
    /// `TOS1 <<= TOS`
    InplaceLshift = 0x37,
    /// `TOS1 >>= TOS`
    InplaceRshift = 0x38,
    /// `TOS1 &= TOS`
    InplaceAnd = 0x39,
    /// `TOS1 ^= TOS`
    InplaceXor = 0x3A,
    /// `TOS1 |= TOS`
    InplaceOr = 0x3B,

    // =========================================================================
    // Container Stores (0x40-0x4F)
    // =========================================================================
    /// `TOS1[TOS] = TOS2`
    StoreSubscr = 0x40,
    /// `del TOS1[TOS]`
    DeleteSubscr = 0x41,
    /// `TOS2[TOS] = TOS1`, leaving the dict on the stack.
    StoreMap = 0x42,
    /// `TOS1.append(TOS)`, consuming both.
    ListAppend = 0x43,
    /// `slice(TOS1, TOS)`
    BuildSliceTwo = 0x44,
    /// `slice(TOS2, TOS1, TOS)`
    BuildSliceThree = 0x45,

    // =========================================================================
    // Block, Return and Raise (0x50-0x5F)
    // =========================================================================
    /// Unwind to the innermost loop block and jump to its exit.
    BreakLoop = 0x50,
    /// Call `__exit__` for a `with` block and drop it from the stack.
    WithCleanup = 0x51,
    /// Return TOS to the caller.
    ReturnValue = 0x52,
    /// Suspend the generator, handing TOS to the consumer.
    YieldValue = 0x53,
    /// Pop the innermost block from the block stack.
    PopBlock = 0x54,
    /// Finish a `finally` or `except` chain, resuming the pending unwind.
    EndFinally = 0x55,
    /// Re-raise the active exception.
    RaiseVarargsZero = 0x56,
    /// `raise TOS`
    RaiseVarargsOne = 0x57,
    /// `raise TOS1, TOS`
    RaiseVarargsTwo = 0x58,
    /// `raise TOS2, TOS1, TOS`
    RaiseVarargsThree = 0x59,

    // =========================================================================
    // Name Access (0x60-0x6F)
    // =========================================================================
    /// Push `constants[arg]`.
    LoadConst = 0x60,
    /// Push the value of `names[arg]` from locals, globals, then builtins.
    LoadName = 0x61,
    /// Bind `names[arg]` in the local namespace.
    StoreName = 0x62,
    /// Unbind `names[arg]` in the local namespace.
    DeleteName = 0x63,
    /// Push global or builtin `names[arg]`.
    LoadGlobal = 0x64,
    /// Bind global `names[arg]`.
    StoreGlobal = 0x65,
    /// Unbind global `names[arg]`.
    DeleteGlobal = 0x66,
    /// Push fast local `varnames[arg]`.
    LoadFast = 0x67,
    /// Bind fast local `varnames[arg]`.
    StoreFast = 0x68,
    /// Unbind fast local `varnames[arg]`.
    DeleteFast = 0x69,
    /// Push the cell object for slot `arg` (cells, then free variables).
    LoadClosure = 0x6A,
    /// Push the contents of cell slot `arg`.
    LoadDeref = 0x6B,
    /// Store TOS into cell slot `arg`.
    StoreDeref = 0x6C,
    /// `TOS.names[arg]`
    LoadAttr = 0x6D,
    /// `TOS.names[arg] = TOS1`
    StoreAttr = 0x6E,
    /// `del TOS.names[arg]`
    DeleteAttr = 0x6F,

    // =========================================================================
    // Collections and Comparison (0x70-0x7F)
    // =========================================================================
    /// Build a tuple from the top `arg` items.
    BuildTuple = 0x70,
    /// Build a list from the top `arg` items.
    BuildList = 0x71,
    /// Push an empty dict presized for `arg` entries.
    BuildMap = 0x72,
    /// Unpack TOS into `arg` items, first item on top.
    UnpackSequence = 0x73,
    /// `TOS1 op TOS` for the operator numbered `arg`.
    CompareOp = 0x74,
    /// Replace TOS with the method `names[arg]` and its receiver.
    LoadMethod = 0x75,

    // =========================================================================
    // Jumps and Block Setup (0x80-0x8F)
    // =========================================================================
    /// Jump forward by `arg` bytes.
    JumpForward = 0x80,
    /// Jump to offset `arg`.
    JumpAbsolute = 0x81,
    /// Pop TOS; jump to `arg` if it was false.
    PopJumpIfFalse = 0x82,
    /// Pop TOS; jump to `arg` if it was true.
    PopJumpIfTrue = 0x83,
    /// Jump to `arg` keeping TOS if false, else pop it.
    JumpIfFalseOrPop = 0x84,
    /// Jump to `arg` keeping TOS if true, else pop it.
    JumpIfTrueOrPop = 0x85,
    /// Push `next(TOS)`; when exhausted pop the iterator and jump forward `arg`.
    ForIter = 0x86,
    /// Unwind to the innermost loop block and jump to offset `arg`.
    ContinueLoop = 0x87,
    /// Push a loop block whose exit is `arg` bytes ahead.
    SetupLoop = 0x88,
    /// Push an exception handler block whose handler is `arg` bytes ahead.
    SetupExcept = 0x89,
    /// Push a finally block whose cleanup is `arg` bytes ahead.
    SetupFinally = 0x8A,

    // =========================================================================
    // Calls (0x90-0x9F)
    // =========================================================================
    /// Call with `arg & 0xff` positional and `arg >> 8` keyword arguments.
    CallFunction = 0x90,
    /// Like `CallFunction`, plus a `*args` sequence on top.
    CallFunctionVar = 0x91,
    /// Like `CallFunction`, plus a `**kwargs` mapping on top.
    CallFunctionKw = 0x92,
    /// Like `CallFunction`, plus `*args` and `**kwargs` on top.
    CallFunctionVarKw = 0x93,
    /// Call a method pushed by `LoadMethod`.
    CallMethod = 0x94,
    /// Build a function from the code on TOS and `arg` defaults below it.
    MakeFunction = 0x95,
    /// Build a closure from code, a cell tuple and `arg` defaults.
    MakeClosure = 0x96,

    // =========================================================================
    // Prefix (0xA0)
    // =========================================================================
    /// High 16 bits of the next instruction's argument.
    ExtendedArg = 0xA0,
}

/// Number of stack slots a call with packed argument `arg` consumes for its
/// arguments: positional count in the low byte, keyword pairs above it.
#[inline]
pub const fn call_nargs(arg: u32) -> i32 {
    ((arg & 0xff) + 2 * ((arg >> 8) & 0xff)) as i32
}

/// Pack positional and keyword argument counts into a call argument.
#[inline]
pub const fn pack_call_arg(positional: u32, keywords: u32) -> u32 {
    positional | (keywords << 8)
}

impl Opcode {
    /// Convert from u8, returning None if invalid.
    pub fn from_u8(value: u8) -> Option<Self> {
        use Opcode::*;
        let op = match value {
            0x01 => PopTop,
            0x02 => RotTwo,
            0x03 => RotThree,
            0x04 => RotFour,
            0x05 => DupTop,
            0x06 => DupTopTwo,
            0x07 => DupTopThree,

            0x10 => UnaryPositive,
            0x11 => UnaryNegative,
            0x12 => UnaryNot,
            0x13 => UnaryInvert,
            0x14 => GetIter,

            0x20 => BinaryAdd,
            0x21 => BinarySubtract,
            0x22 => BinaryMultiply,
            0x23 => BinaryDivide,
            0x24 => BinaryFloorDivide,
            0x25 => BinaryModulo,
            0x26 => BinaryPower,
            0x27 => BinaryLshift,
            0x28 => BinaryRshift,
            0x29 => BinaryAnd,
            0x2A => BinaryXor,
            0x2B => BinaryOr,
            0x2C => BinarySubscr,

            0x30 => InplaceAdd,
            0x31 => InplaceSubtract,
            0x32 => InplaceMultiply,
            0x33 => InplaceDivide,
            0x34 => InplaceFloorDivide,
            0x35 => InplaceModulo,
            0x36 => InplacePower,
            0x37 => InplaceLshift,
            0x38 => InplaceRshift,
            0x39 => InplaceAnd,
            0x3A => InplaceXor,
            0x3B => InplaceOr,

            0x40 => StoreSubscr,
            0x41 => DeleteSubscr,
            0x42 => StoreMap,
            0x43 => ListAppend,
            0x44 => BuildSliceTwo,
            0x45 => BuildSliceThree,

            0x50 => BreakLoop,
            0x51 => WithCleanup,
            0x52 => ReturnValue,
            0x53 => YieldValue,
            0x54 => PopBlock,
            0x55 => EndFinally,
            0x56 => RaiseVarargsZero,
            0x57 => RaiseVarargsOne,
            0x58 => RaiseVarargsTwo,
            0x59 => RaiseVarargsThree,

            0x60 => LoadConst,
            0x61 => LoadName,
            0x62 => StoreName,
            0x63 => DeleteName,
            0x64 => LoadGlobal,
            0x65 => StoreGlobal,
            0x66 => DeleteGlobal,
            0x67 => LoadFast,
            0x68 => StoreFast,
            0x69 => DeleteFast,
            0x6A => LoadClosure,
            0x6B => LoadDeref,
            0x6C => StoreDeref,
            0x6D => LoadAttr,
            0x6E => StoreAttr,
            0x6F => DeleteAttr,

            0x70 => BuildTuple,
            0x71 => BuildList,
            0x72 => BuildMap,
            0x73 => UnpackSequence,
            0x74 => CompareOp,
            0x75 => LoadMethod,

            0x80 => JumpForward,
            0x81 => JumpAbsolute,
            0x82 => PopJumpIfFalse,
            0x83 => PopJumpIfTrue,
            0x84 => JumpIfFalseOrPop,
            0x85 => JumpIfTrueOrPop,
            0x86 => ForIter,
            0x87 => ContinueLoop,
            0x88 => SetupLoop,
            0x89 => SetupExcept,
            0x8A => SetupFinally,

            0x90 => CallFunction,
            0x91 => CallFunctionVar,
            0x92 => CallFunctionKw,
            0x93 => CallFunctionVarKw,
            0x94 => CallMethod,
            0x95 => MakeFunction,
            0x96 => MakeClosure,

            0xA0 => ExtendedArg,

            _ => return None,
        };
        Some(op)
    }

    /// Whether the opcode is followed by a 16-bit argument.
    #[inline]
    pub const fn has_arg(self) -> bool {
        self as u8 >= HAVE_ARGUMENT
    }

    /// Jump classification.
    #[inline]
    pub const fn jump_kind(self) -> JumpKind {
        use Opcode::*;
        match self {
            JumpForward | ForIter | SetupLoop | SetupExcept | SetupFinally => JumpKind::Relative,
            JumpAbsolute | PopJumpIfFalse | PopJumpIfTrue | JumpIfFalseOrPop | JumpIfTrueOrPop
            | ContinueLoop => JumpKind::Absolute,
            _ => JumpKind::None,
        }
    }

    /// Whether the opcode names a block-graph edge.
    #[inline]
    pub const fn is_jump(self) -> bool {
        !matches!(self.jump_kind(), JumpKind::None)
    }

    /// Whether control never falls through to the next instruction.
    #[inline]
    pub const fn is_terminator(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            ReturnValue
                | RaiseVarargsZero
                | RaiseVarargsOne
                | RaiseVarargsTwo
                | RaiseVarargsThree
                | JumpAbsolute
                | JumpForward
                | BreakLoop
                | ContinueLoop
        )
    }

    /// Net stack effect when execution continues with the next instruction.
    ///
    /// For terminators this is the effect of the instruction itself before it
    /// leaves the block (e.g. `RETURN_VALUE` consumes one slot).
    pub const fn stack_effect(self, arg: u32) -> i32 {
        use Opcode::*;
        match self {
            PopTop => -1,
            RotTwo | RotThree | RotFour => 0,
            DupTop => 1,
            DupTopTwo => 2,
            DupTopThree => 3,

            UnaryPositive | UnaryNegative | UnaryNot | UnaryInvert | GetIter => 0,

            BinaryAdd | BinarySubtract | BinaryMultiply | BinaryDivide | BinaryFloorDivide
            | BinaryModulo | BinaryPower | BinaryLshift | BinaryRshift | BinaryAnd | BinaryXor
            | BinaryOr | BinarySubscr => -1,

            InplaceAdd | InplaceSubtract | InplaceMultiply | InplaceDivide
            | InplaceFloorDivide | InplaceModulo | InplacePower | InplaceLshift
            | InplaceRshift | InplaceAnd | InplaceXor | InplaceOr => -1,

            StoreSubscr => -3,
            DeleteSubscr => -2,
            StoreMap => -2,
            ListAppend => -2,
            BuildSliceTwo => -1,
            BuildSliceThree => -2,

            BreakLoop => 0,
            WithCleanup => -1,
            ReturnValue => -1,
            YieldValue => 0,
            PopBlock => 0,
            EndFinally => -3,
            RaiseVarargsZero => 0,
            RaiseVarargsOne => -1,
            RaiseVarargsTwo => -2,
            RaiseVarargsThree => -3,

            LoadConst | LoadName | LoadGlobal | LoadFast | LoadClosure | LoadDeref => 1,
            StoreName | StoreGlobal | StoreFast | StoreDeref => -1,
            DeleteName | DeleteGlobal | DeleteFast => 0,
            LoadAttr => 0,
            StoreAttr => -2,
            DeleteAttr => -1,

            BuildTuple | BuildList => 1 - arg as i32,
            BuildMap => 1,
            UnpackSequence => arg as i32 - 1,
            CompareOp => -1,
            LoadMethod => 1,

            JumpForward | JumpAbsolute | ContinueLoop | SetupLoop => 0,
            SetupExcept | SetupFinally => 0,
            PopJumpIfFalse | PopJumpIfTrue => -1,
            JumpIfFalseOrPop | JumpIfTrueOrPop => -1,
            ForIter => 1,

            CallFunction => -call_nargs(arg),
            CallFunctionVar | CallFunctionKw => -call_nargs(arg) - 1,
            CallFunctionVarKw => -call_nargs(arg) - 2,
            CallMethod => -call_nargs(arg) - 1,
            MakeFunction => -(arg as i32),
            MakeClosure => -(arg as i32) - 1,

            ExtendedArg => 0,
        }
    }

    /// Net stack effect along the jump edge, relative to the depth before the
    /// instruction. Equal to [`stack_effect`](Self::stack_effect) for
    /// non-jumps.
    pub const fn jump_effect(self, arg: u32) -> i32 {
        use Opcode::*;
        match self {
            // The handler is entered with three unwind slots pushed.
            SetupExcept | SetupFinally => 3,
            JumpIfFalseOrPop | JumpIfTrueOrPop => 0,
            // The exhausted iterator is popped.
            ForIter => -1,
            _ => self.stack_effect(arg),
        }
    }

    /// Upper-case mnemonic used by the disassembler.
    pub const fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            PopTop => "POP_TOP",
            RotTwo => "ROT_TWO",
            RotThree => "ROT_THREE",
            RotFour => "ROT_FOUR",
            DupTop => "DUP_TOP",
            DupTopTwo => "DUP_TOP_TWO",
            DupTopThree => "DUP_TOP_THREE",
            UnaryPositive => "UNARY_POSITIVE",
            UnaryNegative => "UNARY_NEGATIVE",
            UnaryNot => "UNARY_NOT",
            UnaryInvert => "UNARY_INVERT",
            GetIter => "GET_ITER",
            BinaryAdd => "BINARY_ADD",
            BinarySubtract => "BINARY_SUBTRACT",
            BinaryMultiply => "BINARY_MULTIPLY",
            BinaryDivide => "BINARY_DIVIDE",
            BinaryFloorDivide => "BINARY_FLOOR_DIVIDE",
            BinaryModulo => "BINARY_MODULO",
            BinaryPower => "BINARY_POWER",
            BinaryLshift => "BINARY_LSHIFT",
            BinaryRshift => "BINARY_RSHIFT",
            BinaryAnd => "BINARY_AND",
            BinaryXor => "BINARY_XOR",
            BinaryOr => "BINARY_OR",
            BinarySubscr => "BINARY_SUBSCR",
            InplaceAdd => "INPLACE_ADD",
            InplaceSubtract => "INPLACE_SUBTRACT",
            InplaceMultiply => "INPLACE_MULTIPLY",
            InplaceDivide => "INPLACE_DIVIDE",
            InplaceFloorDivide => "INPLACE_FLOOR_DIVIDE",
            InplaceModulo => "INPLACE_MODULO",
            InplacePower => "INPLACE_POWER",
            InplaceLshift => "INPLACE_LSHIFT",
            InplaceRshift => "INPLACE_RSHIFT",
            InplaceAnd => "INPLACE_AND",
            InplaceXor => "INPLACE_XOR",
            InplaceOr => "INPLACE_OR",
            StoreSubscr => "STORE_SUBSCR",
            DeleteSubscr => "DELETE_SUBSCR",
            StoreMap => "STORE_MAP",
            ListAppend => "LIST_APPEND",
            BuildSliceTwo => "BUILD_SLICE_TWO",
            BuildSliceThree => "BUILD_SLICE_THREE",
            BreakLoop => "BREAK_LOOP",
            WithCleanup => "WITH_CLEANUP",
            ReturnValue => "RETURN_VALUE",
            YieldValue => "YIELD_VALUE",
            PopBlock => "POP_BLOCK",
            EndFinally => "END_FINALLY",
            RaiseVarargsZero => "RAISE_VARARGS_ZERO",
            RaiseVarargsOne => "RAISE_VARARGS_ONE",
            RaiseVarargsTwo => "RAISE_VARARGS_TWO",
            RaiseVarargsThree => "RAISE_VARARGS_THREE",
            LoadConst => "LOAD_CONST",
            LoadName => "LOAD_NAME",
            StoreName => "STORE_NAME",
            DeleteName => "DELETE_NAME",
            LoadGlobal => "LOAD_GLOBAL",
            StoreGlobal => "STORE_GLOBAL",
            DeleteGlobal => "DELETE_GLOBAL",
            LoadFast => "LOAD_FAST",
            StoreFast => "STORE_FAST",
            DeleteFast => "DELETE_FAST",
            LoadClosure => "LOAD_CLOSURE",
            LoadDeref => "LOAD_DEREF",
            StoreDeref => "STORE_DEREF",
            LoadAttr => "LOAD_ATTR",
            StoreAttr => "STORE_ATTR",
            DeleteAttr => "DELETE_ATTR",
            BuildTuple => "BUILD_TUPLE",
            BuildList => "BUILD_LIST",
            BuildMap => "BUILD_MAP",
            UnpackSequence => "UNPACK_SEQUENCE",
            CompareOp => "COMPARE_OP",
            LoadMethod => "LOAD_METHOD",
            JumpForward => "JUMP_FORWARD",
            JumpAbsolute => "JUMP_ABSOLUTE",
            PopJumpIfFalse => "POP_JUMP_IF_FALSE",
            PopJumpIfTrue => "POP_JUMP_IF_TRUE",
            JumpIfFalseOrPop => "JUMP_IF_FALSE_OR_POP",
            JumpIfTrueOrPop => "JUMP_IF_TRUE_OR_POP",
            ForIter => "FOR_ITER",
            ContinueLoop => "CONTINUE_LOOP",
            SetupLoop => "SETUP_LOOP",
            SetupExcept => "SETUP_EXCEPT",
            SetupFinally => "SETUP_FINALLY",
            CallFunction => "CALL_FUNCTION",
            CallFunctionVar => "CALL_FUNCTION_VAR",
            CallFunctionKw => "CALL_FUNCTION_KW",
            CallFunctionVarKw => "CALL_FUNCTION_VAR_KW",
            CallMethod => "CALL_METHOD",
            MakeFunction => "MAKE_FUNCTION",
            MakeClosure => "MAKE_CLOSURE",
            ExtendedArg => "EXTENDED_ARG",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Encoded size in bytes of an instruction with this opcode and argument,
/// including any `EXTENDED_ARG` prefix.
#[inline]
pub const fn instr_size(op: Opcode, arg: u32) -> u32 {
    if !op.has_arg() {
        1
    } else if arg > 0xffff {
        6
    } else {
        3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_opcodes() -> Vec<Opcode> {
        (0..=255u8).filter_map(Opcode::from_u8).collect()
    }

    #[test]
    fn test_from_u8_roundtrip() {
        let ops = all_opcodes();
        assert_eq!(ops.len(), 94);
        for op in ops {
            assert_eq!(Opcode::from_u8(op as u8), Some(op));
        }
        assert_eq!(Opcode::from_u8(0x00), None);
        assert_eq!(Opcode::from_u8(0xFF), None);
    }

    #[test]
    fn test_jumps_take_arguments() {
        for op in all_opcodes() {
            if op.is_jump() {
                assert!(op.has_arg(), "{op} is a jump without an argument");
            }
        }
    }

    #[test]
    fn test_names_unique() {
        let mut names: Vec<_> = all_opcodes().into_iter().map(Opcode::name).collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
    }

    #[test]
    fn test_call_nargs() {
        assert_eq!(call_nargs(3), 3);
        assert_eq!(call_nargs(pack_call_arg(1, 2)), 5);
        assert_eq!(Opcode::CallFunction.stack_effect(pack_call_arg(1, 2)), -5);
        assert_eq!(Opcode::CallMethod.stack_effect(1), -2);
        assert_eq!(Opcode::CallFunctionVarKw.stack_effect(0), -2);
    }

    #[test]
    fn test_variable_effects() {
        assert_eq!(Opcode::BuildTuple.stack_effect(0), 1);
        assert_eq!(Opcode::BuildTuple.stack_effect(4), -3);
        assert_eq!(Opcode::UnpackSequence.stack_effect(3), 2);
        assert_eq!(Opcode::MakeClosure.stack_effect(2), -3);
        assert_eq!(Opcode::MakeFunction.stack_effect(0), 0);
    }

    #[test]
    fn test_jump_edge_effects() {
        assert_eq!(Opcode::ForIter.stack_effect(0), 1);
        assert_eq!(Opcode::ForIter.jump_effect(0), -1);
        assert_eq!(Opcode::SetupFinally.stack_effect(0), 0);
        assert_eq!(Opcode::SetupFinally.jump_effect(0), 3);
        assert_eq!(Opcode::JumpIfTrueOrPop.stack_effect(0), -1);
        assert_eq!(Opcode::JumpIfTrueOrPop.jump_effect(0), 0);
        assert_eq!(Opcode::PopJumpIfFalse.jump_effect(0), -1);
        assert_eq!(Opcode::BinaryAdd.jump_effect(0), -1);
    }

    #[test]
    fn test_instr_size() {
        assert_eq!(instr_size(Opcode::PopTop, 0), 1);
        assert_eq!(instr_size(Opcode::LoadConst, 0xffff), 3);
        assert_eq!(instr_size(Opcode::LoadConst, 0x10000), 6);
    }

    #[test]
    fn test_terminators() {
        assert!(Opcode::ReturnValue.is_terminator());
        assert!(Opcode::JumpForward.is_terminator());
        assert!(!Opcode::PopJumpIfFalse.is_terminator());
        assert!(!Opcode::ForIter.is_terminator());
    }
}
