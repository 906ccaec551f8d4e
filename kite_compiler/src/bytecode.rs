//! Bytecode definitions: the opcode table, instruction encoding, the block
//! graph, stack analysis, assembly and the line table.

pub mod assembler;
pub mod block;
pub mod code;
pub mod disasm;
pub mod instruction;
pub mod lnotab;
pub mod opcode;
pub mod stackdepth;

pub use assembler::assemble;
pub use block::{BasicBlock, BlockGraph, BlockId};
pub use code::{CodeFlags, CodeId, CompiledCode, Constant};
pub use disasm::disassemble;
pub use instruction::{DecodeError, Decoded, Instr, decode, decode_at, encode};
pub use opcode::{COMPARE_EXC_MATCH, HAVE_ARGUMENT, JumpKind, Opcode, call_nargs, pack_call_arg};
pub use stackdepth::{StackDepthError, compute_max_depth};
