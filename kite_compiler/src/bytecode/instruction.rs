//! Instruction records and their byte encoding.
//!
//! While a unit is being compiled, instructions live in basic blocks as
//! [`Instr`] records that keep the full argument width and the target block of
//! jumps. The assembler encodes them with [`encode`]; the interpreter and the
//! disassembler read them back with [`decode`].

use super::block::BlockId;
use super::opcode::{JumpKind, Opcode, instr_size};
use std::fmt;
use thiserror::Error;

/// One instruction inside a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    /// Operation.
    pub opcode: Opcode,
    /// Full-width argument (0 when the opcode takes none). For jumps this is
    /// filled in by the assembler.
    pub arg: u32,
    /// Source line, or 0 when the instruction carries no line entry.
    pub line: u32,
    /// Target block of a jump.
    pub target: Option<BlockId>,
}

impl Instr {
    /// An instruction without an argument.
    #[inline]
    pub const fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            arg: 0,
            line: 0,
            target: None,
        }
    }

    /// An instruction with an argument.
    #[inline]
    pub const fn with_arg(opcode: Opcode, arg: u32) -> Self {
        Self {
            opcode,
            arg,
            line: 0,
            target: None,
        }
    }

    /// A jump to `target`; the argument is resolved during assembly.
    #[inline]
    pub const fn jump(opcode: Opcode, target: BlockId) -> Self {
        Self {
            opcode,
            arg: 0,
            line: 0,
            target: Some(target),
        }
    }

    /// Whether an argument is encoded.
    #[inline]
    pub const fn has_arg(&self) -> bool {
        self.opcode.has_arg()
    }

    /// Jump classification from the opcode table.
    #[inline]
    pub const fn jump_kind(&self) -> JumpKind {
        self.opcode.jump_kind()
    }

    /// Encoded size in bytes with the current argument.
    #[inline]
    pub const fn size(&self) -> u32 {
        instr_size(self.opcode, self.arg)
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        if let Some(target) = self.target {
            write!(f, " -> {target}")?;
        } else if self.has_arg() {
            write!(f, " {}", self.arg)?;
        }
        Ok(())
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Append the encoding of `op arg` to `out`, with an `EXTENDED_ARG` prefix when
/// the argument does not fit in 16 bits.
pub fn encode(op: Opcode, arg: u32, out: &mut Vec<u8>) {
    if !op.has_arg() {
        out.push(op as u8);
        return;
    }
    if arg > 0xffff {
        let hi = arg >> 16;
        out.push(Opcode::ExtendedArg as u8);
        out.extend_from_slice(&(hi as u16).to_le_bytes());
    }
    out.push(op as u8);
    out.extend_from_slice(&(arg as u16).to_le_bytes());
}

// =============================================================================
// Decoding
// =============================================================================

/// A decoded instruction with its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    /// Offset of the first byte, including any `EXTENDED_ARG` prefix.
    pub offset: u32,
    /// Operation.
    pub opcode: Opcode,
    /// Full argument with the prefix folded in.
    pub arg: u32,
    /// Total encoded size.
    pub size: u32,
}

impl Decoded {
    /// Offset of the following instruction.
    #[inline]
    pub const fn next_offset(&self) -> u32 {
        self.offset + self.size
    }

    /// Resolved jump target offset, if this is a jump.
    #[inline]
    pub const fn jump_target(&self) -> Option<u32> {
        match self.opcode.jump_kind() {
            JumpKind::None => None,
            JumpKind::Relative => Some(self.next_offset() + self.arg),
            JumpKind::Absolute => Some(self.arg),
        }
    }
}

/// Bytecode that cannot be decoded.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Byte is not an opcode.
    #[error("unknown opcode 0x{byte:02x} at offset {offset}")]
    UnknownOpcode {
        /// Offending offset.
        offset: u32,
        /// Offending byte.
        byte: u8,
    },
    /// The code ends in the middle of an instruction.
    #[error("truncated instruction at offset {offset}")]
    Truncated {
        /// Offset of the incomplete instruction.
        offset: u32,
    },
    /// `EXTENDED_ARG` not followed by an opcode with an argument.
    #[error("dangling EXTENDED_ARG at offset {offset}")]
    DanglingExtendedArg {
        /// Offset of the prefix.
        offset: u32,
    },
}

/// Decode the instruction starting at `offset`.
pub fn decode_at(code: &[u8], offset: u32) -> Result<Decoded, DecodeError> {
    let start = offset;
    let mut pos = offset as usize;
    let mut ext = 0u32;

    let read_arg = |pos: usize| -> Result<u32, DecodeError> {
        match code.get(pos + 1..pos + 3) {
            Some(bytes) => Ok(u32::from(u16::from_le_bytes([bytes[0], bytes[1]]))),
            None => Err(DecodeError::Truncated { offset: start }),
        }
    };

    let byte = *code.get(pos).ok_or(DecodeError::Truncated { offset: start })?;
    let mut op = Opcode::from_u8(byte).ok_or(DecodeError::UnknownOpcode {
        offset: start,
        byte,
    })?;
    if op == Opcode::ExtendedArg {
        ext = read_arg(pos)? << 16;
        pos += 3;
        let byte = *code
            .get(pos)
            .ok_or(DecodeError::DanglingExtendedArg { offset: start })?;
        op = Opcode::from_u8(byte).ok_or(DecodeError::UnknownOpcode {
            offset: pos as u32,
            byte,
        })?;
        if !op.has_arg() || op == Opcode::ExtendedArg {
            return Err(DecodeError::DanglingExtendedArg { offset: start });
        }
    }

    if !op.has_arg() {
        return Ok(Decoded {
            offset: start,
            opcode: op,
            arg: 0,
            size: 1,
        });
    }
    let arg = ext | read_arg(pos)?;
    Ok(Decoded {
        offset: start,
        opcode: op,
        arg,
        size: (pos as u32 + 3) - start,
    })
}

/// Iterate over every instruction in `code`.
pub fn decode(code: &[u8]) -> Decoder<'_> {
    Decoder { code, offset: 0 }
}

/// Iterator returned by [`decode`]. Stops after the first error.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    code: &'a [u8],
    offset: u32,
}

impl Iterator for Decoder<'_> {
    type Item = Result<Decoded, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset as usize >= self.code.len() {
            return None;
        }
        match decode_at(self.code, self.offset) {
            Ok(d) => {
                self.offset = d.next_offset();
                Some(Ok(d))
            }
            Err(e) => {
                self.offset = self.code.len() as u32;
                Some(Err(e))
            }
        }
    }
}
