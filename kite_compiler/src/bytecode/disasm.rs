//! Human-readable listing of compiled code.
//!
//! ```text
//!   1           0 LOAD_CONST               0 (1)
//!               3 STORE_NAME               0 (x)
//!   2     >>    6 LOAD_NAME                0 (x)
//!               9 POP_JUMP_IF_FALSE       18
//! ```

use super::code::{CompiledCode, Constant};
use super::instruction::{DecodeError, decode};
use super::lnotab;
use super::opcode::{COMPARE_EXC_MATCH, Opcode};
use kite_core::ast::CmpOp;
use rustc_hash::FxHashSet;
use std::fmt::Write;

/// Disassemble `code` and, recursively, every nested code object.
pub fn disassemble(code: &CompiledCode) -> Result<String, DecodeError> {
    let mut out = String::new();
    disassemble_into(code, &mut out)?;
    Ok(out)
}

fn disassemble_into(code: &CompiledCode, out: &mut String) -> Result<(), DecodeError> {
    let _ = writeln!(
        out,
        "Disassembly of <code {}> ({}, flags: {}, stack: {}):",
        code.name, code.filename, code.flags, code.max_stack_depth
    );

    let decoded = decode(&code.bytecode).collect::<Result<Vec<_>, _>>()?;
    let targets: FxHashSet<u32> = decoded.iter().filter_map(|d| d.jump_target()).collect();
    let starts: FxHashSet<u32> = lnotab::transitions(&code.lnotab, code.first_line)
        .into_iter()
        .map(|(offset, _)| offset)
        .chain(std::iter::once(0))
        .collect();

    for d in &decoded {
        if starts.contains(&d.offset) {
            let _ = write!(out, "{:>4}", code.line_for_offset(d.offset));
        } else {
            out.push_str("    ");
        }
        let marker = if targets.contains(&d.offset) { ">>" } else { "  " };
        let _ = write!(out, "    {marker} {:>5} {:<24}", d.offset, d.opcode.name());
        if d.opcode.has_arg() {
            let _ = write!(out, " {:>4}", d.arg);
            if let Some(detail) = describe_arg(code, d.opcode, d.arg, d.jump_target()) {
                let _ = write!(out, " ({detail})");
            }
        }
        out.push('\n');
    }

    for nested in code.nested() {
        out.push('\n');
        disassemble_into(nested, out)?;
    }
    Ok(())
}

fn describe_arg(code: &CompiledCode, op: Opcode, arg: u32, target: Option<u32>) -> Option<String> {
    let idx = arg as usize;
    match op {
        Opcode::LoadConst => code.constants.get(idx).map(|c| match c {
            Constant::Code(nested) => format!("<code {}>", nested.name),
            other => other.to_string(),
        }),
        Opcode::LoadName
        | Opcode::StoreName
        | Opcode::DeleteName
        | Opcode::LoadGlobal
        | Opcode::StoreGlobal
        | Opcode::DeleteGlobal
        | Opcode::LoadAttr
        | Opcode::StoreAttr
        | Opcode::DeleteAttr
        | Opcode::LoadMethod => code.names.get(idx).map(|n| n.to_string()),
        Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => {
            code.varnames.get(idx).map(|n| n.to_string())
        }
        Opcode::LoadClosure | Opcode::LoadDeref | Opcode::StoreDeref => code
            .cellvars
            .iter()
            .chain(code.freevars.iter())
            .nth(idx)
            .map(|n| n.to_string()),
        Opcode::CompareOp if arg == COMPARE_EXC_MATCH => Some("exception match".into()),
        Opcode::CompareOp => CmpOp::from_arg(arg).map(|c| c.symbol().to_string()),
        _ if op.is_jump() => target.map(|t| format!("to {t}")),
        _ => None,
    }
}
