//! Call frame with an operand stack and a dynamic block stack.
//!
//! A frame owns everything one activation needs: the code being executed,
//! the operand stack, fast locals, cells, and the stack of active loop and
//! exception blocks. Generators keep their frame boxed between resumptions.

use crate::error::{RuntimeError, VmResult};
use crate::specialize::SpecializationPlan;
use crate::validate::BytecodeError;
use crate::value::{CellRef, Dict, DictRef, Function, Value};
use kite_compiler::{CodeFlags, CompiledCode};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// What pushed a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// `SETUP_LOOP`; `handler` is the loop exit.
    Loop,
    /// `SETUP_EXCEPT`; `handler` is the first except clause.
    Except,
    /// `SETUP_FINALLY`; `handler` is the finally body.
    Finally,
}

/// One entry of the block stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    /// Absolute offset control transfers to when the block is unwound.
    pub handler: u32,
    /// Operand stack depth when the block was pushed.
    pub level: usize,
}

/// One activation of a code object.
pub struct Frame {
    pub code: Arc<CompiledCode>,
    /// Offset of the next instruction.
    pub pc: u32,
    /// Offset of the instruction being executed.
    pub last_offset: u32,
    pub stack: Vec<Value>,
    /// Fast locals, indexed like `code.varnames`. `None` is unbound.
    pub fast: Vec<Option<Value>>,
    /// Cell variables followed by free variables.
    pub cells: Vec<CellRef>,
    pub globals: DictRef,
    /// Name-based locals for module, class and unoptimized function scopes.
    pub locals: Option<DictRef>,
    pub blocks: SmallVec<[Block; 8]>,
    /// Exception currently being handled, for a bare `raise`.
    pub handled: Option<RuntimeError>,
    pub(crate) plan: Option<Rc<SpecializationPlan>>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("code", &self.code.name)
            .field("pc", &self.pc)
            .field("stack_depth", &self.stack.len())
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl Frame {
    /// Frame with empty locals and fresh cells.
    pub fn new(code: Arc<CompiledCode>, globals: DictRef, locals: Option<DictRef>) -> Self {
        let cells = (0..code.ncells())
            .map(|_| Rc::new(RefCell::new(None)))
            .collect();
        Self {
            fast: vec![None; code.nlocals()],
            stack: Vec::with_capacity(code.max_stack_depth as usize),
            cells,
            globals,
            locals,
            code,
            pc: 0,
            last_offset: 0,
            blocks: SmallVec::new(),
            handled: None,
            plan: None,
        }
    }

    /// Module-level frame: locals are the globals.
    pub fn module(code: Arc<CompiledCode>, globals: DictRef) -> Self {
        let locals = Some(Rc::clone(&globals));
        Self::new(code, globals, locals)
    }

    /// Frame for calling `func` with bound arguments.
    pub fn for_call(
        func: &Function,
        args: Vec<Value>,
        kwargs: Vec<(Arc<str>, Value)>,
    ) -> VmResult<Self> {
        let code = Arc::clone(&func.code);
        let locals = needs_locals_dict(&code).then(|| Rc::new(RefCell::new(Dict::new())));
        let mut frame = Self::new(code, Rc::clone(&func.globals), locals);
        frame.bind_arguments(func, args, kwargs)?;

        let ncellvars = frame.code.cellvars.len();
        for (slot, cell) in func.closure.iter().enumerate() {
            if let Some(target) = frame.cells.get_mut(ncellvars + slot) {
                *target = Rc::clone(cell);
            }
        }
        Ok(frame)
    }

    /// Frame for a positional call whose shape the caller has already
    /// checked with [`Function::is_simple_call`].
    pub fn for_simple_call(func: &Function, args: Vec<Value>) -> Self {
        let code = Arc::clone(&func.code);
        let mut frame = Self::new(code, Rc::clone(&func.globals), None);
        for (slot, arg) in frame.fast.iter_mut().zip(args) {
            *slot = Some(arg);
        }
        frame.init_param_cells();
        let ncellvars = frame.code.cellvars.len();
        for (slot, cell) in func.closure.iter().enumerate() {
            if let Some(target) = frame.cells.get_mut(ncellvars + slot) {
                *target = Rc::clone(cell);
            }
        }
        frame
    }

    // =========================================================================
    // Argument Binding
    // =========================================================================

    fn bind_arguments(
        &mut self,
        func: &Function,
        args: Vec<Value>,
        kwargs: Vec<(Arc<str>, Value)>,
    ) -> VmResult<()> {
        let code = Arc::clone(&self.code);
        let argcount = code.argcount as usize;
        let has_varargs = code.flags.contains(CodeFlags::VARARGS);
        let has_varkw = code.flags.contains(CodeFlags::VARKEYWORDS);
        let given = args.len();

        let mut args = args.into_iter();
        for slot in self.fast.iter_mut().take(argcount) {
            match args.next() {
                Some(arg) => *slot = Some(arg),
                None => break,
            }
        }
        let extra: Vec<Value> = args.collect();
        if has_varargs {
            self.fast[argcount] = Some(Value::tuple(extra));
        } else if !extra.is_empty() {
            return Err(arity_error(func, given + kwargs.len()));
        }

        let mut varkw = has_varkw.then(Dict::new);
        for (name, value) in kwargs {
            match code.varnames[..argcount].iter().position(|p| **p == *name) {
                Some(i) if self.fast[i].is_some() => {
                    return Err(RuntimeError::type_error(format!(
                        "{}() got multiple values for keyword argument '{name}'",
                        func.name
                    )));
                }
                Some(i) => self.fast[i] = Some(value),
                None => match varkw.as_mut() {
                    Some(dict) => dict.set_str(name, value),
                    None => {
                        return Err(RuntimeError::type_error(format!(
                            "{}() got an unexpected keyword argument '{name}'",
                            func.name
                        )));
                    }
                },
            }
        }
        if let Some(dict) = varkw {
            self.fast[argcount + usize::from(has_varargs)] = Some(Value::dict(dict));
        }

        let first_default = argcount.saturating_sub(func.defaults.len());
        for i in 0..argcount {
            if self.fast[i].is_some() {
                continue;
            }
            match i.checked_sub(first_default).and_then(|d| func.defaults.get(d)) {
                Some(default) => self.fast[i] = Some(default.clone()),
                None => return Err(arity_error(func, given)),
            }
        }

        self.init_param_cells();
        Ok(())
    }

    /// Parameters captured by nested scopes start out in their cells.
    fn init_param_cells(&mut self) {
        let code = &self.code;
        for (c, name) in code.cellvars.iter().enumerate() {
            if let Some(i) = code.varnames.iter().position(|v| v == name)
                && let Some(value) = self.fast[i].take()
            {
                *self.cells[c].borrow_mut() = Some(value);
            }
        }
    }

    // =========================================================================
    // Operand Stack
    // =========================================================================

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or_else(|| self.underflow())
    }

    /// Pop `n` values, returned bottom first.
    pub fn pop_n(&mut self, n: usize) -> VmResult<Vec<Value>> {
        let len = self.stack.len();
        if n > len {
            return Err(self.underflow());
        }
        Ok(self.stack.split_off(len - n))
    }

    /// Value `depth` slots below the top.
    #[inline]
    pub fn peek(&self, depth: usize) -> VmResult<&Value> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .map(|i| &self.stack[i])
            .ok_or_else(|| self.underflow())
    }

    #[inline]
    pub fn top(&self) -> VmResult<&Value> {
        self.peek(0)
    }

    #[cold]
    fn underflow(&self) -> RuntimeError {
        RuntimeError::internal(format!(
            "operand stack underflow at offset {} in {}",
            self.last_offset, self.code.name
        ))
    }

    // =========================================================================
    // Tables
    // =========================================================================

    // Handlers reach these with operands the validator may not have seen,
    // so an index past its table is malformed bytecode, not a panic.
    fn out_of_range(&self, table: &'static str, index: u32) -> RuntimeError {
        RuntimeError::malformed(BytecodeError::OperandOutOfRange {
            offset: self.last_offset,
            table,
            index,
        })
    }

    #[inline]
    pub fn name(&self, index: u32) -> VmResult<Arc<str>> {
        self.code
            .names
            .get(index as usize)
            .cloned()
            .ok_or_else(|| self.out_of_range("names", index))
    }

    #[inline]
    pub fn constant(&self, index: u32) -> VmResult<Value> {
        self.code
            .constants
            .get(index as usize)
            .map(Value::from_constant)
            .ok_or_else(|| self.out_of_range("constants", index))
    }

    /// Name of a fast local slot.
    pub fn varname(&self, index: u32) -> VmResult<&Arc<str>> {
        self.code
            .varnames
            .get(index as usize)
            .ok_or_else(|| self.out_of_range("varnames", index))
    }

    /// A fast local slot.
    #[inline]
    pub fn fast_slot(&mut self, index: u32) -> VmResult<&mut Option<Value>> {
        if index as usize >= self.fast.len() {
            return Err(self.out_of_range("varnames", index));
        }
        Ok(&mut self.fast[index as usize])
    }

    /// A cell or free slot.
    #[inline]
    pub fn cell(&self, index: u32) -> VmResult<&CellRef> {
        self.cells
            .get(index as usize)
            .ok_or_else(|| self.out_of_range("cells", index))
    }

    /// Name of a cell or free slot.
    pub fn cell_name(&self, index: u32) -> VmResult<&Arc<str>> {
        let slot = index as usize;
        let ncellvars = self.code.cellvars.len();
        let name = if slot < ncellvars {
            self.code.cellvars.get(slot)
        } else {
            self.code.freevars.get(slot - ncellvars)
        };
        name.ok_or_else(|| self.out_of_range("cells", index))
    }

    /// Source line of the current instruction.
    #[inline]
    pub fn line(&self) -> u32 {
        self.code.line_for_offset(self.last_offset)
    }

    // =========================================================================
    // Block Stack
    // =========================================================================

    #[inline]
    pub fn push_block(&mut self, kind: BlockKind, handler: u32) {
        self.blocks.push(Block {
            kind,
            handler,
            level: self.stack.len(),
        });
    }

    #[inline]
    pub fn pop_block(&mut self) -> VmResult<Block> {
        self.blocks.pop().ok_or_else(|| {
            RuntimeError::internal(format!(
                "block stack underflow at offset {} in {}",
                self.last_offset, self.code.name
            ))
        })
    }
}

/// Unoptimized and class-body scopes resolve names through a dictionary.
fn needs_locals_dict(code: &CompiledCode) -> bool {
    code.flags.contains(CodeFlags::NEWLOCALS) && !code.flags.contains(CodeFlags::OPTIMIZED)
}

fn arity_error(func: &Function, given: usize) -> RuntimeError {
    let code = &func.code;
    let argcount = code.argcount as usize;
    let ndefaults = func.defaults.len().min(argcount);
    let (qualifier, expected) = if given > argcount {
        (if ndefaults > 0 { "at most" } else { "exactly" }, argcount)
    } else if ndefaults > 0 || code.flags.contains(CodeFlags::VARARGS) {
        ("at least", argcount - ndefaults)
    } else {
        ("exactly", argcount)
    };
    let plural = if expected == 1 { "" } else { "s" };
    RuntimeError::type_error(format!(
        "{}() takes {qualifier} {expected} argument{plural} ({given} given)",
        func.name
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeErrorKind;
    use crate::value::ObjectId;
    use kite_compiler::{CodeId, Constant};

    fn code(params: &[&str], argcount: u32, flags: CodeFlags, cellvars: &[&str]) -> Arc<CompiledCode> {
        Arc::new(CompiledCode {
            id: CodeId::fresh(),
            name: Arc::from("f"),
            filename: Arc::from("<test>"),
            bytecode: Box::new([]),
            constants: vec![Constant::None].into_boxed_slice(),
            names: Box::new([]),
            varnames: params.iter().map(|p| Arc::from(*p)).collect(),
            freevars: Box::new([]),
            cellvars: cellvars.iter().map(|p| Arc::from(*p)).collect(),
            argcount,
            max_stack_depth: 4,
            flags: flags | CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS,
            lnotab: Box::new([]),
            first_line: 1,
        })
    }

    fn function(code: Arc<CompiledCode>, defaults: Vec<Value>) -> Function {
        Function {
            id: ObjectId::fresh(),
            name: Arc::from("f"),
            code,
            globals: Rc::new(RefCell::new(Dict::new())),
            defaults,
            closure: Vec::new(),
        }
    }

    fn fast_ints(frame: &Frame) -> Vec<Option<i64>> {
        frame
            .fast
            .iter()
            .map(|v| v.as_ref().and_then(Value::as_int))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Binding
    // -------------------------------------------------------------------------

    #[test]
    fn test_positional_and_defaults() {
        let f = function(code(&["a", "b"], 2, CodeFlags::NONE, &[]), vec![Value::Int(9)]);
        let frame = Frame::for_call(&f, vec![Value::Int(1)], vec![]).unwrap();
        assert_eq!(fast_ints(&frame), vec![Some(1), Some(9)]);
        assert!(frame.locals.is_none());
    }

    #[test]
    fn test_keywords() {
        let f = function(code(&["a", "b"], 2, CodeFlags::NONE, &[]), vec![]);
        let frame = Frame::for_call(
            &f,
            vec![Value::Int(1)],
            vec![(Arc::from("b"), Value::Int(2))],
        )
        .unwrap();
        assert_eq!(fast_ints(&frame), vec![Some(1), Some(2)]);

        let err = Frame::for_call(&f, vec![Value::Int(1)], vec![(Arc::from("a"), Value::Int(2))])
            .err()
            .unwrap();
        assert!(err.message.contains("multiple values"));

        let err = Frame::for_call(&f, vec![], vec![(Arc::from("z"), Value::Int(2))])
            .err()
            .unwrap();
        assert_eq!(&*err.message, "f() got an unexpected keyword argument 'z'");
    }

    #[test]
    fn test_star_args_and_kwargs() {
        let f = function(
            code(&["a", "rest", "kw"], 1, CodeFlags::VARARGS | CodeFlags::VARKEYWORDS, &[]),
            vec![],
        );
        let frame = Frame::for_call(
            &f,
            vec![Value::Int(1), Value::Int(2), Value::Int(3)],
            vec![(Arc::from("k"), Value::Int(4))],
        )
        .unwrap();
        assert_eq!(frame.fast[1].as_ref().unwrap().repr(), "(2, 3)");
        assert_eq!(frame.fast[2].as_ref().unwrap().repr(), "{'k': 4}");
    }

    #[test]
    fn test_arity_errors() {
        let f = function(code(&["a", "b"], 2, CodeFlags::NONE, &[]), vec![]);
        let err = Frame::for_call(&f, vec![Value::Int(1)], vec![]).err().unwrap();
        assert_eq!(err.kind, RuntimeErrorKind::TypeError);
        assert_eq!(&*err.message, "f() takes exactly 2 arguments (1 given)");

        let err = Frame::for_call(&f, vec![Value::Int(1); 3], vec![]).err().unwrap();
        assert_eq!(&*err.message, "f() takes exactly 2 arguments (3 given)");

        let g = function(code(&["a", "b"], 2, CodeFlags::NONE, &[]), vec![Value::None]);
        let err = Frame::for_call(&g, vec![], vec![]).err().unwrap();
        assert_eq!(&*err.message, "f() takes at least 1 argument (0 given)");
    }

    #[test]
    fn test_param_cells_start_bound() {
        let f = function(code(&["x"], 1, CodeFlags::NONE, &["x"]), vec![]);
        let frame = Frame::for_call(&f, vec![Value::Int(5)], vec![]).unwrap();
        assert_eq!(frame.cells[0].borrow().as_ref().and_then(Value::as_int), Some(5));
    }

    // -------------------------------------------------------------------------
    // Stacks
    // -------------------------------------------------------------------------

    #[test]
    fn test_stack_ops() {
        let f = function(code(&[], 0, CodeFlags::NONE, &[]), vec![]);
        let mut frame = Frame::for_simple_call(&f, vec![]);
        frame.push(Value::Int(1));
        frame.push(Value::Int(2));
        frame.push(Value::Int(3));
        assert_eq!(frame.peek(2).unwrap().as_int(), Some(1));
        let top = frame.pop_n(2).unwrap();
        assert_eq!(top.iter().filter_map(Value::as_int).collect::<Vec<_>>(), vec![2, 3]);
        assert!(frame.pop_n(5).is_err());
        frame.pop().unwrap();
        let err = frame.pop().unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::Internal);
    }

    #[test]
    fn test_block_records_level() {
        let f = function(code(&[], 0, CodeFlags::NONE, &[]), vec![]);
        let mut frame = Frame::for_simple_call(&f, vec![]);
        frame.push(Value::None);
        frame.push_block(BlockKind::Except, 40);
        let block = frame.pop_block().unwrap();
        assert_eq!(block.level, 1);
        assert_eq!(block.handler, 40);
        assert!(frame.pop_block().is_err());
    }
}
