//! Virtual machine implementation.
//!
//! The `Vm` owns the builtins, the module globals, the feedback store and
//! the invalidation registry, and runs frames through the dispatch loop.
//! Calls between Python functions push frames onto the dispatch loop's own
//! frame stack; `max_recursion_depth` bounds how many are live.
//!
//! # Execution
//!
//! ```text
//! decode ──► planned site? ──yes──► specialize::run_site ──┐
//!               │ no                                       │
//!               ▼                                          ▼
//!        baseline handler ─────────────────────────► ControlFlow
//!                                                          │
//!             Continue / Jump / Return / Yield / Unwind ◄──┘
//! ```
//!
//! Entering a frame and taking a backward jump heat the code object. Once it
//! is hot a [`SpecializationPlan`] is built from its feedback; the plan is
//! rebuilt when feedback changes and discarded when invalidated.

use crate::branch::CondBranchStats;
use crate::builtins::exceptions::new_exception;
use crate::builtins::{self, CallContext, methods};
use crate::config::VmConfig;
use crate::dispatch::{ControlFlow, Why, handler};
use crate::error::{RuntimeError, RuntimeErrorKind, TraceEntry, VmResult};
use crate::feedback::{CallTarget, CalleeKind, FeedbackStore};
use crate::frame::{BlockKind, Frame};
use crate::guard::BailoutCounter;
use crate::invalidation::InvalidationRegistry;
use crate::ops::containers::make_iter;
use crate::specialize::{self, SpecializationPlan, build_plan};
use crate::validate::{BytecodeError, validate};
use crate::value::{
    BoundMethod, Builtin, Class, Dict, DictRef, Function, GenState, Generator, Instance,
    ObjectId, Pending, TypeTag, Value,
};
use kite_compiler::{CodeId, CompiledCode, CompilerConfig, compile_module, decode_at};
use kite_core::KiteError;
use kite_core::ast::Module;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::debug;

/// Counters describing what the specializer did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    /// Plans built, including rebuilds after feedback changed.
    pub plans_built: u64,
    /// Plans dropped because a watched object was mutated.
    pub plans_discarded: u64,
    /// Planned instructions that ran their fast path.
    pub fast_hits: u64,
    pub bailouts: BailoutCounter,
    /// Branch prediction outcomes, summed over every plan built.
    pub branches: CondBranchStats,
}

/// How a frame stopped running.
#[derive(Debug)]
enum FrameExit {
    Return(Value),
    Yield(Value),
}

/// Result of binding a call to a Python function.
enum Activation {
    /// A frame ready to run.
    Frame(Frame),
    /// Generator functions return a generator without running.
    Generator(Value),
}

/// What the dispatch loop does with its frame stack after an instruction.
enum Transfer {
    Call(Frame),
    Exit(FrameExit),
}

/// The Kite virtual machine.
pub struct Vm {
    config: VmConfig,
    pub(crate) builtins: DictRef,
    pub(crate) globals: DictRef,
    exception_classes: FxHashMap<Arc<str>, Rc<Class>>,
    /// Bound-method builtins by receiver type and name.
    methods: FxHashMap<(TypeTag, &'static str), Rc<Builtin>>,
    feedback: FeedbackStore,
    pub(crate) registry: Arc<InvalidationRegistry>,
    pub(crate) stats: VmStats,
    output: String,
    depth: usize,
    validated: FxHashSet<CodeId>,
}

impl Vm {
    /// Create a VM with its own invalidation registry.
    pub fn new(config: VmConfig) -> Self {
        Self::with_registry(config, Arc::new(InvalidationRegistry::new()))
    }

    /// Create a VM that shares `registry`.
    pub fn with_registry(config: VmConfig, registry: Arc<InvalidationRegistry>) -> Self {
        let mut builtins = Dict::new();
        let exception_classes = builtins::install(&mut builtins);
        let mut globals = Dict::new();
        globals.set_str(Arc::from("__name__"), Value::str("__main__"));
        Self {
            config,
            builtins: Rc::new(RefCell::new(builtins)),
            globals: Rc::new(RefCell::new(globals)),
            exception_classes,
            methods: FxHashMap::default(),
            feedback: FeedbackStore::default(),
            registry,
            stats: VmStats::default(),
            output: String::new(),
            depth: 0,
            validated: FxHashSet::default(),
        }
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Run a module-level code object in the VM's globals.
    pub fn execute(&mut self, code: Arc<CompiledCode>) -> VmResult<Value> {
        let frame = Frame::module(code, Rc::clone(&self.globals));
        self.run_call(frame)
    }

    /// Compile and run `module`.
    pub fn run_module(&mut self, module: &Module, config: &CompilerConfig) -> Result<Value, KiteError> {
        let code = compile_module(module, config)?;
        Ok(self.execute(code)?)
    }

    /// Call `callee` with positional arguments from outside any frame.
    pub fn call(&mut self, callee: &Value, args: Vec<Value>) -> VmResult<Value> {
        let globals = Rc::clone(&self.globals);
        let ctx = CallContext::new(&globals, None);
        self.invoke(&ctx, callee, args, Vec::new())
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.borrow().get_str(&Arc::from(name))
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.borrow_mut().set_str(Arc::from(name), value);
    }

    /// Builtin bound to `name`.
    pub fn builtin(&self, name: &str) -> Option<Value> {
        self.builtins.borrow().get_str(&Arc::from(name))
    }

    /// Builtin exception class `name`.
    pub fn exception_class(&self, name: &str) -> Option<Rc<Class>> {
        self.exception_classes.get(name).cloned()
    }

    /// Everything printed so far.
    #[inline]
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    #[inline]
    pub fn stats(&self) -> VmStats {
        self.stats
    }

    #[inline]
    pub fn registry(&self) -> &Arc<InvalidationRegistry> {
        &self.registry
    }

    #[inline]
    pub fn feedback(&self) -> &FeedbackStore {
        &self.feedback
    }

    #[inline]
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub(crate) fn write_output(&mut self, text: &str) {
        self.output.push_str(text);
    }

    // =========================================================================
    // Frame Execution
    // =========================================================================

    /// Run a freshly built frame to completion.
    pub(crate) fn run_call(&mut self, mut frame: Frame) -> VmResult<Value> {
        self.enter_frame(&mut frame)?;
        match self.execute_frame(&mut frame)? {
            FrameExit::Return(value) => Ok(value),
            FrameExit::Yield(_) => Err(RuntimeError::internal(format!(
                "{} yielded outside a generator",
                frame.code.name
            ))),
        }
    }

    fn execute_frame(&mut self, frame: &mut Frame) -> VmResult<FrameExit> {
        if self.depth >= self.config.max_recursion_depth {
            return Err(RuntimeError::recursion_limit());
        }
        self.depth += 1;
        let result = self.run_frame(frame);
        self.depth -= 1;
        result
    }

    /// The dispatch loop.
    ///
    /// Calls to Python functions push the callee onto a frame stack owned by
    /// this loop instead of recursing, so call depth costs heap, not native
    /// stack. Only `root` may yield.
    fn run_frame(&mut self, root: &mut Frame) -> VmResult<FrameExit> {
        let mut callees: Vec<Frame> = Vec::new();
        loop {
            let frame = callees.last_mut().unwrap_or(&mut *root);
            let mut raised = match self.advance(frame) {
                Ok(None) => continue,
                Ok(Some(Transfer::Call(mut callee))) => match self.enter_callee(&mut callee) {
                    Ok(()) => {
                        callees.push(callee);
                        continue;
                    }
                    Err(err) => match self.unwind(frame, Why::Exception(err)) {
                        Ok(_) => continue,
                        Err(err) => err,
                    },
                },
                Ok(Some(Transfer::Exit(exit))) => {
                    if callees.pop().is_none() {
                        return Ok(exit);
                    }
                    self.depth -= 1;
                    let caller = callees.last_mut().unwrap_or(&mut *root);
                    match exit {
                        FrameExit::Return(value) => {
                            caller.push(value);
                            continue;
                        }
                        FrameExit::Yield(_) => {
                            return Err(RuntimeError::internal(format!(
                                "{} yielded outside a generator",
                                caller.code.name
                            )));
                        }
                    }
                }
                Err(err) => err,
            };

            // The active frame is done; hand the exception to its callers.
            loop {
                if callees.pop().is_none() {
                    return Err(raised);
                }
                self.depth -= 1;
                let caller = callees.last_mut().unwrap_or(&mut *root);
                match self.unwind(caller, Why::Exception(raised)) {
                    Ok(_) => break,
                    Err(err) => raised = err,
                }
            }
        }
    }

    /// Execute one instruction of `frame` and apply its control flow within
    /// the frame. Errors that no block intercepts come back as `Err`, with
    /// the frame already added to the traceback.
    fn advance(&mut self, frame: &mut Frame) -> VmResult<Option<Transfer>> {
        let flow = match self.step(frame) {
            Ok(flow) => flow,
            Err(err) => ControlFlow::Unwind(Why::Exception(err)),
        };
        match flow {
            ControlFlow::Continue => Ok(None),
            ControlFlow::Jump(target) => {
                if target <= frame.last_offset {
                    self.back_edge(frame);
                }
                frame.pc = target;
                Ok(None)
            }
            ControlFlow::Call(callee) => Ok(Some(Transfer::Call(*callee))),
            ControlFlow::Return(value) => Ok(Some(Transfer::Exit(FrameExit::Return(value)))),
            ControlFlow::Yield(value) => Ok(Some(Transfer::Exit(FrameExit::Yield(value)))),
            ControlFlow::Unwind(why) => Ok(self.unwind(frame, why)?.map(Transfer::Exit)),
        }
    }

    /// Count a pushed callee against the recursion limit and enter it.
    fn enter_callee(&mut self, callee: &mut Frame) -> VmResult<()> {
        if self.depth >= self.config.max_recursion_depth {
            return Err(RuntimeError::recursion_limit());
        }
        self.enter_frame(callee)?;
        self.depth += 1;
        Ok(())
    }

    /// Decode and execute one instruction.
    #[inline]
    fn step(&mut self, frame: &mut Frame) -> VmResult<ControlFlow> {
        let instr = decode_at(&frame.code.bytecode, frame.pc)
            .map_err(|err| RuntimeError::malformed(BytecodeError::Decode(err)))?;
        frame.last_offset = instr.offset;
        frame.pc = instr.next_offset();

        #[cfg(debug_assertions)]
        let depth_before = frame.stack.len();

        let flow = match frame.plan.clone() {
            Some(plan) => match plan.sites.get(&instr.offset) {
                Some(site) => {
                    specialize::run_site(self, frame, site, &plan.valid, instr.opcode, instr.arg)?
                }
                None => handler(instr.opcode)(self, frame, instr.arg)?,
            },
            None => handler(instr.opcode)(self, frame, instr.arg)?,
        };

        #[cfg(debug_assertions)]
        {
            let expected = match flow {
                ControlFlow::Continue => Some(instr.opcode.stack_effect(instr.arg)),
                ControlFlow::Jump(_) => Some(instr.opcode.jump_effect(instr.arg)),
                // The result is pushed when the callee returns.
                ControlFlow::Call(_) => Some(instr.opcode.stack_effect(instr.arg) - 1),
                _ => None,
            };
            if let Some(expected) = expected {
                debug_assert_eq!(
                    frame.stack.len() as i64 - depth_before as i64,
                    i64::from(expected),
                    "{} at offset {} in {}",
                    instr.opcode,
                    instr.offset,
                    frame.code.name
                );
            }
        }

        if frame.stack.len() > frame.code.max_stack_depth as usize {
            return Err(RuntimeError::stack_overflow(frame.stack.len()));
        }
        Ok(flow)
    }

    /// Pop blocks until one intercepts `why`. Returns the frame's exit when
    /// none does.
    fn unwind(&mut self, frame: &mut Frame, why: Why) -> VmResult<Option<FrameExit>> {
        if let Why::Exception(err) = &why
            && err.kind.is_fatal()
        {
            return Err(self.leave_frame(frame, err.clone()));
        }

        while let Some(block) = frame.blocks.last().copied() {
            if let (Why::Continue(target), BlockKind::Loop) = (&why, block.kind) {
                frame.pc = *target;
                return Ok(None);
            }
            frame.blocks.pop();
            frame.stack.truncate(block.level);

            let intercepted = match (&why, block.kind) {
                (Why::Break, BlockKind::Loop) => true,
                (Why::Exception(err), BlockKind::Except | BlockKind::Finally) => {
                    self.enter_handler(frame, err.clone());
                    true
                }
                (Why::Return(value), BlockKind::Finally) => {
                    frame.stack.extend([
                        Value::None,
                        value.clone(),
                        Value::Pending(Pending::Return),
                    ]);
                    true
                }
                (Why::Continue(target), BlockKind::Finally) => {
                    frame.stack.extend([
                        Value::None,
                        Value::Int(i64::from(*target)),
                        Value::Pending(Pending::Continue),
                    ]);
                    true
                }
                (Why::Break, BlockKind::Finally) => {
                    frame.stack.extend([
                        Value::None,
                        Value::None,
                        Value::Pending(Pending::Break),
                    ]);
                    true
                }
                _ => false,
            };
            if intercepted {
                frame.pc = block.handler;
                return Ok(None);
            }
        }

        match why {
            Why::Exception(err) => Err(self.leave_frame(frame, err)),
            Why::Return(value) => Ok(Some(FrameExit::Return(value))),
            Why::Break | Why::Continue(_) => Err(RuntimeError::internal(format!(
                "loop control outside a loop in {}",
                frame.code.name
            ))),
        }
    }

    /// Push `[traceback, instance, class]` for an except or finally handler.
    fn enter_handler(&mut self, frame: &mut Frame, err: RuntimeError) {
        let instance = self.materialize(&err);
        let class = Value::Class(Rc::clone(&instance.class));
        let err = err.with_payload(Value::Instance(Rc::clone(&instance)));
        frame.stack.extend([
            Value::Traceback(Rc::new(err.clone())),
            Value::Instance(instance),
            class,
        ]);
        frame.handled = Some(err);
    }

    fn leave_frame(&self, frame: &Frame, mut err: RuntimeError) -> RuntimeError {
        err.add_traceback(TraceEntry {
            func_name: Arc::clone(&frame.code.name),
            filename: Arc::clone(&frame.code.filename),
            line: frame.line(),
        });
        err
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    /// The exception instance an error carries, creating it on first use.
    pub(crate) fn materialize(&self, err: &RuntimeError) -> Rc<Instance> {
        if let Some(Value::Instance(inst)) = err.payload() {
            return Rc::clone(inst);
        }
        let class = self
            .exception_classes
            .get(err.kind.name())
            .or_else(|| self.exception_classes.get("Exception"))
            .cloned()
            .unwrap_or_else(|| Class::exception_root("Exception"));
        let args = if err.message.is_empty() {
            Vec::new()
        } else {
            vec![Value::Str(Arc::clone(&err.message))]
        };
        new_exception(class, args)
    }

    /// Error for a raised exception instance.
    pub(crate) fn error_from_instance(&self, value: Value) -> RuntimeError {
        let Value::Instance(inst) = &value else {
            return RuntimeError::type_error(format!(
                "exceptions must derive from BaseException, not {}",
                value.type_name()
            ));
        };
        let class = &inst.class;
        let builtin = self
            .exception_classes
            .get(&class.name)
            .is_some_and(|c| Rc::ptr_eq(c, class));
        let kind = builtin
            .then(|| RuntimeErrorKind::from_class_name(&class.name))
            .flatten()
            .unwrap_or_else(|| RuntimeErrorKind::Exception {
                class: Arc::clone(&class.name),
            });
        RuntimeError::new(kind, value.to_str()).with_payload(value)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Call from inside `frame`; builtins see the frame's namespaces.
    pub(crate) fn call_with_frame(
        &mut self,
        frame: &Frame,
        callee: &Value,
        args: Vec<Value>,
        kwargs: Vec<(Arc<str>, Value)>,
    ) -> VmResult<Value> {
        let ctx = CallContext::new(&frame.globals, frame.locals.as_ref());
        self.invoke(&ctx, callee, args, kwargs)
    }

    /// Positional call from inside `frame`.
    #[inline]
    pub(crate) fn call_value(&mut self, frame: &Frame, callee: &Value, args: Vec<Value>) -> VmResult<Value> {
        self.call_with_frame(frame, callee, args, Vec::new())
    }

    pub(crate) fn invoke(
        &mut self,
        ctx: &CallContext<'_>,
        callee: &Value,
        args: Vec<Value>,
        kwargs: Vec<(Arc<str>, Value)>,
    ) -> VmResult<Value> {
        match callee {
            Value::Function(func) => self.call_function(func, args, kwargs),
            Value::Builtin(builtin) => {
                if !kwargs.is_empty() {
                    return Err(RuntimeError::type_error(format!(
                        "{}() takes no keyword arguments",
                        builtin.name
                    )));
                }
                (builtin.func)(self, ctx, args)
            }
            Value::BoundMethod(method) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(method.receiver.clone());
                full.extend(args);
                self.invoke(ctx, &method.function, full, kwargs)
            }
            Value::Class(class) => self.call_class(ctx, class, args, kwargs),
            other => Err(RuntimeError::not_callable(&other.type_name())),
        }
    }

    fn call_function(
        &mut self,
        func: &Rc<Function>,
        args: Vec<Value>,
        kwargs: Vec<(Arc<str>, Value)>,
    ) -> VmResult<Value> {
        match self.activate(func, args, kwargs)? {
            Activation::Frame(frame) => self.run_call(frame),
            Activation::Generator(generator) => Ok(generator),
        }
    }

    /// Bind the arguments of a call to `func`.
    fn activate(
        &mut self,
        func: &Rc<Function>,
        args: Vec<Value>,
        kwargs: Vec<(Arc<str>, Value)>,
    ) -> VmResult<Activation> {
        let frame = if kwargs.is_empty() && func.is_simple_call(args.len()) {
            Frame::for_simple_call(func, args)
        } else {
            Frame::for_call(func, args, kwargs)?
        };
        if frame.code.is_generator() {
            self.ensure_validated(&frame.code)?;
            return Ok(Activation::Generator(Value::Generator(Generator::new(frame))));
        }
        Ok(Activation::Frame(frame))
    }

    /// Call made by a call instruction of `frame`. Python functions and
    /// methods come back as [`ControlFlow::Call`] for the dispatch loop to
    /// push; any other callee runs here and its result is pushed.
    pub(crate) fn call_from_frame(
        &mut self,
        frame: &mut Frame,
        callee: Value,
        mut args: Vec<Value>,
        kwargs: Vec<(Arc<str>, Value)>,
    ) -> VmResult<ControlFlow> {
        let func = match &callee {
            Value::Function(func) => Some(Rc::clone(func)),
            Value::BoundMethod(method) => match &method.function {
                Value::Function(func) => {
                    args.insert(0, method.receiver.clone());
                    Some(Rc::clone(func))
                }
                _ => None,
            },
            _ => None,
        };
        let Some(func) = func else {
            let result = self.call_with_frame(frame, &callee, args, kwargs)?;
            frame.push(result);
            return Ok(ControlFlow::Continue);
        };
        match self.activate(&func, args, kwargs)? {
            Activation::Frame(callee) => Ok(ControlFlow::Call(Box::new(callee))),
            Activation::Generator(generator) => {
                frame.push(generator);
                Ok(ControlFlow::Continue)
            }
        }
    }

    /// Instantiate `class`, running `__init__` when it defines one.
    fn call_class(
        &mut self,
        ctx: &CallContext<'_>,
        class: &Rc<Class>,
        args: Vec<Value>,
        kwargs: Vec<(Arc<str>, Value)>,
    ) -> VmResult<Value> {
        let init = class.lookup("__init__");
        let instance = if class.exception {
            new_exception(Rc::clone(class), args.clone())
        } else {
            Instance::new(Rc::clone(class))
        };
        let value = Value::Instance(instance);
        match init {
            Some(init) => {
                let bound = Value::BoundMethod(Rc::new(BoundMethod {
                    receiver: value.clone(),
                    function: init,
                }));
                let result = self.invoke(ctx, &bound, args, kwargs)?;
                if !matches!(result, Value::None) {
                    return Err(RuntimeError::type_error(format!(
                        "__init__() should return None, not '{}'",
                        result.type_name()
                    )));
                }
            }
            None if !class.exception && (!args.is_empty() || !kwargs.is_empty()) => {
                return Err(RuntimeError::type_error("this constructor takes no arguments"));
            }
            None => {}
        }
        Ok(value)
    }

    /// Run `code` with explicit namespaces, as `exec` does.
    pub(crate) fn exec_code(
        &mut self,
        code: Arc<CompiledCode>,
        globals: DictRef,
        locals: DictRef,
    ) -> VmResult<Value> {
        let frame = Frame::new(code, globals, Some(locals));
        self.run_call(frame)
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Advance an iterator or generator; `None` once exhausted.
    pub(crate) fn next_item(&mut self, iter: &Value) -> VmResult<Option<Value>> {
        match iter {
            Value::Iterator(state) => Ok(state.borrow_mut().next_item()),
            Value::Generator(generator) => self.resume(generator),
            other => Err(RuntimeError::type_error(format!(
                "'{}' object is not an iterator",
                other.type_name()
            ))),
        }
    }

    /// Every item of an iterable.
    pub(crate) fn collect_iterable(&mut self, value: &Value) -> VmResult<Vec<Value>> {
        match value {
            Value::List(list) => return Ok(list.borrow().clone()),
            Value::Tuple(items) => return Ok(items.to_vec()),
            _ => {}
        }
        let iter = make_iter(value)?;
        let mut items = Vec::new();
        while let Some(item) = self.next_item(&iter)? {
            items.push(item);
        }
        Ok(items)
    }

    /// Resume a generator until it yields or finishes.
    fn resume(&mut self, generator: &Rc<Generator>) -> VmResult<Option<Value>> {
        match generator.state() {
            GenState::Finished => return Ok(None),
            GenState::Running => {
                return Err(RuntimeError::value_error("generator already executing"));
            }
            GenState::Created | GenState::Suspended => {}
        }
        let Some(mut frame) = generator.frame.borrow_mut().take() else {
            generator.state.set(GenState::Finished);
            return Ok(None);
        };

        let first = generator.state() == GenState::Created;
        generator.state.set(GenState::Running);
        let result = if first {
            self.enter_frame(&mut frame)
                .and_then(|()| self.execute_frame(&mut frame))
        } else {
            // The value of the `yield` expression.
            frame.push(Value::None);
            self.execute_frame(&mut frame)
        };

        match result {
            Ok(FrameExit::Yield(value)) => {
                *generator.frame.borrow_mut() = Some(frame);
                generator.state.set(GenState::Suspended);
                Ok(Some(value))
            }
            Ok(FrameExit::Return(_)) => {
                generator.state.set(GenState::Finished);
                Ok(None)
            }
            Err(err) => {
                generator.state.set(GenState::Finished);
                Err(err)
            }
        }
    }

    // =========================================================================
    // Attributes
    // =========================================================================

    /// Method `name` of a builtin-typed receiver, bound to it.
    pub(crate) fn builtin_method(&mut self, receiver: &Value, name: &str) -> Option<Value> {
        let tag = receiver.type_tag();
        let (name, func) = methods::lookup(tag, name)?;
        let builtin = self
            .methods
            .entry((tag, name))
            .or_insert_with(|| {
                Rc::new(Builtin {
                    id: ObjectId::fresh(),
                    name,
                    func,
                })
            })
            .clone();
        Some(Value::BoundMethod(Rc::new(BoundMethod {
            receiver: receiver.clone(),
            function: Value::Builtin(builtin),
        })))
    }

    // =========================================================================
    // Feedback
    // =========================================================================

    /// Record the operand types of a binary, in-place or compare site.
    #[inline]
    pub(crate) fn observe_operands(&mut self, frame: &Frame, lhs: &Value, rhs: &Value) {
        if self.config.specialize {
            self.feedback.profile_mut(frame.code.id).record_operands(
                frame.last_offset,
                lhs.type_tag(),
                rhs.type_tag(),
            );
        }
    }

    /// Record the callee of a plain positional call site.
    #[inline]
    pub(crate) fn observe_call(&mut self, frame: &Frame, callee: &Value, nargs: usize) {
        if !self.config.specialize {
            return;
        }
        let Some(id) = callee.object_id() else {
            return;
        };
        let kind = match callee {
            Value::Builtin(_) => CalleeKind::Native,
            Value::Function(func) if func.is_simple_call(nargs) => CalleeKind::Function,
            _ => CalleeKind::Other,
        };
        self.feedback
            .profile_mut(frame.code.id)
            .record_call(frame.last_offset, CallTarget { id, kind });
    }

    /// Record the receiver class of an attribute or method load.
    #[inline]
    pub(crate) fn observe_attr(&mut self, frame: &Frame, class: &Rc<Class>) {
        if self.config.specialize {
            self.feedback
                .profile_mut(frame.code.id)
                .record_attr(frame.last_offset, class);
        }
    }

    /// Record that the current instruction's fast path declined.
    #[inline]
    pub(crate) fn observe_decline(&mut self, frame: &Frame) {
        if self.config.specialize {
            self.feedback
                .profile_mut(frame.code.id)
                .record_decline(frame.last_offset);
        }
    }

    /// Record the direction of a conditional branch.
    #[inline]
    pub(crate) fn observe_branch(&mut self, frame: &Frame, condition: bool) {
        if self.config.specialize {
            self.feedback
                .profile_mut(frame.code.id)
                .record_branch(frame.last_offset, condition);
        }
    }

    // =========================================================================
    // Tiering
    // =========================================================================

    fn ensure_validated(&mut self, code: &Arc<CompiledCode>) -> VmResult<()> {
        if self.config.validate && !self.validated.contains(&code.id) {
            validate(code)?;
            self.validated.insert(code.id);
        }
        Ok(())
    }

    /// Validate on first entry, count the entry and adopt or build a plan.
    fn enter_frame(&mut self, frame: &mut Frame) -> VmResult<()> {
        self.ensure_validated(&frame.code)?;
        if self.config.specialize {
            let profile = self.feedback.profile_mut(frame.code.id);
            profile.entries.increment();
            profile.heat.increment();
            self.maybe_specialize(frame);
        }
        Ok(())
    }

    fn back_edge(&mut self, frame: &mut Frame) {
        if self.config.specialize {
            self.feedback.profile_mut(frame.code.id).heat.increment();
            self.maybe_specialize(frame);
        }
    }

    /// Give `frame` the current plan of its code, building one first when
    /// the code is hot and has none or its feedback changed.
    fn maybe_specialize(&mut self, frame: &mut Frame) {
        let code = Arc::clone(&frame.code);
        frame.plan = self.feedback.profile(code.id).and_then(|p| p.plan.clone());
        self.drop_stale_plan(frame);

        let profile = self.feedback.profile_mut(code.id);
        let hot = u32::from(profile.heat.get()) >= self.config.hot_threshold;
        if hot && (profile.plan.is_none() || profile.changed) {
            if let Some(old) = profile.plan.take() {
                old.valid.store(false, Ordering::Release);
                old.release(&self.registry);
            }
            let plan = Rc::new(build_plan(&code, profile, &self.registry));
            profile.changed = false;
            profile.plan = Some(Rc::clone(&plan));
            self.stats.plans_built += 1;
            self.stats.branches.merge(&plan.branch_stats);
            debug!(code = %code.name, heat = profile.heat.get(), "code became hot");
            frame.plan = Some(plan);
        }
    }

    /// Discard the frame's plan once it has been invalidated.
    fn drop_stale_plan(&mut self, frame: &mut Frame) {
        let Some(plan) = frame.plan.take_if(|plan| !plan.is_valid()) else {
            return;
        };
        let profile = self.feedback.profile_mut(plan.code_id);
        if profile.plan.as_ref().is_some_and(|p| Rc::ptr_eq(p, &plan)) {
            profile.plan = None;
            profile.heat.reset();
            plan.release(&self.registry);
            self.stats.plans_discarded += 1;
            debug!(code = %frame.code.name, "discarded invalidated plan");
        }
    }

    /// The plan currently installed for `code`.
    pub fn plan_for(&self, code: CodeId) -> Option<Rc<SpecializationPlan>> {
        self.feedback.profile(code).and_then(|p| p.plan.clone())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(VmConfig::default())
    }
}
