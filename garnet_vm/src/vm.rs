//! The virtual machine.
//!
//! `Vm` owns the value stack, the frame stack, the global-variable table,
//! and the core class graph. Instructions mutate it directly through the
//! interface in this module; control transfer is expressed as `jump`,
//! `leave`, and the [`Unwind`] error channel that catch tables consume.

use crate::builtins::BuiltinRegistry;
use crate::frame::{
    Backref, Block, Environment, Frame, FrameKind, SpecialVariables, MAX_FRAME_DEPTH,
};
use crate::iseq::{CatchKind, Iseq, Label};
use crate::rclass::{IseqMethod, Method, RClass, RObject};
use crate::value::{Value, ValueKind};
use garnet_core::intern::{intern, Symbol};
use garnet_core::{GarnetError, GarnetResult};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::trace;

/// Result type for instruction execution.
pub type VmResult<T> = Result<T, Unwind>;

/// The tag kinds `throw` can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrowKind {
    /// Method return from inside a block.
    Return = 1,
    /// Break out of a block.
    Break = 2,
    /// Next iteration of a block.
    Next = 3,
    /// Retry a begin body.
    Retry = 4,
    /// Redo the current iteration.
    Redo = 5,
    /// Raise an exception object.
    Raise = 6,
    /// Catch/throw transfer.
    Throw = 7,
    /// Fatal, uncatchable.
    Fatal = 8,
}

impl ThrowKind {
    /// Decode the low bits of a `throw` tag operand.
    #[must_use]
    pub fn from_tag(tag: usize) -> Option<Self> {
        Some(match tag & 0x0f {
            1 => Self::Return,
            2 => Self::Break,
            3 => Self::Next,
            4 => Self::Retry,
            5 => Self::Redo,
            6 => Self::Raise,
            7 => Self::Throw,
            8 => Self::Fatal,
            _ => return None,
        })
    }

    /// Printable tag name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Return => "return",
            Self::Break => "break",
            Self::Next => "next",
            Self::Retry => "retry",
            Self::Redo => "redo",
            Self::Raise => "raise",
            Self::Throw => "throw",
            Self::Fatal => "fatal",
        }
    }
}

/// The unwinding channel: either a host-level error or a non-local
/// control transfer initiated by `throw`. Catch tables consume both.
#[derive(Debug, Clone)]
pub enum Unwind {
    /// A host-language error, eligible for rescue handlers.
    Error(GarnetError),
    /// A non-local transfer.
    Throw {
        /// Transfer kind.
        kind: ThrowKind,
        /// Value delivered at the handler.
        value: Value,
    },
}

impl From<GarnetError> for Unwind {
    fn from(e: GarnetError) -> Self {
        Self::Error(e)
    }
}

/// Staged arguments for a method or block call.
#[derive(Debug, Default)]
pub struct CallArgs {
    /// Positional arguments in call order.
    pub positional: SmallVec<[Value; 8]>,
    /// Keyword arguments in call order.
    pub keywords: Vec<(Symbol, Value)>,
    /// Block, from a block iseq or a `&arg`.
    pub block: Option<Rc<Block>>,
}

impl CallArgs {
    /// Stage plain positional arguments.
    #[must_use]
    pub fn positional(args: impl IntoIterator<Item = Value>) -> Self {
        Self {
            positional: args.into_iter().collect(),
            keywords: Vec::new(),
            block: None,
        }
    }
}

/// The bootstrapped class graph every machine starts with.
#[derive(Debug)]
pub struct CoreClasses {
    /// Root of the hierarchy.
    pub basic_object: Rc<RefCell<RClass>>,
    /// Default superclass; also owns the top-level constant namespace.
    pub object: Rc<RefCell<RClass>>,
    /// The class of modules.
    pub module_class: Rc<RefCell<RClass>>,
    /// The class of classes.
    pub class_class: Rc<RefCell<RClass>>,
    /// Integer.
    pub integer: Rc<RefCell<RClass>>,
    /// Float.
    pub float: Rc<RefCell<RClass>>,
    /// String.
    pub string: Rc<RefCell<RClass>>,
    /// Symbol.
    pub symbol: Rc<RefCell<RClass>>,
    /// Array.
    pub array: Rc<RefCell<RClass>>,
    /// Hash.
    pub hash: Rc<RefCell<RClass>>,
    /// Range.
    pub range: Rc<RefCell<RClass>>,
    /// Regexp.
    pub regexp: Rc<RefCell<RClass>>,
    /// NilClass.
    pub nil_class: Rc<RefCell<RClass>>,
    /// TrueClass.
    pub true_class: Rc<RefCell<RClass>>,
    /// FalseClass.
    pub false_class: Rc<RefCell<RClass>>,
    /// Proc.
    pub proc_class: Rc<RefCell<RClass>>,
    /// Exception root.
    pub exception: Rc<RefCell<RClass>>,
    /// StandardError, the default rescue target.
    pub standard_error: Rc<RefCell<RClass>>,
    exceptions: FxHashMap<String, Rc<RefCell<RClass>>>,
}

impl CoreClasses {
    fn bootstrap() -> Self {
        let basic_object = RClass::new("BasicObject", None);
        let object = RClass::new("Object", Some(Rc::clone(&basic_object)));
        let module_class = RClass::new("Module", Some(Rc::clone(&object)));
        let class_class = RClass::new("Class", Some(Rc::clone(&module_class)));

        let make = |name: &str| RClass::new(name, Some(Rc::clone(&object)));
        let integer = make("Integer");
        let float = make("Float");
        let string = make("String");
        let symbol = make("Symbol");
        let array = make("Array");
        let hash = make("Hash");
        let range = make("Range");
        let regexp = make("Regexp");
        let nil_class = make("NilClass");
        let true_class = make("TrueClass");
        let false_class = make("FalseClass");
        let proc_class = make("Proc");

        let exception = make("Exception");
        let standard_error = RClass::new("StandardError", Some(Rc::clone(&exception)));
        let mut exceptions = FxHashMap::default();
        exceptions.insert("Exception".to_owned(), Rc::clone(&exception));
        exceptions.insert("StandardError".to_owned(), Rc::clone(&standard_error));
        for name in [
            "RuntimeError",
            "TypeError",
            "ArgumentError",
            "ZeroDivisionError",
            "FrozenError",
            "LocalJumpError",
            "RegexpError",
            "NotImplementedError",
            "InternalError",
        ] {
            exceptions.insert(
                name.to_owned(),
                RClass::new(name, Some(Rc::clone(&standard_error))),
            );
        }
        let name_error = RClass::new("NameError", Some(Rc::clone(&standard_error)));
        let no_method_error = RClass::new("NoMethodError", Some(Rc::clone(&name_error)));
        exceptions.insert("NameError".to_owned(), name_error);
        exceptions.insert("NoMethodError".to_owned(), no_method_error);

        let core = Self {
            basic_object,
            object,
            module_class,
            class_class,
            integer,
            float,
            string,
            symbol,
            array,
            hash,
            range,
            regexp,
            nil_class,
            true_class,
            false_class,
            proc_class,
            exception,
            standard_error,
            exceptions,
        };

        // Install every core class as a constant on Object.
        {
            let mut object = core.object.borrow_mut();
            let mut set = |class: &Rc<RefCell<RClass>>| {
                let name = class.borrow().name.clone();
                object
                    .constants
                    .insert(intern(&name), Value::Class(Rc::clone(class)));
            };
            set(&core.basic_object);
            set(&core.module_class);
            set(&core.class_class);
            set(&core.integer);
            set(&core.float);
            set(&core.string);
            set(&core.symbol);
            set(&core.array);
            set(&core.hash);
            set(&core.range);
            set(&core.regexp);
            set(&core.nil_class);
            set(&core.true_class);
            set(&core.false_class);
            set(&core.proc_class);
            for class in core.exceptions.values() {
                set(class);
            }
            object
                .constants
                .insert(intern("Object"), Value::Class(Rc::clone(&core.object)));
        }

        core
    }

    /// Look up an exception class by name, defaulting to RuntimeError.
    #[must_use]
    pub fn exception_class_named(&self, name: &str) -> Rc<RefCell<RClass>> {
        self.exceptions
            .get(name)
            .cloned()
            .unwrap_or_else(|| Rc::clone(&self.exceptions["RuntimeError"]))
    }
}

/// The Garnet virtual machine.
pub struct Vm {
    /// The shared value stack; each frame owns the region above its base.
    stack: Vec<Value>,
    frames: Vec<Frame>,
    globals: FxHashMap<Symbol, Value>,
    global_aliases: FxHashMap<Symbol, Symbol>,
    builtins: BuiltinRegistry,
    /// Bootstrapped class graph.
    pub core: CoreClasses,
    main: Value,
}

impl Vm {
    /// Create a machine with the standard class graph and builtins.
    #[must_use]
    pub fn new() -> Self {
        let core = CoreClasses::bootstrap();
        let main = Value::Object(RObject::new(Rc::clone(&core.object)));
        Self {
            stack: Vec::with_capacity(64),
            frames: Vec::with_capacity(16),
            globals: FxHashMap::default(),
            global_aliases: FxHashMap::default(),
            builtins: BuiltinRegistry::with_standard_builtins(),
            core,
            main,
        }
    }

    /// Execute a top-level iseq and return its value.
    pub fn run(&mut self, iseq: &Rc<Iseq>) -> GarnetResult<Value> {
        let env = Environment::new(iseq.local_table().size(), None);
        let mut frame = Frame::new(Rc::clone(iseq), FrameKind::Top, env, self.main.clone());
        frame.nesting = vec![Value::Class(Rc::clone(&self.core.object))];
        frame.stack_base = self.stack.len();
        self.push_frame(frame)
            .map_err(|unwind| self.unwind_to_error(unwind))?;
        let result = self.execute_frame();
        self.pop_frame();
        match result {
            Ok(value) => Ok(value),
            Err(unwind) => Err(self.unwind_to_error(unwind)),
        }
    }

    /// Execute an iseq body against a prepared stack and return the
    /// frame's final stack region.
    ///
    /// Unlike [`Vm::run`], the body needs no trailing `leave`: execution
    /// stops when the pc runs past the end. This is the verification
    /// entry point for stack-effect analysis — the returned region's
    /// length is the observable net effect of the body.
    pub fn run_stack_effect(
        &mut self,
        iseq: &Rc<Iseq>,
        seed: Vec<Value>,
    ) -> GarnetResult<Vec<Value>> {
        let env = Environment::new(iseq.local_table().size(), None);
        let mut frame = Frame::new(Rc::clone(iseq), FrameKind::Top, env, self.main.clone());
        frame.nesting = vec![Value::Class(Rc::clone(&self.core.object))];
        frame.stack_base = self.stack.len();
        if let Err(unwind) = self.push_frame(frame) {
            return Err(self.unwind_to_error(unwind));
        }
        for value in seed {
            self.push(value);
        }

        let outcome = loop {
            if self.frame().returning.is_some() {
                break Ok(());
            }
            let insn = {
                let frame = self.frame();
                match frame.iseq.insn_at(frame.pc) {
                    Some(insn) => insn,
                    None => break Ok(()),
                }
            };
            self.frame_mut().pc += 1;
            if let Err(unwind) = insn.call(self) {
                match self.handle_unwind(unwind) {
                    Ok(()) => {}
                    Err(unwind) => break Err(unwind),
                }
            }
        };

        let base = self.frame().stack_base;
        let snapshot = self.stack[base..].to_vec();
        self.pop_frame();
        match outcome {
            Ok(()) => Ok(snapshot),
            Err(unwind) => Err(self.unwind_to_error(unwind)),
        }
    }

    fn unwind_to_error(&self, unwind: Unwind) -> GarnetError {
        match unwind {
            Unwind::Error(e) => e,
            Unwind::Throw { kind, value } => match kind {
                ThrowKind::Raise | ThrowKind::Fatal => self.error_from_value(&value),
                other => {
                    GarnetError::local_jump(format!("unexpected {} at top level", other.as_str()))
                }
            },
        }
    }

    // =========================================================================
    // Value Stack
    // =========================================================================

    /// Push a value.
    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Pop the top of stack.
    #[inline]
    pub fn pop(&mut self) -> VmResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| GarnetError::internal("stack underflow").into())
    }

    /// Pop `n` values, preserving their original bottom-to-top order.
    pub fn pop_n(&mut self, n: usize) -> VmResult<Vec<Value>> {
        if self.stack.len() < n {
            return Err(GarnetError::internal("stack underflow").into());
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    /// Peek at the top of stack.
    pub fn peek(&self) -> VmResult<&Value> {
        self.stack
            .last()
            .ok_or_else(|| GarnetError::internal("stack underflow").into())
    }

    /// Read the value `n` slots below the top (0 is the top itself).
    pub fn peek_at(&self, n: usize) -> VmResult<Value> {
        let len = self.stack.len();
        if n >= len {
            return Err(GarnetError::internal("stack underflow").into());
        }
        Ok(self.stack[len - 1 - n].clone())
    }

    /// Overwrite the value `n` slots below the top.
    pub fn set_at(&mut self, n: usize, value: Value) -> VmResult<()> {
        let len = self.stack.len();
        if n >= len {
            return Err(GarnetError::internal("stack underflow").into());
        }
        self.stack[len - 1 - n] = value;
        Ok(())
    }

    /// Current stack height.
    #[must_use]
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    // =========================================================================
    // Frames
    // =========================================================================

    /// The current frame.
    ///
    /// # Panics
    /// Outside of execution there is no frame; instructions only run with
    /// at least one frame pushed.
    #[must_use]
    pub fn frame(&self) -> &Frame {
        self.frames.last().expect("no active frame")
    }

    /// The current frame, mutably.
    #[must_use]
    pub fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    /// The current `self`.
    #[must_use]
    pub fn self_value(&self) -> Value {
        self.frame().self_value.clone()
    }

    /// The nearest method (or top) frame's block, for `invokeblock` and
    /// `defined?(yield)`.
    #[must_use]
    pub fn frame_yield(&self) -> Option<Rc<Block>> {
        self.frames
            .iter()
            .rev()
            .find(|f| matches!(f.kind, FrameKind::Method | FrameKind::Top))
            .and_then(|f| f.block.clone())
    }

    /// The special-variable slots visible from the current frame.
    #[must_use]
    pub fn frame_svar(&self) -> Rc<RefCell<SpecialVariables>> {
        Rc::clone(&self.frame().svars)
    }

    /// Record a pattern-match backreference in the visible svar slots.
    pub fn set_backref(&mut self, backref: Option<Backref>) {
        self.frame_svar().borrow_mut().backref = backref;
    }

    /// The innermost constant-nesting entry.
    #[must_use]
    pub fn const_base(&self) -> Value {
        self.frame()
            .nesting
            .last()
            .cloned()
            .unwrap_or_else(|| Value::Class(Rc::clone(&self.core.object)))
    }

    /// The lexical class scope (same entry the nesting ends with).
    #[must_use]
    pub fn cbase(&self) -> Value {
        self.const_base()
    }

    /// The frozen-core sentinel.
    #[must_use]
    pub fn frozen_core(&self) -> Value {
        Value::FrozenCore
    }

    fn push_frame(&mut self, frame: Frame) -> VmResult<()> {
        if self.frames.len() >= MAX_FRAME_DEPTH {
            return Err(GarnetError::internal("stack level too deep").into());
        }
        trace!(iseq = %frame.iseq.name, kind = ?frame.kind, depth = self.frames.len(), "enter frame");
        self.frames.push(frame);
        Ok(())
    }

    fn pop_frame(&mut self) {
        if let Some(frame) = self.frames.pop() {
            trace!(iseq = %frame.iseq.name, "leave frame");
            self.stack.truncate(frame.stack_base);
        }
    }

    // =========================================================================
    // Locals
    // =========================================================================

    /// Read a local `level` lexical frames up.
    pub fn local_get(&self, index: usize, level: usize) -> VmResult<Value> {
        let env = self
            .frame()
            .env
            .at_level(level)
            .ok_or_else(|| GarnetError::internal("local level out of range"))?;
        Ok(env.get(index).unwrap_or(Value::Nil))
    }

    /// Write a local `level` lexical frames up.
    pub fn local_set(&mut self, index: usize, level: usize, value: Value) -> VmResult<()> {
        let env = self
            .frame()
            .env
            .at_level(level)
            .ok_or_else(|| GarnetError::internal("local level out of range"))?;
        env.set(index, value);
        Ok(())
    }

    // =========================================================================
    // Globals
    // =========================================================================

    fn resolve_global(&self, name: &Symbol) -> Symbol {
        self.global_aliases.get(name).cloned().unwrap_or_else(|| name.clone())
    }

    /// Read a global variable; unset globals read as nil.
    #[must_use]
    pub fn global_get(&self, name: &Symbol) -> Value {
        let name = self.resolve_global(name);
        self.globals.get(&name).cloned().unwrap_or(Value::Nil)
    }

    /// Write a global variable.
    pub fn global_set(&mut self, name: &Symbol, value: Value) {
        let name = self.resolve_global(name);
        self.globals.insert(name, value);
    }

    /// Check whether a global has been written.
    #[must_use]
    pub fn global_defined(&self, name: &Symbol) -> bool {
        let name = self.resolve_global(name);
        self.globals.contains_key(&name)
    }

    /// Make `new_name` an alias of `old_name` (`core#set_variable_alias`).
    pub fn alias_global(&mut self, new_name: Symbol, old_name: Symbol) {
        let target = self.resolve_global(&old_name);
        self.global_aliases.insert(new_name, target);
    }

    // =========================================================================
    // Control Transfer
    // =========================================================================

    /// Transfer to a label in the current iseq.
    pub fn jump(&mut self, label: &Label) -> VmResult<()> {
        let pc = self
            .frame()
            .iseq
            .label_pc(label)
            .ok_or_else(|| GarnetError::internal(format!("undefined label {}", label.name())))?;
        self.frame_mut().pc = pc;
        Ok(())
    }

    /// Finish the current frame with a return value.
    pub fn leave(&mut self, value: Value) {
        self.frame_mut().returning = Some(value);
    }

    fn execute_frame(&mut self) -> VmResult<Value> {
        loop {
            if let Some(value) = self.frame_mut().returning.take() {
                return Ok(value);
            }
            let insn = {
                let frame = self.frame();
                frame.iseq.insn_at(frame.pc).ok_or_else(|| {
                    GarnetError::internal("execution ran off the end of an iseq")
                })?
            };
            self.frame_mut().pc += 1;
            if let Err(unwind) = insn.call(self) {
                self.handle_unwind(unwind)?;
            }
        }
    }

    /// Consult the current frame's catch table for an entry matching the
    /// unwind's kind and the faulting pc. Unmatched unwinds propagate.
    fn handle_unwind(&mut self, unwind: Unwind) -> VmResult<()> {
        let fault_pc = self.frame().pc.saturating_sub(1);
        let entries = self.frame().iseq.catch_entries();
        for entry in entries {
            let iseq = Rc::clone(&self.frame().iseq);
            let (Some(begin), Some(end), Some(exit)) = (
                iseq.label_pc(&entry.begin_label),
                iseq.label_pc(&entry.end_label),
                iseq.label_pc(&entry.exit_label),
            ) else {
                continue;
            };
            if fault_pc < begin || fault_pc >= end {
                continue;
            }
            let restore_to = self.frame().stack_base + entry.sp;
            match (&unwind, entry.kind) {
                (Unwind::Throw { kind: ThrowKind::Break, value }, CatchKind::Break)
                | (Unwind::Throw { kind: ThrowKind::Next, value }, CatchKind::Next) => {
                    trace!(kind = entry.kind.as_str(), "catch table hit");
                    let value = value.clone();
                    self.stack.truncate(restore_to);
                    self.push(value);
                    self.frame_mut().pc = exit;
                    return Ok(());
                }
                (Unwind::Throw { kind: ThrowKind::Retry, .. }, CatchKind::Retry)
                | (Unwind::Throw { kind: ThrowKind::Redo, .. }, CatchKind::Redo) => {
                    self.stack.truncate(restore_to);
                    self.frame_mut().pc = exit;
                    return Ok(());
                }
                (Unwind::Error(_), CatchKind::Rescue)
                | (Unwind::Throw { kind: ThrowKind::Raise, .. }, CatchKind::Rescue) => {
                    let exception = match &unwind {
                        Unwind::Error(e) => self.error_to_value(e),
                        Unwind::Throw { value, .. } => value.clone(),
                    };
                    let handler = entry.iseq.clone().ok_or_else(|| {
                        GarnetError::internal("rescue catch entry without a handler iseq")
                    })?;
                    let rescued = self.run_rescue_frame(&handler, exception)?;
                    self.stack.truncate(restore_to);
                    self.push(rescued);
                    self.frame_mut().pc = exit;
                    return Ok(());
                }
                (_, CatchKind::Ensure) => {
                    if let Some(handler) = entry.iseq.clone() {
                        self.run_ensure_frame(&handler)?;
                    }
                    // Ensure observes the unwind but never consumes it.
                }
                _ => {}
            }
        }
        Err(unwind)
    }

    // =========================================================================
    // Frame Runners
    // =========================================================================

    /// Invoke an iseq-defined method on `recv`.
    pub fn run_method_frame(
        &mut self,
        name: Symbol,
        owner: Rc<RefCell<RClass>>,
        method: &IseqMethod,
        recv: Value,
        args: CallArgs,
    ) -> VmResult<Value> {
        let iseq = Rc::clone(&method.iseq);
        let env = Environment::new(iseq.local_table().size(), None);
        let block = args.block.clone();
        self.bind_method_args(&iseq, &env, args)?;

        let mut frame = Frame::new(Rc::clone(&iseq), FrameKind::Method, env, recv);
        frame.nesting = if method.nesting.is_empty() {
            vec![Value::Class(Rc::clone(&self.core.object))]
        } else {
            method.nesting.clone()
        };
        frame.block = block;
        frame.owner = Some((name, owner));
        frame.stack_base = self.stack.len();
        self.push_frame(frame)?;
        let result = self.execute_frame();
        self.pop_frame();
        match result {
            Err(Unwind::Throw {
                kind: ThrowKind::Return,
                value,
            }) => Ok(value),
            other => other,
        }
    }

    /// Invoke a block with the given arguments.
    pub fn run_block_frame(&mut self, block: &Rc<Block>, args: &[Value]) -> VmResult<Value> {
        let iseq = Rc::clone(&block.iseq);
        let env = Environment::new(iseq.local_table().size(), Some(Rc::clone(&block.env)));
        self.bind_block_args(&iseq, &env, args);

        let mut frame = Frame::new(
            Rc::clone(&iseq),
            FrameKind::Block,
            env,
            block.self_value.clone(),
        );
        frame.nesting = block.nesting.clone();
        frame.svars = Rc::clone(&block.svars);
        frame.stack_base = self.stack.len();
        self.push_frame(frame)?;
        let result = self.execute_frame();
        self.pop_frame();
        match result {
            Err(Unwind::Throw {
                kind: ThrowKind::Next,
                value,
            }) => Ok(value),
            other => other,
        }
    }

    /// Run a class or module body with `self` bound to the class.
    pub fn run_class_frame(&mut self, iseq: &Rc<Iseq>, class_value: Value) -> VmResult<Value> {
        let env = Environment::new(iseq.local_table().size(), None);
        let mut frame = Frame::new(
            Rc::clone(iseq),
            FrameKind::Class,
            env,
            class_value.clone(),
        );
        frame.nesting = {
            let mut nesting = self.frame().nesting.clone();
            nesting.push(class_value);
            nesting
        };
        frame.svars = Rc::clone(&self.frame().svars);
        frame.stack_base = self.stack.len();
        self.push_frame(frame)?;
        let result = self.execute_frame();
        self.pop_frame();
        result
    }

    /// Run a rescue handler with the exception bound to its first local.
    pub fn run_rescue_frame(&mut self, iseq: &Rc<Iseq>, exception: Value) -> VmResult<Value> {
        let env = Environment::new(
            iseq.local_table().size(),
            Some(Rc::clone(&self.frame().env)),
        );
        if !iseq.local_table().is_empty() {
            env.set(0, exception);
        }
        let mut frame = Frame::new(Rc::clone(iseq), FrameKind::Rescue, env, self.self_value());
        frame.nesting = self.frame().nesting.clone();
        frame.svars = Rc::clone(&self.frame().svars);
        frame.stack_base = self.stack.len();
        self.push_frame(frame)?;
        let result = self.execute_frame();
        self.pop_frame();
        result
    }

    fn run_ensure_frame(&mut self, iseq: &Rc<Iseq>) -> VmResult<()> {
        let env = Environment::new(
            iseq.local_table().size(),
            Some(Rc::clone(&self.frame().env)),
        );
        let mut frame = Frame::new(Rc::clone(iseq), FrameKind::Ensure, env, self.self_value());
        frame.nesting = self.frame().nesting.clone();
        frame.svars = Rc::clone(&self.frame().svars);
        frame.stack_base = self.stack.len();
        self.push_frame(frame)?;
        let result = self.execute_frame();
        self.pop_frame();
        result.map(|_| ())
    }

    /// Run a `once` body in the current lexical context.
    pub fn run_plain_frame(&mut self, iseq: &Rc<Iseq>) -> VmResult<Value> {
        let env = Environment::new(
            iseq.local_table().size(),
            Some(Rc::clone(&self.frame().env)),
        );
        let mut frame = Frame::new(Rc::clone(iseq), FrameKind::Plain, env, self.self_value());
        frame.nesting = self.frame().nesting.clone();
        frame.svars = Rc::clone(&self.frame().svars);
        frame.stack_base = self.stack.len();
        self.push_frame(frame)?;
        let result = self.execute_frame();
        self.pop_frame();
        result
    }

    // =========================================================================
    // Argument Binding
    // =========================================================================

    fn bind_method_args(
        &mut self,
        iseq: &Rc<Iseq>,
        env: &Rc<Environment>,
        args: CallArgs,
    ) -> VmResult<()> {
        let params = iseq.params().clone();
        let positional = args.positional;

        if let Some(rest_slot) = params.rest_start {
            if positional.len() < params.lead_num {
                return Err(GarnetError::arity(positional.len(), params.lead_num).into());
            }
            for (i, value) in positional.iter().take(params.lead_num).enumerate() {
                env.set(i, value.clone());
            }
            let rest: Vec<Value> = positional[params.lead_num..].to_vec();
            env.set(rest_slot, Value::array(rest));
        } else {
            if positional.len() != params.lead_num {
                return Err(GarnetError::arity(positional.len(), params.lead_num).into());
            }
            for (i, value) in positional.iter().enumerate() {
                env.set(i, value.clone());
            }
        }

        if !params.keywords.is_empty() {
            let mut bits: i64 = 0;
            for (i, (kw_name, default)) in params.keywords.iter().enumerate() {
                let slot = iseq
                    .local_table()
                    .index_of(kw_name)
                    .ok_or_else(|| GarnetError::internal("keyword without a local slot"))?;
                match args.keywords.iter().find(|(name, _)| name == kw_name) {
                    Some((_, value)) => {
                        bits |= 1 << i;
                        env.set(slot, value.clone());
                    }
                    None => {
                        if let Some(default) = default {
                            env.set(slot, default.clone());
                        }
                    }
                }
            }
            for (name, _) in &args.keywords {
                if !params.keywords.iter().any(|(kw, _)| kw == name) {
                    return Err(GarnetError::argument(format!("unknown keyword: :{name}")).into());
                }
            }
            if let Some(kwbits_slot) = params.kwbits {
                env.set(kwbits_slot, Value::Integer(bits));
            }
        } else if !args.keywords.is_empty() {
            return Err(GarnetError::argument("no keywords accepted").into());
        }

        Ok(())
    }

    fn bind_block_args(&mut self, iseq: &Rc<Iseq>, env: &Rc<Environment>, args: &[Value]) {
        let params = iseq.params().clone();
        let mut positional: Vec<Value> = args.to_vec();
        // Blocks with more than one leading parameter auto-splat a single
        // array argument.
        if params.lead_num > 1 && positional.len() == 1 {
            if let Value::Array(items) = &positional[0] {
                let splatted = items.borrow().clone();
                positional = splatted;
            }
        }
        for i in 0..params.lead_num {
            env.set(i, positional.get(i).cloned().unwrap_or(Value::Nil));
        }
        if let Some(rest_slot) = params.rest_start {
            let rest: Vec<Value> = positional
                .get(params.lead_num..)
                .map(<[Value]>::to_vec)
                .unwrap_or_default();
            env.set(rest_slot, Value::array(rest));
        }
    }

    // =========================================================================
    // Method Dispatch
    // =========================================================================

    /// Invoke `name` on `recv` with staged arguments.
    pub fn call_method(&mut self, recv: Value, name: &Symbol, args: CallArgs) -> VmResult<Value> {
        if matches!(recv, Value::FrozenCore) {
            let f = self
                .builtins
                .core_method(name)
                .ok_or_else(|| GarnetError::no_method(name.as_str(), "frozen core"))?;
            return f(self, recv, &args);
        }

        if let Some((method, owner)) = self.resolve_method(&recv, name) {
            return match method {
                Method::Iseq(m) => self.run_method_frame(name.clone(), owner, &m, recv, args),
                Method::Native(f) => f(self, recv, &args),
                Method::Undefined => {
                    Err(GarnetError::no_method(name.as_str(), recv.inspect()).into())
                }
            };
        }

        if let Some(f) = self.builtins.lookup(recv.kind(), name) {
            return f(self, recv, &args);
        }
        if let Some(f) = self.builtins.universal(name) {
            return f(self, recv, &args);
        }

        Err(GarnetError::no_method(
            name.as_str(),
            format!("an instance of {}", self.class_of(&recv).borrow().name),
        )
        .into())
    }

    /// Resolve a method through the receiver's class hierarchy. Returns
    /// the entry and the owning class, or `None` when only the primitive
    /// builtin registry could answer.
    #[must_use]
    pub fn resolve_method(
        &self,
        recv: &Value,
        name: &Symbol,
    ) -> Option<(Method, Rc<RefCell<RClass>>)> {
        match recv {
            Value::Object(o) => {
                let start = match o.borrow().singleton.clone() {
                    Some(singleton) => singleton,
                    None => Rc::clone(&o.borrow().class),
                };
                RClass::lookup(&start, name)
            }
            Value::Class(c) => {
                let singleton = RClass::singleton_class(c);
                RClass::lookup(&singleton, name)
            }
            // Primitive receivers consult their (possibly reopened) core
            // class before the builtin registry, so user definitions and
            // aliases on core classes shadow native entries.
            other => RClass::lookup(&self.class_of(other), name),
        }
    }

    /// Map a core class back to the primitive kind it describes, if any.
    #[must_use]
    pub fn kind_for_class(&self, class: &Rc<RefCell<RClass>>) -> Option<ValueKind> {
        let pairs: [(&Rc<RefCell<RClass>>, ValueKind); 13] = [
            (&self.core.integer, ValueKind::Integer),
            (&self.core.float, ValueKind::Float),
            (&self.core.string, ValueKind::String),
            (&self.core.symbol, ValueKind::Symbol),
            (&self.core.array, ValueKind::Array),
            (&self.core.hash, ValueKind::Hash),
            (&self.core.range, ValueKind::Range),
            (&self.core.regexp, ValueKind::Regexp),
            (&self.core.nil_class, ValueKind::Nil),
            (&self.core.true_class, ValueKind::Bool),
            (&self.core.false_class, ValueKind::Bool),
            (&self.core.proc_class, ValueKind::Proc),
            (&self.core.object, ValueKind::Object),
        ];
        pairs
            .iter()
            .find(|(c, _)| Rc::ptr_eq(c, class))
            .map(|(_, kind)| *kind)
    }

    /// Direct access to the kind-specific builtin table.
    #[must_use]
    pub fn builtin_lookup(&self, kind: ValueKind, name: &Symbol) -> Option<crate::rclass::NativeFn> {
        self.builtins.lookup(kind, name)
    }

    /// Check whether `name` resolves on `recv` through any dispatch path.
    #[must_use]
    pub fn method_defined(&self, recv: &Value, name: &Symbol) -> bool {
        match self.resolve_method(recv, name) {
            Some((Method::Undefined, _)) => false,
            Some(_) => true,
            None => {
                self.builtins.lookup(recv.kind(), name).is_some()
                    || self.builtins.universal(name).is_some()
            }
        }
    }

    /// Resolve the method `name` starting *above* `owner`, for super calls.
    #[must_use]
    pub fn resolve_super_method(
        &self,
        owner: &Rc<RefCell<RClass>>,
        name: &Symbol,
    ) -> Option<(Method, Rc<RefCell<RClass>>)> {
        let superclass = owner.borrow().superclass.clone()?;
        RClass::lookup(&superclass, name)
    }

    /// The class of any value.
    #[must_use]
    pub fn class_of(&self, value: &Value) -> Rc<RefCell<RClass>> {
        match value {
            Value::Nil => Rc::clone(&self.core.nil_class),
            Value::Bool(true) => Rc::clone(&self.core.true_class),
            Value::Bool(false) => Rc::clone(&self.core.false_class),
            Value::Integer(_) => Rc::clone(&self.core.integer),
            Value::Float(_) => Rc::clone(&self.core.float),
            Value::String(_) => Rc::clone(&self.core.string),
            Value::Symbol(_) => Rc::clone(&self.core.symbol),
            Value::Array(_) => Rc::clone(&self.core.array),
            Value::Hash(_) => Rc::clone(&self.core.hash),
            Value::Range(_) => Rc::clone(&self.core.range),
            Value::Regexp(_) => Rc::clone(&self.core.regexp),
            Value::Class(c) => {
                if c.borrow().module {
                    Rc::clone(&self.core.module_class)
                } else {
                    Rc::clone(&self.core.class_class)
                }
            }
            Value::Proc(_) => Rc::clone(&self.core.proc_class),
            Value::Object(o) => Rc::clone(&o.borrow().class),
            Value::FrozenCore => Rc::clone(&self.core.object),
        }
    }

    /// Case equality (`===`): class membership for classes and modules,
    /// cover for ranges, match for regexps, `==` otherwise.
    pub fn case_equal(&mut self, pattern: &Value, target: &Value) -> VmResult<bool> {
        match pattern {
            Value::Class(class) => {
                let target_class = self.class_of(target);
                Ok(RClass::is_ancestor_of(class, &target_class))
            }
            Value::Range(range) => {
                let after_begin = match range.begin.compare(target) {
                    Some(ord) => ord != std::cmp::Ordering::Greater,
                    None if range.begin.is_nil() => true,
                    None => return Ok(false),
                };
                let before_end = match target.compare(&range.end) {
                    Some(ord) => {
                        if range.exclude_end {
                            ord == std::cmp::Ordering::Less
                        } else {
                            ord != std::cmp::Ordering::Greater
                        }
                    }
                    None if range.end.is_nil() => true,
                    None => return Ok(false),
                };
                Ok(after_begin && before_end)
            }
            Value::Regexp(regexp) => match target.as_string() {
                Some(s) => {
                    let matched = crate::ops::strings::match_against(self, regexp, &s);
                    Ok(matched.is_some())
                }
                None => Ok(false),
            },
            _ => {
                let result = self.call_method(
                    pattern.clone(),
                    &intern("=="),
                    CallArgs::positional([target.clone()]),
                )?;
                Ok(result.truthy())
            }
        }
    }

    // =========================================================================
    // Exceptions as Values
    // =========================================================================

    /// Materialize a host error as an exception object.
    #[must_use]
    pub fn error_to_value(&mut self, error: &GarnetError) -> Value {
        let class = self.core.exception_class_named(error.exception_class());
        let object = RObject::new(class);
        let text = error.to_string();
        let message = text
            .split_once(": ")
            .map_or(text.as_str(), |(_, rest)| rest);
        object
            .borrow_mut()
            .ivars
            .insert(intern("@message"), Value::string(message));
        Value::Object(object)
    }

    /// Fold a raised value back into a host error.
    #[must_use]
    pub fn error_from_value(&self, value: &Value) -> GarnetError {
        match value {
            Value::Object(o) => {
                let class_name = o.borrow().class.borrow().name.clone();
                let message = o
                    .borrow()
                    .ivars
                    .get(&intern("@message"))
                    .map_or_else(|| class_name.clone(), Value::to_display_string);
                match class_name.as_str() {
                    "NameError" => GarnetError::name(message),
                    "TypeError" => GarnetError::type_error(message),
                    "ArgumentError" => GarnetError::argument(message),
                    "ZeroDivisionError" => GarnetError::ZeroDivision,
                    "FrozenError" => GarnetError::frozen(message),
                    "LocalJumpError" => GarnetError::local_jump(message),
                    "NotImplementedError" => GarnetError::not_implemented(message),
                    _ => GarnetError::runtime(message),
                }
            }
            Value::String(_) => GarnetError::runtime(value.to_display_string()),
            other => GarnetError::runtime(other.inspect()),
        }
    }

    // =========================================================================
    // Constants
    // =========================================================================

    /// Search the lexical nesting (innermost outward), then the ancestors
    /// of the innermost scope, then the top-level namespace.
    #[must_use]
    pub fn search_constant(&self, name: &Symbol) -> Option<Value> {
        for scope in self.frame().nesting.iter().rev() {
            if let Value::Class(class) = scope {
                if let Some(value) = class.borrow().constants.get(name) {
                    return Some(value.clone());
                }
            }
        }
        if let Some(Value::Class(innermost)) = self.frame().nesting.last() {
            if let Some(value) = Self::constant_in_ancestors(innermost, name) {
                return Some(value);
            }
        }
        self.core.object.borrow().constants.get(name).cloned()
    }

    /// Search a class and its ancestors for a constant.
    #[must_use]
    pub fn constant_in_ancestors(class: &Rc<RefCell<RClass>>, name: &Symbol) -> Option<Value> {
        let mut current = Some(Rc::clone(class));
        while let Some(c) = current {
            if let Some(value) = c.borrow().constants.get(name) {
                return Some(value.clone());
            }
            current = c.borrow().superclass.clone();
        }
        None
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
