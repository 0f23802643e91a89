//! Frames and environments.
//!
//! A frame is a runtime activation of an instruction sequence. Locals live
//! in an [`Environment`] with a lexical parent chain: block frames address
//! outer locals by `level`, and a block that escapes its defining frame
//! keeps that frame's locals alive through the shared `Rc`.

use crate::iseq::Iseq;
use crate::rclass::RClass;
use crate::value::Value;
use std::cell::RefCell;
use std::rc::Rc;

/// Maximum frame depth before the machine refuses to recurse further.
pub const MAX_FRAME_DEPTH: usize = 1000;

/// The runtime kind of a frame. Mirrors the iseq kinds that can be
/// activated, plus the distinctions unwinding cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Top-level frame.
    Top,
    /// Method invocation.
    Method,
    /// Block invocation.
    Block,
    /// Class or module body.
    Class,
    /// Rescue handler body.
    Rescue,
    /// Ensure handler body.
    Ensure,
    /// Eval frame.
    Eval,
    /// `once`-guarded body.
    Plain,
}

/// A local-variable environment with a lexical parent chain.
#[derive(Debug)]
pub struct Environment {
    locals: RefCell<Vec<Value>>,
    parent: Option<Rc<Environment>>,
}

impl Environment {
    /// Create an environment with `size` nil-initialized slots.
    #[must_use]
    pub fn new(size: usize, parent: Option<Rc<Environment>>) -> Rc<Self> {
        Rc::new(Self {
            locals: RefCell::new(vec![Value::Nil; size]),
            parent,
        })
    }

    /// Walk `level` lexical parents.
    #[must_use]
    pub fn at_level(self: &Rc<Self>, level: usize) -> Option<Rc<Environment>> {
        let mut env = Rc::clone(self);
        for _ in 0..level {
            env = Rc::clone(env.parent.as_ref()?);
        }
        Some(env)
    }

    /// Read a local slot.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Value> {
        self.locals.borrow().get(index).cloned()
    }

    /// Write a local slot, growing the environment if the slot is past the
    /// current end (test sequences may bind locals lazily).
    pub fn set(&self, index: usize, value: Value) {
        let mut locals = self.locals.borrow_mut();
        if index >= locals.len() {
            locals.resize(index + 1, Value::Nil);
        }
        locals[index] = value;
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locals.borrow().len()
    }

    /// Check for an empty environment.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locals.borrow().is_empty()
    }
}

/// Pattern-match backreference state stored in the special-variable slots.
#[derive(Debug, Clone, Default)]
pub struct Backref {
    /// Text preceding the match.
    pub pre: String,
    /// The full matched text.
    pub full: String,
    /// Text following the match.
    pub post: String,
    /// Capture groups; index 0 is the full match.
    pub captures: Vec<Option<String>>,
}

/// Special-variable slots owned by method and top frames: the last read
/// line, the last pattern match, and flip-flop states keyed by slot.
#[derive(Debug, Default)]
pub struct SpecialVariables {
    /// `$_` slot.
    pub lastline: Value,
    /// `$~` slot, populated by pattern matches.
    pub backref: Option<Backref>,
    /// Flip-flop slots, keyed by (key - 2) of `getspecial`/`setspecial`.
    pub flipflops: Vec<bool>,
}

impl SpecialVariables {
    /// Read a flip-flop slot; unset slots read as false.
    #[must_use]
    pub fn flipflop(&self, slot: usize) -> bool {
        self.flipflops.get(slot).copied().unwrap_or(false)
    }

    /// Write a flip-flop slot, growing the table as needed.
    pub fn set_flipflop(&mut self, slot: usize, state: bool) {
        if slot >= self.flipflops.len() {
            self.flipflops.resize(slot + 1, false);
        }
        self.flipflops[slot] = state;
    }
}

/// A block: an instruction sequence closed over its defining frame.
#[derive(Debug)]
pub struct Block {
    /// Body to run on yield.
    pub iseq: Rc<Iseq>,
    /// The defining frame's environment (lexical parent of each activation).
    pub env: Rc<Environment>,
    /// The defining frame's `self`.
    pub self_value: Value,
    /// The defining frame's constant nesting.
    pub nesting: Vec<Value>,
    /// The defining method's special-variable slots, shared so that
    /// pattern matches inside the block are visible outside it.
    pub svars: Rc<RefCell<SpecialVariables>>,
}

/// A runtime activation of an instruction sequence.
#[derive(Debug)]
pub struct Frame {
    /// The iseq being executed.
    pub iseq: Rc<Iseq>,
    /// Frame kind, used by unwinding.
    pub kind: FrameKind,
    /// Local-variable environment.
    pub env: Rc<Environment>,
    /// The frame's `self`.
    pub self_value: Value,
    /// Constant nesting, innermost last.
    pub nesting: Vec<Value>,
    /// Special-variable slots (owned by method/top frames, shared
    /// downward by block and handler frames).
    pub svars: Rc<RefCell<SpecialVariables>>,
    /// Block argument, for method frames invoked with a block.
    pub block: Option<Rc<Block>>,
    /// Selector and defining class, for method frames. Super resolution
    /// starts above the defining class.
    pub owner: Option<(garnet_core::Symbol, Rc<RefCell<RClass>>)>,
    /// Program counter into `iseq`.
    pub pc: usize,
    /// Value-stack height at frame entry; the frame's region starts here.
    pub stack_base: usize,
    /// Set by `leave`: the frame is finished with this return value.
    pub returning: Option<Value>,
}

impl Frame {
    /// Create a frame over an iseq with everything else defaulted; the
    /// machine's frame runners fill in the rest.
    #[must_use]
    pub fn new(iseq: Rc<Iseq>, kind: FrameKind, env: Rc<Environment>, self_value: Value) -> Self {
        Self {
            iseq,
            kind,
            env,
            self_value,
            nesting: Vec::new(),
            svars: Rc::new(RefCell::new(SpecialVariables::default())),
            block: None,
            owner: None,
            pc: 0,
            stack_base: 0,
            returning: None,
        }
    }
}
