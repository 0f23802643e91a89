//! The instruction catalog.
//!
//! Every opcode is one variant of [`Insn`], carrying its operands inline.
//! The uniform contract is a set of hooks over the enum:
//!
//! - [`Insn::length`]: encoded width (the opcode plus one slot per operand)
//! - [`Insn::pops`] / [`Insn::pushes`]: declared stack effect
//! - [`Insn::canonical`]: the primitive form a specialized or legacy
//!   variant is equivalent to
//! - [`Insn::to_a`] / [`Insn::from_a`]: the serialized tuple form
//! - [`Insn::disasm`]: one line of disassembly
//! - [`Insn::call`]: execution against a [`Vm`]
//!
//! Two stack-effect reports are intentionally odd to match the reference
//! engine: `checktype` reports 2 pushes (it pushes one boolean), and
//! `leave` reports 0 pushes while transferring the popped value to the
//! caller. Stack verifiers must special-case both.

use crate::disasm::Formatter;
use crate::iseq::{Iseq, Label};
use crate::ops;
use crate::value::Value;
use crate::vm::{Vm, VmResult};
use garnet_core::intern::{intern, Symbol};
use garnet_core::{CallData, GarnetError};
use std::cell::OnceCell;
use std::fmt;
use std::rc::Rc;

// =============================================================================
// Operand Types
// =============================================================================

/// The three ambient references `putspecialobject` can push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialObject {
    /// The frozen-core sentinel (operand 1).
    VmCore = 1,
    /// The lexical class scope (operand 2).
    CBase = 2,
    /// The base scope for constant definition (operand 3).
    ConstBase = 3,
}

impl SpecialObject {
    /// Decode the serialized operand.
    #[must_use]
    pub fn from_operand(value: i64) -> Option<Self> {
        Some(match value {
            1 => Self::VmCore,
            2 => Self::CBase,
            3 => Self::ConstBase,
            _ => return None,
        })
    }
}

/// Context selector of `checkmatch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMatchKind {
    /// `when` clause: case-equality.
    When = 1,
    /// `case/in` subject test.
    Case = 2,
    /// `rescue` clause: exception class test.
    Rescue = 3,
}

impl CheckMatchKind {
    /// Decode the low bits of the serialized operand.
    #[must_use]
    pub fn from_operand(value: i64) -> Option<Self> {
        Some(match value & 0x03 {
            1 => Self::When,
            2 => Self::Case,
            3 => Self::Rescue,
            _ => return None,
        })
    }
}

/// Bit 2 of the checkmatch operand: splat the pattern array.
pub const CHECKMATCH_ARRAY: i64 = 0x04;

/// Primitive type tags understood by `checktype`, matching the reference
/// engine's numbering. Tags with no representation here (struct, file,
/// bignum, data, match, complex, rational, undef) are reserved: the check
/// answers false.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckTypeKind {
    /// Plain object.
    Object = 0x01,
    /// Class (not module).
    Class = 0x02,
    /// Module.
    Module = 0x03,
    /// Float.
    Float = 0x04,
    /// String.
    String = 0x05,
    /// Regexp.
    Regexp = 0x06,
    /// Array.
    Array = 0x07,
    /// Hash.
    Hash = 0x08,
    /// Struct (reserved).
    Struct = 0x09,
    /// Arbitrary-precision integer (reserved).
    Bignum = 0x0a,
    /// File (reserved).
    File = 0x0b,
    /// Data (reserved).
    Data = 0x0c,
    /// MatchData (reserved).
    Match = 0x0d,
    /// Complex (reserved).
    Complex = 0x0e,
    /// Rational (reserved).
    Rational = 0x0f,
    /// nil.
    Nil = 0x11,
    /// true.
    True = 0x12,
    /// false.
    False = 0x13,
    /// Symbol.
    Symbol = 0x14,
    /// Machine integer.
    Fixnum = 0x15,
    /// Undefined sentinel (reserved).
    Undef = 0x16,
}

impl CheckTypeKind {
    /// Decode the serialized operand.
    #[must_use]
    pub fn from_operand(value: i64) -> Option<Self> {
        Some(match value {
            0x01 => Self::Object,
            0x02 => Self::Class,
            0x03 => Self::Module,
            0x04 => Self::Float,
            0x05 => Self::String,
            0x06 => Self::Regexp,
            0x07 => Self::Array,
            0x08 => Self::Hash,
            0x09 => Self::Struct,
            0x0a => Self::Bignum,
            0x0b => Self::File,
            0x0c => Self::Data,
            0x0d => Self::Match,
            0x0e => Self::Complex,
            0x0f => Self::Rational,
            0x11 => Self::Nil,
            0x12 => Self::True,
            0x13 => Self::False,
            0x14 => Self::Symbol,
            0x15 => Self::Fixnum,
            0x16 => Self::Undef,
            _ => return None,
        })
    }
}

/// Role selector of `defined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinedKind {
    /// `defined?(nil)`.
    Nil = 1,
    /// Instance variable.
    IVar = 2,
    /// Local variable.
    Lvar = 3,
    /// Global variable.
    Gvar = 4,
    /// Class variable.
    CVar = 5,
    /// Constant (lexical search).
    Const = 6,
    /// Method with explicit receiver.
    Method = 7,
    /// `defined?(yield)`.
    Yield = 8,
    /// `defined?(super)`.
    ZSuper = 9,
    /// `defined?(self)`.
    Self_ = 10,
    /// `defined?(true)`.
    True = 11,
    /// `defined?(false)`.
    False = 12,
    /// Assignment expression.
    Asgn = 13,
    /// Generic expression.
    Expr = 14,
    /// Backreference / special variable.
    Ref = 15,
    /// Function-style call.
    Func = 16,
    /// Constant scoped to an explicit base.
    ConstFrom = 17,
}

impl DefinedKind {
    /// Decode the serialized operand.
    #[must_use]
    pub fn from_operand(value: i64) -> Option<Self> {
        Some(match value {
            1 => Self::Nil,
            2 => Self::IVar,
            3 => Self::Lvar,
            4 => Self::Gvar,
            5 => Self::CVar,
            6 => Self::Const,
            7 => Self::Method,
            8 => Self::Yield,
            9 => Self::ZSuper,
            10 => Self::Self_,
            11 => Self::True,
            12 => Self::False,
            13 => Self::Asgn,
            14 => Self::Expr,
            15 => Self::Ref,
            16 => Self::Func,
            17 => Self::ConstFrom,
            _ => return None,
        })
    }
}

/// The per-instruction latch of `once`.
///
/// The latch is an operand handle, not instruction state: the instruction
/// stays immutable while the slot it points at fills in at most once per
/// process.
#[derive(Clone, Default)]
pub struct OnceCache {
    slot: Rc<OnceCell<Value>>,
}

impl OnceCache {
    /// Create an empty latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached value, if the body already ran.
    #[must_use]
    pub fn get(&self) -> Option<Value> {
        self.slot.get().cloned()
    }

    /// Latch the value. A second set is ignored.
    pub fn set(&self, value: Value) {
        let _ = self.slot.set(value);
    }
}

impl fmt::Debug for OnceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot.get() {
            Some(value) => write!(f, "OnceCache({})", value.inspect()),
            None => write!(f, "OnceCache(empty)"),
        }
    }
}

impl PartialEq for OnceCache {
    /// Latch identity is not part of an instruction's structural
    /// identity; serialization round-trips produce fresh latches.
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

// =============================================================================
// The Catalog
// =============================================================================

/// A bytecode instruction with its operands.
///
/// Instructions are immutable value objects; `Clone` shares aggregate
/// operands through `Rc`.
#[derive(Debug, Clone, PartialEq)]
pub enum Insn {
    // =========================================================================
    // Stack Manipulation
    // =========================================================================
    /// Discard the top of stack.
    Pop,
    /// Duplicate the top of stack (shallow).
    Dup,
    /// Duplicate the top `count` elements as a block, preserving order.
    DupN {
        /// Number of elements to duplicate.
        count: usize,
    },
    /// Exchange the top two elements.
    Swap,
    /// Push a copy of the element `count` slots below the top.
    TopN {
        /// Depth below the top (0 is the top).
        count: usize,
    },
    /// Overwrite the element `count` slots below the top with a copy of
    /// the top.
    SetN {
        /// Depth below the top.
        count: usize,
    },
    /// Drop `count` elements from the top.
    AdjustStack {
        /// Number of elements to drop.
        count: usize,
    },

    // =========================================================================
    // Constants and Literals
    // =========================================================================
    /// Push nil.
    PutNil,
    /// Push the current `self`.
    PutSelf,
    /// Push a literal object.
    PutObject {
        /// The literal.
        object: Value,
    },
    /// Push a fresh copy of a string literal.
    PutString {
        /// The literal content.
        string: String,
    },
    /// Specialized push of the integer 0.
    PutObjectInt2Fix0,
    /// Specialized push of the integer 1.
    PutObjectInt2Fix1,
    /// Push a shallow copy of a literal array.
    DupArray {
        /// The literal array.
        array: Value,
    },
    /// Push a shallow copy of a literal hash.
    DupHash {
        /// The literal hash.
        hash: Value,
    },
    /// Push one of the three ambient references.
    PutSpecialObject {
        /// Which reference.
        kind: SpecialObject,
    },

    // =========================================================================
    // Arithmetic and Comparison Specializations
    // =========================================================================
    /// Specialized `+`.
    OptPlus {
        /// Call-site descriptor of the canonical send.
        calldata: CallData,
    },
    /// Specialized `-`.
    OptMinus {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `*`.
    OptMult {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `/`.
    OptDiv {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `%`.
    OptMod {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `&`.
    OptAnd {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `|`.
    OptOr {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `<<`.
    OptLtLt {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `<`.
    OptLt {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `<=`.
    OptLe {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `>`.
    OptGt {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `>=`.
    OptGe {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `==`.
    OptEq {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `!=`: the complement of equality. Carries both call
    /// sites and does not canonicalize to a single send.
    OptNeq {
        /// Descriptor of the underlying `==` site.
        eq_calldata: CallData,
        /// Descriptor of the `!=` site itself.
        neq_calldata: CallData,
    },
    /// Specialized `succ`.
    OptSucc {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `!`.
    OptNot {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `length`.
    OptLength {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `size`.
    OptSize {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `empty?`.
    OptEmptyP {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `nil?`.
    OptNilP {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `=~`.
    OptRegexpMatch2 {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `[]`.
    OptAref {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Specialized `[]=`.
    OptAset {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// `[]` with a literal string key baked in.
    OptArefWith {
        /// The literal key.
        key: String,
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// `[]=` with a literal string key baked in.
    OptAsetWith {
        /// The literal key.
        key: String,
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Push `freeze` of a literal string.
    OptStrFreeze {
        /// The literal content.
        string: String,
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Push `-@` of a literal string.
    OptStrUMinus {
        /// The literal content.
        string: String,
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Pop `count` values and push their maximum.
    OptNewArrayMax {
        /// Number of operands.
        count: usize,
    },
    /// Pop `count` values and push their minimum.
    OptNewArrayMin {
        /// Number of operands.
        count: usize,
    },
    /// Pop the subject and transfer through a literal dispatch table.
    OptCaseDispatch {
        /// (literal, target) pairs in source order.
        table: Vec<(Value, Label)>,
        /// Transfer target on a miss.
        else_label: Label,
    },

    // =========================================================================
    // Strings and Ranges
    // =========================================================================
    /// Pop `count` fragments and push their concatenation.
    ConcatStrings {
        /// Number of fragments.
        count: usize,
    },
    /// Pop (original, coerced); push the coerced string or a fallback
    /// representation of the original.
    AnyToString,
    /// Pop the top and push its string conversion.
    ObjToString {
        /// Call-site descriptor of the `to_s` send.
        calldata: CallData,
    },
    /// Pop a string and push its interned symbol.
    Intern,
    /// Pop `count` fragments, join, and push a compiled regexp.
    ToRegexp {
        /// Regexp option bits.
        options: u8,
        /// Number of fragments.
        count: usize,
    },
    /// Pop (lo, hi) and push a range.
    NewRange {
        /// Whether the range excludes its upper endpoint.
        exclude_end: bool,
    },

    // =========================================================================
    // Arrays and Hashes
    // =========================================================================
    /// Build an array from the top `count` slots.
    NewArray {
        /// Number of elements.
        count: usize,
    },
    /// Build an array whose trailing element is a keyword-splat hash.
    NewArrayKwSplat {
        /// Number of elements.
        count: usize,
    },
    /// Build a hash from `count` consecutive key/value slots.
    NewHash {
        /// Number of slots (even).
        count: usize,
    },
    /// Pop (left, right) and push `[*left, *right]`.
    ConcatArray,
    /// Pop, coerce to array; the flag selects a defensive copy.
    SplatArray {
        /// Copy before pushing.
        flag: bool,
    },
    /// Pop an array and spread `count` elements onto the stack.
    ExpandArray {
        /// Number of elements to spread.
        count: usize,
        /// Bit 0: emit the remainder array. Bit 1: take from the tail.
        flags: u8,
    },

    // =========================================================================
    // Variables
    // =========================================================================
    /// Read a local `level` lexical frames up.
    GetLocal {
        /// Internal slot index.
        index: usize,
        /// Lexical distance.
        level: usize,
    },
    /// Write a local `level` lexical frames up.
    SetLocal {
        /// Internal slot index.
        index: usize,
        /// Lexical distance.
        level: usize,
    },
    /// Specialized `getlocal` at level 0.
    GetLocalWc0 {
        /// Internal slot index.
        index: usize,
    },
    /// Specialized `getlocal` at level 1.
    GetLocalWc1 {
        /// Internal slot index.
        index: usize,
    },
    /// Specialized `setlocal` at level 0.
    SetLocalWc0 {
        /// Internal slot index.
        index: usize,
    },
    /// Specialized `setlocal` at level 1.
    SetLocalWc1 {
        /// Internal slot index.
        index: usize,
    },
    /// Read the block-parameter local, materializing it on first access.
    GetBlockParam {
        /// Internal slot index.
        index: usize,
        /// Lexical distance.
        level: usize,
    },
    /// Read the block parameter through a proxy that avoids forcing
    /// materialization into the frame.
    GetBlockParamProxy {
        /// Internal slot index.
        index: usize,
        /// Lexical distance.
        level: usize,
    },
    /// Overwrite the block-parameter local.
    SetBlockParam {
        /// Internal slot index.
        index: usize,
        /// Lexical distance.
        level: usize,
    },
    /// Read instance state of the current `self`.
    GetInstanceVariable {
        /// Variable name (`@name`).
        name: Symbol,
        /// Inline-storage index.
        cache: usize,
    },
    /// Write instance state of the current `self`.
    SetInstanceVariable {
        /// Variable name.
        name: Symbol,
        /// Inline-storage index.
        cache: usize,
    },
    /// Read a class variable from the current scope's class chain. The
    /// cache is absent in legacy bytecode streams.
    GetClassVariable {
        /// Variable name (`@@name`).
        name: Symbol,
        /// Inline-storage index, when the stream carries one.
        cache: Option<usize>,
    },
    /// Write a class variable.
    SetClassVariable {
        /// Variable name.
        name: Symbol,
        /// Inline-storage index, when the stream carries one.
        cache: Option<usize>,
    },
    /// Read a global variable.
    GetGlobal {
        /// Variable name (`$name`).
        name: Symbol,
    },
    /// Write a global variable.
    SetGlobal {
        /// Variable name.
        name: Symbol,
    },
    /// Pop (const_base, allow_nil) and search for a constant.
    GetConstant {
        /// Constant name.
        name: Symbol,
    },
    /// Pop (value, parent) and assign a constant.
    SetConstant {
        /// Constant name.
        name: Symbol,
    },
    /// Resolve a dotted constant path; an empty leading name roots the
    /// search at the top level.
    OptGetConstantPath {
        /// Path segments.
        names: Vec<Symbol>,
    },
    /// Read a special-variable slot.
    GetSpecial {
        /// Slot key (0 lastline, 1 backref, 2+ flip-flop).
        key: usize,
        /// Backref view selector.
        svar_type: usize,
    },
    /// Write a special-variable slot.
    SetSpecial {
        /// Slot key.
        key: usize,
    },

    // =========================================================================
    // Control Flow
    // =========================================================================
    /// Unconditional transfer.
    Jump {
        /// Target.
        label: Label,
    },
    /// Pop; transfer when truthy.
    BranchIf {
        /// Target.
        label: Label,
    },
    /// Pop; transfer when falsy.
    BranchUnless {
        /// Target.
        label: Label,
    },
    /// Pop; transfer when nil.
    BranchNil {
        /// Target.
        label: Label,
    },
    /// Pop the return value and unwind the current frame. Reports zero
    /// pushes by design; see the module docs.
    Leave,
    /// No effect; a branch-target placeholder.
    Nop,
    /// Pop and initiate non-local control transfer.
    Throw {
        /// Encoded tag (kind in the low bits).
        tag: usize,
    },

    // =========================================================================
    // Pattern Matching
    // =========================================================================
    /// Pop (target, pattern) and push the context-specific match result.
    CheckMatch {
        /// Context selector.
        kind: CheckMatchKind,
        /// Splat the pattern array and match any element.
        array: bool,
    },
    /// Pop an object and push its membership in a primitive type.
    /// Reports two pushes by design; see the module docs.
    CheckType {
        /// Type tag.
        kind: CheckTypeKind,
    },
    /// Push whether the keyword at `keyword_index` was supplied, reading
    /// the keyword-presence bitmap local.
    CheckKeyword {
        /// Local slot of the bitmap.
        bits_index: usize,
        /// Keyword position.
        keyword_index: usize,
    },
    /// Classify whether `name` is defined in a given role; push the
    /// message or nil.
    Defined {
        /// Role selector.
        kind: DefinedKind,
        /// Subject (meaning depends on the role).
        name: Value,
        /// Pushed on success.
        message: Value,
    },

    // =========================================================================
    // Calls and Definitions
    // =========================================================================
    /// The general call.
    Send {
        /// Call-site descriptor.
        calldata: CallData,
        /// Block body attached to the call site.
        block_iseq: Option<Rc<Iseq>>,
    },
    /// A call known to carry no block.
    OptSendWithoutBlock {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Call the active block.
    InvokeBlock {
        /// Call-site descriptor.
        calldata: CallData,
    },
    /// Call the super-method of the enclosing method frame.
    InvokeSuper {
        /// Call-site descriptor.
        calldata: CallData,
        /// Block body attached to the call site.
        block_iseq: Option<Rc<Iseq>>,
    },
    /// Pop (cbase, superclass); create or reopen a class constant and run
    /// its body.
    DefineClass {
        /// Constant name.
        name: Symbol,
        /// Body.
        iseq: Rc<Iseq>,
        /// Type and scope bits.
        flags: u32,
    },
    /// Bind a method on the current definee.
    DefineMethod {
        /// Method name.
        name: Symbol,
        /// Body.
        iseq: Rc<Iseq>,
    },
    /// Pop an object; bind a method on its singleton class.
    DefineSMethod {
        /// Method name.
        name: Symbol,
        /// Body.
        iseq: Rc<Iseq>,
    },
    /// Run the body at most once per process; push the latched value.
    Once {
        /// Body.
        iseq: Rc<Iseq>,
        /// The latch.
        cache: OnceCache,
    },
}

impl Insn {
    /// The lowercase mnemonic, which doubles as the serialization tag.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pop => "pop",
            Self::Dup => "dup",
            Self::DupN { .. } => "dupn",
            Self::Swap => "swap",
            Self::TopN { .. } => "topn",
            Self::SetN { .. } => "setn",
            Self::AdjustStack { .. } => "adjuststack",
            Self::PutNil => "putnil",
            Self::PutSelf => "putself",
            Self::PutObject { .. } => "putobject",
            Self::PutString { .. } => "putstring",
            Self::PutObjectInt2Fix0 => "putobject_INT2FIX_0_",
            Self::PutObjectInt2Fix1 => "putobject_INT2FIX_1_",
            Self::DupArray { .. } => "duparray",
            Self::DupHash { .. } => "duphash",
            Self::PutSpecialObject { .. } => "putspecialobject",
            Self::OptPlus { .. } => "opt_plus",
            Self::OptMinus { .. } => "opt_minus",
            Self::OptMult { .. } => "opt_mult",
            Self::OptDiv { .. } => "opt_div",
            Self::OptMod { .. } => "opt_mod",
            Self::OptAnd { .. } => "opt_and",
            Self::OptOr { .. } => "opt_or",
            Self::OptLtLt { .. } => "opt_ltlt",
            Self::OptLt { .. } => "opt_lt",
            Self::OptLe { .. } => "opt_le",
            Self::OptGt { .. } => "opt_gt",
            Self::OptGe { .. } => "opt_ge",
            Self::OptEq { .. } => "opt_eq",
            Self::OptNeq { .. } => "opt_neq",
            Self::OptSucc { .. } => "opt_succ",
            Self::OptNot { .. } => "opt_not",
            Self::OptLength { .. } => "opt_length",
            Self::OptSize { .. } => "opt_size",
            Self::OptEmptyP { .. } => "opt_empty_p",
            Self::OptNilP { .. } => "opt_nil_p",
            Self::OptRegexpMatch2 { .. } => "opt_regexpmatch2",
            Self::OptAref { .. } => "opt_aref",
            Self::OptAset { .. } => "opt_aset",
            Self::OptArefWith { .. } => "opt_aref_with",
            Self::OptAsetWith { .. } => "opt_aset_with",
            Self::OptStrFreeze { .. } => "opt_str_freeze",
            Self::OptStrUMinus { .. } => "opt_str_uminus",
            Self::OptNewArrayMax { .. } => "opt_newarray_max",
            Self::OptNewArrayMin { .. } => "opt_newarray_min",
            Self::OptCaseDispatch { .. } => "opt_case_dispatch",
            Self::ConcatStrings { .. } => "concatstrings",
            Self::AnyToString => "anytostring",
            Self::ObjToString { .. } => "objtostring",
            Self::Intern => "intern",
            Self::ToRegexp { .. } => "toregexp",
            Self::NewRange { .. } => "newrange",
            Self::NewArray { .. } => "newarray",
            Self::NewArrayKwSplat { .. } => "newarraykwsplat",
            Self::NewHash { .. } => "newhash",
            Self::ConcatArray => "concatarray",
            Self::SplatArray { .. } => "splatarray",
            Self::ExpandArray { .. } => "expandarray",
            Self::GetLocal { .. } => "getlocal",
            Self::SetLocal { .. } => "setlocal",
            Self::GetLocalWc0 { .. } => "getlocal_WC_0",
            Self::GetLocalWc1 { .. } => "getlocal_WC_1",
            Self::SetLocalWc0 { .. } => "setlocal_WC_0",
            Self::SetLocalWc1 { .. } => "setlocal_WC_1",
            Self::GetBlockParam { .. } => "getblockparam",
            Self::GetBlockParamProxy { .. } => "getblockparamproxy",
            Self::SetBlockParam { .. } => "setblockparam",
            Self::GetInstanceVariable { .. } => "getinstancevariable",
            Self::SetInstanceVariable { .. } => "setinstancevariable",
            Self::GetClassVariable { .. } => "getclassvariable",
            Self::SetClassVariable { .. } => "setclassvariable",
            Self::GetGlobal { .. } => "getglobal",
            Self::SetGlobal { .. } => "setglobal",
            Self::GetConstant { .. } => "getconstant",
            Self::SetConstant { .. } => "setconstant",
            Self::OptGetConstantPath { .. } => "opt_getconstant_path",
            Self::GetSpecial { .. } => "getspecial",
            Self::SetSpecial { .. } => "setspecial",
            Self::Jump { .. } => "jump",
            Self::BranchIf { .. } => "branchif",
            Self::BranchUnless { .. } => "branchunless",
            Self::BranchNil { .. } => "branchnil",
            Self::Leave => "leave",
            Self::Nop => "nop",
            Self::Throw { .. } => "throw",
            Self::CheckMatch { .. } => "checkmatch",
            Self::CheckType { .. } => "checktype",
            Self::CheckKeyword { .. } => "checkkeyword",
            Self::Defined { .. } => "defined",
            Self::Send { .. } => "send",
            Self::OptSendWithoutBlock { .. } => "opt_send_without_block",
            Self::InvokeBlock { .. } => "invokeblock",
            Self::InvokeSuper { .. } => "invokesuper",
            Self::DefineClass { .. } => "defineclass",
            Self::DefineMethod { .. } => "definemethod",
            Self::DefineSMethod { .. } => "definesmethod",
            Self::Once { .. } => "once",
        }
    }

    /// Encoded width: the opcode itself plus one slot per operand.
    #[must_use]
    pub fn length(&self) -> usize {
        match self {
            Self::Pop
            | Self::Dup
            | Self::Swap
            | Self::PutNil
            | Self::PutSelf
            | Self::PutObjectInt2Fix0
            | Self::PutObjectInt2Fix1
            | Self::AnyToString
            | Self::Intern
            | Self::ConcatArray
            | Self::Leave
            | Self::Nop => 1,

            Self::DupN { .. }
            | Self::TopN { .. }
            | Self::SetN { .. }
            | Self::AdjustStack { .. }
            | Self::PutObject { .. }
            | Self::PutString { .. }
            | Self::DupArray { .. }
            | Self::DupHash { .. }
            | Self::PutSpecialObject { .. }
            | Self::OptPlus { .. }
            | Self::OptMinus { .. }
            | Self::OptMult { .. }
            | Self::OptDiv { .. }
            | Self::OptMod { .. }
            | Self::OptAnd { .. }
            | Self::OptOr { .. }
            | Self::OptLtLt { .. }
            | Self::OptLt { .. }
            | Self::OptLe { .. }
            | Self::OptGt { .. }
            | Self::OptGe { .. }
            | Self::OptEq { .. }
            | Self::OptSucc { .. }
            | Self::OptNot { .. }
            | Self::OptLength { .. }
            | Self::OptSize { .. }
            | Self::OptEmptyP { .. }
            | Self::OptNilP { .. }
            | Self::OptRegexpMatch2 { .. }
            | Self::OptAref { .. }
            | Self::OptAset { .. }
            | Self::OptNewArrayMax { .. }
            | Self::OptNewArrayMin { .. }
            | Self::ConcatStrings { .. }
            | Self::ObjToString { .. }
            | Self::NewRange { .. }
            | Self::NewArray { .. }
            | Self::NewArrayKwSplat { .. }
            | Self::NewHash { .. }
            | Self::SplatArray { .. }
            | Self::GetLocalWc0 { .. }
            | Self::GetLocalWc1 { .. }
            | Self::SetLocalWc0 { .. }
            | Self::SetLocalWc1 { .. }
            | Self::GetGlobal { .. }
            | Self::SetGlobal { .. }
            | Self::GetConstant { .. }
            | Self::SetConstant { .. }
            | Self::OptGetConstantPath { .. }
            | Self::SetSpecial { .. }
            | Self::Jump { .. }
            | Self::BranchIf { .. }
            | Self::BranchUnless { .. }
            | Self::BranchNil { .. }
            | Self::Throw { .. }
            | Self::CheckMatch { .. }
            | Self::CheckType { .. }
            | Self::OptSendWithoutBlock { .. }
            | Self::InvokeBlock { .. } => 2,

            Self::OptNeq { .. }
            | Self::OptArefWith { .. }
            | Self::OptAsetWith { .. }
            | Self::OptStrFreeze { .. }
            | Self::OptStrUMinus { .. }
            | Self::OptCaseDispatch { .. }
            | Self::ToRegexp { .. }
            | Self::ExpandArray { .. }
            | Self::GetLocal { .. }
            | Self::SetLocal { .. }
            | Self::GetBlockParam { .. }
            | Self::GetBlockParamProxy { .. }
            | Self::SetBlockParam { .. }
            | Self::GetInstanceVariable { .. }
            | Self::SetInstanceVariable { .. }
            | Self::GetSpecial { .. }
            | Self::CheckKeyword { .. }
            | Self::Send { .. }
            | Self::InvokeSuper { .. }
            | Self::DefineMethod { .. }
            | Self::DefineSMethod { .. }
            | Self::Once { .. } => 3,

            Self::GetClassVariable { cache, .. } | Self::SetClassVariable { cache, .. } => {
                if cache.is_some() {
                    3
                } else {
                    2
                }
            }

            Self::Defined { .. } | Self::DefineClass { .. } => 4,
        }
    }

    /// Number of stack slots consumed.
    #[must_use]
    pub fn pops(&self) -> usize {
        match self {
            Self::Pop | Self::Dup | Self::Leave => 1,
            Self::DupN { count } | Self::AdjustStack { count } => *count,
            Self::Swap => 2,
            Self::TopN { .. } => 0,
            Self::SetN { .. } => 1,

            Self::PutNil
            | Self::PutSelf
            | Self::PutObject { .. }
            | Self::PutString { .. }
            | Self::PutObjectInt2Fix0
            | Self::PutObjectInt2Fix1
            | Self::DupArray { .. }
            | Self::DupHash { .. }
            | Self::PutSpecialObject { .. } => 0,

            Self::OptPlus { .. }
            | Self::OptMinus { .. }
            | Self::OptMult { .. }
            | Self::OptDiv { .. }
            | Self::OptMod { .. }
            | Self::OptAnd { .. }
            | Self::OptOr { .. }
            | Self::OptLtLt { .. }
            | Self::OptLt { .. }
            | Self::OptLe { .. }
            | Self::OptGt { .. }
            | Self::OptGe { .. }
            | Self::OptEq { .. }
            | Self::OptNeq { .. }
            | Self::OptRegexpMatch2 { .. }
            | Self::OptAref { .. } => 2,
            Self::OptAset { .. } => 3,
            Self::OptSucc { .. }
            | Self::OptNot { .. }
            | Self::OptLength { .. }
            | Self::OptSize { .. }
            | Self::OptEmptyP { .. }
            | Self::OptNilP { .. } => 1,
            Self::OptArefWith { .. } => 1,
            Self::OptAsetWith { .. } => 2,
            Self::OptStrFreeze { .. } | Self::OptStrUMinus { .. } => 0,
            Self::OptNewArrayMax { count } | Self::OptNewArrayMin { count } => *count,
            Self::OptCaseDispatch { .. } => 1,

            Self::ConcatStrings { count } => *count,
            Self::AnyToString => 2,
            Self::ObjToString { .. } | Self::Intern => 1,
            Self::ToRegexp { count, .. } => *count,
            Self::NewRange { .. } => 2,

            Self::NewArray { count } | Self::NewArrayKwSplat { count } | Self::NewHash { count } => {
                *count
            }
            Self::ConcatArray => 2,
            Self::SplatArray { .. } | Self::ExpandArray { .. } => 1,

            Self::GetLocal { .. }
            | Self::GetLocalWc0 { .. }
            | Self::GetLocalWc1 { .. }
            | Self::GetBlockParam { .. }
            | Self::GetBlockParamProxy { .. }
            | Self::GetInstanceVariable { .. }
            | Self::GetClassVariable { .. }
            | Self::GetGlobal { .. }
            | Self::OptGetConstantPath { .. }
            | Self::GetSpecial { .. } => 0,
            Self::SetLocal { .. }
            | Self::SetLocalWc0 { .. }
            | Self::SetLocalWc1 { .. }
            | Self::SetBlockParam { .. }
            | Self::SetInstanceVariable { .. }
            | Self::SetClassVariable { .. }
            | Self::SetGlobal { .. }
            | Self::SetSpecial { .. } => 1,
            Self::GetConstant { .. } | Self::SetConstant { .. } => 2,

            Self::Jump { .. } | Self::Nop => 0,
            Self::BranchIf { .. } | Self::BranchUnless { .. } | Self::BranchNil { .. } => 1,
            Self::Throw { .. } => 1,

            Self::CheckMatch { .. } => 2,
            Self::CheckType { .. } => 1,
            Self::CheckKeyword { .. } => 0,
            Self::Defined { .. } => 1,

            Self::Send { calldata, .. }
            | Self::OptSendWithoutBlock { calldata }
            | Self::InvokeSuper { calldata, .. } => 1 + calldata.stack_arg_slots(),
            Self::InvokeBlock { calldata } => calldata.argc() as usize,
            Self::DefineClass { .. } => 2,
            Self::DefineMethod { .. } => 0,
            Self::DefineSMethod { .. } => 1,
            Self::Once { .. } => 0,
        }
    }

    /// Number of stack slots produced, as the reference engine reports
    /// them. `checktype` and `leave` carry the documented anomalies.
    #[must_use]
    pub fn pushes(&self) -> usize {
        match self {
            Self::Pop | Self::AdjustStack { .. } => 0,
            Self::Dup => 2,
            Self::DupN { count } => 2 * count,
            Self::Swap => 2,
            Self::TopN { .. } => 1,
            Self::SetN { .. } => 1,

            Self::PutNil
            | Self::PutSelf
            | Self::PutObject { .. }
            | Self::PutString { .. }
            | Self::PutObjectInt2Fix0
            | Self::PutObjectInt2Fix1
            | Self::DupArray { .. }
            | Self::DupHash { .. }
            | Self::PutSpecialObject { .. } => 1,

            Self::OptCaseDispatch { .. } => 0,
            Self::OptPlus { .. }
            | Self::OptMinus { .. }
            | Self::OptMult { .. }
            | Self::OptDiv { .. }
            | Self::OptMod { .. }
            | Self::OptAnd { .. }
            | Self::OptOr { .. }
            | Self::OptLtLt { .. }
            | Self::OptLt { .. }
            | Self::OptLe { .. }
            | Self::OptGt { .. }
            | Self::OptGe { .. }
            | Self::OptEq { .. }
            | Self::OptNeq { .. }
            | Self::OptSucc { .. }
            | Self::OptNot { .. }
            | Self::OptLength { .. }
            | Self::OptSize { .. }
            | Self::OptEmptyP { .. }
            | Self::OptNilP { .. }
            | Self::OptRegexpMatch2 { .. }
            | Self::OptAref { .. }
            | Self::OptAset { .. }
            | Self::OptArefWith { .. }
            | Self::OptAsetWith { .. }
            | Self::OptStrFreeze { .. }
            | Self::OptStrUMinus { .. }
            | Self::OptNewArrayMax { .. }
            | Self::OptNewArrayMin { .. } => 1,

            Self::ConcatStrings { .. }
            | Self::AnyToString
            | Self::ObjToString { .. }
            | Self::Intern
            | Self::ToRegexp { .. }
            | Self::NewRange { .. } => 1,

            Self::NewArray { .. }
            | Self::NewArrayKwSplat { .. }
            | Self::NewHash { .. }
            | Self::ConcatArray
            | Self::SplatArray { .. } => 1,
            Self::ExpandArray { count, flags } => count + usize::from(flags & 0x01 != 0),

            Self::GetLocal { .. }
            | Self::GetLocalWc0 { .. }
            | Self::GetLocalWc1 { .. }
            | Self::GetBlockParam { .. }
            | Self::GetBlockParamProxy { .. }
            | Self::GetInstanceVariable { .. }
            | Self::GetClassVariable { .. }
            | Self::GetGlobal { .. }
            | Self::GetConstant { .. }
            | Self::OptGetConstantPath { .. }
            | Self::GetSpecial { .. } => 1,
            Self::SetLocal { .. }
            | Self::SetLocalWc0 { .. }
            | Self::SetLocalWc1 { .. }
            | Self::SetBlockParam { .. }
            | Self::SetInstanceVariable { .. }
            | Self::SetClassVariable { .. }
            | Self::SetGlobal { .. }
            | Self::SetConstant { .. }
            | Self::SetSpecial { .. } => 0,

            // Reported as 0 even though the popped value transfers to the
            // caller; preserved verbatim from the reference engine.
            Self::Leave => 0,
            Self::Jump { .. }
            | Self::BranchIf { .. }
            | Self::BranchUnless { .. }
            | Self::BranchNil { .. }
            | Self::Nop
            | Self::Throw { .. } => 0,

            Self::CheckMatch { .. } => 1,
            // Reported as 2 even though execution pushes one boolean;
            // preserved verbatim from the reference engine.
            Self::CheckType { .. } => 2,
            Self::CheckKeyword { .. } => 1,
            Self::Defined { .. } => 1,

            Self::Send { .. }
            | Self::OptSendWithoutBlock { .. }
            | Self::InvokeBlock { .. }
            | Self::InvokeSuper { .. }
            | Self::DefineClass { .. }
            | Self::Once { .. } => 1,
            Self::DefineMethod { .. } | Self::DefineSMethod { .. } => 0,
        }
    }

    /// The primitive instruction this one is equivalent to. Identity for
    /// primitives; the relation converges in one step.
    #[must_use]
    pub fn canonical(&self) -> Insn {
        match self {
            Self::PutNil => Self::PutObject { object: Value::Nil },
            Self::PutObjectInt2Fix0 => Self::PutObject {
                object: Value::Integer(0),
            },
            Self::PutObjectInt2Fix1 => Self::PutObject {
                object: Value::Integer(1),
            },

            Self::GetLocalWc0 { index } => Self::GetLocal {
                index: *index,
                level: 0,
            },
            Self::GetLocalWc1 { index } => Self::GetLocal {
                index: *index,
                level: 1,
            },
            Self::SetLocalWc0 { index } => Self::SetLocal {
                index: *index,
                level: 0,
            },
            Self::SetLocalWc1 { index } => Self::SetLocal {
                index: *index,
                level: 1,
            },

            Self::OptPlus { calldata }
            | Self::OptMinus { calldata }
            | Self::OptMult { calldata }
            | Self::OptDiv { calldata }
            | Self::OptMod { calldata }
            | Self::OptAnd { calldata }
            | Self::OptOr { calldata }
            | Self::OptLtLt { calldata }
            | Self::OptLt { calldata }
            | Self::OptLe { calldata }
            | Self::OptGt { calldata }
            | Self::OptGe { calldata }
            | Self::OptEq { calldata }
            | Self::OptSucc { calldata }
            | Self::OptNot { calldata }
            | Self::OptLength { calldata }
            | Self::OptSize { calldata }
            | Self::OptEmptyP { calldata }
            | Self::OptNilP { calldata }
            | Self::OptRegexpMatch2 { calldata }
            | Self::OptAref { calldata }
            | Self::OptAset { calldata }
            | Self::ObjToString { calldata }
            | Self::OptSendWithoutBlock { calldata } => Self::Send {
                calldata: calldata.clone(),
                block_iseq: None,
            },

            other => other.clone(),
        }
    }

    /// Execute against a machine. Specialized variants run with the
    /// semantics of their canonical form.
    pub fn call(&self, vm: &mut Vm) -> VmResult<()> {
        match self {
            Self::Pop => ops::stack::pop(vm),
            Self::Dup => ops::stack::dup(vm),
            Self::DupN { count } => ops::stack::dupn(vm, *count),
            Self::Swap => ops::stack::swap(vm),
            Self::TopN { count } => ops::stack::topn(vm, *count),
            Self::SetN { count } => ops::stack::setn(vm, *count),
            Self::AdjustStack { count } => ops::stack::adjuststack(vm, *count),

            Self::PutNil => ops::literals::putnil(vm),
            Self::PutSelf => ops::literals::putself(vm),
            Self::PutObject { object } => ops::literals::putobject(vm, object),
            Self::PutString { string } => ops::literals::putstring(vm, string),
            Self::PutObjectInt2Fix0 => ops::literals::putobject(vm, &Value::Integer(0)),
            Self::PutObjectInt2Fix1 => ops::literals::putobject(vm, &Value::Integer(1)),
            Self::DupArray { array } => ops::literals::duparray(vm, array),
            Self::DupHash { hash } => ops::literals::duphash(vm, hash),
            Self::PutSpecialObject { kind } => ops::literals::putspecialobject(vm, *kind),

            Self::OptPlus { calldata }
            | Self::OptMinus { calldata }
            | Self::OptMult { calldata }
            | Self::OptDiv { calldata }
            | Self::OptMod { calldata }
            | Self::OptAnd { calldata }
            | Self::OptOr { calldata }
            | Self::OptLtLt { calldata }
            | Self::OptLt { calldata }
            | Self::OptLe { calldata }
            | Self::OptGt { calldata }
            | Self::OptGe { calldata }
            | Self::OptEq { calldata }
            | Self::OptRegexpMatch2 { calldata }
            | Self::OptAref { calldata } => ops::arithmetic::binary(vm, calldata),
            Self::OptAset { calldata } => ops::arithmetic::aset(vm, calldata),
            Self::OptNeq { eq_calldata, .. } => ops::arithmetic::neq(vm, eq_calldata),
            Self::OptSucc { calldata }
            | Self::OptNot { calldata }
            | Self::OptLength { calldata }
            | Self::OptSize { calldata }
            | Self::OptEmptyP { calldata }
            | Self::OptNilP { calldata } => ops::arithmetic::unary(vm, calldata),
            Self::OptArefWith { key, calldata } => ops::arithmetic::aref_with(vm, key, calldata),
            Self::OptAsetWith { key, calldata } => ops::arithmetic::aset_with(vm, key, calldata),
            Self::OptStrFreeze { string, .. } => ops::arithmetic::str_freeze(vm, string),
            Self::OptStrUMinus { string, .. } => ops::arithmetic::str_uminus(vm, string),
            Self::OptNewArrayMax { count } => ops::containers::newarray_max(vm, *count),
            Self::OptNewArrayMin { count } => ops::containers::newarray_min(vm, *count),
            Self::OptCaseDispatch { table, else_label } => {
                ops::control::case_dispatch(vm, table, else_label)
            }

            Self::ConcatStrings { count } => ops::strings::concatstrings(vm, *count),
            Self::AnyToString => ops::strings::anytostring(vm),
            Self::ObjToString { calldata } => ops::calls::send(vm, calldata, None),
            Self::Intern => ops::strings::intern_string(vm),
            Self::ToRegexp { options, count } => ops::strings::toregexp(vm, *options, *count),
            Self::NewRange { exclude_end } => ops::strings::newrange(vm, *exclude_end),

            Self::NewArray { count } => ops::containers::newarray(vm, *count),
            Self::NewArrayKwSplat { count } => ops::containers::newarraykwsplat(vm, *count),
            Self::NewHash { count } => ops::containers::newhash(vm, *count),
            Self::ConcatArray => ops::containers::concatarray(vm),
            Self::SplatArray { flag } => ops::containers::splatarray(vm, *flag),
            Self::ExpandArray { count, flags } => ops::containers::expandarray(vm, *count, *flags),

            Self::GetLocal { index, level } => ops::variables::getlocal(vm, *index, *level),
            Self::SetLocal { index, level } => ops::variables::setlocal(vm, *index, *level),
            Self::GetLocalWc0 { index } => ops::variables::getlocal(vm, *index, 0),
            Self::GetLocalWc1 { index } => ops::variables::getlocal(vm, *index, 1),
            Self::SetLocalWc0 { index } => ops::variables::setlocal(vm, *index, 0),
            Self::SetLocalWc1 { index } => ops::variables::setlocal(vm, *index, 1),
            Self::GetBlockParam { index, level } => {
                ops::variables::getblockparam(vm, *index, *level)
            }
            Self::GetBlockParamProxy { index, level } => {
                ops::variables::getblockparamproxy(vm, *index, *level)
            }
            Self::SetBlockParam { index, level } => {
                ops::variables::setblockparam(vm, *index, *level)
            }
            Self::GetInstanceVariable { name, .. } => {
                ops::variables::getinstancevariable(vm, name)
            }
            Self::SetInstanceVariable { name, .. } => {
                ops::variables::setinstancevariable(vm, name)
            }
            Self::GetClassVariable { name, .. } => ops::variables::getclassvariable(vm, name),
            Self::SetClassVariable { name, .. } => ops::variables::setclassvariable(vm, name),
            Self::GetGlobal { name } => ops::variables::getglobal(vm, name),
            Self::SetGlobal { name } => ops::variables::setglobal(vm, name),
            Self::GetConstant { name } => ops::variables::getconstant(vm, name),
            Self::SetConstant { name } => ops::variables::setconstant(vm, name),
            Self::OptGetConstantPath { names } => ops::variables::getconstant_path(vm, names),
            Self::GetSpecial { key, svar_type } => {
                ops::variables::getspecial(vm, *key, *svar_type)
            }
            Self::SetSpecial { key } => ops::variables::setspecial(vm, *key),

            Self::Jump { label } => ops::control::jump(vm, label),
            Self::BranchIf { label } => ops::control::branchif(vm, label),
            Self::BranchUnless { label } => ops::control::branchunless(vm, label),
            Self::BranchNil { label } => ops::control::branchnil(vm, label),
            Self::Leave => ops::control::leave(vm),
            Self::Nop => Ok(()),
            Self::Throw { tag } => ops::control::throw(vm, *tag),

            Self::CheckMatch { kind, array } => ops::pattern::checkmatch(vm, *kind, *array),
            Self::CheckType { kind } => ops::pattern::checktype(vm, *kind),
            Self::CheckKeyword {
                bits_index,
                keyword_index,
            } => ops::pattern::checkkeyword(vm, *bits_index, *keyword_index),
            Self::Defined {
                kind,
                name,
                message,
            } => ops::pattern::defined(vm, *kind, name, message),

            Self::Send {
                calldata,
                block_iseq,
            } => ops::calls::send(vm, calldata, block_iseq.as_ref()),
            Self::OptSendWithoutBlock { calldata } => ops::calls::send(vm, calldata, None),
            Self::InvokeBlock { calldata } => ops::calls::invokeblock(vm, calldata),
            Self::InvokeSuper {
                calldata,
                block_iseq,
            } => ops::calls::invokesuper(vm, calldata, block_iseq.as_ref()),
            Self::DefineClass { name, iseq, flags } => {
                ops::calls::defineclass(vm, name, iseq, *flags)
            }
            Self::DefineMethod { name, iseq } => ops::calls::definemethod(vm, name, iseq),
            Self::DefineSMethod { name, iseq } => ops::calls::definesmethod(vm, name, iseq),
            Self::Once { iseq, cache } => ops::calls::once(vm, iseq, cache),
        }
    }
}

// =============================================================================
// Serialization
// =============================================================================

fn calldata_to_a(calldata: &CallData) -> Value {
    let mut pairs = vec![
        (
            Value::symbol("mid"),
            Value::Symbol(calldata.method().clone()),
        ),
        (
            Value::symbol("flag"),
            Value::Integer(i64::from(calldata.flags())),
        ),
        (
            Value::symbol("orig_argc"),
            Value::Integer(i64::from(calldata.argc())),
        ),
    ];
    if let Some(kw) = calldata.kw_arg() {
        pairs.push((
            Value::symbol("kw_arg"),
            Value::array(kw.iter().map(|s| Value::Symbol(s.clone())).collect()),
        ));
    }
    Value::hash(pairs)
}

fn calldata_from_a(value: &Value) -> Result<CallData, GarnetError> {
    let Value::Hash(map) = value else {
        return Err(GarnetError::type_error("calldata must serialize as a hash"));
    };
    let map = map.borrow();
    let method = map
        .get(&Value::symbol("mid"))
        .and_then(Value::as_symbol)
        .ok_or_else(|| GarnetError::type_error("calldata missing mid"))?;
    let flags = map
        .get(&Value::symbol("flag"))
        .and_then(Value::as_integer)
        .ok_or_else(|| GarnetError::type_error("calldata missing flag"))?;
    let argc = map
        .get(&Value::symbol("orig_argc"))
        .and_then(Value::as_integer)
        .ok_or_else(|| GarnetError::type_error("calldata missing orig_argc"))?;
    let kw_arg = match map.get(&Value::symbol("kw_arg")) {
        None | Some(Value::Nil) => None,
        Some(Value::Array(names)) => Some(
            names
                .borrow()
                .iter()
                .map(|n| {
                    n.as_symbol()
                        .ok_or_else(|| GarnetError::type_error("kw_arg name must be a symbol"))
                })
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Some(_) => return Err(GarnetError::type_error("kw_arg must be an array")),
    };
    Ok(CallData::new(method, argc as u16, flags as u16, kw_arg))
}

fn label_to_a(label: &Label) -> Value {
    Value::symbol(label.name())
}

/// Serialize a cross-level local reference through the owning table.
fn local_to_a(iseq: &Rc<Iseq>, index: usize, level: usize) -> Value {
    let offset = iseq
        .table_at_level(level)
        .map_or(index, |owner| owner.local_table().offset(index));
    Value::Integer(offset as i64)
}

fn local_from_a(iseq: &Rc<Iseq>, offset: i64, level: usize) -> usize {
    iseq.table_at_level(level)
        .map_or(offset as usize, |owner| {
            owner.local_table().index_for_offset(offset as usize)
        })
}

impl Insn {
    /// Serialize to the tagged tuple form. Embedded iseqs recurse; local
    /// references go through the owning table's offset mapping.
    #[must_use]
    pub fn to_a(&self, iseq: &Rc<Iseq>) -> Value {
        let tag = Value::symbol(self.name());
        let operands: Vec<Value> = match self {
            Self::Pop
            | Self::Dup
            | Self::Swap
            | Self::PutNil
            | Self::PutSelf
            | Self::PutObjectInt2Fix0
            | Self::PutObjectInt2Fix1
            | Self::AnyToString
            | Self::Intern
            | Self::ConcatArray
            | Self::Leave
            | Self::Nop => vec![],

            Self::DupN { count }
            | Self::TopN { count }
            | Self::SetN { count }
            | Self::AdjustStack { count }
            | Self::ConcatStrings { count }
            | Self::NewArray { count }
            | Self::NewArrayKwSplat { count }
            | Self::NewHash { count }
            | Self::OptNewArrayMax { count }
            | Self::OptNewArrayMin { count } => vec![Value::Integer(*count as i64)],

            Self::PutObject { object } => vec![object.clone()],
            Self::PutString { string } => vec![Value::string(string.clone())],
            Self::DupArray { array } => vec![array.clone()],
            Self::DupHash { hash } => vec![hash.clone()],
            Self::PutSpecialObject { kind } => vec![Value::Integer(*kind as i64)],

            Self::OptPlus { calldata }
            | Self::OptMinus { calldata }
            | Self::OptMult { calldata }
            | Self::OptDiv { calldata }
            | Self::OptMod { calldata }
            | Self::OptAnd { calldata }
            | Self::OptOr { calldata }
            | Self::OptLtLt { calldata }
            | Self::OptLt { calldata }
            | Self::OptLe { calldata }
            | Self::OptGt { calldata }
            | Self::OptGe { calldata }
            | Self::OptEq { calldata }
            | Self::OptSucc { calldata }
            | Self::OptNot { calldata }
            | Self::OptLength { calldata }
            | Self::OptSize { calldata }
            | Self::OptEmptyP { calldata }
            | Self::OptNilP { calldata }
            | Self::OptRegexpMatch2 { calldata }
            | Self::OptAref { calldata }
            | Self::OptAset { calldata }
            | Self::ObjToString { calldata }
            | Self::OptSendWithoutBlock { calldata }
            | Self::InvokeBlock { calldata } => vec![calldata_to_a(calldata)],

            Self::OptNeq {
                eq_calldata,
                neq_calldata,
            } => vec![calldata_to_a(eq_calldata), calldata_to_a(neq_calldata)],

            Self::OptArefWith { key, calldata } | Self::OptAsetWith { key, calldata } => {
                vec![Value::frozen_string(key.clone()), calldata_to_a(calldata)]
            }
            Self::OptStrFreeze { string, calldata } | Self::OptStrUMinus { string, calldata } => {
                vec![
                    Value::frozen_string(string.clone()),
                    calldata_to_a(calldata),
                ]
            }

            Self::OptCaseDispatch { table, else_label } => {
                let pairs = table
                    .iter()
                    .map(|(key, label)| (key.clone(), label_to_a(label)))
                    .collect();
                vec![Value::hash(pairs), label_to_a(else_label)]
            }

            Self::ToRegexp { options, count } => vec![
                Value::Integer(i64::from(*options)),
                Value::Integer(*count as i64),
            ],
            Self::NewRange { exclude_end } => {
                vec![Value::Integer(i64::from(*exclude_end))]
            }
            Self::SplatArray { flag } => vec![Value::Bool(*flag)],
            Self::ExpandArray { count, flags } => vec![
                Value::Integer(*count as i64),
                Value::Integer(i64::from(*flags)),
            ],

            Self::GetLocal { index, level } | Self::SetLocal { index, level } => {
                vec![
                    local_to_a(iseq, *index, *level),
                    Value::Integer(*level as i64),
                ]
            }
            Self::GetLocalWc0 { index } | Self::SetLocalWc0 { index } => {
                vec![local_to_a(iseq, *index, 0)]
            }
            Self::GetLocalWc1 { index } | Self::SetLocalWc1 { index } => {
                vec![local_to_a(iseq, *index, 1)]
            }
            Self::GetBlockParam { index, level }
            | Self::GetBlockParamProxy { index, level }
            | Self::SetBlockParam { index, level } => {
                vec![
                    local_to_a(iseq, *index, *level),
                    Value::Integer(*level as i64),
                ]
            }

            Self::GetInstanceVariable { name, cache }
            | Self::SetInstanceVariable { name, cache } => {
                vec![
                    Value::Symbol(name.clone()),
                    Value::Integer(*cache as i64),
                ]
            }
            Self::GetClassVariable { name, cache } | Self::SetClassVariable { name, cache } => {
                let mut operands = vec![Value::Symbol(name.clone())];
                if let Some(cache) = cache {
                    operands.push(Value::Integer(*cache as i64));
                }
                operands
            }
            Self::GetGlobal { name }
            | Self::SetGlobal { name }
            | Self::GetConstant { name }
            | Self::SetConstant { name } => vec![Value::Symbol(name.clone())],
            Self::OptGetConstantPath { names } => {
                vec![Value::array(
                    names.iter().map(|n| Value::Symbol(n.clone())).collect(),
                )]
            }
            Self::GetSpecial { key, svar_type } => vec![
                Value::Integer(*key as i64),
                Value::Integer(*svar_type as i64),
            ],
            Self::SetSpecial { key } => vec![Value::Integer(*key as i64)],

            Self::Jump { label }
            | Self::BranchIf { label }
            | Self::BranchUnless { label }
            | Self::BranchNil { label } => vec![label_to_a(label)],
            Self::Throw { tag } => vec![Value::Integer(*tag as i64)],

            Self::CheckMatch { kind, array } => {
                let operand = *kind as i64 | if *array { CHECKMATCH_ARRAY } else { 0 };
                vec![Value::Integer(operand)]
            }
            Self::CheckType { kind } => vec![Value::Integer(*kind as i64)],
            Self::CheckKeyword {
                bits_index,
                keyword_index,
            } => vec![
                local_to_a(iseq, *bits_index, 0),
                Value::Integer(*keyword_index as i64),
            ],
            Self::Defined {
                kind,
                name,
                message,
            } => vec![
                Value::Integer(*kind as i64),
                name.clone(),
                message.clone(),
            ],

            Self::Send {
                calldata,
                block_iseq,
            }
            | Self::InvokeSuper {
                calldata,
                block_iseq,
            } => vec![
                calldata_to_a(calldata),
                block_iseq.as_ref().map_or(Value::Nil, |body| body.to_a()),
            ],
            Self::DefineClass { name, iseq: body, flags } => vec![
                Value::Symbol(name.clone()),
                body.to_a(),
                Value::Integer(i64::from(*flags)),
            ],
            Self::DefineMethod { name, iseq: body } | Self::DefineSMethod { name, iseq: body } => {
                vec![Value::Symbol(name.clone()), body.to_a()]
            }
            Self::Once { iseq: body, .. } => {
                // The latch serializes as an inline-storage placeholder.
                vec![body.to_a(), Value::Integer(0)]
            }
        };

        let mut tuple = vec![tag];
        tuple.extend(operands);
        Value::array(tuple)
    }

    /// Deserialize from the tagged tuple form, resolving local offsets
    /// and labels against `iseq`.
    pub fn from_a(serialized: &Value, iseq: &Rc<Iseq>) -> Result<Insn, GarnetError> {
        let Value::Array(tuple) = serialized else {
            return Err(GarnetError::type_error("instruction must be an array"));
        };
        let tuple = tuple.borrow();
        let tag = tuple
            .first()
            .and_then(Value::as_symbol)
            .ok_or_else(|| GarnetError::type_error("instruction missing tag"))?;

        let operand = |i: usize| -> Result<Value, GarnetError> {
            tuple
                .get(i)
                .cloned()
                .ok_or_else(|| GarnetError::argument(format!("{tag} missing operand {i}")))
        };
        let int_operand = |i: usize| -> Result<i64, GarnetError> {
            operand(i)?
                .as_integer()
                .ok_or_else(|| GarnetError::type_error(format!("{tag} operand {i} must be an integer")))
        };
        let usize_operand = |i: usize| -> Result<usize, GarnetError> {
            let n = int_operand(i)?;
            usize::try_from(n)
                .map_err(|_| GarnetError::type_error(format!("{tag} operand {i} must be non-negative")))
        };
        let symbol_operand = |i: usize| -> Result<Symbol, GarnetError> {
            operand(i)?
                .as_symbol()
                .ok_or_else(|| GarnetError::type_error(format!("{tag} operand {i} must be a symbol")))
        };
        let string_operand = |i: usize| -> Result<String, GarnetError> {
            operand(i)?
                .as_string()
                .ok_or_else(|| GarnetError::type_error(format!("{tag} operand {i} must be a string")))
        };
        let label_operand = |i: usize| -> Result<Label, GarnetError> {
            symbol_operand(i).map(|s| Label::named(s.as_str()))
        };
        let calldata_operand = |i: usize| -> Result<CallData, GarnetError> {
            calldata_from_a(&operand(i)?)
        };
        let iseq_operand = |i: usize| -> Result<Rc<Iseq>, GarnetError> {
            Iseq::from_a_with_parent(&operand(i)?, Some(iseq))
        };
        let local_operand = |i: usize, level: usize| -> Result<usize, GarnetError> {
            Ok(local_from_a(iseq, int_operand(i)?, level))
        };

        let insn = match tag.as_str() {
            "pop" => Self::Pop,
            "dup" => Self::Dup,
            "dupn" => Self::DupN {
                count: usize_operand(1)?,
            },
            "swap" => Self::Swap,
            "topn" => Self::TopN {
                count: usize_operand(1)?,
            },
            "setn" => Self::SetN {
                count: usize_operand(1)?,
            },
            "adjuststack" => Self::AdjustStack {
                count: usize_operand(1)?,
            },

            "putnil" => Self::PutNil,
            "putself" => Self::PutSelf,
            "putobject" => Self::PutObject {
                object: operand(1)?,
            },
            "putstring" => Self::PutString {
                string: string_operand(1)?,
            },
            "putobject_INT2FIX_0_" => Self::PutObjectInt2Fix0,
            "putobject_INT2FIX_1_" => Self::PutObjectInt2Fix1,
            "duparray" => Self::DupArray { array: operand(1)? },
            "duphash" => Self::DupHash { hash: operand(1)? },
            "putspecialobject" => Self::PutSpecialObject {
                kind: SpecialObject::from_operand(int_operand(1)?)
                    .ok_or_else(|| GarnetError::argument("bad putspecialobject operand"))?,
            },

            "opt_plus" => Self::OptPlus { calldata: calldata_operand(1)? },
            "opt_minus" => Self::OptMinus { calldata: calldata_operand(1)? },
            "opt_mult" => Self::OptMult { calldata: calldata_operand(1)? },
            "opt_div" => Self::OptDiv { calldata: calldata_operand(1)? },
            "opt_mod" => Self::OptMod { calldata: calldata_operand(1)? },
            "opt_and" => Self::OptAnd { calldata: calldata_operand(1)? },
            "opt_or" => Self::OptOr { calldata: calldata_operand(1)? },
            "opt_ltlt" => Self::OptLtLt { calldata: calldata_operand(1)? },
            "opt_lt" => Self::OptLt { calldata: calldata_operand(1)? },
            "opt_le" => Self::OptLe { calldata: calldata_operand(1)? },
            "opt_gt" => Self::OptGt { calldata: calldata_operand(1)? },
            "opt_ge" => Self::OptGe { calldata: calldata_operand(1)? },
            "opt_eq" => Self::OptEq { calldata: calldata_operand(1)? },
            "opt_neq" => Self::OptNeq {
                eq_calldata: calldata_operand(1)?,
                neq_calldata: calldata_operand(2)?,
            },
            "opt_succ" => Self::OptSucc { calldata: calldata_operand(1)? },
            "opt_not" => Self::OptNot { calldata: calldata_operand(1)? },
            "opt_length" => Self::OptLength { calldata: calldata_operand(1)? },
            "opt_size" => Self::OptSize { calldata: calldata_operand(1)? },
            "opt_empty_p" => Self::OptEmptyP { calldata: calldata_operand(1)? },
            "opt_nil_p" => Self::OptNilP { calldata: calldata_operand(1)? },
            "opt_regexpmatch2" => Self::OptRegexpMatch2 { calldata: calldata_operand(1)? },
            "opt_aref" => Self::OptAref { calldata: calldata_operand(1)? },
            "opt_aset" => Self::OptAset { calldata: calldata_operand(1)? },
            "opt_aref_with" => Self::OptArefWith {
                key: string_operand(1)?,
                calldata: calldata_operand(2)?,
            },
            "opt_aset_with" => Self::OptAsetWith {
                key: string_operand(1)?,
                calldata: calldata_operand(2)?,
            },
            "opt_str_freeze" => Self::OptStrFreeze {
                string: string_operand(1)?,
                calldata: calldata_operand(2)?,
            },
            "opt_str_uminus" => Self::OptStrUMinus {
                string: string_operand(1)?,
                calldata: calldata_operand(2)?,
            },
            "opt_newarray_max" => Self::OptNewArrayMax {
                count: usize_operand(1)?,
            },
            "opt_newarray_min" => Self::OptNewArrayMin {
                count: usize_operand(1)?,
            },
            "opt_case_dispatch" => {
                let Value::Hash(map) = operand(1)? else {
                    return Err(GarnetError::type_error("dispatch table must be a hash"));
                };
                let table = map
                    .borrow()
                    .iter()
                    .map(|(key, label)| {
                        label
                            .as_symbol()
                            .map(|s| (key.clone(), Label::named(s.as_str())))
                            .ok_or_else(|| {
                                GarnetError::type_error("dispatch target must be a label symbol")
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Self::OptCaseDispatch {
                    table,
                    else_label: label_operand(2)?,
                }
            }

            "concatstrings" => Self::ConcatStrings {
                count: usize_operand(1)?,
            },
            "anytostring" => Self::AnyToString,
            "objtostring" => Self::ObjToString { calldata: calldata_operand(1)? },
            "intern" => Self::Intern,
            "toregexp" => Self::ToRegexp {
                options: int_operand(1)? as u8,
                count: usize_operand(2)?,
            },
            "newrange" => Self::NewRange {
                exclude_end: int_operand(1)? != 0,
            },

            "newarray" => Self::NewArray {
                count: usize_operand(1)?,
            },
            "newarraykwsplat" => Self::NewArrayKwSplat {
                count: usize_operand(1)?,
            },
            "newhash" => Self::NewHash {
                count: usize_operand(1)?,
            },
            "concatarray" => Self::ConcatArray,
            "splatarray" => Self::SplatArray {
                flag: operand(1)?.truthy(),
            },
            "expandarray" => Self::ExpandArray {
                count: usize_operand(1)?,
                flags: int_operand(2)? as u8,
            },

            "getlocal" => {
                let level = usize_operand(2)?;
                Self::GetLocal {
                    index: local_operand(1, level)?,
                    level,
                }
            }
            "setlocal" => {
                let level = usize_operand(2)?;
                Self::SetLocal {
                    index: local_operand(1, level)?,
                    level,
                }
            }
            "getlocal_WC_0" => Self::GetLocalWc0 {
                index: local_operand(1, 0)?,
            },
            "getlocal_WC_1" => Self::GetLocalWc1 {
                index: local_operand(1, 1)?,
            },
            "setlocal_WC_0" => Self::SetLocalWc0 {
                index: local_operand(1, 0)?,
            },
            "setlocal_WC_1" => Self::SetLocalWc1 {
                index: local_operand(1, 1)?,
            },
            "getblockparam" => {
                let level = usize_operand(2)?;
                Self::GetBlockParam {
                    index: local_operand(1, level)?,
                    level,
                }
            }
            "getblockparamproxy" => {
                let level = usize_operand(2)?;
                Self::GetBlockParamProxy {
                    index: local_operand(1, level)?,
                    level,
                }
            }
            "setblockparam" => {
                let level = usize_operand(2)?;
                Self::SetBlockParam {
                    index: local_operand(1, level)?,
                    level,
                }
            }

            "getinstancevariable" => Self::GetInstanceVariable {
                name: symbol_operand(1)?,
                cache: usize_operand(2)?,
            },
            "setinstancevariable" => Self::SetInstanceVariable {
                name: symbol_operand(1)?,
                cache: usize_operand(2)?,
            },
            "getclassvariable" => Self::GetClassVariable {
                name: symbol_operand(1)?,
                cache: match tuple.len() {
                    2 => None,
                    _ => Some(usize_operand(2)?),
                },
            },
            "setclassvariable" => Self::SetClassVariable {
                name: symbol_operand(1)?,
                cache: match tuple.len() {
                    2 => None,
                    _ => Some(usize_operand(2)?),
                },
            },
            "getglobal" => Self::GetGlobal {
                name: symbol_operand(1)?,
            },
            "setglobal" => Self::SetGlobal {
                name: symbol_operand(1)?,
            },
            "getconstant" => Self::GetConstant {
                name: symbol_operand(1)?,
            },
            "setconstant" => Self::SetConstant {
                name: symbol_operand(1)?,
            },
            "opt_getconstant_path" => {
                let Value::Array(names) = operand(1)? else {
                    return Err(GarnetError::type_error("constant path must be an array"));
                };
                let names = names
                    .borrow()
                    .iter()
                    .map(|n| {
                        n.as_symbol().ok_or_else(|| {
                            GarnetError::type_error("constant path segment must be a symbol")
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Self::OptGetConstantPath { names }
            }
            "getspecial" => Self::GetSpecial {
                key: usize_operand(1)?,
                svar_type: usize_operand(2)?,
            },
            "setspecial" => Self::SetSpecial {
                key: usize_operand(1)?,
            },

            "jump" => Self::Jump {
                label: label_operand(1)?,
            },
            "branchif" => Self::BranchIf {
                label: label_operand(1)?,
            },
            "branchunless" => Self::BranchUnless {
                label: label_operand(1)?,
            },
            "branchnil" => Self::BranchNil {
                label: label_operand(1)?,
            },
            "leave" => Self::Leave,
            "nop" => Self::Nop,
            "throw" => Self::Throw {
                tag: usize_operand(1)?,
            },

            "checkmatch" => {
                let operand = int_operand(1)?;
                Self::CheckMatch {
                    kind: CheckMatchKind::from_operand(operand)
                        .ok_or_else(|| GarnetError::argument("bad checkmatch operand"))?,
                    array: operand & CHECKMATCH_ARRAY != 0,
                }
            }
            "checktype" => Self::CheckType {
                kind: CheckTypeKind::from_operand(int_operand(1)?)
                    .ok_or_else(|| GarnetError::argument("bad checktype operand"))?,
            },
            "checkkeyword" => Self::CheckKeyword {
                bits_index: local_operand(1, 0)?,
                keyword_index: usize_operand(2)?,
            },
            "defined" => Self::Defined {
                kind: DefinedKind::from_operand(int_operand(1)?)
                    .ok_or_else(|| GarnetError::argument("bad defined operand"))?,
                name: operand(2)?,
                message: operand(3)?,
            },

            "send" => Self::Send {
                calldata: calldata_operand(1)?,
                block_iseq: match operand(2)? {
                    Value::Nil => None,
                    _ => Some(iseq_operand(2)?),
                },
            },
            "opt_send_without_block" => Self::OptSendWithoutBlock {
                calldata: calldata_operand(1)?,
            },
            "invokeblock" => Self::InvokeBlock {
                calldata: calldata_operand(1)?,
            },
            "invokesuper" => Self::InvokeSuper {
                calldata: calldata_operand(1)?,
                block_iseq: match operand(2)? {
                    Value::Nil => None,
                    _ => Some(iseq_operand(2)?),
                },
            },
            "defineclass" => Self::DefineClass {
                name: symbol_operand(1)?,
                iseq: iseq_operand(2)?,
                flags: int_operand(3)? as u32,
            },
            "definemethod" => Self::DefineMethod {
                name: symbol_operand(1)?,
                iseq: iseq_operand(2)?,
            },
            "definesmethod" => Self::DefineSMethod {
                name: symbol_operand(1)?,
                iseq: iseq_operand(2)?,
            },
            "once" => Self::Once {
                iseq: iseq_operand(1)?,
                cache: OnceCache::new(),
            },

            other => {
                return Err(GarnetError::argument(format!(
                    "unknown instruction tag :{other}"
                )))
            }
        };
        Ok(insn)
    }

    /// Render one line of disassembly through the formatter. Embedded
    /// iseqs are enqueued so the formatter can emit them after the
    /// parent.
    #[must_use]
    pub fn disasm(&self, fmt: &mut Formatter) -> String {
        let name = self.name();
        match self {
            Self::Pop
            | Self::Dup
            | Self::Swap
            | Self::PutNil
            | Self::PutSelf
            | Self::PutObjectInt2Fix0
            | Self::PutObjectInt2Fix1
            | Self::AnyToString
            | Self::Intern
            | Self::ConcatArray
            | Self::Leave
            | Self::Nop => name.to_owned(),

            Self::DupN { count }
            | Self::TopN { count }
            | Self::SetN { count }
            | Self::AdjustStack { count }
            | Self::ConcatStrings { count }
            | Self::NewArray { count }
            | Self::NewArrayKwSplat { count }
            | Self::NewHash { count }
            | Self::OptNewArrayMax { count }
            | Self::OptNewArrayMin { count } => format!("{name} {count}"),

            Self::PutObject { object } => format!("{name} {}", fmt.object(object)),
            Self::PutString { string } => format!("{name} {string:?}"),
            Self::DupArray { array } => format!("{name} {}", fmt.object(array)),
            Self::DupHash { hash } => format!("{name} {}", fmt.object(hash)),
            Self::PutSpecialObject { kind } => format!("{name} {}", *kind as i64),

            Self::OptPlus { calldata }
            | Self::OptMinus { calldata }
            | Self::OptMult { calldata }
            | Self::OptDiv { calldata }
            | Self::OptMod { calldata }
            | Self::OptAnd { calldata }
            | Self::OptOr { calldata }
            | Self::OptLtLt { calldata }
            | Self::OptLt { calldata }
            | Self::OptLe { calldata }
            | Self::OptGt { calldata }
            | Self::OptGe { calldata }
            | Self::OptEq { calldata }
            | Self::OptSucc { calldata }
            | Self::OptNot { calldata }
            | Self::OptLength { calldata }
            | Self::OptSize { calldata }
            | Self::OptEmptyP { calldata }
            | Self::OptNilP { calldata }
            | Self::OptRegexpMatch2 { calldata }
            | Self::OptAref { calldata }
            | Self::OptAset { calldata }
            | Self::ObjToString { calldata }
            | Self::OptSendWithoutBlock { calldata }
            | Self::InvokeBlock { calldata } => {
                format!("{name} {}", fmt.calldata(calldata))
            }

            Self::OptNeq {
                eq_calldata,
                neq_calldata,
            } => format!(
                "{name} {}, {}",
                fmt.calldata(eq_calldata),
                fmt.calldata(neq_calldata)
            ),

            Self::OptArefWith { key, calldata } | Self::OptAsetWith { key, calldata } => {
                format!("{name} {key:?}, {}", fmt.calldata(calldata))
            }
            Self::OptStrFreeze { string, calldata } | Self::OptStrUMinus { string, calldata } => {
                format!("{name} {string:?}, {}", fmt.calldata(calldata))
            }

            Self::OptCaseDispatch { table, else_label } => {
                let entries: Vec<String> = table
                    .iter()
                    .map(|(key, label)| format!("{} => {}", fmt.object(key), fmt.label(label)))
                    .collect();
                format!(
                    "{name} <cdhash: {}>, {}",
                    entries.join(", "),
                    fmt.label(else_label)
                )
            }

            Self::ToRegexp { options, count } => format!("{name} {options}, {count}"),
            Self::NewRange { exclude_end } => format!("{name} {}", i64::from(*exclude_end)),
            Self::SplatArray { flag } => format!("{name} {flag}"),
            Self::ExpandArray { count, flags } => format!("{name} {count}, {flags}"),

            Self::GetLocal { index, level } | Self::SetLocal { index, level } => {
                format!("{name} {}, {level}", fmt.local(*index, *level))
            }
            Self::GetLocalWc0 { index } | Self::SetLocalWc0 { index } => {
                format!("{name} {}", fmt.local(*index, 0))
            }
            Self::GetLocalWc1 { index } | Self::SetLocalWc1 { index } => {
                format!("{name} {}", fmt.local(*index, 1))
            }
            Self::GetBlockParam { index, level }
            | Self::GetBlockParamProxy { index, level }
            | Self::SetBlockParam { index, level } => {
                format!("{name} {}, {level}", fmt.local(*index, *level))
            }

            Self::GetInstanceVariable { name: ivar, cache }
            | Self::SetInstanceVariable { name: ivar, cache } => {
                format!("{name} {ivar}, {}", fmt.inline_storage(*cache))
            }
            Self::GetClassVariable { name: cvar, cache }
            | Self::SetClassVariable { name: cvar, cache } => match cache {
                Some(cache) => format!("{name} {cvar}, {}", fmt.inline_storage(*cache)),
                None => format!("{name} {cvar}"),
            },
            Self::GetGlobal { name: gvar } | Self::SetGlobal { name: gvar } => {
                format!("{name} {gvar}")
            }
            Self::GetConstant { name: const_name } | Self::SetConstant { name: const_name } => {
                format!("{name} {const_name}")
            }
            Self::OptGetConstantPath { names } => {
                let path: Vec<&str> = names.iter().map(Symbol::as_str).collect();
                format!("{name} {}", path.join("::"))
            }
            Self::GetSpecial { key, svar_type } => format!("{name} {key}, {svar_type}"),
            Self::SetSpecial { key } => format!("{name} {key}"),

            Self::Jump { label }
            | Self::BranchIf { label }
            | Self::BranchUnless { label }
            | Self::BranchNil { label } => format!("{name} {}", fmt.label(label)),
            Self::Throw { tag } => format!("{name} {tag}"),

            Self::CheckMatch { kind, array } => {
                let operand = *kind as i64 | if *array { CHECKMATCH_ARRAY } else { 0 };
                format!("{name} {operand}")
            }
            Self::CheckType { kind } => format!("{name} {}", *kind as i64),
            Self::CheckKeyword {
                bits_index,
                keyword_index,
            } => format!("{name} {bits_index}, {keyword_index}"),
            Self::Defined {
                kind,
                name: subject,
                message,
            } => format!(
                "{name} {}, {}, {}",
                *kind as i64,
                fmt.object(subject),
                fmt.object(message)
            ),

            Self::Send {
                calldata,
                block_iseq,
            } => {
                let block = match block_iseq {
                    Some(block_iseq) => {
                        fmt.enqueue(Rc::clone(block_iseq));
                        block_iseq.name.clone()
                    }
                    None => "nil".to_owned(),
                };
                format!("{name} {}, {block}", fmt.calldata(calldata))
            }
            Self::InvokeSuper {
                calldata,
                block_iseq,
            } => {
                let block = match block_iseq {
                    Some(block_iseq) => {
                        fmt.enqueue(Rc::clone(block_iseq));
                        block_iseq.name.clone()
                    }
                    None => "nil".to_owned(),
                };
                format!("{name} {}, {block}", fmt.calldata(calldata))
            }
            Self::DefineClass { name: class, iseq: body, flags } => {
                fmt.enqueue(Rc::clone(body));
                format!("{name} :{class}, {}, {flags}", body.name)
            }
            Self::DefineMethod { name: method, iseq: body }
            | Self::DefineSMethod { name: method, iseq: body } => {
                fmt.enqueue(Rc::clone(body));
                format!("{name} :{method}, {}", body.name)
            }
            Self::Once { iseq: body, .. } => {
                fmt.enqueue(Rc::clone(body));
                format!("{name} {}, {}", body.name, fmt.inline_storage(0))
            }
        }
    }
}

/// Shorthand constructors for the descriptor-carrying specializations,
/// used heavily by assembly in tests and by the canonicalization tests.
impl Insn {
    /// `opt_plus` with a standard binary call site.
    #[must_use]
    pub fn opt_plus() -> Self {
        Self::OptPlus {
            calldata: CallData::simple(intern("+"), 1),
        }
    }

    /// `opt_minus` with a standard binary call site.
    #[must_use]
    pub fn opt_minus() -> Self {
        Self::OptMinus {
            calldata: CallData::simple(intern("-"), 1),
        }
    }

    /// `opt_mult` with a standard binary call site.
    #[must_use]
    pub fn opt_mult() -> Self {
        Self::OptMult {
            calldata: CallData::simple(intern("*"), 1),
        }
    }

    /// `opt_lt` with a standard binary call site.
    #[must_use]
    pub fn opt_lt() -> Self {
        Self::OptLt {
            calldata: CallData::simple(intern("<"), 1),
        }
    }

    /// `opt_eq` with a standard binary call site.
    #[must_use]
    pub fn opt_eq() -> Self {
        Self::OptEq {
            calldata: CallData::simple(intern("=="), 1),
        }
    }

    /// `opt_neq` with the standard pair of call sites.
    #[must_use]
    pub fn opt_neq() -> Self {
        Self::OptNeq {
            eq_calldata: CallData::simple(intern("=="), 1),
            neq_calldata: CallData::simple(intern("!="), 1),
        }
    }

    /// `objtostring` with the standard `to_s` call site.
    #[must_use]
    pub fn objtostring() -> Self {
        Self::ObjToString {
            calldata: CallData::simple(intern("to_s"), 0),
        }
    }

    /// `opt_send_without_block` for a simple receiver call.
    #[must_use]
    pub fn send_simple(method: &str, argc: u16) -> Self {
        Self::OptSendWithoutBlock {
            calldata: CallData::simple(intern(method), argc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iseq::IseqKind;

    fn sample_catalog() -> Vec<Insn> {
        vec![
            Insn::Pop,
            Insn::Dup,
            Insn::DupN { count: 2 },
            Insn::Swap,
            Insn::TopN { count: 1 },
            Insn::SetN { count: 2 },
            Insn::AdjustStack { count: 3 },
            Insn::PutNil,
            Insn::PutSelf,
            Insn::PutObject {
                object: Value::Integer(7),
            },
            Insn::PutString {
                string: "hi".to_owned(),
            },
            Insn::PutObjectInt2Fix0,
            Insn::PutObjectInt2Fix1,
            Insn::PutSpecialObject {
                kind: SpecialObject::VmCore,
            },
            Insn::opt_plus(),
            Insn::opt_neq(),
            Insn::OptNewArrayMax { count: 3 },
            Insn::ConcatStrings { count: 2 },
            Insn::AnyToString,
            Insn::objtostring(),
            Insn::Intern,
            Insn::ToRegexp {
                options: 0,
                count: 1,
            },
            Insn::NewRange { exclude_end: true },
            Insn::NewArray { count: 2 },
            Insn::NewHash { count: 2 },
            Insn::ConcatArray,
            Insn::SplatArray { flag: true },
            Insn::ExpandArray { count: 2, flags: 1 },
            Insn::GetLocalWc0 { index: 0 },
            Insn::SetLocalWc0 { index: 0 },
            Insn::GetGlobal {
                name: intern("$debug"),
            },
            Insn::GetConstant {
                name: intern("Object"),
            },
            Insn::GetSpecial {
                key: 1,
                svar_type: 0,
            },
            Insn::Leave,
            Insn::Nop,
            Insn::Throw { tag: 2 },
            Insn::CheckMatch {
                kind: CheckMatchKind::When,
                array: false,
            },
            Insn::CheckType {
                kind: CheckTypeKind::String,
            },
            Insn::CheckKeyword {
                bits_index: 0,
                keyword_index: 1,
            },
            Insn::send_simple("length", 0),
        ]
    }

    #[test]
    fn test_length_discipline() {
        // length == 1 + number of operands declared by the constructor.
        assert_eq!(Insn::Pop.length(), 1);
        assert_eq!(Insn::DupN { count: 2 }.length(), 2);
        assert_eq!(Insn::opt_plus().length(), 2);
        assert_eq!(Insn::opt_neq().length(), 3);
        assert_eq!(
            Insn::GetLocal { index: 0, level: 1 }.length(),
            3
        );
        assert_eq!(Insn::GetLocalWc0 { index: 0 }.length(), 2);
        assert_eq!(
            Insn::GetClassVariable {
                name: intern("@@x"),
                cache: Some(0),
            }
            .length(),
            3
        );
        assert_eq!(
            Insn::GetClassVariable {
                name: intern("@@x"),
                cache: None,
            }
            .length(),
            2
        );
        let iseq = Iseq::new("x", IseqKind::Method);
        assert_eq!(
            Insn::Send {
                calldata: CallData::simple(intern("m"), 0),
                block_iseq: Some(iseq),
            }
            .length(),
            3
        );
        assert_eq!(
            Insn::Defined {
                kind: DefinedKind::Nil,
                name: Value::Nil,
                message: Value::string("expression"),
            }
            .length(),
            4
        );
    }

    #[test]
    fn test_send_pops_count_arguments() {
        let plain = Insn::send_simple("m", 2);
        assert_eq!(plain.pops(), 3);

        let kw = Insn::Send {
            calldata: CallData::new(
                intern("m"),
                1,
                garnet_core::calldata::CALL_KWARG,
                Some(vec![intern("a"), intern("b")]),
            ),
            block_iseq: None,
        };
        assert_eq!(kw.pops(), 4);

        let blockarg = Insn::Send {
            calldata: CallData::new(
                intern("m"),
                0,
                garnet_core::calldata::CALL_ARGS_BLOCKARG,
                None,
            ),
            block_iseq: None,
        };
        assert_eq!(blockarg.pops(), 2);
    }

    #[test]
    fn test_documented_anomalies() {
        // checktype reports two pushes; leave reports zero.
        let checktype = Insn::CheckType {
            kind: CheckTypeKind::String,
        };
        assert_eq!(checktype.pops(), 1);
        assert_eq!(checktype.pushes(), 2);
        assert_eq!(Insn::Leave.pops(), 1);
        assert_eq!(Insn::Leave.pushes(), 0);
    }

    #[test]
    fn test_canonical_rewrites() {
        assert_eq!(
            Insn::PutNil.canonical(),
            Insn::PutObject { object: Value::Nil }
        );
        assert_eq!(
            Insn::PutObjectInt2Fix0.canonical(),
            Insn::PutObject {
                object: Value::Integer(0)
            }
        );
        assert_eq!(
            Insn::GetLocalWc1 { index: 2 }.canonical(),
            Insn::GetLocal { index: 2, level: 1 }
        );
        let plus = Insn::opt_plus();
        let Insn::Send {
            calldata,
            block_iseq,
        } = plus.canonical()
        else {
            panic!("opt_plus must canonicalize to send");
        };
        assert_eq!(calldata.method().as_str(), "+");
        assert!(block_iseq.is_none());
    }

    #[test]
    fn test_canonical_idempotence() {
        for insn in sample_catalog() {
            assert_eq!(
                insn.canonical().canonical(),
                insn.canonical(),
                "canonical not idempotent for {}",
                insn.name()
            );
        }
    }

    #[test]
    fn test_canonical_preserves_stack_effect() {
        for insn in sample_catalog() {
            let canonical = insn.canonical();
            if canonical == insn {
                continue;
            }
            assert_eq!(insn.pops(), canonical.pops(), "pops differ for {}", insn.name());
            assert_eq!(
                insn.pushes(),
                canonical.pushes(),
                "pushes differ for {}",
                insn.name()
            );
        }
    }

    #[test]
    fn test_once_cache_latch() {
        let cache = OnceCache::new();
        assert_eq!(cache.get(), None);
        cache.set(Value::Integer(5));
        cache.set(Value::Integer(9));
        assert_eq!(cache.get(), Some(Value::Integer(5)));
    }

    #[test]
    fn test_serialization_round_trip_per_insn() {
        let iseq = Iseq::new("<test>", IseqKind::Top);
        iseq.local_table_mut().add(intern("a"));
        for insn in sample_catalog() {
            let serialized = insn.to_a(&iseq);
            let parsed = Insn::from_a(&serialized, &iseq).unwrap_or_else(|e| {
                panic!("{} failed to parse: {e}", insn.name());
            });
            assert_eq!(parsed, insn, "round trip changed {}", insn.name());
        }
    }

    #[test]
    fn test_serialized_tag_is_lowercase_symbol() {
        let iseq = Iseq::new("<test>", IseqKind::Top);
        let serialized = Insn::opt_plus().to_a(&iseq);
        let Value::Array(tuple) = serialized else {
            panic!("expected tuple");
        };
        assert_eq!(tuple.borrow()[0], Value::symbol("opt_plus"));
    }

    #[test]
    fn test_local_serialization_uses_offsets() {
        let iseq = Iseq::new("<test>", IseqKind::Top);
        iseq.local_table_mut().add(intern("a"));
        iseq.local_table_mut().add(intern("b"));
        let serialized = Insn::GetLocalWc0 { index: 1 }.to_a(&iseq);
        let Value::Array(tuple) = serialized else {
            panic!("expected tuple");
        };
        // Second of two locals serializes at offset 3.
        assert_eq!(tuple.borrow()[1], Value::Integer(3));
    }
}
