//! Call-site descriptors.
//!
//! Every call-like instruction carries a [`CallData`]: an immutable record
//! of what the compiler knew about the call site. The descriptor is created
//! once (by the compiler or the deserializer) and never mutated; the
//! instruction stream may share one descriptor across re-serializations.

use crate::intern::Symbol;
use std::fmt;

/// Flag bit: the final positional argument is a splat to expand.
pub const CALL_ARGS_SPLAT: u16 = 1 << 0;
/// Flag bit: a block is passed as a trailing `&arg` value.
pub const CALL_ARGS_BLOCKARG: u16 = 1 << 1;
/// Flag bit: function-style call (no explicit receiver).
pub const CALL_FCALL: u16 = 1 << 2;
/// Flag bit: call that could also be a variable reference.
pub const CALL_VCALL: u16 = 1 << 3;
/// Flag bit: arguments are simple (no splat/block/keywords).
pub const CALL_ARGS_SIMPLE: u16 = 1 << 4;
/// Flag bit: the call site carries a block instruction sequence.
pub const CALL_BLOCKISEQ: u16 = 1 << 5;
/// Flag bit: keyword arguments are present.
pub const CALL_KWARG: u16 = 1 << 6;
/// Flag bit: a keyword splat (`**h`) is present.
pub const CALL_KW_SPLAT: u16 = 1 << 7;
/// Flag bit: the call is in tail position.
pub const CALL_TAILCALL: u16 = 1 << 8;
/// Flag bit: explicit super call.
pub const CALL_SUPER: u16 = 1 << 9;
/// Flag bit: zero-arity super call forwarding the method's arguments.
pub const CALL_ZSUPER: u16 = 1 << 10;
/// Flag bit: call site eligible for send optimization.
pub const CALL_OPT_SEND: u16 = 1 << 11;
/// Flag bit: the keyword splat hash may be mutated in place.
pub const CALL_KW_SPLAT_MUT: u16 = 1 << 12;

/// Printable names for each flag bit, in bit order. Used by disassembly.
const FLAG_NAMES: [&str; 13] = [
    "ARGS_SPLAT",
    "ARGS_BLOCKARG",
    "FCALL",
    "VCALL",
    "ARGS_SIMPLE",
    "BLOCKISEQ",
    "KWARG",
    "KW_SPLAT",
    "TAILCALL",
    "SUPER",
    "ZSUPER",
    "OPT_SEND",
    "KW_SPLAT_MUT",
];

/// An immutable descriptor of a call site.
///
/// Carries the selector, the positional argument count, the flag set, and
/// (for calls with literal keywords) the keyword names in call order. The
/// keyword *values* live on the stack; only the names are static.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallData {
    method: Symbol,
    argc: u16,
    flags: u16,
    kw_arg: Option<Vec<Symbol>>,
}

impl CallData {
    /// Create a descriptor with explicit flags and keyword names.
    #[must_use]
    pub fn new(method: Symbol, argc: u16, flags: u16, kw_arg: Option<Vec<Symbol>>) -> Self {
        Self {
            method,
            argc,
            flags,
            kw_arg,
        }
    }

    /// Create a descriptor for a simple receiver call (`recv.m(a, b)`).
    #[must_use]
    pub fn simple(method: Symbol, argc: u16) -> Self {
        Self::new(method, argc, CALL_ARGS_SIMPLE, None)
    }

    /// Create a descriptor for a function-style call (`m(a, b)`).
    #[must_use]
    pub fn fcall(method: Symbol, argc: u16) -> Self {
        Self::new(method, argc, CALL_FCALL | CALL_ARGS_SIMPLE, None)
    }

    /// The selector.
    #[inline]
    #[must_use]
    pub fn method(&self) -> &Symbol {
        &self.method
    }

    /// Positional argument count. Keyword values are counted separately
    /// through [`CallData::kw_arg`].
    #[inline]
    #[must_use]
    pub fn argc(&self) -> u16 {
        self.argc
    }

    /// The raw flag bits.
    #[inline]
    #[must_use]
    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Keyword argument names in call order, if the site passes literal
    /// keywords.
    #[inline]
    #[must_use]
    pub fn kw_arg(&self) -> Option<&[Symbol]> {
        self.kw_arg.as_deref()
    }

    /// Check a single flag bit.
    #[inline]
    #[must_use]
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    /// Number of stack slots the call site's arguments occupy: positional
    /// arguments, keyword values, and the trailing block argument.
    #[must_use]
    pub fn stack_arg_slots(&self) -> usize {
        let kw = self.kw_arg.as_ref().map_or(0, Vec::len);
        let blockarg = usize::from(self.has_flag(CALL_ARGS_BLOCKARG));
        self.argc as usize + kw + blockarg
    }

    /// Names of the set flags, in bit order. Used by disassembly.
    #[must_use]
    pub fn flag_names(&self) -> Vec<&'static str> {
        FLAG_NAMES
            .iter()
            .enumerate()
            .filter(|(bit, _)| self.flags & (1 << bit) != 0)
            .map(|(_, name)| *name)
            .collect()
    }
}

impl fmt::Display for CallData {
    /// Render in the reference disassembler's `<calldata!...>` shape.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<calldata!mid:{}, argc:{}", self.method, self.argc)?;
        for name in self.flag_names() {
            write!(f, ", {name}")?;
        }
        write!(f, ">")
    }
}
