//! The run-time value domain manipulated by the instruction catalog.
//!
//! Values are a tagged enum rather than a packed word: instructions carry
//! literal operands (`putobject`, `duparray`, dispatch tables), so the
//! representation doubles as the serialization medium and favors
//! structural clarity over bit tricks. Aggregates are reference-counted
//! with interior mutability, matching the single-threaded cooperative
//! execution model.

use crate::frame::Block;
use crate::rclass::{RClass, RObject};
use garnet_core::intern::{intern, Symbol};
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Insertion-ordered hash payload.
pub type RHash = IndexMap<Value, Value, FxBuildHasher>;

/// A mutable, freezable string payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RString {
    /// Character content.
    pub content: String,
    /// Frozen strings reject mutation.
    pub frozen: bool,
}

impl RString {
    /// Create an unfrozen string.
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            frozen: false,
        }
    }

    /// Create a frozen string.
    #[must_use]
    pub fn frozen(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            frozen: true,
        }
    }
}

/// A range payload. Endpoints are arbitrary values; the common case is
/// integer endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct RRange {
    /// Lower endpoint.
    pub begin: Value,
    /// Upper endpoint.
    pub end: Value,
    /// `true` for `...` ranges.
    pub exclude_end: bool,
}

/// Regexp option bit: case-insensitive matching.
pub const REGEXP_IGNORECASE: u8 = 1;
/// Regexp option bit: extended (whitespace-insensitive) syntax.
pub const REGEXP_EXTENDED: u8 = 2;
/// Regexp option bit: `.` matches newline.
pub const REGEXP_MULTILINE: u8 = 4;

/// A compiled regular expression payload.
#[derive(Debug)]
pub struct RRegexp {
    /// Original pattern source.
    pub source: String,
    /// Option bits (ignorecase/extended/multiline).
    pub options: u8,
    /// Compiled matcher.
    pub regex: regex::Regex,
}

impl RRegexp {
    /// Compile a pattern with the given option bits.
    pub fn compile(source: &str, options: u8) -> Result<Self, garnet_core::GarnetError> {
        let mut inline = String::new();
        if options & REGEXP_IGNORECASE != 0 {
            inline.push('i');
        }
        if options & REGEXP_EXTENDED != 0 {
            inline.push('x');
        }
        if options & REGEXP_MULTILINE != 0 {
            inline.push('s');
        }
        let pattern = if inline.is_empty() {
            source.to_owned()
        } else {
            format!("(?{inline}){source}")
        };
        let regex = regex::Regex::new(&pattern)
            .map_err(|e| garnet_core::GarnetError::regexp(e.to_string()))?;
        Ok(Self {
            source: source.to_owned(),
            options,
            regex,
        })
    }
}

impl PartialEq for RRegexp {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.options == other.options
    }
}

/// Discriminant of a [`Value`], used to key the builtin method registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// nil
    Nil,
    /// true/false
    Bool,
    /// Integer
    Integer,
    /// Float
    Float,
    /// String
    String,
    /// Symbol
    Symbol,
    /// Array
    Array,
    /// Hash
    Hash,
    /// Range
    Range,
    /// Regexp
    Regexp,
    /// Class or module
    Class,
    /// Proc
    Proc,
    /// Plain object
    Object,
    /// The frozen-core sentinel
    FrozenCore,
}

/// A run-time value.
///
/// Immediate kinds are stored inline; aggregates share their payload
/// through `Rc`. `Clone` is therefore always cheap and never deep.
#[derive(Clone)]
pub enum Value {
    /// The nil singleton.
    Nil,
    /// true or false.
    Bool(bool),
    /// A signed machine integer.
    Integer(i64),
    /// A double-precision float.
    Float(f64),
    /// A mutable string.
    String(Rc<RefCell<RString>>),
    /// An interned symbol.
    Symbol(Symbol),
    /// An ordered collection.
    Array(Rc<RefCell<Vec<Value>>>),
    /// An insertion-ordered mapping.
    Hash(Rc<RefCell<RHash>>),
    /// A range of values.
    Range(Rc<RRange>),
    /// A compiled regular expression.
    Regexp(Rc<RRegexp>),
    /// A class or module.
    Class(Rc<RefCell<RClass>>),
    /// A block materialized as a first-class value.
    Proc(Rc<Block>),
    /// A plain object (also the "any host object" escape hatch).
    Object(Rc<RefCell<RObject>>),
    /// The sentinel receiver used by alias/undef lowerings.
    FrozenCore,
}

impl Value {
    /// Construct a fresh unfrozen string value.
    #[must_use]
    pub fn string(content: impl Into<String>) -> Self {
        Self::String(Rc::new(RefCell::new(RString::new(content))))
    }

    /// Construct a frozen string value.
    #[must_use]
    pub fn frozen_string(content: impl Into<String>) -> Self {
        Self::String(Rc::new(RefCell::new(RString::frozen(content))))
    }

    /// Construct a symbol value from a name.
    #[must_use]
    pub fn symbol(name: &str) -> Self {
        Self::Symbol(intern(name))
    }

    /// Construct an array value.
    #[must_use]
    pub fn array(items: Vec<Value>) -> Self {
        Self::Array(Rc::new(RefCell::new(items)))
    }

    /// Construct a hash value from key/value pairs, preserving order.
    #[must_use]
    pub fn hash(pairs: Vec<(Value, Value)>) -> Self {
        let mut map = RHash::default();
        for (k, v) in pairs {
            map.insert(k, v);
        }
        Self::Hash(Rc::new(RefCell::new(map)))
    }

    /// Construct a range value.
    #[must_use]
    pub fn range(begin: Value, end: Value, exclude_end: bool) -> Self {
        Self::Range(Rc::new(RRange {
            begin,
            end,
            exclude_end,
        }))
    }

    /// The discriminant used for builtin method dispatch.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Nil => ValueKind::Nil,
            Self::Bool(_) => ValueKind::Bool,
            Self::Integer(_) => ValueKind::Integer,
            Self::Float(_) => ValueKind::Float,
            Self::String(_) => ValueKind::String,
            Self::Symbol(_) => ValueKind::Symbol,
            Self::Array(_) => ValueKind::Array,
            Self::Hash(_) => ValueKind::Hash,
            Self::Range(_) => ValueKind::Range,
            Self::Regexp(_) => ValueKind::Regexp,
            Self::Class(_) => ValueKind::Class,
            Self::Proc(_) => ValueKind::Proc,
            Self::Object(_) => ValueKind::Object,
            Self::FrozenCore => ValueKind::FrozenCore,
        }
    }

    /// Everything is truthy except nil and false.
    #[inline]
    #[must_use]
    pub fn truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::Bool(false))
    }

    /// Check for nil.
    #[inline]
    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// The value's type name as the user sees it.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "NilClass",
            Self::Bool(true) => "TrueClass",
            Self::Bool(false) => "FalseClass",
            Self::Integer(_) => "Integer",
            Self::Float(_) => "Float",
            Self::String(_) => "String",
            Self::Symbol(_) => "Symbol",
            Self::Array(_) => "Array",
            Self::Hash(_) => "Hash",
            Self::Range(_) => "Range",
            Self::Regexp(_) => "Regexp",
            Self::Class(c) => {
                if c.borrow().module {
                    "Module"
                } else {
                    "Class"
                }
            }
            Self::Proc(_) => "Proc",
            Self::Object(_) => "Object",
            Self::FrozenCore => "RubyVM::FrozenCore",
        }
    }

    /// Extract an integer, if this is one.
    #[inline]
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Extract string content, if this is a string.
    #[must_use]
    pub fn as_string(&self) -> Option<String> {
        match self {
            Self::String(s) => Some(s.borrow().content.clone()),
            _ => None,
        }
    }

    /// Extract a symbol, if this is one.
    #[must_use]
    pub fn as_symbol(&self) -> Option<Symbol> {
        match self {
            Self::Symbol(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// The string used by `to_s`.
    #[must_use]
    pub fn to_display_string(&self) -> String {
        match self {
            Self::Nil => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Integer(n) => n.to_string(),
            Self::Float(f) => format_float(*f),
            Self::String(s) => s.borrow().content.clone(),
            Self::Symbol(s) => s.as_str().to_owned(),
            Self::Range(r) => {
                let sep = if r.exclude_end { "..." } else { ".." };
                format!(
                    "{}{sep}{}",
                    r.begin.to_display_string(),
                    r.end.to_display_string()
                )
            }
            Self::Regexp(r) => format!("(?-mix:{})", r.source),
            Self::Class(c) => c.borrow().name.clone(),
            _ => self.inspect(),
        }
    }

    /// The string used by `inspect` and by disassembly operand rendering.
    #[must_use]
    pub fn inspect(&self) -> String {
        match self {
            Self::Nil => "nil".to_owned(),
            Self::Bool(b) => b.to_string(),
            Self::Integer(n) => n.to_string(),
            Self::Float(f) => format_float(*f),
            Self::String(s) => format!("{:?}", s.borrow().content),
            Self::Symbol(s) => format!(":{s}"),
            Self::Array(items) => {
                let inner: Vec<String> = items.borrow().iter().map(Value::inspect).collect();
                format!("[{}]", inner.join(", "))
            }
            Self::Hash(map) => {
                let inner: Vec<String> = map
                    .borrow()
                    .iter()
                    .map(|(k, v)| format!("{} => {}", k.inspect(), v.inspect()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Self::Range(r) => {
                let sep = if r.exclude_end { "..." } else { ".." };
                format!("{}{sep}{}", r.begin.inspect(), r.end.inspect())
            }
            Self::Regexp(r) => format!("/{}/", r.source),
            Self::Class(c) => c.borrow().name.clone(),
            Self::Proc(_) => "#<Proc>".to_owned(),
            Self::Object(o) => format!("#<{}>", o.borrow().class.borrow().name),
            Self::FrozenCore => "#<frozen core>".to_owned(),
        }
    }

    /// Three-way comparison used by `<`/`>` and by min/max selection.
    /// Returns `None` when the operands are not comparable.
    #[must_use]
    pub fn compare(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Integer(a), Self::Float(b)) => (*a as f64).partial_cmp(b),
            (Self::Float(a), Self::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Self::String(a), Self::String(b)) => {
                Some(a.borrow().content.cmp(&b.borrow().content))
            }
            _ => None,
        }
    }

    /// Numeric-aware equality used by the `==` builtin. Unlike the
    /// structural `PartialEq`, `1 == 1.0` holds here.
    #[must_use]
    pub fn value_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Integer(a), Self::Float(b)) | (Self::Float(b), Self::Integer(a)) => {
                (*a as f64) == *b
            }
            _ => self == other,
        }
    }
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

impl PartialEq for Value {
    /// Structural equality: same kind, equal payloads. Identity-bearing
    /// kinds (objects, classes, procs) compare by reference.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::String(a), Self::String(b)) => a.borrow().content == b.borrow().content,
            (Self::Symbol(a), Self::Symbol(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            }
            (Self::Hash(a), Self::Hash(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Self::Range(a), Self::Range(b)) => a == b,
            (Self::Regexp(a), Self::Regexp(b)) => a == b,
            (Self::Class(a), Self::Class(b)) => Rc::ptr_eq(a, b),
            (Self::Proc(a), Self::Proc(b)) => Rc::ptr_eq(a, b),
            (Self::Object(a), Self::Object(b)) => Rc::ptr_eq(a, b),
            (Self::FrozenCore, Self::FrozenCore) => true,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Nil | Self::FrozenCore => {}
            Self::Bool(b) => b.hash(state),
            Self::Integer(n) => n.hash(state),
            Self::Float(f) => f.to_bits().hash(state),
            Self::String(s) => s.borrow().content.hash(state),
            Self::Symbol(s) => s.hash(state),
            Self::Array(items) => {
                for item in items.borrow().iter() {
                    item.hash(state);
                }
            }
            Self::Hash(map) => map.borrow().len().hash(state),
            Self::Range(r) => {
                r.begin.hash(state);
                r.end.hash(state);
                r.exclude_end.hash(state);
            }
            Self::Regexp(r) => {
                r.source.hash(state);
                r.options.hash(state);
            }
            Self::Class(c) => Rc::as_ptr(c).hash(state),
            Self::Proc(p) => Rc::as_ptr(p).hash(state),
            Self::Object(o) => Rc::as_ptr(o).hash(state),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inspect())
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Nil
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::string(s)
    }
}
