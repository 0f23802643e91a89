//! Instruction sequences.
//!
//! An [`Iseq`] is a compiled unit: a sequence of instructions plus the
//! metadata the catalog needs from it — a local table with serialized
//! offset mapping, a parent link, labels, parameters, and a catch table.
//! The push API doubles as the assembly surface tests use in place of the
//! external compiler.

use crate::insn::Insn;
use crate::value::Value;
use garnet_core::intern::{intern, Symbol};
use garnet_core::GarnetError;
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

/// Magic string leading every serialized iseq.
pub const SERIAL_MAGIC: &str = "YARVInstructionSequence/SimpleDataFormat";
/// Serialized format major version.
pub const SERIAL_MAJOR: i64 = 3;
/// Serialized format minor version.
pub const SERIAL_MINOR: i64 = 2;

/// The kind of unit an iseq was compiled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IseqKind {
    /// Whole-program top level.
    Top,
    /// Method body.
    Method,
    /// Block body.
    Block,
    /// Class or module body.
    Class,
    /// Rescue handler.
    Rescue,
    /// Ensure handler.
    Ensure,
    /// Eval unit.
    Eval,
    /// Main script.
    Main,
    /// Bare body (used by `once`).
    Plain,
}

impl IseqKind {
    /// The serialized tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Top => "top",
            Self::Method => "method",
            Self::Block => "block",
            Self::Class => "class",
            Self::Rescue => "rescue",
            Self::Ensure => "ensure",
            Self::Eval => "eval",
            Self::Main => "main",
            Self::Plain => "plain",
        }
    }

    /// Parse a serialized tag.
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "top" => Self::Top,
            "method" => Self::Method,
            "block" => Self::Block,
            "class" => Self::Class,
            "rescue" => Self::Rescue,
            "ensure" => Self::Ensure,
            "eval" => Self::Eval,
            "main" => Self::Main,
            "plain" => Self::Plain,
            _ => return None,
        })
    }
}

/// An opaque jump target with a printable name.
///
/// Labels compare and hash by name; names are unique within an iseq, which
/// lets the serialized form represent them as plain symbols.
#[derive(Clone)]
pub struct Label {
    name: Rc<str>,
}

impl Label {
    /// Create a label with an explicit name (deserialization path).
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            name: Rc::from(name),
        }
    }

    /// The printable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Label {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Label {}

impl std::hash::Hash for Label {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Label({})", self.name)
    }
}

/// The table of local variable names for an iseq.
///
/// Internally locals are numbered from zero in declaration order. The
/// serialized form instead numbers slots from the bottom of the frame, so
/// [`LocalTable::offset`] is applied on the way out and inverted by the
/// loader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalTable {
    locals: Vec<Symbol>,
}

impl LocalTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of locals.
    #[must_use]
    pub fn size(&self) -> usize {
        self.locals.len()
    }

    /// Check for an empty table.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locals.is_empty()
    }

    /// Add a local, returning its internal index. Adding an existing name
    /// returns the existing index.
    pub fn add(&mut self, name: Symbol) -> usize {
        if let Some(index) = self.index_of(&name) {
            return index;
        }
        self.locals.push(name);
        self.locals.len() - 1
    }

    /// Find a local's internal index by name.
    #[must_use]
    pub fn index_of(&self, name: &Symbol) -> Option<usize> {
        self.locals.iter().position(|l| l == name)
    }

    /// The name at an internal index.
    #[must_use]
    pub fn name_at(&self, index: usize) -> Option<&Symbol> {
        self.locals.get(index)
    }

    /// Map an internal index to the serialized slot numbering, which
    /// counts from the bottom of the table (the last local serializes
    /// lowest, matching the reference loader).
    #[must_use]
    pub fn offset(&self, index: usize) -> usize {
        self.locals.len() - index + 2
    }

    /// Invert [`LocalTable::offset`].
    #[must_use]
    pub fn index_for_offset(&self, offset: usize) -> usize {
        self.locals.len() + 2 - offset
    }

    /// Iterate the names in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.locals.iter()
    }
}

/// Parameter shape of an iseq: how frame entry binds arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    /// Number of leading required parameters, bound to slots `0..lead_num`.
    pub lead_num: usize,
    /// Slot receiving the rest array, if a rest parameter exists.
    pub rest_start: Option<usize>,
    /// Slot receiving the block parameter, if one exists.
    pub block_start: Option<usize>,
    /// Keyword parameters in declaration order, with static defaults.
    pub keywords: Vec<(Symbol, Option<Value>)>,
    /// Slot holding the keyword-presence bitmap read by `checkkeyword`.
    pub kwbits: Option<usize>,
}

impl Params {
    /// Number of argument slots frame entry fills.
    #[must_use]
    pub fn arg_size(&self) -> usize {
        let mut size = self.lead_num;
        if self.rest_start.is_some() {
            size += 1;
        }
        size += self.keywords.len();
        if self.block_start.is_some() {
            size += 1;
        }
        size
    }
}

/// Kind of a catch-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchKind {
    /// Rescue handler for raised errors.
    Rescue,
    /// Ensure handler run on any unwind.
    Ensure,
    /// Retry target for `retry` throws.
    Retry,
    /// Break target for `break` throws out of a block.
    Break,
    /// Next target for `next` throws.
    Next,
    /// Redo target for `redo` throws.
    Redo,
}

impl CatchKind {
    /// The serialized tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rescue => "rescue",
            Self::Ensure => "ensure",
            Self::Retry => "retry",
            Self::Break => "break",
            Self::Next => "next",
            Self::Redo => "redo",
        }
    }

    /// Parse a serialized tag.
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "rescue" => Self::Rescue,
            "ensure" => Self::Ensure,
            "retry" => Self::Retry,
            "break" => Self::Break,
            "next" => Self::Next,
            "redo" => Self::Redo,
            _ => return None,
        })
    }
}

/// A catch-table entry: handler selection by kind and pc range.
#[derive(Debug, Clone)]
pub struct CatchEntry {
    /// Which throws this entry handles.
    pub kind: CatchKind,
    /// Handler body for rescue/ensure entries.
    pub iseq: Option<Rc<Iseq>>,
    /// Start of the covered pc range (inclusive).
    pub begin_label: Label,
    /// End of the covered pc range (exclusive).
    pub end_label: Label,
    /// Where execution continues after the handler.
    pub exit_label: Label,
    /// Stack depth (relative to the frame base) to restore before
    /// continuing.
    pub sp: usize,
}

/// A compiled instruction sequence.
pub struct Iseq {
    /// Human-readable name (`<main>`, a method name, `block in ...`).
    pub name: String,
    /// Unit kind.
    pub kind: IseqKind,
    /// Enclosing iseq, for cross-level local addressing.
    parent: Option<Weak<Iseq>>,
    /// Back-reference to the owning `Rc`, so `&self` methods can hand out
    /// owned handles for parent-chain walks.
    self_ref: RefCell<Weak<Iseq>>,
    local_table: RefCell<LocalTable>,
    params: RefCell<Params>,
    insns: RefCell<Vec<Insn>>,
    labels: RefCell<FxHashMap<Label, usize>>,
    label_counter: Cell<usize>,
    catch_table: RefCell<Vec<CatchEntry>>,
}

impl Iseq {
    fn build(name: String, kind: IseqKind, parent: Option<Weak<Iseq>>) -> Rc<Self> {
        let iseq = Rc::new(Self {
            name,
            kind,
            parent,
            self_ref: RefCell::new(Weak::new()),
            local_table: RefCell::new(LocalTable::new()),
            params: RefCell::new(Params::default()),
            insns: RefCell::new(Vec::new()),
            labels: RefCell::new(FxHashMap::default()),
            label_counter: Cell::new(0),
            catch_table: RefCell::new(Vec::new()),
        });
        *iseq.self_ref.borrow_mut() = Rc::downgrade(&iseq);
        iseq
    }

    /// Create a root iseq.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: IseqKind) -> Rc<Self> {
        Self::build(name.into(), kind, None)
    }

    /// Create a child iseq (block, method, class body, handler).
    #[must_use]
    pub fn with_parent(name: impl Into<String>, kind: IseqKind, parent: &Rc<Iseq>) -> Rc<Self> {
        Self::build(name.into(), kind, Some(Rc::downgrade(parent)))
    }

    fn self_rc(&self) -> Rc<Iseq> {
        self.self_ref
            .borrow()
            .upgrade()
            .expect("iseq self reference outlives its Rc")
    }

    /// The enclosing iseq, if still alive.
    #[must_use]
    pub fn parent_iseq(&self) -> Option<Rc<Iseq>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Walk `level` parents to the local table that owns a cross-level
    /// reference.
    #[must_use]
    pub fn table_at_level(&self, level: usize) -> Option<Rc<Iseq>> {
        let mut current = self.self_rc();
        for _ in 0..level {
            current = current.parent_iseq()?;
        }
        Some(current)
    }

    /// Append an instruction.
    pub fn push(&self, insn: Insn) {
        self.insns.borrow_mut().push(insn);
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.insns.borrow().len()
    }

    /// Check for an empty body.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insns.borrow().is_empty()
    }

    /// Fetch the instruction at `pc`.
    #[must_use]
    pub fn insn_at(&self, pc: usize) -> Option<Insn> {
        self.insns.borrow().get(pc).cloned()
    }

    /// Snapshot the instruction body.
    #[must_use]
    pub fn clone_insns(&self) -> Vec<Insn> {
        self.insns.borrow().clone()
    }

    /// Create a fresh label unique to this iseq.
    #[must_use]
    pub fn new_label(&self) -> Label {
        let n = self.label_counter.get();
        self.label_counter.set(n + 1);
        Label::named(&format!("label_{n}"))
    }

    /// Mark a label as pointing at the next instruction to be pushed.
    pub fn push_label(&self, label: &Label) {
        self.labels
            .borrow_mut()
            .insert(label.clone(), self.insns.borrow().len());
    }

    /// Resolve a label to its pc.
    #[must_use]
    pub fn label_pc(&self, label: &Label) -> Option<usize> {
        self.labels.borrow().get(label).copied()
    }

    /// All labels sorted by target pc (name-ordered within one pc).
    #[must_use]
    pub fn labels_by_pc(&self) -> Vec<(usize, Label)> {
        let mut labels: Vec<(usize, Label)> = self
            .labels
            .borrow()
            .iter()
            .map(|(label, pc)| (*pc, label.clone()))
            .collect();
        labels.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name().cmp(b.1.name())));
        labels
    }

    /// Declare (or find) a local, returning its internal index.
    pub fn local(&self, name: &str) -> usize {
        self.local_table.borrow_mut().add(intern(name))
    }

    /// Read access to the local table.
    #[must_use]
    pub fn local_table(&self) -> std::cell::Ref<'_, LocalTable> {
        self.local_table.borrow()
    }

    /// Write access to the local table.
    #[must_use]
    pub fn local_table_mut(&self) -> std::cell::RefMut<'_, LocalTable> {
        self.local_table.borrow_mut()
    }

    /// Read access to the parameter shape.
    #[must_use]
    pub fn params(&self) -> std::cell::Ref<'_, Params> {
        self.params.borrow()
    }

    /// Write access to the parameter shape.
    #[must_use]
    pub fn params_mut(&self) -> std::cell::RefMut<'_, Params> {
        self.params.borrow_mut()
    }

    /// Append a catch-table entry.
    pub fn add_catch_entry(&self, entry: CatchEntry) {
        self.catch_table.borrow_mut().push(entry);
    }

    /// Snapshot the catch table.
    #[must_use]
    pub fn catch_entries(&self) -> Vec<CatchEntry> {
        self.catch_table.borrow().clone()
    }

    /// Maximum value-stack depth of a straight-line execution, computed
    /// from the shape hooks. `checktype`'s reported push count is
    /// special-cased down to its semantic effect.
    #[must_use]
    pub fn stack_max(&self) -> usize {
        let mut depth: i64 = 0;
        let mut max: i64 = 0;
        for insn in self.insns.borrow().iter() {
            let pushes = if matches!(insn, Insn::CheckType { .. }) {
                1
            } else {
                insn.pushes()
            };
            depth -= insn.pops() as i64;
            depth = depth.max(0);
            depth += pushes as i64;
            max = max.max(depth);
        }
        max as usize
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    /// Serialize to the reference loader's array shape.
    #[must_use]
    pub fn to_a(&self) -> Value {
        let locals: Vec<Value> = self
            .local_table
            .borrow()
            .iter()
            .map(|s| Value::Symbol(s.clone()))
            .collect();

        let params = self.params.borrow();
        let mut param_pairs: Vec<(Value, Value)> = vec![(
            Value::symbol("lead_num"),
            Value::Integer(params.lead_num as i64),
        )];
        if let Some(rest) = params.rest_start {
            param_pairs.push((Value::symbol("rest_start"), Value::Integer(rest as i64)));
        }
        if let Some(block) = params.block_start {
            param_pairs.push((Value::symbol("block_start"), Value::Integer(block as i64)));
        }
        if let Some(kwbits) = params.kwbits {
            param_pairs.push((Value::symbol("kwbits"), Value::Integer(kwbits as i64)));
        }
        if !params.keywords.is_empty() {
            let kws: Vec<Value> = params
                .keywords
                .iter()
                .map(|(name, default)| match default {
                    Some(d) => Value::array(vec![Value::Symbol(name.clone()), d.clone()]),
                    None => Value::array(vec![Value::Symbol(name.clone())]),
                })
                .collect();
            param_pairs.push((Value::symbol("keyword"), Value::array(kws)));
        }
        drop(params);

        let catch_table: Vec<Value> = self
            .catch_table
            .borrow()
            .iter()
            .map(|entry| {
                Value::array(vec![
                    Value::symbol(entry.kind.as_str()),
                    entry.iseq.as_ref().map_or(Value::Nil, |handler| handler.to_a()),
                    Value::symbol(entry.begin_label.name()),
                    Value::symbol(entry.end_label.name()),
                    Value::symbol(entry.exit_label.name()),
                    Value::Integer(entry.sp as i64),
                ])
            })
            .collect();

        // Body: label markers interleaved with instruction tuples.
        let labels = self.labels.borrow();
        let mut by_pc: Vec<(usize, &Label)> = labels.iter().map(|(l, pc)| (*pc, l)).collect();
        by_pc.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name().cmp(b.1.name())));
        let mut body = Vec::new();
        let self_rc = self.self_rc();
        let insns = self.insns.borrow();
        let mut label_iter = by_pc.into_iter().peekable();
        for (pc, insn) in insns.iter().enumerate() {
            while label_iter.peek().is_some_and(|(lpc, _)| *lpc == pc) {
                let (_, label) = label_iter.next().unwrap();
                body.push(Value::symbol(label.name()));
            }
            body.push(insn.to_a(&self_rc));
        }
        for (_, label) in label_iter {
            body.push(Value::symbol(label.name()));
        }

        let misc = Value::hash(vec![
            (
                Value::symbol("arg_size"),
                Value::Integer(self.params.borrow().arg_size() as i64),
            ),
            (
                Value::symbol("local_size"),
                Value::Integer(self.local_table.borrow().size() as i64),
            ),
            (
                Value::symbol("stack_max"),
                Value::Integer(self.stack_max() as i64),
            ),
        ]);

        Value::array(vec![
            Value::string(SERIAL_MAGIC),
            Value::Integer(SERIAL_MAJOR),
            Value::Integer(SERIAL_MINOR),
            Value::Integer(1),
            misc,
            Value::string(self.name.clone()),
            Value::string("<compiled>"),
            Value::string("<compiled>"),
            Value::Integer(1),
            Value::symbol(self.kind.as_str()),
            Value::array(locals),
            Value::hash(param_pairs),
            Value::array(catch_table),
            Value::array(body),
        ])
    }

    /// Deserialize a root iseq from the array shape.
    pub fn from_a(serialized: &Value) -> Result<Rc<Self>, GarnetError> {
        Self::from_a_with_parent(serialized, None)
    }

    /// Deserialize an iseq nested under `parent`.
    pub fn from_a_with_parent(
        serialized: &Value,
        parent: Option<&Rc<Iseq>>,
    ) -> Result<Rc<Self>, GarnetError> {
        let Value::Array(items) = serialized else {
            return Err(GarnetError::type_error("serialized iseq must be an array"));
        };
        let items = items.borrow();
        if items.len() != 14 {
            return Err(GarnetError::argument(format!(
                "serialized iseq has {} elements, expected 14",
                items.len()
            )));
        }
        match items[0].as_string().as_deref() {
            Some(SERIAL_MAGIC) => {}
            _ => return Err(GarnetError::type_error("bad serialized iseq magic")),
        }

        let name = items[5]
            .as_string()
            .ok_or_else(|| GarnetError::type_error("iseq name must be a string"))?;
        let kind = items[9]
            .as_symbol()
            .and_then(|s| IseqKind::from_str(s.as_str()))
            .ok_or_else(|| GarnetError::type_error("bad iseq type tag"))?;

        let iseq = match parent {
            Some(parent) => Iseq::with_parent(name, kind, parent),
            None => Iseq::new(name, kind),
        };

        // Locals must be installed before the body so cross-level offsets
        // resolve against the right table sizes.
        let Value::Array(locals) = &items[10] else {
            return Err(GarnetError::type_error("iseq locals must be an array"));
        };
        for local in locals.borrow().iter() {
            let sym = local
                .as_symbol()
                .ok_or_else(|| GarnetError::type_error("local name must be a symbol"))?;
            iseq.local_table.borrow_mut().add(sym);
        }

        // Params.
        if let Value::Hash(params) = &items[11] {
            let params = params.borrow();
            let mut parsed = Params::default();
            if let Some(Value::Integer(n)) = params.get(&Value::symbol("lead_num")) {
                parsed.lead_num = *n as usize;
            }
            if let Some(Value::Integer(n)) = params.get(&Value::symbol("rest_start")) {
                parsed.rest_start = Some(*n as usize);
            }
            if let Some(Value::Integer(n)) = params.get(&Value::symbol("block_start")) {
                parsed.block_start = Some(*n as usize);
            }
            if let Some(Value::Integer(n)) = params.get(&Value::symbol("kwbits")) {
                parsed.kwbits = Some(*n as usize);
            }
            if let Some(Value::Array(kws)) = params.get(&Value::symbol("keyword")) {
                for kw in kws.borrow().iter() {
                    let Value::Array(pair) = kw else {
                        return Err(GarnetError::type_error("keyword spec must be an array"));
                    };
                    let pair = pair.borrow();
                    let name = pair
                        .first()
                        .and_then(Value::as_symbol)
                        .ok_or_else(|| GarnetError::type_error("keyword name must be a symbol"))?;
                    parsed.keywords.push((name, pair.get(1).cloned()));
                }
            }
            *iseq.params.borrow_mut() = parsed;
        }

        // Body: label markers and instruction tuples.
        let Value::Array(body) = &items[13] else {
            return Err(GarnetError::type_error("iseq body must be an array"));
        };
        for item in body.borrow().iter() {
            match item {
                Value::Symbol(label) => iseq.push_label(&Label::named(label.as_str())),
                Value::Array(_) => {
                    let insn = Insn::from_a(item, &iseq)?;
                    iseq.push(insn);
                }
                other => {
                    return Err(GarnetError::type_error(format!(
                        "unexpected body element: {}",
                        other.inspect()
                    )))
                }
            }
        }

        // Catch table (after the body so handler iseqs nest under us).
        let Value::Array(catch_table) = &items[12] else {
            return Err(GarnetError::type_error("iseq catch table must be an array"));
        };
        for entry in catch_table.borrow().iter() {
            let Value::Array(fields) = entry else {
                return Err(GarnetError::type_error("catch entry must be an array"));
            };
            let fields = fields.borrow();
            if fields.len() != 6 {
                return Err(GarnetError::argument("catch entry has wrong arity"));
            }
            let kind = fields[0]
                .as_symbol()
                .and_then(|s| CatchKind::from_str(s.as_str()))
                .ok_or_else(|| GarnetError::type_error("bad catch entry kind"))?;
            let handler = match &fields[1] {
                Value::Nil => None,
                serialized => Some(Iseq::from_a_with_parent(serialized, Some(&iseq))?),
            };
            let label_at = |i: usize| -> Result<Label, GarnetError> {
                fields[i]
                    .as_symbol()
                    .map(|s| Label::named(s.as_str()))
                    .ok_or_else(|| GarnetError::type_error("catch entry label must be a symbol"))
            };
            let sp = fields[5]
                .as_integer()
                .ok_or_else(|| GarnetError::type_error("catch entry sp must be an integer"))?;
            iseq.add_catch_entry(CatchEntry {
                kind,
                iseq: handler,
                begin_label: label_at(2)?,
                end_label: label_at(3)?,
                exit_label: label_at(4)?,
                sp: sp as usize,
            });
        }

        Ok(iseq)
    }
}

impl PartialEq for Iseq {
    /// Structural equality: same name, kind, locals, and instruction
    /// sequence. Used by the round-trip property.
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && *self.local_table.borrow() == *other.local_table.borrow()
            && *self.insns.borrow() == *other.insns.borrow()
    }
}

impl fmt::Debug for Iseq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iseq")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("insns", &self.insns.borrow().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_table_offsets() {
        let mut table = LocalTable::new();
        let a = table.add(intern("a"));
        let b = table.add(intern("b"));
        assert_eq!((a, b), (0, 1));
        // Two locals: the first serializes at 4, the second at 3.
        assert_eq!(table.offset(0), 4);
        assert_eq!(table.offset(1), 3);
        assert_eq!(table.index_for_offset(4), 0);
        assert_eq!(table.index_for_offset(3), 1);
    }

    #[test]
    fn test_local_table_dedup() {
        let mut table = LocalTable::new();
        assert_eq!(table.add(intern("x")), 0);
        assert_eq!(table.add(intern("x")), 0);
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn test_labels_resolve_to_pc() {
        let iseq = Iseq::new("<test>", IseqKind::Top);
        let label = iseq.new_label();
        iseq.push(Insn::PutNil);
        iseq.push_label(&label);
        iseq.push(Insn::Leave);
        assert_eq!(iseq.label_pc(&label), Some(1));
    }

    #[test]
    fn test_new_labels_are_distinct() {
        let iseq = Iseq::new("<test>", IseqKind::Top);
        assert_ne!(iseq.new_label(), iseq.new_label());
    }

    #[test]
    fn test_parent_chain() {
        let top = Iseq::new("<top>", IseqKind::Top);
        let block = Iseq::with_parent("block", IseqKind::Block, &top);
        assert!(Rc::ptr_eq(&block.parent_iseq().unwrap(), &top));
        assert!(Rc::ptr_eq(&block.table_at_level(1).unwrap(), &top));
        assert!(block.table_at_level(2).is_none());
    }

    #[test]
    fn test_params_arg_size() {
        let mut params = Params::default();
        params.lead_num = 2;
        params.rest_start = Some(2);
        params.block_start = Some(3);
        assert_eq!(params.arg_size(), 4);
    }

    #[test]
    fn test_stack_max_simple() {
        let iseq = Iseq::new("<test>", IseqKind::Top);
        iseq.push(Insn::PutObject {
            object: Value::Integer(1),
        });
        iseq.push(Insn::PutObject {
            object: Value::Integer(2),
        });
        iseq.push(Insn::NewArray { count: 2 });
        iseq.push(Insn::Leave);
        assert_eq!(iseq.stack_max(), 2);
    }
}
