//! Builtin method registry.
//!
//! Primitive receivers (integers, strings, arrays, ...) have no method
//! tables of their own; their behavior lives here, keyed by value kind and
//! selector. User-defined and aliased entries on the core classes shadow
//! this registry, so reopening a core class works the same as reopening a
//! user class.

use crate::ops::strings::match_against;
use crate::rclass::{Method, NativeFn, RClass, RObject};
use crate::value::{Value, ValueKind};
use crate::vm::{CallArgs, ThrowKind, Unwind, Vm, VmResult};
use garnet_core::intern::{intern, Symbol};
use garnet_core::GarnetError;
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// Registry of native method implementations.
pub struct BuiltinRegistry {
    methods: FxHashMap<(ValueKind, Symbol), NativeFn>,
    universal: FxHashMap<Symbol, NativeFn>,
    core: FxHashMap<Symbol, NativeFn>,
}

impl BuiltinRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            methods: FxHashMap::default(),
            universal: FxHashMap::default(),
            core: FxHashMap::default(),
        }
    }

    /// Create the registry with the standard method surface installed.
    #[must_use]
    pub fn with_standard_builtins() -> Self {
        let mut registry = Self::new();
        registry.install_numeric();
        registry.install_string();
        registry.install_symbol();
        registry.install_array();
        registry.install_hash();
        registry.install_regexp();
        registry.install_class();
        registry.install_proc();
        registry.install_object();
        registry.install_universal();
        registry.install_frozen_core();
        registry
    }

    fn define(&mut self, kind: ValueKind, name: &str, f: NativeFn) {
        self.methods.insert((kind, intern(name)), f);
    }

    fn define_universal(&mut self, name: &str, f: NativeFn) {
        self.universal.insert(intern(name), f);
    }

    fn define_core(&mut self, name: &str, f: NativeFn) {
        self.core.insert(intern(name), f);
    }

    /// Find a kind-specific builtin.
    #[must_use]
    pub fn lookup(&self, kind: ValueKind, name: &Symbol) -> Option<NativeFn> {
        self.methods.get(&(kind, name.clone())).copied()
    }

    /// Find a universal builtin (available on every receiver).
    #[must_use]
    pub fn universal(&self, name: &Symbol) -> Option<NativeFn> {
        self.universal.get(name).copied()
    }

    /// Find a frozen-core method.
    #[must_use]
    pub fn core_method(&self, name: &Symbol) -> Option<NativeFn> {
        self.core.get(name).copied()
    }

    // =========================================================================
    // Numerics
    // =========================================================================

    fn install_numeric(&mut self) {
        for kind in [ValueKind::Integer, ValueKind::Float] {
            self.define(kind, "+", num_add);
            self.define(kind, "-", num_sub);
            self.define(kind, "*", num_mul);
            self.define(kind, "/", num_div);
            self.define(kind, "%", num_mod);
            self.define(kind, "<", num_lt);
            self.define(kind, "<=", num_le);
            self.define(kind, ">", num_gt);
            self.define(kind, ">=", num_ge);
            self.define(kind, "<=>", num_cmp);
        }
        self.define(ValueKind::Integer, "succ", int_succ);
        self.define(ValueKind::Integer, "&", int_bitand);
        self.define(ValueKind::Integer, "|", int_bitor);
        self.define(ValueKind::Integer, "<<", int_shl);
        self.define(ValueKind::Integer, "-@", int_neg);
    }

    // =========================================================================
    // Strings, Symbols, Regexps
    // =========================================================================

    fn install_string(&mut self) {
        self.define(ValueKind::String, "+", string_plus);
        self.define(ValueKind::String, "<<", string_concat);
        self.define(ValueKind::String, "*", string_times);
        self.define(ValueKind::String, "length", string_length);
        self.define(ValueKind::String, "size", string_length);
        self.define(ValueKind::String, "empty?", string_empty);
        self.define(ValueKind::String, "freeze", string_freeze);
        self.define(ValueKind::String, "-@", string_uminus);
        self.define(ValueKind::String, "frozen?", string_frozen);
        self.define(ValueKind::String, "to_sym", string_to_sym);
        self.define(ValueKind::String, "succ", string_succ);
        self.define(ValueKind::String, "=~", string_match_op);
        self.define(ValueKind::String, "[]", string_aref);
    }

    fn install_symbol(&mut self) {
        self.define(ValueKind::Symbol, "to_proc", |_, recv, _| Ok(recv));
        self.define(ValueKind::Symbol, "length", symbol_length);
        self.define(ValueKind::Symbol, "size", symbol_length);
    }

    fn install_regexp(&mut self) {
        self.define(ValueKind::Regexp, "=~", regexp_match_op);
        self.define(ValueKind::Regexp, "source", regexp_source);
        self.define(ValueKind::Regexp, "match?", regexp_match_p);
    }

    // =========================================================================
    // Collections
    // =========================================================================

    fn install_array(&mut self) {
        self.define(ValueKind::Array, "length", array_length);
        self.define(ValueKind::Array, "size", array_length);
        self.define(ValueKind::Array, "empty?", array_empty);
        self.define(ValueKind::Array, "max", array_max);
        self.define(ValueKind::Array, "min", array_min);
        self.define(ValueKind::Array, "[]", array_aref);
        self.define(ValueKind::Array, "[]=", array_aset);
        self.define(ValueKind::Array, "<<", array_push);
        self.define(ValueKind::Array, "+", array_plus);
        self.define(ValueKind::Array, "first", array_first);
        self.define(ValueKind::Array, "last", array_last);
        self.define(ValueKind::Array, "each", array_each);
    }

    fn install_hash(&mut self) {
        self.define(ValueKind::Hash, "[]", hash_aref);
        self.define(ValueKind::Hash, "[]=", hash_aset);
        self.define(ValueKind::Hash, "length", hash_length);
        self.define(ValueKind::Hash, "size", hash_length);
        self.define(ValueKind::Hash, "empty?", hash_empty);
        self.define(ValueKind::Hash, "key?", hash_key_p);
    }

    // =========================================================================
    // Classes, Procs, Objects
    // =========================================================================

    fn install_class(&mut self) {
        self.define(ValueKind::Class, "new", class_new);
        self.define(ValueKind::Class, "name", class_name);
        self.define(ValueKind::Class, "superclass", class_superclass);
    }

    fn install_proc(&mut self) {
        self.define(ValueKind::Proc, "call", proc_call);
        self.define(ValueKind::Proc, "[]", proc_call);
        self.define(ValueKind::Proc, "yield", proc_call);
    }

    fn install_object(&mut self) {
        self.define(ValueKind::Object, "message", object_message);
    }

    fn install_universal(&mut self) {
        self.define_universal("==", universal_eq);
        self.define_universal("!=", universal_neq);
        self.define_universal("!", universal_not);
        self.define_universal("nil?", universal_nil_p);
        self.define_universal("class", universal_class);
        self.define_universal("to_s", universal_to_s);
        self.define_universal("inspect", universal_inspect);
        self.define_universal("freeze", |_, recv, _| Ok(recv));
        self.define_universal("frozen?", universal_frozen_p);
        self.define_universal("equal?", universal_equal_p);
        self.define_universal("raise", universal_raise);
    }

    // =========================================================================
    // Frozen Core
    // =========================================================================

    fn install_frozen_core(&mut self) {
        self.define_core("core#set_method_alias", core_set_method_alias);
        self.define_core("core#undef_method", core_undef_method);
        self.define_core("core#set_variable_alias", core_set_variable_alias);
        self.define_core("core#hash_merge_ptr", core_hash_merge_ptr);
        self.define_core("core#hash_merge_kwd", core_hash_merge_kwd);
    }
}

impl Default for BuiltinRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Shared Helpers
// =============================================================================

fn arg(args: &CallArgs, i: usize) -> VmResult<Value> {
    args.positional
        .get(i)
        .cloned()
        .ok_or_else(|| GarnetError::arity(args.positional.len(), i + 1).into())
}

fn numeric_pair(recv: &Value, other: &Value, op: &str) -> VmResult<(f64, f64, bool)> {
    match (recv, other) {
        (Value::Integer(a), Value::Integer(b)) => Ok((*a as f64, *b as f64, true)),
        (Value::Integer(a), Value::Float(b)) => Ok((*a as f64, *b, false)),
        (Value::Float(a), Value::Integer(b)) => Ok((*a, *b as f64, false)),
        (Value::Float(a), Value::Float(b)) => Ok((*a, *b, false)),
        _ => Err(GarnetError::type_error(format!(
            "{} can't be coerced into {} for {op}",
            other.type_name(),
            recv.type_name()
        ))
        .into()),
    }
}

// =============================================================================
// Numeric Methods
// =============================================================================

fn num_add(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let other = arg(args, 0)?;
    if let (Value::Integer(a), Value::Integer(b)) = (&recv, &other) {
        return a
            .checked_add(*b)
            .map(Value::Integer)
            .ok_or_else(|| GarnetError::runtime("integer overflow in +").into());
    }
    let (a, b, _) = numeric_pair(&recv, &other, "+")?;
    Ok(Value::Float(a + b))
}

fn num_sub(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let other = arg(args, 0)?;
    if let (Value::Integer(a), Value::Integer(b)) = (&recv, &other) {
        return a
            .checked_sub(*b)
            .map(Value::Integer)
            .ok_or_else(|| GarnetError::runtime("integer overflow in -").into());
    }
    let (a, b, _) = numeric_pair(&recv, &other, "-")?;
    Ok(Value::Float(a - b))
}

fn num_mul(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let other = arg(args, 0)?;
    if let (Value::Integer(a), Value::Integer(b)) = (&recv, &other) {
        return a
            .checked_mul(*b)
            .map(Value::Integer)
            .ok_or_else(|| GarnetError::runtime("integer overflow in *").into());
    }
    let (a, b, _) = numeric_pair(&recv, &other, "*")?;
    Ok(Value::Float(a * b))
}

fn num_div(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let other = arg(args, 0)?;
    if let (Value::Integer(a), Value::Integer(b)) = (&recv, &other) {
        if *b == 0 {
            return Err(GarnetError::ZeroDivision.into());
        }
        return Ok(Value::Integer(floor_div(*a, *b)));
    }
    let (a, b, _) = numeric_pair(&recv, &other, "/")?;
    Ok(Value::Float(a / b))
}

fn num_mod(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let other = arg(args, 0)?;
    if let (Value::Integer(a), Value::Integer(b)) = (&recv, &other) {
        if *b == 0 {
            return Err(GarnetError::ZeroDivision.into());
        }
        return Ok(Value::Integer(floor_mod(*a, *b)));
    }
    let (a, b, _) = numeric_pair(&recv, &other, "%")?;
    Ok(Value::Float(a - b * (a / b).floor()))
}

/// Floored integer division (quotient rounds toward negative infinity).
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    if a % b != 0 && (a < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

/// Modulo with the sign of the divisor.
fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) {
        r + b
    } else {
        r
    }
}

fn num_lt(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let (a, b, _) = numeric_pair(&recv, &arg(args, 0)?, "<")?;
    Ok(Value::Bool(a < b))
}

fn num_le(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let (a, b, _) = numeric_pair(&recv, &arg(args, 0)?, "<=")?;
    Ok(Value::Bool(a <= b))
}

fn num_gt(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let (a, b, _) = numeric_pair(&recv, &arg(args, 0)?, ">")?;
    Ok(Value::Bool(a > b))
}

fn num_ge(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let (a, b, _) = numeric_pair(&recv, &arg(args, 0)?, ">=")?;
    Ok(Value::Bool(a >= b))
}

fn num_cmp(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let other = arg(args, 0)?;
    Ok(match recv.compare(&other) {
        Some(ord) => Value::Integer(ord as i64),
        None => Value::Nil,
    })
}

fn int_succ(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    match recv {
        Value::Integer(n) => Ok(Value::Integer(n + 1)),
        _ => Err(GarnetError::type_error("succ expects an Integer").into()),
    }
}

fn int_neg(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    match recv {
        Value::Integer(n) => Ok(Value::Integer(-n)),
        _ => Err(GarnetError::type_error("-@ expects an Integer").into()),
    }
}

fn int_bitand(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    match (recv, arg(args, 0)?) {
        (Value::Integer(a), Value::Integer(b)) => Ok(Value::Integer(a & b)),
        (recv, other) => {
            Err(GarnetError::type_error(format!(
                "no implicit conversion of {} into {}",
                other.type_name(),
                recv.type_name()
            ))
            .into())
        }
    }
}

fn int_bitor(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    match (recv, arg(args, 0)?) {
        (Value::Integer(a), Value::Integer(b)) => Ok(Value::Integer(a | b)),
        (recv, other) => {
            Err(GarnetError::type_error(format!(
                "no implicit conversion of {} into {}",
                other.type_name(),
                recv.type_name()
            ))
            .into())
        }
    }
}

fn int_shl(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    match (recv, arg(args, 0)?) {
        (Value::Integer(a), Value::Integer(b)) if (0..64).contains(&b) => {
            Ok(Value::Integer(a << b))
        }
        (Value::Integer(_), Value::Integer(_)) => {
            Err(GarnetError::argument("shift width out of range").into())
        }
        (recv, other) => {
            Err(GarnetError::type_error(format!(
                "no implicit conversion of {} into {}",
                other.type_name(),
                recv.type_name()
            ))
            .into())
        }
    }
}

// =============================================================================
// String Methods
// =============================================================================

fn string_payload(recv: &Value) -> VmResult<Rc<std::cell::RefCell<crate::value::RString>>> {
    match recv {
        Value::String(s) => Ok(Rc::clone(s)),
        _ => Err(GarnetError::type_error("receiver must be a String").into()),
    }
}

fn string_plus(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let s = string_payload(&recv)?;
    let other = arg(args, 0)?;
    let Some(tail) = other.as_string() else {
        return Err(GarnetError::type_error(format!(
            "no implicit conversion of {} into String",
            other.type_name()
        ))
        .into());
    };
    let mut result = s.borrow().content.clone();
    result.push_str(&tail);
    Ok(Value::string(result))
}

fn string_concat(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let s = string_payload(&recv)?;
    if s.borrow().frozen {
        return Err(GarnetError::frozen("String").into());
    }
    let other = arg(args, 0)?;
    let tail = other
        .as_string()
        .unwrap_or_else(|| other.to_display_string());
    s.borrow_mut().content.push_str(&tail);
    Ok(recv)
}

fn string_times(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let s = string_payload(&recv)?;
    match arg(args, 0)? {
        Value::Integer(n) if n >= 0 => Ok(Value::string(s.borrow().content.repeat(n as usize))),
        Value::Integer(_) => Err(GarnetError::argument("negative argument").into()),
        other => Err(GarnetError::type_error(format!(
            "no implicit conversion of {} into Integer",
            other.type_name()
        ))
        .into()),
    }
}

fn string_length(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    let s = string_payload(&recv)?;
    let len = s.borrow().content.chars().count();
    Ok(Value::Integer(len as i64))
}

fn string_empty(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    let s = string_payload(&recv)?;
    let empty = s.borrow().content.is_empty();
    Ok(Value::Bool(empty))
}

fn string_freeze(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    let s = string_payload(&recv)?;
    s.borrow_mut().frozen = true;
    Ok(recv)
}

/// `-@` answers a frozen string with the same content.
fn string_uminus(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    let s = string_payload(&recv)?;
    if s.borrow().frozen {
        return Ok(recv);
    }
    let content = s.borrow().content.clone();
    Ok(Value::frozen_string(content))
}

fn string_frozen(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    let s = string_payload(&recv)?;
    let frozen = s.borrow().frozen;
    Ok(Value::Bool(frozen))
}

fn string_to_sym(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    let s = string_payload(&recv)?;
    let sym = intern(&s.borrow().content);
    Ok(Value::Symbol(sym))
}

fn string_succ(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    let s = string_payload(&recv)?;
    let content = s.borrow().content.clone();
    // Minimal successor: bump the final character.
    let mut chars: Vec<char> = content.chars().collect();
    match chars.last().copied() {
        Some(c) => {
            let next = char::from_u32(c as u32 + 1).unwrap_or(c);
            *chars.last_mut().unwrap() = next;
            Ok(Value::string(chars.into_iter().collect::<String>()))
        }
        None => Ok(Value::string("")),
    }
}

fn string_match_op(vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let s = string_payload(&recv)?;
    match arg(args, 0)? {
        Value::Regexp(re) => {
            let content = s.borrow().content.clone();
            Ok(match match_against(vm, &re, &content) {
                Some(pos) => Value::Integer(pos as i64),
                None => Value::Nil,
            })
        }
        other => Err(GarnetError::type_error(format!(
            "wrong argument type {} (expected Regexp)",
            other.type_name()
        ))
        .into()),
    }
}

fn string_aref(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let s = string_payload(&recv)?;
    match arg(args, 0)? {
        Value::Integer(i) => {
            let content = s.borrow();
            let chars: Vec<char> = content.content.chars().collect();
            let index = if i < 0 { chars.len() as i64 + i } else { i };
            if index < 0 || index as usize >= chars.len() {
                return Ok(Value::Nil);
            }
            Ok(Value::string(chars[index as usize].to_string()))
        }
        other => Err(GarnetError::type_error(format!(
            "no implicit conversion of {} into Integer",
            other.type_name()
        ))
        .into()),
    }
}

fn symbol_length(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    match recv {
        Value::Symbol(s) => Ok(Value::Integer(s.as_str().chars().count() as i64)),
        _ => Err(GarnetError::type_error("receiver must be a Symbol").into()),
    }
}

// =============================================================================
// Regexp Methods
// =============================================================================

fn regexp_match_op(vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let Value::Regexp(re) = recv else {
        return Err(GarnetError::type_error("receiver must be a Regexp").into());
    };
    match arg(args, 0)? {
        Value::String(s) => {
            let content = s.borrow().content.clone();
            Ok(match match_against(vm, &re, &content) {
                Some(pos) => Value::Integer(pos as i64),
                None => Value::Nil,
            })
        }
        Value::Nil => {
            vm.set_backref(None);
            Ok(Value::Nil)
        }
        other => Err(GarnetError::type_error(format!(
            "no implicit conversion of {} into String",
            other.type_name()
        ))
        .into()),
    }
}

fn regexp_source(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    match recv {
        Value::Regexp(re) => Ok(Value::string(re.source.clone())),
        _ => Err(GarnetError::type_error("receiver must be a Regexp").into()),
    }
}

fn regexp_match_p(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let Value::Regexp(re) = recv else {
        return Err(GarnetError::type_error("receiver must be a Regexp").into());
    };
    match arg(args, 0)? {
        Value::String(s) => Ok(Value::Bool(re.regex.is_match(&s.borrow().content))),
        Value::Nil => Ok(Value::Bool(false)),
        other => Err(GarnetError::type_error(format!(
            "no implicit conversion of {} into String",
            other.type_name()
        ))
        .into()),
    }
}

// =============================================================================
// Array Methods
// =============================================================================

fn array_payload(recv: &Value) -> VmResult<Rc<std::cell::RefCell<Vec<Value>>>> {
    match recv {
        Value::Array(a) => Ok(Rc::clone(a)),
        _ => Err(GarnetError::type_error("receiver must be an Array").into()),
    }
}

fn array_length(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    let a = array_payload(&recv)?;
    let len = a.borrow().len();
    Ok(Value::Integer(len as i64))
}

fn array_empty(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    let a = array_payload(&recv)?;
    let empty = a.borrow().is_empty();
    Ok(Value::Bool(empty))
}

/// Select an extreme element by the built-in ordering.
pub(crate) fn extreme_of(values: &[Value], want_max: bool) -> VmResult<Value> {
    let mut iter = values.iter();
    let Some(first) = iter.next() else {
        return Ok(Value::Nil);
    };
    let mut best = first.clone();
    for value in iter {
        let ord = value
            .compare(&best)
            .ok_or_else(|| {
                GarnetError::argument(format!(
                    "comparison of {} with {} failed",
                    value.type_name(),
                    best.type_name()
                ))
            })?;
        let replace = if want_max {
            ord == std::cmp::Ordering::Greater
        } else {
            ord == std::cmp::Ordering::Less
        };
        if replace {
            best = value.clone();
        }
    }
    Ok(best)
}

fn array_max(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    let a = array_payload(&recv)?;
    let items = a.borrow().clone();
    extreme_of(&items, true)
}

fn array_min(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    let a = array_payload(&recv)?;
    let items = a.borrow().clone();
    extreme_of(&items, false)
}

fn array_aref(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let a = array_payload(&recv)?;
    match arg(args, 0)? {
        Value::Integer(i) => {
            let items = a.borrow();
            let index = if i < 0 { items.len() as i64 + i } else { i };
            if index < 0 {
                return Ok(Value::Nil);
            }
            Ok(items.get(index as usize).cloned().unwrap_or(Value::Nil))
        }
        other => Err(GarnetError::type_error(format!(
            "no implicit conversion of {} into Integer",
            other.type_name()
        ))
        .into()),
    }
}

fn array_aset(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let a = array_payload(&recv)?;
    let value = arg(args, 1)?;
    match arg(args, 0)? {
        Value::Integer(i) => {
            let mut items = a.borrow_mut();
            let index = if i < 0 { items.len() as i64 + i } else { i };
            if index < 0 {
                return Err(GarnetError::argument(format!("index {i} too small for array")).into());
            }
            let index = index as usize;
            if index >= items.len() {
                items.resize(index + 1, Value::Nil);
            }
            items[index] = value.clone();
            Ok(value)
        }
        other => Err(GarnetError::type_error(format!(
            "no implicit conversion of {} into Integer",
            other.type_name()
        ))
        .into()),
    }
}

fn array_push(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let a = array_payload(&recv)?;
    a.borrow_mut().push(arg(args, 0)?);
    Ok(recv)
}

fn array_plus(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let a = array_payload(&recv)?;
    let other = arg(args, 0)?;
    let b = array_payload(&other)?;
    let mut result = a.borrow().clone();
    result.extend(b.borrow().iter().cloned());
    Ok(Value::array(result))
}

fn array_first(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    let a = array_payload(&recv)?;
    let first = a.borrow().first().cloned();
    Ok(first.unwrap_or(Value::Nil))
}

fn array_last(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    let a = array_payload(&recv)?;
    let last = a.borrow().last().cloned();
    Ok(last.unwrap_or(Value::Nil))
}

fn array_each(vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let a = array_payload(&recv)?;
    let Some(block) = args.block.clone() else {
        return Err(GarnetError::local_jump("no block given (yield)").into());
    };
    let items = a.borrow().clone();
    for item in items {
        vm.run_block_frame(&block, &[item])?;
    }
    Ok(recv)
}

// =============================================================================
// Hash Methods
// =============================================================================

fn hash_payload(recv: &Value) -> VmResult<Rc<std::cell::RefCell<crate::value::RHash>>> {
    match recv {
        Value::Hash(h) => Ok(Rc::clone(h)),
        _ => Err(GarnetError::type_error("receiver must be a Hash").into()),
    }
}

fn hash_aref(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let h = hash_payload(&recv)?;
    let key = arg(args, 0)?;
    let value = h.borrow().get(&key).cloned();
    Ok(value.unwrap_or(Value::Nil))
}

fn hash_aset(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let h = hash_payload(&recv)?;
    let key = arg(args, 0)?;
    let value = arg(args, 1)?;
    h.borrow_mut().insert(key, value.clone());
    Ok(value)
}

fn hash_length(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    let h = hash_payload(&recv)?;
    let len = h.borrow().len();
    Ok(Value::Integer(len as i64))
}

fn hash_empty(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    let h = hash_payload(&recv)?;
    let empty = h.borrow().is_empty();
    Ok(Value::Bool(empty))
}

fn hash_key_p(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let h = hash_payload(&recv)?;
    let key = arg(args, 0)?;
    let has = h.borrow().contains_key(&key);
    Ok(Value::Bool(has))
}

// =============================================================================
// Class Methods
// =============================================================================

fn class_new(vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let Value::Class(class) = &recv else {
        return Err(GarnetError::type_error("receiver must be a Class").into());
    };
    if class.borrow().module {
        return Err(GarnetError::no_method("new", recv.inspect()).into());
    }
    let object = Value::Object(RObject::new(Rc::clone(class)));
    let initialize = intern("initialize");
    if let Some((Method::Iseq(m), owner)) = RClass::lookup(class, &initialize) {
        let forwarded = CallArgs {
            positional: args.positional.clone(),
            keywords: args.keywords.clone(),
            block: args.block.clone(),
        };
        vm.run_method_frame(initialize, owner, &m, object.clone(), forwarded)?;
    }
    Ok(object)
}

fn class_name(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    match recv {
        Value::Class(c) => Ok(Value::string(c.borrow().name.clone())),
        _ => Err(GarnetError::type_error("receiver must be a Class").into()),
    }
}

fn class_superclass(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    match recv {
        Value::Class(c) => Ok(c
            .borrow()
            .superclass
            .as_ref()
            .map_or(Value::Nil, |s| Value::Class(Rc::clone(s)))),
        _ => Err(GarnetError::type_error("receiver must be a Class").into()),
    }
}

// =============================================================================
// Proc Methods
// =============================================================================

fn proc_call(vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    match recv {
        Value::Proc(block) => vm.run_block_frame(&block, &args.positional),
        _ => Err(GarnetError::type_error("receiver must be a Proc").into()),
    }
}

// =============================================================================
// Object / Universal Methods
// =============================================================================

fn object_message(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    match recv {
        Value::Object(o) => {
            let message = o.borrow().ivars.get(&intern("@message")).cloned();
            Ok(message.unwrap_or_else(|| Value::string(o.borrow().class.borrow().name.clone())))
        }
        _ => Err(GarnetError::type_error("receiver must be an Object").into()),
    }
}

fn universal_eq(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    Ok(Value::Bool(recv.value_eq(&arg(args, 0)?)))
}

fn universal_neq(vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let eq = vm.call_method(recv, &intern("=="), CallArgs::positional([arg(args, 0)?]))?;
    Ok(Value::Bool(!eq.truthy()))
}

fn universal_not(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    Ok(Value::Bool(!recv.truthy()))
}

fn universal_nil_p(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    Ok(Value::Bool(recv.is_nil()))
}

fn universal_class(vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    Ok(Value::Class(vm.class_of(&recv)))
}

fn universal_to_s(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    Ok(Value::string(recv.to_display_string()))
}

fn universal_inspect(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    Ok(Value::string(recv.inspect()))
}

fn universal_frozen_p(_vm: &mut Vm, recv: Value, _args: &CallArgs) -> VmResult<Value> {
    let frozen = match &recv {
        Value::String(s) => s.borrow().frozen,
        Value::Nil
        | Value::Bool(_)
        | Value::Integer(_)
        | Value::Float(_)
        | Value::Symbol(_)
        | Value::FrozenCore => true,
        _ => false,
    };
    Ok(Value::Bool(frozen))
}

fn universal_equal_p(_vm: &mut Vm, recv: Value, args: &CallArgs) -> VmResult<Value> {
    let other = arg(args, 0)?;
    let identical = match (&recv, &other) {
        (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
        (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
        (Value::Hash(a), Value::Hash(b)) => Rc::ptr_eq(a, b),
        (Value::String(a), Value::String(b)) => Rc::ptr_eq(a, b),
        (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
        (Value::Proc(a), Value::Proc(b)) => Rc::ptr_eq(a, b),
        _ => recv == other,
    };
    Ok(Value::Bool(identical))
}

/// `raise` — build an exception value and start propagation.
fn universal_raise(vm: &mut Vm, _recv: Value, args: &CallArgs) -> VmResult<Value> {
    let exception = match args.positional.first() {
        None => vm.error_to_value(&GarnetError::runtime("unhandled exception")),
        Some(Value::String(s)) => {
            let message = s.borrow().content.clone();
            vm.error_to_value(&GarnetError::runtime(message))
        }
        Some(Value::Class(class)) => {
            let object = RObject::new(Rc::clone(class));
            let message = args
                .positional
                .get(1)
                .map_or_else(|| class.borrow().name.clone(), Value::to_display_string);
            object
                .borrow_mut()
                .ivars
                .insert(intern("@message"), Value::string(message));
            Value::Object(object)
        }
        Some(other) => other.clone(),
    };
    Err(Unwind::Throw {
        kind: ThrowKind::Raise,
        value: exception,
    })
}

// =============================================================================
// Frozen Core Methods
// =============================================================================

fn class_operand(value: &Value) -> VmResult<Rc<std::cell::RefCell<RClass>>> {
    match value {
        Value::Class(c) => Ok(Rc::clone(c)),
        other => Err(GarnetError::type_error(format!(
            "no class/module to operate on (got {})",
            other.type_name()
        ))
        .into()),
    }
}

fn symbol_operand(value: &Value) -> VmResult<Symbol> {
    value
        .as_symbol()
        .ok_or_else(|| GarnetError::type_error("expected a Symbol").into())
}

/// `core#set_method_alias(cbase, new_name, old_name)`
fn core_set_method_alias(vm: &mut Vm, _recv: Value, args: &CallArgs) -> VmResult<Value> {
    let class = class_operand(&arg(args, 0)?)?;
    let new_name = symbol_operand(&arg(args, 1)?)?;
    let old_name = symbol_operand(&arg(args, 2)?)?;

    let entry = RClass::lookup(&class, &old_name)
        .map(|(method, _)| method)
        .or_else(|| {
            vm.kind_for_class(&class)
                .and_then(|kind| vm.builtin_lookup(kind, &old_name))
                .map(Method::Native)
        })
        .ok_or_else(|| {
            GarnetError::name(format!(
                "undefined method '{old_name}' for class '{}'",
                class.borrow().name
            ))
        })?;
    class.borrow_mut().define_method(new_name, entry);
    Ok(Value::Nil)
}

/// `core#undef_method(cbase, name)`
fn core_undef_method(_vm: &mut Vm, _recv: Value, args: &CallArgs) -> VmResult<Value> {
    let class = class_operand(&arg(args, 0)?)?;
    let name = symbol_operand(&arg(args, 1)?)?;
    class.borrow_mut().define_method(name, Method::Undefined);
    Ok(Value::Nil)
}

/// `core#set_variable_alias(new_name, old_name)`
fn core_set_variable_alias(vm: &mut Vm, _recv: Value, args: &CallArgs) -> VmResult<Value> {
    let new_name = symbol_operand(&arg(args, 0)?)?;
    let old_name = symbol_operand(&arg(args, 1)?)?;
    vm.alias_global(new_name, old_name);
    Ok(Value::Nil)
}

/// `core#hash_merge_ptr(hash, k1, v1, k2, v2, ...)`
fn core_hash_merge_ptr(_vm: &mut Vm, _recv: Value, args: &CallArgs) -> VmResult<Value> {
    let hash = arg(args, 0)?;
    let h = hash_payload(&hash)?;
    let pairs = &args.positional[1..];
    if pairs.len() % 2 != 0 {
        return Err(GarnetError::argument("odd number of arguments for hash merge").into());
    }
    for pair in pairs.chunks_exact(2) {
        h.borrow_mut().insert(pair[0].clone(), pair[1].clone());
    }
    Ok(hash)
}

/// `core#hash_merge_kwd(hash, other)`
fn core_hash_merge_kwd(_vm: &mut Vm, _recv: Value, args: &CallArgs) -> VmResult<Value> {
    let hash = arg(args, 0)?;
    let h = hash_payload(&hash)?;
    let other = arg(args, 1)?;
    let o = hash_payload(&other)?;
    for (k, v) in o.borrow().iter() {
        h.borrow_mut().insert(k.clone(), v.clone());
    }
    Ok(hash)
}
