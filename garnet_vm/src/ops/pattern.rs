//! Pattern classification handlers: checkmatch, checktype, checkkeyword,
//! and defined.

use crate::insn::{CheckMatchKind, CheckTypeKind, DefinedKind};
use crate::rclass::RClass;
use crate::value::Value;
use crate::vm::{Vm, VmResult};
use garnet_core::GarnetError;

/// checkmatch: pop (target, pattern) and push the match result.
///
/// `when`/`case` use case-equality; `rescue` requires class or module
/// patterns and tests exception ancestry. The array flag splats the
/// pattern and matches any element.
pub fn checkmatch(vm: &mut Vm, kind: CheckMatchKind, array: bool) -> VmResult<()> {
    let pattern = vm.pop()?;
    let target = vm.pop()?;

    let patterns: Vec<Value> = if array {
        match &pattern {
            Value::Array(items) => items.borrow().clone(),
            other => vec![other.clone()],
        }
    } else {
        vec![pattern]
    };

    let mut matched = false;
    for pattern in &patterns {
        let hit = match kind {
            CheckMatchKind::When | CheckMatchKind::Case => vm.case_equal(pattern, &target)?,
            CheckMatchKind::Rescue => {
                let Value::Class(class) = pattern else {
                    return Err(GarnetError::type_error(
                        "class or module required for rescue clause",
                    )
                    .into());
                };
                RClass::is_ancestor_of(class, &vm.class_of(&target))
            }
        };
        if hit {
            matched = true;
            break;
        }
    }
    vm.push(Value::Bool(matched));
    Ok(())
}

/// checktype: pop an object and push whether it belongs to the given
/// primitive type. Tags with no representation in this value domain
/// (struct, file, bignum, ...) answer false.
pub fn checktype(vm: &mut Vm, kind: CheckTypeKind) -> VmResult<()> {
    let value = vm.pop()?;
    let result = match kind {
        CheckTypeKind::Object => matches!(value, Value::Object(_)),
        CheckTypeKind::Class => matches!(&value, Value::Class(c) if !c.borrow().module),
        CheckTypeKind::Module => matches!(&value, Value::Class(c) if c.borrow().module),
        CheckTypeKind::Float => matches!(value, Value::Float(_)),
        CheckTypeKind::String => matches!(value, Value::String(_)),
        CheckTypeKind::Regexp => matches!(value, Value::Regexp(_)),
        CheckTypeKind::Array => matches!(value, Value::Array(_)),
        CheckTypeKind::Hash => matches!(value, Value::Hash(_)),
        CheckTypeKind::Nil => value.is_nil(),
        CheckTypeKind::True => matches!(value, Value::Bool(true)),
        CheckTypeKind::False => matches!(value, Value::Bool(false)),
        CheckTypeKind::Symbol => matches!(value, Value::Symbol(_)),
        CheckTypeKind::Fixnum => matches!(value, Value::Integer(_)),
        CheckTypeKind::Struct
        | CheckTypeKind::Bignum
        | CheckTypeKind::File
        | CheckTypeKind::Data
        | CheckTypeKind::Match
        | CheckTypeKind::Complex
        | CheckTypeKind::Rational
        | CheckTypeKind::Undef => false,
    };
    vm.push(Value::Bool(result));
    Ok(())
}

/// checkkeyword: inspect the keyword-presence bitmap local and push
/// whether the keyword at `keyword_index` was supplied by the caller.
pub fn checkkeyword(vm: &mut Vm, bits_index: usize, keyword_index: usize) -> VmResult<()> {
    let bits = vm.local_get(bits_index, 0)?;
    let Some(bits) = bits.as_integer() else {
        return Err(GarnetError::internal("keyword bitmap local is not an integer").into());
    };
    vm.push(Value::Bool(bits & (1 << keyword_index) != 0));
    Ok(())
}

/// defined: classify whether `name` is defined in the role `kind`. Pops
/// its operand (whose meaning depends on the kind) and pushes the message
/// on success, nil on failure.
pub fn defined(vm: &mut Vm, kind: DefinedKind, name: &Value, message: &Value) -> VmResult<()> {
    let operand = vm.pop()?;

    let is_defined = match kind {
        DefinedKind::Nil
        | DefinedKind::Lvar
        | DefinedKind::Self_
        | DefinedKind::True
        | DefinedKind::False
        | DefinedKind::Asgn
        | DefinedKind::Expr => true,
        DefinedKind::IVar => {
            let Some(name) = name.as_symbol() else {
                return Err(GarnetError::internal("defined ivar name must be a symbol").into());
            };
            match vm.self_value() {
                Value::Object(o) => o.borrow().ivars.contains_key(&name),
                Value::Class(c) => c.borrow().ivars.contains_key(&name),
                _ => false,
            }
        }
        DefinedKind::Gvar => match name.as_symbol() {
            Some(name) => vm.global_defined(&name),
            None => false,
        },
        DefinedKind::CVar => match name.as_symbol() {
            Some(name) => {
                let mut current = Some(match vm.self_value() {
                    Value::Class(c) => c,
                    other => vm.class_of(&other),
                });
                let mut found = false;
                while let Some(class) = current {
                    if class.borrow().cvars.contains_key(&name) {
                        found = true;
                        break;
                    }
                    current = class.borrow().superclass.clone();
                }
                found
            }
            None => false,
        },
        DefinedKind::Const => match name.as_symbol() {
            Some(name) => match &operand {
                Value::Class(class) => Vm::constant_in_ancestors(class, &name).is_some(),
                _ => vm.search_constant(&name).is_some(),
            },
            None => false,
        },
        DefinedKind::ConstFrom => match (name.as_symbol(), &operand) {
            (Some(name), Value::Class(class)) => {
                Vm::constant_in_ancestors(class, &name).is_some()
            }
            _ => false,
        },
        DefinedKind::Method | DefinedKind::Func => match name.as_symbol() {
            Some(name) => {
                let receiver = if operand.is_nil() {
                    vm.self_value()
                } else {
                    operand.clone()
                };
                vm.method_defined(&receiver, &name)
            }
            None => false,
        },
        DefinedKind::Yield => vm.frame_yield().is_some(),
        DefinedKind::ZSuper => match vm.frame().owner.clone() {
            Some((name, owner)) => vm.resolve_super_method(&owner, &name).is_some(),
            None => false,
        },
        DefinedKind::Ref => {
            let svars = vm.frame_svar();
            let svars = svars.borrow();
            match (&svars.backref, name) {
                (None, _) => false,
                (Some(backref), Value::Integer(n)) => backref
                    .captures
                    .get(*n as usize)
                    .is_some_and(Option::is_some),
                (Some(_), _) => true,
            }
        }
    };

    vm.push(if is_defined {
        message.clone()
    } else {
        Value::Nil
    });
    Ok(())
}
