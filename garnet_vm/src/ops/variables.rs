//! Variable access handlers: locals, block parameters, instance and class
//! variables, globals, constants, and special-variable slots.

use crate::rclass::RClass;
use crate::value::Value;
use crate::vm::{Vm, VmResult};
use garnet_core::intern::Symbol;
use garnet_core::GarnetError;
use std::cell::RefCell;
use std::rc::Rc;

// =============================================================================
// Locals
// =============================================================================

/// getlocal: read a local `level` lexical frames up.
pub fn getlocal(vm: &mut Vm, index: usize, level: usize) -> VmResult<()> {
    let value = vm.local_get(index, level)?;
    vm.push(value);
    Ok(())
}

/// setlocal: pop and write a local `level` lexical frames up.
pub fn setlocal(vm: &mut Vm, index: usize, level: usize) -> VmResult<()> {
    let value = vm.pop()?;
    vm.local_set(index, level, value)
}

// =============================================================================
// Block Parameters
// =============================================================================

fn materialize_block(vm: &Vm) -> Value {
    match vm.frame_yield() {
        Some(block) => Value::Proc(block),
        None => Value::Nil,
    }
}

/// getblockparam: read the block-parameter local, materializing the block
/// into it on first access.
pub fn getblockparam(vm: &mut Vm, index: usize, level: usize) -> VmResult<()> {
    let current = vm.local_get(index, level)?;
    if !current.is_nil() {
        vm.push(current);
        return Ok(());
    }
    let materialized = materialize_block(vm);
    vm.local_set(index, level, materialized.clone())?;
    vm.push(materialized);
    Ok(())
}

/// getblockparamproxy: like getblockparam, but pushes a callable wrapper
/// without writing the local back, so the block is not forced to
/// materialize in the frame.
pub fn getblockparamproxy(vm: &mut Vm, index: usize, level: usize) -> VmResult<()> {
    let current = vm.local_get(index, level)?;
    if !current.is_nil() {
        vm.push(current);
        return Ok(());
    }
    vm.push(materialize_block(vm));
    Ok(())
}

/// setblockparam: pop and overwrite the block-parameter local.
pub fn setblockparam(vm: &mut Vm, index: usize, level: usize) -> VmResult<()> {
    setlocal(vm, index, level)
}

// =============================================================================
// Instance Variables
// =============================================================================

/// getinstancevariable: read instance state of the current `self`.
pub fn getinstancevariable(vm: &mut Vm, name: &Symbol) -> VmResult<()> {
    let value = match vm.self_value() {
        Value::Object(o) => o.borrow().ivars.get(name).cloned(),
        Value::Class(c) => c.borrow().ivars.get(name).cloned(),
        _ => None,
    };
    vm.push(value.unwrap_or(Value::Nil));
    Ok(())
}

/// setinstancevariable: pop and write instance state of the current
/// `self`.
pub fn setinstancevariable(vm: &mut Vm, name: &Symbol) -> VmResult<()> {
    let value = vm.pop()?;
    match vm.self_value() {
        Value::Object(o) => {
            o.borrow_mut().ivars.insert(name.clone(), value);
            Ok(())
        }
        Value::Class(c) => {
            c.borrow_mut().ivars.insert(name.clone(), value);
            Ok(())
        }
        other => Err(GarnetError::frozen(other.type_name()).into()),
    }
}

// =============================================================================
// Class Variables
// =============================================================================

fn cvar_scope(vm: &Vm) -> Rc<RefCell<RClass>> {
    match vm.self_value() {
        Value::Class(c) => c,
        other => vm.class_of(&other),
    }
}

/// getclassvariable: walk upward from the current scope's class.
pub fn getclassvariable(vm: &mut Vm, name: &Symbol) -> VmResult<()> {
    let mut current = Some(cvar_scope(vm));
    while let Some(class) = current {
        if let Some(value) = class.borrow().cvars.get(name).cloned() {
            vm.push(value);
            return Ok(());
        }
        current = class.borrow().superclass.clone();
    }
    Err(GarnetError::name(format!(
        "uninitialized class variable {name} in {}",
        cvar_scope(vm).borrow().name
    ))
    .into())
}

/// setclassvariable: pop and write, reusing the defining ancestor's slot
/// when one exists.
pub fn setclassvariable(vm: &mut Vm, name: &Symbol) -> VmResult<()> {
    let value = vm.pop()?;
    let start = cvar_scope(vm);
    let mut current = Some(Rc::clone(&start));
    while let Some(class) = current {
        if class.borrow().cvars.contains_key(name) {
            class.borrow_mut().cvars.insert(name.clone(), value);
            return Ok(());
        }
        current = class.borrow().superclass.clone();
    }
    start.borrow_mut().cvars.insert(name.clone(), value);
    Ok(())
}

// =============================================================================
// Globals
// =============================================================================

/// getglobal: read a global through the first-class global table.
pub fn getglobal(vm: &mut Vm, name: &Symbol) -> VmResult<()> {
    let value = vm.global_get(name);
    vm.push(value);
    Ok(())
}

/// setglobal: pop and write a global.
pub fn setglobal(vm: &mut Vm, name: &Symbol) -> VmResult<()> {
    let value = vm.pop()?;
    vm.global_set(name, value);
    Ok(())
}

// =============================================================================
// Constants
// =============================================================================

/// getconstant: pop (const_base, allow_nil) and search.
///
/// A nil base with the allow flag searches the lexical nesting outward;
/// a class base searches that class and its ancestors.
pub fn getconstant(vm: &mut Vm, name: &Symbol) -> VmResult<()> {
    let allow_nil = vm.pop()?;
    let base = vm.pop()?;
    let found = match &base {
        Value::Nil if allow_nil.truthy() => vm.search_constant(name),
        Value::Nil => None,
        Value::Class(class) => Vm::constant_in_ancestors(class, name),
        other => {
            return Err(GarnetError::type_error(format!(
                "{} is not a class/module",
                other.inspect()
            ))
            .into())
        }
    };
    match found {
        Some(value) => {
            vm.push(value);
            Ok(())
        }
        None => {
            let qualified = match &base {
                Value::Class(class) => format!("{}::{name}", class.borrow().name),
                _ => name.to_string(),
            };
            Err(GarnetError::uninitialized_constant(&qualified).into())
        }
    }
}

/// setconstant: pop (value, parent) and assign.
pub fn setconstant(vm: &mut Vm, name: &Symbol) -> VmResult<()> {
    let parent = vm.pop()?;
    let value = vm.pop()?;
    match parent {
        Value::Class(class) => {
            class.borrow_mut().constants.insert(name.clone(), value);
            Ok(())
        }
        other => Err(GarnetError::type_error(format!(
            "{} is not a class/module",
            other.inspect()
        ))
        .into()),
    }
}

/// opt_getconstant_path: resolve a dotted constant path. An empty leading
/// name roots the search at the top-level namespace.
pub fn getconstant_path(vm: &mut Vm, names: &[Symbol]) -> VmResult<()> {
    let mut names = names.iter();
    let Some(first) = names.next() else {
        return Err(GarnetError::internal("empty constant path").into());
    };

    let mut current = if first.is_empty() {
        let name = names
            .next()
            .ok_or_else(|| GarnetError::internal("constant path ends at its root"))?;
        Vm::constant_in_ancestors(&vm.core.object, name)
            .ok_or_else(|| GarnetError::uninitialized_constant(name.as_str()))?
    } else {
        vm.search_constant(first)
            .ok_or_else(|| GarnetError::uninitialized_constant(first.as_str()))?
    };

    for name in names {
        let Value::Class(class) = &current else {
            return Err(GarnetError::type_error(format!(
                "{} is not a class/module",
                current.inspect()
            ))
            .into());
        };
        let qualified = format!("{}::{name}", class.borrow().name);
        current = Vm::constant_in_ancestors(class, name)
            .ok_or_else(|| GarnetError::uninitialized_constant(&qualified))?;
    }
    vm.push(current);
    Ok(())
}

// =============================================================================
// Special Variables
// =============================================================================

/// getspecial: read a special-variable slot.
///
/// Key 0 is the last-line slot, key 1 the backreference (with the type
/// operand selecting the view), keys 2+ are flip-flop slots.
pub fn getspecial(vm: &mut Vm, key: usize, svar_type: usize) -> VmResult<()> {
    let svars = vm.frame_svar();
    let value = match key {
        0 => svars.borrow().lastline.clone(),
        1 => {
            let svars = svars.borrow();
            match &svars.backref {
                None => Value::Nil,
                Some(backref) => {
                    if svar_type == 0 {
                        // Whole-match view of $~.
                        Value::string(backref.full.clone())
                    } else if svar_type % 2 == 1 {
                        match (svar_type >> 1) as u8 {
                            b'&' => Value::string(backref.full.clone()),
                            b'`' => Value::string(backref.pre.clone()),
                            b'\'' => Value::string(backref.post.clone()),
                            b'+' => backref
                                .captures
                                .iter()
                                .skip(1)
                                .rev()
                                .find_map(|c| c.clone())
                                .map_or(Value::Nil, Value::string),
                            _ => Value::Nil,
                        }
                    } else {
                        let nth = svar_type >> 1;
                        backref
                            .captures
                            .get(nth)
                            .and_then(Clone::clone)
                            .map_or(Value::Nil, Value::string)
                    }
                }
            }
        }
        slot => Value::Bool(svars.borrow().flipflop(slot - 2)),
    };
    vm.push(value);
    Ok(())
}

/// setspecial: pop and write a special-variable slot (flip-flop state for
/// keys 2+).
pub fn setspecial(vm: &mut Vm, key: usize) -> VmResult<()> {
    let value = vm.pop()?;
    let svars = vm.frame_svar();
    match key {
        0 => svars.borrow_mut().lastline = value,
        1 => {
            // The backref slot is written through pattern matches, not
            // setspecial; writing it directly clears the match.
            svars.borrow_mut().backref = None;
        }
        slot => svars.borrow_mut().set_flipflop(slot - 2, value.truthy()),
    }
    Ok(())
}
