//! Constant and literal handlers.

use crate::insn::SpecialObject;
use crate::value::Value;
use crate::vm::{Vm, VmResult};

/// putnil: push nil.
pub fn putnil(vm: &mut Vm) -> VmResult<()> {
    vm.push(Value::Nil);
    Ok(())
}

/// putself: push the current `self`.
pub fn putself(vm: &mut Vm) -> VmResult<()> {
    let value = vm.self_value();
    vm.push(value);
    Ok(())
}

/// putobject: push the literal operand. The literal is shared, never
/// copied; string literals that reach this instruction are frozen.
pub fn putobject(vm: &mut Vm, object: &Value) -> VmResult<()> {
    vm.push(object.clone());
    Ok(())
}

/// putstring: push a fresh, mutable copy of the literal.
pub fn putstring(vm: &mut Vm, string: &str) -> VmResult<()> {
    vm.push(Value::string(string));
    Ok(())
}

/// duparray: push a shallow copy of the literal array.
pub fn duparray(vm: &mut Vm, array: &Value) -> VmResult<()> {
    match array {
        Value::Array(items) => {
            vm.push(Value::array(items.borrow().clone()));
            Ok(())
        }
        other => {
            vm.push(other.clone());
            Ok(())
        }
    }
}

/// duphash: push a shallow copy of the literal hash.
pub fn duphash(vm: &mut Vm, hash: &Value) -> VmResult<()> {
    match hash {
        Value::Hash(map) => {
            let copy = map.borrow().clone();
            vm.push(Value::Hash(std::rc::Rc::new(std::cell::RefCell::new(copy))));
            Ok(())
        }
        other => {
            vm.push(other.clone());
            Ok(())
        }
    }
}

/// putspecialobject: push one of the three ambient references.
pub fn putspecialobject(vm: &mut Vm, kind: SpecialObject) -> VmResult<()> {
    let value = match kind {
        SpecialObject::VmCore => vm.frozen_core(),
        SpecialObject::CBase => vm.cbase(),
        SpecialObject::ConstBase => vm.const_base(),
    };
    vm.push(value);
    Ok(())
}
