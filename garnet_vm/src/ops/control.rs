//! Control-flow handlers.

use crate::iseq::Label;
use crate::value::Value;
use crate::vm::{ThrowKind, Unwind, Vm, VmResult};
use garnet_core::GarnetError;
use tracing::trace;

/// jump: unconditional transfer.
pub fn jump(vm: &mut Vm, label: &Label) -> VmResult<()> {
    vm.jump(label)
}

/// branchif: pop and transfer when truthy.
pub fn branchif(vm: &mut Vm, label: &Label) -> VmResult<()> {
    if vm.pop()?.truthy() {
        vm.jump(label)?;
    }
    Ok(())
}

/// branchunless: pop and transfer when falsy.
pub fn branchunless(vm: &mut Vm, label: &Label) -> VmResult<()> {
    if !vm.pop()?.truthy() {
        vm.jump(label)?;
    }
    Ok(())
}

/// branchnil: pop and transfer when nil.
pub fn branchnil(vm: &mut Vm, label: &Label) -> VmResult<()> {
    if vm.pop()?.is_nil() {
        vm.jump(label)?;
    }
    Ok(())
}

/// opt_case_dispatch: pop and transfer through the dispatch table, or to
/// the else label on a miss. Keys are literals known at compile time, so
/// lookup is by (numeric-aware) equality.
pub fn case_dispatch(vm: &mut Vm, table: &[(Value, Label)], else_label: &Label) -> VmResult<()> {
    let value = vm.pop()?;
    for (key, label) in table {
        if key.value_eq(&value) {
            return vm.jump(label);
        }
    }
    vm.jump(else_label)
}

/// leave: pop the return value and finish the frame.
pub fn leave(vm: &mut Vm) -> VmResult<()> {
    let value = vm.pop()?;
    vm.leave(value);
    Ok(())
}

/// throw: pop the throw value and start non-local unwinding.
pub fn throw(vm: &mut Vm, tag: usize) -> VmResult<()> {
    let value = vm.pop()?;
    let kind = ThrowKind::from_tag(tag)
        .ok_or_else(|| GarnetError::internal(format!("unknown throw tag {tag}")))?;
    trace!(kind = kind.as_str(), "throw");
    Err(Unwind::Throw { kind, value })
}
