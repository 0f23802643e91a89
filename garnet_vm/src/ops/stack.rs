//! Stack manipulation handlers.

use crate::vm::{Vm, VmResult};

/// pop: discard the top of stack.
pub fn pop(vm: &mut Vm) -> VmResult<()> {
    vm.pop()?;
    Ok(())
}

/// dup: duplicate the top of stack (shallow).
pub fn dup(vm: &mut Vm) -> VmResult<()> {
    let value = vm.peek()?.clone();
    vm.push(value);
    Ok(())
}

/// dupn: duplicate the top `n` elements as a block, preserving order.
pub fn dupn(vm: &mut Vm, count: usize) -> VmResult<()> {
    let mut copies = Vec::with_capacity(count);
    for i in (0..count).rev() {
        copies.push(vm.peek_at(i)?);
    }
    for value in copies {
        vm.push(value);
    }
    Ok(())
}

/// swap: exchange the top two elements.
pub fn swap(vm: &mut Vm) -> VmResult<()> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    vm.push(b);
    vm.push(a);
    Ok(())
}

/// topn: push a copy of the element `n` slots below the top.
pub fn topn(vm: &mut Vm, count: usize) -> VmResult<()> {
    let value = vm.peek_at(count)?;
    vm.push(value);
    Ok(())
}

/// setn: overwrite the element `n` slots below the top with a copy of the
/// top (the top itself stays).
pub fn setn(vm: &mut Vm, count: usize) -> VmResult<()> {
    let value = vm.peek()?.clone();
    vm.set_at(count, value)
}

/// adjuststack: drop `n` elements.
pub fn adjuststack(vm: &mut Vm, count: usize) -> VmResult<()> {
    vm.pop_n(count)?;
    Ok(())
}
