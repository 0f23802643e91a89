//! Array and hash handlers.

use crate::builtins::extreme_of;
use crate::value::Value;
use crate::vm::{Vm, VmResult};
use garnet_core::GarnetError;

/// newarray: build an array from the top `n` slots.
pub fn newarray(vm: &mut Vm, count: usize) -> VmResult<()> {
    let items = vm.pop_n(count)?;
    vm.push(Value::array(items));
    Ok(())
}

/// newarraykwsplat: like newarray; the trailing keyword-splat hash has
/// already been materialized as the last element.
pub fn newarraykwsplat(vm: &mut Vm, count: usize) -> VmResult<()> {
    newarray(vm, count)
}

/// newhash: build a hash from `n` consecutive (key, value) slots.
pub fn newhash(vm: &mut Vm, count: usize) -> VmResult<()> {
    if count % 2 != 0 {
        return Err(GarnetError::internal("newhash requires an even operand").into());
    }
    let items = vm.pop_n(count)?;
    let pairs = items
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    vm.push(Value::hash(pairs));
    Ok(())
}

/// Splat view of a value: array contents, or a one-element vector. No
/// `to_a` conversion is attempted.
fn splat_contents(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.borrow().clone(),
        other => vec![other.clone()],
    }
}

/// concatarray: pop (left, right), push `[*left, *right]`.
pub fn concatarray(vm: &mut Vm) -> VmResult<()> {
    let right = vm.pop()?;
    let left = vm.pop()?;
    let mut result = splat_contents(&left);
    result.extend(splat_contents(&right));
    vm.push(Value::array(result));
    Ok(())
}

/// splatarray: pop and coerce to an array; with the flag set push a
/// shallow copy, otherwise push the original array.
pub fn splatarray(vm: &mut Vm, flag: bool) -> VmResult<()> {
    let value = vm.pop()?;
    let result = match &value {
        Value::Array(items) => {
            if flag {
                Value::array(items.borrow().clone())
            } else {
                value.clone()
            }
        }
        other => Value::array(vec![other.clone()]),
    };
    vm.push(result);
    Ok(())
}

/// expandarray: pop an array and spread `n` of its elements onto the
/// stack.
///
/// Without the post flag the elements land so the first element is on
/// top, nil-padded when the source is short; bit 0 pushes the remainder
/// array deepest. With the post flag (bit 1) elements are taken from the
/// tail, nils land on top, and the remainder holds the untouched head.
pub fn expandarray(vm: &mut Vm, count: usize, flags: u8) -> VmResult<()> {
    let value = vm.pop()?;
    let items = splat_contents(&value);
    let len = items.len();
    let splat = flags & 0x01 != 0;
    let post = flags & 0x02 != 0;

    if post {
        let take = count.min(len);
        if splat {
            vm.push(Value::array(items[..len - take].to_vec()));
        }
        for item in &items[len - take..] {
            vm.push(item.clone());
        }
        for _ in take..count {
            vm.push(Value::Nil);
        }
    } else {
        if splat {
            let rest = if count >= len {
                Vec::new()
            } else {
                items[count..].to_vec()
            };
            vm.push(Value::array(rest));
        }
        for i in (0..count).rev() {
            vm.push(items.get(i).cloned().unwrap_or(Value::Nil));
        }
    }
    Ok(())
}

/// opt_newarray_max: pop `n` values, push the maximum.
pub fn newarray_max(vm: &mut Vm, count: usize) -> VmResult<()> {
    let items = vm.pop_n(count)?;
    let result = extreme_of(&items, true)?;
    vm.push(result);
    Ok(())
}

/// opt_newarray_min: pop `n` values, push the minimum.
pub fn newarray_min(vm: &mut Vm, count: usize) -> VmResult<()> {
    let items = vm.pop_n(count)?;
    let result = extreme_of(&items, false)?;
    vm.push(result);
    Ok(())
}
