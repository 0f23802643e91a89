//! Specialized arithmetic and comparison handlers.
//!
//! Every `opt_*` specialization has the semantics of its canonical send;
//! the integer pairs get a direct fast path and everything else falls
//! through to method dispatch, so the observable effect is identical
//! either way.

use crate::ops::calls;
use crate::value::Value;
use crate::vm::{CallArgs, Vm, VmResult};
use garnet_core::CallData;

/// Fast path for integer/integer operands of the hot binary selectors.
/// Returns `None` when dispatch must take over.
fn integer_fast_path(method: &str, a: i64, b: i64) -> Option<Value> {
    Some(match method {
        "+" => Value::Integer(a.checked_add(b)?),
        "-" => Value::Integer(a.checked_sub(b)?),
        "*" => Value::Integer(a.checked_mul(b)?),
        "<" => Value::Bool(a < b),
        "<=" => Value::Bool(a <= b),
        ">" => Value::Bool(a > b),
        ">=" => Value::Bool(a >= b),
        "==" => Value::Bool(a == b),
        _ => return None,
    })
}

/// Shared body of the two-operand specializations (`opt_plus`,
/// `opt_lt`, `opt_aref`, `opt_ltlt`, `opt_regexpmatch2`, ...).
pub fn binary(vm: &mut Vm, calldata: &CallData) -> VmResult<()> {
    if let (Ok(b), Ok(a)) = (vm.peek_at(0), vm.peek_at(1)) {
        if let (Value::Integer(a), Value::Integer(b)) = (&a, &b) {
            if let Some(result) = integer_fast_path(calldata.method().as_str(), *a, *b) {
                vm.pop_n(2)?;
                vm.push(result);
                return Ok(());
            }
        }
    }
    calls::send(vm, calldata, None)
}

/// Shared body of the one-operand specializations (`opt_succ`,
/// `opt_not`, `opt_length`, `opt_size`, `opt_empty_p`, `opt_nil_p`, ...).
pub fn unary(vm: &mut Vm, calldata: &CallData) -> VmResult<()> {
    calls::send(vm, calldata, None)
}

/// opt_aset: three-operand specialization of `[]=`.
pub fn aset(vm: &mut Vm, calldata: &CallData) -> VmResult<()> {
    calls::send(vm, calldata, None)
}

/// opt_neq: the boolean complement of equality between the top two
/// operands.
pub fn neq(vm: &mut Vm, eq_calldata: &CallData) -> VmResult<()> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    let eq = vm.call_method(a, eq_calldata.method(), CallArgs::positional([b]))?;
    vm.push(Value::Bool(!eq.truthy()));
    Ok(())
}

/// opt_aref_with: `[]` with a literal string key baked in.
pub fn aref_with(vm: &mut Vm, key: &str, calldata: &CallData) -> VmResult<()> {
    let recv = vm.pop()?;
    let result = vm.call_method(
        recv,
        calldata.method(),
        CallArgs::positional([Value::frozen_string(key)]),
    )?;
    vm.push(result);
    Ok(())
}

/// opt_aset_with: `[]=` with a literal string key baked in. Pops the
/// receiver and the value.
pub fn aset_with(vm: &mut Vm, key: &str, calldata: &CallData) -> VmResult<()> {
    let value = vm.pop()?;
    let recv = vm.pop()?;
    let result = vm.call_method(
        recv,
        calldata.method(),
        CallArgs::positional([Value::frozen_string(key), value]),
    )?;
    vm.push(result);
    Ok(())
}

/// opt_str_freeze: push the frozen form of a literal string.
pub fn str_freeze(vm: &mut Vm, string: &str) -> VmResult<()> {
    vm.push(Value::frozen_string(string));
    Ok(())
}

/// opt_str_uminus: push the deduplicated (frozen) form of a literal
/// string.
pub fn str_uminus(vm: &mut Vm, string: &str) -> VmResult<()> {
    vm.push(Value::frozen_string(string));
    Ok(())
}
