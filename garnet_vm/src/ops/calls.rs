//! Call and definition handlers: send, block/super invocation, class and
//! method definition, and the once latch.

use crate::frame::Block;
use crate::insn::OnceCache;
use crate::iseq::Iseq;
use crate::rclass::{IseqMethod, Method, RClass, RObject};
use crate::value::Value;
use crate::vm::{CallArgs, Vm, VmResult};
use garnet_core::calldata::{CALL_ARGS_BLOCKARG, CALL_ARGS_SPLAT};
use garnet_core::intern::Symbol;
use garnet_core::{CallData, GarnetError};
use smallvec::SmallVec;
use std::rc::Rc;

/// Type bits of the `defineclass` flags operand.
const DEFINECLASS_TYPE_MASK: u32 = 0x07;
/// defineclass type: ordinary class.
const DEFINECLASS_CLASS: u32 = 0;
/// defineclass type: singleton class (`class << obj`).
const DEFINECLASS_SINGLETON: u32 = 1;
/// defineclass type: module.
const DEFINECLASS_MODULE: u32 = 2;
/// defineclass flag: the superclass operand is meaningful.
const DEFINECLASS_HAS_SUPERCLASS: u32 = 0x10;

/// Pop a call site's stack arguments per its calldata: block argument
/// first (topmost), then keyword values, then positionals, then the
/// receiver.
fn pop_call_site(
    vm: &mut Vm,
    calldata: &CallData,
    block_iseq: Option<&Rc<Iseq>>,
) -> VmResult<(Value, CallArgs)> {
    let block_arg = if calldata.has_flag(CALL_ARGS_BLOCKARG) {
        Some(vm.pop()?)
    } else {
        None
    };

    let keywords = match calldata.kw_arg() {
        Some(names) => {
            let values = vm.pop_n(names.len())?;
            names.iter().cloned().zip(values).collect()
        }
        None => Vec::new(),
    };

    let mut positional = vm.pop_n(calldata.argc() as usize)?;
    if calldata.has_flag(CALL_ARGS_SPLAT) {
        if let Some(last) = positional.pop() {
            match last {
                Value::Array(items) => positional.extend(items.borrow().iter().cloned()),
                other => positional.push(other),
            }
        }
    }

    let recv = vm.pop()?;

    let block = match block_iseq {
        Some(iseq) => {
            let frame = vm.frame();
            Some(Rc::new(Block {
                iseq: Rc::clone(iseq),
                env: Rc::clone(&frame.env),
                self_value: frame.self_value.clone(),
                nesting: frame.nesting.clone(),
                svars: Rc::clone(&frame.svars),
            }))
        }
        None => match block_arg {
            Some(Value::Proc(block)) => Some(block),
            Some(Value::Nil) | None => None,
            Some(other) => {
                return Err(GarnetError::type_error(format!(
                    "wrong argument type {} (expected Proc)",
                    other.type_name()
                ))
                .into())
            }
        },
    };

    Ok((
        recv,
        CallArgs {
            positional: SmallVec::from_vec(positional),
            keywords,
            block,
        },
    ))
}

/// send: the general call.
pub fn send(vm: &mut Vm, calldata: &CallData, block_iseq: Option<&Rc<Iseq>>) -> VmResult<()> {
    let (recv, args) = pop_call_site(vm, calldata, block_iseq)?;
    let result = vm.call_method(recv, calldata.method(), args)?;
    vm.push(result);
    Ok(())
}

/// invokeblock: call the nearest method frame's block.
pub fn invokeblock(vm: &mut Vm, calldata: &CallData) -> VmResult<()> {
    let args = vm.pop_n(calldata.argc() as usize)?;
    let block = vm
        .frame_yield()
        .ok_or_else(|| GarnetError::local_jump("no block given (yield)"))?;
    let result = vm.run_block_frame(&block, &args)?;
    vm.push(result);
    Ok(())
}

/// invokesuper: call the super-method of the enclosing method frame.
pub fn invokesuper(
    vm: &mut Vm,
    calldata: &CallData,
    block_iseq: Option<&Rc<Iseq>>,
) -> VmResult<()> {
    let (_, args) = pop_call_site(vm, calldata, block_iseq)?;
    let recv = vm.self_value();
    let (name, owner) = vm
        .frame()
        .owner
        .clone()
        .ok_or_else(|| GarnetError::runtime("super called outside of method"))?;

    let result = match vm.resolve_super_method(&owner, &name) {
        Some((Method::Iseq(m), found_owner)) => {
            vm.run_method_frame(name, found_owner, &m, recv, args)?
        }
        Some((Method::Native(f), _)) => f(vm, recv, &args)?,
        Some((Method::Undefined, _)) | None => {
            // The superclass chain holds no entry; natives still answer.
            match vm.builtin_lookup(recv.kind(), &name) {
                Some(f) => f(vm, recv, &args)?,
                None => {
                    return Err(GarnetError::no_method(
                        format!("super: no superclass method '{name}'"),
                        recv.inspect(),
                    )
                    .into())
                }
            }
        }
    };
    vm.push(result);
    Ok(())
}

/// defineclass: pop (cbase, superclass); create or reopen the constant on
/// cbase, run the body as a class frame, push the body's value.
pub fn defineclass(vm: &mut Vm, name: &Symbol, iseq: &Rc<Iseq>, flags: u32) -> VmResult<()> {
    let superclass = vm.pop()?;
    let cbase = vm.pop()?;

    let class_value = match flags & DEFINECLASS_TYPE_MASK {
        DEFINECLASS_SINGLETON => {
            let singleton = match &cbase {
                Value::Object(o) => RObject::singleton_class(o),
                Value::Class(c) => RClass::singleton_class(c),
                other => {
                    return Err(GarnetError::type_error(format!(
                        "can't define singleton for {}",
                        other.type_name()
                    ))
                    .into())
                }
            };
            Value::Class(singleton)
        }
        kind @ (DEFINECLASS_CLASS | DEFINECLASS_MODULE) => {
            let Value::Class(cbase_class) = &cbase else {
                return Err(GarnetError::type_error(format!(
                    "{} is not a class/module",
                    cbase.inspect()
                ))
                .into());
            };
            let existing = cbase_class.borrow().constants.get(name).cloned();
            match existing {
                Some(Value::Class(class)) => {
                    if kind == DEFINECLASS_CLASS && flags & DEFINECLASS_HAS_SUPERCLASS != 0 {
                        let Value::Class(declared) = &superclass else {
                            return Err(GarnetError::type_error(
                                "superclass must be an instance of Class",
                            )
                            .into());
                        };
                        let matches = class
                            .borrow()
                            .superclass
                            .as_ref()
                            .is_some_and(|s| Rc::ptr_eq(s, declared));
                        if !matches {
                            return Err(GarnetError::type_error(format!(
                                "superclass mismatch for class {name}"
                            ))
                            .into());
                        }
                    }
                    Value::Class(class)
                }
                Some(other) => {
                    return Err(GarnetError::type_error(format!(
                        "{name} is not a class ({})",
                        other.type_name()
                    ))
                    .into())
                }
                None => {
                    let qualified = if Rc::ptr_eq(cbase_class, &vm.core.object) {
                        name.to_string()
                    } else {
                        format!("{}::{name}", cbase_class.borrow().name)
                    };
                    let class = if kind == DEFINECLASS_MODULE {
                        RClass::module(qualified)
                    } else {
                        let parent = if flags & DEFINECLASS_HAS_SUPERCLASS != 0 {
                            let Value::Class(declared) = &superclass else {
                                return Err(GarnetError::type_error(
                                    "superclass must be an instance of Class",
                                )
                                .into());
                            };
                            Rc::clone(declared)
                        } else {
                            Rc::clone(&vm.core.object)
                        };
                        RClass::new(qualified, Some(parent))
                    };
                    cbase_class
                        .borrow_mut()
                        .constants
                        .insert(name.clone(), Value::Class(Rc::clone(&class)));
                    Value::Class(class)
                }
            }
        }
        other => {
            return Err(GarnetError::internal(format!(
                "unknown defineclass type {other}"
            ))
            .into())
        }
    };

    let result = vm.run_class_frame(iseq, class_value)?;
    vm.push(result);
    Ok(())
}

/// definemethod: bind `name` to the iseq on the current definee.
pub fn definemethod(vm: &mut Vm, name: &Symbol, iseq: &Rc<Iseq>) -> VmResult<()> {
    let class = match vm.self_value() {
        Value::Class(c) => c,
        other => vm.class_of(&other),
    };
    let method = Method::Iseq(IseqMethod {
        iseq: Rc::clone(iseq),
        nesting: vm.frame().nesting.clone(),
    });
    class.borrow_mut().define_method(name.clone(), method);
    Ok(())
}

/// definesmethod: pop an object; bind `name` on its singleton class.
pub fn definesmethod(vm: &mut Vm, name: &Symbol, iseq: &Rc<Iseq>) -> VmResult<()> {
    let target = vm.pop()?;
    let singleton = match &target {
        Value::Object(o) => RObject::singleton_class(o),
        Value::Class(c) => RClass::singleton_class(c),
        other => {
            return Err(GarnetError::type_error(format!(
                "can't define singleton method for {}",
                other.type_name()
            ))
            .into())
        }
    };
    let method = Method::Iseq(IseqMethod {
        iseq: Rc::clone(iseq),
        nesting: vm.frame().nesting.clone(),
    });
    singleton.borrow_mut().define_method(name.clone(), method);
    Ok(())
}

/// once: run the embedded iseq at most once per process; the latch caches
/// its value for every later execution.
pub fn once(vm: &mut Vm, iseq: &Rc<Iseq>, cache: &OnceCache) -> VmResult<()> {
    if let Some(value) = cache.get() {
        vm.push(value);
        return Ok(());
    }
    let value = vm.run_plain_frame(iseq)?;
    cache.set(value.clone());
    vm.push(value);
    Ok(())
}
