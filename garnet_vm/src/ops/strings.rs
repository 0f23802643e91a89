//! String, symbol, regexp, and range handlers.

use crate::frame::Backref;
use crate::value::{RRegexp, Value};
use crate::vm::{Vm, VmResult};
use garnet_core::intern::intern;
use std::rc::Rc;

/// concatstrings: pop `n` fragments and push their concatenation. The
/// fragments are already strings (anytostring runs first); no coercion is
/// attempted beyond reading their content.
pub fn concatstrings(vm: &mut Vm, count: usize) -> VmResult<()> {
    let fragments = vm.pop_n(count)?;
    let mut result = String::new();
    for fragment in &fragments {
        result.push_str(&fragment.to_display_string());
    }
    vm.push(Value::string(result));
    Ok(())
}

/// anytostring: pop (original, coerced); push the coerced value if it is
/// a string, the fallback representation of the original otherwise.
pub fn anytostring(vm: &mut Vm) -> VmResult<()> {
    let coerced = vm.pop()?;
    let original = vm.pop()?;
    if matches!(coerced, Value::String(_)) {
        vm.push(coerced);
    } else {
        vm.push(Value::string(original.inspect()));
    }
    Ok(())
}

/// intern: pop a string, push its symbol.
pub fn intern_string(vm: &mut Vm) -> VmResult<()> {
    let value = vm.pop()?;
    let content = value.as_string().ok_or_else(|| {
        garnet_core::GarnetError::type_error(format!(
            "no implicit conversion of {} into String",
            value.type_name()
        ))
    })?;
    vm.push(Value::Symbol(intern(&content)));
    Ok(())
}

/// toregexp: pop `n` string fragments, join them, and push the compiled
/// regexp with the given option bits.
pub fn toregexp(vm: &mut Vm, options: u8, count: usize) -> VmResult<()> {
    let fragments = vm.pop_n(count)?;
    let mut source = String::new();
    for fragment in &fragments {
        source.push_str(&fragment.to_display_string());
    }
    let regexp = RRegexp::compile(&source, options)?;
    vm.push(Value::Regexp(Rc::new(regexp)));
    Ok(())
}

/// newrange: pop (lo, hi), push the range.
pub fn newrange(vm: &mut Vm, exclude_end: bool) -> VmResult<()> {
    let end = vm.pop()?;
    let begin = vm.pop()?;
    vm.push(Value::range(begin, end, exclude_end));
    Ok(())
}

/// Run a regexp against a string, recording the backreference in the
/// visible special-variable slots. Returns the character position of the
/// match start.
pub fn match_against(vm: &mut Vm, regexp: &RRegexp, subject: &str) -> Option<usize> {
    match regexp.regex.captures(subject) {
        Some(captures) => {
            let full = captures.get(0).expect("capture 0 always present");
            let backref = Backref {
                pre: subject[..full.start()].to_owned(),
                full: full.as_str().to_owned(),
                post: subject[full.end()..].to_owned(),
                captures: captures
                    .iter()
                    .map(|c| c.map(|m| m.as_str().to_owned()))
                    .collect(),
            };
            vm.set_backref(Some(backref));
            Some(subject[..full.start()].chars().count())
        }
        None => {
            vm.set_backref(None);
            None
        }
    }
}
