//! Catalog-wide property tests: stack-effect consistency, length
//! discipline, and canonicalization soundness.

use garnet_core::{intern, CallData};
use garnet_vm::insn::{CheckMatchKind, CheckTypeKind, DefinedKind, Insn, SpecialObject};
use garnet_vm::iseq::{Iseq, IseqKind};
use garnet_vm::value::Value;
use garnet_vm::vm::Vm;
use std::rc::Rc;

fn probe_iseq(insn: &Insn) -> Rc<Iseq> {
    let iseq = Iseq::new("<probe>", IseqKind::Top);
    iseq.local("a");
    iseq.local("b");
    // Every label an instruction might reference resolves to the end of
    // the body, so a taken branch simply finishes the probe.
    iseq.push(insn.clone());
    match insn {
        Insn::Jump { label }
        | Insn::BranchIf { label }
        | Insn::BranchUnless { label }
        | Insn::BranchNil { label } => iseq.push_label(label),
        Insn::OptCaseDispatch { table, else_label } => {
            for (_, label) in table {
                iseq.push_label(label);
            }
            iseq.push_label(else_label);
        }
        _ => {}
    }
    iseq
}

/// The net effect the interpreter actually applies: declared pushes,
/// except for checktype's documented over-report.
fn semantic_pushes(insn: &Insn) -> usize {
    match insn {
        Insn::CheckType { .. } => 1,
        other => other.pushes(),
    }
}

fn assert_stack_effect(insn: Insn, seed: Vec<Value>) {
    let expected = seed.len() - insn.pops() + semantic_pushes(&insn);
    let iseq = probe_iseq(&insn);
    let result = Vm::new()
        .run_stack_effect(&iseq, seed)
        .unwrap_or_else(|e| panic!("{} failed: {e}", insn.name()));
    assert_eq!(
        result.len(),
        expected,
        "net stack effect of {} diverges from its declared shape",
        insn.name()
    );
}

fn ints(values: &[i64]) -> Vec<Value> {
    values.iter().copied().map(Value::Integer).collect()
}

// =============================================================================
// Stack-Effect Consistency
// =============================================================================

#[test]
fn test_stack_effects_stack_manipulation() {
    assert_stack_effect(Insn::Pop, ints(&[1]));
    assert_stack_effect(Insn::Dup, ints(&[1]));
    assert_stack_effect(Insn::DupN { count: 2 }, ints(&[1, 2]));
    assert_stack_effect(Insn::Swap, ints(&[1, 2]));
    assert_stack_effect(Insn::TopN { count: 1 }, ints(&[1, 2]));
    assert_stack_effect(Insn::SetN { count: 1 }, ints(&[1, 2]));
    assert_stack_effect(Insn::AdjustStack { count: 2 }, ints(&[1, 2, 3]));
}

#[test]
fn test_stack_effects_literals() {
    assert_stack_effect(Insn::PutNil, vec![]);
    assert_stack_effect(Insn::PutSelf, vec![]);
    assert_stack_effect(
        Insn::PutObject {
            object: Value::Integer(3),
        },
        vec![],
    );
    assert_stack_effect(
        Insn::PutString {
            string: "s".to_owned(),
        },
        vec![],
    );
    assert_stack_effect(Insn::PutObjectInt2Fix0, vec![]);
    assert_stack_effect(Insn::PutObjectInt2Fix1, vec![]);
    assert_stack_effect(
        Insn::DupArray {
            array: Value::array(vec![Value::Integer(1)]),
        },
        vec![],
    );
    assert_stack_effect(
        Insn::DupHash {
            hash: Value::hash(vec![(Value::symbol("k"), Value::Integer(1))]),
        },
        vec![],
    );
    assert_stack_effect(
        Insn::PutSpecialObject {
            kind: SpecialObject::VmCore,
        },
        vec![],
    );
}

#[test]
fn test_stack_effects_specializations() {
    assert_stack_effect(Insn::opt_plus(), ints(&[1, 2]));
    assert_stack_effect(Insn::opt_minus(), ints(&[5, 2]));
    assert_stack_effect(Insn::opt_lt(), ints(&[1, 2]));
    assert_stack_effect(Insn::opt_eq(), ints(&[1, 2]));
    assert_stack_effect(Insn::opt_neq(), ints(&[1, 2]));
    assert_stack_effect(
        Insn::OptSucc {
            calldata: CallData::simple(intern("succ"), 0),
        },
        ints(&[4]),
    );
    assert_stack_effect(
        Insn::OptNilP {
            calldata: CallData::simple(intern("nil?"), 0),
        },
        vec![Value::Nil],
    );
    assert_stack_effect(
        Insn::OptLength {
            calldata: CallData::simple(intern("length"), 0),
        },
        vec![Value::string("abc")],
    );
    assert_stack_effect(
        Insn::OptAref {
            calldata: CallData::simple(intern("[]"), 1),
        },
        vec![Value::array(ints(&[9, 8])), Value::Integer(0)],
    );
    assert_stack_effect(
        Insn::OptAset {
            calldata: CallData::simple(intern("[]="), 2),
        },
        vec![
            Value::array(ints(&[9, 8])),
            Value::Integer(0),
            Value::Integer(7),
        ],
    );
    assert_stack_effect(
        Insn::OptArefWith {
            key: "k".to_owned(),
            calldata: CallData::simple(intern("[]"), 1),
        },
        vec![Value::hash(vec![])],
    );
    assert_stack_effect(
        Insn::OptAsetWith {
            key: "k".to_owned(),
            calldata: CallData::simple(intern("[]="), 2),
        },
        vec![Value::hash(vec![]), Value::Integer(1)],
    );
    assert_stack_effect(
        Insn::OptStrFreeze {
            string: "s".to_owned(),
            calldata: CallData::simple(intern("freeze"), 0),
        },
        vec![],
    );
    assert_stack_effect(Insn::OptNewArrayMax { count: 3 }, ints(&[1, 3, 2]));
    assert_stack_effect(Insn::OptNewArrayMin { count: 2 }, ints(&[4, 1]));
}

#[test]
fn test_stack_effects_strings_and_containers() {
    assert_stack_effect(
        Insn::ConcatStrings { count: 2 },
        vec![Value::string("a"), Value::string("b")],
    );
    assert_stack_effect(
        Insn::AnyToString,
        vec![Value::Integer(5), Value::string("5")],
    );
    assert_stack_effect(Insn::objtostring(), ints(&[5]));
    assert_stack_effect(Insn::Intern, vec![Value::string("sym")]);
    assert_stack_effect(Insn::ToRegexp { options: 0, count: 1 }, vec![Value::string("a+")]);
    assert_stack_effect(Insn::NewRange { exclude_end: false }, ints(&[1, 9]));
    assert_stack_effect(Insn::NewArray { count: 2 }, ints(&[1, 2]));
    assert_stack_effect(Insn::NewArrayKwSplat { count: 1 }, vec![Value::hash(vec![])]);
    assert_stack_effect(
        Insn::NewHash { count: 2 },
        vec![Value::symbol("k"), Value::Integer(1)],
    );
    assert_stack_effect(
        Insn::ConcatArray,
        vec![Value::array(ints(&[1])), Value::array(ints(&[2]))],
    );
    assert_stack_effect(Insn::SplatArray { flag: true }, vec![Value::array(ints(&[1]))]);
    assert_stack_effect(Insn::SplatArray { flag: false }, ints(&[3]));

    // expandarray across flag combinations, long and short sources.
    for (count, flags) in [(2usize, 0u8), (2, 1), (2, 2), (2, 3), (4, 0), (4, 1)] {
        assert_stack_effect(
            Insn::ExpandArray { count, flags },
            vec![Value::array(ints(&[1, 2, 3]))],
        );
    }
}

#[test]
fn test_stack_effects_variables_and_pattern() {
    assert_stack_effect(Insn::GetLocalWc0 { index: 0 }, vec![]);
    assert_stack_effect(Insn::SetLocalWc0 { index: 0 }, ints(&[5]));
    assert_stack_effect(Insn::GetLocal { index: 1, level: 0 }, vec![]);
    assert_stack_effect(Insn::SetLocal { index: 1, level: 0 }, ints(&[5]));
    assert_stack_effect(
        Insn::GetInstanceVariable {
            name: intern("@x"),
            cache: 0,
        },
        vec![],
    );
    assert_stack_effect(
        Insn::SetInstanceVariable {
            name: intern("@x"),
            cache: 0,
        },
        ints(&[5]),
    );
    assert_stack_effect(
        Insn::GetGlobal {
            name: intern("$probe"),
        },
        vec![],
    );
    assert_stack_effect(
        Insn::SetGlobal {
            name: intern("$probe"),
        },
        ints(&[5]),
    );
    assert_stack_effect(
        Insn::GetConstant {
            name: intern("Integer"),
        },
        vec![Value::Nil, Value::Bool(true)],
    );
    assert_stack_effect(
        Insn::OptGetConstantPath {
            names: vec![intern("Integer")],
        },
        vec![],
    );
    assert_stack_effect(
        Insn::GetSpecial {
            key: 0,
            svar_type: 0,
        },
        vec![],
    );
    assert_stack_effect(Insn::SetSpecial { key: 2 }, vec![Value::Bool(true)]);

    assert_stack_effect(
        Insn::CheckMatch {
            kind: CheckMatchKind::When,
            array: false,
        },
        vec![
            Value::Integer(5),
            Value::range(Value::Integer(1), Value::Integer(9), false),
        ],
    );
    assert_stack_effect(
        Insn::CheckType {
            kind: CheckTypeKind::String,
        },
        vec![Value::string("x")],
    );
    assert_stack_effect(
        Insn::Defined {
            kind: DefinedKind::Nil,
            name: Value::Nil,
            message: Value::frozen_string("expression"),
        },
        vec![Value::Nil],
    );
}

#[test]
fn test_stack_effects_control() {
    let jump = Insn::Jump {
        label: garnet_vm::iseq::Label::named("label_done"),
    };
    assert_stack_effect(jump, vec![]);
    let branch = Insn::BranchIf {
        label: garnet_vm::iseq::Label::named("label_done"),
    };
    assert_stack_effect(branch.clone(), vec![Value::Bool(true)]);
    assert_stack_effect(branch, vec![Value::Bool(false)]);
    assert_stack_effect(Insn::Nop, vec![]);
    assert_stack_effect(Insn::Leave, ints(&[1]));
}

// =============================================================================
// Length Discipline
// =============================================================================

#[test]
fn test_length_counts_operands() {
    let cases: Vec<(Insn, usize)> = vec![
        (Insn::Pop, 1),
        (Insn::Nop, 1),
        (Insn::DupN { count: 3 }, 2),
        (Insn::opt_plus(), 2),
        (Insn::opt_neq(), 3),
        (Insn::GetLocal { index: 0, level: 0 }, 3),
        (Insn::GetLocalWc1 { index: 0 }, 2),
        (
            Insn::GetSpecial {
                key: 1,
                svar_type: 0,
            },
            3,
        ),
        (
            Insn::Defined {
                kind: DefinedKind::Expr,
                name: Value::Nil,
                message: Value::frozen_string("expression"),
            },
            4,
        ),
        (
            Insn::ToRegexp {
                options: 4,
                count: 2,
            },
            3,
        ),
    ];
    for (insn, expected) in cases {
        assert_eq!(insn.length(), expected, "length of {}", insn.name());
    }
}

// =============================================================================
// Canonicalization Soundness
// =============================================================================

fn assert_canonical_sound(insn: Insn, seed: Vec<Value>) {
    let canonical = insn.canonical();
    assert_eq!(
        canonical.canonical(),
        canonical,
        "canonical of {} does not converge in one step",
        insn.name()
    );
    if canonical == insn {
        return;
    }

    let raw = Vm::new()
        .run_stack_effect(&probe_iseq(&insn), seed.clone())
        .unwrap_or_else(|e| panic!("{} failed: {e}", insn.name()));
    let rewritten = Vm::new()
        .run_stack_effect(&probe_iseq(&canonical), seed)
        .unwrap_or_else(|e| panic!("canonical {} failed: {e}", canonical.name()));
    assert_eq!(
        raw,
        rewritten,
        "{} and its canonical form diverge",
        insn.name()
    );
}

#[test]
fn test_canonicalization_soundness() {
    assert_canonical_sound(Insn::PutNil, vec![]);
    assert_canonical_sound(Insn::PutObjectInt2Fix0, vec![]);
    assert_canonical_sound(Insn::PutObjectInt2Fix1, vec![]);
    assert_canonical_sound(Insn::GetLocalWc0 { index: 0 }, vec![]);
    assert_canonical_sound(Insn::SetLocalWc0 { index: 0 }, ints(&[3]));
    assert_canonical_sound(Insn::opt_plus(), ints(&[1, 2]));
    assert_canonical_sound(Insn::opt_minus(), ints(&[9, 4]));
    assert_canonical_sound(Insn::opt_mult(), ints(&[6, 7]));
    assert_canonical_sound(Insn::opt_lt(), ints(&[1, 2]));
    assert_canonical_sound(Insn::opt_eq(), ints(&[2, 2]));
    assert_canonical_sound(
        Insn::OptSucc {
            calldata: CallData::simple(intern("succ"), 0),
        },
        ints(&[41]),
    );
    assert_canonical_sound(
        Insn::OptLength {
            calldata: CallData::simple(intern("length"), 0),
        },
        vec![Value::string("abcd")],
    );
    assert_canonical_sound(
        Insn::OptNilP {
            calldata: CallData::simple(intern("nil?"), 0),
        },
        vec![Value::Nil],
    );
    assert_canonical_sound(Insn::objtostring(), ints(&[5]));
    assert_canonical_sound(Insn::send_simple("length", 0), vec![Value::string("ab")]);
    assert_canonical_sound(
        Insn::OptAref {
            calldata: CallData::simple(intern("[]"), 1),
        },
        vec![Value::array(ints(&[7, 8])), Value::Integer(1)],
    );
}
