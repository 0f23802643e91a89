//! End-to-end execution tests.
//!
//! Each test assembles the instruction sequence the compiler would emit
//! for a small program, executes it, and compares the result.

use garnet_core::calldata::{CALL_FCALL, CALL_KWARG, CALL_SUPER};
use garnet_core::{intern, CallData};
use garnet_vm::insn::{CheckMatchKind, CheckTypeKind, DefinedKind, Insn, OnceCache, SpecialObject};
use garnet_vm::iseq::{CatchEntry, CatchKind, Iseq, IseqKind};
use garnet_vm::value::{RRegexp, Value};
use garnet_vm::vm::Vm;
use std::rc::Rc;

fn run(iseq: &Rc<Iseq>) -> Value {
    Vm::new().run(iseq).expect("execution failed")
}

fn fcall(method: &str, argc: u16) -> Insn {
    Insn::OptSendWithoutBlock {
        calldata: CallData::fcall(intern(method), argc),
    }
}

// =============================================================================
// Literals and Arithmetic
// =============================================================================

#[test]
fn test_literal_program() {
    // "0"
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutObject {
        object: Value::Integer(0),
    });
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::Integer(0));
}

#[test]
fn test_opt_plus() {
    // "1 + 2"
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutObjectInt2Fix1);
    iseq.push(Insn::PutObject {
        object: Value::Integer(2),
    });
    iseq.push(Insn::opt_plus());
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::Integer(3));
}

#[test]
fn test_opt_neq() {
    // "1 != 2"
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutObjectInt2Fix1);
    iseq.push(Insn::PutObject {
        object: Value::Integer(2),
    });
    iseq.push(Insn::opt_neq());
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::Bool(true));
}

#[test]
fn test_float_arithmetic_falls_back_to_dispatch() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutObject {
        object: Value::Float(1.5),
    });
    iseq.push(Insn::PutObject {
        object: Value::Integer(2),
    });
    iseq.push(Insn::opt_mult());
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::Float(3.0));
}

#[test]
fn test_zero_division_is_an_error() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutObjectInt2Fix1);
    iseq.push(Insn::PutObjectInt2Fix0);
    iseq.push(Insn::OptDiv {
        calldata: CallData::simple(intern("/"), 1),
    });
    iseq.push(Insn::Leave);
    let err = Vm::new().run(&iseq).unwrap_err();
    assert_eq!(err.exception_class(), "ZeroDivisionError");
}

// =============================================================================
// Locals
// =============================================================================

#[test]
fn test_local_assignment() {
    // "a = 1; a"
    let iseq = Iseq::new("<main>", IseqKind::Top);
    let a = iseq.local("a");
    iseq.push(Insn::PutObjectInt2Fix1);
    iseq.push(Insn::SetLocalWc0 { index: a });
    iseq.push(Insn::GetLocalWc0 { index: a });
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::Integer(1));
}

// =============================================================================
// String Interpolation
// =============================================================================

#[test]
fn test_string_interpolation() {
    // '"#{5}"'
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutObject {
        object: Value::frozen_string(""),
    });
    iseq.push(Insn::PutObject {
        object: Value::Integer(5),
    });
    iseq.push(Insn::Dup);
    iseq.push(Insn::objtostring());
    iseq.push(Insn::AnyToString);
    iseq.push(Insn::ConcatStrings { count: 2 });
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::string("5"));
}

#[test]
fn test_intern_and_newrange() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutString {
        string: "token".to_owned(),
    });
    iseq.push(Insn::Intern);
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::symbol("token"));

    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutObjectInt2Fix1);
    iseq.push(Insn::PutObject {
        object: Value::Integer(5),
    });
    iseq.push(Insn::NewRange { exclude_end: true });
    iseq.push(Insn::Leave);
    assert_eq!(
        run(&iseq),
        Value::range(Value::Integer(1), Value::Integer(5), true)
    );
}

#[test]
fn test_toregexp_and_match() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutString {
        string: "wor".to_owned(),
    });
    iseq.push(Insn::PutString {
        string: "ld".to_owned(),
    });
    iseq.push(Insn::ToRegexp {
        options: 0,
        count: 2,
    });
    iseq.push(Insn::PutString {
        string: "hello world".to_owned(),
    });
    iseq.push(Insn::OptRegexpMatch2 {
        calldata: CallData::simple(intern("=~"), 1),
    });
    iseq.push(Insn::Leave);
    // "hello world" =~ /world/ reversed: regexp =~ string, position 6.
    assert_eq!(run(&iseq), Value::Integer(6));
}

#[test]
fn test_backref_after_match() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutString {
        string: "hello world".to_owned(),
    });
    iseq.push(Insn::PutObject {
        object: Value::Regexp(Rc::new(RRegexp::compile("o w", 0).unwrap())),
    });
    iseq.push(Insn::OptRegexpMatch2 {
        calldata: CallData::simple(intern("=~"), 1),
    });
    iseq.push(Insn::Pop);
    iseq.push(Insn::GetSpecial {
        key: 1,
        svar_type: ((b'&' as usize) << 1) | 1,
    });
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::string("o w"));
}

// =============================================================================
// Arrays and Hashes
// =============================================================================

#[test]
fn test_newarray_max() {
    // "[a, b, c].max" with a, b, c = 1, 2, 3
    let iseq = Iseq::new("<main>", IseqKind::Top);
    let a = iseq.local("a");
    let b = iseq.local("b");
    let c = iseq.local("c");
    iseq.push(Insn::PutObjectInt2Fix1);
    iseq.push(Insn::SetLocalWc0 { index: a });
    iseq.push(Insn::PutObject {
        object: Value::Integer(2),
    });
    iseq.push(Insn::SetLocalWc0 { index: b });
    iseq.push(Insn::PutObject {
        object: Value::Integer(3),
    });
    iseq.push(Insn::SetLocalWc0 { index: c });
    iseq.push(Insn::GetLocalWc0 { index: a });
    iseq.push(Insn::GetLocalWc0 { index: b });
    iseq.push(Insn::GetLocalWc0 { index: c });
    iseq.push(Insn::OptNewArrayMax { count: 3 });
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::Integer(3));
}

#[test]
fn test_concat_and_splat() {
    // [*[1, 2], *[3]]
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::DupArray {
        array: Value::array(vec![Value::Integer(1), Value::Integer(2)]),
    });
    iseq.push(Insn::DupArray {
        array: Value::array(vec![Value::Integer(3)]),
    });
    iseq.push(Insn::ConcatArray);
    iseq.push(Insn::Leave);
    assert_eq!(
        run(&iseq),
        Value::array(vec![
            Value::Integer(1),
            Value::Integer(2),
            Value::Integer(3)
        ])
    );
}

#[test]
fn test_expandarray_simple() {
    // "a, b = [1, 2, 3]" leaves a = 1, b = 2
    let iseq = Iseq::new("<main>", IseqKind::Top);
    let a = iseq.local("a");
    let b = iseq.local("b");
    iseq.push(Insn::DupArray {
        array: Value::array(vec![
            Value::Integer(1),
            Value::Integer(2),
            Value::Integer(3),
        ]),
    });
    iseq.push(Insn::ExpandArray { count: 2, flags: 0 });
    iseq.push(Insn::SetLocalWc0 { index: a });
    iseq.push(Insn::SetLocalWc0 { index: b });
    iseq.push(Insn::GetLocalWc0 { index: a });
    iseq.push(Insn::GetLocalWc0 { index: b });
    iseq.push(Insn::NewArray { count: 2 });
    iseq.push(Insn::Leave);
    assert_eq!(
        run(&iseq),
        Value::array(vec![Value::Integer(1), Value::Integer(2)])
    );
}

#[test]
fn test_expandarray_splat_remainder() {
    // "a, *rest = [1, 2, 3]"
    let iseq = Iseq::new("<main>", IseqKind::Top);
    let a = iseq.local("a");
    let rest = iseq.local("rest");
    iseq.push(Insn::DupArray {
        array: Value::array(vec![
            Value::Integer(1),
            Value::Integer(2),
            Value::Integer(3),
        ]),
    });
    iseq.push(Insn::ExpandArray { count: 1, flags: 1 });
    iseq.push(Insn::SetLocalWc0 { index: a });
    iseq.push(Insn::SetLocalWc0 { index: rest });
    iseq.push(Insn::GetLocalWc0 { index: a });
    iseq.push(Insn::GetLocalWc0 { index: rest });
    iseq.push(Insn::NewArray { count: 2 });
    iseq.push(Insn::Leave);
    assert_eq!(
        run(&iseq),
        Value::array(vec![
            Value::Integer(1),
            Value::array(vec![Value::Integer(2), Value::Integer(3)])
        ])
    );
}

#[test]
fn test_expandarray_pads_with_nil() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::DupArray {
        array: Value::array(vec![Value::Integer(1)]),
    });
    iseq.push(Insn::ExpandArray { count: 3, flags: 0 });
    iseq.push(Insn::NewArray { count: 3 });
    iseq.push(Insn::Leave);
    // Pushed first-on-top, so collecting bottom-to-top yields [nil, nil, 1].
    assert_eq!(
        run(&iseq),
        Value::array(vec![Value::Nil, Value::Nil, Value::Integer(1)])
    );
}

#[test]
fn test_newhash_and_aref_with() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::NewHash { count: 0 });
    iseq.push(Insn::Dup);
    iseq.push(Insn::PutObject {
        object: Value::Integer(5),
    });
    iseq.push(Insn::OptAsetWith {
        key: "k".to_owned(),
        calldata: CallData::simple(intern("[]="), 2),
    });
    iseq.push(Insn::Pop);
    iseq.push(Insn::OptArefWith {
        key: "k".to_owned(),
        calldata: CallData::simple(intern("[]"), 1),
    });
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::Integer(5));
}

#[test]
fn test_opt_str_freeze() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::OptStrFreeze {
        string: "lit".to_owned(),
        calldata: CallData::simple(intern("freeze"), 0),
    });
    iseq.push(fcall("frozen?", 0));
    iseq.push(Insn::Leave);
    // frozen? has an explicit receiver here, but fcall flags are harmless.
    assert_eq!(run(&iseq), Value::Bool(true));
}

// =============================================================================
// Branches and Case Dispatch
// =============================================================================

#[test]
fn test_branchunless() {
    // "if false then 1 else 2 end"
    let iseq = Iseq::new("<main>", IseqKind::Top);
    let else_label = iseq.new_label();
    let end_label = iseq.new_label();
    iseq.push(Insn::PutObject {
        object: Value::Bool(false),
    });
    iseq.push(Insn::BranchUnless {
        label: else_label.clone(),
    });
    iseq.push(Insn::PutObjectInt2Fix1);
    iseq.push(Insn::Jump {
        label: end_label.clone(),
    });
    iseq.push_label(&else_label);
    iseq.push(Insn::PutObject {
        object: Value::Integer(2),
    });
    iseq.push_label(&end_label);
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::Integer(2));
}

#[test]
fn test_branchnil() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    let nil_label = iseq.new_label();
    iseq.push(Insn::PutNil);
    iseq.push(Insn::BranchNil {
        label: nil_label.clone(),
    });
    iseq.push(Insn::PutObjectInt2Fix0);
    iseq.push(Insn::Leave);
    iseq.push_label(&nil_label);
    iseq.push(Insn::PutObjectInt2Fix1);
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::Integer(1));
}

#[test]
fn test_opt_case_dispatch() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    let one = iseq.new_label();
    let two = iseq.new_label();
    let other = iseq.new_label();
    let done = iseq.new_label();
    iseq.push(Insn::PutObject {
        object: Value::Integer(2),
    });
    iseq.push(Insn::OptCaseDispatch {
        table: vec![
            (Value::Integer(1), one.clone()),
            (Value::Integer(2), two.clone()),
        ],
        else_label: other.clone(),
    });
    iseq.push_label(&one);
    iseq.push(Insn::PutString {
        string: "one".to_owned(),
    });
    iseq.push(Insn::Jump {
        label: done.clone(),
    });
    iseq.push_label(&two);
    iseq.push(Insn::PutString {
        string: "two".to_owned(),
    });
    iseq.push(Insn::Jump {
        label: done.clone(),
    });
    iseq.push_label(&other);
    iseq.push(Insn::PutString {
        string: "other".to_owned(),
    });
    iseq.push_label(&done);
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::string("two"));
}

// =============================================================================
// Pattern Classification
// =============================================================================

#[test]
fn test_checkmatch_class_pattern() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutObject {
        object: Value::Integer(5),
    });
    iseq.push(Insn::OptGetConstantPath {
        names: vec![intern("Integer")],
    });
    iseq.push(Insn::CheckMatch {
        kind: CheckMatchKind::When,
        array: false,
    });
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::Bool(true));
}

#[test]
fn test_checkmatch_range_pattern() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutObject {
        object: Value::Integer(7),
    });
    iseq.push(Insn::PutObject {
        object: Value::range(Value::Integer(1), Value::Integer(10), false),
    });
    iseq.push(Insn::CheckMatch {
        kind: CheckMatchKind::When,
        array: false,
    });
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::Bool(true));
}

#[test]
fn test_checktype() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutString {
        string: "x".to_owned(),
    });
    iseq.push(Insn::CheckType {
        kind: CheckTypeKind::String,
    });
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::Bool(true));
}

#[test]
fn test_defined_global() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutObjectInt2Fix1);
    iseq.push(Insn::SetGlobal {
        name: intern("$flag"),
    });
    iseq.push(Insn::PutNil);
    iseq.push(Insn::Defined {
        kind: DefinedKind::Gvar,
        name: Value::symbol("$flag"),
        message: Value::frozen_string("global-variable"),
    });
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::string("global-variable"));
}

#[test]
fn test_defined_missing_ivar_is_nil() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutNil);
    iseq.push(Insn::Defined {
        kind: DefinedKind::IVar,
        name: Value::symbol("@missing"),
        message: Value::frozen_string("instance-variable"),
    });
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::Nil);
}

// =============================================================================
// Variables
// =============================================================================

#[test]
fn test_instance_variables() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutObject {
        object: Value::Integer(41),
    });
    iseq.push(Insn::SetInstanceVariable {
        name: intern("@state"),
        cache: 0,
    });
    iseq.push(Insn::GetInstanceVariable {
        name: intern("@state"),
        cache: 0,
    });
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::Integer(41));
}

#[test]
fn test_globals() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutString {
        string: "on".to_owned(),
    });
    iseq.push(Insn::SetGlobal {
        name: intern("$mode"),
    });
    iseq.push(Insn::GetGlobal {
        name: intern("$mode"),
    });
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::string("on"));
}

#[test]
fn test_unset_global_reads_nil() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::GetGlobal {
        name: intern("$never_written"),
    });
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::Nil);
}

#[test]
fn test_constants() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutObject {
        object: Value::Integer(99),
    });
    iseq.push(Insn::PutSpecialObject {
        kind: SpecialObject::ConstBase,
    });
    iseq.push(Insn::SetConstant {
        name: intern("ANSWER"),
    });
    iseq.push(Insn::PutNil);
    iseq.push(Insn::PutObject {
        object: Value::Bool(true),
    });
    iseq.push(Insn::GetConstant {
        name: intern("ANSWER"),
    });
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::Integer(99));
}

#[test]
fn test_missing_constant_is_a_name_error() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutNil);
    iseq.push(Insn::PutObject {
        object: Value::Bool(true),
    });
    iseq.push(Insn::GetConstant {
        name: intern("Missing"),
    });
    iseq.push(Insn::Leave);
    let err = Vm::new().run(&iseq).unwrap_err();
    assert_eq!(err.exception_class(), "NameError");
    assert!(err.to_string().contains("uninitialized constant Missing"));
}

#[test]
fn test_opt_getconstant_path() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::OptGetConstantPath {
        names: vec![intern("Integer")],
    });
    iseq.push(fcall("name", 0));
    iseq.push(Insn::Leave);
    assert_eq!(run(&iseq), Value::string("Integer"));
}

// =============================================================================
// Methods, Blocks, Classes
// =============================================================================

fn method_iseq(parent: &Rc<Iseq>, name: &str) -> Rc<Iseq> {
    Iseq::with_parent(name, IseqKind::Method, parent)
}

#[test]
fn test_definemethod_and_send() {
    let main = Iseq::new("<main>", IseqKind::Top);
    let double = method_iseq(&main, "double");
    let n = double.local("n");
    double.params_mut().lead_num = 1;
    double.push(Insn::GetLocalWc0 { index: n });
    double.push(Insn::PutObject {
        object: Value::Integer(2),
    });
    double.push(Insn::opt_mult());
    double.push(Insn::Leave);

    main.push(Insn::DefineMethod {
        name: intern("double"),
        iseq: Rc::clone(&double),
    });
    main.push(Insn::PutSelf);
    main.push(Insn::PutObject {
        object: Value::Integer(21),
    });
    main.push(fcall("double", 1));
    main.push(Insn::Leave);
    assert_eq!(run(&main), Value::Integer(42));
}

#[test]
fn test_arity_mismatch() {
    let main = Iseq::new("<main>", IseqKind::Top);
    let one = method_iseq(&main, "one");
    one.local("x");
    one.params_mut().lead_num = 1;
    one.push(Insn::PutNil);
    one.push(Insn::Leave);

    main.push(Insn::DefineMethod {
        name: intern("one"),
        iseq: Rc::clone(&one),
    });
    main.push(Insn::PutSelf);
    main.push(fcall("one", 0));
    main.push(Insn::Leave);
    let err = Vm::new().run(&main).unwrap_err();
    assert_eq!(err.exception_class(), "ArgumentError");
    assert!(err.to_string().contains("given 0, expected 1"));
}

#[test]
fn test_send_with_block_and_invokeblock() {
    let main = Iseq::new("<main>", IseqKind::Top);

    let apply = method_iseq(&main, "apply");
    apply.push(Insn::PutObject {
        object: Value::Integer(10),
    });
    apply.push(Insn::InvokeBlock {
        calldata: CallData::new(intern("yield"), 1, 0, None),
    });
    apply.push(Insn::Leave);

    let block = Iseq::with_parent("block in <main>", IseqKind::Block, &main);
    let x = block.local("x");
    block.params_mut().lead_num = 1;
    block.push(Insn::GetLocalWc0 { index: x });
    block.push(Insn::PutObjectInt2Fix1);
    block.push(Insn::opt_plus());
    block.push(Insn::Leave);

    main.push(Insn::DefineMethod {
        name: intern("apply"),
        iseq: Rc::clone(&apply),
    });
    main.push(Insn::PutSelf);
    main.push(Insn::Send {
        calldata: CallData::fcall(intern("apply"), 0),
        block_iseq: Some(Rc::clone(&block)),
    });
    main.push(Insn::Leave);
    assert_eq!(run(&main), Value::Integer(11));
}

#[test]
fn test_yield_without_block_is_a_local_jump_error() {
    let main = Iseq::new("<main>", IseqKind::Top);
    let shout = method_iseq(&main, "shout");
    shout.push(Insn::InvokeBlock {
        calldata: CallData::new(intern("yield"), 0, 0, None),
    });
    shout.push(Insn::Leave);

    main.push(Insn::DefineMethod {
        name: intern("shout"),
        iseq: Rc::clone(&shout),
    });
    main.push(Insn::PutSelf);
    main.push(fcall("shout", 0));
    main.push(Insn::Leave);
    let err = Vm::new().run(&main).unwrap_err();
    assert_eq!(err.exception_class(), "LocalJumpError");
    assert!(err.to_string().contains("no block given"));
}

#[test]
fn test_block_reads_outer_locals_through_level() {
    let main = Iseq::new("<main>", IseqKind::Top);
    let base = main.local("base");

    let apply = method_iseq(&main, "apply");
    apply.push(Insn::InvokeBlock {
        calldata: CallData::new(intern("yield"), 0, 0, None),
    });
    apply.push(Insn::Leave);

    let block = Iseq::with_parent("block in <main>", IseqKind::Block, &main);
    block.push(Insn::GetLocalWc1 { index: base });
    block.push(Insn::PutObjectInt2Fix1);
    block.push(Insn::opt_plus());
    block.push(Insn::Leave);

    main.push(Insn::PutObject {
        object: Value::Integer(41),
    });
    main.push(Insn::SetLocalWc0 { index: base });
    main.push(Insn::DefineMethod {
        name: intern("apply"),
        iseq: Rc::clone(&apply),
    });
    main.push(Insn::PutSelf);
    main.push(Insn::Send {
        calldata: CallData::fcall(intern("apply"), 0),
        block_iseq: Some(Rc::clone(&block)),
    });
    main.push(Insn::Leave);
    assert_eq!(run(&main), Value::Integer(42));
}

#[test]
fn test_getblockparamproxy_call() {
    let main = Iseq::new("<main>", IseqKind::Top);

    let invoke = method_iseq(&main, "invoke");
    let blk = invoke.local("blk");
    invoke.params_mut().block_start = Some(blk);
    invoke.push(Insn::GetBlockParamProxy {
        index: blk,
        level: 0,
    });
    invoke.push(Insn::PutObject {
        object: Value::Integer(3),
    });
    invoke.push(Insn::OptSendWithoutBlock {
        calldata: CallData::simple(intern("call"), 1),
    });
    invoke.push(Insn::Leave);

    let block = Iseq::with_parent("block in <main>", IseqKind::Block, &main);
    let x = block.local("x");
    block.params_mut().lead_num = 1;
    block.push(Insn::GetLocalWc0 { index: x });
    block.push(Insn::PutObject {
        object: Value::Integer(4),
    });
    block.push(Insn::opt_mult());
    block.push(Insn::Leave);

    main.push(Insn::DefineMethod {
        name: intern("invoke"),
        iseq: Rc::clone(&invoke),
    });
    main.push(Insn::PutSelf);
    main.push(Insn::Send {
        calldata: CallData::fcall(intern("invoke"), 0),
        block_iseq: Some(Rc::clone(&block)),
    });
    main.push(Insn::Leave);
    assert_eq!(run(&main), Value::Integer(12));
}

#[test]
fn test_keyword_arguments_and_checkkeyword() {
    let main = Iseq::new("<main>", IseqKind::Top);

    let fetch = method_iseq(&main, "fetch");
    let mode = fetch.local("mode");
    let kwbits = fetch.local("kwbits");
    fetch.params_mut().keywords = vec![(intern("mode"), None)];
    fetch.params_mut().kwbits = Some(kwbits);
    let supplied = fetch.new_label();
    fetch.push(Insn::CheckKeyword {
        bits_index: kwbits,
        keyword_index: 0,
    });
    fetch.push(Insn::BranchIf {
        label: supplied.clone(),
    });
    fetch.push(Insn::PutString {
        string: "default".to_owned(),
    });
    fetch.push(Insn::SetLocalWc0 { index: mode });
    fetch.push_label(&supplied);
    fetch.push(Insn::GetLocalWc0 { index: mode });
    fetch.push(Insn::Leave);

    main.push(Insn::DefineMethod {
        name: intern("fetch"),
        iseq: Rc::clone(&fetch),
    });
    main.push(Insn::PutSelf);
    main.push(Insn::PutString {
        string: "explicit".to_owned(),
    });
    main.push(Insn::OptSendWithoutBlock {
        calldata: CallData::new(
            intern("fetch"),
            0,
            CALL_FCALL | CALL_KWARG,
            Some(vec![intern("mode")]),
        ),
    });
    main.push(Insn::Leave);
    assert_eq!(run(&main), Value::string("explicit"));

    let main = Iseq::new("<main>", IseqKind::Top);
    main.push(Insn::DefineMethod {
        name: intern("fetch"),
        iseq: Rc::clone(&fetch),
    });
    main.push(Insn::PutSelf);
    main.push(fcall("fetch", 0));
    main.push(Insn::Leave);
    assert_eq!(run(&main), Value::string("default"));
}

#[test]
fn test_defineclass_and_instances() {
    let main = Iseq::new("<main>", IseqKind::Top);

    let class_body = Iseq::with_parent("<class:Calc>", IseqKind::Class, &main);
    let add = Iseq::with_parent("add", IseqKind::Method, &class_body);
    let a = add.local("a");
    let b = add.local("b");
    add.params_mut().lead_num = 2;
    add.push(Insn::GetLocalWc0 { index: a });
    add.push(Insn::GetLocalWc0 { index: b });
    add.push(Insn::opt_plus());
    add.push(Insn::Leave);
    class_body.push(Insn::DefineMethod {
        name: intern("add"),
        iseq: Rc::clone(&add),
    });
    class_body.push(Insn::PutNil);
    class_body.push(Insn::Leave);

    main.push(Insn::PutSpecialObject {
        kind: SpecialObject::ConstBase,
    });
    main.push(Insn::PutNil);
    main.push(Insn::DefineClass {
        name: intern("Calc"),
        iseq: Rc::clone(&class_body),
        flags: 0,
    });
    main.push(Insn::Pop);
    main.push(Insn::OptGetConstantPath {
        names: vec![intern("Calc")],
    });
    main.push(Insn::OptSendWithoutBlock {
        calldata: CallData::simple(intern("new"), 0),
    });
    main.push(Insn::PutObject {
        object: Value::Integer(2),
    });
    main.push(Insn::PutObject {
        object: Value::Integer(3),
    });
    main.push(Insn::OptSendWithoutBlock {
        calldata: CallData::simple(intern("add"), 2),
    });
    main.push(Insn::Leave);
    assert_eq!(run(&main), Value::Integer(5));
}

#[test]
fn test_invokesuper() {
    let main = Iseq::new("<main>", IseqKind::Top);

    // class A; def tag = "A"; end
    let a_body = Iseq::with_parent("<class:A>", IseqKind::Class, &main);
    let a_tag = Iseq::with_parent("tag", IseqKind::Method, &a_body);
    a_tag.push(Insn::PutString {
        string: "A".to_owned(),
    });
    a_tag.push(Insn::Leave);
    a_body.push(Insn::DefineMethod {
        name: intern("tag"),
        iseq: Rc::clone(&a_tag),
    });
    a_body.push(Insn::PutNil);
    a_body.push(Insn::Leave);

    // class B < A; def tag = "B" + super; end
    let b_body = Iseq::with_parent("<class:B>", IseqKind::Class, &main);
    let b_tag = Iseq::with_parent("tag", IseqKind::Method, &b_body);
    b_tag.push(Insn::PutString {
        string: "B".to_owned(),
    });
    b_tag.push(Insn::PutSelf);
    b_tag.push(Insn::InvokeSuper {
        calldata: CallData::new(intern("tag"), 0, CALL_SUPER, None),
        block_iseq: None,
    });
    b_tag.push(Insn::opt_plus());
    b_tag.push(Insn::Leave);
    b_body.push(Insn::DefineMethod {
        name: intern("tag"),
        iseq: Rc::clone(&b_tag),
    });
    b_body.push(Insn::PutNil);
    b_body.push(Insn::Leave);

    main.push(Insn::PutSpecialObject {
        kind: SpecialObject::ConstBase,
    });
    main.push(Insn::PutNil);
    main.push(Insn::DefineClass {
        name: intern("A"),
        iseq: Rc::clone(&a_body),
        flags: 0,
    });
    main.push(Insn::Pop);
    main.push(Insn::PutSpecialObject {
        kind: SpecialObject::ConstBase,
    });
    main.push(Insn::OptGetConstantPath {
        names: vec![intern("A")],
    });
    main.push(Insn::DefineClass {
        name: intern("B"),
        iseq: Rc::clone(&b_body),
        flags: 16,
    });
    main.push(Insn::Pop);
    main.push(Insn::OptGetConstantPath {
        names: vec![intern("B")],
    });
    main.push(Insn::OptSendWithoutBlock {
        calldata: CallData::simple(intern("new"), 0),
    });
    main.push(Insn::OptSendWithoutBlock {
        calldata: CallData::simple(intern("tag"), 0),
    });
    main.push(Insn::Leave);
    assert_eq!(run(&main), Value::string("BA"));
}

#[test]
fn test_definesmethod() {
    let main = Iseq::new("<main>", IseqKind::Top);
    let greet = method_iseq(&main, "greet");
    greet.push(Insn::PutString {
        string: "hi".to_owned(),
    });
    greet.push(Insn::Leave);

    main.push(Insn::PutSelf);
    main.push(Insn::DefineSMethod {
        name: intern("greet"),
        iseq: Rc::clone(&greet),
    });
    main.push(Insn::PutSelf);
    main.push(fcall("greet", 0));
    main.push(Insn::Leave);
    assert_eq!(run(&main), Value::string("hi"));
}

#[test]
fn test_class_variables() {
    let main = Iseq::new("<main>", IseqKind::Top);
    let body = Iseq::with_parent("<class:Counter>", IseqKind::Class, &main);
    body.push(Insn::PutObject {
        object: Value::Integer(7),
    });
    body.push(Insn::SetClassVariable {
        name: intern("@@count"),
        cache: Some(0),
    });
    body.push(Insn::GetClassVariable {
        name: intern("@@count"),
        cache: Some(0),
    });
    body.push(Insn::Leave);

    main.push(Insn::PutSpecialObject {
        kind: SpecialObject::ConstBase,
    });
    main.push(Insn::PutNil);
    main.push(Insn::DefineClass {
        name: intern("Counter"),
        iseq: Rc::clone(&body),
        flags: 0,
    });
    main.push(Insn::Leave);
    assert_eq!(run(&main), Value::Integer(7));
}

// =============================================================================
// Frozen Core
// =============================================================================

#[test]
fn test_method_alias_through_frozen_core() {
    let main = Iseq::new("<main>", IseqKind::Top);

    // class String; alias len2 length; end
    let body = Iseq::with_parent("<class:String>", IseqKind::Class, &main);
    body.push(Insn::PutSpecialObject {
        kind: SpecialObject::VmCore,
    });
    body.push(Insn::PutSpecialObject {
        kind: SpecialObject::CBase,
    });
    body.push(Insn::PutObject {
        object: Value::symbol("len2"),
    });
    body.push(Insn::PutObject {
        object: Value::symbol("length"),
    });
    body.push(Insn::OptSendWithoutBlock {
        calldata: CallData::simple(intern("core#set_method_alias"), 3),
    });
    body.push(Insn::Leave);

    main.push(Insn::PutSpecialObject {
        kind: SpecialObject::ConstBase,
    });
    main.push(Insn::PutNil);
    main.push(Insn::DefineClass {
        name: intern("String"),
        iseq: Rc::clone(&body),
        flags: 0,
    });
    main.push(Insn::Pop);
    main.push(Insn::PutString {
        string: "abcd".to_owned(),
    });
    main.push(Insn::OptSendWithoutBlock {
        calldata: CallData::simple(intern("len2"), 0),
    });
    main.push(Insn::Leave);
    assert_eq!(run(&main), Value::Integer(4));
}

#[test]
fn test_undef_through_frozen_core() {
    let main = Iseq::new("<main>", IseqKind::Top);
    let body = Iseq::with_parent("<class:String>", IseqKind::Class, &main);
    body.push(Insn::PutSpecialObject {
        kind: SpecialObject::VmCore,
    });
    body.push(Insn::PutSpecialObject {
        kind: SpecialObject::CBase,
    });
    body.push(Insn::PutObject {
        object: Value::symbol("length"),
    });
    body.push(Insn::OptSendWithoutBlock {
        calldata: CallData::simple(intern("core#undef_method"), 2),
    });
    body.push(Insn::Leave);

    main.push(Insn::PutSpecialObject {
        kind: SpecialObject::ConstBase,
    });
    main.push(Insn::PutNil);
    main.push(Insn::DefineClass {
        name: intern("String"),
        iseq: Rc::clone(&body),
        flags: 0,
    });
    main.push(Insn::Pop);
    main.push(Insn::PutString {
        string: "abcd".to_owned(),
    });
    main.push(Insn::OptSendWithoutBlock {
        calldata: CallData::simple(intern("length"), 0),
    });
    main.push(Insn::Leave);
    let err = Vm::new().run(&main).unwrap_err();
    assert_eq!(err.exception_class(), "NoMethodError");
}

// =============================================================================
// Non-local Control
// =============================================================================

#[test]
fn test_break_unwinds_through_catch_table() {
    let main = Iseq::new("<main>", IseqKind::Top);

    let iter = method_iseq(&main, "iter");
    iter.push(Insn::InvokeBlock {
        calldata: CallData::new(intern("yield"), 0, 0, None),
    });
    iter.push(Insn::Leave);

    let block = Iseq::with_parent("block in <main>", IseqKind::Block, &main);
    block.push(Insn::PutObject {
        object: Value::Integer(42),
    });
    block.push(Insn::Throw { tag: 2 });
    block.push(Insn::PutNil);
    block.push(Insn::Leave);

    let begin = main.new_label();
    let done = main.new_label();
    main.push(Insn::DefineMethod {
        name: intern("iter"),
        iseq: Rc::clone(&iter),
    });
    main.push_label(&begin);
    main.push(Insn::PutSelf);
    main.push(Insn::Send {
        calldata: CallData::fcall(intern("iter"), 0),
        block_iseq: Some(Rc::clone(&block)),
    });
    main.push_label(&done);
    main.push(Insn::Leave);
    main.add_catch_entry(CatchEntry {
        kind: CatchKind::Break,
        iseq: None,
        begin_label: begin,
        end_label: done.clone(),
        exit_label: done,
        sp: 0,
    });
    assert_eq!(run(&main), Value::Integer(42));
}

#[test]
fn test_return_from_block_returns_from_method() {
    let main = Iseq::new("<main>", IseqKind::Top);

    let find = method_iseq(&main, "find");
    find.push(Insn::InvokeBlock {
        calldata: CallData::new(intern("yield"), 0, 0, None),
    });
    find.push(Insn::Pop);
    find.push(Insn::PutString {
        string: "not reached".to_owned(),
    });
    find.push(Insn::Leave);

    let block = Iseq::with_parent("block in find", IseqKind::Block, &main);
    block.push(Insn::PutObject {
        object: Value::Integer(9),
    });
    block.push(Insn::Throw { tag: 1 });
    block.push(Insn::PutNil);
    block.push(Insn::Leave);

    main.push(Insn::DefineMethod {
        name: intern("find"),
        iseq: Rc::clone(&find),
    });
    main.push(Insn::PutSelf);
    main.push(Insn::Send {
        calldata: CallData::fcall(intern("find"), 0),
        block_iseq: Some(Rc::clone(&block)),
    });
    main.push(Insn::Leave);
    assert_eq!(run(&main), Value::Integer(9));
}

#[test]
fn test_rescue_handler() {
    let main = Iseq::new("<main>", IseqKind::Top);

    let handler = Iseq::with_parent("rescue in <main>", IseqKind::Rescue, &main);
    let e = handler.local("e");
    handler.push(Insn::GetLocalWc0 { index: e });
    handler.push(Insn::OptSendWithoutBlock {
        calldata: CallData::simple(intern("message"), 0),
    });
    handler.push(Insn::Leave);

    let begin = main.new_label();
    let done = main.new_label();
    main.push_label(&begin);
    main.push(Insn::PutSelf);
    main.push(Insn::PutString {
        string: "boom".to_owned(),
    });
    main.push(fcall("raise", 1));
    main.push_label(&done);
    main.push(Insn::Leave);
    main.add_catch_entry(CatchEntry {
        kind: CatchKind::Rescue,
        iseq: Some(handler),
        begin_label: begin,
        end_label: done.clone(),
        exit_label: done,
        sp: 0,
    });
    assert_eq!(run(&main), Value::string("boom"));
}

#[test]
fn test_unmatched_raise_reaches_the_top() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutSelf);
    iseq.push(Insn::PutString {
        string: "unhandled".to_owned(),
    });
    iseq.push(fcall("raise", 1));
    iseq.push(Insn::Leave);
    let err = Vm::new().run(&iseq).unwrap_err();
    assert_eq!(err.exception_class(), "RuntimeError");
    assert!(err.to_string().contains("unhandled"));
}

#[test]
fn test_throw_break_without_handler_is_an_error() {
    let iseq = Iseq::new("<main>", IseqKind::Top);
    iseq.push(Insn::PutNil);
    iseq.push(Insn::Throw { tag: 2 });
    iseq.push(Insn::Leave);
    let err = Vm::new().run(&iseq).unwrap_err();
    assert_eq!(err.exception_class(), "LocalJumpError");
}

// =============================================================================
// Once
// =============================================================================

#[test]
fn test_once_runs_body_exactly_once() {
    let main = Iseq::new("<main>", IseqKind::Top);

    let body = Iseq::with_parent("once body", IseqKind::Plain, &main);
    body.push(Insn::GetGlobal {
        name: intern("$count"),
    });
    body.push(Insn::PutObjectInt2Fix1);
    body.push(Insn::opt_plus());
    body.push(Insn::Dup);
    body.push(Insn::SetGlobal {
        name: intern("$count"),
    });
    body.push(Insn::Leave);

    let once = Insn::Once {
        iseq: Rc::clone(&body),
        cache: OnceCache::new(),
    };
    main.push(Insn::PutObjectInt2Fix0);
    main.push(Insn::SetGlobal {
        name: intern("$count"),
    });
    main.push(once.clone());
    main.push(Insn::Pop);
    main.push(once);
    main.push(Insn::Pop);
    main.push(Insn::GetGlobal {
        name: intern("$count"),
    });
    main.push(Insn::Leave);
    // The body increments $count; a second execution would read 2.
    assert_eq!(run(&main), Value::Integer(1));
}
