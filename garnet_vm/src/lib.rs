//! # Garnet VM
//!
//! A YARV-compatible bytecode catalog and the stack machine that executes
//! it. The catalog is a closed set of roughly one hundred instructions,
//! each a value object with a uniform contract:
//!
//! - **Shape hooks**: `length`, `pops`, `pushes` — used by static
//!   analysis (stack-size computation, basic blocks) without executing
//! - **Canonical rewrite**: specialized and legacy variants map onto the
//!   primitive instruction with the same observable effect
//! - **Serialization**: `to_a`/`from_a` round-trip through the reference
//!   loader's tuple shape
//! - **Disassembly**: one rendered line per instruction
//! - **Execution**: `call` against the [`vm::Vm`] runtime
//!
//! # Example
//!
//! ```
//! use garnet_vm::insn::Insn;
//! use garnet_vm::iseq::{Iseq, IseqKind};
//! use garnet_vm::value::Value;
//! use garnet_vm::vm::Vm;
//!
//! let iseq = Iseq::new("<main>", IseqKind::Top);
//! iseq.push(Insn::PutObject { object: Value::Integer(1) });
//! iseq.push(Insn::PutObject { object: Value::Integer(2) });
//! iseq.push(Insn::opt_plus());
//! iseq.push(Insn::Leave);
//!
//! let mut vm = Vm::new();
//! assert_eq!(vm.run(&iseq).unwrap(), Value::Integer(3));
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod builtins;
pub mod disasm;
pub mod frame;
pub mod insn;
pub mod iseq;
pub mod ops;
pub mod rclass;
pub mod value;
pub mod vm;

pub use disasm::{disassemble, Formatter};
pub use insn::Insn;
pub use iseq::{Iseq, IseqKind, Label};
pub use value::Value;
pub use vm::{Unwind, Vm};
