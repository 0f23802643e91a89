//! # Garnet Core
//!
//! Core types shared across the Garnet bytecode runtime.
//!
//! This crate provides the foundational building blocks the instruction
//! catalog and virtual machine are built on:
//!
//! - **Interning**: symbol interning for O(1) selector and name equality
//! - **Error Handling**: the runtime exception hierarchy and result types
//! - **CallData**: the immutable call-site descriptor every call-like
//!   instruction carries

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod calldata;
pub mod error;
pub mod intern;

pub use calldata::CallData;
pub use error::{GarnetError, GarnetResult};
pub use intern::{intern, Symbol, SymbolInterner};

/// Garnet runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
