//! Onyx - a small dynamically typed scripting language
//!
//! Source text is compiled in a single pass to bytecode and executed on a
//! stack-based virtual machine. The language has numbers, booleans,
//! `nil`, interned strings, and first-class functions with lexical
//! closures.
//!
//! Embedding is a three-call affair:
//!
//! ```
//! use onyx::Vm;
//!
//! let mut vm = Vm::new();
//! vm.interpret("print 1 + 2;").unwrap();
//! ```
//!
//! Hosts can expose their own functions with [`Vm::define_native`] and
//! redirect `print` output with [`Vm::with_output`].

pub mod chunk;
pub mod compiler;
pub mod debug;
pub mod object;
pub mod scanner;
pub mod table;
pub mod token;
pub mod value;
pub mod vm;

pub use object::NativeFn;
pub use value::Value;
pub use vm::{InterpretError, Vm};
