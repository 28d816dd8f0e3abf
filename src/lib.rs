// File: src/lib.rs
//
// Library interface for the Fun programming language: a small
// indentation-sensitive scripting language compiled to bytecode and run
// on a stack-based VM. Exposes every module for integration testing and
// external embedding.

pub mod array;
pub mod bytecode;
pub mod compiler;
pub mod debugger;
pub mod errors;
pub mod map;
pub mod repl;
pub mod strings;
pub mod value;
pub mod vm;
