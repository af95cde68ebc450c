//! A macro assembler and interpreter for a small register machine.
//!
//! Source goes through three stages: [`lexer::lex`], [`expand::Expander`]
//! and [`assembler::assemble`], producing a [`Program`] that a
//! [`Machine`] executes. The only conditional is the `then` predicate,
//! which makes the next instruction depend on the flag set by a comparison.

pub mod assembler;
pub mod error;
pub mod eval;
pub mod expand;
pub mod lexer;
pub mod sink;
pub mod syntax;

pub use crate::error::{CompileError, Error, Fault, RuntimeError};
pub use crate::eval::{Halt, Limits, Machine, Snapshot, Status};
pub use crate::expand::Expander;
pub use crate::sink::{DebugSink, WriterSink};
pub use crate::syntax::{Program, Reg, Word};

/// Compiles `source` with the prelude macros available.
pub fn compile(source: &str) -> Result<Program, CompileError> {
    compile_with(source, Expander::with_prelude()?)
}

pub fn compile_with(source: &str, mut expander: Expander) -> Result<Program, CompileError> {
    let tokens = lexer::lex(source)?;
    let tokens = expander.expand(tokens)?;
    assembler::assemble(&tokens)
}
