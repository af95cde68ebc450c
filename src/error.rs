use std::io;

use thiserror::Error;

use crate::eval::Snapshot;
use crate::syntax::Loc;

/// Errors from lexing, macro expansion or assembly. All of them are fatal to
/// compilation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("{loc}: {msg}")]
    Lex { loc: Loc, msg: String },
    #[error("{loc}: macro `{name}`: {msg}")]
    MacroArity { loc: Loc, name: String, msg: String },
    #[error("{loc}: expanding `{name}` exceeded the nesting limit of {limit}")]
    MacroRecursion { loc: Loc, name: String, limit: usize },
    #[error("{loc}: {msg}")]
    MacroSyntax { loc: Loc, msg: String },
    #[error("{loc}: label `{name}` is already defined at {first}")]
    DuplicateLabel { loc: Loc, name: String, first: Loc },
    #[error("{loc}: label `{name}` has no definition")]
    UnresolvedLabel { loc: Loc, name: String },
    #[error("{loc}: `{mnemonic}`: {msg}")]
    Operand { loc: Loc, mnemonic: String, msg: String },
    #[error("{loc}: unknown instruction `{mnemonic}`")]
    UnknownInstruction { loc: Loc, mnemonic: String },
    #[error("program has no `main` label")]
    MissingEntryPoint,
}

impl CompileError {
    pub fn loc(&self) -> Option<Loc> {
        match self {
            CompileError::Lex { loc, .. }
            | CompileError::MacroArity { loc, .. }
            | CompileError::MacroRecursion { loc, .. }
            | CompileError::MacroSyntax { loc, .. }
            | CompileError::DuplicateLabel { loc, .. }
            | CompileError::UnresolvedLabel { loc, .. }
            | CompileError::Operand { loc, .. }
            | CompileError::UnknownInstruction { loc, .. } => Some(*loc),
            CompileError::MissingEntryPoint => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("ret with an empty call stack")]
    CallStackUnderflow,
    #[error("call stack exceeded {limit} frames")]
    CallStackOverflow { limit: usize },
    #[error("pop from an empty data stack")]
    DataStackUnderflow,
    #[error("data stack exceeded {limit} values")]
    DataStackOverflow { limit: usize },
    #[error("division by zero")]
    DivisionByZero,
    #[error("step limit of {limit} reached")]
    StepLimitExceeded { limit: u64 },
}

/// A runtime error together with the machine state just before the failing
/// instruction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("execution error: {error}\n{state}")]
pub struct Fault {
    pub error: RuntimeError,
    pub state: Snapshot,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    IO(#[from] io::Error),
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Compile(#[from] CompileError),
    #[error("{0}")]
    Runtime(#[from] Fault),
}
