//! The two fatal error taxonomies: compile-time and assemble-time errors
//! abort the compiler before a single instruction runs; `Fault` is raised
//! by the VM and converted into a stack trace by `main`.

use enumflags2::BitFlags;
use thiserror::Error;

use crate::value::TypeTag;

/// What went wrong while lexing, parsing, or resolving identifiers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileErrorKind {
    #[error("unexpected character {0:?}")]
    UnexpectedChar(char),
    #[error("unknown escape char '\\{0}'")]
    UnknownEscape(char),
    #[error("undefined identifier '{0}'")]
    UndefinedIdent(String),
    #[error("'{0}' is not callable")]
    NotCallable(String),
    #[error("'{0}' is not a value")]
    NotAValue(String),
    #[error("redefinition of '{0}'")]
    Redefinition(String),
    #[error("'{0}' called with {1} args, expected {2}")]
    Arity(String, usize, usize),
    #[error("cannot include '{0}': {1}")]
    UnresolvableInclude(String, String),
    #[error("cannot rebind reserved identifier '{0}'")]
    ReservedRebind(String),
    #[error("expected '{0}'")]
    Expected(String),
    #[error("Main must be a function returning a number")]
    MissingMain,
}

/// A compile-time error, tagged with the source location that produced it.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{module}:{line}: {kind}")]
pub struct CompileError {
    pub module: String,
    pub line: i64,
    pub kind: CompileErrorKind,
}

/// What went wrong while resolving the assembly-stub stream into a flat
/// instruction array.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssembleError {
    #[error("undefined label '{0}'")]
    UndefinedLabel(String),
    #[error("duplicate label '{0}'")]
    DuplicateLabel(String),
    #[error("unknown mnemonic '{0}'")]
    UnknownMnemonic(String),
    #[error("malformed numeric operand '{0}'")]
    MalformedOperand(String),
}

/// Runtime faults. Every one of these is terminal: the VM prints a stack
/// trace and the process exits with 0xFF.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Fault {
    #[error("stack underflow")]
    Underflow,
    #[error("type error: expected {expect:?}, got {got:?}")]
    TypeError {
        expect: BitFlags<TypeTag>,
        got: TypeTag,
    },
    #[error("type mismatch between {0:?} and {1:?}")]
    TypeMismatch(TypeTag, TypeTag),
    #[error("index {0} out of bounds")]
    IndexError(i64),
    #[error("bad slice bounds [{0}:{1}] over length {2}")]
    SliceError(i64, i64, usize),
    #[error("key '{0}' not found")]
    KeyError(String),
    #[error("cannot modify (=) const values")]
    ConstViolation,
    #[error("arity mismatch: called with {0} args, expected {1}")]
    Arity(i64, i64),
    #[error("illegal address {0}")]
    IllegalAddr(i64),
    #[error("illegal opcode {0}")]
    IllegalOpcode(u8),
    #[error("unresolved native symbol '{0}' in '{1}'")]
    NativeSymbol(String, String),
    #[error("native argument count {0} out of range 0..=9")]
    NativeArity(i64),
    #[error("assertion failed")]
    AssertFailed,
    #[error("unknown escape char '\\{0}'")]
    UnknownEscape(char),
    #[error("malformed literal '{0}'")]
    MalformedLiteral(String),
    #[error("unexpected whitespace in format string")]
    FormatWhitespace,
}

pub type CompileResult<T> = Result<T, CompileError>;
pub type AssembleResult<T> = Result<T, AssembleError>;
pub type RunResult<T> = Result<T, Fault>;
