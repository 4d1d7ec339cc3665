//! Error taxonomy of the compile pipeline and artifact loader.
//!
//! Every stage returns its own error type. [`NexusError`] unifies the
//! compile-time stages for callers that drive the whole pipeline, and
//! [`Diagnostic`] is the structured form handed to source loaders.

use serde::Serialize;
use thiserror::Error;

use crate::host::HostError;

/// Lexer failure kinds
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexErrorKind {
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid number literal '{0}'")]
    InvalidNumber(String),
    #[error("unknown character '{0}'")]
    UnknownChar(char),
    #[error("invalid escape sequence '\\{0}'")]
    InvalidEscape(char),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} at {line}:{column}")]
pub struct LexError {
    pub kind: LexErrorKind,
    pub line: usize,
    pub column: usize,
}

/// Parser failure kinds
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseErrorKind {
    #[error("unexpected {found}")]
    UnexpectedToken { found: String },
    #[error("trait '{name}' must be within [0, 1], got {value}")]
    TraitOutOfRange { name: String, value: f64 },
    #[error("trait '{0}' is declared twice")]
    DuplicateTrait(String),
    #[error("{0} declarations are only allowed at the top level")]
    NestedDeclaration(&'static str),
    #[error("integer literal {0} is out of range")]
    IntegerOutOfRange(String),
    #[error("nesting exceeds {limit} levels")]
    NestingTooDeep { limit: usize },
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} at {line}:{column}{}", expected_hint(.expected))]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub line: usize,
    pub column: usize,
    /// What the parser was looking for, if a specific token was expected.
    pub expected: Option<String>,
}

fn expected_hint(expected: &Option<String>) -> String {
    match expected {
        Some(expected) => format!(", expected {}", expected),
        None => String::new(),
    }
}

/// Compiler failure kinds
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileErrorKind {
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),
    #[error("function '{0}' is already defined")]
    DuplicateFunction(String),
    #[error("invalid assignment target")]
    InvalidAssignmentTarget,
    #[error("function '{name}' takes {expected} argument(s), {found} given")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("function '{0}' declares too many locals")]
    TooManyLocals(String),
    #[error("{what} of {length} bytes exceeds the {limit}-byte limit")]
    TooLong {
        what: &'static str,
        length: usize,
        limit: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} at {line}:{column}")]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub line: usize,
    pub column: usize,
}

/// Named sections of a `.nxb` artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Header,
    Code,
    Data,
    Symbols,
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Section::Header => "header",
            Section::Code => "code",
            Section::Data => "data",
            Section::Symbols => "symbol",
        })
    }
}

/// Artifact load failures. Always fatal to the load attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("artifact is {actual} bytes, shorter than the {expected}-byte header")]
    TruncatedHeader { expected: usize, actual: usize },
    #[error("bad magic number {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("unsupported format version {found}, expected {expected}")]
    UnsupportedVersion { found: u16, expected: u16 },
    #[error("{section} section declares {declared} bytes but {actual} are present")]
    SectionLengthMismatch {
        section: Section,
        declared: usize,
        actual: usize,
    },
    #[error("{section} section ends in the middle of an entry at offset {offset}")]
    Truncated { section: Section, offset: usize },
    #[error("unknown opcode 0x{opcode:02x} at code offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },
    #[error("unknown constant tag {tag} at data offset {offset}")]
    UnknownConstantTag { tag: u8, offset: usize },
    #[error("invalid UTF-8 in {0} section")]
    InvalidUtf8(Section),
    #[error("entry point {entry} is outside the {len} instruction(s) of the code section")]
    EntryPointOutOfRange { entry: u32, len: usize },
}

/// Runtime errors. Each one moves the VM into its terminal `Faulted` state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeFault {
    #[error("stack underflow")]
    StackUnderflow,
    #[error("stack overflow: more than {limit} values")]
    StackOverflow { limit: usize },
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("invalid jump target {target}")]
    InvalidJumpTarget { target: u32 },
    #[error("program counter {pc} is past the end of the code")]
    ProgramCounterOutOfRange { pc: usize },
    #[error("host error: {0}")]
    HostError(HostError),
    #[error("execution cancelled")]
    Cancelled,
    #[error("call depth exceeded {limit} frames")]
    CallDepthExceeded { limit: usize },
    #[error("instruction limit of {limit} reached")]
    InstructionLimitExceeded { limit: u64 },
    #[error("cannot apply {operation} to {found}")]
    TypeMismatch {
        operation: &'static str,
        found: String,
    },
    #[error("constant index {index} is out of range")]
    InvalidConstant { index: u32 },
    #[error("local slot {slot} is out of range")]
    InvalidLocal { slot: u16 },
    #[error("global slot {slot} read before assignment")]
    UninitializedGlobal { slot: u32 },
    #[error("global slot {slot} is out of range")]
    InvalidGlobal { slot: u32 },
    #[error("value of type {found} is not callable")]
    NotCallable { found: String },
    #[error("function takes {expected} argument(s), {found} given")]
    ArityMismatch { expected: usize, found: usize },
}

/// Environment configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid value '{value}' for {variable}")]
pub struct ConfigError {
    pub variable: &'static str,
    pub value: String,
}

/// Any failure of the source-to-artifact pipeline.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NexusError {
    #[error("lex error: {0}")]
    Lex(#[from] LexError),
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),
    #[error("format error: {0}")]
    Format(#[from] FormatError),
}

/// Structured diagnostic for editors and command-line front ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub kind: String,
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl NexusError {
    /// Convert into a diagnostic. Format errors carry no source position and report `0:0`.
    pub fn diagnostic(&self) -> Diagnostic {
        let (kind, message, line, column) = match self {
            NexusError::Lex(e) => ("LexError", e.kind.to_string(), e.line, e.column),
            NexusError::Parse(e) => {
                let message = match &e.expected {
                    Some(expected) => format!("{}, expected {}", e.kind, expected),
                    None => e.kind.to_string(),
                };
                ("ParseError", message, e.line, e.column)
            }
            NexusError::Compile(e) => ("CompileError", e.kind.to_string(), e.line, e.column),
            NexusError::Format(e) => ("FormatError", e.to_string(), 0, 0),
        };

        Diagnostic {
            kind: kind.to_string(),
            message,
            line,
            column,
        }
    }
}
