//! NexusLang is a small scripting language for conversational agents. Source
//! is compiled into stack-based bytecode, stored in `.nxb` artifacts and run
//! by a sandboxed VM that reaches AI services only through a [`HostBridge`].
//!
//! # Example
//!
//! ```text
//! personality {
//!     warmth: 0.8,
//!     humor: 0.4
//! }
//!
//! fn greet(name) {
//!     voice.say("hello " + name)
//!     return knowledge("weather today")
//! }
//!
//! let forecast = greet(voice.listen())
//! if forecast {
//!     print(forecast)
//! } else {
//!     print("no forecast")
//! }
//! ```
//!
//! # Instructions
//!
//! | Instruction   | Operand        | Brief   |
//! |---------------|----------------|---------|
//! | NOP           |                | Do nothing. |
//! | PUSH_CONST    | u32 index      | Push a constant of the data section. |
//! | PUSH_NIL      |                | Push `nil`. |
//! | PUSH_TRUE     |                | Push `true`. |
//! | PUSH_FALSE    |                | Push `false`. |
//! | POP           |                | Discard the top value. |
//! | DUP           |                | Duplicate the top value. |
//! | ADD           |                | Pop two values and push their sum. Strings concatenate. |
//! | SUB, MUL      |                | Pop two numbers and push the result. |
//! | DIV, MOD      |                | Same as above. Faults on a zero divisor. |
//! | NEG           |                | Negate a number. |
//! | NOT           |                | Push the inverse truthiness of the top value. |
//! | EQ, NE        |                | Compare any two values. |
//! | LT, LE, GT, GE|                | Compare two numbers or two strings. `lhs <op> rhs` where `lhs` is the first value that is pushed on stack. |
//! | JUMP          | u32 target     | Jump to an absolute instruction index. |
//! | JUMP_IF_FALSE | u32 target     | Pop a value and jump if it is falsy. |
//! | CALL          | u16 argc       | Call the function value below `argc` arguments. |
//! | RETURN        |                | Return the top value to the caller. Halts at the top level. |
//! | HALT          |                | Stop the program successfully. |
//! | LOAD_LOCAL    | u16 slot       | Push a local of the current frame. |
//! | STORE_LOCAL   | u16 slot       | Pop into a local of the current frame. |
//! | LOAD_GLOBAL   | u32 slot       | Push a global. Faults if it was never stored. |
//! | STORE_GLOBAL  | u32 slot       | Pop into a global. |
//! | SET_TRAIT     | u32 name, f64  | Set a personality trait and notify the host. |
//! | GET_TRAIT     | u32 name       | Push a trait, asking the host for traits the program did not set. |
//! | KNOWLEDGE_QUERY |              | Pop a query and push the host's answer. |
//! | VOICE_SAY     |                | Pop a value and speak it with the current traits. |
//! | VOICE_LISTEN  |                | Push the next utterance heard by the host. |
//! | PRINT         |                | Pop a value and append it to the output. |
//!
//! # Host failures
//!
//! `KNOWLEDGE_QUERY`, `VOICE_LISTEN` and `GET_TRAIT` push an error value when
//! the host fails. Error values are falsy, so programs can branch on them.
//! `VOICE_SAY` and `SET_TRAIT` fault the VM instead.
//!
//! # Important notes
//!
//! - Execution starts with the top-level statements. `main` is an ordinary
//!   function and runs only if the program calls it.
//! - Top-level `let` bindings are globals, visible in every function.
//! - Functions and `personality` blocks can only be declared at the top level.

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod config;
pub mod error;
pub mod format;
pub mod host;
pub mod lexer;
pub mod parser;
pub mod token;
pub mod value;
pub mod vm;

use tracing::debug;

pub use bytecode::{CompiledProgram, Constant, FunctionSymbol, Instruction, Opcode};
pub use config::VmConfig;
pub use error::{Diagnostic, FormatError, NexusError, RuntimeFault};
pub use host::{ConsoleBridge, HostBridge, HostError, TraitVector};
pub use value::Value;
pub use vm::{CancellationToken, ExitStatus, Vm, VmState};

/// Result of running an artifact to completion
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub status: ExitStatus,
    /// Lines written by `print`, including those before a fault
    pub output: Vec<String>,
}

/// Lex, parse and compile `source`
pub fn compile_source(source: &str) -> Result<CompiledProgram, NexusError> {
    let tokens = lexer::tokenize(source)?;
    let program = parser::parse(&tokens)?;
    let compiled = compiler::compile(&program)?;
    debug!(
        instructions = compiled.instructions.len(),
        constants = compiled.constants.len(),
        functions = compiled.functions.len(),
        "compiled source"
    );
    Ok(compiled)
}

/// Compile `source` into `.nxb` bytes
pub fn build(source: &str) -> Result<Vec<u8>, NexusError> {
    let program = compile_source(source)?;
    Ok(format::serialize(&program))
}

/// Load an artifact and run it with the default configuration
pub fn run(artifact: &[u8], bridge: &mut dyn HostBridge) -> Result<RunOutput, FormatError> {
    run_with_config(artifact, bridge, VmConfig::default())
}

pub fn run_with_config(
    artifact: &[u8],
    bridge: &mut dyn HostBridge,
    config: VmConfig,
) -> Result<RunOutput, FormatError> {
    let program = format::deserialize(artifact)?;
    let mut vm = Vm::with_config(program, bridge, config);
    let status = vm.execute();
    Ok(RunOutput {
        status,
        output: vm.into_output(),
    })
}
