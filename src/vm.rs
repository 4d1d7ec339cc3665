//! Virtual machine that runs the bytecode

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::bytecode::{CompiledProgram, Constant, Instruction};
use crate::config::VmConfig;
use crate::error::RuntimeFault;
use crate::host::{HostBridge, TraitVector};
use crate::value::Value;

type VResult<T = ()> = Result<T, RuntimeFault>;

/// Lifecycle of a VM instance. `Halted` and `Faulted` are terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum VmState {
    Loaded,
    Running,
    Halted,
    Faulted(RuntimeFault),
}

/// Outcome of [`Vm::execute`]
#[derive(Debug, Clone, PartialEq)]
pub enum ExitStatus {
    Success,
    Fault(RuntimeFault),
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }
}

/// Shared flag that aborts execution at the next instruction boundary
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Frame of a function call. Locals live on the operand stack at
/// `base..floor`; temporaries of the frame sit above `floor`.
#[derive(Debug)]
struct StackFrame {
    ret_addr: usize, // instruction to run after returning
    base: usize,     // stack index of local slot 0
    floor: usize,    // lowest stack index the frame may pop
}

/// Virtual machine representation
pub struct Vm<'h> {
    program: CompiledProgram,
    pc: usize, // program counter
    state: VmState,

    stack: Vec<Value>,          // the operand stack shared by all frames
    frames: Vec<StackFrame>,    // call frames, the top-level frame first
    globals: Vec<Option<Value>>,
    traits: TraitVector,
    output: Vec<String>,

    bridge: &'h mut dyn HostBridge,
    config: VmConfig,
    cancel: CancellationToken,
    executed: u64,
}

impl<'h> Vm<'h> {
    pub fn new(program: CompiledProgram, bridge: &'h mut dyn HostBridge) -> Self {
        Self::with_config(program, bridge, VmConfig::default())
    }

    pub fn with_config(
        program: CompiledProgram,
        bridge: &'h mut dyn HostBridge,
        config: VmConfig,
    ) -> Self {
        Vm {
            program,
            pc: 0,
            state: VmState::Loaded,
            stack: Vec::new(),
            frames: Vec::new(),
            globals: Vec::new(),
            traits: TraitVector::new(),
            output: Vec::new(),
            bridge,
            config,
            cancel: CancellationToken::new(),
            executed: 0,
        }
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> &VmState {
        &self.state
    }

    /// Lines written by `PRINT`
    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn into_output(self) -> Vec<String> {
        self.output
    }

    pub fn traits(&self) -> &TraitVector {
        &self.traits
    }

    /// Run until the program halts or faults. Calling it again after that
    /// returns the same status without executing anything.
    pub fn execute(&mut self) -> ExitStatus {
        loop {
            match &self.state {
                VmState::Halted => return ExitStatus::Success,
                VmState::Faulted(fault) => return ExitStatus::Fault(fault.clone()),
                VmState::Loaded | VmState::Running => {
                    let _ = self.step();
                }
            }
        }
    }

    /// Execute a single instruction, starting the program first if needed.
    pub fn step(&mut self) -> VResult {
        match &self.state {
            VmState::Loaded => self.start(),
            VmState::Running => {}
            VmState::Halted => return Ok(()),
            VmState::Faulted(fault) => return Err(fault.clone()),
        }

        if let Err(fault) = self.next_instruction() {
            warn!(pc = self.pc, %fault, "vm faulted");
            self.state = VmState::Faulted(fault.clone());
            return Err(fault);
        }
        Ok(())
    }

    fn start(&mut self) {
        debug!(
            entry_point = self.program.entry_point,
            instructions = self.program.instructions.len(),
            "starting program"
        );
        self.pc = self.program.entry_point as usize;
        self.frames.push(StackFrame {
            ret_addr: 0,
            base: 0,
            floor: 0,
        });
        self.state = VmState::Running;
    }

    fn next_instruction(&mut self) -> VResult {
        if self.cancel.is_cancelled() {
            return Err(RuntimeFault::Cancelled);
        }
        if let Some(limit) = self.config.max_instructions {
            if self.executed >= limit {
                return Err(RuntimeFault::InstructionLimitExceeded { limit });
            }
        }

        let instruction = match self.program.instructions.get(self.pc) {
            Some(instruction) => *instruction,
            None => return Err(RuntimeFault::ProgramCounterOutOfRange { pc: self.pc }),
        };
        trace!(pc = self.pc, %instruction, depth = self.stack.len());

        // Control-flow instructions overwrite the already advanced counter
        self.pc += 1;
        self.executed += 1;

        match instruction {
            Instruction::Nop => {}
            Instruction::PushConst(index) => self.ins_push_const(index)?,
            Instruction::PushNil => self.push_stack(Value::Nil)?,
            Instruction::PushTrue => self.push_stack(Value::Bool(true))?,
            Instruction::PushFalse => self.push_stack(Value::Bool(false))?,
            Instruction::Pop => {
                self.pop_stack()?;
            }
            Instruction::Dup => self.ins_dup()?,
            Instruction::Add => self.ins_add()?,
            Instruction::Sub => self.ins_arithmetic("-", i64::checked_sub, |a, b| a - b)?,
            Instruction::Mul => self.ins_arithmetic("*", i64::checked_mul, |a, b| a * b)?,
            Instruction::Div => self.ins_divide("/", i64::checked_div, |a, b| a / b)?,
            Instruction::Mod => self.ins_divide("%", i64::checked_rem, |a, b| a % b)?,
            Instruction::Neg => self.ins_neg()?,
            Instruction::Not => {
                let value = self.pop_stack()?;
                self.push_stack(Value::Bool(!value.is_truthy()))?;
            }
            Instruction::Eq => {
                let (lhs, rhs) = self.pop_pair()?;
                self.push_stack(Value::Bool(values_equal(&lhs, &rhs)))?;
            }
            Instruction::Ne => {
                let (lhs, rhs) = self.pop_pair()?;
                self.push_stack(Value::Bool(!values_equal(&lhs, &rhs)))?;
            }
            Instruction::Lt => self.ins_compare("<", |o| o.is_lt())?,
            Instruction::Le => self.ins_compare("<=", |o| o.is_le())?,
            Instruction::Gt => self.ins_compare(">", |o| o.is_gt())?,
            Instruction::Ge => self.ins_compare(">=", |o| o.is_ge())?,
            Instruction::Jump(target) => self.ins_jmp(target)?,
            Instruction::JumpIfFalse(target) => {
                if !self.pop_stack()?.is_truthy() {
                    self.ins_jmp(target)?;
                }
            }
            Instruction::Call(argc) => self.ins_call(argc)?,
            Instruction::Return => self.ins_ret()?,
            Instruction::Halt => {
                debug!(executed = self.executed, "program halted");
                self.state = VmState::Halted;
            }
            Instruction::LoadLocal(slot) => {
                let index = self.local_index(slot)?;
                let value = self.stack[index].clone();
                self.push_stack(value)?;
            }
            Instruction::StoreLocal(slot) => {
                let value = self.pop_stack()?;
                let index = self.local_index(slot)?;
                self.stack[index] = value;
            }
            Instruction::LoadGlobal(slot) => {
                let index = self.global_index(slot)?;
                let value = match self.globals.get(index) {
                    Some(Some(value)) => value.clone(),
                    _ => return Err(RuntimeFault::UninitializedGlobal { slot }),
                };
                self.push_stack(value)?;
            }
            Instruction::StoreGlobal(slot) => self.ins_store_global(slot)?,
            Instruction::SetTrait { name, value } => self.ins_set_trait(name, value)?,
            Instruction::GetTrait(name) => self.ins_get_trait(name)?,
            Instruction::KnowledgeQuery => self.ins_knowledge_query()?,
            Instruction::VoiceSay => self.ins_voice_say()?,
            Instruction::VoiceListen => self.ins_voice_listen()?,
            Instruction::Print => self.ins_print()?,
        };

        Ok(())
    }

    /// Push a constant of the pool
    fn ins_push_const(&mut self, index: u32) -> VResult {
        let value = match self.constant(index)? {
            Constant::Integer(n) => Value::Int(*n),
            Constant::Float(x) => Value::Float(*x),
            Constant::String(s) => Value::Str(s.clone()),
            Constant::FunctionRef(f) => Value::Function(*f),
        };
        self.push_stack(value)
    }

    fn ins_dup(&mut self) -> VResult {
        let value = match self.stack.last() {
            Some(value) if self.stack.len() > self.floor() => value.clone(),
            _ => return Err(RuntimeFault::StackUnderflow),
        };
        self.push_stack(value)
    }

    /// Add two numbers, or concatenate when either side is a string
    fn ins_add(&mut self) -> VResult {
        let (lhs, rhs) = self.pop_pair()?;
        let result = match (&lhs, &rhs) {
            (Value::Str(_), _) | (_, Value::Str(_)) => Value::Str(format!("{}{}", lhs, rhs)),
            _ => numeric_op("+", lhs, rhs, i64::checked_add, |a, b| a + b)?,
        };
        self.push_stack(result)
    }

    fn ins_arithmetic(
        &mut self,
        operation: &'static str,
        int_op: fn(i64, i64) -> Option<i64>,
        float_op: fn(f64, f64) -> f64,
    ) -> VResult {
        let (lhs, rhs) = self.pop_pair()?;
        let result = numeric_op(operation, lhs, rhs, int_op, float_op)?;
        self.push_stack(result)
    }

    /// Division and remainder fault on a zero divisor, integer or float
    fn ins_divide(
        &mut self,
        operation: &'static str,
        int_op: fn(i64, i64) -> Option<i64>,
        float_op: fn(f64, f64) -> f64,
    ) -> VResult {
        let (lhs, rhs) = self.pop_pair()?;
        match rhs {
            Value::Int(0) => return Err(RuntimeFault::DivisionByZero),
            Value::Float(x) if x == 0.0 => return Err(RuntimeFault::DivisionByZero),
            _ => {}
        }
        let result = numeric_op(operation, lhs, rhs, int_op, float_op)?;
        self.push_stack(result)
    }

    fn ins_neg(&mut self) -> VResult {
        let result = match self.pop_stack()? {
            Value::Int(n) => Value::Int(n.checked_neg().ok_or(RuntimeFault::IntegerOverflow)?),
            Value::Float(x) => Value::Float(-x),
            other => {
                return Err(RuntimeFault::TypeMismatch {
                    operation: "-",
                    found: other.type_name().to_string(),
                })
            }
        };
        self.push_stack(result)
    }

    /// Compare two numbers or two strings
    fn ins_compare(
        &mut self,
        operation: &'static str,
        accept: fn(std::cmp::Ordering) -> bool,
    ) -> VResult {
        let (lhs, rhs) = self.pop_pair()?;
        let ordering = match (&lhs, &rhs) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                as_f64(&lhs).partial_cmp(&as_f64(&rhs))
            }
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => {
                return Err(RuntimeFault::TypeMismatch {
                    operation,
                    found: format!("{} and {}", lhs.type_name(), rhs.type_name()),
                })
            }
        };
        // NaN compares false with everything
        let result = ordering.is_some_and(accept);
        self.push_stack(Value::Bool(result))
    }

    /// Jump to an instruction index
    fn ins_jmp(&mut self, target: u32) -> VResult {
        if target as usize >= self.program.instructions.len() {
            return Err(RuntimeFault::InvalidJumpTarget { target });
        }
        self.pc = target as usize;
        Ok(())
    }

    /// Call the function below the `argc` arguments on top of the stack
    fn ins_call(&mut self, argc: u16) -> VResult {
        let argc = argc as usize;
        if self.stack.len() < self.floor() + argc + 1 {
            return Err(RuntimeFault::StackUnderflow);
        }
        let callee_index = self.stack.len() - argc - 1;

        let function = match &self.stack[callee_index] {
            Value::Function(index) => self.program.functions.get(*index as usize),
            other => {
                return Err(RuntimeFault::NotCallable {
                    found: other.type_name().to_string(),
                })
            }
        };
        let function = match function {
            Some(function) => function,
            None => {
                return Err(RuntimeFault::NotCallable {
                    found: "unknown function".to_string(),
                })
            }
        };

        if function.arity as usize != argc {
            return Err(RuntimeFault::ArityMismatch {
                expected: function.arity as usize,
                found: argc,
            });
        }
        if self.frames.len() >= self.config.max_frames {
            return Err(RuntimeFault::CallDepthExceeded {
                limit: self.config.max_frames,
            });
        }
        if function.entry as usize >= self.program.instructions.len() {
            return Err(RuntimeFault::InvalidJumpTarget {
                target: function.entry,
            });
        }

        let entry = function.entry as usize;
        let extra_locals = (function.locals as usize).saturating_sub(argc);
        let base = callee_index + 1;
        for _ in 0..extra_locals {
            self.push_stack(Value::Nil)?;
        }

        self.frames.push(StackFrame {
            ret_addr: self.pc,
            base,
            floor: base + argc + extra_locals,
        });
        self.pc = entry;
        Ok(())
    }

    /// Return from the function with the value on top of the stack
    fn ins_ret(&mut self) -> VResult {
        let value = self.pop_stack()?;

        if self.frames.len() <= 1 {
            debug!(executed = self.executed, "returned from the top-level frame");
            self.state = VmState::Halted;
            return Ok(());
        }

        match self.frames.pop() {
            Some(frame) => {
                // Drop the callee along with its locals and temporaries
                self.stack.truncate(frame.base - 1);
                self.pc = frame.ret_addr;
                self.push_stack(value)
            }
            None => Err(RuntimeFault::StackUnderflow),
        }
    }

    fn ins_store_global(&mut self, slot: u32) -> VResult {
        let value = self.pop_stack()?;
        let index = self.global_index(slot)?;
        if index >= self.globals.len() {
            self.globals.resize(index + 1, None);
        }
        self.globals[index] = Some(value);
        Ok(())
    }

    /// Record a trait in the VM's own vector and notify the host.
    /// A host failure is fatal.
    fn ins_set_trait(&mut self, name: u32, value: f64) -> VResult {
        let name = self.string_constant(name)?;
        self.bridge
            .set_trait(&name, value)
            .map_err(RuntimeFault::HostError)?;
        self.traits.set(&name, value);
        Ok(())
    }

    /// Traits set by the program win; others are asked from the host
    fn ins_get_trait(&mut self, name: u32) -> VResult {
        let name = self.string_constant(name)?;
        let value = match self.traits.get(&name) {
            Some(value) => Value::Float(value),
            None => match self.bridge.get_trait(&name) {
                Ok(value) => Value::Float(value),
                Err(err) => {
                    warn!(trait_name = %name, %err, "trait lookup failed");
                    Value::Error(err.to_string())
                }
            },
        };
        self.push_stack(value)
    }

    fn ins_knowledge_query(&mut self) -> VResult {
        let query = self.pop_stack()?.to_string();
        let value = match self.bridge.query_knowledge(&query) {
            Ok(answer) => Value::Str(answer),
            Err(err) => {
                warn!(%query, %err, "knowledge query failed");
                Value::Error(err.to_string())
            }
        };
        self.push_stack(value)
    }

    fn ins_voice_say(&mut self) -> VResult {
        let text = self.pop_stack()?.to_string();
        self.bridge
            .speak(&text, &self.traits)
            .map_err(RuntimeFault::HostError)
    }

    fn ins_voice_listen(&mut self) -> VResult {
        let value = match self.bridge.listen() {
            Ok(heard) => Value::Str(heard),
            Err(err) => {
                warn!(%err, "listening failed");
                Value::Error(err.to_string())
            }
        };
        self.push_stack(value)
    }

    /// Pops a value and writes it to the output
    fn ins_print(&mut self) -> VResult {
        let line = self.pop_stack()?.to_string();
        if self.config.echo_output {
            println!("{}", line);
        }
        self.output.push(line);
        Ok(())
    }

    fn constant(&self, index: u32) -> VResult<&Constant> {
        self.program
            .constants
            .get(index as usize)
            .ok_or(RuntimeFault::InvalidConstant { index })
    }

    fn string_constant(&self, index: u32) -> VResult<String> {
        match self.constant(index)? {
            Constant::String(s) => Ok(s.clone()),
            _ => Err(RuntimeFault::InvalidConstant { index }),
        }
    }

    /// Stack index of a local slot of the current frame
    fn local_index(&self, slot: u16) -> VResult<usize> {
        match self.frames.last() {
            Some(frame) if frame.base + (slot as usize) < frame.floor => {
                Ok(frame.base + slot as usize)
            }
            _ => Err(RuntimeFault::InvalidLocal { slot }),
        }
    }

    /// Global slots share the stack limit, so a bad slot cannot allocate without bound
    fn global_index(&self, slot: u32) -> VResult<usize> {
        let index = slot as usize;
        if index >= self.config.max_stack {
            return Err(RuntimeFault::InvalidGlobal { slot });
        }
        Ok(index)
    }

    fn floor(&self) -> usize {
        self.frames.last().map_or(0, |frame| frame.floor)
    }

    /// Pop `rhs` then `lhs`; `lhs` is the value that was pushed first
    fn pop_pair(&mut self) -> VResult<(Value, Value)> {
        let rhs = self.pop_stack()?;
        let lhs = self.pop_stack()?;
        Ok((lhs, rhs))
    }

    fn pop_stack(&mut self) -> VResult<Value> {
        if self.stack.len() <= self.floor() {
            return Err(RuntimeFault::StackUnderflow);
        }
        self.stack.pop().ok_or(RuntimeFault::StackUnderflow)
    }

    fn push_stack(&mut self, value: Value) -> VResult {
        if self.stack.len() >= self.config.max_stack {
            return Err(RuntimeFault::StackOverflow {
                limit: self.config.max_stack,
            });
        }
        self.stack.push(value);
        Ok(())
    }
}

fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Int(n) => *n as f64,
        Value::Float(x) => *x,
        _ => f64::NAN,
    }
}

/// Integers stay integers unless either side is a float
fn numeric_op(
    operation: &'static str,
    lhs: Value,
    rhs: Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> VResult<Value> {
    match (&lhs, &rhs) {
        (Value::Int(a), Value::Int(b)) => int_op(*a, *b)
            .map(Value::Int)
            .ok_or(RuntimeFault::IntegerOverflow),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            Ok(Value::Float(float_op(as_f64(&lhs), as_f64(&rhs))))
        }
        _ => Err(RuntimeFault::TypeMismatch {
            operation,
            found: format!("{} and {}", lhs.type_name(), rhs.type_name()),
        }),
    }
}

/// Numbers compare by value across int and float; everything else structurally
fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
        _ => lhs == rhs,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::mem::discriminant;

    use super::*;
    use crate::bytecode::FunctionSymbol;
    use crate::host::HostError;

    #[derive(Default)]
    struct MockBridge {
        answers: HashMap<String, String>,
        heard: VecDeque<String>,
        host_traits: HashMap<String, f64>,
        spoken: Vec<(String, TraitVector)>,
        set_traits: Vec<(String, f64)>,
        fail_speak: bool,
        fail_set_trait: bool,
        cancel_on_query: Option<CancellationToken>,
    }

    impl HostBridge for MockBridge {
        fn query_knowledge(&mut self, text: &str) -> Result<String, HostError> {
            if let Some(token) = &self.cancel_on_query {
                token.cancel();
            }
            self.answers
                .get(text)
                .cloned()
                .ok_or_else(|| HostError::Unavailable("no answer".to_string()))
        }

        fn speak(&mut self, text: &str, traits: &TraitVector) -> Result<(), HostError> {
            if self.fail_speak {
                return Err(HostError::Failed("speaker offline".to_string()));
            }
            self.spoken.push((text.to_string(), traits.clone()));
            Ok(())
        }

        fn listen(&mut self) -> Result<String, HostError> {
            self.heard
                .pop_front()
                .ok_or_else(|| HostError::Unavailable("nothing heard".to_string()))
        }

        fn get_trait(&mut self, name: &str) -> Result<f64, HostError> {
            self.host_traits.get(name).copied().ok_or(HostError::Timeout)
        }

        fn set_trait(&mut self, name: &str, value: f64) -> Result<(), HostError> {
            if self.fail_set_trait {
                return Err(HostError::Failed("trait store is read-only".to_string()));
            }
            self.set_traits.push((name.to_string(), value));
            Ok(())
        }
    }

    fn run_with(
        source: &str,
        bridge: &mut MockBridge,
        config: VmConfig,
    ) -> (ExitStatus, Vec<String>) {
        let program = crate::compile_source(source).unwrap();
        let mut vm = Vm::with_config(program, bridge, config);
        let status = vm.execute();
        (status, vm.into_output())
    }

    fn run_source(source: &str) -> (ExitStatus, Vec<String>) {
        run_with(source, &mut MockBridge::default(), VmConfig::default())
    }

    fn program_of(instructions: Vec<Instruction>, constants: Vec<Constant>) -> CompiledProgram {
        CompiledProgram {
            instructions,
            constants,
            ..Default::default()
        }
    }

    fn run_until_instruction<'h>(
        program: CompiledProgram,
        bridge: &'h mut MockBridge,
        instruction: Instruction,
    ) -> Vm<'h> {
        let mut vm = Vm::new(program, bridge);
        loop {
            let next = vm.program.instructions[vm.pc];
            vm.step().unwrap();
            if discriminant(&next) == discriminant(&instruction) {
                return vm;
            }
            assert_eq!(vm.state, VmState::Running, "process is halted unexpectedly");
        }
    }

    #[test]
    fn load() {
        let program = program_of(
            vec![
                Instruction::PushConst(0),
                Instruction::PushConst(1),
                Instruction::Halt,
            ],
            vec![Constant::Integer(10), Constant::String("x".to_string())],
        );
        let mut bridge = MockBridge::default();
        let vm = run_until_instruction(program, &mut bridge, Instruction::PushConst(0));

        assert_eq!(vm.stack, [Value::Int(10)]);
        assert_eq!(vm.state, VmState::Running);
    }

    #[test]
    fn stepping_add() {
        let program = program_of(
            vec![
                Instruction::PushConst(0),
                Instruction::PushConst(1),
                Instruction::Add,
                Instruction::Halt,
            ],
            vec![Constant::Integer(6), Constant::Integer(4)],
        );
        let mut bridge = MockBridge::default();
        let mut vm = run_until_instruction(program, &mut bridge, Instruction::Add);
        assert_eq!(vm.stack, [Value::Int(10)]);

        vm.step().unwrap();
        assert_eq!(vm.state(), &VmState::Halted);
    }

    #[test]
    fn arithmetic() {
        let (status, output) = run_source(
            "let a = 6 let b = 4
             print(a + b) print(a * b) print(a - b) print(a / b) print(a % b)
             print(a / 4.0) print(-a)",
        );
        assert_eq!(status, ExitStatus::Success);
        assert_eq!(output, ["10", "24", "2", "1", "2", "1.5", "-6"]);
    }

    #[test]
    fn string_concatenation() {
        let (status, output) = run_source("let n = 2 print(\"n=\" + n) print(1.5 + n)");
        assert_eq!(status, ExitStatus::Success);
        assert_eq!(output, ["n=2", "3.5"]);
    }

    #[test]
    fn comparisons_and_logic() {
        let (status, output) = run_source(
            "let a = 3
             if a > 2 && a < 5 { print(\"in\") }
             if a == 3.0 { print(\"eq\") }
             if \"abc\" < \"abd\" { print(\"str\") }
             if !(a != 3) || false { print(\"not\") }
             if a >= 4 { print(\"never\") }",
        );
        assert_eq!(status, ExitStatus::Success);
        assert_eq!(output, ["in", "eq", "str", "not"]);
    }

    #[test]
    fn while_loop() {
        let (status, output) = run_source(
            "let n = 5
             let acc = 1
             while n > 1 {
                 acc = acc * n
                 n = n - 1
             }
             print(acc)",
        );
        assert_eq!(status, ExitStatus::Success);
        assert_eq!(output, ["120"]);
    }

    #[test]
    fn function_locals() {
        let (status, output) = run_source(
            "fn sum(a, b) { let c = a + b return c * 2 }
             print(sum(3, 4))
             print(sum(1, 1))",
        );
        assert_eq!(status, ExitStatus::Success);
        assert_eq!(output, ["14", "4"]);
    }

    #[test]
    fn recursion() {
        let (status, output) = run_source(
            "fn fib(n) {
                 if n < 2 { return n }
                 return fib(n - 1) + fib(n - 2)
             }
             print(fib(10))",
        );
        assert_eq!(status, ExitStatus::Success);
        assert_eq!(output, ["55"]);
    }

    #[test]
    fn division_by_zero_faults() {
        let (status, output) = run_source("print(\"start\") print(1 / 0) print(\"after\")");
        assert_eq!(status, ExitStatus::Fault(RuntimeFault::DivisionByZero));
        assert_eq!(output, ["start"]);

        let (status, _) = run_source("print(1.5 / 0.0)");
        assert_eq!(status, ExitStatus::Fault(RuntimeFault::DivisionByZero));

        let (status, _) = run_source("let z = 0 print(7 % z)");
        assert_eq!(status, ExitStatus::Fault(RuntimeFault::DivisionByZero));
    }

    #[test]
    fn integer_overflow_faults() {
        let (status, _) = run_source("let big = 9223372036854775807 print(big + 1)");
        assert_eq!(status, ExitStatus::Fault(RuntimeFault::IntegerOverflow));
    }

    #[test]
    fn type_mismatch() {
        let (status, _) = run_source("let a = nil print(a - 1)");
        assert_eq!(
            status,
            ExitStatus::Fault(RuntimeFault::TypeMismatch {
                operation: "-",
                found: "nil and int".to_string(),
            })
        );
    }

    #[test]
    fn not_callable() {
        let (status, _) = run_source("let x = 1 x()");
        assert_eq!(
            status,
            ExitStatus::Fault(RuntimeFault::NotCallable {
                found: "int".to_string()
            })
        );
    }

    #[test]
    fn uninitialized_global() {
        let (status, output) = run_source("fn show() { print(g) } show() let g = 1");
        assert_eq!(
            status,
            ExitStatus::Fault(RuntimeFault::UninitializedGlobal { slot: 0 })
        );
        assert!(output.is_empty());
    }

    #[test]
    fn call_depth_limit() {
        let config = VmConfig {
            max_frames: 8,
            ..VmConfig::default()
        };
        let (status, _) = run_with(
            "fn f() { return f() } f()",
            &mut MockBridge::default(),
            config,
        );
        assert_eq!(
            status,
            ExitStatus::Fault(RuntimeFault::CallDepthExceeded { limit: 8 })
        );
    }

    #[test]
    fn stack_limit() {
        let config = VmConfig {
            max_stack: 4,
            ..VmConfig::default()
        };
        let (status, _) = run_with(
            "let x = 5 print(1 + (2 + (3 + (4 + x))))",
            &mut MockBridge::default(),
            config,
        );
        assert_eq!(
            status,
            ExitStatus::Fault(RuntimeFault::StackOverflow { limit: 4 })
        );
    }

    #[test]
    fn instruction_limit() {
        let config = VmConfig {
            max_instructions: Some(100),
            ..VmConfig::default()
        };
        let (status, _) = run_with("while true { }", &mut MockBridge::default(), config);
        assert_eq!(
            status,
            ExitStatus::Fault(RuntimeFault::InstructionLimitExceeded { limit: 100 })
        );
    }

    #[test]
    fn malformed_programs_fault() {
        let mut bridge = MockBridge::default();

        let mut vm = Vm::new(program_of(vec![Instruction::Jump(99)], vec![]), &mut bridge);
        assert_eq!(
            vm.execute(),
            ExitStatus::Fault(RuntimeFault::InvalidJumpTarget { target: 99 })
        );

        let mut vm = Vm::new(
            program_of(vec![Instruction::Add, Instruction::Halt], vec![]),
            &mut bridge,
        );
        assert_eq!(vm.execute(), ExitStatus::Fault(RuntimeFault::StackUnderflow));

        let mut vm = Vm::new(program_of(vec![Instruction::Nop], vec![]), &mut bridge);
        assert_eq!(
            vm.execute(),
            ExitStatus::Fault(RuntimeFault::ProgramCounterOutOfRange { pc: 1 })
        );

        let mut vm = Vm::new(
            program_of(vec![Instruction::PushConst(3), Instruction::Halt], vec![]),
            &mut bridge,
        );
        assert_eq!(
            vm.execute(),
            ExitStatus::Fault(RuntimeFault::InvalidConstant { index: 3 })
        );
    }

    #[test]
    fn global_slots_out_of_range() {
        let mut bridge = MockBridge::default();

        let mut vm = Vm::new(
            program_of(vec![Instruction::LoadGlobal(u32::MAX), Instruction::Halt], vec![]),
            &mut bridge,
        );
        assert_eq!(
            vm.execute(),
            ExitStatus::Fault(RuntimeFault::InvalidGlobal { slot: u32::MAX })
        );

        let mut vm = Vm::new(
            program_of(
                vec![
                    Instruction::PushNil,
                    Instruction::StoreGlobal(u32::MAX),
                    Instruction::Halt,
                ],
                vec![],
            ),
            &mut bridge,
        );
        assert_eq!(
            vm.execute(),
            ExitStatus::Fault(RuntimeFault::InvalidGlobal { slot: u32::MAX })
        );

        let mut vm = Vm::new(
            program_of(vec![Instruction::LoadGlobal(7), Instruction::Halt], vec![]),
            &mut bridge,
        );
        assert_eq!(
            vm.execute(),
            ExitStatus::Fault(RuntimeFault::UninitializedGlobal { slot: 7 })
        );
    }

    #[test]
    fn float_output_keeps_fraction() {
        let (status, output) = run_source("let half = 2.5 print(half * 2) print(5.0) print(5)");
        assert_eq!(status, ExitStatus::Success);
        assert_eq!(output, ["5.0", "5.0", "5"]);
    }

    #[test]
    fn frame_cannot_pop_caller_values() {
        let program = CompiledProgram {
            instructions: vec![
                Instruction::PushConst(0),
                Instruction::Call(0),
                Instruction::Halt,
                Instruction::Pop,
                Instruction::Return,
            ],
            constants: vec![Constant::FunctionRef(0)],
            functions: vec![FunctionSymbol {
                name: "f".to_string(),
                entry: 3,
                arity: 0,
                locals: 0,
            }],
            entry_point: 0,
        };
        let mut bridge = MockBridge::default();
        let mut vm = Vm::new(program, &mut bridge);
        assert_eq!(vm.execute(), ExitStatus::Fault(RuntimeFault::StackUnderflow));
    }

    #[test]
    fn terminal_state_is_sticky() {
        let program = crate::compile_source("print(1 / 0)").unwrap();
        let mut bridge = MockBridge::default();
        let mut vm = Vm::new(program, &mut bridge);

        let first = vm.execute();
        assert_eq!(first, ExitStatus::Fault(RuntimeFault::DivisionByZero));
        assert_eq!(vm.execute(), first);
        assert_eq!(vm.step(), Err(RuntimeFault::DivisionByZero));

        let program = crate::compile_source("print(\"once\")").unwrap();
        let mut vm = Vm::new(program, &mut bridge);
        assert!(vm.execute().is_success());
        assert!(vm.execute().is_success());
        assert_eq!(vm.output(), ["once"]);
    }

    #[test]
    fn personality_traits() {
        let mut bridge = MockBridge::default();
        let program = crate::compile_source(
            "personality { warmth: 0.8, humor: 0.25 }
             print(trait(warmth))
             voice.say(\"hi\")",
        )
        .unwrap();
        let mut vm = Vm::new(program, &mut bridge);
        assert_eq!(vm.execute(), ExitStatus::Success);
        assert_eq!(vm.output(), ["0.8"]);
        assert_eq!(vm.traits().get("humor"), Some(0.25));
        drop(vm);

        assert_eq!(bridge.set_traits.len(), 2);
        assert_eq!(bridge.spoken.len(), 1);
        let (text, traits) = &bridge.spoken[0];
        assert_eq!(text, "hi");
        assert_eq!(traits.get("warmth"), Some(0.8));
    }

    #[test]
    fn trait_falls_back_to_host() {
        let mut bridge = MockBridge::default();
        bridge.host_traits.insert("humor".to_string(), 0.3);
        let (status, output) = run_with(
            "print(trait(humor))
             if trait(missing) { print(\"set\") } else { print(\"unset\") }",
            &mut bridge,
            VmConfig::default(),
        );
        assert_eq!(status, ExitStatus::Success);
        assert_eq!(output, ["0.3", "unset"]);
    }

    #[test]
    fn knowledge_query() {
        let mut bridge = MockBridge::default();
        bridge
            .answers
            .insert("capital of france".to_string(), "paris".to_string());
        let (status, output) = run_with(
            "print(knowledge(\"capital of france\"))",
            &mut bridge,
            VmConfig::default(),
        );
        assert_eq!(status, ExitStatus::Success);
        assert_eq!(output, ["paris"]);
    }

    #[test]
    fn knowledge_failure_is_a_value() {
        let (status, output) = run_source(
            "let r = knowledge(\"unknown\")
             if r { print(r) } else { print(\"fallback\") }
             print(\"done\")",
        );
        assert_eq!(status, ExitStatus::Success);
        assert_eq!(output, ["fallback", "done"]);
    }

    #[test]
    fn listen() {
        let mut bridge = MockBridge::default();
        bridge.heard.push_back("yes".to_string());
        let (status, output) = run_with(
            "print(voice.listen()) print(voice.listen())",
            &mut bridge,
            VmConfig::default(),
        );
        assert_eq!(status, ExitStatus::Success);
        assert_eq!(output, ["yes", "error: service unavailable: nothing heard"]);
    }

    #[test]
    fn speak_failure_faults() {
        let mut bridge = MockBridge {
            fail_speak: true,
            ..MockBridge::default()
        };
        let (status, output) = run_with(
            "print(\"before\") voice.say(\"hi\") print(\"after\")",
            &mut bridge,
            VmConfig::default(),
        );
        assert_eq!(
            status,
            ExitStatus::Fault(RuntimeFault::HostError(HostError::Failed(
                "speaker offline".to_string()
            )))
        );
        assert_eq!(output, ["before"]);
    }

    #[test]
    fn set_trait_failure_faults() {
        let mut bridge = MockBridge {
            fail_set_trait: true,
            ..MockBridge::default()
        };
        let program = crate::compile_source("personality { warmth: 0.5 } print(1)").unwrap();
        let mut vm = Vm::new(program, &mut bridge);
        assert!(matches!(
            vm.execute(),
            ExitStatus::Fault(RuntimeFault::HostError(_))
        ));
        assert!(vm.traits().is_empty());
        assert!(vm.output().is_empty());
    }

    #[test]
    fn cancelled_before_start() {
        let program = crate::compile_source("print(1)").unwrap();
        let mut bridge = MockBridge::default();
        let mut vm = Vm::new(program, &mut bridge);
        vm.cancellation_token().cancel();
        assert_eq!(vm.execute(), ExitStatus::Fault(RuntimeFault::Cancelled));
        assert!(vm.output().is_empty());
    }

    #[test]
    fn cancelled_at_next_instruction() {
        let token = CancellationToken::new();
        let mut bridge = MockBridge {
            cancel_on_query: Some(token.clone()),
            ..MockBridge::default()
        };
        let program =
            crate::compile_source("print(\"a\") let r = knowledge(\"q\") print(\"b\")").unwrap();
        let mut vm = Vm::new(program, &mut bridge).with_cancellation(token);
        assert_eq!(vm.execute(), ExitStatus::Fault(RuntimeFault::Cancelled));
        assert_eq!(vm.output(), ["a"]);
    }

    #[test]
    fn instances_are_independent() {
        let source = "personality { warmth: 0.9 } let n = 3 while n > 0 { print(n) n = n - 1 }";
        let program = crate::compile_source(source).unwrap();

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let program = program.clone();
                    scope.spawn(move || {
                        let mut bridge = MockBridge::default();
                        let mut vm = Vm::new(program, &mut bridge);
                        (vm.execute(), vm.into_output())
                    })
                })
                .collect();

            for handle in handles {
                let (status, output) = handle.join().unwrap();
                assert_eq!(status, ExitStatus::Success);
                assert_eq!(output, ["3", "2", "1"]);
            }
        });
    }
}
