//! Bytecode representation
//!
//! Instructions are a closed set. Each one is an opcode byte followed by an
//! operand whose width depends on the opcode class:
//!
//! | Class  | Operand            | Opcodes |
//! |--------|--------------------|---------|
//! | none   | -                  | stack, arithmetic, comparison, `RETURN`, `HALT`, host calls |
//! | u32    | 4 bytes            | `PUSH_CONST`, `JUMP`, `JUMP_IF_FALSE`, `LOAD_GLOBAL`, `STORE_GLOBAL`, `GET_TRAIT` |
//! | u16    | 2 bytes            | `LOAD_LOCAL`, `STORE_LOCAL`, `CALL` |
//! | u32+f64| 4 + 8 bytes        | `SET_TRAIT` |
//!
//! All multi-byte operands are little-endian. Byte values not assigned below
//! form a reserved range and are rejected when an artifact is loaded.

use std::fmt::{self, Write};

use crate::error::{FormatError, Section};

macro_rules! opcodes {
    ($($name:ident = $byte:literal, $mnemonic:literal;)*) => {
        /// Opcode byte of every instruction
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
        pub enum Opcode {
            $($name = $byte,)*
        }

        impl Opcode {
            pub fn from_byte(byte: u8) -> Option<Self> {
                match byte {
                    $($byte => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }
        }
    };
}

opcodes! {
    Nop = 0x00, "NOP";
    PushConst = 0x01, "PUSH_CONST";
    PushNil = 0x02, "PUSH_NIL";
    PushTrue = 0x03, "PUSH_TRUE";
    PushFalse = 0x04, "PUSH_FALSE";
    Pop = 0x05, "POP";
    Dup = 0x06, "DUP";

    Add = 0x10, "ADD";
    Sub = 0x11, "SUB";
    Mul = 0x12, "MUL";
    Div = 0x13, "DIV";
    Mod = 0x14, "MOD";
    Neg = 0x15, "NEG";
    Not = 0x16, "NOT";
    Eq = 0x18, "EQ";
    Ne = 0x19, "NE";
    Lt = 0x1A, "LT";
    Le = 0x1B, "LE";
    Gt = 0x1C, "GT";
    Ge = 0x1D, "GE";

    Jump = 0x20, "JUMP";
    JumpIfFalse = 0x21, "JUMP_IF_FALSE";
    Call = 0x22, "CALL";
    Return = 0x23, "RETURN";
    Halt = 0x24, "HALT";

    LoadLocal = 0x30, "LOAD_LOCAL";
    StoreLocal = 0x31, "STORE_LOCAL";
    LoadGlobal = 0x32, "LOAD_GLOBAL";
    StoreGlobal = 0x33, "STORE_GLOBAL";

    SetTrait = 0x40, "SET_TRAIT";
    GetTrait = 0x41, "GET_TRAIT";
    KnowledgeQuery = 0x42, "KNOWLEDGE_QUERY";
    VoiceSay = 0x43, "VOICE_SAY";
    VoiceListen = 0x44, "VOICE_LISTEN";
    Print = 0x45, "PRINT";
}

/// Supported instructions of the bytecode
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    /// Pass
    Nop,
    /// Push the constant at the given pool index
    PushConst(u32),
    PushNil,
    PushTrue,
    PushFalse,
    /// Pop a value and discard it
    Pop,
    /// Duplicate the value on top of the stack
    Dup,
    Add,
    Sub,
    Mul,
    /// Divide, faulting on a zero divisor
    Div,
    Mod,
    Neg,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Unconditionally jump to an instruction index
    Jump(u32),
    /// Pop a value and jump if it is falsy
    JumpIfFalse(u32),
    /// Call the function sitting below `argc` arguments
    Call(u16),
    /// Return the value on top of the stack to the caller
    Return,
    /// Stop the program
    Halt,
    LoadLocal(u16),
    StoreLocal(u16),
    LoadGlobal(u32),
    StoreGlobal(u32),
    /// Set a trait of the personality vector. `name` is a string constant index.
    SetTrait { name: u32, value: f64 },
    /// Push a trait value. `name` is a string constant index.
    GetTrait(u32),
    /// Pop a query and push the host's answer
    KnowledgeQuery,
    /// Pop a text and speak it through the host
    VoiceSay,
    /// Push the text heard by the host
    VoiceListen,
    /// Pop a value and print it
    Print,
}

impl Instruction {
    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::Nop => Opcode::Nop,
            Instruction::PushConst(_) => Opcode::PushConst,
            Instruction::PushNil => Opcode::PushNil,
            Instruction::PushTrue => Opcode::PushTrue,
            Instruction::PushFalse => Opcode::PushFalse,
            Instruction::Pop => Opcode::Pop,
            Instruction::Dup => Opcode::Dup,
            Instruction::Add => Opcode::Add,
            Instruction::Sub => Opcode::Sub,
            Instruction::Mul => Opcode::Mul,
            Instruction::Div => Opcode::Div,
            Instruction::Mod => Opcode::Mod,
            Instruction::Neg => Opcode::Neg,
            Instruction::Not => Opcode::Not,
            Instruction::Eq => Opcode::Eq,
            Instruction::Ne => Opcode::Ne,
            Instruction::Lt => Opcode::Lt,
            Instruction::Le => Opcode::Le,
            Instruction::Gt => Opcode::Gt,
            Instruction::Ge => Opcode::Ge,
            Instruction::Jump(_) => Opcode::Jump,
            Instruction::JumpIfFalse(_) => Opcode::JumpIfFalse,
            Instruction::Call(_) => Opcode::Call,
            Instruction::Return => Opcode::Return,
            Instruction::Halt => Opcode::Halt,
            Instruction::LoadLocal(_) => Opcode::LoadLocal,
            Instruction::StoreLocal(_) => Opcode::StoreLocal,
            Instruction::LoadGlobal(_) => Opcode::LoadGlobal,
            Instruction::StoreGlobal(_) => Opcode::StoreGlobal,
            Instruction::SetTrait { .. } => Opcode::SetTrait,
            Instruction::GetTrait(_) => Opcode::GetTrait,
            Instruction::KnowledgeQuery => Opcode::KnowledgeQuery,
            Instruction::VoiceSay => Opcode::VoiceSay,
            Instruction::VoiceListen => Opcode::VoiceListen,
            Instruction::Print => Opcode::Print,
        }
    }

    /// Append the binary form of the instruction to `out`
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.opcode() as u8);
        match *self {
            Instruction::PushConst(operand)
            | Instruction::Jump(operand)
            | Instruction::JumpIfFalse(operand)
            | Instruction::LoadGlobal(operand)
            | Instruction::StoreGlobal(operand)
            | Instruction::GetTrait(operand) => out.extend_from_slice(&operand.to_le_bytes()),
            Instruction::Call(operand)
            | Instruction::LoadLocal(operand)
            | Instruction::StoreLocal(operand) => out.extend_from_slice(&operand.to_le_bytes()),
            Instruction::SetTrait { name, value } => {
                out.extend_from_slice(&name.to_le_bytes());
                out.extend_from_slice(&value.to_le_bytes());
            }
            _ => {}
        }
    }

    /// Decode a whole code section. Instructions may not straddle the end of it.
    pub fn decode_all(code: &[u8]) -> Result<Vec<Instruction>, FormatError> {
        let mut reader = ByteReader::new(code, Section::Code);
        let mut instructions = Vec::new();

        while !reader.is_empty() {
            let offset = reader.offset();
            let byte = reader.u8()?;
            let opcode = match Opcode::from_byte(byte) {
                Some(opcode) => opcode,
                None => return Err(FormatError::UnknownOpcode { opcode: byte, offset }),
            };

            let instruction = match opcode {
                Opcode::Nop => Instruction::Nop,
                Opcode::PushConst => Instruction::PushConst(reader.u32()?),
                Opcode::PushNil => Instruction::PushNil,
                Opcode::PushTrue => Instruction::PushTrue,
                Opcode::PushFalse => Instruction::PushFalse,
                Opcode::Pop => Instruction::Pop,
                Opcode::Dup => Instruction::Dup,
                Opcode::Add => Instruction::Add,
                Opcode::Sub => Instruction::Sub,
                Opcode::Mul => Instruction::Mul,
                Opcode::Div => Instruction::Div,
                Opcode::Mod => Instruction::Mod,
                Opcode::Neg => Instruction::Neg,
                Opcode::Not => Instruction::Not,
                Opcode::Eq => Instruction::Eq,
                Opcode::Ne => Instruction::Ne,
                Opcode::Lt => Instruction::Lt,
                Opcode::Le => Instruction::Le,
                Opcode::Gt => Instruction::Gt,
                Opcode::Ge => Instruction::Ge,
                Opcode::Jump => Instruction::Jump(reader.u32()?),
                Opcode::JumpIfFalse => Instruction::JumpIfFalse(reader.u32()?),
                Opcode::Call => Instruction::Call(reader.u16()?),
                Opcode::Return => Instruction::Return,
                Opcode::Halt => Instruction::Halt,
                Opcode::LoadLocal => Instruction::LoadLocal(reader.u16()?),
                Opcode::StoreLocal => Instruction::StoreLocal(reader.u16()?),
                Opcode::LoadGlobal => Instruction::LoadGlobal(reader.u32()?),
                Opcode::StoreGlobal => Instruction::StoreGlobal(reader.u32()?),
                Opcode::SetTrait => Instruction::SetTrait {
                    name: reader.u32()?,
                    value: reader.f64()?,
                },
                Opcode::GetTrait => Instruction::GetTrait(reader.u32()?),
                Opcode::KnowledgeQuery => Instruction::KnowledgeQuery,
                Opcode::VoiceSay => Instruction::VoiceSay,
                Opcode::VoiceListen => Instruction::VoiceListen,
                Opcode::Print => Instruction::Print,
            };
            instructions.push(instruction);
        }

        Ok(instructions)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mnemonic = self.opcode().mnemonic();
        match *self {
            Instruction::PushConst(operand)
            | Instruction::Jump(operand)
            | Instruction::JumpIfFalse(operand)
            | Instruction::LoadGlobal(operand)
            | Instruction::StoreGlobal(operand)
            | Instruction::GetTrait(operand) => write!(f, "{} {}", mnemonic, operand),
            Instruction::Call(operand)
            | Instruction::LoadLocal(operand)
            | Instruction::StoreLocal(operand) => write!(f, "{} {}", mnemonic, operand),
            Instruction::SetTrait { name, value } => write!(f, "{} {} {}", mnemonic, name, value),
            _ => f.write_str(mnemonic),
        }
    }
}

/// Entry of the constant pool
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Integer(i64),
    Float(f64),
    String(String),
    /// Index into the function table
    FunctionRef(u32),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Integer(value) => write!(f, "{}", value),
            Constant::Float(value) => write!(f, "{:?}", value),
            Constant::String(value) => write!(f, "{:?}", value),
            Constant::FunctionRef(index) => write!(f, "<fn #{}>", index),
        }
    }
}

/// Function attributes exported in the symbol section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    /// Name of the function
    pub name: String,
    /// Instruction index of the function's first instruction
    pub entry: u32,
    /// Number of parameters
    pub arity: u16,
    /// Number of local slots, parameters included
    pub locals: u16,
}

/// Output of the compiler and input of the VM
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompiledProgram {
    /// Array of instructions from top to bottom
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Constant>,
    /// Function table indexed by [`Constant::FunctionRef`]
    pub functions: Vec<FunctionSymbol>,
    /// Instruction index where execution starts
    pub entry_point: u32,
}

impl CompiledProgram {
    /// Look up an exported function by name
    pub fn function(&self, name: &str) -> Option<&FunctionSymbol> {
        self.functions.iter().find(|function| function.name == name)
    }

    /// Human-readable listing of the program
    pub fn disassemble(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "constants:");
        for (index, constant) in self.constants.iter().enumerate() {
            let _ = writeln!(out, "  #{:<4} {}", index, constant);
        }

        let _ = writeln!(out, "code:");
        for (index, instruction) in self.instructions.iter().enumerate() {
            for function in self.functions.iter().filter(|f| f.entry as usize == index) {
                let _ = writeln!(
                    out,
                    "{}: ; arity {}, locals {}",
                    function.name, function.arity, function.locals
                );
            }
            if index == self.entry_point as usize {
                let _ = writeln!(out, "ENTRY:");
            }

            let _ = write!(out, "  {:04} {}", index, instruction);
            match instruction {
                Instruction::PushConst(c)
                | Instruction::GetTrait(c)
                | Instruction::SetTrait { name: c, .. } => {
                    if let Some(constant) = self.constants.get(*c as usize) {
                        let _ = write!(out, "    ; {}", constant);
                    }
                }
                _ => {}
            }
            out.push('\n');
        }

        out
    }
}

/// Cursor over one section of an artifact
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    cursor: usize,
    section: Section,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(bytes: &'a [u8], section: Section) -> Self {
        ByteReader {
            bytes,
            cursor: 0,
            section,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.cursor >= self.bytes.len()
    }

    pub(crate) fn offset(&self) -> usize {
        self.cursor
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        let end = self.cursor.checked_add(len).filter(|end| *end <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.cursor..end];
                self.cursor = end;
                Ok(slice)
            }
            None => Err(FormatError::Truncated {
                section: self.section,
                offset: self.cursor,
            }),
        }
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], FormatError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, FormatError> {
        self.array().map(u16::from_le_bytes)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, FormatError> {
        self.array().map(u32::from_le_bytes)
    }

    pub(crate) fn i64(&mut self) -> Result<i64, FormatError> {
        self.array().map(i64::from_le_bytes)
    }

    pub(crate) fn f64(&mut self) -> Result<f64, FormatError> {
        self.array().map(f64::from_le_bytes)
    }

    pub(crate) fn string(&mut self, len: usize) -> Result<String, FormatError> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FormatError::InvalidUtf8(self.section))
    }
}
