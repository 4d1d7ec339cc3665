//! `.nxb` binary artifact.
//!
//! ```text
//! offset 0:  magic "NXBN"
//! offset 4:  version (u16)
//! offset 6:  entry_point (u32, instruction index)
//! offset 10: code_len (u32)
//! offset 14: data_len (u32)
//! offset 18: symbol_len (u32)
//! offset 22: code | data | symbols
//! ```
//!
//! Integers are little-endian. The data section is a `u32` entry count
//! followed by tagged constants; the symbol section is a `u32` entry count
//! followed by `name, entry, arity, locals` records.

use tracing::debug;

use crate::bytecode::{ByteReader, CompiledProgram, Constant, FunctionSymbol, Instruction};
use crate::error::{FormatError, Section};

pub const MAGIC: [u8; 4] = *b"NXBN";
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 22;

const TAG_INTEGER: u8 = 0;
const TAG_FLOAT: u8 = 1;
const TAG_STRING: u8 = 2;
const TAG_FUNCTION_REF: u8 = 3;

/// Whether `bytes` starts like an artifact rather than source text
pub fn is_artifact(bytes: &[u8]) -> bool {
    bytes.starts_with(&MAGIC)
}

/// Pack a compiled program into an artifact. String constants and function
/// names must fit their u32 and u16 length prefixes, which `compile` enforces.
pub fn serialize(program: &CompiledProgram) -> Vec<u8> {
    let mut code = Vec::new();
    for instruction in &program.instructions {
        instruction.encode(&mut code);
    }

    let mut data = Vec::new();
    put_u32(&mut data, program.constants.len() as u32);
    for constant in &program.constants {
        match constant {
            Constant::Integer(n) => {
                data.push(TAG_INTEGER);
                data.extend_from_slice(&n.to_le_bytes());
            }
            Constant::Float(x) => {
                data.push(TAG_FLOAT);
                data.extend_from_slice(&x.to_le_bytes());
            }
            Constant::String(s) => {
                data.push(TAG_STRING);
                put_u32(&mut data, s.len() as u32);
                data.extend_from_slice(s.as_bytes());
            }
            Constant::FunctionRef(index) => {
                data.push(TAG_FUNCTION_REF);
                put_u32(&mut data, *index);
            }
        }
    }

    let mut symbols = Vec::new();
    put_u32(&mut symbols, program.functions.len() as u32);
    for function in &program.functions {
        symbols.extend_from_slice(&(function.name.len() as u16).to_le_bytes());
        symbols.extend_from_slice(function.name.as_bytes());
        put_u32(&mut symbols, function.entry);
        symbols.extend_from_slice(&function.arity.to_le_bytes());
        symbols.extend_from_slice(&function.locals.to_le_bytes());
    }

    let mut out = Vec::with_capacity(HEADER_LEN + code.len() + data.len() + symbols.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    put_u32(&mut out, program.entry_point);
    put_u32(&mut out, code.len() as u32);
    put_u32(&mut out, data.len() as u32);
    put_u32(&mut out, symbols.len() as u32);
    out.extend_from_slice(&code);
    out.extend_from_slice(&data);
    out.extend_from_slice(&symbols);

    debug!(
        bytes = out.len(),
        code = code.len(),
        data = data.len(),
        symbols = symbols.len(),
        "serialized artifact"
    );
    out
}

/// Validate an artifact and unpack it. Nothing is truncated or padded: any
/// disagreement between the header and the bytes present is an error.
pub fn deserialize(bytes: &[u8]) -> Result<CompiledProgram, FormatError> {
    if bytes.len() < HEADER_LEN {
        return Err(FormatError::TruncatedHeader {
            expected: HEADER_LEN,
            actual: bytes.len(),
        });
    }

    let mut header = ByteReader::new(&bytes[..HEADER_LEN], Section::Header);
    let magic = header.take(4)?;
    if magic != &MAGIC[..] {
        let mut found = [0u8; 4];
        found.copy_from_slice(magic);
        return Err(FormatError::BadMagic(found));
    }
    let version = header.u16()?;
    if version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion {
            found: version,
            expected: FORMAT_VERSION,
        });
    }
    let entry_point = header.u32()?;
    let code_len = header.u32()? as usize;
    let data_len = header.u32()? as usize;
    let symbol_len = header.u32()? as usize;

    // Split the body by the declared lengths before looking inside any section
    let mut body = &bytes[HEADER_LEN..];
    let code = split_section(&mut body, Section::Code, code_len)?;
    let data = split_section(&mut body, Section::Data, data_len)?;
    let symbols = split_section(&mut body, Section::Symbols, symbol_len)?;
    if !body.is_empty() {
        return Err(FormatError::SectionLengthMismatch {
            section: Section::Symbols,
            declared: symbol_len,
            actual: symbol_len + body.len(),
        });
    }

    let instructions = Instruction::decode_all(code)?;
    if entry_point as usize >= instructions.len() {
        return Err(FormatError::EntryPointOutOfRange {
            entry: entry_point,
            len: instructions.len(),
        });
    }

    let constants = decode_constants(data)?;
    let functions = decode_symbols(symbols)?;

    debug!(
        instructions = instructions.len(),
        constants = constants.len(),
        functions = functions.len(),
        "loaded artifact"
    );

    Ok(CompiledProgram {
        instructions,
        constants,
        functions,
        entry_point,
    })
}

fn split_section<'a>(
    body: &mut &'a [u8],
    section: Section,
    declared: usize,
) -> Result<&'a [u8], FormatError> {
    if declared > body.len() {
        return Err(FormatError::SectionLengthMismatch {
            section,
            declared,
            actual: body.len(),
        });
    }
    let (head, tail) = body.split_at(declared);
    *body = tail;
    Ok(head)
}

fn decode_constants(data: &[u8]) -> Result<Vec<Constant>, FormatError> {
    let mut reader = ByteReader::new(data, Section::Data);
    let count = reader.u32()?;
    let mut constants = Vec::new();

    for _ in 0..count {
        let offset = reader.offset();
        let constant = match reader.u8()? {
            TAG_INTEGER => Constant::Integer(reader.i64()?),
            TAG_FLOAT => Constant::Float(reader.f64()?),
            TAG_STRING => {
                let len = reader.u32()? as usize;
                Constant::String(reader.string(len)?)
            }
            TAG_FUNCTION_REF => Constant::FunctionRef(reader.u32()?),
            tag => return Err(FormatError::UnknownConstantTag { tag, offset }),
        };
        constants.push(constant);
    }

    expect_consumed(&reader, Section::Data, data.len())?;
    Ok(constants)
}

fn decode_symbols(symbols: &[u8]) -> Result<Vec<FunctionSymbol>, FormatError> {
    let mut reader = ByteReader::new(symbols, Section::Symbols);
    let count = reader.u32()?;
    let mut functions = Vec::new();

    for _ in 0..count {
        let name_len = reader.u16()? as usize;
        let name = reader.string(name_len)?;
        functions.push(FunctionSymbol {
            name,
            entry: reader.u32()?,
            arity: reader.u16()?,
            locals: reader.u16()?,
        });
    }

    expect_consumed(&reader, Section::Symbols, symbols.len())?;
    Ok(functions)
}

/// Entries must fill their section exactly
fn expect_consumed(
    reader: &ByteReader,
    section: Section,
    declared: usize,
) -> Result<(), FormatError> {
    if reader.is_empty() {
        Ok(())
    } else {
        Err(FormatError::SectionLengthMismatch {
            section,
            declared,
            actual: reader.offset(),
        })
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}
