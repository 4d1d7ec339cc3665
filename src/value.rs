//! Runtime values of the VM

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Index into the program's function table
    Function(u32),
    /// Marker pushed when a read-like host call fails, so programs can branch on it
    Error(String),
}

impl Value {
    /// `nil`, `false`, zero and host errors are falsy
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil | Value::Error(_) => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(_) | Value::Function(_) => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Function(_) => "function",
            Value::Error(_) => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            // Whole floats keep their fraction: `5.0`, not `5`
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Str(s) => f.write_str(s),
            Value::Function(index) => write!(f, "<fn #{}>", index),
            Value::Error(message) => write!(f, "error: {}", message),
        }
    }
}
