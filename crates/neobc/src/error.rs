//! Error types surfaced by the generator, the disassembler and unit serialization.
//!
//! Contract violations between the front end and the generator (an opcode with
//! no descriptor, a pending jump left unresolved) are panics, not variants here.

use std::fmt;

use crate::{bytecode::Opcode, types::ValueType};

/// Failure while generating code for one top-level unit.
///
/// The session abandons the failing method, rolls its code back and keeps going
/// with the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// A name that is not present in the symbol table or current scope.
    UnknownSymbol(String),
    /// An operator or builtin applied to operand types it has no lowering for.
    Unsupported { operation: String, operand: ValueType },
    /// An integer literal needing more than 32 bytes in two's complement.
    IntegerTooWide { bytes: usize },
    /// `break` or `continue` with no enclosing loop.
    OutsideLoop { statement: &'static str },
    /// An `end_X` call without the matching `begin_X`, or a method closed twice.
    Unbalanced { construct: &'static str },
    /// Error raised by the visitor while walking the unit.
    Semantic(String),
}

impl CompileError {
    pub(crate) fn unsupported(operation: impl Into<String>, operand: &ValueType) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            operand: operand.clone(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSymbol(name) => write!(f, "unknown symbol '{name}'"),
            Self::Unsupported { operation, operand } => {
                write!(f, "unsupported operation '{operation}' for type '{operand}'")
            }
            Self::IntegerTooWide { bytes } => {
                write!(f, "integer literal needs {bytes} bytes, the VM accepts at most 32")
            }
            Self::OutsideLoop { statement } => write!(f, "'{statement}' outside loop"),
            Self::Unbalanced { construct } => write!(f, "unbalanced '{construct}' construct"),
            Self::Semantic(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for CompileError {}

/// Malformed bytecode handed to the disassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnknownOpcode { address: u32, byte: u8 },
    /// The buffer ends inside an operand or data payload.
    Truncated { address: u32, opcode: Opcode },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode { address, byte } => {
                write!(f, "unknown opcode 0x{byte:02X} at address {address}")
            }
            Self::Truncated { address, opcode } => {
                write!(f, "truncated {opcode} operand at address {address}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Failure dumping or loading a [`CompiledUnit`](crate::CompiledUnit).
#[derive(Debug)]
pub struct SerializeError(postcard::Error);

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "compiled unit serialization failed: {}", self.0)
    }
}

impl std::error::Error for SerializeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl From<postcard::Error> for SerializeError {
    fn from(err: postcard::Error) -> Self {
        Self(err)
    }
}
