//! Instruction model of the Neo virtual machine: opcodes, emitted instructions,
//! the re-addressable code map and a decoder for finished scripts.

mod code;
mod code_map;
pub mod disasm;
mod opcode;

pub use code::{CodeId, Target, VmCode};
pub use code_map::CodeMap;
pub use opcode::{Opcode, OpcodeInfo};

pub(crate) use code::offset_fits;
