//! Decoder from a flat script back into address-indexed instructions.
//!
//! Relative offsets of control-transfer instructions are resolved to absolute
//! destinations, so a listing can be checked against the code map it came from.

use std::fmt::{self, Write as _};

use ahash::AHashSet;

use super::opcode::Opcode;
use crate::error::DecodeError;

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u32,
    pub opcode: Opcode,
    /// Operand bytes, excluding the length prefix of `PUSHDATA*`.
    pub operand: Vec<u8>,
    /// Absolute destination for jumps and calls.
    pub target: Option<u32>,
    /// Absolute `(except, finally)` entries of a `TRY`, `None` where the offset is zero.
    pub handlers: Option<(Option<u32>, Option<u32>)>,
}

impl Instruction {
    /// Encoded size in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        u32::try_from(self.opcode.encoded_size(self.operand.len())).unwrap_or(u32::MAX)
    }

    /// Every absolute address this instruction may transfer control to.
    pub fn destinations(&self) -> impl Iterator<Item = u32> + '_ {
        let (except, finally) = self.handlers.unwrap_or((None, None));
        self.target.into_iter().chain(except).chain(finally)
    }
}

/// Decodes `script` into instructions.
pub fn disassemble(script: &[u8]) -> Result<Vec<Instruction>, DecodeError> {
    let mut out = Vec::new();
    let mut cursor = 0usize;
    while cursor < script.len() {
        let address = to_address(cursor);
        let byte = script[cursor];
        let opcode = Opcode::try_from(byte).map_err(|byte| DecodeError::UnknownOpcode { address, byte })?;
        let info = opcode.info();
        cursor += 1;

        let truncated = DecodeError::Truncated { address, opcode };
        let operand_len = if info.size_prefix > 0 {
            let prefix = script.get(cursor..cursor + info.size_prefix).ok_or(truncated.clone())?;
            cursor += info.size_prefix;
            let mut le = [0u8; 4];
            le[..prefix.len()].copy_from_slice(prefix);
            u32::from_le_bytes(le) as usize
        } else {
            info.operand_size
        };
        let operand = script.get(cursor..cursor + operand_len).ok_or(truncated)?.to_vec();
        cursor += operand_len;

        let (target, handlers) = if !info.has_target {
            (None, None)
        } else if matches!(opcode, Opcode::Try | Opcode::TryL) {
            let half = operand.len() / 2;
            let except = absolute(address, read_offset(&operand[..half]));
            let finally = absolute(address, read_offset(&operand[half..]));
            (None, Some((except, finally)))
        } else {
            (Some(relative_to(address, read_offset(&operand))), None)
        };
        out.push(Instruction {
            address,
            opcode,
            operand,
            target,
            handlers,
        });
    }
    Ok(out)
}

fn to_address(cursor: usize) -> u32 {
    u32::try_from(cursor).unwrap_or(u32::MAX)
}

fn read_offset(bytes: &[u8]) -> i64 {
    match bytes.len() {
        1 => i64::from(i8::from_le_bytes([bytes[0]])),
        _ => i64::from(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
    }
}

fn relative_to(address: u32, offset: i64) -> u32 {
    u32::try_from(i64::from(address) + offset).unwrap_or(u32::MAX)
}

/// A zero offset in a `TRY` operand marks a missing handler.
fn absolute(address: u32, offset: i64) -> Option<u32> {
    (offset != 0).then(|| relative_to(address, offset))
}

/// Renders a decoded listing, marking every address some instruction jumps to.
#[must_use]
pub fn format_listing(instructions: &[Instruction]) -> String {
    let targets: AHashSet<u32> = instructions.iter().flat_map(Instruction::destinations).collect();
    let mut out = String::new();
    for instruction in instructions {
        let marker = if targets.contains(&instruction.address) { '►' } else { ' ' };
        // writing to a String cannot fail
        let _ = writeln!(out, "{:04} {marker} {instruction}", instruction.address);
    }
    out
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        if let Some(target) = self.target {
            return write!(f, " -> {target:04}");
        }
        if let Some((except, finally)) = self.handlers {
            let show = |slot: Option<u32>| slot.map_or_else(|| "-".to_owned(), |a| format!("{a:04}"));
            return write!(f, " except={} finally={}", show(except), show(finally));
        }
        if self.operand.is_empty() {
            return Ok(());
        }
        if self.opcode.info().size_prefix > 0
            && let Ok(text) = std::str::from_utf8(&self.operand)
            && text.chars().all(|c| !c.is_control())
        {
            return write!(f, " {text:?}");
        }
        f.write_str(" 0x")?;
        for byte in &self.operand {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
